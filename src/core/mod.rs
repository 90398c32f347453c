// Core modules: probe-model generation, explicit-path loading, packaging, and error modeling.
pub mod artifact;
pub mod error;
pub mod eval;
pub mod graph;
pub mod image;
pub mod loader;
pub mod onnx;
pub mod package;
pub mod resolver;
