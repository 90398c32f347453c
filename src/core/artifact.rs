//! Purpose: Persist probe graphs as ONNX files.
//! Exports: `generate`, `generate_graph`, `read_graph`, `GeneratedArtifact`, `REFERENCE_FILE_NAME`.
//! Role: Write side of the artifact generator; the only place graph bytes touch disk.
//! Invariants: The parent directory must already exist; it is never created here.
//! Invariants: Writes go through a sibling temp file and a rename, so readers never see a partial file.
//! Invariants: Model files are world-readable (0644 on unix), like a plain file write under the usual umask.
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::core::error::{Error, ErrorKind, io_error};
use crate::core::graph::ComputationGraph;

pub const REFERENCE_FILE_NAME: &str = "mul.onnx";

#[cfg(unix)]
const MODEL_FILE_MODE: u32 = 0o644;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GeneratedArtifact {
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

pub fn generate(output_path: impl AsRef<Path>) -> Result<GeneratedArtifact, Error> {
    generate_graph(&ComputationGraph::reference(), output_path)
}

pub fn generate_graph(
    graph: &ComputationGraph,
    output_path: impl AsRef<Path>,
) -> Result<GeneratedArtifact, Error> {
    let path = output_path.as_ref();
    let parent = parent_dir(path)?;
    let bytes = graph.encode();

    let mut staged = NamedTempFile::with_prefix_in(".epkit-model-", parent).map_err(|err| {
        io_error(err, parent).with_message("failed to stage model file")
    })?;
    staged
        .write_all(&bytes)
        .and_then(|()| staged.as_file().sync_all())
        .map_err(|err| io_error(err, path).with_message("failed to write model file"))?;
    // Temp files are created 0600.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        staged
            .as_file()
            .set_permissions(std::fs::Permissions::from_mode(MODEL_FILE_MODE))
            .map_err(|err| io_error(err, path).with_message("failed to set model file permissions"))?;
    }
    staged.persist(path).map_err(|err| {
        io_error(err.error, path).with_message("failed to move model file into place")
    })?;

    tracing::debug!(path = %path.display(), bytes = bytes.len(), op = graph.op().op_type(), "wrote probe model");
    Ok(GeneratedArtifact {
        path: path.to_path_buf(),
        size: bytes.len() as u64,
        sha256: sha256_hex(&bytes),
    })
}

pub fn read_graph(path: impl AsRef<Path>) -> Result<ComputationGraph, Error> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => Error::new(ErrorKind::MissingFile)
            .with_message("model file does not exist")
            .with_path(path),
        _ => io_error(err, path).with_message("failed to read model file"),
    })?;
    ComputationGraph::decode(&bytes).map_err(|err| err.with_path(path))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn parent_dir(path: &Path) -> Result<&Path, Error> {
    let parent = match path.parent() {
        Some(parent) if parent.as_os_str().is_empty() => Path::new("."),
        Some(parent) => parent,
        None => {
            return Err(Error::new(ErrorKind::Io)
                .with_message("output path has no parent directory")
                .with_path(path));
        }
    };
    if !parent.is_dir() {
        return Err(Error::new(ErrorKind::Io)
            .with_message("output directory does not exist")
            .with_path(parent)
            .with_hint("Create the directory first; it is not created implicitly."));
    }
    Ok(parent)
}
