//! Purpose: Immutable single-operator computation graph used as an execution-provider probe.
//! Exports: `ComputationGraph`, `TensorSpec`, `ElementType`, `BinaryOp`, reference constants.
//! Role: Domain model behind artifact generation; converts to and from ONNX `ModelProto`.
//! Invariants: Exactly two inputs and one output, all with the same static shape and type.
//! Invariants: Encoding is deterministic; identical graphs produce identical bytes.
use prost::Message;

use crate::core::error::{Error, ErrorKind};
use crate::core::eval::Tensor;
use crate::core::onnx::{
    GraphProto, ModelProto, NodeProto, OperatorSetIdProto, TensorShapeProto, TypeProto,
    ValueInfoProto, data_type, tensor_shape_proto, type_proto,
};

pub const REFERENCE_IR_VERSION: i64 = 8;
pub const REFERENCE_OPSET: i64 = 15;
pub const REFERENCE_SHAPE: [usize; 2] = [2, 3];
pub const PRODUCER_NAME: &str = "epkit";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ElementType {
    Float,
    Double,
    Int32,
    Int64,
}

impl ElementType {
    pub fn onnx_code(self) -> i32 {
        match self {
            ElementType::Float => data_type::FLOAT,
            ElementType::Double => data_type::DOUBLE,
            ElementType::Int32 => data_type::INT32,
            ElementType::Int64 => data_type::INT64,
        }
    }

    pub fn from_onnx_code(code: i32) -> Option<Self> {
        match code {
            data_type::FLOAT => Some(ElementType::Float),
            data_type::DOUBLE => Some(ElementType::Double),
            data_type::INT32 => Some(ElementType::Int32),
            data_type::INT64 => Some(ElementType::Int64),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BinaryOp {
    Mul,
    Add,
    Sub,
    Div,
}

impl BinaryOp {
    pub fn op_type(self) -> &'static str {
        match self {
            BinaryOp::Mul => "Mul",
            BinaryOp::Add => "Add",
            BinaryOp::Sub => "Sub",
            BinaryOp::Div => "Div",
        }
    }

    pub fn from_op_type(op_type: &str) -> Option<Self> {
        match op_type {
            "Mul" => Some(BinaryOp::Mul),
            "Add" => Some(BinaryOp::Add),
            "Sub" => Some(BinaryOp::Sub),
            "Div" => Some(BinaryOp::Div),
            _ => None,
        }
    }

    pub fn apply(self, lhs: f32, rhs: f32) -> f32 {
        match self {
            BinaryOp::Mul => lhs * rhs,
            BinaryOp::Add => lhs + rhs,
            BinaryOp::Sub => lhs - rhs,
            BinaryOp::Div => lhs / rhs,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TensorSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub elem_type: ElementType,
}

impl TensorSpec {
    fn new(name: &str, shape: &[usize], elem_type: ElementType) -> Self {
        Self {
            name: name.to_string(),
            shape: shape.to_vec(),
            elem_type,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ComputationGraph {
    name: String,
    op: BinaryOp,
    inputs: [TensorSpec; 2],
    output: TensorSpec,
    ir_version: i64,
    opset_version: i64,
}

impl ComputationGraph {
    /// The fixed probe: `output = x * y` over `FLOAT[2,3]`.
    pub fn reference() -> Self {
        Self {
            name: "mul".to_string(),
            op: BinaryOp::Mul,
            inputs: [
                TensorSpec::new("x", &REFERENCE_SHAPE, ElementType::Float),
                TensorSpec::new("y", &REFERENCE_SHAPE, ElementType::Float),
            ],
            output: TensorSpec::new("output", &REFERENCE_SHAPE, ElementType::Float),
            ir_version: REFERENCE_IR_VERSION,
            opset_version: REFERENCE_OPSET,
        }
    }

    pub fn binary(
        name: impl Into<String>,
        op: BinaryOp,
        shape: &[usize],
        elem_type: ElementType,
    ) -> Result<Self, Error> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::new(ErrorKind::Usage).with_message("graph name must not be empty"));
        }
        validate_shape(shape).map_err(|message| Error::new(ErrorKind::Usage).with_message(message))?;
        Ok(Self {
            name,
            op,
            inputs: [
                TensorSpec::new("x", shape, elem_type),
                TensorSpec::new("y", shape, elem_type),
            ],
            output: TensorSpec::new("output", shape, elem_type),
            ir_version: REFERENCE_IR_VERSION,
            opset_version: REFERENCE_OPSET,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op(&self) -> BinaryOp {
        self.op
    }

    pub fn inputs(&self) -> &[TensorSpec; 2] {
        &self.inputs
    }

    pub fn output(&self) -> &TensorSpec {
        &self.output
    }

    pub fn ir_version(&self) -> i64 {
        self.ir_version
    }

    pub fn opset_version(&self) -> i64 {
        self.opset_version
    }

    pub fn to_model_proto(&self) -> ModelProto {
        let node = NodeProto {
            input: self.inputs.iter().map(|spec| spec.name.clone()).collect(),
            output: vec![self.output.name.clone()],
            name: format!("{}_0", self.op.op_type().to_ascii_lowercase()),
            op_type: self.op.op_type().to_string(),
            domain: String::new(),
        };
        ModelProto {
            ir_version: self.ir_version,
            producer_name: PRODUCER_NAME.to_string(),
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
            domain: String::new(),
            model_version: 0,
            doc_string: String::new(),
            graph: Some(GraphProto {
                node: vec![node],
                name: self.name.clone(),
                doc_string: String::new(),
                input: self.inputs.iter().map(value_info).collect(),
                output: vec![value_info(&self.output)],
            }),
            opset_import: vec![OperatorSetIdProto {
                domain: String::new(),
                version: self.opset_version,
            }],
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_model_proto().encode_to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let model = ModelProto::decode(bytes).map_err(|err| {
            Error::new(ErrorKind::Corrupt)
                .with_message("not a valid ONNX model")
                .with_source(err)
        })?;
        Self::from_model_proto(&model)
    }

    pub fn from_model_proto(model: &ModelProto) -> Result<Self, Error> {
        let graph = model.graph.as_ref().ok_or_else(|| corrupt("model has no graph"))?;
        let [node] = graph.node.as_slice() else {
            return Err(corrupt(format!(
                "expected exactly one node, found {}",
                graph.node.len()
            )));
        };
        let op = BinaryOp::from_op_type(&node.op_type)
            .ok_or_else(|| corrupt(format!("unsupported operator {:?}", node.op_type)))?;
        if !node.domain.is_empty() {
            return Err(corrupt(format!("unsupported operator domain {:?}", node.domain)));
        }

        let [lhs, rhs] = graph.input.as_slice() else {
            return Err(corrupt(format!(
                "expected exactly two inputs, found {}",
                graph.input.len()
            )));
        };
        let [out] = graph.output.as_slice() else {
            return Err(corrupt(format!(
                "expected exactly one output, found {}",
                graph.output.len()
            )));
        };
        let inputs = [tensor_spec(lhs)?, tensor_spec(rhs)?];
        let output = tensor_spec(out)?;

        if inputs[0].shape != inputs[1].shape || inputs[0].shape != output.shape {
            return Err(corrupt("input and output shapes differ"));
        }
        if inputs[0].elem_type != inputs[1].elem_type || inputs[0].elem_type != output.elem_type {
            return Err(corrupt("input and output element types differ"));
        }
        if node.input != [inputs[0].name.clone(), inputs[1].name.clone()]
            || node.output != [output.name.clone()]
        {
            return Err(corrupt("node is not wired to the graph inputs and output"));
        }

        let opset_version = model
            .opset_import
            .iter()
            .find(|opset| opset.domain.is_empty() || opset.domain == "ai.onnx")
            .map(|opset| opset.version)
            .ok_or_else(|| corrupt("model does not import the default opset"))?;

        Ok(Self {
            name: graph.name.clone(),
            op,
            inputs,
            output,
            ir_version: model.ir_version,
            opset_version,
        })
    }

    /// Runs the single operator on `f32` data shaped like the graph inputs.
    pub fn evaluate(&self, lhs: &Tensor, rhs: &Tensor) -> Result<Tensor, Error> {
        if self.output.elem_type != ElementType::Float {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("reference evaluation only supports FLOAT graphs"));
        }
        for (spec, tensor) in self.inputs.iter().zip([lhs, rhs]) {
            if spec.shape != tensor.shape() {
                return Err(Error::new(ErrorKind::Usage).with_message(format!(
                    "input {:?} expects shape {:?}, got {:?}",
                    spec.name,
                    spec.shape,
                    tensor.shape()
                )));
            }
        }
        lhs.zip_with(rhs, |a, b| self.op.apply(a, b))
    }
}

fn corrupt(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::Corrupt).with_message(message)
}

fn validate_shape(shape: &[usize]) -> Result<(), String> {
    if shape.is_empty() {
        return Err("shape must have at least one dimension".to_string());
    }
    if shape.contains(&0) {
        return Err(format!("shape {shape:?} has a zero dimension"));
    }
    if shape.iter().any(|dim| i64::try_from(*dim).is_err()) {
        return Err(format!("shape {shape:?} does not fit ONNX int64 dimensions"));
    }
    Ok(())
}

fn value_info(spec: &TensorSpec) -> ValueInfoProto {
    let dim = spec
        .shape
        .iter()
        .map(|dim| tensor_shape_proto::Dimension {
            // validate_shape guarantees the conversion.
            value: Some(tensor_shape_proto::dimension::Value::DimValue(*dim as i64)),
        })
        .collect();
    ValueInfoProto {
        name: spec.name.clone(),
        r#type: Some(TypeProto {
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: spec.elem_type.onnx_code(),
                shape: Some(TensorShapeProto { dim }),
            })),
        }),
    }
}

fn tensor_spec(info: &ValueInfoProto) -> Result<TensorSpec, Error> {
    let Some(TypeProto {
        value: Some(type_proto::Value::TensorType(tensor)),
    }) = &info.r#type
    else {
        return Err(corrupt(format!("value {:?} is not a tensor", info.name)));
    };
    let elem_type = ElementType::from_onnx_code(tensor.elem_type).ok_or_else(|| {
        corrupt(format!(
            "value {:?} has unsupported element type {}",
            info.name, tensor.elem_type
        ))
    })?;
    let dims = tensor
        .shape
        .as_ref()
        .ok_or_else(|| corrupt(format!("value {:?} has no shape", info.name)))?;
    let mut shape = Vec::with_capacity(dims.dim.len());
    for dim in &dims.dim {
        match dim.value {
            Some(tensor_shape_proto::dimension::Value::DimValue(value)) if value > 0 => {
                shape.push(value as usize);
            }
            _ => {
                return Err(corrupt(format!(
                    "value {:?} has a dynamic or non-positive dimension",
                    info.name
                )));
            }
        }
    }
    if shape.is_empty() {
        return Err(corrupt(format!("value {:?} is a scalar", info.name)));
    }
    Ok(TensorSpec {
        name: info.name.clone(),
        shape,
        elem_type,
    })
}

#[cfg(test)]
mod tests {
    use super::{BinaryOp, ComputationGraph, ElementType, REFERENCE_SHAPE};
    use crate::core::error::ErrorKind;
    use crate::core::eval::Tensor;
    use crate::core::onnx::tensor_shape_proto::dimension::Value as DimValue;
    use crate::core::onnx::{type_proto, ModelProto};
    use prost::Message;

    #[test]
    fn reference_graph_decodes_to_fixed_shapes() {
        let bytes = ComputationGraph::reference().encode();
        let graph = ComputationGraph::decode(&bytes).expect("decode");

        assert_eq!(graph.op(), BinaryOp::Mul);
        assert_eq!(graph.inputs()[0].shape, REFERENCE_SHAPE);
        assert_eq!(graph.inputs()[1].shape, REFERENCE_SHAPE);
        assert_eq!(graph.output().shape, REFERENCE_SHAPE);
        assert_eq!(graph.output().elem_type, ElementType::Float);
        assert_eq!(graph, ComputationGraph::reference());
    }

    #[test]
    fn reference_graph_multiplies_elementwise() {
        let graph = ComputationGraph::decode(&ComputationGraph::reference().encode()).unwrap();
        let x = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let y = Tensor::new(vec![2, 3], vec![1.0; 6]).unwrap();

        let out = graph.evaluate(&x, &y).expect("evaluate");
        assert_eq!(out.shape(), &[2, 3]);
        assert_eq!(out.data(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn encoding_is_deterministic() {
        assert_eq!(
            ComputationGraph::reference().encode(),
            ComputationGraph::reference().encode()
        );
    }

    #[test]
    fn model_proto_carries_opset_and_wiring() {
        let model = ModelProto::decode(ComputationGraph::reference().encode().as_slice()).unwrap();
        assert_eq!(model.ir_version, 8);
        assert_eq!(model.opset_import.len(), 1);
        assert_eq!(model.opset_import[0].version, 15);

        let graph = model.graph.expect("graph");
        assert_eq!(graph.node[0].op_type, "Mul");
        assert_eq!(graph.node[0].input, ["x", "y"]);
        assert_eq!(graph.node[0].output, ["output"]);
        let Some(type_proto::Value::TensorType(tensor)) =
            graph.input[0].r#type.as_ref().and_then(|t| t.value.clone())
        else {
            panic!("tensor type");
        };
        assert_eq!(tensor.elem_type, 1);
        let dims: Vec<_> = tensor.shape.unwrap().dim.into_iter().map(|d| d.value).collect();
        assert_eq!(dims, [Some(DimValue::DimValue(2)), Some(DimValue::DimValue(3))]);
    }

    #[test]
    fn dynamic_dimension_is_rejected() {
        let mut model = ComputationGraph::reference().to_model_proto();
        let graph = model.graph.as_mut().unwrap();
        if let Some(type_proto::Value::TensorType(tensor)) =
            graph.input[1].r#type.as_mut().and_then(|t| t.value.as_mut())
        {
            tensor.shape.as_mut().unwrap().dim[0].value = Some(DimValue::DimParam("N".into()));
        }
        let err = ComputationGraph::from_model_proto(&model).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn extra_input_is_rejected() {
        let mut model = ComputationGraph::reference().to_model_proto();
        let graph = model.graph.as_mut().unwrap();
        let extra = graph.input[0].clone();
        graph.input.push(extra);
        let err = ComputationGraph::from_model_proto(&model).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert!(err.message().unwrap().contains("two inputs"));
    }

    #[test]
    fn garbage_bytes_are_corrupt() {
        let err = ComputationGraph::decode(b"\xff\xff\xff not a model").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn binary_rejects_zero_dimension() {
        let err = ComputationGraph::binary("bad", BinaryOp::Add, &[1, 0], ElementType::Float)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn evaluate_rejects_mismatched_input_shape() {
        let graph = ComputationGraph::binary("add", BinaryOp::Add, &[1, 3, 2], ElementType::Float)
            .unwrap();
        let x = Tensor::new(vec![2, 3], vec![0.0; 6]).unwrap();
        let err = graph.evaluate(&x, &x).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
}
