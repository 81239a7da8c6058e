//! Mutable graph arena for flatbuffer-style inference models
//!
//! Mirrors the TFLite object model: subgraphs own tensors and operators,
//! tensors reference buffers by index, operators reference tensors by index.
//! A `-1` entry in an operator's input/output list marks an absent optional
//! slot (e.g. a fully-connected op without bias).

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tensor element types after quantization.
///
/// Sub-byte widths (int4) are stored as `Int8`, one value per byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TensorType {
    Float32,
    Int8,
    Int16,
    Int32,
    Int64,
}

impl TensorType {
    /// Size of one element in bytes.
    pub fn byte_width(&self) -> usize {
        match self {
            TensorType::Int8 => 1,
            TensorType::Int16 => 2,
            TensorType::Float32 | TensorType::Int32 => 4,
            TensorType::Int64 => 8,
        }
    }
}

/// Supported operator set.
///
/// Unknown operators are not representable: the materializer dispatches on a
/// closed enum instead of a runtime table lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpType {
    FullyConnected,
    #[serde(rename = "CONV_2D")]
    Conv2d,
    #[serde(rename = "DEPTHWISE_CONV_2D")]
    DepthwiseConv2d,
    BatchMatmul,
    EmbeddingLookup,
    Reshape,
    Transpose,
    #[serde(rename = "AVERAGE_POOL_2D")]
    AveragePool2d,
    Softmax,
    Tanh,
    Gelu,
    Add,
    Sub,
    Mul,
    Quantize,
    Dequantize,
}

impl std::fmt::Display for OpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Operator-specific options.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OpOptions {
    #[default]
    None,
    /// Transpose flags for batch matmul. `adj_y` means the right operand is
    /// pre-transposed, which moves its channel axis.
    BatchMatmul { adj_x: bool, adj_y: bool },
}

/// Raw backing storage for a tensor. An empty buffer means the tensor has no
/// constant data (i.e. it is an activation).
#[derive(Clone, Debug, Default)]
pub struct Buffer {
    pub data: Vec<u8>,
}

impl Buffer {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Uniform quantization metadata attached to a tensor.
#[derive(Clone, Debug, PartialEq)]
pub struct QuantizationMeta {
    pub scale: Vec<f32>,
    pub zero_point: Vec<i64>,
    /// Channel axis for per-channel quantization; `None` means per-tensor.
    pub quantized_dimension: Option<usize>,
}

#[derive(Clone, Debug)]
pub struct Tensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: TensorType,
    /// Index into the model's buffer arena.
    pub buffer: usize,
    pub quantization: Option<QuantizationMeta>,
}

impl Tensor {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, dtype: TensorType, buffer: usize) -> Self {
        Self {
            name: name.into(),
            shape,
            dtype,
            buffer,
            quantization: None,
        }
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }
}

#[derive(Clone, Debug)]
pub struct Operator {
    pub op: OpType,
    /// Tensor indices; `-1` marks an absent optional slot.
    pub inputs: Vec<i32>,
    pub outputs: Vec<i32>,
    pub options: OpOptions,
}

impl Operator {
    pub fn new(op: OpType, inputs: Vec<i32>, outputs: Vec<i32>) -> Self {
        Self {
            op,
            inputs,
            outputs,
            options: OpOptions::None,
        }
    }

    pub fn with_options(mut self, options: OpOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct Subgraph {
    pub tensors: Vec<Tensor>,
    pub operators: Vec<Operator>,
    /// Graph-level input/output tensor indices.
    pub inputs: Vec<i32>,
    pub outputs: Vec<i32>,
}

impl Subgraph {
    /// Append a tensor and return its index.
    pub fn add_tensor(&mut self, tensor: Tensor) -> usize {
        self.tensors.push(tensor);
        self.tensors.len() - 1
    }

    /// Index of the operator producing `tensor_id`, if any.
    pub fn producer(&self, tensor_id: usize) -> Option<usize> {
        self.operators
            .iter()
            .position(|op| op.outputs.contains(&(tensor_id as i32)))
    }

    /// Indices of all operators consuming `tensor_id`.
    pub fn consumers(&self, tensor_id: usize) -> Vec<usize> {
        self.operators
            .iter()
            .enumerate()
            .filter(|(_, op)| op.inputs.contains(&(tensor_id as i32)))
            .map(|(i, _)| i)
            .collect()
    }
}

#[derive(Clone, Debug, Default)]
pub struct Model {
    pub subgraphs: Vec<Subgraph>,
    pub buffers: Vec<Buffer>,
}

impl Model {
    /// Append a buffer and return its index.
    pub fn add_buffer(&mut self, buffer: Buffer) -> usize {
        self.buffers.push(buffer);
        self.buffers.len() - 1
    }
}

/// Decode a tensor's constant f32 data, or `None` for activations.
pub fn tensor_data(tensor: &Tensor, buffers: &[Buffer]) -> Result<Option<ArrayD<f32>>> {
    let buffer = &buffers[tensor.buffer];
    if buffer.is_empty() {
        return Ok(None);
    }
    if tensor.dtype != TensorType::Float32 {
        // Already-quantized constants are opaque to the engine.
        return Ok(None);
    }
    if buffer.data.len() != tensor.num_elements() * 4 {
        return Err(Error::Shape(format!(
            "buffer for tensor '{}' holds {} bytes, expected {} for shape {:?}",
            tensor.name,
            buffer.data.len(),
            tensor.num_elements() * 4,
            tensor.shape
        )));
    }
    let values: Vec<f32> = buffer
        .data
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    ArrayD::from_shape_vec(tensor.shape.clone(), values)
        .map(Some)
        .map_err(|e| Error::Shape(format!("tensor '{}': {e}", tensor.name)))
}

/// Encode f32 values as a little-endian constant buffer.
pub fn f32_buffer(values: &[f32]) -> Buffer {
    let mut data = Vec::with_capacity(values.len() * 4);
    for v in values {
        data.extend_from_slice(&v.to_le_bytes());
    }
    Buffer::new(data)
}

/// Parsed tensor slots of fully-connected, batch-matmul and convolution ops:
/// (input, weight, optional bias, output) tensor indices.
pub fn parse_fc_bmm_conv_tensors(op: &Operator) -> (usize, usize, Option<usize>, usize) {
    let input = op.inputs[0] as usize;
    let weight = op.inputs[1] as usize;
    let bias = match op.inputs.get(2) {
        Some(&idx) if idx >= 0 => Some(idx as usize),
        _ => None,
    };
    let output = op.outputs[0] as usize;
    (input, weight, bias, output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_op_subgraph() -> Subgraph {
        // t0 -> [op0] -> t1 -> [op1] -> t2
        Subgraph {
            tensors: vec![
                Tensor::new("in", vec![2], TensorType::Float32, 0),
                Tensor::new("mid", vec![2], TensorType::Float32, 0),
                Tensor::new("out", vec![2], TensorType::Float32, 0),
            ],
            operators: vec![
                Operator::new(OpType::Tanh, vec![0], vec![1]),
                Operator::new(OpType::Tanh, vec![1], vec![2]),
            ],
            inputs: vec![0],
            outputs: vec![2],
        }
    }

    #[test]
    fn test_producer_consumers() {
        let sg = two_op_subgraph();
        assert_eq!(sg.producer(1), Some(0));
        assert_eq!(sg.producer(0), None);
        assert_eq!(sg.consumers(1), vec![1]);
        assert!(sg.consumers(2).is_empty());
    }

    #[test]
    fn test_tensor_data_round_trip() {
        let buffers = vec![f32_buffer(&[1.0, -2.5, 3.0, 0.5])];
        let tensor = Tensor::new("w", vec![2, 2], TensorType::Float32, 0);
        let data = tensor_data(&tensor, &buffers).unwrap().unwrap();
        assert_eq!(data.shape(), &[2, 2]);
        assert_eq!(data[[0, 1]], -2.5);
    }

    #[test]
    fn test_tensor_data_activation_is_none() {
        let buffers = vec![Buffer::default()];
        let tensor = Tensor::new("act", vec![4], TensorType::Float32, 0);
        assert!(tensor_data(&tensor, &buffers).unwrap().is_none());
    }

    #[test]
    fn test_tensor_data_size_mismatch() {
        let buffers = vec![f32_buffer(&[1.0, 2.0])];
        let tensor = Tensor::new("w", vec![3], TensorType::Float32, 0);
        assert!(tensor_data(&tensor, &buffers).is_err());
    }

    #[test]
    fn test_parse_fc_tensors_without_bias() {
        let op = Operator::new(OpType::FullyConnected, vec![0, 1, -1], vec![2]);
        let (input, weight, bias, output) = parse_fc_bmm_conv_tensors(&op);
        assert_eq!((input, weight, output), (0, 1, 2));
        assert!(bias.is_none());
    }

    #[test]
    fn test_op_type_serde_names() {
        let json = serde_json::to_string(&OpType::FullyConnected).unwrap();
        assert_eq!(json, "\"FULLY_CONNECTED\"");
        let back: OpType = serde_json::from_str("\"AVERAGE_POOL_2D\"").unwrap();
        assert_eq!(back, OpType::AveragePool2d);
    }
}
