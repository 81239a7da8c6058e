//! Shared data model for the quantization pipeline
//!
//! These types flow between the recipe resolver, the tensor materializer and
//! the graph transformation engine: per-tensor quantization configs, resolved
//! uniform quantization parameters, and the per-tensor edit plan.

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::graph::{OpOptions, OpType};

/// Declared data kind for a quantized tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TensorDataType {
    #[default]
    Int,
    Float,
}

/// How the op executes after quantization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    /// Weights stored quantized, dequantized back to float before use.
    #[default]
    WeightOnly,
    /// Weights quantized ahead of time, activations converted at runtime.
    DynamicRange,
    /// Weights and activations quantized from calibrated ranges.
    StaticRange,
}

/// Precision of the op's accumulator arithmetic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComputePrecision {
    #[default]
    Float,
    Integer,
}

/// Quantization settings for one tensor class (activations or weights).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorQuantConfig {
    pub num_bits: usize,
    pub symmetric: bool,
    /// Per-channel quantization along the op's weight channel axis.
    pub channel_wise: bool,
    pub dtype: TensorDataType,
}

impl Default for TensorQuantConfig {
    fn default() -> Self {
        Self {
            num_bits: 8,
            symmetric: true,
            channel_wise: false,
            dtype: TensorDataType::Int,
        }
    }
}

/// Quantization settings for one operator instance.
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OpQuantConfig {
    /// Required for static-range execution, unused otherwise.
    pub activation_tensor_config: Option<TensorQuantConfig>,
    pub weight_tensor_config: TensorQuantConfig,
    pub execution_mode: ExecutionMode,
    pub compute_precision: ComputePrecision,
}

/// Graph edit required for one tensor from one op's perspective.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuantTransformation {
    /// Leave the tensor as-is.
    NoQuantize,
    /// Rewrite the tensor's buffer and metadata in place.
    QuantizeTensor,
    /// Insert a quantize node between the float producer and the consumer.
    AddQuantize,
    /// Insert a dequantize node between the quantized tensor and the consumer.
    AddDequantize,
}

/// Resolved uniform quantization parameters for a tensor.
///
/// `scale` and `zero_point` always share shape and rank. When
/// `quantized_dimension` is set, their rank equals the tensor rank with size
/// one on every axis except the quantized dimension.
#[derive(Clone, Debug, PartialEq)]
pub struct UniformQuantParams {
    pub scale: ArrayD<f32>,
    pub zero_point: ArrayD<i64>,
    pub num_bits: usize,
    pub symmetric: bool,
    pub quantized_dimension: Option<usize>,
    /// Materialized quantized values for constant tensors.
    pub quantized_data: Option<ArrayD<i64>>,
}

impl UniformQuantParams {
    /// Equality on the parameters themselves, ignoring materialized data.
    pub fn same_params(&self, other: &Self) -> bool {
        self.scale == other.scale
            && self.zero_point == other.zero_point
            && self.num_bits == other.num_bits
            && self.symmetric == other.symmetric
            && self.quantized_dimension == other.quantized_dimension
    }
}

/// One op's edit directive for a tensor it produces or consumes.
#[derive(Clone, Debug, PartialEq)]
pub struct OpToTensorParams {
    /// Index of the op in the subgraph's operator list.
    pub subgraph_op_id: usize,
    pub transformations: Vec<QuantTransformation>,
    pub parameters: Option<UniformQuantParams>,
}

/// Accumulated edit plan for one tensor: exactly one producer directive and
/// one consumer directive per consuming op.
#[derive(Clone, Debug, Default)]
pub struct TensorTransformationParams {
    pub tensor_name: String,
    pub producer: Option<OpToTensorParams>,
    pub consumers: Vec<OpToTensorParams>,
}

impl TensorTransformationParams {
    pub fn new(tensor_name: impl Into<String>) -> Self {
        Self {
            tensor_name: tensor_name.into(),
            producer: None,
            consumers: Vec::new(),
        }
    }
}

/// Result of applying one graph edit, used to keep subsequent index-dependent
/// edits correct as insertions shift operator positions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransformationInfo {
    /// Index of the node that now produces the edited value.
    pub op_id: usize,
    /// Number of operator nodes this edit inserted.
    pub num_ops_added: usize,
    /// Tensor holding the edited value afterwards.
    pub output_tensor_id: usize,
}

/// Aggregated information about one operator instance under quantization.
#[derive(Clone, Debug)]
pub struct OpInfo {
    pub subgraph_op_index: usize,
    pub op_name: OpType,
    pub options: OpOptions,
    pub op_quant_config: OpQuantConfig,
}
