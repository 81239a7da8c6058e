//! Per-operator tensor materialization
//!
//! Given a resolved op quantization config and calibration statistics, this
//! module produces the quantization parameters and graph-edit directives for
//! every tensor an operator touches. Op-specific behavior is a closed match
//! over the operator enum: propagation constraints (reshape shares its
//! input's parameters), fused-bias handling for fully-connected/convolution,
//! and fixed output ranges for bounded activation functions.

use ndarray::{ArrayD, Axis};

use crate::error::{Error, Result};
use crate::graph::{tensor_data, Buffer, OpOptions, OpType, Subgraph, Tensor};
use crate::quant::calibration::{CalibrationStore, Qsv};
use crate::quant::codec;
use crate::quant::types::{
    ExecutionMode, OpInfo, OpQuantConfig, OpToTensorParams, QuantTransformation,
    TensorDataType, TensorQuantConfig, TensorTransformationParams, UniformQuantParams,
};

const SUPPORTED_WEIGHT_ONLY_OPS: &[OpType] = &[
    OpType::FullyConnected,
    OpType::Conv2d,
    OpType::BatchMatmul,
    OpType::EmbeddingLookup,
    OpType::DepthwiseConv2d,
];

const SUPPORTED_DRQ_OPS: &[OpType] = &[
    OpType::FullyConnected,
    OpType::Conv2d,
    OpType::BatchMatmul,
    OpType::EmbeddingLookup,
    OpType::DepthwiseConv2d,
];

const INT4_DRQ_OPS: &[OpType] = &[OpType::FullyConnected];

const SUPPORTED_SRQ_OPS: &[OpType] = &[
    OpType::FullyConnected,
    OpType::Conv2d,
    OpType::AveragePool2d,
    OpType::Reshape,
    OpType::Softmax,
    OpType::DepthwiseConv2d,
    OpType::Tanh,
    OpType::Transpose,
    OpType::Gelu,
    OpType::Add,
    OpType::Sub,
    OpType::Mul,
    OpType::BatchMatmul,
];

const INT4_SRQ_OPS: &[OpType] = &[OpType::FullyConnected, OpType::Conv2d, OpType::EmbeddingLookup];

/// Propagation constraint between an op's tensors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum OpQuantConstraint {
    #[default]
    NoConstrain,
    /// Every tensor shares the single input's scale (reshape, transpose).
    SameAsInputScale,
    /// Every tensor shares the single output's scale (concatenation-like).
    SameAsOutputScale,
}

/// Validate an op quantization config for weight-only execution.
pub fn check_weight_only_config(op: OpType, config: &OpQuantConfig) -> Result<()> {
    if !SUPPORTED_WEIGHT_ONLY_OPS.contains(&op) {
        return Err(Error::Config(format!(
            "unsupported op for weight-only quantization: {op}"
        )));
    }
    // Rejects widths with no integer storage type (0, 12, ...).
    codec::tensor_type_for_bits(config.weight_tensor_config.num_bits)?;
    Ok(())
}

/// Validate an op quantization config for dynamic-range execution.
pub fn check_drq_config(op: OpType, config: &OpQuantConfig) -> Result<()> {
    let weight = &config.weight_tensor_config;
    if !SUPPORTED_DRQ_OPS.contains(&op) {
        return Err(Error::Config(format!(
            "unsupported op for dynamic range quantization: {op}"
        )));
    }
    if !matches!(weight.num_bits, 4 | 8) || !weight.symmetric {
        return Err(Error::Config(format!(
            "only int4/int8 symmetric weights are supported for dynamic range quantization of {op}"
        )));
    }
    if weight.num_bits == 4 && !INT4_DRQ_OPS.contains(&op) {
        return Err(Error::Config(format!(
            "int4 dynamic range quantization is not supported for {op}"
        )));
    }
    Ok(())
}

/// Validate an op quantization config for static-range execution.
pub fn check_srq_config(op: OpType, config: &OpQuantConfig) -> Result<()> {
    if !SUPPORTED_SRQ_OPS.contains(&op) {
        return Err(Error::Config(format!(
            "unsupported op for static range quantization: {op}"
        )));
    }
    let activation = config.activation_tensor_config.ok_or_else(|| {
        Error::Config("activation_tensor_config is required for static range quantization".into())
    })?;
    if activation.dtype != TensorDataType::Int {
        return Err(Error::Config(
            "static range quantization requires integer activation tensors".into(),
        ));
    }
    if !matches!(activation.num_bits, 8 | 16) {
        return Err(Error::Config(format!(
            "only int8/int16 activations are supported for static range quantization of {op}"
        )));
    }
    if activation.num_bits == 16 && !activation.symmetric {
        return Err(Error::Config(
            "int16 activations require symmetric quantization".into(),
        ));
    }
    let weight = &config.weight_tensor_config;
    if !matches!(weight.num_bits, 4 | 8) || !weight.symmetric {
        return Err(Error::Config(format!(
            "only int4/int8 symmetric weights are supported for static range quantization of {op}"
        )));
    }
    if weight.num_bits == 4 && !INT4_SRQ_OPS.contains(&op) {
        return Err(Error::Config(format!(
            "int4 weight static range quantization is not supported for {op}"
        )));
    }
    Ok(())
}

/// Validate an op quantization config against its execution mode.
pub fn check_op_quant_config(op: OpType, config: &OpQuantConfig) -> Result<()> {
    match config.execution_mode {
        ExecutionMode::WeightOnly => check_weight_only_config(op, config),
        ExecutionMode::DynamicRange => check_drq_config(op, config),
        ExecutionMode::StaticRange => check_srq_config(op, config),
    }
}

/// Channel axis for an op's weight tensor. Batch matmul depends on whether
/// its right operand is pre-transposed.
fn weight_quantized_dim(op: OpType, options: OpOptions, weight_rank: usize) -> Option<usize> {
    match op {
        OpType::FullyConnected | OpType::Conv2d | OpType::EmbeddingLookup => Some(0),
        OpType::DepthwiseConv2d => Some(3),
        OpType::BatchMatmul => {
            let adj_y = matches!(options, OpOptions::BatchMatmul { adj_y: true, .. });
            if adj_y {
                Some(weight_rank.saturating_sub(2))
            } else {
                Some(weight_rank.saturating_sub(1))
            }
        }
        _ => None,
    }
}

/// Elementwise min/max reduced over every axis except the quantized
/// dimension, ranks preserved (size-1 reduced axes).
fn reduce_min_max_keepdims(
    data: &ArrayD<f32>,
    quantized_dim: Option<usize>,
) -> (ArrayD<f32>, ArrayD<f32>) {
    let mut min = data.clone();
    let mut max = data.clone();
    for axis in (0..data.ndim()).rev() {
        if Some(axis) == quantized_dim {
            continue;
        }
        min = min
            .map_axis(Axis(axis), |lane| {
                lane.iter().cloned().fold(f32::INFINITY, f32::min)
            })
            .insert_axis(Axis(axis));
        max = max
            .map_axis(Axis(axis), |lane| {
                lane.iter().cloned().fold(f32::NEG_INFINITY, f32::max)
            })
            .insert_axis(Axis(axis));
    }
    (min, max)
}

/// Initial min/max for a tensor: exact (possibly per-channel) statistics for
/// constants, the broadcast activation default otherwise.
pub fn init_tensor_min_max(
    tensor: &Tensor,
    buffers: &[Buffer],
    op_info: &OpInfo,
) -> Result<Qsv> {
    match tensor_data(tensor, buffers)? {
        None => Ok(Qsv::activation_default(tensor.shape.len())),
        Some(data) => {
            let quantized_dim = if op_info.op_quant_config.weight_tensor_config.channel_wise {
                weight_quantized_dim(op_info.op_name, op_info.options, tensor.shape.len())
            } else {
                None
            };
            let (min, max) = reduce_min_max_keepdims(&data, quantized_dim);
            Ok(Qsv::new(min, max))
        }
    }
}

/// Resolve scale/zero-point (and quantized data for constants) for a tensor.
fn get_tensor_quant_params(
    op_info: &OpInfo,
    qsv: &Qsv,
    tensor_quant_config: &TensorQuantConfig,
    tensor_rank: usize,
    tensor_content: Option<&ArrayD<f32>>,
) -> Result<UniformQuantParams> {
    let (zero_point, scale) = codec::zero_point_scale_from_min_max(
        &qsv.min,
        &qsv.max,
        tensor_quant_config.num_bits,
        tensor_quant_config.symmetric,
    )?;
    let quantized_dimension = if tensor_quant_config.channel_wise {
        weight_quantized_dim(op_info.op_name, op_info.options, tensor_rank)
    } else {
        None
    };
    let mut params = UniformQuantParams {
        scale,
        zero_point,
        num_bits: tensor_quant_config.num_bits,
        symmetric: tensor_quant_config.symmetric,
        quantized_dimension,
        quantized_data: None,
    };
    if let Some(content) = tensor_content {
        params.quantized_data = Some(codec::uniform_quantize(content, &params)?);
    }
    Ok(params)
}

/// Transform sequence for a tensor from (execution mode, direction, kind).
pub fn get_tensor_transformations(
    config: &OpQuantConfig,
    is_inbound: bool,
    is_constant: bool,
) -> Vec<QuantTransformation> {
    match config.execution_mode {
        ExecutionMode::StaticRange => {
            if is_inbound {
                if is_constant {
                    // Quantize constants directly to simplify downstream
                    // optimizations.
                    vec![QuantTransformation::QuantizeTensor]
                } else {
                    vec![QuantTransformation::AddQuantize]
                }
            } else {
                vec![QuantTransformation::AddDequantize]
            }
        }
        ExecutionMode::DynamicRange => {
            if is_inbound && is_constant {
                vec![QuantTransformation::QuantizeTensor]
            } else {
                vec![QuantTransformation::NoQuantize]
            }
        }
        ExecutionMode::WeightOnly => {
            if is_inbound && is_constant {
                // AddDequantize always carries quantization parameters, so a
                // single AddDequantize covers quantize-then-dequantize.
                vec![QuantTransformation::AddDequantize]
            } else {
                vec![QuantTransformation::NoQuantize]
            }
        }
    }
}

/// Wrap resolved parameters into a producer or consumer edit for the op.
pub fn get_tensor_transformation_params(
    tensor_name: &str,
    op_info: &OpInfo,
    is_inbound: bool,
    quant_params: Option<UniformQuantParams>,
    is_constant: bool,
) -> TensorTransformationParams {
    let transformations =
        get_tensor_transformations(&op_info.op_quant_config, is_inbound, is_constant);
    let edit = OpToTensorParams {
        subgraph_op_id: op_info.subgraph_op_index,
        transformations,
        parameters: quant_params,
    };
    let mut params = TensorTransformationParams::new(tensor_name);
    if is_inbound {
        params.consumers.push(edit);
    } else {
        params.producer = Some(edit);
    }
    params
}

/// Resolve parameters and the edit directive for one tensor of the op.
fn tensor_params_wrapper(
    tensor: &Tensor,
    is_inbound: bool,
    op_info: &OpInfo,
    buffers: &[Buffer],
    store: &mut CalibrationStore,
    quant_params: Option<UniformQuantParams>,
) -> Result<TensorTransformationParams> {
    let content = tensor_data(tensor, buffers)?;
    let is_constant = content.is_some();
    // Constants take the weight configuration when the op has a weight path.
    let tensor_quant_config = if is_constant
        && (SUPPORTED_WEIGHT_ONLY_OPS.contains(&op_info.op_name)
            || SUPPORTED_DRQ_OPS.contains(&op_info.op_name))
    {
        Some(op_info.op_quant_config.weight_tensor_config)
    } else {
        op_info.op_quant_config.activation_tensor_config
    };

    let quant_params = match (quant_params, tensor_quant_config) {
        (Some(params), _) => Some(params),
        (None, None) => None,
        (None, Some(config)) => {
            let qsv = if store.contains(&tensor.name) {
                store.lookup(&tensor.name)?.clone()
            } else if is_constant {
                // Weight-only and dynamic-range runs skip calibration, so
                // constant statistics are collected on the spot.
                init_tensor_min_max(tensor, buffers, op_info)?
            } else {
                return Err(Error::MissingStatistics(tensor.name.clone()));
            };
            Some(get_tensor_quant_params(
                op_info,
                &qsv,
                &config,
                tensor.shape.len(),
                content.as_ref(),
            )?)
        }
    };
    Ok(get_tensor_transformation_params(
        &tensor.name,
        op_info,
        is_inbound,
        quant_params,
        is_constant,
    ))
}

/// Active (non-ignored, present) tensor ids on one side of an op.
fn active_tensors(slots: &[i32], ignore: &[usize]) -> Vec<usize> {
    slots
        .iter()
        .enumerate()
        .filter(|(i, &idx)| idx >= 0 && !ignore.contains(i))
        .map(|(_, &idx)| idx as usize)
        .collect()
}

/// Default materialization for an op without fused bias.
///
/// Returned entries are ordered inputs first, then outputs.
pub fn materialize_standard_op(
    op_info: &OpInfo,
    subgraph: &Subgraph,
    buffers: &[Buffer],
    store: &mut CalibrationStore,
    constraint: OpQuantConstraint,
    inputs_to_ignore: &[usize],
    outputs_to_ignore: &[usize],
) -> Result<Vec<TensorTransformationParams>> {
    let op = &subgraph.operators[op_info.subgraph_op_index];
    let input_ids = active_tensors(&op.inputs, inputs_to_ignore);
    let output_ids = active_tensors(&op.outputs, outputs_to_ignore);

    match constraint {
        OpQuantConstraint::NoConstrain => {
            let mut result = Vec::with_capacity(input_ids.len() + output_ids.len());
            for &id in &input_ids {
                result.push(tensor_params_wrapper(
                    &subgraph.tensors[id],
                    true,
                    op_info,
                    buffers,
                    store,
                    None,
                )?);
            }
            for &id in &output_ids {
                result.push(tensor_params_wrapper(
                    &subgraph.tensors[id],
                    false,
                    op_info,
                    buffers,
                    store,
                    None,
                )?);
            }
            Ok(result)
        }
        OpQuantConstraint::SameAsInputScale => {
            let [input_id] = input_ids[..] else {
                return Err(Error::AmbiguousPropagation(format!(
                    "{} requires exactly one active input to share its scale, found {}",
                    op_info.op_name,
                    input_ids.len()
                )));
            };
            let input_tensor = &subgraph.tensors[input_id];
            let input_params =
                tensor_params_wrapper(input_tensor, true, op_info, buffers, store, None)?;
            let shared = input_params.consumers[0].parameters.clone();
            let input_qsv = store.lookup(&input_tensor.name)?.clone();
            let mut result = vec![input_params];
            for &id in &output_ids {
                let output_tensor = &subgraph.tensors[id];
                result.push(tensor_params_wrapper(
                    output_tensor,
                    false,
                    op_info,
                    buffers,
                    store,
                    shared.clone(),
                )?);
                // Align the output statistics with the input's. Safe because
                // subgraphs are acyclic.
                store.insert(&output_tensor.name, input_qsv.clone());
            }
            Ok(result)
        }
        OpQuantConstraint::SameAsOutputScale => {
            let [output_id] = output_ids[..] else {
                return Err(Error::AmbiguousPropagation(format!(
                    "{} requires exactly one active output to share its scale, found {}",
                    op_info.op_name,
                    output_ids.len()
                )));
            };
            let output_params = tensor_params_wrapper(
                &subgraph.tensors[output_id],
                false,
                op_info,
                buffers,
                store,
                None,
            )?;
            let shared = output_params
                .producer
                .as_ref()
                .and_then(|p| p.parameters.clone());
            let mut result = Vec::with_capacity(input_ids.len() + 1);
            for &id in &input_ids {
                result.push(tensor_params_wrapper(
                    &subgraph.tensors[id],
                    true,
                    op_info,
                    buffers,
                    store,
                    shared.clone(),
                )?);
            }
            result.push(output_params);
            Ok(result)
        }
    }
}

/// Materialize fully-connected, conv2d, depthwise-conv2d: the standard walk
/// skips the bias slot, then the fused bias is handled separately.
pub fn materialize_fc_conv(
    op_info: &OpInfo,
    subgraph: &Subgraph,
    buffers: &[Buffer],
    store: &mut CalibrationStore,
) -> Result<Vec<TensorTransformationParams>> {
    let mut result = materialize_standard_op(
        op_info,
        subgraph,
        buffers,
        store,
        OpQuantConstraint::NoConstrain,
        &[2], // bias slot
        &[],
    )?;

    let op = &subgraph.operators[op_info.subgraph_op_index];
    let (_, _, bias, _) = crate::graph::parse_fc_bmm_conv_tensors(op);
    let Some(bias_id) = bias else {
        return Ok(result);
    };
    let bias_tensor = &subgraph.tensors[bias_id];
    let is_srq = op_info.op_quant_config.execution_mode == ExecutionMode::StaticRange;

    let bias_quant_params = if is_srq {
        let content = tensor_data(bias_tensor, buffers)?.ok_or_else(|| {
            Error::Config(format!(
                "bias tensor '{}' has no constant data",
                bias_tensor.name
            ))
        })?;
        let input_params = result[0].consumers[0].parameters.as_ref().ok_or_else(|| {
            Error::Config(format!(
                "missing input quantization parameters for bias of op {}",
                op_info.op_name
            ))
        })?;
        let weight_params = result[1].consumers[0].parameters.as_ref().ok_or_else(|| {
            Error::Config(format!(
                "missing weight quantization parameters for bias of op {}",
                op_info.op_name
            ))
        })?;
        Some(codec::symmetric_quantize_bias_tensor(
            &content,
            input_params,
            weight_params,
        )?)
    } else {
        None
    };
    // The bias is only quantized under static range; reporting it as
    // non-constant otherwise routes it to NoQuantize in the transform table.
    let bias_params = get_tensor_transformation_params(
        &bias_tensor.name,
        op_info,
        true,
        bias_quant_params,
        is_srq,
    );
    result.push(bias_params);
    Ok(result)
}

/// Fixed output ranges for bounded activation functions, keyed by activation
/// bit-width.
fn output_activation_constraint(op: OpType, num_bits: usize) -> Option<UniformQuantParams> {
    let (scale, zero_point) = match (op, num_bits) {
        (OpType::Softmax, 8) => (1.0 / 256.0, -128),
        (OpType::Softmax, 16) => (1.0 / 32768.0, 0),
        (OpType::Tanh, 8) => (1.0 / 128.0, 0),
        (OpType::Tanh, 16) => (1.0 / 32768.0, 0),
        _ => return None,
    };
    Some(UniformQuantParams {
        scale: ArrayD::from_elem(ndarray::IxDyn(&[1]), scale),
        zero_point: ArrayD::from_elem(ndarray::IxDyn(&[1]), zero_point),
        num_bits,
        symmetric: zero_point == 0,
        quantized_dimension: None,
        quantized_data: None,
    })
}

/// Materialize an op whose output range is mandated by the operator itself
/// (e.g. softmax always produces values in [0, 1)).
pub fn materialize_op_with_output_activation_constraint(
    op_info: &OpInfo,
    subgraph: &Subgraph,
    buffers: &[Buffer],
    store: &mut CalibrationStore,
) -> Result<Vec<TensorTransformationParams>> {
    let op = &subgraph.operators[op_info.subgraph_op_index];
    if op.outputs.len() != 1 {
        return Err(Error::AmbiguousPropagation(format!(
            "output activation constraints require a single output tensor, {} has {}",
            op_info.op_name,
            op.outputs.len()
        )));
    }
    let mut result = materialize_standard_op(
        op_info,
        subgraph,
        buffers,
        store,
        OpQuantConstraint::NoConstrain,
        &[],
        &[],
    )?;
    if let Some(activation) = op_info.op_quant_config.activation_tensor_config {
        let output = result.iter_mut().rev().find(|p| p.producer.is_some());
        if let Some(producer) = output.and_then(|p| p.producer.as_mut()) {
            let constrained = output_activation_constraint(op_info.op_name, activation.num_bits)
                .ok_or(Error::UnsupportedOverride {
                    op: op_info.op_name.to_string(),
                    num_bits: activation.num_bits,
                })?;
            producer.parameters = Some(constrained);
        }
    }
    Ok(result)
}

/// Materialize every tensor touched by the op. Dispatch is a closed match
/// over the supported operator set.
pub fn materialize_op(
    op_info: &OpInfo,
    subgraph: &Subgraph,
    buffers: &[Buffer],
    store: &mut CalibrationStore,
) -> Result<Vec<TensorTransformationParams>> {
    match op_info.op_name {
        OpType::FullyConnected | OpType::Conv2d | OpType::DepthwiseConv2d => {
            materialize_fc_conv(op_info, subgraph, buffers, store)
        }
        OpType::BatchMatmul => materialize_standard_op(
            op_info,
            subgraph,
            buffers,
            store,
            OpQuantConstraint::NoConstrain,
            &[],
            &[],
        ),
        OpType::EmbeddingLookup => materialize_standard_op(
            op_info,
            subgraph,
            buffers,
            store,
            OpQuantConstraint::NoConstrain,
            &[0], // lookup indices stay integer
            &[],
        ),
        OpType::Reshape => materialize_standard_op(
            op_info,
            subgraph,
            buffers,
            store,
            OpQuantConstraint::SameAsInputScale,
            &[1], // shape tensor is not quantizable
            &[],
        ),
        OpType::Transpose => materialize_standard_op(
            op_info,
            subgraph,
            buffers,
            store,
            OpQuantConstraint::SameAsInputScale,
            &[1], // permutation tensor
            &[],
        ),
        OpType::AveragePool2d => materialize_standard_op(
            op_info,
            subgraph,
            buffers,
            store,
            OpQuantConstraint::SameAsInputScale,
            &[],
            &[],
        ),
        OpType::Softmax | OpType::Tanh => {
            materialize_op_with_output_activation_constraint(op_info, subgraph, buffers, store)
        }
        OpType::Gelu | OpType::Add | OpType::Sub | OpType::Mul => materialize_standard_op(
            op_info,
            subgraph,
            buffers,
            store,
            OpQuantConstraint::NoConstrain,
            &[],
            &[],
        ),
        OpType::Quantize | OpType::Dequantize => Err(Error::Config(format!(
            "op {} is not quantizable",
            op_info.op_name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{f32_buffer, Model, Operator};
    use approx::assert_abs_diff_eq;

    fn fc_model(with_bias: bool) -> Model {
        let mut model = Model::default();
        let empty = model.add_buffer(Buffer::default());
        let weight_buf = model.add_buffer(f32_buffer(&[
            0.1, -0.2, 0.3, -0.4, // out channel 0
            1.0, -2.0, 3.0, -4.0, // out channel 1
            5.0, -6.0, 7.0, -8.0, // out channel 2
        ]));
        let bias_buf = model.add_buffer(f32_buffer(&[0.5, -0.5, 1.5]));

        let mut sg = Subgraph::default();
        sg.add_tensor(Tensor::new("serving_default/input", vec![1, 4], crate::graph::TensorType::Float32, empty));
        sg.add_tensor(Tensor::new("dense/weight", vec![3, 4], crate::graph::TensorType::Float32, weight_buf));
        sg.add_tensor(Tensor::new("dense/bias", vec![3], crate::graph::TensorType::Float32, bias_buf));
        sg.add_tensor(Tensor::new("dense/output", vec![1, 3], crate::graph::TensorType::Float32, empty));
        let inputs = if with_bias { vec![0, 1, 2] } else { vec![0, 1, -1] };
        sg.operators.push(Operator::new(OpType::FullyConnected, inputs, vec![3]));
        sg.inputs = vec![0];
        sg.outputs = vec![3];
        model.subgraphs.push(sg);
        model
    }

    fn fc_op_info(mode: ExecutionMode, channel_wise: bool) -> OpInfo {
        let weight = TensorQuantConfig {
            num_bits: 8,
            symmetric: true,
            channel_wise,
            dtype: TensorDataType::Int,
        };
        let activation = TensorQuantConfig {
            num_bits: 8,
            symmetric: true,
            channel_wise: false,
            dtype: TensorDataType::Int,
        };
        OpInfo {
            subgraph_op_index: 0,
            op_name: OpType::FullyConnected,
            options: OpOptions::None,
            op_quant_config: OpQuantConfig {
                activation_tensor_config: (mode == ExecutionMode::StaticRange).then_some(activation),
                weight_tensor_config: weight,
                execution_mode: mode,
                compute_precision: Default::default(),
            },
        }
    }

    fn calibrated_store() -> CalibrationStore {
        let mut store = CalibrationStore::new();
        store.observe("serving_default/input", Qsv::scalar(-10.0, 8.0, 2), 0.0);
        store.observe("dense/output", Qsv::scalar(-1.0, 1.0, 2), 0.0);
        store
    }

    fn transformations(params: &TensorTransformationParams, inbound: bool) -> &[QuantTransformation] {
        if inbound {
            &params.consumers[0].transformations
        } else {
            &params.producer.as_ref().unwrap().transformations
        }
    }

    #[test]
    fn test_fc_static_range_transformations() {
        let model = fc_model(true);
        let mut store = calibrated_store();
        let op_info = fc_op_info(ExecutionMode::StaticRange, true);
        let result =
            materialize_op(&op_info, &model.subgraphs[0], &model.buffers, &mut store).unwrap();

        // input, weight, output, bias
        assert_eq!(result.len(), 4);
        assert_eq!(result[0].tensor_name, "serving_default/input");
        assert_eq!(transformations(&result[0], true), &[QuantTransformation::AddQuantize]);
        assert_eq!(result[1].tensor_name, "dense/weight");
        assert_eq!(transformations(&result[1], true), &[QuantTransformation::QuantizeTensor]);
        assert_eq!(result[2].tensor_name, "dense/output");
        assert_eq!(transformations(&result[2], false), &[QuantTransformation::AddDequantize]);
        assert_eq!(result[3].tensor_name, "dense/bias");
        assert_eq!(transformations(&result[3], true), &[QuantTransformation::QuantizeTensor]);

        // Per-channel weight: one scale per output channel, axis 0.
        let weight_params = result[1].consumers[0].parameters.as_ref().unwrap();
        assert_eq!(weight_params.scale.len(), 3);
        assert_eq!(weight_params.quantized_dimension, Some(0));
        assert!(weight_params.quantized_data.is_some());
        assert_abs_diff_eq!(
            weight_params.scale.iter().copied().next().unwrap(),
            0.4 / 127.0,
            epsilon = 1e-6
        );

        // Bias promoted to 32-bit symmetric with zero zero-point.
        let bias_params = result[3].consumers[0].parameters.as_ref().unwrap();
        assert_eq!(bias_params.num_bits, 32);
        assert!(bias_params.symmetric);
        assert!(bias_params.zero_point.iter().all(|&z| z == 0));

        // Input scale comes from the calibrated [-10, 8] range.
        let input_params = result[0].consumers[0].parameters.as_ref().unwrap();
        assert_abs_diff_eq!(
            input_params.scale.iter().copied().next().unwrap(),
            10.0 / 127.0,
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_fc_weight_only_transformations() {
        let model = fc_model(true);
        let mut store = CalibrationStore::new();
        let op_info = fc_op_info(ExecutionMode::WeightOnly, false);
        let result =
            materialize_op(&op_info, &model.subgraphs[0], &model.buffers, &mut store).unwrap();

        assert_eq!(transformations(&result[0], true), &[QuantTransformation::NoQuantize]);
        assert_eq!(transformations(&result[1], true), &[QuantTransformation::AddDequantize]);
        assert_eq!(transformations(&result[2], false), &[QuantTransformation::NoQuantize]);
        // Bias is never touched outside static range.
        assert_eq!(transformations(&result[3], true), &[QuantTransformation::NoQuantize]);
        assert!(result[3].consumers[0].parameters.is_none());
    }

    #[test]
    fn test_fc_dynamic_range_bias_untouched() {
        let model = fc_model(true);
        let mut store = CalibrationStore::new();
        let op_info = fc_op_info(ExecutionMode::DynamicRange, true);
        let result =
            materialize_op(&op_info, &model.subgraphs[0], &model.buffers, &mut store).unwrap();

        assert_eq!(transformations(&result[1], true), &[QuantTransformation::QuantizeTensor]);
        assert_eq!(transformations(&result[0], true), &[QuantTransformation::NoQuantize]);
        assert_eq!(transformations(&result[3], true), &[QuantTransformation::NoQuantize]);
    }

    #[test]
    fn test_fc_without_bias_yields_three_entries() {
        let model = fc_model(false);
        let mut store = calibrated_store();
        let op_info = fc_op_info(ExecutionMode::StaticRange, false);
        let result =
            materialize_op(&op_info, &model.subgraphs[0], &model.buffers, &mut store).unwrap();
        assert_eq!(result.len(), 3);
    }

    #[test]
    fn test_missing_statistics_surfaces_tensor_name() {
        let model = fc_model(true);
        let mut store = CalibrationStore::new(); // no calibration
        let op_info = fc_op_info(ExecutionMode::StaticRange, false);
        let err =
            materialize_op(&op_info, &model.subgraphs[0], &model.buffers, &mut store).unwrap_err();
        assert!(matches!(err, Error::MissingStatistics(name) if name == "serving_default/input"));
    }

    fn reshape_model() -> Model {
        let mut model = Model::default();
        let empty = model.add_buffer(Buffer::default());
        let shape_buf = model.add_buffer(Buffer::new(vec![6, 0, 0, 0])); // opaque int32 shape

        let mut sg = Subgraph::default();
        sg.add_tensor(Tensor::new("block/act", vec![2, 3], crate::graph::TensorType::Float32, empty));
        sg.add_tensor(Tensor::new("block/shape", vec![1], crate::graph::TensorType::Int32, shape_buf));
        sg.add_tensor(Tensor::new("block/reshaped", vec![6], crate::graph::TensorType::Float32, empty));
        sg.operators.push(Operator::new(OpType::Reshape, vec![0, 1], vec![2]));
        model.subgraphs.push(sg);
        model
    }

    #[test]
    fn test_reshape_shares_input_params_and_qsv() {
        let model = reshape_model();
        let mut store = CalibrationStore::new();
        store.observe("block/act", Qsv::scalar(-4.0, 4.0, 2), 0.0);
        store.observe("block/reshaped", Qsv::scalar(-9.0, 9.0, 1), 0.0);

        let op_info = OpInfo {
            subgraph_op_index: 0,
            op_name: OpType::Reshape,
            options: OpOptions::None,
            op_quant_config: OpQuantConfig {
                activation_tensor_config: Some(TensorQuantConfig::default()),
                weight_tensor_config: TensorQuantConfig::default(),
                execution_mode: ExecutionMode::StaticRange,
                compute_precision: Default::default(),
            },
        };
        let result =
            materialize_op(&op_info, &model.subgraphs[0], &model.buffers, &mut store).unwrap();

        // Shape tensor excluded: only the data input and the output remain.
        assert_eq!(result.len(), 2);
        let input_params = result[0].consumers[0].parameters.as_ref().unwrap();
        let output_params = result[1].producer.as_ref().unwrap().parameters.as_ref().unwrap();
        assert!(input_params.same_params(output_params));

        // Output statistics overwritten with the input's.
        let qsv = store.lookup("block/reshaped").unwrap();
        assert_abs_diff_eq!(qsv.min.iter().copied().next().unwrap(), -4.0);
    }

    #[test]
    fn test_same_as_input_scale_rejects_multiple_inputs() {
        let model = fc_model(true);
        let mut store = calibrated_store();
        let op_info = fc_op_info(ExecutionMode::StaticRange, false);
        let err = materialize_standard_op(
            &op_info,
            &model.subgraphs[0],
            &model.buffers,
            &mut store,
            OpQuantConstraint::SameAsInputScale,
            &[],
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, Error::AmbiguousPropagation(_)));
    }

    fn softmax_op_info(num_bits: usize) -> OpInfo {
        OpInfo {
            subgraph_op_index: 0,
            op_name: OpType::Softmax,
            options: OpOptions::None,
            op_quant_config: OpQuantConfig {
                activation_tensor_config: Some(TensorQuantConfig {
                    num_bits,
                    symmetric: num_bits == 16,
                    channel_wise: false,
                    dtype: TensorDataType::Int,
                }),
                weight_tensor_config: TensorQuantConfig::default(),
                execution_mode: ExecutionMode::StaticRange,
                compute_precision: Default::default(),
            },
        }
    }

    fn softmax_model() -> (Model, CalibrationStore) {
        let mut model = Model::default();
        let empty = model.add_buffer(Buffer::default());
        let mut sg = Subgraph::default();
        sg.add_tensor(Tensor::new("logits", vec![1, 10], crate::graph::TensorType::Float32, empty));
        sg.add_tensor(Tensor::new("probs", vec![1, 10], crate::graph::TensorType::Float32, empty));
        sg.operators.push(Operator::new(OpType::Softmax, vec![0], vec![1]));
        model.subgraphs.push(sg);
        let mut store = CalibrationStore::new();
        store.observe("logits", Qsv::scalar(-20.0, 20.0, 2), 0.0);
        store.observe("probs", Qsv::scalar(0.0, 1.0, 2), 0.0);
        (model, store)
    }

    #[test]
    fn test_softmax_fixed_output_scale() {
        let (model, mut store) = softmax_model();
        let op_info = softmax_op_info(8);
        let result =
            materialize_op(&op_info, &model.subgraphs[0], &model.buffers, &mut store).unwrap();
        let output_params = result[1].producer.as_ref().unwrap().parameters.as_ref().unwrap();
        assert_abs_diff_eq!(output_params.scale[[0]], 1.0 / 256.0, epsilon = 1e-9);
        assert_eq!(output_params.zero_point[[0]], -128);
    }

    #[test]
    fn test_softmax_unregistered_bit_width() {
        let (model, mut store) = softmax_model();
        let op_info = softmax_op_info(4);
        let err =
            materialize_op(&op_info, &model.subgraphs[0], &model.buffers, &mut store).unwrap_err();
        assert!(matches!(err, Error::UnsupportedOverride { num_bits: 4, .. }));
    }

    #[test]
    fn test_bmm_quantized_dim_follows_adj_y() {
        assert_eq!(
            weight_quantized_dim(OpType::BatchMatmul, OpOptions::BatchMatmul { adj_x: false, adj_y: false }, 3),
            Some(2)
        );
        assert_eq!(
            weight_quantized_dim(OpType::BatchMatmul, OpOptions::BatchMatmul { adj_x: false, adj_y: true }, 3),
            Some(1)
        );
    }

    #[test]
    fn test_check_weight_only_config_rejections() {
        assert!(check_weight_only_config(OpType::FullyConnected, &OpQuantConfig::default()).is_ok());
        assert!(check_weight_only_config(OpType::Softmax, &OpQuantConfig::default()).is_err());

        // Widths with no integer storage type are a config error, not a panic.
        for num_bits in [0, 12, 128] {
            let config = OpQuantConfig {
                weight_tensor_config: TensorQuantConfig {
                    num_bits,
                    ..TensorQuantConfig::default()
                },
                ..OpQuantConfig::default()
            };
            assert!(matches!(
                check_weight_only_config(OpType::FullyConnected, &config),
                Err(Error::Config(_))
            ));
        }
    }

    #[test]
    fn test_check_drq_config_rejections() {
        let mut config = OpQuantConfig {
            execution_mode: ExecutionMode::DynamicRange,
            ..OpQuantConfig::default()
        };
        assert!(check_drq_config(OpType::FullyConnected, &config).is_ok());
        assert!(check_drq_config(OpType::Softmax, &config).is_err());

        config.weight_tensor_config.symmetric = false;
        assert!(check_drq_config(OpType::FullyConnected, &config).is_err());

        config.weight_tensor_config.symmetric = true;
        config.weight_tensor_config.num_bits = 4;
        assert!(check_drq_config(OpType::FullyConnected, &config).is_ok());
        assert!(check_drq_config(OpType::Conv2d, &config).is_err());
    }

    #[test]
    fn test_check_srq_config_rejections() {
        let mut config = OpQuantConfig {
            activation_tensor_config: Some(TensorQuantConfig::default()),
            execution_mode: ExecutionMode::StaticRange,
            ..OpQuantConfig::default()
        };
        assert!(check_srq_config(OpType::FullyConnected, &config).is_ok());

        // missing activation config
        let missing = OpQuantConfig {
            activation_tensor_config: None,
            execution_mode: ExecutionMode::StaticRange,
            ..OpQuantConfig::default()
        };
        assert!(check_srq_config(OpType::FullyConnected, &missing).is_err());

        // int16 activations must be symmetric
        config.activation_tensor_config = Some(TensorQuantConfig {
            num_bits: 16,
            symmetric: false,
            ..TensorQuantConfig::default()
        });
        assert!(check_srq_config(OpType::FullyConnected, &config).is_err());

        // float activations are not allowed
        config.activation_tensor_config = Some(TensorQuantConfig {
            dtype: TensorDataType::Float,
            ..TensorQuantConfig::default()
        });
        assert!(check_srq_config(OpType::FullyConnected, &config).is_err());
    }

    #[test]
    fn test_constant_min_max_per_channel() {
        let model = fc_model(true);
        let op_info = fc_op_info(ExecutionMode::DynamicRange, true);
        let qsv = init_tensor_min_max(
            &model.subgraphs[0].tensors[1],
            &model.buffers,
            &op_info,
        )
        .unwrap();
        assert_eq!(qsv.min.shape(), &[3, 1]);
        assert_abs_diff_eq!(qsv.min[[0, 0]], -0.4);
        assert_abs_diff_eq!(qsv.max[[2, 0]], 7.0);
    }
}
