//! Graph surgery for quantization edits
//!
//! Each edit operates on one mutable subgraph and is self-contained:
//! - `quantize_tensor` rewrites a tensor's buffer and metadata in place.
//! - `insert_dequantize` / `insert_quantize` splice a conversion node
//!   between a tensor and a selected subset of its consumers.
//!
//! Insertions shift every later operator index, so each edit reports how
//! many nodes it added and where; the caller remaps indices of pending
//! edits from that.

use crate::error::{Error, Result};
use crate::graph::{
    Buffer, OpType, Operator, QuantizationMeta, Subgraph, Tensor, TensorType,
};
use crate::quant::codec::tensor_type_for_bits;
use crate::quant::types::{TransformationInfo, UniformQuantParams};

/// A self-contained edit request for one tensor.
#[derive(Clone, Debug)]
pub struct TransformationInput {
    pub tensor_id: usize,
    /// Producing operator index; `-1` for constants and graph inputs.
    pub producer: i32,
    /// Consuming operator indices to rewire; `-1` marks the subgraph
    /// output list.
    pub consumers: Vec<i32>,
    pub parameters: UniformQuantParams,
}

fn quantized_bytes(data: &ndarray::ArrayD<i64>, dtype: TensorType) -> Vec<u8> {
    match dtype {
        TensorType::Int8 => data.iter().map(|&v| v as i8 as u8).collect(),
        TensorType::Int16 => data
            .iter()
            .flat_map(|&v| (v as i16).to_le_bytes())
            .collect(),
        TensorType::Int32 => data
            .iter()
            .flat_map(|&v| (v as i32).to_le_bytes())
            .collect(),
        TensorType::Int64 => data.iter().flat_map(|&v| v.to_le_bytes()).collect(),
        TensorType::Float32 => Vec::new(),
    }
}

fn quantization_meta(params: &UniformQuantParams) -> QuantizationMeta {
    QuantizationMeta {
        scale: params.scale.iter().copied().collect(),
        zero_point: params.zero_point.iter().copied().collect(),
        quantized_dimension: params.quantized_dimension,
    }
}

/// Quantize a tensor in place: buffer bytes (for constants), declared type
/// and quantization metadata. No nodes are added and the tensor keeps its
/// identity.
pub fn quantize_tensor(
    input: &TransformationInput,
    subgraph: &mut Subgraph,
    buffers: &mut Vec<Buffer>,
) -> Result<TransformationInfo> {
    let params = &input.parameters;
    let dtype = tensor_type_for_bits(params.num_bits)?;
    let tensor = &mut subgraph.tensors[input.tensor_id];

    match &params.quantized_data {
        Some(data) => {
            buffers[tensor.buffer] = Buffer::new(quantized_bytes(data, dtype));
        }
        None => {
            // Activations carry no constant data: only the declared type and
            // metadata change.
            if !buffers[tensor.buffer].is_empty() {
                return Err(Error::Config(format!(
                    "tensor '{}' has constant data but no materialized quantized values",
                    tensor.name
                )));
            }
        }
    }
    tensor.dtype = dtype;
    tensor.quantization = Some(quantization_meta(params));

    Ok(TransformationInfo {
        op_id: input.producer.max(0) as usize,
        num_ops_added: 0,
        output_tensor_id: input.tensor_id,
    })
}

/// Leave the tensor untouched.
pub fn no_quantize(input: &TransformationInput) -> TransformationInfo {
    TransformationInfo {
        op_id: input.producer.max(0) as usize,
        num_ops_added: 0,
        output_tensor_id: input.tensor_id,
    }
}

/// Node position for an inserted conversion op: just before its earliest
/// selected consumer, or right after the producer when only the subgraph
/// output list consumes the tensor.
fn insertion_position(input: &TransformationInput) -> usize {
    input
        .consumers
        .iter()
        .filter(|&&c| c >= 0)
        .map(|&c| c as usize)
        .min()
        .unwrap_or_else(|| (input.producer + 1).max(0) as usize)
}

/// Rewire the selected consumers (and the subgraph output list, when
/// selected) from `old_id` to `new_id`.
fn rewire_consumers(
    subgraph: &mut Subgraph,
    consumers: &[i32],
    old_id: usize,
    new_id: usize,
) {
    for &consumer in consumers {
        if consumer < 0 {
            for out in subgraph.outputs.iter_mut() {
                if *out == old_id as i32 {
                    *out = new_id as i32;
                }
            }
        } else {
            for slot in subgraph.operators[consumer as usize].inputs.iter_mut() {
                if *slot == old_id as i32 {
                    *slot = new_id as i32;
                }
            }
        }
    }
}

/// Quantize the source tensor in place and splice a dequantize node between
/// it and the selected consumers. Unselected consumers keep reading the
/// now-quantized source tensor.
pub fn insert_dequantize(
    input: &TransformationInput,
    subgraph: &mut Subgraph,
    buffers: &mut Vec<Buffer>,
) -> Result<TransformationInfo> {
    quantize_tensor(input, subgraph, buffers)?;

    let source = &subgraph.tensors[input.tensor_id];
    let new_tensor = Tensor::new(
        format!("{}_dequant", source.name),
        source.shape.clone(),
        TensorType::Float32,
        {
            buffers.push(Buffer::default());
            buffers.len() - 1
        },
    );
    let new_id = subgraph.add_tensor(new_tensor);

    let position = insertion_position(input);
    rewire_consumers(subgraph, &input.consumers, input.tensor_id, new_id);
    subgraph.operators.insert(
        position,
        Operator::new(
            OpType::Dequantize,
            vec![input.tensor_id as i32],
            vec![new_id as i32],
        ),
    );

    Ok(TransformationInfo {
        op_id: position,
        num_ops_added: 1,
        output_tensor_id: new_id,
    })
}

/// Splice a quantize node between a float tensor and the selected
/// consumers. The source tensor stays float; the new tensor carries the
/// quantized type and metadata.
pub fn insert_quantize(
    input: &TransformationInput,
    subgraph: &mut Subgraph,
    buffers: &mut Vec<Buffer>,
) -> Result<TransformationInfo> {
    let params = &input.parameters;
    let dtype = tensor_type_for_bits(params.num_bits)?;
    if !input.consumers.iter().any(|&c| c >= 0) {
        return Err(Error::Config(format!(
            "quantize insertion for tensor {} has no consuming operator",
            input.tensor_id
        )));
    }

    let source = &subgraph.tensors[input.tensor_id];
    let mut new_tensor = Tensor::new(
        format!("{}_quant", source.name),
        source.shape.clone(),
        dtype,
        {
            buffers.push(Buffer::default());
            buffers.len() - 1
        },
    );
    new_tensor.quantization = Some(quantization_meta(params));
    let new_id = subgraph.add_tensor(new_tensor);

    let position = insertion_position(input);
    rewire_consumers(subgraph, &input.consumers, input.tensor_id, new_id);
    subgraph.operators.insert(
        position,
        Operator::new(
            OpType::Quantize,
            vec![input.tensor_id as i32],
            vec![new_id as i32],
        ),
    );

    Ok(TransformationInfo {
        op_id: position,
        num_ops_added: 1,
        output_tensor_id: new_id,
    })
}
