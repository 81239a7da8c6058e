//! Uniform quantization numeric codec
//!
//! Pure functions mapping (min, max, bit-width, symmetry) to scale/zero-point
//! and converting tensors to and from their quantized representation:
//! - Symmetric encodings reserve one negative code so zero is exactly
//!   representable: `qmin = -2^(bits-1)+1`.
//! - Asymmetric encodings first extend the range to span zero.
//! - Bias tensors get a derived scale (`input_scale * weight_scale`) and a
//!   wider accumulator bit-width.

use ndarray::{ArrayD, ArrayViewD, IxDyn, Zip};

use crate::error::{Error, Result};
use crate::graph::TensorType;
use crate::quant::types::UniformQuantParams;

/// Scales this small are treated as degenerate (all-zero range) and floored
/// so round-trips stay finite.
const SCALE_FLOOR: f32 = 1e-9;

/// Quantized value domain for a signed encoding.
///
/// Symmetric encodings drop the most negative code so the range is centered
/// on an exactly-representable zero.
pub fn quantized_range(num_bits: usize, symmetric: bool) -> (i64, i64) {
    // 64-bit accumulators saturate at the i64 domain itself.
    let qmax = if num_bits >= 64 {
        i64::MAX
    } else {
        (1i64 << (num_bits - 1)) - 1
    };
    let qmin = if symmetric {
        -qmax
    } else if num_bits >= 64 {
        i64::MIN
    } else {
        -(1i64 << (num_bits - 1))
    };
    (qmin, qmax)
}

/// Integer tensor type matching a quantized bit-width.
pub fn tensor_type_for_bits(num_bits: usize) -> Result<TensorType> {
    match num_bits {
        1..=8 => Ok(TensorType::Int8),
        16 => Ok(TensorType::Int16),
        32 => Ok(TensorType::Int32),
        64 => Ok(TensorType::Int64),
        _ => Err(Error::Config(format!(
            "unsupported quantized bit-width: {num_bits}"
        ))),
    }
}

/// Compute (zero_point, scale) from broadcastable min/max arrays.
///
/// `min` and `max` must share a shape; per-channel inputs carry one entry per
/// channel (size-1 on every other axis), per-tensor inputs a single entry.
pub fn zero_point_scale_from_min_max(
    min: &ArrayD<f32>,
    max: &ArrayD<f32>,
    num_bits: usize,
    symmetric: bool,
) -> Result<(ArrayD<i64>, ArrayD<f32>)> {
    if min.shape() != max.shape() {
        return Err(Error::Shape(format!(
            "min {:?} and max {:?} must have the same shape",
            min.shape(),
            max.shape()
        )));
    }
    let (qmin, qmax) = quantized_range(num_bits, symmetric);
    let mut scale = ArrayD::<f32>::zeros(min.raw_dim());
    let mut zero_point = ArrayD::<i64>::zeros(min.raw_dim());
    if symmetric {
        Zip::from(&mut scale)
            .and(min)
            .and(max)
            .for_each(|s, &lo, &hi| {
                let bound = lo.abs().max(hi.abs());
                *s = (bound / qmax as f32).max(SCALE_FLOOR);
            });
    } else {
        Zip::from(&mut scale)
            .and(&mut zero_point)
            .and(min)
            .and(max)
            .for_each(|s, z, &lo, &hi| {
                // The quantized range must span zero so that padding and
                // zero-valued activations are exactly representable.
                let lo = lo.min(0.0);
                let hi = hi.max(0.0);
                let step = ((hi - lo) / (qmax - qmin) as f32).max(SCALE_FLOOR);
                let zp = (qmin as f32 - lo / step).round() as i64;
                *s = step;
                *z = zp.clamp(qmin, qmax);
            });
    }
    Ok((zero_point, scale))
}

/// Reshape flattened per-channel parameters so they broadcast against a
/// tensor of the given rank: size one on every axis except the quantized
/// dimension.
pub fn extend_params_rank(
    tensor_rank: usize,
    params: &UniformQuantParams,
) -> Result<UniformQuantParams> {
    let dim = match params.quantized_dimension {
        Some(dim) => dim,
        None => return Ok(params.clone()),
    };
    if params.scale.ndim() == tensor_rank {
        return Ok(params.clone());
    }
    if dim >= tensor_rank {
        return Err(Error::Shape(format!(
            "quantized dimension {dim} out of range for tensor rank {tensor_rank}"
        )));
    }
    let channels = params.scale.len();
    let mut shape = vec![1usize; tensor_rank];
    shape[dim] = channels;
    let scale = params
        .scale
        .clone()
        .into_shape_with_order(IxDyn(&shape))
        .map_err(|e| Error::Shape(e.to_string()))?;
    let zero_point = params
        .zero_point
        .clone()
        .into_shape_with_order(IxDyn(&shape))
        .map_err(|e| Error::Shape(e.to_string()))?;
    Ok(UniformQuantParams {
        scale,
        zero_point,
        ..params.clone()
    })
}

fn broadcast_params<'a>(
    shape: &[usize],
    params: &'a UniformQuantParams,
) -> Result<(ArrayViewD<'a, f32>, ArrayViewD<'a, i64>)> {
    if params.scale.shape() != params.zero_point.shape() {
        return Err(Error::Shape(format!(
            "scale {:?} and zero_point {:?} must have the same shape",
            params.scale.shape(),
            params.zero_point.shape()
        )));
    }
    if params.scale.ndim() > 1 && params.scale.ndim() != shape.len() {
        return Err(Error::Shape(format!(
            "ranks of scale ({}) and tensor ({}) do not match",
            params.scale.ndim(),
            shape.len()
        )));
    }
    let dim = IxDyn(shape);
    let scale = params.scale.broadcast(dim.clone()).ok_or_else(|| {
        Error::Shape(format!(
            "scale {:?} does not broadcast against tensor {:?}",
            params.scale.shape(),
            shape
        ))
    })?;
    let zero_point = params.zero_point.broadcast(dim).ok_or_else(|| {
        Error::Shape(format!(
            "zero_point {:?} does not broadcast against tensor {:?}",
            params.zero_point.shape(),
            shape
        ))
    })?;
    Ok((scale, zero_point))
}

/// Quantize a float tensor: `round(x / scale) + zero_point`, clamped to the
/// declared bit-width's value domain.
pub fn uniform_quantize(
    tensor: &ArrayD<f32>,
    params: &UniformQuantParams,
) -> Result<ArrayD<i64>> {
    let extended = extend_params_rank(tensor.ndim(), params)?;
    let (scale, zero_point) = broadcast_params(tensor.shape(), &extended)?;
    let (qmin, qmax) = quantized_range(params.num_bits, params.symmetric);
    let mut out = ArrayD::<i64>::zeros(tensor.raw_dim());
    Zip::from(&mut out)
        .and(tensor)
        .and(&scale)
        .and(&zero_point)
        .for_each(|q, &x, &s, &z| {
            *q = ((x / s).round() as i64 + z).clamp(qmin, qmax);
        });
    Ok(out)
}

/// Dequantize an integer tensor: `(q - zero_point) * scale`.
pub fn uniform_dequantize(
    tensor: &ArrayD<i64>,
    params: &UniformQuantParams,
) -> Result<ArrayD<f32>> {
    let extended = extend_params_rank(tensor.ndim(), params)?;
    let (scale, zero_point) = broadcast_params(tensor.shape(), &extended)?;
    let mut out = ArrayD::<f32>::zeros(tensor.raw_dim());
    Zip::from(&mut out)
        .and(tensor)
        .and(&scale)
        .and(&zero_point)
        .for_each(|x, &q, &s, &z| {
            *x = (q - z) as f32 * s;
        });
    Ok(out)
}

/// Quantize a fused bias tensor against already-materialized input and weight
/// parameters.
///
/// Bias quantization is always symmetric with an effective scale of
/// `input_scale * weight_scale` (per-channel when the weight is), and uses a
/// wider accumulator width: 32 bits for 8-bit activations, 64 bits otherwise.
pub fn symmetric_quantize_bias_tensor(
    bias: &ArrayD<f32>,
    input_params: &UniformQuantParams,
    weight_params: &UniformQuantParams,
) -> Result<UniformQuantParams> {
    let input_scale = input_params.scale.iter().next().copied().ok_or_else(|| {
        Error::Shape("input quantization parameters carry no scale".to_string())
    })?;
    let weight_scales: Vec<f32> = weight_params.scale.iter().copied().collect();
    let num_channels = weight_scales.len();
    let effective_scale: Vec<f32> = weight_scales.iter().map(|w| w * input_scale).collect();

    let num_bits = if input_params.num_bits == 8 { 32 } else { 64 };
    let quantized_dimension = if num_channels > 1 { Some(0) } else { None };
    let mut params = UniformQuantParams {
        scale: ArrayD::from_shape_vec(IxDyn(&[num_channels]), effective_scale)
            .map_err(|e| Error::Shape(e.to_string()))?,
        zero_point: ArrayD::zeros(IxDyn(&[num_channels])),
        num_bits,
        symmetric: true,
        quantized_dimension,
        quantized_data: None,
    };
    params.quantized_data = Some(uniform_quantize(bias, &params)?);
    Ok(params)
}
