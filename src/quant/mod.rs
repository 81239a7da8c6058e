//! Post-training quantization pipeline
//!
//! Modules, leaves first:
//! - **codec**: scale/zero-point derivation and tensor quantize/dequantize
//! - **calibration**: per-tensor running min/max statistics
//! - **recipe**: scoped rule table resolving op instances to quantization configs
//! - **materialize**: per-operator parameter and edit-plan derivation
//! - **transform**: index-safe graph surgery applying the edit plan
//! - **quantizer**: the orchestrator tying the pipeline together

pub mod calibration;
pub mod codec;
pub mod materialize;
pub mod quantizer;
pub mod recipe;
pub mod transform;
pub mod types;

pub use calibration::{CalibrationStore, Qsv};
pub use quantizer::Quantizer;
pub use recipe::{OpSelector, RecipeResolver, ScopeRule, MIN_MAX, NO_QUANT};
pub use types::{
    ExecutionMode, OpQuantConfig, QuantTransformation, TensorQuantConfig, UniformQuantParams,
};
