//! # Cuantizar: Post-Training Quantization Engine
//!
//! Cuantizar rewrites flatbuffer-style inference graphs to lower numeric
//! precision (float32 to int4/int8/int16) while preserving operator
//! topology.
//!
//! ## Architecture
//!
//! - **graph**: mutable arena model of subgraphs, tensors, buffers, operators
//! - **quant**: the quantization pipeline (codec, calibration, recipe,
//!   materialization, graph transformation, orchestrator)
//!
//! ## Example
//!
//! ```no_run
//! use cuantizar::quant::{Quantizer, ScopeRule, OpSelector, MIN_MAX};
//! use cuantizar::quant::types::{ExecutionMode, OpQuantConfig};
//! use cuantizar::graph::{Model, OpType};
//!
//! # fn run(mut model: Model) -> cuantizar::Result<()> {
//! let mut quantizer = Quantizer::new();
//! quantizer.add_rule(ScopeRule {
//!     regex: ".*".to_string(),
//!     operation: OpSelector::Op(OpType::FullyConnected),
//!     algorithm_key: MIN_MAX.to_string(),
//!     op_config: OpQuantConfig {
//!         execution_mode: ExecutionMode::WeightOnly,
//!         ..OpQuantConfig::default()
//!     },
//!     override_algorithm: true,
//! })?;
//! quantizer.quantize(&mut model)?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod graph;
pub mod quant;

pub use error::{Error, Result};
pub use quant::Quantizer;
