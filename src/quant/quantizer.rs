//! Quantization orchestrator
//!
//! Ties the pipeline together: walks every subgraph operator, resolves its
//! recipe rule, materializes per-tensor parameters against the calibration
//! store, reconciles the per-tensor edit plan, and drives the graph
//! transformation engine in an index-stable order.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::graph::{Model, OpType, Subgraph};
use crate::quant::calibration::{CalibrationStore, Qsv};
use crate::quant::materialize::{check_op_quant_config, materialize_op};
use crate::quant::recipe::{RecipeResolver, ScopeRule, NO_QUANT};
use crate::quant::transform::{
    insert_dequantize, insert_quantize, quantize_tensor, TransformationInput,
};
use crate::quant::types::{
    OpInfo, OpToTensorParams, QuantTransformation, TensorTransformationParams,
    UniformQuantParams,
};

/// Default exponential smoothing factor for calibration updates.
pub const DEFAULT_SMOOTHING: f32 = 0.99;

/// Scope name of an operator instance: the name of its first output tensor,
/// which encodes the layer path in exported graphs.
fn op_scope_name(subgraph: &Subgraph, op_index: usize) -> String {
    subgraph.operators[op_index]
        .outputs
        .iter()
        .find(|&&id| id >= 0)
        .map(|&id| subgraph.tensors[id as usize].name.clone())
        .unwrap_or_default()
}

/// One reconciled graph edit, in pre-edit coordinates.
#[derive(Clone, Debug)]
struct Edit {
    tensor_id: usize,
    transformation: QuantTransformation,
    producer: i32,
    consumers: Vec<i32>,
    parameters: UniformQuantParams,
    /// Producer-side insertions rewire every consumer, so later edits on the
    /// same tensor must chain off the inserted node's output tensor.
    from_producer: bool,
}

impl Edit {
    /// Anchor operator index this edit inserts at, in pre-edit coordinates.
    fn anchor(&self) -> usize {
        self.consumers
            .iter()
            .filter(|&&c| c >= 0)
            .map(|&c| c as usize)
            .min()
            .unwrap_or_else(|| (self.producer + 1).max(0) as usize)
    }
}

/// End-to-end quantizer: recipe, calibration statistics and model rewrite.
#[derive(Debug)]
pub struct Quantizer {
    resolver: RecipeResolver,
    store: CalibrationStore,
    smoothing: f32,
}

impl Default for Quantizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Quantizer {
    pub fn new() -> Self {
        Self {
            resolver: RecipeResolver::new(),
            store: CalibrationStore::new(),
            smoothing: DEFAULT_SMOOTHING,
        }
    }

    pub fn with_smoothing(mut self, smoothing: f32) -> Self {
        self.smoothing = smoothing;
        self
    }

    /// Register a recipe rule. See [`RecipeResolver::add_rule`].
    pub fn add_rule(&mut self, rule: ScopeRule) -> Result<()> {
        self.resolver.add_rule(rule)
    }

    /// Replace the full rule set with a recipe document.
    pub fn load_recipe(&mut self, rules: Vec<ScopeRule>) -> Result<()> {
        self.resolver.load_recipe(rules)
    }

    pub fn load_recipe_json(&mut self, json: &str) -> Result<()> {
        self.resolver = RecipeResolver::from_json(json)?;
        Ok(())
    }

    pub fn recipe_json(&self) -> Result<String> {
        self.resolver.to_json()
    }

    /// Record one calibration batch's min/max for a tensor.
    pub fn observe(&mut self, tensor_name: &str, batch: Qsv) {
        self.store.observe(tensor_name, batch, self.smoothing);
    }

    pub fn calibration(&self) -> &CalibrationStore {
        &self.store
    }

    /// Resolve and materialize quantization parameters for every operator,
    /// merged into one edit plan per subgraph. Tensors appear in first-touch
    /// order; each has at most one producer edit and one consumer edit per
    /// consuming op.
    pub fn generate_params(
        &mut self,
        model: &Model,
    ) -> Result<Vec<Vec<TensorTransformationParams>>> {
        let mut plans = Vec::with_capacity(model.subgraphs.len());
        for subgraph in &model.subgraphs {
            let mut plan: Vec<TensorTransformationParams> = Vec::new();
            let mut slots: HashMap<String, usize> = HashMap::new();

            for (op_index, op) in subgraph.operators.iter().enumerate() {
                if matches!(op.op, OpType::Quantize | OpType::Dequantize) {
                    continue;
                }
                let scope = op_scope_name(subgraph, op_index);
                let (algorithm, config) = self.resolver.resolve(op.op, &scope);
                if algorithm == NO_QUANT {
                    continue;
                }
                check_op_quant_config(op.op, &config)?;
                let op_info = OpInfo {
                    subgraph_op_index: op_index,
                    op_name: op.op,
                    options: op.options,
                    op_quant_config: config,
                };
                let tensor_params =
                    materialize_op(&op_info, subgraph, &model.buffers, &mut self.store)?;
                for params in tensor_params {
                    let slot = *slots.entry(params.tensor_name.clone()).or_insert_with(|| {
                        plan.push(TensorTransformationParams::new(&params.tensor_name));
                        plan.len() - 1
                    });
                    let entry = &mut plan[slot];
                    if let Some(producer) = params.producer {
                        if entry.producer.is_some() {
                            return Err(Error::AmbiguousPropagation(format!(
                                "tensor '{}' received producer edits from multiple operators",
                                params.tensor_name
                            )));
                        }
                        entry.producer = Some(producer);
                    }
                    entry.consumers.extend(params.consumers);
                }
            }
            plans.push(plan);
        }
        Ok(plans)
    }

    /// Quantize the model in place according to the loaded recipe and the
    /// accumulated calibration statistics.
    pub fn quantize(&mut self, model: &mut Model) -> Result<()> {
        let plans = self.generate_params(model)?;
        let Model { subgraphs, buffers } = model;
        for (subgraph, plan) in subgraphs.iter_mut().zip(plans) {
            apply_subgraph_plan(subgraph, buffers, plan)?;
        }
        Ok(())
    }
}

fn require_params(
    tensor_name: &str,
    edit: &OpToTensorParams,
) -> Result<UniformQuantParams> {
    edit.parameters.clone().ok_or_else(|| {
        Error::Config(format!(
            "no quantization parameters materialized for tensor '{}'",
            tensor_name
        ))
    })
}

/// A producer-side insertion applies to every consumer of the tensor,
/// including the subgraph output list.
fn all_consumer_slots(subgraph: &Subgraph, tensor_id: usize) -> Vec<i32> {
    let mut slots: Vec<i32> = subgraph
        .consumers(tensor_id)
        .into_iter()
        .map(|c| c as i32)
        .collect();
    if subgraph.outputs.contains(&(tensor_id as i32)) {
        slots.push(-1);
    }
    slots
}

/// A producer dequantize whose consumers all re-quantize with identical
/// parameters collapses to marking the tensor quantized in place.
fn cancels_to_requantize(
    subgraph: &Subgraph,
    tensor_id: usize,
    plan: &TensorTransformationParams,
) -> bool {
    let Some(producer) = &plan.producer else {
        return false;
    };
    if producer.transformations != [QuantTransformation::AddDequantize] {
        return false;
    }
    let Some(producer_params) = &producer.parameters else {
        return false;
    };
    if plan.consumers.is_empty() || subgraph.outputs.contains(&(tensor_id as i32)) {
        return false;
    }
    // Every actual consumer must participate, or an unselected one would be
    // left reading a quantized tensor it expects in float.
    let actual = subgraph.consumers(tensor_id);
    if !actual
        .iter()
        .all(|op| plan.consumers.iter().any(|c| c.subgraph_op_id == *op))
    {
        return false;
    }
    plan.consumers.iter().all(|c| {
        c.transformations == [QuantTransformation::AddQuantize]
            && c.parameters
                .as_ref()
                .is_some_and(|p| p.same_params(producer_params))
    })
}

/// Reconcile one tensor's plan into concrete edits.
fn reconcile_tensor(
    subgraph: &Subgraph,
    tensor_id: usize,
    plan: &TensorTransformationParams,
    edits: &mut Vec<Edit>,
) -> Result<()> {
    let producer_index = subgraph.producer(tensor_id).map(|i| i as i32).unwrap_or(-1);

    if cancels_to_requantize(subgraph, tensor_id, plan) {
        if let Some(producer) = &plan.producer {
            edits.push(Edit {
                tensor_id,
                transformation: QuantTransformation::QuantizeTensor,
                producer: producer_index,
                consumers: Vec::new(),
                parameters: require_params(&plan.tensor_name, producer)?,
                from_producer: true,
            });
        }
        return Ok(());
    }

    let mut tensor_edits: Vec<Edit> = Vec::new();
    if let Some(producer) = &plan.producer {
        for &transformation in &producer.transformations {
            if transformation == QuantTransformation::NoQuantize {
                continue;
            }
            tensor_edits.push(Edit {
                tensor_id,
                transformation,
                producer: producer_index,
                consumers: all_consumer_slots(subgraph, tensor_id),
                parameters: require_params(&plan.tensor_name, producer)?,
                from_producer: true,
            });
        }
    }

    // Consumers requesting identical edits share one inserted node; groups
    // with different parameters each get their own (partial rewiring).
    let mut groups: Vec<(&OpToTensorParams, Vec<i32>)> = Vec::new();
    for consumer in &plan.consumers {
        if consumer.transformations.iter().all(|&t| t == QuantTransformation::NoQuantize) {
            continue;
        }
        let matched = groups.iter_mut().find(|(head, _)| {
            head.transformations == consumer.transformations
                && match (&head.parameters, &consumer.parameters) {
                    (Some(a), Some(b)) => a.same_params(b),
                    (None, None) => true,
                    _ => false,
                }
        });
        match matched {
            Some((_, ops)) => ops.push(consumer.subgraph_op_id as i32),
            None => groups.push((consumer, vec![consumer.subgraph_op_id as i32])),
        }
    }
    for (head, ops) in groups {
        for &transformation in &head.transformations {
            if transformation == QuantTransformation::NoQuantize {
                continue;
            }
            tensor_edits.push(Edit {
                tensor_id,
                transformation,
                producer: producer_index,
                consumers: ops.clone(),
                parameters: require_params(&plan.tensor_name, head)?,
                from_producer: false,
            });
        }
    }

    // QuantizeTensor and AddDequantize both rewrite the source tensor's
    // buffer and metadata; two such edits with different parameters would
    // silently overwrite each other.
    let mutating: Vec<&Edit> = tensor_edits
        .iter()
        .filter(|e| {
            matches!(
                e.transformation,
                QuantTransformation::QuantizeTensor | QuantTransformation::AddDequantize
            )
        })
        .collect();
    if let Some(first) = mutating.first() {
        if mutating.iter().any(|e| !e.parameters.same_params(&first.parameters)) {
            return Err(Error::Config(format!(
                "conflicting quantization parameters requested for tensor '{}'",
                plan.tensor_name
            )));
        }
    }

    edits.extend(tensor_edits);
    Ok(())
}

/// Apply a subgraph's reconciled edit plan.
///
/// In-place buffer edits go first (they never move indices), then
/// insertions in ascending anchor order. Each applied insertion shifts the
/// operator indices of pending edits; the shift is reconstructed from the
/// recorded pre-edit insertion positions.
fn apply_subgraph_plan(
    subgraph: &mut Subgraph,
    buffers: &mut Vec<crate::graph::Buffer>,
    plan: Vec<TensorTransformationParams>,
) -> Result<()> {
    let name_to_id: HashMap<String, usize> = subgraph
        .tensors
        .iter()
        .enumerate()
        .map(|(i, t)| (t.name.clone(), i))
        .collect();

    let mut edits: Vec<Edit> = Vec::new();
    for tensor_plan in &plan {
        let &tensor_id = name_to_id.get(&tensor_plan.tensor_name).ok_or_else(|| {
            Error::Config(format!(
                "edit plan references unknown tensor '{}'",
                tensor_plan.tensor_name
            ))
        })?;
        reconcile_tensor(subgraph, tensor_id, tensor_plan, &mut edits)?;
    }

    let (in_place, mut insertions): (Vec<Edit>, Vec<Edit>) = edits
        .into_iter()
        .partition(|e| e.transformation == QuantTransformation::QuantizeTensor);

    for edit in &in_place {
        let input = TransformationInput {
            tensor_id: edit.tensor_id,
            producer: edit.producer,
            consumers: edit.consumers.clone(),
            parameters: edit.parameters.clone(),
        };
        quantize_tensor(&input, subgraph, buffers)?;
    }

    insertions.sort_by_key(Edit::anchor);
    let mut inserted_at: Vec<usize> = Vec::new();
    // Producer-side insertions rewire every consumer to the inserted node's
    // output; pending edits on the same tensor must read that tensor instead
    // of the original.
    let mut redirects: HashMap<usize, usize> = HashMap::new();
    let shift = |idx: usize, inserted: &[usize]| -> usize {
        idx + inserted.iter().filter(|&&p| p <= idx).count()
    };
    for edit in insertions {
        let anchor = edit.anchor();
        let source = redirects.get(&edit.tensor_id).copied().unwrap_or(edit.tensor_id);
        let input = TransformationInput {
            tensor_id: source,
            producer: if edit.producer >= 0 {
                shift(edit.producer as usize, &inserted_at) as i32
            } else {
                -1
            },
            consumers: edit
                .consumers
                .iter()
                .map(|&c| {
                    if c >= 0 {
                        shift(c as usize, &inserted_at) as i32
                    } else {
                        -1
                    }
                })
                .collect(),
            parameters: edit.parameters.clone(),
        };
        let info = match edit.transformation {
            QuantTransformation::AddQuantize => insert_quantize(&input, subgraph, buffers)?,
            QuantTransformation::AddDequantize => insert_dequantize(&input, subgraph, buffers)?,
            QuantTransformation::QuantizeTensor | QuantTransformation::NoQuantize => {
                unreachable!("partitioned out above")
            }
        };
        if edit.from_producer {
            redirects.insert(edit.tensor_id, info.output_tensor_id);
        }
        inserted_at.push(anchor);
    }
    Ok(())
}
