//! Quantization recipe: an ordered, regex-scoped rule table
//!
//! A recipe is a list of rules `{scope regex, operation, algorithm,
//! op config, override flag}`. Rules are matched against an operator
//! instance's scope name in insertion order; the later of two applicable
//! rules wins, with cross-algorithm overrides gated on the override flag.
//! The serialized form is a JSON array with one element per rule.

use regex::Regex;
use serde::de::value::StrDeserializer;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::Path;

use crate::error::{Error, Result};
use crate::graph::OpType;
use crate::quant::types::OpQuantConfig;

/// Sentinel algorithm: leave matched ops unquantized.
pub const NO_QUANT: &str = "no_quant";
/// Uniform min/max post-training quantization.
pub const MIN_MAX: &str = "min_max";

/// Rule target: a concrete operator or every supported operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpSelector {
    All,
    Op(OpType),
}

impl Serialize for OpSelector {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            OpSelector::All => serializer.serialize_str("*"),
            OpSelector::Op(op) => op.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for OpSelector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw == "*" {
            return Ok(OpSelector::All);
        }
        OpType::deserialize(StrDeserializer::new(raw.as_str())).map(OpSelector::Op)
    }
}

fn default_override() -> bool {
    true
}

/// One quantization rule under a scope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScopeRule {
    /// Regular expression matched (search, not full match) against the
    /// operator instance's scope name.
    pub regex: String,
    pub operation: OpSelector,
    pub algorithm_key: String,
    #[serde(default)]
    pub op_config: OpQuantConfig,
    /// Whether this rule may displace an earlier matched rule that resolved
    /// to a different algorithm. Rules sharing the algorithm always have
    /// their config applied regardless of this flag.
    #[serde(default = "default_override")]
    pub override_algorithm: bool,
}

/// Operators the min/max algorithm can materialize.
pub fn is_op_supported(algorithm_key: &str, op: OpType) -> bool {
    match algorithm_key {
        MIN_MAX => !matches!(op, OpType::Quantize | OpType::Dequantize),
        _ => false,
    }
}

#[derive(Clone, Debug)]
struct ScopeEntry {
    raw: String,
    pattern: Regex,
    rules: Vec<ScopeRule>,
}

/// Ordered rule table resolving (operator, instance scope) to an algorithm
/// and operator config.
#[derive(Clone, Debug, Default)]
pub struct RecipeResolver {
    scopes: Vec<ScopeEntry>,
}

impl RecipeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule, replacing any earlier rule for the same scope/operator.
    ///
    /// An ALL rule resets its scope: every previously registered rule under
    /// that scope is discarded. Rules referencing an operator the named
    /// algorithm cannot handle are rejected here, at load time.
    pub fn add_rule(&mut self, rule: ScopeRule) -> Result<()> {
        let pattern = Regex::new(&rule.regex)
            .map_err(|e| Error::Config(format!("invalid scope regex '{}': {e}", rule.regex)))?;

        if rule.algorithm_key != NO_QUANT {
            match rule.operation {
                OpSelector::All => {}
                OpSelector::Op(op) => {
                    if !is_op_supported(&rule.algorithm_key, op) {
                        return Err(Error::Config(format!(
                            "unsupported operation {op} for algorithm '{}'",
                            rule.algorithm_key
                        )));
                    }
                }
            }
        }

        if rule.operation == OpSelector::All {
            // Deliberate reset semantic for blanket rules.
            if let Some(entry) = self.scopes.iter_mut().find(|e| e.raw == rule.regex) {
                entry.rules = vec![rule];
            } else {
                self.scopes.push(ScopeEntry {
                    raw: rule.regex.clone(),
                    pattern,
                    rules: vec![rule],
                });
            }
            return Ok(());
        }

        match self.scopes.iter_mut().find(|e| e.raw == rule.regex) {
            None => self.scopes.push(ScopeEntry {
                raw: rule.regex.clone(),
                pattern,
                rules: vec![rule],
            }),
            Some(entry) => {
                // Replace in place to preserve rule priority order.
                match entry
                    .rules
                    .iter_mut()
                    .find(|r| r.operation == rule.operation)
                {
                    Some(existing) => *existing = rule,
                    None => entry.rules.push(rule),
                }
            }
        }
        Ok(())
    }

    /// Resolve the algorithm and config for an operator instance.
    ///
    /// Starts from the "no quantization" sentinel and walks every matching
    /// scope's rules in insertion order: the last applicable, accepted rule
    /// wins.
    pub fn resolve(&self, op: OpType, scope_name: &str) -> (String, OpQuantConfig) {
        let mut result_key = NO_QUANT.to_string();
        let mut result_config = OpQuantConfig::default();
        for entry in &self.scopes {
            if !entry.pattern.is_match(scope_name) {
                continue;
            }
            for rule in &entry.rules {
                match rule.operation {
                    OpSelector::All => {}
                    OpSelector::Op(target) if target == op => {}
                    _ => continue,
                }
                if result_key != rule.algorithm_key {
                    if rule.override_algorithm {
                        result_key = rule.algorithm_key.clone();
                    } else {
                        // The earlier algorithm stays; ignore this rule.
                        continue;
                    }
                }
                result_config = rule.op_config;
            }
        }
        (result_key, result_config)
    }

    /// The currently resolved rule set, in priority order.
    pub fn recipe(&self) -> Vec<ScopeRule> {
        self.scopes
            .iter()
            .flat_map(|entry| entry.rules.iter().cloned())
            .collect()
    }

    /// Replace the full rule set with a recipe document.
    pub fn load_recipe(&mut self, rules: Vec<ScopeRule>) -> Result<()> {
        self.scopes.clear();
        for rule in rules {
            self.add_rule(rule)?;
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.recipe())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let rules: Vec<ScopeRule> =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        let mut resolver = Self::new();
        resolver.load_recipe(rules)?;
        Ok(resolver)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}
