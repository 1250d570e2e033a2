//! Weighted operation sampling on per-VU RNG streams.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::Rng;

use drill_domain::config::{OperationMixEntry, ToolTemplate};
use drill_domain::error::{Error, Result};
use drill_domain::outcome::OperationType;
use drill_transport::OperationSpec;

/// Samples mix entries proportionally to weight, and resolves `tools/call`
/// entries without an explicit tool against the configured templates.
pub struct OperationSampler {
    entries: Vec<OperationMixEntry>,
    dist: WeightedIndex<f64>,
    templates: Vec<ToolTemplate>,
}

impl OperationSampler {
    pub fn new(mix: &[OperationMixEntry], templates: &[ToolTemplate]) -> Result<Self> {
        if mix.is_empty() {
            return Err(Error::Config("operation mix is empty".into()));
        }
        let weights: Vec<f64> = mix.iter().map(|e| e.weight).collect();
        let dist = WeightedIndex::new(&weights)
            .map_err(|e| Error::Config(format!("invalid operation mix weights: {e}")))?;
        Ok(Self {
            entries: mix.to_vec(),
            dist,
            templates: templates.to_vec(),
        })
    }

    /// Draw one operation. Deterministic given the RNG state.
    pub fn sample(&self, rng: &mut StdRng) -> OperationSpec {
        let entry = &self.entries[self.dist.sample(rng)];
        let mut spec = OperationSpec::from(entry);

        // A tools/call entry without a pinned tool draws one of the
        // templates.
        if spec.op == OperationType::ToolsCall && spec.tool_name.is_none() {
            if !self.templates.is_empty() {
                let template = &self.templates[rng.gen_range(0..self.templates.len())];
                spec.tool_name = Some(template.name.clone());
                if spec.arguments.is_none() {
                    spec.arguments = Some(template.arguments.clone());
                }
            }
        }
        spec
    }
}
