//! Pipeline context: explicit facts, folded from step deltas.
//!
//! Steps never mutate shared state directly. Each step returns the facts it
//! established and the driver folds them in, keeping a history of which step
//! set what. Debugging a bad build then starts from the fold log instead of
//! a debugger.

use anyhow::Result;
use std::collections::BTreeMap;

use crate::errors::BuildError;
use crate::pipeline::Step;

/// One fact established by a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextDelta {
    pub key: String,
    pub value: String,
}

impl ContextDelta {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        ContextDelta {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A fold record: which step set which fact, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedDelta {
    pub step: Step,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Default)]
pub struct PipelineContext {
    facts: BTreeMap<String, String>,
    history: Vec<AppliedDelta>,
}

impl PipelineContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a step's deltas in. Later values shadow earlier ones; the
    /// history keeps both.
    pub fn apply(&mut self, step: Step, deltas: Vec<ContextDelta>) {
        for delta in deltas {
            self.history.push(AppliedDelta {
                step,
                key: delta.key.clone(),
                value: delta.value.clone(),
            });
            self.facts.insert(delta.key, delta.value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.facts.get(key).map(String::as_str)
    }

    /// A fact an earlier step was supposed to establish.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| {
            BuildError::Config(format!("missing pipeline fact '{key}'")).into()
        })
    }

    pub fn history(&self) -> &[AppliedDelta] {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_folds_facts_and_records_history() {
        let mut ctx = PipelineContext::new();
        ctx.apply(
            Step::Download,
            vec![ContextDelta::new("base_archive", "/cache/base.zip")],
        );
        ctx.apply(
            Step::Create,
            vec![ContextDelta::new("image", "/work/base.img")],
        );

        assert_eq!(ctx.get("base_archive"), Some("/cache/base.zip"));
        assert_eq!(ctx.get("image"), Some("/work/base.img"));
        assert_eq!(ctx.history().len(), 2);
        assert_eq!(ctx.history()[0].step, Step::Download);
        assert_eq!(ctx.history()[1].key, "image");
    }

    #[test]
    fn later_facts_shadow_but_history_keeps_both() {
        let mut ctx = PipelineContext::new();
        ctx.apply(Step::Create, vec![ContextDelta::new("image", "a.img")]);
        ctx.apply(Step::Compress, vec![ContextDelta::new("image", "b.img")]);

        assert_eq!(ctx.get("image"), Some("b.img"));
        let values: Vec<&str> = ctx
            .history()
            .iter()
            .map(|d| d.value.as_str())
            .collect();
        assert_eq!(values, vec!["a.img", "b.img"]);
    }

    #[test]
    fn require_names_the_missing_fact() {
        let ctx = PipelineContext::new();
        let err = ctx.require("image").unwrap_err();
        assert!(err.to_string().contains("image"));
    }
}
