use std::sync::Arc;

use crate::record::{IndexEntry, RecordRef};

/// Verdict of evaluating a predicate against index metadata alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredOutcome {
    /// Definitely passes; bin data need not be read.
    True,
    /// Definitely fails.
    False,
    /// Cannot be decided from metadata; evaluate against the open record.
    Unknown,
}

/// A compiled predicate expression.
pub trait Predicate: Send + Sync {
    /// Evaluates against index metadata, before the record is opened.
    fn eval_meta(&self, entry: &IndexEntry) -> PredOutcome;

    /// Evaluates against an open record, deciding `Unknown` metadata
    /// verdicts.
    fn eval_record(&self, record: &dyn RecordRef) -> bool;
}

/// Compiles the opaque predicate bytes of a request into an evaluator.
pub trait PredicateCompiler: Send + Sync {
    /// Compiles `raw`; failures reject the request as a parameter error.
    fn compile(&self, raw: &[u8]) -> anyhow::Result<Arc<dyn Predicate>>;
}
