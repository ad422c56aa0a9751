//! Compressed-gather fusion.
//!
//! Embedding tables are often stored compressed (u8/i8/u4/i4) and
//! decompressed by a `Convert`, an optional zero-point `Subtract` and a
//! scale `Multiply` before a row lookup. This pass folds that chain and the
//! `Gather` into one [`Op::GatherCompressed`](qgather_ir::Op) node that reads
//! the compressed table directly, so the full decompressed table is never
//! materialized.
//!
//! The pass works in three steps: [`pattern`] finds candidates structurally,
//! [`validate`] checks types, shapes and sharing, and [`rewrite`] applies the
//! change. All candidates are collected before the first rewrite and each one
//! is re-checked for liveness before it is applied.

mod pattern;
mod rewrite;
mod validate;

use std::fmt;

use qgather_ir::{Graph, Node, NodeId, Scalar};

use crate::Pass;

pub use pattern::{Candidate, Dequant, Shift, ZeroPoint, match_gather, matches};
pub use rewrite::{RewriteError, rewrite};
pub use validate::{Encoding, QuantLayout, Rejection, validate};

/// Predicate vetoing the fusion of a particular `Gather` node.
pub type SkipFn = Box<dyn Fn(&Node) -> bool>;

/// Options for [`CompressedGatherFusion`].
pub struct FusionConfig {
    /// Element types accepted for the compressed weight table.
    pub weight_types: Vec<Scalar>,
    /// Returns `true` for gathers that must be left alone.
    pub skip: Option<SkipFn>,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            weight_types: vec![Scalar::U8, Scalar::I8, Scalar::U4, Scalar::I4],
            skip: None,
        }
    }
}

impl fmt::Debug for FusionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FusionConfig")
            .field("weight_types", &self.weight_types)
            .field("skip", &self.skip.as_ref().map(|_| ".."))
            .finish()
    }
}

/// Outcome of one fusion run.
#[derive(Debug, Default)]
pub struct FusionReport {
    /// Number of structurally matched gathers.
    pub matched: usize,
    /// Fused nodes created, in application order.
    pub fused: Vec<NodeId>,
    /// Gathers rejected by validation.
    pub rejected: Vec<(NodeId, Rejection)>,
    /// Gathers whose rewrite failed.
    pub failed: Vec<(NodeId, RewriteError)>,
}

impl FusionReport {
    pub fn changed(&self) -> bool {
        !self.fused.is_empty()
    }
}

/// Fuses decompress-then-gather chains into `GatherCompressed`.
#[derive(Debug, Default)]
pub struct CompressedGatherFusion {
    pub config: FusionConfig,
}

impl CompressedGatherFusion {
    pub fn new(config: FusionConfig) -> Self {
        Self { config }
    }

    /// Runs the fusion and reports what happened to every candidate.
    pub fn run_with_report(&self, graph: &mut Graph) -> FusionReport {
        let candidates: Vec<Candidate> = matches(graph).collect();
        let mut report = FusionReport {
            matched: candidates.len(),
            ..FusionReport::default()
        };

        for candidate in &candidates {
            if !candidate.is_live(graph) {
                log::trace!("candidate at {:?} went stale", candidate.gather);
                continue;
            }
            let name = graph.node(candidate.gather).name.clone();

            let layout = match validate(graph, candidate, &self.config) {
                Ok(layout) => layout,
                Err(reason) => {
                    log::debug!("gather '{name}' not fused: {reason}");
                    report.rejected.push((candidate.gather, reason));
                    continue;
                }
            };

            match rewrite(graph, candidate, &layout) {
                Ok(fused) => {
                    log::debug!(
                        "gather '{name}' fused ({:?}, {})",
                        layout.encoding,
                        layout.granularity
                    );
                    report.fused.push(fused);
                }
                Err(err) => {
                    log::error!("gather '{name}' rewrite failed: {err}");
                    report.failed.push((candidate.gather, err));
                }
            }
        }

        report
    }
}

impl Pass for CompressedGatherFusion {
    fn name(&self) -> &str {
        "compressed-gather-fusion"
    }

    fn run(&self, graph: &mut Graph) -> bool {
        self.run_with_report(graph).changed()
    }
}
