//! Graph optimization passes for qgather.
//!
//! Provides a [`Pass`] trait, a [`PassManager`] with fixed-point iteration,
//! and the built-in passes: compressed-gather fusion, dead code elimination
//! and structural validation.

mod dce;
pub mod gather_compressed;
mod validation;

pub use dce::DeadCodeElimination;
pub use gather_compressed::{
    Candidate, CompressedGatherFusion, Encoding, FusionConfig, FusionReport, QuantLayout,
    Rejection, RewriteError, SkipFn,
};
pub use validation::GraphValidation;

use std::fmt::Debug;

use qgather_ir::Graph;

/// An optimization pass that transforms a graph.
pub trait Pass: Debug {
    /// Human-readable name of the pass.
    fn name(&self) -> &str;

    /// Run the pass on a graph. Returns `true` if anything was modified.
    fn run(&self, graph: &mut Graph) -> bool;
}

/// Optimization level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptLevel {
    /// No optimizations.
    O0,
    /// Compressed-gather fusion followed by DCE.
    O1,
    /// Same as O1, with structural validation after every iteration.
    O2,
}

/// Maximum number of fixed-point iterations before giving up.
const MAX_ITERATIONS: usize = 10;

/// Runs passes in sequence with fixed-point iteration.
#[derive(Debug)]
pub struct PassManager {
    passes: Vec<Box<dyn Pass>>,
}

impl Default for PassManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PassManager {
    /// Creates an empty pass manager with no passes.
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    /// Creates a pass manager with passes appropriate for the given level.
    pub fn for_level(level: OptLevel) -> Self {
        let mut pm = Self::new();
        match level {
            OptLevel::O0 => {}
            OptLevel::O1 => {
                pm.add_pass(Box::new(CompressedGatherFusion::default()));
                pm.add_pass(Box::new(DeadCodeElimination));
            }
            OptLevel::O2 => {
                pm.add_pass(Box::new(CompressedGatherFusion::default()));
                pm.add_pass(Box::new(DeadCodeElimination));
                pm.add_pass(Box::new(GraphValidation));
            }
        }
        pm
    }

    /// Adds a pass to the pipeline.
    pub fn add_pass(&mut self, pass: Box<dyn Pass>) {
        self.passes.push(pass);
    }

    /// Names of the registered passes, in run order.
    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Runs all passes until a fixed point is reached or the iteration limit.
    ///
    /// Returns the number of iterations that changed the graph.
    pub fn run(&self, graph: &mut Graph) -> usize {
        let mut changed_iterations = 0;
        for _ in 0..MAX_ITERATIONS {
            let mut changed = false;
            for pass in &self.passes {
                let pass_changed = pass.run(graph);
                if pass_changed {
                    log::debug!("pass '{}' modified the graph", pass.name());
                }
                changed |= pass_changed;
            }
            if !changed {
                break;
            }
            changed_iterations += 1;
        }
        changed_iterations
    }
}

/// Convenience function: runs O1 optimization passes on a graph.
pub fn optimize(graph: &mut Graph) {
    PassManager::for_level(OptLevel::O1).run(graph);
}
