//! Transformation passes and the pass manager.
//!
//! A pass rewrites one of three unit kinds: the module, a function, or a
//! basic block. The manager resolves an ordered list of pass names to
//! instances and runs them in sequence; passes call the analysis manager's
//! invalidation hooks themselves after transforming (nothing is invalidated
//! automatically). With `Config::debug_ir` the verifier runs between every
//! two passes; it always runs once before the module is handed downstream.

pub mod adce;
pub mod block_sort;
pub mod constfold;
pub mod dce;
pub mod dead_args;
pub mod dle;
pub mod dse;
pub mod gvn;
pub mod inline;
pub mod licm;
pub mod loop_divest;
pub mod loop_extract;
pub mod loop_interchange;
pub mod loop_parallel;
pub mod loop_simplify;
pub mod loop_split;
pub mod loop_unroll;
pub mod mem2reg;
pub mod reassociate;
pub mod reg2mem;
pub mod sccp;
pub mod scp;
pub mod simplify_cfg;
pub mod sroa;
pub mod tco;

use crate::analysis::AnalysisManager;
use crate::config::{Config, OptLevel};
use crate::error::{MidendError, Result};
use crate::ir::verify::verify;
use crate::ir::{Module, Value};

/// A module-scope transformation.
pub trait ModulePass {
    fn name(&self) -> &'static str;
    /// Returns the number of changes made.
    fn run(&self, m: &mut Module, am: &mut AnalysisManager, cfg: &Config) -> usize;
}

/// A per-function transformation. Declarations are skipped by the manager.
pub trait FunctionPass {
    fn name(&self) -> &'static str;
    fn run(&self, m: &mut Module, func: Value, am: &mut AnalysisManager, cfg: &Config) -> usize;
}

/// A per-block transformation.
pub trait BlockPass {
    fn name(&self) -> &'static str;
    fn run(&self, m: &mut Module, block: Value, am: &mut AnalysisManager, cfg: &Config) -> usize;
}

pub enum Pass {
    Module(Box<dyn ModulePass>),
    Function(Box<dyn FunctionPass>),
    Block(Box<dyn BlockPass>),
}

impl Pass {
    pub fn name(&self) -> &'static str {
        match self {
            Pass::Module(p) => p.name(),
            Pass::Function(p) => p.name(),
            Pass::Block(p) => p.name(),
        }
    }
}

pub struct PassManager {
    registry: Vec<Pass>,
}

impl PassManager {
    pub fn new() -> PassManager {
        let registry: Vec<Pass> = vec![
            Pass::Function(Box::new(mem2reg::Mem2Reg)),
            Pass::Function(Box::new(reg2mem::Reg2Mem)),
            Pass::Function(Box::new(sroa::Sroa)),
            Pass::Function(Box::new(constfold::ConstFold)),
            Pass::Function(Box::new(scp::Scp)),
            Pass::Function(Box::new(sccp::Sccp)),
            Pass::Function(Box::new(gvn::Gvn)),
            Pass::Function(Box::new(licm::Licm)),
            Pass::Function(Box::new(reassociate::Reassociate)),
            Pass::Function(Box::new(simplify_cfg::SimplifyCfg)),
            Pass::Function(Box::new(block_sort::BlockSort)),
            Pass::Function(Box::new(dce::Dce)),
            Pass::Function(Box::new(adce::Adce)),
            Pass::Block(Box::new(dse::Dse)),
            Pass::Block(Box::new(dle::Dle)),
            Pass::Module(Box::new(dead_args::DeadArgElim)),
            Pass::Function(Box::new(loop_simplify::LoopSimplify)),
            Pass::Function(Box::new(loop_divest::LoopDivest)),
            Pass::Function(Box::new(loop_unroll::LoopUnroll)),
            Pass::Function(Box::new(loop_split::LoopSplit)),
            Pass::Function(Box::new(loop_interchange::LoopInterchange)),
            Pass::Function(Box::new(loop_extract::LoopExtract)),
            Pass::Function(Box::new(loop_parallel::LoopParallel)),
            Pass::Module(Box::new(inline::Inliner)),
            Pass::Function(Box::new(tco::Tco)),
        ];
        PassManager { registry }
    }

    fn find(&self, name: &str) -> Option<&Pass> {
        self.registry.iter().find(|p| p.name() == name)
    }

    /// Run one pass by name over the whole module. Returns the change count.
    pub fn run_pass(
        &self,
        name: &str,
        m: &mut Module,
        am: &mut AnalysisManager,
        cfg: &Config,
    ) -> Result<usize> {
        let pass = self.find(name).ok_or_else(|| MidendError::UnknownPass(name.to_string()))?;
        let changes = match pass {
            Pass::Module(p) => p.run(m, am, cfg),
            Pass::Function(p) => {
                let mut total = 0;
                for func in m.defined_functions() {
                    total += p.run(m, func, am, cfg);
                }
                total
            }
            Pass::Block(p) => {
                let mut total = 0;
                for func in m.defined_functions() {
                    let blocks: Vec<Value> = m.func_blocks(func).to_vec();
                    for b in blocks {
                        total += p.run(m, b, am, cfg);
                    }
                }
                total
            }
        };
        log::debug!("pass {name}: {changes} changes");
        Ok(changes)
    }

    /// Run an ordered list of passes. With `cfg.debug_ir`, verify between
    /// passes and abort on the first violation.
    pub fn run_passes(
        &self,
        names: &[String],
        m: &mut Module,
        am: &mut AnalysisManager,
        cfg: &Config,
    ) -> Result<usize> {
        let mut total = 0;
        for name in names {
            total += self.run_pass(name, m, am, cfg)?;
            if cfg.debug_ir {
                verify(m)?;
            }
        }
        Ok(total)
    }

    /// The configured pipeline: an explicit pass list when given, otherwise
    /// the defaults for the optimization level. Iterates the scalar cleanup
    /// group to a bounded fixpoint on O2 and above, then verifies.
    pub fn run_pipeline(&self, m: &mut Module, am: &mut AnalysisManager, cfg: &Config) -> Result<()> {
        if let Some(names) = &cfg.passes {
            self.run_passes(names, m, am, cfg)?;
            verify(m)?;
            return Ok(());
        }

        let once: Vec<String> = strs(initial_passes(cfg.opt_level));
        self.run_passes(&once, m, am, cfg)?;

        if cfg.opt_level >= OptLevel::O2 {
            let group: Vec<String> = strs(fixpoint_passes(cfg.opt_level));
            for round in 0..3 {
                let changes = self.run_passes(&group, m, am, cfg)?;
                log::debug!("pipeline round {round}: {changes} changes");
                if changes == 0 {
                    break;
                }
            }
            let tail: Vec<String> = strs(final_passes(cfg.opt_level));
            self.run_passes(&tail, m, am, cfg)?;
        }

        verify(m)
    }
}

impl Default for PassManager {
    fn default() -> Self {
        Self::new()
    }
}

fn strs(v: Vec<&'static str>) -> Vec<String> {
    v.into_iter().map(String::from).collect()
}

/// Passes run once, front of the pipeline.
fn initial_passes(level: OptLevel) -> Vec<&'static str> {
    match level {
        OptLevel::O0 => vec!["mem2reg", "simplifycfg", "block-sort"],
        OptLevel::O1 => vec![
            "mem2reg",
            "simplifycfg",
            "constfold",
            "scp",
            "gvn",
            "dce",
            "simplifycfg",
            "block-sort",
        ],
        _ => vec!["sroa", "mem2reg", "inline", "mem2reg", "simplifycfg"],
    }
}

/// The scalar/loop group iterated to fixpoint on O2+.
fn fixpoint_passes(level: OptLevel) -> Vec<&'static str> {
    let mut v = vec![
        "constfold",
        "scp",
        "gvn",
        "reassociate",
        "constfold",
        "sccp",
        "simplifycfg",
        "loop-simplify",
        "licm",
        "dse",
        "dle",
        "dce",
    ];
    if level >= OptLevel::O3 {
        v.extend(["loop-divest", "loop-unroll", "loop-split", "loop-interchange"]);
        v.extend(["constfold", "gvn", "simplifycfg", "dce"]);
    }
    v
}

/// Cleanup and late interprocedural work after the fixpoint group.
fn final_passes(level: OptLevel) -> Vec<&'static str> {
    let mut v = vec!["adce", "simplifycfg", "dead-args", "tco"];
    if level >= OptLevel::O3 {
        v.extend(["loop-simplify", "loop-parallel", "simplifycfg", "dce"]);
    }
    v.push("block-sort");
    v
}
