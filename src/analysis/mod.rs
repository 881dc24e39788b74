//! On-demand, cached analyses over the module.
//!
//! Each analysis result is held behind a validity flag; getters recompute
//! stale entries and hand out shared `Rc` handles so passes can keep a
//! result while mutating the IR. There is no automatic dependency
//! tracking: passes call the invalidation hooks (`cfg_changed`,
//! `call_changed`, `induction_changed`) after transforming, and the next
//! getter recomputes.

pub mod callgraph;
pub mod cfg;
pub mod depend;
pub mod dom;
pub mod indvar;
pub mod loops;
pub mod parallel;
pub mod postdom;
pub mod scev;
pub mod sideeffect;

use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::ir::{Module, Value};

use callgraph::CallGraph;
use cfg::Cfg;
use depend::DependenceInfo;
use dom::DomTree;
use indvar::IndVarInfo;
use loops::LoopInfo;
use parallel::ParallelInfo;
use postdom::PostDomTree;
use sideeffect::SideEffects;

/// One cached result. `None` means stale; the flag flips on invalidation
/// and the data is rebuilt on the next request.
struct Cached<T> {
    data: Option<Rc<T>>,
}

impl<T> Default for Cached<T> {
    fn default() -> Self {
        Cached { data: None }
    }
}

impl<T> Cached<T> {
    fn invalidate(&mut self) {
        self.data = None;
    }

    fn get_or_insert_with(&mut self, f: impl FnOnce() -> T) -> Rc<T> {
        if self.data.is_none() {
            self.data = Some(Rc::new(f()));
        }
        self.data.as_ref().unwrap().clone()
    }
}

#[derive(Default)]
struct FuncCaches {
    cfg: Cached<Cfg>,
    dom: Cached<DomTree>,
    postdom: Cached<PostDomTree>,
    loops: Cached<LoopInfo>,
    indvar: Cached<IndVarInfo>,
    depend: Cached<DependenceInfo>,
    parallel: Cached<ParallelInfo>,
}

/// The per-module analysis cache handed to every pass.
#[derive(Default)]
pub struct AnalysisManager {
    funcs: FxHashMap<Value, FuncCaches>,
    call_graph: Cached<CallGraph>,
    side_effects: Cached<SideEffects>,
}

impl AnalysisManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, func: Value) -> &mut FuncCaches {
        self.funcs.entry(func).or_default()
    }

    // ── Getters ───────────────────────────────────────────────────────────

    pub fn cfg(&mut self, m: &Module, func: Value) -> Option<Rc<Cfg>> {
        if m.is_declaration(func) {
            return None;
        }
        Some(self.entry(func).cfg.get_or_insert_with(|| {
            log::trace!("analysis: rebuilding cfg for @{}", m.func_name(func));
            Cfg::build(m, func)
        }))
    }

    pub fn dom_tree(&mut self, m: &Module, func: Value) -> Option<Rc<DomTree>> {
        let cfg = self.cfg(m, func)?;
        Some(self.entry(func).dom.get_or_insert_with(|| DomTree::build(&cfg)))
    }

    pub fn post_dom_tree(&mut self, m: &Module, func: Value) -> Option<Rc<PostDomTree>> {
        let cfg = self.cfg(m, func)?;
        Some(self.entry(func).postdom.get_or_insert_with(|| PostDomTree::build(m, func, &cfg)))
    }

    pub fn loop_info(&mut self, m: &Module, func: Value) -> Option<Rc<LoopInfo>> {
        let cfg = self.cfg(m, func)?;
        let dom = self.dom_tree(m, func)?;
        Some(self.entry(func).loops.get_or_insert_with(|| LoopInfo::compute(&cfg, &dom)))
    }

    pub fn ind_vars(&mut self, m: &Module, func: Value) -> Option<Rc<IndVarInfo>> {
        let cfg = self.cfg(m, func)?;
        let loops = self.loop_info(m, func)?;
        Some(self.entry(func).indvar.get_or_insert_with(|| IndVarInfo::compute(m, &cfg, &loops)))
    }

    pub fn dependences(&mut self, m: &Module, func: Value) -> Option<Rc<DependenceInfo>> {
        let cfg = self.cfg(m, func)?;
        let loops = self.loop_info(m, func)?;
        let ivs = self.ind_vars(m, func)?;
        Some(
            self.entry(func)
                .depend
                .get_or_insert_with(|| DependenceInfo::compute(m, &cfg, &loops, &ivs)),
        )
    }

    pub fn call_graph(&mut self, m: &Module) -> Rc<CallGraph> {
        self.call_graph.get_or_insert_with(|| {
            log::trace!("analysis: rebuilding call graph");
            CallGraph::build(m)
        })
    }

    pub fn side_effects(&mut self, m: &Module) -> Rc<SideEffects> {
        let cg = self.call_graph(m);
        self.side_effects.get_or_insert_with(|| SideEffects::compute(m, &cg))
    }

    pub fn parallel_info(&mut self, m: &Module, func: Value) -> Option<Rc<ParallelInfo>> {
        let cfg = self.cfg(m, func)?;
        let loops = self.loop_info(m, func)?;
        let ivs = self.ind_vars(m, func)?;
        let deps = self.dependences(m, func)?;
        let cg = self.call_graph(m);
        let se = self.side_effects(m);
        Some(self.entry(func).parallel.get_or_insert_with(|| {
            ParallelInfo::compute(m, &cfg, &loops, &ivs, &deps, &se, &cg)
        }))
    }

    // ── Invalidation hooks ────────────────────────────────────────────────

    /// The function's control flow changed: dominators, post-dominators,
    /// loops, induction variables, dependences, and parallel info are stale.
    pub fn cfg_changed(&mut self, func: Value) {
        let e = self.entry(func);
        e.cfg.invalidate();
        e.dom.invalidate();
        e.postdom.invalidate();
        e.loops.invalidate();
        e.indvar.invalidate();
        e.depend.invalidate();
        e.parallel.invalidate();
    }

    /// Call sites were added or removed anywhere in the module.
    pub fn call_changed(&mut self) {
        self.call_graph.invalidate();
        self.side_effects.invalidate();
    }

    /// Induction updates were rewritten without changing the CFG.
    pub fn induction_changed(&mut self, func: Value) {
        let e = self.entry(func);
        e.indvar.invalidate();
        e.depend.invalidate();
        e.parallel.invalidate();
    }

    /// Drop everything (used after interprocedural surgery).
    pub fn invalidate_all(&mut self) {
        self.funcs.clear();
        self.call_graph.invalidate();
        self.side_effects.invalidate();
    }
}
