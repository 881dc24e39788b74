//! Parallel-safety analysis.
//!
//! A loop is parallelizable when its iterations can run in any order:
//! simplified counted loop, no loop-carried memory dependence, no calls
//! with observable effects, and every header phi other than the counting
//! IV is a recognized reduction (an accumulating add whose value is only
//! consumed by the accumulation itself and after the loop).

use crate::ir::{Module, Opcode, Value};

use super::callgraph::CallGraph;
use super::cfg::Cfg;
use super::depend::DependenceInfo;
use super::indvar::{exit_condition, IndVarInfo};
use super::loops::LoopInfo;
use super::sideeffect::SideEffects;

/// A scalar reduction carried by a header phi: `acc = acc + term` per
/// iteration.
#[derive(Debug, Clone)]
pub struct Reduction {
    pub phi: Value,
    /// The in-loop accumulating add.
    pub update: Value,
    /// Initial value flowing in from the preheader.
    pub init: Value,
}

#[derive(Debug, Clone)]
pub struct LoopParallelism {
    pub parallelizable: bool,
    pub reductions: Vec<Reduction>,
}

pub struct ParallelInfo {
    /// Indexed like `LoopInfo::loops`.
    pub per_loop: Vec<LoopParallelism>,
}

impl ParallelInfo {
    pub fn compute(
        m: &Module,
        cfg: &Cfg,
        loops: &LoopInfo,
        ivs: &IndVarInfo,
        deps: &DependenceInfo,
        se: &SideEffects,
        cg: &CallGraph,
    ) -> ParallelInfo {
        let per_loop = (0..loops.loops.len())
            .map(|li| analyze_loop(m, cfg, loops, ivs, deps, se, cg, li))
            .collect();
        ParallelInfo { per_loop }
    }
}

fn analyze_loop(
    m: &Module,
    cfg: &Cfg,
    loops: &LoopInfo,
    ivs: &IndVarInfo,
    deps: &DependenceInfo,
    se: &SideEffects,
    _cg: &CallGraph,
    loop_idx: usize,
) -> LoopParallelism {
    let not_parallel = LoopParallelism { parallelizable: false, reductions: Vec::new() };
    let l = &loops.loops[loop_idx];
    if !l.is_simplified(cfg) {
        return not_parallel;
    }
    let Some(exit) = exit_condition(m, cfg, l, &ivs.per_loop[loop_idx]) else {
        return not_parallel;
    };
    // Unit-step counting loop: the parallel-for runtime partitions [begin,
    // end) ranges.
    if exit.iv.const_step(m) != Some(1) {
        return not_parallel;
    }

    // Calls inside the body must be effect-free.
    for &bi in &l.blocks {
        for &inst in m.block_insts(cfg.block(bi)) {
            if m.opcode(inst) == Some(Opcode::Call) {
                let callee = m.operands(inst)[0];
                if !se.stateless(callee) {
                    return not_parallel;
                }
            }
        }
    }

    // Header phis: the counting IV, or a reduction.
    let header_b = cfg.block(l.header);
    let preheader_b = cfg.block(l.preheader(cfg).expect("simplified"));
    let latch_b = cfg.block(l.latch().expect("simplified"));
    let mut reductions = Vec::new();
    for phi in m.phis_of(header_b) {
        if phi == exit.iv.phi {
            continue;
        }
        match recognize_reduction(m, cfg, loops, loop_idx, phi, preheader_b, latch_b) {
            Some(r) => reductions.push(r),
            None => return not_parallel,
        }
    }

    // No in-loop value other than reductions may be used after the loop.
    for &bi in &l.blocks {
        for &inst in m.block_insts(cfg.block(bi)) {
            if reductions.iter().any(|r| r.phi == inst || r.update == inst) {
                continue;
            }
            for u in m.uses(inst) {
                if let Some(ub) = m.inst_parent(u.user) {
                    match cfg.index_of.get(&ub) {
                        Some(&ui) if l.contains(ui) => {}
                        _ => return not_parallel,
                    }
                }
            }
        }
    }

    if deps.has_carried(loop_idx) {
        return not_parallel;
    }

    LoopParallelism { parallelizable: true, reductions }
}

/// `phi = [init, preheader], [upd, latch]` with `upd = phi + term` (or
/// `term + phi`), where the phi feeds only the update and uses outside the
/// loop, and the update feeds only the phi and uses outside the loop.
fn recognize_reduction(
    m: &Module,
    cfg: &Cfg,
    loops: &LoopInfo,
    loop_idx: usize,
    phi: Value,
    preheader_b: Value,
    latch_b: Value,
) -> Option<Reduction> {
    let l = &loops.loops[loop_idx];
    let init = m.phi_incoming_for(phi, preheader_b)?;
    let upd = m.phi_incoming_for(phi, latch_b)?;
    let op = m.opcode(upd)?;
    if !matches!(op, Opcode::Add | Opcode::FAdd) {
        return None;
    }
    let ops = m.operands(upd);
    if ops[0] != phi && ops[1] != phi {
        return None;
    }
    let in_loop = |v: Value| match m.inst_parent(v).and_then(|b| cfg.index_of.get(&b)) {
        Some(&bi) => l.contains(bi),
        None => false,
    };
    // The phi's in-loop consumers: only the update.
    for u in m.uses(phi) {
        if in_loop(u.user) && u.user != upd {
            return None;
        }
    }
    // The update's in-loop consumers: only the phi.
    for u in m.uses(upd) {
        if in_loop(u.user) && u.user != phi {
            return None;
        }
    }
    Some(Reduction { phi, update: upd, init })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::dom::DomTree;
    use crate::ir::parse::parse_module;

    fn full_analysis(
        m: &Module,
        name: &str,
    ) -> (Cfg, LoopInfo, ParallelInfo) {
        let f = m.find_function(name).unwrap();
        let cfg = Cfg::build(m, f);
        let dom = DomTree::build(&cfg);
        let li = LoopInfo::compute(&cfg, &dom);
        let ivs = IndVarInfo::compute(m, &cfg, &li);
        let deps = DependenceInfo::compute(m, &cfg, &li, &ivs);
        let cg = CallGraph::build(m);
        let se = SideEffects::compute(m, &cg);
        let pi = ParallelInfo::compute(m, &cfg, &li, &ivs, &deps, &se, &cg);
        (cfg, li, pi)
    }

    #[test]
    fn elementwise_update_is_parallel() {
        let m = parse_module(
            r#"
@a = global [100 x i32] zeroinitializer

define void @f() {
entry:
  %base = bitcast [100 x i32]* @a to i32*
  br label %head
head:
  %i = phi i32 [ 0, %entry ], [ %next, %body ]
  %c = icmp slt i32 %i, 100
  br i1 %c, label %body, label %exit
body:
  %p = getelementptr i32, i32* %base, i32 %i
  %v = load i32, i32* %p
  %v2 = mul i32 %v, 3
  store i32 %v2, i32* %p
  %next = add i32 %i, 1
  br label %head
exit:
  ret void
}
"#,
        )
        .unwrap();
        let (_, _, pi) = full_analysis(&m, "f");
        assert!(pi.per_loop[0].parallelizable);
        assert!(pi.per_loop[0].reductions.is_empty());
    }

    #[test]
    fn sum_reduction_is_recognized() {
        let m = parse_module(
            r#"
@a = global [100 x i32] zeroinitializer

define i32 @f() {
entry:
  %base = bitcast [100 x i32]* @a to i32*
  br label %head
head:
  %i = phi i32 [ 0, %entry ], [ %next, %body ]
  %s = phi i32 [ 0, %entry ], [ %s1, %body ]
  %c = icmp slt i32 %i, 100
  br i1 %c, label %body, label %exit
body:
  %p = getelementptr i32, i32* %base, i32 %i
  %v = load i32, i32* %p
  %s1 = add i32 %s, %v
  %next = add i32 %i, 1
  br label %head
exit:
  ret i32 %s
}
"#,
        )
        .unwrap();
        let (_, _, pi) = full_analysis(&m, "f");
        assert!(pi.per_loop[0].parallelizable);
        assert_eq!(pi.per_loop[0].reductions.len(), 1);
    }

    #[test]
    fn carried_dependence_blocks_parallelism() {
        let m = parse_module(
            r#"
@a = global [100 x i32] zeroinitializer

define void @f() {
entry:
  %base = bitcast [100 x i32]* @a to i32*
  br label %head
head:
  %i = phi i32 [ 0, %entry ], [ %next, %body ]
  %c = icmp slt i32 %i, 99
  br i1 %c, label %body, label %exit
body:
  %p = getelementptr i32, i32* %base, i32 %i
  %v = load i32, i32* %p
  %i1 = add i32 %i, 1
  %q = getelementptr i32, i32* %base, i32 %i1
  store i32 %v, i32* %q
  %next = add i32 %i, 1
  br label %head
exit:
  ret void
}
"#,
        )
        .unwrap();
        let (_, _, pi) = full_analysis(&m, "f");
        assert!(!pi.per_loop[0].parallelizable);
    }
}
