//! Loop divestment: deletion of loops whose execution is unobservable.
//!
//! A simplified loop goes away when it terminates on every input, writes
//! no memory, makes no effectful calls, and none of its values are used
//! after the exit. Termination is proven from the exit condition: a
//! constant trip count, or a unit-direction bound (`<`/`<=` with positive
//! step, `>`/`>=` with negative step). Infinite loops are never touched.

use crate::analysis::cfg::Cfg;
use crate::analysis::indvar::{exit_condition, trip_count, IndVarInfo};
use crate::analysis::loops::{analyze_loops, Loop, LoopInfo};
use crate::analysis::sideeffect::SideEffects;
use crate::analysis::AnalysisManager;
use crate::config::Config;
use crate::ir::{CmpPred, Module, Value};

use super::FunctionPass;

pub struct LoopDivest;

impl FunctionPass for LoopDivest {
    fn name(&self) -> &'static str {
        "loop-divest"
    }

    fn run(&self, m: &mut Module, func: Value, am: &mut AnalysisManager, _cfg: &Config) -> usize {
        let se = am.side_effects(m);
        let mut removed = 0;
        // One loop per round; deletion reshapes the forest.
        loop {
            let (cfg, _dom, loops) = analyze_loops(m, func);
            let ivs = IndVarInfo::compute(m, &cfg, &loops);
            let candidate = loops
                .innermost_first()
                .into_iter()
                .find(|&li| deletable(m, &cfg, &loops, &ivs, &se, li));
            match candidate {
                Some(li) => {
                    delete_loop(m, &cfg, &loops.loops[li]);
                    removed += 1;
                }
                None => break,
            }
        }
        if removed > 0 {
            am.cfg_changed(func);
            log::debug!("loop-divest: deleted {removed} loops in @{}", m.func_name(func));
        }
        removed
    }
}

fn deletable(
    m: &Module,
    cfg: &Cfg,
    loops: &LoopInfo,
    ivs: &IndVarInfo,
    se: &SideEffects,
    li: usize,
) -> bool {
    let l = &loops.loops[li];
    if !l.is_simplified(cfg) || !l.subloops.is_empty() {
        return false;
    }
    if l.exits.len() != 1 || l.exit_targets(cfg).len() != 1 {
        return false;
    }
    let Some(exit) = exit_condition(m, cfg, l, &ivs.per_loop[li]) else { return false };

    // Termination proof.
    let terminates = trip_count(m, cfg, l, &ivs.per_loop[li]).is_some()
        || match (exit.pred, exit.iv.const_step(m)) {
            (CmpPred::Lt | CmpPred::Le, Some(s)) => s > 0,
            (CmpPred::Gt | CmpPred::Ge, Some(s)) => s < 0,
            _ => false,
        };
    if !terminates {
        return false;
    }

    for &bi in &l.blocks {
        for &inst in m.block_insts(cfg.block(bi)) {
            let Some(op) = m.opcode(inst) else { return false };
            if op.writes_memory() {
                return false;
            }
            if op == crate::ir::Opcode::Call && !se.no_side_effect(m.operands(inst)[0]) {
                return false;
            }
            // Results must die with the loop.
            for u in m.uses(inst) {
                match m.inst_parent(u.user).and_then(|b| cfg.index_of.get(&b)) {
                    Some(&ub) if l.contains(ub) => {}
                    _ => return false,
                }
            }
        }
    }
    true
}

fn delete_loop(m: &mut Module, cfg: &Cfg, l: &Loop) {
    let preheader = cfg.block(l.preheader(cfg).expect("simplified"));
    let header = cfg.block(l.header);
    let target = cfg.block(l.exit_targets(cfg)[0]);
    let exit_block = cfg.block(l.exits[0]);

    // The preheader jumps straight to the exit target.
    let term = m.terminator(preheader).expect("terminated preheader");
    let n = m.operands(term).len();
    for i in 0..n {
        if m.operands(term)[i] == header {
            m.set_operand(term, i, target);
        }
    }
    // Dedicated exit: its phis knew only the in-loop exit block, and their
    // values were proven loop-invariant by the outside-use check.
    m.rehome_phi_preds(target, exit_block, preheader);

    for &bi in &l.blocks {
        m.remove_block(cfg.block(bi));
    }
}
