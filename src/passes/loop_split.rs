//! Loop splitting by unswitching.
//!
//! A loop-invariant conditional inside a loop body tests the same thing on
//! every iteration. The loop is cloned, the preheader branches on the
//! invariant condition to the true-specialized or false-specialized copy,
//! and each copy folds its branch to one arm. simplifycfg then strips the
//! dead halves.

use rustc_hash::FxHashMap;

use crate::analysis::indvar::is_loop_invariant;
use crate::analysis::loops::analyze_loops;
use crate::analysis::AnalysisManager;
use crate::config::Config;
use crate::ir::{Module, Opcode, Ty, Value};

use super::loop_unroll::clone_region;
use super::FunctionPass;

/// Cloning doubles the region; anything bigger is not worth the code
/// growth.
const MAX_SPLIT_BLOCKS: usize = 16;

pub struct LoopSplit;

impl FunctionPass for LoopSplit {
    fn name(&self) -> &'static str {
        "loop-split"
    }

    fn run(&self, m: &mut Module, func: Value, am: &mut AnalysisManager, _cfg: &Config) -> usize {
        // One unswitch per invocation; the pipeline iterates if profitable.
        let n = unswitch_one(m, func);
        if n > 0 {
            am.cfg_changed(func);
        }
        n
    }
}

pub fn unswitch_one(m: &mut Module, func: Value) -> usize {
    let (g, _dom, loops) = analyze_loops(m, func);
    for li in loops.innermost_first() {
        let l = &loops.loops[li];
        if !l.is_simplified(&g) || l.blocks.len() > MAX_SPLIT_BLOCKS {
            continue;
        }
        // An in-loop conditional, both arms in-loop, invariant condition.
        let mut candidate = None;
        for &bi in &l.blocks {
            let b = g.block(bi);
            let Some(term) = m.terminator(b) else { continue };
            if m.opcode(term) != Some(Opcode::CondBr) {
                continue;
            }
            let ops = m.operands(term);
            let both_in = [ops[1], ops[2]]
                .iter()
                .all(|t| g.index_of.get(t).is_some_and(|&i| l.contains(i)));
            if !both_in || ops[1] == ops[2] {
                continue;
            }
            if is_loop_invariant(m, &g, l, ops[0]) && m.const_kind(ops[0]).is_none() {
                candidate = Some((b, term));
                break;
            }
        }
        let Some((branch_block, branch)) = candidate else { continue };
        let cond = m.operands(branch)[0];
        let true_bb = m.operands(branch)[1];
        let false_bb = m.operands(branch)[2];

        let preheader = g.block(l.preheader(&g).expect("simplified"));
        let header = g.block(l.header);
        let region: Vec<Value> = l.blocks.iter().map(|&bi| g.block(bi)).collect();

        let mut vmap: FxHashMap<Value, Value> = FxHashMap::default();
        clone_region(m, func, &region, &mut vmap);

        // Exit targets gain an edge from each cloned exit block.
        for &ei in &l.exits {
            let e = g.block(ei);
            for t in m.succ_blocks(e) {
                if g.index_of.get(&t).is_some_and(|&i| l.contains(i)) {
                    continue;
                }
                for phi in m.phis_of(t) {
                    if let Some(v) = m.phi_incoming_for(phi, e) {
                        let mv = vmap.get(&v).copied().unwrap_or(v);
                        m.phi_add_incoming(phi, mv, vmap[&e]);
                    }
                }
            }
        }

        // The preheader now chooses a specialization.
        let ph_term = m.terminator(preheader).expect("terminated");
        m.erase_inst(ph_term);
        let sel = m.create_inst(Opcode::CondBr, Ty::VOID, &[cond, header, vmap[&header]]);
        m.append_inst(preheader, sel);

        // Specialize: original keeps the true arm, the clone the false arm.
        specialize(m, branch_block, branch, true_bb, false_bb);
        let cloned_branch = vmap[&branch];
        let (ct, cf) = (vmap[&true_bb], vmap[&false_bb]);
        specialize(m, vmap[&branch_block], cloned_branch, cf, ct);

        log::debug!("loop-split: unswitched a loop in @{}", m.func_name(func));
        return 1;
    }
    0
}

/// Replace `branch` with an unconditional jump to `taken`, dropping the
/// phi edges into `dropped`.
fn specialize(m: &mut Module, block: Value, branch: Value, taken: Value, dropped: Value) {
    for phi in m.phis_of(dropped) {
        m.phi_remove_incoming(phi, block);
    }
    m.erase_inst(branch);
    let br = m.create_inst(Opcode::Br, Ty::VOID, &[taken]);
    m.append_inst(block, br);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse::parse_module;
    use crate::ir::verify::verify;
    use crate::passes::simplify_cfg;

    #[test]
    fn invariant_condition_splits_the_loop() {
        // while (i < n) { if (flag) a else b; i++ }
        let mut m = parse_module(
            r#"
@g = global i32 0
@h = global i32 0

define void @f(i32 %n, i1 %flag) {
entry:
  br label %head
head:
  %i = phi i32 [ 0, %entry ], [ %next, %latch ]
  %c = icmp slt i32 %i, %n
  br i1 %c, label %body, label %exit
body:
  br i1 %flag, label %a, label %b
a:
  store i32 1, i32* @g
  br label %latch
b:
  store i32 2, i32* @h
  br label %latch
latch:
  %next = add i32 %i, 1
  br label %head
exit:
  ret void
}
"#,
        )
        .unwrap();
        let f = m.find_function("f").unwrap();
        assert_eq!(unswitch_one(&mut m, f), 1);
        verify(&m).unwrap();
        simplify_cfg::simplify_function(&mut m, f);
        verify(&m).unwrap();

        // Two specialized loops now exist; one stores only to @g, the
        // other only to @h.
        let (_, _, loops) = analyze_loops(&m, f);
        assert_eq!(loops.loops.len(), 2);
        let g0 = m.globals[0];
        let h0 = m.globals[1];
        let store_targets: Vec<Value> = m
            .all_insts(f)
            .into_iter()
            .filter(|&i| m.opcode(i) == Some(Opcode::Store))
            .map(|i| m.operands(i)[1])
            .collect();
        assert!(store_targets.contains(&g0) && store_targets.contains(&h0));
        assert_eq!(store_targets.len(), 2);
    }

    #[test]
    fn variant_condition_is_left_alone() {
        let mut m = parse_module(
            r#"
@g = global i32 0

define void @f(i32 %n) {
entry:
  br label %head
head:
  %i = phi i32 [ 0, %entry ], [ %next, %latch ]
  %c = icmp slt i32 %i, %n
  br i1 %c, label %body, label %exit
body:
  %odd = srem i32 %i, 2
  %t = icmp ne i32 %odd, 0
  br i1 %t, label %a, label %latch
a:
  store i32 1, i32* @g
  br label %latch
latch:
  %next = add i32 %i, 1
  br label %head
exit:
  ret void
}
"#,
        )
        .unwrap();
        let f = m.find_function("f").unwrap();
        assert_eq!(unswitch_one(&mut m, f), 0);
    }
}
