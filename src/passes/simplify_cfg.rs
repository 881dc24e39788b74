//! Control-flow graph simplification, iterated to a fixpoint:
//!
//! - conditional branches on constants become unconditional
//! - conditional branches with identical targets become unconditional
//! - blocks unreachable from the entry are deleted (phi inputs re-homed)
//! - a block with a single unconditional-branch predecessor is merged into
//!   it
//! - a forwarding block (nothing but `br`) is skipped by its predecessors
//!
//! Afterwards no block has a single unconditional-branch predecessor and
//! no conditional branch targets the same block twice.

use rustc_hash::FxHashSet;

use crate::analysis::AnalysisManager;
use crate::config::Config;
use crate::ir::{Module, Opcode, Ty, Value};

use super::FunctionPass;

pub struct SimplifyCfg;

impl FunctionPass for SimplifyCfg {
    fn name(&self) -> &'static str {
        "simplifycfg"
    }

    fn run(&self, m: &mut Module, func: Value, am: &mut AnalysisManager, _cfg: &Config) -> usize {
        let n = simplify_function(m, func);
        if n > 0 {
            am.cfg_changed(func);
        }
        n
    }
}

pub fn simplify_function(m: &mut Module, func: Value) -> usize {
    let mut total = 0;
    loop {
        let mut changed = 0;
        changed += fold_branches(m, func);
        changed += remove_unreachable(m, func);
        changed += merge_single_pred(m, func);
        changed += skip_forwarding_blocks(m, func);
        if changed == 0 {
            break;
        }
        total += changed;
    }
    if total > 0 {
        log::debug!("simplifycfg: {total} rewrites in @{}", m.func_name(func));
    }
    total
}

/// Constant-condition and same-target conditional branches.
fn fold_branches(m: &mut Module, func: Value) -> usize {
    let mut changed = 0;
    for &b in &m.func_blocks(func).to_vec() {
        let Some(term) = m.terminator(b) else { continue };
        if m.opcode(term) != Some(Opcode::CondBr) {
            continue;
        }
        let ops = m.operands(term);
        let (cond, t, e) = (ops[0], ops[1], ops[2]);
        let target = if t == e {
            Some(t)
        } else if let Some(c) = m.const_kind(cond) {
            let taken = if c.is_nonzero() { t } else { e };
            let dead = if c.is_nonzero() { e } else { t };
            // The edge to the untaken side disappears.
            for phi in m.phis_of(dead) {
                m.phi_remove_incoming(phi, b);
            }
            Some(taken)
        } else {
            None
        };
        let Some(target) = target else { continue };
        m.erase_inst(term);
        let br = m.create_inst(Opcode::Br, Ty::VOID, &[target]);
        m.append_inst(b, br);
        changed += 1;
    }
    changed
}

fn remove_unreachable(m: &mut Module, func: Value) -> usize {
    let blocks: Vec<Value> = m.func_blocks(func).to_vec();
    let Some(&entry) = blocks.first() else { return 0 };
    let mut reachable: FxHashSet<Value> = FxHashSet::default();
    let mut work = vec![entry];
    while let Some(b) = work.pop() {
        if !reachable.insert(b) {
            continue;
        }
        work.extend(m.succ_blocks(b));
    }
    let dead: Vec<Value> = blocks.iter().copied().filter(|b| !reachable.contains(b)).collect();
    for &b in &dead {
        for succ in m.succ_blocks(b) {
            for phi in m.phis_of(succ) {
                m.phi_remove_incoming(phi, b);
            }
        }
    }
    for &b in &dead {
        m.remove_block(b);
    }
    dead.len()
}

/// Merge `b` into its unique predecessor when that predecessor branches
/// unconditionally to `b`.
fn merge_single_pred(m: &mut Module, func: Value) -> usize {
    let mut changed = 0;
    'outer: loop {
        let blocks: Vec<Value> = m.func_blocks(func).to_vec();
        for &b in blocks.iter().skip(1) {
            let preds = m.pred_blocks(b);
            if preds.len() != 1 || preds[0] == b {
                continue;
            }
            let pred = preds[0];
            let Some(pterm) = m.terminator(pred) else { continue };
            if m.opcode(pterm) != Some(Opcode::Br) {
                continue;
            }

            // Single-predecessor phis collapse to their only input.
            for phi in m.phis_of(b) {
                let v = m.phi_incoming_for(phi, pred).expect("phi matches preds");
                // A degenerate self-reference only happens in dead cycles.
                let v = if v == phi { m.undef(m.ty(phi)) } else { v };
                m.replace_all_uses_with(phi, v);
                m.erase_inst(phi);
            }

            m.erase_inst(pterm);
            let insts: Vec<Value> = m.block_insts(b).to_vec();
            for inst in insts {
                m.unlink_inst(inst);
                m.append_inst(pred, inst);
            }
            for succ in m.succ_blocks(pred) {
                m.rehome_phi_preds(succ, b, pred);
            }
            m.remove_block(b);
            changed += 1;
            continue 'outer;
        }
        break;
    }
    changed
}

/// Redirect predecessors around blocks that only forward control.
fn skip_forwarding_blocks(m: &mut Module, func: Value) -> usize {
    let mut changed = 0;
    let blocks: Vec<Value> = m.func_blocks(func).to_vec();
    for &b in blocks.iter().skip(1) {
        let insts = m.block_insts(b);
        if insts.len() != 1 {
            continue;
        }
        let term = insts[0];
        if m.opcode(term) != Some(Opcode::Br) {
            continue;
        }
        let target = m.operands(term)[0];
        if target == b {
            continue;
        }
        let preds = m.pred_blocks(b);
        if preds.is_empty() {
            continue;
        }
        // Re-homing is only unambiguous when no predecessor already has its
        // own edge into the target.
        let target_phis = m.phis_of(target);
        if preds.iter().any(|&p| {
            target_phis.iter().any(|&phi| m.phi_incoming_for(phi, p).is_some())
        }) {
            continue;
        }

        for &p in &preds {
            let pterm = m.terminator(p).expect("predecessor has a terminator");
            let n = m.operands(pterm).len();
            for i in 0..n {
                if m.operands(pterm)[i] == b {
                    m.set_operand(pterm, i, target);
                }
            }
            for &phi in &target_phis {
                let v = m.phi_incoming_for(phi, b).expect("phi covers forwarding block");
                m.phi_add_incoming(phi, v, p);
            }
        }
        for &phi in &target_phis {
            m.phi_remove_incoming(phi, b);
        }
        // Now unreachable; the next fixpoint round deletes it.
        changed += 1;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse::parse_module;
    use crate::ir::verify::verify;

    #[test]
    fn constant_branch_folds_and_dead_arm_goes() {
        let mut m = parse_module(
            r#"
define i32 @f() {
entry:
  br i1 true, label %a, label %b
a:
  ret i32 1
b:
  ret i32 2
}
"#,
        )
        .unwrap();
        let f = m.find_function("f").unwrap();
        assert!(simplify_function(&mut m, f) >= 2);
        verify(&m).unwrap();
        // Everything merged into a straight return of 1.
        assert_eq!(m.func_blocks(f).len(), 1);
        let term = m.terminator(m.entry_block(f).unwrap()).unwrap();
        assert_eq!(m.const_kind(m.operands(term)[0]).unwrap().as_int(), Some(1));
    }

    #[test]
    fn same_target_cond_branch_becomes_unconditional() {
        let mut m = parse_module(
            r#"
define i32 @f(i1 %c) {
entry:
  br i1 %c, label %next, label %next
next:
  ret i32 0
}
"#,
        )
        .unwrap();
        let f = m.find_function("f").unwrap();
        assert!(simplify_function(&mut m, f) >= 1);
        verify(&m).unwrap();
        assert_eq!(m.func_blocks(f).len(), 1);
    }

    #[test]
    fn forwarding_block_is_skipped_with_phi_rehoming() {
        let mut m = parse_module(
            r#"
define i32 @f(i1 %c) {
entry:
  br i1 %c, label %fwd, label %b
fwd:
  br label %join
b:
  br label %join
join:
  %p = phi i32 [ 1, %fwd ], [ 2, %b ]
  ret i32 %p
}
"#,
        )
        .unwrap();
        let f = m.find_function("f").unwrap();
        assert!(simplify_function(&mut m, f) >= 1);
        verify(&m).unwrap();
        // fwd is gone; the phi now takes 1 straight from the entry. The
        // second forwarder stays because entry already has a join edge.
        assert_eq!(m.func_blocks(f).len(), 3);
        let join = *m.func_blocks(f).last().unwrap();
        let phi = m.phis_of(join)[0];
        let entry = m.entry_block(f).unwrap();
        let one = m.const_int(1);
        assert_eq!(m.phi_incoming_for(phi, entry), Some(one));
    }

    #[test]
    fn unreachable_loop_is_deleted() {
        let mut m = parse_module(
            r#"
define i32 @f() {
entry:
  ret i32 0
dead1:
  br label %dead2
dead2:
  br label %dead1
}
"#,
        )
        .unwrap();
        let f = m.find_function("f").unwrap();
        assert_eq!(simplify_function(&mut m, f), 2);
        verify(&m).unwrap();
        assert_eq!(m.func_blocks(f).len(), 1);
    }

    #[test]
    fn keeps_reachable_loops() {
        let mut m = parse_module(
            r#"
define i32 @f(i32 %n) {
entry:
  br label %head
head:
  %i = phi i32 [ 0, %entry ], [ %next, %head ]
  %next = add i32 %i, 1
  %c = icmp slt i32 %next, %n
  br i1 %c, label %head, label %exit
exit:
  ret i32 %next
}
"#,
        )
        .unwrap();
        let f = m.find_function("f").unwrap();
        simplify_function(&mut m, f);
        verify(&m).unwrap();
        assert_eq!(m.func_blocks(f).len(), 3);
    }
}
