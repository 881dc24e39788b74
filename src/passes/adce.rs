//! Aggressive dead-code elimination.
//!
//! Liveness starts from observable effects (stores, effectful calls,
//! returns) and grows backwards through operands, phi inputs, and control
//! dependence (a live instruction keeps alive the branches its block's
//! execution depends on, via the reverse dominance frontier). Everything
//! unmarked is erased; a conditional branch that never got marked decides
//! nothing and is rewritten into an unconditional jump to its immediate
//! post-dominator, which is how empty diamonds and effect-free loops
//! disappear.

use rustc_hash::FxHashSet;

use crate::analysis::cfg::Cfg;
use crate::analysis::postdom::PostDomTree;
use crate::analysis::AnalysisManager;
use crate::config::Config;
use crate::ir::{Module, Opcode, Ty, Value};

use super::FunctionPass;

pub struct Adce;

impl FunctionPass for Adce {
    fn name(&self) -> &'static str {
        "adce"
    }

    fn run(&self, m: &mut Module, func: Value, am: &mut AnalysisManager, _cfg: &Config) -> usize {
        let se = am.side_effects(m);
        let effectful_call = |_: &Module, callee: Value| !se.no_side_effect(callee);
        let n = run_function(m, func, &effectful_call);
        if n > 0 {
            am.cfg_changed(func);
        }
        n
    }
}

pub fn run_function(
    m: &mut Module,
    func: Value,
    effectful_call: &dyn Fn(&Module, Value) -> bool,
) -> usize {
    let cfg = Cfg::build(m, func);
    let pdt = PostDomTree::build(m, func, &cfg);
    let cd = pdt.control_deps();

    // Seed with everything observably required.
    let mut live: FxHashSet<Value> = FxHashSet::default();
    let mut work: Vec<Value> = Vec::new();
    for &b in &cfg.blocks {
        for &inst in m.block_insts(b) {
            // Unconditional branches are structural: they stay regardless
            // of liveness and are not seeds.
            let keep = match m.opcode(inst) {
                Some(Opcode::Store) | Some(Opcode::Memset) | Some(Opcode::AtomicAdd) => true,
                Some(Opcode::Ret) => true,
                Some(Opcode::Call) => effectful_call(m, m.operands(inst)[0]),
                _ => false,
            };
            if keep {
                work.push(inst);
            }
        }
    }

    // Backward closure.
    while let Some(inst) = work.pop() {
        if !live.insert(inst) {
            continue;
        }
        for &op in m.operands(inst) {
            if m.value(op).is_inst() {
                work.push(op);
            }
        }
        if m.opcode(inst) == Some(Opcode::Phi) {
            for (_, pred) in m.phi_incoming(inst) {
                if let Some(t) = m.terminator(pred) {
                    work.push(t);
                }
            }
        }
        if let Some(bi) = m.inst_parent(inst).and_then(|b| cfg.index_of.get(&b).copied()) {
            for &dep in &cd[bi] {
                if let Some(t) = m.terminator(cfg.block(dep)) {
                    work.push(t);
                }
            }
        }
    }

    // Unmarked conditional branches decide nothing: forward them to the
    // immediate post-dominator. A target with phis would need new incoming
    // entries we cannot invent, so such branches are kept (and their
    // condition revived).
    let mut rewires: Vec<(usize, usize)> = Vec::new();
    let mut revived = true;
    while revived {
        revived = false;
        rewires.clear();
        for bi in 0..cfg.num_blocks() {
            let Some(term) = m.terminator(cfg.block(bi)) else { continue };
            if live.contains(&term) || m.opcode(term) != Some(Opcode::CondBr) {
                continue;
            }
            // A successor that cannot reach an exit is an intentional
            // infinite loop; deciding to skip it would change termination.
            let keeps_termination = m
                .succ_blocks(cfg.block(bi))
                .iter()
                .all(|s| pdt.is_reachable_from_exit(cfg.index(*s)));
            match pdt.ipdom(bi) {
                Some(t)
                    if keeps_termination
                        && t != pdt.virtual_exit
                        && m.phis_of(cfg.block(t)).is_empty() =>
                {
                    rewires.push((bi, t));
                }
                _ => {
                    // Keep the branch: mark it and its feeding computation.
                    work.push(term);
                    while let Some(inst) = work.pop() {
                        if !live.insert(inst) {
                            continue;
                        }
                        for &op in m.operands(inst) {
                            if m.value(op).is_inst() {
                                work.push(op);
                            }
                        }
                        if m.opcode(inst) == Some(Opcode::Phi) {
                            for (_, pred) in m.phi_incoming(inst) {
                                if let Some(t) = m.terminator(pred) {
                                    work.push(t);
                                }
                            }
                        }
                        if let Some(bi) =
                            m.inst_parent(inst).and_then(|b| cfg.index_of.get(&b).copied())
                        {
                            for &dep in &cd[bi] {
                                if let Some(t) = m.terminator(cfg.block(dep)) {
                                    work.push(t);
                                }
                            }
                        }
                    }
                    revived = true;
                }
            }
        }
    }

    let mut changes = 0;
    for &(bi, target) in &rewires {
        let b = cfg.block(bi);
        let tblock = cfg.block(target);
        let term = m.terminator(b).expect("terminator");
        // The old successors lose this predecessor.
        for succ in m.succ_blocks(b) {
            if succ != tblock {
                for phi in m.phis_of(succ) {
                    m.phi_remove_incoming(phi, b);
                }
            }
        }
        m.erase_inst(term);
        let br = m.create_inst(Opcode::Br, Ty::VOID, &[tblock]);
        m.append_inst(b, br);
        live.insert(br);
        changes += 1;
    }

    // Erase the dead remainder: drop edges first so mutually-referencing
    // dead instructions (phi cycles) detach cleanly.
    let mut dead: Vec<Value> = Vec::new();
    for &b in &cfg.blocks {
        for &inst in m.block_insts(b) {
            if !live.contains(&inst) && !m.opcode(inst).is_some_and(|o| o.is_terminator()) {
                dead.push(inst);
            }
        }
    }
    for &inst in &dead {
        m.drop_all_operands(inst);
    }
    for &inst in &dead {
        debug_assert!(m.uses(inst).is_empty(), "dead instruction used by a live one");
        m.unlink_inst(inst);
        changes += 1;
    }

    if changes > 0 {
        log::debug!("adce: {changes} rewrites in @{}", m.func_name(func));
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse::parse_module;
    use crate::ir::verify::verify;
    use crate::passes::simplify_cfg;

    fn run(m: &mut Module, name: &str) -> usize {
        let f = m.find_function(name).unwrap();
        run_function(m, f, &|_, _| true)
    }

    #[test]
    fn effect_free_loop_is_removed() {
        // while (i < n) i = i + 1;  with the result unused.
        let mut m = parse_module(
            r#"
define i32 @f(i32 %n) {
entry:
  br label %head
head:
  %i = phi i32 [ 0, %entry ], [ %next, %body ]
  %c = icmp slt i32 %i, %n
  br i1 %c, label %body, label %exit
body:
  %next = add i32 %i, 1
  br label %head
exit:
  ret i32 7
}
"#,
        )
        .unwrap();
        assert!(run(&mut m, "f") > 0);
        let f = m.find_function("f").unwrap();
        simplify_cfg::simplify_function(&mut m, f);
        verify(&m).unwrap();
        // The whole loop collapsed; only the return remains.
        assert_eq!(m.func_blocks(f).len(), 1);
        assert_eq!(m.all_insts(f).len(), 1);
    }

    #[test]
    fn loop_with_live_result_is_kept() {
        let mut m = parse_module(
            r#"
define i32 @f(i32 %n) {
entry:
  br label %head
head:
  %i = phi i32 [ 0, %entry ], [ %next, %body ]
  %c = icmp slt i32 %i, %n
  br i1 %c, label %body, label %exit
body:
  %next = add i32 %i, 1
  br label %head
exit:
  ret i32 %i
}
"#,
        )
        .unwrap();
        assert_eq!(run(&mut m, "f"), 0);
        verify(&m).unwrap();
    }

    #[test]
    fn stores_keep_their_computation() {
        let mut m = parse_module(
            r#"
@g = global i32 0

define void @f(i32 %a) {
entry:
  %x = mul i32 %a, 3
  %dead = add i32 %a, 9
  store i32 %x, i32* @g
  ret void
}
"#,
        )
        .unwrap();
        assert_eq!(run(&mut m, "f"), 1);
        verify(&m).unwrap();
        let f = m.find_function("f").unwrap();
        assert_eq!(m.all_insts(f).len(), 3);
    }

    #[test]
    fn infinite_loop_branch_is_not_rewired() {
        // No post-dominator exists for the spin block; adce must leave it.
        let mut m = parse_module(
            r#"
define i32 @f(i1 %c) {
entry:
  br i1 %c, label %spin, label %out
spin:
  br label %spin
out:
  ret i32 0
}
"#,
        )
        .unwrap();
        run(&mut m, "f");
        verify(&m).unwrap();
        let f = m.find_function("f").unwrap();
        assert_eq!(m.func_blocks(f).len(), 3);
    }
}
