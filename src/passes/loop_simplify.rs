//! Loop canonicalization.
//!
//! Puts every natural loop into simplified form: a unique preheader (the
//! only out-of-loop predecessor of the header, itself single-successor), a
//! unique latch, and dedicated exit targets whose predecessors all lie in
//! the loop. All three are the same surgery — split a group of edges
//! through a fresh block, merging phi inputs on the way — applied to the
//! outside-preds of the header, the latches, and the in-loop preds of each
//! exit target. Loop passes run this first; the pass manager re-runs it
//! whenever loop structure is needed.

use crate::analysis::loops::analyze_loops;
use crate::analysis::AnalysisManager;
use crate::config::Config;
use crate::ir::{Module, Opcode, Ty, Value};

use super::FunctionPass;

pub struct LoopSimplify;

impl FunctionPass for LoopSimplify {
    fn name(&self) -> &'static str {
        "loop-simplify"
    }

    fn run(&self, m: &mut Module, func: Value, am: &mut AnalysisManager, _cfg: &Config) -> usize {
        let n = simplify_loops(m, func);
        if n > 0 {
            am.cfg_changed(func);
        }
        n
    }
}

pub fn simplify_loops(m: &mut Module, func: Value) -> usize {
    let mut changes = 0;
    // Each rewrite invalidates the loop forest; recompute and go again.
    loop {
        let (cfg, _dom, loops) = analyze_loops(m, func);
        let mut did = false;
        for l in &loops.loops {
            let header = cfg.block(l.header);

            // Unique preheader.
            let outside: Vec<Value> = cfg
                .preds
                .row(l.header)
                .iter()
                .map(|&p| p as usize)
                .filter(|p| !l.contains(*p))
                .map(|p| cfg.block(p))
                .collect();
            let needs_preheader = match l.preheader(&cfg) {
                Some(_) => false,
                None => !outside.is_empty(),
            };
            if needs_preheader {
                split_edges(m, func, header, &outside, "preheader");
                changes += 1;
                did = true;
                break;
            }

            // Unique latch.
            if l.latches.len() > 1 {
                let latches: Vec<Value> = l.latches.iter().map(|&b| cfg.block(b)).collect();
                split_edges(m, func, header, &latches, "latch");
                changes += 1;
                did = true;
                break;
            }

            // Dedicated exits.
            let mut split_exit = false;
            for t in l.exit_targets(&cfg) {
                let has_outside_pred =
                    cfg.preds.row(t).iter().any(|&p| !l.contains(p as usize));
                if !has_outside_pred {
                    continue;
                }
                let in_loop: Vec<Value> = cfg
                    .preds
                    .row(t)
                    .iter()
                    .map(|&p| p as usize)
                    .filter(|p| l.contains(*p))
                    .map(|p| cfg.block(p))
                    .collect();
                split_edges(m, func, cfg.block(t), &in_loop, "loopexit");
                changes += 1;
                split_exit = true;
                break;
            }
            if split_exit {
                did = true;
                break;
            }
        }
        if !did {
            break;
        }
    }
    if changes > 0 {
        log::debug!("loop-simplify: {changes} edge splits in @{}", m.func_name(func));
    }
    changes
}

/// Route the edges `preds -> target` through a fresh block, merging phi
/// inputs for the group into the new block. Returns the new block.
fn split_edges(
    m: &mut Module,
    func: Value,
    target: Value,
    preds: &[Value],
    name_hint: &str,
) -> Value {
    let nb = m.add_block_before(func, target);
    let name = m.fresh_name(func, name_hint);
    m.set_name(nb, name);

    for phi in m.phis_of(target) {
        let group: Vec<(Value, Value)> = m
            .phi_incoming(phi)
            .into_iter()
            .filter(|(_, p)| preds.contains(p))
            .collect();
        if group.is_empty() {
            continue;
        }
        let merged = if group.iter().all(|(v, _)| *v == group[0].0) {
            group[0].0
        } else {
            let np = m.create_inst(Opcode::Phi, m.ty(phi), &[]);
            let pname = m.fresh_name(func, "merge");
            m.set_name(np, pname);
            m.insert_inst(nb, 0, np);
            for (v, p) in &group {
                m.phi_add_incoming(np, *v, *p);
            }
            np
        };
        for (_, p) in &group {
            m.phi_remove_incoming(phi, *p);
        }
        m.phi_add_incoming(phi, merged, nb);
    }

    for &p in preds {
        let term = m.terminator(p).expect("predecessor terminated");
        let n = m.operands(term).len();
        for i in 0..n {
            if m.operands(term)[i] == target {
                m.set_operand(term, i, nb);
            }
        }
    }

    let br = m.create_inst(Opcode::Br, Ty::VOID, &[target]);
    m.append_inst(nb, br);
    nb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::loops::analyze_loops;
    use crate::ir::parse::parse_module;
    use crate::ir::verify::verify;

    #[test]
    fn inner_loop_gains_a_preheader() {
        let mut m = parse_module(
            r#"
define i32 @f(i32 %n) {
entry:
  br label %outer
outer:
  %i = phi i32 [ 0, %entry ], [ %i1, %outer_latch ]
  %c0 = icmp slt i32 %i, %n
  br i1 %c0, label %inner, label %exit
inner:
  %j = phi i32 [ 0, %outer ], [ %j1, %inner ]
  %j1 = add i32 %j, 1
  %c1 = icmp slt i32 %j1, %n
  br i1 %c1, label %inner, label %outer_latch
outer_latch:
  %i1 = add i32 %i, 1
  br label %outer
exit:
  ret i32 %i
}
"#,
        )
        .unwrap();
        let f = m.find_function("f").unwrap();
        assert!(simplify_loops(&mut m, f) > 0);
        verify(&m).unwrap();
        let (cfg, _, loops) = analyze_loops(&m, f);
        for l in &loops.loops {
            assert!(l.is_simplified(&cfg), "loop at header {} not simplified", l.header);
        }
    }

    #[test]
    fn multiple_latches_merge() {
        let mut m = parse_module(
            r#"
define i32 @f(i1 %c) {
entry:
  br label %head
head:
  %i = phi i32 [ 0, %entry ], [ %a1, %a ], [ %b1, %b ]
  br i1 %c, label %a, label %b
a:
  %a1 = add i32 %i, 1
  br label %head
b:
  %b1 = add i32 %i, 2
  br label %head
}
"#,
        )
        .unwrap();
        let f = m.find_function("f").unwrap();
        assert!(simplify_loops(&mut m, f) > 0);
        verify(&m).unwrap();
        let (cfg, _, loops) = analyze_loops(&m, f);
        assert_eq!(loops.loops.len(), 1);
        assert_eq!(loops.loops[0].latches.len(), 1);
        // The merged latch carries a phi joining the two updates.
        let latch = cfg.block(loops.loops[0].latch().unwrap());
        assert_eq!(m.phis_of(latch).len(), 1);
    }

    #[test]
    fn already_simplified_is_a_no_op() {
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
        let f = m.find_function("f").unwrap();
        assert_eq!(simplify_loops(&mut m, f), 0);
    }
}
