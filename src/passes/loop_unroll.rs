//! Loop unrolling.
//!
//! Counted loops that test their bound in the header (header = phis +
//! compare + branch, exit only from the header, no nested loops) are
//! fully unrolled when the constant trip count fits the configured
//! threshold, and otherwise partially unrolled by the largest configured
//! factor that divides the trip count. Header phis are threaded through
//! the cloned iterations; the remaining uses after the loop are rebound to
//! the final iteration's values.

use rustc_hash::FxHashMap;

use crate::analysis::cfg::Cfg;
use crate::analysis::indvar::{trip_count, IndVarInfo};
use crate::analysis::loops::{analyze_loops, Loop};
use crate::analysis::AnalysisManager;
use crate::config::Config;
use crate::ir::{Module, Opcode, Value, ValueKind};

use super::FunctionPass;

pub struct LoopUnroll;

impl FunctionPass for LoopUnroll {
    fn name(&self) -> &'static str {
        "loop-unroll"
    }

    fn run(&self, m: &mut Module, func: Value, am: &mut AnalysisManager, cfg: &Config) -> usize {
        // Unrolling only understands simplified loops; normalize first.
        if super::loop_simplify::simplify_loops(m, func) > 0 {
            am.cfg_changed(func);
        }
        let mut unrolled = 0;
        loop {
            let (g, _dom, loops) = analyze_loops(m, func);
            let ivs = IndVarInfo::compute(m, &g, &loops);
            let mut did = false;
            for li in loops.innermost_first() {
                let l = &loops.loops[li];
                if !unrollable(m, &g, l) {
                    continue;
                }
                let Some(n) = trip_count(m, &g, l, &ivs.per_loop[li]) else { continue };
                if n < 0 {
                    continue;
                }
                if n as u32 <= cfg.unroll_full_threshold {
                    full_unroll(m, func, &g, l, n as usize);
                    unrolled += 1;
                    did = true;
                    break;
                }
                // Partial: the largest configured factor dividing the trip
                // count; a non-dividing count would need a remainder loop,
                // and with a constant count the divisible case covers it.
                let factor = (2..=cfg.unroll_factor as i64)
                    .rev()
                    .find(|f| n % f == 0);
                if let Some(f) = factor {
                    partial_unroll(m, func, &g, l, f as usize);
                    unrolled += 1;
                    did = true;
                    break;
                }
            }
            if !did {
                break;
            }
        }
        if unrolled > 0 {
            am.cfg_changed(func);
            log::debug!("loop-unroll: rewrote {unrolled} loops in @{}", m.func_name(func));
        }
        unrolled
    }
}

/// Shape requirements beyond simplified form: the header holds only phis,
/// the exit compare, and the branch; the only exit is the header; nothing
/// nests inside.
fn unrollable(m: &Module, g: &Cfg, l: &Loop) -> bool {
    if !l.is_simplified(g) || !l.subloops.is_empty() {
        return false;
    }
    if l.exits.len() != 1 || l.exits[0] != l.header || l.exit_targets(g).len() != 1 {
        return false;
    }
    let header = g.block(l.header);
    let insts = m.block_insts(header);
    let tail: Vec<Value> = insts
        .iter()
        .copied()
        .skip_while(|&i| m.opcode(i) == Some(Opcode::Phi))
        .collect();
    matches!(
        tail.as_slice(),
        [cmp, term]
            if m.opcode(*cmp).is_some_and(|o| o.is_cmp())
                && m.opcode(*term) == Some(Opcode::CondBr)
    )
}

/// Two-phase region clone: all instructions are created first (so forward
/// references within the region resolve), then operands are filled through
/// the map. `vmap` arrives seeded with external substitutions (header phis
/// to their current values) and leaves holding every cloned value.
pub(crate) fn clone_region(
    m: &mut Module,
    func: Value,
    region: &[Value],
    vmap: &mut FxHashMap<Value, Value>,
) -> Vec<Value> {
    let mut new_blocks = Vec::with_capacity(region.len());
    for &b in region {
        let nb = m.add_block(func);
        if let Some(n) = m.value(b).name.clone() {
            let fresh = m.fresh_name(func, &format!("{n}.u"));
            m.set_name(nb, fresh);
        }
        vmap.insert(b, nb);
        new_blocks.push(nb);
    }
    let mut cloned: Vec<(Value, Value)> = Vec::new();
    for (&b, &nb) in region.iter().zip(&new_blocks) {
        for &inst in &m.block_insts(b).to_vec() {
            let data = m.value(inst);
            let (op, ty) = match &data.kind {
                ValueKind::Inst(i) => (i.op, data.ty),
                _ => continue,
            };
            let name = data.name.clone();
            let ni = m.create_inst(op, ty, &[]);
            if let Some(n) = name {
                m.set_name(ni, n);
            }
            m.append_inst(nb, ni);
            vmap.insert(inst, ni);
            cloned.push((inst, ni));
        }
    }
    for (old, new) in cloned {
        for &o in &m.operands(old).to_vec() {
            let mapped = vmap.get(&o).copied().unwrap_or(o);
            m.add_operand(new, mapped);
        }
    }
    new_blocks
}

struct LoopShape {
    preheader: Value,
    header: Value,
    latch: Value,
    exit_target: Value,
    /// Body region (everything but the header), latch included.
    body: Vec<Value>,
    body_entry: Value,
    phis: Vec<Value>,
    /// Latch-incoming value per phi.
    latch_in: Vec<Value>,
}

fn shape_of(m: &Module, g: &Cfg, l: &Loop) -> LoopShape {
    let header = g.block(l.header);
    let latch = g.block(l.latch().expect("simplified"));
    let preheader = g.block(l.preheader(g).expect("simplified"));
    let exit_target = g.block(l.exit_targets(g)[0]);
    let body: Vec<Value> = l
        .blocks
        .iter()
        .copied()
        .filter(|&b| b != l.header)
        .map(|b| g.block(b))
        .collect();
    let term = m.terminator(header).expect("header branch");
    let ops = m.operands(term);
    let body_entry = if g.index_of.get(&ops[1]).is_some_and(|&i| l.contains(i)) {
        ops[1]
    } else {
        ops[2]
    };
    let phis = m.phis_of(header);
    let latch_in =
        phis.iter().map(|&p| m.phi_incoming_for(p, latch).expect("latch edge")).collect();
    LoopShape { preheader, header, latch, exit_target, body, body_entry, phis, latch_in }
}

fn retarget(m: &mut Module, block: Value, from: Value, to: Value) {
    let term = m.terminator(block).expect("terminated");
    let n = m.operands(term).len();
    for i in 0..n {
        if m.operands(term)[i] == from {
            m.set_operand(term, i, to);
        }
    }
}

fn full_unroll(m: &mut Module, func: Value, g: &Cfg, l: &Loop, n: usize) {
    let s = shape_of(m, g, l);

    // Current value of each header phi entering the next iteration.
    let mut cur: Vec<Value> =
        s.phis.iter().map(|&p| m.phi_incoming_for(p, s.preheader).expect("preheader edge")).collect();

    let mut prev_block = s.preheader;
    for _ in 0..n {
        let mut vmap: FxHashMap<Value, Value> = FxHashMap::default();
        for (&p, &c) in s.phis.iter().zip(&cur) {
            vmap.insert(p, c);
        }
        clone_region(m, func, &s.body, &mut vmap);

        // The previous block (preheader or the prior latch clone) still
        // points at the original header; send it into this copy instead,
        // and re-home any body-entry phis that named the header.
        let entry_clone = vmap[&s.body_entry];
        m.rehome_phi_preds(entry_clone, s.header, prev_block);
        retarget(m, prev_block, s.header, entry_clone);

        let latch_clone = vmap[&s.latch];
        cur = s.latch_in.iter().map(|v| vmap.get(v).copied().unwrap_or(*v)).collect();
        prev_block = latch_clone;
    }

    // The final latch (or the preheader when n == 0) continues past the
    // loop.
    retarget(m, prev_block, s.header, s.exit_target);
    m.rehome_phi_preds(s.exit_target, s.header, prev_block);

    // Values observed after the loop are the phi values at exit.
    for (&p, &c) in s.phis.iter().zip(&cur) {
        m.replace_all_uses_with(p, c);
    }

    m.remove_block(s.header);
    for &b in &s.body {
        m.remove_block(b);
    }
}

fn partial_unroll(m: &mut Module, func: Value, g: &Cfg, l: &Loop, factor: usize) {
    let s = shape_of(m, g, l);

    // Step values entering each extra copy; starts as the original latch
    // values. The originals stay pristine while cloning, so the chain
    // links are recorded first and wired afterwards.
    let mut cur: Vec<Value> = s.latch_in.clone();
    let mut prev_latch = s.latch;
    let mut links: Vec<(Value, Value)> = Vec::new();
    for _ in 1..factor {
        let mut vmap: FxHashMap<Value, Value> = FxHashMap::default();
        for (&p, &c) in s.phis.iter().zip(&cur) {
            vmap.insert(p, c);
        }
        clone_region(m, func, &s.body, &mut vmap);

        let entry_clone = vmap[&s.body_entry];
        m.rehome_phi_preds(entry_clone, s.header, prev_latch);
        links.push((prev_latch, entry_clone));
        prev_latch = vmap[&s.latch];
        cur = cur.iter().map(|v| vmap.get(v).copied().unwrap_or(*v)).collect();
    }
    for (from, to) in links {
        retarget(m, from, s.header, to);
    }

    // Close the widened loop: back edge from the last copy, and the header
    // phis take the stepped values from it.
    for (&p, &c) in s.phis.iter().zip(&cur) {
        let latch_pos = m
            .phi_incoming(p)
            .iter()
            .position(|&(_, blk)| blk == s.latch)
            .expect("latch edge");
        m.set_operand(p, latch_pos * 2, c);
    }
    m.rehome_phi_preds(s.header, s.latch, prev_latch);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisManager;
    use crate::ir::parse::parse_module;
    use crate::ir::verify::verify;
    use crate::passes::{constfold, FunctionPass};

    const SUM10: &str = r#"
define i32 @f() {
entry:
  br label %head
head:
  %i = phi i32 [ 0, %entry ], [ %next, %body ]
  %s = phi i32 [ 0, %entry ], [ %s1, %body ]
  %c = icmp slt i32 %i, 10
  br i1 %c, label %body, label %exit
body:
  %s1 = add i32 %s, %i
  %next = add i32 %i, 1
  br label %head
exit:
  ret i32 %s
}
"#;

    fn unroll(m: &mut Module, full: u32, factor: u32) -> usize {
        let f = m.find_function("f").unwrap();
        let mut am = AnalysisManager::new();
        let cfg = Config {
            unroll_full_threshold: full,
            unroll_factor: factor,
            ..Config::default()
        };
        LoopUnroll.run(m, f, &mut am, &cfg)
    }

    #[test]
    fn full_unroll_folds_to_constant() {
        let mut m = parse_module(SUM10).unwrap();
        assert_eq!(unroll(&mut m, 16, 4), 1);
        verify(&m).unwrap();
        let f = m.find_function("f").unwrap();
        // No loop remains.
        let (_, _, loops) = analyze_loops(&m, f);
        assert!(loops.is_empty());
        // Folding the straight-line chain yields 0+1+...+9 = 45.
        constfold::fold_function(&mut m, f);
        let ret_block = *m.func_blocks(f).last().unwrap();
        let term = m.terminator(ret_block).unwrap();
        assert_eq!(m.const_kind(m.operands(term)[0]).unwrap().as_int(), Some(45));
    }

    #[test]
    fn partial_unroll_by_dividing_factor() {
        let mut m = parse_module(SUM10).unwrap();
        // Threshold too small for full unroll; 10 % 2 == 0 picks factor 2.
        assert_eq!(unroll(&mut m, 4, 3), 1);
        verify(&m).unwrap();
        let f = m.find_function("f").unwrap();
        let (_, _, loops) = analyze_loops(&m, f);
        assert_eq!(loops.loops.len(), 1);
        // Two body copies inside the loop now.
        let adds = m
            .all_insts(f)
            .iter()
            .filter(|&&i| m.opcode(i) == Some(Opcode::Add))
            .count();
        assert_eq!(adds, 4);
    }

    #[test]
    fn zero_trip_loop_vanishes() {
        let mut m = parse_module(
            r#"
define i32 @f() {
entry:
  br label %head
head:
  %i = phi i32 [ 5, %entry ], [ %next, %body ]
  %c = icmp slt i32 %i, 5
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
        assert_eq!(unroll(&mut m, 16, 4), 1);
        verify(&m).unwrap();
        let f = m.find_function("f").unwrap();
        // The exit value is the untouched start.
        let ret_block = *m.func_blocks(f).last().unwrap();
        let term = m.terminator(ret_block).unwrap();
        assert_eq!(m.const_kind(m.operands(term)[0]).unwrap().as_int(), Some(5));
    }

    #[test]
    fn unknown_trip_count_is_left_alone() {
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
        assert_eq!(unroll(&mut m, 16, 4), 0);
    }
}
