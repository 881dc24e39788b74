//! Induction-variable recognition and trip-count evaluation.
//!
//! A basic induction variable of a loop is a header phi with exactly two
//! incoming values: the start from the preheader and an in-loop update of
//! the form `iv + c` or `iv - c`, where `c` is a compile-time constant or a
//! loop-invariant value. Derived inductions (`a*iv + b`) are represented in
//! `scev.rs` as linear forms over the basic ones.

use crate::ir::{CmpPred, ConstKind, Module, Opcode, Value};

use super::cfg::Cfg;
use super::loops::{Loop, LoopInfo};

#[derive(Debug, Clone)]
pub struct BasicIv {
    /// The header phi.
    pub phi: Value,
    /// Incoming value from the preheader.
    pub start: Value,
    /// The step operand of the update; constant or loop-invariant.
    pub step: Value,
    /// True when the update is `iv - step`.
    pub negated: bool,
    /// The add/sub instruction feeding the latch edge.
    pub update: Value,
}

impl BasicIv {
    /// Signed constant step, negative for `iv - c`.
    pub fn const_step(&self, m: &Module) -> Option<i64> {
        let c = m.const_kind(self.step)?.as_int()?;
        Some(if self.negated { -c } else { c })
    }

    pub fn const_start(&self, m: &Module) -> Option<i64> {
        m.const_kind(self.start)?.as_int()
    }
}

/// Basic induction variables per loop (indexed like `LoopInfo::loops`).
pub struct IndVarInfo {
    pub per_loop: Vec<Vec<BasicIv>>,
}

impl IndVarInfo {
    pub fn compute(m: &Module, cfg: &Cfg, loops: &LoopInfo) -> IndVarInfo {
        let per_loop = loops
            .loops
            .iter()
            .map(|l| find_basic_ivs(m, cfg, l))
            .collect();
        IndVarInfo { per_loop }
    }

    /// The basic IV whose phi is `v`, searching the given loop.
    pub fn iv_for(&self, loop_idx: usize, v: Value) -> Option<&BasicIv> {
        self.per_loop[loop_idx].iter().find(|iv| iv.phi == v)
    }
}

/// Is `v` defined outside the loop (constant, argument, global, or an
/// instruction in a non-member block)?
pub fn is_loop_invariant(m: &Module, cfg: &Cfg, l: &Loop, v: Value) -> bool {
    match m.inst_parent(v) {
        Some(b) => match cfg.index_of.get(&b) {
            Some(&i) => !l.contains(i),
            None => true,
        },
        // Constants, arguments, globals, functions.
        None => true,
    }
}

fn find_basic_ivs(m: &Module, cfg: &Cfg, l: &Loop) -> Vec<BasicIv> {
    let Some(preheader) = l.preheader(cfg) else { return Vec::new() };
    let Some(latch) = l.latch() else { return Vec::new() };
    let preheader_b = cfg.block(preheader);
    let latch_b = cfg.block(latch);
    let header_b = cfg.block(l.header);

    let mut ivs = Vec::new();
    for phi in m.phis_of(header_b) {
        let incoming = m.phi_incoming(phi);
        if incoming.len() != 2 {
            continue;
        }
        let Some(start) = m.phi_incoming_for(phi, preheader_b) else { continue };
        let Some(update) = m.phi_incoming_for(phi, latch_b) else { continue };
        let Some(op) = m.opcode(update) else { continue };
        if !matches!(op, Opcode::Add | Opcode::Sub) {
            continue;
        }
        // The update must live in the loop.
        match m.inst_parent(update).and_then(|b| cfg.index_of.get(&b)) {
            Some(&bi) if l.contains(bi) => {}
            _ => continue,
        }
        let ops = m.operands(update);
        let (iv_op, step, negated) = if ops[0] == phi {
            (ops[0], ops[1], op == Opcode::Sub)
        } else if ops[1] == phi && op == Opcode::Add {
            (ops[1], ops[0], false)
        } else {
            continue;
        };
        debug_assert_eq!(iv_op, phi);
        if !is_loop_invariant(m, cfg, l, step) {
            continue;
        }
        ivs.push(BasicIv { phi, start, step, negated, update });
    }
    ivs
}

/// The exit condition of a counted loop: the header terminator is a
/// conditional branch on `icmp pred iv, bound` with one in-loop and one
/// out-of-loop target and a loop-invariant bound.
pub struct ExitCond {
    pub iv: BasicIv,
    pub pred: CmpPred,
    pub bound: Value,
    pub cmp: Value,
    /// True when the branch continues the loop on a true condition.
    pub continue_on_true: bool,
}

pub fn exit_condition(m: &Module, cfg: &Cfg, l: &Loop, ivs: &[BasicIv]) -> Option<ExitCond> {
    let header_b = cfg.block(l.header);
    let term = m.terminator(header_b)?;
    if m.opcode(term) != Some(Opcode::CondBr) {
        return None;
    }
    let ops = m.operands(term);
    let (cond, t, e) = (ops[0], ops[1], ops[2]);
    let t_in = l.contains(*cfg.index_of.get(&t)?);
    let e_in = l.contains(*cfg.index_of.get(&e)?);
    if t_in == e_in {
        return None;
    }
    let pred = match m.opcode(cond)? {
        Opcode::ICmp(p) => p,
        _ => return None,
    };
    let cops = m.operands(cond);
    let (lhs, rhs) = (cops[0], cops[1]);
    let (iv, bound, mut pred) = if let Some(iv) = ivs.iter().find(|iv| iv.phi == lhs) {
        (iv.clone(), rhs, pred)
    } else if let Some(iv) = ivs.iter().find(|iv| iv.phi == rhs) {
        (iv.clone(), lhs, pred.swapped())
    } else {
        return None;
    };
    if !is_loop_invariant(m, cfg, l, bound) {
        return None;
    }
    // Normalize to "continue while pred holds".
    if !t_in {
        pred = pred.negated();
    }
    Some(ExitCond { iv, pred, bound, cmp: cond, continue_on_true: t_in })
}

/// Constant trip count of a counted loop: the number of body executions.
/// `None` when start, step, or bound are not compile-time constants, the
/// step is zero, or the form is not recognized.
pub fn trip_count(m: &Module, cfg: &Cfg, l: &Loop, ivs: &[BasicIv]) -> Option<i64> {
    let exit = exit_condition(m, cfg, l, ivs)?;
    let start = exit.iv.const_start(m)?;
    let step = exit.iv.const_step(m)?;
    let bound = match m.const_kind(exit.bound)? {
        ConstKind::Int(v) => v as i64,
        ConstKind::Int64(v) => v,
        _ => return None,
    };
    if step == 0 {
        return None;
    }
    let count = match exit.pred {
        CmpPred::Lt if step > 0 => (bound - start + step - 1).div_euclid(step),
        CmpPred::Le if step > 0 => (bound - start + step).div_euclid(step),
        CmpPred::Gt if step < 0 => (bound - start + step + 1).div_euclid(step),
        CmpPred::Ge if step < 0 => (bound - start + step).div_euclid(step),
        CmpPred::Ne if (bound - start) % step == 0 => (bound - start) / step,
        _ => return None,
    };
    Some(count.max(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::dom::DomTree;
    use crate::analysis::loops::LoopInfo;
    use crate::ir::parse::parse_module;

    fn counted_loop(cmp: &str, start: i32, step: &str, bound: i32) -> (crate::ir::Module, String) {
        let text = format!(
            r#"
define i32 @f() {{
entry:
  br label %head
head:
  %i = phi i32 [ {start}, %entry ], [ %next, %body ]
  %c = icmp {cmp} i32 %i, {bound}
  br i1 %c, label %body, label %exit
body:
  %next = {step} i32 %i, 1
  br label %head
exit:
  ret i32 %i
}}
"#
        );
        (parse_module(&text).unwrap(), text)
    }

    fn analyze(m: &crate::ir::Module) -> (Cfg, LoopInfo, IndVarInfo) {
        let f = m.find_function("f").unwrap();
        let cfg = Cfg::build(m, f);
        let dom = DomTree::build(&cfg);
        let li = LoopInfo::compute(&cfg, &dom);
        let ivs = IndVarInfo::compute(m, &cfg, &li);
        (cfg, li, ivs)
    }

    #[test]
    fn recognizes_basic_iv() {
        let (m, _) = counted_loop("slt", 0, "add", 10);
        let (cfg, li, ivs) = analyze(&m);
        assert_eq!(li.loops.len(), 1);
        let loop_ivs = &ivs.per_loop[0];
        assert_eq!(loop_ivs.len(), 1);
        let iv = &loop_ivs[0];
        assert_eq!(iv.const_start(&m), Some(0));
        assert_eq!(iv.const_step(&m), Some(1));
        assert_eq!(trip_count(&m, &cfg, &li.loops[0], loop_ivs), Some(10));
    }

    #[test]
    fn trip_counts_by_predicate() {
        for (cmp, step, bound, expect) in [
            ("slt", "add", 10, Some(10)),
            ("sle", "add", 10, Some(11)),
            ("ne", "add", 7, Some(7)),
            ("sgt", "sub", -3, None), // start 0 down to -3 needs sgt with negative step
        ] {
            let (m, _) = counted_loop(cmp, 0, step, bound);
            let (cfg, li, ivs) = analyze(&m);
            let got = trip_count(&m, &cfg, &li.loops[0], &ivs.per_loop[0]);
            if cmp == "sgt" {
                // down-count: i starts at 0, while (i > -3) i -= 1 runs 3 times
                assert_eq!(got, Some(3));
            } else {
                assert_eq!(got, expect, "cmp {cmp}");
            }
        }
    }

    #[test]
    fn non_constant_bound_has_no_trip_count() {
        let m = parse_module(
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
        let (cfg, li, ivs) = analyze(&m);
        assert_eq!(ivs.per_loop[0].len(), 1);
        assert_eq!(trip_count(&m, &cfg, &li.loops[0], &ivs.per_loop[0]), None);
        // But the exit condition is still recognized.
        assert!(exit_condition(&m, &cfg, &li.loops[0], &ivs.per_loop[0]).is_some());
    }
}
