//! Scalar evolution: linear forms over basic induction variables.
//!
//! An expression inside a loop nest evaluates, when the analysis succeeds,
//! to `base + Σ coeff·iv + Σ coeff·sym`, where each `iv` is a basic
//! induction phi of an enclosing loop and each `sym` is a loop-invariant
//! value the analysis cannot fold further. Symbolic parts with equal
//! handles cancel under subtraction, which is what the dependence tests
//! rely on.

use crate::ir::{Module, Opcode, Value};

use super::cfg::Cfg;
use super::indvar::IndVarInfo;
use super::loops::LoopInfo;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scev {
    pub base: i64,
    /// `(iv phi, coefficient)`, sorted by phi handle; coefficients nonzero.
    pub terms: Vec<(Value, i64)>,
    /// `(invariant value, coefficient)`, sorted; coefficients nonzero.
    pub symbols: Vec<(Value, i64)>,
}

impl Scev {
    pub fn constant(v: i64) -> Scev {
        Scev { base: v, terms: Vec::new(), symbols: Vec::new() }
    }

    pub fn symbol(v: Value) -> Scev {
        Scev { base: 0, terms: Vec::new(), symbols: vec![(v, 1)] }
    }

    pub fn iv(phi: Value) -> Scev {
        Scev { base: 0, terms: vec![(phi, 1)], symbols: Vec::new() }
    }

    pub fn is_constant(&self) -> bool {
        self.terms.is_empty() && self.symbols.is_empty()
    }

    /// Coefficient of a given induction phi (0 when absent).
    pub fn coeff_of(&self, phi: Value) -> i64 {
        self.terms.iter().find(|(p, _)| *p == phi).map_or(0, |(_, c)| *c)
    }

    pub fn add(&self, rhs: &Scev) -> Scev {
        let mut out = self.clone();
        out.base = out.base.wrapping_add(rhs.base);
        for &(v, c) in &rhs.terms {
            merge_term(&mut out.terms, v, c);
        }
        for &(v, c) in &rhs.symbols {
            merge_term(&mut out.symbols, v, c);
        }
        out
    }

    pub fn neg(&self) -> Scev {
        Scev {
            base: self.base.wrapping_neg(),
            terms: self.terms.iter().map(|&(v, c)| (v, -c)).collect(),
            symbols: self.symbols.iter().map(|&(v, c)| (v, -c)).collect(),
        }
    }

    pub fn sub(&self, rhs: &Scev) -> Scev {
        self.add(&rhs.neg())
    }

    pub fn mul_const(&self, k: i64) -> Scev {
        if k == 0 {
            return Scev::constant(0);
        }
        Scev {
            base: self.base.wrapping_mul(k),
            terms: self.terms.iter().map(|&(v, c)| (v, c * k)).collect(),
            symbols: self.symbols.iter().map(|&(v, c)| (v, c * k)).collect(),
        }
    }
}

fn merge_term(list: &mut Vec<(Value, i64)>, v: Value, c: i64) {
    match list.iter().position(|(x, _)| *x == v) {
        Some(i) => {
            list[i].1 += c;
            if list[i].1 == 0 {
                list.remove(i);
            }
        }
        None => {
            list.push((v, c));
            list.sort_by_key(|&(x, _)| x);
        }
    }
}

/// Evaluate `v` as a linear form, relative to the loop nest around
/// `within_loop`. Returns `None` for non-integer or non-linear expressions.
pub fn analyze(
    m: &Module,
    cfg: &Cfg,
    loops: &LoopInfo,
    ivs: &IndVarInfo,
    within_loop: usize,
    v: Value,
) -> Option<Scev> {
    analyze_depth(m, cfg, loops, ivs, within_loop, v, 0)
}

fn analyze_depth(
    m: &Module,
    cfg: &Cfg,
    loops: &LoopInfo,
    ivs: &IndVarInfo,
    within_loop: usize,
    v: Value,
    depth: u32,
) -> Option<Scev> {
    if depth > 16 {
        return None;
    }
    if let Some(c) = m.const_kind(v) {
        return Some(Scev::constant(c.as_int()?));
    }
    // A basic induction phi of any loop in the nest. Dominance restricts
    // what can appear here to the enclosing loops and the loops nested in
    // `within_loop`, both of which the dependence tests know how to bound.
    for li in 0..loops.loops.len() {
        if ivs.iv_for(li, v).is_some() {
            return Some(Scev::iv(v));
        }
    }
    let Some(op) = m.opcode(v) else {
        // Argument or global: symbolic.
        return Some(Scev::symbol(v));
    };
    // Instructions outside the loop are invariant symbols.
    if super::indvar::is_loop_invariant(m, cfg, &loops.loops[within_loop], v) {
        return Some(Scev::symbol(v));
    }
    let ops = m.operands(v);
    let rec = |x, d| analyze_depth(m, cfg, loops, ivs, within_loop, x, d);
    match op {
        Opcode::Add => Some(rec(ops[0], depth + 1)?.add(&rec(ops[1], depth + 1)?)),
        Opcode::Sub => Some(rec(ops[0], depth + 1)?.sub(&rec(ops[1], depth + 1)?)),
        Opcode::Mul => {
            let a = rec(ops[0], depth + 1)?;
            let b = rec(ops[1], depth + 1)?;
            if a.is_constant() {
                Some(b.mul_const(a.base))
            } else if b.is_constant() {
                Some(a.mul_const(b.base))
            } else {
                None
            }
        }
        Opcode::SExt | Opcode::ZExt | Opcode::Trunc => rec(ops[0], depth + 1),
        _ => None,
    }
}
