//! Constant folding and algebraic simplification.
//!
//! Folds instructions whose operands are compile-time constants (integer
//! arithmetic wraps two's-complement) and applies the usual identities:
//! `x+0`, `x-0`, `x*1`, `x*0`, `x/1`, `x-x`, `x*2ⁿ` stays a multiply (the
//! backend strength-reduces), redundant casts, compares of equal values,
//! and constant-condition selects of branch targets are left to
//! simplifycfg. Runs to a local fixpoint via a worklist seeded with every
//! instruction.

use crate::analysis::AnalysisManager;
use crate::config::Config;
use crate::ir::builder::fold_const_cast;
use crate::ir::{CmpPred, ConstKind, Module, Opcode, Value};

use super::FunctionPass;

pub struct ConstFold;

impl FunctionPass for ConstFold {
    fn name(&self) -> &'static str {
        "constfold"
    }

    fn run(&self, m: &mut Module, func: Value, _am: &mut AnalysisManager, _cfg: &Config) -> usize {
        fold_function(m, func)
    }
}

pub fn fold_function(m: &mut Module, func: Value) -> usize {
    let mut work: Vec<Value> = m.all_insts(func);
    let mut changes = 0;
    while let Some(inst) = work.pop() {
        if m.inst_parent(inst).is_none() {
            continue;
        }
        let Some(replacement) = simplify_inst(m, inst) else { continue };
        // Users may now fold further.
        for u in m.uses(inst) {
            work.push(u.user);
        }
        m.replace_all_uses_with(inst, replacement);
        m.erase_inst(inst);
        changes += 1;
    }
    if changes > 0 {
        log::debug!("constfold: {changes} simplifications in @{}", m.func_name(func));
    }
    changes
}

/// The value this instruction simplifies to, if any.
fn simplify_inst(m: &mut Module, inst: Value) -> Option<Value> {
    let op = m.opcode(inst)?;
    let ty = m.ty(inst);
    let ops: Vec<Value> = m.operands(inst).to_vec();
    match op {
        _ if op.is_binary() => {
            let lhs = m.const_kind(ops[0]);
            let rhs = m.const_kind(ops[1]);
            if let (Some(a), Some(b)) = (lhs, rhs) {
                let folded = fold_binary(op, a, b)?;
                return Some(m.const_of(ty, folded));
            }
            simplify_identity(m, op, ty, ops[0], ops[1], lhs, rhs)
        }
        Opcode::ICmp(pred) | Opcode::FCmp(pred) => {
            if let (Some(a), Some(b)) = (m.const_kind(ops[0]), m.const_kind(ops[1])) {
                let r = fold_cmp(pred, a, b)?;
                return Some(m.const_bool(r));
            }
            // x == x / x <= x etc. on the same SSA value (int only; NaN
            // keeps float compares honest even though SysY sources rarely
            // produce one).
            if ops[0] == ops[1] && matches!(op, Opcode::ICmp(_)) {
                let r = matches!(pred, CmpPred::Eq | CmpPred::Le | CmpPred::Ge);
                return Some(m.const_bool(r));
            }
            None
        }
        Opcode::FNeg => {
            let c = m.const_kind(ops[0])?;
            let folded = match c {
                ConstKind::Float(v) => ConstKind::Float(-v),
                ConstKind::Double(v) => ConstKind::Double(-v),
                _ => return None,
            };
            Some(m.const_of(ty, folded))
        }
        _ if op.is_cast() => {
            // A cast of a constant folds; a cast to the identical type is a
            // copy.
            let from = m.ty(ops[0]);
            if from == ty {
                return Some(ops[0]);
            }
            let c = m.const_kind(ops[0])?;
            let folded = fold_const_cast(c, from, ty)?;
            Some(m.const_of(ty, folded))
        }
        Opcode::Phi => {
            // All incoming values identical (ignoring self-references).
            let mut unique = None;
            for (v, _) in m.phi_incoming(inst) {
                if v == inst {
                    continue;
                }
                match unique {
                    None => unique = Some(v),
                    Some(u) if u == v => {}
                    _ => return None,
                }
            }
            unique
        }
        _ => None,
    }
}

/// Integer arithmetic wraps; division by zero never folds.
pub fn fold_binary(op: Opcode, a: ConstKind, b: ConstKind) -> Option<ConstKind> {
    use ConstKind as C;
    match op {
        Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::SDiv | Opcode::SRem => {
            match (a, b) {
                (C::Int(x), C::Int(y)) => Some(C::Int(match op {
                    Opcode::Add => x.wrapping_add(y),
                    Opcode::Sub => x.wrapping_sub(y),
                    Opcode::Mul => x.wrapping_mul(y),
                    Opcode::SDiv => {
                        if y == 0 {
                            return None;
                        }
                        x.wrapping_div(y)
                    }
                    _ => {
                        if y == 0 {
                            return None;
                        }
                        x.wrapping_rem(y)
                    }
                })),
                (C::Int64(x), C::Int64(y)) => Some(C::Int64(match op {
                    Opcode::Add => x.wrapping_add(y),
                    Opcode::Sub => x.wrapping_sub(y),
                    Opcode::Mul => x.wrapping_mul(y),
                    Opcode::SDiv => {
                        if y == 0 {
                            return None;
                        }
                        x.wrapping_div(y)
                    }
                    _ => {
                        if y == 0 {
                            return None;
                        }
                        x.wrapping_rem(y)
                    }
                })),
                _ => None,
            }
        }
        Opcode::FAdd | Opcode::FSub | Opcode::FMul | Opcode::FDiv => {
            let x = a.as_float()?;
            let y = b.as_float()?;
            let r = match op {
                Opcode::FAdd => x + y,
                Opcode::FSub => x - y,
                Opcode::FMul => x * y,
                _ => x / y,
            };
            Some(match a {
                C::Double(_) => C::Double(r),
                _ => C::Float(r as f32),
            })
        }
        _ => None,
    }
}

pub fn fold_cmp(pred: CmpPred, a: ConstKind, b: ConstKind) -> Option<bool> {
    if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
        return Some(match pred {
            CmpPred::Eq => x == y,
            CmpPred::Ne => x != y,
            CmpPred::Gt => x > y,
            CmpPred::Ge => x >= y,
            CmpPred::Lt => x < y,
            CmpPred::Le => x <= y,
        });
    }
    let x = a.as_float()?;
    let y = b.as_float()?;
    Some(match pred {
        CmpPred::Eq => x == y,
        CmpPred::Ne => x != y,
        CmpPred::Gt => x > y,
        CmpPred::Ge => x >= y,
        CmpPred::Lt => x < y,
        CmpPred::Le => x <= y,
    })
}

/// One-constant identities.
fn simplify_identity(
    m: &mut Module,
    op: Opcode,
    ty: crate::ir::Ty,
    lhs: Value,
    rhs: Value,
    lc: Option<ConstKind>,
    rc: Option<ConstKind>,
) -> Option<Value> {
    let lzero = lc.is_some_and(|c| c.is_zero());
    let rzero = rc.is_some_and(|c| c.is_zero());
    let lone = lc.is_some_and(|c| c.is_one());
    let rone = rc.is_some_and(|c| c.is_one());
    match op {
        Opcode::Add => {
            if rzero {
                return Some(lhs);
            }
            if lzero {
                return Some(rhs);
            }
        }
        Opcode::Sub => {
            if rzero {
                return Some(lhs);
            }
            if lhs == rhs {
                return Some(m.const_zero(ty));
            }
        }
        Opcode::Mul => {
            if rone {
                return Some(lhs);
            }
            if lone {
                return Some(rhs);
            }
            if rzero || lzero {
                return Some(m.const_zero(ty));
            }
        }
        Opcode::SDiv => {
            if rone {
                return Some(lhs);
            }
            if lhs == rhs {
                // x/x only folds when x is a nonzero constant, handled in
                // fold_binary; an unknown x may be zero.
            }
        }
        Opcode::SRem => {
            if rone {
                return Some(m.const_zero(ty));
            }
        }
        // Float identities are unsafe in general (signed zero, NaN);
        // floats only fold when both operands are literal constants.
        _ => {}
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse::parse_module;
    use crate::ir::verify::verify;

    fn fold(m: &mut Module) -> usize {
        let f = m.find_function("f").unwrap();
        fold_function(m, f)
    }

    #[test]
    fn folds_constant_chains() {
        let mut m = parse_module(
            r#"
define i32 @f() {
entry:
  %a = add i32 2, 3
  %b = mul i32 %a, 4
  %c = sub i32 %b, 6
  ret i32 %c
}
"#,
        )
        .unwrap();
        assert_eq!(fold(&mut m), 3);
        verify(&m).unwrap();
        let f = m.find_function("f").unwrap();
        let term = m.terminator(m.entry_block(f).unwrap()).unwrap();
        assert_eq!(m.const_kind(m.operands(term)[0]).unwrap().as_int(), Some(14));
    }

    #[test]
    fn wraps_twos_complement() {
        let mut m = parse_module(
            r#"
define i32 @f() {
entry:
  %a = add i32 2147483647, 1
  ret i32 %a
}
"#,
        )
        .unwrap();
        fold(&mut m);
        let f = m.find_function("f").unwrap();
        let term = m.terminator(m.entry_block(f).unwrap()).unwrap();
        assert_eq!(m.const_kind(m.operands(term)[0]).unwrap().as_int(), Some(i32::MIN as i64));
    }

    #[test]
    fn applies_identities_without_constants() {
        let mut m = parse_module(
            r#"
define i32 @f(i32 %x) {
entry:
  %a = add i32 %x, 0
  %b = mul i32 %a, 1
  %c = sub i32 %b, %b
  ret i32 %c
}
"#,
        )
        .unwrap();
        assert!(fold(&mut m) >= 3);
        let f = m.find_function("f").unwrap();
        let term = m.terminator(m.entry_block(f).unwrap()).unwrap();
        assert_eq!(m.const_kind(m.operands(term)[0]).unwrap().as_int(), Some(0));
    }

    #[test]
    fn division_by_zero_does_not_fold() {
        let mut m = parse_module(
            r#"
define i32 @f() {
entry:
  %a = sdiv i32 5, 0
  ret i32 %a
}
"#,
        )
        .unwrap();
        assert_eq!(fold(&mut m), 0);
    }

    #[test]
    fn single_value_phi_collapses() {
        let mut m = parse_module(
            r#"
define i32 @f(i1 %c) {
entry:
  br i1 %c, label %a, label %b
a:
  br label %join
b:
  br label %join
join:
  %p = phi i32 [ 7, %a ], [ 7, %b ]
  ret i32 %p
}
"#,
        )
        .unwrap();
        assert_eq!(fold(&mut m), 1);
        verify(&m).unwrap();
    }
}
