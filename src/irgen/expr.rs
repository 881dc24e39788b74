//! Expression lowering and compile-time constant evaluation.

use crate::ast::{BinOp, Expr, LVal, Span, UnaryOp};
use crate::error::{MidendError, Result};
use crate::ir::{BinaryOp, CmpPred, ConstKind, Ty, Value};

use super::{IrGen, Symbol};

/// What an lvalue lowers to.
pub(crate) enum Place {
    /// Address of a scalar element; load for rvalue use.
    Addr(Value),
    /// Partially-indexed array, decayed to an element pointer (argument
    /// passing).
    ArrayPtr(Value),
    /// A folded constant (const scalar, or const array at const indices).
    Folded(ConstKind, Ty),
}

impl<'m> IrGen<'m> {
    // ── Constant evaluation ───────────────────────────────────────────────

    pub(crate) fn eval_const(&mut self, e: &Expr) -> Result<ConstKind> {
        let err = |span: Span| {
            MidendError::type_error("expression is not a compile-time constant", span.line, span.col)
        };
        match e {
            Expr::IntLit(v, _) => Ok(ConstKind::Int(*v)),
            Expr::FloatLit(v, _) => Ok(ConstKind::Float(*v)),
            Expr::LVal(lv) => self.eval_const_lval(lv).ok_or_else(|| err(lv.span)),
            Expr::Unary { op, operand, span } => {
                let v = self.eval_const(operand)?;
                const_unary(*op, v).ok_or_else(|| err(*span))
            }
            Expr::Binary { op, lhs, rhs, span } => {
                let a = self.eval_const(lhs)?;
                let b = self.eval_const(rhs)?;
                const_binary(*op, a, b).ok_or_else(|| {
                    MidendError::type_error(
                        "constant expression does not evaluate (division by zero?)",
                        span.line,
                        span.col,
                    )
                })
            }
            Expr::Call { span, .. } => Err(err(*span)),
        }
    }

    fn eval_const_lval(&mut self, lv: &LVal) -> Option<ConstKind> {
        // Clone out of the scope map so the borrow does not pin `self`.
        let sym = self.lookup(&lv.name)?.clone();
        match sym {
            Symbol::Const(c) => {
                if lv.indices.is_empty() {
                    Some(c)
                } else {
                    None
                }
            }
            Symbol::Var(v) => {
                let data = v.const_data.as_ref()?;
                if lv.indices.len() != v.dims.len() {
                    return None;
                }
                let mut flat = 0usize;
                for (i, idx) in lv.indices.iter().enumerate() {
                    let c = self.eval_const(idx).ok()?.as_int()?;
                    if c < 0 || c as usize >= v.dims[i] {
                        return None;
                    }
                    let stride: usize = v.dims[i + 1..].iter().product();
                    flat += c as usize * stride;
                }
                data.get(flat).copied()
            }
        }
    }

    /// Fold to a constant and coerce to the target scalar type.
    pub(crate) fn eval_const_as(&mut self, e: &Expr, ty: Ty) -> Result<ConstKind> {
        let c = self.eval_const(e)?;
        coerce_const(c, ty).ok_or_else(|| {
            MidendError::type_error("constant has the wrong type", e.span().line, e.span().col)
        })
    }

    // ── Rvalue lowering ───────────────────────────────────────────────────

    pub(crate) fn lower_expr(&mut self, e: &Expr) -> Result<Value> {
        match e {
            Expr::IntLit(v, _) => Ok(self.b.module.const_int(*v)),
            Expr::FloatLit(v, _) => Ok(self.b.module.const_float(*v)),
            Expr::LVal(lv) => match self.lower_lval(lv)? {
                Place::Addr(a) => Ok(self.b.make_load(a)),
                Place::ArrayPtr(p) => Ok(p),
                Place::Folded(c, ty) => Ok(self.b.module.const_of(ty, c)),
            },
            Expr::Unary { op, operand, .. } => match op {
                UnaryOp::Pos => self.lower_expr(operand),
                UnaryOp::Neg => {
                    let v = self.lower_expr(operand)?;
                    if self.b.module.types.is_float(self.b.module.ty(v)) {
                        Ok(self.b.make_fneg(v))
                    } else {
                        let zero = self.b.module.const_int(0);
                        self.b.make_binary(BinaryOp::Sub, zero, v)
                    }
                }
                UnaryOp::Not => {
                    // `!x` is int 0/1 in value position.
                    let v = self.lower_expr(operand)?;
                    let ty = self.b.module.ty(v);
                    let zero = self.b.module.const_zero(ty);
                    let c = self.b.make_cmp(CmpPred::Eq, v, zero)?;
                    self.b.promote(c, Ty::I32)
                }
            },
            Expr::Binary { op, lhs, rhs, span } => match op {
                BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => {
                    let l = self.lower_expr(lhs)?;
                    let r = self.lower_expr(rhs)?;
                    let bop = match op {
                        BinOp::Add => BinaryOp::Add,
                        BinOp::Sub => BinaryOp::Sub,
                        BinOp::Mul => BinaryOp::Mul,
                        BinOp::Div => BinaryOp::Div,
                        _ => BinaryOp::Rem,
                    };
                    self.b.make_binary(bop, l, r)
                }
                BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Eq | BinOp::Ne => {
                    let l = self.lower_expr(lhs)?;
                    let r = self.lower_expr(rhs)?;
                    let pred = cmp_pred_of(*op);
                    let c = self.b.make_cmp(pred, l, r)?;
                    self.b.promote(c, Ty::I32)
                }
                BinOp::And | BinOp::Or => self.lower_logic_value(e, *span),
            },
            Expr::Call { name, args, span } => self.lower_call(name, args, *span),
        }
    }

    /// `a && b` / `a || b` in value position: lower as control flow and
    /// merge 1/0 with a phi.
    fn lower_logic_value(&mut self, e: &Expr, _span: Span) -> Result<Value> {
        let n = self.b.next_rhs();
        let true_bb = self.b.new_block(&format!("land.true{n}"));
        let false_bb = self.b.new_block(&format!("land.false{n}"));
        let merge = self.b.new_block(&format!("land.end{n}"));

        self.b.push_tf(true_bb, false_bb);
        self.lower_cond(e)?;
        self.b.pop_tf();

        self.b.set_insert_end(true_bb);
        self.b.make_br(merge);
        self.b.set_insert_end(false_bb);
        self.b.make_br(merge);

        self.b.set_insert_end(merge);
        let phi = self.b.make_phi(Ty::I32);
        let one = self.b.module.const_int(1);
        let zero = self.b.module.const_int(0);
        self.b.module.phi_add_incoming(phi, one, true_bb);
        self.b.module.phi_add_incoming(phi, zero, false_bb);
        Ok(phi)
    }

    fn lower_call(&mut self, name: &str, args: &[Expr], span: Span) -> Result<Value> {
        let Some(callee) = self.b.module.find_function(name) else {
            return Err(MidendError::type_error(
                format!("call to undeclared function '{name}'"),
                span.line,
                span.col,
            ));
        };
        let params: Vec<Ty> =
            self.b.module.types.fn_params(self.b.module.ty(callee)).unwrap_or(&[]).to_vec();
        if params.len() != args.len() {
            return Err(MidendError::type_error(
                format!("'{name}' expects {} arguments, got {}", params.len(), args.len()),
                span.line,
                span.col,
            ));
        }
        let mut lowered = Vec::with_capacity(args.len());
        for (a, &pty) in args.iter().zip(&params) {
            let v = self.lower_expr(a)?;
            let vty = self.b.module.ty(v);
            let v = if self.b.module.types.is_pointer(pty) {
                if vty != pty {
                    return Err(MidendError::type_error(
                        format!("array argument shape mismatch for '{name}'"),
                        a.span().line,
                        a.span().col,
                    ));
                }
                v
            } else {
                self.b.promote(v, pty)?
            };
            lowered.push(v);
        }
        Ok(self.b.make_call(callee, &lowered))
    }

    // ── Lvalue addressing ─────────────────────────────────────────────────

    pub(crate) fn lower_lval(&mut self, lv: &LVal) -> Result<Place> {
        // Const-fold first (const scalars and fully const-indexed const
        // arrays never touch memory).
        if let Some(c) = self.eval_const_lval(lv) {
            let sym = self.lookup(&lv.name).cloned();
            let ty = match sym {
                Some(Symbol::Var(v)) => v.elem_ty,
                Some(Symbol::Const(ConstKind::Float(_))) => Ty::F32,
                _ => Ty::I32,
            };
            let c = coerce_const(c, ty).unwrap_or(c);
            return Ok(Place::Folded(c, ty));
        }

        let Some(sym) = self.lookup(&lv.name).cloned() else {
            return Err(MidendError::type_error(
                format!("use of undeclared identifier '{}'", lv.name),
                lv.span.line,
                lv.span.col,
            ));
        };
        let var = match sym {
            Symbol::Const(_) => {
                return Err(MidendError::type_error(
                    format!("'{}' is not addressable", lv.name),
                    lv.span.line,
                    lv.span.col,
                ));
            }
            Symbol::Var(v) => v,
        };

        if var.dims.is_empty() {
            if !lv.indices.is_empty() {
                return Err(MidendError::type_error(
                    format!("'{}' is not an array", lv.name),
                    lv.span.line,
                    lv.span.col,
                ));
            }
            return Ok(Place::Addr(var.ptr));
        }

        if lv.indices.len() > var.dims.len() {
            return Err(MidendError::type_error(
                format!("too many subscripts on '{}'", lv.name),
                lv.span.line,
                lv.span.col,
            ));
        }

        // Array parameters hold the incoming pointer in a slot; the first
        // subscript is plain pointer arithmetic on it.
        let mut addr = if var.is_param_ptr { self.b.make_load(var.ptr) } else { var.ptr };
        for (i, idx) in lv.indices.iter().enumerate() {
            let v = self.lower_expr(idx)?;
            let v = self.b.promote(v, Ty::I32)?;
            let direct = var.is_param_ptr && i == 0;
            if !direct {
                addr = self.b.make_decay(addr);
            }
            addr = self.b.make_gep(addr, v);
        }

        if lv.indices.len() == var.dims.len() {
            Ok(Place::Addr(addr))
        } else {
            // Partial access decays once more into an argument pointer. A
            // whole array parameter is already in decayed form and passes
            // through unchanged.
            let pointee = self.b.module.types.pointee(self.b.module.ty(addr));
            let already_decayed = var.is_param_ptr && lv.indices.is_empty();
            let p = if !already_decayed
                && pointee.is_some_and(|p| self.b.module.types.is_array(p))
            {
                self.b.make_decay(addr)
            } else {
                addr
            };
            Ok(Place::ArrayPtr(p))
        }
    }

    // ── Condition lowering ────────────────────────────────────────────────

    /// Lower `e` as a branch condition against the builder's current
    /// true/false targets, short-circuiting `&&`/`||` through fresh landing
    /// blocks.
    pub(crate) fn lower_cond(&mut self, e: &Expr) -> Result<()> {
        match e {
            Expr::Binary { op: BinOp::And, lhs, rhs, .. } => {
                let n = self.b.next_rhs();
                let mid = self.b.new_block(&format!("land.rhs{n}"));
                let false_t = self.b.false_target();
                self.b.push_tf(mid, false_t);
                self.lower_cond(lhs)?;
                self.b.pop_tf();
                self.b.set_insert_end(mid);
                self.lower_cond(rhs)
            }
            Expr::Binary { op: BinOp::Or, lhs, rhs, .. } => {
                let n = self.b.next_rhs();
                let mid = self.b.new_block(&format!("lor.rhs{n}"));
                let true_t = self.b.true_target();
                self.b.push_tf(true_t, mid);
                self.lower_cond(lhs)?;
                self.b.pop_tf();
                self.b.set_insert_end(mid);
                self.lower_cond(rhs)
            }
            Expr::Unary { op: UnaryOp::Not, operand, .. } => {
                let t = self.b.true_target();
                let f = self.b.false_target();
                self.b.push_tf(f, t);
                self.lower_cond(operand)?;
                self.b.pop_tf();
                Ok(())
            }
            Expr::Binary { op, lhs, rhs, .. }
                if matches!(
                    op,
                    BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Eq | BinOp::Ne
                ) =>
            {
                let l = self.lower_expr(lhs)?;
                let r = self.lower_expr(rhs)?;
                let c = self.b.make_cmp(cmp_pred_of(*op), l, r)?;
                let t = self.b.true_target();
                let f = self.b.false_target();
                self.b.make_cond_br(c, t, f);
                Ok(())
            }
            _ => {
                let v = self.lower_expr(e)?;
                let c = self.b.cast_to_bool(v)?;
                let t = self.b.true_target();
                let f = self.b.false_target();
                self.b.make_cond_br(c, t, f);
                Ok(())
            }
        }
    }
}

fn cmp_pred_of(op: BinOp) -> CmpPred {
    match op {
        BinOp::Lt => CmpPred::Lt,
        BinOp::Le => CmpPred::Le,
        BinOp::Gt => CmpPred::Gt,
        BinOp::Ge => CmpPred::Ge,
        BinOp::Eq => CmpPred::Eq,
        BinOp::Ne => CmpPred::Ne,
        _ => unreachable!("not a comparison"),
    }
}

/// Two's-complement constant arithmetic; `None` for div/rem by zero.
pub(crate) fn const_binary(op: BinOp, a: ConstKind, b: ConstKind) -> Option<ConstKind> {
    use ConstKind as C;
    let float = matches!(a, C::Float(_) | C::Double(_)) || matches!(b, C::Float(_) | C::Double(_));
    if float {
        let x = a.as_float()?;
        let y = b.as_float()?;
        let r = match op {
            BinOp::Add => x + y,
            BinOp::Sub => x - y,
            BinOp::Mul => x * y,
            BinOp::Div => x / y,
            BinOp::Rem => return None,
            BinOp::Lt => return Some(C::Int((x < y) as i32)),
            BinOp::Le => return Some(C::Int((x <= y) as i32)),
            BinOp::Gt => return Some(C::Int((x > y) as i32)),
            BinOp::Ge => return Some(C::Int((x >= y) as i32)),
            BinOp::Eq => return Some(C::Int((x == y) as i32)),
            BinOp::Ne => return Some(C::Int((x != y) as i32)),
            BinOp::And => return Some(C::Int(((x != 0.0) && (y != 0.0)) as i32)),
            BinOp::Or => return Some(C::Int(((x != 0.0) || (y != 0.0)) as i32)),
        };
        return Some(C::Float(r as f32));
    }
    let x = a.as_int()? as i32;
    let y = b.as_int()? as i32;
    Some(match op {
        BinOp::Add => C::Int(x.wrapping_add(y)),
        BinOp::Sub => C::Int(x.wrapping_sub(y)),
        BinOp::Mul => C::Int(x.wrapping_mul(y)),
        BinOp::Div => {
            if y == 0 {
                return None;
            }
            C::Int(x.wrapping_div(y))
        }
        BinOp::Rem => {
            if y == 0 {
                return None;
            }
            C::Int(x.wrapping_rem(y))
        }
        BinOp::Lt => C::Int((x < y) as i32),
        BinOp::Le => C::Int((x <= y) as i32),
        BinOp::Gt => C::Int((x > y) as i32),
        BinOp::Ge => C::Int((x >= y) as i32),
        BinOp::Eq => C::Int((x == y) as i32),
        BinOp::Ne => C::Int((x != y) as i32),
        BinOp::And => C::Int(((x != 0) && (y != 0)) as i32),
        BinOp::Or => C::Int(((x != 0) || (y != 0)) as i32),
    })
}

pub(crate) fn const_unary(op: UnaryOp, v: ConstKind) -> Option<ConstKind> {
    use ConstKind as C;
    Some(match op {
        UnaryOp::Pos => v,
        UnaryOp::Neg => match v {
            C::Int(x) => C::Int(x.wrapping_neg()),
            C::Int64(x) => C::Int64(x.wrapping_neg()),
            C::Float(x) => C::Float(-x),
            C::Double(x) => C::Double(-x),
            _ => return None,
        },
        UnaryOp::Not => C::Int(v.is_zero() as i32),
    })
}

pub(crate) fn coerce_const(c: ConstKind, ty: Ty) -> Option<ConstKind> {
    use ConstKind as C;
    Some(match (c, ty) {
        (C::Int(_), Ty::I32) | (C::Float(_), Ty::F32) => c,
        (C::Int(v), Ty::F32) => C::Float(v as f32),
        (C::Float(v), Ty::I32) => C::Int(v as i32),
        (C::Int(v), Ty::I64) => C::Int64(v as i64),
        (C::Int(v), Ty::F64) => C::Double(v as f64),
        (C::Float(v), Ty::F64) => C::Double(v as f64),
        (C::Bool(b), Ty::I32) => C::Int(b as i32),
        _ => return None,
    })
}
