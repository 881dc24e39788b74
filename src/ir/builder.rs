//! Instruction builder: insertion point management, typed instruction
//! factories, and the stack-based context used to lower structured control
//! flow.
//!
//! The builder carries four block stacks: loop headers and exits (for
//! `continue`/`break`) and the short-circuit true/false targets. Logical
//! `&&`/`||` lower by pushing a fresh landing block as one target,
//! evaluating the left operand against it, then evaluating the right
//! operand in the landing block against the outer targets; value-position
//! uses merge with a phi over `true`/`false` constants.

use crate::error::{MidendError, Result};

use super::module::Module;
use super::types::{Ty, TypeKind};
use super::value::{CmpPred, Opcode, Value};

pub struct IrBuilder<'m> {
    pub module: &'m mut Module,
    func: Option<Value>,
    block: Option<Value>,
    pos: usize,
    headers: Vec<Value>,
    exits: Vec<Value>,
    true_targets: Vec<Value>,
    false_targets: Vec<Value>,
    if_count: u32,
    while_count: u32,
    rhs_count: u32,
    var_count: u32,
}

impl<'m> IrBuilder<'m> {
    pub fn new(module: &'m mut Module) -> Self {
        IrBuilder {
            module,
            func: None,
            block: None,
            pos: 0,
            headers: Vec::new(),
            exits: Vec::new(),
            true_targets: Vec::new(),
            false_targets: Vec::new(),
            if_count: 0,
            while_count: 0,
            rhs_count: 0,
            var_count: 0,
        }
    }

    // ── Position management ───────────────────────────────────────────────

    pub fn set_function(&mut self, func: Value) {
        self.func = Some(func);
    }

    pub fn cur_function(&self) -> Value {
        self.func.expect("builder has no current function")
    }

    /// Set the insertion point to the end of `block`.
    pub fn set_insert_end(&mut self, block: Value) {
        self.pos = self.module.block_insts(block).len();
        self.block = Some(block);
    }

    pub fn set_insert_at(&mut self, block: Value, pos: usize) {
        self.block = Some(block);
        self.pos = pos;
    }

    pub fn cur_block(&self) -> Value {
        self.block.expect("builder has no insertion block")
    }

    /// True once the current block carries a terminator; further statement
    /// lowering into it is dead and skipped by the generator.
    pub fn block_terminated(&self) -> bool {
        self.block.map_or(false, |b| self.module.terminator(b).is_some())
    }

    // ── Loop / short-circuit context stacks ───────────────────────────────

    pub fn push_loop(&mut self, header: Value, exit: Value) {
        self.headers.push(header);
        self.exits.push(exit);
    }

    pub fn pop_loop(&mut self) {
        self.headers.pop();
        self.exits.pop();
    }

    pub fn header(&self) -> Option<Value> {
        self.headers.last().copied()
    }

    pub fn exit(&self) -> Option<Value> {
        self.exits.last().copied()
    }

    pub fn push_tf(&mut self, true_target: Value, false_target: Value) {
        self.true_targets.push(true_target);
        self.false_targets.push(false_target);
    }

    pub fn pop_tf(&mut self) {
        self.true_targets.pop();
        self.false_targets.pop();
    }

    pub fn true_target(&self) -> Value {
        *self.true_targets.last().expect("no true target")
    }

    pub fn false_target(&self) -> Value {
        *self.false_targets.last().expect("no false target")
    }

    // ── Naming counters ───────────────────────────────────────────────────

    pub fn next_if(&mut self) -> u32 {
        self.if_count += 1;
        self.if_count
    }

    pub fn next_while(&mut self) -> u32 {
        self.while_count += 1;
        self.while_count
    }

    pub fn next_rhs(&mut self) -> u32 {
        self.rhs_count += 1;
        self.rhs_count
    }

    pub fn next_var(&mut self) -> u32 {
        self.var_count += 1;
        self.var_count
    }

    // ── Block creation ────────────────────────────────────────────────────

    pub fn new_block(&mut self, name: &str) -> Value {
        let b = self.module.add_block(self.cur_function());
        if !name.is_empty() {
            self.module.set_name(b, name);
        }
        b
    }

    // ── Core insertion ────────────────────────────────────────────────────

    fn insert(&mut self, op: Opcode, ty: Ty, operands: &[Value]) -> Value {
        let inst = self.module.create_inst(op, ty, operands);
        let block = self.cur_block();
        self.module.insert_inst(block, self.pos, inst);
        self.pos += 1;
        inst
    }

    // ── Memory ────────────────────────────────────────────────────────────

    /// Allocate a stack slot for `content_ty` and return the pointer. The
    /// slot is placed at the top of the entry block regardless of the
    /// current insertion point, where mem2reg expects it.
    pub fn make_alloca(&mut self, content_ty: Ty) -> Value {
        let ptr_ty = self.module.types.pointer(content_ty);
        let inst = self.module.create_inst(Opcode::Alloca, ptr_ty, &[]);
        let entry = self
            .module
            .entry_block(self.cur_function())
            .expect("alloca in a function with no entry block");
        let at = self
            .module
            .block_insts(entry)
            .iter()
            .take_while(|&&i| self.module.opcode(i) == Some(Opcode::Alloca))
            .count();
        self.module.insert_inst(entry, at, inst);
        if Some(entry) == self.block && at <= self.pos {
            self.pos += 1;
        }
        inst
    }

    pub fn make_load(&mut self, ptr: Value) -> Value {
        let ty = self.module.types.pointee(self.module.ty(ptr)).expect("load from non-pointer");
        self.insert(Opcode::Load, ty, &[ptr])
    }

    pub fn make_store(&mut self, val: Value, ptr: Value) -> Value {
        self.insert(Opcode::Store, Ty::VOID, &[val, ptr])
    }

    /// Zero-fill `byte_len` bytes behind `ptr`.
    pub fn make_memset(&mut self, ptr: Value, byte_len: usize) -> Value {
        let len = self.module.const_i64(byte_len as i64);
        self.insert(Opcode::Memset, Ty::VOID, &[ptr, len])
    }

    /// Pointer arithmetic: `base + index * sizeof(pointee)`. The result
    /// keeps the base's pointer type.
    pub fn make_gep(&mut self, base: Value, index: Value) -> Value {
        let base_ty = self.module.ty(base);
        let result = self.module.types.gep_result(base_ty).expect("gep on non-pointer");
        self.insert(Opcode::GetElementPtr, result, &[base, index])
    }

    /// Array decay: bitcast a pointer-to-array to a pointer to its first
    /// element.
    pub fn make_decay(&mut self, array_ptr: Value) -> Value {
        let ty = self.module.ty(array_ptr);
        let decayed = self.module.types.decay(ty).expect("decay of non-array pointer");
        self.make_cast(Opcode::Bitcast, array_ptr, decayed)
    }

    // ── Arithmetic ────────────────────────────────────────────────────────

    /// Build a binary arithmetic instruction, unifying operand types first
    /// (int operands widen to float when mixed).
    pub fn make_binary(&mut self, op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value> {
        let lt = self.module.ty(lhs);
        let rt = self.module.ty(rhs);
        let float = self.module.types.is_float(lt) || self.module.types.is_float(rt);
        let target = if float { Ty::F32 } else { Ty::I32 };
        let lhs = self.promote(lhs, target)?;
        let rhs = self.promote(rhs, target)?;
        let opcode = match (op, float) {
            (BinaryOp::Add, false) => Opcode::Add,
            (BinaryOp::Sub, false) => Opcode::Sub,
            (BinaryOp::Mul, false) => Opcode::Mul,
            (BinaryOp::Div, false) => Opcode::SDiv,
            (BinaryOp::Rem, false) => Opcode::SRem,
            (BinaryOp::Add, true) => Opcode::FAdd,
            (BinaryOp::Sub, true) => Opcode::FSub,
            (BinaryOp::Mul, true) => Opcode::FMul,
            (BinaryOp::Div, true) => Opcode::FDiv,
            (BinaryOp::Rem, true) => {
                return Err(MidendError::Unsupported("float remainder".into()));
            }
        };
        Ok(self.insert(opcode, target, &[lhs, rhs]))
    }

    pub fn make_cmp(&mut self, pred: CmpPred, lhs: Value, rhs: Value) -> Result<Value> {
        let lt = self.module.ty(lhs);
        let rt = self.module.ty(rhs);
        let float = self.module.types.is_float(lt) || self.module.types.is_float(rt);
        let target = if float { Ty::F32 } else { Ty::I32 };
        let lhs = self.promote(lhs, target)?;
        let rhs = self.promote(rhs, target)?;
        let op = if float { Opcode::FCmp(pred) } else { Opcode::ICmp(pred) };
        Ok(self.insert(op, Ty::BOOL, &[lhs, rhs]))
    }

    pub fn make_fneg(&mut self, v: Value) -> Value {
        let ty = self.module.ty(v);
        self.insert(Opcode::FNeg, ty, &[v])
    }

    pub fn make_cast(&mut self, op: Opcode, v: Value, to: Ty) -> Value {
        debug_assert!(op.is_cast());
        self.insert(op, to, &[v])
    }

    // ── Control flow ──────────────────────────────────────────────────────

    pub fn make_ret(&mut self, val: Option<Value>) -> Value {
        match val {
            Some(v) => self.insert(Opcode::Ret, Ty::VOID, &[v]),
            None => self.insert(Opcode::Ret, Ty::VOID, &[]),
        }
    }

    pub fn make_br(&mut self, dest: Value) -> Value {
        self.insert(Opcode::Br, Ty::VOID, &[dest])
    }

    pub fn make_cond_br(&mut self, cond: Value, then_bb: Value, else_bb: Value) -> Value {
        debug_assert_eq!(self.module.ty(cond), Ty::BOOL);
        self.insert(Opcode::CondBr, Ty::VOID, &[cond, then_bb, else_bb])
    }

    pub fn make_call(&mut self, callee: Value, args: &[Value]) -> Value {
        let ret = self.module.fn_return_ty(callee);
        let mut operands = Vec::with_capacity(args.len() + 1);
        operands.push(callee);
        operands.extend_from_slice(args);
        self.insert(Opcode::Call, ret, &operands)
    }

    /// An empty phi in the current block; incoming pairs are added by the
    /// caller once the predecessors exist.
    pub fn make_phi(&mut self, ty: Ty) -> Value {
        let inst = self.module.create_inst(Opcode::Phi, ty, &[]);
        let block = self.cur_block();
        // Phis group at the block head.
        let at = self
            .module
            .block_insts(block)
            .iter()
            .take_while(|&&i| self.module.opcode(i) == Some(Opcode::Phi))
            .count();
        self.module.insert_inst(block, at, inst);
        if at <= self.pos {
            self.pos += 1;
        }
        inst
    }

    pub fn make_atomic_add(&mut self, ptr: Value, val: Value) -> Value {
        let ty = self.module.ty(val);
        self.insert(Opcode::AtomicAdd, ty, &[ptr, val])
    }

    // ── Type coercion ─────────────────────────────────────────────────────

    /// Coerce `v` to `target` for assignment, argument passing, and
    /// arithmetic unification: bool zero-extends, integers widen or
    /// truncate, int and float convert both ways. Constants fold in place
    /// instead of emitting a cast.
    pub fn promote(&mut self, v: Value, target: Ty) -> Result<Value> {
        let from = self.module.ty(v);
        if self.module.types.is_same(from, target) {
            return Ok(v);
        }
        if let Some(c) = self.module.const_kind(v) {
            if let Some(folded) = fold_const_cast(c, from, target) {
                let k = folded;
                return Ok(self.module.const_of(target, k));
            }
        }
        let op = cast_opcode(&self.module.types, from, target).ok_or_else(|| {
            MidendError::Unsupported(format!(
                "no conversion from {} to {}",
                self.module.types.display(from),
                self.module.types.display(target)
            ))
        })?;
        Ok(self.make_cast(op, v, target))
    }

    /// Lower a value to `i1` by comparing against zero; booleans pass
    /// through.
    pub fn cast_to_bool(&mut self, v: Value) -> Result<Value> {
        let ty = self.module.ty(v);
        if ty == Ty::BOOL {
            return Ok(v);
        }
        let zero = self.module.const_zero(ty);
        self.make_cmp(CmpPred::Ne, v, zero)
    }
}

/// Source-level binary operators, unified over int and float by
/// [`IrBuilder::make_binary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

/// The cast opcode that converts `from` into `to`, if one exists.
pub fn cast_opcode(types: &super::types::TypeTable, from: Ty, to: Ty) -> Option<Opcode> {
    let t = types;
    let int_rank = |ty: Ty| match t.kind(ty) {
        TypeKind::Bool => Some(1usize),
        TypeKind::Int8 => Some(8),
        TypeKind::Int32 => Some(32),
        TypeKind::Int64 => Some(64),
        _ => None,
    };
    if let (Some(a), Some(b)) = (int_rank(from), int_rank(to)) {
        return Some(if a < b {
            if a == 1 {
                Opcode::ZExt
            } else {
                Opcode::SExt
            }
        } else {
            Opcode::Trunc
        });
    }
    match (t.kind(from), t.kind(to)) {
        (TypeKind::Float32, TypeKind::Float64) => Some(Opcode::FpExt),
        (TypeKind::Float64, TypeKind::Float32) => Some(Opcode::FpTrunc),
        (k, TypeKind::Float32 | TypeKind::Float64)
            if matches!(k, TypeKind::Bool | TypeKind::Int8 | TypeKind::Int32 | TypeKind::Int64) =>
        {
            Some(Opcode::SiToFp)
        }
        (TypeKind::Float32 | TypeKind::Float64, k)
            if matches!(k, TypeKind::Bool | TypeKind::Int8 | TypeKind::Int32 | TypeKind::Int64) =>
        {
            Some(Opcode::FpToSi)
        }
        (TypeKind::Pointer { .. }, TypeKind::Int64) => Some(Opcode::PtrToInt),
        (TypeKind::Int64, TypeKind::Pointer { .. }) => Some(Opcode::IntToPtr),
        (TypeKind::Pointer { .. }, TypeKind::Pointer { .. }) => Some(Opcode::Bitcast),
        _ => None,
    }
}

/// Constant-fold a scalar conversion. Integer narrowing wraps two's
/// complement; float-to-int truncates toward zero.
pub fn fold_const_cast(
    c: super::value::ConstKind,
    _from: Ty,
    to: Ty,
) -> Option<super::value::ConstKind> {
    use super::value::ConstKind as C;
    Some(match (c, to) {
        (C::Undef, _) => C::Undef,
        (c, Ty::BOOL) => C::Bool(c.is_nonzero()),
        (C::Bool(b), Ty::I32) => C::Int(b as i32),
        (C::Bool(b), Ty::I64) => C::Int64(b as i64),
        (C::Int(v), Ty::I64) => C::Int64(v as i64),
        (C::Int64(v), Ty::I32) => C::Int(v as i32),
        (C::Int(v), Ty::F32) => C::Float(v as f32),
        (C::Int(v), Ty::F64) => C::Double(v as f64),
        (C::Int64(v), Ty::F32) => C::Float(v as f32),
        (C::Int64(v), Ty::F64) => C::Double(v as f64),
        (C::Bool(b), Ty::F32) => C::Float(b as i32 as f32),
        (C::Float(v), Ty::I32) => C::Int(v as i32),
        (C::Float(v), Ty::I64) => C::Int64(v as i64),
        (C::Float(v), Ty::F64) => C::Double(v as f64),
        (C::Double(v), Ty::I32) => C::Int(v as i32),
        (C::Double(v), Ty::I64) => C::Int64(v as i64),
        (C::Double(v), Ty::F32) => C::Float(v as f32),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (Module, Value, Value) {
        let mut m = Module::new();
        let fn_ty = m.types.function(Ty::I32, vec![]);
        let f = m.add_function("f", fn_ty);
        let bb = m.add_block(f);
        (m, f, bb)
    }

    #[test]
    fn binary_unifies_int_and_float() {
        let (mut m, f, bb) = fixture();
        let mut b = IrBuilder::new(&mut m);
        b.set_function(f);
        b.set_insert_end(bb);
        let one = b.module.const_int(1);
        let half = b.module.const_float(0.5);
        let sum = b.make_binary(BinaryOp::Add, one, half).unwrap();
        assert_eq!(b.module.opcode(sum), Some(Opcode::FAdd));
        assert_eq!(b.module.ty(sum), Ty::F32);
        // The int constant folded to a float constant, no cast emitted.
        let k = b.module.const_kind(b.module.operands(sum)[0]).unwrap();
        assert_eq!(k, crate::ir::value::ConstKind::Float(1.0));
    }

    #[test]
    fn promote_emits_sitofp_for_values() {
        let (mut m, f, bb) = fixture();
        let mut b = IrBuilder::new(&mut m);
        b.set_function(f);
        b.set_insert_end(bb);
        let one = b.module.const_int(1);
        let two = b.module.const_int(2);
        let iv = b.make_binary(BinaryOp::Add, one, two).unwrap();
        let fv = b.promote(iv, Ty::F32).unwrap();
        assert_eq!(b.module.opcode(fv), Some(Opcode::SiToFp));
    }

    #[test]
    fn cast_to_bool_is_compare_nonzero() {
        let (mut m, f, bb) = fixture();
        let mut b = IrBuilder::new(&mut m);
        b.set_function(f);
        b.set_insert_end(bb);
        let one = b.module.const_int(1);
        let two = b.module.const_int(2);
        let v = b.make_binary(BinaryOp::Add, one, two).unwrap();
        let c = b.cast_to_bool(v).unwrap();
        assert_eq!(b.module.opcode(c), Some(Opcode::ICmp(CmpPred::Ne)));
        assert_eq!(b.module.ty(c), Ty::BOOL);
    }

    #[test]
    fn allocas_group_at_entry_head() {
        let (mut m, f, bb) = fixture();
        let mut b = IrBuilder::new(&mut m);
        b.set_function(f);
        b.set_insert_end(bb);
        let one = b.module.const_int(1);
        let two = b.module.const_int(2);
        b.make_binary(BinaryOp::Add, one, two).unwrap();
        let slot = b.make_alloca(Ty::I32);
        let insts = b.module.block_insts(bb);
        assert_eq!(insts[0], slot);
        assert_eq!(b.module.opcode(insts[1]), Some(Opcode::Add));
        // Insertion point still appends after the add.
        let ret = b.make_ret(None);
        assert_eq!(*b.module.block_insts(bb).last().unwrap(), ret);
    }
}
