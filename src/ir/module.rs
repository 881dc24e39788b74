//! The module: owner of every IR object and of the def-use graph.
//!
//! All values live in one slab owned by the module; handles stay valid until
//! the module is dropped (erased instructions become unreferenced slots, the
//! slab is never compacted). Every mutation of operand vectors goes through
//! the def-use operations here so the paired `Use` edges stay consistent.

use rustc_hash::FxHashMap;

use super::types::{Ty, TypeTable};
use super::value::{
    BlockData, ConstKey, ConstKind, FnAttrs, FunctionData, GlobalData, GlobalInit, InstData,
    Opcode, Use, Value, ValueData, ValueKind,
};

#[derive(Debug)]
pub struct Module {
    pub types: TypeTable,
    values: Vec<ValueData>,
    /// Functions in declaration order.
    pub functions: Vec<Value>,
    /// Globals in declaration order.
    pub globals: Vec<Value>,
    func_table: FxHashMap<String, Value>,
    const_pool: FxHashMap<(Ty, ConstKey), Value>,
}

impl Module {
    pub fn new() -> Self {
        Module {
            types: TypeTable::new(),
            values: Vec::new(),
            functions: Vec::new(),
            globals: Vec::new(),
            func_table: FxHashMap::default(),
            const_pool: FxHashMap::default(),
        }
    }

    // ── Slab access ───────────────────────────────────────────────────────

    #[inline]
    pub fn value(&self, v: Value) -> &ValueData {
        &self.values[v.index()]
    }

    #[inline]
    pub(crate) fn value_mut(&mut self, v: Value) -> &mut ValueData {
        &mut self.values[v.index()]
    }

    fn alloc(&mut self, data: ValueData) -> Value {
        let v = Value(self.values.len() as u32);
        self.values.push(data);
        v
    }

    #[inline]
    pub fn ty(&self, v: Value) -> Ty {
        self.value(v).ty
    }

    #[inline]
    pub fn operands(&self, v: Value) -> &[Value] {
        &self.value(v).operands
    }

    #[inline]
    pub fn uses(&self, v: Value) -> &[Use] {
        &self.value(v).uses
    }

    pub fn set_name(&mut self, v: Value, name: impl Into<String>) {
        self.value_mut(v).name = Some(name.into());
    }

    /// Number of slots ever allocated; handles are always `< len`.
    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    // ── Constants ─────────────────────────────────────────────────────────

    fn intern_const(&mut self, ty: Ty, c: ConstKind) -> Value {
        let key = (ty, c.hash_key());
        if let Some(&v) = self.const_pool.get(&key) {
            return v;
        }
        let v = self.alloc(ValueData::new(ty, ValueKind::Const(c)));
        self.const_pool.insert(key, v);
        v
    }

    pub fn const_bool(&mut self, b: bool) -> Value {
        self.intern_const(Ty::BOOL, ConstKind::Bool(b))
    }

    pub fn const_int(&mut self, v: i32) -> Value {
        self.intern_const(Ty::I32, ConstKind::Int(v))
    }

    pub fn const_i64(&mut self, v: i64) -> Value {
        self.intern_const(Ty::I64, ConstKind::Int64(v))
    }

    pub fn const_float(&mut self, v: f32) -> Value {
        self.intern_const(Ty::F32, ConstKind::Float(v))
    }

    pub fn const_double(&mut self, v: f64) -> Value {
        self.intern_const(Ty::F64, ConstKind::Double(v))
    }

    pub fn undef(&mut self, ty: Ty) -> Value {
        self.intern_const(ty, ConstKind::Undef)
    }

    /// The zero of a scalar type.
    pub fn const_zero(&mut self, ty: Ty) -> Value {
        match ty {
            Ty::BOOL => self.const_bool(false),
            Ty::I64 => self.const_i64(0),
            Ty::F32 => self.const_float(0.0),
            Ty::F64 => self.const_double(0.0),
            _ => self.const_int(0),
        }
    }

    pub fn const_of(&mut self, ty: Ty, c: ConstKind) -> Value {
        self.intern_const(ty, c)
    }

    pub fn const_kind(&self, v: Value) -> Option<ConstKind> {
        self.value(v).const_kind()
    }

    // ── Functions, globals, arguments ─────────────────────────────────────

    /// Create a function of the given function type. Argument values are
    /// created eagerly, one per parameter. The function starts with no
    /// blocks, i.e. as a declaration; adding an entry block turns it into a
    /// definition.
    pub fn add_function(&mut self, name: impl Into<String>, fn_ty: Ty) -> Value {
        let name = name.into();
        debug_assert!(self.types.is_function(fn_ty));
        let params: Vec<Ty> = self.types.fn_params(fn_ty).unwrap_or(&[]).to_vec();
        let func = self.alloc(ValueData::new(
            fn_ty,
            ValueKind::Function(FunctionData {
                args: Vec::new(),
                blocks: Vec::new(),
                attrs: FnAttrs::empty(),
                name_counter: 0,
            }),
        ));
        let mut args = Vec::with_capacity(params.len());
        for (index, pty) in params.iter().enumerate() {
            let arg = self.alloc(ValueData::new(*pty, ValueKind::Argument { func, index }));
            self.value_mut(arg).name = Some(format!("arg{index}"));
            args.push(arg);
        }
        if let ValueKind::Function(f) = &mut self.value_mut(func).kind {
            f.args = args;
        }
        self.value_mut(func).name = Some(name.clone());
        self.functions.push(func);
        self.func_table.insert(name, func);
        func
    }

    pub fn find_function(&self, name: &str) -> Option<Value> {
        self.func_table.get(name).copied()
    }

    pub fn func_name(&self, func: Value) -> &str {
        self.value(func).name.as_deref().unwrap_or("")
    }

    pub fn func_data(&self, func: Value) -> &FunctionData {
        self.value(func).function().expect("not a function")
    }

    pub(crate) fn func_data_mut(&mut self, func: Value) -> &mut FunctionData {
        match &mut self.value_mut(func).kind {
            ValueKind::Function(f) => f,
            _ => panic!("not a function"),
        }
    }

    pub fn func_blocks(&self, func: Value) -> &[Value] {
        &self.func_data(func).blocks
    }

    pub fn func_args(&self, func: Value) -> &[Value] {
        &self.func_data(func).args
    }

    pub fn entry_block(&self, func: Value) -> Option<Value> {
        self.func_data(func).blocks.first().copied()
    }

    pub fn is_declaration(&self, func: Value) -> bool {
        self.func_data(func).blocks.is_empty()
    }

    pub fn fn_attrs(&self, func: Value) -> FnAttrs {
        self.func_data(func).attrs
    }

    pub fn set_fn_attrs(&mut self, func: Value, attrs: FnAttrs) {
        self.func_data_mut(func).attrs = attrs;
    }

    pub fn fn_return_ty(&self, func: Value) -> Ty {
        self.types.fn_ret(self.ty(func)).expect("function type")
    }

    /// Fresh per-function identifier for generated names.
    pub fn fresh_name(&mut self, func: Value, prefix: &str) -> String {
        let f = self.func_data_mut(func);
        let n = f.name_counter;
        f.name_counter += 1;
        format!("{prefix}{n}")
    }

    /// Remove a function and erase its body. The function must have no
    /// remaining uses (no call sites).
    pub fn remove_function(&mut self, func: Value) {
        debug_assert!(self.uses(func).is_empty(), "removing a function that is still called");
        let blocks: Vec<Value> = self.func_blocks(func).to_vec();
        for b in blocks {
            self.remove_block(b);
        }
        if let Some(name) = self.value(func).name.clone() {
            if self.func_table.get(&name) == Some(&func) {
                self.func_table.remove(&name);
            }
        }
        self.functions.retain(|&f| f != func);
    }

    pub fn add_global(
        &mut self,
        name: impl Into<String>,
        content_ty: Ty,
        init: GlobalInit,
        is_const: bool,
    ) -> Value {
        let ptr_ty = self.types.pointer(content_ty);
        let g = self.alloc(ValueData::new(ptr_ty, ValueKind::Global(GlobalData { init, is_const })));
        self.value_mut(g).name = Some(name.into());
        self.globals.push(g);
        g
    }

    // ── Blocks ────────────────────────────────────────────────────────────

    /// Create a block and append it to the function's block list.
    pub fn add_block(&mut self, func: Value) -> Value {
        let b = self.alloc(ValueData::new(
            Ty::LABEL,
            ValueKind::Block(BlockData { func, insts: Vec::new() }),
        ));
        let name = self.fresh_name(func, "bb");
        self.value_mut(b).name = Some(name);
        self.func_data_mut(func).blocks.push(b);
        b
    }

    /// Create a block and place it immediately after `after` in layout
    /// order.
    pub fn add_block_after(&mut self, func: Value, after: Value) -> Value {
        let b = self.add_block(func);
        let blocks = &mut self.func_data_mut(func).blocks;
        blocks.pop();
        let pos = blocks.iter().position(|&x| x == after).map_or(blocks.len(), |p| p + 1);
        blocks.insert(pos, b);
        b
    }

    /// Create a block and place it immediately before `before`.
    pub fn add_block_before(&mut self, func: Value, before: Value) -> Value {
        let b = self.add_block(func);
        let blocks = &mut self.func_data_mut(func).blocks;
        blocks.pop();
        let pos = blocks.iter().position(|&x| x == before).unwrap_or(blocks.len());
        blocks.insert(pos, b);
        b
    }

    pub fn block_data(&self, block: Value) -> &BlockData {
        self.value(block).block().expect("not a block")
    }

    pub(crate) fn block_data_mut(&mut self, block: Value) -> &mut BlockData {
        match &mut self.value_mut(block).kind {
            ValueKind::Block(b) => b,
            _ => panic!("not a block"),
        }
    }

    pub fn block_insts(&self, block: Value) -> &[Value] {
        &self.block_data(block).insts
    }

    pub fn block_parent(&self, block: Value) -> Value {
        self.block_data(block).func
    }

    pub fn terminator(&self, block: Value) -> Option<Value> {
        let last = *self.block_data(block).insts.last()?;
        match self.value(last).opcode() {
            Some(op) if op.is_terminator() => Some(last),
            _ => None,
        }
    }

    /// Successor blocks, read off the terminator. Empty for `Ret` and for
    /// unterminated blocks.
    pub fn succ_blocks(&self, block: Value) -> Vec<Value> {
        let Some(term) = self.terminator(block) else { return Vec::new() };
        match self.value(term).opcode() {
            Some(Opcode::Br) => vec![self.operands(term)[0]],
            Some(Opcode::CondBr) => {
                let ops = self.operands(term);
                if ops[1] == ops[2] {
                    vec![ops[1]]
                } else {
                    vec![ops[1], ops[2]]
                }
            }
            _ => Vec::new(),
        }
    }

    /// Predecessor blocks, derived from the use-list of the block value
    /// (terminator users only). Deterministic but unordered; analyses that
    /// need CSR adjacency build it in `analysis::cfg`.
    pub fn pred_blocks(&self, block: Value) -> Vec<Value> {
        let mut preds = Vec::new();
        for u in self.uses(block) {
            let user = self.value(u.user);
            let Some(op) = user.opcode() else { continue };
            if !op.is_terminator() {
                continue;
            }
            if let Some(pb) = user.inst().and_then(|i| i.parent) {
                if !preds.contains(&pb) {
                    preds.push(pb);
                }
            }
        }
        preds.sort();
        preds
    }

    /// Remove a block from its function, erasing all its instructions.
    /// Uses of the block's instructions must already be gone or confined to
    /// the block itself.
    pub fn remove_block(&mut self, block: Value) {
        let insts: Vec<Value> = self.block_insts(block).to_vec();
        // Detach operands first so in-block cycles (a phi feeding itself
        // through the latch) do not leave stale edges.
        for &i in &insts {
            self.drop_all_operands(i);
        }
        for &i in insts.iter().rev() {
            self.value_mut(i).uses.clear();
            if let ValueKind::Inst(inst) = &mut self.value_mut(i).kind {
                inst.parent = None;
            }
        }
        self.block_data_mut(block).insts.clear();
        let func = self.block_parent(block);
        self.func_data_mut(func).blocks.retain(|&b| b != block);
    }

    // ── Instructions ──────────────────────────────────────────────────────

    /// Create a detached instruction with the given operands; use edges are
    /// registered immediately.
    pub fn create_inst(&mut self, op: Opcode, ty: Ty, operands: &[Value]) -> Value {
        let inst = self.alloc(ValueData::new(ty, ValueKind::Inst(InstData { op, parent: None })));
        for &v in operands {
            self.add_operand(inst, v);
        }
        inst
    }

    /// Append to the end of a block. O(1).
    pub fn append_inst(&mut self, block: Value, inst: Value) {
        debug_assert!(self.inst_parent(inst).is_none(), "instruction already placed");
        match &mut self.value_mut(inst).kind {
            ValueKind::Inst(i) => i.parent = Some(block),
            _ => panic!("not an instruction"),
        }
        self.block_data_mut(block).insts.push(inst);
    }

    /// Insert before position `pos` in the block's instruction list.
    pub fn insert_inst(&mut self, block: Value, pos: usize, inst: Value) {
        debug_assert!(self.inst_parent(inst).is_none(), "instruction already placed");
        match &mut self.value_mut(inst).kind {
            ValueKind::Inst(i) => i.parent = Some(block),
            _ => panic!("not an instruction"),
        }
        self.block_data_mut(block).insts.insert(pos, inst);
    }

    /// Insert immediately before an existing instruction.
    pub fn insert_before(&mut self, existing: Value, inst: Value) {
        let block = self.inst_parent(existing).expect("existing instruction not placed");
        let pos = self
            .block_insts(block)
            .iter()
            .position(|&i| i == existing)
            .expect("instruction not in its parent block");
        self.insert_inst(block, pos, inst);
    }

    pub fn inst_parent(&self, inst: Value) -> Option<Value> {
        self.value(inst).inst().and_then(|i| i.parent)
    }

    pub fn opcode(&self, v: Value) -> Option<Opcode> {
        self.value(v).opcode()
    }

    /// Detach an instruction from its block without touching its operands
    /// or uses (for moving, e.g. hoisting).
    pub fn unlink_inst(&mut self, inst: Value) {
        let Some(block) = self.inst_parent(inst) else { return };
        self.block_data_mut(block).insts.retain(|&i| i != inst);
        if let ValueKind::Inst(i) = &mut self.value_mut(inst).kind {
            i.parent = None;
        }
    }

    /// Erase an instruction. The instruction must have no remaining uses;
    /// its operand edges are dropped and it is unlinked from its block.
    pub fn erase_inst(&mut self, inst: Value) {
        debug_assert!(
            self.uses(inst).is_empty(),
            "erasing instruction {:?} that still has uses",
            inst
        );
        self.drop_all_operands(inst);
        self.unlink_inst(inst);
    }

    /// Split a block in two around `pos`: instructions `[pos..]` (including
    /// the terminator) move to a fresh block placed right after the
    /// original, and the original is terminated with an unconditional
    /// branch to the new block. Phi incoming-block references in successor
    /// blocks are re-homed to the new block. Returns the new block.
    pub fn split_block_at(&mut self, block: Value, pos: usize) -> Value {
        let func = self.block_parent(block);
        let new_block = self.add_block_after(func, block);

        let moved: Vec<Value> = self.block_data(block).insts[pos..].to_vec();
        self.block_data_mut(block).insts.truncate(pos);
        for &i in &moved {
            if let ValueKind::Inst(inst) = &mut self.value_mut(i).kind {
                inst.parent = Some(new_block);
            }
        }
        self.block_data_mut(new_block).insts = moved;

        // Successor phis still name the old block as predecessor.
        for succ in self.succ_blocks(new_block) {
            self.rehome_phi_preds(succ, block, new_block);
        }

        let br = self.create_inst(Opcode::Br, Ty::VOID, &[new_block]);
        self.append_inst(block, br);
        new_block
    }

    /// Rewrite phi incoming-block entries in `block` from `old_pred` to
    /// `new_pred`.
    pub fn rehome_phi_preds(&mut self, block: Value, old_pred: Value, new_pred: Value) {
        let phis: Vec<Value> = self.phis_of(block);
        for phi in phis {
            let n = self.operands(phi).len();
            let mut i = 1;
            while i < n {
                if self.operands(phi)[i] == old_pred {
                    self.set_operand(phi, i, new_pred);
                }
                i += 2;
            }
        }
    }

    pub fn phis_of(&self, block: Value) -> Vec<Value> {
        self.block_insts(block)
            .iter()
            .copied()
            .take_while(|&i| self.opcode(i) == Some(Opcode::Phi))
            .collect()
    }

    // ── Phi helpers ───────────────────────────────────────────────────────

    pub fn phi_incoming(&self, phi: Value) -> Vec<(Value, Value)> {
        self.operands(phi).chunks(2).map(|c| (c[0], c[1])).collect()
    }

    pub fn phi_add_incoming(&mut self, phi: Value, value: Value, pred: Value) {
        self.add_operand(phi, value);
        self.add_operand(phi, pred);
    }

    pub fn phi_incoming_for(&self, phi: Value, pred: Value) -> Option<Value> {
        for c in self.operands(phi).chunks(2) {
            if c[1] == pred {
                return Some(c[0]);
            }
        }
        None
    }

    /// Drop the incoming pair for `pred`, if present.
    pub fn phi_remove_incoming(&mut self, phi: Value, pred: Value) {
        let ops = self.operands(phi);
        let Some(pair) = (0..ops.len() / 2).find(|&k| ops[2 * k + 1] == pred) else { return };
        // Detach the trailing pairs and re-append them so indices stay dense.
        let tail: Vec<Value> = self.operands(phi)[2 * pair + 2..].to_vec();
        while self.operands(phi).len() > 2 * pair {
            self.remove_last_operand(phi);
        }
        for v in tail {
            self.add_operand(phi, v);
        }
    }

    // ── Def-use operations ────────────────────────────────────────────────

    /// Append a new operand edge and register the paired use.
    pub fn add_operand(&mut self, user: Value, value: Value) {
        let index = self.value(user).operands.len();
        self.value_mut(user).operands.push(value);
        self.value_mut(value).uses.push(Use { user, index });
    }

    /// Replace operand `index` of `user`, detaching the use edge from the
    /// old value and attaching it to the new one. The index is preserved.
    pub fn set_operand(&mut self, user: Value, index: usize, new: Value) {
        let old = self.value(user).operands[index];
        if old == new {
            return;
        }
        self.remove_use(old, user, index);
        self.value_mut(user).operands[index] = new;
        self.value_mut(new).uses.push(Use { user, index });
    }

    /// Rewrite every use of `old` to reference `new` and migrate the use
    /// edges. Silently refuses when `old` is a function or block and the
    /// replacement's type differs; for all other kinds the types must
    /// already agree.
    pub fn replace_all_uses_with(&mut self, old: Value, new: Value) {
        if old == new {
            return;
        }
        let old_data = self.value(old);
        if old_data.ty != self.value(new).ty {
            if old_data.is_function() || old_data.is_block() {
                return;
            }
            debug_assert!(false, "replace_all_uses_with: type mismatch {:?} -> {:?}", old, new);
        }
        let uses = std::mem::take(&mut self.value_mut(old).uses);
        for u in &uses {
            self.value_mut(u.user).operands[u.index] = new;
        }
        self.value_mut(new).uses.extend(uses);
    }

    /// Unregister every operand edge of `user`, leaving it deletable.
    pub fn drop_all_operands(&mut self, user: Value) {
        let operands = std::mem::take(&mut self.value_mut(user).operands);
        for (index, value) in operands.into_iter().enumerate() {
            self.remove_use(value, user, index);
        }
    }

    fn remove_last_operand(&mut self, user: Value) {
        let index = self.value(user).operands.len() - 1;
        let value = self.value_mut(user).operands.pop().unwrap();
        self.remove_use(value, user, index);
    }

    fn remove_use(&mut self, value: Value, user: Value, index: usize) {
        let uses = &mut self.value_mut(value).uses;
        if let Some(p) = uses.iter().position(|u| u.user == user && u.index == index) {
            uses.swap_remove(p);
        }
    }

    // ── Traversal helpers ─────────────────────────────────────────────────

    /// Defined (non-declaration) functions, in declaration order.
    pub fn defined_functions(&self) -> Vec<Value> {
        self.functions.iter().copied().filter(|&f| !self.is_declaration(f)).collect()
    }

    /// All instructions of a function in block layout order.
    pub fn all_insts(&self, func: Value) -> Vec<Value> {
        let mut out = Vec::new();
        for &b in self.func_blocks(func) {
            out.extend_from_slice(self.block_insts(b));
        }
        out
    }
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}
