//! The SSA value graph data model.
//!
//! Every IR object (constant, global, function, argument, basic block,
//! instruction) is a `Value`: a dense handle into the module's value table.
//! Each slot carries a shared header (type, kind tag, optional name,
//! use-list) and, through [`ValueKind`], the per-kind payload. Instructions
//! keep their operands in the header's operand vector; the paired `Use`
//! edges on the operand values keep the def-use graph navigable in both
//! directions.
//!
//! Invariants maintained by the mutation API in `module.rs`:
//! - for every `u` in `value.uses`: `module[u.user].operands[u.index] == value`
//! - for every user `x` and operand index `i`: `(x, i)` appears in
//!   `module[x.operands[i]].uses`
//! - a terminator is the last instruction of its block and nothing else is
//! - an instruction is in at most one block, recorded in `InstData::parent`

use bitflags::bitflags;

use super::types::Ty;

/// A dense handle into the module's value table. Copies are free; validity
/// is scoped to the owning module's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(pub(crate) u32);

impl Value {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One directed edge of the def-use graph: the value owning this edge is
/// operand `index` of `user`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Use {
    pub user: Value,
    pub index: usize,
}

/// Comparison predicate, shared by integer and float compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CmpPred {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CmpPred {
    /// The predicate with operand order flipped (not negated): `a < b` is
    /// `b > a`.
    pub fn swapped(self) -> CmpPred {
        match self {
            CmpPred::Eq => CmpPred::Eq,
            CmpPred::Ne => CmpPred::Ne,
            CmpPred::Gt => CmpPred::Lt,
            CmpPred::Ge => CmpPred::Le,
            CmpPred::Lt => CmpPred::Gt,
            CmpPred::Le => CmpPred::Ge,
        }
    }

    pub fn negated(self) -> CmpPred {
        match self {
            CmpPred::Eq => CmpPred::Ne,
            CmpPred::Ne => CmpPred::Eq,
            CmpPred::Gt => CmpPred::Le,
            CmpPred::Ge => CmpPred::Lt,
            CmpPred::Lt => CmpPred::Ge,
            CmpPred::Le => CmpPred::Gt,
        }
    }

    pub fn mnemonic(self, float: bool) -> &'static str {
        if float {
            match self {
                CmpPred::Eq => "oeq",
                CmpPred::Ne => "one",
                CmpPred::Gt => "ogt",
                CmpPred::Ge => "oge",
                CmpPred::Lt => "olt",
                CmpPred::Le => "ole",
            }
        } else {
            match self {
                CmpPred::Eq => "eq",
                CmpPred::Ne => "ne",
                CmpPred::Gt => "sgt",
                CmpPred::Ge => "sge",
                CmpPred::Lt => "slt",
                CmpPred::Le => "sle",
            }
        }
    }
}

/// Instruction opcodes. Operand layout per opcode:
///
/// - `Alloca`: none (the allocated type is the result's pointee)
/// - `Load`: `[ptr]`; `Store`: `[val, ptr]`
/// - `Memset`: `[ptr, byte_len]` (zero fill)
/// - `GetElementPtr`: `[base, index]` — one dimension step per instruction
/// - `Ret`: `[]` or `[val]`; `Br`: `[dest]`; `CondBr`: `[cond, then, else]`
/// - `Call`: `[callee, args...]`
/// - `Phi`: `[v0, pred0, v1, pred1, ...]`
/// - binaries/compares: `[lhs, rhs]`; casts and `FNeg`: `[src]`
/// - `AtomicAdd`: `[ptr, val]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Alloca,
    Load,
    Store,
    Memset,
    GetElementPtr,
    Ret,
    Br,
    CondBr,
    Call,
    Phi,
    Add,
    Sub,
    Mul,
    SDiv,
    SRem,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FNeg,
    ICmp(CmpPred),
    FCmp(CmpPred),
    Trunc,
    ZExt,
    SExt,
    FpTrunc,
    FpExt,
    FpToSi,
    SiToFp,
    Bitcast,
    PtrToInt,
    IntToPtr,
    AtomicAdd,
}

impl Opcode {
    pub fn is_terminator(self) -> bool {
        matches!(self, Opcode::Ret | Opcode::Br | Opcode::CondBr)
    }

    pub fn is_phi(self) -> bool {
        matches!(self, Opcode::Phi)
    }

    pub fn is_binary(self) -> bool {
        matches!(
            self,
            Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::SDiv
                | Opcode::SRem
                | Opcode::FAdd
                | Opcode::FSub
                | Opcode::FMul
                | Opcode::FDiv
        )
    }

    pub fn is_cmp(self) -> bool {
        matches!(self, Opcode::ICmp(_) | Opcode::FCmp(_))
    }

    pub fn is_cast(self) -> bool {
        matches!(
            self,
            Opcode::Trunc
                | Opcode::ZExt
                | Opcode::SExt
                | Opcode::FpTrunc
                | Opcode::FpExt
                | Opcode::FpToSi
                | Opcode::SiToFp
                | Opcode::Bitcast
                | Opcode::PtrToInt
                | Opcode::IntToPtr
        )
    }

    /// True if `a op b == b op a`.
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            Opcode::Add
                | Opcode::Mul
                | Opcode::FAdd
                | Opcode::FMul
                | Opcode::ICmp(CmpPred::Eq)
                | Opcode::ICmp(CmpPred::Ne)
                | Opcode::FCmp(CmpPred::Eq)
                | Opcode::FCmp(CmpPred::Ne)
        )
    }

    /// True if executing the instruction observably touches state beyond its
    /// result: memory writes, control transfer, and calls. Loads are handled
    /// separately by passes that can reason about aliasing.
    pub fn has_side_effect(self) -> bool {
        matches!(
            self,
            Opcode::Store
                | Opcode::Memset
                | Opcode::Call
                | Opcode::AtomicAdd
                | Opcode::Ret
                | Opcode::Br
                | Opcode::CondBr
        )
    }

    pub fn writes_memory(self) -> bool {
        matches!(self, Opcode::Store | Opcode::Memset | Opcode::AtomicAdd)
    }

    pub fn reads_memory(self) -> bool {
        matches!(self, Opcode::Load | Opcode::AtomicAdd)
    }

    /// Division and remainder can trap and must not be speculated or erased
    /// based on result-liveness alone when the divisor may be zero.
    pub fn may_trap(self) -> bool {
        matches!(self, Opcode::SDiv | Opcode::SRem)
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Alloca => "alloca",
            Opcode::Load => "load",
            Opcode::Store => "store",
            Opcode::Memset => "memset",
            Opcode::GetElementPtr => "getelementptr",
            Opcode::Ret => "ret",
            Opcode::Br => "br",
            Opcode::CondBr => "br",
            Opcode::Call => "call",
            Opcode::Phi => "phi",
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::SDiv => "sdiv",
            Opcode::SRem => "srem",
            Opcode::FAdd => "fadd",
            Opcode::FSub => "fsub",
            Opcode::FMul => "fmul",
            Opcode::FDiv => "fdiv",
            Opcode::FNeg => "fneg",
            Opcode::ICmp(_) => "icmp",
            Opcode::FCmp(_) => "fcmp",
            Opcode::Trunc => "trunc",
            Opcode::ZExt => "zext",
            Opcode::SExt => "sext",
            Opcode::FpTrunc => "fptrunc",
            Opcode::FpExt => "fpext",
            Opcode::FpToSi => "fptosi",
            Opcode::SiToFp => "sitofp",
            Opcode::Bitcast => "bitcast",
            Opcode::PtrToInt => "ptrtoint",
            Opcode::IntToPtr => "inttoptr",
            Opcode::AtomicAdd => "atomicadd",
        }
    }
}

/// A compile-time constant. Floats are compared and hashed by bit pattern
/// via [`ConstKind::hash_key`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstKind {
    Undef,
    Bool(bool),
    Int(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
}

/// Hashable key for the constant pool, using bit patterns for floats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstKey {
    Undef,
    Bool(bool),
    Int(i32),
    Int64(i64),
    Float(u32),
    Double(u64),
}

impl ConstKind {
    pub fn hash_key(&self) -> ConstKey {
        match *self {
            ConstKind::Undef => ConstKey::Undef,
            ConstKind::Bool(b) => ConstKey::Bool(b),
            ConstKind::Int(v) => ConstKey::Int(v),
            ConstKind::Int64(v) => ConstKey::Int64(v),
            ConstKind::Float(v) => ConstKey::Float(v.to_bits()),
            ConstKind::Double(v) => ConstKey::Double(v.to_bits()),
        }
    }

    pub fn is_zero(&self) -> bool {
        match *self {
            ConstKind::Undef => false,
            ConstKind::Bool(b) => !b,
            ConstKind::Int(v) => v == 0,
            ConstKind::Int64(v) => v == 0,
            ConstKind::Float(v) => v == 0.0,
            ConstKind::Double(v) => v == 0.0,
        }
    }

    pub fn is_one(&self) -> bool {
        match *self {
            ConstKind::Bool(b) => b,
            ConstKind::Int(v) => v == 1,
            ConstKind::Int64(v) => v == 1,
            ConstKind::Float(v) => v == 1.0,
            ConstKind::Double(v) => v == 1.0,
            ConstKind::Undef => false,
        }
    }

    /// Integer view (sign-extended); `None` for floats and undef.
    pub fn as_int(&self) -> Option<i64> {
        match *self {
            ConstKind::Bool(b) => Some(b as i64),
            ConstKind::Int(v) => Some(v as i64),
            ConstKind::Int64(v) => Some(v),
            _ => None,
        }
    }

    /// Float view; integers convert exactly where f64 permits.
    pub fn as_float(&self) -> Option<f64> {
        match *self {
            ConstKind::Float(v) => Some(v as f64),
            ConstKind::Double(v) => Some(v),
            ConstKind::Bool(b) => Some(b as i64 as f64),
            ConstKind::Int(v) => Some(v as f64),
            ConstKind::Int64(v) => Some(v as f64),
            ConstKind::Undef => None,
        }
    }

    pub fn is_nonzero(&self) -> bool {
        !self.is_zero() && !matches!(self, ConstKind::Undef)
    }
}

/// Initializer of a global. Array initializers are flattened row-major;
/// trailing zeros may be elided by the generator.
#[derive(Debug, Clone, PartialEq)]
pub enum GlobalInit {
    /// Zero-initialized storage.
    Zero,
    Scalar(ConstKind),
    Array(Vec<ConstKind>),
}

#[derive(Debug, Clone)]
pub struct GlobalData {
    pub init: GlobalInit,
    /// Declared `const` in the source; stores to it are ill-formed.
    pub is_const: bool,
}

bitflags! {
    /// Function attribute bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FnAttrs: u8 {
        /// External runtime-library declaration.
        const BUILTIN = 1 << 0;
        /// Outlined loop body invoked through the parallel-for runtime.
        const PARALLEL_BODY = 1 << 1;
        /// Excluded from inlining (e.g. parallel bodies).
        const NO_INLINE = 1 << 2;
    }
}

#[derive(Debug, Clone)]
pub struct FunctionData {
    /// Argument values, one per parameter of the function type.
    pub args: Vec<Value>,
    /// Basic blocks in layout order; `blocks[0]` is the entry. Empty for
    /// declarations.
    pub blocks: Vec<Value>,
    pub attrs: FnAttrs,
    /// Monotone counter for generated local names.
    pub(crate) name_counter: u32,
}

#[derive(Debug, Clone)]
pub struct BlockData {
    /// The owning function.
    pub func: Value,
    /// Instructions in execution order: phis first, terminator last.
    pub insts: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct InstData {
    pub op: Opcode,
    /// The containing block, `None` while detached.
    pub parent: Option<Value>,
}

/// Kind tag plus per-kind payload.
#[derive(Debug, Clone)]
pub enum ValueKind {
    Const(ConstKind),
    Global(GlobalData),
    Function(FunctionData),
    Argument { func: Value, index: usize },
    Block(BlockData),
    Inst(InstData),
}

/// Shared header of every IR object.
#[derive(Debug, Clone)]
pub struct ValueData {
    pub ty: Ty,
    pub kind: ValueKind,
    pub name: Option<String>,
    /// Every `(user, operand-index)` currently referencing this value.
    /// Unordered; mutated only through the module's def-use operations.
    pub(crate) uses: Vec<Use>,
    /// Operand edges for users; empty for non-users.
    pub(crate) operands: Vec<Value>,
}

impl ValueData {
    pub(crate) fn new(ty: Ty, kind: ValueKind) -> Self {
        ValueData { ty, kind, name: None, uses: Vec::new(), operands: Vec::new() }
    }

    #[inline]
    pub fn uses(&self) -> &[Use] {
        &self.uses
    }

    #[inline]
    pub fn operands(&self) -> &[Value] {
        &self.operands
    }

    pub fn is_inst(&self) -> bool {
        matches!(self.kind, ValueKind::Inst(_))
    }

    pub fn is_block(&self) -> bool {
        matches!(self.kind, ValueKind::Block(_))
    }

    pub fn is_function(&self) -> bool {
        matches!(self.kind, ValueKind::Function(_))
    }

    pub fn is_const(&self) -> bool {
        matches!(self.kind, ValueKind::Const(_))
    }

    pub fn is_global(&self) -> bool {
        matches!(self.kind, ValueKind::Global(_))
    }

    pub fn is_argument(&self) -> bool {
        matches!(self.kind, ValueKind::Argument { .. })
    }

    pub fn const_kind(&self) -> Option<ConstKind> {
        match self.kind {
            ValueKind::Const(c) => Some(c),
            _ => None,
        }
    }

    pub fn inst(&self) -> Option<&InstData> {
        match &self.kind {
            ValueKind::Inst(i) => Some(i),
            _ => None,
        }
    }

    pub fn opcode(&self) -> Option<Opcode> {
        self.inst().map(|i| i.op)
    }

    pub fn block(&self) -> Option<&BlockData> {
        match &self.kind {
            ValueKind::Block(b) => Some(b),
            _ => None,
        }
    }

    pub fn function(&self) -> Option<&FunctionData> {
        match &self.kind {
            ValueKind::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn global(&self) -> Option<&GlobalData> {
        match &self.kind {
            ValueKind::Global(g) => Some(g),
            _ => None,
        }
    }
}
