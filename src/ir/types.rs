//! The IR type system.
//!
//! Types are immutable and interned: primitives are pre-interned singletons,
//! composites (pointers, arrays, function types) are deduplicated
//! structurally on construction. Because of interning, handle equality *is*
//! structural equality, so `Ty: Eq` gives `is_same` for free.
//!
//! Sizes follow the 64-bit ABI: pointers are 8 bytes. (An earlier revision
//! of this compiler sized pointers at 4 bytes, which corrupted stack layout
//! once frames mixed pointers and scalars; the table below is the fix.)

use rustc_hash::FxHashMap;

/// A dense handle into the module's type table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ty(pub(crate) u32);

impl Ty {
    pub const VOID: Ty = Ty(0);
    pub const BOOL: Ty = Ty(1);
    pub const I8: Ty = Ty(2);
    pub const I32: Ty = Ty(3);
    pub const I64: Ty = Ty(4);
    pub const F32: Ty = Ty(5);
    pub const F64: Ty = Ty(6);
    pub const LABEL: Ty = Ty(7);
    pub const UNDEF: Ty = Ty(8);

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Structural description of a type. Composite payloads reference other
/// interned handles, never other `TypeKind`s, so comparison stays shallow.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Void,
    /// 1-bit integer produced by comparisons and consumed by branches.
    Bool,
    Int8,
    Int32,
    Int64,
    Float32,
    Float64,
    /// The type of basic blocks.
    Label,
    Undef,
    Pointer { pointee: Ty },
    /// A multi-dimensional array of a scalar element type. `dims` is the
    /// complete dimension list, outermost first; every dimension is a
    /// compile-time constant.
    Array { elem: Ty, dims: Vec<usize> },
    Function { ret: Ty, params: Vec<Ty> },
}

/// Interning table for all types of one module.
#[derive(Debug)]
pub struct TypeTable {
    kinds: Vec<TypeKind>,
    dedup: FxHashMap<TypeKind, Ty>,
}

impl TypeTable {
    pub fn new() -> Self {
        let mut table = TypeTable { kinds: Vec::new(), dedup: FxHashMap::default() };
        // Order must match the `Ty` associated constants.
        for kind in [
            TypeKind::Void,
            TypeKind::Bool,
            TypeKind::Int8,
            TypeKind::Int32,
            TypeKind::Int64,
            TypeKind::Float32,
            TypeKind::Float64,
            TypeKind::Label,
            TypeKind::Undef,
        ] {
            let ty = Ty(table.kinds.len() as u32);
            table.dedup.insert(kind.clone(), ty);
            table.kinds.push(kind);
        }
        table
    }

    fn intern(&mut self, kind: TypeKind) -> Ty {
        if let Some(&ty) = self.dedup.get(&kind) {
            return ty;
        }
        let ty = Ty(self.kinds.len() as u32);
        self.dedup.insert(kind.clone(), ty);
        self.kinds.push(kind);
        ty
    }

    #[inline]
    pub fn kind(&self, ty: Ty) -> &TypeKind {
        &self.kinds[ty.index()]
    }

    pub fn pointer(&mut self, pointee: Ty) -> Ty {
        self.intern(TypeKind::Pointer { pointee })
    }

    pub fn array(&mut self, elem: Ty, dims: Vec<usize>) -> Ty {
        debug_assert!(!dims.is_empty());
        self.intern(TypeKind::Array { elem, dims })
    }

    pub fn function(&mut self, ret: Ty, params: Vec<Ty>) -> Ty {
        self.intern(TypeKind::Function { ret, params })
    }

    /// Byte size. Void, label, and function types have no storage size and
    /// report 0.
    pub fn size(&self, ty: Ty) -> usize {
        match self.kind(ty) {
            TypeKind::Void | TypeKind::Label | TypeKind::Function { .. } | TypeKind::Undef => 0,
            TypeKind::Bool | TypeKind::Int8 => 1,
            TypeKind::Int32 | TypeKind::Float32 => 4,
            TypeKind::Int64 | TypeKind::Float64 => 8,
            TypeKind::Pointer { .. } => 8,
            TypeKind::Array { elem, dims } => {
                let elem_size = self.size(*elem);
                dims.iter().product::<usize>() * elem_size
            }
        }
    }

    /// Structural equality. Interning makes this handle equality; kept as a
    /// named operation because composites must never be compared by any
    /// other means.
    #[inline]
    pub fn is_same(&self, a: Ty, b: Ty) -> bool {
        a == b
    }

    pub fn is_int(&self, ty: Ty) -> bool {
        matches!(
            self.kind(ty),
            TypeKind::Bool | TypeKind::Int8 | TypeKind::Int32 | TypeKind::Int64
        )
    }

    pub fn is_float(&self, ty: Ty) -> bool {
        matches!(self.kind(ty), TypeKind::Float32 | TypeKind::Float64)
    }

    pub fn is_pointer(&self, ty: Ty) -> bool {
        matches!(self.kind(ty), TypeKind::Pointer { .. })
    }

    pub fn is_array(&self, ty: Ty) -> bool {
        matches!(self.kind(ty), TypeKind::Array { .. })
    }

    pub fn is_function(&self, ty: Ty) -> bool {
        matches!(self.kind(ty), TypeKind::Function { .. })
    }

    pub fn is_void(&self, ty: Ty) -> bool {
        ty == Ty::VOID
    }

    pub fn pointee(&self, ty: Ty) -> Option<Ty> {
        match self.kind(ty) {
            TypeKind::Pointer { pointee } => Some(*pointee),
            _ => None,
        }
    }

    pub fn array_elem(&self, ty: Ty) -> Option<Ty> {
        match self.kind(ty) {
            TypeKind::Array { elem, .. } => Some(*elem),
            _ => None,
        }
    }

    pub fn array_dims(&self, ty: Ty) -> Option<&[usize]> {
        match self.kind(ty) {
            TypeKind::Array { dims, .. } => Some(dims),
            _ => None,
        }
    }

    pub fn fn_ret(&self, ty: Ty) -> Option<Ty> {
        match self.kind(ty) {
            TypeKind::Function { ret, .. } => Some(*ret),
            _ => None,
        }
    }

    pub fn fn_params(&self, ty: Ty) -> Option<&[Ty]> {
        match self.kind(ty) {
            TypeKind::Function { params, .. } => Some(params),
            _ => None,
        }
    }

    /// GetElementPtr is plain pointer arithmetic: `gep(T* base, idx)` is
    /// `base + idx * sizeof(T)` and keeps the base's type.
    pub fn gep_result(&mut self, base_ptr: Ty) -> Option<Ty> {
        if self.is_pointer(base_ptr) {
            Some(base_ptr)
        } else {
            None
        }
    }

    /// Array decay: the pointer to an array's first element. For
    /// `ptr [d0 x [d1 x T]]` the result is `ptr [d1 x T]`; for a
    /// one-dimensional array, `ptr T`. `None` when the pointee is not an
    /// array.
    pub fn decay(&mut self, array_ptr: Ty) -> Option<Ty> {
        let pointee = self.pointee(array_ptr)?;
        match self.kind(pointee).clone() {
            TypeKind::Array { elem, dims } => {
                if dims.len() == 1 {
                    Some(self.pointer(elem))
                } else {
                    let inner = self.array(elem, dims[1..].to_vec());
                    Some(self.pointer(inner))
                }
            }
            _ => None,
        }
    }

    /// Render in the textual-dump syntax (`i32`, `float`, `[2 x [3 x i32]]`,
    /// `i32*`).
    pub fn display(&self, ty: Ty) -> String {
        match self.kind(ty) {
            TypeKind::Void => "void".to_string(),
            TypeKind::Bool => "i1".to_string(),
            TypeKind::Int8 => "i8".to_string(),
            TypeKind::Int32 => "i32".to_string(),
            TypeKind::Int64 => "i64".to_string(),
            TypeKind::Float32 => "float".to_string(),
            TypeKind::Float64 => "double".to_string(),
            TypeKind::Label => "label".to_string(),
            TypeKind::Undef => "undef".to_string(),
            TypeKind::Pointer { pointee } => format!("{}*", self.display(*pointee)),
            TypeKind::Array { elem, dims } => {
                let mut s = self.display(*elem);
                for d in dims.iter().rev() {
                    s = format!("[{} x {}]", d, s);
                }
                s
            }
            TypeKind::Function { ret, params } => {
                let args: Vec<String> = params.iter().map(|p| self.display(*p)).collect();
                format!("{} ({})", self.display(*ret), args.join(", "))
            }
        }
    }
}

impl Default for TypeTable {
    fn default() -> Self {
        Self::new()
    }
}
