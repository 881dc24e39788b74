//! AST-to-IR translation.
//!
//! A lexical-order visit over the `CompUnit` with a scope stack of symbol
//! tables: locals map to stack slots, globals to global objects, constants
//! to folded constant values. Compile-time folding of constant scalar
//! expressions is mandatory (array dimensions and const initializers must
//! fold); everything else lowers through the builder, which owns the
//! short-circuit target stacks and type promotion.

mod expr;
mod stmt;

use rustc_hash::FxHashMap;

use crate::ast::{BType, CompUnit, Decl, Expr, FuncDef, InitVal, Item, Span, VarDef};
use crate::error::{MidendError, Result};
use crate::ir::{ConstKind, FnAttrs, GlobalInit, IrBuilder, Module, Ty, Value};

/// Translate a whole compilation unit into a fresh module.
pub fn generate(ast: &CompUnit) -> Result<Module> {
    let mut module = Module::new();
    declare_runtime(&mut module);
    let mut gen = IrGen { b: IrBuilder::new(&mut module), scopes: vec![FxHashMap::default()], cur_ret: Ty::VOID };
    for item in &ast.items {
        match item {
            Item::Decl(d) => gen.global_decl(d)?,
            Item::Func(f) => gen.function(f)?,
        }
    }
    drop(gen);
    log::debug!("irgen: built module with {} functions", module.functions.len());
    Ok(module)
}

/// The SysY runtime library surface, registered as external declarations.
fn declare_runtime(m: &mut Module) {
    let pi32 = m.types.pointer(Ty::I32);
    let pf32 = m.types.pointer(Ty::F32);
    let sigs: Vec<(&str, Ty, Vec<Ty>)> = vec![
        ("getint", Ty::I32, vec![]),
        ("getch", Ty::I32, vec![]),
        ("getfloat", Ty::F32, vec![]),
        ("getarray", Ty::I32, vec![pi32]),
        ("getfarray", Ty::I32, vec![pf32]),
        ("putint", Ty::VOID, vec![Ty::I32]),
        ("putch", Ty::VOID, vec![Ty::I32]),
        ("putfloat", Ty::VOID, vec![Ty::F32]),
        ("putarray", Ty::VOID, vec![Ty::I32, pi32]),
        ("putfarray", Ty::VOID, vec![Ty::I32, pf32]),
        ("starttime", Ty::VOID, vec![]),
        ("stoptime", Ty::VOID, vec![]),
    ];
    for (name, ret, params) in sigs {
        let fn_ty = m.types.function(ret, params);
        let f = m.add_function(name, fn_ty);
        m.set_fn_attrs(f, FnAttrs::BUILTIN);
    }
}

/// A resolved name.
#[derive(Clone)]
pub(crate) enum Symbol {
    Var(VarSym),
    /// A `const` scalar, folded away at its definition.
    Const(ConstKind),
}

#[derive(Clone)]
pub(crate) struct VarSym {
    /// Pointer to the storage: an alloca, a global, or (for array
    /// parameters) an alloca holding the incoming pointer.
    pub ptr: Value,
    pub elem_ty: Ty,
    /// Empty for scalars. Array parameters use 0 for the open first
    /// dimension.
    pub dims: Vec<usize>,
    /// True when `ptr` is an alloca of a pointer (array parameter slot).
    pub is_param_ptr: bool,
    /// Flattened element values of a `const` array, for subscript folding.
    pub const_data: Option<Vec<ConstKind>>,
}

pub(crate) struct IrGen<'m> {
    pub b: IrBuilder<'m>,
    scopes: Vec<FxHashMap<String, Symbol>>,
    pub cur_ret: Ty,
}

impl<'m> IrGen<'m> {
    // ── Scopes ────────────────────────────────────────────────────────────

    pub fn push_scope(&mut self) {
        self.scopes.push(FxHashMap::default());
    }

    pub fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    pub fn define(&mut self, name: &str, sym: Symbol) {
        self.scopes.last_mut().expect("scope stack").insert(name.to_string(), sym);
    }

    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.scopes.iter().rev().find_map(|s| s.get(name))
    }

    pub fn base_ty(&self, b: BType) -> Ty {
        match b {
            BType::Int => Ty::I32,
            BType::Float => Ty::F32,
        }
    }

    fn type_err<T>(&self, msg: impl Into<String>, span: Span) -> Result<T> {
        Err(MidendError::type_error(msg, span.line, span.col))
    }

    // ── Declarations ──────────────────────────────────────────────────────

    fn global_decl(&mut self, d: &Decl) -> Result<()> {
        for def in &d.defs {
            self.global_def(d, def)?;
        }
        Ok(())
    }

    fn global_def(&mut self, d: &Decl, def: &VarDef) -> Result<()> {
        let elem_ty = self.base_ty(d.btype);
        let dims = self.eval_dims(&def.dims)?;

        if dims.is_empty() {
            // Scalar.
            let value = match &def.init {
                Some(InitVal::Expr(e)) => self.eval_const_as(e, elem_ty)?,
                Some(InitVal::List(_)) => {
                    return self.type_err("brace initializer on a scalar", def.span);
                }
                None => zero_const(elem_ty),
            };
            if d.is_const {
                self.define(&def.name, Symbol::Const(value));
                return Ok(());
            }
            let init =
                if value.is_zero() { GlobalInit::Zero } else { GlobalInit::Scalar(value) };
            let g = self.b.module.add_global(def.name.clone(), elem_ty, init, false);
            self.define(
                &def.name,
                Symbol::Var(VarSym {
                    ptr: g,
                    elem_ty,
                    dims,
                    is_param_ptr: false,
                    const_data: None,
                }),
            );
            return Ok(());
        }

        // Array: every element must fold.
        let total: usize = dims.iter().product();
        let mut data = vec![zero_const(elem_ty); total];
        if let Some(init) = &def.init {
            let mut slots: Vec<Option<&Expr>> = vec![None; total];
            flatten_init(init, &dims, &mut slots, def.span)?;
            for (i, slot) in slots.iter().enumerate() {
                if let Some(e) = slot {
                    data[i] = self.eval_const_as(e, elem_ty)?;
                }
            }
        }
        let arr_ty = self.b.module.types.array(elem_ty, dims.clone());
        let init = if data.iter().all(|c| c.is_zero()) {
            GlobalInit::Zero
        } else {
            GlobalInit::Array(data.clone())
        };
        let g = self.b.module.add_global(def.name.clone(), arr_ty, init, d.is_const);
        self.define(
            &def.name,
            Symbol::Var(VarSym {
                ptr: g,
                elem_ty,
                dims,
                is_param_ptr: false,
                const_data: d.is_const.then_some(data),
            }),
        );
        Ok(())
    }

    pub(crate) fn local_decl(&mut self, d: &Decl) -> Result<()> {
        for def in &d.defs {
            self.local_def(d, def)?;
        }
        Ok(())
    }

    fn local_def(&mut self, d: &Decl, def: &VarDef) -> Result<()> {
        let elem_ty = self.base_ty(d.btype);
        let dims = self.eval_dims(&def.dims)?;

        if dims.is_empty() {
            if d.is_const {
                let Some(InitVal::Expr(e)) = &def.init else {
                    return self.type_err("const scalar without an initializer", def.span);
                };
                let value = self.eval_const_as(e, elem_ty)?;
                self.define(&def.name, Symbol::Const(value));
                return Ok(());
            }
            let slot = self.b.make_alloca(elem_ty);
            self.b.module.set_name(slot, def.name.clone());
            if let Some(init) = &def.init {
                let InitVal::Expr(e) = init else {
                    return self.type_err("brace initializer on a scalar", def.span);
                };
                let v = self.lower_expr(e)?;
                let v = self.b.promote(v, elem_ty)?;
                self.b.make_store(v, slot);
            }
            self.define(
                &def.name,
                Symbol::Var(VarSym {
                    ptr: slot,
                    elem_ty,
                    dims,
                    is_param_ptr: false,
                    const_data: None,
                }),
            );
            return Ok(());
        }

        // Local const array: materialized as a module-level constant so
        // runtime subscripts work; const subscripts fold via const_data.
        if d.is_const {
            let total: usize = dims.iter().product();
            let mut data = vec![zero_const(elem_ty); total];
            if let Some(init) = &def.init {
                let mut slots: Vec<Option<&Expr>> = vec![None; total];
                flatten_init(init, &dims, &mut slots, def.span)?;
                for (i, slot) in slots.iter().enumerate() {
                    if let Some(e) = slot {
                        data[i] = self.eval_const_as(e, elem_ty)?;
                    }
                }
            }
            let arr_ty = self.b.module.types.array(elem_ty, dims.clone());
            let fname = self.b.module.func_name(self.b.cur_function()).to_string();
            let gname = format!("__const.{}.{}", fname, def.name);
            let init = if data.iter().all(|c| c.is_zero()) {
                GlobalInit::Zero
            } else {
                GlobalInit::Array(data.clone())
            };
            let g = self.b.module.add_global(gname, arr_ty, init, true);
            self.define(
                &def.name,
                Symbol::Var(VarSym {
                    ptr: g,
                    elem_ty,
                    dims,
                    is_param_ptr: false,
                    const_data: Some(data),
                }),
            );
            return Ok(());
        }

        let total: usize = dims.iter().product();
        let arr_ty = self.b.module.types.array(elem_ty, dims.clone());
        let slot = self.b.make_alloca(arr_ty);
        self.b.module.set_name(slot, def.name.clone());
        if let Some(init) = &def.init {
            // Zero-fill first, then store the explicit elements.
            let bytes = self.b.module.types.size(arr_ty);
            self.b.make_memset(slot, bytes);
            let mut slots: Vec<Option<&Expr>> = vec![None; total];
            flatten_init(init, &dims, &mut slots, def.span)?;
            let base = self.flat_elem_base(slot);
            for (i, s) in slots.iter().enumerate() {
                let Some(e) = s else { continue };
                let v = self.lower_expr(e)?;
                let v = self.b.promote(v, elem_ty)?;
                let idx = self.b.module.const_int(i as i32);
                let addr = self.b.make_gep(base, idx);
                self.b.make_store(v, addr);
            }
        }
        self.define(
            &def.name,
            Symbol::Var(VarSym { ptr: slot, elem_ty, dims, is_param_ptr: false, const_data: None }),
        );
        Ok(())
    }

    /// Decay a pointer-to-array down to a pointer to its scalar element
    /// type, for flat element addressing.
    fn flat_elem_base(&mut self, mut ptr: Value) -> Value {
        while self
            .b
            .module
            .types
            .pointee(self.b.module.ty(ptr))
            .is_some_and(|p| self.b.module.types.is_array(p))
        {
            ptr = self.b.make_decay(ptr);
        }
        ptr
    }

    fn eval_dims(&mut self, dims: &[Expr]) -> Result<Vec<usize>> {
        dims.iter()
            .map(|e| {
                let c = self.eval_const(e)?;
                match c.as_int() {
                    Some(v) if v > 0 => Ok(v as usize),
                    _ => Err(MidendError::type_error(
                        "array dimension is not a positive constant",
                        e.span().line,
                        e.span().col,
                    )),
                }
            })
            .collect()
    }

    // ── Functions ─────────────────────────────────────────────────────────

    fn function(&mut self, f: &FuncDef) -> Result<()> {
        let ret_ty = match f.ret {
            Some(b) => self.base_ty(b),
            None => Ty::VOID,
        };
        let mut param_tys = Vec::with_capacity(f.params.len());
        let mut param_meta = Vec::with_capacity(f.params.len());
        for p in &f.params {
            let elem_ty = self.base_ty(p.btype);
            match &p.dims {
                None => {
                    param_tys.push(elem_ty);
                    param_meta.push((elem_ty, Vec::new()));
                }
                Some(inner) => {
                    let inner_dims = self.eval_dims(inner)?;
                    let pointee = if inner_dims.is_empty() {
                        elem_ty
                    } else {
                        self.b.module.types.array(elem_ty, inner_dims.clone())
                    };
                    let pty = self.b.module.types.pointer(pointee);
                    param_tys.push(pty);
                    let mut dims = vec![0usize];
                    dims.extend(&inner_dims);
                    param_meta.push((elem_ty, dims));
                }
            }
        }
        let fn_ty = self.b.module.types.function(ret_ty, param_tys);
        let func = self.b.module.add_function(f.name.clone(), fn_ty);
        self.cur_ret = ret_ty;
        self.b.set_function(func);

        let entry = self.b.module.add_block(func);
        self.b.module.set_name(entry, "entry");
        self.b.set_insert_end(entry);

        self.push_scope();
        let args: Vec<Value> = self.b.module.func_args(func).to_vec();
        for ((arg, p), (elem_ty, dims)) in args.into_iter().zip(&f.params).zip(param_meta) {
            self.b.module.set_name(arg, p.name.clone());
            let slot_ty = self.b.module.ty(arg);
            let slot = self.b.make_alloca(slot_ty);
            self.b.module.set_name(slot, format!("{}.addr", p.name));
            self.b.make_store(arg, slot);
            let is_param_ptr = !dims.is_empty();
            self.define(
                &p.name,
                Symbol::Var(VarSym { ptr: slot, elem_ty, dims, is_param_ptr, const_data: None }),
            );
        }

        self.block(&f.body)?;

        // Fall-through return.
        if !self.b.block_terminated() {
            match ret_ty {
                Ty::VOID => {
                    self.b.make_ret(None);
                }
                ty => {
                    let zero = self.b.module.const_zero(ty);
                    self.b.make_ret(Some(zero));
                }
            }
        }
        self.pop_scope();
        Ok(())
    }
}

fn zero_const(ty: Ty) -> ConstKind {
    match ty {
        Ty::F32 => ConstKind::Float(0.0),
        Ty::F64 => ConstKind::Double(0.0),
        Ty::I64 => ConstKind::Int64(0),
        Ty::BOOL => ConstKind::Bool(false),
        _ => ConstKind::Int(0),
    }
}

/// Place initializer expressions into a flattened element array, honoring
/// brace nesting: a nested list fills the next-aligned sub-array of the
/// following dimension.
fn flatten_init<'a>(
    init: &'a InitVal,
    dims: &[usize],
    out: &mut Vec<Option<&'a Expr>>,
    span: Span,
) -> Result<()> {
    fn go<'a>(
        items: &'a [InitVal],
        dims: &[usize],
        out: &mut Vec<Option<&'a Expr>>,
        base: usize,
        span: Span,
    ) -> Result<()> {
        let total: usize = dims.iter().product();
        let sub: usize = if dims.len() > 1 { dims[1..].iter().product() } else { 1 };
        let mut cursor = 0usize;
        for item in items {
            match item {
                InitVal::Expr(e) => {
                    if cursor >= total {
                        return Err(MidendError::type_error(
                            "too many initializer elements",
                            span.line,
                            span.col,
                        ));
                    }
                    out[base + cursor] = Some(e);
                    cursor += 1;
                }
                InitVal::List(inner) => {
                    if dims.len() <= 1 {
                        return Err(MidendError::type_error(
                            "braces nested deeper than the array",
                            span.line,
                            span.col,
                        ));
                    }
                    // Align to the next sub-array boundary.
                    cursor = (cursor + sub - 1) / sub * sub;
                    if cursor >= total {
                        return Err(MidendError::type_error(
                            "too many initializer elements",
                            span.line,
                            span.col,
                        ));
                    }
                    go(inner, &dims[1..], out, base + cursor, span)?;
                    cursor += sub;
                }
            }
        }
        Ok(())
    }

    match init {
        InitVal::Expr(e) => {
            out[0] = Some(e);
            Ok(())
        }
        InitVal::List(items) => go(items, dims, out, 0, span),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::*;
    use crate::ir::verify::verify;

    fn unit(items: Vec<Item>) -> CompUnit {
        CompUnit { items }
    }

    #[test]
    fn globals_fold_and_zero_collapse() {
        // const int n = 4; int g = n + 1; int z[4] = {};
        let ast = unit(vec![
            Item::Decl(Decl::const_scalar(BType::Int, "n", Expr::int(4))),
            Item::Decl(Decl::var(
                BType::Int,
                "g",
                Some(Expr::binary(BinOp::Add, Expr::var("n"), Expr::int(1))),
            )),
            Item::Decl(Decl::array(
                BType::Int,
                "z",
                vec![Expr::var("n")],
                Some(InitVal::List(vec![])),
            )),
        ]);
        let m = generate(&ast).unwrap();
        // `n` folded: only g and z exist as globals.
        assert_eq!(m.globals.len(), 2);
        let g = m.globals[0];
        assert_eq!(m.value(g).global().unwrap().init, GlobalInit::Scalar(ConstKind::Int(5)));
        let z = m.globals[1];
        assert_eq!(m.value(z).global().unwrap().init, GlobalInit::Zero);
        assert!(verify(&m).is_ok());
    }

    #[test]
    fn nested_brace_initializer_aligns() {
        // int a[2][3] = {{1}, 2};  -> [1,0,0, 2,0,0] per brace alignment?
        // No: the nested {1} fills row 0, then 2 lands at flat index 3.
        let ast = unit(vec![Item::Decl(Decl::array(
            BType::Int,
            "a",
            vec![Expr::int(2), Expr::int(3)],
            Some(InitVal::List(vec![
                InitVal::List(vec![InitVal::Expr(Expr::int(1))]),
                InitVal::Expr(Expr::int(2)),
            ])),
        ))]);
        let m = generate(&ast).unwrap();
        let g = m.globals[0];
        match &m.value(g).global().unwrap().init {
            GlobalInit::Array(v) => {
                let ints: Vec<i32> = v
                    .iter()
                    .map(|c| c.as_int().unwrap() as i32)
                    .collect();
                assert_eq!(ints, vec![1, 0, 0, 2, 0, 0]);
            }
            other => panic!("expected array init, got {other:?}"),
        }
    }

    #[test]
    fn runtime_functions_are_declared_builtin() {
        let m = generate(&unit(vec![])).unwrap();
        let g = m.find_function("getint").unwrap();
        assert!(m.is_declaration(g));
        assert!(m.fn_attrs(g).contains(FnAttrs::BUILTIN));
        assert!(m.find_function("putarray").is_some());
    }

    #[test]
    fn bad_dimension_is_a_type_error() {
        let ast = unit(vec![Item::Decl(Decl::array(
            BType::Int,
            "a",
            vec![Expr::var("unknown")],
            None,
        ))]);
        match generate(&ast) {
            Err(MidendError::Type { .. }) => {}
            other => panic!("expected type error, got {other:?}"),
        }
    }
}
