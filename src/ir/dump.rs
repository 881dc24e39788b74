//! Textual IR dump.
//!
//! Emits a human-readable form close to a well-known IR textual syntax so
//! external tooling can be pointed at it during debugging. `parse.rs` reads
//! the same form back; the pair serves as a structural round-trip oracle in
//! tests. The format is a debugging aid, not a stable interface.

use std::fmt::Write as _;

use rustc_hash::FxHashMap;

use super::module::Module;
use super::types::Ty;
use super::value::{ConstKind, FnAttrs, GlobalInit, Opcode, Value, ValueKind};

/// Render the whole module.
pub fn print_module(m: &Module) -> String {
    let mut out = String::new();
    for &g in &m.globals {
        print_global(m, g, &mut out);
    }
    if !m.globals.is_empty() {
        out.push('\n');
    }
    let mut first = true;
    for &f in &m.functions {
        if !first {
            out.push('\n');
        }
        first = false;
        if m.is_declaration(f) {
            print_declaration(m, f, &mut out);
        } else {
            print_function(m, f, &mut out);
        }
    }
    out
}

pub fn print_function_only(m: &Module, func: Value) -> String {
    let mut out = String::new();
    if m.is_declaration(func) {
        print_declaration(m, func, &mut out);
    } else {
        print_function(m, func, &mut out);
    }
    out
}

fn print_global(m: &Module, g: Value, out: &mut String) {
    let data = m.value(g).global().expect("global");
    let content_ty = m.types.pointee(m.ty(g)).expect("global has pointer type");
    let kw = if data.is_const { "constant" } else { "global" };
    let name = m.value(g).name.as_deref().unwrap_or("g");
    let _ = write!(out, "@{} = {} {} ", name, kw, m.types.display(content_ty));
    match &data.init {
        GlobalInit::Zero => out.push_str("zeroinitializer"),
        GlobalInit::Scalar(c) => out.push_str(&const_literal(*c)),
        GlobalInit::Array(cs) => {
            out.push('[');
            for (i, c) in cs.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&const_literal(*c));
            }
            out.push(']');
        }
    }
    out.push('\n');
}

fn attr_suffix(attrs: FnAttrs) -> String {
    let mut s = String::new();
    if attrs.contains(FnAttrs::BUILTIN) {
        s.push_str(" builtin");
    }
    if attrs.contains(FnAttrs::PARALLEL_BODY) {
        s.push_str(" parallel_body");
    }
    if attrs.contains(FnAttrs::NO_INLINE) {
        s.push_str(" noinline");
    }
    s
}

fn print_declaration(m: &Module, f: Value, out: &mut String) {
    let ret = m.fn_return_ty(f);
    let params: Vec<String> = m
        .func_args(f)
        .iter()
        .map(|&a| m.types.display(m.ty(a)))
        .collect();
    let _ = writeln!(
        out,
        "declare {} @{}({}){}",
        m.types.display(ret),
        m.func_name(f),
        params.join(", "),
        attr_suffix(m.fn_attrs(f))
    );
}

/// Stable printed names for one function's locals: the stored name when it
/// is unique, otherwise a fresh `t<n>`.
struct Namer {
    names: FxHashMap<Value, String>,
    taken: FxHashMap<String, u32>,
    next: u32,
}

impl Namer {
    fn new() -> Self {
        Namer { names: FxHashMap::default(), taken: FxHashMap::default(), next: 0 }
    }

    fn assign(&mut self, m: &Module, v: Value) -> String {
        if !self.names.contains_key(&v) {
            let base = match &m.value(v).name {
                Some(n) if !n.is_empty() => n.clone(),
                _ => {
                    let n = format!("t{}", self.next);
                    self.next += 1;
                    n
                }
            };
            let name = match self.taken.get_mut(&base) {
                Some(count) => {
                    *count += 1;
                    format!("{}.{}", base, count)
                }
                None => {
                    self.taken.insert(base.clone(), 0);
                    base
                }
            };
            self.names.insert(v, name);
        }
        self.names[&v].clone()
    }
}

fn print_function(m: &Module, f: Value, out: &mut String) {
    let mut namer = Namer::new();
    // Name arguments and blocks first so references are stable.
    for &a in m.func_args(f) {
        namer.assign(m, a);
    }
    for &b in m.func_blocks(f) {
        namer.assign(m, b);
    }

    let ret = m.fn_return_ty(f);
    let params: Vec<String> = m
        .func_args(f)
        .iter()
        .map(|&a| format!("{} %{}", m.types.display(m.ty(a)), namer.assign(m, a)))
        .collect();
    let _ = writeln!(
        out,
        "define {} @{}({}){} {{",
        m.types.display(ret),
        m.func_name(f),
        params.join(", "),
        attr_suffix(m.fn_attrs(f))
    );

    for (bi, &b) in m.func_blocks(f).iter().enumerate() {
        if bi > 0 {
            out.push('\n');
        }
        let _ = writeln!(out, "{}:", namer.assign(m, b));
        for &inst in m.block_insts(b) {
            out.push_str("  ");
            print_inst(m, inst, &mut namer, out);
            out.push('\n');
        }
    }
    out.push_str("}\n");
}

/// Operand reference with its type prefix (`i32 %x`, `i32 5`).
fn typed_ref(m: &Module, v: Value, namer: &mut Namer) -> String {
    format!("{} {}", m.types.display(m.ty(v)), bare_ref(m, v, namer))
}

/// Operand reference without the type (`%x`, `5`, `@g`).
fn bare_ref(m: &Module, v: Value, namer: &mut Namer) -> String {
    match &m.value(v).kind {
        ValueKind::Const(c) => const_literal(*c),
        ValueKind::Global(_) | ValueKind::Function(_) => {
            format!("@{}", m.value(v).name.as_deref().unwrap_or(""))
        }
        _ => format!("%{}", namer.assign(m, v)),
    }
}

fn const_literal(c: ConstKind) -> String {
    match c {
        ConstKind::Undef => "undef".to_string(),
        ConstKind::Bool(b) => if b { "true" } else { "false" }.to_string(),
        ConstKind::Int(v) => v.to_string(),
        ConstKind::Int64(v) => v.to_string(),
        // Rust's shortest-round-trip float formatting; the reader parses the
        // literal back to the identical bit pattern.
        ConstKind::Float(v) => {
            if v == v.trunc() && v.abs() < 1e15 {
                format!("{:.1}", v)
            } else {
                format!("{}", v)
            }
        }
        ConstKind::Double(v) => {
            if v == v.trunc() && v.abs() < 1e15 {
                format!("{:.1}", v)
            } else {
                format!("{}", v)
            }
        }
    }
}

fn print_inst(m: &Module, inst: Value, namer: &mut Namer, out: &mut String) {
    let op = m.opcode(inst).expect("instruction");
    let ops = m.operands(inst);
    let ty = m.ty(inst);
    match op {
        Opcode::Alloca => {
            let content = m.types.pointee(ty).expect("alloca result is a pointer");
            let _ = write!(
                out,
                "%{} = alloca {}",
                namer.assign(m, inst),
                m.types.display(content)
            );
        }
        Opcode::Load => {
            let _ = write!(
                out,
                "%{} = load {}, {}",
                namer.assign(m, inst),
                m.types.display(ty),
                typed_ref(m, ops[0], namer)
            );
        }
        Opcode::Store => {
            let _ = write!(
                out,
                "store {}, {}",
                typed_ref(m, ops[0], namer),
                typed_ref(m, ops[1], namer)
            );
        }
        Opcode::Memset => {
            let _ = write!(
                out,
                "memset {}, {}",
                typed_ref(m, ops[0], namer),
                typed_ref(m, ops[1], namer)
            );
        }
        Opcode::GetElementPtr => {
            let base_pointee = m.types.pointee(m.ty(ops[0])).expect("gep base is a pointer");
            let _ = write!(
                out,
                "%{} = getelementptr {}, {}, {}",
                namer.assign(m, inst),
                m.types.display(base_pointee),
                typed_ref(m, ops[0], namer),
                typed_ref(m, ops[1], namer)
            );
        }
        Opcode::Ret => match ops.first() {
            Some(&v) => {
                let _ = write!(out, "ret {}", typed_ref(m, v, namer));
            }
            None => out.push_str("ret void"),
        },
        Opcode::Br => {
            let _ = write!(out, "br label %{}", namer.assign(m, ops[0]));
        }
        Opcode::CondBr => {
            let cond = typed_ref(m, ops[0], namer);
            let t = namer.assign(m, ops[1]);
            let e = namer.assign(m, ops[2]);
            let _ = write!(out, "br {}, label %{}, label %{}", cond, t, e);
        }
        Opcode::Call => {
            let callee = ops[0];
            let args: Vec<String> =
                ops[1..].iter().map(|&a| typed_ref(m, a, namer)).collect();
            if ty == Ty::VOID {
                let _ = write!(
                    out,
                    "call void @{}({})",
                    m.func_name(callee),
                    args.join(", ")
                );
            } else {
                let _ = write!(
                    out,
                    "%{} = call {} @{}({})",
                    namer.assign(m, inst),
                    m.types.display(ty),
                    m.func_name(callee),
                    args.join(", ")
                );
            }
        }
        Opcode::Phi => {
            let pairs: Vec<String> = m
                .phi_incoming(inst)
                .iter()
                .map(|&(v, b)| {
                    format!("[ {}, %{} ]", bare_ref(m, v, namer), namer.assign(m, b))
                })
                .collect();
            let _ = write!(
                out,
                "%{} = phi {} {}",
                namer.assign(m, inst),
                m.types.display(ty),
                pairs.join(", ")
            );
        }
        Opcode::ICmp(p) | Opcode::FCmp(p) => {
            let float = matches!(op, Opcode::FCmp(_));
            let _ = write!(
                out,
                "%{} = {} {} {}, {}",
                namer.assign(m, inst),
                if float { "fcmp" } else { "icmp" },
                p.mnemonic(float),
                typed_ref(m, ops[0], namer),
                bare_ref(m, ops[1], namer)
            );
        }
        Opcode::FNeg => {
            let _ = write!(
                out,
                "%{} = fneg {}",
                namer.assign(m, inst),
                typed_ref(m, ops[0], namer)
            );
        }
        op if op.is_cast() => {
            let _ = write!(
                out,
                "%{} = {} {} to {}",
                namer.assign(m, inst),
                op.mnemonic(),
                typed_ref(m, ops[0], namer),
                m.types.display(ty)
            );
        }
        Opcode::AtomicAdd => {
            let _ = write!(
                out,
                "%{} = atomicadd {}, {}",
                namer.assign(m, inst),
                typed_ref(m, ops[0], namer),
                typed_ref(m, ops[1], namer)
            );
        }
        // Binary arithmetic.
        _ => {
            let _ = write!(
                out,
                "%{} = {} {} {}, {}",
                namer.assign(m, inst),
                op.mnemonic(),
                m.types.display(ty),
                bare_ref(m, ops[0], namer),
                bare_ref(m, ops[1], namer)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::{BinaryOp, IrBuilder};
    use crate::ir::value::CmpPred;

    #[test]
    fn prints_a_small_function() {
        let mut m = Module::new();
        let fn_ty = m.types.function(Ty::I32, vec![Ty::I32, Ty::I32]);
        let f = m.add_function("max", fn_ty);
        let entry = m.add_block(f);
        let then_bb = m.add_block(f);
        let else_bb = m.add_block(f);
        let (a, b) = (m.func_args(f)[0], m.func_args(f)[1]);

        let mut bld = IrBuilder::new(&mut m);
        bld.set_function(f);
        bld.set_insert_end(entry);
        let cmp = bld.make_cmp(CmpPred::Gt, a, b).unwrap();
        bld.make_cond_br(cmp, then_bb, else_bb);
        bld.set_insert_end(then_bb);
        bld.make_ret(Some(a));
        bld.set_insert_end(else_bb);
        bld.make_ret(Some(b));

        let text = print_module(&m);
        assert!(text.contains("define i32 @max(i32 %arg0, i32 %arg1) {"));
        assert!(text.contains("icmp sgt i32 %arg0, %arg1"));
        assert!(text.contains("ret i32 %arg0"));
    }

    #[test]
    fn prints_globals_and_phis() {
        let mut m = Module::new();
        let arr = m.types.array(Ty::I32, vec![3]);
        m.add_global(
            "tbl",
            arr,
            GlobalInit::Array(vec![ConstKind::Int(1), ConstKind::Int(2), ConstKind::Int(3)]),
            true,
        );
        let fn_ty = m.types.function(Ty::I32, vec![]);
        let f = m.add_function("f", fn_ty);
        let b0 = m.add_block(f);
        let b1 = m.add_block(f);
        let b2 = m.add_block(f);
        let one = m.const_int(1);
        let two = m.const_int(2);
        let tr = m.const_bool(true);

        let br0 = m.create_inst(Opcode::CondBr, Ty::VOID, &[tr, b1, b2]);
        m.append_inst(b0, br0);
        let br1 = m.create_inst(Opcode::Br, Ty::VOID, &[b2]);
        m.append_inst(b1, br1);
        let phi = m.create_inst(Opcode::Phi, Ty::I32, &[]);
        m.append_inst(b2, phi);
        m.phi_add_incoming(phi, one, b0);
        m.phi_add_incoming(phi, two, b1);
        let ret = m.create_inst(Opcode::Ret, Ty::VOID, &[phi]);
        m.append_inst(b2, ret);

        let text = print_module(&m);
        assert!(text.contains("@tbl = constant [3 x i32] [1, 2, 3]"));
        assert!(text.contains("phi i32 [ 1, %bb0 ], [ 2, %bb1 ]"));
    }

    #[test]
    fn duplicate_names_get_suffixes() {
        let mut m = Module::new();
        let fn_ty = m.types.function(Ty::I32, vec![]);
        let f = m.add_function("f", fn_ty);
        let bb = m.add_block(f);
        let one = m.const_int(1);
        let x1 = m.create_inst(Opcode::Add, Ty::I32, &[one, one]);
        let x2 = m.create_inst(Opcode::Add, Ty::I32, &[x1, one]);
        m.set_name(x1, "x");
        m.set_name(x2, "x");
        m.append_inst(bb, x1);
        m.append_inst(bb, x2);
        let ret = m.create_inst(Opcode::Ret, Ty::VOID, &[x2]);
        m.append_inst(bb, ret);

        let text = print_module(&m);
        assert!(text.contains("%x = add"));
        assert!(text.contains("%x.1 = add"));
        assert!(text.contains("ret i32 %x.1"));
    }
}
