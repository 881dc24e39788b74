//! Reader for the textual dump form.
//!
//! Accepts the subset of the syntax that `dump.rs` emits and rebuilds a
//! structurally identical module. Used as the round-trip oracle in tests and
//! for writing IR fixtures by hand; like the printer, it is not a stable
//! interface.

use rustc_hash::FxHashMap;

use super::module::Module;
use super::types::Ty;
use super::value::{CmpPred, ConstKind, FnAttrs, GlobalInit, Opcode, Value};

pub fn parse_module(text: &str) -> Result<Module, String> {
    let mut m = Module::new();
    let lines: Vec<&str> = text
        .lines()
        .map(|l| strip_comment(l).trim())
        .filter(|l| !l.is_empty())
        .map(|l| l.trim())
        .collect();
    // Borrow-friendly: re-collect trimmed owned lines.
    let lines: Vec<String> = lines.into_iter().map(|l| l.to_string()).collect();

    let mut i = 0;
    while i < lines.len() {
        let line = &lines[i];
        if line.starts_with('@') {
            parse_global(&mut m, line)?;
            i += 1;
        } else if line.starts_with("declare") {
            parse_declare(&mut m, line)?;
            i += 1;
        } else if line.starts_with("define") {
            let mut body = Vec::new();
            let header = line.clone();
            i += 1;
            while i < lines.len() && lines[i] != "}" {
                body.push(lines[i].clone());
                i += 1;
            }
            if i == lines.len() {
                return Err("unterminated function body".into());
            }
            i += 1; // consume '}'
            parse_define(&mut m, &header, &body)?;
        } else {
            return Err(format!("unexpected top-level line: {line}"));
        }
    }
    Ok(m)
}

fn strip_comment(line: &str) -> &str {
    match line.find(';') {
        Some(p) => &line[..p],
        None => line,
    }
}

// ── Scanner ───────────────────────────────────────────────────────────────

struct Scan<'a> {
    s: &'a [u8],
    pos: usize,
}

impl<'a> Scan<'a> {
    fn new(s: &'a str) -> Self {
        Scan { s: s.as_bytes(), pos: 0 }
    }

    fn ws(&mut self) {
        while self.pos < self.s.len() && (self.s[self.pos] as char).is_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.ws();
        self.s.get(self.pos).map(|&b| b as char)
    }

    fn eat(&mut self, c: char) -> bool {
        self.ws();
        if self.s.get(self.pos) == Some(&(c as u8)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<(), String> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(format!("expected '{c}' at {}", self.rest()))
        }
    }

    fn rest(&self) -> String {
        String::from_utf8_lossy(&self.s[self.pos.min(self.s.len())..]).into_owned()
    }

    /// Identifier, keyword, or numeric literal token.
    fn word(&mut self) -> String {
        self.ws();
        let start = self.pos;
        while self.pos < self.s.len() {
            let c = self.s[self.pos] as char;
            if c.is_alphanumeric() || c == '_' || c == '.' || c == '-' || c == '+' {
                self.pos += 1;
            } else {
                break;
            }
        }
        String::from_utf8_lossy(&self.s[start..self.pos]).into_owned()
    }

    fn eat_word(&mut self, w: &str) -> bool {
        let save = self.pos;
        if self.word() == w {
            true
        } else {
            self.pos = save;
            false
        }
    }

    fn done(&mut self) -> bool {
        self.ws();
        self.pos >= self.s.len()
    }
}

fn parse_type(m: &mut Module, sc: &mut Scan) -> Result<Ty, String> {
    let base = if sc.eat('[') {
        // [N x T]
        let n: usize = sc.word().parse().map_err(|_| "bad array length".to_string())?;
        if !sc.eat_word("x") {
            return Err("expected 'x' in array type".into());
        }
        let inner = parse_type(m, sc)?;
        sc.expect(']')?;
        // Collapse nested arrays into one dims list.
        match m.types.kind(inner).clone() {
            super::types::TypeKind::Array { elem, dims } => {
                let mut all = vec![n];
                all.extend(dims);
                m.types.array(elem, all)
            }
            _ => m.types.array(inner, vec![n]),
        }
    } else {
        match sc.word().as_str() {
            "void" => Ty::VOID,
            "i1" => Ty::BOOL,
            "i8" => Ty::I8,
            "i32" => Ty::I32,
            "i64" => Ty::I64,
            "float" => Ty::F32,
            "double" => Ty::F64,
            "label" => Ty::LABEL,
            other => return Err(format!("unknown type '{other}'")),
        }
    };
    let mut ty = base;
    while sc.eat('*') {
        ty = m.types.pointer(ty);
    }
    Ok(ty)
}

fn parse_const(ty: Ty, word: &str) -> Result<ConstKind, String> {
    Ok(match ty {
        Ty::BOOL => match word {
            "true" => ConstKind::Bool(true),
            "false" => ConstKind::Bool(false),
            "undef" => ConstKind::Undef,
            _ => return Err(format!("bad i1 literal '{word}'")),
        },
        Ty::F32 => {
            if word == "undef" {
                ConstKind::Undef
            } else {
                ConstKind::Float(word.parse::<f32>().map_err(|_| format!("bad float '{word}'"))?)
            }
        }
        Ty::F64 => {
            if word == "undef" {
                ConstKind::Undef
            } else {
                ConstKind::Double(word.parse::<f64>().map_err(|_| format!("bad double '{word}'"))?)
            }
        }
        Ty::I64 => {
            if word == "undef" {
                ConstKind::Undef
            } else {
                ConstKind::Int64(word.parse::<i64>().map_err(|_| format!("bad i64 '{word}'"))?)
            }
        }
        _ => {
            if word == "undef" {
                ConstKind::Undef
            } else {
                ConstKind::Int(word.parse::<i32>().map_err(|_| format!("bad int '{word}'"))?)
            }
        }
    })
}

fn parse_attrs(sc: &mut Scan) -> FnAttrs {
    let mut attrs = FnAttrs::empty();
    loop {
        if sc.eat_word("builtin") {
            attrs |= FnAttrs::BUILTIN;
        } else if sc.eat_word("parallel_body") {
            attrs |= FnAttrs::PARALLEL_BODY;
        } else if sc.eat_word("noinline") {
            attrs |= FnAttrs::NO_INLINE;
        } else {
            break;
        }
    }
    attrs
}

// ── Top-level items ───────────────────────────────────────────────────────

fn parse_global(m: &mut Module, line: &str) -> Result<(), String> {
    let mut sc = Scan::new(line);
    sc.expect('@')?;
    let name = sc.word();
    sc.expect('=')?;
    let is_const = if sc.eat_word("constant") {
        true
    } else if sc.eat_word("global") {
        false
    } else {
        return Err(format!("expected global/constant in '{line}'"));
    };
    let ty = parse_type(m, &mut sc)?;
    let elem_ty = match m.types.array_elem(ty) {
        Some(e) => e,
        None => ty,
    };
    let init = if sc.eat_word("zeroinitializer") {
        GlobalInit::Zero
    } else if sc.eat('[') {
        let mut vals = Vec::new();
        loop {
            let w = sc.word();
            vals.push(parse_const(elem_ty, &w)?);
            if !sc.eat(',') {
                break;
            }
        }
        sc.expect(']')?;
        GlobalInit::Array(vals)
    } else {
        let w = sc.word();
        GlobalInit::Scalar(parse_const(ty, &w)?)
    };
    m.add_global(name, ty, init, is_const);
    Ok(())
}

fn parse_signature(
    m: &mut Module,
    sc: &mut Scan,
) -> Result<(String, Ty, Vec<(Ty, Option<String>)>), String> {
    let ret = parse_type(m, sc)?;
    sc.expect('@')?;
    let name = sc.word();
    sc.expect('(')?;
    let mut params = Vec::new();
    if !sc.eat(')') {
        loop {
            let pty = parse_type(m, sc)?;
            let pname = if sc.eat('%') { Some(sc.word()) } else { None };
            params.push((pty, pname));
            if !sc.eat(',') {
                break;
            }
        }
        sc.expect(')')?;
    }
    Ok((name, ret, params))
}

fn parse_declare(m: &mut Module, line: &str) -> Result<(), String> {
    let mut sc = Scan::new(line);
    sc.eat_word("declare");
    let (name, ret, params) = parse_signature(m, &mut sc)?;
    let attrs = parse_attrs(&mut sc);
    let ptys: Vec<Ty> = params.iter().map(|(t, _)| *t).collect();
    let fn_ty = m.types.function(ret, ptys);
    let f = m.add_function(name, fn_ty);
    m.set_fn_attrs(f, attrs);
    Ok(())
}

/// Unresolved operand reference, resolved after all instructions exist.
enum Ref {
    Local(String),
    Block(String),
    Global(String),
    Literal(Ty, String),
}

fn parse_operand(m: &mut Module, sc: &mut Scan) -> Result<Ref, String> {
    // `label %name` | `<ty> %name` | `<ty> @name` | `<ty> <literal>`
    if sc.eat_word("label") {
        sc.expect('%')?;
        return Ok(Ref::Block(sc.word()));
    }
    let ty = parse_type(m, sc)?;
    bare_operand(ty, sc)
}

fn bare_operand(ty: Ty, sc: &mut Scan) -> Result<Ref, String> {
    if sc.eat('%') {
        Ok(Ref::Local(sc.word()))
    } else if sc.eat('@') {
        Ok(Ref::Global(sc.word()))
    } else {
        Ok(Ref::Literal(ty, sc.word()))
    }
}

struct PendingInst {
    value: Value,
    refs: Vec<Ref>,
}

fn parse_define(m: &mut Module, header: &str, body: &[String]) -> Result<(), String> {
    let mut sc = Scan::new(header);
    sc.eat_word("define");
    let (name, ret, params) = parse_signature(m, &mut sc)?;
    let attrs = parse_attrs(&mut sc);
    let ptys: Vec<Ty> = params.iter().map(|(t, _)| *t).collect();
    let fn_ty = m.types.function(ret, ptys);
    let func = m.add_function(name, fn_ty);
    m.set_fn_attrs(func, attrs);

    let mut locals: FxHashMap<String, Value> = FxHashMap::default();
    for (arg, (_, pname)) in m.func_args(func).to_vec().into_iter().zip(params.iter()) {
        if let Some(n) = pname {
            m.set_name(arg, n.clone());
            locals.insert(n.clone(), arg);
        }
    }

    // Pass 1: create blocks.
    let mut blocks: FxHashMap<String, Value> = FxHashMap::default();
    for line in body {
        if let Some(label) = line.strip_suffix(':') {
            if blocks.contains_key(label) {
                return Err(format!("duplicate label '{label}'"));
            }
            let b = m.add_block(func);
            m.set_name(b, label);
            blocks.insert(label.to_string(), b);
        }
    }

    // Pass 2: create instructions with unresolved operand refs.
    let mut pending: Vec<PendingInst> = Vec::new();
    let mut cur_block: Option<Value> = None;
    for line in body {
        if let Some(label) = line.strip_suffix(':') {
            cur_block = Some(blocks[label]);
            continue;
        }
        let block = cur_block.ok_or_else(|| format!("instruction before any label: {line}"))?;
        let p = parse_inst(m, line, &blocks)?;
        m.append_inst(block, p.value);
        if let Some(n) = m.value(p.value).name.clone() {
            locals.insert(n, p.value);
        }
        pending.push(p);
    }

    // Pass 3: resolve operands.
    for p in pending {
        for r in p.refs {
            let v = resolve(m, &r, &locals, &blocks)?;
            m.add_operand(p.value, v);
        }
    }
    Ok(())
}

fn resolve(
    m: &mut Module,
    r: &Ref,
    locals: &FxHashMap<String, Value>,
    blocks: &FxHashMap<String, Value>,
) -> Result<Value, String> {
    match r {
        Ref::Local(n) => locals
            .get(n)
            .copied()
            .or_else(|| blocks.get(n).copied())
            .ok_or_else(|| format!("undefined local %{n}")),
        Ref::Block(n) => blocks.get(n).copied().ok_or_else(|| format!("undefined label %{n}")),
        Ref::Global(n) => m
            .find_function(n)
            .or_else(|| {
                m.globals
                    .iter()
                    .copied()
                    .find(|&g| m.value(g).name.as_deref() == Some(n.as_str()))
            })
            .ok_or_else(|| format!("undefined global @{n}")),
        Ref::Literal(ty, w) => {
            let c = parse_const(*ty, w)?;
            Ok(m.const_of(*ty, c))
        }
    }
}

fn binary_opcode(word: &str) -> Option<Opcode> {
    Some(match word {
        "add" => Opcode::Add,
        "sub" => Opcode::Sub,
        "mul" => Opcode::Mul,
        "sdiv" => Opcode::SDiv,
        "srem" => Opcode::SRem,
        "fadd" => Opcode::FAdd,
        "fsub" => Opcode::FSub,
        "fmul" => Opcode::FMul,
        "fdiv" => Opcode::FDiv,
        _ => return None,
    })
}

fn cast_opcode_of(word: &str) -> Option<Opcode> {
    Some(match word {
        "trunc" => Opcode::Trunc,
        "zext" => Opcode::ZExt,
        "sext" => Opcode::SExt,
        "fptrunc" => Opcode::FpTrunc,
        "fpext" => Opcode::FpExt,
        "fptosi" => Opcode::FpToSi,
        "sitofp" => Opcode::SiToFp,
        "bitcast" => Opcode::Bitcast,
        "ptrtoint" => Opcode::PtrToInt,
        "inttoptr" => Opcode::IntToPtr,
        _ => return None,
    })
}

fn cmp_pred(word: &str) -> Option<CmpPred> {
    Some(match word {
        "eq" | "oeq" => CmpPred::Eq,
        "ne" | "one" => CmpPred::Ne,
        "sgt" | "ogt" => CmpPred::Gt,
        "sge" | "oge" => CmpPred::Ge,
        "slt" | "olt" => CmpPred::Lt,
        "sle" | "ole" => CmpPred::Le,
        _ => return None,
    })
}

fn parse_inst(
    m: &mut Module,
    line: &str,
    _blocks: &FxHashMap<String, Value>,
) -> Result<PendingInst, String> {
    let mut sc = Scan::new(line);
    let mut result_name = None;
    if sc.eat('%') {
        result_name = Some(sc.word());
        sc.expect('=')?;
    }
    let op_word = sc.word();
    let mut refs = Vec::new();

    let (op, ty) = match op_word.as_str() {
        "alloca" => {
            let content = parse_type(m, &mut sc)?;
            (Opcode::Alloca, m.types.pointer(content))
        }
        "load" => {
            let ty = parse_type(m, &mut sc)?;
            sc.expect(',')?;
            refs.push(parse_operand(m, &mut sc)?);
            (Opcode::Load, ty)
        }
        "store" => {
            refs.push(parse_operand(m, &mut sc)?);
            sc.expect(',')?;
            refs.push(parse_operand(m, &mut sc)?);
            (Opcode::Store, Ty::VOID)
        }
        "memset" => {
            refs.push(parse_operand(m, &mut sc)?);
            sc.expect(',')?;
            refs.push(parse_operand(m, &mut sc)?);
            (Opcode::Memset, Ty::VOID)
        }
        "getelementptr" => {
            let _pointee = parse_type(m, &mut sc)?;
            sc.expect(',')?;
            let base_ty = parse_type(m, &mut sc)?;
            refs.push(bare_operand(base_ty, &mut sc)?);
            sc.expect(',')?;
            refs.push(parse_operand(m, &mut sc)?);
            let result = m
                .types
                .gep_result(base_ty)
                .ok_or_else(|| "getelementptr base is not a pointer".to_string())?;
            (Opcode::GetElementPtr, result)
        }
        "ret" => {
            if sc.eat_word("void") {
                (Opcode::Ret, Ty::VOID)
            } else {
                refs.push(parse_operand(m, &mut sc)?);
                (Opcode::Ret, Ty::VOID)
            }
        }
        "br" => {
            if sc.eat_word("label") {
                sc.expect('%')?;
                refs.push(Ref::Block(sc.word()));
                (Opcode::Br, Ty::VOID)
            } else {
                refs.push(parse_operand(m, &mut sc)?);
                sc.expect(',')?;
                refs.push(parse_operand(m, &mut sc)?);
                sc.expect(',')?;
                refs.push(parse_operand(m, &mut sc)?);
                (Opcode::CondBr, Ty::VOID)
            }
        }
        "call" => {
            let ret = parse_type(m, &mut sc)?;
            sc.expect('@')?;
            refs.push(Ref::Global(sc.word()));
            sc.expect('(')?;
            if !sc.eat(')') {
                loop {
                    refs.push(parse_operand(m, &mut sc)?);
                    if !sc.eat(',') {
                        break;
                    }
                }
                sc.expect(')')?;
            }
            (Opcode::Call, ret)
        }
        "phi" => {
            let ty = parse_type(m, &mut sc)?;
            loop {
                sc.expect('[')?;
                refs.push(bare_operand(ty, &mut sc)?);
                sc.expect(',')?;
                sc.expect('%')?;
                refs.push(Ref::Block(sc.word()));
                sc.expect(']')?;
                if !sc.eat(',') {
                    break;
                }
            }
            (Opcode::Phi, ty)
        }
        "icmp" | "fcmp" => {
            let pred =
                cmp_pred(&sc.word()).ok_or_else(|| "bad comparison predicate".to_string())?;
            let ty = parse_type(m, &mut sc)?;
            refs.push(bare_operand(ty, &mut sc)?);
            sc.expect(',')?;
            refs.push(bare_operand(ty, &mut sc)?);
            let op = if op_word == "icmp" { Opcode::ICmp(pred) } else { Opcode::FCmp(pred) };
            (op, Ty::BOOL)
        }
        "fneg" => {
            let ty = parse_type(m, &mut sc)?;
            refs.push(bare_operand(ty, &mut sc)?);
            (Opcode::FNeg, ty)
        }
        "atomicadd" => {
            refs.push(parse_operand(m, &mut sc)?);
            sc.expect(',')?;
            let vty = parse_type(m, &mut sc)?;
            refs.push(bare_operand(vty, &mut sc)?);
            (Opcode::AtomicAdd, vty)
        }
        w => {
            if let Some(op) = binary_opcode(w) {
                let ty = parse_type(m, &mut sc)?;
                refs.push(bare_operand(ty, &mut sc)?);
                sc.expect(',')?;
                refs.push(bare_operand(ty, &mut sc)?);
                (op, ty)
            } else if let Some(op) = cast_opcode_of(w) {
                refs.push(parse_operand(m, &mut sc)?);
                if !sc.eat_word("to") {
                    return Err(format!("expected 'to' in cast: {line}"));
                }
                let ty = parse_type(m, &mut sc)?;
                (op, ty)
            } else {
                return Err(format!("unknown instruction '{w}' in: {line}"));
            }
        }
    };

    if !sc.done() {
        return Err(format!("trailing input in: {line}"));
    }

    let inst = m.create_inst(op, ty, &[]);
    if let Some(n) = result_name {
        m.set_name(inst, n);
    }
    Ok(PendingInst { value: inst, refs })
}
