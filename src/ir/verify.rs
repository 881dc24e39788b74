//! On-demand structural verifier.
//!
//! Checks the invariants the rest of the middle end assumes: paired
//! def-use edges, terminator and phi placement, phi/predecessor agreement,
//! SSA dominance of operands, per-opcode type consistency, and parent
//! pointers. A failure is an internal compiler error: the returned
//! `VerifierError` carries the offending function's dump.

use crate::analysis::cfg::Cfg;
use crate::analysis::dom::DomTree;
use crate::error::MidendError;

use super::dump::print_function_only;
use super::module::Module;
use super::types::Ty;
use super::value::{Opcode, Value, ValueKind};

pub fn verify(m: &Module) -> Result<(), MidendError> {
    verify_use_lists(m)?;
    for &f in &m.functions {
        if !m.is_declaration(f) {
            verify_function(m, f)?;
        }
    }
    Ok(())
}

fn err(m: &Module, func: Option<Value>, message: String) -> MidendError {
    let ir_dump = func.map(|f| print_function_only(m, f)).unwrap_or_default();
    log::error!("verifier: {message}");
    MidendError::Verifier { message, ir_dump }
}

/// Both directions of the def-use graph, over the whole slab (erased slots
/// have empty edge sets and pass vacuously).
fn verify_use_lists(m: &Module) -> Result<(), MidendError> {
    for i in 0..m.num_values() {
        let v = Value(i as u32);
        let data = m.value(v);
        for (idx, &op) in data.operands().iter().enumerate() {
            let registered = m
                .uses(op)
                .iter()
                .any(|u| u.user == v && u.index == idx);
            if !registered {
                return Err(err(
                    m,
                    None,
                    format!("operand {idx} of {v:?} is not registered in {op:?}'s use list"),
                ));
            }
        }
        for u in data.uses() {
            let ops = m.operands(u.user);
            if ops.get(u.index) != Some(&v) {
                return Err(err(
                    m,
                    None,
                    format!("use ({:?}, {}) of {v:?} does not point back", u.user, u.index),
                ));
            }
        }
    }
    Ok(())
}

fn verify_function(m: &Module, f: Value) -> Result<(), MidendError> {
    let blocks = m.func_blocks(f);
    for &b in blocks {
        if m.block_parent(b) != f {
            return Err(err(m, Some(f), format!("block {b:?} has wrong parent function")));
        }
        let insts = m.block_insts(b);
        let Some(&last) = insts.last() else {
            return Err(err(m, Some(f), format!("block {b:?} is empty")));
        };
        if !m.opcode(last).is_some_and(|o| o.is_terminator()) {
            return Err(err(m, Some(f), format!("block {b:?} does not end in a terminator")));
        }
        let mut seen_non_phi = false;
        for (pos, &inst) in insts.iter().enumerate() {
            let Some(op) = m.opcode(inst) else {
                return Err(err(m, Some(f), format!("non-instruction {inst:?} in block")));
            };
            if m.inst_parent(inst) != Some(b) {
                return Err(err(m, Some(f), format!("instruction {inst:?} has wrong parent")));
            }
            if op.is_terminator() && pos + 1 != insts.len() {
                return Err(err(
                    m,
                    Some(f),
                    format!("terminator {inst:?} is not the last instruction of its block"),
                ));
            }
            if op.is_phi() {
                if seen_non_phi {
                    return Err(err(
                        m,
                        Some(f),
                        format!("phi {inst:?} appears after a non-phi instruction"),
                    ));
                }
            } else {
                seen_non_phi = true;
            }
            verify_types(m, f, inst, op)?;
        }
    }

    let cfg = Cfg::build(m, f);
    let dom = DomTree::build(&cfg);
    verify_phis(m, f, &cfg)?;
    verify_dominance(m, f, &cfg, &dom)?;
    Ok(())
}

/// Each phi names exactly its block's predecessors, once each.
fn verify_phis(m: &Module, f: Value, cfg: &Cfg) -> Result<(), MidendError> {
    for (bi, &b) in cfg.blocks.iter().enumerate() {
        let mut preds: Vec<Value> =
            cfg.preds.row(bi).iter().map(|&p| cfg.block(p as usize)).collect();
        preds.sort();
        for phi in m.phis_of(b) {
            if m.operands(phi).len() % 2 != 0 {
                return Err(err(m, Some(f), format!("phi {phi:?} has odd operand count")));
            }
            let mut incoming: Vec<Value> =
                m.phi_incoming(phi).iter().map(|&(_, blk)| blk).collect();
            incoming.sort();
            if incoming != preds {
                return Err(err(
                    m,
                    Some(f),
                    format!("phi {phi:?} incoming blocks do not match predecessors"),
                ));
            }
            for (v, _) in m.phi_incoming(phi) {
                if m.ty(v) != m.ty(phi) {
                    return Err(err(m, Some(f), format!("phi {phi:?} has mistyped incoming value")));
                }
            }
        }
    }
    Ok(())
}

/// Every operand is a constant, global, argument of this function, block of
/// this function, or an instruction whose definition dominates the use
/// (per-incoming-edge for phis). Unreachable blocks are exempt from the
/// dominance rule.
fn verify_dominance(m: &Module, f: Value, cfg: &Cfg, dom: &DomTree) -> Result<(), MidendError> {
    for (bi, &b) in cfg.blocks.iter().enumerate() {
        if !dom.is_reachable(bi) {
            continue;
        }
        for (pos, &inst) in m.block_insts(b).iter().enumerate() {
            let is_phi = m.opcode(inst) == Some(Opcode::Phi);
            for (idx, &op) in m.operands(inst).iter().enumerate() {
                match &m.value(op).kind {
                    ValueKind::Const(_) | ValueKind::Global(_) | ValueKind::Function(_) => {}
                    ValueKind::Argument { func, .. } => {
                        if *func != f {
                            return Err(err(
                                m,
                                Some(f),
                                format!("{inst:?} uses an argument of another function"),
                            ));
                        }
                    }
                    ValueKind::Block(bd) => {
                        if bd.func != f {
                            return Err(err(
                                m,
                                Some(f),
                                format!("{inst:?} references a block of another function"),
                            ));
                        }
                    }
                    ValueKind::Inst(_) => {
                        let Some(def_block) = m.inst_parent(op) else {
                            return Err(err(
                                m,
                                Some(f),
                                format!("{inst:?} uses detached instruction {op:?}"),
                            ));
                        };
                        let Some(&def_bi) = cfg.index_of.get(&def_block) else {
                            return Err(err(
                                m,
                                Some(f),
                                format!("{inst:?} uses instruction from another function"),
                            ));
                        };
                        let use_bi = if is_phi {
                            if idx % 2 != 0 {
                                continue; // block operand of the pair
                            }
                            // The value flows along the edge from the
                            // incoming block.
                            let ops = m.operands(inst);
                            let pred = ops[idx + 1];
                            match cfg.index_of.get(&pred) {
                                Some(&p) => p,
                                None => continue,
                            }
                        } else {
                            bi
                        };
                        if !dom.is_reachable(use_bi) {
                            continue;
                        }
                        let ok = if def_bi == use_bi && (!is_phi) {
                            // Same block: definition must come first.
                            let def_pos = m
                                .block_insts(def_block)
                                .iter()
                                .position(|&x| x == op)
                                .unwrap_or(usize::MAX);
                            def_pos < pos
                        } else {
                            dom.dominates(def_bi, use_bi)
                        };
                        if !ok {
                            return Err(err(
                                m,
                                Some(f),
                                format!("{inst:?} is not dominated by its operand {op:?}"),
                            ));
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

fn verify_types(m: &Module, f: Value, inst: Value, op: Opcode) -> Result<(), MidendError> {
    let ops = m.operands(inst);
    let ty = m.ty(inst);
    let bad = |what: &str| err(m, Some(f), format!("{inst:?} ({op:?}): {what}"));
    match op {
        Opcode::Store => {
            let pointee = m.types.pointee(m.ty(ops[1]));
            if pointee != Some(m.ty(ops[0])) {
                return Err(bad("stored type does not match pointee"));
            }
        }
        Opcode::Load => {
            if m.types.pointee(m.ty(ops[0])) != Some(ty) {
                return Err(bad("loaded type does not match pointee"));
            }
        }
        Opcode::CondBr => {
            if m.ty(ops[0]) != Ty::BOOL {
                return Err(bad("branch condition is not i1"));
            }
        }
        Opcode::Ret => {
            // Checked against the function's return type.
            let want = m.fn_return_ty(f);
            match ops.first() {
                Some(&v) => {
                    if m.ty(v) != want {
                        return Err(bad("return value type mismatch"));
                    }
                }
                None => {
                    if want != Ty::VOID {
                        return Err(bad("missing return value"));
                    }
                }
            }
        }
        Opcode::Call => {
            let callee = ops[0];
            if !m.value(callee).is_function() {
                return Err(bad("callee is not a function"));
            }
            let params = m.types.fn_params(m.ty(callee)).unwrap_or(&[]).to_vec();
            if params.len() != ops.len() - 1 {
                return Err(bad("argument count mismatch"));
            }
            for (p, &a) in params.iter().zip(&ops[1..]) {
                if *p != m.ty(a) {
                    return Err(bad("argument type mismatch"));
                }
            }
            if m.fn_return_ty(callee) != ty {
                return Err(bad("call result type mismatch"));
            }
        }
        Opcode::GetElementPtr => {
            if m.ty(ops[0]) != ty || !m.types.is_pointer(ty) {
                return Err(bad("gep result type must equal its base pointer type"));
            }
            if !m.types.is_int(m.ty(ops[1])) {
                return Err(bad("gep index is not an integer"));
            }
        }
        Opcode::Bitcast => {
            if !m.types.is_pointer(ty) || !m.types.is_pointer(m.ty(ops[0])) {
                return Err(bad("bitcast is only defined between pointers"));
            }
        }
        o if o.is_binary() => {
            if m.ty(ops[0]) != ty || m.ty(ops[1]) != ty {
                return Err(bad("binary operand types do not match result"));
            }
        }
        o if o.is_cmp() => {
            if ty != Ty::BOOL {
                return Err(bad("comparison result is not i1"));
            }
            if m.ty(ops[0]) != m.ty(ops[1]) {
                return Err(bad("comparison operand types differ"));
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse::parse_module;

    #[test]
    fn accepts_well_formed_ir() {
        let m = parse_module(
            r#"
define i32 @f(i32 %n) {
entry:
  br label %head
head:
  %i = phi i32 [ 0, %entry ], [ %next, %body ]
  %c = icmp slt i32 %i, %n
  br i1 %c, label %body, label %exit
body:
  %next = add i32 %i, 1
  br label %head
exit:
  ret i32 %i
}
"#,
        )
        .unwrap();
        assert!(verify(&m).is_ok());
    }

    #[test]
    fn rejects_missing_terminator() {
        let mut m = Module::new();
        let fn_ty = m.types.function(Ty::I32, vec![]);
        let f = m.add_function("f", fn_ty);
        let bb = m.add_block(f);
        let one = m.const_int(1);
        let add = m.create_inst(Opcode::Add, Ty::I32, &[one, one]);
        m.append_inst(bb, add);
        assert!(verify(&m).is_err());
    }

    #[test]
    fn rejects_use_before_def() {
        let mut m = Module::new();
        let fn_ty = m.types.function(Ty::I32, vec![]);
        let f = m.add_function("f", fn_ty);
        let bb = m.add_block(f);
        let one = m.const_int(1);
        let a = m.create_inst(Opcode::Add, Ty::I32, &[one, one]);
        // b uses a but is placed before it.
        let b = m.create_inst(Opcode::Add, Ty::I32, &[a, one]);
        m.append_inst(bb, b);
        m.append_inst(bb, a);
        let ret = m.create_inst(Opcode::Ret, Ty::VOID, &[b]);
        m.append_inst(bb, ret);
        let e = verify(&m).unwrap_err();
        match e {
            MidendError::Verifier { message, ir_dump } => {
                assert!(message.contains("dominated"));
                assert!(ir_dump.contains("define i32 @f"));
            }
            other => panic!("expected verifier error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_phi_pred_mismatch() {
        let mut m = Module::new();
        let fn_ty = m.types.function(Ty::I32, vec![]);
        let f = m.add_function("f", fn_ty);
        let b0 = m.add_block(f);
        let b1 = m.add_block(f);
        let one = m.const_int(1);
        let br = m.create_inst(Opcode::Br, Ty::VOID, &[b1]);
        m.append_inst(b0, br);
        let phi = m.create_inst(Opcode::Phi, Ty::I32, &[]);
        m.append_inst(b1, phi);
        // Incoming from b1 itself, which is not a predecessor.
        m.phi_add_incoming(phi, one, b1);
        let ret = m.create_inst(Opcode::Ret, Ty::VOID, &[phi]);
        m.append_inst(b1, ret);
        assert!(verify(&m).is_err());
    }

    #[test]
    fn rejects_type_mismatch() {
        let mut m = Module::new();
        let fn_ty = m.types.function(Ty::I32, vec![]);
        let f = m.add_function("f", fn_ty);
        let bb = m.add_block(f);
        let one = m.const_int(1);
        let half = m.const_float(0.5);
        let add = m.create_inst(Opcode::Add, Ty::I32, &[one, half]);
        m.append_inst(bb, add);
        let ret = m.create_inst(Opcode::Ret, Ty::VOID, &[add]);
        m.append_inst(bb, ret);
        assert!(verify(&m).is_err());
    }

    #[test]
    fn declaration_is_trivially_valid() {
        let m = parse_module("declare i32 @getint()").unwrap();
        assert!(verify(&m).is_ok());
    }
}
