//! Function inlining.
//!
//! Call sites whose callee is defined, non-recursive, under the size cap,
//! and not marked noinline are substituted in place: the caller block is
//! split at the call, the callee's blocks are cloned with arguments bound
//! to the call operands, and every cloned return becomes a branch to the
//! split-off continuation (with a phi merging multiple return values).
//! Rounds repeat until no site qualifies, so chains of small wrappers
//! collapse in one pass run.

use rustc_hash::FxHashMap;

use crate::analysis::callgraph::CallGraph;
use crate::analysis::AnalysisManager;
use crate::config::Config;
use crate::ir::{FnAttrs, Module, Opcode, Ty, Value};

use super::loop_unroll::clone_region;
use super::ModulePass;

pub struct Inliner;

impl ModulePass for Inliner {
    fn name(&self) -> &'static str {
        "inline"
    }

    fn run(&self, m: &mut Module, am: &mut AnalysisManager, cfg: &Config) -> usize {
        let n = run_module(m, cfg.inline_threshold as usize);
        if n > 0 {
            am.invalidate_all();
        }
        n
    }
}

pub fn run_module(m: &mut Module, threshold: usize) -> usize {
    let mut inlined = 0;
    // A generous cap: every round inlines at least one site, and sites are
    // finite because recursion is excluded.
    for _round in 0..32 {
        let cg = CallGraph::build(m);
        let mut did = false;
        for caller in m.defined_functions() {
            let sites: Vec<Value> = m
                .all_insts(caller)
                .into_iter()
                .filter(|&i| m.opcode(i) == Some(Opcode::Call))
                .collect();
            for call in sites {
                let callee = m.operands(call)[0];
                if !eligible(m, &cg, caller, callee, threshold) {
                    continue;
                }
                inline_site(m, caller, call, callee);
                inlined += 1;
                did = true;
            }
        }
        if !did {
            break;
        }
    }
    if inlined > 0 {
        log::debug!("inline: substituted {inlined} call sites");
    }
    inlined
}

fn eligible(m: &Module, cg: &CallGraph, caller: Value, callee: Value, threshold: usize) -> bool {
    if callee == caller || m.is_declaration(callee) {
        return false;
    }
    let attrs = m.fn_attrs(callee);
    if attrs.contains(FnAttrs::NO_INLINE) || attrs.contains(FnAttrs::BUILTIN) {
        return false;
    }
    if cg.is_recursive(callee) {
        return false;
    }
    m.all_insts(callee).len() <= threshold
}

fn inline_site(m: &mut Module, caller: Value, call: Value, callee: Value) {
    let block = m.inst_parent(call).expect("placed call");
    let pos = m
        .block_insts(block)
        .iter()
        .position(|&i| i == call)
        .expect("call in block");

    // Everything from the call on (the call included) moves to the
    // continuation; the split leaves `block` branching there.
    let cont = m.split_block_at(block, pos);
    let cont_name = m.fresh_name(caller, "inlined.cont");
    m.set_name(cont, cont_name);

    // Clone the callee with arguments bound to the call operands.
    let mut vmap: FxHashMap<Value, Value> = FxHashMap::default();
    let call_args: Vec<Value> = m.operands(call)[1..].to_vec();
    for (&param, &arg) in m.func_args(callee).to_vec().iter().zip(&call_args) {
        vmap.insert(param, arg);
    }
    let callee_blocks: Vec<Value> = m.func_blocks(callee).to_vec();
    clone_region(m, caller, &callee_blocks, &mut vmap);
    let clone_entry = vmap[&callee_blocks[0]];

    // Enter the body instead of the continuation.
    let br = m.terminator(block).expect("split branch");
    m.set_operand(br, 0, clone_entry);

    // Returns become edges into the continuation.
    let ret_ty = m.fn_return_ty(callee);
    let mut returns: Vec<(Option<Value>, Value)> = Vec::new();
    for &ob in &callee_blocks {
        let nb = vmap[&ob];
        let Some(term) = m.terminator(nb) else { continue };
        if m.opcode(term) != Some(Opcode::Ret) {
            continue;
        }
        let val = m.operands(term).first().copied();
        m.erase_inst(term);
        let jump = m.create_inst(Opcode::Br, Ty::VOID, &[cont]);
        m.append_inst(nb, jump);
        returns.push((val, nb));
    }

    // Bind the call's value.
    if ret_ty != Ty::VOID {
        let result = if returns.len() == 1 {
            returns[0].0.expect("non-void return")
        } else {
            let phi = m.create_inst(Opcode::Phi, ret_ty, &[]);
            let name = m.fresh_name(caller, "retval");
            m.set_name(phi, name);
            m.insert_inst(cont, 0, phi);
            for &(v, b) in &returns {
                m.phi_add_incoming(phi, v.expect("non-void return"), b);
            }
            phi
        };
        m.replace_all_uses_with(call, result);
    }
    m.erase_inst(call);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse::parse_module;
    use crate::ir::verify::verify;
    use crate::passes::{constfold, simplify_cfg};

    #[test]
    fn single_return_callee_inlines_flat() {
        let mut m = parse_module(
            r#"
define i32 @addone(i32 %x) {
entry:
  %r = add i32 %x, 1
  ret i32 %r
}

define i32 @main() {
entry:
  %a = call i32 @addone(i32 41)
  ret i32 %a
}
"#,
        )
        .unwrap();
        assert_eq!(run_module(&mut m, 100), 1);
        verify(&m).unwrap();
        let main = m.find_function("main").unwrap();
        assert!(m.all_insts(main).iter().all(|&i| m.opcode(i) != Some(Opcode::Call)));
        constfold::fold_function(&mut m, main);
        simplify_cfg::simplify_function(&mut m, main);
        verify(&m).unwrap();
        let term = m.terminator(m.entry_block(main).unwrap()).unwrap();
        assert_eq!(m.const_kind(m.operands(term)[0]).unwrap().as_int(), Some(42));
    }

    #[test]
    fn branching_callee_merges_with_phi() {
        let mut m = parse_module(
            r#"
define i32 @pick(i1 %c) {
entry:
  br i1 %c, label %a, label %b
a:
  ret i32 10
b:
  ret i32 20
}

define i32 @main(i1 %c) {
entry:
  %v = call i32 @pick(i1 %c)
  ret i32 %v
}
"#,
        )
        .unwrap();
        assert_eq!(run_module(&mut m, 100), 1);
        verify(&m).unwrap();
        let main = m.find_function("main").unwrap();
        let phis = m
            .all_insts(main)
            .iter()
            .filter(|&&i| m.opcode(i) == Some(Opcode::Phi))
            .count();
        assert_eq!(phis, 1);
    }

    #[test]
    fn recursive_callee_is_skipped() {
        let mut m = parse_module(
            r#"
define i32 @fact(i32 %n) {
entry:
  %c = icmp sle i32 %n, 1
  br i1 %c, label %base, label %rec
base:
  ret i32 1
rec:
  %n1 = sub i32 %n, 1
  %r = call i32 @fact(i32 %n1)
  %p = mul i32 %n, %r
  ret i32 %p
}

define i32 @main() {
entry:
  %v = call i32 @fact(i32 5)
  ret i32 %v
}
"#,
        )
        .unwrap();
        assert_eq!(run_module(&mut m, 100), 0);
    }

    #[test]
    fn size_threshold_gates_inlining() {
        let mut m = parse_module(
            r#"
define i32 @big(i32 %x) {
entry:
  %a = add i32 %x, 1
  %b = add i32 %a, 2
  %c = add i32 %b, 3
  %d = add i32 %c, 4
  ret i32 %d
}

define i32 @main() {
entry:
  %v = call i32 @big(i32 0)
  ret i32 %v
}
"#,
        )
        .unwrap();
        assert_eq!(run_module(&mut m, 3), 0);
        assert_eq!(run_module(&mut m, 10), 1);
    }

    #[test]
    fn wrapper_chains_collapse() {
        let mut m = parse_module(
            r#"
define i32 @inner(i32 %x) {
entry:
  %r = mul i32 %x, 2
  ret i32 %r
}

define i32 @outer(i32 %x) {
entry:
  %r = call i32 @inner(i32 %x)
  ret i32 %r
}

define i32 @main() {
entry:
  %v = call i32 @outer(i32 3)
  ret i32 %v
}
"#,
        )
        .unwrap();
        assert!(run_module(&mut m, 100) >= 2);
        verify(&m).unwrap();
        let main = m.find_function("main").unwrap();
        assert!(m.all_insts(main).iter().all(|&i| m.opcode(i) != Some(Opcode::Call)));
    }
}
