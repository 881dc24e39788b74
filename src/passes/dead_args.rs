//! Dead-argument elimination.
//!
//! An internal function parameter with no uses is dropped from the
//! signature and from every call site. The function is rebuilt under a
//! narrower type and its blocks are moved over; `main`, runtime
//! declarations, and outlined parallel bodies (fixed runtime signature)
//! are exempt.

use crate::analysis::AnalysisManager;
use crate::config::Config;
use crate::ir::{FnAttrs, Module, Opcode, Value};

use super::ModulePass;

pub struct DeadArgElim;

impl ModulePass for DeadArgElim {
    fn name(&self) -> &'static str {
        "dead-args"
    }

    fn run(&self, m: &mut Module, am: &mut AnalysisManager, _cfg: &Config) -> usize {
        let mut changes = 0;
        for func in m.defined_functions() {
            changes += strip_function(m, func);
        }
        if changes > 0 {
            // Signatures and call instructions were rebuilt wholesale.
            am.invalidate_all();
        }
        changes
    }
}

fn strip_function(m: &mut Module, func: Value) -> usize {
    let name = m.func_name(func).to_string();
    if name == "main" {
        return 0;
    }
    let attrs = m.fn_attrs(func);
    if attrs.contains(FnAttrs::BUILTIN) || attrs.contains(FnAttrs::PARALLEL_BODY) {
        return 0;
    }

    let args: Vec<Value> = m.func_args(func).to_vec();
    let keep: Vec<bool> = args.iter().map(|&a| !m.uses(a).is_empty()).collect();
    let dropped = keep.iter().filter(|k| !**k).count();
    if dropped == 0 {
        return 0;
    }

    // Rebuild the function under the narrowed signature.
    let ret = m.fn_return_ty(func);
    let kept_tys: Vec<_> = args
        .iter()
        .zip(&keep)
        .filter(|(_, k)| **k)
        .map(|(&a, _)| m.ty(a))
        .collect();
    let new_ty = m.types.function(ret, kept_tys);
    m.set_name(func, format!("{name}.stale"));
    let new_func = m.add_function(name.clone(), new_ty);
    m.set_fn_attrs(new_func, attrs);

    // Move the body: blocks keep their instructions, only the parent
    // function pointer and the block list change hands.
    let blocks: Vec<Value> = m.func_blocks(func).to_vec();
    for &b in &blocks {
        m.block_data_mut(b).func = new_func;
    }
    m.func_data_mut(func).blocks.clear();
    m.func_data_mut(new_func).blocks = blocks;

    // Live arguments carry over positionally.
    let new_args: Vec<Value> = m.func_args(new_func).to_vec();
    let mut it = new_args.iter();
    for (&old, &k) in args.iter().zip(&keep) {
        if k {
            let new = *it.next().expect("kept argument");
            let old_name = m.value(old).name.clone();
            if let Some(n) = old_name {
                m.set_name(new, n);
            }
            m.replace_all_uses_with(old, new);
        }
    }

    // Rewrite every call site with the narrowed operand list.
    let sites: Vec<Value> = m
        .uses(func)
        .iter()
        .filter(|u| u.index == 0 && m.opcode(u.user) == Some(Opcode::Call))
        .map(|u| u.user)
        .collect();
    for call in sites {
        let old_ops: Vec<Value> = m.operands(call).to_vec();
        let mut new_ops = vec![new_func];
        for (i, &k) in keep.iter().enumerate() {
            if k {
                new_ops.push(old_ops[i + 1]);
            }
        }
        let new_call = m.create_inst(Opcode::Call, ret, &new_ops);
        if let Some(n) = m.value(call).name.clone() {
            m.set_name(new_call, n);
        }
        m.insert_before(call, new_call);
        m.replace_all_uses_with(call, new_call);
        m.erase_inst(call);
    }

    debug_assert!(m.uses(func).is_empty());
    m.remove_function(func);
    log::debug!("dead-args: dropped {dropped} arguments from @{name}");
    dropped
}
