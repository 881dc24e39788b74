//! Tail-call optimization for self-recursion.
//!
//! A call of the enclosing function immediately followed by a return of
//! its value (or a bare return for void) is a loop in disguise: a fresh
//! entry block takes over the allocas, the old entry grows one phi per
//! argument, and every tail site branches back with its operands feeding
//! the phis.

use crate::analysis::AnalysisManager;
use crate::config::Config;
use crate::ir::{Module, Opcode, Ty, Value};

use super::FunctionPass;

pub struct Tco;

impl FunctionPass for Tco {
    fn name(&self) -> &'static str {
        "tco"
    }

    fn run(&self, m: &mut Module, func: Value, am: &mut AnalysisManager, _cfg: &Config) -> usize {
        let n = run_function(m, func);
        if n > 0 {
            am.cfg_changed(func);
            am.call_changed();
        }
        n
    }
}

pub fn run_function(m: &mut Module, func: Value) -> usize {
    let sites = tail_sites(m, func);
    if sites.is_empty() {
        return 0;
    }
    let old_entry = m.entry_block(func).expect("defined function");

    // New entry: hosts the allocas (they must run once, not per
    // iteration) and jumps into the rebound body.
    let new_entry = m.add_block_before(func, old_entry);
    let name = m.fresh_name(func, "tco.entry");
    m.set_name(new_entry, name);
    let allocas: Vec<Value> = m
        .block_insts(old_entry)
        .iter()
        .copied()
        .filter(|&i| m.opcode(i) == Some(Opcode::Alloca))
        .collect();
    for a in allocas {
        m.unlink_inst(a);
        m.append_inst(new_entry, a);
    }
    let enter = m.create_inst(Opcode::Br, Ty::VOID, &[old_entry]);
    m.append_inst(new_entry, enter);

    // One phi per argument, seeded from the new entry.
    let args: Vec<Value> = m.func_args(func).to_vec();
    let mut arg_phis = Vec::with_capacity(args.len());
    for (k, &a) in args.iter().enumerate() {
        let phi = m.create_inst(Opcode::Phi, m.ty(a), &[]);
        let pname = m.value(a).name.clone().unwrap_or_default();
        m.set_name(phi, format!("{pname}.tco"));
        m.insert_inst(old_entry, k, phi);
        m.replace_all_uses_with(a, phi);
        m.phi_add_incoming(phi, a, new_entry);
        arg_phis.push(phi);
    }

    // Rewrite each tail site into a back edge.
    let count = sites.len();
    for (call, ret) in sites {
        let block = m.inst_parent(call).expect("placed call");
        let new_args: Vec<Value> = m.operands(call)[1..].to_vec();
        m.erase_inst(ret);
        m.erase_inst(call);
        for (&phi, &v) in arg_phis.iter().zip(&new_args) {
            m.phi_add_incoming(phi, v, block);
        }
        let back = m.create_inst(Opcode::Br, Ty::VOID, &[old_entry]);
        m.append_inst(block, back);
    }
    log::debug!("tco: rewrote {count} tail calls in @{}", m.func_name(func));
    count
}

/// `(call, ret)` pairs where the call is a self-call whose only use is the
/// immediately following return.
fn tail_sites(m: &Module, func: Value) -> Vec<(Value, Value)> {
    let mut sites = Vec::new();
    for &b in m.func_blocks(func) {
        let insts = m.block_insts(b);
        if insts.len() < 2 {
            continue;
        }
        let ret = insts[insts.len() - 1];
        let call = insts[insts.len() - 2];
        if m.opcode(ret) != Some(Opcode::Ret) || m.opcode(call) != Some(Opcode::Call) {
            continue;
        }
        if m.operands(call)[0] != func {
            continue;
        }
        let value_ok = match m.operands(ret).first() {
            Some(&v) => v == call && m.uses(call).len() == 1,
            None => m.uses(call).is_empty(),
        };
        if value_ok {
            sites.push((call, ret));
        }
    }
    sites
}
