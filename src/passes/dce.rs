//! Dead-code elimination.
//!
//! Worklist DCE over the use-lists: an instruction is trivially dead when
//! it has no uses and no observable effect. Erasing one may strand its
//! operands, so those re-enter the worklist; each instruction is visited a
//! bounded number of times.
//!
//! Calls are erasable only when the side-effect summary proves the callee
//! has no observable effect; division stays because of the trap on zero
//! divisors.

use crate::analysis::AnalysisManager;
use crate::config::Config;
use crate::ir::{Module, Opcode, Value};

use super::FunctionPass;

pub struct Dce;

impl FunctionPass for Dce {
    fn name(&self) -> &'static str {
        "dce"
    }

    fn run(&self, m: &mut Module, func: Value, am: &mut AnalysisManager, _cfg: &Config) -> usize {
        let se = am.side_effects(m);
        let erasable_call = |_: &Module, callee: Value| se.no_side_effect(callee);
        eliminate_dead_code(m, func, &erasable_call)
    }
}

/// Erase trivially dead instructions; returns the number removed.
pub fn eliminate_dead_code(
    m: &mut Module,
    func: Value,
    erasable_call: &dyn Fn(&Module, Value) -> bool,
) -> usize {
    let mut work: Vec<Value> = m.all_insts(func);
    let mut removed = 0;
    while let Some(inst) = work.pop() {
        if m.inst_parent(inst).is_none() {
            continue; // already erased
        }
        if !is_dead(m, inst, erasable_call) {
            continue;
        }
        let operands: Vec<Value> = m.operands(inst).to_vec();
        m.erase_inst(inst);
        removed += 1;
        for op in operands {
            if m.value(op).is_inst() {
                work.push(op);
            }
        }
    }
    if removed > 0 {
        log::debug!("dce: removed {removed} instructions in @{}", m.func_name(func));
    }
    removed
}

fn is_dead(m: &Module, inst: Value, erasable_call: &dyn Fn(&Module, Value) -> bool) -> bool {
    if !m.uses(inst).is_empty() {
        return false;
    }
    let Some(op) = m.opcode(inst) else { return false };
    if op.is_terminator() {
        return false;
    }
    match op {
        Opcode::Store | Opcode::Memset | Opcode::AtomicAdd => false,
        // An unused division may still trap.
        Opcode::SDiv | Opcode::SRem => divisor_known_nonzero(m, inst),
        Opcode::Call => erasable_call(m, m.operands(inst)[0]),
        _ => true,
    }
}

fn divisor_known_nonzero(m: &Module, inst: Value) -> bool {
    match m.const_kind(m.operands(inst)[1]) {
        Some(c) => c.is_nonzero(),
        None => false,
    }
}
