//! reg2mem: the inverse of mem2reg.
//!
//! Demotes every phi to a stack slot: each incoming value is stored in the
//! corresponding predecessor, the phi becomes a load at its own position.
//! Parallel-copy semantics are preserved by reading the slots of any
//! demoted-phi operands in a predecessor *before* that predecessor's own
//! stores (lost-copy and swap problems).
//!
//! Lowering stages that cannot consume phis request this before handoff.

use rustc_hash::FxHashMap;

use crate::analysis::AnalysisManager;
use crate::config::Config;
use crate::ir::{Module, Opcode, Ty, Value};

use super::FunctionPass;

pub struct Reg2Mem;

impl FunctionPass for Reg2Mem {
    fn name(&self) -> &'static str {
        "reg2mem"
    }

    fn run(&self, m: &mut Module, func: Value, am: &mut AnalysisManager, _cfg: &Config) -> usize {
        let n = demote_function(m, func);
        if n > 0 {
            am.induction_changed(func);
        }
        n
    }
}

pub fn demote_function(m: &mut Module, func: Value) -> usize {
    let mut phis: Vec<Value> = Vec::new();
    for &b in m.func_blocks(func) {
        phis.extend(m.phis_of(b));
    }
    if phis.is_empty() {
        return 0;
    }

    let Some(entry) = m.entry_block(func) else { return 0 };

    // One slot per phi, at the top of the entry block.
    let mut slot_of: FxHashMap<Value, Value> = FxHashMap::default();
    for (k, &phi) in phis.iter().enumerate() {
        let ptr_ty = m.types.pointer(m.ty(phi));
        let slot = m.create_inst(Opcode::Alloca, ptr_ty, &[]);
        let name = m.fresh_name(func, "demoted");
        m.set_name(slot, name);
        m.insert_inst(entry, k, slot);
        slot_of.insert(phi, slot);
    }

    // Stores in the predecessors. All edge reads happen before all edge
    // writes within one predecessor.
    for &b in &m.func_blocks(func).to_vec() {
        // (slot to write, value to write) per outgoing edge of b.
        let mut writes: Vec<(Value, Value)> = Vec::new();
        let mut reads: FxHashMap<Value, Value> = FxHashMap::default(); // phi -> load
        for succ in m.succ_blocks(b) {
            for phi in m.phis_of(succ) {
                let Some(v) = m.phi_incoming_for(phi, b) else { continue };
                let term = m.terminator(b).expect("terminated block");
                let v = if let Some(&vslot) = slot_of.get(&v) {
                    // The operand is itself a demoted phi: read its slot
                    // value as of this block, before any edge writes.
                    *reads.entry(v).or_insert_with(|| {
                        let load = m.create_inst(Opcode::Load, m.ty(v), &[vslot]);
                        m.insert_before(term, load);
                        load
                    })
                } else {
                    v
                };
                writes.push((slot_of[&phi], v));
            }
        }
        if writes.is_empty() {
            continue;
        }
        let term = m.terminator(b).expect("terminated block");
        for (slot, v) in writes {
            let store = m.create_inst(Opcode::Store, Ty::VOID, &[v, slot]);
            m.insert_before(term, store);
        }
    }

    // Replace each phi with a load from its slot.
    let count = phis.len();
    for phi in phis {
        let slot = slot_of[&phi];
        let block = m.inst_parent(phi).expect("phi placed");
        let pos = m.block_insts(block).iter().position(|&i| i == phi).expect("phi in block");
        let load = m.create_inst(Opcode::Load, m.ty(phi), &[slot]);
        m.drop_all_operands(phi);
        m.insert_inst(block, pos, load);
        m.replace_all_uses_with(phi, load);
        m.erase_inst(phi);
    }
    log::debug!("reg2mem: demoted {count} phis in @{}", m.func_name(func));
    count
}
