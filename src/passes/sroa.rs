//! Scalar replacement of aggregates.
//!
//! A local array whose every access bottoms out at a compile-time-constant
//! element index is split into one scalar slot per touched element; the
//! decay/gep chains disappear and mem2reg can then promote the scalars.
//! A whole-array zero memset becomes per-element zero stores. Any dynamic
//! index, partial pointer escape, or call use keeps the array intact.

use rustc_hash::FxHashMap;

use crate::analysis::AnalysisManager;
use crate::config::Config;
use crate::ir::{Module, Opcode, Value};

use super::FunctionPass;

pub struct Sroa;

impl FunctionPass for Sroa {
    fn name(&self) -> &'static str {
        "sroa"
    }

    fn run(&self, m: &mut Module, func: Value, am: &mut AnalysisManager, _cfg: &Config) -> usize {
        let n = run_function(m, func);
        if n > 0 {
            am.induction_changed(func);
        }
        n
    }
}

/// A fully-resolved scalar element access.
struct ElemAccess {
    /// The final pointer whose pointee is the scalar element.
    leaf: Value,
    flat_index: usize,
}

pub fn run_function(m: &mut Module, func: Value) -> usize {
    let mut split = 0;
    for &b in &m.func_blocks(func).to_vec() {
        for &inst in &m.block_insts(b).to_vec() {
            if m.opcode(inst) != Some(Opcode::Alloca) {
                continue;
            }
            let Some(pointee) = m.types.pointee(m.ty(inst)) else { continue };
            if !m.types.is_array(pointee) {
                continue;
            }
            if split_alloca(m, func, inst) {
                split += 1;
            }
        }
    }
    if split > 0 {
        log::debug!("sroa: split {split} arrays in @{}", m.func_name(func));
    }
    split
}

fn split_alloca(m: &mut Module, func: Value, alloca: Value) -> bool {
    let arr_ty = m.types.pointee(m.ty(alloca)).expect("array alloca");
    let elem_ty = m.types.array_elem(arr_ty).expect("array type");
    let total: usize = m.types.array_dims(arr_ty).expect("dims").iter().product();
    let elem_size = m.types.size(elem_ty);

    let mut accesses: Vec<ElemAccess> = Vec::new();
    let mut memsets: Vec<Value> = Vec::new();
    let mut chain: Vec<Value> = Vec::new();
    if !walk_pointer(m, alloca, 0, elem_size, total, &mut accesses, &mut memsets, &mut chain) {
        return false;
    }
    if accesses.is_empty() && memsets.is_empty() {
        return false;
    }

    // One scalar slot per touched element, placed right after the array
    // slot.
    let ptr_ty = m.types.pointer(elem_ty);
    let block = m.inst_parent(alloca).expect("alloca placed");
    let at = m
        .block_insts(block)
        .iter()
        .position(|&i| i == alloca)
        .expect("alloca in block");
    let mut slots: FxHashMap<usize, Value> = FxHashMap::default();
    let mut indices: Vec<usize> = accesses.iter().map(|a| a.flat_index).collect();
    indices.sort_unstable();
    indices.dedup();
    for (k, &idx) in indices.iter().enumerate() {
        let slot = m.create_inst(Opcode::Alloca, ptr_ty, &[]);
        let name = m.fresh_name(func, "sroa");
        m.set_name(slot, name);
        m.insert_inst(block, at + 1 + k, slot);
        slots.insert(idx, slot);
    }

    // Whole-array zero fills become explicit element stores.
    for ms in memsets {
        for &idx in &indices {
            let zero = m.const_zero(elem_ty);
            let store = m.create_inst(Opcode::Store, crate::ir::Ty::VOID, &[zero, slots[&idx]]);
            m.insert_before(ms, store);
        }
        m.erase_inst(ms);
    }

    for a in &accesses {
        let slot = slots[&a.flat_index];
        m.replace_all_uses_with(a.leaf, slot);
    }
    // The chains are dead now, leaves first.
    for &node in chain.iter().rev() {
        if m.uses(node).is_empty() && m.inst_parent(node).is_some() {
            m.erase_inst(node);
        }
    }
    debug_assert!(m.uses(alloca).is_empty());
    m.erase_inst(alloca);
    true
}

/// Walk the pointer-use tree from `ptr` at a known element offset.
/// Returns false on any access the split cannot express.
#[allow(clippy::too_many_arguments)]
fn walk_pointer(
    m: &Module,
    ptr: Value,
    offset: usize,
    elem_size: usize,
    total: usize,
    accesses: &mut Vec<ElemAccess>,
    memsets: &mut Vec<Value>,
    chain: &mut Vec<Value>,
) -> bool {
    let pointee = match m.types.pointee(m.ty(ptr)) {
        Some(p) => p,
        None => return false,
    };
    let is_scalar = !m.types.is_array(pointee);
    let sub_elems = m.types.size(pointee) / elem_size.max(1);

    for u in m.uses(ptr) {
        let user = u.user;
        match m.opcode(user) {
            Some(Opcode::Bitcast) => {
                chain.push(user);
                if !walk_pointer(m, user, offset, elem_size, total, accesses, memsets, chain) {
                    return false;
                }
            }
            Some(Opcode::GetElementPtr) => {
                if u.index != 0 {
                    return false;
                }
                let idx = m.operands(user)[1];
                let Some(c) = m.const_kind(idx).and_then(|c| c.as_int()) else {
                    return false;
                };
                if c < 0 {
                    return false;
                }
                let stepped = offset + c as usize * sub_elems;
                if stepped >= total {
                    return false;
                }
                chain.push(user);
                if !walk_pointer(m, user, stepped, elem_size, total, accesses, memsets, chain) {
                    return false;
                }
            }
            Some(Opcode::Load) if is_scalar => {
                accesses.push(ElemAccess { leaf: ptr, flat_index: offset });
            }
            Some(Opcode::Store) if is_scalar && u.index == 1 => {
                accesses.push(ElemAccess { leaf: ptr, flat_index: offset });
            }
            Some(Opcode::Memset) if u.index == 0 => {
                // Only a fill of the entire array from its base.
                let len = m.const_kind(m.operands(user)[1]).and_then(|c| c.as_int());
                if offset != 0 || len != Some((total * elem_size) as i64) {
                    return false;
                }
                memsets.push(user);
            }
            _ => return false,
        }
    }
    true
}
