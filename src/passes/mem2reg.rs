//! mem2reg: promote stack slots to SSA registers with phi insertion.
//!
//! The standard construction:
//! 1. find promotable allocas (scalar slot, used only as the pointer of
//!    loads and stores — never address-taken),
//! 2. build CFG and dominator tree,
//! 3. compute per-slot liveness (phis are only placed where the slot is
//!    live-in, keeping the result pruned),
//! 4. insert phis at the iterated dominance frontier of the defining
//!    blocks,
//! 5. rename along a dominator-tree walk, rewriting loads to the reaching
//!    definition and deleting the stores and slots.
//!
//! Reference: "A Simple, Fast Dominance Algorithm" by Cooper, Harvey,
//! Kennedy (2001) for the underlying dominator machinery.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::analysis::cfg::Cfg;
use crate::analysis::dom::DomTree;
use crate::analysis::AnalysisManager;
use crate::config::Config;
use crate::ir::{Module, Opcode, Ty, Value};

use super::FunctionPass;

pub struct Mem2Reg;

impl FunctionPass for Mem2Reg {
    fn name(&self) -> &'static str {
        "mem2reg"
    }

    fn run(&self, m: &mut Module, func: Value, am: &mut AnalysisManager, _cfg: &Config) -> usize {
        let promoted = promote_function(m, func);
        if promoted > 0 {
            // Phis change the value graph but not the block graph; the
            // induction structure is what downstream consumers re-derive.
            am.induction_changed(func);
        }
        promoted
    }
}

/// A slot under promotion.
struct SlotInfo {
    alloca: Value,
    ty: Ty,
    /// Dense block indices containing a store.
    def_blocks: Vec<usize>,
    /// Dense block indices containing a load.
    use_blocks: Vec<usize>,
}

/// Promote every eligible slot of one function. Returns the number of
/// promoted allocas.
pub fn promote_function(m: &mut Module, func: Value) -> usize {
    let cfg = Cfg::build(m, func);
    let slots = find_promotable(m, func, &cfg);
    if slots.is_empty() {
        return 0;
    }
    let dom = DomTree::build(&cfg);
    let df = dom.frontiers(&cfg.preds);

    // Liveness: blocks where each slot is live-in, for pruned phi
    // placement.
    let live_in: Vec<FxHashSet<usize>> =
        slots.iter().map(|s| live_in_blocks(m, &cfg, s)).collect();

    // Phi placement at the iterated dominance frontier.
    let mut phis: FxHashMap<(usize, usize), Value> = FxHashMap::default(); // (slot, block) -> phi
    for (si, slot) in slots.iter().enumerate() {
        let mut work: Vec<usize> = slot.def_blocks.clone();
        let mut placed: FxHashSet<usize> = FxHashSet::default();
        while let Some(b) = work.pop() {
            for &frontier in &df[b] {
                if !placed.insert(frontier) {
                    continue;
                }
                if !live_in[si].contains(&frontier) {
                    continue;
                }
                let phi = m.create_inst(Opcode::Phi, slot.ty, &[]);
                let name = m.fresh_name(func, "m2r");
                m.set_name(phi, name);
                m.insert_inst(cfg.block(frontier), 0, phi);
                phis.insert((si, frontier), phi);
                // A phi is itself a definition.
                if !slot.def_blocks.contains(&frontier) {
                    work.push(frontier);
                }
            }
        }
    }

    rename(m, &cfg, &dom, &slots, &phis);

    // Edges from unreachable predecessors never got an incoming value
    // during the walk; feed them undef so phi lists match the CFG.
    for (&(si, b), &phi) in phis.iter() {
        for &p in cfg.preds.row(b) {
            let pred_block = cfg.block(p as usize);
            if m.phi_incoming_for(phi, pred_block).is_none() {
                let undef = m.undef(slots[si].ty);
                m.phi_add_incoming(phi, undef, pred_block);
            }
        }
    }

    // The slots are dead now.
    let count = slots.len();
    for slot in &slots {
        debug_assert!(m.uses(slot.alloca).is_empty());
        m.erase_inst(slot.alloca);
    }
    log::debug!("mem2reg: promoted {count} slots in @{}", m.func_name(func));
    count
}

/// A slot is promotable when its pointee is scalar and every use is a load
/// from it or a store *to* it (the slot may not itself be a stored value or
/// any other operand).
fn find_promotable(m: &Module, func: Value, cfg: &Cfg) -> Vec<SlotInfo> {
    let mut out = Vec::new();
    for &b in m.func_blocks(func) {
        for &inst in m.block_insts(b) {
            if m.opcode(inst) != Some(Opcode::Alloca) {
                continue;
            }
            let Some(pointee) = m.types.pointee(m.ty(inst)) else { continue };
            if m.types.is_array(pointee) {
                continue;
            }
            let mut def_blocks = Vec::new();
            let mut use_blocks = Vec::new();
            let mut promotable = true;
            for u in m.uses(inst) {
                let user_block = match m.inst_parent(u.user).and_then(|b| cfg.index_of.get(&b)) {
                    Some(&i) => i,
                    None => {
                        promotable = false;
                        break;
                    }
                };
                match (m.opcode(u.user), u.index) {
                    (Some(Opcode::Load), 0) => use_blocks.push(user_block),
                    (Some(Opcode::Store), 1) => def_blocks.push(user_block),
                    _ => {
                        promotable = false;
                        break;
                    }
                }
            }
            if promotable {
                out.push(SlotInfo { alloca: inst, ty: pointee, def_blocks, use_blocks })
            }
        }
    }
    out
}

/// Backward dataflow from the use blocks: a slot is live-in at a block when
/// some path from its entry reaches a load before any store.
fn live_in_blocks(m: &Module, cfg: &Cfg, slot: &SlotInfo) -> FxHashSet<usize> {
    // Blocks whose first relevant access is a load.
    let mut upward_exposed: Vec<usize> = Vec::new();
    for &b in &slot.use_blocks {
        let mut exposed = true;
        for &inst in m.block_insts(cfg.block(b)) {
            match m.opcode(inst) {
                Some(Opcode::Store) if m.operands(inst)[1] == slot.alloca => {
                    exposed = false;
                    break;
                }
                Some(Opcode::Load) if m.operands(inst)[0] == slot.alloca => break,
                _ => {}
            }
        }
        if exposed {
            upward_exposed.push(b);
        }
    }

    let defs: FxHashSet<usize> = slot.def_blocks.iter().copied().collect();
    let mut live: FxHashSet<usize> = FxHashSet::default();
    let mut work = upward_exposed;
    while let Some(b) = work.pop() {
        if !live.insert(b) {
            continue;
        }
        for &p in cfg.preds.row(b) {
            let p = p as usize;
            // Liveness does not propagate past a block that redefines the
            // slot.
            if !live.contains(&p) && !defs.contains(&p) {
                work.push(p);
            }
        }
    }
    live
}

/// Dominator-tree renaming walk.
fn rename(
    m: &mut Module,
    cfg: &Cfg,
    dom: &DomTree,
    slots: &[SlotInfo],
    phis: &FxHashMap<(usize, usize), Value>,
) {
    let slot_of: FxHashMap<Value, usize> =
        slots.iter().enumerate().map(|(i, s)| (s.alloca, i)).collect();

    // Reaching definition stacks, one per slot.
    let mut stacks: Vec<Vec<Value>> = vec![Vec::new(); slots.len()];

    enum Step {
        Visit(usize),
        Pop(Vec<(usize, usize)>), // (slot, stack height to restore)
    }
    let mut agenda = vec![Step::Visit(0)];

    while let Some(step) = agenda.pop() {
        match step {
            Step::Pop(restore) => {
                for (si, height) in restore {
                    stacks[si].truncate(height);
                }
            }
            Step::Visit(b) => {
                let mut restore: Vec<(usize, usize)> = Vec::new();

                // Phis defined here become reaching definitions first.
                for (si, _) in slots.iter().enumerate() {
                    if let Some(&phi) = phis.get(&(si, b)) {
                        restore.push((si, stacks[si].len()));
                        stacks[si].push(phi);
                    }
                }

                let insts: Vec<Value> = m.block_insts(cfg.block(b)).to_vec();
                for inst in insts {
                    match m.opcode(inst) {
                        Some(Opcode::Load) => {
                            let Some(&si) = slot_of.get(&m.operands(inst)[0]) else { continue };
                            let reaching = match stacks[si].last() {
                                Some(&v) => v,
                                None => m.undef(slots[si].ty),
                            };
                            m.replace_all_uses_with(inst, reaching);
                            m.erase_inst(inst);
                        }
                        Some(Opcode::Store) => {
                            let Some(&si) = slot_of.get(&m.operands(inst)[1]) else { continue };
                            let stored = m.operands(inst)[0];
                            restore.push((si, stacks[si].len()));
                            stacks[si].push(stored);
                            m.erase_inst(inst);
                        }
                        _ => {}
                    }
                }

                // Feed successor phis the reaching values along this edge.
                let block_v = cfg.block(b);
                for &s in cfg.succs.row(b) {
                    let s = s as usize;
                    for (si, slot) in slots.iter().enumerate() {
                        if let Some(&phi) = phis.get(&(si, s)) {
                            let reaching = match stacks[si].last() {
                                Some(&v) => v,
                                None => m.undef(slot.ty),
                            };
                            m.phi_add_incoming(phi, reaching, block_v);
                        }
                    }
                }

                agenda.push(Step::Pop(restore));
                for &child in dom.children[b].iter().rev() {
                    agenda.push(Step::Visit(child));
                }
            }
        }
    }

    // Unreachable blocks were never renamed; their loads/stores of
    // promoted slots must still be detached.
    for b in 0..cfg.num_blocks() {
        if dom.is_reachable(b) {
            continue;
        }
        let insts: Vec<Value> = m.block_insts(cfg.block(b)).to_vec();
        for inst in insts {
            match m.opcode(inst) {
                Some(Opcode::Load) => {
                    if let Some(&si) = slot_of.get(&m.operands(inst)[0]) {
                        let undef = m.undef(slots[si].ty);
                        m.replace_all_uses_with(inst, undef);
                        m.erase_inst(inst);
                    }
                }
                Some(Opcode::Store) => {
                    if slot_of.contains_key(&m.operands(inst)[1]) {
                        m.erase_inst(inst);
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::dump::print_module;
    use crate::ir::parse::parse_module;
    use crate::ir::verify::verify;

    fn count_ops(m: &Module, func: Value, op: Opcode) -> usize {
        m.all_insts(func).iter().filter(|&&i| m.opcode(i) == Some(op)).count()
    }

    #[test]
    fn straight_line_slots_disappear() {
        // int x = 1; x = 2; return x;
        let mut m = parse_module(
            r#"
define i32 @main() {
entry:
  %x = alloca i32
  store i32 1, i32* %x
  store i32 2, i32* %x
  %v = load i32, i32* %x
  ret i32 %v
}
"#,
        )
        .unwrap();
        let f = m.find_function("main").unwrap();
        assert_eq!(promote_function(&mut m, f), 1);
        verify(&m).unwrap();
        assert_eq!(count_ops(&m, f, Opcode::Alloca), 0);
        assert_eq!(count_ops(&m, f, Opcode::Store), 0);
        assert_eq!(count_ops(&m, f, Opcode::Load), 0);
        let term = m.terminator(m.entry_block(f).unwrap()).unwrap();
        assert_eq!(m.const_kind(m.operands(term)[0]).unwrap().as_int(), Some(2));
    }

    #[test]
    fn diamond_gets_one_phi() {
        let mut m = parse_module(
            r#"
define i32 @f(i1 %c) {
entry:
  %x = alloca i32
  br i1 %c, label %a, label %b
a:
  store i32 1, i32* %x
  br label %join
b:
  store i32 2, i32* %x
  br label %join
join:
  %v = load i32, i32* %x
  ret i32 %v
}
"#,
        )
        .unwrap();
        let f = m.find_function("f").unwrap();
        assert_eq!(promote_function(&mut m, f), 1);
        verify(&m).unwrap();
        assert_eq!(count_ops(&m, f, Opcode::Phi), 1);
        let text = print_module(&m);
        assert!(text.contains("phi i32 [ 1, %a ], [ 2, %b ]") || text.contains("phi i32 [ 2, %b ], [ 1, %a ]"));
    }

    #[test]
    fn loop_counter_becomes_phi() {
        let mut m = parse_module(
            r#"
define i32 @f(i32 %n) {
entry:
  %i = alloca i32
  store i32 0, i32* %i
  br label %head
head:
  %iv = load i32, i32* %i
  %c = icmp slt i32 %iv, %n
  br i1 %c, label %body, label %exit
body:
  %iv2 = load i32, i32* %i
  %next = add i32 %iv2, 1
  store i32 %next, i32* %i
  br label %head
exit:
  %r = load i32, i32* %i
  ret i32 %r
}
"#,
        )
        .unwrap();
        let f = m.find_function("f").unwrap();
        assert_eq!(promote_function(&mut m, f), 1);
        verify(&m).unwrap();
        // One phi in the header; the exit load collapsed to it.
        assert_eq!(count_ops(&m, f, Opcode::Phi), 1);
        assert_eq!(count_ops(&m, f, Opcode::Load), 0);
    }

    #[test]
    fn address_taken_slot_stays() {
        // The slot's address escapes into a call: not promotable.
        let mut m = parse_module(
            r#"
declare i32 @getarray(i32*) builtin

define i32 @f() {
entry:
  %buf = alloca i32
  %n = call i32 @getarray(i32* %buf)
  %v = load i32, i32* %buf
  ret i32 %v
}
"#,
        )
        .unwrap();
        let f = m.find_function("f").unwrap();
        assert_eq!(promote_function(&mut m, f), 0);
        assert_eq!(count_ops(&m, f, Opcode::Alloca), 1);
    }

    #[test]
    fn load_before_any_store_reads_undef() {
        let mut m = parse_module(
            r#"
define i32 @f() {
entry:
  %x = alloca i32
  %v = load i32, i32* %x
  ret i32 %v
}
"#,
        )
        .unwrap();
        let f = m.find_function("f").unwrap();
        assert_eq!(promote_function(&mut m, f), 1);
        verify(&m).unwrap();
        let term = m.terminator(m.entry_block(f).unwrap()).unwrap();
        assert!(matches!(
            m.const_kind(m.operands(term)[0]),
            Some(crate::ir::ConstKind::Undef)
        ));
    }
}
