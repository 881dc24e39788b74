//! Loop-body extraction.
//!
//! Outlines the body of a dependence-free counted loop into a fresh
//! function `body(lo, hi)` that runs iterations `[lo, hi)`. Values
//! flowing into the loop are passed through module-level slots (the
//! outlined signature stays fixed for the parallel runtime); scalar `+`
//! reductions accumulate into a slot through `atomicadd` and are folded
//! back after the loop. The extract pass itself keeps the loop and calls
//! the outlined body one iteration at a time; `loop-parallel` reuses the
//! same outlining to hand the whole range to the runtime.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::analysis::cfg::Cfg;
use crate::analysis::indvar::{exit_condition, ExitCond, IndVarInfo};
use crate::analysis::loops::{analyze_loops, Loop};
use crate::analysis::parallel::LoopParallelism;
use crate::analysis::AnalysisManager;
use crate::config::Config;
use crate::ir::{CmpPred, FnAttrs, Module, Opcode, Ty, Value};

use super::loop_unroll::clone_region;
use super::FunctionPass;

pub struct LoopExtract;

impl FunctionPass for LoopExtract {
    fn name(&self) -> &'static str {
        "loop-extract"
    }

    fn run(&self, m: &mut Module, func: Value, am: &mut AnalysisManager, _cfg: &Config) -> usize {
        let Some(pi) = am.parallel_info(m, func) else { return 0 };
        let n = extract_one(m, func, &pi.per_loop);
        if n > 0 {
            am.cfg_changed(func);
            am.call_changed();
        }
        n
    }
}

fn extract_one(m: &mut Module, func: Value, parallelism: &[LoopParallelism]) -> usize {
    let (g, _dom, loops) = analyze_loops(m, func);
    let ivs = IndVarInfo::compute(m, &g, &loops);
    for li in loops.innermost_first() {
        let l = &loops.loops[li];
        let pl = &parallelism[li];
        // Sequential extraction keeps the loop; reductions would need the
        // fold-back plumbing of the parallel path for no benefit here.
        if !pl.parallelizable || !pl.reductions.is_empty() {
            continue;
        }
        let Some(exit) = exit_condition(m, &g, l, &ivs.per_loop[li]) else { continue };
        let Some(out) = outline_loop(m, func, &g, l, pl, &exit) else { continue };

        // Per-iteration call: the body block becomes `call body(i, i+1)`.
        let header = g.block(l.header);
        let latch = g.block(l.latch().expect("simplified"));
        let preheader = g.block(l.preheader(&g).expect("simplified"));
        store_live_ins(m, preheader, &out);

        let nb = m.add_block_after(func, header);
        let name = m.fresh_name(func, "extracted");
        m.set_name(nb, name);
        let one = m.const_int(1);
        let next = m.create_inst(Opcode::Add, Ty::I32, &[exit.iv.phi, one]);
        m.append_inst(nb, next);
        let call =
            m.create_inst(Opcode::Call, Ty::VOID, &[out.body_fn, exit.iv.phi, next]);
        m.append_inst(nb, call);
        let br = m.create_inst(Opcode::Br, Ty::VOID, &[header]);
        m.append_inst(nb, br);

        // The header now loops through the call block.
        let term = m.terminator(header).expect("header branch");
        let body_entry = {
            let ops = m.operands(term);
            if g.index_of.get(&ops[1]).is_some_and(|&i| l.contains(i)) {
                1
            } else {
                2
            }
        };
        m.set_operand(term, body_entry, nb);
        let iv_pos = m
            .phi_incoming(exit.iv.phi)
            .iter()
            .position(|&(_, b)| b == latch)
            .expect("latch edge");
        m.set_operand(exit.iv.phi, iv_pos * 2, next);
        m.rehome_phi_preds(header, latch, nb);

        // The old body is unreachable now.
        for &bi in &l.blocks {
            if bi != l.header {
                m.remove_block(g.block(bi));
            }
        }
        log::debug!("loop-extract: outlined a loop body in @{}", m.func_name(func));
        return 1;
    }
    0
}

pub(crate) struct Outlined {
    pub body_fn: Value,
    /// `(reduction phi, init value, accumulator slot)`.
    pub reductions: Vec<(Value, Value, Value)>,
    /// `(live-in value, module slot)`.
    pub live_ins: Vec<(Value, Value)>,
}

/// Write the live-in values (and zero the reduction accumulators) in front
/// of `block`'s terminator.
pub(crate) fn store_live_ins(m: &mut Module, block: Value, out: &Outlined) {
    let term = m.terminator(block).expect("terminated");
    for &(v, slot) in &out.live_ins {
        let store = m.create_inst(Opcode::Store, Ty::VOID, &[v, slot]);
        m.insert_before(term, store);
    }
    for &(phi, _, slot) in &out.reductions {
        let zero = m.const_zero(m.ty(phi));
        let store = m.create_inst(Opcode::Store, Ty::VOID, &[zero, slot]);
        m.insert_before(term, store);
    }
}

/// Build `void body(i32 lo, i32 hi)` executing iterations `[lo, hi)` of
/// the loop. Returns `None` when the loop shape does not qualify.
pub(crate) fn outline_loop(
    m: &mut Module,
    func: Value,
    g: &Cfg,
    l: &Loop,
    pl: &LoopParallelism,
    exit: &ExitCond,
) -> Option<Outlined> {
    if !l.is_simplified(g) || l.exits != vec![l.header] {
        return None;
    }
    if exit.pred != CmpPred::Lt || exit.iv.const_step(m) != Some(1) {
        return None;
    }
    let header = g.block(l.header);
    let latch = g.block(l.latch()?);

    // Live-ins: loop-used values defined outside (arguments or
    // instructions). Constants, globals, and functions are module-scoped
    // already.
    let region: Vec<Value> =
        l.blocks.iter().filter(|&&bi| bi != l.header).map(|&bi| g.block(bi)).collect();
    let in_loop: FxHashSet<Value> = {
        let mut s = FxHashSet::default();
        for &b in l.blocks.iter().map(|&bi| &g.blocks[bi]) {
            for &i in m.block_insts(b) {
                s.insert(i);
            }
        }
        s
    };
    // Only operands of the outlined region itself need capture slots; the
    // header's compare and phis stay behind in the caller.
    let mut live_in_values: Vec<Value> = Vec::new();
    for &b in &region {
        for &inst in m.block_insts(b) {
            for &o in m.operands(inst) {
                if in_loop.contains(&o) || live_in_values.contains(&o) {
                    continue;
                }
                if o == exit.iv.phi || pl.reductions.iter().any(|r| r.phi == o) {
                    continue;
                }
                let needs_slot = match &m.value(o).kind {
                    crate::ir::ValueKind::Argument { .. } => true,
                    crate::ir::ValueKind::Inst(_) => true,
                    _ => false,
                };
                if needs_slot {
                    live_in_values.push(o);
                }
            }
        }
    }

    let body_name = {
        let base = m.func_name(func).to_string();
        m.fresh_name(func, &format!("{base}.body"))
    };
    let i32x2 = m.types.function(Ty::VOID, vec![Ty::I32, Ty::I32]);
    let bf = m.add_function(body_name, i32x2);
    m.set_fn_attrs(bf, FnAttrs::PARALLEL_BODY | FnAttrs::NO_INLINE);
    let (lo, hi) = {
        let args = m.func_args(bf);
        (args[0], args[1])
    };

    // Slots for live-ins and reduction accumulators.
    let mut live_ins = Vec::new();
    for (k, &v) in live_in_values.iter().enumerate() {
        let content = m.ty(v);
        let slot = m.add_global(format!("__capt.{}.{k}", m.func_name(bf)), content, crate::ir::GlobalInit::Zero, false);
        live_ins.push((v, slot));
    }
    let mut reductions = Vec::new();
    for r in &pl.reductions {
        let content = m.ty(r.phi);
        let slot = m.add_global(
            format!("__red.{}.{}", m.func_name(bf), reductions.len()),
            content,
            crate::ir::GlobalInit::Zero,
            false,
        );
        reductions.push((r.phi, r.init, slot));
    }

    // entry: load captures; head: iv phi + bound test; exit: ret void.
    let entry = m.add_block(bf);
    m.set_name(entry, "entry");
    let head = m.add_block(bf);
    m.set_name(head, "head");
    let done = m.add_block(bf);
    m.set_name(done, "done");

    let mut vmap: FxHashMap<Value, Value> = FxHashMap::default();
    for &(v, slot) in &live_ins {
        let load = m.create_inst(Opcode::Load, m.ty(v), &[slot]);
        m.append_inst(entry, load);
        vmap.insert(v, load);
    }
    let br_head = m.create_inst(Opcode::Br, Ty::VOID, &[head]);
    m.append_inst(entry, br_head);

    let iv2 = m.create_inst(Opcode::Phi, Ty::I32, &[]);
    m.set_name(iv2, "iv");
    m.append_inst(head, iv2);
    let cmp = m.create_inst(Opcode::ICmp(CmpPred::Lt), Ty::BOOL, &[iv2, hi]);
    m.append_inst(head, cmp);
    vmap.insert(exit.iv.phi, iv2);
    // Reduction phis have no body uses besides their update; map them to
    // undef so stray clones never reach across functions.
    for &(phi, ..) in &reductions {
        let u = m.undef(m.ty(phi));
        vmap.insert(phi, u);
    }
    vmap.insert(header, head);

    clone_region(m, bf, &region, &mut vmap);

    // Wire the header: enter the body clone, leave to done.
    let body_entry = {
        let term = m.terminator(header).expect("header branch");
        let ops = m.operands(term);
        if g.index_of.get(&ops[1]).is_some_and(|&i| l.contains(i)) {
            ops[1]
        } else {
            ops[2]
        }
    };
    let condbr =
        m.create_inst(Opcode::CondBr, Ty::VOID, &[cmp, vmap[&body_entry], done]);
    m.append_inst(head, condbr);
    let ret = m.create_inst(Opcode::Ret, Ty::VOID, &[]);
    m.append_inst(done, ret);

    // iv' = phi [lo, entry], [update', latch'].
    let iv_update = vmap[&exit.iv.update];
    m.phi_add_incoming(iv2, lo, entry);
    m.phi_add_incoming(iv2, iv_update, vmap[&latch]);

    // Reduction updates become atomic accumulation into the slot.
    for (r, &(.., slot)) in pl.reductions.iter().zip(&reductions) {
        let cloned = vmap[&r.update];
        let ops = m.operands(cloned).to_vec();
        let term_v = if m.operands(r.update)[0] == r.phi { ops[1] } else { ops[0] };
        let atomic = m.create_inst(Opcode::AtomicAdd, m.ty(term_v), &[slot, term_v]);
        m.insert_before(cloned, atomic);
        debug_assert!(m.uses(cloned).is_empty());
        m.erase_inst(cloned);
    }

    Some(Outlined { body_fn: bf, reductions, live_ins })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisManager;
    use crate::ir::parse::parse_module;
    use crate::ir::verify::verify;
    use crate::passes::FunctionPass;

    #[test]
    fn elementwise_loop_body_is_outlined() {
        let mut m = parse_module(
            r#"
@a = global [100 x i32] zeroinitializer

define void @f(i32 %k) {
entry:
  %base = bitcast [100 x i32]* @a to i32*
  br label %head
head:
  %i = phi i32 [ 0, %entry ], [ %next, %body ]
  %c = icmp slt i32 %i, 100
  br i1 %c, label %body, label %exit
body:
  %p = getelementptr i32, i32* %base, i32 %i
  %v = load i32, i32* %p
  %v2 = mul i32 %v, %k
  store i32 %v2, i32* %p
  %next = add i32 %i, 1
  br label %head
exit:
  ret void
}
"#,
        )
        .unwrap();
        let f = m.find_function("f").unwrap();
        let mut am = AnalysisManager::new();
        assert_eq!(LoopExtract.run(&mut m, f, &mut am, &Config::default()), 1);
        verify(&m).unwrap();

        // A parallel-body function exists and the loop now calls it.
        let bf = m
            .functions
            .iter()
            .copied()
            .find(|&x| m.fn_attrs(x).contains(FnAttrs::PARALLEL_BODY))
            .expect("outlined body");
        assert_eq!(m.func_args(bf).len(), 2);
        let calls: Vec<Value> = m
            .all_insts(f)
            .into_iter()
            .filter(|&i| m.opcode(i) == Some(Opcode::Call))
            .collect();
        assert_eq!(calls.len(), 1);
        assert_eq!(m.operands(calls[0])[0], bf);
        // The captured %base and %k flow through module slots.
        assert!(m.globals.len() >= 3);
    }

    #[test]
    fn loop_with_carried_dependence_is_not_outlined() {
        let mut m = parse_module(
            r#"
@a = global [100 x i32] zeroinitializer

define void @f() {
entry:
  %base = bitcast [100 x i32]* @a to i32*
  br label %head
head:
  %i = phi i32 [ 0, %entry ], [ %next, %body ]
  %c = icmp slt i32 %i, 99
  br i1 %c, label %body, label %exit
body:
  %p = getelementptr i32, i32* %base, i32 %i
  %v = load i32, i32* %p
  %i1 = add i32 %i, 1
  %q = getelementptr i32, i32* %base, i32 %i1
  store i32 %v, i32* %q
  %next = add i32 %i, 1
  br label %head
exit:
  ret void
}
"#,
        )
        .unwrap();
        let f = m.find_function("f").unwrap();
        let mut am = AnalysisManager::new();
        assert_eq!(LoopExtract.run(&mut m, f, &mut am, &Config::default()), 0);
    }
}
