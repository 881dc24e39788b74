//! Loop-invariant code motion.
//!
//! For each loop with a preheader, innermost first: an instruction hoists
//! when every operand is defined outside the loop (or already hoisted) and
//! executing it early is sound — pure arithmetic always; division only
//! when its block dominates every loop exit (the preheader would otherwise
//! introduce a trap the source never reached); loads only when the address
//! is invariant and nothing in the loop can write memory.

use rustc_hash::FxHashSet;

use crate::analysis::cfg::Cfg;
use crate::analysis::dom::DomTree;
use crate::analysis::loops::{Loop, LoopInfo};
use crate::analysis::sideeffect::SideEffects;
use crate::analysis::AnalysisManager;
use crate::config::Config;
use crate::ir::{Module, Opcode, Value};

use super::FunctionPass;

pub struct Licm;

impl FunctionPass for Licm {
    fn name(&self) -> &'static str {
        "licm"
    }

    fn run(&self, m: &mut Module, func: Value, am: &mut AnalysisManager, _cfg: &Config) -> usize {
        let se = am.side_effects(m);
        let n = licm_function(m, func, &se);
        if n > 0 {
            am.induction_changed(func);
        }
        n
    }
}

pub fn licm_function(m: &mut Module, func: Value, se: &SideEffects) -> usize {
    let cfg = Cfg::build(m, func);
    let dom = DomTree::build(&cfg);
    let loops = LoopInfo::compute(&cfg, &dom);
    if loops.is_empty() {
        return 0;
    }

    let mut hoisted_total = 0;
    for li in loops.innermost_first() {
        hoisted_total += hoist_loop(m, &cfg, &dom, &loops.loops[li], se);
    }
    if hoisted_total > 0 {
        log::debug!("licm: hoisted {hoisted_total} instructions in @{}", m.func_name(func));
    }
    hoisted_total
}

fn hoist_loop(m: &mut Module, cfg: &Cfg, dom: &DomTree, l: &Loop, se: &SideEffects) -> usize {
    let Some(preheader) = l.preheader(cfg) else { return 0 };
    let preheader_b = cfg.block(preheader);

    // May anything in the loop write memory? Gates load hoisting.
    let mut loop_writes = false;
    for &bi in &l.blocks {
        for &inst in m.block_insts(cfg.block(bi)) {
            match m.opcode(inst) {
                Some(op) if op.writes_memory() => loop_writes = true,
                Some(Opcode::Call) => {
                    if !se.no_side_effect(m.operands(inst)[0]) {
                        loop_writes = true;
                    }
                }
                _ => {}
            }
        }
    }

    // Blocks dominating every exit may host trapping instructions safely.
    let dominates_exits =
        |b: usize| l.exits.iter().all(|&e| dom.dominates(b, e));

    let mut hoisted: FxHashSet<Value> = FxHashSet::default();
    let mut count = 0;
    loop {
        let mut changed = false;
        // Loop blocks in RPO keeps defs ahead of uses among hoistees.
        for &b in &dom.order {
            if !l.contains(b) {
                continue;
            }
            let insts: Vec<Value> = m.block_insts(cfg.block(b)).to_vec();
            for inst in insts {
                if hoisted.contains(&inst) {
                    continue;
                }
                if !can_hoist(m, cfg, l, &hoisted, inst, loop_writes)
                    || (m.opcode(inst).is_some_and(|o| o.may_trap()) && !dominates_exits(b))
                {
                    continue;
                }
                let term = m.terminator(preheader_b).expect("preheader terminated");
                m.unlink_inst(inst);
                m.insert_before(term, inst);
                hoisted.insert(inst);
                count += 1;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    count
}

fn can_hoist(
    m: &Module,
    cfg: &Cfg,
    l: &Loop,
    hoisted: &FxHashSet<Value>,
    inst: Value,
    loop_writes: bool,
) -> bool {
    let Some(op) = m.opcode(inst) else { return false };
    let pure = op.is_binary() || op.is_cmp() || op.is_cast() || op == Opcode::GetElementPtr || op == Opcode::FNeg;
    let ok_kind = pure || (op == Opcode::Load && !loop_writes);
    if !ok_kind {
        return false;
    }
    m.operands(inst).iter().all(|&o| {
        hoisted.contains(&o)
            || match m.inst_parent(o) {
                Some(b) => match cfg.index_of.get(&b) {
                    Some(&bi) => !l.contains(bi),
                    None => true,
                },
                None => true,
            }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::callgraph::CallGraph;
    use crate::ir::parse::parse_module;
    use crate::ir::verify::verify;

    fn run(m: &mut Module, name: &str) -> usize {
        let f = m.find_function(name).unwrap();
        let cg = CallGraph::build(m);
        let se = SideEffects::compute(m, &cg);
        licm_function(m, f, &se)
    }

    #[test]
    fn hoists_invariant_multiply() {
        let mut m = parse_module(
            r#"
define i32 @f(i32 %n) {
entry:
  br label %head
head:
  %i = phi i32 [ 0, %entry ], [ %next, %body ]
  %c = icmp slt i32 %i, %n
  br i1 %c, label %body, label %exit
body:
  %inv = mul i32 %n, 4
  %use = add i32 %inv, %i
  %next = add i32 %i, 1
  br label %head
exit:
  ret i32 0
}
"#,
        )
        .unwrap();
        assert_eq!(run(&mut m, "f"), 1);
        verify(&m).unwrap();
        // The multiply now sits in the entry (the preheader).
        let f = m.find_function("f").unwrap();
        let entry = m.entry_block(f).unwrap();
        assert!(m
            .block_insts(entry)
            .iter()
            .any(|&i| m.opcode(i) == Some(Opcode::Mul)));
    }

    #[test]
    fn iv_update_stays_in_loop() {
        let mut m = parse_module(
            r#"
define i32 @f(i32 %n) {
entry:
  br label %head
head:
  %i = phi i32 [ 0, %entry ], [ %next, %head ]
  %next = add i32 %i, 1
  %c = icmp slt i32 %next, %n
  br i1 %c, label %head, label %exit
exit:
  ret i32 0
}
"#,
        )
        .unwrap();
        assert_eq!(run(&mut m, "f"), 0);
    }

    #[test]
    fn invariant_load_hoists_when_loop_is_write_free() {
        let mut m = parse_module(
            r#"
@g = global i32 0

define i32 @f(i32 %n) {
entry:
  br label %head
head:
  %i = phi i32 [ 0, %entry ], [ %next, %body ]
  %c = icmp slt i32 %i, %n
  br i1 %c, label %body, label %exit
body:
  %v = load i32, i32* @g
  %u = add i32 %v, %i
  %next = add i32 %i, 1
  br label %head
exit:
  ret i32 0
}
"#,
        )
        .unwrap();
        assert_eq!(run(&mut m, "f"), 1);
        verify(&m).unwrap();
    }

    #[test]
    fn load_stays_when_loop_stores() {
        let mut m = parse_module(
            r#"
@g = global i32 0

define i32 @f(i32 %n) {
entry:
  br label %head
head:
  %i = phi i32 [ 0, %entry ], [ %next, %body ]
  %c = icmp slt i32 %i, %n
  br i1 %c, label %body, label %exit
body:
  %v = load i32, i32* @g
  store i32 %i, i32* @g
  %next = add i32 %i, 1
  br label %head
exit:
  ret i32 0
}
"#,
        )
        .unwrap();
        assert_eq!(run(&mut m, "f"), 0);
    }

    #[test]
    fn division_by_param_is_not_speculated_past_a_guard() {
        // The division sits behind an in-loop guard and does not dominate
        // the exit; hoisting it would trap when %d is zero.
        let mut m = parse_module(
            r#"
define i32 @f(i32 %n, i32 %d) {
entry:
  br label %head
head:
  %i = phi i32 [ 0, %entry ], [ %next, %latch ]
  %c = icmp slt i32 %i, %n
  br i1 %c, label %guard, label %exit
guard:
  %nz = icmp ne i32 %d, 0
  br i1 %nz, label %divblk, label %latch
divblk:
  %q = sdiv i32 100, %d
  br label %latch
latch:
  %next = add i32 %i, 1
  br label %head
exit:
  ret i32 0
}
"#,
        )
        .unwrap();
        let f = m.find_function("f").unwrap();
        run(&mut m, "f");
        verify(&m).unwrap();
        // %q must not move to the entry; %nz may.
        let entry = m.entry_block(f).unwrap();
        assert!(m
            .block_insts(entry)
            .iter()
            .all(|&i| m.opcode(i) != Some(Opcode::SDiv)));
    }
}
