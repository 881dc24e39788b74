//! Loop parallelization.
//!
//! A counted loop whose iterations are proven independent (dependence
//! analysis plus the reduction/scalar checks in `analysis::parallel`) is
//! outlined and replaced by one call to the parallel-for runtime entry,
//! which partitions `[start, bound)` across workers and invokes the body
//! on sub-ranges. Scalar `+` reductions accumulate atomically and fold
//! back into SSA after the call.

use crate::analysis::indvar::{exit_condition, IndVarInfo};
use crate::analysis::loops::analyze_loops;
use crate::analysis::parallel::LoopParallelism;
use crate::analysis::AnalysisManager;
use crate::config::Config;
use crate::ir::{FnAttrs, Module, Opcode, Ty, Value};

use super::loop_extract::{outline_loop, store_live_ins};
use super::FunctionPass;

pub const RUNTIME_ENTRY: &str = "__sy_parallel_for";

pub struct LoopParallel;

impl FunctionPass for LoopParallel {
    fn name(&self) -> &'static str {
        "loop-parallel"
    }

    fn run(&self, m: &mut Module, func: Value, am: &mut AnalysisManager, _cfg: &Config) -> usize {
        if m.fn_attrs(func).contains(FnAttrs::PARALLEL_BODY) {
            return 0;
        }
        if super::loop_simplify::simplify_loops(m, func) > 0 {
            am.cfg_changed(func);
        }
        let Some(pi) = am.parallel_info(m, func) else { return 0 };
        let n = parallelize_one(m, func, &pi.per_loop);
        if n > 0 {
            am.cfg_changed(func);
            am.call_changed();
        }
        n
    }
}

fn runtime_entry(m: &mut Module) -> Value {
    if let Some(f) = m.find_function(RUNTIME_ENTRY) {
        return f;
    }
    let body_ty = m.types.function(Ty::VOID, vec![Ty::I32, Ty::I32]);
    let entry_ty = m.types.function(Ty::VOID, vec![Ty::I32, Ty::I32, body_ty]);
    let f = m.add_function(RUNTIME_ENTRY, entry_ty);
    m.set_fn_attrs(f, FnAttrs::BUILTIN);
    f
}

fn parallelize_one(m: &mut Module, func: Value, parallelism: &[LoopParallelism]) -> usize {
    let (g, _dom, loops) = analyze_loops(m, func);
    let ivs = IndVarInfo::compute(m, &g, &loops);

    // Outermost first: parallelizing an outer loop swallows its children.
    let mut order: Vec<usize> = loops.innermost_first();
    order.reverse();
    for li in order {
        let l = &loops.loops[li];
        let pl = &parallelism[li];
        if !pl.parallelizable {
            continue;
        }
        let Some(exit) = exit_condition(m, &g, l, &ivs.per_loop[li]) else { continue };
        let Some(out) = outline_loop(m, func, &g, l, pl, &exit) else { continue };

        let preheader = g.block(l.preheader(&g).expect("simplified"));
        let header = g.block(l.header);
        let exit_target = g.block(l.exit_targets(&g)[0]);
        let exit_block = g.block(l.exits[0]);

        store_live_ins(m, preheader, &out);

        // call @__sy_parallel_for(start, bound, body)
        let entry_fn = runtime_entry(m);
        let term = m.terminator(preheader).expect("terminated");
        let call = m.create_inst(
            Opcode::Call,
            Ty::VOID,
            &[entry_fn, exit.iv.start, exit.bound, out.body_fn],
        );
        m.insert_before(term, call);

        // Fold reductions back: final = init + accumulated.
        for &(phi, init, slot) in &out.reductions {
            let ty = m.ty(phi);
            let loaded = m.create_inst(Opcode::Load, ty, &[slot]);
            m.insert_before(term, loaded);
            let op = if m.types.is_float(ty) { Opcode::FAdd } else { Opcode::Add };
            let total = m.create_inst(op, ty, &[init, loaded]);
            m.insert_before(term, total);
            m.replace_all_uses_with(phi, total);
        }

        // Skip the loop entirely.
        let n = m.operands(term).len();
        for i in 0..n {
            if m.operands(term)[i] == header {
                m.set_operand(term, i, exit_target);
            }
        }
        m.rehome_phi_preds(exit_target, exit_block, preheader);
        for &bi in &l.blocks {
            m.remove_block(g.block(bi));
        }

        log::debug!("loop-parallel: converted a loop in @{}", m.func_name(func));
        return 1;
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisManager;
    use crate::ir::parse::parse_module;
    use crate::ir::verify::verify;
    use crate::passes::FunctionPass;

    fn run(m: &mut Module, name: &str) -> usize {
        let f = m.find_function(name).unwrap();
        let mut am = AnalysisManager::new();
        LoopParallel.run(m, f, &mut am, &Config::default())
    }

    #[test]
    fn elementwise_loop_becomes_runtime_call() {
        let mut m = parse_module(
            r#"
@a = global [100 x i32] zeroinitializer

define void @f() {
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
  %v2 = mul i32 %v, 3
  store i32 %v2, i32* %p
  %next = add i32 %i, 1
  br label %head
exit:
  ret void
}
"#,
        )
        .unwrap();
        assert_eq!(run(&mut m, "f"), 1);
        verify(&m).unwrap();

        let f = m.find_function("f").unwrap();
        // No loop remains in the caller.
        let (_, _, loops) = analyze_loops(&m, f);
        assert!(loops.is_empty());
        // The runtime entry is called with [0, 100) and the outlined body.
        let rt = m.find_function(RUNTIME_ENTRY).unwrap();
        let call = m
            .all_insts(f)
            .into_iter()
            .find(|&i| m.opcode(i) == Some(Opcode::Call))
            .unwrap();
        assert_eq!(m.operands(call)[0], rt);
        assert_eq!(m.const_kind(m.operands(call)[1]).unwrap().as_int(), Some(0));
        assert_eq!(m.const_kind(m.operands(call)[2]).unwrap().as_int(), Some(100));
        let body = m.operands(call)[3];
        assert!(m.fn_attrs(body).contains(FnAttrs::PARALLEL_BODY));
        // The body writes through the captured pointer.
        assert!(m
            .all_insts(body)
            .iter()
            .any(|&i| m.opcode(i) == Some(Opcode::Store)));
    }

    #[test]
    fn sum_reduction_folds_back_through_atomicadd() {
        let mut m = parse_module(
            r#"
@a = global [100 x i32] zeroinitializer

define i32 @f() {
entry:
  %base = bitcast [100 x i32]* @a to i32*
  br label %head
head:
  %i = phi i32 [ 0, %entry ], [ %next, %body ]
  %s = phi i32 [ 7, %entry ], [ %s1, %body ]
  %c = icmp slt i32 %i, 100
  br i1 %c, label %body, label %exit
body:
  %p = getelementptr i32, i32* %base, i32 %i
  %v = load i32, i32* %p
  %s1 = add i32 %s, %v
  %next = add i32 %i, 1
  br label %head
exit:
  ret i32 %s
}
"#,
        )
        .unwrap();
        assert_eq!(run(&mut m, "f"), 1);
        verify(&m).unwrap();

        let f = m.find_function("f").unwrap();
        // The return value is init + accumulator.
        let exit = *m.func_blocks(f).last().unwrap();
        let ret = m.terminator(exit).unwrap();
        let total = m.operands(ret)[0];
        assert_eq!(m.opcode(total), Some(Opcode::Add));
        let seven = m.const_int(7);
        assert_eq!(m.operands(total)[0], seven);
        // The outlined body accumulates atomically.
        let body = m
            .functions
            .iter()
            .copied()
            .find(|&x| m.fn_attrs(x).contains(FnAttrs::PARALLEL_BODY))
            .unwrap();
        assert!(m
            .all_insts(body)
            .iter()
            .any(|&i| m.opcode(i) == Some(Opcode::AtomicAdd)));
    }

    #[test]
    fn dependent_loop_is_not_parallelized() {
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
        assert_eq!(run(&mut m, "f"), 0);
    }
}
