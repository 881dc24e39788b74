//! Simple constant propagation.
//!
//! A single forward sweep in reverse postorder that folds pure
//! instructions whose operands are already constants. Cheaper than `sccp`
//! (no lattice, no executability) and than `constfold`'s worklist; used
//! early in the pipeline to shrink the work the heavier passes see.

use crate::analysis::cfg::Cfg;
use crate::analysis::AnalysisManager;
use crate::config::Config;
use crate::ir::{Module, Opcode, Value};

use super::constfold::{fold_binary, fold_cmp};
use super::FunctionPass;

pub struct Scp;

impl FunctionPass for Scp {
    fn name(&self) -> &'static str {
        "scp"
    }

    fn run(&self, m: &mut Module, func: Value, _am: &mut AnalysisManager, _cfg: &Config) -> usize {
        propagate(m, func)
    }
}

pub fn propagate(m: &mut Module, func: Value) -> usize {
    let cfg = Cfg::build(m, func);
    let order = cfg.reverse_postorder();
    let mut changes = 0;
    for b in order {
        let insts: Vec<Value> = m.block_insts(cfg.block(b)).to_vec();
        for inst in insts {
            let Some(op) = m.opcode(inst) else { continue };
            let ops: Vec<Value> = m.operands(inst).to_vec();
            let folded = if op.is_binary() {
                match (m.const_kind(ops[0]), m.const_kind(ops[1])) {
                    (Some(a), Some(b)) => {
                        fold_binary(op, a, b).map(|c| m.const_of(m.ty(inst), c))
                    }
                    _ => None,
                }
            } else if let Opcode::ICmp(p) | Opcode::FCmp(p) = op {
                match (m.const_kind(ops[0]), m.const_kind(ops[1])) {
                    (Some(a), Some(b)) => fold_cmp(p, a, b).map(|r| m.const_bool(r)),
                    _ => None,
                }
            } else {
                None
            };
            if let Some(c) = folded {
                m.replace_all_uses_with(inst, c);
                m.erase_inst(inst);
                changes += 1;
            }
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse::parse_module;

    #[test]
    fn forward_sweep_folds_in_one_pass() {
        let mut m = parse_module(
            r#"
define i32 @f() {
entry:
  %a = add i32 1, 2
  %b = mul i32 %a, %a
  %c = icmp slt i32 %b, 10
  ret i32 %b
}
"#,
        )
        .unwrap();
        let f = m.find_function("f").unwrap();
        // RPO order folds a, then b, then c in the same sweep.
        assert_eq!(propagate(&mut m, f), 3);
        let term = m.terminator(m.entry_block(f).unwrap()).unwrap();
        assert_eq!(m.const_kind(m.operands(term)[0]).unwrap().as_int(), Some(9));
    }
}
