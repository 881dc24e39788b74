//! Block ordering: lay the function's blocks out in reverse postorder so
//! fallthrough-friendly order reaches the lowering stage. Unreachable
//! blocks (if any survived simplifycfg) keep their relative order at the
//! end.

use crate::analysis::cfg::Cfg;
use crate::analysis::AnalysisManager;
use crate::config::Config;
use crate::ir::{Module, Value};

use super::FunctionPass;

pub struct BlockSort;

impl FunctionPass for BlockSort {
    fn name(&self) -> &'static str {
        "block-sort"
    }

    fn run(&self, m: &mut Module, func: Value, _am: &mut AnalysisManager, _cfg: &Config) -> usize {
        sort_function(m, func)
    }
}

pub fn sort_function(m: &mut Module, func: Value) -> usize {
    let cfg = Cfg::build(m, func);
    let rpo = cfg.reverse_postorder();
    let mut order: Vec<Value> = rpo.iter().map(|&i| cfg.block(i)).collect();
    for &b in &cfg.blocks {
        if !order.contains(&b) {
            order.push(b);
        }
    }
    let old = m.func_blocks(func).to_vec();
    if old == order {
        return 0;
    }
    let moved = old.iter().zip(&order).filter(|(a, b)| a != b).count();
    m.func_data_mut(func).blocks = order;
    moved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse::parse_module;
    use crate::ir::verify::verify;

    #[test]
    fn blocks_settle_into_rpo() {
        let mut m = parse_module(
            r#"
define i32 @f(i1 %c) {
entry:
  br i1 %c, label %late, label %early
early:
  br label %late
late:
  ret i32 0
}
"#,
        )
        .unwrap();
        let f = m.find_function("f").unwrap();
        sort_function(&mut m, f);
        verify(&m).unwrap();
        // Idempotent, entry stays first.
        assert_eq!(sort_function(&mut m, f), 0);
        assert_eq!(m.func_blocks(f)[0], m.entry_block(f).unwrap());
    }
}
