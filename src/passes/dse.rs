//! Local dead-store elimination.
//!
//! Within one block, a store is dead when the same pointer value is stored
//! again before anything could observe the first write. Aliasing is by
//! pointer identity only (GVN has already unified equal addresses), so any
//! intervening load, call, memset, or atomic conservatively protects every
//! pending store.

use rustc_hash::FxHashMap;

use crate::analysis::AnalysisManager;
use crate::config::Config;
use crate::ir::{Module, Opcode, Value};

use super::BlockPass;

pub struct Dse;

impl BlockPass for Dse {
    fn name(&self) -> &'static str {
        "dse"
    }

    fn run(&self, m: &mut Module, block: Value, _am: &mut AnalysisManager, _cfg: &Config) -> usize {
        run_block(m, block)
    }
}

pub fn run_block(m: &mut Module, block: Value) -> usize {
    // pointer -> the store instruction whose value nothing has read yet
    let mut pending: FxHashMap<Value, Value> = FxHashMap::default();
    let mut dead: Vec<Value> = Vec::new();

    for &inst in m.block_insts(block) {
        match m.opcode(inst) {
            Some(Opcode::Store) => {
                let ptr = m.operands(inst)[1];
                if let Some(prev) = pending.insert(ptr, inst) {
                    dead.push(prev);
                }
            }
            Some(Opcode::Load) | Some(Opcode::Call) | Some(Opcode::Memset)
            | Some(Opcode::AtomicAdd) => {
                pending.clear();
            }
            _ => {}
        }
    }

    let count = dead.len();
    for s in dead {
        m.erase_inst(s);
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse::parse_module;
    use crate::ir::verify::verify;

    #[test]
    fn overwritten_store_dies() {
        let mut m = parse_module(
            r#"
@g = global i32 0

define void @f(i32 %a) {
entry:
  store i32 1, i32* @g
  store i32 %a, i32* @g
  ret void
}
"#,
        )
        .unwrap();
        let f = m.find_function("f").unwrap();
        let b = m.entry_block(f).unwrap();
        assert_eq!(run_block(&mut m, b), 1);
        verify(&m).unwrap();
        assert_eq!(m.block_insts(b).len(), 2);
    }

    #[test]
    fn intervening_load_protects_the_store() {
        let mut m = parse_module(
            r#"
@g = global i32 0

define i32 @f(i32 %a) {
entry:
  store i32 1, i32* @g
  %v = load i32, i32* @g
  store i32 %a, i32* @g
  ret i32 %v
}
"#,
        )
        .unwrap();
        let f = m.find_function("f").unwrap();
        let b = m.entry_block(f).unwrap();
        assert_eq!(run_block(&mut m, b), 0);
    }

    #[test]
    fn different_pointers_do_not_kill_each_other() {
        let mut m = parse_module(
            r#"
@g = global i32 0
@h = global i32 0

define void @f() {
entry:
  store i32 1, i32* @g
  store i32 2, i32* @h
  ret void
}
"#,
        )
        .unwrap();
        let f = m.find_function("f").unwrap();
        let b = m.entry_block(f).unwrap();
        assert_eq!(run_block(&mut m, b), 0);
    }
}
