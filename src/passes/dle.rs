//! Local redundant-load elimination.
//!
//! Within one block: a load observes the value of the last store to the
//! same pointer (store-to-load forwarding), and a repeated load of an
//! unclobbered pointer reuses the earlier result. Pointer identity is the
//! only aliasing fact used: a store to some other pointer conservatively
//! clobbers every tracked entry but its own.

use rustc_hash::FxHashMap;

use crate::analysis::AnalysisManager;
use crate::config::Config;
use crate::ir::{Module, Opcode, Value};

use super::BlockPass;

pub struct Dle;

impl BlockPass for Dle {
    fn name(&self) -> &'static str {
        "dle"
    }

    fn run(&self, m: &mut Module, block: Value, _am: &mut AnalysisManager, _cfg: &Config) -> usize {
        run_block(m, block)
    }
}

pub fn run_block(m: &mut Module, block: Value) -> usize {
    // pointer -> last known value behind it in this block
    let mut known: FxHashMap<Value, Value> = FxHashMap::default();
    let mut changes = 0;

    for &inst in &m.block_insts(block).to_vec() {
        match m.opcode(inst) {
            Some(Opcode::Load) => {
                let ptr = m.operands(inst)[0];
                if let Some(&v) = known.get(&ptr) {
                    m.replace_all_uses_with(inst, v);
                    m.erase_inst(inst);
                    changes += 1;
                } else {
                    known.insert(ptr, inst);
                }
            }
            Some(Opcode::Store) => {
                let val = m.operands(inst)[0];
                let ptr = m.operands(inst)[1];
                known.retain(|&p, _| p == ptr);
                known.insert(ptr, val);
            }
            Some(Opcode::Call) | Some(Opcode::Memset) | Some(Opcode::AtomicAdd) => {
                known.clear();
            }
            _ => {}
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse::parse_module;
    use crate::ir::verify::verify;

    #[test]
    fn store_forwards_to_load() {
        let mut m = parse_module(
            r#"
@g = global i32 0

define i32 @f(i32 %a) {
entry:
  store i32 %a, i32* @g
  %v = load i32, i32* @g
  ret i32 %v
}
"#,
        )
        .unwrap();
        let f = m.find_function("f").unwrap();
        let b = m.entry_block(f).unwrap();
        assert_eq!(run_block(&mut m, b), 1);
        verify(&m).unwrap();
        // The function now returns %a directly.
        let term = m.terminator(b).unwrap();
        let arg = m.func_args(f)[0];
        assert_eq!(m.operands(term)[0], arg);
    }

    #[test]
    fn repeated_loads_reuse_the_first() {
        let mut m = parse_module(
            r#"
@g = global i32 0

define i32 @f() {
entry:
  %a = load i32, i32* @g
  %b = load i32, i32* @g
  %s = add i32 %a, %b
  ret i32 %s
}
"#,
        )
        .unwrap();
        let f = m.find_function("f").unwrap();
        let b = m.entry_block(f).unwrap();
        assert_eq!(run_block(&mut m, b), 1);
        verify(&m).unwrap();
    }

    #[test]
    fn store_to_other_pointer_clobbers() {
        let mut m = parse_module(
            r#"
@g = global i32 0

define i32 @f(i32* %p) {
entry:
  %a = load i32, i32* @g
  store i32 0, i32* %p
  %b = load i32, i32* @g
  %s = add i32 %a, %b
  ret i32 %s
}
"#,
        )
        .unwrap();
        let f = m.find_function("f").unwrap();
        let b = m.entry_block(f).unwrap();
        assert_eq!(run_block(&mut m, b), 0);
    }

    #[test]
    fn call_clobbers_everything() {
        let mut m = parse_module(
            r#"
@g = global i32 0

declare i32 @getint() builtin

define i32 @f() {
entry:
  %a = load i32, i32* @g
  %x = call i32 @getint()
  %b = load i32, i32* @g
  %s = add i32 %b, %x
  %t = add i32 %s, %a
  ret i32 %t
}
"#,
        )
        .unwrap();
        let f = m.find_function("f").unwrap();
        let b = m.entry_block(f).unwrap();
        assert_eq!(run_block(&mut m, b), 0);
    }
}
