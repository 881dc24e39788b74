//! Global value numbering over the dominator tree.
//!
//! Instructions are keyed by `(opcode, operands)` with commutative operand
//! pairs canonicalized; a dominator-tree walk keeps a scoped table of
//! available expressions, so a replacement is always dominated by the
//! instruction it reuses. Side-effect-free opcodes only; loads are
//! numbered as well but the table drops all load entries at stores, calls,
//! and memsets (no aliasing precision at this level — the dedicated `dle`
//! pass does the finer-grained local version).

use rustc_hash::FxHashMap;

use crate::analysis::cfg::Cfg;
use crate::analysis::dom::DomTree;
use crate::analysis::AnalysisManager;
use crate::config::Config;
use crate::ir::{Module, Opcode, Value};

use super::FunctionPass;

pub struct Gvn;

impl FunctionPass for Gvn {
    fn name(&self) -> &'static str {
        "gvn"
    }

    fn run(&self, m: &mut Module, func: Value, _am: &mut AnalysisManager, _cfg: &Config) -> usize {
        run_function(m, func)
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
enum ExprKey {
    Pure(Opcode, Vec<Value>),
    Load(Value),
}

pub fn run_function(m: &mut Module, func: Value) -> usize {
    let cfg = Cfg::build(m, func);
    let dom = DomTree::build(&cfg);

    // Scoped hash table: a stack of maps, one frame per dominator-tree
    // level currently on the walk path.
    let mut scopes: Vec<FxHashMap<ExprKey, Value>> = Vec::new();
    let mut changes = 0;

    enum Step {
        Visit(usize),
        Leave,
    }
    let mut agenda = vec![Step::Visit(0)];
    while let Some(step) = agenda.pop() {
        match step {
            Step::Leave => {
                scopes.pop();
            }
            Step::Visit(b) => {
                scopes.push(FxHashMap::default());
                changes += number_block(m, cfg.block(b), &mut scopes);
                agenda.push(Step::Leave);
                for &child in dom.children[b].iter().rev() {
                    agenda.push(Step::Visit(child));
                }
            }
        }
    }
    if changes > 0 {
        log::debug!("gvn: {changes} replacements in @{}", m.func_name(func));
    }
    changes
}

fn lookup(scopes: &[FxHashMap<ExprKey, Value>], key: &ExprKey) -> Option<Value> {
    scopes.iter().rev().find_map(|s| s.get(key).copied())
}

fn number_block(
    m: &mut Module,
    block: Value,
    scopes: &mut Vec<FxHashMap<ExprKey, Value>>,
) -> usize {
    let mut changes = 0;
    let insts: Vec<Value> = m.block_insts(block).to_vec();
    for inst in insts {
        let Some(op) = m.opcode(inst) else { continue };

        // Memory writes and calls clobber the load entries in every open
        // scope.
        if op.writes_memory() || op == Opcode::Call {
            for scope in scopes.iter_mut() {
                scope.retain(|k, _| matches!(k, ExprKey::Pure(..)));
            }
            continue;
        }

        let key = match op {
            Opcode::Load => ExprKey::Load(m.operands(inst)[0]),
            _ if op.is_binary() || op.is_cmp() || op.is_cast() => {
                let mut ops: Vec<Value> = m.operands(inst).to_vec();
                let mut op = op;
                if op.is_commutative() && ops[1] < ops[0] {
                    ops.swap(0, 1);
                } else if let Opcode::ICmp(p) = op {
                    // Order-insensitive key for compares: swap operands and
                    // the predicate together.
                    if ops[1] < ops[0] {
                        ops.swap(0, 1);
                        op = Opcode::ICmp(p.swapped());
                    }
                }
                ExprKey::Pure(op, ops)
            }
            Opcode::GetElementPtr => {
                ExprKey::Pure(Opcode::GetElementPtr, m.operands(inst).to_vec())
            }
            _ => continue,
        };

        match lookup(scopes, &key) {
            Some(prev) if m.ty(prev) == m.ty(inst) => {
                m.replace_all_uses_with(inst, prev);
                m.erase_inst(inst);
                changes += 1;
            }
            _ => {
                scopes.last_mut().expect("open scope").insert(key, inst);
            }
        }
    }
    changes
}
