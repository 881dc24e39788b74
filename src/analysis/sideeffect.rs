//! Per-function side-effect summary.
//!
//! A local scan records which functions read or write memory that is
//! visible outside them (globals, pointer arguments) and which call into
//! the runtime; a fixpoint over the call graph then propagates callee
//! effects to callers. Loads and stores whose root is a local alloca are
//! invisible to callers and do not count.

use bitflags::bitflags;

use crate::ir::{FnAttrs, Module, Opcode, Value, ValueKind};

use super::callgraph::CallGraph;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Effects: u8 {
        const READS_MEMORY = 1 << 0;
        const WRITES_MEMORY = 1 << 1;
        /// Calls a runtime/library function with unknown behavior (I/O).
        const CALLS_EXTERN = 1 << 2;
    }
}

pub struct SideEffects {
    /// Indexed like `CallGraph::nodes`.
    pub effects: Vec<Effects>,
    graph_nodes: Vec<Value>,
}

impl SideEffects {
    pub fn compute(m: &Module, cg: &CallGraph) -> SideEffects {
        let n = cg.nodes.len();
        let mut effects = vec![Effects::empty(); n];

        // Local scan.
        for (i, &f) in cg.nodes.iter().enumerate() {
            if m.is_declaration(f) {
                // Runtime declarations do I/O; the parallel-for entry also
                // runs its body argument, covered at call sites.
                effects[i] = Effects::all();
                continue;
            }
            for inst in m.all_insts(f) {
                match m.opcode(inst) {
                    Some(Opcode::Load) => {
                        if escapes(m, m.operands(inst)[0]) {
                            effects[i] |= Effects::READS_MEMORY;
                        }
                    }
                    Some(Opcode::Store) => {
                        if escapes(m, m.operands(inst)[1]) {
                            effects[i] |= Effects::WRITES_MEMORY;
                        }
                    }
                    Some(Opcode::Memset) | Some(Opcode::AtomicAdd) => {
                        if escapes(m, m.operands(inst)[0]) {
                            effects[i] |= Effects::READS_MEMORY | Effects::WRITES_MEMORY;
                        }
                    }
                    _ => {}
                }
            }
        }

        // Propagate callee effects up the call graph to fixpoint.
        let mut changed = true;
        while changed {
            changed = false;
            for i in 0..n {
                let mut acc = effects[i];
                for &j in &cg.callees[i] {
                    acc |= effects[j];
                }
                if acc != effects[i] {
                    effects[i] = acc;
                    changed = true;
                }
            }
        }

        SideEffects { effects, graph_nodes: cg.nodes.clone() }
    }

    fn index(&self, f: Value) -> Option<usize> {
        self.graph_nodes.iter().position(|&x| x == f)
    }

    pub fn of(&self, f: Value) -> Effects {
        self.index(f).map_or(Effects::all(), |i| self.effects[i])
    }

    /// Neither writes memory nor performs I/O; calls may be erased when the
    /// result is unused.
    pub fn no_side_effect(&self, f: Value) -> bool {
        !self.of(f).intersects(Effects::WRITES_MEMORY | Effects::CALLS_EXTERN)
    }

    /// A pure function of its arguments: two calls with the same arguments
    /// yield the same result.
    pub fn stateless(&self, f: Value) -> bool {
        self.of(f).is_empty()
    }
}

/// Is this pointer's root visible outside the function (global or pointer
/// argument)? Alloca roots are not.
fn escapes(m: &Module, mut ptr: Value) -> bool {
    loop {
        match &m.value(ptr).kind {
            ValueKind::Global(_) | ValueKind::Argument { .. } => return true,
            ValueKind::Inst(i) => match i.op {
                Opcode::Alloca => return false,
                Opcode::GetElementPtr | Opcode::Bitcast => ptr = m.operands(ptr)[0],
                // Loads of pointers, phis of pointers: unknown provenance.
                _ => return true,
            },
            _ => return true,
        }
    }
}

/// Is this function eligible to be treated as a leaf intrinsic (a runtime
/// declaration)?
pub fn is_runtime_decl(m: &Module, f: Value) -> bool {
    m.is_declaration(f) && m.fn_attrs(f).contains(FnAttrs::BUILTIN)
}
