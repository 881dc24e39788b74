//! Call graph: static call edges, caller lists, and Tarjan SCCs for
//! recursion detection.

use rustc_hash::FxHashMap;

use crate::ir::{Module, Opcode, Value};

pub struct CallGraph {
    /// Functions in module order (declarations included).
    pub nodes: Vec<Value>,
    index_of: FxHashMap<Value, usize>,
    /// Callee indices per node, deduplicated, in first-call order.
    pub callees: Vec<Vec<usize>>,
    /// Caller indices per node.
    pub callers: Vec<Vec<usize>>,
    /// SCC id per node; ids number the components in reverse topological
    /// order of the condensation.
    pub scc_of: Vec<usize>,
    pub num_sccs: usize,
    scc_sizes: Vec<usize>,
    self_edge: Vec<bool>,
}

impl CallGraph {
    pub fn build(m: &Module) -> CallGraph {
        let nodes: Vec<Value> = m.functions.clone();
        let index_of: FxHashMap<Value, usize> =
            nodes.iter().enumerate().map(|(i, &f)| (f, i)).collect();
        let n = nodes.len();

        let mut callees: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut callers: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut self_edge = vec![false; n];
        for (i, &f) in nodes.iter().enumerate() {
            for inst in m.all_insts(f) {
                if m.opcode(inst) != Some(Opcode::Call) {
                    continue;
                }
                let callee = m.operands(inst)[0];
                let Some(&j) = index_of.get(&callee) else { continue };
                if i == j {
                    self_edge[i] = true;
                }
                if !callees[i].contains(&j) {
                    callees[i].push(j);
                    callers[j].push(i);
                }
            }
        }

        let (scc_of, num_sccs) = tarjan(n, &callees);
        let mut scc_sizes = vec![0usize; num_sccs];
        for &s in &scc_of {
            scc_sizes[s] += 1;
        }

        CallGraph { nodes, index_of, callees, callers, scc_of, num_sccs, scc_sizes, self_edge }
    }

    pub fn index(&self, f: Value) -> Option<usize> {
        self.index_of.get(&f).copied()
    }

    /// Direct or mutual recursion.
    pub fn is_recursive(&self, f: Value) -> bool {
        let Some(i) = self.index(f) else { return false };
        self.self_edge[i] || self.scc_sizes[self.scc_of[i]] > 1
    }

    /// Call sites of `f` across the module (the calling instructions).
    pub fn call_sites_of(&self, m: &Module, f: Value) -> Vec<Value> {
        let mut sites: Vec<Value> = m
            .uses(f)
            .iter()
            .filter(|u| u.index == 0 && m.opcode(u.user) == Some(Opcode::Call))
            .map(|u| u.user)
            .collect();
        sites.sort();
        sites
    }
}

/// Iterative Tarjan SCC. Returns (component id per node, component count);
/// ids come out in reverse topological order, so processing components in
/// increasing id order visits callees before callers.
fn tarjan(n: usize, succs: &[Vec<usize>]) -> (Vec<usize>, usize) {
    const NONE: usize = usize::MAX;
    let mut index = vec![NONE; n];
    let mut lowlink = vec![0usize; n];
    let mut on_stack = vec![false; n];
    let mut stack: Vec<usize> = Vec::new();
    let mut scc_of = vec![0usize; n];
    let mut next_index = 0usize;
    let mut next_scc = 0usize;

    // (node, next child position)
    let mut call_stack: Vec<(usize, usize)> = Vec::new();
    for root in 0..n {
        if index[root] != NONE {
            continue;
        }
        call_stack.push((root, 0));
        index[root] = next_index;
        lowlink[root] = next_index;
        next_index += 1;
        stack.push(root);
        on_stack[root] = true;

        while let Some(&mut (v, ref mut child)) = call_stack.last_mut() {
            if *child < succs[v].len() {
                let w = succs[v][*child];
                *child += 1;
                if index[w] == NONE {
                    index[w] = next_index;
                    lowlink[w] = next_index;
                    next_index += 1;
                    stack.push(w);
                    on_stack[w] = true;
                    call_stack.push((w, 0));
                } else if on_stack[w] {
                    lowlink[v] = lowlink[v].min(index[w]);
                }
            } else {
                if lowlink[v] == index[v] {
                    loop {
                        let w = stack.pop().unwrap();
                        on_stack[w] = false;
                        scc_of[w] = next_scc;
                        if w == v {
                            break;
                        }
                    }
                    next_scc += 1;
                }
                call_stack.pop();
                if let Some(&(parent, _)) = call_stack.last() {
                    lowlink[parent] = lowlink[parent].min(lowlink[v]);
                }
            }
        }
    }
    (scc_of, next_scc)
}
