//! CFG derivation: dense block numbering and CSR adjacency.
//!
//! Edges are read off block terminators, never cached on blocks, so the
//! adjacency always agrees with the instruction graph it was built from.
//!
//! The CFG is stored as a flat CSR (Compressed Sparse Row) adjacency list
//! (`FlatAdj`) instead of `Vec<Vec<usize>>`: two heap allocations per
//! direction and cache-friendly iteration, which matters because passes
//! rebuild the CFG per function per pipeline iteration.

use rustc_hash::FxHashMap;

use crate::ir::{Module, Value};

/// A flat adjacency list in CSR format: `data[offsets[i]..offsets[i+1]]`
/// holds the neighbors of node `i`.
#[derive(Debug, Clone)]
pub struct FlatAdj {
    offsets: Vec<u32>,
    data: Vec<u32>,
}

impl FlatAdj {
    pub fn from_vecs(vecs: Vec<Vec<u32>>) -> Self {
        let total: usize = vecs.iter().map(|v| v.len()).sum();
        let mut offsets = Vec::with_capacity(vecs.len() + 1);
        let mut data = Vec::with_capacity(total);
        let mut offset = 0u32;
        for v in &vecs {
            offsets.push(offset);
            data.extend_from_slice(v);
            offset += v.len() as u32;
        }
        offsets.push(offset);
        FlatAdj { offsets, data }
    }

    #[inline]
    pub fn row(&self, i: usize) -> &[u32] {
        let start = self.offsets[i] as usize;
        let end = self.offsets[i + 1] as usize;
        &self.data[start..end]
    }

    #[inline]
    pub fn len(&self, i: usize) -> usize {
        (self.offsets[i + 1] - self.offsets[i]) as usize
    }

    pub fn num_nodes(&self) -> usize {
        self.offsets.len() - 1
    }
}

/// Dense-numbered CFG of one function. Block index 0 is the entry.
pub struct Cfg {
    /// Blocks in layout order; the dense index of `blocks[i]` is `i`.
    pub blocks: Vec<Value>,
    pub index_of: FxHashMap<Value, usize>,
    pub preds: FlatAdj,
    pub succs: FlatAdj,
}

impl Cfg {
    pub fn build(m: &Module, func: Value) -> Cfg {
        let blocks: Vec<Value> = m.func_blocks(func).to_vec();
        let n = blocks.len();
        let index_of: FxHashMap<Value, usize> =
            blocks.iter().enumerate().map(|(i, &b)| (b, i)).collect();

        let mut preds: Vec<Vec<u32>> = vec![Vec::new(); n];
        let mut succs: Vec<Vec<u32>> = vec![Vec::new(); n];
        for (i, &b) in blocks.iter().enumerate() {
            for s in m.succ_blocks(b) {
                let Some(&t) = index_of.get(&s) else { continue };
                let t32 = t as u32;
                if !succs[i].contains(&t32) {
                    succs[i].push(t32);
                }
                preds[t].push(i as u32);
            }
        }

        Cfg { blocks, index_of, preds: FlatAdj::from_vecs(preds), succs: FlatAdj::from_vecs(succs) }
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub fn block(&self, i: usize) -> Value {
        self.blocks[i]
    }

    #[inline]
    pub fn index(&self, b: Value) -> usize {
        self.index_of[&b]
    }

    /// Reverse postorder from the entry. Unreachable blocks are absent.
    pub fn reverse_postorder(&self) -> Vec<usize> {
        reverse_postorder(self.num_blocks(), &self.succs, 0)
    }
}

/// Iterative post-order DFS, reversed. `entry` is the root; nodes not
/// reachable from it do not appear.
pub fn reverse_postorder(num_nodes: usize, succs: &FlatAdj, entry: usize) -> Vec<usize> {
    if num_nodes == 0 {
        return Vec::new();
    }
    let mut visited = vec![false; num_nodes];
    let mut postorder = Vec::with_capacity(num_nodes);
    // (node, next successor index to visit)
    let mut stack: Vec<(usize, usize)> = vec![(entry, 0)];
    visited[entry] = true;
    while let Some(&mut (node, ref mut next)) = stack.last_mut() {
        let row = succs.row(node);
        if *next < row.len() {
            let s = row[*next] as usize;
            *next += 1;
            if !visited[s] {
                visited[s] = true;
                stack.push((s, 0));
            }
        } else {
            postorder.push(node);
            stack.pop();
        }
    }
    postorder.reverse();
    postorder
}
