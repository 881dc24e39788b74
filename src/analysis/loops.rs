//! Natural-loop identification and nesting.
//!
//! A back edge is an edge `tail -> header` where the header dominates the
//! tail; the natural loop of a header is the union, over its back edges, of
//! the blocks that reach a tail without passing through the header, plus
//! the header itself. Loops sharing a header are merged (a loop with
//! several `continue` paths has several back edges but is one loop).

use rustc_hash::FxHashSet;

use crate::ir::{Module, Value};

use super::cfg::Cfg;
use super::dom::DomTree;

#[derive(Debug, Clone)]
pub struct Loop {
    /// Dense block index of the header (the back-edge target).
    pub header: usize,
    /// All member blocks, sorted, header included.
    pub blocks: Vec<usize>,
    pub block_set: FxHashSet<usize>,
    /// In-loop blocks with an edge back to the header.
    pub latches: Vec<usize>,
    /// In-loop blocks with at least one out-of-loop successor.
    pub exits: Vec<usize>,
    /// Index of the innermost enclosing loop, if any.
    pub parent: Option<usize>,
    /// Indices of directly nested loops.
    pub subloops: Vec<usize>,
    /// 1 for outermost loops.
    pub depth: u32,
}

impl Loop {
    pub fn contains(&self, block: usize) -> bool {
        self.block_set.contains(&block)
    }

    /// The unique out-of-loop predecessor of the header, provided it has a
    /// single successor. `None` when the loop is not in simplified form.
    pub fn preheader(&self, cfg: &Cfg) -> Option<usize> {
        let mut outside = cfg
            .preds
            .row(self.header)
            .iter()
            .map(|&p| p as usize)
            .filter(|p| !self.contains(*p));
        let candidate = outside.next()?;
        if outside.next().is_some() {
            return None;
        }
        if cfg.succs.len(candidate) != 1 {
            return None;
        }
        Some(candidate)
    }

    /// The unique latch, when there is exactly one.
    pub fn latch(&self) -> Option<usize> {
        if self.latches.len() == 1 {
            Some(self.latches[0])
        } else {
            None
        }
    }

    /// Out-of-loop successor blocks of the exits, deduplicated and sorted.
    pub fn exit_targets(&self, cfg: &Cfg) -> Vec<usize> {
        let mut targets = Vec::new();
        for &e in &self.exits {
            for &s in cfg.succs.row(e) {
                let s = s as usize;
                if !self.contains(s) && !targets.contains(&s) {
                    targets.push(s);
                }
            }
        }
        targets.sort_unstable();
        targets
    }

    /// Simplified form: unique preheader, unique latch, and dedicated exit
    /// targets (every predecessor of each exit target lies in the loop).
    pub fn is_simplified(&self, cfg: &Cfg) -> bool {
        if self.preheader(cfg).is_none() || self.latch().is_none() {
            return false;
        }
        for t in self.exit_targets(cfg) {
            if cfg.preds.row(t).iter().any(|&p| !self.contains(p as usize)) {
                return false;
            }
        }
        true
    }
}

pub struct LoopInfo {
    /// All loops; inner loops appear after the loops that contain them.
    pub loops: Vec<Loop>,
    /// Innermost loop index per dense block index.
    pub loop_of: Vec<Option<usize>>,
}

impl LoopInfo {
    pub fn compute(cfg: &Cfg, dom: &DomTree) -> LoopInfo {
        let n = cfg.num_blocks();

        // Back edges, grouped by header.
        let mut headers: Vec<usize> = Vec::new();
        let mut tails_of: Vec<Vec<usize>> = Vec::new();
        for b in 0..n {
            for &s in cfg.succs.row(b) {
                let h = s as usize;
                if dom.dominates(h, b) {
                    match headers.iter().position(|&x| x == h) {
                        Some(i) => tails_of[i].push(b),
                        None => {
                            headers.push(h);
                            tails_of.push(vec![b]);
                        }
                    }
                }
            }
        }

        // Body: blocks reaching a tail backwards without crossing the header.
        let mut loops: Vec<Loop> = Vec::new();
        for (h, tails) in headers.iter().copied().zip(tails_of.iter()) {
            let mut set = FxHashSet::default();
            set.insert(h);
            let mut work: Vec<usize> = Vec::new();
            for &t in tails {
                if set.insert(t) {
                    work.push(t);
                }
            }
            while let Some(b) = work.pop() {
                for &p in cfg.preds.row(b) {
                    let p = p as usize;
                    if set.insert(p) {
                        work.push(p);
                    }
                }
            }
            let mut blocks: Vec<usize> = set.iter().copied().collect();
            blocks.sort_unstable();

            let latches: Vec<usize> = blocks
                .iter()
                .copied()
                .filter(|&b| cfg.succs.row(b).iter().any(|&s| s as usize == h))
                .collect();
            let exits: Vec<usize> = blocks
                .iter()
                .copied()
                .filter(|&b| cfg.succs.row(b).iter().any(|&s| !set.contains(&(s as usize))))
                .collect();

            loops.push(Loop {
                header: h,
                blocks,
                block_set: set,
                latches,
                exits,
                parent: None,
                subloops: Vec::new(),
                depth: 1,
            });
        }

        // Outer loops first, so parents precede children.
        loops.sort_by(|a, b| b.blocks.len().cmp(&a.blocks.len()).then(a.header.cmp(&b.header)));

        // Nesting: the parent is the smallest strict superset.
        for i in 0..loops.len() {
            let mut best: Option<usize> = None;
            for j in 0..loops.len() {
                if i == j {
                    continue;
                }
                if loops[j].blocks.len() > loops[i].blocks.len()
                    && loops[j].contains(loops[i].header)
                {
                    match best {
                        Some(k) if loops[k].blocks.len() <= loops[j].blocks.len() => {}
                        _ => best = Some(j),
                    }
                }
            }
            if let Some(p) = best {
                loops[i].parent = Some(p);
                loops[p].subloops.push(i);
            }
        }
        for i in 0..loops.len() {
            let mut d = 1;
            let mut cur = loops[i].parent;
            while let Some(p) = cur {
                d += 1;
                cur = loops[p].parent;
            }
            loops[i].depth = d;
        }

        // Innermost loop per block: the smallest containing loop.
        let mut loop_of: Vec<Option<usize>> = vec![None; n];
        for (i, l) in loops.iter().enumerate() {
            for &b in &l.blocks {
                match loop_of[b] {
                    Some(j) if loops[j].blocks.len() <= l.blocks.len() => {}
                    _ => loop_of[b] = Some(i),
                }
            }
        }

        LoopInfo { loops, loop_of }
    }

    /// Loops ordered innermost-first (by descending depth, then header).
    pub fn innermost_first(&self) -> Vec<usize> {
        let mut idx: Vec<usize> = (0..self.loops.len()).collect();
        idx.sort_by(|&a, &b| {
            self.loops[b]
                .depth
                .cmp(&self.loops[a].depth)
                .then(self.loops[a].header.cmp(&self.loops[b].header))
        });
        idx
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }
}

/// Convenience: build CFG, dominators, and loop info for one function.
pub fn analyze_loops(m: &Module, func: Value) -> (Cfg, DomTree, LoopInfo) {
    let cfg = Cfg::build(m, func);
    let dom = DomTree::build(&cfg);
    let loops = LoopInfo::compute(&cfg, &dom);
    (cfg, dom, loops)
}
