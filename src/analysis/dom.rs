//! Dominator tree, via the iterative Cooper-Harvey-Kennedy algorithm over
//! reverse postorder. Dominance frontiers are computed on demand.
//!
//! Reference: "A Simple, Fast Dominance Algorithm", Cooper, Harvey,
//! Kennedy (2001).

use super::cfg::{reverse_postorder, Cfg, FlatAdj};

pub const UNDEF: usize = usize::MAX;

#[derive(Debug, Clone)]
pub struct DomTree {
    /// `idom[b]` is the immediate dominator of `b`; the entry is its own
    /// idom; `UNDEF` marks unreachable blocks.
    pub idom: Vec<usize>,
    /// Dominator-tree children per block.
    pub children: Vec<Vec<usize>>,
    /// Reverse postorder of reachable blocks, entry first.
    pub order: Vec<usize>,
    rpo_number: Vec<usize>,
}

impl DomTree {
    pub fn build(cfg: &Cfg) -> DomTree {
        Self::compute(cfg.num_blocks(), &cfg.preds, &cfg.succs, 0)
    }

    /// Dominators of an arbitrary rooted flow graph; used directly for the
    /// forward CFG and, with reversed adjacency plus a virtual exit, for
    /// post-dominators.
    pub fn compute(num_nodes: usize, preds: &FlatAdj, succs: &FlatAdj, entry: usize) -> DomTree {
        let order = reverse_postorder(num_nodes, succs, entry);
        let mut rpo_number = vec![UNDEF; num_nodes];
        for (i, &b) in order.iter().enumerate() {
            rpo_number[b] = i;
        }

        let mut idom = vec![UNDEF; num_nodes];
        if order.is_empty() {
            return DomTree { idom, children: vec![Vec::new(); num_nodes], order, rpo_number };
        }
        idom[entry] = entry;

        let mut changed = true;
        while changed {
            changed = false;
            for &b in order.iter().skip(1) {
                let mut new_idom = UNDEF;
                for &p in preds.row(b) {
                    let p = p as usize;
                    if idom[p] != UNDEF {
                        new_idom = p;
                        break;
                    }
                }
                if new_idom == UNDEF {
                    continue;
                }
                for &p in preds.row(b) {
                    let p = p as usize;
                    if p != new_idom && idom[p] != UNDEF {
                        new_idom = intersect(new_idom, p, &idom, &rpo_number);
                    }
                }
                if idom[b] != new_idom {
                    idom[b] = new_idom;
                    changed = true;
                }
            }
        }

        let mut children = vec![Vec::new(); num_nodes];
        for b in 0..num_nodes {
            if b != entry && idom[b] != UNDEF {
                children[idom[b]].push(b);
            }
        }
        DomTree { idom, children, order, rpo_number }
    }

    pub fn is_reachable(&self, b: usize) -> bool {
        self.idom[b] != UNDEF
    }

    /// Does `a` dominate `b`? Reflexive. Unreachable blocks dominate
    /// nothing and are dominated by nothing.
    pub fn dominates(&self, a: usize, mut b: usize) -> bool {
        if self.idom[a] == UNDEF || self.idom[b] == UNDEF {
            return false;
        }
        loop {
            if a == b {
                return true;
            }
            let up = self.idom[b];
            if up == b {
                return false;
            }
            b = up;
        }
    }

    /// Dominance frontier per block: the join points where a block's
    /// dominance ends. Rows are sorted for deterministic iteration.
    pub fn frontiers(&self, preds: &FlatAdj) -> Vec<Vec<usize>> {
        let n = self.idom.len();
        let mut df: Vec<Vec<usize>> = vec![Vec::new(); n];
        for b in 0..n {
            if preds.len(b) < 2 {
                continue;
            }
            if self.idom[b] == UNDEF {
                continue;
            }
            for &p in preds.row(b) {
                let mut runner = p as usize;
                if self.idom[runner] == UNDEF {
                    continue;
                }
                while runner != self.idom[b] {
                    if !df[runner].contains(&b) {
                        df[runner].push(b);
                    }
                    if runner == self.idom[runner] {
                        break;
                    }
                    runner = self.idom[runner];
                }
            }
        }
        for row in &mut df {
            row.sort_unstable();
        }
        df
    }
}

fn intersect(mut f1: usize, mut f2: usize, idom: &[usize], rpo_number: &[usize]) -> usize {
    while f1 != f2 {
        while rpo_number[f1] > rpo_number[f2] {
            f1 = idom[f1];
        }
        while rpo_number[f2] > rpo_number[f1] {
            f2 = idom[f2];
        }
    }
    f1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::cfg::Cfg;
    use crate::ir::parse::parse_module;

    fn diamond_with_loop() -> (crate::ir::Module, crate::ir::Value) {
        let m = parse_module(
            r#"
define i32 @f(i1 %c) {
entry:
  br i1 %c, label %then, label %els
then:
  br label %head
els:
  br label %head
head:
  br i1 %c, label %body, label %exit
body:
  br label %head
exit:
  ret i32 0
}
"#,
        )
        .unwrap();
        let f = m.find_function("f").unwrap();
        (m, f)
    }

    #[test]
    fn idoms_of_diamond_and_loop() {
        let (m, f) = diamond_with_loop();
        let cfg = Cfg::build(&m, f);
        let dom = DomTree::build(&cfg);
        // entry=0 then=1 els=2 head=3 body=4 exit=5
        assert_eq!(dom.idom[1], 0);
        assert_eq!(dom.idom[2], 0);
        assert_eq!(dom.idom[3], 0); // join point: idom is the branch block
        assert_eq!(dom.idom[4], 3);
        assert_eq!(dom.idom[5], 3);
        assert!(dom.dominates(0, 5));
        assert!(dom.dominates(3, 4));
        assert!(!dom.dominates(1, 3));
        assert!(dom.dominates(3, 3));
    }

    #[test]
    fn frontier_of_branch_arms_is_the_join() {
        let (m, f) = diamond_with_loop();
        let cfg = Cfg::build(&m, f);
        let dom = DomTree::build(&cfg);
        let df = dom.frontiers(&cfg.preds);
        assert_eq!(df[1], vec![3]); // then -> head
        assert_eq!(df[2], vec![3]); // els -> head
        assert!(df[4].contains(&3)); // body's frontier includes the loop header
    }

    #[test]
    fn unreachable_blocks_have_undef_idom() {
        let m = parse_module(
            r#"
define i32 @f() {
entry:
  ret i32 0
dead:
  ret i32 1
}
"#,
        )
        .unwrap();
        let f = m.find_function("f").unwrap();
        let cfg = Cfg::build(&m, f);
        let dom = DomTree::build(&cfg);
        assert!(!dom.is_reachable(1));
        assert!(!dom.dominates(0, 1));
    }
}
