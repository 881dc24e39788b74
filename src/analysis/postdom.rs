//! Post-dominator tree: dominators of the reverse CFG, rooted at a virtual
//! exit node that post-dominates every returning block. Also derives
//! control-dependence information (the reverse dominance frontier), which
//! aggressive dead-code elimination consumes.

use crate::ir::{Module, Opcode, Value};

use super::cfg::{Cfg, FlatAdj};
use super::dom::{DomTree, UNDEF};

pub struct PostDomTree {
    /// Underlying dominator computation on the reversed graph. Node `n`
    /// (one past the last real block) is the virtual exit.
    tree: DomTree,
    /// Reversed-graph predecessor adjacency (i.e. forward successors plus
    /// virtual-exit edges), kept for frontier queries.
    rpreds: FlatAdj,
    pub virtual_exit: usize,
}

impl PostDomTree {
    pub fn build(m: &Module, func: Value, cfg: &Cfg) -> PostDomTree {
        let n = cfg.num_blocks();
        let virtual_exit = n;

        // Reverse every edge and wire returning (and otherwise exitless)
        // blocks to the virtual exit.
        let mut rsuccs: Vec<Vec<u32>> = vec![Vec::new(); n + 1];
        let mut rpreds: Vec<Vec<u32>> = vec![Vec::new(); n + 1];
        for b in 0..n {
            for &s in cfg.succs.row(b) {
                rsuccs[s as usize].push(b as u32);
                rpreds[b].push(s);
            }
        }
        for b in 0..n {
            let block = cfg.block(b);
            let is_exit = match m.terminator(block) {
                Some(t) => m.opcode(t) == Some(Opcode::Ret),
                None => true,
            };
            if is_exit {
                rsuccs[virtual_exit].push(b as u32);
                rpreds[b].push(virtual_exit as u32);
            }
        }

        let rsuccs = FlatAdj::from_vecs(rsuccs);
        let rpreds = FlatAdj::from_vecs(rpreds);
        let tree = DomTree::compute(n + 1, &rpreds, &rsuccs, virtual_exit);
        PostDomTree { tree, rpreds, virtual_exit }
    }

    /// Immediate post-dominator of `b`; `None` for the virtual exit itself
    /// and for blocks that never reach an exit (infinite loops).
    pub fn ipdom(&self, b: usize) -> Option<usize> {
        let up = self.tree.idom[b];
        if up == UNDEF || up == b {
            None
        } else {
            Some(up)
        }
    }

    /// Does `a` post-dominate `b`?
    pub fn post_dominates(&self, a: usize, b: usize) -> bool {
        self.tree.dominates(a, b)
    }

    pub fn is_reachable_from_exit(&self, b: usize) -> bool {
        self.tree.is_reachable(b)
    }

    /// Control dependence: block `b` is control-dependent on the blocks in
    /// its reverse dominance frontier. Row `virtual_exit` is always empty.
    pub fn control_deps(&self) -> Vec<Vec<usize>> {
        self.tree.frontiers(&self.rpreds)
    }

    /// Walk up the post-dominator tree from `b`, yielding strict
    /// post-dominators until the virtual exit.
    pub fn walk_up(&self, mut b: usize) -> Vec<usize> {
        let mut out = Vec::new();
        while let Some(up) = self.ipdom(b) {
            if up == self.virtual_exit {
                break;
            }
            out.push(up);
            b = up;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::cfg::Cfg;
    use crate::ir::parse::parse_module;

    #[test]
    fn join_post_dominates_both_arms() {
        let m = parse_module(
            r#"
define i32 @f(i1 %c) {
entry:
  br i1 %c, label %a, label %b
a:
  br label %join
b:
  br label %join
join:
  ret i32 0
}
"#,
        )
        .unwrap();
        let f = m.find_function("f").unwrap();
        let cfg = Cfg::build(&m, f);
        let pdt = PostDomTree::build(&m, f, &cfg);
        // entry=0 a=1 b=2 join=3
        assert!(pdt.post_dominates(3, 0));
        assert!(pdt.post_dominates(3, 1));
        assert!(!pdt.post_dominates(1, 0));
        assert_eq!(pdt.ipdom(1), Some(3));
        // The branch arms are control-dependent on the entry.
        let cd = pdt.control_deps();
        assert_eq!(cd[1], vec![0]);
        assert_eq!(cd[2], vec![0]);
        assert!(cd[3].is_empty());
    }

    #[test]
    fn infinite_loop_is_unreachable_from_exit() {
        let m = parse_module(
            r#"
define i32 @f() {
entry:
  br label %spin
spin:
  br label %spin
}
"#,
        )
        .unwrap();
        let f = m.find_function("f").unwrap();
        let cfg = Cfg::build(&m, f);
        let pdt = PostDomTree::build(&m, f, &cfg);
        assert!(!pdt.is_reachable_from_exit(1));
    }
}
