//! Sparse conditional constant propagation.
//!
//! The classic three-point lattice (undef, constant, overdefined) driven
//! by two worklists, with CFG edges marked executable as branch conditions
//! resolve. Phis meet only over executable incoming edges, which is what
//! lets constants flow through conditionals that plain folding cannot see
//! through. Afterwards constant instructions are rewritten to constants
//! and decided branches become unconditional; unreachable blocks are left
//! for simplifycfg.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::analysis::cfg::Cfg;
use crate::analysis::AnalysisManager;
use crate::config::Config;
use crate::ir::{ConstKind, Module, Opcode, Ty, Value};

use super::constfold::{fold_binary, fold_cmp};
use super::FunctionPass;

pub struct Sccp;

impl FunctionPass for Sccp {
    fn name(&self) -> &'static str {
        "sccp"
    }

    fn run(&self, m: &mut Module, func: Value, am: &mut AnalysisManager, _cfg: &Config) -> usize {
        let n = run_function(m, func);
        if n > 0 {
            am.cfg_changed(func);
        }
        n
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Lattice {
    Undef,
    Const(ConstKind),
    Overdef,
}

impl Lattice {
    fn meet(self, other: Lattice) -> Lattice {
        match (self, other) {
            (Lattice::Undef, x) | (x, Lattice::Undef) => x,
            (Lattice::Overdef, _) | (_, Lattice::Overdef) => Lattice::Overdef,
            (Lattice::Const(a), Lattice::Const(b)) => {
                if a.hash_key() == b.hash_key() {
                    Lattice::Const(a)
                } else {
                    Lattice::Overdef
                }
            }
        }
    }
}

struct Solver<'a> {
    m: &'a Module,
    cfg: &'a Cfg,
    lattice: FxHashMap<Value, Lattice>,
    exec_edges: FxHashSet<(usize, usize)>,
    exec_blocks: FxHashSet<usize>,
    block_work: Vec<usize>,
    ssa_work: Vec<Value>,
}

impl<'a> Solver<'a> {
    fn value_of(&self, v: Value) -> Lattice {
        if let Some(c) = self.m.const_kind(v) {
            if matches!(c, ConstKind::Undef) {
                return Lattice::Undef;
            }
            return Lattice::Const(c);
        }
        match &self.m.value(v).kind {
            crate::ir::ValueKind::Inst(_) => {
                self.lattice.get(&v).copied().unwrap_or(Lattice::Undef)
            }
            // Arguments, globals, functions.
            _ => Lattice::Overdef,
        }
    }

    fn lower(&mut self, v: Value, new: Lattice) {
        let old = self.lattice.get(&v).copied().unwrap_or(Lattice::Undef);
        let met = old.meet(new);
        if met != old {
            self.lattice.insert(v, met);
            for u in self.m.uses(v) {
                self.ssa_work.push(u.user);
            }
        }
    }

    fn mark_edge(&mut self, from: usize, to: usize) {
        if self.exec_edges.insert((from, to)) {
            // Phis in `to` depend on which edges run.
            for phi in self.m.phis_of(self.cfg.block(to)) {
                self.ssa_work.push(phi);
            }
            if self.exec_blocks.insert(to) {
                self.block_work.push(to);
            }
        }
    }

    fn visit_inst(&mut self, inst: Value) {
        let Some(bi) = self
            .m
            .inst_parent(inst)
            .and_then(|b| self.cfg.index_of.get(&b).copied())
        else {
            return;
        };
        if !self.exec_blocks.contains(&bi) {
            return;
        }
        let op = self.m.opcode(inst).expect("instruction");
        let ops = self.m.operands(inst);
        match op {
            Opcode::Phi => {
                let mut acc = Lattice::Undef;
                for (v, pred) in self.m.phi_incoming(inst) {
                    let Some(&pi) = self.cfg.index_of.get(&pred) else { continue };
                    if !self.exec_edges.contains(&(pi, bi)) {
                        continue;
                    }
                    acc = acc.meet(self.value_of(v));
                }
                self.lower(inst, acc);
            }
            Opcode::Br => {
                let t = self.cfg.index(ops[0]);
                self.mark_edge(bi, t);
            }
            Opcode::CondBr => {
                let t = self.cfg.index(ops[1]);
                let e = self.cfg.index(ops[2]);
                match self.value_of(ops[0]) {
                    Lattice::Const(c) => {
                        let to = if c.is_nonzero() { t } else { e };
                        self.mark_edge(bi, to);
                    }
                    Lattice::Overdef => {
                        self.mark_edge(bi, t);
                        self.mark_edge(bi, e);
                    }
                    Lattice::Undef => {}
                }
            }
            _ if op.is_binary() => {
                let (a, b) = (self.value_of(ops[0]), self.value_of(ops[1]));
                let r = match (a, b) {
                    (Lattice::Overdef, _) | (_, Lattice::Overdef) => Lattice::Overdef,
                    (Lattice::Undef, _) | (_, Lattice::Undef) => Lattice::Undef,
                    (Lattice::Const(x), Lattice::Const(y)) => match fold_binary(op, x, y) {
                        Some(c) => Lattice::Const(c),
                        None => Lattice::Overdef,
                    },
                };
                self.lower(inst, r);
            }
            Opcode::ICmp(p) | Opcode::FCmp(p) => {
                let (a, b) = (self.value_of(ops[0]), self.value_of(ops[1]));
                let r = match (a, b) {
                    (Lattice::Overdef, _) | (_, Lattice::Overdef) => Lattice::Overdef,
                    (Lattice::Undef, _) | (_, Lattice::Undef) => Lattice::Undef,
                    (Lattice::Const(x), Lattice::Const(y)) => match fold_cmp(p, x, y) {
                        Some(r) => Lattice::Const(ConstKind::Bool(r)),
                        None => Lattice::Overdef,
                    },
                };
                self.lower(inst, r);
            }
            _ if op.is_cast() => {
                let r = match self.value_of(ops[0]) {
                    Lattice::Overdef => Lattice::Overdef,
                    Lattice::Undef => Lattice::Undef,
                    Lattice::Const(c) => {
                        let from = self.m.ty(ops[0]);
                        match crate::ir::builder::fold_const_cast(c, from, self.m.ty(inst)) {
                            Some(f) => Lattice::Const(f),
                            None => Lattice::Overdef,
                        }
                    }
                };
                self.lower(inst, r);
            }
            Opcode::FNeg => {
                let r = match self.value_of(ops[0]) {
                    Lattice::Const(ConstKind::Float(v)) => Lattice::Const(ConstKind::Float(-v)),
                    Lattice::Const(ConstKind::Double(v)) => Lattice::Const(ConstKind::Double(-v)),
                    Lattice::Undef => Lattice::Undef,
                    _ => Lattice::Overdef,
                };
                self.lower(inst, r);
            }
            // Memory, calls, allocas: unknowable here.
            _ => self.lower(inst, Lattice::Overdef),
        }
    }
}

pub fn run_function(m: &mut Module, func: Value) -> usize {
    let cfg = Cfg::build(m, func);
    if cfg.num_blocks() == 0 {
        return 0;
    }

    let mut solver = Solver {
        m,
        cfg: &cfg,
        lattice: FxHashMap::default(),
        exec_edges: FxHashSet::default(),
        exec_blocks: FxHashSet::default(),
        block_work: vec![0],
        ssa_work: Vec::new(),
    };
    solver.exec_blocks.insert(0);

    while !solver.block_work.is_empty() || !solver.ssa_work.is_empty() {
        while let Some(b) = solver.block_work.pop() {
            for inst in solver.m.block_insts(cfg.block(b)).to_vec() {
                solver.visit_inst(inst);
            }
        }
        while let Some(v) = solver.ssa_work.pop() {
            solver.visit_inst(v);
        }
    }

    let lattice = solver.lattice;
    let exec_blocks = solver.exec_blocks;

    // Rewrite constants.
    let mut changes = 0;
    for (bi, &b) in cfg.blocks.iter().enumerate() {
        if !exec_blocks.contains(&bi) {
            continue;
        }
        for inst in m.block_insts(b).to_vec() {
            let Some(&Lattice::Const(c)) = lattice.get(&inst) else { continue };
            let cv = m.const_of(m.ty(inst), c);
            m.replace_all_uses_with(inst, cv);
            m.erase_inst(inst);
            changes += 1;
        }
    }

    // Decide branches whose condition settled.
    for &b in &cfg.blocks {
        let Some(term) = m.terminator(b) else { continue };
        if m.opcode(term) != Some(Opcode::CondBr) {
            continue;
        }
        let ops = m.operands(term);
        let Some(c) = m.const_kind(ops[0]) else { continue };
        if matches!(c, ConstKind::Undef) {
            continue;
        }
        let (taken, dead) =
            if c.is_nonzero() { (ops[1], ops[2]) } else { (ops[2], ops[1]) };
        if taken != dead {
            for phi in m.phis_of(dead) {
                m.phi_remove_incoming(phi, b);
            }
        }
        m.erase_inst(term);
        let br = m.create_inst(Opcode::Br, Ty::VOID, &[taken]);
        m.append_inst(b, br);
        changes += 1;
    }

    if changes > 0 {
        log::debug!("sccp: {changes} rewrites in @{}", m.func_name(func));
    }
    changes
}
