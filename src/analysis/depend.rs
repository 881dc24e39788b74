//! Memory dependence analysis over loop nests.
//!
//! Accesses are reduced to `(root, offset)` pairs: the root is the
//! alloca/global/argument a getelementptr chain bottoms out at, the offset
//! is a linear form (`scev`) in the basic induction variables, measured in
//! elements. Pairs with at least one store are classified as independent,
//! flow (write then read), anti (read then write), or output (write then
//! write), using base-identity filtering, a ZIV test, a GCD test, and
//! Banerjee-style range bounds when trip counts are known. Anything the
//! affine machinery cannot express is conservatively dependent.

use crate::ir::{Module, Opcode, Value, ValueKind};

use super::cfg::Cfg;
use super::indvar::{trip_count, IndVarInfo};
use super::loops::LoopInfo;
use super::scev::{analyze as scev_of, Scev};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepKind {
    Flow,
    Anti,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepResult {
    Independent,
    /// `loop_carried` is true when distinct iterations of the queried loop
    /// can touch the same location.
    Dependent { kind: DepKind, loop_carried: bool },
}

#[derive(Debug, Clone)]
pub struct Access {
    pub inst: Value,
    pub is_store: bool,
    pub root: Value,
    /// Element offset from the root, linear in enclosing-loop IVs.
    pub offset: Scev,
}

/// Per-function summary: for every loop, whether a loop-carried memory
/// dependence may exist. `None` means some access was not analyzable and
/// the loop must be treated as carrying a dependence.
pub struct DependenceInfo {
    pub carried: Vec<Option<bool>>,
}

impl DependenceInfo {
    pub fn compute(m: &Module, cfg: &Cfg, loops: &LoopInfo, ivs: &IndVarInfo) -> DependenceInfo {
        let carried = (0..loops.loops.len())
            .map(|li| loop_carried_dependence(m, cfg, loops, ivs, li))
            .collect();
        DependenceInfo { carried }
    }

    /// Conservative query: false only when the analysis proved independence.
    pub fn has_carried(&self, loop_idx: usize) -> bool {
        self.carried[loop_idx].unwrap_or(true)
    }
}

/// Walk a getelementptr chain back to its root, accumulating the element
/// offset. Returns `None` for pointers the analysis cannot express.
pub fn trace_access(
    m: &Module,
    cfg: &Cfg,
    loops: &LoopInfo,
    ivs: &IndVarInfo,
    loop_idx: usize,
    mut ptr: Value,
) -> Option<(Value, Scev)> {
    let mut offset = Scev::constant(0);
    loop {
        match &m.value(ptr).kind {
            ValueKind::Global(_) | ValueKind::Argument { .. } => return Some((ptr, offset)),
            ValueKind::Inst(inst) => match inst.op {
                Opcode::Alloca => return Some((ptr, offset)),
                Opcode::GetElementPtr => {
                    let base = m.operands(ptr)[0];
                    let index = m.operands(ptr)[1];
                    let idx = scev_of(m, cfg, loops, ivs, loop_idx, index)?;
                    let stride = gep_stride(m, base)?;
                    offset = offset.add(&idx.mul_const(stride));
                    ptr = base;
                }
                Opcode::Bitcast => ptr = m.operands(ptr)[0],
                _ => return None,
            },
            _ => return None,
        }
    }
}

/// Scalar elements stepped per index unit of a GEP whose base is `base`:
/// the pointee's size in elements (GEPs are plain pointer arithmetic).
fn gep_stride(m: &Module, base: Value) -> Option<i64> {
    let pointee = m.types.pointee(m.ty(base))?;
    match m.types.array_dims(pointee) {
        Some(dims) => Some(dims.iter().product::<usize>() as i64),
        None => Some(1),
    }
}

/// Can two roots name overlapping storage? Distinct allocas and globals
/// cannot; arguments may alias globals and other arguments.
pub fn roots_may_alias(m: &Module, a: Value, b: Value) -> bool {
    if a == b {
        return true;
    }
    let arg = |v: Value| m.value(v).is_argument();
    let alloca = |v: Value| m.opcode(v) == Some(Opcode::Alloca);
    if alloca(a) || alloca(b) {
        // A local's address never escapes into an argument or global here.
        return false;
    }
    if arg(a) || arg(b) {
        return true;
    }
    // Two distinct globals.
    false
}

/// Collect the load/store accesses of a loop. `None` when any access is not
/// affine-traceable (calls with side effects also defeat the analysis and
/// are handled by the callers via the side-effect summary).
pub fn collect_accesses(
    m: &Module,
    cfg: &Cfg,
    loops: &LoopInfo,
    ivs: &IndVarInfo,
    loop_idx: usize,
) -> Option<Vec<Access>> {
    let l = &loops.loops[loop_idx];
    let mut out = Vec::new();
    for &bi in &l.blocks {
        for &inst in m.block_insts(cfg.block(bi)) {
            let (is_store, ptr) = match m.opcode(inst) {
                Some(Opcode::Load) => (false, m.operands(inst)[0]),
                Some(Opcode::Store) => (true, m.operands(inst)[1]),
                Some(Opcode::Memset) => return None,
                Some(Opcode::AtomicAdd) => return None,
                _ => continue,
            };
            let (root, offset) = trace_access(m, cfg, loops, ivs, loop_idx, ptr)?;
            out.push(Access { inst, is_store, root, offset });
        }
    }
    Some(out)
}

/// Classify one pair of accesses with respect to the given loop. `a` is the
/// textually earlier access.
pub fn classify_pair(
    m: &Module,
    cfg: &Cfg,
    loops: &LoopInfo,
    ivs: &IndVarInfo,
    loop_idx: usize,
    a: &Access,
    b: &Access,
) -> DepResult {
    if !a.is_store && !b.is_store {
        return DepResult::Independent;
    }
    if !roots_may_alias(m, a.root, b.root) {
        return DepResult::Independent;
    }
    let kind = match (a.is_store, b.is_store) {
        (true, true) => DepKind::Output,
        (true, false) => DepKind::Flow,
        (false, true) => DepKind::Anti,
        (false, false) => unreachable!(),
    };
    // Aliasing-but-distinct roots (e.g. two arguments): no affine
    // information connects the offsets.
    if a.root != b.root {
        return DepResult::Dependent { kind, loop_carried: true };
    }

    let carried = match carried_solution(m, cfg, loops, ivs, loop_idx, &a.offset, &b.offset) {
        Some(c) => c,
        None => true,
    };
    // Same-iteration equality (delta identically zero) still orders the two
    // accesses inside one iteration.
    DepResult::Dependent { kind, loop_carried: carried }
}

/// Does `off_a(i) == off_b(i')` admit a solution with `i != i'` for the
/// queried loop's IV, with all other IVs ranging freely per instance?
/// `None` when the forms are too different to decide.
fn carried_solution(
    m: &Module,
    cfg: &Cfg,
    loops: &LoopInfo,
    ivs: &IndVarInfo,
    loop_idx: usize,
    off_a: &Scev,
    off_b: &Scev,
) -> Option<bool> {
    let delta = off_a.sub(off_b);
    // Symbolic residue: the bases differ by an unknown invariant amount.
    if !delta.symbols.is_empty() {
        return None;
    }

    // Both forms must use the same coefficient for the queried IV, and the
    // remaining terms describe inner/outer IVs whose instances differ
    // between the two iterations.
    let loop_phis: Vec<Value> = ivs.per_loop[loop_idx].iter().map(|iv| iv.phi).collect();
    let mut c = 0i64;
    let mut others: Vec<(Value, i64)> = Vec::new();
    for &(phi, coeff) in off_a.terms.iter() {
        if loop_phis.contains(&phi) {
            c += coeff;
        }
    }
    let mut cb = 0i64;
    for &(phi, coeff) in off_b.terms.iter() {
        if loop_phis.contains(&phi) {
            cb += coeff;
        }
    }
    if c != cb {
        // Crossing access patterns: fall back to a plain GCD test over all
        // coefficients.
        return Some(gcd_test(off_a, off_b));
    }
    // Queried-loop IVs present in the offsets must share one constant
    // step, so IV-value differences are multiples of it.
    let mut qstep: Option<i64> = None;
    for &(phi, _) in off_a.terms.iter().chain(off_b.terms.iter()) {
        if loop_phis.contains(&phi) {
            let s = ivs.iv_for(loop_idx, phi)?.const_step(m)?;
            match qstep {
                Some(prev) if prev != s => return None,
                _ => qstep = Some(s),
            }
        }
    }
    // Non-queried IVs come in two flavors. Enclosing-loop IVs are pinned
    // to one iteration for both accesses, so equal coefficients cancel.
    // IVs nested inside the queried loop range independently per access;
    // with equal coefficients their contribution is a multiple of
    // `coeff * step` bounded by `coeff * step * (trip-1)`. Differing
    // coefficients are beyond this machinery.
    for &(phi, _) in off_a.terms.iter().chain(off_b.terms.iter()) {
        if loop_phis.contains(&phi) || others.iter().any(|&(p, _)| p == phi) {
            continue;
        }
        let ca = off_a.coeff_of(phi);
        let cb2 = off_b.coeff_of(phi);
        if ca != cb2 {
            return None;
        }
        let owner = owner_loop(loops, ivs, phi)?;
        let enclosing = loops.loops[owner].contains(loops.loops[loop_idx].header);
        if enclosing {
            continue; // cancels
        }
        others.push((phi, ca));
    }

    // Solve B + c*d + Σ c_k·δ_k = 0, where d is a nonzero multiple of the
    // queried step bounded by its trip range and each δ_k is a multiple of
    // `step_k` bounded by its trip range.
    let b_const = delta.base;
    let mut g: i64 = 0; // gcd of the δ contributions' granularities
    let mut slack: i64 = 0;
    for &(phi, coeff) in &others {
        if coeff == 0 {
            continue;
        }
        let owner = owner_loop(loops, ivs, phi)?;
        let step = ivs.iv_for(owner, phi)?.const_step(m)?;
        let t = trip_count(m, cfg, &loops.loops[owner], &ivs.per_loop[owner])?;
        let unit = coeff.checked_mul(step)?.abs();
        g = gcd(g, unit);
        slack = slack.saturating_add(unit.saturating_mul((t - 1).max(0)));
    }

    // Residual `R = -B - c*d` must be representable as Σ c_k·δ_k:
    // necessarily g | R and |R| <= slack (with no δ terms, R must be 0).
    let representable = |r: i64| {
        if g == 0 {
            r == 0
        } else {
            r % g == 0 && r.abs() <= slack
        }
    };

    if c == 0 {
        return Some(representable(-b_const));
    }
    let qstep = qstep.expect("c != 0 implies a queried-loop IV term");
    let max_d = trip_count(m, cfg, &loops.loops[loop_idx], &ivs.per_loop[loop_idx])
        .map(|t| (t - 1).max(0).saturating_mul(qstep.abs()));

    // Candidates keep |c*d + B| within the slack.
    let lo = (-b_const - slack) as f64 / c as f64;
    let hi = (-b_const + slack) as f64 / c as f64;
    let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
    let mut lo = lo.ceil() as i64;
    let mut hi = hi.floor() as i64;
    if let Some(b) = max_d {
        lo = lo.max(-b);
        hi = hi.min(b);
    }
    if hi.saturating_sub(lo) > 100_000 {
        // Range too wide to enumerate; stay conservative.
        return Some(true);
    }
    let reachable = (lo..=hi)
        .any(|d| d != 0 && d % qstep == 0 && representable(-b_const - c * d));
    Some(reachable)
}

fn owner_loop(loops: &LoopInfo, ivs: &IndVarInfo, phi: Value) -> Option<usize> {
    (0..loops.loops.len()).find(|&li| ivs.iv_for(li, phi).is_some())
}

/// GCD feasibility: a solution requires gcd of all coefficients to divide
/// the constant difference. Returns true when a dependence may exist.
fn gcd_test(off_a: &Scev, off_b: &Scev) -> bool {
    let delta = off_a.sub(off_b);
    let mut g: i64 = 0;
    for &(_, c) in off_a.terms.iter().chain(off_b.terms.iter()) {
        g = gcd(g, c.abs());
    }
    if g == 0 {
        return delta.base == 0;
    }
    delta.base % g == 0
}

fn gcd(a: i64, b: i64) -> i64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Does the loop carry a memory dependence between iterations?
/// `Some(false)` only when every pair was proven independent or
/// intra-iteration.
pub fn loop_carried_dependence(
    m: &Module,
    cfg: &Cfg,
    loops: &LoopInfo,
    ivs: &IndVarInfo,
    loop_idx: usize,
) -> Option<bool> {
    let accesses = collect_accesses(m, cfg, loops, ivs, loop_idx)?;
    for i in 0..accesses.len() {
        for j in i..accesses.len() {
            let r = classify_pair(m, cfg, loops, ivs, loop_idx, &accesses[i], &accesses[j]);
            if let DepResult::Dependent { loop_carried: true, .. } = r {
                return Some(true);
            }
        }
    }
    Some(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::dom::DomTree;
    use crate::ir::parse::parse_module;

    fn setup(text: &str) -> (crate::ir::Module, Cfg, LoopInfo, IndVarInfo) {
        let m = parse_module(text).unwrap();
        let f = m.find_function("f").unwrap();
        let cfg = Cfg::build(&m, f);
        let dom = DomTree::build(&cfg);
        let li = LoopInfo::compute(&cfg, &dom);
        let ivs = IndVarInfo::compute(&m, &cfg, &li);
        (m, cfg, li, ivs)
    }

    #[test]
    fn disjoint_iterations_are_independent() {
        // a[i] = a[i] + 1 — same element read and written each iteration.
        let (m, cfg, li, ivs) = setup(
            r#"
@a = global [100 x i32] zeroinitializer

define i32 @f() {
entry:
  %base = bitcast [100 x i32]* @a to i32*
  br label %head
head:
  %i = phi i32 [ 0, %entry ], [ %next, %body ]
  %c = icmp slt i32 %i, 100
  br i1 %c, label %body, label %exit
body:
  %p = getelementptr i32, i32* %base, i32 %i
  %v = load i32, i32* %p
  %v1 = add i32 %v, 1
  store i32 %v1, i32* %p
  %next = add i32 %i, 1
  br label %head
exit:
  ret i32 0
}
"#,
        );
        assert_eq!(loop_carried_dependence(&m, &cfg, &li, &ivs, 0), Some(false));
    }

    #[test]
    fn shifted_store_carries_dependence() {
        // a[i+1] = a[i] — classic flow dependence with distance 1.
        let (m, cfg, li, ivs) = setup(
            r#"
@a = global [100 x i32] zeroinitializer

define i32 @f() {
entry:
  %base = bitcast [100 x i32]* @a to i32*
  br label %head
head:
  %i = phi i32 [ 0, %entry ], [ %next, %body ]
  %c = icmp slt i32 %i, 99
  br i1 %c, label %body, label %exit
body:
  %p = getelementptr i32, i32* %base, i32 %i
  %v = load i32, i32* %p
  %i1 = add i32 %i, 1
  %q = getelementptr i32, i32* %base, i32 %i1
  store i32 %v, i32* %q
  %next = add i32 %i, 1
  br label %head
exit:
  ret i32 0
}
"#,
        );
        assert_eq!(loop_carried_dependence(&m, &cfg, &li, &ivs, 0), Some(true));
    }

    #[test]
    fn distinct_globals_never_alias() {
        let (m, cfg, li, ivs) = setup(
            r#"
@a = global [10 x i32] zeroinitializer
@b = global [10 x i32] zeroinitializer

define i32 @f() {
entry:
  %pa = bitcast [10 x i32]* @a to i32*
  %pb = bitcast [10 x i32]* @b to i32*
  br label %head
head:
  %i = phi i32 [ 0, %entry ], [ %next, %body ]
  %c = icmp slt i32 %i, 10
  br i1 %c, label %body, label %exit
body:
  %p = getelementptr i32, i32* %pa, i32 %i
  %v = load i32, i32* %p
  %q = getelementptr i32, i32* %pb, i32 %i
  store i32 %v, i32* %q
  %next = add i32 %i, 1
  br label %head
exit:
  ret i32 0
}
"#,
        );
        assert_eq!(loop_carried_dependence(&m, &cfg, &li, &ivs, 0), Some(false));
    }

    #[test]
    fn strided_writes_with_gap_are_independent() {
        // a[2*i] = a[2*i + 1]: even writes, odd reads never meet.
        let (m, cfg, li, ivs) = setup(
            r#"
@a = global [100 x i32] zeroinitializer

define i32 @f() {
entry:
  %base = bitcast [100 x i32]* @a to i32*
  br label %head
head:
  %i = phi i32 [ 0, %entry ], [ %next, %body ]
  %c = icmp slt i32 %i, 49
  br i1 %c, label %body, label %exit
body:
  %two_i = mul i32 %i, 2
  %odd = add i32 %two_i, 1
  %p = getelementptr i32, i32* %base, i32 %odd
  %v = load i32, i32* %p
  %q = getelementptr i32, i32* %base, i32 %two_i
  store i32 %v, i32* %q
  %next = add i32 %i, 1
  br label %head
exit:
  ret i32 0
}
"#,
        );
        // delta base is odd while both coefficients are 2: GCD rules it out.
        assert_eq!(loop_carried_dependence(&m, &cfg, &li, &ivs, 0), Some(false));
    }

    /// Differential check: enumerate the iteration space of small loops and
    /// compare the analytic verdict against brute force.
    #[test]
    fn differential_against_enumeration() {
        // store a[3*i], load a[5*i]: within trip 4, addresses {0,3,6,9} vs
        // {0,5,10,15} meet only at 0 in the same iteration; cross-iteration
        // collisions none. Analysis may be conservative (true allowed), but
        // must never claim independence when brute force finds a collision.
        let cases: &[(&str, &str, i64, bool)] = &[
            ("3", "5", 4, false),  // {0,3,6,9} ∩ {0,5,10,15} = {0} same-iter only
            ("2", "4", 5, true),   // 2i == 4i' with i=2,i'=1
            ("1", "1", 8, false),  // identical pattern, same-iter only
        ];
        for &(ca, cb, trip, brute_carried) in cases {
            let text = format!(
                r#"
@a = global [100 x i32] zeroinitializer

define i32 @f() {{
entry:
  %base = bitcast [100 x i32]* @a to i32*
  br label %head
head:
  %i = phi i32 [ 0, %entry ], [ %next, %body ]
  %c = icmp slt i32 %i, {trip}
  br i1 %c, label %body, label %exit
body:
  %sa = mul i32 %i, {ca}
  %sb = mul i32 %i, {cb}
  %p = getelementptr i32, i32* %base, i32 %sa
  store i32 1, i32* %p
  %q = getelementptr i32, i32* %base, i32 %sb
  %v = load i32, i32* %q
  %next = add i32 %i, 1
  br label %head
exit:
  ret i32 0
}}
"#
            );
            let (m, cfg, li, ivs) = setup(&text);
            let got = loop_carried_dependence(&m, &cfg, &li, &ivs, 0);
            // Brute force over the iteration space.
            let a: i64 = ca.parse().unwrap();
            let b: i64 = cb.parse().unwrap();
            let mut collide = false;
            for i in 0..trip {
                for j in 0..trip {
                    if i != j && a * i == b * j {
                        collide = true;
                    }
                }
            }
            assert_eq!(collide, brute_carried, "case {ca},{cb} brute force");
            if got == Some(false) {
                assert!(!collide, "analysis claimed independence but {ca},{cb} collides");
            }
            if !brute_carried && a == b {
                // The equal-pattern fast path must prove this.
                assert_eq!(got, Some(false));
            }
        }
    }
}
