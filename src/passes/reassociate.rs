//! Reassociation of commutative integer chains.
//!
//! Flattens single-use `add`/`mul` trees, folds all constant leaves into
//! one, groups repeated leaves (`x + x` becomes `x * 2`), and rebuilds a
//! left-leaning chain with the constant last, where later folding passes
//! can see it. Floats are left alone.

use crate::analysis::AnalysisManager;
use crate::config::Config;
use crate::ir::{Module, Opcode, Value};

use super::FunctionPass;

pub struct Reassociate;

impl FunctionPass for Reassociate {
    fn name(&self) -> &'static str {
        "reassociate"
    }

    fn run(&self, m: &mut Module, func: Value, _am: &mut AnalysisManager, _cfg: &Config) -> usize {
        run_function(m, func)
    }
}

pub fn run_function(m: &mut Module, func: Value) -> usize {
    let mut changes = 0;
    for &b in &m.func_blocks(func).to_vec() {
        // Walk backwards so tree roots are seen before their single-use
        // children disappear into them.
        let insts: Vec<Value> = m.block_insts(b).to_vec();
        for &inst in insts.iter().rev() {
            if m.inst_parent(inst).is_none() {
                continue;
            }
            let Some(op) = m.opcode(inst) else { continue };
            if !matches!(op, Opcode::Add | Opcode::Mul) {
                continue;
            }
            // Roots only: a single-use node feeding the same opcode is an
            // interior node of some larger tree.
            if m.uses(inst).len() == 1 {
                let user = m.uses(inst)[0].user;
                if m.opcode(user) == Some(op) {
                    continue;
                }
            }
            changes += reassociate_tree(m, inst, op);
        }
    }
    if changes > 0 {
        log::debug!("reassociate: {changes} chains in @{}", m.func_name(func));
    }
    changes
}

/// Collect leaves of the single-use same-opcode tree under `root`.
fn collect_leaves(m: &Module, root: Value, op: Opcode, out: &mut Vec<Value>, interior: &mut Vec<Value>) {
    for &o in m.operands(root) {
        let is_interior =
            m.opcode(o) == Some(op) && m.uses(o).len() == 1 && m.value(o).is_inst();
        if is_interior {
            interior.push(o);
            collect_leaves(m, o, op, out, interior);
        } else {
            out.push(o);
        }
    }
}

fn reassociate_tree(m: &mut Module, root: Value, op: Opcode) -> usize {
    let mut leaves = Vec::new();
    let mut interior = Vec::new();
    collect_leaves(m, root, op, &mut leaves, &mut interior);
    if leaves.len() < 2 {
        return 0;
    }

    // Fold constant leaves together.
    let mut const_acc: Option<i64> = None;
    let mut rest: Vec<Value> = Vec::new();
    for &l in &leaves {
        match m.const_kind(l).and_then(|c| c.as_int()) {
            Some(c) => {
                let acc = const_acc.unwrap_or(if op == Opcode::Add { 0 } else { 1 });
                const_acc = Some(if op == Opcode::Add {
                    (acc as i32).wrapping_add(c as i32) as i64
                } else {
                    (acc as i32).wrapping_mul(c as i32) as i64
                });
            }
            None => rest.push(l),
        }
    }

    // Group repeated leaves of an add into multiplies.
    let mut grouped: Vec<(Value, u32)> = Vec::new();
    for &l in &rest {
        match grouped.iter_mut().find(|(v, _)| *v == l) {
            Some((_, n)) => *n += 1,
            None => grouped.push((l, 1)),
        }
    }

    let had_dup = grouped.iter().any(|&(_, n)| n > 1);
    let folded_consts = leaves.len() - rest.len() >= 2;
    let neutral = match const_acc {
        Some(c) => (op == Opcode::Add && c == 0) || (op == Opcode::Mul && c == 1),
        None => true,
    };
    let drops_neutral = leaves.len() - rest.len() == 1 && neutral;
    if !had_dup && !folded_consts && !drops_neutral {
        return 0;
    }

    // Rebuild: terms first (duplicates as term*count for adds), constant
    // last.
    let ty = m.ty(root);
    let mut terms: Vec<Value> = Vec::new();
    for (v, n) in grouped {
        if op == Opcode::Mul || n == 1 {
            for _ in 0..n {
                terms.push(v);
            }
        } else {
            let k = m.const_int(n as i32);
            let mul = m.create_inst(Opcode::Mul, ty, &[v, k]);
            m.insert_before(root, mul);
            terms.push(mul);
        }
    }
    if let Some(c) = const_acc {
        if !neutral {
            terms.push(m.const_int(c as i32));
        }
    }
    if terms.is_empty() {
        terms.push(m.const_int(if op == Opcode::Add { 0 } else { 1 }));
    }

    let mut acc = terms[0];
    for &t in &terms[1..] {
        let next = m.create_inst(op, ty, &[acc, t]);
        m.insert_before(root, next);
        acc = next;
    }
    m.replace_all_uses_with(root, acc);
    m.erase_inst(root);
    // Interior nodes are single-use and now dead.
    for node in interior {
        if m.uses(node).is_empty() && m.inst_parent(node).is_some() {
            m.erase_inst(node);
        }
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse::parse_module;
    use crate::ir::verify::verify;
    use crate::passes::constfold;

    #[test]
    fn x_plus_x_becomes_multiply() {
        let mut m = parse_module(
            r#"
define i32 @f(i32 %a, i32 %b) {
entry:
  %t = add i32 %a, %b
  %s = add i32 %t, %t
  ret i32 %s
}
"#,
        )
        .unwrap();
        let f = m.find_function("f").unwrap();
        assert_eq!(run_function(&mut m, f), 1);
        verify(&m).unwrap();
        let insts = m.all_insts(f);
        let mul = insts.iter().find(|&&i| m.opcode(i) == Some(Opcode::Mul)).copied().unwrap();
        let two = m.const_int(2);
        assert_eq!(m.operands(mul)[1], two);
    }

    #[test]
    fn scattered_constants_meet() {
        // (a + 1) + (b + 2) -> a + b + 3
        let mut m = parse_module(
            r#"
define i32 @f(i32 %a, i32 %b) {
entry:
  %x = add i32 %a, 1
  %y = add i32 %b, 2
  %s = add i32 %x, %y
  ret i32 %s
}
"#,
        )
        .unwrap();
        let f = m.find_function("f").unwrap();
        assert_eq!(run_function(&mut m, f), 1);
        constfold::fold_function(&mut m, f);
        verify(&m).unwrap();
        // The chain now ends adding the folded constant 3.
        let insts = m.all_insts(f);
        let last_add = insts[insts.len() - 2];
        let three = m.const_int(3);
        assert_eq!(m.operands(last_add)[1], three);
    }

    #[test]
    fn plain_two_operand_add_is_untouched() {
        let mut m = parse_module(
            r#"
define i32 @f(i32 %a, i32 %b) {
entry:
  %s = add i32 %a, %b
  ret i32 %s
}
"#,
        )
        .unwrap();
        let f = m.find_function("f").unwrap();
        assert_eq!(run_function(&mut m, f), 0);
    }
}
