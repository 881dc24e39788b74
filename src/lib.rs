//! SysY middle end: a strongly-typed SSA intermediate representation, a
//! cached analysis framework, and the optimization pipeline between the
//! parser and the machine-IR lowering stage.
//!
//! The driver hands [`compile`] a parsed [`ast::CompUnit`] and a
//! [`config::Config`]; back comes a verified [`ir::Module`] ready for
//! lowering. The IR surface (builder, textual dump/reader, verifier) and
//! the pass manager are public so the surrounding tooling can drive them
//! directly.

pub mod analysis;
pub mod ast;
pub mod config;
pub mod error;
pub mod ir;
pub mod irgen;
pub mod passes;

use analysis::AnalysisManager;
use config::Config;
use error::Result;
use ir::verify::verify;
use ir::Module;
use passes::PassManager;

/// Translate, optimize, and verify one compilation unit.
pub fn compile(ast: &ast::CompUnit, cfg: &Config) -> Result<Module> {
    let mut module = irgen::generate(ast)?;
    verify(&module)?;

    let mut am = AnalysisManager::new();
    let pm = PassManager::new();
    pm.run_pipeline(&mut module, &mut am, cfg)?;
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::*;
    use crate::config::OptLevel;
    use crate::ir::dump::print_module;
    use crate::ir::{Opcode, Value};

    fn body(items: Vec<BlockItem>) -> Block {
        Block { items }
    }

    fn main_fn(items: Vec<BlockItem>) -> Item {
        Item::Func(FuncDef::new(Some(BType::Int), "main", vec![], body(items)))
    }

    fn count_op(m: &Module, f: Value, op: Opcode) -> usize {
        m.all_insts(f).iter().filter(|&&i| m.opcode(i) == Some(op)).count()
    }

    fn ret_const_of_main(m: &Module) -> Option<i64> {
        let main = m.find_function("main")?;
        if m.func_blocks(main).len() != 1 {
            return None;
        }
        let term = m.terminator(m.entry_block(main)?)?;
        if m.opcode(term) != Some(Opcode::Ret) {
            return None;
        }
        m.const_kind(*m.operands(term).first()?)?.as_int()
    }

    /// int main() { return 1; }
    #[test]
    fn return_constant_survives_the_whole_pipeline() {
        let ast = CompUnit {
            items: vec![main_fn(vec![BlockItem::Stmt(Stmt::ret(Some(Expr::int(1))))])],
        };
        for level in [OptLevel::O0, OptLevel::O1, OptLevel::O2, OptLevel::O3] {
            let m = compile(&ast, &Config { debug_ir: true, ..Config::at_level(level) }).unwrap();
            assert_eq!(ret_const_of_main(&m), Some(1), "level {level:?}");
        }
    }

    /// int main() { int x = 1; x = 2; return x; }
    #[test]
    fn dead_store_is_removed_and_value_propagates() {
        let ast = CompUnit {
            items: vec![main_fn(vec![
                BlockItem::Decl(Decl::var(BType::Int, "x", Some(Expr::int(1)))),
                BlockItem::Stmt(Stmt::assign(LVal::scalar("x"), Expr::int(2))),
                BlockItem::Stmt(Stmt::ret(Some(Expr::var("x")))),
            ])],
        };
        let m = compile(&ast, &Config { debug_ir: true, ..Config::at_level(OptLevel::O2) }).unwrap();
        let main = m.find_function("main").unwrap();
        assert_eq!(count_op(&m, main, Opcode::Store), 0);
        assert_eq!(count_op(&m, main, Opcode::Alloca), 0);
        assert_eq!(ret_const_of_main(&m), Some(2));
    }

    /// int f(int a) { if (1) return a + 0; else return a * 0; }
    /// int main() { return f(7); }
    #[test]
    fn constant_condition_folds_through_inlining() {
        let f = Item::Func(FuncDef::new(
            Some(BType::Int),
            "f",
            vec![FuncParam::scalar(BType::Int, "a")],
            body(vec![BlockItem::Stmt(Stmt::if_else(
                Expr::int(1),
                Stmt::ret(Some(Expr::binary(BinOp::Add, Expr::var("a"), Expr::int(0)))),
                Some(Stmt::ret(Some(Expr::binary(BinOp::Mul, Expr::var("a"), Expr::int(0))))),
            ))]),
        ));
        let ast = CompUnit {
            items: vec![
                f,
                main_fn(vec![BlockItem::Stmt(Stmt::ret(Some(Expr::call(
                    "f",
                    vec![Expr::int(7)],
                ))))]),
            ],
        };
        let m = compile(&ast, &Config { debug_ir: true, ..Config::at_level(OptLevel::O2) }).unwrap();
        let main = m.find_function("main").unwrap();
        assert_eq!(count_op(&m, main, Opcode::Call), 0);
        assert_eq!(count_op(&m, main, Opcode::CondBr), 0);
        assert_eq!(ret_const_of_main(&m), Some(7));
    }

    /// int main() { int s = 0; int i = 0;
    ///   while (i < 10) { s = s + i; i = i + 1; } return s; }
    #[test]
    fn loop_sum_fully_unrolls_to_45() {
        let loop_body = Stmt::Block(body(vec![
            BlockItem::Stmt(Stmt::assign(
                LVal::scalar("s"),
                Expr::binary(BinOp::Add, Expr::var("s"), Expr::var("i")),
            )),
            BlockItem::Stmt(Stmt::assign(
                LVal::scalar("i"),
                Expr::binary(BinOp::Add, Expr::var("i"), Expr::int(1)),
            )),
        ]));
        let ast = CompUnit {
            items: vec![main_fn(vec![
                BlockItem::Decl(Decl::var(BType::Int, "s", Some(Expr::int(0)))),
                BlockItem::Decl(Decl::var(BType::Int, "i", Some(Expr::int(0)))),
                BlockItem::Stmt(Stmt::while_loop(
                    Expr::binary(BinOp::Lt, Expr::var("i"), Expr::int(10)),
                    loop_body,
                )),
                BlockItem::Stmt(Stmt::ret(Some(Expr::var("s")))),
            ])],
        };
        let m = compile(&ast, &Config { debug_ir: true, ..Config::at_level(OptLevel::O3) }).unwrap();
        assert_eq!(ret_const_of_main(&m), Some(45));
    }

    /// int f(int a, int b) { return (a + b) + (b + a); }
    #[test]
    fn gvn_unifies_commutative_adds() {
        let f = Item::Func(FuncDef::new(
            Some(BType::Int),
            "f",
            vec![
                FuncParam::scalar(BType::Int, "a"),
                FuncParam::scalar(BType::Int, "b"),
            ],
            body(vec![BlockItem::Stmt(Stmt::ret(Some(Expr::binary(
                BinOp::Add,
                Expr::binary(BinOp::Add, Expr::var("a"), Expr::var("b")),
                Expr::binary(BinOp::Add, Expr::var("b"), Expr::var("a")),
            ))))]),
        ));
        let ast = CompUnit { items: vec![f] };
        let m = compile(&ast, &Config { debug_ir: true, ..Config::at_level(OptLevel::O2) }).unwrap();
        let f = m.find_function("f").unwrap();
        // One add computing a+b, one multiply by two.
        assert_eq!(count_op(&m, f, Opcode::Add), 1);
        assert_eq!(count_op(&m, f, Opcode::Mul), 1);
        let text = print_module(&m);
        assert!(text.contains("mul i32"));
    }

    /// Matrix product: the inner loops carry no dependence and the outer
    /// loop becomes a parallel-for invocation.
    #[test]
    fn matmul_outer_loop_parallelizes() {
        // int a[8][8], b[8][8], c[8][8] as globals; main computes
        // c[i][j] += a[i][k] * b[k][j] over the triple loop.
        let dims = || vec![Expr::int(8), Expr::int(8)];
        let idx2 = |name: &str, i: &str, j: &str| Expr::index(name, vec![Expr::var(i), Expr::var(j)]);
        let k_body = Stmt::Block(body(vec![
            BlockItem::Stmt(Stmt::assign(
                LVal::indexed("c", vec![Expr::var("i"), Expr::var("j")]),
                Expr::binary(
                    BinOp::Add,
                    idx2("c", "i", "j"),
                    Expr::binary(BinOp::Mul, idx2("a", "i", "k"), idx2("b", "k", "j")),
                ),
            )),
            BlockItem::Stmt(Stmt::assign(
                LVal::scalar("k"),
                Expr::binary(BinOp::Add, Expr::var("k"), Expr::int(1)),
            )),
        ]));
        let j_body = Stmt::Block(body(vec![
            BlockItem::Decl(Decl::var(BType::Int, "k", Some(Expr::int(0)))),
            BlockItem::Stmt(Stmt::while_loop(
                Expr::binary(BinOp::Lt, Expr::var("k"), Expr::int(8)),
                k_body,
            )),
            BlockItem::Stmt(Stmt::assign(
                LVal::scalar("j"),
                Expr::binary(BinOp::Add, Expr::var("j"), Expr::int(1)),
            )),
        ]));
        let i_body = Stmt::Block(body(vec![
            BlockItem::Decl(Decl::var(BType::Int, "j", Some(Expr::int(0)))),
            BlockItem::Stmt(Stmt::while_loop(
                Expr::binary(BinOp::Lt, Expr::var("j"), Expr::int(8)),
                j_body,
            )),
            BlockItem::Stmt(Stmt::assign(
                LVal::scalar("i"),
                Expr::binary(BinOp::Add, Expr::var("i"), Expr::int(1)),
            )),
        ]));
        let ast = CompUnit {
            items: vec![
                Item::Decl(Decl::array(BType::Int, "a", dims(), None)),
                Item::Decl(Decl::array(BType::Int, "b", dims(), None)),
                Item::Decl(Decl::array(BType::Int, "c", dims(), None)),
                main_fn(vec![
                    BlockItem::Decl(Decl::var(BType::Int, "i", Some(Expr::int(0)))),
                    BlockItem::Stmt(Stmt::while_loop(
                        Expr::binary(BinOp::Lt, Expr::var("i"), Expr::int(8)),
                        i_body,
                    )),
                    BlockItem::Stmt(Stmt::ret(Some(Expr::int(0)))),
                ]),
            ],
        };
        // Keep unrolling out of the way so the loop nest reaches the
        // parallelizer intact.
        let cfg = Config {
            debug_ir: true,
            unroll_full_threshold: 0,
            unroll_factor: 1,
            ..Config::at_level(OptLevel::O3)
        };
        let m = compile(&ast, &cfg).unwrap();
        let rt = m.find_function(passes::loop_parallel::RUNTIME_ENTRY);
        assert!(rt.is_some(), "no parallel-for call was emitted:\n{}", print_module(&m));
        let body_fn = m
            .functions
            .iter()
            .copied()
            .find(|&f| m.fn_attrs(f).contains(crate::ir::FnAttrs::PARALLEL_BODY));
        assert!(body_fn.is_some());
    }
}
