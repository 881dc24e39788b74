//! Statement lowering.
//!
//! Structured control flow lowers through the builder's block stacks:
//! `while` pushes its header/exit pair for `continue`/`break`, conditions
//! go through the short-circuit target stacks. Statements after a
//! terminator in the same block are unreachable and skipped.

use crate::ast::{Block, BlockItem, Expr, Span, Stmt};
use crate::error::{MidendError, Result};
use crate::ir::Ty;

use super::expr::Place;
use super::IrGen;

impl<'m> IrGen<'m> {
    pub(crate) fn block(&mut self, b: &Block) -> Result<()> {
        self.push_scope();
        for item in &b.items {
            if self.b.block_terminated() {
                // Unreachable tail of the block.
                break;
            }
            match item {
                BlockItem::Decl(d) => self.local_decl(d)?,
                BlockItem::Stmt(s) => self.stmt(s)?,
            }
        }
        self.pop_scope();
        Ok(())
    }

    pub(crate) fn stmt(&mut self, s: &Stmt) -> Result<()> {
        match s {
            Stmt::Assign { target, value, span } => self.assign(target, value, *span),
            Stmt::Expr(e) => {
                if let Some(e) = e {
                    self.lower_expr(e)?;
                }
                Ok(())
            }
            Stmt::Block(b) => self.block(b),
            Stmt::If { cond, then_branch, else_branch, .. } => {
                self.if_stmt(cond, then_branch, else_branch.as_deref())
            }
            Stmt::While { cond, body, .. } => self.while_stmt(cond, body),
            Stmt::Break(span) => {
                let Some(exit) = self.b.exit() else {
                    return Err(MidendError::Source(format!(
                        "break outside of a loop at {}:{}",
                        span.line, span.col
                    )));
                };
                self.b.make_br(exit);
                Ok(())
            }
            Stmt::Continue(span) => {
                let Some(header) = self.b.header() else {
                    return Err(MidendError::Source(format!(
                        "continue outside of a loop at {}:{}",
                        span.line, span.col
                    )));
                };
                self.b.make_br(header);
                Ok(())
            }
            Stmt::Return { value, span } => self.return_stmt(value.as_ref(), *span),
        }
    }

    fn assign(&mut self, target: &crate::ast::LVal, value: &Expr, span: Span) -> Result<()> {
        let place = self.lower_lval(target)?;
        let addr = match place {
            Place::Addr(a) => a,
            Place::ArrayPtr(_) | Place::Folded(..) => {
                return Err(MidendError::type_error(
                    format!("'{}' is not assignable", target.name),
                    span.line,
                    span.col,
                ));
            }
        };
        // Writes through const storage are rejected at the symbol level:
        // const scalars fold (Folded above) and const arrays fold or are
        // global constants.
        if let Some(g) = self.b.module.value(addr).global() {
            if g.is_const {
                return Err(MidendError::type_error(
                    format!("assignment to const '{}'", target.name),
                    span.line,
                    span.col,
                ));
            }
        }
        let elem_ty = self
            .b
            .module
            .types
            .pointee(self.b.module.ty(addr))
            .expect("assignment target is a pointer");
        let v = self.lower_expr(value)?;
        let v = self.b.promote(v, elem_ty)?;
        self.b.make_store(v, addr);
        Ok(())
    }

    fn if_stmt(&mut self, cond: &Expr, then_branch: &Stmt, else_branch: Option<&Stmt>) -> Result<()> {
        let n = self.b.next_if();
        let then_bb = self.b.new_block(&format!("if.then{n}"));
        let end_bb = self.b.new_block(&format!("if.end{n}"));
        let else_bb = if else_branch.is_some() {
            self.b.new_block(&format!("if.else{n}"))
        } else {
            end_bb
        };

        self.b.push_tf(then_bb, else_bb);
        self.lower_cond(cond)?;
        self.b.pop_tf();

        self.b.set_insert_end(then_bb);
        self.stmt(then_branch)?;
        if !self.b.block_terminated() {
            self.b.make_br(end_bb);
        }

        if let Some(e) = else_branch {
            self.b.set_insert_end(else_bb);
            self.stmt(e)?;
            if !self.b.block_terminated() {
                self.b.make_br(end_bb);
            }
        }

        self.b.set_insert_end(end_bb);
        Ok(())
    }

    fn while_stmt(&mut self, cond: &Expr, body: &Stmt) -> Result<()> {
        let n = self.b.next_while();
        let header = self.b.new_block(&format!("while.cond{n}"));
        let body_bb = self.b.new_block(&format!("while.body{n}"));
        let exit = self.b.new_block(&format!("while.end{n}"));

        self.b.make_br(header);
        self.b.set_insert_end(header);
        self.b.push_tf(body_bb, exit);
        self.lower_cond(cond)?;
        self.b.pop_tf();

        self.b.set_insert_end(body_bb);
        self.b.push_loop(header, exit);
        self.stmt(body)?;
        self.b.pop_loop();
        if !self.b.block_terminated() {
            self.b.make_br(header);
        }

        self.b.set_insert_end(exit);
        Ok(())
    }

    fn return_stmt(&mut self, value: Option<&Expr>, span: Span) -> Result<()> {
        match (value, self.cur_ret) {
            (None, Ty::VOID) => {
                self.b.make_ret(None);
                Ok(())
            }
            (Some(_), Ty::VOID) => Err(MidendError::type_error(
                "void function returns a value",
                span.line,
                span.col,
            )),
            (None, _) => Err(MidendError::type_error(
                "non-void function returns nothing",
                span.line,
                span.col,
            )),
            (Some(e), ret) => {
                let v = self.lower_expr(e)?;
                let v = self.b.promote(v, ret)?;
                self.b.make_ret(Some(v));
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::ast::*;
    use crate::ir::dump::print_module;
    use crate::ir::verify::verify;
    use crate::ir::{Opcode, Ty};
    use crate::irgen::generate;

    fn body(items: Vec<BlockItem>) -> Block {
        Block { items }
    }

    fn main_with(items: Vec<BlockItem>) -> CompUnit {
        CompUnit {
            items: vec![Item::Func(FuncDef::new(Some(BType::Int), "main", vec![], body(items)))],
        }
    }

    #[test]
    fn return_constant_program() {
        // int main() { return 1; }
        let ast = main_with(vec![BlockItem::Stmt(Stmt::ret(Some(Expr::int(1))))]);
        let m = generate(&ast).unwrap();
        verify(&m).unwrap();
        let main = m.find_function("main").unwrap();
        assert_eq!(m.func_blocks(main).len(), 1);
        let entry = m.entry_block(main).unwrap();
        let term = m.terminator(entry).unwrap();
        assert_eq!(m.opcode(term), Some(Opcode::Ret));
        assert_eq!(m.const_kind(m.operands(term)[0]).unwrap().as_int(), Some(1));
    }

    #[test]
    fn dead_store_program_shape() {
        // int main() { int x = 1; x = 2; return x; }
        let ast = main_with(vec![
            BlockItem::Decl(Decl::var(BType::Int, "x", Some(Expr::int(1)))),
            BlockItem::Stmt(Stmt::assign(LVal::scalar("x"), Expr::int(2))),
            BlockItem::Stmt(Stmt::ret(Some(Expr::var("x")))),
        ]);
        let m = generate(&ast).unwrap();
        verify(&m).unwrap();
        let main = m.find_function("main").unwrap();
        let entry = m.entry_block(main).unwrap();
        let stores = m
            .block_insts(entry)
            .iter()
            .filter(|&&i| m.opcode(i) == Some(Opcode::Store))
            .count();
        assert_eq!(stores, 2);
    }

    #[test]
    fn while_loop_with_break_and_continue() {
        // int main() { int i = 0; while (i < 10) { i = i + 1;
        //   if (i == 5) continue; if (i == 8) break; } return i; }
        let loop_body = Stmt::Block(body(vec![
            BlockItem::Stmt(Stmt::assign(
                LVal::scalar("i"),
                Expr::binary(BinOp::Add, Expr::var("i"), Expr::int(1)),
            )),
            BlockItem::Stmt(Stmt::if_else(
                Expr::binary(BinOp::Eq, Expr::var("i"), Expr::int(5)),
                Stmt::Continue(Span::default()),
                None,
            )),
            BlockItem::Stmt(Stmt::if_else(
                Expr::binary(BinOp::Eq, Expr::var("i"), Expr::int(8)),
                Stmt::Break(Span::default()),
                None,
            )),
        ]));
        let ast = main_with(vec![
            BlockItem::Decl(Decl::var(BType::Int, "i", Some(Expr::int(0)))),
            BlockItem::Stmt(Stmt::while_loop(
                Expr::binary(BinOp::Lt, Expr::var("i"), Expr::int(10)),
                loop_body,
            )),
            BlockItem::Stmt(Stmt::ret(Some(Expr::var("i")))),
        ]);
        let m = generate(&ast).unwrap();
        verify(&m).unwrap();
    }

    #[test]
    fn short_circuit_and_lowers_through_landing_block() {
        // int main() { int a = getint(); if (a > 0 && a < 9) return 1;
        //   return 0; }
        let cond = Expr::binary(
            BinOp::And,
            Expr::binary(BinOp::Gt, Expr::var("a"), Expr::int(0)),
            Expr::binary(BinOp::Lt, Expr::var("a"), Expr::int(9)),
        );
        let ast = main_with(vec![
            BlockItem::Decl(Decl::var(BType::Int, "a", Some(Expr::call("getint", vec![])))),
            BlockItem::Stmt(Stmt::if_else(cond, Stmt::ret(Some(Expr::int(1))), None)),
            BlockItem::Stmt(Stmt::ret(Some(Expr::int(0)))),
        ]);
        let m = generate(&ast).unwrap();
        verify(&m).unwrap();
        let text = print_module(&m);
        // Two conditional branches, one landing block.
        assert!(text.contains("land.rhs"));
        assert_eq!(text.matches("br i1").count(), 2);
    }

    #[test]
    fn mixed_arithmetic_promotes_to_float() {
        // float f(int x) { return x + 0.5; }
        let f = FuncDef::new(
            Some(BType::Float),
            "f",
            vec![FuncParam::scalar(BType::Int, "x")],
            body(vec![BlockItem::Stmt(Stmt::ret(Some(Expr::binary(
                BinOp::Add,
                Expr::var("x"),
                Expr::float(0.5),
            ))))]),
        );
        let m = generate(&CompUnit { items: vec![Item::Func(f)] }).unwrap();
        verify(&m).unwrap();
        let func = m.find_function("f").unwrap();
        let insts = m.all_insts(func);
        assert!(insts.iter().any(|&i| m.opcode(i) == Some(Opcode::SiToFp)));
        assert!(insts.iter().any(|&i| m.opcode(i) == Some(Opcode::FAdd)));
        assert_eq!(m.fn_return_ty(func), Ty::F32);
    }

    #[test]
    fn array_param_and_element_assignment() {
        // void fill(int a[], int n) { int i = 0;
        //   while (i < n) { a[i] = i; i = i + 1; } }
        let loop_body = Stmt::Block(body(vec![
            BlockItem::Stmt(Stmt::assign(
                LVal::indexed("a", vec![Expr::var("i")]),
                Expr::var("i"),
            )),
            BlockItem::Stmt(Stmt::assign(
                LVal::scalar("i"),
                Expr::binary(BinOp::Add, Expr::var("i"), Expr::int(1)),
            )),
        ]));
        let f = FuncDef::new(
            None,
            "fill",
            vec![
                FuncParam::array(BType::Int, "a", vec![]),
                FuncParam::scalar(BType::Int, "n"),
            ],
            body(vec![
                BlockItem::Decl(Decl::var(BType::Int, "i", Some(Expr::int(0)))),
                BlockItem::Stmt(Stmt::while_loop(
                    Expr::binary(BinOp::Lt, Expr::var("i"), Expr::var("n")),
                    loop_body,
                )),
            ]),
        );
        let m = generate(&CompUnit { items: vec![Item::Func(f)] }).unwrap();
        verify(&m).unwrap();
        let func = m.find_function("fill").unwrap();
        let insts = m.all_insts(func);
        assert!(insts.iter().any(|&i| m.opcode(i) == Some(Opcode::GetElementPtr)));
    }

    #[test]
    fn const_array_subscript_folds() {
        // const int t[3] = {10, 20, 30}; int main() { return t[1]; }
        let ast = CompUnit {
            items: vec![
                Item::Decl(Decl {
                    is_const: true,
                    btype: BType::Int,
                    defs: vec![VarDef {
                        name: "t".into(),
                        dims: vec![Expr::int(3)],
                        init: Some(InitVal::List(vec![
                            InitVal::Expr(Expr::int(10)),
                            InitVal::Expr(Expr::int(20)),
                            InitVal::Expr(Expr::int(30)),
                        ])),
                        span: Span::default(),
                    }],
                }),
                Item::Func(FuncDef::new(
                    Some(BType::Int),
                    "main",
                    vec![],
                    body(vec![BlockItem::Stmt(Stmt::ret(Some(Expr::index(
                        "t",
                        vec![Expr::int(1)],
                    ))))]),
                )),
            ],
        };
        let m = generate(&ast).unwrap();
        verify(&m).unwrap();
        let main = m.find_function("main").unwrap();
        let entry = m.entry_block(main).unwrap();
        let term = m.terminator(entry).unwrap();
        assert_eq!(m.const_kind(m.operands(term)[0]).unwrap().as_int(), Some(20));
    }
}
