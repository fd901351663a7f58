//! Recursive-descent parser for the restricted code language.
//!
//! Parsing doubles as the security gate: identifiers with runtime reach
//! (process, filesystem, introspection) and imports outside the two allowed
//! modules are rejected here, so disallowed code never executes.

use std::sync::Arc;

use crate::error::EvalError;

use super::ast::{BinOp, BoolOpKind, CmpOp, CompClause, Expr, FuncDef, Stmt, Target};
use super::lexer::{AugOp, Kw, Spanned, Tok};

/// Names that would reach outside the sandbox. Using one anywhere — call
/// position or not — is a compile-time rejection.
const FORBIDDEN_NAMES: &[&str] = &[
    "open", "eval", "exec", "compile", "input", "globals", "locals", "vars", "dir", "getattr",
    "setattr", "delattr", "hasattr", "callable", "exit", "quit", "breakpoint", "help", "type",
    "super", "object", "memoryview", "bytearray", "bytes", "staticmethod", "classmethod",
    "property", "subprocess", "socket", "os", "sys", "shutil", "pathlib", "threading",
    "multiprocessing", "ctypes", "importlib", "builtins", "file",
];

const ALLOWED_MODULES: &[&str] = &["math", "numpy"];

pub fn parse_module(tokens: Vec<Spanned>) -> Result<Vec<Stmt>, EvalError> {
    let mut parser = Parser { tokens, pos: 0 };
    let mut stmts = Vec::new();
    while !parser.at(&Tok::Eof) {
        stmts.push(parser.parse_statement()?);
    }
    Ok(stmts)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        self.tokens
            .get(self.pos)
            .map(|s| &s.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn line(&self) -> usize {
        self.tokens.get(self.pos).map_or(0, |s| s.line)
    }

    fn at(&self, tok: &Tok) -> bool {
        self.peek() == tok
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        self.pos += 1;
        tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.at(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Tok, context: &str) -> Result<(), EvalError> {
        if self.eat(&tok) {
            Ok(())
        } else {
            Err(self.syntax(&format!("expected {tok:?} {context}, found {:?}", self.peek())))
        }
    }

    fn syntax(&self, msg: &str) -> EvalError {
        EvalError::Evaluation(format!("syntax error at line {}: {msg}", self.line()))
    }

    fn security(&self, msg: &str) -> EvalError {
        EvalError::Security(format!("{msg} (line {})", self.line()))
    }

    // ============================================================================================
    // Statements
    // ============================================================================================

    fn parse_statement(&mut self) -> Result<Stmt, EvalError> {
        match self.peek().clone() {
            Tok::Kw(Kw::If) => self.parse_if(),
            Tok::Kw(Kw::While) => self.parse_while(),
            Tok::Kw(Kw::For) => self.parse_for(),
            Tok::Kw(Kw::Def) => self.parse_def(),
            _ => {
                let stmt = self.parse_simple_statement()?;
                self.expect_end_of_statement()?;
                Ok(stmt)
            }
        }
    }

    fn expect_end_of_statement(&mut self) -> Result<(), EvalError> {
        if self.eat(&Tok::Newline) || self.at(&Tok::Eof) || self.at(&Tok::Dedent) {
            Ok(())
        } else {
            Err(self.syntax(&format!("unexpected {:?} after statement", self.peek())))
        }
    }

    fn parse_simple_statement(&mut self) -> Result<Stmt, EvalError> {
        match self.peek().clone() {
            Tok::Kw(Kw::Return) => {
                self.pos += 1;
                if self.at(&Tok::Newline) || self.at(&Tok::Eof) || self.at(&Tok::Dedent) {
                    Ok(Stmt::Return(None))
                } else {
                    Ok(Stmt::Return(Some(self.parse_testlist()?)))
                }
            }
            Tok::Kw(Kw::Break) => {
                self.pos += 1;
                Ok(Stmt::Break)
            }
            Tok::Kw(Kw::Continue) => {
                self.pos += 1;
                Ok(Stmt::Continue)
            }
            Tok::Kw(Kw::Pass) => {
                self.pos += 1;
                Ok(Stmt::Pass)
            }
            Tok::Kw(Kw::Import) => self.parse_import(),
            _ => {
                let first = self.parse_testlist()?;
                match self.peek().clone() {
                    Tok::Assign => {
                        self.pos += 1;
                        let target = self.expr_to_target(first)?;
                        let value = self.parse_testlist()?;
                        if self.at(&Tok::Assign) {
                            return Err(self.syntax("chained assignment is not supported"));
                        }
                        Ok(Stmt::Assign { target, value })
                    }
                    Tok::AugAssign(op) => {
                        self.pos += 1;
                        let target = self.expr_to_target(first)?;
                        if matches!(target, Target::Tuple(_)) {
                            return Err(
                                self.syntax("augmented assignment needs a single target")
                            );
                        }
                        let value = self.parse_testlist()?;
                        Ok(Stmt::AugAssign {
                            target,
                            op: aug_to_bin(op),
                            value,
                        })
                    }
                    _ => Ok(Stmt::Expr(first)),
                }
            }
        }
    }

    fn parse_import(&mut self) -> Result<Stmt, EvalError> {
        self.expect(Tok::Kw(Kw::Import), "to start import")?;
        let module = match self.advance() {
            Tok::Ident(name) => name,
            other => return Err(self.syntax(&format!("expected module name, found {other:?}"))),
        };
        if !ALLOWED_MODULES.contains(&module.as_str()) {
            return Err(self.security(&format!("import of '{module}' is not allowed")));
        }
        let alias = if self.eat(&Tok::Kw(Kw::As)) {
            match self.advance() {
                Tok::Ident(name) => Some(name),
                other => {
                    return Err(self.syntax(&format!("expected alias name, found {other:?}")));
                }
            }
        } else {
            None
        };
        Ok(Stmt::Import { module, alias })
    }

    fn parse_if(&mut self) -> Result<Stmt, EvalError> {
        self.expect(Tok::Kw(Kw::If), "to start conditional")?;
        let mut branches = Vec::new();
        let cond = self.parse_test()?;
        let body = self.parse_suite()?;
        branches.push((cond, body));
        let mut orelse = Vec::new();
        loop {
            if self.eat(&Tok::Kw(Kw::Elif)) {
                let cond = self.parse_test()?;
                let body = self.parse_suite()?;
                branches.push((cond, body));
            } else if self.eat(&Tok::Kw(Kw::Else)) {
                orelse = self.parse_suite()?;
                break;
            } else {
                break;
            }
        }
        Ok(Stmt::If { branches, orelse })
    }

    fn parse_while(&mut self) -> Result<Stmt, EvalError> {
        self.expect(Tok::Kw(Kw::While), "to start loop")?;
        let cond = self.parse_test()?;
        let body = self.parse_suite()?;
        Ok(Stmt::While { cond, body })
    }

    fn parse_for(&mut self) -> Result<Stmt, EvalError> {
        self.expect(Tok::Kw(Kw::For), "to start loop")?;
        let target = self.parse_target_list()?;
        self.expect(Tok::Kw(Kw::In), "in for loop")?;
        let iter = self.parse_testlist()?;
        let body = self.parse_suite()?;
        Ok(Stmt::For { target, iter, body })
    }

    fn parse_def(&mut self) -> Result<Stmt, EvalError> {
        self.expect(Tok::Kw(Kw::Def), "to start function definition")?;
        let name = match self.advance() {
            Tok::Ident(name) => name,
            other => {
                return Err(self.syntax(&format!("expected function name, found {other:?}")));
            }
        };
        self.expect(Tok::LParen, "after function name")?;
        let mut params = Vec::new();
        while !self.at(&Tok::RParen) {
            match self.advance() {
                Tok::Ident(param) => params.push(param),
                other => {
                    return Err(self.syntax(&format!("expected parameter name, found {other:?}")));
                }
            }
            if !self.eat(&Tok::Comma) {
                break;
            }
        }
        self.expect(Tok::RParen, "after parameters")?;
        let body = self.parse_suite()?;
        Ok(Stmt::FuncDef(Arc::new(FuncDef { name, params, body })))
    }

    /// `:` followed by an indented block or a single inline statement
    /// (`while True: pass`).
    fn parse_suite(&mut self) -> Result<Vec<Stmt>, EvalError> {
        self.expect(Tok::Colon, "before block")?;
        if self.eat(&Tok::Newline) {
            self.expect(Tok::Indent, "for block body")?;
            let mut body = Vec::new();
            while !self.eat(&Tok::Dedent) {
                if self.at(&Tok::Eof) {
                    return Err(self.syntax("unexpected end of block"));
                }
                body.push(self.parse_statement()?);
            }
            Ok(body)
        } else {
            let stmt = self.parse_simple_statement()?;
            self.expect_end_of_statement()?;
            Ok(vec![stmt])
        }
    }

    // ============================================================================================
    // Targets
    // ============================================================================================

    fn parse_target_list(&mut self) -> Result<Target, EvalError> {
        let mut targets = vec![self.parse_single_target()?];
        while self.eat(&Tok::Comma) {
            targets.push(self.parse_single_target()?);
        }
        if targets.len() == 1 {
            Ok(targets.pop().expect("non-empty"))
        } else {
            Ok(Target::Tuple(targets))
        }
    }

    fn parse_single_target(&mut self) -> Result<Target, EvalError> {
        if self.eat(&Tok::LParen) {
            let inner = self.parse_target_list()?;
            self.expect(Tok::RParen, "after target list")?;
            return Ok(inner);
        }
        match self.advance() {
            Tok::Ident(name) => {
                self.check_name(&name)?;
                Ok(Target::Name(name))
            }
            other => Err(self.syntax(&format!("invalid assignment target {other:?}"))),
        }
    }

    fn expr_to_target(&self, expr: Expr) -> Result<Target, EvalError> {
        match expr {
            Expr::Name(name) => Ok(Target::Name(name)),
            Expr::Tuple(items) | Expr::List(items) => {
                let targets = items
                    .into_iter()
                    .map(|e| self.expr_to_target(e))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Target::Tuple(targets))
            }
            Expr::Subscript { value, index } => Ok(Target::Subscript {
                value: *value,
                index: *index,
            }),
            other => Err(self.syntax(&format!("cannot assign to {other:?}"))),
        }
    }

    // ============================================================================================
    // Expressions
    // ============================================================================================

    /// Comma-separated expressions collapse into a tuple.
    fn parse_testlist(&mut self) -> Result<Expr, EvalError> {
        let first = self.parse_test()?;
        if !self.at(&Tok::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&Tok::Comma) {
            if is_expression_end(self.peek()) {
                break;
            }
            items.push(self.parse_test()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn parse_test(&mut self) -> Result<Expr, EvalError> {
        let body = self.parse_or()?;
        if self.eat(&Tok::Kw(Kw::If)) {
            let cond = self.parse_or()?;
            self.expect(Tok::Kw(Kw::Else), "in conditional expression")?;
            let orelse = self.parse_test()?;
            return Ok(Expr::Ternary {
                cond: Box::new(cond),
                then: Box::new(body),
                orelse: Box::new(orelse),
            });
        }
        Ok(body)
    }

    fn parse_or(&mut self) -> Result<Expr, EvalError> {
        let first = self.parse_and()?;
        if !self.at(&Tok::Kw(Kw::Or)) {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat(&Tok::Kw(Kw::Or)) {
            values.push(self.parse_and()?);
        }
        Ok(Expr::BoolOp {
            op: BoolOpKind::Or,
            values,
        })
    }

    fn parse_and(&mut self) -> Result<Expr, EvalError> {
        let first = self.parse_not()?;
        if !self.at(&Tok::Kw(Kw::And)) {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat(&Tok::Kw(Kw::And)) {
            values.push(self.parse_not()?);
        }
        Ok(Expr::BoolOp {
            op: BoolOpKind::And,
            values,
        })
    }

    fn parse_not(&mut self) -> Result<Expr, EvalError> {
        if self.eat(&Tok::Kw(Kw::Not)) {
            Ok(Expr::Not(Box::new(self.parse_not()?)))
        } else {
            self.parse_comparison()
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, EvalError> {
        let left = self.parse_arith()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek() {
                Tok::Eq => CmpOp::Eq,
                Tok::Ne => CmpOp::Ne,
                Tok::Lt => CmpOp::Lt,
                Tok::Le => CmpOp::Le,
                Tok::Gt => CmpOp::Gt,
                Tok::Ge => CmpOp::Ge,
                Tok::Kw(Kw::In) => CmpOp::In,
                Tok::Kw(Kw::Not) => {
                    self.pos += 1;
                    if self.at(&Tok::Kw(Kw::In)) {
                        CmpOp::NotIn
                    } else {
                        return Err(self.syntax("expected 'in' after 'not'"));
                    }
                }
                _ => break,
            };
            self.pos += 1;
            rest.push((op, self.parse_arith()?));
        }
        if rest.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare {
                left: Box::new(left),
                rest,
            })
        }
    }

    fn parse_arith(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Tok::Plus => BinOp::Add,
                Tok::Minus => BinOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_term()?;
            left = Expr::Bin {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn parse_term(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Tok::Star => BinOp::Mul,
                Tok::Slash => BinOp::Div,
                Tok::DblSlash => BinOp::FloorDiv,
                Tok::Percent => BinOp::Mod,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Bin {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, EvalError> {
        match self.peek() {
            Tok::Minus => {
                self.pos += 1;
                Ok(Expr::Unary {
                    negate: true,
                    operand: Box::new(self.parse_unary()?),
                })
            }
            Tok::Plus => {
                self.pos += 1;
                self.parse_unary()
            }
            _ => self.parse_power(),
        }
    }

    fn parse_power(&mut self) -> Result<Expr, EvalError> {
        let base = self.parse_postfix()?;
        if self.eat(&Tok::DblStar) {
            let exp = self.parse_unary()?;
            return Ok(Expr::Bin {
                op: BinOp::Pow,
                left: Box::new(base),
                right: Box::new(exp),
            });
        }
        Ok(base)
    }

    fn parse_postfix(&mut self) -> Result<Expr, EvalError> {
        let mut expr = self.parse_atom()?;
        loop {
            match self.peek().clone() {
                Tok::LParen => {
                    self.pos += 1;
                    let mut args = Vec::new();
                    while !self.at(&Tok::RParen) {
                        args.push(self.parse_test()?);
                        if !self.eat(&Tok::Comma) {
                            break;
                        }
                    }
                    self.expect(Tok::RParen, "after call arguments")?;
                    expr = Expr::Call {
                        func: Box::new(expr),
                        args,
                    };
                }
                Tok::Dot => {
                    self.pos += 1;
                    let attr = match self.advance() {
                        Tok::Ident(name) => name,
                        other => {
                            return Err(
                                self.syntax(&format!("expected attribute name, found {other:?}"))
                            );
                        }
                    };
                    if attr.starts_with('_') {
                        return Err(self.security(&format!(
                            "access to underscore attribute '{attr}' is not allowed"
                        )));
                    }
                    expr = Expr::Attribute {
                        value: Box::new(expr),
                        attr,
                    };
                }
                Tok::LBracket => {
                    self.pos += 1;
                    let index = self.parse_test()?;
                    if self.at(&Tok::Colon) {
                        return Err(self.syntax("slices are not supported"));
                    }
                    self.expect(Tok::RBracket, "after subscript")?;
                    expr = Expr::Subscript {
                        value: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_atom(&mut self) -> Result<Expr, EvalError> {
        match self.advance() {
            Tok::Int(v) => Ok(Expr::Int(v)),
            Tok::Float(v) => Ok(Expr::Float(v)),
            Tok::Str(v) => Ok(Expr::Str(v)),
            Tok::Kw(Kw::True) => Ok(Expr::Bool(true)),
            Tok::Kw(Kw::False) => Ok(Expr::Bool(false)),
            Tok::Kw(Kw::None) => Ok(Expr::NoneLit),
            Tok::Ident(name) => {
                self.check_name(&name)?;
                Ok(Expr::Name(name))
            }
            Tok::LParen => {
                if self.eat(&Tok::RParen) {
                    return Ok(Expr::Tuple(Vec::new()));
                }
                let first = self.parse_test()?;
                if self.at(&Tok::Comma) {
                    let mut items = vec![first];
                    while self.eat(&Tok::Comma) {
                        if self.at(&Tok::RParen) {
                            break;
                        }
                        items.push(self.parse_test()?);
                    }
                    self.expect(Tok::RParen, "after tuple")?;
                    return Ok(Expr::Tuple(items));
                }
                self.expect(Tok::RParen, "after parenthesized expression")?;
                Ok(first)
            }
            Tok::LBracket => self.parse_list_or_comp(),
            Tok::LBrace => self.parse_brace_display(),
            other => Err(self.syntax(&format!("unexpected {other:?}"))),
        }
    }

    fn parse_list_or_comp(&mut self) -> Result<Expr, EvalError> {
        if self.eat(&Tok::RBracket) {
            return Ok(Expr::List(Vec::new()));
        }
        let first = self.parse_test()?;
        if self.at(&Tok::Kw(Kw::For)) {
            let clauses = self.parse_comp_clauses()?;
            self.expect(Tok::RBracket, "after comprehension")?;
            return Ok(Expr::ListComp {
                elt: Box::new(first),
                clauses,
            });
        }
        let mut items = vec![first];
        while self.eat(&Tok::Comma) {
            if self.at(&Tok::RBracket) {
                break;
            }
            items.push(self.parse_test()?);
        }
        self.expect(Tok::RBracket, "after list")?;
        Ok(Expr::List(items))
    }

    fn parse_brace_display(&mut self) -> Result<Expr, EvalError> {
        if self.eat(&Tok::RBrace) {
            return Ok(Expr::Dict(Vec::new()));
        }
        let first = self.parse_test()?;
        if self.eat(&Tok::Colon) {
            let value = self.parse_test()?;
            if self.at(&Tok::Kw(Kw::For)) {
                let clauses = self.parse_comp_clauses()?;
                self.expect(Tok::RBrace, "after dict comprehension")?;
                return Ok(Expr::DictComp {
                    key: Box::new(first),
                    value: Box::new(value),
                    clauses,
                });
            }
            let mut pairs = vec![(first, value)];
            while self.eat(&Tok::Comma) {
                if self.at(&Tok::RBrace) {
                    break;
                }
                let key = self.parse_test()?;
                self.expect(Tok::Colon, "in dict entry")?;
                let value = self.parse_test()?;
                pairs.push((key, value));
            }
            self.expect(Tok::RBrace, "after dict")?;
            return Ok(Expr::Dict(pairs));
        }
        if self.at(&Tok::Kw(Kw::For)) {
            let clauses = self.parse_comp_clauses()?;
            self.expect(Tok::RBrace, "after set comprehension")?;
            return Ok(Expr::SetComp {
                elt: Box::new(first),
                clauses,
            });
        }
        let mut items = vec![first];
        while self.eat(&Tok::Comma) {
            if self.at(&Tok::RBrace) {
                break;
            }
            items.push(self.parse_test()?);
        }
        self.expect(Tok::RBrace, "after set")?;
        Ok(Expr::Set(items))
    }

    fn parse_comp_clauses(&mut self) -> Result<Vec<CompClause>, EvalError> {
        let mut clauses = Vec::new();
        while self.eat(&Tok::Kw(Kw::For)) {
            let target = self.parse_target_list()?;
            self.expect(Tok::Kw(Kw::In), "in comprehension")?;
            let iter = self.parse_or()?;
            let mut conds = Vec::new();
            while self.eat(&Tok::Kw(Kw::If)) {
                conds.push(self.parse_or()?);
            }
            clauses.push(CompClause {
                target,
                iter,
                conds,
            });
        }
        Ok(clauses)
    }

    fn check_name(&self, name: &str) -> Result<(), EvalError> {
        if FORBIDDEN_NAMES.contains(&name) {
            return Err(self.security(&format!("use of '{name}' is not allowed")));
        }
        if name.starts_with("__") {
            return Err(self.security(&format!("dunder name '{name}' is not allowed")));
        }
        Ok(())
    }
}

fn is_expression_end(tok: &Tok) -> bool {
    matches!(
        tok,
        Tok::Newline
            | Tok::Eof
            | Tok::Dedent
            | Tok::Assign
            | Tok::AugAssign(_)
            | Tok::RParen
            | Tok::RBracket
            | Tok::RBrace
            | Tok::Colon
    )
}

fn aug_to_bin(op: AugOp) -> BinOp {
    match op {
        AugOp::Add => BinOp::Add,
        AugOp::Sub => BinOp::Sub,
        AugOp::Mul => BinOp::Mul,
        AugOp::Div => BinOp::Div,
        AugOp::FloorDiv => BinOp::FloorDiv,
        AugOp::Mod => BinOp::Mod,
        AugOp::Pow => BinOp::Pow,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::code::lexer::lex;

    fn parse(source: &str) -> Result<Vec<Stmt>, EvalError> {
        parse_module(lex(source)?)
    }

    #[test]
    fn parses_assignment_forms() {
        let stmts = parse("x = 1\nx += 2\na, b = 1, 2\nxs[0] = 5").unwrap();
        assert_eq!(stmts.len(), 4);
        assert!(matches!(&stmts[0], Stmt::Assign { target: Target::Name(n), .. } if n == "x"));
        assert!(matches!(&stmts[1], Stmt::AugAssign { op: BinOp::Add, .. }));
        assert!(matches!(&stmts[2], Stmt::Assign { target: Target::Tuple(t), .. } if t.len() == 2));
        assert!(matches!(
            &stmts[3],
            Stmt::Assign {
                target: Target::Subscript { .. },
                ..
            }
        ));
    }

    #[test]
    fn parses_if_elif_else() {
        let stmts = parse("if x > 0:\n    y = 1\nelif x < 0:\n    y = -1\nelse:\n    y = 0").unwrap();
        let Stmt::If { branches, orelse } = &stmts[0] else {
            panic!("expected if");
        };
        assert_eq!(branches.len(), 2);
        assert_eq!(orelse.len(), 1);
    }

    #[test]
    fn parses_inline_suite() {
        let stmts = parse("while True: pass").unwrap();
        let Stmt::While { body, .. } = &stmts[0] else {
            panic!("expected while");
        };
        assert!(matches!(body[0], Stmt::Pass));
    }

    #[test]
    fn parses_for_over_range_and_def() {
        let source = "\
def double(v):
    return v * 2

total = 0
for i in range(10):
    total += double(i)
";
        let stmts = parse(source).unwrap();
        assert!(matches!(&stmts[0], Stmt::FuncDef(f) if f.name == "double" && f.params == ["v"]));
        assert!(matches!(&stmts[2], Stmt::For { .. }));
    }

    #[test]
    fn parses_comprehensions() {
        let stmts = parse("ys = [v * v for v in xs if v > 0]").unwrap();
        let Stmt::Assign { value, .. } = &stmts[0] else {
            panic!("expected assign");
        };
        let Expr::ListComp { clauses, .. } = value else {
            panic!("expected list comprehension");
        };
        assert_eq!(clauses.len(), 1);
        assert_eq!(clauses[0].conds.len(), 1);

        assert!(parse("d = {k: k * 2 for k in range(3)}").is_ok());
        assert!(parse("s = {v % 3 for v in range(10)}").is_ok());
    }

    #[test]
    fn parses_imports_with_alias() {
        let stmts = parse("import math\nimport numpy as np").unwrap();
        assert!(matches!(
            &stmts[0],
            Stmt::Import { module, alias: None } if module == "math"
        ));
        assert!(matches!(
            &stmts[1],
            Stmt::Import { module, alias: Some(a) } if module == "numpy" && a == "np"
        ));
    }

    #[test]
    fn rejects_disallowed_imports() {
        for source in ["import os", "import sys", "import requests", "import socket"] {
            let err = parse(source).unwrap_err();
            assert!(matches!(err, EvalError::Security(_)), "{source}: {err}");
        }
    }

    #[test]
    fn rejects_forbidden_names_even_outside_calls() {
        for source in ["f = open", "x = eval('1')", "exec('x = 1')", "g = globals()"] {
            let err = parse(source).unwrap_err();
            assert!(matches!(err, EvalError::Security(_)), "{source}: {err}");
        }
    }

    #[test]
    fn rejects_underscore_attributes() {
        for source in ["x = math._hidden", "y = obj.__class__"] {
            let err = parse(source).unwrap_err();
            assert!(matches!(err, EvalError::Security(_)), "{source}: {err}");
        }
    }

    #[test]
    fn rejects_slices() {
        let err = parse("y = xs[1:3]").unwrap_err();
        assert!(err.to_string().contains("slices"));
    }

    #[test]
    fn parses_chained_comparison_and_membership() {
        let stmts = parse("ok = 0 <= x < 10\nhit = k in d\nmiss = k not in d").unwrap();
        let Stmt::Assign { value, .. } = &stmts[0] else {
            panic!();
        };
        let Expr::Compare { rest, .. } = value else {
            panic!("expected comparison");
        };
        assert_eq!(rest.len(), 2);
    }

    #[test]
    fn syntax_errors_carry_line_numbers() {
        let err = parse("x = 1\ny = (2 3)\nz = 4").unwrap_err();
        assert!(err.to_string().contains("line 2"), "{err}");
    }
}
