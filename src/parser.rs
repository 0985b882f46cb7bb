//! Parser for the C-like kernel language
//!
//! Parses translation units like:
//! - `void mm(int A[2][2], int B[2][2], int C[2][2]) { for (...) ... }`
//! - `void mm(int* A, int* B, int* C, int rows, int cols, int common) { ... }`
//!
//! Only the statement forms a PIM kernel can use are accepted: counted `for`
//! loops, blocks, local declarations and (compound) assignments. Control flow
//! keywords are rejected with a message naming the construct.

use crate::ast::{
    AssignOp, BinOp, Expr, ForLoop, Function, LoopCond, Param, ScalarType, Stmt,
    TranslationUnit, TypeSpec, UnaryOp,
};
use crate::error::{CompileError, CompileResult};
use crate::lexer::{Lexer, Spanned, Token};

/// Number of binary precedence levels, loosest first
const BINARY_LEVELS: usize = 10;

/// Parser for kernel source
pub struct Parser<'source> {
    lexer: Lexer<'source>,
    current: Option<Spanned>,
    primed: bool,
}

impl<'source> Parser<'source> {
    pub fn new(source: &'source str) -> Self {
        Self {
            lexer: Lexer::new(source),
            current: None,
            primed: false,
        }
    }

    /// Advance to the next token, returning the previous one
    fn advance(&mut self) -> CompileResult<Option<Token>> {
        let prev = self.current.take();
        self.current = self.lexer.next().transpose()?;
        Ok(prev.map(|s| s.token))
    }

    fn token(&self) -> Option<&Token> {
        self.current.as_ref().map(|s| &s.token)
    }

    fn position(&self) -> usize {
        self.current.as_ref().map(|s| s.span.start).unwrap_or(0)
    }

    /// Check if current token matches expected
    fn check(&self, expected: &Token) -> bool {
        match self.token() {
            Some(tok) => std::mem::discriminant(tok) == std::mem::discriminant(expected),
            None => false,
        }
    }

    fn error(&self, msg: impl std::fmt::Display) -> CompileError {
        match self.token() {
            Some(tok) => CompileError::parse_error(format!(
                "{} (found `{}` at position {})",
                msg,
                tok,
                self.position()
            )),
            None => CompileError::parse_error(format!("{} (found end of input)", msg)),
        }
    }

    /// Consume token if it matches, otherwise error
    fn expect(&mut self, expected: Token) -> CompileResult<()> {
        if self.check(&expected) {
            self.advance()?;
            Ok(())
        } else {
            Err(self.error(format!("expected `{}`", expected)))
        }
    }

    fn expect_ident(&mut self) -> CompileResult<String> {
        match self.token() {
            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.advance()?;
                Ok(name)
            }
            _ => Err(self.error("expected identifier")),
        }
    }

    /// Parse a complete translation unit (function definitions)
    pub fn parse_translation_unit(&mut self) -> CompileResult<TranslationUnit> {
        if !self.primed {
            self.primed = true;
            self.advance()?;
        }

        let mut functions = Vec::new();
        while self.current.is_some() {
            functions.push(self.parse_function()?);
        }

        if functions.is_empty() {
            return Err(CompileError::parse_error("translation unit contains no functions"));
        }

        Ok(TranslationUnit { functions })
    }

    /// Parse a function definition
    fn parse_function(&mut self) -> CompileResult<Function> {
        let return_type = self.parse_type_spec()?;
        let name = self.expect_ident()?;

        self.expect(Token::LParen)?;
        let mut params = Vec::new();
        if self.check(&Token::Void) {
            // `f(void)`
            self.advance()?;
        } else if !self.check(&Token::RParen) {
            params.push(self.parse_param()?);
            while self.check(&Token::Comma) {
                self.advance()?;
                params.push(self.parse_param()?);
            }
        }
        self.expect(Token::RParen)?;

        let body = self.parse_block()?;

        Ok(Function {
            name,
            return_type,
            params,
            body,
        })
    }

    /// Parse a type specifier: qualifiers, base type, pointer declarators
    fn parse_type_spec(&mut self) -> CompileResult<TypeSpec> {
        let mut unsigned = false;
        let mut scalar = None;

        loop {
            match self.token() {
                Some(Token::Const) | Some(Token::Signed) => {
                    self.advance()?;
                }
                Some(Token::Unsigned) => {
                    unsigned = true;
                    self.advance()?;
                }
                Some(tok) if tok.starts_type() => {
                    let next = match tok {
                        Token::Void => ScalarType::Void,
                        Token::Char => ScalarType::Char,
                        Token::Short => ScalarType::Short,
                        Token::Int => ScalarType::Int,
                        Token::Long => ScalarType::Long,
                        Token::FloatType => ScalarType::Float,
                        _ => ScalarType::Double,
                    };
                    // `long int`, `short int` and `long long` keep the wider keyword
                    scalar = match (scalar, next) {
                        (None, t) => Some(t),
                        (Some(ScalarType::Long), ScalarType::Int | ScalarType::Long) => {
                            Some(ScalarType::Long)
                        }
                        (Some(ScalarType::Short), ScalarType::Int) => Some(ScalarType::Short),
                        (Some(ScalarType::Int), ScalarType::Long) => Some(ScalarType::Long),
                        (Some(ScalarType::Int), ScalarType::Short) => Some(ScalarType::Short),
                        (Some(prev), t) => {
                            return Err(self.error(format!(
                                "conflicting type specifiers `{}` and `{}`",
                                prev, t
                            )))
                        }
                    };
                    self.advance()?;
                }
                _ => break,
            }
        }

        let scalar = match scalar {
            Some(s) => s,
            None if unsigned => ScalarType::Int,
            None => return Err(self.error("expected type specifier")),
        };

        let mut pointer_depth = 0;
        while self.check(&Token::Star) {
            self.advance()?;
            pointer_depth += 1;
            while self.check(&Token::Const) {
                self.advance()?;
            }
        }

        Ok(TypeSpec {
            scalar,
            unsigned,
            pointer_depth,
            extents: Vec::new(),
        })
    }

    /// Parse array declarators following a name: `[]`, `[10]`, `[3][4]`
    fn parse_extents(&mut self) -> CompileResult<Vec<Option<i64>>> {
        let mut extents = Vec::new();
        while self.check(&Token::LBracket) {
            self.advance()?;
            if self.check(&Token::RBracket) {
                extents.push(None);
            } else if let Some(Token::Integer(n)) = self.token() {
                extents.push(Some(*n));
                self.advance()?;
            } else {
                return Err(self.error("array extent must be an integer literal"));
            }
            self.expect(Token::RBracket)?;
        }
        Ok(extents)
    }

    /// Parse a parameter: `int* A`, `int A[][10]`, `int rows`
    fn parse_param(&mut self) -> CompileResult<Param> {
        let mut ty = self.parse_type_spec()?;
        let name = self.expect_ident()?;
        ty.extents = self.parse_extents()?;
        Ok(Param { name, ty })
    }

    /// Parse `{ stmts }`
    fn parse_block(&mut self) -> CompileResult<Vec<Stmt>> {
        self.expect(Token::LBrace)?;
        let mut stmts = Vec::new();
        while !self.check(&Token::RBrace) {
            if self.current.is_none() {
                return Err(self.error("unterminated block"));
            }
            if let Some(stmt) = self.parse_statement()? {
                stmts.push(stmt);
            }
        }
        self.expect(Token::RBrace)?;
        Ok(stmts)
    }

    /// Parse a single statement; `None` for an empty statement
    fn parse_statement(&mut self) -> CompileResult<Option<Stmt>> {
        match self.token() {
            Some(Token::Semicolon) => {
                self.advance()?;
                Ok(None)
            }
            Some(Token::LBrace) => Ok(Some(Stmt::Block(self.parse_block()?))),
            Some(Token::For) => Ok(Some(Stmt::For(self.parse_for()?))),
            Some(tok @ (Token::If
            | Token::Else
            | Token::While
            | Token::Do
            | Token::Return
            | Token::Break
            | Token::Continue)) => Err(CompileError::parse_error(format!(
                "unsupported statement `{}` at position {}: PIM kernels cannot contain control flow",
                tok,
                self.position()
            ))),
            Some(tok) if tok.starts_type() => {
                let stmt = self.parse_declaration()?;
                self.expect(Token::Semicolon)?;
                Ok(Some(stmt))
            }
            _ => {
                let stmt = self.parse_assignment()?;
                self.expect(Token::Semicolon)?;
                Ok(Some(stmt))
            }
        }
    }

    /// Parse a local declaration: `int a_idx = i * n + k`
    fn parse_declaration(&mut self) -> CompileResult<Stmt> {
        let mut ty = self.parse_type_spec()?;
        let name = self.expect_ident()?;
        ty.extents = self.parse_extents()?;

        let init = if self.check(&Token::Assign) {
            self.advance()?;
            Some(self.parse_expr()?)
        } else {
            None
        };

        Ok(Stmt::Decl { ty, name, init })
    }

    /// Parse an assignment: `lvalue op= expr`
    fn parse_assignment(&mut self) -> CompileResult<Stmt> {
        let target = self.parse_unary()?;

        let op = match self.token() {
            Some(Token::Assign) => AssignOp::Assign,
            Some(Token::PlusAssign) => AssignOp::Add,
            Some(Token::MinusAssign) => AssignOp::Sub,
            Some(Token::StarAssign) => AssignOp::Mul,
            Some(Token::SlashAssign) => AssignOp::Div,
            Some(Token::PercentAssign) => AssignOp::Rem,
            _ => return Err(self.error("expected assignment")),
        };
        self.advance()?;

        let value = self.parse_expr()?;
        Ok(Stmt::Assign { target, op, value })
    }

    /// Parse `for (init; cond; step) body`
    fn parse_for(&mut self) -> CompileResult<ForLoop> {
        self.expect(Token::For)?;
        self.expect(Token::LParen)?;

        // init: [type] var = expr
        if self.token().map_or(false, Token::starts_type) {
            self.parse_type_spec()?;
        }
        let var = self.expect_ident()?;
        self.expect(Token::Assign)?;
        let start = self.parse_expr()?;
        self.expect(Token::Semicolon)?;

        // cond: var < limit | var <= limit
        let cond_var = self.expect_ident()?;
        if cond_var != var {
            return Err(self.error(format!(
                "loop condition must test the induction variable `{}`",
                var
            )));
        }
        let cond = match self.token() {
            Some(Token::Lt) => LoopCond::Less,
            Some(Token::Le) => LoopCond::LessEqual,
            _ => return Err(self.error("loop condition must be `<` or `<=`")),
        };
        self.advance()?;
        let limit = self.parse_expr()?;
        self.expect(Token::Semicolon)?;

        let step = self.parse_step(&var)?;
        self.expect(Token::RParen)?;

        let body = match self.parse_statement()? {
            Some(Stmt::Block(stmts)) => stmts,
            Some(stmt) => vec![stmt],
            None => Vec::new(),
        };

        Ok(ForLoop {
            var,
            start,
            cond,
            limit,
            step,
            body,
        })
    }

    /// Parse a loop increment: `i++`, `++i`, `i += c`, `i = i + c`
    fn parse_step(&mut self, var: &str) -> CompileResult<Expr> {
        if self.check(&Token::Increment) {
            self.advance()?;
            let name = self.expect_ident()?;
            return self.step_for(var, &name, Expr::Integer(1));
        }

        let name = self.expect_ident()?;
        match self.token() {
            Some(Token::Increment) => {
                self.advance()?;
                self.step_for(var, &name, Expr::Integer(1))
            }
            Some(Token::PlusAssign) => {
                self.advance()?;
                let step = self.parse_expr()?;
                self.step_for(var, &name, step)
            }
            Some(Token::Assign) => {
                self.advance()?;
                match self.parse_expr()? {
                    Expr::Binary(BinOp::Add, left, right)
                        if matches!(left.as_ref(), Expr::Variable(v) if v == var) =>
                    {
                        self.step_for(var, &name, *right)
                    }
                    _ => Err(self.error(format!(
                        "loop increment must have the form `{0} = {0} + step`",
                        var
                    ))),
                }
            }
            _ => Err(self.error("loop increment must count upwards")),
        }
    }

    fn step_for(&self, var: &str, name: &str, step: Expr) -> CompileResult<Expr> {
        if name == var {
            Ok(step)
        } else {
            Err(self.error(format!(
                "loop increment must update the induction variable `{}`",
                var
            )))
        }
    }

    /// Parse an expression (handles operator precedence)
    pub fn parse_expr(&mut self) -> CompileResult<Expr> {
        self.parse_binary(0)
    }

    /// Operator at the given precedence level, loosest (0) to tightest
    fn binary_op(level: usize, token: &Token) -> Option<BinOp> {
        let op = match (level, token) {
            (0, Token::OrOr) => BinOp::Or,
            (1, Token::AndAnd) => BinOp::And,
            (2, Token::Pipe) => BinOp::BitOr,
            (3, Token::Caret) => BinOp::BitXor,
            (4, Token::Amp) => BinOp::BitAnd,
            (5, Token::EqEq) => BinOp::Eq,
            (5, Token::NotEq) => BinOp::Ne,
            (6, Token::Lt) => BinOp::Lt,
            (6, Token::Le) => BinOp::Le,
            (6, Token::Gt) => BinOp::Gt,
            (6, Token::Ge) => BinOp::Ge,
            (7, Token::Shl) => BinOp::Shl,
            (7, Token::Shr) => BinOp::Shr,
            (8, Token::Plus) => BinOp::Add,
            (8, Token::Minus) => BinOp::Sub,
            (9, Token::Star) => BinOp::Mul,
            (9, Token::Slash) => BinOp::Div,
            (9, Token::Percent) => BinOp::Rem,
            _ => return None,
        };
        Some(op)
    }

    /// Left-associative binary expressions at one precedence level
    fn parse_binary(&mut self, level: usize) -> CompileResult<Expr> {
        if level == BINARY_LEVELS {
            return self.parse_unary();
        }

        let mut left = self.parse_binary(level + 1)?;
        while let Some(op) = self.token().and_then(|t| Self::binary_op(level, t)) {
            self.advance()?;
            let right = self.parse_binary(level + 1)?;
            left = Expr::binary(op, left, right);
        }
        Ok(left)
    }

    /// Parse unary expressions: -a, +a, !a, ~a
    fn parse_unary(&mut self) -> CompileResult<Expr> {
        let op = match self.token() {
            Some(Token::Minus) => Some(UnaryOp::Neg),
            Some(Token::Bang) => Some(UnaryOp::Not),
            Some(Token::Tilde) => Some(UnaryOp::BitNot),
            Some(Token::Plus) => {
                self.advance()?;
                return self.parse_unary();
            }
            _ => None,
        };

        match op {
            Some(op) => {
                self.advance()?;
                let operand = self.parse_unary()?;
                Ok(Expr::Unary(op, Box::new(operand)))
            }
            None => self.parse_postfix(),
        }
    }

    /// Parse postfix expressions: subscripts
    fn parse_postfix(&mut self) -> CompileResult<Expr> {
        let mut expr = self.parse_primary()?;
        while self.check(&Token::LBracket) {
            self.advance()?;
            let index = self.parse_expr()?;
            self.expect(Token::RBracket)?;
            expr = Expr::index(expr, index);
        }
        Ok(expr)
    }

    /// Parse primary expressions: literals, variables, calls, parenthesized
    fn parse_primary(&mut self) -> CompileResult<Expr> {
        match self.token() {
            Some(Token::Integer(n)) => {
                let n = *n;
                self.advance()?;
                Ok(Expr::Integer(n))
            }

            Some(Token::Float(n)) => {
                let n = *n;
                self.advance()?;
                Ok(Expr::Float(n))
            }

            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.advance()?;

                if self.check(&Token::LParen) {
                    let args = self.parse_args()?;
                    return Ok(Expr::Call { name, args });
                }

                Ok(Expr::Variable(name))
            }

            Some(Token::LParen) => {
                self.advance()?;
                if self.token().map_or(false, Token::starts_type) {
                    return Err(self.error("casts are not supported in PIM kernels"));
                }
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }

            _ => Err(self.error("expected expression")),
        }
    }

    /// Parse call arguments: (arg1, arg2, ...)
    fn parse_args(&mut self) -> CompileResult<Vec<Expr>> {
        self.expect(Token::LParen)?;

        let mut args = Vec::new();
        if !self.check(&Token::RParen) {
            args.push(self.parse_expr()?);
            while self.check(&Token::Comma) {
                self.advance()?;
                args.push(self.parse_expr()?);
            }
        }

        self.expect(Token::RParen)?;
        Ok(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(source: &str) -> TranslationUnit {
        Parser::new(source).parse_translation_unit().unwrap()
    }

    fn var(name: &str) -> Expr {
        Expr::Variable(name.to_string())
    }

    #[test]
    fn test_parse_2d_params() {
        let unit = parse("void mm(int A[][10], const int* B, int C[3][4], int rows) {}");
        let f = &unit.functions[0];

        assert_eq!(f.name, "mm");
        assert_eq!(f.params.len(), 4);
        assert_eq!(f.params[0].ty.extents, vec![None, Some(10)]);
        assert_eq!(f.params[1].ty.pointer_depth, 1);
        assert_eq!(f.params[2].ty.extents, vec![Some(3), Some(4)]);
        assert!(!f.params[3].ty.is_array_like());
    }

    #[test]
    fn test_parse_loop_nest() {
        let unit = parse(
            "void mm(int A[2][2], int B[2][2], int C[2][2]) {
                for (int i = 0; i < 2; i++)
                    for (int j = 0; j < 2; ++j) {
                        C[i][j] = 0;
                        for (int k = 0; k < 2; k += 1)
                            C[i][j] += A[i][k] * B[k][j];
                    }
            }",
        );

        let body = &unit.functions[0].body;
        assert_eq!(body.len(), 1);
        let Stmt::For(outer) = &body[0] else {
            panic!("Expected for loop");
        };
        assert_eq!(outer.var, "i");
        assert_eq!(outer.limit, Expr::Integer(2));

        let Stmt::For(middle) = &outer.body[0] else {
            panic!("Expected nested for loop");
        };
        assert_eq!(middle.body.len(), 2);
        assert!(matches!(
            &middle.body[0],
            Stmt::Assign { op: AssignOp::Assign, value: Expr::Integer(0), .. }
        ));
        let Stmt::For(inner) = &middle.body[1] else {
            panic!("Expected innermost for loop");
        };
        assert_eq!(inner.step, Expr::Integer(1));
        assert!(matches!(&inner.body[0], Stmt::Assign { op: AssignOp::Add, .. }));
    }

    #[test]
    fn test_parse_linear_index_precedence() {
        let unit = parse("void f(int* C, int cols) { C[i * cols + j] = 0; }");
        let Stmt::Assign { target, .. } = &unit.functions[0].body[0] else {
            panic!("Expected assignment");
        };

        assert_eq!(
            target,
            &Expr::index(
                var("C"),
                Expr::binary(
                    BinOp::Add,
                    Expr::binary(BinOp::Mul, var("i"), var("cols")),
                    var("j"),
                ),
            )
        );
    }

    #[test]
    fn test_parse_local_declaration() {
        let unit = parse("void f(int* A) { int a_idx = i * 4 + k; A[a_idx] = 1; }");
        assert!(matches!(
            &unit.functions[0].body[0],
            Stmt::Decl { name, init: Some(_), .. } if name == "a_idx"
        ));
    }

    #[test]
    fn test_parse_step_forms() {
        let unit = parse("void f(int* A) { for (i = 0; i <= 7; i = i + 2) A[i] = 1; }");
        let Stmt::For(l) = &unit.functions[0].body[0] else {
            panic!("Expected for loop");
        };
        assert_eq!(l.cond, LoopCond::LessEqual);
        assert_eq!(l.step, Expr::Integer(2));
    }

    #[test]
    fn test_reject_control_flow() {
        let err = Parser::new("void f(int* A) { if (A[0]) A[0] = 1; }")
            .parse_translation_unit()
            .unwrap_err();
        assert!(err.to_string().contains("unsupported statement `if`"));
    }

    #[test]
    fn test_reject_missing_semicolon() {
        let result = Parser::new("void f(int* A) { A[0] = 1 }").parse_translation_unit();
        assert!(matches!(result, Err(CompileError::ParseError { .. })));
    }

    #[test]
    fn test_empty_input() {
        let result = Parser::new("// nothing here\n").parse_translation_unit();
        assert!(result.is_err());
    }
}
