//! Pratt-style recursive-descent parser: tokens to AST.
//!
//! No teacher parser exists to imitate (`ouros` consumes Python ASTs built
//! by an external crate); this module is grounded directly on spec §4.4.
//! The lookahead/pushback buffer (§4.4.3, §9) is a single `VecDeque<Token>`
//! doing double duty as both the one-token lookahead and the two-slot
//! pushback the parenthesized-list disambiguation needs — pushing a token
//! back is just re-queuing it at the front.

use std::collections::VecDeque;

use crate::ast::{BinaryOp, Block, Expr, LogicalOp, Stmt, StmtNode, TemplatePart, UnaryOp};
use crate::error::{err, CodeLoc, RunResult, SlateError};
use crate::lexer::{Lexer, Token, TokenKind};

/// `STRICT` requires a block's final statement to be an expression
/// statement; `LENIENT` additionally accepts a final `var`/`val`
/// declaration with an initializer (whose value becomes the block's
/// value). Only `STRICT` is reachable from the public API today — `LENIENT`
/// exists for a REPL-style host, which is out of core scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserMode {
    Strict,
    Lenient,
}

const STATEMENT_KEYWORDS: &[TokenKind] = &[
    TokenKind::Var,
    TokenKind::Val,
    TokenKind::Def,
    TokenKind::Import,
    TokenKind::Package,
    TokenKind::If,
    TokenKind::While,
    TokenKind::For,
    TokenKind::Do,
    TokenKind::Loop,
    TokenKind::Break,
    TokenKind::Continue,
    TokenKind::Return,
];

pub struct Parser {
    lexer: Lexer,
    buffer: VecDeque<Token>,
    errors: Vec<SlateError>,
    mode: ParserMode,
}

impl Parser {
    #[must_use]
    pub fn new(source: &str) -> Self {
        Self { lexer: Lexer::new(source), buffer: VecDeque::new(), errors: Vec::new(), mode: ParserMode::Strict }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: ParserMode) -> Self {
        self.mode = mode;
        self
    }

    /// Parses the whole program, returning the top-level block and every
    /// syntax error recorded along the way (panic-mode recovery keeps
    /// parsing after the first).
    pub fn parse_program(&mut self) -> (Block, Vec<SlateError>) {
        let mut stmts = Vec::new();
        let _ = self.skip_separators();
        loop {
            match self.at_eof() {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => {
                    self.errors.push(e);
                    break;
                }
            }
            match self.parse_statement() {
                Ok(s) => stmts.push(s),
                Err(e) => {
                    self.errors.push(e);
                    self.synchronize();
                }
            }
            let _ = self.skip_separators();
        }
        (Block { stmts }, std::mem::take(&mut self.errors))
    }

    // ----- token stream plumbing -----

    fn fill(&mut self, upto: usize) -> RunResult<()> {
        while self.buffer.len() <= upto {
            let t = self.lexer.next_token()?;
            self.buffer.push_back(t);
        }
        Ok(())
    }

    fn peek(&mut self) -> RunResult<Token> {
        self.fill(0)?;
        Ok(self.buffer[0].clone())
    }

    fn peek_at(&mut self, n: usize) -> RunResult<Token> {
        self.fill(n)?;
        Ok(self.buffer[n].clone())
    }

    fn advance(&mut self) -> RunResult<Token> {
        self.fill(0)?;
        Ok(self.buffer.pop_front().expect("buffer filled above"))
    }

    fn push_back(&mut self, tok: Token) {
        self.buffer.push_front(tok);
    }

    fn check(&mut self, kind: TokenKind) -> RunResult<bool> {
        Ok(self.peek()?.kind == kind)
    }

    fn match_tok(&mut self, kind: TokenKind) -> RunResult<bool> {
        if self.check(kind)? {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> RunResult<Token> {
        let t = self.peek()?;
        if t.kind == kind {
            self.advance()
        } else {
            Err(self.error_at(&t, &format!("expected {what}")))
        }
    }

    fn at_eof(&mut self) -> RunResult<bool> {
        Ok(self.peek()?.kind == TokenKind::Eof)
    }

    fn error_at(&self, t: &Token, msg: &str) -> SlateError {
        err::syntax(msg.to_string()).with_location(CodeLoc::new(t.line, t.column))
    }

    fn skip_separators(&mut self) -> RunResult<()> {
        while matches!(self.peek()?.kind, TokenKind::Newline | TokenKind::Semi) {
            self.advance()?;
        }
        Ok(())
    }

    fn synchronize(&mut self) {
        loop {
            let Ok(t) = self.peek() else { return };
            if t.kind == TokenKind::Eof {
                return;
            }
            if matches!(t.kind, TokenKind::Newline | TokenKind::Semi) {
                let _ = self.advance();
                return;
            }
            if STATEMENT_KEYWORDS.contains(&t.kind) {
                return;
            }
            if self.advance().is_err() {
                return;
            }
        }
    }

    // ----- statements -----

    fn parse_statement(&mut self) -> RunResult<StmtNode> {
        let start = self.peek()?;
        let loc = CodeLoc::new(start.line, start.column);
        let stmt = match start.kind {
            TokenKind::Var | TokenKind::Val => self.parse_var_decl()?,
            TokenKind::Def => self.parse_def()?,
            TokenKind::Import => self.parse_import()?,
            TokenKind::Package => self.parse_package()?,
            _ => Stmt::Expr(self.parse_expression()?),
        };
        Ok(StmtNode::new(loc, stmt))
    }

    fn parse_var_decl(&mut self) -> RunResult<Stmt> {
        let mutable = self.advance()?.kind == TokenKind::Var;
        let name = self.expect_ident("a variable name")?;
        let init = if self.match_tok(TokenKind::Eq)? { Some(self.parse_expression()?) } else { None };
        if !mutable && init.is_none() {
            return Err(err::syntax("val declaration requires an initializer"));
        }
        Ok(Stmt::VarDecl { name, init, mutable })
    }

    /// `def name(p1, ...) = body` desugars to an immutable binding of an
    /// arrow function.
    fn parse_def(&mut self) -> RunResult<Stmt> {
        self.advance()?; // `def`
        let name = self.expect_ident("a function name")?;
        self.expect(TokenKind::LParen, "'(' after function name")?;
        let params = self.parse_param_list()?;
        self.expect(TokenKind::Eq, "'=' before function body")?;
        let body = self.parse_expression()?;
        let arrow = Expr::Arrow { params, body: Box::new(body) };
        Ok(Stmt::VarDecl { name, init: Some(arrow), mutable: false })
    }

    fn parse_param_list(&mut self) -> RunResult<Vec<String>> {
        let mut params = Vec::new();
        if !self.check(TokenKind::RParen)? {
            loop {
                params.push(self.expect_ident("a parameter name")?);
                if !self.match_tok(TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "')' after parameters")?;
        Ok(params)
    }

    fn parse_import(&mut self) -> RunResult<Stmt> {
        self.advance()?;
        let mut path = vec![self.expect_ident("a module path segment")?];
        let mut specifiers = Vec::new();
        while self.match_tok(TokenKind::Dot)? {
            if self.match_tok(TokenKind::LBrace)? {
                loop {
                    specifiers.push(self.expect_ident("an import specifier")?);
                    if !self.match_tok(TokenKind::Comma)? {
                        break;
                    }
                }
                self.expect(TokenKind::RBrace, "'}' after import specifiers")?;
                break;
            }
            path.push(self.expect_ident("a module path segment")?);
        }
        Ok(Stmt::Import { path, specifiers })
    }

    fn parse_package(&mut self) -> RunResult<Stmt> {
        self.advance()?;
        let mut path = vec![self.expect_ident("a package path segment")?];
        while self.match_tok(TokenKind::Dot)? {
            path.push(self.expect_ident("a package path segment")?);
        }
        Ok(Stmt::Package { path })
    }

    fn expect_ident(&mut self, what: &str) -> RunResult<String> {
        let t = self.peek()?;
        if t.kind == TokenKind::Ident {
            self.advance()?;
            Ok(t.lexeme.to_string())
        } else {
            Err(self.error_at(&t, what))
        }
    }

    /// Parses a block delimited by `INDENT`/`DEDENT`, enforcing the
    /// `STRICT`/`LENIENT` final-statement rule. On violation, records an
    /// error and synthesizes a trailing `null` expression statement so
    /// compilation can still proceed.
    fn parse_block(&mut self) -> RunResult<Block> {
        self.expect(TokenKind::Indent, "an indented block")?;
        let mut stmts = Vec::new();
        let _ = self.skip_separators();
        while !self.check(TokenKind::Dedent)? && !self.at_eof()? {
            match self.parse_statement() {
                Ok(s) => stmts.push(s),
                Err(e) => {
                    self.errors.push(e);
                    self.synchronize();
                }
            }
            let _ = self.skip_separators();
        }
        if self.check(TokenKind::Dedent)? {
            self.advance()?;
        }
        self.validate_block_tail(&mut stmts);
        Ok(Block { stmts })
    }

    fn validate_block_tail(&mut self, stmts: &mut Vec<StmtNode>) {
        let ok = match stmts.last().map(|s| &s.kind) {
            Some(Stmt::Expr(_)) => true,
            Some(Stmt::VarDecl { init: Some(_), .. }) => self.mode == ParserMode::Lenient,
            _ => stmts.is_empty(),
        };
        if !ok {
            let loc = stmts.last().map_or_else(|| CodeLoc::new(0, 0), |s| s.loc);
            self.errors.push(err::syntax(
                "block must end with an expression statement".to_string(),
            ).with_location(loc));
            stmts.push(StmtNode::new(loc, Stmt::Expr(Expr::NullLiteral)));
        }
    }

    // ----- expression-bearing control flow -----

    /// A block, or a single same-line statement introduced by `then`/`do`,
    /// compiled uniformly as an expression.
    fn parse_body(&mut self, same_line_keyword: Option<TokenKind>) -> RunResult<Expr> {
        // A newline followed by INDENT means the body is an indented block;
        // a newline with no INDENT means the caller's statement just ended
        // (e.g. `break`), so only swallow separators when a block follows.
        if self.check(TokenKind::Newline)? && self.peek_at(1)?.kind == TokenKind::Indent {
            let _ = self.skip_separators();
        }
        if self.check(TokenKind::Indent)? {
            return Ok(Expr::Block(self.parse_block()?));
        }
        if let Some(kw) = same_line_keyword {
            self.expect(kw, "'then'/'do' or an indented block")?;
        }
        self.parse_expression()
    }

    fn parse_if(&mut self) -> RunResult<Expr> {
        self.advance()?; // `if`
        self.parse_if_tail()
    }

    /// Parses everything after the `if`/`elif` keyword; `elif` recurses
    /// here directly so the chain lowers to nested `If` expressions
    /// without needing to re-synthesize an `if` token.
    fn parse_if_tail(&mut self) -> RunResult<Expr> {
        let cond = Box::new(self.parse_expression()?);
        let then_branch = Box::new(self.parse_body(Some(TokenKind::Then))?);
        let _ = self.skip_separators();
        let else_branch = if self.match_tok(TokenKind::Elif)? {
            Box::new(self.parse_if_tail()?)
        } else if self.match_tok(TokenKind::Else)? {
            Box::new(self.parse_body(Some(TokenKind::Then))?)
        } else {
            Box::new(Expr::NullLiteral)
        };
        Ok(Expr::If { cond, then_branch, else_branch })
    }

    fn parse_while(&mut self) -> RunResult<Expr> {
        self.advance()?;
        let cond = Box::new(self.parse_expression()?);
        let body = Box::new(self.parse_body(Some(TokenKind::Do))?);
        Ok(Expr::While { cond, body })
    }

    fn parse_do_while(&mut self) -> RunResult<Expr> {
        self.advance()?; // `do`
        let body = Box::new(self.parse_body(None)?);
        let _ = self.skip_separators();
        self.expect(TokenKind::While, "'while' after do-block body")?;
        let cond = Box::new(self.parse_expression()?);
        Ok(Expr::DoWhile { body, cond })
    }

    fn parse_loop(&mut self) -> RunResult<Expr> {
        self.advance()?;
        let body = Box::new(self.parse_body(Some(TokenKind::Do))?);
        Ok(Expr::Loop { body })
    }

    /// `for init; cond; step do body` — each clause before the final `;`
    /// is optional.
    fn parse_for(&mut self) -> RunResult<Expr> {
        self.advance()?; // `for`
        let init = if self.check(TokenKind::Semi)? {
            None
        } else {
            Some(Box::new(self.parse_statement()?))
        };
        self.expect(TokenKind::Semi, "';' after for-loop initializer")?;
        let cond = if self.check(TokenKind::Semi)? { None } else { Some(Box::new(self.parse_expression()?)) };
        self.expect(TokenKind::Semi, "';' after for-loop condition")?;
        let step = if matches!(self.peek()?.kind, TokenKind::Do | TokenKind::Indent) {
            None
        } else {
            Some(Box::new(self.parse_expression()?))
        };
        let body = Box::new(self.parse_body(Some(TokenKind::Do))?);
        Ok(Expr::For { init, cond, step, body })
    }

    // ----- expression precedence chain (low to high) -----

    fn parse_expression(&mut self) -> RunResult<Expr> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> RunResult<Expr> {
        let target = self.parse_ternary()?;
        let op = match self.peek()?.kind {
            TokenKind::Eq => None,
            TokenKind::PlusEq => Some(BinaryOp::Add),
            TokenKind::MinusEq => Some(BinaryOp::Sub),
            TokenKind::StarEq => Some(BinaryOp::Mul),
            TokenKind::SlashEq => Some(BinaryOp::Div),
            TokenKind::PercentEq => Some(BinaryOp::Mod),
            TokenKind::StarStarEq => Some(BinaryOp::Pow),
            TokenKind::SlashSlashEq => Some(BinaryOp::FloorDiv),
            TokenKind::AmpEq => Some(BinaryOp::BitAnd),
            TokenKind::PipeEq => Some(BinaryOp::BitOr),
            TokenKind::CaretEq => Some(BinaryOp::BitXor),
            TokenKind::ShlEq => Some(BinaryOp::Shl),
            TokenKind::ShrEq => Some(BinaryOp::Shr),
            TokenKind::UShrEq => Some(BinaryOp::UShr),
            _ => return self.parse_logical_assign_or(target),
        };
        let t = self.advance()?;
        let value = Box::new(self.parse_assignment()?);
        let target = Box::new(target);
        if t.kind == TokenKind::Eq {
            Ok(Expr::Assign { target, value })
        } else {
            Ok(Expr::CompoundAssign { op: op.expect("matched above"), target, value })
        }
    }

    /// Handles `&&=`, `||=`, `??=`, which compound a logical op rather than
    /// a `BinaryOp`; modeled as `target = target OP value`.
    fn parse_logical_assign_or(&mut self, target: Expr) -> RunResult<Expr> {
        let logical_op = match self.peek()?.kind {
            TokenKind::AndAndEq => Some(LogicalOp::And),
            TokenKind::OrOrEq => Some(LogicalOp::Or),
            TokenKind::QQEq => Some(LogicalOp::Coalesce),
            _ => None,
        };
        let Some(op) = logical_op else { return Ok(target) };
        self.advance()?;
        let value = self.parse_assignment()?;
        let combined = Expr::Logical {
            op,
            left: Box::new(clone_as_read(&target)),
            right: Box::new(value),
        };
        Ok(Expr::Assign { target: Box::new(target), value: Box::new(combined) })
    }

    fn parse_ternary(&mut self) -> RunResult<Expr> {
        let cond = self.parse_null_coalesce()?;
        if self.match_tok(TokenKind::Question)? {
            let then_branch = Box::new(self.parse_assignment()?);
            self.expect(TokenKind::Colon, "':' in ternary expression")?;
            let else_branch = Box::new(self.parse_ternary()?);
            Ok(Expr::Ternary { cond: Box::new(cond), then_branch, else_branch })
        } else {
            Ok(cond)
        }
    }

    fn parse_null_coalesce(&mut self) -> RunResult<Expr> {
        let mut left = self.parse_logical_or()?;
        while self.match_tok(TokenKind::QQ)? {
            let right = self.parse_logical_or()?;
            left = Expr::Logical { op: LogicalOp::Coalesce, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_logical_or(&mut self) -> RunResult<Expr> {
        let mut left = self.parse_logical_and()?;
        while matches!(self.peek()?.kind, TokenKind::OrOr | TokenKind::Or) {
            self.advance()?;
            let right = self.parse_logical_and()?;
            left = Expr::Logical { op: LogicalOp::Or, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_logical_and(&mut self) -> RunResult<Expr> {
        let mut left = self.parse_bitwise_or()?;
        while matches!(self.peek()?.kind, TokenKind::AndAnd | TokenKind::And) {
            self.advance()?;
            let right = self.parse_bitwise_or()?;
            left = Expr::Logical { op: LogicalOp::And, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_bitwise_or(&mut self) -> RunResult<Expr> {
        self.parse_left_binary(Self::parse_bitwise_xor, &[(TokenKind::Pipe, BinaryOp::BitOr)])
    }

    fn parse_bitwise_xor(&mut self) -> RunResult<Expr> {
        self.parse_left_binary(Self::parse_bitwise_and, &[(TokenKind::Caret, BinaryOp::BitXor)])
    }

    fn parse_bitwise_and(&mut self) -> RunResult<Expr> {
        self.parse_left_binary(Self::parse_equality, &[(TokenKind::Amp, BinaryOp::BitAnd)])
    }

    fn parse_equality(&mut self) -> RunResult<Expr> {
        self.parse_left_binary(
            Self::parse_comparison,
            &[(TokenKind::EqEq, BinaryOp::Eq), (TokenKind::NotEq, BinaryOp::NotEq)],
        )
    }

    fn parse_comparison(&mut self) -> RunResult<Expr> {
        self.parse_left_binary(
            Self::parse_range,
            &[
                (TokenKind::Lt, BinaryOp::Lt),
                (TokenKind::Le, BinaryOp::Le),
                (TokenKind::Gt, BinaryOp::Gt),
                (TokenKind::Ge, BinaryOp::Ge),
                (TokenKind::In, BinaryOp::In),
                (TokenKind::Instanceof, BinaryOp::InstanceOf),
            ],
        )
    }

    /// Ranges don't chain: `a..b..c` is not valid, matching the grammar
    /// ("range (.. ..< with optional step e)" as a single level).
    fn parse_range(&mut self) -> RunResult<Expr> {
        let start = self.parse_shift()?;
        let exclusive = match self.peek()?.kind {
            TokenKind::DotDot => false,
            TokenKind::DotDotLt => true,
            _ => return Ok(start),
        };
        self.advance()?;
        let end = self.parse_shift()?;
        let step = if self.match_tok(TokenKind::Step)? { Some(Box::new(self.parse_shift()?)) } else { None };
        Ok(Expr::Range { start: Box::new(start), end: Box::new(end), exclusive, step })
    }

    fn parse_shift(&mut self) -> RunResult<Expr> {
        self.parse_left_binary(
            Self::parse_additive,
            &[(TokenKind::Shl, BinaryOp::Shl), (TokenKind::Shr, BinaryOp::Shr), (TokenKind::UShr, BinaryOp::UShr)],
        )
    }

    fn parse_additive(&mut self) -> RunResult<Expr> {
        self.parse_left_binary(
            Self::parse_multiplicative,
            &[(TokenKind::Plus, BinaryOp::Add), (TokenKind::Minus, BinaryOp::Sub)],
        )
    }

    fn parse_multiplicative(&mut self) -> RunResult<Expr> {
        self.parse_left_binary(
            Self::parse_power,
            &[
                (TokenKind::Star, BinaryOp::Mul),
                (TokenKind::Slash, BinaryOp::Div),
                (TokenKind::Percent, BinaryOp::Mod),
                (TokenKind::SlashSlash, BinaryOp::FloorDiv),
            ],
        )
    }

    fn parse_power(&mut self) -> RunResult<Expr> {
        let left = self.parse_unary()?;
        if self.match_tok(TokenKind::StarStar)? {
            let right = self.parse_power()?;
            Ok(Expr::Binary { op: BinaryOp::Pow, left: Box::new(left), right: Box::new(right) })
        } else {
            Ok(left)
        }
    }

    fn parse_unary(&mut self) -> RunResult<Expr> {
        let op = match self.peek()?.kind {
            TokenKind::Bang | TokenKind::Not => UnaryOp::Not,
            TokenKind::Minus => UnaryOp::Negate,
            TokenKind::Tilde => UnaryOp::BitNot,
            TokenKind::PlusPlus => UnaryOp::PreIncrement,
            TokenKind::MinusMinus => UnaryOp::PreDecrement,
            _ => return self.parse_postfix(),
        };
        self.advance()?;
        let expr = Box::new(self.parse_unary()?);
        Ok(Expr::Unary { op, expr })
    }

    fn parse_postfix(&mut self) -> RunResult<Expr> {
        let mut expr = self.parse_call_member()?;
        loop {
            let op = match self.peek()?.kind {
                TokenKind::PlusPlus => UnaryOp::PostIncrement,
                TokenKind::MinusMinus => UnaryOp::PostDecrement,
                _ => break,
            };
            self.advance()?;
            expr = Expr::Unary { op, expr: Box::new(expr) };
        }
        Ok(expr)
    }

    fn parse_call_member(&mut self) -> RunResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek()?.kind {
                TokenKind::LParen => {
                    self.advance()?;
                    let args = self.parse_arg_list()?;
                    expr = Expr::Call { callee: Box::new(expr), args };
                }
                TokenKind::Dot => {
                    self.advance()?;
                    let name = self.expect_ident("a property name")?;
                    expr = Expr::Member { receiver: Box::new(expr), name, optional: false };
                }
                TokenKind::QDot => {
                    self.advance()?;
                    let name = self.expect_ident("a property name")?;
                    expr = Expr::Member { receiver: Box::new(expr), name, optional: true };
                }
                TokenKind::LBracket => {
                    self.advance()?;
                    let index = self.parse_expression()?;
                    self.expect(TokenKind::RBracket, "']' after index expression")?;
                    expr = Expr::Index { target: Box::new(expr), index: Box::new(index) };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_arg_list(&mut self) -> RunResult<Vec<Expr>> {
        let mut args = Vec::new();
        if !self.check(TokenKind::RParen)? {
            loop {
                args.push(self.parse_expression()?);
                if !self.match_tok(TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "')' after arguments")?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> RunResult<Expr> {
        let t = self.peek()?;
        match t.kind {
            TokenKind::Int => {
                self.advance()?;
                Ok(Expr::IntLiteral(t.lexeme.to_string()))
            }
            TokenKind::Float => {
                self.advance()?;
                let is_f32 = matches!(t.lexeme.chars().last(), Some('f' | 'F'));
                Ok(Expr::FloatLiteral { text: t.lexeme.to_string(), is_f32 })
            }
            TokenKind::Str => {
                self.advance()?;
                Ok(Expr::StringLiteral(t.lexeme.to_string()))
            }
            TokenKind::TemplateStart => self.parse_template_literal(),
            TokenKind::True => {
                self.advance()?;
                Ok(Expr::BoolLiteral(true))
            }
            TokenKind::False => {
                self.advance()?;
                Ok(Expr::BoolLiteral(false))
            }
            TokenKind::Null => {
                self.advance()?;
                Ok(Expr::NullLiteral)
            }
            TokenKind::Undefined => {
                self.advance()?;
                Ok(Expr::UndefinedLiteral)
            }
            TokenKind::Ident => {
                if self.peek_at(1)?.kind == TokenKind::Arrow {
                    let name = self.expect_ident("a parameter name")?;
                    self.advance()?; // `->`
                    let body = Box::new(self.parse_body(None)?);
                    return Ok(Expr::Arrow { params: vec![name], body });
                }
                self.advance()?;
                Ok(Expr::Identifier(t.lexeme.to_string()))
            }
            TokenKind::LParen => self.parse_paren_or_arrow(),
            TokenKind::LBracket => self.parse_array_literal(),
            TokenKind::LBrace => self.parse_object_literal(),
            TokenKind::If => self.parse_if(),
            TokenKind::While => self.parse_while(),
            TokenKind::Do => self.parse_do_while(),
            TokenKind::For => self.parse_for(),
            TokenKind::Loop => self.parse_loop(),
            TokenKind::Break => {
                self.advance()?;
                Ok(Expr::Break)
            }
            TokenKind::Continue => {
                self.advance()?;
                Ok(Expr::Continue)
            }
            TokenKind::Return => {
                self.advance()?;
                if self.at_statement_boundary()? {
                    Ok(Expr::Return(None))
                } else {
                    Ok(Expr::Return(Some(Box::new(self.parse_expression()?))))
                }
            }
            _ => Err(self.error_at(&t, "an expression")),
        }
    }

    fn at_statement_boundary(&mut self) -> RunResult<bool> {
        Ok(matches!(
            self.peek()?.kind,
            TokenKind::Newline | TokenKind::Semi | TokenKind::Dedent | TokenKind::Eof
        ))
    }

    /// Implements the parenthesized-list disambiguation (spec §4.4.3).
    fn parse_paren_or_arrow(&mut self) -> RunResult<Expr> {
        self.advance()?; // `(`
        if self.check(TokenKind::RParen)? {
            self.advance()?;
            self.expect(TokenKind::Arrow, "'->' after '()'")?;
            let body = Box::new(self.parse_body(None)?);
            return Ok(Expr::Arrow { params: Vec::new(), body });
        }

        let first = self.advance()?;
        let lookahead = self.peek()?;
        let commit_to_params = first.kind == TokenKind::Ident
            && matches!(lookahead.kind, TokenKind::Comma | TokenKind::RParen | TokenKind::Arrow);

        if commit_to_params {
            let mut params = vec![first.lexeme.to_string()];
            while self.match_tok(TokenKind::Comma)? {
                params.push(self.expect_ident("a parameter name")?);
            }
            self.expect(TokenKind::RParen, "')' after parameters")?;
            self.expect(TokenKind::Arrow, "'->' after parameter list")?;
            let body = Box::new(self.parse_body(None)?);
            Ok(Expr::Arrow { params, body })
        } else {
            self.push_back(first);
            let expr = self.parse_expression()?;
            self.expect(TokenKind::RParen, "')' to close grouped expression")?;
            Ok(expr)
        }
    }

    fn parse_array_literal(&mut self) -> RunResult<Expr> {
        self.advance()?; // `[`
        let mut items = Vec::new();
        if !self.check(TokenKind::RBracket)? {
            loop {
                items.push(self.parse_expression()?);
                if !self.match_tok(TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.expect(TokenKind::RBracket, "']' after array elements")?;
        Ok(Expr::Array(items))
    }

    fn parse_object_literal(&mut self) -> RunResult<Expr> {
        self.advance()?; // `{`
        let mut fields = Vec::new();
        if !self.check(TokenKind::RBrace)? {
            loop {
                let key = self.expect_ident("an object field name")?;
                self.expect(TokenKind::Colon, "':' after field name")?;
                let value = self.parse_expression()?;
                fields.push((key, value));
                if !self.match_tok(TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.expect(TokenKind::RBrace, "'}' after object fields")?;
        Ok(Expr::Object(fields))
    }

    fn parse_template_literal(&mut self) -> RunResult<Expr> {
        self.advance()?; // TEMPLATE_START
        let mut parts = Vec::new();
        loop {
            let t = self.advance()?;
            match t.kind {
                TokenKind::TemplateText => parts.push(TemplatePart::Text(t.lexeme.to_string())),
                TokenKind::TemplateSimpleVar => {
                    parts.push(TemplatePart::Expr(Box::new(Expr::Identifier(t.lexeme.to_string()))));
                }
                TokenKind::TemplateExprStart => {
                    let expr = self.parse_expression()?;
                    self.expect(TokenKind::TemplateExprEnd, "'}' to close template expression")?;
                    parts.push(TemplatePart::Expr(Box::new(expr)));
                }
                TokenKind::TemplateEnd => break,
                _ => return Err(self.error_at(&t, "template literal content")),
            }
        }
        Ok(Expr::TemplateLiteral(parts))
    }

    /// Shared helper for every strictly-left-associative binary level:
    /// parse one operand at the next-higher precedence, then fold in
    /// `(op, operand)` pairs while the current token matches the table.
    fn parse_left_binary(
        &mut self,
        mut next: impl FnMut(&mut Self) -> RunResult<Expr>,
        ops: &[(TokenKind, BinaryOp)],
    ) -> RunResult<Expr> {
        let mut left = next(self)?;
        loop {
            let kind = self.peek()?.kind;
            let Some(&(_, op)) = ops.iter().find(|(k, _)| *k == kind) else { break };
            self.advance()?;
            let right = next(self)?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }
}

/// `&&=`/`||=`/`??=` read the target before writing it; this produces the
/// read-side expression without re-parsing (assignment targets are always
/// identifiers, members, or index expressions, all cheap to duplicate).
fn clone_as_read(target: &Expr) -> Expr {
    match target {
        Expr::Identifier(name) => Expr::Identifier(name.clone()),
        Expr::Member { receiver, name, optional } => {
            Expr::Member { receiver: Box::new(clone_as_read(receiver)), name: name.clone(), optional: *optional }
        }
        Expr::Index { target, index } => {
            Expr::Index { target: Box::new(clone_as_read(target)), index: Box::new(clone_as_read(index)) }
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::{Parser, ParserMode};
    use crate::ast::{BinaryOp, Expr, Stmt};

    fn parse_expr(src: &str) -> Expr {
        let mut parser = Parser::new(src);
        let (block, errors) = parser.parse_program();
        assert!(errors.is_empty(), "unexpected parse errors: {errors:?}");
        assert_eq!(block.stmts.len(), 1);
        match block.stmts.into_iter().next().unwrap().kind {
            Stmt::Expr(e) => e,
            other => panic!("expected an expression statement, got {other:?}"),
        }
    }

    #[test]
    fn precedence_binds_multiplication_tighter_than_addition() {
        let expr = parse_expr("2 + 3 * 4");
        match expr {
            Expr::Binary { op: BinaryOp::Add, right, .. } => {
                assert!(matches!(*right, Expr::Binary { op: BinaryOp::Mul, .. }));
            }
            other => panic!("expected a top-level Add, got {other:?}"),
        }
    }

    #[test]
    fn assignment_is_right_associative() {
        let expr = parse_expr("a = b = 3");
        match expr {
            Expr::Assign { value, .. } => {
                assert!(matches!(*value, Expr::Assign { .. }));
            }
            other => panic!("expected Assign, got {other:?}"),
        }
    }

    #[test]
    fn bare_identifier_arrow_is_single_param() {
        let expr = parse_expr("x -> x + 1");
        match expr {
            Expr::Arrow { params, .. } => assert_eq!(params, vec!["x".to_string()]),
            other => panic!("expected Arrow, got {other:?}"),
        }
    }

    #[test]
    fn parenthesized_multi_param_arrow() {
        let expr = parse_expr("(x, y) -> x + y");
        match expr {
            Expr::Arrow { params, .. } => assert_eq!(params, vec!["x".to_string(), "y".to_string()]),
            other => panic!("expected Arrow, got {other:?}"),
        }
    }

    #[test]
    fn single_identifier_in_parens_is_a_grouped_expression_not_arrow() {
        let expr = parse_expr("(x) + 1");
        assert!(matches!(expr, Expr::Binary { op: BinaryOp::Add, .. }));
    }

    #[test]
    fn range_with_step() {
        let expr = parse_expr("1..10 step 2");
        match expr {
            Expr::Range { exclusive, step, .. } => {
                assert!(!exclusive);
                assert!(step.is_some());
            }
            other => panic!("expected Range, got {other:?}"),
        }
    }

    #[test]
    fn exclusive_range_operator() {
        let expr = parse_expr("0..<5");
        assert!(matches!(expr, Expr::Range { exclusive: true, .. }));
    }

    #[test]
    fn call_then_member_then_index_chain() {
        let expr = parse_expr("foo().bar[0]");
        assert!(matches!(expr, Expr::Index { .. }));
    }

    #[test]
    fn ternary_is_right_associative_with_else_chaining() {
        let expr = parse_expr("a ? 1 : b ? 2 : 3");
        match expr {
            Expr::Ternary { else_branch, .. } => {
                assert!(matches!(*else_branch, Expr::Ternary { .. }));
            }
            other => panic!("expected Ternary, got {other:?}"),
        }
    }

    #[test]
    fn if_elif_else_lowers_to_nested_if() {
        let expr = parse_expr("if a then 1 elif b then 2 else 3");
        match expr {
            Expr::If { else_branch, .. } => {
                assert!(matches!(*else_branch, Expr::If { .. }));
            }
            other => panic!("expected If, got {other:?}"),
        }
    }

    #[test]
    fn strict_mode_rejects_block_ending_in_var_decl() {
        let src = "x ->\n  var y = 1\n  var z = y + 1\n";
        let mut parser = Parser::new(src);
        let (_, errors) = parser.parse_program();
        assert!(!errors.is_empty());
    }

    #[test]
    fn lenient_mode_accepts_block_ending_in_var_decl() {
        let src = "x ->\n  var y = 1\n  var z = y + 1\n";
        let mut parser = Parser::new(src).with_mode(ParserMode::Lenient);
        let (block, errors) = parser.parse_program();
        assert!(errors.is_empty(), "unexpected parse errors: {errors:?}");
        assert_eq!(block.stmts.len(), 1);
    }

    #[test]
    fn val_without_initializer_is_a_syntax_error() {
        let mut parser = Parser::new("val x");
        let (_, errors) = parser.parse_program();
        assert!(!errors.is_empty());
    }
}
