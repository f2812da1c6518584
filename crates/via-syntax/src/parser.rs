//! Parser (§4.2): recursive descent for statements and types, Pratt-style
//! precedence climbing for expressions. Produces the single arena-allocated
//! AST (§3.2); the root of a compilation unit is an ordered sequence of
//! statement nodes.
//!
//! Error handling follows §4.2: one diagnostic per offending token, then the
//! parser tries to continue by consuming the token (non-fatal); unexpected
//! EOF inside a construct bails out of the whole parse with a single
//! top-level diagnostic.

use crate::ast::{
    Attribute, AssignOp, BinaryOp, IfArm, IntrinsicKind, Literal, Node, NodeKind, Param, StepOp, UnaryOp,
};
use crate::token::{Keyword, Punct, Token, TokenKind};
use via_core::{Arena, DiagnosticBus, Span};

/// A fatal parse failure: unexpected end of input inside a construct
/// (§4.2). Carries nothing — the single top-level diagnostic has already
/// been pushed to the bus by the time this is returned.
struct Bailout;

type PResult<T> = Result<T, Bailout>;

/// Parses a full compilation unit, returning the ordered statement list
/// (§3.2) allocated in `arena`. Diagnostics accumulate in `diagnostics`;
/// when parsing bails out early, whatever statements were already parsed are
/// still returned alongside the diagnostic explaining the early stop.
pub fn parse<'a>(arena: &'a Arena, tokens: &[Token<'a>], diagnostics: &mut DiagnosticBus) -> &'a [&'a Node<'a>] {
    let mut parser = Parser { tokens, pos: 0, arena, diagnostics, pending_attributes: Vec::new() };
    let mut statements = Vec::new();
    while !parser.at_eof() {
        match parser.parse_statement() {
            Ok(stmt) => statements.push(stmt),
            Err(Bailout) => break,
        }
    }
    arena.alloc_slice_copy(&statements)
}

struct Parser<'t, 'a> {
    tokens: &'t [Token<'a>],
    pos: usize,
    arena: &'a Arena,
    diagnostics: &'t mut DiagnosticBus,
    pending_attributes: Vec<Attribute<'a>>,
}

impl<'t, 'a> Parser<'t, 'a> {
    fn current(&self) -> Token<'a> {
        self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn at_eof(&self) -> bool {
        self.current().kind == TokenKind::Eof
    }

    fn advance(&mut self) -> Token<'a> {
        let tok = self.current();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current().kind == kind
    }

    fn check_punct(&self, p: Punct) -> bool {
        self.current().kind == TokenKind::Punct(p)
    }

    fn check_kw(&self, k: Keyword) -> bool {
        self.current().kind == TokenKind::Keyword(k)
    }

    fn eat_punct(&mut self, p: Punct) -> bool {
        if self.check_punct(p) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Reports a non-fatal diagnostic at the current token and consumes it,
    /// per §4.2's "tries to continue by consuming the offending token".
    fn error_here(&mut self, expected: &str) {
        let tok = self.current();
        self.diagnostics.error(format!("expected {expected}, found {:?}", tok.kind), tok.span);
    }

    fn expect_punct(&mut self, p: Punct, expected: &str) -> PResult<Span> {
        if self.check(TokenKind::Punct(p)) {
            Ok(self.advance().span)
        } else if self.at_eof() {
            self.bail(expected)
        } else {
            self.error_here(expected);
            self.advance();
            Ok(self.current().span)
        }
    }

    fn expect_identifier(&mut self) -> PResult<&'a str> {
        if self.check(TokenKind::Identifier) {
            Ok(self.advance().lexeme)
        } else if self.at_eof() {
            self.bail("identifier")
        } else {
            self.error_here("identifier");
            Ok(self.advance().lexeme)
        }
    }

    /// Unexpected EOF inside a construct: one top-level diagnostic, then the
    /// parse bails out entirely (§4.2).
    fn bail<T>(&mut self, expected: &str) -> PResult<T> {
        self.diagnostics.push(via_core::Diagnostic::error_flat(format!(
            "unexpected end of input, expected {expected}"
        )));
        Err(Bailout)
    }

    // -- Statements -------------------------------------------------------

    fn parse_statement(&mut self) -> PResult<&'a Node<'a>> {
        while self.check_punct(Punct::At) {
            self.parse_attribute()?;
        }
        let attrs = std::mem::take(&mut self.pending_attributes);

        let node = match self.current().kind {
            TokenKind::Keyword(Keyword::Local) => self.parse_decl(false)?,
            TokenKind::Keyword(Keyword::Global) => self.parse_decl(true)?,
            TokenKind::Keyword(Keyword::Const) => self.parse_const_decl()?,
            TokenKind::Keyword(Keyword::Fn) => self.parse_function_decl()?,
            TokenKind::Punct(Punct::LBrace | Punct::Colon) => self.parse_scope()?,
            TokenKind::Keyword(Keyword::If) => self.parse_if()?,
            TokenKind::Keyword(Keyword::Return) => self.parse_return()?,
            TokenKind::Keyword(Keyword::While) => self.parse_while()?,
            TokenKind::Keyword(Keyword::Defer) => self.parse_defer()?,
            TokenKind::Keyword(Keyword::Break) => {
                let span = self.advance().span;
                self.arena.alloc(Node::new(NodeKind::Break, span))
            }
            TokenKind::Keyword(Keyword::Continue) => {
                let span = self.advance().span;
                self.arena.alloc(Node::new(NodeKind::Continue, span))
            }
            TokenKind::Keyword(k) if !k.is_implemented() => {
                let tok = self.advance();
                self.diagnostics.error(format!("'{}' is not yet supported", tok.lexeme), tok.span);
                self.arena.alloc(Node::new(NodeKind::ExprStmt(self.nil_literal(tok.span)), tok.span))
            }
            _ => self.parse_assign_or_expr()?,
        };

        self.eat_punct(Punct::Semicolon);

        if attrs.is_empty() {
            Ok(node)
        } else {
            let node_mut: &mut Node<'a> = self.arena.alloc(*node);
            node_mut.attributes = self.arena.alloc_slice_copy(&attrs);
            Ok(node_mut)
        }
    }

    fn nil_literal(&self, span: Span) -> &'a Node<'a> {
        self.arena.alloc(Node::new(NodeKind::Literal(Literal::Nil), span))
    }

    fn parse_attribute(&mut self) -> PResult<()> {
        let begin = self.advance().span; // '@'
        let name = self.expect_identifier()?;
        let mut args = Vec::new();
        if self.eat_punct(Punct::LParen) {
            if !self.check_punct(Punct::RParen) {
                loop {
                    args.push(self.parse_expr(0)?);
                    if !self.eat_punct(Punct::Comma) {
                        break;
                    }
                }
            }
            self.expect_punct(Punct::RParen, "')'")?;
        }
        let span = begin.merge(self.tokens[self.pos.saturating_sub(1)].span);
        self.pending_attributes.push(Attribute { name, args: self.arena.alloc_slice_copy(&args), span });
        Ok(())
    }

    fn parse_decl(&mut self, is_global: bool) -> PResult<&'a Node<'a>> {
        let begin = self.advance().span; // local/global
        let is_const = self.check_kw(Keyword::Const) && {
            self.advance();
            true
        };
        self.finish_decl(begin, is_global, is_const)
    }

    fn parse_const_decl(&mut self) -> PResult<&'a Node<'a>> {
        let begin = self.advance().span; // const
        self.finish_decl(begin, false, true)
    }

    fn finish_decl(&mut self, begin: Span, is_global: bool, is_const: bool) -> PResult<&'a Node<'a>> {
        let name = self.expect_identifier()?;
        let declared_type = if self.eat_punct(Punct::Colon) {
            self.parse_type()?
        } else {
            self.arena.alloc(Node::new(NodeKind::TypeAuto, begin))
        };
        let initializer = if self.eat_punct(Punct::Assign) { Some(self.parse_expr(0)?) } else { None };
        let end = initializer.map_or(declared_type.span, |e| e.span);
        let span = begin.merge(end);
        Ok(self
            .arena
            .alloc(Node::new(NodeKind::Declaration { is_global, is_const, name, declared_type, initializer }, span)))
    }

    fn parse_function_decl(&mut self) -> PResult<&'a Node<'a>> {
        let begin = self.advance().span; // fn
        let name = self.expect_identifier()?;
        let (params, return_type, body) = self.parse_fn_signature_and_body(begin)?;
        let span = begin.merge(body.span);
        Ok(self.arena.alloc(Node::new(NodeKind::FunctionDecl { name, params, return_type, body }, span)))
    }

    fn parse_function_literal(&mut self) -> PResult<&'a Node<'a>> {
        let begin = self.advance().span; // fn
        let (params, return_type, body) = self.parse_fn_signature_and_body(begin)?;
        let span = begin.merge(body.span);
        Ok(self.arena.alloc(Node::new(NodeKind::FunctionLiteral { params, return_type, body }, span)))
    }

    fn parse_fn_signature_and_body(
        &mut self,
        begin: Span,
    ) -> PResult<(&'a [Param<'a>], &'a Node<'a>, &'a Node<'a>)> {
        self.expect_punct(Punct::LParen, "'('")?;
        let mut params = Vec::new();
        if !self.check_punct(Punct::RParen) {
            loop {
                let pname = self.expect_identifier()?;
                self.expect_punct(Punct::Colon, "':'")?;
                let ty = self.parse_type()?;
                params.push(Param { name: pname, ty, span: ty.span });
                if !self.eat_punct(Punct::Comma) {
                    break;
                }
            }
        }
        self.expect_punct(Punct::RParen, "')'")?;
        let return_type = if self.eat_punct(Punct::Arrow) {
            self.parse_type()?
        } else {
            self.arena.alloc(Node::new(NodeKind::TypeAuto, begin))
        };
        let body = self.parse_scope()?;
        Ok((self.arena.alloc_slice_copy(&params), return_type, body))
    }

    /// `scope := "{" stmt* "}" | ":" stmt` (§4.2). The single-statement form
    /// is wrapped in a one-element `Scope` so every construct with a body
    /// (`if`, `while`, `fn`) sees a uniform shape.
    fn parse_scope(&mut self) -> PResult<&'a Node<'a>> {
        if self.eat_punct(Punct::Colon) {
            let begin = self.tokens[self.pos.saturating_sub(1)].span;
            let stmt = self.parse_statement()?;
            let span = begin.merge(stmt.span);
            return Ok(self.arena.alloc(Node::new(NodeKind::Scope(self.arena.alloc_slice_copy(&[stmt])), span)));
        }

        let begin = self.expect_punct(Punct::LBrace, "'{'")?;
        let mut stmts = Vec::new();
        while !self.check_punct(Punct::RBrace) {
            if self.at_eof() {
                return self.bail("'}'");
            }
            stmts.push(self.parse_statement()?);
        }
        let end = self.advance().span; // '}'
        Ok(self.arena.alloc(Node::new(NodeKind::Scope(self.arena.alloc_slice_copy(&stmts)), begin.merge(end))))
    }

    fn parse_if(&mut self) -> PResult<&'a Node<'a>> {
        let begin = self.advance().span; // if
        let mut arms = Vec::new();
        let cond = self.parse_expr(0)?;
        let body = self.parse_scope()?;
        arms.push(IfArm { cond, body });
        while self.check_kw(Keyword::Elif) {
            self.advance();
            let cond = self.parse_expr(0)?;
            let body = self.parse_scope()?;
            arms.push(IfArm { cond, body });
        }
        let else_branch = if self.check_kw(Keyword::Else) {
            self.advance();
            Some(self.parse_scope()?)
        } else {
            None
        };
        let end = else_branch.map_or(arms[arms.len() - 1].body.span, |e| e.span);
        Ok(self.arena.alloc(Node::new(
            NodeKind::If { arms: self.arena.alloc_slice_copy(&arms), else_branch },
            begin.merge(end),
        )))
    }

    fn parse_return(&mut self) -> PResult<&'a Node<'a>> {
        let begin = self.advance().span; // return
        let value = if self.starts_expr() { Some(self.parse_expr(0)?) } else { None };
        let span = value.map_or(begin, |v| begin.merge(v.span));
        Ok(self.arena.alloc(Node::new(NodeKind::Return(value), span)))
    }

    fn parse_while(&mut self) -> PResult<&'a Node<'a>> {
        let begin = self.advance().span; // while
        let cond = self.parse_expr(0)?;
        let body = self.parse_scope()?;
        let span = begin.merge(body.span);
        Ok(self.arena.alloc(Node::new(NodeKind::While { cond, body }, span)))
    }

    fn parse_defer(&mut self) -> PResult<&'a Node<'a>> {
        let begin = self.advance().span; // defer
        let stmt = self.parse_statement()?;
        let span = begin.merge(stmt.span);
        Ok(self.arena.alloc(Node::new(NodeKind::Defer(stmt), span)))
    }

    fn parse_assign_or_expr(&mut self) -> PResult<&'a Node<'a>> {
        let expr = self.parse_expr(0)?;
        if let Some(op) = self.peek_assign_op() {
            self.advance();
            let value = self.parse_expr(0)?;
            let span = expr.span.merge(value.span);
            return Ok(self.arena.alloc(Node::new(NodeKind::Assignment { target: expr, op, value }, span)));
        }
        Ok(self.arena.alloc(Node::new(NodeKind::ExprStmt(expr), expr.span)))
    }

    fn peek_assign_op(&self) -> Option<AssignOp> {
        Some(match self.current().kind {
            TokenKind::Punct(Punct::Assign) => AssignOp::Assign,
            TokenKind::Punct(Punct::PlusAssign) => AssignOp::AddAssign,
            TokenKind::Punct(Punct::MinusAssign) => AssignOp::SubAssign,
            TokenKind::Punct(Punct::StarAssign) => AssignOp::MulAssign,
            TokenKind::Punct(Punct::SlashAssign) => AssignOp::DivAssign,
            TokenKind::Punct(Punct::PercentAssign) => AssignOp::ModAssign,
            TokenKind::Punct(Punct::CaretAssign) => AssignOp::PowAssign,
            _ => return None,
        })
    }

    fn starts_expr(&self) -> bool {
        !matches!(
            self.current().kind,
            TokenKind::Eof
                | TokenKind::Punct(Punct::RBrace | Punct::Semicolon)
                | TokenKind::Keyword(
                    Keyword::Elif | Keyword::Else,
                )
        )
    }

    // -- Expressions (Pratt) ----------------------------------------------

    fn precedence(kind: TokenKind) -> Option<u8> {
        Some(match kind {
            TokenKind::Punct(Punct::Caret) => 4,
            TokenKind::Punct(Punct::Star | Punct::Slash | Punct::Percent) => 3,
            TokenKind::Punct(Punct::Plus | Punct::Minus) => 2,
            TokenKind::Punct(Punct::EqEq | Punct::NotEq | Punct::Lt | Punct::Gt | Punct::LtEq | Punct::GtEq) => 1,
            TokenKind::Keyword(Keyword::And | Keyword::Or) => 1,
            _ => return None,
        })
    }

    fn binary_op(kind: TokenKind) -> BinaryOp {
        match kind {
            TokenKind::Punct(Punct::Caret) => BinaryOp::Pow,
            TokenKind::Punct(Punct::Star) => BinaryOp::Mul,
            TokenKind::Punct(Punct::Slash) => BinaryOp::Div,
            TokenKind::Punct(Punct::Percent) => BinaryOp::Mod,
            TokenKind::Punct(Punct::Plus) => BinaryOp::Add,
            TokenKind::Punct(Punct::Minus) => BinaryOp::Sub,
            TokenKind::Punct(Punct::EqEq) => BinaryOp::Eq,
            TokenKind::Punct(Punct::NotEq) => BinaryOp::Neq,
            TokenKind::Punct(Punct::Lt) => BinaryOp::Lt,
            TokenKind::Punct(Punct::Gt) => BinaryOp::Gt,
            TokenKind::Punct(Punct::LtEq) => BinaryOp::Le,
            TokenKind::Punct(Punct::GtEq) => BinaryOp::Ge,
            TokenKind::Keyword(Keyword::And) => BinaryOp::And,
            TokenKind::Keyword(Keyword::Or) => BinaryOp::Or,
            _ => unreachable!("binary_op called on non-operator token"),
        }
    }

    /// `binary(p) := unary { op where prec(op) >= p : binary(prec(op)+1) }*`
    fn parse_expr(&mut self, min_prec: u8) -> PResult<&'a Node<'a>> {
        let mut lhs = self.parse_unary()?;
        while let Some(prec) = Self::precedence(self.current().kind) {
            if prec < min_prec {
                break;
            }
            let op_tok = self.advance();
            let op = Self::binary_op(op_tok.kind);
            let rhs = self.parse_expr(prec + 1)?;
            let span = lhs.span.merge(rhs.span);
            lhs = self.arena.alloc(Node::new(NodeKind::Binary { op, lhs, rhs }, span));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> PResult<&'a Node<'a>> {
        let op = match self.current().kind {
            TokenKind::Punct(Punct::Minus) => Some(UnaryOp::Neg),
            TokenKind::Punct(Punct::PlusPlus) => Some(UnaryOp::PreInc),
            TokenKind::Punct(Punct::MinusMinus) => Some(UnaryOp::PreDec),
            TokenKind::Punct(Punct::Hash) => Some(UnaryOp::Len),
            _ => None,
        };
        if let Some(op) = op {
            let begin = self.advance().span;
            let operand = self.parse_unary()?;
            let span = begin.merge(operand.span);
            return Ok(self.arena.alloc(Node::new(NodeKind::Unary { op, operand }, span)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> PResult<&'a Node<'a>> {
        let mut expr = self.parse_primary()?;
        loop {
            expr = match self.current().kind {
                TokenKind::Punct(Punct::Dot) => {
                    self.advance();
                    let name = self.expect_identifier()?;
                    let span = expr.span;
                    let index = self.arena.alloc(Node::new(NodeKind::Literal(Literal::String(name)), span));
                    self.arena.alloc(Node::new(NodeKind::Index { target: expr, index }, span))
                }
                TokenKind::Punct(Punct::LBracket) => {
                    self.advance();
                    let index = self.parse_expr(0)?;
                    let end = self.expect_punct(Punct::RBracket, "']'")?;
                    let span = expr.span.merge(end);
                    self.arena.alloc(Node::new(NodeKind::Index { target: expr, index }, span))
                }
                TokenKind::Punct(Punct::LParen) => {
                    self.advance();
                    let mut args = Vec::new();
                    if !self.check_punct(Punct::RParen) {
                        loop {
                            args.push(self.parse_expr(0)?);
                            if !self.eat_punct(Punct::Comma) {
                                break;
                            }
                        }
                    }
                    let end = self.expect_punct(Punct::RParen, "')'")?;
                    let span = expr.span.merge(end);
                    self.arena.alloc(Node::new(
                        NodeKind::Call { callee: expr, args: self.arena.alloc_slice_copy(&args) },
                        span,
                    ))
                }
                TokenKind::Punct(Punct::PlusPlus) => {
                    let end = self.advance().span;
                    self.arena.alloc(Node::new(NodeKind::Step { op: StepOp::Inc, operand: expr }, expr.span.merge(end)))
                }
                TokenKind::Punct(Punct::MinusMinus) => {
                    let end = self.advance().span;
                    self.arena.alloc(Node::new(NodeKind::Step { op: StepOp::Dec, operand: expr }, expr.span.merge(end)))
                }
                TokenKind::Keyword(Keyword::As) => {
                    self.advance();
                    let ty = self.parse_type()?;
                    let span = expr.span.merge(ty.span);
                    self.arena.alloc(Node::new(NodeKind::Cast { expr, ty }, span))
                }
                _ => break,
            };
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> PResult<&'a Node<'a>> {
        let tok = self.current();
        match tok.kind {
            TokenKind::Int => {
                self.advance();
                Ok(self.arena.alloc(Node::new(NodeKind::Literal(Literal::Int(parse_int_literal(tok.lexeme))), tok.span)))
            }
            TokenKind::Float => {
                self.advance();
                let value = tok.lexeme.parse::<f32>().unwrap_or(0.0);
                Ok(self.arena.alloc(Node::new(NodeKind::Literal(Literal::Float(value)), tok.span)))
            }
            TokenKind::True => {
                self.advance();
                Ok(self.arena.alloc(Node::new(NodeKind::Literal(Literal::Bool(true)), tok.span)))
            }
            TokenKind::False => {
                self.advance();
                Ok(self.arena.alloc(Node::new(NodeKind::Literal(Literal::Bool(false)), tok.span)))
            }
            TokenKind::Nil => {
                self.advance();
                Ok(self.arena.alloc(Node::new(NodeKind::Literal(Literal::Nil), tok.span)))
            }
            TokenKind::String => {
                self.advance();
                let decoded = decode_string_literal(tok.lexeme);
                let owned = self.arena.alloc_str(&decoded);
                Ok(self.arena.alloc(Node::new(NodeKind::Literal(Literal::String(owned)), tok.span)))
            }
            TokenKind::Keyword(Keyword::Typeof) => {
                self.advance();
                let arg = self.parse_expr(2)?;
                let span = tok.span.merge(arg.span);
                Ok(self.arena.alloc(Node::new(NodeKind::Intrinsic { kind: IntrinsicKind::TypeOf, arg: Some(arg) }, span)))
            }
            TokenKind::Keyword(Keyword::Type) => {
                self.advance();
                let ty = self.parse_type()?;
                let span = tok.span.merge(ty.span);
                Ok(self.arena.alloc(Node::new(NodeKind::Intrinsic { kind: IntrinsicKind::Type, arg: Some(ty) }, span)))
            }
            TokenKind::Keyword(Keyword::Fn) => self.parse_function_literal(),
            TokenKind::Identifier if tok.lexeme == "print" || tok.lexeme == "error" || tok.lexeme == "nameof" => {
                self.advance();
                let kind = match tok.lexeme {
                    "print" => IntrinsicKind::Print,
                    "error" => IntrinsicKind::Error,
                    _ => IntrinsicKind::NameOf,
                };
                let arg = self.parse_expr(2)?;
                let span = tok.span.merge(arg.span);
                Ok(self.arena.alloc(Node::new(NodeKind::Intrinsic { kind, arg: Some(arg) }, span)))
            }
            TokenKind::Identifier if tok.lexeme == "try" => {
                self.advance();
                let arg = self.parse_expr(2)?;
                let span = tok.span.merge(arg.span);
                Ok(self.arena.alloc(Node::new(NodeKind::Intrinsic { kind: IntrinsicKind::Try, arg: Some(arg) }, span)))
            }
            TokenKind::Identifier if tok.lexeme == "deep_eq" => {
                self.advance();
                self.expect_punct(Punct::LParen, "'('")?;
                let lhs = self.parse_expr(0)?;
                self.expect_punct(Punct::Comma, "','")?;
                let rhs = self.parse_expr(0)?;
                let end = self.expect_punct(Punct::RParen, "')'")?;
                let span = tok.span.merge(end);
                Ok(self.arena.alloc(Node::new(NodeKind::DeepEq { lhs, rhs }, span)))
            }
            TokenKind::Identifier => {
                self.advance();
                Ok(self.arena.alloc(Node::new(NodeKind::Symbol(tok.lexeme), tok.span)))
            }
            TokenKind::Punct(Punct::LParen) => {
                self.advance();
                let inner = self.parse_expr(0)?;
                let end = self.expect_punct(Punct::RParen, "')'")?;
                let span = tok.span.merge(end);
                Ok(self.arena.alloc(Node::new(NodeKind::Group(inner), span)))
            }
            TokenKind::Punct(Punct::LBracket) => {
                self.advance();
                let mut elements = Vec::new();
                if !self.check_punct(Punct::RBracket) {
                    loop {
                        elements.push(self.parse_expr(0)?);
                        if !self.eat_punct(Punct::Comma) {
                            break;
                        }
                    }
                }
                let end = self.expect_punct(Punct::RBracket, "']'")?;
                let span = tok.span.merge(end);
                Ok(self
                    .arena
                    .alloc(Node::new(NodeKind::ArrayLiteral(self.arena.alloc_slice_copy(&elements)), span)))
            }
            TokenKind::Eof => self.bail("expression"),
            _ => {
                self.error_here("expression");
                self.advance();
                Ok(self.nil_literal(tok.span))
            }
        }
    }

    // -- Types --------------------------------------------------------------

    fn parse_type(&mut self) -> PResult<&'a Node<'a>> {
        let base = self.parse_type_prim()?;
        if self.check_punct(Punct::Question) {
            let end = self.advance().span;
            let span = base.span.merge(end);
            return Ok(self.arena.alloc(Node::new(NodeKind::TypeOptional(base), span)));
        }
        Ok(base)
    }

    fn parse_type_prim(&mut self) -> PResult<&'a Node<'a>> {
        let tok = self.current();
        match tok.kind {
            TokenKind::Keyword(Keyword::Fn) | TokenKind::Punct(Punct::LParen) => {
                let begin = self.advance().span;
                let mut params = Vec::new();
                if !self.check_punct(Punct::RParen) {
                    loop {
                        params.push(self.parse_type()?);
                        if !self.eat_punct(Punct::Comma) {
                            break;
                        }
                    }
                }
                self.expect_punct(Punct::RParen, "')'")?;
                self.expect_punct(Punct::Arrow, "'->'")?;
                let ret = self.parse_type()?;
                let span = begin.merge(ret.span);
                Ok(self
                    .arena
                    .alloc(Node::new(NodeKind::TypeFunction { params: self.arena.alloc_slice_copy(&params), ret }, span)))
            }
            TokenKind::Punct(Punct::LBracket) => {
                let begin = self.advance().span;
                let elem = self.parse_type()?;
                let end = self.expect_punct(Punct::RBracket, "']'")?;
                Ok(self.arena.alloc(Node::new(NodeKind::TypeArray(elem), begin.merge(end))))
            }
            TokenKind::Identifier => {
                self.advance();
                if tok.lexeme == "auto" {
                    return Ok(self.arena.alloc(Node::new(NodeKind::TypeAuto, tok.span)));
                }
                if self.check_punct(Punct::Lt) {
                    self.advance();
                    let mut args = Vec::new();
                    loop {
                        args.push(self.parse_type()?);
                        if !self.eat_punct(Punct::Comma) {
                            break;
                        }
                    }
                    let end = self.expect_punct(Punct::Gt, "'>'")?;
                    let span = tok.span.merge(end);
                    if tok.lexeme == "dict" && args.len() == 2 {
                        return Ok(self.arena.alloc(Node::new(NodeKind::TypeDict { key: args[0], value: args[1] }, span)));
                    }
                    return Ok(self
                        .arena
                        .alloc(Node::new(NodeKind::TypeGeneric { name: tok.lexeme, args: self.arena.alloc_slice_copy(&args) }, span)));
                }
                Ok(self.arena.alloc(Node::new(NodeKind::TypePrimitive(tok.lexeme), tok.span)))
            }
            TokenKind::Eof => self.bail("type"),
            _ => {
                self.error_here("type");
                self.advance();
                Ok(self.arena.alloc(Node::new(NodeKind::TypeAuto, tok.span)))
            }
        }
    }
}

/// Decodes `\n \t \r \\ \"`; any other `\x` passes `x` through literally
/// (§4.1, §6.2).
fn decode_string_literal(raw: &str) -> String {
    let inner = &raw[1..raw.len().saturating_sub(1).max(1)];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some('\\') => out.push('\\'),
                Some('"') => out.push('"'),
                Some(other) => out.push(other),
                None => {}
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Decodes `0x…`/`0b…` prefixes as well as plain decimal (§4.1: "the parser
/// decodes" the prefix carried in the lexeme).
fn parse_int_literal(lexeme: &str) -> i32 {
    if let Some(hex) = lexeme.strip_prefix("0x").or_else(|| lexeme.strip_prefix("0X")) {
        return i32::from_str_radix(hex, 16).unwrap_or(0);
    }
    if let Some(bin) = lexeme.strip_prefix("0b").or_else(|| lexeme.strip_prefix("0B")) {
        return i32::from_str_radix(bin, 2).unwrap_or(0);
    }
    lexeme.parse::<i32>().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;

    fn parse_src<'a>(arena: &'a Arena, src: &'a str, diagnostics: &mut DiagnosticBus) -> &'a [&'a Node<'a>] {
        let tokens = lex(src);
        parse(arena, &tokens, diagnostics)
    }

    #[test]
    fn parses_declaration_with_initializer() {
        let arena = Arena::new();
        let mut diags = DiagnosticBus::new();
        let stmts = parse_src(&arena, "local x = 10", &mut diags);
        assert!(diags.records().is_empty());
        assert_eq!(stmts.len(), 1);
        assert!(matches!(stmts[0].kind, NodeKind::Declaration { is_global: false, is_const: false, .. }));
    }

    #[test]
    fn parses_print_intrinsic_with_binary_precedence() {
        let arena = Arena::new();
        let mut diags = DiagnosticBus::new();
        let stmts = parse_src(&arena, "print 1 + 2 * 3", &mut diags);
        assert_eq!(stmts.len(), 1);
        let NodeKind::ExprStmt(expr) = stmts[0].kind else { panic!("expected expr stmt") };
        let NodeKind::Intrinsic { kind: IntrinsicKind::Print, arg: Some(arg) } = expr.kind else {
            panic!("expected print intrinsic")
        };
        let NodeKind::Binary { op: BinaryOp::Add, lhs, rhs } = arg.kind else { panic!("expected top-level add") };
        assert!(matches!(lhs.kind, NodeKind::Literal(Literal::Int(1))));
        assert!(matches!(rhs.kind, NodeKind::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn parses_while_loop_with_braces() {
        let arena = Arena::new();
        let mut diags = DiagnosticBus::new();
        let stmts = parse_src(&arena, "local x = 10 while x > 0 { x = x - 1 } print x", &mut diags);
        assert!(diags.records().is_empty(), "{:?}", diags.records());
        assert_eq!(stmts.len(), 3);
        assert!(matches!(stmts[1].kind, NodeKind::While { .. }));
    }

    #[test]
    fn parses_function_decl_with_colon_scope() {
        let arena = Arena::new();
        let mut diags = DiagnosticBus::new();
        let stmts = parse_src(
            &arena,
            "fn f(n: int) -> int { if n < 2 : return n return f(n-1)+f(n-2) }",
            &mut diags,
        );
        assert!(diags.records().is_empty(), "{:?}", diags.records());
        assert_eq!(stmts.len(), 1);
        let NodeKind::FunctionDecl { params, .. } = stmts[0].kind else { panic!("expected fn decl") };
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].name, "n");
    }

    #[test]
    fn array_index_assignment_and_length() {
        let arena = Arena::new();
        let mut diags = DiagnosticBus::new();
        let stmts = parse_src(&arena, "local a = [1,2,3] a[5] = 9 print #a", &mut diags);
        assert!(diags.records().is_empty(), "{:?}", diags.records());
        assert_eq!(stmts.len(), 3);
        assert!(matches!(stmts[1].kind, NodeKind::Assignment { .. }));
    }

    #[test]
    fn unknown_keyword_position_reports_not_yet_supported() {
        let arena = Arena::new();
        let mut diags = DiagnosticBus::new();
        let _ = parse_src(&arena, "for", &mut diags);
        assert!(diags.has_errors());
        assert!(diags.records()[0].message.contains("not yet supported"));
    }
}
