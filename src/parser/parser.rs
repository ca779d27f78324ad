//! Recursive Descent Parser
//!
//! Consumes tokens from the lexer and produces a typed AST. Every
//! production returns on the first error with the position it occurred
//! at; recursion depth and input size are bounded so parsing always
//! terminates on arbitrary input.
//!
//! Grammar (simplified):
//!   program    ::= statement*
//!   statement  ::= let | fndef | if | while | for | return | break |
//!                  continue | switch | defer | throw | try | import |
//!                  export | yield | block | assign-or-expr
//!   expr       ::= pipe
//!   pipe       ::= ternary ('|>' ternary)*
//!   ternary    ::= coalesce ('?' ternary ':' ternary)?
//!   coalesce   ::= or ('??' or)*
//!   or         ::= and ('||' and)*
//!   and        ::= equality ('&&' equality)*
//!   equality   ::= comparison (('==' | '!=') comparison)*
//!   comparison ::= range (('<' | '<=' | '>' | '>=') range)*
//!   range      ::= additive (('..' | '..=') additive)?
//!   additive   ::= mult (('+' | '-') mult)*
//!   mult       ::= unary (('*' | '/' | '%') unary)*
//!   unary      ::= ('!' | '-' | 'await') unary | postfix
//!   postfix    ::= primary (call | index | '.' field | '?.' field)*

use std::rc::Rc;

use crate::ast::types::{
    AssignOp, AssignTarget, Block, Expr, FuncDecl, ImportName, LetPattern, MatchArm, Param,
    Pattern, Program, Span, Stmt, UnaryOp,
};
use crate::ast::types::BinaryOp;
use crate::parser::lexer::{Lexer, Token, TokenKind};
use crate::parser::types::{ParseError, MAX_INPUT_SIZE, MAX_PARSER_DEPTH};

/// Parse a source string into a program.
pub fn parse(src: &str, source_name: &str) -> Result<Program, ParseError> {
    if src.len() > MAX_INPUT_SIZE {
        return Err(ParseError::new(source_name, "input too large", 1, 1));
    }
    let tokens = Lexer::new(src, source_name).tokenize()?;
    let mut parser = Parser::new(tokens, source_name);
    parser.parse_program()
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    source_name: Rc<str>,
    depth: usize,
    /// One entry per enclosing function literal/definition; set to true
    /// when a `yield` is seen so the function becomes a generator.
    fn_stack: Vec<bool>,
}

impl Parser {
    pub fn new(tokens: Vec<Token>, source_name: &str) -> Self {
        Self {
            tokens,
            pos: 0,
            source_name: Rc::from(source_name),
            depth: 0,
            fn_stack: Vec::new(),
        }
    }

    fn current(&self) -> &Token {
        // The token stream always ends with Eof.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn kind(&self) -> TokenKind {
        self.current().kind
    }

    fn kind_at(&self, offset: usize) -> TokenKind {
        self.tokens[(self.pos + offset).min(self.tokens.len() - 1)].kind
    }

    fn span(&self) -> Span {
        let t = self.current();
        Span::new(t.line, t.col)
    }

    fn advance(&mut self) -> Token {
        let tok = self.current().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.kind() == kind
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, ParseError> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.error_here(format!(
                "expected {}, found {}",
                kind.as_str(),
                self.kind().as_str()
            )))
        }
    }

    fn error_here(&self, message: impl Into<String>) -> ParseError {
        let t = self.current();
        ParseError::new(self.source_name.as_ref(), message, t.line, t.col)
    }

    fn enter(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_PARSER_DEPTH {
            return Err(self.error_here("expression nesting too deep"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    // ------------------------------------------------------------------
    // Program and statements
    // ------------------------------------------------------------------

    pub fn parse_program(&mut self) -> Result<Program, ParseError> {
        let mut body = Vec::new();
        self.skip_semicolons();
        while !self.check(TokenKind::Eof) {
            body.push(self.parse_statement()?);
            self.skip_semicolons();
        }
        Ok(Program { source_name: self.source_name.clone(), body })
    }

    fn skip_semicolons(&mut self) {
        while self.eat(TokenKind::Semicolon) {}
    }

    fn parse_statement(&mut self) -> Result<Stmt, ParseError> {
        self.enter()?;
        let result = self.parse_statement_inner();
        self.leave();
        result
    }

    fn parse_statement_inner(&mut self) -> Result<Stmt, ParseError> {
        let span = self.span();
        match self.kind() {
            TokenKind::Let => {
                self.advance();
                self.parse_let(false, span)
            }
            TokenKind::Const => {
                self.advance();
                self.parse_let(true, span)
            }
            TokenKind::Fn if self.kind_at(1) == TokenKind::Ident => {
                self.advance();
                let decl = self.parse_func(true, false, span)?;
                Ok(Stmt::FnDef { decl: Rc::new(decl), span })
            }
            TokenKind::Async
                if self.kind_at(1) == TokenKind::Fn && self.kind_at(2) == TokenKind::Ident =>
            {
                self.advance();
                self.advance();
                let decl = self.parse_func(true, true, span)?;
                Ok(Stmt::FnDef { decl: Rc::new(decl), span })
            }
            TokenKind::If => {
                self.advance();
                self.parse_if(span)
            }
            TokenKind::While => {
                self.advance();
                self.expect(TokenKind::LParen)?;
                let cond = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                let body = Box::new(self.parse_statement()?);
                Ok(Stmt::While { cond, body, span })
            }
            TokenKind::For => {
                self.advance();
                self.parse_for(span)
            }
            TokenKind::Return => {
                self.advance();
                let value = if matches!(
                    self.kind(),
                    TokenKind::Semicolon | TokenKind::RBrace | TokenKind::Eof
                ) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                Ok(Stmt::Return { value, span })
            }
            TokenKind::Break => {
                self.advance();
                Ok(Stmt::Break(span))
            }
            TokenKind::Continue => {
                self.advance();
                Ok(Stmt::Continue(span))
            }
            TokenKind::Switch => {
                self.advance();
                self.parse_switch(span)
            }
            TokenKind::Defer => {
                self.advance();
                let stmt = Box::new(self.parse_statement()?);
                Ok(Stmt::Defer { stmt, span })
            }
            TokenKind::Throw => {
                self.advance();
                let value = self.parse_expr()?;
                Ok(Stmt::Throw { value, span })
            }
            TokenKind::Try => {
                self.advance();
                self.parse_try(span)
            }
            TokenKind::Import => {
                self.advance();
                self.parse_import(span)
            }
            TokenKind::Export => {
                self.advance();
                self.parse_export(span)
            }
            TokenKind::Yield => {
                self.advance();
                match self.fn_stack.last_mut() {
                    Some(saw_yield) => *saw_yield = true,
                    None => return Err(self.error_here("yield outside of a function")),
                }
                let value = self.parse_expr()?;
                Ok(Stmt::Yield { value, span })
            }
            TokenKind::LBrace => {
                let block = self.parse_block()?;
                Ok(Stmt::Block(block, span))
            }
            TokenKind::Class | TokenKind::Struct | TokenKind::Enum => Err(self.error_here(
                format!("'{}' is reserved and not yet supported", self.kind().as_str()),
            )),
            _ => self.parse_assign_or_expr(),
        }
    }

    fn parse_let(&mut self, is_const: bool, span: Span) -> Result<Stmt, ParseError> {
        let pattern = match self.kind() {
            TokenKind::LBracket => {
                self.advance();
                let mut names = Vec::new();
                while !self.check(TokenKind::RBracket) {
                    names.push(self.expect(TokenKind::Ident)?.text);
                    if !self.eat(TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RBracket)?;
                LetPattern::List(names)
            }
            TokenKind::LBrace => {
                self.advance();
                let mut entries = Vec::new();
                while !self.check(TokenKind::RBrace) {
                    let key = self.expect(TokenKind::Ident)?.text;
                    let local = if self.eat(TokenKind::Colon) {
                        self.expect(TokenKind::Ident)?.text
                    } else {
                        key.clone()
                    };
                    entries.push((key, local));
                    if !self.eat(TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RBrace)?;
                LetPattern::Map(entries)
            }
            _ => LetPattern::Name(self.expect(TokenKind::Ident)?.text),
        };

        let init = if self.eat(TokenKind::Assign) {
            Some(self.parse_expr()?)
        } else {
            None
        };

        if init.is_none() && !matches!(pattern, LetPattern::Name(_)) {
            return Err(self.error_here("destructuring pattern requires an initializer"));
        }
        if init.is_none() && is_const {
            return Err(self.error_here("const declaration requires an initializer"));
        }

        Ok(Stmt::Let { pattern, init, is_const, span })
    }

    fn parse_if(&mut self, span: Span) -> Result<Stmt, ParseError> {
        self.expect(TokenKind::LParen)?;
        let cond = self.parse_expr()?;
        self.expect(TokenKind::RParen)?;
        let then_branch = Box::new(self.parse_statement()?);
        let else_branch = if self.eat(TokenKind::Else) {
            Some(Box::new(self.parse_statement()?))
        } else {
            None
        };
        Ok(Stmt::If { cond, then_branch, else_branch, span })
    }

    fn parse_for(&mut self, span: Span) -> Result<Stmt, ParseError> {
        if self.eat(TokenKind::LParen) {
            // C-style: for (init; cond; incr) body
            let init = if self.check(TokenKind::Semicolon) {
                None
            } else {
                Some(Box::new(self.parse_for_clause()?))
            };
            self.expect(TokenKind::Semicolon)?;
            let cond = if self.check(TokenKind::Semicolon) {
                None
            } else {
                Some(self.parse_expr()?)
            };
            self.expect(TokenKind::Semicolon)?;
            let incr = if self.check(TokenKind::RParen) {
                None
            } else {
                Some(Box::new(self.parse_for_clause()?))
            };
            self.expect(TokenKind::RParen)?;
            let body = Box::new(self.parse_statement()?);
            return Ok(Stmt::ForC { init, cond, incr, body, span });
        }

        let name = self.expect(TokenKind::Ident)?.text;
        let name2 = if self.eat(TokenKind::Comma) {
            Some(self.expect(TokenKind::Ident)?.text)
        } else {
            None
        };
        self.expect(TokenKind::In)?;
        let iterable = self.parse_expr()?;
        let body = Box::new(self.parse_statement()?);
        Ok(Stmt::ForIn { name, name2, iterable, body, span })
    }

    /// An init/increment clause of a C-style for: a `let` declaration,
    /// an assignment, or an expression.
    fn parse_for_clause(&mut self) -> Result<Stmt, ParseError> {
        let span = self.span();
        if self.eat(TokenKind::Let) {
            return self.parse_let(false, span);
        }
        if self.eat(TokenKind::Const) {
            return self.parse_let(true, span);
        }
        self.parse_assign_or_expr()
    }

    fn parse_assign_or_expr(&mut self) -> Result<Stmt, ParseError> {
        let span = self.span();
        let expr = self.parse_expr()?;

        let op = match self.kind() {
            TokenKind::Assign => Some(AssignOp::Set),
            TokenKind::PlusEq => Some(AssignOp::Add),
            TokenKind::MinusEq => Some(AssignOp::Sub),
            TokenKind::StarEq => Some(AssignOp::Mul),
            TokenKind::SlashEq => Some(AssignOp::Div),
            _ => None,
        };

        match op {
            Some(op) => {
                self.advance();
                let target = match expr {
                    Expr::Ident { name, .. } => AssignTarget::Name(name),
                    Expr::Index { target, index, .. } => {
                        AssignTarget::Index { target: *target, index: *index }
                    }
                    Expr::Field { target, name, optional: false, .. } => {
                        AssignTarget::Field { target: *target, name }
                    }
                    _ => return Err(self.error_here("invalid assignment target")),
                };
                let value = self.parse_expr()?;
                Ok(Stmt::Assign { target, op, value, span })
            }
            None => Ok(Stmt::Expr(expr)),
        }
    }

    fn parse_block(&mut self) -> Result<Block, ParseError> {
        self.expect(TokenKind::LBrace)?;
        let mut stmts = Vec::new();
        self.skip_semicolons();
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            stmts.push(self.parse_statement()?);
            self.skip_semicolons();
        }
        self.expect(TokenKind::RBrace)?;
        Ok(stmts)
    }

    fn parse_func(
        &mut self,
        named: bool,
        is_async: bool,
        span: Span,
    ) -> Result<FuncDecl, ParseError> {
        let name = if named {
            Some(self.expect(TokenKind::Ident)?.text)
        } else {
            None
        };

        self.expect(TokenKind::LParen)?;
        let mut params: Vec<Param> = Vec::new();
        let mut rest = None;
        while !self.check(TokenKind::RParen) {
            if self.eat(TokenKind::Ellipsis) {
                rest = Some(self.expect(TokenKind::Ident)?.text);
                if !self.check(TokenKind::RParen) {
                    return Err(self.error_here("rest parameter must be last"));
                }
                break;
            }
            let pname = self.expect(TokenKind::Ident)?.text;
            let default = if self.eat(TokenKind::Assign) {
                Some(self.parse_expr()?)
            } else {
                if params.iter().any(|p| p.default.is_some()) {
                    return Err(self.error_here(
                        "parameter without a default follows a defaulted parameter",
                    ));
                }
                None
            };
            params.push(Param { name: pname, default });
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;

        self.fn_stack.push(false);
        let body = self.parse_block();
        let is_generator = self.fn_stack.pop().unwrap_or(false);
        let body = body?;

        if is_async && is_generator {
            return Err(self.error_here("a function cannot be both async and a generator"));
        }

        Ok(FuncDecl {
            name,
            params,
            rest,
            body: Rc::new(body),
            is_async,
            is_generator,
            span,
        })
    }

    fn parse_switch(&mut self, span: Span) -> Result<Stmt, ParseError> {
        self.expect(TokenKind::LParen)?;
        let scrutinee = self.parse_expr()?;
        self.expect(TokenKind::RParen)?;
        self.expect(TokenKind::LBrace)?;

        let mut cases = Vec::new();
        let mut default = None;
        loop {
            self.skip_semicolons();
            match self.kind() {
                TokenKind::Case => {
                    self.advance();
                    let test = self.parse_expr()?;
                    self.expect(TokenKind::Colon)?;
                    cases.push((test, self.parse_case_body()?));
                }
                TokenKind::Default => {
                    if default.is_some() {
                        return Err(self.error_here("duplicate default case"));
                    }
                    self.advance();
                    self.expect(TokenKind::Colon)?;
                    default = Some(self.parse_case_body()?);
                }
                TokenKind::RBrace => {
                    self.advance();
                    break;
                }
                _ => return Err(self.error_here("expected 'case', 'default' or '}'")),
            }
        }

        Ok(Stmt::Switch { scrutinee, cases, default, span })
    }

    fn parse_case_body(&mut self) -> Result<Block, ParseError> {
        let mut stmts = Vec::new();
        self.skip_semicolons();
        while !matches!(
            self.kind(),
            TokenKind::Case | TokenKind::Default | TokenKind::RBrace | TokenKind::Eof
        ) {
            stmts.push(self.parse_statement()?);
            self.skip_semicolons();
        }
        Ok(stmts)
    }

    fn parse_try(&mut self, span: Span) -> Result<Stmt, ParseError> {
        let body = self.parse_block()?;
        let catch = if self.eat(TokenKind::Catch) {
            self.expect(TokenKind::LParen)?;
            let name = self.expect(TokenKind::Ident)?.text;
            self.expect(TokenKind::RParen)?;
            Some((name, self.parse_block()?))
        } else {
            None
        };
        let finally = if self.eat(TokenKind::Finally) {
            Some(self.parse_block()?)
        } else {
            None
        };
        if catch.is_none() && finally.is_none() {
            return Err(self.error_here("try requires a catch or finally block"));
        }
        Ok(Stmt::Try { body, catch, finally, span })
    }

    fn parse_import(&mut self, span: Span) -> Result<Stmt, ParseError> {
        let (default_name, names) = if self.check(TokenKind::LBrace) {
            self.advance();
            let mut names = Vec::new();
            while !self.check(TokenKind::RBrace) {
                let export = self.expect(TokenKind::Ident)?.text;
                let local = if self.eat(TokenKind::As) {
                    self.expect(TokenKind::Ident)?.text
                } else {
                    export.clone()
                };
                names.push(ImportName { export, local });
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RBrace)?;
            (None, names)
        } else {
            let name = self.expect(TokenKind::Ident)?.text;
            (Some(name), Vec::new())
        };
        self.expect(TokenKind::From)?;
        let path = self.parse_expr()?;
        Ok(Stmt::Import { default_name, names, path, span })
    }

    fn parse_export(&mut self, span: Span) -> Result<Stmt, ParseError> {
        if self.eat(TokenKind::LBrace) {
            let mut names = Vec::new();
            while !self.check(TokenKind::RBrace) {
                let local = self.expect(TokenKind::Ident)?.text;
                let export = if self.eat(TokenKind::As) {
                    self.expect(TokenKind::Ident)?.text
                } else {
                    local.clone()
                };
                names.push(ImportName { export, local });
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RBrace)?;
            return Ok(Stmt::ExportList { names, span });
        }

        let name = self.expect(TokenKind::Ident)?.text;
        self.expect(TokenKind::Assign)?;
        let value = self.parse_expr()?;
        Ok(Stmt::Export { name, value, span })
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    pub fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.enter()?;
        let result = self.parse_pipe();
        self.leave();
        result
    }

    fn parse_pipe(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_ternary()?;
        while self.check(TokenKind::PipeArrow) {
            let span = self.span();
            self.advance();
            let right = self.parse_ternary()?;
            // `x |> f(a)` pipes x in as the first argument; `x |> f`
            // becomes a plain call f(x).
            left = match right {
                Expr::Call { callee, mut args, span: call_span } => {
                    args.insert(0, left);
                    Expr::Call { callee, args, span: call_span }
                }
                Expr::MethodCall { target, method, mut args, span: call_span } => {
                    args.insert(0, left);
                    Expr::MethodCall { target, method, args, span: call_span }
                }
                other => Expr::Call { callee: Box::new(other), args: vec![left], span },
            };
        }
        Ok(left)
    }

    fn parse_ternary(&mut self) -> Result<Expr, ParseError> {
        let cond = self.parse_coalesce()?;
        if self.check(TokenKind::Question) {
            let span = self.span();
            self.advance();
            let then_expr = self.parse_ternary()?;
            self.expect(TokenKind::Colon)?;
            let else_expr = self.parse_ternary()?;
            return Ok(Expr::Ternary {
                cond: Box::new(cond),
                then_expr: Box::new(then_expr),
                else_expr: Box::new(else_expr),
                span,
            });
        }
        Ok(cond)
    }

    fn parse_coalesce(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_or()?;
        while self.check(TokenKind::QuestionQuestion) {
            let span = self.span();
            self.advance();
            let right = self.parse_or()?;
            left = Expr::Binary {
                op: BinaryOp::Coalesce,
                left: Box::new(left),
                right: Box::new(right),
                span,
            };
        }
        Ok(left)
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        while self.check(TokenKind::OrOr) {
            let span = self.span();
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Binary {
                op: BinaryOp::Or,
                left: Box::new(left),
                right: Box::new(right),
                span,
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_equality()?;
        while self.check(TokenKind::AndAnd) {
            let span = self.span();
            self.advance();
            let right = self.parse_equality()?;
            left = Expr::Binary {
                op: BinaryOp::And,
                left: Box::new(left),
                right: Box::new(right),
                span,
            };
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.kind() {
                TokenKind::EqEq => BinaryOp::Eq,
                TokenKind::BangEq => BinaryOp::Ne,
                _ => break,
            };
            let span = self.span();
            self.advance();
            let right = self.parse_comparison()?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right), span };
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_range()?;
        loop {
            let op = match self.kind() {
                TokenKind::Lt => BinaryOp::Lt,
                TokenKind::Le => BinaryOp::Le,
                TokenKind::Gt => BinaryOp::Gt,
                TokenKind::Ge => BinaryOp::Ge,
                _ => break,
            };
            let span = self.span();
            self.advance();
            let right = self.parse_range()?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right), span };
        }
        Ok(left)
    }

    fn parse_range(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_additive()?;
        let inclusive = match self.kind() {
            TokenKind::DotDot => false,
            TokenKind::DotDotEq => true,
            _ => return Ok(left),
        };
        let span = self.span();
        self.advance();
        let right = self.parse_additive()?;
        Ok(Expr::Range {
            start: Box::new(left),
            end: Box::new(right),
            inclusive,
            span,
        })
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_mult()?;
        loop {
            let op = match self.kind() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            let span = self.span();
            self.advance();
            let right = self.parse_mult()?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right), span };
        }
        Ok(left)
    }

    fn parse_mult(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.kind() {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => break,
            };
            let span = self.span();
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right), span };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        self.enter()?;
        let result = match self.kind() {
            TokenKind::Bang => {
                let span = self.span();
                self.advance();
                self.parse_unary().map(|e| Expr::Unary {
                    op: UnaryOp::Not,
                    expr: Box::new(e),
                    span,
                })
            }
            TokenKind::Minus => {
                let span = self.span();
                self.advance();
                self.parse_unary().map(|e| Expr::Unary {
                    op: UnaryOp::Neg,
                    expr: Box::new(e),
                    span,
                })
            }
            TokenKind::Await => {
                let span = self.span();
                self.advance();
                self.parse_unary().map(|e| Expr::Await { expr: Box::new(e), span })
            }
            _ => self.parse_postfix(),
        };
        self.leave();
        result
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.kind() {
                TokenKind::LParen => {
                    let span = self.span();
                    let args = self.parse_call_args()?;
                    expr = Expr::Call { callee: Box::new(expr), args, span };
                }
                TokenKind::LBracket => {
                    let span = self.span();
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(TokenKind::RBracket)?;
                    expr = Expr::Index {
                        target: Box::new(expr),
                        index: Box::new(index),
                        span,
                    };
                }
                TokenKind::Dot => {
                    let span = self.span();
                    self.advance();
                    let name = self.expect(TokenKind::Ident)?.text;
                    if self.check(TokenKind::LParen) {
                        let args = self.parse_call_args()?;
                        expr = Expr::MethodCall {
                            target: Box::new(expr),
                            method: name,
                            args,
                            span,
                        };
                    } else {
                        expr = Expr::Field {
                            target: Box::new(expr),
                            name,
                            optional: false,
                            span,
                        };
                    }
                }
                TokenKind::QuestionDot => {
                    let span = self.span();
                    self.advance();
                    let name = self.expect(TokenKind::Ident)?.text;
                    expr = Expr::Field {
                        target: Box::new(expr),
                        name,
                        optional: true,
                        span,
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_call_args(&mut self) -> Result<Vec<Expr>, ParseError> {
        self.expect(TokenKind::LParen)?;
        let mut args = Vec::new();
        while !self.check(TokenKind::RParen) {
            if self.check(TokenKind::Ellipsis) {
                let span = self.span();
                self.advance();
                let expr = self.parse_expr()?;
                args.push(Expr::Spread { expr: Box::new(expr), span });
            } else {
                args.push(self.parse_expr()?);
            }
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let span = self.span();
        match self.kind() {
            TokenKind::Int => {
                let tok = self.advance();
                Ok(Expr::Int(tok.int_value, span))
            }
            TokenKind::Float => {
                let tok = self.advance();
                Ok(Expr::Float(tok.float_value, span))
            }
            TokenKind::Str => {
                let tok = self.advance();
                Ok(Expr::Str(Rc::from(tok.text.as_str()), span))
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::Bool(true, span))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::Bool(false, span))
            }
            TokenKind::Nil => {
                self.advance();
                Ok(Expr::Nil(span))
            }
            TokenKind::StrPart => self.parse_interp(span),
            TokenKind::Ident => {
                let tok = self.advance();
                Ok(Expr::Ident { name: tok.text, span })
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(expr)
            }
            TokenKind::LBracket => {
                self.advance();
                let mut items = Vec::new();
                while !self.check(TokenKind::RBracket) {
                    if self.check(TokenKind::Ellipsis) {
                        let s = self.span();
                        self.advance();
                        let expr = self.parse_expr()?;
                        items.push(Expr::Spread { expr: Box::new(expr), span: s });
                    } else {
                        items.push(self.parse_expr()?);
                    }
                    if !self.eat(TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RBracket)?;
                Ok(Expr::List { items, span })
            }
            TokenKind::LBrace => {
                self.advance();
                let mut entries = Vec::new();
                while !self.check(TokenKind::RBrace) {
                    let key = match self.kind() {
                        TokenKind::Ident => self.advance().text,
                        TokenKind::Str => self.advance().text,
                        _ => return Err(self.error_here("expected map key")),
                    };
                    self.expect(TokenKind::Colon)?;
                    let value = self.parse_expr()?;
                    entries.push((key, value));
                    if !self.eat(TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RBrace)?;
                Ok(Expr::MapLit { entries, span })
            }
            TokenKind::Fn => {
                self.advance();
                let decl = self.parse_func(false, false, span)?;
                Ok(Expr::FuncLit { decl: Rc::new(decl), span })
            }
            TokenKind::Async => {
                self.advance();
                self.expect(TokenKind::Fn)?;
                let decl = self.parse_func(false, true, span)?;
                Ok(Expr::FuncLit { decl: Rc::new(decl), span })
            }
            TokenKind::Match => {
                self.advance();
                self.parse_match(span)
            }
            TokenKind::Class | TokenKind::Struct | TokenKind::Enum => Err(self.error_here(
                format!("'{}' is reserved and not yet supported", self.kind().as_str()),
            )),
            _ => Err(self.error_here(format!(
                "expected expression, found {}",
                self.kind().as_str()
            ))),
        }
    }

    /// Interpolated string literal: the lexer has already split it into
    /// StrPart / InterpStart … InterpEnd / StrEnd tokens.
    fn parse_interp(&mut self, span: Span) -> Result<Expr, ParseError> {
        let mut parts = Vec::new();
        loop {
            match self.kind() {
                TokenKind::StrPart => {
                    let tok = self.advance();
                    if !tok.text.is_empty() {
                        parts.push(Expr::Str(
                            Rc::from(tok.text.as_str()),
                            Span::new(tok.line, tok.col),
                        ));
                    }
                }
                TokenKind::InterpStart => {
                    self.advance();
                    let expr = self.parse_expr()?;
                    self.expect(TokenKind::InterpEnd)?;
                    parts.push(expr);
                }
                TokenKind::StrEnd => {
                    self.advance();
                    break;
                }
                _ => return Err(self.error_here("malformed string interpolation")),
            }
        }
        Ok(Expr::Interp { parts, span })
    }

    fn parse_match(&mut self, span: Span) -> Result<Expr, ParseError> {
        self.expect(TokenKind::LParen)?;
        let scrutinee = self.parse_expr()?;
        self.expect(TokenKind::RParen)?;
        self.expect(TokenKind::LBrace)?;

        let mut arms = Vec::new();
        let mut default = None;
        loop {
            self.skip_semicolons();
            match self.kind() {
                TokenKind::Case => {
                    let arm_span = self.span();
                    self.advance();
                    let pattern = self.parse_pattern()?;
                    let guard = if self.eat(TokenKind::If) {
                        Some(self.parse_expr()?)
                    } else {
                        None
                    };
                    self.expect(TokenKind::Colon)?;
                    let value = self.parse_expr()?;
                    arms.push(MatchArm { pattern, guard, value, span: arm_span });
                }
                TokenKind::Default => {
                    if default.is_some() {
                        return Err(self.error_here("duplicate default case"));
                    }
                    self.advance();
                    self.expect(TokenKind::Colon)?;
                    default = Some(Box::new(self.parse_expr()?));
                }
                TokenKind::RBrace => {
                    self.advance();
                    break;
                }
                _ => return Err(self.error_here("expected 'case', 'default' or '}'")),
            }
        }

        Ok(Expr::Match { scrutinee: Box::new(scrutinee), arms, default, span })
    }

    fn parse_pattern(&mut self) -> Result<Pattern, ParseError> {
        let span = self.span();
        match self.kind() {
            TokenKind::Underscore => {
                self.advance();
                Ok(Pattern::Wildcard)
            }
            TokenKind::Ident => {
                let tok = self.advance();
                Ok(Pattern::Binding(tok.text))
            }
            TokenKind::Int => {
                let tok = self.advance();
                Ok(Pattern::Literal(Expr::Int(tok.int_value, span)))
            }
            TokenKind::Float => {
                let tok = self.advance();
                Ok(Pattern::Literal(Expr::Float(tok.float_value, span)))
            }
            TokenKind::Minus => {
                self.advance();
                match self.kind() {
                    TokenKind::Int => {
                        let tok = self.advance();
                        Ok(Pattern::Literal(Expr::Int(-tok.int_value, span)))
                    }
                    TokenKind::Float => {
                        let tok = self.advance();
                        Ok(Pattern::Literal(Expr::Float(-tok.float_value, span)))
                    }
                    _ => Err(self.error_here("expected numeric literal after '-'")),
                }
            }
            TokenKind::Str => {
                let tok = self.advance();
                Ok(Pattern::Literal(Expr::Str(Rc::from(tok.text.as_str()), span)))
            }
            TokenKind::True => {
                self.advance();
                Ok(Pattern::Literal(Expr::Bool(true, span)))
            }
            TokenKind::False => {
                self.advance();
                Ok(Pattern::Literal(Expr::Bool(false, span)))
            }
            TokenKind::Nil => {
                self.advance();
                Ok(Pattern::Literal(Expr::Nil(span)))
            }
            TokenKind::LBracket => {
                self.advance();
                let mut items = Vec::new();
                while !self.check(TokenKind::RBracket) {
                    items.push(self.parse_pattern()?);
                    if !self.eat(TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RBracket)?;
                Ok(Pattern::List(items))
            }
            TokenKind::LBrace => {
                self.advance();
                let mut entries = Vec::new();
                while !self.check(TokenKind::RBrace) {
                    let key = self.expect(TokenKind::Ident)?.text;
                    let pat = if self.eat(TokenKind::Colon) {
                        self.parse_pattern()?
                    } else {
                        Pattern::Binding(key.clone())
                    };
                    entries.push((key, pat));
                    if !self.eat(TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RBrace)?;
                Ok(Pattern::Map(entries))
            }
            _ => Err(self.error_here("expected pattern")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> Program {
        parse(src, "<test>").expect("parse failed")
    }

    #[test]
    fn test_parse_let_and_expr() {
        let prog = parse_ok("let x = 1 + 2 * 3; x");
        assert_eq!(prog.body.len(), 2);
        match &prog.body[0] {
            Stmt::Let { pattern: LetPattern::Name(n), init: Some(_), is_const: false, .. } => {
                assert_eq!(n, "x");
            }
            other => panic!("unexpected stmt: {:?}", other),
        }
    }

    #[test]
    fn test_precedence_mul_over_add() {
        let prog = parse_ok("1 + 2 * 3");
        match &prog.body[0] {
            Stmt::Expr(Expr::Binary { op: BinaryOp::Add, right, .. }) => match right.as_ref() {
                Expr::Binary { op: BinaryOp::Mul, .. } => {}
                other => panic!("expected Mul on the right, got {:?}", other),
            },
            other => panic!("unexpected stmt: {:?}", other),
        }
    }

    #[test]
    fn test_range_below_comparison() {
        // `1..3 < x` must parse the range first.
        let prog = parse_ok("1 .. 3 < x");
        match &prog.body[0] {
            Stmt::Expr(Expr::Binary { op: BinaryOp::Lt, left, .. }) => match left.as_ref() {
                Expr::Range { inclusive: false, .. } => {}
                other => panic!("expected range on the left, got {:?}", other),
            },
            other => panic!("unexpected stmt: {:?}", other),
        }
    }

    #[test]
    fn test_assignment_statement_targets() {
        let prog = parse_ok("x = 1; a[0] = 2; m.k = 3; x += 4");
        assert!(matches!(
            prog.body[0],
            Stmt::Assign { target: AssignTarget::Name(_), op: AssignOp::Set, .. }
        ));
        assert!(matches!(
            prog.body[1],
            Stmt::Assign { target: AssignTarget::Index { .. }, .. }
        ));
        assert!(matches!(
            prog.body[2],
            Stmt::Assign { target: AssignTarget::Field { .. }, .. }
        ));
        assert!(matches!(prog.body[3], Stmt::Assign { op: AssignOp::Add, .. }));
    }

    #[test]
    fn test_invalid_assignment_target() {
        let err = parse("1 + 2 = 3", "<test>").unwrap_err();
        assert!(err.message.contains("invalid assignment target"));
    }

    #[test]
    fn test_method_call_is_first_class() {
        let prog = parse_ok("buf.append(\"x\")");
        assert!(matches!(prog.body[0], Stmt::Expr(Expr::MethodCall { .. })));
    }

    #[test]
    fn test_field_access_without_call() {
        let prog = parse_ok("sock._fd; sock?.host");
        assert!(matches!(
            prog.body[0],
            Stmt::Expr(Expr::Field { optional: false, .. })
        ));
        assert!(matches!(
            prog.body[1],
            Stmt::Expr(Expr::Field { optional: true, .. })
        ));
    }

    #[test]
    fn test_function_defaults_and_rest() {
        let prog = parse_ok("fn f(a, b = 2, ...rest) { return a; }");
        match &prog.body[0] {
            Stmt::FnDef { decl, .. } => {
                assert_eq!(decl.params.len(), 2);
                assert!(decl.params[0].default.is_none());
                assert!(decl.params[1].default.is_some());
                assert_eq!(decl.rest.as_deref(), Some("rest"));
            }
            other => panic!("unexpected stmt: {:?}", other),
        }
    }

    #[test]
    fn test_default_before_plain_param_rejected() {
        let err = parse("fn f(a = 1, b) {}", "<test>").unwrap_err();
        assert!(err.message.contains("default"));
    }

    #[test]
    fn test_generator_detection() {
        let prog = parse_ok("fn g() { yield 1; yield 2; } fn f() { return 1; }");
        match (&prog.body[0], &prog.body[1]) {
            (Stmt::FnDef { decl: g, .. }, Stmt::FnDef { decl: f, .. }) => {
                assert!(g.is_generator);
                assert!(!f.is_generator);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_yield_outside_function_rejected() {
        let err = parse("yield 1", "<test>").unwrap_err();
        assert!(err.message.contains("yield outside"));
    }

    #[test]
    fn test_destructuring_let() {
        let prog = parse_ok("let [a, b] = xs; let { k, v: local } = m;");
        assert!(matches!(
            prog.body[0],
            Stmt::Let { pattern: LetPattern::List(_), .. }
        ));
        match &prog.body[1] {
            Stmt::Let { pattern: LetPattern::Map(entries), .. } => {
                assert_eq!(entries[0], ("k".to_string(), "k".to_string()));
                assert_eq!(entries[1], ("v".to_string(), "local".to_string()));
            }
            other => panic!("unexpected stmt: {:?}", other),
        }
    }

    #[test]
    fn test_destructuring_requires_initializer() {
        let err = parse("let [a, b];", "<test>").unwrap_err();
        assert!(err.message.contains("initializer"));
    }

    #[test]
    fn test_for_variants() {
        let prog = parse_ok("for i in 0..3 { } for (let i = 0; i < 3; i = i + 1) { } for k, v in m { }");
        assert!(matches!(prog.body[0], Stmt::ForIn { name2: None, .. }));
        assert!(matches!(prog.body[1], Stmt::ForC { .. }));
        assert!(matches!(prog.body[2], Stmt::ForIn { name2: Some(_), .. }));
    }

    #[test]
    fn test_switch() {
        let prog = parse_ok("switch (x) { case 1: print(1); case 2: print(2); default: print(3); }");
        match &prog.body[0] {
            Stmt::Switch { cases, default, .. } => {
                assert_eq!(cases.len(), 2);
                assert!(default.is_some());
            }
            other => panic!("unexpected stmt: {:?}", other),
        }
    }

    #[test]
    fn test_match_expression() {
        let prog = parse_ok(
            "let r = match (v) { case 0: \"zero\"; case [a, b]: a; case {k: x} if x > 1: x; case _: nil; default: \"other\" }",
        );
        match &prog.body[0] {
            Stmt::Let { init: Some(Expr::Match { arms, default, .. }), .. } => {
                assert_eq!(arms.len(), 4);
                assert!(arms[2].guard.is_some());
                assert!(default.is_some());
            }
            other => panic!("unexpected stmt: {:?}", other),
        }
    }

    #[test]
    fn test_try_catch_finally() {
        let prog = parse_ok("try { f(); } catch (e) { print(e); } finally { done(); }");
        match &prog.body[0] {
            Stmt::Try { catch: Some((name, _)), finally: Some(_), .. } => {
                assert_eq!(name, "e");
            }
            other => panic!("unexpected stmt: {:?}", other),
        }
    }

    #[test]
    fn test_try_requires_handler() {
        let err = parse("try { f(); }", "<test>").unwrap_err();
        assert!(err.message.contains("catch or finally"));
    }

    #[test]
    fn test_imports_exports() {
        let prog = parse_ok(
            "import { a, b as c } from \"./lib.sky\"\nimport util from \"./util.sky\"\nexport x = 1\nexport { x as y }",
        );
        match &prog.body[0] {
            Stmt::Import { default_name: None, names, .. } => {
                assert_eq!(names.len(), 2);
                assert_eq!(names[1].export, "b");
                assert_eq!(names[1].local, "c");
            }
            other => panic!("unexpected stmt: {:?}", other),
        }
        assert!(matches!(prog.body[1], Stmt::Import { default_name: Some(_), .. }));
        assert!(matches!(prog.body[2], Stmt::Export { .. }));
        assert!(matches!(prog.body[3], Stmt::ExportList { .. }));
    }

    #[test]
    fn test_interpolation_parses_to_parts() {
        let prog = parse_ok(r#"let s = "a${x + 1}b""#);
        match &prog.body[0] {
            Stmt::Let { init: Some(Expr::Interp { parts, .. }), .. } => {
                assert_eq!(parts.len(), 3);
                assert!(matches!(parts[1], Expr::Binary { .. }));
            }
            other => panic!("unexpected stmt: {:?}", other),
        }
    }

    #[test]
    fn test_pipe_desugars_to_call() {
        let prog = parse_ok("x |> f; x |> g(1)");
        match &prog.body[0] {
            Stmt::Expr(Expr::Call { args, .. }) => assert_eq!(args.len(), 1),
            other => panic!("unexpected stmt: {:?}", other),
        }
        match &prog.body[1] {
            Stmt::Expr(Expr::Call { args, .. }) => {
                assert_eq!(args.len(), 2);
                assert!(matches!(args[0], Expr::Ident { .. }));
            }
            other => panic!("unexpected stmt: {:?}", other),
        }
    }

    #[test]
    fn test_spread_in_calls_and_lists() {
        let prog = parse_ok("f(1, ...rest); [1, ...xs, 3]");
        match &prog.body[0] {
            Stmt::Expr(Expr::Call { args, .. }) => {
                assert!(matches!(args[1], Expr::Spread { .. }))
            }
            other => panic!("unexpected stmt: {:?}", other),
        }
    }

    #[test]
    fn test_reserved_keywords_rejected() {
        assert!(parse("class Foo {}", "<test>").unwrap_err().message.contains("reserved"));
        assert!(parse("struct P {}", "<test>").unwrap_err().message.contains("reserved"));
        assert!(parse("enum E {}", "<test>").unwrap_err().message.contains("reserved"));
    }

    #[test]
    fn test_deep_nesting_is_an_error_not_a_hang() {
        let src = format!("{}1{}", "(".repeat(400), ")".repeat(400));
        let err = parse(&src, "<test>").unwrap_err();
        assert!(err.message.contains("too deep"));
    }

    #[test]
    fn test_parse_error_position() {
        let err = parse("let x = \n  @", "<test>").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.to_string().starts_with("<test>:2:"));
    }

    #[test]
    fn test_reparse_structural_equivalence() {
        // Parse, render the statement kinds, re-parse: same shape.
        let src = "fn f(a) { return a * 2; } let y = f(21); print(y)";
        let a = parse_ok(src);
        let b = parse_ok(src);
        let shape = |p: &Program| {
            p.body.iter().map(|s| format!("{:?}", std::mem::discriminant(s))).collect::<Vec<_>>()
        };
        assert_eq!(shape(&a), shape(&b));
        assert_eq!(a.body.len(), 3);
    }
}
