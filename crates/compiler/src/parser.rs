//! Recursive-descent parser for the Poke language.
//!
//! `seqc`'s old `parser.rs` is a hand-written recursive-descent parser
//! over a pre-tokenized `Vec<Token>` with a `Parser { tokens, pos }`
//! cursor and `peek`/`bump`/`expect` helpers; that shape survives here
//! unchanged. What changed is the grammar it drives: poke's source
//! language (declarations, struct/array/offset literals, casts, `isa`)
//! rather than concatenative word definitions.
//!
//! Three entry points mirror libpoke's three parse modes: a whole
//! compilation unit (`parse_program`), a single statement typed at a
//! prompt (`parse_statement`), and a bare expression (`parse_expression`).

use crate::ast::{
    Ast, BinOp, Decl, Enumerator, FuncArg, FuncTypeArg, NodeId, NodeKind, SourceLocation,
    StructTypeField, TypeExpr, UnOp,
};
use crate::lexer::{tokenize, Token, TokenKind};

#[derive(Debug, Clone, thiserror::Error)]
#[error("parse error at {loc}: {message}")]
pub struct ParseError {
    pub message: String,
    pub loc: SourceLocation,
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    ast: Ast,
    /// Set by `parse_fun(true)` so `parse_decl` can recover the name of a
    /// named function declaration without `Func` itself carrying one.
    last_fun_name: Option<String>,
}

type PResult<T> = Result<T, ParseError>;

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Parser { tokens, pos: 0, ast: Ast::new(), last_fun_name: None }
    }

    fn cur(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn loc(&self) -> SourceLocation {
        let t = self.cur();
        SourceLocation::new(t.line, t.column)
    }

    fn bump(&mut self) -> Token {
        let t = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.cur().kind == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> PResult<Token> {
        if self.check(kind) {
            Ok(self.bump())
        } else {
            Err(ParseError {
                message: format!("expected {what}, found {:?}", self.cur().kind),
                loc: self.loc(),
            })
        }
    }

    fn expect_ident(&mut self) -> PResult<String> {
        match &self.cur().kind {
            TokenKind::Ident(s) => {
                let s = s.clone();
                self.bump();
                Ok(s)
            }
            other => Err(ParseError {
                message: format!("expected identifier, found {other:?}"),
                loc: self.loc(),
            }),
        }
    }

    fn push(&mut self, kind: NodeKind, loc: SourceLocation) -> NodeId {
        self.ast.push(kind, loc)
    }

    // ---- entry points ----------------------------------------------

    fn parse_program_inner(&mut self) -> PResult<NodeId> {
        let loc = self.loc();
        let mut decls = Vec::new();
        while !self.check(&TokenKind::Eof) {
            decls.push(self.parse_toplevel()?);
        }
        let root = self.push(NodeKind::Program { decls }, loc);
        Ok(root)
    }

    fn parse_toplevel(&mut self) -> PResult<NodeId> {
        if self.check(&TokenKind::KwVar)
            || self.check(&TokenKind::KwType)
            || self.check(&TokenKind::KwFun)
            || self.check(&TokenKind::KwEnum)
        {
            self.parse_decl()
        } else {
            self.parse_statement_inner()
        }
    }

    // ---- declarations -------------------------------------------------

    fn parse_decl(&mut self) -> PResult<NodeId> {
        let loc = self.loc();
        match self.cur().kind.clone() {
            TokenKind::KwVar => {
                self.bump();
                let name = self.expect_ident()?;
                self.expect(&TokenKind::Eq, "`=`")?;
                let init = self.parse_expr()?;
                self.expect(&TokenKind::Semi, "`;`")?;
                Ok(self.push(NodeKind::Decl(Decl::Var { name, init }), loc))
            }
            TokenKind::KwType => {
                self.bump();
                let name = self.expect_ident()?;
                self.expect(&TokenKind::Eq, "`=`")?;
                let ty = self.parse_type_expr()?;
                self.expect(&TokenKind::Semi, "`;`")?;
                Ok(self.push(NodeKind::Decl(Decl::Type { name, ty }), loc))
            }
            TokenKind::KwEnum => {
                self.bump();
                let name = self.expect_ident()?;
                self.expect(&TokenKind::LBrace, "`{`")?;
                let mut enumerators = Vec::new();
                while !self.check(&TokenKind::RBrace) {
                    let ename = self.expect_ident()?;
                    let value = if self.eat(&TokenKind::Eq) {
                        Some(self.parse_expr()?)
                    } else {
                        None
                    };
                    enumerators.push(Enumerator { name: ename, value });
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(&TokenKind::RBrace, "`}`")?;
                self.expect(&TokenKind::Semi, "`;`")?;
                Ok(self.push(NodeKind::Decl(Decl::Enum { name, enumerators }), loc))
            }
            TokenKind::KwFun => {
                let func = self.parse_fun(true)?;
                let name = self.last_fun_name.take().expect("parse_fun(true) sets the name");
                Ok(self.push(NodeKind::Decl(Decl::Func { name, func }), loc))
            }
            other => Err(ParseError {
                message: format!("expected a declaration, found {other:?}"),
                loc,
            }),
        }
    }

    /// Parses `fun name (args) : type { body }` or (as a lambda, `as_decl =
    /// false`) the anonymous `fun (args) : type { body }` form used in
    /// expression position. Returns the `Func` node id; for a named
    /// top-level declaration, the name is threaded back through
    /// `self.last_fun_name` because `Func` itself carries no name.
    fn parse_fun(&mut self, as_decl: bool) -> PResult<NodeId> {
        let loc = self.loc();
        self.expect(&TokenKind::KwFun, "`fun`")?;
        let name = if as_decl { Some(self.expect_ident()?) } else { None };
        self.expect(&TokenKind::LParen, "`(`")?;
        let mut args = Vec::new();
        while !self.check(&TokenKind::RParen) {
            if self.check(&TokenKind::KwAny) && self.tokens.get(self.pos + 1).map(|t| &t.kind) == Some(&TokenKind::RParen) {
                self.bump();
                args.push(FuncArg { name: "args".into(), ty: TypeExpr::Any, vararg: true, optional: false, default: None });
                break;
            }
            let arg_name = self.expect_ident()?;
            self.expect(&TokenKind::Colon, "`:`")?;
            let ty = self.parse_type_expr()?;
            let default = if self.eat(&TokenKind::Eq) {
                Some(self.parse_expr()?)
            } else {
                None
            };
            args.push(FuncArg { name: arg_name, ty, vararg: false, optional: default.is_some(), default });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RParen, "`)`")?;
        let ret = if self.eat(&TokenKind::Colon) {
            self.parse_type_expr()?
        } else {
            TypeExpr::Void
        };
        let body = self.parse_comp_stmt()?;
        let func = self.push(NodeKind::Func { args, ret, body, method_of: None }, loc);
        self.last_fun_name = name;
        Ok(func)
    }

    fn parse_type_expr(&mut self) -> PResult<TypeExpr> {
        match self.cur().kind.clone() {
            TokenKind::KwInt => {
                self.bump();
                Ok(TypeExpr::Integral { size: 32, signed: true })
            }
            TokenKind::KwUint => {
                self.bump();
                Ok(TypeExpr::Integral { size: 32, signed: false })
            }
            TokenKind::KwLong => {
                self.bump();
                Ok(TypeExpr::Integral { size: 64, signed: true })
            }
            TokenKind::KwUlong => {
                self.bump();
                Ok(TypeExpr::Integral { size: 64, signed: false })
            }
            TokenKind::Lt => {
                // `<size>int` / `<size>uint` bit-width syntax.
                self.bump();
                let size = if let TokenKind::Int(n) = self.cur().kind {
                    self.bump();
                    n as u32
                } else {
                    return Err(ParseError { message: "expected a bit-width integer".into(), loc: self.loc() });
                };
                self.expect(&TokenKind::Gt, "`>`")?;
                let signed = match self.cur().kind.clone() {
                    TokenKind::KwInt => {
                        self.bump();
                        true
                    }
                    TokenKind::KwUint => {
                        self.bump();
                        false
                    }
                    _ => {
                        return Err(ParseError {
                            message: "expected `int` or `uint` after bit-width".into(),
                            loc: self.loc(),
                        })
                    }
                };
                Ok(TypeExpr::Integral { size, signed })
            }
            TokenKind::KwString => {
                self.bump();
                Ok(TypeExpr::String)
            }
            TokenKind::KwVoid => {
                self.bump();
                Ok(TypeExpr::Void)
            }
            TokenKind::KwAny => {
                self.bump();
                Ok(TypeExpr::Any)
            }
            TokenKind::KwStruct | TokenKind::KwUnion => {
                let is_union = self.check(&TokenKind::KwUnion);
                self.bump();
                let pinned = self.eat(&TokenKind::KwPinned);
                let name = if let TokenKind::Ident(_) = self.cur().kind {
                    Some(self.expect_ident()?)
                } else {
                    None
                };
                self.expect(&TokenKind::LBrace, "`{`")?;
                let mut fields = Vec::new();
                while !self.check(&TokenKind::RBrace) {
                    if self.eat(&TokenKind::KwMethod) {
                        let fname = self.expect_ident()?;
                        let method_body = self.parse_fun(false)?;
                        self.last_fun_name = None;
                        fields.push(StructTypeField {
                            name: Some(fname),
                            ty: TypeExpr::Void,
                            constraint: None,
                            is_method: true,
                            method_body: Some(method_body),
                        });
                        continue;
                    }
                    let fname = self.expect_ident()?;
                    self.expect(&TokenKind::Colon, "`:`")?;
                    let fty = self.parse_type_expr()?;
                    let constraint = if self.eat(&TokenKind::KwIf) {
                        self.expect(&TokenKind::LParen, "`(`")?;
                        let c = self.parse_expr()?;
                        self.expect(&TokenKind::RParen, "`)`")?;
                        Some(c)
                    } else {
                        None
                    };
                    self.expect(&TokenKind::Semi, "`;`")?;
                    fields.push(StructTypeField { name: Some(fname), ty: fty, constraint, is_method: false, method_body: None });
                }
                self.expect(&TokenKind::RBrace, "`}`")?;
                Ok(TypeExpr::Struct { name, fields, is_union, pinned })
            }
            TokenKind::KwFun => {
                self.bump();
                self.expect(&TokenKind::LParen, "`(`")?;
                let mut args = Vec::new();
                while !self.check(&TokenKind::RParen) {
                    let ty = self.parse_type_expr()?;
                    args.push(FuncTypeArg { name: None, ty, vararg: false, optional: false });
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(&TokenKind::RParen, "`)`")?;
                let ret = if self.eat(&TokenKind::Colon) {
                    self.parse_type_expr()?
                } else {
                    TypeExpr::Void
                };
                Ok(TypeExpr::Closure { ret: Box::new(ret), args, vararg: false })
            }
            TokenKind::Ident(_) => {
                let name = self.expect_ident()?;
                let mut ty = TypeExpr::Named(name);
                while self.eat(&TokenKind::LBracket) {
                    let bound = if self.check(&TokenKind::RBracket) {
                        None
                    } else {
                        Some(self.parse_expr()?)
                    };
                    self.expect(&TokenKind::RBracket, "`]`")?;
                    ty = TypeExpr::Array { elem: Box::new(ty), bound };
                }
                Ok(ty)
            }
            other => Err(ParseError {
                message: format!("expected a type, found {other:?}"),
                loc: self.loc(),
            }),
        }
    }

    // ---- statements -----------------------------------------------

    fn parse_statement_inner(&mut self) -> PResult<NodeId> {
        let loc = self.loc();
        match self.cur().kind.clone() {
            TokenKind::KwVar | TokenKind::KwType | TokenKind::KwFun | TokenKind::KwEnum => {
                self.parse_decl()
            }
            TokenKind::LBrace => self.parse_comp_stmt(),
            TokenKind::KwIf => self.parse_if_stmt(),
            TokenKind::KwWhile => self.parse_while_stmt(),
            TokenKind::KwFor => self.parse_for_stmt(),
            TokenKind::KwBreak => {
                self.bump();
                self.expect(&TokenKind::Semi, "`;`")?;
                Ok(self.push(NodeKind::BreakStmt, loc))
            }
            TokenKind::KwContinue => {
                self.bump();
                self.expect(&TokenKind::Semi, "`;`")?;
                Ok(self.push(NodeKind::ContinueStmt, loc))
            }
            TokenKind::KwReturn => {
                self.bump();
                let value = if self.check(&TokenKind::Semi) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.expect(&TokenKind::Semi, "`;`")?;
                Ok(self.push(NodeKind::ReturnStmt { value }, loc))
            }
            TokenKind::KwRaise => {
                self.bump();
                let value = if self.check(&TokenKind::Semi) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.expect(&TokenKind::Semi, "`;`")?;
                Ok(self.push(NodeKind::RaiseStmt { value }, loc))
            }
            TokenKind::KwTry => self.parse_try_stmt(),
            TokenKind::KwPrint | TokenKind::KwPrintln => {
                let newline = self.check(&TokenKind::KwPrintln);
                self.bump();
                let expr = self.parse_expr()?;
                self.expect(&TokenKind::Semi, "`;`")?;
                Ok(self.push(NodeKind::PrintStmt { expr, newline }, loc))
            }
            TokenKind::Semi => {
                self.bump();
                Ok(self.push(NodeKind::NullStmt, loc))
            }
            _ => {
                let expr = self.parse_expr()?;
                if self.eat(&TokenKind::Eq) {
                    let value = self.parse_expr()?;
                    self.expect(&TokenKind::Semi, "`;`")?;
                    return Ok(self.push(NodeKind::AssStmt { lvalue: expr, value }, loc));
                }
                self.expect(&TokenKind::Semi, "`;`")?;
                Ok(self.push(NodeKind::ExpStmt { expr }, loc))
            }
        }
    }

    fn parse_comp_stmt(&mut self) -> PResult<NodeId> {
        let loc = self.loc();
        self.expect(&TokenKind::LBrace, "`{`")?;
        let mut stmts = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            stmts.push(self.parse_statement_inner()?);
        }
        self.expect(&TokenKind::RBrace, "`}`")?;
        Ok(self.push(NodeKind::CompStmt { stmts }, loc))
    }

    fn parse_if_stmt(&mut self) -> PResult<NodeId> {
        let loc = self.loc();
        self.expect(&TokenKind::KwIf, "`if`")?;
        self.expect(&TokenKind::LParen, "`(`")?;
        let cond = self.parse_expr()?;
        self.expect(&TokenKind::RParen, "`)`")?;
        let then_branch = self.parse_statement_inner()?;
        let else_branch = if self.eat(&TokenKind::KwElse) {
            Some(self.parse_statement_inner()?)
        } else {
            None
        };
        Ok(self.push(NodeKind::IfStmt { cond, then_branch, else_branch }, loc))
    }

    fn parse_while_stmt(&mut self) -> PResult<NodeId> {
        let loc = self.loc();
        self.expect(&TokenKind::KwWhile, "`while`")?;
        self.expect(&TokenKind::LParen, "`(`")?;
        let cond = self.parse_expr()?;
        self.expect(&TokenKind::RParen, "`)`")?;
        let body = self.parse_statement_inner()?;
        Ok(self.push(
            NodeKind::LoopStmt { init: None, cond: Some(cond), step: None, iterator: None, body },
            loc,
        ))
    }

    fn parse_for_stmt(&mut self) -> PResult<NodeId> {
        let loc = self.loc();
        self.expect(&TokenKind::KwFor, "`for`")?;
        self.expect(&TokenKind::LParen, "`(`")?;
        // for (x in container [where cond]) body
        if let TokenKind::Ident(_) = self.cur().kind.clone() {
            let save = self.pos;
            let name = self.expect_ident()?;
            if self.eat(&TokenKind::KwIn) {
                let container = self.parse_expr()?;
                let where_clause = if self.eat(&TokenKind::KwWhere) {
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                self.expect(&TokenKind::RParen, "`)`")?;
                let body = self.parse_statement_inner()?;
                let iterator = self.push(
                    NodeKind::LoopStmtIterator { var_name: name, container, where_clause },
                    loc.clone(),
                );
                return Ok(self.push(
                    NodeKind::LoopStmt { init: None, cond: None, step: None, iterator: Some(iterator), body },
                    loc,
                ));
            }
            self.pos = save;
        }
        // classic for (init; cond; step) body
        let init = if self.check(&TokenKind::Semi) {
            self.bump();
            None
        } else {
            Some(self.parse_statement_inner_bare()?)
        };
        let cond = if self.check(&TokenKind::Semi) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect(&TokenKind::Semi, "`;`")?;
        let step = if self.check(&TokenKind::RParen) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect(&TokenKind::RParen, "`)`")?;
        let body = self.parse_statement_inner()?;
        Ok(self.push(NodeKind::LoopStmt { init, cond, step, iterator: None, body }, loc))
    }

    /// Parses a single `for`-loop init clause, consuming its own
    /// terminating `;` (mirrors an ordinary statement, but restricted to
    /// `var` decls and bare expressions — no nested blocks).
    fn parse_statement_inner_bare(&mut self) -> PResult<NodeId> {
        let loc = self.loc();
        if self.check(&TokenKind::KwVar) {
            self.bump();
            let name = self.expect_ident()?;
            self.expect(&TokenKind::Eq, "`=`")?;
            let init = self.parse_expr()?;
            self.expect(&TokenKind::Semi, "`;`")?;
            return Ok(self.push(NodeKind::Decl(Decl::Var { name, init }), loc));
        }
        let expr = self.parse_expr()?;
        if self.eat(&TokenKind::Eq) {
            let value = self.parse_expr()?;
            self.expect(&TokenKind::Semi, "`;`")?;
            return Ok(self.push(NodeKind::AssStmt { lvalue: expr, value }, loc));
        }
        self.expect(&TokenKind::Semi, "`;`")?;
        Ok(self.push(NodeKind::ExpStmt { expr }, loc))
    }

    fn parse_try_stmt(&mut self) -> PResult<NodeId> {
        let loc = self.loc();
        self.expect(&TokenKind::KwTry, "`try`")?;
        let body = self.parse_statement_inner()?;
        if self.eat(&TokenKind::KwUntil) {
            let until = self.parse_expr()?;
            self.expect(&TokenKind::Semi, "`;`")?;
            return Ok(self.push(NodeKind::TryUntilStmt { body, until }, loc));
        }
        self.expect(&TokenKind::KwCatch, "`catch`")?;
        let catch_var = if self.eat(&TokenKind::LParen) {
            let n = self.expect_ident()?;
            self.expect(&TokenKind::RParen, "`)`")?;
            Some(n)
        } else {
            None
        };
        let handler = self.parse_statement_inner()?;
        Ok(self.push(NodeKind::TryCatchStmt { body, catch_var, handler }, loc))
    }

    // ---- expressions (precedence climbing) -------------------------

    fn parse_expr(&mut self) -> PResult<NodeId> {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> PResult<NodeId> {
        let loc = self.loc();
        let cond = self.parse_or()?;
        if self.eat(&TokenKind::Question) {
            let then_branch = self.parse_expr()?;
            self.expect(&TokenKind::Colon, "`:`")?;
            let else_branch = self.parse_ternary()?;
            return Ok(self.push(NodeKind::CondExp { cond, then_branch, else_branch }, loc));
        }
        Ok(cond)
    }

    fn parse_binop_level(
        &mut self,
        ops: &[(TokenKind, BinOp)],
        next: fn(&mut Self) -> PResult<NodeId>,
    ) -> PResult<NodeId> {
        let loc = self.loc();
        let mut lhs = next(self)?;
        loop {
            let mut matched = None;
            for (tok, op) in ops {
                if self.check(tok) {
                    matched = Some(*op);
                    break;
                }
            }
            match matched {
                Some(op) => {
                    self.bump();
                    let rhs = next(self)?;
                    lhs = self.push(NodeKind::Exp { op, lhs, rhs }, loc.clone());
                }
                None => break,
            }
        }
        Ok(lhs)
    }

    fn parse_or(&mut self) -> PResult<NodeId> {
        self.parse_binop_level(&[(TokenKind::OrOr, BinOp::Or)], Self::parse_and)
    }
    fn parse_and(&mut self) -> PResult<NodeId> {
        self.parse_binop_level(&[(TokenKind::AndAnd, BinOp::And)], Self::parse_bitor)
    }
    fn parse_bitor(&mut self) -> PResult<NodeId> {
        self.parse_binop_level(&[(TokenKind::Pipe, BinOp::BOr)], Self::parse_bitxor)
    }
    fn parse_bitxor(&mut self) -> PResult<NodeId> {
        self.parse_binop_level(&[(TokenKind::Caret, BinOp::BXor)], Self::parse_bitand)
    }
    fn parse_bitand(&mut self) -> PResult<NodeId> {
        self.parse_binop_level(&[(TokenKind::Amp, BinOp::BAnd)], Self::parse_equality)
    }
    fn parse_equality(&mut self) -> PResult<NodeId> {
        self.parse_binop_level(
            &[(TokenKind::EqEq, BinOp::Eq), (TokenKind::Ne, BinOp::Ne)],
            Self::parse_relational,
        )
    }
    fn parse_relational(&mut self) -> PResult<NodeId> {
        self.parse_binop_level(
            &[
                (TokenKind::Lt, BinOp::Lt),
                (TokenKind::Gt, BinOp::Gt),
                (TokenKind::Le, BinOp::Le),
                (TokenKind::Ge, BinOp::Ge),
            ],
            Self::parse_shift,
        )
    }
    fn parse_shift(&mut self) -> PResult<NodeId> {
        self.parse_binop_level(
            &[(TokenKind::Shl, BinOp::Shl), (TokenKind::Shr, BinOp::Shr)],
            Self::parse_additive,
        )
    }
    fn parse_additive(&mut self) -> PResult<NodeId> {
        self.parse_binop_level(
            &[(TokenKind::Plus, BinOp::Add), (TokenKind::Minus, BinOp::Sub)],
            Self::parse_multiplicative,
        )
    }
    fn parse_multiplicative(&mut self) -> PResult<NodeId> {
        self.parse_binop_level(
            &[
                (TokenKind::Star, BinOp::Mul),
                (TokenKind::Slash, BinOp::Div),
                (TokenKind::Percent, BinOp::Mod),
            ],
            Self::parse_isa,
        )
    }

    fn parse_isa(&mut self) -> PResult<NodeId> {
        let loc = self.loc();
        let operand = self.parse_unary()?;
        if self.eat(&TokenKind::KwIsa) {
            let ty = self.parse_type_expr()?;
            return Ok(self.push(NodeKind::Isa { operand, ty }, loc));
        }
        Ok(operand)
    }

    fn parse_unary(&mut self) -> PResult<NodeId> {
        let loc = self.loc();
        match self.cur().kind.clone() {
            TokenKind::Minus => {
                self.bump();
                let operand = self.parse_unary()?;
                Ok(self.push(NodeKind::Unary { op: UnOp::Neg, operand }, loc))
            }
            TokenKind::Bang => {
                self.bump();
                let operand = self.parse_unary()?;
                Ok(self.push(NodeKind::Unary { op: UnOp::Not, operand }, loc))
            }
            TokenKind::Tilde => {
                self.bump();
                let operand = self.parse_unary()?;
                Ok(self.push(NodeKind::Unary { op: UnOp::BNot, operand }, loc))
            }
            TokenKind::PlusPlus => {
                self.bump();
                let operand = self.parse_unary()?;
                Ok(self.push(NodeKind::IncrDecr { op: UnOp::PreIncr, operand }, loc))
            }
            TokenKind::MinusMinus => {
                self.bump();
                let operand = self.parse_unary()?;
                Ok(self.push(NodeKind::IncrDecr { op: UnOp::PreDecr, operand }, loc))
            }
            TokenKind::LParen => {
                // Disambiguate `(T) e` cast from a parenthesized expression
                // by attempting a type parse and backtracking on failure.
                let save = self.pos;
                self.bump();
                if let Ok(ty) = self.parse_type_expr() {
                    if self.eat(&TokenKind::RParen) {
                        if let Ok(operand) = self.parse_unary() {
                            return Ok(self.push(NodeKind::Cast { ty, operand }, loc));
                        }
                    }
                }
                self.pos = save;
                self.parse_postfix()
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> PResult<NodeId> {
        let loc = self.loc();
        let mut node = self.parse_primary()?;
        loop {
            if self.eat(&TokenKind::Dot) {
                let field = self.expect_ident()?;
                node = self.push(NodeKind::StructRef { base: node, field }, loc.clone());
            } else if self.eat(&TokenKind::LBracket) {
                let first = self.parse_expr()?;
                if self.eat(&TokenKind::Colon) {
                    let to = if self.check(&TokenKind::RBracket) {
                        None
                    } else {
                        Some(self.parse_expr()?)
                    };
                    self.expect(&TokenKind::RBracket, "`]`")?;
                    node = self.push(NodeKind::Trimmer { base: node, from: first, to }, loc.clone());
                } else {
                    self.expect(&TokenKind::RBracket, "`]`")?;
                    node = self.push(NodeKind::Indexer { base: node, index: first }, loc.clone());
                }
            } else if self.eat(&TokenKind::LParen) {
                let mut args = Vec::new();
                while !self.check(&TokenKind::RParen) {
                    let arg_loc = self.loc();
                    let name = if let TokenKind::Ident(n) = self.cur().kind.clone() {
                        if self.tokens.get(self.pos + 1).map(|t| &t.kind) == Some(&TokenKind::Colon) {
                            self.bump();
                            self.bump();
                            Some(n)
                        } else {
                            None
                        }
                    } else {
                        None
                    };
                    let value = self.parse_expr()?;
                    args.push(self.push(NodeKind::FuncallArg { name, value }, arg_loc));
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(&TokenKind::RParen, "`)`")?;
                node = self.push(NodeKind::Funcall { callee: node, args }, loc.clone());
            } else if self.eat(&TokenKind::Hash) {
                let unit = self.parse_postfix()?;
                node = self.push(NodeKind::Offset { magnitude: node, unit }, loc.clone());
            } else if self.eat(&TokenKind::PlusPlus) {
                node = self.push(NodeKind::IncrDecr { op: UnOp::PostIncr, operand: node }, loc.clone());
            } else if self.eat(&TokenKind::MinusMinus) {
                node = self.push(NodeKind::IncrDecr { op: UnOp::PostDecr, operand: node }, loc.clone());
            } else {
                break;
            }
        }
        Ok(node)
    }

    fn parse_primary(&mut self) -> PResult<NodeId> {
        let loc = self.loc();
        match self.cur().kind.clone() {
            TokenKind::Int(v) => {
                self.bump();
                Ok(self.push(NodeKind::Integer { value: v, signed: true, size: 32 }, loc))
            }
            TokenKind::Str(s) => {
                self.bump();
                Ok(self.push(NodeKind::StringLit { value: s }, loc))
            }
            TokenKind::Alien(name) | TokenKind::Ident(name) => {
                self.bump();
                if self.eat(&TokenKind::At) {
                    // `T @ offset`: the identifier names a type, mapped at
                    // the following offset expression.
                    let offset = self.parse_unary()?;
                    return Ok(self.push(NodeKind::Map { ty: TypeExpr::Named(name), ios: None, offset }, loc));
                }
                Ok(self.push(NodeKind::Identifier { name }, loc))
            }
            TokenKind::LParen => {
                self.bump();
                let e = self.parse_expr()?;
                self.expect(&TokenKind::RParen, "`)`")?;
                Ok(e)
            }
            TokenKind::LBracket => {
                self.bump();
                let mut elements = Vec::new();
                while !self.check(&TokenKind::RBracket) {
                    elements.push(self.parse_expr()?);
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(&TokenKind::RBracket, "`]`")?;
                Ok(self.push(NodeKind::Array { elements }, loc))
            }
            TokenKind::LBrace => {
                self.bump();
                let mut fields = Vec::new();
                while !self.check(&TokenKind::RBrace) {
                    let fl = self.loc();
                    let name = if let TokenKind::Ident(n) = self.cur().kind.clone() {
                        if self.tokens.get(self.pos + 1).map(|t| &t.kind) == Some(&TokenKind::Colon) {
                            self.bump();
                            self.bump();
                            Some(n)
                        } else {
                            None
                        }
                    } else {
                        None
                    };
                    let value = self.parse_expr()?;
                    fields.push(self.push(NodeKind::StructField { name, value }, fl));
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(&TokenKind::RBrace, "`}`")?;
                Ok(self.push(NodeKind::StructCons { type_name: None, fields }, loc))
            }
            TokenKind::KwFun => {
                let func = self.parse_fun(false)?;
                Ok(self.push(NodeKind::Lambda { func }, loc))
            }
            other => Err(ParseError {
                message: format!("expected an expression, found {other:?}"),
                loc,
            }),
        }
    }
}

pub fn parse_program(src: &str) -> Result<(Ast, NodeId), ParseError> {
    let tokens = tokenize(src)
        .map_err(|e| ParseError { message: e.message, loc: SourceLocation::new(e.line, e.column) })?;
    let mut parser = Parser::new(tokens);
    let root = parser.parse_program_inner()?;
    Ok((parser.ast, root))
}

pub fn parse_statement(src: &str) -> Result<(Ast, NodeId), ParseError> {
    let tokens = tokenize(src)
        .map_err(|e| ParseError { message: e.message, loc: SourceLocation::new(e.line, e.column) })?;
    let mut parser = Parser::new(tokens);
    let stmt = parser.parse_statement_inner()?;
    Ok((parser.ast, stmt))
}

pub fn parse_expression(src: &str) -> Result<(Ast, NodeId), ParseError> {
    let tokens = tokenize(src)
        .map_err(|e| ParseError { message: e.message, loc: SourceLocation::new(e.line, e.column) })?;
    let mut parser = Parser::new(tokens);
    let expr = parser.parse_expr()?;
    Ok((parser.ast, expr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_var_decl() {
        let (ast, root) = parse_program("var x = 1 + 2;").unwrap();
        match &ast.get(root).kind {
            NodeKind::Program { decls } => assert_eq!(decls.len(), 1),
            _ => panic!("expected program"),
        }
    }

    #[test]
    fn parses_if_while_for() {
        let src = "fun f(x: int) : int { if (x > 0) { return x; } else { return -x; } }";
        let (ast, root) = parse_program(src).unwrap();
        assert!(matches!(ast.get(root).kind, NodeKind::Program { .. }));
    }

    #[test]
    fn parses_struct_and_array_literals() {
        let (ast, id) = parse_expression("{ a: 1, b: 2 }").unwrap();
        assert!(matches!(ast.get(id).kind, NodeKind::StructCons { .. }));
        let (ast2, id2) = parse_expression("[1, 2, 3]").unwrap();
        assert!(matches!(ast2.get(id2).kind, NodeKind::Array { .. }));
    }

    #[test]
    fn parses_offset_and_map() {
        let (ast, id) = parse_expression("4#B").unwrap();
        assert!(matches!(ast.get(id).kind, NodeKind::Offset { .. }));
    }

    #[test]
    fn parses_trimmer_and_indexer() {
        let (ast, id) = parse_expression("a[1:2]").unwrap();
        assert!(matches!(ast.get(id).kind, NodeKind::Trimmer { .. }));
        let (ast2, id2) = parse_expression("a[1]").unwrap();
        assert!(matches!(ast2.get(id2).kind, NodeKind::Indexer { .. }));
    }
}
