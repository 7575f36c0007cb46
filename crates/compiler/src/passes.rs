//! Generic pass-walker framework.
//!
//! The compiler's middle-end is a fixed sequence of tree-walking passes
//! (`anal1`, `typify1`, `typify2`, `promo`, `fold`, `anal2`, `analf`,
//! `codegen`, mirroring `libpoke`'s own pass sequence). Each one is built
//! on the same walk: a handler is invoked per node and returns one of
//! four outcomes:
//!
//! - `Continue`: recurse into the node's children as usual.
//! - `Restart`: the node (now possibly mutated in place via `Ast::replace`)
//!   is handed to the *same* handler again, exactly once, before recursing.
//! - `Replace(new_kind)`: overwrite the node in place and recurse into the
//!   replacement's children instead of the original's.
//! - `Break`: skip the node's children entirely (used once a subtree is
//!   known to need no further processing by this pass).
//!
//! A handler may also abort the whole pass by returning `Err`, which is
//! the same early-exit shape `seq-compiler`'s resolver/typechecker
//! sequence uses for fatal errors: collect what can be collected, stop on
//! the first unrecoverable one.
//!
//! A flat word-list typechecker has no tree to walk, so this module's
//! restart/replace/break vocabulary is grounded directly on libpoke's own
//! pass semantics instead, implemented the way `seq-compiler` structures
//! its own multi-phase `Result`-returning pipeline (one `CompileError`
//! type, a mutable context threaded through).

use crate::ast::{Ast, Decl, NodeId, NodeKind, SourceLocation, TypeExpr};
use std::fmt;

#[derive(Debug, Clone, thiserror::Error)]
#[error("{loc}: {message}")]
pub struct CompileError {
    pub message: String,
    pub loc: SourceLocation,
}

impl CompileError {
    pub fn new(loc: SourceLocation, message: impl Into<String>) -> Self {
        CompileError { loc, message: message.into() }
    }
}

/// Diagnostics collected that do not, on their own, stop compilation:
/// non-fatal diagnostics accumulate, fatal ones abort.
#[derive(Debug, Default)]
pub struct PassContext {
    pub errors: Vec<CompileError>,
    pub warnings: Vec<CompileError>,
    /// Names visible to `anal1`/`typify` at the current point in the walk;
    /// pushed/popped by block-scoped nodes (`CompStmt`, `Func`, `LoopStmt`).
    pub scopes: Vec<Vec<String>>,
}

impl PassContext {
    pub fn new() -> Self {
        PassContext { errors: Vec::new(), warnings: Vec::new(), scopes: vec![Vec::new()] }
    }

    pub fn error(&mut self, loc: SourceLocation, message: impl Into<String>) {
        self.errors.push(CompileError::new(loc, message));
    }

    pub fn warn(&mut self, loc: SourceLocation, message: impl Into<String>) {
        self.warnings.push(CompileError::new(loc, message));
    }

    pub fn push_scope(&mut self) {
        self.scopes.push(Vec::new());
    }

    pub fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    pub fn declare(&mut self, name: impl Into<String>) {
        if let Some(top) = self.scopes.last_mut() {
            top.push(name.into());
        }
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.scopes.iter().rev().any(|s| s.iter().any(|n| n == name))
    }
}

pub enum VisitAction {
    Continue,
    Restart,
    Replace(NodeKind),
    Break,
}

pub type VisitResult = Result<VisitAction, CompileError>;

/// A tree-walking pass: one `visit` call per node, pre-order.
pub trait Pass {
    fn visit(&mut self, ast: &mut Ast, node: NodeId, ctx: &mut PassContext) -> VisitResult;

    /// Human-readable name used in `tracing` spans.
    fn name(&self) -> &'static str;
}

/// Runs `pass` over the whole subtree rooted at `root`, honoring
/// restart/replace/break at every node. Returns `Ok(())` if the pass ran
/// to completion (even if it recorded non-fatal errors in `ctx`); returns
/// `Err` only if a handler aborted outright.
pub fn run_pass(pass: &mut dyn Pass, ast: &mut Ast, root: NodeId, ctx: &mut PassContext) -> Result<(), CompileError> {
    let _span = tracing::debug_span!("compiler_pass", pass = pass.name()).entered();
    walk(pass, ast, root, ctx)
}

fn walk(pass: &mut dyn Pass, ast: &mut Ast, node: NodeId, ctx: &mut PassContext) -> Result<(), CompileError> {
    loop {
        let action = pass.visit(ast, node, ctx)?;
        match action {
            VisitAction::Restart => continue,
            VisitAction::Break => return Ok(()),
            VisitAction::Replace(new_kind) => {
                ast.replace(node, new_kind);
                break;
            }
            VisitAction::Continue => break,
        }
    }
    for child in children_of(ast, node) {
        walk(pass, ast, child, ctx)?;
    }
    Ok(())
}

/// Every node kind's direct children, in evaluation order. This single
/// function is what lets every pass share one walker instead of each
/// pass re-implementing tree recursion.
pub(crate) fn children_of(ast: &Ast, node: NodeId) -> Vec<NodeId> {
    match &ast.get(node).kind {
        NodeKind::Program { decls } => decls.clone(),
        NodeKind::Src { .. } => vec![],
        NodeKind::Integer { .. } | NodeKind::StringLit { .. } | NodeKind::Identifier { .. } => vec![],
        NodeKind::Exp { lhs, rhs, .. } => vec![*lhs, *rhs],
        NodeKind::Unary { operand, .. } => vec![*operand],
        NodeKind::CondExp { cond, then_branch, else_branch } => vec![*cond, *then_branch, *else_branch],
        NodeKind::Array { elements } => elements.clone(),
        NodeKind::ArrayInitializer { index, value } => {
            let mut v = vec![];
            if let Some(i) = index {
                v.push(*i);
            }
            v.push(*value);
            v
        }
        NodeKind::Trimmer { base, from, to } => {
            let mut v = vec![*base, *from];
            if let Some(t) = to {
                v.push(*t);
            }
            v
        }
        NodeKind::Indexer { base, index } => vec![*base, *index],
        NodeKind::StructCons { fields, .. } => fields.clone(),
        NodeKind::StructField { value, .. } => vec![*value],
        NodeKind::StructRef { base, .. } => vec![*base],
        NodeKind::Offset { magnitude, unit } => vec![*magnitude, *unit],
        NodeKind::Cast { operand, .. } => vec![*operand],
        NodeKind::Isa { operand, .. } => vec![*operand],
        NodeKind::Map { ios, offset, .. } => {
            let mut v = vec![];
            if let Some(i) = ios {
                v.push(*i);
            }
            v.push(*offset);
            v
        }
        NodeKind::Cons { .. } => vec![],
        NodeKind::Type { .. } | NodeKind::StructTypeField(_) => vec![],
        NodeKind::Decl(decl) => match decl {
            Decl::Var { init, .. } => vec![*init],
            Decl::Type { ty, .. } => struct_method_bodies(ty),
            Decl::Func { func, .. } => vec![*func],
            Decl::Enum { .. } => vec![],
        },
        NodeKind::Funcall { callee, args } => {
            let mut v = vec![*callee];
            v.extend(args.iter().copied());
            v
        }
        NodeKind::FuncallArg { value, .. } => vec![*value],
        NodeKind::Func { body, .. } => vec![*body],
        NodeKind::FuncArgNode(_) | NodeKind::FuncTypeArgNode(_) => vec![],
        NodeKind::CompStmt { stmts } => stmts.clone(),
        NodeKind::AssStmt { lvalue, value } => vec![*lvalue, *value],
        NodeKind::IfStmt { cond, then_branch, else_branch } => {
            let mut v = vec![*cond, *then_branch];
            if let Some(e) = else_branch {
                v.push(*e);
            }
            v
        }
        NodeKind::LoopStmt { init, cond, step, iterator, body } => {
            let mut v = vec![];
            if let Some(i) = init {
                v.push(*i);
            }
            if let Some(c) = cond {
                v.push(*c);
            }
            if let Some(s) = step {
                v.push(*s);
            }
            if let Some(it) = iterator {
                v.push(*it);
            }
            v.push(*body);
            v
        }
        NodeKind::LoopStmtIterator { container, where_clause, .. } => {
            let mut v = vec![*container];
            if let Some(w) = where_clause {
                v.push(*w);
            }
            v
        }
        NodeKind::BreakStmt | NodeKind::ContinueStmt | NodeKind::NullStmt => vec![],
        NodeKind::ReturnStmt { value } | NodeKind::RaiseStmt { value } => value.iter().copied().collect(),
        NodeKind::ExpStmt { expr } => vec![*expr],
        NodeKind::TryCatchStmt { body, handler, .. } => vec![*body, *handler],
        NodeKind::TryUntilStmt { body, until } => vec![*body, *until],
        NodeKind::Format { args, .. } => args.clone(),
        NodeKind::FormatArg { value } => vec![*value],
        NodeKind::PrintStmt { expr, .. } => vec![*expr],
        NodeKind::Lambda { func } => vec![*func],
        NodeKind::IncrDecr { operand, .. } => vec![*operand],
        NodeKind::Enum { .. } | NodeKind::Enumerator(_) => vec![],
        NodeKind::Var { init, .. } => vec![*init],
    }
}

/// A struct/union type's method bodies, if any — the only place a `Decl`
/// indirectly owns further statement trees beyond its own children, since
/// `TypeExpr` (unlike `NodeKind`) isn't itself walked node-by-node.
fn struct_method_bodies(ty: &TypeExpr) -> Vec<NodeId> {
    match ty {
        TypeExpr::Struct { fields, .. } => fields.iter().filter_map(|f| f.method_body).collect(),
        _ => vec![],
    }
}

impl fmt::Debug for dyn Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pass({})", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::SourceLocation;

    struct CountIntegers(u32);
    impl Pass for CountIntegers {
        fn name(&self) -> &'static str {
            "count-integers"
        }
        fn visit(&mut self, ast: &mut Ast, node: NodeId, _ctx: &mut PassContext) -> VisitResult {
            if matches!(ast.get(node).kind, NodeKind::Integer { .. }) {
                self.0 += 1;
            }
            Ok(VisitAction::Continue)
        }
    }

    #[test]
    fn walks_whole_tree() {
        let mut ast = Ast::new();
        let a = ast.push(NodeKind::Integer { value: 1, signed: true, size: 32 }, SourceLocation::new(1, 1));
        let b = ast.push(NodeKind::Integer { value: 2, signed: true, size: 32 }, SourceLocation::new(1, 1));
        let root = ast.push(NodeKind::Exp { op: crate::ast::BinOp::Add, lhs: a, rhs: b }, SourceLocation::new(1, 1));
        let mut pass = CountIntegers(0);
        let mut ctx = PassContext::new();
        run_pass(&mut pass, &mut ast, root, &mut ctx).unwrap();
        assert_eq!(pass.0, 2);
    }

    struct ReplaceOnce(bool);
    impl Pass for ReplaceOnce {
        fn name(&self) -> &'static str {
            "replace-once"
        }
        fn visit(&mut self, ast: &mut Ast, node: NodeId, _ctx: &mut PassContext) -> VisitResult {
            if !self.0 && matches!(ast.get(node).kind, NodeKind::Integer { value: 1, .. }) {
                self.0 = true;
                return Ok(VisitAction::Replace(NodeKind::Integer { value: 99, signed: true, size: 32 }));
            }
            Ok(VisitAction::Continue)
        }
    }

    #[test]
    fn replace_overwrites_node_in_place() {
        let mut ast = Ast::new();
        let id = ast.push(NodeKind::Integer { value: 1, signed: true, size: 32 }, SourceLocation::new(1, 1));
        let mut pass = ReplaceOnce(false);
        let mut ctx = PassContext::new();
        run_pass(&mut pass, &mut ast, id, &mut ctx).unwrap();
        match ast.get(id).kind {
            NodeKind::Integer { value, .. } => assert_eq!(value, 99),
            _ => panic!("wrong kind"),
        }
    }

    struct BreakAtRoot;
    impl Pass for BreakAtRoot {
        fn name(&self) -> &'static str {
            "break-at-root"
        }
        fn visit(&mut self, _ast: &mut Ast, _node: NodeId, _ctx: &mut PassContext) -> VisitResult {
            Ok(VisitAction::Break)
        }
    }

    #[test]
    fn break_skips_children() {
        let mut ast = Ast::new();
        let a = ast.push(NodeKind::Integer { value: 1, signed: true, size: 32 }, SourceLocation::new(1, 1));
        let b = ast.push(NodeKind::Integer { value: 2, signed: true, size: 32 }, SourceLocation::new(1, 1));
        let root = ast.push(NodeKind::Exp { op: crate::ast::BinOp::Add, lhs: a, rhs: b }, SourceLocation::new(1, 1));
        let mut pass = BreakAtRoot;
        let mut ctx = PassContext::new();
        // Should not panic/visit children; nothing to assert but completion.
        run_pass(&mut pass, &mut ast, root, &mut ctx).unwrap();
    }
}
