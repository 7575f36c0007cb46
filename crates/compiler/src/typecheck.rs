//! Analysis and typing passes: `anal1`, `typify1`, `typify2`, `promo`,
//! `fold`, `anal2`, `analf`, run in that fixed order by `compile_program`.
//! Each is a small [`crate::passes::Pass`] built on the shared walker in
//! `passes.rs`.
//!
//! A concatenative language checks stack *effects*, not structural value
//! types, so there's no close analogue for this kind of type inference
//! among this workspace's other crates — the pass bodies are grounded
//! directly on `original_source/libpoke/pkl-anal.c`/`pkl-pass.c`'s phase
//! descriptions. The pass *shape* — a named `Pass` impl with a `tracing`
//! span, threading one mutable `PassContext` — follows the same
//! multi-stage-pipeline idiom `seq-compiler`'s resolver/typechecker
//! sequence uses.

use crate::ast::{Ast, BinOp, Decl, NodeId, NodeKind, TypeExpr};
use crate::passes::{CompileError, Pass, PassContext, VisitAction, VisitResult};
use poke_runtime::types::check_struct_invariants;
use poke_runtime::{ArrayBoundKind, PokeType, StructField};
use std::collections::HashMap;
use std::rc::Rc;

/// Resolves a source-level [`TypeExpr`] to a [`PokeType`], consulting
/// `named` for user `type` declarations seen so far.
fn resolve_type_expr(te: &TypeExpr, named: &HashMap<String, Rc<PokeType>>) -> Result<Rc<PokeType>, String> {
    Ok(match te {
        TypeExpr::Named(n) => named
            .get(n)
            .cloned()
            .ok_or_else(|| format!("undefined type `{n}`"))?,
        TypeExpr::Integral { size, signed } => Rc::new(PokeType::Integral { size: *size, signed: *signed }),
        TypeExpr::String => Rc::new(PokeType::String),
        TypeExpr::Void => Rc::new(PokeType::Void),
        TypeExpr::Any => Rc::new(PokeType::Any),
        TypeExpr::Array { elem, bound } => {
            let elem = resolve_type_expr(elem, named)?;
            Rc::new(PokeType::Array {
                elem,
                bound: if bound.is_some() { Some(ArrayBoundKind::Elements(0)) } else { None },
            })
        }
        TypeExpr::Struct { name, fields, is_union, pinned } => {
            let mut resolved = Vec::new();
            for f in fields {
                if f.is_method {
                    continue;
                }
                resolved.push(StructField {
                    name: f.name.clone(),
                    ty: resolve_type_expr(&f.ty, named)?,
                });
            }
            check_struct_invariants(&resolved, *is_union, *pinned, None)?;
            Rc::new(PokeType::Struct {
                name: name.clone(),
                fields: resolved,
                is_union: *is_union,
                pinned: *pinned,
                integral_backing: None,
            })
        }
        TypeExpr::Offset { base, .. } => {
            let base = resolve_type_expr(base, named)?;
            Rc::new(PokeType::Offset { base, unit: 1 })
        }
        TypeExpr::Closure { ret, args, vararg } => {
            let ret = resolve_type_expr(ret, named)?;
            let mut a = Vec::new();
            for arg in args {
                a.push(resolve_type_expr(&arg.ty, named)?);
            }
            Rc::new(PokeType::Closure { ret, args: a, vararg: *vararg })
        }
    })
}

/// `anal1`: declares names into lexical scope, and flags structural
/// misuse that doesn't require type information — `break`/`continue`
/// outside a loop, duplicate declarations in the same scope, `return`
/// outside a function, vararg/optional argument ordering, a literal void
/// array element, a non-positive literal offset unit, a union with a
/// plain field after an alternative, and a literal-constant left shift
/// whose count doesn't fit the shifted operand's width.
///
/// Methods are only ever produced by the struct/union field grammar
/// (`parse_type_expr`'s `KwMethod` arm), so "methods only inside struct
/// types" needs no runtime check here — the parser can't produce a
/// `Func` tagged as a method anywhere else.
pub struct Anal1 {
    loop_depth: u32,
    func_depth: u32,
}

impl Anal1 {
    pub fn new() -> Self {
        Anal1 { loop_depth: 0, func_depth: 0 }
    }

    /// Recurses into `node` under this pass's own rules instead of
    /// handing back to the shared walker. Used for `Func` bodies, which
    /// need `loop_depth` reset around them — a `break`/`continue` can
    /// never reach past a function boundary to an enclosing loop — and
    /// `func_depth` tracked so a bare `return` outside any function is
    /// rejected.
    fn walk(&mut self, ast: &mut Ast, node: NodeId, ctx: &mut PassContext) -> Result<(), CompileError> {
        if let VisitAction::Break = self.visit(ast, node, ctx)? {
            return Ok(());
        }
        for child in crate::passes::children_of(ast, node) {
            self.walk(ast, child, ctx)?;
        }
        Ok(())
    }
}

/// Checks a function signature's vararg/optional argument ordering:
/// at most one vararg argument and it must be last; once an argument is
/// optional, every later non-vararg argument must be too.
fn check_func_args(args: &[crate::ast::FuncArg], loc: &crate::ast::SourceLocation, ctx: &mut PassContext) {
    let vararg_count = args.iter().filter(|a| a.vararg).count();
    if vararg_count > 1 {
        ctx.error(loc.clone(), "a function may have at most one vararg argument");
    } else if vararg_count == 1 && !args.last().map(|a| a.vararg).unwrap_or(false) {
        ctx.error(loc.clone(), "a vararg argument must be the last parameter");
    }
    let mut seen_optional = false;
    for a in args {
        if a.vararg {
            continue;
        }
        if seen_optional && !a.optional {
            ctx.error(loc.clone(), "optional arguments must be trailing: a required argument may not follow an optional one");
        }
        if a.optional {
            seen_optional = true;
        }
    }
}

/// Flags a literal `void[]`/`void[][]` element type and a union with a
/// plain (unconditional, non-method) field after the first conditional
/// alternative — structural checks `typify`/`resolve_type_expr` can't do
/// since they run before named types, and don't, resolve every alias.
fn check_type_expr(ty: &TypeExpr, loc: &crate::ast::SourceLocation, ctx: &mut PassContext) {
    match ty {
        TypeExpr::Array { elem, .. } => {
            if matches!(&**elem, TypeExpr::Void) {
                ctx.error(loc.clone(), "array element type may not be `void`");
            }
            check_type_expr(elem, loc, ctx);
        }
        TypeExpr::Struct { fields, is_union, .. } => {
            if *is_union {
                let mut seen_alternative = false;
                for f in fields {
                    if f.is_method {
                        continue;
                    }
                    if seen_alternative && f.constraint.is_none() {
                        ctx.error(loc.clone(), "a union field without a constraint may not follow a conditional alternative");
                    }
                    if f.constraint.is_some() {
                        seen_alternative = true;
                    }
                }
            }
            for f in fields {
                check_type_expr(&f.ty, loc, ctx);
            }
        }
        TypeExpr::Offset { base, .. } => check_type_expr(base, loc, ctx),
        _ => {}
    }
}

impl Pass for Anal1 {
    fn name(&self) -> &'static str {
        "anal1"
    }

    fn visit(&mut self, ast: &mut Ast, node: NodeId, ctx: &mut PassContext) -> VisitResult {
        let loc = ast.get(node).loc.clone();
        let kind = ast.get(node).kind.clone();
        match kind {
            NodeKind::Decl(decl) => {
                let name = decl.name().to_string();
                if ctx.is_declared(&name) {
                    ctx.error(loc.clone(), format!("`{name}` is already declared in this scope"));
                } else {
                    ctx.declare(name);
                }
                if let Decl::Type { ty, .. } = &decl {
                    check_type_expr(ty, &loc, ctx);
                }
            }
            NodeKind::BreakStmt | NodeKind::ContinueStmt if self.loop_depth == 0 => {
                ctx.error(loc, "break/continue outside of a loop");
            }
            NodeKind::LoopStmt { .. } => {
                self.loop_depth += 1;
            }
            NodeKind::ReturnStmt { .. } if self.func_depth == 0 => {
                ctx.error(loc, "return outside of a function");
            }
            NodeKind::Offset { unit, .. } => {
                if let NodeKind::Integer { value, .. } = ast.get(unit).kind {
                    if value <= 0 {
                        ctx.error(loc, "offset unit must be greater than zero");
                    }
                }
            }
            NodeKind::Exp { op: BinOp::Shl, lhs, rhs } => {
                if let (NodeKind::Integer { size, .. }, NodeKind::Integer { value: shift, .. }) =
                    (ast.get(lhs).kind.clone(), ast.get(rhs).kind.clone())
                {
                    if shift < 0 || shift as u64 >= size as u64 {
                        ctx.error(loc, format!("left shift count {shift} is not less than the {size}-bit operand's width"));
                    }
                }
            }
            NodeKind::CompStmt { .. } => {
                ctx.push_scope();
            }
            NodeKind::Func { args, body, .. } => {
                check_func_args(&args, &loc, ctx);
                ctx.push_scope();
                let saved_loop_depth = std::mem::replace(&mut self.loop_depth, 0);
                self.func_depth += 1;
                self.walk(ast, body, ctx)?;
                self.func_depth -= 1;
                self.loop_depth = saved_loop_depth;
                return Ok(VisitAction::Break);
            }
            _ => {}
        }
        Ok(VisitAction::Continue)
    }
}

/// `typify1`: bottom-up type resolution for literals, declared variables,
/// and type declarations. Runs before `promo`/`fold`, so composite
/// expressions are typed in a second pass (`typify2`) once operand types
/// are all in place.
pub struct Typify1 {
    pub named_types: HashMap<String, Rc<PokeType>>,
    pub var_types: HashMap<String, Rc<PokeType>>,
}

impl Typify1 {
    pub fn new() -> Self {
        Typify1 { named_types: HashMap::new(), var_types: HashMap::new() }
    }
}

impl Pass for Typify1 {
    fn name(&self) -> &'static str {
        "typify1"
    }

    fn visit(&mut self, ast: &mut Ast, node: NodeId, ctx: &mut PassContext) -> VisitResult {
        let loc = ast.get(node).loc.clone();
        let kind = ast.get(node).kind.clone();
        match kind {
            NodeKind::Integer { signed, size, .. } => {
                ast.set_type(node, Rc::new(PokeType::Integral { size, signed }));
            }
            NodeKind::StringLit { .. } => {
                ast.set_type(node, Rc::new(PokeType::String));
            }
            NodeKind::Decl(Decl::Type { name, ty }) => match resolve_type_expr(&ty, &self.named_types) {
                Ok(resolved) => {
                    self.named_types.insert(name, resolved.clone());
                    ast.set_type(node, resolved);
                }
                Err(e) => ctx.error(loc, e),
            },
            NodeKind::Decl(Decl::Var { name, init }) => {
                if let Some(ty) = ast.get(init).ty.clone() {
                    self.var_types.insert(name, ty.clone());
                    ast.set_type(node, ty);
                }
            }
            NodeKind::Identifier { name } => {
                if let Some(ty) = self.var_types.get(&name).cloned() {
                    ast.set_type(node, ty);
                }
            }
            _ => {}
        }
        Ok(VisitAction::Continue)
    }
}

/// `typify2`: resolves the type-expression-bearing nodes that couldn't be
/// typed bottom-up alone (`Cast`, `Isa`, `Map`, struct/array constructors,
/// function signatures), now that `typify1` has populated named types.
pub struct Typify2<'a> {
    pub named_types: &'a HashMap<String, Rc<PokeType>>,
}

impl Pass for Typify2<'_> {
    fn name(&self) -> &'static str {
        "typify2"
    }

    fn visit(&mut self, ast: &mut Ast, node: NodeId, ctx: &mut PassContext) -> VisitResult {
        let loc = ast.get(node).loc.clone();
        let kind = ast.get(node).kind.clone();
        match kind {
            NodeKind::Cast { ty, .. } | NodeKind::Isa { ty, .. } | NodeKind::Map { ty, .. } => {
                match resolve_type_expr(&ty, self.named_types) {
                    Ok(resolved) => ast.set_type(node, resolved),
                    Err(e) => ctx.error(loc, e),
                }
            }
            NodeKind::Func { args, ret, .. } => {
                let mut arg_types = Vec::new();
                let mut ok = true;
                for a in &args {
                    match resolve_type_expr(&a.ty, self.named_types) {
                        Ok(t) => arg_types.push(t),
                        Err(e) => {
                            ctx.error(loc.clone(), e);
                            ok = false;
                        }
                    }
                }
                if ok {
                    match resolve_type_expr(&ret, self.named_types) {
                        Ok(ret_ty) => ast.set_type(
                            node,
                            Rc::new(PokeType::Closure { ret: ret_ty, args: arg_types, vararg: args.iter().any(|a| a.vararg) }),
                        ),
                        Err(e) => ctx.error(loc, e),
                    }
                }
            }
            NodeKind::Array { elements } => {
                if let Some(first) = elements.first() {
                    if let Some(elem_ty) = ast.get(*first).ty.clone() {
                        ast.set_type(
                            node,
                            Rc::new(PokeType::Array { elem: elem_ty, bound: Some(ArrayBoundKind::Elements(elements.len() as u64)) }),
                        );
                    }
                }
            }
            _ => {}
        }
        Ok(VisitAction::Continue)
    }
}

/// `promo`: inserts implicit integral promotions so a binary operator's
/// two operands share one width/signedness ("usual arithmetic
/// conversions"). Promotion is expressed as a `Cast` node wrapped around
/// the narrower operand — itself then subject to the ordinary `Cast`
/// codegen path, so `codegen.rs` needs no special case.
pub struct Promo;

impl Pass for Promo {
    fn name(&self) -> &'static str {
        "promo"
    }

    fn visit(&mut self, ast: &mut Ast, node: NodeId, _ctx: &mut PassContext) -> VisitResult {
        let kind = ast.get(node).kind.clone();
        if let NodeKind::Exp { op, lhs, rhs } = kind {
            if matches!(op, BinOp::And | BinOp::Or) {
                return Ok(VisitAction::Continue);
            }
            let lty = ast.get(lhs).ty.clone();
            let rty = ast.get(rhs).ty.clone();
            if let (Some(lty), Some(rty)) = (lty, rty) {
                if let (PokeType::Integral { size: ls, signed: lsig }, PokeType::Integral { size: rs, signed: rsig }) =
                    (&*lty, &*rty)
                {
                    let target_size = (*ls).max(*rs);
                    let target_signed = *lsig && *rsig;
                    if (*ls, *lsig) != (target_size, target_signed) {
                        let promoted = ast.push(
                            NodeKind::Cast { ty: TypeExpr::Integral { size: target_size, signed: target_signed }, operand: lhs },
                            ast.get(lhs).loc.clone(),
                        );
                        ast.set_type(promoted, Rc::new(PokeType::Integral { size: target_size, signed: target_signed }));
                        return Ok(VisitAction::Replace(NodeKind::Exp { op, lhs: promoted, rhs }));
                    }
                    if (*rs, *rsig) != (target_size, target_signed) {
                        let promoted = ast.push(
                            NodeKind::Cast { ty: TypeExpr::Integral { size: target_size, signed: target_signed }, operand: rhs },
                            ast.get(rhs).loc.clone(),
                        );
                        ast.set_type(promoted, Rc::new(PokeType::Integral { size: target_size, signed: target_signed }));
                        return Ok(VisitAction::Replace(NodeKind::Exp { op, lhs, rhs: promoted }));
                    }
                }
            }
        }
        Ok(VisitAction::Continue)
    }
}

/// `fold`: constant-folds a binary expression of two integer literals into
/// a single `Integer` node — constant subexpressions are folded before
/// codegen.
pub struct Fold;

impl Pass for Fold {
    fn name(&self) -> &'static str {
        "fold"
    }

    fn visit(&mut self, ast: &mut Ast, node: NodeId, ctx: &mut PassContext) -> VisitResult {
        let kind = ast.get(node).kind.clone();
        if let NodeKind::Exp { op, lhs, rhs } = kind {
            if let (NodeKind::Integer { value: a, signed, size }, NodeKind::Integer { value: b, .. }) =
                (ast.get(lhs).kind.clone(), ast.get(rhs).kind.clone())
            {
                let loc = ast.get(node).loc.clone();
                let folded = match op {
                    BinOp::Add => a.checked_add(b),
                    BinOp::Sub => a.checked_sub(b),
                    BinOp::Mul => a.checked_mul(b),
                    BinOp::Div if b != 0 => a.checked_div(b),
                    BinOp::Mod if b != 0 => a.checked_rem(b),
                    BinOp::BAnd => Some(a & b),
                    BinOp::BOr => Some(a | b),
                    BinOp::BXor => Some(a ^ b),
                    BinOp::Shl => Some(a << (b & 63)),
                    BinOp::Shr => Some(a >> (b & 63)),
                    BinOp::Lt => Some((a < b) as i64),
                    BinOp::Gt => Some((a > b) as i64),
                    BinOp::Le => Some((a <= b) as i64),
                    BinOp::Ge => Some((a >= b) as i64),
                    BinOp::Eq => Some((a == b) as i64),
                    BinOp::Ne => Some((a != b) as i64),
                    BinOp::Div | BinOp::Mod => {
                        ctx.error(loc, "division by zero in constant expression");
                        None
                    }
                    BinOp::And | BinOp::Or => None,
                };
                if let Some(value) = folded {
                    return Ok(VisitAction::Replace(NodeKind::Integer { value, signed, size }));
                }
            }
        }
        Ok(VisitAction::Continue)
    }
}

/// `anal2`: post-typing structural checks that need types to be in place
/// — e.g. a `Trimmer`/`Indexer` base must be an array or string, an
/// `AssStmt` lvalue must actually be assignable.
/// An lvalue is an `Identifier`, `StructRef`, `Indexer`, or `Trimmer`
/// (`x[a:b] = ...` splices a replacement range into the array).
pub struct Anal2;

impl Pass for Anal2 {
    fn name(&self) -> &'static str {
        "anal2"
    }

    fn visit(&mut self, ast: &mut Ast, node: NodeId, ctx: &mut PassContext) -> VisitResult {
        let loc = ast.get(node).loc.clone();
        let kind = ast.get(node).kind.clone();
        if let NodeKind::AssStmt { lvalue, .. } = kind {
            let assignable = matches!(
                ast.get(lvalue).kind,
                NodeKind::Identifier { .. }
                    | NodeKind::StructRef { .. }
                    | NodeKind::Indexer { .. }
                    | NodeKind::Trimmer { .. }
            );
            if !assignable {
                ctx.error(loc, "left-hand side of assignment is not an lvalue");
            }
        }
        Ok(VisitAction::Continue)
    }
}

/// `analf`: the final pass — every node that codegen requires a type for
/// must have one by now. Reports any that don't instead of panicking
/// later in the assembler.
pub struct AnalF;

impl Pass for AnalF {
    fn name(&self) -> &'static str {
        "analf"
    }

    fn visit(&mut self, ast: &mut Ast, node: NodeId, ctx: &mut PassContext) -> VisitResult {
        let needs_type = matches!(
            ast.get(node).kind,
            NodeKind::Exp { .. }
                | NodeKind::Unary { .. }
                | NodeKind::Integer { .. }
                | NodeKind::StringLit { .. }
                | NodeKind::Identifier { .. }
                | NodeKind::Cast { .. }
        );
        if needs_type && ast.get(node).ty.is_none() {
            ctx.error(ast.get(node).loc.clone(), "expression has no resolved type after typing");
        }
        Ok(VisitAction::Continue)
    }
}

/// Runs the fixed `anal1 -> typify1 -> typify2 -> promo -> fold -> anal2 ->
/// analf` sequence over `root`, aborting at the first phase that records a
/// fatal error.
pub fn run_all(ast: &mut Ast, root: NodeId) -> Result<PassContext, CompileError> {
    let mut ctx = PassContext::new();

    crate::passes::run_pass(&mut Anal1::new(), ast, root, &mut ctx)?;
    if !ctx.errors.is_empty() {
        return Ok(ctx);
    }

    let mut t1 = Typify1::new();
    crate::passes::run_pass(&mut t1, ast, root, &mut ctx)?;
    if !ctx.errors.is_empty() {
        return Ok(ctx);
    }

    let named = t1.named_types.clone();
    crate::passes::run_pass(&mut Typify2 { named_types: &named }, ast, root, &mut ctx)?;
    if !ctx.errors.is_empty() {
        return Ok(ctx);
    }

    crate::passes::run_pass(&mut Promo, ast, root, &mut ctx)?;
    crate::passes::run_pass(&mut Fold, ast, root, &mut ctx)?;
    if !ctx.errors.is_empty() {
        return Ok(ctx);
    }

    crate::passes::run_pass(&mut Anal2, ast, root, &mut ctx)?;
    crate::passes::run_pass(&mut AnalF, ast, root, &mut ctx)?;

    Ok(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_expression;

    #[test]
    fn folds_constant_addition() {
        let (mut ast, root) = parse_expression("1 + 2").unwrap();
        let ctx = run_all(&mut ast, root).unwrap();
        assert!(ctx.errors.is_empty());
        assert!(matches!(ast.get(root).kind, NodeKind::Integer { value: 3, .. }));
    }

    #[test]
    fn typifies_integer_literal() {
        let (mut ast, root) = parse_expression("42").unwrap();
        run_all(&mut ast, root).unwrap();
        assert!(ast.get(root).ty.is_some());
    }

    #[test]
    fn rejects_break_outside_loop() {
        let (mut ast, root) = parse_statement_break();
        let ctx = run_all(&mut ast, root).unwrap();
        assert!(!ctx.errors.is_empty());
    }

    fn parse_statement_break() -> (Ast, NodeId) {
        crate::parser::parse_statement("break;").unwrap()
    }

    #[test]
    fn promotes_mixed_width_operands() {
        let (mut ast, root) = parse_expression("(<64>int) 1 + 2").unwrap();
        let ctx = run_all(&mut ast, root).unwrap();
        assert!(ctx.errors.is_empty());
    }
}
