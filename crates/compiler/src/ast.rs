//! Abstract syntax tree for the Poke language.
//!
//! A node is a tagged variant with a unique integer id, a source
//! location, a `type` slot, and a `compiled` marker. There is no close
//! analogue for the node *shapes* themselves among this workspace's
//! other crates (a concatenative AST is words/quotations; poke's source
//! language has declarations, structs, offsets, casts, none of which have
//! a concatenative counterpart), so the node set is grounded directly on
//! `original_source/libpoke/pkl.h`'s node codes.
//!
//! The *shape* of the AST storage is grounded on `poke-core::arena`: every
//! node lives in one `Arena<NodeData>`, addressed by a stable [`NodeId`].
//! "Replace this node" is then just overwriting the arena slot in
//! place — the id, and therefore every parent's reference to it, stays
//! valid.

use poke_core::arena::{Arena, ArenaId};
use poke_runtime::PokeType;
use std::path::PathBuf;
use std::rc::Rc;

pub type NodeId = ArenaId<NodeData>;

/// Source location for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceLocation {
    pub file: Option<PathBuf>,
    pub line: usize,
    pub column: usize,
}

impl SourceLocation {
    pub fn new(line: usize, column: usize) -> Self {
        SourceLocation {
            file: None,
            line,
            column,
        }
    }
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.file {
            Some(p) => write!(f, "{}:{}:{}", p.display(), self.line, self.column),
            None => write!(f, "{}:{}", self.line, self.column),
        }
    }
}

/// Three-valued completeness as tracked during typing (mirrors
/// `poke_runtime::types::Completeness`).
pub use poke_runtime::Completeness;

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    BNot,
    PreIncr,
    PreDecr,
    PostIncr,
    PostDecr,
}

/// A type expression as written in source, before `typify` resolves it to
/// a `PokeType`.
#[derive(Debug, Clone)]
pub enum TypeExpr {
    Named(String),
    Integral { size: u32, signed: bool },
    String,
    Array { elem: Box<TypeExpr>, bound: Option<NodeId> },
    Struct { name: Option<String>, fields: Vec<StructTypeField>, is_union: bool, pinned: bool },
    Offset { base: Box<TypeExpr>, unit: NodeId },
    Closure { ret: Box<TypeExpr>, args: Vec<FuncTypeArg>, vararg: bool },
    Void,
    Any,
}

#[derive(Debug, Clone)]
pub struct StructTypeField {
    pub name: Option<String>,
    pub ty: TypeExpr,
    /// Optional-field constraint predicate (union alternative selector or
    /// an `if (cond)` trailing a field declaration).
    pub constraint: Option<NodeId>,
    pub is_method: bool,
    pub method_body: Option<NodeId>,
}

#[derive(Debug, Clone)]
pub struct FuncTypeArg {
    pub name: Option<String>,
    pub ty: TypeExpr,
    pub vararg: bool,
    pub optional: bool,
}

#[derive(Debug, Clone)]
pub struct FuncArg {
    pub name: String,
    pub ty: TypeExpr,
    pub vararg: bool,
    pub optional: bool,
    pub default: Option<NodeId>,
}

#[derive(Debug, Clone)]
pub struct Enumerator {
    pub name: String,
    pub value: Option<NodeId>,
}

/// The tagged node variant set.
#[derive(Debug, Clone)]
pub enum NodeKind {
    Program { decls: Vec<NodeId> },
    /// `src`: a verbatim source fragment kept only for disassembly/printing
    /// of the span a declaration was parsed from.
    Src { text: String },

    Integer { value: i64, signed: bool, size: u32 },
    StringLit { value: String },
    Identifier { name: String },

    Exp { op: BinOp, lhs: NodeId, rhs: NodeId },
    Unary { op: UnOp, operand: NodeId },
    CondExp { cond: NodeId, then_branch: NodeId, else_branch: NodeId },

    Array { elements: Vec<NodeId> },
    ArrayInitializer { index: Option<NodeId>, value: NodeId },

    /// `e[from:to]`: a bit/element range of a mappable value.
    Trimmer { base: NodeId, from: NodeId, to: Option<NodeId> },
    /// `e[idx]`.
    Indexer { base: NodeId, index: NodeId },

    /// Struct *value* constructor literal: `T { a: 1, b: 2 }`.
    StructCons { type_name: Option<String>, fields: Vec<NodeId> },
    StructField { name: Option<String>, value: NodeId },
    /// `e.field`.
    StructRef { base: NodeId, field: String },

    /// Offset literal/constructor: `magnitude#unit`.
    Offset { magnitude: NodeId, unit: NodeId },
    /// `(T) e`.
    Cast { ty: TypeExpr, operand: NodeId },
    /// `e isa T`.
    Isa { operand: NodeId, ty: TypeExpr },
    /// `T @ offset`: map `T` at `offset` in the current IOS.
    Map { ty: TypeExpr, ios: Option<NodeId>, offset: NodeId },
    /// General-purpose constructor invocation distinct from a field literal
    /// (`T ()`  — an unmapped, zero-initialized value of type `T`).
    Cons { ty: TypeExpr },

    Type { ty: TypeExpr },
    StructTypeField(StructTypeField),

    /// A declaration: `var`, `type`, `fun`, or `enum` — poke's shared
    /// "decl" wrapper around the four declaration kinds.
    Decl(Decl),

    Funcall { callee: NodeId, args: Vec<NodeId> },
    FuncallArg { name: Option<String>, value: NodeId },

    Func { args: Vec<FuncArg>, ret: TypeExpr, body: NodeId, method_of: Option<String> },
    FuncArgNode(FuncArg),
    FuncTypeArgNode(FuncTypeArg),

    CompStmt { stmts: Vec<NodeId> },
    AssStmt { lvalue: NodeId, value: NodeId },
    IfStmt { cond: NodeId, then_branch: NodeId, else_branch: Option<NodeId> },

    /// `while`, `for(;;)`, and `for (x in a)` all lower to this one node;
    /// `iterator` is `Some` only for the `for-in` form.
    LoopStmt {
        init: Option<NodeId>,
        cond: Option<NodeId>,
        step: Option<NodeId>,
        iterator: Option<NodeId>,
        body: NodeId,
    },
    LoopStmtIterator { var_name: String, container: NodeId, where_clause: Option<NodeId> },

    BreakStmt,
    ContinueStmt,
    ReturnStmt { value: Option<NodeId> },
    ExpStmt { expr: NodeId },
    TryCatchStmt { body: NodeId, catch_var: Option<String>, handler: NodeId },
    TryUntilStmt { body: NodeId, until: NodeId },
    RaiseStmt { value: Option<NodeId> },

    Format { template: String, args: Vec<NodeId> },
    FormatArg { value: NodeId },
    PrintStmt { expr: NodeId, newline: bool },

    Lambda { func: NodeId },
    IncrDecr { op: UnOp, operand: NodeId },
    NullStmt,

    Enum { name: String, enumerators: Vec<Enumerator> },
    Enumerator(Enumerator),

    Var { name: String, init: NodeId },
}

#[derive(Debug, Clone)]
pub enum Decl {
    Var { name: String, init: NodeId },
    Type { name: String, ty: TypeExpr },
    Func { name: String, func: NodeId },
    Enum { name: String, enumerators: Vec<Enumerator> },
}

impl Decl {
    pub fn name(&self) -> &str {
        match self {
            Decl::Var { name, .. } => name,
            Decl::Type { name, .. } => name,
            Decl::Func { name, .. } => name,
            Decl::Enum { name, .. } => name,
        }
    }
}

/// One arena slot: the node's tagged payload plus the metadata every node
/// carries regardless of kind.
#[derive(Debug, Clone)]
pub struct NodeData {
    pub kind: NodeKind,
    pub loc: SourceLocation,
    /// Filled in by `typify`; `None` before typing has run.
    pub ty: Option<Rc<PokeType>>,
    /// Short-circuits repeated passes over an already-typed subtree.
    pub compiled: bool,
}

/// A single AST: owns every node reachable from `root` in one arena.
#[derive(Debug, Default)]
pub struct Ast {
    nodes: Arena<NodeData>,
    pub root: Option<NodeId>,
}

impl Ast {
    pub fn new() -> Self {
        Ast {
            nodes: Arena::new(),
            root: None,
        }
    }

    pub fn push(&mut self, kind: NodeKind, loc: SourceLocation) -> NodeId {
        self.nodes.push(NodeData {
            kind,
            loc,
            ty: None,
            compiled: false,
        })
    }

    pub fn get(&self, id: NodeId) -> &NodeData {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut NodeData {
        self.nodes.get_mut(id)
    }

    /// "Replace the current node": overwrite the slot in place, keeping
    /// `id` (and therefore every parent reference to it) valid.
    pub fn replace(&mut self, id: NodeId, kind: NodeKind) {
        self.nodes.get_mut(id).kind = kind;
    }

    pub fn set_type(&mut self, id: NodeId, ty: Rc<PokeType>) {
        self.nodes.get_mut(id).ty = Some(ty);
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_keeps_id_stable() {
        let mut ast = Ast::new();
        let id = ast.push(
            NodeKind::Integer { value: 1, signed: true, size: 32 },
            SourceLocation::new(1, 1),
        );
        ast.replace(id, NodeKind::Integer { value: 2, signed: true, size: 32 });
        match &ast.get(id).kind {
            NodeKind::Integer { value, .. } => assert_eq!(*value, 2),
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn compiled_marker_defaults_false() {
        let mut ast = Ast::new();
        let id = ast.push(NodeKind::NullStmt, SourceLocation::new(1, 1));
        assert!(!ast.get(id).compiled);
    }
}
