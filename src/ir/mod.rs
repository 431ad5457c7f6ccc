//! # Typed IR
//!
//! Intermediate representation consumed and produced by the grounding
//! pipeline: literals, patterns, expressions, query steps, and the closed
//! built-in operator table the predicate inverter pattern-matches on.
//!
//! The IR arrives fully typed from upstream inference. Every expression
//! reports its type via [`Exp::ty`]; id-patterns carry `(name, ordinal, type)`
//! and compare by all three, so two declarations of the same name differ in
//! ordinal and never collide.
//!
//! ## Pipeline Position
//!
//! ```text
//! type inference -> [Typed IR] -> extent analysis / inversion -> rewritten IR
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::range_set::RangeSet;
use crate::types::Type;

pub mod visit;

// ============================================================================
// Literals
// ============================================================================

/// A literal constant.
///
/// `Eq`/`Hash` are implemented by bit pattern for `Real` so literals can key
/// caches and appear inside patterns.
#[derive(Debug, Clone)]
pub enum Literal {
    Unit,
    Bool(bool),
    Int(i64),
    Real(f64),
    Char(char),
    String(String),
}

impl PartialEq for Literal {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Literal::Unit, Literal::Unit) => true,
            (Literal::Bool(a), Literal::Bool(b)) => a == b,
            (Literal::Int(a), Literal::Int(b)) => a == b,
            (Literal::Real(a), Literal::Real(b)) => a.to_bits() == b.to_bits(),
            (Literal::Char(a), Literal::Char(b)) => a == b,
            (Literal::String(a), Literal::String(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Literal {}

impl Hash for Literal {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Literal::Unit => 0u8.hash(state),
            Literal::Bool(b) => (1u8, b).hash(state),
            Literal::Int(i) => (2u8, i).hash(state),
            Literal::Real(r) => (3u8, r.to_bits()).hash(state),
            Literal::Char(c) => (4u8, c).hash(state),
            Literal::String(s) => (5u8, s).hash(state),
        }
    }
}

impl Literal {
    /// The literal's type
    pub fn ty(&self) -> Type {
        match self {
            Literal::Unit => Type::Unit,
            Literal::Bool(_) => Type::Bool,
            Literal::Int(_) => Type::Int,
            Literal::Real(_) => Type::Real,
            Literal::Char(_) => Type::Char,
            Literal::String(_) => Type::String,
        }
    }

    /// Order two literals of the same kind; `None` across kinds
    pub fn compare(&self, other: &Literal) -> Option<Ordering> {
        match (self, other) {
            (Literal::Int(a), Literal::Int(b)) => Some(a.cmp(b)),
            (Literal::Real(a), Literal::Real(b)) => a.partial_cmp(b),
            (Literal::Char(a), Literal::Char(b)) => Some(a.cmp(b)),
            (Literal::String(a), Literal::String(b)) => Some(a.cmp(b)),
            (Literal::Bool(a), Literal::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// True if this is the boolean literal `true`
    pub fn is_true(&self) -> bool {
        matches!(self, Literal::Bool(true))
    }

    /// True if this is the boolean literal `false`
    pub fn is_false(&self) -> bool {
        matches!(self, Literal::Bool(false))
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Unit => write!(f, "()"),
            Literal::Bool(b) => write!(f, "{b}"),
            Literal::Int(i) => write!(f, "{i}"),
            Literal::Real(r) => write!(f, "{r}"),
            Literal::Char(c) => write!(f, "#\"{c}\""),
            Literal::String(s) => write!(f, "\"{s}\""),
        }
    }
}

// ============================================================================
// Patterns
// ============================================================================

/// A named pattern variable.
///
/// Identity is `(name, ordinal, type)`: parsing and type inference assign a
/// fresh ordinal per binding, so shadowed names never collide. The core also
/// mints fresh id-patterns (via [`NameGen`]) when it introduces auxiliary
/// scans.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdPat {
    pub name: String,
    pub ordinal: u32,
    pub ty: Type,
}

impl IdPat {
    pub fn new(name: impl Into<String>, ordinal: u32, ty: Type) -> Self {
        IdPat {
            name: name.into(),
            ordinal,
            ty,
        }
    }
}

impl fmt::Display for IdPat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Source of fresh ordinals for id-patterns minted by the core.
///
/// A monotonic counter scoped to one compilation; never shared across
/// compilations.
#[derive(Debug, Default)]
pub struct NameGen {
    next: u32,
}

impl NameGen {
    /// Create a generator whose ordinals start above any ordinal already in
    /// use by the input declaration.
    pub fn starting_at(next: u32) -> Self {
        NameGen { next }
    }

    /// Mint a fresh id-pattern
    pub fn fresh(&mut self, prefix: &str, ty: Type) -> IdPat {
        let ordinal = self.next;
        self.next += 1;
        IdPat::new(format!("{prefix}_{ordinal}"), ordinal, ty)
    }
}

/// A pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Pat {
    Id(IdPat),
    Wildcard(Type),
    Literal(Literal),
    /// Ordered sub-patterns
    Tuple(Vec<Pat>),
    /// Ordered (label, sub-pattern) pairs; kept in label order
    Record(Vec<(String, Pat)>),
    /// Datatype constructor pattern
    Ctor {
        name: String,
        arg: Option<Box<Pat>>,
        ty: Type,
    },
    /// `id as pat`
    As { id: IdPat, pat: Box<Pat> },
}

impl Pat {
    /// The pattern's type
    pub fn ty(&self) -> Type {
        match self {
            Pat::Id(id) => id.ty.clone(),
            Pat::Wildcard(t) => t.clone(),
            Pat::Literal(l) => l.ty(),
            Pat::Tuple(ps) => Type::Tuple(ps.iter().map(Pat::ty).collect()),
            Pat::Record(fields) => {
                Type::record(fields.iter().map(|(l, p)| (l.clone(), p.ty())), false)
            }
            Pat::Ctor { ty, .. } => ty.clone(),
            Pat::As { id, .. } => id.ty.clone(),
        }
    }

    /// The named sub-patterns this pattern binds, leaves first, left to right
    pub fn expand(&self) -> Vec<&IdPat> {
        let mut out = Vec::new();
        self.collect_ids(&mut out);
        out
    }

    fn collect_ids<'a>(&'a self, out: &mut Vec<&'a IdPat>) {
        match self {
            Pat::Id(id) => out.push(id),
            Pat::Wildcard(_) | Pat::Literal(_) => {}
            Pat::Tuple(ps) => {
                for p in ps {
                    p.collect_ids(out);
                }
            }
            Pat::Record(fields) => {
                for (_, p) in fields {
                    p.collect_ids(out);
                }
            }
            Pat::Ctor { arg, .. } => {
                if let Some(p) = arg {
                    p.collect_ids(out);
                }
            }
            Pat::As { id, pat } => {
                out.push(id);
                pat.collect_ids(out);
            }
        }
    }

    /// True if `id` is bound anywhere in this pattern
    pub fn binds(&self, id: &IdPat) -> bool {
        self.expand().iter().any(|p| *p == id)
    }

    /// Flatten to id-patterns only; every destructuring position must be an id
    pub fn flatten_ids(&self, position: &str) -> crate::error::GroundResult<Vec<IdPat>> {
        match self {
            Pat::Id(id) => Ok(vec![id.clone()]),
            Pat::Tuple(ps) => {
                let mut out = Vec::with_capacity(ps.len());
                for p in ps {
                    match p {
                        Pat::Id(id) => out.push(id.clone()),
                        other => {
                            return Err(crate::error::GroundError::PatternMustBeIdentifier {
                                found: other.to_string(),
                                position: position.to_string(),
                            })
                        }
                    }
                }
                Ok(out)
            }
            other => Err(crate::error::GroundError::PatternMustBeIdentifier {
                found: other.to_string(),
                position: position.to_string(),
            }),
        }
    }
}

impl fmt::Display for Pat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pat::Id(id) => write!(f, "{id}"),
            Pat::Wildcard(_) => write!(f, "_"),
            Pat::Literal(l) => write!(f, "{l}"),
            Pat::Tuple(ps) => {
                write!(f, "(")?;
                for (i, p) in ps.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{p}")?;
                }
                write!(f, ")")
            }
            Pat::Record(fields) => {
                write!(f, "{{")?;
                for (i, (l, p)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{l} = {p}")?;
                }
                write!(f, "}}")
            }
            Pat::Ctor { name, arg, .. } => match arg {
                Some(p) => write!(f, "{name} {p}"),
                None => write!(f, "{name}"),
            },
            Pat::As { id, pat } => write!(f, "{id} as {pat}"),
        }
    }
}

// ============================================================================
// Built-in operators
// ============================================================================

/// The closed built-in operator table.
///
/// The predicate inverter pattern-matches on these identities; extensions may
/// add operators but must preserve the ones listed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltIn {
    /// Boolean conjunction (short-circuiting)
    AndAlso,
    /// Boolean disjunction (short-circuiting)
    OrElse,
    OpEq,
    OpNe,
    OpLt,
    OpLe,
    OpGt,
    OpGe,
    OpPlus,
    OpMinus,
    OpTimes,
    OpDivide,
    /// Collection membership
    Elem,
    /// Monadic existence over a collection
    NonEmpty,
    ListConcat,
    BagConcat,
    /// `tabulate (n, f)` building a list of `f 0 .. f (n-1)`
    ListTabulate,
    BagTabulate,
    /// List literal constructor
    ListOf,
    /// Bag literal constructor
    BagOf,
    /// String prefix test
    IsPrefix,
    /// `substring (s, start, len)`
    Substring,
    /// String length
    Size,
    /// Least fixed point: `bag a -> (bag a * bag a -> bag a) -> bag a`
    Iterate,
}

impl BuiltIn {
    /// For comparisons, the operator with operands swapped
    pub fn reverse(self) -> Option<BuiltIn> {
        match self {
            BuiltIn::OpEq => Some(BuiltIn::OpEq),
            BuiltIn::OpNe => Some(BuiltIn::OpNe),
            BuiltIn::OpLt => Some(BuiltIn::OpGt),
            BuiltIn::OpLe => Some(BuiltIn::OpGe),
            BuiltIn::OpGt => Some(BuiltIn::OpLt),
            BuiltIn::OpGe => Some(BuiltIn::OpLe),
            _ => None,
        }
    }

    /// Equality, inequality, and the four ordered comparisons
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BuiltIn::OpEq
                | BuiltIn::OpNe
                | BuiltIn::OpLt
                | BuiltIn::OpLe
                | BuiltIn::OpGt
                | BuiltIn::OpGe
        )
    }

    /// Display name
    pub fn name(self) -> &'static str {
        match self {
            BuiltIn::AndAlso => "andalso",
            BuiltIn::OrElse => "orelse",
            BuiltIn::OpEq => "=",
            BuiltIn::OpNe => "<>",
            BuiltIn::OpLt => "<",
            BuiltIn::OpLe => "<=",
            BuiltIn::OpGt => ">",
            BuiltIn::OpGe => ">=",
            BuiltIn::OpPlus => "+",
            BuiltIn::OpMinus => "-",
            BuiltIn::OpTimes => "*",
            BuiltIn::OpDivide => "/",
            BuiltIn::Elem => "elem",
            BuiltIn::NonEmpty => "nonEmpty",
            BuiltIn::ListConcat => "List.concat",
            BuiltIn::BagConcat => "Bag.concat",
            BuiltIn::ListTabulate => "List.tabulate",
            BuiltIn::BagTabulate => "Bag.tabulate",
            BuiltIn::ListOf => "list",
            BuiltIn::BagOf => "bag",
            BuiltIn::IsPrefix => "String.isPrefix",
            BuiltIn::Substring => "String.substring",
            BuiltIn::Size => "String.size",
            BuiltIn::Iterate => "Relational.iterate",
        }
    }
}

// ============================================================================
// Expressions
// ============================================================================

/// A typed expression
#[derive(Debug, Clone, PartialEq)]
pub enum Exp {
    Literal(Literal),
    /// Reference to a bound variable; carries the referenced id-pattern
    Id(IdPat),
    Tuple(Vec<Exp>),
    /// (label, expression) pairs, kept in label order
    Record(Vec<(String, Exp)>),
    /// Positional field selection `#slot input` (0-based slot into the
    /// record-like view of the input's type)
    Select { slot: usize, input: Box<Exp> },
    /// Built-in operator literal at an instantiated type
    Builtin(BuiltIn, Type),
    Apply {
        func: Box<Exp>,
        arg: Box<Exp>,
        ty: Type,
    },
    /// Lambda `fn pat => body`
    Fn { param: Pat, body: Box<Exp> },
    Case {
        input: Box<Exp>,
        arms: Vec<(Pat, Exp)>,
        ty: Type,
    },
    Let { decls: Vec<Decl>, body: Box<Exp> },
    From(Box<FromExp>),
    /// Universal extent of `element_ty`, bounded by `ranges`; type
    /// `element_ty bag`. An unbounded range set over an infinite type is the
    /// marker the expander must eliminate.
    Extent { element_ty: Type, ranges: RangeSet },
}

impl Exp {
    /// The expression's type
    pub fn ty(&self) -> Type {
        match self {
            Exp::Literal(l) => l.ty(),
            Exp::Id(id) => id.ty.clone(),
            Exp::Tuple(es) => Type::Tuple(es.iter().map(Exp::ty).collect()),
            Exp::Record(fields) => {
                Type::record(fields.iter().map(|(l, e)| (l.clone(), e.ty())), false)
            }
            Exp::Select { slot, input } => {
                input.ty().nth_field(*slot).cloned().unwrap_or(Type::Unit)
            }
            Exp::Builtin(_, ty) => ty.clone(),
            Exp::Apply { ty, .. } => ty.clone(),
            Exp::Fn { param, body } => Type::func(param.ty(), body.ty()),
            Exp::Case { ty, .. } => ty.clone(),
            Exp::Let { body, .. } => body.ty(),
            Exp::From(from) => from.ty.clone(),
            Exp::Extent { element_ty, .. } => Type::bag(element_ty.clone()),
        }
    }

    // ------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------

    pub fn bool(b: bool) -> Exp {
        Exp::Literal(Literal::Bool(b))
    }

    pub fn int(i: i64) -> Exp {
        Exp::Literal(Literal::Int(i))
    }

    pub fn id(pat: &IdPat) -> Exp {
        Exp::Id(pat.clone())
    }

    /// `#slot input`
    pub fn select(slot: usize, input: Exp) -> Exp {
        Exp::Select {
            slot,
            input: Box::new(input),
        }
    }

    /// Apply a binary built-in to `(a, b)`
    pub fn call2(op: BuiltIn, a: Exp, b: Exp) -> Exp {
        let result = Self::binary_result_type(op, &a, &b);
        let func_ty = Type::func(Type::Tuple(vec![a.ty(), b.ty()]), result.clone());
        Exp::Apply {
            func: Box::new(Exp::Builtin(op, func_ty)),
            arg: Box::new(Exp::Tuple(vec![a, b])),
            ty: result,
        }
    }

    /// Apply a unary built-in
    pub fn call1(op: BuiltIn, a: Exp) -> Exp {
        let result = match op {
            BuiltIn::NonEmpty => Type::Bool,
            BuiltIn::Size => Type::Int,
            _ => a.ty(),
        };
        let func_ty = Type::func(a.ty(), result.clone());
        Exp::Apply {
            func: Box::new(Exp::Builtin(op, func_ty)),
            arg: Box::new(a),
            ty: result,
        }
    }

    fn binary_result_type(op: BuiltIn, a: &Exp, b: &Exp) -> Type {
        match op {
            BuiltIn::AndAlso
            | BuiltIn::OrElse
            | BuiltIn::OpEq
            | BuiltIn::OpNe
            | BuiltIn::OpLt
            | BuiltIn::OpLe
            | BuiltIn::OpGt
            | BuiltIn::OpGe
            | BuiltIn::Elem
            | BuiltIn::IsPrefix => Type::Bool,
            BuiltIn::OpPlus | BuiltIn::OpMinus | BuiltIn::OpTimes | BuiltIn::OpDivide => a.ty(),
            BuiltIn::ListConcat | BuiltIn::BagConcat => a.ty(),
            BuiltIn::ListTabulate => match b.ty() {
                Type::Fn(_, r) => Type::List(r),
                _ => Type::Unit,
            },
            BuiltIn::BagTabulate => match b.ty() {
                Type::Fn(_, r) => Type::Bag(r),
                _ => Type::Unit,
            },
            BuiltIn::Iterate => a.ty(),
            _ => Type::Unit,
        }
    }

    /// `a andalso b`, simplifying literal `true` operands
    pub fn and(a: Exp, b: Exp) -> Exp {
        if a.is_literal_true() {
            return b;
        }
        if b.is_literal_true() {
            return a;
        }
        Exp::call2(BuiltIn::AndAlso, a, b)
    }

    /// Conjunction of all expressions; literal `true` when empty
    pub fn and_all(exps: Vec<Exp>) -> Exp {
        exps.into_iter()
            .reduce(Exp::and)
            .unwrap_or_else(|| Exp::bool(true))
    }

    /// `a orelse b`
    pub fn or(a: Exp, b: Exp) -> Exp {
        Exp::call2(BuiltIn::OrElse, a, b)
    }

    /// List literal `[e1, ..., en]` of the given element type
    pub fn list_of(element_ty: Type, items: Vec<Exp>) -> Exp {
        let ty = Type::list(element_ty.clone());
        let arg_ty = Type::Tuple(items.iter().map(Exp::ty).collect());
        Exp::Apply {
            func: Box::new(Exp::Builtin(
                BuiltIn::ListOf,
                Type::func(arg_ty, ty.clone()),
            )),
            arg: Box::new(Exp::Tuple(items)),
            ty,
        }
    }

    /// Bag literal `{| e1, ..., en |}` of the given element type
    pub fn bag_of(element_ty: Type, items: Vec<Exp>) -> Exp {
        let ty = Type::bag(element_ty.clone());
        let arg_ty = Type::Tuple(items.iter().map(Exp::ty).collect());
        Exp::Apply {
            func: Box::new(Exp::Builtin(BuiltIn::BagOf, Type::func(arg_ty, ty.clone()))),
            arg: Box::new(Exp::Tuple(items)),
            ty,
        }
    }

    /// Universal (unbounded) extent of a type
    pub fn extent(element_ty: Type) -> Exp {
        Exp::Extent {
            element_ty,
            ranges: RangeSet::full(),
        }
    }

    // ------------------------------------------------------------------
    // Shape probes used by the inverter and extent analyzer
    // ------------------------------------------------------------------

    /// Decompose `Apply(Builtin op, Tuple [a, b])`
    pub fn as_apply2(&self) -> Option<(BuiltIn, &Exp, &Exp)> {
        if let Exp::Apply { func, arg, .. } = self {
            if let (Exp::Builtin(op, _), Exp::Tuple(items)) = (func.as_ref(), arg.as_ref()) {
                if let [a, b] = items.as_slice() {
                    return Some((*op, a, b));
                }
            }
        }
        None
    }

    /// Decompose `Apply(Builtin op, a)` for unary operators
    pub fn as_apply1(&self) -> Option<(BuiltIn, &Exp)> {
        if let Exp::Apply { func, arg, .. } = self {
            if let Exp::Builtin(op, _) = func.as_ref() {
                return Some((*op, arg));
            }
        }
        None
    }

    /// Items of a list/bag literal constructor application
    pub fn as_collection_literal(&self) -> Option<&[Exp]> {
        if let Exp::Apply { func, arg, .. } = self {
            if let Exp::Builtin(BuiltIn::ListOf | BuiltIn::BagOf, _) = func.as_ref() {
                if let Exp::Tuple(items) = arg.as_ref() {
                    return Some(items);
                }
            }
        }
        None
    }

    /// Flatten nested `andalso` into a conjunct list
    pub fn conjuncts(&self) -> Vec<&Exp> {
        let mut out = Vec::new();
        self.collect_conjuncts(&mut out);
        out
    }

    fn collect_conjuncts<'a>(&'a self, out: &mut Vec<&'a Exp>) {
        if let Some((BuiltIn::AndAlso, a, b)) = self.as_apply2() {
            a.collect_conjuncts(out);
            b.collect_conjuncts(out);
        } else {
            out.push(self);
        }
    }

    /// Flatten nested `orelse` into a disjunct list
    pub fn disjuncts(&self) -> Vec<&Exp> {
        let mut out = Vec::new();
        self.collect_disjuncts(&mut out);
        out
    }

    fn collect_disjuncts<'a>(&'a self, out: &mut Vec<&'a Exp>) {
        if let Some((BuiltIn::OrElse, a, b)) = self.as_apply2() {
            a.collect_disjuncts(out);
            b.collect_disjuncts(out);
        } else {
            out.push(self);
        }
    }

    pub fn is_literal_true(&self) -> bool {
        matches!(self, Exp::Literal(l) if l.is_true())
    }

    /// True when the expression is an extent over an infinite type with an
    /// unbounded range set
    pub fn is_infinite_extent(&self) -> bool {
        match self {
            Exp::Extent { element_ty, ranges } => !element_ty.is_finite() && !ranges.is_bounded(),
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Free variables and substitution
    // ------------------------------------------------------------------

    /// Free variables in first-occurrence order, deduplicated.
    ///
    /// Scope-aware: variables bound by lambdas, case arms, let declarations,
    /// and earlier query steps are not free.
    pub fn free_vars(&self) -> Vec<IdPat> {
        let mut out = Vec::new();
        let mut bound = Vec::new();
        self.collect_free(&mut bound, &mut out);
        out
    }

    fn collect_free(&self, bound: &mut Vec<IdPat>, out: &mut Vec<IdPat>) {
        match self {
            Exp::Literal(_) | Exp::Builtin(..) | Exp::Extent { .. } => {}
            Exp::Id(id) => {
                if !bound.contains(id) && !out.contains(id) {
                    out.push(id.clone());
                }
            }
            Exp::Tuple(es) => {
                for e in es {
                    e.collect_free(bound, out);
                }
            }
            Exp::Record(fields) => {
                for (_, e) in fields {
                    e.collect_free(bound, out);
                }
            }
            Exp::Select { input, .. } => input.collect_free(bound, out),
            Exp::Apply { func, arg, .. } => {
                func.collect_free(bound, out);
                arg.collect_free(bound, out);
            }
            Exp::Fn { param, body } => {
                let mark = bound.len();
                bound.extend(param.expand().into_iter().cloned());
                body.collect_free(bound, out);
                bound.truncate(mark);
            }
            Exp::Case { input, arms, .. } => {
                input.collect_free(bound, out);
                for (pat, body) in arms {
                    let mark = bound.len();
                    bound.extend(pat.expand().into_iter().cloned());
                    body.collect_free(bound, out);
                    bound.truncate(mark);
                }
            }
            Exp::Let { decls, body } => {
                let mark = bound.len();
                for decl in decls {
                    let Decl::Val { pat, exp, rec } = decl;
                    if *rec {
                        bound.extend(pat.expand().into_iter().cloned());
                        exp.collect_free(bound, out);
                    } else {
                        exp.collect_free(bound, out);
                        bound.extend(pat.expand().into_iter().cloned());
                    }
                }
                body.collect_free(bound, out);
                bound.truncate(mark);
            }
            Exp::From(from) => {
                let mark = bound.len();
                for step in &from.steps {
                    match step {
                        Step::Scan {
                            pat,
                            exp,
                            condition,
                        } => {
                            exp.collect_free(bound, out);
                            bound.extend(pat.expand().into_iter().cloned());
                            if let Some(c) = condition {
                                c.collect_free(bound, out);
                            }
                        }
                        Step::Where(e) | Step::Yield(e) => e.collect_free(bound, out),
                        Step::Group { keys, aggregates } => {
                            for (_, e) in keys {
                                e.collect_free(bound, out);
                            }
                            for agg in aggregates {
                                agg.exp.collect_free(bound, out);
                            }
                        }
                        Step::Order(keys) => {
                            for k in keys {
                                k.exp.collect_free(bound, out);
                            }
                        }
                        Step::Union { others, .. } => {
                            for e in others {
                                e.collect_free(bound, out);
                            }
                        }
                        Step::Distinct => {}
                    }
                }
                bound.truncate(mark);
            }
        }
    }

    /// Replace every free reference to `from` with `to`.
    ///
    /// Ordinals are globally unique within a compilation, so no capture can
    /// occur and inner binders never shadow `from`.
    pub fn substitute(&self, from: &IdPat, to: &Exp) -> Exp {
        let mut map = std::collections::HashMap::new();
        map.insert(from.clone(), to.clone());
        self.substitute_all(&map)
    }

    /// Simultaneous substitution of many ids
    pub fn substitute_all(&self, map: &std::collections::HashMap<IdPat, Exp>) -> Exp {
        match self {
            Exp::Id(id) => map.get(id).cloned().unwrap_or_else(|| self.clone()),
            Exp::Literal(_) | Exp::Builtin(..) | Exp::Extent { .. } => self.clone(),
            Exp::Tuple(es) => Exp::Tuple(es.iter().map(|e| e.substitute_all(map)).collect()),
            Exp::Record(fields) => Exp::Record(
                fields
                    .iter()
                    .map(|(l, e)| (l.clone(), e.substitute_all(map)))
                    .collect(),
            ),
            Exp::Select { slot, input } => Exp::Select {
                slot: *slot,
                input: Box::new(input.substitute_all(map)),
            },
            Exp::Apply { func, arg, ty } => Exp::Apply {
                func: Box::new(func.substitute_all(map)),
                arg: Box::new(arg.substitute_all(map)),
                ty: ty.clone(),
            },
            Exp::Fn { param, body } => Exp::Fn {
                param: param.clone(),
                body: Box::new(body.substitute_all(map)),
            },
            Exp::Case { input, arms, ty } => Exp::Case {
                input: Box::new(input.substitute_all(map)),
                arms: arms
                    .iter()
                    .map(|(p, e)| (p.clone(), e.substitute_all(map)))
                    .collect(),
                ty: ty.clone(),
            },
            Exp::Let { decls, body } => Exp::Let {
                decls: decls
                    .iter()
                    .map(|Decl::Val { rec, pat, exp }| Decl::Val {
                        rec: *rec,
                        pat: pat.clone(),
                        exp: exp.substitute_all(map),
                    })
                    .collect(),
                body: Box::new(body.substitute_all(map)),
            },
            Exp::From(from) => Exp::From(Box::new(FromExp {
                steps: from.steps.iter().map(|s| s.substitute_all(map)).collect(),
                ty: from.ty.clone(),
            })),
        }
    }

    /// Rewrite every type stored in the expression tree
    pub fn map_types(&self, f: &impl Fn(&Type) -> Type) -> Exp {
        match self {
            Exp::Literal(_) => self.clone(),
            Exp::Id(id) => Exp::Id(map_id_types(id, f)),
            Exp::Tuple(es) => Exp::Tuple(es.iter().map(|e| e.map_types(f)).collect()),
            Exp::Record(fields) => Exp::Record(
                fields
                    .iter()
                    .map(|(l, e)| (l.clone(), e.map_types(f)))
                    .collect(),
            ),
            Exp::Select { slot, input } => Exp::Select {
                slot: *slot,
                input: Box::new(input.map_types(f)),
            },
            Exp::Builtin(op, ty) => Exp::Builtin(*op, f(ty)),
            Exp::Apply { func, arg, ty } => Exp::Apply {
                func: Box::new(func.map_types(f)),
                arg: Box::new(arg.map_types(f)),
                ty: f(ty),
            },
            Exp::Fn { param, body } => Exp::Fn {
                param: map_pat_types(param, f),
                body: Box::new(body.map_types(f)),
            },
            Exp::Case { input, arms, ty } => Exp::Case {
                input: Box::new(input.map_types(f)),
                arms: arms
                    .iter()
                    .map(|(p, e)| (map_pat_types(p, f), e.map_types(f)))
                    .collect(),
                ty: f(ty),
            },
            Exp::Let { decls, body } => Exp::Let {
                decls: decls
                    .iter()
                    .map(|Decl::Val { rec, pat, exp }| Decl::Val {
                        rec: *rec,
                        pat: map_pat_types(pat, f),
                        exp: exp.map_types(f),
                    })
                    .collect(),
                body: Box::new(body.map_types(f)),
            },
            Exp::From(from) => Exp::From(Box::new(FromExp {
                steps: from.steps.iter().map(|s| s.map_types(f)).collect(),
                ty: f(&from.ty),
            })),
            Exp::Extent { element_ty, ranges } => Exp::Extent {
                element_ty: f(element_ty),
                ranges: ranges.clone(),
            },
        }
    }
}

fn map_id_types(id: &IdPat, f: &impl Fn(&Type) -> Type) -> IdPat {
    IdPat {
        name: id.name.clone(),
        ordinal: id.ordinal,
        ty: f(&id.ty),
    }
}

/// Rewrite every type stored in a pattern
pub fn map_pat_types(pat: &Pat, f: &impl Fn(&Type) -> Type) -> Pat {
    match pat {
        Pat::Id(id) => Pat::Id(map_id_types(id, f)),
        Pat::Wildcard(t) => Pat::Wildcard(f(t)),
        Pat::Literal(l) => Pat::Literal(l.clone()),
        Pat::Tuple(ps) => Pat::Tuple(ps.iter().map(|p| map_pat_types(p, f)).collect()),
        Pat::Record(fields) => Pat::Record(
            fields
                .iter()
                .map(|(l, p)| (l.clone(), map_pat_types(p, f)))
                .collect(),
        ),
        Pat::Ctor { name, arg, ty } => Pat::Ctor {
            name: name.clone(),
            arg: arg.as_ref().map(|p| Box::new(map_pat_types(p, f))),
            ty: f(ty),
        },
        Pat::As { id, pat } => Pat::As {
            id: map_id_types(id, f),
            pat: Box::new(map_pat_types(pat, f)),
        },
    }
}

impl fmt::Display for Exp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exp::Literal(l) => write!(f, "{l}"),
            Exp::Id(id) => write!(f, "{id}"),
            Exp::Tuple(es) => {
                write!(f, "(")?;
                for (i, e) in es.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{e}")?;
                }
                write!(f, ")")
            }
            Exp::Record(fields) => {
                write!(f, "{{")?;
                for (i, (l, e)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{l} = {e}")?;
                }
                write!(f, "}}")
            }
            Exp::Select { slot, input } => write!(f, "#{} {input}", slot + 1),
            Exp::Builtin(op, _) => write!(f, "{}", op.name()),
            Exp::Apply { func, arg, .. } => {
                if let Some((op, a, b)) = self.as_apply2() {
                    write!(f, "{a} {} {b}", op.name())
                } else {
                    write!(f, "{func} {arg}")
                }
            }
            Exp::Fn { param, body } => write!(f, "fn {param} => {body}"),
            Exp::Case { input, arms, .. } => {
                write!(f, "case {input} of ")?;
                for (i, (p, e)) in arms.iter().enumerate() {
                    if i > 0 {
                        write!(f, " | ")?;
                    }
                    write!(f, "{p} => {e}")?;
                }
                Ok(())
            }
            Exp::Let { body, .. } => write!(f, "let ... in {body} end"),
            Exp::From(from) => {
                write!(f, "from")?;
                let mut first = true;
                for step in &from.steps {
                    match step {
                        Step::Scan { pat, exp, .. } => {
                            if first {
                                write!(f, " {pat} in {exp}")?;
                            } else {
                                write!(f, ", {pat} in {exp}")?;
                            }
                        }
                        Step::Where(e) => write!(f, " where {e}")?,
                        Step::Yield(e) => write!(f, " yield {e}")?,
                        Step::Group { .. } => write!(f, " group ...")?,
                        Step::Order(_) => write!(f, " order ...")?,
                        Step::Union { .. } => write!(f, " union ...")?,
                        Step::Distinct => write!(f, " distinct")?,
                    }
                    first = !matches!(step, Step::Scan { .. });
                }
                Ok(())
            }
            Exp::Extent { element_ty, ranges } => {
                if ranges.is_full() {
                    write!(f, "extent[{element_ty}]")
                } else {
                    write!(f, "extent[{element_ty}: {ranges}]")
                }
            }
        }
    }
}

// ============================================================================
// Query steps
// ============================================================================

/// An aggregate computed by a `group` step
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub label: String,
    /// Aggregate function expression (e.g. a built-in or lambda)
    pub exp: Exp,
}

/// A sort key in an `order` step
#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub exp: Exp,
    pub descending: bool,
}

/// One step of a `from` expression
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// `pat in exp [on condition]`; the pattern is *unbounded* when `exp` is
    /// an infinite extent
    Scan {
        pat: Pat,
        exp: Exp,
        condition: Option<Exp>,
    },
    Where(Exp),
    Yield(Exp),
    Group {
        keys: Vec<(String, Exp)>,
        aggregates: Vec<Aggregate>,
    },
    Order(Vec<SortKey>),
    /// Append the results of other queries
    Union { distinct: bool, others: Vec<Exp> },
    Distinct,
}

impl Step {
    fn substitute_all(&self, map: &std::collections::HashMap<IdPat, Exp>) -> Step {
        match self {
            Step::Scan {
                pat,
                exp,
                condition,
            } => Step::Scan {
                pat: pat.clone(),
                exp: exp.substitute_all(map),
                condition: condition.as_ref().map(|c| c.substitute_all(map)),
            },
            Step::Where(e) => Step::Where(e.substitute_all(map)),
            Step::Yield(e) => Step::Yield(e.substitute_all(map)),
            Step::Group { keys, aggregates } => Step::Group {
                keys: keys
                    .iter()
                    .map(|(l, e)| (l.clone(), e.substitute_all(map)))
                    .collect(),
                aggregates: aggregates
                    .iter()
                    .map(|a| Aggregate {
                        label: a.label.clone(),
                        exp: a.exp.substitute_all(map),
                    })
                    .collect(),
            },
            Step::Order(keys) => Step::Order(
                keys.iter()
                    .map(|k| SortKey {
                        exp: k.exp.substitute_all(map),
                        descending: k.descending,
                    })
                    .collect(),
            ),
            Step::Union { distinct, others } => Step::Union {
                distinct: *distinct,
                others: others.iter().map(|e| e.substitute_all(map)).collect(),
            },
            Step::Distinct => Step::Distinct,
        }
    }

    fn map_types(&self, f: &impl Fn(&Type) -> Type) -> Step {
        match self {
            Step::Scan {
                pat,
                exp,
                condition,
            } => Step::Scan {
                pat: map_pat_types(pat, f),
                exp: exp.map_types(f),
                condition: condition.as_ref().map(|c| c.map_types(f)),
            },
            Step::Where(e) => Step::Where(e.map_types(f)),
            Step::Yield(e) => Step::Yield(e.map_types(f)),
            Step::Group { keys, aggregates } => Step::Group {
                keys: keys
                    .iter()
                    .map(|(l, e)| (l.clone(), e.map_types(f)))
                    .collect(),
                aggregates: aggregates
                    .iter()
                    .map(|a| Aggregate {
                        label: a.label.clone(),
                        exp: a.exp.map_types(f),
                    })
                    .collect(),
            },
            Step::Order(keys) => Step::Order(
                keys.iter()
                    .map(|k| SortKey {
                        exp: k.exp.map_types(f),
                        descending: k.descending,
                    })
                    .collect(),
            ),
            Step::Union { distinct, others } => Step::Union {
                distinct: *distinct,
                others: others.iter().map(|e| e.map_types(f)).collect(),
            },
            Step::Distinct => Step::Distinct,
        }
    }
}

/// A `from` expression: an ordered step list plus its collection type
#[derive(Debug, Clone, PartialEq)]
pub struct FromExp {
    pub steps: Vec<Step>,
    pub ty: Type,
}

impl FromExp {
    /// True when any scan ranges over an infinite extent
    pub fn has_unbounded_scan(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s, Step::Scan { exp, .. } if exp.is_infinite_extent()))
    }
}

// ============================================================================
// Declarations
// ============================================================================

/// A top-level or `let`-bound declaration
#[derive(Debug, Clone, PartialEq)]
pub enum Decl {
    Val { rec: bool, pat: Pat, exp: Exp },
}

impl Decl {
    pub fn val(pat: Pat, exp: Exp) -> Decl {
        Decl::Val {
            rec: false,
            pat,
            exp,
        }
    }

    pub fn val_rec(pat: Pat, exp: Exp) -> Decl {
        Decl::Val {
            rec: true,
            pat,
            exp,
        }
    }
}
