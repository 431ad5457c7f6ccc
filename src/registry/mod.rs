//! # Function Registry
//!
//! Pre-classifies each declared function by how invertible its body is, so
//! that the predicate inverter can treat calls as generators without
//! re-entering function bodies at every call site.
//!
//! | Status | Body shape | Call site meaning |
//! |---|---|---|
//! | `Invertible` | `arg elem c` | the call is a scan over `c` |
//! | `PartiallyInvertible` | `arg elem c andalso filter` | scan over `c` plus residual filters |
//! | `Recursive` | `base orelse recursive` | transitive closure over the base collection |
//! | `NotInvertible` | anything else | the call stays a filter |
//!
//! Lookup is by exact id-pattern identity first and by name on a miss, so a
//! recursive analysis that only knows a sibling function by name (the
//! transitive-closure analyzer examining `path` while `edge` is in an outer
//! scope) still resolves it.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::ir::visit::{walk_exp, Walk};
use crate::ir::{BuiltIn, Exp, IdPat, Pat};

/// Invertibility classification of a declared function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FnStatus {
    Invertible,
    PartiallyInvertible,
    Recursive,
    NotInvertible,
}

/// Cached analysis of one function declaration
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionInfo {
    pub status: FnStatus,
    /// The formal parameter, with a single-arm `case` on the parameter
    /// unwrapped to recover tuple destructuring
    pub formal: Pat,
    /// For (partially) invertible functions: the base collection. For
    /// recursive functions: the base-case expression.
    pub base: Option<Exp>,
    /// For recursive functions: the recursive-case expression
    pub step: Option<Exp>,
    /// The named patterns a call can generate (the formal's leaves)
    pub can_generate: Vec<IdPat>,
    /// Residual filters a call site must keep
    pub required_filters: Vec<Exp>,
}

/// Registry of function analyses, appended monotonically during one
/// compilation. Readers see every function declared textually earlier than
/// the call site.
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    by_id: HashMap<IdPat, Arc<FunctionInfo>>,
    by_name: HashMap<String, Arc<FunctionInfo>>,
}

impl FunctionRegistry {
    pub fn new() -> FunctionRegistry {
        FunctionRegistry::default()
    }

    /// Analyze a value declaration whose bound value is a lambda, and cache
    /// the result under the declared id.
    pub fn register(&mut self, name: &IdPat, lambda: &Exp) {
        let Exp::Fn { param, body } = lambda else {
            return;
        };
        let (formal, body) = unwrap_param_case(param, body);
        let info = self.classify(name, formal, body);
        debug!(
            function = %name,
            status = ?info.status,
            "function classified"
        );
        let info = Arc::new(info);
        self.by_id.insert(name.clone(), Arc::clone(&info));
        self.by_name.insert(name.name.clone(), info);
    }

    /// Lookup by id-pattern identity, falling back to name
    pub fn lookup(&self, id: &IdPat) -> Option<Arc<FunctionInfo>> {
        self.by_id
            .get(id)
            .cloned()
            .or_else(|| self.lookup_by_name(&id.name))
    }

    /// Lookup by name only
    pub fn lookup_by_name(&self, name: &str) -> Option<Arc<FunctionInfo>> {
        self.by_name.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    fn classify(&self, name: &IdPat, formal: Pat, body: &Exp) -> FunctionInfo {
        let can_generate: Vec<IdPat> = formal.expand().into_iter().cloned().collect();

        // arg elem c
        if let Some(base) = as_formal_membership(body, &formal) {
            return FunctionInfo {
                status: FnStatus::Invertible,
                formal,
                base: Some(base.clone()),
                step: None,
                can_generate,
                required_filters: Vec::new(),
            };
        }

        // arg elem c andalso filters
        let conjuncts = body.conjuncts();
        if conjuncts.len() > 1 {
            let mut base = None;
            let mut filters = Vec::new();
            for c in &conjuncts {
                match as_formal_membership(c, &formal) {
                    Some(b) if base.is_none() => base = Some(b.clone()),
                    _ => filters.push((*c).clone()),
                }
            }
            if let Some(base) = base {
                return FunctionInfo {
                    status: FnStatus::PartiallyInvertible,
                    formal,
                    base: Some(base),
                    step: None,
                    can_generate,
                    required_filters: filters,
                };
            }
        }

        // base orelse recursive
        if let Some((BuiltIn::OrElse, a, b)) = body.as_apply2() {
            let (base_case, recursive) = if contains_call_to(b, &name.name) {
                (a, b)
            } else if contains_call_to(a, &name.name) {
                (b, a)
            } else {
                return self.not_invertible(formal, can_generate);
            };
            if self.reduces_to_invertible(base_case, &formal) {
                return FunctionInfo {
                    status: FnStatus::Recursive,
                    formal,
                    base: Some(base_case.clone()),
                    step: Some(recursive.clone()),
                    can_generate,
                    required_filters: Vec::new(),
                };
            }
        }

        self.not_invertible(formal, can_generate)
    }

    fn not_invertible(&self, formal: Pat, can_generate: Vec<IdPat>) -> FunctionInfo {
        FunctionInfo {
            status: FnStatus::NotInvertible,
            formal,
            base: None,
            step: None,
            can_generate,
            required_filters: Vec::new(),
        }
    }

    /// A base case reduces when it is itself `arg elem c`, or a call to a
    /// function already registered as (partially) invertible.
    fn reduces_to_invertible(&self, base: &Exp, formal: &Pat) -> bool {
        if as_formal_membership(base, formal).is_some() {
            return true;
        }
        if let Exp::Apply { func, .. } = base {
            if let Exp::Id(f) = func.as_ref() {
                if let Some(info) = self.lookup(f) {
                    return matches!(
                        info.status,
                        FnStatus::Invertible | FnStatus::PartiallyInvertible
                    );
                }
            }
        }
        false
    }
}

/// Unwrap `fn p => case p of pat => body` into `(pat, body)`, recovering
/// tuple destructuring of the formal parameter.
fn unwrap_param_case<'a>(param: &'a Pat, body: &'a Exp) -> (Pat, &'a Exp) {
    if let (Pat::Id(p), Exp::Case { input, arms, .. }) = (param, body) {
        if let Exp::Id(scrutinee) = input.as_ref() {
            if scrutinee == p && arms.len() == 1 {
                return (arms[0].0.clone(), &arms[0].1);
            }
        }
    }
    (param.clone(), body)
}

/// Match `arg elem c` where `arg` mirrors the formal parameter shape and `c`
/// does not mention the parameter. Returns the collection.
fn as_formal_membership<'a>(exp: &'a Exp, formal: &Pat) -> Option<&'a Exp> {
    let (BuiltIn::Elem, arg, collection) = exp.as_apply2()? else {
        return None;
    };
    if !arg_matches_formal(arg, formal) {
        return None;
    }
    let leaves = formal.expand();
    if collection
        .free_vars()
        .iter()
        .any(|v| leaves.iter().any(|l| *l == v))
    {
        return None;
    }
    Some(collection)
}

/// True when the argument expression is exactly the formal parameter: the
/// parameter id itself, or the tuple of its destructured ids in order.
fn arg_matches_formal(arg: &Exp, formal: &Pat) -> bool {
    match (arg, formal) {
        (Exp::Id(id), Pat::Id(p)) => id == p,
        (Exp::Tuple(es), Pat::Tuple(ps)) if es.len() == ps.len() => es
            .iter()
            .zip(ps.iter())
            .all(|(e, p)| matches!((e, p), (Exp::Id(id), Pat::Id(pid)) if id == pid)),
        _ => false,
    }
}

/// True when `exp` contains a call to a function with the given name
pub fn contains_call_to(exp: &Exp, name: &str) -> bool {
    struct Finder<'a> {
        name: &'a str,
        found: bool,
    }
    impl Walk for Finder<'_> {
        fn visit_exp(&mut self, exp: &Exp) {
            if self.found {
                return;
            }
            if let Exp::Apply { func, .. } = exp {
                if matches!(func.as_ref(), Exp::Id(id) if id.name == self.name) {
                    self.found = true;
                    return;
                }
            }
            walk_exp(self, exp);
        }
    }
    let mut finder = Finder { name, found: false };
    finder.visit_exp(exp);
    finder.found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Type;

    fn pair_ty() -> Type {
        Type::Tuple(vec![Type::Int, Type::Int])
    }

    fn edges_id() -> IdPat {
        IdPat::new("edges", 100, Type::bag(pair_ty()))
    }

    /// `fun edge p = p elem edges`
    fn edge_lambda() -> Exp {
        let p = IdPat::new("p", 0, pair_ty());
        Exp::Fn {
            param: Pat::Id(p.clone()),
            body: Box::new(Exp::call2(BuiltIn::Elem, Exp::id(&p), Exp::id(&edges_id()))),
        }
    }

    #[test]
    fn test_invertible_membership() {
        let mut reg = FunctionRegistry::new();
        let edge = IdPat::new("edge", 1, Type::func(pair_ty(), Type::Bool));
        reg.register(&edge, &edge_lambda());

        let info = reg.lookup(&edge).expect("registered");
        assert_eq!(info.status, FnStatus::Invertible);
        assert_eq!(info.base, Some(Exp::id(&edges_id())));
    }

    #[test]
    fn test_tuple_destructuring_unwrapped() {
        // fun edge p = case p of (x, y) => (x, y) elem edges
        let p = IdPat::new("p", 0, pair_ty());
        let x = IdPat::new("x", 1, Type::Int);
        let y = IdPat::new("y", 2, Type::Int);
        let arm_pat = Pat::Tuple(vec![Pat::Id(x.clone()), Pat::Id(y.clone())]);
        let arm_body = Exp::call2(
            BuiltIn::Elem,
            Exp::Tuple(vec![Exp::id(&x), Exp::id(&y)]),
            Exp::id(&edges_id()),
        );
        let lambda = Exp::Fn {
            param: Pat::Id(p.clone()),
            body: Box::new(Exp::Case {
                input: Box::new(Exp::id(&p)),
                arms: vec![(arm_pat.clone(), arm_body)],
                ty: Type::Bool,
            }),
        };
        let mut reg = FunctionRegistry::new();
        let edge = IdPat::new("edge", 3, Type::func(pair_ty(), Type::Bool));
        reg.register(&edge, &lambda);

        let info = reg.lookup(&edge).expect("registered");
        assert_eq!(info.status, FnStatus::Invertible);
        assert_eq!(info.formal, arm_pat);
        assert_eq!(info.can_generate, vec![x, y]);
    }

    #[test]
    fn test_partially_invertible() {
        // fun bigEdge p = p elem edges andalso #1 p > 10
        let p = IdPat::new("p", 0, pair_ty());
        let filter = Exp::call2(
            BuiltIn::OpGt,
            Exp::select(0, Exp::id(&p)),
            Exp::int(10),
        );
        let lambda = Exp::Fn {
            param: Pat::Id(p.clone()),
            body: Box::new(Exp::and(
                Exp::call2(BuiltIn::Elem, Exp::id(&p), Exp::id(&edges_id())),
                filter.clone(),
            )),
        };
        let mut reg = FunctionRegistry::new();
        let big = IdPat::new("bigEdge", 1, Type::func(pair_ty(), Type::Bool));
        reg.register(&big, &lambda);

        let info = reg.lookup(&big).expect("registered");
        assert_eq!(info.status, FnStatus::PartiallyInvertible);
        assert_eq!(info.required_filters, vec![filter]);
    }

    #[test]
    fn test_recursive_classification() {
        let mut reg = FunctionRegistry::new();
        let edge = IdPat::new("edge", 1, Type::func(pair_ty(), Type::Bool));
        reg.register(&edge, &edge_lambda());

        // fun path p = edge p orelse <something calling path>
        let p = IdPat::new("p", 10, pair_ty());
        let base = Exp::Apply {
            func: Box::new(Exp::id(&edge)),
            arg: Box::new(Exp::id(&p)),
            ty: Type::Bool,
        };
        let path = IdPat::new("path", 11, Type::func(pair_ty(), Type::Bool));
        let recursive = Exp::Apply {
            func: Box::new(Exp::id(&path)),
            arg: Box::new(Exp::id(&p)),
            ty: Type::Bool,
        };
        let lambda = Exp::Fn {
            param: Pat::Id(p),
            body: Box::new(Exp::or(base.clone(), recursive.clone())),
        };
        reg.register(&path, &lambda);

        let info = reg.lookup(&path).expect("registered");
        assert_eq!(info.status, FnStatus::Recursive);
        assert_eq!(info.base, Some(base));
        assert_eq!(info.step, Some(recursive));
    }

    #[test]
    fn test_not_invertible() {
        // fun odd x = x > 0
        let x = IdPat::new("x", 0, Type::Int);
        let lambda = Exp::Fn {
            param: Pat::Id(x.clone()),
            body: Box::new(Exp::call2(BuiltIn::OpGt, Exp::id(&x), Exp::int(0))),
        };
        let mut reg = FunctionRegistry::new();
        let odd = IdPat::new("odd", 1, Type::func(Type::Int, Type::Bool));
        reg.register(&odd, &lambda);
        assert_eq!(
            reg.lookup(&odd).expect("registered").status,
            FnStatus::NotInvertible
        );
    }

    #[test]
    fn test_lookup_by_name_fallback() {
        let mut reg = FunctionRegistry::new();
        let edge = IdPat::new("edge", 1, Type::func(pair_ty(), Type::Bool));
        reg.register(&edge, &edge_lambda());

        // a different ordinal for the same name still resolves
        let other_scope = IdPat::new("edge", 99, Type::func(pair_ty(), Type::Bool));
        assert!(reg.lookup(&other_scope).is_some());
        assert_eq!(
            reg.lookup(&edge).expect("by id").as_ref(),
            reg.lookup_by_name("edge").expect("by name").as_ref()
        );
    }

    #[test]
    fn test_collection_mentioning_param_not_invertible() {
        // fun weird p = p elem (something-depending-on-p)  -- not a generator
        let p = IdPat::new("p", 0, Type::Int);
        let dependent = Exp::list_of(Type::Int, vec![Exp::id(&p)]);
        let lambda = Exp::Fn {
            param: Pat::Id(p.clone()),
            body: Box::new(Exp::call2(BuiltIn::Elem, Exp::id(&p), dependent)),
        };
        let mut reg = FunctionRegistry::new();
        let weird = IdPat::new("weird", 1, Type::func(Type::Int, Type::Bool));
        reg.register(&weird, &lambda);
        assert_eq!(
            reg.lookup(&weird).expect("registered").status,
            FnStatus::NotInvertible
        );
    }
}
