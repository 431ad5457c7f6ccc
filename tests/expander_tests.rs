//! Invariant and boundary tests for the query expander.

use groundlog::{
    BuiltIn, Exp, FromExp, FunctionRegistry, IdPat, NameGen, Pat, QueryExpander, Step, Type,
};
use std::collections::HashSet;

fn int_id(name: &str, ordinal: u32) -> IdPat {
    IdPat::new(name, ordinal, Type::Int)
}

fn expand(from: FromExp) -> FromExp {
    let registry = FunctionRegistry::new();
    let mut names = NameGen::starting_at(10_000);
    QueryExpander::new(&registry, &mut names, 3)
        .expand(&from)
        .expect("grounds")
}

fn unbounded_scan(pat: Pat) -> Step {
    let ty = pat.ty();
    Step::Scan {
        pat,
        exp: Exp::extent(ty),
        condition: None,
    }
}

/// Every scan in an output must have a collection-typed expression whose
/// element type matches the scan pattern, and no scan may be an infinite
/// extent.
fn assert_well_formed(from: &FromExp) {
    let mut bound: HashSet<IdPat> = HashSet::new();
    for step in &from.steps {
        if let Step::Scan { pat, exp, .. } = step {
            assert!(
                !exp.is_infinite_extent(),
                "output scan still ranges over an infinite extent: {exp}"
            );
            let element = exp
                .ty()
                .element_type()
                .unwrap_or_else(|| panic!("scan expression is not a collection: {exp}"))
                .clone();
            assert_eq!(element, pat.ty(), "scan element type mismatch for {pat}");
            // free-variable order: everything the scan expression references
            // from this query must already be bound
            for v in exp.free_vars() {
                let is_local = from.steps.iter().any(|s| {
                    matches!(s, Step::Scan { pat: p, .. } if p.binds(&v))
                });
                if is_local {
                    assert!(
                        bound.contains(&v),
                        "scan of {pat} references '{v}' before it is bound"
                    );
                }
            }
            bound.extend(pat.expand().into_iter().cloned());
        }
    }
}

#[test]
fn test_output_well_formed_membership() {
    let x = int_id("x", 0);
    let out = expand(FromExp {
        steps: vec![
            unbounded_scan(Pat::Id(x.clone())),
            Step::Where(Exp::call2(
                BuiltIn::Elem,
                Exp::id(&x),
                Exp::list_of(Type::Int, vec![Exp::int(1), Exp::int(2)]),
            )),
        ],
        ty: Type::bag(Type::Int),
    });
    assert_well_formed(&out);
}

#[test]
fn test_output_well_formed_dependent_definitions() {
    // y depends on x; z depends on y
    let x = int_id("x", 0);
    let y = int_id("y", 1);
    let z = int_id("z", 2);
    let out = expand(FromExp {
        steps: vec![
            unbounded_scan(Pat::Id(z.clone())),
            unbounded_scan(Pat::Id(y.clone())),
            unbounded_scan(Pat::Id(x.clone())),
            Step::Where(Exp::and(
                Exp::and(
                    Exp::call2(
                        BuiltIn::OpEq,
                        Exp::id(&z),
                        Exp::call2(BuiltIn::OpPlus, Exp::id(&y), Exp::int(1)),
                    ),
                    Exp::call2(
                        BuiltIn::OpEq,
                        Exp::id(&y),
                        Exp::call2(BuiltIn::OpPlus, Exp::id(&x), Exp::int(1)),
                    ),
                ),
                Exp::call2(
                    BuiltIn::Elem,
                    Exp::id(&x),
                    Exp::list_of(Type::Int, vec![Exp::int(1)]),
                ),
            )),
        ],
        ty: Type::bag(Type::record(
            vec![
                ("x".to_string(), Type::Int),
                ("y".to_string(), Type::Int),
                ("z".to_string(), Type::Int),
            ],
            false,
        )),
    });
    assert_well_formed(&out);
}

#[test]
fn test_idempotence() {
    let x = int_id("x", 0);
    let y = int_id("y", 1);
    let pair = Type::Tuple(vec![Type::Int, Type::Int]);
    let from = FromExp {
        steps: vec![
            Step::Scan {
                pat: Pat::Tuple(vec![Pat::Id(x.clone()), Pat::Id(y.clone())]),
                exp: Exp::extent(pair.clone()),
                condition: None,
            },
            Step::Where(Exp::call2(
                BuiltIn::Elem,
                Exp::Tuple(vec![Exp::id(&x), Exp::id(&y)]),
                Exp::list_of(pair, vec![Exp::Tuple(vec![Exp::int(1), Exp::int(2)])]),
            )),
        ],
        ty: Type::bag(Type::Tuple(vec![Type::Int, Type::Int])),
    };

    let once = expand(from);
    assert_well_formed(&once);
    let twice = expand(once.clone());
    assert_eq!(once, twice);
}

#[test]
fn test_boundary_empty_collection() {
    // where x elem {||}: FINITE generator with zero results, no error
    let x = int_id("x", 0);
    let out = expand(FromExp {
        steps: vec![
            unbounded_scan(Pat::Id(x.clone())),
            Step::Where(Exp::call2(
                BuiltIn::Elem,
                Exp::id(&x),
                Exp::bag_of(Type::Int, vec![]),
            )),
        ],
        ty: Type::bag(Type::Int),
    });
    assert_well_formed(&out);
    let Step::Scan { exp, .. } = &out.steps[0] else {
        panic!("expected a scan");
    };
    assert_eq!(exp.as_collection_literal(), Some(&[][..]));
}

#[test]
fn test_boundary_repeated_variable_membership() {
    // from z where (z, z) elem c: only tuples with equal components
    let z = int_id("z", 0);
    let pair = Type::Tuple(vec![Type::Int, Type::Int]);
    let coll = Exp::list_of(
        pair,
        vec![
            Exp::Tuple(vec![Exp::int(1), Exp::int(1)]),
            Exp::Tuple(vec![Exp::int(1), Exp::int(2)]),
        ],
    );
    let out = expand(FromExp {
        steps: vec![
            unbounded_scan(Pat::Id(z.clone())),
            Step::Where(Exp::call2(
                BuiltIn::Elem,
                Exp::Tuple(vec![Exp::id(&z), Exp::id(&z)]),
                coll,
            )),
        ],
        ty: Type::bag(Type::Int),
    });
    assert_well_formed(&out);
    // z's generator is a projection with the equality filter inside
    let Step::Scan { exp, .. } = &out.steps[0] else {
        panic!("expected a scan");
    };
    let Exp::From(projection) = exp else {
        panic!("expected a projection query, got {exp}");
    };
    assert!(projection
        .steps
        .iter()
        .any(|s| matches!(s, Step::Where(e) if matches!(e.as_apply2(), Some((BuiltIn::OpEq, _, _))))));
}

#[test]
fn test_boundary_contradictory_range() {
    // x > 9 andalso x < 3: empty range, empty result, no error
    let x = int_id("x", 0);
    let out = expand(FromExp {
        steps: vec![
            unbounded_scan(Pat::Id(x.clone())),
            Step::Where(Exp::and(
                Exp::call2(BuiltIn::OpGt, Exp::id(&x), Exp::int(9)),
                Exp::call2(BuiltIn::OpLt, Exp::id(&x), Exp::int(3)),
            )),
        ],
        ty: Type::bag(Type::Int),
    });
    assert_well_formed(&out);
    let Step::Scan { exp, .. } = &out.steps[0] else {
        panic!("expected a scan");
    };
    let (op, count, _) = exp.as_apply2().expect("tabulate");
    assert_eq!(op, BuiltIn::ListTabulate);
    assert_eq!(count, &Exp::int(0));
}

#[test]
fn test_finite_type_extent_is_not_ungrounded() {
    // a bool variable has a finite universal extent even with no predicate
    let b = IdPat::new("b", 0, Type::Bool);
    let out = expand(FromExp {
        steps: vec![unbounded_scan(Pat::Id(b))],
        ty: Type::bag(Type::Bool),
    });
    assert_well_formed(&out);
}

#[test]
fn test_registry_lookup_consistency() {
    // lookup(id) and lookup_by_name agree while one function is in scope
    let pair = Type::Tuple(vec![Type::Int, Type::Int]);
    let edges = IdPat::new("edges", 100, Type::bag(pair.clone()));
    let q = IdPat::new("q", 50, pair.clone());
    let edge = IdPat::new("edge", 51, Type::func(pair, Type::Bool));
    let mut registry = FunctionRegistry::new();
    registry.register(
        &edge,
        &Exp::Fn {
            param: Pat::Id(q.clone()),
            body: Box::new(Exp::call2(BuiltIn::Elem, Exp::id(&q), Exp::id(&edges))),
        },
    );
    let by_id = registry.lookup(&edge).expect("by id");
    let by_name = registry.lookup_by_name("edge").expect("by name");
    assert_eq!(by_id.as_ref(), by_name.as_ref());
}
