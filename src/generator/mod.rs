//! # Generators
//!
//! A generator is the central entity of the grounding pipeline: an expression
//! that enumerates the extent of a goal pattern, together with a cardinality,
//! the predicates the emitted values are known to satisfy, and the free
//! variables the expression depends on (used for topological scan ordering).
//!
//! The algebra builds generators from points, integer ranges, collections,
//! bounded extents, unions, and tuple-slot projections of a parent generator.
//! Generators are replaced, never mutated: the improvement loop swaps in a
//! better generator whenever inversion finds one with lower cardinality.

use crate::error::{GroundError, GroundResult};
use crate::ir::{BuiltIn, Exp, IdPat, NameGen, Pat};
use crate::range_set::RangeSet;
use crate::types::Type;

/// How many values a generator can emit.
///
/// Ordered: `Single < Finite < Infinite`; the improvement loop keeps the
/// minimum. `Infinite` generators appear transiently during analysis but
/// never survive into a rewritten query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Cardinality {
    Single,
    Finite,
    Infinite,
}

/// A generator for a goal pattern
#[derive(Debug, Clone, PartialEq)]
pub struct Generator {
    /// The pattern the generator binds
    pub pat: Pat,
    /// Evaluates to a list or bag whose element type matches `pat`
    pub exp: Exp,
    pub cardinality: Cardinality,
    /// Predicates the emitted values are known to satisfy; the simplify hook
    /// uses them to drop redundant filters
    pub constraints: Vec<Exp>,
    /// Variables referenced by `exp`
    pub free_vars: Vec<IdPat>,
}

impl Generator {
    /// Single-value generator `{| v |}`
    pub fn point(pat: Pat, value: Exp) -> Generator {
        let free_vars = value.free_vars();
        let exp = Exp::bag_of(pat.ty(), vec![value]);
        Generator {
            pat,
            exp,
            cardinality: Cardinality::Single,
            constraints: Vec::new(),
            free_vars,
        }
    }

    /// Integer range generator `tabulate (hi' - lo' + 1, fn k => lo' + k)`.
    ///
    /// Strict bounds are tightened by one. An inverted range produces
    /// `tabulate (0, ..)`: an empty collection, not an error.
    pub fn range(
        pat: Pat,
        lo: i64,
        lo_strict: bool,
        hi: i64,
        hi_strict: bool,
        names: &mut NameGen,
    ) -> Generator {
        let lo = if lo_strict { lo + 1 } else { lo };
        let hi = if hi_strict { hi - 1 } else { hi };
        let count = (hi - lo + 1).max(0);
        let k = names.fresh("k", Type::Int);
        let step = Exp::Fn {
            param: Pat::Id(k.clone()),
            body: Box::new(Exp::call2(BuiltIn::OpPlus, Exp::int(lo), Exp::id(&k))),
        };
        let exp = Exp::call2(BuiltIn::ListTabulate, Exp::int(count), step);
        Generator {
            pat,
            exp,
            cardinality: Cardinality::Finite,
            constraints: Vec::new(),
            free_vars: Vec::new(),
        }
    }

    /// Range generator with expression bounds.
    ///
    /// Constant int bounds fold to the literal form; otherwise the tabulate
    /// count stays symbolic: `tabulate (hi' - lo' + 1, fn k => lo' + k)`.
    pub fn range_from_exps(
        pat: Pat,
        lo: Exp,
        lo_strict: bool,
        hi: Exp,
        hi_strict: bool,
        names: &mut NameGen,
    ) -> Generator {
        use crate::ir::Literal;
        if let (Exp::Literal(Literal::Int(a)), Exp::Literal(Literal::Int(b))) = (&lo, &hi) {
            return Generator::range(pat, *a, lo_strict, *b, hi_strict, names);
        }
        let lo = if lo_strict {
            Exp::call2(BuiltIn::OpPlus, lo, Exp::int(1))
        } else {
            lo
        };
        let hi = if hi_strict {
            Exp::call2(BuiltIn::OpMinus, hi, Exp::int(1))
        } else {
            hi
        };
        let count = Exp::call2(
            BuiltIn::OpPlus,
            Exp::call2(BuiltIn::OpMinus, hi, lo.clone()),
            Exp::int(1),
        );
        let k = names.fresh("k", Type::Int);
        let step = Exp::Fn {
            param: Pat::Id(k.clone()),
            body: Box::new(Exp::call2(BuiltIn::OpPlus, lo, Exp::id(&k))),
        };
        let exp = Exp::call2(BuiltIn::ListTabulate, count, step);
        let free_vars = exp.free_vars();
        Generator {
            pat,
            exp,
            cardinality: Cardinality::Finite,
            constraints: Vec::new(),
            free_vars,
        }
    }

    /// Generator ranging over an existing finite collection
    pub fn collection(pat: Pat, exp: Exp) -> GroundResult<Generator> {
        let element = exp.ty().element_type().cloned().ok_or_else(|| {
            GroundError::TypeMismatch(format!(
                "generator expression has non-collection type {}",
                exp.ty()
            ))
        })?;
        if element != pat.ty() {
            return Err(GroundError::TypeMismatch(format!(
                "collection of {} cannot generate pattern '{}' of type {}",
                element,
                pat,
                pat.ty()
            )));
        }
        let free_vars = exp.free_vars();
        Ok(Generator {
            pat,
            exp,
            cardinality: Cardinality::Finite,
            constraints: Vec::new(),
            free_vars,
        })
    }

    /// Universal extent of the pattern's type, bounded by a range set.
    ///
    /// INFINITE when the type is infinite and the range set unbounded,
    /// FINITE otherwise. A bounded single int range lowers to a tabulate
    /// so downstream needs no special extent support.
    pub fn extent(pat: Pat, ranges: RangeSet, names: &mut NameGen) -> Generator {
        let ty = pat.ty();
        if ty == Type::Int {
            if ranges.is_empty() {
                // contradictory bounds: a zero-count tabulate, not an error
                return Generator::range(pat, 1, false, 0, false, names);
            }
            if let Some((lo, hi)) = ranges.single_int_bounds() {
                return Generator::range(pat, lo, false, hi, false, names);
            }
        }
        if ranges.is_empty() {
            return Generator {
                exp: Exp::bag_of(ty.clone(), Vec::new()),
                pat,
                cardinality: Cardinality::Finite,
                constraints: Vec::new(),
                free_vars: Vec::new(),
            };
        }
        let cardinality = if ty.is_finite() || ranges.is_bounded() {
            Cardinality::Finite
        } else {
            Cardinality::Infinite
        };
        Generator {
            exp: Exp::Extent {
                element_ty: ty,
                ranges,
            },
            pat,
            cardinality,
            constraints: Vec::new(),
            free_vars: Vec::new(),
        }
    }

    /// Union of generators for the same pattern; cardinality is the maximum
    /// of the children.
    pub fn union(gens: Vec<Generator>) -> GroundResult<Generator> {
        let mut iter = gens.into_iter();
        let first = iter.next().ok_or_else(|| {
            GroundError::Internal("union of zero generators".to_string())
        })?;
        let mut exp = first.exp;
        let mut cardinality = first.cardinality;
        let mut free_vars = first.free_vars;
        let mut all_lists = matches!(exp.ty(), Type::List(_));
        let mut rest = Vec::new();
        for g in iter {
            if g.pat.ty() != first.pat.ty() {
                return Err(GroundError::TypeMismatch(format!(
                    "union of generators for {} and {}",
                    first.pat.ty(),
                    g.pat.ty()
                )));
            }
            all_lists = all_lists && matches!(g.exp.ty(), Type::List(_));
            cardinality = cardinality.max(g.cardinality);
            for v in g.free_vars {
                if !free_vars.contains(&v) {
                    free_vars.push(v);
                }
            }
            rest.push(g.exp);
        }
        let op = if all_lists {
            BuiltIn::ListConcat
        } else {
            BuiltIn::BagConcat
        };
        for e in rest {
            exp = Exp::call2(op, exp, e);
        }
        Ok(Generator {
            pat: first.pat,
            exp,
            cardinality,
            constraints: Vec::new(),
            free_vars,
        })
    }

    /// Generator for one tuple slot of a parent generator's value: pattern
    /// `pat` bound to `#slot parent`. Used to split `(x, y) elem edges` into
    /// a parent scan over `edges` and per-slot bindings.
    pub fn subgenerator(parent: &IdPat, slot: usize, pat: Pat) -> Generator {
        Generator::point(pat, Exp::select(slot, Exp::id(parent)))
    }

    /// Record an absorbed predicate
    pub fn with_constraint(mut self, constraint: Exp) -> Generator {
        self.constraints.push(constraint);
        self
    }

    pub fn is_finite(&self) -> bool {
        self.cardinality < Cardinality::Infinite
    }

    /// Rewrite a predicate, dropping the conjuncts this generator inherently
    /// enforces. Returns literal `true` when everything is absorbed.
    pub fn simplify(&self, pred: &Exp) -> Exp {
        let residual: Vec<Exp> = pred
            .conjuncts()
            .into_iter()
            .filter(|c| !self.constraints.contains(c))
            .cloned()
            .collect();
        Exp::and_all(residual)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Literal;

    fn int_id(name: &str, ordinal: u32) -> IdPat {
        IdPat::new(name, ordinal, Type::Int)
    }

    #[test]
    fn test_cardinality_order() {
        assert!(Cardinality::Single < Cardinality::Finite);
        assert!(Cardinality::Finite < Cardinality::Infinite);
    }

    #[test]
    fn test_point_generator() {
        let x = int_id("x", 0);
        let g = Generator::point(Pat::Id(x), Exp::int(7));
        assert_eq!(g.cardinality, Cardinality::Single);
        assert_eq!(g.exp.ty(), Type::bag(Type::Int));
    }

    #[test]
    fn test_range_generator_counts() {
        let mut names = NameGen::default();
        // x > 2 andalso x < 7 -> tabulate (4, fn k => 3 + k)
        let g = Generator::range(Pat::Id(int_id("x", 0)), 2, true, 7, true, &mut names);
        assert_eq!(g.cardinality, Cardinality::Finite);
        let (op, count, _) = g.exp.as_apply2().expect("tabulate call");
        assert_eq!(op, BuiltIn::ListTabulate);
        assert_eq!(count, &Exp::int(4));
    }

    #[test]
    fn test_empty_range_is_not_an_error() {
        let mut names = NameGen::default();
        // a >= b: empty range, zero-count tabulate
        let g = Generator::range(Pat::Id(int_id("x", 0)), 9, true, 3, true, &mut names);
        let (_, count, _) = g.exp.as_apply2().expect("tabulate call");
        assert_eq!(count, &Exp::int(0));
    }

    #[test]
    fn test_collection_type_check() {
        let x = int_id("x", 0);
        let good = Exp::list_of(Type::Int, vec![Exp::int(1)]);
        assert!(Generator::collection(Pat::Id(x.clone()), good).is_ok());

        let bad = Exp::list_of(Type::Bool, vec![Exp::bool(true)]);
        assert!(Generator::collection(Pat::Id(x), bad).is_err());
    }

    #[test]
    fn test_extent_cardinality() {
        let mut names = NameGen::default();
        let inf = Generator::extent(Pat::Id(int_id("x", 0)), RangeSet::full(), &mut names);
        assert_eq!(inf.cardinality, Cardinality::Infinite);

        let b = IdPat::new("b", 1, Type::Bool);
        let fin = Generator::extent(Pat::Id(b), RangeSet::full(), &mut names);
        assert_eq!(fin.cardinality, Cardinality::Finite);
    }

    #[test]
    fn test_bounded_int_extent_lowers_to_range() {
        let mut names = NameGen::default();
        let ranges = RangeSet::at_least(Literal::Int(2), true)
            .intersect(&RangeSet::at_most(Literal::Int(7), true));
        let g = Generator::extent(Pat::Id(int_id("x", 0)), ranges, &mut names);
        assert_eq!(g.cardinality, Cardinality::Finite);
        let (op, count, _) = g.exp.as_apply2().expect("tabulate call");
        assert_eq!(op, BuiltIn::ListTabulate);
        assert_eq!(count, &Exp::int(4));
    }

    #[test]
    fn test_union_takes_max_cardinality() {
        let mut names = NameGen::default();
        let x = int_id("x", 0);
        let a = Generator::point(Pat::Id(x.clone()), Exp::int(1));
        let b = Generator::extent(Pat::Id(x.clone()), RangeSet::full(), &mut names);
        let u = Generator::union(vec![a, b]).expect("union");
        assert_eq!(u.cardinality, Cardinality::Infinite);
    }

    #[test]
    fn test_subgenerator_depends_on_parent() {
        let pair = IdPat::new(
            "r",
            9,
            Type::Tuple(vec![Type::Int, Type::Int]),
        );
        let x = int_id("x", 0);
        let g = Generator::subgenerator(&pair, 0, Pat::Id(x));
        assert_eq!(g.cardinality, Cardinality::Single);
        assert_eq!(g.free_vars, vec![pair]);
    }

    #[test]
    fn test_simplify_drops_absorbed_constraints() {
        let x = int_id("x", 0);
        let eq = Exp::call2(BuiltIn::OpEq, Exp::id(&x), Exp::int(7));
        let other = Exp::call2(BuiltIn::OpLt, Exp::id(&x), Exp::int(9));
        let g = Generator::point(Pat::Id(x), Exp::int(7)).with_constraint(eq.clone());

        assert!(g.simplify(&eq).is_literal_true());
        let residual = g.simplify(&Exp::and(eq, other.clone()));
        assert_eq!(residual, other);
    }
}
