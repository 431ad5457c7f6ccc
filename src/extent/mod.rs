//! # Extent Analyzer
//!
//! Given a scanned pattern and the `where` predicates that follow it, build a
//! map from each leaf pattern to its candidate (extent, filter) pairs, plus
//! the definitions (`x = e`) that can supersede a weaker extent.
//!
//! The predicate walk combines candidates under the boolean structure:
//!
//! - `p andalso q`: concatenate both sides' pair lists; the reduction step
//!   later intersects range-set extents and ANDs filters.
//! - `p orelse q`: reduce each side to one pair, then union the extents and
//!   OR the filters. A variable constrained on only one branch is effectively
//!   unconstrained.
//! - ordered comparisons against a literal: a range-set extent plus the
//!   comparison itself as the filter.
//! - `e elem c`: the collection is the extent. A tuple on the left
//!   introduces a fresh id for the collection element, per-slot equalities,
//!   and recurses.
//!
//! Extents are *supersets*: the filter expression restricts them back to the
//! exact predicate, so choosing a wider extent never loses soundness.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::trace;

use crate::ir::{BuiltIn, Exp, IdPat, Literal, NameGen, Pat};
use crate::range_set::RangeSet;
use crate::types::Type;

/// Output of extent analysis for one scan
#[derive(Debug, Default)]
pub struct ExtentAnalysis {
    /// Per leaf: candidate (extent expression, filter expression) pairs
    pub extents: HashMap<IdPat, Vec<(Exp, Exp)>>,
    /// Definitions `x = e` where `e` does not mention `x`; a definition
    /// supersedes a weaker extent for `x`
    pub definitions: HashMap<IdPat, Exp>,
    /// Definitions for single slots of a leaf: `#i x = e`
    pub slot_definitions: HashMap<IdPat, BTreeMap<usize, Exp>>,
    /// Auxiliary ids introduced for tuple memberships, with their leaves'
    /// binding equalities already folded into `extents` / `definitions`
    pub aux_ids: Vec<IdPat>,
    /// New predicates the rewrite must emit (slot equalities on auxiliary
    /// ids that did not become definitions)
    pub aux_filters: Vec<Exp>,
}

/// Analyze the predicates following a scan of `pat`. `bound` holds the
/// variables already bound by earlier steps (they are not analyzed).
pub fn analyze(
    pat: &Pat,
    predicates: &[Exp],
    bound: &HashSet<IdPat>,
    names: &mut NameGen,
) -> ExtentAnalysis {
    let goals: Vec<IdPat> = pat
        .expand()
        .into_iter()
        .filter(|leaf| !bound.contains(*leaf))
        .cloned()
        .collect();
    let mut analyzer = ExtentAnalyzer { goals, names };
    let mut analysis = ExtentAnalysis::default();
    for pred in predicates {
        analyzer.walk(&mut analysis, pred);
    }
    trace!(
        leaves = analysis.extents.len(),
        definitions = analysis.definitions.len(),
        "extent analysis complete"
    );
    analysis
}

struct ExtentAnalyzer<'a> {
    goals: Vec<IdPat>,
    names: &'a mut NameGen,
}

impl ExtentAnalyzer<'_> {
    fn walk(&mut self, analysis: &mut ExtentAnalysis, pred: &Exp) {
        let Some((op, a, b)) = pred.as_apply2() else {
            return;
        };
        match op {
            BuiltIn::AndAlso => {
                self.walk(analysis, a);
                self.walk(analysis, b);
            }
            BuiltIn::OrElse => self.walk_or(analysis, a, b),
            BuiltIn::Elem => self.walk_elem(analysis, pred, a, b),
            _ if op.is_comparison() => self.walk_comparison(analysis, pred, op, a, b),
            _ => {}
        }
    }

    /// Each side is analyzed separately; a leaf constrained on both sides
    /// gets the union of its reduced extents, with the filters ORed.
    fn walk_or(&mut self, analysis: &mut ExtentAnalysis, a: &Exp, b: &Exp) {
        let mut left = ExtentAnalysis::default();
        let mut right = ExtentAnalysis::default();
        self.walk(&mut left, a);
        self.walk(&mut right, b);

        // a definition is also a point extent for union purposes
        for side in [&mut left, &mut right] {
            let defs: Vec<(IdPat, Exp)> = side
                .definitions
                .iter()
                .map(|(id, e)| (id.clone(), e.clone()))
                .collect();
            for (id, e) in defs {
                let extent = Exp::bag_of(id.ty.clone(), vec![e.clone()]);
                let filter = Exp::call2(BuiltIn::OpEq, Exp::id(&id), e);
                side.extents.entry(id).or_default().push((extent, filter));
            }
        }

        for (id, left_pairs) in left.extents {
            let Some(right_pairs) = right.extents.get(&id) else {
                continue;
            };
            let Some(lr) = reduce_and(&left_pairs) else {
                continue;
            };
            let Some(rr) = reduce_and(right_pairs) else {
                continue;
            };
            let extent = union_extents(lr.extent.clone(), rr.extent.clone());
            // the union only enforces the ORed filters when each branch's
            // extent enforced its own; otherwise the original predicate must
            // survive as a where filter
            let filter = if lr.residual.is_empty() && rr.residual.is_empty() {
                Exp::or(lr.filter(), rr.filter())
            } else {
                Exp::bool(true)
            };
            analysis.extents.entry(id).or_default().push((extent, filter));
        }
    }

    fn walk_comparison(
        &mut self,
        analysis: &mut ExtentAnalysis,
        pred: &Exp,
        op: BuiltIn,
        a: &Exp,
        b: &Exp,
    ) {
        // normalize the goal variable onto the left
        let (op, id, other) = if let Exp::Id(id) = a {
            if !self.goals.contains(id) {
                return self.try_slot_definition(analysis, op, b, a);
            }
            (op, id.clone(), b)
        } else if let Exp::Id(id) = b {
            if !self.goals.contains(id) {
                return self.try_slot_definition(analysis, op, a, b);
            }
            let Some(rev) = op.reverse() else { return };
            (rev, id.clone(), a)
        } else {
            // #i x = e form
            if op == BuiltIn::OpEq {
                self.try_slot_definition(analysis, op, a, b);
                self.try_slot_definition(analysis, op, b, a);
            }
            return;
        };

        if let Exp::Literal(lit) = other {
            if id.ty.is_ordered() || op == BuiltIn::OpEq || op == BuiltIn::OpNe {
                let ranges = range_for(op, lit.clone());
                let extent = Exp::Extent {
                    element_ty: id.ty.clone(),
                    ranges,
                };
                analysis
                    .extents
                    .entry(id.clone())
                    .or_default()
                    .push((extent, pred.clone()));
            }
        }

        // x = e where e does not mention x: a definition, collected
        // separately so it can supersede a weaker extent
        if op == BuiltIn::OpEq && !other.free_vars().contains(&id) {
            analysis
                .definitions
                .entry(id)
                .or_insert_with(|| other.clone());
        }
    }

    /// `#i x = e` where `x` is a goal and `e` does not mention it
    fn try_slot_definition(
        &mut self,
        analysis: &mut ExtentAnalysis,
        op: BuiltIn,
        lhs: &Exp,
        rhs: &Exp,
    ) {
        if op != BuiltIn::OpEq {
            return;
        }
        let Exp::Select { slot, input } = lhs else {
            return;
        };
        let Exp::Id(id) = input.as_ref() else {
            return;
        };
        if !self.goals.contains(id) || rhs.free_vars().contains(id) {
            return;
        }
        analysis
            .slot_definitions
            .entry(id.clone())
            .or_default()
            .entry(*slot)
            .or_insert_with(|| rhs.clone());
    }

    fn walk_elem(&mut self, analysis: &mut ExtentAnalysis, pred: &Exp, left: &Exp, coll: &Exp) {
        if coll.free_vars().iter().any(|v| self.goals.contains(v)) {
            return;
        }
        match left {
            Exp::Id(id) if self.goals.contains(id) => {
                analysis
                    .extents
                    .entry(id.clone())
                    .or_default()
                    .push((coll.clone(), pred.clone()));
            }
            Exp::Tuple(items) => {
                // introduce a fresh id for the collection element, then
                // recurse on the per-slot equalities
                let Some(element) = coll.ty().element_type().cloned() else {
                    return;
                };
                if element.field_count() != items.len() {
                    return;
                }
                let r = self.names.fresh("r", element);
                self.goals.push(r.clone());
                analysis.aux_ids.push(r.clone());
                let r_elem = Exp::call2(BuiltIn::Elem, Exp::id(&r), coll.clone());
                // scanning r over the collection (with the slot bindings
                // below) enforces the original membership
                analysis
                    .extents
                    .entry(r.clone())
                    .or_default()
                    .push((coll.clone(), Exp::and(r_elem, pred.clone())));
                for (i, item) in items.iter().enumerate() {
                    let eq = Exp::call2(BuiltIn::OpEq, item.clone(), Exp::select(i, Exp::id(&r)));
                    let before = analysis.definitions.len();
                    self.walk(analysis, &eq);
                    if analysis.definitions.len() == before {
                        // not a definition: the slot constraint must survive
                        // as an explicit filter
                        analysis.aux_filters.push(eq);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Result of AND-reducing a candidate list to one extent
#[derive(Debug, Clone)]
pub struct Reduced {
    pub extent: Exp,
    /// Filters the chosen extent inherently enforces; safe to drop from the
    /// rewritten query
    pub enforced: Vec<Exp>,
    /// Filters the chosen extent does not enforce; they must survive as
    /// `where` predicates
    pub residual: Vec<Exp>,
}

impl Reduced {
    /// The full restriction, enforced and residual together
    pub fn filter(&self) -> Exp {
        Exp::and_all(
            self.enforced
                .iter()
                .chain(self.residual.iter())
                .cloned()
                .collect(),
        )
    }
}

/// AND-reduce a candidate list to a single extent.
///
/// Adjacent range-set extents intersect. Collection extents are left
/// untouched and the first one wins: a wider extent is sound because the
/// filters restrict it, but only the filters of the *chosen* extent are
/// enforced by it; everything else stays residual.
pub fn reduce_and(pairs: &[(Exp, Exp)]) -> Option<Reduced> {
    if pairs.is_empty() {
        return None;
    }
    let mut ranges: Option<(Type, RangeSet)> = None;
    let mut range_filters: Vec<Exp> = Vec::new();
    let mut collection: Option<(Exp, Exp)> = None;
    let mut other_filters: Vec<Exp> = Vec::new();
    for (extent, filter) in pairs {
        match extent {
            Exp::Extent {
                element_ty,
                ranges: r,
            } => {
                ranges = Some(match ranges {
                    Some((ty, acc)) => (ty, acc.intersect(r)),
                    None => (element_ty.clone(), r.clone()),
                });
                range_filters.push(filter.clone());
            }
            other => {
                if collection.is_none() {
                    collection = Some((other.clone(), filter.clone()));
                } else {
                    other_filters.push(filter.clone());
                }
            }
        }
    }
    match (collection, ranges) {
        (Some((extent, filter)), _) => {
            // the intersected range becomes a residual restriction
            let mut residual: Vec<Exp> = range_filters;
            residual.extend(other_filters);
            Some(Reduced {
                extent,
                enforced: filter.conjuncts().into_iter().cloned().collect(),
                residual,
            })
        }
        (None, Some((ty, ranges))) => Some(Reduced {
            extent: Exp::Extent {
                element_ty: ty,
                ranges,
            },
            enforced: range_filters
                .iter()
                .flat_map(|f| f.conjuncts().into_iter().cloned().collect::<Vec<_>>())
                .collect(),
            residual: other_filters,
        }),
        (None, None) => None,
    }
}

/// OR-combine two extents: range sets union; anything else concatenates.
pub fn union_extents(a: Exp, b: Exp) -> Exp {
    match (&a, &b) {
        (
            Exp::Extent {
                element_ty,
                ranges: ra,
            },
            Exp::Extent { ranges: rb, .. },
        ) => Exp::Extent {
            element_ty: element_ty.clone(),
            ranges: ra.union(rb),
        },
        _ => {
            let op = if matches!(a.ty(), Type::List(_)) && matches!(b.ty(), Type::List(_)) {
                BuiltIn::ListConcat
            } else {
                BuiltIn::BagConcat
            };
            Exp::call2(op, a, b)
        }
    }
}

/// Range set for a comparison against a literal
fn range_for(op: BuiltIn, lit: Literal) -> RangeSet {
    match op {
        BuiltIn::OpEq => RangeSet::point(lit),
        BuiltIn::OpNe => RangeSet::except(lit),
        BuiltIn::OpGt => RangeSet::at_least(lit, true),
        BuiltIn::OpGe => RangeSet::at_least(lit, false),
        BuiltIn::OpLt => RangeSet::at_most(lit, true),
        BuiltIn::OpLe => RangeSet::at_most(lit, false),
        _ => RangeSet::full(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_id(name: &str, ordinal: u32) -> IdPat {
        IdPat::new(name, ordinal, Type::Int)
    }

    fn analyze_one(pat: &Pat, preds: &[Exp]) -> ExtentAnalysis {
        let mut names = NameGen::starting_at(1000);
        analyze(pat, preds, &HashSet::new(), &mut names)
    }

    #[test]
    fn test_comparison_yields_range_extent() {
        let x = int_id("x", 0);
        let pred = Exp::call2(BuiltIn::OpGt, Exp::id(&x), Exp::int(5));
        let analysis = analyze_one(&Pat::Id(x.clone()), &[pred.clone()]);

        let pairs = &analysis.extents[&x];
        assert_eq!(pairs.len(), 1);
        let Exp::Extent { ranges, .. } = &pairs[0].0 else {
            panic!("expected range extent");
        };
        assert!(!ranges.is_bounded());
        assert_eq!(pairs[0].1, pred);
    }

    #[test]
    fn test_swapped_comparison_normalized() {
        // 5 < x is x > 5
        let x = int_id("x", 0);
        let pred = Exp::call2(BuiltIn::OpLt, Exp::int(5), Exp::id(&x));
        let analysis = analyze_one(&Pat::Id(x.clone()), &[pred]);
        assert!(analysis.extents.contains_key(&x));
    }

    #[test]
    fn test_and_pairs_concatenate_then_intersect() {
        let x = int_id("x", 0);
        let pred = Exp::and(
            Exp::call2(BuiltIn::OpGt, Exp::id(&x), Exp::int(2)),
            Exp::call2(BuiltIn::OpLt, Exp::id(&x), Exp::int(7)),
        );
        let analysis = analyze_one(&Pat::Id(x.clone()), &[pred]);
        let pairs = &analysis.extents[&x];
        assert_eq!(pairs.len(), 2);

        let reduced = reduce_and(pairs).expect("reducible");
        let Exp::Extent { ranges, .. } = reduced.extent else {
            panic!("expected range extent");
        };
        assert_eq!(ranges.single_int_bounds(), Some((3, 6)));
        assert_eq!(reduced.enforced.len(), 2);
        assert!(reduced.residual.is_empty());
    }

    #[test]
    fn test_collection_extent_keeps_range_filter_residual() {
        // x elem [1, 2, 3] andalso x <> 2: the collection is the extent but
        // does not enforce the inequality
        let x = int_id("x", 0);
        let coll = Exp::list_of(Type::Int, vec![Exp::int(1), Exp::int(2), Exp::int(3)]);
        let ne = Exp::call2(BuiltIn::OpNe, Exp::id(&x), Exp::int(2));
        let pred = Exp::and(
            Exp::call2(BuiltIn::Elem, Exp::id(&x), coll.clone()),
            ne.clone(),
        );
        let analysis = analyze_one(&Pat::Id(x.clone()), &[pred]);
        let reduced = reduce_and(&analysis.extents[&x]).expect("reducible");
        assert_eq!(reduced.extent, coll);
        assert_eq!(reduced.residual, vec![ne]);
    }

    #[test]
    fn test_or_unions_ranges() {
        // x < 2 orelse x > 7
        let x = int_id("x", 0);
        let pred = Exp::or(
            Exp::call2(BuiltIn::OpLt, Exp::id(&x), Exp::int(2)),
            Exp::call2(BuiltIn::OpGt, Exp::id(&x), Exp::int(7)),
        );
        let analysis = analyze_one(&Pat::Id(x.clone()), &[pred]);
        let pairs = &analysis.extents[&x];
        assert_eq!(pairs.len(), 1);
        let Exp::Extent { ranges, .. } = &pairs[0].0 else {
            panic!("expected range extent");
        };
        assert_eq!(ranges.ranges().len(), 2);
    }

    #[test]
    fn test_or_drops_half_constrained_leaf() {
        // x > 2 orelse y > 2 constrains neither alone
        let x = int_id("x", 0);
        let y = int_id("y", 1);
        let pred = Exp::or(
            Exp::call2(BuiltIn::OpGt, Exp::id(&x), Exp::int(2)),
            Exp::call2(BuiltIn::OpGt, Exp::id(&y), Exp::int(2)),
        );
        let pat = Pat::Tuple(vec![Pat::Id(x.clone()), Pat::Id(y.clone())]);
        let analysis = analyze_one(&pat, &[pred]);
        assert!(analysis.extents.is_empty());
    }

    #[test]
    fn test_or_of_memberships_unions_collections() {
        let x = int_id("x", 0);
        let a = Exp::list_of(Type::Int, vec![Exp::int(1)]);
        let b = Exp::list_of(Type::Int, vec![Exp::int(2)]);
        let pred = Exp::or(
            Exp::call2(BuiltIn::Elem, Exp::id(&x), a),
            Exp::call2(BuiltIn::Elem, Exp::id(&x), b),
        );
        let analysis = analyze_one(&Pat::Id(x.clone()), &[pred]);
        let pairs = &analysis.extents[&x];
        assert_eq!(pairs.len(), 1);
        let (op, _, _) = pairs[0].0.as_apply2().expect("concat");
        assert_eq!(op, BuiltIn::ListConcat);
    }

    #[test]
    fn test_elem_scalar() {
        let x = int_id("x", 0);
        let coll = Exp::list_of(Type::Int, vec![Exp::int(1), Exp::int(2)]);
        let pred = Exp::call2(BuiltIn::Elem, Exp::id(&x), coll.clone());
        let analysis = analyze_one(&Pat::Id(x.clone()), &[pred.clone()]);
        assert_eq!(analysis.extents[&x], vec![(coll, pred)]);
    }

    #[test]
    fn test_elem_tuple_introduces_fresh_parent() {
        let x = int_id("x", 0);
        let y = int_id("y", 1);
        let pair = Type::Tuple(vec![Type::Int, Type::Int]);
        let coll = Exp::list_of(pair, vec![Exp::Tuple(vec![Exp::int(1), Exp::int(2)])]);
        let pred = Exp::call2(
            BuiltIn::Elem,
            Exp::Tuple(vec![Exp::id(&x), Exp::id(&y)]),
            coll.clone(),
        );
        let pat = Pat::Tuple(vec![Pat::Id(x.clone()), Pat::Id(y.clone())]);
        let analysis = analyze_one(&pat, &[pred]);

        assert_eq!(analysis.aux_ids.len(), 1);
        let r = &analysis.aux_ids[0];
        assert!(analysis.extents.contains_key(r));
        // x and y are defined as slots of r
        assert_eq!(analysis.definitions[&x], Exp::select(0, Exp::id(r)));
        assert_eq!(analysis.definitions[&y], Exp::select(1, Exp::id(r)));
    }

    #[test]
    fn test_elem_tuple_with_constant_keeps_filter() {
        let x = int_id("x", 0);
        let pair = Type::Tuple(vec![Type::Int, Type::Int]);
        let coll = Exp::list_of(pair, vec![Exp::Tuple(vec![Exp::int(1), Exp::int(5)])]);
        let pred = Exp::call2(
            BuiltIn::Elem,
            Exp::Tuple(vec![Exp::id(&x), Exp::int(5)]),
            coll,
        );
        let analysis = analyze_one(&Pat::Id(x.clone()), &[pred]);
        // the constant slot survives as an auxiliary filter on the fresh id
        assert_eq!(analysis.aux_filters.len(), 1);
        assert!(analysis.definitions.contains_key(&x));
    }

    #[test]
    fn test_definition_collected() {
        let x = int_id("x", 0);
        let d = int_id("d", 99);
        let pred = Exp::call2(BuiltIn::OpEq, Exp::id(&x), Exp::id(&d));
        let analysis = analyze_one(&Pat::Id(x.clone()), &[pred]);
        assert_eq!(analysis.definitions[&x], Exp::id(&d));
    }

    #[test]
    fn test_definition_beats_weaker_extent() {
        // x > 25 andalso x = d: the definition is also recorded
        let x = int_id("x", 0);
        let d = int_id("d", 99);
        let pred = Exp::and(
            Exp::call2(BuiltIn::OpGt, Exp::id(&x), Exp::int(25)),
            Exp::call2(BuiltIn::OpEq, Exp::id(&x), Exp::id(&d)),
        );
        let analysis = analyze_one(&Pat::Id(x.clone()), &[pred]);
        assert!(analysis.definitions.contains_key(&x));
        assert!(analysis.extents.contains_key(&x));
    }

    #[test]
    fn test_slot_definition() {
        // #0 e = d  (e.deptno = d.dno style)
        let emp = Type::record(
            vec![
                ("deptno".to_string(), Type::Int),
                ("name".to_string(), Type::String),
            ],
            true,
        );
        let e = IdPat::new("e", 0, emp);
        let d = int_id("d", 99);
        let pred = Exp::call2(
            BuiltIn::OpEq,
            Exp::select(0, Exp::id(&e)),
            Exp::id(&d),
        );
        let analysis = analyze_one(&Pat::Id(e.clone()), &[pred]);
        let slots = &analysis.slot_definitions[&e];
        assert_eq!(slots.get(&0), Some(&Exp::id(&d)));
    }

    #[test]
    fn test_bound_vars_ignored() {
        let x = int_id("x", 0);
        let mut bound = HashSet::new();
        bound.insert(x.clone());
        let pred = Exp::call2(BuiltIn::OpGt, Exp::id(&x), Exp::int(5));
        let mut names = NameGen::starting_at(1000);
        let analysis = analyze(&Pat::Id(x.clone()), &[pred], &bound, &mut names);
        assert!(analysis.extents.is_empty());
    }
}
