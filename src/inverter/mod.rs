//! # Predicate Inverter
//!
//! Turns a boolean predicate into a generator for a set of goal patterns:
//! an expression enumerating exactly (or a superset of) the values that
//! satisfy the predicate, plus the residual filters the caller must keep.
//!
//! Dispatch is by predicate shape, first match wins:
//!
//! 1. single-arm `case` on a goal id — descend with the arm's variables
//! 2. `p elem c` — the collection is the generator (with tuple rewiring)
//! 3. `x = e` where `e` does not mention a goal — point generator
//! 4. `isPrefix (p, s)` — tabulate all prefixes of `s`
//! 5. `p andalso q` — mode analysis, bound-pair ranges, per-conjunct inversion
//! 6. `p orelse q` with an `exists` branch — transitive closure via `iterate`
//! 7. apply of a function literal — inline and re-invert
//! 8. apply of a registered function — consult the registry
//! 9. `nonEmpty (from ...)` — existential inversion
//! 10. otherwise — the predicate stays a filter over the goals' existing
//!     generators (an infinite extent when a goal is unbound)
//!
//! The inverter never guesses: a rule that cannot apply falls through, and a
//! heuristic failure returns `None` so the caller can try the next strategy.

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};

use crate::generator::{Cardinality, Generator};
use crate::ir::visit::{walk_exp, Walk};
use crate::ir::{BuiltIn, Exp, IdPat, NameGen, Pat};
use crate::ir_builder::FromBuilder;
use crate::range_set::RangeSet;
use crate::registry::{FnStatus, FunctionRegistry};
use crate::types::Type;
use crate::unify::unify_types;

pub mod arg_match;

/// Generators discovered so far, keyed by the named pattern they bind
pub type GeneratorMap = HashMap<IdPat, Generator>;

/// Result of a successful inversion: a generator for the goal tuple and the
/// filters the caller must still apply.
#[derive(Debug, Clone, PartialEq)]
pub struct Inversion {
    pub generator: Generator,
    pub remaining: Vec<Exp>,
}

/// Recursion guard for nested inlining and existential descent
const MAX_DEPTH: usize = 64;

/// The predicate inverter
pub struct Inverter<'a> {
    registry: &'a FunctionRegistry,
    names: &'a mut NameGen,
    depth: usize,
}

impl<'a> Inverter<'a> {
    pub fn new(registry: &'a FunctionRegistry, names: &'a mut NameGen) -> Inverter<'a> {
        Inverter {
            registry,
            names,
            depth: 0,
        }
    }

    /// Invert `pred` for `goals`. `existing` holds generators already known
    /// for in-scope variables.
    pub fn invert(
        &mut self,
        pred: &Exp,
        goals: &[IdPat],
        existing: &GeneratorMap,
    ) -> Option<Inversion> {
        if goals.is_empty() || self.depth >= MAX_DEPTH {
            return None;
        }
        self.depth += 1;
        let result = self.invert_inner(pred, goals, existing);
        self.depth -= 1;
        if let Some(inv) = &result {
            trace!(
                pred = %pred,
                cardinality = ?inv.generator.cardinality,
                remaining = inv.remaining.len(),
                "inverted predicate"
            );
        }
        result
    }

    fn invert_inner(
        &mut self,
        pred: &Exp,
        goals: &[IdPat],
        existing: &GeneratorMap,
    ) -> Option<Inversion> {
        if let Some(inv) = self.invert_case(pred, goals, existing) {
            return Some(inv);
        }
        if let Some(inv) = self.invert_elem(pred, goals) {
            return Some(inv);
        }
        if let Some(inv) = self.invert_definition(pred, goals) {
            return Some(inv);
        }
        if let Some(inv) = self.invert_prefix(pred, goals) {
            return Some(inv);
        }
        if let Some(inv) = self.invert_conjunction(pred, goals, existing) {
            return Some(inv);
        }
        if let Some(inv) = self.invert_closure(pred, goals, existing) {
            return Some(inv);
        }
        if let Some(inv) = self.invert_inline_lambda(pred, goals, existing) {
            return Some(inv);
        }
        if let Some(inv) = self.invert_call(pred, goals, existing) {
            return Some(inv);
        }
        if let Some(inv) = self.invert_exists(pred, goals, existing) {
            return Some(inv);
        }
        self.fallback(pred, goals, existing)
    }

    // ------------------------------------------------------------------
    // Rule 1: case
    // ------------------------------------------------------------------

    /// `case g of pat => body` where `g` is the sole goal: descend into the
    /// body with the arm's variables as goals, then retarget the generator
    /// to `g` (the arm pattern's value *is* `g`'s value).
    fn invert_case(
        &mut self,
        pred: &Exp,
        goals: &[IdPat],
        existing: &GeneratorMap,
    ) -> Option<Inversion> {
        let Exp::Case { input, arms, .. } = pred else {
            return None;
        };
        let [(arm_pat, arm_body)] = arms.as_slice() else {
            return None;
        };
        let Exp::Id(case_id) = input.as_ref() else {
            return None;
        };
        if goals != [case_id.clone()] {
            return None;
        }
        let new_goals: Vec<IdPat> = arm_pat.expand().into_iter().cloned().collect();
        if new_goals.is_empty() {
            return None;
        }
        let inv = self.invert(arm_body, &new_goals, existing)?;
        // the generator must bind the arm leaves in the arm's own shape
        if inv.generator.pat.ty() != arm_pat.ty() {
            return None;
        }
        let remap = destructure(arm_pat, &Exp::id(case_id))?;
        Some(Inversion {
            generator: Generator {
                pat: Pat::Id(case_id.clone()),
                exp: inv.generator.exp,
                cardinality: inv.generator.cardinality,
                constraints: vec![pred.clone()],
                free_vars: inv.generator.free_vars,
            },
            remaining: inv
                .remaining
                .iter()
                .map(|r| r.substitute_all(&remap))
                .collect(),
        })
    }

    // ------------------------------------------------------------------
    // Rule 2: elem
    // ------------------------------------------------------------------

    fn invert_elem(&mut self, pred: &Exp, goals: &[IdPat]) -> Option<Inversion> {
        let Some((BuiltIn::Elem, left, coll)) = pred.as_apply2() else {
            return None;
        };
        if mentions_goal(coll, goals) {
            return None;
        }
        match left {
            Exp::Id(id) if goals == [id.clone()] => {
                let gen = Generator::collection(Pat::Id(id.clone()), coll.clone())
                    .ok()?
                    .with_constraint(pred.clone());
                Some(Inversion {
                    generator: gen,
                    remaining: Vec::new(),
                })
            }
            Exp::Tuple(items) => self.invert_elem_tuple(items, coll, pred, goals),
            _ => None,
        }
    }

    fn invert_elem_tuple(
        &mut self,
        items: &[Exp],
        coll: &Exp,
        pred: &Exp,
        goals: &[IdPat],
    ) -> Option<Inversion> {
        // tuple of plain ids
        if let Some(ids) = items
            .iter()
            .map(|e| match e {
                Exp::Id(id) => Some(id.clone()),
                _ => None,
            })
            .collect::<Option<Vec<IdPat>>>()
        {
            let mut distinct: Vec<IdPat> = Vec::new();
            for id in &ids {
                if !distinct.contains(id) {
                    distinct.push(id.clone());
                }
            }
            if !same_ids(&distinct, goals) {
                return None;
            }
            if distinct.len() == ids.len() {
                // no duplicates: the collection yields tuples of this shape
                let pat = Pat::Tuple(ids.into_iter().map(Pat::Id).collect());
                let gen = Generator::collection(pat, coll.clone())
                    .ok()?
                    .with_constraint(pred.clone());
                return Some(Inversion {
                    generator: gen,
                    remaining: Vec::new(),
                });
            }
            // repeated ids: from (z1, .., zn) in c where z_first = z_dup yield distinct
            return self.invert_elem_repeated(&ids, &distinct, coll, pred);
        }

        // tuple of field accesses on a single goal: (#i p, #j p) elem c
        self.invert_elem_selects(items, coll, pred, goals)
    }

    /// `(z, z) elem c` style: emit a projection that keeps only tuples whose
    /// repeated slots agree.
    fn invert_elem_repeated(
        &mut self,
        ids: &[IdPat],
        distinct: &[IdPat],
        coll: &Exp,
        pred: &Exp,
    ) -> Option<Inversion> {
        let element = coll.ty().element_type()?.clone();
        let slot_tys = match &element {
            Type::Tuple(ts) if ts.len() == ids.len() => ts.clone(),
            _ => return None,
        };
        let zs: Vec<IdPat> = slot_tys
            .iter()
            .map(|t| self.names.fresh("z", t.clone()))
            .collect();
        let mut fb = FromBuilder::new();
        fb.scan(
            Pat::Tuple(zs.iter().cloned().map(Pat::Id).collect()),
            coll.clone(),
        )
        .ok()?;
        // equate each later occurrence with the first occurrence of its id
        let mut first_slot: HashMap<&IdPat, usize> = HashMap::new();
        for (i, id) in ids.iter().enumerate() {
            match first_slot.get(id) {
                Some(&j) => {
                    fb.where_(Exp::call2(
                        BuiltIn::OpEq,
                        Exp::id(&zs[j]),
                        Exp::id(&zs[i]),
                    ));
                }
                None => {
                    first_slot.insert(id, i);
                }
            }
        }
        let kept: Vec<&IdPat> = distinct.iter().map(|id| &zs[first_slot[id]]).collect();
        let yield_exp = if let [only] = kept.as_slice() {
            Exp::id(only)
        } else {
            Exp::Tuple(kept.iter().map(|z| Exp::id(z)).collect())
        };
        fb.yield_(yield_exp);
        let exp = Exp::From(Box::new(fb.build()));
        let pat = goals_pat(distinct);
        let free_vars = exp.free_vars();
        Some(Inversion {
            generator: Generator {
                pat,
                exp,
                cardinality: Cardinality::Finite,
                constraints: vec![pred.clone()],
                free_vars,
            },
            remaining: Vec::new(),
        })
    }

    /// `(#1 p, #2 p) elem c`: the collection generates `p` directly when the
    /// slots are in position order, via a slot permutation otherwise.
    fn invert_elem_selects(
        &mut self,
        items: &[Exp],
        coll: &Exp,
        pred: &Exp,
        goals: &[IdPat],
    ) -> Option<Inversion> {
        let mut target: Option<&IdPat> = None;
        let mut slots = Vec::with_capacity(items.len());
        for item in items {
            let Exp::Select { slot, input } = item else {
                return None;
            };
            let Exp::Id(id) = input.as_ref() else {
                return None;
            };
            match target {
                Some(t) if t != id => return None,
                None => target = Some(id),
                _ => {}
            }
            slots.push(*slot);
        }
        let goal = target?;
        if goals != [goal.clone()] {
            return None;
        }
        // the selects must cover every slot of the goal exactly once
        if goal.ty.field_count() != slots.len() {
            return None;
        }
        let mut seen: HashSet<usize> = HashSet::new();
        if !slots.iter().all(|s| seen.insert(*s)) {
            return None;
        }
        let identity = slots.iter().enumerate().all(|(i, s)| i == *s);
        let exp = if identity {
            coll.clone()
        } else {
            // from r in c yield the tuple permuted back into slot order
            let element = coll.ty().element_type()?.clone();
            let r = self.names.fresh("r", element);
            let mut fb = FromBuilder::new();
            fb.scan(Pat::Id(r.clone()), coll.clone()).ok()?;
            let projected: Vec<Exp> = (0..slots.len())
                .map(|j| {
                    let i = slots.iter().position(|s| *s == j)?;
                    Some(Exp::select(i, Exp::id(&r)))
                })
                .collect::<Option<Vec<Exp>>>()?;
            fb.yield_(Exp::Tuple(projected));
            Exp::From(Box::new(fb.build()))
        };
        let gen = Generator::collection(Pat::Id(goal.clone()), exp)
            .ok()?
            .with_constraint(pred.clone());
        Some(Inversion {
            generator: gen,
            remaining: Vec::new(),
        })
    }

    // ------------------------------------------------------------------
    // Rule 3: definitions
    // ------------------------------------------------------------------

    /// `x = e` (either side) where `e` does not mention a goal: a point
    /// generator dependent on whatever `e` references.
    fn invert_definition(&mut self, pred: &Exp, goals: &[IdPat]) -> Option<Inversion> {
        let Some((BuiltIn::OpEq, a, b)) = pred.as_apply2() else {
            return None;
        };
        let (id, value) = match (a, b) {
            (Exp::Id(id), e) if goals == [id.clone()] && !mentions_goal(e, goals) => (id, e),
            (e, Exp::Id(id)) if goals == [id.clone()] && !mentions_goal(e, goals) => (id, e),
            _ => return None,
        };
        let gen = Generator::point(Pat::Id(id.clone()), value.clone())
            .with_constraint(pred.clone());
        Some(Inversion {
            generator: gen,
            remaining: Vec::new(),
        })
    }

    // ------------------------------------------------------------------
    // Rule 4: string prefix
    // ------------------------------------------------------------------

    /// `isPrefix (p, s)`: every prefix of `s`, as
    /// `tabulate (size s + 1, fn i => substring (s, 0, i))`.
    fn invert_prefix(&mut self, pred: &Exp, goals: &[IdPat]) -> Option<Inversion> {
        let Some((BuiltIn::IsPrefix, p, s)) = pred.as_apply2() else {
            return None;
        };
        let Exp::Id(id) = p else {
            return None;
        };
        if goals != [id.clone()] || mentions_goal(s, goals) {
            return None;
        }
        let count = Exp::call2(BuiltIn::OpPlus, Exp::call1(BuiltIn::Size, s.clone()), Exp::int(1));
        let i = self.names.fresh("i", Type::Int);
        let body = substring(s.clone(), Exp::int(0), Exp::id(&i));
        let step = Exp::Fn {
            param: Pat::Id(i),
            body: Box::new(body),
        };
        let exp = Exp::call2(BuiltIn::ListTabulate, count, step);
        let free_vars = exp.free_vars();
        Some(Inversion {
            generator: Generator {
                pat: Pat::Id(id.clone()),
                exp,
                cardinality: Cardinality::Finite,
                constraints: vec![pred.clone()],
                free_vars,
            },
            remaining: Vec::new(),
        })
    }

    // ------------------------------------------------------------------
    // Rule 5: conjunction
    // ------------------------------------------------------------------

    fn invert_conjunction(
        &mut self,
        pred: &Exp,
        goals: &[IdPat],
        existing: &GeneratorMap,
    ) -> Option<Inversion> {
        if !matches!(pred.as_apply2(), Some((BuiltIn::AndAlso, ..))) {
            return None;
        }
        let conjuncts: Vec<Exp> = pred.conjuncts().into_iter().cloned().collect();
        let ordered = mode_order(conjuncts, goals, existing);

        let mut absorbed = vec![false; ordered.len()];
        let mut parts: Vec<Generator> = Vec::new();
        let mut covered: Vec<IdPat> = Vec::new();
        let mut remaining: Vec<Exp> = Vec::new();

        // classic bound pairs: x > lo andalso x < hi with goal-free bounds
        for goal in goals {
            if let Some(pair) = find_bound_pair(&ordered, &absorbed, goal, goals) {
                let gen = Generator::range_from_exps(
                    Pat::Id(goal.clone()),
                    pair.lo,
                    pair.lo_strict,
                    pair.hi,
                    pair.hi_strict,
                    self.names,
                )
                .with_constraint(ordered[pair.lo_index].clone())
                .with_constraint(ordered[pair.hi_index].clone());
                absorbed[pair.lo_index] = true;
                absorbed[pair.hi_index] = true;
                covered.push(goal.clone());
                parts.push(gen);
            }
        }

        // invert each remaining conjunct for the goals it references
        for (i, conjunct) in ordered.iter().enumerate() {
            if absorbed[i] {
                continue;
            }
            let conjunct_goals: Vec<IdPat> = goals
                .iter()
                .filter(|g| !covered.contains(g) && mentions_goal(conjunct, &[(*g).clone()]))
                .cloned()
                .collect();
            if conjunct_goals.is_empty() {
                continue;
            }
            if let Some(sub) = self.invert(conjunct, &conjunct_goals, existing) {
                if sub.generator.is_finite() {
                    absorbed[i] = true;
                    covered.extend(conjunct_goals);
                    remaining.extend(sub.remaining);
                    parts.push(sub.generator);
                }
            }
        }

        if parts.is_empty() {
            return None;
        }

        // unabsorbed conjuncts stay as filters
        for (i, conjunct) in ordered.iter().enumerate() {
            if !absorbed[i] {
                remaining.push(conjunct.clone());
            }
        }

        // uncovered goals fall back to existing finite generators
        for goal in goals {
            if covered.contains(goal) {
                continue;
            }
            let gen = existing
                .get(goal)
                .filter(|g| g.is_finite() && g.pat == Pat::Id(goal.clone()))?;
            parts.push(gen.clone());
            covered.push(goal.clone());
        }

        let generator = self.combine_parts(parts, goals)?;
        debug!(goals = goals.len(), cardinality = ?generator.cardinality, "conjunction inverted");
        Some(Inversion {
            generator,
            remaining,
        })
    }

    // ------------------------------------------------------------------
    // Rule 6: transitive closure
    // ------------------------------------------------------------------

    /// `base orelse <branch containing exists>`: invert the base case, then
    /// wrap it in an `iterate` whose step joins the frontier against the
    /// base relation.
    fn invert_closure(
        &mut self,
        pred: &Exp,
        goals: &[IdPat],
        existing: &GeneratorMap,
    ) -> Option<Inversion> {
        let Some((BuiltIn::OrElse, a, b)) = pred.as_apply2() else {
            return None;
        };
        let base = match (contains_exists(a), contains_exists(b)) {
            (false, true) => a,
            (true, false) => b,
            _ => return None,
        };
        let base_inv = self.invert(base, goals, existing)?;
        if !base_inv.generator.is_finite() || !base_inv.remaining.is_empty() {
            return None;
        }
        self.build_iterate(goals, base_inv.generator, pred)
    }

    /// `iterate base (fn (old, new) => from (x, z) in new, (z2, y) in base
    /// where z = z2 yield (x, y))`
    fn build_iterate(
        &mut self,
        goals: &[IdPat],
        base: Generator,
        pred: &Exp,
    ) -> Option<Inversion> {
        let element = base.exp.ty().element_type()?.clone();
        // the closed relation must be a square binary relation
        let (base_exp, vertex) = match &element {
            Type::Tuple(ts) if ts.len() == 2 && ts[0] == ts[1] => {
                (base.exp.clone(), ts[0].clone())
            }
            Type::Record { fields, .. } if fields.len() == 2 => {
                let tys: Vec<Type> = fields.values().cloned().collect();
                if tys[0] != tys[1] {
                    return None;
                }
                // records join as tuples: project before iterating
                let r = self.names.fresh("r", element.clone());
                let mut fb = FromBuilder::new();
                fb.scan(Pat::Id(r.clone()), base.exp.clone()).ok()?;
                fb.yield_(Exp::Tuple(vec![
                    Exp::select(0, Exp::id(&r)),
                    Exp::select(1, Exp::id(&r)),
                ]));
                (Exp::From(Box::new(fb.build())), tys[0].clone())
            }
            _ => return None,
        };
        let pair_ty = Type::Tuple(vec![vertex.clone(), vertex.clone()]);
        let frontier_ty = base_exp.ty();

        let old = self.names.fresh("old", frontier_ty.clone());
        let frontier = self.names.fresh("new", frontier_ty);
        let x = self.names.fresh("x", vertex.clone());
        let z = self.names.fresh("z", vertex.clone());
        let z2 = self.names.fresh("z", vertex.clone());
        let y = self.names.fresh("y", vertex);

        let mut fb = FromBuilder::new();
        fb.scan(
            Pat::Tuple(vec![Pat::Id(x.clone()), Pat::Id(z.clone())]),
            Exp::id(&frontier),
        )
        .ok()?;
        fb.scan(
            Pat::Tuple(vec![Pat::Id(z2.clone()), Pat::Id(y.clone())]),
            base_exp.clone(),
        )
        .ok()?;
        fb.where_(Exp::call2(BuiltIn::OpEq, Exp::id(&z), Exp::id(&z2)));
        fb.yield_(Exp::Tuple(vec![Exp::id(&x), Exp::id(&y)]));
        let step = Exp::Fn {
            param: Pat::Tuple(vec![Pat::Id(old), Pat::Id(frontier)]),
            body: Box::new(Exp::From(Box::new(fb.build()))),
        };

        let exp = Exp::call2(BuiltIn::Iterate, base_exp, step);
        let pat = match goals {
            [single] if single.ty == pair_ty => Pat::Id(single.clone()),
            [first, second] if first.ty == vertex_of(&pair_ty, 0) && second.ty == vertex_of(&pair_ty, 1) => {
                Pat::Tuple(vec![Pat::Id(first.clone()), Pat::Id(second.clone())])
            }
            _ => return None,
        };
        let free_vars = exp.free_vars();
        debug!(pred = %pred, "transitive closure lowered to iterate");
        Some(Inversion {
            generator: Generator {
                pat,
                exp,
                cardinality: Cardinality::Finite,
                constraints: vec![pred.clone()],
                free_vars,
            },
            remaining: Vec::new(),
        })
    }

    // ------------------------------------------------------------------
    // Rule 7: inline lambda application
    // ------------------------------------------------------------------

    /// Apply of a function literal: specialize the body to the argument's
    /// types, substitute the argument for the formal, and re-invert.
    fn invert_inline_lambda(
        &mut self,
        pred: &Exp,
        goals: &[IdPat],
        existing: &GeneratorMap,
    ) -> Option<Inversion> {
        let Exp::Apply { func, arg, .. } = pred else {
            return None;
        };
        let Exp::Fn { param, body } = func.as_ref() else {
            return None;
        };
        let (param, body) = match unify_types(&param.ty(), &arg.ty()) {
            Ok(subst) if !subst.is_empty() => {
                let f = |t: &Type| t.apply_subst(&subst);
                (crate::ir::map_pat_types(param, &f), body.map_types(&f))
            }
            Ok(_) => (param.clone(), body.as_ref().clone()),
            Err(_) => return None,
        };
        let map = destructure(&param, arg)?;
        let inlined = body.substitute_all(&map);
        self.invert(&inlined, goals, existing)
    }

    // ------------------------------------------------------------------
    // Rule 8: registered function call
    // ------------------------------------------------------------------

    fn invert_call(
        &mut self,
        pred: &Exp,
        goals: &[IdPat],
        existing: &GeneratorMap,
    ) -> Option<Inversion> {
        let Exp::Apply { func, arg, .. } = pred else {
            return None;
        };
        let Exp::Id(f) = func.as_ref() else {
            return None;
        };
        let info = self.registry.lookup(f)?;
        match info.status {
            FnStatus::NotInvertible => None,
            FnStatus::Invertible | FnStatus::PartiallyInvertible => {
                let shape = arg_match::match_call(arg, &info.formal, goals)?;
                if !same_ids(&shape.bound_pats, goals) {
                    return None;
                }
                let base = info.base.clone()?;
                let generator = Generator::collection(shape.goal_pat, base)
                    .ok()?
                    .with_constraint(pred.clone());
                let subst = destructure(&info.formal, arg)?;
                let remaining = info
                    .required_filters
                    .iter()
                    .map(|filter| filter.substitute_all(&subst))
                    .collect();
                Some(Inversion {
                    generator,
                    remaining,
                })
            }
            FnStatus::Recursive => {
                let subst = destructure(&info.formal, arg)?;
                let base_pred = info.base.clone()?.substitute_all(&subst);
                let base_inv = self.invert(&base_pred, goals, existing)?;
                if !base_inv.generator.is_finite() || !base_inv.remaining.is_empty() {
                    return None;
                }
                self.build_iterate(goals, base_inv.generator, pred)
            }
        }
    }

    // ------------------------------------------------------------------
    // Rule 9: existential
    // ------------------------------------------------------------------

    /// `nonEmpty (from s in C where P)`: add the existential variables to the
    /// goals, invert the combined predicate, and project them back out.
    fn invert_exists(
        &mut self,
        pred: &Exp,
        goals: &[IdPat],
        existing: &GeneratorMap,
    ) -> Option<Inversion> {
        let (op, inner) = pred.as_apply1()?;
        if op != BuiltIn::NonEmpty {
            return None;
        }
        let Exp::From(from) = inner else {
            return None;
        };

        let mut inner_goals = goals.to_vec();
        let mut augmented = existing.clone();
        let mut conjuncts: Vec<Exp> = Vec::new();

        for step in &from.steps {
            match step {
                crate::ir::Step::Scan {
                    pat,
                    exp,
                    condition,
                } => {
                    for leaf in pat.expand() {
                        inner_goals.push(leaf.clone());
                    }
                    if exp.is_infinite_extent() {
                        for leaf in pat.expand() {
                            augmented.insert(
                                leaf.clone(),
                                Generator::extent(
                                    Pat::Id(leaf.clone()),
                                    RangeSet::full(),
                                    self.names,
                                ),
                            );
                        }
                    } else {
                        // a bounded scan is just a membership constraint
                        let pat_exp = pat_to_exp(pat)?;
                        conjuncts.push(Exp::call2(BuiltIn::Elem, pat_exp, exp.clone()));
                    }
                    if let Some(c) = condition {
                        conjuncts.push(c.clone());
                    }
                }
                crate::ir::Step::Where(e) => conjuncts.push(e.clone()),
                _ => return None,
            }
        }

        // literal collections: substitute each element and distinct-union
        if let Some(inv) = self.invert_exists_literal(from, goals, existing) {
            return Some(inv);
        }

        let combined = Exp::and_all(conjuncts);
        let inv = self.invert(&combined, &inner_goals, &augmented)?;
        if !inv.generator.is_finite() {
            return None;
        }
        let generator = self.project_goals(inv.generator, inv.remaining, goals, pred)?;
        Some(Inversion {
            generator,
            remaining: Vec::new(),
        })
    }

    /// `exists` over a literal collection: substitute each element for the
    /// scan variable and distinct-union the resulting generators.
    fn invert_exists_literal(
        &mut self,
        from: &crate::ir::FromExp,
        goals: &[IdPat],
        existing: &GeneratorMap,
    ) -> Option<Inversion> {
        let [crate::ir::Step::Scan {
            pat,
            exp,
            condition: None,
        }, rest @ ..] = from.steps.as_slice()
        else {
            return None;
        };
        let items = exp.as_collection_literal()?.to_vec();
        let mut wheres: Vec<Exp> = Vec::new();
        for step in rest {
            match step {
                crate::ir::Step::Where(e) => wheres.push(e.clone()),
                _ => return None,
            }
        }
        let combined = Exp::and_all(wheres);
        let mut gens = Vec::new();
        for item in &items {
            let map = destructure(pat, item)?;
            let inst = combined.substitute_all(&map);
            let sub = self.invert(&inst, goals, existing)?;
            if !sub.generator.is_finite() || !sub.remaining.is_empty() {
                return None;
            }
            gens.push(sub.generator);
        }
        // distinct-union: overlapping elements must not duplicate results
        let union = Generator::union(gens).ok()?;
        let cardinality = union.cardinality;
        let mut fb = FromBuilder::new();
        fb.scan(union.pat, union.exp).ok()?;
        let yield_exp = if let [single] = goals {
            Exp::id(single)
        } else {
            Exp::Tuple(goals.iter().map(Exp::id).collect())
        };
        fb.yield_(yield_exp);
        fb.distinct();
        let exp = Exp::From(Box::new(fb.build()));
        let free_vars = exp.free_vars();
        Some(Inversion {
            generator: Generator {
                pat: goals_pat(goals),
                exp,
                cardinality,
                constraints: Vec::new(),
                free_vars,
            },
            remaining: Vec::new(),
        })
    }

    /// Wrap a generator that binds more than the goals into
    /// `from (all) in gen where filters yield (goals) distinct`.
    fn project_goals(
        &mut self,
        gen: Generator,
        inner_filters: Vec<Exp>,
        goals: &[IdPat],
        constraint: &Exp,
    ) -> Option<Generator> {
        let binds: Vec<IdPat> = gen.pat.expand().into_iter().cloned().collect();
        if binds == goals && inner_filters.is_empty() {
            return Some(gen);
        }
        let cardinality = gen.cardinality;
        let mut fb = FromBuilder::new();
        fb.scan(gen.pat, gen.exp).ok()?;
        for filter in inner_filters {
            fb.where_(filter);
        }
        let yield_exp = if let [single] = goals {
            Exp::id(single)
        } else {
            Exp::Tuple(goals.iter().map(Exp::id).collect())
        };
        fb.yield_(yield_exp);
        fb.distinct();
        let exp = Exp::From(Box::new(fb.build()));
        let free_vars = exp.free_vars();
        let constraints = if constraint.is_literal_true() {
            Vec::new()
        } else {
            vec![constraint.clone()]
        };
        Some(Generator {
            pat: goals_pat(goals),
            exp,
            cardinality,
            constraints,
            free_vars,
        })
    }

    // ------------------------------------------------------------------
    // Rule 10: fallback
    // ------------------------------------------------------------------

    /// Keep the predicate as a filter; the goal tuple ranges over the
    /// cartesian product of the goals' existing generators, with an infinite
    /// extent for any goal still unbound.
    fn fallback(
        &mut self,
        pred: &Exp,
        goals: &[IdPat],
        existing: &GeneratorMap,
    ) -> Option<Inversion> {
        let parts: Vec<Generator> = goals
            .iter()
            .map(|goal| {
                existing
                    .get(goal)
                    .filter(|g| g.pat == Pat::Id(goal.clone()))
                    .cloned()
                    .unwrap_or_else(|| {
                        Generator::extent(Pat::Id(goal.clone()), RangeSet::full(), self.names)
                    })
            })
            .collect();
        let generator = if let [_] = goals {
            parts.into_iter().next()?
        } else {
            self.combine_parts(parts, goals)?
        };
        Some(Inversion {
            generator,
            remaining: vec![pred.clone()],
        })
    }

    // ------------------------------------------------------------------
    // Combination
    // ------------------------------------------------------------------

    /// Combine per-goal generators into one generator for the goal tuple,
    /// scanning them in dependency order.
    fn combine_parts(&mut self, parts: Vec<Generator>, goals: &[IdPat]) -> Option<Generator> {
        if let [part] = parts.as_slice() {
            let binds: Vec<IdPat> = part.pat.expand().into_iter().cloned().collect();
            if binds == goals {
                return parts.into_iter().next();
            }
        }

        let all_bound: HashSet<IdPat> = parts
            .iter()
            .flat_map(|p| p.pat.expand().into_iter().cloned())
            .collect();
        let mut pending = parts;
        let mut ordered: Vec<Generator> = Vec::new();
        let mut bound: HashSet<IdPat> = HashSet::new();
        while !pending.is_empty() {
            let idx = pending.iter().position(|p| {
                p.free_vars
                    .iter()
                    .all(|v| !all_bound.contains(v) || bound.contains(v))
            })?;
            let part = pending.remove(idx);
            bound.extend(part.pat.expand().into_iter().cloned());
            ordered.push(part);
        }

        let mut fb = FromBuilder::new();
        let mut cardinality = Cardinality::Single;
        let mut constraints = Vec::new();
        for part in &ordered {
            fb.scan(part.pat.clone(), part.exp.clone()).ok()?;
            cardinality = cardinality.max(part.cardinality);
            constraints.extend(part.constraints.iter().cloned());
        }
        let yield_exp = if let [single] = goals {
            Exp::id(single)
        } else {
            Exp::Tuple(goals.iter().map(Exp::id).collect())
        };
        fb.yield_(yield_exp);
        let exp = Exp::From(Box::new(fb.build()));
        let free_vars = exp.free_vars();
        Some(Generator {
            pat: goals_pat(goals),
            exp,
            cardinality,
            constraints,
            free_vars,
        })
    }
}

// ============================================================================
// Mode analysis
// ============================================================================

/// Reorder conjuncts so that generator-capable predicates precede pure
/// filters, respecting goal dependencies between them.
fn mode_order(conjuncts: Vec<Exp>, goals: &[IdPat], existing: &GeneratorMap) -> Vec<Exp> {
    let mut generators: Vec<Exp> = Vec::new();
    let mut filters: Vec<Exp> = Vec::new();
    for c in conjuncts {
        if is_generator_capable(&c, goals) {
            generators.push(c);
        } else {
            filters.push(c);
        }
    }

    // order generator-capable conjuncts so that each one's goal dependencies
    // (goals it references but does not bind) come first
    let mut bound: HashSet<IdPat> = existing
        .iter()
        .filter(|(_, gen)| gen.is_finite())
        .map(|(id, _)| id.clone())
        .collect();
    let mut ordered: Vec<Exp> = Vec::new();
    while !generators.is_empty() {
        let idx = generators
            .iter()
            .position(|c| {
                let binds = generated_ids(c, goals);
                c.free_vars()
                    .iter()
                    .filter(|v| goals.contains(v))
                    .all(|v| binds.contains(v) || bound.contains(v))
            })
            .unwrap_or(0);
        let c = generators.remove(idx);
        bound.extend(generated_ids(&c, goals));
        ordered.push(c);
    }
    ordered.extend(filters);
    ordered
}

/// Shapes that can act as a generator for some goal
fn is_generator_capable(c: &Exp, goals: &[IdPat]) -> bool {
    if let Some((op, a, b)) = c.as_apply2() {
        match op {
            BuiltIn::Elem | BuiltIn::IsPrefix => return !mentions_goal(b, goals),
            BuiltIn::OpEq => {
                return matches!(a, Exp::Id(id) if goals.contains(id)) && !mentions_goal(b, goals)
                    || matches!(b, Exp::Id(id) if goals.contains(id)) && !mentions_goal(a, goals)
            }
            BuiltIn::AndAlso | BuiltIn::OrElse => return true,
            _ => {}
        }
    }
    matches!(c, Exp::Apply { .. } | Exp::Case { .. })
}

/// Goals a conjunct would bind if used as a generator
fn generated_ids(c: &Exp, goals: &[IdPat]) -> Vec<IdPat> {
    if let Some((op, a, b)) = c.as_apply2() {
        match op {
            BuiltIn::Elem | BuiltIn::IsPrefix => {
                return a
                    .free_vars()
                    .into_iter()
                    .filter(|v| goals.contains(v))
                    .collect()
            }
            BuiltIn::OpEq => {
                if let Exp::Id(id) = a {
                    if goals.contains(id) && !mentions_goal(b, goals) {
                        return vec![id.clone()];
                    }
                }
                if let Exp::Id(id) = b {
                    if goals.contains(id) && !mentions_goal(a, goals) {
                        return vec![id.clone()];
                    }
                }
            }
            _ => {}
        }
    }
    c.free_vars()
        .into_iter()
        .filter(|v| goals.contains(v))
        .collect()
}

// ============================================================================
// Bound pairs
// ============================================================================

struct BoundPair {
    lo: Exp,
    lo_strict: bool,
    lo_index: usize,
    hi: Exp,
    hi_strict: bool,
    hi_index: usize,
}

/// Find `goal > lo` and `goal < hi` conjuncts whose bounds mention no goal
fn find_bound_pair(
    conjuncts: &[Exp],
    absorbed: &[bool],
    goal: &IdPat,
    goals: &[IdPat],
) -> Option<BoundPair> {
    if goal.ty != Type::Int {
        return None;
    }
    let mut lo: Option<(Exp, bool, usize)> = None;
    let mut hi: Option<(Exp, bool, usize)> = None;
    for (i, c) in conjuncts.iter().enumerate() {
        if absorbed[i] {
            continue;
        }
        let Some((op, bound)) = comparison_on(c, goal) else {
            continue;
        };
        if mentions_goal(&bound, goals) {
            continue;
        }
        match op {
            BuiltIn::OpGt if lo.is_none() => lo = Some((bound, true, i)),
            BuiltIn::OpGe if lo.is_none() => lo = Some((bound, false, i)),
            BuiltIn::OpLt if hi.is_none() => hi = Some((bound, true, i)),
            BuiltIn::OpLe if hi.is_none() => hi = Some((bound, false, i)),
            _ => {}
        }
    }
    let (lo, lo_strict, lo_index) = lo?;
    let (hi, hi_strict, hi_index) = hi?;
    Some(BoundPair {
        lo,
        lo_strict,
        lo_index,
        hi,
        hi_strict,
        hi_index,
    })
}

/// Normalize a comparison so the goal is on the left; returns the operator
/// and the other side.
fn comparison_on(c: &Exp, goal: &IdPat) -> Option<(BuiltIn, Exp)> {
    let (op, a, b) = c.as_apply2()?;
    if !op.is_comparison() {
        return None;
    }
    if matches!(a, Exp::Id(id) if id == goal) {
        return Some((op, b.clone()));
    }
    if matches!(b, Exp::Id(id) if id == goal) {
        return Some((op.reverse()?, a.clone()));
    }
    None
}

// ============================================================================
// Shared helpers
// ============================================================================

/// True when the expression references any goal
pub fn mentions_goal(exp: &Exp, goals: &[IdPat]) -> bool {
    exp.free_vars().iter().any(|v| goals.contains(v))
}

/// True when `exp` contains a `nonEmpty` application anywhere
pub fn contains_exists(exp: &Exp) -> bool {
    struct Finder {
        found: bool,
    }
    impl Walk for Finder {
        fn visit_exp(&mut self, exp: &Exp) {
            if self.found {
                return;
            }
            if matches!(exp.as_apply1(), Some((BuiltIn::NonEmpty, _))) {
                self.found = true;
                return;
            }
            walk_exp(self, exp);
        }
    }
    let mut finder = Finder { found: false };
    finder.visit_exp(exp);
    finder.found
}

/// Bind a pattern's leaves to projections of a value expression
pub fn destructure(pat: &Pat, value: &Exp) -> Option<HashMap<IdPat, Exp>> {
    let mut map = HashMap::new();
    destructure_into(pat, value, &mut map)?;
    Some(map)
}

fn destructure_into(pat: &Pat, value: &Exp, map: &mut HashMap<IdPat, Exp>) -> Option<()> {
    match pat {
        Pat::Id(id) => {
            map.insert(id.clone(), value.clone());
            Some(())
        }
        Pat::Wildcard(_) => Some(()),
        Pat::Tuple(ps) => {
            if let Exp::Tuple(es) = value {
                if es.len() == ps.len() {
                    for (p, e) in ps.iter().zip(es) {
                        destructure_into(p, e, map)?;
                    }
                    return Some(());
                }
            }
            for (i, p) in ps.iter().enumerate() {
                destructure_into(p, &Exp::select(i, value.clone()), map)?;
            }
            Some(())
        }
        Pat::Record(fields) => {
            for (slot, (label, p)) in fields.iter().enumerate() {
                let field_value = match value {
                    Exp::Record(vs) => vs
                        .iter()
                        .find(|(l, _)| l == label)
                        .map(|(_, e)| e.clone())?,
                    _ => Exp::select(slot, value.clone()),
                };
                destructure_into(p, &field_value, map)?;
            }
            Some(())
        }
        Pat::As { id, pat } => {
            map.insert(id.clone(), value.clone());
            destructure_into(pat, value, map)
        }
        Pat::Literal(_) | Pat::Ctor { .. } => None,
    }
}

/// The goal tuple pattern: a single id or a tuple of ids
fn goals_pat(goals: &[IdPat]) -> Pat {
    if let [single] = goals {
        Pat::Id(single.clone())
    } else {
        Pat::Tuple(goals.iter().cloned().map(Pat::Id).collect())
    }
}

/// Set equality of id lists
fn same_ids(a: &[IdPat], b: &[IdPat]) -> bool {
    a.len() == b.len() && a.iter().all(|id| b.contains(id))
}

/// Tuple-of-ids expression for a pattern, when it has that shape
fn pat_to_exp(pat: &Pat) -> Option<Exp> {
    match pat {
        Pat::Id(id) => Some(Exp::id(id)),
        Pat::Tuple(ps) => {
            let items: Option<Vec<Exp>> = ps.iter().map(pat_to_exp).collect();
            Some(Exp::Tuple(items?))
        }
        _ => None,
    }
}

/// `substring (s, start, len)`
fn substring(s: Exp, start: Exp, len: Exp) -> Exp {
    let arg_ty = Type::Tuple(vec![Type::String, Type::Int, Type::Int]);
    Exp::Apply {
        func: Box::new(Exp::Builtin(
            BuiltIn::Substring,
            Type::func(arg_ty, Type::String),
        )),
        arg: Box::new(Exp::Tuple(vec![s, start, len])),
        ty: Type::String,
    }
}

fn vertex_of(pair_ty: &Type, slot: usize) -> Type {
    pair_ty.nth_field(slot).cloned().unwrap_or(Type::Unit)
}
