//! # Query Expander
//!
//! Top-level driver of the grounding pipeline. For a `from` expression with
//! unbounded scans it runs four passes:
//!
//! 1. **Deduce.** Install an extent generator for every leaf of every
//!    unbounded scan, collect candidates from the extent analyzer, then run
//!    the generator-improvement loop: every `where` conjunct is offered to
//!    the predicate inverter, and a generator is replaced whenever inversion
//!    produces one with strictly lower cardinality. The loop is bounded by
//!    `max_refinement_passes`.
//! 2. **Step-variable analysis.** A binding is *used* when a later step
//!    references it (or the query implicitly re-exports it); unused bindings
//!    need no generator.
//! 3. **Check.** Every used unbounded leaf must have a non-INFINITE
//!    generator, otherwise `UngroundedPattern`.
//! 4. **Rebuild.** Walk the steps with a fresh builder: each unbounded scan
//!    becomes a sequence of generator scans in dependency order, `where`
//!    steps are simplified against the chosen generators' constraints, and
//!    every other step passes through.
//!
//! Running the expander on an already-grounded query is a no-op.

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};

use crate::error::{GroundError, GroundResult};
use crate::extent::{self, ExtentAnalysis};
use crate::generator::{Cardinality, Generator};
use crate::inverter::{GeneratorMap, Inverter};
use crate::ir::{BuiltIn, Exp, FromExp, IdPat, NameGen, Pat, Step};
use crate::ir_builder::FromBuilder;
use crate::range_set::RangeSet;
use crate::registry::FunctionRegistry;
use crate::types::Type;

/// The query expander
pub struct QueryExpander<'a> {
    registry: &'a FunctionRegistry,
    names: &'a mut NameGen,
    max_refinement_passes: usize,
}

/// Generator arena: ids map into `gens`; several ids may share one entry
/// when a joint inversion binds a tuple of goals.
#[derive(Debug, Default)]
struct Grounding {
    gens: Vec<Generator>,
    by_id: HashMap<IdPat, usize>,
}

impl Grounding {
    fn install(&mut self, gen: Generator) {
        let idx = self.gens.len();
        let members: Vec<IdPat> = gen.pat.expand().into_iter().cloned().collect();
        self.gens.push(gen);
        for id in members {
            self.by_id.insert(id, idx);
        }
    }

    fn get(&self, id: &IdPat) -> Option<&Generator> {
        self.by_id.get(id).map(|&i| &self.gens[i])
    }

    /// Replace the generator for one id; only valid when the current
    /// generator binds just that id.
    fn replace_single(&mut self, id: &IdPat, gen: Generator) {
        self.install(gen);
        let idx = self.gens.len() - 1;
        self.by_id.insert(id.clone(), idx);
    }

    fn as_map(&self) -> GeneratorMap {
        self.by_id
            .iter()
            .map(|(id, &i)| (id.clone(), self.gens[i].clone()))
            .collect()
    }
}

impl<'a> QueryExpander<'a> {
    pub fn new(
        registry: &'a FunctionRegistry,
        names: &'a mut NameGen,
        max_refinement_passes: usize,
    ) -> QueryExpander<'a> {
        QueryExpander {
            registry,
            names,
            max_refinement_passes,
        }
    }

    /// Ground every unbounded scan of `from`. Queries without unbounded
    /// scans are returned unchanged, so expansion is idempotent.
    pub fn expand(&mut self, from: &FromExp) -> GroundResult<FromExp> {
        if !from.has_unbounded_scan() {
            return Ok(from.clone());
        }

        // ---- pass 1: deduce ----
        let mut grounding = Grounding::default();
        let mut bound: HashSet<IdPat> = HashSet::new();
        let mut wheres: Vec<Exp> = Vec::new();
        let mut scan_analyses: HashMap<usize, ExtentAnalysis> = HashMap::new();
        let mut unbounded_leaves: Vec<IdPat> = Vec::new();

        for step in &from.steps {
            match step {
                Step::Scan { pat, exp, .. } if exp.is_infinite_extent() => {
                    if let Pat::Tuple(_) = pat {
                        // every destructuring position of an unbounded scan
                        // must be an id the analysis can key generators on
                        pat.flatten_ids("unbounded scan")?;
                    }
                    for leaf in pat.expand() {
                        unbounded_leaves.push(leaf.clone());
                        grounding.install(Generator::extent(
                            Pat::Id(leaf.clone()),
                            RangeSet::full(),
                            self.names,
                        ));
                    }
                }
                Step::Scan { pat, .. } => {
                    bound.extend(pat.expand().into_iter().cloned());
                }
                Step::Where(e) => {
                    wheres.extend(e.conjuncts().into_iter().cloned());
                }
                _ => {}
            }
        }

        // extent analysis per unbounded scan, over the predicates that
        // follow it
        for (i, step) in from.steps.iter().enumerate() {
            let Step::Scan { pat, exp, .. } = step else {
                continue;
            };
            if !exp.is_infinite_extent() {
                continue;
            }
            let following: Vec<Exp> = from.steps[i + 1..]
                .iter()
                .filter_map(|s| match s {
                    Step::Where(e) => Some(e.clone()),
                    _ => None,
                })
                .flat_map(|e| e.conjuncts().into_iter().cloned().collect::<Vec<_>>())
                .collect();
            let analysis = extent::analyze(pat, &following, &bound, self.names);
            self.install_candidates(&mut grounding, &analysis);
            scan_analyses.insert(i, analysis);
        }

        self.improvement_loop(&mut grounding, &unbounded_leaves, &wheres);

        // ---- pass 2: step-variable analysis ----
        let used = used_leaves(from, &grounding);

        // ---- pass 3: check ----
        for leaf in &unbounded_leaves {
            if !used.contains(leaf) {
                trace!(leaf = %leaf, "unused unbounded leaf needs no generator");
                continue;
            }
            let gen = grounding.get(leaf).ok_or_else(|| GroundError::Internal(
                format!("no generator installed for '{leaf}'"),
            ))?;
            if !gen.is_finite() {
                // a recursive call that failed closure analysis is reported
                // as the non-invertible base case, not as a missing bound
                if let Some(closure) = failed_closure(&wheres, leaf, self.registry) {
                    return Err(GroundError::NotInvertible(closure.to_string()));
                }
                return Err(GroundError::UngroundedPattern {
                    pattern: leaf.name.clone(),
                    reason: format!(
                        "no predicate bounds it after {} refinement passes",
                        self.max_refinement_passes
                    ),
                });
            }
        }

        // ---- pass 4: rebuild ----
        self.rebuild(from, &grounding, &scan_analyses, &used)
    }

    /// Turn extent-analysis candidates into installed generators, keeping
    /// the best cardinality per leaf. Definitions beat extents; slot
    /// definitions ground progressive records.
    fn install_candidates(&mut self, grounding: &mut Grounding, analysis: &ExtentAnalysis) {
        // auxiliary ids first: leaves may depend on them
        for r in &analysis.aux_ids {
            if let Some(pairs) = analysis.extents.get(r) {
                if let Some(reduced) = extent::reduce_and(pairs) {
                    if let Some(gen) = self.generator_from_extent(Pat::Id(r.clone()), reduced) {
                        grounding.install(gen);
                    }
                }
            }
        }

        let leaves: Vec<IdPat> = analysis
            .extents
            .keys()
            .chain(analysis.definitions.keys())
            .chain(analysis.slot_definitions.keys())
            .filter(|id| !analysis.aux_ids.contains(id))
            .cloned()
            .collect();

        for leaf in leaves {
            let current = grounding.get(&leaf).map(|g| g.cardinality);
            let candidate = self.best_candidate(&leaf, analysis);
            if let Some(gen) = candidate {
                if current.map_or(true, |c| gen.cardinality < c) {
                    debug!(leaf = %leaf, cardinality = ?gen.cardinality, "extent candidate installed");
                    grounding.replace_single(&leaf, gen);
                }
            }
        }
    }

    fn best_candidate(&mut self, leaf: &IdPat, analysis: &ExtentAnalysis) -> Option<Generator> {
        // a definition is a point generator, the strongest candidate
        if let Some(value) = analysis.definitions.get(leaf) {
            let eq = Exp::call2(BuiltIn::OpEq, Exp::id(leaf), value.clone());
            let eq_rev = Exp::call2(BuiltIn::OpEq, value.clone(), Exp::id(leaf));
            return Some(
                Generator::point(Pat::Id(leaf.clone()), value.clone())
                    .with_constraint(eq)
                    .with_constraint(eq_rev),
            );
        }

        if let Some(pairs) = analysis.extents.get(leaf) {
            if let Some(reduced) = extent::reduce_and(pairs) {
                if let Some(gen) = self.generator_from_extent(Pat::Id(leaf.clone()), reduced) {
                    if gen.is_finite() {
                        return Some(gen);
                    }
                }
            }
        }

        // slot definitions ground a progressive record leaf by constructing
        // the known fields
        if let Some(slots) = analysis.slot_definitions.get(leaf) {
            if let Type::Record {
                fields,
                progressive: true,
            } = &leaf.ty
            {
                let labels: Vec<String> = fields.keys().cloned().collect();
                let mut known: Vec<(String, Exp)> = Vec::new();
                let mut constraints = Vec::new();
                for (&slot, value) in slots {
                    let label = labels.get(slot)?;
                    known.push((label.clone(), value.clone()));
                    let sel = Exp::select(slot, Exp::id(leaf));
                    constraints.push(Exp::call2(BuiltIn::OpEq, sel.clone(), value.clone()));
                    constraints.push(Exp::call2(BuiltIn::OpEq, value.clone(), sel));
                }
                let mut gen = Generator::point(Pat::Id(leaf.clone()), Exp::Record(known));
                for c in constraints {
                    gen = gen.with_constraint(c);
                }
                return Some(gen);
            }
        }

        None
    }

    /// Lower a reduced extent to a generator whose constraints are the
    /// filters the extent enforces. Residual filters stay in the query.
    fn generator_from_extent(&mut self, pat: Pat, reduced: extent::Reduced) -> Option<Generator> {
        let mut gen = match reduced.extent {
            Exp::Extent { ranges, .. } => Generator::extent(pat, ranges, self.names),
            collection => Generator::collection(pat, collection).ok()?,
        };
        for c in reduced.enforced {
            if !c.is_literal_true() {
                gen = gen.with_constraint(c);
            }
        }
        Some(gen)
    }

    /// Offer every `where` conjunct to the inverter until no generator
    /// improves or the pass budget runs out.
    fn improvement_loop(
        &mut self,
        grounding: &mut Grounding,
        unbounded_leaves: &[IdPat],
        wheres: &[Exp],
    ) {
        for pass in 0..self.max_refinement_passes {
            let mut changed = false;
            for conjunct in wheres {
                let free = conjunct.free_vars();
                let infinite: Vec<IdPat> = unbounded_leaves
                    .iter()
                    .filter(|leaf| {
                        free.contains(leaf)
                            && grounding
                                .get(leaf)
                                .map_or(false, |g| g.cardinality == Cardinality::Infinite)
                    })
                    .cloned()
                    .collect();
                if infinite.is_empty() {
                    continue;
                }

                let existing = grounding.as_map();
                let mut inverter = Inverter::new(self.registry, self.names);

                // joint inversion of all still-infinite goals in the conjunct
                if let Some(inv) = inverter.invert(conjunct, &infinite, &existing) {
                    if inv.generator.is_finite() {
                        debug!(
                            pass,
                            goals = infinite.len(),
                            cardinality = ?inv.generator.cardinality,
                            "generator improved"
                        );
                        grounding.install(inv.generator);
                        changed = true;
                        continue;
                    }
                }

                // per-goal inversion
                for goal in &infinite {
                    if grounding
                        .get(goal)
                        .map_or(true, |g| g.cardinality != Cardinality::Infinite)
                    {
                        continue;
                    }
                    if let Some(inv) = inverter.invert(conjunct, &[goal.clone()], &existing) {
                        if inv.generator.is_finite() {
                            debug!(pass, goal = %goal, "generator improved");
                            grounding.replace_single(goal, inv.generator);
                            changed = true;
                        }
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// When a generator binds more patterns than are used downstream, wrap
    /// it so only the used ones survive: `from (all) in gen yield (used)
    /// distinct`.
    fn project_unused(&mut self, gen: Generator, used: &HashSet<IdPat>) -> GroundResult<Generator> {
        let members: Vec<IdPat> = gen.pat.expand().into_iter().cloned().collect();
        let kept: Vec<IdPat> = members
            .iter()
            .filter(|m| used.contains(*m))
            .cloned()
            .collect();
        if kept.len() == members.len() || kept.is_empty() {
            return Ok(gen);
        }
        let mut fb = FromBuilder::new();
        fb.scan(gen.pat.clone(), gen.exp.clone())
            .map_err(|e| GroundError::Internal(format!("projection scan rejected: {e}")))?;
        let yield_exp = if let [single] = kept.as_slice() {
            Exp::id(single)
        } else {
            Exp::Tuple(kept.iter().map(Exp::id).collect())
        };
        fb.yield_(yield_exp);
        fb.distinct();
        let pat = if let [single] = kept.as_slice() {
            Pat::Id(single.clone())
        } else {
            Pat::Tuple(kept.iter().cloned().map(Pat::Id).collect())
        };
        let exp = Exp::From(Box::new(fb.build()));
        let free_vars = exp.free_vars();
        Ok(Generator {
            pat,
            exp,
            cardinality: gen.cardinality,
            constraints: gen.constraints,
            free_vars,
        })
    }

    fn rebuild(
        &mut self,
        from: &FromExp,
        grounding: &Grounding,
        scan_analyses: &HashMap<usize, ExtentAnalysis>,
        used: &HashSet<IdPat>,
    ) -> GroundResult<FromExp> {
        let mut fb = FromBuilder::new();
        let mut emitted: HashSet<usize> = HashSet::new();
        let mut bound: HashSet<IdPat> = HashSet::new();
        let mut original_bindings: Vec<IdPat> = Vec::new();
        let has_projection = from
            .steps
            .iter()
            .any(|s| matches!(s, Step::Yield(_) | Step::Group { .. }));

        for (i, step) in from.steps.iter().enumerate() {
            match step {
                Step::Scan { pat, exp, .. } if exp.is_infinite_extent() => {
                    original_bindings.extend(pat.expand().into_iter().cloned());
                    let group = scan_group(pat, grounding, used, &emitted);
                    let ordered = topo_sort(group, grounding, &bound)?;
                    for idx in ordered {
                        if emitted.contains(&idx) {
                            continue;
                        }
                        let gen = coalesce(idx, grounding, used, &mut emitted)
                            .unwrap_or_else(|| grounding.gens[idx].clone());
                        let gen = self.project_unused(gen, used)?;
                        bound.extend(gen.pat.expand().into_iter().cloned());
                        emitted.insert(idx);
                        fb.scan(gen.pat.clone(), gen.exp.clone()).map_err(|e| {
                            GroundError::Internal(format!("rebuilt scan rejected: {e}"))
                        })?;
                    }
                    if let Some(analysis) = scan_analyses.get(&i) {
                        for filter in &analysis.aux_filters {
                            let free = filter.free_vars();
                            let relevant = free
                                .iter()
                                .all(|v| !grounding.by_id.contains_key(v) || bound.contains(v));
                            if relevant {
                                fb.where_(filter.clone());
                            }
                        }
                    }
                }
                Step::Scan {
                    pat,
                    exp,
                    condition,
                } => {
                    original_bindings.extend(pat.expand().into_iter().cloned());
                    bound.extend(pat.expand().into_iter().cloned());
                    fb.scan_on(pat.clone(), exp.clone(), condition.clone())
                        .map_err(|e| {
                            GroundError::Internal(format!("rebuilt scan rejected: {e}"))
                        })?;
                }
                Step::Where(e) => {
                    let kept: Vec<Exp> = e
                        .conjuncts()
                        .into_iter()
                        .filter(|c| !absorbed(c, grounding, &emitted))
                        .cloned()
                        .collect();
                    fb.where_(Exp::and_all(kept));
                }
                Step::Yield(e) => {
                    fb.yield_(e.clone());
                }
                Step::Group { keys, aggregates } => {
                    fb.group(keys.clone(), aggregates.clone());
                }
                Step::Order(keys) => {
                    fb.order(keys.clone());
                }
                Step::Union { distinct, others } => {
                    fb.union(*distinct, others.clone())
                        .map_err(|e| GroundError::Internal(format!("rebuilt union: {e}")))?;
                }
                Step::Distinct => {
                    fb.distinct();
                }
            }
        }

        // auxiliary scans can widen the implicit re-export; restore the
        // original shape with an explicit yield
        if !has_projection && fb.bindings() != original_bindings.as_slice() {
            let original_used: Vec<IdPat> = original_bindings
                .iter()
                .filter(|b| used.contains(*b) || !grounding.by_id.contains_key(*b))
                .cloned()
                .collect();
            let yield_exp = if let [single] = original_used.as_slice() {
                Exp::id(single)
            } else {
                Exp::Record(
                    original_used
                        .iter()
                        .map(|id| (id.name.clone(), Exp::id(id)))
                        .collect(),
                )
            };
            fb.yield_(yield_exp);
        }

        let rebuilt = fb.build();
        debug!(
            steps_in = from.steps.len(),
            steps_out = rebuilt.steps.len(),
            "query rebuilt"
        );
        Ok(rebuilt)
    }
}

/// Leaves referenced by a later step, transitively closed over generator
/// dependencies. When the query has no yield or group, every binding is
/// implicitly re-exported and therefore used.
fn used_leaves(from: &FromExp, grounding: &Grounding) -> HashSet<IdPat> {
    let has_projection = from
        .steps
        .iter()
        .any(|s| matches!(s, Step::Yield(_) | Step::Group { .. }));

    let mut used: HashSet<IdPat> = HashSet::new();
    if !has_projection {
        for step in &from.steps {
            if let Step::Scan { pat, .. } = step {
                used.extend(pat.expand().into_iter().cloned());
            }
        }
    }
    for step in &from.steps {
        let exprs: Vec<&Exp> = match step {
            Step::Scan { exp, condition, .. } => {
                std::iter::once(exp).chain(condition.iter()).collect()
            }
            Step::Where(e) | Step::Yield(e) => vec![e],
            Step::Group { keys, aggregates } => keys
                .iter()
                .map(|(_, e)| e)
                .chain(aggregates.iter().map(|a| &a.exp))
                .collect(),
            Step::Order(keys) => keys.iter().map(|k| &k.exp).collect(),
            Step::Union { others, .. } => others.iter().collect(),
            Step::Distinct => Vec::new(),
        };
        for e in exprs {
            used.extend(e.free_vars());
        }
    }

    // close over generator dependencies: a used leaf's generator may
    // reference auxiliary ids or other leaves
    let mut frontier: Vec<IdPat> = used.iter().cloned().collect();
    while let Some(id) = frontier.pop() {
        if let Some(gen) = grounding.get(&id) {
            for dep in &gen.free_vars {
                if grounding.by_id.contains_key(dep) && used.insert(dep.clone()) {
                    frontier.push(dep.clone());
                }
            }
        }
    }

    used
}

/// Generator indices an unbounded scan must materialize: those of its used
/// leaves plus transitive dependencies not yet emitted.
fn scan_group(
    pat: &Pat,
    grounding: &Grounding,
    used: &HashSet<IdPat>,
    emitted: &HashSet<usize>,
) -> Vec<usize> {
    let mut group: Vec<usize> = Vec::new();
    let mut frontier: Vec<IdPat> = pat
        .expand()
        .into_iter()
        .filter(|leaf| used.contains(*leaf))
        .cloned()
        .collect();
    while let Some(id) = frontier.pop() {
        let Some(&idx) = grounding.by_id.get(&id) else {
            continue;
        };
        if emitted.contains(&idx) || group.contains(&idx) {
            continue;
        }
        group.push(idx);
        for dep in &grounding.gens[idx].free_vars {
            if grounding.by_id.contains_key(dep) {
                frontier.push(dep.clone());
            }
        }
    }
    group
}

/// A where conjunct that calls a recursive function over the leaf: if the
/// leaf is still infinite, that closure's base case did not invert.
fn failed_closure<'a>(
    wheres: &'a [Exp],
    leaf: &IdPat,
    registry: &FunctionRegistry,
) -> Option<&'a Exp> {
    wheres.iter().find(|conjunct| {
        let Exp::Apply { func, arg, .. } = conjunct else {
            return false;
        };
        let Exp::Id(f) = func.as_ref() else {
            return false;
        };
        let recursive = registry
            .lookup(f)
            .map_or(false, |info| info.status == crate::registry::FnStatus::Recursive);
        recursive && arg.free_vars().contains(leaf)
    })
}

/// A conjunct is absorbed when an emitted generator's constraints entail it
fn absorbed(conjunct: &Exp, grounding: &Grounding, emitted: &HashSet<usize>) -> bool {
    emitted
        .iter()
        .any(|&i| grounding.gens[i].simplify(conjunct).is_literal_true())
}

/// Order generator indices so that each generator's dependencies on other
/// grounded ids come first. Outer-scope variables are always satisfied.
fn topo_sort(
    mut group: Vec<usize>,
    grounding: &Grounding,
    already_bound: &HashSet<IdPat>,
) -> GroundResult<Vec<usize>> {
    let group_ids: HashSet<IdPat> = group
        .iter()
        .flat_map(|&i| grounding.gens[i].pat.expand().into_iter().cloned())
        .collect();
    let mut bound: HashSet<IdPat> = already_bound.clone();
    let mut ordered = Vec::with_capacity(group.len());
    while !group.is_empty() {
        let pos = group
            .iter()
            .position(|&i| {
                grounding.gens[i]
                    .free_vars
                    .iter()
                    .all(|v| !group_ids.contains(v) || bound.contains(v))
            })
            .ok_or_else(|| {
                GroundError::Internal("cyclic dependency between generators".to_string())
            })?;
        let idx = group.remove(pos);
        bound.extend(grounding.gens[idx].pat.expand().into_iter().cloned());
        ordered.push(idx);
    }
    Ok(ordered)
}

/// Fold an auxiliary parent and its slot projections back into one scan:
/// `r in c` with `x = #1 r`, `y = #2 r` covering every slot in order becomes
/// `(x, y) in c`.
fn coalesce(
    idx: usize,
    grounding: &Grounding,
    used: &HashSet<IdPat>,
    emitted: &mut HashSet<usize>,
) -> Option<Generator> {
    let parent_gen = &grounding.gens[idx];
    let Pat::Id(parent) = &parent_gen.pat else {
        return None;
    };
    let slot_count = parent.ty.field_count();
    if slot_count == 0 || !matches!(parent_gen.exp.ty(), Type::List(_) | Type::Bag(_)) {
        return None;
    }

    // find a slot projection child for every slot
    let mut children: Vec<Option<(IdPat, usize)>> = vec![None; slot_count];
    for (id, &child_idx) in &grounding.by_id {
        if child_idx == idx || emitted.contains(&child_idx) {
            continue;
        }
        let child = &grounding.gens[child_idx];
        if child.pat != Pat::Id(id.clone()) {
            continue;
        }
        let Some([Exp::Select { slot, input }]) = child.exp.as_collection_literal() else {
            continue;
        };
        if matches!(input.as_ref(), Exp::Id(p) if p == parent) && *slot < slot_count {
            children[*slot] = Some((id.clone(), child_idx));
        }
    }
    let children: Option<Vec<(IdPat, usize)>> = children.into_iter().collect();
    let children = children?;
    if !children.iter().all(|(id, _)| used.contains(id)) {
        return None;
    }

    let pat = Pat::Tuple(children.iter().map(|(id, _)| Pat::Id(id.clone())).collect());
    if pat.ty() != *parent_gen.exp.ty().element_type()? {
        return None;
    }
    let mut constraints = parent_gen.constraints.clone();
    for (_, child_idx) in &children {
        constraints.extend(grounding.gens[*child_idx].constraints.iter().cloned());
        emitted.insert(*child_idx);
    }
    Some(Generator {
        pat,
        exp: parent_gen.exp.clone(),
        cardinality: parent_gen.cardinality,
        constraints,
        free_vars: parent_gen.free_vars.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_id(name: &str, ordinal: u32) -> IdPat {
        IdPat::new(name, ordinal, Type::Int)
    }

    fn expand_query(from: FromExp) -> GroundResult<FromExp> {
        let registry = FunctionRegistry::new();
        let mut names = NameGen::starting_at(1000);
        let mut expander = QueryExpander::new(&registry, &mut names, 3);
        expander.expand(&from)
    }

    fn unbounded_scan(id: &IdPat) -> Step {
        Step::Scan {
            pat: Pat::Id(id.clone()),
            exp: Exp::extent(id.ty.clone()),
            condition: None,
        }
    }

    #[test]
    fn test_simple_member() {
        // from x where x elem [1, 2, 3]  ->  from x in [1, 2, 3]
        let x = int_id("x", 0);
        let coll = Exp::list_of(
            Type::Int,
            vec![Exp::int(1), Exp::int(2), Exp::int(3)],
        );
        let from = FromExp {
            steps: vec![
                unbounded_scan(&x),
                Step::Where(Exp::call2(BuiltIn::Elem, Exp::id(&x), coll.clone())),
            ],
            ty: Type::bag(Type::Int),
        };

        let out = expand_query(from).expect("grounds");
        assert_eq!(out.steps.len(), 1);
        let Step::Scan { pat, exp, .. } = &out.steps[0] else {
            panic!("expected a scan");
        };
        assert_eq!(pat, &Pat::Id(x));
        assert_eq!(exp, &coll);
    }

    #[test]
    fn test_tuple_member() {
        // from (x, y) where (x, y) elem pairs  ->  from (x, y) in pairs
        let x = int_id("x", 0);
        let y = int_id("y", 1);
        let pair = Type::Tuple(vec![Type::Int, Type::Int]);
        let coll = Exp::list_of(
            pair.clone(),
            vec![
                Exp::Tuple(vec![Exp::int(1), Exp::int(2)]),
                Exp::Tuple(vec![Exp::int(3), Exp::int(4)]),
            ],
        );
        let from = FromExp {
            steps: vec![
                Step::Scan {
                    pat: Pat::Tuple(vec![Pat::Id(x.clone()), Pat::Id(y.clone())]),
                    exp: Exp::extent(pair),
                    condition: None,
                },
                Step::Where(Exp::call2(
                    BuiltIn::Elem,
                    Exp::Tuple(vec![Exp::id(&x), Exp::id(&y)]),
                    coll.clone(),
                )),
            ],
            ty: Type::bag(Type::Tuple(vec![Type::Int, Type::Int])),
        };

        let out = expand_query(from).expect("grounds");
        assert_eq!(out.steps.len(), 1, "steps: {:?}", out.steps);
        let Step::Scan { pat, exp, .. } = &out.steps[0] else {
            panic!("expected a scan");
        };
        assert_eq!(pat, &Pat::Tuple(vec![Pat::Id(x), Pat::Id(y)]));
        assert_eq!(exp, &coll);
    }

    #[test]
    fn test_range() {
        // from x where x > 2 andalso x < 7 -> scan over tabulate (4, ...)
        let x = int_id("x", 0);
        let from = FromExp {
            steps: vec![
                unbounded_scan(&x),
                Step::Where(Exp::and(
                    Exp::call2(BuiltIn::OpGt, Exp::id(&x), Exp::int(2)),
                    Exp::call2(BuiltIn::OpLt, Exp::id(&x), Exp::int(7)),
                )),
            ],
            ty: Type::bag(Type::Int),
        };

        let out = expand_query(from).expect("grounds");
        assert_eq!(out.steps.len(), 1);
        let Step::Scan { exp, .. } = &out.steps[0] else {
            panic!("expected a scan");
        };
        let (op, count, _) = exp.as_apply2().expect("tabulate");
        assert_eq!(op, BuiltIn::ListTabulate);
        assert_eq!(count, &Exp::int(4));
    }

    #[test]
    fn test_empty_range_is_not_an_error() {
        // x > 7 andalso x < 2: empty generator, no error
        let x = int_id("x", 0);
        let from = FromExp {
            steps: vec![
                unbounded_scan(&x),
                Step::Where(Exp::and(
                    Exp::call2(BuiltIn::OpGt, Exp::id(&x), Exp::int(7)),
                    Exp::call2(BuiltIn::OpLt, Exp::id(&x), Exp::int(2)),
                )),
            ],
            ty: Type::bag(Type::Int),
        };

        let out = expand_query(from).expect("grounds");
        let Step::Scan { exp, .. } = &out.steps[0] else {
            panic!("expected a scan");
        };
        let (op, _, _) = exp.as_apply2().expect("tabulate");
        assert_eq!(op, BuiltIn::ListTabulate);
    }

    #[test]
    fn test_empty_collection_is_not_an_error() {
        let x = int_id("x", 0);
        let from = FromExp {
            steps: vec![
                unbounded_scan(&x),
                Step::Where(Exp::call2(
                    BuiltIn::Elem,
                    Exp::id(&x),
                    Exp::bag_of(Type::Int, vec![]),
                )),
            ],
            ty: Type::bag(Type::Int),
        };
        let out = expand_query(from).expect("grounds");
        assert_eq!(out.steps.len(), 1);
    }

    #[test]
    fn test_ungrounded() {
        // from x where x > 5: no finite upper bound
        let x = int_id("x", 0);
        let from = FromExp {
            steps: vec![
                unbounded_scan(&x),
                Step::Where(Exp::call2(BuiltIn::OpGt, Exp::id(&x), Exp::int(5))),
            ],
            ty: Type::bag(Type::Int),
        };

        let err = expand_query(from).expect_err("must not ground");
        assert!(matches!(err, GroundError::UngroundedPattern { .. }));
    }

    #[test]
    fn test_no_predicate_at_all() {
        let x = int_id("x", 0);
        let from = FromExp {
            steps: vec![unbounded_scan(&x)],
            ty: Type::bag(Type::Int),
        };
        let err = expand_query(from).expect_err("must not ground");
        assert!(matches!(err, GroundError::UngroundedPattern { .. }));
    }

    #[test]
    fn test_bounded_scan_untouched() {
        let x = int_id("x", 0);
        let coll = Exp::list_of(Type::Int, vec![Exp::int(1)]);
        let from = FromExp {
            steps: vec![Step::Scan {
                pat: Pat::Id(x.clone()),
                exp: coll.clone(),
                condition: None,
            }],
            ty: Type::bag(Type::Int),
        };
        let out = expand_query(from.clone()).expect("no-op");
        assert_eq!(out, from);
    }

    #[test]
    fn test_idempotent() {
        let x = int_id("x", 0);
        let coll = Exp::list_of(Type::Int, vec![Exp::int(1), Exp::int(2)]);
        let from = FromExp {
            steps: vec![
                unbounded_scan(&x),
                Step::Where(Exp::call2(BuiltIn::Elem, Exp::id(&x), coll)),
            ],
            ty: Type::bag(Type::Int),
        };
        let once = expand_query(from).expect("grounds");
        let twice = expand_query(once.clone()).expect("still grounds");
        assert_eq!(once, twice);
    }

    #[test]
    fn test_definition_with_previously_bound() {
        // from d in depts, e where e = d + 1: e grounded by its definition
        let d = int_id("d", 0);
        let e = int_id("e", 1);
        let depts = Exp::list_of(Type::Int, vec![Exp::int(10), Exp::int(20)]);
        let def = Exp::call2(
            BuiltIn::OpEq,
            Exp::id(&e),
            Exp::call2(BuiltIn::OpPlus, Exp::id(&d), Exp::int(1)),
        );
        let from = FromExp {
            steps: vec![
                Step::Scan {
                    pat: Pat::Id(d.clone()),
                    exp: depts,
                    condition: None,
                },
                unbounded_scan(&e),
                Step::Where(def),
            ],
            ty: Type::bag(Type::record(
                vec![("d".to_string(), Type::Int), ("e".to_string(), Type::Int)],
                false,
            )),
        };

        let out = expand_query(from).expect("grounds");
        // d's scan, then e's point scan; the where is absorbed
        let scans: Vec<&Step> = out
            .steps
            .iter()
            .filter(|s| matches!(s, Step::Scan { .. }))
            .collect();
        assert_eq!(scans.len(), 2);
        assert!(!out
            .steps
            .iter()
            .any(|s| matches!(s, Step::Where(_))));
    }

    #[test]
    fn test_record_slot_definition_grounds_progressive_record() {
        // from d in depts, e where e.deptno = d: e is a progressive record
        let emp = Type::record(vec![("deptno".to_string(), Type::Int)], true);
        let d = int_id("d", 0);
        let e = IdPat::new("e", 1, emp.clone());
        let depts = Exp::list_of(Type::Int, vec![Exp::int(10)]);
        let from = FromExp {
            steps: vec![
                Step::Scan {
                    pat: Pat::Id(d.clone()),
                    exp: depts,
                    condition: None,
                },
                Step::Scan {
                    pat: Pat::Id(e.clone()),
                    exp: Exp::extent(emp),
                    condition: None,
                },
                Step::Where(Exp::call2(
                    BuiltIn::OpEq,
                    Exp::select(0, Exp::id(&e)),
                    Exp::id(&d),
                )),
            ],
            ty: Type::bag(Type::Int),
        };

        let out = expand_query(from).expect("e is grounded by the field definition");
        assert!(!out
            .steps
            .iter()
            .any(|s| matches!(s, Step::Scan { exp, .. } if exp.is_infinite_extent())));
    }

    #[test]
    fn test_unused_unbounded_leaf_is_dropped() {
        // from x, u where x elem [1] yield x: u is never used
        let x = int_id("x", 0);
        let u = int_id("u", 1);
        let from = FromExp {
            steps: vec![
                unbounded_scan(&x),
                unbounded_scan(&u),
                Step::Where(Exp::call2(
                    BuiltIn::Elem,
                    Exp::id(&x),
                    Exp::list_of(Type::Int, vec![Exp::int(1)]),
                )),
                Step::Yield(Exp::id(&x)),
            ],
            ty: Type::bag(Type::Int),
        };

        let out = expand_query(from).expect("u needs no generator");
        // only x's scan survives
        let scans: Vec<&Step> = out
            .steps
            .iter()
            .filter(|s| matches!(s, Step::Scan { .. }))
            .collect();
        assert_eq!(scans.len(), 1);
    }

    #[test]
    fn test_scan_order_respects_dependencies() {
        // from x, y where y = x + 1 andalso x elem [1, 2]
        let x = int_id("x", 0);
        let y = int_id("y", 1);
        let from = FromExp {
            steps: vec![
                unbounded_scan(&y),
                unbounded_scan(&x),
                Step::Where(Exp::and(
                    Exp::call2(
                        BuiltIn::OpEq,
                        Exp::id(&y),
                        Exp::call2(BuiltIn::OpPlus, Exp::id(&x), Exp::int(1)),
                    ),
                    Exp::call2(
                        BuiltIn::Elem,
                        Exp::id(&x),
                        Exp::list_of(Type::Int, vec![Exp::int(1), Exp::int(2)]),
                    ),
                )),
            ],
            ty: Type::bag(Type::record(
                vec![("x".to_string(), Type::Int), ("y".to_string(), Type::Int)],
                false,
            )),
        };

        let out = expand_query(from).expect("grounds");
        let scan_pats: Vec<&Pat> = out
            .steps
            .iter()
            .filter_map(|s| match s {
                Step::Scan { pat, .. } => Some(pat),
                _ => None,
            })
            .collect();
        // x's collection scan must precede y's dependent point scan
        let x_pos = scan_pats
            .iter()
            .position(|p| **p == Pat::Id(x.clone()))
            .expect("x scanned");
        let y_pos = scan_pats
            .iter()
            .position(|p| **p == Pat::Id(y.clone()))
            .expect("y scanned");
        assert!(x_pos < y_pos);
    }

    #[test]
    fn test_literal_ne_filter_not_absorbed() {
        // from x where x elem [1,2,3] andalso x <> 2: membership absorbed,
        // inequality kept
        let x = int_id("x", 0);
        let ne = Exp::call2(BuiltIn::OpNe, Exp::id(&x), Exp::int(2));
        let from = FromExp {
            steps: vec![
                unbounded_scan(&x),
                Step::Where(Exp::and(
                    Exp::call2(
                        BuiltIn::Elem,
                        Exp::id(&x),
                        Exp::list_of(Type::Int, vec![Exp::int(1), Exp::int(2), Exp::int(3)]),
                    ),
                    ne.clone(),
                )),
            ],
            ty: Type::bag(Type::Int),
        };

        let out = expand_query(from).expect("grounds");
        let wheres: Vec<&Step> = out
            .steps
            .iter()
            .filter(|s| matches!(s, Step::Where(_)))
            .collect();
        assert_eq!(wheres.len(), 1);
        assert_eq!(wheres[0], &Step::Where(ne));
    }
}
