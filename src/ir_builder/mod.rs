//! # From Builder
//!
//! Incremental construction of `from` expressions. The builder is the only
//! sanctioned way the core creates queries: it tracks the *current step
//! environment* (the bindings visible after the latest step), type-checks
//! each scan against its pattern, rejects rebinding of a name already bound
//! by an earlier step, and drops `where true` steps.
//!
//! ```text
//! FromBuilder::new()
//!     .scan(pat, exp)?      -> bindings extended with pat's leaves
//!     .where_(predicate)    -> no-op when the predicate is literal true
//!     .yield_(exp)          -> bindings replaced by the yielded shape
//!     .build()              -> FromExp (implicit trailing yield omitted)
//! ```

use crate::error::{GroundError, GroundResult};
use crate::ir::{Aggregate, Exp, FromExp, IdPat, Pat, SortKey, Step};
use crate::types::Type;

/// Builder for `from` expressions
#[derive(Debug)]
pub struct FromBuilder {
    steps: Vec<Step>,
    /// Bindings visible after the latest step; `None` after a step whose
    /// output shape the builder does not track (group, opaque yield)
    bindings: Option<Vec<IdPat>>,
    /// Bindings that were in force just before a trailing yield; a trailing
    /// yield that merely re-exports them is omitted by `build`
    pre_yield: Option<Vec<IdPat>>,
}

impl Default for FromBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FromBuilder {
    pub fn new() -> FromBuilder {
        FromBuilder {
            steps: Vec::new(),
            bindings: Some(Vec::new()),
            pre_yield: None,
        }
    }

    /// Bindings visible after the latest step
    pub fn bindings(&self) -> &[IdPat] {
        self.bindings.as_deref().unwrap_or(&[])
    }

    /// Add a scan `pat in exp`
    pub fn scan(&mut self, pat: Pat, exp: Exp) -> GroundResult<&mut FromBuilder> {
        self.scan_on(pat, exp, None)
    }

    /// Add a scan with an optional join condition.
    ///
    /// Fails when the expression's element type does not match the pattern's
    /// type, or when the pattern rebinds a name already bound by an earlier
    /// step (ordinals must be fresh).
    pub fn scan_on(
        &mut self,
        pat: Pat,
        exp: Exp,
        condition: Option<Exp>,
    ) -> GroundResult<&mut FromBuilder> {
        let element = exp.ty().element_type().cloned().ok_or_else(|| {
            GroundError::TypeMismatch(format!(
                "scan expression has non-collection type {}",
                exp.ty()
            ))
        })?;
        if element != pat.ty() {
            return Err(GroundError::TypeMismatch(format!(
                "scan of {} cannot bind pattern '{}' of type {}",
                element,
                pat,
                pat.ty()
            )));
        }
        if let Some(bindings) = &mut self.bindings {
            for leaf in pat.expand() {
                if bindings.contains(leaf) {
                    return Err(GroundError::Internal(format!(
                        "scan rebinds '{}' already bound by an earlier step",
                        leaf
                    )));
                }
                bindings.push(leaf.clone());
            }
        }
        self.steps.push(Step::Scan {
            pat,
            exp,
            condition,
        });
        Ok(self)
    }

    /// Add a filter; literal `true` is dropped
    pub fn where_(&mut self, predicate: Exp) -> &mut FromBuilder {
        if !predicate.is_literal_true() {
            self.steps.push(Step::Where(predicate));
        }
        self
    }

    /// Add a yield, replacing the current bindings.
    ///
    /// A yield of a record of plain id references keeps those ids visible to
    /// later steps; any other shape makes the environment opaque.
    pub fn yield_(&mut self, exp: Exp) -> &mut FromBuilder {
        self.pre_yield = self.bindings.clone();
        self.bindings = match &exp {
            Exp::Id(id) => Some(vec![id.clone()]),
            Exp::Record(fields) => {
                let ids: Option<Vec<IdPat>> = fields
                    .iter()
                    .map(|(_, e)| match e {
                        Exp::Id(id) => Some(id.clone()),
                        _ => None,
                    })
                    .collect();
                ids
            }
            _ => None,
        };
        self.steps.push(Step::Yield(exp));
        self
    }

    /// Add a group step; the builder stops tracking bindings past it
    pub fn group(&mut self, keys: Vec<(String, Exp)>, aggregates: Vec<Aggregate>) -> &mut FromBuilder {
        self.bindings = None;
        self.steps.push(Step::Group { keys, aggregates });
        self
    }

    /// Add an order step
    pub fn order(&mut self, keys: Vec<SortKey>) -> &mut FromBuilder {
        self.steps.push(Step::Order(keys));
        self
    }

    /// Append other queries' results
    pub fn union(&mut self, distinct: bool, others: Vec<Exp>) -> GroundResult<&mut FromBuilder> {
        let element = self.element_type();
        for other in &others {
            if other.ty().element_type() != Some(&element) {
                return Err(GroundError::TypeMismatch(format!(
                    "union arm of type {} does not match query element type {}",
                    other.ty(),
                    element
                )));
            }
        }
        self.steps.push(Step::Union { distinct, others });
        Ok(self)
    }

    /// Deduplicate results
    pub fn distinct(&mut self) -> &mut FromBuilder {
        self.steps.push(Step::Distinct);
        self
    }

    /// Element type of the query as built so far
    fn element_type(&self) -> Type {
        for step in self.steps.iter().rev() {
            if let Step::Yield(e) = step {
                return e.ty();
            }
        }
        match self.bindings.as_deref() {
            Some([single]) => single.ty.clone(),
            Some(many) => Type::record(
                many.iter().map(|id| (id.name.clone(), id.ty.clone())),
                false,
            ),
            None => Type::Unit,
        }
    }

    /// Finish the query.
    ///
    /// A trailing yield that re-exports exactly the current bindings in their
    /// default shape is omitted.
    pub fn build(mut self) -> FromExp {
        if let (Some(Step::Yield(e)), Some(before)) = (self.steps.last(), &self.pre_yield) {
            if Self::is_default_yield(e, before) {
                self.steps.pop();
            }
        }
        let element = self.element_type();
        let ordered = self.steps.iter().any(|s| matches!(s, Step::Order(_)));
        let ty = if ordered {
            Type::list(element)
        } else {
            Type::bag(element)
        };
        FromExp {
            steps: self.steps,
            ty,
        }
    }

    /// True when the yield expression is the implicit re-export of the
    /// bindings: the sole binding itself, or the record of all bindings.
    fn is_default_yield(exp: &Exp, bindings: &[IdPat]) -> bool {
        match (exp, bindings) {
            (Exp::Id(id), [single]) => id == single,
            (Exp::Record(fields), _) if fields.len() == bindings.len() => {
                fields.iter().all(|(label, e)| match e {
                    Exp::Id(id) => id.name == *label && bindings.contains(id),
                    _ => false,
                })
            }
            _ => false,
        }
    }
}
