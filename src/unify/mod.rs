//! # Type Unification
//!
//! Martelli–Montanari unification over type terms. The grounding core uses
//! it for exactly one thing: specializing an inlined function body to the
//! types at its call site before re-inverting the body.
//!
//! Types convert to terms where a term is either a variable or an application
//! of a sequence name to child terms. Records are keyed by their label list,
//! so records with the same labels unify structurally regardless of insertion
//! order; a record whose labels are the contiguous integers `1..n` converts
//! to the tuple constructor and unifies with tuples. Progressive records use
//! a dedicated *open* record name (not a sentinel label): an open record
//! unifies with any record whose label set is a superset, matching children
//! by label.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use thiserror::Error;

use crate::types::Type;

/// Unification failure
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UnifyError {
    #[error("cannot unify '{0}' with '{1}'")]
    Conflict(String, String),

    #[error("occurs check failed for type variable '{0}")]
    Occurs(u32),
}

// ============================================================================
// Terms
// ============================================================================

/// Constructor name of an applied term
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TermName {
    Prim(&'static str),
    Tuple(usize),
    /// Record constructor carrying its label list; `open` records accept
    /// additional labels during unification
    Record { labels: Vec<String>, open: bool },
    List,
    Bag,
    Fn,
    Data(String),
}

impl fmt::Display for TermName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TermName::Prim(p) => write!(f, "{p}"),
            TermName::Tuple(n) => write!(f, "tuple{n}"),
            TermName::Record { labels, open } => {
                write!(f, "record:{}", labels.join(":"))?;
                if *open {
                    write!(f, ":...")?;
                }
                Ok(())
            }
            TermName::List => write!(f, "list"),
            TermName::Bag => write!(f, "bag"),
            TermName::Fn => write!(f, "fn"),
            TermName::Data(name) => write!(f, "{name}"),
        }
    }
}

/// A unification term: a variable or an application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    Var(u32),
    Apply { name: TermName, args: Vec<Term> },
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Var(v) => write!(f, "'{v}"),
            Term::Apply { name, args } => {
                write!(f, "{name}")?;
                if !args.is_empty() {
                    write!(f, "(")?;
                    for (i, a) in args.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{a}")?;
                    }
                    write!(f, ")")?;
                }
                Ok(())
            }
        }
    }
}

/// Convert a type to a term. `Forall` wrappers are stripped, leaving their
/// variables free for the unifier to solve.
pub fn term_of_type(ty: &Type) -> Term {
    match ty.unqualified() {
        Type::Bool => prim("bool"),
        Type::Int => prim("int"),
        Type::Real => prim("real"),
        Type::Char => prim("char"),
        Type::String => prim("string"),
        Type::Unit => prim("unit"),
        Type::Tuple(ts) => Term::Apply {
            name: TermName::Tuple(ts.len()),
            args: ts.iter().map(term_of_type).collect(),
        },
        Type::Record {
            fields,
            progressive,
        } => {
            let labels: Vec<String> = fields.keys().cloned().collect();
            // contiguous integer labels are really a tuple
            if !*progressive && is_contiguous(&labels) {
                Term::Apply {
                    name: TermName::Tuple(labels.len()),
                    args: fields.values().map(term_of_type).collect(),
                }
            } else {
                Term::Apply {
                    name: TermName::Record {
                        labels,
                        open: *progressive,
                    },
                    args: fields.values().map(term_of_type).collect(),
                }
            }
        }
        Type::List(t) => Term::Apply {
            name: TermName::List,
            args: vec![term_of_type(t)],
        },
        Type::Bag(t) => Term::Apply {
            name: TermName::Bag,
            args: vec![term_of_type(t)],
        },
        Type::Fn(a, b) => Term::Apply {
            name: TermName::Fn,
            args: vec![term_of_type(a), term_of_type(b)],
        },
        Type::Data { name, args } => Term::Apply {
            name: TermName::Data(name.clone()),
            args: args.iter().map(term_of_type).collect(),
        },
        Type::Var(v) => Term::Var(*v),
        Type::Forall { .. } => unreachable!("unqualified strips Forall"),
    }
}

fn prim(name: &'static str) -> Term {
    Term::Apply {
        name: TermName::Prim(name),
        args: Vec::new(),
    }
}

fn is_contiguous(labels: &[String]) -> bool {
    !labels.is_empty()
        && labels
            .iter()
            .all(|l| l.parse::<usize>().map_or(false, |n| n >= 1 && n <= labels.len()))
        && {
            let mut ns: Vec<usize> = labels.iter().filter_map(|l| l.parse().ok()).collect();
            ns.sort_unstable();
            ns == (1..=labels.len()).collect::<Vec<_>>()
        }
}

/// Convert a term back to a type
pub fn type_of_term(term: &Term) -> Type {
    match term {
        Term::Var(v) => Type::Var(*v),
        Term::Apply { name, args } => match name {
            TermName::Prim("bool") => Type::Bool,
            TermName::Prim("int") => Type::Int,
            TermName::Prim("real") => Type::Real,
            TermName::Prim("char") => Type::Char,
            TermName::Prim("string") => Type::String,
            TermName::Prim(_) => Type::Unit,
            TermName::Tuple(_) => Type::Tuple(args.iter().map(type_of_term).collect()),
            TermName::Record { labels, open } => Type::Record {
                fields: labels
                    .iter()
                    .cloned()
                    .zip(args.iter().map(type_of_term))
                    .collect(),
                progressive: *open,
            },
            TermName::List => Type::list(type_of_term(&args[0])),
            TermName::Bag => Type::bag(type_of_term(&args[0])),
            TermName::Fn => Type::func(type_of_term(&args[0]), type_of_term(&args[1])),
            TermName::Data(name) => Type::Data {
                name: name.clone(),
                args: args.iter().map(type_of_term).collect(),
            },
        },
    }
}

// ============================================================================
// Unification
// ============================================================================

/// A solved substitution from variable ordinals to terms
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Subst {
    map: HashMap<u32, Term>,
}

impl Subst {
    /// Apply the substitution to a term, chasing variable chains
    pub fn apply(&self, term: &Term) -> Term {
        match term {
            Term::Var(v) => match self.map.get(v) {
                Some(t) => self.apply(t),
                None => term.clone(),
            },
            Term::Apply { name, args } => Term::Apply {
                name: name.clone(),
                args: args.iter().map(|a| self.apply(a)).collect(),
            },
        }
    }

    /// Convert to a type substitution
    pub fn to_type_subst(&self) -> BTreeMap<u32, Type> {
        self.map
            .iter()
            .map(|(v, t)| (*v, type_of_term(&self.apply(t))))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn resolve<'a>(&'a self, mut term: &'a Term) -> &'a Term {
        while let Term::Var(v) = term {
            match self.map.get(v) {
                Some(t) => term = t,
                None => break,
            }
        }
        term
    }

    fn occurs(&self, var: u32, term: &Term) -> bool {
        match self.resolve(term) {
            Term::Var(v) => *v == var,
            Term::Apply { args, .. } => args.iter().any(|a| self.occurs(var, a)),
        }
    }
}

/// Unify a list of term pairs by repeated substitution with occurs check
pub fn unify(pairs: Vec<(Term, Term)>) -> Result<Subst, UnifyError> {
    let mut subst = Subst::default();
    let mut work = pairs;

    while let Some((a, b)) = work.pop() {
        let a = subst.resolve(&a).clone();
        let b = subst.resolve(&b).clone();
        match (a, b) {
            (Term::Var(x), Term::Var(y)) if x == y => {}
            (Term::Var(x), t) | (t, Term::Var(x)) => {
                if subst.occurs(x, &t) {
                    return Err(UnifyError::Occurs(x));
                }
                subst.map.insert(x, t);
            }
            (
                Term::Apply {
                    name: n1,
                    args: a1,
                },
                Term::Apply {
                    name: n2,
                    args: a2,
                },
            ) => {
                decompose(n1, a1, n2, a2, &mut work)?;
            }
        }
    }

    Ok(subst)
}

/// Push child equations for two applied terms, or fail.
///
/// Open records unify with records whose label set is a superset; children
/// are matched by label and the extra fields stay unconstrained.
fn decompose(
    n1: TermName,
    a1: Vec<Term>,
    n2: TermName,
    a2: Vec<Term>,
    work: &mut Vec<(Term, Term)>,
) -> Result<(), UnifyError> {
    match (&n1, &n2) {
        (
            TermName::Record {
                labels: l1,
                open: o1,
            },
            TermName::Record {
                labels: l2,
                open: o2,
            },
        ) if l1 != l2 || *o1 || *o2 => {
            let open_covers = |small: &[String], big: &[String]| {
                small.iter().all(|l| big.contains(l))
            };
            let (small_labels, small_args, big_labels, big_args) =
                if (*o1 && open_covers(l1, l2)) || (*o1 && *o2 && l1.len() <= l2.len()) {
                    (l1, &a1, l2, &a2)
                } else if *o2 && open_covers(l2, l1) {
                    (l2, &a2, l1, &a1)
                } else if l1 == l2 {
                    (l1, &a1, l2, &a2)
                } else {
                    return Err(UnifyError::Conflict(n1.to_string(), n2.to_string()));
                };
            for (label, small_term) in small_labels.iter().zip(small_args.iter()) {
                if let Some(i) = big_labels.iter().position(|l| l == label) {
                    work.push((small_term.clone(), big_args[i].clone()));
                } else if !open_covers(small_labels, big_labels) {
                    return Err(UnifyError::Conflict(n1.to_string(), n2.to_string()));
                }
            }
            Ok(())
        }
        _ if n1 == n2 && a1.len() == a2.len() => {
            work.extend(a1.into_iter().zip(a2));
            Ok(())
        }
        _ => Err(UnifyError::Conflict(n1.to_string(), n2.to_string())),
    }
}

/// Unify two types and return the resulting type substitution
pub fn unify_types(a: &Type, b: &Type) -> Result<BTreeMap<u32, Type>, UnifyError> {
    let subst = unify(vec![(term_of_type(a), term_of_type(b))])?;
    Ok(subst.to_type_subst())
}
