//! # Type Model
//!
//! Types for the ML-derived relational language. The grounding core receives
//! fully resolved types from upstream inference and only inspects them:
//! element types of collections, positional field slots of tuples and records,
//! and finiteness (which decides whether a universal extent is enumerable).
//!
//! Records and tuples share a record-like positional view: record fields are
//! kept sorted by label, and `field_types` / `nth_field` expose both shapes as
//! an ordered slot list. A record marked *progressive* is open to new fields
//! during analysis.

use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Type
// ============================================================================

/// A resolved type.
///
/// `Eq`/`Hash` are structural; type variables compare by ordinal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Bool,
    Int,
    Real,
    Char,
    String,
    Unit,
    /// Ordered product, e.g. `int * string`
    Tuple(Vec<Type>),
    /// Labeled product; fields sorted by label. `progressive` records accept
    /// new fields during analysis.
    Record {
        fields: BTreeMap<String, Type>,
        progressive: bool,
    },
    /// Ordered collection `t list`
    List(Box<Type>),
    /// Unordered collection `t bag`
    Bag(Box<Type>),
    /// Function type `a -> b`
    Fn(Box<Type>, Box<Type>),
    /// User datatype identified by name and arguments
    Data {
        name: String,
        args: Vec<Type>,
    },
    /// Universally quantified type `forall 'a .. . t`
    Forall { count: usize, body: Box<Type> },
    /// Type variable by ordinal
    Var(u32),
}

impl Type {
    /// Construct a list type
    pub fn list(element: Type) -> Type {
        Type::List(Box::new(element))
    }

    /// Construct a bag type
    pub fn bag(element: Type) -> Type {
        Type::Bag(Box::new(element))
    }

    /// Construct a function type
    pub fn func(param: Type, result: Type) -> Type {
        Type::Fn(Box::new(param), Box::new(result))
    }

    /// Construct a record type from (label, type) pairs
    pub fn record<I>(fields: I, progressive: bool) -> Type
    where
        I: IntoIterator<Item = (String, Type)>,
    {
        Type::Record {
            fields: fields.into_iter().collect(),
            progressive,
        }
    }

    /// True for `list` and `bag` types
    pub fn is_collection(&self) -> bool {
        matches!(self, Type::List(_) | Type::Bag(_))
    }

    /// True for `bag` types
    pub fn is_bag(&self) -> bool {
        matches!(self, Type::Bag(_))
    }

    /// Element type of a collection
    pub fn element_type(&self) -> Option<&Type> {
        match self {
            Type::List(t) | Type::Bag(t) => Some(t),
            _ => None,
        }
    }

    /// Record-like view: ordered field types for tuples and records.
    ///
    /// Record fields come out in label order; tuple fields in position order.
    /// Scalars have no fields.
    pub fn field_types(&self) -> Option<Vec<&Type>> {
        match self {
            Type::Tuple(ts) => Some(ts.iter().collect()),
            Type::Record { fields, .. } => Some(fields.values().collect()),
            _ => None,
        }
    }

    /// Record-like view: ordered field labels.
    ///
    /// Tuples get positional labels `"1"`, `"2"`, ... in the surface
    /// language's convention.
    pub fn field_labels(&self) -> Option<Vec<String>> {
        match self {
            Type::Tuple(ts) => Some((1..=ts.len()).map(|i| i.to_string()).collect()),
            Type::Record { fields, .. } => Some(fields.keys().cloned().collect()),
            _ => None,
        }
    }

    /// Type of the field at positional `slot` (0-based)
    pub fn nth_field(&self, slot: usize) -> Option<&Type> {
        match self {
            Type::Tuple(ts) => ts.get(slot),
            Type::Record { fields, .. } => fields.values().nth(slot),
            _ => None,
        }
    }

    /// Number of positional fields; 0 for scalars
    pub fn field_count(&self) -> usize {
        match self {
            Type::Tuple(ts) => ts.len(),
            Type::Record { fields, .. } => fields.len(),
            _ => 0,
        }
    }

    /// True when the type has finitely many inhabitants.
    ///
    /// Drives extent cardinality: a universal extent over a finite type is
    /// FINITE even without a bounding range set.
    pub fn is_finite(&self) -> bool {
        match self {
            Type::Bool | Type::Char | Type::Unit => true,
            Type::Tuple(ts) => ts.iter().all(Type::is_finite),
            Type::Record { fields, .. } => fields.values().all(Type::is_finite),
            _ => false,
        }
    }

    /// True for scalar types with a total order (range-set participants)
    pub fn is_ordered(&self) -> bool {
        matches!(self, Type::Int | Type::Real | Type::Char | Type::String)
    }

    /// Apply a type-variable substitution
    pub fn apply_subst(&self, subst: &BTreeMap<u32, Type>) -> Type {
        match self {
            Type::Var(v) => subst.get(v).cloned().unwrap_or_else(|| self.clone()),
            Type::Tuple(ts) => Type::Tuple(ts.iter().map(|t| t.apply_subst(subst)).collect()),
            Type::Record {
                fields,
                progressive,
            } => Type::Record {
                fields: fields
                    .iter()
                    .map(|(l, t)| (l.clone(), t.apply_subst(subst)))
                    .collect(),
                progressive: *progressive,
            },
            Type::List(t) => Type::list(t.apply_subst(subst)),
            Type::Bag(t) => Type::bag(t.apply_subst(subst)),
            Type::Fn(a, b) => Type::func(a.apply_subst(subst), b.apply_subst(subst)),
            Type::Data { name, args } => Type::Data {
                name: name.clone(),
                args: args.iter().map(|t| t.apply_subst(subst)).collect(),
            },
            Type::Forall { count, body } => Type::Forall {
                count: *count,
                body: Box::new(body.apply_subst(subst)),
            },
            _ => self.clone(),
        }
    }

    /// Strip a `Forall` wrapper, leaving the body with its variables free
    pub fn unqualified(&self) -> &Type {
        match self {
            Type::Forall { body, .. } => body.unqualified(),
            t => t,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Bool => write!(f, "bool"),
            Type::Int => write!(f, "int"),
            Type::Real => write!(f, "real"),
            Type::Char => write!(f, "char"),
            Type::String => write!(f, "string"),
            Type::Unit => write!(f, "unit"),
            Type::Tuple(ts) => {
                write!(f, "(")?;
                for (i, t) in ts.iter().enumerate() {
                    if i > 0 {
                        write!(f, " * ")?;
                    }
                    write!(f, "{t}")?;
                }
                write!(f, ")")
            }
            Type::Record {
                fields,
                progressive,
            } => {
                write!(f, "{{")?;
                for (i, (l, t)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{l}: {t}")?;
                }
                if *progressive {
                    write!(f, ", ...")?;
                }
                write!(f, "}}")
            }
            Type::List(t) => write!(f, "{t} list"),
            Type::Bag(t) => write!(f, "{t} bag"),
            Type::Fn(a, b) => write!(f, "{a} -> {b}"),
            Type::Data { name, args } => {
                for a in args {
                    write!(f, "{a} ")?;
                }
                write!(f, "{name}")
            }
            Type::Forall { count, body } => write!(f, "forall {count} . {body}"),
            Type::Var(v) => write!(f, "'{v}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_type() {
        let t = Type::list(Type::Int);
        assert_eq!(t.element_type(), Some(&Type::Int));
        assert_eq!(Type::Int.element_type(), None);
    }

    #[test]
    fn test_record_fields_sorted_by_label() {
        let t = Type::record(
            vec![
                ("deptno".to_string(), Type::Int),
                ("name".to_string(), Type::String),
                ("age".to_string(), Type::Int),
            ],
            false,
        );
        assert_eq!(
            t.field_labels(),
            Some(vec![
                "age".to_string(),
                "deptno".to_string(),
                "name".to_string()
            ])
        );
        assert_eq!(t.nth_field(0), Some(&Type::Int)); // age
        assert_eq!(t.nth_field(2), Some(&Type::String)); // name
    }

    #[test]
    fn test_tuple_slot_view() {
        let t = Type::Tuple(vec![Type::Int, Type::String]);
        assert_eq!(t.field_count(), 2);
        assert_eq!(t.nth_field(1), Some(&Type::String));
        assert_eq!(
            t.field_labels(),
            Some(vec!["1".to_string(), "2".to_string()])
        );
    }

    #[test]
    fn test_finiteness() {
        assert!(Type::Bool.is_finite());
        assert!(Type::Unit.is_finite());
        assert!(!Type::Int.is_finite());
        assert!(!Type::String.is_finite());
        assert!(Type::Tuple(vec![Type::Bool, Type::Char]).is_finite());
        assert!(!Type::Tuple(vec![Type::Bool, Type::Int]).is_finite());
    }

    #[test]
    fn test_subst() {
        let mut s = BTreeMap::new();
        s.insert(0, Type::Int);
        let t = Type::list(Type::Var(0));
        assert_eq!(t.apply_subst(&s), Type::list(Type::Int));
    }

    #[test]
    fn test_display() {
        let t = Type::func(Type::Tuple(vec![Type::Int, Type::Int]), Type::Bool);
        assert_eq!(t.to_string(), "(int * int) -> bool");
    }
}
