//! Call-site argument alignment.
//!
//! When the inverter treats a function call as a generator, the call
//! argument's shape must be aligned with the function's formal parameter:
//! a caller may pass a single id against a tuple formal (the generator then
//! yields whole tuples under one scalar), or a tuple of ids that rewires
//! slot by slot.

use crate::ir::{Exp, IdPat, Pat};

/// Result of aligning a call argument with a formal parameter
#[derive(Debug, Clone, PartialEq)]
pub struct CallShape {
    /// The effective pattern for the resulting generator
    pub goal_pat: Pat,
    /// The goals the generator will bind
    pub bound_pats: Vec<IdPat>,
    /// True when a single id is passed against a tuple/record formal, so the
    /// generator yields tuples under one scalar
    pub is_scalar_binding: bool,
}

/// Align `arg` with `formal` for the given goals.
///
/// Rules, in order: scalar against tuple formal is a scalar binding; tuple
/// against a matching tuple passes through slot by slot; single against
/// single is direct; anything else is a scalar binding on the first goal
/// referenced by the argument. Returns `None` when the argument references
/// no goal at all.
pub fn match_call(arg: &Exp, formal: &Pat, goals: &[IdPat]) -> Option<CallShape> {
    match (arg, formal) {
        (Exp::Id(id), Pat::Tuple(_) | Pat::Record(_)) if goals.contains(id) => Some(CallShape {
            goal_pat: Pat::Id(id.clone()),
            bound_pats: vec![id.clone()],
            is_scalar_binding: true,
        }),
        (Exp::Tuple(es), Pat::Tuple(ps)) if es.len() == ps.len() => {
            let ids: Option<Vec<IdPat>> = es
                .iter()
                .map(|e| match e {
                    Exp::Id(id) if goals.contains(id) => Some(id.clone()),
                    _ => None,
                })
                .collect();
            match ids {
                Some(ids) => Some(CallShape {
                    goal_pat: Pat::Tuple(ids.iter().cloned().map(Pat::Id).collect()),
                    bound_pats: ids,
                    is_scalar_binding: false,
                }),
                None => first_goal_binding(arg, goals),
            }
        }
        (Exp::Id(id), _) if goals.contains(id) => Some(CallShape {
            goal_pat: Pat::Id(id.clone()),
            bound_pats: vec![id.clone()],
            is_scalar_binding: false,
        }),
        _ => first_goal_binding(arg, goals),
    }
}

/// Scalar binding on the first goal the argument references
fn first_goal_binding(arg: &Exp, goals: &[IdPat]) -> Option<CallShape> {
    let free = arg.free_vars();
    let first = free.into_iter().find(|v| goals.contains(v))?;
    Some(CallShape {
        goal_pat: Pat::Id(first.clone()),
        bound_pats: vec![first],
        is_scalar_binding: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Type;

    fn pair_ty() -> Type {
        Type::Tuple(vec![Type::Int, Type::Int])
    }

    fn tuple_formal() -> Pat {
        Pat::Tuple(vec![
            Pat::Id(IdPat::new("a", 0, Type::Int)),
            Pat::Id(IdPat::new("b", 1, Type::Int)),
        ])
    }

    #[test]
    fn test_scalar_against_tuple() {
        let p = IdPat::new("p", 5, pair_ty());
        let shape = match_call(&Exp::id(&p), &tuple_formal(), &[p.clone()]).expect("matches");
        assert!(shape.is_scalar_binding);
        assert_eq!(shape.goal_pat, Pat::Id(p.clone()));
        assert_eq!(shape.bound_pats, vec![p]);
    }

    #[test]
    fn test_tuple_against_tuple_passthrough() {
        let x = IdPat::new("x", 5, Type::Int);
        let y = IdPat::new("y", 6, Type::Int);
        let arg = Exp::Tuple(vec![Exp::id(&x), Exp::id(&y)]);
        let shape =
            match_call(&arg, &tuple_formal(), &[x.clone(), y.clone()]).expect("matches");
        assert!(!shape.is_scalar_binding);
        assert_eq!(
            shape.goal_pat,
            Pat::Tuple(vec![Pat::Id(x.clone()), Pat::Id(y.clone())])
        );
        assert_eq!(shape.bound_pats, vec![x, y]);
    }

    #[test]
    fn test_single_against_single() {
        let x = IdPat::new("x", 5, Type::Int);
        let formal = Pat::Id(IdPat::new("n", 0, Type::Int));
        let shape = match_call(&Exp::id(&x), &formal, &[x.clone()]).expect("matches");
        assert!(!shape.is_scalar_binding);
        assert_eq!(shape.bound_pats, vec![x]);
    }

    #[test]
    fn test_mixed_tuple_falls_back_to_first_goal() {
        // edge (#1 p, z) with goal z: scalar binding on z
        let p = IdPat::new("p", 5, pair_ty());
        let z = IdPat::new("z", 6, Type::Int);
        let arg = Exp::Tuple(vec![Exp::select(0, Exp::id(&p)), Exp::id(&z)]);
        let shape = match_call(&arg, &tuple_formal(), &[z.clone()]).expect("matches");
        assert!(shape.is_scalar_binding);
        assert_eq!(shape.bound_pats, vec![z]);
    }

    #[test]
    fn test_no_goal_referenced() {
        let other = IdPat::new("w", 9, Type::Int);
        let goals = [IdPat::new("x", 5, Type::Int)];
        assert!(match_call(&Exp::id(&other), &Pat::Id(other.clone()), &goals).is_none());
    }
}
