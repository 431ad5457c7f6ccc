//! IR traversal traits.
//!
//! `Walk` is the read-only analysis traversal; `Rewrite` is the pure
//! transformation traversal. Passes override the hooks they care about and
//! fall through to the default child traversal for everything else.

use super::{Decl, Exp, FromExp, Pat, Step};

/// Read-only traversal. Override a hook and call the matching `walk_*`
/// function to continue into children.
pub trait Walk {
    fn visit_exp(&mut self, exp: &Exp) {
        walk_exp(self, exp);
    }

    fn visit_pat(&mut self, _pat: &Pat) {}

    fn visit_step(&mut self, step: &Step) {
        walk_step(self, step);
    }

    fn visit_decl(&mut self, decl: &Decl) {
        walk_decl(self, decl);
    }
}

/// Default child traversal for expressions
pub fn walk_exp<W: Walk + ?Sized>(w: &mut W, exp: &Exp) {
    match exp {
        Exp::Literal(_) | Exp::Id(_) | Exp::Builtin(..) | Exp::Extent { .. } => {}
        Exp::Tuple(es) => {
            for e in es {
                w.visit_exp(e);
            }
        }
        Exp::Record(fields) => {
            for (_, e) in fields {
                w.visit_exp(e);
            }
        }
        Exp::Select { input, .. } => w.visit_exp(input),
        Exp::Apply { func, arg, .. } => {
            w.visit_exp(func);
            w.visit_exp(arg);
        }
        Exp::Fn { param, body } => {
            w.visit_pat(param);
            w.visit_exp(body);
        }
        Exp::Case { input, arms, .. } => {
            w.visit_exp(input);
            for (pat, e) in arms {
                w.visit_pat(pat);
                w.visit_exp(e);
            }
        }
        Exp::Let { decls, body } => {
            for d in decls {
                w.visit_decl(d);
            }
            w.visit_exp(body);
        }
        Exp::From(from) => {
            for step in &from.steps {
                w.visit_step(step);
            }
        }
    }
}

/// Default child traversal for steps
pub fn walk_step<W: Walk + ?Sized>(w: &mut W, step: &Step) {
    match step {
        Step::Scan {
            pat,
            exp,
            condition,
        } => {
            w.visit_pat(pat);
            w.visit_exp(exp);
            if let Some(c) = condition {
                w.visit_exp(c);
            }
        }
        Step::Where(e) | Step::Yield(e) => w.visit_exp(e),
        Step::Group { keys, aggregates } => {
            for (_, e) in keys {
                w.visit_exp(e);
            }
            for agg in aggregates {
                w.visit_exp(&agg.exp);
            }
        }
        Step::Order(keys) => {
            for k in keys {
                w.visit_exp(&k.exp);
            }
        }
        Step::Union { others, .. } => {
            for e in others {
                w.visit_exp(e);
            }
        }
        Step::Distinct => {}
    }
}

/// Default child traversal for declarations
pub fn walk_decl<W: Walk + ?Sized>(w: &mut W, decl: &Decl) {
    let Decl::Val { pat, exp, .. } = decl;
    w.visit_pat(pat);
    w.visit_exp(exp);
}

/// Pure bottom-up transformation. Override a hook to replace nodes; the
/// default reconstructs each node from rewritten children.
pub trait Rewrite {
    fn rewrite_exp(&mut self, exp: Exp) -> Exp {
        rewrite_exp(self, exp)
    }

    fn rewrite_step(&mut self, step: Step) -> Step {
        rewrite_step(self, step)
    }

    fn rewrite_decl(&mut self, decl: Decl) -> Decl {
        rewrite_decl(self, decl)
    }
}

/// Default reconstruction for expressions
pub fn rewrite_exp<R: Rewrite + ?Sized>(r: &mut R, exp: Exp) -> Exp {
    match exp {
        Exp::Literal(_) | Exp::Id(_) | Exp::Builtin(..) | Exp::Extent { .. } => exp,
        Exp::Tuple(es) => Exp::Tuple(es.into_iter().map(|e| r.rewrite_exp(e)).collect()),
        Exp::Record(fields) => Exp::Record(
            fields
                .into_iter()
                .map(|(l, e)| (l, r.rewrite_exp(e)))
                .collect(),
        ),
        Exp::Select { slot, input } => Exp::Select {
            slot,
            input: Box::new(r.rewrite_exp(*input)),
        },
        Exp::Apply { func, arg, ty } => Exp::Apply {
            func: Box::new(r.rewrite_exp(*func)),
            arg: Box::new(r.rewrite_exp(*arg)),
            ty,
        },
        Exp::Fn { param, body } => Exp::Fn {
            param,
            body: Box::new(r.rewrite_exp(*body)),
        },
        Exp::Case { input, arms, ty } => Exp::Case {
            input: Box::new(r.rewrite_exp(*input)),
            arms: arms
                .into_iter()
                .map(|(p, e)| (p, r.rewrite_exp(e)))
                .collect(),
            ty,
        },
        Exp::Let { decls, body } => Exp::Let {
            decls: decls.into_iter().map(|d| r.rewrite_decl(d)).collect(),
            body: Box::new(r.rewrite_exp(*body)),
        },
        Exp::From(from) => {
            let FromExp { steps, ty } = *from;
            Exp::From(Box::new(FromExp {
                steps: steps.into_iter().map(|s| r.rewrite_step(s)).collect(),
                ty,
            }))
        }
    }
}

/// Default reconstruction for steps
pub fn rewrite_step<R: Rewrite + ?Sized>(r: &mut R, step: Step) -> Step {
    match step {
        Step::Scan {
            pat,
            exp,
            condition,
        } => Step::Scan {
            pat,
            exp: r.rewrite_exp(exp),
            condition: condition.map(|c| r.rewrite_exp(c)),
        },
        Step::Where(e) => Step::Where(r.rewrite_exp(e)),
        Step::Yield(e) => Step::Yield(r.rewrite_exp(e)),
        Step::Group { keys, aggregates } => Step::Group {
            keys: keys
                .into_iter()
                .map(|(l, e)| (l, r.rewrite_exp(e)))
                .collect(),
            aggregates: aggregates
                .into_iter()
                .map(|mut a| {
                    a.exp = r.rewrite_exp(a.exp);
                    a
                })
                .collect(),
        },
        Step::Order(keys) => Step::Order(
            keys.into_iter()
                .map(|mut k| {
                    k.exp = r.rewrite_exp(k.exp);
                    k
                })
                .collect(),
        ),
        Step::Union { distinct, others } => Step::Union {
            distinct,
            others: others.into_iter().map(|e| r.rewrite_exp(e)).collect(),
        },
        Step::Distinct => Step::Distinct,
    }
}

/// Default reconstruction for declarations
pub fn rewrite_decl<R: Rewrite + ?Sized>(r: &mut R, decl: Decl) -> Decl {
    let Decl::Val { rec, pat, exp } = decl;
    Decl::Val {
        rec,
        pat,
        exp: r.rewrite_exp(exp),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BuiltIn, IdPat};
    use crate::types::Type;

    struct IdCounter {
        count: usize,
    }

    impl Walk for IdCounter {
        fn visit_exp(&mut self, exp: &Exp) {
            if matches!(exp, Exp::Id(_)) {
                self.count += 1;
            }
            walk_exp(self, exp);
        }
    }

    #[test]
    fn test_walk_counts_ids() {
        let x = IdPat::new("x", 0, Type::Int);
        let e = Exp::and(
            Exp::call2(BuiltIn::OpGt, Exp::id(&x), Exp::int(2)),
            Exp::call2(BuiltIn::OpLt, Exp::id(&x), Exp::int(7)),
        );
        let mut c = IdCounter { count: 0 };
        c.visit_exp(&e);
        assert_eq!(c.count, 2);
    }

    struct ConstFolder;

    impl Rewrite for ConstFolder {
        fn rewrite_exp(&mut self, exp: Exp) -> Exp {
            let exp = rewrite_exp(self, exp);
            // fold x + 0 -> x
            if let Some((BuiltIn::OpPlus, a, b)) = exp.as_apply2() {
                if *b == Exp::int(0) {
                    return a.clone();
                }
            }
            exp
        }
    }

    #[test]
    fn test_rewrite_bottom_up() {
        let x = IdPat::new("x", 0, Type::Int);
        let e = Exp::call2(
            BuiltIn::OpPlus,
            Exp::call2(BuiltIn::OpPlus, Exp::id(&x), Exp::int(0)),
            Exp::int(0),
        );
        let out = ConstFolder.rewrite_exp(e);
        assert_eq!(out, Exp::id(&x));
    }
}
