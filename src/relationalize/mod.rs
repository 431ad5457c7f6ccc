//! # Relationalize Pass
//!
//! Entry point invoked by the compiler pipeline, once per declaration. It
//! registers function declarations with the [`FunctionRegistry`], detects
//! queries containing infinite extents, and delegates them to the
//! [`QueryExpander`].
//!
//! Function *definitions* are never expanded: their `from` expressions are
//! templates, not queries to execute, and mutually recursive analysis must
//! not re-enter them. Expansion resumes at the outermost query site.
//!
//! ## Pipeline Position
//!
//! ```text
//! type resolution -> [relationalize] -> compilation
//! ```

use tracing::debug;

use crate::config::Config;
use crate::env::Env;
use crate::error::{GroundError, GroundResult};
use crate::expander::QueryExpander;
use crate::ir::visit::{self, Rewrite, Walk};
use crate::ir::{Decl, Exp, NameGen, Pat};
use crate::registry::FunctionRegistry;

/// Relationalize one declaration: register it if it declares a function,
/// otherwise ground every query it contains.
pub fn relationalize_decl(
    decl: &Decl,
    env: &Env,
    registry: &mut FunctionRegistry,
    config: &Config,
    names: &mut NameGen,
) -> GroundResult<Decl> {
    let Decl::Val { rec, pat, exp } = decl;

    // a function declaration is analyzed and cached, never expanded
    if let Exp::Fn { .. } = exp {
        if let Pat::Id(id) = pat {
            registry.register(id, exp);
        }
        return Ok(decl.clone());
    }

    if !config.analysis.relationalize || !contains_unbounded(exp) {
        return Ok(decl.clone());
    }

    // functions only known through the environment (inlined lambdas from
    // outer scopes) are registered before expansion
    harvest_env_functions(exp, env, registry);

    let mut shuttle = Shuttle {
        registry,
        names,
        passes: config.analysis.max_refinement_passes,
        error: None,
    };
    let rewritten = shuttle.rewrite_exp(exp.clone());
    if let Some(err) = shuttle.error {
        return Err(err);
    }
    debug!(pattern = %pat, "declaration relationalized");
    Ok(Decl::Val {
        rec: *rec,
        pat: pat.clone(),
        exp: rewritten,
    })
}

/// True when the expression contains a scan over an infinite extent
pub fn contains_unbounded(exp: &Exp) -> bool {
    struct Detector {
        found: bool,
    }
    impl Walk for Detector {
        fn visit_exp(&mut self, exp: &Exp) {
            if self.found {
                return;
            }
            if let Exp::From(from) = exp {
                if from.has_unbounded_scan() {
                    self.found = true;
                    return;
                }
            }
            visit::walk_exp(self, exp);
        }
    }
    let mut detector = Detector { found: false };
    detector.visit_exp(exp);
    detector.found
}

/// Register lambdas reachable through the environment for call heads the
/// registry does not know yet.
fn harvest_env_functions(exp: &Exp, env: &Env, registry: &mut FunctionRegistry) {
    struct Harvester<'a> {
        env: &'a Env,
        registry: &'a mut FunctionRegistry,
    }
    impl Walk for Harvester<'_> {
        fn visit_exp(&mut self, exp: &Exp) {
            if let Exp::Apply { func, .. } = exp {
                if let Exp::Id(f) = func.as_ref() {
                    if self.registry.lookup(f).is_none() {
                        if let Some(binding) = self.env.get(f) {
                            if let Some(value @ Exp::Fn { .. }) = &binding.value {
                                self.registry.register(f, value);
                            }
                        }
                    }
                }
            }
            visit::walk_exp(self, exp);
        }
    }
    let mut harvester = Harvester { env, registry };
    harvester.visit_exp(exp);
}

/// Rewriting shuttle: expands every `from` with an unbounded scan, skipping
/// lambda bodies, innermost queries first.
struct Shuttle<'a> {
    registry: &'a FunctionRegistry,
    names: &'a mut NameGen,
    passes: usize,
    error: Option<GroundError>,
}

impl Rewrite for Shuttle<'_> {
    fn rewrite_exp(&mut self, exp: Exp) -> Exp {
        if self.error.is_some() {
            return exp;
        }
        match exp {
            // templates stay untouched
            Exp::Fn { .. } => exp,
            Exp::From(_) => match visit::rewrite_exp(self, exp) {
                Exp::From(from) if from.has_unbounded_scan() => {
                    let mut expander =
                        QueryExpander::new(self.registry, self.names, self.passes);
                    match expander.expand(&from) {
                        Ok(expanded) => Exp::From(Box::new(expanded)),
                        Err(err) => {
                            self.error = Some(err);
                            Exp::From(from)
                        }
                    }
                }
                other => other,
            },
            other => visit::rewrite_exp(self, other),
        }
    }
}
