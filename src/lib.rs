//! # GroundLog Query-Grounding Core
//!
//! Static-analysis pipeline for an ML-derived language with relational query
//! syntax. Queries may constrain variables only by boolean predicates
//! (unbounded variables); this crate rewrites them so every variable ranges
//! over an explicit finite collection, or rejects the program when no finite
//! generator exists.
//!
//! ## Pipeline Architecture
//!
//! ```text
//! Typed declaration tree (from type inference)
//!     ↓
//! [Relationalize]        → detects infinite-extent scans per declaration
//!     ↓
//! [Query Expander]       → deduce / check / rebuild per query
//!     ↓        ↘
//! [Extent Analyzer]  [Predicate Inverter] → generators per goal pattern
//!     ↓        ↙
//! [Generator Algebra]    → point, range, collection, extent, union
//!     ↓
//! Rewritten declaration tree (every scan finite, filters simplified)
//! ```
//!
//! The function registry classifies declared functions once
//! (INVERTIBLE / PARTIALLY_INVERTIBLE / RECURSIVE / NOT_INVERTIBLE) so the
//! inverter can treat calls as generators; transitive closures lower to a
//! single `iterate` combinator. The type unifier is consulted only to
//! specialize inlined function bodies to call-site types.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use groundlog::{relationalize_decl, Config, Env, FunctionRegistry, NameGen};
//!
//! let config = Config::load()?;
//! let mut registry = FunctionRegistry::new();
//! let mut names = NameGen::starting_at(first_free_ordinal);
//!
//! for decl in decls {
//!     let grounded = relationalize_decl(&decl, &env, &mut registry, &config, &mut names)?;
//!     compile(grounded);
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `types` | Type model (primitives, tuples, records, collections) |
//! | `ir` | Typed IR: patterns, expressions, steps, built-in operators |
//! | `ir_builder` | `FromBuilder` with the scope-environment invariant |
//! | `env` | Persistent environment chain + bounded cache |
//! | `range_set` | Interval algebra over orderable literals |
//! | `unify` | Martelli–Montanari type unification |
//! | `generator` | Generator entity and algebra |
//! | `extent` | Extent analyzer (predicate walk) |
//! | `registry` | Function invertibility registry |
//! | `inverter` | Predicate inverter |
//! | `expander` | Query expander (deduce / check / rebuild) |
//! | `relationalize` | Per-declaration entry point |

pub mod config;
pub mod env;
pub mod error;
pub mod expander;
pub mod extent;
pub mod generator;
pub mod inverter;
pub mod ir;
pub mod ir_builder;
pub mod range_set;
pub mod registry;
pub mod relationalize;
pub mod types;
pub mod unify;

pub use crate::config::{AnalysisConfig, Config, LoggingConfig};
pub use crate::env::{Binding, Env, EnvCache, EnvKey};
pub use crate::error::{GroundError, GroundResult};
pub use crate::expander::QueryExpander;
pub use crate::generator::{Cardinality, Generator};
pub use crate::inverter::{Inversion, Inverter};
pub use crate::ir::{
    Aggregate, BuiltIn, Decl, Exp, FromExp, IdPat, Literal, NameGen, Pat, SortKey, Step,
};
pub use crate::ir_builder::FromBuilder;
pub use crate::range_set::{Bound, Range, RangeSet};
pub use crate::registry::{FnStatus, FunctionInfo, FunctionRegistry};
pub use crate::relationalize::relationalize_decl;
pub use crate::types::Type;
