//! # Environments
//!
//! Persistent, chainable variable→binding maps. Each binding associates an
//! id-pattern with an optional inlined value expression. Lookup walks from
//! the youngest binding toward the root; a binding *obscures* older bindings
//! of the same name.
//!
//! Two structural optimizations keep chains short, and both are asymptotic
//! improvements rather than constant factors:
//!
//! - `bind` re-parents past an immediately obscured same-name ancestor, so
//!   repeated rebinding of one name (REPL loops, iterative refinement) does
//!   not grow the chain.
//! - `bulk_bind` of five or more bindings builds a single hash-map node whose
//!   parent is the nearest ancestor not completely obscured by the new name
//!   set.
//!
//! A process-wide bounded cache accelerates building the root environment for
//! repeated sessions; it is a performance aid only, never semantically
//! required.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::ir::{Exp, IdPat, Pat};

/// Bindings below this count chain individually; at or above it they become
/// one map node.
const BULK_BIND_THRESHOLD: usize = 5;

/// A variable binding: the id-pattern and an optional inlined value
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub pat: IdPat,
    pub value: Option<Exp>,
}

impl Binding {
    pub fn of(pat: IdPat) -> Binding {
        Binding { pat, value: None }
    }

    pub fn with_value(pat: IdPat, value: Exp) -> Binding {
        Binding {
            pat,
            value: Some(value),
        }
    }
}

#[derive(Debug)]
enum Node {
    Empty,
    Bind { binding: Binding, parent: Env },
    Map { map: HashMap<String, Binding>, parent: Env },
}

/// A persistent environment chain
#[derive(Debug, Clone)]
pub struct Env(Arc<Node>);

impl Env {
    /// The empty environment
    pub fn empty() -> Env {
        Env(Arc::new(Node::Empty))
    }

    /// Look up a binding by id-pattern identity.
    ///
    /// Search stops at the youngest binding for the id's *name*: if that
    /// binding is for a different ordinal, the requested id is obscured and
    /// the lookup fails.
    pub fn get(&self, id: &IdPat) -> Option<&Binding> {
        let mut node = &self.0;
        loop {
            match node.as_ref() {
                Node::Empty => return None,
                Node::Bind { binding, parent } => {
                    if binding.pat.name == id.name {
                        return (binding.pat == *id).then_some(binding);
                    }
                    node = &parent.0;
                }
                Node::Map { map, parent } => {
                    if let Some(binding) = map.get(&id.name) {
                        return (binding.pat == *id).then_some(binding);
                    }
                    node = &parent.0;
                }
            }
        }
    }

    /// The youngest binding with the given name, regardless of ordinal
    pub fn get_top(&self, name: &str) -> Option<&Binding> {
        let mut node = &self.0;
        loop {
            match node.as_ref() {
                Node::Empty => return None,
                Node::Bind { binding, parent } => {
                    if binding.pat.name == name {
                        return Some(binding);
                    }
                    node = &parent.0;
                }
                Node::Map { map, parent } => {
                    if let Some(binding) = map.get(name) {
                        return Some(binding);
                    }
                    node = &parent.0;
                }
            }
        }
    }

    /// Add one binding, returning the extended environment.
    ///
    /// When the binding would obscure a same-name binding immediately below,
    /// the new node is parented past the obscured one, keeping the chain
    /// short.
    pub fn bind(&self, binding: Binding) -> Env {
        let parent = match self.0.as_ref() {
            Node::Bind {
                binding: below,
                parent,
            } if below.pat.name == binding.pat.name => parent.clone(),
            _ => self.clone(),
        };
        Env(Arc::new(Node::Bind { binding, parent }))
    }

    /// Bind every named leaf of a pattern, without values
    pub fn bind_pat(&self, pat: &Pat) -> Env {
        self.bulk_bind(pat.expand().into_iter().cloned().map(Binding::of).collect())
    }

    /// Add many bindings at once.
    ///
    /// Five or more bindings become a single map node whose parent is the
    /// nearest ancestor not completely obscured by the new name set; fewer
    /// chain individually.
    pub fn bulk_bind(&self, bindings: Vec<Binding>) -> Env {
        if bindings.len() < BULK_BIND_THRESHOLD {
            return bindings.into_iter().fold(self.clone(), |env, b| env.bind(b));
        }
        let mut map: HashMap<String, Binding> = HashMap::with_capacity(bindings.len());
        for b in bindings {
            // later bindings obscure earlier ones within the batch
            map.insert(b.pat.name.clone(), b);
        }
        let parent = self.skip_obscured(&map);
        Env(Arc::new(Node::Map { map, parent }))
    }

    /// Nearest ancestor (possibly `self`) that the new name set does not
    /// completely obscure.
    fn skip_obscured(&self, names: &HashMap<String, Binding>) -> Env {
        let mut env = self.clone();
        loop {
            let next = match env.0.as_ref() {
                Node::Bind { binding, parent } if names.contains_key(&binding.pat.name) => {
                    parent.clone()
                }
                Node::Map { map, parent } if map.keys().all(|k| names.contains_key(k)) => {
                    parent.clone()
                }
                _ => return env,
            };
            env = next;
        }
    }

    /// Number of nodes in the chain (diagnostic)
    pub fn depth(&self) -> usize {
        let mut node = &self.0;
        let mut n = 0;
        loop {
            match node.as_ref() {
                Node::Empty => return n,
                Node::Bind { parent, .. } | Node::Map { parent, .. } => {
                    n += 1;
                    node = &parent.0;
                }
            }
        }
    }
}

// ============================================================================
// Process-wide environment cache
// ============================================================================

/// Cache key for prebuilt root environments.
///
/// The original design also keyed on a foreign-value map; foreign bridges are
/// outside this core, so the key is the session plus whether built-ins are
/// included.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnvKey {
    pub session: Option<String>,
    pub include_builtins: bool,
}

struct CacheInner {
    map: HashMap<EnvKey, (Env, u64)>,
    tick: u64,
}

/// Bounded LRU cache of root environments
pub struct EnvCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
}

impl EnvCache {
    pub fn new(capacity: usize) -> EnvCache {
        EnvCache {
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                tick: 0,
            }),
            capacity,
        }
    }

    /// Fetch the environment for `key`, building it with `build` on a miss.
    /// Evicts the least recently used entry when over capacity.
    pub fn get_or_insert(&self, key: EnvKey, build: impl FnOnce() -> Env) -> Env {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        if let Some((env, stamp)) = inner.map.get_mut(&key) {
            *stamp = tick;
            return env.clone();
        }
        let env = build();
        if inner.map.len() >= self.capacity {
            if let Some(oldest) = inner
                .map
                .iter()
                .min_by_key(|(_, (_, stamp))| *stamp)
                .map(|(k, _)| k.clone())
            {
                inner.map.remove(&oldest);
            }
        }
        inner.map.insert(key, (env.clone(), tick));
        env
    }

    /// Number of cached environments
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The process-wide cache, bounded at 1024 entries
pub fn global_cache() -> &'static EnvCache {
    static CACHE: OnceLock<EnvCache> = OnceLock::new();
    CACHE.get_or_init(|| EnvCache::new(1024))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Type;

    fn id(name: &str, ordinal: u32) -> IdPat {
        IdPat::new(name, ordinal, Type::Int)
    }

    #[test]
    fn test_get_and_obscure() {
        let x0 = id("x", 0);
        let x1 = id("x", 1);
        let env = Env::empty()
            .bind(Binding::of(x0.clone()))
            .bind(Binding::of(id("y", 2)))
            .bind(Binding::of(x1.clone()));

        // youngest x wins; the older ordinal is obscured
        assert_eq!(env.get(&x1).map(|b| &b.pat), Some(&x1));
        assert!(env.get(&x0).is_none());
        assert_eq!(env.get_top("x").map(|b| &b.pat), Some(&x1));
    }

    #[test]
    fn test_reparent_limits_depth() {
        let mut env = Env::empty();
        for i in 0..100 {
            env = env.bind(Binding::of(id("x", i)));
        }
        // rebinding the same name repeatedly must not grow the chain
        assert_eq!(env.depth(), 1);
        assert_eq!(env.get_top("x").map(|b| b.pat.ordinal), Some(99));
    }

    #[test]
    fn test_bulk_bind_builds_map() {
        let names = ["a", "b", "c", "d", "e", "f"];
        let bindings: Vec<Binding> = names
            .iter()
            .enumerate()
            .map(|(i, n)| Binding::of(id(n, i as u32)))
            .collect();
        let env = Env::empty().bulk_bind(bindings);
        assert_eq!(env.depth(), 1);
        for (i, n) in names.iter().enumerate() {
            assert_eq!(env.get_top(n).map(|b| b.pat.ordinal), Some(i as u32));
        }
    }

    #[test]
    fn test_bulk_bind_skips_fully_obscured_ancestor() {
        let old: Vec<Binding> = ["a", "b", "c", "d", "e"]
            .iter()
            .enumerate()
            .map(|(i, n)| Binding::of(id(n, i as u32)))
            .collect();
        let env = Env::empty().bulk_bind(old);
        assert_eq!(env.depth(), 1);

        // rebind the same five names; the old map node is fully obscured
        let new: Vec<Binding> = ["a", "b", "c", "d", "e"]
            .iter()
            .enumerate()
            .map(|(i, n)| Binding::of(id(n, 10 + i as u32)))
            .collect();
        let env2 = env.bulk_bind(new);
        assert_eq!(env2.depth(), 1);
        assert_eq!(env2.get_top("a").map(|b| b.pat.ordinal), Some(10));
    }

    #[test]
    fn test_bulk_bind_keeps_partially_obscured_ancestor() {
        let old: Vec<Binding> = ["a", "b", "c", "d", "z"]
            .iter()
            .enumerate()
            .map(|(i, n)| Binding::of(id(n, i as u32)))
            .collect();
        let env = Env::empty().bulk_bind(old);

        let new: Vec<Binding> = ["a", "b", "c", "d", "e"]
            .iter()
            .enumerate()
            .map(|(i, n)| Binding::of(id(n, 10 + i as u32)))
            .collect();
        let env2 = env.bulk_bind(new);
        assert_eq!(env2.depth(), 2);
        // z survives from the partially obscured ancestor
        assert_eq!(env2.get_top("z").map(|b| b.pat.ordinal), Some(4));
    }

    #[test]
    fn test_small_bulk_bind_chains() {
        let bindings: Vec<Binding> = ["a", "b"]
            .iter()
            .enumerate()
            .map(|(i, n)| Binding::of(id(n, i as u32)))
            .collect();
        let env = Env::empty().bulk_bind(bindings);
        assert_eq!(env.depth(), 2);
    }

    #[test]
    fn test_inlined_value() {
        let x = id("x", 0);
        let env = Env::empty().bind(Binding::with_value(x.clone(), Exp::int(42)));
        assert_eq!(env.get(&x).and_then(|b| b.value.clone()), Some(Exp::int(42)));
    }

    #[test]
    fn test_global_cache_reuses_entries() {
        let key = EnvKey {
            session: Some("repl".to_string()),
            include_builtins: true,
        };
        let built = global_cache().get_or_insert(key.clone(), || {
            Env::empty().bind(Binding::of(id("builtin", 7)))
        });
        // second request must hit the cache, not the builder
        let cached = global_cache().get_or_insert(key, Env::empty);
        assert_eq!(built.get_top("builtin").map(|b| b.pat.ordinal), Some(7));
        assert_eq!(cached.get_top("builtin").map(|b| b.pat.ordinal), Some(7));
    }

    #[test]
    fn test_cache_eviction() {
        let cache = EnvCache::new(2);
        let k = |n: u32| EnvKey {
            session: Some(n.to_string()),
            include_builtins: true,
        };
        cache.get_or_insert(k(1), Env::empty);
        cache.get_or_insert(k(2), Env::empty);
        // touch 1 so that 2 is the LRU entry
        cache.get_or_insert(k(1), Env::empty);
        cache.get_or_insert(k(3), Env::empty);
        assert_eq!(cache.len(), 2);
    }
}
