//! Typed service context.
//!
//! A [`Context`] is an immutable, typed map from service type to
//! implementation. It is the ambient environment of a fiber: the runtime
//! seeds the root fiber's context (with the clock service, at minimum),
//! `Effect::provide` swaps it for a scope, and forked children inherit
//! the parent's current context by default.
//!
//! Lookups are keyed by `TypeId`, so each service type has at most one
//! binding; providing the same type again shadows the previous binding.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// An immutable map from service type to shared implementation.
#[derive(Clone, Default)]
pub struct Context {
    services: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Context {
    /// An empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new context with `service` bound, shadowing any previous
    /// binding for `S`.
    #[must_use]
    pub fn with<S: Send + Sync + 'static>(&self, service: S) -> Self {
        self.with_shared(Arc::new(service))
    }

    /// Like [`Context::with`] but accepts an already-shared service.
    #[must_use]
    pub fn with_shared<S: Send + Sync + 'static>(&self, service: Arc<S>) -> Self {
        let mut services = self.services.clone();
        services.insert(TypeId::of::<S>(), service);
        Self { services }
    }

    /// Looks up the service of type `S`.
    #[must_use]
    pub fn get<S: Send + Sync + 'static>(&self) -> Option<Arc<S>> {
        self.services
            .get(&TypeId::of::<S>())
            .and_then(|service| Arc::clone(service).downcast::<S>().ok())
    }

    /// Returns true if a service of type `S` is bound.
    #[must_use]
    pub fn contains<S: Send + Sync + 'static>(&self) -> bool {
        self.services.contains_key(&TypeId::of::<S>())
    }

    /// The number of bound services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Returns true if no services are bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("services", &self.services.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Config {
        name: &'static str,
    }

    #[derive(Debug)]
    struct Counter(u64);

    #[test]
    fn provide_and_get() {
        let ctx = Context::new().with(Config { name: "a" });
        let config = ctx.get::<Config>().expect("config bound");
        assert_eq!(config.name, "a");
        assert!(ctx.get::<Counter>().is_none());
    }

    #[test]
    fn providing_shadows_previous_binding() {
        let ctx = Context::new().with(Config { name: "a" });
        let ctx2 = ctx.with(Config { name: "b" });
        assert_eq!(ctx.get::<Config>().expect("old").name, "a");
        assert_eq!(ctx2.get::<Config>().expect("new").name, "b");
        assert_eq!(ctx2.len(), 1);
    }

    #[test]
    fn contexts_are_persistent() {
        let base = Context::new();
        let extended = base.with(Counter(1));
        assert!(base.is_empty());
        assert!(extended.contains::<Counter>());
    }
}
