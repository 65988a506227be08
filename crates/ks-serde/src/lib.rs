//! Process-local registry of per-primitive serialization collaborators.
//!
//! A `Lock`/`RateLimiter`/cache operation's handle serializes to a
//! minimal record (key, owner id, ttl, ...) that is cheap to send across
//! a process boundary. Rehydrating that record into a working handle
//! needs the adapter, namespace, and event bus it was minted from — this
//! registry is how the deserializing process finds them again, keyed by
//! a composite name (`component:adapter-class:namespace-prefix`) so two
//! providers built on different adapters never collide.
//!
//! Registration happens once, at provider construction time, and the
//! registry never shrinks afterward — readers (deserializers) need no
//! lock beyond the one guarding the map itself.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::RwLock;

/// Compose the transformer `name` used as a registry key: component tag
/// + adapter class name + namespace prefix.
pub fn transformer_name(component: &str, adapter_class: &str, namespace_prefix: &str) -> String {
    format!("{component}:{adapter_class}:{namespace_prefix}")
}

/// Process-local, append-only registry of collaborator bundles.
///
/// `T` is whatever per-engine struct bundles the adapter/namespace/event
/// bus an engine's handles need to rebind to (e.g. `LockCollaborators`).
/// Stored as `Arc<dyn Any + Send + Sync>` so one process can host
/// registries for multiple unrelated engines without `ks-serde` knowing
/// their concrete types.
#[derive(Default)]
pub struct SerdeRegistry {
    entries: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl SerdeRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// The process-wide registry. Most callers should use this rather
    /// than constructing their own, since rehydration needs to find
    /// whatever a *different* part of the process registered.
    pub fn global() -> &'static SerdeRegistry {
        static GLOBAL: OnceCell<SerdeRegistry> = OnceCell::new();
        GLOBAL.get_or_init(SerdeRegistry::new)
    }

    /// Register collaborators under `name`. Registering the same name
    /// twice overwrites the previous entry (e.g. a provider rebuilt with
    /// a different adapter during tests).
    pub fn register_custom<T: Any + Send + Sync>(&self, name: impl Into<String>, value: Arc<T>) {
        self.entries.write().insert(name.into(), value);
    }

    /// Look up collaborators by name, downcasting to `T`. Returns `None`
    /// if nothing is registered under `name`, or if it was registered
    /// with a different concrete type (a naming collision between two
    /// engines, which callers should treat as a programming error).
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        let entries = self.entries.read();
        entries.get(name).and_then(|v| v.clone().downcast::<T>().ok())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    pub fn unregister(&self, name: &str) {
        self.entries.write().remove(name);
    }
}

/// The version stamped on every serialized handle record, so a future
/// migration can add fields without breaking old payloads' `deserialize`.
pub const HANDLE_FORMAT_VERSION: u8 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    struct Collaborators {
        label: &'static str,
    }

    #[test]
    fn register_and_resolve() {
        let registry = SerdeRegistry::new();
        let name = transformer_name("lock", "in_memory", "cache:root1:");
        registry.register_custom(name.clone(), Arc::new(Collaborators { label: "a" }));

        let resolved = registry.get::<Collaborators>(&name).unwrap();
        assert_eq!(resolved.label, "a");
    }

    #[test]
    fn unregistered_name_returns_none() {
        let registry = SerdeRegistry::new();
        assert!(registry.get::<Collaborators>("missing").is_none());
    }

    #[test]
    fn type_mismatch_returns_none() {
        let registry = SerdeRegistry::new();
        registry.register_custom("k", Arc::new(42u32));
        assert!(registry.get::<Collaborators>("k").is_none());
    }

    #[test]
    fn different_namespace_prefix_different_name() {
        let a = transformer_name("cache", "redis", "app:tenantA:");
        let b = transformer_name("cache", "redis", "app:tenantB:");
        assert_ne!(a, b);
    }

    #[test]
    fn re_registering_overwrites() {
        let registry = SerdeRegistry::new();
        registry.register_custom("k", Arc::new(Collaborators { label: "first" }));
        registry.register_custom("k", Arc::new(Collaborators { label: "second" }));
        assert_eq!(registry.get::<Collaborators>("k").unwrap().label, "second");
    }
}
