//! The zero-configuration building blocks `Keystone::new` assembles.
//!
//! Each function here is the "no-op" member of the pluggable contract
//! it belongs to: a namespace that encodes keys unchanged, an event
//! bus that drops every dispatch, and the process-local serde registry
//! with nothing custom registered in it. A caller that never touches
//! `ks-storage-redis`/`-mongodb`/`-sql` and never calls `add_listener`
//! never notices these are here.

use std::sync::Arc;

use ks_events::{EventBus, NoOpEventBus};
use ks_namespace::Namespace;
use ks_serde::SerdeRegistry;

/// A namespace that encodes keys verbatim, no root/root-id prefixing.
pub fn namespace() -> Namespace {
    Namespace::no_op()
}

/// An event bus that accepts listener registration but never invokes
/// them and never records a dispatch.
pub fn event_bus() -> Arc<dyn EventBus> {
    Arc::new(NoOpEventBus)
}

/// The process-local handle-mobility registry. Its "no-op" state is
/// simply having nothing registered under a given transformer name —
/// there's no separate no-op type, since an unpopulated registry
/// already behaves that way.
pub fn serde_registry() -> &'static SerdeRegistry {
    SerdeRegistry::global()
}
