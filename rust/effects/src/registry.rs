//! Capability registry and layers
//!
//! A capability is identified by a zero-sized marker type implementing
//! [`Capability`]; the marker names the service type it resolves to.
//! Descriptions request capabilities with `Effect::service::<C>()` and never
//! see concrete implementations.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use weft_effects::{Capability, Registry};
//!
//! trait Greeter: Send + Sync {
//!     fn greet(&self) -> String;
//! }
//!
//! struct English;
//! impl Greeter for English {
//!     fn greet(&self) -> String {
//!         "hello".into()
//!     }
//! }
//!
//! struct GreeterKey;
//! impl Capability for GreeterKey {
//!     const NAME: &'static str = "Greeter";
//!     type Service = dyn Greeter;
//! }
//!
//! let registry = Registry::new().with::<GreeterKey>(Arc::new(English));
//! assert_eq!(registry.get::<GreeterKey>().unwrap().greet(), "hello");
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use weft_types::Defect;

use crate::effect::Effect;
use crate::node::{unerase, NodeRef, Value};

/// Marker type naming a service the runtime can resolve.
pub trait Capability: 'static {
    /// Stable identifier used in logs and `MissingCapability` defects.
    const NAME: &'static str;

    /// The service handed to descriptions, usually a trait object.
    type Service: ?Sized + Send + Sync + 'static;
}

/// Stable identifier for a capability.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CapabilityKey {
    name: &'static str,
    type_id: TypeId,
}

impl CapabilityKey {
    #[must_use]
    pub fn of<C: Capability>() -> Self {
        Self {
            name: C::NAME,
            type_id: TypeId::of::<C>(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for CapabilityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapabilityKey({})", self.name)
    }
}

impl fmt::Display for CapabilityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// A stored capability: a boxed `Arc<C::Service>`.
pub(crate) type Instance = Arc<dyn Any + Send + Sync>;

pub(crate) fn instance_of<C: Capability>(service: Arc<C::Service>) -> Instance {
    Arc::new(service)
}

pub(crate) fn service_of<C: Capability>(instance: &Instance) -> Option<Arc<C::Service>> {
    instance.downcast_ref::<Arc<C::Service>>().cloned()
}

/// Capability key to instance map.
///
/// Registries are persistent: extending one returns a new registry and
/// leaves the original untouched, so a `provide` scope can never leak its
/// capabilities to the enclosing description.
#[derive(Clone, Default)]
pub struct Registry {
    entries: Arc<HashMap<CapabilityKey, Instance>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or shadow) an instance of `C`.
    #[must_use]
    pub fn with<C: Capability>(self, service: Arc<C::Service>) -> Self {
        self.extended(CapabilityKey::of::<C>(), instance_of::<C>(service))
    }

    #[must_use]
    pub fn get<C: Capability>(&self) -> Option<Arc<C::Service>> {
        self.entries
            .get(&CapabilityKey::of::<C>())
            .and_then(service_of::<C>)
    }

    #[must_use]
    pub fn contains(&self, key: &CapabilityKey) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn keys(&self) -> Vec<CapabilityKey> {
        let mut keys: Vec<_> = self.entries.keys().copied().collect();
        keys.sort();
        keys
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn lookup(&self, key: &CapabilityKey) -> Option<&Instance> {
        self.entries.get(key)
    }

    pub(crate) fn extended(&self, key: CapabilityKey, instance: Instance) -> Self {
        let mut entries = (*self.entries).clone();
        entries.insert(key, instance);
        Self {
            entries: Arc::new(entries),
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.keys()).finish()
    }
}

/// Turns an acquired value into the stored instance and its release step.
pub(crate) type SealFn = Arc<dyn Fn(Value) -> Result<(Instance, NodeRef), Defect> + Send + Sync>;

/// One entry of a layer, erased.
pub(crate) enum LayerEntry {
    Instance {
        key: CapabilityKey,
        instance: Instance,
    },
    Scoped {
        key: CapabilityKey,
        acquire: NodeRef,
        seal: SealFn,
    },
}

impl LayerEntry {
    pub(crate) fn key(&self) -> CapabilityKey {
        match self {
            LayerEntry::Instance { key, .. } | LayerEntry::Scoped { key, .. } => *key,
        }
    }
}

impl Clone for LayerEntry {
    fn clone(&self) -> Self {
        match self {
            LayerEntry::Instance { key, instance } => LayerEntry::Instance {
                key: *key,
                instance: instance.clone(),
            },
            LayerEntry::Scoped { key, acquire, seal } => LayerEntry::Scoped {
                key: *key,
                acquire: acquire.clone(),
                seal: seal.clone(),
            },
        }
    }
}

/// An ordered registry fragment handed to `Effect::provide`.
///
/// Entries are installed in order, so a scoped factory may depend on any
/// capability that appears earlier in the same layer. Scoped entries are
/// released in reverse order when the `provide` scope closes. `E` is the
/// failure type of the factories.
pub struct Layer<E> {
    entries: Vec<LayerEntry>,
    _error: PhantomData<fn() -> E>,
}

impl<E> Clone for Layer<E> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            _error: PhantomData,
        }
    }
}

impl<E> Default for Layer<E> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            _error: PhantomData,
        }
    }
}

impl<E: Send + 'static> Layer<E> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Layer with a single, already constructed instance.
    #[must_use]
    pub fn instance<C: Capability>(service: Arc<C::Service>) -> Self {
        Self::new().with_instance::<C>(service)
    }

    #[must_use]
    pub fn with_instance<C: Capability>(mut self, service: Arc<C::Service>) -> Self {
        self.entries.push(LayerEntry::Instance {
            key: CapabilityKey::of::<C>(),
            instance: instance_of::<C>(service),
        });
        self
    }

    /// Layer with a single scoped entry.
    #[must_use]
    pub fn scoped<C, F>(acquire: Effect<Arc<C::Service>, E>, release: F) -> Self
    where
        C: Capability,
        F: Fn(Arc<C::Service>) -> Effect<(), Infallible> + Send + Sync + 'static,
    {
        Self::new().with_scoped::<C, F>(acquire, release)
    }

    /// Add a capability built by `acquire` and torn down by `release`.
    ///
    /// `release` runs exactly once per successful acquisition, whatever way
    /// the scope exits, and cannot be interrupted.
    #[must_use]
    pub fn with_scoped<C, F>(mut self, acquire: Effect<Arc<C::Service>, E>, release: F) -> Self
    where
        C: Capability,
        F: Fn(Arc<C::Service>) -> Effect<(), Infallible> + Send + Sync + 'static,
    {
        let seal: SealFn = Arc::new(move |value: Value| {
            let service = unerase::<Arc<C::Service>>(value)?;
            let release_node = release(service.clone()).into_node();
            Ok((instance_of::<C>(service), release_node))
        });
        self.entries.push(LayerEntry::Scoped {
            key: CapabilityKey::of::<C>(),
            acquire: acquire.into_node(),
            seal,
        });
        self
    }

    /// Concatenate two layers; entries of `other` come after ours.
    #[must_use]
    pub fn and(mut self, other: Layer<E>) -> Self {
        self.entries.extend(other.entries);
        self
    }

    /// Keys this layer discharges, in installation order.
    #[must_use]
    pub fn keys(&self) -> Vec<CapabilityKey> {
        self.entries.iter().map(LayerEntry::key).collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn into_entries(self) -> Vec<LayerEntry> {
        self.entries
    }
}

impl<E> fmt::Debug for Layer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(LayerEntry::key))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Counter: Send + Sync {
        fn value(&self) -> u32;
    }

    struct Fixed(u32);
    impl Counter for Fixed {
        fn value(&self) -> u32 {
            self.0
        }
    }

    struct CounterKey;
    impl Capability for CounterKey {
        const NAME: &'static str = "Counter";
        type Service = dyn Counter;
    }

    struct OtherKey;
    impl Capability for OtherKey {
        const NAME: &'static str = "Other";
        type Service = String;
    }

    #[test]
    fn test_registry_is_persistent() {
        let base = Registry::new();
        let extended = base.clone().with::<CounterKey>(Arc::new(Fixed(3)));
        assert!(base.get::<CounterKey>().is_none());
        assert_eq!(extended.get::<CounterKey>().unwrap().value(), 3);
    }

    #[test]
    fn test_registry_shadowing() {
        let registry = Registry::new()
            .with::<CounterKey>(Arc::new(Fixed(1)))
            .with::<CounterKey>(Arc::new(Fixed(2)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get::<CounterKey>().unwrap().value(), 2);
    }

    #[test]
    fn test_sized_service() {
        let registry = Registry::new().with::<OtherKey>(Arc::new("hi".to_string()));
        assert_eq!(registry.get::<OtherKey>().unwrap().as_str(), "hi");
        assert!(registry.contains(&CapabilityKey::of::<OtherKey>()));
    }

    #[test]
    fn test_layer_keys_in_order() {
        let layer: Layer<()> = Layer::new()
            .with_instance::<OtherKey>(Arc::new(String::new()))
            .with_instance::<CounterKey>(Arc::new(Fixed(0)));
        let names: Vec<_> = layer.keys().iter().map(CapabilityKey::name).collect();
        assert_eq!(names, vec!["Other", "Counter"]);
    }
}
