// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Typed, phase-scoped values attached to module variants.
//!
//! Providers are registered once at process startup and receive a dense
//! integer id; each variant carries a lazily grown slot array indexed by
//! that id. The engine enforces the access windows (set only by the
//! associated mutator or during the variant's own generate call, read
//! only afterwards) at the context layer; violations panic, because they
//! are embedder programming errors, not build errors.

use std::any::{type_name, Any};
use std::marker::PhantomData;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

#[derive(Clone, Debug)]
pub(crate) struct ProviderInfo {
    /// The mutator whose visit window is allowed to set this provider;
    /// `None` means the provider is generate-phase scoped.
    pub(crate) mutator: Option<String>,
    pub(crate) type_name: &'static str,
}

static REGISTRY: Lazy<RwLock<Vec<ProviderInfo>>> = Lazy::new(|| RwLock::new(Vec::new()));

/// A typed handle to a registered provider. Cheap to copy; the type
/// parameter pins the stored value's type at compile time.
pub struct ProviderKey<T> {
    id: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ProviderKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ProviderKey<T> {}

impl<T> ProviderKey<T> {
    pub(crate) fn id(&self) -> usize {
        self.id
    }
}

/// Registers a generate-phase provider: set during the owning variant's
/// `generate_build_actions`, readable afterwards.
pub fn new_provider<T: Any + Send + Sync>() -> ProviderKey<T> {
    register::<T>(None)
}

/// Registers a provider tied to a mutator: set only during that mutator's
/// visit of the owning variant, readable by anything that runs later.
pub fn new_mutator_provider<T: Any + Send + Sync>(mutator: &str) -> ProviderKey<T> {
    register::<T>(Some(mutator.to_string()))
}

fn register<T: Any + Send + Sync>(mutator: Option<String>) -> ProviderKey<T> {
    let mut registry = REGISTRY.write();
    let id = registry.len();
    registry.push(ProviderInfo {
        mutator,
        type_name: type_name::<T>(),
    });
    ProviderKey {
        id,
        _marker: PhantomData,
    }
}

pub(crate) fn provider_info(id: usize) -> ProviderInfo {
    REGISTRY.read()[id].clone()
}

/// Stores a value into a slot array, enforcing write-once.
pub(crate) fn store<T: Any + Send + Sync>(
    slots: &mut Vec<Option<Arc<dyn Any + Send + Sync>>>,
    key: ProviderKey<T>,
    value: T,
    module_desc: &str,
) {
    if slots.len() <= key.id {
        slots.resize_with(key.id + 1, || None);
    }
    if slots[key.id].is_some() {
        panic!(
            "provider misuse: {} already set on module {module_desc}",
            provider_info(key.id).type_name
        );
    }
    slots[key.id] = Some(Arc::new(value));
}

/// Reads a slot; `None` is the "not present" signal.
pub(crate) fn load<T: Any + Send + Sync>(
    slots: &[Option<Arc<dyn Any + Send + Sync>>],
    key: ProviderKey<T>,
) -> Option<Arc<T>> {
    let slot = slots.get(key.id)?.clone()?;
    match slot.downcast::<T>() {
        Ok(value) => Some(value),
        Err(_) => panic!(
            "provider misuse: slot {} holds a value of the wrong type (registered as {})",
            key.id,
            provider_info(key.id).type_name
        ),
    }
}
