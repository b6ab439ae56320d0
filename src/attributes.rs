//! Typed extension storage shared by requests and engines.
//!
//! Keys are declared once as module-level constants and compared by identity
//! (name plus value type), so the same key can be used across every client
//! instance without being re-created per call.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Strongly typed key into an [`Attributes`] bag
///
/// # Examples
///
/// ```rust
/// use rusttpx_core::attributes::{AttributeKey, Attributes};
///
/// const RETRIES: AttributeKey<u32> = AttributeKey::new("Retries");
///
/// let mut attributes = Attributes::new();
/// attributes.put(RETRIES, 3);
/// assert_eq!(attributes.get(RETRIES), Some(&3));
/// ```
pub struct AttributeKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AttributeKey<T> {
    /// Declare a key
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    /// Get the key name
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for AttributeKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for AttributeKey<T> {}

impl<T> fmt::Debug for AttributeKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttributeKey({})", self.name)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct RawKey {
    name: &'static str,
    type_id: TypeId,
}

impl RawKey {
    fn of<T: 'static>(key: AttributeKey<T>) -> Self {
        Self {
            name: key.name,
            type_id: TypeId::of::<T>(),
        }
    }
}

/// Heterogeneous map from [`AttributeKey`] to values
///
/// Values are reference counted, so cloning a bag for a new request attempt
/// is cheap and never copies the stored values.
#[derive(Clone, Default)]
pub struct Attributes {
    map: HashMap<RawKey, Arc<dyn Any + Send + Sync>>,
}

impl Attributes {
    /// Create an empty attribute bag
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the value stored under `key`
    pub fn get<T: Send + Sync + 'static>(&self, key: AttributeKey<T>) -> Option<&T> {
        self.map
            .get(&RawKey::of(key))
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Get a shared handle to the value stored under `key`
    pub fn get_arc<T: Send + Sync + 'static>(&self, key: AttributeKey<T>) -> Option<Arc<T>> {
        self.map
            .get(&RawKey::of(key))
            .cloned()
            .and_then(|value| value.downcast::<T>().ok())
    }

    /// Store `value` under `key`, replacing any previous value
    pub fn put<T: Send + Sync + 'static>(&mut self, key: AttributeKey<T>, value: T) {
        self.map.insert(RawKey::of(key), Arc::new(value));
    }

    /// Store an already shared value under `key`
    pub fn put_arc<T: Send + Sync + 'static>(&mut self, key: AttributeKey<T>, value: Arc<T>) {
        self.map.insert(RawKey::of(key), value);
    }

    /// Get the value under `key`, storing the result of `init` first if absent
    pub fn compute_if_absent<T, F>(&mut self, key: AttributeKey<T>, init: F) -> Arc<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        if let Some(value) = self.get_arc(key) {
            return value;
        }
        let value = Arc::new(init());
        self.put_arc(key, value.clone());
        value
    }

    /// Check whether a value is stored under `key`
    pub fn contains<T: Send + Sync + 'static>(&self, key: AttributeKey<T>) -> bool {
        self.map.contains_key(&RawKey::of(key))
    }

    /// Remove and return the value under `key`
    pub fn remove<T: Send + Sync + 'static>(&mut self, key: AttributeKey<T>) -> Option<Arc<T>> {
        self.map
            .remove(&RawKey::of(key))
            .and_then(|value| value.downcast::<T>().ok())
    }

    /// Copy every entry of `other` into this bag, overriding existing keys
    pub fn put_all(&mut self, other: &Attributes) {
        for (key, value) in &other.map {
            self.map.insert(*key, value.clone());
        }
    }

    /// Names of all stored keys
    pub fn key_names(&self) -> Vec<&'static str> {
        self.map.keys().map(|key| key.name).collect()
    }

    /// Get the number of stored values
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Check if the bag is empty
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.key_names()).finish()
    }
}
