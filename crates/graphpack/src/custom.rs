//! Custom-serialization adapter.
//!
//! Types can opt out of field reflection and describe themselves as an
//! ordered name→value map instead. On write, the type's capture hook
//! turns the payload into a [`KeyValueMap`] whose values are marked like
//! any other reference. On read, the map is rebuilt from the stream and
//! handed to the type's deserialization constructor — deferred until
//! every referenced object exists *and* has had its fields filled, so
//! map values may point anywhere in the graph, including back at objects
//! parsed later.

use std::any::Any;
use std::sync::Arc;

use crate::error::Result;
use crate::value::ObjRef;

/// Capture hook: turns a custom payload into its key-value description.
pub type CaptureFn = Arc<dyn Fn(&dyn Any) -> KeyValueMap + Send + Sync>;

/// Deserialization constructor: rebuilds a custom payload from its
/// reconstructed key-value description.
pub type ConstructFn =
    Arc<dyn Fn(&KeyValueMap) -> Result<Box<dyn Any>> + Send + Sync>;

/// Post-deserialization callback, invoked once per object in id order
/// after the whole graph is reconstructed.
pub type DeserializedHook = Arc<dyn Fn(&ObjRef) + Send + Sync>;

/// An ordered name→value map; values are nullable heap references.
///
/// Entry order is preserved on the wire and across a round-trip.
/// Primitive values must be boxed onto the heap
/// ([`Instance::boxed`](crate::value::Instance::boxed)) before insertion;
/// the serializer assigns each boxed value its own object id.
#[derive(Debug, Default)]
pub struct KeyValueMap {
    entries: Vec<(String, Option<ObjRef>)>,
}

impl KeyValueMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry. Names are not deduplicated; lookups return the
    /// first match.
    pub fn insert(&mut self, name: impl Into<String>, value: Option<ObjRef>) {
        self.entries.push((name.into(), value));
    }

    /// Returns the value under `name`, or `None` when the entry is
    /// missing or null.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ObjRef> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_ref())
    }

    /// Returns whether an entry with `name` exists, null or not.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    /// The entries in insertion order.
    #[must_use]
    pub fn entries(&self) -> &[(String, Option<ObjRef>)] {
        &self.entries
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Instance;

    #[test]
    fn test_map_preserves_order_and_nulls() {
        let mut map = KeyValueMap::new();
        let v = Instance::string("x");
        map.insert("b", Some(v.clone()));
        map.insert("a", None);

        assert_eq!(map.len(), 2);
        assert_eq!(map.entries()[0].0, "b");
        assert_eq!(map.entries()[1].0, "a");
        assert!(map.get("b").is_some());
        assert!(map.get("a").is_none());
        assert!(map.contains("a"));
        assert!(!map.contains("c"));
    }
}
