//! Identity-preserving binary serialization for in-memory object graphs.
//!
//! Given a root value, `graphpack` writes a self-describing byte stream
//! that preserves reference identity — shared references stay shared,
//! cycles stay cycles — along with primitive field contents, arrays, and
//! user-defined custom-serialization hooks. Given such a stream and the
//! same type definitions, it reconstructs an equivalent graph.
//!
//! # Overview
//!
//! The crate is built from a small set of cooperating pieces:
//!
//! - [`TypeRegistry`]: explicit descriptors for every serializable type,
//!   registered once under a fully-qualified name. Primitives and `str`
//!   are built in; array types are derived on demand.
//! - [`Instance`] / [`Value`] / [`ObjRef`]: the dynamic heap model.
//!   Instances live behind `Rc<RefCell<_>>` handles and are identified
//!   by address, which is what "same object" means on the wire.
//! - [`Serializer`]: owns the per-type codec cache and runs the two
//!   drivers. Serialization discovers every reachable instance under
//!   reference identity, then emits a type table, an instance-creation
//!   prelude, and a field-content body. Deserialization allocates every
//!   object before parsing any body, so references of any shape resolve.
//!
//! Schema evolution is out of scope: a mismatch in field count, order,
//! name, or declared type between writer and reader is a fatal error.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use graphpack::{Serializer, TypeDef, TypeRegistry, Value};
//!
//! let mut registry = TypeRegistry::new();
//! registry.register(
//!     TypeDef::object("demo::Node")
//!         .field("value", "i32")
//!         .field("next", "demo::Node")
//!         .build(),
//! )?;
//! let registry = Arc::new(registry);
//!
//! // Build a two-node cycle.
//! let a = registry.new_object("demo::Node")?;
//! let b = registry.new_object("demo::Node")?;
//! registry.set(&a, "value", Value::I32(1))?;
//! registry.set(&a, "next", Value::reference(&b))?;
//! registry.set(&b, "next", Value::reference(&a))?;
//!
//! let serializer = Serializer::new(registry.clone());
//! let mut bytes = Vec::new();
//! serializer.serialize(Some(&a), &mut bytes)?;
//!
//! // The cycle survives the round-trip.
//! let root = serializer.deserialize(&mut &bytes[..])?.unwrap();
//! ```

use std::sync::Arc;

use dashmap::DashMap;

mod codec;
mod de;
mod introspect;
mod ser;

pub mod custom;
pub mod error;
pub mod registry;
pub mod stream;
pub mod value;

pub use custom::KeyValueMap;
pub use error::{Error, Result};
pub use registry::{TypeDef, TypeKind, TypeRef, TypeRegistry};
pub use value::{Instance, ObjRef, PrimKind, StructValue, Value};

/// The serializer: a registry handle plus the shared per-type codec
/// cache.
///
/// One serializer can run any number of serialize/deserialize calls;
/// codecs are built on first encounter of a concrete type and reused
/// across calls. Per-call state (identity map, instance list, type
/// table) never outlives a call. Multiple serializers over the same
/// registry are independent.
pub struct Serializer {
    registry: Arc<TypeRegistry>,
    codecs: DashMap<usize, Arc<codec::Codec>>,
}

impl Serializer {
    /// Creates a serializer over the given registry.
    #[must_use]
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self { registry, codecs: DashMap::new() }
    }

    /// The registry this serializer resolves types against.
    #[must_use]
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// The cached codec of a concrete type, built on first encounter.
    /// Entries are immutable once inserted and shared across calls.
    pub(crate) fn codec_for(&self, ty: &TypeRef) -> Result<Arc<codec::Codec>> {
        if let Some(codec) = self.codecs.get(&ty.token()) {
            return Ok(Arc::clone(&codec));
        }
        let codec = codec::build(&self.registry, ty)?;
        self.codecs.insert(ty.token(), Arc::clone(&codec));
        Ok(codec)
    }
}
