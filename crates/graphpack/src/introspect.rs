//! Field introspection for composite types.
//!
//! A [`Layout`] is the flattened shape of a composite type: every
//! declared field across the ancestor chain, walked from the type itself
//! upward, in declaration order within each level. Instances store their
//! field values in layout order.
//!
//! The *wire order* is derived from the layout: within each level the
//! fields are sorted lexicographically by name and skip-flagged fields
//! are dropped. Writer and reader both derive this order from the same
//! registry, which is what makes schema rows comparable across
//! processes. The order depends only on the descriptors, never on the
//! order in which instances are discovered.

use std::sync::Arc;

use fxhash::FxHashMap;

use crate::error::{Error, Result};
use crate::registry::{TypeKind, TypeRef, TypeRegistry};

/// One declared field with its declared type resolved.
pub(crate) struct FieldSlot {
    pub(crate) name: String,
    pub(crate) declared: TypeRef,
    pub(crate) skip: bool,
}

/// The storage and wire shape of a composite type.
pub(crate) struct Layout {
    slots: Vec<FieldSlot>,
    /// First occurrence wins, so derived fields shadow base fields of
    /// the same name for named access.
    by_name: FxHashMap<String, usize>,
    wire: Vec<usize>,
}

impl Layout {
    /// All declared fields in storage order.
    pub(crate) fn slots(&self) -> &[FieldSlot] {
        &self.slots
    }

    /// Storage index of the named field.
    pub(crate) fn slot_index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Storage indices of the serializable fields in wire order.
    pub(crate) fn wire(&self) -> &[usize] {
        &self.wire
    }
}

/// Builds the layout of a composite type by walking its ancestor chain.
pub(crate) fn build_layout(
    registry: &TypeRegistry,
    ty: &TypeRef,
) -> Result<Arc<Layout>> {
    let mut slots: Vec<FieldSlot> = Vec::new();
    let mut wire: Vec<usize> = Vec::new();

    let mut current = ty.clone();
    let mut seen = vec![current.token()];
    loop {
        let TypeKind::Object(def) = current.kind() else {
            return Err(Error::InvalidKind {
                ty: current.name().to_string(),
                wanted: "a composite type",
            });
        };

        let level_start = slots.len();
        for field in &def.fields {
            let declared = registry.resolve(&field.ty)?;
            slots.push(FieldSlot {
                name: field.name.clone(),
                declared,
                skip: field.skip,
            });
        }

        let mut level: Vec<usize> = (level_start..slots.len())
            .filter(|&i| !slots[i].skip)
            .collect();
        level.sort_by(|&a, &b| slots[a].name.cmp(&slots[b].name));
        wire.extend(level);

        match &def.extends {
            Some(parent) => {
                let parent = registry.resolve(parent)?;
                if seen.contains(&parent.token()) {
                    return Err(Error::malformed(format!(
                        "inheritance cycle involving `{}`",
                        parent.name()
                    )));
                }
                seen.push(parent.token());
                current = parent;
            }
            None => break,
        }
    }

    // 255 is the wire sentinel for schema-less types.
    if wire.len() > 254 {
        return Err(Error::TooManyFields {
            ty: ty.name().to_string(),
            count: wire.len(),
        });
    }

    let mut by_name = FxHashMap::default();
    for (index, slot) in slots.iter().enumerate() {
        by_name.entry(slot.name.clone()).or_insert(index);
    }

    Ok(Arc::new(Layout { slots, by_name, wire }))
}
