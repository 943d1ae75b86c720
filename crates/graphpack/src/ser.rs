//! Serialization driver.
//!
//! Serialization runs in two phases over a call-local [`WriteGraph`]:
//!
//! 1. **Discovery.** The root is marked, then a scan loop walks the
//!    instance list with a monotonic cursor. Scanning an instance
//!    registers its runtime type, caches its codec, and marks every
//!    instance it references, so objects enqueued mid-scan are scanned
//!    later in the same pass. Custom-serializable instances are captured
//!    into their key-value map here and the map's values marked.
//! 2. **Emission.** Once discovery closes the graph, the type table is
//!    extended with declared field types, then the prelude (counts,
//!    names, schema rows), the creation prelude (type tags, string
//!    contents, array lengths), and the field bodies are emitted. No new
//!    id can appear during emission.

use std::io::Write;

use fxhash::FxHashMap;

use crate::codec::Codec;
use crate::custom::KeyValueMap;
use crate::error::{Error, Result};
use crate::registry::{TypeKind, TypeRef};
use crate::stream::{needs_wide_index, WireEncoder};
use crate::value::{identity, Instance, ObjRef};
use crate::Serializer;

/// Call-local serialization state: the identity map, the instance list,
/// and the per-stream type table.
pub(crate) struct WriteGraph {
    instances: Vec<ObjRef>,
    /// Instance address → object id. Id 0 is the null reference.
    ids: FxHashMap<usize, u32>,
    types: Vec<TypeRef>,
    /// Descriptor token → type id.
    type_index: FxHashMap<usize, u32>,
    /// Type id of every instance, parallel to `instances`.
    type_ids: Vec<u32>,
    /// Captured key-value maps of custom instances, by object id.
    captured: FxHashMap<u32, KeyValueMap>,
    wide_objects: bool,
}

impl WriteGraph {
    fn new() -> Self {
        Self {
            instances: Vec::new(),
            ids: FxHashMap::default(),
            types: Vec::new(),
            type_index: FxHashMap::default(),
            type_ids: Vec::new(),
            captured: FxHashMap::default(),
            wide_objects: false,
        }
    }

    /// Assigns the next object id on first sight; no-op for instances
    /// already discovered. Insertion order is discovery order.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn mark(&mut self, obj: &ObjRef) {
        let key = identity(obj);
        if self.ids.contains_key(&key) {
            return;
        }
        let id = self.instances.len() as u32 + 1;
        self.ids.insert(key, id);
        self.instances.push(obj.clone());
    }

    /// The object id a reference resolves to; 0 for null.
    pub(crate) fn ref_id(&self, target: &Option<ObjRef>) -> Result<u32> {
        match target {
            None => Ok(0),
            Some(obj) => self.ids.get(&identity(obj)).copied().ok_or_else(|| {
                Error::malformed("reference to an instance the scan never saw")
            }),
        }
    }

    pub(crate) fn wide_objects(&self) -> bool {
        self.wide_objects
    }

    /// The type id of a descriptor, assigned on first query.
    #[allow(clippy::cast_possible_truncation)]
    fn type_id_of(&mut self, ty: &TypeRef) -> u32 {
        if let Some(id) = self.type_index.get(&ty.token()) {
            return *id;
        }
        let id = self.types.len() as u32;
        self.type_index.insert(ty.token(), id);
        self.types.push(ty.clone());
        id
    }
}

impl Serializer {
    /// Serializes the graph reachable from `root` into `writer`.
    ///
    /// A `None` root writes the minimal stream that deserializes back to
    /// `None`. The output of a failed call is undefined and must be
    /// discarded.
    pub fn serialize<W: Write>(
        &self,
        root: Option<&ObjRef>,
        writer: &mut W,
    ) -> Result<()> {
        let mut out = WireEncoder::new(writer);
        let mut graph = WriteGraph::new();
        if let Some(root) = root {
            graph.mark(root);
        }

        self.scan(&mut graph)?;
        let type_count_for_objects = self.scan_types(&mut graph)?;
        self.emit(&mut graph, type_count_for_objects, &mut out)
    }

    /// Discovery: walk the instance list to a fixed point, registering
    /// runtime types and marking outgoing references.
    #[allow(clippy::cast_possible_truncation)]
    fn scan(&self, graph: &mut WriteGraph) -> Result<()> {
        let mut index = 0;
        while index < graph.instances.len() {
            let obj = graph.instances[index].clone();
            let inst = obj.borrow();
            let ty = self.registry().runtime_type(&inst)?;
            let type_id = graph.type_id_of(&ty);
            graph.type_ids.push(type_id);

            let codec = self.codec_for(&ty)?;
            if matches!(*codec, Codec::Custom) {
                let TypeKind::Custom(def) = ty.kind() else {
                    return Err(Error::malformed("codec kind disagreement"));
                };
                let Instance::Custom { data, .. } = &*inst else {
                    return Err(Error::malformed(
                        "instance does not match its type's codec",
                    ));
                };
                let data = data.as_ref().ok_or_else(|| {
                    Error::NotSerializable(ty.name().to_string())
                })?;
                let map = def.capture.as_ref()(data.as_ref());
                for (_, value) in map.entries() {
                    if let Some(obj) = value {
                        graph.mark(obj);
                    }
                }
                graph.captured.insert(index as u32 + 1, map);
            } else {
                codec.scan(&inst, graph)?;
            }
            index += 1;
        }
        Ok(())
    }

    /// Extends the type table with every type that appears only as a
    /// declared field type or array element type, transitively, so every
    /// schema row emitted later is resolvable.
    #[allow(clippy::cast_possible_truncation)]
    fn scan_types(&self, graph: &mut WriteGraph) -> Result<u32> {
        let type_count_for_objects = graph.types.len() as u32;
        let mut index = 0;
        while index < graph.types.len() {
            let ty = graph.types[index].clone();
            match ty.kind() {
                TypeKind::Object(_) => {
                    let layout = self.registry().layout(&ty)?;
                    for &slot in layout.wire() {
                        let declared = layout.slots()[slot].declared.clone();
                        graph.type_id_of(&declared);
                    }
                }
                TypeKind::Array { elem } => {
                    let elem = elem.clone();
                    graph.type_id_of(&elem);
                }
                _ => {}
            }
            index += 1;
        }
        Ok(type_count_for_objects)
    }

    /// Emission: prelude, creation prelude, bodies.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn emit<W: Write>(
        &self,
        graph: &mut WriteGraph,
        type_count_for_objects: u32,
        out: &mut WireEncoder<W>,
    ) -> Result<()> {
        let types_count = graph.types.len() as u32;
        let objects_count = u32::try_from(graph.instances.len() + 1)
            .map_err(|_| Error::malformed("instance count exceeds u32"))?;
        let string_type_id = graph
            .types
            .iter()
            .position(|ty| matches!(ty.kind(), TypeKind::Str))
            .map_or(-1i32, |index| index as i32);

        out.emit_var_u32(types_count)?;
        out.emit_var_u32(objects_count)?;
        out.emit_var_u32(type_count_for_objects)?;
        out.emit_var_i32(string_type_id)?;

        for ty in &graph.types {
            out.emit_str(ty.name())?;
        }

        // Schema rows.
        let wide_types = needs_wide_index(types_count);
        for ty in &graph.types {
            if ty.is_special() {
                out.emit_u8(255)?;
                continue;
            }
            let layout = self.registry().layout(ty)?;
            let count = u8::try_from(layout.wire().len()).map_err(|_| {
                Error::TooManyFields {
                    ty: ty.name().to_string(),
                    count: layout.wire().len(),
                }
            })?;
            out.emit_u8(count)?;
            for &slot in layout.wire() {
                let field = &layout.slots()[slot];
                let field_type_id = graph
                    .type_index
                    .get(&field.declared.token())
                    .copied()
                    .ok_or_else(|| {
                        Error::malformed("declared type missing from type table")
                    })?;
                out.emit_index(field_type_id, wide_types)?;
                out.emit_str(&field.name)?;
            }
        }

        // Creation prelude. Strings are materialized here: they are
        // immutable and cannot be filled in later like other instances.
        // Ids run 1..=N over the non-null instances, so N itself is the
        // largest id that must fit the narrow encoding.
        graph.wide_objects = needs_wide_index(objects_count - 1);
        for (index, obj) in graph.instances.iter().enumerate() {
            out.emit_index(graph.type_ids[index], wide_types)?;
            match &*obj.borrow() {
                Instance::Str(s) => out.emit_str(s)?,
                Instance::Array { items, .. } => {
                    let len = i32::try_from(items.len()).map_err(|_| {
                        Error::malformed("array length exceeds i32")
                    })?;
                    out.emit_i32(len)?;
                }
                _ => {}
            }
        }

        // Bodies.
        for (index, obj) in graph.instances.iter().enumerate() {
            let id = index as u32 + 1;
            if let Some(map) = graph.captured.get(&id) {
                let members = u32::try_from(map.len()).map_err(|_| {
                    Error::malformed("custom member count exceeds u32")
                })?;
                out.emit_var_u32(members)?;
                for (name, value) in map.entries() {
                    out.emit_str(name)?;
                    out.emit_index(graph.ref_id(value)?, graph.wide_objects)?;
                }
            } else {
                let inst = obj.borrow();
                let ty = &graph.types[graph.type_ids[index] as usize];
                let codec = self.codec_for(ty)?;
                codec.write(&inst, graph, out)?;
            }
        }

        tracing::debug!(
            objects = objects_count,
            types = types_count,
            "serialized object graph"
        );
        Ok(())
    }
}
