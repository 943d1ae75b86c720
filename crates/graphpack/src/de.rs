//! Deserialization driver.
//!
//! Reading is phase-per-phase over the whole stream: every object is
//! *announced* (type read, storage allocated) before any body is parsed,
//! every body is parsed before any custom constructor runs, and every
//! constructor runs before any post-deserialization callback. The
//! id-first allocation is what lets back- and cross-references of any
//! shape resolve: by the time a reference id is read, its referent
//! already exists, even if its own fields are still placeholders.
//!
//! Schema validation is strict: any divergence between the stream's
//! schema rows and the registry's current descriptors is fatal. There is
//! no version negotiation and no recovery.

use std::cell::RefCell;
use std::io::Read;
use std::rc::Rc;

use crate::custom::KeyValueMap;
use crate::error::{Error, Result};
use crate::registry::TypeKind;
use crate::stream::{needs_wide_index, WireDecoder};
use crate::value::{Instance, ObjRef, Value};
use crate::Serializer;

/// Call-local deserialization state: the object table.
pub(crate) struct ReadGraph {
    /// Indexed by object id; slot 0 is the null reference.
    objects: Vec<Option<ObjRef>>,
    wide_objects: bool,
}

impl ReadGraph {
    pub(crate) fn wide_objects(&self) -> bool {
        self.wide_objects
    }

    /// Resolves an object id read from a body; 0 is null.
    pub(crate) fn resolve_ref(&self, id: u32) -> Result<Option<ObjRef>> {
        if id == 0 {
            return Ok(None);
        }
        match self.objects.get(id as usize) {
            Some(Some(obj)) => Ok(Some(obj.clone())),
            _ => Err(Error::malformed(format!("object id {id} out of range"))),
        }
    }
}

impl Serializer {
    /// Reconstructs the object graph from `reader` and returns its root,
    /// or `None` for the serialized null root.
    pub fn deserialize<R: Read>(&self, reader: &mut R) -> Result<Option<ObjRef>> {
        let mut input = WireDecoder::new(reader);

        // Header.
        let types_count = input.read_var_u32()?;
        let objects_count = input.read_var_u32()?;
        let type_count_for_objects = input.read_var_u32()?;
        let string_type_id = input.read_var_i32()?;
        if objects_count == 0 {
            return Err(Error::malformed("object count must be at least 1"));
        }
        if type_count_for_objects > types_count {
            return Err(Error::malformed(
                "object-type region larger than the type table",
            ));
        }

        // Type names.
        let mut types = Vec::with_capacity(types_count as usize);
        for _ in 0..types_count {
            let name = input.read_str()?;
            types.push(self.registry().resolve(&name)?);
        }
        if string_type_id >= 0 {
            let names_str = types
                .get(string_type_id as usize)
                .is_some_and(|ty| matches!(ty.kind(), TypeKind::Str));
            if !names_str {
                return Err(Error::malformed(
                    "string type id does not name the string type",
                ));
            }
        }

        // Schema rows, validated against the current descriptors.
        let wide_types = needs_wide_index(types_count);
        for ty in &types {
            let count = input.read_u8()?;
            if count == 255 {
                if !ty.is_special() {
                    return Err(Error::SchemaSpecialMismatch(
                        ty.name().to_string(),
                    ));
                }
                continue;
            }
            if ty.is_special() {
                return Err(Error::SchemaSpecialMismatch(ty.name().to_string()));
            }
            let layout = self.registry().layout(ty)?;
            if usize::from(count) != layout.wire().len() {
                return Err(Error::SchemaFieldMismatch {
                    ty: ty.name().to_string(),
                    detail: format!(
                        "{} fields in the stream, {} locally",
                        count,
                        layout.wire().len()
                    ),
                });
            }
            for &slot in layout.wire() {
                let field = &layout.slots()[slot];
                let field_type_id = input.read_index(wide_types)?;
                let field_name = input.read_str()?;
                let field_ty =
                    types.get(field_type_id as usize).ok_or_else(|| {
                        Error::malformed("field type id out of range")
                    })?;
                if field_name != field.name {
                    return Err(Error::SchemaFieldMismatch {
                        ty: ty.name().to_string(),
                        detail: format!(
                            "field `{field_name}` in the stream, `{}` locally",
                            field.name
                        ),
                    });
                }
                if field_ty.name() != field.declared.name() {
                    return Err(Error::SchemaFieldMismatch {
                        ty: ty.name().to_string(),
                        detail: format!(
                            "field `{}` is `{}` in the stream, `{}` locally",
                            field.name,
                            field_ty.name(),
                            field.declared.name()
                        ),
                    });
                }
            }
        }

        // Creation prelude: announce and allocate every object before
        // any body is parsed. Ids run 1..=N over the non-null instances,
        // so the width is governed by N, not the table size.
        let wide_objects = needs_wide_index(objects_count - 1);
        let mut graph = ReadGraph {
            objects: Vec::with_capacity(objects_count as usize),
            wide_objects,
        };
        graph.objects.push(None);
        let mut object_types: Vec<u32> = vec![0];
        for _ in 1..objects_count {
            let type_id = input.read_index(wide_types)?;
            if type_id >= type_count_for_objects {
                return Err(Error::malformed(
                    "schema-only type id used for an instance",
                ));
            }
            let ty = &types[type_id as usize];
            let inst = match ty.kind() {
                TypeKind::Str => Instance::Str(input.read_str()?),
                TypeKind::Array { elem } => {
                    let len = input.read_i32()?;
                    let len = usize::try_from(len).map_err(|_| {
                        Error::malformed("negative array length")
                    })?;
                    let mut guard = Vec::new();
                    let mut items = Vec::with_capacity(len);
                    for _ in 0..len {
                        items.push(
                            self.registry().default_value(elem, &mut guard)?,
                        );
                    }
                    Instance::Array { elem: elem.clone(), items }
                }
                TypeKind::Primitive(kind) | TypeKind::Enum { repr: kind } => {
                    Instance::Boxed(kind.default_value())
                }
                TypeKind::Object(def) if def.value_type => Instance::Boxed(
                    Value::Struct(
                        self.registry().default_struct(ty, &mut Vec::new())?,
                    ),
                ),
                TypeKind::Object(_) => self.registry().allocate_object(ty)?,
                TypeKind::Custom(_) => {
                    Instance::Custom { ty: ty.clone(), data: None }
                }
            };
            object_types.push(type_id);
            graph.objects.push(Some(Rc::new(RefCell::new(inst))));
        }

        // Bodies. Custom instances collect their key-value map and defer
        // construction until every body is parsed.
        let mut deferred: Vec<(usize, KeyValueMap)> = Vec::new();
        for id in 1..objects_count as usize {
            let ty = &types[object_types[id] as usize];
            if matches!(ty.kind(), TypeKind::Custom(_)) {
                let member_count = input.read_var_u32()?;
                let mut map = KeyValueMap::new();
                for _ in 0..member_count {
                    let name = input.read_str()?;
                    let value_id = input.read_index(wide_objects)?;
                    map.insert(name, graph.resolve_ref(value_id)?);
                }
                deferred.push((id, map));
            } else {
                let codec = self.codec_for(ty)?;
                let Some(obj) = graph.objects[id].clone() else {
                    return Err(Error::malformed("missing allocated instance"));
                };
                let mut inst = obj.borrow_mut();
                codec.read(&mut inst, &graph, &mut input)?;
            }
        }

        // Deferred custom construction, in id order.
        for (id, map) in &deferred {
            let ty = &types[object_types[*id] as usize];
            let TypeKind::Custom(def) = ty.kind() else {
                return Err(Error::malformed("codec kind disagreement"));
            };
            let construct = def.construct.as_ref().ok_or_else(|| {
                Error::NoConstructor(ty.name().to_string())
            })?;
            let data = construct.as_ref()(map)?;
            let Some(obj) = graph.objects[*id].clone() else {
                return Err(Error::malformed("missing allocated instance"));
            };
            let mut inst = obj.borrow_mut();
            match &mut *inst {
                Instance::Custom { data: slot, .. } => *slot = Some(data),
                _ => {
                    return Err(Error::malformed(
                        "instance does not match its type's codec",
                    ))
                }
            }
        }

        // Post-deserialization callbacks, in id order.
        for id in 1..objects_count as usize {
            let ty = &types[object_types[id] as usize];
            let hook = match ty.kind() {
                TypeKind::Object(def) => def.on_deserialized.as_ref(),
                TypeKind::Custom(def) => def.on_deserialized.as_ref(),
                _ => None,
            };
            if let Some(hook) = hook {
                if let Some(obj) = &graph.objects[id] {
                    hook.as_ref()(obj);
                }
            }
        }

        tracing::debug!(
            objects = objects_count,
            types = types_count,
            "deserialized object graph"
        );
        Ok(graph.objects.get(1).and_then(|slot| slot.clone()))
    }
}
