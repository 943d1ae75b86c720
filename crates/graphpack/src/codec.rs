//! Per-type codecs.
//!
//! For every concrete type encountered in a graph the serializer builds,
//! once, a [`Codec`]: a plan specialized to the type's field layout that
//! drives the three per-type operations — *scan* (enqueue outgoing
//! references), *write* (emit field content), *read* (restore field
//! content). Plans are cached on the [`Serializer`](crate::Serializer)
//! and shared across calls; they are never mutated after creation.
//!
//! Primitives dispatch to fixed-width stream operations, references to
//! the identity table, embedded value-structs recurse structurally, and
//! byte arrays take a raw-block fast path.

use std::io::{Read, Write};
use std::sync::Arc;

use crate::de::ReadGraph;
use crate::error::{Error, Result};
use crate::registry::{TypeKind, TypeRef, TypeRegistry};
use crate::ser::WriteGraph;
use crate::stream::{WireDecoder, WireEncoder};
use crate::value::{Instance, PrimKind, Value};

/// How one serializable field is treated on the wire.
pub(crate) enum FieldAction {
    /// Fixed-width primitive or enum representation.
    Prim(PrimKind),
    /// Embedded value-struct, recursed structurally.
    Embedded(Arc<StructPlan>),
    /// Reference, written as an object id.
    Reference,
}

/// A wire-ordered field with its storage slot.
pub(crate) struct PlannedField {
    pub(crate) slot: usize,
    pub(crate) action: FieldAction,
}

/// The compiled wire shape of a composite type.
pub(crate) struct StructPlan {
    pub(crate) fields: Vec<PlannedField>,
}

/// How array elements are treated on the wire.
pub(crate) enum ElemAction {
    /// `u8` elements, written as one raw block.
    Bytes,
    Prim(PrimKind),
    Embedded(Arc<StructPlan>),
    Reference,
}

/// The cached codec of one concrete type.
pub(crate) enum Codec {
    /// Boxed primitive or enum instance.
    Prim(PrimKind),
    /// String instance; content lives in the creation prelude, the body
    /// is empty.
    Str,
    /// Composite object, or a value-struct boxed at top level.
    Object(Arc<StructPlan>),
    Array(ElemAction),
    /// Handled by the drivers through the capture/construct hooks.
    Custom,
}

/// Builds the codec of a concrete type from its descriptor.
pub(crate) fn build(registry: &TypeRegistry, ty: &TypeRef) -> Result<Arc<Codec>> {
    tracing::trace!(ty = ty.name(), "building codec");
    let codec = match ty.kind() {
        TypeKind::Primitive(kind) => Codec::Prim(*kind),
        TypeKind::Enum { repr } => Codec::Prim(*repr),
        TypeKind::Str => Codec::Str,
        TypeKind::Custom(_) => Codec::Custom,
        TypeKind::Array { elem } => {
            Codec::Array(elem_action(registry, elem, &mut Vec::new())?)
        }
        TypeKind::Object(_) => {
            Codec::Object(struct_plan(registry, ty, &mut Vec::new())?)
        }
    };
    Ok(Arc::new(codec))
}

fn struct_plan(
    registry: &TypeRegistry,
    ty: &TypeRef,
    guard: &mut Vec<usize>,
) -> Result<Arc<StructPlan>> {
    let TypeKind::Object(def) = ty.kind() else {
        return Err(Error::InvalidKind {
            ty: ty.name().to_string(),
            wanted: "a composite type",
        });
    };
    if !def.serializable {
        return Err(Error::NotSerializable(ty.name().to_string()));
    }
    let layout = registry.layout(ty)?;
    let mut fields = Vec::with_capacity(layout.wire().len());
    for &slot in layout.wire() {
        let declared = &layout.slots()[slot].declared;
        let action = field_action(registry, declared, guard)?;
        fields.push(PlannedField { slot, action });
    }
    Ok(Arc::new(StructPlan { fields }))
}

fn field_action(
    registry: &TypeRegistry,
    declared: &TypeRef,
    guard: &mut Vec<usize>,
) -> Result<FieldAction> {
    match declared.kind() {
        TypeKind::Primitive(kind) | TypeKind::Enum { repr: kind } => {
            Ok(FieldAction::Prim(*kind))
        }
        TypeKind::Object(def) if def.value_type => {
            if guard.contains(&declared.token()) {
                return Err(Error::malformed(format!(
                    "value type `{}` embeds itself",
                    declared.name()
                )));
            }
            guard.push(declared.token());
            let plan = struct_plan(registry, declared, guard)?;
            guard.pop();
            Ok(FieldAction::Embedded(plan))
        }
        _ => Ok(FieldAction::Reference),
    }
}

fn elem_action(
    registry: &TypeRegistry,
    elem: &TypeRef,
    guard: &mut Vec<usize>,
) -> Result<ElemAction> {
    match elem.kind() {
        TypeKind::Primitive(PrimKind::U8) => Ok(ElemAction::Bytes),
        TypeKind::Primitive(kind) | TypeKind::Enum { repr: kind } => {
            Ok(ElemAction::Prim(*kind))
        }
        TypeKind::Object(def) if def.value_type => {
            guard.push(elem.token());
            let plan = struct_plan(registry, elem, guard)?;
            guard.pop();
            Ok(ElemAction::Embedded(plan))
        }
        _ => Ok(ElemAction::Reference),
    }
}

// =============================================================================
// Scan
// =============================================================================

impl Codec {
    /// Enqueues every reference the instance contains at depth 1; the
    /// scan loop handles deeper transitivity.
    pub(crate) fn scan(
        &self,
        inst: &Instance,
        graph: &mut WriteGraph,
    ) -> Result<()> {
        match (self, inst) {
            (Self::Prim(_) | Self::Str, _) => Ok(()),
            (Self::Object(plan), Instance::Object { fields, .. }) => {
                scan_struct(plan, fields, graph)
            }
            (Self::Object(plan), Instance::Boxed(Value::Struct(sv))) => {
                scan_struct(plan, &sv.fields, graph)
            }
            (Self::Array(action), Instance::Array { items, .. }) => match action {
                ElemAction::Bytes | ElemAction::Prim(_) => Ok(()),
                ElemAction::Embedded(plan) => {
                    for item in items {
                        let Value::Struct(sv) = item else {
                            return Err(mismatch());
                        };
                        scan_struct(plan, &sv.fields, graph)?;
                    }
                    Ok(())
                }
                ElemAction::Reference => {
                    for item in items {
                        let Value::Ref(target) = item else {
                            return Err(mismatch());
                        };
                        if let Some(obj) = target {
                            graph.mark(obj);
                        }
                    }
                    Ok(())
                }
            },
            (Self::Custom, _) => Ok(()),
            _ => Err(mismatch()),
        }
    }
}

fn scan_struct(
    plan: &StructPlan,
    fields: &[Value],
    graph: &mut WriteGraph,
) -> Result<()> {
    for planned in &plan.fields {
        let value = fields.get(planned.slot).ok_or_else(mismatch)?;
        match (&planned.action, value) {
            (FieldAction::Prim(_), _) => {}
            (FieldAction::Embedded(sub), Value::Struct(sv)) => {
                scan_struct(sub, &sv.fields, graph)?;
            }
            (FieldAction::Reference, Value::Ref(Some(obj))) => graph.mark(obj),
            (FieldAction::Reference, Value::Ref(None)) => {}
            _ => return Err(mismatch()),
        }
    }
    Ok(())
}

// =============================================================================
// Write
// =============================================================================

impl Codec {
    /// Emits the content of the instance. Ids and type tags are emitted
    /// by the driver's preludes, never here.
    pub(crate) fn write<W: Write>(
        &self,
        inst: &Instance,
        graph: &WriteGraph,
        out: &mut WireEncoder<W>,
    ) -> Result<()> {
        match (self, inst) {
            (Self::Prim(kind), Instance::Boxed(value)) => {
                write_prim(*kind, value, out)
            }
            (Self::Str, Instance::Str(_)) => Ok(()),
            (Self::Object(plan), Instance::Object { fields, .. }) => {
                write_struct(plan, fields, graph, out)
            }
            (Self::Object(plan), Instance::Boxed(Value::Struct(sv))) => {
                write_struct(plan, &sv.fields, graph, out)
            }
            (Self::Array(action), Instance::Array { items, .. }) => match action {
                ElemAction::Bytes => {
                    let mut bytes = Vec::with_capacity(items.len());
                    for item in items {
                        let Value::U8(b) = item else { return Err(mismatch()) };
                        bytes.push(*b);
                    }
                    out.emit_raw(&bytes)
                }
                ElemAction::Prim(kind) => {
                    for item in items {
                        write_prim(*kind, item, out)?;
                    }
                    Ok(())
                }
                ElemAction::Embedded(plan) => {
                    for item in items {
                        let Value::Struct(sv) = item else {
                            return Err(mismatch());
                        };
                        write_struct(plan, &sv.fields, graph, out)?;
                    }
                    Ok(())
                }
                ElemAction::Reference => {
                    for item in items {
                        let Value::Ref(target) = item else {
                            return Err(mismatch());
                        };
                        out.emit_index(
                            graph.ref_id(target)?,
                            graph.wide_objects(),
                        )?;
                    }
                    Ok(())
                }
            },
            (Self::Custom, _) => Err(Error::malformed(
                "custom bodies are emitted from the captured map",
            )),
            _ => Err(mismatch()),
        }
    }
}

fn write_struct<W: Write>(
    plan: &StructPlan,
    fields: &[Value],
    graph: &WriteGraph,
    out: &mut WireEncoder<W>,
) -> Result<()> {
    for planned in &plan.fields {
        let value = fields.get(planned.slot).ok_or_else(mismatch)?;
        match (&planned.action, value) {
            (FieldAction::Prim(kind), value) => write_prim(*kind, value, out)?,
            (FieldAction::Embedded(sub), Value::Struct(sv)) => {
                write_struct(sub, &sv.fields, graph, out)?;
            }
            (FieldAction::Reference, Value::Ref(target)) => {
                out.emit_index(graph.ref_id(target)?, graph.wide_objects())?;
            }
            _ => return Err(mismatch()),
        }
    }
    Ok(())
}

fn write_prim<W: Write>(
    kind: PrimKind,
    value: &Value,
    out: &mut WireEncoder<W>,
) -> Result<()> {
    match (kind, value) {
        (PrimKind::Bool, Value::Bool(v)) => out.emit_bool(*v),
        (PrimKind::U8, Value::U8(v)) => out.emit_u8(*v),
        (PrimKind::I8, Value::I8(v)) => out.emit_i8(*v),
        (PrimKind::U16, Value::U16(v)) => out.emit_u16(*v),
        (PrimKind::I16, Value::I16(v)) => out.emit_i16(*v),
        (PrimKind::U32, Value::U32(v)) => out.emit_u32(*v),
        (PrimKind::I32, Value::I32(v)) => out.emit_i32(*v),
        (PrimKind::U64, Value::U64(v)) => out.emit_u64(*v),
        (PrimKind::I64, Value::I64(v)) => out.emit_i64(*v),
        (PrimKind::F32, Value::F32(v)) => out.emit_f32(*v),
        (PrimKind::F64, Value::F64(v)) => out.emit_f64(*v),
        _ => Err(mismatch()),
    }
}

// =============================================================================
// Read
// =============================================================================

impl Codec {
    /// Restores the content of an already-allocated instance. Reference
    /// fields resolve through the object table, so back-references hit
    /// objects that exist but may not be filled yet.
    pub(crate) fn read<R: Read>(
        &self,
        inst: &mut Instance,
        graph: &ReadGraph,
        input: &mut WireDecoder<R>,
    ) -> Result<()> {
        match (self, inst) {
            (Self::Prim(kind), Instance::Boxed(value)) => {
                *value = read_prim(*kind, input)?;
                Ok(())
            }
            (Self::Str, Instance::Str(_)) => Ok(()),
            (Self::Object(plan), Instance::Object { fields, .. }) => {
                read_struct(plan, fields, graph, input)
            }
            (Self::Object(plan), Instance::Boxed(Value::Struct(sv))) => {
                read_struct(plan, &mut sv.fields, graph, input)
            }
            (Self::Array(action), Instance::Array { items, .. }) => match action {
                ElemAction::Bytes => {
                    let bytes = input.read_raw(items.len())?;
                    *items = bytes.into_iter().map(Value::U8).collect();
                    Ok(())
                }
                ElemAction::Prim(kind) => {
                    for item in items.iter_mut() {
                        *item = read_prim(*kind, input)?;
                    }
                    Ok(())
                }
                ElemAction::Embedded(plan) => {
                    for item in items.iter_mut() {
                        let Value::Struct(sv) = item else {
                            return Err(mismatch());
                        };
                        read_struct(plan, &mut sv.fields, graph, input)?;
                    }
                    Ok(())
                }
                ElemAction::Reference => {
                    for item in items.iter_mut() {
                        let id = input.read_index(graph.wide_objects())?;
                        *item = Value::Ref(graph.resolve_ref(id)?);
                    }
                    Ok(())
                }
            },
            (Self::Custom, _) => Err(Error::malformed(
                "custom bodies are parsed into the captured map",
            )),
            _ => Err(mismatch()),
        }
    }
}

fn read_struct<R: Read>(
    plan: &StructPlan,
    fields: &mut [Value],
    graph: &ReadGraph,
    input: &mut WireDecoder<R>,
) -> Result<()> {
    for planned in &plan.fields {
        match &planned.action {
            FieldAction::Prim(kind) => {
                let value = read_prim(*kind, input)?;
                *fields.get_mut(planned.slot).ok_or_else(mismatch)? = value;
            }
            FieldAction::Embedded(sub) => {
                let slot = fields.get_mut(planned.slot).ok_or_else(mismatch)?;
                let Value::Struct(sv) = slot else { return Err(mismatch()) };
                read_struct(sub, &mut sv.fields, graph, input)?;
            }
            FieldAction::Reference => {
                let id = input.read_index(graph.wide_objects())?;
                let value = Value::Ref(graph.resolve_ref(id)?);
                *fields.get_mut(planned.slot).ok_or_else(mismatch)? = value;
            }
        }
    }
    Ok(())
}

fn read_prim<R: Read>(
    kind: PrimKind,
    input: &mut WireDecoder<R>,
) -> Result<Value> {
    Ok(match kind {
        PrimKind::Bool => Value::Bool(input.read_bool()?),
        PrimKind::U8 => Value::U8(input.read_u8()?),
        PrimKind::I8 => Value::I8(input.read_i8()?),
        PrimKind::U16 => Value::U16(input.read_u16()?),
        PrimKind::I16 => Value::I16(input.read_i16()?),
        PrimKind::U32 => Value::U32(input.read_u32()?),
        PrimKind::I32 => Value::I32(input.read_i32()?),
        PrimKind::U64 => Value::U64(input.read_u64()?),
        PrimKind::I64 => Value::I64(input.read_i64()?),
        PrimKind::F32 => Value::F32(input.read_f32()?),
        PrimKind::F64 => Value::F64(input.read_f64()?),
    })
}

fn mismatch() -> Error {
    Error::malformed("instance does not match its type's codec")
}
