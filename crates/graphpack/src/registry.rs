//! Type registry: the process-wide store of type descriptors.
//!
//! The serializer does not reflect over Rust types; instead every
//! serializable type is registered once, under its fully-qualified name,
//! as an explicit descriptor: its kind, its declared fields, an optional
//! parent type, and its hooks. The registry doubles as the resolver the
//! reader uses to turn stream type names back into descriptors, and as
//! the allocator that produces placeholder-filled instances before their
//! bodies are parsed.
//!
//! Primitive types and `str` are pre-registered. Array types are derived
//! on demand from their element type and interned under the canonical
//! `<elem>[]` name, so jagged arrays nest naturally (`i32[][]`).

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::RwLock;

use crate::custom::{CaptureFn, ConstructFn, DeserializedHook, KeyValueMap};
use crate::error::{Error, Result};
use crate::introspect::{self, Layout};
use crate::value::{Instance, ObjRef, PrimKind, StructValue, Value};

// =============================================================================
// Descriptors
// =============================================================================

/// A declared field of a composite type.
pub(crate) struct FieldDef {
    pub(crate) name: String,
    /// Declared type, by registered name; resolved lazily so mutually
    /// referential types can be registered in any order.
    pub(crate) ty: String,
    /// Excluded from the wire, present in storage.
    pub(crate) skip: bool,
}

/// Descriptor body of a composite (object or value-struct) type.
pub struct ObjectDef {
    pub(crate) value_type: bool,
    pub(crate) serializable: bool,
    pub(crate) extends: Option<String>,
    pub(crate) fields: Vec<FieldDef>,
    pub(crate) on_deserialized: Option<DeserializedHook>,
}

/// Descriptor body of a custom-serializable type.
pub struct CustomDef {
    pub(crate) capture: CaptureFn,
    pub(crate) construct: Option<ConstructFn>,
    pub(crate) on_deserialized: Option<DeserializedHook>,
}

/// The kind of a registered type.
pub enum TypeKind {
    Primitive(PrimKind),
    Str,
    Enum { repr: PrimKind },
    Array { elem: TypeRef },
    Object(ObjectDef),
    Custom(CustomDef),
}

/// A registered type: its unique name plus its kind.
pub struct TypeDef {
    name: String,
    kind: TypeKind,
}

impl TypeDef {
    /// Starts the descriptor of a reference-semantics composite type.
    #[must_use]
    pub fn object(name: impl Into<String>) -> ObjectBuilder {
        ObjectBuilder::new(name.into(), false)
    }

    /// Starts the descriptor of a value-semantics composite type, usable
    /// as an embedded field and boxable onto the heap.
    #[must_use]
    pub fn value_object(name: impl Into<String>) -> ObjectBuilder {
        ObjectBuilder::new(name.into(), true)
    }

    /// Builds the descriptor of an enum type carried as `repr` on the
    /// wire.
    #[must_use]
    pub fn enumeration(name: impl Into<String>, repr: PrimKind) -> Self {
        Self { name: name.into(), kind: TypeKind::Enum { repr } }
    }

    /// Starts the descriptor of a custom-serializable type with the
    /// given capture hook.
    #[must_use]
    pub fn custom<F>(name: impl Into<String>, capture: F) -> CustomBuilder
    where
        F: Fn(&dyn Any) -> KeyValueMap + Send + Sync + 'static,
    {
        CustomBuilder {
            name: name.into(),
            def: CustomDef {
                capture: Arc::new(capture),
                construct: None,
                on_deserialized: None,
            },
        }
    }

    /// The fully-qualified name of the type.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for TypeDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeDef({})", self.name)
    }
}

/// Builder for composite type descriptors.
pub struct ObjectBuilder {
    name: String,
    def: ObjectDef,
}

impl ObjectBuilder {
    fn new(name: String, value_type: bool) -> Self {
        Self {
            name,
            def: ObjectDef {
                value_type,
                serializable: true,
                extends: None,
                fields: Vec::new(),
                on_deserialized: None,
            },
        }
    }

    /// Declares the parent type; the introspector walks the chain from
    /// the type itself upward.
    #[must_use]
    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.def.extends = Some(parent.into());
        self
    }

    /// Declares a serializable field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, ty: impl Into<String>) -> Self {
        self.def.fields.push(FieldDef {
            name: name.into(),
            ty: ty.into(),
            skip: false,
        });
        self
    }

    /// Declares a field that is stored on instances but skipped on the
    /// wire.
    #[must_use]
    pub fn skipped_field(
        mut self,
        name: impl Into<String>,
        ty: impl Into<String>,
    ) -> Self {
        self.def.fields.push(FieldDef {
            name: name.into(),
            ty: ty.into(),
            skip: true,
        });
        self
    }

    /// Flags the type as excluded from serialization; reaching it on the
    /// scan path is an error.
    #[must_use]
    pub fn not_serializable(mut self) -> Self {
        self.def.serializable = false;
        self
    }

    /// Registers a callback invoked on every instance of this type after
    /// the whole graph is deserialized.
    #[must_use]
    pub fn on_deserialized<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ObjRef) + Send + Sync + 'static,
    {
        self.def.on_deserialized = Some(Arc::new(hook));
        self
    }

    /// Finishes the descriptor.
    #[must_use]
    pub fn build(self) -> TypeDef {
        TypeDef { name: self.name, kind: TypeKind::Object(self.def) }
    }
}

/// Builder for custom-serializable type descriptors.
pub struct CustomBuilder {
    name: String,
    def: CustomDef,
}

impl CustomBuilder {
    /// Registers the deserialization constructor. Without one, reading a
    /// stream containing this type fails.
    #[must_use]
    pub fn constructor<F>(mut self, construct: F) -> Self
    where
        F: Fn(&KeyValueMap) -> Result<Box<dyn Any>> + Send + Sync + 'static,
    {
        self.def.construct = Some(Arc::new(construct));
        self
    }

    /// Registers a callback invoked on every instance of this type after
    /// the whole graph is deserialized.
    #[must_use]
    pub fn on_deserialized<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ObjRef) + Send + Sync + 'static,
    {
        self.def.on_deserialized = Some(Arc::new(hook));
        self
    }

    /// Finishes the descriptor.
    #[must_use]
    pub fn build(self) -> TypeDef {
        TypeDef { name: self.name, kind: TypeKind::Custom(self.def) }
    }
}

// =============================================================================
// TypeRef
// =============================================================================

/// A shared handle to a registered type descriptor.
#[derive(Clone)]
pub struct TypeRef(Arc<TypeDef>);

impl TypeRef {
    pub(crate) fn new(def: TypeDef) -> Self {
        Self(Arc::new(def))
    }

    /// The fully-qualified name of the type.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// The kind of the type.
    #[must_use]
    pub fn kind(&self) -> &TypeKind {
        &self.0.kind
    }

    /// Stable identity of the descriptor within its registry.
    pub(crate) fn token(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// Whether the type carries the schema sentinel instead of a field
    /// list: primitives, enums, strings, arrays, and custom types.
    pub(crate) fn is_special(&self) -> bool {
        !matches!(self.0.kind, TypeKind::Object(_))
    }
}

impl fmt::Debug for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeRef({})", self.name())
    }
}

impl PartialEq for TypeRef {
    fn eq(&self, other: &Self) -> bool {
        self.token() == other.token()
    }
}

impl Eq for TypeRef {}

// =============================================================================
// TypeRegistry
// =============================================================================

/// The registry of all types the serializer can handle.
///
/// Built mutably during application startup, then shared immutably (the
/// lazily populated array-intern and layout caches are internally
/// locked).
pub struct TypeRegistry {
    named: FxHashMap<String, TypeRef>,
    prims: FxHashMap<PrimKind, TypeRef>,
    str_ty: TypeRef,
    /// Derived array types, interned by canonical name.
    arrays: RwLock<FxHashMap<String, TypeRef>>,
    /// Built layouts, keyed by descriptor token.
    layouts: RwLock<FxHashMap<usize, Arc<Layout>>>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// Creates a registry with the primitive types and `str`
    /// pre-registered.
    #[must_use]
    pub fn new() -> Self {
        let mut named = FxHashMap::default();
        let mut prims = FxHashMap::default();
        for kind in PrimKind::ALL {
            let ty = TypeRef::new(TypeDef {
                name: kind.name().to_string(),
                kind: TypeKind::Primitive(kind),
            });
            named.insert(kind.name().to_string(), ty.clone());
            prims.insert(kind, ty);
        }
        let str_ty = TypeRef::new(TypeDef {
            name: "str".to_string(),
            kind: TypeKind::Str,
        });
        named.insert("str".to_string(), str_ty.clone());
        Self {
            named,
            prims,
            str_ty,
            arrays: RwLock::new(FxHashMap::default()),
            layouts: RwLock::new(FxHashMap::default()),
        }
    }

    /// Registers a type descriptor under its name.
    pub fn register(&mut self, def: TypeDef) -> Result<TypeRef> {
        if def.name.is_empty() {
            return Err(Error::malformed("type names must not be empty"));
        }
        if def.name.ends_with(']') {
            return Err(Error::malformed(
                "array type names are derived, not registered",
            ));
        }
        if self.named.contains_key(&def.name) {
            return Err(Error::DuplicateType(def.name));
        }
        let name = def.name.clone();
        let ty = TypeRef::new(def);
        self.named.insert(name, ty.clone());
        Ok(ty)
    }

    /// Resolves a type name to its descriptor. Array names resolve
    /// recursively through their `[]` suffix.
    pub fn resolve(&self, name: &str) -> Result<TypeRef> {
        if let Some(ty) = self.named.get(name) {
            return Ok(ty.clone());
        }
        if let Some(elem_name) = name.strip_suffix("[]") {
            let elem = self.resolve(elem_name)?;
            return Ok(self.array_of(&elem));
        }
        if let Some(open) = name.rfind('[') {
            if let Some(inner) = name[open..].strip_prefix('[') {
                if let Some(dims) = inner.strip_suffix(']') {
                    if !dims.is_empty() && dims.chars().all(|c| c == ',') {
                        return Err(Error::UnsupportedRank {
                            rank: dims.len() + 1,
                        });
                    }
                }
            }
        }
        Err(Error::UnknownType(name.to_string()))
    }

    /// The descriptor of a primitive type.
    #[must_use]
    pub fn prim(&self, kind: PrimKind) -> TypeRef {
        self.prims
            .get(&kind)
            .cloned()
            .expect("primitive types are pre-registered")
    }

    /// The descriptor of the string type.
    #[must_use]
    pub fn str_type(&self) -> TypeRef {
        self.str_ty.clone()
    }

    /// The interned descriptor of the rank-1 array over `elem`.
    #[must_use]
    pub fn array_of(&self, elem: &TypeRef) -> TypeRef {
        let name = format!("{}[]", elem.name());
        if let Some(ty) = self.arrays.read().get(&name) {
            return ty.clone();
        }
        let ty = TypeRef::new(TypeDef {
            name: name.clone(),
            kind: TypeKind::Array { elem: elem.clone() },
        });
        self.arrays.write().entry(name).or_insert(ty).clone()
    }

    /// The cached field layout of a composite type.
    pub(crate) fn layout(&self, ty: &TypeRef) -> Result<Arc<Layout>> {
        if let Some(layout) = self.layouts.read().get(&ty.token()) {
            return Ok(layout.clone());
        }
        let layout = introspect::build_layout(self, ty)?;
        Ok(self
            .layouts
            .write()
            .entry(ty.token())
            .or_insert(layout)
            .clone())
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocates an instance of a composite reference type with every
    /// field holding its placeholder value.
    pub fn new_object(&self, name: &str) -> Result<ObjRef> {
        let ty = self.resolve(name)?;
        Ok(Rc::new(RefCell::new(self.allocate_object(&ty)?)))
    }

    /// Builds a value-struct of the named value type with placeholder
    /// fields.
    pub fn new_struct(&self, name: &str) -> Result<StructValue> {
        let ty = self.resolve(name)?;
        match ty.kind() {
            TypeKind::Object(def) if def.value_type => {
                self.default_struct(&ty, &mut Vec::new())
            }
            _ => Err(Error::InvalidKind {
                ty: ty.name().to_string(),
                wanted: "a value type",
            }),
        }
    }

    /// Allocates an array instance of the named element type holding the
    /// given items.
    pub fn new_array(&self, elem_name: &str, items: Vec<Value>) -> Result<ObjRef> {
        let elem = self.resolve(elem_name)?;
        for item in &items {
            if !self.value_matches(&elem, item) {
                return Err(Error::FieldType {
                    ty: format!("{}[]", elem.name()),
                    field: "element".to_string(),
                });
            }
        }
        Ok(Rc::new(RefCell::new(Instance::Array { elem, items })))
    }

    /// Allocates a custom-serializable instance around its payload.
    pub fn new_custom(&self, name: &str, data: Box<dyn Any>) -> Result<ObjRef> {
        let ty = self.resolve(name)?;
        match ty.kind() {
            TypeKind::Custom(_) => Ok(Rc::new(RefCell::new(Instance::Custom {
                ty,
                data: Some(data),
            }))),
            _ => Err(Error::InvalidKind {
                ty: ty.name().to_string(),
                wanted: "a custom-serializable type",
            }),
        }
    }

    pub(crate) fn allocate_object(&self, ty: &TypeRef) -> Result<Instance> {
        match ty.kind() {
            TypeKind::Object(def) if !def.value_type => {
                let layout = self.layout(ty)?;
                let mut guard = Vec::new();
                let fields = layout
                    .slots()
                    .iter()
                    .map(|slot| self.default_value(&slot.declared, &mut guard))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Instance::Object { ty: ty.clone(), fields })
            }
            _ => Err(Error::InvalidKind {
                ty: ty.name().to_string(),
                wanted: "a composite object type",
            }),
        }
    }

    pub(crate) fn default_struct(
        &self,
        ty: &TypeRef,
        guard: &mut Vec<usize>,
    ) -> Result<StructValue> {
        if guard.contains(&ty.token()) {
            return Err(Error::malformed(format!(
                "value type `{}` embeds itself",
                ty.name()
            )));
        }
        guard.push(ty.token());
        let layout = self.layout(ty)?;
        let fields = layout
            .slots()
            .iter()
            .map(|slot| self.default_value(&slot.declared, guard))
            .collect::<Result<Vec<_>>>()?;
        guard.pop();
        Ok(StructValue { ty: ty.clone(), fields })
    }

    pub(crate) fn default_value(
        &self,
        ty: &TypeRef,
        guard: &mut Vec<usize>,
    ) -> Result<Value> {
        match ty.kind() {
            TypeKind::Primitive(kind) | TypeKind::Enum { repr: kind } => {
                Ok(kind.default_value())
            }
            TypeKind::Object(def) if def.value_type => {
                Ok(Value::Struct(self.default_struct(ty, guard)?))
            }
            TypeKind::Str
            | TypeKind::Array { .. }
            | TypeKind::Custom(_)
            | TypeKind::Object(_) => Ok(Value::null()),
        }
    }

    // =========================================================================
    // Field access
    // =========================================================================

    /// Assigns a field of a composite object, validating the value
    /// against the field's declared type.
    pub fn set(&self, obj: &ObjRef, field: &str, value: Value) -> Result<()> {
        let ty = match &*obj.borrow() {
            Instance::Object { ty, .. } => ty.clone(),
            other => {
                return Err(Error::InvalidKind {
                    ty: other.kind_name().to_string(),
                    wanted: "a composite object",
                })
            }
        };
        let slot = self.checked_slot(&ty, field, &value)?;
        match &mut *obj.borrow_mut() {
            Instance::Object { fields, .. } => {
                match fields.get_mut(slot) {
                    Some(stored) => {
                        *stored = value;
                        Ok(())
                    }
                    None => Err(Error::malformed("field slot out of range")),
                }
            }
            _ => Err(Error::malformed("instance changed kind during field set")),
        }
    }

    /// Reads a field of a composite object. References come back as
    /// shared handles, primitives and structs as copies.
    pub fn get(&self, obj: &ObjRef, field: &str) -> Result<Value> {
        match &*obj.borrow() {
            Instance::Object { ty, fields } => {
                let layout = self.layout(ty)?;
                let slot = layout.slot_index(field).ok_or_else(|| {
                    Error::UnknownField {
                        ty: ty.name().to_string(),
                        field: field.to_string(),
                    }
                })?;
                fields
                    .get(slot)
                    .cloned()
                    .ok_or_else(|| Error::malformed("field slot out of range"))
            }
            other => Err(Error::InvalidKind {
                ty: other.kind_name().to_string(),
                wanted: "a composite object",
            }),
        }
    }

    /// Assigns a field of an embedded value-struct.
    pub fn struct_set(
        &self,
        sv: &mut StructValue,
        field: &str,
        value: Value,
    ) -> Result<()> {
        let ty = sv.ty.clone();
        let slot = self.checked_slot(&ty, field, &value)?;
        match sv.fields.get_mut(slot) {
            Some(stored) => {
                *stored = value;
                Ok(())
            }
            None => Err(Error::malformed("field slot out of range")),
        }
    }

    /// Reads a field of an embedded value-struct.
    pub fn struct_get(&self, sv: &StructValue, field: &str) -> Result<Value> {
        let layout = self.layout(&sv.ty)?;
        let slot = layout.slot_index(field).ok_or_else(|| Error::UnknownField {
            ty: sv.ty.name().to_string(),
            field: field.to_string(),
        })?;
        sv.fields
            .get(slot)
            .cloned()
            .ok_or_else(|| Error::malformed("field slot out of range"))
    }

    fn checked_slot(
        &self,
        ty: &TypeRef,
        field: &str,
        value: &Value,
    ) -> Result<usize> {
        let layout = self.layout(ty)?;
        let slot = layout.slot_index(field).ok_or_else(|| Error::UnknownField {
            ty: ty.name().to_string(),
            field: field.to_string(),
        })?;
        if !self.value_matches(&layout.slots()[slot].declared, value) {
            return Err(Error::FieldType {
                ty: ty.name().to_string(),
                field: field.to_string(),
            });
        }
        Ok(slot)
    }

    // =========================================================================
    // Typing
    // =========================================================================

    /// The runtime type of a heap instance.
    pub(crate) fn runtime_type(&self, inst: &Instance) -> Result<TypeRef> {
        match inst {
            Instance::Object { ty, .. } | Instance::Custom { ty, .. } => {
                Ok(ty.clone())
            }
            Instance::Str(_) => Ok(self.str_type()),
            Instance::Array { elem, .. } => Ok(self.array_of(elem)),
            Instance::Boxed(Value::Struct(sv)) => Ok(sv.ty.clone()),
            Instance::Boxed(v) => v.prim_kind().map(|k| self.prim(k)).ok_or_else(
                || {
                    Error::malformed(
                        "boxed value must be a primitive or value struct",
                    )
                },
            ),
        }
    }

    /// Whether `runtime` is `declared` or one of its descendants.
    pub(crate) fn assignable(&self, runtime: &TypeRef, declared: &TypeRef) -> bool {
        if runtime.token() == declared.token() {
            return true;
        }
        let mut current = runtime.clone();
        let mut hops = 0;
        while let TypeKind::Object(def) = current.kind() {
            let Some(parent) = &def.extends else { return false };
            let Ok(parent) = self.resolve(parent) else { return false };
            if parent.token() == declared.token() {
                return true;
            }
            current = parent;
            hops += 1;
            if hops > 64 {
                return false;
            }
        }
        false
    }

    /// Whether a value is acceptable for a slot of the declared type.
    pub(crate) fn value_matches(&self, declared: &TypeRef, value: &Value) -> bool {
        match declared.kind() {
            TypeKind::Primitive(kind) | TypeKind::Enum { repr: kind } => {
                value.prim_kind() == Some(*kind)
            }
            TypeKind::Str => match value {
                Value::Ref(None) => true,
                Value::Ref(Some(obj)) => {
                    matches!(&*obj.borrow(), Instance::Str(_))
                }
                _ => false,
            },
            TypeKind::Array { elem } => match value {
                Value::Ref(None) => true,
                Value::Ref(Some(obj)) => match &*obj.borrow() {
                    Instance::Array { elem: actual, .. } => {
                        actual.name() == elem.name()
                    }
                    _ => false,
                },
                _ => false,
            },
            TypeKind::Object(def) if def.value_type => match value {
                Value::Struct(sv) => sv.ty.token() == declared.token(),
                _ => false,
            },
            TypeKind::Object(_) => match value {
                Value::Ref(None) => true,
                Value::Ref(Some(obj)) => match &*obj.borrow() {
                    Instance::Object { ty, .. } => self.assignable(ty, declared),
                    _ => false,
                },
                _ => false,
            },
            TypeKind::Custom(_) => match value {
                Value::Ref(None) => true,
                Value::Ref(Some(obj)) => match &*obj.borrow() {
                    Instance::Custom { ty, .. } => {
                        ty.token() == declared.token()
                    }
                    _ => false,
                },
                _ => false,
            },
        }
    }
}
