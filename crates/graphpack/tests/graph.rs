//! Graph round-trip scenarios: identity, cycles, strings, custom
//! serialization, and the wire-level shape of simple streams.

use std::rc::Rc;
use std::sync::Arc;

use graphpack::{
    Instance, KeyValueMap, ObjRef, PrimKind, Serializer, TypeDef, TypeRegistry,
    Value,
};

fn serializer(registry: TypeRegistry) -> Serializer {
    Serializer::new(Arc::new(registry))
}

fn serialize(s: &Serializer, root: Option<&ObjRef>) -> Vec<u8> {
    let mut bytes = Vec::new();
    s.serialize(root, &mut bytes).unwrap();
    bytes
}

fn roundtrip(s: &Serializer, root: Option<&ObjRef>) -> Option<ObjRef> {
    let bytes = serialize(s, root);
    s.deserialize(&mut &bytes[..]).unwrap()
}

fn count_occurrences(haystack: &[u8], needle: &[u8]) -> usize {
    haystack.windows(needle.len()).filter(|w| *w == needle).count()
}

#[test]
fn s1_primitive_field_exact_bytes() {
    let mut registry = TypeRegistry::new();
    registry
        .register(TypeDef::object("demo::Root").field("x", "i32").build())
        .unwrap();
    let s = serializer(registry);

    let root = s.registry().new_object("demo::Root").unwrap();
    s.registry()
        .set(&root, "x", Value::I32(0x0102_0304))
        .unwrap();

    let bytes = serialize(&s, Some(&root));

    #[rustfmt::skip]
    let expected: Vec<u8> = vec![
        // header: typesCount=2, objectsCount=2, typeCountForObjects=1,
        // stringTypeID=-1
        0x02, 0x02, 0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0x0F,
        // type names
        0x0A, b'd', b'e', b'm', b'o', b':', b':', b'R', b'o', b'o', b't',
        0x03, b'i', b'3', b'2',
        // schema rows: Root has one field `x` of type id 1; i32 is special
        0x01, 0x01, 0x00, 0x01, b'x',
        0xFF,
        // creation: root is type id 0
        0x00, 0x00,
        // body: 0x01020304 little-endian
        0x04, 0x03, 0x02, 0x01,
    ];
    assert_eq!(bytes, expected);

    let back = s.deserialize(&mut &bytes[..]).unwrap().unwrap();
    assert_eq!(
        s.registry().get(&back, "x").unwrap(),
        Value::I32(0x0102_0304)
    );
}

#[test]
fn s2_shared_reference_stays_shared() {
    let mut registry = TypeRegistry::new();
    registry
        .register(TypeDef::object("demo::Leaf").field("id", "u32").build())
        .unwrap();
    registry
        .register(
            TypeDef::object("demo::Root")
                .field("a", "demo::Leaf")
                .field("b", "demo::Leaf")
                .build(),
        )
        .unwrap();
    let s = serializer(registry);

    let leaf = s.registry().new_object("demo::Leaf").unwrap();
    s.registry().set(&leaf, "id", Value::U32(9)).unwrap();
    let root = s.registry().new_object("demo::Root").unwrap();
    s.registry().set(&root, "a", Value::reference(&leaf)).unwrap();
    s.registry().set(&root, "b", Value::reference(&leaf)).unwrap();

    let back = roundtrip(&s, Some(&root)).unwrap();
    let a = s.registry().get(&back, "a").unwrap();
    let b = s.registry().get(&back, "b").unwrap();
    let (a, b) = (a.as_object().unwrap().clone(), b.as_object().unwrap().clone());
    assert!(Rc::ptr_eq(&a, &b));
    assert_eq!(s.registry().get(&a, "id").unwrap(), Value::U32(9));
}

#[test]
fn s3_cycle_survives() {
    let mut registry = TypeRegistry::new();
    registry
        .register(
            TypeDef::object("demo::Node")
                .field("next", "demo::Node")
                .field("value", "i32")
                .build(),
        )
        .unwrap();
    let s = serializer(registry);

    let n1 = s.registry().new_object("demo::Node").unwrap();
    let n2 = s.registry().new_object("demo::Node").unwrap();
    s.registry().set(&n1, "value", Value::I32(1)).unwrap();
    s.registry().set(&n2, "value", Value::I32(2)).unwrap();
    s.registry().set(&n1, "next", Value::reference(&n2)).unwrap();
    s.registry().set(&n2, "next", Value::reference(&n1)).unwrap();

    let back = roundtrip(&s, Some(&n1)).unwrap();
    let next = s
        .registry()
        .get(&back, "next")
        .unwrap()
        .as_object()
        .unwrap()
        .clone();
    let next_next = s
        .registry()
        .get(&next, "next")
        .unwrap()
        .as_object()
        .unwrap()
        .clone();
    assert!(Rc::ptr_eq(&back, &next_next));
    assert_eq!(s.registry().get(&next, "value").unwrap(), Value::I32(2));
}

#[test]
fn s3_self_cycle_survives() {
    let mut registry = TypeRegistry::new();
    registry
        .register(
            TypeDef::object("demo::Node").field("next", "demo::Node").build(),
        )
        .unwrap();
    let s = serializer(registry);

    let node = s.registry().new_object("demo::Node").unwrap();
    s.registry().set(&node, "next", Value::reference(&node)).unwrap();

    let back = roundtrip(&s, Some(&node)).unwrap();
    let next = s
        .registry()
        .get(&back, "next")
        .unwrap()
        .as_object()
        .unwrap()
        .clone();
    assert!(Rc::ptr_eq(&back, &next));
}

#[test]
fn s4_string_identity_governs_ids() {
    let mut registry = TypeRegistry::new();
    registry
        .register(
            TypeDef::object("demo::Root")
                .field("s", "str")
                .field("t", "str")
                .build(),
        )
        .unwrap();
    let s = serializer(registry);

    // One shared string instance: one id, content emitted once.
    let shared = Instance::string("hi");
    let root = s.registry().new_object("demo::Root").unwrap();
    s.registry().set(&root, "s", Value::reference(&shared)).unwrap();
    s.registry().set(&root, "t", Value::reference(&shared)).unwrap();
    let bytes = serialize(&s, Some(&root));
    assert_eq!(count_occurrences(&bytes, &[0x02, b'h', b'i']), 1);

    let back = s.deserialize(&mut &bytes[..]).unwrap().unwrap();
    let s_field = s.registry().get(&back, "s").unwrap();
    let t_field = s.registry().get(&back, "t").unwrap();
    assert!(Rc::ptr_eq(
        s_field.as_object().unwrap(),
        t_field.as_object().unwrap()
    ));
    assert_eq!(
        s_field.as_object().unwrap().borrow().str_value(),
        Some("hi")
    );

    // Two distinct instances with equal contents: two ids, content
    // emitted once per id.
    let root2 = s.registry().new_object("demo::Root").unwrap();
    s.registry()
        .set(&root2, "s", Value::reference(&Instance::string("hi")))
        .unwrap();
    s.registry()
        .set(&root2, "t", Value::reference(&Instance::string("hi")))
        .unwrap();
    let bytes2 = serialize(&s, Some(&root2));
    assert_eq!(count_occurrences(&bytes2, &[0x02, b'h', b'i']), 2);

    let back2 = s.deserialize(&mut &bytes2[..]).unwrap().unwrap();
    let s2 = s.registry().get(&back2, "s").unwrap();
    let t2 = s.registry().get(&back2, "t").unwrap();
    assert!(!Rc::ptr_eq(
        s2.as_object().unwrap(),
        t2.as_object().unwrap()
    ));
    assert_eq!(s2.as_object().unwrap().borrow().str_value(), Some("hi"));
    assert_eq!(t2.as_object().unwrap().borrow().str_value(), Some("hi"));
}

struct Blob {
    n: i32,
    s: String,
}

#[test]
fn s5_custom_serialization_roundtrip() {
    let mut registry = TypeRegistry::new();
    registry
        .register(
            TypeDef::custom("demo::Blob", |data| {
                let blob = data.downcast_ref::<Blob>().expect("Blob payload");
                let mut map = KeyValueMap::new();
                map.insert("k1", Some(Instance::boxed(Value::I32(blob.n))));
                map.insert("k2", Some(Instance::string(blob.s.clone())));
                map
            })
            .constructor(|map| {
                assert_eq!(map.entries().len(), 2);
                assert_eq!(map.entries()[0].0, "k1");
                assert_eq!(map.entries()[1].0, "k2");
                let n = map
                    .get("k1")
                    .and_then(|obj| {
                        obj.borrow().boxed_value().and_then(Value::as_i32)
                    })
                    .expect("k1 is a boxed i32");
                let s = map
                    .get("k2")
                    .and_then(|obj| {
                        obj.borrow().str_value().map(str::to_string)
                    })
                    .expect("k2 is a string");
                Ok(Box::new(Blob { n, s }))
            })
            .build(),
        )
        .unwrap();
    let s = serializer(registry);

    let root = s
        .registry()
        .new_custom("demo::Blob", Box::new(Blob { n: 7, s: "hi".into() }))
        .unwrap();

    let back = roundtrip(&s, Some(&root)).unwrap();
    let inst = back.borrow();
    let blob = inst.custom_data::<Blob>().unwrap();
    assert_eq!(blob.n, 7);
    assert_eq!(blob.s, "hi");
}

#[test]
fn s6_schema_drift_is_fatal() {
    let mut writer_registry = TypeRegistry::new();
    writer_registry
        .register(
            TypeDef::object("demo::T")
                .field("a", "i32")
                .field("b", "i32")
                .build(),
        )
        .unwrap();
    let writer = serializer(writer_registry);

    let root = writer.registry().new_object("demo::T").unwrap();
    let bytes = serialize(&writer, Some(&root));

    // The reader's version of the type renamed `b` to `c`.
    let mut reader_registry = TypeRegistry::new();
    reader_registry
        .register(
            TypeDef::object("demo::T")
                .field("a", "i32")
                .field("c", "i32")
                .build(),
        )
        .unwrap();
    let reader = serializer(reader_registry);

    assert!(matches!(
        reader.deserialize(&mut &bytes[..]),
        Err(graphpack::Error::SchemaFieldMismatch { .. })
    ));
}

#[test]
fn null_root_roundtrips() {
    let s = serializer(TypeRegistry::new());
    let bytes = serialize(&s, None);
    // typesCount=0, objectsCount=1, typeCountForObjects=0, stringTypeID=-1
    assert_eq!(bytes, [0x00, 0x01, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0x0F]);
    assert!(s.deserialize(&mut &bytes[..]).unwrap().is_none());
}

#[test]
fn null_field_roundtrips_to_null() {
    let mut registry = TypeRegistry::new();
    registry
        .register(
            TypeDef::object("demo::Root").field("next", "demo::Root").build(),
        )
        .unwrap();
    let s = serializer(registry);

    let root = s.registry().new_object("demo::Root").unwrap();
    let back = roundtrip(&s, Some(&root)).unwrap();
    assert_eq!(s.registry().get(&back, "next").unwrap(), Value::null());
}

#[test]
fn byte_array_raw_block() {
    let s = serializer(TypeRegistry::new());
    let payload: Vec<u8> = (0..=255).collect();
    let items: Vec<Value> = payload.iter().copied().map(Value::U8).collect();
    let array = s.registry().new_array("u8", items).unwrap();

    let bytes = serialize(&s, Some(&array));
    // The raw block appears verbatim.
    assert_eq!(count_occurrences(&bytes, &payload), 1);

    let back = s.deserialize(&mut &bytes[..]).unwrap().unwrap();
    let inst = back.borrow();
    let items = inst.array_items().unwrap();
    assert_eq!(items.len(), 256);
    assert_eq!(items[0], Value::U8(0));
    assert_eq!(items[255], Value::U8(255));
}

#[test]
fn primitive_array_roundtrips() {
    let s = serializer(TypeRegistry::new());
    let array = s
        .registry()
        .new_array(
            "f64",
            vec![Value::F64(1.5), Value::F64(-2.25), Value::F64(0.0)],
        )
        .unwrap();

    let back = roundtrip(&s, Some(&array)).unwrap();
    let inst = back.borrow();
    assert_eq!(
        inst.array_items().unwrap(),
        &[Value::F64(1.5), Value::F64(-2.25), Value::F64(0.0)]
    );
}

#[test]
fn jagged_array_shares_inner_arrays() {
    let s = serializer(TypeRegistry::new());
    let inner = s
        .registry()
        .new_array("i32", vec![Value::I32(1), Value::I32(2)])
        .unwrap();
    let outer = s
        .registry()
        .new_array(
            "i32[]",
            vec![
                Value::reference(&inner),
                Value::null(),
                Value::reference(&inner),
            ],
        )
        .unwrap();

    let back = roundtrip(&s, Some(&outer)).unwrap();
    let inst = back.borrow();
    let items = inst.array_items().unwrap();
    assert_eq!(items.len(), 3);
    let first = items[0].as_object().unwrap();
    let third = items[2].as_object().unwrap();
    assert!(Rc::ptr_eq(first, third));
    assert_eq!(items[1], Value::null());
    assert_eq!(
        first.borrow().array_items().unwrap(),
        &[Value::I32(1), Value::I32(2)]
    );
}

#[test]
fn embedded_struct_carries_references() {
    let mut registry = TypeRegistry::new();
    registry
        .register(TypeDef::object("demo::Leaf").field("v", "i32").build())
        .unwrap();
    registry
        .register(
            TypeDef::value_object("demo::Slot")
                .field("target", "demo::Leaf")
                .field("count", "u16")
                .build(),
        )
        .unwrap();
    registry
        .register(
            TypeDef::object("demo::Holder").field("slot", "demo::Slot").build(),
        )
        .unwrap();
    let s = serializer(registry);

    let leaf = s.registry().new_object("demo::Leaf").unwrap();
    s.registry().set(&leaf, "v", Value::I32(42)).unwrap();
    let mut slot = s.registry().new_struct("demo::Slot").unwrap();
    s.registry()
        .struct_set(&mut slot, "target", Value::reference(&leaf))
        .unwrap();
    s.registry()
        .struct_set(&mut slot, "count", Value::U16(3))
        .unwrap();
    let holder = s.registry().new_object("demo::Holder").unwrap();
    s.registry().set(&holder, "slot", Value::Struct(slot)).unwrap();

    let back = roundtrip(&s, Some(&holder)).unwrap();
    let slot = s.registry().get(&back, "slot").unwrap();
    let slot = slot.as_struct().unwrap();
    assert_eq!(
        s.registry().struct_get(slot, "count").unwrap(),
        Value::U16(3)
    );
    let target = s.registry().struct_get(slot, "target").unwrap();
    let target = target.as_object().unwrap().clone();
    assert_eq!(s.registry().get(&target, "v").unwrap(), Value::I32(42));
}

#[test]
fn boxed_values_roundtrip_at_the_root() {
    let mut registry = TypeRegistry::new();
    registry
        .register(
            TypeDef::value_object("demo::Vec2")
                .field("x", "f32")
                .field("y", "f32")
                .build(),
        )
        .unwrap();
    let s = serializer(registry);

    let boxed = Instance::boxed(Value::I64(-5));
    let back = roundtrip(&s, Some(&boxed)).unwrap();
    assert_eq!(back.borrow().boxed_value(), Some(&Value::I64(-5)));

    let mut v = s.registry().new_struct("demo::Vec2").unwrap();
    s.registry().struct_set(&mut v, "x", Value::F32(1.0)).unwrap();
    s.registry().struct_set(&mut v, "y", Value::F32(2.0)).unwrap();
    let boxed = Instance::boxed(Value::Struct(v));
    let back = roundtrip(&s, Some(&boxed)).unwrap();
    let inst = back.borrow();
    let sv = inst.boxed_value().unwrap().as_struct().unwrap();
    assert_eq!(s.registry().struct_get(sv, "x").unwrap(), Value::F32(1.0));
    assert_eq!(s.registry().struct_get(sv, "y").unwrap(), Value::F32(2.0));
}

#[test]
fn enum_fields_roundtrip() {
    let mut registry = TypeRegistry::new();
    registry
        .register(TypeDef::enumeration("demo::Color", PrimKind::I32))
        .unwrap();
    registry
        .register(
            TypeDef::object("demo::Pixel").field("color", "demo::Color").build(),
        )
        .unwrap();
    let s = serializer(registry);

    let pixel = s.registry().new_object("demo::Pixel").unwrap();
    s.registry().set(&pixel, "color", Value::I32(2)).unwrap();

    let back = roundtrip(&s, Some(&pixel)).unwrap();
    assert_eq!(s.registry().get(&back, "color").unwrap(), Value::I32(2));
}

#[test]
fn inherited_fields_roundtrip() {
    let mut registry = TypeRegistry::new();
    registry
        .register(TypeDef::object("demo::Base").field("id", "u32").build())
        .unwrap();
    registry
        .register(
            TypeDef::object("demo::Derived")
                .extends("demo::Base")
                .field("extra", "i64")
                .build(),
        )
        .unwrap();
    registry
        .register(
            TypeDef::object("demo::Holder").field("slot", "demo::Base").build(),
        )
        .unwrap();
    let s = serializer(registry);

    let derived = s.registry().new_object("demo::Derived").unwrap();
    s.registry().set(&derived, "id", Value::U32(11)).unwrap();
    s.registry().set(&derived, "extra", Value::I64(-7)).unwrap();
    let holder = s.registry().new_object("demo::Holder").unwrap();
    s.registry()
        .set(&holder, "slot", Value::reference(&derived))
        .unwrap();

    let back = roundtrip(&s, Some(&holder)).unwrap();
    let slot = s.registry().get(&back, "slot").unwrap();
    let slot = slot.as_object().unwrap().clone();
    // Runtime type survives even though the field declares the base.
    assert_eq!(slot.borrow().kind_name(), "demo::Derived");
    assert_eq!(s.registry().get(&slot, "id").unwrap(), Value::U32(11));
    assert_eq!(s.registry().get(&slot, "extra").unwrap(), Value::I64(-7));
}

#[test]
fn skipped_fields_reset_to_placeholder() {
    let mut registry = TypeRegistry::new();
    registry
        .register(
            TypeDef::object("demo::T")
                .field("kept", "i32")
                .skipped_field("cache", "u64")
                .build(),
        )
        .unwrap();
    let s = serializer(registry);

    let obj = s.registry().new_object("demo::T").unwrap();
    s.registry().set(&obj, "kept", Value::I32(5)).unwrap();
    s.registry().set(&obj, "cache", Value::U64(999)).unwrap();

    let back = roundtrip(&s, Some(&obj)).unwrap();
    assert_eq!(s.registry().get(&back, "kept").unwrap(), Value::I32(5));
    assert_eq!(s.registry().get(&back, "cache").unwrap(), Value::U64(0));
}

#[test]
fn serialization_is_deterministic() {
    let mut registry = TypeRegistry::new();
    registry
        .register(TypeDef::object("demo::Leaf").field("id", "u32").build())
        .unwrap();
    registry
        .register(
            TypeDef::object("demo::Root")
                .field("a", "demo::Leaf")
                .field("name", "str")
                .build(),
        )
        .unwrap();
    let registry = Arc::new(registry);

    let leaf = registry.new_object("demo::Leaf").unwrap();
    let root = registry.new_object("demo::Root").unwrap();
    registry.set(&root, "a", Value::reference(&leaf)).unwrap();
    registry
        .set(&root, "name", Value::reference(&Instance::string("n")))
        .unwrap();

    // Warm cache: same serializer twice.
    let s = Serializer::new(registry.clone());
    let first = serialize(&s, Some(&root));
    let second = serialize(&s, Some(&root));
    assert_eq!(first, second);

    // Cold cache: a fresh serializer produces identical bytes.
    let fresh = Serializer::new(registry);
    assert_eq!(serialize(&fresh, Some(&root)), first);
}

#[test]
fn custom_constructor_sees_filled_referents() {
    struct Wrapped {
        leaf: ObjRef,
        observed: i32,
    }

    let mut registry = TypeRegistry::new();
    registry
        .register(TypeDef::object("demo::Leaf").field("v", "i32").build())
        .unwrap();
    registry
        .register(
            TypeDef::custom("demo::Wrapper", |data| {
                let wrapped =
                    data.downcast_ref::<Wrapped>().expect("Wrapped payload");
                let mut map = KeyValueMap::new();
                map.insert("leaf", Some(wrapped.leaf.clone()));
                map
            })
            .constructor(|map| {
                let leaf = map.get("leaf").expect("leaf entry").clone();
                // The wrapper has id 1, the leaf id 2: its body is parsed
                // after the wrapper's map. The constructor still sees the
                // filled field because construction is deferred.
                let observed = match &*leaf.borrow() {
                    Instance::Object { fields, .. } => {
                        fields[0].as_i32().expect("leaf field is i32")
                    }
                    _ => panic!("leaf is a composite object"),
                };
                Ok(Box::new(Wrapped { leaf: leaf.clone(), observed }))
            })
            .build(),
        )
        .unwrap();
    let s = serializer(registry);

    let leaf = s.registry().new_object("demo::Leaf").unwrap();
    s.registry().set(&leaf, "v", Value::I32(42)).unwrap();
    let root = s
        .registry()
        .new_custom("demo::Wrapper", Box::new(Wrapped { leaf, observed: 0 }))
        .unwrap();

    let back = roundtrip(&s, Some(&root)).unwrap();
    let inst = back.borrow();
    let wrapped = inst.custom_data::<Wrapped>().unwrap();
    assert_eq!(wrapped.observed, 42);
    assert_eq!(
        s.registry().get(&wrapped.leaf, "v").unwrap(),
        Value::I32(42)
    );
}

#[test]
fn custom_map_null_values_roundtrip() {
    struct Sparse;

    let mut registry = TypeRegistry::new();
    registry
        .register(
            TypeDef::custom("demo::Sparse", |_| {
                let mut map = KeyValueMap::new();
                map.insert("gone", None);
                map
            })
            .constructor(|map| {
                assert!(map.contains("gone"));
                assert!(map.get("gone").is_none());
                Ok(Box::new(Sparse))
            })
            .build(),
        )
        .unwrap();
    let s = serializer(registry);

    let root = s.registry().new_custom("demo::Sparse", Box::new(Sparse)).unwrap();
    let back = roundtrip(&s, Some(&root)).unwrap();
    assert!(back.borrow().custom_data::<Sparse>().is_some());
}

#[test]
fn post_deserialization_callbacks_run_in_id_order() {
    use std::sync::Mutex;

    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let log_a = log.clone();
    let log_b = log.clone();

    let mut registry = TypeRegistry::new();
    registry
        .register(
            TypeDef::object("demo::A")
                .field("child", "demo::B")
                .on_deserialized(move |_| log_a.lock().unwrap().push("A"))
                .build(),
        )
        .unwrap();
    registry
        .register(
            TypeDef::object("demo::B")
                .field("id", "u8")
                .on_deserialized(move |_| log_b.lock().unwrap().push("B"))
                .build(),
        )
        .unwrap();
    let s = serializer(registry);

    let a = s.registry().new_object("demo::A").unwrap();
    let b = s.registry().new_object("demo::B").unwrap();
    s.registry().set(&a, "child", Value::reference(&b)).unwrap();

    roundtrip(&s, Some(&a)).unwrap();
    assert_eq!(*log.lock().unwrap(), ["A", "B"]);
}

#[test]
fn object_id_width_boundary() {
    fn array_of_strings(s: &Serializer, n: usize) -> ObjRef {
        let items: Vec<Value> = (0..n)
            .map(|_| Value::reference(&Instance::string("x")))
            .collect();
        s.registry().new_array("str", items).unwrap()
    }

    let s = serializer(TypeRegistry::new());

    // Instances = strings + the array itself; ids 1..=N fit u16 while
    // N stays at 65 535.
    let narrow_root = array_of_strings(&s, 65_534); // 65_535 instances
    let narrow = serialize(&s, Some(&narrow_root));
    let back = s.deserialize(&mut &narrow[..]).unwrap().unwrap();
    assert_eq!(back.borrow().array_items().unwrap().len(), 65_534);

    let wide_root = array_of_strings(&s, 65_535); // 65_536 instances
    let wide = serialize(&s, Some(&wide_root));
    let back = s.deserialize(&mut &wide[..]).unwrap().unwrap();
    let inst = back.borrow();
    let items = inst.array_items().unwrap();
    assert_eq!(items.len(), 65_535);
    assert_eq!(
        items[65_534].as_object().unwrap().borrow().str_value(),
        Some("x")
    );

    // One more element, but each id now costs four bytes instead of two.
    assert!(wide.len() > narrow.len() + 65_534 * 2);
}
