//! Turns the records of a dump into the snapshot arena.
//!
//! The first pass walks every record once, remembering where strings are and collecting
//! classes, frames, roots and heap entities. Ids are then registered in dump order, so a value
//! can refer to an object dumped after it; the second pass decodes field and element values
//! against that table.

use crate::error::{ParseError, ReferenceContext, UnresolvedReference};
use crate::external_size::{select_model, ExternalSizeModel};
use crate::heap_dump::{
    Class, FieldValue, GcRoot, Instance, ObjectArray, PrimitiveArray, PrimitiveArrayType,
    SubRecord,
};
use crate::proguard::ProguardMap;
use crate::snapshot::instance::{
    InstanceData, ClassObj, Field, FieldDecl, InstanceIndex, InstanceKind, InstanceRef,
    PrimitiveValues, Value,
};
use crate::snapshot::{Root, Snapshot};
use crate::{parse_hprof, Id, IdSize, ParseResult, Reader, Serial, StackFrame};
use once_cell::sync::OnceCell;
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::time::Instant;

const DEFAULT_HEAP: &str = "default";

fn lift<T>(buf: &[u8], context: &'static str, r: ParseResult<'_, T>) -> Result<T, ParseError> {
    r.map_err(|e| ParseError::from_nom(e, buf, context))
}

/// Strings are only decoded when looked up
struct StringTable<'a> {
    reader: Reader<'a>,
    /// Offset and length of the text
    ranges: HashMap<Id, (usize, usize)>,
}

impl<'a> StringTable<'a> {
    fn get(&self, id: Id) -> Result<Option<Cow<'a, str>>, ParseError> {
        match self.ranges.get(&id) {
            Some(&(offset, len)) => self.reader.position_at(offset)?.read_string(len).map(Some),
            None => Ok(None),
        }
    }

    fn get_or_placeholder(&self, id: Id, kind: &str) -> Result<Cow<'a, str>, ParseError> {
        Ok(self
            .get(id)?
            .unwrap_or_else(|| Cow::Owned(format!("{}@{:#x}", kind, id))))
    }
}

enum Entity<'a> {
    Class(Class<'a>),
    Instance(Instance<'a>),
    ObjectArray(ObjectArray<'a>),
    PrimitiveArray(PrimitiveArray<'a>),
}

impl<'a> Entity<'a> {
    fn obj_id(&self) -> Id {
        match self {
            Entity::Class(c) => c.obj_id(),
            Entity::Instance(i) => i.obj_id(),
            Entity::ObjectArray(a) => a.obj_id(),
            Entity::PrimitiveArray(a) => a.obj_id(),
        }
    }

    fn stack_trace_serial(&self) -> Serial {
        match self {
            Entity::Class(c) => c.stack_trace_serial(),
            Entity::Instance(i) => i.stack_trace_serial(),
            Entity::ObjectArray(a) => a.stack_trace_serial(),
            Entity::PrimitiveArray(a) => a.stack_trace_serial(),
        }
    }

    /// The class an instance or array needs to be registered
    fn required_class(&self) -> Option<Id> {
        match self {
            Entity::Instance(i) => Some(i.class_obj_id()),
            Entity::ObjectArray(a) => Some(a.array_class_obj_id()),
            Entity::Class(_) | Entity::PrimitiveArray(_) => None,
        }
    }
}

struct Pending<'a> {
    entity: Entity<'a>,
    heap: u16,
}

/// Everything collected by the first pass
struct Dump<'a> {
    buf: &'a [u8],
    id_size: IdSize,
    timestamp_millis: u64,
    strings: StringTable<'a>,
    /// class object id -> name string id
    class_name_ids: HashMap<Id, Id>,
    class_by_serial: HashMap<Serial, Id>,
    frames: HashMap<Id, StackFrame>,
    traces: Vec<(Serial, Vec<Id>)>,
    roots: Vec<GcRoot>,
    /// `None` for the default heap
    heap_names: Vec<Option<Id>>,
    entities: Vec<Pending<'a>>,
}

fn read_dump(buf: &[u8]) -> Result<Dump<'_>, ParseError> {
    let hprof = parse_hprof(buf)?;
    let header = hprof.header();
    let id_size = header.id_size();

    let mut dump = Dump {
        buf,
        id_size,
        timestamp_millis: header.timestamp_millis(),
        strings: StringTable {
            reader: Reader::new(buf, id_size),
            ranges: HashMap::new(),
        },
        class_name_ids: HashMap::new(),
        class_by_serial: HashMap::new(),
        frames: HashMap::new(),
        traces: vec![],
        roots: vec![],
        heap_names: vec![None],
        entities: vec![],
    };

    let mut heap_by_id: HashMap<u32, u16> = HashMap::new();
    let mut current_heap = 0_u16;
    let mut records = 0_usize;
    let mut unreachable_markers = 0_usize;

    for record in hprof.records_iter() {
        let record = record?;
        records += 1;

        if let Some(utf8) = record.as_utf_8() {
            let utf8 = lift(buf, "string", utf8)?;
            let text_offset = record.offset() + id_size.size_in_bytes();
            dump.strings
                .ranges
                .insert(utf8.name_id(), (text_offset, utf8.text().len()));
        } else if let Some(load_class) = record.as_load_class() {
            let load_class = lift(buf, "load class", load_class)?;
            dump.class_name_ids
                .insert(load_class.class_obj_id(), load_class.class_name_id());
            dump.class_by_serial
                .insert(load_class.class_serial(), load_class.class_obj_id());
        } else if let Some(frame) = record.as_stack_frame() {
            let frame = lift(buf, "stack frame", frame)?;
            dump.frames.insert(frame.id(), frame);
        } else if let Some(trace) = record.as_stack_trace() {
            let trace = lift(buf, "stack trace", trace)?;
            let frame_ids = lift(
                buf,
                "stack trace",
                trace.frame_ids().collect::<Result<Vec<_>, _>>(),
            )?;
            dump.traces.push((trace.stack_trace_serial(), frame_ids));
        } else if let Some(segment) = record.as_heap_dump_segment() {
            let segment = lift(buf, "heap dump segment", segment)?;
            for sub in segment.sub_records() {
                let entity = match lift(buf, "heap dump sub-record", sub)? {
                    SubRecord::GcRoot(root) => {
                        dump.roots.push(root);
                        continue;
                    }
                    SubRecord::Unreachable(_) => {
                        unreachable_markers += 1;
                        continue;
                    }
                    SubRecord::HeapDumpInfo(info) => {
                        let heap_names = &mut dump.heap_names;
                        current_heap = *heap_by_id.entry(info.heap_id()).or_insert_with(|| {
                            heap_names.push(Some(info.heap_name_id()));
                            (heap_names.len() - 1) as u16
                        });
                        continue;
                    }
                    SubRecord::Class(c) => Entity::Class(c),
                    SubRecord::Instance(i) => Entity::Instance(i),
                    SubRecord::ObjectArray(a) => Entity::ObjectArray(a),
                    SubRecord::PrimitiveArray(a) => Entity::PrimitiveArray(a),
                };
                dump.entities.push(Pending {
                    entity,
                    heap: current_heap,
                });
            }
        }
    }

    log::debug!(
        "Read {} records: {} strings, {} entities, {} roots, {} unreachable markers",
        records,
        dump.strings.ranges.len(),
        dump.entities.len(),
        dump.roots.len(),
        unreachable_markers
    );

    Ok(dump)
}

/// `java/lang/String` -> `java.lang.String`, `[I` -> `int[]`, `[[Lfoo/Bar;` -> `foo.Bar[][]`
pub(crate) fn normalize_class_name(name: &str) -> String {
    let element = name.trim_start_matches('[');
    let dimensions = name.len() - element.len();
    if dimensions == 0 {
        return name.replace('/', ".");
    }

    let base = match element {
        "Z" => "boolean".to_owned(),
        "C" => "char".to_owned(),
        "F" => "float".to_owned(),
        "D" => "double".to_owned(),
        "B" => "byte".to_owned(),
        "S" => "short".to_owned(),
        "I" => "int".to_owned(),
        "J" => "long".to_owned(),
        _ => {
            let class = element.strip_prefix('L').unwrap_or(element);
            let class = class.strip_suffix(';').unwrap_or(class);
            class.replace('/', ".")
        }
    };

    let mut normalized = base;
    for _ in 0..dimensions {
        normalized.push_str("[]");
    }
    normalized
}

struct ClassInfo {
    /// As written in the dump, normalized; proguard maps are keyed by these
    raw_name: String,
    name: String,
    super_id: Option<Id>,
    instance_size: u32,
    declared: Vec<FieldDecl>,
}

struct Layout {
    fields: Vec<FieldDecl>,
    declared: usize,
    weak_field: Option<usize>,
}

/// Second pass state
struct Linker<'d, 'a> {
    dump: &'d Dump<'a>,
    proguard: &'d ProguardMap,
    index_by_id: HashMap<Id, InstanceIndex>,
    unresolved: Vec<UnresolvedReference>,
}

impl<'d, 'a> Linker<'d, 'a> {
    fn resolve(&mut self, from: Option<Id>, to: Option<Id>, context: ReferenceContext) -> Value {
        let to = match to {
            Some(to) => to,
            None => return Value::Null,
        };

        match self.index_by_id.get(&to) {
            Some(index) => Value::Instance(*index),
            None => {
                self.unresolved.push(UnresolvedReference { from, to, context });
                Value::Null
            }
        }
    }

    fn convert(&mut self, from: Id, value: FieldValue, context: ReferenceContext) -> Value {
        match value {
            FieldValue::ObjectId(id) => self.resolve(Some(from), id, context),
            FieldValue::Boolean(v) => Value::Boolean(v),
            FieldValue::Char(v) => Value::Char(v),
            FieldValue::Float(v) => Value::Float(v),
            FieldValue::Double(v) => Value::Double(v),
            FieldValue::Byte(v) => Value::Byte(v),
            FieldValue::Short(v) => Value::Short(v),
            FieldValue::Int(v) => Value::Int(v),
            FieldValue::Long(v) => Value::Long(v),
        }
    }

    /// Registers ids in dump order, returning the entities that made it into the arena.
    ///
    /// Instances and arrays of classes missing from the dump are left out.
    fn register(&mut self) -> Vec<&'d Pending<'a>> {
        let dump = self.dump;

        // an id resolves to its first dump, so a class dump behind an object with the same id
        // can't be used as a class
        let mut first_is_class: HashMap<Id, bool> = HashMap::with_capacity(dump.entities.len());
        let mut shadowed_classes = 0_usize;
        for pending in &dump.entities {
            let is_class = matches!(pending.entity, Entity::Class(_));
            let first = *first_is_class
                .entry(pending.entity.obj_id())
                .or_insert(is_class);
            if is_class && !first {
                shadowed_classes += 1;
            }
        }
        if shadowed_classes > 0 {
            log::warn!(
                "Ignored {} class dumps whose ids were already used by objects",
                shadowed_classes
            );
        }
        let class_ids: HashSet<Id> = first_is_class
            .into_iter()
            .filter(|(_, is_class)| *is_class)
            .map(|(id, _)| id)
            .collect();

        let mut registered = Vec::with_capacity(dump.entities.len());
        let mut duplicates = 0_usize;
        for pending in &dump.entities {
            let id = pending.entity.obj_id();
            if let Some(class_id) = pending.entity.required_class() {
                if !class_ids.contains(&class_id) {
                    self.unresolved.push(UnresolvedReference {
                        from: Some(id),
                        to: class_id,
                        context: ReferenceContext::InstanceClass,
                    });
                    continue;
                }
            }

            if self.index_by_id.contains_key(&id) {
                duplicates += 1;
                continue;
            }
            self.index_by_id
                .insert(id, InstanceIndex(registered.len() as u32));
            registered.push(pending);
        }

        if duplicates > 0 {
            log::warn!("Ignored {} objects dumped more than once", duplicates);
        }
        registered
    }

    fn class_infos(
        &self,
        registered: &[&Pending<'a>],
    ) -> Result<HashMap<Id, ClassInfo>, ParseError> {
        let dump = self.dump;
        let mut infos = HashMap::new();

        for pending in registered {
            let class = match &pending.entity {
                Entity::Class(c) => c,
                _ => continue,
            };

            let raw_name = match dump.class_name_ids.get(&class.obj_id()) {
                Some(name_id) => {
                    normalize_class_name(&dump.strings.get_or_placeholder(*name_id, "string")?)
                }
                None => format!("class@{:#x}", class.obj_id()),
            };
            let name = self.proguard.class_name(&raw_name).into_owned();

            let mut declared = Vec::with_capacity(class.num_instance_fields() as usize);
            for descriptor in class.instance_field_descriptors() {
                let descriptor = lift(dump.buf, "instance field descriptor", descriptor)?;
                let field_name = dump
                    .strings
                    .get_or_placeholder(descriptor.name_id(), "field")?;
                declared.push(FieldDecl {
                    name: self.proguard.field_name(&raw_name, &field_name).to_owned(),
                    field_type: descriptor.field_type(),
                });
            }

            infos.insert(
                class.obj_id(),
                ClassInfo {
                    raw_name,
                    name,
                    super_id: class.super_class_obj_id(),
                    instance_size: class.instance_size_bytes(),
                    declared,
                },
            );
        }

        Ok(infos)
    }
}

/// Full field layout of each class: its own fields, then each superclass's in turn
fn layouts(infos: &HashMap<Id, ClassInfo>) -> HashMap<Id, Layout> {
    infos
        .iter()
        .map(|(id, info)| {
            let mut fields = info.declared.clone();
            let mut is_reference = info.name == "java.lang.ref.Reference";
            let mut visited = HashSet::new();
            visited.insert(*id);

            let mut next = info.super_id;
            while let Some(super_id) = next {
                if !visited.insert(super_id) {
                    log::warn!("Superclass cycle through {:#x}", super_id);
                    break;
                }
                let super_info = match infos.get(&super_id) {
                    Some(s) => s,
                    None => break,
                };
                fields.extend(super_info.declared.iter().cloned());
                is_reference |= super_info.name == "java.lang.ref.Reference";
                next = super_info.super_id;
            }

            let weak_field = if is_reference {
                fields.iter().rposition(|f| f.name == "referent")
            } else {
                None
            };

            (
                *id,
                Layout {
                    fields,
                    declared: info.declared.len(),
                    weak_field,
                },
            )
        })
        .collect()
}

pub(crate) fn build(
    buf: &[u8],
    proguard: &ProguardMap,
    models: &[Box<dyn ExternalSizeModel>],
) -> Result<Snapshot, ParseError> {
    let start = Instant::now();
    let dump = read_dump(buf)?;
    let id_size = dump.id_size;

    let mut linker = Linker {
        dump: &dump,
        proguard,
        index_by_id: HashMap::new(),
        unresolved: vec![],
    };
    let registered = linker.register();
    let infos = linker.class_infos(&registered)?;
    let layouts = layouts(&infos);

    let mut classes_by_name: HashMap<String, Vec<InstanceIndex>> = HashMap::new();
    for pending in &registered {
        if let Entity::Class(c) = &pending.entity {
            classes_by_name
                .entry(infos[&c.obj_id()].name.clone())
                .or_insert_with(Vec::new)
                .push(linker.index_by_id[&c.obj_id()]);
        }
    }
    let class_named = |name: &str| {
        classes_by_name
            .get(name)
            .and_then(|c| c.first())
            .copied()
    };
    // `infos` only has class dumps that were registered under their id
    let instance_size = |class_id: &Id| infos.get(class_id).map_or(0, |c| c.instance_size as u64);
    let class_size = |index: Option<InstanceIndex>| {
        index.map_or(0, |i| instance_size(&registered[i.index()].entity.obj_id()))
    };
    let java_lang_class = class_named("java.lang.Class");

    let mut instances = Vec::with_capacity(registered.len());
    for pending in &registered {
        let id = pending.entity.obj_id();
        let (class, shallow_size, kind) = match &pending.entity {
            Entity::Class(c) => {
                let info = &infos[&id];
                let (field_layout, declared_fields, weak_field) = match layouts.get(&id) {
                    Some(l) => (l.fields.clone(), l.declared, l.weak_field),
                    None => (vec![], 0, None),
                };

                let mut static_fields = Vec::with_capacity(c.num_static_fields() as usize);
                for entry in c.static_fields() {
                    let entry = lift(buf, "static field", entry)?;
                    let field_name = dump.strings.get_or_placeholder(entry.name_id(), "field")?;
                    static_fields.push(Field {
                        name: proguard.field_name(&info.raw_name, &field_name).to_owned(),
                        value: linker.convert(id, entry.value(), ReferenceContext::StaticField),
                    });
                }

                let super_class = linker
                    .resolve(Some(id), c.super_class_obj_id(), ReferenceContext::SuperClass)
                    .as_instance();
                let class_loader = linker
                    .resolve(Some(id), c.class_loader_obj_id(), ReferenceContext::ClassLoader)
                    .as_instance();

                let class_obj = ClassObj {
                    name: info.name.clone(),
                    super_class,
                    class_loader,
                    instance_size: info.instance_size,
                    static_fields,
                    field_layout,
                    declared_fields,
                    weak_field,
                };
                (
                    java_lang_class,
                    class_size(java_lang_class) + c.static_field_value_bytes(),
                    InstanceKind::Class(Box::new(class_obj)),
                )
            }
            Entity::Instance(o) => {
                let class = linker.index_by_id[&o.class_obj_id()];
                let field_types: Vec<_> = layouts
                    .get(&o.class_obj_id())
                    .map(|l| l.fields.iter().map(|f| f.field_type).collect())
                    .unwrap_or_default();

                let mut input = o.fields();
                let mut values = Vec::with_capacity(field_types.len());
                for field_type in field_types {
                    let (rest, value) =
                        lift(buf, "instance field values", field_type.parse_value(input, id_size))?;
                    input = rest;
                    values.push(linker.convert(id, value, ReferenceContext::InstanceField));
                }

                (
                    Some(class),
                    instance_size(&o.class_obj_id()),
                    InstanceKind::Object(values.into_boxed_slice()),
                )
            }
            Entity::ObjectArray(a) => {
                let class = linker.index_by_id[&a.array_class_obj_id()];
                let mut values = Vec::with_capacity(a.num_elements() as usize);
                for element in a.elements() {
                    let element = lift(buf, "object array elements", element)?;
                    values.push(linker.resolve(Some(id), element, ReferenceContext::ArrayElement));
                }

                (
                    Some(class),
                    instance_size(&a.array_class_obj_id())
                        + a.num_elements() as u64 * id_size.size_in_bytes() as u64,
                    InstanceKind::ObjectArray(values.into_boxed_slice()),
                )
            }
            Entity::PrimitiveArray(a) => {
                let class = class_named(&a.primitive_type().array_class_name());
                (
                    class,
                    class_size(class)
                        + a.num_elements() as u64 * a.primitive_type().element_size() as u64,
                    InstanceKind::PrimitiveArray(primitive_values(buf, a)?),
                )
            }
        };

        instances.push(InstanceData {
            id,
            class,
            heap: pending.heap,
            stack_trace_serial: pending.entity.stack_trace_serial(),
            shallow_size,
            kind,
        });
    }

    let mut roots = Vec::with_capacity(dump.roots.len());
    let mut root_types: HashMap<InstanceIndex, Vec<_>> = HashMap::new();
    for root in &dump.roots {
        if let Value::Instance(instance) =
            linker.resolve(None, root.obj_id(), ReferenceContext::Root)
        {
            roots.push(Root {
                root_type: root.root_type(),
                instance,
            });
            let types = root_types.entry(instance).or_insert_with(Vec::new);
            if !types.contains(&root.root_type()) {
                types.push(root.root_type());
            }
        }
    }

    let heaps = dump
        .heap_names
        .iter()
        .map(|name| match name {
            Some(id) => dump
                .strings
                .get_or_placeholder(*id, "heap")
                .map(|n| n.into_owned()),
            None => Ok(DEFAULT_HEAP.to_owned()),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let stack_traces = stack_traces(&dump, &infos, proguard)?;

    if !linker.unresolved.is_empty() {
        log::warn!(
            "{} references to objects missing from the dump were read as null",
            linker.unresolved.len()
        );
    }

    let Linker {
        index_by_id,
        unresolved,
        ..
    } = linker;
    let instance_count = instances.len();
    let mut snapshot = Snapshot {
        id_size,
        timestamp_millis: dump.timestamp_millis,
        instances,
        index_by_id,
        classes_by_name,
        roots,
        root_types,
        heaps,
        stack_traces,
        external_sizes: vec![0; instance_count],
        unresolved,
        analysis: OnceCell::new(),
    };
    snapshot.external_sizes = external_sizes(&snapshot, models);

    log::info!(
        "Built snapshot of {} instances from {} bytes in {:?}",
        instance_count,
        buf.len(),
        start.elapsed()
    );

    Ok(snapshot)
}

fn primitive_values(buf: &[u8], a: &PrimitiveArray<'_>) -> Result<PrimitiveValues, ParseError> {
    macro_rules! decode {
        ($method:ident, $variant:ident) => {
            match a.$method() {
                Some(iter) => PrimitiveValues::$variant(lift(
                    buf,
                    "primitive array elements",
                    iter.collect::<Result<Vec<_>, _>>(),
                )?),
                None => PrimitiveValues::NoData(a.primitive_type(), a.num_elements()),
            }
        };
    }

    Ok(match a.primitive_type() {
        PrimitiveArrayType::Boolean => decode!(booleans, Boolean),
        PrimitiveArrayType::Char => decode!(chars, Char),
        PrimitiveArrayType::Float => decode!(floats, Float),
        PrimitiveArrayType::Double => decode!(doubles, Double),
        PrimitiveArrayType::Byte => decode!(bytes, Byte),
        PrimitiveArrayType::Short => decode!(shorts, Short),
        PrimitiveArrayType::Int => decode!(ints, Int),
        PrimitiveArrayType::Long => decode!(longs, Long),
    })
}

/// Frame descriptions per trace serial, innermost first
fn stack_traces(
    dump: &Dump<'_>,
    infos: &HashMap<Id, ClassInfo>,
    proguard: &ProguardMap,
) -> Result<HashMap<Serial, Vec<String>>, ParseError> {
    let mut descriptions: HashMap<Id, String> = HashMap::new();
    let mut traces = HashMap::with_capacity(dump.traces.len());

    for (serial, frame_ids) in &dump.traces {
        let mut frames = Vec::with_capacity(frame_ids.len());
        for frame_id in frame_ids {
            if let Some(description) = descriptions.get(frame_id) {
                frames.push(description.clone());
                continue;
            }

            let frame = match dump.frames.get(frame_id) {
                Some(f) => f,
                None => {
                    log::debug!("Stack trace {} names missing frame {:#x}", serial, frame_id);
                    continue;
                }
            };
            let description = describe_frame(dump, infos, proguard, frame)?;
            descriptions.insert(*frame_id, description.clone());
            frames.push(description);
        }
        traces.insert(*serial, frames);
    }

    Ok(traces)
}

fn describe_frame(
    dump: &Dump<'_>,
    infos: &HashMap<Id, ClassInfo>,
    proguard: &ProguardMap,
    frame: &StackFrame,
) -> Result<String, ParseError> {
    let raw_class = dump
        .class_by_serial
        .get(&frame.class_serial())
        .map(|class_id| match infos.get(class_id) {
            Some(info) => Ok(Cow::Borrowed(info.raw_name.as_str())),
            None => dump
                .class_name_ids
                .get(class_id)
                .map(|name_id| dump.strings.get_or_placeholder(*name_id, "string"))
                .unwrap_or_else(|| Ok(Cow::Owned(format!("class@{:#x}", class_id))))
                .map(|n| Cow::Owned(normalize_class_name(&n))),
        })
        .unwrap_or_else(|| Ok(Cow::Borrowed("unknown")))?;
    let method = dump
        .strings
        .get_or_placeholder(frame.method_name_id(), "method")?;
    let file = dump
        .strings
        .get_or_placeholder(frame.source_file_name_id(), "file")?;

    let f = proguard.frame(&raw_class, &method, &file, frame.line_num());
    Ok(format!(
        "{}.{} - {}:{}",
        f.class_name, f.method_name, f.file_name, f.line
    ))
}

/// The classes a model could be registered for: the class itself, then its superclasses
fn class_chain(snapshot: &Snapshot, class: InstanceIndex) -> Vec<&str> {
    let mut names = vec![];
    let mut visited = HashSet::new();
    let mut next = Some(class);
    while let Some(index) = next {
        let class = match snapshot.instances[index.index()].as_class() {
            Some(c) if visited.insert(index) => c,
            _ => break,
        };
        names.push(class.name.as_str());
        next = class.super_class;
    }
    names
}

fn external_sizes(snapshot: &Snapshot, models: &[Box<dyn ExternalSizeModel>]) -> Vec<u64> {
    let mut sizes = vec![0; snapshot.instances.len()];
    if models.is_empty() {
        return sizes;
    }

    let mut by_class: HashMap<InstanceIndex, Option<&dyn ExternalSizeModel>> = HashMap::new();
    for (i, inst) in snapshot.instances.iter().enumerate() {
        let class = match inst.class {
            Some(c) => c,
            None => continue,
        };
        let model = *by_class
            .entry(class)
            .or_insert_with(|| select_model(models, class_chain(snapshot, class)));

        if let Some(model) = model {
            let instance = InstanceRef::new(snapshot, InstanceIndex(i as u32));
            sizes[i] = model.external_size(&instance);
        }
    }

    sizes
}
