//! Sub-records found inside HPROF_HEAP_DUMP and HPROF_HEAP_DUMP_SEGMENT records.

use crate::error::{RecordError, RecordResult};
use crate::*;
use strum_macros::{Display, EnumIter};

mod primitive_array;

pub use primitive_array::*;

#[derive(Clone)]
pub enum SubRecord<'a> {
    GcRoot(GcRoot),
    /// Android dumps list objects the VM knows to be unreachable; they carry no edges.
    Unreachable(Option<Id>),
    HeapDumpInfo(HeapDumpInfo),
    Class(Class<'a>),
    Instance(Instance<'a>),
    ObjectArray(ObjectArray<'a>),
    PrimitiveArray(PrimitiveArray<'a>),
}

impl<'a> SubRecord<'a> {
    pub(crate) fn parse(input: &'a [u8], id_size: IdSize) -> RecordResult<'a, SubRecord<'a>> {
        let tag_input = input;
        let (input, tag) = number::be_u8(input)?;

        // https://github.com/openjdk/jdk/blob/08822b4e0526fe001c39fe08e241b849eddf481d/src/hotspot/share/services/heapDumper.cpp#L175
        match tag {
            0x20 => Class::parse(input, id_size).map(|(i, c)| (i, SubRecord::Class(c))),
            0x21 => Instance::parse(input, id_size).map(|(i, o)| (i, SubRecord::Instance(o))),
            0x22 => {
                ObjectArray::parse(input, id_size).map(|(i, a)| (i, SubRecord::ObjectArray(a)))
            }
            0x23 => PrimitiveArray::parse(input, id_size, true)
                .map(|(i, a)| (i, SubRecord::PrimitiveArray(a))),
            // android: array dumped without its contents
            0xC3 => PrimitiveArray::parse(input, id_size, false)
                .map(|(i, a)| (i, SubRecord::PrimitiveArray(a))),
            0xFE => {
                HeapDumpInfo::parse(input, id_size).map(|(i, h)| (i, SubRecord::HeapDumpInfo(h)))
            }
            0x90 => Option::<Id>::parse(input, id_size)
                .map(|(i, id)| (i, SubRecord::Unreachable(id))),
            _ => match RootType::from_tag_byte(tag) {
                Some(root_type) => GcRoot::parse(input, id_size, root_type)
                    .map(|(i, r)| (i, SubRecord::GcRoot(r))),
                None => Err(RecordError::unknown_tag(
                    tag_input,
                    "heap dump sub-record",
                    tag,
                )),
            },
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, Display)]
pub enum RootType {
    #[strum(serialize = "UNKNOWN")]
    Unknown,
    #[strum(serialize = "JNI_GLOBAL")]
    JniGlobal,
    #[strum(serialize = "JNI_LOCAL")]
    JniLocal,
    #[strum(serialize = "JAVA_FRAME")]
    JavaFrame,
    #[strum(serialize = "NATIVE_STACK")]
    NativeStack,
    #[strum(serialize = "STICKY_CLASS")]
    StickyClass,
    #[strum(serialize = "THREAD_BLOCK")]
    ThreadBlock,
    #[strum(serialize = "MONITOR")]
    MonitorUsed,
    #[strum(serialize = "THREAD")]
    ThreadObject,
    #[strum(serialize = "INTERNED_STRING")]
    InternedString,
    #[strum(serialize = "FINALIZING")]
    Finalizing,
    #[strum(serialize = "DEBUGGER")]
    Debugger,
    #[strum(serialize = "REFERENCE_CLEANUP")]
    ReferenceCleanup,
    #[strum(serialize = "VM_INTERNAL")]
    VmInternal,
    #[strum(serialize = "JNI_MONITOR")]
    JniMonitor,
}

impl RootType {
    pub fn tag_byte(&self) -> u8 {
        match self {
            RootType::Unknown => 0xFF,
            RootType::JniGlobal => 0x01,
            RootType::JniLocal => 0x02,
            RootType::JavaFrame => 0x03,
            RootType::NativeStack => 0x04,
            RootType::StickyClass => 0x05,
            RootType::ThreadBlock => 0x06,
            RootType::MonitorUsed => 0x07,
            RootType::ThreadObject => 0x08,
            RootType::InternedString => 0x89,
            RootType::Finalizing => 0x8A,
            RootType::Debugger => 0x8B,
            RootType::ReferenceCleanup => 0x8C,
            RootType::VmInternal => 0x8D,
            RootType::JniMonitor => 0x8E,
        }
    }

    pub fn from_tag_byte(tag: u8) -> Option<RootType> {
        let root_type = match tag {
            0xFF => RootType::Unknown,
            0x01 => RootType::JniGlobal,
            0x02 => RootType::JniLocal,
            0x03 => RootType::JavaFrame,
            0x04 => RootType::NativeStack,
            0x05 => RootType::StickyClass,
            0x06 => RootType::ThreadBlock,
            0x07 => RootType::MonitorUsed,
            0x08 => RootType::ThreadObject,
            0x89 => RootType::InternedString,
            0x8A => RootType::Finalizing,
            0x8B => RootType::Debugger,
            0x8C => RootType::ReferenceCleanup,
            0x8D => RootType::VmInternal,
            0x8E => RootType::JniMonitor,
            _ => return None,
        };

        Some(root_type)
    }
}

/// All the root sub-record shapes folded into one: the extra fields only exist for some kinds.
#[derive(CopyGetters, Copy, Clone, Debug)]
pub struct GcRoot {
    #[get_copy = "pub"]
    root_type: RootType,
    /// `None` when the dump wrote a null id (e.g. a thread object for an attaching thread)
    #[get_copy = "pub"]
    obj_id: Option<Id>,
    #[get_copy = "pub"]
    thread_serial: Option<Serial>,
    /// Frame number in the thread's stack trace, or stack depth for jni monitors
    #[get_copy = "pub"]
    frame_index: Option<u32>,
    /// Only for thread objects
    #[get_copy = "pub"]
    stack_trace_serial: Option<Serial>,
    /// Only for jni globals
    #[get_copy = "pub"]
    jni_global_ref_id: Option<Id>,
}

impl GcRoot {
    fn parse(input: &[u8], id_size: IdSize, root_type: RootType) -> RecordResult<GcRoot> {
        let (input, obj_id) = Option::<Id>::parse(input, id_size)?;

        let mut root = GcRoot {
            root_type,
            obj_id,
            thread_serial: None,
            frame_index: None,
            stack_trace_serial: None,
            jni_global_ref_id: None,
        };

        let input = match root_type {
            RootType::JniGlobal => {
                let (input, ref_id) = Option::<Id>::parse(input, id_size)?;
                root.jni_global_ref_id = ref_id;
                input
            }
            RootType::JniLocal | RootType::JavaFrame | RootType::JniMonitor => {
                let (input, thread_serial) = number::be_u32(input)?;
                let (input, frame) = number::be_u32(input)?;
                root.thread_serial = Some(thread_serial);
                // -1 when the frame is unknown
                root.frame_index = if frame == u32::MAX { None } else { Some(frame) };
                input
            }
            RootType::NativeStack | RootType::ThreadBlock => {
                let (input, thread_serial) = number::be_u32(input)?;
                root.thread_serial = Some(thread_serial);
                input
            }
            RootType::ThreadObject => {
                let (input, thread_serial) = number::be_u32(input)?;
                let (input, stack_trace_serial) = number::be_u32(input)?;
                root.thread_serial = Some(thread_serial);
                root.stack_trace_serial = Some(stack_trace_serial);
                input
            }
            RootType::Unknown
            | RootType::StickyClass
            | RootType::MonitorUsed
            | RootType::InternedString
            | RootType::Finalizing
            | RootType::Debugger
            | RootType::ReferenceCleanup
            | RootType::VmInternal => input,
        };

        Ok((input, root))
    }
}

/// Switches the heap that subsequent sub-records belong to (android)
#[derive(CopyGetters, Copy, Clone, Debug)]
pub struct HeapDumpInfo {
    #[get_copy = "pub"]
    heap_id: u32,
    #[get_copy = "pub"]
    heap_name_id: Id,
}

impl HeapDumpInfo {
    fn parse(input: &[u8], id_size: IdSize) -> RecordResult<HeapDumpInfo> {
        let (input, heap_id) = number::be_u32(input)?;
        let (input, heap_name_id) = Id::parse(input, id_size)?;

        Ok((
            input,
            HeapDumpInfo {
                heap_id,
                heap_name_id,
            },
        ))
    }
}

#[derive(CopyGetters, Copy, Clone)]
pub struct Class<'a> {
    id_size: IdSize,
    #[get_copy = "pub"]
    obj_id: Id,
    #[get_copy = "pub"]
    stack_trace_serial: Serial,
    #[get_copy = "pub"]
    super_class_obj_id: Option<Id>,
    #[get_copy = "pub"]
    class_loader_obj_id: Option<Id>,
    #[get_copy = "pub"]
    signers_obj_id: Option<Id>,
    #[get_copy = "pub"]
    protection_domain_obj_id: Option<Id>,
    /// Size of an instance's field data in bytes
    #[get_copy = "pub"]
    instance_size_bytes: u32,
    num_static_fields: u16,
    static_fields: &'a [u8],
    num_instance_fields: u16,
    instance_fields: &'a [u8],
}

impl<'a> Class<'a> {
    fn parse(input: &'a [u8], id_size: IdSize) -> RecordResult<'a, Class<'a>> {
        // https://github.com/openjdk/jdk/blob/08822b4e0526fe001c39fe08e241b849eddf481d/src/hotspot/share/services/heapDumper.cpp#L216
        let (input, obj_id) = Id::parse(input, id_size)?;
        let (input, stack_trace_serial) = number::be_u32(input)?;
        let (input, super_class_obj_id) = Option::<Id>::parse(input, id_size)?;
        let (input, class_loader_obj_id) = Option::<Id>::parse(input, id_size)?;
        let (input, signers_obj_id) = Option::<Id>::parse(input, id_size)?;
        let (input, protection_domain_obj_id) = Option::<Id>::parse(input, id_size)?;
        // 2 reserved ids
        let (input, _) = bytes::take(id_size.size_in_bytes() * 2)(input)?;
        let (input, instance_size_bytes) = number::be_u32(input)?;

        // constant pool entries aren't used for anything, but they have to be walked over
        let (mut input, num_const_pool) = number::be_u16(input)?;
        for _ in 0..num_const_pool {
            let (i, _index) = number::be_u16(input)?;
            let (i, field_type) = FieldType::parse(i)?;
            let (i, _value) = field_type.parse_value(i, id_size)?;
            input = i;
        }

        let (input, num_static_fields) = number::be_u16(input)?;
        let static_fields_start = input;
        let mut input = input;
        for _ in 0..num_static_fields {
            let (i, _) = StaticFieldEntry::parse(input, id_size)?;
            input = i;
        }
        let static_fields = &static_fields_start[..static_fields_start.len() - input.len()];

        let (input, num_instance_fields) = number::be_u16(input)?;
        // name id + type byte each
        let (input, instance_fields) =
            bytes::take((id_size.size_in_bytes() + 1) * num_instance_fields as usize)(input)?;

        Ok((
            input,
            Class {
                id_size,
                obj_id,
                stack_trace_serial,
                super_class_obj_id,
                class_loader_obj_id,
                signers_obj_id,
                protection_domain_obj_id,
                instance_size_bytes,
                num_static_fields,
                static_fields,
                num_instance_fields,
                instance_fields,
            },
        ))
    }

    pub fn num_static_fields(&self) -> u16 {
        self.num_static_fields
    }

    pub fn static_fields(&self) -> StaticFieldEntries<'a> {
        StaticFieldEntries {
            iter: ParsingIterator::new_stateless_id_size(
                self.id_size,
                self.static_fields,
                self.num_static_fields as u32,
            ),
        }
    }

    /// Bytes of static field values, not counting names and type tags
    pub fn static_field_value_bytes(&self) -> u64 {
        self.static_fields()
            .filter_map(|r| r.ok())
            .map(|s| s.field_type().size_in_bytes(self.id_size) as u64)
            .sum()
    }

    pub fn num_instance_fields(&self) -> u16 {
        self.num_instance_fields
    }

    /// The fields declared by this class, not including superclass fields
    pub fn instance_field_descriptors(&self) -> FieldDescriptors<'a> {
        FieldDescriptors {
            iter: ParsingIterator::new_stateless_id_size(
                self.id_size,
                self.instance_fields,
                self.num_instance_fields as u32,
            ),
        }
    }
}

#[derive(CopyGetters, Copy, Clone, Debug)]
pub struct StaticFieldEntry {
    #[get_copy = "pub"]
    name_id: Id,
    #[get_copy = "pub"]
    field_type: FieldType,
    #[get_copy = "pub"]
    value: FieldValue,
}

impl StatelessParserWithId for StaticFieldEntry {
    fn parse(input: &[u8], id_size: IdSize) -> RecordResult<Self> {
        let (input, name_id) = Id::parse(input, id_size)?;
        let (input, field_type) = FieldType::parse(input)?;
        let (input, value) = field_type.parse_value(input, id_size)?;

        Ok((
            input,
            StaticFieldEntry {
                name_id,
                field_type,
                value,
            },
        ))
    }
}

#[derive(CopyGetters, Copy, Clone, Debug)]
pub struct FieldDescriptor {
    #[get_copy = "pub"]
    name_id: Id,
    #[get_copy = "pub"]
    field_type: FieldType,
}

impl StatelessParserWithId for FieldDescriptor {
    fn parse(input: &[u8], id_size: IdSize) -> RecordResult<Self> {
        let (input, name_id) = Id::parse(input, id_size)?;
        let (input, field_type) = FieldType::parse(input)?;

        Ok((
            input,
            FieldDescriptor {
                name_id,
                field_type,
            },
        ))
    }
}

pub struct StaticFieldEntries<'a> {
    iter: ParsingIterator<'a, StaticFieldEntry, IdSizeParserWrapper<StaticFieldEntry>>,
}

impl<'a> Iterator for StaticFieldEntries<'a> {
    type Item = ParseResult<'a, StaticFieldEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next()
    }
}

pub struct FieldDescriptors<'a> {
    iter: ParsingIterator<'a, FieldDescriptor, IdSizeParserWrapper<FieldDescriptor>>,
}

impl<'a> Iterator for FieldDescriptors<'a> {
    type Item = ParseResult<'a, FieldDescriptor>;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, EnumIter)]
pub enum FieldType {
    ObjectId,
    Boolean,
    Char,
    Float,
    Double,
    Byte,
    Short,
    Int,
    Long,
}

impl FieldType {
    pub fn from_type_byte(type_byte: u8) -> Option<FieldType> {
        let field_type = match type_byte {
            // 1 is "array", which is written as a plain object id in practice
            0x01 | 0x02 => FieldType::ObjectId,
            0x04 => FieldType::Boolean,
            0x05 => FieldType::Char,
            0x06 => FieldType::Float,
            0x07 => FieldType::Double,
            0x08 => FieldType::Byte,
            0x09 => FieldType::Short,
            0x0A => FieldType::Int,
            0x0B => FieldType::Long,
            _ => return None,
        };

        Some(field_type)
    }

    pub fn type_byte(&self) -> u8 {
        match self {
            FieldType::ObjectId => 0x02,
            FieldType::Boolean => 0x04,
            FieldType::Char => 0x05,
            FieldType::Float => 0x06,
            FieldType::Double => 0x07,
            FieldType::Byte => 0x08,
            FieldType::Short => 0x09,
            FieldType::Int => 0x0A,
            FieldType::Long => 0x0B,
        }
    }

    pub fn size_in_bytes(&self, id_size: IdSize) -> usize {
        match self {
            FieldType::ObjectId => id_size.size_in_bytes(),
            FieldType::Boolean | FieldType::Byte => 1,
            FieldType::Char | FieldType::Short => 2,
            FieldType::Float | FieldType::Int => 4,
            FieldType::Double | FieldType::Long => 8,
        }
    }

    pub fn java_type_name(&self) -> &'static str {
        match self {
            FieldType::ObjectId => "Object",
            FieldType::Boolean => "boolean",
            FieldType::Char => "char",
            FieldType::Float => "float",
            FieldType::Double => "double",
            FieldType::Byte => "byte",
            FieldType::Short => "short",
            FieldType::Int => "int",
            FieldType::Long => "long",
        }
    }

    fn parse(input: &[u8]) -> RecordResult<FieldType> {
        let tag_input = input;
        let (input, type_byte) = number::be_u8(input)?;
        match FieldType::from_type_byte(type_byte) {
            Some(t) => Ok((input, t)),
            None => Err(RecordError::unknown_tag(tag_input, "field type", type_byte)),
        }
    }

    pub fn parse_value<'a>(&self, input: &'a [u8], id_size: IdSize) -> RecordResult<'a, FieldValue> {
        match self {
            FieldType::ObjectId => {
                Option::<Id>::parse(input, id_size).map(|(i, id)| (i, FieldValue::ObjectId(id)))
            }
            FieldType::Boolean => {
                bool::parse(input).map(|(i, b)| (i, FieldValue::Boolean(b)))
            }
            FieldType::Char => u16::parse(input).map(|(i, c)| (i, FieldValue::Char(c))),
            FieldType::Float => f32::parse(input).map(|(i, f)| (i, FieldValue::Float(f))),
            FieldType::Double => f64::parse(input).map(|(i, f)| (i, FieldValue::Double(f))),
            FieldType::Byte => i8::parse(input).map(|(i, b)| (i, FieldValue::Byte(b))),
            FieldType::Short => i16::parse(input).map(|(i, s)| (i, FieldValue::Short(s))),
            FieldType::Int => i32::parse(input).map(|(i, n)| (i, FieldValue::Int(n))),
            FieldType::Long => i64::parse(input).map(|(i, n)| (i, FieldValue::Long(n))),
        }
    }
}

/// A raw field value as written in the dump; object references are still ids.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum FieldValue {
    ObjectId(Option<Id>),
    Boolean(bool),
    Char(u16),
    Float(f32),
    Double(f64),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
}

#[derive(CopyGetters, Copy, Clone)]
pub struct Instance<'a> {
    #[get_copy = "pub"]
    obj_id: Id,
    #[get_copy = "pub"]
    stack_trace_serial: Serial,
    #[get_copy = "pub"]
    class_obj_id: Id,
    /// Field values for this class, then its superclass, and so on up the hierarchy
    #[get_copy = "pub"]
    fields: &'a [u8],
}

impl<'a> Instance<'a> {
    fn parse(input: &'a [u8], id_size: IdSize) -> RecordResult<'a, Instance<'a>> {
        // https://github.com/openjdk/jdk/blob/08822b4e0526fe001c39fe08e241b849eddf481d/src/hotspot/share/services/heapDumper.cpp#L260
        let (input, obj_id) = Id::parse(input, id_size)?;
        let (input, stack_trace_serial) = number::be_u32(input)?;
        let (input, class_obj_id) = Id::parse(input, id_size)?;
        let (input, len) = number::be_u32(input)?;
        let (input, fields) = bytes::take(len)(input)?;

        Ok((
            input,
            Instance {
                obj_id,
                stack_trace_serial,
                class_obj_id,
                fields,
            },
        ))
    }
}

#[derive(CopyGetters, Copy, Clone)]
pub struct ObjectArray<'a> {
    id_size: IdSize,
    #[get_copy = "pub"]
    obj_id: Id,
    #[get_copy = "pub"]
    stack_trace_serial: Serial,
    #[get_copy = "pub"]
    array_class_obj_id: Id,
    #[get_copy = "pub"]
    num_elements: u32,
    contents: &'a [u8],
}

impl<'a> ObjectArray<'a> {
    fn parse(input: &'a [u8], id_size: IdSize) -> RecordResult<'a, ObjectArray<'a>> {
        // https://github.com/openjdk/jdk/blob/08822b4e0526fe001c39fe08e241b849eddf481d/src/hotspot/share/services/heapDumper.cpp#L271
        let (input, obj_id) = Id::parse(input, id_size)?;
        let (input, stack_trace_serial) = number::be_u32(input)?;
        let (input, num_elements) = number::be_u32(input)?;
        let (input, array_class_obj_id) = Id::parse(input, id_size)?;
        let (input, contents) =
            bytes::take(id_size.size_in_bytes() * num_elements as usize)(input)?;

        Ok((
            input,
            ObjectArray {
                id_size,
                obj_id,
                stack_trace_serial,
                array_class_obj_id,
                num_elements,
                contents,
            },
        ))
    }

    /// Null elements are `None`
    pub fn elements(&self) -> NullableIds<'a> {
        NullableIds {
            iter: ParsingIterator::new_stateless_id_size(
                self.id_size,
                self.contents,
                self.num_elements,
            ),
        }
    }
}

pub struct NullableIds<'a> {
    iter: ParsingIterator<'a, Option<Id>, IdSizeParserWrapper<Option<Id>>>,
}

impl<'a> Iterator for NullableIds<'a> {
    type Item = ParseResult<'a, Option<Id>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next()
    }
}
