//! Writes small hprof files for tests.

use crate::heap_dump::{FieldType, PrimitiveArrayType, RootType};
use crate::{IdSize, ParseError, ParseResult};
use std::collections::HashMap;

pub(crate) fn lift<T>(r: ParseResult<'_, T>, buf: &[u8]) -> Result<T, ParseError> {
    r.map_err(|e| ParseError::from_nom(e, buf, "test input"))
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum TestValue {
    /// 0 is null
    Ref(u64),
    Bool(bool),
    Char(u16),
    Float(f32),
    Double(f64),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
}

impl TestValue {
    pub(crate) fn field_type(&self) -> FieldType {
        match self {
            TestValue::Ref(_) => FieldType::ObjectId,
            TestValue::Bool(_) => FieldType::Boolean,
            TestValue::Char(_) => FieldType::Char,
            TestValue::Float(_) => FieldType::Float,
            TestValue::Double(_) => FieldType::Double,
            TestValue::Byte(_) => FieldType::Byte,
            TestValue::Short(_) => FieldType::Short,
            TestValue::Int(_) => FieldType::Int,
            TestValue::Long(_) => FieldType::Long,
        }
    }

    fn write(&self, id_size: IdSize, out: &mut Vec<u8>) {
        match *self {
            TestValue::Ref(id) => write_id(id_size, id, out),
            TestValue::Bool(b) => out.push(b as u8),
            TestValue::Char(c) => out.extend_from_slice(&c.to_be_bytes()),
            TestValue::Float(f) => out.extend_from_slice(&f.to_bits().to_be_bytes()),
            TestValue::Double(f) => out.extend_from_slice(&f.to_bits().to_be_bytes()),
            TestValue::Byte(b) => out.push(b as u8),
            TestValue::Short(s) => out.extend_from_slice(&s.to_be_bytes()),
            TestValue::Int(i) => out.extend_from_slice(&i.to_be_bytes()),
            TestValue::Long(l) => out.extend_from_slice(&l.to_be_bytes()),
        }
    }
}

fn write_id(id_size: IdSize, id: u64, out: &mut Vec<u8>) {
    match id_size {
        IdSize::U32 => out.extend_from_slice(&(id as u32).to_be_bytes()),
        IdSize::U64 => out.extend_from_slice(&id.to_be_bytes()),
    }
}

/// Low level writer: records are emitted exactly as described, nothing is checked.
pub(crate) struct HprofWriter {
    id_size: IdSize,
    timestamp: u64,
    records: Vec<u8>,
    segment: Vec<u8>,
    strings: HashMap<String, u64>,
    next_string_id: u64,
}

impl HprofWriter {
    pub(crate) fn new(id_size: IdSize) -> HprofWriter {
        HprofWriter {
            id_size,
            timestamp: 0,
            records: vec![],
            segment: vec![],
            strings: HashMap::new(),
            next_string_id: 0x0100_0000,
        }
    }

    pub(crate) fn id_size(&self) -> IdSize {
        self.id_size
    }

    pub(crate) fn set_timestamp(&mut self, millis: u64) {
        self.timestamp = millis;
    }

    fn id(&self, id: u64, out: &mut Vec<u8>) {
        write_id(self.id_size, id, out)
    }

    pub(crate) fn raw_record(&mut self, tag: u8, body: &[u8]) {
        self.records.push(tag);
        self.records.extend_from_slice(&0_u32.to_be_bytes());
        self.records
            .extend_from_slice(&(body.len() as u32).to_be_bytes());
        self.records.extend_from_slice(body);
    }

    /// Returns the string's id, writing the record the first time a string is seen
    pub(crate) fn string(&mut self, text: &str) -> u64 {
        if let Some(id) = self.strings.get(text) {
            return *id;
        }

        let id = self.next_string_id;
        self.next_string_id += 1;
        let mut body = vec![];
        self.id(id, &mut body);
        body.extend_from_slice(text.as_bytes());
        self.raw_record(0x01, &body);
        self.strings.insert(text.to_owned(), id);
        id
    }

    pub(crate) fn load_class(&mut self, serial: u32, class_id: u64, name: &str) {
        let name_id = self.string(name);
        let mut body = vec![];
        body.extend_from_slice(&serial.to_be_bytes());
        self.id(class_id, &mut body);
        body.extend_from_slice(&0_u32.to_be_bytes());
        self.id(name_id, &mut body);
        self.raw_record(0x02, &body);
    }

    pub(crate) fn stack_frame(
        &mut self,
        frame_id: u64,
        method: &str,
        signature: &str,
        file: &str,
        class_serial: u32,
        line: i32,
    ) {
        let method = self.string(method);
        let signature = self.string(signature);
        let file = self.string(file);
        let mut body = vec![];
        self.id(frame_id, &mut body);
        self.id(method, &mut body);
        self.id(signature, &mut body);
        self.id(file, &mut body);
        body.extend_from_slice(&class_serial.to_be_bytes());
        body.extend_from_slice(&line.to_be_bytes());
        self.raw_record(0x04, &body);
    }

    /// `frames` innermost first
    pub(crate) fn stack_trace(&mut self, serial: u32, thread_serial: u32, frames: &[u64]) {
        let mut body = vec![];
        body.extend_from_slice(&serial.to_be_bytes());
        body.extend_from_slice(&thread_serial.to_be_bytes());
        body.extend_from_slice(&(frames.len() as u32).to_be_bytes());
        for f in frames {
            self.id(*f, &mut body);
        }
        self.raw_record(0x05, &body);
    }

    pub(crate) fn raw_sub_record(&mut self, bytes: &[u8]) {
        self.segment.extend_from_slice(bytes);
    }

    pub(crate) fn gc_root(&mut self, root_type: RootType, obj_id: u64) {
        let mut sub = vec![root_type.tag_byte()];
        self.id(obj_id, &mut sub);
        match root_type {
            RootType::JniGlobal => self.id(0xDEAD, &mut sub),
            RootType::JniLocal | RootType::JavaFrame | RootType::JniMonitor => {
                sub.extend_from_slice(&1_u32.to_be_bytes());
                sub.extend_from_slice(&2_u32.to_be_bytes());
            }
            RootType::NativeStack | RootType::ThreadBlock => {
                sub.extend_from_slice(&1_u32.to_be_bytes());
            }
            RootType::ThreadObject => {
                sub.extend_from_slice(&1_u32.to_be_bytes());
                sub.extend_from_slice(&2_u32.to_be_bytes());
            }
            _ => {}
        }
        self.raw_sub_record(&sub);
    }

    pub(crate) fn unreachable(&mut self, obj_id: u64) {
        let mut sub = vec![0x90];
        self.id(obj_id, &mut sub);
        self.raw_sub_record(&sub);
    }

    pub(crate) fn heap_dump_info(&mut self, heap_id: u32, name_id: u64) {
        let mut sub = vec![0xFE];
        sub.extend_from_slice(&heap_id.to_be_bytes());
        self.id(name_id, &mut sub);
        self.raw_sub_record(&sub);
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn class_dump_full(
        &mut self,
        class_id: u64,
        super_id: Option<u64>,
        loader_id: Option<u64>,
        instance_size: u32,
        const_pool: &[(u16, TestValue)],
        statics: &[(u64, TestValue)],
        fields: &[(u64, FieldType)],
    ) {
        let mut sub = vec![0x20];
        self.id(class_id, &mut sub);
        sub.extend_from_slice(&0_u32.to_be_bytes());
        self.id(super_id.unwrap_or(0), &mut sub);
        self.id(loader_id.unwrap_or(0), &mut sub);
        // signers, protection domain, 2 reserved
        for _ in 0..4 {
            self.id(0, &mut sub);
        }
        sub.extend_from_slice(&instance_size.to_be_bytes());

        sub.extend_from_slice(&(const_pool.len() as u16).to_be_bytes());
        for (index, value) in const_pool {
            sub.extend_from_slice(&index.to_be_bytes());
            sub.push(value.field_type().type_byte());
            value.write(self.id_size, &mut sub);
        }

        sub.extend_from_slice(&(statics.len() as u16).to_be_bytes());
        for (name_id, value) in statics {
            self.id(*name_id, &mut sub);
            sub.push(value.field_type().type_byte());
            value.write(self.id_size, &mut sub);
        }

        sub.extend_from_slice(&(fields.len() as u16).to_be_bytes());
        for (name_id, field_type) in fields {
            self.id(*name_id, &mut sub);
            sub.push(field_type.type_byte());
        }

        self.raw_sub_record(&sub);
    }

    pub(crate) fn instance_dump(
        &mut self,
        obj_id: u64,
        stack_serial: u32,
        class_id: u64,
        values: &[TestValue],
    ) {
        let mut data = vec![];
        for v in values {
            v.write(self.id_size, &mut data);
        }
        self.instance_dump_raw(obj_id, stack_serial, class_id, &data);
    }

    pub(crate) fn instance_dump_raw(
        &mut self,
        obj_id: u64,
        stack_serial: u32,
        class_id: u64,
        data: &[u8],
    ) {
        let mut sub = vec![0x21];
        self.id(obj_id, &mut sub);
        sub.extend_from_slice(&stack_serial.to_be_bytes());
        self.id(class_id, &mut sub);
        sub.extend_from_slice(&(data.len() as u32).to_be_bytes());
        sub.extend_from_slice(data);
        self.raw_sub_record(&sub);
    }

    pub(crate) fn object_array_dump(
        &mut self,
        obj_id: u64,
        stack_serial: u32,
        class_id: u64,
        elements: &[u64],
    ) {
        let mut sub = vec![0x22];
        self.id(obj_id, &mut sub);
        sub.extend_from_slice(&stack_serial.to_be_bytes());
        sub.extend_from_slice(&(elements.len() as u32).to_be_bytes());
        self.id(class_id, &mut sub);
        for e in elements {
            self.id(*e, &mut sub);
        }
        self.raw_sub_record(&sub);
    }

    /// `data` is the raw big-endian element bytes
    pub(crate) fn primitive_array_dump(
        &mut self,
        obj_id: u64,
        stack_serial: u32,
        primitive_type: PrimitiveArrayType,
        data: &[u8],
    ) {
        let mut sub = vec![0x23];
        self.id(obj_id, &mut sub);
        sub.extend_from_slice(&stack_serial.to_be_bytes());
        let len = data.len() / primitive_type.element_size();
        sub.extend_from_slice(&(len as u32).to_be_bytes());
        sub.push(primitive_type.type_byte());
        sub.extend_from_slice(data);
        self.raw_sub_record(&sub);
    }

    pub(crate) fn primitive_array_nodata(
        &mut self,
        obj_id: u64,
        stack_serial: u32,
        primitive_type: PrimitiveArrayType,
        len: u32,
    ) {
        let mut sub = vec![0xC3];
        self.id(obj_id, &mut sub);
        sub.extend_from_slice(&stack_serial.to_be_bytes());
        sub.extend_from_slice(&len.to_be_bytes());
        sub.push(primitive_type.type_byte());
        self.raw_sub_record(&sub);
    }

    fn header(&self) -> Vec<u8> {
        let mut out = b"JAVA PROFILE 1.0.3\0".to_vec();
        out.extend_from_slice(&(self.id_size.size_in_bytes() as u32).to_be_bytes());
        out.extend_from_slice(&((self.timestamp >> 32) as u32).to_be_bytes());
        out.extend_from_slice(&(self.timestamp as u32).to_be_bytes());
        out
    }

    /// Header and top level records only; pending sub-records are dropped
    pub(crate) fn finish_without_segment(self) -> Vec<u8> {
        let mut out = self.header();
        out.extend_from_slice(&self.records);
        out
    }

    /// Writes pending sub-records as one heap dump segment, then the end marker
    pub(crate) fn finish(mut self) -> Vec<u8> {
        let segment = std::mem::take(&mut self.segment);
        self.raw_record(0x1C, &segment);
        self.raw_record(0x2C, &[]);
        self.finish_without_segment()
    }
}

struct TestClass {
    id: u64,
    serial: u32,
    instance_size: u32,
}

/// Higher level writer that tracks class ids and layouts by name.
///
/// Classes get a sticky-class root the way a VM roots its system classes, so they are
/// reachable unless a test says otherwise.
pub(crate) struct TestHeap {
    pub(crate) w: HprofWriter,
    next_id: u64,
    next_class_serial: u32,
    next_trace_serial: u32,
    next_frame_id: u64,
    stack_serial: u32,
    classes: HashMap<String, TestClass>,
    root_classes: bool,
}

impl TestHeap {
    pub(crate) fn new() -> TestHeap {
        TestHeap::with_id_size(IdSize::U32)
    }

    pub(crate) fn with_id_size(id_size: IdSize) -> TestHeap {
        TestHeap {
            w: HprofWriter::new(id_size),
            next_id: 0x1000,
            next_class_serial: 1,
            next_trace_serial: 1,
            next_frame_id: 0x0200_0000,
            stack_serial: 0,
            classes: HashMap::new(),
            root_classes: true,
        }
    }

    /// Classes declared from now on don't get a root
    pub(crate) fn unrooted_classes(&mut self) {
        self.root_classes = false;
    }

    /// Reserve an object id, for building cycles
    pub(crate) fn id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 0x10;
        id
    }

    pub(crate) fn class_id(&self, name: &str) -> u64 {
        self.classes[name].id
    }

    pub(crate) fn class(
        &mut self,
        name: &str,
        super_name: Option<&str>,
        fields: &[(&str, FieldType)],
    ) -> u64 {
        self.class_with_statics(name, super_name, fields, &[])
    }

    pub(crate) fn class_with_statics(
        &mut self,
        name: &str,
        super_name: Option<&str>,
        fields: &[(&str, FieldType)],
        statics: &[(&str, TestValue)],
    ) -> u64 {
        let id = self.id();
        let serial = self.next_class_serial;
        self.next_class_serial += 1;
        self.w.load_class(serial, id, name);

        let id_size = self.w.id_size();
        let (super_id, super_size) = match super_name {
            Some(s) => {
                let c = &self.classes[s];
                (Some(c.id), c.instance_size)
            }
            None => (None, 0),
        };
        let own_size: usize = fields.iter().map(|(_, t)| t.size_in_bytes(id_size)).sum();
        let instance_size = super_size + own_size as u32;

        let fields: Vec<(u64, FieldType)> = fields
            .iter()
            .map(|(n, t)| (self.w.string(n), *t))
            .collect();
        let statics: Vec<(u64, TestValue)> = statics
            .iter()
            .map(|(n, v)| (self.w.string(n), *v))
            .collect();
        self.w
            .class_dump_full(id, super_id, None, instance_size, &[], &statics, &fields);

        if self.root_classes {
            self.w.gc_root(RootType::StickyClass, id);
        }
        self.classes.insert(
            name.to_owned(),
            TestClass {
                id,
                serial,
                instance_size,
            },
        );
        id
    }

    /// `values` in dump order: the class's own fields first, then its superclass's
    pub(crate) fn object(&mut self, class: &str, values: &[TestValue]) -> u64 {
        let id = self.id();
        self.object_at(id, class, values);
        id
    }

    pub(crate) fn object_at(&mut self, id: u64, class: &str, values: &[TestValue]) {
        let class_id = self.classes[class].id;
        self.w
            .instance_dump(id, self.stack_serial, class_id, values);
    }

    pub(crate) fn object_array(&mut self, class: &str, elements: &[u64]) -> u64 {
        let id = self.id();
        self.object_array_at(id, class, elements);
        id
    }

    pub(crate) fn object_array_at(&mut self, id: u64, class: &str, elements: &[u64]) {
        let class_id = self.classes[class].id;
        self.w
            .object_array_dump(id, self.stack_serial, class_id, elements);
    }

    pub(crate) fn primitive_array(&mut self, primitive_type: PrimitiveArrayType, data: &[u8]) -> u64 {
        let id = self.id();
        self.w
            .primitive_array_dump(id, self.stack_serial, primitive_type, data);
        id
    }

    pub(crate) fn char_array(&mut self, text: &str) -> u64 {
        let data: Vec<u8> = text
            .encode_utf16()
            .flat_map(|c| c.to_be_bytes().to_vec())
            .collect();
        self.primitive_array(PrimitiveArrayType::Char, &data)
    }

    pub(crate) fn root(&mut self, root_type: RootType, id: u64) {
        self.w.gc_root(root_type, id);
    }

    /// Switch the heap for subsequent objects
    pub(crate) fn heap(&mut self, heap_id: u32, name: &str) {
        let name_id = self.w.string(name);
        self.w.heap_dump_info(heap_id, name_id);
    }

    /// Declares a stack trace from `(class, method, file, line)` frames, innermost first.
    /// Each frame's class must already be declared.
    pub(crate) fn stack(&mut self, frames: &[(&str, &str, &str, i32)]) -> u32 {
        let mut frame_ids = vec![];
        for (class, method, file, line) in frames {
            let frame_id = self.next_frame_id;
            self.next_frame_id += 1;
            let class_serial = self.classes[*class].serial;
            self.w
                .stack_frame(frame_id, method, "()V", file, class_serial, *line);
            frame_ids.push(frame_id);
        }
        let serial = self.next_trace_serial;
        self.next_trace_serial += 1;
        self.w.stack_trace(serial, 1, &frame_ids);
        serial
    }

    /// Subsequent objects are allocated at this stack trace (0 for none)
    pub(crate) fn allocate_at(&mut self, stack_serial: u32) {
        self.stack_serial = stack_serial;
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        self.w.finish()
    }
}
