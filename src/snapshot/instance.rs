use crate::heap_dump::{FieldType, PrimitiveArrayType, RootType};
use crate::external_size::registered_native;
use crate::snapshot::analysis::Dominator;
use crate::snapshot::site::SiteRef;
use crate::snapshot::Snapshot;
use crate::{Id, Serial};
use std::convert::TryFrom;
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

/// Position of an instance in the snapshot's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceIndex(pub(crate) u32);

impl InstanceIndex {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Node number in the reference graph, where 0 is the super-root
    pub(crate) fn node(self) -> u32 {
        self.0 + 1
    }

    pub(crate) fn from_node(node: u32) -> InstanceIndex {
        debug_assert!(node > 0);
        InstanceIndex(node - 1)
    }
}

/// Bytes on the managed heap plus bytes attributed from outside it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Size {
    pub java: u64,
    pub external: u64,
}

impl Size {
    pub const ZERO: Size = Size {
        java: 0,
        external: 0,
    };

    pub fn new(java: u64, external: u64) -> Size {
        Size { java, external }
    }

    pub fn total(&self) -> u64 {
        self.java + self.external
    }

    pub fn is_zero(&self) -> bool {
        self.total() == 0
    }
}

impl Add for Size {
    type Output = Size;

    fn add(self, rhs: Size) -> Size {
        Size {
            java: self.java + rhs.java,
            external: self.external + rhs.external,
        }
    }
}

impl AddAssign for Size {
    fn add_assign(&mut self, rhs: Size) {
        self.java += rhs.java;
        self.external += rhs.external;
    }
}

impl Sum for Size {
    fn sum<I: Iterator<Item = Size>>(iter: I) -> Size {
        iter.fold(Size::ZERO, Add::add)
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.external == 0 {
            write!(f, "{}", self.java)
        } else {
            write!(f, "{} ({} java + {} external)", self.total(), self.java, self.external)
        }
    }
}

/// A field or array element value with references resolved to arena indices.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Null,
    Instance(InstanceIndex),
    Boolean(bool),
    Char(u16),
    Float(f32),
    Double(f64),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_instance(&self) -> Option<InstanceIndex> {
        match self {
            Value::Instance(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Long(l) => Some(*l),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Instance(i) => write!(f, "#{}", i.0),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Char(c) => match std::char::from_u32(*c as u32) {
                Some(c) => write!(f, "'{}'", c),
                None => write!(f, "'\\u{:04x}'", c),
            },
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Byte(v) => write!(f, "{}", v),
            Value::Short(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Long(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FieldDecl {
    pub(crate) name: String,
    pub(crate) field_type: FieldType,
}

#[derive(Debug, Clone)]
pub(crate) struct Field {
    pub(crate) name: String,
    pub(crate) value: Value,
}

#[derive(Debug)]
pub(crate) struct ClassObj {
    pub(crate) name: String,
    pub(crate) super_class: Option<InstanceIndex>,
    pub(crate) class_loader: Option<InstanceIndex>,
    pub(crate) instance_size: u32,
    pub(crate) static_fields: Vec<Field>,
    /// Fields of an instance in dump order: this class's, then each superclass's
    pub(crate) field_layout: Vec<FieldDecl>,
    /// How many leading entries of `field_layout` this class declares
    pub(crate) declared_fields: usize,
    /// Layout position of `java.lang.ref.Reference.referent` for reference classes
    pub(crate) weak_field: Option<usize>,
}

#[derive(Debug)]
pub(crate) enum PrimitiveValues {
    Boolean(Vec<bool>),
    Char(Vec<u16>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    Byte(Vec<i8>),
    Short(Vec<i16>),
    Int(Vec<i32>),
    Long(Vec<i64>),
    /// Dumped without contents
    NoData(PrimitiveArrayType, u32),
}

impl PrimitiveValues {
    pub(crate) fn primitive_type(&self) -> PrimitiveArrayType {
        match self {
            PrimitiveValues::Boolean(_) => PrimitiveArrayType::Boolean,
            PrimitiveValues::Char(_) => PrimitiveArrayType::Char,
            PrimitiveValues::Float(_) => PrimitiveArrayType::Float,
            PrimitiveValues::Double(_) => PrimitiveArrayType::Double,
            PrimitiveValues::Byte(_) => PrimitiveArrayType::Byte,
            PrimitiveValues::Short(_) => PrimitiveArrayType::Short,
            PrimitiveValues::Int(_) => PrimitiveArrayType::Int,
            PrimitiveValues::Long(_) => PrimitiveArrayType::Long,
            PrimitiveValues::NoData(t, _) => *t,
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            PrimitiveValues::Boolean(v) => v.len(),
            PrimitiveValues::Char(v) => v.len(),
            PrimitiveValues::Float(v) => v.len(),
            PrimitiveValues::Double(v) => v.len(),
            PrimitiveValues::Byte(v) => v.len(),
            PrimitiveValues::Short(v) => v.len(),
            PrimitiveValues::Int(v) => v.len(),
            PrimitiveValues::Long(v) => v.len(),
            PrimitiveValues::NoData(_, len) => *len as usize,
        }
    }

    /// `None` past the end, or when there's no data
    pub(crate) fn get(&self, i: usize) -> Option<Value> {
        match self {
            PrimitiveValues::Boolean(v) => v.get(i).map(|x| Value::Boolean(*x)),
            PrimitiveValues::Char(v) => v.get(i).map(|x| Value::Char(*x)),
            PrimitiveValues::Float(v) => v.get(i).map(|x| Value::Float(*x)),
            PrimitiveValues::Double(v) => v.get(i).map(|x| Value::Double(*x)),
            PrimitiveValues::Byte(v) => v.get(i).map(|x| Value::Byte(*x)),
            PrimitiveValues::Short(v) => v.get(i).map(|x| Value::Short(*x)),
            PrimitiveValues::Int(v) => v.get(i).map(|x| Value::Int(*x)),
            PrimitiveValues::Long(v) => v.get(i).map(|x| Value::Long(*x)),
            PrimitiveValues::NoData(_, _) => None,
        }
    }
}

#[derive(Debug)]
pub(crate) enum InstanceKind {
    Class(Box<ClassObj>),
    /// Values line up with the class's `field_layout`
    Object(Box<[Value]>),
    ObjectArray(Box<[Value]>),
    PrimitiveArray(PrimitiveValues),
}

#[derive(Debug)]
pub(crate) struct InstanceData {
    pub(crate) id: Id,
    /// `None` when the class isn't in the dump (primitive arrays, or class objects without
    /// `java.lang.Class`)
    pub(crate) class: Option<InstanceIndex>,
    pub(crate) heap: u16,
    pub(crate) stack_trace_serial: Serial,
    pub(crate) shallow_size: u64,
    pub(crate) kind: InstanceKind,
}

impl InstanceData {
    pub(crate) fn as_class(&self) -> Option<&ClassObj> {
        match &self.kind {
            InstanceKind::Class(c) => Some(c),
            _ => None,
        }
    }

    /// Strong outgoing references, in field/element order
    pub(crate) fn collect_references(&self, weak_field: Option<usize>, out: &mut Vec<InstanceIndex>) {
        match &self.kind {
            InstanceKind::Class(c) => {
                out.extend(c.static_fields.iter().filter_map(|f| f.value.as_instance()))
            }
            InstanceKind::Object(values) => out.extend(
                values
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| Some(*i) != weak_field)
                    .filter_map(|(_, v)| v.as_instance()),
            ),
            InstanceKind::ObjectArray(values) => {
                out.extend(values.iter().filter_map(|v| v.as_instance()))
            }
            InstanceKind::PrimitiveArray(_) => {}
        }
    }
}

fn primitive_array_class_name(t: PrimitiveArrayType) -> &'static str {
    match t {
        PrimitiveArrayType::Boolean => "boolean[]",
        PrimitiveArrayType::Char => "char[]",
        PrimitiveArrayType::Float => "float[]",
        PrimitiveArrayType::Double => "double[]",
        PrimitiveArrayType::Byte => "byte[]",
        PrimitiveArrayType::Short => "short[]",
        PrimitiveArrayType::Int => "int[]",
        PrimitiveArrayType::Long => "long[]",
    }
}

/// A handle on one instance in a snapshot. Cheap to copy.
#[derive(Clone, Copy)]
pub struct InstanceRef<'s> {
    snapshot: &'s Snapshot,
    index: InstanceIndex,
}

/// One step of a path from a gc root.
///
/// `field` describes how this element refers to the next one (`.name` or `[i]`); it's empty
/// for the final element.
#[derive(Clone, Debug)]
pub struct PathElement<'s> {
    pub instance: InstanceRef<'s>,
    pub field: String,
    /// Whether this element dominates the path's target
    pub is_dominator: bool,
}

/// Native memory registered through `libcore.util.NativeAllocationRegistry`
#[derive(Clone, Copy, Debug)]
pub struct NativeAllocation<'s> {
    pub size: u64,
    /// Heap of the cleaner thunk that registered it
    pub heap: &'s str,
    pub pointer: u64,
    /// The instance whose collection frees the allocation
    pub referent: InstanceRef<'s>,
}

impl<'s> InstanceRef<'s> {
    pub(crate) fn new(snapshot: &'s Snapshot, index: InstanceIndex) -> InstanceRef<'s> {
        InstanceRef { snapshot, index }
    }

    fn inst(&self) -> &'s InstanceData {
        &self.snapshot.instances[self.index.index()]
    }

    fn with(&self, index: InstanceIndex) -> InstanceRef<'s> {
        InstanceRef::new(self.snapshot, index)
    }

    pub fn index(&self) -> InstanceIndex {
        self.index
    }

    pub fn snapshot(&self) -> &'s Snapshot {
        self.snapshot
    }

    pub fn id(&self) -> Id {
        self.inst().id
    }

    pub fn heap_name(&self) -> &'s str {
        &self.snapshot.heaps[self.inst().heap as usize]
    }

    pub fn stack_trace_serial(&self) -> Serial {
        self.inst().stack_trace_serial
    }

    /// The allocation stack, innermost frame first
    pub fn stack_frames(&self) -> &'s [String] {
        self.snapshot
            .stack_traces
            .get(&self.inst().stack_trace_serial)
            .map(|frames| frames.as_slice())
            .unwrap_or(&[])
    }

    pub fn class_obj(&self) -> Option<InstanceRef<'s>> {
        self.inst().class.map(|c| self.with(c))
    }

    pub fn class_name(&self) -> &'s str {
        let inst = self.inst();
        match (inst.class, &inst.kind) {
            (Some(c), _) => match self.snapshot.instances[c.index()].as_class() {
                Some(class) => &class.name,
                None => "",
            },
            (None, InstanceKind::Class(_)) => "java.lang.Class",
            (None, InstanceKind::PrimitiveArray(values)) => {
                primitive_array_class_name(values.primitive_type())
            }
            (None, _) => "",
        }
    }

    pub fn is_class_obj(&self) -> bool {
        self.inst().as_class().is_some()
    }

    pub fn is_array(&self) -> bool {
        matches!(
            self.inst().kind,
            InstanceKind::ObjectArray(_) | InstanceKind::PrimitiveArray(_)
        )
    }

    /// For class objects: the name of the class they represent
    pub fn class_obj_name(&self) -> Option<&'s str> {
        self.inst().as_class().map(|c| c.name.as_str())
    }

    /// For class objects
    pub fn super_class(&self) -> Option<InstanceRef<'s>> {
        self.inst()
            .as_class()
            .and_then(|c| c.super_class)
            .map(|s| self.with(s))
    }

    /// For class objects
    pub fn class_loader(&self) -> Option<InstanceRef<'s>> {
        self.inst()
            .as_class()
            .and_then(|c| c.class_loader)
            .map(|s| self.with(s))
    }

    /// For class objects: the size of an instance's field data
    pub fn instance_size(&self) -> Option<u32> {
        self.inst().as_class().map(|c| c.instance_size)
    }

    /// For class objects: the instance fields the class itself declares
    pub fn declared_fields(&self) -> impl Iterator<Item = (&'s str, FieldType)> + 's {
        self.inst()
            .as_class()
            .map(|c| &c.field_layout[..c.declared_fields])
            .unwrap_or(&[])
            .iter()
            .map(|f| (f.name.as_str(), f.field_type))
    }

    /// Whether this instance's class is `class_name` or a subclass of it
    pub fn is_instance_of_class(&self, class_name: &str) -> bool {
        let mut class = self.class_obj();
        // a corrupt dump could have a superclass cycle
        let mut remaining = self.snapshot.instances.len();
        while let Some(c) = class {
            if remaining == 0 {
                return false;
            }
            remaining -= 1;

            if c.class_obj_name() == Some(class_name) {
                return true;
            }
            class = c.super_class();
        }
        false
    }

    pub fn size(&self) -> Size {
        Size {
            java: self.inst().shallow_size,
            external: self.snapshot.external_sizes[self.index.index()],
        }
    }

    pub fn retained_size(&self) -> Size {
        self.snapshot.analysis().retained[self.index.index()]
    }

    /// The part of the retained size allocated in `heap`; zero for unknown heaps
    pub fn retained_size_in_heap(&self, heap: &str) -> Size {
        match self.snapshot.heaps.iter().position(|h| h == heap) {
            Some(h) => self.snapshot.analysis().retained_in_heap(self.index, h),
            None => Size::ZERO,
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.snapshot.analysis().reachable.contains(self.index.index())
    }

    /// `None` when dominated only by the virtual super-root, or when unreachable
    pub fn immediate_dominator(&self) -> Option<InstanceRef<'s>> {
        match self.snapshot.analysis().idom[self.index.index()] {
            Dominator::Instance(i) => Some(self.with(i)),
            Dominator::SuperRoot | Dominator::Unreachable => None,
        }
    }

    /// Whether nothing but the super-root dominates this instance
    pub fn is_rooted(&self) -> bool {
        self.snapshot.analysis().idom[self.index.index()] == Dominator::SuperRoot
    }

    /// Instances immediately dominated by this one, in dump order
    pub fn dominated(&self) -> impl Iterator<Item = InstanceRef<'s>> + 's {
        let snapshot = self.snapshot;
        snapshot
            .analysis()
            .dominated(self.index)
            .iter()
            .map(move |i| InstanceRef::new(snapshot, *i))
    }

    /// Reachable instances with a strong reference to this one, each listed once
    pub fn hard_reverse_references(&self) -> impl Iterator<Item = InstanceRef<'s>> + 's {
        let snapshot = self.snapshot;
        snapshot
            .analysis()
            .hard_referrers(self.index)
            .iter()
            .map(move |i| InstanceRef::new(snapshot, *i))
    }

    /// Reachable references whose referent is this instance
    pub fn soft_reverse_references(&self) -> impl Iterator<Item = InstanceRef<'s>> + 's {
        let snapshot = self.snapshot;
        snapshot
            .analysis()
            .soft_referrers(self.index)
            .iter()
            .map(move |i| InstanceRef::new(snapshot, *i))
    }

    /// The native allocation a `NativeAllocationRegistry` cleaner registered for this instance.
    ///
    /// Only cleaner thunks carry one. The referent is taken from the `sun.misc.Cleaner` that
    /// holds the thunk.
    pub fn native_allocation(&self) -> Option<NativeAllocation<'s>> {
        let native = registered_native(self)?;
        let referent = self
            .hard_reverse_references()
            .filter(|r| r.is_instance_of_class("sun.misc.Cleaner"))
            .find_map(|r| r.referent())?;

        Some(NativeAllocation {
            size: native.size,
            heap: self.heap_name(),
            pointer: native.pointer,
            referent,
        })
    }

    pub fn is_root(&self) -> bool {
        !self.root_types().is_empty()
    }

    /// Distinct root kinds, in first-seen order
    pub fn root_types(&self) -> &'s [RootType] {
        self.snapshot
            .root_types
            .get(&self.index)
            .map(|r| r.as_slice())
            .unwrap_or(&[])
    }

    /// The site this instance was allocated at; `None` when unreachable
    pub fn site(&self) -> Option<SiteRef<'s>> {
        self.snapshot
            .analysis()
            .site_of(self.index)
            .map(|s| SiteRef::new(self.snapshot, s))
    }

    /// Instance fields for objects, static fields for class objects
    pub fn fields(&self) -> Box<dyn Iterator<Item = (&'s str, Value)> + 's> {
        let inst = self.inst();
        match &inst.kind {
            InstanceKind::Object(values) => {
                let layout = inst
                    .class
                    .and_then(|c| self.snapshot.instances[c.index()].as_class())
                    .map(|c| c.field_layout.as_slice())
                    .unwrap_or(&[]);
                Box::new(
                    layout
                        .iter()
                        .zip(values.iter())
                        .map(|(decl, v)| (decl.name.as_str(), *v)),
                )
            }
            InstanceKind::Class(c) => {
                Box::new(c.static_fields.iter().map(|f| (f.name.as_str(), f.value)))
            }
            _ => Box::new(std::iter::empty()),
        }
    }

    /// The value of the field with this name, or `None` if there isn't exactly one field
    /// with that name (subclasses can shadow superclass fields).
    pub fn field(&self, name: &str) -> Option<Value> {
        let mut matching = self.fields().filter(|(n, _)| *n == name).map(|(_, v)| v);
        let value = matching.next()?;
        match matching.next() {
            Some(_) => None,
            None => Some(value),
        }
    }

    pub fn ref_field(&self, name: &str) -> Option<InstanceRef<'s>> {
        self.field(name)
            .and_then(|v| v.as_instance())
            .map(|i| self.with(i))
    }

    pub fn int_field(&self, name: &str) -> Option<i32> {
        self.field(name).and_then(|v| v.as_int())
    }

    pub fn long_field(&self, name: &str) -> Option<i64> {
        self.field(name).and_then(|v| v.as_long())
    }

    pub fn bool_field(&self, name: &str) -> Option<bool> {
        self.field(name).and_then(|v| v.as_boolean())
    }

    pub fn array_length(&self) -> Option<usize> {
        match &self.inst().kind {
            InstanceKind::ObjectArray(values) => Some(values.len()),
            InstanceKind::PrimitiveArray(values) => Some(values.len()),
            _ => None,
        }
    }

    /// For primitive arrays dumped without contents this is always `None`
    pub fn array_value(&self, i: usize) -> Option<Value> {
        match &self.inst().kind {
            InstanceKind::ObjectArray(values) => values.get(i).copied(),
            InstanceKind::PrimitiveArray(values) => values.get(i),
            _ => None,
        }
    }

    pub fn array_values(&self) -> impl Iterator<Item = Value> + 's {
        let this = *self;
        let len = match &self.inst().kind {
            InstanceKind::PrimitiveArray(PrimitiveValues::NoData(_, _)) => 0,
            _ => self.array_length().unwrap_or(0),
        };
        (0..len).filter_map(move |i| this.array_value(i))
    }

    /// The text of a `java.lang.String`, or of a `char[]`/`byte[]`, cut to `max_chars`.
    pub fn as_string(&self, max_chars: Option<usize>) -> Option<String> {
        if let InstanceKind::PrimitiveArray(values) = &self.inst().kind {
            return decode_chars(values, 0, values.len(), false, max_chars);
        }

        if !self.is_instance_of_class("java.lang.String") {
            return None;
        }

        let chars = self.ref_field("value")?;
        let values = match &chars.inst().kind {
            InstanceKind::PrimitiveArray(values) => values,
            _ => return None,
        };

        let len = values.len();
        let count = self
            .int_field("count")
            .and_then(|c| usize::try_from(c).ok())
            .unwrap_or(len);
        let offset = self
            .int_field("offset")
            .and_then(|o| usize::try_from(o).ok())
            .unwrap_or(0);
        let utf16_bytes = self.field("coder") == Some(Value::Byte(1));

        decode_chars(values, offset, count, utf16_bytes, max_chars)
    }

    /// For `java.lang.ref.Reference` instances, the object referred to.
    ///
    /// The referent need not be strongly reachable.
    pub fn referent(&self) -> Option<InstanceRef<'s>> {
        if self.is_instance_of_class("java.lang.ref.Reference") {
            self.ref_field("referent")
        } else {
            None
        }
    }

    /// Shortest path from a gc root to this instance, root first. Empty when unreachable.
    pub fn path_from_gc_root(&self) -> Vec<PathElement<'s>> {
        if !self.is_reachable() {
            return vec![];
        }

        let analysis = self.snapshot.analysis();
        let mut path = vec![];
        let mut dominator = Some(*self);
        let mut current = *self;
        let mut field = String::new();

        loop {
            let is_dominator = dominator.map_or(false, |d| d == current);
            if is_dominator {
                dominator = current.immediate_dominator();
            }
            path.push(PathElement {
                instance: current,
                field,
                is_dominator,
            });

            match analysis.next_to_gc_root(current.index) {
                Some(parent) => {
                    let parent = self.with(parent);
                    field = parent.describe_reference_to(current.index);
                    current = parent;
                }
                None => break,
            }
        }

        path.reverse();
        path
    }

    /// `.name` or `[i]` for the first field or element referring to `target`
    fn describe_reference_to(&self, target: InstanceIndex) -> String {
        let target = Value::Instance(target);
        match &self.inst().kind {
            InstanceKind::ObjectArray(values) => values
                .iter()
                .position(|v| *v == target)
                .map(|i| format!("[{}]", i))
                .unwrap_or_default(),
            _ => self
                .fields()
                .find(|(_, v)| *v == target)
                .map(|(name, _)| format!(".{}", name))
                .unwrap_or_default(),
        }
    }
}

fn decode_chars(
    values: &PrimitiveValues,
    offset: usize,
    count: usize,
    utf16_bytes: bool,
    max_chars: Option<usize>,
) -> Option<String> {
    let limit = max_chars.map_or(count, |m| m.min(count));

    let units: Vec<u16> = match values {
        PrimitiveValues::Char(chars) => chars.iter().skip(offset).take(limit).copied().collect(),
        // UTF-16 in native (little-endian) order
        PrimitiveValues::Byte(bytes) if utf16_bytes => bytes
            .chunks_exact(2)
            .skip(offset)
            .take(limit)
            .map(|pair| u16::from_le_bytes([pair[0] as u8, pair[1] as u8]))
            .collect(),
        // compact latin-1
        PrimitiveValues::Byte(bytes) => bytes
            .iter()
            .skip(offset)
            .take(limit)
            .map(|b| *b as u8 as u16)
            .collect(),
        _ => return None,
    };

    Some(String::from_utf16_lossy(&units))
}

impl<'s> PartialEq for InstanceRef<'s> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && std::ptr::eq(self.snapshot, other.snapshot)
    }
}

impl<'s> Eq for InstanceRef<'s> {}

impl<'s> std::hash::Hash for InstanceRef<'s> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state)
    }
}

impl<'s> fmt::Display for InstanceRef<'s> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = self.class_obj_name() {
            return write!(f, "class {}", name);
        }

        let class_name = self.class_name();
        match self.array_length() {
            Some(len) => {
                // Foo[][] of length 3 reads as Foo[3][]
                let sized = class_name.replacen("[]", &format!("[{}]", len), 1);
                write!(f, "{}@{:08x}", sized, self.id())
            }
            None => write!(f, "{}@{:08x}", class_name, self.id()),
        }
    }
}

impl<'s> fmt::Debug for InstanceRef<'s> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceRef({}, {})", self.index.0, self)
    }
}
