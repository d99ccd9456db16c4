//! An immutable object graph built from a heap dump.
//!
//! Every class object, instance and array in the dump becomes an entry in one arena, addressed
//! by [InstanceIndex]. References between objects are indices, so cyclic graphs need no
//! shared ownership. Dominators, retained sizes and allocation sites are computed on first use
//! and then shared by every query.

use crate::error::{ParseError, UnresolvedReference};
use crate::external_size::{default_models, ExternalSizeModel};
use crate::heap_dump::RootType;
use crate::proguard::ProguardMap;
use crate::{Id, IdSize, Serial};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

mod analysis;
mod instance;
mod parser;
mod site;

use analysis::Analysis;
use instance::InstanceData;

pub use analysis::UnreachableStats;
pub use instance::{InstanceIndex, InstanceRef, NativeAllocation, PathElement, Size, Value};
pub use site::{ObjectsInfo, SiteRef};

#[derive(Debug, Clone, Copy)]
pub(crate) struct Root {
    pub(crate) root_type: RootType,
    pub(crate) instance: InstanceIndex,
}

pub struct Snapshot {
    pub(crate) id_size: IdSize,
    pub(crate) timestamp_millis: u64,
    pub(crate) instances: Vec<InstanceData>,
    pub(crate) index_by_id: HashMap<Id, InstanceIndex>,
    /// Several loaders can define classes with the same name; dump order
    pub(crate) classes_by_name: HashMap<String, Vec<InstanceIndex>>,
    /// In dump order, including repeats
    pub(crate) roots: Vec<Root>,
    pub(crate) root_types: HashMap<InstanceIndex, Vec<RootType>>,
    /// Index 0 is the heap of objects dumped before any heap info record
    pub(crate) heaps: Vec<String>,
    /// Frame descriptions, innermost first
    pub(crate) stack_traces: HashMap<Serial, Vec<String>>,
    pub(crate) external_sizes: Vec<u64>,
    pub(crate) unresolved: Vec<UnresolvedReference>,
    pub(crate) analysis: OnceCell<Analysis>,
}

impl Snapshot {
    /// Builds a snapshot with the default external size models and no proguard map
    pub fn parse(buf: &[u8]) -> Result<Snapshot, ParseError> {
        SnapshotBuilder::new().build(buf)
    }

    pub fn builder() -> SnapshotBuilder {
        SnapshotBuilder::new()
    }

    pub fn id_size(&self) -> IdSize {
        self.id_size
    }

    pub fn timestamp_millis(&self) -> u64 {
        self.timestamp_millis
    }

    pub(crate) fn analysis(&self) -> &Analysis {
        self.analysis.get_or_init(|| Analysis::compute(self))
    }

    /// Computes dominators, retained sizes and sites if that hasn't happened yet.
    ///
    /// Queries that need the results do this on their own; calling it up front just moves the
    /// cost. Concurrent callers wait for the one computation.
    pub fn compute_dominators(&self) {
        self.analysis();
    }

    pub fn is_analyzed(&self) -> bool {
        self.analysis.get().is_some()
    }

    /// Any instance by index, reachable or not
    pub fn get(&self, index: InstanceIndex) -> Option<InstanceRef<'_>> {
        if index.index() < self.instances.len() {
            Some(InstanceRef::new(self, index))
        } else {
            None
        }
    }

    /// Instances in the arena, reachable or not
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// The reachable instance with this id
    pub fn find_instance(&self, id: Id) -> Option<InstanceRef<'_>> {
        self.index_by_id
            .get(&id)
            .map(|i| InstanceRef::new(self, *i))
            .filter(|i| i.is_reachable())
    }

    /// The first reachable class object with this name
    pub fn find_class(&self, name: &str) -> Option<InstanceRef<'_>> {
        self.classes_by_name
            .get(name)?
            .iter()
            .map(|i| InstanceRef::new(self, *i))
            .find(|c| c.is_reachable())
    }

    /// Reachable instances, class objects included, in dump order
    pub fn instances(&self) -> impl Iterator<Item = InstanceRef<'_>> + '_ {
        let reachable = &self.analysis().reachable;
        (0..self.instances.len())
            .filter(move |i| reachable.contains(*i))
            .map(move |i| InstanceRef::new(self, InstanceIndex(i as u32)))
    }

    /// Reachable class objects in dump order
    pub fn classes(&self) -> impl Iterator<Item = InstanceRef<'_>> + '_ {
        self.instances().filter(|i| i.is_class_obj())
    }

    /// Every root record that named an instance in the dump, in dump order
    pub fn roots(&self) -> impl Iterator<Item = (RootType, InstanceRef<'_>)> + '_ {
        self.roots
            .iter()
            .map(move |r| (r.root_type, InstanceRef::new(self, r.instance)))
    }

    /// Instances with no dominator but the virtual super-root
    pub fn rooted(&self) -> impl Iterator<Item = InstanceRef<'_>> + '_ {
        self.analysis()
            .rooted
            .iter()
            .map(move |i| InstanceRef::new(self, *i))
    }

    pub fn root_site(&self) -> SiteRef<'_> {
        SiteRef::new(self, site::ROOT_SITE)
    }

    /// The site `depth` calls above where the instance with `id` was allocated.
    ///
    /// Returns the root site when there's no such reachable instance, and stops at the root
    /// when `depth` is larger than the stack.
    pub fn find_site(&self, id: Id, depth: u32) -> SiteRef<'_> {
        let mut site = match self.find_instance(id).and_then(|i| i.site()) {
            Some(site) => site,
            None => return self.root_site(),
        };

        for _ in 0..depth {
            match site.parent() {
                Some(parent) => site = parent,
                None => break,
            }
        }
        site
    }

    pub fn heaps(&self) -> &[String] {
        &self.heaps
    }

    /// Total size of the reachable instances in a heap
    pub fn heap_size(&self, name: &str) -> Option<Size> {
        let index = self.heaps.iter().position(|h| h == name)?;
        Some(self.analysis().heap_sizes[index])
    }

    /// References to ids that weren't in the dump. Each one was read as null.
    pub fn unresolved_references(&self) -> &[UnresolvedReference] {
        &self.unresolved
    }

    pub fn unreachable_stats(&self) -> UnreachableStats {
        self.analysis().unreachable
    }

    /// Size of everything reachable
    pub fn total_retained(&self) -> Size {
        self.rooted().map(|i| i.retained_size()).sum()
    }

    /// Native allocations registered by reachable cleaner thunks, in dump order
    pub fn native_allocations(&self) -> Vec<NativeAllocation<'_>> {
        self.instances()
            .filter_map(|i| i.native_allocation())
            .collect()
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("id_size", &self.id_size)
            .field("instances", &self.instances.len())
            .field("roots", &self.roots.len())
            .field("heaps", &self.heaps)
            .field("analyzed", &self.is_analyzed())
            .finish()
    }
}

/// Options for building a [Snapshot].
pub struct SnapshotBuilder {
    proguard_map: ProguardMap,
    external_size_models: Vec<Box<dyn ExternalSizeModel>>,
}

impl Default for SnapshotBuilder {
    fn default() -> Self {
        SnapshotBuilder::new()
    }
}

impl SnapshotBuilder {
    pub fn new() -> SnapshotBuilder {
        SnapshotBuilder {
            proguard_map: ProguardMap::default(),
            external_size_models: default_models(),
        }
    }

    pub fn proguard_map(mut self, map: ProguardMap) -> SnapshotBuilder {
        self.proguard_map = map;
        self
    }

    /// Models added earlier take precedence for the same class
    pub fn external_size_model<M: ExternalSizeModel + 'static>(mut self, model: M) -> SnapshotBuilder {
        self.external_size_models.push(Box::new(model));
        self
    }

    /// Drops every model registered so far, the defaults included
    pub fn without_default_models(mut self) -> SnapshotBuilder {
        self.external_size_models.clear();
        self
    }

    pub fn build(&self, buf: &[u8]) -> Result<Snapshot, ParseError> {
        parser::build(buf, &self.proguard_map, &self.external_size_models)
    }

    pub fn build_from_file<P: AsRef<Path>>(&self, path: P) -> Result<Snapshot, ParseError> {
        let buf = fs::read(path)?;
        self.build(&buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap_dump::{FieldType, PrimitiveArrayType};
    use crate::test_dump::{HprofWriter, TestHeap, TestValue};
    use crate::ReferenceContext;
    use itertools::Itertools;
    use rand::{Rng, SeedableRng};
    use rayon::prelude::*;
    use std::collections::HashSet;

    fn node_heap() -> TestHeap {
        let mut h = TestHeap::new();
        h.class("java.lang.Object", None, &[]);
        h.class(
            "com.example.Node",
            Some("java.lang.Object"),
            &[("left", FieldType::ObjectId), ("right", FieldType::ObjectId)],
        );
        h
    }

    fn node(h: &mut TestHeap, left: u64, right: u64) -> u64 {
        h.object("com.example.Node", &[TestValue::Ref(left), TestValue::Ref(right)])
    }

    fn node_at(h: &mut TestHeap, id: u64, left: u64, right: u64) {
        h.object_at(id, "com.example.Node", &[TestValue::Ref(left), TestValue::Ref(right)])
    }

    #[test]
    fn cycle_with_unreachable_object() -> Result<(), anyhow::Error> {
        let mut h = node_heap();
        let a = h.id();
        let b = h.id();
        node_at(&mut h, a, b, 0);
        node_at(&mut h, b, a, 0);
        let c = node(&mut h, a, 0);
        h.root(RootType::JniGlobal, a);
        let buf = h.finish();

        let snapshot = Snapshot::parse(&buf)?;
        let a = snapshot.find_instance(Id::from(a)).unwrap();
        let b = snapshot.find_instance(Id::from(b)).unwrap();

        assert!(snapshot.find_instance(Id::from(c)).is_none());
        assert!(snapshot.instances().all(|i| i.id() != Id::from(c)));

        assert_eq!(8, a.size().java);
        assert_eq!(16, a.retained_size().java);
        assert_eq!(8, b.retained_size().java);
        assert_eq!(Some(a), b.immediate_dominator());
        assert_eq!(None, a.immediate_dominator());
        assert!(a.is_rooted());
        assert_eq!(vec![b], a.dominated().collect_vec());

        let unreachable = snapshot.unreachable_stats();
        assert_eq!(1, unreachable.count);
        assert_eq!(8, unreachable.size.java);

        Ok(())
    }

    #[test]
    fn bitmap_pixels_count_towards_holder() -> Result<(), anyhow::Error> {
        let mut h = TestHeap::new();
        h.class("java.lang.Object", None, &[]);
        h.class(
            "android.graphics.Bitmap",
            Some("java.lang.Object"),
            &[
                ("mWidth", FieldType::Int),
                ("mHeight", FieldType::Int),
                ("mBuffer", FieldType::ObjectId),
            ],
        );
        h.class(
            "com.example.MainActivity",
            Some("java.lang.Object"),
            &[("mBitmap", FieldType::ObjectId)],
        );
        let bitmap = h.object(
            "android.graphics.Bitmap",
            &[TestValue::Int(100), TestValue::Int(50), TestValue::Ref(0)],
        );
        let activity = h.object("com.example.MainActivity", &[TestValue::Ref(bitmap)]);
        h.root(RootType::ThreadObject, activity);
        let buf = h.finish();

        let snapshot = Snapshot::parse(&buf)?;
        let activity = snapshot.find_instance(Id::from(activity)).unwrap();
        let bitmap = activity.ref_field("mBitmap").unwrap();

        assert_eq!(Size::new(12, 100 * 50 * 4), bitmap.size());
        assert_eq!(Size::new(4, 0), activity.size());
        assert_eq!(Size::new(16, 100 * 50 * 4), activity.retained_size());
        // class objects have no size without java.lang.Class or statics
        assert_eq!(activity.retained_size(), snapshot.total_retained());

        Ok(())
    }

    #[test]
    fn truncated_string_record_is_fatal() {
        let mut w = HprofWriter::new(crate::IdSize::U32);
        w.string("java.lang.Object");
        let mut buf = w.finish_without_segment();
        buf.truncate(buf.len() - 4);

        match Snapshot::parse(&buf) {
            Err(ParseError::TruncatedInput { .. }) => {}
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn unknown_sub_record_is_fatal() {
        let mut h = node_heap();
        h.w.raw_sub_record(&[0x42, 0, 0, 0, 1]);
        let buf = h.finish();

        match Snapshot::parse(&buf) {
            Err(ParseError::MalformedRecord { reason, .. }) => {
                assert_eq!("unknown tag 0x42", reason)
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn retained_sizes_on_random_graphs() -> Result<(), anyhow::Error> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);

        for _ in 0..20 {
            let mut h = node_heap();
            let n = rng.gen_range(1..80);
            let ids: Vec<u64> = (0..n).map(|_| h.id()).collect();
            for &id in &ids {
                let mut pick = || {
                    if rng.gen_bool(0.7) {
                        ids[rng.gen_range(0..ids.len())]
                    } else {
                        0
                    }
                };
                let (left, right) = (pick(), pick());
                node_at(&mut h, id, left, right);
            }
            for _ in 0..rng.gen_range(1..4) {
                let root = ids[rng.gen_range(0..ids.len())];
                h.root(RootType::JavaFrame, root);
            }
            let buf = h.finish();

            let snapshot = Snapshot::parse(&buf)?;
            let reachable = snapshot.instances().collect_vec();
            for inst in &reachable {
                assert!(inst.retained_size().total() >= inst.size().total());

                let mut steps = 0;
                let mut current = *inst;
                while let Some(idom) = current.immediate_dominator() {
                    steps += 1;
                    assert!(steps <= reachable.len(), "dominator cycle at {}", inst);
                    current = idom;
                }
                assert!(current.is_rooted());
            }

            let total: Size = reachable.iter().map(|i| i.size()).sum();
            assert_eq!(total, snapshot.total_retained());
        }

        Ok(())
    }

    #[test]
    fn dominators_are_computed_once() -> Result<(), anyhow::Error> {
        let mut h = node_heap();
        let a = node(&mut h, 0, 0);
        h.root(RootType::JniGlobal, a);
        let buf = h.finish();

        let snapshot = Snapshot::parse(&buf)?;
        assert!(!snapshot.is_analyzed());

        snapshot.compute_dominators();
        let first = snapshot.analysis() as *const Analysis;
        snapshot.compute_dominators();
        assert!(snapshot.is_analyzed());
        assert!(std::ptr::eq(first, snapshot.analysis()));

        Ok(())
    }

    fn site_heap() -> (Vec<u8>, Vec<u64>) {
        let mut h = node_heap();
        h.class("com.example.Main", Some("java.lang.Object"), &[]);
        let inner = h.stack(&[
            ("com.example.Main", "inner", "Main.java", 10),
            ("com.example.Main", "main", "Main.java", 3),
        ]);
        let other = h.stack(&[
            ("com.example.Main", "other", "Main.java", 20),
            ("com.example.Main", "main", "Main.java", 3),
        ]);

        h.allocate_at(inner);
        let x = node(&mut h, 0, 0);
        let y = h.object("com.example.Main", &[]);
        h.allocate_at(other);
        let z = node(&mut h, x, 0);
        h.allocate_at(0);
        let holder = node(&mut h, y, z);
        h.root(RootType::JniGlobal, holder);
        (h.finish(), vec![x, y, z, holder])
    }

    #[test]
    fn sites_follow_allocation_stacks() -> Result<(), anyhow::Error> {
        let (buf, ids) = site_heap();
        let snapshot = Snapshot::parse(&buf)?;

        let root = snapshot.root_site();
        assert_eq!("ROOT", root.name());
        assert!(root.parent().is_none());

        let children = root.children().collect_vec();
        assert_eq!(1, children.len());
        let main = children[0];
        assert_eq!("com.example.Main.main - Main.java:3", main.name());
        assert_eq!(
            vec![
                "com.example.Main.inner - Main.java:10",
                "com.example.Main.other - Main.java:20"
            ],
            main.children().map(|s| s.name()).collect_vec()
        );
        assert_eq!(1, main.depth());
        assert_eq!(Id::from(ids[0]), main.id());

        let x = snapshot.find_instance(Id::from(ids[0])).unwrap();
        let inner = x.site().unwrap();
        assert_eq!(Some(main), inner.parent());
        assert_eq!(inner, snapshot.find_site(x.id(), 0));
        assert_eq!(main, snapshot.find_site(x.id(), 1));
        assert_eq!(root, snapshot.find_site(x.id(), 10));
        assert_eq!(root, snapshot.find_site(Id::from(0xBAD), 0));

        // x (8) + y (0) + z (8)
        assert_eq!(Size::new(16, 0), main.size());
        let infos = main.objects_infos();
        assert_eq!(2, infos.len());
        assert_eq!(Some("com.example.Node"), infos[0].class.and_then(|c| c.class_obj_name()));
        assert_eq!(2, infos[0].num_instances);
        assert_eq!(Size::new(16, 0), infos[0].num_bytes);
        assert_eq!("default", infos[0].heap);

        Ok(())
    }

    #[test]
    fn get_objects_visits_every_reachable_instance_once() -> Result<(), anyhow::Error> {
        let (buf, ids) = site_heap();
        let snapshot = Snapshot::parse(&buf)?;

        let mut all = vec![];
        snapshot.root_site().get_objects(None, &mut all);
        assert_eq!(snapshot.instances().count(), all.len());
        assert_eq!(
            snapshot.instances().collect::<HashSet<_>>(),
            all.iter().copied().collect::<HashSet<_>>()
        );

        // own objects, then children in order
        let mut nodes = vec![];
        snapshot
            .root_site()
            .get_objects(Some("com.example.Node"), &mut nodes);
        let node_ids = nodes.iter().map(|n| n.id().id()).collect_vec();
        assert_eq!(vec![ids[3], ids[0], ids[2]], node_ids);

        let mut none = vec![];
        snapshot
            .root_site()
            .get_objects(Some("com.example.Missing"), &mut none);
        assert!(none.is_empty());

        Ok(())
    }

    #[test]
    fn missing_ids_read_as_null() -> Result<(), anyhow::Error> {
        let mut h = node_heap();
        let a = node(&mut h, 0x9990, 0);
        // class that was never dumped
        let orphan = h.id();
        h.w.instance_dump(orphan, 0, 0x7770, &[]);
        h.root(RootType::JniGlobal, a);
        h.root(RootType::JniGlobal, 0x5550);
        let buf = h.finish();

        let snapshot = Snapshot::parse(&buf)?;
        let a = snapshot.find_instance(Id::from(a)).unwrap();
        assert_eq!(Some(Value::Null), a.field("left"));
        assert!(a.ref_field("left").is_none());
        assert!(snapshot.get(InstanceIndex(snapshot.len() as u32)).is_none());

        let unresolved = snapshot.unresolved_references();
        assert!(unresolved.contains(&UnresolvedReference {
            from: Some(a.id()),
            to: Id::from(0x9990),
            context: ReferenceContext::InstanceField,
        }));
        assert!(unresolved.contains(&UnresolvedReference {
            from: Some(Id::from(orphan)),
            to: Id::from(0x7770),
            context: ReferenceContext::InstanceClass,
        }));
        assert!(unresolved.contains(&UnresolvedReference {
            from: None,
            to: Id::from(0x5550),
            context: ReferenceContext::Root,
        }));
        assert!(snapshot.find_instance(Id::from(orphan)).is_none());

        Ok(())
    }

    #[test]
    fn proguard_names_are_restored() -> Result<(), anyhow::Error> {
        let map = ProguardMap::parse(
            "com.example.Widget -> a.b:\n    int count -> a\n    java.lang.Object next -> b\n",
        )?;

        let mut h = TestHeap::new();
        h.class("java.lang.Object", None, &[]);
        h.class(
            "a.b",
            Some("java.lang.Object"),
            &[("a", FieldType::Int), ("b", FieldType::ObjectId)],
        );
        let widget = h.object("a.b", &[TestValue::Int(3), TestValue::Ref(0)]);
        h.root(RootType::JniGlobal, widget);
        let buf = h.finish();

        let snapshot = Snapshot::builder().proguard_map(map).build(&buf)?;
        let class = snapshot.find_class("com.example.Widget").unwrap();
        assert!(snapshot.find_class("a.b").is_none());
        assert_eq!(
            vec![("count", FieldType::Int), ("next", FieldType::ObjectId)],
            class.declared_fields().collect_vec()
        );

        let widget = snapshot.find_instance(Id::from(widget)).unwrap();
        assert_eq!("com.example.Widget", widget.class_name());
        assert_eq!(Some(3), widget.int_field("count"));

        Ok(())
    }

    #[test]
    fn strings() -> Result<(), anyhow::Error> {
        let mut h = TestHeap::new();
        h.class("java.lang.Object", None, &[]);
        h.class("char[]", Some("java.lang.Object"), &[]);
        h.class(
            "java.lang.String",
            Some("java.lang.Object"),
            &[("value", FieldType::ObjectId), ("hash", FieldType::Int)],
        );
        let chars = h.char_array("hello world");
        let s = h.object("java.lang.String", &[TestValue::Ref(chars), TestValue::Int(0)]);
        let not_string = h.object("java.lang.Object", &[]);
        h.root(RootType::InternedString, s);
        h.root(RootType::JniLocal, not_string);
        let buf = h.finish();

        let snapshot = Snapshot::parse(&buf)?;
        let s = snapshot.find_instance(Id::from(s)).unwrap();
        assert_eq!(Some("hello world".to_owned()), s.as_string(None));
        assert_eq!(Some("hello".to_owned()), s.as_string(Some(5)));

        let chars = s.ref_field("value").unwrap();
        assert_eq!("char[]", chars.class_name());
        assert_eq!(Some(11), chars.array_length());
        assert_eq!(Some(Value::Char('w' as u16)), chars.array_value(6));
        assert_eq!(Some("hello".to_owned()), chars.as_string(Some(5)));
        // char[] class has no instance size of its own
        assert_eq!(22, chars.size().java);

        let not_string = snapshot.find_instance(Id::from(not_string)).unwrap();
        assert_eq!(None, not_string.as_string(None));

        Ok(())
    }

    #[test]
    fn referents_are_weak() -> Result<(), anyhow::Error> {
        let mut h = TestHeap::new();
        h.class("java.lang.Object", None, &[]);
        h.class(
            "java.lang.ref.Reference",
            Some("java.lang.Object"),
            &[("referent", FieldType::ObjectId)],
        );
        h.class(
            "java.lang.ref.WeakReference",
            Some("java.lang.ref.Reference"),
            &[],
        );
        let target = h.object("java.lang.Object", &[]);
        let weak = h.object("java.lang.ref.WeakReference", &[TestValue::Ref(target)]);
        h.root(RootType::JniGlobal, weak);
        let buf = h.finish();

        let snapshot = Snapshot::parse(&buf)?;
        let weak = snapshot.find_instance(Id::from(weak)).unwrap();
        let referent = weak.referent().unwrap();

        assert_eq!(Id::from(target), referent.id());
        assert!(!referent.is_reachable());
        assert!(snapshot.find_instance(Id::from(target)).is_none());
        assert_eq!(weak.size(), weak.retained_size());

        Ok(())
    }

    #[test]
    fn path_from_gc_root_through_a_diamond() -> Result<(), anyhow::Error> {
        //    r
        //   / \
        //  a   b
        //   \ /
        //    d
        //    |
        //    e
        let mut h = node_heap();
        let e = node(&mut h, 0, 0);
        let d = node(&mut h, e, 0);
        let a = node(&mut h, d, 0);
        let b = node(&mut h, 0, d);
        let r = node(&mut h, a, b);
        h.root(RootType::JavaFrame, r);
        let buf = h.finish();

        let snapshot = Snapshot::parse(&buf)?;
        let e = snapshot.find_instance(Id::from(e)).unwrap();
        let path = e.path_from_gc_root();

        assert_eq!(
            vec![r, a, d, e.id().id()],
            path.iter().map(|p| p.instance.id().id()).collect_vec()
        );
        assert_eq!(
            vec![".left", ".left", ".left", ""],
            path.iter().map(|p| p.field.as_str()).collect_vec()
        );
        assert_eq!(
            vec![true, false, true, true],
            path.iter().map(|p| p.is_dominator).collect_vec()
        );

        let b = snapshot.find_instance(Id::from(b)).unwrap();
        assert_eq!(
            vec![".right", ""],
            b.path_from_gc_root()
                .iter()
                .map(|p| p.field.as_str())
                .collect_vec()
        );

        Ok(())
    }

    #[test]
    fn array_paths_name_the_element() -> Result<(), anyhow::Error> {
        let mut h = node_heap();
        h.class("com.example.Node[]", Some("java.lang.Object"), &[]);
        let leaf = node(&mut h, 0, 0);
        let array = h.object_array("com.example.Node[]", &[0, 0, leaf]);
        h.root(RootType::JniGlobal, array);
        let buf = h.finish();

        let snapshot = Snapshot::parse(&buf)?;
        let leaf = snapshot.find_instance(Id::from(leaf)).unwrap();
        let path = leaf.path_from_gc_root();
        assert_eq!("[2]", path[0].field);

        let array = path[0].instance;
        assert_eq!(12, array.size().java);
        assert_eq!(
            vec![Value::Null, Value::Null, Value::Instance(leaf.index())],
            array.array_values().collect_vec()
        );
        assert_eq!(format!("com.example.Node[3]@{:08x}", array.id()), array.to_string());

        Ok(())
    }

    #[test]
    fn concurrent_queries_agree() -> Result<(), anyhow::Error> {
        let mut h = node_heap();
        let mut previous = 0;
        for _ in 0..500 {
            previous = node(&mut h, previous, 0);
        }
        h.root(RootType::JniGlobal, previous);
        let buf = h.finish();

        let snapshot = Snapshot::parse(&buf)?;
        let totals: Vec<(usize, u64)> = (0..8)
            .into_par_iter()
            .map(|_| {
                let retained = snapshot.instances().map(|i| i.retained_size().total()).sum();
                (snapshot.instances().count(), retained)
            })
            .collect();

        assert!(totals.iter().all_equal());
        let last = snapshot.find_instance(Id::from(previous)).unwrap();
        assert_eq!(Size::new(500 * 8, 0), last.retained_size());

        Ok(())
    }

    #[test]
    fn internal_class_names_are_normalized() -> Result<(), anyhow::Error> {
        let mut h = TestHeap::new();
        h.class("java/lang/Object", None, &[]);
        h.class("[I", Some("java/lang/Object"), &[]);
        h.class("[[Ljava/lang/String;", Some("java/lang/Object"), &[]);
        let ints = h.primitive_array(PrimitiveArrayType::Int, &[0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3]);
        h.root(RootType::JniGlobal, ints);
        let buf = h.finish();

        let snapshot = Snapshot::parse(&buf)?;
        assert!(snapshot.find_class("java.lang.Object").is_some());
        assert!(snapshot.find_class("java.lang.String[][]").is_some());

        let ints = snapshot.find_instance(Id::from(ints)).unwrap();
        assert_eq!("int[]", ints.class_name());
        assert_eq!(
            Some("int[]"),
            ints.class_obj().and_then(|c| c.class_obj_name())
        );
        assert_eq!(12, ints.size().java);
        assert_eq!(
            vec![Value::Int(1), Value::Int(2), Value::Int(3)],
            ints.array_values().collect_vec()
        );

        Ok(())
    }

    #[test]
    fn objects_are_grouped_by_heap() -> Result<(), anyhow::Error> {
        let mut h = node_heap();
        h.heap(0x41, "app");
        let a = node(&mut h, 0, 0);
        h.heap(0x5A, "zygote");
        let z = node(&mut h, 0, 0);
        h.heap(0x41, "app");
        let b = node(&mut h, 0, 0);
        for id in &[a, z, b] {
            h.root(RootType::JniGlobal, *id);
        }
        let buf = h.finish();

        let snapshot = Snapshot::parse(&buf)?;
        assert_eq!(&["default", "app", "zygote"], snapshot.heaps());

        let heap_of = |id| snapshot.find_instance(Id::from(id)).unwrap().heap_name();
        assert_eq!("app", heap_of(a));
        assert_eq!("zygote", heap_of(z));
        assert_eq!("app", heap_of(b));
        assert_eq!(
            "default",
            snapshot.find_class("com.example.Node").unwrap().heap_name()
        );
        assert_eq!(Some(Size::new(16, 0)), snapshot.heap_size("app"));
        assert_eq!(None, snapshot.heap_size("image"));

        Ok(())
    }

    #[test]
    fn shadowed_fields_are_ambiguous() -> Result<(), anyhow::Error> {
        let mut h = TestHeap::new();
        h.class("java.lang.Object", None, &[]);
        h.class(
            "com.example.Base",
            Some("java.lang.Object"),
            &[("x", FieldType::Int), ("y", FieldType::Long)],
        );
        h.class(
            "com.example.Sub",
            Some("com.example.Base"),
            &[("x", FieldType::Int)],
        );
        let sub = h.object(
            "com.example.Sub",
            &[TestValue::Int(1), TestValue::Int(2), TestValue::Long(-5)],
        );
        h.root(RootType::JniGlobal, sub);
        let buf = h.finish();

        let snapshot = Snapshot::parse(&buf)?;
        let sub = snapshot.find_instance(Id::from(sub)).unwrap();

        assert_eq!(None, sub.field("x"));
        assert_eq!(Some(-5), sub.long_field("y"));
        assert_eq!(
            vec![("x", Value::Int(1)), ("x", Value::Int(2)), ("y", Value::Long(-5))],
            sub.fields().collect_vec()
        );
        assert!(sub.is_instance_of_class("com.example.Base"));
        assert!(!sub.is_instance_of_class("com.example.Other"));

        Ok(())
    }

    #[test]
    fn roots_keep_every_kind() -> Result<(), anyhow::Error> {
        let mut h = node_heap();
        let a = node(&mut h, 0, 0);
        h.root(RootType::JniGlobal, a);
        h.root(RootType::ThreadObject, a);
        h.root(RootType::JniGlobal, a);
        let buf = h.finish();

        let snapshot = Snapshot::parse(&buf)?;
        let a = snapshot.find_instance(Id::from(a)).unwrap();
        assert!(a.is_root());
        assert_eq!(&[RootType::JniGlobal, RootType::ThreadObject], a.root_types());
        assert_eq!(3, snapshot.roots().filter(|(_, i)| *i == a).count());
        assert!(snapshot.rooted().any(|i| i == a));

        let class = snapshot.find_class("com.example.Node").unwrap();
        assert_eq!(&[RootType::StickyClass], class.root_types());
        assert_eq!("class com.example.Node", class.to_string());

        Ok(())
    }

    #[test]
    fn statics_hold_references() -> Result<(), anyhow::Error> {
        let mut h = node_heap();
        let held = node(&mut h, 0, 0);
        h.class_with_statics(
            "com.example.Registry",
            Some("java.lang.Object"),
            &[],
            &[("INSTANCE", TestValue::Ref(held)), ("COUNT", TestValue::Int(9))],
        );
        let buf = h.finish();

        let snapshot = Snapshot::parse(&buf)?;
        let registry = snapshot.find_class("com.example.Registry").unwrap();
        let held = snapshot.find_instance(Id::from(held)).unwrap();

        assert_eq!(Some(held), registry.ref_field("INSTANCE"));
        assert_eq!(Some(9), registry.int_field("COUNT"));
        assert_eq!(Some(registry), held.immediate_dominator());
        // no java.lang.Class in the dump, so only the static values count
        assert_eq!(8, registry.size().java);
        assert_eq!(16, registry.retained_size().java);
        assert_eq!("java.lang.Class", registry.class_name());
        assert_eq!(
            Some("java.lang.Object"),
            registry.super_class().and_then(|s| s.class_obj_name())
        );

        Ok(())
    }

    #[test]
    fn eight_byte_ids() -> Result<(), anyhow::Error> {
        let mut h = TestHeap::with_id_size(crate::IdSize::U64);
        h.class("java.lang.Object", None, &[]);
        h.class(
            "com.example.Node",
            Some("java.lang.Object"),
            &[("next", FieldType::ObjectId), ("n", FieldType::Long)],
        );
        let b = h.object("com.example.Node", &[TestValue::Ref(0), TestValue::Long(2)]);
        let a = h.object("com.example.Node", &[TestValue::Ref(b), TestValue::Long(1)]);
        h.root(RootType::JniGlobal, a);
        let buf = h.finish();

        let snapshot = Snapshot::parse(&buf)?;
        assert_eq!(crate::IdSize::U64, snapshot.id_size());
        let a = snapshot.find_instance(Id::from(a)).unwrap();
        assert_eq!(Some(2), a.ref_field("next").and_then(|b| b.long_field("n")));
        assert_eq!(32, a.retained_size().java);

        Ok(())
    }

    fn unknown_record_heap(extra_record: bool) -> Vec<u8> {
        let mut h = node_heap();
        let c = node(&mut h, 0, 0);
        let b = node(&mut h, c, 0);
        let a = node(&mut h, b, c);
        h.root(RootType::JniGlobal, a);
        if extra_record {
            h.w.raw_record(0x42, &[1, 2, 3]);
        }
        h.finish()
    }

    #[test]
    fn unknown_records_between_strings_and_heap_dump() -> Result<(), anyhow::Error> {
        let plain = unknown_record_heap(false);
        let with_unknown = unknown_record_heap(true);
        assert_ne!(plain, with_unknown);

        let plain = Snapshot::parse(&plain)?;
        let with_unknown = Snapshot::parse(&with_unknown)?;

        assert_eq!(plain.len(), with_unknown.len());
        let summary = |s: &Snapshot| {
            s.instances()
                .map(|i| {
                    (
                        i.id(),
                        i.retained_size(),
                        i.immediate_dominator().map(|d| d.id()),
                    )
                })
                .collect_vec()
        };
        assert_eq!(summary(&plain), summary(&with_unknown));
        assert_eq!(plain.total_retained(), with_unknown.total_retained());

        Ok(())
    }

    #[test]
    fn class_dump_behind_an_object_id_is_not_a_class() -> Result<(), anyhow::Error> {
        let mut h = node_heap();
        let x = node(&mut h, 0, 0);
        let count = h.w.string("count");
        h.w
            .class_dump_full(x, None, None, 4, &[], &[], &[(count, FieldType::Int)]);
        let y = h.id();
        h.w.instance_dump(y, 0, x, &[TestValue::Int(1)]);
        h.root(RootType::JniGlobal, x);
        h.root(RootType::JniGlobal, y);
        let buf = h.finish();

        let snapshot = Snapshot::parse(&buf)?;

        assert!(snapshot.find_instance(Id::from(y)).is_none());
        assert!(snapshot
            .unresolved_references()
            .contains(&UnresolvedReference {
                from: Some(Id::from(y)),
                to: Id::from(x),
                context: ReferenceContext::InstanceClass,
            }));
        assert!(snapshot.find_class(&format!("class@{:#x}", x)).is_none());
        let x = snapshot.find_instance(Id::from(x)).unwrap();
        assert_eq!("com.example.Node", x.class_name());

        Ok(())
    }

    #[test]
    fn retained_sizes_split_by_heap() -> Result<(), anyhow::Error> {
        let mut h = node_heap();
        h.heap(0x5A, "zygote");
        let z = node(&mut h, 0, 0);
        h.heap(0x41, "app");
        let holder = node(&mut h, z, 0);
        h.root(RootType::JniGlobal, holder);
        let buf = h.finish();

        let snapshot = Snapshot::parse(&buf)?;
        let holder = snapshot.find_instance(Id::from(holder)).unwrap();

        assert_eq!(Size::new(16, 0), holder.retained_size());
        assert_eq!(Size::new(8, 0), holder.retained_size_in_heap("app"));
        assert_eq!(Size::new(8, 0), holder.retained_size_in_heap("zygote"));
        assert_eq!(Size::ZERO, holder.retained_size_in_heap("default"));
        assert_eq!(Size::ZERO, holder.retained_size_in_heap("image"));

        let total: Size = snapshot
            .heaps()
            .iter()
            .map(|heap| holder.retained_size_in_heap(heap))
            .sum();
        assert_eq!(holder.retained_size(), total);

        Ok(())
    }

    #[test]
    fn reverse_references_hard_and_soft() -> Result<(), anyhow::Error> {
        let mut h = node_heap();
        h.class(
            "java.lang.ref.Reference",
            Some("java.lang.Object"),
            &[("referent", FieldType::ObjectId)],
        );
        h.class(
            "java.lang.ref.WeakReference",
            Some("java.lang.ref.Reference"),
            &[],
        );
        let c = node(&mut h, 0, 0);
        let a = node(&mut h, c, c);
        let b = node(&mut h, 0, c);
        let w = h.object("java.lang.ref.WeakReference", &[TestValue::Ref(c)]);
        let unreachable = node(&mut h, c, 0);
        for id in &[a, b, w] {
            h.root(RootType::JniGlobal, *id);
        }
        let buf = h.finish();

        let snapshot = Snapshot::parse(&buf)?;
        let c = snapshot.find_instance(Id::from(c)).unwrap();

        // a refers to c twice but is listed once; the unreachable node isn't listed
        assert_eq!(
            vec![Id::from(a), Id::from(b)],
            c.hard_reverse_references().map(|r| r.id()).collect_vec()
        );
        assert_eq!(
            vec![Id::from(w)],
            c.soft_reverse_references().map(|r| r.id()).collect_vec()
        );

        let a = snapshot.find_instance(Id::from(a)).unwrap();
        assert_eq!(0, a.hard_reverse_references().count());
        assert_eq!(0, a.soft_reverse_references().count());
        assert!(snapshot.find_instance(Id::from(unreachable)).is_none());

        Ok(())
    }

    fn native_allocation_heap() -> (Vec<u8>, u64, u64) {
        let mut h = TestHeap::new();
        h.class("java.lang.Object", None, &[]);
        h.class(
            "libcore.util.NativeAllocationRegistry",
            Some("java.lang.Object"),
            &[("size", FieldType::Long)],
        );
        h.class(
            "libcore.util.NativeAllocationRegistry$CleanerThunk",
            Some("java.lang.Object"),
            &[("nativePtr", FieldType::Long), ("this$0", FieldType::ObjectId)],
        );
        h.class(
            "java.lang.ref.Reference",
            Some("java.lang.Object"),
            &[("referent", FieldType::ObjectId)],
        );
        h.class(
            "sun.misc.Cleaner",
            Some("java.lang.ref.Reference"),
            &[("thunk", FieldType::ObjectId)],
        );
        h.class("com.example.Owner", Some("java.lang.Object"), &[]);

        let registry = h.object(
            "libcore.util.NativeAllocationRegistry",
            &[TestValue::Long(1000)],
        );
        let thunk = h.object(
            "libcore.util.NativeAllocationRegistry$CleanerThunk",
            &[TestValue::Long(0x1234), TestValue::Ref(registry)],
        );
        let owner = h.object("com.example.Owner", &[]);
        // the cleaner's own field comes ahead of the inherited referent
        let cleaner = h.object(
            "sun.misc.Cleaner",
            &[TestValue::Ref(thunk), TestValue::Ref(owner)],
        );
        h.root(RootType::JniGlobal, owner);
        h.root(RootType::JniGlobal, cleaner);
        (h.finish(), thunk, owner)
    }

    #[test]
    fn native_allocations_from_cleaner_thunks() -> Result<(), anyhow::Error> {
        let (buf, thunk, owner) = native_allocation_heap();
        let snapshot = Snapshot::parse(&buf)?;

        let natives = snapshot.native_allocations();
        assert_eq!(1, natives.len());
        let native = natives[0];
        assert_eq!(1000, native.size);
        assert_eq!(0x1234, native.pointer);
        assert_eq!("default", native.heap);
        assert_eq!(Id::from(owner), native.referent.id());

        // the size is only charged when the model is registered
        let thunk = Id::from(thunk);
        assert_eq!(0, snapshot.find_instance(thunk).unwrap().size().external);
        let charged = Snapshot::builder()
            .external_size_model(crate::NativeAllocationModel::new())
            .build(&buf)?;
        assert_eq!(1000, charged.find_instance(thunk).unwrap().size().external);

        Ok(())
    }
}
