//! Allocation sites: reachable instances grouped by the stack they were allocated at.

use crate::snapshot::instance::{InstanceIndex, InstanceRef, Size};
use crate::snapshot::Snapshot;
use crate::Id;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SiteIndex(u32);

pub(crate) const ROOT_SITE: SiteIndex = SiteIndex(0);

#[derive(Debug, Clone, Copy)]
struct InfoEntry {
    heap: u16,
    class: Option<InstanceIndex>,
    num_instances: u64,
    num_bytes: Size,
}

#[derive(Debug)]
struct Site {
    /// Frame description, unique among siblings
    name: String,
    parent: Option<SiteIndex>,
    children: Vec<SiteIndex>,
    child_by_name: HashMap<String, SiteIndex>,
    /// Allocated exactly here, in dump order
    objects: Vec<InstanceIndex>,
    /// Everything at or below this site, by heap index
    sizes_by_heap: Vec<Size>,
    infos: Vec<InfoEntry>,
    info_by_key: HashMap<(u16, Option<InstanceIndex>), usize>,
    /// An object allocated at or below this site, and how many frames below it that was
    id: Id,
    depth: u32,
}

impl Site {
    fn new(parent: Option<SiteIndex>, name: &str, id: Id, depth: u32) -> Site {
        Site {
            name: name.to_owned(),
            parent,
            children: vec![],
            child_by_name: HashMap::new(),
            objects: vec![],
            sizes_by_heap: vec![],
            infos: vec![],
            info_by_key: HashMap::new(),
            id,
            depth,
        }
    }

    fn count(&mut self, heap: u16, class: Option<InstanceIndex>, size: Size) {
        let heap_index = heap as usize;
        if self.sizes_by_heap.len() <= heap_index {
            self.sizes_by_heap.resize(heap_index + 1, Size::ZERO);
        }
        self.sizes_by_heap[heap_index] += size;

        let infos = &mut self.infos;
        let slot = *self.info_by_key.entry((heap, class)).or_insert_with(|| {
            infos.push(InfoEntry {
                heap,
                class,
                num_instances: 0,
                num_bytes: Size::ZERO,
            });
            infos.len() - 1
        });
        let info = &mut self.infos[slot];
        info.num_instances += 1;
        info.num_bytes += size;
    }
}

/// Reachable instances grouped by allocation stack
#[derive(Debug)]
pub(crate) struct SiteTree {
    sites: Vec<Site>,
}

impl SiteTree {
    pub(crate) fn new() -> SiteTree {
        SiteTree {
            sites: vec![Site::new(None, "ROOT", Id::from(0), 0)],
        }
    }

    fn site(&self, index: SiteIndex) -> &Site {
        &self.sites[index.0 as usize]
    }

    /// Adds an instance at the site reached by following `frames` from the root, outermost
    /// frame first. `frames` is innermost first, the way stack traces are stored.
    pub(crate) fn add(
        &mut self,
        frames: &[String],
        instance: InstanceIndex,
        id: Id,
        heap: u16,
        class: Option<InstanceIndex>,
        size: Size,
    ) -> SiteIndex {
        let mut current = ROOT_SITE;
        let mut remaining = frames.len();

        loop {
            self.sites[current.0 as usize].count(heap, class, size);
            if remaining == 0 {
                self.sites[current.0 as usize].objects.push(instance);
                return current;
            }

            remaining -= 1;
            let name = &frames[remaining];
            let existing = self.site(current).child_by_name.get(name).copied();
            current = match existing {
                Some(child) => child,
                None => {
                    let child = SiteIndex(self.sites.len() as u32);
                    self.sites
                        .push(Site::new(Some(current), name, id, remaining as u32));
                    let parent = &mut self.sites[current.0 as usize];
                    parent.children.push(child);
                    parent.child_by_name.insert(name.clone(), child);
                    child
                }
            };
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.sites.len()
    }
}

/// Instances of one class in one heap, counted at or below a site
#[derive(Debug, Clone, Copy)]
pub struct ObjectsInfo<'s> {
    pub heap: &'s str,
    /// `None` for primitive arrays whose array class isn't in the dump
    pub class: Option<InstanceRef<'s>>,
    pub num_instances: u64,
    pub num_bytes: Size,
}

/// A node in the allocation site tree
#[derive(Clone, Copy)]
pub struct SiteRef<'s> {
    snapshot: &'s Snapshot,
    index: SiteIndex,
}

impl<'s> SiteRef<'s> {
    pub(crate) fn new(snapshot: &'s Snapshot, index: SiteIndex) -> SiteRef<'s> {
        SiteRef { snapshot, index }
    }

    fn site(&self) -> &'s Site {
        self.snapshot.analysis().sites.site(self.index)
    }

    fn with(&self, index: SiteIndex) -> SiteRef<'s> {
        SiteRef::new(self.snapshot, index)
    }

    /// `ROOT` for the root, otherwise `<class>.<method> - <file>:<line>`
    pub fn name(&self) -> &'s str {
        &self.site().name
    }

    pub fn parent(&self) -> Option<SiteRef<'s>> {
        self.site().parent.map(|p| self.with(p))
    }

    /// In the order they were first allocated at
    pub fn children(&self) -> impl Iterator<Item = SiteRef<'s>> + 's {
        let this = *self;
        self.site().children.iter().map(move |c| this.with(*c))
    }

    pub fn child(&self, name: &str) -> Option<SiteRef<'s>> {
        self.site().child_by_name.get(name).map(|c| self.with(*c))
    }

    /// Id of some object allocated at or below this site; 0 for the root
    pub fn id(&self) -> Id {
        self.site().id
    }

    /// Frames between this site and where the object with `id()` was allocated
    pub fn depth(&self) -> u32 {
        self.site().depth
    }

    /// Size of every instance allocated at or below this site
    pub fn size(&self) -> Size {
        self.site().sizes_by_heap.iter().copied().sum()
    }

    pub fn size_in_heap(&self, heap: &str) -> Size {
        self.snapshot
            .heaps
            .iter()
            .position(|h| h == heap)
            .and_then(|i| self.site().sizes_by_heap.get(i).copied())
            .unwrap_or(Size::ZERO)
    }

    /// Per heap and class, in the order first seen
    pub fn objects_infos(&self) -> Vec<ObjectsInfo<'s>> {
        let snapshot = self.snapshot;
        self.site()
            .infos
            .iter()
            .map(|info| ObjectsInfo {
                heap: &snapshot.heaps[info.heap as usize],
                class: info.class.map(|c| InstanceRef::new(snapshot, c)),
                num_instances: info.num_instances,
                num_bytes: info.num_bytes,
            })
            .collect()
    }

    /// Appends the instances allocated at or below this site whose class is exactly
    /// `class_name` (any class for `None`).
    ///
    /// A site's own instances come before its children's; children are visited in order.
    pub fn get_objects(&self, class_name: Option<&str>, out: &mut Vec<InstanceRef<'s>>) {
        let tree = &self.snapshot.analysis().sites;
        let mut stack = vec![self.index];

        while let Some(index) = stack.pop() {
            let site = tree.site(index);
            out.extend(
                site.objects
                    .iter()
                    .map(|i| InstanceRef::new(self.snapshot, *i))
                    .filter(|i| class_name.map_or(true, |name| i.class_name() == name)),
            );
            stack.extend(site.children.iter().rev());
        }
    }
}

impl<'s> PartialEq for SiteRef<'s> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && std::ptr::eq(self.snapshot, other.snapshot)
    }
}

impl<'s> Eq for SiteRef<'s> {}

impl<'s> fmt::Debug for SiteRef<'s> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SiteRef({}, {:?})", self.index.0, self.name())
    }
}
