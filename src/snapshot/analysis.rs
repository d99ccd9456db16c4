use crate::dominator::{DominatorTree, ReferenceGraph, ROOT};
use crate::snapshot::instance::{InstanceIndex, InstanceKind, InstanceRef, Size, Value};
use crate::snapshot::site::{SiteIndex, SiteTree};
use crate::snapshot::Snapshot;
use fixedbitset::FixedBitSet;
use std::collections::VecDeque;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dominator {
    SuperRoot,
    Instance(InstanceIndex),
    Unreachable,
}

/// Instances no gc root leads to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnreachableStats {
    pub count: usize,
    pub size: Size,
}

/// Per-instance lists in one buffer: instance i's are `items[offsets[i]..offsets[i + 1]]`
#[derive(Debug)]
struct IndexLists {
    offsets: Vec<usize>,
    items: Vec<InstanceIndex>,
}

impl IndexLists {
    /// Groups `(owner, item)` pairs by owner, keeping their order within an owner
    fn from_pairs(n: usize, pairs: &[(InstanceIndex, InstanceIndex)]) -> IndexLists {
        let mut offsets = vec![0_usize; n + 1];
        for (owner, _) in pairs {
            offsets[owner.index() + 1] += 1;
        }
        for i in 1..=n {
            offsets[i] += offsets[i - 1];
        }

        let mut items = vec![InstanceIndex(0); pairs.len()];
        let mut next = offsets.clone();
        for (owner, item) in pairs {
            let slot = &mut next[owner.index()];
            items[*slot] = *item;
            *slot += 1;
        }

        IndexLists { offsets, items }
    }

    fn get(&self, index: InstanceIndex) -> &[InstanceIndex] {
        let i = index.index();
        &self.items[self.offsets[i]..self.offsets[i + 1]]
    }
}

/// Everything derived from the reference graph
pub(crate) struct Analysis {
    pub(crate) reachable: FixedBitSet,
    pub(crate) idom: Vec<Dominator>,
    pub(crate) retained: Vec<Size>,
    heap_count: usize,
    /// Retained size of instance i in heap h is `retained_by_heap[i * heap_count + h]`
    retained_by_heap: Vec<Size>,
    dominated: IndexLists,
    /// Reachable instances referring to each instance, in dump order
    hard_referrers: IndexLists,
    /// Reachable references whose referent is each instance
    soft_referrers: IndexLists,
    pub(crate) rooted: Vec<InstanceIndex>,
    /// Parent on a shortest path from a gc root; `None` for roots and unreachable instances
    next_to_gc_root: Vec<Option<InstanceIndex>>,
    pub(crate) sites: SiteTree,
    site_of: Vec<Option<SiteIndex>>,
    pub(crate) heap_sizes: Vec<Size>,
    pub(crate) unreachable: UnreachableStats,
}

impl Analysis {
    pub(crate) fn compute(snapshot: &Snapshot) -> Analysis {
        let start = Instant::now();
        let n = snapshot.instances.len();

        let graph = reference_graph(snapshot);
        let tree = DominatorTree::from_graph(&graph);

        let mut reachable = FixedBitSet::with_capacity(n);
        for &node in tree.postorder() {
            reachable.insert(InstanceIndex::from_node(node).index());
        }

        let idom: Vec<Dominator> = (0..n)
            .map(|i| match tree.idom(InstanceIndex(i as u32).node()) {
                Some(ROOT) => Dominator::SuperRoot,
                Some(d) => Dominator::Instance(InstanceIndex::from_node(d)),
                None => Dominator::Unreachable,
            })
            .collect();

        let sizes: Vec<Size> = (0..n)
            .map(|i| InstanceRef::new(snapshot, InstanceIndex(i as u32)).size())
            .collect();

        // postorder has every instance ahead of its dominator, so each retained size is final
        // by the time it's added upwards
        let heap_count = snapshot.heaps.len();
        let mut retained = vec![Size::ZERO; n];
        let mut retained_by_heap = vec![Size::ZERO; n * heap_count];
        for &node in tree.postorder() {
            let i = InstanceIndex::from_node(node).index();
            retained[i] += sizes[i];
            retained_by_heap[i * heap_count + snapshot.instances[i].heap as usize] += sizes[i];
            if let Dominator::Instance(d) = idom[i] {
                let d = d.index();
                let own = retained[i];
                retained[d] += own;
                for h in 0..heap_count {
                    let own = retained_by_heap[i * heap_count + h];
                    retained_by_heap[d * heap_count + h] += own;
                }
            }
        }

        let dominated = dominated_lists(&idom);
        let hard_referrers = hard_referrers(&graph, &reachable);
        let soft_referrers = soft_referrers(snapshot, &reachable);
        let rooted: Vec<InstanceIndex> = (0..n)
            .filter(|i| idom[*i] == Dominator::SuperRoot)
            .map(|i| InstanceIndex(i as u32))
            .collect();

        let next_to_gc_root = shortest_paths(&graph, n);

        let mut sites = SiteTree::new();
        let mut site_of = vec![None; n];
        let mut heap_sizes = vec![Size::ZERO; snapshot.heaps.len()];
        let mut unreachable = UnreachableStats::default();
        for (i, inst) in snapshot.instances.iter().enumerate() {
            if !reachable.contains(i) {
                unreachable.count += 1;
                unreachable.size += sizes[i];
                continue;
            }

            heap_sizes[inst.heap as usize] += sizes[i];
            let frames = snapshot
                .stack_traces
                .get(&inst.stack_trace_serial)
                .map(|f| f.as_slice())
                .unwrap_or(&[]);
            site_of[i] = Some(sites.add(
                frames,
                InstanceIndex(i as u32),
                inst.id,
                inst.heap,
                inst.class,
                sizes[i],
            ));
        }

        log::info!(
            "Analyzed {} instances ({} reachable, {} edges, {} sites) in {:?}",
            n,
            tree.postorder().len(),
            graph.edge_count(),
            sites.len(),
            start.elapsed()
        );
        if unreachable.count > 0 {
            log::debug!(
                "{} unreachable instances using {} bytes",
                unreachable.count,
                unreachable.size
            );
        }

        Analysis {
            reachable,
            idom,
            retained,
            heap_count,
            retained_by_heap,
            dominated,
            hard_referrers,
            soft_referrers,
            rooted,
            next_to_gc_root,
            sites,
            site_of,
            heap_sizes,
            unreachable,
        }
    }

    pub(crate) fn dominated(&self, index: InstanceIndex) -> &[InstanceIndex] {
        self.dominated.get(index)
    }

    pub(crate) fn retained_in_heap(&self, index: InstanceIndex, heap: usize) -> Size {
        self.retained_by_heap
            .get(index.index() * self.heap_count + heap)
            .copied()
            .unwrap_or(Size::ZERO)
    }

    pub(crate) fn hard_referrers(&self, index: InstanceIndex) -> &[InstanceIndex] {
        self.hard_referrers.get(index)
    }

    pub(crate) fn soft_referrers(&self, index: InstanceIndex) -> &[InstanceIndex] {
        self.soft_referrers.get(index)
    }

    pub(crate) fn next_to_gc_root(&self, index: InstanceIndex) -> Option<InstanceIndex> {
        self.next_to_gc_root[index.index()]
    }

    pub(crate) fn site_of(&self, index: InstanceIndex) -> Option<SiteIndex> {
        self.site_of[index.index()]
    }
}

/// Node 0 points at each distinct root instance in root order; instance i is node i + 1.
fn reference_graph(snapshot: &Snapshot) -> ReferenceGraph {
    let n = snapshot.instances.len();
    let mut graph = ReferenceGraph::with_capacity(n + 1, n * 2);

    let mut seen = FixedBitSet::with_capacity(n);
    graph.push_node(snapshot.roots.iter().filter_map(|r| {
        if seen.put(r.instance.index()) {
            None
        } else {
            Some(r.instance.node())
        }
    }));

    let mut references = vec![];
    for inst in &snapshot.instances {
        let weak_field = match inst.kind {
            InstanceKind::Object(_) => inst
                .class
                .and_then(|c| snapshot.instances[c.index()].as_class())
                .and_then(|c| c.weak_field),
            _ => None,
        };

        references.clear();
        inst.collect_references(weak_field, &mut references);
        graph.push_node(references.iter().map(|r| r.node()));
    }

    graph
}

fn dominated_lists(idom: &[Dominator]) -> IndexLists {
    let pairs: Vec<_> = idom
        .iter()
        .enumerate()
        .filter_map(|(i, d)| match d {
            Dominator::Instance(d) => Some((*d, InstanceIndex(i as u32))),
            _ => None,
        })
        .collect();
    IndexLists::from_pairs(idom.len(), &pairs)
}

/// Each referrer is listed once per target, however many of its fields point there
fn hard_referrers(graph: &ReferenceGraph, reachable: &FixedBitSet) -> IndexLists {
    let n = graph.node_count() - 1;
    let mut last_referrer = vec![u32::MAX; n];
    let mut pairs = Vec::with_capacity(graph.edge_count());

    for i in reachable.ones() {
        let from = InstanceIndex(i as u32);
        for &succ in graph.successors(from.node()) {
            let to = InstanceIndex::from_node(succ);
            if last_referrer[to.index()] != from.0 {
                last_referrer[to.index()] = from.0;
                pairs.push((to, from));
            }
        }
    }

    IndexLists::from_pairs(n, &pairs)
}

/// Referents are left out of the graph, so they are collected from the weak slots directly
fn soft_referrers(snapshot: &Snapshot, reachable: &FixedBitSet) -> IndexLists {
    let mut pairs = vec![];
    for i in reachable.ones() {
        let inst = &snapshot.instances[i];
        let values = match &inst.kind {
            InstanceKind::Object(values) => values,
            _ => continue,
        };
        let weak_field = inst
            .class
            .and_then(|c| snapshot.instances[c.index()].as_class())
            .and_then(|c| c.weak_field);

        if let Some(Value::Instance(referent)) = weak_field.and_then(|w| values.get(w)) {
            pairs.push((*referent, InstanceIndex(i as u32)));
        }
    }

    IndexLists::from_pairs(snapshot.instances.len(), &pairs)
}

/// Breadth-first from the roots, so following parents gives a shortest path
fn shortest_paths(graph: &ReferenceGraph, n: usize) -> Vec<Option<InstanceIndex>> {
    let mut parent = vec![None; n];
    let mut visited = FixedBitSet::with_capacity(n + 1);
    let mut queue = VecDeque::new();

    visited.insert(ROOT as usize);
    for &root in graph.successors(ROOT) {
        visited.insert(root as usize);
        queue.push_back(root);
    }

    while let Some(node) = queue.pop_front() {
        for &succ in graph.successors(node) {
            if !visited.put(succ as usize) {
                parent[InstanceIndex::from_node(succ).index()] =
                    Some(InstanceIndex::from_node(node));
                queue.push_back(succ);
            }
        }
    }

    parent
}
