//! Dominators over an object reference graph.
//!
//! The algorithm is Cooper, Harvey & Kennedy's "A Simple, Fast Dominance Algorithm", with the
//! iterative post-order from Cranelift's `dominator_tree.rs` (Apache 2.0) so that deep object
//! chains can't overflow the stack.

/// Node 0 is the root of every graph handed to `DominatorTree`.
pub const ROOT: u32 = 0;

/// RPO numbers are multiples of STRIDE, leaving gaps below for the marker values.
const STRIDE: u32 = 4;

/// Markers held in `rpo_number` while computing the post-order.
const DONE: u32 = 1;
const SEEN: u32 = 2;

/// Outgoing edges of every node, stored contiguously.
///
/// Nodes are numbered in the order they're pushed. Edges may point at nodes pushed later, but
/// every target must exist by the time the graph is used.
#[derive(Clone, Debug)]
pub struct ReferenceGraph {
    offsets: Vec<usize>,
    targets: Vec<u32>,
}

impl ReferenceGraph {
    pub fn with_capacity(nodes: usize, edges: usize) -> ReferenceGraph {
        let mut offsets = Vec::with_capacity(nodes + 1);
        offsets.push(0);
        ReferenceGraph {
            offsets,
            targets: Vec::with_capacity(edges),
        }
    }

    pub fn from_adjacency(adjacency: &[Vec<u32>]) -> ReferenceGraph {
        let edges = adjacency.iter().map(|a| a.len()).sum();
        let mut graph = ReferenceGraph::with_capacity(adjacency.len(), edges);
        for successors in adjacency {
            graph.push_node(successors.iter().copied());
        }
        graph
    }

    /// Append a node, returning its number
    pub fn push_node<I: IntoIterator<Item = u32>>(&mut self, successors: I) -> u32 {
        let node = self.node_count() as u32;
        self.targets.extend(successors);
        self.offsets.push(self.targets.len());
        node
    }

    pub fn node_count(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn edge_count(&self) -> usize {
        self.targets.len()
    }

    pub fn successors(&self, node: u32) -> &[u32] {
        let node = node as usize;
        &self.targets[self.offsets[node]..self.offsets[node + 1]]
    }
}

#[derive(Clone, Copy, Default)]
struct DomNode {
    /// Position in reverse post-order, in multiples of STRIDE. 0 means unreachable.
    rpo_number: u32,
    /// `None` for the root and for unreachable nodes
    idom: Option<u32>,
}

pub struct DominatorTree {
    nodes: Vec<DomNode>,
    /// Reachable nodes other than the root, each after everything it dominates
    postorder: Vec<u32>,
    pred_offsets: Vec<usize>,
    preds: Vec<u32>,
}

impl DominatorTree {
    pub fn from_graph(graph: &ReferenceGraph) -> DominatorTree {
        let mut domtree = DominatorTree {
            nodes: vec![DomNode::default(); graph.node_count()],
            postorder: Vec::new(),
            pred_offsets: Vec::new(),
            preds: Vec::new(),
        };

        if graph.node_count() > 0 {
            domtree.compute_postorder(graph);
            domtree.compute_predecessors(graph);
            domtree.compute_domtree();
        }

        domtree
    }

    /// Leaves `rpo_number == DONE` on reachable nodes, 0 elsewhere.
    fn compute_postorder(&mut self, graph: &ReferenceGraph) {
        // rpo_number during this pass:
        //   0:    not reached yet
        //   SEEN: on the stack, successors not pushed yet
        //   DONE: successors pushed; the next pop emits the node
        let mut stack = vec![ROOT];
        self.nodes[ROOT as usize].rpo_number = SEEN;

        while let Some(node) = stack.pop() {
            match self.nodes[node as usize].rpo_number {
                SEEN => {
                    self.nodes[node as usize].rpo_number = DONE;
                    stack.push(node);

                    for &succ in graph.successors(node) {
                        if self.nodes[succ as usize].rpo_number == 0 {
                            self.nodes[succ as usize].rpo_number = SEEN;
                            stack.push(succ);
                        }
                    }
                }
                DONE => self.postorder.push(node),
                other => unreachable!("node {} popped with marker {}", node, other),
            }
        }
    }

    /// Predecessor lists, restricted to reachable sources
    fn compute_predecessors(&mut self, graph: &ReferenceGraph) {
        let n = self.nodes.len();
        let mut counts = vec![0_usize; n + 1];
        for node in 0..n as u32 {
            if self.nodes[node as usize].rpo_number == 0 {
                continue;
            }
            for &succ in graph.successors(node) {
                counts[succ as usize + 1] += 1;
            }
        }
        for i in 1..=n {
            counts[i] += counts[i - 1];
        }

        let mut preds = vec![0_u32; counts[n]];
        let mut next = counts.clone();
        for node in 0..n as u32 {
            if self.nodes[node as usize].rpo_number == 0 {
                continue;
            }
            for &succ in graph.successors(node) {
                let slot = &mut next[succ as usize];
                preds[*slot] = node;
                *slot += 1;
            }
        }

        self.pred_offsets = counts;
        self.preds = preds;
    }

    fn predecessors(&self, node: u32) -> &[u32] {
        let node = node as usize;
        &self.preds[self.pred_offsets[node]..self.pred_offsets[node + 1]]
    }

    fn compute_domtree(&mut self) {
        // rpo_number during this pass:
        //   0:  unreachable
        //   1:  reachable, not numbered yet
        //   2+: numbered
        let root = self.postorder.pop();
        debug_assert_eq!(Some(ROOT), root);

        self.nodes[ROOT as usize].rpo_number = 2 * STRIDE;
        for rpo_idx in 0..self.postorder.len() {
            let node = self.postorder[self.postorder.len() - 1 - rpo_idx];
            // every node has at least one predecessor that's earlier in RPO, so this only
            // ever looks at numbered nodes
            let idom = self.compute_idom(node);
            let dom_node = &mut self.nodes[node as usize];
            dom_node.idom = idom;
            dom_node.rpo_number = (rpo_idx as u32 + 3) * STRIDE;
        }

        let mut changed = true;
        let mut passes = 1;
        while changed {
            changed = false;
            passes += 1;
            for rpo_idx in 0..self.postorder.len() {
                let node = self.postorder[self.postorder.len() - 1 - rpo_idx];
                let idom = self.compute_idom(node);
                if self.nodes[node as usize].idom != idom {
                    self.nodes[node as usize].idom = idom;
                    changed = true;
                }
            }
        }

        log::debug!(
            "Dominators converged after {} passes over {} reachable nodes",
            passes,
            self.postorder.len() + 1
        );
    }

    /// Nearest common dominator of the numbered predecessors
    fn compute_idom(&self, node: u32) -> Option<u32> {
        let mut numbered = self
            .predecessors(node)
            .iter()
            .copied()
            .filter(|&p| self.nodes[p as usize].rpo_number > 1);

        let first = numbered.next()?;
        Some(numbered.fold(first, |idom, pred| self.common_dominator(idom, pred)))
    }

    fn common_dominator(&self, mut a: u32, mut b: u32) -> u32 {
        loop {
            let rpo_a = self.nodes[a as usize].rpo_number;
            let rpo_b = self.nodes[b as usize].rpo_number;
            if rpo_a < rpo_b {
                b = self.nodes[b as usize].idom.unwrap_or(ROOT);
            } else if rpo_a > rpo_b {
                a = self.nodes[a as usize].idom.unwrap_or(ROOT);
            } else {
                return a;
            }
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_reachable(&self, node: u32) -> bool {
        node == ROOT || self.nodes[node as usize].rpo_number != 0
    }

    /// `None` for the root and unreachable nodes
    pub fn idom(&self, node: u32) -> Option<u32> {
        self.nodes[node as usize].idom
    }

    /// Reachable nodes except the root, every node before its dominators
    pub fn postorder(&self) -> &[u32] {
        &self.postorder
    }

    /// Whether every path from the root to `b` goes through `a`. A node dominates itself.
    pub fn dominates(&self, a: u32, b: u32) -> bool {
        if !self.is_reachable(a) || !self.is_reachable(b) {
            return false;
        }

        let rpo_a = self.nodes[a as usize].rpo_number;
        let mut b = b;
        while self.nodes[b as usize].rpo_number > rpo_a {
            match self.nodes[b as usize].idom {
                Some(idom) => b = idom,
                None => return false,
            }
        }
        a == b
    }
}
