//! Incomplete-hypercube node.

use std::collections::{HashMap, HashSet};

use tracing::trace;

/// Default subcube dimension for scatter partitioning.
const DEFAULT_SUBCUBE_DIM: u32 = 3;

/// Smallest k with n <= 2^k.
pub fn ceil_log2(n: u32) -> u32 {
    if n <= 1 {
        0
    } else {
        32 - (n - 1).leading_zeros()
    }
}

/// Label a node assigns itself when a linkup message arrives: the sender's
/// label XORed with `control + 1`, falling back to 0 for the seed message
/// (whose control word has every link bit set, so `control + 1` overflows
/// the cube).
pub fn linkup_label(sender: u32, control: u32, dims: u32) -> u32 {
    let link = control.wrapping_add(1);
    if link < (1u32 << dims) {
        sender ^ link
    } else {
        0
    }
}

/// One outgoing leg of a scatter: the link to forward on and the destination
/// labels that ride it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScatterRoute {
    pub link: u32,
    pub labels: Vec<u32>,
}

/// A node of an (optionally incomplete) hypercube.
///
/// `label < 2^dims` always holds; labels in `num_nodes..2^dims` are ghosts
/// with no real peer. The neighbor set only ever contains labels at Hamming
/// distance 1.
#[derive(Debug)]
pub struct Hypercube {
    label: u32,
    num_nodes: u32,
    dims: u32,
    subcube_dim: u32,
    neighbors: HashSet<u32>,
    // Broadcast link lists recur across repeated collectives with the same
    // control word, so they are cached. Scatter partitions depend on the
    // destination list as well and are recomputed per call.
    broadcast_cache: HashMap<u32, Vec<u32>>,
}

impl Hypercube {
    pub fn new(label: u32, num_nodes: u32) -> Self {
        let dims = ceil_log2(num_nodes);
        debug_assert!(label < (1u32 << dims).max(1));
        Self {
            label,
            num_nodes,
            dims,
            subcube_dim: DEFAULT_SUBCUBE_DIM.min(dims),
            neighbors: HashSet::new(),
            broadcast_cache: HashMap::new(),
        }
    }

    pub fn label(&self) -> u32 {
        self.label
    }

    pub fn num_nodes(&self) -> u32 {
        self.num_nodes
    }

    pub fn dims(&self) -> u32 {
        self.dims
    }

    pub fn subcube_dim(&self) -> u32 {
        self.subcube_dim
    }

    pub fn set_subcube_dim(&mut self, dim: u32) {
        if dim <= self.dims {
            self.subcube_dim = dim.max(1);
        }
    }

    /// Initial control word presented by the root of a broadcast: every link
    /// of the enclosing complete cube still owes a copy.
    pub fn initial_control(num_nodes: u32) -> u32 {
        ((1u64 << ceil_log2(num_nodes)) - 1) as u32
    }

    /// Two labels are neighbors iff their Hamming distance is 1. Holds for
    /// ghost labels too; it says nothing about an attached connection.
    pub fn is_neighbor_label(&self, label: u32) -> bool {
        (self.label ^ label).count_ones() == 1
    }

    /// Label of the neighbor reached by `link` (a single-bit mask).
    pub fn label_for_link(&self, link: u32) -> u32 {
        link ^ self.label
    }

    /// Record an attached connection for a neighbor label. Invalidates the
    /// pruning cache, which depends on the neighbor set.
    pub fn add_neighbor(&mut self, label: u32) {
        debug_assert!(self.is_neighbor_label(label));
        self.neighbors.insert(label);
        self.broadcast_cache.clear();
    }

    pub fn remove_neighbor(&mut self, label: u32) {
        self.neighbors.remove(&label);
        self.broadcast_cache.clear();
    }

    pub fn has_neighbor(&self, label: u32) -> bool {
        self.neighbors.contains(&label)
    }

    pub fn has_neighbors(&self) -> bool {
        !self.neighbors.is_empty()
    }

    pub fn neighbor_labels(&self) -> impl Iterator<Item = u32> + '_ {
        self.neighbors.iter().copied()
    }

    /// Next neighbor on the path to `to`: the highest-order bit of the
    /// relative address with an attached neighbor. Monotonically convergent
    /// on a complete cube; best effort on incomplete ones.
    pub fn next_hop(&self, to: u32) -> Option<u32> {
        let relative = to ^ self.label;
        if relative == 0 {
            return None;
        }
        let mut link = 1u32 << self.dims.min(31);
        while link != 0 {
            if link & relative != 0 && self.neighbors.contains(&(link ^ self.label)) {
                return Some(link ^ self.label);
            }
            link >>= 1;
        }
        None
    }

    /// Links along which a broadcast with control word `control` must be
    /// forwarded, highest link first so the largest subtrees are dispatched
    /// before the smaller ones.
    pub fn broadcast_links(&mut self, control: u32) -> Vec<u32> {
        if let Some(cached) = self.broadcast_cache.get(&control) {
            return cached.clone();
        }
        let mut links = Vec::new();
        let mut link = 1u32 << 31;
        while link != 0 {
            if link & control != 0 && self.neighbors.contains(&(self.label ^ link)) {
                links.push(link);
            }
            link >>= 1;
        }
        trace!(label = self.label, control, ?links, "computed broadcast links");
        self.broadcast_cache.insert(control, links.clone());
        links
    }

    /// Pruned control word handed to the neighbor along `link` when
    /// forwarding a broadcast or scatter. Bits at or above the link survive
    /// only where the copy is owed and this node has no real neighbor to
    /// absorb it; lower bits pass through verbatim, so unreachable branches
    /// of an incomplete cube are absorbed rather than silently dropped.
    pub fn control_for_link(&self, control: u32, link: u32) -> u32 {
        let mut pruned = 0u32;
        let mut bit = self.top_link();
        while bit >= link && bit != 0 {
            if bit & control != 0 && !self.neighbors.contains(&(self.label ^ bit)) {
                pruned |= bit;
            }
            bit >>= 1;
        }
        while bit != 0 {
            pruned |= bit & control;
            bit >>= 1;
        }
        pruned
    }

    /// Linkup variant of the pruning: only bits below the link survive. Used
    /// while the graph is still being built, when the neighbor set cannot be
    /// consulted.
    pub fn control_for_linkup(&self, control: u32, link: u32) -> u32 {
        let mut pruned = 0u32;
        let mut bit = link >> 1;
        while bit != 0 {
            pruned |= bit & control;
            bit >>= 1;
        }
        pruned
    }

    /// Parent of this node in the spanning tree rooted at `source`: the
    /// highest-order differing bit with an attached neighbor.
    pub fn parent(&self, source: u32) -> Option<u32> {
        if source == self.label {
            return None;
        }
        let relative = self.label ^ source;
        let mut bit = self.top_link();
        while bit != 0 {
            if relative & bit != 0 && self.neighbors.contains(&(self.label ^ bit)) {
                return Some(self.label ^ bit);
            }
            bit >>= 1;
        }
        None
    }

    /// Children of this node in the spanning tree rooted at `source`: the
    /// neighbors whose route toward `source` passes through this node.
    /// Assumes a non-faulty (though possibly incomplete) cube, so a
    /// neighbor's own links are judged by label range.
    pub fn children(&self, source: u32) -> Vec<u32> {
        let mut children = Vec::new();
        for i in 0..self.dims {
            let candidate = self.label ^ (1 << i);
            if !self.neighbors.contains(&candidate) {
                continue;
            }
            let relative = candidate ^ source;
            let mut bit = self.top_link();
            let mut first_hop = 0;
            while bit != 0 {
                if (candidate ^ bit) < self.num_nodes && relative & bit != 0 {
                    first_hop = bit;
                    break;
                }
                bit >>= 1;
            }
            if first_hop == (1 << i) {
                children.push(candidate);
            }
        }
        children
    }

    /// The `index`-th subcube of dimension `subdim`, translated so the label
    /// space is viewed relative to `node`. Returns `None` when the subcube
    /// falls entirely outside an incomplete cube.
    pub fn subcube(num_nodes: u32, subdim: u32, node: u32, index: u32) -> Option<Vec<u32>> {
        let dims = ceil_log2(num_nodes);
        let subdim = subdim.min(dims);
        let count = 1u32 << subdim;
        let last = (1u32 << (dims - subdim)) - 1;
        let start = index.min(last);
        let mask = (1u32 << dims) - (1u32 << subdim);
        let check = ((start << subdim) ^ node) & mask;
        if num_nodes - 1 < check {
            return None;
        }
        let offset = start << subdim;
        let labels: Vec<u32> = (0..count)
            .map(|j| (j + offset) ^ node)
            .filter(|&label| label < num_nodes)
            .collect();
        Some(labels)
    }

    /// Candidate subcubes for a locally initiated scatter, ordered by
    /// descending distance from this node, so a large scatter goes out in
    /// chunks instead of one huge message.
    pub fn local_scatter_list(&self) -> Vec<Vec<u32>> {
        let subdim = self.subcube_dim.min(self.dims);
        let last = (1u32 << (self.dims - subdim)) - 1;
        let mut list = Vec::new();
        for index in (0..=last).rev() {
            if let Some(labels) = Self::subcube(self.num_nodes, subdim, self.label, index) {
                if !labels.is_empty() {
                    list.push(labels);
                }
            }
        }
        list
    }

    /// Partition a sorted destination list across the outgoing links of a
    /// scatter with inbound control word `control`. Each label lands on
    /// exactly one link - the one whose reachable address mask contains it -
    /// and this node's own label lands on none.
    pub fn scatter_partition(&mut self, control: u32, labels: &[u32]) -> Vec<ScatterRoute> {
        if control == 0 {
            return Vec::new();
        }
        let full_mask = ((1u64 << self.dims) - 1) as u32;
        let links = self.broadcast_links(control);
        links
            .into_iter()
            .map(|link| {
                let neighbor = self.label ^ link;
                let pruned = self.control_for_link(control, link);
                let mask = !pruned & full_mask;
                let check = neighbor & mask;
                let subset: Vec<u32> = labels
                    .iter()
                    .copied()
                    .filter(|&label| label & mask == check)
                    .collect();
                ScatterRoute {
                    link,
                    labels: subset,
                }
            })
            .collect()
    }

    fn top_link(&self) -> u32 {
        if self.dims == 0 {
            0
        } else {
            1u32 << (self.dims - 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::{HashMap, HashSet};

    /// A node with every in-range Hamming-1 neighbor attached, as linkup
    /// leaves it.
    fn linked_node(label: u32, num_nodes: u32) -> Hypercube {
        let mut node = Hypercube::new(label, num_nodes);
        for i in 0..node.dims() {
            let neighbor = label ^ (1 << i);
            if neighbor < num_nodes {
                node.add_neighbor(neighbor);
            }
        }
        node
    }

    /// Recursively deliver a broadcast, counting receipts per label.
    fn simulate_broadcast(num_nodes: u32, root: u32) -> HashMap<u32, u32> {
        let mut received = HashMap::new();
        received.insert(root, 1);
        fn deliver(num_nodes: u32, label: u32, control: u32, received: &mut HashMap<u32, u32>) {
            let mut node = linked_node(label, num_nodes);
            for link in node.broadcast_links(control) {
                let next = label ^ link;
                *received.entry(next).or_insert(0) += 1;
                deliver(num_nodes, next, node.control_for_link(control, link), received);
            }
        }
        deliver(num_nodes, root, Hypercube::initial_control(num_nodes), &mut received);
        received
    }

    #[test]
    fn broadcast_covers_complete_cubes_exactly_once() {
        for num_nodes in [2u32, 4, 8, 16, 32] {
            for root in [0, 1, num_nodes - 1] {
                let received = simulate_broadcast(num_nodes, root);
                assert_eq!(received.len() as u32, num_nodes, "N={num_nodes} root={root}");
                assert!(
                    received.values().all(|&n| n == 1),
                    "duplicate delivery, N={num_nodes} root={root}: {received:?}"
                );
            }
        }
    }

    #[test]
    fn broadcast_covers_incomplete_cubes_exactly_once() {
        for num_nodes in [3u32, 5, 6, 7, 9, 11, 13, 100] {
            for root in 0..num_nodes.min(8) {
                let received = simulate_broadcast(num_nodes, root);
                assert_eq!(received.len() as u32, num_nodes, "N={num_nodes} root={root}");
                assert!(received.values().all(|&n| n == 1), "N={num_nodes} root={root}");
            }
        }
    }

    #[test]
    fn neighbor_relation_is_symmetric() {
        for num_nodes in [5u32, 6, 11, 19] {
            for a in 0..num_nodes {
                for b in 0..num_nodes {
                    let node_a = Hypercube::new(a, num_nodes);
                    let node_b = Hypercube::new(b, num_nodes);
                    assert_eq!(
                        node_a.is_neighbor_label(b),
                        node_b.is_neighbor_label(a),
                        "asymmetry between {a} and {b}"
                    );
                }
            }
        }
    }

    #[test]
    fn next_hop_converges_from_anywhere() {
        for num_nodes in [4u32, 8, 11, 13] {
            for from in 0..num_nodes {
                for to in 0..num_nodes {
                    if from == to {
                        continue;
                    }
                    let mut current = from;
                    let mut hops = 0;
                    while current != to {
                        let node = linked_node(current, num_nodes);
                        current = node
                            .next_hop(to)
                            .unwrap_or_else(|| panic!("stuck at {current} going {from}->{to}"));
                        hops += 1;
                        assert!(hops <= 32, "loop on route {from}->{to} (N={num_nodes})");
                    }
                }
            }
        }
    }

    #[test]
    fn next_hop_is_none_for_self_and_without_neighbors() {
        let node = linked_node(3, 8);
        assert_eq!(node.next_hop(3), None);
        let lonely = Hypercube::new(0, 8);
        assert_eq!(lonely.next_hop(5), None);
    }

    #[test]
    fn spanning_tree_parent_child_agree() {
        for num_nodes in [8u32, 11, 16] {
            for source in 0..num_nodes.min(4) {
                for label in 0..num_nodes {
                    let node = linked_node(label, num_nodes);
                    for child in node.children(source) {
                        let child_node = linked_node(child, num_nodes);
                        assert_eq!(
                            child_node.parent(source),
                            Some(label),
                            "child {child} of {label} disagrees (source {source}, N={num_nodes})"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn parent_chain_reaches_source() {
        for num_nodes in [8u32, 11] {
            for source in 0..num_nodes {
                for label in 0..num_nodes {
                    if label == source {
                        continue;
                    }
                    let mut current = label;
                    let mut hops = 0;
                    while current != source {
                        current = linked_node(current, num_nodes)
                            .parent(source)
                            .unwrap_or_else(|| panic!("no parent at {current} toward {source}"));
                        hops += 1;
                        assert!(hops <= 32);
                    }
                }
            }
        }
    }

    #[test]
    fn scatter_partition_is_exact() {
        for num_nodes in [4u32, 8, 11, 13, 37] {
            for label in 0..num_nodes {
                let mut node = linked_node(label, num_nodes);
                let all: Vec<u32> = (0..num_nodes).collect();
                let control = Hypercube::initial_control(num_nodes);
                let routes = node.scatter_partition(control, &all);

                let mut seen: Vec<u32> =
                    routes.iter().flat_map(|r| r.labels.iter().copied()).collect();
                seen.sort_unstable();
                let expected: Vec<u32> = (0..num_nodes).filter(|&l| l != label).collect();
                assert_eq!(seen, expected, "partition at {label} (N={num_nodes})");
            }
        }
    }

    #[test]
    fn recursive_scatter_delivers_every_label_once() {
        fn deliver(
            num_nodes: u32,
            label: u32,
            control: u32,
            labels: &[u32],
            got: &mut HashMap<u32, u32>,
        ) {
            if labels.contains(&label) {
                *got.entry(label).or_insert(0) += 1;
            }
            let mut node = linked_node(label, num_nodes);
            for route in node.scatter_partition(control, labels) {
                if route.labels.is_empty() {
                    continue;
                }
                let next = label ^ route.link;
                let pruned = node.control_for_link(control, route.link);
                deliver(num_nodes, next, pruned, &route.labels, got);
            }
        }

        for num_nodes in [8u32, 11, 19] {
            for source in 0..num_nodes.min(6) {
                let labels: Vec<u32> = (0..num_nodes).collect();
                let mut got = HashMap::new();
                deliver(
                    num_nodes,
                    source,
                    Hypercube::initial_control(num_nodes),
                    &labels,
                    &mut got,
                );
                assert_eq!(got.len() as u32, num_nodes, "N={num_nodes} src={source}");
                assert!(got.values().all(|&n| n == 1), "N={num_nodes} src={source}");
            }
        }
    }

    #[test]
    fn local_scatter_list_partitions_the_label_space() {
        for num_nodes in [1u32, 7, 8, 11, 37, 100] {
            for label in 0..num_nodes.min(6) {
                let node = linked_node(label, num_nodes);
                let mut flat: Vec<u32> =
                    node.local_scatter_list().into_iter().flatten().collect();
                flat.sort_unstable();
                let expected: Vec<u32> = (0..num_nodes).collect();
                assert_eq!(flat, expected, "N={num_nodes} label={label}");
            }
        }
    }

    #[test]
    fn linkup_assigns_every_label_from_a_single_seed() {
        fn arrive(num_nodes: u32, sender: u32, control: u32, assigned: &mut HashSet<u32>) {
            let dims = ceil_log2(num_nodes);
            let label = linkup_label(sender, control, dims);
            if !assigned.insert(label) {
                panic!("label {label} assigned twice (N={num_nodes})");
            }
            let mut node = linked_node(label, num_nodes);
            for link in node.broadcast_links(control) {
                arrive(num_nodes, label, node.control_for_linkup(control, link), assigned);
            }
        }

        for num_nodes in [2u32, 5, 8, 11, 16, 33] {
            let mut assigned = HashSet::new();
            arrive(num_nodes, 0, Hypercube::initial_control(num_nodes), &mut assigned);
            assert_eq!(assigned.len() as u32, num_nodes, "N={num_nodes}");
            assert!((0..num_nodes).all(|l| assigned.contains(&l)), "N={num_nodes}");
        }
    }

    #[test]
    fn broadcast_cache_invalidates_on_neighbor_change() {
        let mut node = linked_node(0, 8);
        let control = Hypercube::initial_control(8);
        let before = node.broadcast_links(control);
        assert_eq!(before, vec![4, 2, 1]);

        node.remove_neighbor(4);
        let after = node.broadcast_links(control);
        assert_eq!(after, vec![2, 1]);
    }

    proptest! {
        #[test]
        fn scatter_partition_never_duplicates_or_loses(
            num_nodes in 2u32..64,
            label_seed in any::<u32>(),
        ) {
            let label = label_seed % num_nodes;
            let mut node = linked_node(label, num_nodes);
            let all: Vec<u32> = (0..num_nodes).collect();
            let routes = node.scatter_partition(Hypercube::initial_control(num_nodes), &all);
            let mut seen: Vec<u32> =
                routes.iter().flat_map(|r| r.labels.iter().copied()).collect();
            seen.sort_unstable();
            let expected: Vec<u32> = (0..num_nodes).filter(|&l| l != label).collect();
            prop_assert_eq!(seen, expected);
        }
    }
}
