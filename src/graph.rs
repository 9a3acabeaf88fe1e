use smallvec::SmallVec;

use crate::bitmap::LeakBitmap;
use crate::heap::{ClassRef, ObjRef, RefInfo, RefKind};

/// Stable index of a node in the arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NodeId(pub u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// One inbound reference recorded on a node. `referrer` is `None` for a
/// reference originating outside the object graph.
#[derive(Clone, Debug)]
pub struct EdgeRecord {
    pub kind: RefKind,
    pub info: RefInfo,
    pub referrer: Option<NodeId>,
}

/// Operator-supplied suppression of a field on a referring class: edges
/// through the field are dropped while the downstream leak size stays below
/// the threshold. `index` is resolved from the field name at class-tagging
/// time; an unresolved rule matches nothing.
#[derive(Clone, Debug)]
pub struct ExcludedField {
    pub name: String,
    pub index: Option<u32>,
    pub threshold: u64,
}

/// One heap object or class. Handle and class name resolve lazily; `dead`
/// marks an object that vanished between tagging and resolution.
pub struct Node {
    pub obj: Option<ObjRef>,
    pub class: Option<ClassRef>,
    pub class_name: Option<String>,
    pub dead: bool,
    pub is_class: bool,
    pub resolved: bool,
    /// Largest leak size attributed through this node.
    pub leak_size: u64,
    /// Leak ids for which this node may still lie on an unresolved path to a
    /// root.
    pub membership: LeakBitmap,
    /// Held only while the node is on the active chain-search stack.
    pub visiting: bool,
    pub inbound: SmallVec<[EdgeRecord; 4]>,
    /// Recorded-edge counts per referring class node.
    fan_in: Vec<(NodeId, u32)>,
    /// Class nodes only.
    pub excluded_fields: Vec<ExcludedField>,
}

impl Node {
    fn new(leak_count: usize) -> Node {
        Node {
            obj: None,
            class: None,
            class_name: None,
            dead: false,
            is_class: false,
            resolved: false,
            leak_size: 0,
            membership: LeakBitmap::new(leak_count),
            visiting: false,
            inbound: SmallVec::new(),
            fan_in: Vec::new(),
            excluded_fields: Vec::new(),
        }
    }

    /// Whether `field_index` on this (class) node is suppressed for a target
    /// whose attributed leak size is `leak_size`.
    pub fn field_excluded(&self, field_index: u32, leak_size: u64) -> bool {
        for rule in &self.excluded_fields {
            if rule.index == Some(field_index) && leak_size < rule.threshold {
                debug!(
                    "field {} excluded: size={} threshold={}",
                    rule.name, leak_size, rule.threshold
                );
                return true;
            }
        }
        false
    }
}

/// Arena of nodes for one analysis run. Nodes are created lazily on first
/// encounter and the whole arena drops at end of run; edges are `NodeId`
/// references, so teardown needs no per-node release.
pub struct GraphStore {
    nodes: Vec<Node>,
    leak_count: usize,
}

impl GraphStore {
    pub fn new(leak_count: usize) -> GraphStore {
        GraphStore {
            nodes: Vec::new(),
            leak_count,
        }
    }

    pub fn leak_count(&self) -> usize {
        self.leak_count
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn create_node(&mut self) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node::new(self.leak_count));
        id
    }

    pub fn create_class_node(&mut self, class: ClassRef) -> NodeId {
        let id = self.create_node();
        let node = &mut self.nodes[id.index()];
        node.is_class = true;
        node.obj = Some(class);
        node.class = Some(class);
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    /// Simultaneous mutable access to two distinct nodes.
    pub fn pair_mut(&mut self, a: NodeId, b: NodeId) -> (&mut Node, &mut Node) {
        assert_ne!(a, b);
        if a.index() < b.index() {
            let (lo, hi) = self.nodes.split_at_mut(b.index());
            (&mut lo[a.index()], &mut hi[0])
        } else {
            let (lo, hi) = self.nodes.split_at_mut(a.index());
            (&mut hi[0], &mut lo[b.index()])
        }
    }

    /// An identical (kind, info, referrer) edge already recorded on `target`.
    /// Tagged targets are re-reported on every later scan pass, so recording
    /// must be idempotent for convergence detection to work.
    pub fn has_edge(
        &self,
        target: NodeId,
        kind: RefKind,
        info: &RefInfo,
        referrer: Option<NodeId>,
    ) -> bool {
        self.nodes[target.index()]
            .inbound
            .iter()
            .any(|e| e.kind == kind && e.info == *info && e.referrer == referrer)
    }

    /// Bump the recorded-edge counter for (target, referring class) and
    /// return the post-increment count.
    pub fn bump_fan_in(&mut self, target: NodeId, class_node: NodeId) -> u32 {
        assert!(
            self.nodes[class_node.index()].is_class,
            "fan-in referrer {:?} is not a class node",
            class_node
        );
        let node = &mut self.nodes[target.index()];
        for entry in &mut node.fan_in {
            if entry.0 == class_node {
                entry.1 += 1;
                return entry.1;
            }
        }
        node.fan_in.push((class_node, 1));
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_node_sizes_membership() {
        let mut store = GraphStore::new(3);
        let n = store.create_node();
        assert_eq!(store.node(n).membership.len(), 3);
        assert!(store.node(n).membership.is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_duplicate_edge_detection() {
        let mut store = GraphStore::new(1);
        let target = store.create_node();
        let from = store.create_node();
        let info = RefInfo::Field { index: 3 };
        assert!(!store.has_edge(target, RefKind::Field, &info, Some(from)));
        store.node_mut(target).inbound.push(EdgeRecord {
            kind: RefKind::Field,
            info,
            referrer: Some(from),
        });
        assert!(store.has_edge(target, RefKind::Field, &info, Some(from)));
        // a different slot on the same referrer is a distinct edge
        let other = RefInfo::Field { index: 4 };
        assert!(!store.has_edge(target, RefKind::Field, &other, Some(from)));
    }

    #[test]
    fn test_fan_in_counting() {
        let mut store = GraphStore::new(1);
        let target = store.create_node();
        let class_a = store.create_class_node(10);
        let class_b = store.create_class_node(11);
        assert_eq!(store.bump_fan_in(target, class_a), 1);
        assert_eq!(store.bump_fan_in(target, class_a), 2);
        assert_eq!(store.bump_fan_in(target, class_b), 1);
        assert_eq!(store.bump_fan_in(target, class_a), 3);
    }

    #[test]
    fn test_pair_mut_both_orders() {
        let mut store = GraphStore::new(2);
        let a = store.create_node();
        let b = store.create_node();
        {
            let (na, nb) = store.pair_mut(a, b);
            na.leak_size = 7;
            nb.leak_size = 9;
        }
        let (nb, na) = store.pair_mut(b, a);
        assert_eq!(nb.leak_size, 9);
        assert_eq!(na.leak_size, 7);
    }

    #[test]
    fn test_diamond_teardown() {
        // root -> a, root -> b, a -> d, b -> d: every node lives in the arena
        // exactly once and drops with it, shared referent included.
        let mut store = GraphStore::new(1);
        let d = store.create_node();
        let a = store.create_node();
        let b = store.create_node();
        for from in [a, b] {
            store.node_mut(d).inbound.push(EdgeRecord {
                kind: RefKind::Field,
                info: RefInfo::Field { index: 0 },
                referrer: Some(from),
            });
        }
        for n in [a, b] {
            store.node_mut(n).inbound.push(EdgeRecord {
                kind: RefKind::StaticField,
                info: RefInfo::Field { index: 0 },
                referrer: None,
            });
        }
        assert_eq!(store.len(), 3);
        assert_eq!(store.node(d).inbound.len(), 2);
        drop(store);
    }

    #[test]
    fn test_field_exclusion_threshold() {
        let mut store = GraphStore::new(1);
        let class = store.create_class_node(10);
        store.node_mut(class).excluded_fields.push(ExcludedField {
            name: "cache".to_string(),
            index: Some(2),
            threshold: 1000,
        });
        let node = store.node(class);
        assert!(node.field_excluded(2, 500));
        assert!(!node.field_excluded(2, 1000));
        assert!(!node.field_excluded(3, 500));
    }

    #[test]
    fn test_unresolved_exclusion_matches_nothing() {
        let mut store = GraphStore::new(1);
        let class = store.create_class_node(10);
        store.node_mut(class).excluded_fields.push(ExcludedField {
            name: "gone".to_string(),
            index: None,
            threshold: 1000,
        });
        assert!(!store.node(class).field_excluded(0, 0));
    }
}
