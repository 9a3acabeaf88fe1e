use std::time::Instant;

use crate::bitmap::LeakBitmap;
use crate::config::AnalysisConfig;
use crate::graph::{EdgeRecord, GraphStore, NodeId};
use crate::heap::{HeapScanner, RefEvent, RefInfo, RefKind, Referrer};

/// Per-run accumulator for the pass driver. `finished` is monotonic: a leak
/// id proven to reach a root stays finished for the rest of the run.
/// `nodes_found` is zeroed at the start of every pass.
pub struct PassState {
    pub finished: LeakBitmap,
    pub nodes_found: Vec<u64>,
}

impl PassState {
    fn new(leak_count: usize) -> PassState {
        PassState {
            finished: LeakBitmap::new(leak_count),
            nodes_found: vec![0; leak_count],
        }
    }
}

/// Incrementally discovers the subgraph relevant to the tracked leak
/// candidates across repeated heap scans.
///
/// The scan reports each object's references at most once per pass and in no
/// guaranteed order, so a referrer that only became tagged mid-pass
/// contributes its own inbound context one pass later. Repeating the scan
/// until no leak discovers a new node (or the pass budget runs out) makes the
/// build converge regardless of visiting order.
pub struct GraphBuilder<'a> {
    store: &'a mut GraphStore,
    config: &'a AnalysisConfig,
    pass: PassState,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(store: &'a mut GraphStore, config: &'a AnalysisConfig) -> GraphBuilder<'a> {
        let leak_count = store.leak_count();
        GraphBuilder {
            store,
            config,
            pass: PassState::new(leak_count),
        }
    }

    /// Drive scans until every leak id is done (finished, or no new node
    /// discovered in the last pass) or the pass budget is exhausted. Returns
    /// the number of passes executed.
    pub fn run(&mut self, scanner: &mut dyn HeapScanner) -> u32 {
        let mut passes = 0;
        for pass in 0..self.config.max_passes {
            let start = Instant::now();
            debug!("starting heap scan pass {}", pass + 1);
            self.pass.nodes_found.iter_mut().for_each(|c| *c = 0);
            scanner.scan(&mut |ev| self.on_reference(ev));
            passes = pass + 1;

            let mut has_unfinished = false;
            for (id, found) in self.pass.nodes_found.iter().enumerate() {
                let reached = self.pass.finished.contains(id);
                debug!(
                    "leak #{}: reached root? {}, new nodes discovered: {}",
                    id, reached, found
                );
                if !reached && *found != 0 {
                    has_unfinished = true;
                }
            }
            info!(
                "heap scan pass {} took {} ms",
                pass + 1,
                start.elapsed().as_micros() as f64 / 1000f64
            );
            if !has_unfinished {
                debug!("root chain seek converged after {} passes", passes);
                break;
            }
        }
        passes
    }

    pub fn into_pass_state(self) -> PassState {
        self.pass
    }

    /// One reported reference. Returns a fresh tag when the referrer was
    /// untagged and a node was allocated for it.
    fn on_reference(&mut self, ev: RefEvent) -> Option<NodeId> {
        // References held by the analysis worker itself are self-noise.
        if let (Some(self_tid), Some(tid)) = (self.config.self_thread, ev.info.thread_id()) {
            if ev.kind.is_local() && tid == self_tid {
                return None;
            }
        }

        let target = ev.target;
        {
            let t = self.store.node(target);
            if self.pass.finished.contains_all(&t.membership) {
                return None;
            }
            if t.membership.is_empty() {
                return None;
            }
        }

        if let Some(class_node) = ev.referrer_class {
            // Fan-in only applies once the referrer has a known class; edges
            // from unclassified referrers bypass the cap.
            let count = self.store.bump_fan_in(target, class_node);
            if count > self.config.max_fan_in {
                return None;
            }
            if ev.kind == RefKind::Field {
                if let RefInfo::Field { index } = ev.info {
                    let leak_size = self.store.node(target).leak_size;
                    if self.store.node(class_node).field_excluded(index, leak_size) {
                        debug!("ignoring field {}", index);
                        return None;
                    }
                }
            }
        }

        let mut new_tag = None;
        let ref_node = match ev.referrer {
            Referrer::Root => None,
            Referrer::Tagged(id) => {
                if ev.kind == RefKind::StaticField {
                    if let RefInfo::Field { index } = ev.info {
                        let leak_size = self.store.node(target).leak_size;
                        if self.store.node(id).field_excluded(index, leak_size) {
                            debug!("ignoring static field {}", index);
                            return None;
                        }
                    }
                }
                if self.store.has_edge(target, ev.kind, &ev.info, Some(id)) {
                    return None;
                }
                Some(id)
            }
            Referrer::Untagged(_) => {
                // Lazily allocate a node; handle resolution stays deferred
                // until rendering needs it.
                let id = self.store.create_node();
                new_tag = Some(id);
                Some(id)
            }
        };

        if let Some(rid) = ref_node {
            if rid != target {
                let (r, t) = self.store.pair_mut(rid, target);
                r.membership.union_excluding(&t.membership, &self.pass.finished);
                if r.leak_size < t.leak_size {
                    r.leak_size = t.leak_size;
                }
            }
        }

        self.store.node_mut(target).inbound.push(EdgeRecord {
            kind: ev.kind,
            info: ev.info,
            referrer: ref_node,
        });

        for id in self.store.node(target).membership.iter_set() {
            if !self.pass.finished.contains(id) {
                self.pass.nodes_found[id] += 1;
            }
        }

        if ev.kind.is_root() {
            // A root pins the target: nothing below it is left to discover
            // for these leaks.
            self.pass.finished.union(&self.store.node(target).membership);
        }

        new_tag
    }
}
