use anyhow::{bail, Result};

use crate::describe::resolve_node;
use crate::graph::{EdgeRecord, GraphStore, NodeId};
use crate::heap::{HeapScanner, Introspect};

/// Reconstruct a root-to-leak reference path for one candidate over the
/// built graph. First path found by traversal order wins; it is not
/// minimized. Returns `None` when no considered path reaches a root.
pub fn extract_chain(
    store: &mut GraphStore,
    heap: &dyn HeapScanner,
    intro: &dyn Introspect,
    node: NodeId,
    leak: usize,
    consider_locals: bool,
) -> Result<Option<Vec<EdgeRecord>>> {
    chain_inner(store, heap, intro, node, leak, consider_locals)
}

/// Depth-first backtracking. The `visiting` flag is held only while the node
/// is on the active call stack, which is what keeps the search finite on
/// cyclic graphs; a failed descent clears the leak's bit on the referrer so
/// the same dead end is never re-explored.
fn chain_inner(
    store: &mut GraphStore,
    heap: &dyn HeapScanner,
    intro: &dyn Introspect,
    node: NodeId,
    leak: usize,
    consider_locals: bool,
) -> Result<Option<Vec<EdgeRecord>>> {
    if store.node(node).visiting {
        return Ok(None);
    }
    if !store.node(node).membership.contains(leak) {
        return Ok(None);
    }
    store.node_mut(node).visiting = true;
    resolve_node(store, node, heap, intro)?;

    let mut result = None;
    if !store.node(node).dead {
        let edges: Vec<EdgeRecord> = store.node(node).inbound.iter().cloned().collect();
        for edge in edges {
            if edge.kind.is_local() && !consider_locals {
                continue;
            }
            if edge.kind.is_root() {
                result = Some(vec![edge]);
                break;
            }
            let Some(referrer) = edge.referrer else {
                bail!("non-root reference of kind {:?} has no referrer", edge.kind);
            };
            match chain_inner(store, heap, intro, referrer, leak, consider_locals)? {
                Some(mut chain) => {
                    chain.push(edge);
                    result = Some(chain);
                    break;
                }
                None => {
                    // no path to a root through this node for this leak
                    store.node_mut(referrer).membership.remove(leak);
                }
            }
        }
    }
    store.node_mut(node).visiting = false;
    Ok(result)
}
