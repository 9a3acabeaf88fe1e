use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{bail, Result};

use crate::builder::GraphBuilder;
use crate::chain::extract_chain;
use crate::config::AnalysisConfig;
use crate::describe::{field_index_by_name, resolve_node, Describer, UNKNOWN};
use crate::graph::{EdgeRecord, ExcludedField, GraphStore};
use crate::heap::{HeapScanner, Introspect, ObjRef, SizedObjects};
use crate::report::ReportSink;

/// One analysis mutates heap tags process-wide; a second run cannot start
/// until the first releases them.
static ANALYSIS_IN_PROGRESS: AtomicBool = AtomicBool::new(false);

struct InProgressGuard;

impl InProgressGuard {
    fn acquire() -> Result<InProgressGuard> {
        if ANALYSIS_IN_PROGRESS.swap(true, Ordering::SeqCst) {
            bail!("a leak analysis is already in progress");
        }
        Ok(InProgressGuard)
    }
}

impl Drop for InProgressGuard {
    fn drop(&mut self) {
        ANALYSIS_IN_PROGRESS.store(false, Ordering::SeqCst);
    }
}

/// Full analysis over one heap: sweep candidates, build the reference graph,
/// extract root chains and render the report.
pub fn run_analysis<H: HeapScanner + Introspect + SizedObjects>(
    heap: &mut H,
    config: &AnalysisConfig,
    sink: &mut dyn ReportSink,
) -> Result<()> {
    let _guard = InProgressGuard::acquire()?;
    // tags must not leak into the next run even when this one errors out
    let result = analyze_inner(heap, config, sink);
    heap.clear_tags();
    result
}

fn analyze_inner<H: HeapScanner + Introspect + SizedObjects>(
    heap: &mut H,
    config: &AnalysisConfig,
    sink: &mut dyn ReportSink,
) -> Result<()> {
    let start = Instant::now();

    let candidates = sweep_candidates(heap, config)?;
    info!(
        "found {} leak candidates above {} elements",
        candidates.len(),
        config.size_threshold
    );
    if candidates.is_empty() {
        sink.open("analysis-report", &[])?;
        sink.close()?;
        return Ok(());
    }

    let mut store = GraphStore::new(candidates.len());
    let mut nodes = Vec::with_capacity(candidates.len());
    for (id, &(obj, count)) in candidates.iter().enumerate() {
        let node = store.create_node();
        let n = store.node_mut(node);
        n.obj = Some(obj);
        n.membership.add(id);
        n.leak_size = count;
        heap.set_tag(obj, node);
        nodes.push(node);
    }

    tag_classes(heap, &mut store, config)?;

    let passes = if config.max_passes > 0 {
        let mut builder = GraphBuilder::new(&mut store, config);
        builder.run(heap)
    } else {
        0
    };

    sink.open("analysis-report", &[])?;
    for (id, &node) in nodes.iter().enumerate() {
        resolve_node(&mut store, node, &*heap, &*heap)?;
        let chain = extract_chain(
            &mut store,
            &*heap,
            &*heap,
            node,
            id,
            config.consider_local_refs,
        )?;
        let class_name = store
            .node(node)
            .class_name
            .clone()
            .unwrap_or_else(|| UNKNOWN.to_string());
        let size = store.node(node).leak_size.to_string();
        match chain {
            Some(chain) => {
                sink.open("leaking-object", &[("class", &class_name), ("size", &size)])?;
                sink.open("reference-chain-to-root", &[])?;
                render_edges(&mut store, heap, sink, &chain)?;
                sink.close()?;
                sink.close()?;
            }
            // an unreported candidate is a configuration outcome, not a
            // failure
            None if config.show_unreachable => {
                sink.open("leaking-object", &[("class", &class_name), ("size", &size)])?;
                if config.max_passes > 0 {
                    sink.open("references", &[])?;
                    let edges: Vec<EdgeRecord> = store.node(node).inbound.to_vec();
                    render_edges(&mut store, heap, sink, &edges)?;
                    sink.close()?;
                }
                sink.close()?;
            }
            None => {
                debug!(
                    "suppressing candidate #{} ({}): no chain to a root",
                    id, class_name
                );
            }
        }
    }
    sink.close()?;

    info!(
        "analysis done: {} candidates, {} graph nodes, {} passes, {} ms",
        nodes.len(),
        store.len(),
        passes,
        start.elapsed().as_micros() as f64 / 1000f64
    );
    Ok(())
}

/// Container objects above the size threshold whose class is not ignored,
/// leak id = position.
fn sweep_candidates<H: Introspect + SizedObjects>(
    heap: &H,
    config: &AnalysisConfig,
) -> Result<Vec<(ObjRef, u64)>> {
    let mut candidates = Vec::new();
    for (obj, count) in heap.sized_objects() {
        if count <= config.size_threshold {
            continue;
        }
        if let Some(class) = heap.class_of(obj) {
            let name = heap.class_name(class)?;
            if config.ignore_classes.contains(&name) {
                debug!("skipping candidate of ignored class {}", name);
                continue;
            }
        }
        candidates.push((obj, count));
    }
    Ok(candidates)
}

/// One class node per loaded class, with any matching exclusion rules
/// resolved from field name to raw index and attached.
fn tag_classes<H: HeapScanner + Introspect>(
    heap: &mut H,
    store: &mut GraphStore,
    config: &AnalysisConfig,
) -> Result<()> {
    let classes = heap.loaded_classes();
    for class in classes {
        let name = heap.class_name(class)?;
        let node = store.create_class_node(class);
        if let Some(rules) = config.exclusions.get(&name) {
            for rule in rules {
                let index = field_index_by_name(&*heap, class, &rule.field)?;
                if index.is_none() {
                    warn!("exclusion field {}.{} is not declared", name, rule.field);
                }
                store.node_mut(node).excluded_fields.push(ExcludedField {
                    name: rule.field.clone(),
                    index,
                    threshold: rule.threshold,
                });
            }
        }
        heap.set_tag(class, node);
    }
    Ok(())
}

fn render_edges<H: HeapScanner + Introspect>(
    store: &mut GraphStore,
    heap: &H,
    sink: &mut dyn ReportSink,
    edges: &[EdgeRecord],
) -> Result<()> {
    let mut describer = Describer::new(store, heap, heap);
    for edge in edges {
        let location = describer.describe(edge)?;
        sink.leaf("reference", &[("location", &location)])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::XmlWriter;
    use crate::snapshot::SnapshotHeap;
    use std::sync::Mutex;

    // run_analysis holds process-wide state; keep these tests serial.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn heap_with_static_root() -> SnapshotHeap {
        let json = r#"{
            "classes": [
                {"id": 1, "name": "java.util.HashMap", "fields": []},
                {"id": 2, "name": "Registry", "fields": ["cache"],
                 "statics": [{"field": "cache", "target": 100}]}
            ],
            "objects": [
                {"id": 100, "class": 1, "element_count": 1000}
            ]
        }"#;
        SnapshotHeap::new(serde_json::from_str(json).unwrap()).unwrap()
    }

    fn run(heap: &mut SnapshotHeap, config: &AnalysisConfig) -> String {
        let mut sink = XmlWriter::new(Vec::new());
        run_analysis(heap, config, &mut sink).unwrap();
        String::from_utf8(sink.into_inner()).unwrap()
    }

    #[test]
    fn test_static_field_chain_end_to_end() {
        let _l = TEST_LOCK.lock().unwrap();
        let mut heap = heap_with_static_root();
        let config = AnalysisConfig {
            max_passes: 3,
            ..AnalysisConfig::default()
        };
        let out = run(&mut heap, &config);
        assert!(out.contains("<leaking-object class=\"java.util.HashMap\" size=\"1000\">"));
        assert!(out.contains("<reference-chain-to-root>"));
        assert!(out.contains("<reference location=\"Registry.cache (Static)\"/>"));
    }

    #[test]
    fn test_unreachable_candidate_suppressed_by_default() {
        let _l = TEST_LOCK.lock().unwrap();
        let json = r#"{
            "classes": [{"id": 1, "name": "java.util.ArrayList", "fields": []}],
            "objects": [{"id": 100, "class": 1, "element_count": 900}]
        }"#;
        let mut heap = SnapshotHeap::new(serde_json::from_str(json).unwrap()).unwrap();
        let config = AnalysisConfig {
            max_passes: 3,
            ..AnalysisConfig::default()
        };
        let out = run(&mut heap, &config);
        assert!(!out.contains("leaking-object"));

        heap.clear_tags();
        let config = AnalysisConfig {
            max_passes: 3,
            show_unreachable: true,
            ..AnalysisConfig::default()
        };
        let out = run(&mut heap, &config);
        assert!(out.contains("<leaking-object class=\"java.util.ArrayList\" size=\"900\">"));
        assert!(out.contains("<references>"));
    }

    #[test]
    fn test_unreachable_suppression_follows_toggle_alone() {
        // with no scan passes requested, suppression is still governed only
        // by the unreachable-display toggle
        let _l = TEST_LOCK.lock().unwrap();
        let json = r#"{
            "classes": [{"id": 1, "name": "java.util.ArrayList", "fields": []}],
            "objects": [{"id": 100, "class": 1, "element_count": 900}]
        }"#;
        let mut heap = SnapshotHeap::new(serde_json::from_str(json).unwrap()).unwrap();
        let out = run(&mut heap, &AnalysisConfig::default());
        assert!(!out.contains("leaking-object"));

        let config = AnalysisConfig {
            show_unreachable: true,
            ..AnalysisConfig::default()
        };
        let out = run(&mut heap, &config);
        assert!(out.contains("<leaking-object class=\"java.util.ArrayList\" size=\"900\">"));
        // no references were collected, so none are rendered
        assert!(!out.contains("<references>"));
    }

    #[test]
    fn test_ignored_class_not_a_candidate() {
        let _l = TEST_LOCK.lock().unwrap();
        let mut heap = heap_with_static_root();
        let mut config = AnalysisConfig {
            max_passes: 3,
            ..AnalysisConfig::default()
        };
        config
            .ignore_classes
            .insert("java.util.HashMap".to_string());
        let out = run(&mut heap, &config);
        assert!(!out.contains("leaking-object"));
    }

    #[test]
    fn test_threshold_filters_small_containers() {
        let _l = TEST_LOCK.lock().unwrap();
        let mut heap = heap_with_static_root();
        let config = AnalysisConfig {
            size_threshold: 1000, // not strictly above
            max_passes: 3,
            ..AnalysisConfig::default()
        };
        let out = run(&mut heap, &config);
        assert!(!out.contains("leaking-object"));
    }

    #[test]
    fn test_second_analysis_rejected_while_running() {
        let _l = TEST_LOCK.lock().unwrap();
        let guard = InProgressGuard::acquire().unwrap();
        let mut heap = heap_with_static_root();
        let mut sink = XmlWriter::new(Vec::new());
        let err = run_analysis(&mut heap, &AnalysisConfig::default(), &mut sink);
        assert!(err.is_err());
        drop(guard);
        // released: the next run goes through
        assert!(run_analysis(&mut heap, &AnalysisConfig::default(), &mut sink).is_ok());
    }

    #[test]
    fn test_failed_run_clears_tags() {
        // the referrer's class is missing from the snapshot, so rendering
        // its chain fails; the tags it installed must not survive the run
        let _l = TEST_LOCK.lock().unwrap();
        let json = r#"{
            "classes": [{"id": 1, "name": "java.util.HashMap", "fields": []}],
            "objects": [
                {"id": 100, "class": 1, "element_count": 1000},
                {"id": 200, "class": 77,
                 "refs": [{"kind": "field", "index": 0, "target": 100}]}
            ],
            "roots": [{"kind": "global", "target": 200}]
        }"#;
        let mut heap = SnapshotHeap::new(serde_json::from_str(json).unwrap()).unwrap();
        let config = AnalysisConfig {
            max_passes: 3,
            ..AnalysisConfig::default()
        };
        let mut sink = XmlWriter::new(Vec::new());
        assert!(run_analysis(&mut heap, &config, &mut sink).is_err());
        assert_eq!(heap.tag_of(100), None);
        assert_eq!(heap.tag_of(200), None);
        assert_eq!(heap.tag_of(1), None);
    }

    #[test]
    fn test_exclusion_rule_drops_static_chain() {
        let _l = TEST_LOCK.lock().unwrap();
        let mut heap = heap_with_static_root();
        let mut config = AnalysisConfig {
            max_passes: 3,
            ..AnalysisConfig::default()
        };
        config.add_exclusion("Registry.cache=5000").unwrap();
        let out = run(&mut heap, &config);
        // the only path to a root runs through the excluded static field
        assert!(!out.contains("leaking-object"));
    }
}
