#[macro_use]
extern crate log;

mod analyze;
mod bitmap;
mod builder;
mod chain;
mod config;
mod describe;
mod graph;
mod heap;
mod report;
mod snapshot;

pub use crate::analyze::run_analysis;
pub use crate::bitmap::LeakBitmap;
pub use crate::builder::{GraphBuilder, PassState};
pub use crate::chain::extract_chain;
pub use crate::config::{AnalysisConfig, ExclusionRule};
pub use crate::describe::{Describer, UNKNOWN};
pub use crate::graph::{EdgeRecord, ExcludedField, GraphStore, Node, NodeId};
pub use crate::heap::{
    ClassRef, HeapScanner, Introspect, MethodInfo, MethodRef, ObjRef, RefEvent, RefInfo, RefKind,
    Referrer, SizedObjects,
};
pub use crate::report::{ReportSink, XmlWriter};
pub use crate::snapshot::{
    ClassRec, MethodRec, ObjRefRec, ObjectRec, RootRec, Snapshot, SnapshotHeap, StaticRec,
};
