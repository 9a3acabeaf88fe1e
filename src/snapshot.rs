use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::describe::field_index_by_name;
use crate::graph::NodeId;
use crate::heap::{
    ClassRef, HeapScanner, Introspect, MethodInfo, MethodRef, ObjRef, RefEvent, RefInfo, RefKind,
    Referrer, SizedObjects,
};

/// On-disk heap snapshot. Classes and objects share one id space, so a
/// static-field referrer is addressable through its class id.
#[derive(Debug, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub classes: Vec<ClassRec>,
    #[serde(default)]
    pub objects: Vec<ObjectRec>,
    #[serde(default)]
    pub roots: Vec<RootRec>,
    #[serde(default)]
    pub methods: Vec<MethodRec>,
}

#[derive(Debug, Deserialize)]
pub struct ClassRec {
    pub id: ClassRef,
    pub name: String,
    #[serde(default)]
    pub superclass: Option<ClassRef>,
    #[serde(default)]
    pub interfaces: Vec<ClassRef>,
    /// Declared instance and static field names, in declaration order.
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub statics: Vec<StaticRec>,
}

#[derive(Debug, Deserialize)]
pub struct StaticRec {
    pub field: String,
    pub target: ObjRef,
}

#[derive(Debug, Deserialize)]
pub struct ObjectRec {
    pub id: ObjRef,
    pub class: ClassRef,
    /// Present on containers only; the candidate sweep reads it.
    #[serde(default)]
    pub element_count: Option<u64>,
    #[serde(default)]
    pub refs: Vec<ObjRefRec>,
}

/// One outgoing reference from an object.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObjRefRec {
    Field { index: u32, target: ObjRef },
    Element { index: u32, target: ObjRef },
}

impl ObjRefRec {
    fn target(self) -> ObjRef {
        match self {
            ObjRefRec::Field { target, .. } | ObjRefRec::Element { target, .. } => target,
        }
    }
}

/// One reference from outside the object graph.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RootRec {
    StackLocal {
        target: ObjRef,
        thread: u64,
        method: MethodRef,
        slot: u32,
    },
    NativeLocal {
        target: ObjRef,
        thread: u64,
        #[serde(default)]
        method: Option<MethodRef>,
    },
    Global { target: ObjRef },
    SystemClass { target: ObjRef },
    Monitor { target: ObjRef },
    Thread { target: ObjRef },
    Other { target: ObjRef },
}

impl RootRec {
    fn target(self) -> ObjRef {
        match self {
            RootRec::StackLocal { target, .. }
            | RootRec::NativeLocal { target, .. }
            | RootRec::Global { target }
            | RootRec::SystemClass { target }
            | RootRec::Monitor { target }
            | RootRec::Thread { target }
            | RootRec::Other { target } => target,
        }
    }

    fn kind_and_info(self) -> (RefKind, RefInfo) {
        match self {
            RootRec::StackLocal {
                thread,
                method,
                slot,
                ..
            } => (
                RefKind::StackLocal,
                RefInfo::StackLocal {
                    thread_id: thread,
                    method,
                    slot,
                },
            ),
            RootRec::NativeLocal { thread, method, .. } => (
                RefKind::NativeLocal,
                RefInfo::NativeLocal {
                    thread_id: thread,
                    method,
                },
            ),
            RootRec::Global { .. } => (RefKind::Global, RefInfo::None),
            RootRec::SystemClass { .. } => (RefKind::SystemClass, RefInfo::None),
            RootRec::Monitor { .. } => (RefKind::Monitor, RefInfo::None),
            RootRec::Thread { .. } => (RefKind::Thread, RefInfo::None),
            RootRec::Other { .. } => (RefKind::Other, RefInfo::None),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MethodRec {
    pub id: MethodRef,
    pub name: String,
    pub signature: String,
    pub class: ClassRef,
    #[serde(default)]
    pub is_static: bool,
    #[serde(default)]
    pub arg_slots: u32,
}

/// A static field edge with its name already resolved to a raw field index.
#[derive(Clone, Copy, Debug)]
struct StaticEdge {
    class: ClassRef,
    index: u32,
    target: ObjRef,
}

/// Snapshot-backed implementation of the engine's heap collaborators.
pub struct SnapshotHeap {
    classes: Vec<ClassRec>,
    objects: Vec<ObjectRec>,
    roots: Vec<RootRec>,
    class_index: HashMap<ClassRef, usize>,
    object_class: HashMap<ObjRef, ClassRef>,
    methods: HashMap<MethodRef, MethodInfo>,
    statics: Vec<StaticEdge>,
    tags: HashMap<ObjRef, NodeId>,
    tagged: HashMap<NodeId, ObjRef>,
}

impl SnapshotHeap {
    pub fn from_path(path: &Path) -> Result<SnapshotHeap> {
        let file =
            File::open(path).with_context(|| format!("opening snapshot {}", path.display()))?;
        let snapshot: Snapshot = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing snapshot {}", path.display()))?;
        SnapshotHeap::new(snapshot)
    }

    pub fn new(snapshot: Snapshot) -> Result<SnapshotHeap> {
        let class_index = snapshot
            .classes
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id, i))
            .collect();
        let object_class = snapshot.objects.iter().map(|o| (o.id, o.class)).collect();
        let methods = snapshot
            .methods
            .into_iter()
            .map(|m| {
                (
                    m.id,
                    MethodInfo {
                        name: m.name,
                        signature: m.signature,
                        declaring_class: m.class,
                        is_static: m.is_static,
                        arg_slots: m.arg_slots,
                    },
                )
            })
            .collect();
        let mut heap = SnapshotHeap {
            classes: snapshot.classes,
            objects: snapshot.objects,
            roots: snapshot.roots,
            class_index,
            object_class,
            methods,
            statics: Vec::new(),
            tags: HashMap::new(),
            tagged: HashMap::new(),
        };
        let mut statics = Vec::new();
        for class in &heap.classes {
            for s in &class.statics {
                let index = field_index_by_name(&heap, class.id, &s.field)?
                    .ok_or_else(|| {
                        anyhow!("static field {}.{} is not declared", class.name, s.field)
                    })?;
                statics.push(StaticEdge {
                    class: class.id,
                    index,
                    target: s.target,
                });
            }
        }
        heap.statics = statics;
        Ok(heap)
    }

    fn class_rec(&self, class: ClassRef) -> Result<&ClassRec> {
        self.class_index
            .get(&class)
            .map(|&i| &self.classes[i])
            .ok_or_else(|| anyhow!("unknown class id {:#x}", class))
    }
}

impl HeapScanner for SnapshotHeap {
    fn set_tag(&mut self, obj: ObjRef, tag: NodeId) {
        self.tags.insert(obj, tag);
        self.tagged.insert(tag, obj);
    }

    fn tag_of(&self, obj: ObjRef) -> Option<NodeId> {
        self.tags.get(&obj).copied()
    }

    fn clear_tags(&mut self) {
        self.tags.clear();
        self.tagged.clear();
    }

    fn lookup_tagged(&self, tag: NodeId) -> Option<ObjRef> {
        self.tagged.get(&tag).copied()
    }

    fn scan(&mut self, visitor: &mut dyn FnMut(RefEvent) -> Option<NodeId>) {
        // objects in snapshot order, then class statics, then roots
        for i in 0..self.objects.len() {
            let obj = self.objects[i].id;
            let class = self.objects[i].class;
            for j in 0..self.objects[i].refs.len() {
                let r = self.objects[i].refs[j];
                let Some(target) = self.tags.get(&r.target()).copied() else {
                    continue;
                };
                let (kind, info) = match r {
                    ObjRefRec::Field { index, .. } => (RefKind::Field, RefInfo::Field { index }),
                    ObjRefRec::Element { index, .. } => {
                        (RefKind::ArrayElement, RefInfo::Array { index })
                    }
                };
                let referrer = match self.tags.get(&obj).copied() {
                    Some(tag) => Referrer::Tagged(tag),
                    None => Referrer::Untagged(obj),
                };
                let ev = RefEvent {
                    kind,
                    info,
                    target,
                    referrer_class: self.tags.get(&class).copied(),
                    referrer,
                };
                if let Some(tag) = visitor(ev) {
                    self.set_tag(obj, tag);
                }
            }
        }
        for i in 0..self.statics.len() {
            let s = self.statics[i];
            let Some(target) = self.tags.get(&s.target).copied() else {
                continue;
            };
            let Some(class_tag) = self.tags.get(&s.class).copied() else {
                continue;
            };
            let ev = RefEvent {
                kind: RefKind::StaticField,
                info: RefInfo::Field { index: s.index },
                target,
                referrer_class: None,
                referrer: Referrer::Tagged(class_tag),
            };
            visitor(ev);
        }
        for i in 0..self.roots.len() {
            let root = self.roots[i];
            let Some(target) = self.tags.get(&root.target()).copied() else {
                continue;
            };
            let (kind, info) = root.kind_and_info();
            let ev = RefEvent {
                kind,
                info,
                target,
                referrer_class: None,
                referrer: Referrer::Root,
            };
            visitor(ev);
        }
    }
}

impl Introspect for SnapshotHeap {
    fn loaded_classes(&self) -> Vec<ClassRef> {
        self.classes.iter().map(|c| c.id).collect()
    }

    fn class_of(&self, obj: ObjRef) -> Option<ClassRef> {
        self.object_class.get(&obj).copied()
    }

    fn class_name(&self, class: ClassRef) -> Result<String> {
        Ok(self.class_rec(class)?.name.clone())
    }

    fn declared_field_names(&self, class: ClassRef) -> Result<Vec<String>> {
        Ok(self.class_rec(class)?.fields.clone())
    }

    fn implemented_interfaces(&self, class: ClassRef) -> Result<Vec<ClassRef>> {
        Ok(self.class_rec(class)?.interfaces.clone())
    }

    fn superclass(&self, class: ClassRef) -> Option<ClassRef> {
        self.class_rec(class).ok().and_then(|c| c.superclass)
    }

    fn method_info(&self, method: MethodRef) -> Option<MethodInfo> {
        self.methods.get(&method).cloned()
    }
}

impl SizedObjects for SnapshotHeap {
    fn sized_objects(&self) -> Vec<(ObjRef, u64)> {
        self.objects
            .iter()
            .filter_map(|o| o.element_count.map(|n| (o.id, n)))
            .collect()
    }
}
