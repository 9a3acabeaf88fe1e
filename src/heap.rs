use anyhow::Result;

use crate::graph::NodeId;

/// Opaque runtime handle to a heap object.
pub type ObjRef = u64;
/// Opaque runtime handle to a class. Classes live in the same handle space as
/// objects, so a static-field referrer resolves through its class tag.
pub type ClassRef = u64;
/// Opaque runtime handle to a method.
pub type MethodRef = u64;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RefKind {
    StaticField,
    Field,
    ArrayElement,
    ConstantPool,
    StackLocal,
    NativeLocal,
    Global,
    SystemClass,
    Monitor,
    Thread,
    Other,
}

impl RefKind {
    /// A root reference keeps its target reachable independent of other
    /// objects; expansion below the target stops once one is recorded.
    pub fn is_root(self) -> bool {
        !matches!(self, RefKind::Field | RefKind::ArrayElement)
    }

    /// Stack and native locals, excludable from chain search by configuration.
    pub fn is_local(self) -> bool {
        matches!(self, RefKind::StackLocal | RefKind::NativeLocal)
    }
}

/// Kind-specific reference metadata.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum RefInfo {
    #[default]
    None,
    Field {
        index: u32,
    },
    Array {
        index: u32,
    },
    ConstantPool {
        index: u32,
    },
    StackLocal {
        thread_id: u64,
        method: MethodRef,
        slot: u32,
    },
    NativeLocal {
        thread_id: u64,
        method: Option<MethodRef>,
    },
}

impl RefInfo {
    pub fn thread_id(&self) -> Option<u64> {
        match *self {
            RefInfo::StackLocal { thread_id, .. } | RefInfo::NativeLocal { thread_id, .. } => {
                Some(thread_id)
            }
            _ => None,
        }
    }
}

/// The origin side of a scanned reference.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Referrer {
    /// Reference from outside the object graph (stack slot, native handle...).
    Root,
    /// Referring object already carries a node tag.
    Tagged(NodeId),
    /// Referring object exists but has no tag yet. The visitor may return a
    /// fresh tag for it.
    Untagged(ObjRef),
}

/// One reference reported by the heap enumeration, target already tagged.
#[derive(Clone, Copy, Debug)]
pub struct RefEvent {
    pub kind: RefKind,
    pub info: RefInfo,
    pub target: NodeId,
    /// Tag carried by the referring object's class, when known.
    pub referrer_class: Option<NodeId>,
    pub referrer: Referrer,
}

/// Heap-enumeration collaborator.
///
/// `scan` invokes the visitor once per reference whose target carries a tag.
/// Each object contributes its outgoing references at most once per scan, in
/// no guaranteed order; a tag returned by the visitor for an `Untagged`
/// referrer must be recorded so later scans observe it. The walked graph is
/// internally consistent for the duration of each scan.
pub trait HeapScanner {
    fn set_tag(&mut self, obj: ObjRef, tag: NodeId);
    fn tag_of(&self, obj: ObjRef) -> Option<NodeId>;
    fn clear_tags(&mut self);
    /// Reverse tag lookup; `None` means the object vanished since tagging.
    fn lookup_tagged(&self, tag: NodeId) -> Option<ObjRef>;
    fn scan(&mut self, visitor: &mut dyn FnMut(RefEvent) -> Option<NodeId>);
}

/// Candidate sweep collaborator: the containers the heap can report a size
/// for, as (object, element count) pairs.
pub trait SizedObjects {
    fn sized_objects(&self) -> Vec<(ObjRef, u64)>;
}

#[derive(Clone, Debug)]
pub struct MethodInfo {
    pub name: String,
    pub signature: String,
    pub declaring_class: ClassRef,
    pub is_static: bool,
    /// Number of argument words, including the receiver for instance methods.
    pub arg_slots: u32,
}

/// Class/field/method introspection collaborator.
///
/// The `Result`-returning operations are required: a heap that cannot be
/// fully introspected cannot be reasoned about, so those errors abort the
/// run. Optional lookups return `Option` and degrade to an unknown sentinel
/// at render time.
pub trait Introspect {
    fn loaded_classes(&self) -> Vec<ClassRef>;
    fn class_of(&self, obj: ObjRef) -> Option<ClassRef>;
    fn class_name(&self, class: ClassRef) -> Result<String>;
    /// Declared (non-inherited) field names, in declaration order.
    fn declared_field_names(&self, class: ClassRef) -> Result<Vec<String>>;
    /// Directly implemented interfaces.
    fn implemented_interfaces(&self, class: ClassRef) -> Result<Vec<ClassRef>>;
    fn superclass(&self, class: ClassRef) -> Option<ClassRef>;
    fn method_info(&self, method: MethodRef) -> Option<MethodInfo>;
}
