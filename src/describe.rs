use std::collections::HashSet;

use anyhow::Result;

use crate::graph::{EdgeRecord, GraphStore, NodeId};
use crate::heap::{ClassRef, HeapScanner, Introspect, RefInfo, RefKind};

pub const UNKNOWN: &str = "<Unknown>";

/// Fill a node's object handle and class name, lazily. The object is looked
/// up by its tag; an object that vanished since tagging marks the node dead.
/// A required class-name lookup failure is non-recoverable.
pub fn resolve_node(
    store: &mut GraphStore,
    id: NodeId,
    heap: &dyn HeapScanner,
    intro: &dyn Introspect,
) -> Result<()> {
    {
        let node = store.node(id);
        if node.resolved || node.dead {
            return Ok(());
        }
    }
    if store.node(id).obj.is_none() {
        match heap.lookup_tagged(id) {
            Some(obj) => store.node_mut(id).obj = Some(obj),
            None => {
                store.node_mut(id).dead = true;
                return Ok(());
            }
        }
    }
    let obj = store.node(id).obj.unwrap();
    if store.node(id).is_class {
        let name = intro.class_name(obj)?;
        store.node_mut(id).class_name = Some(name);
    } else {
        match intro.class_of(obj) {
            Some(class) => {
                let name = intro.class_name(class)?;
                let node = store.node_mut(id);
                node.class = Some(class);
                node.class_name = Some(name);
            }
            None => {
                warn!("object {:#x} has no resolvable class", obj);
            }
        }
    }
    store.node_mut(id).resolved = true;
    Ok(())
}

/// Resolve a raw field index to a declared name by walking the inheritance
/// chain: fields of transitively implemented interfaces are numbered once
/// (not once per implementor) and are subtracted first, superclass fields
/// come before subclass fields. `None` means the index does not land on a
/// declared field anywhere on the chain.
pub fn field_name_by_index(
    intro: &dyn Introspect,
    class: ClassRef,
    index: u32,
) -> Result<Option<String>> {
    let mut idx = index as i64;
    let mut seen = HashSet::new();
    name_by_index_inner(intro, class, &mut idx, &mut seen)
}

fn name_by_index_inner(
    intro: &dyn Introspect,
    class: ClassRef,
    idx: &mut i64,
    seen: &mut HashSet<ClassRef>,
) -> Result<Option<String>> {
    subtract_interface_fields(intro, class, idx, seen)?;
    if let Some(superclass) = intro.superclass(class) {
        if let Some(name) = name_by_index_inner(intro, superclass, idx, seen)? {
            return Ok(Some(name));
        }
    }
    let fields = intro.declared_field_names(class)?;
    if *idx < 0 {
        warn!("field index underflow ({}) in class {:#x}", idx, class);
        return Ok(None);
    }
    if (*idx as usize) < fields.len() {
        return Ok(Some(fields[*idx as usize].clone()));
    }
    *idx -= fields.len() as i64;
    Ok(None)
}

fn subtract_interface_fields(
    intro: &dyn Introspect,
    class: ClassRef,
    idx: &mut i64,
    seen: &mut HashSet<ClassRef>,
) -> Result<()> {
    for interface in intro.implemented_interfaces(class)? {
        if !seen.insert(interface) {
            continue;
        }
        subtract_interface_fields(intro, interface, idx, seen)?;
        *idx -= intro.declared_field_names(interface)?.len() as i64;
    }
    Ok(())
}

/// Inverse mapping: the raw index a field name resolves to, used when
/// exclusion rules are attached to class nodes.
pub fn field_index_by_name(
    intro: &dyn Introspect,
    class: ClassRef,
    name: &str,
) -> Result<Option<u32>> {
    let mut idx = 0i64;
    let mut seen = HashSet::new();
    if index_by_name_inner(intro, class, name, &mut idx, &mut seen)? {
        Ok(Some(idx as u32))
    } else {
        Ok(None)
    }
}

fn index_by_name_inner(
    intro: &dyn Introspect,
    class: ClassRef,
    name: &str,
    idx: &mut i64,
    seen: &mut HashSet<ClassRef>,
) -> Result<bool> {
    let mut interface_fields = 0i64;
    subtract_interface_fields(intro, class, &mut interface_fields, seen)?;
    *idx -= interface_fields;
    if let Some(superclass) = intro.superclass(class) {
        if index_by_name_inner(intro, superclass, name, idx, seen)? {
            return Ok(true);
        }
    }
    let fields = intro.declared_field_names(class)?;
    for (i, field) in fields.iter().enumerate() {
        if field == name {
            *idx += i as i64;
            return Ok(true);
        }
    }
    *idx += fields.len() as i64;
    Ok(false)
}

/// Renders a recorded edge into a human-readable location.
pub struct Describer<'a> {
    store: &'a mut GraphStore,
    heap: &'a dyn HeapScanner,
    intro: &'a dyn Introspect,
}

impl<'a> Describer<'a> {
    pub fn new(
        store: &'a mut GraphStore,
        heap: &'a dyn HeapScanner,
        intro: &'a dyn Introspect,
    ) -> Describer<'a> {
        Describer { store, heap, intro }
    }

    pub fn describe(&mut self, edge: &EdgeRecord) -> Result<String> {
        if let Some(referrer) = edge.referrer {
            resolve_node(self.store, referrer, self.heap, self.intro)?;
        }
        let msg = match edge.kind {
            RefKind::StaticField => {
                let class_name = self.referrer_class_name(edge);
                let field = match (self.referrer_class(edge), edge.info) {
                    (Some(class), RefInfo::Field { index }) => {
                        field_name_by_index(self.intro, class, index)?
                    }
                    _ => None,
                };
                format!(
                    "{}.{} (Static)",
                    class_name,
                    field.as_deref().unwrap_or(UNKNOWN)
                )
            }
            RefKind::Field => {
                let class_name = self.referrer_class_name(edge);
                let field = match (self.referrer_class(edge), edge.info) {
                    (Some(class), RefInfo::Field { index }) => {
                        field_name_by_index(self.intro, class, index)?
                    }
                    _ => None,
                };
                format!("{}.{}", class_name, field.as_deref().unwrap_or(UNKNOWN))
            }
            RefKind::ArrayElement => {
                let index = match edge.info {
                    RefInfo::Array { index } => index as i64,
                    _ => -1,
                };
                format!("{} element number {}", self.referrer_class_name(edge), index)
            }
            RefKind::ConstantPool => match edge.info {
                RefInfo::ConstantPool { index } => format!("#{}", index),
                _ => format!("#{}", UNKNOWN),
            },
            RefKind::StackLocal => self.describe_stack_local(edge)?,
            RefKind::NativeLocal => self.describe_native_local(edge),
            RefKind::Global => "Global heap root reference".to_string(),
            RefKind::SystemClass => "System class heap root reference".to_string(),
            RefKind::Monitor => "Monitor heap root reference".to_string(),
            RefKind::Thread => "Thread heap root reference".to_string(),
            RefKind::Other => "Unknown heap root reference".to_string(),
        };
        Ok(msg)
    }

    fn describe_stack_local(&self, edge: &EdgeRecord) -> Result<String> {
        let RefInfo::StackLocal {
            thread_id,
            method,
            slot,
        } = edge.info
        else {
            return Ok(format!(
                "Stack local variable from unknown method ({})",
                UNKNOWN
            ));
        };
        let Some(info) = self.intro.method_info(method) else {
            return Ok(format!(
                "Local variable from unknown method (thread ID {:x})",
                thread_id
            ));
        };
        let class_name = self.intro.class_name(info.declaring_class)?;
        if !info.is_static && slot == 0 {
            return Ok(format!(
                "'this' reference on invocation of method {}.{}{} (thread ID {:x})",
                class_name, info.name, info.signature, thread_id
            ));
        }
        if slot < info.arg_slots {
            Ok(format!(
                "Argument number {} for method invocation of {}.{}{} (thread ID {:x})",
                slot, class_name, info.name, info.signature, thread_id
            ))
        } else {
            Ok(format!(
                "Local variable from method {}.{}{} (thread ID {:x}, local arg #{})",
                class_name,
                info.name,
                info.signature,
                thread_id,
                slot - info.arg_slots
            ))
        }
    }

    fn describe_native_local(&self, edge: &EdgeRecord) -> String {
        let RefInfo::NativeLocal { thread_id, method } = edge.info else {
            return format!("Native local variable from unknown method ({})", UNKNOWN);
        };
        match method.and_then(|m| self.intro.method_info(m)) {
            Some(info) => format!(
                "Native local variable from method {}{} (thread ID {:x})",
                info.name, info.signature, thread_id
            ),
            None => format!(
                "Native local variable from unknown method (thread ID {:x})",
                thread_id
            ),
        }
    }

    fn referrer_class(&self, edge: &EdgeRecord) -> Option<ClassRef> {
        edge.referrer.and_then(|id| self.store.node(id).class)
    }

    fn referrer_class_name(&self, edge: &EdgeRecord) -> String {
        edge.referrer
            .and_then(|id| self.store.node(id).class_name.clone())
            .unwrap_or_else(|| UNKNOWN.to_string())
    }
}
