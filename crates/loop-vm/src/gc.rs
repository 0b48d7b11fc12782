//! The heap: object storage, the intern set, the module registry, and the
//! tracing mark-sweep collector (§4.2, §4.4).
//!
//! Object identity is reference identity (§3's "Object equality is
//! reference identity"). Rather than model that with raw pointers, heap
//! objects live in a slot arena and are referenced by [`ObjId`], an opaque
//! index — two `ObjId`s compare equal exactly when they name the same slot,
//! which is what "reference identity" means here. The heap's "singly
//! linked list of all managed objects" (§4.2) is realized as an intrusive
//! chain of `next` links through those slots, walked by [`Heap::sweep`]
//! exactly as the spec describes, rather than by iterating the arena
//! directly — that keeps sweep cost proportional to live+dead objects
//! actually linked in, not to the arena's high-water mark.

use tracing::trace;

use crate::error::VmError;
use crate::table::Table;
use crate::value::{
    string::fnv1a, ObjBoundMethod, ObjClass, ObjClosure, ObjDictionary, ObjFunction, ObjInstance,
    ObjList, ObjModule, ObjString, ObjUpvalue, UpvalueLocation, Value,
};

/// Heap growth factor applied to `next_gc` after every collection (§4.4).
pub const HEAP_GROW_FACTOR: usize = 2;
/// Baseline allocation threshold before the first collection, matching the
/// original implementation's `1024 * 1024` starting pace.
pub const INITIAL_NEXT_GC: usize = 1024 * 1024;

/// An opaque reference to a heap-allocated object. Two `ObjId`s are equal
/// iff they name the same object — this is what gives `Value::Object`
/// reference-identity equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjId(usize);

/// The nine object variants (§3). `Function` and `Module` are boxed to keep
/// the enum's stack footprint close to its smaller variants.
#[derive(Debug, Clone)]
pub enum Obj {
    String(ObjString),
    Function(Box<ObjFunction>),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Module(Box<ObjModule>),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
    Dictionary(ObjDictionary),
    List(ObjList),
}

/// The type tag half of the object header (§3); the other half (mark bit,
/// next-pointer) lives alongside the payload in [`HeapObject`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjKind {
    String,
    Function,
    Closure,
    Upvalue,
    Module,
    Class,
    Instance,
    BoundMethod,
    Dictionary,
    List,
}

impl ObjKind {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ObjKind::String => "String",
            ObjKind::Function => "Function",
            ObjKind::Closure => "Closure",
            ObjKind::Upvalue => "Upvalue",
            ObjKind::Module => "Module",
            ObjKind::Class => "Class",
            ObjKind::Instance => "Instance",
            ObjKind::BoundMethod => "BoundMethod",
            ObjKind::Dictionary => "Dictionary",
            ObjKind::List => "List",
        }
    }
}

impl Obj {
    fn kind(&self) -> ObjKind {
        match self {
            Obj::String(_) => ObjKind::String,
            Obj::Function(_) => ObjKind::Function,
            Obj::Closure(_) => ObjKind::Closure,
            Obj::Upvalue(_) => ObjKind::Upvalue,
            Obj::Module(_) => ObjKind::Module,
            Obj::Class(_) => ObjKind::Class,
            Obj::Instance(_) => ObjKind::Instance,
            Obj::BoundMethod(_) => ObjKind::BoundMethod,
            Obj::Dictionary(_) => ObjKind::Dictionary,
            Obj::List(_) => ObjKind::List,
        }
    }

    /// Rough per-object cost fed into `bytes_allocated`. Not an exact
    /// `size_of`-of-owned-storage accounting; close enough to pace GC
    /// cycles sensibly, which is all `bytes_allocated`/`next_gc` are for.
    fn approx_size(&self) -> usize {
        match self {
            Obj::String(s) => std::mem::size_of::<ObjString>() + s.bytes.len(),
            Obj::Function(f) => std::mem::size_of::<ObjFunction>() + f.chunk.code.len(),
            Obj::Closure(c) => {
                std::mem::size_of::<ObjClosure>() + c.upvalues.len() * std::mem::size_of::<ObjId>()
            }
            Obj::Upvalue(_) => std::mem::size_of::<ObjUpvalue>(),
            Obj::Module(m) => std::mem::size_of::<ObjModule>() + m.globals.len() * std::mem::size_of::<Value>(),
            Obj::Class(_) => std::mem::size_of::<ObjClass>(),
            Obj::Instance(_) => std::mem::size_of::<ObjInstance>(),
            Obj::BoundMethod(_) => std::mem::size_of::<ObjBoundMethod>(),
            Obj::Dictionary(_) => std::mem::size_of::<ObjDictionary>(),
            Obj::List(l) => std::mem::size_of::<ObjList>() + l.items.len() * std::mem::size_of::<Value>(),
        }
    }
}

struct HeapObject {
    marked: bool,
    next: Option<ObjId>,
    data: Obj,
}

/// Owns every heap-allocated Loop value, the weak string/module tables, and
/// the mark-sweep collector's pacing state. The collector's root
/// enumeration (mark-roots, phase 1 of §4.4) is intentionally *not* here —
/// it needs the VM's stack/frames/handlers/open-upvalues, so `Vm` drives
/// that phase and calls into `Heap` for the rest (propagate, weak-prune,
/// sweep, re-pace).
pub struct Heap {
    slots: Vec<Option<HeapObject>>,
    free_slots: Vec<usize>,
    head: Option<ObjId>,
    bytes_allocated: usize,
    next_gc: usize,
    stress: bool,
    /// Guards against collecting while the loader is building a module's
    /// object graph before it is rooted (§4.4). Set once script execution
    /// begins; cleared around module loading.
    pub enabled: bool,
    pub strings: Table,
    pub modules: Table,
}

impl Heap {
    #[must_use]
    pub fn new(stress: bool) -> Self {
        Heap {
            slots: Vec::new(),
            free_slots: Vec::new(),
            head: None,
            bytes_allocated: 0,
            next_gc: INITIAL_NEXT_GC,
            stress,
            enabled: false,
            strings: Table::new(),
            modules: Table::new(),
        }
    }

    fn slot(&self, id: ObjId) -> &HeapObject {
        self.slots[id.0]
            .as_ref()
            .expect("dangling ObjId: object already freed")
    }

    fn slot_mut(&mut self, id: ObjId) -> &mut HeapObject {
        self.slots[id.0]
            .as_mut()
            .expect("dangling ObjId: object already freed")
    }

    /// Allocates `obj`, threading it onto the front of the intrusive object
    /// list. Returns whether `bytes_allocated` grew, which feeds the
    /// stress-mode GC trigger check the caller performs around this call.
    pub fn alloc(&mut self, obj: Obj) -> ObjId {
        let size = obj.approx_size();
        let heap_obj = HeapObject {
            marked: false,
            next: self.head,
            data: obj,
        };

        let id = if let Some(index) = self.free_slots.pop() {
            self.slots[index] = Some(heap_obj);
            ObjId(index)
        } else {
            self.slots.push(Some(heap_obj));
            ObjId(self.slots.len() - 1)
        };

        self.head = Some(id);
        self.bytes_allocated += size;
        id
    }

    #[must_use]
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    #[must_use]
    pub fn next_gc(&self) -> usize {
        self.next_gc
    }

    /// Whether an allocation of this shape should trigger a collection
    /// before the caller proceeds (§4.2): in stress mode, always (after the
    /// fact, any growth counts); otherwise only once the threshold is
    /// crossed.
    #[must_use]
    pub fn should_collect(&self) -> bool {
        self.enabled && (self.stress || self.bytes_allocated > self.next_gc)
    }

    #[must_use]
    pub fn kind_of(&self, id: ObjId) -> ObjKind {
        self.slot(id).data.kind()
    }

    #[must_use]
    pub fn is_marked(&self, id: ObjId) -> bool {
        self.slot(id).marked
    }

    /// Phase 2 primitive: marks `id` and, if newly marked, pushes it onto
    /// the gray worklist for later traversal.
    pub fn mark(&mut self, id: ObjId, gray_stack: &mut Vec<ObjId>) {
        if self.slot(id).marked {
            return;
        }
        self.slot_mut(id).marked = true;
        gray_stack.push(id);
    }

    pub fn mark_value(&mut self, value: Value, gray_stack: &mut Vec<ObjId>) {
        if let Value::Object(id) = value {
            self.mark(id, gray_stack);
        }
    }

    fn mark_table(&mut self, table: &Table, gray_stack: &mut Vec<ObjId>) {
        let entries: Vec<(Value, Value)> = table.iter().collect();
        for (key, value) in entries {
            self.mark_value(key, gray_stack);
            self.mark_value(value, gray_stack);
        }
    }

    /// Phase 2: traces every object directly reachable from `id`, marking
    /// as it goes. Called once per pop off the gray worklist.
    pub fn trace(&mut self, id: ObjId, gray_stack: &mut Vec<ObjId>) {
        match &self.slot(id).data {
            Obj::String(_) => {}
            Obj::Function(f) => {
                let module = f.module;
                let name = f.name;
                let constants = f.chunk.constants.clone();
                self.mark(module, gray_stack);
                self.mark(name, gray_stack);
                for value in constants {
                    self.mark_value(value, gray_stack);
                }
            }
            Obj::Closure(c) => {
                let function = c.function;
                let upvalues = c.upvalues.clone();
                self.mark(function, gray_stack);
                for upvalue in upvalues {
                    self.mark(upvalue, gray_stack);
                }
            }
            Obj::Upvalue(u) => {
                if let UpvalueLocation::Closed(value) = &u.location {
                    let value = *value;
                    self.mark_value(value, gray_stack);
                }
            }
            Obj::Module(m) => {
                let name = m.name;
                let parent_dir = m.parent_dir;
                let script_function = m.script_function;
                let globals = m.globals.clone();
                let exports = m.exports.clone();
                self.mark(name, gray_stack);
                self.mark(parent_dir, gray_stack);
                if let Some(script_function) = script_function {
                    self.mark(script_function, gray_stack);
                }
                for value in globals {
                    self.mark_value(value, gray_stack);
                }
                self.mark_table(&exports, gray_stack);
            }
            Obj::Class(c) => {
                let module = c.module;
                let name = c.name;
                let super_class = c.super_class;
                let methods = c.methods.clone();
                self.mark(module, gray_stack);
                self.mark(name, gray_stack);
                if let Some(super_class) = super_class {
                    self.mark(super_class, gray_stack);
                }
                self.mark_table(&methods, gray_stack);
            }
            Obj::Instance(i) => {
                let class = i.class;
                let fields = i.fields.clone();
                self.mark(class, gray_stack);
                self.mark_table(&fields, gray_stack);
            }
            Obj::BoundMethod(b) => {
                self.mark(b.receiver, gray_stack);
                self.mark(b.method, gray_stack);
            }
            Obj::Dictionary(d) => {
                let entries = d.entries.clone();
                self.mark_table(&entries, gray_stack);
            }
            Obj::List(l) => {
                let items = l.items.clone();
                for value in items {
                    self.mark_value(value, gray_stack);
                }
            }
        }
    }

    /// Phase 3: deletes entries whose key object is unmarked from both weak
    /// tables. Must run before sweep so the objects they were the only
    /// reference to are actually collected this cycle.
    pub fn prune_weak_tables(&mut self) {
        let mut strings = std::mem::take(&mut self.strings);
        strings.remove_white(self);
        self.strings = strings;

        let mut modules = std::mem::take(&mut self.modules);
        modules.remove_white(self);
        self.modules = modules;
    }

    /// Phase 4: walks the intrusive object list, freeing unmarked nodes and
    /// clearing the mark bit on survivors. Returns bytes reclaimed.
    pub fn sweep(&mut self) -> usize {
        let mut freed_bytes = 0;
        let mut current = self.head;
        let mut previous: Option<ObjId> = None;

        while let Some(id) = current {
            let next = self.slot(id).next;

            if self.slot(id).marked {
                self.slot_mut(id).marked = false;
                previous = Some(id);
            } else {
                freed_bytes += self.slot(id).data.approx_size();
                match previous {
                    Some(prev) => self.slot_mut(prev).next = next,
                    None => self.head = next,
                }
                self.slots[id.0] = None;
                self.free_slots.push(id.0);
            }

            current = next;
        }

        self.bytes_allocated = self.bytes_allocated.saturating_sub(freed_bytes);
        freed_bytes
    }

    /// Phase 5: re-paces the next collection threshold.
    pub fn repace(&mut self) {
        self.next_gc = self.bytes_allocated * HEAP_GROW_FACTOR;
        trace!(bytes_allocated = self.bytes_allocated, next_gc = self.next_gc, "gc repaced");
    }

    /// Substring construction (§4.3): handles the empty-range and
    /// full-range aliasing cases before falling through to a fresh
    /// allocation + re-intern, mirroring the original's `ObjectStringSub`.
    pub fn substring(&mut self, id: ObjId, start: usize, end: usize) -> Result<ObjId, VmError> {
        let source = self.as_string(id)?;
        if start >= end {
            return Ok(self.intern_string(Vec::new()));
        }
        if start == 0 && end == source.bytes.len() {
            return Ok(id);
        }
        let bytes = source.bytes[start..end].to_vec();
        Ok(self.intern_string(bytes))
    }

    /// String concatenation (§4.3): allocates `left`'s bytes followed by
    /// `right`'s and re-interns the result.
    pub fn concat_strings(&mut self, left: ObjId, right: ObjId) -> Result<ObjId, VmError> {
        let mut bytes = self.as_string(left)?.bytes.clone();
        bytes.extend_from_slice(&self.as_string(right)?.bytes);
        Ok(self.intern_string(bytes))
    }

    /// Interns `bytes`, returning the existing string object if one with
    /// identical content already exists, or allocating and registering a
    /// new one otherwise (§4.3).
    pub fn intern_string(&mut self, bytes: Vec<u8>) -> ObjId {
        let hash = fnv1a(&bytes);
        if let Some(id) = self.strings.find_string(self, &bytes, hash) {
            return id;
        }

        let id = self.alloc(Obj::String(ObjString { bytes, hash }));
        let mut strings = std::mem::take(&mut self.strings);
        strings
            .set(self, Value::Object(id), Value::Bool(true))
            .expect("interning a fresh string key cannot fail to hash");
        self.strings = strings;
        id
    }

    pub fn register_module(&mut self, path: ObjId, module: ObjId) {
        let mut modules = std::mem::take(&mut self.modules);
        modules
            .set(self, Value::Object(path), Value::Object(module))
            .expect("registering a module path cannot fail to hash");
        self.modules = modules;
    }

    #[must_use]
    pub fn lookup_module(&self, path: ObjId) -> Option<ObjId> {
        match self.modules.get(self, Value::Object(path)) {
            Ok(Some(Value::Object(module))) => Some(module),
            _ => None,
        }
    }

    pub fn as_string(&self, id: ObjId) -> Result<&ObjString, VmError> {
        match &self.slot(id).data {
            Obj::String(s) => Ok(s),
            other => Err(type_mismatch("String", other)),
        }
    }

    pub fn as_function(&self, id: ObjId) -> Result<&ObjFunction, VmError> {
        match &self.slot(id).data {
            Obj::Function(f) => Ok(f),
            other => Err(type_mismatch("Function", other)),
        }
    }

    pub fn as_closure(&self, id: ObjId) -> Result<&ObjClosure, VmError> {
        match &self.slot(id).data {
            Obj::Closure(c) => Ok(c),
            other => Err(type_mismatch("Closure", other)),
        }
    }

    pub fn as_upvalue(&self, id: ObjId) -> Result<&ObjUpvalue, VmError> {
        match &self.slot(id).data {
            Obj::Upvalue(u) => Ok(u),
            other => Err(type_mismatch("Upvalue", other)),
        }
    }

    pub fn as_upvalue_mut(&mut self, id: ObjId) -> Result<&mut ObjUpvalue, VmError> {
        match &mut self.slot_mut(id).data {
            Obj::Upvalue(u) => Ok(u),
            other => Err(type_mismatch("Upvalue", &*other)),
        }
    }

    pub fn as_module(&self, id: ObjId) -> Result<&ObjModule, VmError> {
        match &self.slot(id).data {
            Obj::Module(m) => Ok(m),
            other => Err(type_mismatch("Module", other)),
        }
    }

    pub fn as_module_mut(&mut self, id: ObjId) -> Result<&mut ObjModule, VmError> {
        match &mut self.slot_mut(id).data {
            Obj::Module(m) => Ok(m),
            other => Err(type_mismatch("Module", &*other)),
        }
    }

    pub fn as_class(&self, id: ObjId) -> Result<&ObjClass, VmError> {
        match &self.slot(id).data {
            Obj::Class(c) => Ok(c),
            other => Err(type_mismatch("Class", other)),
        }
    }

    pub fn as_class_mut(&mut self, id: ObjId) -> Result<&mut ObjClass, VmError> {
        match &mut self.slot_mut(id).data {
            Obj::Class(c) => Ok(c),
            other => Err(type_mismatch("Class", &*other)),
        }
    }

    pub fn as_instance(&self, id: ObjId) -> Result<&ObjInstance, VmError> {
        match &self.slot(id).data {
            Obj::Instance(i) => Ok(i),
            other => Err(type_mismatch("Instance", other)),
        }
    }

    pub fn as_instance_mut(&mut self, id: ObjId) -> Result<&mut ObjInstance, VmError> {
        match &mut self.slot_mut(id).data {
            Obj::Instance(i) => Ok(i),
            other => Err(type_mismatch("Instance", &*other)),
        }
    }

    pub fn as_bound_method(&self, id: ObjId) -> Result<ObjBoundMethod, VmError> {
        match &self.slot(id).data {
            Obj::BoundMethod(b) => Ok(*b),
            other => Err(type_mismatch("BoundMethod", other)),
        }
    }

    pub fn as_dictionary(&self, id: ObjId) -> Result<&ObjDictionary, VmError> {
        match &self.slot(id).data {
            Obj::Dictionary(d) => Ok(d),
            other => Err(type_mismatch("Dictionary", other)),
        }
    }

    pub fn as_dictionary_mut(&mut self, id: ObjId) -> Result<&mut ObjDictionary, VmError> {
        match &mut self.slot_mut(id).data {
            Obj::Dictionary(d) => Ok(d),
            other => Err(type_mismatch("Dictionary", &*other)),
        }
    }

    pub fn as_list(&self, id: ObjId) -> Result<&ObjList, VmError> {
        match &self.slot(id).data {
            Obj::List(l) => Ok(l),
            other => Err(type_mismatch("List", other)),
        }
    }

    pub fn as_list_mut(&mut self, id: ObjId) -> Result<&mut ObjList, VmError> {
        match &mut self.slot_mut(id).data {
            Obj::List(l) => Ok(l),
            other => Err(type_mismatch("List", &*other)),
        }
    }

    #[must_use]
    pub fn display_object(&self, id: ObjId) -> String {
        match &self.slot(id).data {
            Obj::String(s) => s.as_str().to_string(),
            Obj::Function(f) => format!("<fn {}>", self.display_value(Value::Object(f.name))),
            Obj::Closure(c) => self.display_object(c.function),
            Obj::Upvalue(_) => "<upvalue>".to_string(),
            Obj::Module(m) => format!("<module {}>", self.display_value(Value::Object(m.name))),
            Obj::Class(c) => format!("<class {}>", self.display_value(Value::Object(c.name))),
            Obj::Instance(i) => {
                let class_name = self.as_class(i.class).map_or_else(
                    |_| "?".to_string(),
                    |c| self.display_value(Value::Object(c.name)),
                );
                format!("<{class_name} instance>")
            }
            Obj::BoundMethod(b) => self.display_object(b.method),
            Obj::Dictionary(d) => {
                let parts: Vec<String> = d
                    .entries
                    .iter()
                    .map(|(k, v)| format!("{}: {}", self.display_value(k), self.display_value(v)))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Obj::List(l) => {
                let parts: Vec<String> = l.items.iter().map(|v| self.display_value(*v)).collect();
                format!("[{}]", parts.join(", "))
            }
        }
    }

    #[must_use]
    pub fn display_value(&self, value: Value) -> String {
        value.display(self)
    }
}

fn type_mismatch(expected: &'static str, got: &Obj) -> VmError {
    VmError::TypeMismatch {
        expected,
        got: got.kind().name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_same_bytes_yields_same_id() {
        let mut heap = Heap::new(false);
        let a = heap.intern_string(b"hello".to_vec());
        let b = heap.intern_string(b"hello".to_vec());
        assert_eq!(a, b);
    }

    #[test]
    fn interning_different_bytes_yields_different_ids() {
        let mut heap = Heap::new(false);
        let a = heap.intern_string(b"hello".to_vec());
        let b = heap.intern_string(b"world".to_vec());
        assert_ne!(a, b);
    }

    #[test]
    fn sweep_frees_unmarked_objects_and_keeps_marked() {
        let mut heap = Heap::new(false);
        let a = heap.intern_string(b"keep".to_vec());
        let _b = heap.intern_string(b"drop".to_vec());

        let mut gray = Vec::new();
        heap.mark(a, &mut gray);
        // `a` is also referenced by the (weak) intern set; prune first so
        // only genuinely-unreachable strings are swept.
        heap.prune_weak_tables();
        heap.sweep();

        assert!(heap.as_string(a).is_ok());
    }
}
