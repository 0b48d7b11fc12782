//! Classes, instances, and bound methods.

use crate::gc::ObjId;
use crate::table::Table;

/// A class: the module it was declared in, its name, an optional
/// superclass, and its own method table (which, after `Inherit`, also holds
/// copies of every inherited method).
#[derive(Debug, Clone)]
pub struct ObjClass {
    pub module: ObjId,
    pub name: ObjId,
    pub super_class: Option<ObjId>,
    pub methods: Table,
}

impl ObjClass {
    #[must_use]
    pub fn new(module: ObjId, name: ObjId) -> Self {
        ObjClass {
            module,
            name,
            super_class: None,
            methods: Table::new(),
        }
    }
}

/// A runtime instance of a class, with its own field storage.
#[derive(Debug, Clone)]
pub struct ObjInstance {
    pub class: ObjId,
    pub fields: Table,
}

impl ObjInstance {
    #[must_use]
    pub fn new(class: ObjId) -> Self {
        ObjInstance {
            class,
            fields: Table::new(),
        }
    }
}

/// A method function bound to the instance it was looked up on, created
/// fresh by every `GetAttribute`/`SuperGet` that resolves to a method.
#[derive(Debug, Clone, Copy)]
pub struct ObjBoundMethod {
    pub receiver: ObjId,
    pub method: ObjId,
}

impl ObjBoundMethod {
    #[must_use]
    pub fn new(receiver: ObjId, method: ObjId) -> Self {
        ObjBoundMethod { receiver, method }
    }
}
