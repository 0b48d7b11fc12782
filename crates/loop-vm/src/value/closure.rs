//! Closures and the upvalues they capture.

use crate::gc::ObjId;
use crate::value::Value;

/// A function paired with the upvalues it closed over at creation time.
#[derive(Debug, Clone)]
pub struct ObjClosure {
    pub function: ObjId,
    pub upvalues: Vec<ObjId>,
}

impl ObjClosure {
    #[must_use]
    pub fn new(function: ObjId, upvalues: Vec<ObjId>) -> Self {
        ObjClosure { function, upvalues }
    }
}

/// Where a captured variable currently lives.
///
/// `Open` means the value still lives on the VM's value stack at the given
/// index; `Closed` means the frame that owned that stack slot has returned
/// and the value has been copied into this upvalue's own storage.
#[derive(Debug, Clone)]
pub enum UpvalueLocation {
    Open(usize),
    Closed(Value),
}

/// A captured variable, shared between a closure and the scope that defined
/// it. Open upvalues are threaded into an intrusive list on the VM so a
/// second capture of the same stack slot reuses the first.
#[derive(Debug, Clone)]
pub struct ObjUpvalue {
    pub location: UpvalueLocation,
    /// Next node in the VM's open-upvalue list; `None` once closed or at the
    /// tail of the list.
    pub next_open: Option<ObjId>,
}

impl ObjUpvalue {
    #[must_use]
    pub fn open(stack_index: usize) -> Self {
        ObjUpvalue {
            location: UpvalueLocation::Open(stack_index),
            next_open: None,
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self.location, UpvalueLocation::Open(_))
    }

    #[must_use]
    pub fn stack_index(&self) -> Option<usize> {
        match self.location {
            UpvalueLocation::Open(index) => Some(index),
            UpvalueLocation::Closed(_) => None,
        }
    }
}
