//! The `Value` tagged union and the nine heap object variants it can point
//! at. See the individual submodules for each object's layout.

pub mod class;
pub mod closure;
pub mod dictionary;
pub mod function;
pub mod list;
pub mod module;
pub mod string;

pub use class::{ObjBoundMethod, ObjClass, ObjInstance};
pub use closure::{ObjClosure, ObjUpvalue, UpvalueLocation};
pub use dictionary::ObjDictionary;
pub use function::ObjFunction;
pub use list::ObjList;
pub use module::{ModuleState, ObjModule};
pub use string::ObjString;

use crate::error::VmError;
use crate::gc::{Heap, ObjId, ObjKind};

/// A Loop runtime value: either one of the three immediate kinds, or a
/// reference to a heap-allocated object.
///
/// `Copy` because every variant is either a scalar or an index into the
/// heap's object table — never owned heap data itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Object(ObjId),
}

impl Value {
    #[must_use]
    pub fn type_name(&self, heap: &Heap) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::Object(id) => heap.kind_of(*id).name(),
        }
    }

    /// Truthiness: `Null` and `Bool(false)` are false, everything else is
    /// true (§4.1).
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Null | Value::Bool(false))
    }

    #[must_use]
    pub fn is_falsy(&self) -> bool {
        !self.is_truthy()
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_object(&self) -> Option<ObjId> {
        match self {
            Value::Object(id) => Some(*id),
            _ => None,
        }
    }

    /// Hashes this value for use as a table key. Mirrors `ValueHash`:
    /// `Null` is never hashable, and of the object kinds only strings are
    /// (using their precomputed FNV-1a hash).
    pub fn hash(&self, heap: &Heap) -> Result<u32, VmError> {
        match self {
            Value::Null => Err(VmError::TypeMismatch {
                expected: "hashable value",
                got: "Null",
            }),
            Value::Bool(b) => Ok(u32::from(*b)),
            #[allow(clippy::cast_sign_loss)]
            Value::Int(i) => Ok(*i as u32),
            Value::Object(id) => match heap.kind_of(*id) {
                ObjKind::String => Ok(heap.as_string(*id)?.hash),
                other => Err(VmError::TypeMismatch {
                    expected: "hashable value",
                    got: other.name(),
                }),
            },
        }
    }

    /// Renders this value the way `Print` writes it to stdout.
    pub fn display(&self, heap: &Heap) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Object(id) => heap.display_object(*id),
        }
    }
}
