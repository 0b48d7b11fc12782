//! Compiled function objects.

use crate::chunk::Chunk;
use crate::gc::ObjId;

/// A compiled function: its defining module, its display name, its arity,
/// and the bytecode chunk implementing its body.
#[derive(Debug, Clone)]
pub struct ObjFunction {
    pub module: ObjId,
    pub name: ObjId,
    pub arity: u8,
    pub chunk: Chunk,
}

impl ObjFunction {
    #[must_use]
    pub fn new(module: ObjId, name: ObjId, arity: u8, chunk: Chunk) -> Self {
        ObjFunction {
            module,
            name,
            arity,
            chunk,
        }
    }
}
