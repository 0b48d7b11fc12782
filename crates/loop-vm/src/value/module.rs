//! Modules: the unit of compilation, linking, and global storage.

use crate::gc::ObjId;
use crate::table::Table;
use crate::value::Value;

/// A module's place in the initialization state machine (§4.5). Transitions
/// are strictly monotonic: `NotExecuted -> Running -> Executed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    NotExecuted,
    Running,
    Executed,
}

/// A loaded compilation unit: its script function, its fixed-size global
/// slot array, and the name/value pairs it has exported so far.
///
/// `script_function` is `None` only for the instant between allocating the
/// module (so its script function can reference it as `module_ref`) and
/// patching the function in once decoded — every `ObjModule` handed back
/// by the loader has it set.
#[derive(Debug, Clone)]
pub struct ObjModule {
    pub name: ObjId,
    pub parent_dir: ObjId,
    pub script_function: Option<ObjId>,
    pub globals: Vec<Value>,
    pub exports: Table,
    pub state: ModuleState,
}

impl ObjModule {
    #[must_use]
    pub fn new(name: ObjId, parent_dir: ObjId, globals_count: usize) -> Self {
        ObjModule {
            name,
            parent_dir,
            script_function: None,
            globals: vec![Value::Null; globals_count],
            exports: Table::new(),
            state: ModuleState::NotExecuted,
        }
    }

    #[must_use]
    pub fn script_function(&self) -> ObjId {
        self.script_function
            .expect("module's script function is patched in before the module is returned to callers")
    }
}
