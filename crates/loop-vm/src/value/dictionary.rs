//! The user-level dictionary object (distinct from the tables used
//! internally for the intern set, module registry, exports, fields, and
//! methods — same underlying `Table`, different role).

use crate::table::Table;

#[derive(Debug, Clone)]
pub struct ObjDictionary {
    pub entries: Table,
}

impl ObjDictionary {
    #[must_use]
    pub fn new() -> Self {
        ObjDictionary {
            entries: Table::new(),
        }
    }
}

impl Default for ObjDictionary {
    fn default() -> Self {
        Self::new()
    }
}
