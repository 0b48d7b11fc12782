//! The `std::fs`-backed [`loop_vm::loader::FileSystem`] implementation —
//! the one collaborator the engine itself never touches directly (§1).

use std::path::{Path, PathBuf};

use loop_vm::error::VmError;
use loop_vm::loader::FileSystem;

pub struct StdFileSystem;

impl FileSystem for StdFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, VmError> {
        std::fs::read_to_string(path).map_err(|e| VmError::IOError {
            message: format!("{}: {e}", path.display()),
        })
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn current_dir(&self) -> PathBuf {
        std::env::current_dir().unwrap_or_default()
    }
}
