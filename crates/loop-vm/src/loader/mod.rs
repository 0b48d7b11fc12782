//! Module resolution and decoding (§4.5). File I/O and path resolution are
//! out-of-scope collaborators (§1): this module only consumes the
//! [`FileSystem`] trait, leaving `loop-cli` to supply a `std::fs`-backed
//! implementation and tests to supply an in-memory one.

pub mod format;

use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::VmError;
use crate::gc::{Heap, ObjId};
use crate::value::ModuleState;

/// The file-system operations the loader needs. Kept deliberately narrow —
/// read, existence check, and a base directory for resolving relative
/// paths — so tests can supply an in-memory fake without touching disk.
pub trait FileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, VmError>;
    fn exists(&self, path: &Path) -> bool;
    fn current_dir(&self) -> PathBuf;
}

/// Lexically normalizes a path (resolves `.` and `..` components without
/// touching the file system). Mirrors what the original's `realpath`-style
/// resolution achieves for paths that may not exist yet (the compiled-path
/// candidate is checked for existence only after this normalization).
fn normalize(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if !result.pop() {
                    result.push(component);
                }
            }
            Component::CurDir => {}
            other => result.push(other),
        }
    }
    result
}

fn absolutize(fs: &dyn FileSystem, path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        fs.current_dir().join(path)
    };
    normalize(&joined)
}

/// `<dir(requested_path)>/.loop_compiled/<base(requested_path)>.code`,
/// per §6 — derived from the *requested* path, not any resolved candidate.
fn compiled_relative_path(requested_path: &str) -> PathBuf {
    let path = Path::new(requested_path);
    let dir = path.parent().unwrap_or_else(|| Path::new(""));
    let base = path.file_name().map_or_else(|| requested_path.to_string(), |n| n.to_string_lossy().to_string());
    dir.join(".loop_compiled").join(format!("{base}.code"))
}

/// A module's `parent_dir` (used when *it* imports another module) is
/// derived from its own resolved absolute path by stripping both the
/// `.loop_compiled` segment and the file's own directory segment (§4.5).
fn module_parent_dir(resolved_path: &Path) -> PathBuf {
    resolved_path
        .parent() // strip file name
        .and_then(Path::parent) // strip `.loop_compiled`
        .map_or_else(PathBuf::new, Path::to_path_buf)
}

pub struct ModuleLoader {
    packages_path: PathBuf,
}

impl ModuleLoader {
    #[must_use]
    pub fn new(packages_path: PathBuf) -> Self {
        ModuleLoader { packages_path }
    }

    /// Resolves and decodes the module requested by `requested_path`
    /// against `parent_dir`, returning its (possibly already-registered)
    /// `Module` object id. Disables GC around allocation of the module's
    /// object graph (§4.4) and re-enables it before returning.
    pub fn load_module(
        &self,
        heap: &mut Heap,
        fs: &dyn FileSystem,
        parent_dir: &str,
        requested_path: &str,
    ) -> Result<ObjId, VmError> {
        let was_enabled = heap.enabled;
        heap.enabled = false;
        let result = self.load_module_inner(heap, fs, parent_dir, requested_path);
        heap.enabled = was_enabled;
        result
    }

    fn load_module_inner(
        &self,
        heap: &mut Heap,
        fs: &dyn FileSystem,
        parent_dir: &str,
        requested_path: &str,
    ) -> Result<ObjId, VmError> {
        let compiled_relative = compiled_relative_path(requested_path);
        let candidates = [parent_dir, "", self.packages_path.to_str().unwrap_or("")];

        for candidate in candidates {
            let joined = Path::new(candidate).join(&compiled_relative);
            let resolved = absolutize(fs, &joined);
            let resolved_str = resolved.to_string_lossy().to_string();

            let path_id = heap.intern_string(resolved_str.clone().into_bytes());
            if let Some(module_id) = heap.lookup_module(path_id) {
                debug!(path = %resolved_str, "module already registered");
                return Ok(module_id);
            }

            if fs.exists(&resolved) {
                debug!(path = %resolved_str, "resolved module path");
                return self.decode_module(heap, fs, &resolved, path_id, requested_path);
            }
        }

        Err(VmError::FileNotFound {
            path: requested_path.to_string(),
        })
    }

    fn decode_module(
        &self,
        heap: &mut Heap,
        fs: &dyn FileSystem,
        resolved: &Path,
        path_id: ObjId,
        requested_path: &str,
    ) -> Result<ObjId, VmError> {
        let contents = fs.read_to_string(resolved)?;
        let json: serde_json::Value = serde_json::from_str(&contents)
            .map_err(|e| VmError::InvalidJSON { message: e.to_string() })?;

        let parent_dir_str = module_parent_dir(resolved).to_string_lossy().to_string();
        let parent_dir_id = heap.intern_string(parent_dir_str.into_bytes());
        let script_name_id = heap.intern_string(b"script".to_vec());

        let module_name = Path::new(requested_path)
            .file_name()
            .map_or_else(|| requested_path.to_string(), |s| s.to_string_lossy().to_string());
        let name_id = heap.intern_string(module_name.into_bytes());

        let module = crate::value::ObjModule::new(name_id, parent_dir_id, 0);
        let module_id = heap.alloc(crate::gc::Obj::Module(Box::new(module)));
        heap.register_module(path_id, module_id);

        format::decode_module_body(&json, heap, module_id, script_name_id)?;

        Ok(module_id)
    }
}

/// The `Import` opcode's state-machine check (§4.5): `NotExecuted`
/// transitions to `Running` and the caller pushes the script frame;
/// `Running` means a cycle; `Executed` is a no-op re-import.
pub fn begin_import(heap: &mut Heap, module_id: ObjId, display_path: &str) -> Result<ImportAction, VmError> {
    let module = heap.as_module_mut(module_id)?;
    match module.state {
        ModuleState::NotExecuted => {
            module.state = ModuleState::Running;
            Ok(ImportAction::PushScriptFrame(module.script_function()))
        }
        ModuleState::Running => Err(VmError::CircularImport {
            path: display_path.to_string(),
        }),
        ModuleState::Executed => Ok(ImportAction::AlreadyExecuted),
    }
}

pub enum ImportAction {
    PushScriptFrame(ObjId),
    AlreadyExecuted,
}
