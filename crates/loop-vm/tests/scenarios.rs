//! End-to-end scenarios driven entirely through the public API: an
//! in-memory [`FileSystem`] standing in for disk, and `Vm::run_file`
//! decoding the on-disk JSON module format (§6, §8 of the specification).
//! These exercise the loader, the dispatch loop, and upvalue/module
//! lifecycle together rather than any single component in isolation.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use loop_vm::loader::FileSystem;
use loop_vm::{Vm, VmConfig, VmError};

/// A fixed set of named JSON module files rooted at `/virtual`, keyed by
/// the exact absolute path the loader computes
/// (`<dir>/.loop_compiled/<base>.code`, §6).
struct FakeFileSystem {
    files: HashMap<PathBuf, String>,
}

impl FakeFileSystem {
    fn new(files: &[(&str, &str)]) -> Self {
        FakeFileSystem {
            files: files
                .iter()
                .map(|(path, contents)| (PathBuf::from(path), (*contents).to_string()))
                .collect(),
        }
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, VmError> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| VmError::FileNotFound {
                path: path.display().to_string(),
            })
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }

    fn current_dir(&self) -> PathBuf {
        PathBuf::from("/virtual")
    }
}

/// A `Write` sink that can be inspected after the `Vm` that owns it (as a
/// boxed trait object) has finished running.
#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn config_with_capture() -> (VmConfig, SharedBuffer, SharedBuffer) {
    let out = SharedBuffer::default();
    let err = SharedBuffer::default();
    let config = VmConfig::new(PathBuf::new()).with_sinks(Box::new(out.clone()), Box::new(err.clone()));
    (config, out, err)
}

/// Scenario 1 (spec.md §8): `PushConstant 0 (Integer 7); Print; PushNull;
/// Return`-shaped script, decoded from literal on-disk JSON rather than
/// hand-built `Chunk` values, exercising the loader's JSON path end to end.
#[test]
fn hello_integer_via_json_prints_seven() {
    let module = r#"{
        "globals_count": 0,
        "chunk": {
            "code": [0, 0, 46, 3, 30],
            "constants": [{"type": "Integer", "data": 7}],
            "lines": [5]
        }
    }"#;
    let fs = FakeFileSystem::new(&[("/virtual/.loop_compiled/hello.code", module)]);
    let (config, out, _err) = config_with_capture();
    let mut vm = Vm::new(config);

    vm.run_file(&fs, "hello").unwrap();
    assert_eq!(out.contents(), "7\n");
}

/// Scenario 2: `10 / 3` prints `3`.
#[test]
fn arithmetic_division_prints_quotient() {
    let module = r#"{
        "globals_count": 0,
        "chunk": {
            "code": [0, 0, 0, 1, 11, 46, 3, 30],
            "constants": [
                {"type": "Integer", "data": 10},
                {"type": "Integer", "data": 3}
            ],
            "lines": [8]
        }
    }"#;
    let fs = FakeFileSystem::new(&[("/virtual/.loop_compiled/div.code", module)]);
    let (config, out, _err) = config_with_capture();
    let mut vm = Vm::new(config);

    vm.run_file(&fs, "div").unwrap();
    assert_eq!(out.contents(), "3\n");
}

/// Scenario 3: division by zero surfaces `ZeroDivision` and produces no
/// value-line output.
#[test]
fn division_by_zero_is_zero_division_error() {
    let module = r#"{
        "globals_count": 0,
        "chunk": {
            "code": [0, 0, 0, 1, 11, 46, 3, 30],
            "constants": [
                {"type": "Integer", "data": 1},
                {"type": "Integer", "data": 0}
            ],
            "lines": [8]
        }
    }"#;
    let fs = FakeFileSystem::new(&[("/virtual/.loop_compiled/zero.code", module)]);
    let (config, out, err) = config_with_capture();
    let mut vm = Vm::new(config);

    let result = vm.run_file(&fs, "zero");
    assert_eq!(result.unwrap_err(), VmError::ZeroDivision);
    assert_eq!(out.contents(), "");
    assert!(err.contents().contains("division by zero"));
}

/// Scenario 4: a local captured by a closure, reassigned after capture,
/// then read back through the closure call — the open-upvalue aliases the
/// live stack slot rather than a snapshot taken at capture time.
///
/// Bytecode (see `crates/loop-vm/src/vm.rs` for opcode numbering):
/// push `x = 1`; push the inner function and build a closure over local
/// slot 1 (`x`); reassign `x = 42`; call the closure (which reads its sole
/// upvalue and returns it); print the result.
#[test]
fn closure_reads_reassigned_capture() {
    let module = r#"{
        "globals_count": 0,
        "chunk": {
            "code": [0, 0, 0, 1, 39, 1, 1, 1, 0, 2, 21, 1, 4, 20, 2, 44, 0, 46, 3, 30],
            "constants": [
                {"type": "Integer", "data": 1},
                {"type": "Function", "data": {
                    "name": {"type": "String", "data": "inner"},
                    "arity": 0,
                    "chunk": {"code": [24, 0, 45], "constants": [], "lines": [3]}
                }},
                {"type": "Integer", "data": 42}
            ],
            "lines": [20]
        }
    }"#;
    let fs = FakeFileSystem::new(&[("/virtual/.loop_compiled/closure.code", module)]);
    let (config, out, _err) = config_with_capture();
    let mut vm = Vm::new(config);

    vm.run_file(&fs, "closure").unwrap();
    assert_eq!(out.contents(), "42\n");
}

/// Scenario 5: module A imports B, B imports A back while A is still
/// `Running` — the cycle is rejected rather than re-entering A.
#[test]
fn circular_import_is_rejected() {
    let module_a = r#"{
        "globals_count": 0,
        "chunk": {
            "code": [26, 0, 4, 3, 30],
            "constants": [{"type": "String", "data": "b"}],
            "lines": [5]
        }
    }"#;
    let module_b = r#"{
        "globals_count": 0,
        "chunk": {
            "code": [26, 0],
            "constants": [{"type": "String", "data": "a"}],
            "lines": [2]
        }
    }"#;
    let fs = FakeFileSystem::new(&[
        ("/virtual/.loop_compiled/a.code", module_a),
        ("/virtual/.loop_compiled/b.code", module_b),
    ]);
    let (config, _out, _err) = config_with_capture();
    let mut vm = Vm::new(config);

    let result = vm.run_file(&fs, "a");
    assert_eq!(result.unwrap_err(), VmError::CircularImport { path: "a".to_string() });
}

/// Round-trip property (spec.md §8): importing an already-executed module
/// a second time is a no-op — its script body does not run again.
#[test]
fn reimporting_executed_module_does_not_rerun_it() {
    let module_a = r#"{
        "globals_count": 0,
        "chunk": {
            "code": [26, 0, 4, 26, 0, 4, 3, 30],
            "constants": [{"type": "String", "data": "util"}],
            "lines": [8]
        }
    }"#;
    let module_util = r#"{
        "globals_count": 0,
        "chunk": {
            "code": [0, 0, 46, 3, 30],
            "constants": [{"type": "String", "data": "loaded"}],
            "lines": [5]
        }
    }"#;
    let fs = FakeFileSystem::new(&[
        ("/virtual/.loop_compiled/reimport.code", module_a),
        ("/virtual/.loop_compiled/util.code", module_util),
    ]);
    let (config, out, _err) = config_with_capture();
    let mut vm = Vm::new(config);

    vm.run_file(&fs, "reimport").unwrap();
    assert_eq!(out.contents(), "loaded\n");
}

/// Boundary: calling a function with the wrong argument count is
/// `WrongArgumentsCount`, not a panic or silent truncation.
#[test]
fn call_with_wrong_arity_errors() {
    let module = r#"{
        "globals_count": 0,
        "chunk": {
            "code": [0, 0, 44, 0],
            "constants": [{"type": "Function", "data": {
                "name": {"type": "String", "data": "needs_one"},
                "arity": 1,
                "chunk": {"code": [3, 45], "constants": [], "lines": [2]}
            }}],
            "lines": [4]
        }
    }"#;
    let fs = FakeFileSystem::new(&[("/virtual/.loop_compiled/arity.code", module)]);
    let (config, _out, _err) = config_with_capture();
    let mut vm = Vm::new(config);

    let result = vm.run_file(&fs, "arity");
    assert_eq!(result.unwrap_err(), VmError::WrongArgumentsCount { expected: 1, got: 0 });
}

/// Boundary: a missing entry module is `FileNotFound`, not a panic.
#[test]
fn missing_entry_module_is_file_not_found() {
    let fs = FakeFileSystem::new(&[]);
    let (config, _out, _err) = config_with_capture();
    let mut vm = Vm::new(config);

    let result = vm.run_file(&fs, "does_not_exist");
    assert!(matches!(result.unwrap_err(), VmError::FileNotFound { .. }));
}
