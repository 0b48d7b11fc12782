//! Runtime configuration, grounded in the teacher's `VirtualMachineConfiguration`-style
//! bundle of collaborators handed to the VM at construction time (SPEC_FULL §6 ambient).

use std::io::Write;
use std::path::PathBuf;

/// Everything the engine needs from its environment that isn't part of the
/// bytecode itself: where to resolve `packages_path`-relative imports
/// (§4.5), whether to run the collector in stress mode (every allocation
/// collects, §4.4), and where `Print`/diagnostics go.
pub struct VmConfig {
    pub packages_path: PathBuf,
    pub stress_gc: bool,
    pub out: Box<dyn Write>,
    pub err: Box<dyn Write>,
}

impl VmConfig {
    #[must_use]
    pub fn new(packages_path: PathBuf) -> Self {
        VmConfig {
            packages_path,
            stress_gc: false,
            out: Box::new(std::io::stdout()),
            err: Box::new(std::io::stderr()),
        }
    }

    #[must_use]
    pub fn with_stress_gc(mut self, stress_gc: bool) -> Self {
        self.stress_gc = stress_gc;
        self
    }

    #[must_use]
    pub fn with_sinks(mut self, out: Box<dyn Write>, err: Box<dyn Write>) -> Self {
        self.out = out;
        self.err = err;
        self
    }
}
