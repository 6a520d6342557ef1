use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use pyo3::exceptions::{PyImportError, PyPermissionError, PySystemExit};
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyModule};
use sandbox::{
    CapabilityPolicy, ExecResult, FaultKind, GuestFault, Result, Sandbox, SandboxConfig,
    SandboxError, Termination,
};
use tracing::{debug, info, warn};

use crate::capture::Redirect;
use crate::guards::{unguarded, GuestScope, ImportGuard, InputGuard, OpenGuard, VIOLATION_MARKER};
use crate::program::HostFunctions;

/// Oldest interpreter whose traceback and import hooks behave as expected.
const MIN_PYTHON: (u8, u8) = (3, 8);

/// The embedded interpreter is process-global: one execution at a time,
/// across every sandbox in the process.
static INTERPRETER: Mutex<()> = Mutex::new(());

pub(crate) fn lock_interpreter() -> MutexGuard<'static, ()> {
    INTERPRETER.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct PythonSandbox {
    id: String,
    policy: Arc<CapabilityPolicy>,
    host: HostFunctions,
    import_guard: Py<ImportGuard>,
    /// The real `builtins.__dict__`.
    root: Py<PyDict>,
    /// Builtins with the guards installed. Restored onto `root` around every
    /// run; each run's namespace gets its own copy.
    builtins: Py<PyDict>,
    /// `sys.modules` keys present after boot; anything else is dropped after a run.
    baseline_modules: HashSet<String>,
    runs: u64,
}

impl PythonSandbox {
    /// Initialise the interpreter (first call only) and install the policy.
    ///
    /// Safe to call repeatedly: guards already on `builtins` are unwrapped to
    /// the primitives they hold, so every boot wraps the real ones.
    pub fn boot(config: &SandboxConfig) -> Result<Self> {
        config.policy.validate()?;
        let policy = Arc::new(config.policy.clone());
        let id = config.id.to_string();

        let _lock = lock_interpreter();
        Python::with_gil(|py| {
            let version = py.version_info();
            if version < MIN_PYTHON {
                return Err(SandboxError::BackendNotAvailable(format!(
                    "python {}.{} is older than {}.{}",
                    version.major, version.minor, MIN_PYTHON.0, MIN_PYTHON.1
                )));
            }

            let sandbox = Self::boot_with_gil(py, id, policy)
                .map_err(|e| SandboxError::BootFailed(e.to_string()))?;
            info!(
                sandbox_id = %sandbox.id,
                python = %py.version().lines().next().unwrap_or_default(),
                allowed_modules = ?sandbox.policy.allowed_modules,
                "python sandbox booted"
            );
            Ok(sandbox)
        })
    }

    fn boot_with_gil(py: Python<'_>, id: String, policy: Arc<CapabilityPolicy>) -> PyResult<Self> {
        let builtins = py.import_bound("builtins")?;
        let sys = py.import_bound("sys")?;
        let host = HostFunctions::load(py, &builtins)?;
        let root = builtins.dict();

        let import_guard = Py::new(
            py,
            ImportGuard::new(
                policy.clone(),
                unguarded(builtins.getattr("__import__")?),
                sys.getattr("modules")?.downcast_into::<PyDict>()?.unbind(),
            ),
        )?;
        let guarded = root.copy()?;
        guarded.set_item("__import__", import_guard.clone_ref(py))?;
        guarded.set_item(
            "open",
            Bound::new(
                py,
                OpenGuard::new(policy.clone(), unguarded(builtins.getattr("open")?)),
            )?,
        )?;
        guarded.set_item(
            "input",
            Bound::new(
                py,
                InputGuard::new(policy.clone(), unguarded(builtins.getattr("input")?)),
            )?,
        )?;

        let baseline_modules = loaded_modules(&sys)?;
        debug!(modules = baseline_modules.len(), "recorded baseline modules");

        let sandbox = Self {
            id,
            policy,
            host,
            import_guard,
            root: root.unbind(),
            builtins: guarded.unbind(),
            baseline_modules,
            runs: 0,
        };
        sandbox.restore_builtins(py)?;
        Ok(sandbox)
    }

    /// Reset the real `builtins` namespace to this sandbox's guarded copy:
    /// names added since boot are removed, everything else is put back.
    fn restore_builtins(&self, py: Python<'_>) -> PyResult<()> {
        let root = self.root.bind(py);
        let guarded = self.builtins.bind(py);
        for key in root.keys().iter() {
            if !guarded.contains(&key)? {
                root.del_item(&key)?;
            }
        }
        root.update(guarded.as_mapping())
    }

    fn namespace<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let namespace = PyDict::new_bound(py);
        namespace.set_item("__name__", "__main__")?;
        namespace.set_item("__builtins__", self.builtins.bind(py).copy()?)?;
        Ok(namespace)
    }

    fn run_with_gil(&self, py: Python<'_>, code: &str) -> Result<ExecResult> {
        let started = Instant::now();
        self.restore_builtins(py)
            .map_err(|e| SandboxError::ExecFailed(format!("cannot install guards: {e}")))?;
        let namespace = self
            .namespace(py)
            .map_err(|e| SandboxError::ExecFailed(format!("cannot build namespace: {e}")))?;
        let sys = py
            .import_bound("sys")
            .map_err(|e| SandboxError::ExecFailed(format!("cannot import sys: {e}")))?;
        let redirect = self
            .host
            .empty_stdin(py)
            .and_then(|stdin| Redirect::install(&sys, stdin))
            .map_err(|e| SandboxError::ExecFailed(format!("cannot redirect standard streams: {e}")))?;

        // Guest code, and finalizers it leaves behind, only run inside this scope.
        let scope = GuestScope::enter(self.import_guard.get());
        let outcome = self.host.execute(py, code, &namespace);
        let elapsed = started.elapsed();

        let (termination, value, report) = match outcome {
            Ok(value) => (Termination::Completed, value, None),
            Err(err) if err.is_instance_of::<PySystemExit>(py) => {
                (Termination::CleanExit, None, None)
            }
            Err(err) => {
                let report = self
                    .host
                    .format_exception(py, &err)
                    .unwrap_or_else(|_| format!("{err}\n"));
                let fault = classify(py, &err, &report);
                (Termination::Fault(fault), None, Some(report))
            }
        };

        // Finalizers triggered here still write into this run's buffers.
        namespace.clear();
        if let Err(e) = self.sweep_modules(&sys) {
            warn!(sandbox_id = %self.id, error = %e, "failed to unload guest modules");
        }
        if let Err(e) = self.host.collect_garbage(py) {
            warn!(sandbox_id = %self.id, error = %e, "garbage collection failed");
        }
        drop(scope);
        if let Err(e) = self.restore_builtins(py) {
            warn!(sandbox_id = %self.id, error = %e, "failed to restore builtins");
        }

        let (stdout, mut stderr) = redirect.finish();
        if let Some(report) = report {
            stderr.push_str(&report);
        }

        Ok(ExecResult {
            termination,
            stdout,
            stderr,
            value,
            elapsed,
        })
    }

    /// Drop modules first imported by guest code so the next run re-imports
    /// them from scratch.
    fn sweep_modules(&self, sys: &Bound<'_, PyModule>) -> PyResult<()> {
        let modules = sys.getattr("modules")?.downcast_into::<PyDict>()?;
        let mut stale = Vec::new();
        for key in modules.keys().iter() {
            let keep = key
                .extract::<String>()
                .map(|name| self.baseline_modules.contains(&name))
                .unwrap_or(true);
            if !keep {
                stale.push(key);
            }
        }
        for key in &stale {
            modules.del_item(key)?;
        }
        if !stale.is_empty() {
            debug!(sandbox_id = %self.id, count = stale.len(), "unloaded guest modules");
        }
        Ok(())
    }
}

fn loaded_modules(sys: &Bound<'_, PyModule>) -> PyResult<HashSet<String>> {
    let modules = sys.getattr("modules")?.downcast_into::<PyDict>()?;
    let mut names = HashSet::with_capacity(modules.len());
    for key in modules.keys().iter() {
        if let Ok(name) = key.extract::<String>() {
            names.insert(name);
        }
    }
    Ok(names)
}

fn classify(py: Python<'_>, err: &PyErr, report: &str) -> GuestFault {
    let guarded = err
        .value_bound(py)
        .hasattr(VIOLATION_MARKER)
        .unwrap_or(false);
    let kind = if guarded && err.is_instance_of::<PyPermissionError>(py) {
        FaultKind::PermissionDenied
    } else if guarded && err.is_instance_of::<PyImportError>(py) {
        FaultKind::ImportRejected
    } else {
        FaultKind::Runtime
    };
    let message = report
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default()
        .to_string();
    GuestFault { kind, message }
}

impl Sandbox for PythonSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn policy(&self) -> &CapabilityPolicy {
        &self.policy
    }

    fn run(&mut self, code: &str) -> Result<ExecResult> {
        self.runs += 1;
        debug!(sandbox_id = %self.id, run = self.runs, bytes = code.len(), "executing submission");

        let _lock = lock_interpreter();
        let result = Python::with_gil(|py| self.run_with_gil(py, code))?;

        debug!(
            sandbox_id = %self.id,
            run = self.runs,
            success = result.success(),
            elapsed_ms = result.elapsed_ms(),
            "submission finished"
        );
        Ok(result)
    }
}
