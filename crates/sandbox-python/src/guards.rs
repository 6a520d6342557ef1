use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pyo3::exceptions::{PyEOFError, PyImportError, PyPermissionError};
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyModule, PyTuple};
use sandbox::{CapabilityPolicy, PolicyViolation};
use tracing::debug;

/// Attribute set on every exception raised by a guard.
pub(crate) const VIOLATION_MARKER: &str = "__sandbox_violation__";

/// Convert a policy refusal into the guest exception it surfaces as.
pub(crate) fn violation_error(py: Python<'_>, violation: &PolicyViolation) -> PyErr {
    let message = violation.to_string();
    let err = match violation {
        PolicyViolation::FileAccessDenied => PyPermissionError::new_err(message),
        PolicyViolation::ImportRejected(_) => PyImportError::new_err(message),
        PolicyViolation::InputUnavailable => PyEOFError::new_err(message),
    };

    let value = err.value_bound(py);
    let annotated = value
        .setattr(VIOLATION_MARKER, true)
        .and_then(|()| match violation {
            PolicyViolation::ImportRejected(name) => value.setattr("name", name),
            _ => Ok(()),
        });
    if let Err(e) = annotated {
        debug!(error = %e, "cannot annotate guard exception");
    }
    err
}

/// The primitive behind `value`: a guard's wrapped original, or `value`
/// itself when it is not a guard.
pub(crate) fn unguarded(value: Bound<'_, PyAny>) -> PyObject {
    let py = value.py();
    if let Ok(guard) = value.downcast::<ImportGuard>() {
        return guard.get().original.clone_ref(py);
    }
    if let Ok(guard) = value.downcast::<OpenGuard>() {
        return guard.get().original.clone_ref(py);
    }
    if let Ok(guard) = value.downcast::<InputGuard>() {
        return guard.get().original.clone_ref(py);
    }
    value.unbind()
}

fn forward(
    original: &PyObject,
    py: Python<'_>,
    args: &Bound<'_, PyTuple>,
    kwargs: Option<&Bound<'_, PyDict>>,
) -> PyResult<PyObject> {
    original
        .bind(py)
        .call(args.clone(), kwargs)
        .map(Bound::unbind)
}

/// Stands in for `builtins.__import__`, both in the guest namespace and on
/// the real `builtins` module.
///
/// While a guest run is in progress, an import is checked against the policy
/// unless it comes from a loaded module's own code, so allowed modules can
/// still load their dependencies. Guest code receives a view of the module
/// without the submodules the policy does not allow.
#[pyclass(frozen, module = "sandbox")]
pub(crate) struct ImportGuard {
    policy: Arc<CapabilityPolicy>,
    original: PyObject,
    /// `sys.modules`, held so the guard never has to import anything itself.
    modules: Py<PyDict>,
    enforcing: AtomicBool,
}

impl ImportGuard {
    pub(crate) fn new(
        policy: Arc<CapabilityPolicy>,
        original: PyObject,
        modules: Py<PyDict>,
    ) -> Self {
        Self {
            policy,
            original,
            modules,
            enforcing: AtomicBool::new(false),
        }
    }

    /// True when the importing code's globals are the namespace of a module
    /// in `sys.modules`.
    fn from_loaded_module(
        &self,
        py: Python<'_>,
        args: &Bound<'_, PyTuple>,
        kwargs: Option<&Bound<'_, PyDict>>,
    ) -> bool {
        let globals = match args.get_item(0) {
            Ok(globals) => globals,
            Err(_) => match kwargs.and_then(|k| k.get_item("globals").ok().flatten()) {
                Some(globals) => globals,
                None => return false,
            },
        };
        let Ok(name) = globals.get_item("__name__") else {
            return false;
        };
        let Ok(Some(module)) = self.modules.bind(py).get_item(name) else {
            return false;
        };
        module
            .getattr("__dict__")
            .map(|namespace| namespace.is(&globals))
            .unwrap_or(false)
    }

    fn exposes(&self, module: &Bound<'_, PyModule>) -> bool {
        module
            .name()
            .ok()
            .and_then(|name| name.to_cow().ok().map(|n| self.policy.allows_module(&n)))
            .unwrap_or(false)
    }

    /// Copy of `value`'s namespace with disallowed submodules left out,
    /// applied recursively to the allowed ones. Non-modules pass through.
    fn guest_view<'py>(
        &self,
        value: Bound<'py, PyAny>,
        seen: &Bound<'py, PyDict>,
    ) -> PyResult<Bound<'py, PyAny>> {
        if !value.is_instance_of::<PyModule>() {
            return Ok(value);
        }
        let module = value.downcast::<PyModule>()?;
        let key = module.as_ptr() as usize;
        if let Some(view) = seen.get_item(key)? {
            return Ok(view);
        }

        let view = PyModule::new_bound(value.py(), &module.name()?.to_cow()?)?;
        seen.set_item(key, &view)?;
        let namespace = view.dict();
        for (attr, item) in module.dict().iter() {
            if let Ok(submodule) = item.downcast::<PyModule>() {
                if self.exposes(submodule) {
                    namespace.set_item(attr, self.guest_view(item.clone(), seen)?)?;
                }
            } else {
                namespace.set_item(attr, &item)?;
            }
        }
        Ok(view.into_any())
    }
}

#[pymethods]
impl ImportGuard {
    #[pyo3(signature = (name, *args, **kwargs))]
    fn __call__(
        &self,
        py: Python<'_>,
        name: &str,
        args: &Bound<'_, PyTuple>,
        kwargs: Option<&Bound<'_, PyDict>>,
    ) -> PyResult<PyObject> {
        let guest =
            self.enforcing.load(Ordering::Relaxed) && !self.from_loaded_module(py, args, kwargs);
        if guest {
            if let Err(violation) = self.policy.check_import(name) {
                debug!(module = name, "import rejected");
                return Err(violation_error(py, &violation));
            }
        }

        let mut forwarded: Vec<PyObject> = Vec::with_capacity(args.len() + 1);
        forwarded.push(name.to_object(py));
        forwarded.extend(args.iter().map(Bound::unbind));
        let forwarded = PyTuple::new_bound(py, forwarded);
        let imported = forward(&self.original, py, &forwarded, kwargs)?;
        if !guest {
            return Ok(imported);
        }
        let seen = PyDict::new_bound(py);
        self.guest_view(imported.into_bound(py), &seen).map(Bound::unbind)
    }
}

/// Marks a guest run in progress on an [`ImportGuard`]; ends when dropped.
pub(crate) struct GuestScope<'a> {
    guard: &'a ImportGuard,
}

impl<'a> GuestScope<'a> {
    pub(crate) fn enter(guard: &'a ImportGuard) -> Self {
        guard.enforcing.store(true, Ordering::Relaxed);
        Self { guard }
    }
}

impl Drop for GuestScope<'_> {
    fn drop(&mut self) {
        self.guard.enforcing.store(false, Ordering::Relaxed);
    }
}

/// Stands in for `builtins.open`.
#[pyclass(frozen, module = "sandbox")]
pub(crate) struct OpenGuard {
    policy: Arc<CapabilityPolicy>,
    original: PyObject,
}

impl OpenGuard {
    pub(crate) fn new(policy: Arc<CapabilityPolicy>, original: PyObject) -> Self {
        Self { policy, original }
    }
}

#[pymethods]
impl OpenGuard {
    #[pyo3(signature = (*args, **kwargs))]
    fn __call__(
        &self,
        py: Python<'_>,
        args: &Bound<'_, PyTuple>,
        kwargs: Option<&Bound<'_, PyDict>>,
    ) -> PyResult<PyObject> {
        if let Err(violation) = self.policy.check_open() {
            debug!("file access rejected");
            return Err(violation_error(py, &violation));
        }
        forward(&self.original, py, args, kwargs)
    }
}

/// Stands in for `builtins.input`.
#[pyclass(frozen, module = "sandbox")]
pub(crate) struct InputGuard {
    policy: Arc<CapabilityPolicy>,
    original: PyObject,
}

impl InputGuard {
    pub(crate) fn new(policy: Arc<CapabilityPolicy>, original: PyObject) -> Self {
        Self { policy, original }
    }
}

#[pymethods]
impl InputGuard {
    #[pyo3(signature = (*args, **kwargs))]
    fn __call__(
        &self,
        py: Python<'_>,
        args: &Bound<'_, PyTuple>,
        kwargs: Option<&Bound<'_, PyDict>>,
    ) -> PyResult<PyObject> {
        if let Err(violation) = self.policy.check_input() {
            return Err(violation_error(py, &violation));
        }
        forward(&self.original, py, args, kwargs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::lock_interpreter;

    fn import_guard<'py>(py: Python<'py>) -> Bound<'py, ImportGuard> {
        let builtins = py.import_bound("builtins").unwrap();
        let original = unguarded(builtins.getattr("__import__").unwrap());
        let modules = py
            .import_bound("sys")
            .unwrap()
            .getattr("modules")
            .unwrap()
            .downcast_into::<PyDict>()
            .unwrap()
            .unbind();
        Bound::new(
            py,
            ImportGuard::new(Arc::new(CapabilityPolicy::default()), original, modules),
        )
        .unwrap()
    }

    #[test]
    fn import_guard_rejects_and_forwards() {
        let _lock = lock_interpreter();
        Python::with_gil(|py| {
            let guard = import_guard(py);
            let _scope = GuestScope::enter(guard.get());

            let math = guard.call1(("math",)).unwrap();
            assert_eq!(math.getattr("__name__").unwrap().to_string(), "math");

            let err = guard.call1(("socket",)).unwrap_err();
            assert!(err.is_instance_of::<PyImportError>(py));
            assert_eq!(
                err.value_bound(py).to_string(),
                "Import of 'socket' is not allowed"
            );
            let name = err.value_bound(py).getattr("name").unwrap();
            assert_eq!(name.to_string(), "socket");
            assert!(err.value_bound(py).hasattr(VIOLATION_MARKER).unwrap());
        });
    }

    #[test]
    fn import_guard_only_enforces_inside_a_guest_scope() {
        let _lock = lock_interpreter();
        Python::with_gil(|py| {
            let guard = import_guard(py);
            assert!(guard.call1(("socket",)).is_ok());

            {
                let _scope = GuestScope::enter(guard.get());
                assert!(guard.call1(("socket",)).is_err());
            }
            assert!(guard.call1(("socket",)).is_ok());
        });
    }

    #[test]
    fn imports_made_by_loaded_modules_are_forwarded() {
        let _lock = lock_interpreter();
        Python::with_gil(|py| {
            let guard = import_guard(py);
            let library_globals = py.import_bound("sys").unwrap().dict();
            let _scope = GuestScope::enter(guard.get());

            let os = guard.call1(("os", library_globals.clone())).unwrap();
            assert_eq!(os.getattr("__name__").unwrap().to_string(), "os");

            let forged = PyDict::new_bound(py);
            forged.set_item("__name__", "sys").unwrap();
            assert!(guard.call1(("os", forged)).is_err());
            assert!(guard.call1(("os", py.None())).is_err());
        });
    }

    #[test]
    fn guest_view_drops_disallowed_submodules() {
        let _lock = lock_interpreter();
        Python::with_gil(|py| {
            let guard = import_guard(py);
            let _scope = GuestScope::enter(guard.get());

            let random = guard.call1(("random",)).unwrap();
            assert!(random.hasattr("randint").unwrap());
            assert!(!random.hasattr("_os").unwrap());

            let collections = guard.call1(("collections",)).unwrap();
            assert!(collections.hasattr("OrderedDict").unwrap());
            assert!(!collections.hasattr("_sys").unwrap());

            let abc = guard
                .call1(("collections.abc", py.None(), py.None(), ("Mapping",), 0))
                .unwrap();
            assert!(abc.hasattr("Mapping").unwrap());
        });
    }

    #[test]
    fn unguarded_returns_the_wrapped_primitive() {
        let _lock = lock_interpreter();
        Python::with_gil(|py| {
            let builtins = py.import_bound("builtins").unwrap();
            let open = unguarded(builtins.getattr("open").unwrap());
            let guard = Bound::new(
                py,
                OpenGuard::new(Arc::new(CapabilityPolicy::default()), open.clone_ref(py)),
            )
            .unwrap();
            assert!(unguarded(guard.into_any()).bind(py).is(&open));
        });
    }

    #[test]
    fn open_and_input_guards_raise_policy_errors() {
        let _lock = lock_interpreter();
        Python::with_gil(|py| {
            let builtins = py.import_bound("builtins").unwrap();
            let policy = Arc::new(CapabilityPolicy::default());

            let open = Bound::new(
                py,
                OpenGuard::new(policy.clone(), builtins.getattr("open").unwrap().unbind()),
            )
            .unwrap();
            let err = open.call1(("/etc/hostname",)).unwrap_err();
            assert!(err.is_instance_of::<PyPermissionError>(py));
            assert_eq!(
                err.value_bound(py).to_string(),
                "File access is disabled in this sandbox."
            );

            let input = Bound::new(
                py,
                InputGuard::new(policy, builtins.getattr("input").unwrap().unbind()),
            )
            .unwrap();
            let err = input.call0().unwrap_err();
            assert!(err.is_instance_of::<PyEOFError>(py));
        });
    }
}
