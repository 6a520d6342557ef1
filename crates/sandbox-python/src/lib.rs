//! Embedded CPython sandbox backend.
//!
//! One interpreter per process. The real `builtins` module, and each run's
//! copy of it, carry guards in place of `__import__`, `open` and `input` that
//! consult the [`sandbox::CapabilityPolicy`]. Standard streams are captured
//! per run.

mod capture;
mod factory;
mod guards;
mod program;
mod sandbox;

pub use factory::PythonFactory;
pub use sandbox::PythonSandbox;
