use std::time::Duration;

/// Category of a contained guest failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Guest tried to open a file.
    PermissionDenied,
    /// Guest imported a module outside the allow-list.
    ImportRejected,
    /// Any other uncaught guest exception.
    Runtime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestFault {
    pub kind: FaultKind,
    /// Last line of the formatted exception, e.g. `ZeroDivisionError: division by zero`.
    pub message: String,
}

/// How a submission ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Completed,
    /// Guest called `exit()` / raised `SystemExit`.
    CleanExit,
    Fault(GuestFault),
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub termination: Termination,
    pub stdout: String,
    pub stderr: String,
    /// `str()` of the trailing expression, when it evaluated to something other than `None`.
    pub value: Option<String>,
    pub elapsed: Duration,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        !matches!(self.termination, Termination::Fault(_))
    }

    pub fn fault(&self) -> Option<&GuestFault> {
        match &self.termination {
            Termination::Fault(fault) => Some(fault),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        self.fault().map(|f| f.message.as_str())
    }

    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(termination: Termination) -> ExecResult {
        ExecResult {
            termination,
            stdout: String::new(),
            stderr: String::new(),
            value: None,
            elapsed: Duration::from_millis(12),
        }
    }

    #[test]
    fn clean_exit_counts_as_success() {
        assert!(result(Termination::Completed).success());
        assert!(result(Termination::CleanExit).success());
        assert!(result(Termination::CleanExit).error().is_none());
    }

    #[test]
    fn fault_exposes_message() {
        let r = result(Termination::Fault(GuestFault {
            kind: FaultKind::ImportRejected,
            message: "ImportError: Import of 'os' is not allowed".into(),
        }));
        assert!(!r.success());
        assert_eq!(r.fault().map(|f| f.kind), Some(FaultKind::ImportRejected));
        assert_eq!(r.error(), Some("ImportError: Import of 'os' is not allowed"));
        assert_eq!(r.elapsed_ms(), 12);
    }
}
