//! Capability policy: which guest operations are allowed.
//!
//! The policy is backend-neutral. A backend installs guards around its
//! interpreter's open-file, import-module and read-input primitives; each
//! guard consults the policy and turns a [`PolicyViolation`] into the guest
//! language's own exception.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};

/// Modules guest code may import when no explicit allow-list is configured.
pub const DEFAULT_ALLOWED_MODULES: &[&str] = &[
    "math",
    "random",
    "statistics",
    "itertools",
    "functools",
    "collections",
];

/// A guest operation refused by the policy. `Display` is the exact text the
/// guest sees in its exception.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyViolation {
    #[error("File access is disabled in this sandbox.")]
    FileAccessDenied,

    #[error("Import of '{0}' is not allowed")]
    ImportRejected(String),

    #[error("No input available in this sandbox.")]
    InputUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityPolicy {
    /// Root module names guest code may import.
    pub allowed_modules: BTreeSet<String>,
    pub deny_file_access: bool,
    pub deny_input: bool,
}

impl Default for CapabilityPolicy {
    fn default() -> Self {
        Self {
            allowed_modules: DEFAULT_ALLOWED_MODULES
                .iter()
                .map(|m| (*m).to_string())
                .collect(),
            deny_file_access: true,
            deny_input: true,
        }
    }
}

/// Root package of a dotted module path (`"a.b.c"` -> `"a"`).
pub fn root_module(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

impl CapabilityPolicy {
    pub fn with_modules<I, S>(modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_modules: modules.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn allows_module(&self, name: &str) -> bool {
        self.allowed_modules.contains(root_module(name))
    }

    pub fn check_import(&self, name: &str) -> std::result::Result<(), PolicyViolation> {
        if self.allows_module(name) {
            Ok(())
        } else {
            Err(PolicyViolation::ImportRejected(name.to_string()))
        }
    }

    pub fn check_open(&self) -> std::result::Result<(), PolicyViolation> {
        if self.deny_file_access {
            Err(PolicyViolation::FileAccessDenied)
        } else {
            Ok(())
        }
    }

    pub fn check_input(&self) -> std::result::Result<(), PolicyViolation> {
        if self.deny_input {
            Err(PolicyViolation::InputUnavailable)
        } else {
            Ok(())
        }
    }

    /// Reject allow-list entries that could never match an import statement.
    pub fn validate(&self) -> Result<()> {
        for module in &self.allowed_modules {
            if !is_module_name(module) {
                return Err(SandboxError::InvalidConfig(format!(
                    "allowed module {module:?} is not a top-level module name"
                )));
            }
        }
        Ok(())
    }
}

fn is_module_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first == '_' || first.is_alphabetic() => {
            chars.all(|c| c == '_' || c.is_alphanumeric())
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_allows_teaching_modules_only() {
        let policy = CapabilityPolicy::default();
        for module in DEFAULT_ALLOWED_MODULES {
            assert!(policy.check_import(module).is_ok(), "{module} should pass");
        }
        assert_eq!(
            policy.check_import("os"),
            Err(PolicyViolation::ImportRejected("os".into()))
        );
        assert!(policy.deny_file_access);
        assert!(policy.deny_input);
    }

    #[test]
    fn dotted_imports_use_root_module() {
        let policy = CapabilityPolicy::default();
        assert!(policy.check_import("collections.abc").is_ok());
        assert!(policy.check_import("os.path").is_err());
        assert!(policy.check_import("mathx").is_err());
    }

    #[test]
    fn rejection_message_names_full_module() {
        let policy = CapabilityPolicy::default();
        let err = policy.check_import("urllib.request").unwrap_err();
        assert_eq!(err.to_string(), "Import of 'urllib.request' is not allowed");
    }

    #[test]
    fn empty_and_relative_imports_are_rejected() {
        let policy = CapabilityPolicy::default();
        assert!(policy.check_import("").is_err());
    }

    #[test]
    fn violation_messages() {
        assert_eq!(
            PolicyViolation::FileAccessDenied.to_string(),
            "File access is disabled in this sandbox."
        );
        assert_eq!(
            PolicyViolation::InputUnavailable.to_string(),
            "No input available in this sandbox."
        );
    }

    #[test]
    fn denials_can_be_lifted() {
        let policy = CapabilityPolicy {
            deny_file_access: false,
            deny_input: false,
            ..CapabilityPolicy::default()
        };
        assert!(policy.check_open().is_ok());
        assert!(policy.check_input().is_ok());
        assert_eq!(
            CapabilityPolicy::default().check_open(),
            Err(PolicyViolation::FileAccessDenied)
        );
    }

    #[test]
    fn with_modules_replaces_allow_list() {
        let policy = CapabilityPolicy::with_modules(["json"]);
        assert!(policy.check_import("json").is_ok());
        assert!(policy.check_import("math").is_err());
        assert!(policy.deny_file_access);
    }

    #[test]
    fn validate_rejects_bad_names() {
        assert!(CapabilityPolicy::default().validate().is_ok());
        for bad in ["", "os.path", "1abc", "a-b"] {
            let policy = CapabilityPolicy::with_modules([bad]);
            assert!(
                matches!(policy.validate(), Err(SandboxError::InvalidConfig(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn deserialize_fills_defaults() {
        let policy: CapabilityPolicy =
            serde_json::from_str(r#"{"allowed_modules": ["math"]}"#).unwrap();
        assert_eq!(policy.allowed_modules.len(), 1);
        assert!(policy.deny_file_access);
        assert!(policy.deny_input);

        let policy: CapabilityPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy, CapabilityPolicy::default());
    }
}
