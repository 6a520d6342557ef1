use crate::policy::CapabilityPolicy;

/// Everything a backend needs to boot one sandbox instance.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub id: uuid::Uuid,
    pub policy: CapabilityPolicy,
}

impl SandboxConfig {
    pub fn new(policy: CapabilityPolicy) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            policy,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::new(CapabilityPolicy::default())
    }
}
