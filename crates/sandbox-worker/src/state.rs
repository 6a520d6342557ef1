use std::sync::atomic::{AtomicU8, Ordering};

/// Worker lifecycle.
///
/// ```text
/// Uninitialized -> Booting -> Ready <-> Busy
///                     |                  |
///                     +----> Failed <----+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Uninitialized = 0,
    Booting = 1,
    Ready = 2,
    Busy = 3,
    Failed = 4,
}

impl LifecycleState {
    fn from_u8(v: u8) -> Self {
        debug_assert!(v <= 4, "invalid LifecycleState: {v}");
        match v {
            0 => Self::Uninitialized,
            1 => Self::Booting,
            2 => Self::Ready,
            3 => Self::Busy,
            _ => Self::Failed,
        }
    }

    pub fn can_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Uninitialized, Self::Booting)
                | (Self::Booting, Self::Ready)
                | (Self::Booting, Self::Failed)
                | (Self::Ready, Self::Busy)
                | (Self::Busy, Self::Ready)
                | (Self::Busy, Self::Failed)
        )
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => f.write_str("uninitialized"),
            Self::Booting => f.write_str("booting"),
            Self::Ready => f.write_str("ready"),
            Self::Busy => f.write_str("busy"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// Shared, lock-free holder of the current [`LifecycleState`].
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(LifecycleState::Uninitialized as u8))
    }

    pub(crate) fn current(&self) -> LifecycleState {
        LifecycleState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Atomically move `from -> to`. Returns `false` if the edge is not part
    /// of the lifecycle or the current state is not `from`.
    pub(crate) fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        from.can_transition(to)
            && self
                .0
                .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }
}
