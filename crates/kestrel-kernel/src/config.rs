use crate::error::KernelError;
use crate::types::Priority;

/// Longest chain of blocked-on edges a single acquire propagates a donation
/// along before giving up.
pub const DEFAULT_MAX_DONATION_DEPTH: usize = 11;

/// Ready-queue policy used by the thread manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerKind {
    /// Highest effective priority first, FIFO among equals.
    #[default]
    Priority,
    /// Plain FIFO. Priorities only affect wait-queue ordering.
    RoundRobin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// `None` walks donation chains until they end.
    pub max_donation_depth: Option<usize>,
    pub scheduler: SchedulerKind,
    /// Priority of the thread that boots the kernel.
    pub main_priority: Priority,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_donation_depth: Some(DEFAULT_MAX_DONATION_DEPTH),
            scheduler: SchedulerKind::default(),
            main_priority: Priority::DEFAULT,
        }
    }
}

impl KernelConfig {
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.max_donation_depth == Some(0) {
            return Err(KernelError::InvalidConfig(
                "max_donation_depth must be at least 1 (use None for no bound)".into(),
            ));
        }
        Ok(())
    }
}
