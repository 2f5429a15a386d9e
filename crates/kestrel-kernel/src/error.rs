use thiserror::Error;

use crate::types::Priority;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("invalid priority {0}: must be between {min} and {max}", min = Priority::MIN, max = Priority::MAX)]
    InvalidPriority(u8),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to spawn thread '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}
