//! Error types reported by the fallible heap entry points.
//!
//! Underlying allocation failure is not represented here: it is reported via
//! [`std::alloc::handle_alloc_error`] and is fatal. Collector invariant
//! anomalies are never raised either, they are ignored and logged.

use thiserror::Error;

/// Main error type for tgc operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GcError {
    /// An array allocation whose payload size does not fit in the address space.
    #[error("capacity overflow: {count} elements of {size} bytes")]
    CapacityOverflow { count: usize, size: usize },

    /// Rejected heap configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias used by tgc.
pub type Result<T> = std::result::Result<T, GcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_values() {
        let err = GcError::CapacityOverflow {
            count: usize::MAX,
            size: 16,
        };
        assert_eq!(
            err.to_string(),
            format!("capacity overflow: {} elements of 16 bytes", usize::MAX)
        );

        let err = GcError::InvalidConfig("default_step_budget must be non-zero".into());
        assert!(err.to_string().starts_with("invalid configuration"));
    }
}
