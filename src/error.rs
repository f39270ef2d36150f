//! Error types for registry and atom operations.
//!
//! Synchronous failures surface as [`AtomError`] through the crate-wide
//! [`Result`] alias. Failures inside effect-backed atoms never take this
//! route; they are captured into [`crate::AsyncResult::Failure`] and
//! delivered to subscribers as ordinary value transitions.

use thiserror::Error;

use crate::types::NodeKey;

/// Main error type for atomflow operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AtomError {
    /// Any registry access after `dispose`.
    #[error("registry is disposed")]
    RegistryDisposed,

    /// A context method was used after its owning lifetime was torn down.
    #[error("context of disposed atom")]
    ContextDisposed,

    /// A read function re-entered the node it is currently evaluating.
    #[error("circular dependency detected while evaluating {node}")]
    CircularDependency {
        node: NodeKey,
    },

    /// The atom's synchronous read raised. The node stays stale and will
    /// retry on the next read.
    #[error("error reading {node}: {message}")]
    ReadError {
        node: NodeKey,
        message: String,
    },

    /// Write attempted through a node that does not accept it.
    #[error("atom {node} is read-only and cannot be written to")]
    NotWritable {
        node: NodeKey,
    },

    /// Two atoms share a serializable key but disagree on the value type,
    /// or an encoded value could not be decoded into the node's type.
    #[error("type mismatch for {node}: expected {expected}")]
    TypeMismatch {
        node: NodeKey,
        expected: &'static str,
    },

    /// A stream-backed atom closed without emitting a value.
    #[error("stream for {node} closed without emitting")]
    NoElement {
        node: NodeKey,
    },
}

/// Result type alias for atomflow operations.
pub type Result<T> = std::result::Result<T, AtomError>;

impl AtomError {
    /// Wrap an arbitrary failure from a user read function.
    pub fn read_error(node: NodeKey, error: impl std::fmt::Display) -> Self {
        AtomError::ReadError {
            node,
            message: error.to_string(),
        }
    }

    pub fn type_mismatch<T: 'static>(node: NodeKey) -> Self {
        AtomError::TypeMismatch {
            node,
            expected: std::any::type_name::<T>(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disposed_messages() {
        assert_eq!(AtomError::RegistryDisposed.to_string(), "registry is disposed");
        assert_eq!(AtomError::ContextDisposed.to_string(), "context of disposed atom");
    }

    #[test]
    fn test_read_error_wraps_message() {
        let err = AtomError::read_error(NodeKey::Id(4), "boom");
        assert!(err.to_string().contains("atom4"));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_type_mismatch_names_expected_type() {
        let err = AtomError::type_mismatch::<i32>(NodeKey::Serial("cart".into()));
        assert!(err.to_string().contains("i32"));
        assert!(err.to_string().contains("cart"));
    }
}
