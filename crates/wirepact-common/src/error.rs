//! Error types for the WirePact operator
//!
//! Errors are structured with fields to aid debugging in production. Reference
//! errors name the missing object and the resource that pointed at it, so the
//! log line and the Warning event alone explain what to fix.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for WirePact operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A related object that reconciliation depends on does not exist
    #[error("no {kind} \"{name}\" found for {owner}")]
    MissingReference {
        /// Kind of the missing object (e.g. "Deployment", "TranslatorDefinition")
        kind: String,
        /// Name of the missing object
        name: String,
        /// Object that holds the reference (e.g. "participant default/app")
        owner: String,
    },

    /// Validation error for CRD specs
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// No free port could be found in the allocation range
    #[error("no free port found for {participant} after {attempts} attempts")]
    PortExhausted {
        /// Participant the allocation was for
        participant: String,
        /// How many candidates were drawn
        attempts: u32,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "ca", "participant", "webhook")
        context: String,
    },
}

impl Error {
    /// Create a reference error for a missing object
    pub fn missing(
        kind: impl Into<String>,
        name: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        Self::MissingReference {
            kind: kind.into(),
            name: name.into(),
            owner: owner.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error for a named resource
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Missing references are retryable: the referenced object may simply not
    /// have been created yet. Write conflicts (409) are retried with the fresh
    /// object on the next pass. Validation and serialization errors need a
    /// spec change.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if ae.code == 409 => true,
                kube::Error::Api(ae) => !(400..500).contains(&ae.code),
                _ => true,
            },
            Error::MissingReference { .. } => true,
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::PortExhausted { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// True if the underlying API error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }
}
