//! Service validators.
//!
//! Stateless predicates over a service spec. Every validator runs before any
//! engine work is scheduled for a service; the first failure vetoes the
//! service, which is then reported as exited with the validator's message
//! until its spec changes.

mod custom_commands;
mod image;

pub use custom_commands::CustomCommandsValidator;
pub use image::ImageValidator;

use crate::models::Service;

/// A rejected service spec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ValidationError {
    /// Operator-facing rejection message, reported verbatim as the service's
    /// error message.
    pub message: String,
}

impl ValidationError {
    /// Creates a validation error from a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A stateless predicate over a service spec.
pub trait Validator: Send + Sync + 'static {
    /// Checks whether `service` may be scheduled on this device.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] whose message is reported upstream when
    /// the service is vetoed.
    fn validate(&self, service: &Service) -> Result<(), ValidationError>;

    /// Short name identifying the validator in logs.
    fn name(&self) -> &'static str;
}
