//! Image whitelist validator.

use std::sync::Arc;

use super::{ValidationError, Validator};
use crate::models::Service;
use crate::variables::Variables;

/// Rejects services whose image matches none of the whitelisted prefixes.
///
/// An absent whitelist allows everything; an empty whitelist allows nothing.
pub struct ImageValidator {
    variables: Arc<dyn Variables>,
}

impl ImageValidator {
    /// Creates the validator over the given policy source.
    #[must_use]
    pub fn new(variables: Arc<dyn Variables>) -> Self {
        Self { variables }
    }
}

impl Validator for ImageValidator {
    fn validate(&self, service: &Service) -> Result<(), ValidationError> {
        if let Some(prefixes) = self.variables.whitelisted_images() {
            let allowed = prefixes
                .iter()
                .any(|prefix| service.image.starts_with(prefix));
            if !allowed {
                return Err(ValidationError::new(format!(
                    "image {} is not whitelisted on this device",
                    service.image
                )));
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "image-whitelist"
    }
}
