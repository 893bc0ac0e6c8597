//! Custom command validator.

use std::sync::Arc;

use super::{ValidationError, Validator};
use crate::models::Service;
use crate::variables::Variables;

const ERR_CUSTOM_COMMANDS_DISABLED: &str = "custom commands are disabled on this device";

/// Rejects services carrying `command`/`entrypoint` overrides when the
/// device policy disables custom commands.
pub struct CustomCommandsValidator {
    variables: Arc<dyn Variables>,
}

impl CustomCommandsValidator {
    /// Creates the validator over the given policy source.
    #[must_use]
    pub fn new(variables: Arc<dyn Variables>) -> Self {
        Self { variables }
    }
}

impl Validator for CustomCommandsValidator {
    fn validate(&self, service: &Service) -> Result<(), ValidationError> {
        if self.variables.disable_custom_commands()
            && (!service.command.is_empty() || !service.entrypoint.is_empty())
        {
            return Err(ValidationError::new(ERR_CUSTOM_COMMANDS_DISABLED));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "custom-commands"
    }
}
