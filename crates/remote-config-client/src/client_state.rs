//! The client state reported on the next request.
//!
//! A fresh [`NextClientState`] is built at the end of every processed
//! response and swapped in whole; a value that has been sent is never edited.

use remote_config_wire::{ClientState, ConfigState};

use crate::targets::TargetsDocument;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NextClientState {
    targets_version: u64,
    config_states: Vec<ConfigState>,
    error: Option<String>,
    backend_client_state: Option<String>,
}

impl NextClientState {
    pub fn targets_version(&self) -> u64 {
        self.targets_version
    }

    pub fn config_states(&self) -> &[ConfigState] {
        &self.config_states
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn backend_client_state(&self) -> Option<&str> {
        self.backend_client_state.as_deref()
    }

    /// State after a response was rejected before anything was applied.
    pub fn rejected(&self, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..self.clone()
        }
    }

    /// State after a response was applied.
    ///
    /// `targets_version` only advances when the cycle had neither procedural
    /// errors nor failed keys, so the server keeps offering a complete delta
    /// until everything applied.
    pub fn applied(
        &self,
        targets: &TargetsDocument,
        config_states: Vec<ConfigState>,
        procedural_errors: &[String],
    ) -> Self {
        let error = build_error_message(procedural_errors);
        let any_key_failed = config_states
            .iter()
            .any(|state| state.apply_error.is_some());
        let targets_version = if error.is_none() && !any_key_failed {
            targets.version()
        } else {
            self.targets_version
        };
        Self {
            targets_version,
            config_states,
            error,
            backend_client_state: targets.opaque_backend_state().map(str::to_string),
        }
    }

    pub fn to_wire(&self) -> ClientState {
        ClientState {
            targets_version: self.targets_version,
            config_states: self.config_states.clone(),
            has_error: self.has_error(),
            error: self.error.clone(),
            backend_client_state: self.backend_client_state.clone(),
            ..ClientState::default()
        }
    }
}

/// Joins procedural errors into one message: a single error is kept as is,
/// several are numbered.
pub fn build_error_message(errors: &[String]) -> Option<String> {
    match errors {
        [] => None,
        [single] => Some(single.clone()),
        _ => {
            let mut message = format!(
                "Failed to apply configuration due to {} errors:\n",
                errors.len()
            );
            for (idx, error) in errors.iter().enumerate() {
                message.push_str(&format!(" ({}) {error}\n", idx + 1));
            }
            Some(message)
        }
    }
}
