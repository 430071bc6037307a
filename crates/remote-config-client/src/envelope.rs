//! Decoding of poll responses into a [`ResponseEnvelope`].

use std::collections::HashMap;

use remote_config_wire::ClientGetConfigsResponse;
use thiserror::Error;

use crate::targets::{TargetDescriptor, TargetsDocument};

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("response of {size} bytes exceeds the maximum payload size of {limit} bytes")]
    TooLarge { size: usize, limit: usize },
    #[error("malformed response body: {0}")]
    Body(#[source] serde_json::Error),
    #[error("malformed targets metadata: {0}")]
    Targets(#[source] serde_json::Error),
}

/// One decoded poll response.
#[derive(Debug, Clone)]
pub struct ResponseEnvelope {
    targets: TargetsDocument,
    client_configs: Vec<String>,
    target_files: Vec<String>,
    contents: HashMap<String, Vec<u8>>,
}

impl ResponseEnvelope {
    /// Decodes a response body.
    ///
    /// Returns `Ok(None)` when the body carries no targets metadata, which the
    /// agent uses to signal that nothing changed.
    pub fn parse(body: &[u8], max_size: usize) -> Result<Option<Self>, EnvelopeError> {
        if body.len() > max_size {
            return Err(EnvelopeError::TooLarge {
                size: body.len(),
                limit: max_size,
            });
        }
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        let response: ClientGetConfigsResponse =
            serde_json::from_slice(body).map_err(EnvelopeError::Body)?;
        let Some(raw_targets) = response.targets else {
            return Ok(None);
        };
        let targets = TargetsDocument::from_bytes(&raw_targets).map_err(EnvelopeError::Targets)?;

        let mut target_files = Vec::with_capacity(response.target_files.len());
        let mut contents = HashMap::with_capacity(response.target_files.len());
        for file in response.target_files {
            target_files.push(file.path.clone());
            contents.insert(file.path, file.raw);
        }

        Ok(Some(Self {
            targets,
            client_configs: response.client_configs,
            target_files,
            contents,
        }))
    }

    pub fn targets(&self) -> &TargetsDocument {
        &self.targets
    }

    /// Config paths the server wants applied this cycle, in server order.
    pub fn client_configs(&self) -> &[String] {
        &self.client_configs
    }

    /// Paths delivered in the raw-content section, in server order.
    pub fn target_file_paths(&self) -> &[String] {
        &self.target_files
    }

    pub fn get_target(&self, path: &str) -> Option<&TargetDescriptor> {
        self.targets.get_target(path)
    }

    pub fn file_contents(&self, path: &str) -> Option<&[u8]> {
        self.contents.get(path).map(Vec::as_slice)
    }
}
