use crate::image_reference::{ImageReference, LATEST_TAG};
use crate::secret_string::SecretString;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE;
use serde_json::json;

pub const SIGKILL: &str = "SIGKILL";

/// Registry credentials handed to pull and push operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    pub username: String,
    pub password: SecretString,
}

impl RegistryAuth {
    /// Value for the `X-Registry-Auth` header: base64url-encoded JSON.
    pub fn header_value(&self) -> String {
        let payload = json!({
            "username": self.username,
            "password": self.password.expose_secret(),
        });
        URL_SAFE.encode(payload.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub id: String,
    pub tags: Vec<String>,
}

impl HistoryEntry {
    /// Only a bare `latest` tag counts. Fully qualified tags such as
    /// `host/app:latest` name the image the next container is created from.
    pub fn is_tagged_latest(&self) -> bool {
        self.tags.iter().any(|tag| tag == LATEST_TAG)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("request to container engine failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("container engine returned status {status} for {operation}: {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },
    #[error("{operation} reported an error: {message}")]
    Reported {
        operation: &'static str,
        message: String,
    },
    #[error("failed to decode {operation} response: {source}")]
    Decode {
        operation: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to configure container engine session: {0}")]
    Setup(String),
}

/// Operations the prober needs from a container engine session.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn pull(
        &self,
        reference: &ImageReference,
        auth: Option<&RegistryAuth>,
    ) -> Result<(), EngineError>;

    /// Image history, most recent entry first.
    async fn history(&self, image: &str) -> Result<Vec<HistoryEntry>, EngineError>;

    async fn remove_images(&self, ids: &[String]) -> Result<(), EngineError>;

    async fn create_container(
        &self,
        image: &ImageReference,
        name: &str,
    ) -> Result<ContainerHandle, EngineError>;

    /// Commits the container's filesystem as a new image tagged `target`.
    async fn commit(
        &self,
        container: &ContainerHandle,
        target: &ImageReference,
    ) -> Result<(), EngineError>;

    async fn start(&self, container: &ContainerHandle) -> Result<(), EngineError>;

    async fn kill(&self, container: &ContainerHandle, signal: &str) -> Result<(), EngineError>;

    async fn push(
        &self,
        source: &ImageReference,
        destination: &ImageReference,
        auth: &RegistryAuth,
    ) -> Result<(), EngineError>;
}

/// Opens a fresh engine session. Called at the start of every cycle.
#[async_trait]
pub trait EngineConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ContainerEngine>, EngineError>;
}
