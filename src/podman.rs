use crate::config;
use crate::engine::{
    ContainerEngine, ContainerHandle, EngineConnector, EngineError, HistoryEntry, RegistryAuth,
};
use crate::image_reference::ImageReference;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Certificate, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::fs;
use tracing::{debug, info};

const REGISTRY_AUTH_HEADER: &str = "X-Registry-Auth";

/// Opens sessions against the Podman libpod REST API.
pub struct PodmanConnector {
    base_url: String,
    ca_certificates: Vec<Certificate>,
}

impl PodmanConnector {
    pub fn new(engine: &config::Engine) -> Result<Self> {
        info!("Initializing Podman connector for {}", engine.url);
        // System certificates are loaded automatically with rustls-tls-native-roots
        let mut ca_certificates = Vec::new();
        for file_path in &engine.ca_certificate_paths {
            let file_content = fs::read(file_path)
                .with_context(|| format!("Failed to read file {}", file_path.display()))?;
            let cert =
                Certificate::from_pem(&file_content).context("Failed to parse certificate")?;
            ca_certificates.push(cert);
        }

        Ok(Self {
            base_url: libpod_base_url(&engine.url, &engine.api_version),
            ca_certificates,
        })
    }

    fn build_client(&self) -> Result<Client, EngineError> {
        let mut client_builder = Client::builder();
        for cert in &self.ca_certificates {
            client_builder = client_builder.add_root_certificate(cert.clone());
        }
        client_builder
            .build()
            .map_err(|e| EngineError::Setup(e.to_string()))
    }
}

fn libpod_base_url(url: &str, api_version: &str) -> String {
    let url = url.trim_end_matches('/');
    let api_version = api_version.trim_matches('/');
    if api_version.is_empty() {
        format!("{}/libpod", url)
    } else {
        format!("{}/{}/libpod", url, api_version)
    }
}

#[async_trait]
impl EngineConnector for PodmanConnector {
    async fn connect(&self) -> Result<Box<dyn ContainerEngine>, EngineError> {
        let engine = PodmanEngine {
            client: self.build_client()?,
            base_url: self.base_url.clone(),
        };
        engine.ping().await?;
        Ok(Box::new(engine))
    }
}

/// One libpod session. A new one is created for every probe cycle.
pub struct PodmanEngine {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct ProgressMessage {
    stream: Option<String>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct HistoryItem {
    #[serde(rename = "Id", alias = "id")]
    id: String,
    #[serde(rename = "Tags", alias = "tags", default)]
    tags: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct IdResponse {
    #[serde(rename = "Id", alias = "id")]
    id: String,
}

#[derive(Deserialize, Default)]
struct RemoveReport {
    #[serde(rename = "Errors", default)]
    errors: Option<Vec<serde_json::Value>>,
}

impl PodmanEngine {
    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn ping(&self) -> Result<(), EngineError> {
        let response = self.client.get(self.url("_ping")).send().await?;
        check_status("ping", response).await?;
        Ok(())
    }

    async fn send(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<Response, EngineError> {
        debug!("Sending {} request to container engine", operation);
        let response = request.send().await?;
        check_status(operation, response).await
    }
}

async fn check_status(operation: &'static str, response: Response) -> Result<Response, EngineError> {
    let status = response.status();
    if status.is_success() || status == StatusCode::NOT_MODIFIED {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(EngineError::Status {
        operation,
        status: status.as_u16(),
        body: body.trim().to_string(),
    })
}

/// Drains a streamed pull/push response. libpod reports failures inside the
/// stream with HTTP 200, so every JSON line is inspected for an `error` field.
async fn read_progress(operation: &'static str, response: Response) -> Result<(), EngineError> {
    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            inspect_progress_line(operation, &line)?;
        }
    }
    inspect_progress_line(operation, &buffer)
}

fn inspect_progress_line(operation: &'static str, line: &[u8]) -> Result<(), EngineError> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return Ok(());
    }
    match serde_json::from_str::<ProgressMessage>(text) {
        Ok(message) => {
            if let Some(error) = message.error.filter(|e| !e.trim().is_empty()) {
                return Err(EngineError::Reported {
                    operation,
                    message: error.trim().to_string(),
                });
            }
            if let Some(stream) = message.stream {
                debug!("{}: {}", operation, stream.trim());
            }
        }
        Err(_) => debug!("{}: {}", operation, text),
    }
    Ok(())
}

fn with_auth(request: RequestBuilder, auth: Option<&RegistryAuth>) -> RequestBuilder {
    match auth {
        Some(auth) => request.header(REGISTRY_AUTH_HEADER, auth.header_value()),
        None => request,
    }
}

#[async_trait]
impl ContainerEngine for PodmanEngine {
    async fn pull(
        &self,
        reference: &ImageReference,
        auth: Option<&RegistryAuth>,
    ) -> Result<(), EngineError> {
        info!("Pulling image {}", reference);
        let request = self
            .client
            .post(self.url("images/pull"))
            .query(&[("reference", reference.to_string())]);
        let response = self.send("pull", with_auth(request, auth)).await?;
        read_progress("pull", response).await
    }

    async fn history(&self, image: &str) -> Result<Vec<HistoryEntry>, EngineError> {
        let response = self
            .send(
                "history",
                self.client.get(self.url(&format!("images/{}/history", image))),
            )
            .await?;
        let bytes = response.bytes().await?;
        let items: Vec<HistoryItem> =
            serde_json::from_slice(&bytes).map_err(|source| EngineError::Decode {
                operation: "history",
                source,
            })?;
        Ok(items
            .into_iter()
            .map(|item| HistoryEntry {
                id: item.id,
                tags: item.tags.unwrap_or_default(),
            })
            .collect())
    }

    async fn remove_images(&self, ids: &[String]) -> Result<(), EngineError> {
        let query: Vec<(&str, &str)> = ids.iter().map(|id| ("images", id.as_str())).collect();
        let response = self
            .send(
                "remove",
                self.client.delete(self.url("images/remove")).query(&query),
            )
            .await?;
        let bytes = response.bytes().await?;
        let report: RemoveReport = if bytes.is_empty() {
            RemoveReport::default()
        } else {
            serde_json::from_slice(&bytes).map_err(|source| EngineError::Decode {
                operation: "remove",
                source,
            })?
        };
        match report.errors.filter(|errors| !errors.is_empty()) {
            Some(errors) => Err(EngineError::Reported {
                operation: "remove",
                message: errors
                    .iter()
                    .map(|e| e.as_str().map(str::to_string).unwrap_or_else(|| e.to_string()))
                    .collect::<Vec<_>>()
                    .join("; "),
            }),
            None => Ok(()),
        }
    }

    async fn create_container(
        &self,
        image: &ImageReference,
        name: &str,
    ) -> Result<ContainerHandle, EngineError> {
        let spec = json!({
            "image": image.to_string(),
            "name": name,
        });
        let response = self
            .send(
                "create",
                self.client.post(self.url("containers/create")).json(&spec),
            )
            .await?;
        let bytes = response.bytes().await?;
        let created: IdResponse =
            serde_json::from_slice(&bytes).map_err(|source| EngineError::Decode {
                operation: "create",
                source,
            })?;
        Ok(ContainerHandle {
            id: created.id,
            name: name.to_string(),
        })
    }

    async fn commit(
        &self,
        container: &ContainerHandle,
        target: &ImageReference,
    ) -> Result<(), EngineError> {
        let request = self.client.post(self.url("commit")).query(&[
            ("container", container.id.clone()),
            ("repo", target.name()),
            ("tag", target.tag.clone()),
        ]);
        self.send("commit", request).await?;
        Ok(())
    }

    async fn start(&self, container: &ContainerHandle) -> Result<(), EngineError> {
        let url = self.url(&format!("containers/{}/start", container.id));
        self.send("start", self.client.post(url)).await?;
        Ok(())
    }

    async fn kill(&self, container: &ContainerHandle, signal: &str) -> Result<(), EngineError> {
        let url = self.url(&format!("containers/{}/kill", container.id));
        self.send("kill", self.client.post(url).query(&[("signal", signal)]))
            .await?;
        Ok(())
    }

    async fn push(
        &self,
        source: &ImageReference,
        destination: &ImageReference,
        auth: &RegistryAuth,
    ) -> Result<(), EngineError> {
        info!("Pushing image {} to {}", source, destination);
        let request = self
            .client
            .post(self.url(&format!("images/{}/push", source)))
            .query(&[("destination", destination.to_string())]);
        let response = self.send("push", with_auth(request, Some(auth))).await?;
        read_progress("push", response).await
    }
}
