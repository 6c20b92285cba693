use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error};

use crate::error::InstancerError;
use crate::models::BackendServer;

/// The remote container-runtime boundary. The production impl talks to
/// the docker engine http api; tests swap in a mock. Implementations
/// hold no instance state, every call is keyed by what the caller
/// passes in.
#[async_trait]
pub trait ContainerRuntime {
    /// Image names (first repo tag) available on the server.
    async fn list_images(&self, server: &BackendServer) -> Result<Vec<String>, InstancerError>;

    /// The single exposed port spec of an image, e.g. `1337/tcp`.
    async fn exposed_port(
        &self,
        server: &BackendServer,
        image: &str,
    ) -> Result<String, InstancerError>;

    /// Creates a container binding `exposed_port` to `host_port`,
    /// returns the container id.
    async fn create_container(
        &self,
        server: &BackendServer,
        image: &str,
        exposed_port: &str,
        host_port: u16,
    ) -> Result<String, InstancerError>;

    async fn start_container(
        &self,
        server: &BackendServer,
        container_id: &str,
    ) -> Result<(), InstancerError>;

    async fn stop_container(
        &self,
        server: &BackendServer,
        container_id: &str,
    ) -> Result<(), InstancerError>;
}

#[derive(Deserialize, Debug)]
struct ImageSummary {
    #[serde(rename = "RepoTags")]
    repo_tags: Option<Vec<String>>,
}

#[derive(Deserialize, Debug)]
struct ImageInspect {
    #[serde(rename = "Config")]
    config: ImageConfig,
}

#[derive(Deserialize, Debug)]
struct ImageConfig {
    #[serde(rename = "ExposedPorts")]
    exposed_ports: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Deserialize, Debug)]
struct ContainerCreated {
    #[serde(rename = "Id")]
    id: String,
}

/// Reqwest-backed client for the docker engine http api. One shared
/// client serves every backend server; requests are bounded by the
/// configured timeout so a dead backend cannot stall a request task
/// indefinitely.
#[derive(Clone)]
pub struct DockerApi {
    client: reqwest::Client,
    stop_timeout: u32,
}

impl DockerApi {
    pub fn new(request_timeout: Duration, stop_timeout: u32) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            stop_timeout,
        })
    }

    fn unreachable(server: &BackendServer, source: reqwest::Error) -> InstancerError {
        error!("server {} ({}) unreachable: {}", server.id, server.name, source);
        InstancerError::ServerUnreachable {
            server_id: server.id,
            message: source.to_string(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerApi {
    async fn list_images(&self, server: &BackendServer) -> Result<Vec<String>, InstancerError> {
        let url = format!("{}/images/json", server.url());

        let images: Vec<ImageSummary> = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::unreachable(server, e))?
            .json()
            .await
            .map_err(|e| Self::unreachable(server, e))?;

        Ok(images
            .into_iter()
            .filter_map(|i| i.repo_tags.and_then(|tags| tags.into_iter().next()))
            .collect())
    }

    async fn exposed_port(
        &self,
        server: &BackendServer,
        image: &str,
    ) -> Result<String, InstancerError> {
        let url = format!("{}/images/{}/json?all=1", server.url(), image);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::unreachable(server, e))?;

        if resp.status() != StatusCode::OK {
            return Err(InstancerError::NoExposedPort {
                image: image.to_string(),
            });
        }

        let inspect: ImageInspect = resp.json().await.map_err(|e| Self::unreachable(server, e))?;

        // only one exposed port per image is supported; with several
        // declared we take whichever comes first
        inspect
            .config
            .exposed_ports
            .and_then(|ports| ports.into_keys().next())
            .ok_or_else(|| InstancerError::NoExposedPort {
                image: image.to_string(),
            })
    }

    async fn create_container(
        &self,
        server: &BackendServer,
        image: &str,
        exposed_port: &str,
        host_port: u16,
    ) -> Result<String, InstancerError> {
        let url = format!("{}/containers/create", server.url());

        let body = json!({
            "Image": image,
            "ExposedPorts": { exposed_port: {} },
            "HostConfig": {
                "PortBindings": {
                    exposed_port: [{ "HostPort": host_port.to_string() }]
                }
            },
            "StopTimeout": self.stop_timeout,
        });

        debug!("creating container for {} on server {}", image, server.id);

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::unreachable(server, e))?;

        let status = resp.status();
        if status != StatusCode::CREATED {
            let body = resp.text().await.unwrap_or_default();
            error!(
                "create failed for {} on server {} (http {}): {}",
                image, server.id, status, body
            );
            return Err(InstancerError::ContainerCreateFailed {
                image: image.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let created: ContainerCreated =
            resp.json().await.map_err(|e| Self::unreachable(server, e))?;
        Ok(created.id)
    }

    async fn start_container(
        &self,
        server: &BackendServer,
        container_id: &str,
    ) -> Result<(), InstancerError> {
        let url = format!("{}/containers/{}/start", server.url(), container_id);

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| Self::unreachable(server, e))?;

        if resp.status() != StatusCode::NO_CONTENT {
            error!(
                "start failed for container {} on server {} (http {})",
                container_id,
                server.id,
                resp.status()
            );
            return Err(InstancerError::ContainerStartFailed {
                container_id: container_id.to_string(),
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }

    async fn stop_container(
        &self,
        server: &BackendServer,
        container_id: &str,
    ) -> Result<(), InstancerError> {
        let url = format!("{}/containers/{}/stop", server.url(), container_id);

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| Self::unreachable(server, e))?;

        if resp.status() != StatusCode::NO_CONTENT {
            error!(
                "stop failed for container {} on server {} (http {})",
                container_id,
                server.id,
                resp.status()
            );
            return Err(InstancerError::ContainerStopFailed {
                container_id: container_id.to_string(),
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }
}
