//! Container backing: runners execute as short-lived local Docker containers.
//!
//! A shared bridge network and a RabbitMQ broker container are reused across
//! runs when already healthy. Each runner spec becomes one auto-removing
//! container with the runner binary bind-mounted read-only.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, NetworkingConfig,
    StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::network::CreateNetworkOptions;
use bollard::models::{EndpointSettings, HostConfig};
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::launcher::{runner_args, LaunchError, Launcher};
use crate::plan::{RunnerSpec, Workload};

const BRIDGE_NETWORK: &str = "stampede-bridge";
const BROKER_IMAGE: &str = "rabbitmq:3";
const BROKER_CONTAINER: &str = "stampede-rabbitmq";
const RUNNER_IMAGE: &str = "debian:bookworm-slim";
const RUNNER_CONTAINER_PREFIX: &str = "stampede-runner-";
const BROKER_PORT: u16 = 5672;
const BROKER_RETRIES: u32 = 45;

/// Directory the runner binary is mounted at inside runner containers.
const TASK_MOUNT: &str = "/var/task";

#[derive(Default)]
pub struct DockerLauncher {
    docker: Option<Docker>,
    broker_id: String,
    broker_ip: String,
    queue_url: String,
    runner_dir: String,
}

impl DockerLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self) -> Result<&Docker, LaunchError> {
        self.docker
            .as_ref()
            .ok_or_else(|| LaunchError::Provision("docker launcher not set up".into()))
    }

    async fn pull_image(&self, image: &str) -> Result<(), LaunchError> {
        let docker = self.client()?;
        info!(image, "pulling image");
        let mut progress = docker.create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(step) = progress.next().await {
            step.map_err(|e| LaunchError::Provision(e.to_string()))?;
        }
        Ok(())
    }

    async fn ensure_network(&self) -> Result<(), LaunchError> {
        let docker = self.client()?;
        let networks = docker
            .list_networks::<String>(None)
            .await
            .map_err(|e| LaunchError::Provision(e.to_string()))?;
        if networks
            .iter()
            .any(|n| n.name.as_deref() == Some(BRIDGE_NETWORK))
        {
            return Ok(());
        }
        docker
            .create_network(CreateNetworkOptions {
                name: BRIDGE_NETWORK,
                check_duplicate: true,
                ..Default::default()
            })
            .await
            .map_err(|e| LaunchError::Provision(e.to_string()))?;
        Ok(())
    }

    async fn ensure_broker(&mut self) -> Result<(), LaunchError> {
        let docker = self.client()?.clone();
        let containers = docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .map_err(|e| LaunchError::Provision(e.to_string()))?;

        let mut running = false;
        for container in &containers {
            if container
                .image
                .as_deref()
                .is_some_and(|image| image.contains("rabbitmq:"))
            {
                self.broker_id = container.id.clone().unwrap_or_default();
                running = container.state.as_deref() == Some("running");
            }
        }

        if self.broker_id.is_empty() {
            let created = docker
                .create_container(
                    Some(CreateContainerOptions {
                        name: BROKER_CONTAINER,
                        ..Default::default()
                    }),
                    Config {
                        image: Some(BROKER_IMAGE.to_string()),
                        host_config: Some(HostConfig {
                            auto_remove: Some(true),
                            ..Default::default()
                        }),
                        networking_config: Some(NetworkingConfig {
                            endpoints_config: bridge_endpoint(),
                        }),
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| LaunchError::Provision(e.to_string()))?;
            self.broker_id = created.id;
        }

        if !running {
            docker
                .start_container::<String>(&self.broker_id, None)
                .await
                .map_err(|e| LaunchError::Provision(e.to_string()))?;
        }

        self.broker_ip = self.broker_ip().await?;
        self.await_broker_ready().await?;
        self.queue_url = format!("amqp://guest:guest@{}:{BROKER_PORT}/", self.broker_ip);
        Ok(())
    }

    async fn broker_ip(&self) -> Result<String, LaunchError> {
        let docker = self.client()?;
        for _ in 0..BROKER_RETRIES {
            if let Ok(details) = docker.inspect_container(&self.broker_id, None).await {
                let ip = details
                    .network_settings
                    .and_then(|settings| settings.networks)
                    .and_then(|mut networks| networks.remove(BRIDGE_NETWORK))
                    .and_then(|endpoint| endpoint.ip_address)
                    .filter(|ip| !ip.is_empty());
                if let Some(ip) = ip {
                    return Ok(ip);
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Err(LaunchError::Provision(
            "broker container never joined the bridge network".into(),
        ))
    }

    /// The broker accepts TCP well before AMQP is actually up; probing the
    /// port with bounded retries covers both.
    async fn await_broker_ready(&self) -> Result<(), LaunchError> {
        for _ in 0..BROKER_RETRIES {
            if tokio::net::TcpStream::connect((self.broker_ip.as_str(), BROKER_PORT))
                .await
                .is_ok()
            {
                info!(ip = %self.broker_ip, "broker ready");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Err(LaunchError::Provision(format!(
            "broker at {}:{BROKER_PORT} not reachable after {BROKER_RETRIES} attempts",
            self.broker_ip
        )))
    }
}

fn bridge_endpoint() -> HashMap<String, EndpointSettings> {
    HashMap::from([(BRIDGE_NETWORK.to_string(), EndpointSettings::default())])
}

#[async_trait]
impl Launcher for DockerLauncher {
    async fn setup(&mut self, workload: &Workload) -> Result<(), LaunchError> {
        self.docker = Some(
            Docker::connect_with_local_defaults()
                .map_err(|e| LaunchError::Provision(e.to_string()))?,
        );
        self.runner_dir = std::fs::canonicalize(
            workload.runner_path.as_deref().unwrap_or("./data/runner"),
        )?
        .display()
        .to_string();

        self.pull_image(BROKER_IMAGE).await?;
        self.pull_image(RUNNER_IMAGE).await?;
        self.ensure_network().await?;
        self.ensure_broker().await
    }

    async fn launch(&self, spec: &RunnerSpec) -> Result<(), LaunchError> {
        let docker = self.client()?;
        let mut cmd = vec![format!("{TASK_MOUNT}/stampede-runner")];
        cmd.extend(runner_args(spec));

        let name = format!(
            "{RUNNER_CONTAINER_PREFIX}{}-{}",
            spec.runner_id,
            Uuid::new_v4()
        );
        let created = docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    ..Default::default()
                }),
                Config {
                    image: Some(RUNNER_IMAGE.to_string()),
                    cmd: Some(cmd),
                    host_config: Some(HostConfig {
                        auto_remove: Some(true),
                        binds: Some(vec![format!("{}:{TASK_MOUNT}:ro", self.runner_dir)]),
                        ..Default::default()
                    }),
                    networking_config: Some(NetworkingConfig {
                        endpoints_config: bridge_endpoint(),
                    }),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| LaunchError::Invoke(e.to_string()))?;
        docker
            .start_container::<String>(&created.id, None)
            .await
            .map_err(|e| LaunchError::Invoke(e.to_string()))?;
        Ok(())
    }

    fn queue_url(&self) -> &str {
        &self.queue_url
    }

    fn queue_region(&self) -> &str {
        "local"
    }

    async fn teardown(&mut self) {
        let Some(docker) = self.docker.clone() else { return };

        if !self.broker_id.is_empty() {
            if let Err(error) = docker
                .stop_container(&self.broker_id, Some(StopContainerOptions { t: 1 }))
                .await
            {
                warn!(error = %error, "failed to stop broker container");
            }
            self.broker_id.clear();
        }

        if let Ok(containers) = docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
        {
            for container in containers {
                let is_runner = container.names.iter().flatten().any(|name| {
                    name.trim_start_matches('/')
                        .starts_with(RUNNER_CONTAINER_PREFIX)
                });
                if is_runner {
                    if let Some(id) = container.id {
                        let _ = docker
                            .stop_container(&id, Some(StopContainerOptions { t: 1 }))
                            .await;
                    }
                }
            }
        }

        if let Err(error) = docker.remove_network(BRIDGE_NETWORK).await {
            warn!(error = %error, "failed to remove bridge network");
        }
        self.docker = None;
    }
}
