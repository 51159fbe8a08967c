use std::collections::HashMap;

use async_trait::async_trait;
use bollard::{
    Docker,
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
        RemoveContainerOptions, RenameContainerOptions, StartContainerOptions,
    },
    image::{ListImagesOptions, RemoveImageOptions},
    models::{ContainerInspectResponse, Network},
    network::{InspectNetworkOptions, ListNetworksOptions},
};
use tracing::{debug, info};

use super::types::{
    ContainerRuntime, ContainerSnapshot, ContainerSpec, ContainerSummary, ImageDetail,
    ImageSummary, NetworkSummary, RuntimeError, RuntimeResult,
};

/// [`ContainerRuntime`] backed by the local Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    pub fn connect() -> RuntimeResult<Self> {
        let client = Docker::connect_with_unix_defaults()?;
        Ok(DockerRuntime { client })
    }
}

fn snapshot_from_inspect(resp: ContainerInspectResponse) -> RuntimeResult<ContainerSnapshot> {
    let id = resp
        .id
        .ok_or_else(|| RuntimeError::new("inspect response without container id"))?;
    let name = resp
        .name
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_default();
    let running = resp
        .state
        .as_ref()
        .and_then(|s| s.running)
        .unwrap_or(false);

    let config = resp.config.unwrap_or_default();
    let spec = ContainerSpec {
        image: config.image.unwrap_or_default(),
        env: config.env.unwrap_or_default(),
        cmd: config.cmd,
        entrypoint: config.entrypoint,
        working_dir: config.working_dir.filter(|w| !w.is_empty()),
        user: config.user.filter(|u| !u.is_empty()),
        labels: config.labels.unwrap_or_default(),
        exposed_ports: config
            .exposed_ports
            .map(|ports| ports.into_keys().collect())
            .unwrap_or_default(),
        tty: config.tty.unwrap_or(false),
        host_config: resp.host_config,
    };

    Ok(ContainerSnapshot {
        id,
        name,
        running,
        spec,
    })
}

fn create_config(spec: &ContainerSpec) -> Config<String> {
    Config {
        image: Some(spec.image.clone()),
        env: Some(spec.env.clone()),
        cmd: spec.cmd.clone(),
        entrypoint: spec.entrypoint.clone(),
        working_dir: spec.working_dir.clone(),
        user: spec.user.clone(),
        labels: Some(spec.labels.clone()),
        exposed_ports: Some(
            spec.exposed_ports
                .iter()
                .map(|port| (port.clone(), HashMap::new()))
                .collect(),
        ),
        tty: Some(spec.tty),
        host_config: spec.host_config.clone(),
        ..Default::default()
    }
}

fn network_summary(network: Network) -> NetworkSummary {
    NetworkSummary {
        id: network.id.unwrap_or_default(),
        name: network.name.unwrap_or_default(),
        driver: network.driver.unwrap_or_default(),
        containers: network
            .containers
            .map(|c| c.into_keys().collect())
            .unwrap_or_default(),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self) -> RuntimeResult<Vec<ContainerSummary>> {
        let containers = self
            .client
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                names: c
                    .names
                    .unwrap_or_default()
                    .into_iter()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .collect(),
                image: c.image.unwrap_or_default(),
                state: c.state.unwrap_or_default(),
                status: c.status.unwrap_or_default(),
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerSnapshot> {
        let resp = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        snapshot_from_inspect(resp)
    }

    async fn create_container(&self, name: &str, spec: &ContainerSpec) -> RuntimeResult<String> {
        let options = Some(CreateContainerOptions {
            name: name.to_string(),
            ..Default::default()
        });
        let resp = self
            .client
            .create_container(options, create_config(spec))
            .await?;
        info!(container_id = %resp.id, name, image = %spec.image, "Container created");
        Ok(resp.id)
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        debug!(container_id = %id, "Container started");
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> RuntimeResult<()> {
        self.client.stop_container(id, None).await?;
        debug!(container_id = %id, "Container stopped");
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> RuntimeResult<()> {
        self.client
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await?;
        debug!(container_id = %id, force, "Container removed");
        Ok(())
    }

    async fn rename_container(&self, id: &str, new_name: &str) -> RuntimeResult<()> {
        self.client
            .rename_container(
                id,
                RenameContainerOptions {
                    name: new_name.to_string(),
                },
            )
            .await?;
        debug!(container_id = %id, new_name, "Container renamed");
        Ok(())
    }

    async fn list_images(&self) -> RuntimeResult<Vec<ImageSummary>> {
        let images = self
            .client
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await?;

        Ok(images
            .into_iter()
            .map(|i| ImageSummary {
                id: i.id,
                repo_tags: i.repo_tags,
                size: i.size,
                created: i.created,
            })
            .collect())
    }

    async fn inspect_image(&self, reference: &str) -> RuntimeResult<ImageDetail> {
        let image = self.client.inspect_image(reference).await?;
        Ok(ImageDetail {
            id: image.id.unwrap_or_default(),
            repo_tags: image.repo_tags.unwrap_or_default(),
            size: image.size.unwrap_or_default(),
            created: image.created,
            architecture: image.architecture,
            os: image.os,
        })
    }

    async fn remove_image(&self, reference: &str, force: bool) -> RuntimeResult<()> {
        self.client
            .remove_image(
                reference,
                Some(RemoveImageOptions {
                    force,
                    ..Default::default()
                }),
                None,
            )
            .await?;
        info!(image = %reference, "Image removed");
        Ok(())
    }

    async fn list_networks(&self) -> RuntimeResult<Vec<NetworkSummary>> {
        let networks = self
            .client
            .list_networks(None::<ListNetworksOptions<String>>)
            .await?;
        Ok(networks.into_iter().map(network_summary).collect())
    }

    async fn inspect_network(&self, id: &str) -> RuntimeResult<NetworkSummary> {
        let network = self
            .client
            .inspect_network(id, None::<InspectNetworkOptions<String>>)
            .await?;
        Ok(network_summary(network))
    }
}
