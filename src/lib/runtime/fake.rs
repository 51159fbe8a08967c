//! In-memory runtime used by unit tests.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;

use super::types::{
    ContainerRuntime, ContainerSnapshot, ContainerSpec, ContainerSummary, ImageDetail,
    ImageSummary, NetworkSummary, RuntimeError, RuntimeResult,
};

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub spec: ContainerSpec,
}

#[derive(Default)]
struct Inner {
    containers: Vec<FakeContainer>,
    next_id: u32,
    failing: HashSet<&'static str>,
    /// Containers created from these images exit immediately after start.
    crashing_images: HashSet<String>,
    calls: Vec<String>,
}

#[derive(Default)]
pub struct FakeRuntime {
    inner: Mutex<Inner>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_container(&self, name: &str, image: &str, running: bool) -> String {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = format!("id{}", inner.next_id);
        inner.containers.push(FakeContainer {
            id: id.clone(),
            name: name.to_string(),
            running,
            spec: ContainerSpec {
                image: image.to_string(),
                env: vec!["A=1".to_string()],
                ..Default::default()
            },
        });
        id
    }

    /// Make every call of `op` (e.g. `"create"`) fail.
    pub fn fail_on(&self, op: &'static str) {
        self.inner.lock().unwrap().failing.insert(op);
    }

    pub fn crash_image(&self, image: &str) {
        self.inner
            .lock()
            .unwrap()
            .crashing_images
            .insert(image.to_string());
    }

    pub fn containers(&self) -> Vec<FakeContainer> {
        self.inner.lock().unwrap().containers.clone()
    }

    pub fn by_name(&self, name: &str) -> Option<FakeContainer> {
        self.containers().into_iter().find(|c| c.name == name)
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    fn enter(&self, op: &'static str, subject: &str) -> RuntimeResult<std::sync::MutexGuard<'_, Inner>> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!("{} {}", op, subject));
        if inner.failing.contains(op) {
            return Err(RuntimeError::new(format!("injected {} failure", op)));
        }
        Ok(inner)
    }
}

fn find<'a>(inner: &'a mut Inner, id: &str) -> RuntimeResult<&'a mut FakeContainer> {
    inner
        .containers
        .iter_mut()
        .find(|c| c.id == id || c.name == id)
        .ok_or_else(|| RuntimeError::new(format!("No such container: {}", id)))
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_containers(&self) -> RuntimeResult<Vec<ContainerSummary>> {
        let inner = self.enter("list", "")?;
        Ok(inner
            .containers
            .iter()
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                names: vec![c.name.clone()],
                image: c.spec.image.clone(),
                state: if c.running { "running" } else { "exited" }.to_string(),
                status: String::new(),
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerSnapshot> {
        let mut inner = self.enter("inspect", id)?;
        let c = find(&mut inner, id)?;
        Ok(ContainerSnapshot {
            id: c.id.clone(),
            name: c.name.clone(),
            running: c.running,
            spec: c.spec.clone(),
        })
    }

    async fn create_container(&self, name: &str, spec: &ContainerSpec) -> RuntimeResult<String> {
        let mut inner = self.enter("create", name)?;
        if inner.containers.iter().any(|c| c.name == name) {
            return Err(RuntimeError::new(format!(
                "Conflict. The container name \"/{}\" is already in use",
                name
            )));
        }
        inner.next_id += 1;
        let id = format!("id{}", inner.next_id);
        inner.containers.push(FakeContainer {
            id: id.clone(),
            name: name.to_string(),
            running: false,
            spec: spec.clone(),
        });
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        let mut inner = self.enter("start", id)?;
        let crashing = inner.crashing_images.clone();
        let c = find(&mut inner, id)?;
        c.running = !crashing.contains(&c.spec.image);
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> RuntimeResult<()> {
        let mut inner = self.enter("stop", id)?;
        find(&mut inner, id)?.running = false;
        Ok(())
    }

    async fn remove_container(&self, id: &str, _force: bool) -> RuntimeResult<()> {
        let mut inner = self.enter("remove", id)?;
        let before = inner.containers.len();
        inner.containers.retain(|c| c.id != id && c.name != id);
        if inner.containers.len() == before {
            return Err(RuntimeError::new(format!("No such container: {}", id)));
        }
        Ok(())
    }

    async fn rename_container(&self, id: &str, new_name: &str) -> RuntimeResult<()> {
        let mut inner = self.enter("rename", id)?;
        if inner.containers.iter().any(|c| c.name == new_name) {
            return Err(RuntimeError::new(format!(
                "Conflict. The container name \"/{}\" is already in use",
                new_name
            )));
        }
        find(&mut inner, id)?.name = new_name.to_string();
        Ok(())
    }

    async fn list_images(&self) -> RuntimeResult<Vec<ImageSummary>> {
        self.enter("list_images", "")?;
        Ok(Vec::new())
    }

    async fn inspect_image(&self, reference: &str) -> RuntimeResult<ImageDetail> {
        self.enter("inspect_image", reference)?;
        Err(RuntimeError::new(format!("No such image: {}", reference)))
    }

    async fn remove_image(&self, reference: &str, _force: bool) -> RuntimeResult<()> {
        self.enter("remove_image", reference)?;
        Ok(())
    }

    async fn list_networks(&self) -> RuntimeResult<Vec<NetworkSummary>> {
        self.enter("list_networks", "")?;
        Ok(Vec::new())
    }

    async fn inspect_network(&self, id: &str) -> RuntimeResult<NetworkSummary> {
        self.enter("inspect_network", id)?;
        Err(RuntimeError::new(format!("network {} not found", id)))
    }
}
