use serde::Serialize;
use tracing::{info, warn};

use crate::config;
use crate::docker::ContainerRuntime;
use crate::error::InstancerError;
use crate::models::{BackendServer, ExerciseBinding, Instance};
use crate::ports::PortAllocator;
use crate::registry::ServerRegistry;
use crate::store::{Begun, InstanceStore};

/// What a user needs to reach their instance.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub instance_id: i32,
    pub address: String,
    pub port: u16,
}

impl ConnectionInfo {
    fn new(instance: &Instance, server: &BackendServer) -> Self {
        Self {
            instance_id: instance.id,
            address: server.address.clone(),
            port: instance.port,
        }
    }
}

/// The façade the host platform calls into. Owns all bookkeeping and
/// drives the remote runtime; generic over the runtime so tests can
/// swap in a mock.
///
/// Remote calls are never rolled back. When create or start fails the
/// record goes terminal and the port frees up, but a half-made
/// container may linger on the backend until its stop timeout kills
/// it. Bookkeeping intent wins over backend truth.
#[derive(Clone)]
pub struct Orchestrator<R> {
    registry: ServerRegistry,
    store: InstanceStore,
    allocator: PortAllocator,
    runtime: R,
}

impl<R: ContainerRuntime> Orchestrator<R> {
    pub fn new(runtime: R, docker: &config::Docker) -> Self {
        Self {
            registry: ServerRegistry::new(),
            store: InstanceStore::new(),
            allocator: PortAllocator::new(
                docker.port_range_start,
                docker.port_range_end,
                docker.allocation_attempts,
            ),
            runtime,
        }
    }

    // == admin ==

    /// Registers a backend server and tries to fill its image cache.
    /// An unreachable server still registers, with an empty cache.
    pub async fn register_server(
        &self,
        name: &str,
        address: &str,
        port: u16,
    ) -> Result<BackendServer, InstancerError> {
        let server = self.registry.register(name, address, port);
        info!("registered server {} ({}:{})", server.name, address, port);

        match self.refresh_images(server.id).await {
            Ok(images) => info!("server {} has {} images", server.name, images.len()),
            Err(e) => warn!("could not fetch images from new server {}: {}", server.name, e),
        }

        self.registry.resolve(server.id)
    }

    /// Re-reads the image list from the backend. On failure the cached
    /// list stays untouched and the error is surfaced.
    pub async fn refresh_images(&self, server_id: i32) -> Result<Vec<String>, InstancerError> {
        let server = self.registry.resolve(server_id)?;
        let images = self.runtime.list_images(&server).await?;
        self.registry.set_images(server_id, images.clone())?;
        Ok(images)
    }

    pub fn bind_exercise(
        &self,
        exercise_id: i32,
        server_id: i32,
        image: &str,
    ) -> Result<ExerciseBinding, InstancerError> {
        self.registry.bind(exercise_id, server_id, image)
    }

    /// Removes an exercise and everything hanging off it: binding,
    /// instance records, and (best effort) the live containers.
    pub async fn delete_exercise(&self, exercise_id: i32) {
        let live = self.store.purge_exercise(exercise_id);
        self.registry.unbind(exercise_id);

        for instance in live {
            self.stop_container_best_effort(&instance).await;
        }
    }

    pub fn list_servers(&self) -> Vec<BackendServer> {
        self.registry.list()
    }

    pub fn list_instances(&self) -> Vec<Instance> {
        self.store.list()
    }

    // == user ==

    /// Provisions an instance for the pair, or returns the one that is
    /// already live. The record is committed before any remote call so
    /// a crash mid-creation is auditable instead of silent.
    pub async fn start(
        &self,
        user_id: i32,
        exercise_id: i32,
    ) -> Result<ConnectionInfo, InstancerError> {
        let binding = self.registry.binding(exercise_id)?;
        let server = self.registry.resolve(binding.server_id)?;

        let instance = match self
            .store
            .begin(user_id, exercise_id, server.id, &self.allocator)?
        {
            Begun::Existing(instance) => {
                info!(
                    "user {} already has instance {} for exercise {}",
                    user_id, instance.id, exercise_id
                );
                return Ok(ConnectionInfo::new(&instance, &server));
            }
            Begun::Created(instance) => instance,
        };

        let exposed_port = match self.runtime.exposed_port(&server, &binding.image).await {
            Ok(port) => port,
            Err(e) => {
                self.store.mark_failed(instance.id)?;
                return Err(e);
            }
        };

        let container_id = match self
            .runtime
            .create_container(&server, &binding.image, &exposed_port, instance.port)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.store.mark_failed(instance.id)?;
                return Err(e);
            }
        };
        self.store.set_container(instance.id, &container_id)?;

        if let Err(e) = self.runtime.start_container(&server, &container_id).await {
            // the container exists but never ran; it stays on the
            // backend until its stop timeout reaps it
            self.store.mark_failed(instance.id)?;
            return Err(e);
        }

        self.store.mark_active(instance.id)?;
        info!(
            "instance {} for user {} exercise {} up on {}:{}",
            instance.id, user_id, exercise_id, server.address, instance.port
        );

        Ok(ConnectionInfo::new(&instance, &server))
    }

    /// Pure read: connection info of the live instance, if any.
    pub fn status(&self, user_id: i32, exercise_id: i32) -> Option<ConnectionInfo> {
        let instance = self.store.live_instance_for(user_id, exercise_id)?;
        let server = self.registry.resolve(instance.server_id).ok()?;
        Some(ConnectionInfo::new(&instance, &server))
    }

    /// Stops an instance. Owner or admin only. Idempotent: stopping an
    /// already-stopped instance succeeds without touching the backend.
    pub async fn stop(
        &self,
        instance_id: i32,
        requester_id: i32,
        is_admin: bool,
    ) -> Result<(), InstancerError> {
        let instance = self
            .store
            .get(instance_id)
            .ok_or(InstancerError::UnknownInstance(instance_id))?;

        if instance.user_id != requester_id && !is_admin {
            warn!(
                "user {} tried to stop instance {} of user {}",
                requester_id, instance_id, instance.user_id
            );
            return Err(InstancerError::Forbidden(instance_id));
        }

        if instance.status.is_terminal() {
            return Ok(());
        }

        // flip the bookkeeping first; the port is free from here on
        // even if the backend call below fails
        self.store.mark_inactive(instance_id)?;
        self.stop_container_best_effort(&instance).await;

        info!("instance {} stopped by user {}", instance_id, requester_id);
        Ok(())
    }

    /// Solve hook: tears down every live instance of the pair. There
    /// should be exactly one, but stray extras are stopped too.
    pub async fn solved(&self, user_id: i32, exercise_id: i32) {
        for instance in self.store.live_instances_for(user_id, exercise_id) {
            if let Err(e) = self.store.mark_inactive(instance.id) {
                warn!("could not retire instance {}: {}", instance.id, e);
                continue;
            }
            self.stop_container_best_effort(&instance).await;
            info!("instance {} stopped after solve", instance.id);
        }
    }

    async fn stop_container_best_effort(&self, instance: &Instance) {
        // a record that never got a container has nothing to stop
        if instance.container_id.is_empty() {
            return;
        }

        let server = match self.registry.resolve(instance.server_id) {
            Ok(server) => server,
            Err(e) => {
                warn!("instance {} references a missing server: {}", instance.id, e);
                return;
            }
        };

        if let Err(e) = self
            .runtime
            .stop_container(&server, &instance.container_id)
            .await
        {
            warn!(
                "backend stop failed for instance {} (container {}): {}",
                instance.id, instance.container_id, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InstanceStatus;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Remote runtime that never leaves the process. Failure toggles
    /// flip per-call behaviour; calls are recorded for assertions.
    #[derive(Clone, Default)]
    struct MockRuntime {
        images: Arc<Mutex<Vec<String>>>,
        unreachable: Arc<Mutex<bool>>,
        fail_create: Arc<Mutex<bool>>,
        fail_start: Arc<Mutex<bool>>,
        created: Arc<Mutex<Vec<(String, String, u16)>>>,
        stopped: Arc<Mutex<Vec<String>>>,
    }

    impl MockRuntime {
        fn with_images(images: &[&str]) -> Self {
            let mock = Self::default();
            *mock.images.lock() = images.iter().map(|s| s.to_string()).collect();
            mock
        }
    }

    #[async_trait]
    impl ContainerRuntime for MockRuntime {
        async fn list_images(
            &self,
            server: &BackendServer,
        ) -> Result<Vec<String>, InstancerError> {
            if *self.unreachable.lock() {
                return Err(InstancerError::ServerUnreachable {
                    server_id: server.id,
                    message: "connection refused".into(),
                });
            }
            Ok(self.images.lock().clone())
        }

        async fn exposed_port(
            &self,
            _server: &BackendServer,
            image: &str,
        ) -> Result<String, InstancerError> {
            if image.starts_with("noport") {
                return Err(InstancerError::NoExposedPort {
                    image: image.to_string(),
                });
            }
            Ok("1337/tcp".to_string())
        }

        async fn create_container(
            &self,
            _server: &BackendServer,
            image: &str,
            exposed_port: &str,
            host_port: u16,
        ) -> Result<String, InstancerError> {
            if *self.fail_create.lock() {
                return Err(InstancerError::ContainerCreateFailed {
                    image: image.to_string(),
                    status: 404,
                    body: "no such image".into(),
                });
            }
            let id = format!("container-{host_port}");
            self.created
                .lock()
                .push((image.to_string(), exposed_port.to_string(), host_port));
            Ok(id)
        }

        async fn start_container(
            &self,
            _server: &BackendServer,
            container_id: &str,
        ) -> Result<(), InstancerError> {
            if *self.fail_start.lock() {
                return Err(InstancerError::ContainerStartFailed {
                    container_id: container_id.to_string(),
                    status: 500,
                });
            }
            Ok(())
        }

        async fn stop_container(
            &self,
            _server: &BackendServer,
            container_id: &str,
        ) -> Result<(), InstancerError> {
            self.stopped.lock().push(container_id.to_string());
            Ok(())
        }
    }

    fn docker_config() -> config::Docker {
        toml::from_str("").unwrap()
    }

    /// Orchestrator with one server and exercise 100 bound to it.
    async fn orchestrator(mock: MockRuntime) -> Orchestrator<MockRuntime> {
        let orch = Orchestrator::new(mock, &docker_config());
        let server = orch.register_server("srv-a", "10.0.0.1", 2375).await.unwrap();
        orch.bind_exercise(100, server.id, "chal:latest").unwrap();
        orch
    }

    #[tokio::test]
    async fn start_provisions_and_reports() {
        let mock = MockRuntime::with_images(&["chal:latest"]);
        let orch = orchestrator(mock.clone()).await;

        let info = orch.start(1, 100).await.unwrap();
        assert_eq!(info.address, "10.0.0.1");
        assert!((40000..=50000).contains(&info.port));

        // the container was created with the allocated binding
        let created = mock.created.lock();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0], ("chal:latest".into(), "1337/tcp".into(), info.port));
        drop(created);

        let status = orch.status(1, 100).unwrap();
        assert_eq!(status.instance_id, info.instance_id);
        assert_eq!(status.port, info.port);

        let instances = orch.list_instances();
        assert_eq!(instances[0].status, InstanceStatus::Active);
        assert_eq!(instances[0].container_id, format!("container-{}", info.port));
    }

    #[tokio::test]
    async fn second_start_reuses_the_live_instance() {
        let mock = MockRuntime::with_images(&["chal:latest"]);
        let orch = orchestrator(mock.clone()).await;

        let first = orch.start(1, 100).await.unwrap();
        let second = orch.start(1, 100).await.unwrap();

        assert_eq!(first.instance_id, second.instance_id);
        assert_eq!(first.port, second.port);
        assert_eq!(orch.list_instances().len(), 1);
        assert_eq!(mock.created.lock().len(), 1);
    }

    #[tokio::test]
    async fn create_failure_leaves_no_live_record() {
        let mock = MockRuntime::with_images(&["chal:latest"]);
        let orch = orchestrator(mock.clone()).await;

        *mock.fail_create.lock() = true;
        assert!(matches!(
            orch.start(1, 100).await,
            Err(InstancerError::ContainerCreateFailed { .. })
        ));

        let instances = orch.list_instances();
        assert_eq!(instances[0].status, InstanceStatus::Failed);
        assert!(instances[0].container_id.is_empty());
        assert!(orch.status(1, 100).is_none());

        // the pair can start again once the backend recovers
        *mock.fail_create.lock() = false;
        orch.start(1, 100).await.unwrap();
    }

    #[tokio::test]
    async fn start_failure_goes_terminal_with_container_recorded() {
        let mock = MockRuntime::with_images(&["chal:latest"]);
        let orch = orchestrator(mock.clone()).await;

        *mock.fail_start.lock() = true;
        assert!(matches!(
            orch.start(1, 100).await,
            Err(InstancerError::ContainerStartFailed { .. })
        ));

        // created-but-not-started is representable: terminal, but the
        // container id is kept for diagnosis
        let instances = orch.list_instances();
        assert_eq!(instances[0].status, InstanceStatus::Failed);
        assert!(!instances[0].container_id.is_empty());
    }

    #[tokio::test]
    async fn missing_exposed_port_aborts_before_create() {
        let mock = MockRuntime::with_images(&["noport:latest"]);
        let orch = Orchestrator::new(mock.clone(), &docker_config());
        let server = orch.register_server("srv", "10.0.0.1", 2375).await.unwrap();
        orch.bind_exercise(200, server.id, "noport:latest").unwrap();

        assert!(matches!(
            orch.start(1, 200).await,
            Err(InstancerError::NoExposedPort { .. })
        ));
        assert!(mock.created.lock().is_empty());
        assert_eq!(orch.list_instances()[0].status, InstanceStatus::Failed);
    }

    #[tokio::test]
    async fn stop_is_idempotent_with_one_backend_call() {
        let mock = MockRuntime::with_images(&["chal:latest"]);
        let orch = orchestrator(mock.clone()).await;

        let info = orch.start(1, 100).await.unwrap();
        orch.stop(info.instance_id, 1, false).await.unwrap();
        orch.stop(info.instance_id, 1, false).await.unwrap();

        assert_eq!(mock.stopped.lock().len(), 1);
        assert_eq!(orch.list_instances()[0].status, InstanceStatus::Inactive);
    }

    #[tokio::test]
    async fn stop_by_stranger_is_forbidden_and_mutates_nothing() {
        let mock = MockRuntime::with_images(&["chal:latest"]);
        let orch = orchestrator(mock.clone()).await;

        let info = orch.start(1, 100).await.unwrap();
        assert!(matches!(
            orch.stop(info.instance_id, 2, false).await,
            Err(InstancerError::Forbidden(_))
        ));

        assert_eq!(orch.list_instances()[0].status, InstanceStatus::Active);
        assert!(mock.stopped.lock().is_empty());

        // an admin may stop anyone's instance
        orch.stop(info.instance_id, 2, true).await.unwrap();
        assert_eq!(orch.list_instances()[0].status, InstanceStatus::Inactive);
    }

    #[tokio::test]
    async fn stopping_an_unknown_instance_fails() {
        let orch = orchestrator(MockRuntime::with_images(&["chal:latest"])).await;
        assert!(matches!(
            orch.stop(424242, 1, true).await,
            Err(InstancerError::UnknownInstance(424242))
        ));
    }

    #[tokio::test]
    async fn starting_an_unbound_exercise_fails() {
        let orch = orchestrator(MockRuntime::with_images(&["chal:latest"])).await;
        assert!(matches!(
            orch.start(1, 999).await,
            Err(InstancerError::UnknownExercise(999))
        ));
    }

    #[tokio::test]
    async fn solve_hook_retires_the_instance() {
        let mock = MockRuntime::with_images(&["chal:latest"]);
        let orch = orchestrator(mock.clone()).await;

        orch.start(1, 100).await.unwrap();
        orch.solved(1, 100).await;

        assert_eq!(orch.list_instances()[0].status, InstanceStatus::Inactive);
        assert_eq!(mock.stopped.lock().len(), 1);
        assert!(orch.status(1, 100).is_none());

        // solving with nothing live is a no-op
        orch.solved(1, 100).await;
        assert_eq!(mock.stopped.lock().len(), 1);
    }

    #[tokio::test]
    async fn ports_are_disjoint_across_users() {
        let mock = MockRuntime::with_images(&["chal:latest"]);
        let orch = orchestrator(mock.clone()).await;

        let mut ports = std::collections::HashSet::new();
        for user in 0..20 {
            let info = orch.start(user, 100).await.unwrap();
            assert!(ports.insert(info.port), "port {} handed out twice", info.port);
        }
    }

    #[tokio::test]
    async fn unreachable_server_registers_with_empty_cache() {
        let mock = MockRuntime::with_images(&["chal:latest"]);
        *mock.unreachable.lock() = true;

        let orch = Orchestrator::new(mock.clone(), &docker_config());
        let server = orch.register_server("down", "10.9.9.9", 2375).await.unwrap();
        assert!(server.images.is_empty());

        // a failed refresh keeps the previous cache
        *mock.unreachable.lock() = false;
        orch.refresh_images(server.id).await.unwrap();
        assert_eq!(orch.list_servers()[0].images, ["chal:latest"]);

        *mock.unreachable.lock() = true;
        assert!(orch.refresh_images(server.id).await.is_err());
        assert_eq!(orch.list_servers()[0].images, ["chal:latest"]);
    }

    #[tokio::test]
    async fn deleting_an_exercise_cascades() {
        let mock = MockRuntime::with_images(&["chal:latest"]);
        let orch = orchestrator(mock.clone()).await;

        orch.start(1, 100).await.unwrap();
        orch.delete_exercise(100).await;

        assert!(orch.list_instances().is_empty());
        assert_eq!(mock.stopped.lock().len(), 1);
        assert!(matches!(
            orch.start(1, 100).await,
            Err(InstancerError::UnknownExercise(100))
        ));
    }
}
