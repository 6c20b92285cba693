use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::error::InstancerError;
use crate::models::{BackendServer, ExerciseBinding};

#[derive(Default)]
struct Inner {
    servers: HashMap<i32, BackendServer>,
    bindings: HashMap<i32, ExerciseBinding>,
    next_id: i32,
}

/// Known backend servers and the exercise → (server, image) bindings.
/// Servers are registered by an admin and never deleted; the only
/// mutation after registration is an image cache refresh.
#[derive(Clone, Default)]
pub struct ServerRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a server with an empty image cache. The caller is
    /// expected to follow up with a best-effort refresh.
    pub fn register(&self, name: &str, address: &str, port: u16) -> BackendServer {
        let mut inner = self.inner.lock();
        inner.next_id += 1;

        let server = BackendServer {
            id: inner.next_id,
            name: name.to_string(),
            address: address.to_string(),
            port,
            images: Vec::new(),
        };
        inner.servers.insert(server.id, server.clone());
        server
    }

    /// Commits a successful image refresh. A failed refresh must not
    /// reach this point; the previous cache stays as-is.
    pub fn set_images(&self, server_id: i32, images: Vec<String>) -> Result<(), InstancerError> {
        let mut inner = self.inner.lock();
        let server = inner
            .servers
            .get_mut(&server_id)
            .ok_or(InstancerError::UnknownServer(server_id))?;
        server.images = images;
        Ok(())
    }

    pub fn resolve(&self, server_id: i32) -> Result<BackendServer, InstancerError> {
        self.inner
            .lock()
            .servers
            .get(&server_id)
            .cloned()
            .ok_or(InstancerError::UnknownServer(server_id))
    }

    pub fn list(&self) -> Vec<BackendServer> {
        let mut servers: Vec<_> = self.inner.lock().servers.values().cloned().collect();
        servers.sort_by_key(|s| s.id);
        servers
    }

    /// One binding per exercise; binding again replaces the old one.
    /// The image is checked against the server's cache, but only as a
    /// warning: the cache may simply be stale.
    pub fn bind(
        &self,
        exercise_id: i32,
        server_id: i32,
        image: &str,
    ) -> Result<ExerciseBinding, InstancerError> {
        let mut inner = self.inner.lock();
        let server = inner
            .servers
            .get(&server_id)
            .ok_or(InstancerError::UnknownServer(server_id))?;

        if !server.images.iter().any(|i| i == image) {
            warn!(
                "binding exercise {} to image {} not present in the cache of server {}",
                exercise_id, image, server.name
            );
        }

        let binding = ExerciseBinding {
            exercise_id,
            server_id,
            image: image.to_string(),
        };
        inner.bindings.insert(exercise_id, binding.clone());
        Ok(binding)
    }

    pub fn binding(&self, exercise_id: i32) -> Result<ExerciseBinding, InstancerError> {
        self.inner
            .lock()
            .bindings
            .get(&exercise_id)
            .cloned()
            .ok_or(InstancerError::UnknownExercise(exercise_id))
    }

    pub fn unbind(&self, exercise_id: i32) {
        self.inner.lock().bindings.remove(&exercise_id);
    }
}
