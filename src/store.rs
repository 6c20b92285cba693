use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::InstancerError;
use crate::models::{Instance, InstanceStatus};
use crate::ports::PortAllocator;

/// Outcome of [`InstanceStore::begin`].
#[derive(Debug, Clone)]
pub enum Begun {
    /// The pair already had a live instance; nothing was inserted.
    Existing(Instance),
    /// A fresh `Requested` record with a newly allocated port.
    Created(Instance),
}

#[derive(Default)]
struct Inner {
    instances: HashMap<i32, Instance>,
    next_id: i32,
}

impl Inner {
    fn live_for(&self, user_id: i32, exercise_id: i32) -> Option<&Instance> {
        self.instances.values().find(|i| {
            i.user_id == user_id && i.exercise_id == exercise_id && i.status.is_live()
        })
    }

    fn ports_in_use(&self, server_id: i32) -> HashSet<u16> {
        self.instances
            .values()
            .filter(|i| i.server_id == server_id && i.status.occupies_port())
            .map(|i| i.port)
            .collect()
    }
}

/// The authoritative record of every instance ever requested. Records
/// are never deleted (audit trail) except by an explicit exercise
/// cascade; only their status moves.
#[derive(Clone, Default)]
pub struct InstanceStore {
    inner: Arc<Mutex<Inner>>,
}

impl InstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: i32) -> Option<Instance> {
        self.inner.lock().instances.get(&id).cloned()
    }

    pub fn live_instance_for(&self, user_id: i32, exercise_id: i32) -> Option<Instance> {
        self.inner.lock().live_for(user_id, exercise_id).cloned()
    }

    pub fn live_instances_for(&self, user_id: i32, exercise_id: i32) -> Vec<Instance> {
        self.inner
            .lock()
            .instances
            .values()
            .filter(|i| {
                i.user_id == user_id && i.exercise_id == exercise_id && i.status.is_live()
            })
            .cloned()
            .collect()
    }

    pub fn ports_in_use(&self, server_id: i32) -> HashSet<u16> {
        self.inner.lock().ports_in_use(server_id)
    }

    /// The check-then-create step of `start`, done under one lock so
    /// two concurrent starts can neither double-book a (user, exercise)
    /// pair nor pick the same port on a server.
    pub fn begin(
        &self,
        user_id: i32,
        exercise_id: i32,
        server_id: i32,
        allocator: &PortAllocator,
    ) -> Result<Begun, InstancerError> {
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.live_for(user_id, exercise_id) {
            return Ok(Begun::Existing(existing.clone()));
        }

        let in_use = inner.ports_in_use(server_id);
        let port = allocator.allocate(server_id, &in_use)?;

        inner.next_id += 1;
        let instance = Instance {
            id: inner.next_id,
            exercise_id,
            user_id,
            server_id,
            container_id: String::new(),
            port,
            status: InstanceStatus::Requested,
            created_at: Utc::now(),
        };
        inner.instances.insert(instance.id, instance.clone());

        Ok(Begun::Created(instance))
    }

    pub fn set_container(&self, id: i32, container_id: &str) -> Result<(), InstancerError> {
        let mut inner = self.inner.lock();
        let instance = inner
            .instances
            .get_mut(&id)
            .ok_or(InstancerError::UnknownInstance(id))?;
        instance.container_id = container_id.to_string();
        Ok(())
    }

    pub fn mark_active(&self, id: i32) -> Result<(), InstancerError> {
        self.transition(id, InstanceStatus::Active)
    }

    pub fn mark_failed(&self, id: i32) -> Result<(), InstancerError> {
        self.transition(id, InstanceStatus::Failed)
    }

    /// Idempotent: an already-terminal record is left untouched.
    pub fn mark_inactive(&self, id: i32) -> Result<(), InstancerError> {
        self.transition(id, InstanceStatus::Inactive)
    }

    fn transition(&self, id: i32, to: InstanceStatus) -> Result<(), InstancerError> {
        let mut inner = self.inner.lock();
        let instance = inner
            .instances
            .get_mut(&id)
            .ok_or(InstancerError::UnknownInstance(id))?;
        // terminal states are final
        if !instance.status.is_terminal() {
            instance.status = to;
        }
        Ok(())
    }

    pub fn list(&self) -> Vec<Instance> {
        let mut instances: Vec<_> = self.inner.lock().instances.values().cloned().collect();
        instances.sort_by_key(|i| i.id);
        instances
    }

    /// Cascade step of exercise deletion: drops every record for the
    /// exercise and returns the ones that were still live so the caller
    /// can stop their containers.
    pub fn purge_exercise(&self, exercise_id: i32) -> Vec<Instance> {
        let mut inner = self.inner.lock();

        let doomed: Vec<i32> = inner
            .instances
            .values()
            .filter(|i| i.exercise_id == exercise_id)
            .map(|i| i.id)
            .collect();

        let mut live = Vec::new();
        for id in doomed {
            if let Some(instance) = inner.instances.remove(&id) {
                if instance.status.is_live() {
                    live.push(instance);
                }
            }
        }
        live
    }
}
