use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A remote docker host we can schedule instances on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendServer {
    pub id: i32,
    pub name: String,
    pub address: String,
    pub port: u16,
    /// Image names cached from the last successful refresh. Empty until
    /// the server has been reached at least once.
    pub images: Vec<String>,
}

impl BackendServer {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }
}

/// Pins an exercise to the server and image its instances run on.
/// Exactly one binding per exercise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExerciseBinding {
    pub exercise_id: i32,
    pub server_id: i32,
    pub image: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Record committed, container not yet created.
    Requested,
    /// Container created and believed running.
    Active,
    /// Stop in flight; still occupies its port.
    Stopping,
    /// Stopped, solved or force-stopped. Terminal.
    Inactive,
    /// Creation or startup failed. Terminal.
    Failed,
}

impl InstanceStatus {
    /// Counts towards the one-instance-per-(user, exercise) limit.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Requested | Self::Active)
    }

    /// Still holds its host port.
    pub fn occupies_port(self) -> bool {
        matches!(self, Self::Requested | Self::Active | Self::Stopping)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Inactive | Self::Failed)
    }
}

/// One provisioned (or attempted) container. Records are kept forever
/// as an audit trail; only the status ever changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: i32,
    pub exercise_id: i32,
    pub user_id: i32,
    pub server_id: i32,
    /// Empty until the backend reports a successful create.
    pub container_id: String,
    pub port: u16,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
}
