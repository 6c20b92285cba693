use axum::http::StatusCode;

/// Everything that can go wrong while provisioning or tearing down an
/// instance. Remote failures carry enough context to diagnose the
/// backend without shelling into it.
#[derive(thiserror::Error, Debug)]
pub enum InstancerError {
    #[error("unknown server {0}")]
    UnknownServer(i32),

    #[error("exercise {0} has no instance binding")]
    UnknownExercise(i32),

    #[error("unknown instance {0}")]
    UnknownInstance(i32),

    #[error("server {server_id} unreachable: {message}")]
    ServerUnreachable { server_id: i32, message: String },

    #[error("image {image} declares no exposed port")]
    NoExposedPort { image: String },

    #[error("container create failed for image {image} (http {status}): {body}")]
    ContainerCreateFailed {
        image: String,
        status: u16,
        body: String,
    },

    #[error("container {container_id} failed to start (http {status})")]
    ContainerStartFailed { container_id: String, status: u16 },

    #[error("container {container_id} failed to stop (http {status})")]
    ContainerStopFailed { container_id: String, status: u16 },

    #[error("no free port on server {server_id} after {attempts} attempts")]
    PortExhausted { server_id: i32, attempts: u32 },

    #[error("instance {0} belongs to another user")]
    Forbidden(i32),
}

impl InstancerError {
    /// Status code this error maps to on the HTTP surface.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownServer(_) | Self::UnknownExercise(_) | Self::UnknownInstance(_) => {
                StatusCode::NOT_FOUND
            }
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::ServerUnreachable { .. }
            | Self::ContainerCreateFailed { .. }
            | Self::ContainerStartFailed { .. }
            | Self::ContainerStopFailed { .. } => StatusCode::BAD_GATEWAY,
            Self::NoExposedPort { .. } | Self::PortExhausted { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}
