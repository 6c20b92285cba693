use argh::FromArgs;
use color_eyre::Report;
use serde::Deserialize;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Deserialize)]
pub struct Web {
    /// address the host-facing http api listens on
    pub http_server: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Docker {
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,
    /// seconds before the backend runtime force-stops a container,
    /// independent of our own bookkeeping
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout: u32,
    /// per-request timeout towards backend servers, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_allocation_attempts")]
    pub allocation_attempts: u32,
}

fn default_port_range_start() -> u16 {
    40000
}

fn default_port_range_end() -> u16 {
    50000
}

fn default_stop_timeout() -> u32 {
    // 2h before the runtime kills the container
    7200
}

fn default_request_timeout() -> u64 {
    5
}

fn default_allocation_attempts() -> u32 {
    100
}

impl Docker {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Root {
    pub web: Web,
    pub docker: Docker,
}

#[derive(FromArgs)]
/// Instancer
pub struct Args {
    /// path to toml configuration file
    #[argh(positional)]
    pub toml: String,

    /// enable debug logging
    #[argh(switch)]
    pub debug: bool,
}

impl Args {
    pub fn get_config(&self) -> Result<Root, Report> {
        let toml = std::fs::read_to_string(&self.toml)?;
        Ok(toml::from_str(&toml)?)
    }

    pub fn setup_logging(&self) -> Result<(), Report> {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if self.debug {
                "debug,hyper=info"
            } else {
                "info"
            }
            .into()
        });

        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(filter)
            .finish();

        tracing::subscriber::set_global_default(subscriber)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Root;

    #[test]
    fn minimal_config_fills_defaults() {
        let toml = r#"
            [web]
            http_server = "0.0.0.0:8000"

            [docker]
        "#;

        let root: Root = toml::from_str(toml).unwrap();
        assert_eq!(root.web.http_server, "0.0.0.0:8000");
        assert_eq!(root.docker.port_range_start, 40000);
        assert_eq!(root.docker.port_range_end, 50000);
        assert_eq!(root.docker.stop_timeout, 7200);
        assert_eq!(root.docker.allocation_attempts, 100);
    }

    #[test]
    fn explicit_values_win() {
        let toml = r#"
            [web]
            http_server = "127.0.0.1:9000"

            [docker]
            port_range_start = 20000
            port_range_end = 20010
            stop_timeout = 600
            request_timeout = 2
        "#;

        let root: Root = toml::from_str(toml).unwrap();
        assert_eq!(root.docker.port_range_start, 20000);
        assert_eq!(root.docker.port_range_end, 20010);
        assert_eq!(root.docker.stop_timeout, 600);
        assert_eq!(root.docker.request_timeout().as_secs(), 2);
    }
}
