use color_eyre::Report;
use std::sync::Arc;

use instancer::config::Args;
use instancer::docker::DockerApi;
use instancer::orchestrator::Orchestrator;
use instancer::server;

#[tokio::main]
async fn main() -> Result<(), Report> {
    color_eyre::install()?;

    // get config
    let args = argh::from_env::<Args>();
    let config = args.get_config()?;

    // setup logging
    args.setup_logging()?;

    let runtime = DockerApi::new(
        config.docker.request_timeout(),
        config.docker.stop_timeout,
    )?;
    let orchestrator = Arc::new(Orchestrator::new(runtime, &config.docker));

    let addr = config.web.http_server.parse()?;
    server::run(addr, orchestrator).await;

    Ok(())
}
