use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use updatecast::config::{BrokerConfig, ServerConfig};
use updatecast::logging::{self, LogFormat};
use updatecast::session::{MemoryStates, StreamCoordinator};
use updatecast::signals::wait_for_shutdown_signal;
use updatecast::{broker, Context, Server};

#[tokio::main]
async fn main() -> ExitCode {
    let server_config = ServerConfig::from_env();
    if let Err(e) = logging::init(
        &server_config.log_level,
        LogFormat::parse(&server_config.log_format),
    ) {
        eprintln!("updatecast: {e}");
        return ExitCode::FAILURE;
    }

    match run(server_config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}

async fn run(server_config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let broker_config = BrokerConfig::from_env()?;
    let broker = broker::factory::connect(&broker_config).await?;

    let listener = TcpListener::bind(&server_config.listen_addr).await?;
    let coordinator = StreamCoordinator::new(Arc::clone(&broker), Arc::new(MemoryStates::new()));
    let server = Server::new(coordinator);

    let shutdown = Context::background();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "cannot listen for shutdown signals");
        }
        trigger.cancel();
    });

    server.serve(listener, shutdown).await?;
    broker.close().await?;
    info!("shutdown complete");
    Ok(())
}
