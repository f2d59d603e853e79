use crate::analyzer;
use crate::cli::{Commands, ConfigArgs};
use crate::config::Config;
use crate::supervisor::address::ServiceAddress;
use crate::supervisor::process::OsLauncher;
use crate::supervisor::readiness::HttpRestClient;
use crate::supervisor::{self, signal, Supervisor, SupervisorSettings};
use anyhow::Result;
use tracing::info;
use topowatch_agent::capability;

pub async fn handle_command(command: Commands, args: &ConfigArgs, config: &Config) -> Result<()> {
    match command {
        Commands::Allinone { analyzer_uid } => handle_allinone(analyzer_uid, args, config).await,
        Commands::Analyzer => handle_analyzer(config).await,
        Commands::Agent => handle_agent(config).await,
    }
}

async fn handle_allinone(analyzer_uid: Option<u32>, args: &ConfigArgs, config: &Config) -> Result<()> {
    supervisor::require_root(supervisor::current_euid())?;
    let binary = std::env::current_exe()?;
    let settings = SupervisorSettings::from_config(config, args, binary, analyzer_uid)?;
    let client = HttpRestClient::new(
        settings.analyzer_address().url(config.analyzer.tls),
        config.analyzer_auth(),
        config.request_timeout(),
    );
    info!("Readiness probe target: {}", client.base_url());

    let mut shutdown = signal::listen()?;
    let mut supervisor = Supervisor::new(settings, OsLauncher, client);
    supervisor.run(&mut shutdown).await?;
    info!("topowatch all-in-one stopped");
    Ok(())
}

async fn handle_analyzer(config: &Config) -> Result<()> {
    let listen = ServiceAddress::parse(&config.analyzer.listen)?;
    let mut shutdown = signal::listen()?;
    analyzer::serve(&listen, async move {
        if let Some(received) = shutdown.recv().await {
            info!("Received {}, stopping analyzer", received);
        }
    })
    .await
}

async fn handle_agent(config: &Config) -> Result<()> {
    let mut shutdown = signal::listen()?;
    topowatch_agent::agent::run(config.agent_config(), capability::global(), async move {
        if let Some(received) = shutdown.recv().await {
            info!("Received {}, stopping agent", received);
        }
    })
    .await
}
