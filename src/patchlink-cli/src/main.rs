use anyhow::{bail, Result};
use clap::Parser;
use firebase_store::{FirebaseConfig, FirebaseStore};
use patchlink_core::{init_logging, AppDirs, Config, SessionId};
use patchlink_host::{spawn_command_reader, OutletSink};
use patchlink_relay::SessionRelay;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "patchlink", version, about = "Realtime device request relay")]
struct Cli {
    /// Session id override (takes precedence over config)
    #[arg(long)]
    session: Option<String>,
    /// Database base URL override
    #[arg(long)]
    database_url: Option<String>,
    /// Database auth token override
    #[arg(long)]
    auth_token: Option<String>,
    /// Attach the listener immediately instead of waiting for `start`
    #[arg(long)]
    listen: bool,
}

fn resolve_session(cli: &Cli, config: &Config) -> SessionId {
    cli.session
        .clone()
        .or_else(|| config.session.clone())
        .map(SessionId::new)
        .unwrap_or_else(SessionId::for_machine)
}

fn resolve_store_config(cli: &Cli, config: &Config) -> Option<FirebaseConfig> {
    let database_url = cli
        .database_url
        .clone()
        .or_else(|| config.store.database_url.clone())?;
    Some(FirebaseConfig {
        database_url,
        auth_token: cli
            .auth_token
            .clone()
            .or_else(|| config.store.auth_token.clone()),
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let dirs = AppDirs::discover()?;
    let config = Config::load_or_default(&dirs)?;
    let _logging = init_logging(&config.logging, &dirs)?;

    let session = resolve_session(&cli, &config);
    let Some(store_config) = resolve_store_config(&cli, &config) else {
        bail!(
            "no database URL configured; set store.database_url in {} or pass --database-url",
            Config::config_path(&dirs).display()
        );
    };

    tracing::info!(session = %session, "device request relay starting");
    tracing::info!("using realtime store listeners, no polling");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(session, store_config, cli.listen))
}

async fn run(session: SessionId, store_config: FirebaseConfig, listen: bool) -> Result<()> {
    let store = Arc::new(FirebaseStore::new(store_config)?);
    let sink = Arc::new(OutletSink::stdout());
    let mut relay = SessionRelay::new(session, store, sink);

    if listen {
        relay.start().await;
    }

    let commands = spawn_command_reader(std::io::BufReader::new(std::io::stdin()), 32);
    relay.run(commands).await;

    tracing::info!("device request relay stopped");
    Ok(())
}
