// Tally - local-first budgeting data layer
// Entry point for running sync cycles from the command line

use anyhow::{bail, Context, Result};
use chrono::Local;
use std::path::PathBuf;
use tally::app::AppState;
use tally::import::{ImportBundle, Resolution};
use tally::session::{Actor, Session};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "usage: tally <sync|full-sync|materialize|status|import FILE|daemon>";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tally=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        bail!(USAGE);
    };

    let data_dir = data_dir()?;
    let session = session_from_env();
    tracing::info!("Starting tally in {:?}", data_dir);

    let state = AppState::from_settings(&data_dir, session)
        .await
        .context("failed to initialize data layer")?;

    match command.as_str() {
        "sync" => {
            let report = state.manager.sync().await?;
            tracing::info!("{:?}", report);
        }
        "full-sync" => {
            let report = state.manager.full_sync().await?;
            tracing::info!("{:?}", report);
        }
        "materialize" => {
            let actor = require_actor(&state)?;
            let report = state
                .materializer
                .materialize_due(Local::now().date_naive(), &actor)
                .await?;
            tracing::info!("{:?}", report);
        }
        "status" => {
            let status = state.manager.status();
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        "import" => {
            let Some(path) = args.get(1) else {
                bail!(USAGE);
            };
            let actor = require_actor(&state)?;
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read {}", path))?;
            let bundle = ImportBundle::from_json(&content)?;
            let importer = state.importer();

            let conflicts = importer.conflicts(&bundle).await?;
            if !conflicts.is_empty() {
                tracing::warn!(
                    "{} recurring template(s) match existing ones; keeping both",
                    conflicts.len()
                );
            }

            let report = importer
                .import(&bundle, &Resolution::default(), &actor)
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        "daemon" => {
            let _listener = state.spawn_connectivity_listener();
            let _monitor = state.spawn_reachability_monitor();
            let scheduler = state.start_scheduler().await?;
            tracing::info!("Running until interrupted");
            tokio::signal::ctrl_c().await?;
            scheduler.shutdown().await?;
        }
        other => bail!("unknown command '{}'\n{}", other, USAGE),
    }

    Ok(())
}

fn data_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("TALLY_DATA_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let home = std::env::var("HOME").context("neither TALLY_DATA_DIR nor HOME is set")?;
    Ok(PathBuf::from(home).join(".local/share/tally"))
}

fn session_from_env() -> Session {
    match (
        std::env::var("TALLY_USER_ID"),
        std::env::var("TALLY_ACCESS_TOKEN"),
    ) {
        (Ok(id), Ok(token)) => Session::signed_in(Actor::new(id, token)),
        _ => Session::new(),
    }
}

fn require_actor(state: &AppState) -> Result<Actor> {
    state
        .session
        .actor()
        .context("TALLY_USER_ID and TALLY_ACCESS_TOKEN must be set")
}
