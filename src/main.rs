use anyhow::Result;
use clap::Parser;
use perch::{
    agent::AgentRegistry,
    api::ApiServer,
    config::Config,
    engine::Engine,
    memory::MemoryStore,
    models::AgentRecord,
    prompt::PromptBuilder,
    sandbox::ScratchDirProvider,
    skill::SkillLoader,
    store::Store,
    thread::Renderer,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "perch", about = "Personal always-on agent orchestrator")]
struct Cli {
    /// Data directory (defaults to ~/.perch)
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Log filter, e.g. "info" or "perch=debug"
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log)?)
        .init();

    info!("Starting Perch");

    let config = Arc::new(Config::load(cli.dir.as_deref())?);
    tokio::fs::create_dir_all(&config.dir).await?;
    tokio::fs::create_dir_all(config.memory_dir()).await?;
    tokio::fs::create_dir_all(config.skills_dir()).await?;

    let store = Arc::new(Store::open(&config.store_path())?);
    store.recover_interrupted().await?;

    for decl in &config.agents {
        store
            .upsert_agent(&AgentRecord {
                name: decl.name.clone(),
                adapter: decl.adapter.clone(),
                command: decl.command.clone(),
                context_window: decl.context_window,
                default_isolation: decl.default_isolation.clone(),
                healthy: true,
                health_checked_at: None,
            })
            .await?;
    }
    info!("Registered {} agent(s) from configuration", config.agents.len());

    let memory = Arc::new(MemoryStore::new(config.memory_dir()));
    let skills = Arc::new(SkillLoader::new(config.skills_dir()));
    let builder = PromptBuilder::new(
        store.clone(),
        memory.clone(),
        skills,
        Arc::new(Renderer),
        config.clone(),
    );
    let engine = Engine::new(
        store.clone(),
        builder,
        Arc::new(AgentRegistry::new()),
        Arc::new(ScratchDirProvider::new(config.sandbox_dir())),
        memory,
        config.clone(),
    )?;
    let api = ApiServer::new(config.clone(), store.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine_handle = tokio::spawn(async move { engine.run(shutdown_rx).await });
    let api_handle = tokio::spawn(async move { api.run().await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = api_handle => {
            if let Ok(Err(e)) = result {
                error!("Control surface failed: {}", e);
            }
        }
    }

    // Let the engine drain its in-flight task before exiting.
    let _ = shutdown_tx.send(true);
    match tokio::time::timeout(std::time::Duration::from_secs(10), engine_handle).await {
        Ok(Ok(Ok(()))) => info!("Timeline engine stopped"),
        Ok(Ok(Err(e))) => error!("Timeline engine failed: {}", e),
        Ok(Err(e)) => error!("Timeline engine panicked: {}", e),
        Err(_) => error!("Timeline engine did not stop within the grace period"),
    }

    Ok(())
}
