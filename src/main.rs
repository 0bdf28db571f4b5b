use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use screen_pilot::config::{load_config, AppConfig};
use screen_pilot::errors::PilotResult;
use screen_pilot::skills::SkillRegistry;

#[derive(Parser)]
#[command(name = "screen-pilot")]
#[command(about = "Drives a desktop GUI agent: observe, decide, act, verify, recover")]
#[command(version)]
struct Cli {
    /// Configuration file path. Defaults to config.toml next to the
    /// executable, then in the working directory.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one task against the local desktop
    Run {
        /// The task, in plain language
        task: String,

        /// Override agent.max_steps
        #[arg(long)]
        max_steps: Option<u32>,
    },

    /// List the skills the planner can use
    Skills,
}

async fn skill_registry(config: &AppConfig) -> SkillRegistry {
    let mut skills = SkillRegistry::with_builtins();
    if let Some(dir) = &config.agent.skills_dir {
        match skills.load_dir(dir).await {
            Ok(n) => tracing::info!(loaded = n, dir = %dir.display(), "custom skills loaded"),
            Err(e) => tracing::warn!(error = %e, dir = %dir.display(), "custom skills not loaded"),
        }
    }
    skills
}

#[cfg(feature = "desktop")]
async fn run_task(config: AppConfig, task: &str) -> PilotResult<bool> {
    use std::sync::Arc;

    use screen_pilot::agent_engine::Engine;
    use screen_pilot::executor::input::EnigoExecutor;
    use screen_pilot::llm::registry::ProviderRegistry;
    use screen_pilot::llm::RoleModel;
    use screen_pilot::memory::JsonMemoryStore;
    use screen_pilot::perception::screenshot::XcapCapture;
    use screen_pilot::perception::ui_automation::UiAutomationSource;

    let registry = Arc::new(ProviderRegistry::from_config(&config));
    let model = Arc::new(RoleModel::new(registry));
    let skills = skill_registry(&config).await;

    let mut engine = Engine::new(config.clone(), Arc::new(XcapCapture), Arc::new(EnigoExecutor), model)
        .with_accessibility(Arc::new(UiAutomationSource::default()))
        .with_skills(skills);
    if config.memory.enabled {
        let store = JsonMemoryStore::open(config.memory.resolved_storage_path());
        engine = engine.with_memory(Arc::new(store));
    }

    let stop = engine.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; stopping after the current step");
            stop.stop();
        }
    });

    let report = engine.run(task).await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(report.success)
}

#[cfg(not(feature = "desktop"))]
async fn run_task(_config: AppConfig, _task: &str) -> PilotResult<bool> {
    Err(screen_pilot::errors::PilotError::Agent(
        "no desktop backend compiled in; rebuild with --features desktop".into(),
    ))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let mut config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Run { task, max_steps } => {
            if let Some(n) = max_steps {
                config.agent.max_steps = n;
            }
            match run_task(config, &task).await {
                Ok(true) => ExitCode::SUCCESS,
                Ok(false) => ExitCode::FAILURE,
                Err(e) => {
                    tracing::error!(error = %e, "run failed");
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Skills => {
            let skills = skill_registry(&config).await;
            print!("{}", skills.describe_for_planner());
            ExitCode::SUCCESS
        }
    }
}
