//! model-selector — demo CLI entry point.
//!
//! Runs one selection pass end-to-end against the real provider probes,
//! using an in-memory stand-in for the host's model registry / auth
//! storage / notification surface (the real versions are an external
//! collaborator this crate only defines a trait boundary for).

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use model_selector::config::{ConfigError, ConfigProvider, LoadedConfig};
use model_selector::cooldown::CooldownStore;
use model_selector::host::{AuthStorage, MemoryHost, Model};
use model_selector::lock::ModelLockCoordinator;
use model_selector::probes::ProbeContext;
use model_selector::selector::{run_selector, SelectionReason, SelectorDeps, SelectorOptions};
use model_selector::util::home_dir;

#[derive(Parser, Debug)]
#[command(name = "model-selector", about = "Rate-limit-aware model selection controller")]
struct Cli {
    /// Path to a JSON mapping config. Defaults to an empty configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Why this selection pass was triggered.
    #[arg(long, value_enum, default_value = "startup")]
    reason: ReasonArg,

    /// Directory used for cooldown/lock state. Defaults to `~/.pi/model-selector/`.
    #[arg(long)]
    state_dir: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ReasonArg {
    Startup,
    RateLimited,
    Manual,
}

impl From<ReasonArg> for SelectionReason {
    fn from(value: ReasonArg) -> Self {
        match value {
            ReasonArg::Startup => SelectionReason::Startup,
            ReasonArg::RateLimited => SelectionReason::RateLimited,
            ReasonArg::Manual => SelectionReason::Manual,
        }
    }
}

/// Reads a JSON `LoadedConfig` from disk for the demo binary. The on-disk
/// wizard format and its editor are an external collaborator out of scope
/// for the library itself; this is just enough to exercise the pipeline.
struct FileConfigProvider(PathBuf);

impl ConfigProvider for FileConfigProvider {
    fn load(&self) -> Result<LoadedConfig, ConfigError> {
        match std::fs::read_to_string(&self.0) {
            Ok(contents) => {
                let config: LoadedConfig = serde_json::from_str(&contents)
                    .unwrap_or_else(|e| {
                        tracing::warn!("failed to parse {}: {} — using empty config", self.0.display(), e);
                        LoadedConfig::default()
                    });
                Ok(config)
            }
            Err(_) => Ok(LoadedConfig::default()),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "model_selector=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let state_dir = cli
        .state_dir
        .unwrap_or_else(|| PathBuf::from(home_dir()).join(".pi").join("model-selector"));

    let config_provider: Arc<dyn ConfigProvider> = match cli.config {
        Some(path) => Arc::new(FileConfigProvider(path)),
        None => Arc::new(FileConfigProvider(state_dir.join("config.json"))),
    };

    // Demo model registry: seeded from whatever the loaded config actually
    // maps to, since there's no real host plugin to ask.
    let config = config_provider.load()?;
    let mut models: Vec<Model> = config
        .mappings
        .iter()
        .filter_map(|m| match &m.action {
            model_selector::config::MappingAction::Model { model, .. } => Some(Model {
                provider: model.provider.clone(),
                id: model.id.clone(),
            }),
            _ => None,
        })
        .collect();
    if let Some(fallback) = &config.fallback {
        models.push(Model {
            provider: fallback.provider.clone(),
            id: fallback.id.clone(),
        });
    }
    models.dedup_by(|a, b| a == b);

    let host = Arc::new(MemoryHost::new(models));
    let cooldowns = Arc::new(CooldownStore::new(state_dir.join("cooldowns.json")).await);
    let locks = Arc::new(ModelLockCoordinator::new(state_dir.join("locks")));
    let probe_ctx = ProbeContext::new(host.clone() as Arc<dyn AuthStorage>);

    let deps = SelectorDeps {
        config_provider,
        host: host.clone(),
        model_registry: host,
        cooldowns,
        locks,
        probe_ctx,
        probes: model_selector::probes::all_probes(),
    };

    match run_selector(&deps, cli.reason.into(), &SelectorOptions::default()).await {
        Ok(model) => {
            info!(model = %model.lock_key(), "selection complete");
            println!("{}/{}", model.provider, model.id);
            Ok(())
        }
        Err(e) => {
            eprintln!("model selection failed: {}", e);
            Err(e.into())
        }
    }
}
