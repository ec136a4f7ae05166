use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use omnihive_memory::{
    CachedEmbedding, EmbeddingProvider, HashEmbedding, OllamaEmbedding, OpenAiEmbedding,
    VectorStore,
};
use omnihive_provider::{ChatProvider, OpenAiCompatProvider};
use omnihive_registry::SkillWatcher;
use omnihive_router::RouteOptions;
use omnihive_runner::RunOptions;
use omnihive_schema::{config::config_root, RouteResponse, RuntimeConfig, SkillError};
use omnihive_swarm::{NodeConfig, SwarmPool};
use tracing_subscriber::EnvFilter;

mod runtime;

use runtime::Runtime;

#[derive(Parser)]
#[command(name = "omnihive", version, about = "omnihive agentic orchestration runtime")]
struct Cli {
    #[arg(long, help = "Config root directory (default: $PRJ_CONFIG_HOME or ~/.omnihive)")]
    config_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Route a natural-language query to ranked skill commands")]
    Route {
        query: String,
        #[arg(long, help = "Disable LLM translation/classification")]
        local: bool,
        #[arg(long, help = "Print the raw JSON envelope")]
        json: bool,
        #[arg(long, help = "Score threshold override")]
        threshold: Option<f64>,
        #[arg(long, help = "Result limit override")]
        limit: Option<usize>,
    },
    #[command(about = "Execute a command: omnihive run skill.command key=value ...")]
    Run {
        tool: String,
        #[arg(help = "Arguments as key=value pairs")]
        args: Vec<String>,
        #[arg(long, help = "Arguments as a JSON object (overrides key=value)")]
        json_args: Option<String>,
    },
    #[command(about = "Force a full indexer pass over the skills directory")]
    Reindex {
        #[arg(long, help = "Drop the skills table first")]
        clear: bool,
    },
    #[command(about = "Watch the skills directory and reindex on change")]
    Watch,
    #[command(about = "Aggregate worker-pool health report")]
    Health,
}

fn init_tracing() {
    let default = if std::env::var("OMNI_CLI_VERBOSE").is_ok_and(|v| !v.is_empty() && v != "0") {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let root = cli.config_root.unwrap_or_else(config_root);
    let config = match RuntimeConfig::load(&root) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("config error: {e:#}");
            return ExitCode::from(2);
        }
    };

    match dispatch(cli.command, config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

/// Exit codes: 0 success, 2 invalid args, 3 unknown command, 4 execution
/// error, 5 circuit open, 124 timeout.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<SkillError>() {
        Some(SkillError::InvalidArgs(_)) => 2,
        Some(SkillError::UnknownCommand(_)) => 3,
        Some(SkillError::CircuitOpen(_)) => 5,
        Some(SkillError::ExecutionTimeout(_)) => 124,
        _ => 4,
    }
}

async fn dispatch(command: Commands, config: RuntimeConfig) -> Result<ExitCode> {
    match command {
        Commands::Route {
            query,
            local,
            json,
            threshold,
            limit,
        } => {
            let runtime = Runtime::assemble(&config, local)?;
            let hits = runtime
                .router
                .route_with(
                    &query,
                    RouteOptions {
                        threshold,
                        limit,
                        profile: None,
                    },
                )
                .await
                .map_err(surface_embedding_outage)?;

            if json {
                let envelope = RouteResponse::new(query, hits);
                println!("{}", serde_json::to_string_pretty(&envelope)?);
            } else if hits.is_empty() {
                println!("no matching commands");
            } else {
                for hit in hits {
                    println!(
                        "{:>6.3}  {}.{}  [{}]",
                        hit.final_score,
                        hit.skill_name,
                        hit.command_name,
                        hit.confidence.as_str()
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run {
            tool,
            args,
            json_args,
        } => {
            let runtime = Runtime::assemble(&config, true)?;
            runtime.indexer.reindex_all().await?;

            let parsed_args = match json_args {
                Some(raw) => serde_json::from_str(&raw)
                    .map_err(|e| SkillError::InvalidArgs(format!("bad --json-args: {e}")))?,
                None => parse_key_value_args(&args)?,
            };

            let result = runtime
                .runner
                .run_tool(&tool, parsed_args, RunOptions::default())
                .await
                .map_err(anyhow::Error::from)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Reindex { clear } => {
            let runtime = Runtime::assemble(&config, true)?;
            let update = if clear {
                runtime.indexer.reindex_clear().await?
            } else {
                runtime.indexer.reindex_all().await?
            };
            println!(
                "indexed: {} added, {} modified, {} removed",
                update.added.len(),
                update.modified.len(),
                update.removed.len()
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Watch => {
            let runtime = Runtime::assemble(&config, true)?;
            runtime.indexer.reindex_all().await?;
            let _watcher = SkillWatcher::spawn(
                config.skills_dir.clone(),
                Duration::from_millis(config.indexer.debounce_ms),
                Arc::clone(&runtime.indexer),
            )?;
            println!(
                "watching {} (debounce {}ms), ctrl-c to stop",
                config.skills_dir.display(),
                config.indexer.debounce_ms
            );
            tokio::signal::ctrl_c().await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Health => {
            let pool = SwarmPool::new(NodeConfig {
                connect_timeout: Duration::from_secs(config.swarm.connect_timeout_secs),
                execute_timeout: Duration::from_secs(config.swarm.execute_timeout_secs),
                max_retries: config.swarm.max_retries,
                circuit_cooldown: Duration::from_secs(config.swarm.circuit_cooldown_secs),
            });
            for (name, script) in &config.swarm.nodes {
                pool.register(name, script);
            }
            let report = pool.system_health().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn surface_embedding_outage(err: anyhow::Error) -> anyhow::Error {
    if err
        .downcast_ref::<omnihive_schema::EmbeddingError>()
        .is_some()
    {
        anyhow::anyhow!("embedding temporarily unavailable")
    } else {
        err
    }
}

/// `key=value` pairs; values that parse as JSON become typed, everything
/// else stays a string.
fn parse_key_value_args(pairs: &[String]) -> Result<serde_json::Value> {
    let mut map = serde_json::Map::new();
    for pair in pairs {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            SkillError::InvalidArgs(format!("expected key=value, got {pair:?}"))
        })?;
        let parsed = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        map.insert(key.to_string(), parsed);
    }
    Ok(serde_json::Value::Object(map))
}

/// Build the embedding provider the config names; unknown providers fall
/// back to the deterministic hash backend.
pub(crate) fn build_embedder(
    config: &RuntimeConfig,
    store: &VectorStore,
) -> Arc<dyn EmbeddingProvider> {
    let embedding = &config.embedding;
    match embedding.provider.as_str() {
        "openai" => {
            let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
            let mut provider = OpenAiEmbedding::new(api_key)
                .with_model(embedding.model.clone(), embedding.dimensions)
                .with_timeout(Duration::from_secs(embedding.timeout_secs));
            if let Some(base_url) = &embedding.base_url {
                provider = provider.with_base_url(base_url.clone());
            }
            Arc::new(CachedEmbedding::new(provider, store.db()))
        }
        "ollama" => {
            let mut provider =
                OllamaEmbedding::new(embedding.model.clone(), embedding.dimensions);
            if let Some(base_url) = &embedding.base_url {
                provider = provider.with_base_url(base_url.clone());
            }
            Arc::new(CachedEmbedding::new(provider, store.db()))
        }
        "hash" => Arc::new(HashEmbedding::new(embedding.dimensions)),
        other => {
            tracing::warn!("unknown embedding provider {other:?}, using hash backend");
            Arc::new(HashEmbedding::new(embedding.dimensions))
        }
    }
}

/// Optional LLM provider for translation/intent, from environment
/// credentials (opaque to the core).
pub(crate) fn build_chat_provider() -> Option<(Arc<dyn ChatProvider>, String)> {
    let api_key = std::env::var("OMNI_LLM_API_KEY").ok()?;
    let base_url = std::env::var("OMNI_LLM_BASE_URL")
        .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
    let model = std::env::var("OMNI_LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
    Some((
        Arc::new(OpenAiCompatProvider::new(api_key, base_url)),
        model,
    ))
}
