//! mimir — operator CLI
//!
//! Thin tool over the gateway for health checks, smoke-test invocations,
//! and cache inspection. Reads the same configuration as the library.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use mimir::{Config, EmbedRequest, InvokeOptions, Mimir};

/// Mimir gateway operator tool
#[derive(Parser)]
#[command(name = "mimir")]
#[command(version)]
#[command(about = "Corporate LLM gateway operator tool")]
struct Args {
    /// Config file path (default: ~/.mimir/config.toml)
    #[arg(short, long, env = "MIMIR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check dependency and breaker status (exit 0 when all ok)
    Health,

    /// Generate an embedding and print its length and source
    Embed {
        /// Text to embed
        text: String,
        /// Model to use (default: catalog default)
        #[arg(short, long)]
        model: Option<String>,
        /// Skip the cache
        #[arg(long)]
        no_cache: bool,
    },

    /// Invoke a generation model and print the completion
    Invoke {
        /// Model id
        model: String,
        /// Prompt text
        prompt: String,
        /// Completion token cap
        #[arg(short = 'n', long, default_value_t = 512)]
        max_tokens: u32,
    },

    /// Print cache row count, hit rate, and quality
    CacheStats,

    /// Apply relational schema migrations
    Migrate,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> mimir::Result<ExitCode> {
    let config = Config::load(args.config.as_deref())?;
    let gateway = Mimir::builder().config(config).build().await?;

    let code = match args.command {
        Command::Health => {
            let report = gateway.health().await;
            for dep in &report.dependencies {
                println!(
                    "{:18} {:5} {:8.1}ms  {}",
                    dep.name,
                    if dep.ok { "ok" } else { "DOWN" },
                    dep.latency_ms,
                    dep.detail
                );
            }
            for breaker in &report.breakers {
                println!("breaker {:12} {}", breaker.name, breaker.state.as_str());
            }
            if report.all_ok() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }

        Command::Embed {
            text,
            model,
            no_cache,
        } => {
            let mut request = EmbedRequest::new(text).use_cache(!no_cache);
            if let Some(model) = model {
                request = request.model(model);
            }
            let result = gateway.embed(request).await?;
            println!(
                "{} dims  source={}  model={}  quality={:.2}",
                result.vector.len(),
                result.source.as_str(),
                result.model_used,
                result.quality_score
            );
            ExitCode::SUCCESS
        }

        Command::Invoke {
            model,
            prompt,
            max_tokens,
        } => {
            let content = gateway
                .invoke(
                    &model,
                    &prompt,
                    InvokeOptions {
                        max_tokens: Some(max_tokens),
                        ..InvokeOptions::default()
                    },
                )
                .await?;
            println!("{content}");
            ExitCode::SUCCESS
        }

        Command::CacheStats => {
            let stats = gateway.cache_stats().await?;
            println!(
                "rows={}  hit_rate={:.1}%  hits={}  misses={}  avg_quality={:.2}",
                stats.rows,
                stats.hit_rate() * 100.0,
                stats.hits,
                stats.misses,
                stats.avg_quality
            );
            ExitCode::SUCCESS
        }

        Command::Migrate => {
            gateway.migrate().await?;
            println!("migrations applied");
            ExitCode::SUCCESS
        }
    };

    gateway.close().await;
    Ok(code)
}
