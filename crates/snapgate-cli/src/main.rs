use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use snapgate_browser::{ChromiumDriver, HttpWarmFetcher};
use snapgate_core::config::{RenderOptions, SiteConfig};
use snapgate_core::store::MemoryStore;
use snapgate_engine::EngineManager;

#[derive(Parser)]
#[command(name = "snapgate", version, about = "Crawler-aware prerender engine")]
struct Cli {
    /// Path to the JSON site-configuration file (an array of sites)
    #[arg(short, long, env = "SNAPGATE_CONFIG", default_value = "sites.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run engines for every configured site until interrupted
    Run,

    /// Render a single URL through a site's engine and print the HTML
    Render {
        /// Site id from the configuration file
        #[arg(short, long)]
        site: String,

        /// Absolute URL to render
        #[arg(short, long)]
        url: String,
    },

    /// Trigger a full preheat for a site and wait for it to finish
    Preheat {
        /// Site id from the configuration file
        #[arg(short, long)]
        site: String,
    },
}

/// Application context built once at startup and passed everywhere —
/// there is no global engine registry.
struct AppContext {
    manager: Arc<EngineManager<ChromiumDriver, MemoryStore, HttpWarmFetcher>>,
}

impl AppContext {
    fn build(config_path: &Path) -> Result<Self> {
        let sites = load_sites(config_path)?;
        let warm = HttpWarmFetcher::new().context("Failed to build warm fetcher")?;
        let manager = EngineManager::new(ChromiumDriver::new(), MemoryStore::new(), Some(warm));
        for site in sites {
            manager
                .add_site(site)
                .context("Failed to register site")?;
        }
        Ok(Self { manager })
    }
}

fn load_sites(path: &Path) -> Result<Vec<SiteConfig>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config file {}", path.display()))?;
    let sites: Vec<SiteConfig> =
        serde_json::from_str(&raw).context("Config file is not a valid site list")?;
    if sites.is_empty() {
        bail!("Config file {} contains no sites", path.display());
    }
    Ok(sites)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("snapgate=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let ctx = AppContext::build(&cli.config)?;

    match cli.command {
        Commands::Run => cmd_run(&ctx).await,
        Commands::Render { site, url } => cmd_render(&ctx, &site, &url).await,
        Commands::Preheat { site } => cmd_preheat(&ctx, &site).await,
    }
}

async fn cmd_run(ctx: &AppContext) -> Result<()> {
    ctx.manager.start_all().await?;
    ctx.manager.start_auto_preheat();
    tracing::info!(sites = ?ctx.manager.list_sites(), "Snapgate running; ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");
    ctx.manager.stop_all().await;
    Ok(())
}

async fn cmd_render(ctx: &AppContext, site: &str, url: &str) -> Result<()> {
    let engine = ctx
        .manager
        .get_engine(site)
        .with_context(|| format!("Unknown site: {site}"))?;
    engine.start().await?;

    let rendered = engine.render(url, &RenderOptions::default()).await?;
    if rendered.result.success {
        tracing::info!(
            hit_cache = rendered.hit_cache,
            bytes = rendered.result.html.len(),
            "Render finished"
        );
        println!("{}", rendered.result.html);
    } else {
        let reason = rendered.result.error.unwrap_or_else(|| "unknown".into());
        engine.stop().await;
        bail!("Render failed: {reason}");
    }

    engine.stop().await;
    Ok(())
}

async fn cmd_preheat(ctx: &AppContext, site: &str) -> Result<()> {
    let engine = ctx
        .manager
        .get_engine(site)
        .with_context(|| format!("Unknown site: {site}"))?;
    engine.start().await?;

    let task_id = engine.trigger_preheat()?;
    tracing::info!(%task_id, "Preheat started");

    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let status = engine.preheat_status();
        let Some(task) = status.last_task else { continue };
        tracing::info!(
            status = %task.status,
            processed = task.progress.processed,
            total = task.progress.total,
            "Preheat progress"
        );
        if task.status.is_terminal() {
            let stats = engine.stats().await.unwrap_or_default();
            println!(
                "preheat {}: {} urls, {} cached, {} bytes",
                task.status, stats.url_count, stats.cached_count, stats.cache_bytes
            );
            break;
        }
    }

    engine.stop().await;
    Ok(())
}
