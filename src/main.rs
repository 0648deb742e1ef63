use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use estuary::app::AppContext;
use estuary::config::Config;
use estuary::orchestrator::Orchestrator;

#[derive(Parser)]
#[command(name = "estuary", version, about = "Feed ingestion and change-detection engine")]
struct Cli {
    /// Configuration file (defaults to ~/.config/estuary/config.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Poll all enabled feeds on their schedules until interrupted.
    Run,
    /// Poll one feed a single time and report what was discovered.
    Once {
        /// Feed name as configured.
        feed: String,
    },
    /// Render a URL through the browser pool (debugging aid).
    Render {
        url: String,
        /// Also write a screenshot to this path.
        #[arg(long)]
        screenshot: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("estuary=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };
    config.validate().context("invalid configuration")?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let ctx = Arc::new(AppContext::from_config(config).await?);
            Orchestrator::new(ctx).run().await?;
        }
        Command::Once { feed } => {
            let ctx = Arc::new(AppContext::from_config(config).await?);
            let orchestrator = Orchestrator::new(Arc::clone(&ctx));
            let result = orchestrator.run_once(&feed).await;
            ctx.shutdown().await?;
            let metrics = result?;
            println!(
                "{}: {} discovered, {} delivered, {} failed",
                feed, metrics.discovered, metrics.succeeded, metrics.failed
            );
        }
        Command::Render { url, screenshot } => {
            let mut config = config;
            // The debug command always needs the pool, whatever the
            // config says.
            config.browser.enabled = true;
            let full_page = config.browser.screenshot.full_page;
            let ctx = Arc::new(AppContext::from_config(config).await?);
            let result = render_command(&ctx, &url, screenshot.as_deref(), full_page).await;
            ctx.shutdown().await?;
            result?;
        }
    }

    Ok(())
}

async fn render_command(
    ctx: &AppContext,
    url: &str,
    screenshot: Option<&std::path::Path>,
    full_page: bool,
) -> anyhow::Result<()> {
    let pool = ctx
        .browser
        .as_ref()
        .context("browser pool failed to start")?;

    let (lease, info) = pool.render(url).await?;
    println!("final url:   {}", info.final_url);
    println!("title:       {}", info.title.as_deref().unwrap_or("(none)"));
    println!(
        "http status: {}",
        info.http_status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "(unknown)".to_string())
    );
    println!("load time:   {} ms", info.load_time.as_millis());

    if let Some(path) = screenshot {
        pool.screenshot(&lease, path, full_page).await?;
        println!("screenshot:  {}", path.display());
    }

    Ok(())
}
