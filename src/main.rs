use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use workflow_capture::brain::LlmPolicy;
use workflow_capture::hands::ChromeLauncher;
use workflow_capture::session::{FileSessionStore, SessionManager};
use workflow_capture::{CaptureConfig, TaskSupervisor, face};

#[derive(Parser, Debug)]
#[command(name = "workflow-capture", version, about = "Capture UI walkthroughs of web apps")]
struct Args {
    /// Address to listen on; the next free port is used if it is taken
    #[arg(long, env = "CAPTURE_BIND_ADDR")]
    bind: Option<String>,

    #[arg(long, env = "CAPTURE_SCREENSHOTS_DIR")]
    screenshots_dir: Option<PathBuf>,

    #[arg(long, env = "CAPTURE_SESSIONS_DIR")]
    sessions_dir: Option<PathBuf>,

    /// Show the task browser windows
    #[arg(long)]
    headed: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,workflow_capture=debug")),
        )
        .init();

    let args = Args::parse();
    let mut config = CaptureConfig::from_env();
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(dir) = args.screenshots_dir {
        config = config.with_screenshots_dir(dir);
    }
    if let Some(dir) = args.sessions_dir {
        config = config.with_sessions_dir(dir);
    }
    if args.headed {
        config.headless = false;
    }
    std::fs::create_dir_all(&config.screenshots_dir)
        .with_context(|| format!("creating {}", config.screenshots_dir.display()))?;

    let launcher = Arc::new(ChromeLauncher::new(&config));
    let store = Arc::new(FileSessionStore::new(&config.sessions_dir).context("opening session store")?);
    let sessions = Arc::new(SessionManager::new(
        store,
        launcher.clone(),
        config.login_window,
        config.login_poll_interval,
    ));
    let policy = Arc::new(LlmPolicy::new(&config).context("configuring decision policy")?);
    let supervisor = Arc::new(TaskSupervisor::new(&config, sessions, launcher, policy));

    info!(
        model = %config.model_name,
        headless = config.headless,
        max_concurrent = config.max_concurrent_tasks,
        "workflow capture service ready"
    );
    let listener = face::bind(&config.bind_addr).await?;
    face::serve(listener, face::router(supervisor, &config.cors_origin)).await
}
