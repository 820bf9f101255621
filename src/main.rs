use anyhow::Context as _;
use dotenv::dotenv;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use privacy_pool::driver::ChromeLauncher;
use privacy_pool::{AgentRequirement, FetchExecutor, FetchTask, PoolConfig, PrivacyContextManager};

const FETCH_RETRIES: u32 = 2;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let urls: Vec<String> = std::env::args().skip(1).collect();
    if urls.is_empty() {
        anyhow::bail!("usage: privacy-pool <url>...");
    }

    let config = PoolConfig::from_env();
    let timeout = config.fetch_task_timeout;
    let launcher = Arc::new(ChromeLauncher::from_config(&config));
    let manager = PrivacyContextManager::new(config, launcher).context("invalid pool configuration")?;
    manager.start();

    let executor = Arc::new(FetchExecutor::new(manager.clone()));
    let mut fetches = JoinSet::new();
    for url in urls {
        let executor = executor.clone();
        let task = FetchTask::new(url, AgentRequirement::AnyTemporary)
            .with_timeout(timeout)
            .with_retries(FETCH_RETRIES);
        fetches.spawn(async move { executor.fetch(&task).await });
    }

    let mut failed = 0usize;
    while let Some(joined) = fetches.join_next().await {
        match joined {
            Ok(result) => {
                if !result.is_success() {
                    failed += 1;
                }
                println!("{}", serde_json::to_string(&result)?);
            }
            Err(e) => {
                failed += 1;
                warn!(error = %e, "Fetch task panicked");
            }
        }
    }

    info!(pool = %serde_json::to_string(&manager.snapshot())?, "Final pool state");
    manager.shutdown().await;

    if failed > 0 {
        warn!(failed, "Some fetches failed");
    }
    Ok(())
}
