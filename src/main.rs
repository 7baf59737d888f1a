mod archive;
mod config;
mod control;
mod shutdown;
mod sync;
mod worker;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::fs;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::{BrokerEnv, FuzzConfig};
use crate::worker::pool::PoolSupervisor;

const TARGET_ARCHIVE: &str = "target.zip";
const CORPUS_ARCHIVE: &str = "corpus.zip";
const CONFIG_FILE: &str = "config.ini";

// All broker logic is cooperatively scheduled on one thread; only process
// waits, sleeps and socket I/O actually suspend.
#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let env = BrokerEnv::parse();
    match run(env).await {
        Ok(rc) => {
            info!(rc, "successful shutdown");
            u8::try_from(rc).map(ExitCode::from).unwrap_or(ExitCode::FAILURE)
        }
        Err(err) => {
            error!("broker failed: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(env: BrokerEnv) -> Result<i32> {
    env.validate()?;
    info!(id = %env.id, guid = %env.guid, cpus = env.cpus, "broker starting");

    fs::create_dir_all(&env.fuzz_dir)
        .await
        .with_context(|| format!("failed to create fuzz directory {:?}", env.fuzz_dir))?;

    archive::extract(&env.data_dir.join(TARGET_ARCHIVE), &env.fuzz_dir).await?;
    archive::extract(&env.data_dir.join(CORPUS_ARCHIVE), &env.fuzz_dir).await?;

    let config = FuzzConfig::load(&env.fuzz_dir.join(CONFIG_FILE)).await?;

    PoolSupervisor::new(env, config).run().await
}
