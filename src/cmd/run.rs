//! Worker loop: `anvil run`.

use anyhow::Result;
use std::path::Path;
use tokio::sync::watch;

use anvil::app::Anvil;
use anvil::config::AnvilConfig;
use anvil::worker::run_workers;

pub async fn cmd_run(project_dir: &Path, workers: Option<usize>, once: bool, profile: Option<String>) -> Result<()> {
    let config = AnvilConfig::with_cli_args(project_dir.to_path_buf(), profile, workers)?;
    for warning in config.validate() {
        println!("{} {}", console::style("warning:").yellow(), warning);
    }
    let anvil = Anvil::open(config)?;

    let (failed, requeued) = anvil.queue.recover_stale().await?;
    if failed + requeued > 0 {
        tracing::warn!(requeued, failed, "recovered items left active by an earlier run");
        println!("Recovered {} interrupted item(s) ({} failed)", failed + requeued, failed);
    }

    // `--once` means at most one item, so a single worker.
    let workers = if once { 1 } else { anvil.resolved.workers };
    let ctx = anvil.worker_context()?;

    println!(
        "Anvil running: {} worker(s), profile '{}', agent `{}`",
        workers, anvil.resolved.profile.name, anvil.resolved.agent_command
    );
    if !once {
        println!("Press Ctrl-C to stop after the current item.");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received, draining workers");
            let _ = shutdown_tx.send(true);
        }
    });

    let stats = run_workers(ctx, workers, shutdown_rx, once).await?;

    println!();
    println!(
        "Done: {} claimed, {} completed, {} requeued, {} failed",
        stats.claimed,
        console::style(stats.completed).green(),
        console::style(stats.requeued).yellow(),
        console::style(stats.failed).red()
    );
    Ok(())
}
