use std::time::Instant;

use tracing::{error, info, warn};
use trunchbull_core::sync::cancel::cancel_pair;
use trunchbull_core::sync::{SyncOutcome, SyncReport};

use super::{build_orchestrator, load_config, open_repository};

/// Run the `sync` command: one immediate pass, ignoring the scheduler.
pub async fn run(config_path: &str, student: Option<&str>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let repo = open_repository(&config).await?;
    let orchestrator = build_orchestrator(repo, &config)?;
    orchestrator.recover_interrupted().await?;

    if orchestrator.sources().is_empty() {
        warn!("No providers are enabled in the configuration");
        println!("No providers enabled. Enable [schoology] or [powerschool] in your config file first.");
        return Ok(());
    }

    // Ctrl-C stops between pages; a batch already persisting still commits.
    let (handle, cancel) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling sync");
            handle.cancel();
        }
    });

    let start = Instant::now();
    let reports = match student {
        Some(id) => match orchestrator.trigger_sync(id, &cancel).await {
            Ok(report) => vec![report],
            Err(e) => {
                error!("Sync failed: {e}");
                println!("Sync failed: {e}");
                return Err(e.into());
            }
        },
        None => orchestrator.sync_all(&cancel).await,
    };

    info!(students = reports.len(), "Sync command finished");
    println!(
        "Sync finished in {:.1}s for {} student(s)",
        start.elapsed().as_secs_f64(),
        reports.len()
    );
    for report in &reports {
        print_report(report);
    }

    let failed: usize = reports.iter().map(SyncReport::failed).sum();
    if failed > 0 {
        anyhow::bail!("{failed} sync step(s) failed");
    }
    Ok(())
}

fn print_report(report: &SyncReport) {
    println!();
    println!("Student {}", report.student_id);
    for result in &report.results {
        let line = match &result.outcome {
            SyncOutcome::Fresh => "fresh (cached)".to_string(),
            SyncOutcome::Synced {
                upserted,
                orphaned,
                rejected,
            } => format!("synced {upserted} (orphaned {orphaned}, rejected {rejected})"),
            SyncOutcome::Failed { message, .. } => format!("FAILED: {message}"),
        };
        println!("  {:<12} {:<12} {}", result.source.as_str(), result.data_type.as_str(), line);
    }
}
