use trunchbull_core::db::repository::{StudentRepository, SyncStatusRepository};
use trunchbull_core::db::sqlite::SqliteRepository;
use trunchbull_core::models::sync::SyncStatusRecord;

use super::{load_config, open_repository};

/// Run the `status` command: show sync status per student.
pub async fn run(config_path: &str, student: Option<&str>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let repo = open_repository(&config).await?;

    let db_size = std::fs::metadata(&config.database.path)
        .map(|m| format_bytes(m.len()))
        .unwrap_or_else(|_| "unknown".to_string());

    println!("Trunchbull Status");
    println!("=================");
    println!("Database:  {} ({})", config.database.path, db_size);
    let enabled: Vec<&str> = config.enabled_sources().iter().map(|s| s.as_str()).collect();
    println!(
        "Providers: {}",
        if enabled.is_empty() {
            "none enabled".to_string()
        } else {
            enabled.join(", ")
        }
    );
    println!();

    print_statuses(&repo, student).await
}

async fn print_statuses(repo: &SqliteRepository, student: Option<&str>) -> anyhow::Result<()> {
    let students = match student {
        Some(id) => match repo.get_student(id).await? {
            Some(s) => vec![s],
            None => anyhow::bail!("student '{id}' not found"),
        },
        None => repo.list_students().await?,
    };

    if students.is_empty() {
        println!("No students registered.");
        return Ok(());
    }

    for s in students {
        println!("{} ({})", s.name, s.id);
        let rows = repo.list_sync_statuses(Some(&s.id)).await?;
        if rows.is_empty() {
            println!("  never synced");
        }
        for row in rows {
            println!("  {}", format_row(&row));
        }
        println!();
    }
    Ok(())
}

fn format_row(row: &SyncStatusRecord) -> String {
    let last = row
        .last_sync
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string());
    let mut line = format!(
        "{:<12} {:<12} {:<13} {}",
        row.source.as_str(),
        row.data_type.as_str(),
        row.status.as_str(),
        last
    );
    if let Some(ref err) = row.error_message {
        line.push_str(&format!("  ({err})"));
    }
    line
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
