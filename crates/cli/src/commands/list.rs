//! List command implementation

use anyhow::{Context, Result};
use buildq_agent::{IdentityStore, WorkerIdentity};
use buildq_common::Config;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};

/// Print the workers registered from this host
pub fn execute(config: &Config) -> Result<()> {
    let store = IdentityStore::new(config.worker.workers_dir());
    let identities = store.list().context("Failed to read worker identities")?;

    if identities.is_empty() {
        println!(
            "No workers registered in {}",
            store.dir().display().to_string().dimmed()
        );
        return Ok(());
    }

    println!("{}", render(&identities));
    Ok(())
}

fn render(identities: &[WorkerIdentity]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            "Worker ID", "Queue", "Platform", "Hostname", "Dist", "Status",
        ]);

    for identity in identities {
        table.add_row(vec![
            Cell::new(&identity.worker_id),
            Cell::new(identity.queue_name()),
            Cell::new(&identity.platform),
            Cell::new(&identity.hostname),
            Cell::new(&identity.dist),
            status_cell(identity),
        ]);
    }
    table
}

fn status_cell(identity: &WorkerIdentity) -> Cell {
    if identity.is_live() {
        Cell::new(format!("running (pid {})", identity.pid.unwrap_or_default())).fg(Color::Green)
    } else if identity.running {
        Cell::new("stale").fg(Color::Red)
    } else {
        Cell::new("idle")
    }
}
