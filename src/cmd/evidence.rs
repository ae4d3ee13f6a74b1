//! Evidence export: `anvil evidence`.

use anyhow::{Context, Result};
use std::path::Path;
use uuid::Uuid;

use anvil::app::Anvil;
use anvil::config::AnvilConfig;

use super::super::EvidenceCommands;

pub async fn cmd_evidence(project_dir: &Path, command: EvidenceCommands) -> Result<()> {
    let anvil = Anvil::open(AnvilConfig::new(project_dir.to_path_buf())?)?;

    match command {
        EvidenceCommands::Export { id, output } => {
            let id = Uuid::parse_str(&id).with_context(|| format!("Invalid work item id '{}'", id))?;
            if anvil.queue.view(id).await?.is_none() {
                anyhow::bail!("Work item {} not found", id);
            }
            let report = anvil.evidence.export_report(id).await?;
            let json = serde_json::to_string_pretty(&report)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("Wrote {} evidence entries to {}", report.total, path.display());
                    for line in report.summary_lines() {
                        println!("  {}", line);
                    }
                }
                None => println!("{}", json),
            }
        }
    }
    Ok(())
}
