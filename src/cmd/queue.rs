//! Work queue commands: `anvil queue` and `anvil status`.

use anyhow::{Context, Result};
use std::path::Path;

use anvil::app::Anvil;
use anvil::config::AnvilConfig;
use anvil::queue::{ListFilter, NewWorkItem, WorkItem, WorkStatus, WorkType};
use uuid::Uuid;

use super::super::QueueCommands;

pub async fn cmd_queue(project_dir: &Path, command: QueueCommands) -> Result<()> {
    let anvil = Anvil::open(AnvilConfig::new(project_dir.to_path_buf())?)?;
    let default_max_attempts = anvil.config.toml.queue.max_attempts.max(1);

    match command {
        QueueCommands::Push {
            title,
            work_type,
            priority,
            description,
            source,
            expected_files,
            needs,
            max_attempts,
        } => {
            let mut item = NewWorkItem {
                title,
                description,
                work_type,
                priority,
                source,
                max_attempts: Some(max_attempts.unwrap_or(default_max_attempts)),
                success_criteria: Vec::new(),
                functional_verifications: Vec::new(),
                expected_files: None,
                needs: needs.into_iter().collect(),
            };
            if !expected_files.is_empty() {
                item = item.with_expected_files(expected_files);
            }
            let id = anvil.queue.push(item).await?;
            println!("{}", id);
        }
        QueueCommands::Import { file } => {
            let items = read_import_file(&file)?;
            let total = items.len();
            let mut added = 0;
            for (i, mut item) in items.into_iter().enumerate() {
                item.max_attempts.get_or_insert(default_max_attempts);
                let title = item.title.clone();
                match anvil.queue.push(item).await {
                    Ok(id) => {
                        added += 1;
                        println!("{}  {}", id, title);
                    }
                    Err(e) => {
                        eprintln!(
                            "{} item {} ('{}'): {}",
                            console::style("skipped").yellow(),
                            i + 1,
                            title,
                            e
                        );
                    }
                }
            }
            println!();
            println!("Imported {} of {} item(s) from {}", added, total, file.display());
        }
        QueueCommands::List {
            status,
            work_type,
            min_priority,
            max_priority,
            json,
        } => {
            let filter = ListFilter {
                status: status.as_deref().map(str::parse::<WorkStatus>).transpose()?,
                work_type: work_type.as_deref().map(str::parse::<WorkType>).transpose()?,
                min_priority,
                max_priority,
            };
            let items = anvil.queue.list(filter).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else {
                print_table(&items);
            }
        }
        QueueCommands::View { id } => {
            let id = Uuid::parse_str(&id).with_context(|| format!("Invalid work item id '{}'", id))?;
            match anvil.queue.view(id).await? {
                Some(item) => println!("{}", serde_json::to_string_pretty(&item)?),
                None => anyhow::bail!("Work item {} not found", id),
            }
        }
    }
    Ok(())
}

/// Parse a YAML or JSON list of work items, chosen by extension.
fn read_import_file(path: &Path) -> Result<Vec<NewWorkItem>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let is_json = path.extension().is_some_and(|e| e.eq_ignore_ascii_case("json"));
    if is_json {
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    } else {
        serde_yaml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }
}

fn styled_status(status: WorkStatus) -> console::StyledObject<&'static str> {
    let text = status.as_str();
    match status {
        WorkStatus::Pending => console::style(text).dim(),
        WorkStatus::Active => console::style(text).cyan(),
        WorkStatus::Completed => console::style(text).green(),
        WorkStatus::Failed => console::style(text).red(),
    }
}

fn print_table(items: &[WorkItem]) {
    if items.is_empty() {
        println!("No work items.");
        return;
    }
    println!(
        "{:<10} {:<10} {:<14} {:<4} {:<8} Title",
        "ID", "Status", "Type", "Pri", "Attempts"
    );
    println!(
        "{:<10} {:<10} {:<14} {:<4} {:<8} -----",
        "--------", "------", "----", "---", "--------"
    );
    for item in items {
        println!(
            "{:<10} {:<10} {:<14} {:<4} {:<8} {}",
            item.short_id(),
            styled_status(item.status),
            item.work_type.as_str(),
            item.priority,
            format!("{}/{}", item.attempts, item.max_attempts),
            item.title
        );
    }
    println!();
    println!("{} item(s)", items.len());
}

pub async fn cmd_status(project_dir: &Path) -> Result<()> {
    let anvil = Anvil::open(AnvilConfig::new(project_dir.to_path_buf())?)?;
    let counts = anvil.queue.counts().await?;

    println!();
    println!("Anvil Status: {}", anvil.config.project_name());
    println!("============");
    println!();
    println!("  pending    {}", counts.pending);
    println!("  active     {}", counts.active);
    println!("  completed  {}", console::style(counts.completed).green());
    println!("  failed     {}", console::style(counts.failed).red());
    println!();
    println!("Profile: {}", anvil.resolved.profile.name);
    println!();
    Ok(())
}
