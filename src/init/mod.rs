//! `anvil init`: create the `.anvil/` state directory.
//!
//! ```text
//! .anvil/
//! ├── anvil.toml       # Configuration
//! ├── anvil.db         # Queue and evidence (SQLite)
//! ├── reports/         # Failure reports
//! └── logs/            # Daily JSON logs from `run` and `serve`
//! ```
//!
//! `.anvil/` is added to `.gitignore` so state never shows up in a diff.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::{CONFIG_FILE, STATE_DIR, default_config_toml};
use crate::evidence::EvidenceDb;
use crate::queue::QueueDb;

const GITIGNORE_ENTRY: &str = ".anvil/";

#[derive(Debug)]
pub struct InitResult {
    pub anvil_dir: PathBuf,
    /// Whether `.anvil/` was newly created
    pub created: bool,
    /// Whether anvil.toml was (re)written
    pub config_written: bool,
    /// Whether `.anvil/` was appended to .gitignore
    pub gitignore_updated: bool,
}

/// Create or complete the `.anvil/` structure. An existing anvil.toml is kept
/// unless `force` is set.
pub fn init_project(project_dir: &Path, force: bool) -> Result<InitResult> {
    let anvil_dir = project_dir.join(STATE_DIR);
    let created = !anvil_dir.exists();

    for dir in [anvil_dir.clone(), anvil_dir.join("reports"), anvil_dir.join("logs")] {
        std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }

    let config_path = anvil_dir.join(CONFIG_FILE);
    let config_written = force || !config_path.exists();
    if config_written {
        let name = project_dir
            .canonicalize()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .unwrap_or_else(|| "project".to_string());
        std::fs::write(&config_path, default_config_toml(&name))
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
    }

    // Opening both stores runs their migrations.
    let db_path = anvil_dir.join("anvil.db");
    QueueDb::new(&db_path).with_context(|| format!("Failed to create queue at {}", db_path.display()))?;
    EvidenceDb::new(&db_path)?;

    let gitignore_updated = ensure_gitignored(project_dir)?;

    Ok(InitResult {
        anvil_dir,
        created,
        config_written,
        gitignore_updated,
    })
}

/// Append `.anvil/` to the project's .gitignore if no line already covers it.
fn ensure_gitignored(project_dir: &Path) -> Result<bool> {
    let path = project_dir.join(".gitignore");
    let existing = if path.exists() {
        std::fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?
    } else {
        String::new()
    };

    let covered = existing
        .lines()
        .map(str::trim)
        .any(|l| matches!(l, ".anvil" | ".anvil/" | "/.anvil" | "/.anvil/"));
    if covered {
        return Ok(false);
    }

    let mut content = existing;
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(GITIGNORE_ENTRY);
    content.push('\n');
    std::fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnvilToml;
    use tempfile::tempdir;

    #[test]
    fn test_init_creates_structure() {
        let dir = tempdir().unwrap();
        let result = init_project(dir.path(), false).unwrap();

        assert!(result.created);
        assert!(result.config_written);
        assert!(result.anvil_dir.join("reports").is_dir());
        assert!(result.anvil_dir.join("logs").is_dir());
        assert!(result.anvil_dir.join("anvil.db").is_file());
        AnvilToml::load(&result.anvil_dir.join(CONFIG_FILE)).unwrap();
    }

    #[test]
    fn test_init_is_idempotent_and_keeps_config() {
        let dir = tempdir().unwrap();
        init_project(dir.path(), false).unwrap();
        let config_path = dir.path().join(".anvil/anvil.toml");
        std::fs::write(&config_path, "[tests]\ncommand = \"make test\"\n").unwrap();

        let again = init_project(dir.path(), false).unwrap();
        assert!(!again.created);
        assert!(!again.config_written);
        assert!(!again.gitignore_updated);
        assert!(std::fs::read_to_string(&config_path).unwrap().contains("make test"));

        let forced = init_project(dir.path(), true).unwrap();
        assert!(forced.config_written);
        assert!(!std::fs::read_to_string(&config_path).unwrap().contains("make test"));
    }

    #[test]
    fn test_gitignore_appended_once() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "target").unwrap();

        assert!(init_project(dir.path(), false).unwrap().gitignore_updated);
        let content = std::fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert_eq!(content, "target\n.anvil/\n");

        std::fs::write(dir.path().join(".gitignore"), "/.anvil\n").unwrap();
        assert!(!ensure_gitignored(dir.path()).unwrap());
    }
}
