//! Project initialization: `anvil init`.

use anyhow::Result;
use std::path::Path;

pub fn cmd_init(project_dir: &Path, force: bool) -> Result<()> {
    use anvil::init::init_project;

    let result = init_project(project_dir, force)?;

    if result.created {
        println!("Initialized anvil project at {}", result.anvil_dir.display());
        println!();
        println!("Created directory structure:");
        println!("  .anvil/");
        println!("  ├── anvil.toml    # Configuration (set [tests].command first)");
        println!("  ├── anvil.db      # Work queue and evidence");
        println!("  ├── reports/      # Failure reports");
        println!("  └── logs/         # Worker logs");
        println!();
        println!("Next steps:");
        println!("  1. Set [tests].command in .anvil/anvil.toml");
        println!("  2. Add work with `anvil queue push \"<title>\"` or `anvil queue import <file>`");
        println!("  3. Run `anvil run` to start the worker loop");
    } else {
        println!("Anvil project already initialized at {}", result.anvil_dir.display());
        if result.config_written {
            println!("Rewrote anvil.toml with defaults.");
        } else {
            println!("Directory structure verified.");
        }
    }
    if result.gitignore_updated {
        println!("Added .anvil/ to .gitignore");
    }

    Ok(())
}
