//! Configuration view and validation commands: `anvil config`.

use anyhow::Result;
use std::path::Path;

use anvil::config::AnvilConfig;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config = AnvilConfig::new(project_dir.to_path_buf())?;
    let config_path = config.config_path();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Anvil Configuration");
            println!("===================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No anvil.toml found at {}; showing defaults.", config_path.display());
            }
            println!();
            println!("{}", toml::to_string_pretty(&config.toml)?);

            println!("Effective values (with env/CLI overrides):");
            println!("  agent_cmd = \"{}\"", config.agent_cmd());
            println!("  profile = \"{}\"", config.profile_name());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No anvil.toml found. Using defaults.");
            }

            // Hard errors first: these stop `anvil run` from starting.
            let resolved = config.resolve();
            let warnings = config.validate();

            if warnings.is_empty() {
                println!("No warnings.");
            } else {
                println!("Configuration warnings:");
                for warning in &warnings {
                    println!("  - {}", warning);
                }
            }
            println!();

            match resolved {
                Ok(resolved) => {
                    println!(
                        "Configuration is valid ({} truth rule(s), {} pre-flight check(s), profile '{}').",
                        resolved.truth_rules.len(),
                        resolved.preflight_checks.len(),
                        resolved.profile.name
                    );
                    println!();
                }
                Err(e) => {
                    anyhow::bail!("Configuration is invalid: {:#}", e);
                }
            }
        }
    }

    Ok(())
}
