//! Config Command
//!
//! Manage copilot-router configuration.
//!
//! Usage:
//!   copilot-router config show [-f toml|json|yaml]
//!   copilot-router config path
//!   copilot-router config init [-g] [--force]

use std::path::Path;

use crate::cli::ui::Output;
use crate::cli::util::load_config;
use crate::config::ConfigLoader;
use crate::types::Result;

/// Show the effective configuration (merged from all sources)
pub fn show(config_path: Option<&Path>, format: &str) -> Result<()> {
    let config = load_config(config_path)?;
    println!("{}", ConfigLoader::render(&config, format)?);
    Ok(())
}

/// Show configuration paths
pub fn path() -> Result<()> {
    let output = Output::new();
    output.header("Configuration files");

    match ConfigLoader::global_config_path() {
        Some(global) => output.field("Global", describe(&global)),
        None => output.field("Global", "(no config directory)"),
    }
    output.field("Project", describe(&ConfigLoader::project_config_path()));
    output.field("Environment", "COPILOT_ROUTER_<SECTION>__<KEY>");
    Ok(())
}

/// Write a starter configuration file
pub fn init(global: bool, force: bool) -> Result<()> {
    let path = ConfigLoader::init(global, force)?;
    Output::new().success(&format!(
        "Initialized {} configuration: {}",
        if global { "global" } else { "project" },
        path.display()
    ));
    Ok(())
}

fn describe(path: &Path) -> String {
    if path.exists() {
        path.display().to_string()
    } else {
        format!("{} (not found)", path.display())
    }
}
