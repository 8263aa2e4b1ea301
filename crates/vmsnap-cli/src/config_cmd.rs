use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use vmsnap_config::Config;

const PROJECT_CONFIG: &str = ".vmsnap/config.toml";

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,

    /// Print the config file locations
    Path,

    /// Write a default project config to .vmsnap/config.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub fn run(config: &Config, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let text = toml::to_string_pretty(config).context("Failed to serialize config")?;
            print!("{}", text);
            Ok(())
        }
        ConfigCommands::Path => {
            match Config::global_config_path() {
                Some(p) => println!("Global:  {}", p.display()),
                None => println!("Global:  (no home directory)"),
            }
            println!("Project: {}", PROJECT_CONFIG);
            Ok(())
        }
        ConfigCommands::Init { force } => init(Path::new(PROJECT_CONFIG), force),
    }
}

fn init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, Config::default_toml()?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Created {}", path.display());
    Ok(())
}
