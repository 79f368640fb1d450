use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use grimoire::Spellbook;

#[derive(Parser)]
#[command(name = "grimoire", version, about = "Identify file types with a magic rule database")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Match a file against the rule database and print its description
    Identify {
        /// Rule database: a single rule file, or a directory of rule files
        /// read in alphabetic order
        #[arg(short, long)]
        rules: Option<PathBuf>,
        /// File to identify
        target: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Identify { rules, target } => identify(rules, target),
    }
}

fn identify(rules: Option<PathBuf>, target: PathBuf) -> Result<()> {
    let rules = match rules {
        Some(path) => path,
        None => default_rules_location()
            .context("no --rules given and no user data directory to fall back to")?,
    };

    let mut book = Spellbook::new();
    if rules.is_dir() {
        book.load_directory(&rules)?;
    } else {
        book.load_file(&rules)?;
    }

    let bytes = fs::read(&target)
        .with_context(|| format!("failed to read target {}", target.display()))?;

    // "no match" is still a successful run; the description is just empty
    println!("{}: {}", target.display(), book.describe(&bytes));
    Ok(())
}

fn default_rules_location() -> Option<PathBuf> {
    dirs_next::data_dir().map(|dir| dir.join("grimoire").join("rules"))
}
