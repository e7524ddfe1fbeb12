use {anyhow::Result, clap::Subcommand};

use roost_config::{RoostConfig, Severity, ValidationResult};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration and where it came from.
    Show,
    /// Validate the configuration file and report errors/warnings.
    Validate {
        /// Show informational diagnostics in addition to errors and warnings.
        #[arg(long)]
        verbose: bool,
    },
}

pub fn handle_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => show(),
        ConfigAction::Validate { verbose } => check(verbose),
    }
}

/// ANSI color codes.
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

fn show() -> Result<()> {
    let path = roost_config::find_or_default_config_path();
    if path.exists() {
        eprintln!("# {}", path.display());
    } else {
        eprintln!("# no config file, defaults (would be {})", path.display());
    }
    let config = roost_config::discover_and_load();
    eprintln!(
        "# registry: {}\n",
        roost_config::registry_path(&config).display()
    );
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

fn check(verbose: bool) -> Result<()> {
    let path = roost_config::find_or_default_config_path();
    let result = if path.exists() {
        roost_config::validate_file(&path)
    } else {
        roost_config::validate(&RoostConfig::default())
    };

    if let Some(ref path) = result.config_path {
        eprintln!("Checking {}\n", path.display());
    } else {
        eprintln!("No config file found; checking defaults.\n");
    }

    let shown = print_diagnostics(&result, verbose);
    let errors = result.count(Severity::Error);
    let warnings = result.count(Severity::Warning);

    if shown > 0 {
        eprintln!();
    }
    if errors == 0 && warnings == 0 {
        eprintln!("No issues found.");
    } else {
        eprintln!("{errors} error(s), {warnings} warning(s)");
    }

    if errors > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn print_diagnostics(result: &ValidationResult, verbose: bool) -> usize {
    let mut shown = 0;
    for d in &result.diagnostics {
        if d.severity == Severity::Info && !verbose {
            continue;
        }

        let (color, label) = match d.severity {
            Severity::Error => (RED, "error"),
            Severity::Warning => (YELLOW, "warning"),
            Severity::Info => (CYAN, "info"),
        };

        if d.path.is_empty() {
            eprintln!("  {BOLD}{color}{label}{RESET} {}", d.message);
        } else {
            eprintln!("  {BOLD}{color}{label}{RESET} {}: {}", d.path, d.message);
        }
        shown += 1;
    }
    shown
}
