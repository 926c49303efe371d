/// Check the hash chain of one or more security log files
use can_ids_testbed::security_log::verify_log_file;
use clap::Parser;
use colored::*;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "verify_security_log", version)]
struct Cli {
    /// Security log files (JSONL)
    #[arg(required = true)]
    logs: Vec<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut all_ok = true;

    for path in &cli.logs {
        match verify_log_file(path) {
            Ok(result) if result.verified => {
                println!(
                    "{} {} ({} entries, chain intact)",
                    "✓".green().bold(),
                    path.display(),
                    result.total_entries
                );
            }
            Ok(result) => {
                all_ok = false;
                println!(
                    "{} {} ({} entries, {} issues)",
                    "✗".red().bold(),
                    path.display(),
                    result.total_entries,
                    result.issues.len()
                );
                for issue in &result.issues {
                    println!("   {} {}", "→".red(), issue);
                }
            }
            Err(e) => {
                all_ok = false;
                println!("{} {}: {}", "✗".red().bold(), path.display(), e);
            }
        }
    }

    if all_ok { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}
