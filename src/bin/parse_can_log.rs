/// Offline raw log parser: candump-style traffic → labelled JSONL records,
/// or windowed feature rows for model training.
use can_ids_testbed::cli::{CommonArgs, fatal};
use can_ids_testbed::log_parser::{SpoofSpan, parse_log, windowed_features, write_jsonl};
use clap::Parser;
use colored::*;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "parse_can_log", version, about = "Label a raw CAN traffic log")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Raw traffic log to read
    input: PathBuf,

    /// Output JSONL file
    #[arg(short, long, default_value = "can_data.jsonl")]
    output: PathBuf,

    /// Write one feature row per window instead of one record per frame
    #[arg(long)]
    features: bool,

    /// Seconds after the first frame during which gear frames count as spoofed
    #[arg(long, value_name = "START,END", conflicts_with = "no_spoof_span")]
    spoof_span: Option<SpoofSpan>,

    /// Do not label any gear frames as spoofed
    #[arg(long)]
    no_spoof_span: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match cli.common.load() {
        Ok(c) => c,
        Err(e) => return fatal(&e),
    };

    let span = if cli.no_spoof_span {
        None
    } else {
        Some(cli.spoof_span.unwrap_or_else(SpoofSpan::default_scenario))
    };

    let file = match File::open(&cli.input) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("{} cannot open {}: {}", "✗".red().bold(), cli.input.display(), e);
            return ExitCode::FAILURE;
        }
    };
    let parsed = match parse_log(BufReader::new(file), span) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{} reading {}: {}", "✗".red().bold(), cli.input.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let written = File::create(&cli.output).and_then(|out| {
        let out = BufWriter::new(out);
        if cli.features {
            let rows = windowed_features(&parsed.records, config.window.length());
            write_jsonl(out, &rows).map(|_| rows.len())
        } else {
            write_jsonl(out, &parsed.records).map(|_| parsed.records.len())
        }
    });
    let rows = match written {
        Ok(n) => n,
        Err(e) => {
            eprintln!("{} writing {}: {}", "✗".red().bold(), cli.output.display(), e);
            return ExitCode::FAILURE;
        }
    };

    println!(
        "{} Parsed {} frames: {} benign, {} attack ({} malformed lines skipped)",
        "✓".green().bold(),
        parsed.records.len(),
        parsed.benign_count().to_string().green(),
        parsed.attack_count().to_string().red(),
        parsed.skipped
    );
    let unit = if cli.features { "feature rows" } else { "records" };
    println!("{} Wrote {} {} to {}", "✓".green().bold(), rows, unit, cli.output.display());
    ExitCode::SUCCESS
}
