/// ATTACK SCENARIO: Record and Replay
///
/// Records every frame on the bus for a few seconds, then loops the capture
/// with fresh timestamps: valid ids and payloads at an elevated rate.
///
/// PURPOSE: Research - exercises the IDS against replayed genuine traffic
use can_ids_testbed::attack_sim::{AttackKind, run_attack};
use can_ids_testbed::cli::{CommonArgs, banner, fatal, security_logger};
use can_ids_testbed::network::attach_remote;
use can_ids_testbed::{StopSignal, VirtualCanBus};
use clap::Parser;
use colored::*;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "attack_replay", version, about = "Record bus traffic, then replay it in a loop")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Record phase length in seconds, overrides attacks.replay.record_secs
    #[arg(long)]
    record_secs: Option<f64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut config = match cli.common.load() {
        Ok(c) => c,
        Err(e) => return fatal(&e),
    };
    if let Some(secs) = cli.record_secs {
        config.attacks.replay.record_secs = secs;
    }

    banner("ATTACK: Record & Replay", Color::Red);
    println!("{}", "⚠️  WARNING: This is a security research tool".yellow());
    println!("{}", "⚠️  Only use on authorized test systems".yellow());
    println!();
    println!(
        "{} Recording {}s of traffic, then replaying with {}ms frame gap",
        "→".red(),
        config.attacks.replay.record_secs,
        config.attacks.replay.frame_gap_ms
    );

    let stop = StopSignal::new();
    stop.stop_on_ctrl_c();

    let kind = AttackKind::Replay;
    let bus = VirtualCanBus::named(config.bus.interface.clone(), config.bus.capacity);
    let link = match attach_remote(&bus, &config.bus.server_addr, kind.sender_name(), stop.clone()).await {
        Ok(link) => link,
        Err(e) => return fatal(&e),
    };
    println!("{} Connected as {}", "✓".red().bold(), kind.sender_name());

    let log = security_logger(kind.sender_name(), &config);
    let result = run_attack(kind, &bus, &config.attacks, stop.clone(), log).await;
    stop.stop();
    link.join().await;

    match result {
        Ok(report) => {
            println!();
            println!(
                "{} {} stopped: {} frames in {:.1}s ({:.0} frames/sec)",
                "🛑".red(),
                kind,
                report.frames_sent,
                report.duration_ms() as f64 / 1000.0,
                report.frames_per_sec()
            );
            println!(
                "   captured {} frames, {} replay loops",
                report.frames_captured, report.cycles
            );
            ExitCode::SUCCESS
        }
        Err(e) => fatal(&e),
    }
}
