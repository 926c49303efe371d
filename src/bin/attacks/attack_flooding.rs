/// ATTACK SCENARIO: Bus Flooding (Denial of Service)
///
/// One sender writes frames as fast as the bus accepts them, with no pacing,
/// so every detection window carries far more than the baseline volume.
///
/// PURPOSE: Research - exercises the IDS against volume-based denial of service
use can_ids_testbed::attack_sim::{AttackKind, run_attack};
use can_ids_testbed::cli::{CommonArgs, banner, fatal, security_logger};
use can_ids_testbed::network::attach_remote;
use can_ids_testbed::{StopSignal, VirtualCanBus};
use clap::Parser;
use colored::*;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "attack_flooding", version, about = "Flood the bus at maximum rate")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match cli.common.load() {
        Ok(c) => c,
        Err(e) => return fatal(&e),
    };

    banner("ATTACK: Bus Flooding (DoS)", Color::Red);
    println!("{}", "⚠️  WARNING: This is a security research tool".yellow());
    println!("{}", "⚠️  Only use on authorized test systems".yellow());
    println!();
    println!(
        "{} Flooding id {:03X} with {}-byte frames, no pacing",
        "→".red(),
        config.attacks.flood.can_id,
        config.attacks.flood.payload.len()
    );

    let stop = StopSignal::new();
    stop.stop_on_ctrl_c();

    let kind = AttackKind::Flooding;
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
            ExitCode::SUCCESS
        }
        Err(e) => fatal(&e),
    }
}
