/// ATTACK SCENARIO: Context-Aware Gear Spoof
///
/// Waits until the vehicle cruises in top gear, then forges gear frames
/// faster than the transmission ECU but below the flooding volume.
///
/// PURPOSE: Research - exercises the IDS against a rate-tuned, context-triggered spoof
use can_ids_testbed::attack_sim::{AttackKind, run_attack};
use can_ids_testbed::cli::{CommonArgs, banner, fatal, security_logger};
use can_ids_testbed::network::attach_remote;
use can_ids_testbed::{StopSignal, VirtualCanBus};
use clap::Parser;
use colored::*;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "attack_context_spoof", version, about = "Spoof the gear signal while the vehicle cruises")]
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

    banner("ATTACK: Context-Aware Gear Spoof", Color::Red);
    println!("{}", "⚠️  WARNING: This is a security research tool".yellow());
    println!("{}", "⚠️  Only use on authorized test systems".yellow());
    println!();
    let spoof = &config.attacks.context_spoof;
    println!(
        "{} Trigger: gear {} above {} rpm; inject gear {} every {}ms for {}s, back off {}s",
        "→".red(),
        spoof.trigger_gear,
        spoof.rpm_threshold,
        spoof.forged_gear,
        spoof.inject_period_ms,
        spoof.inject_secs,
        spoof.backoff_secs
    );

    let stop = StopSignal::new();
    stop.stop_on_ctrl_c();

    let kind = AttackKind::ContextSpoof;
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
            println!("   {} injection bursts", report.cycles);
            ExitCode::SUCCESS
        }
        Err(e) => fatal(&e),
    }
}
