/// Passive drivetrain check: flags observed gear changes at engine speeds
/// the real drivetrain could not produce.
use can_ids_testbed::cli::{CommonArgs, banner, fatal};
use can_ids_testbed::network::attach_remote;
use can_ids_testbed::vehicle::{ShiftMonitor, ShiftVerdict};
use can_ids_testbed::{Received, StopSignal, VirtualCanBus};
use clap::Parser;
use colored::*;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "physics_monitor", version)]
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

    banner("PHYSICS MONITOR", Color::Blue);
    let stop = StopSignal::new();
    stop.stop_on_ctrl_c();

    let bus = VirtualCanBus::named(config.bus.interface.clone(), config.bus.capacity);
    let mut subscription = match bus.subscribe() {
        Ok(s) => s,
        Err(e) => return fatal(&e),
    };
    let link = match attach_remote(&bus, &config.bus.server_addr, "physics_monitor", stop.clone()).await {
        Ok(link) => link,
        Err(e) => return fatal(&e),
    };
    println!(
        "{} Watching gear changes on {}",
        "✓".green().bold(),
        config.bus.server_addr.bright_white()
    );

    let mut monitor = ShiftMonitor::new();
    while !stop.is_stopped() {
        match subscription.recv_timeout(Duration::from_millis(100)).await {
            Received::Frame(frame) => {
                let Some(event) = monitor.observe(&frame) else {
                    continue;
                };
                let shift = format!("gear {} → {} at {} rpm", event.from, event.to, event.rpm);
                match event.verdict {
                    ShiftVerdict::Plausible => println!("{} {}", "✓".green(), shift),
                    ShiftVerdict::Suspicious => {
                        tracing::warn!(from = event.from, to = event.to, rpm = event.rpm, "implausible shift");
                        println!("{} {} {}", "⚠️ ".yellow(), shift.yellow().bold(), "(implausible)".red());
                    }
                }
            }
            Received::Timeout => {}
            Received::Closed => break,
        }
    }
    stop.stop();
    link.join().await;

    println!(
        "{} {} plausible, {} suspicious shifts",
        "🛑".red(),
        monitor.plausible,
        monitor.suspicious
    );
    ExitCode::SUCCESS
}
