use can_ids_testbed::cli::{CommonArgs, banner, fatal, security_logger};
use can_ids_testbed::config::web_ui_mode;
use can_ids_testbed::network::attach_remote;
use can_ids_testbed::simulation::{Simulation, StatusOutput};
use can_ids_testbed::{StopSignal, VehicleModel, VirtualCanBus};
use clap::Parser;
use colored::*;
use std::process::ExitCode;

/// Vehicle model, periodic ECUs and the bus feedback loop
#[derive(Parser, Debug)]
#[command(name = "vehicle_sim", version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Seed the vehicle model for a reproducible drive
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut config = match cli.common.load() {
        Ok(c) => c,
        Err(e) => return fatal(&e),
    };
    if cli.seed.is_some() {
        config.vehicle.seed = cli.seed;
    }

    let web_ui = web_ui_mode();
    if !web_ui {
        banner("VEHICLE SIMULATOR", Color::Cyan);
    }

    let stop = StopSignal::new();
    stop.stop_on_ctrl_c();

    let bus = VirtualCanBus::named(config.bus.interface.clone(), config.bus.capacity);
    let link = match attach_remote(&bus, &config.bus.server_addr, "vehicle_sim", stop.clone()).await {
        Ok(link) => link,
        Err(e) => return fatal(&e),
    };
    println!(
        "{} Connected to bus at {}",
        "✓".green().bold(),
        config.bus.server_addr.bright_white()
    );

    let log = security_logger("vehicle_sim", &config);
    let output = StatusOutput::for_mode(web_ui, &config.observed);
    let model = VehicleModel::new(config.vehicle.clone());
    let handles = match Simulation::new(bus.clone(), config, stop.clone())
        .with_output(output)
        .with_security_log(log)
        .start(model)
    {
        Ok(h) => h,
        Err(e) => return fatal(&e),
    };
    if !web_ui {
        println!("{} Simulation running. Press Ctrl+C to stop.", "✓".green().bold());
    }

    let result = handles.join().await;
    stop.stop();
    link.join().await;
    bus.shutdown();

    match result {
        Ok(last) => {
            println!("{} Stopped in {} at {} rpm", "🛑".red(), last.mode, last.rpm);
            ExitCode::SUCCESS
        }
        Err(e) => fatal(&e),
    }
}
