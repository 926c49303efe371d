use can_ids_testbed::StopSignal;
use can_ids_testbed::cli::{CommonArgs, banner, fatal};
use can_ids_testbed::network::BusServer;
use clap::Parser;
use colored::*;
use std::process::ExitCode;

/// TCP broadcast bus shared by the simulator, the IDS and the attack tools
#[derive(Parser, Debug)]
#[command(name = "bus_server", version)]
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

    banner("VIRTUAL CAN BUS SERVER", Color::Magenta);
    println!(
        "{} Starting bus server on {}...",
        "→".green(),
        config.bus.server_addr.bright_white()
    );

    let server = match BusServer::bind(&config.bus.server_addr, config.bus.capacity).await {
        Ok(s) => s,
        Err(e) => return fatal(&e),
    };
    println!(
        "{} Bus server ready! Waiting for connections...",
        "✓".green().bold()
    );

    let stop = StopSignal::new();
    stop.stop_on_ctrl_c();
    server.run(stop).await;

    println!("{} Bus server stopped", "✓".green());
    ExitCode::SUCCESS
}
