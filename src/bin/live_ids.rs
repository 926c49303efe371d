use can_ids_testbed::cli::{CommonArgs, banner, fatal, security_logger};
use can_ids_testbed::config::web_ui_mode;
use can_ids_testbed::live_ids::{AlertOutput, LiveIds};
use can_ids_testbed::model_artifacts::ModelSet;
use can_ids_testbed::network::attach_remote;
use can_ids_testbed::{StopSignal, VirtualCanBus};
use clap::Parser;
use colored::*;
use std::path::PathBuf;
use std::process::ExitCode;

/// Streaming ensemble IDS over the shared bus
#[derive(Parser, Debug)]
#[command(name = "live_ids", version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Model artifact directory, overrides detector.artifact_dir
    #[arg(long, value_name = "DIR")]
    models: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut config = match cli.common.load() {
        Ok(c) => c,
        Err(e) => return fatal(&e),
    };
    if let Some(dir) = cli.models {
        config.detector.artifact_dir = dir;
    }

    let web_ui = web_ui_mode();
    banner("RESEARCH IDS: DETECTION & DIAGNOSIS", Color::Green);

    let models = match ModelSet::load(&config.detector.artifact_dir) {
        Ok(m) => m,
        Err(e) => return fatal(&e),
    };
    println!("{} Loaded models (fingerprint {})", "✓".green().bold(), &models.fingerprint[..16]);
    println!("   Autoencoder threshold: {:.5}", models.threshold);

    let log = security_logger("live_ids", &config);
    if let Some(log) = &log {
        log.log_startup("detector");
        log.log_models_loaded(&models.fingerprint, &models.format_version);
    }

    let stop = StopSignal::new();
    stop.stop_on_ctrl_c();

    let bus = VirtualCanBus::named(config.bus.interface.clone(), config.bus.capacity);
    let link = match attach_remote(&bus, &config.bus.server_addr, "live_ids", stop.clone()).await {
        Ok(link) => link,
        Err(e) => return fatal(&e),
    };
    println!(
        "{} Connected to {}. Monitoring...",
        "✓".green().bold(),
        config.bus.server_addr.bright_white()
    );

    let policy = config.detector.effective_policy(web_ui);
    let detector = models.into_detector(&config.detector, policy);
    let ids = LiveIds::new(detector)
        .with_output(AlertOutput::for_mode(web_ui))
        .with_security_log(log);

    let result = ids.run(&bus, config.window.length(), stop.clone()).await;
    stop.stop();
    link.join().await;

    match result {
        Ok(stats) => {
            println!(
                "{} IDS stopped: {} windows, {} alerts ({} suppressed)",
                "🛑".red(),
                stats.windows,
                stats.alerts,
                stats.suppressed_alerts
            );
            ExitCode::SUCCESS
        }
        Err(e) => fatal(&e),
    }
}
