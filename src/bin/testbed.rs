/// Orchestrated scenario: the vehicle simulation, the live IDS and one
/// attack, all on one in-process bus, run as baseline → attack → cooldown.
use can_ids_testbed::attack_sim::{AttackKind, run_attack};
use can_ids_testbed::cli::{CommonArgs, banner, fatal, security_logger};
use can_ids_testbed::config::web_ui_mode;
use can_ids_testbed::live_ids::{AlertOutput, LiveIds};
use can_ids_testbed::log_parser::record_traffic;
use can_ids_testbed::model_artifacts::ModelSet;
use can_ids_testbed::simulation::{Simulation, StatusOutput};
use can_ids_testbed::{DetectionResult, StopSignal, VehicleModel, VirtualCanBus};
use clap::Parser;
use colored::*;
use std::fs::OpenOptions;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

#[derive(Parser, Debug)]
#[command(name = "testbed", version, about = "Run a full baseline/attack/cooldown scenario in one process")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Attack to inject: flooding, replay or context_spoof
    #[arg(short, long, default_value = "context_spoof")]
    attack: AttackKind,

    /// Seconds of clean traffic before the attack
    #[arg(long, default_value_t = 20.0)]
    baseline_secs: f64,

    /// Seconds the attack runs
    #[arg(long, default_value_t = 30.0)]
    attack_secs: f64,

    /// Seconds of clean traffic after the attack
    #[arg(long, default_value_t = 10.0)]
    cooldown_secs: f64,

    /// Model artifact directory, overrides detector.artifact_dir
    #[arg(long, value_name = "DIR")]
    models: Option<PathBuf>,

    /// Append raw traffic to FILE in candump log format
    #[arg(long, value_name = "FILE")]
    traffic_log: Option<PathBuf>,

    /// Seed the vehicle model
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Baseline,
    Attack,
    Cooldown,
}

impl Phase {
    const ALL: [Phase; 3] = [Phase::Baseline, Phase::Attack, Phase::Cooldown];

    fn name(&self) -> &'static str {
        match self {
            Phase::Baseline => "baseline",
            Phase::Attack => "attack",
            Phase::Cooldown => "cooldown",
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct PhaseTally {
    windows: u64,
    anomalous: u64,
    alerts: u64,
}

impl PhaseTally {
    fn add(&mut self, result: &DetectionResult) {
        self.windows += 1;
        if result.fused {
            self.anomalous += 1;
        }
        if result.alert && result.visible {
            self.alerts += 1;
        }
    }
}

/// Sleep for `secs`, returning early (false) if the run is stopped
async fn hold(stop: &StopSignal, secs: f64) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs_f64(secs.max(0.0));
    while tokio::time::Instant::now() < deadline {
        if stop.is_stopped() {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    !stop.is_stopped()
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
    if cli.seed.is_some() {
        config.vehicle.seed = cli.seed;
    }

    banner("CAN IDS TESTBED: ORCHESTRATED SCENARIO", Color::Cyan);
    println!(
        "{} {:.0}s baseline, {:.0}s {}, {:.0}s cooldown",
        "→".green(),
        cli.baseline_secs,
        cli.attack_secs,
        cli.attack,
        cli.cooldown_secs
    );

    let models = match ModelSet::load(&config.detector.artifact_dir) {
        Ok(m) => m,
        Err(e) => return fatal(&e),
    };
    println!("{} Loaded models from {}", "✓".green().bold(), config.detector.artifact_dir.display());

    let stop = StopSignal::new();
    stop.stop_on_ctrl_c();
    let bus = VirtualCanBus::named(config.bus.interface.clone(), config.bus.capacity);

    let recorder = match &cli.traffic_log {
        Some(path) => {
            let file = match OpenOptions::new().create(true).append(true).open(path) {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("{} cannot open {}: {}", "✗".red().bold(), path.display(), e);
                    return ExitCode::FAILURE;
                }
            };
            let subscription = match bus.subscribe() {
                Ok(s) => s,
                Err(e) => return fatal(&e),
            };
            let interface = config.bus.interface.clone();
            let stop = stop.clone();
            println!("{} Recording raw traffic to {}", "✓".green().bold(), path.display());
            Some(tokio::spawn(async move {
                record_traffic(subscription, BufWriter::new(file), &interface, stop).await
            }))
        }
        None => None,
    };

    // The whole scenario shares one security log
    let log = security_logger("testbed", &config);
    if let Some(log) = &log {
        log.log_startup("orchestrator");
        log.log_models_loaded(&models.fingerprint, &models.format_version);
    }

    let policy = config.detector.effective_policy(web_ui_mode());
    let detector = models.into_detector(&config.detector, policy);
    let (results_tx, mut results_rx) = mpsc::unbounded_channel();
    let ids = LiveIds::new(detector)
        .with_output(AlertOutput::Plain)
        .with_security_log(log.clone())
        .with_results(results_tx);
    let ids_task = {
        let bus = bus.clone();
        let window = config.window.length();
        let stop = stop.clone();
        tokio::spawn(async move { ids.run(&bus, window, stop).await })
    };

    let (phase_tx, phase_rx) = watch::channel(Phase::Baseline);
    let tally_task = tokio::spawn(async move {
        let mut tallies = [PhaseTally::default(); 3];
        while let Some(result) = results_rx.recv().await {
            let phase = *phase_rx.borrow();
            tallies[phase as usize].add(&result);
        }
        tallies
    });

    let model = VehicleModel::new(config.vehicle.clone());
    let attacks = config.attacks.clone();
    let handles = match Simulation::new(bus.clone(), config, stop.clone())
        .with_output(StatusOutput::Silent)
        .with_security_log(log.clone())
        .start(model)
    {
        Ok(h) => h,
        Err(e) => return fatal(&e),
    };

    println!("{} Phase: {}", "▶".green().bold(), Phase::Baseline.name().bright_white());
    if hold(&stop, cli.baseline_secs).await {
        phase_tx.send_replace(Phase::Attack);
        println!("{} Phase: {} ({})", "▶".red().bold(), Phase::Attack.name().bright_white(), cli.attack);

        let attack_stop = StopSignal::new();
        let attack_task = {
            let bus = bus.clone();
            let attack_stop = attack_stop.clone();
            let log = log.clone();
            let kind = cli.attack;
            tokio::spawn(async move { run_attack(kind, &bus, &attacks, attack_stop, log).await })
        };
        hold(&stop, cli.attack_secs).await;
        attack_stop.stop();
        match attack_task.await {
            Ok(Ok(report)) => println!(
                "{} {} injected {} frames ({:.0} frames/sec)",
                "🛑".red(),
                report.attack,
                report.frames_sent,
                report.frames_per_sec()
            ),
            Ok(Err(e)) => eprintln!("{} {}", "✗ Attack failed:".red().bold(), e),
            Err(e) => tracing::warn!(error = %e, "attack task failed"),
        }

        if !stop.is_stopped() {
            phase_tx.send_replace(Phase::Cooldown);
            println!("{} Phase: {}", "▶".green().bold(), Phase::Cooldown.name().bright_white());
            hold(&stop, cli.cooldown_secs).await;
        }
    }

    stop.stop();
    let last = handles.join().await;
    let stats = ids_task.await;
    bus.shutdown();
    if let Some(recorder) = recorder {
        match recorder.await {
            Ok(Ok(lines)) => println!("{} Wrote {} raw traffic lines", "✓".green(), lines),
            Ok(Err(e)) => eprintln!("{} traffic log write failed: {}", "✗".red().bold(), e),
            Err(e) => tracing::warn!(error = %e, "traffic recorder task failed"),
        }
    }
    let tallies = tally_task.await.unwrap_or_default();

    println!();
    banner("SCENARIO SUMMARY", Color::Cyan);
    println!("   {:<10} {:>8} {:>10} {:>8}", "phase", "windows", "anomalous", "alerts");
    for phase in Phase::ALL {
        let t = tallies[phase as usize];
        let alerts = if phase == Phase::Attack {
            t.alerts.to_string().red().bold()
        } else {
            t.alerts.to_string().normal()
        };
        println!("   {:<10} {:>8} {:>10} {:>8}", phase.name(), t.windows, t.anomalous, alerts);
    }

    match (last, stats) {
        (Ok(snapshot), Ok(Ok(stats))) => {
            println!();
            println!(
                "{} Vehicle ended in {} at {} rpm; {} alerts over {} windows",
                "✓".green().bold(),
                snapshot.mode,
                snapshot.rpm,
                stats.alerts,
                stats.windows
            );
            ExitCode::SUCCESS
        }
        (Err(e), _) | (_, Ok(Err(e))) => fatal(&e),
        (_, Err(e)) => {
            eprintln!("{} detector task failed: {}", "✗".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
