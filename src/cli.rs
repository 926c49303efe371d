//! Command-line pieces shared by the testbed binaries

use crate::config::{TestbedConfig, init_tracing};
use crate::errors::SetupError;
use crate::security_log::{SecurityLogger, open_optional};
use clap::Args;
use colored::*;
use std::path::PathBuf;
use std::process::ExitCode;

/// Options every binary accepts
#[derive(Args, Debug, Clone, Default)]
pub struct CommonArgs {
    /// JSON configuration file (defaults are used when absent)
    #[arg(short, long, value_name = "FILE", default_value = "testbed.json")]
    pub config: PathBuf,

    /// Bus server address, overrides bus.server_addr
    #[arg(long, value_name = "ADDR")]
    pub bus: Option<String>,

    /// Write the hash-chained security log into DIR
    #[arg(long, value_name = "DIR")]
    pub security_log: Option<PathBuf>,

    /// Tracing filter, overrides log.level (RUST_LOG wins over both)
    #[arg(long, value_name = "FILTER")]
    pub log_level: Option<String>,
}

impl CommonArgs {
    /// Load the configuration, apply overrides and install tracing
    pub fn load(&self) -> Result<TestbedConfig, SetupError> {
        let mut config = TestbedConfig::load_or_default(Some(&self.config))?;
        if let Some(addr) = &self.bus {
            config.bus.server_addr = addr.clone();
        }
        if let Some(dir) = &self.security_log {
            config.log.security_log_dir = Some(dir.clone());
        }
        if let Some(level) = &self.log_level {
            config.log.level = level.clone();
        }
        init_tracing(&config.log.level);
        Ok(config)
    }
}

/// Security logger for `component`, if configured
pub fn security_logger(component: &str, config: &TestbedConfig) -> Option<SecurityLogger> {
    open_optional(component, config.log.security_log_dir.as_deref())
}

/// Boxed title, in the style of the bus tools
pub fn banner(title: &str, color: Color) {
    let rule = "═══════════════════════════════════════════════════════════════";
    println!("{}", rule.color(color).bold());
    println!("{}", format!("   {:<60}", title).color(color).bold());
    println!("{}", rule.color(color).bold());
    println!();
}

/// Print a fatal setup error and return the failure exit code
pub fn fatal(err: &SetupError) -> ExitCode {
    eprintln!("{} {}", "✗ Setup error:".red().bold(), err);
    ExitCode::FAILURE
}
