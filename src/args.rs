// Commandline argument parsers using clap for SignalHUD

use clap::Parser;
use std::path::PathBuf;

/// Where the configuration lives unless `--config` says otherwise.
pub const DEFAULT_CONFIG: &str = "config/signal-hud.ron";

#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
/// Track nearby wireless devices, locate this host against surveyed anchors
/// and stream the result to viewers
pub struct HudArgs {
    /// Path to the RON configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,

    /// Draw the HUD in this terminal instead of serving viewers
    #[arg(short, long)]
    pub local: bool,

    /// Use simulated radios instead of the real scanners
    #[arg(short, long)]
    pub simulate: bool,

    /// Override `stream.bind_address` from the configuration
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Override the configured log level (error, warn, info, debug, trace)
    #[arg(long = "log-level")]
    pub log_level: Option<String>,
}

#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
/// Connect to a running SignalHUD and draw its feed in the terminal
pub struct MonitorArgs {
    /// Address of the SignalHUD viewer server
    #[arg(default_value = "127.0.0.1:5000")]
    pub address: String,

    /// Configuration to take reference points from, for the map
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = HudArgs::parse_from(["signal-hud"]);
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG));
        assert!(!args.local && !args.simulate);
        assert!(args.bind.is_none());
    }

    #[test]
    fn overrides() {
        let args = HudArgs::parse_from([
            "signal-hud",
            "--config",
            "/etc/hud.ron",
            "--local",
            "--simulate",
            "--bind",
            "127.0.0.1:6000",
            "--log-level",
            "debug",
        ]);
        assert_eq!(args.config, PathBuf::from("/etc/hud.ron"));
        assert!(args.local && args.simulate);
        assert_eq!(args.bind.as_deref(), Some("127.0.0.1:6000"));
        assert_eq!(args.log_level.as_deref(), Some("debug"));

        let monitor = MonitorArgs::parse_from(["monitor", "10.0.0.2:5000"]);
        assert_eq!(monitor.address, "10.0.0.2:5000");
    }
}
