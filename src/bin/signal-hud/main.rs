use clap::Parser;
use log::{error, info};
use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use signal_hud::args::HudArgs;
use signal_hud::config::{Config, DisplayMode, SYS_CLASS_NET};
use signal_hud::engine::Engine;
use signal_hud::error::Result;
use signal_hud::{gui, logging};

// The HUD owns the terminal, so logs that would land on it go here instead.
const LOCAL_LOG_FILE: &str = "signal-hud.log";

fn main() -> ExitCode {
    let args = HudArgs::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("signal-hud: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: HudArgs) -> Result<()> {
    let mut config = Config::load(&args.config)?;
    if args.local {
        config.display_mode = DisplayMode::Local;
    }
    if let Some(bind) = args.bind {
        config.stream.bind_address = bind;
        config.validate()?;
    }
    if config.display_mode == DisplayMode::Local
        && matches!(config.logging.destination.as_str(), "" | "stderr" | "stdout")
    {
        config.logging.destination = LOCAL_LOG_FILE.to_owned();
    }
    logging::init(&config.logging, args.log_level.as_deref())?;
    info!("loaded {}", args.config.display());

    if !args.simulate {
        config.check_host(Path::new(SYS_CLASS_NET))?;
    }

    let running = Arc::new(AtomicBool::new(true));
    let handler_running = Arc::clone(&running);
    ctrlc::set_handler(move || handler_running.store(false, Ordering::Relaxed))?;

    let mode = config.display_mode;
    let mut engine = Engine::new(config, Arc::clone(&running)).simulate(args.simulate);
    engine.start()?;

    let res = match mode {
        DisplayMode::Local => gui::engage_hud(
            engine.hud_state(),
            engine.hud_source(),
            engine.command_handler(),
            Duration::from_millis(250),
        )
        .map_err(Into::into),
        DisplayMode::Stream => {
            while running.load(Ordering::Relaxed) {
                sleep(Duration::from_millis(200));
            }
            Ok(())
        }
    };

    info!("shutting down");
    engine.shutdown();
    res
}
