use clap::Parser;
use std::io::{BufReader, Write};
use std::net::{Shutdown, TcpStream};
use std::process::ExitCode;
use std::sync::mpsc::{self, TryRecvError};
use std::thread::spawn;
use std::time::Duration;

use signal_hud::args::MonitorArgs;
use signal_hud::config::Config;
use signal_hud::feed::{Command, FeedEvent};
use signal_hud::gui::{engage_hud, HudError, HudState};

fn main() -> ExitCode {
    let args = MonitorArgs::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("monitor: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: MonitorArgs) -> Result<(), Box<dyn std::error::Error>> {
    let references = match &args.config {
        Some(path) => Config::load(path)?.references(),
        None => Vec::new(),
    };

    let stream = TcpStream::connect(&args.address)?;
    let mut commands = stream.try_clone()?;
    let reader_stream = stream.try_clone()?;

    // Frames are read and dropped, only signal updates are drawn.
    let (tx, rx) = mpsc::channel();
    let reader = spawn(move || {
        let mut reader = BufReader::new(reader_stream);
        while let Ok(Some(event)) = FeedEvent::decode(&mut reader) {
            if let FeedEvent::Signals(update) = event {
                if tx.send(update).is_err() {
                    break;
                }
            }
        }
    });

    let res = engage_hud(
        HudState::new(&references),
        Box::new(move || match rx.try_recv() {
            Ok(first) => Ok(Some((*rx.try_iter().last().unwrap_or(first)).clone())),
            Err(TryRecvError::Empty) => Ok(None),
            Err(e) => Err(HudError::from(e)),
        }),
        Box::new(move |command: Command| {
            commands.write_all(command.to_line().as_bytes())?;
            Ok(())
        }),
        Duration::from_millis(250),
    );

    let _ = stream.shutdown(Shutdown::Both);
    reader.join().map_err(|_| HudError::JoinError)?;
    res?;
    Ok(())
}
