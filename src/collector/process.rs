//! Running an external scan program under a deadline.

use crate::error::ScanError;

use std::io::Read;
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL: Duration = Duration::from_millis(50);

/// Run `program args..`, collect its stdout, and kill it if it is still
/// running after `deadline`.
pub fn run_with_deadline(
    program: &str,
    args: &[&str],
    deadline: Duration,
) -> Result<String, ScanError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ScanError::Spawn {
            program: program.to_owned(),
            source,
        })?;

    // Both pipes are drained on the side so a chatty program cannot fill
    // one and stall before it exits.
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if started.elapsed() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            let _ = stdout.join();
            let _ = stderr.join();
            return Err(ScanError::Timeout {
                what: format!("`{program}`"),
                after: deadline,
            });
        }
        thread::sleep(POLL);
    };

    let out = stdout.join().unwrap_or_default();
    let err = stderr.join().unwrap_or_default();
    if !status.success() {
        return Err(ScanError::CommandFailed {
            program: program.to_owned(),
            status: status.to_string(),
            stderr: String::from_utf8_lossy(&err).trim().to_owned(),
        });
    }

    Ok(String::from_utf8_lossy(&out).into_owned())
}

fn drain(pipe: Option<impl Read + Send + 'static>) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut out = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut out);
        }
        out
    })
}
