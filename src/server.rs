//! TCP transport for the live feed.
//!
//! Each accepted connection becomes a [`Viewer`](crate::feed::Viewer). A
//! writer thread drains the viewer's queue onto the socket and a reader
//! thread listens for newline-terminated commands coming back.

use crate::feed::{Broadcaster, Command, FeedState, Viewer, ViewerState};

use log::{debug, error, info, warn};
use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const QUEUE_POLL: Duration = Duration::from_millis(200);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Accepts viewers and connects them to the [`Broadcaster`].
pub struct ViewerServer {
    listener: TcpListener,
    broadcaster: Arc<Broadcaster>,
    feed: FeedState,
    running: Arc<AtomicBool>,
}

impl ViewerServer {
    /// Bind the listening socket.
    pub fn bind(
        address: &str,
        broadcaster: Arc<Broadcaster>,
        feed: FeedState,
        running: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(address)?;
        listener.set_nonblocking(true)?;
        info!("viewer server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            broadcaster,
            feed,
            running,
        })
    }

    /// The bound address, useful when binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept viewers until shutdown.
    pub fn run(self) {
        while self.running.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = self.attach(stream, addr) {
                        warn!("could not set up viewer {addr}: {e}");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    error!("error accepting viewer: {e}");
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
        info!("viewer server stopped");
    }

    fn attach(&self, stream: TcpStream, addr: SocketAddr) -> io::Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;

        let viewer = self.broadcaster.subscribe();
        info!("viewer {} connected from {addr}", viewer.id());
        let alive = Arc::new(AtomicBool::new(true));

        let writer_alive = Arc::clone(&alive);
        let running = Arc::clone(&self.running);
        thread::Builder::new()
            .name(format!("viewer-{}-tx", viewer.id()))
            .spawn(move || write_loop(stream, viewer, writer_alive, running))?;

        let feed = self.feed.clone();
        thread::Builder::new()
            .name(format!("viewer-{addr}-rx"))
            .spawn(move || read_loop(reader, feed, alive))?;
        Ok(())
    }
}

fn write_loop(
    mut stream: TcpStream,
    mut viewer: Viewer,
    alive: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
) {
    let id = viewer.id();
    let mut buffer = Vec::with_capacity(4096);
    while alive.load(Ordering::Relaxed) && running.load(Ordering::Relaxed) {
        let Some(event) = viewer.recv_timeout(QUEUE_POLL) else {
            if viewer.state() == ViewerState::Disconnected {
                break;
            }
            continue;
        };
        buffer.clear();
        if let Err(e) = event.encode(&mut buffer) {
            warn!("viewer {id}: failed to encode event: {e}");
            continue;
        }
        if let Err(e) = stream.write_all(&buffer) {
            debug!("viewer {id}: write failed: {e}");
            break;
        }
    }
    alive.store(false, Ordering::Relaxed);
    // Wakes the reader if it is still blocked on the socket.
    let _ = stream.shutdown(Shutdown::Both);
    info!("viewer {id} disconnected");
}

fn read_loop(stream: TcpStream, feed: FeedState, alive: Arc<AtomicBool>) {
    for line in BufReader::new(stream).lines() {
        let Ok(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        match Command::parse(&line) {
            Some(command) => {
                debug!("viewer sent {command:?}");
                feed.apply(command);
            }
            None => warn!("ignoring unknown viewer command {:?}", line.trim()),
        }
    }
    alive.store(false, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{FeedEvent, SignalUpdate};
    use crate::localizer::PathLossModel;
    use crate::observation::{DeviceObservation, SignalKind};
    use std::time::Instant;

    fn start() -> (SocketAddr, Arc<Broadcaster>, FeedState, Arc<AtomicBool>) {
        let broadcaster = Arc::new(Broadcaster::new(4));
        let feed = FeedState::new(PathLossModel::default());
        let running = Arc::new(AtomicBool::new(true));
        let server = ViewerServer::bind(
            "127.0.0.1:0",
            Arc::clone(&broadcaster),
            feed.clone(),
            Arc::clone(&running),
        )
        .unwrap();
        let addr = server.local_addr().unwrap();
        thread::spawn(move || server.run());
        (addr, broadcaster, feed, running)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn viewer_receives_updates_and_can_clear() {
        let (addr, broadcaster, feed, running) = start();
        feed.registry.upsert(DeviceObservation::new(SignalKind::Wifi, "aa:bb:cc:dd:ee:ff", -50));

        let mut client = TcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        assert!(wait_for(|| broadcaster.viewer_count() == 1));

        broadcaster.broadcast(FeedEvent::Signals(Arc::new(SignalUpdate::default())));
        let mut reader = BufReader::new(client.try_clone().unwrap());
        match FeedEvent::decode(&mut reader).unwrap() {
            Some(FeedEvent::Signals(update)) => assert!(update.signals.is_empty()),
            other => panic!("unexpected {other:?}"),
        }

        client.write_all(b"nonsense\nclear\n").unwrap();
        assert!(wait_for(|| feed.registry.is_empty()));

        running.store(false, Ordering::Relaxed);
    }

    #[test]
    fn viewer_can_track_and_untrack() {
        let (addr, broadcaster, feed, running) = start();
        feed.registry.upsert(DeviceObservation::new(SignalKind::Wifi, "aa:bb:cc:dd:ee:ff", -50));
        let mut client = TcpStream::connect(addr).unwrap();
        assert!(wait_for(|| broadcaster.viewer_count() == 1));

        let track = Command::Track {
            kind: SignalKind::Wifi,
            id: "aa:bb:cc:dd:ee:ff".into(),
        };
        client.write_all(track.to_line().as_bytes()).unwrap();
        assert!(wait_for(|| feed.tracker.target().is_some()));
        assert_eq!(feed.compose().selected.unwrap().rssi, Some(-50));

        client.write_all(Command::Untrack.to_line().as_bytes()).unwrap();
        assert!(wait_for(|| feed.tracker.target().is_none()));

        running.store(false, Ordering::Relaxed);
    }

    #[test]
    fn hanging_up_removes_the_viewer() {
        let (addr, broadcaster, _feed, running) = start();
        let client = TcpStream::connect(addr).unwrap();
        assert!(wait_for(|| broadcaster.viewer_count() == 1));
        drop(client);

        assert!(wait_for(|| {
            broadcaster.broadcast(FeedEvent::Signals(Arc::new(SignalUpdate::default())));
            broadcaster.viewer_count() == 0
        }));
        running.store(false, Ordering::Relaxed);
    }
}
