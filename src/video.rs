//! Camera pass-through.
//!
//! Frames are read from a [`FrameSource`] and handed to the
//! [`Broadcaster`] untouched. Every `frame_skip`-th frame is also shown to
//! an optional [`Detector`] whose latest findings ride along with the next
//! signal update.

use crate::feed::{Broadcaster, FeedEvent};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::io::{self, Read};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// One whole encoded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    /// Position in the stream, starting at 0
    pub seq: u64,
    /// Encoded bytes, never inspected
    pub bytes: Vec<u8>,
}

/// An object found in a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Class name, e.g. `person`
    pub label: String,
    /// 0.0 to 1.0
    pub confidence: f32,
    /// `[x, y, width, height]` in pixels
    pub bbox: [u32; 4],
}

/// Produces encoded video.
pub trait FrameSource: Send {
    /// The next complete frame, or `None` once the stream has ended.
    fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>>;
}

/// Looks for objects in frames.
pub trait Detector: Send {
    /// Everything found in `frame`.
    fn detect(&mut self, frame: &StreamFrame) -> Vec<Detection>;
}

const READ_CHUNK: usize = 64 * 1024;

/// A frame that grows past this without an end marker is thrown away.
const MAX_FRAME: usize = 16 * 1024 * 1024;

enum Step {
    NeedMore,
    Complete(usize),
    Corrupt,
}

/// Cuts a Motion JPEG byte stream into whole images.
///
/// Marker segments are skipped by their length, so an `FF D9` inside an
/// embedded thumbnail does not end the frame. Inside entropy-coded data only
/// a real marker ends the scan: stuffed `FF 00`, restart markers and fill
/// bytes are part of it.
#[derive(Debug, Default)]
pub struct JpegFramer {
    buf: Vec<u8>,
    // Next marker to look at in the current frame. 0 while hunting for SOI.
    cursor: usize,
    in_scan: bool,
}

impl JpegFramer {
    /// An empty framer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// The next complete image, if one has fully arrived.
    pub fn next_image(&mut self) -> Option<Vec<u8>> {
        loop {
            if self.cursor == 0 && !self.find_start() {
                return None;
            }
            match self.advance() {
                Step::NeedMore => {
                    if self.buf.len() > MAX_FRAME {
                        warn!("video: no end of frame after {} bytes, resyncing", self.buf.len());
                        self.buf.clear();
                        self.cursor = 0;
                        self.in_scan = false;
                    }
                    return None;
                }
                Step::Complete(end) => {
                    let image = self.buf.drain(..end).collect();
                    self.cursor = 0;
                    self.in_scan = false;
                    return Some(image);
                }
                Step::Corrupt => {
                    debug!("video: malformed frame, looking for the next one");
                    self.buf.drain(..1);
                    self.cursor = 0;
                    self.in_scan = false;
                }
            }
        }
    }

    fn find_start(&mut self) -> bool {
        match self.buf.windows(2).position(|w| w[0] == 0xFF && w[1] == 0xD8) {
            Some(start) => {
                if start > 0 {
                    debug!("video: skipped {start} bytes before a frame");
                }
                self.buf.drain(..start);
                self.cursor = 2;
                true
            }
            None => {
                // A trailing FF may be the first half of the next SOI.
                let keep = usize::from(self.buf.last() == Some(&0xFF));
                let drop = self.buf.len() - keep;
                self.buf.drain(..drop);
                false
            }
        }
    }

    fn advance(&mut self) -> Step {
        let buf = &self.buf;
        loop {
            if self.in_scan {
                match scan_end(buf, self.cursor) {
                    Ok(at) => {
                        self.cursor = at;
                        self.in_scan = false;
                    }
                    Err(resume) => {
                        self.cursor = resume;
                        return Step::NeedMore;
                    }
                }
            }

            let at = self.cursor;
            if at + 1 >= buf.len() {
                return Step::NeedMore;
            }
            if buf[at] != 0xFF {
                return Step::Corrupt;
            }
            match buf[at + 1] {
                0xFF => self.cursor += 1,
                0xD9 => return Step::Complete(at + 2),
                0xD8 => return Step::Corrupt,
                0x01 | 0xD0..=0xD7 => self.cursor += 2,
                marker => {
                    if at + 3 >= buf.len() {
                        return Step::NeedMore;
                    }
                    let len = usize::from(u16::from_be_bytes([buf[at + 2], buf[at + 3]]));
                    if len < 2 {
                        return Step::Corrupt;
                    }
                    self.cursor = at + 2 + len;
                    self.in_scan = marker == 0xDA;
                }
            }
        }
    }
}

/// Offset of the marker ending the entropy-coded data that starts at
/// `from`, or where to resume once more bytes arrive.
fn scan_end(buf: &[u8], from: usize) -> Result<usize, usize> {
    let mut i = from;
    while i + 1 < buf.len() {
        if buf[i] == 0xFF && !matches!(buf[i + 1], 0x00 | 0xD0..=0xD7 | 0xFF) {
            return Ok(i);
        }
        i += 1;
    }
    Err(i)
}

/// Motion JPEG read from the stdout of a capture command such as
/// `libcamera-vid --codec mjpeg -o -`.
pub struct ProcessFrameSource {
    child: Child,
    stdout: ChildStdout,
    chunk: Vec<u8>,
    framer: JpegFramer,
}

impl ProcessFrameSource {
    /// Start `command[0]` with the remaining elements as arguments.
    pub fn spawn(command: &[String]) -> io::Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty video command"))?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "capture has no stdout"))?;
        info!("video: started {}", command.join(" "));
        Ok(Self {
            child,
            stdout,
            chunk: vec![0; READ_CHUNK],
            framer: JpegFramer::new(),
        })
    }
}

impl FrameSource for ProcessFrameSource {
    fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(image) = self.framer.next_image() {
                return Ok(Some(image));
            }
            let n = match self.stdout.read(&mut self.chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if n == 0 {
                if self.framer.pending() > 0 {
                    debug!("video: {} bytes of an unfinished frame dropped", self.framer.pending());
                }
                return Ok(None);
            }
            self.framer.push(&self.chunk[..n]);
        }
    }
}

impl Drop for ProcessFrameSource {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Moves frames from a source to every viewer.
pub struct VideoPump {
    source: Box<dyn FrameSource>,
    detector: Option<Box<dyn Detector>>,
    frame_skip: u64,
    broadcaster: Arc<Broadcaster>,
    detections: Arc<Mutex<Vec<Detection>>>,
    running: Arc<AtomicBool>,
}

impl VideoPump {
    /// A pump writing detections into `detections`.
    pub fn new(
        source: Box<dyn FrameSource>,
        broadcaster: Arc<Broadcaster>,
        detections: Arc<Mutex<Vec<Detection>>>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            source,
            detector: None,
            frame_skip: 1,
            broadcaster,
            detections,
            running,
        }
    }

    /// Run `detector` on every `frame_skip`-th frame.
    pub fn with_detector(mut self, detector: Box<dyn Detector>, frame_skip: u32) -> Self {
        self.detector = Some(detector);
        self.frame_skip = frame_skip.max(1).into();
        self
    }

    /// Pump until the source ends, fails, or shutdown. Returns the number
    /// of frames read.
    pub fn run(mut self) -> u64 {
        let mut seq = 0;
        while self.running.load(Ordering::Relaxed) {
            let bytes = match self.source.next_frame() {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    info!("video: stream ended after {seq} frames");
                    break;
                }
                Err(e) => {
                    warn!("video: capture failed: {e}");
                    break;
                }
            };
            let frame = StreamFrame { seq, bytes };

            if let Some(detector) = self.detector.as_mut() {
                if seq % self.frame_skip == 0 {
                    let found = detector.detect(&frame);
                    debug!("video: frame {seq}: {} objects", found.len());
                    *self.detections.lock().unwrap_or_else(PoisonError::into_inner) = found;
                }
            }

            self.broadcaster.broadcast(FeedEvent::Frame(Arc::new(frame)));
            seq += 1;
        }
        seq
    }
}
