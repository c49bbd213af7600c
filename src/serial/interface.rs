use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use super::binary::{BinaryFrameDecoder, BinaryRecord};
use super::config::{ReadMode, SerialLinkConfig};
use super::recording::{Recorder, RecordingError};
use super::{LinkId, Result, SerialError};

/// Blocking byte source owned by the read worker
pub type LinkReader = Box<dyn Read + Send>;
/// Byte sink shared by every writer of a link
pub type LinkWriter = Box<dyn Write + Send>;

const PAUSE_POLL: Duration = Duration::from_millis(20);
const RAW_CHUNK: usize = 256;

/// Everything a link reports. Each event carries the link identity so a
/// single stream can be shared by every panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LinkEvent {
    Connected { link: LinkId },
    ConnectFailed { link: LinkId, reason: String },
    Disconnected { link: LinkId, reason: Option<String> },
    /// One read in line, delimiter, byte-count or raw-log mode
    DataReceived { link: LinkId, data: Vec<u8> },
    /// Takes the place of `DataReceived` in binary-device mode: one decoded
    /// record, with its raw bytes in `record.to_bytes()`. Subject to the
    /// `max_signal_rate` throttle.
    RecordReceived { link: LinkId, record: BinaryRecord },
    SendFailed { link: LinkId, data: Vec<u8>, reason: String },
}

impl LinkEvent {
    pub fn link(&self) -> &LinkId {
        match self {
            LinkEvent::Connected { link }
            | LinkEvent::ConnectFailed { link, .. }
            | LinkEvent::Disconnected { link, .. }
            | LinkEvent::DataReceived { link, .. }
            | LinkEvent::RecordReceived { link, .. }
            | LinkEvent::SendFailed { link, .. } => link,
        }
    }
}

/// Per-link counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub chunks_received: u64,
    pub records_ok: u64,
    pub crc_failures: u64,
    pub records_throttled: u64,
    pub send_failures: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One open serial connection.
///
/// A dedicated thread runs the blocking read loop; writes go straight to a
/// second handle of the same port and never touch the worker.
pub struct SerialTransport {
    config: SerialLinkConfig,
    link: LinkId,
    writer: Arc<Mutex<LinkWriter>>,
    killed: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    recorder: Arc<Mutex<Recorder>>,
    events_tx: broadcast::Sender<LinkEvent>,
    stats_tx: Arc<watch::Sender<LinkStats>>,
    stats_rx: watch::Receiver<LinkStats>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SerialTransport {
    /// Open the OS serial port described by `config` and start reading.
    ///
    /// A failure is reported both as the returned error and as a
    /// `ConnectFailed` event; nothing is left running.
    pub fn open(config: SerialLinkConfig, events_tx: broadcast::Sender<LinkEvent>) -> Result<Self> {
        let link = config.link_id();
        match Self::open_port(&config) {
            Ok((reader, writer)) => Self::spawn(config, reader, writer, events_tx),
            Err(e) => {
                log::error!("Connecting to {} failed: {}", link, e);
                let _ = events_tx.send(LinkEvent::ConnectFailed {
                    link,
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn open_port(config: &SerialLinkConfig) -> Result<(LinkReader, LinkWriter)> {
        let mut port = config
            .port_builder()?
            .open()
            .map_err(|e| SerialError::ConnectionFailed(format!("{}: {}", config.port, e)))?;
        port.write_data_terminal_ready(config.dtr)?;
        let writer = port.try_clone()?;
        Ok((Box::new(port), Box::new(writer)))
    }

    /// Start a transport over an already opened byte stream
    pub fn spawn(
        config: SerialLinkConfig,
        reader: LinkReader,
        writer: LinkWriter,
        events_tx: broadcast::Sender<LinkEvent>,
    ) -> Result<Self> {
        let link = config.link_id();
        if let Err(e) = config.validate() {
            let _ = events_tx.send(LinkEvent::ConnectFailed {
                link,
                reason: e.to_string(),
            });
            return Err(e);
        }

        let (stats_tx, stats_rx) = watch::channel(LinkStats::default());
        let stats_tx = Arc::new(stats_tx);
        let killed = Arc::new(AtomicBool::new(false));
        let paused = Arc::new(AtomicBool::new(false));
        let recorder = Arc::new(Mutex::new(Recorder::new()));

        let read_loop = ReadLoop {
            reader,
            config: config.clone(),
            link: link.clone(),
            killed: killed.clone(),
            paused: paused.clone(),
            recorder: recorder.clone(),
            events_tx: events_tx.clone(),
            stats_tx: stats_tx.clone(),
            decoder: BinaryFrameDecoder::new(),
            last_emit: HashMap::new(),
        };

        let handle = std::thread::Builder::new()
            .name(format!("serial-{}", config.port))
            .spawn(move || read_loop.run())?;

        log::info!("Connected to {} ({:?})", link, config.read_mode);
        let _ = events_tx.send(LinkEvent::Connected { link: link.clone() });

        Ok(Self {
            config,
            link,
            writer: Arc::new(Mutex::new(writer)),
            killed,
            paused,
            recorder,
            events_tx,
            stats_tx,
            stats_rx,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn link(&self) -> &LinkId {
        &self.link
    }

    pub fn config(&self) -> &SerialLinkConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events_tx.subscribe()
    }

    pub fn stats(&self) -> watch::Receiver<LinkStats> {
        self.stats_rx.clone()
    }

    /// Write raw bytes. Failures become a `SendFailed` event; the return
    /// value only tells whether the bytes reached the port.
    pub fn write(&self, data: &[u8]) -> bool {
        if self.killed.load(Ordering::SeqCst) {
            self.send_failed(data, "link closed".to_string());
            return false;
        }

        let result = {
            let mut writer = lock(&self.writer);
            writer.write_all(data).and_then(|_| writer.flush())
        };

        match result {
            Ok(()) => {
                self.stats_tx.send_modify(|s| s.bytes_written += data.len() as u64);
                if self.config.local_echo {
                    let _ = self.events_tx.send(LinkEvent::DataReceived {
                        link: self.link.clone(),
                        data: data.to_vec(),
                    });
                }
                true
            }
            Err(e) => {
                self.send_failed(data, e.to_string());
                false
            }
        }
    }

    /// Terminal style write with the configured line ending appended
    pub fn write_text(&self, text: &str) -> bool {
        let mut data = text.as_bytes().to_vec();
        data.extend_from_slice(self.config.line_ending.as_bytes());
        self.write(&data)
    }

    fn send_failed(&self, data: &[u8], reason: String) {
        log::warn!("Send on {} failed: {}", self.link, reason);
        self.stats_tx.send_modify(|s| s.send_failures += 1);
        let _ = self.events_tx.send(LinkEvent::SendFailed {
            link: self.link.clone(),
            data: data.to_vec(),
            reason,
        });
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Ask the worker to stop. It exits after its current read, closes the
    /// port and reports `Disconnected`.
    pub fn kill(&self) {
        if !self.killed.swap(true, Ordering::SeqCst) {
            log::info!("Closing {}", self.link);
        }
    }

    pub fn is_alive(&self) -> bool {
        lock(&self.worker)
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Kill and block until the worker thread has exited
    pub fn join(&self) {
        self.kill();
        if let Some(handle) = lock(&self.worker).take() {
            if handle.join().is_err() {
                log::error!("Read worker for {} panicked", self.link);
            }
        }
    }

    /// `all_links` appends the port name to the file stem
    pub fn start_recording(
        &self,
        dir: &Path,
        file_name: &str,
        all_links: bool,
    ) -> std::result::Result<PathBuf, RecordingError> {
        let suffix = all_links.then_some(self.config.port.as_str());
        lock(&self.recorder).start(dir, file_name, suffix)
    }

    pub fn stop_recording(&self) -> std::result::Result<Option<PathBuf>, RecordingError> {
        lock(&self.recorder).stop()
    }

    pub fn pause_recording(&self) {
        lock(&self.recorder).pause();
    }

    pub fn resume_recording(&self) {
        lock(&self.recorder).resume();
    }

    pub fn append_to_recording(&self, text: &str) -> std::result::Result<(), RecordingError> {
        lock(&self.recorder).append_text(text)
    }

    pub fn recording_path(&self) -> Option<PathBuf> {
        lock(&self.recorder).path().map(Path::to_path_buf)
    }

    pub fn recording_failures(&self) -> u64 {
        lock(&self.recorder).fail_count()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.killed.store(true, Ordering::SeqCst);
    }
}

/// Sends `Disconnected` however the read loop ends
struct DisconnectGuard {
    link: LinkId,
    killed: Arc<AtomicBool>,
    events_tx: broadcast::Sender<LinkEvent>,
    reason: Option<String>,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.killed.store(true, Ordering::SeqCst);
        match &self.reason {
            Some(reason) => log::warn!("Lost connection to {}: {}", self.link, reason),
            None => log::info!("Disconnected from {}", self.link),
        }
        let _ = self.events_tx.send(LinkEvent::Disconnected {
            link: self.link.clone(),
            reason: self.reason.take(),
        });
    }
}

struct ReadLoop {
    reader: LinkReader,
    config: SerialLinkConfig,
    link: LinkId,
    killed: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    recorder: Arc<Mutex<Recorder>>,
    events_tx: broadcast::Sender<LinkEvent>,
    stats_tx: Arc<watch::Sender<LinkStats>>,
    decoder: BinaryFrameDecoder,
    last_emit: HashMap<u8, Instant>,
}

impl ReadLoop {
    fn run(mut self) {
        let mut guard = DisconnectGuard {
            link: self.link.clone(),
            killed: self.killed.clone(),
            events_tx: self.events_tx.clone(),
            reason: None,
        };

        let mut raw_log = None;
        if self.config.read_mode == ReadMode::RawLog {
            match open_raw_log(&self.config.raw_log_path) {
                Ok(file) => raw_log = Some(file),
                Err(e) => {
                    guard.reason = Some(format!("cannot open raw log: {}", e));
                    return;
                }
            }
        }

        while !self.killed.load(Ordering::SeqCst) {
            if self.paused.load(Ordering::SeqCst) {
                std::thread::sleep(PAUSE_POLL);
                continue;
            }

            let step = match self.config.read_mode {
                ReadMode::Line => self.read_text(Some(b'\n'), usize::MAX),
                ReadMode::Until { delimiter } => self.read_text(Some(delimiter), usize::MAX),
                ReadMode::Bytes { count } => self.read_text(None, count),
                ReadMode::BinaryDevice => self.read_binary(),
                ReadMode::RawLog => match raw_log.as_mut() {
                    Some(file) => self.read_raw(file),
                    None => Ok(()),
                },
            };

            if let Err(e) = step {
                guard.reason = Some(e.to_string());
                break;
            }
        }
        // reader (and with it the port handle) is dropped before the guard fires
        drop(self);
    }

    /// One byte, `None` when the port timed out
    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.reader.read(&mut byte) {
            Ok(0) => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "end of stream")),
            Ok(_) => Ok(Some(byte[0])),
            Err(e) if is_idle(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Collect bytes until the delimiter, `limit` bytes, the link timeout or a
    /// kill request; whatever arrived is emitted.
    fn read_text(&mut self, delimiter: Option<u8>, limit: usize) -> io::Result<()> {
        let deadline = Instant::now() + self.config.timeout();
        let mut data = Vec::new();

        while data.len() < limit && Instant::now() < deadline && !self.killed.load(Ordering::SeqCst) {
            match self.read_byte()? {
                Some(byte) => {
                    data.push(byte);
                    if delimiter == Some(byte) {
                        break;
                    }
                }
                None => {
                    if !data.is_empty() && delimiter.is_none() {
                        break;
                    }
                }
            }
        }

        if data.is_empty() {
            return Ok(());
        }
        self.stats_tx.send_modify(|s| {
            s.bytes_read += data.len() as u64;
            s.chunks_received += 1;
        });
        if let Err(e) = lock(&self.recorder).record_text(&data) {
            log::warn!("Recording on {} failed: {}", self.link, e);
        }
        let _ = self.events_tx.send(LinkEvent::DataReceived {
            link: self.link.clone(),
            data,
        });
        Ok(())
    }

    fn read_binary(&mut self) -> io::Result<()> {
        match self.read_byte()? {
            Some(byte) => {
                self.stats_tx.send_modify(|s| s.bytes_read += 1);
                if let Some(record) = self.decoder.feed(byte) {
                    self.handle_record(record);
                }
            }
            None => {
                // a stalled frame would otherwise swallow the next sync marker
                if self.decoder.in_frame() {
                    log::debug!("Dropping partial record on {} after read timeout", self.link);
                    self.decoder.reset();
                }
            }
        }
        Ok(())
    }

    fn handle_record(&mut self, record: BinaryRecord) {
        let valid = record.is_valid();
        self.stats_tx.send_modify(|s| {
            if valid {
                s.records_ok += 1;
            } else {
                s.crc_failures += 1;
            }
        });

        if let Err(e) = lock(&self.recorder).record_binary(&record) {
            log::warn!("Recording on {} failed: {}", self.link, e);
        }

        let now = Instant::now();
        let interval = Duration::from_secs_f64(1.0 / f64::from(self.config.max_signal_rate));
        let due = self
            .last_emit
            .get(&record.header)
            .map_or(true, |last| now.duration_since(*last) >= interval);
        if !due {
            self.stats_tx.send_modify(|s| s.records_throttled += 1);
            return;
        }
        self.last_emit.insert(record.header, now);
        let _ = self.events_tx.send(LinkEvent::RecordReceived {
            link: self.link.clone(),
            record,
        });
    }

    fn read_raw(&mut self, file: &mut File) -> io::Result<()> {
        let mut buf = [0u8; RAW_CHUNK];
        let n = match self.reader.read(&mut buf) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "end of stream")),
            Ok(n) => n,
            Err(e) if is_idle(&e) => return Ok(()),
            Err(e) => return Err(e),
        };
        file.write_all(&buf[..n])?;
        self.stats_tx.send_modify(|s| {
            s.bytes_read += n as u64;
            s.chunks_received += 1;
        });
        let _ = self.events_tx.send(LinkEvent::DataReceived {
            link: self.link.clone(),
            data: buf[..n].to_vec(),
        });
        Ok(())
    }
}

fn is_idle(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn open_raw_log(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Enumerate serial ports with whatever USB metadata the OS exposes
pub fn discover_ports() -> Result<Vec<super::SerialDeviceInfo>> {
    let ports = serialport::available_ports()?;
    let devices = ports
        .into_iter()
        .map(|port| match port.port_type {
            serialport::SerialPortType::UsbPort(usb) => super::SerialDeviceInfo {
                port_name: port.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                serial_number: usb.serial_number,
                manufacturer: usb.manufacturer,
                product: usb.product,
            },
            _ => super::SerialDeviceInfo {
                port_name: port.port_name,
                vid: None,
                pid: None,
                serial_number: None,
                manufacturer: None,
                product: None,
            },
        })
        .collect();
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_link_accessor() {
        let link = LinkId::new("COM7", 115200);
        let event = LinkEvent::SendFailed {
            link: link.clone(),
            data: b"x".to_vec(),
            reason: "gone".into(),
        };
        assert_eq!(event.link(), &link);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = LinkEvent::Connected {
            link: LinkId::new("COM1", 9600),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"connected\""));
        assert!(json.contains("\"port\":\"COM1\""));
    }

    #[test]
    fn test_idle_errors() {
        assert!(is_idle(&io::Error::new(io::ErrorKind::TimedOut, "t")));
        assert!(!is_idle(&io::Error::new(io::ErrorKind::BrokenPipe, "b")));
    }

    #[test]
    fn test_open_missing_port_reports_connect_failed() {
        let (tx, mut rx) = broadcast::channel(8);
        let config = SerialLinkConfig::new("/dev/lab-console-does-not-exist", 9600);
        assert!(SerialTransport::open(config, tx).is_err());
        assert!(matches!(rx.try_recv(), Ok(LinkEvent::ConnectFailed { .. })));
    }
}
