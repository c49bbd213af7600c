//! Appends received records and lines to a plain-text log file
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;

use super::binary::BinaryRecord;

const FILE_NAME_FORMAT: &str = "%d-%m-%Y_%H-%M-%S";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

#[derive(Debug, thiserror::Error)]
pub enum RecordingError {
    #[error("Link is already recording to {0}")]
    AlreadyRecording(PathBuf),

    #[error("Recording directory does not exist: {0}")]
    MissingDirectory(PathBuf),

    #[error("Link is not recording")]
    NotRecording,

    #[error("Recording IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RecordingError>;

struct RecordingFile {
    path: PathBuf,
    file: File,
}

/// Recording state of one link.
///
/// `active` is the pause gate; the file stays open while paused. CRC failures
/// are only counted while active.
#[derive(Default)]
pub struct Recorder {
    file: Option<RecordingFile>,
    active: bool,
    fail_count: u64,
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("path", &self.path())
            .field("active", &self.active)
            .field("fail_count", &self.fail_count)
            .finish()
    }
}

/// File name used for a recording. An empty name gets a timestamp; a port
/// suffix (set when one request records every link) is appended to the stem.
pub fn recording_file_name(file_name: &str, port_suffix: Option<&str>) -> String {
    let mut name = file_name.trim().to_string();
    if name.is_empty() {
        name = format!("{}.txt", Local::now().format(FILE_NAME_FORMAT));
    }
    if let Some(port) = port_suffix {
        let stem = Path::new(&name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.clone());
        // port names like /dev/ttyUSB0 must not create subdirectories
        let port = port.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(port);
        name = format!("{}_{}.txt", stem, port);
    }
    name
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, dir: &Path, file_name: &str, port_suffix: Option<&str>) -> Result<PathBuf> {
        if let Some(current) = &self.file {
            return Err(RecordingError::AlreadyRecording(current.path.clone()));
        }
        if !dir.is_dir() {
            return Err(RecordingError::MissingDirectory(dir.to_path_buf()));
        }

        let path = dir.join(recording_file_name(file_name, port_suffix));
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{}", timestamp())?;

        log::info!("Recording to {}", path.display());
        self.file = Some(RecordingFile { path: path.clone(), file });
        self.active = true;
        self.fail_count = 0;
        Ok(path)
    }

    /// Close the file after writing a stop timestamp and the failure count.
    /// Returns the closed file's path, or `None` when nothing was recording.
    pub fn stop(&mut self) -> Result<Option<PathBuf>> {
        self.active = false;
        let Some(mut current) = self.file.take() else {
            return Ok(None);
        };
        writeln!(current.file, "{}", timestamp())?;
        writeln!(current.file, "FatalError = {}", self.fail_count)?;
        current.file.flush()?;
        log::info!(
            "Recording stopped: {} ({} CRC failures)",
            current.path.display(),
            self.fail_count
        );
        Ok(Some(current.path))
    }

    pub fn pause(&mut self) {
        self.active = false;
    }

    pub fn resume(&mut self) {
        if self.file.is_some() {
            self.active = true;
        }
    }

    pub fn is_recording(&self) -> bool {
        self.file.is_some()
    }

    /// Recording and not paused
    pub fn is_active(&self) -> bool {
        self.active && self.file.is_some()
    }

    pub fn fail_count(&self) -> u64 {
        self.fail_count
    }

    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(|f| f.path.as_path())
    }

    /// Write one record line; a failed CRC bumps the failure counter
    pub fn record_binary(&mut self, record: &BinaryRecord) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }
        if !record.is_valid() {
            self.fail_count += 1;
        }
        self.write_raw(format!("{}\n", record.to_line()).as_bytes())
    }

    /// Write a received line or chunk exactly as it arrived
    pub fn record_text(&mut self, data: &[u8]) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }
        self.write_raw(data)
    }

    /// Write arbitrary text into the open file, paused or not
    pub fn append_text(&mut self, text: &str) -> Result<()> {
        if self.file.is_none() {
            return Err(RecordingError::NotRecording);
        }
        self.write_raw(text.as_bytes())
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        match self.file.as_mut() {
            Some(current) => {
                current.file.write_all(data)?;
                Ok(())
            }
            None => Err(RecordingError::NotRecording),
        }
    }
}

fn timestamp() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::binary::{encode_record, BinaryFrameDecoder};

    #[test]
    fn test_file_name_for_all_target() {
        assert_eq!(recording_file_name("run.txt", Some("COM3")), "run_COM3.txt");
        assert_eq!(recording_file_name("run", Some("/dev/ttyUSB0")), "run_ttyUSB0.txt");
        assert_eq!(recording_file_name("run.txt", None), "run.txt");
    }

    #[test]
    fn test_empty_name_is_timestamped() {
        let name = recording_file_name("  ", None);
        assert!(name.ends_with(".txt"));
        // dd-mm-YYYY_HH-MM-SS.txt
        assert_eq!(name.len(), 23);
    }

    #[test]
    fn test_start_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = Recorder::new();
        recorder.start(dir.path(), "a.txt", None).unwrap();
        assert!(matches!(
            recorder.start(dir.path(), "b.txt", None),
            Err(RecordingError::AlreadyRecording(_))
        ));
    }

    #[test]
    fn test_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = Recorder::new();
        let result = recorder.start(&dir.path().join("nope"), "a.txt", None);
        assert!(matches!(result, Err(RecordingError::MissingDirectory(_))));
        assert!(!recorder.is_recording());
    }

    #[test]
    fn test_failures_only_counted_while_active() {
        let dir = tempfile::tempdir().unwrap();
        let mut frame = encode_record(&[1, 2], 0);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        let bad = BinaryFrameDecoder::new().feed_all(&frame).remove(0);

        let mut recorder = Recorder::new();
        recorder.record_binary(&bad).unwrap();
        assert_eq!(recorder.fail_count(), 0);

        let path = recorder.start(dir.path(), "crc.txt", None).unwrap();
        recorder.record_binary(&bad).unwrap();
        recorder.pause();
        recorder.record_binary(&bad).unwrap();
        recorder.resume();
        recorder.record_binary(&bad).unwrap();
        assert_eq!(recorder.fail_count(), 2);

        assert_eq!(recorder.stop().unwrap(), Some(path.clone()));
        let contents = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[1].ends_with("4650"));
        assert_eq!(lines[4], "FatalError = 2");
    }

    #[test]
    fn test_append_text_requires_open_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = Recorder::new();
        assert!(matches!(recorder.append_text("x"), Err(RecordingError::NotRecording)));

        recorder.start(dir.path(), "notes.txt", None).unwrap();
        recorder.pause();
        recorder.append_text("calibrated\n").unwrap();
        let path = recorder.stop().unwrap().unwrap();
        let contents = std::fs::read_to_string(path).unwrap();
        assert!(contents.contains("calibrated\n"));
    }

    #[test]
    fn test_stop_without_start() {
        let mut recorder = Recorder::new();
        assert_eq!(recorder.stop().unwrap(), None);
    }
}
