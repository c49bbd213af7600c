//! In-memory serial link for tests and offline use.
//!
//! The transport side gets a blocking reader and a writer; the device side
//! injects bytes, inspects what was written and can break the link.
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use super::config::SerialLinkConfig;
use super::interface::{LinkEvent, SerialTransport};
use super::Result;

#[derive(Default)]
struct Shared {
    rx: Mutex<VecDeque<u8>>,
    rx_ready: Condvar,
    tx: Mutex<Vec<u8>>,
    tx_ready: Condvar,
    disconnected: AtomicBool,
    fail_writes: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "loopback disconnected")
}

/// Device end of a loopback link
#[derive(Clone)]
pub struct LoopbackDevice {
    shared: Arc<Shared>,
}

pub struct LoopbackReader {
    shared: Arc<Shared>,
    timeout: Duration,
}

pub struct LoopbackWriter {
    shared: Arc<Shared>,
}

/// Create the two ends of a link. Reads time out after `read_timeout`.
pub fn loopback_pair(read_timeout: Duration) -> (LoopbackDevice, LoopbackReader, LoopbackWriter) {
    let shared = Arc::new(Shared::default());
    (
        LoopbackDevice { shared: shared.clone() },
        LoopbackReader {
            shared: shared.clone(),
            timeout: read_timeout,
        },
        LoopbackWriter { shared },
    )
}

/// Start a transport over a fresh loopback link
pub fn open_loopback(
    config: SerialLinkConfig,
    events_tx: broadcast::Sender<LinkEvent>,
) -> Result<(SerialTransport, LoopbackDevice)> {
    let (device, reader, writer) = loopback_pair(config.timeout());
    let transport = SerialTransport::spawn(config, Box::new(reader), Box::new(writer), events_tx)?;
    Ok((transport, device))
}

impl LoopbackDevice {
    /// Bytes the device sends to the host
    pub fn inject(&self, data: &[u8]) {
        lock(&self.shared.rx).extend(data.iter().copied());
        self.shared.rx_ready.notify_all();
    }

    /// Drain everything the host has written so far
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut *lock(&self.shared.tx))
    }

    /// Wait until at least `min_len` bytes were written, then drain them.
    /// Returns whatever is there when the timeout passes.
    pub fn wait_written(&self, min_len: usize, timeout: Duration) -> Vec<u8> {
        let deadline = Instant::now() + timeout;
        let mut tx = lock(&self.shared.tx);
        while tx.len() < min_len {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tx = match self.shared.tx_ready.wait_timeout(tx, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        std::mem::take(&mut *tx)
    }

    /// Make every following host write fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.shared.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Simulate unplugging the device
    pub fn disconnect(&self) {
        self.shared.disconnected.store(true, Ordering::SeqCst);
        self.shared.rx_ready.notify_all();
    }
}

impl Read for LoopbackReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let deadline = Instant::now() + self.timeout;
        let mut rx = lock(&self.shared.rx);
        loop {
            if self.shared.disconnected.load(Ordering::SeqCst) {
                return Err(broken_pipe());
            }
            if !rx.is_empty() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "loopback read timed out"));
            }
            rx = match self.shared.rx_ready.wait_timeout(rx, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }

        let count = buf.len().min(rx.len());
        for (slot, byte) in buf.iter_mut().zip(rx.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }
}

impl Write for LoopbackWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.shared.disconnected.load(Ordering::SeqCst) {
            return Err(broken_pipe());
        }
        if self.shared.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "loopback write rejected"));
        }
        lock(&self.shared.tx).extend_from_slice(buf);
        self.shared.tx_ready.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
