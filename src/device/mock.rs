//! Scripted [`Device`] for unit tests.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use super::{Device, OpenMode};
use crate::error::{DeviceError, DeviceResult};

/// What the next read on a [`ScriptedDevice`] yields.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Step {
    Byte(u8),
    Timeout,
    Fault,
}

fn fault() -> DeviceError {
    DeviceError::Io(io::Error::new(io::ErrorKind::Other, "scripted fault"))
}

/// Device that replays a fixed sequence of read outcomes and records writes.
///
/// Reads past the end of the script time out; `poll` past the end reports a
/// disconnect so a receive under test terminates.
#[derive(Default)]
pub(crate) struct ScriptedDevice {
    reads: Mutex<VecDeque<Step>>,
    write_results: Mutex<VecDeque<bool>>,
    writes: Mutex<Vec<Vec<u8>>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

impl ScriptedDevice {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn byte(self, byte: u8) -> Self {
        self.reads.lock().push_back(Step::Byte(byte));
        self
    }

    pub(crate) fn bytes(self, bytes: &[u8]) -> Self {
        self.reads
            .lock()
            .extend(bytes.iter().map(|b| Step::Byte(*b)));
        self
    }

    pub(crate) fn timeout(self) -> Self {
        self.reads.lock().push_back(Step::Timeout);
        self
    }

    pub(crate) fn fault(self) -> Self {
        self.reads.lock().push_back(Step::Fault);
        self
    }

    /// Queues the outcome of a write call; writes beyond the queue succeed.
    pub(crate) fn write_ok(self, ok: bool) -> Self {
        self.write_results.lock().push_back(ok);
        self
    }

    /// Every write call, in order.
    pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().clone()
    }

    /// All bytes written, flattened.
    pub(crate) fn written(&self) -> Vec<u8> {
        self.writes.lock().concat()
    }

    pub(crate) fn remaining_reads(&self) -> usize {
        self.reads.lock().len()
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Device for ScriptedDevice {
    fn open(&self, _mode: OpenMode) -> DeviceResult<()> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn read(&self, _timeout: Option<Duration>) -> DeviceResult<u8> {
        match self.reads.lock().pop_front() {
            Some(Step::Byte(b)) => Ok(b),
            Some(Step::Fault) => Err(fault()),
            Some(Step::Timeout) | None => Err(DeviceError::Timeout),
        }
    }

    fn read_exact(&self, buf: &mut [u8], timeout: Option<Duration>) -> DeviceResult<()> {
        for slot in buf.iter_mut() {
            *slot = self.read(timeout)?;
        }
        Ok(())
    }

    fn write(&self, bytes: &[u8]) -> DeviceResult<usize> {
        self.writes.lock().push(bytes.to_vec());
        match self.write_results.lock().pop_front() {
            Some(false) => Err(fault()),
            _ => Ok(bytes.len()),
        }
    }

    fn poll(&self, _timeout: Option<Duration>) -> DeviceResult<()> {
        let mut reads = self.reads.lock();
        match reads.front() {
            Some(Step::Byte(_)) => Ok(()),
            Some(Step::Timeout) => {
                reads.pop_front();
                Err(DeviceError::Timeout)
            }
            Some(Step::Fault) => {
                reads.pop_front();
                Err(fault())
            }
            None => Err(DeviceError::Disconnected),
        }
    }
}
