//! In-process null-modem.
//!
//! [`pair`] returns two connected ports: bytes written to one become readable
//! on the other. Handy for running both ends of the link in one process.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::{Device, OpenMode};
use crate::error::{DeviceError, DeviceResult};

#[derive(Default)]
struct Lane {
    bytes: VecDeque<u8>,
    hung_up: bool,
}

#[derive(Default)]
struct Channel {
    lane: Mutex<Lane>,
    ready: Condvar,
}

impl Channel {
    fn hang_up(&self) {
        self.lane.lock().hung_up = true;
        self.ready.notify_all();
    }
}

/// One end of an in-memory serial line.
pub struct MemoryPort {
    rx: Arc<Channel>,
    tx: Arc<Channel>,
    open: AtomicBool,
}

/// Creates two connected, initially closed ports.
pub fn pair() -> (MemoryPort, MemoryPort) {
    let a_to_b = Arc::new(Channel::default());
    let b_to_a = Arc::new(Channel::default());
    let a = MemoryPort {
        rx: b_to_a.clone(),
        tx: a_to_b.clone(),
        open: AtomicBool::new(false),
    };
    let b = MemoryPort {
        rx: a_to_b,
        tx: b_to_a,
        open: AtomicBool::new(false),
    };
    (a, b)
}

impl MemoryPort {
    /// Number of bytes waiting to be read on this end.
    pub fn pending(&self) -> usize {
        self.rx.lane.lock().bytes.len()
    }

    fn ensure_open(&self) -> DeviceResult<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(DeviceError::NotOpen)
        }
    }

    /// Blocks until at least one byte is buffered or `deadline` passes.
    fn wait_readable(
        &self,
        lane: &mut MutexGuard<'_, Lane>,
        deadline: Option<Instant>,
    ) -> DeviceResult<()> {
        loop {
            self.ensure_open()?;
            if !lane.bytes.is_empty() {
                return Ok(());
            }
            if lane.hung_up {
                return Err(DeviceError::Disconnected);
            }
            match deadline {
                None => self.rx.ready.wait(lane),
                Some(deadline) => {
                    if self.rx.ready.wait_until(lane, deadline).timed_out() {
                        self.ensure_open()?;
                        return if lane.bytes.is_empty() {
                            Err(DeviceError::Timeout)
                        } else {
                            Ok(())
                        };
                    }
                }
            }
        }
    }
}

fn deadline(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|t| Instant::now() + t)
}

impl Device for MemoryPort {
    fn open(&self, _mode: OpenMode) -> DeviceResult<()> {
        if self.tx.lane.lock().hung_up {
            return Err(DeviceError::Disconnected);
        }
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
        // Wake a reader blocked on this end so it notices.
        let _lane = self.rx.lane.lock();
        self.rx.ready.notify_all();
    }

    fn read(&self, timeout: Option<Duration>) -> DeviceResult<u8> {
        let mut lane = self.rx.lane.lock();
        self.wait_readable(&mut lane, deadline(timeout))?;
        lane.bytes.pop_front().ok_or(DeviceError::Timeout)
    }

    fn read_exact(&self, buf: &mut [u8], timeout: Option<Duration>) -> DeviceResult<()> {
        let deadline = deadline(timeout);
        let mut lane = self.rx.lane.lock();
        for slot in buf.iter_mut() {
            self.wait_readable(&mut lane, deadline)?;
            *slot = lane.bytes.pop_front().ok_or(DeviceError::Timeout)?;
        }
        Ok(())
    }

    fn write(&self, bytes: &[u8]) -> DeviceResult<usize> {
        self.ensure_open()?;
        let mut lane = self.tx.lane.lock();
        if lane.hung_up {
            return Err(DeviceError::Disconnected);
        }
        lane.bytes.extend(bytes.iter().copied());
        drop(lane);
        self.tx.ready.notify_all();
        Ok(bytes.len())
    }

    fn poll(&self, timeout: Option<Duration>) -> DeviceResult<()> {
        let mut lane = self.rx.lane.lock();
        self.wait_readable(&mut lane, deadline(timeout))
    }
}

impl Drop for MemoryPort {
    fn drop(&mut self) {
        self.tx.hang_up();
        self.rx.hang_up();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn open_pair() -> (MemoryPort, MemoryPort) {
        let (a, b) = pair();
        a.open(OpenMode::ReadWrite).unwrap();
        b.open(OpenMode::ReadWrite).unwrap();
        (a, b)
    }

    #[test]
    fn bytes_cross_over() {
        let (a, b) = open_pair();
        assert_eq!(a.write(&[1, 2, 3]).unwrap(), 3);
        assert_eq!(b.pending(), 3);
        assert_eq!(a.pending(), 0);
        let mut buf = [0u8; 3];
        b.read_exact(&mut buf, Some(Duration::from_millis(10))).unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn immediate_read_times_out_when_empty() {
        let (a, _b) = open_pair();
        assert!(matches!(a.read(super::super::IMMEDIATE), Err(DeviceError::Timeout)));
    }

    #[test]
    fn closed_port_refuses_io() {
        let (a, _b) = pair();
        assert!(matches!(a.write(&[0]), Err(DeviceError::NotOpen)));
        assert!(matches!(a.read(None), Err(DeviceError::NotOpen)));
    }

    #[test]
    fn poll_wakes_on_write() {
        let (a, b) = open_pair();
        let waiter = thread::spawn(move || {
            b.poll(None).unwrap();
            b.read(None).unwrap()
        });
        thread::sleep(Duration::from_millis(20));
        a.write(&[0x05]).unwrap();
        assert_eq!(waiter.join().unwrap(), 0x05);
    }

    #[test]
    fn drop_disconnects_peer() {
        let (a, b) = open_pair();
        let waiter = thread::spawn(move || b.poll(None));
        thread::sleep(Duration::from_millis(20));
        drop(a);
        assert!(matches!(
            waiter.join().unwrap(),
            Err(DeviceError::Disconnected)
        ));
    }
}
