//! Byte-level serial device abstraction.
//!
//! The link layer never touches a file descriptor directly. It drives a
//! [`Device`], which may be a tty, an emulator socket, an embedded-hal
//! peripheral ([`hal::HalDevice`]) or an in-process pipe ([`memory::pair`]).

pub mod hal;
pub mod memory;

#[cfg(test)]
pub(crate) mod mock;

use std::time::Duration;

use crate::error::DeviceResult;

/// Non-blocking probe.
pub const IMMEDIATE: Option<Duration> = Some(Duration::ZERO);
/// Block until the device becomes readable.
pub const INFINITE: Option<Duration> = None;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    ReadWrite,
}

/// A serial channel shared by the send path and the receive worker.
///
/// Methods take `&self`: implementations serialise access internally. The
/// protocol's wire lock decides who may drive a handshake, not the device.
pub trait Device: Send + Sync {
    fn open(&self, mode: OpenMode) -> DeviceResult<()>;

    fn close(&self);

    /// Reads one byte, waiting at most `timeout`.
    fn read(&self, timeout: Option<Duration>) -> DeviceResult<u8>;

    /// Fills `buf` completely; `timeout` bounds the whole read.
    fn read_exact(&self, buf: &mut [u8], timeout: Option<Duration>) -> DeviceResult<()>;

    /// Writes `bytes`, returning how many were accepted.
    fn write(&self, bytes: &[u8]) -> DeviceResult<usize>;

    /// Returns once the device is readable.
    fn poll(&self, timeout: Option<Duration>) -> DeviceResult<()>;
}

impl<D: Device + ?Sized> Device for std::sync::Arc<D> {
    fn open(&self, mode: OpenMode) -> DeviceResult<()> {
        (**self).open(mode)
    }

    fn close(&self) {
        (**self).close()
    }

    fn read(&self, timeout: Option<Duration>) -> DeviceResult<u8> {
        (**self).read(timeout)
    }

    fn read_exact(&self, buf: &mut [u8], timeout: Option<Duration>) -> DeviceResult<()> {
        (**self).read_exact(buf, timeout)
    }

    fn write(&self, bytes: &[u8]) -> DeviceResult<usize> {
        (**self).write(bytes)
    }

    fn poll(&self, timeout: Option<Duration>) -> DeviceResult<()> {
        (**self).poll(timeout)
    }
}
