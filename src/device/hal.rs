//! [`Device`] over an embedded-hal serial peripheral.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{Device, OpenMode};
use crate::error::{DeviceError, DeviceResult};

struct Reader<RX> {
    inner: RX,
    /// Byte seen by `poll` that nobody has read yet.
    stashed: Option<u8>,
}

/// Adapts a split embedded-hal UART (`TX` / `RX` halves) to [`Device`].
///
/// The peripheral is non-blocking, so timeouts are implemented by retrying
/// on `WouldBlock` every `poll_interval`. Locks are held for one attempt at a
/// time so a reader parked in `poll` never starves the writer.
pub struct HalDevice<TX, RX>
where
    TX: embedded_hal::serial::Write<u8> + Send,
    RX: embedded_hal::serial::Read<u8> + Send,
    TX::Error: core::fmt::Debug,
    RX::Error: core::fmt::Debug,
{
    writer: Mutex<TX>,
    reader: Mutex<Reader<RX>>,
    open: AtomicBool,
    poll_interval: Duration,
    write_timeout: Duration,
}

enum Attempt<T> {
    Ready(T),
    Pending,
}

impl<TX, RX> HalDevice<TX, RX>
where
    TX: embedded_hal::serial::Write<u8> + Send,
    RX: embedded_hal::serial::Read<u8> + Send,
    TX::Error: core::fmt::Debug,
    RX::Error: core::fmt::Debug,
{
    pub fn new(writer: TX, reader: RX) -> HalDevice<TX, RX> {
        HalDevice {
            writer: Mutex::new(writer),
            reader: Mutex::new(Reader {
                inner: reader,
                stashed: None,
            }),
            open: AtomicBool::new(false),
            poll_interval: Duration::from_millis(1),
            write_timeout: Duration::from_millis(100),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Gives back the peripheral halves.
    pub fn release(self) -> (TX, RX) {
        (self.writer.into_inner(), self.reader.into_inner().inner)
    }

    fn ensure_open(&self) -> DeviceResult<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(DeviceError::NotOpen)
        }
    }

    /// Retries `attempt` until it is ready or `timeout` elapses.
    fn retry_until<T>(
        &self,
        timeout: Option<Duration>,
        mut attempt: impl FnMut() -> DeviceResult<Attempt<T>>,
    ) -> DeviceResult<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            self.ensure_open()?;
            if let Attempt::Ready(value) = attempt()? {
                return Ok(value);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(DeviceError::Timeout);
                }
            }
            thread::sleep(self.poll_interval);
        }
    }

    fn reader_read(&self) -> DeviceResult<Attempt<u8>> {
        let mut reader = self.reader.lock();
        if let Some(b) = reader.stashed.take() {
            return Ok(Attempt::Ready(b));
        }
        match reader.inner.read() {
            Ok(b) => Ok(Attempt::Ready(b)),
            Err(nb::Error::WouldBlock) => Ok(Attempt::Pending),
            Err(nb::Error::Other(e)) => Err(DeviceError::Serial(format!("{:?}", e))),
        }
    }

    /// Like [`reader_read`](Self::reader_read) but leaves the byte stashed
    /// for the next read, under the same lock.
    fn reader_peek(&self) -> DeviceResult<Attempt<()>> {
        let mut reader = self.reader.lock();
        if reader.stashed.is_some() {
            return Ok(Attempt::Ready(()));
        }
        match reader.inner.read() {
            Ok(b) => {
                reader.stashed = Some(b);
                Ok(Attempt::Ready(()))
            }
            Err(nb::Error::WouldBlock) => Ok(Attempt::Pending),
            Err(nb::Error::Other(e)) => Err(DeviceError::Serial(format!("{:?}", e))),
        }
    }

    fn writer_write(&self, byte: u8) -> DeviceResult<Attempt<()>> {
        match self.writer.lock().write(byte) {
            Ok(()) => Ok(Attempt::Ready(())),
            Err(nb::Error::WouldBlock) => Ok(Attempt::Pending),
            Err(nb::Error::Other(e)) => Err(DeviceError::Serial(format!("{:?}", e))),
        }
    }

    fn writer_flush(&self) -> DeviceResult<Attempt<()>> {
        match self.writer.lock().flush() {
            Ok(()) => Ok(Attempt::Ready(())),
            Err(nb::Error::WouldBlock) => Ok(Attempt::Pending),
            Err(nb::Error::Other(e)) => Err(DeviceError::Serial(format!("{:?}", e))),
        }
    }
}

impl<TX, RX> Device for HalDevice<TX, RX>
where
    TX: embedded_hal::serial::Write<u8> + Send,
    RX: embedded_hal::serial::Read<u8> + Send,
    TX::Error: core::fmt::Debug,
    RX::Error: core::fmt::Debug,
{
    fn open(&self, _mode: OpenMode) -> DeviceResult<()> {
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
        self.reader.lock().stashed = None;
    }

    fn read(&self, timeout: Option<Duration>) -> DeviceResult<u8> {
        self.retry_until(timeout, || self.reader_read())
    }

    fn read_exact(&self, buf: &mut [u8], timeout: Option<Duration>) -> DeviceResult<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        for slot in buf.iter_mut() {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            *slot = self.retry_until(remaining, || self.reader_read())?;
        }
        Ok(())
    }

    fn write(&self, bytes: &[u8]) -> DeviceResult<usize> {
        for byte in bytes {
            self.retry_until(Some(self.write_timeout), || self.writer_write(*byte))?;
        }
        self.retry_until(Some(self.write_timeout), || self.writer_flush())?;
        Ok(bytes.len())
    }

    fn poll(&self, timeout: Option<Duration>) -> DeviceResult<()> {
        self.retry_until(timeout, || self.reader_peek())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Default)]
    struct TestWriter {
        out: Vec<u8>,
        busy_every_other: bool,
        busy: bool,
    }

    #[derive(Debug, Default)]
    struct TestReader {
        source: VecDeque<u8>,
        broken: bool,
    }

    impl embedded_hal::serial::Write<u8> for TestWriter {
        type Error = ();

        fn write(&mut self, byte: u8) -> nb::Result<(), Self::Error> {
            if self.busy_every_other {
                self.busy = !self.busy;
                if self.busy {
                    return Err(nb::Error::WouldBlock);
                }
            }
            self.out.push(byte);
            Ok(())
        }

        fn flush(&mut self) -> nb::Result<(), Self::Error> {
            Ok(())
        }
    }

    impl embedded_hal::serial::Read<u8> for TestReader {
        type Error = &'static str;

        fn read(&mut self) -> nb::Result<u8, Self::Error> {
            if self.broken {
                return Err(nb::Error::Other("framing error"));
            }
            match self.source.pop_front() {
                Some(b) => Ok(b),
                None => Err(nb::Error::WouldBlock),
            }
        }
    }

    fn device(source: &[u8]) -> HalDevice<TestWriter, TestReader> {
        let reader = TestReader {
            source: source.iter().copied().collect(),
            broken: false,
        };
        let device = HalDevice::new(TestWriter::default(), reader)
            .with_poll_interval(Duration::from_micros(100));
        device.open(OpenMode::ReadWrite).unwrap();
        device
    }

    #[test]
    fn poll_keeps_the_byte() {
        let device = device(&[0x05, 0x02]);
        device.poll(None).unwrap();
        assert_eq!(device.read(super::super::IMMEDIATE).unwrap(), 0x05);
        assert_eq!(device.read(super::super::IMMEDIATE).unwrap(), 0x02);
        assert!(matches!(
            device.read(Some(Duration::from_millis(2))),
            Err(DeviceError::Timeout)
        ));
    }

    #[test]
    fn repeated_poll_does_not_consume() {
        let device = device(&[0x05, 0x02]);
        device.poll(None).unwrap();
        device.poll(None).unwrap();
        let mut buf = [0u8; 2];
        device
            .read_exact(&mut buf, Some(Duration::from_millis(10)))
            .unwrap();
        assert_eq!(buf, [0x05, 0x02]);
    }

    #[test]
    fn write_rides_out_would_block() {
        let writer = TestWriter {
            busy_every_other: true,
            ..Default::default()
        };
        let device = HalDevice::new(writer, TestReader::default());
        device.open(OpenMode::ReadWrite).unwrap();
        assert_eq!(device.write(&[1, 2, 3]).unwrap(), 3);
        let (writer, _) = device.release();
        assert_eq!(writer.out, vec![1, 2, 3]);
    }

    #[test]
    fn read_exact_collects_bytes() {
        let device = device(&[9, 8, 7]);
        let mut buf = [0u8; 3];
        device
            .read_exact(&mut buf, Some(Duration::from_millis(10)))
            .unwrap();
        assert_eq!(buf, [9, 8, 7]);
    }

    #[test]
    fn peripheral_error_is_a_fault() {
        let reader = TestReader {
            broken: true,
            ..Default::default()
        };
        let device = HalDevice::new(TestWriter::default(), reader);
        device.open(OpenMode::ReadWrite).unwrap();
        assert!(matches!(device.read(None), Err(DeviceError::Serial(_))));
    }

    #[test]
    fn closed_device_refuses_io() {
        let device = HalDevice::new(TestWriter::default(), TestReader::default());
        assert!(matches!(device.write(&[1]), Err(DeviceError::NotOpen)));
    }
}
