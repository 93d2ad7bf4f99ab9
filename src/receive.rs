//! Receive state machine.
//!
//! The worker parks in `poll` until the peer starts talking, answers its ENQ
//! and then reads the frame one field at a time:
//!
//! ```text
//! idle -> poll -> enquiry -> ack -> stx -> len -> datacmd -> dataextlen
//!          ^        ^                                            |
//!        repoll     | (next frame)                        dataframenumber
//!          ^        |                                            |
//!        retry <- nak <-(deny)- etx / cs <- data <---------------+
//!                   |
//!                  done <- ack2 <- cs
//! ```
//!
//! A bad field is NAKed and the frame is read again, at most
//! [`LinkConfig::max_receive_attempts`](crate::LinkConfig) times. Device
//! faults end the call.

use std::sync::atomic::Ordering;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, error, trace, warn};
use parking_lot::MutexGuard;

use crate::codec::control::{ACK, ENQ, ETX, EXT_LEN, NAK, STX};
use crate::codec::{
    self, FrameBuf, Shape, CMD_LEN, EXT_LEN_LEN, FRAME_COUNT_LEN, FRAME_FOOTER_LEN,
    FRAME_NUMBER_LEN, MAX_DIVIDED_LEN, MAX_EXTENDED_LEN, MAX_FRAME_LEN,
    MIN_DIVIDED_LEN, MIN_EXTENDED_LEN, MIN_FRAME_LEN,
};
use crate::device::{Device, IMMEDIATE, INFINITE};
use crate::error::{DeviceError, DeviceResult};
use crate::fsm::{Event, StateMachine};
use crate::protocol::Protocol;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReceiveState {
    Idle,
    Poll,
    Repoll,
    Enquiry,
    Ack,
    Stx,
    Len,
    DataCmd,
    DataExtLen,
    DataFrameNumber,
    Data,
    Etx,
    Cs,
    Ack2,
    Nak,
    Retry,
    Done,
    Error,
    End,
}

impl ReceiveState {
    pub fn next(self, event: Event) -> ReceiveState {
        use Event::*;
        use ReceiveState::*;
        match (self, event) {
            (Idle, Pass) => Poll,
            (Poll, Pass) => Enquiry,
            (Repoll, Pass) => Poll,
            (Enquiry, Pass) => Ack,
            (Enquiry, Busy) => Repoll,
            (Enquiry, Deny) => Retry,
            (Ack, Pass) => Stx,
            (Stx, Pass) => Len,
            (Len, Pass) => DataCmd,
            (DataCmd, Pass) => DataExtLen,
            (DataExtLen, Pass) => DataFrameNumber,
            (DataFrameNumber, Pass) => Data,
            (Data, Pass) => Etx,
            (Etx, Pass) => Cs,
            (Cs, Pass) => Ack2,
            (Stx | Len | DataCmd | DataExtLen | DataFrameNumber | Data | Etx | Cs, Deny) => Nak,
            // A checksum fault is NAKed like a mismatch.
            (Cs, Fail) => Nak,
            (Ack2, Pass) => Done,
            (Nak, Pass) => Retry,
            (Retry, Pass) => Repoll,
            (Done, Continue) => Enquiry,
            (Done, _) | (Error, _) | (End, _) => End,
            _ => Error,
        }
    }
}

/// Frames of one incoming message, as read so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveContext {
    frames: Vec<FrameBuf>,
    shape: Option<Shape>,
    /// Declared length minus the footer.
    data_length: usize,
    frame_number: u16,
    total_frames: u16,
    attempts: u32,
    success: bool,
}

impl Default for ReceiveContext {
    fn default() -> Self {
        ReceiveContext {
            frames: vec![FrameBuf::new()],
            shape: None,
            data_length: 0,
            frame_number: 0,
            total_frames: 0,
            attempts: 0,
            success: false,
        }
    }
}

impl ReceiveContext {
    pub fn new() -> ReceiveContext {
        ReceiveContext::default()
    }

    pub fn frames(&self) -> &[FrameBuf] {
        &self.frames
    }

    pub fn shape(&self) -> Option<Shape> {
        self.shape
    }

    /// Frames NAKed so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn success(&self) -> bool {
        self.success
    }

    fn current_frame(&mut self) -> &mut FrameBuf {
        // Never empty: created with one buffer and only ever grows.
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    /// Frames of a divided message already accepted.
    fn accepted_frames(&self) -> usize {
        self.frames.len() - 1
    }

    fn mid_division(&self) -> bool {
        self.accepted_frames() > 0
    }

    fn append(&mut self, bytes: &[u8]) -> bool {
        self.current_frame().extend_from_slice(bytes).is_ok()
    }

    fn frame_completed(&mut self) {
        self.frames.push(FrameBuf::new());
    }
}

/// Drives one [`ReceiveContext`] over a protocol's device.
pub(crate) struct Receiver<'a, D: Device> {
    protocol: &'a Protocol<D>,
    context: ReceiveContext,
    /// Held while this call drives the wire.
    wire: Option<MutexGuard<'a, ()>>,
}

impl<'a, D: Device> Receiver<'a, D> {
    pub(crate) fn new(protocol: &'a Protocol<D>, context: ReceiveContext) -> Self {
        Receiver {
            protocol,
            context,
            wire: None,
        }
    }

    pub(crate) fn into_context(self) -> ReceiveContext {
        self.context
    }

    fn acquire(&mut self) {
        if self.wire.is_none() {
            trace!("receive: lock wire");
            self.wire = Some(self.protocol.wire.lock());
        }
    }

    fn release(&mut self) {
        if self.wire.take().is_some() {
            trace!("receive: unlock wire");
        }
    }

    /// Maps a failed field read onto an event.
    fn read_failed(&self, field: &str, e: DeviceError) -> Event {
        if e.is_timeout() {
            warn!("receive: timed out reading {}", field);
            Event::Deny
        } else {
            warn!("receive: failed to read {}: {}", field, e);
            Event::Fail
        }
    }

    fn read_field<const N: usize>(&self) -> DeviceResult<[u8; N]> {
        let mut field = [0u8; N];
        self.protocol
            .device
            .read_exact(&mut field, Some(self.protocol.config.field_timeout))?;
        Ok(field)
    }

    fn write_byte(&self, byte: u8) -> Event {
        match self.protocol.device.write(&[byte]) {
            Ok(1) => Event::Pass,
            Ok(_) => {
                warn!("receive: short write of {:#04x}", byte);
                Event::Fail
            }
            Err(e) => {
                warn!("receive: failed to write {:#04x}: {}", byte, e);
                Event::Fail
            }
        }
    }

    fn idle(&mut self) -> Event {
        self.context.attempts = 0;
        Event::Pass
    }

    fn poll(&mut self) -> Event {
        match self.protocol.device.poll(INFINITE) {
            Ok(()) => {
                self.acquire();
                Event::Pass
            }
            Err(e) => {
                warn!("receive: poll failed: {}", e);
                Event::Fail
            }
        }
    }

    fn repoll(&mut self) -> Event {
        self.release();
        Event::Pass
    }

    /// Drains the input and looks at the last byte only.
    fn enquiry(&mut self) -> Event {
        let device = &self.protocol.device;
        let mut last = None;
        let mut count = 0usize;
        loop {
            match device.read(IMMEDIATE) {
                Ok(b) => {
                    last = Some(b);
                    count += 1;
                }
                Err(DeviceError::Timeout) => break,
                Err(e) => {
                    warn!("receive: failed to read enquiry: {}", e);
                    return Event::Fail;
                }
            }
        }
        match last {
            Some(ENQ) => {
                trace!("receive: ENQ after {} byte(s)", count);
                Event::Pass
            }
            Some(NAK) => {
                warn!("receive: NAK after {} byte(s), peer busy", count);
                Event::Busy
            }
            Some(b) => {
                warn!("receive: expected ENQ, got {:#04x} after {} byte(s)", b, count);
                Event::Deny
            }
            None => {
                trace!("receive: nothing to read");
                Event::Busy
            }
        }
    }

    fn acknowledgement(&mut self) -> Event {
        trace!("receive: ACK");
        self.write_byte(ACK)
    }

    fn control_code(&mut self, code: u8) -> Event {
        match self
            .protocol
            .device
            .read(Some(self.protocol.config.field_timeout))
        {
            Ok(b) if b == code => {
                if self.context.append(&[b]) {
                    Event::Pass
                } else {
                    warn!("receive: frame overflow");
                    Event::Deny
                }
            }
            Ok(b) => {
                warn!("receive: expected {:#04x}, got {:#04x}", code, b);
                Event::Deny
            }
            Err(e) => self.read_failed("control code", e),
        }
    }

    fn length(&mut self) -> Event {
        let b = match self
            .protocol
            .device
            .read(Some(self.protocol.config.field_timeout))
        {
            Ok(b) => b,
            Err(e) => return self.read_failed("length", e),
        };
        let mid_division = self.context.mid_division();
        if b == EXT_LEN {
            self.context.shape = Some(if mid_division {
                Shape::Divided
            } else {
                Shape::Extended
            });
        } else if (MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&(b as usize)) && !mid_division {
            trace!("receive: regular frame, length {}", b);
            self.context.shape = Some(Shape::Regular);
            self.context.data_length = b as usize - FRAME_FOOTER_LEN;
        } else {
            warn!("receive: bad length {:#04x}", b);
            return Event::Deny;
        }
        self.context.append(&[b]);
        Event::Pass
    }

    fn data_command(&mut self) -> Event {
        match self.read_field::<CMD_LEN>() {
            Ok(header) => {
                trace!(
                    "receive: command {:#04x} {:#04x} codebit {:#04x}",
                    header[0],
                    header[1],
                    header[2]
                );
                self.context.append(&header);
                Event::Pass
            }
            Err(e) => self.read_failed("command", e),
        }
    }

    fn data_ext_len(&mut self) -> Event {
        if self.context.shape == Some(Shape::Regular) {
            return Event::Pass;
        }
        let field = match self.read_field::<EXT_LEN_LEN>() {
            Ok(field) => field,
            Err(e) => return self.read_failed("extended length", e),
        };
        let length = BigEndian::read_u24(&field) as usize;
        let divided = codec::is_divided(self.context.mid_division(), length);
        let (shape, bounds) = if divided {
            (Shape::Divided, MIN_DIVIDED_LEN..=MAX_DIVIDED_LEN)
        } else {
            (Shape::Extended, MIN_EXTENDED_LEN..=MAX_EXTENDED_LEN)
        };
        if !bounds.contains(&length) {
            warn!("receive: bad extended length {} for {:?} frame", length, shape);
            return Event::Deny;
        }
        trace!("receive: {:?} frame, extended length {}", shape, length);
        self.context.shape = Some(shape);
        self.context.data_length = length - FRAME_FOOTER_LEN;
        self.context.append(&field);
        Event::Pass
    }

    fn data_frame_number(&mut self) -> Event {
        if self.context.shape != Some(Shape::Divided) {
            return Event::Pass;
        }
        let field = match self.read_field::<{ FRAME_NUMBER_LEN + FRAME_COUNT_LEN }>() {
            Ok(field) => field,
            Err(e) => return self.read_failed("frame number", e),
        };
        let number = BigEndian::read_u16(&field[..FRAME_NUMBER_LEN]);
        let total = BigEndian::read_u16(&field[FRAME_NUMBER_LEN..]);
        let expected = self.context.accepted_frames();
        let total_matches = expected == 0 || total == self.context.total_frames;
        if number as usize != expected || number >= total || !total_matches {
            warn!(
                "receive: unexpected frame {} of {}, wanted frame {}",
                number, total, expected
            );
            return Event::Deny;
        }
        trace!("receive: frame {} of {}", number, total);
        self.context.frame_number = number;
        self.context.total_frames = total;
        self.context.append(&field);
        Event::Pass
    }

    fn data(&mut self) -> Event {
        let overhead = match self.context.shape {
            Some(shape) => shape.field_overhead(),
            None => return Event::Deny,
        };
        let size = match self.context.data_length.checked_sub(overhead) {
            Some(size) => size,
            None => {
                warn!("receive: declared length too short");
                return Event::Deny;
            }
        };
        let timeout = Some(self.protocol.config.field_timeout);
        let frame = self.context.current_frame();
        let start = frame.len();
        if frame.resize(start + size, 0).is_err() {
            warn!("receive: {} data bytes do not fit the frame buffer", size);
            return Event::Deny;
        }
        match self.protocol.device.read_exact(&mut frame[start..], timeout) {
            Ok(()) => {
                trace!("receive: {} data bytes", size);
                Event::Pass
            }
            Err(e) => self.read_failed("data", e),
        }
    }

    fn checksum(&mut self) -> Event {
        let checksum = self.protocol.config.checksum;
        let b = match self
            .protocol
            .device
            .read(Some(self.protocol.config.field_timeout))
        {
            Ok(b) => b,
            Err(e) => return self.read_failed("checksum", e),
        };
        let frame = self.context.current_frame();
        if !checksum.validate(&frame[1..], b) {
            warn!(
                "receive: checksum mismatch, calculated {:#04x}, got {:#04x}",
                checksum.generate(&frame[1..]),
                b
            );
            return Event::Deny;
        }
        self.context.append(&[b]);
        debug!(
            "receive: frame ok ({} bytes)",
            self.context.current_frame().len()
        );
        Event::Pass
    }

    fn nak(&mut self) -> Event {
        warn!("receive: NAK");
        self.write_byte(NAK)
    }

    fn retry(&mut self) -> Event {
        self.context.attempts += 1;
        let attempts = self.context.attempts;
        self.context.current_frame().clear();
        if attempts < self.protocol.config.max_receive_attempts {
            trace!("receive: retry {}", attempts);
            Event::Pass
        } else {
            error!("receive: giving up after {} attempts", attempts);
            Event::Fail
        }
    }

    fn done(&mut self) -> Event {
        match self.context.shape {
            Some(Shape::Regular) | Some(Shape::Extended) => {}
            Some(Shape::Divided) => {
                if self.context.frame_number + 1 != self.context.total_frames {
                    self.context.frame_completed();
                    debug!(
                        "receive: waiting for frame {} of {}",
                        self.context.frame_number + 1,
                        self.context.total_frames
                    );
                    return Event::Continue;
                }
            }
            None => return Event::Fail,
        }
        debug!("receive: message complete");
        self.context.success = true;
        Event::Pass
    }

    fn error(&mut self) -> Event {
        self.context.success = false;
        Event::Pass
    }

    fn end(&mut self) -> Event {
        self.release();
        self.protocol
            .r1
            .store(self.context.attempts, Ordering::Relaxed);
        Event::Pass
    }
}

impl<'a, D: Device> StateMachine for Receiver<'a, D> {
    type State = ReceiveState;

    const NAME: &'static str = "receive";
    const INITIAL: ReceiveState = ReceiveState::Idle;
    const FINAL: ReceiveState = ReceiveState::End;

    fn step(&mut self, state: ReceiveState) -> Event {
        match state {
            ReceiveState::Idle => self.idle(),
            ReceiveState::Poll => self.poll(),
            ReceiveState::Repoll => self.repoll(),
            ReceiveState::Enquiry => self.enquiry(),
            ReceiveState::Ack | ReceiveState::Ack2 => self.acknowledgement(),
            ReceiveState::Stx => self.control_code(STX),
            ReceiveState::Len => self.length(),
            ReceiveState::DataCmd => self.data_command(),
            ReceiveState::DataExtLen => self.data_ext_len(),
            ReceiveState::DataFrameNumber => self.data_frame_number(),
            ReceiveState::Data => self.data(),
            ReceiveState::Etx => self.control_code(ETX),
            ReceiveState::Cs => self.checksum(),
            ReceiveState::Nak => self.nak(),
            ReceiveState::Retry => self.retry(),
            ReceiveState::Done => self.done(),
            ReceiveState::Error => self.error(),
            ReceiveState::End => self.end(),
        }
    }

    fn transition(state: ReceiveState, event: Event) -> ReceiveState {
        state.next(event)
    }
}
