//! Send state machine.
//!
//! ```text
//! idle -> enquiry -> reenquiry -> ack -> frame -> ack2 -> done -> end
//!            ^           ^         |                       |
//!            |           +--NAK----+   (next frame) -------+
//!            |                     |ENQ
//!           wait <---------------- nak
//! ```
//!
//! Everything that goes wrong lands in `retry`, which gives up after
//! [`LinkConfig::max_send_attempts`](crate::LinkConfig).

use std::sync::atomic::Ordering;
use std::thread;

use log::{debug, error, trace, warn};
use parking_lot::MutexGuard;

use crate::codec::control::{ACK, ENQ, NAK};
use crate::device::{Device, OpenMode, IMMEDIATE};
use crate::error::DeviceError;
use crate::fsm::{Event, StateMachine};
use crate::protocol::Protocol;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SendState {
    Idle,
    Enquiry,
    Reenquiry,
    Ack,
    Frame,
    Ack2,
    Retry,
    Nak,
    Wait,
    Done,
    Error,
    End,
}

impl SendState {
    pub fn next(self, event: Event) -> SendState {
        use Event::*;
        use SendState as S;
        match (self, event) {
            (S::Idle, Pass) => S::Enquiry,
            (S::Enquiry, Pass) => S::Reenquiry,
            (S::Reenquiry, Pass) => S::Ack,
            (S::Reenquiry, Wait) => S::Nak,
            (S::Ack, Pass) => S::Frame,
            (S::Ack, Busy) => S::Reenquiry,
            (S::Ack, Wait) => S::Nak,
            (S::Frame, Pass) => S::Ack2,
            (S::Ack2, Pass) => S::Done,
            (S::Retry, Pass) => S::Enquiry,
            (S::Retry, Fail) => S::Error,
            (S::Nak, Pass) => S::Wait,
            (S::Wait, Pass) => S::Enquiry,
            (S::Done, Continue) => S::Reenquiry,
            (S::Done, _) | (S::Error, _) | (S::End, _) => S::End,
            _ => S::Retry,
        }
    }
}

/// Frames of one outgoing message and how far through them we are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransmitContext {
    frames: Vec<Vec<u8>>,
    cursor: usize,
    attempts: u32,
    success: bool,
}

impl TransmitContext {
    /// `frames` must not be empty.
    pub fn new(frames: Vec<Vec<u8>>) -> TransmitContext {
        debug_assert!(!frames.is_empty());
        TransmitContext {
            frames,
            cursor: 0,
            attempts: 0,
            success: false,
        }
    }

    pub fn current_frame(&self) -> &[u8] {
        &self.frames[self.cursor]
    }

    pub fn has_frames_to_send(&self) -> bool {
        self.cursor + 1 < self.frames.len()
    }

    fn advance(&mut self) {
        self.cursor += 1;
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Retries so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn success(&self) -> bool {
        self.success
    }
}

/// Drives one [`TransmitContext`] over a protocol's device.
pub(crate) struct Sender<'a, D: Device> {
    protocol: &'a Protocol<D>,
    context: TransmitContext,
    /// Held while this call drives the wire.
    wire: Option<MutexGuard<'a, ()>>,
}

impl<'a, D: Device> Sender<'a, D> {
    pub(crate) fn new(protocol: &'a Protocol<D>, context: TransmitContext) -> Self {
        Sender {
            protocol,
            context,
            wire: None,
        }
    }

    pub(crate) fn into_context(self) -> TransmitContext {
        self.context
    }

    fn acquire(&mut self) {
        if self.wire.is_none() {
            trace!("send: lock wire");
            self.wire = Some(self.protocol.wire.lock());
        }
    }

    fn release(&mut self) {
        if self.wire.take().is_some() {
            trace!("send: unlock wire");
        }
    }

    fn write_byte(&self, byte: u8) -> Event {
        match self.protocol.device.write(&[byte]) {
            Ok(1) => Event::Pass,
            Ok(_) => {
                warn!("send: short write of {:#04x}", byte);
                Event::Fail
            }
            Err(e) => {
                warn!("send: failed to write {:#04x}: {}", byte, e);
                Event::Fail
            }
        }
    }

    fn idle(&mut self) -> Event {
        self.context.attempts = 0;
        Event::Pass
    }

    fn enquiry(&mut self) -> Event {
        self.acquire();
        Event::Pass
    }

    /// Drops whatever is sitting in the receive buffer, then sends ENQ.
    fn reenquiry(&mut self) -> Event {
        let device = &self.protocol.device;
        loop {
            match device.read(IMMEDIATE) {
                Ok(b) => trace!("send: drained {:#04x}", b),
                Err(DeviceError::Timeout) => break,
                Err(e) => {
                    warn!("send: failed to drain input: {}", e);
                    return Event::Fail;
                }
            }
        }
        trace!("send: ENQ");
        self.write_byte(ENQ)
    }

    fn acknowledgement(&mut self) -> Event {
        match self.protocol.device.read(Some(self.protocol.config.field_timeout)) {
            Ok(ACK) => Event::Pass,
            Ok(NAK) => {
                warn!("send: peer busy (NAK)");
                Event::Busy
            }
            Ok(ENQ) => {
                warn!("send: collision (ENQ)");
                Event::Wait
            }
            Ok(b) => {
                warn!("send: expected ACK, got {:#04x}", b);
                Event::Deny
            }
            Err(DeviceError::Timeout) => {
                warn!("send: timed out waiting for ACK");
                Event::Deny
            }
            Err(e) => {
                warn!("send: failed to read ACK: {}", e);
                Event::Fail
            }
        }
    }

    fn frame(&mut self) -> Event {
        let frame = self.context.current_frame();
        match self.protocol.device.write(frame) {
            Ok(n) if n == frame.len() => {
                debug!(
                    "send: frame {} sent ({} bytes)",
                    self.context.cursor(),
                    frame.len()
                );
                Event::Pass
            }
            Ok(n) => {
                warn!("send: short frame write, {} of {} bytes", n, frame.len());
                Event::Fail
            }
            Err(e) => {
                warn!("send: failed to write frame: {}", e);
                Event::Fail
            }
        }
    }

    fn retry(&mut self) -> Event {
        let protocol = self.protocol;
        let config = &protocol.config;
        self.context.attempts += 1;
        let attempts = self.context.attempts;
        if attempts >= config.max_send_attempts {
            error!("send: giving up after {} attempts", attempts);
            return Event::Fail;
        }
        self.release();
        thread::sleep(config.backoff);
        trace!("send: retry {}", attempts);
        if attempts % config.reopen_interval == 0 {
            let device = &protocol.device;
            device.close();
            match device.open(OpenMode::ReadWrite) {
                Ok(()) => error!("send: reopened device after {} attempts", attempts),
                Err(e) => error!(
                    "send: failed to reopen device after {} attempts: {}",
                    attempts, e
                ),
            }
        }
        Event::Pass
    }

    fn nak(&mut self) -> Event {
        trace!("send: NAK");
        self.write_byte(NAK)
    }

    fn wait(&mut self) -> Event {
        self.release();
        thread::sleep(self.protocol.config.backoff);
        Event::Pass
    }

    fn done(&mut self) -> Event {
        if self.context.has_frames_to_send() {
            self.context.advance();
            debug!("send: next frame {}", self.context.cursor());
            return Event::Continue;
        }
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
            .r2
            .store(self.context.attempts, Ordering::Relaxed);
        Event::Pass
    }
}

impl<'a, D: Device> StateMachine for Sender<'a, D> {
    type State = SendState;

    const NAME: &'static str = "send";
    const INITIAL: SendState = SendState::Idle;
    const FINAL: SendState = SendState::End;

    fn step(&mut self, state: SendState) -> Event {
        match state {
            SendState::Idle => self.idle(),
            SendState::Enquiry => self.enquiry(),
            SendState::Reenquiry => self.reenquiry(),
            SendState::Ack | SendState::Ack2 => self.acknowledgement(),
            SendState::Frame => self.frame(),
            SendState::Retry => self.retry(),
            SendState::Nak => self.nak(),
            SendState::Wait => self.wait(),
            SendState::Done => self.done(),
            SendState::Error => self.error(),
            SendState::End => self.end(),
        }
    }

    fn transition(state: SendState, event: Event) -> SendState {
        state.next(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::control::STX;
    use Event::*;
    use SendState as S;

    #[test]
    fn handshake_path() {
        assert_eq!(S::Idle.next(Pass), S::Enquiry);
        assert_eq!(S::Enquiry.next(Pass), S::Reenquiry);
        assert_eq!(S::Reenquiry.next(Pass), S::Ack);
        assert_eq!(S::Ack.next(Pass), S::Frame);
        assert_eq!(S::Frame.next(Pass), S::Ack2);
        assert_eq!(S::Ack2.next(Pass), S::Done);
        assert_eq!(S::Done.next(Pass), S::End);
    }

    #[test]
    fn peer_reactions() {
        assert_eq!(S::Ack.next(Busy), S::Reenquiry);
        assert_eq!(S::Ack.next(Wait), S::Nak);
        assert_eq!(S::Ack.next(Deny), S::Retry);
        assert_eq!(S::Ack.next(Fail), S::Retry);
        assert_eq!(S::Reenquiry.next(Wait), S::Nak);
        assert_eq!(S::Nak.next(Pass), S::Wait);
        assert_eq!(S::Wait.next(Pass), S::Enquiry);
        // After the frame went out, anything but ACK is a retry.
        assert_eq!(S::Ack2.next(Busy), S::Retry);
        assert_eq!(S::Ack2.next(Wait), S::Retry);
    }

    #[test]
    fn retry_and_terminal_states() {
        assert_eq!(S::Retry.next(Pass), S::Enquiry);
        assert_eq!(S::Retry.next(Deny), S::Retry);
        assert_eq!(S::Retry.next(Fail), S::Error);
        assert_eq!(S::Done.next(Continue), S::Reenquiry);
        for event in [Pass, Busy, Wait, Deny, Fail] {
            assert_eq!(S::Done.next(event), S::End);
            assert_eq!(S::Error.next(event), S::End);
            let expected = if event == Pass { S::Enquiry } else { S::Retry };
            assert_eq!(S::Idle.next(event), expected);
        }
    }

    #[test]
    fn transmit_context_cursor() {
        let mut context = TransmitContext::new(vec![vec![STX, 1], vec![STX, 2]]);
        assert_eq!(context.current_frame(), &[STX, 1]);
        assert!(context.has_frames_to_send());
        context.advance();
        assert_eq!(context.current_frame(), &[STX, 2]);
        assert!(!context.has_frames_to_send());
        assert!(!context.success());
        assert_eq!(context.attempts(), 0);
    }
}
