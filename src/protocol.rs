//! The link: one device, one wire lock, a send path and a receive path.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::codec::{self, CMD_LEN};
use crate::config::LinkConfig;
use crate::device::{Device, OpenMode};
use crate::error::Result;
use crate::fsm::StateMachine;
use crate::receive::{ReceiveContext, Receiver};
use crate::send::{Sender, TransmitContext};

/// Something that moves whole messages across the wire.
///
/// Both calls block. Failures are reported as `false` / `None`; the caller
/// decides whether to try again.
pub trait Link: Send + Sync {
    fn send(&self, payload: &[u8]) -> bool;

    fn receive(&self) -> Option<Vec<u8>>;
}

impl<L: Link + ?Sized> Link for Arc<L> {
    fn send(&self, payload: &[u8]) -> bool {
        (**self).send(payload)
    }

    fn receive(&self) -> Option<Vec<u8>> {
        (**self).receive()
    }
}

/// Stop-and-wait link over a half-duplex serial [`Device`].
///
/// A `Protocol` is meant to be shared: one worker sits in
/// [`receive`](Protocol::receive) while others call [`send`](Protocol::send).
/// Only one of them drives the wire at a time.
pub struct Protocol<D: Device> {
    pub(crate) device: D,
    pub(crate) wire: Mutex<()>,
    pub(crate) config: LinkConfig,
    /// Counts of the last finished calls. Each call counts in its own
    /// context and publishes here on the way out.
    pub(crate) r1: AtomicU32,
    pub(crate) r2: AtomicU32,
}

impl<D: Device> Protocol<D> {
    /// Opens `device` with the default configuration.
    pub fn new(device: D) -> Protocol<D> {
        Protocol::open(device, LinkConfig::default())
    }

    pub fn with_config(device: D, config: LinkConfig) -> Result<Protocol<D>> {
        config.validate()?;
        Ok(Protocol::open(device, config))
    }

    fn open(device: D, config: LinkConfig) -> Protocol<D> {
        // A device that fails to open here gets another chance on the first
        // send retry that reopens it.
        if let Err(e) = device.open(OpenMode::ReadWrite) {
            warn!("failed to open device: {}", e);
        }
        Protocol {
            device,
            wire: Mutex::new(()),
            config,
            r1: AtomicU32::new(0),
            r2: AtomicU32::new(0),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Sends one message; `payload` starts with command, sub-command and
    /// codebit.
    pub fn send(&self, payload: &[u8]) -> bool {
        if payload.len() < CMD_LEN {
            warn!("refusing to send {} byte payload without a header", payload.len());
            return false;
        }
        let frames = match codec::build_frames(payload, self.config.checksum) {
            Ok(frames) => frames,
            Err(e) => {
                warn!("cannot frame payload: {}", e);
                return false;
            }
        };
        debug!(
            "send begin: command {:#04x} {:#04x}, {} frame(s)",
            payload[0],
            payload[1],
            frames.len()
        );
        let mut sender = Sender::new(self, TransmitContext::new(frames));
        sender.run();
        let success = sender.into_context().success();
        debug!("send end: {}", if success { "delivered" } else { "failed" });
        success
    }

    /// Waits for the next message from the peer.
    pub fn receive(&self) -> Option<Vec<u8>> {
        debug!("receive begin");
        let mut receiver = Receiver::new(self, ReceiveContext::new());
        receiver.run();
        let context = receiver.into_context();
        debug!(
            "receive end: {}",
            if context.success() { "complete" } else { "failed" }
        );
        if !context.success() {
            return None;
        }
        match codec::parse_frames(context.frames()) {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!("received frames do not reassemble: {}", e);
                None
            }
        }
    }

    /// Receive attempts made by the last `receive` call to finish.
    pub fn r1(&self) -> u32 {
        self.r1.load(Ordering::Relaxed)
    }

    /// Send retries made by the last `send` call to finish.
    pub fn r2(&self) -> u32 {
        self.r2.load(Ordering::Relaxed)
    }
}

impl<D: Device> Link for Protocol<D> {
    fn send(&self, payload: &[u8]) -> bool {
        Protocol::send(self, payload)
    }

    fn receive(&self) -> Option<Vec<u8>> {
        Protocol::receive(self)
    }
}

impl<D: Device> Drop for Protocol<D> {
    fn drop(&mut self) {
        self.device.close();
    }
}
