//! Addressing on top of a [`Link`]: the two processors and the codebit.
//!
//! Every message starts with a command, a sub-command and a codebit naming
//! sender and receiver:
//!
//! ```text
//!   7   6   5   4   3   2   1   0
//! | sender    | receiver  | div   |
//! ```

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use crate::codec::{division, CMD_LEN};
use crate::protocol::Link;

/// The two ends of the link.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Address {
    Vcpu = 0x01,
    Mcpu = 0x02,
}

impl Address {
    pub fn other(self) -> Address {
        match self {
            Address::Vcpu => Address::Mcpu,
            Address::Mcpu => Address::Vcpu,
        }
    }

    pub fn from_bits(bits: u8) -> Option<Address> {
        match bits {
            0x01 => Some(Address::Vcpu),
            0x02 => Some(Address::Mcpu),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Command {
    pub command: u8,
    pub sub_command: u8,
}

impl Command {
    pub const fn new(command: u8, sub_command: u8) -> Command {
        Command {
            command,
            sub_command,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Codebit(pub u8);

impl Codebit {
    const SENDER_SHIFT: u8 = 5;
    const RECEIVER_SHIFT: u8 = 2;
    const ADDRESS_MASK: u8 = 0x07;

    pub fn new(sender: Address, receiver: Address) -> Codebit {
        Codebit(((sender as u8) << Self::SENDER_SHIFT) + ((receiver as u8) << Self::RECEIVER_SHIFT))
    }

    /// Codebit on messages we send to `peer`.
    pub fn outgoing(peer: Address) -> Codebit {
        Codebit::new(peer.other(), peer)
    }

    /// Codebit on messages `peer` sends to us.
    pub fn incoming(peer: Address) -> Codebit {
        Codebit::new(peer, peer.other())
    }

    pub fn sender(self) -> Option<Address> {
        Address::from_bits((self.0 >> Self::SENDER_SHIFT) & Self::ADDRESS_MASK)
    }

    pub fn receiver(self) -> Option<Address> {
        Address::from_bits((self.0 >> Self::RECEIVER_SHIFT) & Self::ADDRESS_MASK)
    }

    pub fn division(self) -> u8 {
        self.0 & division::MASK
    }

    pub fn without_division(self) -> Codebit {
        Codebit(self.0 & !division::MASK)
    }
}

/// A message as seen above the link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub command: Command,
    pub data: Vec<u8>,
}

fn pack(command: Command, codebit: Codebit, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(CMD_LEN + data.len());
    payload.push(command.command);
    payload.push(command.sub_command);
    payload.push(codebit.0);
    payload.extend_from_slice(data);
    payload
}

/// Splits a received payload, keeping it only if it is addressed to us.
fn unpack(payload: Vec<u8>, expected: Codebit) -> Option<Message> {
    if payload.len() < CMD_LEN {
        warn!("dropping {} byte payload without a header", payload.len());
        return None;
    }
    let codebit = Codebit(payload[2]);
    if codebit.without_division() != expected {
        warn!(
            "dropping message with codebit {:#04x}, expected {:#04x}",
            codebit.0, expected.0
        );
        return None;
    }
    let command = Command::new(payload[0], payload[1]);
    trace!(
        "message {:#04x} {:#04x}, {} data bytes",
        command.command,
        command.sub_command,
        payload.len() - CMD_LEN
    );
    Some(Message {
        command,
        data: payload[CMD_LEN..].to_vec(),
    })
}

/// One processor reachable over the link.
pub trait Cpu: Send + Sync {
    fn initialize(&self) -> bool {
        true
    }

    /// Blocks until a message arrives. `None` covers both failures and
    /// messages not addressed to us; try again.
    fn read(&self) -> Option<Message>;

    fn write(&self, command: Command, data: &[u8]) -> bool;
}

/// Peer on a single link used in both directions.
pub struct SingleChannel<L: Link> {
    link: L,
    send_codebit: Codebit,
    receive_codebit: Codebit,
}

impl<L: Link> SingleChannel<L> {
    pub fn new(link: L, peer: Address) -> SingleChannel<L> {
        SingleChannel {
            link,
            send_codebit: Codebit::outgoing(peer),
            receive_codebit: Codebit::incoming(peer),
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }
}

impl<L: Link> Cpu for SingleChannel<L> {
    fn read(&self) -> Option<Message> {
        unpack(self.link.receive()?, self.receive_codebit)
    }

    fn write(&self, command: Command, data: &[u8]) -> bool {
        self.link.send(&pack(command, self.send_codebit, data))
    }
}

/// Peer reached over two links, one per direction.
pub struct DualChannel<R: Link, T: Link> {
    receive_link: R,
    transmit_link: T,
    send_codebit: Codebit,
    receive_codebit: Codebit,
}

impl<R: Link, T: Link> DualChannel<R, T> {
    pub fn new(receive_link: R, transmit_link: T, peer: Address) -> DualChannel<R, T> {
        DualChannel {
            receive_link,
            transmit_link,
            send_codebit: Codebit::outgoing(peer),
            receive_codebit: Codebit::incoming(peer),
        }
    }
}

impl<R: Link, T: Link> Cpu for DualChannel<R, T> {
    fn read(&self) -> Option<Message> {
        unpack(self.receive_link.receive()?, self.receive_codebit)
    }

    fn write(&self, command: Command, data: &[u8]) -> bool {
        self.transmit_link
            .send(&pack(command, self.send_codebit, data))
    }
}

/// Starts the receive worker.
///
/// The thread reads `cpu` in a loop and forwards every message to `tx`,
/// sleeping for `backoff` after a read that produced nothing. It stops once
/// the receiving end of the channel is gone.
pub fn spawn_reader<C>(
    cpu: Arc<C>,
    tx: mpsc::Sender<Message>,
    backoff: Duration,
) -> std::io::Result<thread::JoinHandle<()>>
where
    C: Cpu + ?Sized + 'static,
{
    thread::Builder::new()
        .name("cpulink-reader".into())
        .spawn(move || loop {
            match cpu.read() {
                Some(message) => {
                    if tx.send(message).is_err() {
                        debug!("reader: channel closed, stopping");
                        break;
                    }
                }
                None => thread::sleep(backoff),
            }
        })
}
