//! # cpulink
//!
//! Stop-and-wait link layer for the half-duplex UART between two processors.
//!
//! A message is a command, a sub-command, an addressing codebit and some
//! data. [`Protocol`] moves it across a [`Device`](device::Device) with an
//! ENQ / ACK handshake, STX..ETX framing, a one-byte checksum and NAK-driven
//! retries. Messages too big for one frame are split and put back together on
//! the far side. [`cpu`] adds the addressing on top.
//!
//! ```no_run
//! use cpulink::cpu::{Address, Command, Cpu, SingleChannel};
//! use cpulink::device::memory;
//! use cpulink::Protocol;
//!
//! let (port, _peer) = memory::pair();
//! let mcpu = SingleChannel::new(Protocol::new(port), Address::Mcpu);
//! mcpu.write(Command::new(0x01, 0x02), &[0xF1, 0xF2, 0xF3]);
//! ```

pub mod checksum;
pub mod codec;
pub mod config;
pub mod cpu;
pub mod device;
pub mod error;
pub mod fsm;
pub mod protocol;
pub mod receive;
pub mod send;

pub use checksum::Checksum;
pub use codec::{build_frames, control, parse_frames, Shape};
pub use config::LinkConfig;
pub use error::{DeviceError, LinkError, Result};
pub use fsm::Event;
pub use protocol::{Link, Protocol};
