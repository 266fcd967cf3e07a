//! Transport abstraction between the protocol handler and the CAN bus.
//!
//! The library does not drive CAN hardware. The surrounding system supplies a
//! duplex channel that accepts outbound frames and hands back inbound frames
//! carrying either bootloader identifier.
//!
//! ```text
//! +------------------+
//! |  Session/Handler |
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+      +------------------+
//! |  Transport Trait | ---> | ChannelTransport | <--> bus thread (BusEnd)
//! +--------+---------+      +------------------+
//!          |
//!          v
//! +--------+---------+
//! |   SimTransport   |  in-process bootloader model
//! +------------------+
//! ```

pub mod sim;

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

use log::trace;

use crate::error::{Error, Result};
use crate::protocol::packet::Frame;

pub use sim::{SimTransport, SimulatedTarget};

/// Duplex frame channel used by the handler.
pub trait Transport {
    /// Queue a frame for transmission. Must not wait for a reply.
    fn send(&mut self, frame: &Frame) -> Result<()>;

    /// Wait up to `timeout` for the next inbound frame.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    fn recv(&mut self, timeout: Duration) -> Result<Option<Frame>>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send(&mut self, frame: &Frame) -> Result<()> {
        (**self).send(frame)
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Frame>> {
        (**self).recv(timeout)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, frame: &Frame) -> Result<()> {
        (**self).send(frame)
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Frame>> {
        (**self).recv(timeout)
    }
}

/// Host side of an in-memory duplex channel.
#[derive(Debug)]
pub struct ChannelTransport {
    outbound: Sender<Frame>,
    inbound: Receiver<Frame>,
}

/// Bus side of an in-memory duplex channel.
///
/// The owner forwards frames written by the host to the CAN bus and delivers
/// frames read from the bus back to the host.
#[derive(Debug)]
pub struct BusEnd {
    outbound: Receiver<Frame>,
    inbound: Sender<Frame>,
}

impl ChannelTransport {
    /// Create a connected host/bus pair.
    pub fn pair() -> (Self, BusEnd) {
        let (out_tx, out_rx) = mpsc::channel();
        let (in_tx, in_rx) = mpsc::channel();

        (
            Self {
                outbound: out_tx,
                inbound: in_rx,
            },
            BusEnd {
                outbound: out_rx,
                inbound: in_tx,
            },
        )
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, frame: &Frame) -> Result<()> {
        trace!("TX {:#010x} {:02X?}", frame.id, frame.data);
        self.outbound
            .send(frame.clone())
            .map_err(|_| Error::Transport("bus end disconnected".into()))
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Frame>> {
        match self.inbound.recv_timeout(timeout) {
            Ok(frame) => {
                trace!("RX {:#010x} {:02X?}", frame.id, frame.data);
                Ok(Some(frame))
            },
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::Transport("bus end disconnected".into()))
            },
        }
    }
}

impl BusEnd {
    /// Deliver a frame read from the bus to the host.
    pub fn deliver(&self, frame: Frame) -> Result<()> {
        self.inbound
            .send(frame)
            .map_err(|_| Error::Transport("host end disconnected".into()))
    }

    /// Take the next frame the host wants transmitted, if any.
    pub fn try_take(&self) -> Result<Option<Frame>> {
        match self.outbound.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                Err(Error::Transport("host end disconnected".into()))
            },
        }
    }

    /// Wait up to `timeout` for the next frame the host wants transmitted.
    pub fn take(&self, timeout: Duration) -> Result<Option<Frame>> {
        match self.outbound.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::Transport("host end disconnected".into()))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_pair_forwards_both_ways() {
        let (mut host, bus) = ChannelTransport::pair();

        host.send(&Frame::extended(0x100, vec![1; 8])).unwrap();
        let sent = bus.try_take().unwrap().unwrap();
        assert_eq!(sent.id, 0x100);
        assert!(bus.try_take().unwrap().is_none());

        bus.deliver(Frame::extended(0x200, vec![2; 8])).unwrap();
        let got = host.recv(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(got.data, vec![2; 8]);
    }

    #[test]
    fn test_channel_recv_times_out() {
        let (mut host, _bus) = ChannelTransport::pair();
        assert!(host.recv(Duration::from_millis(1)).unwrap().is_none());
    }

    #[test]
    fn test_channel_reports_disconnect() {
        let (mut host, bus) = ChannelTransport::pair();
        drop(bus);
        assert!(matches!(
            host.recv(Duration::from_millis(1)),
            Err(Error::Transport(_))
        ));
        assert!(host.send(&Frame::extended(1, vec![0; 8])).is_err());
    }

    #[test]
    fn test_boxed_transport() {
        let (host, bus) = ChannelTransport::pair();
        let mut boxed: Box<dyn Transport> = Box::new(host);
        boxed.send(&Frame::extended(7, vec![0; 8])).unwrap();
        assert_eq!(bus.take(Duration::from_millis(10)).unwrap().unwrap().id, 7);
    }
}
