//! In-memory transports and clock
//!
//! Deterministic stand-ins for sockets and time used by tests and
//! simulations. A [`MemoryNetwork`] records every connection the session
//! opens and exposes the far end of each as a [`MemoryEndpoint`], from which
//! a test plays the server: reading what the client wrote and pushing
//! frames back.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, VecDeque};
use std::io;
use std::rc::Rc;
use std::time::Duration;

use owlchat_core::protocol::frame::{encode_frame, Frame, FrameBuffer};
use owlchat_core::{ConnectionKind, Record, Result, TimeSource, Timestamp};

use crate::transport::{Connector, Transport};

// ----------------------------------------------------------------------------
// Pipes
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Pipe {
    kind: Option<ConnectionKind>,
    address: String,
    to_server: Vec<u8>,
    to_client: VecDeque<u8>,
    client_closed: bool,
    server_closed: bool,
    write_budget: Option<usize>,
}

#[derive(Debug, Default)]
struct NetworkState {
    pipes: Vec<Rc<RefCell<Pipe>>>,
    refused: BTreeSet<String>,
}

/// Shared registry of in-memory connections
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    state: Rc<RefCell<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector that opens pipes on this network
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            network: self.clone(),
        }
    }

    /// Make every future connect to `address` fail
    pub fn refuse(&self, address: &str) {
        self.state.borrow_mut().refused.insert(address.to_string());
    }

    /// Accept connects to `address` again
    pub fn accept(&self, address: &str) {
        self.state.borrow_mut().refused.remove(address);
    }

    /// Every endpoint opened so far, in connect order
    pub fn endpoints(&self) -> Vec<MemoryEndpoint> {
        self.state
            .borrow()
            .pipes
            .iter()
            .map(|pipe| MemoryEndpoint { pipe: pipe.clone() })
            .collect()
    }

    /// Endpoints opened for `kind`, in connect order
    pub fn endpoints_for(&self, kind: ConnectionKind) -> Vec<MemoryEndpoint> {
        self.endpoints()
            .into_iter()
            .filter(|endpoint| endpoint.kind() == Some(kind))
            .collect()
    }

    /// Most recent endpoint opened for `kind`
    pub fn last(&self, kind: ConnectionKind) -> Option<MemoryEndpoint> {
        self.endpoints_for(kind).pop()
    }

    /// Number of connect calls made
    pub fn connect_count(&self) -> usize {
        self.state.borrow().pipes.len()
    }

    /// Endpoints the client has not closed
    pub fn open_count(&self) -> usize {
        self.state
            .borrow()
            .pipes
            .iter()
            .filter(|pipe| !pipe.borrow().client_closed)
            .count()
    }
}

/// Connector handing out [`MemoryTransport`]s
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    network: MemoryNetwork,
}

impl Connector for MemoryConnector {
    fn connect(&mut self, kind: ConnectionKind, address: &str) -> io::Result<Box<dyn Transport>> {
        let mut state = self.network.state.borrow_mut();
        if state.refused.contains(address) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{} refused", address),
            ));
        }
        let pipe = Rc::new(RefCell::new(Pipe {
            kind: Some(kind),
            address: address.to_string(),
            ..Pipe::default()
        }));
        state.pipes.push(pipe.clone());
        Ok(Box::new(MemoryTransport {
            pipe,
            peer: address.to_string(),
        }))
    }
}

/// Client end of an in-memory pipe
#[derive(Debug)]
pub struct MemoryTransport {
    pipe: Rc<RefCell<Pipe>>,
    peer: String,
}

impl Transport for MemoryTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut pipe = self.pipe.borrow_mut();
        if pipe.to_client.is_empty() {
            if pipe.server_closed {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(pipe.to_client.len());
        for (slot, byte) in buf.iter_mut().zip(pipe.to_client.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut pipe = self.pipe.borrow_mut();
        if pipe.client_closed || pipe.server_closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let n = match pipe.write_budget {
            Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
            Some(budget) => {
                let n = budget.min(buf.len());
                pipe.write_budget = Some(budget - n);
                n
            }
            None => buf.len(),
        };
        pipe.to_server.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn poll_connect(&mut self) -> io::Result<bool> {
        Ok(true)
    }

    fn source(&mut self) -> Option<&mut dyn mio::event::Source> {
        None
    }

    fn shutdown(&mut self) {
        self.pipe.borrow_mut().client_closed = true;
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}

// ----------------------------------------------------------------------------
// Server End
// ----------------------------------------------------------------------------

/// Server end of an in-memory pipe
#[derive(Debug, Clone)]
pub struct MemoryEndpoint {
    pipe: Rc<RefCell<Pipe>>,
}

impl MemoryEndpoint {
    pub fn kind(&self) -> Option<ConnectionKind> {
        self.pipe.borrow().kind
    }

    pub fn address(&self) -> String {
        self.pipe.borrow().address.clone()
    }

    /// Take every byte the client has written
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.pipe.borrow_mut().to_server)
    }

    /// Take and decode every complete frame the client has written
    pub fn take_frames(&self) -> Vec<Frame> {
        let mut buffer = FrameBuffer::new();
        buffer.extend(&self.take_written());
        let mut frames = Vec::new();
        while let Ok(Some(frame)) = buffer.next_frame() {
            frames.push(frame);
        }
        frames
    }

    /// Take the data records the client has written, skipping other channels
    pub fn take_records(&self) -> Vec<Record> {
        self.take_frames()
            .iter()
            .filter_map(|frame| Record::from_frame(frame).ok())
            .collect()
    }

    /// Deliver raw bytes to the client
    pub fn push_bytes(&self, bytes: &[u8]) {
        self.pipe.borrow_mut().to_client.extend(bytes.iter().copied());
    }

    /// Deliver a frame to the client
    pub fn push_frame(&self, frame: &Frame) {
        self.push_bytes(&encode_frame(frame));
    }

    /// Deliver a data record to the client
    pub fn push_record(&self, record: &Record) -> Result<()> {
        self.push_frame(&record.into_frame()?);
        Ok(())
    }

    /// Close the stream from the server side
    pub fn close(&self) {
        self.pipe.borrow_mut().server_closed = true;
    }

    pub fn is_closed_by_client(&self) -> bool {
        self.pipe.borrow().client_closed
    }

    /// Accept at most `bytes` more from the client before reporting a full socket
    pub fn limit_writes(&self, bytes: Option<usize>) {
        self.pipe.borrow_mut().write_budget = bytes;
    }
}

// ----------------------------------------------------------------------------
// Manual Clock
// ----------------------------------------------------------------------------

/// Time source advanced explicitly by tests; clones share one clock
#[derive(Debug, Clone, Default)]
pub struct ManualTimeSource {
    now: Rc<Cell<u64>>,
}

impl ManualTimeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by.as_millis() as u64);
    }

    pub fn set(&self, at: Timestamp) {
        self.now.set(at.as_millis());
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.now.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use owlchat_core::Channel;

    #[test]
    fn test_pipe_round_trip() {
        let network = MemoryNetwork::new();
        let mut connector = network.connector();
        let mut transport = connector.connect(ConnectionKind::Main, "bos:5190").unwrap();

        let endpoint = network.last(ConnectionKind::Main).unwrap();
        assert_eq!(endpoint.address(), "bos:5190");

        let mut buf = [0u8; 16];
        assert_eq!(
            transport.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );

        endpoint.push_frame(&Frame::new(Channel::KeepAlive, Vec::new()).unwrap());
        assert_eq!(transport.read(&mut buf).unwrap(), 6);

        transport.write(b"abc").unwrap();
        assert_eq!(endpoint.take_written(), b"abc");

        endpoint.close();
        assert_eq!(transport.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_refused_address() {
        let network = MemoryNetwork::new();
        network.refuse("auth:5190");
        let mut connector = network.connector();
        assert!(connector.connect(ConnectionKind::Auth, "auth:5190").is_err());
        assert_eq!(network.connect_count(), 0);
    }

    #[test]
    fn test_write_budget() {
        let network = MemoryNetwork::new();
        let mut transport = network
            .connector()
            .connect(ConnectionKind::Main, "bos:5190")
            .unwrap();
        let endpoint = network.last(ConnectionKind::Main).unwrap();
        endpoint.limit_writes(Some(2));
        assert_eq!(transport.write(b"abcd").unwrap(), 2);
        assert_eq!(
            transport.write(b"cd").unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
    }

    #[test]
    fn test_manual_clock_shared() {
        let clock = ManualTimeSource::new();
        let view = clock.clone();
        clock.advance(Duration::from_millis(1500));
        assert_eq!(view.now(), Timestamp::new(1500));
    }
}
