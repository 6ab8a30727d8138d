//! Byte transports
//!
//! A [`Transport`] is one non-blocking bidirectional byte stream. The
//! scheduler polls transports that expose a [`mio::event::Source`]; those
//! that do not (in-memory test transports) are serviced on every iteration.
//! A [`Connector`] opens transports for the session.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};

use mio::net::TcpStream;
use owlchat_core::{ConnectionKind, ProxyConfig};
use tracing::{debug, trace};

// ----------------------------------------------------------------------------
// Transport Traits
// ----------------------------------------------------------------------------

/// Non-blocking byte stream owned by one connection
pub trait Transport {
    /// Read available bytes; `Ok(0)` means the peer closed the stream
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write as much of `buf` as the stream accepts right now
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Drive connection establishment: `Ok(true)` once usable, `Ok(false)`
    /// while still in progress
    fn poll_connect(&mut self) -> io::Result<bool>;

    /// Readiness source to register with the poller, if any
    fn source(&mut self) -> Option<&mut dyn mio::event::Source>;

    /// Close both directions; idempotent
    fn shutdown(&mut self);

    /// Address this transport was opened to
    fn peer(&self) -> &str;
}

/// Opens transports on behalf of the session
pub trait Connector {
    fn connect(&mut self, kind: ConnectionKind, address: &str) -> io::Result<Box<dyn Transport>>;
}

// ----------------------------------------------------------------------------
// TCP Transport
// ----------------------------------------------------------------------------

fn resolve(address: &str) -> io::Result<SocketAddr> {
    address.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{} did not resolve", address),
        )
    })
}

fn split_host_port(address: &str) -> io::Result<(String, u16)> {
    let (host, port) = address.rsplit_once(':').ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("{} is not host:port", address))
    })?;
    let port = port.parse::<u16>().map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("bad port in {}", address))
    })?;
    Ok((host.trim_matches(|c| c == '[' || c == ']').to_string(), port))
}

/// TCP stream registered with the poller, optionally tunnelled through SOCKS5
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    peer: String,
    connected: bool,
    socks: Option<Socks5Handshake>,
}

impl TcpTransport {
    /// Start a non-blocking connect to `address`
    pub fn connect(address: &str) -> io::Result<Self> {
        let addr = resolve(address)?;
        debug!("Connecting to {} ({})", address, addr);
        Ok(Self {
            stream: TcpStream::connect(addr)?,
            peer: address.to_string(),
            connected: false,
            socks: None,
        })
    }

    /// Start a non-blocking connect to `address` through a SOCKS5 proxy
    pub fn connect_via(proxy: &ProxyConfig, address: &str) -> io::Result<Self> {
        let (host, port) = split_host_port(address)?;
        let proxy_addr = resolve(&proxy.address)?;
        debug!("Connecting to {} via proxy {}", address, proxy.address);
        Ok(Self {
            stream: TcpStream::connect(proxy_addr)?,
            peer: address.to_string(),
            connected: false,
            socks: Some(Socks5Handshake::new(
                host,
                port,
                proxy.username.clone(),
                proxy.password.clone(),
            )),
        })
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn poll_connect(&mut self) -> io::Result<bool> {
        if !self.connected {
            if let Some(err) = self.stream.take_error()? {
                return Err(err);
            }
            match self.stream.peer_addr() {
                Ok(_) => self.connected = true,
                Err(err)
                    if err.kind() == io::ErrorKind::NotConnected
                        || err.kind() == io::ErrorKind::WouldBlock =>
                {
                    return Ok(false)
                }
                Err(err) => return Err(err),
            }
        }
        if let Some(socks) = self.socks.as_mut() {
            if !socks.poll(&mut self.stream)? {
                return Ok(false);
            }
            trace!("Proxy tunnel to {} established", self.peer);
            self.socks = None;
        }
        Ok(true)
    }

    fn source(&mut self) -> Option<&mut dyn mio::event::Source> {
        Some(&mut self.stream)
    }

    fn shutdown(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}

/// Connector producing [`TcpTransport`]s
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    proxy: Option<ProxyConfig>,
}

impl TcpConnector {
    pub fn new(proxy: Option<ProxyConfig>) -> Self {
        Self { proxy }
    }
}

impl Connector for TcpConnector {
    fn connect(&mut self, kind: ConnectionKind, address: &str) -> io::Result<Box<dyn Transport>> {
        debug!("Opening {} transport to {}", kind, address);
        let transport = match &self.proxy {
            Some(proxy) => TcpTransport::connect_via(proxy, address)?,
            None => TcpTransport::connect(address)?,
        };
        Ok(Box::new(transport))
    }
}

// ----------------------------------------------------------------------------
// SOCKS5 Negotiation
// ----------------------------------------------------------------------------

const SOCKS_VERSION: u8 = 0x05;
const SOCKS_AUTH_VERSION: u8 = 0x01;
const METHOD_NONE: u8 = 0x00;
const METHOD_PASSWORD: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xff;
const COMMAND_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocksStage {
    Greeting,
    Method,
    Password,
    Request,
    Reply,
    Done,
}

fn proxy_error(reason: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionRefused, reason.into())
}

/// Client side of a SOCKS5 CONNECT, driven by readiness
#[derive(Debug)]
struct Socks5Handshake {
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    stage: SocksStage,
    out: Vec<u8>,
    input: Vec<u8>,
}

impl Socks5Handshake {
    fn new(host: String, port: u16, username: Option<String>, password: Option<String>) -> Self {
        Self {
            host,
            port,
            username,
            password,
            stage: SocksStage::Greeting,
            out: Vec::new(),
            input: Vec::new(),
        }
    }

    /// Flush queued bytes; `Ok(false)` when the socket is full
    fn flush(&mut self, stream: &mut impl Write) -> io::Result<bool> {
        while !self.out.is_empty() {
            match stream.write(&self.out) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.out.drain(..n);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) => return Err(err),
            }
        }
        Ok(true)
    }

    /// Read until `input` holds `needed` bytes; never reads past them
    fn fill(&mut self, stream: &mut impl Read, needed: usize) -> io::Result<bool> {
        let mut chunk = [0u8; 64];
        while self.input.len() < needed {
            let want = (needed - self.input.len()).min(chunk.len());
            match stream.read(&mut chunk[..want]) {
                Ok(0) => return Err(proxy_error("proxy closed the connection")),
                Ok(n) => self.input.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) => return Err(err),
            }
        }
        Ok(true)
    }

    fn queue_request(&mut self) -> io::Result<()> {
        if self.host.len() > 255 {
            return Err(proxy_error("target host name too long"));
        }
        self.out.extend_from_slice(&[SOCKS_VERSION, COMMAND_CONNECT, 0x00, ATYP_DOMAIN]);
        self.out.push(self.host.len() as u8);
        self.out.extend_from_slice(self.host.as_bytes());
        self.out.extend_from_slice(&self.port.to_be_bytes());
        self.stage = SocksStage::Request;
        Ok(())
    }

    fn queue_credentials(&mut self) -> io::Result<()> {
        let user = self.username.as_deref().unwrap_or_default();
        let pass = self.password.as_deref().unwrap_or_default();
        let (Ok(user_len), Ok(pass_len)) = (u8::try_from(user.len()), u8::try_from(pass.len()))
        else {
            return Err(proxy_error("proxy credentials longer than 255 bytes"));
        };
        let mut request = Vec::with_capacity(3 + user.len() + pass.len());
        request.push(SOCKS_AUTH_VERSION);
        request.push(user_len);
        request.extend_from_slice(user.as_bytes());
        request.push(pass_len);
        request.extend_from_slice(pass.as_bytes());
        self.out.extend_from_slice(&request);
        self.stage = SocksStage::Password;
        Ok(())
    }

    /// Advance the negotiation; `Ok(true)` once the tunnel is open
    fn poll<S: Read + Write>(&mut self, stream: &mut S) -> io::Result<bool> {
        loop {
            if !self.flush(stream)? {
                return Ok(false);
            }
            match self.stage {
                SocksStage::Greeting => {
                    let method = if self.username.is_some() {
                        METHOD_PASSWORD
                    } else {
                        METHOD_NONE
                    };
                    self.out.extend_from_slice(&[SOCKS_VERSION, 0x01, method]);
                    self.stage = SocksStage::Method;
                }
                SocksStage::Method => {
                    if !self.fill(stream, 2)? {
                        return Ok(false);
                    }
                    let reply = std::mem::take(&mut self.input);
                    if reply[0] != SOCKS_VERSION {
                        return Err(proxy_error("proxy is not SOCKS5"));
                    }
                    match reply[1] {
                        METHOD_NONE => self.queue_request()?,
                        METHOD_PASSWORD => self.queue_credentials()?,
                        METHOD_UNACCEPTABLE => {
                            return Err(proxy_error("proxy rejected every auth method"))
                        }
                        other => {
                            return Err(proxy_error(format!("unsupported proxy method {}", other)))
                        }
                    }
                }
                SocksStage::Password => {
                    if !self.fill(stream, 2)? {
                        return Ok(false);
                    }
                    let reply = std::mem::take(&mut self.input);
                    if reply[1] != 0x00 {
                        return Err(proxy_error("proxy rejected credentials"));
                    }
                    self.queue_request()?;
                }
                SocksStage::Request => {
                    self.stage = SocksStage::Reply;
                }
                SocksStage::Reply => {
                    if !self.fill(stream, 5)? {
                        return Ok(false);
                    }
                    if self.input[1] != 0x00 {
                        return Err(proxy_error(format!(
                            "proxy connect failed with code {}",
                            self.input[1]
                        )));
                    }
                    let total = match self.input[3] {
                        ATYP_IPV4 => 4 + 4 + 2,
                        ATYP_IPV6 => 4 + 16 + 2,
                        ATYP_DOMAIN => 4 + 1 + self.input[4] as usize + 2,
                        other => {
                            return Err(proxy_error(format!("bad proxy address type {}", other)))
                        }
                    };
                    if !self.fill(stream, total)? {
                        return Ok(false);
                    }
                    self.input.clear();
                    self.stage = SocksStage::Done;
                }
                SocksStage::Done => return Ok(true),
            }
        }
    }
}
