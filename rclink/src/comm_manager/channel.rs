use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};

use crate::CMError;

/// The passive side of the rendezvous: one bind, then one accept.
#[derive(Debug)]
pub struct OobListener {
    listener: TcpListener,
    port: u16,
}

impl OobListener {
    /// Bind on all IPv4 interfaces. Port 0 asks the OS for a free port.
    pub fn bind(port: u16) -> Result<Self, CMError> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .map_err(|err| CMError::Listen(port, err))?;
        let port = listener
            .local_addr()
            .map_err(|err| CMError::Listen(port, err))?
            .port();
        crate::log::debug!("waiting on port {} for TCP connection", port);
        Ok(Self { listener, port })
    }

    #[inline]
    pub fn local_port(&self) -> u16 {
        self.port
    }

    /// Block until exactly one peer connects. No timeout.
    pub fn accept(self) -> Result<OobChannel, CMError> {
        let (stream, peer) = self.listener.accept().map_err(CMError::Accept)?;
        crate::log::info!("TCP connection was established with {}", peer);
        Ok(OobChannel { stream, peer })
    }
}

/// A connected byte stream to the peer, used for metadata and barriers.
///
/// Both peers must call [`sync_exchange`](Self::sync_exchange) the same
/// number of times, in the same order.
#[derive(Debug)]
pub struct OobChannel {
    stream: TcpStream,
    peer: SocketAddr,
}

impl OobChannel {
    /// With a `host`, connect to it; without one, listen on `port` and
    /// accept a single connection.
    pub fn connect(host: Option<&str>, port: u16) -> Result<Self, CMError> {
        match host {
            Some(host) => Self::connect_to(host, port),
            None => OobListener::bind(port)?.accept(),
        }
    }

    fn connect_to(host: &str, port: u16) -> Result<Self, CMError> {
        let target = format!("{}:{}", host, port);
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|err| CMError::Resolve(target.clone(), err))?
            .filter(SocketAddr::is_ipv4)
            .collect();

        let mut last_err = std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            "no IPv4 address found",
        );
        for addr in addrs {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    crate::log::info!("TCP connection was established with {}", addr);
                    return Ok(Self { stream, peer: addr });
                }
                Err(err) => last_err = err,
            }
        }
        crate::log::error!("failed to establish TCP connection to {}", target);
        Err(CMError::Connect(target, last_err))
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Write `local` in full, then block until `length` bytes came back.
    pub fn sync_exchange(&mut self, local: &[u8], length: usize) -> Result<Vec<u8>, CMError> {
        self.stream
            .write_all(local)
            .and_then(|_| self.stream.flush())
            .map_err(|err| CMError::Exchange(local.len(), err))?;

        let mut remote = vec![0u8; length];
        self.stream
            .read_exact(&mut remote)
            .map_err(|err| CMError::Exchange(length, err))?;
        Ok(remote)
    }

    /// One-byte round trip. The byte received is not checked.
    pub fn barrier(&mut self, tag: u8) -> Result<(), CMError> {
        self.sync_exchange(&[tag], 1).map(|_| ())
    }
}
