//! String messages over one RC connection.
//!
//! The listener only ever touches its own buffer; the connector moves the
//! data with RDMA reads and writes against it. Every call is framed by
//! barriers, so both peers must pair their calls: a server `write` with a
//! client `read`, and a client `write` with a server `read`.

use crate::consts::{SYNC_READ, SYNC_WRITE};
use crate::{Config, OobListener, RcEndpoint, RcError, WorkKind};

#[derive(Debug)]
pub struct RdmaMessenger {
    endpoint: RcEndpoint,
}

impl RdmaMessenger {
    /// Wait for one client on `port`.
    pub fn init_server(port: u16) -> Result<Self, RcError> {
        let config = Config {
            tcp_port: port,
            ..Default::default()
        };
        Ok(Self::from_endpoint(RcEndpoint::connect(&config)?))
    }

    /// Serve on a listener bound by the caller.
    pub fn init_server_on(listener: OobListener) -> Result<Self, RcError> {
        let config = Config {
            tcp_port: listener.local_port(),
            ..Default::default()
        };
        Ok(Self::from_endpoint(RcEndpoint::accept(&config, listener)?))
    }

    pub fn init_client(host: &str, port: u16) -> Result<Self, RcError> {
        let config = Config {
            server_name: Some(host.to_string()),
            tcp_port: port,
            receiving_side: true,
            ..Default::default()
        };
        Ok(Self::from_endpoint(RcEndpoint::connect(&config)?))
    }

    pub fn from_endpoint(endpoint: RcEndpoint) -> Self {
        Self { endpoint }
    }

    #[inline]
    pub fn is_server(&self) -> bool {
        self.endpoint.config().is_server()
    }

    #[inline]
    pub fn endpoint(&self) -> &RcEndpoint {
        &self.endpoint
    }

    /// Server: publish `contents` in the local buffer for the client to read.
    /// Client: RDMA-write `contents` into the server's buffer.
    pub fn write(&mut self, contents: &str) -> Result<(), RcError> {
        if self.is_server() {
            self.endpoint.buffer()?.write_message(contents)?;
            self.endpoint.sync(SYNC_READ)?;
        } else {
            self.endpoint.sync(SYNC_READ)?;
            self.endpoint.buffer()?.write_message(contents)?;
            self.endpoint.post_send(WorkKind::RdmaWrite)?;
            self.endpoint.poll_completion()?;
            self.endpoint.sync(SYNC_WRITE)?;
        }
        Ok(())
    }

    /// Server: wait for the client's write and return it.
    /// Client: RDMA-read the server's buffer.
    pub fn read(&mut self) -> Result<String, RcError> {
        if self.is_server() {
            self.endpoint.sync(SYNC_READ)?;
            self.endpoint.sync(SYNC_WRITE)?;
        } else {
            self.endpoint.sync(SYNC_READ)?;
            self.endpoint.post_send(WorkKind::RdmaRead)?;
            self.endpoint.poll_completion()?;
        }
        Ok(self.endpoint.buffer()?.read_message())
    }

    /// Release all resources. Safe to call more than once.
    pub fn destroy(&mut self) {
        self.endpoint.teardown();
    }
}
