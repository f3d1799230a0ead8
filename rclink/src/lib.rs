//! Reliable-connection RDMA between two peers.
//!
//! The crate walks one RC queue pair per process through its full life:
//! device selection, memory registration, an out-of-band TCP rendezvous to
//! trade connection metadata, the RESET -> INIT -> RTR -> RTS bring-up, and
//! a small data path (send, RDMA read, RDMA write) driven by bounded
//! completion polling.
//!
//! Hardware access goes through [`rdma_shim`]; with the default `soft`
//! feature everything runs on an in-process fabric.

#![allow(non_snake_case)]

use std::time::Duration;

/// Configuration operations
pub mod consts;
pub mod config;
pub use config::Config;

/// Abstraction for the RDMA-capable devices (RNIC)
pub mod device;
pub mod udriver;
pub use udriver::UDriver;

/// Analogy ibv_context in the ibverbs.
pub mod context;
pub use context::{Context, ProtectionDomain};

/// Abstraction for the completion queues & queue pairs
pub mod completion_queue;
pub use completion_queue::CompletionQueue;
pub mod queue_pairs;
pub use queue_pairs::{AddressMode, QueuePair, QueuePairBuilder, QueuePairStatus, RcAttributes};

/// Abstraction for the memory regions
pub mod memory_region;
pub use memory_region::MemoryRegion;

/// Out-of-band bootstrap: the TCP rendezvous and the metadata it carries
pub mod comm_manager;
pub use comm_manager::{ConnectionMetadata, OobChannel, OobListener};

pub mod resources;
pub use resources::{EndpointResources, Rendezvous};

pub mod endpoint;
pub use endpoint::{RcEndpoint, WorkKind};

pub mod messenger;
pub use messenger::RdmaMessenger;

pub mod utils;

pub use rdma_shim;
pub use rdma_shim::log;
pub(crate) use rdma_shim::Error;

/// The error type of control plane operations.
/// These mainly include error of creating QPs, MRs, etc.
#[derive(thiserror::Error, Debug)]
pub enum ControlpathError {
    #[error("create context {0} error: {1}")]
    ContextError(&'static str, Error),

    /// Used for identify create different resource error
    /// e.g., CQ, QP, etc.
    #[error("create {0} error: {1}")]
    CreationError(&'static str, Error),

    #[error("Invalid arg for {0}")]
    InvalidArg(&'static str),

    #[error("Query error: {0} w/ errono: {1}")]
    QueryError(&'static str, Error),

    #[error("IB device {0} wasn't found")]
    NoDevice(String),
}

/// The error type of data plane operations
#[derive(thiserror::Error, Debug)]
pub enum DatapathError {
    #[error("post_send error with errorno {0}")]
    PostSendError(Error),

    #[error("post_recv error with errorno {0}")]
    PostRecvError(Error),

    #[error("poll_cq error with errorno {0}")]
    PollCQError(Error),

    #[error(
        "got bad completion with status: {:#x} ({}), vendor syndrome: {:#x}, wr_id: {}",
        .status,
        rdma_shim::wc_status::status_str(*.status),
        .vendor_err,
        .wr_id
    )]
    CompletionError {
        status: u32,
        vendor_err: u32,
        wr_id: u64,
    },

    #[error("completion wasn't found in the CQ after {0:?}")]
    TimeoutError(Duration),

    #[error("endpoint is not connected")]
    NotConnected,
}

/// The error type of communication manager related.
/// This captures errors carried on during the out-of-band rendezvous.
#[derive(thiserror::Error, Debug)]
pub enum CMError {
    #[error("failed to resolve {0}: {1}")]
    Resolve(String, std::io::Error),

    #[error("failed to establish TCP connection to {0}: {1}")]
    Connect(String, std::io::Error),

    #[error("failed to listen on port {0}: {1}")]
    Listen(u16, std::io::Error),

    #[error("failed to establish TCP connection with client: {0}")]
    Accept(std::io::Error),

    #[error("failed to exchange {0} bytes with the peer: {1}")]
    Exchange(usize, std::io::Error),
}

impl CMError {
    /// Whether the peer hung up instead of answering.
    pub fn is_peer_closed(&self) -> bool {
        use std::io::ErrorKind::*;
        matches!(
            self,
            CMError::Exchange(_, err)
                if matches!(err.kind(), UnexpectedEof | ConnectionReset | BrokenPipe)
        )
    }
}

/// Failures while turning two prepared endpoints into a connected pair.
#[derive(thiserror::Error, Debug)]
pub enum HandshakeError {
    #[error("could not get gid for port {0}, index {1}: {2}")]
    LocalGid(u8, u8, ControlpathError),

    #[error("failed to exchange connection data between sides: {0}")]
    Exchange(CMError),

    #[error("failed to modify QP state to {target}: {source}")]
    Transition {
        target: QueuePairStatus,
        source: Error,
    },

    #[error("failed to post RR: {0}")]
    PrePostRecv(DatapathError),

    #[error("sync error after QPs are were moved to RTS: {0}")]
    Barrier(CMError),

    #[error("endpoint resources were already released")]
    Released,
}

/// Everything an application driving an [`RcEndpoint`] may see.
#[derive(thiserror::Error, Debug)]
pub enum RcError {
    #[error(transparent)]
    Controlpath(#[from] ControlpathError),

    #[error(transparent)]
    Datapath(#[from] DatapathError),

    #[error(transparent)]
    CM(#[from] CMError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error("invalid config: {0}")]
    Config(String),
}
