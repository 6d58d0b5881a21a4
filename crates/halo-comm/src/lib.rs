//! Inter-process communication for the Halo framework.
//!
//! Every cross-process interaction is explicit message passing:
//!
//! - [`Transport`] moves tagged byte payloads between processes and
//!   provides the blocking collectives the step driver relies on
//!   (neighbour exchange, all-to-all, min-reduce, gather, broadcast).
//! - [`message`] defines the wire messages and [`codec`] their framing.
//! - [`FetchServer`] answers remote cell reads on a background thread;
//!   [`RemoteFieldProxy`] is the client side, one endpoint per process.
//!
//! [`LocalCluster`] is the shipped transport: one endpoint per thread,
//! connected by unbounded crossbeam channels.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod codec;
pub mod error;
pub mod local;
pub mod message;
pub mod proxy;
pub mod rpc;
pub mod transport;

pub use error::CommError;
pub use local::{LocalCluster, LocalEndpoint};
pub use message::{
    FetchOutcome, FetchRequest, FetchResponse, FieldParcel, HaloBatch, HaloPacket,
    MigrationPacket, Transportee,
};
pub use proxy::RemoteFieldProxy;
pub use rpc::{
    EndpointDirectory, FetchEndpoint, FetchHandler, FetchServer, LocalDirectory, OwnedCellHandler,
};
pub use transport::{Tag, Transport};

/// Magic bytes at the start of every framed message.
pub const MAGIC: [u8; 4] = *b"HALO";

/// Current wire format version.
pub const FORMAT_VERSION: u8 = 1;
