//! # lattice-net
//!
//! The networking subsystem of the Lattice distributed-simulation platform:
//! a uniform blocking-stream abstraction over TCP (plain and TLS), WebSockets
//! and in-memory test sockets, with length-prefixed packet framing and an
//! HTTP/1.1 client layered on top.
//!
//! ## Overview
//!
//! - [`Networking`]: process-wide init/shutdown bracket and DNS resolution
//! - [`Transport`]: the blocking byte-stream capability, shared as
//!   [`SharedTransport`] so a killer thread can cancel blocked I/O
//! - [`TcpSocket`] / [`TlsSocket`] / [`WebSocketTransport`] /
//!   [`TestSocket`]: the transport implementations
//! - [`UdpSocket`]: datagram send/receive
//! - [`PacketStream`]: length-prefixed [`Packet`] framing over any transport
//! - [`HttpClient`]: persistent connections, content-length/chunked/close
//!   bodies, redirects, streaming sinks and byte-size caps
//!
//! ## Quick start
//!
//! ```no_run
//! use lattice_net::{HttpClient, Networking};
//!
//! # fn main() -> lattice_net::Result<()> {
//! Networking::init()?;
//! let mut client = HttpClient::new();
//! let (info, body) = client.get("http://example.org/status")?;
//! println!("{}: {} bytes", info.response_code, body.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency model
//!
//! Sockets are used by one reader and one writer at a time. The exception is
//! cancellation: [`Transport::ungraceful_shutdown`] (and
//! [`HttpClient::kill`]) may be called from any thread and force a blocked
//! call to return with an error in bounded time. There are no per-call
//! timeouts; use [`Transport::readable`] before the read when one is needed.

pub mod endpoint;
pub mod error;
#[cfg(target_os = "linux")]
pub mod event_fd;
pub mod http;
pub mod packet;
pub mod packet_stream;
pub mod subsystem;
pub mod tcp;
pub mod test_socket;
pub mod tls;
pub mod transport;
pub mod udp;
pub mod websocket;

pub use self::endpoint::IpEndpoint;
pub use self::error::{NetError, Result};
#[cfg(target_os = "linux")]
pub use self::event_fd::EventFd;
pub use self::http::{
    BufferSink, DataSink, HttpClient, HttpClientConfig, KillHandle, ResponseInfo, Url,
};
pub use self::packet::{Packet, MAX_PACKET_SIZE};
pub use self::packet_stream::PacketStream;
pub use self::subsystem::Networking;
pub use self::tcp::TcpSocket;
pub use self::test_socket::TestSocket;
pub use self::tls::{load_server_config, TlsOptions, TlsSocket};
pub use self::transport::{SharedTransport, Transport, MAX_RW_CHUNK};
pub use self::udp::UdpSocket;
pub use self::websocket::{ReadyState, WebSocketTransport};
