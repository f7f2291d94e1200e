//! Sans-IO TLS 1.0-1.2 and DTLS 1.0/1.2.
//!
//! A [`Channel`] is one connection, as client or as server. It never touches
//! a socket or a clock: the application passes in what arrived from the
//! transport and the current time, and gets outgoing bytes and decrypted
//! data back through [`Callbacks`].
//!
//! ```no_run
//! use tlswire::{Callbacks, Channel, Config};
//!
//! struct App {
//!     to_peer: Vec<Vec<u8>>,
//! }
//!
//! impl Callbacks for App {
//!     fn emit(&mut self, data: &[u8]) {
//!         self.to_peer.push(data.to_vec());
//!     }
//!
//!     fn deliver(&mut self, _sequence: u64, data: &[u8]) {
//!         println!("{}", String::from_utf8_lossy(data));
//!     }
//! }
//!
//! let config = Config::builder().server_name("example.com").build().unwrap();
//! let mut channel = Channel::client(config, App { to_peer: vec![] }).unwrap();
//! // Write channel.callbacks().to_peer to the transport, feed whatever
//! // comes back to channel.received(..), call channel.timeout_check(now)
//! // when channel.poll_timeout() says so.
//! ```
#![forbid(unsafe_code)]
#![warn(clippy::all)]
// #![deny(missing_docs)]

#[macro_use]
extern crate log;

mod alert;
mod channel;
mod config;
mod credentials;
mod crypto;
mod error;
mod handshake;
mod message;
mod policy;
mod record;
mod session;
mod timer;
mod types;
mod util;
mod window;

pub use alert::{Alert, AlertDescription, AlertLevel};
pub use channel::{Callbacks, Channel};
pub use config::{Config, ConfigBuilder};
pub use credentials::{Credentials, StaticCredentials};
pub use error::Error;
pub use policy::{DefaultPolicy, Policy};
pub use session::{InMemorySessionManager, NoopSessionManager, Session, SessionManager};
pub use types::{
    CipherSuite, CompressionMethod, HashAlgorithm, NamedGroup, ProtocolVersion, SessionId, Side,
    SignatureAlgorithm, SignatureScheme,
};
