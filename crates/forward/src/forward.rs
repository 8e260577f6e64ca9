//! Port forwarding over an SSH transport.
//!
//! Three kinds of forward share one engine per session:
//! - **Local** (`L`): listen on a local port, open a `direct-tcpip` channel
//!   to a fixed target for each connection.
//! - **Remote** (`R`): ask the server to listen, connect each inbound
//!   channel to a local target.
//! - **Dynamic** (`D`): a local SOCKS4/4a/5 proxy whose clients pick the
//!   target per connection.
//!
//! Every accepted connection becomes a tunnel with its own pair of relay
//! loops. Stopping a forward closes its listener and every tunnel socket.

mod engine;
mod error;
mod info;
mod relay;
pub mod socks;

pub use engine::ForwardEngine;
pub use error::ForwardError;
pub use info::{ForwardInfo, ForwardKind};
pub use relay::{relay, RelayEnd, Traffic};
