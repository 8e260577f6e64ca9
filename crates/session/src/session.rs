//! Session registry and request bridge for skiff.
//!
//! A [`SessionRegistry`] owns every [`Session`]; each session owns its
//! transport, shell pump, SFTP façade, transfers and forwards, and tears
//! all of them down together. [`Bridge`] maps typed [`Request`]s onto the
//! registry and answers with a flat [`Response`] envelope.

mod bridge;
mod error;
pub mod probe;
pub mod profiles;
pub mod protocol;
mod registry;
mod state;

pub use bridge::Bridge;
pub use error::SessionError;
pub use profiles::{ConnectionProfile, ProfileStore, SavedConnection};
pub use protocol::{Payload, Request, Response};
pub use registry::SessionRegistry;
pub use state::{Session, SessionState, SessionStatus};
