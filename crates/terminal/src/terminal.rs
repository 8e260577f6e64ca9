//! Interactive shell plumbing.
//!
//! A [`ShellPump`] moves output from a remote shell channel into an
//! [`OutputBuffer`] that the bridge drains on each poll, and forwards
//! keystrokes and resizes the other way.

mod output_buffer;
mod pump;

pub use output_buffer::OutputBuffer;
pub use pump::{PumpError, PumpExit, ShellPump};
