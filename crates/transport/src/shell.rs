//! Plumbing between an interactive channel and whoever pumps it.
//!
//! The channel itself is owned by a driver task inside the transport. The
//! driver pushes output chunks into a bounded queue and services
//! [`ShellRequest`]s one at a time, acknowledging each once the channel
//! accepted it, so a caller's `write` completes only after the bytes are
//! handed to the channel's own flow control.

use crate::{PtySize, Result, TransportError};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

const REQUEST_QUEUE_DEPTH: usize = 32;

pub enum ShellRequest {
    Write {
        data: Vec<u8>,
        ack: oneshot::Sender<Result<()>>,
    },
    Resize {
        size: PtySize,
        ack: oneshot::Sender<Result<()>>,
    },
}

/// Both halves of an open shell, as handed out by `Transport::open_shell`.
pub struct ShellChannel {
    /// Output chunks in channel order. Closed when the channel ends.
    pub output: mpsc::Receiver<Vec<u8>>,
    pub control: ShellControl,
}

/// Handle for writing to, resizing, and closing a shell channel.
#[derive(Clone)]
pub struct ShellControl {
    requests: mpsc::Sender<ShellRequest>,
    closed: CancellationToken,
}

impl ShellControl {
    /// Create a control handle plus the request queue and close signal a
    /// driver task consumes.
    pub fn new() -> (Self, mpsc::Receiver<ShellRequest>, CancellationToken) {
        let (requests, rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let closed = CancellationToken::new();
        (
            Self {
                requests,
                closed: closed.clone(),
            },
            rx,
            closed,
        )
    }

    pub async fn write(&self, data: Vec<u8>) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.submit(ShellRequest::Write { data, ack }, done).await
    }

    pub async fn resize(&self, size: PtySize) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.submit(ShellRequest::Resize { size, ack }, done).await
    }

    /// Ask the driver to close the channel. Idempotent, never blocks.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.requests.is_closed()
    }

    async fn submit(&self, request: ShellRequest, done: oneshot::Receiver<Result<()>>) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.requests
            .send(request)
            .await
            .map_err(|_| TransportError::Closed)?;
        done.await.map_err(|_| TransportError::Closed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_is_acknowledged_by_driver() {
        let (control, mut requests, _closed) = ShellControl::new();
        let driver = tokio::spawn(async move {
            match requests.recv().await {
                Some(ShellRequest::Write { data, ack }) => {
                    let _ = ack.send(Ok(()));
                    data
                }
                _ => Vec::new(),
            }
        });
        control.write(b"ls\n".to_vec()).await.unwrap();
        assert_eq!(driver.await.unwrap(), b"ls\n");
    }

    #[tokio::test]
    async fn requests_fail_once_driver_is_gone() {
        let (control, requests, _closed) = ShellControl::new();
        drop(requests);
        assert!(matches!(
            control.resize(PtySize::default()).await,
            Err(TransportError::Closed)
        ));
        assert!(control.is_closed());
    }

    #[tokio::test]
    async fn close_is_observed_and_blocks_further_writes() {
        let (control, _requests, closed) = ShellControl::new();
        control.close();
        control.close();
        assert!(closed.is_cancelled());
        assert!(matches!(control.write(vec![1]).await, Err(TransportError::Closed)));
    }
}
