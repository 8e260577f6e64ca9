//! Shell I/O pump.

use crate::OutputBuffer;
use parking_lot::Mutex;
use settings::constants::terminal::MAX_DIMENSION;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use transport::{PtySize, ShellChannel, ShellControl, TransportError};

/// Why a pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// The remote side closed the channel or the link died.
    EndOfStream,
    /// [`ShellPump::stop`] was called.
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum PumpError {
    #[error("Shell is not running")]
    Closed,
    #[error("Invalid terminal size {cols}x{rows}")]
    InvalidSize { cols: u16, rows: u16 },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Moves output from a shell channel into an [`OutputBuffer`] and forwards
/// input and resizes to the channel.
///
/// One pump task runs per session. Output is appended in channel order;
/// when the channel ends, the exit callback runs exactly once. Dropping the
/// pump stops it.
pub struct ShellPump {
    control: ShellControl,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
    size: Mutex<PtySize>,
}

impl ShellPump {
    /// Start pumping `channel` into `buffer`.
    ///
    /// `on_exit` runs on the pump task after the last chunk was appended.
    pub fn spawn<F>(channel: ShellChannel, size: PtySize, buffer: Arc<OutputBuffer>, on_exit: F) -> Self
    where
        F: FnOnce(PumpExit) + Send + 'static,
    {
        let ShellChannel {
            mut output,
            control,
        } = channel;
        let cancel = CancellationToken::new();
        let running = Arc::new(AtomicBool::new(true));

        tokio::spawn({
            let cancel = cancel.clone();
            let running = running.clone();
            async move {
                let exit = loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break PumpExit::Stopped,
                        chunk = output.recv() => match chunk {
                            Some(bytes) => buffer.append(&bytes),
                            None => break PumpExit::EndOfStream,
                        },
                    }
                };
                running.store(false, Ordering::SeqCst);
                tracing::debug!(?exit, "Shell pump finished");
                on_exit(exit);
            }
        });

        Self {
            control,
            cancel,
            running,
            size: Mutex::new(size),
        }
    }

    /// Write keystrokes to the shell. Completes once the channel accepted them.
    pub async fn send_input(&self, data: &[u8]) -> Result<(), PumpError> {
        if !self.is_running() {
            return Err(PumpError::Closed);
        }
        self.control.write(data.to_vec()).await?;
        Ok(())
    }

    /// Send a window-change request.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), PumpError> {
        if cols == 0 || rows == 0 || cols > MAX_DIMENSION || rows > MAX_DIMENSION {
            return Err(PumpError::InvalidSize { cols, rows });
        }
        if !self.is_running() {
            return Err(PumpError::Closed);
        }
        let size = PtySize { cols, rows };
        self.control.resize(size).await?;
        *self.size.lock() = size;
        Ok(())
    }

    pub fn size(&self) -> PtySize {
        *self.size.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop pumping and close the channel. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.control.close();
    }
}

impl Drop for ShellPump {
    fn drop(&mut self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!("Dropping shell pump, closing channel");
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use transport::fake::FakeServer;
    use transport::{AuthMethod, ConnectParams, Transport};

    async fn fake_shell() -> (FakeServer, Arc<dyn Transport>, ShellChannel) {
        let server = FakeServer::new().with_account("u", "p");
        let params = ConnectParams::new("h", 22, "u", AuthMethod::Password("p".into()));
        let transport = server.connector().connect(&params).await.unwrap();
        let shell = transport
            .open_shell(PtySize::default(), "xterm-256color")
            .await
            .unwrap();
        (server, transport, shell)
    }

    async fn wait_for(buffer: &OutputBuffer, len: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while buffer.len() < len {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("output should arrive");
    }

    #[tokio::test]
    async fn input_is_echoed_in_order() {
        let (_server, _transport, shell) = fake_shell().await;
        let buffer = Arc::new(OutputBuffer::new());
        let pump = ShellPump::spawn(shell, PtySize::default(), buffer.clone(), |_| {});

        pump.send_input(b"A").await.unwrap();
        pump.send_input(b"B").await.unwrap();
        wait_for(&buffer, 2).await;
        assert_eq!(buffer.drain_text(), "AB");
    }

    #[tokio::test]
    async fn end_of_stream_runs_callback_once() {
        let (server, _transport, shell) = fake_shell().await;
        let buffer = Arc::new(OutputBuffer::new());
        let (tx, rx) = oneshot::channel();
        let pump = ShellPump::spawn(shell, PtySize::default(), buffer, move |exit| {
            let _ = tx.send(exit);
        });

        server.last_transport().unwrap().drop_link();
        let exit = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
        assert_eq!(exit, PumpExit::EndOfStream);
        assert!(!pump.is_running());
        assert!(matches!(pump.send_input(b"x").await, Err(PumpError::Closed)));
    }

    #[tokio::test]
    async fn output_before_exit_is_kept() {
        let (_server, _transport, shell) = fake_shell().await;
        let buffer = Arc::new(OutputBuffer::new());
        let (tx, rx) = oneshot::channel();
        let pump = ShellPump::spawn(shell, PtySize::default(), buffer.clone(), move |exit| {
            let _ = tx.send(exit);
        });

        pump.send_input(b"exit\n").await.unwrap();
        assert_eq!(rx.await.unwrap(), PumpExit::EndOfStream);
        assert_eq!(buffer.drain_text(), "exit\n");
    }

    #[tokio::test]
    async fn stop_reports_stopped() {
        let (_server, _transport, shell) = fake_shell().await;
        let (tx, rx) = oneshot::channel();
        let pump = ShellPump::spawn(shell, PtySize::default(), Arc::default(), move |exit| {
            let _ = tx.send(exit);
        });
        pump.stop();
        pump.stop();
        assert_eq!(rx.await.unwrap(), PumpExit::Stopped);
        assert!(!pump.is_running());
    }

    #[tokio::test]
    async fn resize_is_forwarded_and_validated() {
        let (server, _transport, shell) = fake_shell().await;
        let pump = ShellPump::spawn(shell, PtySize::default(), Arc::default(), |_| {});

        pump.resize(120, 40).await.unwrap();
        assert_eq!(pump.size(), PtySize { cols: 120, rows: 40 });
        assert_eq!(
            server.last_transport().unwrap().resizes(),
            vec![PtySize { cols: 120, rows: 40 }]
        );

        assert!(matches!(
            pump.resize(0, 40).await,
            Err(PumpError::InvalidSize { cols: 0, rows: 40 })
        ));
        assert_eq!(pump.size(), PtySize { cols: 120, rows: 40 });
    }
}
