use settings::constants::forward::{HALF_CLOSE_GRACE, RELAY_BUFFER_SIZE};
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Byte counters shared by every tunnel of a forward.
#[derive(Debug, Default)]
pub struct Traffic {
    sent: AtomicU64,
    received: AtomicU64,
}

impl Traffic {
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub enum RelayEnd {
    /// One side reached end-of-stream and the other finished or ran out of
    /// grace time.
    Closed,
    Cancelled,
    Failed(io::Error),
}

/// Copy bytes both ways between a local socket and an SSH channel stream
/// until either side closes, one fails, or `cancel` fires.
///
/// End-of-stream on one side shuts down the write half of the other, which
/// then gets [`HALF_CLOSE_GRACE`] to flush a final response. Both streams
/// are dropped on return, which closes them.
pub async fn relay<L, R>(
    local: L,
    remote: R,
    traffic: &Traffic,
    cancel: &CancellationToken,
) -> RelayEnd
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (local_read, local_write) = tokio::io::split(local);
    let (remote_read, remote_write) = tokio::io::split(remote);
    let outbound = pump(local_read, remote_write, &traffic.sent);
    let inbound = pump(remote_read, local_write, &traffic.received);

    tokio::select! {
        biased;
        _ = cancel.cancelled() => RelayEnd::Cancelled,
        result = until_either_closes(outbound, inbound) => match result {
            Ok(()) => RelayEnd::Closed,
            Err(error) => RelayEnd::Failed(error),
        },
    }
}

async fn until_either_closes<A, B>(outbound: A, inbound: B) -> io::Result<()>
where
    A: Future<Output = io::Result<()>>,
    B: Future<Output = io::Result<()>>,
{
    tokio::pin!(outbound);
    tokio::pin!(inbound);
    let outbound_closed = tokio::select! {
        result = &mut outbound => {
            result?;
            true
        }
        result = &mut inbound => {
            result?;
            false
        }
    };
    if outbound_closed {
        drain(inbound).await
    } else {
        drain(outbound).await
    }
}

async fn drain(rest: impl Future<Output = io::Result<()>>) -> io::Result<()> {
    tokio::time::timeout(HALF_CLOSE_GRACE, rest)
        .await
        .unwrap_or(Ok(()))
}

async fn pump<R, W>(mut reader: R, mut writer: W, counter: &AtomicU64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let read = reader.read(&mut buf).await?;
        if read == 0 {
            writer.shutdown().await?;
            return Ok(());
        }
        writer.write_all(&buf[..read]).await?;
        counter.fetch_add(read as u64, Ordering::Relaxed);
    }
}
