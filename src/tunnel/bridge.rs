use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

const BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEnd {
    /// One side closed its write half.
    Eof,
    /// One side failed mid-transfer.
    Error(String),
    /// Torn down from outside.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeOutcome {
    pub a_to_b: u64,
    pub b_to_a: u64,
    pub end: BridgeEnd,
}

/// Relays bytes both ways until either direction ends or `cancel` fires,
/// then closes both streams. There is no half-open phase.
pub async fn bridge<A, B>(a: A, b: B, cancel: CancellationToken) -> BridgeOutcome
where
    A: AsyncRead + AsyncWrite + Send,
    B: AsyncRead + AsyncWrite + Send,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let mut a_to_b = 0u64;
    let mut b_to_a = 0u64;

    let end = tokio::select! {
        _ = cancel.cancelled() => BridgeEnd::Cancelled,
        end = pump(&mut a_read, &mut b_write, &mut a_to_b) => end,
        end = pump(&mut b_read, &mut a_write, &mut b_to_a) => end,
    };

    // Both sides go down together; errors here only mean the peer is already gone.
    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;
    drop((a_read, a_write, b_read, b_write));

    debug!(
        "Bridge closed ({:?}): {} bytes a->b, {} bytes b->a",
        end, a_to_b, b_to_a
    );

    BridgeOutcome { a_to_b, b_to_a, end }
}

async fn pump<R, W>(reader: &mut ReadHalf<R>, writer: &mut WriteHalf<W>, moved: &mut u64) -> BridgeEnd
where
    R: AsyncRead,
    W: AsyncWrite,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return BridgeEnd::Eof,
            Ok(n) => n,
            Err(e) => return BridgeEnd::Error(e.to_string()),
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            return BridgeEnd::Error(e.to_string());
        }
        if let Err(e) = writer.flush().await {
            return BridgeEnd::Error(e.to_string());
        }
        *moved += n as u64;
    }
}
