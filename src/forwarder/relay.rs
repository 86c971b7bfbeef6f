use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// 数据复制缓冲区大小（64KB 适合高吞吐）
const COPY_BUFFER_SIZE: usize = 65536;

/// 带空闲超时的单向复制
///
/// 连接在 `idle_timeout` 内没有任何数据时返回 `TimedOut`。
async fn copy_with_idle_timeout<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle_timeout: Duration,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total_copied = 0u64;

    loop {
        let n = match timeout(idle_timeout, reader.read(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "Connection idle timeout",
                ));
            }
        };

        if n == 0 {
            break;
        }

        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total_copied += n as u64;
    }

    // 对端可能已经关闭，关闭写端失败不影响已复制的数据
    let _ = writer.shutdown().await;
    Ok(total_copied)
}

/// 双向转发，直到两个方向都结束
///
/// 返回 (客户端→上游字节数, 上游→客户端字节数)，单个方向的错误只记为 0。
pub async fn relay<A, B>(client: A, upstream: B, idle_timeout: Duration) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let client_to_upstream =
        copy_with_idle_timeout(&mut client_read, &mut upstream_write, idle_timeout);
    let upstream_to_client =
        copy_with_idle_timeout(&mut upstream_read, &mut client_write, idle_timeout);

    let (sent, received) = tokio::join!(client_to_upstream, upstream_to_client);

    if let Err(e) = &sent {
        tracing::debug!("Client to upstream copy ended: {}", e);
    }
    if let Err(e) = &received {
        tracing::debug!("Upstream to client copy ended: {}", e);
    }

    (sent.unwrap_or(0), received.unwrap_or(0))
}
