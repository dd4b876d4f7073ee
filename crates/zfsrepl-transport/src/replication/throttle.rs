//! Rate-limited copy between the send and receive sides

use std::num::NonZeroU64;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

/// Largest chunk moved per read
const MAX_CHUNK: usize = 128 * 1024;
/// Smallest chunk the limiter schedules
const MIN_CHUNK: usize = 512;

/// Paces a byte stream to a fixed rate
///
/// Tracks bytes moved since the first write and asks the caller to sleep
/// whenever the stream is ahead of `limit` bytes per second.
#[derive(Debug, Clone)]
pub struct BandwidthLimiter {
    limit: NonZeroU64,
    started: Option<Instant>,
    transferred: u64,
}

impl BandwidthLimiter {
    /// Limit to `limit` bytes per second
    #[must_use]
    pub fn new(limit: NonZeroU64) -> Self {
        Self {
            limit,
            started: None,
            transferred: 0,
        }
    }

    /// Configured rate in bytes per second
    #[must_use]
    pub fn limit(&self) -> NonZeroU64 {
        self.limit
    }

    /// Chunk size that keeps pacing smooth (about 1/8 s of data)
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        let eighth = usize::try_from(self.limit.get() / 8).unwrap_or(MAX_CHUNK);
        eighth.clamp(MIN_CHUNK, MAX_CHUNK)
    }

    /// Record `bytes` moved and return how long to sleep
    pub fn register(&mut self, bytes: usize) -> Duration {
        let started = *self.started.get_or_insert_with(Instant::now);
        self.register_at(bytes, started.elapsed())
    }

    fn register_at(&mut self, bytes: usize, elapsed: Duration) -> Duration {
        self.transferred = self.transferred.saturating_add(bytes as u64);
        let due_micros =
            u128::from(self.transferred) * 1_000_000 / u128::from(self.limit.get());
        let due = Duration::from_micros(u64::try_from(due_micros).unwrap_or(u64::MAX));
        due.saturating_sub(elapsed)
    }
}

/// Copy `reader` into `writer`, pacing with `limiter` when given
///
/// Shuts `writer` down at end of stream so the receiving side sees EOF.
/// Returns the number of bytes copied.
pub async fn copy_limited<R, W>(
    reader: &mut R,
    writer: &mut W,
    mut limiter: Option<BandwidthLimiter>,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let chunk = limiter
        .as_ref()
        .map_or(MAX_CHUNK, BandwidthLimiter::chunk_size);
    let mut buf = vec![0u8; chunk];
    let mut copied = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        copied += n as u64;

        if let Some(limiter) = limiter.as_mut() {
            let pause = limiter.register(n);
            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
        }
    }

    writer.shutdown().await?;
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit(bytes: u64) -> NonZeroU64 {
        NonZeroU64::new(bytes).unwrap()
    }

    #[test]
    fn test_register_requests_sleep_when_ahead() {
        let mut limiter = BandwidthLimiter::new(limit(1000));
        assert_eq!(
            limiter.register_at(500, Duration::ZERO),
            Duration::from_millis(500)
        );
        assert_eq!(
            limiter.register_at(500, Duration::from_millis(600)),
            Duration::from_millis(400)
        );
    }

    #[test]
    fn test_register_no_sleep_when_behind() {
        let mut limiter = BandwidthLimiter::new(limit(1000));
        assert_eq!(
            limiter.register_at(100, Duration::from_secs(1)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_chunk_size_bounds() {
        assert_eq!(BandwidthLimiter::new(limit(1)).chunk_size(), MIN_CHUNK);
        assert_eq!(BandwidthLimiter::new(limit(80_000)).chunk_size(), 10_000);
        assert_eq!(
            BandwidthLimiter::new(limit(u64::MAX)).chunk_size(),
            MAX_CHUNK
        );
    }

    #[tokio::test]
    async fn test_copy_unlimited() {
        let data = vec![7u8; 300_000];
        let mut reader: &[u8] = &data;
        let mut out = Vec::new();

        let copied = copy_limited(&mut reader, &mut out, None).await.unwrap();

        assert_eq!(copied, 300_000);
        assert_eq!(out, data);
    }

    #[tokio::test(start_paused = true)]
    async fn test_copy_limited_is_paced() {
        let data = vec![1u8; 4096];
        let mut reader: &[u8] = &data;
        let mut out = Vec::new();
        let started = Instant::now();

        copy_limited(&mut reader, &mut out, Some(BandwidthLimiter::new(limit(1024))))
            .await
            .unwrap();

        assert_eq!(out.len(), 4096);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }
}
