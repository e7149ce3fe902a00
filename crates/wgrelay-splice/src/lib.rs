//! Bidirectional stream splicing with pooled buffers
//!
//! Every proxied connection is a pair of streams spliced together: bytes are
//! copied in both directions concurrently until each side reaches EOF, and a
//! half-close on one side is propagated to the other by shutting down the
//! destination. Copy buffers come from a process-wide [`BufferPool`] so the
//! data plane does not allocate per connection.

use std::sync::Mutex;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Default copy buffer size (64 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Smallest allowed copy buffer size (1 KiB).
pub const MIN_BUFFER_SIZE: usize = 1024;

/// A pool of fixed-size byte buffers shared by all spliced connections.
///
/// `get` hands out a buffer (allocating one when the free list is empty) and
/// `put` returns it. Buffers of the wrong size are dropped on return so every
/// buffer handed out has the configured size. Contents are not cleared on
/// return; the next reader overwrites them.
#[derive(Debug)]
pub struct BufferPool {
    size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Create a pool of `size`-byte buffers. Sizes below [`MIN_BUFFER_SIZE`]
    /// are raised to the minimum.
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(MIN_BUFFER_SIZE),
            free: Mutex::new(Vec::new()),
        }
    }

    /// The configured buffer size in bytes.
    pub fn buffer_size(&self) -> usize {
        self.size
    }

    /// Take a buffer from the pool.
    pub fn get(&self) -> Vec<u8> {
        let recycled = self.free.lock().expect("buffer pool poisoned").pop();
        recycled.unwrap_or_else(|| vec![0u8; self.size])
    }

    /// Return a buffer to the pool. Buffers that do not match the configured
    /// size are dropped instead of stored.
    pub fn put(&self, buf: Vec<u8>) {
        if buf.len() == self.size {
            self.free.lock().expect("buffer pool poisoned").push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

/// Copy `a -> b` and `b -> a` concurrently until both directions finish.
///
/// When one direction hits EOF or an error, its destination is shut down so
/// the peer observes the half-close while the opposite direction keeps
/// flowing. Per-direction I/O errors are swallowed; both endpoints are torn
/// down when this returns. Returns the byte counts copied `a -> b` and
/// `b -> a`.
pub async fn splice<A, B>(a: A, b: B, pool: &BufferPool) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Send,
    B: AsyncRead + AsyncWrite + Send,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    tokio::join!(
        copy_direction(a_read, b_write, pool),
        copy_direction(b_read, a_write, pool),
    )
}

/// Copy one direction to completion, then shut down the destination to
/// propagate the half-close.
async fn copy_direction<R, W>(mut src: R, mut dst: W, pool: &BufferPool) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = pool.get();
    let mut copied = 0u64;

    loop {
        match src.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if dst.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                copied += n as u64;
            }
            Err(e) => {
                trace!("splice read ended: {}", e);
                break;
            }
        }
    }

    let _ = dst.shutdown().await;
    pool.put(buf);
    copied
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn pool_enforces_minimum_size() {
        let pool = BufferPool::new(16);
        assert_eq!(pool.buffer_size(), MIN_BUFFER_SIZE);
        assert_eq!(pool.get().len(), MIN_BUFFER_SIZE);
    }

    #[test]
    fn pool_reuses_returned_buffers() {
        let pool = BufferPool::new(MIN_BUFFER_SIZE);
        let mut buf = pool.get();
        buf[0] = 0xAB;
        pool.put(buf);

        // The recycled buffer keeps its contents; only the size is uniform.
        let again = pool.get();
        assert_eq!(again.len(), MIN_BUFFER_SIZE);
        assert_eq!(again[0], 0xAB);
    }

    #[test]
    fn pool_drops_wrong_size_buffers() {
        let pool = BufferPool::new(MIN_BUFFER_SIZE);
        pool.put(vec![0u8; MIN_BUFFER_SIZE * 2]);
        assert_eq!(pool.free.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn splices_both_directions() {
        let (client_a, proxy_a) = duplex(4096);
        let (proxy_b, client_b) = duplex(4096);
        let pool = BufferPool::default();

        let splicer = tokio::spawn(async move { splice(proxy_a, proxy_b, &pool).await });

        let (mut a_read, mut a_write) = tokio::io::split(client_a);
        let (mut b_read, mut b_write) = tokio::io::split(client_b);

        a_write.write_all(b"ping").await.unwrap();
        let mut got = [0u8; 4];
        b_read.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ping");

        b_write.write_all(b"pong").await.unwrap();
        a_read.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"pong");

        a_write.shutdown().await.unwrap();
        b_write.shutdown().await.unwrap();
        let (up, down) = splicer.await.unwrap();
        assert_eq!(up, 4);
        assert_eq!(down, 4);
    }

    #[tokio::test]
    async fn transfers_large_random_payloads_in_order_both_ways() {
        const LEN: usize = 10 * 1024 * 1024;

        let (client_a, proxy_a) = duplex(64 * 1024);
        let (proxy_b, client_b) = duplex(64 * 1024);
        let pool = BufferPool::default();

        tokio::spawn(async move {
            splice(proxy_a, proxy_b, &pool).await;
        });

        let forward: Vec<u8> = (0..LEN).map(|_| rand::random()).collect();
        let backward: Vec<u8> = (0..LEN).map(|_| rand::random()).collect();
        let expect_forward = forward.clone();
        let expect_backward = backward.clone();

        let (mut a_read, mut a_write) = tokio::io::split(client_a);
        let (mut b_read, mut b_write) = tokio::io::split(client_b);

        let write_a = tokio::spawn(async move {
            a_write.write_all(&forward).await.unwrap();
            a_write.shutdown().await.unwrap();
        });
        let write_b = tokio::spawn(async move {
            b_write.write_all(&backward).await.unwrap();
            b_write.shutdown().await.unwrap();
        });

        let read_b = tokio::spawn(async move {
            let mut received = Vec::with_capacity(LEN);
            b_read.read_to_end(&mut received).await.unwrap();
            received
        });
        let mut received_backward = Vec::with_capacity(LEN);
        a_read.read_to_end(&mut received_backward).await.unwrap();

        write_a.await.unwrap();
        write_b.await.unwrap();
        assert_eq!(read_b.await.unwrap(), expect_forward);
        assert_eq!(received_backward, expect_backward);
    }

    #[tokio::test]
    async fn half_close_propagates_while_reverse_flows() {
        let (client_a, proxy_a) = duplex(4096);
        let (proxy_b, client_b) = duplex(4096);
        let pool = BufferPool::default();

        tokio::spawn(async move {
            splice(proxy_a, proxy_b, &pool).await;
        });

        let (mut a_read, mut a_write) = tokio::io::split(client_a);
        let (mut b_read, mut b_write) = tokio::io::split(client_b);

        // A closes its write side; B must observe EOF...
        a_write.shutdown().await.unwrap();
        let mut sink = Vec::new();
        b_read.read_to_end(&mut sink).await.unwrap();
        assert!(sink.is_empty());

        // ...while B can still send until it closes too.
        b_write.write_all(b"late").await.unwrap();
        b_write.shutdown().await.unwrap();

        let mut got = Vec::new();
        a_read.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"late");
    }
}
