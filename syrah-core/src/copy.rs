//! Bidirectional byte splicing with optional throttling.
//!
//! The teacher's `agent-core::copy` implements a zero-copy
//! `BufferedSplitter`/`ResizeBufRead` pair tuned for very high connection
//! volume. A debugging proxy doesn't need that; what it does need is a place
//! to hook bandwidth limiting, latency injection, and probabilistic packet
//! loss per spec.md §4.8 "Throttling" before bytes cross the wire, so this is
//! a plain `tokio::io::copy`-based splice with a throttle hook on each
//! direction.

use std::time::{Duration, Instant};

use bytes::BytesMut;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tracing::trace;

/// A simple token bucket: `rate` bytes refill per second, up to `burst`.
pub struct TokenBucket {
	rate: f64,
	burst: f64,
	state: AsyncMutex<(f64, Instant)>,
}

impl TokenBucket {
	pub fn new(bytes_per_sec: u64, burst: u64) -> Self {
		Self {
			rate: bytes_per_sec as f64,
			burst: burst as f64,
			state: AsyncMutex::new((burst as f64, Instant::now())),
		}
	}

	/// Blocks until `n` bytes worth of tokens are available, refilling based
	/// on elapsed wall time.
	pub async fn acquire(&self, n: usize) {
		let n = n as f64;
		loop {
			let wait = {
				let mut state = self.state.lock().await;
				let (tokens, last) = &mut *state;
				let now = Instant::now();
				let elapsed = now.duration_since(*last).as_secs_f64();
				*tokens = (*tokens + elapsed * self.rate).min(self.burst);
				*last = now;
				if *tokens >= n {
					*tokens -= n;
					None
				} else {
					let deficit = n - *tokens;
					Some(Duration::from_secs_f64(deficit / self.rate.max(1.0)))
				}
			};
			match wait {
				None => return,
				Some(d) => tokio::time::sleep(d).await,
			}
		}
	}
}

/// Per-connection throttling policy: independent buckets for each
/// direction, a fixed per-write latency, and a probability (0.0–1.0) that a
/// given chunk is dropped entirely on egress.
#[derive(Default)]
pub struct Throttle {
	pub upload: Option<TokenBucket>,
	pub download: Option<TokenBucket>,
	pub latency: Option<Duration>,
	pub packet_loss: Option<f64>,
}

impl Throttle {
	async fn gate(bucket: Option<&TokenBucket>, latency: Option<Duration>, n: usize) {
		if let Some(b) = bucket {
			b.acquire(n).await;
		}
		if let Some(d) = latency {
			tokio::time::sleep(d).await;
		}
	}

	fn drop_chunk(loss: Option<f64>) -> bool {
		match loss {
			Some(p) if p > 0.0 => rand::rng().random::<f64>() < p,
			_ => false,
		}
	}
}

/// Splices `a <-> b` until either side closes, returning
/// `(bytes_a_to_b, bytes_b_to_a)`. `throttle` governs the `a -> b`
/// ("upload") direction with `throttle.upload` and `b -> a` ("download")
/// with `throttle.download`.
pub async fn splice<A, B>(
	a: A,
	b: B,
	throttle: Option<&Throttle>,
) -> std::io::Result<(u64, u64)>
where
	A: AsyncRead + AsyncWrite + Unpin,
	B: AsyncRead + AsyncWrite + Unpin,
{
	let (mut ar, mut aw) = tokio::io::split(a);
	let (mut br, mut bw) = tokio::io::split(b);

	let upload = async {
		let mut total = 0u64;
		let mut buf = BytesMut::with_capacity(16 * 1024);
		loop {
			buf.clear();
			buf.resize(16 * 1024, 0);
			let n = ar.read(&mut buf).await?;
			if n == 0 {
				break;
			}
			total += n as u64;
			if let Some(t) = throttle {
				Throttle::gate(t.upload.as_ref(), t.latency, n).await;
				if Throttle::drop_chunk(t.packet_loss) {
					trace!(n, "dropped upload chunk (simulated packet loss)");
					continue;
				}
			}
			bw.write_all(&buf[..n]).await?;
		}
		bw.shutdown().await?;
		Ok::<u64, std::io::Error>(total)
	};

	let download = async {
		let mut total = 0u64;
		let mut buf = BytesMut::with_capacity(16 * 1024);
		loop {
			buf.clear();
			buf.resize(16 * 1024, 0);
			let n = br.read(&mut buf).await?;
			if n == 0 {
				break;
			}
			total += n as u64;
			if let Some(t) = throttle {
				Throttle::gate(t.download.as_ref(), t.latency, n).await;
				if Throttle::drop_chunk(t.packet_loss) {
					trace!(n, "dropped download chunk (simulated packet loss)");
					continue;
				}
			}
			aw.write_all(&buf[..n]).await?;
		}
		aw.shutdown().await?;
		Ok::<u64, std::io::Error>(total)
	};

	let (up, down) = tokio::try_join!(upload, download)?;
	Ok((up, down))
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::duplex;

	#[tokio::test]
	async fn splices_until_close() {
		let (client, mut client_other) = duplex(64);
		let (server, mut server_other) = duplex(64);

		let handle = tokio::spawn(async move { splice(client, server, None).await });

		client_other.write_all(b"hello").await.unwrap();
		let mut buf = [0u8; 5];
		server_other.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"hello");

		server_other.write_all(b"world").await.unwrap();
		let mut buf2 = [0u8; 5];
		client_other.read_exact(&mut buf2).await.unwrap();
		assert_eq!(&buf2, b"world");

		drop(client_other);
		drop(server_other);
		let (up, down) = handle.await.unwrap().unwrap();
		assert_eq!(up, 5);
		assert_eq!(down, 5);
	}

	#[tokio::test]
	async fn token_bucket_paces_large_transfer() {
		let bucket = TokenBucket::new(1_000_000, 1_000_000);
		let start = Instant::now();
		bucket.acquire(500_000).await;
		assert!(start.elapsed() < Duration::from_millis(50));
	}
}
