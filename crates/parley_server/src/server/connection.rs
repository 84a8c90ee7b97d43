#![forbid(unsafe_code)]

use std::pin::pin;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use bytes::BytesMut;
use parley_domain::{ConnectionId, Username};
use parley_protocol::{DEFAULT_MAX_FRAME_SIZE, FramingError, InboundFrame, encode_frame, try_decode_frame_from_buffer};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::server::envelope::Envelope;
use crate::server::hub::HubHandle;
use crate::server::registry::{OutboundRx, Release};

/// Per-connection settings shared by every session.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	/// Largest accepted/emitted frame payload.
	pub max_frame_bytes: usize,

	/// Read pump gives up after this long without a frame. `None` disables the timer.
	pub idle_timeout: Option<Duration>,

	/// Time a client has to complete the handshake.
	pub handshake_timeout: Duration,

	/// Once the hub releases a connection, how long the write pump may keep flushing
	/// what was already queued.
	pub drain_timeout: Duration,

	/// Name announced in the handshake reply.
	pub server_name: String,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			idle_timeout: Some(Duration::from_secs(90)),
			handshake_timeout: Duration::from_secs(10),
			drain_timeout: Duration::from_secs(2),
			server_name: format!("parley-server/{}", env!("CARGO_PKG_VERSION")),
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
	#[error("read failed: {0}")]
	Io(#[from] std::io::Error),

	#[error("decode failed: {0}")]
	Decode(#[from] FramingError),

	#[error("stream ended mid-frame ({buffered} bytes buffered)")]
	Truncated { buffered: usize },
}

/// Incremental length-prefixed frame reader over any byte stream.
pub struct FrameReader<R> {
	inner: R,
	buf: BytesMut,
	max_frame_bytes: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
	pub fn new(inner: R, max_frame_bytes: usize) -> Self {
		Self {
			inner,
			buf: BytesMut::with_capacity(8 * 1024),
			max_frame_bytes,
		}
	}

	/// Next decoded frame; `Ok(None)` on a clean end of stream.
	pub async fn next_frame<M: DeserializeOwned>(&mut self) -> Result<Option<M>, ReadError> {
		loop {
			if let Some(msg) = try_decode_frame_from_buffer(&mut self.buf, self.max_frame_bytes)? {
				metrics::counter!("parley_server_frames_in_total").increment(1);
				return Ok(Some(msg));
			}

			let n = self.inner.read_buf(&mut self.buf).await?;
			if n == 0 {
				if self.buf.is_empty() {
					return Ok(None);
				}
				return Err(ReadError::Truncated {
					buffered: self.buf.len(),
				});
			}
			metrics::counter!("parley_server_bytes_in_total").increment(n as u64);
		}
	}
}

/// Encode `msg` and write it as one frame.
pub async fn write_frame<W, M>(writer: &mut W, msg: &M, max_frame_bytes: usize) -> anyhow::Result<()>
where
	W: AsyncWrite + Unpin,
	M: Serialize,
{
	let frame = encode_frame(msg, max_frame_bytes).map_err(|e| anyhow!(e))?;
	writer.write_all(&frame).await.context("write frame")?;
	writer.flush().await.context("flush frame")?;
	metrics::counter!("parley_server_bytes_out_total").increment(frame.len() as u64);
	Ok(())
}

/// Why a read pump stopped.
#[derive(Debug)]
enum ReadEnd {
	Eof,
	IdleTimeout,
	HubGone,
	Failed(ReadError),
}

/// Why a write pump stopped.
#[derive(Debug)]
enum WriteEnd {
	/// The hub released this connection and everything queued was written.
	Drained,
	/// The hub released this connection but the peer did not take the queue in time.
	DrainTimedOut,
	/// The hub evicted this connection; its queue was discarded.
	Evicted,
	Failed(anyhow::Error),
}

/// Run one authenticated session until either pump stops.
///
/// Registers with the hub, runs the read pump as its own task and the write pump inline.
/// When the write pump ends the read pump is aborted and an unregister is always sent.
/// A released connection flushes its queue within `drain_timeout`; an evicted one stops
/// at once, even mid-write.
pub async fn run_connection<R, W>(
	hub: HubHandle,
	username: Username,
	reader: FrameReader<R>,
	mut writer: W,
	settings: ConnectionSettings,
) -> anyhow::Result<()>
where
	R: AsyncRead + Unpin + Send + 'static,
	W: AsyncWrite + Unpin,
{
	struct LiveSessionGuard;
	impl Drop for LiveSessionGuard {
		fn drop(&mut self) {
			metrics::gauge!("parley_server_active_sessions").decrement(1.0);
		}
	}

	let (handle, outbound_rx) = hub.open_connection(username.clone());
	let conn_id = handle.id();

	if !hub.register(handle).await {
		return Err(anyhow!("hub is not running"));
	}

	metrics::gauge!("parley_server_active_sessions").increment(1.0);
	let _session_guard = LiveSessionGuard;
	info!(%conn_id, %username, "session started");

	let read_task = tokio::spawn(read_pump(
		conn_id,
		username.clone(),
		reader,
		hub.clone(),
		settings.idle_timeout,
	));

	let write_end = write_pump(
		conn_id,
		outbound_rx,
		&mut writer,
		settings.max_frame_bytes,
		settings.drain_timeout,
	)
	.await;

	read_task.abort();
	let read_end = read_task.await.ok();

	hub.unregister(username.clone(), conn_id).await;
	let _ = writer.shutdown().await;

	match (&write_end, &read_end) {
		(WriteEnd::Failed(e), _) => {
			warn!(%conn_id, %username, error = %e, "session ended: write failed");
		}
		(WriteEnd::Evicted, _) => {
			info!(%conn_id, %username, "session ended: evicted");
		}
		(WriteEnd::DrainTimedOut, _) => {
			warn!(%conn_id, %username, "session ended: peer did not drain its queue in time");
		}
		(WriteEnd::Drained, Some(end)) => {
			info!(%conn_id, %username, reason = ?end, "session ended");
		}
		(WriteEnd::Drained, None) => {
			info!(%conn_id, %username, "session ended");
		}
	}

	match write_end {
		WriteEnd::Failed(e) => Err(e),
		WriteEnd::Drained | WriteEnd::DrainTimedOut | WriteEnd::Evicted => Ok(()),
	}
}

async fn read_pump<R>(
	conn_id: ConnectionId,
	username: Username,
	mut reader: FrameReader<R>,
	hub: HubHandle,
	idle_timeout: Option<Duration>,
) -> ReadEnd
where
	R: AsyncRead + Unpin,
{
	let end = loop {
		let next = match idle_timeout {
			Some(limit) => match tokio::time::timeout(limit, reader.next_frame::<InboundFrame>()).await {
				Ok(next) => next,
				Err(_) => break ReadEnd::IdleTimeout,
			},
			None => reader.next_frame::<InboundFrame>().await,
		};

		match next {
			Ok(Some(frame)) => {
				if frame.is_heartbeat() {
					continue;
				}
				if !hub.inbound(Envelope::from_client(frame, username.clone(), conn_id)).await {
					break ReadEnd::HubGone;
				}
			}
			Ok(None) => break ReadEnd::Eof,
			Err(e) => break ReadEnd::Failed(e),
		}
	};

	match &end {
		ReadEnd::Failed(ReadError::Decode(e)) => {
			metrics::counter!("parley_server_decode_errors_total").increment(1);
			warn!(%conn_id, %username, error = %e, "read pump: decode error");
		}
		ReadEnd::IdleTimeout => {
			metrics::counter!("parley_server_idle_timeouts_total").increment(1);
			debug!(%conn_id, %username, "read pump: idle timeout");
		}
		other => debug!(%conn_id, %username, reason = ?other, "read pump stopped"),
	}

	hub.unregister(username, conn_id).await;
	end
}

async fn write_pump<W>(
	conn_id: ConnectionId,
	mut rx: OutboundRx,
	writer: &mut W,
	max_frame_bytes: usize,
	drain_timeout: Duration,
) -> WriteEnd
where
	W: AsyncWrite + Unpin,
{
	let mut drain_deadline: Option<Instant> = None;

	loop {
		let Some(item) = rx.next_live().await else {
			return match rx.release() {
				Some(Release::Evicted) => WriteEnd::Evicted,
				_ => WriteEnd::Drained,
			};
		};

		let frame = match encode_frame(item.as_ref(), max_frame_bytes) {
			Ok(frame) => frame,
			Err(e) => {
				// Oversized envelopes are skipped; the connection stays up.
				warn!(%conn_id, error = %e, "write pump: dropping unencodable envelope");
				continue;
			}
		};

		let mut write = pin!(write_all_flush(writer, &frame));
		let written = match drain_deadline {
			Some(deadline) => tokio::time::timeout_at(deadline, write).await,
			None => {
				// A peer that stops reading must not pin a released connection.
				let step = tokio::select! {
					biased;
					release = rx.released() => Err(release),
					written = &mut write => Ok(written),
				};
				match step {
					Ok(written) => Ok(written),
					Err(Release::Evicted) => return WriteEnd::Evicted,
					Err(Release::Closed) => {
						let deadline = Instant::now() + drain_timeout;
						drain_deadline = Some(deadline);
						debug!(%conn_id, "write pump: released, draining queue");
						tokio::time::timeout_at(deadline, write).await
					}
				}
			}
		};

		let Ok(written) = written else {
			return WriteEnd::DrainTimedOut;
		};
		if let Err(e) = written {
			return WriteEnd::Failed(anyhow!(e).context("write envelope"));
		}
		metrics::counter!("parley_server_frames_out_total").increment(1);
		metrics::counter!("parley_server_bytes_out_total").increment(frame.len() as u64);
	}
}

async fn write_all_flush<W>(writer: &mut W, frame: &[u8]) -> std::io::Result<()>
where
	W: AsyncWrite + Unpin,
{
	writer.write_all(frame).await?;
	writer.flush().await
}
