#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parley_domain::{ConnectionId, Username};
use parley_protocol::OutboundFrame;
use serde::Serialize;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

/// Items queued for a connection's write pump.
pub type OutboundItem = Arc<OutboundFrame>;

/// Why the registry let go of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
	/// Unregistered or shut down. Whatever is already queued is still written.
	Closed,
	/// Evicted by the hub. Queued items are discarded.
	Evicted,
}

/// Receiving half of a connection's outbound queue.
#[derive(Debug)]
pub struct OutboundRx {
	items: mpsc::Receiver<OutboundItem>,
	release: ReleaseSignal,
}

impl OutboundRx {
	pub async fn recv(&mut self) -> Option<OutboundItem> {
		self.items.recv().await
	}

	pub fn try_recv(&mut self) -> Result<OutboundItem, TryRecvError> {
		self.items.try_recv()
	}

	/// True once the registry dropped the sending side.
	pub fn is_closed(&self) -> bool {
		self.items.is_closed()
	}

	/// Resolves once the registry let go of this connection, even while items are still queued.
	///
	/// Cancel safe.
	pub async fn released(&mut self) -> Release {
		self.release.wait().await
	}

	/// The release observed so far, if any.
	pub fn release(&self) -> Option<Release> {
		self.release.seen
	}

	/// Next item to write.
	///
	/// After a `Closed` release this keeps yielding what was queued and then `None`.
	/// After an `Evicted` release it yields `None` straight away.
	pub async fn next_live(&mut self) -> Option<OutboundItem> {
		let Self { items, release } = self;
		if release.seen.is_none() {
			tokio::select! {
				biased;
				_ = release.wait() => {}
				item = items.recv() => return item,
			}
		}

		match release.seen {
			Some(Release::Evicted) => None,
			_ => items.try_recv().ok(),
		}
	}
}

#[derive(Debug)]
struct ReleaseSignal {
	rx: Option<oneshot::Receiver<Release>>,
	seen: Option<Release>,
}

impl ReleaseSignal {
	async fn wait(&mut self) -> Release {
		if let Some(rx) = self.rx.as_mut() {
			// A dropped handle never sent a reason.
			let release = rx.await.unwrap_or(Release::Closed);
			self.rx = None;
			self.seen = Some(release);
		}
		self.seen.unwrap_or(Release::Closed)
	}
}

/// Registry-side view of one live connection.
///
/// Not `Clone`: the registry holds the only sender of the outbound queue, so dropping the
/// handle is what closes the queue. Fields drop in order, so the queue is closed before
/// the release fires.
#[derive(Debug)]
pub struct ConnectionHandle {
	id: ConnectionId,
	username: Username,
	outbound: mpsc::Sender<OutboundItem>,
	release: Option<oneshot::Sender<Release>>,
}

/// Why a non-blocking enqueue failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFault {
	QueueFull,
	Closed,
}

impl DeliveryFault {
	pub fn as_str(self) -> &'static str {
		match self {
			DeliveryFault::QueueFull => "queue_full",
			DeliveryFault::Closed => "queue_closed",
		}
	}
}

impl ConnectionHandle {
	/// Create a handle together with a fresh outbound queue of `capacity` slots.
	pub fn with_queue(id: ConnectionId, username: Username, capacity: usize) -> (Self, OutboundRx) {
		let (tx, items) = mpsc::channel(capacity.max(1));
		let (release_tx, release_rx) = oneshot::channel();
		let handle = Self {
			id,
			username,
			outbound: tx,
			release: Some(release_tx),
		};
		let rx = OutboundRx {
			items,
			release: ReleaseSignal {
				rx: Some(release_rx),
				seen: None,
			},
		};
		(handle, rx)
	}

	pub fn id(&self) -> ConnectionId {
		self.id
	}

	pub fn username(&self) -> &Username {
		&self.username
	}

	/// True once the write pump dropped its receiver.
	pub fn is_closed(&self) -> bool {
		self.outbound.is_closed()
	}

	/// Drop the connection and tell its write pump to discard whatever is queued.
	pub fn evict(mut self) {
		if let Some(release) = self.release.take() {
			let _ = release.send(Release::Evicted);
		}
	}

	/// Non-blocking enqueue.
	pub fn try_deliver(&self, item: OutboundItem) -> Result<(), DeliveryFault> {
		match self.outbound.try_send(item) {
			Ok(()) => Ok(()),
			Err(mpsc::error::TrySendError::Full(_)) => Err(DeliveryFault::QueueFull),
			Err(mpsc::error::TrySendError::Closed(_)) => Err(DeliveryFault::Closed),
		}
	}
}

/// Per-user connection counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PresenceSnapshot {
	pub users: BTreeMap<Username, usize>,
}

impl PresenceSnapshot {
	pub fn user_count(&self) -> usize {
		self.users.len()
	}

	pub fn connection_count(&self) -> usize {
		self.users.values().sum()
	}

	pub fn connections_of(&self, username: &Username) -> usize {
		self.users.get(username).copied().unwrap_or(0)
	}
}

/// Username -> live connections. Owned by the hub task; no locking.
///
/// A username key exists only while its bucket is non-empty.
#[derive(Debug, Default)]
pub struct Registry {
	users: HashMap<Username, HashMap<ConnectionId, ConnectionHandle>>,
	connections: usize,
}

impl Registry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Admit a connection. Returns `false` (and drops `handle`) when the id is already present.
	pub fn register(&mut self, handle: ConnectionHandle) -> bool {
		let bucket = self.users.entry(handle.username.clone()).or_default();
		if bucket.contains_key(&handle.id) {
			return false;
		}
		bucket.insert(handle.id, handle);
		self.connections += 1;
		true
	}

	/// Remove a connection and hand it back so the caller controls when its queue closes.
	///
	/// Unknown ids return `None`; calling this twice is a no-op.
	pub fn unregister(&mut self, username: &Username, id: ConnectionId) -> Option<ConnectionHandle> {
		let bucket = self.users.get_mut(username)?;
		let handle = bucket.remove(&id)?;
		if bucket.is_empty() {
			self.users.remove(username);
		}
		self.connections -= 1;
		Some(handle)
	}

	/// Live connections of `username`, in no particular order.
	pub fn connections(&self, username: &Username) -> impl Iterator<Item = &ConnectionHandle> {
		self.users.get(username).into_iter().flat_map(|bucket| bucket.values())
	}

	pub fn contains(&self, username: &Username, id: ConnectionId) -> bool {
		self.users.get(username).is_some_and(|bucket| bucket.contains_key(&id))
	}

	pub fn is_online(&self, username: &Username) -> bool {
		self.users.contains_key(username)
	}

	pub fn user_count(&self) -> usize {
		self.users.len()
	}

	pub fn connection_count(&self) -> usize {
		self.connections
	}

	pub fn snapshot(&self) -> PresenceSnapshot {
		PresenceSnapshot {
			users: self.users.iter().map(|(u, bucket)| (u.clone(), bucket.len())).collect(),
		}
	}

	/// Drop every registered connection, closing all outbound queues. Returns how many were dropped.
	pub fn drain(&mut self) -> usize {
		let dropped = self.connections;
		self.users.clear();
		self.connections = 0;
		dropped
	}
}
