#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parley_domain::{ChatId, ConnectionId, EnvelopeKind, Username};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::dispatch;
use crate::server::envelope::Envelope;
use crate::server::registry::{ConnectionHandle, DeliveryFault, OutboundRx, PresenceSnapshot, Registry};
use crate::server::store::{MembershipStore, MessageStore, NewMessage, StoreError};

/// What the hub does with a chat message whose persistence failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PersistFailurePolicy {
	/// Log and deliver anyway.
	#[default]
	Proceed,
	/// Log and drop the message.
	Abort,
}

impl PersistFailurePolicy {
	pub fn as_str(self) -> &'static str {
		match self {
			PersistFailurePolicy::Proceed => "proceed",
			PersistFailurePolicy::Abort => "abort",
		}
	}
}

impl FromStr for PersistFailurePolicy {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"proceed" => Ok(PersistFailurePolicy::Proceed),
			"abort" => Ok(PersistFailurePolicy::Abort),
			other => Err(format!("unknown persist_failure policy {other:?} (expected proceed|abort)")),
		}
	}
}

/// Configuration for the hub.
#[derive(Debug, Clone)]
pub struct HubConfig {
	/// Capacity of the hub's event channel.
	pub event_channel_capacity: usize,

	/// Maximum number of queued envelopes per connection before it is evicted.
	pub outbound_queue_capacity: usize,

	pub persist_failure: PersistFailurePolicy,

	/// Abort dispatch of chat traffic whose sender is not a member of the chat.
	pub reject_non_members: bool,

	pub debug_logs: bool,
}

impl Default for HubConfig {
	fn default() -> Self {
		Self {
			event_channel_capacity: 1024,
			outbound_queue_capacity: 64,
			persist_failure: PersistFailurePolicy::Proceed,
			reject_non_members: true,
			debug_logs: false,
		}
	}
}

/// Events consumed by the hub loop, in submission order.
#[derive(Debug)]
pub enum HubEvent {
	Register(ConnectionHandle),
	Unregister { username: Username, conn_id: ConnectionId },
	Inbound(Envelope),
	Snapshot(oneshot::Sender<PresenceSnapshot>),
	Shutdown,
}

/// Cloneable submission side of the hub.
#[derive(Debug, Clone)]
pub struct HubHandle {
	tx: mpsc::Sender<HubEvent>,
	next_conn_id: Arc<AtomicU64>,
	outbound_queue_capacity: usize,
}

impl HubHandle {
	/// Allocate a connection id and its outbound queue. The handle still needs `register`.
	pub fn open_connection(&self, username: Username) -> (ConnectionHandle, OutboundRx) {
		let id = ConnectionId(self.next_conn_id.fetch_add(1, Ordering::Relaxed));
		ConnectionHandle::with_queue(id, username, self.outbound_queue_capacity)
	}

	/// Returns `false` when the hub is gone.
	pub async fn register(&self, handle: ConnectionHandle) -> bool {
		self.tx.send(HubEvent::Register(handle)).await.is_ok()
	}

	pub async fn unregister(&self, username: Username, conn_id: ConnectionId) {
		let _ = self.tx.send(HubEvent::Unregister { username, conn_id }).await;
	}

	/// Returns `false` when the hub is gone.
	pub async fn inbound(&self, envelope: Envelope) -> bool {
		self.tx.send(HubEvent::Inbound(envelope)).await.is_ok()
	}

	/// Deliver a notification to a trusted recipient list. Never persisted.
	pub async fn notify(
		&self,
		sender: Username,
		recipients: Vec<Username>,
		content: impl Into<String>,
		chat_id: Option<ChatId>,
	) -> bool {
		self.inbound(Envelope::internal_notification(sender, recipients, content, chat_id))
			.await
	}

	/// Per-user connection counts as seen by the hub; `None` when the hub is gone.
	pub async fn snapshot(&self) -> Option<PresenceSnapshot> {
		let (tx, rx) = oneshot::channel();
		self.tx.send(HubEvent::Snapshot(tx)).await.ok()?;
		rx.await.ok()
	}

	/// Ask the hub to drop every connection and stop.
	pub async fn shutdown(&self) {
		let _ = self.tx.send(HubEvent::Shutdown).await;
	}

	pub fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}
}

/// Serialized owner of the registry.
pub struct Hub {
	registry: Registry,
	rx: mpsc::Receiver<HubEvent>,
	membership: Arc<dyn MembershipStore>,
	messages: Arc<dyn MessageStore>,
	cfg: HubConfig,
}

/// Start the hub task.
pub fn spawn_hub(
	cfg: HubConfig,
	membership: Arc<dyn MembershipStore>,
	messages: Arc<dyn MessageStore>,
) -> (HubHandle, JoinHandle<()>) {
	let (hub, handle) = Hub::new(cfg, membership, messages);
	let task = tokio::spawn(hub.run());
	(handle, task)
}

#[derive(Debug, Default)]
struct FanOut {
	delivered: usize,
	evicted: usize,
	offline: usize,
}

impl Hub {
	pub fn new(cfg: HubConfig, membership: Arc<dyn MembershipStore>, messages: Arc<dyn MessageStore>) -> (Self, HubHandle) {
		let (tx, rx) = mpsc::channel(cfg.event_channel_capacity.max(1));
		let handle = HubHandle {
			tx,
			next_conn_id: Arc::new(AtomicU64::new(1)),
			outbound_queue_capacity: cfg.outbound_queue_capacity.max(1),
		};
		let hub = Self {
			registry: Registry::new(),
			rx,
			membership,
			messages,
			cfg,
		};
		(hub, handle)
	}

	/// Consume events until `Shutdown` or until every handle is dropped.
	pub async fn run(mut self) {
		info!(
			event_channel_capacity = self.cfg.event_channel_capacity,
			outbound_queue_capacity = self.cfg.outbound_queue_capacity,
			persist_failure = self.cfg.persist_failure.as_str(),
			reject_non_members = self.cfg.reject_non_members,
			"hub started"
		);

		while let Some(event) = self.rx.recv().await {
			match event {
				HubEvent::Register(handle) => self.register(handle),
				HubEvent::Unregister { username, conn_id } => self.unregister(&username, conn_id, "disconnect"),
				HubEvent::Inbound(envelope) => self.dispatch(envelope).await,
				HubEvent::Snapshot(reply) => {
					let _ = reply.send(self.registry.snapshot());
				}
				HubEvent::Shutdown => {
					info!("hub shutdown requested");
					break;
				}
			}
		}

		self.rx.close();
		let dropped = self.registry.drain();
		metrics::gauge!("parley_hub_live_connections").set(0.0);
		info!(dropped, "hub stopped");
	}

	fn register(&mut self, handle: ConnectionHandle) {
		let conn_id = handle.id();
		let username = handle.username().clone();

		if !self.registry.register(handle) {
			warn!(%conn_id, %username, "hub: duplicate register ignored");
			metrics::counter!("parley_hub_duplicate_registrations_total").increment(1);
			return;
		}

		metrics::gauge!("parley_hub_live_connections").set(self.registry.connection_count() as f64);
		debug!(
			%conn_id,
			%username,
			user_connections = self.registry.connections(&username).count(),
			"hub: registered"
		);
	}

	fn unregister(&mut self, username: &Username, conn_id: ConnectionId, reason: &'static str) {
		// Dropping the handle closes the queue; the write pump flushes what is left and exits.
		let Some(handle) = self.registry.unregister(username, conn_id) else {
			return;
		};
		drop(handle);

		metrics::gauge!("parley_hub_live_connections").set(self.registry.connection_count() as f64);
		debug!(%conn_id, %username, reason, "hub: unregistered");
	}

	fn evict(&mut self, username: &Username, conn_id: ConnectionId, fault: DeliveryFault) {
		let Some(handle) = self.registry.unregister(username, conn_id) else {
			return;
		};
		handle.evict();

		warn!(%conn_id, %username, fault = fault.as_str(), "hub: evicted connection");
		metrics::counter!("parley_hub_evictions_total", "fault" => fault.as_str()).increment(1);
		metrics::gauge!("parley_hub_live_connections").set(self.registry.connection_count() as f64);
	}

	async fn dispatch(&mut self, mut envelope: Envelope) {
		let kind_label = match envelope.kind {
			EnvelopeKind::ChatMessage => EnvelopeKind::CHAT_MESSAGE,
			EnvelopeKind::Notification => EnvelopeKind::NOTIFICATION,
			EnvelopeKind::Other(_) => "other",
		};
		metrics::counter!("parley_hub_envelopes_total", "kind" => kind_label).increment(1);

		if !envelope.kind.is_known() {
			metrics::counter!("parley_hub_ignored_envelopes_total").increment(1);
			if self.cfg.debug_logs {
				debug!(kind = %envelope.kind, sender = %envelope.sender, "hub: ignoring unknown envelope kind");
			}
			return;
		}

		let sender = envelope.sender.clone();

		let members = if dispatch::needs_membership(&envelope) {
			let Some(chat_id) = envelope.chat_id else {
				debug!(sender = %sender, kind = %envelope.kind, "hub: envelope without chat_id dropped");
				metrics::counter!("parley_hub_dispatch_aborted_total", "reason" => "missing_chat_id").increment(1);
				return;
			};

			match self.membership.members(chat_id).await {
				Ok(members) => members,
				Err(StoreError::ChatNotFound(_)) => {
					warn!(%chat_id, sender = %sender, "hub: chat not found; dispatch aborted");
					metrics::counter!("parley_hub_dispatch_aborted_total", "reason" => "chat_not_found").increment(1);
					return;
				}
				Err(e) => {
					warn!(%chat_id, sender = %sender, error = %e, "hub: membership lookup failed; dispatch aborted");
					metrics::counter!("parley_hub_dispatch_aborted_total", "reason" => "membership_error").increment(1);
					return;
				}
			}
		} else {
			Vec::new()
		};

		if envelope.is_from_client() && dispatch::needs_membership(&envelope) {
			if self.cfg.reject_non_members && !members.contains(&sender) {
				warn!(chat_id = ?envelope.chat_id, sender = %sender, "hub: sender is not a chat member; dispatch aborted");
				metrics::counter!("parley_hub_dispatch_aborted_total", "reason" => "not_a_member").increment(1);
				return;
			}
			envelope.recipients = dispatch::chat_recipients(&members, &sender);
		}

		let plan = dispatch::plan(&envelope, &sender, &members);

		if plan.requires_persistence
			&& let Some(chat_id) = envelope.chat_id
		{
			let message = NewMessage {
				chat_id,
				sender: sender.clone(),
				content: envelope.content.clone(),
			};
			match self.messages.store(message).await {
				Ok(stored) => {
					if self.cfg.debug_logs {
						debug!(%chat_id, message_id = %stored.id, sender = %sender, "hub: message persisted");
					}
				}
				Err(e) => {
					metrics::counter!("parley_hub_persist_failures_total").increment(1);
					match self.cfg.persist_failure {
						PersistFailurePolicy::Proceed => {
							warn!(%chat_id, sender = %sender, error = %e, "hub: persist failed; delivering anyway");
						}
						PersistFailurePolicy::Abort => {
							warn!(%chat_id, sender = %sender, error = %e, "hub: persist failed; dispatch aborted");
							return;
						}
					}
				}
			}
		}

		let stats = self.fan_out(&envelope, &plan.recipients);

		if self.cfg.debug_logs {
			debug!(
				kind = %envelope.kind,
				sender = %sender,
				chat_id = ?envelope.chat_id,
				recipients = plan.recipients.len(),
				delivered = stats.delivered,
				evicted = stats.evicted,
				offline = stats.offline,
				"hub: dispatched"
			);
		}
	}

	fn fan_out(&mut self, envelope: &Envelope, recipients: &[Username]) -> FanOut {
		let mut stats = FanOut::default();
		if recipients.is_empty() {
			return stats;
		}

		let item = Arc::new(envelope.to_outbound());
		let mut faulted: Vec<(Username, ConnectionId, DeliveryFault)> = Vec::new();

		for recipient in recipients {
			let mut live = 0usize;
			for conn in self.registry.connections(recipient) {
				live += 1;
				match conn.try_deliver(Arc::clone(&item)) {
					Ok(()) => stats.delivered += 1,
					Err(fault) => faulted.push((recipient.clone(), conn.id(), fault)),
				}
			}
			if live == 0 {
				stats.offline += 1;
			}
		}

		for (username, conn_id, fault) in faulted {
			self.evict(&username, conn_id, fault);
			stats.evicted += 1;
		}

		metrics::counter!("parley_hub_deliveries_total").increment(stats.delivered as u64);

		stats
	}
}
