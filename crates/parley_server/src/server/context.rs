#![forbid(unsafe_code)]

use std::sync::Arc;

use crate::server::auth::IdentityProvider;
use crate::server::connection::ConnectionSettings;
use crate::server::hub::HubHandle;

/// Everything a connection handler needs, built once at startup.
#[derive(Clone)]
pub struct ServerContext {
	pub hub: HubHandle,
	pub identity: Arc<dyn IdentityProvider>,
	pub connection: ConnectionSettings,
}

impl ServerContext {
	pub fn new(hub: HubHandle, identity: Arc<dyn IdentityProvider>, connection: ConnectionSettings) -> Self {
		Self {
			hub,
			identity,
			connection,
		}
	}
}
