//! A single authenticated session to a directory server.
use std::{
	sync::{
		atomic::{AtomicBool, AtomicU64, Ordering},
		Arc,
	},
	time::Duration,
};

use tokio::{task::AbortHandle, time::Instant};
use tracing::{debug, warn};

use crate::{
	config::Endpoint,
	entry::Entry,
	error::Error,
	filter::Filter,
	protocol::{Connector, Modification, Page, Scope, SearchRequest, Session},
	query::Cursor,
};

/// Source of process-unique connection ids.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Liveness state shared between a connection and the pool that leased it,
/// so the pool can tear the session down from outside during shutdown.
#[derive(Debug)]
pub(crate) struct Liveness {
	/// Cleared once the connection must never be used again
	alive: AtomicBool,
	/// Tears down the session transport
	abort: Option<AbortHandle>,
}

impl Liveness {
	/// Whether the connection may still be used.
	pub(crate) fn is_alive(&self) -> bool {
		self.alive.load(Ordering::Acquire)
	}

	/// Mark dead and drop the transport.
	pub(crate) fn kill(&self) {
		self.alive.store(false, Ordering::Release);
		if let Some(abort) = &self.abort {
			abort.abort();
		}
	}
}

/// One bound protocol session.
///
/// A connection is either live or dead. Any transport failure marks it dead
/// and surfaces as [`Error::ConnectionLost`]; it never reconnects by itself.
#[derive(Debug)]
pub struct Connection {
	/// Process-unique id, for diagnostics
	id: u64,
	/// The protocol session
	session: Box<dyn Session>,
	/// Shared liveness flag
	liveness: Arc<Liveness>,
	/// Time of the last successful operation, probe or checkin
	last_used: Instant,
	/// Maximum wait for a single directory operation
	operation_timeout: Duration,
	/// Age after which [`Connection::is_alive`] actively probes
	probe_after: Duration,
	/// Set once [`Connection::close`] has run
	closed: bool,
}

impl Connection {
	/// Connect to the endpoint and bind with its credentials.
	///
	/// Fails with [`Error::Connect`] if the server cannot be reached and
	/// [`Error::Authentication`] if the credentials are rejected.
	pub async fn open(connector: &dyn Connector, endpoint: &Endpoint) -> Result<Self, Error> {
		let mut session = connector.connect(endpoint).await?;
		let credentials = endpoint.credentials();
		let bound = tokio::time::timeout(
			endpoint.connection().operation_timeout,
			session.bind(&credentials.bind_dn, &credentials.password),
		)
		.await;
		match bound {
			Ok(Ok(())) => {}
			Ok(Err(Error::ConnectionLost(reason))) => return Err(Error::Connect(reason)),
			Ok(Err(err)) => return Err(err),
			Err(_) => {
				return Err(Error::Connect(format!(
					"bind did not complete within {:?}",
					endpoint.connection().operation_timeout
				)))
			}
		}

		let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
		debug!(id, url = %endpoint.url(), bind_dn = %credentials.bind_dn, "Connection bound");
		let liveness =
			Arc::new(Liveness { alive: AtomicBool::new(true), abort: session.abort_handle() });
		Ok(Self {
			id,
			session,
			liveness,
			last_used: Instant::now(),
			operation_timeout: endpoint.connection().operation_timeout,
			probe_after: endpoint.connection().probe_after,
			closed: false,
		})
	}

	/// The connection's process-unique id.
	#[must_use]
	pub fn id(&self) -> u64 {
		self.id
	}

	/// Whether the connection has been marked dead.
	#[must_use]
	pub fn is_dead(&self) -> bool {
		!self.liveness.is_alive()
	}

	/// How long since the connection was last used successfully.
	#[must_use]
	pub fn idle_for(&self) -> Duration {
		self.last_used.elapsed()
	}

	/// Shared liveness handle.
	pub(crate) fn liveness(&self) -> &Arc<Liveness> {
		&self.liveness
	}

	/// Record the connection as fresh.
	pub(crate) fn touch(&mut self) {
		self.last_used = Instant::now();
	}

	/// Lightweight liveness check. Trusts a recent successful operation and
	/// only probes the server once the connection has been quiet for longer
	/// than the configured staleness threshold.
	pub async fn is_alive(&mut self) -> bool {
		if self.is_dead() {
			return false;
		}
		if self.idle_for() < self.probe_after {
			return true;
		}
		self.probe().await
	}

	/// Actively probe the server. A failed probe marks the connection dead.
	pub async fn probe(&mut self) -> bool {
		if self.is_dead() {
			return false;
		}
		let result = tokio::time::timeout(self.operation_timeout, self.session.probe()).await;
		match result {
			Ok(Ok(())) => {
				self.touch();
				true
			}
			Ok(Err(err)) => {
				debug!(id = self.id, "Liveness probe failed: {err}");
				self.liveness.kill();
				false
			}
			Err(_) => {
				debug!(id = self.id, "Liveness probe timed out");
				self.liveness.kill();
				false
			}
		}
	}

	/// Search with the given parameters. Nothing is sent until the returned
	/// cursor is first advanced; pages are then requested on demand.
	pub fn search(
		&mut self,
		base: &str,
		filter: &Filter,
		scope: Scope,
		attributes: &[&str],
		page_size: u32,
	) -> Result<Cursor<'_>, Error> {
		let request = SearchRequest {
			base: base.to_owned(),
			scope,
			filter: filter.render()?,
			attributes: attributes.iter().map(|attr| (*attr).to_owned()).collect(),
			page_size,
			order: None,
		};
		Ok(Cursor::borrowed(self, request, None))
	}

	/// Fetch a single page of a search.
	pub(crate) async fn search_page(
		&mut self,
		request: &SearchRequest,
		cookie: Option<&[u8]>,
	) -> Result<Page, Error> {
		self.ensure_alive()?;
		let result =
			tokio::time::timeout(self.operation_timeout, self.session.search_page(request, cookie))
				.await;
		self.settle(result)
	}

	/// Look up a single entry by DN. A missing entry is `Ok(None)`.
	pub async fn get_entry(&mut self, dn: &str) -> Result<Option<Entry>, Error> {
		let request = SearchRequest {
			base: dn.to_owned(),
			scope: Scope::Base,
			filter: "(objectClass=*)".to_owned(),
			attributes: Vec::new(),
			page_size: 0,
			order: None,
		};
		match self.search_page(&request, None).await {
			Ok(page) => Ok(page.entries.into_iter().next()),
			Err(Error::NotFound(_)) => Ok(None),
			Err(err) => Err(err),
		}
	}

	/// Create an entry at `dn`.
	pub async fn add(&mut self, dn: &str, attributes: Vec<(String, Vec<String>)>) -> Result<(), Error> {
		self.ensure_alive()?;
		let result =
			tokio::time::timeout(self.operation_timeout, self.session.add(dn, attributes)).await;
		self.settle(result)?;
		debug!(id = self.id, dn, "Added entry");
		Ok(())
	}

	/// Apply `changes` to the entry at `dn` as one atomic operation.
	pub async fn modify(&mut self, dn: &str, changes: Vec<Modification>) -> Result<(), Error> {
		self.ensure_alive()?;
		let result =
			tokio::time::timeout(self.operation_timeout, self.session.modify(dn, changes)).await;
		self.settle(result)?;
		debug!(id = self.id, dn, "Modified entry");
		Ok(())
	}

	/// Remove the entry at `dn`.
	pub async fn delete(&mut self, dn: &str) -> Result<(), Error> {
		self.ensure_alive()?;
		let result = tokio::time::timeout(self.operation_timeout, self.session.delete(dn)).await;
		self.settle(result)?;
		debug!(id = self.id, dn, "Deleted entry");
		Ok(())
	}

	/// Set the password of the entry at `dn`.
	pub async fn set_password(&mut self, dn: &str, password: &str) -> Result<(), Error> {
		self.ensure_alive()?;
		let result =
			tokio::time::timeout(self.operation_timeout, self.session.set_password(dn, password))
				.await;
		self.settle(result)
	}

	/// Unbind and release the socket. Safe to call any number of times; the
	/// socket is released even if the unbind fails.
	pub async fn close(&mut self) -> Result<(), Error> {
		if self.closed {
			return Ok(());
		}
		self.closed = true;
		let result = if self.is_dead() {
			Ok(())
		} else {
			match tokio::time::timeout(self.operation_timeout, self.session.unbind()).await {
				Ok(result) => result,
				Err(_) => Err(Error::Timeout(self.operation_timeout)),
			}
		};
		self.liveness.kill();
		debug!(id = self.id, "Connection closed");
		result
	}

	/// Fail fast on a connection that is already known to be dead.
	fn ensure_alive(&self) -> Result<(), Error> {
		if self.closed {
			return Err(Error::ConnectionLost("connection has been closed".to_owned()));
		}
		if self.is_dead() {
			return Err(Error::ConnectionLost("connection is marked dead".to_owned()));
		}
		Ok(())
	}

	/// Apply the bookkeeping common to every operation: refresh the last-use
	/// time on success, mark the connection dead on transport failure.
	fn settle<T, E>(&mut self, result: Result<Result<T, Error>, E>) -> Result<T, Error> {
		match result {
			Ok(Ok(value)) => {
				self.touch();
				Ok(value)
			}
			Ok(Err(err)) => {
				if err.is_connection_lost() {
					warn!(id = self.id, "Marking connection dead: {err}");
					self.liveness.kill();
				}
				Err(err)
			}
			Err(_) => Err(Error::Timeout(self.operation_timeout)),
		}
	}
}

impl Drop for Connection {
	fn drop(&mut self) {
		self.liveness.kill();
	}
}
