//! Pooling of bound connections to one endpoint.
//!
//! The pool hands out at most `max_size` connections at once. A checkout that
//! finds the pool exhausted waits in line, first come first served, until a
//! connection is returned or its timeout elapses. Returned connections are
//! reused; dead ones are dropped and replaced on demand.
//!
//! ```no_run
//! # async fn run() -> Result<(), ldap_pool::Error> {
//! use std::time::Duration;
//!
//! use ldap_pool::{Credentials, Endpoint, Filter, Pool, PoolConfig, Query};
//!
//! let url = url::Url::parse("ldap://localhost:1389").map_err(|e| ldap_pool::Error::Invalid(e.to_string()))?;
//! let endpoint = Endpoint::new(url, Credentials::new("cn=admin,dc=example,dc=org", "adminpassword"));
//! let pool = Pool::ldap(endpoint, PoolConfig::default())?;
//!
//! let mut conn = pool.checkout(Duration::from_secs(5)).await?;
//! let people = Query::new("ou=people,dc=example,dc=org")
//! 	.filter(Filter::eq("objectClass", "person"))
//! 	.all(&mut conn)
//! 	.await?;
//! // Dropping the lease checks the connection back in
//! drop(conn);
//! # let _ = people;
//! # Ok(())
//! # }
//! ```
use std::{
	collections::{HashMap, VecDeque},
	fmt,
	ops::{Deref, DerefMut},
	sync::{Arc, Weak},
	time::Duration,
};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::{
	sync::{OwnedSemaphorePermit, Semaphore},
	task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
	config::{Endpoint, PoolConfig},
	connection::{Connection, Liveness},
	error::Error,
	ldap::Ldap3Connector,
	protocol::Connector,
};

/// A bounded pool of connections to one endpoint. Cheap to clone; clones share
/// the same connections.
#[derive(Clone)]
pub struct Pool {
	/// Shared state
	inner: Arc<Inner>,
}

/// State shared by every handle to a pool.
struct Inner {
	/// Where connections go
	endpoint: Endpoint,
	/// Sizing and eviction settings
	config: PoolConfig,
	/// Opens sessions
	connector: Arc<dyn Connector>,
	/// One permit per connection that may be checked out. Tokio's semaphore
	/// queues waiters in FIFO order.
	permits: Arc<Semaphore>,
	/// Everything else, under one lock
	state: Mutex<State>,
}

/// Mutable pool bookkeeping.
#[derive(Default)]
struct State {
	/// Connections ready for checkout, most recently returned last
	idle: VecDeque<Connection>,
	/// Connections currently open, idle or leased
	live: usize,
	/// Leased connections, so shutdown can tear them down
	leased: HashMap<u64, Weak<Liveness>>,
	/// Set by shutdown
	closed: bool,
}

/// A point-in-time view of pool usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
	/// Connections waiting for checkout
	pub idle: usize,
	/// Connections currently leased
	pub checked_out: usize,
	/// Connections open in total
	pub live: usize,
	/// Configured upper bound
	pub max_size: usize,
	/// Whether the pool has been shut down
	pub closed: bool,
}

impl Pool {
	/// Create a pool that opens sessions through `connector`. No connection
	/// is opened until the first checkout.
	pub fn new(
		endpoint: Endpoint,
		config: PoolConfig,
		connector: Arc<dyn Connector>,
	) -> Result<Self, Error> {
		config.validate()?;
		debug!(url = %endpoint.url(), max_size = config.max_size, "Creating connection pool");
		Ok(Self {
			inner: Arc::new(Inner {
				permits: Arc::new(Semaphore::new(config.max_size)),
				endpoint,
				config,
				connector,
				state: Mutex::new(State::default()),
			}),
		})
	}

	/// Create a pool of `ldap3` connections.
	pub fn ldap(endpoint: Endpoint, config: PoolConfig) -> Result<Self, Error> {
		Self::new(endpoint, config, Arc::new(Ldap3Connector))
	}

	/// The endpoint connections are made to.
	#[must_use]
	pub fn endpoint(&self) -> &Endpoint {
		&self.inner.endpoint
	}

	/// Lease a live connection, opening one if none is idle and the pool is
	/// below its maximum size, otherwise waiting up to `timeout` for one to be
	/// returned.
	///
	/// Fails with [`Error::PoolExhausted`] on timeout and [`Error::PoolClosed`]
	/// after shutdown. Dropping the returned future abandons the wait without
	/// affecting the pool.
	pub async fn checkout(&self, timeout: Duration) -> Result<PooledConnection, Error> {
		if self.inner.state.lock().closed {
			return Err(Error::PoolClosed);
		}
		let permit =
			match tokio::time::timeout(timeout, Arc::clone(&self.inner.permits).acquire_owned())
				.await
			{
				Ok(Ok(permit)) => permit,
				Ok(Err(_)) => return Err(Error::PoolClosed),
				Err(_) => {
					debug!(url = %self.inner.endpoint.url(), ?timeout, "Checkout timed out");
					return Err(Error::PoolExhausted(timeout));
				}
			};

		while let Some(connection) = self.take_idle()? {
			// Discarded unless kept, also when this future is dropped mid-probe
			let mut taken = Taken::new(&self.inner, connection);
			if !taken.usable(self.inner.config.idle_timeout).await {
				continue;
			}
			if let Some(connection) = taken.keep() {
				return Ok(self.lease(connection, permit));
			}
		}

		let connection = Connection::open(self.inner.connector.as_ref(), &self.inner.endpoint).await?;
		let closed = {
			let mut state = self.inner.state.lock();
			state.live += 1;
			debug!(id = connection.id(), live = state.live, "Opened pooled connection");
			state.closed
		};
		if closed {
			self.inner.discard(connection);
			return Err(Error::PoolClosed);
		}
		Ok(self.lease(connection, permit))
	}

	/// Return a connection to the pool. Equivalent to dropping it.
	pub fn checkin(&self, connection: PooledConnection) {
		drop(connection);
	}

	/// Run `operation` with a leased connection, returning it to the pool
	/// afterwards whether the operation succeeded, failed or panicked.
	pub async fn with_connection<T, F>(&self, timeout: Duration, operation: F) -> Result<T, Error>
	where
		F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<T, Error>>,
	{
		let mut lease = self.checkout(timeout).await?;
		operation(&mut *lease).await
	}

	/// Probe connections that have been idle for longer than the idle
	/// timeout, closing those that fail. Returns how many were closed.
	pub async fn sweep(&self) -> usize {
		let expired: Vec<(Taken<'_>, OwnedSemaphorePermit)> = {
			let mut state = self.inner.state.lock();
			if state.closed {
				return 0;
			}
			let mut kept = VecDeque::with_capacity(state.idle.len());
			let mut expired = Vec::new();
			while let Some(connection) = state.idle.pop_front() {
				if connection.idle_for() <= self.inner.config.idle_timeout {
					kept.push_back(connection);
					continue;
				}
				// Hold a permit while probing so the connection still counts
				// against the pool size
				match Arc::clone(&self.inner.permits).try_acquire_owned() {
					Ok(permit) => expired.push((Taken::new(&self.inner, connection), permit)),
					Err(_) => kept.push_back(connection),
				}
			}
			state.idle = kept;
			expired
		};

		let mut evicted = 0;
		for (mut taken, permit) in expired {
			if taken.probe().await {
				let mut state = self.inner.state.lock();
				if !state.closed {
					if let Some(connection) = taken.keep() {
						state.idle.push_front(connection);
					}
					drop(state);
					drop(permit);
					continue;
				}
			}
			evicted += 1;
			drop(taken);
			drop(permit);
		}
		if evicted > 0 {
			debug!(url = %self.inner.endpoint.url(), evicted, "Idle sweep closed connections");
		}
		evicted
	}

	/// Run [`Pool::sweep`] every `interval` until the pool is shut down or
	/// every handle to it is dropped.
	#[must_use]
	pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
		let pool = Arc::downgrade(&self.inner);
		tokio::spawn(async move {
			loop {
				tokio::time::sleep(interval).await;
				let Some(inner) = pool.upgrade() else {
					break;
				};
				let pool = Pool { inner };
				if pool.status().closed {
					break;
				}
				pool.sweep().await;
			}
		})
	}

	/// Close the pool. Idle connections are closed at once, later checkouts
	/// fail with [`Error::PoolClosed`]. Leased connections get `grace` to be
	/// returned; any still out after that are torn down.
	pub async fn shutdown(&self, grace: Duration) {
		let idle = {
			let mut state = self.inner.state.lock();
			if state.closed {
				return;
			}
			state.closed = true;
			let idle = std::mem::take(&mut state.idle);
			state.live -= idle.len();
			idle
		};
		info!(url = %self.inner.endpoint.url(), idle = idle.len(), "Shutting down connection pool");
		for mut connection in idle {
			if let Err(err) = connection.close().await {
				debug!(id = connection.id(), "Closing idle connection failed: {err}");
			}
		}

		let all = u32::try_from(self.inner.config.max_size).unwrap_or(u32::MAX);
		let drained =
			tokio::time::timeout(grace, Arc::clone(&self.inner.permits).acquire_many_owned(all))
				.await;
		self.inner.permits.close();
		if !matches!(drained, Ok(Ok(_))) {
			let leased: Vec<Weak<Liveness>> =
				self.inner.state.lock().leased.drain().map(|(_, liveness)| liveness).collect();
			let mut forced = 0_usize;
			for liveness in leased.iter().filter_map(Weak::upgrade) {
				liveness.kill();
				forced += 1;
			}
			if forced > 0 {
				warn!(forced, "Tore down connections still leased at shutdown");
			}
		}
	}

	/// Current usage.
	#[must_use]
	pub fn status(&self) -> PoolStatus {
		let state = self.inner.state.lock();
		PoolStatus {
			idle: state.idle.len(),
			checked_out: state.leased.len(),
			live: state.live,
			max_size: self.inner.config.max_size,
			closed: state.closed,
		}
	}

	/// Pop the most recently returned idle connection.
	fn take_idle(&self) -> Result<Option<Connection>, Error> {
		let mut state = self.inner.state.lock();
		if state.closed {
			return Err(Error::PoolClosed);
		}
		Ok(state.idle.pop_back())
	}

	/// Hand a connection to a caller.
	fn lease(&self, connection: Connection, permit: OwnedSemaphorePermit) -> PooledConnection {
		self.inner
			.state
			.lock()
			.leased
			.insert(connection.id(), Arc::downgrade(connection.liveness()));
		PooledConnection {
			connection: Some(connection),
			pool: Arc::downgrade(&self.inner),
			permit: Some(permit),
		}
	}
}

impl Inner {
	/// Forget a connection that will not be reused.
	fn discard(&self, connection: Connection) {
		self.state.lock().live -= 1;
		drop(connection);
	}

	/// Take back a leased connection.
	fn checkin(&self, connection: Connection) {
		let discarded = {
			let mut state = self.state.lock();
			state.leased.remove(&connection.id());
			if state.closed || connection.is_dead() {
				state.live -= 1;
				Some(connection)
			} else {
				let mut connection = connection;
				connection.touch();
				state.idle.push_back(connection);
				None
			}
		};
		if let Some(connection) = discarded {
			debug!(id = connection.id(), "Discarding returned connection");
		}
	}
}

/// A connection taken out of the idle set to be checked. Unless kept, it is
/// discarded when dropped, so a cancelled checkout or sweep leaves the live
/// count intact.
struct Taken<'p> {
	/// Pool the connection counts against
	pool: &'p Inner,
	/// The connection, until kept or discarded
	connection: Option<Connection>,
}

impl<'p> Taken<'p> {
	/// Take responsibility for `connection`.
	fn new(pool: &'p Inner, connection: Connection) -> Self {
		Self { pool, connection: Some(connection) }
	}

	/// Whether the connection is alive, probing it if it has been idle for
	/// longer than `idle_timeout`.
	async fn usable(&mut self, idle_timeout: Duration) -> bool {
		let Some(connection) = self.connection.as_mut() else {
			return false;
		};
		if connection.is_dead() {
			return false;
		}
		if connection.idle_for() <= idle_timeout {
			return true;
		}
		let alive = connection.probe().await;
		if !alive {
			debug!(id = connection.id(), "Dropping idle connection that failed its probe");
		}
		alive
	}

	/// Probe the connection.
	async fn probe(&mut self) -> bool {
		match self.connection.as_mut() {
			Some(connection) => connection.probe().await,
			None => false,
		}
	}

	/// Hand the connection back to the caller instead of discarding it.
	fn keep(&mut self) -> Option<Connection> {
		self.connection.take()
	}
}

impl Drop for Taken<'_> {
	fn drop(&mut self) {
		if let Some(connection) = self.connection.take() {
			self.pool.discard(connection);
		}
	}
}

impl fmt::Debug for Pool {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Pool")
			.field("endpoint", &self.inner.endpoint)
			.field("config", &self.inner.config)
			.field("status", &self.status())
			.finish_non_exhaustive()
	}
}

/// A connection leased from a [`Pool`]. Dereferences to [`Connection`] and
/// returns to the pool when dropped.
pub struct PooledConnection {
	/// The leased connection, taken on drop
	connection: Option<Connection>,
	/// The owning pool. Weak, so a lease never keeps a pool alive.
	pool: Weak<Inner>,
	/// Released after the connection is back in the idle set, waking the
	/// next waiter
	permit: Option<OwnedSemaphorePermit>,
}

impl Deref for PooledConnection {
	type Target = Connection;

	#[allow(clippy::expect_used)]
	fn deref(&self) -> &Connection {
		self.connection.as_ref().expect("connection is only taken on drop")
	}
}

impl DerefMut for PooledConnection {
	#[allow(clippy::expect_used)]
	fn deref_mut(&mut self) -> &mut Connection {
		self.connection.as_mut().expect("connection is only taken on drop")
	}
}

impl Drop for PooledConnection {
	fn drop(&mut self) {
		if let Some(connection) = self.connection.take() {
			match self.pool.upgrade() {
				Some(pool) => pool.checkin(connection),
				None => drop(connection),
			}
		}
		drop(self.permit.take());
	}
}

impl fmt::Debug for PooledConnection {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PooledConnection").field("connection", &self.connection).finish()
	}
}
