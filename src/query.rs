//! Lazily evaluated search queries.
//!
//! A [`Query`] is a plain value describing a search. Building and refining it
//! never talks to the server; only advancing the [`Cursor`] returned by
//! [`Query::execute`] does, one page at a time. Results are not cached, so
//! executing the same query twice issues two searches.
use std::{collections::VecDeque, time::Duration};

use tracing::debug;

use crate::{
	aggregate::Aggregation,
	connection::Connection,
	entry::Entry,
	error::Error,
	filter::{self, Filter},
	pool::{Pool, PooledConnection},
	protocol::{OrderBy, Scope, SearchRequest},
};

/// Entries requested per page unless configured otherwise.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// An immutable search specification. Every refinement returns a new query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
	/// The search base
	base: String,
	/// The search scope
	scope: Scope,
	/// Accumulated filter, `None` matches every entry
	filter: Option<Filter>,
	/// Attribute projection, empty for all
	attributes: Vec<String>,
	/// Entries per page, `0` to disable paging
	page_size: u32,
	/// Maximum number of entries to yield
	limit: Option<usize>,
	/// Ordering hint
	order: Option<OrderBy>,
}

impl Query {
	/// A query for the entries directly below `base`, matching everything.
	#[must_use]
	pub fn new(base: impl Into<String>) -> Self {
		Self {
			base: base.into(),
			scope: Scope::default(),
			filter: None,
			attributes: Vec::new(),
			page_size: DEFAULT_PAGE_SIZE,
			limit: None,
			order: None,
		}
	}

	/// AND `clause` onto the current filter.
	#[must_use]
	pub fn filter(&self, clause: Filter) -> Self {
		let mut query = self.clone();
		query.filter = Some(match query.filter.take() {
			Some(existing) => filter::and(existing, clause),
			None => clause,
		});
		query
	}

	/// AND the negation of `clause` onto the current filter.
	#[must_use]
	pub fn exclude(&self, clause: Filter) -> Self {
		self.filter(filter::not(clause))
	}

	/// Only return the named attributes. An empty list returns all of them.
	#[must_use]
	pub fn with_attributes<I, S>(&self, names: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Self { attributes: names.into_iter().map(Into::into).collect(), ..self.clone() }
	}

	/// Change the search scope.
	#[must_use]
	pub fn scope(&self, scope: Scope) -> Self {
		Self { scope, ..self.clone() }
	}

	/// Yield at most `limit` entries.
	#[must_use]
	pub fn limit(&self, limit: usize) -> Self {
		Self { limit: Some(limit), ..self.clone() }
	}

	/// Change the number of entries fetched per page. `0` fetches everything
	/// in one response.
	#[must_use]
	pub fn page_size(&self, page_size: u32) -> Self {
		Self { page_size, ..self.clone() }
	}

	/// Ask the server to order results.
	#[must_use]
	pub fn order_by(&self, order: OrderBy) -> Self {
		Self { order: Some(order), ..self.clone() }
	}

	/// The search base.
	#[must_use]
	pub fn base(&self) -> &str {
		&self.base
	}

	/// The filter that will be sent. With no clauses, it matches every entry
	/// by the presence of `objectClass`.
	#[must_use]
	pub fn effective_filter(&self) -> Filter {
		self.filter.clone().unwrap_or_else(|| Filter::present("objectClass"))
	}

	/// Render the request sent for each page. Fails with
	/// [`Error::FilterSyntax`] if the filter is malformed.
	pub fn to_request(&self) -> Result<SearchRequest, Error> {
		Ok(SearchRequest {
			base: self.base.clone(),
			scope: self.scope,
			filter: self.effective_filter().render()?,
			attributes: self.attributes.clone(),
			page_size: self.page_size,
			order: self.order.clone(),
		})
	}

	/// Prepare to run the query over `connection`. No request is sent until
	/// the cursor is first advanced.
	pub fn execute<'c>(&self, connection: &'c mut Connection) -> Result<Cursor<'c>, Error> {
		Ok(Cursor::borrowed(connection, self.to_request()?, self.limit))
	}

	/// Prepare to run the query over a pooled connection, checked out on the
	/// first advance and returned once the cursor is exhausted or dropped.
	pub fn execute_pooled(&self, pool: &Pool, timeout: Duration) -> Result<Cursor<'static>, Error> {
		let source = Source::Pooled { pool: pool.clone(), timeout, lease: None };
		Ok(Cursor::new(source, self.to_request()?, self.limit))
	}

	/// The first result, if any.
	pub async fn one(&self, connection: &mut Connection) -> Result<Option<Entry>, Error> {
		let mut cursor = self.limit(1).execute(connection)?;
		let first = cursor.next().await?;
		cursor.finish().await;
		Ok(first)
	}

	/// Every result, in server order.
	pub async fn all(&self, connection: &mut Connection) -> Result<Vec<Entry>, Error> {
		self.execute(connection)?.collect().await
	}

	/// Number of results. Fetches all of them.
	pub async fn count(&self, connection: &mut Connection) -> Result<usize, Error> {
		let mut cursor = self.execute(connection)?;
		let mut count = 0;
		while cursor.next().await?.is_some() {
			count += 1;
		}
		Ok(count)
	}
}

/// Where a cursor gets its connection from.
#[derive(Debug)]
enum Source<'c> {
	/// A connection the caller holds
	Borrowed(&'c mut Connection),
	/// A pool, leased lazily
	Pooled {
		/// The pool to lease from
		pool: Pool,
		/// How long to wait for a lease
		timeout: Duration,
		/// The current lease, once taken
		lease: Option<PooledConnection>,
	},
}

impl Source<'_> {
	/// The connection to issue requests on, leasing one if needed.
	async fn connection(&mut self) -> Result<&mut Connection, Error> {
		match self {
			Source::Borrowed(connection) => Ok(&mut **connection),
			Source::Pooled { pool, timeout, lease } => {
				if lease.is_none() {
					*lease = Some(pool.checkout(*timeout).await?);
				}
				match lease {
					Some(lease) => Ok(&mut **lease),
					None => Err(Error::PoolClosed),
				}
			}
		}
	}

	/// Give back a pooled lease.
	fn release(&mut self) {
		if let Source::Pooled { lease, .. } = self {
			lease.take();
		}
	}
}

/// Progress of a cursor through its pages.
#[derive(Debug)]
enum State {
	/// Nothing requested yet
	Pending,
	/// At least one page received
	Paging {
		/// Entries of the current page not yet yielded
		buffer: VecDeque<Entry>,
		/// Cookie for the next page, `None` after the last page
		cookie: Option<Vec<u8>>,
	},
	/// Terminal: all pages consumed, limit reached or a request failed
	Exhausted,
}

/// A forward-only sequence of search results.
///
/// Pages are fetched strictly in order as the cursor is advanced. Once it
/// reports the end, or an error, it stays exhausted; run the query again to
/// start over.
#[derive(Debug)]
pub struct Cursor<'c> {
	/// Connection source
	source: Source<'c>,
	/// Request sent for every page
	request: SearchRequest,
	/// Paging state
	state: State,
	/// Entries still allowed by the limit
	remaining: Option<usize>,
	/// Pages fetched so far
	pages: usize,
}

impl<'c> Cursor<'c> {
	/// A cursor over a connection the caller holds.
	pub(crate) fn borrowed(
		connection: &'c mut Connection,
		request: SearchRequest,
		limit: Option<usize>,
	) -> Self {
		Self::new(Source::Borrowed(connection), request, limit)
	}

	/// A cursor over any source.
	fn new(source: Source<'c>, request: SearchRequest, limit: Option<usize>) -> Self {
		let state = if limit == Some(0) { State::Exhausted } else { State::Pending };
		Self { source, request, state, remaining: limit, pages: 0 }
	}

	/// The next entry, fetching the next page when the current one is used
	/// up. `Ok(None)` marks the end.
	pub async fn next(&mut self) -> Result<Option<Entry>, Error> {
		loop {
			if self.remaining == Some(0) {
				self.finish_early().await;
				return Ok(None);
			}
			match &mut self.state {
				State::Exhausted => return Ok(None),
				State::Paging { buffer, cookie } => {
					if let Some(entry) = buffer.pop_front() {
						if let Some(remaining) = &mut self.remaining {
							*remaining -= 1;
						}
						return Ok(Some(entry));
					}
					if cookie.is_none() {
						self.exhaust();
						return Ok(None);
					}
				}
				State::Pending => {}
			}
			self.fetch_page().await?;
		}
	}

	/// Number of pages requested so far.
	#[must_use]
	pub fn pages_fetched(&self) -> usize {
		self.pages
	}

	/// Whether the cursor has reached its terminal state.
	#[must_use]
	pub fn is_exhausted(&self) -> bool {
		matches!(self.state, State::Exhausted)
	}

	/// Drain the remaining entries.
	pub async fn collect(mut self) -> Result<Vec<Entry>, Error> {
		let mut entries = Vec::new();
		while let Some(entry) = self.next().await? {
			entries.push(entry);
		}
		Ok(entries)
	}

	/// Feed the remaining entries through `aggregation`.
	pub async fn aggregate<A: Aggregation>(mut self, mut aggregation: A) -> Result<A, Error> {
		while let Some(entry) = self.next().await? {
			aggregation.accumulate(&entry);
		}
		Ok(aggregation)
	}

	/// Stop early, releasing the server-side paged search if one is still
	/// open.
	pub async fn finish(mut self) {
		self.finish_early().await;
	}

	/// Request the next page.
	async fn fetch_page(&mut self) -> Result<(), Error> {
		let cookie = match &mut self.state {
			State::Paging { cookie, .. } => cookie.take(),
			State::Pending | State::Exhausted => None,
		};
		let page_number = self.pages + 1;
		let result = match self.source.connection().await {
			Ok(connection) => connection.search_page(&self.request, cookie.as_deref()).await,
			Err(err) => Err(err),
		};
		match result {
			Ok(page) => {
				self.pages = page_number;
				debug!(
					base = %self.request.base,
					page = page_number,
					entries = page.entries.len(),
					more = page.cookie.is_some(),
					"Fetched search page"
				);
				self.state = State::Paging { buffer: page.entries.into(), cookie: page.cookie };
				Ok(())
			}
			Err(err) => {
				debug!(base = %self.request.base, page = page_number, "Search failed: {err}");
				self.exhaust();
				Err(err)
			}
		}
	}

	/// Abandon an open paged search, then become exhausted.
	async fn finish_early(&mut self) {
		let cookie = match &mut self.state {
			State::Paging { cookie, .. } => cookie.take(),
			State::Pending | State::Exhausted => None,
		};
		if let Some(cookie) = cookie {
			let abandon = SearchRequest { page_size: 0, ..self.request.clone() };
			let result = match self.source.connection().await {
				Ok(connection) => connection.search_page(&abandon, Some(&cookie)).await.map(drop),
				Err(err) => Err(err),
			};
			if let Err(err) = result {
				debug!(base = %self.request.base, "Abandoning paged search failed: {err}");
			}
		}
		self.exhaust();
	}

	/// Enter the terminal state and give back any pooled lease.
	fn exhaust(&mut self) {
		self.state = State::Exhausted;
		self.source.release();
	}
}
