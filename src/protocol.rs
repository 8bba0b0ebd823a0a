//! The boundary to the wire-level directory client.
//!
//! The core never talks to a socket itself. A [`Connector`] opens
//! [`Session`]s against an [`Endpoint`], and a session performs single
//! protocol operations. [`crate::ldap::Ldap3Connector`] implements both on top
//! of `ldap3`; tests substitute an in-memory directory.
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;

use crate::{config::Endpoint, entry::Entry, error::Error};

/// The breadth of a search below its base DN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
	/// Only the base entry itself
	Base,
	/// The immediate children of the base entry
	#[default]
	OneLevel,
	/// The base entry and everything below it
	Subtree,
}

impl From<Scope> for ldap3::Scope {
	fn from(scope: Scope) -> Self {
		match scope {
			Scope::Base => ldap3::Scope::Base,
			Scope::OneLevel => ldap3::Scope::OneLevel,
			Scope::Subtree => ldap3::Scope::Subtree,
		}
	}
}

/// Requested ordering of search results. Servers treat it as a hint and may
/// return results unsorted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
	/// Attribute to sort on
	pub attribute: String,
	/// Sort in descending rather than ascending order
	pub descending: bool,
}

impl OrderBy {
	/// Ascending order on `attribute`.
	#[must_use]
	pub fn asc(attribute: impl Into<String>) -> Self {
		Self { attribute: attribute.into(), descending: false }
	}

	/// Descending order on `attribute`.
	#[must_use]
	pub fn desc(attribute: impl Into<String>) -> Self {
		Self { attribute: attribute.into(), descending: true }
	}
}

/// A fully rendered search request, as sent for every page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
	/// The search base
	pub base: String,
	/// The search scope
	pub scope: Scope,
	/// Filter in LDAP string syntax
	pub filter: String,
	/// Attributes to return. Empty means all user attributes.
	pub attributes: Vec<String>,
	/// Entries per page. `0` disables the paged results control.
	pub page_size: u32,
	/// Server-side ordering hint
	pub order: Option<OrderBy>,
}

/// One page of search results.
#[derive(Debug, Clone, Default)]
pub struct Page {
	/// Entries in server-returned order
	pub entries: Vec<Entry>,
	/// Continuation cookie for the next page, `None` once the search is
	/// complete
	pub cookie: Option<Vec<u8>>,
}

/// A change to one attribute of an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modification {
	/// Add the values to the attribute
	Add(String, Vec<String>),
	/// Replace all values of the attribute
	Replace(String, Vec<String>),
	/// Delete the values from the attribute, or the whole attribute if no
	/// values are given
	Delete(String, Vec<String>),
}

impl Modification {
	/// The attribute this modification touches.
	#[must_use]
	pub fn attribute(&self) -> &str {
		match self {
			Modification::Add(attr, _)
			| Modification::Replace(attr, _)
			| Modification::Delete(attr, _) => attr,
		}
	}
}

/// Opens sessions to a directory server.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
	/// Open an unbound session to the endpoint.
	async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Session>, Error>;
}

/// A single protocol session. Transport failures must be reported as
/// [`Error::ConnectionLost`], non-success results classified with
/// [`Error::from_result_code`].
#[async_trait]
pub trait Session: Send + fmt::Debug {
	/// Perform a simple bind.
	async fn bind(&mut self, bind_dn: &str, password: &str) -> Result<(), Error>;

	/// Fetch one page of a search, resuming from `cookie` if given.
	async fn search_page(
		&mut self,
		request: &SearchRequest,
		cookie: Option<&[u8]>,
	) -> Result<Page, Error>;

	/// Create an entry.
	async fn add(&mut self, dn: &str, attributes: Vec<(String, Vec<String>)>) -> Result<(), Error>;

	/// Apply changes to an entry atomically.
	async fn modify(&mut self, dn: &str, changes: Vec<Modification>) -> Result<(), Error>;

	/// Remove an entry.
	async fn delete(&mut self, dn: &str) -> Result<(), Error>;

	/// Set the password of an entry with the password modify extended
	/// operation.
	async fn set_password(&mut self, dn: &str, password: &str) -> Result<(), Error>;

	/// Cheap round trip proving the session still works.
	async fn probe(&mut self) -> Result<(), Error>;

	/// End the session politely.
	async fn unbind(&mut self) -> Result<(), Error>;

	/// Handle to forcibly tear down the transport from elsewhere, if the
	/// session runs one.
	fn abort_handle(&self) -> Option<AbortHandle>;
}
