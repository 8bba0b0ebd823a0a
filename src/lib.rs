//! Pooled, typed access to an LDAP directory server.
//!
//! The library has three layers, each usable on its own:
//!
//! * A [`Pool`] of bound [`Connection`]s to one [`Endpoint`]. Checkouts beyond
//!   the configured maximum wait in line, first come first served, and every
//!   leased connection goes back to the pool when its [`PooledConnection`] is
//!   dropped.
//! * Lazily evaluated [`Query`]s. A query is a plain value built from composable
//!   [`Filter`]s; nothing is sent to the server until the [`Cursor`] it returns
//!   is advanced, and results are then fetched page by page using the simple
//!   paged results control.
//! * A [`Mapper`] that projects entries onto [`Record`]s according to a
//!   declared [`Schema`], tracks which fields change and saves only those.
//!
//! For a general primer on LDAP, the [introduction] in the `ldap3` crate which
//! is used here for interfacing with LDAP is an excellent resource. The site
//! "firstyear's blog-a-log" also has [a guide][firstyear] which is more
//! visually oriented and goes into more detail about searching
//!
//! [introduction]: https://github.com/inejge/ldap3/blob/master/LDAP-primer.md
//! [firstyear]: https://fy.blackhats.net.au/blog/html/pages/ldap_guide_part_1_foundations.html
//!
//! # Getting started
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use std::time::Duration;
//!
//! use url::Url;
//! use ldap_pool::{Credentials, Endpoint, Filter, Pool, PoolConfig, Query, SearchEntryExt};
//!
//! let endpoint = Endpoint::new(
//!     Url::parse("ldap://localhost:1389")?,
//!     Credentials::new("cn=admin,dc=example,dc=org", "adminpassword"),
//! );
//! let pool = Pool::ldap(endpoint, PoolConfig { max_size: 4, ..PoolConfig::default() })?;
//!
//! let people = Query::new("ou=people,dc=example,dc=org")
//!     .filter(Filter::eq("objectClass", "person"))
//!     .exclude(Filter::starts_with("uid", "svc-"))
//!     .with_attributes(["uid", "cn"])
//!     .page_size(50);
//!
//! let mut cursor = people.execute_pooled(&pool, Duration::from_secs(5))?;
//! while let Some(entry) = cursor.next().await? {
//!     println!("{}: {:?}", entry.dn, entry.attr_first("cn"));
//! }
//!
//! pool.shutdown(Duration::from_secs(10)).await;
//! # Ok(())
//! # }
//! ```
//!
//! # Limitations
//! * Connections never reconnect by themselves. A connection whose transport
//!   fails is marked dead and the pool replaces it on a later checkout.
//! * Server-side sorting is only requested, never required; servers without
//!   support for it return results unsorted.
//! * Referrals are not chased.

pub mod aggregate;
pub mod config;
pub mod connection;
pub mod entry;
pub mod error;
pub mod filter;
pub mod ldap;
pub mod mapper;
pub mod pool;
pub mod protocol;
pub mod query;

pub use ldap3::{self, SearchEntry};

pub use crate::{
	aggregate::{Aggregation, Count, Max, Min},
	config::{ConnectionConfig, Credentials, Endpoint, PoolConfig, TLSConfig},
	connection::Connection,
	entry::{Entry, SearchEntryExt},
	error::Error,
	filter::Filter,
	ldap::Ldap3Connector,
	mapper::{
		Codec, Field, MappedQuery, Mapper, Record, RecordCursor, RecordState, Schema, Validator,
		Value,
	},
	pool::{Pool, PoolStatus, PooledConnection},
	protocol::{Connector, Modification, OrderBy, Page, Scope, SearchRequest, Session},
	query::{Cursor, Query},
};
