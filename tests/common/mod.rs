#![allow(dead_code)]
use std::{
	collections::HashMap,
	error::Error as StdError,
	sync::{
		atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
		Arc,
	},
	time::Duration,
};

use async_trait::async_trait;
use ldap3::{LdapConnAsync, SearchEntry};
use ldap_pool::{
	Connection, Connector, Credentials, Endpoint, Error, Modification, Page, Pool, PoolConfig,
	Scope, SearchRequest, Session,
};
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};
use url::Url;

pub const PEOPLE: &str = "ou=people,dc=example,dc=org";

pub fn init_tracing() {
	let tracing_filter = EnvFilter::default().add_directive(LevelFilter::DEBUG.into());
	let _ = tracing_subscriber::fmt().with_env_filter(tracing_filter).with_test_writer().try_init();
}

/// A request as seen by the in-memory directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
	Bind(String),
	Search { base: String, filter: String, page_size: u32, cookie: Option<Vec<u8>> },
	Add(String, Vec<(String, Vec<String>)>),
	Modify(String, Vec<Modification>),
	Delete(String),
	SetPassword(String),
	Probe,
	Unbind,
}

/// A directory held in memory. Every session opened through a
/// [`MemoryConnector`] shares it.
#[derive(Debug, Default)]
pub struct Directory {
	entries: Mutex<Vec<SearchEntry>>,
	ops: Mutex<Vec<Op>>,
	connects: AtomicUsize,
	open: AtomicUsize,
	max_open: AtomicUsize,
	searches: AtomicUsize,
	fail_search: AtomicUsize,
	fail_ops: AtomicUsize,
	fail_probes: AtomicBool,
	probe_delay_ms: AtomicU64,
	reject_bind: AtomicBool,
	refuse_connect: AtomicBool,
}

impl Directory {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// A directory with `count` people below [`PEOPLE`].
	pub fn with_people(count: usize) -> Arc<Self> {
		let directory = Self::new();
		directory.insert(entry(PEOPLE, &[("objectClass", &["organizationalUnit"]), ("ou", &["people"])]));
		for n in 1..=count {
			directory.insert(person(&format!("user{n}"), &format!("User {n}"), n));
		}
		directory
	}

	pub fn insert(&self, entry: SearchEntry) {
		self.entries.lock().push(entry);
	}

	pub fn get(&self, dn: &str) -> Option<SearchEntry> {
		self.entries.lock().iter().find(|entry| entry.dn.eq_ignore_ascii_case(dn)).cloned()
	}

	pub fn ops(&self) -> Vec<Op> {
		self.ops.lock().clone()
	}

	/// Every request except binds, probes and unbinds.
	pub fn requests(&self) -> Vec<Op> {
		self.ops()
			.into_iter()
			.filter(|op| !matches!(op, Op::Bind(_) | Op::Probe | Op::Unbind))
			.collect()
	}

	pub fn searches(&self) -> Vec<Op> {
		self.ops().into_iter().filter(|op| matches!(op, Op::Search { .. })).collect()
	}

	pub fn clear_ops(&self) {
		self.ops.lock().clear();
	}

	pub fn connects(&self) -> usize {
		self.connects.load(Ordering::SeqCst)
	}

	pub fn open_sessions(&self) -> usize {
		self.open.load(Ordering::SeqCst)
	}

	pub fn max_open_sessions(&self) -> usize {
		self.max_open.load(Ordering::SeqCst)
	}

	/// Drop the transport during the `nth` search from now on.
	pub fn fail_search(&self, nth: usize) {
		self.fail_search.store(self.searches.load(Ordering::SeqCst) + nth, Ordering::SeqCst);
	}

	/// Drop the transport during the next `count` operations.
	pub fn fail_next_ops(&self, count: usize) {
		self.fail_ops.store(count, Ordering::SeqCst);
	}

	pub fn fail_probes(&self, fail: bool) {
		self.fail_probes.store(fail, Ordering::SeqCst);
	}

	/// Make every probe take `delay` before answering.
	pub fn slow_probes(&self, delay: Duration) {
		let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
		self.probe_delay_ms.store(millis, Ordering::SeqCst);
	}

	pub fn reject_bind(&self, reject: bool) {
		self.reject_bind.store(reject, Ordering::SeqCst);
	}

	pub fn refuse_connect(&self, refuse: bool) {
		self.refuse_connect.store(refuse, Ordering::SeqCst);
	}

	fn log(&self, op: Op) {
		self.ops.lock().push(op);
	}

	fn injected_failure(&self) -> Result<(), Error> {
		let failing = self
			.fail_ops
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
			.is_ok();
		if failing {
			Err(Error::ConnectionLost("connection reset by peer".to_owned()))
		} else {
			Ok(())
		}
	}

	fn search(&self, request: &SearchRequest, cookie: Option<&[u8]>) -> Result<Page, Error> {
		let search = self.searches.fetch_add(1, Ordering::SeqCst) + 1;
		if self.fail_search.load(Ordering::SeqCst) == search {
			return Err(Error::ConnectionLost("connection reset by peer".to_owned()));
		}
		let offset: usize = match cookie {
			Some(cookie) => std::str::from_utf8(cookie)
				.ok()
				.and_then(|cookie| cookie.parse().ok())
				.ok_or_else(|| Error::Protocol { code: 2, message: "bad cookie".to_owned() })?,
			None => 0,
		};
		if request.page_size == 0 && cookie.is_some() {
			return Ok(Page::default());
		}

		let entries = self.entries.lock();
		if request.scope == Scope::Base && !entries.iter().any(|e| e.dn.eq_ignore_ascii_case(&request.base)) {
			return Err(Error::NotFound(request.base.clone()));
		}
		let matching: Vec<SearchEntry> = entries
			.iter()
			.filter(|entry| in_scope(&entry.dn, &request.base, request.scope))
			.filter(|entry| matches(&request.filter, entry))
			.map(|entry| project(entry, &request.attributes))
			.collect();
		let end = if request.page_size == 0 {
			matching.len()
		} else {
			matching.len().min(offset + request.page_size as usize)
		};
		let cookie = (end < matching.len()).then(|| end.to_string().into_bytes());
		Ok(Page { entries: matching[offset.min(end)..end].to_vec(), cookie })
	}
}

/// Opens sessions on a shared [`Directory`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
	pub directory: Arc<Directory>,
}

#[async_trait]
impl Connector for MemoryConnector {
	async fn connect(&self, _endpoint: &Endpoint) -> Result<Box<dyn Session>, Error> {
		if self.directory.refuse_connect.load(Ordering::SeqCst) {
			return Err(Error::Connect("connection refused".to_owned()));
		}
		self.directory.connects.fetch_add(1, Ordering::SeqCst);
		let open = self.directory.open.fetch_add(1, Ordering::SeqCst) + 1;
		self.directory.max_open.fetch_max(open, Ordering::SeqCst);
		Ok(Box::new(MemorySession { directory: Arc::clone(&self.directory) }))
	}
}

#[derive(Debug)]
pub struct MemorySession {
	directory: Arc<Directory>,
}

#[async_trait]
impl Session for MemorySession {
	async fn bind(&mut self, bind_dn: &str, _password: &str) -> Result<(), Error> {
		self.directory.log(Op::Bind(bind_dn.to_owned()));
		if self.directory.reject_bind.load(Ordering::SeqCst) {
			return Err(Error::Authentication);
		}
		Ok(())
	}

	async fn search_page(
		&mut self,
		request: &SearchRequest,
		cookie: Option<&[u8]>,
	) -> Result<Page, Error> {
		self.directory.log(Op::Search {
			base: request.base.clone(),
			filter: request.filter.clone(),
			page_size: request.page_size,
			cookie: cookie.map(<[u8]>::to_vec),
		});
		self.directory.injected_failure()?;
		self.directory.search(request, cookie)
	}

	async fn add(&mut self, dn: &str, attributes: Vec<(String, Vec<String>)>) -> Result<(), Error> {
		self.directory.log(Op::Add(dn.to_owned(), attributes.clone()));
		self.directory.injected_failure()?;
		if self.directory.get(dn).is_some() {
			return Err(Error::AlreadyExists(dn.to_owned()));
		}
		self.directory.insert(SearchEntry {
			dn: dn.to_owned(),
			attrs: attributes.into_iter().collect(),
			bin_attrs: HashMap::new(),
		});
		Ok(())
	}

	async fn modify(&mut self, dn: &str, changes: Vec<Modification>) -> Result<(), Error> {
		self.directory.log(Op::Modify(dn.to_owned(), changes.clone()));
		self.directory.injected_failure()?;
		let mut entries = self.directory.entries.lock();
		let entry = entries
			.iter_mut()
			.find(|entry| entry.dn.eq_ignore_ascii_case(dn))
			.ok_or_else(|| Error::NotFound(dn.to_owned()))?;
		for change in changes {
			match change {
				Modification::Add(attr, values) => entry.attrs.entry(attr).or_default().extend(values),
				Modification::Replace(attr, values) => {
					entry.attrs.insert(attr, values);
				}
				Modification::Delete(attr, values) if values.is_empty() => {
					entry.attrs.remove(&attr);
				}
				Modification::Delete(attr, values) => {
					if let Some(existing) = entry.attrs.get_mut(&attr) {
						existing.retain(|value| !values.contains(value));
					}
				}
			}
		}
		Ok(())
	}

	async fn delete(&mut self, dn: &str) -> Result<(), Error> {
		self.directory.log(Op::Delete(dn.to_owned()));
		self.directory.injected_failure()?;
		let mut entries = self.directory.entries.lock();
		let before = entries.len();
		entries.retain(|entry| !entry.dn.eq_ignore_ascii_case(dn));
		if entries.len() == before {
			return Err(Error::NotFound(dn.to_owned()));
		}
		Ok(())
	}

	async fn set_password(&mut self, dn: &str, password: &str) -> Result<(), Error> {
		self.directory.log(Op::SetPassword(dn.to_owned()));
		self.directory.injected_failure()?;
		let mut entries = self.directory.entries.lock();
		let entry = entries
			.iter_mut()
			.find(|entry| entry.dn.eq_ignore_ascii_case(dn))
			.ok_or_else(|| Error::NotFound(dn.to_owned()))?;
		entry.attrs.insert("userPassword".to_owned(), vec![password.to_owned()]);
		Ok(())
	}

	async fn probe(&mut self) -> Result<(), Error> {
		self.directory.log(Op::Probe);
		let delay = self.directory.probe_delay_ms.load(Ordering::SeqCst);
		if delay > 0 {
			tokio::time::sleep(Duration::from_millis(delay)).await;
		}
		if self.directory.fail_probes.load(Ordering::SeqCst) {
			return Err(Error::ConnectionLost("probe failed".to_owned()));
		}
		Ok(())
	}

	async fn unbind(&mut self) -> Result<(), Error> {
		self.directory.log(Op::Unbind);
		Ok(())
	}

	fn abort_handle(&self) -> Option<AbortHandle> {
		None
	}
}

impl Drop for MemorySession {
	fn drop(&mut self) {
		self.directory.open.fetch_sub(1, Ordering::SeqCst);
	}
}

pub fn endpoint() -> Endpoint {
	Endpoint::new(
		Url::parse("ldap://directory.test:389").unwrap(),
		Credentials::new("cn=admin,dc=example,dc=org", "adminpassword"),
	)
}

pub fn connector(directory: &Arc<Directory>) -> MemoryConnector {
	MemoryConnector { directory: Arc::clone(directory) }
}

pub async fn connect(directory: &Arc<Directory>) -> Result<Connection, Error> {
	Connection::open(&connector(directory), &endpoint()).await
}

pub fn pool(directory: &Arc<Directory>, max_size: usize, idle_timeout: Duration) -> Pool {
	Pool::new(
		endpoint(),
		PoolConfig { max_size, idle_timeout },
		Arc::new(connector(directory)),
	)
	.unwrap()
}

pub fn entry(dn: &str, attrs: &[(&str, &[&str])]) -> SearchEntry {
	SearchEntry {
		dn: dn.to_owned(),
		attrs: attrs
			.iter()
			.map(|(name, values)| {
				((*name).to_owned(), values.iter().map(|value| (*value).to_owned()).collect())
			})
			.collect(),
		bin_attrs: HashMap::new(),
	}
}

pub fn person(uid: &str, cn: &str, number: usize) -> SearchEntry {
	let number = number.to_string();
	entry(
		&format!("uid={uid},{PEOPLE}"),
		&[
			("objectClass", &["inetOrgPerson", "person"]),
			("uid", &[uid]),
			("cn", &[cn]),
			("sn", &[cn]),
			("uidNumber", &[number.as_str()]),
		],
	)
}

fn in_scope(dn: &str, base: &str, scope: Scope) -> bool {
	let dn = dn.to_ascii_lowercase();
	let base = base.to_ascii_lowercase();
	match scope {
		Scope::Base => dn == base,
		Scope::OneLevel => {
			dn.strip_suffix(&base)
				.and_then(|rdn| rdn.strip_suffix(','))
				.is_some_and(|rdn| !rdn.is_empty() && !rdn.contains(','))
		}
		Scope::Subtree => dn == base || dn.ends_with(&format!(",{base}")),
	}
}

fn project(entry: &SearchEntry, attributes: &[String]) -> SearchEntry {
	if attributes.is_empty() || attributes.iter().any(|attr| attr == "*") {
		return entry.clone();
	}
	SearchEntry {
		dn: entry.dn.clone(),
		attrs: entry
			.attrs
			.iter()
			.filter(|(name, _)| attributes.iter().any(|attr| attr.eq_ignore_ascii_case(name)))
			.map(|(name, values)| (name.clone(), values.clone()))
			.collect(),
		bin_attrs: HashMap::new(),
	}
}

/// Evaluate a rendered filter. Understands equality, presence and the three
/// boolean operators, which is all the tests send.
fn matches(filter: &str, entry: &SearchEntry) -> bool {
	let Some(inner) = filter.strip_prefix('(').and_then(|f| f.strip_suffix(')')) else {
		return false;
	};
	match inner.chars().next() {
		Some('&') => children(&inner[1..]).iter().all(|child| matches(child, entry)),
		Some('|') => children(&inner[1..]).iter().any(|child| matches(child, entry)),
		Some('!') => !matches(&inner[1..], entry),
		_ => {
			let Some((attr, value)) = inner.split_once('=') else {
				return false;
			};
			let values = entry
				.attrs
				.iter()
				.find(|(name, _)| name.eq_ignore_ascii_case(attr))
				.map(|(_, values)| values.as_slice())
				.unwrap_or_default();
			if value == "*" {
				return !values.is_empty();
			}
			let value = unescape(value);
			values.iter().any(|candidate| candidate.eq_ignore_ascii_case(&value))
		}
	}
}

fn children(list: &str) -> Vec<&str> {
	let mut children = Vec::new();
	let mut depth = 0;
	let mut start = 0;
	for (index, c) in list.char_indices() {
		match c {
			'(' => {
				if depth == 0 {
					start = index;
				}
				depth += 1;
			}
			')' => {
				depth -= 1;
				if depth == 0 {
					children.push(&list[start..=index]);
				}
			}
			_ => {}
		}
	}
	children
}

fn unescape(value: &str) -> String {
	let mut out = Vec::with_capacity(value.len());
	let bytes = value.as_bytes();
	let mut index = 0;
	while index < bytes.len() {
		if bytes[index] == b'\\' && index + 3 <= bytes.len() {
			if let Ok(byte) = u8::from_str_radix(&value[index + 1..index + 3], 16) {
				out.push(byte);
				index += 3;
				continue;
			}
		}
		out.push(bytes[index]);
		index += 1;
	}
	String::from_utf8_lossy(&out).into_owned()
}

// Helpers for the live server tests.

pub async fn ldap_connect() -> Result<ldap3::Ldap, Box<dyn StdError>> {
	let (conn, mut ldap) = LdapConnAsync::new("ldap://localhost:1389").await?;
	let _handle = tokio::spawn(async move {
		if let Err(err) = conn.drive().await {
			panic!("Ldap connection error {err}");
		}
	});
	ldap.simple_bind("cn=admin,dc=example,dc=org", "adminpassword").await?;
	Ok(ldap)
}

pub async fn ldap_add_organizational_unit(
	ldap: &mut ldap3::Ldap,
	ou: &str,
) -> Result<(), Box<dyn StdError>> {
	ldap.add(
		&format!("ou={},dc=example,dc=org", ou),
		vec![("objectClass", ["organizationalUnit"].into())],
	)
	.await?
	.success()?;
	Ok(())
}

pub async fn ldap_delete_organizational_unit(
	ldap: &mut ldap3::Ldap,
	ou: &str,
) -> Result<(), Box<dyn StdError>> {
	ldap.delete(&format!("ou={},dc=example,dc=org", ou)).await?.success()?;
	Ok(())
}

pub async fn ldap_delete_user(ldap: &mut ldap3::Ldap, uid: &str) -> Result<(), Box<dyn StdError>> {
	ldap.delete(&format!("uid={},ou=people,dc=example,dc=org", uid)).await?.success()?;
	Ok(())
}
