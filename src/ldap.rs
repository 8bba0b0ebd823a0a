//! [`Connector`] and [`Session`] implementations on top of `ldap3`.
use std::collections::HashSet;

use async_trait::async_trait;
use ldap3::{
	controls::{Control, ControlType, PagedResults, RawControl},
	exop::PasswordModify,
	result::ExopResult,
	LdapConnAsync, LdapError, Mod, SearchEntry,
};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};

use crate::{
	config::Endpoint,
	error::Error,
	protocol::{Connector, Modification, OrderBy, Page, Scope, SearchRequest, Session},
};

/// OID of the server side sorting request control (RFC 2891).
const SERVER_SIDE_SORT_OID: &str = "1.2.840.113556.1.4.473";

/// Opens `ldap3` sessions, each with its own background driver task.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ldap3Connector;

#[async_trait]
impl Connector for Ldap3Connector {
	async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Session>, Error> {
		let settings = endpoint.connection().to_settings().await?;
		let (conn, ldap) = LdapConnAsync::from_url_with_settings(settings, endpoint.url())
			.await
			.map_err(|err| Error::Connect(format!("{}: {err}", endpoint.url())))?;

		let url = endpoint.url().to_string();
		let driver = tokio::spawn(async move {
			if let Err(err) = conn.drive().await {
				warn!(%url, "Ldap connection error {err}");
			}
		});
		debug!(url = %endpoint.url(), "Opened LDAP session");

		Ok(Box::new(Ldap3Session { ldap, driver }))
	}
}

/// A session over an `ldap3` handle.
#[derive(Debug)]
pub struct Ldap3Session {
	/// The operation handle
	ldap: ldap3::Ldap,
	/// Task driving the socket. Aborting it closes the connection.
	driver: JoinHandle<()>,
}

#[async_trait]
impl Session for Ldap3Session {
	async fn bind(&mut self, bind_dn: &str, password: &str) -> Result<(), Error> {
		let result = self
			.ldap
			.simple_bind(bind_dn, password)
			.await
			.map_err(|err| Error::Connect(err.to_string()))?;
		match result.rc {
			0 => Ok(()),
			rc => Err(Error::from_result_code(rc, &result.text, bind_dn)),
		}
	}

	async fn search_page(
		&mut self,
		request: &SearchRequest,
		cookie: Option<&[u8]>,
	) -> Result<Page, Error> {
		let mut controls: Vec<RawControl> = Vec::new();
		// A zero page size with a cookie abandons the paged search
		if request.page_size > 0 || cookie.is_some() {
			let size = i32::try_from(request.page_size)
				.map_err(|_| Error::Invalid(format!("Page size {}", request.page_size)))?;
			controls.push(
				PagedResults { size, cookie: cookie.map(<[u8]>::to_vec).unwrap_or_default() }
					.into(),
			);
		}
		if let Some(order) = &request.order {
			controls.push(sort_control(order));
		}
		if !controls.is_empty() {
			self.ldap.with_controls(controls);
		}

		let attributes: Vec<&str> = if request.attributes.is_empty() {
			vec!["*"]
		} else {
			request.attributes.iter().map(String::as_str).collect()
		};

		let (entries, result) = self
			.ldap
			.search(&request.base, request.scope.into(), &request.filter, attributes)
			.await
			.and_then(ldap3::SearchResult::success)
			.map_err(|err| classify(err, &request.base))?;

		let cookie = result
			.ctrls
			.iter()
			.find_map(|control| match control {
				Control(Some(ControlType::PagedResults), raw) => {
					Some(raw.parse::<PagedResults>().cookie)
				}
				_ => None,
			})
			.filter(|cookie| !cookie.is_empty());

		Ok(Page { entries: entries.into_iter().map(SearchEntry::construct).collect(), cookie })
	}

	async fn add(&mut self, dn: &str, attributes: Vec<(String, Vec<String>)>) -> Result<(), Error> {
		let attributes: Vec<(String, HashSet<String>)> = attributes
			.into_iter()
			.map(|(name, values)| (name, values.into_iter().collect()))
			.collect();
		self.ldap
			.add(dn, attributes)
			.await
			.and_then(ldap3::LdapResult::success)
			.map_err(|err| classify(err, dn))?;
		Ok(())
	}

	async fn modify(&mut self, dn: &str, changes: Vec<Modification>) -> Result<(), Error> {
		let mods: Vec<Mod<String>> = changes
			.into_iter()
			.map(|change| match change {
				Modification::Add(attr, values) => Mod::Add(attr, values.into_iter().collect()),
				Modification::Replace(attr, values) => {
					Mod::Replace(attr, values.into_iter().collect())
				}
				Modification::Delete(attr, values) => {
					Mod::Delete(attr, values.into_iter().collect())
				}
			})
			.collect();
		self.ldap
			.modify(dn, mods)
			.await
			.and_then(ldap3::LdapResult::success)
			.map_err(|err| classify(err, dn))?;
		Ok(())
	}

	async fn delete(&mut self, dn: &str) -> Result<(), Error> {
		self.ldap
			.delete(dn)
			.await
			.and_then(ldap3::LdapResult::success)
			.map_err(|err| classify(err, dn))?;
		Ok(())
	}

	async fn set_password(&mut self, dn: &str, password: &str) -> Result<(), Error> {
		let exop = PasswordModify { user_id: Some(dn), old_pass: None, new_pass: Some(password) };
		self.ldap
			.extended(exop)
			.await
			.and_then(ExopResult::success)
			.map_err(|err| classify(err, dn))?;
		Ok(())
	}

	async fn probe(&mut self) -> Result<(), Error> {
		// Reading the root DSE without attributes is the cheapest round trip
		self.ldap
			.search("", Scope::Base.into(), "(objectClass=*)", vec!["1.1"])
			.await
			.and_then(ldap3::SearchResult::success)
			.map_err(|err| classify(err, ""))?;
		Ok(())
	}

	async fn unbind(&mut self) -> Result<(), Error> {
		let result = self.ldap.unbind().await.map_err(|err| classify(err, ""));
		self.driver.abort();
		result
	}

	fn abort_handle(&self) -> Option<AbortHandle> {
		Some(self.driver.abort_handle())
	}
}

impl Drop for Ldap3Session {
	fn drop(&mut self) {
		self.driver.abort();
	}
}

/// Sort the error kinds `ldap3` reports into this crate's taxonomy.
fn classify(err: LdapError, dn: &str) -> Error {
	match err {
		LdapError::LdapResult { result } => Error::from_result_code(result.rc, &result.text, dn),
		LdapError::FilterParsing => Error::FilterSyntax("rejected by filter parser".to_owned()),
		err @ (LdapError::Io { .. }
		| LdapError::OpSend { .. }
		| LdapError::ResultRecv { .. }
		| LdapError::EndOfStream) => Error::ConnectionLost(err.to_string()),
		// 80 is the LDAP "other" result code
		err => Error::Protocol { code: 80, message: err.to_string() },
	}
}

/// Build a non-critical server side sort request control for one sort key.
fn sort_control(order: &OrderBy) -> RawControl {
	let mut key = ber_tlv(0x04, order.attribute.as_bytes());
	if order.descending {
		// reverseOrder [1] BOOLEAN TRUE
		key.extend(ber_tlv(0x81, &[0xff]));
	}
	let sort_key_list = ber_tlv(0x30, &ber_tlv(0x30, &key));
	RawControl { ctype: SERVER_SIDE_SORT_OID.to_owned(), crit: false, val: Some(sort_key_list) }
}

/// BER encode a single tag-length-value triple with definite length.
fn ber_tlv(tag: u8, value: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(value.len() + 6);
	out.push(tag);
	match u8::try_from(value.len()) {
		Ok(len) if len < 0x80 => out.push(len),
		_ => {
			let bytes = value.len().to_be_bytes();
			let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
			let count = u8::try_from(bytes.len() - first).unwrap_or(u8::MAX);
			out.push(0x80 | count);
			out.extend_from_slice(&bytes[first..]);
		}
	}
	out.extend_from_slice(value);
	out
}
