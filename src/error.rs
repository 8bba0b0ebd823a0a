//! Error codes
use std::{collections::BTreeMap, time::Duration};

/// Errors that can occur when using this library
#[derive(thiserror::Error, Debug)]
pub enum Error {
	/// The directory server could not be reached, or the session could not be
	/// established.
	#[error("Failed to connect: {0}")]
	Connect(String),
	/// The server rejected the bind credentials.
	#[error("Authentication failed")]
	Authentication,
	/// The transport failed mid-operation. The connection has been marked dead
	/// and will not be reused.
	#[error("Connection lost: {0}")]
	ConnectionLost(String),
	/// No pooled connection became available within the checkout timeout.
	#[error("No connection available within {0:?}")]
	PoolExhausted(Duration),
	/// The pool has been shut down.
	#[error("Connection pool is closed")]
	PoolClosed,
	/// A filter could not be rendered into valid filter syntax.
	#[error("Invalid search filter: {0}")]
	FilterSyntax(String),
	/// The entry an operation targeted does not exist.
	#[error("No such object: {0}")]
	NotFound(String),
	/// The bound identity is not allowed to perform the operation.
	#[error("Permission denied for {0}")]
	Permission(String),
	/// An entry already exists at the DN an add targeted.
	#[error("Object already exists: {0}")]
	AlreadyExists(String),
	/// The server returned any other non-success result.
	#[error("Directory error {code}: {message}")]
	Protocol {
		/// The LDAP result code
		code: u32,
		/// The diagnostic message returned by the server
		message: String,
	},
	/// A directory operation did not complete within the operation timeout.
	#[error("Operation timed out after {0:?}")]
	Timeout(Duration),
	/// A mapped record was used after it had been deleted.
	#[error("Record has been deleted")]
	StaleRecord,
	/// No schema is registered under the given record type name.
	#[error("No schema registered for '{0}'")]
	UnknownSchema(String),
	/// A field name is not declared in the record's schema.
	#[error("Unknown field '{0}'")]
	UnknownField(String),
	/// One or more field values failed validation, keyed by field name.
	#[error("Validation failed: {0:?}")]
	Validation(BTreeMap<String, String>),
	/// The contents of an attribute or a configuration value did not conform
	/// to the expected syntax.
	#[error("Malformed data: {0}")]
	Invalid(String),
	/// Reading local resources (such as TLS material) failed.
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

impl Error {
	/// Classify a non-success LDAP result code.
	#[must_use]
	pub fn from_result_code(code: u32, message: &str, dn: &str) -> Self {
		match code {
			32 => Error::NotFound(dn.to_owned()),
			8 | 50 => Error::Permission(dn.to_owned()),
			49 => Error::Authentication,
			68 => Error::AlreadyExists(dn.to_owned()),
			_ => Error::Protocol { code, message: message.to_owned() },
		}
	}

	/// Whether this error means the underlying transport is gone.
	#[must_use]
	pub fn is_connection_lost(&self) -> bool {
		matches!(self, Error::ConnectionLost(_))
	}
}
