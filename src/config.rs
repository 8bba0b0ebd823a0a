//! Config for connecting to directory servers and pooling connections.
use std::{
	fmt,
	path::{Path, PathBuf},
	sync::Arc,
	time::Duration,
};

use ldap3::LdapConnSettings;
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Error;

/// Configuration for which variant of ISO8601 to use for parsing and
/// serializing time. Configured according the syntax definition
/// `( 1.3.6.1.4.1.1466.115.121.1.24 DESC 'Generalized Time' )` described in
/// RFC4517 section 3.1.13
pub const TIME_FORMAT: &[time::format_description::FormatItem] =
	time::macros::format_description!("[year][month][day][hour][minute][second]Z");

/// A directory server to connect to, together with the identity to bind as.
///
/// Immutable once constructed; clone it to share between pools.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Endpoint {
	/// The URL to connect to the server with. Supports ldap, ldaps, and ldapi
	/// schemes
	url: Url,
	/// The identity to bind as
	credentials: Credentials,
	/// Connection settings.
	#[serde(default)]
	connection: ConnectionConfig,
}

impl Endpoint {
	/// Create an endpoint with default connection settings.
	#[must_use]
	pub fn new(url: Url, credentials: Credentials) -> Self {
		Self { url, credentials, connection: ConnectionConfig::default() }
	}

	/// Replace the connection settings.
	#[must_use]
	pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
		self.connection = connection;
		self
	}

	/// The server URL.
	#[must_use]
	pub fn url(&self) -> &Url {
		&self.url
	}

	/// Host name of the server, if the URL has one.
	#[must_use]
	pub fn host(&self) -> Option<&str> {
		self.url.host_str()
	}

	/// Port of the server, falling back to the scheme's well-known port.
	#[must_use]
	pub fn port(&self) -> Option<u16> {
		self.url.port().or(match self.url.scheme() {
			"ldap" => Some(389),
			"ldaps" => Some(636),
			_ => None,
		})
	}

	/// Whether the session is protected by TLS, either on a dedicated port or
	/// via StartTLS.
	#[must_use]
	pub fn uses_tls(&self) -> bool {
		self.url.scheme() == "ldaps" || self.connection.tls.starttls
	}

	/// The bind identity.
	#[must_use]
	pub fn credentials(&self) -> &Credentials {
		&self.credentials
	}

	/// The connection settings.
	#[must_use]
	pub fn connection(&self) -> &ConnectionConfig {
		&self.connection
	}
}

/// Simple bind credentials. An empty DN and password bind anonymously.
#[derive(Deserialize, Serialize, Clone, Default)]
pub struct Credentials {
	/// The DN to bind as
	pub bind_dn: String,
	/// The password to bind with
	pub password: String,
}

impl Credentials {
	/// Credentials for a simple bind.
	#[must_use]
	pub fn new(bind_dn: impl Into<String>, password: impl Into<String>) -> Self {
		Self { bind_dn: bind_dn.into(), password: password.into() }
	}

	/// Credentials for an anonymous bind.
	#[must_use]
	pub fn anonymous() -> Self {
		Self::default()
	}
}

impl fmt::Debug for Credentials {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Credentials")
			.field("bind_dn", &self.bind_dn)
			.field("password", &"<redacted>")
			.finish()
	}
}

/// Configuration for how to connect to the LDAP server
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionConfig {
	/// Timeout to establish a connection in seconds.
	pub timeout: u64,

	/// LDAP operation timeout. For search per page.
	pub operation_timeout: Duration,

	/// How long a connection may go without a successful operation before a
	/// liveness check actively probes the server.
	pub probe_after: Duration,

	/// TLS config
	#[serde(default)]
	pub tls: TLSConfig,
}

impl Default for ConnectionConfig {
	fn default() -> Self {
		Self {
			timeout: 5,
			operation_timeout: Duration::from_secs(30),
			probe_after: Duration::from_secs(60),
			tls: TLSConfig::default(),
		}
	}
}

/// TLS Configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TLSConfig {
	/// Use StartTLS extended operation for establishing a secure connection,
	/// rather than TLS on a dedicated port.
	pub starttls: bool,

	/// Disable verification of TLS certificates
	pub no_tls_verify: bool,

	/// TLS root certificates path
	pub root_certificates_path: Option<PathBuf>,

	/// Path of the TLS client key to use for the connection
	pub client_key_path: Option<PathBuf>,

	/// Path of the TLS client certificate to use for the connection
	pub client_certificate_path: Option<PathBuf>,
}

/// Sizing and eviction settings of a connection pool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
	/// Upper bound on connections alive at once, idle and checked out
	/// together.
	pub max_size: usize,
	/// Idle connections older than this are health-checked before reuse and
	/// closed if the check fails.
	pub idle_timeout: Duration,
}

impl Default for PoolConfig {
	fn default() -> Self {
		Self { max_size: 5, idle_timeout: Duration::from_secs(300) }
	}
}

impl PoolConfig {
	/// Check the settings are usable.
	pub(crate) fn validate(&self) -> Result<(), Error> {
		if self.max_size == 0 {
			return Err(Error::Invalid("Pool max_size must be at least 1".to_owned()));
		}
		if u32::try_from(self.max_size).is_err() {
			return Err(Error::Invalid("Pool max_size is too large".to_owned()));
		}
		Ok(())
	}
}

impl ConnectionConfig {
	/// Create a [`LdapConnSettings`] based on this [`ConnectionConfig`]
	pub(crate) async fn to_settings(&self) -> Result<LdapConnSettings, Error> {
		let mut settings = LdapConnSettings::new();

		settings = settings.set_conn_timeout(Duration::from_secs(self.timeout));
		settings = settings.set_starttls(self.tls.starttls);
		settings = settings.set_no_tls_verify(self.tls.no_tls_verify);

		if let Some(path) = &self.tls.root_certificates_path {
			let mut roots = RootCertStore::empty();
			for certificate in read_certificates(path).await? {
				roots
					.add(&certificate)
					.map_err(|_| Error::Invalid("Could not read root certificate".to_owned()))?;
			}

			let builder =
				ClientConfig::builder().with_safe_defaults().with_root_certificates(roots);

			let config = match (&self.tls.client_key_path, &self.tls.client_certificate_path) {
				(Some(key_path), Some(cert_path)) => {
					let chain = read_certificates(cert_path).await?;
					let key = read_private_key(key_path).await?;
					builder.with_client_auth_cert(chain, key).map_err(|_| {
						Error::Invalid("Could not read client certificates".to_owned())
					})?
				}
				(None, None) => builder.with_no_client_auth(),
				_ => {
					return Err(Error::Invalid(
						"Both a client certificate and key file in PKCS8 format must be specified"
							.to_owned(),
					))
				}
			};

			settings = settings.set_config(Arc::new(config));
		}
		Ok(settings)
	}
}

/// Read every certificate in a PEM file.
async fn read_certificates(path: &Path) -> Result<Vec<Certificate>, Error> {
	let pem = tokio::fs::read(path).await?;
	let certificates = rustls_pemfile::certs(&mut pem.as_slice())
		.map_err(|_| Error::Invalid("Could not parse PEM certificates".to_owned()))?;
	if certificates.is_empty() {
		return Err(Error::Invalid(format!("No certificates found in {}", path.display())));
	}
	Ok(certificates.into_iter().map(Certificate).collect())
}

/// Read the first PKCS8 private key in a PEM file.
async fn read_private_key(path: &Path) -> Result<PrivateKey, Error> {
	let pem = tokio::fs::read(path).await?;
	let mut keys = rustls_pemfile::pkcs8_private_keys(&mut pem.as_slice())
		.map_err(|_| Error::Invalid("Could not parse PEM private key".to_owned()))?;
	if keys.is_empty() {
		return Err(Error::Invalid(format!("No PKCS8 key found in {}", path.display())));
	}
	Ok(PrivateKey(keys.swap_remove(0)))
}
