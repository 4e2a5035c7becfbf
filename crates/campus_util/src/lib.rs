#![forbid(unsafe_code)]

pub mod endpoint {
	use std::fmt;
	use std::io;
	use std::net::SocketAddr;
	use std::str::FromStr;

	use thiserror::Error;

	#[derive(Debug, Clone, PartialEq, Eq, Error)]
	pub enum EndpointError {
		#[error("endpoint is empty")]
		Empty,

		#[error("unsupported scheme in {0:?} (use ws:// or http://)")]
		UnsupportedScheme(String),

		#[error("listen endpoint {0:?} must not carry a path, query or fragment")]
		HasPath(String),

		#[error("listen endpoint {0:?} has no host")]
		MissingHost(String),

		#[error("listen endpoint {0:?} has no port")]
		MissingPort(String),

		#[error("bad port in {0:?}")]
		InvalidPort(String),

		#[error("IPv6 host in {0:?} must be bracketed, e.g. ws://[::1]:8081")]
		UnbracketedIpv6(String),
	}

	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
	pub enum Scheme {
		Ws,
		Http,
	}

	impl Scheme {
		pub const fn as_str(self) -> &'static str {
			match self {
				Scheme::Ws => "ws",
				Scheme::Http => "http",
			}
		}
	}

	/// Where the gateway listens, as given on the command line.
	///
	/// The host is kept unresolved until `resolve` so names like `localhost` work.
	/// IPv6 hosts are stored without brackets.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct ListenEndpoint {
		pub scheme: Scheme,
		pub host: String,
		/// `0` asks the OS for an ephemeral port.
		pub port: u16,
	}

	impl ListenEndpoint {
		pub fn parse(s: &str) -> Result<Self, EndpointError> {
			let raw = s.trim();
			if raw.is_empty() {
				return Err(EndpointError::Empty);
			}

			let (scheme, authority) = match raw.split_once("://") {
				Some(("ws", rest)) => (Scheme::Ws, rest),
				Some(("http", rest)) => (Scheme::Http, rest),
				_ => return Err(EndpointError::UnsupportedScheme(raw.to_string())),
			};

			// A bare trailing slash is harmless; anything after it is not.
			let authority = authority.strip_suffix('/').unwrap_or(authority);
			if authority.contains(['/', '?', '#']) {
				return Err(EndpointError::HasPath(raw.to_string()));
			}

			let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
				let (host, rest) = bracketed
					.split_once(']')
					.ok_or_else(|| EndpointError::UnbracketedIpv6(raw.to_string()))?;
				let port = rest
					.strip_prefix(':')
					.ok_or_else(|| EndpointError::MissingPort(raw.to_string()))?;
				(host, port)
			} else {
				let (host, port) = authority
					.rsplit_once(':')
					.ok_or_else(|| EndpointError::MissingPort(raw.to_string()))?;
				if host.contains(':') {
					return Err(EndpointError::UnbracketedIpv6(raw.to_string()));
				}
				(host, port)
			};

			if host.is_empty() {
				return Err(EndpointError::MissingHost(raw.to_string()));
			}
			if port.is_empty() {
				return Err(EndpointError::MissingPort(raw.to_string()));
			}
			let port = port
				.parse::<u16>()
				.map_err(|_| EndpointError::InvalidPort(raw.to_string()))?;

			Ok(Self {
				scheme,
				host: host.to_string(),
				port,
			})
		}

		/// Resolve the host (IP literal or DNS name) to the first address it maps to.
		pub async fn resolve(&self) -> io::Result<SocketAddr> {
			tokio::net::lookup_host((self.host.as_str(), self.port))
				.await?
				.next()
				.ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{self} resolved to no addresses")))
		}
	}

	impl fmt::Display for ListenEndpoint {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			if self.host.contains(':') {
				write!(f, "{}://[{}]:{}", self.scheme.as_str(), self.host, self.port)
			} else {
				write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
			}
		}
	}

	impl FromStr for ListenEndpoint {
		type Err = EndpointError;

		fn from_str(s: &str) -> Result<Self, Self::Err> {
			Self::parse(s)
		}
	}

}
