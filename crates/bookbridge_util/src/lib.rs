#![forbid(unsafe_code)]

pub mod endpoint {
	/// Parsed `ws://host:port` endpoint.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct WsEndpoint {
		pub host: String,
		pub port: u16,
	}

	impl WsEndpoint {
		/// Returns `host:port` (host preserved, IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Parse a bind endpoint in the form `ws://host:port`.
		///
		/// A bare `host:port` is accepted as well.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected ws://host:port)".to_string());
			}

			let rest = s.strip_prefix("ws://").unwrap_or(s);
			if rest.contains("://") {
				return Err(format!("unsupported scheme (expected ws://host:port): {s}"));
			}

			if rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(format!("invalid endpoint (expected ws://host:port without path/query/fragment): {s}"));
			}

			let (host, port_str) = rest
				.rsplit_once(':')
				.ok_or_else(|| format!("invalid endpoint (missing :port, expected ws://host:port): {s}"))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(format!("invalid endpoint host (expected ws://host:port): {s}"));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(format!(
					"invalid endpoint host (IPv6 must be bracketed like ws://[::1]:8000): {s}"
				));
			}

			let port: u16 = port_str
				.trim()
				.parse()
				.map_err(|_| format!("invalid endpoint port (expected 0..=65535): {s}"))?;

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn parses_ipv4_with_and_without_scheme() {
			let e = WsEndpoint::parse("ws://0.0.0.0:8000").unwrap();
			assert_eq!(e.host, "0.0.0.0");
			assert_eq!(e.port, 8000);
			assert_eq!(WsEndpoint::parse("127.0.0.1:9000").unwrap().port, 9000);
		}

		#[test]
		fn parses_bracketed_ipv6() {
			let e = WsEndpoint::parse("ws://[::1]:8000").unwrap();
			assert_eq!(e.hostport(), "[::1]:8000");
		}

		#[test]
		fn rejects_other_schemes_and_paths() {
			assert!(WsEndpoint::parse("quic://127.0.0.1:8000").is_err());
			assert!(WsEndpoint::parse("ws://127.0.0.1:8000/ws").is_err());
			assert!(WsEndpoint::parse("ws://127.0.0.1").is_err());
			assert!(WsEndpoint::parse("ws://::1:8000").is_err());
		}

		#[test]
		fn dns_names_keep_their_host() {
			let e = WsEndpoint::parse("ws://books.example.com:443").unwrap();
			assert_eq!(e.hostport(), "books.example.com:443");
		}
	}
}

pub mod secret {
	use core::fmt;

	/// String wrapper that never prints its contents.
	#[derive(Clone, PartialEq, Eq)]
	pub struct SecretString(String);

	impl SecretString {
		pub fn new(s: impl Into<String>) -> Self {
			Self(s.into())
		}

		pub fn expose(&self) -> &str {
			&self.0
		}

		pub fn is_blank(&self) -> bool {
			self.0.trim().is_empty()
		}
	}

	impl fmt::Debug for SecretString {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			f.write_str("SecretString(<redacted>)")
		}
	}

	impl fmt::Display for SecretString {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			f.write_str("<redacted>")
		}
	}

	impl<'de> serde::Deserialize<'de> for SecretString {
		fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
		where
			D: serde::Deserializer<'de>,
		{
			let s = String::deserialize(deserializer)?;
			Ok(SecretString::new(s))
		}
	}

}
