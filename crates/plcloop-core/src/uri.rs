//! Connection strings.
//!
//! ```text
//! <scheme>://<host>[:<port>][/<path>][?<options>]
//! ```
//!
//! Only the structure is checked here. What the host, path and options mean
//! is up to the driver selected by the scheme.

use std::{collections::BTreeMap, fmt, str::FromStr};

use crate::error::UriError;

/// Parsed connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    scheme: String,
    host: String,
    port: Option<u16>,
    path: Option<String>,
    options: BTreeMap<String, String>,
}

impl ConnectionString {
    /// Parse a connection string.
    pub fn parse(input: &str) -> Result<Self, UriError> {
        let input = input.trim();
        let (scheme, rest) = input.split_once("://").ok_or(UriError::MissingSeparator)?;

        if !is_valid_scheme(scheme) {
            return Err(UriError::InvalidScheme(scheme.to_string()));
        }

        let (rest, query) = match rest.split_once('?') {
            Some((rest, query)) => (rest, Some(query)),
            None => (rest, None),
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], Some(&rest[idx + 1..])),
            None => (rest, None),
        };

        let (host, port) = split_authority(authority)?;
        let options = query.map(parse_options).transpose()?.unwrap_or_default();

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_string(),
            port,
            path: path.filter(|p| !p.is_empty()).map(str::to_string),
            options,
        })
    }

    /// Scheme, lowercased.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Host name or address. IPv6 literals are returned without brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Explicit port. `None` if the driver default applies.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Path after the authority, without the leading `/`. `None` if absent.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Value of a query option. Bare keys have an empty value.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// All query options, sorted by key.
    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }
}

impl FromStr for ConnectionString {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme)?;
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        if let Some(path) = &self.path {
            write!(f, "/{path}")?;
        }
        let mut sep = '?';
        for (key, value) in &self.options {
            if value.is_empty() {
                write!(f, "{sep}{key}")?;
            } else {
                write!(f, "{sep}{key}={value}")?;
            }
            sep = '&';
        }
        Ok(())
    }
}

fn is_valid_scheme(scheme: &str) -> bool {
    let mut chars = scheme.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

fn split_authority(authority: &str) -> Result<(&str, Option<u16>), UriError> {
    if authority.is_empty() {
        return Err(UriError::MissingHost);
    }

    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, tail) =
            bracketed.split_once(']').ok_or_else(|| UriError::InvalidHost(authority.to_string()))?;
        match tail {
            "" => (host, None),
            _ => {
                let port = tail
                    .strip_prefix(':')
                    .ok_or_else(|| UriError::InvalidHost(authority.to_string()))?;
                (host, Some(port))
            },
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(UriError::MissingHost);
    }
    if host.chars().any(|c| c.is_whitespace() || matches!(c, '@' | '[' | ']' | '#')) {
        return Err(UriError::InvalidHost(host.to_string()));
    }

    let port = port
        .map(|p| p.parse::<u16>().map_err(|_| UriError::InvalidPort(p.to_string())))
        .transpose()?;

    Ok((host, port))
}

fn parse_options(query: &str) -> Result<BTreeMap<String, String>, UriError> {
    let mut options = BTreeMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if key.is_empty() {
            return Err(UriError::InvalidOption(pair.to_string()));
        }
        options.insert(key.to_string(), value.to_string());
    }
    Ok(options)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn parses_full_form() {
        let uri: ConnectionString =
            "s7://192.168.42.20:102/rack0/slot1?pdu-size=480&debug".parse().unwrap();

        assert_eq!(uri.scheme(), "s7");
        assert_eq!(uri.host(), "192.168.42.20");
        assert_eq!(uri.port(), Some(102));
        assert_eq!(uri.path(), Some("rack0/slot1"));
        assert_eq!(uri.option("pdu-size"), Some("480"));
        assert_eq!(uri.option("debug"), Some(""));
        assert_eq!(uri.option("missing"), None);
    }

    #[test]
    fn parses_minimal_form() {
        let uri = ConnectionString::parse("mock://host").unwrap();
        assert_eq!(uri.scheme(), "mock");
        assert_eq!(uri.host(), "host");
        assert_eq!(uri.port(), None);
        assert_eq!(uri.path(), None);
        assert!(uri.options().is_empty());
    }

    #[test]
    fn scheme_is_lowercased() {
        let uri = ConnectionString::parse("Modbus-TCP://plc").unwrap();
        assert_eq!(uri.scheme(), "modbus-tcp");
    }

    #[test]
    fn ipv6_literal() {
        let uri = ConnectionString::parse("s7://[fe80::1]:102").unwrap();
        assert_eq!(uri.host(), "fe80::1");
        assert_eq!(uri.port(), Some(102));
        assert_eq!(uri.to_string(), "s7://[fe80::1]:102");
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(ConnectionString::parse("192.168.0.1"), Err(UriError::MissingSeparator));
        assert_eq!(ConnectionString::parse("://host"), Err(UriError::InvalidScheme(String::new())));
        assert_eq!(
            ConnectionString::parse("7s://host"),
            Err(UriError::InvalidScheme("7s".to_string()))
        );
        assert_eq!(ConnectionString::parse("s7://"), Err(UriError::MissingHost));
        assert_eq!(ConnectionString::parse("s7://:102"), Err(UriError::MissingHost));
        assert_eq!(
            ConnectionString::parse("s7://host:99999"),
            Err(UriError::InvalidPort("99999".to_string()))
        );
        assert_eq!(
            ConnectionString::parse("s7://ho st"),
            Err(UriError::InvalidHost("ho st".to_string()))
        );
        assert_eq!(
            ConnectionString::parse("s7://host?=1"),
            Err(UriError::InvalidOption("=1".to_string()))
        );
    }

    #[test]
    fn display_is_canonical() {
        let uri = ConnectionString::parse("S7://plc:102/db?b=2&a=1").unwrap();
        assert_eq!(uri.to_string(), "s7://plc:102/db?a=1&b=2");
    }

    proptest! {
        #[test]
        fn prop_parse_never_panics(input in ".{0,64}") {
            let _ = ConnectionString::parse(&input);
        }

        #[test]
        fn prop_display_reparses(
            scheme in "[a-z][a-z0-9+.-]{0,8}",
            host in "[a-z0-9.-]{1,16}",
            port in proptest::option::of(any::<u16>()),
        ) {
            let mut input = format!("{scheme}://{host}");
            if let Some(port) = port {
                input.push_str(&format!(":{port}"));
            }
            let uri = ConnectionString::parse(&input)?;
            let reparsed = ConnectionString::parse(&uri.to_string())?;
            prop_assert_eq!(uri, reparsed);
        }
    }
}
