//! Host address parsing

use std::fmt;

use crate::{Error, Result};

/// Port used when neither the host string nor the options name one
pub const DEFAULT_SSH_PORT: u16 = 22;

/// A remote host as requested on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTarget {
    pub host: String,
    pub port: u16,
    /// Per-host login name from `user@host`
    pub user: Option<String>,
}

impl HostTarget {
    /// Parse `host`, `host:port`, `user@host[:port]` or `[v6addr]:port`.
    ///
    /// A bare IPv6 address (more than one colon, no brackets) is taken as the
    /// host with the default port.
    pub fn parse(input: &str, default_port: Option<u16>) -> Result<Self> {
        let default_port = default_port.unwrap_or(DEFAULT_SSH_PORT);
        let input = input.trim();

        let (user, rest) = match input.rsplit_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
            Some((_, _)) => return Err(invalid(input, "empty user name")),
            None => (None, input),
        };

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid(input, "missing closing bracket"))?;
            let port = match tail {
                "" => default_port,
                tail => match tail.strip_prefix(':') {
                    Some(port) => parse_port(input, port)?,
                    None => return Err(invalid(input, "unexpected text after bracket")),
                },
            };
            (host, port)
        } else {
            match rest.matches(':').count() {
                0 => (rest, default_port),
                1 => {
                    let (host, port) = rest.split_once(':').unwrap_or((rest, ""));
                    (host, parse_port(input, port)?)
                }
                _ => (rest, default_port),
            }
        };

        if host.is_empty() {
            return Err(invalid(input, "empty host"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            user,
        })
    }

    /// Address tuple handed to the transport
    pub fn addr(&self) -> (&str, u16) {
        (self.host.as_str(), self.port)
    }
}

impl fmt::Display for HostTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn parse_port(input: &str, port: &str) -> Result<u16> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(invalid(input, &format!("invalid port '{}'", port))),
        Ok(port) => Ok(port),
    }
}

fn invalid(input: &str, reason: &str) -> Error {
    Error::ConnectionError(format!("Invalid host address '{}': {}", input, reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_host() {
        let target = HostTarget::parse("node1", None).unwrap();
        assert_eq!(target.host, "node1");
        assert_eq!(target.port, 22);
        assert_eq!(target.user, None);
    }

    #[test]
    fn test_parse_host_port_and_default() {
        assert_eq!(HostTarget::parse("node1:2222", None).unwrap().port, 2222);
        assert_eq!(HostTarget::parse("node1", Some(2200)).unwrap().port, 2200);
        // An explicit port wins over the default
        assert_eq!(HostTarget::parse("node1:2222", Some(2200)).unwrap().port, 2222);
    }

    #[test]
    fn test_parse_user_prefix() {
        let target = HostTarget::parse("deploy@10.0.0.5:2022", None).unwrap();
        assert_eq!(target.user.as_deref(), Some("deploy"));
        assert_eq!(target.host, "10.0.0.5");
        assert_eq!(target.port, 2022);
        assert_eq!(target.to_string(), "deploy@10.0.0.5:2022");
    }

    #[test]
    fn test_parse_ipv6() {
        let bracketed = HostTarget::parse("[fe80::1]:2222", None).unwrap();
        assert_eq!(bracketed.host, "fe80::1");
        assert_eq!(bracketed.port, 2222);

        let bare = HostTarget::parse("fe80::1", None).unwrap();
        assert_eq!(bare.host, "fe80::1");
        assert_eq!(bare.port, 22);
        assert_eq!(bare.to_string(), "[fe80::1]:22");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(HostTarget::parse("", None).is_err());
        assert!(HostTarget::parse("node1:abc", None).is_err());
        assert!(HostTarget::parse("node1:0", None).is_err());
        assert!(HostTarget::parse("@node1", None).is_err());
        assert!(HostTarget::parse("[fe80::1", None).is_err());
    }
}
