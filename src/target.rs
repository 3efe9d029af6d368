//! Target URL parsing and canonicalisation (§4.5 of the design doc).
//!
//! The grammar is deliberately hand-parsed rather than handed to a generic
//! URL crate: IRC channel names conventionally start with `#`, which is the
//! fragment delimiter in RFC 3986 and would make a generic parser split the
//! channel name away from the path on every single target. A few dozen
//! lines of manual slicing sidestep that collision entirely.
//!
//! Grammar: `("irc"|"ircs") "://" host [":" port] "/" ["#"|"&"] channel ["?" key] ["#" nick]`

use std::fmt;

use crate::error::TargetError;

/// Plain-text default port for `irc://`.
pub const DEFAULT_PORT_PLAIN: u16 = 6667;
/// TLS default port for `ircs://`.
pub const DEFAULT_PORT_TLS: u16 = 6697;

/// A parsed, canonical reference to one IRC channel on one IRC server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub tls: bool,
    pub host: String,
    pub port: u16,
    pub channel: String,
    pub key: Option<String>,
    pub nick: Option<String>,
}

/// The identity that determines connection sharing: every [`Target`] that
/// resolves to the same key is served by the same server session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerKey {
    pub tls: bool,
    pub host: String,
    pub port: u16,
    pub nick: String,
}

impl fmt::Display for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "ircs" } else { "irc" };
        write!(f, "{scheme}://{}@{}:{}", self.nick, self.host, self.port)
    }
}

impl Target {
    /// Resolve the [`ServerKey`] this target belongs to, falling back to
    /// `default_nick` when the URL carries no `nick=` override.
    pub fn server_key(&self, default_nick: &str) -> ServerKey {
        ServerKey {
            tls: self.tls,
            host: self.host.clone(),
            port: self.port,
            nick: self.nick.clone().unwrap_or_else(|| default_nick.to_string()),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "ircs" } else { "irc" };
        write!(f, "{scheme}://{}:{}/{}", self.host, self.port, self.channel)?;
        match (&self.key, &self.nick) {
            (Some(key), Some(nick)) => write!(f, "?key={key}&nick={nick}"),
            (Some(key), None) => write!(f, "?key={key}"),
            (None, Some(nick)) => write!(f, "?nick={nick}"),
            (None, None) => Ok(()),
        }
    }
}

impl std::str::FromStr for Target {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

fn parse(s: &str) -> Result<Target, TargetError> {
    let (scheme, rest) = s
        .split_once("://")
        .ok_or_else(|| TargetError::Malformed(s.to_string()))?;

    let tls = match scheme.to_ascii_lowercase().as_str() {
        "irc" => false,
        "ircs" => true,
        other => return Err(TargetError::UnsupportedScheme(other.to_string())),
    };

    let (authority, path) = rest
        .split_once('/')
        .ok_or(TargetError::MissingChannel)?;
    if authority.is_empty() {
        return Err(TargetError::MissingHost);
    }

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port_str)) if !host.is_empty() => {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| TargetError::Malformed(format!("invalid port {port_str:?}")))?;
            (host, port)
        }
        _ => (
            authority,
            if tls {
                DEFAULT_PORT_TLS
            } else {
                DEFAULT_PORT_PLAIN
            },
        ),
    };
    if host.is_empty() {
        return Err(TargetError::MissingHost);
    }
    let host = host.to_ascii_lowercase();

    // Split `path` into channel / query / fragment. The channel never
    // contains '?', so the first '?' unambiguously starts the query, and
    // within that remainder the first '#' starts the nick-override suffix.
    let (channel_raw, query_and_fragment) = match path.split_once('?') {
        Some((channel, rest)) => (channel, Some(rest)),
        None => (path, None),
    };
    if channel_raw.is_empty() {
        return Err(TargetError::MissingChannel);
    }
    let channel = if channel_raw.starts_with('#') || channel_raw.starts_with('&') {
        channel_raw.to_string()
    } else {
        format!("#{channel_raw}")
    };

    let mut key = None;
    let mut nick = None;
    if let Some(query_and_fragment) = query_and_fragment {
        let (query, fragment) = match query_and_fragment.split_once('#') {
            Some((query, fragment)) => (query, Some(fragment)),
            None => (query_and_fragment, None),
        };
        for param in query.split('&').filter(|p| !p.is_empty()) {
            match param.split_once('=') {
                Some(("key", value)) => key = Some(value.to_string()),
                Some(("nick", value)) => nick = Some(value.to_string()),
                Some(_) => {} // unrecognised key=value pair, ignored
                None => key = Some(param.to_string()), // bare `?<key>` shorthand
            }
        }
        if nick.is_none() {
            if let Some(fragment) = fragment {
                if !fragment.is_empty() {
                    nick = Some(fragment.to_string());
                }
            }
        }
    }

    Ok(Target {
        tls,
        host,
        port,
        channel,
        key,
        nick,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_target() {
        let t: Target = "irc://irc.example.net/channel".parse().unwrap();
        assert!(!t.tls);
        assert_eq!(t.host, "irc.example.net");
        assert_eq!(t.port, DEFAULT_PORT_PLAIN);
        assert_eq!(t.channel, "#channel");
        assert_eq!(t.key, None);
        assert_eq!(t.nick, None);
    }

    #[test]
    fn ircs_defaults_to_tls_port() {
        let t: Target = "ircs://irc.example.net/channel".parse().unwrap();
        assert!(t.tls);
        assert_eq!(t.port, DEFAULT_PORT_TLS);
    }

    #[test]
    fn explicit_port_overrides_default() {
        let t: Target = "irc://irc.example.net:7000/channel".parse().unwrap();
        assert_eq!(t.port, 7000);
    }

    #[test]
    fn host_is_case_folded() {
        let t: Target = "irc://IRC.Example.NET/channel".parse().unwrap();
        assert_eq!(t.host, "irc.example.net");
    }

    #[test]
    fn channel_prefix_defaults_to_hash() {
        let t: Target = "irc://host/chan".parse().unwrap();
        assert_eq!(t.channel, "#chan");
        let t: Target = "irc://host/&chan".parse().unwrap();
        assert_eq!(t.channel, "&chan");
        let t: Target = "irc://host/#chan".parse().unwrap();
        assert_eq!(t.channel, "#chan");
    }

    #[test]
    fn query_key_value_form() {
        let t: Target = "irc://host/#chan?key=secret".parse().unwrap();
        assert_eq!(t.key.as_deref(), Some("secret"));
    }

    #[test]
    fn query_bare_key_shorthand() {
        let t: Target = "irc://host/#chan?secret".parse().unwrap();
        assert_eq!(t.key.as_deref(), Some("secret"));
    }

    #[test]
    fn nick_override_via_query() {
        let t: Target = "irc://host/#chan?key=k&nick=relaybot".parse().unwrap();
        assert_eq!(t.key.as_deref(), Some("k"));
        assert_eq!(t.nick.as_deref(), Some("relaybot"));
    }

    #[test]
    fn nick_override_via_fragment() {
        let t: Target = "irc://host/#chan?key=k#relaybot".parse().unwrap();
        assert_eq!(t.nick.as_deref(), Some("relaybot"));
    }

    #[test]
    fn two_urls_differing_only_by_key_share_a_channel_identity() {
        let a: Target = "irc://host/#chan?key=one".parse().unwrap();
        let b: Target = "irc://host/#chan?key=two".parse().unwrap();
        assert_eq!(a.server_key("nick"), b.server_key("nick"));
        assert_eq!(a.channel, b.channel);
    }

    #[test]
    fn rejects_bad_scheme() {
        assert_eq!(
            "http://host/chan".parse::<Target>().unwrap_err(),
            TargetError::UnsupportedScheme("http".to_string())
        );
    }

    #[test]
    fn rejects_empty_host() {
        assert!(matches!(
            "irc:///chan".parse::<Target>().unwrap_err(),
            TargetError::MissingHost
        ));
    }

    #[test]
    fn rejects_empty_channel() {
        assert!(matches!(
            "irc://host/".parse::<Target>().unwrap_err(),
            TargetError::MissingChannel
        ));
    }

    #[test]
    fn round_trip_through_canonical_form() {
        let urls = [
            "irc://irc.example.net/channel",
            "ircs://Host.Example:6697/&chan?key=secret",
            "irc://host:7000/chan?key=k&nick=relaybot",
        ];
        for u in urls {
            let parsed: Target = u.parse().unwrap();
            let canonical = parsed.to_string();
            let reparsed: Target = canonical.parse().unwrap();
            assert_eq!(parsed, reparsed, "round trip failed for {u}");
        }
    }

    #[test]
    fn server_key_display_is_stable() {
        let t: Target = "ircs://Host:6697/chan?nick=bot".parse().unwrap();
        let key = t.server_key("default");
        assert_eq!(key.to_string(), "ircs://bot@host:6697");
    }
}
