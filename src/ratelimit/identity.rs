//! Client identification.
//!
//! A request is attributed to an explicit client id header first, then to
//! the authenticated principal, and finally to the caller's IP address.

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Header set by proxies with the original client chain.
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header set by proxies with the original client address.
pub const X_REAL_IP: &str = "x-real-ip";

/// Identity a request is counted against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientIdentity {
    /// Value of the client id header
    Client(String),
    /// Authenticated user
    User(String),
    /// Caller IP address, or `unknown`
    Ip(String),
}

impl ClientIdentity {
    /// The storage key form, e.g. `user:42`.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientIdentity::Client(id) => write!(f, "client:{}", id),
            ClientIdentity::User(id) => write!(f, "user:{}", id),
            ClientIdentity::Ip(addr) => write!(f, "ip:{}", addr),
        }
    }
}

/// Principal attached to request extensions by the authentication layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedPrincipal {
    /// `sub` claim
    pub sub: Option<String>,
    /// `id` claim
    pub id: Option<String>,
    /// Display name
    pub name: Option<String>,
}

impl AuthenticatedPrincipal {
    pub fn with_sub(sub: impl Into<String>) -> Self {
        Self {
            sub: Some(sub.into()),
            ..Self::default()
        }
    }

    /// First non-empty of `sub`, `id` and `name`.
    pub fn user_id(&self) -> Option<&str> {
        [&self.sub, &self.id, &self.name]
            .into_iter()
            .filter_map(|claim| claim.as_deref())
            .map(str::trim)
            .find(|claim| !claim.is_empty())
    }
}

/// The parts of a request that identification looks at.
#[derive(Debug, Clone, Copy)]
pub struct RequestMeta<'a> {
    pub headers: &'a HeaderMap,
    pub principal: Option<&'a AuthenticatedPrincipal>,
    pub peer: Option<SocketAddr>,
}

impl<'a> RequestMeta<'a> {
    pub fn new(headers: &'a HeaderMap) -> Self {
        Self {
            headers,
            principal: None,
            peer: None,
        }
    }

    pub fn with_principal(mut self, principal: Option<&'a AuthenticatedPrincipal>) -> Self {
        self.principal = principal;
        self
    }

    pub fn with_peer(mut self, peer: Option<SocketAddr>) -> Self {
        self.peer = peer;
        self
    }

    fn header(&self, name: &str) -> Option<&'a str> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Caller address as seen through any proxies in front of us.
    ///
    /// `X-Real-IP` is only consulted when `X-Forwarded-For` is absent.
    pub fn client_ip(&self) -> Option<IpAddr> {
        match self.header(X_FORWARDED_FOR) {
            Some(forwarded) => {
                let first = forwarded.split(',').next().map(str::trim).unwrap_or_default();
                if let Ok(ip) = first.parse::<IpAddr>() {
                    return Some(ip);
                }
            }
            None => {
                if let Some(ip) = self.header(X_REAL_IP).and_then(|v| v.parse::<IpAddr>().ok()) {
                    return Some(ip);
                }
            }
        }

        self.peer.map(|addr| addr.ip())
    }
}

/// Work out who a request should be counted against.
pub fn identify_client(meta: &RequestMeta<'_>, client_id_header: &str) -> ClientIdentity {
    if let Some(client_id) = meta.header(client_id_header) {
        return ClientIdentity::Client(client_id.to_string());
    }

    if let Some(user) = meta.principal.and_then(AuthenticatedPrincipal::user_id) {
        return ClientIdentity::User(user.to_string());
    }

    match meta.client_ip() {
        Some(ip) => ClientIdentity::Ip(ip.to_string()),
        None => ClientIdentity::Ip("unknown".to_string()),
    }
}

/// Addresses that bypass rate limiting entirely.
///
/// Matched against [`RequestMeta::client_ip`], which takes `X-Forwarded-For`
/// and `X-Real-IP` at face value. Deploy behind a proxy that overwrites both
/// headers; otherwise any caller can claim a whitelisted address, loopback
/// included.
#[derive(Debug, Clone, Default)]
pub struct IpWhitelist {
    addresses: Vec<IpAddr>,
    loopback: bool,
}

impl IpWhitelist {
    /// Build from configured entries. `localhost` and loopback addresses
    /// admit every loopback caller; unparseable entries are skipped.
    pub fn new<S: AsRef<str>>(entries: &[S]) -> Self {
        let mut whitelist = Self::default();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.eq_ignore_ascii_case("localhost") {
                whitelist.loopback = true;
                continue;
            }
            if let Ok(ip) = entry.parse::<IpAddr>() {
                whitelist.loopback |= ip.is_loopback();
                whitelist.addresses.push(ip);
            }
        }
        whitelist
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty() && !self.loopback
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        (self.loopback && ip.is_loopback()) || self.addresses.contains(&ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    fn peer() -> Option<SocketAddr> {
        Some("10.1.2.3:5555".parse().unwrap())
    }

    #[test]
    fn test_client_header_wins() {
        let headers = headers(&[("x-client-id", "mobile-app"), ("x-forwarded-for", "8.8.8.8")]);
        let principal = AuthenticatedPrincipal::with_sub("42");
        let meta = RequestMeta::new(&headers)
            .with_principal(Some(&principal))
            .with_peer(peer());

        assert_eq!(
            identify_client(&meta, "X-Client-Id"),
            ClientIdentity::Client("mobile-app".to_string())
        );
    }

    #[test]
    fn test_principal_claim_order() {
        let headers = HeaderMap::new();
        let principal = AuthenticatedPrincipal {
            sub: None,
            id: Some("7".to_string()),
            name: Some("alice".to_string()),
        };
        let meta = RequestMeta::new(&headers).with_principal(Some(&principal));
        assert_eq!(identify_client(&meta, "X-Client-Id").key(), "user:7");

        let principal = AuthenticatedPrincipal {
            name: Some("alice".to_string()),
            ..Default::default()
        };
        let meta = RequestMeta::new(&headers).with_principal(Some(&principal));
        assert_eq!(identify_client(&meta, "X-Client-Id").key(), "user:alice");
    }

    #[test]
    fn test_empty_principal_falls_back_to_ip() {
        let headers = HeaderMap::new();
        let principal = AuthenticatedPrincipal::default();
        let meta = RequestMeta::new(&headers)
            .with_principal(Some(&principal))
            .with_peer(peer());
        assert_eq!(identify_client(&meta, "X-Client-Id").key(), "ip:10.1.2.3");
    }

    #[test]
    fn test_forwarded_for_first_entry() {
        let headers = headers(&[("x-forwarded-for", "203.0.113.9, 10.0.0.1")]);
        let meta = RequestMeta::new(&headers).with_peer(peer());
        assert_eq!(identify_client(&meta, "X-Client-Id").key(), "ip:203.0.113.9");
    }

    #[test]
    fn test_invalid_forwarded_for_skips_real_ip() {
        let headers = headers(&[("x-forwarded-for", "not-an-ip"), ("x-real-ip", "198.51.100.4")]);
        let meta = RequestMeta::new(&headers).with_peer(peer());
        assert_eq!(identify_client(&meta, "X-Client-Id").key(), "ip:10.1.2.3");
    }

    #[test]
    fn test_real_ip_without_forwarded_for() {
        let headers = headers(&[("x-real-ip", "198.51.100.4")]);
        let meta = RequestMeta::new(&headers).with_peer(peer());
        assert_eq!(identify_client(&meta, "X-Client-Id").key(), "ip:198.51.100.4");
    }

    #[test]
    fn test_unknown_without_any_address() {
        let headers = HeaderMap::new();
        let meta = RequestMeta::new(&headers);
        assert_eq!(identify_client(&meta, "X-Client-Id").key(), "ip:unknown");
    }

    #[test]
    fn test_whitelist_loopback_equivalence() {
        let whitelist = IpWhitelist::new(&["127.0.0.1"]);
        assert!(whitelist.contains("127.0.0.1".parse().unwrap()));
        assert!(whitelist.contains("::1".parse().unwrap()));
        assert!(!whitelist.contains("10.0.0.1".parse().unwrap()));

        let whitelist = IpWhitelist::new(&["localhost"]);
        assert!(whitelist.contains("127.0.0.5".parse().unwrap()));
    }

    #[test]
    fn test_whitelist_sees_forwarded_address() {
        let headers = headers(&[("x-forwarded-for", "127.0.0.1")]);
        let meta = RequestMeta::new(&headers).with_peer(peer());
        let whitelist = IpWhitelist::new(&["127.0.0.1"]);

        let ip = meta.client_ip().unwrap();
        assert_eq!(ip, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert!(whitelist.contains(ip));
        assert!(!whitelist.contains(peer().unwrap().ip()));
    }

    #[test]
    fn test_whitelist_exact_match() {
        let whitelist = IpWhitelist::new(&["192.168.1.10", "garbage"]);
        assert!(!whitelist.is_empty());
        assert!(whitelist.contains("192.168.1.10".parse().unwrap()));
        assert!(!whitelist.contains("192.168.1.11".parse().unwrap()));
        assert!(!whitelist.contains("127.0.0.1".parse().unwrap()));
        assert!(IpWhitelist::new::<&str>(&[]).is_empty());
    }
}
