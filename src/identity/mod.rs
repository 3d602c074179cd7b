//! Working out who a request belongs to.

pub mod token;

use actix_web::HttpRequest;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use token::TokenVerifier;

pub const DEFAULT_TOKEN_COOKIE: &str = "token";

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";
const FALLBACK_IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Derives the identity tag a request is counted against.
///
/// Signed in users are tagged `user:<id>` so their quota follows them across networks. Everyone
/// else is tagged `ip:<address>`, taken from the first of:
///
/// 1. the first entry of `X-Forwarded-For`
/// 2. `X-Real-IP`
/// 3. the connection peer address
/// 4. `127.0.0.1`
///
/// # Security
///
/// The forwarding headers are trusted as sent. Only deploy this behind a proxy that you control
/// and that overwrites them, otherwise anonymous clients can pick their own identity.
///
/// # IPv6
///
/// IPv6 addresses are not tagged by their full address. Clients are usually handed a whole /64,
/// so every address in one is tagged `ip:<prefix>::/64` and shares a single quota, e.g.
/// `2a00:1450:4009:81f::200e` becomes `ip:2a00:1450:4009:81f::/64`. IPv4-mapped addresses are
/// tagged as plain IPv4.
#[derive(Clone)]
pub struct IdentifierResolver {
    verifier: Option<Arc<dyn TokenVerifier>>,
    cookie_name: String,
}

impl IdentifierResolver {
    /// Without a verifier every request is identified by address.
    pub fn new(verifier: Option<Arc<dyn TokenVerifier>>) -> Self {
        Self {
            verifier,
            cookie_name: DEFAULT_TOKEN_COOKIE.to_owned(),
        }
    }

    /// Read the session token from a cookie other than `token`.
    pub fn with_cookie_name(mut self, name: &str) -> Self {
        self.cookie_name = name.to_owned();
        self
    }

    pub fn resolve(&self, req: &HttpRequest) -> String {
        match self.user_id(req) {
            Some(id) => format!("user:{id}"),
            None => format!("ip:{}", ip_key(client_ip(req))),
        }
    }

    fn user_id(&self, req: &HttpRequest) -> Option<String> {
        let verifier = self.verifier.as_ref()?;
        let cookie = req.cookie(&self.cookie_name)?;
        match verifier.verify(cookie.value()) {
            Ok(claims) => Some(claims.id),
            Err(e) => {
                log::debug!("Ignoring session token for rate limiting: {e}");
                None
            }
        }
    }
}

impl Default for IdentifierResolver {
    fn default() -> Self {
        Self::new(None)
    }
}

fn header<'r>(req: &'r HttpRequest, name: &str) -> Option<&'r str> {
    req.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

// Proxies sometimes append the client port.
fn parse_addr(candidate: &str) -> Option<IpAddr> {
    candidate
        .parse::<IpAddr>()
        .ok()
        .or_else(|| candidate.parse::<SocketAddr>().ok().map(|addr| addr.ip()))
}

fn client_ip(req: &HttpRequest) -> IpAddr {
    let forwarded = header(req, X_FORWARDED_FOR)
        .and_then(|chain| chain.split(',').next())
        .map(str::trim);
    let real_ip = header(req, X_REAL_IP);
    forwarded
        .into_iter()
        .chain(real_ip)
        .filter_map(|candidate| {
            let parsed = parse_addr(candidate);
            if parsed.is_none() {
                log::debug!("Ignoring unparsable client address {candidate:?}");
            }
            parsed
        })
        .next()
        .or_else(|| req.peer_addr().map(|addr| addr.ip()))
        .unwrap_or(FALLBACK_IP)
}

// Groups IPv6 addresses together, see:
// https://adam-p.ca/blog/2022/02/ipv6-rate-limiting/
// https://support.cloudflare.com/hc/en-us/articles/115001635128-Configuring-Cloudflare-Rate-Limiting
fn ip_key(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return v4.to_string();
            }
            let s = v6.segments();
            let subnet = Ipv6Addr::new(s[0], s[1], s[2], s[3], 0, 0, 0, 0);
            format!("{}/64", subnet)
        }
    }
}
