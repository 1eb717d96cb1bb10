//! Origin blocking, applied before any request reaches a session.

use std::{
    collections::BTreeSet,
    net::{IpAddr, SocketAddr},
};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use gateway_core::OriginGuard;

use crate::api::AppState;

/// Fixed set of blocked addresses.
#[derive(Debug, Clone, Default)]
pub struct StaticBlocklist {
    blocked: BTreeSet<IpAddr>,
}

impl StaticBlocklist {
    #[must_use]
    pub fn new(blocked: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            blocked: blocked.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocked.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocked.is_empty()
    }
}

impl OriginGuard for StaticBlocklist {
    fn is_blocked(&self, origin: IpAddr) -> bool {
        // IPv4 peers may arrive as IPv4-mapped IPv6 addresses.
        let origin = match origin {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(origin, IpAddr::V4),
            IpAddr::V4(_) => origin,
        };
        self.blocked.contains(&origin)
    }
}

/// Middleware refusing blocked peers with `403`.
///
/// Requests without peer information (no `ConnectInfo`) are let through.
pub async fn guard_origin(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    if let Some(ip) = peer {
        if state.guard.is_blocked(ip) {
            tracing::warn!(peer = %ip, path = %request.uri().path(), "Refusing blocked origin");
            return StatusCode::FORBIDDEN.into_response();
        }
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use std::net::Ipv6Addr;

    use super::*;

    #[test]
    fn test_blocklist() {
        let list = StaticBlocklist::new(["10.0.0.1".parse().unwrap(), "::2".parse().unwrap()]);
        assert!(list.is_blocked("10.0.0.1".parse().unwrap()));
        assert!(list.is_blocked("::2".parse().unwrap()));
        assert!(!list.is_blocked("10.0.0.2".parse().unwrap()));
        assert!(list.is_blocked(IpAddr::V6(Ipv6Addr::from([0, 0, 0, 0, 0, 0xffff, 0x0a00, 0x0001]))));
        assert!(!StaticBlocklist::default().is_blocked("127.0.0.1".parse().unwrap()));
    }
}
