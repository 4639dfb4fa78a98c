use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use axum::extract::{ConnectInfo, FromRequestParts};
use http::request::Parts;

use crate::pg::PgStore;
use crate::service::CommentService;
use crate::Error;

#[derive(Clone, axum::extract::FromRef)]
pub struct AppState {
    pub comments: Arc<CommentService<PgStore>>,
}

/// The client address a like is attributed to.
///
/// Behind the reverse proxy the socket peer is the proxy itself, so the
/// forwarding headers take precedence over the connection info.
pub struct ClientIp(pub IpAddr);

fn forwarded_ip(parts: &Parts) -> Option<Result<IpAddr, Error>> {
    let raw = None
        .or_else(|| {
            // the client is the first entry, proxies append after it
            let all = parts.headers.get("x-forwarded-for")?.to_str().ok()?;
            Some(all.split(',').next().unwrap_or(all))
        })
        .or_else(|| parts.headers.get("x-real-ip")?.to_str().ok())?;
    Some(
        raw.trim()
            .parse()
            .map_err(|_| Error::invalid_field("ip", "client address is not a valid IP")),
    )
}

#[async_trait]
impl<S: Sync> FromRequestParts<S> for ClientIp {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<ClientIp, Error> {
        if let Some(ip) = forwarded_ip(parts) {
            return Ok(ClientIp(ip?));
        }
        let ConnectInfo(addr) = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .ok_or_else(|| Error::Anyhow(anyhow!("no connection info on the request")))?;
        Ok(ClientIp(addr.ip()))
    }
}
