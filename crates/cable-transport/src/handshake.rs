//! Building [`Handshake`]s from HTTP upgrade requests.

use axum::http::{HeaderMap, Uri};
use cable_protocol::Handshake;
use std::net::SocketAddr;

/// Capture the parts of an upgrade request the server looks at.
///
/// Headers with non-UTF-8 values are skipped.
#[must_use]
pub fn from_request_parts(
    uri: &Uri,
    headers: &HeaderMap,
    remote_addr: Option<SocketAddr>,
) -> Handshake {
    let target = uri.path_and_query().map_or("/", |pq| pq.as_str());
    let mut handshake = Handshake::new(target);

    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            handshake = handshake.with_header(name.as_str(), value);
        }
    }

    match remote_addr {
        Some(addr) => handshake.with_remote_addr(addr.to_string()),
        None => handshake,
    }
}
