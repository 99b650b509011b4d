//! Protocol versioning for cable.
//!
//! Versions are negotiated through the `Sec-WebSocket-Protocol` header.

/// The JSON protocol this server speaks.
pub const PROTOCOL_V1_JSON: &str = "actioncable-v1-json";

/// Offered by clients so that an old server can signal it is incompatible.
pub const PROTOCOL_UNSUPPORTED: &str = "actioncable-unsupported";

/// Every subprotocol a client offers, in order of preference.
pub const PROTOCOLS: [&str; 2] = [PROTOCOL_V1_JSON, PROTOCOL_UNSUPPORTED];

/// Subprotocols this implementation can actually speak.
pub const SUPPORTED_PROTOCOLS: [&str; 1] = [PROTOCOL_V1_JSON];

/// Check if a negotiated subprotocol can be spoken.
#[must_use]
pub fn is_supported(protocol: &str) -> bool {
    SUPPORTED_PROTOCOLS.contains(&protocol)
}

/// Split a `Sec-WebSocket-Protocol` header value into protocol names.
pub fn parse_header(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|p| !p.is_empty())
}

/// Pick the subprotocol to answer with, given the client's offer.
///
/// Server preference wins over client order.
#[must_use]
pub fn negotiate<'a>(offered: impl IntoIterator<Item = &'a str>) -> Option<&'static str> {
    let offered: Vec<&str> = offered.into_iter().collect();
    PROTOCOLS.into_iter().find(|p| offered.contains(p))
}
