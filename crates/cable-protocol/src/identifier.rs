//! Channel identifiers.
//!
//! An identifier is the JSON-encoded object a client sends to name a channel
//! and its parameters, e.g. `{"channel":"ChatChannel","room":"lobby"}`. The
//! raw string is the subscription key on both ends, so it is kept verbatim.

use crate::codec::ProtocolError;
use serde_json::{Map, Value};
use std::fmt;

/// Key holding the channel name inside an identifier.
pub const CHANNEL_KEY: &str = "channel";

/// A parsed channel identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelIdentifier {
    raw: String,
    channel: String,
    params: Map<String, Value>,
}

impl ChannelIdentifier {
    /// Build an identifier for a channel with no parameters.
    #[must_use]
    pub fn new(channel: impl Into<String>) -> Self {
        let channel = channel.into();
        let mut identifier = Self {
            raw: String::new(),
            channel,
            params: Map::new(),
        };
        identifier.raw = identifier.render();
        identifier
    }

    /// Add a parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if key != CHANNEL_KEY {
            self.params.insert(key, value.into());
            self.raw = self.render();
        }
        self
    }

    /// Parse a raw identifier string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not a JSON object with a string `channel` key.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(raw)?;
        let Value::Object(mut params) = value else {
            return Err(ProtocolError::Invalid("identifier must be an object".into()));
        };

        let channel = match params.remove(CHANNEL_KEY) {
            Some(Value::String(channel)) if !channel.is_empty() => channel,
            Some(_) => return Err(ProtocolError::Invalid("channel must be a string".into())),
            None => return Err(ProtocolError::MissingField(CHANNEL_KEY)),
        };

        Ok(Self {
            raw: raw.to_string(),
            channel,
            params,
        })
    }

    /// Get the raw identifier string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Get the channel name.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Get the parameters, without the channel name.
    #[must_use]
    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    /// Get a single parameter.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// Consume the identifier, returning the raw string.
    #[must_use]
    pub fn into_string(self) -> String {
        self.raw
    }

    fn render(&self) -> String {
        let mut object = self.params.clone();
        object.insert(CHANNEL_KEY.to_string(), Value::String(self.channel.clone()));
        Value::Object(object).to_string()
    }
}

impl fmt::Display for ChannelIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_identifier() {
        let identifier = ChannelIdentifier::parse(r#"{"channel":"ChatChannel","room":"lobby"}"#)
            .unwrap();
        assert_eq!(identifier.channel(), "ChatChannel");
        assert_eq!(identifier.param("room"), Some(&json!("lobby")));
        assert!(identifier.param("channel").is_none());
        assert_eq!(
            identifier.as_str(),
            r#"{"channel":"ChatChannel","room":"lobby"}"#
        );
    }

    #[test]
    fn test_parse_invalid_identifier() {
        assert!(ChannelIdentifier::parse("nope").is_err());
        assert!(ChannelIdentifier::parse("[]").is_err());
        assert!(matches!(
            ChannelIdentifier::parse(r#"{"room":"lobby"}"#),
            Err(ProtocolError::MissingField("channel"))
        ));
        assert!(ChannelIdentifier::parse(r#"{"channel":7}"#).is_err());
    }

    #[test]
    fn test_build_identifier() {
        let identifier = ChannelIdentifier::new("ChatChannel").with_param("room", 1);
        let parsed = ChannelIdentifier::parse(identifier.as_str()).unwrap();
        assert_eq!(parsed, identifier);

        let ignored = ChannelIdentifier::new("A").with_param("channel", "B");
        assert_eq!(ignored.channel(), "A");
    }
}
