use serde_json::{Map, Value};
use thiserror::Error;

/// What a client frame asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// `{"track": "<keyword>"}`
    Track { keyword: String },
    /// Any other JSON object; forwarded untouched to the relay.
    Relay { raw: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MalformedMessage {
    #[error("client frame is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("client frame is not a JSON object")]
    NotAnObject,
    #[error("`track` must be a string")]
    TrackNotString,
}

impl MalformedMessage {
    pub fn metric_label(&self) -> &'static str {
        match self {
            MalformedMessage::InvalidJson(_) => "invalid_json",
            MalformedMessage::NotAnObject => "not_object",
            MalformedMessage::TrackNotString => "track_not_string",
        }
    }
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, MalformedMessage> {
        let value: Value = serde_json::from_str(text)
            .map_err(|err| MalformedMessage::InvalidJson(err.to_string()))?;
        let object: Map<String, Value> = match value {
            Value::Object(object) => object,
            _ => return Err(MalformedMessage::NotAnObject),
        };
        match object.get("track") {
            Some(Value::String(keyword)) => Ok(ClientMessage::Track {
                keyword: keyword.clone(),
            }),
            Some(_) => Err(MalformedMessage::TrackNotString),
            None => Ok(ClientMessage::Relay {
                raw: text.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn track_key_registers_keyword() {
        assert_eq!(
            ClientMessage::parse(r#"{"track":"Cat"}"#),
            Ok(ClientMessage::Track {
                keyword: "Cat".into()
            })
        );
    }

    #[test_timeout::timeout]
    fn other_objects_are_relayed_verbatim() {
        let raw = r#"{"to": "peer", "body": [1, 2]}"#;
        assert_eq!(
            ClientMessage::parse(raw),
            Ok(ClientMessage::Relay { raw: raw.into() })
        );
    }

    #[test_timeout::timeout]
    fn malformed_frames_are_rejected() {
        assert!(matches!(
            ClientMessage::parse("track cat"),
            Err(MalformedMessage::InvalidJson(_))
        ));
        assert_eq!(
            ClientMessage::parse(r#"["track"]"#),
            Err(MalformedMessage::NotAnObject)
        );
        assert_eq!(
            ClientMessage::parse(r#"{"track": 5}"#),
            Err(MalformedMessage::TrackNotString)
        );
    }
}
