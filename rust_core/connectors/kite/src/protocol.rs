use connectors_common::Mode;
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};

/// Control messages the client sends over the open socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Subscribe(Vec<u32>),
    Unsubscribe(Vec<u32>),
    SetMode(Mode, Vec<u32>),
}

impl Request {
    pub fn to_value(&self) -> Value {
        match self {
            Request::Subscribe(tokens) => json!({ "a": "subscribe", "v": tokens }),
            Request::Unsubscribe(tokens) => json!({ "a": "unsubscribe", "v": tokens }),
            Request::SetMode(mode, tokens) => json!({ "a": "mode", "v": [mode.as_str(), tokens] }),
        }
    }

    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }
}

/// Server-pushed text message, keyed by `type` (or its short form `t`).
#[derive(Debug, Deserialize)]
struct TextMessage {
    #[serde(rename = "type", alias = "t")]
    kind: Option<String>,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerNotice {
    Error(String),
    Message(String),
    Other(Option<String>),
}

fn describe(data: &Value) -> String {
    match data {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub fn parse_text(text: &str) -> Option<ServerNotice> {
    let msg: TextMessage = serde_json::from_str(text).ok()?;
    Some(match msg.kind.as_deref() {
        Some("error") => ServerNotice::Error(describe(&msg.data)),
        Some("message") => ServerNotice::Message(describe(&msg.data)),
        _ => ServerNotice::Other(msg.kind),
    })
}

/// Logs a text frame. Text never carries ticks, so nothing else happens.
pub fn handle_text(text: &str) {
    match parse_text(text) {
        Some(ServerNotice::Error(detail)) => warn!("feed error notice: {}", detail),
        Some(ServerNotice::Message(detail)) => info!("feed notice: {}", detail),
        Some(ServerNotice::Other(kind)) => debug!("ignoring text message of type {:?}", kind),
        None => debug!("unparsable text message ({} bytes)", text.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_match_wire_shape() {
        assert_eq!(
            Request::Subscribe(vec![11, 22]).to_value(),
            json!({"a": "subscribe", "v": [11, 22]})
        );
        assert_eq!(
            Request::Unsubscribe(vec![5]).to_value(),
            json!({"a": "unsubscribe", "v": [5]})
        );
        assert_eq!(
            Request::SetMode(Mode::Full, vec![11, 22]).to_json(),
            r#"{"a":"mode","v":["full",[11,22]]}"#
        );
    }

    #[test]
    fn notices_accept_both_type_keys() {
        assert_eq!(
            parse_text(r#"{"type":"error","data":"invalid token"}"#),
            Some(ServerNotice::Error("invalid token".into()))
        );
        assert_eq!(
            parse_text(r#"{"t":"error","data":{"code":403}}"#),
            Some(ServerNotice::Error("{\"code\":403}".into()))
        );
        assert_eq!(
            parse_text(r#"{"type":"message","data":"market closing"}"#),
            Some(ServerNotice::Message("market closing".into()))
        );
        assert_eq!(
            parse_text(r#"{"type":"order","data":{}}"#),
            Some(ServerNotice::Other(Some("order".into())))
        );
    }

    #[test]
    fn garbage_text_is_ignored() {
        assert_eq!(parse_text("not json"), None);
        handle_text("not json");
    }
}
