//! `parseLanMessage`: LAN message descriptions as delivered by integrations
//!
//! A description is a comma separated list of `key:value` pairs. `headers`
//! and `body` are base64 encoded; the header block starts with the HTTP
//! status line.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LanMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Body parsed as JSON when it is JSON
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
    /// Every raw pair, including ones not interpreted above
    pub raw: BTreeMap<String, String>,
}

fn decode(value: &str) -> Option<String> {
    let bytes = STANDARD.decode(value.trim()).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

pub fn parse_lan_message(description: &str) -> LanMessage {
    let mut message = LanMessage::default();

    for pair in description.split(',') {
        let Some((key, value)) = pair.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        message.raw.insert(key.to_string(), value.to_string());

        match key {
            "mac" => message.mac = Some(value.to_string()),
            "ip" => message.ip = Some(value.to_string()),
            "port" => message.port = Some(value.to_string()),
            "headers" => {
                if let Some(block) = decode(value) {
                    parse_headers(&block, &mut message);
                }
            }
            "body" => message.body = decode(value),
            _ => {}
        }
    }

    message.json = message
        .body
        .as_deref()
        .and_then(|body| serde_json::from_str(body).ok());
    message
}

fn parse_headers(block: &str, message: &mut LanMessage) {
    let mut lines = block.lines();
    if let Some(status_line) = lines.next() {
        // "HTTP/1.1 200 OK"
        message.status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse().ok());
    }
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            message
                .headers
                .insert(name.trim().to_string(), value.trim().to_string());
        }
    }
}
