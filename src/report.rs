//! Inbound traffic report format
//!
//! Nodes POST a JSON document with two arrays of per-interval deltas:
//! `inboundTraffics` (one entry per listening tag) and `clientTraffics`
//! (one entry per user email). Elements that do not match the expected
//! shape are dropped individually so one bad element never loses the rest.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Delta counters for one inbound tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundTraffic {
    #[serde(alias = "Tag")]
    pub tag: String,
    #[serde(default, alias = "Up")]
    pub up: i64,
    #[serde(default, alias = "Down")]
    pub down: i64,
    /// Entries with this unset are outbound legs and are not counted
    #[serde(default, rename = "isInbound", alias = "IsInbound")]
    pub is_inbound: bool,
    #[serde(default, rename = "isOutbound", alias = "IsOutbound")]
    pub is_outbound: bool,
}

impl InboundTraffic {
    pub fn inbound(tag: impl Into<String>, up: i64, down: i64) -> Self {
        Self {
            tag: tag.into(),
            up,
            down,
            is_inbound: true,
            is_outbound: false,
        }
    }
}

/// Delta counters for one client (user) on a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientTraffic {
    pub email: String,
    #[serde(default)]
    pub up: i64,
    #[serde(default)]
    pub down: i64,
}

impl ClientTraffic {
    pub fn new(email: impl Into<String>, up: i64, down: i64) -> Self {
        Self { email: email.into(), up, down }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrafficReport {
    #[serde(default, rename = "clientTraffics")]
    pub client_traffics: Vec<ClientTraffic>,
    #[serde(default, rename = "inboundTraffics")]
    pub inbound_traffics: Vec<InboundTraffic>,
}

#[derive(Deserialize)]
struct RawReport {
    #[serde(default, rename = "clientTraffics", deserialize_with = "nullable_vec")]
    client_traffics: Vec<Value>,
    #[serde(default, rename = "inboundTraffics", deserialize_with = "nullable_vec")]
    inbound_traffics: Vec<Value>,
}

/// Senders serialize empty slices as `null`
fn nullable_vec<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default())
}

/// A parsed report plus the number of elements that were dropped
#[derive(Debug)]
pub struct ParsedReport {
    pub report: TrafficReport,
    pub skipped: usize,
}

impl TrafficReport {
    /// Parse a request body. Fails only if the document itself is not a
    /// report object; malformed elements are skipped and counted.
    pub fn from_json(body: &[u8]) -> Result<ParsedReport, serde_json::Error> {
        let raw: RawReport = serde_json::from_slice(body)?;
        let mut skipped = 0;

        let inbound_traffics = raw
            .inbound_traffics
            .into_iter()
            .filter_map(|v| match serde_json::from_value::<InboundTraffic>(v) {
                Ok(t) => Some(t),
                Err(e) => {
                    warn!("Skipping malformed inbound traffic entry: {}", e);
                    skipped += 1;
                    None
                }
            })
            .collect();

        let client_traffics = raw
            .client_traffics
            .into_iter()
            .filter_map(|v| match serde_json::from_value::<ClientTraffic>(v) {
                Ok(t) => Some(t),
                Err(e) => {
                    warn!("Skipping malformed client traffic entry: {}", e);
                    skipped += 1;
                    None
                }
            })
            .collect();

        Ok(ParsedReport {
            report: TrafficReport { client_traffics, inbound_traffics },
            skipped,
        })
    }
}

/// Best-effort port number from a tag such as `inbound-8443`.
/// Returns 0 when the tag has no numeric `-<digits>` suffix.
pub fn extract_port(tag: &str) -> u16 {
    let Some((_, suffix)) = tag.rsplit_once('-') else {
        return 0;
    };
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return 0;
    }
    suffix.parse().unwrap_or(0)
}
