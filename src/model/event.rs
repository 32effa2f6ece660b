use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The canonical in-memory event record (spec §3). All fields are optional on
/// the wire; enrichment (`crate::enrich`) guarantees `event_id`, `ts`, and
/// `r#type` are populated before the event reaches a sink.
///
/// Unknown top-level fields are rejected (`deny_unknown_fields`); unknown
/// nested fields are ignored, since nested structs don't deny.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Event {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<String>,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<UrlAttribution>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<Route>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<Device>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<Session>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consent: Option<Consent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UrlAttribution {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer_hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_size: Option<u64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub utm: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "ClickIdGroups::is_empty")]
    pub click_ids: ClickIdGroups,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClickIdGroups {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub search: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub social: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub other: HashMap<String, String>,
}

impl ClickIdGroups {
    pub fn is_empty(&self) -> bool {
        self.search.is_empty() && self.social.is_empty() && self.other.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Route {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub query: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NetworkHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downlink: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_data: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScreenDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pixel_ratio: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Device {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ua: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub brands: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub languages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport_height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pixel_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub touch_points: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_scheme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkHints>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub screens: Vec<ScreenDescriptor>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Session {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visitor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_visit: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HeaderAnalysis {
    #[serde(default)]
    pub missing_expected: Vec<String>,
    #[serde(default)]
    pub automation_signatures: Vec<String>,
    #[serde(default)]
    pub ordered_header_names: Vec<String>,
    #[serde(default)]
    pub count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RequestAnalysis {
    #[serde(default)]
    pub payload_entropy: f64,
    #[serde(default)]
    pub request_size: usize,
    #[serde(default)]
    pub user_agent_analysis: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TimingAnalysis {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<i64>,
    #[serde(default)]
    pub interval_precision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_second: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Detection {
    #[serde(default)]
    pub header_fingerprint: String,
    #[serde(default)]
    pub header_analysis: HeaderAnalysis,
    #[serde(default)]
    pub request_analysis: RequestAnalysis,
    #[serde(default)]
    pub timing_analysis: TimingAnalysis,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub geo: HashMap<String, String>,
    #[serde(default)]
    pub detection: Detection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Consent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gdpr_applies: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcf_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub us_privacy_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpp_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consent_mode: Option<String>,
}

/// The body of `POST /collect` is either one event or an array of events.
#[derive(Debug, Clone)]
pub enum CollectBody {
    Single(Event),
    Batch(Vec<Event>),
}

impl CollectBody {
    pub fn into_events(self) -> Vec<Event> {
        match self {
            CollectBody::Single(e) => vec![e],
            CollectBody::Batch(events) => events,
        }
    }

    /// Parse per spec §4.5 step 4: array-bracket sniffing selects the shape.
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let trimmed_start = bytes.iter().position(|b| !b.is_ascii_whitespace());
        let is_array = matches!(trimmed_start.map(|i| bytes[i]), Some(b'['));
        if is_array {
            Ok(CollectBody::Batch(serde_json::from_slice(bytes)?))
        } else {
            Ok(CollectBody::Single(serde_json::from_slice(bytes)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_serde_modulo_empty_fields() {
        let mut event = Event::default();
        event.event_id = Some("a".to_string());
        event.event_type = Some("click".to_string());

        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn unknown_top_level_field_is_rejected() {
        let err = serde_json::from_str::<Event>(r#"{"bogus_field": 1}"#).unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn unknown_nested_field_is_ignored() {
        let event: Event = serde_json::from_str(r#"{"route": {"path": "/x", "bogus": 1}}"#).unwrap();
        assert_eq!(event.route.unwrap().path.as_deref(), Some("/x"));
    }

    #[test]
    fn collect_body_sniffs_array_vs_object() {
        match CollectBody::parse(br#"[{"event_id":"a"},{"event_id":"b"}]"#).unwrap() {
            CollectBody::Batch(events) => assert_eq!(events.len(), 2),
            CollectBody::Single(_) => panic!("expected batch"),
        }
        match CollectBody::parse(br#"  {"event_id":"a"}"#).unwrap() {
            CollectBody::Single(e) => assert_eq!(e.event_id.as_deref(), Some("a")),
            CollectBody::Batch(_) => panic!("expected single"),
        }
    }
}
