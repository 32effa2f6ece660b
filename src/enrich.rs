use std::collections::HashMap;

use chrono::Utc;
use uuid::Uuid;

use crate::auth::detection;
use crate::auth::detection::TimingTracker;
use crate::config::Config;
use crate::model::{Event, ServerInfo, UrlAttribution};

/// Query parameters copied into `url.utm` verbatim.
const UTM_PARAMS: &[&str] = &["utm_source", "utm_medium", "utm_campaign", "utm_term", "utm_content"];

/// Query parameters that identify an ad click, grouped by platform family
/// (spec §4.1 step 6). Anything outside these lists but still shaped like a
/// click id lands in `click_ids.other`.
const SEARCH_CLICK_IDS: &[&str] = &["gclid", "gclsrc", "msclkid", "dclid"];
const SOCIAL_CLICK_IDS: &[&str] = &["fbclid", "igshid", "ttclid", "li_fat_id", "twclid"];
const OTHER_CLICK_ID_SUFFIXES: &[&str] = &["clid", "click_id", "clickid"];

/// Request-scoped inputs the enrichment step needs but that don't belong on
/// `Event` itself, gathered by the HTTP handler before calling `enrich`.
pub struct RequestContext<'a> {
    pub headers: &'a [(String, String)],
    pub raw_query: Option<&'a str>,
    pub peer_addr: &'a str,
    pub forwarded_for: Option<&'a str>,
    pub body: &'a [u8],
}

/// Populate server-assigned, non-client-suppliable fields on `event` in
/// place (spec §4.1). Idempotent with respect to fields the client already
/// set: `ts`/`type` are only defaulted, never overwritten, and the `server`
/// block is always server-derived regardless of what the client sent.
pub fn enrich(event: &mut Event, ctx: &RequestContext, config: &Config, tracker: &TimingTracker) {
    if event.event_id.is_none() {
        event.event_id = Some(Uuid::new_v4().to_string());
    }
    if event.ts.is_none() {
        event.ts = Some(Utc::now().to_rfc3339());
    }
    if event.event_type.is_none() {
        event.event_type = Some("pageview".to_string());
    }

    let header_value = |name: &str| -> Option<String> {
        ctx.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    };

    let user_agent = header_value("user-agent");

    {
        let device = event.device.get_or_insert_with(Default::default);
        if device.ua.is_none() {
            device.ua = user_agent.clone();
        }
    }

    if let Some(raw_query) = ctx.raw_query {
        let url = event.url.get_or_insert_with(UrlAttribution::default);
        if url.referrer.is_none() {
            url.referrer = header_value("referer");
        }
        if let Some(referrer) = &url.referrer {
            url.referrer_hostname = hostname_of(referrer);
        }
        if url.raw_query.is_none() {
            url.raw_query = Some(raw_query.to_string());
            url.query_size = Some(raw_query.len() as u64);
        }
        populate_attribution(url, raw_query);
    }

    let client_ip = resolve_client_ip(ctx, config);

    let detection = detection::detect(ctx.headers, ctx.body, user_agent.as_deref(), &client_ip, tracker);

    event.server = Some(ServerInfo {
        ip: Some(client_ip),
        geo: HashMap::new(),
        detection,
    });
}

/// Resolve the client IP per spec §4.1 step 7: honor `X-Forwarded-For`'s
/// leftmost hop, falling back to `X-Real-IP`, only when the gateway is
/// configured to trust a proxy in front of it; otherwise (or when neither
/// header is present) fall back to the observed peer address with its port
/// stripped, matching `HmacAuthenticator::normalize_ip`.
pub(crate) fn resolve_client_ip(ctx: &RequestContext, config: &Config) -> String {
    if config.trust_proxy {
        if let Some(forwarded) = ctx.forwarded_for {
            if let Some(first) = forwarded.split(',').next() {
                let trimmed = first.trim();
                if !trimmed.is_empty() {
                    return trimmed.to_string();
                }
            }
        }
        let real_ip = ctx
            .headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("x-real-ip"))
            .map(|(_, v)| v.trim());
        if let Some(real_ip) = real_ip {
            if !real_ip.is_empty() {
                return real_ip.to_string();
            }
        }
    }
    crate::auth::hmac_auth::HmacAuthenticator::normalize_ip(ctx.peer_addr)
}

fn hostname_of(url: &str) -> Option<String> {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let host_and_rest = without_scheme.split(['/', '?', '#']).next()?;
    let host = host_and_rest.rsplit_once('@').map(|(_, h)| h).unwrap_or(host_and_rest);
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

fn populate_attribution(url: &mut UrlAttribution, raw_query: &str) {
    for pair in raw_query.trim_start_matches('?').split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        let key_lower = key.to_ascii_lowercase();
        let decoded_value = percent_decode(value);

        if UTM_PARAMS.contains(&key_lower.as_str()) {
            if !url.utm.contains_key(&key_lower) {
                url.utm.insert(key_lower, decoded_value);
            }
            continue;
        }
        if SEARCH_CLICK_IDS.contains(&key_lower.as_str()) {
            if !url.click_ids.search.contains_key(&key_lower) {
                url.click_ids.search.insert(key_lower, decoded_value);
            }
            continue;
        }
        if SOCIAL_CLICK_IDS.contains(&key_lower.as_str()) {
            if !url.click_ids.social.contains_key(&key_lower) {
                url.click_ids.social.insert(key_lower, decoded_value);
            }
            continue;
        }
        if OTHER_CLICK_ID_SUFFIXES.iter().any(|suffix| key_lower.ends_with(suffix)) {
            let key_trimmed = key_lower.trim().to_string();
            let value_trimmed = decoded_value.trim().to_string();
            if !value_trimmed.is_empty() && !url.click_ids.other.contains_key(&key_trimmed) {
                url.click_ids.other.insert(key_trimmed, value_trimmed);
            }
        }
    }
}

fn percent_decode(value: &str) -> String {
    let mut out = Vec::with_capacity(value.len());
    let bytes = value.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    out.push(byte);
                    i += 3;
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            server_addr: "0.0.0.0:8080".to_string(),
            outputs: vec!["log".to_string()],
            trust_proxy: false,
            max_body_bytes: 1024,
            forward_destination: None,
            hmac_secret: None,
            hmac_public_key: None,
            redact_secrets: true,
            dnt_enabled: false,
            log_path: "stdout".to_string(),
            kafka: Default::default(),
            relational: Default::default(),
            enable_https: false,
            ssl_cert_file: None,
            ssl_key_file: None,
            metrics_enabled: false,
            metrics_addr: "0.0.0.0:9090".to_string(),
            metrics_tls_cert: None,
            metrics_tls_key: None,
            metrics_client_ca: None,
            metrics_require_tls: false,
        }
    }

    #[test]
    fn enrich_defaults_id_timestamp_and_type() {
        let mut event = Event::default();
        let ctx = RequestContext {
            headers: &[],
            raw_query: None,
            peer_addr: "127.0.0.1:1234",
            forwarded_for: None,
            body: b"",
        };
        enrich(&mut event, &ctx, &config(), &TimingTracker::new());

        assert!(event.event_id.is_some());
        assert!(event.ts.is_some());
        assert_eq!(event.event_type.as_deref(), Some("pageview"));
    }

    #[test]
    fn enrich_never_overwrites_client_supplied_type() {
        let mut event = Event::default();
        event.event_type = Some("custom".to_string());
        let ctx = RequestContext {
            headers: &[],
            raw_query: None,
            peer_addr: "127.0.0.1:1234",
            forwarded_for: None,
            body: b"",
        };
        enrich(&mut event, &ctx, &config(), &TimingTracker::new());
        assert_eq!(event.event_type.as_deref(), Some("custom"));
    }

    #[test]
    fn enrich_splits_utm_and_click_ids_by_family() {
        let mut event = Event::default();
        let ctx = RequestContext {
            headers: &[],
            raw_query: Some("utm_source=newsletter&gclid=abc123&fbclid=xyz&partner_clid=zzz"),
            peer_addr: "127.0.0.1:1234",
            forwarded_for: None,
            body: b"",
        };
        enrich(&mut event, &ctx, &config(), &TimingTracker::new());

        let url = event.url.unwrap();
        assert_eq!(url.utm.get("utm_source").unwrap(), "newsletter");
        assert_eq!(url.click_ids.search.get("gclid").unwrap(), "abc123");
        assert_eq!(url.click_ids.social.get("fbclid").unwrap(), "xyz");
        assert_eq!(url.click_ids.other.get("partner_clid").unwrap(), "zzz");
    }

    #[test]
    fn enrich_uses_forwarded_for_only_when_proxy_trusted() {
        let mut cfg = config();
        cfg.trust_proxy = true;
        let mut event = Event::default();
        let ctx = RequestContext {
            headers: &[],
            raw_query: None,
            peer_addr: "10.0.0.1:9999",
            forwarded_for: Some("203.0.113.7, 10.0.0.1"),
            body: b"",
        };
        enrich(&mut event, &ctx, &cfg, &TimingTracker::new());
        assert_eq!(event.server.unwrap().ip.as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn enrich_ignores_forwarded_for_when_proxy_not_trusted() {
        let mut event = Event::default();
        let ctx = RequestContext {
            headers: &[],
            raw_query: None,
            peer_addr: "10.0.0.1:9999",
            forwarded_for: Some("203.0.113.7"),
            body: b"",
        };
        enrich(&mut event, &ctx, &config(), &TimingTracker::new());
        assert_eq!(event.server.unwrap().ip.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn enrich_strips_port_from_ipv6_peer_address() {
        let mut event = Event::default();
        let ctx = RequestContext {
            headers: &[],
            raw_query: None,
            peer_addr: "[::1]:9999",
            forwarded_for: None,
            body: b"",
        };
        enrich(&mut event, &ctx, &config(), &TimingTracker::new());
        assert_eq!(event.server.unwrap().ip.as_deref(), Some("::1"));
    }

    #[test]
    fn enrich_uses_x_real_ip_when_forwarded_for_absent_and_proxy_trusted() {
        let mut cfg = config();
        cfg.trust_proxy = true;
        let mut event = Event::default();
        let headers = vec![("x-real-ip".to_string(), "198.51.100.9".to_string())];
        let ctx = RequestContext {
            headers: &headers,
            raw_query: None,
            peer_addr: "10.0.0.1:9999",
            forwarded_for: None,
            body: b"",
        };
        enrich(&mut event, &ctx, &cfg, &TimingTracker::new());
        assert_eq!(event.server.unwrap().ip.as_deref(), Some("198.51.100.9"));
    }

    #[test]
    fn hostname_of_strips_scheme_and_path() {
        assert_eq!(hostname_of("https://example.com/a/b?x=1"), Some("example.com".to_string()));
        assert_eq!(hostname_of("example.com/a"), Some("example.com".to_string()));
    }

    #[test]
    fn enrich_preserves_client_supplied_raw_query_and_attribution() {
        let mut event = Event::default();
        event.url = Some(UrlAttribution {
            raw_query: Some("client_supplied=1".to_string()),
            ..Default::default()
        });
        event.url.as_mut().unwrap().utm.insert("utm_source".to_string(), "client".to_string());

        let ctx = RequestContext {
            headers: &[],
            raw_query: Some("utm_source=fromquery&utm_medium=fromquery"),
            peer_addr: "127.0.0.1:1234",
            forwarded_for: None,
            body: b"",
        };
        enrich(&mut event, &ctx, &config(), &TimingTracker::new());

        let url = event.url.unwrap();
        assert_eq!(url.raw_query.as_deref(), Some("client_supplied=1"));
        assert!(url.query_size.is_none());
        assert_eq!(url.utm.get("utm_source").unwrap(), "client");
        assert_eq!(url.utm.get("utm_medium").unwrap(), "fromquery");
    }

    #[test]
    fn enrich_skips_whitespace_only_other_click_id() {
        let mut event = Event::default();
        let ctx = RequestContext {
            headers: &[],
            raw_query: Some("partner_clid=%20"),
            peer_addr: "127.0.0.1:1234",
            forwarded_for: None,
            body: b"",
        };
        enrich(&mut event, &ctx, &config(), &TimingTracker::new());
        let url = event.url.unwrap();
        assert!(!url.click_ids.other.contains_key("partner_clid"));
    }
}
