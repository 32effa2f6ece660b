use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::model::{Detection, HeaderAnalysis, RequestAnalysis, TimingAnalysis};

/// Headers a typical browser sends that automation clients frequently omit.
const EXPECTED_HEADERS: &[&str] = &["accept", "accept-language", "accept-encoding", "user-agent"];

/// Header names or values associated with known automation tooling.
const AUTOMATION_SIGNATURES: &[&str] = &[
    "headlesschrome",
    "phantomjs",
    "python-requests",
    "curl/",
    "wget/",
    "go-http-client",
    "okhttp",
    "axios/",
    "puppeteer",
    "playwright",
    "selenium",
];

/// Maximum number of distinct client IPs tracked for timing analysis. Past
/// this the oldest entry is evicted before inserting a new one, bounding
/// memory under IP-spoofed load rather than growing without limit.
const MAX_TRACKED_CLIENTS: usize = 50_000;

/// Tracks the last-seen instant per client IP so repeated requests can be
/// scored for timing regularity. The teacher's original single-threaded
/// scrape loop never needed synchronization for anything like this; serving
/// concurrent requests does, so every access goes through the mutex rather
/// than a bare `HashMap` behind a `static`.
pub struct TimingTracker {
    last_seen: Mutex<HashMap<String, Instant>>,
}

impl TimingTracker {
    pub fn new() -> Self {
        Self {
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Records `now` for `client_ip` and returns the analysis derived from
    /// the previous observation, if any.
    pub fn observe(&self, client_ip: &str, now: Instant) -> TimingAnalysis {
        let mut map = self.last_seen.lock().unwrap_or_else(|e| e.into_inner());

        let previous = map.get(client_ip).copied();

        if !map.contains_key(client_ip) && map.len() >= MAX_TRACKED_CLIENTS {
            if let Some(oldest_key) = map.iter().min_by_key(|(_, t)| **t).map(|(k, _)| k.clone()) {
                map.remove(&oldest_key);
            }
        }
        map.insert(client_ip.to_string(), now);
        drop(map);

        match previous {
            None => TimingAnalysis {
                interval_ms: None,
                interval_precision: "unknown".to_string(),
                requests_per_second: None,
            },
            Some(prev) => {
                let elapsed = now.saturating_duration_since(prev);
                let interval_ms = elapsed.as_millis() as i64;
                TimingAnalysis {
                    interval_ms: Some(interval_ms),
                    interval_precision: precision_class(elapsed),
                    requests_per_second: requests_per_second(elapsed),
                }
            }
        }
    }
}

impl Default for TimingTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn precision_class(elapsed: Duration) -> String {
    let ms = elapsed.as_millis();
    if ms == 0 {
        "sub_millisecond".to_string()
    } else if ms % 1000 == 0 {
        "whole_second".to_string()
    } else if ms % 100 == 0 {
        "hundred_millisecond".to_string()
    } else {
        "irregular".to_string()
    }
}

fn requests_per_second(elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        None
    } else {
        Some(1.0 / secs)
    }
}

/// A short, non-cryptographic fingerprint over the request's header shape:
/// sorted lowercased header names paired with a short value prefix. Two
/// requests that present headers in the same names/order with similar
/// values land on the same fingerprint, useful for clustering repeat
/// visitors that rotate IPs but not headers.
pub fn header_fingerprint(headers: &[(String, String)]) -> String {
    let mut pairs: Vec<(String, String)> = headers
        .iter()
        .map(|(name, value)| {
            let prefix: String = value.chars().take(12).collect();
            (name.to_ascii_lowercase(), prefix)
        })
        .collect();
    pairs.sort();

    let mut hasher = Sha256::new();
    for (name, prefix) in &pairs {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(prefix.as_bytes());
        hasher.update(b";");
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

pub fn header_analysis(headers: &[(String, String)]) -> HeaderAnalysis {
    let lowercase_names: Vec<String> = headers.iter().map(|(n, _)| n.to_ascii_lowercase()).collect();

    let missing_expected: Vec<String> = EXPECTED_HEADERS
        .iter()
        .filter(|expected| !lowercase_names.iter().any(|n| n == *expected))
        .map(|s| s.to_string())
        .collect();

    let haystack: String = headers
        .iter()
        .map(|(n, v)| format!("{}:{} ", n.to_ascii_lowercase(), v.to_ascii_lowercase()))
        .collect();
    let automation_signatures: Vec<String> = AUTOMATION_SIGNATURES
        .iter()
        .filter(|sig| haystack.contains(*sig))
        .map(|s| s.to_string())
        .collect();

    HeaderAnalysis {
        missing_expected,
        automation_signatures,
        ordered_header_names: headers.iter().map(|(n, _)| n.clone()).collect(),
        count: headers.len(),
    }
}

/// Shannon entropy of `bytes`, in bits per byte (0.0 for empty input).
pub fn shannon_entropy(bytes: &[u8]) -> f64 {
    if bytes.is_empty() {
        return 0.0;
    }
    let mut counts = [0u64; 256];
    for &b in bytes {
        counts[b as usize] += 1;
    }
    let len = bytes.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / len;
            -p * p.log2()
        })
        .sum()
}

fn classify_user_agent(ua: Option<&str>) -> String {
    match ua {
        None => "missing".to_string(),
        Some(ua) => {
            let lower = ua.to_ascii_lowercase();
            if AUTOMATION_SIGNATURES.iter().any(|sig| lower.contains(sig)) {
                "automation".to_string()
            } else if ua.len() < 10 {
                "truncated".to_string()
            } else {
                "browser".to_string()
            }
        }
    }
}

pub fn request_analysis(body: &[u8], user_agent: Option<&str>) -> RequestAnalysis {
    RequestAnalysis {
        payload_entropy: shannon_entropy(body),
        request_size: body.len(),
        user_agent_analysis: classify_user_agent(user_agent),
    }
}

pub fn detect(
    headers: &[(String, String)],
    body: &[u8],
    user_agent: Option<&str>,
    client_ip: &str,
    tracker: &TimingTracker,
) -> Detection {
    Detection {
        header_fingerprint: header_fingerprint(headers),
        header_analysis: header_analysis(headers),
        request_analysis: request_analysis(body, user_agent),
        timing_analysis: tracker.observe(client_ip, Instant::now()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(n, v)| (n.to_string(), v.to_string())).collect()
    }

    #[test]
    fn header_analysis_flags_missing_expected_headers() {
        let analysis = header_analysis(&h(&[("host", "example.com")]));
        assert!(analysis.missing_expected.contains(&"user-agent".to_string()));
        assert_eq!(analysis.count, 1);
    }

    #[test]
    fn header_analysis_detects_automation_signature_in_value() {
        let analysis = header_analysis(&h(&[("user-agent", "python-requests/2.31")]));
        assert!(!analysis.automation_signatures.is_empty());
    }

    #[test]
    fn fingerprint_is_stable_regardless_of_header_order() {
        let a = header_fingerprint(&h(&[("accept", "text/html"), ("host", "example.com")]));
        let b = header_fingerprint(&h(&[("host", "example.com"), ("accept", "text/html")]));
        assert_eq!(a, b);
    }

    #[test]
    fn entropy_of_empty_and_uniform_input() {
        assert_eq!(shannon_entropy(b""), 0.0);
        assert_eq!(shannon_entropy(b"aaaa"), 0.0);
        assert!(shannon_entropy(b"abcd") > 1.9);
    }

    #[test]
    fn user_agent_classification() {
        assert_eq!(classify_user_agent(None), "missing");
        assert_eq!(classify_user_agent(Some("curl/8.0")), "automation");
        assert_eq!(
            classify_user_agent(Some("Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15) Gecko/20100101")),
            "browser"
        );
    }

    #[test]
    fn timing_tracker_reports_unknown_on_first_sighting() {
        let tracker = TimingTracker::new();
        let analysis = tracker.observe("1.2.3.4", Instant::now());
        assert_eq!(analysis.interval_ms, None);
        assert_eq!(analysis.interval_precision, "unknown");
    }

    #[test]
    fn timing_tracker_computes_interval_on_second_sighting() {
        let tracker = TimingTracker::new();
        let t0 = Instant::now();
        tracker.observe("1.2.3.4", t0);
        let t1 = t0 + Duration::from_millis(250);
        let analysis = tracker.observe("1.2.3.4", t1);
        assert_eq!(analysis.interval_ms, Some(250));
        assert!(analysis.requests_per_second.unwrap() > 0.0);
    }

    #[test]
    fn timing_tracker_evicts_oldest_when_over_capacity() {
        let tracker = TimingTracker::new();
        {
            let mut map = tracker.last_seen.lock().unwrap();
            let base = Instant::now() - Duration::from_secs(MAX_TRACKED_CLIENTS as u64 + 10);
            for i in 0..MAX_TRACKED_CLIENTS {
                map.insert(format!("ip-{i}"), base + Duration::from_secs(i as u64));
            }
        }
        tracker.observe("new-client", Instant::now());
        let map = tracker.last_seen.lock().unwrap();
        assert_eq!(map.len(), MAX_TRACKED_CLIENTS);
        assert!(!map.contains_key("ip-0"));
        assert!(map.contains_key("new-client"));
    }
}
