use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

pub const HMAC_HEADER: &str = "X-GoTrack-HMAC";
/// Marker value the client-side tracking library sets before the fetch
/// override computes the real signature. See spec §9, third open question:
/// this string is a contract with the embedded asset, not a standard.
const MARKER_VALUE: &str = "tracking";

type HmacSha256 = Hmac<Sha256>;

/// Per-IP HMAC authenticator (spec §4.2). Immutable after construction; safe
/// to share across request-handling tasks without locking.
#[derive(Clone)]
pub struct HmacAuthenticator {
    secret: Option<Vec<u8>>,
    public_key_b64: String,
    require: bool,
    redact_secrets: bool,
}

impl HmacAuthenticator {
    pub fn new(secret: Option<Vec<u8>>, public_key_b64: Option<String>, require: bool, redact_secrets: bool) -> Self {
        let public_key_b64 = match (public_key_b64, &secret) {
            (Some(supplied), _) if BASE64.decode(&supplied).is_ok() => supplied,
            (_, Some(secret)) => {
                let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
                mac.update(b"gotrack-public-key-derivation");
                let full = mac.finalize().into_bytes();
                BASE64.encode(&full[..16])
            }
            _ => String::new(),
        };

        Self {
            secret,
            public_key_b64,
            require,
            redact_secrets,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }

    pub fn public_key_base64(&self) -> &str {
        &self.public_key_b64
    }

    /// Strip the port from `[ipv6]:port` / `ipv4:port`; pass through anything
    /// else unchanged.
    pub fn normalize_ip(addr: &str) -> String {
        if let Some(rest) = addr.strip_prefix('[') {
            if let Some(end) = rest.find(']') {
                return rest[..end].to_string();
            }
        }
        // ipv4:port — an ipv6 address without brackets has more than one colon.
        if addr.matches(':').count() == 1 {
            if let Some((host, _port)) = addr.rsplit_once(':') {
                return host.to_string();
            }
        }
        addr.to_string()
    }

    /// `HMAC-SHA256(secret, "client-key:" + normalize_ip(ip))`, 32 bytes.
    /// Never persisted, never logged.
    pub fn derive_client_key(&self, client_ip: &str) -> Option<[u8; 32]> {
        let secret = self.secret.as_ref()?;
        let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
        mac.update(b"client-key:");
        mac.update(Self::normalize_ip(client_ip).as_bytes());
        let bytes = mac.finalize().into_bytes();
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Some(out)
    }

    /// Verify a request's `X-GoTrack-HMAC` header against the expected
    /// per-client signature over `body`. Returns `true` immediately when
    /// HMAC is not required.
    pub fn verify(&self, client_ip: &str, provided_header: Option<&str>, body: &[u8]) -> bool {
        if !self.require {
            return true;
        }
        let Some(client_key) = self.derive_client_key(client_ip) else {
            return false;
        };
        let Some(provided_hex) = provided_header else {
            return false;
        };

        let mut mac = HmacSha256::new_from_slice(&client_key).expect("HMAC accepts any key length");
        mac.update(body);
        let expected_bytes = mac.finalize().into_bytes();

        // Constant-time comparison via `subtle` rather than a byte-by-byte
        // `==`, so neither timing from an early mismatch nor a short-circuit
        // leaks how many leading bytes of the signature were correct.
        let ok = match hex::decode(provided_hex) {
            Ok(provided_bytes) => {
                provided_bytes.len() == expected_bytes.len()
                    && bool::from(provided_bytes.as_slice().ct_eq(expected_bytes.as_slice()))
            }
            Err(_) => false,
        };

        if !ok {
            if self.redact_secrets {
                debug!(ip = %client_ip, "hmac verification failed");
            } else {
                let expected_hex = {
                    let mut mac = HmacSha256::new_from_slice(&client_key).expect("HMAC accepts any key length");
                    mac.update(body);
                    hex::encode(mac.finalize().into_bytes())
                };
                debug!(ip = %client_ip, provided = provided_hex, expected = %expected_hex, "hmac verification failed");
            }
        }
        ok
    }

    /// JavaScript that embeds this client's base64 key and overrides `fetch`
    /// to sign requests already bearing the marker header value. The client
    /// key is IP-specific, so the response must never be cached.
    pub fn client_script_for_request(&self, client_ip: &str) -> String {
        let key_b64 = self
            .derive_client_key(client_ip)
            .map(|k| BASE64.encode(k))
            .unwrap_or_default();

        format!(
            r#"(function() {{
  var CLIENT_KEY_B64 = "{key}";
  var HEADER = "{header}";
  var MARKER = "{marker}";

  function b64ToBytes(b64) {{
    var bin = atob(b64);
    var bytes = new Uint8Array(bin.length);
    for (var i = 0; i < bin.length; i++) bytes[i] = bin.charCodeAt(i);
    return bytes;
  }}

  function toHex(buf) {{
    return Array.prototype.map.call(new Uint8Array(buf), function(b) {{
      return ("0" + b.toString(16)).slice(-2);
    }}).join("");
  }}

  async function sign(body) {{
    var keyBytes = b64ToBytes(CLIENT_KEY_B64);
    var key = await crypto.subtle.importKey("raw", keyBytes, {{ name: "HMAC", hash: "SHA-256" }}, false, ["sign"]);
    var data = typeof body === "string" ? new TextEncoder().encode(body) : (body || new Uint8Array(0));
    var sig = await crypto.subtle.sign("HMAC", key, data);
    return toHex(sig);
  }}

  var originalFetch = window.fetch;
  window.fetch = async function(input, init) {{
    init = init || {{}};
    var headers = new Headers(init.headers || {{}});
    if (headers.get(HEADER) === MARKER) {{
      var signature = await sign(init.body);
      headers.set(HEADER, signature);
      init.headers = headers;
    }}
    return originalFetch.call(this, input, init);
  }};
}})();
"#,
            key = key_b64,
            header = HMAC_HEADER,
            marker = MARKER_VALUE,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticator() -> HmacAuthenticator {
        HmacAuthenticator::new(Some(b"top-secret".to_vec()), None, true, true)
    }

    #[test]
    fn normalize_ip_strips_port_variants() {
        assert_eq!(HmacAuthenticator::normalize_ip("203.0.113.42:55000"), "203.0.113.42");
        assert_eq!(HmacAuthenticator::normalize_ip("[::1]:8080"), "::1");
        assert_eq!(HmacAuthenticator::normalize_ip("203.0.113.42"), "203.0.113.42");
    }

    #[test]
    fn verify_succeeds_for_matching_signature() {
        let auth = authenticator();
        let body = b"{\"event_id\":\"a\"}";
        let key = auth.derive_client_key("127.0.0.1").unwrap();
        let mut mac = HmacSha256::new_from_slice(&key).unwrap();
        mac.update(body);
        let sig = hex::encode(mac.finalize().into_bytes());

        assert!(auth.verify("127.0.0.1", Some(&sig), body));
    }

    #[test]
    fn verify_fails_on_mismatch() {
        let auth = authenticator();
        assert!(!auth.verify("127.0.0.1", Some("deadbeef"), b"body"));
    }

    #[test]
    fn verify_fails_when_header_missing() {
        let auth = authenticator();
        assert!(!auth.verify("127.0.0.1", None, b"body"));
    }

    #[test]
    fn verify_returns_true_when_not_required() {
        let auth = HmacAuthenticator::new(None, None, false, true);
        assert!(auth.verify("127.0.0.1", None, b"body"));
    }

    #[test]
    fn per_ip_keys_differ() {
        let auth = authenticator();
        let a = auth.derive_client_key("1.2.3.4").unwrap();
        let b = auth.derive_client_key("5.6.7.8").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn public_key_is_derived_when_not_supplied() {
        let auth = authenticator();
        assert!(!auth.public_key_base64().is_empty());
    }

    #[test]
    fn public_key_uses_supplied_value_when_valid_base64() {
        let auth = HmacAuthenticator::new(Some(b"secret".to_vec()), Some("aGVsbG8=".to_string()), true, true);
        assert_eq!(auth.public_key_base64(), "aGVsbG8=");
    }
}
