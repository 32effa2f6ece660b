use crate::error::{GatewayError, Result};
use std::env;

/// Process-wide configuration, loaded once at startup from the environment
/// (see spec §6 for the exhaustive variable table). Never reloaded at runtime.
#[derive(Debug, Clone)]
pub struct Config {
    pub server_addr: String,
    pub outputs: Vec<String>,
    pub trust_proxy: bool,
    pub max_body_bytes: usize,
    pub forward_destination: Option<String>,
    pub hmac_secret: Option<Vec<u8>>,
    pub hmac_public_key: Option<String>,
    pub redact_secrets: bool,
    pub dnt_enabled: bool,

    pub log_path: String,

    pub kafka: KafkaConfig,
    pub relational: RelationalConfig,

    pub enable_https: bool,
    pub ssl_cert_file: Option<String>,
    pub ssl_key_file: Option<String>,

    pub metrics_enabled: bool,
    pub metrics_addr: String,
    pub metrics_tls_cert: Option<String>,
    pub metrics_tls_key: Option<String>,
    pub metrics_client_ca: Option<String>,
    pub metrics_require_tls: bool,
}

#[derive(Debug, Clone, Default)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub topic: String,
    pub acks: String,
    pub compression: String,
    pub sasl_mechanism: Option<String>,
    pub sasl_user: Option<String>,
    pub sasl_password: Option<String>,
    pub tls_ca: Option<String>,
    pub tls_skip_verify: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RelationalConfig {
    pub dsn: String,
    pub table: String,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub copy_mode: bool,
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(v) => v.parse::<T>().map_err(|_| GatewayError::Config {
            name: name.to_string(),
            message: format!("could not parse '{v}'"),
        }),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from the process environment. Missing optional
    /// variables fall back to documented defaults; malformed required
    /// variables produce a `GatewayError::Config` naming the offender.
    pub fn load() -> Result<Self> {
        let outputs = env::var("OUTPUTS")
            .unwrap_or_else(|_| "log".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let hmac_secret = env::var("HMAC_SECRET").ok().map(|s| s.into_bytes());

        let kafka = KafkaConfig {
            brokers: env::var("KAFKA_BROKERS")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            topic: env_or("KAFKA_TOPIC", "gotrack-events"),
            acks: env_or("KAFKA_ACKS", "all"),
            compression: env_or("KAFKA_COMPRESSION", "none"),
            sasl_mechanism: env::var("KAFKA_SASL_MECHANISM").ok(),
            sasl_user: env::var("KAFKA_SASL_USER").ok(),
            sasl_password: env::var("KAFKA_SASL_PASSWORD").ok(),
            tls_ca: env::var("KAFKA_TLS_CA").ok(),
            tls_skip_verify: env_bool("KAFKA_TLS_SKIP_VERIFY", false),
        };

        let relational = RelationalConfig {
            dsn: env_or("PG_DSN", ""),
            table: env_or("PG_TABLE", "events_json"),
            batch_size: env_parse("PG_BATCH_SIZE", 500usize)?,
            flush_interval_ms: env_parse("PG_FLUSH_MS", 1000u64)?,
            copy_mode: env_bool("PG_COPY", true),
        };

        Ok(Config {
            server_addr: env_or("SERVER_ADDR", "0.0.0.0:8080"),
            outputs,
            trust_proxy: env_bool("TRUST_PROXY", false),
            max_body_bytes: env_parse("MAX_BODY_BYTES", 1_048_576usize)?,
            forward_destination: env::var("FORWARD_DESTINATION").ok(),
            hmac_secret,
            hmac_public_key: env::var("HMAC_PUBLIC_KEY").ok(),
            redact_secrets: env_bool("REDACT_SECRETS", true),
            dnt_enabled: env_bool("HONOR_DNT", false),

            log_path: env_or("LOG_PATH", "stdout"),

            kafka,
            relational,

            enable_https: env_bool("ENABLE_HTTPS", false),
            ssl_cert_file: env::var("SSL_CERT_FILE").ok(),
            ssl_key_file: env::var("SSL_KEY_FILE").ok(),

            metrics_enabled: env_bool("METRICS_ENABLED", false),
            metrics_addr: env_or("METRICS_ADDR", "0.0.0.0:9090"),
            metrics_tls_cert: env::var("METRICS_TLS_CERT").ok(),
            metrics_tls_key: env::var("METRICS_TLS_KEY").ok(),
            metrics_client_ca: env::var("METRICS_CLIENT_CA").ok(),
            metrics_require_tls: env_bool("METRICS_REQUIRE_TLS", false),
        })
    }

    pub fn hmac_required(&self) -> bool {
        self.hmac_secret.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outputs_default_to_log_only() {
        std::env::remove_var("OUTPUTS");
        let cfg = Config::load().unwrap();
        assert_eq!(cfg.outputs, vec!["log".to_string()]);
    }

    #[test]
    fn outputs_split_and_trim() {
        std::env::set_var("OUTPUTS", "log, broker ,relational");
        let cfg = Config::load().unwrap();
        assert_eq!(cfg.outputs, vec!["log", "broker", "relational"]);
        std::env::remove_var("OUTPUTS");
    }

    #[test]
    fn malformed_numeric_env_is_an_error() {
        std::env::set_var("MAX_BODY_BYTES", "not-a-number");
        let err = Config::load().unwrap_err();
        assert!(matches!(err, GatewayError::Config { .. }));
        std::env::remove_var("MAX_BODY_BYTES");
    }
}
