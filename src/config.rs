//! Environment-driven configuration with startup validation.
//!
//! Everything the service needs arrives as environment variables (optionally
//! via a `.env` file loaded by the binary). Validation is strict: a bad value
//! stops startup instead of limping along with a surprise default.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing configuration: {0}")]
    Missing(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// SQL identifier whitelist for the configured phone column. This is a
/// security contract: the column name is interpolated into SQL, so anything
/// outside this shape is rejected at startup.
static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern"));

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_POOL_SIZE: u32 = 20;
pub const DEFAULT_BATCH_SIZE: u32 = 50;
pub const DEFAULT_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_MAX_ATTEMPTS: i32 = 10;
pub const MIN_INTERVAL_MS: u64 = 100;
pub const PREVIEW_CHARS_RANGE: (usize, usize) = (256, 12_000);
pub const DEFAULT_PREVIEW_CHARS: usize = 2500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub webhook_secret: String,
    pub database_url: String,
    pub pool_size: u32,
    pub batch_size: u32,
    pub interval_ms: u64,
    pub max_attempts: i32,
    pub verbose_logs: bool,
    pub payload_preview_chars: usize,
    pub log_level: String,
    pub user_phone_column: String,
    pub blocked_as_opt_out: bool,
}

impl Config {
    /// Load and validate configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = match env_var("PORT") {
            Some(raw) => raw
                .parse()
                .map_err(|_| ConfigError::Invalid("PORT must be a valid port number"))?,
            None => DEFAULT_PORT,
        };

        let webhook_secret = env_var("GUPSHUP_WEBHOOK_SECRET")
            .ok_or(ConfigError::Missing("GUPSHUP_WEBHOOK_SECRET"))?;

        let database_url = resolve_database_url()?;

        let pool_size = parse_min_u32("DB_POOL_SIZE", DEFAULT_POOL_SIZE, 1)?;
        let batch_size = parse_min_u32("WEBHOOK_WORKER_BATCH_SIZE", DEFAULT_BATCH_SIZE, 1)?;

        let interval_ms = match env_var("WEBHOOK_WORKER_INTERVAL_MS") {
            Some(raw) => {
                let value: u64 = raw.parse().map_err(|_| {
                    ConfigError::Invalid("WEBHOOK_WORKER_INTERVAL_MS must be an integer")
                })?;
                if value < MIN_INTERVAL_MS {
                    return Err(ConfigError::Invalid(
                        "WEBHOOK_WORKER_INTERVAL_MS must be >= 100",
                    ));
                }
                value
            }
            None => DEFAULT_INTERVAL_MS,
        };

        let max_attempts = match env_var("WEBHOOK_WORKER_MAX_ATTEMPTS") {
            Some(raw) => {
                let value: i32 = raw.parse().map_err(|_| {
                    ConfigError::Invalid("WEBHOOK_WORKER_MAX_ATTEMPTS must be an integer")
                })?;
                if value < 1 {
                    return Err(ConfigError::Invalid(
                        "WEBHOOK_WORKER_MAX_ATTEMPTS must be >= 1",
                    ));
                }
                value
            }
            None => DEFAULT_MAX_ATTEMPTS,
        };

        let verbose_logs = parse_bool("WEBHOOK_VERBOSE_LOGS", true)?;
        let blocked_as_opt_out = parse_bool("BLOCKED_AS_OPT_OUT", true)?;

        let payload_preview_chars = match env_var("WEBHOOK_PAYLOAD_PREVIEW_CHARS") {
            Some(raw) => {
                let value: usize = raw.parse().map_err(|_| {
                    ConfigError::Invalid("WEBHOOK_PAYLOAD_PREVIEW_CHARS must be an integer")
                })?;
                value.clamp(PREVIEW_CHARS_RANGE.0, PREVIEW_CHARS_RANGE.1)
            }
            None => DEFAULT_PREVIEW_CHARS,
        };

        let log_level = parse_log_level(env_var("LOG_LEVEL").as_deref())?;

        let user_phone_column = env_var("USER_PHONE_COLUMN").unwrap_or_else(|| "phone".into());
        if !IDENTIFIER_RE.is_match(&user_phone_column) {
            return Err(ConfigError::Invalid(
                "USER_PHONE_COLUMN must be a plain SQL identifier",
            ));
        }

        Ok(Self {
            port,
            webhook_secret,
            database_url,
            pool_size,
            batch_size,
            interval_ms,
            max_attempts,
            verbose_logs,
            payload_preview_chars,
            log_level,
            user_phone_column,
            blocked_as_opt_out,
        })
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_min_u32(key: &'static str, default: u32, min: u32) -> Result<u32, ConfigError> {
    match env_var(key) {
        Some(raw) => {
            let value: u32 = raw
                .parse()
                .map_err(|_| ConfigError::Invalid("numeric option must be an integer"))?;
            if value < min {
                return Err(ConfigError::Invalid("numeric option below minimum"));
            }
            Ok(value)
        }
        None => Ok(default),
    }
}

fn parse_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env_var(key) {
        Some(raw) => parse_bool_token(&raw),
        None => Ok(default),
    }
}

fn parse_bool_token(raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid("boolean option must be true or false")),
    }
}

/// Map a configured level to a tracing directive. `fatal` collapses into
/// `error` (tracing has no fatal level).
fn parse_log_level(raw: Option<&str>) -> Result<String, ConfigError> {
    match raw.map(|s| s.to_ascii_lowercase()) {
        None => Ok("info".into()),
        Some(level) => match level.as_str() {
            "fatal" | "error" => Ok("error".into()),
            "warn" | "info" | "debug" | "trace" => Ok(level),
            _ => Err(ConfigError::Invalid("LOG_LEVEL not recognized")),
        },
    }
}

/// Resolve the database URL from `DB_URL` / `AWER_MARIADB_URL` /
/// `awer-mariadb-url`, falling back to field-wise `DB_HOST`/`DB_PORT`/
/// `DB_USER`/`DB_PASS`/`DB_NAME`.
fn resolve_database_url() -> Result<String, ConfigError> {
    for key in ["DB_URL", "AWER_MARIADB_URL", "awer-mariadb-url"] {
        if let Some(raw) = env_var(key) {
            return normalize_db_url(&raw);
        }
    }

    let host = env_var("DB_HOST").ok_or(ConfigError::Missing(
        "DB_URL (or AWER_MARIADB_URL, or DB_HOST/DB_USER/DB_NAME)",
    ))?;
    let port = match env_var("DB_PORT") {
        Some(raw) => {
            let port: u16 = raw
                .parse()
                .map_err(|_| ConfigError::Invalid("DB_PORT must be a valid port number"))?;
            port
        }
        None => 3306,
    };
    let user = env_var("DB_USER").ok_or(ConfigError::Missing("DB_USER"))?;
    // Password may legitimately be empty.
    let pass = std::env::var("DB_PASS").unwrap_or_default();
    let name = env_var("DB_NAME").ok_or(ConfigError::Missing("DB_NAME"))?;

    let mut url = format!("mysql://{}", encode_component(&user));
    if !pass.is_empty() {
        url.push(':');
        url.push_str(&encode_component(&pass));
    }
    url.push('@');
    url.push_str(&host);
    url.push(':');
    url.push_str(&port.to_string());
    url.push('/');
    url.push_str(&encode_component(&name));
    Ok(url)
}

/// Normalize a configured database URL: strip a `jdbc:` prefix, require the
/// `mysql://` scheme, and URL-decode then re-encode the user, password, and
/// database components so whatever spelling the deployment uses ends up in
/// canonical form.
pub fn normalize_db_url(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim();
    let without_jdbc = trimmed.strip_prefix("jdbc:").unwrap_or(trimmed);
    let rest = without_jdbc
        .strip_prefix("mysql://")
        .ok_or(ConfigError::Invalid("database URL must use the mysql:// scheme"))?;

    let (before_query, query) = match rest.split_once('?') {
        Some((b, q)) => (b, Some(q)),
        None => (rest, None),
    };
    let (authority, path) = match before_query.split_once('/') {
        Some((a, p)) => (a, Some(p)),
        None => (before_query, None),
    };
    let (userinfo, hostport) = match authority.rsplit_once('@') {
        Some((u, h)) => (Some(u), h),
        None => (None, authority),
    };
    if hostport.is_empty() {
        return Err(ConfigError::Invalid("database URL is missing a host"));
    }

    let mut out = String::from("mysql://");
    if let Some(userinfo) = userinfo {
        let (user, pass) = match userinfo.split_once(':') {
            Some((u, p)) => (u, Some(p)),
            None => (userinfo, None),
        };
        out.push_str(&encode_component(&percent_decode(user)));
        if let Some(pass) = pass {
            if !pass.is_empty() {
                out.push(':');
                out.push_str(&encode_component(&percent_decode(pass)));
            }
        }
        out.push('@');
    }
    out.push_str(hostport);
    if let Some(path) = path {
        out.push('/');
        out.push_str(&encode_component(&percent_decode(path)));
    }
    if let Some(query) = query {
        out.push('?');
        out.push_str(query);
    }
    Ok(out)
}

/// Decode `%XX` escapes; malformed escapes pass through untouched.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Some(byte) = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Percent-encode everything outside the unreserved set.
fn encode_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_mysql_url_passes_through() {
        assert_eq!(
            normalize_db_url("mysql://app:pw@db.internal:3306/awer").unwrap(),
            "mysql://app:pw@db.internal:3306/awer"
        );
    }

    #[test]
    fn jdbc_prefix_is_stripped() {
        assert_eq!(
            normalize_db_url("jdbc:mysql://app:pw@db:3306/awer?useSSL=false").unwrap(),
            "mysql://app:pw@db:3306/awer?useSSL=false"
        );
    }

    #[test]
    fn encoded_credentials_are_decoded_and_reencoded() {
        assert_eq!(
            normalize_db_url("mysql://svc%40corp:p%40ss%2Fword@db:3306/awer").unwrap(),
            "mysql://svc%40corp:p%40ss%2Fword@db:3306/awer"
        );
        // Raw special characters get canonicalized too.
        assert_eq!(
            normalize_db_url("mysql://svc@corp:pass@db:3306/awer").unwrap(),
            "mysql://svc%40corp:pass@db:3306/awer"
        );
    }

    #[test]
    fn empty_password_is_dropped() {
        assert_eq!(
            normalize_db_url("mysql://app:@db:3306/awer").unwrap(),
            "mysql://app@db:3306/awer"
        );
    }

    #[test]
    fn wrong_scheme_is_rejected() {
        assert!(matches!(
            normalize_db_url("postgres://x@y/z"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            normalize_db_url("mysql://"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn percent_decode_handles_malformed_escapes() {
        assert_eq!(percent_decode("a%2Fb"), "a/b");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
    }

    #[test]
    fn log_level_mapping() {
        assert_eq!(parse_log_level(Some("FATAL")).unwrap(), "error");
        assert_eq!(parse_log_level(Some("debug")).unwrap(), "debug");
        assert_eq!(parse_log_level(None).unwrap(), "info");
        assert!(parse_log_level(Some("loud")).is_err());
    }

    #[test]
    fn identifier_whitelist() {
        assert!(IDENTIFIER_RE.is_match("phone"));
        assert!(IDENTIFIER_RE.is_match("phone_e164"));
        assert!(IDENTIFIER_RE.is_match("_cell"));
        assert!(!IDENTIFIER_RE.is_match("phone; DROP TABLE user"));
        assert!(!IDENTIFIER_RE.is_match("1phone"));
        assert!(!IDENTIFIER_RE.is_match("phone`"));
        assert!(!IDENTIFIER_RE.is_match(""));
    }

    #[test]
    fn bool_tokens() {
        assert!(parse_bool_token("TRUE").unwrap());
        assert!(parse_bool_token("1").unwrap());
        assert!(!parse_bool_token("off").unwrap());
        assert!(!parse_bool_token("No").unwrap());
        assert!(parse_bool_token("maybe").is_err());
    }
}
