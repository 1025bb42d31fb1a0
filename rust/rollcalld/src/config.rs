use std::{collections::HashSet, env, fmt::Display, str::FromStr, time::Duration};

use tracing::{info, warn};

pub const DEFAULT_ONESIGNAL_API_URL: &str = "https://onesignal.com/api/v1";
pub const DEFAULT_TELEGRAM_API_URL: &str = "https://api.telegram.org";

#[derive(Debug, Clone)]
pub struct Config {
    pub super_admins: HashSet<String>,
    pub onesignal_app_id: Option<String>,
    pub onesignal_api_key: Option<String>,
    pub onesignal_api_url: String,
    pub telegram_bot_token: Option<String>,
    pub telegram_api_url: String,
    pub http_timeout: Duration,
}

impl Config {
    pub fn load() -> Self {
        let super_admins = parse_email_set(&var("ROLLCALLD_SUPER_ADMINS").unwrap_or_default());
        if super_admins.is_empty() {
            warn!("ROLLCALLD_SUPER_ADMINS is empty; no account can reach cross-school screens");
        }

        Self {
            super_admins,
            onesignal_app_id: secret("ONESIGNAL_APP_ID"),
            onesignal_api_key: secret("ONESIGNAL_API_KEY"),
            onesignal_api_url: base_url("ONESIGNAL_API_URL", DEFAULT_ONESIGNAL_API_URL),
            telegram_bot_token: secret("TELEGRAM_BOT_TOKEN"),
            telegram_api_url: base_url("TELEGRAM_API_URL", DEFAULT_TELEGRAM_API_URL),
            http_timeout: Duration::from_secs(try_load("ROLLCALLD_HTTP_TIMEOUT_SECS", "15")),
        }
    }

    pub fn is_super_admin(&self, email: &str) -> bool {
        self.super_admins.contains(&normalize_email(email))
    }

    pub fn push_configured(&self) -> bool {
        self.onesignal_app_id.is_some() && self.onesignal_api_key.is_some()
    }

    pub fn telegram_configured(&self) -> bool {
        self.telegram_bot_token.is_some()
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

fn parse_email_set(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(normalize_email)
        .filter(|s| !s.is_empty())
        .collect()
}

fn trim_base(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

fn base_url(key: &str, default: &str) -> String {
    trim_base(&try_load::<String>(key, default))
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

// Never echo the value; these carry credentials.
fn secret(key: &str) -> Option<String> {
    let v = var(key).map(|s| s.trim().to_string());
    if v.is_none() {
        info!("{key} not set; related notifications are disabled");
    }
    v
}

fn try_load<T: FromStr>(key: &str, default: &str) -> T
where
    T::Err: Display,
{
    let raw = var(key).unwrap_or_else(|| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });
    match raw.trim().parse() {
        Ok(v) => v,
        Err(e) => {
            warn!("Invalid {key} value: {e}; using default: {default}");
            match default.parse() {
                Ok(v) => v,
                // Defaults are literals above; a parse failure here is a programming error.
                Err(_) => unreachable!("default for {key} must parse"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_set_is_trimmed_lowercased_and_skips_blanks() {
        let set = parse_email_set(" Root@Example.com,, ops@example.com ,");
        assert_eq!(set.len(), 2);
        assert!(set.contains("root@example.com"));
        assert!(set.contains("ops@example.com"));
    }

    #[test]
    fn base_urls_lose_trailing_slash() {
        assert_eq!(trim_base("http://127.0.0.1:9000/"), "http://127.0.0.1:9000");
        assert_eq!(trim_base(DEFAULT_TELEGRAM_API_URL), DEFAULT_TELEGRAM_API_URL);
    }

    #[test]
    fn base_url_reads_env_or_falls_back() {
        let key = "ROLLCALLD_TEST_BASE_URL_ONLY";
        assert_eq!(base_url(key, "https://push.test/api/"), "https://push.test/api");
        env::set_var(key, " http://127.0.0.1:9000/onesignal/ ");
        assert_eq!(base_url(key, DEFAULT_ONESIGNAL_API_URL), "http://127.0.0.1:9000/onesignal");
        env::remove_var(key);
    }

    #[test]
    fn super_admin_match_ignores_case() {
        let cfg = Config {
            super_admins: parse_email_set("root@example.com"),
            onesignal_app_id: None,
            onesignal_api_key: None,
            onesignal_api_url: DEFAULT_ONESIGNAL_API_URL.to_string(),
            telegram_bot_token: None,
            telegram_api_url: DEFAULT_TELEGRAM_API_URL.to_string(),
            http_timeout: Duration::from_secs(15),
        };
        assert!(cfg.is_super_admin("ROOT@example.com "));
        assert!(!cfg.is_super_admin("admin@example.com"));
        assert!(!cfg.push_configured());
        assert!(!cfg.telegram_configured());
    }
}
