use std::{env, fmt::Display, path::PathBuf, str::FromStr};

use tracing::{info, warn};

const DEV_JWT_SECRET: &str = "samajd-development-secret-change-me";

/// Field limits applied by the member import validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportLimits {
    pub membership_no_max: usize,
    pub mobile_max: usize,
}

impl Default for ImportLimits {
    fn default() -> Self {
        Self {
            membership_no_max: 10,
            mobile_max: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub jwt_ttl_hours: i64,
    pub admin_username: String,
    pub admin_password: String,
    pub alert_to: Option<String>,
    pub alert_from: String,
    /// Where clients drop uploads. Defaults to `<workspace>/staging`.
    pub staging_dir: Option<PathBuf>,
    pub import_limits: ImportLimits,
}

impl Config {
    pub fn load() -> Self {
        let jwt_secret = var("SAMAJ_JWT_SECRET").unwrap_or_else(|_| {
            warn!("SAMAJ_JWT_SECRET is not set; using the development fallback secret");
            DEV_JWT_SECRET.to_string()
        });

        Self {
            jwt_secret,
            jwt_ttl_hours: try_load("SAMAJ_JWT_TTL_HOURS", "24"),
            admin_username: try_load("SAMAJ_ADMIN_USERNAME", "admin"),
            admin_password: try_load("SAMAJ_ADMIN_PASSWORD", "admin123"),
            alert_to: var("SAMAJ_ALERT_TO").ok().filter(|s| !s.trim().is_empty()),
            alert_from: try_load("SAMAJ_ALERT_FROM", "security-alert@localhost"),
            staging_dir: var("SAMAJ_STAGING_DIR")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            import_limits: ImportLimits {
                membership_no_max: try_load("SAMAJ_MEMBERSHIP_NO_MAX", "10"),
                mobile_max: try_load("SAMAJ_MOBILE_MAX", "10"),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            jwt_secret: DEV_JWT_SECRET.to_string(),
            jwt_ttl_hours: 24,
            admin_username: "admin".to_string(),
            admin_password: "admin123".to_string(),
            alert_to: None,
            alert_from: "security-alert@localhost".to_string(),
            staging_dir: None,
            import_limits: ImportLimits::default(),
        }
    }
}

fn var(key: &str) -> Result<String, ()> {
    env::var(key).map_err(|_| {
        warn!("Environment variable {key} not found, using default");
    })
}

fn try_load<T: FromStr>(key: &str, default: &str) -> T
where
    T::Err: Display,
{
    let raw = var(key).unwrap_or_else(|_| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });
    match raw.trim().parse() {
        Ok(v) => v,
        Err(e) => {
            warn!("Invalid {key} value {raw:?}: {e}; using default {default}");
            parse_default(default)
        }
    }
}

// Defaults are compile-time literals; a bad one is a programming error.
fn parse_default<T: FromStr>(default: &str) -> T
where
    T::Err: Display,
{
    match default.parse() {
        Ok(v) => v,
        Err(e) => panic!("built-in default {default:?} does not parse: {e}"),
    }
}
