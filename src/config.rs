//! Process configuration.
//!
//! Values come from the environment (after `dotenv` loads an optional
//! `.env`). Optional integrations stay `None` when their keys are absent and
//! the matching adapter degrades to a disabled implementation.

use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context};
use tracing::{info, warn};

pub const DEFAULT_PORT: u16 = 3001;
pub const DEFAULT_LOW_STOCK_THRESHOLD: i64 = 10;
pub const DEFAULT_DISCOUNT_CRON_HOUR: u32 = 9;
const DEV_JWT_SECRET: &str = "dev-only-insecure-jwt-secret";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    Development,
    Production,
}

impl AppEnv {
    pub fn is_production(&self) -> bool {
        matches!(self, AppEnv::Production)
    }
}

impl FromStr for AppEnv {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(AppEnv::Production),
            "development" | "dev" | "test" | "" => Ok(AppEnv::Development),
            other => Err(format!("unknown APP_ENV: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct GreenApiConfig {
    pub instance_id: String,
    pub token: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub app_env: AppEnv,
    pub database_path: PathBuf,
    pub stripe_secret_key: Option<String>,
    pub stripe_webhook_secret: Option<String>,
    pub ors_api_key: Option<String>,
    pub green_api: Option<GreenApiConfig>,
    pub smtp: Option<SmtpConfig>,
    pub cors_origin: String,
    pub frontend_url: String,
    pub admin_phone_number: Option<String>,
    pub jwt_secret: String,
    pub low_stock_threshold: i64,
    pub discount_cron_hour: u32,
    pub log_dir: PathBuf,
    pub log_format: LogFormat,
    pub bootstrap_admin: Option<(String, String)>,
    /// Start/end point for delivery routes as `(lon, lat)`.
    pub delivery_depot: Option<(f64, f64)>,
}

impl Config {
    /// Load from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let app_env: AppEnv = try_load(&get, "APP_ENV", "development")?;
        let stripe_webhook_secret = get("STRIPE_WEBHOOK_SECRET");

        let jwt_secret = match get("JWT_SECRET") {
            Some(secret) => secret,
            None if app_env.is_production() => bail!("JWT_SECRET must be set in production"),
            None => {
                warn!("JWT_SECRET not set, using an insecure development secret");
                DEV_JWT_SECRET.to_string()
            }
        };
        if app_env.is_production() && stripe_webhook_secret.is_none() {
            bail!("STRIPE_WEBHOOK_SECRET must be set in production");
        }

        let discount_cron_hour: u32 = try_load(
            &get,
            "DISCOUNT_CRON_HOUR",
            &DEFAULT_DISCOUNT_CRON_HOUR.to_string(),
        )?;
        if discount_cron_hour > 23 {
            bail!("DISCOUNT_CRON_HOUR must be between 0 and 23, got {discount_cron_hour}");
        }

        let smtp = match (get("EMAIL_USER"), get("EMAIL_PASSWORD")) {
            (Some(user), Some(password)) => Some(SmtpConfig {
                host: get("SMTP_HOST").unwrap_or_else(|| "smtp.gmail.com".to_string()),
                user,
                password,
            }),
            _ => None,
        };

        let green_api = match (get("GREEN_API_INSTANCE_ID"), get("GREEN_API_TOKEN")) {
            (Some(instance_id), Some(token)) => Some(GreenApiConfig { instance_id, token }),
            _ => None,
        };

        let log_format = match get("LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        let delivery_depot = get("DELIVERY_DEPOT")
            .map(|raw| parse_coordinate(&raw))
            .transpose()
            .context("invalid DELIVERY_DEPOT")?;

        let bootstrap_admin = match (
            get("BOOTSTRAP_ADMIN_EMAIL"),
            get("BOOTSTRAP_ADMIN_PASSWORD"),
        ) {
            (Some(email), Some(password)) => Some((email, password)),
            _ => None,
        };

        Ok(Self {
            port: try_load(&get, "PORT", &DEFAULT_PORT.to_string())?,
            app_env,
            database_path: PathBuf::from(
                get("DATABASE_PATH").unwrap_or_else(|| "data/food-order.db".to_string()),
            ),
            stripe_secret_key: get("STRIPE_SECRET_KEY"),
            stripe_webhook_secret,
            ors_api_key: get("ORS_API_KEY"),
            green_api,
            smtp,
            cors_origin: get("CORS_ORIGIN").unwrap_or_else(|| "http://localhost:5173".to_string()),
            frontend_url: get("FRONTEND_URL")
                .unwrap_or_else(|| "http://localhost:5173".to_string())
                .trim_end_matches('/')
                .to_string(),
            admin_phone_number: get("ADMIN_PHONE_NUMBER"),
            jwt_secret,
            low_stock_threshold: try_load(
                &get,
                "LOW_STOCK_THRESHOLD",
                &DEFAULT_LOW_STOCK_THRESHOLD.to_string(),
            )?,
            discount_cron_hour,
            log_dir: PathBuf::from(get("LOG_DIR").unwrap_or_else(|| "logs".to_string())),
            log_format,
            bootstrap_admin,
            delivery_depot,
        })
    }

    /// Config for tests: development mode, no integrations.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self::from_lookup(|key| match key {
            "STRIPE_WEBHOOK_SECRET" => Some("whsec_test".to_string()),
            "JWT_SECRET" => Some("test-jwt-secret".to_string()),
            "ADMIN_PHONE_NUMBER" => Some("447700900000".to_string()),
            "FRONTEND_URL" => Some("http://shop.test".to_string()),
            _ => None,
        })
        .expect("test config")
    }
}

fn try_load<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: &str,
) -> anyhow::Result<T>
where
    T::Err: Display,
{
    let raw = get(key).unwrap_or_else(|| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });
    raw.parse()
        .map_err(|e| anyhow!("Invalid {key} value {raw:?}: {e}"))
}

/// Parse `"lon,lat"`.
fn parse_coordinate(raw: &str) -> anyhow::Result<(f64, f64)> {
    let (lon, lat) = raw
        .split_once(',')
        .ok_or_else(|| anyhow!("expected \"lon,lat\", got {raw:?}"))?;
    let lon: f64 = lon.trim().parse().context("longitude")?;
    let lat: f64 = lat.trim().parse().context("latitude")?;
    if !(-180.0..=180.0).contains(&lon) || !(-90.0..=90.0).contains(&lat) {
        bail!("coordinate out of range: {raw}");
    }
    Ok((lon, lat))
}
