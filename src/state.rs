use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::db::{self, DbState};
use crate::delivery::{DynRoutePlanner, OrsPlanner, UnconfiguredPlanner};
use crate::gateway::{DisabledGateway, DynPaymentGateway, StripeGateway};
use crate::notify::{Disabled, DynChatSender, DynMailer, GreenApiSender, Notifier, SmtpMailer};

/// Handles shared by every request. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbState>,
    pub config: Arc<Config>,
    pub payments: DynPaymentGateway,
    pub planner: DynRoutePlanner,
    pub notifier: Notifier,
}

impl AppState {
    /// Open the database and build the production adapters. Integrations
    /// without credentials fall back to disabled stand-ins.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let db = db::init(&config.database_path).map_err(anyhow::Error::msg)?;

        let payments: DynPaymentGateway = match config.stripe_secret_key.as_deref() {
            Some(key) => Arc::new(StripeGateway::new(key)),
            None => {
                warn!("STRIPE_SECRET_KEY not set, online checkout disabled");
                Arc::new(DisabledGateway)
            }
        };

        let planner: DynRoutePlanner = match config.ors_api_key.as_deref() {
            Some(key) => Arc::new(OrsPlanner::new(key)?),
            None => {
                warn!("ORS_API_KEY not set, route generation disabled");
                Arc::new(UnconfiguredPlanner)
            }
        };

        let mailer: DynMailer = match &config.smtp {
            Some(smtp) => Arc::new(SmtpMailer::new(smtp)?),
            None => {
                warn!("EMAIL_USER/EMAIL_PASSWORD not set, customer email disabled");
                Arc::new(Disabled)
            }
        };

        let chat: DynChatSender = match &config.green_api {
            Some(green) => Arc::new(GreenApiSender::new(green.clone())?),
            None => {
                warn!("GREEN_API credentials not set, WhatsApp alerts disabled");
                Arc::new(Disabled)
            }
        };

        info!(
            env = ?config.app_env,
            db = %config.database_path.display(),
            "application state ready"
        );

        Ok(Self {
            db: Arc::new(db),
            notifier: Notifier::new(mailer, chat, config.admin_phone_number.clone()),
            config: Arc::new(config),
            payments,
            planner,
        })
    }
}
