//! In-memory doubles of the external services and seed helpers for tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::params;

use crate::auth::{self, Claims, NewUser};
use crate::config::Config;
use crate::db::DbState;
use crate::delivery::{Coordinate, Directions, RoutePlanner};
use crate::error::{AppError, AppResult};
use crate::gateway::{CheckoutRequest, HostedSession, PaymentGateway};
use crate::models::{CustomerInfo, Location, OrderStatus, Role};
use crate::notify::{ChatSender, EmailMessage, Mailer, Notifier};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Payment gateway
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeGateway {
    sessions: Mutex<Vec<CheckoutRequest>>,
    refunds: Mutex<Vec<String>>,
    checkout_error: Mutex<Option<String>>,
    refund_error: Mutex<Option<String>>,
}

impl FakeGateway {
    pub fn sessions(&self) -> Vec<CheckoutRequest> {
        self.sessions.lock().unwrap().clone()
    }

    pub fn refunds(&self) -> Vec<String> {
        self.refunds.lock().unwrap().clone()
    }

    pub fn fail_next_checkout(&self, msg: &str) {
        *self.checkout_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn fail_next_refund(&self, msg: &str) {
        *self.refund_error.lock().unwrap() = Some(msg.to_string());
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_checkout(&self, request: CheckoutRequest) -> AppResult<HostedSession> {
        if let Some(msg) = self.checkout_error.lock().unwrap().take() {
            return Err(AppError::Payment(msg));
        }
        let mut sessions = self.sessions.lock().unwrap();
        sessions.push(request);
        let id = format!("cs_test_{}", sessions.len());
        Ok(HostedSession {
            url: format!("https://checkout.test/{id}"),
            id,
        })
    }

    async fn refund(&self, session_id: &str, _: Option<&str>) -> AppResult<String> {
        if let Some(msg) = self.refund_error.lock().unwrap().take() {
            return Err(AppError::Payment(msg));
        }
        let mut refunds = self.refunds.lock().unwrap();
        refunds.push(session_id.to_string());
        Ok(format!("re_{}", refunds.len()))
    }
}

// ---------------------------------------------------------------------------
// Route planner
// ---------------------------------------------------------------------------

/// Geocodes `"<lon>,<lat> ..."` addresses; anything else is unknown.
/// Optimisation keeps the input order unless a reversal is requested.
#[derive(Default)]
pub struct FakePlanner {
    pub reverse: Mutex<bool>,
    pub fail_optimize: Mutex<bool>,
    pub geocode_calls: Mutex<usize>,
}

#[async_trait]
impl RoutePlanner for FakePlanner {
    async fn geocode(&self, address: &str) -> AppResult<Option<Coordinate>> {
        *self.geocode_calls.lock().unwrap() += 1;
        let head = address.split_whitespace().next().unwrap_or_default();
        let parsed = head.split_once(',').and_then(|(lon, lat)| {
            Some(Coordinate {
                lon: lon.parse().ok()?,
                lat: lat.parse().ok()?,
            })
        });
        Ok(parsed)
    }

    async fn optimize(
        &self,
        stops: &[Coordinate],
        _depot: Option<Coordinate>,
    ) -> AppResult<Vec<usize>> {
        if *self.fail_optimize.lock().unwrap() {
            return Err(AppError::Upstream("optimizer unavailable".into()));
        }
        let mut order: Vec<usize> = (0..stops.len()).collect();
        if *self.reverse.lock().unwrap() {
            order.reverse();
        }
        Ok(order)
    }

    async fn directions(&self, coordinates: &[Coordinate]) -> AppResult<Directions> {
        Ok(Directions {
            geometry: serde_json::json!({
                "type": "LineString",
                "coordinates": coordinates.iter().map(|c| [c.lon, c.lat]).collect::<Vec<_>>(),
            }),
            distance_m: 1000.0 * coordinates.len() as f64,
            duration_s: 120.0 * coordinates.len() as f64,
        })
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<EmailMessage>>,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, message: EmailMessage) -> AppResult<()> {
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingChat {
    messages: Mutex<Vec<(String, String)>>,
}

impl RecordingChat {
    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatSender for RecordingChat {
    async fn send_message(&self, phone: &str, text: &str) -> AppResult<()> {
        self.messages
            .lock()
            .unwrap()
            .push((phone.to_string(), text.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// App
// ---------------------------------------------------------------------------

pub struct TestApp {
    pub state: AppState,
    pub gateway: Arc<FakeGateway>,
    pub planner: Arc<FakePlanner>,
    pub mailer: Arc<RecordingMailer>,
    pub chat: Arc<RecordingChat>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(Config::for_tests())
    }

    pub fn with_config(config: Config) -> Self {
        let gateway = Arc::new(FakeGateway::default());
        let planner = Arc::new(FakePlanner::default());
        let mailer = Arc::new(RecordingMailer::default());
        let chat = Arc::new(RecordingChat::default());
        let state = AppState {
            db: Arc::new(DbState::in_memory().expect("in-memory db")),
            notifier: Notifier::new(
                mailer.clone(),
                chat.clone(),
                config.admin_phone_number.clone(),
            ),
            config: Arc::new(config),
            payments: gateway.clone(),
            planner: planner.clone(),
        };
        Self {
            state,
            gateway,
            planner,
            mailer,
            chat,
        }
    }

    /// Create a user and return a bearer token for it.
    pub fn login_as(&self, role: Role, location: Option<Location>) -> (i64, String) {
        let email = format!("{}-{}@example.com", role, uuid::Uuid::new_v4().simple());
        let user = auth::create_user(
            &self.state.db,
            NewUser {
                email,
                password: "password123".into(),
                name: format!("Test {role}"),
                role,
                location,
            },
        )
        .expect("create user");
        let token = auth::issue_token(&self.state.config.jwt_secret, &user).expect("token");
        (user.id, token)
    }
}

// ---------------------------------------------------------------------------
// Seeds
// ---------------------------------------------------------------------------

pub fn customer(email: &str) -> CustomerInfo {
    CustomerInfo {
        name: "Ann Customer".into(),
        email: email.into(),
        phone: Some("07700900123".into()),
        address: Some("1 Market St".into()),
        postcode: Some("LS1 1AA".into()),
        location: Location::Leeds,
        notes: None,
    }
}

/// Insert a staff user and return claims for it.
pub fn seed_staff(db: &DbState, role: Role, location: Option<Location>) -> Claims {
    let user = auth::create_user(
        db,
        NewUser {
            email: format!("{}-{}@example.com", role, uuid::Uuid::new_v4().simple()),
            password: "password123".into(),
            name: format!("Test {role}"),
            role,
            location,
        },
    )
    .expect("create user");
    staff_claims(user.id, role, location)
}

pub fn staff_claims(id: i64, role: Role, location: Option<Location>) -> Claims {
    Claims {
        sub: id,
        role,
        location,
        exp: usize::MAX,
    }
}

/// 1 Steak pie £10 (20 per shop), 2 Brownie £4 (50 per shop, max 5 per
/// order), 3 Retired pie (inactive).
pub fn seed_products(db: &DbState) {
    db.conn
        .lock()
        .unwrap()
        .execute_batch(
            "INSERT INTO categories (id, name) VALUES (1, 'Pies'), (2, 'Cakes');
             INSERT INTO products (id, name, price, category_id, inventory_leeds, inventory_derby, inventory_sheffield, max_per_order, is_active)
             VALUES (1, 'Steak pie', 10.0, 1, 20, 20, 20, NULL, 1),
                    (2, 'Brownie', 4.0, 2, 50, 50, 50, 5, 1),
                    (3, 'Retired pie', 6.0, 1, 5, 5, 5, NULL, 0);",
        )
        .expect("seed products");
}

/// Cash order with one Steak pie. Returns the order id.
pub fn seed_order(db: &DbState, location: Location, status: OrderStatus) -> i64 {
    seed_order_at(db, location, status, "1 Market St", &[(1, 1)])
}

pub fn seed_order_at(
    db: &DbState,
    location: Location,
    status: OrderStatus,
    address: &str,
    lines: &[(i64, i64)],
) -> i64 {
    let conn = db.conn.lock().unwrap();
    let total: f64 = lines.len() as f64 * 10.0;
    conn.execute(
        "INSERT INTO orders (customer_name, customer_email, address, postcode, location,
                             payment_method, payment_status, subtotal, total_amount, status)
         VALUES ('Ann Customer', 'ann@example.com', ?1, 'LS1 1AA', ?2, 'cash', 'pending', ?3, ?3, ?4)",
        params![address, location, total, status],
    )
    .unwrap();
    let id = conn.last_insert_rowid();
    for (product_id, qty) in lines {
        conn.execute(
            "INSERT INTO order_items (order_id, product_id, quantity, price) VALUES (?1, ?2, ?3, 10.0)",
            params![id, product_id, qty],
        )
        .unwrap();
    }
    id
}

/// Paid online order with session id `cs_seed_<id>`.
pub fn seed_online_order(db: &DbState, location: Location, lines: &[(i64, i64)]) -> i64 {
    let id = seed_order_at(db, location, OrderStatus::Pending, "1 Market St", lines);
    db.conn
        .lock()
        .unwrap()
        .execute(
            "UPDATE orders SET payment_method = 'online', payment_status = 'paid',
                    stripe_session_id = 'cs_seed_' || id, payment_intent_id = 'pi_seed_' || id
             WHERE id = ?1",
            params![id],
        )
        .unwrap();
    id
}

/// Key/value lookup for building configs in tests.
pub fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}
