//! Domain enums and row types shared across the service modules.
//!
//! Enums are stored in SQLite as their lowercase text form; the
//! `text_enum!` macro wires up `Display`, `FromStr`, `ToSql` and `FromSql`
//! so rows can be read and written without ad hoc string matching.

use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("Invalid {}: {other}", stringify!($name))),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                text.parse()
                    .map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Locations
// ---------------------------------------------------------------------------

/// A physical shop. Each product keeps one inventory counter per location.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    #[default]
    Leeds,
    Derby,
    Sheffield,
}

text_enum!(Location {
    Leeds => "leeds",
    Derby => "derby",
    Sheffield => "sheffield",
});

impl Location {
    pub const ALL: [Location; 3] = [Location::Leeds, Location::Derby, Location::Sheffield];

    /// Column holding this location's stock on the `products` table.
    pub fn inventory_column(&self) -> &'static str {
        match self {
            Location::Leeds => "inventory_leeds",
            Location::Derby => "inventory_derby",
            Location::Sheffield => "inventory_sheffield",
        }
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Preparing,
    Ready,
    Delivered,
    Cancelled,
}

text_enum!(OrderStatus {
    Pending => "pending",
    Confirmed => "confirmed",
    Preparing => "preparing",
    Ready => "ready",
    Delivered => "delivered",
    Cancelled => "cancelled",
});

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Online,
    Cash,
}

text_enum!(PaymentMethod {
    Online => "online",
    Cash => "cash",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Refunded,
}

text_enum!(PaymentStatus {
    Pending => "pending",
    Paid => "paid",
    Refunded => "refunded",
});

/// Address literal used for pickup orders.
pub const COLLECTION_ADDRESS: &str = "Collection";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: i64,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: Option<String>,
    pub address: String,
    pub postcode: Option<String>,
    pub location: Location,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    pub subtotal: f64,
    pub discount_amount: f64,
    pub discount_code: Option<String>,
    pub total_amount: f64,
    pub status: OrderStatus,
    pub driver_id: Option<i64>,
    pub route_id: Option<i64>,
    pub route_position: Option<i64>,
    pub stripe_session_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub feedback_submitted: bool,
    pub notes: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Order {
    /// Column list matching [`Order::from_row`].
    pub const COLUMNS: &'static str = "id, customer_name, customer_email, customer_phone, address,
        postcode, location, payment_method, payment_status, subtotal, discount_amount,
        discount_code, total_amount, status, driver_id, route_id, route_position,
        stripe_session_id, payment_intent_id, feedback_submitted, notes, created_at, updated_at";

    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            customer_name: row.get(1)?,
            customer_email: row.get(2)?,
            customer_phone: row.get(3)?,
            address: row.get(4)?,
            postcode: row.get(5)?,
            location: row.get(6)?,
            payment_method: row.get(7)?,
            payment_status: row.get(8)?,
            subtotal: row.get(9)?,
            discount_amount: row.get(10)?,
            discount_code: row.get(11)?,
            total_amount: row.get(12)?,
            status: row.get(13)?,
            driver_id: row.get(14)?,
            route_id: row.get(15)?,
            route_position: row.get(16)?,
            stripe_session_id: row.get(17)?,
            payment_intent_id: row.get(18)?,
            feedback_submitted: row.get::<_, i64>(19)? != 0,
            notes: row.get(20)?,
            created_at: row.get(21)?,
            updated_at: row.get(22)?,
        })
    }

    pub fn is_collection(&self) -> bool {
        self.address.trim().eq_ignore_ascii_case(COLLECTION_ADDRESS)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub product_id: i64,
    #[serde(default)]
    pub product_name: Option<String>,
    pub quantity: i64,
    pub price: f64,
}

// ---------------------------------------------------------------------------
// Cart & customer (checkout input, serialised into payment metadata)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    pub price: f64,
    pub quantity: i64,
    /// Free promotional line; excluded from the subtotal.
    #[serde(default, rename = "isFreeRegipallu")]
    pub is_free: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CustomerInfo {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub postcode: Option<String>,
    #[serde(default)]
    pub location: Location,
    #[serde(default)]
    pub notes: Option<String>,
}

impl CustomerInfo {
    /// Delivery address, or the collection literal when none was given.
    pub fn delivery_address(&self) -> String {
        self.address
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .unwrap_or(COLLECTION_ADDRESS)
            .to_string()
    }
}

// ---------------------------------------------------------------------------
// Admin users
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    SuperAdmin,
    Admin,
    Driver,
    Organiser,
}

text_enum!(Role {
    SuperAdmin => "super_admin",
    Admin => "admin",
    Driver => "driver",
    Organiser => "organiser",
});

impl Role {
    /// Shop staff: may manage orders, catalogue and inventory.
    pub fn is_staff(&self) -> bool {
        matches!(self, Role::SuperAdmin | Role::Admin)
    }
}

// ---------------------------------------------------------------------------
// Delivery routes & event bookings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStatus {
    Assigned,
    InProgress,
    Completed,
}

text_enum!(RouteStatus {
    Assigned => "assigned",
    InProgress => "in_progress",
    Completed => "completed",
});

impl RouteStatus {
    pub fn can_become(&self, next: RouteStatus) -> bool {
        matches!(
            (self, next),
            (RouteStatus::Assigned, RouteStatus::InProgress)
                | (RouteStatus::Assigned, RouteStatus::Completed)
                | (RouteStatus::InProgress, RouteStatus::Completed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Paid,
    Overbooked,
}

text_enum!(BookingStatus {
    Pending => "pending",
    Paid => "paid",
    Overbooked => "overbooked",
});

/// Round a pound amount to whole pence.
pub fn round_money(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

/// Convert pounds to integer pence for the payment provider.
pub fn to_pence(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}
