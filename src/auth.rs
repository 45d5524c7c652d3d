//! Admin authentication with bcrypt and signed bearer tokens.
//!
//! Staff accounts live in `admin_users`. A successful login returns an
//! HS256 JWT carrying the user id, role and location binding; protected
//! routes validate it on every request. Failed logins are tracked per email
//! in `app_settings` (category "login_lockout") and lock the account for a
//! while after repeated failures.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::db::{self, DbState};
use crate::error::{AppError, AppResult};
use crate::models::{Location, Role};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const TOKEN_LIFETIME_HOURS: i64 = 12;
const MAX_FAILED_ATTEMPTS: u32 = 5;
const LOCKOUT_MINUTES: i64 = 15;
const LOCKOUT_CATEGORY: &str = "login_lockout";
const MIN_PASSWORD_LEN: usize = 8;

const HASH_COST: u32 = if cfg!(test) { 4 } else { bcrypt::DEFAULT_COST };

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    pub sub: i64,
    pub role: Role,
    #[serde(default)]
    pub location: Option<Location>,
    pub exp: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdminUser {
    pub id: i64,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub location: Option<Location>,
    pub created_at: String,
}

impl AdminUser {
    const COLUMNS: &'static str = "id, email, name, role, location, created_at";

    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            email: row.get(1)?,
            name: row.get(2)?,
            role: row.get(3)?,
            location: row.get(4)?,
            created_at: row.get(5)?,
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub user: AdminUser,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LockoutEntry {
    attempts: u32,
    last_attempt: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

pub fn issue_token(secret: &str, user: &AdminUser) -> AppResult<String> {
    let exp = (Utc::now() + Duration::hours(TOKEN_LIFETIME_HOURS)).timestamp() as usize;
    let claims = Claims {
        sub: user.id,
        role: user.role,
        location: user.location,
        exp,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::internal(format!("token encode: {e}")))
}

pub fn verify_token(secret: &str, token: &str) -> AppResult<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map(|data| data.claims)
    .map_err(|e| {
        warn!(error = %e, "rejected bearer token");
        AppError::unauthorized("Invalid or expired token")
    })
}

/// Refresh `claims` from the account row so role and shop changes apply
/// to tokens issued before them. A deleted account is unauthorized.
pub fn current_claims(db: &DbState, claims: Claims) -> AppResult<Claims> {
    let conn = db.lock()?;
    match find_user(&conn, claims.sub) {
        Ok(user) => Ok(Claims {
            role: user.role,
            location: user.location,
            ..claims
        }),
        Err(AppError::NotFound(_)) => {
            warn!(user_id = claims.sub, "token for a deleted account");
            Err(AppError::unauthorized("Account no longer exists"))
        }
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// Lockout
// ---------------------------------------------------------------------------

fn load_lockout(conn: &Connection, email: &str) -> LockoutEntry {
    db::get_setting(conn, LOCKOUT_CATEGORY, email)
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

fn persist_lockout(conn: &Connection, email: &str, entry: &LockoutEntry) {
    let raw = serde_json::to_string(entry).unwrap_or_default();
    if let Err(e) = db::set_setting(conn, LOCKOUT_CATEGORY, email, &raw) {
        warn!(error = %e, "failed to persist login lockout");
    }
}

fn check_lockout(entry: &LockoutEntry, now: DateTime<Utc>) -> AppResult<()> {
    if entry.attempts < MAX_FAILED_ATTEMPTS {
        return Ok(());
    }
    if let Some(last) = entry.last_attempt {
        let unlock_at = last + Duration::minutes(LOCKOUT_MINUTES);
        if now < unlock_at {
            let remaining = (unlock_at - now).num_minutes() + 1;
            return Err(AppError::unauthorized(format!(
                "Too many failed attempts. Try again in {remaining} minute(s)"
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Login
// ---------------------------------------------------------------------------

/// Verify credentials and issue a token.
pub fn login(db: &DbState, secret: &str, email: &str, password: &str) -> AppResult<LoginResponse> {
    let email = email.trim().to_ascii_lowercase();
    if email.is_empty() || password.is_empty() {
        return Err(AppError::bad_request("Email and password are required"));
    }

    let conn = db.lock()?;
    let now = Utc::now();

    let mut lockout = load_lockout(&conn, &email);
    if lockout.attempts >= MAX_FAILED_ATTEMPTS
        && lockout
            .last_attempt
            .is_some_and(|last| now >= last + Duration::minutes(LOCKOUT_MINUTES))
    {
        lockout = LockoutEntry::default();
    }
    check_lockout(&lockout, now)?;

    let row: Option<(String, AdminUser)> = conn
        .query_row(
            &format!(
                "SELECT password_hash, {} FROM admin_users WHERE email = ?1",
                AdminUser::COLUMNS
            ),
            params![email],
            |row| {
                let hash: String = row.get(0)?;
                let user = AdminUser {
                    id: row.get(1)?,
                    email: row.get(2)?,
                    name: row.get(3)?,
                    role: row.get(4)?,
                    location: row.get(5)?,
                    created_at: row.get(6)?,
                };
                Ok((hash, user))
            },
        )
        .optional()?;

    match row {
        Some((hash, user)) if bcrypt::verify(password, &hash).unwrap_or(false) => {
            persist_lockout(&conn, &email, &LockoutEntry::default());
            let token = issue_token(secret, &user)?;
            info!(user_id = user.id, role = %user.role, "admin login successful");
            Ok(LoginResponse { token, user })
        }
        _ => {
            lockout.attempts += 1;
            lockout.last_attempt = Some(now);
            persist_lockout(&conn, &email, &lockout);
            warn!(email = %email, attempts = lockout.attempts, "admin login failed");
            Err(AppError::unauthorized("Invalid email or password"))
        }
    }
}

// ---------------------------------------------------------------------------
// User management
// ---------------------------------------------------------------------------

fn hash_password(password: &str) -> AppResult<String> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::bad_request(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    bcrypt::hash(password, HASH_COST).map_err(|e| AppError::internal(format!("hash: {e}")))
}

pub fn get_user(db: &DbState, id: i64) -> AppResult<AdminUser> {
    let conn = db.lock()?;
    find_user(&conn, id)
}

fn find_user(conn: &Connection, id: i64) -> AppResult<AdminUser> {
    conn.query_row(
        &format!("SELECT {} FROM admin_users WHERE id = ?1", AdminUser::COLUMNS),
        params![id],
        AdminUser::from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found(format!("User {id} not found")))
}

pub fn list_users(db: &DbState) -> AppResult<Vec<AdminUser>> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM admin_users ORDER BY role, name",
        AdminUser::COLUMNS
    ))?;
    let users = stmt
        .query_map([], AdminUser::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(users)
}

/// Drivers, optionally restricted to one location.
pub fn list_drivers(db: &DbState, location: Option<Location>) -> AppResult<Vec<AdminUser>> {
    Ok(list_users(db)?
        .into_iter()
        .filter(|u| u.role == Role::Driver)
        .filter(|u| location.is_none() || u.location.is_none() || u.location == location)
        .collect())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub email: String,
    pub password: String,
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub location: Option<Location>,
}

pub fn create_user(db: &DbState, input: NewUser) -> AppResult<AdminUser> {
    let email = input.email.trim().to_ascii_lowercase();
    if !email.contains('@') {
        return Err(AppError::bad_request("A valid email is required"));
    }
    let name = input.name.trim();
    if name.is_empty() {
        return Err(AppError::bad_request("Name is required"));
    }
    let hash = hash_password(&input.password)?;

    let conn = db.lock()?;
    conn.execute(
        "INSERT INTO admin_users (email, password_hash, name, role, location)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![email, hash, name, input.role, input.location],
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(ref f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            AppError::conflict(format!("A user with email {email} already exists"))
        }
        other => other.into(),
    })?;
    let id = conn.last_insert_rowid();
    info!(user_id = id, role = %input.role, "admin user created");
    find_user(&conn, id)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub role: Option<Role>,
    /// `Some(None)` clears the binding.
    #[serde(default, with = "double_option")]
    pub location: Option<Option<Location>>,
    #[serde(default)]
    pub password: Option<String>,
}

mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Deserialize::deserialize(de).map(Some)
    }
}

pub fn update_user(db: &DbState, id: i64, update: UserUpdate) -> AppResult<AdminUser> {
    let hash = update.password.as_deref().map(hash_password).transpose()?;

    let conn = db.lock()?;
    db::immediate(&conn, |conn| {
        find_user(conn, id)?;
        if let Some(name) = update.name.as_deref().map(str::trim) {
            if name.is_empty() {
                return Err(AppError::bad_request("Name cannot be empty"));
            }
            conn.execute(
                "UPDATE admin_users SET name = ?1 WHERE id = ?2",
                params![name, id],
            )?;
        }
        if let Some(role) = update.role {
            conn.execute(
                "UPDATE admin_users SET role = ?1 WHERE id = ?2",
                params![role, id],
            )?;
        }
        if let Some(location) = update.location {
            conn.execute(
                "UPDATE admin_users SET location = ?1 WHERE id = ?2",
                params![location, id],
            )?;
        }
        if let Some(hash) = &hash {
            conn.execute(
                "UPDATE admin_users SET password_hash = ?1 WHERE id = ?2",
                params![hash, id],
            )?;
        }
        find_user(conn, id)
    })
    .inspect(|user| info!(user_id = user.id, "admin user updated"))
}

pub fn delete_user(db: &DbState, id: i64, acting_user: i64) -> AppResult<()> {
    if id == acting_user {
        return Err(AppError::bad_request("You cannot delete your own account"));
    }
    let conn = db.lock()?;
    let changed = conn
        .execute("DELETE FROM admin_users WHERE id = ?1", params![id])
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(ref f, _)
                if f.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                AppError::conflict("User is referenced by delivery routes")
            }
            other => other.into(),
        })?;
    if changed == 0 {
        return Err(AppError::not_found(format!("User {id} not found")));
    }
    info!(user_id = id, "admin user deleted");
    Ok(())
}

/// Create the first super admin when none exists.
pub fn ensure_bootstrap_admin(db: &DbState, email: &str, password: &str) -> AppResult<bool> {
    let existing: i64 = {
        let conn = db.lock()?;
        conn.query_row(
            "SELECT COUNT(*) FROM admin_users WHERE role = 'super_admin'",
            [],
            |row| row.get(0),
        )?
    };
    if existing > 0 {
        return Ok(false);
    }
    create_user(
        db,
        NewUser {
            email: email.to_string(),
            password: password.to_string(),
            name: "Administrator".to_string(),
            role: Role::SuperAdmin,
            location: None,
        },
    )?;
    info!("bootstrap super admin created");
    Ok(true)
}
