//! Catalogue: categories, products and review ratings.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::{self, DbState};
use crate::error::{AppError, AppResult};

// ---------------------------------------------------------------------------
// Categories
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub sort_order: i64,
    pub created_at: String,
}

impl Category {
    const COLUMNS: &'static str = "id, name, description, sort_order, created_at";

    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            sort_order: row.get(3)?,
            created_at: row.get(4)?,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryInput {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "sort_order")]
    pub sort_order: Option<i64>,
}

fn find_category(conn: &Connection, id: i64) -> AppResult<Category> {
    conn.query_row(
        &format!("SELECT {} FROM categories WHERE id = ?1", Category::COLUMNS),
        params![id],
        Category::from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found(format!("Category {id} not found")))
}

/// Map a UNIQUE violation on the category name to a 409.
fn duplicate_name(e: rusqlite::Error, name: &str) -> AppError {
    match e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            AppError::conflict(format!("Category {name} already exists"))
        }
        other => other.into(),
    }
}

pub fn list_categories(db: &DbState) -> AppResult<Vec<Category>> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM categories ORDER BY sort_order, name",
        Category::COLUMNS
    ))?;
    let rows = stmt
        .query_map([], Category::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn create_category(db: &DbState, input: CategoryInput) -> AppResult<Category> {
    let name = input.name.trim();
    if name.is_empty() {
        return Err(AppError::bad_request("Category name is required"));
    }
    let conn = db.lock()?;
    conn.execute(
        "INSERT INTO categories (name, description, sort_order) VALUES (?1, ?2, ?3)",
        params![name, input.description, input.sort_order.unwrap_or(0)],
    )
    .map_err(|e| duplicate_name(e, name))?;
    let id = conn.last_insert_rowid();
    info!(category_id = id, name, "category created");
    find_category(&conn, id)
}

pub fn update_category(db: &DbState, id: i64, input: CategoryInput) -> AppResult<Category> {
    let name = input.name.trim();
    if name.is_empty() {
        return Err(AppError::bad_request("Category name is required"));
    }
    let conn = db.lock()?;
    let current = find_category(&conn, id)?;
    conn.execute(
        "UPDATE categories SET name = ?1, description = ?2, sort_order = ?3 WHERE id = ?4",
        params![
            name,
            input.description.or(current.description),
            input.sort_order.unwrap_or(current.sort_order),
            id
        ],
    )
    .map_err(|e| duplicate_name(e, name))?;
    find_category(&conn, id)
}

/// Products in the category are left uncategorised.
pub fn delete_category(db: &DbState, id: i64) -> AppResult<()> {
    let conn = db.lock()?;
    let deleted = conn.execute("DELETE FROM categories WHERE id = ?1", params![id])?;
    if deleted == 0 {
        return Err(AppError::not_found(format!("Category {id} not found")));
    }
    info!(category_id = id, "category deleted");
    Ok(())
}

// ---------------------------------------------------------------------------
// Products
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub price: f64,
    pub category_id: Option<i64>,
    pub category_name: Option<String>,
    pub image_url: Option<String>,
    pub inventory_leeds: i64,
    pub inventory_derby: i64,
    pub inventory_sheffield: i64,
    pub is_active: bool,
    pub max_per_order: Option<i64>,
    pub rating_source_id: Option<i64>,
    pub average_rating: Option<f64>,
    pub review_count: i64,
}

/// Reviews are pooled from `rating_source_id` when set.
const PRODUCT_SELECT: &str = "
    SELECT p.id, p.name, p.description, p.price, p.category_id, c.name, p.image_url,
           p.inventory_leeds, p.inventory_derby, p.inventory_sheffield, p.is_active,
           p.max_per_order, p.rating_source_id,
           (SELECT ROUND(AVG(r.rating), 2) FROM product_reviews r
             WHERE r.product_id = COALESCE(p.rating_source_id, p.id)),
           (SELECT COUNT(*) FROM product_reviews r
             WHERE r.product_id = COALESCE(p.rating_source_id, p.id))
    FROM products p
    LEFT JOIN categories c ON c.id = p.category_id";

impl Product {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            price: row.get(3)?,
            category_id: row.get(4)?,
            category_name: row.get(5)?,
            image_url: row.get(6)?,
            inventory_leeds: row.get(7)?,
            inventory_derby: row.get(8)?,
            inventory_sheffield: row.get(9)?,
            is_active: row.get::<_, i64>(10)? != 0,
            max_per_order: row.get(11)?,
            rating_source_id: row.get(12)?,
            average_rating: row.get(13)?,
            review_count: row.get(14)?,
        })
    }
}

fn find_product(conn: &Connection, id: i64) -> AppResult<Product> {
    conn.query_row(
        &format!("{PRODUCT_SELECT} WHERE p.id = ?1"),
        params![id],
        Product::from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found(format!("Product {id} not found")))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductFilter {
    #[serde(default, alias = "category_id")]
    pub category_id: Option<i64>,
    #[serde(default, alias = "include_inactive")]
    pub include_inactive: bool,
}

pub fn list_products(db: &DbState, filter: &ProductFilter) -> AppResult<Vec<Product>> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "{PRODUCT_SELECT}
         WHERE (?1 IS NULL OR p.category_id = ?1) AND (?2 OR p.is_active = 1)
         ORDER BY c.sort_order, p.name"
    ))?;
    let rows = stmt
        .query_map(
            params![filter.category_id, filter.include_inactive],
            Product::from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_product(db: &DbState, id: i64) -> AppResult<Product> {
    let conn = db.lock()?;
    find_product(&conn, id)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProduct {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub price: f64,
    #[serde(default, alias = "category_id")]
    pub category_id: Option<i64>,
    #[serde(default, alias = "image_url")]
    pub image_url: Option<String>,
    #[serde(default, alias = "inventory_leeds")]
    pub inventory_leeds: i64,
    #[serde(default, alias = "inventory_derby")]
    pub inventory_derby: i64,
    #[serde(default, alias = "inventory_sheffield")]
    pub inventory_sheffield: i64,
    #[serde(default, alias = "max_per_order")]
    pub max_per_order: Option<i64>,
    #[serde(default, alias = "rating_source_id")]
    pub rating_source_id: Option<i64>,
}

fn validate_price(price: f64) -> AppResult<()> {
    if !price.is_finite() || price < 0.0 {
        return Err(AppError::bad_request("Price must be a non-negative number"));
    }
    Ok(())
}

fn validate_limit(max_per_order: Option<i64>) -> AppResult<()> {
    if max_per_order.is_some_and(|m| m < 1) {
        return Err(AppError::bad_request("maxPerOrder must be at least 1"));
    }
    Ok(())
}

pub fn create_product(db: &DbState, input: NewProduct) -> AppResult<Product> {
    if input.name.trim().is_empty() {
        return Err(AppError::bad_request("Product name is required"));
    }
    validate_price(input.price)?;
    validate_limit(input.max_per_order)?;
    if [
        input.inventory_leeds,
        input.inventory_derby,
        input.inventory_sheffield,
    ]
    .iter()
    .any(|&n| n < 0)
    {
        return Err(AppError::bad_request("Inventory cannot be negative"));
    }

    let conn = db.lock()?;
    if let Some(category_id) = input.category_id {
        find_category(&conn, category_id)?;
    }
    conn.execute(
        "INSERT INTO products (name, description, price, category_id, image_url,
                               inventory_leeds, inventory_derby, inventory_sheffield,
                               max_per_order, rating_source_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            input.name.trim(),
            input.description,
            input.price,
            input.category_id,
            input.image_url,
            input.inventory_leeds,
            input.inventory_derby,
            input.inventory_sheffield,
            input.max_per_order,
            input.rating_source_id,
        ],
    )?;
    let id = conn.last_insert_rowid();
    info!(product_id = id, name = %input.name.trim(), "product created");
    find_product(&conn, id)
}

/// Partial product edit. Inventory is edited separately.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: Option<f64>,
    #[serde(alias = "category_id")]
    pub category_id: Option<i64>,
    #[serde(alias = "image_url")]
    pub image_url: Option<String>,
    #[serde(alias = "is_active")]
    pub is_active: Option<bool>,
    #[serde(alias = "max_per_order")]
    pub max_per_order: Option<i64>,
    #[serde(alias = "rating_source_id")]
    pub rating_source_id: Option<i64>,
}

pub fn update_product(db: &DbState, id: i64, update: ProductUpdate) -> AppResult<Product> {
    if let Some(price) = update.price {
        validate_price(price)?;
    }
    validate_limit(update.max_per_order)?;
    if update.rating_source_id == Some(id) {
        return Err(AppError::bad_request("A product cannot take ratings from itself"));
    }

    let conn = db.lock()?;
    db::immediate(&conn, |conn| {
        let current = find_product(conn, id)?;
        if let Some(category_id) = update.category_id {
            find_category(conn, category_id)?;
        }
        let name = update
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(&current.name);
        conn.execute(
            "UPDATE products SET name = ?1, description = ?2, price = ?3, category_id = ?4,
                    image_url = ?5, is_active = ?6, max_per_order = ?7, rating_source_id = ?8,
                    updated_at = datetime('now')
             WHERE id = ?9",
            params![
                name,
                update.description.clone().or(current.description.clone()),
                update.price.unwrap_or(current.price),
                update.category_id.or(current.category_id),
                update.image_url.clone().or(current.image_url.clone()),
                update.is_active.unwrap_or(current.is_active),
                update.max_per_order.or(current.max_per_order),
                update.rating_source_id.or(current.rating_source_id),
                id,
            ],
        )?;
        find_product(conn, id)
    })
    .inspect(|p| info!(product_id = p.id, "product updated"))
}

/// Remove a product, or deactivate it when past orders reference it.
/// Returns true when the row was deleted.
pub fn delete_product(db: &DbState, id: i64) -> AppResult<bool> {
    let conn = db.lock()?;
    find_product(&conn, id)?;
    let referenced: i64 = conn.query_row(
        "SELECT COUNT(*) FROM order_items WHERE product_id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    if referenced > 0 {
        conn.execute(
            "UPDATE products SET is_active = 0, updated_at = datetime('now') WHERE id = ?1",
            params![id],
        )?;
        info!(product_id = id, order_lines = referenced, "product deactivated");
        return Ok(false);
    }
    conn.execute("DELETE FROM products WHERE id = ?1", params![id])?;
    info!(product_id = id, "product deleted");
    Ok(true)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductRating {
    pub product_id: i64,
    pub average_rating: Option<f64>,
    pub review_count: i64,
}

pub fn product_rating(db: &DbState, id: i64) -> AppResult<ProductRating> {
    let product = get_product(db, id)?;
    Ok(ProductRating {
        product_id: product.id,
        average_rating: product.average_rating,
        review_count: product.review_count,
    })
}
