//! Cached product and category catalog.
//!
//! The catalog is reference data owned by the admin dashboard. A successful
//! sync replaces the local copy wholesale inside one transaction and stamps
//! `sync_meta`; a failed sync leaves the previous cache untouched. Re-running
//! with unchanged remote data is a no-op apart from the timestamps, so the
//! orchestrator can call it on every cycle.

use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::RemoteBackend;
use crate::db::Store;
use crate::error::SyncResult;

/// Sync-meta keys stamped by a successful catalog sync.
pub const META_PRODUCTS_LAST_SYNC: &str = "products_last_sync";
pub const META_CATEGORIES_LAST_SYNC: &str = "categories_last_sync";
pub const META_CATALOG_LAST_SYNC: &str = "catalog_last_sync";

/// A product as cached from the admin dashboard.
///
/// Written only by [`sync_catalog`]; the sale flow and UI read it for offline
/// lookup and pricing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedProduct {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub barcode: Option<String>,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub vat_rate: f64,
    #[serde(default)]
    pub quantity: f64,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedCategory {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub sort_order: i64,
}

/// Counts from a completed catalog sync.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogSyncOutcome {
    pub products: usize,
    pub categories: usize,
    pub completed_at: String,
}

/// Fetch the full catalog and replace the local cache.
///
/// Both fetches must succeed before anything is written; the replace and the
/// `sync_meta` stamps then commit as a single transaction, so readers never
/// observe a half-replaced catalog.
pub async fn sync_catalog(
    store: &Store,
    remote: &dyn RemoteBackend,
) -> SyncResult<CatalogSyncOutcome> {
    let products = remote.fetch_products().await?;
    let categories = remote.fetch_categories().await?;
    let now = chrono::Utc::now().to_rfc3339();

    {
        let mut conn = store.conn()?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM products", [])?;
        tx.execute("DELETE FROM categories", [])?;

        {
            let mut insert_product = tx.prepare(
                "INSERT INTO products
                     (id, name, barcode, category_id, price, vat_rate, quantity, image_url, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for p in &products {
                insert_product.execute(params![
                    p.id,
                    p.name,
                    p.barcode,
                    p.category_id,
                    p.price,
                    p.vat_rate,
                    p.quantity,
                    p.image_url,
                    p.updated_at,
                ])?;
            }

            let mut insert_category = tx.prepare(
                "INSERT INTO categories (id, name, sort_order) VALUES (?1, ?2, ?3)",
            )?;
            for c in &categories {
                insert_category.execute(params![c.id, c.name, c.sort_order])?;
            }

            let mut stamp = tx.prepare(
                "INSERT INTO sync_meta (key, value, updated_at) VALUES (?1, ?2, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            )?;
            for key in [
                META_PRODUCTS_LAST_SYNC,
                META_CATEGORIES_LAST_SYNC,
                META_CATALOG_LAST_SYNC,
            ] {
                stamp.execute(params![key, now])?;
            }
        }

        tx.commit()?;
    }

    info!(
        products = products.len(),
        categories = categories.len(),
        "catalog cache replaced"
    );

    Ok(CatalogSyncOutcome {
        products: products.len(),
        categories: categories.len(),
        completed_at: now,
    })
}

// ---------------------------------------------------------------------------
// Read APIs (UI and sale-flow lookups; serve stale data while offline)
// ---------------------------------------------------------------------------

pub fn get_products(store: &Store) -> SyncResult<Vec<CachedProduct>> {
    let conn = store.conn()?;
    let mut stmt = conn.prepare(
        "SELECT id, name, barcode, category_id, price, vat_rate, quantity, image_url, updated_at
         FROM products ORDER BY name COLLATE NOCASE",
    )?;
    let rows = stmt
        .query_map([], product_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_product(store: &Store, id: &str) -> SyncResult<Option<CachedProduct>> {
    use rusqlite::OptionalExtension;
    let conn = store.conn()?;
    let product = conn
        .query_row(
            "SELECT id, name, barcode, category_id, price, vat_rate, quantity, image_url, updated_at
             FROM products WHERE id = ?1",
            [id],
            product_from_row,
        )
        .optional()?;
    Ok(product)
}

pub fn find_product_by_barcode(store: &Store, barcode: &str) -> SyncResult<Option<CachedProduct>> {
    use rusqlite::OptionalExtension;
    let conn = store.conn()?;
    let product = conn
        .query_row(
            "SELECT id, name, barcode, category_id, price, vat_rate, quantity, image_url, updated_at
             FROM products WHERE barcode = ?1 LIMIT 1",
            [barcode],
            product_from_row,
        )
        .optional()?;
    Ok(product)
}

pub fn get_categories(store: &Store) -> SyncResult<Vec<CachedCategory>> {
    let conn = store.conn()?;
    let mut stmt = conn.prepare(
        "SELECT id, name, sort_order FROM categories ORDER BY sort_order, name COLLATE NOCASE",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(CachedCategory {
                id: row.get(0)?,
                name: row.get(1)?,
                sort_order: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Timestamp of the last successful catalog sync, if any.
pub fn last_catalog_sync(store: &Store) -> SyncResult<Option<String>> {
    store.sync_meta_get(META_CATALOG_LAST_SYNC)
}

fn product_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CachedProduct> {
    Ok(CachedProduct {
        id: row.get(0)?,
        name: row.get(1)?,
        barcode: row.get(2)?,
        category_id: row.get(3)?,
        price: row.get(4)?,
        vat_rate: row.get(5)?,
        quantity: row.get(6)?,
        image_url: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

// ===========================================================================
// Tests
// ===========================================================================
