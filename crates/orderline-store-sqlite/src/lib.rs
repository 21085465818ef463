use std::collections::BTreeSet;

use anyhow::{anyhow, Context, Result};
use orderline_core::{Order, OrderProductRow, Product, User};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS users (
  id INTEGER PRIMARY KEY,
  name TEXT,
  city TEXT
);

CREATE TABLE IF NOT EXISTS products (
  id INTEGER PRIMARY KEY,
  name TEXT,
  price REAL
);

CREATE TABLE IF NOT EXISTS orders (
  id INTEGER PRIMARY KEY,
  user_id INTEGER REFERENCES users(id),
  created TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS order_product (
  order_id INTEGER NOT NULL REFERENCES orders(id),
  product_id INTEGER NOT NULL REFERENCES products(id),
  quantity INTEGER NOT NULL CHECK (quantity >= 1),
  PRIMARY KEY (order_id, product_id)
);

CREATE INDEX IF NOT EXISTS idx_orders_created ON orders(created);
CREATE INDEX IF NOT EXISTS idx_orders_user ON orders(user_id);
";

/// SQLite-backed store for users, products, orders, and their association
/// rows. One connection, one transaction per operation; `created` timestamps
/// are persisted as RFC3339 UTC text, which sorts lexicographically.
pub struct SqliteStore {
    conn: Connection,
}

/// One row of the time-range report. `product_ids` repeats each product id
/// `quantity` times.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderSummary {
    pub id: i64,
    pub user_id: Option<i64>,
    pub product_ids: Vec<i64>,
    pub created: OffsetDateTime,
}

/// One row of the top-users report.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TopUser {
    pub user_id: i64,
    pub user_name: Option<String>,
    pub user_city: Option<String>,
    pub purchase_count: i64,
}

impl SqliteStore {
    /// Open the database named by a filesystem path or `sqlite://` URL and
    /// configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot
    /// be applied.
    pub fn open(database_url: &str) -> Result<Self> {
        let path = database_url.strip_prefix("sqlite://").unwrap_or(database_url);
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {path}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Create the schema if it does not exist yet, recording the applied
    /// version in `schema_migrations`.
    ///
    /// # Errors
    /// Returns an error when DDL fails or the recorded version is not the one
    /// this build supports.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        if current_schema_version(&self.conn)? == 0 {
            let tx = self.conn.transaction().context("failed to start migration transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to create schema")?;
            tx.execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![1_i64, now_rfc3339()?],
            )
            .context("failed to record migration version 1")?;
            tx.commit().context("failed to commit migration")?;
        }

        let version = current_schema_version(&self.conn)?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Report the recorded schema version, 0 when the schema has never been
    /// created.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read.
    pub fn schema_version(&self) -> Result<i64> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        current_schema_version(&self.conn)
    }

    /// Insert the user or overwrite an existing row's name and city
    /// (last-write-wins).
    ///
    /// # Errors
    /// Returns an error when the write fails; the transaction is rolled back
    /// and prior state is unchanged.
    pub fn upsert_user(&mut self, user: &User) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO users(id, name, city) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, city = excluded.city",
            params![user.id, user.name, user.city],
        )
        .context("failed to upsert user")?;
        tx.commit().context("failed to commit user upsert")?;
        Ok(())
    }

    /// Insert the product or overwrite an existing row's name and price
    /// (last-write-wins).
    ///
    /// # Errors
    /// Returns an error when the write fails; the transaction is rolled back
    /// and prior state is unchanged.
    pub fn upsert_product(&mut self, product: &Product) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO products(id, name, price) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, price = excluded.price",
            params![product.id, product.name, product.price],
        )
        .context("failed to upsert product")?;
        tx.commit().context("failed to commit product upsert")?;
        Ok(())
    }

    /// Insert the order or overwrite an existing row's user and created
    /// timestamp (a reappearing order id is treated as an update).
    ///
    /// # Errors
    /// Returns an error when the write fails; the transaction is rolled back
    /// and prior state is unchanged.
    pub fn upsert_order(&mut self, order: &Order) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO orders(id, user_id, created) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET user_id = excluded.user_id, created = excluded.created",
            params![order.id, order.user_id, rfc3339(order.created)?],
        )
        .context("failed to upsert order")?;
        tx.commit().context("failed to commit order upsert")?;
        Ok(())
    }

    /// Insert association rows whose `(order_id, product_id)` key is not
    /// already present; existing rows are left untouched, their quantity is
    /// never updated. The input is first deduplicated by key, keeping the
    /// first occurrence, so an order listing the same product non-contiguously
    /// cannot present duplicate keys to the insert. Returns the number of
    /// rows inserted.
    ///
    /// # Errors
    /// Returns an error when any statement fails; the whole batch rolls back.
    pub fn insert_associations_if_absent(&mut self, rows: &[OrderProductRow]) -> Result<usize> {
        let mut seen = BTreeSet::new();
        let deduplicated: Vec<&OrderProductRow> =
            rows.iter().filter(|row| seen.insert((row.order_id, row.product_id))).collect();

        let tx = self.conn.transaction().context("failed to start transaction")?;
        let mut inserted = 0;
        {
            let mut exists = tx
                .prepare("SELECT 1 FROM order_product WHERE order_id = ?1 AND product_id = ?2")
                .context("failed to prepare association lookup")?;
            let mut insert = tx
                .prepare(
                    "INSERT INTO order_product(order_id, product_id, quantity)
                     VALUES (?1, ?2, ?3)",
                )
                .context("failed to prepare association insert")?;

            for row in deduplicated {
                let present = exists
                    .query_row(params![row.order_id, row.product_id], |_| Ok(()))
                    .optional()
                    .context("failed to check association row")?
                    .is_some();
                if present {
                    continue;
                }
                insert
                    .execute(params![row.order_id, row.product_id, row.quantity])
                    .context("failed to insert association row")?;
                inserted += 1;
            }
        }
        tx.commit().context("failed to commit association insert")?;
        Ok(inserted)
    }

    /// Return orders with `created` inclusively between `start` and `end`,
    /// ascending by `created`, each with its product ids expanded by
    /// quantity.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn orders_in_range(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<OrderSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, created FROM orders
             WHERE created >= ?1 AND created <= ?2
             ORDER BY created ASC",
        )?;
        let rows = stmt.query_map(params![rfc3339(start)?, rfc3339(end)?], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<i64>>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (id, user_id, created_raw) = row?;
            result.push(OrderSummary {
                id,
                user_id,
                product_ids: self.product_ids_for_order(id)?,
                created: parse_rfc3339(&created_raw)?,
            });
        }
        Ok(result)
    }

    /// Return up to `limit` users ranked descending by summed association
    /// quantity across all their orders; ties break on ascending user id.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn top_users_by_purchase_count(&self, limit: u32) -> Result<Vec<TopUser>> {
        let mut stmt = self.conn.prepare(
            "SELECT users.id, users.name, users.city, SUM(order_product.quantity) AS purchase_count
             FROM users
             JOIN orders ON orders.user_id = users.id
             JOIN order_product ON order_product.order_id = orders.id
             GROUP BY users.id
             ORDER BY purchase_count DESC, users.id ASC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![i64::from(limit)], |row| {
            Ok(TopUser {
                user_id: row.get(0)?,
                user_name: row.get(1)?,
                user_city: row.get(2)?,
                purchase_count: row.get(3)?,
            })
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    fn product_ids_for_order(&self, order_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT product_id, quantity FROM order_product
             WHERE order_id = ?1
             ORDER BY product_id ASC",
        )?;
        let rows = stmt
            .query_map(params![order_id], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;

        let mut product_ids = Vec::new();
        for row in rows {
            let (product_id, quantity) = row?;
            for _ in 0..quantity {
                product_ids.push(product_id);
            }
        }
        Ok(product_ids)
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
