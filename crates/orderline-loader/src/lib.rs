use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use orderline_core::{
    created_from_epoch, product_quantities, Diagnostic, Order, OrderProductRow, ParsedOrder,
    Product, User,
};
use orderline_store_sqlite::SqliteStore;

/// Outcome of one load run. Diagnostics are non-fatal problems in the order
/// they were found; `fatal` is set when a malformed JSON line stopped the run
/// early, in which case `lines_processed` counts only the lines before it.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub lines_processed: usize,
    pub users_upserted: usize,
    pub products_upserted: usize,
    pub orders_upserted: usize,
    pub associations_inserted: usize,
    pub diagnostics: Vec<Diagnostic>,
    pub fatal: Option<String>,
}

/// Load an NDJSON order file into the store, one record per line.
///
/// # Errors
/// Returns an error when the file cannot be opened or read. Malformed JSON
/// and per-record store failures are reported through the [`LoadReport`]
/// instead.
pub fn load_from_path(store: &mut SqliteStore, path: &Path) -> Result<LoadReport> {
    let file = File::open(path)
        .with_context(|| format!("failed to open data file {}", path.display()))?;
    load_from_reader(store, BufReader::new(file))
}

/// Stream NDJSON order records from any buffered reader into the store.
///
/// Each record runs through parse, field validation, user/order/product
/// upserts, and association insertion. Validation failures and store errors
/// are collected as diagnostics and the record is still processed with its
/// partial data; only a line that fails to decode as JSON stops the run.
///
/// # Errors
/// Returns an error when the reader itself fails.
pub fn load_from_reader<R: BufRead>(store: &mut SqliteStore, reader: R) -> Result<LoadReport> {
    let mut report = LoadReport::default();

    for (index, line) in reader.lines().enumerate() {
        let line_no = index + 1;
        let raw = line.with_context(|| format!("failed to read line {line_no}"))?;

        let parsed = match ParsedOrder::from_line(line_no, &raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                // Fatal for the whole run: lines after this one are never
                // processed and the final count excludes this line.
                report.fatal = Some(err.to_string());
                break;
            }
        };

        process_record(store, &parsed, line_no, &mut report);
        report.lines_processed += 1;
    }

    Ok(report)
}

fn process_record(
    store: &mut SqliteStore,
    parsed: &ParsedOrder,
    line: usize,
    report: &mut LoadReport,
) {
    report.diagnostics.extend(parsed.diagnostics.iter().cloned());

    let user_id = parsed.user.as_ref().and_then(|user| user.id);
    if let (Some(id), Some(user)) = (user_id, parsed.user.as_ref()) {
        let row = User { id, name: user.name.clone(), city: user.city.clone() };
        match store.upsert_user(&row) {
            Ok(()) => report.users_upserted += 1,
            Err(err) => report.diagnostics.push(store_failure(line, "user upsert", &err)),
        }
    }

    let created = parsed.created_epoch.and_then(|seconds| match created_from_epoch(seconds) {
        Ok(created) => Some(created),
        Err(_) => {
            report.diagnostics.push(Diagnostic::InvalidTimestamp {
                line,
                order_id: parsed.id,
                seconds,
            });
            None
        }
    });

    // The order commits independently of the association rows below; a
    // failure past this point leaves an order with no associations.
    if let (Some(order_id), Some(created)) = (parsed.id, created) {
        let row = Order { id: order_id, user_id, created };
        match store.upsert_order(&row) {
            Ok(()) => report.orders_upserted += 1,
            Err(err) => report.diagnostics.push(store_failure(line, "order upsert", &err)),
        }
    }

    let Some(products) = parsed.products.as_ref() else { return };

    for item in products {
        let Some(product_id) = item.id else { continue };
        let row = Product { id: product_id, name: item.name.clone(), price: item.price };
        match store.upsert_product(&row) {
            Ok(()) => report.products_upserted += 1,
            Err(err) => report.diagnostics.push(store_failure(line, "product upsert", &err)),
        }
    }

    let Some(order_id) = parsed.id else { return };
    let rows: Vec<OrderProductRow> = product_quantities(products)
        .into_iter()
        .map(|(product_id, quantity)| OrderProductRow { order_id, product_id, quantity })
        .collect();
    if rows.is_empty() {
        return;
    }

    match store.insert_associations_if_absent(&rows) {
        Ok(inserted) => report.associations_inserted += inserted,
        Err(err) => report.diagnostics.push(store_failure(line, "association insert", &err)),
    }
}

fn store_failure(line: usize, operation: &str, err: &anyhow::Error) -> Diagnostic {
    Diagnostic::StoreFailure { line, operation: operation.to_owned(), detail: format!("{err:#}") }
}
