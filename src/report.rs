//! Sales report over synced sale events
//!
//! Plain aggregation: daily revenue in the shop's timezone, 7-day simple and
//! exponential moving averages, and the best selling listings.

use crate::error::{Result, SyncError};
use crate::models::{LocalRecord, RecordKind};
use crate::store;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Window of the moving averages, in days
pub const AVERAGE_WINDOW: usize = 7;

/// Longest report period accepted, roughly ten years
pub const MAX_REPORT_DAYS: usize = 3660;

/// Relative change between first and last average that still counts as flat
const FLAT_BAND: f64 = 0.05;

/// A sale event reduced to what the report needs
#[derive(Debug, Clone, PartialEq)]
pub struct Sale {
    pub listing_id: Option<String>,
    pub amount: f64,
    pub quantity: u64,
    pub sold_at: DateTime<Utc>,
}

impl Sale {
    /// Read a sale from a stored record; `None` if it carries no usable amount
    pub fn from_record(record: &LocalRecord) -> Option<Self> {
        let payload = &record.payload;
        let amount = payload.get("amount").and_then(number)?;
        let quantity = payload
            .get("quantity")
            .and_then(number)
            .map(|q| q.max(0.0) as u64)
            .unwrap_or(1);
        let listing_id = payload.get("listing_id").and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
        let sold_at = payload
            .get("created_at")
            .and_then(Value::as_str)
            .and_then(crate::models::parse_timestamp)
            .unwrap_or(record.updated_at);

        Some(Self {
            listing_id,
            amount,
            quantity,
            sold_at,
        })
    }
}

/// Accept JSON numbers and numeric strings ("12.50")
fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Revenue for one calendar day
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyPoint {
    pub date: NaiveDate,
    pub revenue: f64,
    pub units: u64,
}

/// Revenue per listing over the report window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListingTotal {
    pub listing_id: String,
    pub revenue: f64,
    pub units: u64,
}

/// Direction of the moving average across the window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Rising,
    Falling,
    Flat,
    /// Fewer days than the averaging window
    Insufficient,
}

#[derive(Debug, Clone, Serialize)]
pub struct SalesReport {
    pub timezone: String,
    pub days: usize,
    pub sale_count: usize,
    /// Stored sale events without an amount
    pub skipped: usize,
    pub total_revenue: f64,
    pub total_units: u64,
    pub daily: Vec<DailyPoint>,
    pub sma: Vec<Option<f64>>,
    pub ema: Vec<Option<f64>>,
    pub top_listings: Vec<ListingTotal>,
    pub trend: Trend,
}

/// Simple moving average; `None` until a full window is available
pub fn simple_moving_average(values: &[f64], window: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if window == 0 || window > values.len() {
        return out;
    }
    let mut sum: f64 = values[..window].iter().sum();
    out[window - 1] = Some(sum / window as f64);
    for i in window..values.len() {
        sum += values[i] - values[i - window];
        out[i] = Some(sum / window as f64);
    }
    out
}

/// Exponential moving average seeded with the first full-window SMA
pub fn exponential_moving_average(values: &[f64], window: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if window == 0 || window > values.len() {
        return out;
    }
    let alpha = 2.0 / (window as f64 + 1.0);
    let mut current = values[..window].iter().sum::<f64>() / window as f64;
    out[window - 1] = Some(current);
    for (slot, value) in out.iter_mut().zip(values).skip(window) {
        current += alpha * (value - current);
        *slot = Some(current);
    }
    out
}

fn trend_of(sma: &[Option<f64>]) -> Trend {
    let mut defined = sma.iter().flatten();
    let (Some(first), Some(last)) = (defined.next(), sma.iter().flatten().last()) else {
        return Trend::Insufficient;
    };
    if *first == 0.0 {
        return if *last > 0.0 { Trend::Rising } else { Trend::Flat };
    }
    let change = (last - first) / first;
    if change > FLAT_BAND {
        Trend::Rising
    } else if change < -FLAT_BAND {
        Trend::Falling
    } else {
        Trend::Flat
    }
}

/// Build the report for the `days` days ending on `today` (inclusive) in `tz`.
///
/// `days` is clamped to `1..=MAX_REPORT_DAYS`.
pub fn build_report(records: &[LocalRecord], days: usize, tz: Tz, today: NaiveDate) -> SalesReport {
    let days = days.clamp(1, MAX_REPORT_DAYS);
    let first_day = today - Duration::days(days as i64 - 1);

    let mut daily: Vec<DailyPoint> = (0..days)
        .map(|offset| DailyPoint {
            date: first_day + Duration::days(offset as i64),
            revenue: 0.0,
            units: 0,
        })
        .collect();
    let mut by_listing: HashMap<String, ListingTotal> = HashMap::new();
    let mut sale_count = 0;
    let mut skipped = 0;

    for record in records.iter().filter(|r| r.kind == RecordKind::SaleEvent) {
        let Some(sale) = Sale::from_record(record) else {
            skipped += 1;
            continue;
        };
        let date = sale.sold_at.with_timezone(&tz).date_naive();
        if date < first_day || date > today {
            continue;
        }

        let point = &mut daily[(date - first_day).num_days() as usize];
        point.revenue += sale.amount;
        point.units += sale.quantity;
        sale_count += 1;

        if let Some(listing_id) = sale.listing_id {
            let entry = by_listing
                .entry(listing_id.clone())
                .or_insert_with(|| ListingTotal {
                    listing_id,
                    revenue: 0.0,
                    units: 0,
                });
            entry.revenue += sale.amount;
            entry.units += sale.quantity;
        }
    }

    let revenue: Vec<f64> = daily.iter().map(|p| p.revenue).collect();
    let sma = simple_moving_average(&revenue, AVERAGE_WINDOW);
    let ema = exponential_moving_average(&revenue, AVERAGE_WINDOW);

    let mut top_listings: Vec<ListingTotal> = by_listing.into_values().collect();
    top_listings.sort_by(|a, b| {
        b.revenue
            .total_cmp(&a.revenue)
            .then_with(|| a.listing_id.cmp(&b.listing_id))
    });
    top_listings.truncate(10);

    SalesReport {
        timezone: tz.name().to_string(),
        days,
        sale_count,
        skipped,
        total_revenue: revenue.iter().sum(),
        total_units: daily.iter().map(|p| p.units).sum(),
        trend: trend_of(&sma),
        daily,
        sma,
        ema,
        top_listings,
    }
}

/// Report over the sale events currently in the store
pub fn load_report(conn: &Connection, days: usize, tz: Tz) -> Result<SalesReport> {
    if days == 0 || days > MAX_REPORT_DAYS {
        return Err(SyncError::Config(format!(
            "report period must be between 1 and {} days, got {}",
            MAX_REPORT_DAYS, days
        )));
    }
    let records = store::list_records(conn, RecordKind::SaleEvent)?;
    let today = Utc::now().with_timezone(&tz).date_naive();
    Ok(build_report(&records, days, tz, today))
}

impl fmt::Display for SalesReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Sales over the last {} day(s) ({}): {} sale(s), {} unit(s), revenue {:.2}",
            self.days, self.timezone, self.sale_count, self.total_units, self.total_revenue
        )?;
        if self.skipped > 0 {
            writeln!(f, "  ({} sale event(s) without amount skipped)", self.skipped)?;
        }
        writeln!(f, "Trend ({}-day average): {:?}", AVERAGE_WINDOW, self.trend)?;
        writeln!(f)?;
        writeln!(f, "{:<12} {:>10} {:>6} {:>10} {:>10}", "date", "revenue", "units", "sma", "ema")?;
        for ((point, sma), ema) in self.daily.iter().zip(&self.sma).zip(&self.ema) {
            writeln!(
                f,
                "{:<12} {:>10.2} {:>6} {:>10} {:>10}",
                point.date.to_string(),
                point.revenue,
                point.units,
                sma.map(|v| format!("{:.2}", v)).unwrap_or_else(|| "-".to_string()),
                ema.map(|v| format!("{:.2}", v)).unwrap_or_else(|| "-".to_string()),
            )?;
        }
        if !self.top_listings.is_empty() {
            writeln!(f)?;
            writeln!(f, "Top listings:")?;
            for listing in &self.top_listings {
                writeln!(
                    f,
                    "  {:<20} {:>10.2} {:>6}",
                    listing.listing_id, listing.revenue, listing.units
                )?;
            }
        }
        Ok(())
    }
}
