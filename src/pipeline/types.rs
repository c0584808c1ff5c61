//! Core data types for the tiering pipeline
//!
//! A `Transaction` is immutable once parsed. Aggregates are keyed by
//! calendar day (`DayKey`) and transaction type, with an open-ended
//! payment method key space.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Calendar date derived from a transaction timestamp
pub type DayKey = NaiveDate;

/// `method -> cumulative amount`
pub type MethodTotals = BTreeMap<String, f64>;

/// `type -> method -> amount` for one day
pub type DayTotals = BTreeMap<TransactionType, MethodTotals>;

/// `day -> type -> method -> amount`, as returned by range queries
pub type RangeResult = BTreeMap<DayKey, DayTotals>;

/// Amounts whose magnitude falls below this are treated as zero
pub const AMOUNT_EPSILON: f64 = 1e-9;

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "deposit",
            TransactionType::Withdrawal => "withdrawal",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deposit" | "deposits" => Ok(TransactionType::Deposit),
            "withdrawal" | "withdrawals" => Ok(TransactionType::Withdrawal),
            other => Err(format!("unknown transaction type '{}'", other)),
        }
    }
}

/// A single financial transaction event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub timestamp: NaiveDateTime,
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    pub method: String,
    pub amount: f64,
}

impl Transaction {
    /// Build a transaction from raw text fields
    ///
    /// Amounts are rounded to cents; non-finite amounts and empty methods
    /// are rejected.
    pub fn from_raw(timestamp: &str, tx_type: &str, method: &str, amount: &str) -> Result<Self, String> {
        let timestamp = parse_timestamp(timestamp)?;
        let tx_type = tx_type.parse::<TransactionType>()?;

        let method = method.trim();
        if method.is_empty() {
            return Err("empty payment method".to_string());
        }

        let amount: f64 = amount
            .trim()
            .parse()
            .map_err(|_| format!("invalid amount '{}'", amount.trim()))?;
        if !amount.is_finite() {
            return Err(format!("non-finite amount '{}'", amount));
        }

        Ok(Self {
            timestamp,
            tx_type,
            method: method.to_string(),
            amount: round_cents(amount),
        })
    }

    pub fn day_key(&self) -> DayKey {
        self.timestamp.date()
    }
}

/// A transaction together with its event log position
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub position: i64,
    pub transaction: Transaction,
}

pub fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, String> {
    let raw = raw.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .ok_or_else(|| format!("invalid timestamp '{}'", raw))
}

pub fn parse_day(raw: &str) -> Result<DayKey, String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| format!("invalid date '{}'", raw.trim()))
}

pub fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

/// Add `other` into `into`, method by method
pub fn merge_day_totals(into: &mut DayTotals, other: &DayTotals) {
    for (tx_type, methods) in other {
        let target = into.entry(*tx_type).or_default();
        for (method, amount) in methods {
            *target.entry(method.clone()).or_insert(0.0) += amount;
        }
    }
}

pub fn is_empty_totals(totals: &DayTotals) -> bool {
    totals.values().all(|methods| methods.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_raw_parses_and_rounds() {
        let tx = Transaction::from_raw("2026-01-05T13:45:10", "Deposit", " paypal ", "100.456").unwrap();
        assert_eq!(tx.tx_type, TransactionType::Deposit);
        assert_eq!(tx.method, "paypal");
        assert_eq!(tx.amount, 100.46);
        assert_eq!(tx.day_key(), NaiveDate::from_ymd_opt(2026, 1, 5).unwrap());
    }

    #[test]
    fn test_from_raw_rejects_garbage() {
        assert!(Transaction::from_raw("yesterday", "deposit", "visa", "1").is_err());
        assert!(Transaction::from_raw("2026-01-05T00:00:00", "refund", "visa", "1").is_err());
        assert!(Transaction::from_raw("2026-01-05T00:00:00", "deposit", "", "1").is_err());
        assert!(Transaction::from_raw("2026-01-05T00:00:00", "deposit", "visa", "abc").is_err());
        assert!(Transaction::from_raw("2026-01-05T00:00:00", "deposit", "visa", "NaN").is_err());
    }

    #[test]
    fn test_timestamp_formats() {
        assert!(parse_timestamp("2026-01-05 08:00:00").is_ok());
        assert!(parse_timestamp("2026-01-05T08:00:00.250").is_ok());
    }

    #[test]
    fn test_serde_uses_lowercase_type() {
        let tx = Transaction::from_raw("2026-01-05T08:00:00", "withdrawal", "wire", "5").unwrap();
        let json = serde_json::to_string(&tx).unwrap();
        assert!(json.contains("\"type\":\"withdrawal\""));
        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tx);
    }

    #[test]
    fn test_merge_day_totals() {
        let mut a = DayTotals::new();
        a.entry(TransactionType::Deposit).or_default().insert("visa".into(), 10.0);
        let mut b = DayTotals::new();
        b.entry(TransactionType::Deposit).or_default().insert("visa".into(), 5.0);
        b.entry(TransactionType::Withdrawal).or_default().insert("wire".into(), 2.0);

        merge_day_totals(&mut a, &b);

        assert_eq!(a[&TransactionType::Deposit]["visa"], 15.0);
        assert_eq!(a[&TransactionType::Withdrawal]["wire"], 2.0);
    }
}
