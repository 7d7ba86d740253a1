//! Usage reports for a single credential, folded from its ledger entries.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::ledger::LedgerEntry;

pub const SECONDS_PER_DAY: u64 = 86_400;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageStatistics {
    pub total_requests: u64,
    pub total_tokens: u64,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub total_cost: f64,
    pub avg_response_time_ms: f64,
    pub error_count: u64,
    /// Percentage of entries flagged as errors.
    pub error_rate: f64,
    pub model_usage: Vec<ModelUsage>,
    pub error_breakdown: Vec<ErrorCount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelUsage {
    pub model: String,
    pub request_count: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorCount {
    pub error_code: String,
    pub count: u64,
}

impl UsageStatistics {
    pub fn from_entries(entries: &[LedgerEntry]) -> Self {
        let mut stats = UsageStatistics::default();
        let mut latency_sum = 0u128;
        let mut models: BTreeMap<&str, (u64, u64)> = BTreeMap::new();
        let mut errors: BTreeMap<&str, u64> = BTreeMap::new();

        for entry in entries {
            stats.total_requests += 1;
            stats.total_tokens = stats.total_tokens.saturating_add(entry.total_tokens);
            stats.total_prompt_tokens = stats.total_prompt_tokens.saturating_add(entry.prompt_tokens);
            stats.total_completion_tokens = stats
                .total_completion_tokens
                .saturating_add(entry.completion_tokens);
            stats.total_cost += entry.total_cost;
            latency_sum += u128::from(entry.latency_ms);

            if let Some(model) = entry.model.as_deref() {
                let slot = models.entry(model).or_default();
                slot.0 += 1;
                slot.1 = slot.1.saturating_add(entry.total_tokens);
            }
            if entry.is_error {
                stats.error_count += 1;
                if let Some(code) = entry.error_code.as_deref() {
                    *errors.entry(code).or_default() += 1;
                }
            }
        }

        if stats.total_requests > 0 {
            let n = stats.total_requests as f64;
            stats.avg_response_time_ms = latency_sum as f64 / n;
            stats.error_rate = stats.error_count as f64 / n * 100.0;
        }
        stats.model_usage = models
            .into_iter()
            .map(|(model, (request_count, total_tokens))| ModelUsage {
                model: model.to_string(),
                request_count,
                total_tokens,
            })
            .collect();
        stats.error_breakdown = errors
            .into_iter()
            .map(|(code, count)| ErrorCount {
                error_code: code.to_string(),
                count,
            })
            .collect();
        stats
    }
}

/// Totals for one UTC calendar day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyUsage {
    /// `YYYY-MM-DD`
    pub date: String,
    pub requests: u64,
    pub tokens: u64,
    pub cost: f64,
    pub errors: u64,
}

/// Group entries by UTC day, most recent day first.
pub fn daily_usage(entries: &[LedgerEntry]) -> Vec<DailyUsage> {
    let mut days: BTreeMap<NaiveDate, DailyUsage> = BTreeMap::new();
    for entry in entries {
        let Some(day) = utc_day(entry.created_at) else {
            continue;
        };
        let slot = days.entry(day).or_insert_with(|| DailyUsage {
            date: day.format("%Y-%m-%d").to_string(),
            requests: 0,
            tokens: 0,
            cost: 0.0,
            errors: 0,
        });
        slot.requests += 1;
        slot.tokens = slot.tokens.saturating_add(entry.total_tokens);
        slot.cost += entry.total_cost;
        if entry.is_error {
            slot.errors += 1;
        }
    }
    days.into_values().rev().collect()
}

fn utc_day(epoch: u64) -> Option<NaiveDate> {
    let secs = i64::try_from(epoch).ok()?;
    Utc.timestamp_opt(secs, 0).single().map(|dt| dt.date_naive())
}

/// Epoch seconds from a query parameter: plain seconds, RFC 3339, a naive
/// `YYYY-MM-DDTHH:MM:SS` (taken as UTC) or a bare `YYYY-MM-DD` (midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(secs);
    }
    let secs = if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        dt.timestamp()
    } else if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        Utc.from_utc_datetime(&dt).timestamp()
    } else {
        let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
        Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?).timestamp()
    };
    u64::try_from(secs).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-03-01T00:00:00Z
    const MARCH_1: u64 = 1_709_251_200;

    fn entry(created_at: u64, model: Option<&str>, tokens: u64, error: Option<&str>) -> LedgerEntry {
        let mut e = LedgerEntry::new("r", "cred", "POST", "/messages");
        e.created_at = created_at;
        e.model = model.map(str::to_string);
        e.prompt_tokens = tokens / 2;
        e.completion_tokens = tokens - tokens / 2;
        e.total_tokens = tokens;
        e.total_cost = tokens as f64 / 1000.0;
        e.latency_ms = 100;
        if let Some(code) = error {
            e.is_error = true;
            e.error_code = Some(code.to_string());
        }
        e
    }

    #[test]
    fn statistics_aggregate_models_and_errors() {
        let entries = vec![
            entry(MARCH_1, Some("claude-3-haiku"), 10, None),
            entry(MARCH_1 + 1, Some("claude-3-haiku"), 30, None),
            entry(MARCH_1 + 2, Some("claude-3-opus"), 20, None),
            entry(MARCH_1 + 3, None, 0, Some("TIMEOUT")),
        ];
        let stats = UsageStatistics::from_entries(&entries);
        assert_eq!(stats.total_requests, 4);
        assert_eq!(stats.total_tokens, 60);
        assert_eq!(stats.total_prompt_tokens + stats.total_completion_tokens, 60);
        assert_eq!(stats.error_count, 1);
        assert!((stats.error_rate - 25.0).abs() < 1e-9);
        assert!((stats.avg_response_time_ms - 100.0).abs() < 1e-9);
        assert_eq!(
            stats.model_usage,
            vec![
                ModelUsage {
                    model: "claude-3-haiku".into(),
                    request_count: 2,
                    total_tokens: 40
                },
                ModelUsage {
                    model: "claude-3-opus".into(),
                    request_count: 1,
                    total_tokens: 20
                },
            ]
        );
        assert_eq!(
            stats.error_breakdown,
            vec![ErrorCount {
                error_code: "TIMEOUT".into(),
                count: 1
            }]
        );
    }

    #[test]
    fn empty_statistics_are_zero() {
        let stats = UsageStatistics::from_entries(&[]);
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.error_rate, 0.0);
        assert!(stats.model_usage.is_empty());
    }

    #[test]
    fn daily_groups_by_utc_day_newest_first() {
        let entries = vec![
            entry(MARCH_1 + 10, None, 5, None),
            entry(MARCH_1 + SECONDS_PER_DAY - 1, None, 5, Some("UPSTREAM_ERROR")),
            entry(MARCH_1 + SECONDS_PER_DAY, None, 7, None),
        ];
        let days = daily_usage(&entries);
        assert_eq!(days.len(), 2);
        assert_eq!(days[0].date, "2024-03-02");
        assert_eq!(days[0].tokens, 7);
        assert_eq!(days[1].date, "2024-03-01");
        assert_eq!(days[1].requests, 2);
        assert_eq!(days[1].errors, 1);
    }

    #[test]
    fn timestamps_accept_common_forms() {
        assert_eq!(parse_timestamp("1709251200"), Some(MARCH_1));
        assert_eq!(parse_timestamp("2024-03-01"), Some(MARCH_1));
        assert_eq!(parse_timestamp("2024-03-01T00:00:10"), Some(MARCH_1 + 10));
        assert_eq!(parse_timestamp("2024-03-01T01:00:00+01:00"), Some(MARCH_1));
        assert_eq!(parse_timestamp("yesterday"), None);
        assert_eq!(parse_timestamp("1960-01-01"), None);
    }
}
