// Expiry date normalization for extracted product labels
//
// Labels print dates in many shapes (12/08/2025, 08-25, AUG 2025, EXP: 2025-08-12).
// Everything is reduced to a NaiveDate; month-only dates mean the last day of that month.

use chrono::{FixedOffset, Months, NaiveDate, Utc};

use crate::core::types::ProductRecord;

const LABEL_PREFIXES: &[&str] = &[
    "best before end",
    "best before",
    "expiry date",
    "expiration date",
    "use before",
    "use by",
    "expires",
    "expiry",
    "exp",
    "bbe",
    "bb",
];

const MONTHS: &[&str] = &[
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

fn strip_label_prefix(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let mut rest = lowered.as_str();
    for prefix in LABEL_PREFIXES {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped;
            break;
        }
    }
    rest.trim_start_matches(|c: char| c == ':' || c == '.' || c.is_whitespace())
        .to_string()
}

fn month_from_name(token: &str) -> Option<u32> {
    if token.len() < 3 {
        return None;
    }
    MONTHS
        .iter()
        .position(|m| token.starts_with(m))
        .map(|i| i as u32 + 1)
}

fn expand_year(token: &str) -> Option<i32> {
    let year: i32 = token.parse().ok()?;
    match token.len() {
        2 => Some(2000 + year),
        4 => Some(year),
        _ => None,
    }
}

fn end_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, 1)?
        .checked_add_months(Months::new(1))?
        .pred_opt()
}

fn parse_numeric(tokens: &[&str]) -> Option<NaiveDate> {
    match tokens {
        [first, second, third] => {
            if first.len() == 4 {
                let year = expand_year(first)?;
                NaiveDate::from_ymd_opt(year, second.parse().ok()?, third.parse().ok()?)
            } else {
                let year = expand_year(third)?;
                NaiveDate::from_ymd_opt(year, second.parse().ok()?, first.parse().ok()?)
            }
        }
        [first, second] => {
            if first.len() == 4 {
                end_of_month(expand_year(first)?, second.parse().ok()?)
            } else {
                end_of_month(expand_year(second)?, first.parse().ok()?)
            }
        }
        _ => None,
    }
}

fn parse_with_month_name(tokens: &[&str]) -> Option<NaiveDate> {
    let month = tokens.iter().find_map(|t| month_from_name(t))?;
    let numbers: Vec<&str> = tokens
        .iter()
        .copied()
        .filter(|t| t.chars().all(|c| c.is_ascii_digit()))
        .collect();

    match numbers.as_slice() {
        [year] => end_of_month(expand_year(year)?, month),
        [a, b] => {
            // "12 Aug 2025" or "Aug 2025 12": the four-digit token is the year
            let (day, year) = if a.len() == 4 { (b, a) } else { (a, b) };
            NaiveDate::from_ymd_opt(expand_year(year)?, month, day.parse().ok()?)
        }
        _ => None,
    }
}

/// Parse a printed expiry string into a calendar date
pub fn normalize_expiry(raw: &str) -> Option<NaiveDate> {
    let cleaned = strip_label_prefix(raw);
    let tokens: Vec<&str> = cleaned
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();

    if tokens.is_empty() {
        return None;
    }

    if tokens.iter().all(|t| t.chars().all(|c| c.is_ascii_digit())) {
        parse_numeric(&tokens)
    } else {
        parse_with_month_name(&tokens)
    }
}

/// Current date at a fixed UTC offset
pub fn today_at_offset(offset_minutes: i32) -> NaiveDate {
    FixedOffset::east_opt(offset_minutes * 60)
        .map(|offset| Utc::now().with_timezone(&offset).date_naive())
        .unwrap_or_else(|| Utc::now().date_naive())
}

/// Fill `expiry_normalized` and `days_until_expiry` from `expiry_date`
pub fn annotate_expiry(record: &mut ProductRecord, today: NaiveDate) {
    let Some(date) = record.expiry_date.as_deref().and_then(normalize_expiry) else {
        return;
    };
    record.expiry_normalized = Some(date.format("%Y-%m-%d").to_string());
    record.days_until_expiry = Some((date - today).num_days());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_numeric_formats() {
        assert_eq!(normalize_expiry("12/08/2025"), Some(date(2025, 8, 12)));
        assert_eq!(normalize_expiry("12-08-25"), Some(date(2025, 8, 12)));
        assert_eq!(normalize_expiry("2025-08-12"), Some(date(2025, 8, 12)));
        assert_eq!(normalize_expiry("12.08.2025"), Some(date(2025, 8, 12)));
    }

    #[test]
    fn test_month_year_means_end_of_month() {
        assert_eq!(normalize_expiry("02/2024"), Some(date(2024, 2, 29)));
        assert_eq!(normalize_expiry("11/25"), Some(date(2025, 11, 30)));
        assert_eq!(normalize_expiry("Dec 2025"), Some(date(2025, 12, 31)));
    }

    #[test]
    fn test_month_names_and_prefixes() {
        assert_eq!(normalize_expiry("12 Aug 2025"), Some(date(2025, 8, 12)));
        assert_eq!(normalize_expiry("August 12, 2025"), Some(date(2025, 8, 12)));
        assert_eq!(normalize_expiry("EXP: 03/2026"), Some(date(2026, 3, 31)));
        assert_eq!(normalize_expiry("Best before 01-01-2026"), Some(date(2026, 1, 1)));
        assert_eq!(normalize_expiry("USE BY 5 JAN 26"), Some(date(2026, 1, 5)));
    }

    #[test]
    fn test_unparseable_dates() {
        assert_eq!(normalize_expiry(""), None);
        assert_eq!(normalize_expiry("see pack"), None);
        assert_eq!(normalize_expiry("31/02/2025"), None);
        assert_eq!(normalize_expiry("6 months from packaging"), None);
    }

    #[test]
    fn test_annotate_expiry() {
        let mut record = ProductRecord {
            expiry_date: Some("15/08/2025".to_string()),
            ..Default::default()
        };
        annotate_expiry(&mut record, date(2025, 8, 10));
        assert_eq!(record.expiry_normalized.as_deref(), Some("2025-08-15"));
        assert_eq!(record.days_until_expiry, Some(5));

        let mut missing = ProductRecord::default();
        annotate_expiry(&mut missing, date(2025, 8, 10));
        assert!(missing.expiry_normalized.is_none());
        assert!(missing.days_until_expiry.is_none());
    }
}
