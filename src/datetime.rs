//! Date and time conversions shared by the crawler, extractor and analyzers.
//!
//! All persisted timestamps use the SQL form `YYYY-MM-DD HH:MM:SS`. Archive
//! sources additionally use the compact form `YYYYMMDDHHMMSS`, and analyzers
//! group by dates reduced to a configurable resolution.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// SQL timestamp format (`2020-01-01 00:00:00`).
pub const SQL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Compact timestamp format used by Memento archives (`20200101000000`).
pub const COMPACT_FORMAT: &str = "%Y%m%d%H%M%S";

/// Resolution for reduced dates in over-time aggregations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DateResolution {
    Year,
    Month,
    #[default]
    Day,
}

/// Convert an RFC 822-style long date (`Mon, 01 Jan 2020 00:00:00 GMT`) to a
/// SQL timestamp. Returns `None` if the string does not parse.
pub fn long_date_to_sql(value: &str) -> Option<String> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.naive_utc().format(SQL_FORMAT).to_string())
}

/// Convert a compact `YYYYMMDDHHMMSS` timestamp to the SQL form.
pub fn compact_to_sql(value: &str) -> Option<String> {
    NaiveDateTime::parse_from_str(value, COMPACT_FORMAT)
        .ok()
        .map(|dt| dt.format(SQL_FORMAT).to_string())
}

/// Convert a SQL timestamp to the compact `YYYYMMDDHHMMSS` form.
pub fn sql_to_compact(value: &str) -> Option<String> {
    NaiveDateTime::parse_from_str(value, SQL_FORMAT)
        .ok()
        .map(|dt| dt.format(COMPACT_FORMAT).to_string())
}

/// French month names and abbreviations, mapped to the English names the
/// format parser understands. `avr.` is listed before `avril` so the
/// abbreviation is rewritten first.
const FRENCH_MONTHS: &[(&str, &str)] = &[
    ("janvier", "January"),
    ("janv.", "January"),
    ("février", "February"),
    ("févr.", "February"),
    ("mars", "March"),
    ("avr.", "April"),
    ("avril", "April"),
    ("mai", "May"),
    ("juin", "June"),
    ("juillet", "July"),
    ("juil.", "July"),
    ("août", "August"),
    ("septembre", "September"),
    ("sept.", "September"),
    ("octobre", "October"),
    ("oct.", "October"),
    ("novembre", "November"),
    ("nov.", "November"),
    ("décembre", "December"),
    ("déc.", "December"),
];

/// Convert a date/time string with a custom `strftime` format to a SQL
/// timestamp. An empty format falls back to `%F %T`. Formats without a time
/// component are accepted and padded with midnight.
///
/// Locale support is limited to rewriting French month names into the English
/// ones the format parser understands; other locales parse as-is.
pub fn custom_to_sql(value: &str, format: &str, locale: &str) -> Option<String> {
    let format = if format.is_empty() { "%F %T" } else { format };

    let mut value = value.trim().to_owned();

    if locale.len() >= 2 && locale[..2].eq_ignore_ascii_case("fr") {
        for (french, english) in FRENCH_MONTHS {
            if value.contains(french) {
                value = value.replace(french, english);

                break;
            }
        }
    }

    if let Ok(dt) = NaiveDateTime::parse_from_str(&value, format) {
        return Some(dt.format(SQL_FORMAT).to_string());
    }

    NaiveDate::parse_from_str(&value, format)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.format(SQL_FORMAT).to_string())
}

/// Check whether a string starts with a valid ISO date (`YYYY-MM-DD`).
pub fn is_valid_iso_date(value: &str) -> bool {
    value.len() >= 10 && NaiveDate::parse_from_str(&value[..10], "%Y-%m-%d").is_ok()
}

/// Reduce a date string (`YYYY-MM-DD…`) to the given resolution. Strings too
/// short for the resolution are returned unchanged.
pub fn reduce_date(date: &str, resolution: DateResolution) -> String {
    let len = match resolution {
        DateResolution::Year => 4,
        DateResolution::Month => 7,
        DateResolution::Day => 10,
    };

    if date.len() > len {
        date[..len].to_owned()
    } else {
        date.to_owned()
    }
}

/// All reduced dates strictly between `from` and `to` at the given
/// resolution, in ascending order. Used for gap filling in over-time
/// aggregations; returns an empty list when the inputs do not parse or are
/// not in ascending order.
pub fn date_gap(from: &str, to: &str, resolution: DateResolution) -> Vec<String> {
    let mut gap = Vec::new();

    match resolution {
        DateResolution::Year => {
            let (Ok(a), Ok(b)) = (from.parse::<i32>(), to.parse::<i32>()) else {
                return gap;
            };

            for year in (a + 1)..b {
                gap.push(format!("{year:04}"));
            }
        }
        DateResolution::Month => {
            let (Some(mut a), Some(b)) = (parse_year_month(from), parse_year_month(to)) else {
                return gap;
            };

            loop {
                a = next_month(a);

                if a >= b {
                    break;
                }

                gap.push(format!("{:04}-{:02}", a.0, a.1));
            }
        }
        DateResolution::Day => {
            let (Ok(a), Ok(b)) = (
                NaiveDate::parse_from_str(from, "%Y-%m-%d"),
                NaiveDate::parse_from_str(to, "%Y-%m-%d"),
            ) else {
                return gap;
            };

            let mut current = a + Duration::days(1);

            while current < b {
                gap.push(current.format("%Y-%m-%d").to_string());

                current = current + Duration::days(1);
            }
        }
    }

    gap
}

fn parse_year_month(value: &str) -> Option<(i32, u32)> {
    let date = NaiveDate::parse_from_str(&format!("{value}-01"), "%Y-%m-%d").ok()?;

    Some((date.year(), date.month()))
}

fn next_month((year, month): (i32, u32)) -> (i32, u32) {
    if month == 12 { (year + 1, 1) } else { (year, month + 1) }
}
