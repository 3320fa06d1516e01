use std::collections::BTreeSet;

use chrono::{Datelike, Local, NaiveDate, TimeZone, Utc};

use crate::config::types::{Options, RequestFilter, TAG_ANY, TYPE_ANY};
use crate::ConfigError;

/// The post types the content API can return
pub const POST_TYPES: &[&str] = &[
    "text", "quote", "link", "answer", "video", "audio", "photo", "chat",
];

/// Validates a full option set
pub fn validate(options: &Options) -> Result<(), ConfigError> {
    if options.threads < 1 {
        return Err(ConfigError::Validation(
            "threads: must use at least one thread".to_string(),
        ));
    }

    if options.no_reblog && options.only_reblog {
        return Err(ConfigError::Validation(
            "no-reblog and only-reblog are mutually exclusive".to_string(),
        ));
    }

    if let Some(limit) = options.notes_limit {
        if !options.save_notes {
            return Err(ConfigError::Validation(
                "notes-limit requires save-notes".to_string(),
            ));
        }
        if limit < 1 {
            return Err(ConfigError::Validation(
                "notes-limit: value must be at least 1".to_string(),
            ));
        }
    }

    if options.tag_index && options.dirs {
        return Err(ConfigError::Validation(
            "dirs cannot be used with tag-index".to_string(),
        ));
    }

    if options.count == Some(0) && options.incremental {
        return Err(ConfigError::Validation(
            "count 0 conflicts with incremental".to_string(),
        ));
    }

    if options.prev_archive.is_some() && options.reuse_json {
        return Err(ConfigError::Validation(
            "prev-archive and reuse-json are mutually exclusive".to_string(),
        ));
    }

    if options.no_get && !(options.prev_archive.is_some() || options.reuse_json) {
        return Err(ConfigError::Validation(
            "no-get makes no sense without prev-archive or reuse-json".to_string(),
        ));
    }

    if options.idents.is_some() && options.likes {
        return Err(ConfigError::Validation(
            "ids not implemented for likes".to_string(),
        ));
    }

    if let Some((start, end)) = options.period {
        if start >= end {
            return Err(ConfigError::InvalidPeriod(format!(
                "period start ({}) is not before its end ({})",
                start, end
            )));
        }
    }

    if let Some(filter) = &options.filter {
        parse_filter(filter)?;
    }

    Ok(())
}

/// Parses a period option into a half-open `[start, end)` timestamp range
///
/// Accepts the shorthands `y`, `m`, `d` (the current year/month/day) or
/// `YYYY[MM[DD]][Z]`, optionally as a `start,end` pair. A trailing `Z`
/// selects UTC instead of local time.
pub fn parse_period(value: &str) -> Result<(i64, i64), ConfigError> {
    let now = Local::now();
    let expanded = match value {
        "y" => format!("{:04}", now.year()),
        "m" => format!("{:04}{:02}", now.year(), now.month()),
        "d" => format!("{:04}{:02}{:02}", now.year(), now.month(), now.day()),
        other => other.replace('-', ""),
    };

    let parts: Vec<&str> = expanded.split(',').collect();
    if parts.is_empty() || parts.len() > 2 {
        return Err(ConfigError::InvalidPeriod(
            "period must have either one year/month/day or a start and end".to_string(),
        ));
    }

    let (start, mut end) = parse_period_date(parts[0])?;
    if parts.len() == 2 {
        end = parse_period_date(parts[1])?.0;
    }
    if start >= end {
        return Err(ConfigError::InvalidPeriod(format!(
            "period start ({}) is not before its end ({})",
            parts[0],
            parts.get(1).copied().unwrap_or(parts[0])
        )));
    }
    Ok((start, end))
}

/// Parses one `YYYY[MM[DD]][Z]` date into the timestamp range it covers
fn parse_period_date(period: &str) -> Result<(i64, i64), ConfigError> {
    let (period, utc) = match period.strip_suffix('Z') {
        Some(rest) => (rest, true),
        None => (period, false),
    };

    if !matches!(period.len(), 4 | 6 | 8) || !period.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ConfigError::InvalidPeriod(format!(
            "period must be 'y', 'm', 'd' or YYYY[MM[DD]][Z], got '{}'",
            period
        )));
    }

    let year: i32 = period[..4]
        .parse()
        .map_err(|_| ConfigError::InvalidPeriod(period.to_string()))?;
    let month: u32 = if period.len() >= 6 {
        period[4..6]
            .parse()
            .map_err(|_| ConfigError::InvalidPeriod(period.to_string()))?
    } else {
        1
    };
    let day: u32 = if period.len() == 8 {
        period[6..8]
            .parse()
            .map_err(|_| ConfigError::InvalidPeriod(period.to_string()))?
    } else {
        1
    };

    let start_date = NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| ConfigError::InvalidPeriod(format!("invalid date '{}'", period)))?;
    let end_date = match period.len() {
        4 => NaiveDate::from_ymd_opt(year + 1, 1, 1),
        6 => {
            if month == 12 {
                NaiveDate::from_ymd_opt(year + 1, 1, 1)
            } else {
                NaiveDate::from_ymd_opt(year, month + 1, 1)
            }
        }
        _ => start_date.succ_opt(),
    }
    .ok_or_else(|| ConfigError::InvalidPeriod(format!("invalid date '{}'", period)))?;

    let to_ts = |date: NaiveDate| -> Result<i64, ConfigError> {
        let dt = date.and_hms_opt(0, 0, 0).ok_or_else(|| {
            ConfigError::InvalidPeriod(format!("invalid date '{}'", period))
        })?;
        if utc {
            Ok(Utc.from_utc_datetime(&dt).timestamp())
        } else {
            Local
                .from_local_datetime(&dt)
                .earliest()
                .map(|t| t.timestamp())
                .ok_or_else(|| {
                    ConfigError::InvalidPeriod(format!("ambiguous local date '{}'", period))
                })
        }
    };

    Ok((to_ts(start_date)?, to_ts(end_date)?))
}

/// Parses `-Q TYPE[:TAG[,TAG...]]` values into a request filter
///
/// `TYPE` may be a comma-separated list of post types or `any`; missing tags
/// mean "any tag". Repeated values merge.
pub fn parse_request(values: &[String]) -> Result<RequestFilter, ConfigError> {
    let mut request = RequestFilter::new();
    for value in values {
        let (types, tags) = match value.split_once(':') {
            Some((t, rest)) => {
                let tags: BTreeSet<String> = rest
                    .split(',')
                    .map(|t| t.trim().to_lowercase())
                    .filter(|t| !t.is_empty())
                    .collect();
                (t, tags)
            }
            None => (value.as_str(), BTreeSet::from([TAG_ANY.to_string()])),
        };
        for typ in types.split(',') {
            let typ = typ.trim().to_lowercase();
            if typ != TYPE_ANY && !POST_TYPES.contains(&typ.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "request: unknown post type '{}'",
                    typ
                )));
            }
            request.entry(typ).or_default().extend(tags.iter().cloned());
        }
    }
    Ok(request)
}

/// Comparison operator of a filter expression
#[derive(Debug, Clone, PartialEq, Eq)]
enum FilterOp {
    /// Pointer value equals the literal
    Eq,
    /// Pointer value differs from the literal
    Ne,
    /// Pointer exists and is not null/false
    Exists,
}

/// A predicate over a raw post document, written as a JSON-pointer
/// expression: `/ptr=value`, `/ptr!=value` or `/ptr?`
#[derive(Debug, Clone, PartialEq)]
pub struct FilterExpr {
    pointer: String,
    op: FilterOp,
    value: Option<serde_json::Value>,
}

impl FilterExpr {
    /// Evaluates the predicate against a raw post document
    pub fn matches(&self, doc: &serde_json::Value) -> bool {
        let found = doc.pointer(&self.pointer);
        match self.op {
            FilterOp::Exists => !matches!(
                found,
                None | Some(serde_json::Value::Null) | Some(serde_json::Value::Bool(false))
            ),
            FilterOp::Eq => found == self.value.as_ref(),
            FilterOp::Ne => found != self.value.as_ref(),
        }
    }
}

/// Parses a filter expression
pub fn parse_filter(expr: &str) -> Result<FilterExpr, ConfigError> {
    let err = |msg: &str| ConfigError::InvalidFilter(format!("'{}': {}", expr, msg));

    let (pointer, op, literal) = if let Some(ptr) = expr.strip_suffix('?') {
        (ptr, FilterOp::Exists, None)
    } else if let Some((ptr, value)) = expr.split_once("!=") {
        (ptr, FilterOp::Ne, Some(value))
    } else if let Some((ptr, value)) = expr.split_once('=') {
        (ptr, FilterOp::Eq, Some(value))
    } else {
        return Err(err("expected /pointer=value, /pointer!=value or /pointer?"));
    };

    if !pointer.starts_with('/') {
        return Err(err("pointer must start with '/'"));
    }

    // Literals parse as JSON where possible, else as a bare string
    let value = literal.map(|lit| {
        serde_json::from_str(lit)
            .unwrap_or_else(|_| serde_json::Value::String(lit.to_string()))
    });

    Ok(FilterExpr {
        pointer: pointer.to_string(),
        op,
        value,
    })
}
