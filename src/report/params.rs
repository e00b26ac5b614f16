//! Placeholder substitution for report templates.
//!
//! Values are rendered as SQL literals and spliced into the template text.
//! This is textual escaping, not parameter binding: TEXT and LIST values are
//! protected only by doubling single quotes, and placeholders are replaced as
//! plain substrings wherever they occur (including inside string literals,
//! comments, or as the prefix of a longer token such as `@data` in `@data_fim`).
//!
//! NUMBER values are rendered with `f64`'s `Display`: the shortest form that
//! round-trips, never in exponent notation. `10.0` becomes `10`, `2.50`
//! becomes `2.5` and `1e20` becomes `100000000000000000000`. Queries compared
//! textually against ones produced by other tools may differ in these spots.

use chrono::format::{Item, StrftimeItems};
use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use std::fmt::Write;
use std::sync::OnceLock;

use super::{Filter, FilterType, FilterValue, FilterValues};

const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@\w+").expect("valid placeholder pattern"))
}

/// Substitute every filter's placeholder in `template`.
///
/// Filters are processed in the order given. Returns the final query, or a
/// single message naming the offending filter; a partially substituted query
/// is never returned.
pub fn substitute(
    template: &str,
    filters: &[Filter],
    values: &FilterValues,
) -> Result<String, String> {
    let mut query = template.to_string();

    for filter in filters {
        let supplied = values.get(&filter.parameter).filter(|v| !v.is_blank());

        if filter.required && supplied.is_none() {
            return Err(format!("Filter \"{}\" is required", filter.label));
        }

        let literal = match supplied {
            Some(value) => format_value(value, filter)
                .map_err(|e| format!("Filter \"{}\": {}", filter.label, e))?,
            None => default_literal(filter)?,
        };

        query = query.replace(&filter.parameter, &literal);
    }

    Ok(query)
}

/// Substitute using only configured defaults, ignoring required flags.
///
/// Used for template test runs, where no caller values exist: filters with a
/// default get it, everything else becomes `NULL`.
pub fn substitute_defaults(template: &str, filters: &[Filter]) -> Result<String, String> {
    let mut query = template.to_string();
    for filter in filters {
        let literal = default_literal(filter)?;
        query = query.replace(&filter.parameter, &literal);
    }
    Ok(query)
}

fn default_literal(filter: &Filter) -> Result<String, String> {
    match filter.default_value.as_deref() {
        Some(default) if !default.is_empty() => {
            format_value(&FilterValue::Text(default.to_string()), filter)
                .map_err(|e| format!("Filter \"{}\": {}", filter.label, e))
        }
        _ => Ok("NULL".to_string()),
    }
}

/// Render one value as a SQL literal according to the filter's declared type.
pub fn format_value(value: &FilterValue, filter: &Filter) -> Result<String, String> {
    if value.is_blank() {
        return Ok("NULL".to_string());
    }

    match filter.filter_type {
        FilterType::Date => {
            let pattern = filter
                .date_format
                .as_deref()
                .filter(|p| !p.is_empty())
                .unwrap_or(DEFAULT_DATE_FORMAT);
            let date = parse_date(value)?;
            Ok(format!("'{}'", render_date(date, pattern)?))
        }
        FilterType::Number => format_number(value),
        FilterType::Text | FilterType::List | FilterType::Unknown => Ok(quote_text(value)),
    }
}

fn quote_text(value: &FilterValue) -> String {
    format!("'{}'", value.to_string().replace('\'', "''"))
}

fn format_number(value: &FilterValue) -> Result<String, String> {
    let number = match value {
        FilterValue::Number(n) => Some(*n),
        FilterValue::Text(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match number {
        Some(n) if n.is_finite() => Ok(n.to_string()),
        _ => Err(format!("Invalid number: {}", value)),
    }
}

fn parse_date(value: &FilterValue) -> Result<NaiveDate, String> {
    let invalid = || format!("Invalid date: {}. Use format YYYY-MM-DD", value);
    match value {
        FilterValue::Date(d) => Ok(*d),
        FilterValue::DateTime(dt) => Ok(dt.date()),
        FilterValue::Text(s) => {
            // A `T`-separated time suffix is accepted and discarded.
            let date_part = s.trim().split('T').next().unwrap_or_default();
            NaiveDate::parse_from_str(date_part, DEFAULT_DATE_FORMAT)
                .or_else(|_| {
                    NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%d %H:%M:%S").map(|dt| dt.date())
                })
                .map_err(|_| invalid())
        }
        _ => Err(invalid()),
    }
}

fn render_date(date: NaiveDate, pattern: &str) -> Result<String, String> {
    let items: Vec<Item<'_>> = StrftimeItems::new(pattern).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(format!("Invalid date format pattern: {}", pattern));
    }
    let mut out = String::new();
    write!(out, "{}", date.format_with_items(items.into_iter()))
        .map_err(|_| format!("Invalid date format pattern: {}", pattern))?;
    Ok(out)
}

/// Distinct `@token` placeholders in a template, in order of first appearance.
pub fn extract_placeholders(template: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for m in placeholder_re().find_iter(template) {
        if !found.iter().any(|p| p == m.as_str()) {
            found.push(m.as_str().to_string());
        }
    }
    found
}

/// Placeholders present in the template that no filter declares.
pub fn unbound_placeholders(template: &str, filters: &[Filter]) -> Vec<String> {
    extract_placeholders(template)
        .into_iter()
        .filter(|p| !filters.iter().any(|f| &f.parameter == p))
        .collect()
}
