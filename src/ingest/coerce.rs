//! Conversion of raw text fields into typed values.
//!
//! Absent or blank fields become NULL for every type. Numeric, boolean and
//! timestamp text is trimmed before parsing; VARCHAR text is passed through
//! untouched. Errors never escape a row: [`coerce_row`] reports the first
//! failing field and the caller drops the row.

use crate::error::CoercionError;
use crate::ingest::parser::RawRow;
use crate::ingest::schema::{ColumnMeta, SqlType};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Typed value ready for binding.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    SmallInt(i16),
    Integer(i32),
    BigInt(i64),
    /// Arbitrary precision, as Postgres `numeric`.
    Numeric(BigDecimal),
    Double(f64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
    Text(String),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

/// Canonical text form; NULL renders as the empty string.
impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => Ok(()),
            SqlValue::SmallInt(v) => write!(f, "{v}"),
            SqlValue::Integer(v) => write!(f, "{v}"),
            SqlValue::BigInt(v) => write!(f, "{v}"),
            SqlValue::Numeric(v) => write!(f, "{v}"),
            SqlValue::Double(v) => write!(f, "{v}"),
            SqlValue::Boolean(v) => write!(f, "{v}"),
            SqlValue::Timestamp(v) => f.write_str(&v.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            SqlValue::Text(v) => f.write_str(v),
        }
    }
}

/// Convert one raw field to `sql_type`.
pub fn coerce(raw: Option<&str>, sql_type: SqlType) -> Result<SqlValue, CoercionError> {
    let Some(raw) = raw else {
        return Ok(SqlValue::Null);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(SqlValue::Null);
    }

    let invalid = || CoercionError::InvalidValue {
        column: String::new(),
        value: raw.to_string(),
        sql_type,
    };

    match sql_type {
        SqlType::SmallInt => trimmed.parse().map(SqlValue::SmallInt).map_err(|_| invalid()),
        SqlType::Integer => trimmed.parse().map(SqlValue::Integer).map_err(|_| invalid()),
        SqlType::BigInt => trimmed.parse().map(SqlValue::BigInt).map_err(|_| invalid()),
        SqlType::Numeric => BigDecimal::from_str(trimmed)
            .map(SqlValue::Numeric)
            .map_err(|_| invalid()),
        SqlType::Double => trimmed.parse().map(SqlValue::Double).map_err(|_| invalid()),
        // Lenient: anything other than "true" reads as false.
        SqlType::Boolean => Ok(SqlValue::Boolean(trimmed.eq_ignore_ascii_case("true"))),
        SqlType::Timestamp | SqlType::TimestampTz => {
            parse_timestamp(trimmed).map(SqlValue::Timestamp)
        }
        SqlType::Varchar => {
            if raw.contains('\0') {
                Err(CoercionError::NulByte(String::new()))
            } else {
                Ok(SqlValue::Text(raw.to_string()))
            }
        }
    }
}

/// Coerce every selected column of a row, in column order.
///
/// A NULL for a non-nullable column rejects the row here rather than
/// failing the whole group at the database.
pub fn coerce_row(row: &RawRow, columns: &[ColumnMeta]) -> Result<Vec<SqlValue>, CoercionError> {
    columns
        .iter()
        .map(|column| {
            let value = coerce(row.get(&column.name).map(String::as_str), column.sql_type)
                .map_err(|err| err.for_column(&column.name))?;
            if value.is_null() && !column.nullable {
                return Err(CoercionError::NullViolation(column.name.clone()));
            }
            Ok(value)
        })
        .collect()
}

/// Trailing `+H`, `-HH` style offset with no minutes.
static SHORT_OFFSET: OnceLock<Regex> = OnceLock::new();

fn short_offset_regex() -> &'static Regex {
    SHORT_OFFSET.get_or_init(|| {
        Regex::new(r"([+-])(\d{1,2})$").expect("Invalid short offset regex")
    })
}

/// Rewrite a timestamp into ISO-like `date T time[offset]` form.
///
/// 1. a trailing `+H`/`+HH`/`-H`/`-HH` offset becomes `±HH:00`
/// 2. without a `T`, the first space becomes the date/time separator
pub fn normalize_timestamp(raw: &str) -> String {
    let mut s = raw.trim().to_string();

    if let Some(caps) = short_offset_regex().captures(&s) {
        let start = caps.get(0).map_or(s.len(), |m| m.start());
        let padded = format!("{}{:0>2}:00", &caps[1], &caps[2]);
        s.replace_range(start.., &padded);
    }

    if !s.contains('T') {
        s = s.replacen(' ', "T", 1);
    }
    s
}

/// Parse a timestamp with or without a UTC offset.
///
/// Offset-qualified input is converted to the absolute instant. Input
/// without an offset is read as local time of the running process.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, CoercionError> {
    let iso = normalize_timestamp(raw);
    let invalid = || CoercionError::InvalidTimestamp {
        column: String::new(),
        value: raw.to_string(),
    };

    // `%:z` has no `Z` spelling, so the minutes-only form gets UTC spelled out.
    let minutes_form = match iso.strip_suffix('Z') {
        Some(rest) => format!("{rest}+00:00"),
        None => iso.clone(),
    };
    if let Ok(dt) = DateTime::parse_from_rfc3339(&iso)
        .or_else(|_| DateTime::parse_from_str(&minutes_form, "%Y-%m-%dT%H:%M%:z"))
    {
        return Ok(dt.with_timezone(&Utc));
    }

    let plain = iso.replacen('T', " ", 1);
    let naive = NaiveDateTime::parse_from_str(&plain, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(&plain, "%Y-%m-%d %H:%M"))
        .map_err(|_| invalid())?;

    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::column_meta;

    fn decimal(text: &str) -> BigDecimal {
        BigDecimal::from_str(text).unwrap()
    }

    #[test]
    fn test_blank_and_absent_are_null_for_every_type() {
        for ty in [
            SqlType::SmallInt,
            SqlType::Integer,
            SqlType::BigInt,
            SqlType::Numeric,
            SqlType::Double,
            SqlType::Boolean,
            SqlType::Timestamp,
            SqlType::TimestampTz,
            SqlType::Varchar,
        ] {
            assert_eq!(coerce(None, ty).unwrap(), SqlValue::Null);
            assert_eq!(coerce(Some("   "), ty).unwrap(), SqlValue::Null);
        }
    }

    #[test]
    fn test_integers() {
        assert_eq!(coerce(Some("42"), SqlType::Integer).unwrap(), SqlValue::Integer(42));
        assert_eq!(coerce(Some(" -7 "), SqlType::Integer).unwrap(), SqlValue::Integer(-7));
        assert!(coerce(Some("2147483648"), SqlType::Integer).is_err());
        assert!(coerce(Some("40000"), SqlType::SmallInt).is_err());
        assert!(coerce(Some("4.2"), SqlType::Integer).is_err());
        assert_eq!(
            coerce(Some("9223372036854775807"), SqlType::BigInt).unwrap(),
            SqlValue::BigInt(i64::MAX)
        );
        assert!(coerce(Some("abc"), SqlType::BigInt).is_err());
    }

    #[test]
    fn test_numeric_keeps_precision() {
        let value = coerce(Some("12345678901234567890.123456789"), SqlType::Numeric).unwrap();
        assert_eq!(value.to_string(), "12345678901234567890.123456789");
        assert_eq!(
            coerce(Some("1e3"), SqlType::Numeric).unwrap(),
            SqlValue::Numeric(BigDecimal::from(1000))
        );
        assert!(coerce(Some("ten"), SqlType::Numeric).is_err());
    }

    #[test]
    fn test_numeric_beyond_twenty_eight_digits() {
        for text in [
            "123456789012345678901234567890",
            "99999999999999999999999999999.5",
            "0.1234567890123456789012345678901234",
            "-98765432109876543210987654321098765.4321",
        ] {
            assert_eq!(
                coerce(Some(text), SqlType::Numeric).unwrap(),
                SqlValue::Numeric(decimal(text))
            );
            assert_eq!(coerce(Some(text), SqlType::Numeric).unwrap().to_string(), text);
        }
    }

    #[test]
    fn test_double() {
        assert_eq!(coerce(Some("2.5"), SqlType::Double).unwrap(), SqlValue::Double(2.5));
        assert!(coerce(Some("2,5"), SqlType::Double).is_err());
    }

    #[test]
    fn test_boolean_is_lenient() {
        assert_eq!(coerce(Some("TRUE"), SqlType::Boolean).unwrap(), SqlValue::Boolean(true));
        assert_eq!(coerce(Some("false"), SqlType::Boolean).unwrap(), SqlValue::Boolean(false));
        assert_eq!(coerce(Some("yes"), SqlType::Boolean).unwrap(), SqlValue::Boolean(false));
    }

    #[test]
    fn test_varchar_passes_through() {
        assert_eq!(
            coerce(Some("  padded "), SqlType::Varchar).unwrap(),
            SqlValue::Text("  padded ".to_string())
        );
        assert!(matches!(
            coerce(Some("a\0b"), SqlType::Varchar),
            Err(CoercionError::NulByte(_))
        ));
    }

    #[test]
    fn test_round_trip_to_canonical_text() {
        let cases = [
            ("42", SqlType::Integer),
            ("-12", SqlType::SmallInt),
            ("9000000000", SqlType::BigInt),
            ("9.99", SqlType::Numeric),
            ("0.5", SqlType::Double),
            ("true", SqlType::Boolean),
            ("2024-01-05T15:00:00Z", SqlType::TimestampTz),
            ("hello, world", SqlType::Varchar),
        ];
        for (raw, ty) in cases {
            assert_eq!(coerce(Some(raw), ty).unwrap().to_string(), raw, "{ty}");
        }
    }

    #[test]
    fn test_normalize_short_offset() {
        assert_eq!(
            normalize_timestamp("2024-01-05 10:00:00-5"),
            "2024-01-05T10:00:00-05:00"
        );
        assert_eq!(
            normalize_timestamp(" 2024-01-05 10:00:00+02 "),
            "2024-01-05T10:00:00+02:00"
        );
        assert_eq!(
            normalize_timestamp("2024-01-05T10:00:00+05:30"),
            "2024-01-05T10:00:00+05:30"
        );
        assert_eq!(normalize_timestamp("2024-01-05 10:00:00"), "2024-01-05T10:00:00");
    }

    #[test]
    fn test_short_offset_parses_to_same_instant() {
        let shifted = parse_timestamp("2024-01-05 10:00:00-5").unwrap();
        let utc = parse_timestamp("2024-01-05T15:00:00Z").unwrap();
        assert_eq!(shifted, utc);
    }

    #[test]
    fn test_minute_precision_with_zulu_suffix() {
        let short = parse_timestamp("2024-01-05T10:00Z").unwrap();
        assert_eq!(short, parse_timestamp("2024-01-05T10:00:00Z").unwrap());
        assert_eq!(short, parse_timestamp("2024-01-05 10:00Z").unwrap());
        assert_eq!(
            parse_timestamp("2024-01-05T10:00+01:00").unwrap(),
            parse_timestamp("2024-01-05T09:00:00Z").unwrap()
        );
    }

    #[test]
    fn test_plain_timestamp_uses_local_time() {
        let parsed = parse_timestamp("2024-01-05 10:00:00").unwrap();
        let naive =
            NaiveDateTime::parse_from_str("2024-01-05 10:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
        let expected = Local
            .from_local_datetime(&naive)
            .earliest()
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(parsed, expected);

        assert!(parse_timestamp("2024-01-05T10:00:00.250").is_ok());
    }

    #[test]
    fn test_unparsable_timestamp() {
        assert!(matches!(
            coerce(Some("yesterday"), SqlType::Timestamp),
            Err(CoercionError::InvalidTimestamp { .. })
        ));
        assert!(parse_timestamp("2024-01-05").is_err());
    }

    #[test]
    fn test_coerce_row_names_failing_column() {
        let columns = vec![
            column_meta("id", "bigint", false, false),
            column_meta("total", "numeric", true, false),
        ];
        let mut row = RawRow::new();
        row.insert("id".to_string(), "abc".to_string());
        row.insert("total".to_string(), "9.99".to_string());

        match coerce_row(&row, &columns) {
            Err(CoercionError::InvalidValue { column, .. }) => assert_eq!(column, "id"),
            other => panic!("unexpected result: {other:?}"),
        }

        row.insert("id".to_string(), "7".to_string());
        assert_eq!(
            coerce_row(&row, &columns).unwrap(),
            vec![SqlValue::BigInt(7), SqlValue::Numeric(decimal("9.99"))]
        );
    }

    #[test]
    fn test_coerce_row_rejects_null_in_not_null_column() {
        let columns = vec![
            column_meta("id", "bigint", false, false),
            column_meta("note", "text", true, false),
        ];
        let mut row = RawRow::new();
        row.insert("note".to_string(), "x".to_string());

        assert_eq!(
            coerce_row(&row, &columns),
            Err(CoercionError::NullViolation("id".to_string()))
        );
    }
}
