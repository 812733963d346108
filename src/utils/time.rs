use chrono::{DateTime, SecondsFormat, Utc};

/// Fixed-width UTC form so stored timestamps compare correctly as text.
pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}
