//! Parser for the klog format used by the Kubernetes binaries.
//!
//! Lines look like:
//!
//! ```text
//! W0812 17:00:08.194751   25997 genericapiserver.go:319] Skipping API ...
//! ```
//!
//! The swagger machinery inside kube-apiserver additionally emits a
//! `[restful]` format of its own, which is recognised separately. Kube logs
//! pad columns with runs of spaces; those are collapsed before matching.

use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;

use super::{LineOutcome, LogRecord, Severity};

static MULTI_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ ]+").expect("space regex is valid"));

static LINE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<sev>[A-Z])(?P<month>\d{2})(?P<day>\d{2}) (?P<time>\d{2}:\d{2}:\d{2}\.\d{6}) (?P<pid>\d+) (?P<location>[^\]]+)\] (?P<msg>.*)$",
    )
    .expect("klog regex is valid")
});

static RESTFUL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\[restful\] (?P<ts>\d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2}) (?P<location>[^ :]+:\d+): (?P<msg>.*)$",
    )
    .expect("restful regex is valid")
});

/// Parse one line of klog output.
#[must_use]
pub fn parse_line(line: &str) -> LineOutcome {
    let line = line.trim_end_matches(['\r', '\n']);

    if line.starts_with("[restful]") {
        return parse_restful_line(line);
    }

    let collapsed = MULTI_SPACE.replace_all(line, " ");
    let Some(captures) = LINE_REGEX.captures(&collapsed) else {
        return LineOutcome::Unparsed;
    };

    let severity = match &captures["sev"] {
        "I" => Severity::Info,
        "E" => Severity::Error,
        "W" => Severity::Warning,
        "D" => Severity::Debug,
        "N" => Severity::Notice,
        // Severe is handled as error.
        "S" => Severity::Critical,
        _ => return LineOutcome::Unparsed,
    };

    LineOutcome::Record(LogRecord {
        timestamp: parse_timestamp(&captures["month"], &captures["day"], &captures["time"]),
        severity,
        component: None,
        location: Some(captures["location"].to_string()),
        message: captures["msg"].to_string(),
    })
}

/// klog timestamps carry no year; the current one is assumed.
fn parse_timestamp(month: &str, day: &str, time: &str) -> Option<NaiveDateTime> {
    let month: u32 = month.parse().ok()?;
    let day: u32 = day.parse().ok()?;
    let time = NaiveTime::parse_from_str(time, "%H:%M:%S%.6f").ok()?;
    let year = chrono::Local::now().year();
    NaiveDate::from_ymd_opt(year, month, day).map(|date| date.and_time(time))
}

fn parse_restful_line(line: &str) -> LineOutcome {
    let Some(captures) = RESTFUL_REGEX.captures(line) else {
        return LineOutcome::Unparsed;
    };

    let timestamp =
        NaiveDateTime::parse_from_str(&captures["ts"], "%Y/%m/%d %H:%M:%S").ok();

    LineOutcome::Record(LogRecord {
        timestamp,
        severity: Severity::Info,
        component: Some("restful".to_string()),
        location: Some(captures["location"].to_string()),
        message: captures["msg"].to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_message() {
        let line = "W0812 17:00:08.194751   25997 genericapiserver.go:319] Skipping API scheduling.k8s.io/v1alpha1 because it has no resources.\n";
        let LineOutcome::Record(record) = parse_line(line) else {
            panic!("expected a record");
        };

        assert_eq!(record.severity, Severity::Warning);
        assert_eq!(record.severity.level(), tracing::Level::WARN);
        assert_eq!(record.location.as_deref(), Some("genericapiserver.go:319"));
        assert_eq!(
            record.message,
            "Skipping API scheduling.k8s.io/v1alpha1 because it has no resources."
        );
    }

    #[test]
    fn test_restful_message() {
        let line = "[restful] 2018/08/12 17:00:09 log.go:33: [restful/swagger] listing is available at https://172.17.0.1:7443/swaggerapi\n";
        let LineOutcome::Record(record) = parse_line(line) else {
            panic!("expected a record");
        };

        assert_eq!(record.severity, Severity::Info);
        assert_eq!(record.component.as_deref(), Some("restful"));
        assert_eq!(record.location.as_deref(), Some("log.go:33"));
        assert_eq!(
            record.message,
            "[restful/swagger] listing is available at https://172.17.0.1:7443/swaggerapi"
        );
    }

    #[test]
    fn test_severe_maps_to_error() {
        let line = "S0812 17:00:08.194751 25997 server.go:10] it broke\n";
        let LineOutcome::Record(record) = parse_line(line) else {
            panic!("expected a record");
        };
        assert_eq!(record.severity.level(), tracing::Level::ERROR);
    }

    #[test]
    fn test_unparseable_line() {
        assert_eq!(parse_line("free-form text\n"), LineOutcome::Unparsed);
    }

    #[test]
    fn test_column_padding_collapsed() {
        let line = "I0812 17:00:08.194751       1 controllermanager.go:494] Started   \"podgc\"\n";
        let LineOutcome::Record(record) = parse_line(line) else {
            panic!("expected a record");
        };
        assert_eq!(record.message, "Started \"podgc\"");
    }
}
