//! Parser for etcd's log format.
//!
//! Lines look like:
//!
//! ```text
//! 2018-08-12 14:13:48.437712 I | etcdserver: published ... to cluster cdf818194e3a8c32
//! ```

use std::sync::LazyLock;

use chrono::NaiveDateTime;
use regex::Regex;

use super::{LineOutcome, LogRecord, Severity};

static LINE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<ts>\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}\.\d{6}) (?P<sev>[A-Z]) \| (?P<component>[^:]+): (?P<msg>.*)$",
    )
    .expect("etcd log regex is valid")
});

/// Parse one line of etcd output.
///
/// Unknown severity letters and non-matching lines yield
/// [`LineOutcome::Unparsed`]; two known-noisy lines are dropped.
#[must_use]
pub fn parse_line(line: &str) -> LineOutcome {
    let line = line.trim_end_matches(['\r', '\n']);
    let Some(captures) = LINE_REGEX.captures(line) else {
        return LineOutcome::Unparsed;
    };

    let severity = match &captures["sev"] {
        "I" => Severity::Info,
        "E" => Severity::Error,
        "W" => Severity::Warning,
        "D" => Severity::Debug,
        "N" => Severity::Notice,
        "C" => Severity::Critical,
        _ => return LineOutcome::Unparsed,
    };

    let component = &captures["component"];
    let message = &captures["msg"];

    if is_known_noise(component, message) {
        return LineOutcome::Dropped;
    }

    let timestamp = NaiveDateTime::parse_from_str(&captures["ts"], "%Y-%m-%d %H:%M:%S%.6f").ok();

    LineOutcome::Record(LogRecord {
        timestamp,
        severity,
        component: Some(component.to_string()),
        location: None,
        message: message.to_string(),
    })
}

/// Two lines are emitted so often they would drown everything else:
///
/// - kube-apiserver health-checks etcd by opening a TCP connection without
///   completing the TLS handshake, which etcd reports every ten seconds
/// - the systemd notify warning cannot be disabled
fn is_known_noise(component: &str, message: &str) -> bool {
    if component == "embed"
        && message.starts_with("rejected connection from \"127.0.0.1:")
        && message.ends_with("\" (error \"EOF\", ServerName \"\")")
    {
        return true;
    }
    component == "etcdmain" && message == "forgot to set Type=notify in systemd service file?"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_message() {
        let line = "2018-08-12 14:13:48.437712 I | etcdserver: published {Name:default ClientURLs:[https://localhost:2379]} to cluster cdf818194e3a8c32\n";
        let LineOutcome::Record(record) = parse_line(line) else {
            panic!("expected a record");
        };

        assert_eq!(record.severity, Severity::Info);
        assert_eq!(record.component.as_deref(), Some("etcdserver"));
        assert_eq!(
            record.message,
            "published {Name:default ClientURLs:[https://localhost:2379]} to cluster cdf818194e3a8c32"
        );
        assert!(record.timestamp.is_some());
    }

    #[test]
    fn test_all_severities() {
        let expected = [
            ("I", tracing::Level::INFO),
            ("E", tracing::Level::ERROR),
            ("W", tracing::Level::WARN),
            ("D", tracing::Level::DEBUG),
            ("N", tracing::Level::INFO),
            ("C", tracing::Level::ERROR),
        ];

        for (letter, level) in expected {
            let line =
                format!("2018-08-12 14:13:48.437712 {letter} | etcdserver: some message\n");
            let LineOutcome::Record(record) = parse_line(&line) else {
                panic!("severity {letter} did not parse");
            };
            assert_eq!(record.severity.level(), level, "severity {letter}");
            assert_eq!(record.component.as_deref(), Some("etcdserver"));
        }
    }

    #[test]
    fn test_rejected_connection_noise_dropped() {
        let line = "2018-08-20 14:43:34.123265 I | embed: rejected connection from \"127.0.0.1:35606\" (error \"EOF\", ServerName \"\")\n";
        assert_eq!(parse_line(line), LineOutcome::Dropped);
    }

    #[test]
    fn test_systemd_noise_dropped() {
        let line = "2018-08-20 14:43:34.123265 W | etcdmain: forgot to set Type=notify in systemd service file?\n";
        assert_eq!(parse_line(line), LineOutcome::Dropped);
    }

    #[test]
    fn test_unparseable_line() {
        assert_eq!(parse_line("not an etcd line\n"), LineOutcome::Unparsed);
    }

    #[test]
    fn test_unknown_severity_letter() {
        let line = "2018-08-12 14:13:48.437712 X | etcdserver: strange\n";
        assert_eq!(parse_line(line), LineOutcome::Unparsed);
    }
}
