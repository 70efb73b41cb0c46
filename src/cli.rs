//! Command-line arguments for the two clients.
//!
//! Flags follow the Go `flag` conventions the demo scripts use (`-subj`,
//! `-tlscacert`); [`normalize_flags`] rewrites them to clap's `--long` form.

use crate::config::ClientConfig;
use clap::Parser;
use std::time::Duration;

pub const DEFAULT_URL: &str = "nats://127.0.0.1:4222";
pub const DEFAULT_SUBJECT: &str = "demo.requests";
pub const DEFAULT_QUEUE_GROUP: &str = "demo";
pub const DEFAULT_METRICS_PORT: u16 = 8675;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum CliError {
    #[error("invalid duration {input:?}: {reason}")]
    InvalidDuration { input: String, reason: &'static str },
}

#[derive(Parser, Debug)]
#[command(name = "replier")]
#[command(about = "Answers requests on a subject as a member of a queue group")]
pub struct ReplierArgs {
    /// The nats server URLs (separated by comma)
    #[arg(short = 's', default_value = DEFAULT_URL)]
    pub urls: String,

    /// The subject to listen to
    #[arg(long = "subj", default_value = DEFAULT_SUBJECT)]
    pub subject: String,

    /// The name of the queue group
    #[arg(long = "qg", default_value = DEFAULT_QUEUE_GROUP)]
    pub queue_group: String,

    /// Artificial workload delay, e.g. 10ms
    #[arg(long, value_parser = parse_delay, allow_hyphen_values = true)]
    pub delay: Option<Duration>,

    /// Enable debugging
    #[arg(long)]
    pub debug: bool,

    #[command(flatten)]
    pub client: ClientConfig,
}

#[derive(Parser, Debug)]
#[command(name = "requestor")]
#[command(about = "Issues back-to-back requests and exports their latency")]
pub struct RequestorArgs {
    /// The nats server URLs (separated by comma)
    #[arg(short = 's', default_value = DEFAULT_URL)]
    pub urls: String,

    /// The subject to make requests on
    #[arg(long = "subj", default_value = DEFAULT_SUBJECT)]
    pub subject: String,

    /// The prometheus port to listen on
    #[arg(short = 'p', default_value_t = DEFAULT_METRICS_PORT)]
    pub port: u16,

    /// Delay between each request, e.g. 10ms
    #[arg(long, value_parser = parse_delay, allow_hyphen_values = true)]
    pub delay: Option<Duration>,

    /// Enable debugging
    #[arg(long)]
    pub debug: bool,

    #[command(flatten)]
    pub client: ClientConfig,

    /// Subject override; used only when exactly one is given
    pub positional: Vec<String>,
}

impl ReplierArgs {
    pub fn delay(&self) -> Option<Duration> {
        self.delay.filter(|d| !d.is_zero())
    }
}

impl RequestorArgs {
    pub fn effective_subject(&self) -> &str {
        match self.positional.as_slice() {
            [subject] => subject,
            _ => &self.subject,
        }
    }

    pub fn delay(&self) -> Option<Duration> {
        self.delay.filter(|d| !d.is_zero())
    }
}

/// Rewrite single-dash long flags (`-subj x`, `-debug`) to `--subj x`.
/// Single-letter flags and everything after `--` are left alone.
pub fn normalize_flags<I>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut out = Vec::new();
    let mut passthrough = false;
    for (i, arg) in args.into_iter().enumerate() {
        if i == 0 || passthrough {
            out.push(arg);
            continue;
        }
        if arg == "--" {
            passthrough = true;
            out.push(arg);
            continue;
        }
        let rewritten = match arg.strip_prefix('-') {
            Some(rest) if !rest.starts_with('-') => {
                let name = rest.split('=').next().unwrap_or(rest);
                if name.chars().count() > 1 && name.starts_with(|c: char| c.is_ascii_alphabetic())
                {
                    Some(format!("--{}", rest))
                } else {
                    None
                }
            }
            _ => None,
        };
        out.push(rewritten.unwrap_or(arg));
    }
    out
}

/// Parse a `-delay` value. Empty means no delay.
pub fn parse_delay(s: &str) -> Result<Duration, CliError> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(Duration::ZERO);
    }
    parse_go_duration(s)
}

fn unit_nanos(unit: &str) -> Option<u128> {
    match unit {
        "ns" => Some(1),
        "us" | "µs" | "μs" => Some(1_000),
        "ms" => Some(1_000_000),
        "s" => Some(1_000_000_000),
        "m" => Some(60_000_000_000),
        "h" => Some(3_600_000_000_000),
        _ => None,
    }
}

/// Go `time.ParseDuration` syntax: a sequence of decimal numbers, each with
/// an optional fraction and a unit suffix, e.g. `300ms`, `1.5s`, `1h30m`.
/// `0` on its own needs no unit. A leading `-` is accepted and yields zero,
/// since a negative sleep returns at once.
pub fn parse_go_duration(s: &str) -> Result<Duration, CliError> {
    let invalid = |reason| CliError::InvalidDuration {
        input: s.to_string(),
        reason,
    };
    let (negative, mut rest) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    if rest.is_empty() {
        return Err(invalid("empty duration"));
    }

    let mut total: u128 = 0;
    while !rest.is_empty() {
        let int_len = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        let (int_part, after) = rest.split_at(int_len);
        let (frac_part, after) = match after.strip_prefix('.') {
            Some(a) => a.split_at(a.find(|c: char| !c.is_ascii_digit()).unwrap_or(a.len())),
            None => ("", after),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid("expected a number"));
        }
        let unit_len = after
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(after.len());
        let (unit, after) = after.split_at(unit_len);
        if unit.is_empty() {
            return Err(invalid("missing unit"));
        }
        let scale = unit_nanos(unit).ok_or_else(|| invalid("unknown unit"))?;

        let whole: u128 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| invalid("number out of range"))?
        };
        total = whole
            .checked_mul(scale)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(|| invalid("duration out of range"))?;
        if !frac_part.is_empty() {
            // Digits past nanosecond precision cannot change the result.
            let digits = &frac_part[..frac_part.len().min(18)];
            let frac: u128 = digits.parse().map_err(|_| invalid("number out of range"))?;
            total += frac * scale / 10u128.pow(digits.len() as u32);
        }
        rest = after;
    }

    let nanos = u64::try_from(total).map_err(|_| invalid("duration out of range"))?;
    if negative {
        return Ok(Duration::ZERO);
    }
    Ok(Duration::from_nanos(nanos))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn go_durations_parse() {
        assert_eq!(parse_go_duration("10ms").unwrap(), Duration::from_millis(10));
        assert_eq!(parse_go_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_go_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_go_duration("250us").unwrap(), Duration::from_micros(250));
        assert_eq!(parse_go_duration("250µs").unwrap(), Duration::from_micros(250));
        assert_eq!(parse_go_duration(".5ms").unwrap(), Duration::from_micros(500));
        assert_eq!(parse_go_duration("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn bad_durations_are_rejected() {
        for input in ["10", "ms", "10xs", "-", "-ten", "1..5s", "abc"] {
            assert!(parse_go_duration(input).is_err(), "{input} should fail");
        }
    }

    #[test]
    fn negative_durations_clamp_to_zero() {
        assert_eq!(parse_go_duration("-5ms").unwrap(), Duration::ZERO);
        assert_eq!(parse_go_duration("-1h30m").unwrap(), Duration::ZERO);
        let args = ReplierArgs::parse_from(normalize_flags(argv(&["replier", "-delay", "-5ms"])));
        assert_eq!(args.delay(), None);
    }

    #[test]
    fn empty_delay_means_none() {
        assert_eq!(parse_delay("").unwrap(), Duration::ZERO);
    }

    #[test]
    fn normalize_rewrites_single_dash_long_flags() {
        let out = normalize_flags(argv(&[
            "requestor", "-subj", "x.y", "-debug", "-s", "nats://h:4222", "-p=9000",
            "-tlscacert=ca.pem", "--delay", "1ms", "--", "-raw",
        ]));
        assert_eq!(
            out,
            argv(&[
                "requestor", "--subj", "x.y", "--debug", "-s", "nats://h:4222", "-p=9000",
                "--tlscacert=ca.pem", "--delay", "1ms", "--", "-raw",
            ])
        );
    }

    #[test]
    fn replier_defaults() {
        let args = ReplierArgs::parse_from(normalize_flags(argv(&["replier"])));
        assert_eq!(args.urls, DEFAULT_URL);
        assert_eq!(args.subject, "demo.requests");
        assert_eq!(args.queue_group, "demo");
        assert_eq!(args.delay(), None);
        assert!(!args.debug);
        assert!(args.client.creds.is_empty());
    }

    #[test]
    fn replier_go_style_flags() {
        let args = ReplierArgs::parse_from(normalize_flags(argv(&[
            "replier", "-qg", "workers", "-delay", "10ms", "-creds", "user.creds", "-debug",
        ])));
        assert_eq!(args.queue_group, "workers");
        assert_eq!(args.delay(), Some(Duration::from_millis(10)));
        assert_eq!(args.client.creds, "user.creds");
        assert!(args.debug);
    }

    #[test]
    fn requestor_positional_subject_overrides_flag() {
        let args = RequestorArgs::parse_from(normalize_flags(argv(&[
            "requestor", "-subj", "a.b", "c.d",
        ])));
        assert_eq!(args.effective_subject(), "c.d");
        assert_eq!(args.port, DEFAULT_METRICS_PORT);

        let args = RequestorArgs::parse_from(normalize_flags(argv(&[
            "requestor", "-subj", "a.b", "c.d", "e.f",
        ])));
        assert_eq!(args.effective_subject(), "a.b");
    }

    #[test]
    fn requestor_zero_delay_is_no_delay() {
        let args =
            RequestorArgs::parse_from(normalize_flags(argv(&["requestor", "-delay", "0", "-p", "9100"])));
        assert_eq!(args.delay(), None);
        assert_eq!(args.port, 9100);
    }

    #[test]
    fn malformed_delay_fails_parsing() {
        let res = RequestorArgs::try_parse_from(normalize_flags(argv(&["requestor", "-delay", "ten"])));
        assert!(res.is_err());
    }
}
