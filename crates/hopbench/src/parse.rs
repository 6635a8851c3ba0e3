//! Throughput extraction from rsync progress output.

use std::fmt;

/// Value logged for an attempted transfer that failed. Distinct from `0`,
/// which means nothing usable was measured.
pub const FAILURE_SENTINEL: f64 = 0.0001;

/// Outcome of reading one transfer's output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    /// Rate in MB/s.
    Rate(f64),
    /// The output reported a closed connection or an error.
    Failed,
    /// A rate was found but exceeds what the link can carry.
    Filtered { rate: f64, bound: f64 },
    /// No rate in the output.
    Missing,
    /// The transfer was killed at its deadline.
    TimedOut,
}

impl Reading {
    /// Number written to the result log.
    pub fn value(&self) -> f64 {
        match *self {
            Reading::Rate(rate) => rate,
            Reading::Failed | Reading::TimedOut => FAILURE_SENTINEL,
            Reading::Filtered { .. } | Reading::Missing => 0.0,
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reading::Rate(rate) => write!(f, "{rate:.2} MB/s"),
            Reading::Failed => f.write_str("failed"),
            Reading::Filtered { rate, bound } => {
                write!(f, "filtered ({rate:.2} MB/s above {bound})")
            }
            Reading::Missing => f.write_str("no rate"),
            Reading::TimedOut => f.write_str("timed out"),
        }
    }
}

/// Reads the transfer rate from `output`.
///
/// Any occurrence of `closed` or `error` marks the attempt as failed. Else
/// the last `<digits>.<digits><k|M>B/s` wins, normalised to MB/s, and is
/// rejected when it exceeds `bound`.
pub fn parse_speed(output: &str, bound: Option<f64>) -> Reading {
    let lower = output.to_ascii_lowercase();
    if lower.contains("closed") || lower.contains("error") {
        return Reading::Failed;
    }
    let Some(rate) = last_rate(output) else {
        return Reading::Missing;
    };
    match bound {
        Some(bound) if rate > bound => {
            tracing::warn!(rate, bound, "measured rate exceeds bound; discarding");
            Reading::Filtered { rate, bound }
        }
        _ => Reading::Rate(rate),
    }
}

/// Last rate in `output`, in MB/s.
pub fn last_rate(output: &str) -> Option<f64> {
    let bytes = output.as_bytes();
    let mut found = None;
    let mut from = 0;
    while let Some(pos) = output[from..].find("B/s") {
        let unit_end = from + pos;
        from = unit_end + 3;
        if let Some(rate) = rate_before(bytes, unit_end) {
            found = Some(rate);
        }
    }
    found
}

/// Parses `<digits>.<digits><k|M>` ending right before `end`.
fn rate_before(bytes: &[u8], end: usize) -> Option<f64> {
    let scale = match end.checked_sub(1).map(|i| bytes[i])? {
        b'k' => 1000.0,
        b'M' => 1.0,
        _ => return None,
    };
    let num_end = end - 1;
    let frac_start = digits_start(bytes, num_end);
    if frac_start == num_end || frac_start == 0 || bytes[frac_start - 1] != b'.' {
        return None;
    }
    let dot = frac_start - 1;
    let int_start = digits_start(bytes, dot);
    if int_start == dot {
        return None;
    }
    // the slice is ASCII digits and one dot
    let text = std::str::from_utf8(&bytes[int_start..num_end]).ok()?;
    text.parse::<f64>().ok().map(|v| v / scale)
}

fn digits_start(bytes: &[u8], end: usize) -> usize {
    let mut i = end;
    while i > 0 && bytes[i - 1].is_ascii_digit() {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROGRESS: &str = "\r     32,768   0%    0.00kB/s    0:00:00\r\
        104,857,600 100%   12.34MB/s    0:00:08 (xfr#1, to-chk=0/1)\n\
        sent 104,883,318 bytes  received 35 bytes  5.00MB/s\n";

    #[test]
    fn last_match_wins() {
        assert_eq!(parse_speed("12.34MB/s then 5.00MB/s", None), Reading::Rate(5.0));
        assert_eq!(parse_speed(PROGRESS, None), Reading::Rate(5.0));
    }

    #[test]
    fn kilobytes_are_normalised() {
        let reading = parse_speed("  800.00kB/s", None);
        assert!((reading.value() - 0.8).abs() < 1e-9);
    }

    #[test]
    fn error_markers_yield_sentinel() {
        for text in [
            "rsync error: unexplained error (code 255)",
            "Connection CLOSED by remote host",
            "ERROR",
        ] {
            let reading = parse_speed(text, None);
            assert_eq!(reading, Reading::Failed);
            assert_eq!(reading.value(), FAILURE_SENTINEL);
            assert!(reading.value() > 0.0);
        }
        // the marker beats an earlier rate
        assert_eq!(parse_speed("1.00MB/s\nconnection closed", None), Reading::Failed);
    }

    #[test]
    fn bound_filters_implausible_rates() {
        assert_eq!(
            parse_speed("15.0MB/s", Some(10.0)),
            Reading::Filtered { rate: 15.0, bound: 10.0 }
        );
        assert_eq!(parse_speed("15.0MB/s", Some(10.0)).value(), 0.0);
        assert_eq!(parse_speed("9.5MB/s", Some(10.0)), Reading::Rate(9.5));
        assert_eq!(parse_speed("10.0MB/s", Some(10.0)), Reading::Rate(10.0));
    }

    #[test]
    fn no_rate_is_zero() {
        assert_eq!(parse_speed("", None), Reading::Missing);
        assert_eq!(parse_speed("sent 10 bytes", None).value(), 0.0);
        // malformed rates are ignored
        assert_eq!(last_rate("12MB/s .5MB/s 3.GB/s 4.0GB/s"), None);
    }

    #[test]
    fn timeout_reads_as_failure() {
        assert_eq!(Reading::TimedOut.value(), FAILURE_SENTINEL);
    }
}
