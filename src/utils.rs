use std::time::Duration;

use pom::utf8::{end, is_a, seq, sym, Parser};

use crate::error::Error;

fn duration<'a>() -> Parser<'a, Duration> {
    let number = is_a(|c: char| c.is_ascii_digit())
        .repeat(1..)
        .collect()
        .convert(|digits: &str| digits.parse::<u64>());

    let unit = seq("ms").map(|_| 1u64)
        | sym('s').map(|_| 1_000)
        | sym('m').map(|_| 60_000)
        | sym('h').map(|_| 3_600_000)
        | sym('d').map(|_| 86_400_000);

    let segment = (number + unit).map(|(n, millis)| n.saturating_mul(millis));

    segment
        .repeat(1..)
        .map(|parts| Duration::from_millis(parts.into_iter().fold(0u64, u64::saturating_add)))
        - end()
}

/// Parses durations written as unit-suffixed segments, e.g. `30s`, `5m`, `1h30m`, `250ms`.
pub fn parse_duration(input: &str) -> Result<Duration, Error> {
    duration()
        .parse_str(input.trim())
        .map_err(|e| Error::invalid_parameter(format!("invalid duration '{input}': {e}")))
}

/// Replaces `${NAME}` and `${NAME:-default}` references using `lookup`.
///
/// A reference without a default whose variable is unset is an error.
pub fn interpolate(input: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<String, Error> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);

        let after = &rest[start + 2..];
        let close = after
            .find('}')
            .ok_or_else(|| Error::invalid_parameter("unterminated '${' in config"))?;
        let reference = &after[..close];

        let (name, default) = match reference.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (reference, None),
        };

        if name.is_empty() {
            return Err(Error::invalid_parameter("empty variable name in config"));
        }

        match (lookup(name), default) {
            (Some(value), _) if !value.is_empty() => out.push_str(&value),
            (_, Some(default)) => out.push_str(default),
            (Some(value), None) => out.push_str(&value),
            (None, None) => {
                return Err(Error::invalid_parameter(format!(
                    "environment variable {name} is not set"
                )))
            }
        }

        rest = &after[close + 1..];
    }

    out.push_str(rest);

    Ok(out)
}

/// [`interpolate`] against the process environment.
pub fn interpolate_env(input: &str) -> Result<String, Error> {
    interpolate(input, |name| std::env::var(name).ok())
}
