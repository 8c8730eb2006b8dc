//! Human-friendly durations and sizes

use std::time::Duration;

/// Parse `500ms`, `30s`, `1m`, `2m30s`, `1h`; a bare number means seconds
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = input.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(format!("invalid duration '{}' (examples: 30s, 1m, 2m30s)", input));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| format!("invalid number in duration '{}'", input))?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            unit => {
                return Err(format!(
                    "unknown unit '{}' in duration '{}' (use ms, s, m or h)",
                    unit, input
                ))
            }
        };
        total += part;
        rest = &rest[unit_len..];
    }

    Ok(total)
}

/// Short rendering for result lines: `850ms` or `12.3s`
pub fn format_duration(duration: Duration) -> String {
    if duration < Duration::from_secs(1) {
        format!("{}ms", duration.as_millis())
    } else {
        format!("{:.1}s", duration.as_secs_f64())
    }
}

/// Binary-prefixed size: `512 B`, `1.5 KB`, `3.0 MB`
pub fn format_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{} B", bytes);
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let prefix = ['K', 'M', 'G', 'T', 'P', 'E'][exp];
    format!("{:.1} {}B", bytes as f64 / div as f64, prefix)
}
