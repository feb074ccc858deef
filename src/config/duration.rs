//! # Durations
//!
//! Parsing of Kubernetes-style duration strings (`30s`, `5m`, `24h`, `1h30m`)
//! and the canonical rendering stored in the `kubevirt.io/duration` annotation.

use anyhow::{anyhow, Result};
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

static DURATION_REGEX: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^(?:(?P<days>\d+)d)?(?:(?P<hours>\d+)h)?(?:(?P<minutes>\d+)m)?(?:(?P<seconds>\d+)s)?$")
        .ok()
});

/// Parse a Kubernetes duration string into a [`Duration`]
///
/// Accepts any combination of `d`, `h`, `m` and `s` components in that order.
/// Zero-length durations are rejected.
pub fn parse_kubernetes_duration(duration_str: &str) -> Result<Duration> {
    let duration_trimmed = duration_str.trim();

    if duration_trimmed.is_empty() {
        return Err(anyhow!("Duration string cannot be empty"));
    }

    let regex = DURATION_REGEX
        .as_ref()
        .ok_or_else(|| anyhow!("Failed to compile duration regex"))?;

    let interval_lower = duration_trimmed.to_lowercase();
    let captures = regex.captures(&interval_lower).ok_or_else(|| {
        anyhow!(
            "Invalid duration format '{}'. Expected format: <number><unit> (e.g., '1m', '24h', '1h30m')",
            duration_trimmed
        )
    })?;

    let mut total_secs: u64 = 0;
    for (group, multiplier) in [("days", 86_400), ("hours", 3_600), ("minutes", 60), ("seconds", 1)] {
        if let Some(value) = captures.name(group) {
            let number: u64 = value.as_str().parse().map_err(|e| {
                anyhow!(
                    "Invalid duration number '{}' in '{}': {}",
                    value.as_str(),
                    duration_trimmed,
                    e
                )
            })?;
            total_secs = number
                .checked_mul(multiplier)
                .and_then(|secs| total_secs.checked_add(secs))
                .ok_or_else(|| anyhow!("Duration '{}' overflows", duration_trimmed))?;
        }
    }

    if total_secs == 0 {
        return Err(anyhow!(
            "Duration must be greater than 0, got '{}'",
            duration_trimmed
        ));
    }

    Ok(Duration::from_secs(total_secs))
}

/// Render a duration the way the cluster tooling prints it (`24h0m0s`, `30m0s`, `45s`)
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let hours = total / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;

    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}
