//! Utility functions for minishard

use crate::common::config::WaitPolicy;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Parse duration string (e.g., "30s", "5m", "1h", "7d")
pub fn parse_duration(s: &str) -> crate::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let (num_str, unit) = if let Some(num) = s.strip_suffix("ms") {
        (num, "ms")
    } else {
        s.split_at(s.len() - s.chars().last().map_or(0, char::len_utf8))
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let duration = match unit {
        "ms" => Duration::from_millis(num),
        "s" => Duration::from_secs(num),
        "m" => Duration::from_secs(num * 60),
        "h" => Duration::from_secs(num * 3600),
        "d" => Duration::from_secs(num * 86400),
        _ => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };

    Ok(duration)
}

/// Poll `done` until it reports true, backing off between attempts.
///
/// Returns `Error::Shutdown` as soon as `cancel` fires. Errors from `done`
/// abort the wait and are returned unchanged.
pub async fn wait_until<F, Fut>(
    what: &str,
    policy: WaitPolicy,
    cancel: &CancellationToken,
    mut done: F,
) -> crate::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = crate::Result<bool>>,
{
    let mut delay = policy.initial();
    let mut polls: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(crate::Error::Shutdown(what.to_string()));
        }
        if done().await? {
            if polls > 0 {
                tracing::debug!(wait = what, polls, "Wait finished");
            }
            return Ok(());
        }
        polls += 1;

        // Small jitter keeps a fleet of waiters from polling in lockstep.
        let jitter = Duration::from_millis(rand::random::<u64>() % (policy.initial_ms + 1));
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(crate::Error::Shutdown(what.to_string()));
            }
            _ = tokio::time::sleep(delay + jitter) => {}
        }
        delay = (delay * 2).min(policy.max());
    }
}

/// Build the instance id for this process: `{ip}@-@{pid}`, plus an optional suffix.
pub fn instance_id(server_ip: &str, suffix: Option<&str>) -> String {
    let base = format!("{}{}{}", server_ip, INSTANCE_DELIMITER, std::process::id());
    match suffix {
        Some(suffix) => format!("{}{}{}", base, INSTANCE_DELIMITER, suffix),
        None => base,
    }
}

/// Separates the server ip from the rest of an instance id.
pub const INSTANCE_DELIMITER: &str = "@-@";

/// Server ip part of an instance id.
pub fn server_ip_of(instance_id: &str) -> &str {
    instance_id
        .split_once(INSTANCE_DELIMITER)
        .map_or(instance_id, |(ip, _)| ip)
}
