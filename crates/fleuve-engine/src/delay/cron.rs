//! Cron stepping in per-schedule timezones

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

/// Errors from cron evaluation.
#[derive(Debug, thiserror::Error)]
pub enum CronError {
    #[error("invalid cron expression {expression:?}: {message}")]
    InvalidExpression { expression: String, message: String },

    #[error("unknown timezone {0:?}")]
    UnknownTimezone(String),

    #[error("cron expression {0:?} has no future fire time")]
    NoFutureFire(String),
}

/// Next fire strictly after `after`, resolved in the schedule's timezone.
///
/// Stepping always starts from the given instant (in practice: now), never
/// from the previous fire, so arbitrarily long downtime yields exactly one
/// catch-up fire instead of a stampede.
pub fn next_fire(
    expression: &str,
    timezone: Option<&str>,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, CronError> {
    let schedule = parse(expression)?;
    let tz = resolve_timezone(timezone)?;

    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|fire| fire.with_timezone(&Utc))
        .ok_or_else(|| CronError::NoFutureFire(expression.to_string()))
}

/// Validate an expression without evaluating it, for decide-time checks.
pub fn validate(expression: &str, timezone: Option<&str>) -> Result<(), CronError> {
    parse(expression)?;
    resolve_timezone(timezone)?;
    Ok(())
}

fn parse(expression: &str) -> Result<Schedule, CronError> {
    // The cron crate wants a seconds field; accept standard 5-field
    // expressions by pinning seconds to 0.
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };

    Schedule::from_str(&normalized).map_err(|e| CronError::InvalidExpression {
        expression: expression.to_string(),
        message: e.to_string(),
    })
}

fn resolve_timezone(timezone: Option<&str>) -> Result<Tz, CronError> {
    let name = timezone.unwrap_or("UTC");
    Tz::from_str(name).map_err(|_| CronError::UnknownTimezone(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_five_field_expression() {
        let after = Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap();
        let fire = next_fire("0 9 * * *", Some("UTC"), after).unwrap();
        assert_eq!(fire, Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_steps_from_now_not_from_missed_fires() {
        // Two days of downtime: the next fire is computed from `after`,
        // giving one catch-up fire at the next boundary rather than N.
        let after = Utc.with_ymd_and_hms(2024, 6, 3, 10, 0, 0).unwrap();
        let fire = next_fire("0 9 * * *", Some("UTC"), after).unwrap();
        assert_eq!(fire, Utc.with_ymd_and_hms(2024, 6, 4, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_every_five_minutes() {
        let after = Utc.with_ymd_and_hms(2024, 6, 1, 12, 2, 30).unwrap();
        let fire = next_fire("*/5 * * * *", None, after).unwrap();
        assert_eq!(fire, Utc.with_ymd_and_hms(2024, 6, 1, 12, 5, 0).unwrap());
    }

    #[test]
    fn test_timezone_resolution() {
        // 09:00 in New York is 13:00 UTC during DST.
        let after = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let fire = next_fire("0 9 * * *", Some("America/New_York"), after).unwrap();
        assert_eq!(fire, Utc.with_ymd_and_hms(2024, 6, 1, 13, 0, 0).unwrap());
    }

    #[test]
    fn test_invalid_expression() {
        let after = Utc::now();
        assert!(matches!(
            next_fire("not a cron", None, after),
            Err(CronError::InvalidExpression { .. })
        ));
    }

    #[test]
    fn test_unknown_timezone() {
        assert!(matches!(
            validate("0 9 * * *", Some("Mars/Olympus")),
            Err(CronError::UnknownTimezone(_))
        ));
    }

    #[test]
    fn test_validate_ok() {
        assert!(validate("*/5 * * * *", Some("UTC")).is_ok());
    }
}
