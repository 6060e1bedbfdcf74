use crate::pipeline::{AnalysisPipeline, FleetEntry};
use anyhow::Context;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;

// Reference timezone for analysis dates and the daily trigger: US-Pacific as a
// fixed UTC-8 offset. The trigger tracks a wall-clock approximation of market
// close, not the exchange calendar, so DST drift is accepted.
const REFERENCE_OFFSET_SECS: i32 = -8 * 3600;

// Regenerate shortly after the approximate 13:00 close.
const DAILY_TRIGGER_HOUR: u32 = 13;
const DAILY_TRIGGER_MINUTE: u32 = 10;

// Floor on computed sleeps, guarding against clock anomalies.
const MIN_SLEEP: Duration = Duration::from_secs(10);

fn reference_offset() -> anyhow::Result<FixedOffset> {
    FixedOffset::east_opt(REFERENCE_OFFSET_SECS).context("invalid reference offset")
}

/// Analysis as-of date: an explicit `YYYY-MM-DD` argument, or today in the
/// reference timezone.
pub fn resolve_as_of_date(arg: Option<&str>, now_utc: DateTime<Utc>) -> anyhow::Result<NaiveDate> {
    if let Some(s) = arg {
        return NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .with_context(|| format!("invalid analysis date: {s}"));
    }
    Ok(now_utc.with_timezone(&reference_offset()?).date_naive())
}

/// Time until the next daily trigger: today at the trigger instant in the
/// reference timezone, or tomorrow if that has already passed.
pub fn next_trigger_delay(now_utc: DateTime<Utc>) -> anyhow::Result<Duration> {
    let now_local = now_utc.with_timezone(&reference_offset()?).naive_local();
    let mut target = now_local
        .date()
        .and_hms_opt(DAILY_TRIGGER_HOUR, DAILY_TRIGGER_MINUTE, 0)
        .context("invalid trigger time")?;
    if now_local >= target {
        target += chrono::Duration::days(1);
    }

    let delta = (target - now_local).num_seconds().max(0) as u64;
    Ok(Duration::from_secs(delta).max(MIN_SLEEP))
}

/// Background loop regenerating every post once per day. Failures are logged
/// and the loop recomputes the next trigger; it never exits.
pub async fn run_daily_loop(pipeline: Arc<AnalysisPipeline>) {
    loop {
        let wait = match next_trigger_delay(Utc::now()) {
            Ok(wait) => wait,
            Err(err) => {
                tracing::error!(error = %err, "failed to compute next daily trigger");
                Duration::from_secs(60)
            }
        };
        tracing::info!(sleep_secs = wait.as_secs(), "daily regeneration sleeping until next trigger");
        tokio::time::sleep(wait).await;

        let entries = pipeline.run_all().await;
        let failed = entries
            .iter()
            .filter(|e| matches!(e, FleetEntry::Failed { .. }))
            .count();
        tracing::info!(posts = entries.len(), failed, "daily regeneration finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn explicit_date_argument_wins() {
        let now = Utc.with_ymd_and_hms(2026, 3, 3, 20, 0, 0).unwrap();
        let d = resolve_as_of_date(Some("2026-01-15"), now).unwrap();
        assert_eq!(d, NaiveDate::from_ymd_opt(2026, 1, 15).unwrap());

        assert!(resolve_as_of_date(Some("not-a-date"), now).is_err());
    }

    #[test]
    fn default_date_is_today_in_reference_timezone() {
        // 2026-01-05 06:00 UTC is still 2026-01-04 22:00 in UTC-8.
        let now = Utc.with_ymd_and_hms(2026, 1, 5, 6, 0, 0).unwrap();
        let d = resolve_as_of_date(None, now).unwrap();
        assert_eq!(d, NaiveDate::from_ymd_opt(2026, 1, 4).unwrap());
    }

    #[test]
    fn trigger_later_today_when_not_yet_reached() {
        // 20:00 UTC = 12:00 local; 1h10m until 13:10.
        let now = Utc.with_ymd_and_hms(2026, 3, 3, 20, 0, 0).unwrap();
        let wait = next_trigger_delay(now).unwrap();
        assert_eq!(wait, Duration::from_secs(70 * 60));
    }

    #[test]
    fn trigger_rolls_to_tomorrow_once_passed() {
        // 22:00 UTC = 14:00 local; 23h10m until tomorrow 13:10.
        let now = Utc.with_ymd_and_hms(2026, 3, 3, 22, 0, 0).unwrap();
        let wait = next_trigger_delay(now).unwrap();
        assert_eq!(wait, Duration::from_secs((23 * 60 + 10) * 60));
    }

    #[test]
    fn sleep_never_drops_below_the_floor() {
        // 21:09:55 UTC = 13:09:55 local; 5s to the trigger, floored to 10s.
        let now = Utc.with_ymd_and_hms(2026, 3, 3, 21, 9, 55).unwrap();
        let wait = next_trigger_delay(now).unwrap();
        assert_eq!(wait, Duration::from_secs(10));
    }
}
