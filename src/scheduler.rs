//! Midnight rollover task

use std::time::Duration;

use chrono::{DateTime, NaiveTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::{error, info};

use crate::service::TrafficService;

/// First instant of the next local calendar day.
///
/// Where midnight does not exist locally (DST gap) the first valid instant
/// after it is used; an ambiguous midnight resolves to the earlier one.
pub fn next_local_midnight(now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let today = now.with_timezone(&tz).date_naive();
    let Some(tomorrow) = today.succ_opt() else {
        return now + TimeDelta::days(1);
    };
    (0..=3)
        .filter_map(|hour| NaiveTime::from_hms_opt(hour, 0, 0))
        .find_map(|time| tz.from_local_datetime(&tomorrow.and_time(time)).earliest())
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(|| now + TimeDelta::days(1))
}

/// Spawn the task that rolls the day over at each local midnight
pub fn start_rollover_scheduler(service: TrafficService) {
    tokio::spawn(async move {
        let tz = service.settings().tz;
        info!("Rollover scheduler started ({})", tz);
        loop {
            let now = Utc::now();
            let next = next_local_midnight(now, tz);
            // A few seconds past midnight so "today" is unambiguously the new day
            let wait = (next - now + TimeDelta::seconds(5))
                .to_std()
                .unwrap_or(Duration::from_secs(60));
            info!("Next rollover at {}", next.with_timezone(&tz));
            tokio::time::sleep(wait).await;

            match service.rollover().await {
                Ok(report) => info!(
                    "Scheduled rollover ({}): {} ports, {} clients closed",
                    report.mode, report.closed_ports, report.closed_clients
                ),
                Err(e) => error!("Scheduled rollover failed: {}", e),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_next_midnight_in_local_zone() {
        // 2024-05-10 12:00 Shanghai
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 4, 0, 0).unwrap();
        let next = next_local_midnight(now, chrono_tz::Asia::Shanghai);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 10, 16, 0, 0).unwrap());
    }

    #[test]
    fn test_next_midnight_just_after_midnight() {
        // 00:00:01 Shanghai waits a full day
        let now = Utc.with_ymd_and_hms(2024, 5, 9, 16, 0, 1).unwrap();
        let next = next_local_midnight(now, chrono_tz::Asia::Shanghai);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 10, 16, 0, 0).unwrap());
    }

    #[test]
    fn test_midnight_skipped_by_dst() {
        // Santiago springs forward at midnight on 2024-09-08, 00:00 does not exist
        let now = Utc.with_ymd_and_hms(2024, 9, 7, 15, 0, 0).unwrap();
        let next = next_local_midnight(now, chrono_tz::America::Santiago);
        let local = next.with_timezone(&chrono_tz::America::Santiago);
        assert_eq!(local.date_naive(), chrono::NaiveDate::from_ymd_opt(2024, 9, 8).unwrap());
        assert_eq!(local.hour(), 1);
        assert!(next > now);
    }
}
