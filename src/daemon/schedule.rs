use chrono::{DateTime, Days, Local, NaiveTime, TimeZone};
use log::info;

use crate::daemon::{ScanReason, ScanTrigger};

/// First occurrence of the local time `at` strictly after `after`.
pub fn next_daily_run<Tz: TimeZone>(after: &DateTime<Tz>, at: NaiveTime) -> DateTime<Tz> {
    let tz = after.timezone();
    let mut day = after.date_naive();
    // a DST gap can swallow `at` on one day, never on two in a row
    for _ in 0..3 {
        if let Some(candidate) = tz.from_local_datetime(&day.and_time(at)).earliest()
            && candidate > *after
        {
            return candidate;
        }
        day = match day.checked_add_days(Days::new(1)) {
            Some(d) => d,
            None => break,
        };
    }
    after.clone() + chrono::Duration::days(1)
}

/// Fire a scheduled scan on every account once a day at `at` (local time).
pub async fn run_daily(trigger: ScanTrigger, at: NaiveTime) {
    let mut after = Local::now();
    loop {
        let next = next_daily_run(&after, at);
        info!("Next scheduled cache update at {next}");

        let wait = (next - Local::now()).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;

        info!("Running scheduled cache update at {}", at.format("%H:%M"));
        trigger.fire(ScanReason::Scheduled);
        after = next.max(Local::now());
    }
}
