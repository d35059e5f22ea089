use crate::provider::session::SessionHandle;
use crate::settings::ScheduleSettings;
use chrono::{Local, NaiveDateTime, NaiveTime};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleAction {
    Open,
    Close,
}

/// Daily open/close thresholds in local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub open: NaiveTime,
    pub close: NaiveTime,
}

impl Schedule {
    pub fn from_settings(settings: &ScheduleSettings) -> Result<Self, String> {
        let (open, close) = settings.thresholds()?;
        Ok(Self { open, close })
    }

    /// The threshold crossed in `(last, now]`, if any. When a long gap
    /// crosses several, the most recent one wins.
    pub fn due(&self, last: NaiveDateTime, now: NaiveDateTime) -> Option<ScheduleAction> {
        if now <= last {
            return None;
        }
        let mut latest: Option<(NaiveDateTime, ScheduleAction)> = None;
        let mut day = last.date();
        while day <= now.date() {
            for (time, action) in [
                (self.open, ScheduleAction::Open),
                (self.close, ScheduleAction::Close),
            ] {
                let at = day.and_time(time);
                if at > last && at <= now && latest.map_or(true, |(t, _)| at >= t) {
                    latest = Some((at, action));
                }
            }
            day = match day.succ_opt() {
                Some(next) => next,
                None => break,
            };
        }
        latest.map(|(_, action)| action)
    }
}

/// What the scheduler drives. Returning false ends the loop.
pub trait ScheduleTarget: Send + 'static {
    fn open(&self) -> bool;
    fn close(&self) -> bool;
}

impl ScheduleTarget for SessionHandle {
    fn open(&self) -> bool {
        self.start_scheduled()
    }

    fn close(&self) -> bool {
        self.stop_scheduled()
    }
}

pub fn spawn(schedule: Schedule, interval: Duration, target: impl ScheduleTarget) -> JoinHandle<()> {
    log::info!(
        "[scheduler] open at {}, close at {}, checking every {}s",
        schedule.open.format("%H:%M"),
        schedule.close.format("%H:%M"),
        interval.as_secs()
    );
    tokio::spawn(run(schedule, interval, target, || Local::now().naive_local()))
}

async fn run<T, C>(schedule: Schedule, interval: Duration, target: T, mut clock: C)
where
    T: ScheduleTarget,
    C: FnMut() -> NaiveDateTime + Send,
{
    let step = chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::minutes(1));
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last: Option<NaiveDateTime> = None;

    loop {
        ticker.tick().await;
        let now = clock();
        let since = last.unwrap_or(now - step);
        let delivered = match schedule.due(since, now) {
            Some(ScheduleAction::Open) => {
                log::info!("[scheduler] opening session at {}", now.format("%H:%M:%S"));
                target.open()
            }
            Some(ScheduleAction::Close) => {
                log::info!("[scheduler] closing session at {}", now.format("%H:%M:%S"));
                target.close()
            }
            None => true,
        };
        if !delivered {
            log::warn!("[scheduler] session is gone; stopping");
            break;
        }
        last = Some(now);
    }
}
