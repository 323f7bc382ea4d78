//! The daily promotion of tomorrow's banks into today's.

use crate::device::{DeviceId, DeviceState, ManagedDevice, RolloverState};
use crate::writer::{self, PlanWrite, RegisterWriter, WriteError};
use futures::{Stream, StreamExt as _};
use jiff::civil::{self, Date};
use jiff::tz::TimeZone;
use jiff::{Timestamp, Zoned};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RolloverOutcome {
    Promoted,
    /// This calendar day has been rolled over already.
    AlreadyDone,
}

impl<W: RegisterWriter> ManagedDevice<W> {
    /// Promote tomorrow into today and clear tomorrow, on the device and then in the store.
    ///
    /// Happens at most once per `today`. A failed attempt leaves the plan untouched and may be
    /// repeated.
    pub async fn rollover(&self, today: Date) -> Result<RolloverOutcome, WriteError> {
        let mut state = self.state.lock().await;
        if state.rolled_over_on == Some(today) {
            debug!(device = %self.id(), %today, "already rolled over");
            return Ok(RolloverOutcome::AlreadyDone);
        }
        self.rollover.send_replace(RolloverState::RollingOver);
        let result = self.promote_locked(&mut state, today).await;
        self.rollover.send_replace(RolloverState::Idle);
        result?;
        info!(device = %self.id(), %today, "rolled over");
        Ok(RolloverOutcome::Promoted)
    }

    async fn promote_locked(&self, state: &mut DeviceState, today: Date) -> Result<(), WriteError> {
        // Promoting a store that never saw the device would clear what it holds.
        if !state.loaded {
            self.load_locked(state).await?;
        }
        let write = PlanWrite::rollover(state.store.plan());
        writer::write_plan(self.writer(), &write, today).await?;
        state.store.promote_tomorrow();
        state.rolled_over_on = Some(today);
        state.store.publish();
        Ok(())
    }
}

/// Where the scheduler takes the current time from.
pub trait Clock: Clone + Send + Sync + 'static {
    fn now(&self) -> Timestamp;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// When the rollover fires.
#[derive(Clone, Debug)]
pub struct RolloverSchedule {
    /// Local time of day.
    pub at: civil::Time,
    pub time_zone: TimeZone,
    /// Delay between attempts for devices whose rollover failed.
    pub retry_delay: Duration,
}

impl RolloverSchedule {
    pub const DEFAULT_AT: civil::Time = civil::time(0, 0, 30, 0);

    /// The first firing strictly after `now`.
    pub fn next_after(&self, now: Timestamp) -> Result<Zoned, jiff::Error> {
        let now = now.to_zoned(self.time_zone.clone());
        let candidate = now.date().to_datetime(self.at).to_zoned(self.time_zone.clone())?;
        if candidate.timestamp() > now.timestamp() {
            return Ok(candidate);
        }
        now.date().tomorrow()?.to_datetime(self.at).to_zoned(self.time_zone.clone())
    }

    pub fn date_at(&self, now: Timestamp) -> Date {
        now.to_zoned(self.time_zone.clone()).date()
    }

    /// Yields every firing as it happens according to `clock`.
    ///
    /// Each firing follows the previous one, so a firing that became due while the caller was
    /// busy is yielded right away. Of several overdue firings only the latest is yielded.
    pub fn fire_times<C: Clock>(
        &self,
        clock: C,
    ) -> impl Stream<Item = Result<Zoned, jiff::Error>> + Send + use<C> {
        let schedule = self.clone();
        async_stream::stream! {
            let mut last = clock.now();
            loop {
                let mut next = match schedule.next_after(last) {
                    Ok(next) => next,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                loop {
                    match schedule.next_after(next.timestamp()) {
                        Ok(later) if later.timestamp() <= clock.now() => {
                            warn!(missed = %next, "skipping an overdue rollover");
                            next = later;
                        }
                        Ok(_) => break,
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
                let wait = next.timestamp().duration_since(clock.now());
                debug!(next = %next, ?wait, "waiting for the next rollover");
                tokio::time::sleep(Duration::try_from(wait).unwrap_or_default()).await;
                last = next.timestamp();
                yield Ok(next);
            }
        }
    }
}

impl Default for RolloverSchedule {
    fn default() -> Self {
        Self {
            at: Self::DEFAULT_AT,
            time_zone: TimeZone::system(),
            retry_delay: Duration::from_secs(60),
        }
    }
}

/// Roll every device over for `day`, retrying the ones that fail until `current_day` moves on.
///
/// Returns the devices that still were not rolled over when the day ended.
pub async fn roll_over_until_done<W: RegisterWriter>(
    devices: &[Arc<ManagedDevice<W>>],
    day: Date,
    retry_delay: Duration,
    current_day: impl Fn() -> Date,
) -> Vec<DeviceId> {
    let mut pending = devices.iter().collect::<Vec<_>>();
    let mut attempt = 1usize;
    loop {
        let results = futures::future::join_all(pending.iter().map(|d| d.rollover(day))).await;
        pending = pending
            .into_iter()
            .zip(results)
            .filter_map(|(device, result)| match result {
                Ok(outcome) => {
                    debug!(device = %device.id(), ?outcome, attempt);
                    None
                }
                Err(e) => {
                    warn!(
                        message = "rollover failed, will retry",
                        device = %device.id(),
                        attempt,
                        error = (&e as &dyn std::error::Error)
                    );
                    Some(device)
                }
            })
            .collect();
        if pending.is_empty() {
            return Vec::new();
        }
        tokio::time::sleep(retry_delay).await;
        if current_day() != day {
            let abandoned = pending.iter().map(|d| d.id().clone()).collect::<Vec<_>>();
            error!(%day, ?abandoned, "the day ended before these devices could be rolled over");
            return abandoned;
        }
        attempt += 1;
    }
}

/// Run the rollover for `devices` forever, according to `schedule`.
pub async fn run_scheduler<W: RegisterWriter, C: Clock>(
    schedule: RolloverSchedule,
    devices: Vec<Arc<ManagedDevice<W>>>,
    clock: C,
) -> Result<(), jiff::Error> {
    let mut fire_times = std::pin::pin!(schedule.fire_times(clock.clone()));
    while let Some(fired) = fire_times.next().await {
        let day = fired?.date();
        info!(%day, devices = devices.len(), "daily rollover");
        let current_day = || schedule.date_at(clock.now());
        roll_over_until_done(&devices, day, schedule.retry_delay, current_day).await;
    }
    Ok(())
}
