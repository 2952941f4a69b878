use chrono::{DateTime, LocalResult, NaiveDateTime, NaiveTime, TimeDelta, TimeZone, Timelike};
use chrono_tz::Tz;

/// Half-open time interval `[start, end)` in the canonical timezone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: DateTime<Tz>,
    pub end: DateTime<Tz>,
}

impl FetchWindow {
    pub fn contains(&self, timestamp: &DateTime<Tz>) -> bool {
        *timestamp >= self.start && *timestamp < self.end
    }

    pub fn duration(&self) -> TimeDelta {
        self.end.clone() - self.start.clone()
    }
}

/// How the time range of interest is derived from the current instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPolicy {
    /// `[now - lookback, now)`.
    Rolling { lookback: TimeDelta },
    /// The most recently completed bucket, aligned to the wall clock of the
    /// canonical timezone. `bucket_minutes` must divide 1440.
    AlignedBucket { bucket_minutes: u32 },
}

impl WindowPolicy {
    pub fn rolling_minutes(minutes: i64) -> Self {
        WindowPolicy::Rolling {
            lookback: TimeDelta::minutes(minutes),
        }
    }

    pub fn aligned_minutes(bucket_minutes: u32) -> Self {
        WindowPolicy::AlignedBucket { bucket_minutes }
    }

    /// Width of every window this policy produces.
    pub fn span(&self) -> TimeDelta {
        match *self {
            WindowPolicy::Rolling { lookback } => lookback,
            WindowPolicy::AlignedBucket { bucket_minutes } => {
                TimeDelta::minutes(i64::from(bucket_minutes))
            }
        }
    }

    /// Whether fetched rows must be filtered to the window after retrieval.
    pub fn filters_rows(&self) -> bool {
        matches!(self, WindowPolicy::AlignedBucket { .. })
    }

    /// Compute the window for the given instant. Pure: the caller supplies `now`.
    pub fn compute(&self, now: &DateTime<Tz>) -> FetchWindow {
        match *self {
            WindowPolicy::Rolling { lookback } => FetchWindow {
                start: now.clone() - lookback,
                end: now.clone(),
            },
            WindowPolicy::AlignedBucket { bucket_minutes } => {
                let bucket = bucket_minutes.max(1);
                let local = now.naive_local();
                let minute_of_day = local.hour() * 60 + local.minute();
                let floored = minute_of_day - minute_of_day % bucket;

                // Boundaries are wall-clock instants, so a bucket spanning a
                // DST change covers more or less than `bucket` elapsed minutes.
                let end_local = local.date().and_time(NaiveTime::MIN)
                    + TimeDelta::minutes(i64::from(floored));
                let start_local = end_local - TimeDelta::minutes(i64::from(bucket));

                let end = resolve_local(now, end_local).unwrap_or_else(|| {
                    let overshoot = TimeDelta::minutes(i64::from(minute_of_day - floored))
                        + TimeDelta::seconds(i64::from(local.second()))
                        + TimeDelta::nanoseconds(i64::from(local.nanosecond()));
                    now.clone() - overshoot
                });
                let start = resolve_local(&end, start_local)
                    .unwrap_or_else(|| end.clone() - TimeDelta::minutes(i64::from(bucket)));
                FetchWindow { start, end }
            }
        }
    }
}

/// The instant of `naive` in the zone of `reference`, choosing the later
/// candidate not after `reference` when the wall-clock time repeats.
/// `None` when `naive` falls in a DST gap.
fn resolve_local(reference: &DateTime<Tz>, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    match reference.timezone().from_local_datetime(&naive) {
        LocalResult::Single(t) => Some(t),
        LocalResult::Ambiguous(early, late) => Some(if late <= *reference { late } else { early }),
        LocalResult::None => None,
    }
}
