use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};

use super::SyncError;

/// Spacing of realtime files published by the provider
pub const REALTIME_WINDOW_MINUTES: i64 = 5;

/// Start times of every realtime window from a snapshot day up to a cutoff.
///
/// Windows start at midnight UTC of the snapshot day and are yielded while
/// they start before the cutoff, so the last one may begin at most one
/// window before it.
#[derive(Debug, Clone)]
pub struct CatchUpPlan {
    cursor: DateTime<Utc>,
    until: DateTime<Utc>,
}

impl CatchUpPlan {
    /// `snapshot_date` is the watermark's `YYYYMMDD` day
    pub fn new(snapshot_date: &str, until: DateTime<Utc>) -> Result<Self, SyncError> {
        let day = NaiveDate::parse_from_str(snapshot_date, "%Y%m%d").map_err(|e| {
            SyncError::InvalidWatermark(format!("snapshot date '{snapshot_date}': {e}"))
        })?;

        Ok(Self {
            cursor: day.and_time(NaiveTime::MIN).and_utc(),
            until,
        })
    }
}

impl Iterator for CatchUpPlan {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.until {
            return None;
        }
        let window = self.cursor;
        self.cursor = window + Duration::minutes(REALTIME_WINDOW_MINUTES);
        Some(window)
    }
}

/// What a completed catch-up replayed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatchUpReport {
    pub windows: usize,
    pub records: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn midnight() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_windows_cover_partial_interval() {
        let now = midnight() + Duration::minutes(17);
        let windows: Vec<_> = CatchUpPlan::new("20240501", now).unwrap().collect();

        assert_eq!(windows.len(), 4);
        assert_eq!(windows[0], midnight());
        assert_eq!(windows[3], midnight() + Duration::minutes(15));
        assert!(windows.windows(2).all(|pair| pair[1] - pair[0] == Duration::minutes(5)));
        assert!(windows.iter().all(|w| *w <= now));
    }

    #[test]
    fn test_window_count_is_ceiling_of_elapsed_minutes() {
        for elapsed in [1i64, 5, 6, 15, 299, 300, 1439] {
            let now = midnight() + Duration::minutes(elapsed);
            let count = CatchUpPlan::new("20240501", now).unwrap().count() as i64;
            assert_eq!(count, (elapsed + 4) / 5, "elapsed {elapsed} minutes");
        }
    }

    #[test]
    fn test_no_windows_at_or_before_midnight() {
        assert_eq!(CatchUpPlan::new("20240501", midnight()).unwrap().count(), 0);
        let earlier = midnight() - Duration::hours(1);
        assert_eq!(CatchUpPlan::new("20240501", earlier).unwrap().count(), 0);
    }

    #[test]
    fn test_invalid_date_is_rejected() {
        assert!(matches!(
            CatchUpPlan::new("2024-05-01", midnight()),
            Err(SyncError::InvalidWatermark(_))
        ));
        assert!(CatchUpPlan::new("", midnight()).is_err());
    }
}
