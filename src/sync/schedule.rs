use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

/// Whether the once-a-day pass should fire at `now`.
///
/// Due once the wall clock has passed `target` on a day that has not synced yet.
pub fn is_due(now: NaiveDateTime, last_sync_date: Option<NaiveDate>, target: NaiveTime) -> bool {
  let synced_today = last_sync_date.is_some_and(|date| date >= now.date());
  !synced_today && now.time() >= target
}
