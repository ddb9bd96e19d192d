//! Backup date normalisation.

use chrono::{DateTime, Offset, Utc};
use chrono_tz::Tz;

/// Truncate `backup_date` to the granularity boundary as observed in the
/// client's timezone. With a granularity of one day the result is local
/// midnight of that day; with one hour, the start of that local hour. The
/// result is carried as an absolute instant.
pub fn normalize_backup_date(
    backup_date: DateTime<Utc>,
    granularity_seconds: u64,
    tz: Tz,
) -> DateTime<Utc> {
    if granularity_seconds == 0 {
        return backup_date;
    }

    // Floor the local wall-clock time, then resolve it back to an instant.
    let naive = backup_date.with_timezone(&tz).naive_local();
    let ts = naive.and_utc().timestamp();
    let floored = ts - ts.rem_euclid(granularity_seconds as i64);
    let naive_floored = DateTime::from_timestamp(floored, 0)
        .expect("floored timestamp in range")
        .naive_utc();

    match naive_floored.and_local_timezone(tz) {
        chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
        // Ambiguous local time (clocks went back): take the earlier instant.
        chrono::LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        // Nonexistent local time (clocks went forward): fall back to reading
        // the floored wall-clock with the original instant's offset.
        chrono::LocalResult::None => {
            let offset = backup_date.with_timezone(&tz).offset().fix();
            DateTime::<Utc>::from_naive_utc_and_offset(naive_floored - offset, Utc)
        }
    }
}
