// =============================================================================
// ET clock & US equity market calendar
// =============================================================================
//
// All session logic is anchored to US/Eastern wall-clock time. Functions take
// the current instant as a parameter so the trade cycle, monitor, and tests
// all reason about the same `now`.
// =============================================================================

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;

/// Regular session open, ET.
pub fn market_open() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 30, 0).expect("static time")
}

/// Regular session close, ET.
pub fn market_close() -> NaiveTime {
    NaiveTime::from_hms_opt(16, 0, 0).expect("static time")
}

/// Convert a UTC instant to US/Eastern.
pub fn to_eastern(now: DateTime<Utc>) -> DateTime<Tz> {
    now.with_timezone(&chrono_tz::US::Eastern)
}

/// The ET calendar date for a UTC instant.
pub fn eastern_date(now: DateTime<Utc>) -> NaiveDate {
    to_eastern(now).date_naive()
}

/// Whether `date` is a trading day (weekday, not a US market holiday).
pub fn is_trading_day(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !is_market_holiday(date)
}

/// Whether the regular session is open at the given instant.
pub fn is_market_hours(now: DateTime<Utc>) -> bool {
    let et = to_eastern(now);
    if !is_trading_day(et.date_naive()) {
        return false;
    }
    let t = et.time();
    t >= market_open() && t < market_close()
}

/// Days to expiration, counted in ET calendar days. Expired contracts yield
/// negative values.
pub fn dte(today: NaiveDate, expiration: NaiveDate) -> i64 {
    (expiration - today).num_days()
}

/// Step forward through Fridays, returning those whose DTE falls inside
/// [min_dte, max_dte], capped at `limit`. A Friday that is a market holiday
/// is replaced by the preceding Thursday, matching listed weekly expirations.
pub fn expiration_fridays(
    today: NaiveDate,
    min_dte: i64,
    max_dte: i64,
    limit: usize,
) -> Vec<NaiveDate> {
    let mut out = Vec::new();

    // First Friday on or after today.
    let days_until_friday =
        (Weekday::Fri.num_days_from_monday() + 7 - today.weekday().num_days_from_monday()) % 7;
    let mut friday = today + chrono::Duration::days(days_until_friday as i64);

    while out.len() < limit {
        let d = dte(today, friday);
        if d > max_dte {
            break;
        }
        if d >= min_dte {
            let expiry = if is_market_holiday(friday) {
                friday - chrono::Duration::days(1)
            } else {
                friday
            };
            out.push(expiry);
        }
        friday += chrono::Duration::days(7);
    }

    out
}

// -----------------------------------------------------------------------------
// US market holidays
// -----------------------------------------------------------------------------

/// Whether `date` is a full-day NYSE holiday (observed dates included).
pub fn is_market_holiday(date: NaiveDate) -> bool {
    market_holidays(date.year()).contains(&date)
}

/// Full-day NYSE holidays for `year`, with weekend observation shifts applied
/// to the fixed-date holidays.
fn market_holidays(year: i32) -> Vec<NaiveDate> {
    let mut days = Vec::with_capacity(10);

    days.push(observed(NaiveDate::from_ymd_opt(year, 1, 1).unwrap()));
    days.push(nth_weekday(year, 1, Weekday::Mon, 3)); // MLK Day
    days.push(nth_weekday(year, 2, Weekday::Mon, 3)); // Presidents' Day
    days.push(good_friday(year));
    days.push(last_weekday(year, 5, Weekday::Mon)); // Memorial Day
    days.push(observed(NaiveDate::from_ymd_opt(year, 6, 19).unwrap())); // Juneteenth
    days.push(observed(NaiveDate::from_ymd_opt(year, 7, 4).unwrap())); // Independence Day
    days.push(nth_weekday(year, 9, Weekday::Mon, 1)); // Labor Day
    days.push(nth_weekday(year, 11, Weekday::Thu, 4)); // Thanksgiving
    days.push(observed(NaiveDate::from_ymd_opt(year, 12, 25).unwrap())); // Christmas

    days
}

/// Shift a fixed-date holiday onto the nearest weekday when it lands on a
/// weekend (Saturday -> Friday, Sunday -> Monday).
fn observed(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - chrono::Duration::days(1),
        Weekday::Sun => date + chrono::Duration::days(1),
        _ => date,
    }
}

/// The n-th given weekday of a month (n is 1-based).
fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u32) -> NaiveDate {
    let first = NaiveDate::from_ymd_opt(year, month, 1).unwrap();
    let offset = (weekday.num_days_from_monday() + 7 - first.weekday().num_days_from_monday()) % 7;
    first + chrono::Duration::days(offset as i64 + 7 * (n as i64 - 1))
}

/// The last given weekday of a month.
fn last_weekday(year: i32, month: u32, weekday: Weekday) -> NaiveDate {
    let first_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1).unwrap()
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1).unwrap()
    };
    let last = first_next - chrono::Duration::days(1);
    let offset = (last.weekday().num_days_from_monday() + 7 - weekday.num_days_from_monday()) % 7;
    last - chrono::Duration::days(offset as i64)
}

/// Good Friday: two days before Easter Sunday (anonymous Gregorian computus).
fn good_friday(year: i32) -> NaiveDate {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = ((h + l - 7 * m + 114) % 31) + 1;
    let easter = NaiveDate::from_ymd_opt(year, month as u32, day as u32).unwrap();
    easter - chrono::Duration::days(2)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn weekends_are_not_trading_days() {
        assert!(!is_trading_day(date(2025, 1, 18))); // Saturday
        assert!(!is_trading_day(date(2025, 1, 19))); // Sunday
        assert!(is_trading_day(date(2025, 1, 17))); // Friday
    }

    #[test]
    fn known_holidays_2025() {
        assert!(is_market_holiday(date(2025, 1, 1))); // New Year's Day
        assert!(is_market_holiday(date(2025, 1, 20))); // MLK Day
        assert!(is_market_holiday(date(2025, 4, 18))); // Good Friday
        assert!(is_market_holiday(date(2025, 5, 26))); // Memorial Day
        assert!(is_market_holiday(date(2025, 7, 4)));
        assert!(is_market_holiday(date(2025, 11, 27))); // Thanksgiving
        assert!(is_market_holiday(date(2025, 12, 25)));
        assert!(!is_market_holiday(date(2025, 1, 17)));
    }

    #[test]
    fn observed_shift_for_weekend_fourth() {
        // July 4 2026 is a Saturday; observed Friday July 3.
        assert!(is_market_holiday(date(2026, 7, 3)));
        assert!(!is_trading_day(date(2026, 7, 3)));
    }

    #[test]
    fn dte_math() {
        assert_eq!(dte(date(2025, 1, 10), date(2025, 1, 17)), 7);
        assert_eq!(dte(date(2025, 1, 17), date(2025, 1, 17)), 0);
        assert_eq!(dte(date(2025, 1, 20), date(2025, 1, 17)), -3);
    }

    #[test]
    fn friday_stepping_respects_dte_band() {
        // From Monday 2025-01-06: Fridays are 01-10 (4), 01-17 (11),
        // 01-24 (18), 01-31 (25), 02-07 (32)...
        let exps = expiration_fridays(date(2025, 1, 6), 7, 30, 5);
        assert_eq!(
            exps,
            vec![date(2025, 1, 17), date(2025, 1, 24), date(2025, 1, 31)]
        );
    }

    #[test]
    fn friday_stepping_honors_limit() {
        let exps = expiration_fridays(date(2025, 1, 6), 0, 60, 2);
        assert_eq!(exps.len(), 2);
    }

    #[test]
    fn holiday_friday_rolls_back_to_thursday() {
        // Good Friday 2025-04-18 -> listed expiry Thursday 04-17.
        let exps = expiration_fridays(date(2025, 4, 14), 0, 7, 5);
        assert_eq!(exps, vec![date(2025, 4, 17)]);
    }

    #[test]
    fn market_hours_window() {
        // 2025-01-17 15:00 UTC == 10:00 ET (EST) — inside the session.
        let inside = Utc.with_ymd_and_hms(2025, 1, 17, 15, 0, 0).unwrap();
        assert!(is_market_hours(inside));

        // 2025-01-17 22:00 UTC == 17:00 ET — after the close.
        let after = Utc.with_ymd_and_hms(2025, 1, 17, 22, 0, 0).unwrap();
        assert!(!is_market_hours(after));

        // Saturday.
        let weekend = Utc.with_ymd_and_hms(2025, 1, 18, 15, 0, 0).unwrap();
        assert!(!is_market_hours(weekend));
    }
}
