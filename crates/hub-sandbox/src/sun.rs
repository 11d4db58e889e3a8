//! Sunrise and sunset using the NOAA general solar position approximation

use std::f64::consts::PI;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};

/// Zenith of the sun's upper limb at rise/set, corrected for refraction
const SUNRISE_ZENITH_DEG: f64 = 90.833;

/// Sunrise and sunset for a date; `None` during polar day or night
pub fn sunrise_sunset(
    date: NaiveDate,
    latitude: f64,
    longitude: f64,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    // Fractional year at solar noon, radians
    let gamma = 2.0 * PI / 365.0 * (date.ordinal0() as f64);

    let eqtime = 229.18
        * (0.000075 + 0.001868 * gamma.cos()
            - 0.032077 * gamma.sin()
            - 0.014615 * (2.0 * gamma).cos()
            - 0.040849 * (2.0 * gamma).sin());

    let decl = 0.006918 - 0.399912 * gamma.cos() + 0.070257 * gamma.sin()
        - 0.006758 * (2.0 * gamma).cos()
        + 0.000907 * (2.0 * gamma).sin()
        - 0.002697 * (3.0 * gamma).cos()
        + 0.00148 * (3.0 * gamma).sin();

    let lat = latitude.to_radians();
    let cos_ha = SUNRISE_ZENITH_DEG.to_radians().cos() / (lat.cos() * decl.cos())
        - lat.tan() * decl.tan();
    if !(-1.0..=1.0).contains(&cos_ha) {
        return None;
    }
    let ha = cos_ha.acos().to_degrees();

    let midnight = date.and_hms_opt(0, 0, 0)?.and_utc();
    let at = |minutes: f64| midnight + Duration::milliseconds((minutes * 60_000.0).round() as i64);

    let sunrise = 720.0 - 4.0 * (longitude + ha) - eqtime;
    let sunset = 720.0 - 4.0 * (longitude - ha) - eqtime;
    Some((at(sunrise), at(sunset)))
}

/// Parse a `[+-]HH:mm` offset, or a plain number of minutes
pub fn parse_offset(text: &str) -> Option<Duration> {
    let text = text.trim();
    if text.is_empty() {
        return Some(Duration::zero());
    }
    let (sign, rest) = match text.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, text.strip_prefix('+').unwrap_or(text)),
    };
    let minutes = match rest.split_once(':') {
        Some((hours, minutes)) => hours.parse::<i64>().ok()? * 60 + minutes.parse::<i64>().ok()?,
        None => rest.parse::<i64>().ok()?,
    };
    Some(Duration::minutes(sign * minutes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_equator_equinox_is_about_six_to_six() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 20).unwrap();
        let (sunrise, sunset) = sunrise_sunset(date, 0.0, 0.0).unwrap();

        let rise_minutes = sunrise.hour() * 60 + sunrise.minute();
        let set_minutes = sunset.hour() * 60 + sunset.minute();
        assert!((345..=375).contains(&rise_minutes), "sunrise at {}", sunrise);
        assert!((1065..=1095).contains(&set_minutes), "sunset at {}", sunset);
    }

    #[test]
    fn test_longitude_shifts_times_west() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 20).unwrap();
        let (greenwich, _) = sunrise_sunset(date, 0.0, 0.0).unwrap();
        let (west, _) = sunrise_sunset(date, 0.0, -15.0).unwrap();
        assert!((3599..=3601).contains(&(west - greenwich).num_seconds()));
    }

    #[test]
    fn test_polar_day_has_no_sunrise() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 21).unwrap();
        assert!(sunrise_sunset(date, 89.0, 0.0).is_none());
    }

    #[test]
    fn test_parse_offset() {
        assert_eq!(parse_offset("-00:30"), Some(Duration::minutes(-30)));
        assert_eq!(parse_offset("+01:15"), Some(Duration::minutes(75)));
        assert_eq!(parse_offset("45"), Some(Duration::minutes(45)));
        assert_eq!(parse_offset(""), Some(Duration::zero()));
        assert_eq!(parse_offset("soon"), None);
    }
}
