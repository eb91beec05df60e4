//! Modified Julian Date and BCD time handling for EIT events (EN 300 468 Annex C).

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};

/// Converts a 16-bit Modified Julian Date into a calendar date.
///
/// Valid for dates from 1900-03-01 onward; returns [`None`] for day counts that do not map to a
/// real date.
pub fn mjd_to_date(mjd: u16) -> Option<NaiveDate> {
    let mjd = f64::from(mjd);
    let year_prime = ((mjd - 15078.2) / 365.25).floor();
    let month_prime = ((mjd - 14956.1 - (year_prime * 365.25).floor()) / 30.6001).floor();
    let day = mjd - 14956.0 - (year_prime * 365.25).floor() - (month_prime * 30.6001).floor();
    let k = if month_prime == 14.0 || month_prime == 15.0 {
        1.0
    } else {
        0.0
    };
    let year = 1900.0 + year_prime + k;
    let month = month_prime - 1.0 - k * 12.0;
    NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
}

/// Converts a calendar date into its 16-bit Modified Julian Date.
pub fn date_to_mjd(date: NaiveDate) -> u16 {
    let year = f64::from(date.year()) - 1900.0;
    let month = f64::from(date.month());
    let day = f64::from(date.day());
    let l = if month <= 2.0 { 1.0 } else { 0.0 };
    (14956.0 + day + ((year - l) * 365.25).floor() + ((month + 1.0 + l * 12.0) * 30.6001).floor())
        as u16
}

fn bcd(byte: u8) -> Option<u32> {
    let high = u32::from(byte >> 4);
    let low = u32::from(byte & 0x0f);
    if high > 9 || low > 9 {
        None
    } else {
        Some(high * 10 + low)
    }
}

/// Decodes the 5-byte EIT start time: 16-bit MJD followed by BCD HHMMSS, interpreted as UTC.
///
/// An all-ones MJD marks an undefined start time.
pub fn decode_start_time(bytes: &[u8; 5]) -> Option<DateTime<Utc>> {
    let mjd = u16::from_be_bytes([bytes[0], bytes[1]]);
    if mjd == 0xffff {
        return None;
    }
    let time = mjd_to_date(mjd)?.and_hms_opt(bcd(bytes[2])?, bcd(bytes[3])?, bcd(bytes[4])?)?;
    Some(Utc.from_utc_datetime(&time))
}

/// Decodes the 3-byte BCD HHMMSS event duration into seconds.
pub fn decode_duration(bytes: &[u8; 3]) -> Option<u32> {
    Some(bcd(bytes[0])? * 3600 + bcd(bytes[1])? * 60 + bcd(bytes[2])?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annex_c_example() {
        // EN 300 468 gives 93/10/13 12:45:00 as MJD 0xC079
        assert_eq!(
            mjd_to_date(0xc079),
            NaiveDate::from_ymd_opt(1993, 10, 13)
        );
        assert_eq!(date_to_mjd(NaiveDate::from_ymd_opt(1993, 10, 13).unwrap()), 0xc079);
    }

    #[test]
    fn unix_epoch() {
        assert_eq!(mjd_to_date(40587), NaiveDate::from_ymd_opt(1970, 1, 1));
    }

    #[test]
    fn mjd_round_trips_from_1900_03_01() {
        // 15079 is 1900-03-01, the first date the conversion is defined for
        for mjd in (15079..=65441).step_by(97) {
            let date = mjd_to_date(mjd).unwrap();
            assert_eq!(date_to_mjd(date), mjd, "round trip failed for MJD {}", mjd);
        }
        assert_eq!(mjd_to_date(15079), NaiveDate::from_ymd_opt(1900, 3, 1));
    }

    #[test]
    fn start_time_decodes_as_utc() {
        let mjd = date_to_mjd(NaiveDate::from_ymd_opt(2026, 8, 1).unwrap());
        let mut bytes = [0u8; 5];
        bytes[..2].copy_from_slice(&mjd.to_be_bytes());
        bytes[2..].copy_from_slice(&[0x20, 0x30, 0x00]);
        let expected = Utc.from_utc_datetime(
            &NaiveDate::from_ymd_opt(2026, 8, 1)
                .unwrap()
                .and_hms_opt(20, 30, 0)
                .unwrap(),
        );
        assert_eq!(decode_start_time(&bytes), Some(expected));
    }

    #[test]
    fn undefined_start_time() {
        assert_eq!(decode_start_time(&[0xff, 0xff, 0x00, 0x00, 0x00]), None);
    }

    #[test]
    fn bad_bcd_is_rejected() {
        let mjd = date_to_mjd(NaiveDate::from_ymd_opt(2026, 8, 1).unwrap());
        let mut bytes = [0u8; 5];
        bytes[..2].copy_from_slice(&mjd.to_be_bytes());
        bytes[2] = 0x2a; // not a BCD digit pair
        assert_eq!(decode_start_time(&bytes), None);
    }

    #[test]
    fn durations_convert_to_seconds() {
        assert_eq!(decode_duration(&[0x01, 0x45, 0x30]), Some(6330));
        assert_eq!(decode_duration(&[0x00, 0x00, 0x00]), Some(0));
        assert_eq!(decode_duration(&[0x0a, 0x00, 0x00]), None);
    }
}
