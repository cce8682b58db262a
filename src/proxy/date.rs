use std::time::SystemTime;

/// Formats `at` as an IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn http_date(at: SystemTime) -> String {
    httpdate::fmt_http_date(at)
}

pub fn http_date_now() -> String {
    http_date(SystemTime::now())
}
