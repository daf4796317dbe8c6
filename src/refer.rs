//! Referer allow-list: a page url passes when its hostname ends with one
//! of the configured suffixes. An empty list means the check is off.

use crate::error::{Result, SessionError};

pub fn check(page_url: &str, allow: &[String]) -> Result<()> {
    if allow.is_empty() {
        return Ok(());
    }

    let host = hostname_of(page_url);
    if allow.iter().any(|suffix| host.ends_with(suffix.as_str())) {
        return Ok(());
    }
    Err(SessionError::RefererDenied(page_url.to_string()))
}

/// Hostname of `scheme://host[:port]/path`, tolerating bare hosts.
fn hostname_of(url: &str) -> &str {
    let rest = match url.find("://") {
        Some(pos) => &url[pos + 3..],
        None => url,
    };
    let rest = rest.split('/').next().unwrap_or(rest);
    rest.split(':').next().unwrap_or(rest)
}
