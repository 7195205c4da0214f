/// Copies cookies captured by a web-view session into the HTTP client's jar
use reqwest::cookie::{CookieStore, Jar};
use std::collections::HashSet;
use tracing::debug;
use url::Url;

use crate::error::{AuthError, Result};
use crate::types::{Cookie, CookieSet};

pub struct CookieBridge;

impl CookieBridge {
    /// Writes every cookie into `jar`, replacing cookies with the same name and
    /// domain. Each cookie is read back afterwards; one the jar refused fails
    /// the whole call, since a partial session is not a session.
    pub fn apply(cookies: &CookieSet, jar: &Jar) -> Result<usize> {
        if cookies.is_empty() {
            return Err(AuthError::auth_failed(format!(
                "no session cookies captured for {}",
                cookies.domain()
            )));
        }

        let effective = last_write_wins(cookies);
        for cookie in &effective {
            validate(cookie)?;
        }

        for cookie in &effective {
            let url = scope_url(&cookie.domain)?;
            jar.add_cookie_str(&set_cookie_line(cookie), &url);
        }

        for cookie in &effective {
            let url = scope_url(&cookie.domain)?;
            if !jar_contains(jar, &url, cookie) {
                return Err(AuthError::auth_failed(format!(
                    "cookie '{}' for {} was rejected by the HTTP client",
                    cookie.name, cookie.domain
                )));
            }
        }

        debug!(
            domain = cookies.domain(),
            count = effective.len(),
            "session cookies propagated"
        );
        crate::metrics::METRICS
            .cookies_propagated_total
            .inc_by(effective.len() as f64);
        Ok(effective.len())
    }

    /// Expires the named cookies so later requests stop carrying the session.
    pub fn revoke(domain: &str, names: &[String], jar: &Jar) -> Result<()> {
        let url = scope_url(domain)?;
        for name in names {
            let line = match domain.strip_prefix('.') {
                Some(parent) => format!("{}=; Domain={}; Path=/; Max-Age=0", name, parent),
                None => format!("{}=; Path=/; Max-Age=0", name),
            };
            jar.add_cookie_str(&line, &url);
        }
        Ok(())
    }
}

fn last_write_wins(cookies: &CookieSet) -> Vec<Cookie> {
    let mut seen = HashSet::new();
    let mut effective: Vec<Cookie> = cookies
        .iter()
        .rev()
        .filter(|c| seen.insert((c.name.clone(), c.domain.to_ascii_lowercase())))
        .cloned()
        .collect();
    effective.reverse();
    effective
}

// RFC 6265 token / cookie-octet rules
fn validate(cookie: &Cookie) -> Result<()> {
    const SEPARATORS: &str = "()<>@,;:\\\"/[]?={} \t";

    let bad_name = cookie.name.is_empty()
        || cookie
            .name
            .chars()
            .any(|c| !c.is_ascii() || c.is_ascii_control() || SEPARATORS.contains(c));
    if bad_name {
        return Err(AuthError::auth_failed(format!(
            "cookie name '{}' is not a valid token",
            cookie.name
        )));
    }

    let bad_value = unquoted(&cookie.value).chars().any(|c| {
        !c.is_ascii() || c.is_ascii_control() || matches!(c, ' ' | '"' | ',' | ';' | '\\')
    });
    if bad_value {
        return Err(AuthError::auth_failed(format!(
            "cookie '{}' has a value the HTTP client cannot carry",
            cookie.name
        )));
    }

    if cookie.domain.trim_start_matches('.').is_empty() {
        return Err(AuthError::auth_failed(format!(
            "cookie '{}' has no domain",
            cookie.name
        )));
    }
    Ok(())
}

fn scope_url(domain: &str) -> Result<Url> {
    let host = domain.trim_start_matches('.');
    Url::parse(&format!("https://{}/", host))
        .map_err(|e| AuthError::auth_failed(format!("invalid cookie domain '{}': {}", domain, e)))
}

// A leading dot widens the cookie to subdomains; otherwise it is host-only.
fn set_cookie_line(cookie: &Cookie) -> String {
    match cookie.domain.strip_prefix('.') {
        Some(parent) => format!(
            "{}={}; Domain={}; Path=/",
            cookie.name, cookie.value, parent
        ),
        None => format!("{}={}; Path=/", cookie.name, cookie.value),
    }
}

fn jar_contains(jar: &Jar, url: &Url, cookie: &Cookie) -> bool {
    let Some(header) = jar.cookies(url) else {
        return false;
    };
    let Ok(header) = header.to_str() else {
        return false;
    };
    header
        .split(';')
        .map(str::trim)
        .filter_map(|pair| pair.split_once('='))
        .any(|(name, value)| name == cookie.name && unquoted(value) == unquoted(&cookie.value))
}

// A cookie value may be wrapped in one pair of double quotes
fn unquoted(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(value)
}
