//! Canonicalization of URLs against the configured public addresses.

use url::{Position, Url};

use crate::config::{ServerConfig, url_authority};

/// Rewrite URLs on an alt domain to the main public address.
///
/// URLs on the main address and foreign URLs are returned unchanged.
pub fn normalize_local_url(server: &ServerConfig, raw: &str) -> String {
    let Ok(parsed) = Url::parse(raw) else {
        return raw.to_string();
    };
    let Some(authority) = authority_of(&parsed) else {
        return raw.to_string();
    };

    if server.public_host().as_deref() == Some(authority.as_str()) {
        return raw.to_string();
    }

    let on_alt_domain = server
        .alt_addresses()
        .any(|alt| url_authority(alt).as_deref() == Some(authority.as_str()));
    if !on_alt_domain {
        return raw.to_string();
    }

    format!("{}{}", server.public_address(), &parsed[Position::BeforePath..])
}

/// True when `raw` is served by this process (main, short or alt address).
pub fn is_local_url(server: &ServerConfig, raw: &str) -> bool {
    host_matches(server, raw, true)
}

/// True when `raw` lives on the main or short public address.
pub fn is_public_or_short_url(server: &ServerConfig, raw: &str) -> bool {
    host_matches(server, raw, false)
}

fn host_matches(server: &ServerConfig, raw: &str, include_alt: bool) -> bool {
    let Some(authority) = Url::parse(raw).ok().as_ref().and_then(authority_of) else {
        return false;
    };

    if server.public_host().as_deref() == Some(authority.as_str())
        || server.short_host().as_deref() == Some(authority.as_str())
    {
        return true;
    }

    include_alt
        && server
            .alt_addresses()
            .any(|alt| url_authority(alt).as_deref() == Some(authority.as_str()))
}

fn authority_of(parsed: &Url) -> Option<String> {
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let host = parsed.host_str()?.to_ascii_lowercase();
    Some(match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    })
}

/// Percent-decode a URL for comparisons; invalid escapes leave it as is.
pub fn unescape(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

/// Path-unescaped, case-insensitive URL equality.
pub fn same_url(a: &str, b: &str) -> bool {
    unescape(a).eq_ignore_ascii_case(&unescape(b))
}

/// Whether the string is an absolute http(s) URL with a host.
pub fn is_absolute_http_url(raw: &str) -> bool {
    Url::parse(raw)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
        .unwrap_or(false)
}
