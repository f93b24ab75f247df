use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Errors that can occur during URL validation.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL parsed but names no host.
    #[error("URL has no host")]
    MissingHost,
    /// The URL points to a private/internal IP address.
    #[error("Private IP address not allowed: {0}")]
    PrivateIp(String),
    /// The URL points to localhost.
    #[error("Localhost not allowed")]
    Localhost,
}

/// Validates a feed address before any network I/O.
///
/// The URL must be absolute, use `http` or `https`, and carry a host.
/// With `block_private_networks` set, localhost and private ranges
/// (RFC 1918, link-local, unique local IPv6) are rejected as well, which
/// guards against SSRF when feed URLs come from untrusted OPML files.
///
/// # Examples
///
/// ```
/// use kiosk::util::validate_feed_url;
///
/// assert!(validate_feed_url("https://example.com/feed.xml", false).is_ok());
/// assert!(validate_feed_url("http://127.0.0.1:8080/rss", false).is_ok());
/// assert!(validate_feed_url("http://127.0.0.1:8080/rss", true).is_err());
/// assert!(validate_feed_url("not a url", false).is_err());
/// assert!(validate_feed_url("file:///etc/passwd", false).is_err());
/// ```
pub fn validate_feed_url(url_str: &str, block_private_networks: bool) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    let host = url.host_str().ok_or(UrlValidationError::MissingHost)?;
    if host.is_empty() {
        return Err(UrlValidationError::MissingHost);
    }

    if block_private_networks {
        check_public_host(host)?;
    }

    Ok(url)
}

/// Validates an article link before handing it to the system browser.
///
/// Always applies the private-network check: a link inside a feed is never
/// a reason to open a local service.
pub fn validate_url_for_open(url_str: &str) -> Result<Url, UrlValidationError> {
    validate_feed_url(url_str, true)
}

fn check_public_host(host: &str) -> Result<(), UrlValidationError> {
    if host == "localhost" {
        return Err(UrlValidationError::Localhost);
    }

    // Strip brackets from IPv6 addresses for parsing
    let host_for_parse = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    if let Ok(ip) = host_for_parse.parse::<IpAddr>() {
        if ip.is_loopback() {
            return Err(UrlValidationError::Localhost);
        }
        if is_private_ip(&ip) {
            return Err(UrlValidationError::PrivateIp(ip.to_string()));
        }
    }
    Ok(())
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private() || ipv4.is_loopback() || ipv4.is_link_local() || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => {
            if ipv6.is_loopback() || ipv6.is_unspecified() {
                return true;
            }
            let segments = ipv6.segments();
            // Unique Local (fc00::/7)
            let is_unique_local = (segments[0] & 0xfe00) == 0xfc00;
            // Link-Local (fe80::/10)
            let is_link_local = (segments[0] & 0xffc0) == 0xfe80;
            is_unique_local || is_link_local
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_formed_urls_accepted() {
        assert!(validate_feed_url("https://example.com/feed.xml", false).is_ok());
        assert!(validate_feed_url("http://news.example.org", false).is_ok());
        assert!(validate_feed_url("  https://example.com/rss  ", false).is_ok());
    }

    #[test]
    fn test_malformed_urls_rejected() {
        assert!(matches!(
            validate_feed_url("", false),
            Err(UrlValidationError::InvalidUrl(_))
        ));
        assert!(matches!(
            validate_feed_url("example.com/feed", false),
            Err(UrlValidationError::InvalidUrl(_))
        ));
        assert!(matches!(
            validate_feed_url("http://", false),
            Err(UrlValidationError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_invalid_schemes() {
        assert!(matches!(
            validate_feed_url("file:///etc/passwd", false),
            Err(UrlValidationError::UnsupportedScheme(_))
        ));
        assert!(validate_feed_url("ftp://example.com", false).is_err());
    }

    #[test]
    fn test_local_hosts_allowed_without_policy() {
        assert!(validate_feed_url("http://localhost:3000/feed", false).is_ok());
        assert!(validate_feed_url("http://192.168.1.1/feed", false).is_ok());
    }

    #[test]
    fn test_localhost_rejected_with_policy() {
        assert!(matches!(
            validate_feed_url("http://localhost/feed", true),
            Err(UrlValidationError::Localhost)
        ));
        assert!(validate_feed_url("http://127.0.0.1/feed", true).is_err());
        assert!(validate_feed_url("http://[::1]/feed", true).is_err());
    }

    #[test]
    fn test_private_ips_rejected_with_policy() {
        assert!(validate_feed_url("http://192.168.1.1/feed", true).is_err());
        assert!(validate_feed_url("http://10.0.0.1:3000/feed", true).is_err());
        assert!(validate_feed_url("http://172.16.0.1/feed", true).is_err());
        assert!(validate_feed_url("http://169.254.1.1/feed", true).is_err());
        assert!(validate_feed_url("http://[fe80::1]/feed", true).is_err());
        assert!(validate_feed_url("http://0.0.0.0/feed", true).is_err());
    }

    #[test]
    fn test_open_rejects_local_links() {
        assert!(validate_url_for_open("https://example.com/post/1").is_ok());
        assert!(validate_url_for_open("http://127.0.0.1/admin").is_err());
        assert!(validate_url_for_open("javascript:alert(1)").is_err());
    }
}
