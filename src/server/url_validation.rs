use crate::error::CacheError;
use std::net::{Ipv4Addr, Ipv6Addr};
use url::{Host, Url};

/// Validate a media URL before the proxy fetches it (SSRF protection).
///
/// Accepts only `http://` and `https://` URLs with a host. Unless
/// `allow_private` is set, IP literals in private or reserved ranges are
/// rejected. Hostnames are accepted without DNS resolution.
///
/// # Errors
/// Returns [`CacheError::InvalidOrigin`] for:
/// - Invalid or relative URLs
/// - Non-HTTP(S) schemes
/// - Blocked IPv4 or IPv6 literals when `allow_private` is false
pub fn validate_media_url(url: &str, allow_private: bool) -> Result<Url, CacheError> {
    let parsed =
        Url::parse(url).map_err(|_| CacheError::InvalidOrigin(format!("Invalid URL: {url}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(CacheError::InvalidOrigin(format!(
                "Scheme '{scheme}' not allowed, only http/https permitted"
            )));
        }
    }

    let host = parsed
        .host()
        .ok_or_else(|| CacheError::InvalidOrigin(format!("No host in URL: {url}")))?;

    if allow_private {
        return Ok(parsed);
    }

    match host {
        Host::Ipv4(ip) if is_blocked_ipv4(ip) => {
            return Err(CacheError::InvalidOrigin(format!(
                "Private or reserved IPv4 address not allowed: {ip}"
            )));
        }
        Host::Ipv6(ip) if is_blocked_ipv6(ip) => {
            return Err(CacheError::InvalidOrigin(format!(
                "Private or reserved IPv6 address not allowed: {ip}"
            )));
        }
        _ => {}
    }

    Ok(parsed)
}

/// Loopback, RFC 1918, link-local (cloud metadata) and the `0.0.0.0/8` block.
fn is_blocked_ipv4(ip: Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.octets()[0] == 0
}

/// Loopback, link-local (`fe80::/10`) and unique-local (`fc00::/7`), plus
/// IPv4-mapped forms of blocked IPv4 addresses.
fn is_blocked_ipv6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_blocked_ipv4(v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xffc0) == 0xfe80
        || (first & 0xfe00) == 0xfc00
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(url: &str) -> Result<Url, CacheError> {
        validate_media_url(url, false)
    }

    // ── Private ranges ──

    #[test]
    fn rejects_loopback_and_rfc1918() {
        assert!(check("http://127.0.0.1/video.mp4").is_err());
        assert!(check("http://10.1.2.3/video.mp4").is_err());
        assert!(check("http://172.16.0.1/video.mp4").is_err());
        assert!(check("http://172.31.255.255/video.mp4").is_err());
        assert!(check("http://192.168.1.10/video.mp4").is_err());
    }

    #[test]
    fn rejects_link_local_metadata() {
        assert!(check("http://169.254.169.254/latest/meta-data/").is_err());
        assert!(check("http://0.0.0.0/video.mp4").is_err());
    }

    #[test]
    fn rejects_private_ipv6() {
        assert!(check("http://[::1]/video.mp4").is_err());
        assert!(check("http://[fe80::1]/video.mp4").is_err());
        assert!(check("http://[fd00::1]/video.mp4").is_err());
        assert!(check("http://[::ffff:127.0.0.1]/video.mp4").is_err());
    }

    #[test]
    fn boundaries_of_172_block() {
        assert!(check("http://172.15.255.255/video.mp4").is_ok());
        assert!(check("http://172.32.0.0/video.mp4").is_ok());
    }

    #[test]
    fn private_allowed_when_enabled() {
        let url = validate_media_url("http://127.0.0.1:8080/video.mp4", true).unwrap();
        assert_eq!(url.port(), Some(8080));
    }

    // ── Public and malformed ──

    #[test]
    fn allows_public_hosts() {
        let url = check("https://cdn.example.com/v/clip.mp4?token=abc").unwrap();
        assert_eq!(url.host_str(), Some("cdn.example.com"));
        assert!(check("https://8.8.8.8/clip.mp4").is_ok());
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(check("ftp://cdn.example.com/clip.mp4").is_err());
        assert!(check("file:///etc/passwd").is_err());
        assert!(validate_media_url("file:///etc/passwd", true).is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(check("").is_err());
        assert!(check("not-a-url").is_err());
        assert!(check("cdn.example.com/clip.mp4").is_err());
    }
}
