use url::Url;

/// Key identifying the host a URL is served from
///
/// The lowercase host name, with the port appended when it is not the
/// scheme's default. Permission records are kept per host key.
///
/// # Examples
///
/// ```
/// use url::Url;
/// use sumi_harvest::url::host_key;
///
/// let url = Url::parse("http://Pub.Example/a").unwrap();
/// assert_eq!(host_key(&url), Some("pub.example".to_string()));
///
/// let url = Url::parse("http://127.0.0.1:8080/").unwrap();
/// assert_eq!(host_key(&url), Some("127.0.0.1:8080".to_string()));
/// ```
pub fn host_key(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_lowercase();
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    })
}

/// `host_key` of a URL string; `None` if it does not parse
pub fn host_key_str(url: &str) -> Option<String> {
    Url::parse(url).ok().as_ref().and_then(host_key)
}

/// Checks a host against a pattern
///
/// `"pub.example"` matches only that host; `"*.pub.example"` matches the
/// bare host and any subdomain. A pattern with a port must match the port
/// too. Comparison ignores ASCII case.
pub fn matches_host_pattern(pattern: &str, host: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let host = host.to_ascii_lowercase();
    if let Some(base) = pattern.strip_prefix("*.") {
        host == base || host.ends_with(&format!(".{}", base))
    } else {
        host == pattern
    }
}

/// True if the URL's host matches any of the patterns
pub fn host_matches_any<S: AsRef<str>>(patterns: &[S], url: &Url) -> bool {
    let (Some(name), Some(key)) = (url.host_str(), host_key(url)) else {
        return false;
    };
    patterns.iter().any(|p| {
        let p = p.as_ref();
        matches_host_pattern(p, &key) || matches_host_pattern(p, name)
    })
}
