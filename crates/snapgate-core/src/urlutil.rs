//! URL classification and normalization shared by the executor, the
//! crawler, and the static fast path.

use url::Url;

/// File extensions that are never rendered: a crawler asking for an
/// asset gets a trivial empty success instead of a browser round-trip.
const STATIC_EXTENSIONS: &[&str] = &[
    // images
    "png", "jpg", "jpeg", "gif", "webp", "svg", "ico", "bmp", "avif",
    // scripts and styles
    "js", "mjs", "css", "map",
    // fonts
    "woff", "woff2", "ttf", "otf", "eot",
    // archives
    "zip", "tar", "gz", "rar", "7z",
    // media
    "mp3", "mp4", "webm", "ogg", "wav", "avi", "mov",
    // documents
    "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "txt", "csv",
];

/// Path/query markers of payment-provider callbacks. These endpoints
/// mutate order state server-side; rendering them would replay the
/// notification.
const PAYMENT_PATH_MARKERS: &[&str] = &[
    "/pay/callback",
    "/pay/notify",
    "/payment/callback",
    "/payment/notify",
    "/alipay/",
    "/wxpay/",
    "/wechat/pay",
];

const PAYMENT_QUERY_KEYS: &[&str] = &["notify", "notify_id", "trade_no", "out_trade_no"];

/// True if the URL path ends in a known static-asset extension.
pub fn is_static_asset(url: &str) -> bool {
    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_lowercase(),
        // Relative input: strip query/fragment by hand.
        Err(_) => {
            let trimmed = url.split(['?', '#']).next().unwrap_or(url);
            trimmed.to_lowercase()
        }
    };
    match path.rsplit_once('.') {
        Some((_, ext)) => STATIC_EXTENSIONS.contains(&ext),
        None => false,
    }
}

/// True if the URL looks like a payment-provider callback.
pub fn is_payment_callback(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    let path = parsed.path().to_lowercase();
    if PAYMENT_PATH_MARKERS.iter().any(|m| path.contains(m)) {
        return true;
    }
    parsed
        .query_pairs()
        .any(|(key, _)| PAYMENT_QUERY_KEYS.contains(&key.to_lowercase().as_str()))
}

/// Normalize an absolute URL to its site-relative route:
/// path + query + fragment, with a leading slash enforced.
pub fn normalize_route(url: &Url) -> String {
    let mut route = String::from(url.path());
    if route.is_empty() || !route.starts_with('/') {
        route.insert(0, '/');
    }
    if let Some(query) = url.query() {
        route.push('?');
        route.push_str(query);
    }
    if let Some(fragment) = url.fragment() {
        route.push('#');
        route.push_str(fragment);
    }
    route
}

/// Same-domain policy: hostname compared case-insensitively; when the
/// configured domain carries an explicit port, the full host:port must
/// match.
pub fn same_domain(url: &Url, configured: &str) -> bool {
    if !matches!(url.scheme(), "http" | "https") {
        return false;
    }
    let Some(host) = url.host_str() else {
        return false;
    };
    match configured.rsplit_once(':') {
        Some((domain, port)) if port.parse::<u16>().is_ok() => {
            let actual_port = url
                .port_or_known_default()
                .map(|p| p.to_string())
                .unwrap_or_default();
            host.eq_ignore_ascii_case(domain) && actual_port == port
        }
        _ => host.eq_ignore_ascii_case(configured),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_assets_by_extension() {
        assert!(is_static_asset("https://site.example/logo.png"));
        assert!(is_static_asset("https://site.example/app/main.JS"));
        assert!(is_static_asset("https://site.example/font.woff2?v=3"));
        assert!(is_static_asset("/assets/style.css"));
        assert!(!is_static_asset("https://site.example/about"));
        assert!(!is_static_asset("https://site.example/v1.2/page"));
    }

    #[test]
    fn payment_callbacks_by_path_and_query() {
        assert!(is_payment_callback("https://site.example/pay/callback?notify=1"));
        assert!(is_payment_callback("https://site.example/alipay/return"));
        assert!(is_payment_callback(
            "https://site.example/order/done?out_trade_no=42"
        ));
        assert!(!is_payment_callback("https://site.example/pricing"));
    }

    #[test]
    fn route_normalization() {
        let url = Url::parse("https://site.example/docs/intro?lang=en#install").unwrap();
        assert_eq!(normalize_route(&url), "/docs/intro?lang=en#install");

        let bare = Url::parse("https://site.example").unwrap();
        assert_eq!(normalize_route(&bare), "/");
    }

    #[test]
    fn domain_match_is_case_insensitive_on_hostname() {
        let url = Url::parse("https://App.Example.com/a").unwrap();
        assert!(same_domain(&url, "app.example.com"));
        assert!(!same_domain(&url, "other.example.com"));
    }

    #[test]
    fn domain_match_with_explicit_port_requires_port() {
        let on_8080 = Url::parse("http://app.example.com:8080/a").unwrap();
        assert!(same_domain(&on_8080, "app.example.com:8080"));
        assert!(!same_domain(&on_8080, "app.example.com:9090"));

        // Default ports count as the known default.
        let https = Url::parse("https://app.example.com/a").unwrap();
        assert!(same_domain(&https, "app.example.com:443"));
    }

    #[test]
    fn non_http_schemes_never_match() {
        let ftp = Url::parse("ftp://app.example.com/file").unwrap();
        assert!(!same_domain(&ftp, "app.example.com"));
    }
}
