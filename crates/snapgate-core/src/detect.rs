//! Crawler detection by User-Agent signature.
//!
//! The request-routing layer calls [`is_crawler_request`] to decide
//! whether a request should go through the render path at all.

/// Built-in crawler User-Agent substrings, matched case-insensitively.
const DEFAULT_CRAWLER_HEADERS: &[&str] = &[
    "googlebot",
    "bingbot",
    "baiduspider",
    "yandexbot",
    "duckduckbot",
    "slurp",
    "sogou",
    "360spider",
    "bytespider",
    "applebot",
    "facebookexternalhit",
    "twitterbot",
    "linkedinbot",
    "whatsapp",
    "telegrambot",
    "discordbot",
    "slackbot",
    "pinterestbot",
    "semrushbot",
    "ahrefsbot",
    "mj12bot",
    "petalbot",
    "gptbot",
    "ccbot",
];

/// Merge the built-in crawler signatures with a site's custom list.
/// Custom entries are lowercased; duplicates are dropped.
pub fn crawler_headers(extra: &[String]) -> Vec<String> {
    let mut headers: Vec<String> = DEFAULT_CRAWLER_HEADERS
        .iter()
        .map(|s| s.to_string())
        .collect();
    for custom in extra {
        let lowered = custom.trim().to_lowercase();
        if !lowered.is_empty() && !headers.contains(&lowered) {
            headers.push(lowered);
        }
    }
    headers
}

/// True if the User-Agent matches any default or site-custom crawler
/// signature.
pub fn is_crawler_request(user_agent: &str, extra: &[String]) -> bool {
    if user_agent.is_empty() {
        return false;
    }
    let ua = user_agent.to_lowercase();
    DEFAULT_CRAWLER_HEADERS.iter().any(|sig| ua.contains(sig))
        || extra
            .iter()
            .any(|sig| !sig.is_empty() && ua.contains(&sig.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_common_crawlers() {
        assert!(is_crawler_request(
            "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)",
            &[]
        ));
        assert!(is_crawler_request(
            "Mozilla/5.0 (compatible; bingbot/2.0; +http://www.bing.com/bingbot.htm)",
            &[]
        ));
        assert!(is_crawler_request("facebookexternalhit/1.1", &[]));
    }

    #[test]
    fn ignores_regular_browsers() {
        assert!(!is_crawler_request(
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36",
            &[]
        ));
        assert!(!is_crawler_request("", &[]));
    }

    #[test]
    fn site_custom_signatures_extend_the_defaults() {
        let extra = vec!["MyMonitorBot".to_string()];
        assert!(is_crawler_request("MyMonitorBot/1.0", &extra));
        assert!(!is_crawler_request("MyMonitorBot/1.0", &[]));
    }

    #[test]
    fn merged_headers_deduplicate() {
        let merged = crawler_headers(&["Googlebot".to_string(), "custombot".to_string()]);
        assert_eq!(
            merged.iter().filter(|h| h.as_str() == "googlebot").count(),
            1
        );
        assert!(merged.contains(&"custombot".to_string()));
    }
}
