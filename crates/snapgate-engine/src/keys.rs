//! Key-value store key layout, namespaced per site.

/// Set of discovered routes.
pub(crate) fn routes(site: &str) -> String {
    format!("site:{site}:routes")
}

/// Hash: route -> serialized `UrlRecord`.
pub(crate) fn url_status(site: &str) -> String {
    format!("site:{site}:urlstatus")
}

/// Hash of site-level aggregate statistics.
pub(crate) fn stats(site: &str) -> String {
    format!("site:{site}:stats")
}

/// Progress counter for one preheat run.
pub(crate) fn preheat_counter(site: &str, task: &uuid::Uuid, field: &str) -> String {
    format!("site:{site}:preheat:{task}:{field}")
}
