/*!
URL helpers shared by citation normalization and domain matching.
*/

/// Bare hostname of a URL or bare domain string: scheme, `www.`, port,
/// path, query and fragment all removed, lowercased.
pub fn hostname(url: &str) -> Option<String> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return None;
    }

    let without_scheme = trimmed
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(trimmed);

    let host_part = without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();

    // Drop userinfo and port
    let host_part = host_part
        .rsplit_once('@')
        .map(|(_, host)| host)
        .unwrap_or(host_part);
    let host_part = host_part.split(':').next().unwrap_or_default();

    let host = host_part
        .strip_prefix("www.")
        .unwrap_or(host_part)
        .to_lowercase();

    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Display form of a citation URL: scheme, `www.` and query/fragment
/// stripped, path kept.
pub fn strip_url(url: &str) -> String {
    let trimmed = url.trim();
    let without_scheme = trimmed
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(trimmed);

    let without_query = without_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or_default();

    let stripped = without_query
        .strip_prefix("www.")
        .unwrap_or(without_query);

    stripped.trim_end_matches('/').to_string()
}

/// Distinct hostnames of `urls`, first-seen order preserved.
pub fn distinct_hostnames<'a, I>(urls: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for url in urls {
        if let Some(host) = hostname(url) {
            if seen.insert(host.clone()) {
                out.push(host);
            }
        }
    }
    out
}
