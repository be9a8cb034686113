//! URL canonicalization.
//!
//! Links extracted from posts are keyed by their normalized form, so the
//! same article shared with different tracking parameters collapses onto one
//! [`crate::model::Link`].

/// Query parameters that never change what a URL points to.
const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "dclid", "mc_cid", "mc_eid", "igshid", "ref_src", "ref_url", "_ga",
    "xtor", "cmpid",
];

/// Turns a raw URL into the key used for deduplication.
pub trait UrlNormalizer: Send + Sync {
    fn normalize(&self, url: &str) -> String;
}

/// Default canonicalization backed by the `url` crate.
///
/// Lower-cases scheme and host, strips a leading `www.`, drops the fragment,
/// drops `utm_*` and known tracking parameters, and trims a trailing slash.
/// Input that does not parse is returned trimmed.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultUrlNormalizer;

impl UrlNormalizer for DefaultUrlNormalizer {
    fn normalize(&self, url: &str) -> String {
        let trimmed = url.trim();
        let Ok(mut parsed) = url::Url::parse(trimmed) else {
            return trimmed.to_string();
        };

        parsed.set_fragment(None);

        if let Some(host) = parsed.host_str().map(str::to_string) {
            if let Some(bare) = host.strip_prefix("www.") {
                if parsed.set_host(Some(bare)).is_err() {
                    return trimmed.to_string();
                }
            }
        }

        if parsed.query().is_some() {
            let kept: Vec<(String, String)> = parsed
                .query_pairs()
                .filter(|(key, _)| !is_tracking_param(key))
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            if kept.is_empty() {
                parsed.set_query(None);
            } else {
                parsed.query_pairs_mut().clear().extend_pairs(kept);
            }
        }

        let mut out = parsed.to_string();
        if parsed.query().is_none() && out.ends_with('/') {
            out.pop();
        }
        out
    }
}

fn is_tracking_param(key: &str) -> bool {
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key)
}

/// Host of a URL without its `www.` prefix.
#[must_use]
pub fn domain_of(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url.trim()).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    Some(host.strip_prefix("www.").map_or_else(|| host.clone(), str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(url: &str) -> String {
        DefaultUrlNormalizer.normalize(url)
    }

    #[test]
    fn strips_tracking_and_fragment() {
        assert_eq!(
            norm("https://www.Example.com/article?utm_source=tw&id=3#comments"),
            "https://example.com/article?id=3"
        );
        assert_eq!(
            norm("https://example.com/a?fbclid=xyz"),
            "https://example.com/a"
        );
    }

    #[test]
    fn trims_trailing_slash() {
        assert_eq!(norm("https://example.com/"), "https://example.com");
        assert_eq!(norm("https://example.com/dir/"), "https://example.com/dir");
    }

    #[test]
    fn unparseable_is_returned_trimmed() {
        assert_eq!(norm("  not a url "), "not a url");
    }

    #[test]
    fn equivalent_urls_collapse() {
        assert_eq!(
            norm("http://www.lemonde.fr/page/?utm_medium=x"),
            norm("http://lemonde.fr/page")
        );
    }

    #[test]
    fn domain_strips_www() {
        assert_eq!(
            domain_of("https://www.lemonde.fr/page").as_deref(),
            Some("lemonde.fr")
        );
        assert_eq!(domain_of("garbage"), None);
    }
}
