//! URL parsing and canonicalization.
//!
//! Turns raw `href` values into canonical sub-URLs (same-domain websites) or
//! `host/path` strings (cross-domain websites), suitable for comparison and
//! storage in a URL list. Resolution is relative to the URL currently being
//! crawled.

use thiserror::Error;
use url::Url;
use xxhash_rust::xxh3::xxh3_64;

/// Characters kept verbatim when escaping an URL; everything else outside the
/// unreserved set is percent-encoded.
const KEEP_VERBATIM: &[char] = &[';', '/', '?', ':', '@', '=', '&', '#', '%'];

#[derive(Debug, Error)]
pub enum UrlError {
    #[error("no domain specified or parsed")]
    NoDomain,
    #[error("empty sub-URL")]
    EmptySubUrl,
    #[error("sub-URL does not start with a slash: {0}")]
    NoLeadingSlash(String),
    #[error("no current URL set")]
    NoCurrentUrl,
    #[error("invalid URL {0:?}: {1}")]
    Invalid(String, url::ParseError),
}

/// Query-parameter filtering mode for discovered links.
#[derive(Debug, Clone, Default)]
pub enum ParamFilter {
    #[default]
    None,
    /// Keep only the listed keys.
    Whitelist(Vec<String>),
    /// Drop the listed keys.
    Blacklist(Vec<String>),
}

impl ParamFilter {
    fn keeps(&self, key: &str) -> bool {
        match self {
            Self::None => true,
            Self::Whitelist(keys) => keys.iter().any(|k| k == key),
            Self::Blacklist(keys) => !keys.iter().any(|k| k == key),
        }
    }
}

/// Resolver for one website. Same-domain websites carry a fixed host and
/// produce sub-URLs beginning with `/`; cross-domain websites parse the host
/// from the current URL and produce `host/path` strings.
#[derive(Debug)]
pub struct UrlResolver {
    domain: Option<String>,
    current_domain: String,
    base: Option<Url>,
    params: ParamFilter,
    max_length: usize,
}

impl UrlResolver {
    /// Create a resolver. `domain` is `None` for cross-domain websites.
    pub fn new(domain: Option<&str>, params: ParamFilter, max_length: usize) -> Self {
        Self {
            domain: domain
                .filter(|d| !d.is_empty())
                .map(|d| d.to_ascii_lowercase()),
            current_domain: String::new(),
            base: None,
            params,
            max_length,
        }
    }

    pub fn is_cross_domain(&self) -> bool {
        self.domain.is_none()
    }

    /// Set the URL currently being crawled. Same-domain URLs begin with `/`;
    /// cross-domain URLs begin with their host.
    pub fn set_current_url(&mut self, current: &str) -> Result<(), UrlError> {
        let (domain, sub_url) = match &self.domain {
            Some(domain) => {
                if current.is_empty() {
                    return Err(UrlError::EmptySubUrl);
                }

                if !current.starts_with('/') {
                    return Err(UrlError::NoLeadingSlash(current.to_owned()));
                }

                (domain.clone(), current.to_owned())
            }
            None => match current.find('/') {
                Some(end) if end > 0 => (
                    current[..end].to_ascii_lowercase(),
                    current[end..].to_owned(),
                ),
                None if !current.is_empty() => (current.to_ascii_lowercase(), "/".to_owned()),
                _ => return Err(UrlError::NoDomain),
            },
        };

        let absolute = format!("https://{}{}", domain, escape_url(&sub_url));

        self.base = Some(
            Url::parse(&absolute).map_err(|source| UrlError::Invalid(absolute, source))?,
        );
        self.current_domain = domain;

        Ok(())
    }

    /// Resolve a raw `href` against the current URL. Returns `Ok(None)` for
    /// links that are empty, use a non-HTTP scheme, point outside the
    /// website's domain, or exceed the configured maximum length.
    pub fn resolve(&self, href: &str) -> Result<Option<String>, UrlError> {
        let base = self.base.as_ref().ok_or(UrlError::NoCurrentUrl)?;

        // strip fragment, trim, repair double-escaped ampersands
        let mut link = match href.find('#') {
            Some(0) => return Ok(None),
            Some(pos) => href[..pos].trim().to_owned(),
            None => href.trim().to_owned(),
        };

        link = link.replace("&amp;", "&");

        if link.is_empty() {
            return Ok(None);
        }

        let link = escape_url(&link);

        let resolved = Url::options()
            .base_url(Some(base))
            .parse(&link)
            .map_err(|source| UrlError::Invalid(link.clone(), source))?;

        if !matches!(resolved.scheme(), "http" | "https") {
            return Ok(None);
        }

        let Some(host) = resolved.host_str() else {
            return Ok(None);
        };

        if let Some(domain) = &self.domain
            && !host.eq_ignore_ascii_case(domain)
        {
            // out-of-domain link on a same-domain website
            return Ok(None);
        }

        let mut result = String::new();

        if self.domain.is_none() {
            result.push_str(&host.to_ascii_lowercase());

            // non-default ports are part of the host in cross-domain mode
            if let Some(port) = resolved.port() {
                result.push(':');
                result.push_str(&port.to_string());
            }
        }

        result.push_str(resolved.path());

        if let Some(query) = resolved.query() {
            let filtered = self.filter_query(query);

            if !filtered.is_empty() {
                result.push('?');
                result.push_str(&filtered);
            }
        }

        if result.len() > self.max_length {
            log::debug!("discarding URL over the configured maximum length: {result}");

            return Ok(None);
        }

        Ok(Some(result))
    }

    /// Filter raw query parameters, preserving their original order and
    /// encoding.
    fn filter_query(&self, query: &str) -> String {
        query
            .split('&')
            .filter(|param| {
                let key = param.split('=').next().unwrap_or(param);

                self.params.keeps(key)
            })
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// Percent-escape a URL while leaving reserved characters (`; / ? : @ = & #
/// %`) intact, so partially-escaped links survive a round trip.
pub fn escape_url(url: &str) -> String {
    let mut result = String::with_capacity(url.len());

    for part in split_keeping(url) {
        match part {
            Piece::Keep(c) => result.push(c),
            Piece::Escape(s) => result.push_str(&urlencoding::encode(s)),
        }
    }

    result
}

enum Piece<'a> {
    Keep(char),
    Escape(&'a str),
}

fn split_keeping(url: &str) -> Vec<Piece<'_>> {
    let mut pieces = Vec::new();
    let mut start = 0;

    for (pos, c) in url.char_indices() {
        if KEEP_VERBATIM.contains(&c) {
            if pos > start {
                pieces.push(Piece::Escape(&url[start..pos]));
            }

            pieces.push(Piece::Keep(c));

            start = pos + c.len_utf8();
        }
    }

    if start < url.len() {
        pieces.push(Piece::Escape(&url[start..]));
    }

    pieces
}

/// Content-addressable hash of a canonical URL string, stored next to the URL
/// for duplicate detection.
pub fn url_hash(url: &str) -> String {
    format!("{:016x}", xxh3_64(url.as_bytes()))
}

/// Whether an `href` appears to point at a file with an extension rather than
/// a page. Used for logging only.
pub fn looks_like_file(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);

    path.rsplit('/')
        .next()
        .is_some_and(|segment| {
            segment
                .rsplit_once('.')
                .is_some_and(|(name, ext)| {
                    !name.is_empty()
                        && !ext.is_empty()
                        && ext.len() <= 5
                        && !ext.eq_ignore_ascii_case("html")
                        && !ext.eq_ignore_ascii_case("htm")
                        && !ext.eq_ignore_ascii_case("php")
                })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn same_domain() -> UrlResolver {
        let mut resolver = UrlResolver::new(Some("example.com"), ParamFilter::None, 2000);

        resolver.set_current_url("/dir/page.html").unwrap();

        resolver
    }

    #[test]
    fn relative_links_resolve_against_current_url() {
        let resolver = same_domain();

        assert_eq!(
            resolver.resolve("other.html").unwrap().as_deref(),
            Some("/dir/other.html")
        );
        assert_eq!(resolver.resolve("/abs").unwrap().as_deref(), Some("/abs"));
        assert_eq!(
            resolver.resolve("../up").unwrap().as_deref(),
            Some("/up")
        );
    }

    #[test]
    fn fragments_and_foreign_schemes_are_dropped() {
        let resolver = same_domain();

        assert_eq!(
            resolver.resolve("/page#section").unwrap().as_deref(),
            Some("/page")
        );
        assert_eq!(resolver.resolve("#top").unwrap(), None);
        assert_eq!(resolver.resolve("mailto:x@example.com").unwrap(), None);
        assert_eq!(resolver.resolve("javascript:void(0)").unwrap(), None);
    }

    #[test]
    fn out_of_domain_links_are_filtered_in_same_domain_mode() {
        let resolver = same_domain();

        assert_eq!(
            resolver.resolve("https://other.com/p").unwrap(),
            None
        );
        assert_eq!(
            resolver.resolve("https://example.com/p").unwrap().as_deref(),
            Some("/p")
        );
    }

    #[test]
    fn cross_domain_blacklist_filters_parameters() {
        let mut resolver = UrlResolver::new(
            None,
            ParamFilter::Blacklist(vec!["utm".to_owned()]),
            2000,
        );

        resolver.set_current_url("example.com/page?x=1&y=2").unwrap();

        assert_eq!(
            resolver
                .resolve("//other.com/p?utm=x&keep=1")
                .unwrap()
                .as_deref(),
            Some("other.com/p?keep=1")
        );
    }

    #[test]
    fn whitelist_keeps_only_listed_parameters_in_order() {
        let mut resolver = UrlResolver::new(
            Some("example.com"),
            ParamFilter::Whitelist(vec!["id".to_owned(), "page".to_owned()]),
            2000,
        );

        resolver.set_current_url("/").unwrap();

        assert_eq!(
            resolver
                .resolve("/p?page=2&track=1&id=7")
                .unwrap()
                .as_deref(),
            Some("/p?page=2&id=7")
        );
    }

    #[test]
    fn ampersand_entities_are_repaired() {
        let mut resolver = UrlResolver::new(Some("example.com"), ParamFilter::None, 2000);

        resolver.set_current_url("/").unwrap();

        assert_eq!(
            resolver.resolve("/p?a=1&amp;b=2").unwrap().as_deref(),
            Some("/p?a=1&b=2")
        );
    }

    #[test]
    fn over_long_urls_are_discarded() {
        let mut resolver = UrlResolver::new(Some("example.com"), ParamFilter::None, 10);

        resolver.set_current_url("/").unwrap();

        assert_eq!(
            resolver
                .resolve("/this-path-is-longer-than-ten-characters")
                .unwrap(),
            None
        );
    }

    #[test]
    fn escape_preserves_reserved_characters() {
        assert_eq!(escape_url("/a b?c=d&e=f"), "/a%20b?c=d&e=f");
        assert_eq!(escape_url("/już?x=1"), "/ju%C5%BC?x=1");
    }

    #[test]
    fn file_extension_heuristic() {
        assert!(looks_like_file("/downloads/report.pdf"));
        assert!(!looks_like_file("/articles/page.html"));
        assert!(!looks_like_file("/articles/section.2/"));
        assert!(!looks_like_file("/plain"));
    }

    #[test]
    fn hashes_are_stable_and_distinct() {
        assert_eq!(url_hash("/a"), url_hash("/a"));
        assert_ne!(url_hash("/a"), url_hash("/b"));
    }
}
