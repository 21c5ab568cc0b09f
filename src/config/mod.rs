//! Worker configuration documents.
//!
//! Configurations are stored as versioned JSON documents in the database and
//! deserialized at worker initialization. Invalid configurations refuse to
//! start the worker and surface through the command reply.

use serde::{Deserialize, Serialize};

use crate::datetime::DateResolution;
use crate::net::NetworkConfig;

/// Counter expansion for custom URL templates: `${variable}` runs over
/// `[start, end]` with `step`; an optional alias is the counter value plus
/// `alias_add`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterConfig {
    pub variable: String,
    pub start: i64,
    pub end: i64,
    #[serde(default = "default_step")]
    pub step: i64,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub alias_add: i64,
}

fn default_step() -> i64 {
    1
}

/// A token: a named placeholder resolved from an auxiliary HTTP fetch plus a
/// query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    pub name: String,
    /// Source URL without scheme (fetched over HTTPS).
    pub source: String,
    #[serde(default)]
    pub use_post: bool,
    pub query: i64,
}

/// One archive source speaking the Memento protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    pub name: String,
    /// Timemap URL prefix; the crawled URL is appended.
    pub timemap_url: String,
    /// Memento URL prefix; timestamp and URL are appended.
    pub memento_url: String,
}

/// Policy for the expected-number-of-links consistency check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExpectedPolicy {
    /// Log a warning on mismatch.
    #[default]
    Warn,
    /// Fail the URL when fewer links than expected were found.
    Smaller,
    /// Fail the URL when more links than expected were found.
    Larger,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Start page as a sub-URL (same-domain) or host + path (cross-domain).
    pub start_page: String,
    /// Skip the start page entirely.
    pub start_ignore: bool,
    /// Re-crawl the start page even when already crawled.
    pub recrawl_start: bool,
    /// Manually configured URLs, crawled before the automatic queue.
    pub custom_urls: Vec<String>,
    /// Re-crawl custom URLs even when already crawled.
    pub recrawl_custom: bool,
    /// Use POST for custom URLs and token sources.
    pub custom_use_post: bool,
    pub counters: Vec<CounterConfig>,
    /// Multiply all templates by every counter instead of expanding each
    /// counter within its own template.
    pub counters_global: bool,
    pub tokens: Vec<TokenConfig>,

    /// URL lease duration in seconds.
    pub lock_secs: i64,
    /// Tick retries for the same URL before giving up (-1 = forever).
    pub max_retries: i64,
    pub retry_archive: bool,

    pub network: NetworkConfig,
    pub sleep_idle_ms: u64,

    /// Query ids: URL white/blacklists (RegEx on the canonical URL string).
    pub whitelist_url_queries: Vec<i64>,
    pub blacklist_url_queries: Vec<i64>,
    /// Query ids: content-type white/blacklists (RegEx on `Content-Type`).
    pub whitelist_type_queries: Vec<i64>,
    pub blacklist_type_queries: Vec<i64>,
    /// Query ids: content white/blacklists (any query language).
    pub whitelist_content_queries: Vec<i64>,
    pub blacklist_content_queries: Vec<i64>,
    /// Query ids: link extraction (multi results).
    pub link_queries: Vec<i64>,
    /// Optional query giving the expected number of links.
    pub expected_query: Option<i64>,
    pub expected_policy: ExpectedPolicy,
    /// Optional XPath query checking the page declares itself canonical.
    pub canonical_query: Option<i64>,

    /// Re-serialize HTML through the repair pipeline before storing.
    pub tidy_html: bool,
    /// Log hrefs that appear to point at files with extensions.
    pub log_file_hrefs: bool,

    /// Query-parameter filter for discovered links.
    pub params_whitelist: Vec<String>,
    pub params_blacklist: Vec<String>,
    pub max_url_length: usize,
    pub url_chunk_size: usize,
    /// Run the duplicate-hash check after inserting URLs.
    pub check_duplicate_hashes: bool,

    pub archives: bool,
    pub archive_sources: Vec<ArchiveConfig>,
    /// Bound on `found capture at` redirect hops per memento.
    pub archive_redirect_depth: u32,

    /// Extra log verbosity for per-URL decisions.
    pub verbose: bool,
}

impl CrawlerConfig {
    /// All query ids referenced by this configuration, for preloading.
    pub fn query_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .whitelist_url_queries
            .iter()
            .chain(&self.blacklist_url_queries)
            .chain(&self.whitelist_type_queries)
            .chain(&self.blacklist_type_queries)
            .chain(&self.whitelist_content_queries)
            .chain(&self.blacklist_content_queries)
            .chain(&self.link_queries)
            .copied()
            .collect();

        ids.extend(self.expected_query);
        ids.extend(self.canonical_query);
        ids.extend(self.tokens.iter().map(|token| token.query));
        ids.sort_unstable();
        ids.dedup();

        ids
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            start_page: "/".to_owned(),
            start_ignore: false,
            recrawl_start: false,
            custom_urls: Vec::new(),
            recrawl_custom: false,
            custom_use_post: false,
            counters: Vec::new(),
            counters_global: false,
            tokens: Vec::new(),
            lock_secs: 300,
            max_retries: 5,
            retry_archive: true,
            network: NetworkConfig::default(),
            sleep_idle_ms: 5_000,
            whitelist_url_queries: Vec::new(),
            blacklist_url_queries: Vec::new(),
            whitelist_type_queries: Vec::new(),
            blacklist_type_queries: Vec::new(),
            whitelist_content_queries: Vec::new(),
            blacklist_content_queries: Vec::new(),
            link_queries: Vec::new(),
            expected_query: None,
            expected_policy: ExpectedPolicy::default(),
            canonical_query: None,
            tidy_html: false,
            log_file_hrefs: false,
            params_whitelist: Vec::new(),
            params_blacklist: Vec::new(),
            max_url_length: 2_000,
            url_chunk_size: 500,
            check_duplicate_hashes: false,
            archives: false,
            archive_sources: Vec::new(),
            archive_redirect_depth: 8,
            verbose: false,
        }
    }
}

/// Where an extractor variable takes its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableSource {
    /// A previously-parsed column of the URL's dataset.
    Parsed,
    /// The crawled content of the URL.
    Content,
    /// The URL string itself.
    Url,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableConfig {
    pub name: String,
    pub source: VariableSource,
    /// Parsed column name (source = parsed).
    #[serde(default)]
    pub parsed_column: String,
    /// Query extracting the value (source = content or url).
    #[serde(default)]
    pub query: Option<i64>,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub alias_add: i64,
}

/// One extracted output column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldConfig {
    pub name: String,
    pub query: i64,
    /// Collapse whitespace in the extracted value.
    #[serde(default)]
    pub tidy_text: bool,
    /// Warn when the extracted value is empty.
    #[serde(default)]
    pub warn_empty: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DateTimeQueryConfig {
    pub query: i64,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub locale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    pub variables: Vec<VariableConfig>,
    /// Table (within the list's namespace) holding previously-parsed
    /// columns, for variables with a `parsed` source.
    pub parsed_table: String,
    pub tokens: Vec<TokenConfig>,

    /// Source URL template (without scheme), fetched per page.
    pub source_url: String,
    /// Alternative template for the first page only.
    pub source_url_first: String,
    /// Cookie string template sent with every page fetch.
    pub cookies: String,
    pub use_post: bool,

    /// Paging variable placeholder (e.g. `${p}`), empty for single-page
    /// extraction.
    pub paging_variable: String,
    pub paging_alias: String,
    pub paging_alias_add: i64,
    pub paging_first: i64,
    /// Non-numeric first page value, overriding `paging_first`.
    pub paging_first_string: String,
    pub paging_step: i64,
    /// Boolean query: is there a next page?
    pub paging_is_next_query: Option<i64>,
    /// Single query: value of the next page.
    pub paging_next_query: Option<i64>,
    /// Single query: number of the next page.
    pub paging_number_query: Option<i64>,

    pub id_queries: Vec<i64>,
    pub datetime_queries: Vec<DateTimeQueryConfig>,
    pub fields: Vec<FieldConfig>,

    /// Result-table suffix.
    pub target_table: String,

    pub lock_secs: i64,
    pub cache_size: i64,
    pub network: NetworkConfig,
    pub sleep_idle_ms: u64,
    pub verbose: bool,
}

impl ExtractorConfig {
    /// All query ids referenced by this configuration, for preloading.
    pub fn query_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.id_queries.clone();

        ids.extend(self.variables.iter().filter_map(|variable| variable.query));
        ids.extend(self.tokens.iter().map(|token| token.query));
        ids.extend(self.datetime_queries.iter().map(|dt| dt.query));
        ids.extend(self.fields.iter().map(|field| field.query));
        ids.extend(self.paging_is_next_query);
        ids.extend(self.paging_next_query);
        ids.extend(self.paging_number_query);
        ids.sort_unstable();
        ids.dedup();

        ids
    }
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            variables: Vec::new(),
            parsed_table: String::new(),
            tokens: Vec::new(),
            source_url: String::new(),
            source_url_first: String::new(),
            cookies: String::new(),
            use_post: false,
            paging_variable: String::new(),
            paging_alias: String::new(),
            paging_alias_add: 0,
            paging_first: 0,
            paging_first_string: String::new(),
            paging_step: 1,
            paging_is_next_query: None,
            paging_next_query: None,
            paging_number_query: None,
            id_queries: Vec::new(),
            datetime_queries: Vec::new(),
            fields: Vec::new(),
            target_table: "extracted".to_owned(),
            lock_secs: 300,
            cache_size: 50,
            network: NetworkConfig::default(),
            sleep_idle_ms: 5_000,
            verbose: false,
        }
    }
}

/// The implemented analyzer algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgoKind {
    /// Keyword/category co-occurrence per article.
    Assoc,
    /// Keyword/category co-occurrence grouped by reduced date.
    AssocOverTime,
    /// Article, sentence and token counts per reduced date.
    WordsOverTime,
    /// Distinct article ids of a corpus.
    ExtractIds,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub algo: AlgoKind,

    /// Source target tables (within the list's namespace) the corpora are
    /// built from, one corpus per table.
    pub source_tables: Vec<String>,
    /// Column holding the text to tokenize.
    pub source_text_column: String,
    /// Column holding the article id.
    pub source_id_column: String,
    /// Column holding the article date.
    pub source_datetime_column: String,

    /// RegEx query id matching the keyword (assoc algorithms).
    pub keyword_query: Option<i64>,
    pub category_labels: Vec<String>,
    /// RegEx query ids per category.
    pub category_queries: Vec<i64>,
    /// Co-occurrence window in tokens around each keyword occurrence.
    pub window_size: u64,
    /// Drop tokens outside any date-map entry instead of grouping them under
    /// an empty date.
    pub ignore_empty_date: bool,

    pub resolution: DateResolution,
    /// Emit zero rows for skipped successor dates.
    pub fill_gaps: bool,

    pub target_table: String,
    pub verbose: bool,
}

impl AnalyzerConfig {
    /// All query ids referenced by this configuration, for preloading.
    pub fn query_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.category_queries.clone();

        ids.extend(self.keyword_query);
        ids.sort_unstable();
        ids.dedup();

        ids
    }
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            algo: AlgoKind::WordsOverTime,
            source_tables: Vec::new(),
            source_text_column: "extracted__text".to_owned(),
            source_id_column: "extracted_id".to_owned(),
            source_datetime_column: "extracted_datetime".to_owned(),
            keyword_query: None,
            category_labels: Vec::new(),
            category_queries: Vec::new(),
            window_size: 10,
            ignore_empty_date: false,
            resolution: DateResolution::default(),
            fill_gaps: false,
            target_table: "analyzed".to_owned(),
            verbose: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crawler_config_deserializes_with_defaults() {
        let config: CrawlerConfig = serde_json::from_str("{}").unwrap();

        assert_eq!(config.start_page, "/");
        assert_eq!(config.archive_redirect_depth, 8);
        assert_eq!(config.expected_policy, ExpectedPolicy::Warn);
    }

    #[test]
    fn extractor_config_round_trips() {
        let config = ExtractorConfig {
            paging_variable: "${p}".to_owned(),
            paging_first: 1,
            ..ExtractorConfig::default()
        };

        let body = serde_json::to_string(&config).unwrap();
        let parsed: ExtractorConfig = serde_json::from_str(&body).unwrap();

        assert_eq!(parsed.paging_variable, "${p}");
        assert_eq!(parsed.paging_first, 1);
    }

    #[test]
    fn analyzer_algo_names_are_snake_case() {
        let config: AnalyzerConfig =
            serde_json::from_str(r#"{"algo": "assoc_over_time"}"#).unwrap();

        assert_eq!(config.algo, AlgoKind::AssocOverTime);
    }
}
