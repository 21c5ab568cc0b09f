//! The analyzer module.
//!
//! Analyzers are read-only consumers of prepared corpora: they build
//! per-date / per-article / per-token index structures in memory and emit
//! aggregated rows into algorithm-specific target tables. The worker ticks
//! once per corpus plus once to save.

pub mod assoc;
pub mod assoc_over_time;
pub mod corpus;
pub mod extract_ids;
pub mod words_over_time;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AlgoKind, AnalyzerConfig};
use crate::datetime::DateResolution;
use crate::db::urls::ModuleFlag;
use crate::db::{Database, DbValue, TargetField};
use crate::query::{CompiledQuery, Query, QueryProperties, QueryType};
use crate::supervisor::{ControlState, TickOutcome, WorkerContext, WorkerError, WorkerModule};

pub use corpus::{Corpus, TextMapEntry};

pub const MODULE_NAME: &str = "analyzer";

/// Everything an algorithm needs besides the corpus itself.
pub struct AlgoContext {
    pub keyword: Option<CompiledQuery>,
    pub categories: Vec<(String, CompiledQuery)>,
    pub window: u64,
    pub ignore_empty_date: bool,
    pub resolution: DateResolution,
    pub fill_gaps: bool,
}

impl AlgoContext {
    pub fn category_count(&self) -> usize {
        self.categories.len()
    }

    pub fn matches_keyword(&self, token: &str) -> bool {
        self.keyword
            .as_ref()
            .is_some_and(|query| regex_matches(query, token))
    }

    pub fn matches_category(&self, index: usize, token: &str) -> bool {
        self.categories
            .get(index)
            .is_some_and(|(_, query)| regex_matches(query, token))
    }
}

fn regex_matches(query: &CompiledQuery, token: &str) -> bool {
    match &query.query {
        Query::RegEx(regex) => regex.get_bool(token).unwrap_or(false),
        _ => false,
    }
}

/// Keyword and category positions of one article, possibly accumulated
/// across corpora (`offset` carries the article's length seen so far).
#[derive(Debug, Default, Clone)]
pub struct Associations {
    pub offset: u64,
    pub keyword_positions: Vec<u64>,
    pub category_positions: Vec<Vec<u64>>,
}

impl Associations {
    pub fn with_categories(n: usize) -> Self {
        Self {
            offset: 0,
            keyword_positions: Vec::new(),
            category_positions: vec![Vec::new(); n],
        }
    }

    /// Classify one token at a relative position. A token matching the
    /// keyword never also counts as a category occurrence.
    pub fn process_token(&mut self, ctx: &AlgoContext, position: u64, token: &str) {
        if token.is_empty() {
            return;
        }

        if ctx.matches_keyword(token) {
            self.keyword_positions.push(self.offset + position);

            return;
        }

        for index in 0..ctx.category_count() {
            if ctx.matches_category(index, token) {
                self.category_positions[index].push(self.offset + position);
            }
        }
    }
}

/// Count keyword occurrences and, per occurrence and category, the category
/// occurrences within the window `[occ - w, occ + w]`.
pub(crate) fn count_occurrences(
    associations: &Associations,
    window: u64,
) -> (u64, Vec<u64>) {
    let occurrences = associations.keyword_positions.len() as u64;
    let mut counters = vec![0u64; associations.category_positions.len()];

    for &occurrence in &associations.keyword_positions {
        for (index, positions) in associations.category_positions.iter().enumerate() {
            for &position in positions {
                if position > occurrence + window {
                    break;
                }

                if occurrence < window || position >= occurrence - window {
                    counters[index] += 1;
                }
            }
        }
    }

    (occurrences, counters)
}

/// Gap dates to fill between the previously-emitted date and the current
/// one, empty when gap filling is off or either side is missing.
pub(crate) fn gap_dates_between(
    previous: &Option<String>,
    date: &str,
    ctx: &AlgoContext,
) -> Vec<String> {
    if !ctx.fill_gaps || date.is_empty() {
        return Vec::new();
    }

    match previous {
        Some(previous) if !previous.is_empty() => {
            crate::datetime::date_gap(previous, date, ctx.resolution)
        }
        _ => Vec::new(),
    }
}

/// Target-table column name for a category label.
pub(crate) fn category_column(label: &str) -> String {
    let mut name: String = label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();

    if name.chars().next().is_none_or(|c| c.is_ascii_digit()) {
        name.insert(0, 'c');
    }

    format!("analyzed__{name}")
}

/// Date of an article: the value of the date-map entry covering its first
/// token, or the empty string for date-less articles.
pub(crate) fn date_of(corpus: &Corpus, article: &TextMapEntry) -> String {
    corpus
        .date_map
        .iter()
        .find(|entry| entry.contains(article.pos))
        .map(|entry| entry.value.clone())
        .unwrap_or_default()
}

/// Validate and compile the category configuration. Mismatched label/query
/// list lengths are trimmed with a warning; entries with empty labels are
/// removed with a warning. Non-RegEx queries are a configuration error.
pub fn validate_categories(
    labels: &[String],
    query_ids: &[i64],
    props: &HashMap<i64, QueryProperties>,
    warnings: &mut Vec<String>,
) -> Result<Vec<(String, CompiledQuery)>, WorkerError> {
    if labels.len() != query_ids.len() {
        warnings.push(format!(
            "number of category labels ({}) and queries ({}) differs, \
             trimming to the shorter list",
            labels.len(),
            query_ids.len()
        ));
    }

    let mut categories = Vec::new();

    for (label, &query_id) in labels.iter().zip(query_ids) {
        if label.is_empty() {
            warnings.push("removed category with empty label".to_owned());

            continue;
        }

        let definition = props
            .get(&query_id)
            .ok_or_else(|| WorkerError::Config(format!("unknown query #{query_id}")))?;

        if definition.query_type != QueryType::RegEx {
            return Err(WorkerError::Config(format!(
                "category query #{query_id} must be a RegEx query"
            )));
        }

        categories.push((
            label.clone(),
            CompiledQuery::compile(query_id, definition.clone())?,
        ));
    }

    Ok(categories)
}

/// Tagged algorithm state, keyed by the configured algorithm kind.
pub enum Algo {
    Assoc(assoc::AssocState),
    AssocOverTime(assoc_over_time::AssocOverTimeState),
    WordsOverTime(words_over_time::WordsState),
    ExtractIds(extract_ids::ExtractIdsState),
}

impl Algo {
    pub fn new(kind: AlgoKind) -> Self {
        match kind {
            AlgoKind::Assoc => Self::Assoc(assoc::AssocState::default()),
            AlgoKind::AssocOverTime => {
                Self::AssocOverTime(assoc_over_time::AssocOverTimeState::default())
            }
            AlgoKind::WordsOverTime => {
                Self::WordsOverTime(words_over_time::WordsState::default())
            }
            AlgoKind::ExtractIds => Self::ExtractIds(extract_ids::ExtractIdsState::default()),
        }
    }

    pub fn target_fields(&self, ctx: &AlgoContext) -> Vec<TargetField> {
        match self {
            Self::Assoc(_) => assoc::target_fields(ctx),
            Self::AssocOverTime(_) => assoc_over_time::target_fields(ctx),
            Self::WordsOverTime(_) => words_over_time::target_fields(),
            Self::ExtractIds(_) => extract_ids::target_fields(),
        }
    }

    pub fn process(&mut self, corpus: &Corpus, ctx: &AlgoContext, warnings: &mut Vec<String>) {
        match self {
            Self::Assoc(state) => state.process(corpus, ctx, warnings),
            Self::AssocOverTime(state) => state.process(corpus, ctx, warnings),
            Self::WordsOverTime(state) => state.process(corpus, ctx),
            Self::ExtractIds(state) => state.process(corpus),
        }
    }

    /// Produce the final rows, including gap-fill rows where enabled.
    pub fn finish(&mut self, ctx: &AlgoContext) -> Vec<Vec<(String, DbValue)>> {
        match self {
            Self::Assoc(state) => state.finish(ctx),
            Self::AssocOverTime(state) => state.finish(ctx),
            Self::WordsOverTime(state) => state.finish(ctx),
            Self::ExtractIds(state) => state.finish(),
        }
    }
}

pub struct AnalyzerWorker {
    db: Database,
    state: Arc<ControlState>,
    ns: String,
    config: AnalyzerConfig,
    ctx: AlgoContext,
    algo: Algo,
    target_table: String,
    current_corpus: usize,
    url_ids: Vec<i64>,
    saved: bool,
}

impl AnalyzerWorker {
    pub fn new(
        context: WorkerContext,
        ns: String,
        config: AnalyzerConfig,
        query_props: HashMap<i64, QueryProperties>,
    ) -> Result<Self, WorkerError> {
        let mut warnings = Vec::new();

        let categories = validate_categories(
            &config.category_labels,
            &config.category_queries,
            &query_props,
            &mut warnings,
        )?;

        let keyword = config
            .keyword_query
            .map(|id| {
                let definition = query_props
                    .get(&id)
                    .ok_or_else(|| WorkerError::Config(format!("unknown query #{id}")))?;

                if definition.query_type != QueryType::RegEx {
                    return Err(WorkerError::Config(format!(
                        "keyword query #{id} must be a RegEx query"
                    )));
                }

                Ok(CompiledQuery::compile(id, definition.clone())?)
            })
            .transpose()?;

        for warning in &warnings {
            tracing::warn!(target: "siteharvest::analyzer", "{warning}");
        }

        crate::db::check_identifier(&config.target_table)
            .map_err(|e| WorkerError::Config(e.to_string()))?;

        let ctx = AlgoContext {
            keyword,
            categories,
            window: config.window_size,
            ignore_empty_date: config.ignore_empty_date,
            resolution: config.resolution,
            fill_gaps: config.fill_gaps,
        };

        let algo = Algo::new(config.algo);
        let target_table = format!("{ns}_analyzed_{}", config.target_table);

        Ok(Self {
            db: context.db,
            state: context.state,
            ns,
            config,
            ctx,
            algo,
            target_table,
            current_corpus: 0,
            url_ids: Vec::new(),
            saved: false,
        })
    }

    async fn log(&self, entry: &str) {
        tracing::debug!(target: "siteharvest::analyzer", "{entry}");

        let _ = self.db.add_log(MODULE_NAME, entry).await;
    }
}

impl WorkerModule for AnalyzerWorker {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    async fn init(&mut self, _resumed: bool) -> Result<(), WorkerError> {
        if self.config.source_tables.is_empty() {
            return Err(WorkerError::Config(
                "no corpus source tables configured".to_owned(),
            ));
        }

        let fields = self.algo.target_fields(&self.ctx);

        self.db
            .init_target_table(&self.ns, &self.target_table, &fields)
            .await?;

        Ok(())
    }

    async fn tick(&mut self) -> Result<TickOutcome, WorkerError> {
        let total = self.config.source_tables.len();

        if self.current_corpus < total {
            let source = self.config.source_tables[self.current_corpus].clone();
            let table = format!("{}_{}", self.ns, source);

            self.state.set_status(format!(
                "Identifying occurrences in corpus #{}/{total}...",
                self.current_corpus + 1
            ));

            let rows = self
                .db
                .fetch_corpus_rows(
                    &table,
                    &self.config.source_id_column,
                    &self.config.source_datetime_column,
                    &self.config.source_text_column,
                )
                .await?;

            let corpus = Corpus::from_rows(&rows);

            if corpus.is_empty() {
                self.log(&format!(
                    "WARNING: corpus #{} ({source}) is empty and has been skipped",
                    self.current_corpus + 1
                ))
                .await;
            } else {
                let mut warnings = Vec::new();

                self.url_ids.extend(&corpus.url_ids);
                self.algo.process(&corpus, &self.ctx, &mut warnings);

                for warning in warnings {
                    self.log(&format!("WARNING: {warning}")).await;
                }
            }

            self.current_corpus += 1;
            self.state
                .set_progress(self.current_corpus as f32 / (total + 1) as f32);

            return Ok(TickOutcome::Worked);
        }

        if !self.saved {
            self.state.set_status("Writing results to database...");

            let rows = self.algo.finish(&self.ctx);
            let row_count = rows.len();

            for row in rows {
                self.db.insert_target_row(&self.target_table, &row).await?;
            }

            if row_count > 0 {
                self.db.touch_target(&self.ns, &self.target_table).await?;
            }

            let ids = std::mem::take(&mut self.url_ids);

            self.db
                .set_flag_for_urls(&self.ns, ModuleFlag::Analyzed, &ids)
                .await?;

            self.log(&format!("saved {row_count} result row(s)")).await;

            self.saved = true;
            self.state.set_status("DONE");
            self.state.set_progress(1.0);
            self.state.request_stop();

            return Ok(TickOutcome::Worked);
        }

        Ok(TickOutcome::Idle)
    }

    fn idle_sleep(&self) -> Duration {
        Duration::from_millis(500)
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    pub(crate) fn regex_props(pattern: &str) -> QueryProperties {
        QueryProperties {
            query_type: QueryType::RegEx,
            text: pattern.to_owned(),
            result_bool: true,
            result_single: false,
            result_multi: false,
            result_subsets: false,
            text_only: false,
        }
    }

    pub(crate) fn test_ctx(
        keyword: &str,
        categories: &[(&str, &str)],
        window: u64,
    ) -> AlgoContext {
        AlgoContext {
            keyword: Some(CompiledQuery::compile(1, regex_props(keyword)).unwrap()),
            categories: categories
                .iter()
                .enumerate()
                .map(|(index, (label, pattern))| {
                    (
                        (*label).to_owned(),
                        CompiledQuery::compile(100 + index as i64, regex_props(pattern))
                            .unwrap(),
                    )
                })
                .collect(),
            window,
            ignore_empty_date: false,
            resolution: DateResolution::Day,
            fill_gaps: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{regex_props, test_ctx};
    use super::*;

    #[test]
    fn window_counting_matches_the_contract() {
        // tokens: k a b c k a, keyword k, category matches a, window 2
        let ctx = test_ctx("^k$", &[("cat", "^a$")], 2);
        let mut associations = Associations::with_categories(1);

        for (position, token) in ["k", "a", "b", "c", "k", "a"].iter().enumerate() {
            associations.process_token(&ctx, position as u64, token);
        }

        let (occurrences, counters) = count_occurrences(&associations, 2);

        // each k sees exactly one a within two tokens
        assert_eq!(occurrences, 2);
        assert_eq!(counters, vec![2]);
    }

    #[test]
    fn keyword_tokens_do_not_count_as_categories() {
        let ctx = test_ctx("^x$", &[("cat", "^x$")], 5);
        let mut associations = Associations::with_categories(1);

        associations.process_token(&ctx, 0, "x");

        assert_eq!(associations.keyword_positions.len(), 1);
        assert!(associations.category_positions[0].is_empty());
    }

    #[test]
    fn mismatched_category_lists_are_trimmed_with_warning() {
        let mut props = HashMap::new();

        props.insert(10, regex_props("a"));

        let mut warnings = Vec::new();

        let categories = validate_categories(
            &["one".to_owned(), "two".to_owned()],
            &[10],
            &props,
            &mut warnings,
        )
        .unwrap();

        assert_eq!(categories.len(), 1);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn empty_labels_are_removed_with_warning() {
        let mut props = HashMap::new();

        props.insert(10, regex_props("a"));
        props.insert(11, regex_props("b"));

        let mut warnings = Vec::new();

        let categories = validate_categories(
            &[String::new(), "ok".to_owned()],
            &[10, 11],
            &props,
            &mut warnings,
        )
        .unwrap();

        assert_eq!(categories.len(), 1);
        assert_eq!(categories[0].0, "ok");
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn non_regex_category_is_a_config_error() {
        let mut props = HashMap::new();

        props.insert(
            10,
            QueryProperties {
                query_type: QueryType::XPath,
                text: "//a".to_owned(),
                result_bool: true,
                result_single: false,
                result_multi: false,
                result_subsets: false,
                text_only: false,
            },
        );

        let mut warnings = Vec::new();

        assert!(
            validate_categories(&["x".to_owned()], &[10], &props, &mut warnings).is_err()
        );
    }
}
