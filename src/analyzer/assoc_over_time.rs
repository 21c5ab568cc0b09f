//! Keyword/category co-occurrence over time.
//!
//! Same inputs as the per-article co-occurrence, but grouped by reduced date
//! and summed. With gap filling enabled, zero rows are emitted for skipped
//! successor dates between consecutive groups.

use std::collections::BTreeMap;

use crate::datetime::reduce_date;
use crate::db::{DbValue, TargetField};

use super::{
    AlgoContext, Associations, Corpus, category_column, count_occurrences, date_of,
    gap_dates_between,
};

pub fn target_fields(ctx: &AlgoContext) -> Vec<TargetField> {
    let mut fields = vec![
        TargetField::new("analyzed_date", "TEXT"),
        TargetField::new("analyzed_n", "INTEGER"),
        TargetField::new("analyzed_occurrences", "INTEGER"),
    ];

    for (label, _) in &ctx.categories {
        fields.push(TargetField::new(category_column(label), "INTEGER"));
    }

    fields
}

#[derive(Default)]
pub struct AssocOverTimeState {
    dates: BTreeMap<String, BTreeMap<String, Associations>>,
}

impl AssocOverTimeState {
    pub fn process(&mut self, corpus: &Corpus, ctx: &AlgoContext, warnings: &mut Vec<String>) {
        if corpus.date_map.is_empty() && ctx.ignore_empty_date {
            warnings.push("corpus has no date map and has been skipped".to_owned());

            return;
        }

        for article in &corpus.article_map {
            let date = date_of(corpus, article);

            if ctx.ignore_empty_date && date.is_empty() {
                continue;
            }

            let reduced = if date.is_empty() {
                String::new()
            } else {
                reduce_date(&date, ctx.resolution)
            };

            let associations = self
                .dates
                .entry(reduced)
                .or_default()
                .entry(article.value.clone())
                .or_insert_with(|| Associations::with_categories(ctx.category_count()));

            for (position, token) in corpus.tokens[article.pos..article.end()]
                .iter()
                .enumerate()
            {
                associations.process_token(ctx, position as u64, token);
            }

            associations.offset += article.len as u64;
        }
    }

    pub fn finish(&mut self, ctx: &AlgoContext) -> Vec<Vec<(String, DbValue)>> {
        let mut rows = Vec::new();
        let mut previous: Option<String> = None;

        for (date, articles) in &self.dates {
            if ctx.ignore_empty_date && date.is_empty() {
                continue;
            }

            // zero rows for skipped successor dates
            for missing in gap_dates_between(&previous, date, ctx) {
                rows.push(zero_row(&missing, ctx));
            }

            let mut occurrences = 0u64;
            let mut counters = vec![0u64; ctx.category_count()];

            for associations in articles.values() {
                let (article_occurrences, article_counters) =
                    count_occurrences(associations, ctx.window);

                occurrences += article_occurrences;

                for (counter, count) in counters.iter_mut().zip(article_counters) {
                    *counter += count;
                }
            }

            let mut row = vec![
                ("analyzed_date".to_owned(), DbValue::Text(date.clone())),
                ("analyzed_n".to_owned(), DbValue::Int(articles.len() as i64)),
                (
                    "analyzed_occurrences".to_owned(),
                    DbValue::Int(occurrences as i64),
                ),
            ];

            for ((label, _), count) in ctx.categories.iter().zip(counters) {
                row.push((category_column(label), DbValue::Int(count as i64)));
            }

            rows.push(row);

            if !date.is_empty() {
                previous = Some(date.clone());
            }
        }

        self.dates.clear();

        rows
    }
}

fn zero_row(date: &str, ctx: &AlgoContext) -> Vec<(String, DbValue)> {
    let mut row = vec![
        ("analyzed_date".to_owned(), DbValue::Text(date.to_owned())),
        ("analyzed_n".to_owned(), DbValue::Int(0)),
        ("analyzed_occurrences".to_owned(), DbValue::Int(0)),
    ];

    for (label, _) in &ctx.categories {
        row.push((category_column(label), DbValue::Int(0)));
    }

    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::corpus::TextMapEntry;
    use crate::analyzer::testutil::test_ctx;
    use crate::datetime::DateResolution;

    fn corpus(entries: &[(&str, &str, &[&str])]) -> Corpus {
        let mut corpus = Corpus::default();

        for (article, date, tokens) in entries {
            let start = corpus.tokens.len();

            corpus
                .tokens
                .extend(tokens.iter().map(|t| (*t).to_owned()));

            let len = corpus.tokens.len() - start;

            corpus
                .article_map
                .push(TextMapEntry::new(start, len, *article));
            corpus.date_map.push(TextMapEntry::new(start, len, *date));
        }

        corpus
    }

    #[test]
    fn groups_sum_by_reduced_date() {
        let mut ctx = test_ctx("^k$", &[("cat", "^a$")], 2);

        ctx.resolution = DateResolution::Month;

        let mut state = AssocOverTimeState::default();
        let mut warnings = Vec::new();

        state.process(
            &corpus(&[
                ("a1", "2020-01-05", &["k", "a"]),
                ("a2", "2020-01-20", &["k", "a"]),
                ("a3", "2020-02-01", &["k"]),
            ]),
            &ctx,
            &mut warnings,
        );

        let rows = state.finish(&ctx);

        assert_eq!(rows.len(), 2);

        // January: two articles, two occurrences, two category hits
        assert!(matches!(rows[0][0].1, DbValue::Text(ref d) if d == "2020-01"));
        assert!(matches!(rows[0][1].1, DbValue::Int(2)));
        assert!(matches!(rows[0][2].1, DbValue::Int(2)));
        assert!(matches!(rows[0][3].1, DbValue::Int(2)));

        assert!(matches!(rows[1][0].1, DbValue::Text(ref d) if d == "2020-02"));
        assert!(matches!(rows[1][1].1, DbValue::Int(1)));
    }

    #[test]
    fn gap_filling_emits_zero_rows_for_missing_months() {
        let mut ctx = test_ctx("^k$", &[], 2);

        ctx.resolution = DateResolution::Month;
        ctx.fill_gaps = true;

        let mut state = AssocOverTimeState::default();
        let mut warnings = Vec::new();

        state.process(
            &corpus(&[
                ("a1", "2020-01-05", &["k"]),
                ("a2", "2020-04-01", &["k"]),
            ]),
            &ctx,
            &mut warnings,
        );

        let rows = state.finish(&ctx);
        let dates: Vec<String> = rows
            .iter()
            .map(|row| match &row[0].1 {
                DbValue::Text(date) => date.clone(),
                _ => String::new(),
            })
            .collect();

        assert_eq!(dates, vec!["2020-01", "2020-02", "2020-03", "2020-04"]);

        // the filler rows are all zeroes
        assert!(matches!(rows[1][1].1, DbValue::Int(0)));
        assert!(matches!(rows[2][2].1, DbValue::Int(0)));
    }

    #[test]
    fn dateless_articles_group_under_the_empty_date() {
        let ctx = test_ctx("^k$", &[], 2);
        let mut state = AssocOverTimeState::default();
        let mut warnings = Vec::new();

        let mut input = corpus(&[("a1", "2020-01-01", &["k"])]);

        // second article outside any date entry
        let start = input.tokens.len();

        input.tokens.push("k".to_owned());
        input
            .article_map
            .push(TextMapEntry::new(start, 1, "a2"));

        state.process(&input, &ctx, &mut warnings);

        let rows = state.finish(&ctx);

        assert_eq!(rows.len(), 2);
        assert!(matches!(rows[0][0].1, DbValue::Text(ref d) if d.is_empty()));
    }
}
