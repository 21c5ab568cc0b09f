//! Article, sentence and token counts per reduced date.

use std::collections::{BTreeMap, BTreeSet};

use crate::datetime::reduce_date;
use crate::db::{DbValue, TargetField};

use super::{AlgoContext, Corpus, date_of, gap_dates_between};

pub fn target_fields() -> Vec<TargetField> {
    vec![
        TargetField::new("analyzed_date", "TEXT"),
        TargetField::new("analyzed_articles", "INTEGER"),
        TargetField::new("analyzed_sentences", "INTEGER"),
        TargetField::new("analyzed_words", "INTEGER"),
    ]
}

#[derive(Default)]
struct DateGroup {
    articles: BTreeSet<String>,
    sentences: u64,
    words: u64,
}

#[derive(Default)]
pub struct WordsState {
    groups: BTreeMap<String, DateGroup>,
}

impl WordsState {
    pub fn process(&mut self, corpus: &Corpus, ctx: &AlgoContext) {
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

            let group = self.groups.entry(reduced).or_default();

            group.articles.insert(article.value.clone());

            // non-empty tokens only; empty tokens hold positions but never
            // contribute to counts
            group.words += corpus.tokens[article.pos..article.end()]
                .iter()
                .filter(|token| !token.is_empty())
                .count() as u64;

            group.sentences += corpus
                .sentence_map
                .iter()
                .filter(|sentence| {
                    sentence.pos >= article.pos
                        && sentence.pos < article.end()
                        && corpus.tokens
                            [sentence.pos..sentence.end().min(corpus.tokens.len())]
                            .iter()
                            .any(|token| !token.is_empty())
                })
                .count() as u64;
        }
    }

    pub fn finish(&mut self, ctx: &AlgoContext) -> Vec<Vec<(String, DbValue)>> {
        let mut rows = Vec::new();
        let mut previous: Option<String> = None;

        for (date, group) in &self.groups {
            if ctx.ignore_empty_date && date.is_empty() {
                continue;
            }

            for missing in gap_dates_between(&previous, date, ctx) {
                rows.push(vec![
                    ("analyzed_date".to_owned(), DbValue::Text(missing)),
                    ("analyzed_articles".to_owned(), DbValue::Int(0)),
                    ("analyzed_sentences".to_owned(), DbValue::Int(0)),
                    ("analyzed_words".to_owned(), DbValue::Int(0)),
                ]);
            }

            rows.push(vec![
                ("analyzed_date".to_owned(), DbValue::Text(date.clone())),
                (
                    "analyzed_articles".to_owned(),
                    DbValue::Int(group.articles.len() as i64),
                ),
                (
                    "analyzed_sentences".to_owned(),
                    DbValue::Int(group.sentences as i64),
                ),
                ("analyzed_words".to_owned(), DbValue::Int(group.words as i64)),
            ]);

            if !date.is_empty() {
                previous = Some(date.clone());
            }
        }

        self.groups.clear();

        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::testutil::test_ctx;
    use crate::datetime::DateResolution;

    #[test]
    fn counts_articles_sentences_and_words() {
        let mut ctx = test_ctx("^none$", &[], 1);

        ctx.resolution = DateResolution::Day;

        let corpus = Corpus::from_rows(&[
            (
                1,
                "a1".to_owned(),
                Some("2020-01-01 08:00:00".to_owned()),
                "one two. three".to_owned(),
            ),
            (
                2,
                "a2".to_owned(),
                Some("2020-01-01 19:00:00".to_owned()),
                "four".to_owned(),
            ),
            (
                3,
                "a3".to_owned(),
                Some("2020-01-02 00:00:00".to_owned()),
                "five six".to_owned(),
            ),
        ]);

        let mut state = WordsState::default();

        state.process(&corpus, &ctx);

        let rows = state.finish(&ctx);

        assert_eq!(rows.len(), 2);

        // 2020-01-01: two articles, three sentences, four words
        assert!(matches!(rows[0][1].1, DbValue::Int(2)));
        assert!(matches!(rows[0][2].1, DbValue::Int(3)));
        assert!(matches!(rows[0][3].1, DbValue::Int(4)));

        // 2020-01-02: one article, one sentence, two words
        assert!(matches!(rows[1][1].1, DbValue::Int(1)));
        assert!(matches!(rows[1][2].1, DbValue::Int(1)));
        assert!(matches!(rows[1][3].1, DbValue::Int(2)));
    }

    #[test]
    fn gap_fill_covers_every_skipped_day() {
        let mut ctx = test_ctx("^none$", &[], 1);

        ctx.resolution = DateResolution::Day;
        ctx.fill_gaps = true;

        let corpus = Corpus::from_rows(&[
            (
                1,
                "a1".to_owned(),
                Some("2020-01-01 00:00:00".to_owned()),
                "x".to_owned(),
            ),
            (
                2,
                "a2".to_owned(),
                Some("2020-01-04 00:00:00".to_owned()),
                "y".to_owned(),
            ),
        ]);

        let mut state = WordsState::default();

        state.process(&corpus, &ctx);

        let rows = state.finish(&ctx);
        let dates: Vec<String> = rows
            .iter()
            .map(|row| match &row[0].1 {
                DbValue::Text(date) => date.clone(),
                _ => String::new(),
            })
            .collect();

        assert_eq!(
            dates,
            vec!["2020-01-01", "2020-01-02", "2020-01-03", "2020-01-04"]
        );
    }
}
