//! Keyword/category co-occurrence per article.
//!
//! For one keyword query and N category queries, record the token positions
//! where the keyword and each category match; for each keyword occurrence
//! count the category occurrences within the configured window. One result
//! row per article, sorted by article id.

use std::collections::BTreeMap;

use crate::db::{DbValue, TargetField};

use super::{
    AlgoContext, Associations, Corpus, category_column, count_occurrences, date_of,
};

pub fn target_fields(ctx: &AlgoContext) -> Vec<TargetField> {
    let mut fields = vec![
        TargetField::new("analyzed_id", "TEXT"),
        TargetField::new("analyzed_date", "TEXT"),
        TargetField::new("analyzed_occurrences", "INTEGER"),
    ];

    for (label, _) in &ctx.categories {
        fields.push(TargetField::new(category_column(label), "INTEGER"));
    }

    fields
}

struct ArticleState {
    date: String,
    associations: Associations,
}

#[derive(Default)]
pub struct AssocState {
    articles: BTreeMap<String, ArticleState>,
}

impl AssocState {
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

            let state = self
                .articles
                .entry(article.value.clone())
                .or_insert_with(|| ArticleState {
                    date,
                    associations: Associations::with_categories(ctx.category_count()),
                });

            for (position, token) in corpus.tokens[article.pos..article.end()]
                .iter()
                .enumerate()
            {
                state
                    .associations
                    .process_token(ctx, position as u64, token);
            }

            // an article may continue in the next corpus
            state.associations.offset += article.len as u64;
        }
    }

    pub fn finish(&mut self, ctx: &AlgoContext) -> Vec<Vec<(String, DbValue)>> {
        let mut rows = Vec::with_capacity(self.articles.len());

        for (article, state) in &self.articles {
            let (occurrences, counters) = count_occurrences(&state.associations, ctx.window);

            let mut row = vec![
                ("analyzed_id".to_owned(), DbValue::Text(article.clone())),
                ("analyzed_date".to_owned(), DbValue::Text(state.date.clone())),
                (
                    "analyzed_occurrences".to_owned(),
                    DbValue::Int(occurrences as i64),
                ),
            ];

            for ((label, _), count) in ctx.categories.iter().zip(counters) {
                row.push((category_column(label), DbValue::Int(count as i64)));
            }

            rows.push(row);
        }

        self.articles.clear();

        rows
    }
}
