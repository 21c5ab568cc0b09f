//! Article-id extraction: the sorted set of distinct article-map values.

use std::collections::BTreeSet;

use crate::db::{DbValue, TargetField};

use super::Corpus;

pub fn target_fields() -> Vec<TargetField> {
    vec![TargetField::new("analyzed_id", "TEXT")]
}

#[derive(Default)]
pub struct ExtractIdsState {
    ids: BTreeSet<String>,
}

impl ExtractIdsState {
    pub fn process(&mut self, corpus: &Corpus) {
        for article in &corpus.article_map {
            if !article.value.is_empty() {
                self.ids.insert(article.value.clone());
            }
        }
    }

    pub fn finish(&mut self) -> Vec<Vec<(String, DbValue)>> {
        std::mem::take(&mut self.ids)
            .into_iter()
            .map(|id| vec![("analyzed_id".to_owned(), DbValue::Text(id))])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::corpus::TextMapEntry;

    #[test]
    fn ids_are_distinct_and_sorted() {
        let corpus = Corpus {
            tokens: vec!["a".into(), "b".into(), "c".into()],
            article_map: vec![
                TextMapEntry::new(0, 1, "beta"),
                TextMapEntry::new(1, 1, "alpha"),
                TextMapEntry::new(2, 1, "beta"),
            ],
            ..Corpus::default()
        };

        let mut state = ExtractIdsState::default();

        state.process(&corpus);

        let rows = state.finish();

        assert_eq!(rows.len(), 2);
        assert!(matches!(rows[0][0].1, DbValue::Text(ref id) if id == "alpha"));
        assert!(matches!(rows[1][0].1, DbValue::Text(ref id) if id == "beta"));
    }
}
