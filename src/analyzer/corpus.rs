//! Corpus assembly.
//!
//! A corpus is an ordered sequence of tokens plus three side-maps over token
//! positions: the date map, the article map and the sentence map. Entries of
//! each map are disjoint and sorted by start position; tokens outside any
//! entry carry no date (or article, or sentence).

/// One entry of a text map: a half-open token range `[pos, pos + len)` with
/// its value (a date, an article id, or nothing meaningful for sentences).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMapEntry {
    pub pos: usize,
    pub len: usize,
    pub value: String,
}

impl TextMapEntry {
    pub fn new(pos: usize, len: usize, value: impl Into<String>) -> Self {
        Self {
            pos,
            len,
            value: value.into(),
        }
    }

    pub fn end(&self) -> usize {
        self.pos + self.len
    }

    pub fn contains(&self, position: usize) -> bool {
        position >= self.pos && position < self.end()
    }
}

#[derive(Debug, Default, Clone)]
pub struct Corpus {
    pub tokens: Vec<String>,
    pub date_map: Vec<TextMapEntry>,
    pub article_map: Vec<TextMapEntry>,
    pub sentence_map: Vec<TextMapEntry>,
    /// URLs that contributed rows, for flagging after analysis.
    pub url_ids: Vec<i64>,
}

impl Corpus {
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Build a corpus from dataset rows `(url_id, article id, datetime,
    /// text)`. Tokens are whitespace-separated; sentences split on `.`, `!`
    /// and `?`; the date of an article is the date part of its datetime.
    pub fn from_rows(rows: &[(i64, String, Option<String>, String)]) -> Self {
        let mut corpus = Corpus::default();

        for (url_id, article, datetime, text) in rows {
            let start = corpus.tokens.len();

            for sentence in split_sentences(text) {
                let sentence_start = corpus.tokens.len();

                for token in sentence.split_whitespace() {
                    corpus.tokens.push(token.to_owned());
                }

                let length = corpus.tokens.len() - sentence_start;

                if length > 0 {
                    corpus
                        .sentence_map
                        .push(TextMapEntry::new(sentence_start, length, ""));
                }
            }

            let length = corpus.tokens.len() - start;

            if length == 0 {
                continue;
            }

            corpus
                .article_map
                .push(TextMapEntry::new(start, length, article.clone()));

            if let Some(datetime) = datetime
                && datetime.len() >= 10
            {
                corpus
                    .date_map
                    .push(TextMapEntry::new(start, length, &datetime[..10]));
            }

            if !corpus.url_ids.contains(url_id) {
                corpus.url_ids.push(*url_id);
            }
        }

        corpus
    }
}

fn split_sentences(text: &str) -> impl Iterator<Item = &str> {
    text.split(['.', '!', '?'])
        .filter(|sentence| !sentence.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(article: &str, date: &str, text: &str) -> (i64, String, Option<String>, String) {
        (
            1,
            article.to_owned(),
            (!date.is_empty()).then(|| date.to_owned()),
            text.to_owned(),
        )
    }

    #[test]
    fn maps_are_disjoint_and_sorted() {
        let corpus = Corpus::from_rows(&[
            row("a1", "2020-01-01 10:00:00", "one two. three"),
            row("a2", "2020-01-02 10:00:00", "four"),
        ]);

        assert_eq!(corpus.tokens, vec!["one", "two", "three", "four"]);

        assert_eq!(corpus.article_map.len(), 2);
        assert_eq!(corpus.article_map[0].pos, 0);
        assert_eq!(corpus.article_map[0].len, 3);
        assert_eq!(corpus.article_map[1].pos, 3);
        assert_eq!(corpus.article_map[1].value, "a2");

        assert_eq!(corpus.date_map[0].value, "2020-01-01");
        assert_eq!(corpus.date_map[1].value, "2020-01-02");

        // two sentences in the first article, one in the second
        assert_eq!(corpus.sentence_map.len(), 3);
        assert_eq!(corpus.sentence_map[0].len, 2);
        assert_eq!(corpus.sentence_map[1].len, 1);

        for map in [&corpus.article_map, &corpus.date_map, &corpus.sentence_map] {
            for window in map.windows(2) {
                assert!(window[0].end() <= window[1].pos);
            }
        }
    }

    #[test]
    fn dateless_articles_have_no_date_entry() {
        let corpus = Corpus::from_rows(&[row("a1", "", "no date here")]);

        assert!(corpus.date_map.is_empty());
        assert_eq!(corpus.article_map.len(), 1);
    }

    #[test]
    fn empty_text_rows_are_skipped() {
        let corpus = Corpus::from_rows(&[row("a1", "2020-01-01 00:00:00", "  ")]);

        assert!(corpus.is_empty());
        assert!(corpus.article_map.is_empty());
    }
}
