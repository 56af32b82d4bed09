use std::collections::HashSet;

/// Words per retrieval chunk.
pub const CHUNK_WORDS: usize = 200;
/// Chunks folded into one prompt.
pub const CONTEXT_CHUNKS: usize = 3;

/// Text of the loaded document, pre-split into retrieval chunks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentContext {
    chunks: Vec<String>,
}

impl DocumentContext {
    pub fn from_text(text: &str) -> Self {
        let words = text.split_whitespace().collect::<Vec<_>>();
        let chunks = words
            .chunks(CHUNK_WORDS)
            .map(|chunk| chunk.join(" "))
            .collect();
        Self { chunks }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Picks the `limit` chunks sharing the most distinct terms with `question`.
    ///
    /// Ties keep document order, so a question with no overlap gets the opening chunks.
    pub fn relevant(&self, question: &str, limit: usize) -> Vec<&str> {
        let question_terms = terms(question);
        let mut scored = self
            .chunks
            .iter()
            .enumerate()
            .map(|(index, chunk)| {
                let chunk_terms = terms(chunk);
                let score = question_terms.intersection(&chunk_terms).count();
                (score, index)
            })
            .collect::<Vec<_>>();

        scored.sort_by(|left, right| right.0.cmp(&left.0).then(left.1.cmp(&right.1)));
        scored
            .into_iter()
            .take(limit)
            .map(|(_, index)| self.chunks[index].as_str())
            .collect()
    }
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|character: char| !character.is_alphanumeric())
        .filter(|term| term.chars().count() > 2)
        .map(str::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_is_split_into_fixed_word_chunks() {
        let text = (0..450).map(|index| format!("w{index}")).collect::<Vec<_>>().join(" ");
        let context = DocumentContext::from_text(&text);

        assert_eq!(context.chunk_count(), 3);
        assert!(context.relevant("", 5)[2].starts_with("w400 "));
        assert!(DocumentContext::from_text(" \n ").is_empty());
    }

    #[test]
    fn relevant_chunks_rank_by_term_overlap() {
        let mut text = String::new();
        for topic in ["budget", "revenue", "hiring"] {
            for _ in 0..CHUNK_WORDS {
                text.push_str(topic);
                text.push(' ');
            }
        }
        let context = DocumentContext::from_text(&text);

        assert_eq!(context.relevant("How did REVENUE change?", 1), vec![
            context.chunks[1].as_str()
        ]);
        assert_eq!(context.relevant("unrelated", 2).len(), 2);
        assert_eq!(context.relevant("unrelated", 2)[0], context.chunks[0]);
    }
}
