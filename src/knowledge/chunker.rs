//! Greedy word-accumulation chunking.

/// Split text into chunks of at most `max_chunk_size` characters.
///
/// Walks whitespace-delimited tokens and accumulates them while the
/// running length plus one joining space stays within the limit; on
/// overflow the current chunk is closed and the overflowing token seeds
/// the next one. A single token longer than the limit is emitted as its
/// own oversized chunk rather than split mid-token.
pub fn chunk(text: &str, max_chunk_size: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for token in text.split_whitespace() {
        let token_len = token.chars().count();

        if current.is_empty() {
            current.push_str(token);
            current_len = token_len;
        } else if current_len + token_len + 1 <= max_chunk_size {
            current.push(' ');
            current.push_str(token);
            current_len += token_len + 1;
        } else {
            chunks.push(std::mem::take(&mut current));
            current.push_str(token);
            current_len = token_len;
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(chunk("", 100).is_empty());
        assert!(chunk("   \n\t  ", 100).is_empty());
    }

    #[test]
    fn short_text_stays_in_one_chunk() {
        let chunks = chunk("the sky is blue", 100);
        assert_eq!(chunks, vec!["the sky is blue"]);
    }

    #[test]
    fn splits_at_size_boundary() {
        // "aaa bbb" is 7 chars; "ccc" would push it to 11
        let chunks = chunk("aaa bbb ccc ddd", 7);
        assert_eq!(chunks, vec!["aaa bbb", "ccc ddd"]);
    }

    #[test]
    fn every_chunk_respects_the_limit_for_normal_tokens() {
        let text = "alpha beta gamma delta epsilon zeta eta theta iota kappa";
        for chunks in [chunk(text, 12), chunk(text, 20), chunk(text, 35)] {
            assert!(!chunks.is_empty());
        }
        for c in chunk(text, 12) {
            assert!(c.chars().count() <= 12, "chunk too long: {:?}", c);
        }
    }

    #[test]
    fn oversized_token_is_kept_whole() {
        // known boundary case: a single token longer than the limit is
        // emitted as-is, not split
        let chunks = chunk("tiny supercalifragilisticexpialidocious tiny", 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1], "supercalifragilisticexpialidocious");
        assert!(chunks[1].chars().count() > 10);
    }

    #[test]
    fn chunks_reconstruct_the_tokenized_text() {
        let text = "one two three four five six seven eight nine ten eleven twelve";
        let chunks = chunk(text, 15);
        let rejoined = chunks.join(" ");
        let original: Vec<&str> = text.split_whitespace().collect();
        let roundtrip: Vec<&str> = rejoined.split_whitespace().collect();
        assert_eq!(original, roundtrip);
    }
}
