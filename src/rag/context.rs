//! Context-block assembly from ranked retrieval results.

use crate::knowledge::RetrievedChunk;

/// fixed per-entry allowance for the source header line
const ENTRY_OVERHEAD: usize = 50;

/// Format retrieval results into a bounded context block.
///
/// Results are consumed in ranked order. An entry is accepted while the
/// running length stays within `context_window_size` and fewer than
/// `max_context_chunks` entries have been taken; the first bound hit
/// ends the block, so partial inclusion of the result set is normal.
/// Empty results, or a first entry that alone overflows the window,
/// yield `None`.
pub fn build_context_block(
    results: &[RetrievedChunk],
    context_window_size: usize,
    max_context_chunks: usize,
) -> Option<String> {
    if results.is_empty() {
        return None;
    }

    let mut block = String::new();
    let mut used = 0usize;

    for (i, result) in results.iter().enumerate() {
        if i >= max_context_chunks {
            break;
        }

        let addition = result.content.len() + ENTRY_OVERHEAD;
        if used + addition > context_window_size {
            break;
        }

        block.push_str(&format!(
            "[Source {} (similarity: {:.2}, doc: {})]:\n{}\n",
            i + 1,
            result.similarity,
            result.document_id,
            result.content
        ));
        used += addition;
    }

    if block.is_empty() {
        None
    } else {
        Some(block)
    }
}
