use memchr::memmem;

use crate::ast::StringFlags;
use crate::lexer::is_rule_whitespace;

/// Matches `pattern` against `target` starting at `index`, honoring the
/// string-test flags. Returns the index just past the consumed target
/// bytes, counted from the start of `target`, or `None` on a mismatch.
/// An empty pattern matches at `index` without consuming anything.
pub fn string_test(
    target: &[u8],
    index: usize,
    pattern: &[u8],
    flags: &StringFlags,
) -> Option<usize> {
    let mut target_index = index;
    let mut pattern_index = 0;

    if pattern.is_empty() {
        return Some(target_index);
    }

    while target_index < target.len() {
        let pattern_byte = pattern[pattern_index];
        let target_byte = target[target_index];

        if pattern_byte == target_byte {
            target_index += 1;
            pattern_index += 1;
        } else if flags.optional_blanks && is_rule_whitespace(pattern_byte) {
            // the blank was optional after all
            pattern_index += 1;
        } else if flags.lower_matches_both
            && pattern_byte.is_ascii_lowercase()
            && target_byte.to_ascii_lowercase() == pattern_byte
        {
            target_index += 1;
            pattern_index += 1;
        } else if flags.upper_matches_both
            && pattern_byte.is_ascii_uppercase()
            && target_byte.to_ascii_uppercase() == pattern_byte
        {
            target_index += 1;
            pattern_index += 1;
        } else {
            return None;
        }

        if flags.compact_whitespace && is_rule_whitespace(target_byte) {
            // a whitespace run in the target collapses into the byte that
            // started it
            while target_index < target.len() && is_rule_whitespace(target[target_index]) {
                target_index += 1;
            }
        }

        if pattern_index >= pattern.len() {
            return Some(target_index);
        }
    }

    // the target ran out before the pattern did
    None
}

/// Finds the first occurrence of `pattern` inside
/// `target[index .. index + max_len]` (clamped to the target), returning
/// the absolute index of the match.
pub fn search_test(target: &[u8], index: usize, max_len: usize, pattern: &[u8]) -> Option<usize> {
    if index >= target.len() {
        return None;
    }
    let end = target.len().min(index.saturating_add(max_len));
    let window = &target[index..end];
    if window.is_empty() {
        return None;
    }
    memmem::find(window, pattern).map(|found| index + found)
}
