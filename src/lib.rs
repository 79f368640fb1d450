//! Identify the type of a file by matching its bytes against a "magic"
//! rule database, in the long-standing libmagic dialect.
//!
//! A rule database is line-oriented text. Each line tests a few bytes of
//! the target at some offset; nested rules (prefixed with `>`) refine a
//! match with more detail, and every matching rule contributes its
//! description to the output:
//!
//! ```text
//! 0       string          BM      PC bitmap
//! >18     lelong          x       , width %d
//! ```
//!
//! Parsing a database yields a [`Spellbook`]: an immutable set of pages,
//! each an ordered rule list. Named pages act as subroutines reached
//! through `use` rules; identification always enters at the unnamed main
//! page.
//!
//! ## Identifying a file
//!
//! ```
//! use grimoire::Spellbook;
//!
//! let mut book = Spellbook::new();
//! book.load_text(b"0\tstring\t\\x89PNG\\r\\n\\x1a\\n\tPNG image data");
//!
//! let target = b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDR";
//! assert_eq!(book.describe(target), "PNG image data");
//! assert_eq!(book.describe(b"not a png"), "");
//! ```
//!
//! The spellbook is read-only after loading and safe to share between
//! threads; each [`Spellbook::identify`] call keeps its own cursor state
//! and borrows the descriptions straight out of the book.
//!
//! Malformed rules and unreadable target offsets never abort anything:
//! they are reported through the [`log`] facade and skipped, exactly like
//! the databases this dialect inherits expect.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

mod ast;
mod interpreter;
mod lexer;
mod parser;
mod pattern;

pub use ast::{
    AdjustOp, Adjustment, Comparison, Endianness, IndirectOffset, IntegerKind, Kind, Offset,
    OffsetBase, Rule, SearchKind, Spellbook, StringFlags, StringKind, UseKind, MAX_LEVELS,
};
pub use interpreter::{read_uint, ReadError};
pub use lexer::{decoded_string, escaped_string, EscapeError};
pub use pattern::{search_test, string_test};

/// Errors surfaced to callers. Everything recoverable — malformed rules,
/// out-of-range reads, missing pages — is recovered and logged where it
/// happens; only rule-source I/O propagates.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read rule database {path:?}")]
    RuleSource {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("rule database directory {path:?} cannot be listed")]
    RuleDirectory { path: PathBuf },
}

/// Joins matched descriptions into the final message: single spaces
/// between parts, then one left-to-right pass that drops every byte
/// followed by a backspace (0x08) along with the backspace itself, so
/// descriptions can splice themselves onto their predecessor.
pub fn merge_descriptions(parts: &[&[u8]]) -> String {
    let mut joined = Vec::new();
    for (index, part) in parts.iter().enumerate() {
        if index > 0 {
            joined.push(b' ');
        }
        joined.extend_from_slice(part);
    }

    let mut cleaned = Vec::with_capacity(joined.len());
    let mut i = 0;
    while i < joined.len() {
        if i + 1 < joined.len() && joined[i + 1] == 0x08 {
            i += 2;
        } else {
            cleaned.push(joined[i]);
            i += 1;
        }
    }

    String::from_utf8_lossy(&cleaned).trim().to_string()
}
