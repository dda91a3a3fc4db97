//! Splitting document text into size-bounded retrieval units.
//!
//! Chunks are the granularity of embedding and of search hits. The
//! splitter normalizes whitespace, cuts the text at sentence-ish
//! separators (CJK and ASCII), and then packs fragments into chunks of
//! `MIN_CHUNK_CHARS < len <= MAX_CHUNK_CHARS` characters, carrying
//! undersized fragments forward and slicing oversized ones.

/// Smallest chunk the splitter will emit on its own (characters).
pub const MIN_CHUNK_CHARS: usize = 10;

/// Largest chunk the splitter will emit (characters).
pub const MAX_CHUNK_CHARS: usize = 250;

/// At most this many chunks are kept per document; the prefix wins.
pub const MAX_CHUNKS_PER_DOC: usize = 100;

/// Basenames longer than this many UTF-8 bytes are indexed as a chunk
/// of their own.
pub const BASENAME_INDEX_BYTES: usize = 14;

/// Characters the text is cut at before size packing.
const SEPARATORS: &[char] = &['\n', '，', '；', '。', ',', '.'];

/// Collapse every run of whitespace (including zero-width spaces) into a
/// single ASCII space and replace single quotes with double quotes so
/// chunk content stays quote-safe downstream.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_run = false;
    for c in text.chars() {
        if c.is_whitespace() || c == '\u{200B}' {
            if !in_run {
                out.push(' ');
                in_run = true;
            }
        } else {
            in_run = false;
            out.push(if c == '\'' { '"' } else { c });
        }
    }
    out
}

/// Split `text` into chunks using the default size bounds.
pub fn split_text(text: &str) -> Vec<String> {
    split_text_bounded(text, MIN_CHUNK_CHARS, MAX_CHUNK_CHARS)
}

/// Split `text` into chunks of `min_chars < len <= max_chars` characters.
///
/// Fragments shorter than the minimum are carried forward and prepended
/// to the next fragment; fragments longer than the maximum are sliced
/// into full `max_chars` pieces with the tail carried forward. Whatever
/// is left at the end is emitted on its own if it clears the minimum,
/// otherwise appended to the last chunk (or emitted alone if there is
/// none). Lengths are measured in characters, not bytes.
pub fn split_text_bounded(
    text: &str,
    min_chars: usize,
    max_chars: usize,
) -> Vec<String> {
    let normalized = normalize(text);

    let mut chunks = Vec::new();
    let mut overflow = String::new();

    for fragment in normalized.split(SEPARATORS) {
        let fragment = fragment.trim();
        if fragment.is_empty() {
            continue;
        }

        let mut piece = std::mem::take(&mut overflow);
        piece.push_str(fragment);

        let len = piece.chars().count();
        if len > max_chars {
            slice_oversized(&piece, max_chars, &mut chunks, &mut overflow);
        } else if len > min_chars {
            chunks.push(piece);
        } else {
            overflow = piece;
        }
    }

    if overflow.chars().count() > min_chars {
        chunks.push(overflow);
    } else if !overflow.is_empty() {
        match chunks.last_mut() {
            Some(last) => last.push_str(&overflow),
            None => chunks.push(overflow),
        }
    }

    chunks
}

/// Emit every full `max_chars`-character slice of `text` and push the
/// remainder onto `overflow`.
fn slice_oversized(
    text: &str,
    max_chars: usize,
    chunks: &mut Vec<String>,
    overflow: &mut String,
) {
    let mut rest = text;
    while !rest.is_empty() {
        match byte_len_of_chars(rest, max_chars) {
            Some(end) => {
                chunks.push(rest[..end].to_string());
                rest = &rest[end..];
            }
            None => {
                overflow.push_str(rest);
                return;
            }
        }
    }
}

/// Byte length of the first `n` characters of `s`, or `None` if `s` has
/// fewer than `n` characters.
fn byte_len_of_chars(s: &str, n: usize) -> Option<usize> {
    let mut iter = s.char_indices();
    match iter.nth(n.checked_sub(1)?) {
        Some((idx, c)) => Some(idx + c.len_utf8()),
        None => None,
    }
}
