//! Fixed-length token-id encoding for the embedding backend.
//!
//! Words are hashed into a fixed id space rather than looked up in a
//! vocabulary. Ids below `FIRST_WORD_TOKEN` are reserved for markers.

pub const MAX_SEQUENCE_LENGTH: usize = 128;
pub const PAD_TOKEN: u32 = 0;
pub const CLS_TOKEN: u32 = 101;
pub const SEP_TOKEN: u32 = 102;
pub const FIRST_WORD_TOKEN: u32 = 103;
const VOCAB_SIZE: u32 = 30_000;

fn word_id(word: &str) -> u32 {
    let mut h: u32 = 0x811c9dc5;
    for b in word.bytes() {
        h ^= b as u32;
        h = h.wrapping_mul(0x01000193);
    }
    (h % VOCAB_SIZE).max(FIRST_WORD_TOKEN)
}

/// `[CLS] w1 .. wn [SEP] [PAD]..`, always `max_len` long. Words beyond
/// `max_len - 2` are dropped.
pub fn encode(text: &str, max_len: usize) -> Vec<u32> {
    let max_len = max_len.max(2);
    let lowered = text.trim().to_lowercase();

    let mut ids = Vec::with_capacity(max_len);
    ids.push(CLS_TOKEN);
    ids.extend(
        lowered
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| c.is_ascii_punctuation()))
            .filter(|w| !w.is_empty())
            .take(max_len - 2)
            .map(word_id),
    );
    ids.push(SEP_TOKEN);
    ids.resize(max_len, PAD_TOKEN);
    ids
}
