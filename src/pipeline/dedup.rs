//! Content deduplication: render each distinct page document once.
//!
//! E-reader scrapers regularly capture the same page twice (double clicks on
//! "next", spreads repeated at chapter boundaries). Hashing the raw bytes is
//! far cheaper than a headless render, so duplicates are dropped up front.
//!
//! Equality is whole-document: a page whose markup carries a timestamp or a
//! random id never matches its twin. SHA-256 collisions are treated as real
//! duplicates and not re-checked byte for byte.

use crate::pipeline::input::PageDocument;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// SHA-256 of a page document's raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..12])
    }
}

/// A page document picked for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderUnit {
    pub ordinal: usize,
    pub label: String,
    pub hash: ContentHash,
    pub bytes: Vec<u8>,
}

/// A page dropped because an earlier page has identical content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Duplicate {
    pub ordinal: usize,
    /// Ordinal of the first page with the same hash.
    pub canonical: usize,
}

/// Output of [`deduplicate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupOutcome {
    /// First occurrence of each distinct hash, in ordinal order.
    pub units: Vec<RenderUnit>,
    pub duplicates: Vec<Duplicate>,
}

/// Keep the first occurrence of each distinct content hash.
///
/// Input order is preserved; documents are consumed so their bytes move
/// into the render units without copying.
pub fn deduplicate(documents: Vec<PageDocument>) -> DedupOutcome {
    let mut first_seen: HashMap<ContentHash, usize> = HashMap::with_capacity(documents.len());
    let mut outcome = DedupOutcome::default();

    for doc in documents {
        let hash = ContentHash::of(&doc.bytes);
        match first_seen.get(&hash) {
            Some(&canonical) => {
                debug!(
                    "Page {} ({}) duplicates page {}",
                    doc.ordinal, doc.name, canonical
                );
                outcome.duplicates.push(Duplicate {
                    ordinal: doc.ordinal,
                    canonical,
                });
            }
            None => {
                first_seen.insert(hash, doc.ordinal);
                outcome.units.push(RenderUnit {
                    ordinal: doc.ordinal,
                    label: doc.label,
                    hash,
                    bytes: doc.bytes,
                });
            }
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(ordinal: usize, body: &str) -> PageDocument {
        PageDocument {
            ordinal,
            label: format!("ch{}", ordinal / 4),
            name: format!("{ordinal:04}.html"),
            bytes: body.as_bytes().to_vec(),
        }
    }

    /// 10 documents, pages 3/4, 6/7 and 8/9 identical.
    fn ten_with_three_pairs() -> Vec<PageDocument> {
        let bodies = ["a", "b", "c", "d", "d", "e", "f", "f", "g", "g"];
        bodies
            .iter()
            .enumerate()
            .map(|(i, b)| doc(i, &format!("<img src=\"{b}.png\">")))
            .collect()
    }

    #[test]
    fn three_pairs_collapse_to_seven_units() {
        let outcome = deduplicate(ten_with_three_pairs());
        let ordinals: Vec<usize> = outcome.units.iter().map(|u| u.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2, 3, 5, 6, 8]);
        assert_eq!(
            outcome.duplicates,
            vec![
                Duplicate { ordinal: 4, canonical: 3 },
                Duplicate { ordinal: 7, canonical: 6 },
                Duplicate { ordinal: 9, canonical: 8 },
            ]
        );
    }

    #[test]
    fn dedup_is_idempotent() {
        let first = deduplicate(ten_with_three_pairs());
        let second = deduplicate(ten_with_three_pairs());
        assert_eq!(first, second);
    }

    #[test]
    fn non_adjacent_duplicates_map_to_first_occurrence() {
        let docs = vec![doc(0, "x"), doc(1, "y"), doc(2, "x"), doc(3, "x")];
        let outcome = deduplicate(docs);
        assert_eq!(outcome.units.len(), 2);
        assert!(outcome.duplicates.iter().all(|d| d.canonical == 0));
    }

    #[test]
    fn labels_do_not_affect_identity() {
        let mut a = doc(0, "same");
        let mut b = doc(1, "same");
        a.label = "intro".into();
        b.label = "chapter-1".into();
        assert_eq!(deduplicate(vec![a, b]).units.len(), 1);
    }

    #[test]
    fn empty_input_yields_empty_outcome() {
        assert_eq!(deduplicate(Vec::new()), DedupOutcome::default());
    }

    #[test]
    fn hash_hex_is_stable() {
        assert_eq!(
            ContentHash::of(b"").to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
