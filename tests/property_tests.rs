//! Property-based tests for memvault
//!
//! These tests verify invariants that must hold for all inputs:
//! - Normalization is idempotent
//! - Parsers never panic
//! - Bounded operations stay bounded
//!
//! Run with: cargo test --test property_tests

use proptest::prelude::*;

// ============================================================================
// TAG NORMALIZATION TESTS
// ============================================================================

mod tag_tests {
    use super::*;
    use memvault::types::normalize_tags;
    use std::collections::HashSet;

    proptest! {
        /// Invariant: Normalizing twice is the same as normalizing once
        #[test]
        fn idempotent(tags in prop::collection::vec("\\PC{0,20}", 0..12)) {
            let once = normalize_tags(tags);
            let twice = normalize_tags(once.clone());
            prop_assert_eq!(once, twice);
        }

        /// Invariant: No blank tags and no surrounding whitespace
        #[test]
        fn no_blank_tags(tags in prop::collection::vec("\\s{0,3}[a-z]{0,5}\\s{0,3}", 0..12)) {
            for tag in normalize_tags(tags) {
                prop_assert!(!tag.is_empty());
                prop_assert_eq!(tag.trim(), tag.as_str());
            }
        }

        /// Invariant: Output has no duplicates
        #[test]
        fn no_duplicates(tags in prop::collection::vec("[a-c ]{0,3}", 0..20)) {
            let normalized = normalize_tags(tags);
            let unique: HashSet<&String> = normalized.iter().collect();
            prop_assert_eq!(unique.len(), normalized.len());
        }
    }
}

// ============================================================================
// IMPORTANCE TESTS
// ============================================================================

mod importance_tests {
    use super::*;
    use memvault::types::Importance;
    use memvault::VaultError;

    proptest! {
        /// Invariant: Exactly the values 1..=10 are accepted, and kept as given
        #[test]
        fn accepts_only_one_to_ten(raw in -100i64..100) {
            match Importance::new(raw) {
                Ok(importance) => {
                    prop_assert!((1..=10).contains(&raw));
                    prop_assert_eq!(i64::from(importance), raw);
                }
                Err(e) => {
                    prop_assert!(!(1..=10).contains(&raw));
                    prop_assert!(matches!(e, VaultError::InvalidInput(_)));
                }
            }
        }
    }
}

// ============================================================================
// EMBEDDING HELPER TESTS
// ============================================================================

mod embedding_tests {
    use super::*;
    use memvault::embedding::{cosine_similarity, prepare_text};

    proptest! {
        /// Invariant: Prepared text never exceeds the character bound
        #[test]
        fn prepare_text_bounded(text in "\\PC{0,300}", max in 1usize..100) {
            let prepared = prepare_text(&text, max);
            prop_assert!(prepared.chars().count() <= max);
        }

        /// Invariant: Prepared text has no runs of whitespace
        #[test]
        fn prepare_text_collapses_whitespace(text in "[a-z \\t\\n]{0,100}") {
            let prepared = prepare_text(&text, 1000);
            prop_assert!(!prepared.contains("  "));
            prop_assert_eq!(prepared.trim(), prepared.as_str());
        }

        /// Invariant: Cosine similarity stays within [-1, 1]
        #[test]
        fn cosine_bounded(
            pairs in prop::collection::vec((-100.0f32..100.0, -100.0f32..100.0), 1..32)
        ) {
            let (a, b): (Vec<f32>, Vec<f32>) = pairs.into_iter().unzip();
            let score = cosine_similarity(&a, &b);
            prop_assert!(score.is_finite());
            prop_assert!((-1.0001..=1.0001).contains(&score));
        }

        /// Invariant: Mismatched lengths score zero
        #[test]
        fn cosine_mismatched_is_zero(
            a in prop::collection::vec(-1.0f32..1.0, 1..8),
            extra in 1usize..4
        ) {
            let b = vec![0.5f32; a.len() + extra];
            prop_assert_eq!(cosine_similarity(&a, &b), 0.0);
        }
    }
}

// ============================================================================
// WRITE-AHEAD LOG LINE TESTS
// ============================================================================

mod wal_tests {
    use super::*;
    use chrono::Utc;
    use memvault::gate::wal::LogLine;
    use memvault::types::AddMemoryInput;

    proptest! {
        /// Invariant: Parsing arbitrary input never panics
        #[test]
        fn parse_never_panics(raw in ".*") {
            let _ = LogLine::parse(&raw).and_then(LogLine::into_add_memory);
        }

        /// Invariant: A queued call reads back as the same input
        #[test]
        fn queued_input_survives(
            content in "\\PC{1,80}",
            tags in prop::collection::vec("[a-z]{1,8}", 0..4),
            importance in prop::option::of(-5i64..20)
        ) {
            let input = AddMemoryInput {
                content,
                tags,
                importance,
                ..Default::default()
            };
            let line = LogLine::add_memory(Utc::now(), &input).unwrap();
            let raw = serde_json::to_string(&line).unwrap();
            prop_assert!(!raw.contains('\n'));
            let back = LogLine::parse(&raw).unwrap().into_add_memory().unwrap();
            prop_assert_eq!(back, input);
        }
    }
}
