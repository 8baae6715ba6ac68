//! First-seen-wins deduplication by primary key.

use std::collections::HashSet;

use serde::Serialize;

use crate::store::TableRecord;

/// Counts from one [`deduplicate`] pass.
///
/// `unique_count + duplicate_count + invalid_count == original_count`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    pub original_count: usize,
    pub unique_count: usize,
    pub duplicate_count: usize,
    pub invalid_count: usize,
}

/// Drop records whose key was already seen, keeping the first occurrence.
///
/// Records with an empty partition key are counted as invalid and dropped.
/// Relative order of the survivors is preserved.
pub fn deduplicate<T: TableRecord>(records: Vec<T>) -> (Vec<T>, DedupStats) {
    let mut stats = DedupStats {
        original_count: records.len(),
        ..Default::default()
    };
    let mut seen = HashSet::with_capacity(records.len());
    let mut unique = Vec::with_capacity(records.len());

    for record in records {
        let key = record.item_key();
        if key.partition.is_empty() {
            stats.invalid_count += 1;
            continue;
        }
        if seen.insert(key) {
            unique.push(record);
        } else {
            stats.duplicate_count += 1;
        }
    }

    stats.unique_count = unique.len();
    (unique, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceRecord;

    fn paper(id: &str, title: &str) -> SourceRecord {
        SourceRecord {
            paper_id: id.to_string(),
            title: title.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_first_occurrence_wins() {
        let (unique, stats) = deduplicate(vec![
            paper("A", "first"),
            paper("B", "b"),
            paper("A", "second"),
        ]);
        let ids: Vec<_> = unique.iter().map(|r| r.paper_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);
        assert_eq!(unique[0].title, "first");
        assert_eq!(
            stats,
            DedupStats {
                original_count: 3,
                unique_count: 2,
                duplicate_count: 1,
                invalid_count: 0,
            }
        );
    }

    #[test]
    fn test_empty_keys_are_invalid() {
        let (unique, stats) = deduplicate(vec![paper("", "x"), paper("A", "a"), paper("", "y")]);
        assert_eq!(unique.len(), 1);
        assert_eq!(stats.invalid_count, 2);
        assert_eq!(stats.duplicate_count, 0);
    }

    #[test]
    fn test_counts_always_partition_the_input() {
        let ids = ["a", "b", "", "a", "c", "b", "", "a", "d"];
        for n in 0..=ids.len() {
            let records: Vec<_> = ids[..n].iter().map(|id| paper(id, "")).collect();
            let (unique, stats) = deduplicate(records);
            assert_eq!(stats.original_count, n);
            assert_eq!(stats.unique_count, unique.len());
            assert_eq!(
                stats.unique_count + stats.duplicate_count + stats.invalid_count,
                stats.original_count
            );
        }
    }

    #[test]
    fn test_empty_input() {
        let (unique, stats) = deduplicate(Vec::<SourceRecord>::new());
        assert!(unique.is_empty());
        assert_eq!(stats, DedupStats::default());
    }
}
