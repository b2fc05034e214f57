//! Pure dedup/merge of two ordered message batches.

use std::collections::HashSet;

use quill_core::StructuredMessage;

/// Merges `new_batch` into `accumulated` without mutating either input.
///
/// Entries are keyed by content signature; novel entries from `new_batch`
/// (deduped against `accumulated` and within `new_batch` itself) are appended
/// after `accumulated`. Appending is only sound because the forward scroll
/// strategy that calls this never moves backward through the source.
pub fn merge_batches(
    accumulated: &[StructuredMessage],
    new_batch: &[StructuredMessage],
) -> Vec<StructuredMessage> {
    if accumulated.is_empty() {
        return new_batch.to_vec();
    }
    if new_batch.is_empty() {
        return accumulated.to_vec();
    }

    let mut seen: HashSet<String> = accumulated
        .iter()
        .map(|message| message.signature())
        .collect();
    let mut merged = accumulated.to_vec();
    for message in new_batch {
        if seen.insert(message.signature()) {
            merged.push(message.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use quill_core::Channel;

    use super::*;

    fn turn(speaker: &str, text: &str) -> StructuredMessage {
        StructuredMessage::text(Channel::User, speaker, text)
    }

    #[test]
    fn unit_empty_accumulated_returns_copy_of_new_batch() {
        let batch = vec![turn("alice", "one"), turn("alice", "two")];
        let merged = merge_batches(&[], &batch);
        assert_eq!(merged, batch);
    }

    #[test]
    fn unit_empty_new_batch_returns_copy_of_accumulated() {
        let accumulated = vec![turn("alice", "one")];
        let merged = merge_batches(&accumulated, &[]);
        assert_eq!(merged, accumulated);
    }

    #[test]
    fn unit_merge_appends_only_novel_signatures() {
        let accumulated = vec![turn("alice", "one"), turn("bob", "two")];
        let batch = vec![turn("bob", "two"), turn("alice", "three")];
        let merged = merge_batches(&accumulated, &batch);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[2].content_lines(), vec!["three"]);
    }

    #[test]
    fn unit_merge_dedupes_within_new_batch() {
        let accumulated = vec![turn("alice", "one")];
        let batch = vec![turn("bob", "two"), turn("bob", "two"), turn("bob", "two")];
        let merged = merge_batches(&accumulated, &batch);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn unit_merge_result_has_no_duplicate_signatures() {
        let accumulated = vec![turn("alice", "one"), turn("bob", "two")];
        let batch = vec![
            turn("alice", "one"),
            turn("bob", "two"),
            turn("carol", "three"),
            turn("carol", "three"),
        ];
        let merged = merge_batches(&accumulated, &batch);
        let signatures: std::collections::HashSet<String> =
            merged.iter().map(|message| message.signature()).collect();
        assert_eq!(signatures.len(), merged.len());
    }

    #[test]
    fn unit_merge_never_mutates_inputs() {
        let accumulated = vec![turn("alice", "one")];
        let batch = vec![turn("bob", "two")];
        let accumulated_before = accumulated.clone();
        let batch_before = batch.clone();
        let _ = merge_batches(&accumulated, &batch);
        assert_eq!(accumulated, accumulated_before);
        assert_eq!(batch, batch_before);
    }

    #[test]
    fn regression_same_speaker_same_text_different_channel_is_novel() {
        let accumulated = vec![turn("pat", "status")];
        let mut assistant = turn("pat", "status");
        assistant.channel = Channel::Assistant;
        let merged = merge_batches(&accumulated, &[assistant]);
        assert_eq!(merged.len(), 2);
    }
}
