mod common;

use common::provider::TestTreeProvider;
use common::storage::MemoryStorage;
use common::{field, leaves, text};
use serde_json::json;
use shared_tree::shared_tree::{CONTENT_BLOB, EDIT_MANAGER_BLOB};
use shared_tree::{BranchId, SessionId, SharedTree, SharedTreeOptions, TreeNode};
use shared_tree_summarizer::{SubmitSummaryOptions, SubmitSummaryResult, SummaryObject, SummaryTree, CHANNELS_TREE_NAME};

const ROOT: BranchId = BranchId::ROOT;

/// Submits a summary of tree `index` and acknowledges it; returns the handle
/// and reference sequence number.
fn summarize(provider: &mut TestTreeProvider, storage: &mut MemoryStorage, index: usize) -> (String, u64) {
    let result = provider.trees[index].submit_summary(storage, &SubmitSummaryOptions::default());
    let (handle, reference_sequence_number) = match result {
        SubmitSummaryResult::Submit {
            handle,
            reference_sequence_number,
            error: None,
            ..
        } => (handle, reference_sequence_number),
        other => panic!("summary failed: {other:?}"),
    };
    let ack = provider.trees[index]
        .process_summary_ack(&handle, reference_sequence_number, || unreachable!())
        .unwrap();
    assert!(ack.latest_summary_updated);
    assert!(ack.was_summary_tracked);
    (handle, reference_sequence_number)
}

fn channels(summary: &SummaryTree) -> &SummaryTree {
    summary
        .get(CHANNELS_TREE_NAME)
        .and_then(SummaryObject::as_tree)
        .expect("summary has a channels tree")
}

fn two_fields() -> TestTreeProvider {
    let mut provider = TestTreeProvider::new(1);
    provider.trees[0].insert(ROOT, &field("a"), 0, leaves("xy")).unwrap();
    provider.trees[0].insert(ROOT, &field("b"), 0, leaves("z")).unwrap();
    provider.ensure_synchronized();
    provider
}

#[test]
fn first_summary_serializes_every_field() {
    let mut provider = two_fields();
    let mut storage = MemoryStorage::default();
    let (handle, reference) = summarize(&mut provider, &mut storage, 0);
    assert_eq!(handle, "summary-1");
    assert_eq!(reference, 2);

    let upload = storage.last_upload().unwrap();
    assert!(matches!(upload.get(EDIT_MANAGER_BLOB), Some(SummaryObject::Blob { .. })));
    let channels = channels(upload);
    for key in ["a", "b"] {
        let field = channels.get(key).and_then(SummaryObject::as_tree).unwrap();
        assert!(matches!(field.get(CONTENT_BLOB), Some(SummaryObject::Blob { .. })));
    }
    assert_eq!(
        storage.proposals.last().map(|proposal| proposal.head.clone()),
        Some(None)
    );
}

#[test]
fn unchanged_fields_reuse_the_previous_summary() {
    let mut provider = two_fields();
    let mut storage = MemoryStorage::default();
    summarize(&mut provider, &mut storage, 0);

    provider.trees[0].insert(ROOT, &field("a"), 2, leaves("w")).unwrap();
    provider.ensure_synchronized();
    let (handle, reference) = summarize(&mut provider, &mut storage, 0);
    assert_eq!(reference, 3);

    let channels = channels(storage.last_upload().unwrap());
    assert!(matches!(channels.get("a"), Some(SummaryObject::Tree(_))));
    match channels.get("b") {
        Some(SummaryObject::Handle { handle, .. }) => assert_eq!(handle, "/.channels/b"),
        other => panic!("expected a handle, got {other:?}"),
    }
    assert_eq!(
        storage.proposals.last().and_then(|proposal| proposal.head.clone()),
        Some("summary-1".to_string())
    );

    // The handle resolves to the content of the previous summary.
    let snapshot = storage.snapshot(&handle).unwrap();
    let b = &snapshot.trees[CHANNELS_TREE_NAME].trees["b"];
    let nodes: Vec<TreeNode> = serde_json::from_str(&b.blobs[CONTENT_BLOB]).unwrap();
    assert_eq!(nodes, leaves("z"));
}

#[test]
fn a_field_created_after_the_summary_is_serialized() {
    let mut provider = two_fields();
    let mut storage = MemoryStorage::default();
    summarize(&mut provider, &mut storage, 0);

    provider.trees[0].insert(ROOT, &field("c"), 0, leaves("q")).unwrap();
    provider.ensure_synchronized();
    summarize(&mut provider, &mut storage, 0);

    let channels = channels(storage.last_upload().unwrap());
    assert!(matches!(channels.get("a"), Some(SummaryObject::Handle { .. })));
    assert!(matches!(channels.get("c"), Some(SummaryObject::Tree(_))));
}

#[test]
fn a_session_loaded_from_a_summary_joins_the_document() {
    let mut provider = TestTreeProvider::new(2);
    provider.trees[0].insert(ROOT, &field("a"), 0, leaves("abc")).unwrap();
    provider.trees[1].insert(ROOT, &field("b"), 0, leaves("12")).unwrap();
    provider.ensure_synchronized();
    let mut storage = MemoryStorage::default();
    let (handle, reference) = summarize(&mut provider, &mut storage, 0);

    let snapshot = storage.snapshot(&handle).unwrap().clone();
    let joined = SharedTree::load(
        SessionId::from_raw(9),
        SharedTreeOptions::default(),
        &snapshot,
        reference,
    )
    .unwrap();
    assert_eq!(joined.forest(), provider.trees[0].forest());
    assert_eq!(joined.edit_manager().last_sequence_number(), reference);
    let index = provider.join(joined, reference);

    provider.trees[index].delete(ROOT, &field("a"), 0, 1).unwrap();
    provider.trees[0].insert(ROOT, &field("a"), 3, leaves("d")).unwrap();
    provider.trees[1].insert(ROOT, &field("b"), 0, leaves("0")).unwrap();
    provider.ensure_synchronized();
    for tree in &provider.trees {
        assert_eq!(text(tree.forest(), "a"), "bcd");
        assert_eq!(text(tree.forest(), "b"), "012");
    }
}

#[test]
fn unknown_proposal_falls_back_to_the_snapshot() {
    let mut provider = TestTreeProvider::new(2);
    provider.trees[0].insert(ROOT, &field("a"), 0, leaves("abc")).unwrap();
    provider.ensure_synchronized();
    let mut storage = MemoryStorage::default();
    let (handle, reference) = summarize(&mut provider, &mut storage, 0);

    // Tree 1 never tracked that summary.
    let snapshot = storage.snapshot(&handle).unwrap().clone();
    let ack = provider.trees[1]
        .process_summary_ack(&handle, reference, || Ok(snapshot))
        .unwrap();
    assert!(ack.latest_summary_updated);
    assert!(!ack.was_summary_tracked);
    assert_eq!(provider.trees[1].summarizer().reference_sequence_number(), Some(reference));
}

#[test]
fn create_summary_leaves_tracking_state_alone() {
    let mut provider = two_fields();
    let summary = provider.trees[0].create_summary(false).unwrap();
    let channels = channels(&summary);
    assert!(matches!(channels.get("a"), Some(SummaryObject::Tree(_))));
    assert!(matches!(channels.get("b"), Some(SummaryObject::Tree(_))));
    let summarizer = provider.trees[0].summarizer();
    assert_eq!(summarizer.pending_summary_count(), 0);
    assert!(summarizer.latest_summary().is_none());
}

#[test]
fn gc_data_lists_handle_values_per_field() {
    let mut provider = TestTreeProvider::new(1);
    let referencing = TreeNode::leaf("Leaf", json!({"$handle": "/blobs/x"}));
    provider.trees[0].insert(ROOT, &field("a"), 0, vec![referencing]).unwrap();
    provider.trees[0].insert(ROOT, &field("b"), 0, leaves("z")).unwrap();
    provider.ensure_synchronized();

    let data = provider.trees[0].get_gc_data(false).unwrap();
    assert_eq!(data.gc_nodes["/"], Vec::<String>::new());
    assert_eq!(data.gc_nodes["/a"], vec!["/blobs/x".to_string()]);
    assert_eq!(data.gc_nodes["/b"], Vec::<String>::new());

    provider.trees[0].delete(ROOT, &field("a"), 0, 1).unwrap();
    provider.ensure_synchronized();
    let data = provider.trees[0].get_gc_data(false).unwrap();
    assert_eq!(data.gc_nodes["/a"], Vec::<String>::new());
}
