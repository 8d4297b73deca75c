mod common;

use common::provider::TestTreeProvider;
use common::{field, leaves, text};
use shared_tree::change::ChangeCodec;
use shared_tree::{
    BranchId, ChangeError, Changeset, EditManagerError, Error, FieldPath, Op, RevisionTag, SequencedOp, SessionId,
    SharedTree,
};

const ROOT: BranchId = BranchId::ROOT;

/// First commit of an unknown session, sequenced right after everything
/// `tree` has processed.
fn foreign(tree: &SharedTree, op: Op) -> SequencedOp {
    let session = SessionId::from_raw(77);
    let last = tree.edit_manager().last_sequence_number();
    SequencedOp {
        sequence_number: last + 1,
        reference_sequence_number: last,
        minimum_sequence_number: 0,
        session,
        edit_number: 0,
        revision: RevisionTag { session, local: 0 },
        contents: ChangeCodec::encode(&Changeset::from(op)).unwrap(),
    }
}

fn delete(index: usize, count: usize) -> Op {
    Op::Delete {
        field: FieldPath::root("s"),
        index,
        count,
    }
}

#[test]
fn trunk_stays_bounded_by_the_minimum_sequence_number() {
    let mut provider = TestTreeProvider::new(2);
    for round in 0..10 {
        provider.trees[0].insert(ROOT, &field("s"), 0, leaves("a")).unwrap();
        provider.trees[1].insert(ROOT, &field("t"), 0, leaves("b")).unwrap();
        provider.ensure_synchronized();
        for tree in &provider.trees {
            assert!(
                tree.edit_manager().trunk().len() <= 2,
                "round {round}: {} trunk commits",
                tree.edit_manager().trunk().len()
            );
        }
    }

    provider.advance_minimum_sequence_number();
    for tree in &provider.trees {
        let edit_manager = tree.edit_manager();
        assert!(edit_manager.trunk().is_empty());
        assert_eq!(edit_manager.trunk_base(), 20);
        assert_eq!(edit_manager.peer_count(), 0);
        assert_eq!(text(tree.forest(), "s"), "aaaaaaaaaa");
    }
}

#[test]
fn in_flight_peer_commits_keep_their_branch() {
    let mut provider = TestTreeProvider::new(2);
    provider.trees[0].insert(ROOT, &field("s"), 0, leaves("ab")).unwrap();
    provider.ensure_synchronized();

    // Two commits against the same reference; only the first is delivered.
    provider.trees[1].insert(ROOT, &field("s"), 2, leaves("c")).unwrap();
    provider.trees[1].insert(ROOT, &field("s"), 3, leaves("d")).unwrap();
    provider.collect();
    provider.trees[0].delete(ROOT, &field("s"), 0, 1).unwrap();
    provider.sequence_all();
    provider.process(0, 1);
    assert_eq!(provider.trees[0].edit_manager().peer_count(), 1);

    provider.ensure_synchronized();
    for tree in &provider.trees {
        assert_eq!(text(tree.forest(), "s"), "bcd");
    }
}

#[test]
fn replayed_sequence_number_is_rejected() {
    let mut provider = TestTreeProvider::new(2);
    provider.trees[0].insert(ROOT, &field("s"), 0, leaves("a")).unwrap();
    let op = provider.trees[0].take_outbound().remove(0).sequenced(1, 0);

    let tree = &mut provider.trees[1];
    tree.process_sequenced(op.clone()).unwrap();
    assert_eq!(
        tree.process_sequenced(op),
        Err(Error::EditManager(EditManagerError::OutOfOrderSequence {
            last: 1,
            found: 1
        }))
    );
    assert_eq!(text(tree.forest(), "s"), "a");
}

#[test]
fn skipped_edit_number_is_rejected() {
    let mut provider = TestTreeProvider::new(2);
    provider.trees[0].insert(ROOT, &field("s"), 0, leaves("a")).unwrap();
    provider.trees[0].insert(ROOT, &field("s"), 1, leaves("b")).unwrap();
    let second = provider.trees[0].take_outbound().remove(1).sequenced(1, 0);

    let err = provider.trees[1].process_sequenced(second).unwrap_err();
    assert!(matches!(
        err,
        Error::EditManager(EditManagerError::OutOfOrderEdit {
            expected: 0,
            found: 1,
            ..
        })
    ));
}

#[test]
fn sequenced_commit_that_does_not_apply_is_fatal() {
    let mut provider = TestTreeProvider::new(1);
    provider.trees[0].insert(ROOT, &field("s"), 0, leaves("ab")).unwrap();
    provider.ensure_synchronized();
    let tree = &mut provider.trees[0];
    let trunk = tree.edit_manager().trunk().to_vec();

    let op = foreign(tree, delete(7, 1));
    let err = tree.process_sequenced(op).unwrap_err();
    assert!(matches!(
        err,
        Error::EditManager(EditManagerError::InvalidSequencedChange {
            sequence_number: 2,
            error: ChangeError::OutOfBounds { .. },
        })
    ));
    assert_eq!(tree.edit_manager().last_sequence_number(), 1);
    assert_eq!(tree.edit_manager().trunk(), &trunk[..]);
    assert_eq!(text(tree.sequenced_forest(), "s"), "ab");
    assert_eq!(text(tree.forest(), "s"), "ab");

    // Nothing was recorded, so the same slot still takes a valid commit.
    let op = foreign(tree, delete(0, 1));
    tree.process_sequenced(op).unwrap();
    assert_eq!(text(tree.forest(), "s"), "b");
}

#[test]
fn sequenced_commit_with_an_overflowing_range_is_rejected() {
    let mut provider = TestTreeProvider::new(1);
    provider.trees[0].insert(ROOT, &field("s"), 0, leaves("ab")).unwrap();
    provider.ensure_synchronized();
    let tree = &mut provider.trees[0];

    let op = foreign(tree, delete(1, usize::MAX));
    let err = tree.process_sequenced(op).unwrap_err();
    assert!(matches!(err, Error::Change(ChangeError::Decode(_))));

    let op = foreign(tree, delete(0, usize::MAX));
    let err = tree.process_sequenced(op).unwrap_err();
    assert!(matches!(
        err,
        Error::EditManager(EditManagerError::InvalidSequencedChange { .. })
    ));
    assert_eq!(text(tree.forest(), "s"), "ab");
}
