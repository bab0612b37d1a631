//! End-to-end scenarios from the registry's testable-properties list:
//! enroll-then-match, dedup rejection, and a two-node convergence via the
//! gallery's reload path (the bus transport itself needs a live NATS
//! instance, so convergence here exercises `reload_from_store` directly,
//! which is the half of the protocol this crate owns end to end).

use std::sync::Arc;

use irisreg_core::codec::{CodeGrid, IrisTemplate};
use irisreg_core::gallery::{EyeSide, Gallery};
use irisreg_core::matcher::plaintext::PlaintextMatcher;
use irisreg_core::store::mock::InMemoryStore;
use irisreg_core::{EnrollOutcome, SingleEnroller, Store};

const MATCH_THRESHOLD: f64 = 0.39;
const DEDUP_THRESHOLD: f64 = 0.32;

fn matcher() -> PlaintextMatcher {
    PlaintextMatcher::new(15, 0.45 * 8192.0, 5e-5)
}

fn template_of(seed: u8) -> IrisTemplate {
    let bits: Vec<u8> = (0..(16 * 256 * 2)).map(|i| ((i as u8).wrapping_add(seed) % 2)).collect();
    let mask = vec![1u8; 16 * 256 * 2];
    IrisTemplate {
        iris_codes: vec![CodeGrid::new(16, 256, 2, bits).unwrap()],
        mask_codes: vec![CodeGrid::new(16, 256, 2, mask).unwrap()],
    }
}

#[tokio::test]
async fn enroll_then_match_same_frame() {
    let store = Arc::new(InMemoryStore::new());
    let gallery = Arc::new(Gallery::new(Arc::clone(&store)));
    let enroller = SingleEnroller::new(Arc::clone(&gallery), Arc::clone(&store), None, matcher(), DEDUP_THRESHOLD);

    let template = template_of(7);
    let outcome = enroller
        .enroll(uuid::Uuid::new_v4(), "alice".into(), EyeSide::Left, template.clone(), 0.9, "dev-1".into())
        .await
        .unwrap();
    let EnrollOutcome::Enrolled { .. } = outcome else {
        panic!("expected a fresh enrollment");
    };

    let snapshot = gallery.snapshot();
    let result = matcher().match_1n(&template, &snapshot, MATCH_THRESHOLD);
    assert!(result.is_match);
    assert!(result.distance < 1e-9);
}

#[tokio::test]
async fn dedup_rejects_second_enrollment_of_same_template() {
    let store = Arc::new(InMemoryStore::new());
    let gallery = Arc::new(Gallery::new(Arc::clone(&store)));
    let enroller = SingleEnroller::new(Arc::clone(&gallery), Arc::clone(&store), None, matcher(), DEDUP_THRESHOLD);

    let template = template_of(3);
    let identity_a = uuid::Uuid::new_v4();
    enroller
        .enroll(identity_a, "alice".into(), EyeSide::Left, template.clone(), 0.9, "dev-1".into())
        .await
        .unwrap();

    let outcome = enroller
        .enroll(uuid::Uuid::new_v4(), "bob".into(), EyeSide::Left, template, 0.9, "dev-1".into())
        .await
        .unwrap();

    match outcome {
        EnrollOutcome::Duplicate { existing_identity_id, .. } => assert_eq!(existing_identity_id, identity_a),
        EnrollOutcome::Enrolled { .. } => panic!("expected a duplicate rejection"),
    }
    assert_eq!(gallery.size(), 1);
    assert_eq!(store.template_count(), 1);
}

#[tokio::test]
async fn second_node_converges_after_reload_from_store() {
    let store = Arc::new(InMemoryStore::new());

    // Node 1's gallery, backed by the shared store.
    let gallery_node_1 = Arc::new(Gallery::new(Arc::clone(&store)));
    let enroller = SingleEnroller::new(Arc::clone(&gallery_node_1), Arc::clone(&store), None, matcher(), DEDUP_THRESHOLD);
    let template = template_of(9);
    enroller
        .enroll(uuid::Uuid::new_v4(), "alice".into(), EyeSide::Left, template.clone(), 0.9, "dev-1".into())
        .await
        .unwrap();

    // Node 2 starts with an empty gallery, pointed at the same store; a
    // debounced reload (simulated directly here) picks up node 1's write.
    let gallery_node_2 = Arc::new(Gallery::new(Arc::clone(&store)));
    assert_eq!(gallery_node_2.size(), 0);
    let reloaded = gallery_node_2.reload_from_store().await.unwrap();
    assert_eq!(reloaded, 1);

    let snapshot = gallery_node_2.snapshot();
    let result = matcher().match_1n(&template, &snapshot, MATCH_THRESHOLD);
    assert!(result.is_match);
}

#[tokio::test]
async fn reload_from_store_is_idempotent_with_no_intervening_writes() {
    let store = Arc::new(InMemoryStore::new());
    let gallery = Arc::new(Gallery::new(Arc::clone(&store)));
    let enroller = SingleEnroller::new(Arc::clone(&gallery), Arc::clone(&store), None, matcher(), DEDUP_THRESHOLD);
    enroller
        .enroll(uuid::Uuid::new_v4(), "alice".into(), EyeSide::Left, template_of(1), 0.9, "dev-1".into())
        .await
        .unwrap();
    enroller
        .enroll(uuid::Uuid::new_v4(), "bob".into(), EyeSide::Right, template_of(2), 0.9, "dev-1".into())
        .await
        .unwrap();

    let first = gallery.reload_from_store().await.unwrap();
    let first_snapshot = gallery.snapshot();
    let second = gallery.reload_from_store().await.unwrap();
    let second_snapshot = gallery.snapshot();

    assert_eq!(first, second);
    assert_eq!(first_snapshot.len(), second_snapshot.len());
    let mut first_ids: Vec<_> = first_snapshot.iter().map(|e| e.template_id).collect();
    let mut second_ids: Vec<_> = second_snapshot.iter().map(|e| e.template_id).collect();
    first_ids.sort();
    second_ids.sort();
    assert_eq!(first_ids, second_ids);
}

#[tokio::test]
async fn ensure_identity_upsert_is_last_writer_wins() {
    let store = InMemoryStore::new();
    let identity_id = uuid::Uuid::new_v4();
    store.ensure_identity(identity_id, "alice").await.unwrap();
    store.ensure_identity(identity_id, "alice-renamed").await.unwrap();

    let identities = store.list_identities().await.unwrap();
    let found = identities.iter().find(|i| i.identity_id == identity_id).unwrap();
    assert_eq!(found.name, "alice-renamed");
}

#[tokio::test]
async fn empty_gallery_never_touches_store_and_reports_no_match() {
    let store = Arc::new(InMemoryStore::new());
    let gallery = Gallery::new(Arc::clone(&store));
    let snapshot = gallery.snapshot();
    let result = matcher().match_1n(&template_of(0), &snapshot, MATCH_THRESHOLD);
    assert!(!result.is_match);
    assert!((result.distance - 1.0).abs() < f64::EPSILON);
    assert_eq!(store.template_count(), 0);
}
