//! End-to-end batch-enrollment scenario from the testable-properties list
//! (spec §8 #4): a ten-item work list with one unreadable image streams ten
//! data events in completion order, the failing item carries a non-null
//! error, and the summary reports `total=10, enrolled=9, duplicates=0,
//! errors=1`.

use std::sync::Arc;
use std::time::Duration;

use irisreg_core::codec::{CodeGrid, IrisTemplate};
use irisreg_core::enroll::{BatchOrchestrator, FeatureExtractor, WorkItem};
use irisreg_core::gallery::EyeSide;
use irisreg_core::matcher::plaintext::PlaintextMatcher;
use irisreg_core::store::mock::InMemoryStore;
use irisreg_core::{Gallery, PipelinePool};

/// A stub extractor that fails deterministically for one path and otherwise
/// derives a unique template from the path string, so every subject enrolls
/// as a distinct identity (no incidental dedup hits in this scenario).
struct StubExtractor;

impl FeatureExtractor for StubExtractor {
    fn extract(&mut self, raw_image_path: &str) -> Result<IrisTemplate, String> {
        if raw_image_path.ends_with("unreadable.png") {
            return Err("unreadable image file".into());
        }
        let seed = raw_image_path.bytes().fold(0u8, |acc, b| acc.wrapping_add(b));
        let bits: Vec<u8> = (0..(16 * 256 * 2)).map(|i| ((i as u8).wrapping_add(seed) % 2)).collect();
        let mask = vec![1u8; 16 * 256 * 2];
        Ok(IrisTemplate {
            iris_codes: vec![CodeGrid::new(16, 256, 2, bits).unwrap()],
            mask_codes: vec![CodeGrid::new(16, 256, 2, mask).unwrap()],
        })
    }
}

fn matcher() -> PlaintextMatcher {
    PlaintextMatcher::new(15, 0.45 * 8192.0, 5e-5)
}

#[tokio::test]
async fn batch_with_one_failing_image_reports_nine_enrolled_and_one_error() {
    let store = Arc::new(InMemoryStore::new());
    let gallery = Arc::new(Gallery::new(Arc::clone(&store)));
    let pool = Arc::new(PipelinePool::load(4, |_| StubExtractor));

    let orchestrator = Arc::new(BatchOrchestrator::new(
        Arc::clone(&gallery),
        Arc::clone(&store),
        None,
        pool,
        matcher(),
        0.32,
        None,
        Duration::from_secs(5),
    ));

    let items: Vec<WorkItem> = (0..10)
        .map(|i| WorkItem {
            subject_id: format!("subject-{i}"),
            eye_side: EyeSide::Left,
            raw_image_path: if i == 4 {
                "dataset/unreadable.png".to_owned()
            } else {
                format!("dataset/subject-{i}.png")
            },
            device_id: "dev-1".into(),
        })
        .collect();

    let (mut results, summary_rx) = orchestrator.run("dataset".into(), items);

    let mut received = Vec::new();
    while let Some(item) = results.recv().await {
        received.push(item);
    }
    assert_eq!(received.len(), 10, "every work item must produce exactly one streamed result");

    let failing: Vec<_> = received.iter().filter(|r| r.error.is_some()).collect();
    assert_eq!(failing.len(), 1, "exactly one item should carry a non-null error");
    assert_eq!(failing[0].subject_id, "subject-4");

    let summary = summary_rx.await.unwrap();
    assert_eq!(summary.total, 10);
    assert_eq!(summary.enrolled, 9);
    assert_eq!(summary.duplicates, 0);
    assert_eq!(summary.errors, 1);

    assert_eq!(gallery.size(), 9, "only the nine successful extractions should have been enrolled");
    assert_eq!(store.template_count(), 9);
}

#[tokio::test]
async fn rerunning_the_same_dataset_maps_subjects_to_the_same_identity() {
    use irisreg_core::enroll::batch::deterministic_identity_id;

    let a = deterministic_identity_id("dataset", "subject-0");
    let b = deterministic_identity_id("dataset", "subject-0");
    assert_eq!(a, b, "re-running a batch on the same dataset must reproduce the same identity id");
}
