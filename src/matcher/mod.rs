//! Matcher (C6): plaintext 1:N with rotational Hamming + normalization, and
//! the HE variant (local or delegated decryption).

pub mod he;
pub mod plaintext;

use uuid::Uuid;

use crate::gallery::GalleryEntry;
use crate::store::MatchLogEntry;

/// Outcome of a 1:N query against a gallery snapshot. `is_match` is
/// `distance < threshold`; `distance` is always reported, even on no-match,
/// so callers can log it.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub distance: f64,
    pub is_match: bool,
    pub matched_identity_id: Option<Uuid>,
    pub matched_identity_name: Option<String>,
    pub matched_template_id: Option<Uuid>,
}

impl MatchOutcome {
    pub fn no_match() -> Self {
        Self {
            distance: 1.0,
            is_match: false,
            matched_identity_id: None,
            matched_identity_name: None,
            matched_template_id: None,
        }
    }
}

/// Builds the match-log entry for a completed 1:N query, re-deriving
/// `matched_template_id` from the *current* snapshot rather than trusting
/// whatever `outcome.matched_template_id` the matcher itself captured.
/// This mirrors `core.py::log_match`/`_lookup_template_id`: the original
/// only carries a matched identity through to logging and performs a
/// fresh gallery scan at log time to find that identity's template id.
pub fn match_log_entry(
    snapshot: &[GalleryEntry],
    outcome: &MatchOutcome,
    probe_frame_id: String,
    device_id: String,
    latency_ms: f64,
) -> MatchLogEntry {
    let matched_identity_id = outcome.is_match.then_some(outcome.matched_identity_id).flatten();
    let matched_template_id = matched_identity_id
        .and_then(|id| snapshot.iter().find(|entry| entry.identity_id == id))
        .map(|entry| entry.template_id);

    MatchLogEntry {
        probe_frame_id,
        matched_template_id,
        matched_identity_id,
        hamming_distance: outcome.distance,
        is_match: outcome.is_match,
        device_id,
        latency_ms,
    }
}

#[cfg(test)]
mod log_tests {
    use super::*;
    use crate::gallery::{EyeSide, GalleryPayload};
    use crate::codec::{CodeGrid, IrisTemplate};

    fn entry(identity_id: Uuid, template_id: Uuid) -> GalleryEntry {
        GalleryEntry {
            identity_id,
            template_id,
            identity_name: "alice".into(),
            eye_side: EyeSide::Left,
            payload: GalleryPayload::Plain(IrisTemplate {
                iris_codes: vec![CodeGrid::zeros(1, 1, 1)],
                mask_codes: vec![CodeGrid::zeros(1, 1, 1)],
            }),
        }
    }

    #[test]
    fn matched_template_id_is_re_derived_from_snapshot() {
        let identity_id = Uuid::new_v4();
        let template_id = Uuid::new_v4();
        let snapshot = vec![entry(identity_id, template_id)];
        let outcome = MatchOutcome {
            distance: 0.01,
            is_match: true,
            matched_identity_id: Some(identity_id),
            matched_identity_name: Some("alice".into()),
            matched_template_id: None,
        };
        let log = match_log_entry(&snapshot, &outcome, "frame-1".into(), "dev-1".into(), 3.0);
        assert_eq!(log.matched_template_id, Some(template_id));
        assert_eq!(log.matched_identity_id, Some(identity_id));
    }

    #[test]
    fn no_match_never_carries_identity_or_template() {
        let snapshot = vec![entry(Uuid::new_v4(), Uuid::new_v4())];
        let outcome = MatchOutcome::no_match();
        let log = match_log_entry(&snapshot, &outcome, "frame-2".into(), "dev-1".into(), 1.0);
        assert!(log.matched_identity_id.is_none());
        assert!(log.matched_template_id.is_none());
    }
}
