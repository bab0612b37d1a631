//! Single enrollment (C9): dedup → enroll → persist → publish, run
//! synchronously on the calling worker. The image → template step is out
//! of scope here (spec §1) — callers hand this a template the
//! feature-extraction pipeline already produced.

use std::sync::Arc;

use tracing::{instrument, warn};
use uuid::Uuid;

use crate::bus::ChangeBus;
use crate::codec::{self, IrisTemplate, PackMode};
use crate::error::Result;
use crate::gallery::{EyeSide, Gallery, GalleryPayload};
use crate::he::{self, blob as he_blob, HeContext};
use crate::matcher::plaintext::PlaintextMatcher;
use crate::store::{NewTemplateRow, Store};

/// Outcome of one enrollment attempt. `Duplicate` carries the existing
/// identity so the caller can report it without a second round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrollOutcome {
    Enrolled { template_id: Uuid },
    Duplicate { existing_identity_id: Uuid, existing_identity_name: String },
}

/// Drives enrollment against a [`Gallery`]/[`Store`] pair, with an optional
/// change-bus publish on success. When `he_ctx` is set the enrollee's
/// template is encrypted before it is stored (spec's single-process-wide-HE
/// model: a deployment runs either entirely in HE mode or not at all), the
/// same way `encrypt_probe` encrypts the probe side in `matcher::he`.
pub struct SingleEnroller<S: Store> {
    gallery: Arc<Gallery<S>>,
    store: Arc<S>,
    bus: Option<Arc<ChangeBus>>,
    he_ctx: Option<HeContext>,
    matcher: PlaintextMatcher,
    dedup_threshold: f64,
}

impl<S: Store> SingleEnroller<S> {
    pub fn new(
        gallery: Arc<Gallery<S>>,
        store: Arc<S>,
        bus: Option<Arc<ChangeBus>>,
        matcher: PlaintextMatcher,
        dedup_threshold: f64,
    ) -> Self {
        Self {
            gallery,
            store,
            bus,
            he_ctx: None,
            matcher,
            dedup_threshold,
        }
    }

    /// Builds an enroller for an HE-mode deployment: every successful
    /// enrollment is encrypted under `he_ctx` before it reaches the gallery
    /// or the store.
    pub fn with_he_context(
        gallery: Arc<Gallery<S>>,
        store: Arc<S>,
        bus: Option<Arc<ChangeBus>>,
        he_ctx: HeContext,
        matcher: PlaintextMatcher,
        dedup_threshold: f64,
    ) -> Self {
        Self {
            gallery,
            store,
            bus,
            he_ctx: Some(he_ctx),
            matcher,
            dedup_threshold,
        }
    }

    /// Runs one enrollment. Ordering per spec §5: gallery insertion
    /// happens-before durability, durability happens-before the change
    /// event. A publish failure is logged and does not fail the call —
    /// the template is already durably enrolled by that point.
    #[instrument(skip(self, template))]
    pub async fn enroll(
        &self,
        identity_id: Uuid,
        identity_name: String,
        eye_side: EyeSide,
        template: IrisTemplate,
        quality_score: f64,
        device_id: String,
    ) -> Result<EnrollOutcome> {
        template.validate()?;

        let snapshot = self.gallery.snapshot();
        let (width, height, n_scales) = template.dims();

        let (payload, iris_codes_bytes, mask_codes_bytes, iris_popcount, mask_popcount) = match &self.he_ctx {
            Some(ctx) => {
                let he_template = he::encrypt_template(ctx, &template.iris_codes, &template.mask_codes)?;
                let he_matcher = crate::matcher::he::HeMatcher::new(ctx.clone());
                let probe = he_matcher.encrypt_probe(&template.iris_codes, &template.mask_codes)?;
                let dup = he_matcher.match_1n_local(&probe, &snapshot, self.dedup_threshold)?;
                if dup.is_match {
                    return Ok(EnrollOutcome::Duplicate {
                        existing_identity_id: dup.matched_identity_id.expect("is_match implies identity"),
                        existing_identity_name: dup.matched_identity_name.expect("is_match implies name"),
                    });
                }
                let iris_codes_bytes = he_blob::pack_he_codes(&he_template.iris_cts)?;
                let mask_codes_bytes = he_blob::pack_he_codes(&he_template.mask_cts)?;
                let iris_popcount = he_template.iris_popcount.clone();
                let mask_popcount = he_template.mask_popcount.clone();
                (GalleryPayload::He(he_template), iris_codes_bytes, mask_codes_bytes, iris_popcount, mask_popcount)
            }
            None => {
                let dup = self.matcher.match_1n(&template, &snapshot, self.dedup_threshold);
                if dup.is_match {
                    return Ok(EnrollOutcome::Duplicate {
                        existing_identity_id: dup.matched_identity_id.expect("is_match implies identity"),
                        existing_identity_name: dup.matched_identity_name.expect("is_match implies name"),
                    });
                }
                let iris_codes_bytes = codec::pack(&template.iris_codes, PackMode::Plain)?;
                let mask_codes_bytes = codec::pack(&template.mask_codes, PackMode::Plain)?;
                (GalleryPayload::Plain(template), iris_codes_bytes, mask_codes_bytes, Vec::new(), Vec::new())
            }
        };

        let template_id = self.gallery.enroll(identity_id, identity_name.clone(), eye_side, payload);

        self.store.ensure_identity(identity_id, &identity_name).await?;
        self.store
            .persist_template(NewTemplateRow {
                template_id,
                identity_id,
                eye_side,
                iris_codes: iris_codes_bytes,
                mask_codes: mask_codes_bytes,
                width,
                height,
                n_scales,
                quality_score,
                device_id,
                iris_popcount,
                mask_popcount,
            })
            .await?;

        if let Some(bus) = &self.bus {
            if let Err(e) = bus.publish_enrolled(template_id, identity_id).await {
                warn!(error = %e, template_id = %template_id, "failed to publish enrolled event");
            }
        }

        Ok(EnrollOutcome::Enrolled { template_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodeGrid;
    use crate::store::mock::InMemoryStore;

    fn sample_template(seed: u8) -> IrisTemplate {
        let bits: Vec<u8> = (0..(4 * 8 * 2)).map(|i| ((i as u8 + seed) % 2)).collect();
        let mask = vec![1u8; 4 * 8 * 2];
        IrisTemplate {
            iris_codes: vec![CodeGrid::new(4, 8, 2, bits).unwrap()],
            mask_codes: vec![CodeGrid::new(4, 8, 2, mask).unwrap()],
        }
    }

    fn matcher() -> PlaintextMatcher {
        PlaintextMatcher::new(2, 0.45 * 64.0, 5e-5)
    }

    #[tokio::test]
    async fn first_enrollment_succeeds_and_persists() {
        let store = Arc::new(InMemoryStore::new());
        let gallery = Arc::new(Gallery::new(Arc::clone(&store)));
        let enroller = SingleEnroller::new(Arc::clone(&gallery), Arc::clone(&store), None, matcher(), 0.32);

        let outcome = enroller
            .enroll(Uuid::new_v4(), "alice".into(), EyeSide::Left, sample_template(1), 0.9, "dev-1".into())
            .await
            .unwrap();

        assert!(matches!(outcome, EnrollOutcome::Enrolled { .. }));
        assert_eq!(gallery.size(), 1);
        assert_eq!(store.template_count(), 1);
    }

    #[tokio::test]
    async fn second_identical_enrollment_is_rejected_as_duplicate() {
        let store = Arc::new(InMemoryStore::new());
        let gallery = Arc::new(Gallery::new(Arc::clone(&store)));
        let enroller = SingleEnroller::new(Arc::clone(&gallery), Arc::clone(&store), None, matcher(), 0.32);

        let identity_a = Uuid::new_v4();
        enroller
            .enroll(identity_a, "alice".into(), EyeSide::Left, sample_template(5), 0.9, "dev-1".into())
            .await
            .unwrap();

        let outcome = enroller
            .enroll(Uuid::new_v4(), "bob".into(), EyeSide::Left, sample_template(5), 0.9, "dev-1".into())
            .await
            .unwrap();

        match outcome {
            EnrollOutcome::Duplicate { existing_identity_id, .. } => assert_eq!(existing_identity_id, identity_a),
            EnrollOutcome::Enrolled { .. } => panic!("expected a duplicate rejection"),
        }
        assert_eq!(gallery.size(), 1);
        assert_eq!(store.template_count(), 1);
    }

    fn he_sized_template(bits: impl Fn(usize) -> u8) -> IrisTemplate {
        let v: Vec<u8> = (0..crate::he::context::SLOTS_PER_SCALE).map(bits).collect();
        let mask = vec![1u8; crate::he::context::SLOTS_PER_SCALE];
        IrisTemplate {
            iris_codes: vec![CodeGrid::new(16, 256, 2, v).unwrap()],
            mask_codes: vec![CodeGrid::new(16, 256, 2, mask).unwrap()],
        }
    }

    #[tokio::test]
    async fn he_mode_enrollment_persists_an_he_payload_with_popcounts() {
        let store = Arc::new(InMemoryStore::new());
        let gallery = Arc::new(Gallery::new(Arc::clone(&store)));
        let ctx = crate::he::HeContext::ephemeral().unwrap();
        let enroller =
            SingleEnroller::with_he_context(Arc::clone(&gallery), Arc::clone(&store), None, ctx, matcher(), 0.32);

        let template = he_sized_template(|i| (i % 5 == 0) as u8);
        let outcome = enroller
            .enroll(Uuid::new_v4(), "alice".into(), EyeSide::Left, template, 0.9, "dev-1".into())
            .await
            .unwrap();
        let EnrollOutcome::Enrolled { template_id } = outcome else {
            panic!("expected a fresh enrollment");
        };

        let snapshot = gallery.snapshot();
        assert!(matches!(snapshot[0].payload, GalleryPayload::He(_)));

        let row = store.load_template(template_id).await.unwrap().unwrap();
        assert!(crate::he::blob::is_he_blob(&row.iris_codes));
        assert!(!row.iris_popcount.is_empty());
        assert_eq!(row.iris_popcount.len(), row.mask_popcount.len());
    }

    #[tokio::test]
    async fn he_mode_second_identical_enrollment_is_rejected_as_duplicate() {
        let store = Arc::new(InMemoryStore::new());
        let gallery = Arc::new(Gallery::new(Arc::clone(&store)));
        let ctx = crate::he::HeContext::ephemeral().unwrap();
        let enroller =
            SingleEnroller::with_he_context(Arc::clone(&gallery), Arc::clone(&store), None, ctx, matcher(), 0.32);

        let identity_a = Uuid::new_v4();
        enroller
            .enroll(identity_a, "alice".into(), EyeSide::Left, he_sized_template(|i| (i % 7 == 0) as u8), 0.9, "dev-1".into())
            .await
            .unwrap();

        let outcome = enroller
            .enroll(
                Uuid::new_v4(),
                "bob".into(),
                EyeSide::Left,
                he_sized_template(|i| (i % 7 == 0) as u8),
                0.9,
                "dev-1".into(),
            )
            .await
            .unwrap();

        match outcome {
            EnrollOutcome::Duplicate { existing_identity_id, .. } => assert_eq!(existing_identity_id, identity_a),
            EnrollOutcome::Enrolled { .. } => panic!("expected a duplicate rejection"),
        }
        assert_eq!(gallery.size(), 1);
    }
}
