//! Plaintext 1:N matching: rotation-minimized normalized fractional Hamming
//! distance (spec §4.6.1).

use tracing::warn;

use super::MatchOutcome;
use crate::codec::IrisTemplate;
use crate::gallery::{GalleryEntry, GalleryPayload};

#[derive(Debug, Clone, Copy)]
pub struct PlaintextMatcher {
    pub rotation_shift: i32,
    pub norm_mean_bits: f64,
    pub norm_gradient: f64,
}

impl PlaintextMatcher {
    pub fn new(rotation_shift: i32, norm_mean_bits: f64, norm_gradient: f64) -> Self {
        Self {
            rotation_shift,
            norm_mean_bits,
            norm_gradient,
        }
    }

    /// Rotation-minimized normalized fractional Hamming distance between a
    /// probe and one gallery template, averaged across scales.
    pub fn distance(&self, probe: &IrisTemplate, gallery: &IrisTemplate) -> Result<f64, String> {
        if probe.n_scales() != gallery.n_scales() || probe.n_scales() == 0 {
            return Err("scale count mismatch or zero scales".into());
        }

        let mut total = 0.0;
        for i in 0..probe.n_scales() {
            let probe_iris = &probe.iris_codes[i];
            let probe_mask = &probe.mask_codes[i];
            let gallery_iris = &gallery.iris_codes[i];
            let gallery_mask = &gallery.mask_codes[i];

            if !probe_iris.same_shape(gallery_iris) || !probe_mask.same_shape(gallery_mask) {
                return Err(format!("shape mismatch at scale {i}"));
            }

            let mut best = 1.0_f64;
            for r in -self.rotation_shift..=self.rotation_shift {
                let rotated_iris = probe_iris.rotated(r);
                let rotated_mask = probe_mask.rotated(r);

                let combined_mask = rotated_mask.and(gallery_mask);
                let bits_equal = combined_mask.popcount();
                let differ = rotated_iris.xor(gallery_iris).and(&combined_mask);
                let bits_differ = differ.popcount();

                let d_r = if bits_equal == 0 {
                    1.0
                } else {
                    bits_differ as f64 / bits_equal.max(1) as f64
                };
                if d_r < best {
                    best = d_r;
                }
            }
            total += best;
        }
        let mean = total / probe.n_scales() as f64;

        // Score normalization: corrects for unreliable masks using the
        // *best-alignment* equal-bit count at the last scale's rotation is
        // not representative; the normalization term uses the total usable
        // bits across all scales at zero rotation, matching the reference
        // convention of normalizing on raw mask coverage rather than the
        // per-rotation count.
        let total_bits: u32 = (0..probe.n_scales())
            .map(|i| probe.mask_codes[i].and(&gallery.mask_codes[i]).popcount())
            .sum();
        let normalized = mean + self.norm_gradient * (self.norm_mean_bits - total_bits as f64);
        Ok(normalized.clamp(0.0, 1.0))
    }

    /// 1:N search over a gallery snapshot. Empty gallery short-circuits to
    /// a no-match without touching per-entry distances. A per-entry
    /// computation failure is logged and that entry skipped — it never
    /// aborts the query.
    pub fn match_1n(&self, probe: &IrisTemplate, snapshot: &[GalleryEntry], threshold: f64) -> MatchOutcome {
        if snapshot.is_empty() {
            return MatchOutcome::no_match();
        }

        let mut best: Option<(f64, &GalleryEntry)> = None;
        for entry in snapshot {
            let GalleryPayload::Plain(ref template) = entry.payload else {
                continue;
            };
            match self.distance(probe, template) {
                Ok(d) => {
                    if best.as_ref().map(|(bd, _)| d < *bd).unwrap_or(true) {
                        best = Some((d, entry));
                    }
                }
                Err(e) => warn!(template_id = %entry.template_id, error = %e, "skipping entry with matching error"),
            }
        }

        match best {
            Some((distance, entry)) if distance < threshold => MatchOutcome {
                distance,
                is_match: true,
                matched_identity_id: Some(entry.identity_id),
                matched_identity_name: Some(entry.identity_name.clone()),
                matched_template_id: Some(entry.template_id),
            },
            Some((distance, _)) => MatchOutcome {
                distance,
                is_match: false,
                matched_identity_id: None,
                matched_identity_name: None,
                matched_template_id: None,
            },
            None => MatchOutcome::no_match(),
        }
    }
}
