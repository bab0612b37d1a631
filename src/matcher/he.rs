//! HE 1:N matching (spec §4.6.2): the probe is encrypted once, then matched
//! against every gallery entry's ciphertexts via encrypted inner product.
//! Decryption of the scalar inner products happens either locally (secret
//! key in-process, test/PoC) or by delegating to a remote key-holder.
//!
//! Open question (i) from spec §9: unlike the plaintext path, this one does
//! not search rotations — a single nominal alignment is used. That's a
//! known accuracy gap versus the plaintext path, left as specified rather
//! than silently "fixed" (doing so would change the wire protocol with the
//! key-holder).

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use super::MatchOutcome;
use crate::codec::CodeGrid;
use crate::gallery::{GalleryEntry, GalleryPayload};
use crate::he::{context::HeError, ops, DecryptRequestEntry, HeContext, HeTemplate};

pub struct HeMatcher {
    ctx: HeContext,
}

impl HeMatcher {
    pub fn new(ctx: HeContext) -> Self {
        Self { ctx }
    }

    /// Encrypts a probe's iris and mask scales, deriving popcount sidecars
    /// from the same plaintext.
    pub fn encrypt_probe(&self, iris_codes: &[CodeGrid], mask_codes: &[CodeGrid]) -> Result<HeTemplate, HeError> {
        crate::he::encrypt_template(&self.ctx, iris_codes, mask_codes)
    }

    /// Local 1:N search — requires the secret key to be present in this
    /// process (test/PoC deployments only).
    pub fn match_1n_local(&self, probe: &HeTemplate, snapshot: &[GalleryEntry], threshold: f64) -> Result<MatchOutcome, HeError> {
        if !self.ctx.has_secret_key()? {
            return Err(HeError::NoSecretKey);
        }
        if snapshot.is_empty() {
            return Ok(MatchOutcome::no_match());
        }

        let mut best: Option<(f64, &GalleryEntry)> = None;
        for entry in snapshot {
            let GalleryPayload::He(ref gallery_template) = entry.payload else {
                continue;
            };
            match self.distance_local(probe, gallery_template) {
                Ok(d) => {
                    if best.as_ref().map(|(bd, _)| d < *bd).unwrap_or(true) {
                        best = Some((d, entry));
                    }
                }
                Err(e) => warn!(template_id = %entry.template_id, error = %e, "skipping HE entry with matching error"),
            }
        }

        Ok(finalize(best, threshold))
    }

    fn distance_local(&self, probe: &HeTemplate, gallery: &HeTemplate) -> Result<f64, HeError> {
        if probe.n_scales() != gallery.n_scales() || probe.n_scales() == 0 {
            return Err(HeError::Encryption("scale count mismatch or zero scales".into()));
        }
        let mut total = 0.0;
        for i in 0..probe.n_scales() {
            let ip_ct = ops::inner_product(&self.ctx, &probe.iris_cts[i], &gallery.iris_cts[i])?;
            let inner = ops::decrypt_scalar(&self.ctx, &ip_ct)? as f64;
            let pop_probe = probe.iris_popcount[i] as f64;
            let pop_gallery = gallery.iris_popcount[i] as f64;
            let total_bits = crate::he::context::SLOTS_PER_SCALE as f64;
            let d_i = (pop_probe + pop_gallery - 2.0 * inner) / total_bits;
            total += d_i;
        }
        Ok((total / probe.n_scales() as f64).clamp(0.0, 1.0))
    }

    /// Delegated 1:N search: chunks entries so the ciphertext count per
    /// request stays under `max_cts_per_request`, sends each chunk over
    /// `transport`, and keeps the running best result across chunks.
    pub async fn match_1n_remote(
        &self,
        probe: &HeTemplate,
        snapshot: &[GalleryEntry],
        threshold: f64,
        transport: &dyn DecryptTransport,
        max_cts_per_request: usize,
        timeout: Duration,
    ) -> MatchOutcome {
        if snapshot.is_empty() {
            return MatchOutcome::no_match();
        }

        let mut entries = Vec::new();
        for entry in snapshot {
            let GalleryPayload::He(ref gallery_template) = entry.payload else {
                continue;
            };
            match self.build_request_entry(probe, entry, gallery_template) {
                Ok(req_entry) => entries.push(req_entry),
                Err(e) => warn!(template_id = %entry.template_id, error = %e, "skipping HE entry building remote request"),
            }
        }
        if entries.is_empty() {
            return MatchOutcome::no_match();
        }

        let mut best = MatchOutcome::no_match();
        let mut chunk = Vec::new();
        let mut chunk_cts = 0usize;

        for entry in entries {
            let entry_cts = entry.enc_inner_products_b64.len();
            if chunk_cts + entry_cts > max_cts_per_request && !chunk.is_empty() {
                let result = send_chunk(transport, std::mem::take(&mut chunk), threshold, timeout).await;
                if result.distance < best.distance {
                    best = result;
                }
                chunk_cts = 0;
            }
            chunk_cts += entry_cts;
            chunk.push(entry);
        }
        if !chunk.is_empty() {
            let result = send_chunk(transport, chunk, threshold, timeout).await;
            if result.distance < best.distance {
                best = result;
            }
        }

        if best.distance < threshold {
            best.is_match = true;
        }
        best
    }

    fn build_request_entry(
        &self,
        probe: &HeTemplate,
        entry: &GalleryEntry,
        gallery: &HeTemplate,
    ) -> Result<DecryptRequestEntry, HeError> {
        let mut enc_inner_products_b64 = Vec::with_capacity(probe.n_scales() * 2);
        for i in 0..probe.n_scales() {
            let iris_ip = ops::inner_product(&self.ctx, &probe.iris_cts[i], &gallery.iris_cts[i])?;
            let mask_ip = ops::inner_product(&self.ctx, &probe.mask_cts[i], &gallery.mask_cts[i])?;
            enc_inner_products_b64.push(base64::engine::general_purpose::STANDARD.encode(ops::serialize_ciphertext(&iris_ip)?));
            enc_inner_products_b64.push(base64::engine::general_purpose::STANDARD.encode(ops::serialize_ciphertext(&mask_ip)?));
        }
        Ok(DecryptRequestEntry {
            template_id: entry.template_id,
            identity_id: entry.identity_id,
            identity_name: entry.identity_name.clone(),
            enc_inner_products_b64,
            probe_iris_popcount: probe.iris_popcount.clone(),
            gallery_iris_popcount: gallery.iris_popcount.clone(),
            probe_mask_popcount: probe.mask_popcount.clone(),
            gallery_mask_popcount: gallery.mask_popcount.clone(),
        })
    }
}

fn finalize(best: Option<(f64, &GalleryEntry)>, threshold: f64) -> MatchOutcome {
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

async fn send_chunk(
    transport: &dyn DecryptTransport,
    entries: Vec<DecryptRequestEntry>,
    threshold: f64,
    timeout: Duration,
) -> MatchOutcome {
    let request = DecryptBatchRequest { threshold, entries };
    match tokio::time::timeout(timeout, transport.request_decrypt_batch(request)).await {
        Ok(Ok(reply)) => MatchOutcome {
            distance: reply.hamming_distance,
            is_match: reply.is_match,
            matched_identity_id: reply.matched_identity_id,
            matched_identity_name: reply.matched_identity_name,
            matched_template_id: None,
        },
        Ok(Err(e)) => {
            warn!(error = %e, "remote HE decrypt request failed");
            MatchOutcome::no_match()
        }
        Err(_) => {
            warn!("remote HE decrypt request timed out");
            MatchOutcome::no_match()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecryptBatchRequest {
    pub threshold: f64,
    pub entries: Vec<DecryptRequestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecryptBatchReply {
    pub hamming_distance: f64,
    pub is_match: bool,
    pub matched_identity_id: Option<Uuid>,
    pub matched_identity_name: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport error: {0}")]
    Other(String),
}

/// Abstracts the request-reply channel to the key-holder so the matcher
/// isn't hard-wired to NATS in tests.
#[async_trait]
pub trait DecryptTransport: Send + Sync {
    async fn request_decrypt_batch(&self, req: DecryptBatchRequest) -> Result<DecryptBatchReply, TransportError>;
}

/// NATS-backed transport: request-reply on `{subject}.decrypt_batch`, JSON
/// payload, matching `key_client.py`.
pub struct NatsDecryptTransport {
    pub client: async_nats::Client,
    pub subject: String,
}

#[async_trait]
impl DecryptTransport for NatsDecryptTransport {
    async fn request_decrypt_batch(&self, req: DecryptBatchRequest) -> Result<DecryptBatchReply, TransportError> {
        let payload = serde_json::to_vec(&req).map_err(|e| TransportError::Other(e.to_string()))?;
        let subject = format!("{}.decrypt_batch", self.subject);
        let response = self
            .client
            .request(subject, payload.into())
            .await
            .map_err(|e| TransportError::Other(e.to_string()))?;
        serde_json::from_slice(&response.payload).map_err(|e| TransportError::Other(e.to_string()))
    }
}
