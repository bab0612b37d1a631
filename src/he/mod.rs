//! HE context (C2): BFV parameters, key lifecycle, and the primitives the
//! HE matcher (`crate::matcher::he`) builds on.

pub mod blob;
pub mod context;
pub mod ops;

pub use context::{ContextConfig, HeContext, HeError, SecurityLevel};

use serde::{Deserialize, Serialize};

use crate::codec::CodeGrid;

/// An encrypted scale's ciphertext plus its non-secret popcount sidecar.
/// The spec requires `iris_popcount[i]` to equal the popcount of the
/// plaintext that produced `iris_codes[i]`; callers that build these from
/// [`ops::encrypt`] get that by construction.
#[derive(Clone)]
pub struct HeTemplate {
    pub iris_cts: Vec<sealy::Ciphertext>,
    pub mask_cts: Vec<sealy::Ciphertext>,
    pub iris_popcount: Vec<u32>,
    pub mask_popcount: Vec<u32>,
}

impl HeTemplate {
    pub fn n_scales(&self) -> usize {
        self.iris_cts.len()
    }
}

/// Encrypts a plaintext template scale-by-scale, deriving the popcount
/// sidecars from the same plaintext grids that are encrypted.
pub fn encrypt_template(
    ctx: &HeContext,
    iris_codes: &[CodeGrid],
    mask_codes: &[CodeGrid],
) -> Result<HeTemplate, HeError> {
    let mut iris_cts = Vec::with_capacity(iris_codes.len());
    let mut mask_cts = Vec::with_capacity(mask_codes.len());
    let mut iris_popcount = Vec::with_capacity(iris_codes.len());
    let mut mask_popcount = Vec::with_capacity(mask_codes.len());

    for grid in iris_codes {
        iris_cts.push(ops::encrypt(ctx, grid)?);
        iris_popcount.push(ops::popcount(grid));
    }
    for grid in mask_codes {
        mask_cts.push(ops::encrypt(ctx, grid)?);
        mask_popcount.push(ops::popcount(grid));
    }

    Ok(HeTemplate {
        iris_cts,
        mask_cts,
        iris_popcount,
        mask_popcount,
    })
}

/// Wire form of a per-scale remote-decrypt request entry (spec §6). Kept
/// here rather than in `matcher::he` since it mirrors the HE blob/ciphertext
/// boundary this module owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecryptRequestEntry {
    pub template_id: uuid::Uuid,
    pub identity_id: uuid::Uuid,
    pub identity_name: String,
    pub enc_inner_products_b64: Vec<String>,
    pub probe_iris_popcount: Vec<u32>,
    pub gallery_iris_popcount: Vec<u32>,
    pub probe_mask_popcount: Vec<u32>,
    pub gallery_mask_popcount: Vec<u32>,
}
