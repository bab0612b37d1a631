//! BFV primitives used by the HE matching path: encrypt, multiply
//! (element-wise AND), inner-product-then-rotate-sum, popcount on
//! plaintext, and ciphertext (de)serialization.

use sealy::Ciphertext;

use super::context::{HeContext, HeError, SLOTS_PER_SCALE};
use crate::codec::CodeGrid;

/// Flattens a scale's bits into a length-`SLOTS_PER_SCALE` vector and
/// encrypts it as one ciphertext.
pub fn encrypt(ctx: &HeContext, grid: &CodeGrid) -> Result<Ciphertext, HeError> {
    assert_eq!(grid.len(), SLOTS_PER_SCALE, "HE encoding expects one 8192-bit scale");
    let encoder = ctx.encoder()?;
    let encryptor = ctx.encryptor()?;

    let slots: Vec<u64> = grid.as_bits().iter().map(|&b| b as u64).collect();
    let plaintext = encoder
        .encode_u64(&slots)
        .map_err(|e| HeError::Encryption(e.to_string()))?;
    encryptor
        .encrypt(&plaintext)
        .map_err(|e| HeError::Encryption(e.to_string()))
}

/// Decrypts a ciphertext produced by [`encrypt`] back to its flat bit
/// vector. Exact for binary inputs (no noise-induced rounding needed since
/// BFV decryption recovers the plaintext slot values exactly within the
/// modulus).
pub fn decrypt(ctx: &HeContext, ct: &Ciphertext) -> Result<Vec<u64>, HeError> {
    let decryptor = ctx.decryptor()?;
    let encoder = ctx.encoder()?;
    let plaintext = decryptor
        .decrypt(ct)
        .map_err(|e| HeError::Encryption(e.to_string()))?;
    encoder
        .decode_u64(&plaintext)
        .map_err(|e| HeError::Encryption(e.to_string()))
}

/// Element-wise product — AND for binary slot vectors. Relinearizes the
/// result back down to a fresh-size ciphertext.
pub fn multiply(ctx: &HeContext, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext, HeError> {
    let evaluator = ctx.evaluator()?;
    let relin_keys = ctx.relin_keys()?;
    let product = evaluator
        .multiply(a, b)
        .map_err(|e| HeError::Encryption(e.to_string()))?;
    evaluator
        .relinearize(&product, &relin_keys)
        .map_err(|e| HeError::Encryption(e.to_string()))
}

/// `multiply` then rotate-and-sum across all slots of both batching rows;
/// the scalar inner product ends up in slot 0 of the decryption.
///
/// BFV batching on an `N`-slot ring packs values as a `2 x (N/2)` matrix.
/// Summing every slot needs two reduction passes: a power-of-two
/// rotate-and-add within each row (`rotate_rows`) to collapse each row to
/// its total in column 0, then one `rotate_columns` + add to fold the two
/// row totals together.
pub fn inner_product(ctx: &HeContext, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext, HeError> {
    let product = multiply(ctx, a, b)?;
    sum_all_slots(ctx, &product)
}

fn sum_all_slots(ctx: &HeContext, ct: &Ciphertext) -> Result<Ciphertext, HeError> {
    let evaluator = ctx.evaluator()?;
    let galois_keys = ctx.galois_keys()?;

    let row_width = SLOTS_PER_SCALE / 2;
    let mut acc = ct.clone();
    let mut step = 1usize;
    while step < row_width {
        let rotated = evaluator
            .rotate_rows(&acc, step as i32, &galois_keys)
            .map_err(|e| HeError::Encryption(e.to_string()))?;
        acc = evaluator
            .add(&acc, &rotated)
            .map_err(|e| HeError::Encryption(e.to_string()))?;
        step *= 2;
    }
    let swapped = evaluator
        .rotate_columns(&acc, &galois_keys)
        .map_err(|e| HeError::Encryption(e.to_string()))?;
    evaluator
        .add(&acc, &swapped)
        .map_err(|e| HeError::Encryption(e.to_string()))
}

/// Decrypts a scalar produced by [`inner_product`]: slot 0 of the decoded
/// vector holds the sum.
pub fn decrypt_scalar(ctx: &HeContext, ct: &Ciphertext) -> Result<u64, HeError> {
    let slots = decrypt(ctx, ct)?;
    Ok(slots.first().copied().unwrap_or(0))
}

/// Popcount on a plaintext grid — the non-secret sidecar that accompanies
/// every HE-encrypted scale.
pub fn popcount(grid: &CodeGrid) -> u32 {
    grid.popcount()
}

pub fn serialize_ciphertext(ct: &Ciphertext) -> Result<Vec<u8>, HeError> {
    ct.as_bytes().map_err(|e| HeError::Serialization(e.to_string()))
}

pub fn deserialize_ciphertext(ctx: &HeContext, bytes: &[u8]) -> Result<Ciphertext, HeError> {
    ctx.with_state(|s| Ciphertext::from_bytes(&s.seal_ctx, bytes))?
        .map_err(|e| HeError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::he::context::HeContext;

    fn grid_of(bits: impl Fn(usize) -> u8) -> CodeGrid {
        let v: Vec<u8> = (0..SLOTS_PER_SCALE).map(bits).collect();
        CodeGrid::new(16, 256, 2, v).unwrap()
    }

    #[test]
    fn encrypt_decrypt_round_trips() {
        let ctx = HeContext::ephemeral().unwrap();
        let grid = grid_of(|i| (i % 3 == 0) as u8);
        let ct = encrypt(&ctx, &grid).unwrap();
        let recovered = decrypt(&ctx, &ct).unwrap();
        let expected: Vec<u64> = grid.as_bits().iter().map(|&b| b as u64).collect();
        assert_eq!(recovered, expected);
    }

    #[test]
    fn inner_product_of_equal_vectors_equals_popcount() {
        let ctx = HeContext::ephemeral().unwrap();
        let grid = grid_of(|i| (i % 4 == 0) as u8);
        let ct = encrypt(&ctx, &grid).unwrap();
        let ip = inner_product(&ctx, &ct, &ct).unwrap();
        let scalar = decrypt_scalar(&ctx, &ip).unwrap();
        assert_eq!(scalar as u32, popcount(&grid));
    }

    #[test]
    fn inner_product_of_disjoint_halves_is_zero() {
        let ctx = HeContext::ephemeral().unwrap();
        let a = grid_of(|i| (i % 2 == 0) as u8);
        let b = grid_of(|i| (i % 2 == 1) as u8);
        let ct_a = encrypt(&ctx, &a).unwrap();
        let ct_b = encrypt(&ctx, &b).unwrap();
        let ip = inner_product(&ctx, &ct_a, &ct_b).unwrap();
        assert_eq!(decrypt_scalar(&ctx, &ip).unwrap(), 0);
    }

    #[test]
    fn ciphertext_serialization_round_trips() {
        let ctx = HeContext::ephemeral().unwrap();
        let grid = grid_of(|i| (i % 5 == 0) as u8);
        let ct = encrypt(&ctx, &grid).unwrap();
        let bytes = serialize_ciphertext(&ct).unwrap();
        let restored = deserialize_ciphertext(&ctx, &bytes).unwrap();
        assert_eq!(decrypt(&ctx, &restored).unwrap(), decrypt(&ctx, &ct).unwrap());
    }
}
