//! HEv1 blob format: `"HEv1" (4B) | count (u32 LE) | repeat count times:
//! (len u32 LE) (serialized ciphertext bytes)`.

use sealy::Ciphertext;

use super::context::{HeContext, HeError};
use super::ops::{deserialize_ciphertext, serialize_ciphertext};

const MAGIC: &[u8; 4] = b"HEv1";

pub fn is_he_blob(blob: &[u8]) -> bool {
    blob.len() >= MAGIC.len() && &blob[..MAGIC.len()] == MAGIC
}

pub fn pack_he_codes(cts: &[Ciphertext]) -> Result<Vec<u8>, HeError> {
    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&(cts.len() as u32).to_le_bytes());
    for ct in cts {
        let bytes = serialize_ciphertext(ct)?;
        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&bytes);
    }
    Ok(out)
}

pub fn unpack_he_codes(ctx: &HeContext, blob: &[u8]) -> Result<Vec<Ciphertext>, HeError> {
    if !is_he_blob(blob) {
        return Err(HeError::Serialization("blob missing HEv1 magic".into()));
    }
    let mut cursor = MAGIC.len();
    let count = read_u32(blob, &mut cursor)?;
    let mut cts = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = read_u32(blob, &mut cursor)? as usize;
        if cursor + len > blob.len() {
            return Err(HeError::Serialization("HEv1 blob truncated".into()));
        }
        let bytes = &blob[cursor..cursor + len];
        cursor += len;
        cts.push(deserialize_ciphertext(ctx, bytes)?);
    }
    Ok(cts)
}

fn read_u32(blob: &[u8], cursor: &mut usize) -> Result<u32, HeError> {
    if *cursor + 4 > blob.len() {
        return Err(HeError::Serialization("HEv1 blob truncated".into()));
    }
    let v = u32::from_le_bytes(blob[*cursor..*cursor + 4].try_into().unwrap());
    *cursor += 4;
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodeGrid;
    use crate::he::context::HeContext;
    use crate::he::ops::encrypt;

    #[test]
    fn pack_unpack_round_trips() {
        let ctx = HeContext::ephemeral().unwrap();
        let grid = CodeGrid::new(16, 256, 2, vec![0u8; 8192]).unwrap();
        let ct1 = encrypt(&ctx, &grid).unwrap();
        let ct2 = encrypt(&ctx, &grid).unwrap();
        let blob = pack_he_codes(&[ct1, ct2]).unwrap();
        assert!(is_he_blob(&blob));
        assert_eq!(&blob[..4], b"HEv1");
        let restored = unpack_he_codes(&ctx, &blob).unwrap();
        assert_eq!(restored.len(), 2);
    }

    #[test]
    fn rejects_non_he_blob() {
        assert!(!is_he_blob(b"EYED1...."));
        assert!(!is_he_blob(b"PK\x03\x04"));
    }
}
