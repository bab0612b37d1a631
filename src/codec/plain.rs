//! Plain archive format: a zip-style container (`PK\x03\x04` magic) holding
//! one member per scale, named so that sorting the member names recovers the
//! original order (`arr_00000`, `arr_00001`, ...).
//!
//! Each member is a minimal NPY-compatible record: a fixed header (shape +
//! dtype) followed by the grid's bits as raw `u8`s. We don't need full numpy
//! interop, just a stable, self-describing per-member format.

use std::io::{Cursor, Read, Write};

use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

use super::{CodecError, CodeGrid};

const NPZ_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];
// A zero-member zip archive has no local file headers at all — it's just an
// end-of-central-directory record, which starts with this signature instead.
const NPZ_EMPTY_MAGIC: [u8; 4] = [0x50, 0x4B, 0x05, 0x06];

pub fn is_plain_archive(blob: &[u8]) -> bool {
    blob.len() >= 4 && (blob[..4] == NPZ_MAGIC || blob[..4] == NPZ_EMPTY_MAGIC)
}

pub fn encode(codes: &[CodeGrid]) -> Result<Vec<u8>, CodecError> {
    let mut buf = Cursor::new(Vec::new());
    {
        let mut writer = ZipWriter::new(&mut buf);
        let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for (idx, grid) in codes.iter().enumerate() {
            let name = member_name(idx);
            writer
                .start_file(name, options)
                .map_err(|e| CodecError::Decode(format!("archive write failed: {e}")))?;
            let record = encode_member(grid);
            writer
                .write_all(&record)
                .map_err(|e| CodecError::Decode(format!("archive write failed: {e}")))?;
        }
        writer
            .finish()
            .map_err(|e| CodecError::Decode(format!("archive finalize failed: {e}")))?;
    }
    Ok(buf.into_inner())
}

pub fn decode(blob: &[u8]) -> Result<Vec<CodeGrid>, CodecError> {
    if !is_plain_archive(blob) {
        return Err(CodecError::Decode(
            "blob does not start with the plain-archive magic".into(),
        ));
    }
    let mut archive = ZipArchive::new(Cursor::new(blob))
        .map_err(|e| CodecError::Decode(format!("archive truncated or corrupt: {e}")))?;

    let mut names: Vec<String> = (0..archive.len())
        .map(|i| archive.by_index(i).map(|f| f.name().to_owned()))
        .collect::<Result<_, _>>()
        .map_err(|e| CodecError::Decode(format!("archive truncated or corrupt: {e}")))?;
    names.sort();

    let mut grids = Vec::with_capacity(names.len());
    for name in names {
        let mut file = archive
            .by_name(&name)
            .map_err(|e| CodecError::Decode(format!("missing archive member {name}: {e}")))?;
        let mut record = Vec::new();
        file.read_to_end(&mut record)
            .map_err(|e| CodecError::Decode(format!("archive member {name} unreadable: {e}")))?;
        grids.push(decode_member(&record)?);
    }
    Ok(grids)
}

fn member_name(idx: usize) -> String {
    format!("arr_{idx:05}")
}

// Record layout: height u16 LE | width u16 LE | depth u16 LE | bits...
fn encode_member(grid: &CodeGrid) -> Vec<u8> {
    let mut out = Vec::with_capacity(6 + grid.len());
    out.extend_from_slice(&grid.height.to_le_bytes());
    out.extend_from_slice(&grid.width.to_le_bytes());
    out.extend_from_slice(&grid.depth.to_le_bytes());
    out.extend_from_slice(grid.as_bits());
    out
}

fn decode_member(record: &[u8]) -> Result<CodeGrid, CodecError> {
    if record.len() < 6 {
        return Err(CodecError::Decode("archive member shorter than header".into()));
    }
    let height = u16::from_le_bytes([record[0], record[1]]);
    let width = u16::from_le_bytes([record[2], record[3]]);
    let depth = u16::from_le_bytes([record[4], record[5]]);
    CodeGrid::new(height, width, depth, record[6..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(seed: u8) -> CodeGrid {
        let bits: Vec<u8> = (0..(4 * 6 * 2)).map(|i| ((i as u8 + seed) % 2)).collect();
        CodeGrid::new(4, 6, 2, bits).unwrap()
    }

    #[test]
    fn round_trips_exactly() {
        let codes = vec![sample(0), sample(1), sample(2)];
        let blob = encode(&codes).unwrap();
        assert!(is_plain_archive(&blob));
        let recovered = decode(&blob).unwrap();
        assert_eq!(codes, recovered);
    }

    #[test]
    fn empty_sequence_round_trips() {
        let blob = encode(&[]).unwrap();
        assert_eq!(decode(&blob).unwrap(), Vec::<CodeGrid>::new());
    }

    #[test]
    fn rejects_missing_magic() {
        assert!(decode(b"not an archive").is_err());
    }
}
