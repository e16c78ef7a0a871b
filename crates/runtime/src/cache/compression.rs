use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use super::CacheError;

/// Gzip `payload` and keep the result only if it saves at least `min_ratio`
/// of the original size.
pub(crate) fn compress_if_worthwhile(
    payload: &[u8],
    min_ratio: f64,
) -> Result<Option<Vec<u8>>, CacheError> {
    if payload.is_empty() {
        return Ok(None);
    }
    let mut encoder = GzEncoder::new(Vec::with_capacity(payload.len() / 2), Compression::fast());
    encoder.write_all(payload)?;
    let compressed = encoder.finish()?;

    let saved = 1.0 - compressed.len() as f64 / payload.len() as f64;
    if saved >= min_ratio {
        Ok(Some(compressed))
    } else {
        Ok(None)
    }
}

pub(crate) fn decompress(payload: &[u8]) -> Result<Vec<u8>, CacheError> {
    let mut decoder = GzDecoder::new(payload);
    let mut out = Vec::with_capacity(payload.len() * 3);
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repetitive_payload_is_compressed() {
        let payload = "row,".repeat(2_000).into_bytes();
        let compressed = compress_if_worthwhile(&payload, 0.2).unwrap().unwrap();
        assert!(compressed.len() < payload.len() / 5);
        assert_eq!(decompress(&compressed).unwrap(), payload);
    }

    #[test]
    fn test_incompressible_payload_is_kept() {
        use rand::{rngs::StdRng, RngCore, SeedableRng};
        let mut payload = vec![0u8; 4096];
        StdRng::seed_from_u64(7).fill_bytes(&mut payload);
        assert!(compress_if_worthwhile(&payload, 0.2).unwrap().is_none());
    }
}
