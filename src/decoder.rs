//! Codeblock and embedded-image decoding.
//!
//! The production bitstream decompressor for wavelet codeblocks lives
//! outside this crate and is injected behind [`CoeffDecoder`]. The crate
//! ships [`RawCoeffDecoder`] for containers that store coefficient planes
//! uncompressed (little-endian i16); fixtures and diagnostics use it too.
//!
//! Embedded label/macro images are ordinary JPEGs and are decoded with
//! zune-jpeg.

use zune_jpeg::JpegDecoder;

use crate::error::{IsyntaxError, IsyntaxResult};

/// Which coefficient plane a codeblock holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoeffKind {
    /// The low-pass subband, one `block_width * block_height` plane.
    Ll,
    /// The high-pass triplet (LH, HL, HH), three planes packed
    /// subband-major.
    H,
}

impl CoeffKind {
    /// Number of i16 coefficients a plane of this kind holds.
    pub fn plane_len(self, block_width: u32, block_height: u32) -> usize {
        let quadrant = block_width as usize * block_height as usize;
        match self {
            CoeffKind::Ll => quadrant,
            CoeffKind::H => quadrant * 3,
        }
    }

    /// The coefficient number recorded in codeblock headers (0 = LL,
    /// 1 = the packed high-pass triplet).
    pub fn coefficient(self) -> u32 {
        match self {
            CoeffKind::Ll => 0,
            CoeffKind::H => 1,
        }
    }
}

/// Turns one compressed codeblock payload into a raw i16 coefficient plane.
///
/// `data` holds the codeblock payload followed by at least seven bytes of
/// slack, so bitstream readers may over-read by up to 56 bits without
/// running off the buffer. `out` is sized per [`CoeffKind::plane_len`].
pub trait CoeffDecoder: Send + Sync {
    fn decode(
        &self,
        data: &[u8],
        block_width: u32,
        block_height: u32,
        kind: CoeffKind,
        compressor_version: i32,
        out: &mut [i16],
    ) -> IsyntaxResult<()>;
}

/// Decoder for uncompressed codeblocks: the payload is the coefficient
/// plane itself, little-endian i16, subband-major for H triplets.
pub struct RawCoeffDecoder;

impl CoeffDecoder for RawCoeffDecoder {
    fn decode(
        &self,
        data: &[u8],
        block_width: u32,
        block_height: u32,
        kind: CoeffKind,
        _compressor_version: i32,
        out: &mut [i16],
    ) -> IsyntaxResult<()> {
        let expected = kind.plane_len(block_width, block_height);
        if out.len() != expected {
            return Err(IsyntaxError::Fatal(format!(
                "coefficient plane is {} values, decoder was handed {}",
                expected,
                out.len()
            )));
        }
        let needed = expected * 2;
        if data.len() < needed {
            return Err(IsyntaxError::Decompress(format!(
                "codeblock payload is {} bytes, plane needs {}",
                data.len(),
                needed
            )));
        }
        for (value, pair) in out.iter_mut().zip(data.chunks_exact(2)) {
            *value = i16::from_le_bytes([pair[0], pair[1]]);
        }
        Ok(())
    }
}

/// Decode an embedded JPEG (label or macro image) to RGB bytes plus
/// dimensions. Single-component scans are widened so callers always get
/// three channels per pixel.
pub fn decode_jpeg_rgb(jpeg: &[u8]) -> IsyntaxResult<(Vec<u8>, u32, u32)> {
    let mut decoder = JpegDecoder::new(jpeg);

    let decoded = decoder
        .decode()
        .map_err(|e| IsyntaxError::Decompress(format!("embedded JPEG did not decode: {:?}", e)))?;

    let info = decoder.info().ok_or_else(|| {
        IsyntaxError::Decompress("embedded JPEG carried no header info".into())
    })?;
    let width = info.width as u32;
    let height = info.height as u32;

    if info.components != 1 {
        return Ok((decoded, width, height));
    }

    let mut rgb = Vec::with_capacity(decoded.len() * 3);
    for gray in decoded {
        rgb.extend_from_slice(&[gray; 3]);
    }
    Ok((rgb, width, height))
}
