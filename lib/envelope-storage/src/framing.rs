// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Canonical on-flash envelope framing.
//!
//! An installed envelope is stored severed: a one-byte tag, then the
//! authentication wrapper and the manifest, each behind a little-endian
//! `(key: u16, len: u32)` section header. Anything the original
//! transport carried between or after those sections is dropped at
//! install time.

use core::ops::Range;
use drv_update_api::{CodecError, EnvelopeCodec, EnvelopeInfo};

pub const ENVELOPE_TAG: u8 = 0x6B;
pub const KEY_AUTH_WRAPPER: u16 = 2;
pub const KEY_MANIFEST: u16 = 3;
pub const SECTION_HEADER_LEN: usize = 6;

/// The class ID leads the manifest, so a structurally valid manifest is
/// at least this long.
pub const CLASS_ID_LEN: usize = 16;

pub fn section_header(key: u16, len: u32) -> [u8; SECTION_HEADER_LEN] {
    let k = key.to_le_bytes();
    let l = len.to_le_bytes();
    [k[0], k[1], l[0], l[1], l[2], l[3]]
}

/// Stored size of an envelope with the given section payloads.
pub fn encoded_len(auth_len: usize, manifest_len: usize) -> usize {
    1 + SECTION_HEADER_LEN + auth_len + SECTION_HEADER_LEN + manifest_len
}

fn read_section(
    bytes: &[u8],
    at: usize,
) -> Result<(u16, Range<usize>), CodecError> {
    let hdr = bytes
        .get(at..at + SECTION_HEADER_LEN)
        .ok_or(CodecError::Truncated)?;
    let key = u16::from_le_bytes([hdr[0], hdr[1]]);
    let len = u32::from_le_bytes([hdr[2], hdr[3], hdr[4], hdr[5]]) as usize;

    let start = at + SECTION_HEADER_LEN;
    let end = start.checked_add(len).ok_or(CodecError::Malformed)?;
    if end > bytes.len() {
        return Err(CodecError::Truncated);
    }
    Ok((key, start..end))
}

/// Structural parse: tag, auth wrapper, manifest, nothing else. The
/// class-ID offset points at the leading field of the manifest.
pub fn parse(bytes: &[u8]) -> Result<EnvelopeInfo, CodecError> {
    match bytes.first() {
        None => return Err(CodecError::Truncated),
        Some(&t) if t != ENVELOPE_TAG => return Err(CodecError::Malformed),
        Some(_) => (),
    }

    let (key, auth) = read_section(bytes, 1)?;
    if key != KEY_AUTH_WRAPPER {
        return Err(CodecError::Malformed);
    }

    let (key, manifest) = read_section(bytes, auth.end)?;
    if key != KEY_MANIFEST {
        return Err(CodecError::Malformed);
    }
    if manifest.len() < CLASS_ID_LEN {
        return Err(CodecError::Malformed);
    }
    // A complete envelope is exactly its two sections.
    if manifest.end != bytes.len() {
        return Err(CodecError::Malformed);
    }

    let class_id_offset = manifest.start;
    Ok(EnvelopeInfo {
        auth_wrapper: auth,
        manifest,
        class_id_offset,
    })
}

/// [`EnvelopeCodec`] over the canonical framing. This is what validates
/// stored envelopes on the read path; incoming envelopes in richer
/// transport encodings go through the platform's full decoder instead.
pub struct StructuralCodec;

impl EnvelopeCodec for StructuralCodec {
    fn decode_and_validate(
        &self,
        bytes: &[u8],
    ) -> Result<EnvelopeInfo, CodecError> {
        parse(bytes)
    }
}
