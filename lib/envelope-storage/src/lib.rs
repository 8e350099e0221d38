// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Envelope storage manager.
//!
//! Owns a set of fixed, erase-aligned flash areas, one installed
//! envelope per area, plus two small record areas: the update candidate
//! registry and the boot report. Installs go through a strict
//! three-append sequence (header, auth wrapper, manifest) over a
//! word-buffered writer; the header carries a digest of the stored
//! envelope so a torn install reads back as absent rather than as a
//! garbled envelope.

#![cfg_attr(not(test), no_std)]

pub mod framing;
pub mod records;

use drv_flash_api::{FlashDevice, FlashError, ERASED_BYTE};
use drv_update_api::{
    DigestProvider, EnvelopeCodec, ManifestClassId, MemRegion, UpdateError,
};
use hubpack::SerializedSize;
use ringbuf::{trace, Ringbuf};
use word_buffer::WordBuffer;

use records::{
    AreaHeader, CandidateRecord, ReportRecord, AREA_MAGIC, CANDIDATE_MAGIC,
    MAX_CANDIDATE_REGIONS, MAX_REPORT_PAYLOAD, RECORD_VERSION, REPORT_MAGIC,
};

/// Hardware write word. Flash programs in units of this; everything the
/// manager writes is padded out to it.
pub const FLASH_WORD_BYTES: usize = 16;

pub const fn word_align(n: usize) -> usize {
    (n + FLASH_WORD_BYTES - 1) / FLASH_WORD_BYTES * FLASH_WORD_BYTES
}

/// Stored size of the area header, including word padding.
pub const HEADER_LEN: usize = word_align(AreaHeader::MAX_SIZE);

const CANDIDATE_RECORD_LEN: usize = word_align(CandidateRecord::MAX_SIZE);
const REPORT_RECORD_LEN: usize = word_align(ReportRecord::MAX_SIZE);

// All stored records must land on word boundaries, or the single-write
// record paths would need their own buffering.
static_assertions::const_assert!(HEADER_LEN % FLASH_WORD_BYTES == 0);
static_assertions::const_assert!(CANDIDATE_RECORD_LEN % FLASH_WORD_BYTES == 0);
static_assertions::const_assert!(REPORT_RECORD_LEN % FLASH_WORD_BYTES == 0);

/// One fixed window of the backing flash, in device offsets.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StorageArea {
    pub base: u32,
    pub size: u32,
}

impl StorageArea {
    fn end(&self) -> u32 {
        self.base + self.size
    }
}

/// Static partitioning of the update flash, fixed at integration time.
#[derive(Copy, Clone, Debug)]
pub struct StorageLayout<const A: usize> {
    /// Envelope areas, addressed by index.
    pub areas: [StorageArea; A],
    pub candidate: StorageArea,
    pub report: StorageArea,
    /// Erase block size; every area must be aligned to and sized in
    /// multiples of it.
    pub erase_unit: u32,
}

/// Where an installed envelope lives, in device offsets.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EnvelopeSpan {
    pub offset: u32,
    pub size: u32,
    /// Class-ID field offset, relative to `offset`.
    pub class_id_offset: u32,
}

impl EnvelopeSpan {
    /// Pulls the manifest class ID out of an envelope previously read
    /// into `envelope` (the `size` bytes starting at `offset`).
    pub fn class_id(&self, envelope: &[u8]) -> Option<ManifestClassId> {
        let at = self.class_id_offset as usize;
        let bytes = envelope.get(at..at + framing::CLASS_ID_LEN)?;
        let mut id = ManifestClassId([0; framing::CLASS_ID_LEN]);
        id.0.copy_from_slice(bytes);
        Some(id)
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    InstallStart { area: u8, size: u32 },
    InstallCommit { area: u8, size: u32 },
    InstallAbort { area: u8, err: UpdateError },
    AreaErased { area: u8 },
    CandidateSet { count: u8 },
    CandidateCleared,
    ReportSaved { len: u8 },
    ReportCleared,
}

pub struct Storage<F, const A: usize> {
    flash: F,
    layout: StorageLayout<A>,
    wb: WordBuffer<FLASH_WORD_BYTES>,
    /// Area with a write sequence in flight, from a reset append until
    /// the flush append (or the first error).
    armed: Option<u8>,
    ring: Ringbuf<Trace, 32>,
}

fn from_flash(e: FlashError) -> UpdateError {
    match e {
        FlashError::OutOfBounds | FlashError::BadAlignment => {
            UpdateError::Inval
        }
        FlashError::NotReady => UpdateError::HwNotReady,
        FlashError::Io => UpdateError::Io,
    }
}

impl<F: FlashDevice, const A: usize> Storage<F, A> {
    pub fn new(flash: F, layout: StorageLayout<A>) -> Result<Self, UpdateError> {
        let unit = layout.erase_unit;
        if unit == 0
            || unit as usize % FLASH_WORD_BYTES != 0
            || flash.write_granule() == 0
            || FLASH_WORD_BYTES % flash.write_granule() != 0
        {
            return Err(UpdateError::Inval);
        }

        let count = A + 2;
        let area_at = |i: usize| -> &StorageArea {
            if i < A {
                &layout.areas[i]
            } else if i == A {
                &layout.candidate
            } else {
                &layout.report
            }
        };

        for i in 0..count {
            let a = area_at(i);
            if a.size == 0
                || a.base % unit != 0
                || a.size % unit != 0
                || a.end() as usize > flash.capacity()
            {
                return Err(UpdateError::Inval);
            }
            for j in i + 1..count {
                let b = area_at(j);
                if a.base < b.end() && b.base < a.end() {
                    return Err(UpdateError::Inval);
                }
            }
        }

        if (layout.candidate.size as usize) < CANDIDATE_RECORD_LEN
            || (layout.report.size as usize) < REPORT_RECORD_LEN
        {
            return Err(UpdateError::Inval);
        }

        Ok(Self {
            flash,
            layout,
            wb: WordBuffer::new(),
            armed: None,
            ring: Ringbuf::new(Trace::None),
        })
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    fn area(&self, area_id: u8) -> Result<StorageArea, UpdateError> {
        self.layout
            .areas
            .get(area_id as usize)
            .copied()
            .ok_or(UpdateError::Inval)
    }

    /// One append of a write sequence against an envelope area.
    ///
    /// `reset` erases the area and starts a fresh sequence; without it,
    /// the area must already have a sequence in flight, or the append
    /// fails with `IncorrectState` and changes nothing. `flush` pads
    /// and writes out the trailing partial word and completes the
    /// sequence. Any flash failure abandons the sequence.
    pub fn write_part(
        &mut self,
        area_id: u8,
        data: &[u8],
        reset: bool,
        flush: bool,
    ) -> Result<(), UpdateError> {
        let area = self.area(area_id)?;

        if reset {
            self.armed = None;
            self.flash
                .erase(area.base, area.size)
                .map_err(from_flash)?;
            self.wb.begin(area.base).map_err(from_flash)?;
            self.armed = Some(area_id);
        } else if self.armed != Some(area_id) {
            return Err(UpdateError::IncorrectState);
        }

        if self.wb.position() as usize + data.len() > area.end() as usize {
            self.armed = None;
            return Err(UpdateError::Inval);
        }

        let r = self
            .wb
            .append(&mut self.flash, data)
            .and_then(|()| {
                if flush {
                    self.wb.flush(&mut self.flash, ERASED_BYTE)
                } else {
                    Ok(())
                }
            })
            .map_err(from_flash);

        if r.is_err() || flush {
            self.armed = None;
        }
        r
    }

    /// Installs an envelope: decode and validate the incoming bytes,
    /// then write header, auth wrapper, and manifest in one erase-write
    /// sequence. Returns where the stored envelope landed.
    pub fn install(
        &mut self,
        area_id: u8,
        envelope: &[u8],
        codec: &impl EnvelopeCodec,
        digester: &impl DigestProvider,
    ) -> Result<EnvelopeSpan, UpdateError> {
        let area = self.area(area_id)?;
        let info = codec.decode_and_validate(envelope)?;

        let in_range = |r: &core::ops::Range<usize>| {
            r.start <= r.end && r.end <= envelope.len()
        };
        if !in_range(&info.auth_wrapper) || !in_range(&info.manifest) {
            return Err(UpdateError::Inval);
        }
        if info.class_id_offset < info.manifest.start
            || info.class_id_offset + framing::CLASS_ID_LEN > info.manifest.end
        {
            return Err(UpdateError::Inval);
        }

        let auth = &envelope[info.auth_wrapper.clone()];
        let manifest = &envelope[info.manifest.clone()];
        let stored_size = framing::encoded_len(auth.len(), manifest.len());
        if HEADER_LEN + stored_size > area.size as usize {
            return Err(UpdateError::Inval);
        }

        trace!(
            self.ring,
            Trace::InstallStart {
                area: area_id,
                size: stored_size as u32,
            }
        );

        let tag = [framing::ENVELOPE_TAG];
        let auth_hdr =
            framing::section_header(framing::KEY_AUTH_WRAPPER, auth.len() as u32);
        let manifest_hdr =
            framing::section_header(framing::KEY_MANIFEST, manifest.len() as u32);
        let digest = digester
            .digest_parts(&[&tag, &auth_hdr, auth, &manifest_hdr, manifest])?;

        // Class-ID offset within the stored (re-framed) envelope.
        let class_id_offset = 1
            + framing::SECTION_HEADER_LEN
            + auth.len()
            + framing::SECTION_HEADER_LEN
            + (info.class_id_offset - info.manifest.start);

        let header = AreaHeader {
            version: RECORD_VERSION,
            magic: AREA_MAGIC,
            envelope_offset: HEADER_LEN as u32,
            envelope_size: stored_size as u32,
            class_id_offset: class_id_offset as u32,
            digest,
        };
        let mut header_buf = [ERASED_BYTE; HEADER_LEN];
        hubpack::serialize(&mut header_buf, &header)
            .map_err(|_| UpdateError::Crash)?;

        let r = self
            .write_part(area_id, &header_buf, true, false)
            .and_then(|()| self.write_part(area_id, &tag, false, false))
            .and_then(|()| self.write_part(area_id, &auth_hdr, false, false))
            .and_then(|()| self.write_part(area_id, auth, false, false))
            .and_then(|()| self.write_part(area_id, &manifest_hdr, false, false))
            .and_then(|()| self.write_part(area_id, manifest, false, true));

        match r {
            Ok(()) => {
                trace!(
                    self.ring,
                    Trace::InstallCommit {
                        area: area_id,
                        size: stored_size as u32,
                    }
                );
                Ok(EnvelopeSpan {
                    offset: area.base + HEADER_LEN as u32,
                    size: stored_size as u32,
                    class_id_offset: class_id_offset as u32,
                })
            }
            Err(err) => {
                trace!(self.ring, Trace::InstallAbort { area: area_id, err });
                Err(err)
            }
        }
    }

    /// Looks up the installed envelope in an area, re-validating it
    /// end to end: header record, stored digest, structural decode. Any
    /// failure means the area holds no envelope. The envelope bytes are
    /// left in `scratch` for the caller.
    pub fn get(
        &self,
        area_id: u8,
        codec: &impl EnvelopeCodec,
        digester: &impl DigestProvider,
        scratch: &mut [u8],
    ) -> Result<EnvelopeSpan, UpdateError> {
        let area = self.area(area_id)?;

        let mut header_buf = [0; AreaHeader::MAX_SIZE];
        self.flash
            .read(area.base, &mut header_buf)
            .map_err(from_flash)?;
        let (header, _) = hubpack::deserialize::<AreaHeader>(&header_buf)
            .map_err(|_| UpdateError::NotFound)?;
        if !header.is_valid() {
            return Err(UpdateError::NotFound);
        }

        let offset = header.envelope_offset as usize;
        let size = header.envelope_size as usize;
        if offset != HEADER_LEN || offset + size > area.size as usize {
            return Err(UpdateError::NotFound);
        }
        if header.class_id_offset as usize + framing::CLASS_ID_LEN > size {
            return Err(UpdateError::NotFound);
        }
        if scratch.len() < size {
            return Err(UpdateError::Nomem);
        }

        let envelope = &mut scratch[..size];
        self.flash
            .read(area.base + offset as u32, envelope)
            .map_err(from_flash)?;

        match digester.verify(envelope, &header.digest) {
            Ok(()) => (),
            // A digest mismatch here is a torn or interrupted install,
            // not a tampered image: the area holds no envelope.
            Err(UpdateError::Authentication) => {
                return Err(UpdateError::NotFound)
            }
            Err(e) => return Err(e),
        }
        codec
            .decode_and_validate(envelope)
            .map_err(|_| UpdateError::NotFound)?;

        Ok(EnvelopeSpan {
            offset: area.base + offset as u32,
            size: size as u32,
            class_id_offset: header.class_id_offset,
        })
    }

    /// Erases an installed envelope. Idempotent.
    pub fn erase_area(&mut self, area_id: u8) -> Result<(), UpdateError> {
        let area = self.area(area_id)?;
        if self.armed == Some(area_id) {
            self.armed = None;
        }
        self.flash
            .erase(area.base, area.size)
            .map_err(from_flash)?;
        trace!(self.ring, Trace::AreaErased { area: area_id });
        Ok(())
    }

    /// Replaces the update candidate registry with `regions`.
    pub fn candidate_set(
        &mut self,
        regions: &[MemRegion],
    ) -> Result<(), UpdateError> {
        if regions.is_empty() || regions.len() > MAX_CANDIDATE_REGIONS {
            return Err(UpdateError::Inval);
        }

        let mut rec = CandidateRecord {
            version: RECORD_VERSION,
            magic: CANDIDATE_MAGIC,
            len: regions.len() as u32,
            regions: [MemRegion { address: 0, size: 0 }; MAX_CANDIDATE_REGIONS],
        };
        rec.regions[..regions.len()].copy_from_slice(regions);

        let mut buf = [ERASED_BYTE; CANDIDATE_RECORD_LEN];
        hubpack::serialize(&mut buf, &rec).map_err(|_| UpdateError::Crash)?;

        let area = self.layout.candidate;
        self.flash.erase(area.base, area.size).map_err(from_flash)?;
        self.flash.write(area.base, &buf).map_err(from_flash)?;
        trace!(
            self.ring,
            Trace::CandidateSet {
                count: regions.len() as u8,
            }
        );
        Ok(())
    }

    fn load_candidate(&self) -> Option<CandidateRecord> {
        let mut buf = [0; CandidateRecord::MAX_SIZE];
        self.flash.read(self.layout.candidate.base, &mut buf).ok()?;
        let (rec, _) = hubpack::deserialize::<CandidateRecord>(&buf).ok()?;
        rec.is_valid().then_some(rec)
    }

    /// Reads the candidate registry into `out`, returning how many
    /// regions it holds.
    pub fn candidate_get(
        &self,
        out: &mut [MemRegion],
    ) -> Result<usize, UpdateError> {
        let rec = self.load_candidate().ok_or(UpdateError::NotFound)?;
        let len = rec.len as usize;
        if out.len() < len {
            return Err(UpdateError::Nomem);
        }
        out[..len].copy_from_slice(&rec.regions[..len]);
        Ok(len)
    }

    pub fn candidate_present(&self) -> bool {
        self.load_candidate().is_some()
    }

    /// Drops the candidate registry. Idempotent.
    pub fn candidate_clear(&mut self) -> Result<(), UpdateError> {
        let area = self.layout.candidate;
        self.flash.erase(area.base, area.size).map_err(from_flash)?;
        trace!(self.ring, Trace::CandidateCleared);
        Ok(())
    }

    /// Persists a boot report. Its presence is the emergency flag; the
    /// payload may be empty.
    pub fn report_save(&mut self, payload: &[u8]) -> Result<(), UpdateError> {
        if payload.len() > MAX_REPORT_PAYLOAD {
            return Err(UpdateError::Inval);
        }

        let mut rec = ReportRecord {
            version: RECORD_VERSION,
            magic: REPORT_MAGIC,
            len: payload.len() as u32,
            payload: [0; MAX_REPORT_PAYLOAD],
        };
        rec.payload[..payload.len()].copy_from_slice(payload);

        let mut buf = [ERASED_BYTE; REPORT_RECORD_LEN];
        hubpack::serialize(&mut buf, &rec).map_err(|_| UpdateError::Crash)?;

        let area = self.layout.report;
        self.flash.erase(area.base, area.size).map_err(from_flash)?;
        self.flash.write(area.base, &buf).map_err(from_flash)?;
        trace!(
            self.ring,
            Trace::ReportSaved {
                len: payload.len() as u8,
            }
        );
        Ok(())
    }

    fn load_report(&self) -> Option<ReportRecord> {
        let mut buf = [0; ReportRecord::MAX_SIZE];
        self.flash.read(self.layout.report.base, &mut buf).ok()?;
        let (rec, _) = hubpack::deserialize::<ReportRecord>(&buf).ok()?;
        rec.is_valid().then_some(rec)
    }

    pub fn report_read(&self, out: &mut [u8]) -> Result<usize, UpdateError> {
        let rec = self.load_report().ok_or(UpdateError::NotFound)?;
        let len = rec.len as usize;
        if out.len() < len {
            return Err(UpdateError::Nomem);
        }
        out[..len].copy_from_slice(&rec.payload[..len]);
        Ok(len)
    }

    pub fn report_present(&self) -> bool {
        self.load_report().is_some()
    }

    /// Clears the boot report, and with it the emergency flag.
    /// Idempotent.
    pub fn report_clear(&mut self) -> Result<(), UpdateError> {
        let area = self.layout.report;
        self.flash.erase(area.base, area.size).map_err(from_flash)?;
        trace!(self.ring, Trace::ReportCleared);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drv_flash_api::RamFlash;
    use drv_update_api::{Sha256Provider, CLASS_APP_LOCAL_A, CLASS_ROOT};
    use framing::StructuralCodec;
    use proptest::prelude::*;

    const AREA_SIZE: u32 = 1024;

    fn mk() -> Storage<RamFlash<4096>, 2> {
        Storage::new(
            RamFlash::new(FLASH_WORD_BYTES),
            StorageLayout {
                areas: [
                    StorageArea { base: 0, size: AREA_SIZE },
                    StorageArea { base: 1024, size: AREA_SIZE },
                ],
                candidate: StorageArea { base: 2048, size: 256 },
                report: StorageArea { base: 2304, size: 256 },
                erase_unit: 256,
            },
        )
        .unwrap()
    }

    fn envelope(
        class: &ManifestClassId,
        auth: &[u8],
        body: &[u8],
    ) -> Vec<u8> {
        let mut manifest = class.0.to_vec();
        manifest.extend_from_slice(body);

        let mut v = vec![framing::ENVELOPE_TAG];
        v.extend_from_slice(&framing::section_header(
            framing::KEY_AUTH_WRAPPER,
            auth.len() as u32,
        ));
        v.extend_from_slice(auth);
        v.extend_from_slice(&framing::section_header(
            framing::KEY_MANIFEST,
            manifest.len() as u32,
        ));
        v.extend_from_slice(&manifest);
        v
    }

    #[test]
    fn install_then_get_roundtrip() {
        let mut st = mk();
        let env0 = envelope(&CLASS_ROOT, b"wrapper-0", &[0xAA; 100]);
        let env1 = envelope(&CLASS_APP_LOCAL_A, b"wrapper-1", &[0x55; 60]);

        let span0 = st
            .install(0, &env0, &StructuralCodec, &Sha256Provider)
            .unwrap();
        let span1 = st
            .install(1, &env1, &StructuralCodec, &Sha256Provider)
            .unwrap();
        assert_eq!(span0.offset, HEADER_LEN as u32);
        assert_eq!(span1.offset, 1024 + HEADER_LEN as u32);

        let mut scratch = [0; 1024];
        let got = st
            .get(0, &StructuralCodec, &Sha256Provider, &mut scratch)
            .unwrap();
        assert_eq!(got, span0);
        assert_eq!(&scratch[..got.size as usize], &env0[..]);
        assert_eq!(got.class_id(&scratch), Some(CLASS_ROOT));

        let got = st
            .get(1, &StructuralCodec, &Sha256Provider, &mut scratch)
            .unwrap();
        assert_eq!(&scratch[..got.size as usize], &env1[..]);
        assert_eq!(got.class_id(&scratch), Some(CLASS_APP_LOCAL_A));
    }

    #[test]
    fn reinstall_replaces() {
        let mut st = mk();
        let old = envelope(&CLASS_ROOT, b"old", &[1; 50]);
        let new = envelope(&CLASS_ROOT, b"new-wrapper", &[2; 200]);

        st.install(0, &old, &StructuralCodec, &Sha256Provider).unwrap();
        st.install(0, &new, &StructuralCodec, &Sha256Provider).unwrap();

        let mut scratch = [0; 1024];
        let got = st
            .get(0, &StructuralCodec, &Sha256Provider, &mut scratch)
            .unwrap();
        assert_eq!(&scratch[..got.size as usize], &new[..]);
    }

    #[test]
    fn empty_area_reads_absent() {
        let st = mk();
        let mut scratch = [0; 1024];
        assert_eq!(
            st.get(0, &StructuralCodec, &Sha256Provider, &mut scratch),
            Err(UpdateError::NotFound)
        );
        assert_eq!(
            st.get(9, &StructuralCodec, &Sha256Provider, &mut scratch),
            Err(UpdateError::Inval)
        );
    }

    #[test]
    fn erase_area_removes_envelope() {
        let mut st = mk();
        let env = envelope(&CLASS_ROOT, b"w", &[3; 30]);
        st.install(0, &env, &StructuralCodec, &Sha256Provider).unwrap();
        st.erase_area(0).unwrap();
        st.erase_area(0).unwrap();

        let mut scratch = [0; 1024];
        assert_eq!(
            st.get(0, &StructuralCodec, &Sha256Provider, &mut scratch),
            Err(UpdateError::NotFound)
        );
    }

    #[test]
    fn oversized_install_rejected() {
        let mut st = mk();
        let env = envelope(&CLASS_ROOT, b"w", &[0; 2000]);
        assert_eq!(
            st.install(0, &env, &StructuralCodec, &Sha256Provider),
            Err(UpdateError::Inval)
        );
        let mut scratch = [0; 2048];
        assert_eq!(
            st.get(0, &StructuralCodec, &Sha256Provider, &mut scratch),
            Err(UpdateError::NotFound)
        );
    }

    #[test]
    fn write_sequence_discipline() {
        let mut st = mk();

        // A sequence must open with a reset append.
        assert_eq!(
            st.write_part(0, &[1; 8], false, false),
            Err(UpdateError::IncorrectState)
        );

        st.write_part(0, &[1; 8], true, false).unwrap();
        // Retargeting mid-sequence without a reset is a protocol error.
        assert_eq!(
            st.write_part(1, &[2; 8], false, false),
            Err(UpdateError::IncorrectState)
        );
        // The original sequence survives the refused append.
        st.write_part(0, &[3; 8], false, true).unwrap();

        // The flush completed the sequence.
        assert_eq!(
            st.write_part(0, &[4; 8], false, false),
            Err(UpdateError::IncorrectState)
        );
    }

    #[test]
    fn write_sequence_overflow() {
        let mut st = mk();
        st.write_part(0, &[0; 512], true, false).unwrap();
        assert_eq!(
            st.write_part(0, &[0; 1024], false, false),
            Err(UpdateError::Inval)
        );
        // The failed sequence cannot be resumed.
        assert_eq!(
            st.write_part(0, &[0; 8], false, false),
            Err(UpdateError::IncorrectState)
        );
    }

    #[test]
    fn candidate_registry_roundtrip() {
        let mut st = mk();
        assert!(!st.candidate_present());
        let mut out = [MemRegion { address: 0, size: 0 }; MAX_CANDIDATE_REGIONS];
        assert_eq!(st.candidate_get(&mut out), Err(UpdateError::NotFound));

        let regions = [
            MemRegion { address: 0x0e05_4000, size: 0x800 },
            MemRegion { address: 0x0e05_5000, size: 0x2000 },
        ];
        st.candidate_set(&regions).unwrap();
        assert!(st.candidate_present());
        assert_eq!(st.candidate_get(&mut out), Ok(2));
        assert_eq!(&out[..2], &regions[..]);

        // A new handover replaces the previous list outright.
        let shorter = [MemRegion { address: 0x0e06_0000, size: 0x100 }];
        st.candidate_set(&shorter).unwrap();
        assert_eq!(st.candidate_get(&mut out), Ok(1));
        assert_eq!(out[0], shorter[0]);

        st.candidate_clear().unwrap();
        st.candidate_clear().unwrap();
        assert_eq!(st.candidate_get(&mut out), Err(UpdateError::NotFound));
    }

    #[test]
    fn candidate_list_bounds() {
        let mut st = mk();
        assert_eq!(st.candidate_set(&[]), Err(UpdateError::Inval));

        let too_many =
            [MemRegion { address: 0, size: 1 }; MAX_CANDIDATE_REGIONS + 1];
        assert_eq!(st.candidate_set(&too_many), Err(UpdateError::Inval));

        let regions = [MemRegion { address: 4, size: 4 }; 3];
        st.candidate_set(&regions).unwrap();
        let mut small = [MemRegion { address: 0, size: 0 }; 2];
        assert_eq!(st.candidate_get(&mut small), Err(UpdateError::Nomem));
    }

    #[test]
    fn boot_report_roundtrip() {
        let mut st = mk();
        assert!(!st.report_present());

        st.report_save(b"sdfw fault 0x17").unwrap();
        assert!(st.report_present());

        let mut out = [0; MAX_REPORT_PAYLOAD];
        assert_eq!(st.report_read(&mut out), Ok(15));
        assert_eq!(&out[..15], b"sdfw fault 0x17");

        let mut small = [0; 4];
        assert_eq!(st.report_read(&mut small), Err(UpdateError::Nomem));

        st.report_clear().unwrap();
        assert!(!st.report_present());
        assert_eq!(st.report_read(&mut out), Err(UpdateError::NotFound));

        // A payload-free report still raises the flag.
        st.report_save(&[]).unwrap();
        assert!(st.report_present());
        assert_eq!(st.report_read(&mut out), Ok(0));

        assert_eq!(
            st.report_save(&[0; MAX_REPORT_PAYLOAD + 1]),
            Err(UpdateError::Inval)
        );
    }

    #[test]
    fn overlapping_layout_rejected() {
        let r = Storage::new(
            RamFlash::<4096>::new(FLASH_WORD_BYTES),
            StorageLayout {
                areas: [
                    StorageArea { base: 0, size: 1024 },
                    StorageArea { base: 768, size: 1024 },
                ],
                candidate: StorageArea { base: 2048, size: 256 },
                report: StorageArea { base: 2304, size: 256 },
                erase_unit: 256,
            },
        );
        assert!(matches!(r, Err(UpdateError::Inval)));
    }

    #[test]
    fn torn_install_reads_absent_or_old() {
        // Fault budget 0: the erase itself fails and the previous
        // envelope is untouched.
        let mut st = mk();
        let old = envelope(&CLASS_ROOT, b"old", &[9; 80]);
        let new = envelope(&CLASS_ROOT, b"new", &[8; 80]);
        st.install(0, &old, &StructuralCodec, &Sha256Provider).unwrap();

        st.flash_mut().fail_after(0);
        assert_eq!(
            st.install(0, &new, &StructuralCodec, &Sha256Provider),
            Err(UpdateError::Io)
        );
        st.flash_mut().clear_fault();

        let mut scratch = [0; 1024];
        let got = st
            .get(0, &StructuralCodec, &Sha256Provider, &mut scratch)
            .unwrap();
        assert_eq!(&scratch[..got.size as usize], &old[..]);

        // Budget past the erase but inside the header write: the header
        // is torn and the area reads as empty.
        st.flash_mut().fail_after(AREA_SIZE as usize + FLASH_WORD_BYTES);
        assert_eq!(
            st.install(0, &new, &StructuralCodec, &Sha256Provider),
            Err(UpdateError::Io)
        );
        st.flash_mut().clear_fault();
        assert_eq!(
            st.get(0, &StructuralCodec, &Sha256Provider, &mut scratch),
            Err(UpdateError::NotFound)
        );
    }

    proptest! {
        // Power loss at any point during an install must never leave a
        // garbled envelope behind: afterwards the area reads as absent,
        // or (when only trailing pad bytes were lost) as the complete
        // new envelope.
        #[test]
        fn install_is_atomic_under_power_loss(budget in 0usize..1330) {
            let env = envelope(&CLASS_ROOT, b"wrap", &[0x5A; 200]);
            let total = AREA_SIZE as usize
                + HEADER_LEN
                + word_align(env.len());
            prop_assume!(budget < total);

            let mut st = mk();
            st.flash_mut().fail_after(budget);
            prop_assert!(st
                .install(0, &env, &StructuralCodec, &Sha256Provider)
                .is_err());
            st.flash_mut().clear_fault();

            let mut scratch = [0; 1024];
            match st.get(0, &StructuralCodec, &Sha256Provider, &mut scratch) {
                Err(UpdateError::NotFound) => {}
                Ok(span) => {
                    prop_assert_eq!(&scratch[..span.size as usize], &env[..]);
                }
                Err(e) => prop_assert!(false, "unexpected error {e:?}"),
            }
        }
    }
}
