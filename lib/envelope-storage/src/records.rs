// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persisted records: the per-area envelope header, the update
//! candidate registry, and the boot report.
//!
//! Every record leads with `{version, magic}` so a reader can tell a
//! valid record from erased or torn flash before trusting the rest.
//! Records are fixed-shape hubpack structs; variable-length content is
//! carried as a max-sized array plus an explicit length.

use drv_update_api::{Digest, MemRegion};
use hubpack::SerializedSize;
use serde::{Deserialize, Serialize};

pub const RECORD_VERSION: u32 = 1;

pub const AREA_MAGIC: [u8; 8] = *b"ENVAREA\0";
pub const CANDIDATE_MAGIC: [u8; 8] = *b"UPDCAND\0";
pub const REPORT_MAGIC: [u8; 8] = *b"BOOTRPT\0";

/// Longest candidate region list we will persist.
pub const MAX_CANDIDATE_REGIONS: usize = 4;

/// Longest boot-report payload we will persist.
pub const MAX_REPORT_PAYLOAD: usize = 32;

/// Header at the base of each envelope area. Written as the first of
/// the three install appends; `digest` covers the stored envelope
/// bytes, so a torn install fails verification on the next read.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, SerializedSize)]
pub struct AreaHeader {
    pub version: u32,
    pub magic: [u8; 8],
    /// Offset of the stored envelope, relative to the area base.
    pub envelope_offset: u32,
    pub envelope_size: u32,
    /// Offset of the manifest class-ID field, relative to the stored
    /// envelope.
    pub class_id_offset: u32,
    pub digest: Digest,
}

/// The update candidate registry: an ordered list of device-global
/// regions handed over by the application domain.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, SerializedSize)]
pub struct CandidateRecord {
    pub version: u32,
    pub magic: [u8; 8],
    pub len: u32,
    pub regions: [MemRegion; MAX_CANDIDATE_REGIONS],
}

/// The boot report. Its presence doubles as the emergency flag; the
/// payload is an opaque blob owned by whoever failed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, SerializedSize)]
pub struct ReportRecord {
    pub version: u32,
    pub magic: [u8; 8],
    pub len: u32,
    pub payload: [u8; MAX_REPORT_PAYLOAD],
}

impl CandidateRecord {
    pub fn is_valid(&self) -> bool {
        self.version == RECORD_VERSION
            && self.magic == CANDIDATE_MAGIC
            && self.len as usize <= MAX_CANDIDATE_REGIONS
    }
}

impl ReportRecord {
    pub fn is_valid(&self) -> bool {
        self.version == RECORD_VERSION
            && self.magic == REPORT_MAGIC
            && self.len as usize <= MAX_REPORT_PAYLOAD
    }
}

impl AreaHeader {
    pub fn is_valid(&self) -> bool {
        self.version == RECORD_VERSION && self.magic == AREA_MAGIC
    }
}
