// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared vocabulary for the update storage and orchestration stack.
//!
//! This crate plays the role our `*-api` crates usually play: the types
//! that cross crate seams live here, so the storage manager, the boot
//! orchestrator, the recovery sink and the IPC streamer all agree on
//! error codes, spans, and the collaborator traits (envelope codec,
//! digest provider, secure-boot ROM) without depending on each other.

#![cfg_attr(not(test), no_std)]

use core::ops::Range;
use hubpack::SerializedSize;
use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub mod digest;

pub use digest::{Digest, DigestProvider, Sha256Provider, DIGEST_SIZE};

/// Error taxonomy for the whole subsystem.
///
/// The split that matters to callers is retryable vs. permanent:
/// `Busy`, `Io`, `HwNotReady` and `Again` may succeed on a later
/// attempt (possibly after a reboot); everything else is final for the
/// inputs that produced it.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    FromPrimitive,
    Deserialize,
    Serialize,
    SerializedSize,
)]
#[repr(u32)]
pub enum UpdateError {
    /// No candidate / no installed envelope. Expected, not a failure.
    NotFound = 1,
    /// Caller arguments or input data malformed. Permanent.
    Inval = 2,
    /// Flash or bus transient.
    Io = 3,
    HwNotReady = 4,
    /// Protocol or sequencing violation; a programming error.
    IncorrectState = 5,
    /// Transient resource exhaustion. Always retryable, never data loss.
    Busy = 6,
    /// Digest or signature mismatch. The original firmware is retained.
    Authentication = 7,
    /// Unexpected internal failure; the operation was aborted with no
    /// partial state made visible.
    Crash = 8,
    /// The operation scheduled work that requires a reboot to continue.
    /// Not a failure.
    Again = 9,
    AccessDenied = 10,
    Nomem = 11,
    /// Timed out waiting for the other side.
    Time = 12,
    Unsupported = 13,
}

impl UpdateError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UpdateError::Io
                | UpdateError::HwNotReady
                | UpdateError::Busy
                | UpdateError::Again
        )
    }
}

/// A span in the device-global address space.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    SerializedSize,
)]
pub struct MemRegion {
    pub address: u64,
    pub size: u32,
}

/// Mutually exclusive boot-time execution modes. Recomputed on every
/// boot from the persisted emergency flag and candidate presence; never
/// stored verbatim.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    SerializedSize,
)]
pub enum ExecutionMode {
    Invoke,
    Install,
    InstallRecovery,
    PostInvoke,
}

/// 16-byte UUID identifying a manifest's role in the system.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    SerializedSize,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Unaligned,
)]
#[repr(transparent)]
pub struct ManifestClassId(pub [u8; 16]);

/// uuid5(vendor, 'dual-domain root')
pub const CLASS_ROOT: ManifestClassId = ManifestClassId([
    0x3f, 0x6a, 0x3a, 0x4d, 0xcd, 0xfa, 0x58, 0xc5, 0x06, 0x7c, 0x9e, 0x2d,
    0x4b, 0x1a, 0x8f, 0x11,
]);
/// uuid5(vendor, 'dual-domain app local A')
pub const CLASS_APP_LOCAL_A: ManifestClassId = ManifestClassId([
    0x82, 0x3c, 0x10, 0x5e, 0x7a, 0x40, 0x5b, 0x02, 0xb1, 0x1d, 0x60, 0x9a,
    0x1f, 0xce, 0x86, 0x25,
]);
/// uuid5(vendor, 'dual-domain app local B')
pub const CLASS_APP_LOCAL_B: ManifestClassId = ManifestClassId([
    0x91, 0x07, 0xbb, 0x28, 0x33, 0x95, 0x51, 0xee, 0x94, 0x60, 0x0d, 0xc4,
    0x77, 0x3b, 0x5e, 0xa0,
]);
/// uuid5(vendor, 'dual-domain app recovery')
pub const CLASS_APP_RECOVERY: ManifestClassId = ManifestClassId([
    0x74, 0xd0, 0x2e, 0x6b, 0x18, 0x2c, 0x5f, 0x93, 0x8a, 0xfb, 0x42, 0x11,
    0xc6, 0x09, 0xd7, 0x38,
]);
/// uuid5(vendor, 'dual-domain radio')
pub const CLASS_RADIO: ManifestClassId = ManifestClassId([
    0x5d, 0x81, 0x64, 0xf2, 0xaf, 0x07, 0x5a, 0x1c, 0xa9, 0x35, 0x2b, 0x58,
    0x10, 0xe4, 0x4c, 0x99,
]);
/// uuid5(vendor, 'dual-domain security')
pub const CLASS_SECURITY: ManifestClassId = ManifestClassId([
    0xe6, 0x29, 0x50, 0x0a, 0x9b, 0x63, 0x57, 0x44, 0xbd, 0x12, 0xf8, 0x87,
    0x31, 0x56, 0x02, 0xcd,
]);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ManifestRole {
    Root,
    AppLocalA,
    AppLocalB,
    AppRecovery,
    Radio,
    Security,
}

/// Per-role update policy, the subset of the provisioning information
/// the orchestrator consults.
struct RolePolicy {
    class_id: ManifestClassId,
    role: ManifestRole,
    /// Whether this manifest may be replaced on its own while the device
    /// is in the emergency/recovery context.
    independent_update: bool,
}

static ROLE_TABLE: [RolePolicy; 6] = [
    RolePolicy {
        class_id: CLASS_ROOT,
        role: ManifestRole::Root,
        independent_update: true,
    },
    RolePolicy {
        class_id: CLASS_APP_LOCAL_A,
        role: ManifestRole::AppLocalA,
        independent_update: true,
    },
    RolePolicy {
        class_id: CLASS_APP_LOCAL_B,
        role: ManifestRole::AppLocalB,
        independent_update: true,
    },
    RolePolicy {
        class_id: CLASS_APP_RECOVERY,
        role: ManifestRole::AppRecovery,
        independent_update: true,
    },
    RolePolicy {
        class_id: CLASS_RADIO,
        role: ManifestRole::Radio,
        independent_update: true,
    },
    RolePolicy {
        class_id: CLASS_SECURITY,
        role: ManifestRole::Security,
        // The security manifest is only replaced as part of a full
        // vendor update, never through the recovery path.
        independent_update: false,
    },
];

pub fn role_for(class_id: &ManifestClassId) -> Option<ManifestRole> {
    ROLE_TABLE
        .iter()
        .find(|p| p.class_id == *class_id)
        .map(|p| p.role)
}

pub fn recovery_update_allowed(class_id: &ManifestClassId) -> bool {
    ROLE_TABLE
        .iter()
        .find(|p| p.class_id == *class_id)
        .map_or(false, |p| p.independent_update)
}

/// Processing state of one enqueued chunk, as reported to the provider.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    SerializedSize,
)]
pub enum ChunkStatus {
    Pending,
    Processed,
    Refused,
}

#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    SerializedSize,
)]
pub struct ChunkInfo {
    pub chunk_id: u32,
    pub status: ChunkStatus,
}

/// What the (external) envelope codec reports about a well-formed
/// envelope: where the two severable elements live inside the byte
/// buffer, and where the manifest's class-ID field sits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvelopeInfo {
    pub auth_wrapper: Range<usize>,
    pub manifest: Range<usize>,
    pub class_id_offset: usize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CodecError {
    Truncated,
    Malformed,
}

impl From<CodecError> for UpdateError {
    fn from(_: CodecError) -> Self {
        UpdateError::Inval
    }
}

/// Structural envelope decoding and validation. Manifest semantics
/// (directives, conditions) are out of scope; this only establishes
/// that the buffer is a complete envelope and locates its parts.
pub trait EnvelopeCodec {
    fn decode_and_validate(
        &self,
        bytes: &[u8],
    ) -> Result<EnvelopeInfo, CodecError>;
}

/// Secure-boot ROM update status, as read from the one-time hardware
/// register.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RomUpdateStatus {
    None,
    RecoveryActivated,
    UrotActivated,
    VerifyOk,
    ArotRecovery,
    /// The ROM's own failure code, passed through unmodified.
    Fail(u32),
}

/// Offsets handed to the ROM when scheduling a recovery update. All are
/// relative to the start of the candidate image.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RecoveryRegions {
    pub manifest_offset: u32,
    pub pubkey_offset: u32,
    pub signature_offset: u32,
    pub firmware_offset: u32,
    pub max_size: u32,
}

/// The one-shot secure-boot ROM interface. `schedule_recovery_update`
/// arms the ROM; the actual swap happens across the next reboot, after
/// which `update_status` reports how it went.
pub trait RecoveryRom {
    fn update_status(&self) -> RomUpdateStatus;

    /// Digest of the currently installed recovery firmware, maintained
    /// by the ROM.
    fn current_digest(&self) -> Digest;

    fn schedule_recovery_update(
        &mut self,
        regions: &RecoveryRegions,
    ) -> Result<(), UpdateError>;

    /// Clear the update-status registers so the ROM does not
    /// misinterpret stale state on the next boot.
    fn erase_status(&mut self) -> Result<(), UpdateError>;
}
