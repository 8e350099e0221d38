// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Recovery sink: reconciles a fetched recovery-firmware candidate with
//! the secure-boot ROM's one-shot update machinery.
//!
//! The ROM swap itself happens across a reboot, so a single logical
//! update takes two passes through [`RecoverySink::write`]: the first
//! (ROM status `None`) validates the candidate and arms the ROM,
//! returning [`WriteOutcome::Scheduled`]; after the reboot the second
//! pass (status `RecoveryActivated`) checks that what the ROM now runs
//! matches the candidate and returns [`WriteOutcome::Confirmed`].
//! Whether and when to reboot is the caller's decision.

#![cfg_attr(not(test), no_std)]

use drv_update_api::{
    Digest, DigestProvider, RecoveryRegions, RecoveryRom, RomUpdateStatus,
    UpdateError, DIGEST_SIZE,
};
use ringbuf::{trace, Ringbuf};

/// How many concurrent sink contexts the pool holds. The streamer needs
/// one; the second absorbs a release that raced a new open.
pub const MAX_SINK_CONTEXTS: usize = 2;

/// Bytes checked at the sentinel offset to tell an absent (erased)
/// candidate slot from a populated one.
pub const SENTINEL_LEN: usize = 4;

/// Where things live inside a recovery candidate image. Fixed at
/// integration time to match what the ROM expects.
#[derive(Copy, Clone, Debug)]
pub struct CandidateLayout {
    /// Offset of the presence sentinel; all-0xFF means no candidate.
    pub sentinel_offset: u32,
    /// Offset of the firmware digest embedded in the candidate's
    /// manifest.
    pub manifest_digest_offset: u32,
    /// The offsets handed to the ROM when scheduling the swap. The
    /// firmware sub-range runs from `regions.firmware_offset` to the
    /// end of the candidate.
    pub regions: RecoveryRegions,
}

/// What one `write` pass accomplished.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Candidate already matches the installed firmware; nothing to do.
    Skipped,
    /// The ROM is armed; the swap happens across the next reboot.
    Scheduled,
    /// Post-reboot check passed; the candidate is what now runs.
    Confirmed,
}

/// Opaque handle into the context pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ContextId(usize);

#[derive(Copy, Clone, Debug, Default)]
struct SinkContext {
    in_use: bool,
    write_called: bool,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Opened { ctx: u8 },
    Released { ctx: u8 },
    CandidateAbsent,
    SelfCheckFailed,
    AlreadyInstalled,
    Scheduled,
    Confirmed,
    ConfirmMismatch,
    UnexpectedStatus,
    RomFailure { code: u32 },
    EraseStatusFailed { err: UpdateError },
}

pub struct RecoverySink {
    layout: CandidateLayout,
    contexts: [SinkContext; MAX_SINK_CONTEXTS],
    ring: Ringbuf<Trace, 16>,
}

impl RecoverySink {
    pub fn new(layout: CandidateLayout) -> Self {
        Self {
            layout,
            contexts: [SinkContext::default(); MAX_SINK_CONTEXTS],
            ring: Ringbuf::new(Trace::None),
        }
    }

    pub fn open(&mut self) -> Result<ContextId, UpdateError> {
        for (i, ctx) in self.contexts.iter_mut().enumerate() {
            if !ctx.in_use {
                ctx.in_use = true;
                ctx.write_called = false;
                trace!(self.ring, Trace::Opened { ctx: i as u8 });
                return Ok(ContextId(i));
            }
        }
        Err(UpdateError::Nomem)
    }

    pub fn release(&mut self, id: ContextId) -> Result<(), UpdateError> {
        let ctx = self
            .contexts
            .get_mut(id.0)
            .ok_or(UpdateError::Inval)?;
        if !ctx.in_use {
            return Err(UpdateError::IncorrectState);
        }
        ctx.in_use = false;
        ctx.write_called = false;
        trace!(self.ring, Trace::Released { ctx: id.0 as u8 });
        Ok(())
    }

    /// One reconciliation pass over the whole candidate. Exactly one
    /// write per context; a second call on the same context fails with
    /// `IncorrectState` whatever the first returned.
    ///
    /// Every exit except `Scheduled` clears the ROM's update-status
    /// registers, so stale status cannot confuse the next boot; a
    /// clearing failure is surfaced only when nothing more specific
    /// went wrong first.
    pub fn write(
        &mut self,
        id: ContextId,
        candidate: &[u8],
        rom: &mut impl RecoveryRom,
        digester: &impl DigestProvider,
    ) -> Result<WriteOutcome, UpdateError> {
        let ctx = self
            .contexts
            .get_mut(id.0)
            .ok_or(UpdateError::Inval)?;
        if !ctx.in_use || ctx.write_called {
            return Err(UpdateError::IncorrectState);
        }
        ctx.write_called = true;

        let result = self.process(candidate, rom, digester);

        if !matches!(result, Ok(WriteOutcome::Scheduled)) {
            if let Err(err) = rom.erase_status() {
                trace!(self.ring, Trace::EraseStatusFailed { err });
                if result.is_ok() {
                    return Err(err);
                }
            }
        }
        result
    }

    fn firmware_digest(
        &self,
        candidate: &[u8],
        digester: &impl DigestProvider,
    ) -> Result<Digest, UpdateError> {
        let start = self.layout.regions.firmware_offset as usize;
        let firmware = candidate.get(start..).ok_or(UpdateError::Inval)?;
        if firmware.is_empty() {
            return Err(UpdateError::Inval);
        }
        digester.digest(firmware)
    }

    fn process(
        &mut self,
        candidate: &[u8],
        rom: &mut impl RecoveryRom,
        digester: &impl DigestProvider,
    ) -> Result<WriteOutcome, UpdateError> {
        match rom.update_status() {
            RomUpdateStatus::None => {
                self.start_update(candidate, rom, digester)
            }
            RomUpdateStatus::RecoveryActivated => {
                // Back from the swap reboot: what the ROM reports as
                // installed must be the candidate we scheduled.
                let expected = self.firmware_digest(candidate, digester)?;
                if rom.current_digest() == expected {
                    trace!(self.ring, Trace::Confirmed);
                    Ok(WriteOutcome::Confirmed)
                } else {
                    trace!(self.ring, Trace::ConfirmMismatch);
                    Err(UpdateError::Authentication)
                }
            }
            RomUpdateStatus::UrotActivated
            | RomUpdateStatus::VerifyOk
            | RomUpdateStatus::ArotRecovery => {
                // Some other agent's update is in flight; recovery must
                // not touch the registers' owner state.
                trace!(self.ring, Trace::UnexpectedStatus);
                Err(UpdateError::IncorrectState)
            }
            RomUpdateStatus::Fail(code) => {
                trace!(self.ring, Trace::RomFailure { code });
                Err(UpdateError::Crash)
            }
        }
    }

    fn start_update(
        &mut self,
        candidate: &[u8],
        rom: &mut impl RecoveryRom,
        digester: &impl DigestProvider,
    ) -> Result<WriteOutcome, UpdateError> {
        let sentinel_at = self.layout.sentinel_offset as usize;
        let sentinel = candidate
            .get(sentinel_at..sentinel_at + SENTINEL_LEN)
            .ok_or(UpdateError::Inval)?;
        if sentinel.iter().all(|&b| b == 0xFF) {
            // Erased slot. Not an error: there is just nothing to do.
            trace!(self.ring, Trace::CandidateAbsent);
            return Err(UpdateError::NotFound);
        }

        if candidate.len() as u32 > self.layout.regions.max_size {
            return Err(UpdateError::Inval);
        }

        let digest_at = self.layout.manifest_digest_offset as usize;
        let embedded = candidate
            .get(digest_at..digest_at + DIGEST_SIZE)
            .ok_or(UpdateError::Inval)?;
        let computed = self.firmware_digest(candidate, digester)?;
        if embedded != computed.as_slice() {
            // The candidate contradicts itself; fetch corruption.
            trace!(self.ring, Trace::SelfCheckFailed);
            return Err(UpdateError::Crash);
        }

        if rom.current_digest() == computed {
            trace!(self.ring, Trace::AlreadyInstalled);
            return Ok(WriteOutcome::Skipped);
        }

        rom.schedule_recovery_update(&self.layout.regions)?;
        trace!(self.ring, Trace::Scheduled);
        Ok(WriteOutcome::Scheduled)
    }
}
