// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Execution-mode state machine and the recovery orchestration cycle.
//!
//! The mode is recomputed on every boot from two persisted facts, the
//! emergency flag (boot-report presence) and the candidate registry,
//! and then only narrows: the sole runtime transition is
//! `Invoke -> PostInvoke`. Everything else requires a reboot, which
//! re-runs `init` against whatever the persisted flags say by then.

#![cfg_attr(not(test), no_std)]

use drv_flash_api::FlashDevice;
use drv_update_api::{
    recovery_update_allowed, DigestProvider, EnvelopeCodec, ExecutionMode,
    UpdateError,
};
use envelope_storage::Storage;
use ringbuf::{trace, Ringbuf};

/// What a recovery-install cycle did.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    Installed,
    /// The candidate was byte-identical to the installed envelope; a
    /// retry of an interrupted cycle. Nothing was written.
    AlreadyInstalled,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Init { mode: ExecutionMode },
    ModeSet { mode: ExecutionMode },
    SetRefused { requested: ExecutionMode },
    BootFailed,
    CycleStart { area: u8 },
    PolicyDenied,
    CandidateIdentical,
    Installed { area: u8 },
    CycleFailed { err: UpdateError },
}

pub struct ExecModeMachine {
    mode: ExecutionMode,
    ring: Ringbuf<Trace, 16>,
}

impl ExecModeMachine {
    /// Computes the boot mode from the persisted flags. The emergency
    /// flag dominates: a failed boot must reach the recovery path even
    /// if an ordinary update is also pending.
    pub fn init(report_present: bool, candidate_present: bool) -> Self {
        let mode = if report_present {
            ExecutionMode::InstallRecovery
        } else if candidate_present {
            ExecutionMode::Install
        } else {
            ExecutionMode::Invoke
        };
        let mut m = Self {
            mode,
            ring: Ringbuf::new(Trace::None),
        };
        trace!(m.ring, Trace::Init { mode });
        m
    }

    pub fn for_storage<F: FlashDevice, const A: usize>(
        storage: &Storage<F, A>,
    ) -> Self {
        Self::init(storage.report_present(), storage.candidate_present())
    }

    pub fn get(&self) -> ExecutionMode {
        self.mode
    }

    /// Requests a mode transition. The only one open at runtime is
    /// `Invoke -> PostInvoke`; the install modes are left by rebooting,
    /// and `PostInvoke` is terminal.
    pub fn set(&mut self, mode: ExecutionMode) -> Result<(), UpdateError> {
        match (self.mode, mode) {
            (ExecutionMode::Invoke, ExecutionMode::PostInvoke) => {
                self.mode = mode;
                trace!(self.ring, Trace::ModeSet { mode });
                Ok(())
            }
            _ => {
                trace!(self.ring, Trace::SetRefused { requested: mode });
                Err(UpdateError::IncorrectState)
            }
        }
    }

    /// Records the outcome of the foreground boot. On success the
    /// machine moves to `PostInvoke`; on failure it persists a boot
    /// report (raising the emergency flag) and leaves the mode alone so
    /// the caller can reboot into recovery. Calling this outside
    /// `Invoke` is a sequencing bug.
    pub fn finish_boot<F: FlashDevice, const A: usize>(
        &mut self,
        storage: &mut Storage<F, A>,
        boot_result: Result<(), UpdateError>,
        report: &[u8],
    ) -> Result<(), UpdateError> {
        if self.mode != ExecutionMode::Invoke {
            return Err(UpdateError::Inval);
        }
        match boot_result {
            Ok(()) => self.set(ExecutionMode::PostInvoke),
            Err(_) => {
                trace!(self.ring, Trace::BootFailed);
                storage.report_save(report)
            }
        }
    }

    /// Gate for the recovery install path: only open once `init` has
    /// put the device in `InstallRecovery`.
    pub fn enter_recovery_install(&self) -> Result<(), UpdateError> {
        if self.mode == ExecutionMode::InstallRecovery {
            Ok(())
        } else {
            Err(UpdateError::AccessDenied)
        }
    }

    /// One recovery-install cycle over a fetched candidate envelope.
    ///
    /// Whatever happens past the mode gate, the candidate registry is
    /// cleared before returning, so a persistently bad candidate cannot
    /// wedge the device in a recovery loop. The emergency flag and the
    /// mode are deliberately untouched: the caller reboots, and the
    /// next boot decides whether recovery is still needed.
    ///
    /// `scratch` must be large enough for the installed envelope in
    /// `area_id`; it is used for the idempotent-retry comparison.
    pub fn run_install_recovery<F: FlashDevice, const A: usize>(
        &mut self,
        storage: &mut Storage<F, A>,
        area_id: u8,
        candidate: &[u8],
        codec: &impl EnvelopeCodec,
        digester: &impl DigestProvider,
        scratch: &mut [u8],
    ) -> Result<CycleOutcome, UpdateError> {
        self.enter_recovery_install()?;
        trace!(self.ring, Trace::CycleStart { area: area_id });

        let result =
            self.try_install(storage, area_id, candidate, codec, digester, scratch);
        let cleared = storage.candidate_clear();

        match result {
            Ok(outcome) => {
                cleared?;
                Ok(outcome)
            }
            // The install outcome outranks a cleanup failure.
            Err(err) => {
                trace!(self.ring, Trace::CycleFailed { err });
                Err(err)
            }
        }
    }

    fn try_install<F: FlashDevice, const A: usize>(
        &mut self,
        storage: &mut Storage<F, A>,
        area_id: u8,
        candidate: &[u8],
        codec: &impl EnvelopeCodec,
        digester: &impl DigestProvider,
        scratch: &mut [u8],
    ) -> Result<CycleOutcome, UpdateError> {
        let info = codec.decode_and_validate(candidate)?;
        let class_bytes = candidate
            .get(info.class_id_offset..info.class_id_offset + 16)
            .ok_or(UpdateError::Inval)?;
        let mut class = drv_update_api::ManifestClassId([0; 16]);
        class.0.copy_from_slice(class_bytes);

        if !recovery_update_allowed(&class) {
            trace!(self.ring, Trace::PolicyDenied);
            return Err(UpdateError::AccessDenied);
        }

        match storage.get(area_id, codec, digester, scratch) {
            Ok(span) if &scratch[..span.size as usize] == candidate => {
                trace!(self.ring, Trace::CandidateIdentical);
                return Ok(CycleOutcome::AlreadyInstalled);
            }
            Ok(_) | Err(UpdateError::NotFound) => (),
            Err(e) => return Err(e),
        }

        storage.install(area_id, candidate, codec, digester)?;
        trace!(self.ring, Trace::Installed { area: area_id });
        Ok(CycleOutcome::Installed)
    }
}
