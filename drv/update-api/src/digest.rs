// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Digest computation seam. The recovery sink and the storage read path
//! only need "compute over a byte range and compare"; the algorithm is
//! fixed at SHA-256 to match what the secure-boot ROM maintains in its
//! digest register.

use crate::UpdateError;

pub const DIGEST_SIZE: usize = 32;

pub type Digest = [u8; DIGEST_SIZE];

pub trait DigestProvider {
    fn digest(&self, data: &[u8]) -> Result<Digest, UpdateError>;

    /// Digest over the concatenation of `parts`, for callers that
    /// assemble an image from discontiguous pieces.
    fn digest_parts(&self, parts: &[&[u8]]) -> Result<Digest, UpdateError>;

    /// Constant-shape compare helper; mismatch is `Authentication`.
    fn verify(&self, data: &[u8], expected: &Digest) -> Result<(), UpdateError> {
        let actual = self.digest(data)?;
        if &actual == expected {
            Ok(())
        } else {
            Err(UpdateError::Authentication)
        }
    }
}

/// The default provider, backed by the `sha2` crate.
pub struct Sha256Provider;

impl DigestProvider for Sha256Provider {
    fn digest(&self, data: &[u8]) -> Result<Digest, UpdateError> {
        use sha2::Digest as _;

        let mut out = [0; DIGEST_SIZE];
        out.copy_from_slice(&sha2::Sha256::digest(data));
        Ok(out)
    }

    fn digest_parts(&self, parts: &[&[u8]]) -> Result<Digest, UpdateError> {
        use sha2::Digest as _;

        let mut hasher = sha2::Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        let mut out = [0; DIGEST_SIZE];
        out.copy_from_slice(&hasher.finalize());
        Ok(out)
    }
}
