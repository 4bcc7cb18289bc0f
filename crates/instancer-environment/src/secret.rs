// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-allocation secret generation and bootstrap payload binding.
//!
//! Each allocation gets a fresh secret drawn from the operating system's
//! CSPRNG. The secret is written into the instance's environment by the
//! bootstrap script and later compared, in constant time, against what the
//! owner submits.

use instancer_core::persistence::ChallengeTemplate;
use rand::Rng;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;

/// Default number of characters in a generated secret.
pub const DEFAULT_SECRET_LENGTH: usize = 24;

/// Shortest secret the policy will generate.
pub const MIN_SECRET_LENGTH: usize = 16;

/// Environment variable the bootstrap script exports the secret as.
pub const SECRET_ENV_VAR: &str = "INSTANCER_SECRET";

/// Secret generation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecretPolicy {
    length: usize,
}

impl Default for SecretPolicy {
    fn default() -> Self {
        Self {
            length: DEFAULT_SECRET_LENGTH,
        }
    }
}

impl SecretPolicy {
    /// Policy generating secrets of `length` characters, never fewer than
    /// [`MIN_SECRET_LENGTH`].
    pub fn new(length: usize) -> Self {
        Self {
            length: length.max(MIN_SECRET_LENGTH),
        }
    }

    /// Configured secret length.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Generate a fresh alphanumeric secret.
    pub fn generate(&self) -> String {
        OsRng
            .sample_iter(&Alphanumeric)
            .take(self.length)
            .map(char::from)
            .collect()
    }
}

/// Build the bootstrap script that installs `secret` on the instance,
/// followed by the template's own setup script.
pub fn bootstrap_payload(secret: &str, template: &ChallengeTemplate) -> String {
    let mut script = String::from("#!/bin/bash\n# Challenge instance bootstrap\n");
    script.push_str(&format!(
        "echo \"export {}={}\" >> /etc/environment\n",
        SECRET_ENV_VAR, secret
    ));

    if !template.bootstrap_script.trim().is_empty() {
        script.push('\n');
        script.push_str(template.bootstrap_script.trim_end());
        script.push('\n');
    }

    script.push_str(&format!(
        "\necho \"Challenge {} ready at $(date)\" >> /var/log/instancer-bootstrap.log\n",
        template.challenge_id
    ));
    script
}

/// Compare a submission against the stored secret in constant time.
///
/// Only the exact string matches: no trimming, no case folding.
pub fn secrets_match(expected: &str, submitted: &str) -> bool {
    expected.as_bytes().ct_eq(submitted.as_bytes()).into()
}
