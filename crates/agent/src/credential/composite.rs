// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Composite credential backend: ordered fallback across real backends.

use super::{CredentialBackend, StoredCredentials};

pub struct CompositeBackend {
    backends: Vec<Box<dyn CredentialBackend>>,
}

impl CompositeBackend {
    pub fn new(backends: Vec<Box<dyn CredentialBackend>>) -> Self {
        Self { backends }
    }
}

impl CredentialBackend for CompositeBackend {
    fn name(&self) -> &'static str {
        "composite"
    }

    /// Write to the first backend that accepts. The last error propagates
    /// only after every backend has been tried.
    fn store(&self, credentials: &StoredCredentials) -> anyhow::Result<()> {
        let mut last_err = anyhow::anyhow!("no credential backends configured");
        for backend in &self.backends {
            match backend.store(credentials) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::debug!(backend = backend.name(), err = %e, "credential store failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Read from the first backend that has an answer.
    fn retrieve(&self) -> anyhow::Result<Option<StoredCredentials>> {
        for backend in &self.backends {
            match backend.retrieve() {
                Ok(Some(credentials)) => return Ok(Some(credentials)),
                Ok(None) => continue,
                Err(e) => {
                    tracing::debug!(backend = backend.name(), err = %e, "credential read failed");
                }
            }
        }
        Ok(None)
    }

    /// Delete everywhere; individual failures are swallowed.
    fn delete(&self) -> anyhow::Result<()> {
        for backend in &self.backends {
            if let Err(e) = backend.delete() {
                tracing::debug!(backend = backend.name(), err = %e, "credential delete failed");
            }
        }
        Ok(())
    }

    fn exists(&self) -> bool {
        self.backends.iter().any(|b| b.exists())
    }
}

#[cfg(test)]
#[path = "composite_tests.rs"]
mod tests;
