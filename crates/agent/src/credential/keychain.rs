// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! OS-keychain credential backend.

use keyring::Entry;

use super::{CredentialBackend, StoredCredentials};

pub struct KeychainBackend {
    service: String,
    account: String,
}

impl KeychainBackend {
    pub fn new(service: &str, account: &str) -> Self {
        Self { service: service.to_owned(), account: account.to_owned() }
    }

    fn entry(&self) -> anyhow::Result<Entry> {
        Ok(Entry::new(&self.service, &self.account)?)
    }
}

impl CredentialBackend for KeychainBackend {
    fn name(&self) -> &'static str {
        "keychain"
    }

    fn store(&self, credentials: &StoredCredentials) -> anyhow::Result<()> {
        let payload = serde_json::to_string(credentials)?;
        self.entry()?.set_password(&payload)?;
        Ok(())
    }

    fn retrieve(&self) -> anyhow::Result<Option<StoredCredentials>> {
        match self.entry()?.get_password() {
            Ok(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self) -> anyhow::Result<()> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self) -> bool {
        self.entry().map(|e| e.get_password().is_ok()).unwrap_or(false)
    }
}
