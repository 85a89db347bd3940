use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::SecretLifetime;

/// One field of a secret fetched from the vault, with the metadata the
/// version lifetime needs. One KV read expands to one of these per field.
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleSecret {
    pub key: String,
    pub field: String,
    pub value: Value,
    pub version: Option<i64>,
    pub created_time: Option<DateTime<Utc>>,
}

/// In-memory secrets used to populate templates, field files, and composite
/// files. Scoped by lifetime, rebuilt on every pass, never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SecretCache {
    entries: HashMap<SecretLifetime, Vec<SimpleSecret>>,
}

impl SecretCache {
    pub fn has_cached(&self, lifetime: SecretLifetime) -> bool {
        match lifetime {
            SecretLifetime::Static | SecretLifetime::Token => self
                .entries
                .get(&lifetime)
                .map(|secrets| !secrets.is_empty())
                .unwrap_or(false),
            SecretLifetime::Version => {
                tracing::error!("secrets with the version lifetime are never cached");
                false
            }
        }
    }

    pub fn store(&mut self, lifetime: SecretLifetime, secrets: Vec<SimpleSecret>) {
        if lifetime == SecretLifetime::Version {
            tracing::error!("refusing to cache version-lifetime secrets");
            return;
        }
        self.entries.insert(lifetime, secrets);
    }

    pub fn get(&self, lifetime: SecretLifetime) -> &[SimpleSecret] {
        self.entries
            .get(&lifetime)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
