// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Credential resolution for remote sessions.
//!
//! Secrets are looked up through an ordered chain of resolvers: an in-process override, an
//! environment variable named after the secret's purpose, then the platform secret manager
//! under the service name `{credential_system}:{host}`. The first resolver that finds a secret
//! wins; later ones are never consulted. Only the secret manager is ever written to.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::app::errors::AppResult;
use crate::app::ports::SecretStorePort;
use crate::app::types::{AuthMode, CredentialSource, Secret, SecretPurpose};

pub const DEFAULT_CREDENTIAL_SYSTEM: &str = "dayhoff_hpc";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialKey {
    pub host: String,
    pub username: String,
    pub purpose: SecretPurpose,
}

impl CredentialKey {
    pub fn new(host: &str, username: &str, purpose: SecretPurpose) -> Self {
        Self {
            host: host.to_string(),
            username: username.to_string(),
            purpose,
        }
    }

    /// Secret manager account. Passwords live under the bare username so entries written by
    /// other tools for the same host are found.
    pub fn account(&self) -> String {
        match self.purpose {
            SecretPurpose::Password => self.username.clone(),
            SecretPurpose::KeyPassphrase => format!("{}:key-passphrase", self.username),
        }
    }

    /// Environment variables consulted for this key, most specific first.
    pub fn env_vars(&self) -> [String; 2] {
        let base = self.purpose.env_var();
        [
            format!("{base}_{}", env_suffix(&self.host)),
            base.to_string(),
        ]
    }
}

fn env_suffix(host: &str) -> String {
    host.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

pub fn service_name(system: &str, host: &str) -> String {
    format!("{system}:{host}")
}

/// One step of the resolution chain.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    fn source(&self) -> CredentialSource;
    async fn resolve(&self, key: &CredentialKey) -> AppResult<Option<Secret>>;
}

/// Secrets set explicitly for the lifetime of the process.
#[derive(Default)]
pub struct OverrideResolver {
    secrets: RwLock<HashMap<CredentialKey, Secret>>,
}

impl OverrideResolver {
    pub async fn set(&self, key: CredentialKey, secret: Secret) {
        self.secrets.write().await.insert(key, secret);
    }

    pub async fn clear(&self, key: &CredentialKey) -> bool {
        self.secrets.write().await.remove(key).is_some()
    }
}

#[async_trait]
impl SecretResolver for OverrideResolver {
    fn source(&self) -> CredentialSource {
        CredentialSource::Override
    }

    async fn resolve(&self, key: &CredentialKey) -> AppResult<Option<Secret>> {
        Ok(self.secrets.read().await.get(key).cloned())
    }
}

type EnvLookup = dyn Fn(&str) -> Option<String> + Send + Sync;

pub struct EnvResolver {
    lookup: Box<EnvLookup>,
}

impl EnvResolver {
    pub fn new() -> Self {
        Self::with_lookup(|name| std::env::var(name).ok())
    }

    pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            lookup: Box::new(lookup),
        }
    }
}

impl Default for EnvResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretResolver for EnvResolver {
    fn source(&self) -> CredentialSource {
        CredentialSource::Environment
    }

    async fn resolve(&self, key: &CredentialKey) -> AppResult<Option<Secret>> {
        for name in key.env_vars() {
            if let Some(value) = (self.lookup)(&name).filter(|v| !v.is_empty()) {
                tracing::debug!(var = %name, "credential found in environment");
                return Ok(Some(Secret::new(value)));
            }
        }
        Ok(None)
    }
}

pub struct SecretManagerResolver {
    backend: Arc<dyn SecretStorePort>,
    system: String,
}

impl SecretManagerResolver {
    pub fn new(backend: Arc<dyn SecretStorePort>, system: impl Into<String>) -> Self {
        Self {
            backend,
            system: system.into(),
        }
    }
}

#[async_trait]
impl SecretResolver for SecretManagerResolver {
    fn source(&self) -> CredentialSource {
        CredentialSource::SecretManager
    }

    async fn resolve(&self, key: &CredentialKey) -> AppResult<Option<Secret>> {
        let service = service_name(&self.system, &key.host);
        self.backend.get(&service, &key.account()).await
    }
}

pub struct CredentialStore {
    overrides: Arc<OverrideResolver>,
    resolvers: Vec<Arc<dyn SecretResolver>>,
    backend: Arc<dyn SecretStorePort>,
    system: String,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn SecretStorePort>, system: impl Into<String>) -> Self {
        Self::with_env(backend, system, EnvResolver::new())
    }

    pub fn with_env(
        backend: Arc<dyn SecretStorePort>,
        system: impl Into<String>,
        env: EnvResolver,
    ) -> Self {
        let system = system.into();
        let overrides = Arc::new(OverrideResolver::default());
        let resolvers: Vec<Arc<dyn SecretResolver>> = vec![
            overrides.clone(),
            Arc::new(env),
            Arc::new(SecretManagerResolver::new(backend.clone(), system.clone())),
        ];
        Self {
            overrides,
            resolvers,
            backend,
            system,
        }
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    /// Finds the secret the given auth mode needs; `Ok(None)` means no source has one.
    pub async fn resolve(
        &self,
        host: &str,
        username: &str,
        preferred_mode: AuthMode,
    ) -> AppResult<Option<Secret>> {
        let key = CredentialKey::new(host, username, preferred_mode.secret_purpose());
        Ok(self.resolve_key(&key).await?.map(|(secret, _)| secret))
    }

    pub async fn resolve_key(
        &self,
        key: &CredentialKey,
    ) -> AppResult<Option<(Secret, CredentialSource)>> {
        for resolver in &self.resolvers {
            if let Some(secret) = resolver.resolve(key).await? {
                tracing::debug!(
                    host = %key.host,
                    user = %key.username,
                    purpose = key.purpose.as_str(),
                    source = ?resolver.source(),
                    "credential resolved"
                );
                return Ok(Some((secret, resolver.source())));
            }
        }
        Ok(None)
    }

    /// Which source would satisfy a lookup, without handing out the secret.
    pub async fn status(
        &self,
        host: &str,
        username: &str,
        purpose: SecretPurpose,
    ) -> AppResult<Option<CredentialSource>> {
        let key = CredentialKey::new(host, username, purpose);
        Ok(self.resolve_key(&key).await?.map(|(_, source)| source))
    }

    pub async fn store(
        &self,
        host: &str,
        username: &str,
        purpose: SecretPurpose,
        secret: &Secret,
    ) -> AppResult<()> {
        let key = CredentialKey::new(host, username, purpose);
        let service = service_name(&self.system, host);
        self.backend.set(&service, &key.account(), secret).await?;
        tracing::info!(service = %service, user = %username, "credential stored");
        Ok(())
    }

    /// Removes the secret manager entry and any process override. Returns whether anything
    /// was removed.
    pub async fn forget(
        &self,
        host: &str,
        username: &str,
        purpose: SecretPurpose,
    ) -> AppResult<bool> {
        let key = CredentialKey::new(host, username, purpose);
        let service = service_name(&self.system, host);
        let cleared = self.overrides.clear(&key).await;
        let deleted = self.backend.delete(&service, &key.account()).await?;
        Ok(cleared || deleted)
    }

    pub async fn set_override(
        &self,
        host: &str,
        username: &str,
        purpose: SecretPurpose,
        secret: Secret,
    ) {
        self.overrides
            .set(CredentialKey::new(host, username, purpose), secret)
            .await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::app::errors::{AppError, AppErrorKind};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub(crate) struct MemorySecretStore {
        entries: Mutex<HashMap<(String, String), Secret>>,
        pub(crate) gets: AtomicUsize,
    }

    impl MemorySecretStore {
        pub(crate) fn entry(&self, service: &str, account: &str) -> Option<Secret> {
            self.entries
                .lock()
                .unwrap()
                .get(&(service.to_string(), account.to_string()))
                .cloned()
        }
    }

    #[async_trait]
    impl SecretStorePort for MemorySecretStore {
        async fn get(&self, service: &str, account: &str) -> AppResult<Option<Secret>> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            Ok(self.entry(service, account))
        }

        async fn set(&self, service: &str, account: &str, secret: &Secret) -> AppResult<()> {
            self.entries
                .lock()
                .unwrap()
                .insert((service.to_string(), account.to_string()), secret.clone());
            Ok(())
        }

        async fn delete(&self, service: &str, account: &str) -> AppResult<bool> {
            Ok(self
                .entries
                .lock()
                .unwrap()
                .remove(&(service.to_string(), account.to_string()))
                .is_some())
        }
    }

    struct UnreachableSecretStore;

    #[async_trait]
    impl SecretStorePort for UnreachableSecretStore {
        async fn get(&self, _service: &str, _account: &str) -> AppResult<Option<Secret>> {
            Err(AppError::of(
                AppErrorKind::CredentialBackendUnavailable,
                "secret service is not running",
            ))
        }

        async fn set(&self, _service: &str, _account: &str, _secret: &Secret) -> AppResult<()> {
            Err(AppError::of(
                AppErrorKind::CredentialBackendUnavailable,
                "secret service is not running",
            ))
        }

        async fn delete(&self, _service: &str, _account: &str) -> AppResult<bool> {
            Err(AppError::of(
                AppErrorKind::CredentialBackendUnavailable,
                "secret service is not running",
            ))
        }
    }

    fn no_env() -> EnvResolver {
        EnvResolver::with_lookup(|_| None)
    }

    fn env_with(vars: &[(&str, &str)]) -> EnvResolver {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvResolver::with_lookup(move |name| vars.get(name).cloned())
    }

    #[tokio::test]
    async fn store_then_resolve_uses_host_scoped_service() {
        let backend = Arc::new(MemorySecretStore::default());
        let store = CredentialStore::with_env(backend.clone(), DEFAULT_CREDENTIAL_SYSTEM, no_env());
        store
            .store(
                "hpc.example.org",
                "alice",
                SecretPurpose::Password,
                &Secret::new("pw"),
            )
            .await
            .unwrap();

        assert_eq!(
            backend.entry("dayhoff_hpc:hpc.example.org", "alice"),
            Some(Secret::new("pw"))
        );
        let got = store
            .resolve("hpc.example.org", "alice", AuthMode::Password)
            .await
            .unwrap();
        assert_eq!(got, Some(Secret::new("pw")));
        let other_host = store
            .resolve("other.example.org", "alice", AuthMode::Password)
            .await
            .unwrap();
        assert_eq!(other_host, None);
    }

    #[tokio::test]
    async fn override_wins_and_later_sources_are_not_consulted() {
        let backend = Arc::new(MemorySecretStore::default());
        let store = CredentialStore::with_env(
            backend.clone(),
            DEFAULT_CREDENTIAL_SYSTEM,
            env_with(&[("DAYHOFF_HPC_PASSWORD", "from-env")]),
        );
        store
            .set_override("h", "alice", SecretPurpose::Password, Secret::new("from-override"))
            .await;

        let got = store
            .resolve_key(&CredentialKey::new("h", "alice", SecretPurpose::Password))
            .await
            .unwrap();
        assert_eq!(
            got,
            Some((Secret::new("from-override"), CredentialSource::Override))
        );
        assert_eq!(backend.gets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn env_is_consulted_before_secret_manager_and_host_variant_first() {
        let backend = Arc::new(MemorySecretStore::default());
        backend
            .set("dayhoff_hpc:hpc-1.example.org", "alice", &Secret::new("stored"))
            .await
            .unwrap();
        let store = CredentialStore::with_env(
            backend.clone(),
            DEFAULT_CREDENTIAL_SYSTEM,
            env_with(&[
                ("DAYHOFF_HPC_PASSWORD", "generic"),
                ("DAYHOFF_HPC_PASSWORD_HPC_1_EXAMPLE_ORG", "specific"),
            ]),
        );

        let got = store
            .resolve("hpc-1.example.org", "alice", AuthMode::Password)
            .await
            .unwrap();
        assert_eq!(got, Some(Secret::new("specific")));
        assert_eq!(backend.gets.load(Ordering::SeqCst), 0);

        let status = store
            .status("other", "alice", SecretPurpose::Password)
            .await
            .unwrap();
        assert_eq!(status, Some(CredentialSource::Environment));
    }

    #[tokio::test]
    async fn key_passphrase_uses_its_own_account_and_env_var() {
        let backend = Arc::new(MemorySecretStore::default());
        let store = CredentialStore::with_env(backend.clone(), "lab", no_env());
        store
            .store("h", "bob", SecretPurpose::KeyPassphrase, &Secret::new("pp"))
            .await
            .unwrap();
        assert_eq!(backend.entry("lab:h", "bob:key-passphrase"), Some(Secret::new("pp")));
        assert_eq!(
            store.resolve("h", "bob", AuthMode::Password).await.unwrap(),
            None
        );
        assert_eq!(
            store.resolve("h", "bob", AuthMode::Key).await.unwrap(),
            Some(Secret::new("pp"))
        );
        let key = CredentialKey::new("h", "bob", SecretPurpose::KeyPassphrase);
        assert_eq!(key.env_vars()[1], "DAYHOFF_HPC_KEY_PASSPHRASE");
    }

    #[tokio::test]
    async fn unreachable_backend_is_an_error_not_a_miss() {
        let store = CredentialStore::with_env(
            Arc::new(UnreachableSecretStore),
            DEFAULT_CREDENTIAL_SYSTEM,
            no_env(),
        );
        let err = store
            .resolve("h", "alice", AuthMode::Password)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::CredentialBackendUnavailable);

        let err = store
            .store("h", "alice", SecretPurpose::Password, &Secret::new("x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::CredentialBackendUnavailable);
    }

    #[tokio::test]
    async fn unreachable_backend_is_not_reached_when_env_hits() {
        let store = CredentialStore::with_env(
            Arc::new(UnreachableSecretStore),
            DEFAULT_CREDENTIAL_SYSTEM,
            env_with(&[("DAYHOFF_HPC_PASSWORD", "pw")]),
        );
        let got = store.resolve("h", "alice", AuthMode::Password).await.unwrap();
        assert_eq!(got, Some(Secret::new("pw")));
    }

    #[tokio::test]
    async fn forget_removes_entry_and_override() {
        let backend = Arc::new(MemorySecretStore::default());
        let store = CredentialStore::with_env(backend.clone(), DEFAULT_CREDENTIAL_SYSTEM, no_env());
        store
            .store("h", "alice", SecretPurpose::Password, &Secret::new("pw"))
            .await
            .unwrap();
        store
            .set_override("h", "alice", SecretPurpose::Password, Secret::new("o"))
            .await;

        assert!(store.forget("h", "alice", SecretPurpose::Password).await.unwrap());
        assert_eq!(
            store.resolve("h", "alice", AuthMode::Password).await.unwrap(),
            None
        );
        assert!(!store.forget("h", "alice", SecretPurpose::Password).await.unwrap());
    }
}
