// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use russh::MethodKind;
use russh::client::{AuthResult, Handle, KeyboardInteractiveAuthResponse};
use russh::keys::PrivateKeyWithHashAlg;

use crate::app::types::{AuthMode, Secret, SshConfig};

use super::error::AuthenticationFailure;
use super::handler::ClientHandler;

const DEFAULT_IDENTITIES: [&str; 3] = ["id_ed25519", "id_ecdsa", "id_rsa"];

enum AuthDecision {
    Success,
    KeyboardInteractive,
    Failure,
}

fn auth_decision(result: AuthResult) -> AuthDecision {
    match result {
        AuthResult::Success => AuthDecision::Success,
        AuthResult::Failure {
            remaining_methods, ..
        } if remaining_methods.contains(&MethodKind::KeyboardInteractive) => {
            AuthDecision::KeyboardInteractive
        }
        AuthResult::Failure { .. } => AuthDecision::Failure,
    }
}

fn auth_failure(reason: impl std::fmt::Display) -> anyhow::Error {
    anyhow::Error::new(AuthenticationFailure).context(reason.to_string())
}

fn identity_path(config: &SshConfig) -> Result<PathBuf> {
    if let Some(path) = &config.auth.identity_path {
        return Ok(path.clone());
    }
    let ssh_dir = dirs::home_dir()
        .ok_or_else(|| anyhow!("cannot locate home directory for default identity"))?
        .join(".ssh");
    DEFAULT_IDENTITIES
        .iter()
        .map(|name| ssh_dir.join(name))
        .find(|path| path.exists())
        .ok_or_else(|| anyhow!("no identity file configured and none found in {}", ssh_dir.display()))
}

/// Authenticates an already-verified connection. Every rejection by the server is reported
/// as [`AuthenticationFailure`] so callers never retry it.
pub(super) async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    config: &SshConfig,
    secret: Option<&Secret>,
) -> Result<()> {
    let decision = match config.auth.mode {
        AuthMode::Key => {
            let path = identity_path(config).map_err(auth_failure)?;
            let key = russh::keys::load_secret_key(&path, secret.map(Secret::expose))
                .map_err(|err| {
                    auth_failure(format!("failed to load secret key at {}: {err}", path.display()))
                })?;
            let key = PrivateKeyWithHashAlg::new(
                Arc::new(key),
                handle.best_supported_rsa_hash().await?.flatten(),
            );
            let result = handle
                .authenticate_publickey(config.username.clone(), key)
                .await?;
            match auth_decision(result) {
                // Key-only logins can still demand a second factor we cannot answer.
                AuthDecision::KeyboardInteractive => AuthDecision::Failure,
                other => other,
            }
        }
        AuthMode::Password => {
            let password = secret.ok_or_else(|| auth_failure("no password available"))?;
            let result = handle
                .authenticate_password(config.username.clone(), password.expose())
                .await?;
            match auth_decision(result) {
                AuthDecision::KeyboardInteractive => {
                    keyboard_interactive(handle, &config.username, password).await?
                }
                other => other,
            }
        }
    };
    match decision {
        AuthDecision::Success => {
            log::debug!("authenticated {}@{}", config.username, config.host);
            Ok(())
        }
        _ => Err(AuthenticationFailure.into()),
    }
}

/// Answers password-style prompts (hidden input) with the password. Any prompt that
/// expects echoed input cannot be answered unattended and fails authentication.
async fn keyboard_interactive(
    handle: &mut Handle<ClientHandler>,
    username: &str,
    password: &Secret,
) -> Result<AuthDecision> {
    let mut response = handle
        .authenticate_keyboard_interactive_start(username.to_string(), None)
        .await
        .context("keyboard-interactive start failed")?;
    let mut rounds = 0;
    loop {
        match response {
            KeyboardInteractiveAuthResponse::Success => return Ok(AuthDecision::Success),
            KeyboardInteractiveAuthResponse::Failure { .. } => return Ok(AuthDecision::Failure),
            KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                rounds += 1;
                if rounds > 3 || prompts.iter().any(|p| p.echo) {
                    log::debug!("keyboard-interactive asked for input that needs a person");
                    return Ok(AuthDecision::Failure);
                }
                let answers = prompts
                    .iter()
                    .map(|_| password.expose().to_string())
                    .collect();
                response = handle
                    .authenticate_keyboard_interactive_respond(answers)
                    .await
                    .context("keyboard-interactive respond failed")?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AuthDecision, auth_decision};
    use russh::client::AuthResult;
    use russh::{MethodKind, MethodSet};

    #[test]
    fn success_is_success() {
        assert!(matches!(
            auth_decision(AuthResult::Success),
            AuthDecision::Success
        ));
    }

    #[test]
    fn keyboard_interactive_when_server_offers_it() {
        let methods = [MethodKind::KeyboardInteractive];
        let decision = auth_decision(AuthResult::Failure {
            remaining_methods: MethodSet::from(methods.as_slice()),
            partial_success: false,
        });
        assert!(matches!(decision, AuthDecision::KeyboardInteractive));
    }

    #[test]
    fn failure_without_keyboard_interactive() {
        let methods = [MethodKind::PublicKey];
        let decision = auth_decision(AuthResult::Failure {
            remaining_methods: MethodSet::from(methods.as_slice()),
            partial_success: false,
        });
        assert!(matches!(decision, AuthDecision::Failure));
    }
}
