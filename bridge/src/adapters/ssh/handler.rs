// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, anyhow};
use russh::keys::known_hosts::{check_known_hosts_path, known_host_keys_path, learn_known_hosts_path};
use russh::keys::ssh_key::{HashAlg, PublicKey};

use super::error::{HostKeyProblem, HostKeyRejected};

/// How the handler treats the key the server presents.
#[derive(Clone, Debug)]
pub(super) enum KeyPolicy {
    /// Accept only keys already in known_hosts.
    Verify,
    /// Accept anything and record what was presented; used for explicit acceptance.
    Capture(Arc<Mutex<Option<PublicKey>>>),
}

#[derive(Clone, Debug)]
pub(super) struct ClientHandler {
    host: String,
    addr: SocketAddr,
    known_hosts: PathBuf,
    policy: KeyPolicy,
}

impl ClientHandler {
    pub(super) fn new(host: String, addr: SocketAddr, known_hosts: PathBuf, policy: KeyPolicy) -> Self {
        Self {
            host,
            addr,
            known_hosts,
            policy,
        }
    }
}

impl russh::client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match &self.policy {
            KeyPolicy::Verify => {
                verify_server_key(&self.host, self.addr, server_public_key, &self.known_hosts)?;
                Ok(true)
            }
            KeyPolicy::Capture(slot) => {
                if let Ok(mut guard) = slot.lock() {
                    *guard = Some(server_public_key.clone());
                }
                Ok(true)
            }
        }
    }
}

/// Checks the presented key against known_hosts by host name, then by IP.
/// Never learns: an unknown host is rejected just like a changed key.
pub(super) fn verify_server_key(
    host: &str,
    addr: SocketAddr,
    key: &PublicKey,
    known_hosts: &Path,
) -> anyhow::Result<()> {
    let port = addr.port();
    let ip_host = addr.ip().to_string();
    let mut candidates = vec![host.to_string()];
    if ip_host != host {
        candidates.push(ip_host);
    }

    for candidate in &candidates {
        match check_known_hosts_path(candidate, port, key, known_hosts) {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(russh::keys::Error::KeyChanged { line }) => {
                log::warn!(
                    "host key for {candidate}:{port} does not match {} line {line}",
                    known_hosts.display()
                );
                return Err(HostKeyRejected {
                    host: host.to_string(),
                    port,
                    problem: HostKeyProblem::Changed { line },
                }
                .into());
            }
            Err(err) => {
                return Err(anyhow!(err)).with_context(|| {
                    format!("reading known hosts file {}", known_hosts.display())
                });
            }
        }
    }

    log::warn!(
        "host key for {host}:{port} is not in {} (tried {})",
        known_hosts.display(),
        candidates.join(", ")
    );
    Err(HostKeyRejected {
        host: host.to_string(),
        port,
        problem: HostKeyProblem::Unknown,
    }
    .into())
}

/// Replaces any known_hosts entries for `host:port` with `key`.
pub(super) fn remember_host_key(
    host: &str,
    port: u16,
    key: &PublicKey,
    known_hosts: &Path,
) -> anyhow::Result<String> {
    let stale: Vec<usize> = if known_hosts.exists() {
        known_host_keys_path(host, port, known_hosts)
            .with_context(|| format!("reading known hosts file {}", known_hosts.display()))?
            .into_iter()
            .map(|(line, _)| line)
            .collect()
    } else {
        Vec::new()
    };
    if !stale.is_empty() {
        let contents = std::fs::read_to_string(known_hosts)
            .with_context(|| format!("reading known hosts file {}", known_hosts.display()))?;
        let mut kept: String = contents
            .lines()
            .enumerate()
            .filter(|(idx, _)| !stale.contains(&(idx + 1)))
            .map(|(_, line)| format!("{line}\n"))
            .collect();
        if kept.trim().is_empty() {
            kept.clear();
        }
        std::fs::write(known_hosts, kept)
            .with_context(|| format!("rewriting known hosts file {}", known_hosts.display()))?;
        log::info!("removed {} stale host key entries for {host}:{port}", stale.len());
    }
    if let Some(parent) = known_hosts.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    learn_known_hosts_path(host, port, key, known_hosts)
        .with_context(|| format!("writing known hosts file {}", known_hosts.display()))?;
    Ok(format!("{} {}", key.algorithm(), key.fingerprint(HashAlg::Sha256)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::parse_public_key_base64;

    const KNOWN_KEY: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIJdD7y3aLq454yWBdwLWbieU1ebz9/cu7/QEXn9OIeZJ";
    const OTHER_KEY: &str = "AAAAC3NzaC1lZDI1NTE5AAAAILIG2T/B0l0gaqj3puu510tu9N1OkQ4znY3LYuEm5zCF";

    fn addr() -> SocketAddr {
        "192.0.2.10:22".parse().unwrap()
    }

    fn rejection(err: &anyhow::Error) -> Option<HostKeyProblem> {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<HostKeyRejected>())
            .map(|rejected| rejected.problem)
    }

    #[test]
    fn known_key_is_accepted() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("known_hosts");
        std::fs::write(&path, format!("hpc.example.org ssh-ed25519 {KNOWN_KEY}\n")).unwrap();
        let key = parse_public_key_base64(KNOWN_KEY).unwrap();

        verify_server_key("hpc.example.org", addr(), &key, &path).unwrap();
    }

    #[test]
    fn changed_key_is_rejected_with_line() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("known_hosts");
        std::fs::write(&path, format!("hpc.example.org ssh-ed25519 {KNOWN_KEY}\n")).unwrap();
        let key = parse_public_key_base64(OTHER_KEY).unwrap();

        let err = verify_server_key("hpc.example.org", addr(), &key, &path).unwrap_err();
        assert_eq!(rejection(&err), Some(HostKeyProblem::Changed { line: 1 }));
    }

    #[test]
    fn unknown_host_is_rejected_not_learned() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("known_hosts");
        std::fs::write(&path, format!("other.example.org ssh-ed25519 {KNOWN_KEY}\n")).unwrap();
        let key = parse_public_key_base64(KNOWN_KEY).unwrap();

        let err = verify_server_key("hpc.example.org", addr(), &key, &path).unwrap_err();
        assert_eq!(rejection(&err), Some(HostKeyProblem::Unknown));
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("hpc.example.org"));
    }

    #[test]
    fn remembering_replaces_the_stale_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("known_hosts");
        std::fs::write(
            &path,
            format!(
                "other.example.org ssh-ed25519 {OTHER_KEY}\nhpc.example.org ssh-ed25519 {KNOWN_KEY}\n"
            ),
        )
        .unwrap();
        let new_key = parse_public_key_base64(OTHER_KEY).unwrap();

        let fingerprint = remember_host_key("hpc.example.org", 22, &new_key, &path).unwrap();
        assert!(fingerprint.contains("SHA256:"));

        verify_server_key("hpc.example.org", addr(), &new_key, &path).unwrap();
        let old_key = parse_public_key_base64(KNOWN_KEY).unwrap();
        assert!(verify_server_key("hpc.example.org", addr(), &old_key, &path).is_err());
        verify_server_key("other.example.org", addr(), &new_key, &path).unwrap();
    }
}
