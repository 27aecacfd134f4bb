// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::PathBuf;

use clap::{ArgGroup, ArgMatches, Args, CommandFactory, FromArgMatches, Parser, Subcommand};

use crate::app::types::{
    AuthMode, ConflictPolicy, ResourceRequest, SecretPurpose, SyncFilterAction, SyncFilterRule,
};
use crate::config::TransportKind;

pub mod commands;

#[derive(Parser, Debug)]
#[command(
    name = "dayhoff-bridge",
    version,
    about = "Run commands, track batch jobs and sync files on an HPC cluster",
    long_about = None,
    after_help = "Configuration precedence: defaults < config file < command-line flags.\n\
Config path precedence: defaults < DAYHOFF_CONFIG_PATH < --config.\n\
Secrets are looked up in DAYHOFF_HPC_PASSWORD / DAYHOFF_HPC_KEY_PASSPHRASE (optionally suffixed with _<HOST>) before the platform secret manager.\n\
Every command prints JSON on stdout; logs go to stderr."
)]
pub struct Opts {
    #[arg(
        short,
        long,
        global = true,
        value_name = "PATH",
        help = "Path to a TOML config file. When omitted, DAYHOFF_CONFIG_PATH is used if set, otherwise the default config file location if available."
    )]
    pub config: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "Path to the SQLite job registry. Overrides `database_path` from the config file."
    )]
    pub database_path: Option<PathBuf>,
    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::SetTrue,
        help = "Enable debug logging. Overrides `verbose` from the config file."
    )]
    pub verbose: bool,
    #[arg(long, global = true, value_name = "HOST", help = "Cluster login host. Overrides [hpc] host.")]
    pub host: Option<String>,
    #[arg(long, global = true, value_name = "PORT", help = "SSH port. Overrides [hpc] port.")]
    pub port: Option<u16>,
    #[arg(long = "user", global = true, value_name = "USER", help = "Cluster username. Overrides [hpc] username.")]
    pub username: Option<String>,
    #[arg(long, global = true, value_parser = parse_auth_mode, value_name = "key|password", help = "Authentication mode. Overrides [hpc] auth.")]
    pub auth: Option<AuthMode>,
    #[arg(long = "identity", global = true, value_name = "PATH", help = "Private key file for key authentication. Overrides [hpc] identity_path.")]
    pub identity_path: Option<PathBuf>,
    #[arg(long, global = true, value_parser = parse_transport, value_name = "ssh|local", help = "Transport to the cluster. Overrides [hpc] transport.")]
    pub transport: Option<TransportKind>,
    #[arg(long, global = true, value_name = "SECS", help = "Per-command timeout. Overrides `command_timeout_secs`.")]
    pub command_timeout_secs: Option<u64>,
    #[arg(long, global = true, value_name = "SECS", help = "Background poll interval for `watch`. Overrides `poll_interval_secs`.")]
    pub poll_interval_secs: Option<u64>,
    #[arg(long, global = true, value_name = "SECS", help = "SSH connect timeout. Overrides `connect_timeout_secs`.")]
    pub connect_timeout_secs: Option<u64>,
    #[arg(long, global = true, value_name = "N", help = "Failed polls tolerated before a job is reported unknown. Overrides `unknown_after_failures`.")]
    pub unknown_after_failures: Option<u32>,
    #[arg(long, global = true, value_name = "N", help = "Failed polls after which `watch` stops asking about a job. Overrides `give_up_after_failures`.")]
    pub give_up_after_failures: Option<u32>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Open (or reuse) the session to the configured cluster and report its state.
    Connect,
    /// Run a command in the session's working directory and capture its output.
    Run(RunArgs),
    /// Submit a batch job.
    Submit(SubmitArgs),
    /// Ask the scheduler for the current state of a job.
    Poll(HandleArgs),
    /// Cancel a job.
    Cancel(HandleArgs),
    /// List every job in the registry.
    Jobs,
    /// List the scheduler queue.
    Queue(QueueArgs),
    /// Poll tracked jobs in the foreground until interrupted.
    Watch,
    /// Copy a local file or directory tree to the cluster.
    Push(SyncArgs),
    /// Copy a remote file or directory tree from the cluster.
    Pull(SyncArgs),
    /// Report entries that differ between a local and a remote tree.
    Diff(DiffArgs),
    /// Manage stored credentials.
    #[command(subcommand)]
    Cred(CredCmd),
    /// Record the key the cluster currently presents in the known_hosts file.
    AcceptHostKey,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Run through the scheduler's interactive launcher instead of on the login node.
    #[arg(long)]
    pub interactive: bool,
    #[arg(long, value_name = "SECS")]
    pub timeout_secs: Option<u64>,
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

#[derive(Args, Debug)]
pub struct SubmitArgs {
    /// Resource request entry, e.g. `--resource time=01:00:00 --resource cores=4`.
    #[arg(short, long = "resource", value_name = "KEY=VALUE", value_parser = parse_resource, action = clap::ArgAction::Append)]
    pub resources: Vec<(String, String)>,
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

impl SubmitArgs {
    pub fn resource_request(&self) -> ResourceRequest {
        self.resources.iter().cloned().collect()
    }
}

#[derive(Args, Debug)]
pub struct HandleArgs {
    pub handle: String,
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("scope").args(["all", "job"])))]
pub struct QueueArgs {
    /// Show every user's jobs instead of only yours.
    #[arg(long)]
    pub all: bool,
    /// Show only this scheduler job id.
    #[arg(long, value_name = "ID")]
    pub job: Option<String>,
    /// Include pending count and wait statistics.
    #[arg(long)]
    pub waiting: bool,
}

#[derive(Args, Debug)]
pub struct FilterArgs {
    #[arg(
        long,
        value_name = "PATTERN",
        action = clap::ArgAction::Append,
        help = "Include paths matching this glob. Rules apply in the order given; the first match wins."
    )]
    pub include: Vec<String>,
    #[arg(
        long,
        value_name = "PATTERN",
        action = clap::ArgAction::Append,
        help = "Exclude paths matching this glob. A trailing '/' matches directories only; a leading '/' anchors at the root."
    )]
    pub exclude: Vec<String>,
}

#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Source path (local for push, remote for pull).
    pub source: String,
    /// Destination path (remote for push, local for pull).
    pub destination: String,
    #[arg(long, value_parser = parse_policy, default_value = "skip-if-newer", value_name = "overwrite|skip-if-newer|fail-on-conflict")]
    pub policy: ConflictPolicy,
    #[command(flatten)]
    pub filters: FilterArgs,
}

#[derive(Args, Debug)]
pub struct DiffArgs {
    pub local: PathBuf,
    pub remote: String,
    #[command(flatten)]
    pub filters: FilterArgs,
}

#[derive(Subcommand, Debug)]
pub enum CredCmd {
    /// Store a secret in the platform secret manager. The secret is read from stdin.
    Set(CredArgs),
    /// Report which source would supply the secret, without printing it.
    Status(CredArgs),
    /// Remove the stored secret.
    Forget(CredArgs),
}

#[derive(Args, Debug)]
pub struct CredArgs {
    /// Which secret; defaults to the one the configured auth mode needs.
    #[arg(long, value_parser = parse_purpose, value_name = "password|key-passphrase")]
    pub purpose: Option<SecretPurpose>,
}

pub struct ParsedOpts {
    pub opts: Opts,
    pub verbose_override: Option<bool>,
    /// Include/exclude rules in command-line order.
    pub sync_filters: Vec<SyncFilterRule>,
}

fn parse_auth_mode(raw: &str) -> Result<AuthMode, String> {
    raw.parse()
}

fn parse_policy(raw: &str) -> Result<ConflictPolicy, String> {
    raw.parse()
}

fn parse_transport(raw: &str) -> Result<TransportKind, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "ssh" => Ok(TransportKind::Ssh),
        "local" => Ok(TransportKind::Local),
        other => Err(format!("unknown transport: {other}")),
    }
}

fn parse_purpose(raw: &str) -> Result<SecretPurpose, String> {
    match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
        "password" => Ok(SecretPurpose::Password),
        "key-passphrase" | "passphrase" => Ok(SecretPurpose::KeyPassphrase),
        other => Err(format!("unknown secret purpose: {other}")),
    }
}

fn parse_resource(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty resource key in '{raw}'"));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

/// Rebuilds the interleaved order of `--include` / `--exclude`, which the derived struct
/// keeps in two separate lists.
pub fn sync_filters_from_matches(matches: &ArgMatches) -> Vec<SyncFilterRule> {
    let Some((_, sub_matches)) = matches
        .subcommand()
        .filter(|(name, _)| matches!(*name, "push" | "pull" | "diff"))
    else {
        return Vec::new();
    };

    let mut ordered: Vec<(usize, SyncFilterAction, String)> = Vec::new();
    let mut collect = |arg: &str, action: SyncFilterAction| {
        let values = sub_matches
            .get_many::<String>(arg)
            .into_iter()
            .flatten()
            .cloned();
        let indices = sub_matches.indices_of(arg).into_iter().flatten();
        ordered.extend(indices.zip(values).map(|(idx, pattern)| (idx, action, pattern)));
    };
    collect("include", SyncFilterAction::Include);
    collect("exclude", SyncFilterAction::Exclude);

    ordered.sort_by_key(|(idx, _, _)| *idx);
    ordered
        .into_iter()
        .map(|(_, action, pattern)| SyncFilterRule { action, pattern })
        .collect()
}

const HELP_TEMPLATE: &str = r#"{before-help}{about-with-newline}{usage-heading} {usage}

{all-args}{after-help}
"#;

fn apply_help_template_recursively(cmd: &mut clap::Command) {
    let mut owned = std::mem::take(cmd);
    owned = owned.help_template(HELP_TEMPLATE);
    for sub in owned.get_subcommands_mut() {
        apply_help_template_recursively(sub);
    }
    *cmd = owned;
}

pub fn cli_command() -> clap::Command {
    let mut cmd = Opts::command();
    apply_help_template_recursively(&mut cmd);
    cmd
}

fn parsed_from_matches(matches: &ArgMatches) -> Result<ParsedOpts, clap::Error> {
    let opts = Opts::from_arg_matches(matches)?;
    let verbose_override = opts.verbose.then_some(true);
    Ok(ParsedOpts {
        opts,
        verbose_override,
        sync_filters: sync_filters_from_matches(matches),
    })
}

pub fn parse_opts() -> ParsedOpts {
    let matches = cli_command().get_matches();
    parsed_from_matches(&matches).unwrap_or_else(|err| err.exit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ParsedOpts {
        let matches = cli_command()
            .try_get_matches_from(args.iter().copied())
            .unwrap();
        parsed_from_matches(&matches).unwrap()
    }

    #[test]
    fn sync_filters_preserve_flag_order() {
        let parsed = parse(&[
            "dayhoff-bridge",
            "push",
            "./project",
            "runs/project",
            "--include",
            "a",
            "--exclude",
            "b/",
            "--include",
            "c",
        ]);
        let rules: Vec<(SyncFilterAction, &str)> = parsed
            .sync_filters
            .iter()
            .map(|rule| (rule.action, rule.pattern.as_str()))
            .collect();
        assert_eq!(
            rules,
            vec![
                (SyncFilterAction::Include, "a"),
                (SyncFilterAction::Exclude, "b/"),
                (SyncFilterAction::Include, "c"),
            ]
        );
        let Command::Push(args) = parsed.opts.command else {
            panic!("expected push");
        };
        assert_eq!(args.policy, ConflictPolicy::SkipIfNewer);
    }

    #[test]
    fn submit_collects_resources_and_trailing_command() {
        let parsed = parse(&[
            "dayhoff-bridge",
            "--host",
            "login.example.org",
            "submit",
            "-r",
            "time=01:00:00",
            "--resource",
            "cores=4",
            "python",
            "train.py",
            "--epochs",
            "3",
        ]);
        assert_eq!(parsed.opts.host.as_deref(), Some("login.example.org"));
        let Command::Submit(args) = parsed.opts.command else {
            panic!("expected submit");
        };
        assert_eq!(args.command, vec!["python", "train.py", "--epochs", "3"]);
        let resources = args.resource_request();
        assert_eq!(resources.get("time").map(String::as_str), Some("01:00:00"));
        assert_eq!(resources.get("cores").map(String::as_str), Some("4"));
    }

    #[test]
    fn malformed_resource_is_a_usage_error() {
        let err = cli_command()
            .try_get_matches_from(["dayhoff-bridge", "submit", "-r", "cores", "true"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn queue_scopes_are_exclusive() {
        let err = cli_command()
            .try_get_matches_from(["dayhoff-bridge", "queue", "--all", "--job", "42"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn verbose_flag_becomes_override_and_cred_parses_purpose() {
        let parsed = parse(&["dayhoff-bridge", "-v", "cred", "status", "--purpose", "key_passphrase"]);
        assert_eq!(parsed.verbose_override, Some(true));
        let Command::Cred(CredCmd::Status(args)) = parsed.opts.command else {
            panic!("expected cred status");
        };
        assert_eq!(args.purpose, Some(SecretPurpose::KeyPassphrase));
        assert!(parsed.sync_filters.is_empty());
    }
}
