//! Command lines for `plink`, `ssh` and `sshpass -e ssh`.

use crate::error::{Result, SshError};
use crate::process::CommandLine;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use tunneldeck_core::config::ClientKind;
use tunneldeck_core::variables::{split_args, BuiltinValues, VariableResolver};
use tunneldeck_core::{
    split_host_port, CredentialStore, PortForward, TunnelConfig, VariableSet, DEFAULT_SSH_PORT,
    PLINK_EXECUTABLE, SSHPASS_EXECUTABLE, SSH_EXECUTABLE,
};

static PLINK_RELEASE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Release (\d+)\.(\d+)").expect("valid plink version pattern"));

/// Environment variable `sshpass -e` reads the password from.
pub const SSHPASS_ENV: &str = "SSHPASS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ClientVersion {
    pub major: u32,
    pub minor: u32,
}

impl ClientVersion {
    /// plink 0.82 changed prompt and charset handling on piped stdio.
    pub fn needs_legacy_flags(self) -> bool {
        self >= ClientVersion { major: 0, minor: 82 }
    }
}

pub fn parse_plink_version(output: &str) -> Option<ClientVersion> {
    let caps = PLINK_RELEASE.captures(output)?;
    Some(ClientVersion {
        major: caps[1].parse().ok()?,
        minor: caps[2].parse().ok()?,
    })
}

/// `<plink> --version`, run once before the first plink spawn.
pub fn version_check(variables: &VariableSet) -> CommandLine {
    let mut cmd = CommandLine::new(executable_path(variables, PLINK_EXECUTABLE));
    cmd.arg("--version");
    cmd
}

fn executable_path(variables: &VariableSet, name: &str) -> String {
    variables
        .executable(name)
        .map(|v| v.value.clone())
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| name.to_string())
}

/// A tunnel definition with every template expanded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedTunnel {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub key_file: String,
    pub key_passphrase: String,
    pub local_ip: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub protocol: u8,
    pub compression: bool,
    pub extra_args: Vec<String>,
    /// Primary forward first, then the enabled extra forwards.
    pub forwards: Vec<PortForward>,
}

impl ResolvedTunnel {
    /// Expand every templated field of `config`.
    pub fn resolve(
        config: &TunnelConfig,
        variables: &VariableSet,
        credentials: &dyn CredentialStore,
        app_dir: &Path,
        data_dir: &Path,
    ) -> Result<Self> {
        let resolver = VariableResolver::new()
            .with_builtins(BuiltinValues::for_tunnel(config, app_dir, data_dir))
            .with_credentials(credentials)
            .with_variables(variables);

        let (host, port) = split_host_port(&resolver.resolve(config.selected_ssh_host())?);
        let host = host.trim().to_string();
        if host.is_empty() {
            return Err(SshError::EmptyHost(config.name.clone()));
        }

        let local_ip = resolver.resolve(&config.local_ip)?.trim().to_string();
        let remote_host = resolver.resolve(config.selected_remote_host())?.trim().to_string();

        let mut forwards = Vec::new();
        if config.local_port != 0 {
            let mut primary = PortForward::new_local(config.local_port, &remote_host, config.remote_port);
            primary.local_ip = local_ip.clone();
            forwards.push(primary);
        }
        for forward in config.port_forwards.iter().filter(|f| f.enabled) {
            let mut forward = forward.clone();
            forward.local_ip = resolver.resolve(&forward.local_ip)?.trim().to_string();
            forward.destination_host = resolver.resolve(&forward.destination_host)?.trim().to_string();
            forwards.push(forward);
        }

        Ok(Self {
            host,
            port: port.unwrap_or(DEFAULT_SSH_PORT),
            username: resolver.resolve(&config.username)?.trim().to_string(),
            password: resolver.resolve_secret(&config.password)?,
            key_file: resolver.resolve(&config.key_file)?.trim().to_string(),
            key_passphrase: resolver.resolve_secret(&config.key_passphrase)?,
            local_ip,
            local_port: config.local_port,
            remote_host,
            remote_port: config.remote_port,
            protocol: config.ssh_protocol,
            compression: config.compression,
            extra_args: resolver.resolve_args(&config.extra_args)?,
            forwards,
        })
    }

    fn binds_non_loopback(&self) -> bool {
        self.forwards.iter().any(|f| f.binds_non_loopback())
    }
}

/// Build the argument vector for `client`.
///
/// `plink_version` only matters for plink; `None` means unknown and is
/// treated as older than 0.82.
pub fn build_command(
    client: ClientKind,
    tunnel: &ResolvedTunnel,
    variables: &VariableSet,
    plink_version: Option<ClientVersion>,
) -> Result<CommandLine> {
    let (exe_name, mut cmd) = match client {
        ClientKind::Plink => (PLINK_EXECUTABLE, CommandLine::new(executable_path(variables, PLINK_EXECUTABLE))),
        ClientKind::OpenSsh => (SSH_EXECUTABLE, CommandLine::new(executable_path(variables, SSH_EXECUTABLE))),
        ClientKind::SshPass => {
            let mut cmd = CommandLine::new(executable_path(variables, SSHPASS_EXECUTABLE));
            cmd.arg("-e").arg(executable_path(variables, SSH_EXECUTABLE));
            cmd.env(SSHPASS_ENV, tunnel.password.clone());
            (SSH_EXECUTABLE, cmd)
        }
    };
    if let Some(exe) = variables.executable(exe_name) {
        cmd.args(split_args(&exe.arguments)?);
    }

    cmd.arg("-v");
    let port_flag = match client {
        ClientKind::Plink => {
            if plink_version.is_some_and(ClientVersion::needs_legacy_flags) {
                cmd.args(["-legacy-stdio-prompts", "-legacy-charset-handling"]);
            }
            "-P"
        }
        ClientKind::OpenSsh | ClientKind::SshPass => "-p",
    };

    cmd.arg(tunnel.host.clone());
    cmd.arg(port_flag).arg(tunnel.port.to_string());
    if !tunnel.username.is_empty() {
        cmd.arg("-l").arg(tunnel.username.clone());
    }
    if tunnel.compression {
        cmd.arg("-C");
    }
    match tunnel.protocol {
        1 => cmd.arg("-1"),
        _ => cmd.arg("-2"),
    };
    if client != ClientKind::Plink && tunnel.binds_non_loopback() {
        cmd.arg("-g");
    }
    for forward in &tunnel.forwards {
        cmd.arg(forward.flag()).arg(forward.cli_spec());
    }
    if !tunnel.key_file.is_empty() {
        cmd.arg("-i").arg(tunnel.key_file.clone());
    }
    cmd.args(tunnel.extra_args.iter().cloned());
    Ok(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tunneldeck_core::{MemoryCredentialStore, PasswordEntry, Variable};

    fn resolve(config: &TunnelConfig, variables: &VariableSet, creds: &MemoryCredentialStore) -> Result<ResolvedTunnel> {
        ResolvedTunnel::resolve(
            config,
            variables,
            creds,
            &PathBuf::from("/opt/td"),
            &PathBuf::from("/home/u/.local/share/td"),
        )
    }

    fn sample() -> TunnelConfig {
        let mut cfg = TunnelConfig::new_tunnel("db", "gw.example.com:2222", 5432);
        cfg.local_port = 50001;
        cfg.remote_hosts = vec!["db.internal".to_string()];
        cfg.username = "deploy".to_string();
        cfg
    }

    #[test]
    fn test_version_parsing() {
        let v = parse_plink_version("plink: Release 0.83\nBuild platform: 64-bit").unwrap();
        assert_eq!(v, ClientVersion { major: 0, minor: 83 });
        assert!(v.needs_legacy_flags());
        assert!(!parse_plink_version("plink: Release 0.81").unwrap().needs_legacy_flags());
        assert_eq!(parse_plink_version("plink: Development snapshot"), None);
    }

    #[test]
    fn test_plink_command() {
        let variables = VariableSet::with_default_executables();
        let creds = MemoryCredentialStore::default();
        let mut cfg = sample();
        cfg.compression = true;
        cfg.key_file = "${APP_DIR}/keys/db.ppk".to_string();
        cfg.extra_args = "-batch \"-sshlog x y.log\"".to_string();
        let tunnel = resolve(&cfg, &variables, &creds).unwrap();
        assert_eq!(tunnel.host, "gw.example.com");
        assert_eq!(tunnel.port, 2222);

        let cmd = build_command(ClientKind::Plink, &tunnel, &variables, Some(ClientVersion { major: 0, minor: 82 })).unwrap();
        assert!(cmd.program.starts_with("plink"));
        assert_eq!(
            cmd.args,
            vec![
                "-v",
                "-legacy-stdio-prompts",
                "-legacy-charset-handling",
                "gw.example.com",
                "-P",
                "2222",
                "-l",
                "deploy",
                "-C",
                "-2",
                "-L",
                "50001:db.internal:5432",
                "-i",
                "/opt/td/keys/db.ppk",
                "-batch",
                "-sshlog x y.log",
            ]
        );

        let old = build_command(ClientKind::Plink, &tunnel, &variables, None).unwrap();
        assert!(!old.args.iter().any(|a| a.starts_with("-legacy")));
    }

    #[test]
    fn test_ssh_gateway_flag() {
        let variables = VariableSet::with_default_executables();
        let creds = MemoryCredentialStore::default();
        let mut cfg = sample();
        cfg.port_forwards.push(PortForward::new_dynamic(1080));
        let tunnel = resolve(&cfg, &variables, &creds).unwrap();
        let cmd = build_command(ClientKind::OpenSsh, &tunnel, &variables, None).unwrap();
        assert!(cmd.args.contains(&"-p".to_string()));
        assert!(!cmd.args.contains(&"-g".to_string()));
        assert!(cmd.args.windows(2).any(|w| w == ["-D", "1080"]));

        cfg.local_ip = "0.0.0.0".to_string();
        let tunnel = resolve(&cfg, &variables, &creds).unwrap();
        let cmd = build_command(ClientKind::OpenSsh, &tunnel, &variables, None).unwrap();
        assert!(cmd.args.contains(&"-g".to_string()));
        assert!(cmd.args.contains(&"0.0.0.0:50001:db.internal:5432".to_string()));
    }

    #[test]
    fn test_sshpass_uses_environment() {
        let mut variables = VariableSet::with_default_executables();
        variables.upsert(Variable::executable(SSH_EXECUTABLE, "/usr/bin/ssh", "-o StrictHostKeyChecking=no"));
        let creds = MemoryCredentialStore::new(vec![PasswordEntry::new("prod", "deploy", "s3cr$t")]);
        let mut cfg = sample();
        cfg.password = "${prod}".to_string();
        let tunnel = resolve(&cfg, &variables, &creds).unwrap();
        assert_eq!(tunnel.password, "s3cr$t");

        let cmd = build_command(ClientKind::SshPass, &tunnel, &variables, None).unwrap();
        assert_eq!(cmd.program, "sshpass");
        assert_eq!(&cmd.args[..4], ["-e", "/usr/bin/ssh", "-o", "StrictHostKeyChecking=no"]);
        assert!(!cmd.args.iter().any(|a| a.contains("s3cr")));
        assert_eq!(cmd.env, vec![(SSHPASS_ENV.to_string(), "s3cr$t".to_string())]);
    }

    #[test]
    fn test_empty_host_is_config_error() {
        let variables = VariableSet::with_default_executables();
        let creds = MemoryCredentialStore::default();
        let mut cfg = sample();
        cfg.ssh_hosts = vec!["${EMPTY}".to_string()];
        let mut vars = variables.clone();
        vars.upsert(Variable::user_defined("EMPTY", "  "));
        let err = resolve(&cfg, &vars, &creds).unwrap_err();
        assert!(matches!(err, SshError::EmptyHost(_)));
        assert!(err.is_config_error());
    }
}
