use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use pvc_backup_config::shared::{RemoteDestinationConfig, RemoteProtocol};
use secrecy::ExposeSecret;
use tokio::process::Command;
use tracing::{debug, info};

use crate::upload::{RemoteUploader, UploadError};

const SSH_OPTIONS: [&str; 4] = [
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
];

/// Password authenticated `scp` or `rsync` push.
///
/// Every program runs under `sshpass -e` and the password only ever travels
/// through the `SSHPASS` environment variable.
#[derive(Debug, Clone)]
pub struct SshUploader {
    config: RemoteDestinationConfig,
}

impl SshUploader {
    pub fn new(config: RemoteDestinationConfig) -> Self {
        Self { config }
    }

    fn login(&self) -> String {
        format!("{}@{}", self.config.username, self.config.host)
    }

    /// Arguments for `ssh` creating `directory` on the remote host.
    pub fn mkdir_args(&self, ssh: &Path, directory: &str) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![ssh.as_os_str().to_owned()];
        args.extend(SSH_OPTIONS.iter().map(OsString::from));
        if let Some(port) = self.config.port {
            args.push("-p".into());
            args.push(port.to_string().into());
        }
        args.push(self.login().into());
        args.push(format!("mkdir -p {}", shell_quote(directory)).into());

        args
    }

    /// Arguments for the program copying `local_path` to `remote_path`.
    pub fn transfer_args(&self, program: &Path, local_path: &Path, remote_path: &str) -> Vec<OsString> {
        let target = format!("{}:{remote_path}", self.login());
        let mut args: Vec<OsString> = vec![program.as_os_str().to_owned()];

        match self.config.protocol {
            RemoteProtocol::Scp => {
                args.extend(SSH_OPTIONS.iter().map(OsString::from));
                if let Some(port) = self.config.port {
                    args.push("-P".into());
                    args.push(port.to_string().into());
                }
            }
            RemoteProtocol::Rsync => {
                let mut remote_shell = format!("ssh {}", SSH_OPTIONS.join(" "));
                if let Some(port) = self.config.port {
                    remote_shell.push_str(&format!(" -p {port}"));
                }
                args.push("-az".into());
                args.push("-e".into());
                args.push(remote_shell.into());
            }
        }

        args.push(local_path.as_os_str().to_owned());
        args.push(target.into());

        args
    }

    async fn run_with_password(&self, sshpass: &Path, args: Vec<OsString>) -> Result<(), UploadError> {
        let program = args
            .first()
            .and_then(|program| Path::new(program).file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "sshpass".to_owned());

        debug!(program = %program, host = %self.config.host, "running remote command");

        let output = Command::new(sshpass)
            .arg("-e")
            .args(&args)
            .env("SSHPASS", self.config.password.expose_secret())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| UploadError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let message = [stderr.trim(), stdout.trim()]
                .into_iter()
                .find(|text| !text.is_empty())
                .unwrap_or("remote transfer command failed")
                .to_owned();
            return Err(UploadError::Failed { program, message });
        }

        Ok(())
    }

    async fn upload_inner(&self, local_path: &Path) -> Result<String, UploadError> {
        let archive_name = local_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| UploadError::InvalidPath(local_path.to_owned()))?;

        let sshpass = find_binary("sshpass")?;
        let ssh = find_binary("ssh")?;
        let program = find_binary(match self.config.protocol {
            RemoteProtocol::Scp => "scp",
            RemoteProtocol::Rsync => "rsync",
        })?;

        let directory = normalize_remote_directory(&self.config.directory);
        if directory != "/" {
            self.run_with_password(&sshpass, self.mkdir_args(&ssh, &directory))
                .await?;
        }

        let remote_path = remote_file_path(&directory, &archive_name);
        self.run_with_password(&sshpass, self.transfer_args(&program, local_path, &remote_path))
            .await?;

        let reference = remote_reference(
            self.config.protocol,
            &self.config.host,
            &directory,
            &archive_name,
        );
        info!(reference = %reference, "archive uploaded");

        Ok(reference)
    }
}

#[async_trait]
impl RemoteUploader for SshUploader {
    async fn upload(&self, local_path: &Path) -> Result<String, UploadError> {
        let timeout = self.config.timeout();
        match tokio::time::timeout(timeout, self.upload_inner(local_path)).await {
            Ok(result) => result,
            Err(_) => Err(UploadError::Timeout(timeout)),
        }
    }

    fn keep_local_copy(&self) -> bool {
        self.config.keep_local_copy
    }
}

fn find_binary(name: &str) -> Result<PathBuf, UploadError> {
    which::which(name).map_err(|_| UploadError::BinaryNotFound {
        binary: name.to_owned(),
    })
}

/// Collapses repeated slashes, makes the path absolute and drops a trailing
/// slash. An empty directory is the remote root.
pub fn normalize_remote_directory(directory: &str) -> String {
    let segments: Vec<&str> = directory
        .trim()
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();

    format!("/{}", segments.join("/"))
}

fn remote_file_path(directory: &str, archive_name: &str) -> String {
    match directory {
        "/" => format!("/{archive_name}"),
        directory => format!("{directory}/{archive_name}"),
    }
}

/// `<protocol>://<host><dir>/<file>`, with the root directory omitted.
pub fn remote_reference(
    protocol: RemoteProtocol,
    host: &str,
    directory: &str,
    archive_name: &str,
) -> String {
    let directory = if directory == "/" { "" } else { directory };
    format!("{protocol}://{host}{directory}/{archive_name}")
}

/// Single-quotes `value` for a POSIX shell.
fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-".contains(c))
    {
        return value.to_owned();
    }

    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use pvc_backup_config::ConfigSecret;

    use super::*;

    fn uploader(protocol: RemoteProtocol, port: Option<u16>) -> SshUploader {
        SshUploader::new(RemoteDestinationConfig {
            protocol,
            host: "backup.example.com".to_owned(),
            port,
            username: "ops".to_owned(),
            password: ConfigSecret::from("hunter2"),
            directory: "archives//daily/".to_owned(),
            keep_local_copy: false,
            timeout_secs: 60,
        })
    }

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_normalize_remote_directory() {
        assert_eq!(normalize_remote_directory("archives//daily/"), "/archives/daily");
        assert_eq!(normalize_remote_directory("/archives"), "/archives");
        assert_eq!(normalize_remote_directory("  "), "/");
        assert_eq!(normalize_remote_directory("///"), "/");
    }

    #[test]
    fn test_remote_reference_omits_root() {
        assert_eq!(
            remote_reference(RemoteProtocol::Scp, "host", "/archives/daily", "a.tar.gz"),
            "scp://host/archives/daily/a.tar.gz"
        );
        assert_eq!(
            remote_reference(RemoteProtocol::Rsync, "host", "/", "a.tar.gz"),
            "rsync://host/a.tar.gz"
        );
    }

    #[test]
    fn test_mkdir_args_quote_the_directory() {
        let uploader = uploader(RemoteProtocol::Scp, None);
        let args = strings(&uploader.mkdir_args(Path::new("/usr/bin/ssh"), "/archives/my dir"));

        assert_eq!(args[0], "/usr/bin/ssh");
        assert_eq!(args[5], "ops@backup.example.com");
        assert_eq!(args[6], "mkdir -p '/archives/my dir'");
    }

    #[test]
    fn test_scp_args_use_capital_port_flag() {
        let uploader = uploader(RemoteProtocol::Scp, Some(2222));
        let args = strings(&uploader.transfer_args(
            Path::new("/usr/bin/scp"),
            Path::new("/backups/a.tar.gz"),
            "/archives/daily/a.tar.gz",
        ));

        assert_eq!(
            args,
            [
                "/usr/bin/scp",
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-P",
                "2222",
                "/backups/a.tar.gz",
                "ops@backup.example.com:/archives/daily/a.tar.gz",
            ]
        );
    }

    #[test]
    fn test_rsync_args_carry_ssh_options_and_password_stays_out() {
        let uploader = uploader(RemoteProtocol::Rsync, Some(2222));
        let args = strings(&uploader.transfer_args(
            Path::new("/usr/bin/rsync"),
            Path::new("/backups/a.tar.gz"),
            "/archives/daily/a.tar.gz",
        ));

        assert_eq!(args[1], "-az");
        assert_eq!(args[2], "-e");
        assert_eq!(
            args[3],
            "ssh -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null -p 2222"
        );
        assert!(args.iter().all(|arg| !arg.contains("hunter2")));
    }
}
