//! 通过系统命令实现的远程传输
//!
//! `sftp` 目标使用 OpenSSH 客户端（`ssh`/`scp`，需预先配置密钥登录），
//! `ftp` 目标使用 `curl`。

use async_trait::async_trait;
use station_config::DestinationConfig;
use station_core::{TransferReceipt, Transport, TransportError};
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tracing::debug;

const CONNECT_TIMEOUT_SECS: u32 = 10;

/// OpenSSH 客户端以 255 退出表示连接层失败
const SSH_CONNECTION_FAILURE: i32 = 255;

pub fn connect_sftp(config: &DestinationConfig) -> Result<Box<dyn Transport>, TransportError> {
    Ok(Box::new(OpenSshTransport::from_config(config)?))
}

pub fn connect_ftp(config: &DestinationConfig) -> Result<Box<dyn Transport>, TransportError> {
    Ok(Box::new(CurlFtpTransport::from_config(config)?))
}

/// 对远端 shell 的单引号转义
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

fn remote_target(root: &Path, remote: &Path) -> Result<(String, String), TransportError> {
    let target = root.join(remote);
    let target = target
        .to_str()
        .ok_or_else(|| TransportError::transfer(format!("invalid remote path {}", remote.display())))?
        .to_string();
    let temp = format!("{target}.tmp");
    Ok((target, temp))
}

/// 经 SSH 上传，先写临时文件再在远端重命名
pub struct OpenSshTransport {
    destination: String,
    port: Option<u16>,
    root: PathBuf,
    connected: bool,
}

impl OpenSshTransport {
    pub fn from_config(config: &DestinationConfig) -> Result<Self, TransportError> {
        let host = config
            .host
            .as_deref()
            .ok_or_else(|| TransportError::connection(format!("destination {} has no host", config.name)))?;
        let destination = match &config.user {
            Some(user) => format!("{user}@{host}"),
            None => host.to_string(),
        };
        Ok(Self {
            destination,
            port: config.port,
            root: config.remote_dir.clone(),
            connected: false,
        })
    }

    fn ssh(&self, script: &str) -> Command {
        let mut command = Command::new("ssh");
        command
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={CONNECT_TIMEOUT_SECS}"));
        if let Some(port) = self.port {
            command.arg("-p").arg(port.to_string());
        }
        command.arg(&self.destination).arg(script).kill_on_drop(true);
        command
    }

    /// 运行命令；连接层失败时标记为断开
    async fn run(&mut self, mut command: Command, what: &str) -> Result<Output, TransportError> {
        let output = command
            .output()
            .await
            .map_err(|e| TransportError::connection(format!("{what}: {e}")))?;
        if output.status.success() {
            return Ok(output);
        }

        let message = format!("{what} failed: {}", stderr_of(&output));
        if output.status.code() == Some(SSH_CONNECTION_FAILURE) {
            self.connected = false;
            return Err(TransportError::connection(message));
        }
        Err(TransportError::transfer(message))
    }
}

#[async_trait]
impl Transport for OpenSshTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let root = self
            .root
            .to_str()
            .ok_or_else(|| TransportError::connection("remote_dir is not valid UTF-8"))?;
        let command = self.ssh(&format!("mkdir -p {}", quote(root)));
        self.run(command, "ssh")
            .await
            .map_err(|e| TransportError::connection(e.to_string()))?;

        debug!(destination = %self.destination, "SSH destination reachable");
        self.connected = true;
        Ok(())
    }

    async fn send(&mut self, local: &Path, remote: &Path) -> Result<TransferReceipt, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let (target, temp) = remote_target(&self.root, remote)?;
        let parent = Path::new(&target)
            .parent()
            .and_then(|p| p.to_str())
            .unwrap_or(".")
            .to_string();

        let mkdir = self.ssh(&format!("mkdir -p {}", quote(&parent)));
        self.run(mkdir, "mkdir").await?;

        let mut scp = Command::new("scp");
        scp.arg("-q")
            .arg("-B")
            .arg("-o")
            .arg(format!("ConnectTimeout={CONNECT_TIMEOUT_SECS}"));
        if let Some(port) = self.port {
            scp.arg("-P").arg(port.to_string());
        }
        scp.arg(local)
            .arg(format!("{}:{}", self.destination, quote(&temp)))
            .kill_on_drop(true);
        self.run(scp, "scp").await?;

        // 重命名后回报远端大小和校验和
        let finish = self.ssh(&format!(
            "mv {temp} {target} && stat -c %s {target} && sha256sum {target}",
            temp = quote(&temp),
            target = quote(&target)
        ));
        let output = self.run(finish, "rename").await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut lines = stdout.lines();

        let bytes = lines
            .next()
            .and_then(|l| l.trim().parse::<u64>().ok())
            .ok_or_else(|| TransportError::transfer(format!("unexpected stat output: {stdout}")))?;
        let sha256 = lines
            .next()
            .and_then(|l| l.split_whitespace().next())
            .map(str::to_string);

        Ok(TransferReceipt {
            remote_path: PathBuf::from(target),
            bytes,
            sha256,
        })
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn kind(&self) -> &'static str {
        "sftp"
    }
}

/// 经 `curl` 上传到 FTP 服务器
pub struct CurlFtpTransport {
    server_url: String,
    base_url: String,
    credentials: Option<String>,
    connected: bool,
}

impl CurlFtpTransport {
    pub fn from_config(config: &DestinationConfig) -> Result<Self, TransportError> {
        let host = config
            .host
            .as_deref()
            .ok_or_else(|| TransportError::connection(format!("destination {} has no host", config.name)))?;
        let port = config.port.map(|p| format!(":{p}")).unwrap_or_default();
        let root = config.remote_dir.to_string_lossy();
        let root = root.trim_matches('/');
        let server_url = format!("ftp://{host}{port}");
        let base_url = if root.is_empty() {
            server_url.clone()
        } else {
            format!("{server_url}/{root}")
        };
        let credentials = config.user.as_ref().map(|user| {
            format!("{user}:{}", config.password.as_deref().unwrap_or_default())
        });

        Ok(Self {
            server_url,
            base_url,
            credentials,
            connected: false,
        })
    }

    fn curl(&self) -> Command {
        let mut command = Command::new("curl");
        command
            .arg("--silent")
            .arg("--show-error")
            .arg("--connect-timeout")
            .arg(CONNECT_TIMEOUT_SECS.to_string());
        if let Some(credentials) = &self.credentials {
            command.arg("--user").arg(credentials);
        }
        command.kill_on_drop(true);
        command
    }
}

/// curl 的连接类退出码：无法解析主机、无法连接、登录失败、超时
fn is_curl_connection_failure(code: Option<i32>) -> bool {
    matches!(code, Some(6) | Some(7) | Some(28) | Some(67))
}

#[async_trait]
impl Transport for CurlFtpTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let output = self
            .curl()
            .arg("--list-only")
            .arg(format!("{}/", self.server_url))
            .output()
            .await
            .map_err(|e| TransportError::connection(format!("curl: {e}")))?;
        if !output.status.success() {
            return Err(TransportError::connection(stderr_of(&output)));
        }
        self.connected = true;
        Ok(())
    }

    async fn send(&mut self, local: &Path, remote: &Path) -> Result<TransferReceipt, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let remote = remote
            .to_str()
            .ok_or_else(|| TransportError::transfer(format!("invalid remote path {}", remote.display())))?;
        let url = format!("{}/{remote}", self.base_url);

        let output = self
            .curl()
            .arg("--ftp-create-dirs")
            .arg("--upload-file")
            .arg(local)
            .arg("--write-out")
            .arg("%{size_upload}")
            .arg(&url)
            .output()
            .await
            .map_err(|e| TransportError::connection(format!("curl: {e}")))?;

        if !output.status.success() {
            let message = format!("curl upload failed: {}", stderr_of(&output));
            if is_curl_connection_failure(output.status.code()) {
                self.connected = false;
                return Err(TransportError::connection(message));
            }
            return Err(TransportError::transfer(message));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let bytes = stdout
            .trim()
            .parse::<f64>()
            .map(|b| b as u64)
            .map_err(|_| TransportError::transfer(format!("unexpected curl output: {stdout}")))?;

        Ok(TransferReceipt {
            remote_path: PathBuf::from(url),
            bytes,
            sha256: None,
        })
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn kind(&self) -> &'static str {
        "ftp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use station_config::DestinationKind;

    fn destination(kind: DestinationKind) -> DestinationConfig {
        DestinationConfig {
            kind,
            host: Some("archive.example.org".to_string()),
            port: Some(2121),
            user: Some("station".to_string()),
            password: Some("secret".to_string()),
            ..DestinationConfig::local("archive", "/incoming/")
        }
    }

    #[test]
    fn test_quote_escapes_single_quotes() {
        assert_eq!(quote("/srv/it's here"), r"'/srv/it'\''s here'");
    }

    #[test]
    fn test_remote_target_uses_temp_suffix() {
        let (target, temp) = remote_target(Path::new("/incoming"), Path::new("cam-A/a.jpg")).unwrap();
        assert_eq!(target, "/incoming/cam-A/a.jpg");
        assert_eq!(temp, "/incoming/cam-A/a.jpg.tmp");
    }

    #[test]
    fn test_ftp_url_and_credentials() {
        let transport = CurlFtpTransport::from_config(&destination(DestinationKind::Ftp)).unwrap();
        assert_eq!(transport.base_url, "ftp://archive.example.org:2121/incoming");
        assert_eq!(transport.credentials.as_deref(), Some("station:secret"));
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_ssh_destination_requires_host() {
        let mut config = destination(DestinationKind::Sftp);
        let transport = OpenSshTransport::from_config(&config).unwrap();
        assert_eq!(transport.destination, "station@archive.example.org");

        config.host = None;
        assert!(matches!(
            OpenSshTransport::from_config(&config),
            Err(TransportError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let mut transport = OpenSshTransport::from_config(&destination(DestinationKind::Sftp)).unwrap();
        let err = transport
            .send(Path::new("/tmp/a.jpg"), Path::new("cam-A/a.jpg"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[test]
    fn test_curl_connection_codes() {
        assert!(is_curl_connection_failure(Some(7)));
        assert!(!is_curl_connection_failure(Some(25)));
        assert!(!is_curl_connection_failure(None));
    }
}
