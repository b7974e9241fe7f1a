use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 上传目标类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    Sftp,
    Ftp,
    /// 本地文件系统复制（挂载的外部存储等）
    Local,
}

/// 上传目标配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DestinationConfig {
    pub name: String,

    pub kind: DestinationKind,

    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// 远端根目录；本地复制时为目标目录
    #[serde(default)]
    pub remote_dir: PathBuf,

    /// 主目标无法连接时改用的目标
    #[serde(default)]
    pub fallback: Option<String>,
}

impl DestinationConfig {
    pub fn local(name: impl Into<String>, remote_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::Local,
            host: None,
            port: None,
            user: None,
            password: None,
            remote_dir: remote_dir.into(),
            fallback: None,
        }
    }
}
