use chrono::{NaiveDate, SecondsFormat};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{Result, StationError};
use crate::model::{Identifier, StatusRecord};

/// 时序日志列
pub const HEADER: [&str; 11] = [
    "timestamp",
    "identifier",
    "sequence",
    "state",
    "kind",
    "error_count",
    "consecutive_errors",
    "lost_records",
    "error",
    "artifact",
    "attributes",
];

struct OpenLog {
    date: NaiveDate,
    part: u32,
    path: PathBuf,
    writer: csv::Writer<File>,
}

/// 按标识、按天（UTC）分文件的追加式 CSV 日志
///
/// 路径为 `{root}/{id}/{id}-{YYYY_MM_DD}.csv`，超过大小上限后续写
/// `{id}-{YYYY_MM_DD}-{n}.csv`。关闭的文件由调用方交给上传队列。
///
/// 已关闭或已归档的分片名不会再次使用，远端文件不会被覆盖。
pub struct TimeSeriesLog {
    root: PathBuf,
    /// 上传后归档的目录，布局为 `{archive}/{id}/`
    archive: Option<PathBuf>,
    max_bytes: u64,
    open: HashMap<Identifier, OpenLog>,
    /// 本次运行中关闭过的分片之后的第一个可用分片号
    next_part: HashMap<Identifier, (NaiveDate, u32)>,
}

impl TimeSeriesLog {
    pub fn new(root: impl AsRef<Path>, max_bytes: u64) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            archive: None,
            max_bytes: max_bytes.max(1),
            open: HashMap::new(),
            next_part: HashMap::new(),
        }
    }

    /// 选择分片时同时避开已归档的文件名
    pub fn with_archive(mut self, archive: impl AsRef<Path>) -> Self {
        self.archive = Some(archive.as_ref().to_path_buf());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 当前打开的文件
    pub fn current_path(&self, identifier: &str) -> Option<&Path> {
        self.open.get(identifier).map(|log| log.path.as_path())
    }

    /// 追加一行，返回因此关闭（日期切换或超过大小）的文件
    pub fn append(&mut self, record: &StatusRecord) -> Result<Vec<PathBuf>> {
        let identifier = &record.identifier;
        let date = record.timestamp.date_naive();
        let mut closed = Vec::new();

        let day_changed = self
            .open
            .get(identifier)
            .map_or(false, |log| log.date != date);
        if day_changed {
            closed.extend(self.close(identifier)?);
        }

        if !self.open.contains_key(identifier) {
            let log = self.open_log(identifier, date)?;
            self.open.insert(identifier.clone(), log);
        }

        let log = self
            .open
            .get_mut(identifier)
            .ok_or_else(|| StationError::persistence(format!("log for {identifier} not open")))?;

        if let Err(e) = write_row(&mut log.writer, record) {
            // 丢弃出错的写入器，下次重新打开
            self.open.remove(identifier);
            return Err(e);
        }

        // 行已经落盘，之后的失败不能让调用方重写这一行
        let full = match log.writer.get_ref().metadata() {
            Ok(meta) => meta.len() >= self.max_bytes,
            Err(e) => {
                warn!(identifier = %identifier, error = %e, "Cannot stat time-series log");
                false
            }
        };
        if full {
            match self.close(identifier) {
                Ok(path) => closed.extend(path),
                Err(e) => warn!(identifier = %identifier, error = %e, "Failed to close full time-series log"),
            }
        }

        Ok(closed)
    }

    /// 关闭日期早于 `today` 的日志
    pub fn rotate_stale(&mut self, today: NaiveDate) -> Result<Vec<PathBuf>> {
        let stale: Vec<Identifier> = self
            .open
            .iter()
            .filter(|(_, log)| log.date < today)
            .map(|(identifier, _)| identifier.clone())
            .collect();

        let mut closed = Vec::new();
        for identifier in stale {
            closed.extend(self.close(&identifier)?);
        }
        Ok(closed)
    }

    /// 扫描磁盘上已关闭但未打开的日志（例如重启前遗留的文件）
    ///
    /// 日期早于 `today` 的文件都已关闭；当天的文件中只有最新且未写满的分片会被续写。
    pub fn closed_files(&self, today: NaiveDate) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        if !self.root.exists() {
            return Ok(found);
        }

        for dir in std::fs::read_dir(&self.root)? {
            let dir = dir?;
            if !dir.file_type()?.is_dir() {
                continue;
            }
            let identifier = dir.file_name().to_string_lossy().to_string();
            let open = self.open.get(&identifier).map(|log| log.path.clone());
            let latest_today = self.highest_part(&dir.path(), &identifier, today)?;

            for file in std::fs::read_dir(dir.path())? {
                let path = file?.path();
                if open.as_ref() == Some(&path) {
                    continue;
                }
                let Some((date, part)) = parse_log_name(&identifier, &path) else {
                    continue;
                };
                let closed = if date < today {
                    true
                } else if date == today {
                    Some(part) != latest_today || self.is_full(&path)
                } else {
                    false
                };
                if closed {
                    found.push(path);
                }
            }
        }

        found.sort();
        Ok(found)
    }

    pub fn flush(&mut self) -> Result<()> {
        for log in self.open.values_mut() {
            log.writer.flush()?;
        }
        Ok(())
    }

    /// 先落盘再移出，落盘失败时日志保持打开
    fn close(&mut self, identifier: &str) -> Result<Option<PathBuf>> {
        let Some(log) = self.open.get_mut(identifier) else {
            return Ok(None);
        };
        log.writer.flush()?;

        let Some(log) = self.open.remove(identifier) else {
            return Ok(None);
        };
        self.next_part
            .insert(identifier.to_string(), (log.date, log.part + 1));
        info!(identifier = %identifier, path = ?log.path, "Closed time-series log");
        Ok(Some(log.path))
    }

    fn open_log(&mut self, identifier: &str, date: NaiveDate) -> Result<OpenLog> {
        let dir = self.root.join(identifier);
        std::fs::create_dir_all(&dir)?;

        let mut part = match self.next_part.get(identifier) {
            Some((day, part)) if *day == date => *part,
            _ => 0,
        };
        if let Some(archive) = &self.archive {
            if let Some(archived) = self.highest_part(&archive.join(identifier), identifier, date)? {
                part = part.max(archived + 1);
            }
        }
        // 重启后续写当天最新的分片
        if let Some(local) = self.highest_part(&dir, identifier, date)? {
            part = part.max(local);
        }

        let path = loop {
            let path = dir.join(file_name(identifier, date, part));
            if !self.is_full(&path) {
                break path;
            }
            part += 1;
        };

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let is_new = file.metadata()?.len() == 0;

        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if is_new {
            writer.write_record(HEADER)?;
            writer.flush()?;
        }

        debug!(identifier = %identifier, path = ?path, "Opened time-series log");
        Ok(OpenLog {
            date,
            part,
            path,
            writer,
        })
    }

    fn is_full(&self, path: &Path) -> bool {
        std::fs::metadata(path).map_or(false, |m| m.len() >= self.max_bytes)
    }

    /// `dir` 中该标识在 `date` 的最大分片号
    fn highest_part(&self, dir: &Path, identifier: &str, date: NaiveDate) -> Result<Option<u32>> {
        if !dir.is_dir() {
            return Ok(None);
        }
        let mut highest = None;
        for entry in std::fs::read_dir(dir)? {
            if let Some((day, part)) = parse_log_name(identifier, &entry?.path()) {
                if day == date && highest.map_or(true, |h| part > h) {
                    highest = Some(part);
                }
            }
        }
        Ok(highest)
    }
}

fn file_name(identifier: &str, date: NaiveDate, part: u32) -> String {
    let day = date.format("%Y_%m_%d");
    if part == 0 {
        format!("{identifier}-{day}.csv")
    } else {
        format!("{identifier}-{day}-{part}.csv")
    }
}

/// 从文件名解析日期和分片号
fn parse_log_name(identifier: &str, path: &Path) -> Option<(NaiveDate, u32)> {
    if path.extension().and_then(|e| e.to_str()) != Some("csv") {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let rest = stem.strip_prefix(identifier)?.strip_prefix('-')?;
    let date = NaiveDate::parse_from_str(rest.get(..10)?, "%Y_%m_%d").ok()?;
    let part = match rest.get(10..)? {
        "" => 0,
        suffix => suffix.strip_prefix('-')?.parse().ok()?,
    };
    Some((date, part))
}

fn write_row(writer: &mut csv::Writer<File>, record: &StatusRecord) -> Result<()> {
    let artifact = record
        .artifact
        .as_ref()
        .map(|a| a.path.display().to_string())
        .unwrap_or_default();
    let attributes = serde_json::to_string(&record.attributes)?;

    writer.write_record([
        record.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        record.identifier.clone(),
        record.sequence.to_string(),
        record.state.as_str().to_string(),
        record.kind.as_str().to_string(),
        record.error_count.to_string(),
        record.consecutive_errors.to_string(),
        record.lost_records.to_string(),
        record.error.clone().unwrap_or_default(),
        artifact,
        attributes,
    ])?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RecordKind, WorkerState};
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn record_at(identifier: &str, sequence: u64, day: u32, hour: u32) -> StatusRecord {
        let mut record = StatusRecord::new(identifier, WorkerState::Running, RecordKind::Observation)
            .with_sequence(sequence)
            .with_attribute("temperature", 21.5);
        record.timestamp = Utc.with_ymd_and_hms(2024, 6, day, hour, 0, 0).unwrap();
        record
    }

    fn read_rows(path: &Path) -> Vec<csv::StringRecord> {
        let mut reader = csv::Reader::from_path(path).unwrap();
        reader.records().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn test_rows_written_in_order_with_header() {
        let dir = tempdir().unwrap();
        let mut log = TimeSeriesLog::new(dir.path(), 1024 * 1024);

        for sequence in 1..=5 {
            assert!(log.append(&record_at("dht", sequence, 1, 10)).unwrap().is_empty());
        }

        let path = dir.path().join("dht").join("dht-2024_06_01.csv");
        assert_eq!(log.current_path("dht"), Some(path.as_path()));

        let mut reader = csv::Reader::from_path(&path).unwrap();
        assert_eq!(reader.headers().unwrap(), &csv::StringRecord::from(HEADER.to_vec()));

        let sequences: Vec<String> = read_rows(&path).iter().map(|r| r[2].to_string()).collect();
        assert_eq!(sequences, vec!["1", "2", "3", "4", "5"]);
        assert_eq!(&read_rows(&path)[0][10], r#"{"temperature":21.5}"#);
    }

    #[test]
    fn test_day_change_closes_previous_file() {
        let dir = tempdir().unwrap();
        let mut log = TimeSeriesLog::new(dir.path(), 1024 * 1024);

        log.append(&record_at("dht", 1, 1, 23)).unwrap();
        let closed = log.append(&record_at("dht", 2, 2, 0)).unwrap();

        assert_eq!(closed, vec![dir.path().join("dht").join("dht-2024_06_01.csv")]);
        assert!(dir.path().join("dht").join("dht-2024_06_02.csv").exists());
    }

    #[test]
    fn test_size_rotation_starts_new_part() {
        let dir = tempdir().unwrap();
        let mut log = TimeSeriesLog::new(dir.path(), 200);

        let mut closed = Vec::new();
        for sequence in 1..=6 {
            closed.extend(log.append(&record_at("cam", sequence, 3, 8)).unwrap());
        }

        assert!(!closed.is_empty());
        assert_eq!(closed[0], dir.path().join("cam").join("cam-2024_06_03.csv"));
        assert!(dir.path().join("cam").join("cam-2024_06_03-1.csv").exists());

        // 所有分片中的行按序号连续
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir.path().join("cam"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        files.sort();
        let total: usize = files.iter().map(|p| read_rows(p).len()).sum();
        assert_eq!(total, 6);
    }

    #[test]
    fn test_rotate_stale_and_scan() {
        let dir = tempdir().unwrap();
        let mut log = TimeSeriesLog::new(dir.path(), 1024 * 1024);
        log.append(&record_at("dht", 1, 1, 12)).unwrap();
        log.append(&record_at("cam", 1, 2, 12)).unwrap();

        let today = NaiveDate::from_ymd_opt(2024, 6, 2).unwrap();
        assert!(log.closed_files(today).unwrap().is_empty());

        let closed = log.rotate_stale(today).unwrap();
        assert_eq!(closed, vec![dir.path().join("dht").join("dht-2024_06_01.csv")]);
        assert!(log.current_path("cam").is_some());

        // 重启后仍能找到遗留文件
        let reopened = TimeSeriesLog::new(dir.path(), 1024 * 1024);
        assert_eq!(reopened.closed_files(today).unwrap(), closed);
    }

    #[test]
    fn test_reopen_appends_without_second_header() {
        let dir = tempdir().unwrap();
        {
            let mut log = TimeSeriesLog::new(dir.path(), 1024 * 1024);
            log.append(&record_at("dht", 1, 1, 10)).unwrap();
        }
        let mut log = TimeSeriesLog::new(dir.path(), 1024 * 1024);
        log.append(&record_at("dht", 2, 1, 11)).unwrap();

        let rows = read_rows(&dir.path().join("dht").join("dht-2024_06_01.csv"));
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_archived_part_name_is_not_reused() {
        let dir = tempdir().unwrap();
        let logs = dir.path().join("logs");
        let archive = dir.path().join("archive");

        let mut closed = Vec::new();
        {
            let mut log = TimeSeriesLog::new(&logs, 200).with_archive(&archive);
            for sequence in 1..=6 {
                closed.extend(log.append(&record_at("cam", sequence, 3, 8)).unwrap());
            }
        }
        assert!(!closed.is_empty());

        // 上传后归档全部关闭的分片
        std::fs::create_dir_all(archive.join("cam")).unwrap();
        for path in &closed {
            std::fs::rename(path, archive.join("cam").join(path.file_name().unwrap())).unwrap();
        }
        let archived: Vec<u64> = closed
            .iter()
            .map(|p| std::fs::metadata(archive.join("cam").join(p.file_name().unwrap())).unwrap().len())
            .collect();

        let mut log = TimeSeriesLog::new(&logs, 200).with_archive(&archive);
        for sequence in 7..=12 {
            log.append(&record_at("cam", sequence, 3, 9)).unwrap();
        }

        let current = log.current_path("cam").unwrap().to_path_buf();
        assert!(!closed.contains(&current));
        let names: Vec<_> = closed.iter().map(|p| p.file_name().unwrap()).collect();
        for entry in std::fs::read_dir(logs.join("cam")).unwrap() {
            assert!(!names.contains(&entry.unwrap().file_name().as_os_str()));
        }
        // 归档文件没有被改写
        for (path, len) in closed.iter().zip(archived) {
            let archived_path = archive.join("cam").join(path.file_name().unwrap());
            assert_eq!(std::fs::metadata(archived_path).unwrap().len(), len);
        }
    }

    #[test]
    fn test_closed_part_is_not_reopened_after_day_rotation() {
        let dir = tempdir().unwrap();
        let mut log = TimeSeriesLog::new(dir.path(), 1024 * 1024);
        log.append(&record_at("dht", 1, 1, 10)).unwrap();
        let closed = log.rotate_stale(NaiveDate::from_ymd_opt(2024, 6, 2).unwrap()).unwrap();
        assert_eq!(closed, vec![dir.path().join("dht").join("dht-2024_06_01.csv")]);

        // 迟到的同一天记录写入新分片
        log.append(&record_at("dht", 2, 1, 11)).unwrap();
        assert_eq!(
            log.current_path("dht"),
            Some(dir.path().join("dht").join("dht-2024_06_01-1.csv").as_path())
        );
        assert_eq!(read_rows(&closed[0]).len(), 1);
    }

    #[test]
    fn test_full_parts_of_today_found_after_restart() {
        let dir = tempdir().unwrap();
        {
            let mut log = TimeSeriesLog::new(dir.path(), 200);
            for sequence in 1..=6 {
                log.append(&record_at("cam", sequence, 3, 8)).unwrap();
            }
        }
        let today = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        let reopened = TimeSeriesLog::new(dir.path(), 200);
        let found = reopened.closed_files(today).unwrap();
        assert!(found.contains(&dir.path().join("cam").join("cam-2024_06_03.csv")));
        for path in &found {
            let (_, part) = parse_log_name("cam", path).unwrap();
            let latest = reopened.highest_part(&dir.path().join("cam"), "cam", today).unwrap().unwrap();
            assert!(part < latest || reopened.is_full(path));
        }
    }

    #[test]
    fn test_parse_log_name() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        assert_eq!(parse_log_name("cam", Path::new("cam-2024_06_03.csv")), Some((date, 0)));
        assert_eq!(parse_log_name("cam", Path::new("cam-2024_06_03-12.csv")), Some((date, 12)));
        assert_eq!(parse_log_name("cam", Path::new("cam-2-2024_06_03.csv")), None);
        assert_eq!(parse_log_name("cam", Path::new("cam-2024_06_03.json")), None);
    }
}
