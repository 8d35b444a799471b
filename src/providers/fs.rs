use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::{HistoryStore, InstanceRecord, InstanceStatus, ProviderError, check_next_id, now_ms};
use crate::Event;

/// Bytes read from the end of a history file when looking for the last event.
const TAIL_WINDOW: u64 = 4096;

/// Filesystem-backed store: one JSONL history file and one JSON instance
/// record per instance under a root directory.
///
/// Writes within one process are serialized through a shared lock; the store
/// does not coordinate between processes.
#[derive(Clone)]
pub struct FsHistoryStore {
    root: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl FsHistoryStore {
    /// Create a store rooted at `root`. With `reset_on_create` any existing
    /// data under the root is deleted first.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        let path = root.as_ref().to_path_buf();
        if reset_on_create {
            let _ = std::fs::remove_dir_all(&path);
        }
        // best-effort create; write paths report real failures
        let _ = std::fs::create_dir_all(&path);
        Self {
            root: path,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn history_path(&self, instance: &str) -> PathBuf {
        self.root.join(format!("{}.history.jsonl", encode_file_name(instance)))
    }

    fn record_path(&self, instance: &str) -> PathBuf {
        self.root.join(format!("{}.instance.json", encode_file_name(instance)))
    }

    async fn read_record(&self, instance: &str) -> Result<Option<InstanceRecord>, ProviderError> {
        let path = self.record_path(instance);
        match fs::read_to_string(&path).await {
            Ok(data) => Ok(Some(serde_json::from_str(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProviderError::storage("get_instance", e)),
        }
    }

    // Write-then-rename so readers never observe a half-written record.
    async fn write_record(&self, record: &InstanceRecord) -> Result<(), ProviderError> {
        let path = self.record_path(&record.instance_id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(record)?;
        fs::write(&tmp, body)
            .await
            .map_err(|e| ProviderError::storage("write_instance", e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| ProviderError::storage("write_instance", e))
    }

    async fn store_status(
        &self,
        mut rec: InstanceRecord,
        status: InstanceStatus,
        output: Option<String>,
    ) -> Result<InstanceRecord, ProviderError> {
        rec.status = status;
        rec.output = output;
        rec.updated_at_ms = now_ms().max(rec.updated_at_ms);
        self.write_record(&rec).await?;
        Ok(rec)
    }

    async fn read_history(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let data = match fs::read_to_string(self.history_path(instance)).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProviderError::InstanceNotFound(instance.to_string()));
            }
            Err(e) => return Err(ProviderError::storage("read", e)),
        };
        parse_history(&data)
    }
}

/// Parse JSONL history. A trailing line without a newline is a torn write
/// from a crash and is ignored if it does not parse.
fn parse_history(data: &str) -> Result<Vec<Event>, ProviderError> {
    let complete = data.ends_with('\n');
    let lines: Vec<&str> = data.lines().collect();
    let mut out = Vec::with_capacity(lines.len());
    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(line) {
            Ok(ev) => out.push(ev),
            Err(_) if !complete && idx + 1 == lines.len() => {
                tracing::warn!(line = idx + 1, "ignoring torn trailing history line");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(out)
}

/// Find the id of the last complete event by reading backwards from the end
/// of the file. A torn trailing line is cut off so the next append starts on
/// a fresh line.
async fn repair_tail(instance: &str, file: &mut fs::File) -> Result<u64, ProviderError> {
    let io = |e: std::io::Error| ProviderError::storage("append", e);
    let mut len = file.metadata().await.map_err(io)?.len();
    let mut window = TAIL_WINDOW.min(len);
    loop {
        let start = len - window;
        let mut buf = vec![0u8; window as usize];
        file.seek(SeekFrom::Start(start)).await.map_err(io)?;
        file.read_exact(&mut buf).await.map_err(io)?;

        let complete_end = match buf.iter().rposition(|b| *b == b'\n') {
            Some(pos) => pos + 1,
            None if start > 0 => {
                window = (window * 2).min(len);
                continue;
            }
            None => 0,
        };
        if complete_end < buf.len() {
            let keep = start + complete_end as u64;
            tracing::warn!(instance_id = %instance, dropped_bytes = len - keep, "truncating torn trailing history line");
            file.set_len(keep).await.map_err(io)?;
            len = keep;
            window = window.min(len);
            continue;
        }

        let body = &buf[..complete_end.saturating_sub(1)];
        let line = match body.iter().rposition(|b| *b == b'\n') {
            Some(pos) => &body[pos + 1..],
            None if start > 0 => {
                window = (window * 2).min(len);
                continue;
            }
            None => body,
        };
        if line.iter().all(u8::is_ascii_whitespace) {
            if complete_end == 0 {
                return Ok(0);
            }
            return Err(ProviderError::Serialization(format!(
                "blank trailing line in history of '{instance}'"
            )));
        }
        let event: Event = serde_json::from_slice(line)?;
        return Ok(event.event_id());
    }
}

fn encode_file_name(instance: &str) -> String {
    let mut out = String::with_capacity(instance.len());
    for b in instance.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

#[async_trait::async_trait]
impl HistoryStore for FsHistoryStore {
    async fn create_instance(&self, record: InstanceRecord) -> Result<(), ProviderError> {
        let _g = self.write_lock.lock().await;
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| ProviderError::storage("create_instance", e))?;
        if fs::try_exists(self.record_path(&record.instance_id))
            .await
            .map_err(|e| ProviderError::storage("create_instance", e))?
        {
            return Err(ProviderError::InstanceExists(record.instance_id));
        }
        fs::write(self.history_path(&record.instance_id), b"")
            .await
            .map_err(|e| ProviderError::storage("create_instance", e))?;
        self.write_record(&record).await
    }

    async fn get_instance(&self, instance: &str) -> Result<Option<InstanceRecord>, ProviderError> {
        self.read_record(instance).await
    }

    async fn update_instance(
        &self,
        instance: &str,
        status: InstanceStatus,
        output: Option<String>,
    ) -> Result<InstanceRecord, ProviderError> {
        let _g = self.write_lock.lock().await;
        let rec = self
            .read_record(instance)
            .await?
            .ok_or_else(|| ProviderError::InstanceNotFound(instance.to_string()))?;
        self.store_status(rec, status, output).await
    }

    async fn update_instance_if(
        &self,
        instance: &str,
        expected: InstanceStatus,
        status: InstanceStatus,
        output: Option<String>,
    ) -> Result<Option<InstanceRecord>, ProviderError> {
        let _g = self.write_lock.lock().await;
        let rec = self
            .read_record(instance)
            .await?
            .ok_or_else(|| ProviderError::InstanceNotFound(instance.to_string()))?;
        if rec.status != expected {
            return Ok(None);
        }
        self.store_status(rec, status, output).await.map(Some)
    }

    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, ProviderError> {
        let mut out = Vec::new();
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(ProviderError::storage("list_instances", e)),
        };
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| ProviderError::storage("list_instances", e))?
        {
            let name = entry.file_name();
            if !name.to_string_lossy().ends_with(".instance.json") {
                continue;
            }
            let data = fs::read_to_string(entry.path())
                .await
                .map_err(|e| ProviderError::storage("list_instances", e))?;
            out.push(serde_json::from_str::<InstanceRecord>(&data)?);
        }
        out.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(out)
    }

    async fn append(&self, instance: &str, event: Event) -> Result<(), ProviderError> {
        let _g = self.write_lock.lock().await;
        let mut file = match fs::OpenOptions::new()
            .read(true)
            .append(true)
            .open(self.history_path(instance))
            .await
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProviderError::InstanceNotFound(instance.to_string()));
            }
            Err(e) => return Err(ProviderError::storage("append", e)),
        };
        let last = repair_tail(instance, &mut file).await?;
        check_next_id(instance, last, &event)?;

        let mut line = serde_json::to_string(&event)?;
        line.push('\n');
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| ProviderError::storage("append", e))?;
        file.flush().await.map_err(|e| ProviderError::storage("append", e))?;
        Ok(())
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        self.read_history(instance).await
    }
}
