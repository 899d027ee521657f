use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{HistoryStore, ParentLink, started_event, without_duplicates};
use crate::Event;

/// Events allowed in one execution before appends are refused.
const DEFAULT_CAP: usize = 4096;

const EXECUTION_SUFFIX: &str = ".jsonl";

/// Durable store for payroll workers: `<root>/<instance>/<execution>.jsonl`,
/// one serialized `Event` per line. A worker restarted over the same root
/// resumes every run left open.
#[derive(Clone)]
pub struct FsHistoryStore {
    root: PathBuf,
    cap: usize,
}

fn io_err(e: std::io::Error) -> String {
    e.to_string()
}

impl FsHistoryStore {
    /// Open a store under `root`, wiping it first when `reset_on_create` is set.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        let root = root.as_ref().to_path_buf();
        if reset_on_create
            && root.exists()
            && let Err(e) = std::fs::remove_dir_all(&root)
        {
            tracing::warn!(root = %root.display(), error = %e, "could not clear history root");
        }
        if let Err(e) = std::fs::create_dir_all(&root) {
            tracing::warn!(root = %root.display(), error = %e, "could not create history root");
        }
        Self { root, cap: DEFAULT_CAP }
    }

    pub fn new_with_cap(root: impl AsRef<Path>, reset_on_create: bool, cap: usize) -> Self {
        Self {
            cap,
            ..Self::new(root, reset_on_create)
        }
    }

    fn instance_dir(&self, instance: &str) -> PathBuf {
        // Child ids contain "::", which is not portable in file names
        self.root.join(instance.replace("::", "__"))
    }

    fn execution_file(&self, instance: &str, execution_id: u64) -> PathBuf {
        self.instance_dir(instance)
            .join(format!("{execution_id}{EXECUTION_SUFFIX}"))
    }

    /// Execution ids present on disk, ascending.
    async fn execution_ids(&self, instance: &str) -> Vec<u64> {
        let mut ids = Vec::new();
        let Ok(mut entries) = fs::read_dir(self.instance_dir(instance)).await else {
            return ids;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let id = entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_suffix(EXECUTION_SUFFIX))
                .and_then(|stem| stem.parse::<u64>().ok());
            if let Some(id) = id {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        ids
    }
}

fn decode_lines(data: &str) -> Vec<Event> {
    let mut events = Vec::new();
    for (lineno, line) in data.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(line) {
            Ok(ev) => events.push(ev),
            Err(e) => tracing::warn!(line = lineno + 1, error = %e, "skipping unreadable history line"),
        }
    }
    events
}

fn encode_lines(events: &[Event]) -> Result<String, String> {
    let mut buf = String::new();
    for ev in events {
        buf.push_str(&serde_json::to_string(ev).map_err(|e| e.to_string())?);
        buf.push('\n');
    }
    Ok(buf)
}

#[async_trait::async_trait]
impl HistoryStore for FsHistoryStore {
    async fn read(&self, instance: &str) -> Vec<Event> {
        let Some(latest) = self.latest_execution_id(instance).await else {
            return Vec::new();
        };
        self.read_with_execution(instance, latest).await
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), String> {
        let Some(latest) = self.latest_execution_id(instance).await else {
            return Err(format!("instance not found: {instance}"));
        };
        self.append_with_execution(instance, latest, new_events).await
    }

    async fn list_instances(&self) -> Vec<String> {
        let mut instances = Vec::new();
        let Ok(mut entries) = fs::read_dir(&self.root).await else {
            return instances;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if !entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                instances.push(name.replace("__", "::"));
            }
        }
        instances.sort();
        instances
    }

    async fn dump_all_pretty(&self) -> String {
        let mut out = String::new();
        for instance in self.list_instances().await {
            out.push_str(&format!("instance={instance}\n"));
            for execution_id in self.execution_ids(&instance).await {
                for ev in self.read_with_execution(&instance, execution_id).await {
                    out.push_str(&format!("  exec#{execution_id} {ev:#?}\n"));
                }
            }
        }
        out
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), String> {
        let dir = self.instance_dir(instance);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(format!("instance not found: {instance}")),
            Err(e) => Err(io_err(e)),
        }
    }

    async fn latest_execution_id(&self, instance: &str) -> Option<u64> {
        self.execution_ids(instance).await.last().copied()
    }

    async fn list_executions(&self, instance: &str) -> Vec<u64> {
        self.execution_ids(instance).await
    }

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Vec<Event> {
        match fs::read_to_string(self.execution_file(instance, execution_id)).await {
            Ok(data) => decode_lines(&data),
            Err(_) => Vec::new(),
        }
    }

    async fn append_with_execution(
        &self,
        instance: &str,
        execution_id: u64,
        new_events: Vec<Event>,
    ) -> Result<(), String> {
        let file_path = self.execution_file(instance, execution_id);
        if !fs::try_exists(&file_path).await.map_err(io_err)? {
            return Err(format!("execution not found: {instance}#{execution_id}"));
        }
        let existing = self.read_with_execution(instance, execution_id).await;
        let fresh = without_duplicates(&existing, new_events);
        if fresh.is_empty() {
            return Ok(());
        }
        let have = existing.len();
        if have + fresh.len() > self.cap {
            return Err(format!(
                "history cap exceeded (cap={}, have={have}, append={})",
                self.cap,
                fresh.len()
            ));
        }
        let buf = encode_lines(&fresh)?;
        let mut file = fs::OpenOptions::new().append(true).open(&file_path).await.map_err(io_err)?;
        file.write_all(buf.as_bytes()).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)
    }

    async fn create_new_execution(
        &self,
        instance: &str,
        orchestration: &str,
        input: &str,
        parent: Option<ParentLink>,
    ) -> Result<u64, String> {
        let execution_id = self.latest_execution_id(instance).await.map_or(1, |latest| latest + 1);
        fs::create_dir_all(self.instance_dir(instance)).await.map_err(io_err)?;
        // create_new refuses to clobber a concurrently created execution
        fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(self.execution_file(instance, execution_id))
            .await
            .map_err(io_err)?;
        self.append_with_execution(instance, execution_id, vec![started_event(orchestration, input, parent)])
            .await?;
        Ok(execution_id)
    }
}
