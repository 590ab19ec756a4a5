use super::{Task, TaskStore};
use anyhow::Context;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};

/// JSON Lines 文件任务存储：每行一条任务，启动时重建内存索引。
///
/// 同一 task_id 多次写入时以最后一行为准。写入失败会截回写入前的长度；
/// 文件末尾若残留没有换行的半行，新记录另起一行。
#[derive(Debug)]
pub struct FileTaskStore {
    file_path: PathBuf,
    index: RwLock<HashMap<String, Task>>,
    writer: Mutex<()>,
}

impl FileTaskStore {
    pub fn new(data_dir: &str) -> Self {
        Self {
            file_path: PathBuf::from(data_dir).join("tasks.jsonl"),
            index: RwLock::new(HashMap::new()),
            writer: Mutex::new(()),
        }
    }

    pub async fn load(&self) -> anyhow::Result<usize> {
        let data = match tokio::fs::read(&self.file_path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e).context("读取 tasks.jsonl 失败"),
        };

        let mut index = HashMap::new();
        let mut skipped = 0usize;
        for line in data.split(|&b| b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match sonic_rs::from_slice::<Task>(line) {
                Ok(t) => {
                    index.insert(t.task_id.clone(), t);
                }
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            tracing::warn!("tasks.jsonl 中有 {skipped} 行无法解析，已跳过");
        }

        let n = index.len();
        *self.index.write().await = index;
        Ok(n)
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn insert(&self, task: &Task) -> anyhow::Result<()> {
        let mut line = sonic_rs::to_vec(task).context("序列化任务失败")?;
        line.push(b'\n');

        {
            let _guard = self.writer.lock().await;
            ensure_parent_dir(&self.file_path).await?;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(&self.file_path)
                .await
                .context("打开 tasks.jsonl 失败")?;

            let len = file
                .metadata()
                .await
                .context("读取 tasks.jsonl 元数据失败")?
                .len();
            if len > 0 && !ends_with_newline(&mut file, len).await? {
                line.insert(0, b'\n');
            }

            let mut written = file.write_all(&line).await;
            if written.is_ok() {
                written = file.flush().await;
            }
            if let Err(e) = written {
                let _ = file.set_len(len).await;
                return Err(e).context("写入 tasks.jsonl 失败");
            }
        }

        self.index
            .write()
            .await
            .insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    async fn get(&self, task_id: &str) -> anyhow::Result<Option<Task>> {
        Ok(self.index.read().await.get(task_id).cloned())
    }
}

async fn ends_with_newline(file: &mut tokio::fs::File, len: u64) -> anyhow::Result<bool> {
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))
        .await
        .context("定位 tasks.jsonl 末尾失败")?;
    file.read_exact(&mut last)
        .await
        .context("读取 tasks.jsonl 末尾失败")?;
    Ok(last[0] == b'\n')
}

async fn ensure_parent_dir(path: &Path) -> anyhow::Result<()> {
    let Some(dir) = path.parent() else {
        return Ok(());
    };
    tokio::fs::create_dir_all(dir)
        .await
        .context("创建数据目录失败")
}
