use super::{Account, ConsumeLog, QuotaStore};
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

/// 文件账户存储：`accounts.json` 保存账户快照，`consume_logs.jsonl` 追加消费日志。
///
/// 扣费先落盘再更新内存；`writer` 串行化从读取到落盘的整个过程。
#[derive(Debug)]
pub struct FileAccountStore {
    accounts_path: PathBuf,
    logs_path: PathBuf,
    accounts: RwLock<Vec<Account>>,
    writer: Mutex<()>,
}

impl FileAccountStore {
    pub fn new(data_dir: &str) -> Self {
        let dir = PathBuf::from(data_dir);
        Self {
            accounts_path: dir.join("accounts.json"),
            logs_path: dir.join("consume_logs.jsonl"),
            accounts: RwLock::new(Vec::new()),
            writer: Mutex::new(()),
        }
    }

    pub async fn load(&self) -> anyhow::Result<usize> {
        let _guard = self.writer.lock().await;
        ensure_parent_dir(&self.accounts_path).await?;

        let data = match tokio::fs::read(&self.accounts_path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.accounts.write().await.clear();
                return Ok(0);
            }
            Err(e) => return Err(e).context("读取 accounts.json 失败"),
        };

        let accounts: Vec<Account> = match sonic_rs::from_slice(&data) {
            Ok(v) => v,
            Err(e) => {
                self.accounts.write().await.clear();
                return Err(anyhow!(e)).context("解析 accounts.json 失败");
            }
        };

        let n = accounts.len();
        *self.accounts.write().await = accounts;
        Ok(n)
    }

    /// 先写临时文件再 rename，避免留下半截的 accounts.json。
    async fn save_snapshot(&self, accounts: &[Account]) -> anyhow::Result<()> {
        ensure_parent_dir(&self.accounts_path).await?;
        let data = sonic_rs::to_vec_pretty(accounts).context("序列化 accounts.json 失败")?;
        let tmp = self.accounts_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data)
            .await
            .context("写入 accounts.json.tmp 失败")?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.accounts_path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e).context("替换 accounts.json 失败");
        }
        Ok(())
    }

    async fn append_log(&self, log: &ConsumeLog) -> anyhow::Result<()> {
        let mut line = sonic_rs::to_vec(log).context("序列化消费日志失败")?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.logs_path)
            .await
            .context("打开 consume_logs.jsonl 失败")?;
        file.write_all(&line)
            .await
            .context("写入 consume_logs.jsonl 失败")?;
        file.flush().await.context("刷新 consume_logs.jsonl 失败")
    }
}

#[async_trait]
impl QuotaStore for FileAccountStore {
    async fn get_user_quota(&self, user_id: i64) -> anyhow::Result<i64> {
        let accounts = self.accounts.read().await;
        accounts
            .iter()
            .find(|a| a.id == user_id)
            .map(|a| a.quota)
            .ok_or_else(|| anyhow!("账户 {user_id} 不存在"))
    }

    async fn find_by_key(&self, key: &str) -> anyhow::Result<Option<Account>> {
        let key = key.trim();
        if key.is_empty() {
            return Ok(None);
        }
        let accounts = self.accounts.read().await;
        Ok(accounts.iter().find(|a| a.key == key).cloned())
    }

    async fn post_consume(&self, log: &ConsumeLog) -> anyhow::Result<()> {
        let _guard = self.writer.lock().await;

        // 余额允许被扣成负数：预检与扣费之间没有锁。
        let mut next = self.accounts.read().await.clone();
        let account = next
            .iter_mut()
            .find(|a| a.id == log.user_id)
            .ok_or_else(|| anyhow!("账户 {} 不存在", log.user_id))?;
        account.quota -= log.quota;
        account.used_quota += log.quota;
        account.request_count += 1;

        self.save_snapshot(&next).await?;
        *self.accounts.write().await = next;

        // 快照已落盘即视为扣费成功，消费日志写失败只告警。
        if let Err(e) = self.append_log(log).await {
            tracing::warn!(
                user_id = log.user_id,
                request_id = %log.request_id,
                quota = log.quota,
                "写入消费日志失败: {e:#}"
            );
        }
        Ok(())
    }
}

async fn ensure_parent_dir(path: &Path) -> anyhow::Result<()> {
    let Some(dir) = path.parent() else {
        return Ok(());
    };
    tokio::fs::create_dir_all(dir)
        .await
        .context("创建数据目录失败")
}
