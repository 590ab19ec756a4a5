//! 后台任务：`pricing.json` 变化时重新加载价格表。

use super::{PricingHandle, PricingTable};
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// 启动价格表热加载。
///
/// 文件中的条目覆盖环境变量中的同名条目；文件被删除时回退到环境变量配置。
pub fn spawn_reload_task(
    handle: PricingHandle,
    base: PricingTable,
    path: PathBuf,
    interval: Duration,
) {
    tokio::spawn(async move {
        let mut last_modified: Option<SystemTime> = None;
        loop {
            match reload_if_changed(&handle, &base, &path, last_modified).await {
                Ok(m) => last_modified = m,
                Err(e) => tracing::warn!("价格表加载失败：{e:#}"),
            }
            tokio::time::sleep(interval.max(Duration::from_secs(1))).await;
        }
    });
}

async fn reload_if_changed(
    handle: &PricingHandle,
    base: &PricingTable,
    path: &Path,
    last_modified: Option<SystemTime>,
) -> anyhow::Result<Option<SystemTime>> {
    let modified = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.modified().ok(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if last_modified.is_some() {
                tracing::info!("pricing.json 已移除，恢复环境变量价格表");
                handle.store(base.clone());
            }
            return Ok(None);
        }
        Err(e) => return Err(e).context("读取 pricing.json 元数据失败"),
    };

    if modified.is_some() && modified == last_modified {
        return Ok(last_modified);
    }

    let overlay = load_file(path).await?;
    let table = base.merged(&overlay);
    tracing::info!(
        "价格表已加载：价格 {} 项，倍率 {} 项，分组 {} 项",
        table.model_price.len(),
        table.model_ratio.len(),
        table.group_ratio.len()
    );
    handle.store(table);
    Ok(modified)
}

async fn load_file(path: &Path) -> anyhow::Result<PricingTable> {
    let data = tokio::fs::read(path)
        .await
        .context("读取 pricing.json 失败")?;
    sonic_rs::from_slice(&data).context("解析 pricing.json 失败")
}
