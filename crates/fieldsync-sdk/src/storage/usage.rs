//! 使用记录
//!
//! 记录用户在各项目上的操作，用于"常用项目"排序：
//! 60 天窗口内按 1 / (1 + 距今天数) 加权求和，越近的操作权重越高。
//! 写入失败只记日志，绝不打断业务路径。

use rusqlite::{params, Connection};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{FieldSyncError, Result};
use crate::storage::now_millis;

/// 评分窗口（天）
const SCORE_WINDOW_DAYS: i64 = 60;
/// 清理阈值（天）
const PRUNE_AFTER_DAYS: i64 = 90;

const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

/// 被记录的操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageAction {
    Open,
    Mutate,
    Search,
}

impl UsageAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageAction::Open => "open",
            UsageAction::Mutate => "mutate",
            UsageAction::Search => "search",
        }
    }
}

/// 项目活跃度评分
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectScore {
    pub project_id: String,
    pub score: f64,
    /// 窗口内的事件数
    pub event_count: i64,
    /// 窗口内最近一次使用的时间戳（毫秒）
    pub last_used_ts: i64,
}

#[derive(Debug, Clone)]
pub struct UsageTracker {
    conn: Arc<Mutex<Connection>>,
}

impl UsageTracker {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// 记录一次操作（尽力而为，失败静默）
    pub async fn record(&self, project_id: &str, action: UsageAction) {
        let conn = self.conn.lock().await;
        if let Err(e) = conn.execute(
            "INSERT INTO usage_events (project_id, action, ts) VALUES (?1, ?2, ?3)",
            params![project_id, action.as_str(), now_millis()],
        ) {
            debug!("记录使用事件失败（已忽略）: {}", e);
        }
    }

    /// 各项目的近期活跃度评分，降序
    pub async fn project_scores(&self) -> Result<Vec<ProjectScore>> {
        let cutoff = now_millis() - SCORE_WINDOW_DAYS * DAY_MILLIS;
        let now = now_millis();

        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT project_id, ts FROM usage_events WHERE ts >= ?1")
            .map_err(|e| FieldSyncError::Database(format!("查询使用事件失败: {}", e)))?;

        let events = stmt
            .query_map(params![cutoff], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(|e| FieldSyncError::Database(format!("查询使用事件失败: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| FieldSyncError::Database(format!("读取使用事件失败: {}", e)))?;

        // 评分累加，同时记事件数和最近使用时间
        let mut scores: std::collections::HashMap<String, (f64, i64, i64)> =
            std::collections::HashMap::new();
        for (project_id, ts) in events {
            let days_since = ((now - ts).max(0) as f64) / DAY_MILLIS as f64;
            let entry = scores.entry(project_id).or_insert((0.0, 0, 0));
            entry.0 += 1.0 / (1.0 + days_since);
            entry.1 += 1;
            entry.2 = entry.2.max(ts);
        }

        let mut result: Vec<ProjectScore> = scores
            .into_iter()
            .map(|(project_id, (score, event_count, last_used_ts))| ProjectScore {
                project_id,
                score,
                event_count,
                last_used_ts,
            })
            .collect();
        result.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(result)
    }

    /// 删除过旧的事件，返回删除条数
    pub async fn prune_old(&self) -> Result<usize> {
        let cutoff = now_millis() - PRUNE_AFTER_DAYS * DAY_MILLIS;
        let conn = self.conn.lock().await;
        let removed = conn
            .execute("DELETE FROM usage_events WHERE ts < ?1", params![cutoff])
            .map_err(|e| FieldSyncError::Database(format!("清理使用事件失败: {}", e)))?;
        Ok(removed)
    }

    #[cfg(test)]
    async fn record_at(&self, project_id: &str, action: UsageAction, ts: i64) {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO usage_events (project_id, action, ts) VALUES (?1, ?2, ?3)",
            params![project_id, action.as_str(), ts],
        )
        .unwrap();
    }
}
