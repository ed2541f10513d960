//! Redis-backed cache implementations
//!
//! Each submission's aggregate is one Redis hash, one field per command
//! (`suite/case/command` -> JSON view). HSET on distinct fields never clobbers
//! siblings, so concurrent merges into one submission are safe without
//! read-modify-write. Replacing a suite and pruning a project each run as a
//! single Lua script, so readers never see a half-written suite or a
//! half-pruned project.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, warn};

use super::{
    CommandPath, DenormalizedResults, RenderCache, ResultPath, ResultStore, SubmissionKey,
};
use crate::render::CommandResultView;

/// Redis key constants
pub mod keys {
    /// Per-submission result hash prefix
    pub const RESULTS_PREFIX: &str = "grader:results";

    /// Rendered document prefix
    pub const RENDER_PREFIX: &str = "grader:render:";
}

/// Keys scanned per SCAN round trip
const SCAN_COUNT: usize = 500;
/// Keys per DEL command when invalidating
const DELETE_BATCH: usize = 500;
/// Default lifetime of rendered documents
const RENDER_TTL_SECS: u64 = 24 * 3600;

/// Removes a field (exact) or every field with a prefix from each KEYS hash.
/// Returns the number of hashes that changed.
const PRUNE_SCRIPT: &str = r#"
local touched = 0
local pattern = ARGV[1]
local exact = ARGV[2] == 'exact'
for _, key in ipairs(KEYS) do
  local removed = 0
  if exact then
    removed = redis.call('HDEL', key, pattern)
  else
    for _, field in ipairs(redis.call('HKEYS', key)) do
      if string.sub(field, 1, string.len(pattern)) == pattern then
        removed = removed + redis.call('HDEL', key, field)
      end
    end
  end
  if removed > 0 then
    touched = touched + 1
  end
end
return touched
"#;

/// Drops every field of KEYS[1] starting with ARGV[1], then sets the
/// field/value pairs in ARGV[2..]. Returns the number of fields set.
const REPLACE_SUITE_SCRIPT: &str = r#"
local key = KEYS[1]
local prefix = ARGV[1]
for _, field in ipairs(redis.call('HKEYS', key)) do
  if string.sub(field, 1, string.len(prefix)) == prefix then
    redis.call('HDEL', key, field)
  end
end
local written = 0
for i = 2, #ARGV - 1, 2 do
  redis.call('HSET', key, ARGV[i], ARGV[i + 1])
  written = written + 1
end
return written
"#;

pub fn results_key(submission: SubmissionKey) -> String {
    format!(
        "{}:{}:{}",
        keys::RESULTS_PREFIX,
        submission.project_id,
        submission.submission_id
    )
}

fn project_results_pattern(project_id: i64) -> String {
    format!("{}:{}:*", keys::RESULTS_PREFIX, project_id)
}

/// Escape glob metacharacters so `value` matches literally in SCAN MATCH
pub fn escape_glob(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Collect every key matching `pattern`
async fn scan_keys(conn: &mut ConnectionManager, pattern: &str) -> Result<Vec<String>> {
    let mut found = Vec::new();
    let mut cursor: u64 = 0;
    loop {
        let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(SCAN_COUNT)
            .query_async(conn)
            .await
            .with_context(|| format!("SCAN {} failed", pattern))?;
        found.extend(batch);
        if next == 0 {
            break;
        }
        cursor = next;
    }
    found.sort();
    found.dedup();
    Ok(found)
}

/// Rebuild an aggregate from hash fields, skipping anything unparseable
pub fn results_from_fields(fields: HashMap<String, String>) -> DenormalizedResults {
    let mut results = DenormalizedResults::default();
    for (field, json) in fields {
        let Some(path) = CommandPath::parse_field(&field) else {
            warn!("Ignoring malformed result field {:?}", field);
            continue;
        };
        match serde_json::from_str::<CommandResultView>(&json) {
            Ok(view) => results.merge(path, view),
            Err(e) => warn!("Ignoring unreadable result at {}: {}", field, e),
        }
    }
    results
}

/// Serialize a suite's views into hash fields. Entries outside the suite are
/// dropped.
pub fn suite_fields(
    suite_id: i64,
    results: &[(CommandPath, CommandResultView)],
) -> Result<Vec<(String, String)>> {
    results
        .iter()
        .filter(|(path, _)| path.suite_id == suite_id)
        .map(|(path, view)| Ok((path.field(), serde_json::to_string(view)?)))
        .collect()
}

/// `ResultStore` keeping one Redis hash per submission
#[derive(Clone)]
pub struct RedisResultStore {
    conn: ConnectionManager,
}

impl RedisResultStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl ResultStore for RedisResultStore {
    async fn merge(
        &self,
        submission: SubmissionKey,
        path: CommandPath,
        result: CommandResultView,
    ) -> Result<()> {
        let json = serde_json::to_string(&result)?;
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(results_key(submission), path.field(), json)
            .await
            .with_context(|| format!("Failed to merge result {}", path.field()))?;
        Ok(())
    }

    async fn replace_suite(
        &self,
        submission: SubmissionKey,
        suite_id: i64,
        results: Vec<(CommandPath, CommandResultView)>,
    ) -> Result<()> {
        // serialize everything up front so a bad view writes nothing
        let fields = suite_fields(suite_id, &results)?;
        let (prefix, _) = ResultPath::Suite { suite_id }.field_pattern();

        let script = redis::Script::new(REPLACE_SUITE_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation.key(results_key(submission)).arg(prefix);
        for (field, json) in &fields {
            invocation.arg(field).arg(json);
        }

        let mut conn = self.conn.clone();
        let written: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("Failed to replace results of suite {}", suite_id))?;

        debug!(
            "Replaced suite {} of submission {} with {} results",
            suite_id, submission.submission_id, written
        );
        Ok(())
    }

    async fn load(&self, submission: SubmissionKey) -> Result<DenormalizedResults> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(results_key(submission))
            .await
            .context("Failed to load submission results")?;
        Ok(results_from_fields(fields))
    }

    async fn prune(&self, project_id: i64, path: &ResultPath) -> Result<usize> {
        let mut conn = self.conn.clone();
        let keys = scan_keys(&mut conn, &project_results_pattern(project_id)).await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let (pattern, is_prefix) = path.field_pattern();
        let script = redis::Script::new(PRUNE_SCRIPT);
        let mut invocation = script.prepare_invoke();
        for key in &keys {
            invocation.key(key);
        }
        invocation
            .arg(pattern)
            .arg(if is_prefix { "prefix" } else { "exact" });

        let touched: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .context("Failed to prune results")?;

        debug!(
            "Pruned {:?} from {} of {} submissions in project {}",
            path,
            touched,
            keys.len(),
            project_id
        );
        Ok(usize::try_from(touched).unwrap_or(0))
    }
}

/// `RenderCache` on plain Redis string keys
#[derive(Clone)]
pub struct RedisRenderCache {
    conn: ConnectionManager,
    ttl_secs: u64,
}

impl RedisRenderCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            ttl_secs: RENDER_TTL_SECS,
        }
    }

    pub fn with_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    fn full_key(key: &str) -> String {
        format!("{}{}", keys::RENDER_PREFIX, key)
    }
}

#[async_trait]
impl RenderCache for RedisRenderCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(Self::full_key(key)).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(Self::full_key(key), value, self.ttl_secs)
            .await?;
        Ok(())
    }

    async fn invalidate_prefix(&self, prefix: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", escape_glob(&Self::full_key(prefix)));
        let keys = scan_keys(&mut conn, &pattern).await?;

        for batch in keys.chunks(DELETE_BATCH) {
            redis::cmd("DEL")
                .arg(batch)
                .query_async::<()>(&mut conn)
                .await
                .context("Failed to delete cached renders")?;
        }

        debug!("Invalidated {} cached renders under {}", keys.len(), prefix);
        Ok(keys.len())
    }
}
