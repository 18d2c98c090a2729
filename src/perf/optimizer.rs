//! Statement optimizer and prepared-plan cache
//!
//! Plans come from the engine's `EXPLAIN QUERY PLAN` facility; index
//! recommendations are heuristic, extracted from predicate columns when the
//! plan shows a full table scan. Optimization is strictly best-effort: any
//! failure degrades to executing the original statement unmodified.

use regex::Regex;
use rusqlite::Connection;
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Instant;
use tracing::debug;

use crate::config::PlanCacheConfig;
use crate::statement::normalize;

static WHERE_COLUMN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:where|and|or)\s+(?:\w+\.)?(\w+)\s*(?:=|<|>|<=|>=|like|in)\b").unwrap()
});
static FROM_TABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bfrom\s+(\w+)").unwrap());
static ORDER_COLUMN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\border\s+by\s+(?:\w+\.)?(\w+)").unwrap());

/// A cached rewrite of a statement plus plan metadata
#[derive(Debug, Clone)]
pub struct OptimizedQuery {
    pub sql: String,
    pub plan: Vec<String>,
    pub recommended_indexes: Vec<String>,
    pub estimated_cost: f64,
    pub stale: bool,
    pub created_at: Instant,
}

impl OptimizedQuery {
    /// Passthrough entry used when plan computation fails
    fn passthrough(sql: &str) -> Self {
        Self {
            sql: sql.to_string(),
            plan: Vec::new(),
            recommended_indexes: Vec::new(),
            estimated_cost: 0.0,
            stale: false,
            created_at: Instant::now(),
        }
    }
}

/// Plan cache keyed by normalized statement text
#[derive(Debug)]
pub struct QueryOptimizer {
    config: PlanCacheConfig,
    plans: HashMap<String, OptimizedQuery>,
}

impl QueryOptimizer {
    pub fn new(config: PlanCacheConfig) -> Self {
        Self {
            config,
            plans: HashMap::new(),
        }
    }

    /// Return a cached, still-fresh plan or compute and cache one.
    /// Never fails: plan errors yield an uncached passthrough.
    pub fn optimize(&mut self, conn: &Connection, sql: &str) -> OptimizedQuery {
        let key = normalize(sql);
        if let Some(cached) = self.plans.get(&key)
            && !cached.stale
        {
            return cached.clone();
        }

        match self.compute_plan(conn, sql) {
            Ok(optimized) => {
                if self.plans.len() >= self.config.max_entries && !self.plans.contains_key(&key) {
                    if let Some(victim) = self.plans.keys().next().cloned() {
                        self.plans.remove(&victim);
                    }
                }
                self.plans.insert(key, optimized.clone());
                optimized
            }
            Err(err) => {
                debug!(error = %err, sql, "plan computation failed, executing unoptimized");
                OptimizedQuery::passthrough(sql)
            }
        }
    }

    fn compute_plan(&self, conn: &Connection, sql: &str) -> rusqlite::Result<OptimizedQuery> {
        let mut stmt = conn.prepare(&format!("EXPLAIN QUERY PLAN {sql}"))?;
        let detail_idx = stmt.column_count() - 1;
        let plan: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(detail_idx))?
            .collect::<rusqlite::Result<Vec<String>>>()?;

        let estimated_cost = Self::estimate_cost(&plan);
        let recommended_indexes = Self::recommend_indexes(sql, &plan);

        Ok(OptimizedQuery {
            sql: sql.to_string(),
            plan,
            recommended_indexes,
            estimated_cost,
            stale: false,
            created_at: Instant::now(),
        })
    }

    /// Naive cost model: full scans dominate, searches are cheap
    fn estimate_cost(plan: &[String]) -> f64 {
        let mut cost = 1.0;
        for step in plan {
            let upper = step.to_uppercase();
            if upper.contains("SCAN") && !upper.contains("USING INDEX") {
                cost += 100.0;
            } else if upper.contains("SEARCH") {
                cost += 10.0;
            }
            if upper.contains("TEMP B-TREE") {
                cost += 50.0;
            }
        }
        cost
    }

    /// Suggest covering indexes for scanned predicate and ordering columns
    fn recommend_indexes(sql: &str, plan: &[String]) -> Vec<String> {
        let has_scan = plan
            .iter()
            .any(|p| p.to_uppercase().contains("SCAN") && !p.to_uppercase().contains("USING INDEX"));
        if !has_scan {
            return Vec::new();
        }
        let Some(table) = FROM_TABLE
            .captures(sql)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_lowercase())
        else {
            return Vec::new();
        };

        let mut columns: Vec<String> = WHERE_COLUMN
            .captures_iter(sql)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str().to_lowercase())
            .collect();
        if let Some(order) = ORDER_COLUMN
            .captures(sql)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_lowercase())
        {
            columns.push(order);
        }
        columns.dedup();

        columns
            .into_iter()
            .map(|col| format!("CREATE INDEX IF NOT EXISTS idx_{table}_{col} ON {table}({col})"))
            .collect()
    }

    /// Mark every cached plan stale (after schema changes)
    pub fn mark_all_stale(&mut self) {
        for plan in self.plans.values_mut() {
            plan.stale = true;
        }
    }

    /// Drop every cached plan (sizing configuration changed)
    pub fn invalidate_all(&mut self) {
        self.plans.clear();
    }

    pub fn reconfigure(&mut self, config: PlanCacheConfig) {
        self.config = config;
        self.plans.clear();
    }

    pub fn cached_plans(&self) -> usize {
        self.plans.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE files (id INTEGER PRIMARY KEY, path TEXT, size INTEGER);
             CREATE INDEX idx_files_path ON files(path);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_plan_computed_and_cached() {
        let conn = conn();
        let mut optimizer = QueryOptimizer::new(PlanCacheConfig { max_entries: 10 });

        let first = optimizer.optimize(&conn, "SELECT * FROM files WHERE size > 10");
        assert!(!first.plan.is_empty());
        assert_eq!(optimizer.cached_plans(), 1);

        // Identical statement modulo formatting reuses the cached plan
        let second = optimizer.optimize(&conn, "select *  from files where size > 10");
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(optimizer.cached_plans(), 1);
    }

    #[test]
    fn test_scan_recommends_index() {
        let conn = conn();
        let mut optimizer = QueryOptimizer::new(PlanCacheConfig { max_entries: 10 });
        let optimized = optimizer.optimize(&conn, "SELECT * FROM files WHERE size > 10");
        assert!(
            optimized
                .recommended_indexes
                .iter()
                .any(|idx| idx.contains("idx_files_size")),
            "expected a size index recommendation, got {:?}",
            optimized.recommended_indexes
        );
        assert!(optimized.estimated_cost > 100.0);
    }

    #[test]
    fn test_indexed_lookup_recommends_nothing() {
        let conn = conn();
        let mut optimizer = QueryOptimizer::new(PlanCacheConfig { max_entries: 10 });
        let optimized = optimizer.optimize(&conn, "SELECT * FROM files WHERE path = 'a'");
        assert!(optimized.recommended_indexes.is_empty());
        assert!(optimized.estimated_cost < 100.0);
    }

    #[test]
    fn test_invalid_sql_degrades_to_passthrough() {
        let conn = conn();
        let mut optimizer = QueryOptimizer::new(PlanCacheConfig { max_entries: 10 });
        let optimized = optimizer.optimize(&conn, "SELECT * FROM missing_table");
        assert_eq!(optimized.sql, "SELECT * FROM missing_table");
        assert!(optimized.plan.is_empty());
        assert_eq!(optimizer.cached_plans(), 0);
    }

    #[test]
    fn test_stale_plans_recompute() {
        let conn = conn();
        let mut optimizer = QueryOptimizer::new(PlanCacheConfig { max_entries: 10 });
        let first = optimizer.optimize(&conn, "SELECT * FROM files");
        optimizer.mark_all_stale();
        let second = optimizer.optimize(&conn, "SELECT * FROM files");
        assert!(!second.stale);
        assert!(second.created_at >= first.created_at);
    }

    #[test]
    fn test_capacity_bound() {
        let conn = conn();
        let mut optimizer = QueryOptimizer::new(PlanCacheConfig { max_entries: 2 });
        optimizer.optimize(&conn, "SELECT id FROM files");
        optimizer.optimize(&conn, "SELECT path FROM files");
        optimizer.optimize(&conn, "SELECT size FROM files");
        assert_eq!(optimizer.cached_plans(), 2);
    }
}
