//! The registry store: durable CRUD for epics, features, tasks, lifecycle
//! events and orchestration plans, backed by SQLite.
//!
//! Every write that touches a feature is guarded by the feature's `version`
//! column, so a stale read-modify-write fails with [`FlowError::Conflict`]
//! instead of overwriting a concurrent change. Reads never block on anything
//! but the connection mutex.

mod schema;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;

use crate::error::{FlowError, Result};
use crate::lifecycle::table;
use crate::models::*;

const RUN_LOCK_NAME: &str = "orchestrator";

const EPIC_COLUMNS: &str =
    "id, name, description, complexity, status, milestones, created_at, updated_at";

const FEATURE_COLUMNS: &str = "id, epic_id, position, name, description, priority, effort, stage, \
     assigned_to, acceptance_criteria, files, dependencies, checklist, version, created_at, updated_at";

const TASK_COLUMNS: &str = "id, feature_id, stage, position, description, completed, created_at";

const EVENT_COLUMNS: &str = "seq, id, feature_id, action, outcome, metadata, created_at";

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: PathBuf) -> Result<Self> {
        let parent = path
            .parent()
            .ok_or_else(|| FlowError::Storage("database path has no parent directory".into()))?;
        std::fs::create_dir_all(parent)?;
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::from_connection(conn)
    }

    pub fn open_default() -> Result<Self> {
        Self::open(default_path()?)
    }

    pub fn open_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.lock();
        schema::run_migrations(&conn)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database lock poisoned")
    }

    // ============================================================
    // Epic operations
    // ============================================================

    pub fn create_epic(&self, input: CreateEpicInput) -> Result<Epic> {
        let conn = self.lock();
        insert_epic(&conn, input)
    }

    /// Create an epic and its features, in order, in a single transaction.
    pub fn create_epic_with_features(
        &self,
        input: CreateEpicInput,
        features: Vec<FeatureSpec>,
    ) -> Result<EpicDetail> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut epic = insert_epic(&tx, input)?;
        let features = features
            .into_iter()
            .map(|spec| insert_feature(&tx, &epic.id, spec))
            .collect::<Result<Vec<_>>>()?;
        tx.commit()?;

        epic.feature_ids = features.iter().map(|f| f.id.clone()).collect();
        Ok(EpicDetail { epic, features })
    }

    pub fn get_epic(&self, id: &str) -> Result<Option<Epic>> {
        let conn = self.lock();
        query_epic(&conn, id)
    }

    pub fn list_epics(&self) -> Result<Vec<Epic>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EPIC_COLUMNS} FROM epics ORDER BY created_at, id"
        ))?;
        let mut epics = stmt
            .query_map([], epic_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        for epic in &mut epics {
            epic.feature_ids = query_feature_ids(&conn, &epic.id)?;
        }
        Ok(epics)
    }

    pub fn get_epic_detail(&self, id: &str) -> Result<Option<EpicDetail>> {
        let Some(epic) = self.get_epic(id)? else {
            return Ok(None);
        };
        let features = self.list_features_by_epic(id)?;
        Ok(Some(EpicDetail { epic, features }))
    }

    /// Recompute an epic's status from its features.
    pub fn refresh_epic_status(&self, id: &str) -> Result<EpicStatus> {
        let conn = self.lock();
        refresh_epic_status(&conn, id)
    }

    /// Delete an epic and its features. Refused while any feature is unfinished.
    pub fn delete_epic(&self, id: &str) -> Result<bool> {
        let conn = self.lock();
        let unfinished: i64 = conn.query_row(
            "SELECT COUNT(*) FROM features WHERE epic_id = ? AND stage != ?",
            (id, Stage::Completed.as_str()),
            |row| row.get(0),
        )?;
        if unfinished > 0 {
            return Err(FlowError::Validation(format!(
                "epic {id} still has {unfinished} unfinished feature(s)"
            )));
        }
        let rows = conn.execute("DELETE FROM epics WHERE id = ?", [id])?;
        Ok(rows > 0)
    }

    // ============================================================
    // Feature operations
    // ============================================================

    pub fn create_feature(&self, epic_id: &str, spec: FeatureSpec) -> Result<Feature> {
        let conn = self.lock();
        insert_feature(&conn, epic_id, spec)
    }

    pub fn get_feature(&self, id: &str) -> Result<Option<Feature>> {
        let conn = self.lock();
        query_feature(&conn, id)
    }

    /// Like [`get_feature`](Self::get_feature), but a missing feature is an error.
    pub fn require_feature(&self, id: &str) -> Result<Feature> {
        self.get_feature(id)?
            .ok_or_else(|| FlowError::not_found("feature", id))
    }

    pub fn list_features_by_epic(&self, epic_id: &str) -> Result<Vec<Feature>> {
        self.query_features("WHERE epic_id = ? ORDER BY position, seq", [epic_id])
    }

    /// Features in `stage`, oldest first.
    pub fn list_features_by_stage(&self, stage: Stage) -> Result<Vec<Feature>> {
        self.query_features(
            "WHERE stage = ? ORDER BY created_at, seq",
            [stage.as_str()],
        )
    }

    pub fn list_features_by_assignee(&self, assignee: &str) -> Result<Vec<Feature>> {
        self.query_features(
            "WHERE assigned_to = ? ORDER BY created_at, seq",
            [assignee],
        )
    }

    pub fn list_all_features(&self) -> Result<Vec<Feature>> {
        self.query_features("ORDER BY created_at, seq", [])
    }

    pub fn count_features_in_stages(&self, stages: &[Stage]) -> Result<usize> {
        let conn = self.lock();
        count_in_stages(&conn, stages)
    }

    fn query_features<P: rusqlite::Params>(&self, clause: &str, params: P) -> Result<Vec<Feature>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!("SELECT {FEATURE_COLUMNS} FROM features {clause}"))?;
        let features = stmt
            .query_map(params, feature_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(features)
    }

    /// Move a feature to `new_stage` if it is still at `expected_version`.
    ///
    /// Fails with [`FlowError::Conflict`] when the version is stale or when
    /// `new_stage` is not reachable from the current stage. This is the raw
    /// registry write; lifecycle transitions go through
    /// [`commit_transition`](Self::commit_transition) so that the stage change
    /// and its event land together.
    pub fn update_feature_stage(
        &self,
        id: &str,
        expected_version: i64,
        new_stage: Stage,
    ) -> Result<Feature> {
        if new_stage == Stage::Blocked {
            return Err(FlowError::Validation(
                "blocking must go through the block transition so the origin stage is recorded"
                    .into(),
            ));
        }

        let conn = self.lock();
        let current =
            query_feature(&conn, id)?.ok_or_else(|| FlowError::not_found("feature", id))?;
        if current.version != expected_version {
            return Err(stale_version(&current, expected_version));
        }

        let origin = query_block_origin(&conn, id)?;
        if !table::can_reach(current.stage, new_stage, origin) {
            return Err(FlowError::Conflict(format!(
                "feature {id} cannot move from {} to {new_stage}",
                current.stage
            )));
        }

        write_stage(&conn, &current, new_stage)?;
        refresh_epic_status(&conn, &current.epic_id)?;
        query_feature(&conn, id)?.ok_or_else(|| FlowError::not_found("feature", id))
    }

    /// Atomically commit a lifecycle transition.
    ///
    /// In one SQLite transaction: the stage change (guarded by
    /// `feature.version`), the event, the replacement of the feature's tasks
    /// with the checklist for `new_stage`, and the epic status refresh. The
    /// replaced tasks are summarized under `tasks` in the event metadata.
    /// On a stale version nothing is written.
    ///
    /// With `admission_limit` set, the commit is also refused with
    /// [`FlowError::Conflict`] when that many features already occupy
    /// capacity-consuming stages.
    pub fn commit_transition(
        &self,
        feature: &Feature,
        new_stage: Stage,
        event: NewEvent,
        admission_limit: Option<usize>,
    ) -> Result<(Feature, LifecycleEvent)> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let current = query_feature(&tx, &feature.id)?
            .ok_or_else(|| FlowError::not_found("feature", &feature.id))?;
        if current.version != feature.version {
            return Err(stale_version(&current, feature.version));
        }
        if let Some(limit) = admission_limit {
            let active = count_in_stages(&tx, Stage::CAPACITY_CONSUMING)?;
            if active >= limit {
                return Err(FlowError::capacity_reached(limit, active));
            }
        }

        let replaced = query_tasks(&tx, "WHERE feature_id = ? ORDER BY position", [&feature.id])?;
        let mut event = event;
        attach_metadata(
            &mut event.metadata,
            "tasks",
            serde_json::to_value(TaskSummary::of(&replaced))?,
        );

        write_stage(&tx, &current, new_stage)?;
        tx.execute("DELETE FROM tasks WHERE feature_id = ?", [&feature.id])?;
        let now = now();
        for (position, item) in current.checklist_for(new_stage).into_iter().enumerate() {
            tx.execute(
                &format!("INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?, ?, ?, ?, ?, 0, ?)"),
                (
                    generate_id("task"),
                    &feature.id,
                    new_stage.as_str(),
                    position as i64,
                    &item.description,
                    format_timestamp(&now),
                ),
            )?;
        }

        let logged = insert_event(&tx, event)?;
        refresh_epic_status(&tx, &current.epic_id)?;
        let updated = query_feature(&tx, &feature.id)?
            .ok_or_else(|| FlowError::not_found("feature", &feature.id))?;

        tx.commit()?;
        Ok((updated, logged))
    }

    pub fn assign_feature(
        &self,
        id: &str,
        expected_version: i64,
        assignee: Option<String>,
    ) -> Result<Feature> {
        let conn = self.lock();
        let current =
            query_feature(&conn, id)?.ok_or_else(|| FlowError::not_found("feature", id))?;
        if current.version != expected_version {
            return Err(stale_version(&current, expected_version));
        }

        let rows = conn.execute(
            "UPDATE features SET assigned_to = ?, version = version + 1, updated_at = ?
             WHERE id = ? AND version = ?",
            (
                &assignee,
                format_timestamp(&now()),
                id,
                expected_version,
            ),
        )?;
        if rows == 0 {
            return Err(stale_version(&current, expected_version));
        }
        query_feature(&conn, id)?.ok_or_else(|| FlowError::not_found("feature", id))
    }

    /// Remove a completed feature. Its events stay in the log.
    pub fn delete_feature(&self, id: &str) -> Result<bool> {
        let conn = self.lock();
        let Some(feature) = query_feature(&conn, id)? else {
            return Ok(false);
        };
        if !feature.stage.is_terminal() {
            return Err(FlowError::Validation(format!(
                "feature {id} is {} and can only be removed once completed",
                feature.stage
            )));
        }
        let rows = conn.execute("DELETE FROM features WHERE id = ?", [id])?;
        refresh_epic_status(&conn, &feature.epic_id)?;
        Ok(rows > 0)
    }

    /// The stage recorded by the most recent successful block of this feature.
    pub fn block_origin(&self, feature_id: &str) -> Result<Option<Stage>> {
        let conn = self.lock();
        query_block_origin(&conn, feature_id)
    }

    // ============================================================
    // Lifecycle event operations
    // ============================================================

    pub fn append_event(&self, event: NewEvent) -> Result<LifecycleEvent> {
        let conn = self.lock();
        insert_event(&conn, event)
    }

    pub fn list_events(&self, feature_id: &str) -> Result<Vec<LifecycleEvent>> {
        let conn = self.lock();
        query_events(&conn, "WHERE feature_id = ? ORDER BY seq", [feature_id])
    }

    pub fn list_all_events(&self, limit: Option<usize>) -> Result<Vec<LifecycleEvent>> {
        let conn = self.lock();
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        query_events(&conn, "ORDER BY seq LIMIT ?", [limit])
    }

    /// Most recent event for `feature_id` with the given action and outcome,
    /// looking into the archive when the live log has none.
    pub fn latest_event(
        &self,
        feature_id: &str,
        action: Action,
        outcome: EventOutcome,
    ) -> Result<Option<LifecycleEvent>> {
        let conn = self.lock();
        query_latest_event(
            &conn,
            "feature_id = ?1 AND action = ?2 AND outcome = ?3",
            [feature_id, action.as_str(), outcome.as_str()],
        )
    }

    /// Timestamp of the most recent committed transition of a feature.
    pub fn last_transition_at(&self, feature_id: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock();
        let event =
            query_latest_event(&conn, "feature_id = ?1 AND outcome = 'succeeded'", [feature_id])?;
        Ok(event.map(|e| e.created_at))
    }

    /// Move events older than `before` into the archive table.
    ///
    /// Archived rows keep their id, sequence number and content.
    pub fn archive_events(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let cutoff = format_timestamp(&before);
        let archived = tx.execute(
            &format!(
                "INSERT INTO lifecycle_events_archive ({EVENT_COLUMNS}, archived_at)
                 SELECT {EVENT_COLUMNS}, ? FROM lifecycle_events WHERE created_at < ?"
            ),
            (format_timestamp(&now()), &cutoff),
        )?;
        tx.execute("DELETE FROM lifecycle_events WHERE created_at < ?", [&cutoff])?;
        tx.commit()?;

        tracing::info!(archived, cutoff = %cutoff, "archived lifecycle events");
        Ok(archived)
    }

    pub fn list_archived_events(&self, feature_id: &str) -> Result<Vec<LifecycleEvent>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM lifecycle_events_archive WHERE feature_id = ? ORDER BY seq"
        ))?;
        let events = stmt
            .query_map([feature_id], event_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    // ============================================================
    // Task operations
    // ============================================================

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.lock();
        Ok(query_tasks(&conn, "WHERE id = ?", [id])?.pop())
    }

    pub fn list_tasks_by_feature(&self, feature_id: &str) -> Result<Vec<Task>> {
        let conn = self.lock();
        query_tasks(&conn, "WHERE feature_id = ? ORDER BY position", [feature_id])
    }

    /// Tasks of every feature in an epic, optionally only for features in `stage`.
    pub fn list_tasks_by_epic(&self, epic_id: &str, stage: Option<Stage>) -> Result<Vec<Task>> {
        let conn = self.lock();
        let columns = TASK_COLUMNS
            .split(", ")
            .map(|c| format!("t.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!(
            "SELECT {columns} FROM tasks t JOIN features f ON f.id = t.feature_id WHERE f.epic_id = ?1"
        );
        if stage.is_some() {
            sql.push_str(" AND f.stage = ?2");
        }
        sql.push_str(" ORDER BY f.position, t.position");

        let mut stmt = conn.prepare(&sql)?;
        let tasks = match stage {
            Some(stage) => stmt
                .query_map((epic_id, stage.as_str()), task_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map([epic_id], task_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };
        Ok(tasks)
    }

    pub fn complete_task(&self, id: &str) -> Result<Task> {
        let conn = self.lock();
        let rows = conn.execute("UPDATE tasks SET completed = 1 WHERE id = ?", [id])?;
        if rows == 0 {
            return Err(FlowError::not_found("task", id));
        }
        query_tasks(&conn, "WHERE id = ?", [id])?
            .pop()
            .ok_or_else(|| FlowError::not_found("task", id))
    }

    // ============================================================
    // Orchestration plan operations
    // ============================================================

    pub fn save_plan(&self, plan: &OrchestrationPlan) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO orchestration_plans (id, mode, capacity, plan, created_at)
             VALUES (?, ?, ?, ?, ?)",
            (
                &plan.id,
                plan.mode.as_str(),
                plan.capacity as i64,
                serde_json::to_string(plan)?,
                format_timestamp(&plan.created_at),
            ),
        )?;
        Ok(())
    }

    pub fn get_plan(&self, id: &str) -> Result<Option<OrchestrationPlan>> {
        let conn = self.lock();
        let json: Option<String> = conn
            .query_row(
                "SELECT plan FROM orchestration_plans WHERE id = ?",
                [id],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(FlowError::from))
            .transpose()
    }

    /// Most recent plans first.
    pub fn list_plans(&self, limit: usize) -> Result<Vec<OrchestrationPlan>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT plan FROM orchestration_plans ORDER BY created_at DESC, id DESC LIMIT ?",
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.iter()
            .map(|j| serde_json::from_str(j).map_err(FlowError::from))
            .collect()
    }

    // ============================================================
    // Orchestration run lease
    // ============================================================

    /// Take the orchestration lease for `holder`.
    ///
    /// Returns `false` if another holder has it and it is younger than
    /// `stale_after`. A stale lease is reclaimed.
    pub fn acquire_run_lock(&self, holder: &str, stale_after: Duration) -> Result<bool> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let existing: Option<(String, String)> = tx
            .query_row(
                "SELECT holder, acquired_at FROM run_lock WHERE name = ?",
                [RUN_LOCK_NAME],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let now = now();
        if let Some((current, acquired_at)) = existing {
            let acquired_at = parse_datetime(1, acquired_at)?;
            if now - acquired_at < stale_after {
                tracing::debug!(holder = %current, "orchestration lease is held");
                return Ok(false);
            }
            tracing::warn!(holder = %current, since = %acquired_at, "reclaiming stale orchestration lease");
        }

        tx.execute(
            "INSERT OR REPLACE INTO run_lock (name, holder, acquired_at) VALUES (?, ?, ?)",
            (RUN_LOCK_NAME, holder, format_timestamp(&now)),
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub fn release_run_lock(&self, holder: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM run_lock WHERE name = ? AND holder = ?",
            (RUN_LOCK_NAME, holder),
        )?;
        Ok(())
    }
}

/// `<data_dir>/epicflow.db`, honouring `EPICFLOW_DB`.
pub fn default_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("EPICFLOW_DB") {
        return Ok(PathBuf::from(path));
    }
    let dirs = directories::ProjectDirs::from("", "", "epicflow")
        .ok_or_else(|| FlowError::Storage("could not determine data directory".into()))?;
    Ok(dirs.data_dir().join("epicflow.db"))
}

// ============================================================
// Connection-level helpers (callers hold the lock)
// ============================================================

fn insert_epic(conn: &Connection, input: CreateEpicInput) -> Result<Epic> {
    let name = input.name.trim().to_string();
    if name.is_empty() {
        return Err(FlowError::Validation("epic name must not be empty".into()));
    }

    let id = generate_id("epic");
    let now = now();

    conn.execute(
        &format!("INSERT INTO epics ({EPIC_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"),
        (
            &id,
            &name,
            &input.description,
            input.complexity.as_str(),
            EpicStatus::Planning.as_str(),
            serde_json::to_string(&input.milestones)?,
            format_timestamp(&now),
            format_timestamp(&now),
        ),
    )?;

    Ok(Epic {
        id,
        name,
        description: input.description,
        complexity: input.complexity,
        status: EpicStatus::Planning,
        feature_ids: Vec::new(),
        milestones: input.milestones,
        created_at: now,
        updated_at: now,
    })
}

fn insert_feature(conn: &Connection, epic_id: &str, spec: FeatureSpec) -> Result<Feature> {
    let name = spec.name.trim().to_string();
    if name.is_empty() {
        return Err(FlowError::Validation("feature name must not be empty".into()));
    }
    if query_epic(conn, epic_id)?.is_none() {
        return Err(FlowError::not_found("epic", epic_id));
    }

    let id = generate_id("feature");
    let now = now();
    let position: i64 = conn.query_row(
        "SELECT COALESCE(MAX(position), -1) + 1 FROM features WHERE epic_id = ?",
        [epic_id],
        |row| row.get(0),
    )?;

    conn.execute(
        &format!(
            "INSERT INTO features ({FEATURE_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)"
        ),
        rusqlite::params![
            &id,
            epic_id,
            position,
            &name,
            &spec.description,
            spec.priority.as_str(),
            spec.effort.as_str(),
            Stage::Planning.as_str(),
            Option::<String>::None,
            &spec.acceptance_criteria,
            serde_json::to_string(&spec.files)?,
            serde_json::to_string(&spec.dependencies)?,
            serde_json::to_string(&spec.checklist)?,
            format_timestamp(&now),
            format_timestamp(&now),
        ],
    )?;

    Ok(Feature {
        id,
        epic_id: epic_id.to_string(),
        position,
        name,
        description: spec.description,
        priority: spec.priority,
        effort: spec.effort,
        stage: Stage::Planning,
        assigned_to: None,
        acceptance_criteria: spec.acceptance_criteria,
        files: spec.files,
        dependencies: spec.dependencies,
        checklist: spec.checklist,
        version: 1,
        created_at: now,
        updated_at: now,
    })
}

fn query_epic(conn: &Connection, id: &str) -> Result<Option<Epic>> {
    let mut epic = conn
        .query_row(
            &format!("SELECT {EPIC_COLUMNS} FROM epics WHERE id = ?"),
            [id],
            epic_from_row,
        )
        .optional()?;
    if let Some(epic) = epic.as_mut() {
        epic.feature_ids = query_feature_ids(conn, id)?;
    }
    Ok(epic)
}

fn query_feature_ids(conn: &Connection, epic_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT id FROM features WHERE epic_id = ? ORDER BY position, seq")?;
    let ids = stmt
        .query_map([epic_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(ids)
}

fn query_feature(conn: &Connection, id: &str) -> Result<Option<Feature>> {
    let feature = conn
        .query_row(
            &format!("SELECT {FEATURE_COLUMNS} FROM features WHERE id = ?"),
            [id],
            feature_from_row,
        )
        .optional()?;
    Ok(feature)
}

fn query_tasks<P: rusqlite::Params>(conn: &Connection, clause: &str, params: P) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks {clause}"))?;
    let tasks = stmt
        .query_map(params, task_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(tasks)
}

fn query_events<P: rusqlite::Params>(
    conn: &Connection,
    clause: &str,
    params: P,
) -> Result<Vec<LifecycleEvent>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EVENT_COLUMNS} FROM lifecycle_events {clause}"
    ))?;
    let events = stmt
        .query_map(params, event_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(events)
}

/// Latest event matching `filter` across the live log and the archive.
///
/// `seq` is AUTOINCREMENT and archived rows keep it, so ordering by it spans
/// both tables. Parameters must be numbered (`?1`) since the filter is used twice.
fn query_latest_event<P: rusqlite::Params>(
    conn: &Connection,
    filter: &str,
    params: P,
) -> Result<Option<LifecycleEvent>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EVENT_COLUMNS} FROM lifecycle_events WHERE {filter}
         UNION ALL
         SELECT {EVENT_COLUMNS} FROM lifecycle_events_archive WHERE {filter}
         ORDER BY seq DESC LIMIT 1"
    ))?;
    let event = stmt.query_row(params, event_from_row).optional()?;
    Ok(event)
}

fn count_in_stages(conn: &Connection, stages: &[Stage]) -> Result<usize> {
    let mut total = 0usize;
    for stage in stages {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM features WHERE stage = ?",
            [stage.as_str()],
            |row| row.get(0),
        )?;
        total += count as usize;
    }
    Ok(total)
}

fn query_block_origin(conn: &Connection, feature_id: &str) -> Result<Option<Stage>> {
    let Some(event) = query_latest_event(
        conn,
        "feature_id = ?1 AND action = 'block' AND outcome = 'succeeded'",
        [feature_id],
    )?
    else {
        return Ok(None);
    };
    let origin = event
        .metadata
        .get("origin")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<Stage>().ok());
    Ok(origin)
}

fn insert_event(conn: &Connection, event: NewEvent) -> Result<LifecycleEvent> {
    let id = generate_id("event");
    let now = now();
    conn.execute(
        "INSERT INTO lifecycle_events (id, feature_id, action, outcome, metadata, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        (
            &id,
            &event.feature_id,
            event.action.as_str(),
            event.outcome.as_str(),
            serde_json::to_string(&event.metadata)?,
            format_timestamp(&now),
        ),
    )?;

    Ok(LifecycleEvent {
        id,
        seq: conn.last_insert_rowid(),
        feature_id: event.feature_id,
        action: event.action,
        outcome: event.outcome,
        metadata: event.metadata,
        created_at: now,
    })
}

fn write_stage(conn: &Connection, current: &Feature, new_stage: Stage) -> Result<()> {
    let rows = conn.execute(
        "UPDATE features SET stage = ?, version = version + 1, updated_at = ?
         WHERE id = ? AND version = ?",
        (
            new_stage.as_str(),
            format_timestamp(&now()),
            &current.id,
            current.version,
        ),
    )?;
    if rows == 0 {
        return Err(stale_version(current, current.version));
    }
    Ok(())
}

fn refresh_epic_status(conn: &Connection, epic_id: &str) -> Result<EpicStatus> {
    let mut stmt = conn.prepare("SELECT stage FROM features WHERE epic_id = ?")?;
    let stages = stmt
        .query_map([epic_id], |row| parse_text::<Stage>(0, row.get(0)?))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let status = if !stages.is_empty() && stages.iter().all(|s| *s == Stage::Completed) {
        EpicStatus::Completed
    } else if stages.iter().all(|s| *s == Stage::Planning) {
        EpicStatus::Planning
    } else {
        EpicStatus::Active
    };

    conn.execute(
        "UPDATE epics SET status = ?, updated_at = ? WHERE id = ? AND status != ?",
        (
            status.as_str(),
            format_timestamp(&now()),
            epic_id,
            status.as_str(),
        ),
    )?;
    Ok(status)
}

fn stale_version(current: &Feature, expected: i64) -> FlowError {
    FlowError::Conflict(format!(
        "feature {} was modified concurrently (expected version {expected}, found {})",
        current.id, current.version
    ))
}

fn attach_metadata(metadata: &mut serde_json::Value, key: &str, value: serde_json::Value) {
    if !metadata.is_object() {
        let previous = std::mem::take(metadata);
        *metadata = serde_json::json!({});
        if !previous.is_null() {
            metadata["details"] = previous;
        }
    }
    metadata[key] = value;
}

// ============================================================
// Row mapping
// ============================================================

fn epic_from_row(row: &Row) -> rusqlite::Result<Epic> {
    Ok(Epic {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        complexity: parse_text(3, row.get(3)?)?,
        status: parse_text(4, row.get(4)?)?,
        feature_ids: Vec::new(),
        milestones: parse_json(5, row.get(5)?)?,
        created_at: parse_datetime(6, row.get(6)?)?,
        updated_at: parse_datetime(7, row.get(7)?)?,
    })
}

fn feature_from_row(row: &Row) -> rusqlite::Result<Feature> {
    Ok(Feature {
        id: row.get(0)?,
        epic_id: row.get(1)?,
        position: row.get(2)?,
        name: row.get(3)?,
        description: row.get(4)?,
        priority: parse_text(5, row.get(5)?)?,
        effort: parse_text(6, row.get(6)?)?,
        stage: parse_text(7, row.get(7)?)?,
        assigned_to: row.get(8)?,
        acceptance_criteria: row.get(9)?,
        files: parse_json(10, row.get(10)?)?,
        dependencies: parse_json(11, row.get(11)?)?,
        checklist: parse_json(12, row.get(12)?)?,
        version: row.get(13)?,
        created_at: parse_datetime(14, row.get(14)?)?,
        updated_at: parse_datetime(15, row.get(15)?)?,
    })
}

fn task_from_row(row: &Row) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        feature_id: row.get(1)?,
        stage: parse_text(2, row.get(2)?)?,
        position: row.get(3)?,
        description: row.get(4)?,
        completed: row.get::<_, i64>(5)? != 0,
        created_at: parse_datetime(6, row.get(6)?)?,
    })
}

fn event_from_row(row: &Row) -> rusqlite::Result<LifecycleEvent> {
    Ok(LifecycleEvent {
        seq: row.get(0)?,
        id: row.get(1)?,
        feature_id: row.get(2)?,
        action: parse_text(3, row.get(3)?)?,
        outcome: parse_text(4, row.get(4)?)?,
        metadata: parse_json(5, row.get(5)?)?,
        created_at: parse_datetime(6, row.get(6)?)?,
    })
}

fn parse_text<T>(idx: usize, value: String) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    value
        .parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn parse_json<T: DeserializeOwned>(idx: usize, value: String) -> rusqlite::Result<T> {
    serde_json::from_str(&value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_datetime(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
