use std::collections::{BTreeSet, HashMap};

use uuid::Uuid;

use super::{
    enum_from_sql, enum_to_sql, json_from_sql, json_to_sql, opt_ts_from_sql, ts_from_sql,
    ts_to_sql, uuid_from_sql, AuditRow, Store, StoreResult,
};
use crate::types::{AuditEvent, Task, TaskStatus};

const TASK_COLUMNS: &str = "id, project, title, description, priority, status, stage,
    blocked_by, completed, completed_at, created_at, updated_at";

/// A task flattened to SQL values.
struct TaskRow {
    id: String,
    project: String,
    title: String,
    description: Option<String>,
    priority: i64,
    status: String,
    stage: String,
    blocked_by: String,
    completed: bool,
    completed_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TaskRow {
    fn from_task(task: &Task) -> rusqlite::Result<Self> {
        Ok(Self {
            id: task.id.to_string(),
            project: task.project.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            priority: i64::from(task.priority),
            status: enum_to_sql(&task.status)?,
            stage: enum_to_sql(&task.stage)?,
            blocked_by: json_to_sql(&task.blocked_by)?,
            completed: task.completed,
            completed_at: task.completed_at.as_ref().map(ts_to_sql),
            created_at: ts_to_sql(&task.created_at),
            updated_at: ts_to_sql(&task.updated_at),
        })
    }

    fn upsert(&self, conn: &rusqlite::Connection) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO tasks (id, project, title, description, priority, status, stage,
                blocked_by, completed, completed_at, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)
             ON CONFLICT(id) DO UPDATE SET
                project=excluded.project, title=excluded.title,
                description=excluded.description, priority=excluded.priority,
                status=excluded.status, stage=excluded.stage, blocked_by=excluded.blocked_by,
                completed=excluded.completed,
                completed_at=COALESCE(tasks.completed_at, excluded.completed_at),
                updated_at=excluded.updated_at",
            rusqlite::params![
                self.id,
                self.project,
                self.title,
                self.description,
                self.priority,
                self.status,
                self.stage,
                self.blocked_by,
                self.completed,
                self.completed_at,
                self.created_at,
                self.updated_at,
            ],
        )?;
        Ok(())
    }
}

impl Store {
    // -----------------------------------------------------------------------
    // Task CRUD
    // -----------------------------------------------------------------------

    /// Insert or update a task. An already-recorded `completed_at` is never
    /// overwritten or cleared.
    pub async fn upsert_task(&self, task: &Task) -> StoreResult<()> {
        let row = TaskRow::from_task(task)?;
        self.conn
            .call(move |conn| {
                row.upsert(conn)?;
                Ok(())
            })
            .await
    }

    /// Upsert a task and append its audit event in one transaction.
    pub async fn save_task_with_audit(&self, task: &Task, event: &AuditEvent) -> StoreResult<()> {
        let row = TaskRow::from_task(task)?;
        let audit = AuditRow::from_event(event)?;
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                row.upsert(&tx)?;
                audit.insert(&tx)?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    pub async fn get_task(&self, id: Uuid) -> StoreResult<Option<Task>> {
        let id_str = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"))?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_task(row)?)),
                    None => Ok(None),
                }
            })
            .await
    }

    /// Every task of a project in creation order.
    pub async fn list_tasks(&self, project: &str) -> StoreResult<Vec<Task>> {
        let project = project.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE project = ?1
                     ORDER BY created_at ASC, rowid ASC"
                ))?;
                let mut rows = stmt.query(rusqlite::params![project])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_task(row)?);
                }
                Ok(out)
            })
            .await
    }

    /// Non-terminal tasks of a project, highest priority first, then oldest.
    pub async fn list_open_tasks(
        &self,
        project: &str,
        limit: Option<usize>,
    ) -> StoreResult<Vec<Task>> {
        let project = project.to_string();
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE project = ?1 AND status != 'done' AND stage != 'complete'
                     ORDER BY priority DESC, created_at ASC, rowid ASC
                     LIMIT ?2"
                ))?;
                let mut rows = stmt.query(rusqlite::params![project, limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_task(row)?);
                }
                Ok(out)
            })
            .await
    }

    /// The oldest open task in `project` carrying exactly `title`.
    pub async fn find_open_task_by_title(
        &self,
        project: &str,
        title: &str,
    ) -> StoreResult<Option<Task>> {
        let project = project.to_string();
        let title = title.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE project = ?1 AND title = ?2 AND status != 'done'
                     ORDER BY created_at ASC, rowid ASC LIMIT 1"
                ))?;
                let mut rows = stmt.query(rusqlite::params![project, title])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_task(row)?)),
                    None => Ok(None),
                }
            })
            .await
    }

    /// Current status of each referenced task. Unknown ids are absent.
    pub async fn task_statuses(
        &self,
        ids: impl IntoIterator<Item = Uuid>,
    ) -> StoreResult<HashMap<Uuid, TaskStatus>> {
        let ids: Vec<String> = ids.into_iter().map(|id| id.to_string()).collect();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT id, status FROM tasks WHERE id = ?1")?;
                let mut out = HashMap::new();
                for id in ids {
                    let mut rows = stmt.query(rusqlite::params![id])?;
                    if let Some(row) = rows.next()? {
                        let id_str: String = row.get(0)?;
                        let status_str: String = row.get(1)?;
                        out.insert(uuid_from_sql(0, &id_str)?, enum_from_sql(1, &status_str)?);
                    }
                }
                Ok(out)
            })
            .await
    }

    /// Delete a task and append its audit event. Returns `false` when no row existed.
    pub async fn delete_task(&self, id: Uuid, event: &AuditEvent) -> StoreResult<bool> {
        let id_str = id.to_string();
        let audit = AuditRow::from_event(event)?;
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let removed = tx.execute("DELETE FROM tasks WHERE id = ?1", rusqlite::params![id_str])?;
                if removed > 0 {
                    audit.insert(&tx)?;
                }
                tx.commit()?;
                Ok(removed > 0)
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let id_str: String = row.get(0)?;
    let priority: i64 = row.get(4)?;
    let status_str: String = row.get(5)?;
    let stage_str: String = row.get(6)?;
    let blocked_by_str: String = row.get(7)?;
    let completed_at_str: Option<String> = row.get(9)?;
    let created_at_str: String = row.get(10)?;
    let updated_at_str: String = row.get(11)?;

    let blocked_by: BTreeSet<Uuid> = json_from_sql(7, &blocked_by_str)?;

    Ok(Task {
        id: uuid_from_sql(0, &id_str)?,
        project: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        priority: u8::try_from(priority).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Integer, Box::new(e))
        })?,
        status: enum_from_sql(5, &status_str)?,
        stage: enum_from_sql(6, &stage_str)?,
        blocked_by,
        completed: row.get(8)?,
        completed_at: opt_ts_from_sql(9, completed_at_str)?,
        created_at: ts_from_sql(10, &created_at_str)?,
        updated_at: ts_from_sql(11, &updated_at_str)?,
    })
}
