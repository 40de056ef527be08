use uuid::Uuid;

use super::{
    enum_from_sql, enum_to_sql, json_from_sql, json_to_sql, ts_from_sql, ts_to_sql,
    uuid_from_sql, AuditRow, Store, StoreResult,
};
use crate::types::{AgentReport, AgentRole, AuditEvent, Run, RunState};

impl Store {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Insert a new run together with its creation audit event.
    pub async fn insert_run(&self, run: &Run, event: &AuditEvent) -> StoreResult<()> {
        let id = run.id.to_string();
        let project = run.project.clone();
        let title = run.title.clone();
        let state = enum_to_sql(&run.state)?;
        let created_at = ts_to_sql(&run.created_at);
        let updated_at = ts_to_sql(&run.updated_at);
        let audit = AuditRow::from_event(event)?;

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO runs (id, project, title, state, created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6)",
                    rusqlite::params![id, project, title, state, created_at, updated_at],
                )?;
                audit.insert(&tx)?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    pub async fn get_run(&self, id: Uuid) -> StoreResult<Option<Run>> {
        let id_str = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, project, title, state, created_at, updated_at
                     FROM runs WHERE id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_run(row)?)),
                    None => Ok(None),
                }
            })
            .await
    }

    /// Runs that have not reached `Deployed`, oldest first.
    pub async fn list_active_runs(&self) -> StoreResult<Vec<Run>> {
        let deployed = enum_to_sql(&RunState::Deployed)?;
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, project, title, state, created_at, updated_at
                     FROM runs WHERE state != ?1 ORDER BY created_at ASC, rowid ASC",
                )?;
                let mut rows = stmt.query(rusqlite::params![deployed])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_run(row)?);
                }
                Ok(out)
            })
            .await
    }

    /// Move a run from `from` to `to` and record the audit event atomically.
    ///
    /// Returns `false` without writing anything when the run is no longer in
    /// `from` (or does not exist).
    pub async fn transition_run(
        &self,
        id: Uuid,
        from: RunState,
        to: RunState,
        event: &AuditEvent,
    ) -> StoreResult<bool> {
        let id_str = id.to_string();
        let from_str = enum_to_sql(&from)?;
        let to_str = enum_to_sql(&to)?;
        let updated_at = ts_to_sql(&event.timestamp);
        let audit = AuditRow::from_event(event)?;

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let changed = tx.execute(
                    "UPDATE runs SET state = ?1, updated_at = ?2 WHERE id = ?3 AND state = ?4",
                    rusqlite::params![to_str, updated_at, id_str, from_str],
                )?;
                if changed == 1 {
                    audit.insert(&tx)?;
                }
                tx.commit()?;
                Ok(changed == 1)
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Reports
    // -----------------------------------------------------------------------

    pub async fn insert_report(&self, report: &AgentReport, event: &AuditEvent) -> StoreResult<()> {
        let id = report.id.to_string();
        let run_id = report.run_id.to_string();
        let role = enum_to_sql(&report.role)?;
        let status = enum_to_sql(&report.status)?;
        let summary = report.summary.clone();
        let details = json_to_sql(&report.details)?;
        let created_at = ts_to_sql(&report.created_at);
        let audit = AuditRow::from_event(event)?;

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO reports (id, run_id, role, status, summary, details, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7)",
                    rusqlite::params![id, run_id, role, status, summary, details, created_at],
                )?;
                audit.insert(&tx)?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Most recently submitted report for `role` on a run.
    pub async fn latest_report(
        &self,
        run_id: Uuid,
        role: AgentRole,
    ) -> StoreResult<Option<AgentReport>> {
        let run_id = run_id.to_string();
        let role = enum_to_sql(&role)?;
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, run_id, role, status, summary, details, created_at
                     FROM reports WHERE run_id = ?1 AND role = ?2
                     ORDER BY created_at DESC, rowid DESC LIMIT 1",
                )?;
                let mut rows = stmt.query(rusqlite::params![run_id, role])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_report(row)?)),
                    None => Ok(None),
                }
            })
            .await
    }

    pub async fn list_reports(&self, run_id: Uuid) -> StoreResult<Vec<AgentReport>> {
        let run_id = run_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, run_id, role, status, summary, details, created_at
                     FROM reports WHERE run_id = ?1 ORDER BY created_at ASC, rowid ASC",
                )?;
                let mut rows = stmt.query(rusqlite::params![run_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_report(row)?);
                }
                Ok(out)
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let id_str: String = row.get(0)?;
    let state_str: String = row.get(3)?;
    let created_at_str: String = row.get(4)?;
    let updated_at_str: String = row.get(5)?;

    Ok(Run {
        id: uuid_from_sql(0, &id_str)?,
        project: row.get(1)?,
        title: row.get(2)?,
        state: enum_from_sql(3, &state_str)?,
        created_at: ts_from_sql(4, &created_at_str)?,
        updated_at: ts_from_sql(5, &updated_at_str)?,
    })
}

fn row_to_report(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentReport> {
    let id_str: String = row.get(0)?;
    let run_id_str: String = row.get(1)?;
    let role_str: String = row.get(2)?;
    let status_str: String = row.get(3)?;
    let details_str: String = row.get(5)?;
    let created_at_str: String = row.get(6)?;

    Ok(AgentReport {
        id: uuid_from_sql(0, &id_str)?,
        run_id: uuid_from_sql(1, &run_id_str)?,
        role: enum_from_sql(2, &role_str)?,
        status: enum_from_sql(3, &status_str)?,
        summary: row.get(4)?,
        details: json_from_sql(5, &details_str)?,
        created_at: ts_from_sql(6, &created_at_str)?,
    })
}
