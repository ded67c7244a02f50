//! SQLite-backed [`DataStore`]

use std::path::Path;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{OptionalExtension, params};

use super::{DataStore, schema};
use crate::model::{DataSnapshot, Project, Task};
use crate::{Error, Result};

const SELECTION_KEY: &str = "selected_project";

/// Stores the snapshot in `SQLite`, replacing it wholesale on every save
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or initialized
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path)
            .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON;"));
        Self::from_manager(manager, 4)
    }

    /// Open an in-memory database (for testing)
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be initialized
    pub fn open_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON;"));
        Self::from_manager(manager, 1)
    }

    fn from_manager(manager: SqliteConnectionManager, max_size: u32) -> Result<Self> {
        let pool = Pool::builder()
            .max_size(max_size)
            .build(manager)
            .map_err(|e| Error::Database(e.to_string()))?;

        let conn = pool.get().map_err(|e| Error::Database(e.to_string()))?;
        schema::init(&conn)?;

        tracing::info!(version = schema::SCHEMA_VERSION, "database initialized");
        Ok(Self { pool })
    }
}

impl DataStore for SqliteStore {
    fn load(&self) -> Result<DataSnapshot> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut snapshot = DataSnapshot::default();

        let mut stmt =
            conn.prepare("SELECT id, name, color, details FROM projects ORDER BY position")?;
        let projects = stmt.query_map([], |row| {
            Ok(Project {
                id: row.get(0)?,
                name: row.get(1)?,
                color: row.get(2)?,
                details: row.get(3)?,
                tasks: Vec::new(),
            })
        })?;
        for project in projects {
            snapshot.projects.push(project?);
        }

        let mut stmt = conn.prepare(
            "SELECT project_id, id, title, done FROM tasks ORDER BY project_id, position",
        )?;
        let tasks = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                Task {
                    id: row.get(1)?,
                    title: row.get(2)?,
                    done: row.get::<_, i64>(3)? != 0,
                },
            ))
        })?;
        for row in tasks {
            let (project_id, task) = row?;
            if let Some(idx) = snapshot.project_index(&project_id) {
                snapshot.projects[idx].tasks.push(task);
            }
        }

        let mut stmt =
            conn.prepare("SELECT date, task_id FROM calendar_entries ORDER BY date, position")?;
        let entries = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for entry in entries {
            let (date, task_id) = entry?;
            snapshot.calendar.entry(date).or_default().push(task_id);
        }

        let selected: Option<Option<String>> = conn
            .query_row(
                "SELECT value FROM app_state WHERE key = ?1",
                [SELECTION_KEY],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = selected.flatten() {
            if snapshot.project_index(&id).is_some() {
                snapshot.selection.set(id);
            }
        }

        Ok(snapshot)
    }

    fn save(&self, snapshot: &DataSnapshot) -> Result<()> {
        let mut conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let tx = conn.transaction()?;
        tx.execute_batch(
            "DELETE FROM calendar_entries; DELETE FROM tasks; DELETE FROM projects;",
        )?;

        for (p_pos, project) in snapshot.projects.iter().enumerate() {
            tx.execute(
                "INSERT INTO projects (id, position, name, color, details) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![project.id, p_pos, project.name, project.color, project.details],
            )?;
            for (t_pos, task) in project.tasks.iter().enumerate() {
                tx.execute(
                    "INSERT INTO tasks (id, project_id, position, title, done) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![task.id, project.id, t_pos, task.title, task.done],
                )?;
            }
        }

        for (date, ids) in &snapshot.calendar {
            for (pos, task_id) in ids.iter().enumerate() {
                tx.execute(
                    "INSERT INTO calendar_entries (date, task_id, position) VALUES (?1, ?2, ?3)",
                    params![date, task_id, pos],
                )?;
            }
        }

        tx.execute(
            "INSERT INTO app_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![SELECTION_KEY, snapshot.selection.id()],
        )?;

        tx.commit()?;
        tracing::debug!(projects = snapshot.projects.len(), "snapshot saved");
        Ok(())
    }
}
