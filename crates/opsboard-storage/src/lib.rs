use chrono::{DateTime, Utc};
use opsboard_core::{Task, TaskColumn, TaskCost, TaskPriority, TokenUsage, User};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

pub const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// Partial task update. `None` leaves the stored value alone; for the
/// assignee the outer option decides whether to touch the column at all.
#[derive(Debug, Default, Clone)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub column: Option<TaskColumn>,
    pub priority: Option<TaskPriority>,
    pub tags: Option<Vec<String>>,
    pub assigned_agent: Option<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelCost {
    pub model: String,
    pub amount_usd: f64,
    pub tokens: TokenUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyCost {
    pub day: String,
    pub amount_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostSummary {
    pub total_usd: f64,
    pub by_model: Vec<ModelCost>,
    pub by_day: Vec<DailyCost>,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::prepare(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::prepare(conn)
    }

    fn prepare(conn: Connection) -> Result<Self, StorageError> {
        // Foreign key enforcement is per-connection in sqlite.
        conn.pragma_update(None, "foreign_keys", true)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn upsert_user(&self, user: &User) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO users (user_id, name, email, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(user_id) DO UPDATE SET
                name=excluded.name,
                email=excluded.email
            ",
            params![user.id, user.name, user.email, user.created_at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn user(&self, user_id: &str) -> Result<Option<User>, StorageError> {
        let row = self
            .conn
            .query_row(
                "SELECT user_id, name, email, created_at FROM users WHERE user_id = ?1",
                [user_id],
                user_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn users(&self) -> Result<Vec<User>, StorageError> {
        let mut statement = self.conn.prepare(
            "SELECT user_id, name, email, created_at FROM users ORDER BY created_at ASC, user_id ASC",
        )?;
        let rows = statement.query_map([], user_from_row)?;
        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    /// Cascades to the user's tasks and their costs.
    pub fn delete_user(&self, user_id: &str) -> Result<bool, StorageError> {
        let changes = self
            .conn
            .execute("DELETE FROM users WHERE user_id = ?1", [user_id])?;
        Ok(changes > 0)
    }

    pub fn insert_task(&self, task: &Task) -> Result<(), StorageError> {
        let tags_json = serde_json::to_string(&task.tags)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        self.conn.execute(
            "
            INSERT INTO tasks (
                task_id,
                title,
                description,
                column_name,
                priority,
                tags_json,
                assigned_agent,
                created_by,
                created_at,
                updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
            params![
                task.id,
                task.title,
                task.description,
                task.column.as_str(),
                task.priority.as_str(),
                tags_json,
                task.assigned_agent,
                task.created_by,
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn task(&self, task_id: &str) -> Result<Option<Task>, StorageError> {
        let row = self
            .conn
            .query_row(
                &format!("{TASK_COLUMNS} WHERE task_id = ?1"),
                [task_id],
                task_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn tasks(&self) -> Result<Vec<Task>, StorageError> {
        let mut statement = self
            .conn
            .prepare(&format!("{TASK_COLUMNS} ORDER BY created_at ASC, task_id ASC"))?;
        let rows = statement.query_map([], task_from_row)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    pub fn tasks_in_column(&self, column: TaskColumn) -> Result<Vec<Task>, StorageError> {
        let mut statement = self.conn.prepare(&format!(
            "{TASK_COLUMNS} WHERE column_name = ?1 ORDER BY created_at ASC, task_id ASC"
        ))?;
        let rows = statement.query_map([column.as_str()], task_from_row)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    pub fn update_task(
        &self,
        task_id: &str,
        patch: TaskPatch,
        updated_at: DateTime<Utc>,
    ) -> Result<Option<Task>, StorageError> {
        let Some(mut task) = self.task(task_id)? else {
            return Ok(None);
        };
        if let Some(title) = patch.title {
            task.title = title;
        }
        if let Some(description) = patch.description {
            task.description = description;
        }
        if let Some(column) = patch.column {
            task.column = column;
        }
        if let Some(priority) = patch.priority {
            task.priority = priority;
        }
        if let Some(tags) = patch.tags {
            task.tags = tags;
        }
        if let Some(assigned_agent) = patch.assigned_agent {
            task.assigned_agent = assigned_agent;
        }
        task.updated_at = updated_at;

        let tags_json = serde_json::to_string(&task.tags)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        self.conn.execute(
            "
            UPDATE tasks SET
                title = ?2,
                description = ?3,
                column_name = ?4,
                priority = ?5,
                tags_json = ?6,
                assigned_agent = ?7,
                updated_at = ?8
            WHERE task_id = ?1
            ",
            params![
                task.id,
                task.title,
                task.description,
                task.column.as_str(),
                task.priority.as_str(),
                tags_json,
                task.assigned_agent,
                task.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(Some(task))
    }

    pub fn move_task(
        &self,
        task_id: &str,
        column: TaskColumn,
        updated_at: DateTime<Utc>,
    ) -> Result<Option<Task>, StorageError> {
        self.update_task(
            task_id,
            TaskPatch {
                column: Some(column),
                ..TaskPatch::default()
            },
            updated_at,
        )
    }

    /// Cascades to the task's recorded costs.
    pub fn delete_task(&self, task_id: &str) -> Result<bool, StorageError> {
        let changes = self
            .conn
            .execute("DELETE FROM tasks WHERE task_id = ?1", [task_id])?;
        Ok(changes > 0)
    }

    pub fn insert_cost(&self, cost: &TaskCost) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO task_costs (
                cost_id,
                task_id,
                model,
                input_tokens,
                output_tokens,
                amount_usd,
                recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                cost.id,
                cost.task_id,
                cost.model,
                cost.tokens.input as i64,
                cost.tokens.output as i64,
                cost.amount_usd,
                cost.recorded_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn costs_for_task(&self, task_id: &str) -> Result<Vec<TaskCost>, StorageError> {
        let mut statement = self.conn.prepare(&format!(
            "{COST_COLUMNS} WHERE task_id = ?1 ORDER BY recorded_at ASC, cost_id ASC"
        ))?;
        let rows = statement.query_map([task_id], cost_from_row)?;
        let mut costs = Vec::new();
        for row in rows {
            costs.push(row?);
        }
        Ok(costs)
    }

    pub fn costs(&self) -> Result<Vec<TaskCost>, StorageError> {
        let mut statement = self
            .conn
            .prepare(&format!("{COST_COLUMNS} ORDER BY recorded_at ASC, cost_id ASC"))?;
        let rows = statement.query_map([], cost_from_row)?;
        let mut costs = Vec::new();
        for row in rows {
            costs.push(row?);
        }
        Ok(costs)
    }

    pub fn task_total_cost(&self, task_id: &str) -> Result<f64, StorageError> {
        let total = self.conn.query_row(
            "SELECT COALESCE(SUM(amount_usd), 0.0) FROM task_costs WHERE task_id = ?1",
            [task_id],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    pub fn cost_summary(&self) -> Result<CostSummary, StorageError> {
        let total_usd = self.conn.query_row(
            "SELECT COALESCE(SUM(amount_usd), 0.0) FROM task_costs",
            [],
            |row| row.get(0),
        )?;

        let mut statement = self.conn.prepare(
            "
            SELECT model,
                   SUM(amount_usd),
                   SUM(input_tokens),
                   SUM(output_tokens)
            FROM task_costs
            GROUP BY model
            ORDER BY SUM(amount_usd) DESC, model ASC
            ",
        )?;
        let rows = statement.query_map([], |row| {
            Ok(ModelCost {
                model: row.get(0)?,
                amount_usd: row.get(1)?,
                tokens: TokenUsage {
                    input: row.get::<_, i64>(2)? as u64,
                    output: row.get::<_, i64>(3)? as u64,
                },
            })
        })?;
        let mut by_model = Vec::new();
        for row in rows {
            by_model.push(row?);
        }

        // recorded_at is RFC 3339, so the first ten characters are the date.
        let mut statement = self.conn.prepare(
            "
            SELECT substr(recorded_at, 1, 10) AS day, SUM(amount_usd)
            FROM task_costs
            GROUP BY day
            ORDER BY day ASC
            ",
        )?;
        let rows = statement.query_map([], |row| {
            Ok(DailyCost {
                day: row.get(0)?,
                amount_usd: row.get(1)?,
            })
        })?;
        let mut by_day = Vec::new();
        for row in rows {
            by_day.push(row?);
        }

        Ok(CostSummary {
            total_usd,
            by_model,
            by_day,
        })
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }
}

const TASK_COLUMNS: &str = "
    SELECT task_id, title, description, column_name, priority, tags_json,
           assigned_agent, created_by, created_at, updated_at
    FROM tasks
";

const COST_COLUMNS: &str = "
    SELECT cost_id, task_id, model, input_tokens, output_tokens, amount_usd, recorded_at
    FROM task_costs
";

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        created_at: timestamp_column(row, 3)?,
    })
}

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let column_raw: String = row.get(3)?;
    let column = TaskColumn::from_str(&column_raw)
        .map_err(|err| text_conversion_failure(3, err))?;
    let priority_raw: String = row.get(4)?;
    let priority = TaskPriority::from_str(&priority_raw)
        .map_err(|err| text_conversion_failure(4, err))?;
    let tags_json: String = row.get(5)?;
    let tags: Vec<String> = serde_json::from_str(&tags_json).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(err))
    })?;

    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        column,
        priority,
        tags,
        assigned_agent: row.get(6)?,
        created_by: row.get(7)?,
        created_at: timestamp_column(row, 8)?,
        updated_at: timestamp_column(row, 9)?,
    })
}

fn cost_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskCost> {
    Ok(TaskCost {
        id: row.get(0)?,
        task_id: row.get(1)?,
        model: row.get(2)?,
        tokens: TokenUsage {
            input: row.get::<_, i64>(3)? as u64,
            output: row.get::<_, i64>(4)? as u64,
        },
        amount_usd: row.get(5)?,
        recorded_at: timestamp_column(row, 6)?,
    })
}

fn timestamp_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(index)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                index,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })
}

fn text_conversion_failure(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}
