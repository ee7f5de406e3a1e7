use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, Row};

use crate::config::Config;

/// One finished research run.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub id: i64,
    pub query: String,
    pub report_title: String,
    pub report_path: String,
    pub paragraphs: i64,
    pub created_at: i64,
}

pub fn default_db_path() -> PathBuf {
    Config::get_config_dir().join("history.sqlite")
}

fn open(db: &Path) -> anyhow::Result<Connection> {
    if let Some(dir) = db.parent() {
        std::fs::create_dir_all(dir)?;
    }
    Ok(Connection::open(db)?)
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<HistoryEntry> {
    Ok(HistoryEntry {
        id: row.get(0)?,
        query: row.get(1)?,
        report_title: row.get(2)?,
        report_path: row.get(3)?,
        paragraphs: row.get(4)?,
        created_at: row.get(5)?,
    })
}

pub fn init(db: &Path) -> anyhow::Result<()> {
    let conn = open(db)?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            query TEXT NOT NULL,
            report_title TEXT NOT NULL,
            report_path TEXT NOT NULL,
            paragraphs INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )",
        [],
    )?;
    Ok(())
}

pub fn add_entry(db: &Path, query: &str, report_title: &str, report_path: &Path, paragraphs: usize) -> anyhow::Result<i64> {
    let conn = open(db)?;
    let now = chrono::Utc::now().timestamp();
    conn.execute(
        "INSERT INTO runs (query, report_title, report_path, paragraphs, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            query,
            report_title,
            report_path.to_string_lossy().into_owned(),
            paragraphs as i64,
            now
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Most recent first.
pub fn list_entries(db: &Path, limit: usize) -> anyhow::Result<Vec<HistoryEntry>> {
    let conn = open(db)?;
    let mut stmt = conn.prepare(
        "SELECT id, query, report_title, report_path, paragraphs, created_at
         FROM runs
         ORDER BY created_at DESC, id DESC
         LIMIT ?1",
    )?;
    let rows = stmt.query_map([limit as i64], entry_from_row)?;

    let mut entries = Vec::new();
    for r in rows {
        entries.push(r?);
    }
    Ok(entries)
}

pub fn get_entry(db: &Path, id: i64) -> anyhow::Result<Option<HistoryEntry>> {
    let conn = open(db)?;
    let mut stmt = conn.prepare(
        "SELECT id, query, report_title, report_path, paragraphs, created_at FROM runs WHERE id = ?1",
    )?;
    let mut rows = stmt.query([id])?;
    if let Some(row) = rows.next()? {
        Ok(Some(entry_from_row(row)?))
    } else {
        Ok(None)
    }
}

/// Returns whether a row was removed.
pub fn delete_entry(db: &Path, id: i64) -> anyhow::Result<bool> {
    let conn = open(db)?;
    let removed = conn.execute("DELETE FROM runs WHERE id = ?1", params![id])?;
    Ok(removed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_history_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("nested/history.sqlite");
        init(&db).unwrap();

        let first = add_entry(&db, "电动汽车", "关于'电动汽车'的深度研究报告", Path::new("reports/a.md"), 3).unwrap();
        let second = add_entry(&db, "储能", "关于'储能'的深度研究报告", Path::new("reports/b.md"), 2).unwrap();

        let entries = list_entries(&db, 10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, second);
        assert_eq!(entries[1].query, "电动汽车");
        assert_eq!(list_entries(&db, 1).unwrap().len(), 1);

        let entry = get_entry(&db, first).unwrap().unwrap();
        assert_eq!(entry.report_path, "reports/a.md");
        assert_eq!(entry.paragraphs, 3);

        assert!(delete_entry(&db, first).unwrap());
        assert!(!delete_entry(&db, first).unwrap());
        assert_eq!(get_entry(&db, first).unwrap(), None);
    }
}
