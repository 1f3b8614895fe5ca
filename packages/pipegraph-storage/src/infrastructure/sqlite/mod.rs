//! SQLite adapter for ProvenanceGraph
//!
//! Schema mirrors the domain models: one table per entity plus child tables
//! for ordered lists (unit inputs, record outputs, source feeds) and file
//! metadata. Row ids double as domain ids.

use chrono::DateTime;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::domain::{
    DataSource, File, FileId, InputUnit, InstanceId, JobStats, Page, PipelineInstance,
    ProvenanceGraph, RecordId, SourceId, SourceKind, StageMember, StageRecord, UnitId, UnitLink,
    UpstreamFeed,
};
use crate::error::{ErrorKind, Result, StorageError};
use crate::infrastructure::memory::GraphSnapshot;

const RECORD_COLUMNS: &str = "record_id, instance_id, unit_id, position, complete, command, \
     wall_time_secs, cpu_time_secs, exit_status, completed_at";

/// SQLite-based ProvenanceGraph implementation
#[derive(Clone)]
pub struct SqliteProvenanceGraph {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteProvenanceGraph {
    /// Open (or create) a graph database at the given path
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory graph database (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StorageError::database("SQLite connection mutex poisoned"))
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sources (
                source_id INTEGER PRIMARY KEY,
                kind TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS source_feeds (
                source_id INTEGER NOT NULL,
                seq INTEGER NOT NULL,
                upstream_instance_id INTEGER NOT NULL,
                position INTEGER NOT NULL,
                PRIMARY KEY (source_id, seq),
                FOREIGN KEY (source_id) REFERENCES sources(source_id)
            );

            CREATE TABLE IF NOT EXISTS instances (
                instance_id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                source_id INTEGER NOT NULL,
                FOREIGN KEY (source_id) REFERENCES sources(source_id)
            );

            CREATE TABLE IF NOT EXISTS members (
                instance_id INTEGER NOT NULL,
                position INTEGER NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                PRIMARY KEY (instance_id, position),
                FOREIGN KEY (instance_id) REFERENCES instances(instance_id)
            );

            CREATE TABLE IF NOT EXISTS units (
                unit_id INTEGER PRIMARY KEY,
                source_id INTEGER NOT NULL,
                withdrawn BOOLEAN NOT NULL DEFAULT 0,
                FOREIGN KEY (source_id) REFERENCES sources(source_id)
            );

            CREATE INDEX IF NOT EXISTS idx_units_source
             ON units(source_id, withdrawn);

            CREATE TABLE IF NOT EXISTS unit_inputs (
                unit_id INTEGER NOT NULL,
                seq INTEGER NOT NULL,
                path TEXT NOT NULL,
                PRIMARY KEY (unit_id, seq),
                FOREIGN KEY (unit_id) REFERENCES units(unit_id)
            );

            CREATE TABLE IF NOT EXISTS files (
                file_id INTEGER PRIMARY KEY,
                path TEXT NOT NULL,
                size INTEGER NOT NULL DEFAULT 0,
                exists_on_disk BOOLEAN NOT NULL DEFAULT 0,
                checksum TEXT,
                moved_to INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_files_path ON files(path);
            CREATE INDEX IF NOT EXISTS idx_files_moved_to ON files(moved_to);

            CREATE TABLE IF NOT EXISTS file_metadata (
                file_id INTEGER NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (file_id, key),
                FOREIGN KEY (file_id) REFERENCES files(file_id)
            );

            CREATE INDEX IF NOT EXISTS idx_file_metadata_key ON file_metadata(key);

            CREATE TABLE IF NOT EXISTS records (
                record_id INTEGER PRIMARY KEY,
                instance_id INTEGER NOT NULL,
                unit_id INTEGER NOT NULL,
                position INTEGER NOT NULL,
                complete BOOLEAN NOT NULL DEFAULT 1,
                command TEXT,
                wall_time_secs REAL,
                cpu_time_secs REAL,
                exit_status INTEGER,
                completed_at INTEGER,
                UNIQUE (instance_id, unit_id, position)
            );

            CREATE TABLE IF NOT EXISTS record_outputs (
                record_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                seq INTEGER NOT NULL,
                file_id INTEGER NOT NULL,
                PRIMARY KEY (record_id, kind, seq),
                FOREIGN KEY (record_id) REFERENCES records(record_id)
            );

            CREATE INDEX IF NOT EXISTS idx_record_outputs_file
             ON record_outputs(file_id);

            CREATE TABLE IF NOT EXISTS unit_links (
                link_id INTEGER PRIMARY KEY AUTOINCREMENT,
                parent_unit_id INTEGER NOT NULL,
                child_unit_id INTEGER NOT NULL,
                upstream_instance_id INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_unit_links_child
             ON unit_links(child_unit_id);",
        )?;

        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Writers (used by importers and tests; the output engine never writes)
    // ═══════════════════════════════════════════════════════════════════════

    pub fn insert_source(&self, source: &DataSource) -> Result<()> {
        write_source(&*self.conn()?, source)
    }

    pub fn insert_instance(&self, instance: &PipelineInstance) -> Result<()> {
        write_instance(&*self.conn()?, instance)
    }

    pub fn insert_unit(&self, unit: &InputUnit) -> Result<()> {
        write_unit(&*self.conn()?, unit)
    }

    pub fn insert_file(&self, file: &File) -> Result<()> {
        write_file(&*self.conn()?, file)
    }

    pub fn insert_record(&self, record: &StageRecord) -> Result<()> {
        write_record(&*self.conn()?, record)
    }

    pub fn insert_link(&self, link: &UnitLink) -> Result<()> {
        write_link(&*self.conn()?, link)
    }

    /// Import a whole snapshot in one transaction
    pub fn import_snapshot(&self, snapshot: &GraphSnapshot) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for source in &snapshot.sources {
            write_source(&tx, source)?;
        }
        for instance in &snapshot.instances {
            write_instance(&tx, instance)?;
        }
        for unit in &snapshot.units {
            write_unit(&tx, unit)?;
        }
        for file in &snapshot.files {
            write_file(&tx, file)?;
        }
        for record in &snapshot.records {
            write_record(&tx, record)?;
        }
        for link in &snapshot.links {
            write_link(&tx, link)?;
        }
        tx.commit()?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Row writers
// ═══════════════════════════════════════════════════════════════════════════

fn write_source(conn: &Connection, source: &DataSource) -> Result<()> {
    let kind = if source.is_derived() { "derived" } else { "fixed" };
    conn.execute(
        "INSERT OR REPLACE INTO sources (source_id, kind) VALUES (?1, ?2)",
        params![source.id.0, kind],
    )?;
    conn.execute(
        "DELETE FROM source_feeds WHERE source_id = ?1",
        params![source.id.0],
    )?;
    if let SourceKind::Derived { feeds } = &source.kind {
        for (seq, feed) in feeds.iter().enumerate() {
            conn.execute(
                "INSERT INTO source_feeds (source_id, seq, upstream_instance_id, position)
                 VALUES (?1, ?2, ?3, ?4)",
                params![source.id.0, seq as i64, feed.instance.0, feed.position],
            )?;
        }
    }
    Ok(())
}

fn write_instance(conn: &Connection, instance: &PipelineInstance) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO instances (instance_id, name, source_id) VALUES (?1, ?2, ?3)",
        params![instance.id.0, &instance.name, instance.source.0],
    )?;
    conn.execute(
        "DELETE FROM members WHERE instance_id = ?1",
        params![instance.id.0],
    )?;
    for member in &instance.members {
        conn.execute(
            "INSERT INTO members (instance_id, position, name, description)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                instance.id.0,
                member.position,
                &member.name,
                &member.description
            ],
        )?;
    }
    Ok(())
}

fn write_unit(conn: &Connection, unit: &InputUnit) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO units (unit_id, source_id, withdrawn) VALUES (?1, ?2, ?3)",
        params![unit.id.0, unit.source.0, unit.withdrawn],
    )?;
    conn.execute(
        "DELETE FROM unit_inputs WHERE unit_id = ?1",
        params![unit.id.0],
    )?;
    for (seq, path) in unit.inputs.iter().enumerate() {
        conn.execute(
            "INSERT INTO unit_inputs (unit_id, seq, path) VALUES (?1, ?2, ?3)",
            params![unit.id.0, seq as i64, path.to_string_lossy().into_owned()],
        )?;
    }
    Ok(())
}

fn write_file(conn: &Connection, file: &File) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO files (file_id, path, size, exists_on_disk, checksum, moved_to)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            file.id.0,
            file.path.to_string_lossy().into_owned(),
            file.size as i64,
            file.exists,
            &file.checksum,
            file.moved_to.map(|id| id.0)
        ],
    )?;
    conn.execute(
        "DELETE FROM file_metadata WHERE file_id = ?1",
        params![file.id.0],
    )?;
    for (key, value) in &file.metadata {
        conn.execute(
            "INSERT INTO file_metadata (file_id, key, value) VALUES (?1, ?2, ?3)",
            params![file.id.0, key, value],
        )?;
    }
    Ok(())
}

fn write_record(conn: &Connection, record: &StageRecord) -> Result<()> {
    // One record per (instance, unit, position); a re-run replaces the old row
    let previous: Option<i64> = conn
        .query_row(
            "SELECT record_id FROM records WHERE instance_id = ?1 AND unit_id = ?2 AND position = ?3",
            params![record.instance.0, record.unit.0, record.position],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(previous) = previous {
        conn.execute(
            "DELETE FROM record_outputs WHERE record_id = ?1",
            params![previous],
        )?;
        conn.execute("DELETE FROM records WHERE record_id = ?1", params![previous])?;
    }
    conn.execute(
        "DELETE FROM record_outputs WHERE record_id = ?1",
        params![record.id.0],
    )?;

    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO records ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            RECORD_COLUMNS
        ),
        params![
            record.id.0,
            record.instance.0,
            record.unit.0,
            record.position,
            record.complete,
            &record.command,
            record.job.as_ref().map(|job| job.wall_time_secs),
            record.job.as_ref().map(|job| job.cpu_time_secs),
            record.job.as_ref().map(|job| job.exit_status),
            record.completed_at.map(|at| at.timestamp())
        ],
    )?;
    for (kind, files) in &record.outputs {
        for (seq, file) in files.iter().enumerate() {
            conn.execute(
                "INSERT INTO record_outputs (record_id, kind, seq, file_id) VALUES (?1, ?2, ?3, ?4)",
                params![record.id.0, kind, seq as i64, file.0],
            )?;
        }
    }
    Ok(())
}

fn write_link(conn: &Connection, link: &UnitLink) -> Result<()> {
    conn.execute(
        "INSERT INTO unit_links (parent_unit_id, child_unit_id, upstream_instance_id)
         VALUES (?1, ?2, ?3)",
        params![link.parent.0, link.child.0, link.upstream_instance.0],
    )?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Row readers
// ═══════════════════════════════════════════════════════════════════════════

fn read_file(conn: &Connection, id: FileId) -> Result<Option<File>> {
    let file = conn
        .query_row(
            "SELECT file_id, path, size, exists_on_disk, checksum, moved_to FROM files WHERE file_id = ?1",
            params![id.0],
            file_from_row,
        )
        .optional()?;
    match file {
        Some(file) => Ok(Some(with_file_metadata(conn, file)?)),
        None => Ok(None),
    }
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<File> {
    let path: String = row.get(1)?;
    let size: i64 = row.get(2)?;
    Ok(File {
        id: FileId(row.get(0)?),
        path: PathBuf::from(path),
        size: size.max(0) as u64,
        exists: row.get(3)?,
        checksum: row.get(4)?,
        metadata: BTreeMap::new(),
        moved_to: row.get::<_, Option<i64>>(5)?.map(FileId),
    })
}

fn with_file_metadata(conn: &Connection, mut file: File) -> Result<File> {
    let mut stmt = conn.prepare("SELECT key, value FROM file_metadata WHERE file_id = ?1")?;
    let pairs = stmt
        .query_map(params![file.id.0], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    file.metadata.extend(pairs);
    Ok(file)
}

fn read_files(conn: &Connection, sql: &str, param: &dyn rusqlite::ToSql) -> Result<Vec<File>> {
    let mut stmt = conn.prepare(sql)?;
    let files = stmt
        .query_map([param], file_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    files
        .into_iter()
        .map(|file| with_file_metadata(conn, file))
        .collect()
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<StageRecord> {
    let wall: Option<f64> = row.get(6)?;
    let cpu: Option<f64> = row.get(7)?;
    let exit: Option<i32> = row.get(8)?;
    let job = match (wall, cpu, exit) {
        (Some(wall_time_secs), Some(cpu_time_secs), Some(exit_status)) => Some(JobStats {
            wall_time_secs,
            cpu_time_secs,
            exit_status,
        }),
        _ => None,
    };
    Ok(StageRecord {
        id: RecordId(row.get(0)?),
        instance: InstanceId(row.get(1)?),
        unit: UnitId(row.get(2)?),
        position: row.get(3)?,
        complete: row.get(4)?,
        outputs: BTreeMap::new(),
        command: row.get(5)?,
        job,
        completed_at: row
            .get::<_, Option<i64>>(9)?
            .and_then(|ts| DateTime::from_timestamp(ts, 0)),
    })
}

fn with_record_outputs(conn: &Connection, mut record: StageRecord) -> Result<StageRecord> {
    let mut stmt = conn.prepare(
        "SELECT kind, file_id FROM record_outputs WHERE record_id = ?1 ORDER BY kind, seq",
    )?;
    let outputs = stmt
        .query_map(params![record.id.0], |row| {
            Ok((row.get::<_, String>(0)?, FileId(row.get(1)?)))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for (kind, file) in outputs {
        record.outputs.entry(kind).or_default().push(file);
    }
    Ok(record)
}

fn read_instance(
    conn: &Connection,
    row_filter: &str,
    param: &dyn rusqlite::ToSql,
) -> Result<Option<PipelineInstance>> {
    let instance = conn
        .query_row(
            &format!(
                "SELECT instance_id, name, source_id FROM instances WHERE {}",
                row_filter
            ),
            [param],
            |row| {
                Ok(PipelineInstance {
                    id: InstanceId(row.get(0)?),
                    name: row.get(1)?,
                    source: SourceId(row.get(2)?),
                    members: Vec::new(),
                })
            },
        )
        .optional()?;

    let Some(mut instance) = instance else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT position, name, description FROM members WHERE instance_id = ?1 ORDER BY position",
    )?;
    instance.members = stmt
        .query_map(params![instance.id.0], |row| {
            Ok(StageMember {
                position: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(Some(instance))
}

fn unit_inputs(conn: &Connection, unit: UnitId) -> Result<Vec<PathBuf>> {
    let mut stmt = conn.prepare("SELECT path FROM unit_inputs WHERE unit_id = ?1 ORDER BY seq")?;
    let paths = stmt
        .query_map(params![unit.0], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(paths.into_iter().map(PathBuf::from).collect())
}

impl ProvenanceGraph for SqliteProvenanceGraph {
    fn instance(&self, id: InstanceId) -> Result<PipelineInstance> {
        let conn = self.conn()?;
        read_instance(&conn, "instance_id = ?1", &id.0)?
            .ok_or_else(|| StorageError::instance_not_found(id))
    }

    fn instance_by_name(&self, name: &str) -> Result<PipelineInstance> {
        let conn = self.conn()?;
        read_instance(&conn, "name = ?1", &name)?
            .ok_or_else(|| StorageError::instance_not_found(name))
    }

    fn source(&self, id: SourceId) -> Result<DataSource> {
        let conn = self.conn()?;
        let kind: Option<String> = conn
            .query_row(
                "SELECT kind FROM sources WHERE source_id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()?;
        let kind = kind.ok_or_else(|| {
            StorageError::new(ErrorKind::Config, format!("Data source not found: {}", id))
        })?;

        if kind != "derived" {
            return Ok(DataSource::fixed(id));
        }

        let mut stmt = conn.prepare(
            "SELECT upstream_instance_id, position FROM source_feeds WHERE source_id = ?1 ORDER BY seq",
        )?;
        let feeds = stmt
            .query_map(params![id.0], |row| {
                Ok(UpstreamFeed {
                    instance: InstanceId(row.get(0)?),
                    position: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(DataSource::derived(id, feeds))
    }

    fn unit(&self, id: UnitId) -> Result<InputUnit> {
        let conn = self.conn()?;
        let unit = conn
            .query_row(
                "SELECT unit_id, source_id, withdrawn FROM units WHERE unit_id = ?1",
                params![id.0],
                |row| {
                    Ok(InputUnit {
                        id: UnitId(row.get(0)?),
                        source: SourceId(row.get(1)?),
                        inputs: Vec::new(),
                        withdrawn: row.get(2)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| StorageError::unit_not_found(id))?;
        Ok(InputUnit {
            inputs: unit_inputs(&conn, unit.id)?,
            ..unit
        })
    }

    fn list_units(
        &self,
        source: SourceId,
        include_withdrawn: bool,
        page: Page,
    ) -> Result<Vec<InputUnit>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT unit_id, source_id, withdrawn FROM units
             WHERE source_id = ?1 AND (?2 OR withdrawn = 0)
             ORDER BY unit_id LIMIT ?3 OFFSET ?4",
        )?;
        let units = stmt
            .query_map(
                params![
                    source.0,
                    include_withdrawn,
                    page.limit as i64,
                    page.offset as i64
                ],
                |row| {
                    Ok(InputUnit {
                        id: UnitId(row.get(0)?),
                        source: SourceId(row.get(1)?),
                        inputs: Vec::new(),
                        withdrawn: row.get(2)?,
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        units
            .into_iter()
            .map(|unit| {
                Ok(InputUnit {
                    inputs: unit_inputs(&conn, unit.id)?,
                    ..unit
                })
            })
            .collect()
    }

    fn links_to_child(&self, child: UnitId) -> Result<Vec<UnitLink>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT parent_unit_id, child_unit_id, upstream_instance_id FROM unit_links
             WHERE child_unit_id = ?1 ORDER BY link_id",
        )?;
        let links = stmt
            .query_map(params![child.0], |row| {
                Ok(UnitLink {
                    parent: UnitId(row.get(0)?),
                    child: UnitId(row.get(1)?),
                    upstream_instance: InstanceId(row.get(2)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(links)
    }

    fn stage_record(
        &self,
        instance: InstanceId,
        unit: UnitId,
        position: u32,
        include_incomplete: bool,
    ) -> Result<Option<StageRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {} FROM records
                     WHERE instance_id = ?1 AND unit_id = ?2 AND position = ?3 AND (?4 OR complete = 1)",
                    RECORD_COLUMNS
                ),
                params![instance.0, unit.0, position, include_incomplete],
                record_from_row,
            )
            .optional()?;
        match record {
            Some(record) => Ok(Some(with_record_outputs(&conn, record)?)),
            None => Ok(None),
        }
    }

    fn producers_of(&self, file: FileId) -> Result<Vec<StageRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM records WHERE record_id IN
             (SELECT record_id FROM record_outputs WHERE file_id = ?1)
             ORDER BY record_id",
            RECORD_COLUMNS
        ))?;
        let records = stmt
            .query_map(params![file.0], record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        records
            .into_iter()
            .map(|record| with_record_outputs(&conn, record))
            .collect()
    }

    fn file(&self, id: FileId) -> Result<File> {
        let conn = self.conn()?;
        read_file(&conn, id)?.ok_or_else(|| StorageError::file_not_found(id))
    }

    fn file_by_path(&self, path: &Path) -> Result<Option<File>> {
        let conn = self.conn()?;
        let path = path.to_string_lossy().to_string();
        let files = read_files(
            &conn,
            "SELECT file_id, path, size, exists_on_disk, checksum, moved_to FROM files
             WHERE path = ?1 ORDER BY file_id LIMIT 1",
            &path,
        )?;
        Ok(files.into_iter().next())
    }

    fn files_replaced_by(&self, target: FileId) -> Result<Vec<File>> {
        let conn = self.conn()?;
        read_files(
            &conn,
            "SELECT file_id, path, size, exists_on_disk, checksum, moved_to FROM files
             WHERE moved_to = ?1 ORDER BY file_id",
            &target.0,
        )
    }

    fn files_with_metadata_key(&self, key: &str) -> Result<Vec<File>> {
        let conn = self.conn()?;
        read_files(
            &conn,
            "SELECT file_id, path, size, exists_on_disk, checksum, moved_to FROM files
             WHERE file_id IN (SELECT file_id FROM file_metadata WHERE key = ?1)
             ORDER BY file_id",
            &key,
        )
    }
}
