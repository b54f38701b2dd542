//! SQLite store of the loaded variants, samples and genotype calls.
//!
//! The store is written to a temporary file next to the destination and only
//! renamed into place by `Store::finalize`, after all rows are written and
//! the secondary indexes are built.  Until then the destination is guarded
//! by a lock file.

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use rusqlite::{params, params_from_iter, types::Value, Connection};
use tempfile::NamedTempFile;

use crate::{
    annos::{AnnoValue, ResourceInfo},
    common::worker_version,
    err::StorageError,
    load::{
        merge::{FailedChunk, GenotypeSummary},
        ped::Sample,
        record::GenotypeCall,
        worker::AnnotatedVariant,
    },
};

/// Fixed columns of the `variants` table; annotation columns must not clash.
pub const VARIANT_COLUMNS: &[&str] = &[
    "variant_id",
    "chrom",
    "chrom_key",
    "start",
    "end",
    "vcf_id",
    "ref",
    "alt",
    "qual",
    "filter",
    "type",
    "sub_type",
    "gene",
    "transcript",
    "consequence",
    "impact",
    "hgvs_c",
    "hgvs_p",
    "num_effects",
    "num_hom_ref",
    "num_het",
    "num_hom_alt",
    "num_unknown",
    "call_rate",
    "aaf",
    "info",
];

/// Final state of a load as recorded in `load_info`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum LoadStatus {
    /// Rows are being written.
    Loading,
    /// All chunks were loaded.
    Complete,
    /// Some chunks failed and are listed in `failed_chunks`.
    Partial,
}

/// Quote an identifier for use in SQL.
fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Exclusive lock on the destination, removed on drop.
///
/// The lock file holds the id of the owning process.  A lock whose owner no
/// longer runs is left over from a killed load and is taken over.
#[derive(Debug)]
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(path_out: &Path) -> Result<Self, StorageError> {
        let path = PathBuf::from(format!("{}.lock", path_out.display()));
        match Self::create(&path) {
            Err(StorageError::Io(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let owner = std::fs::read_to_string(&path)
                    .ok()
                    .and_then(|text| text.trim().parse::<i32>().ok());
                match owner {
                    Some(pid) if procfs::process::Process::new(pid).is_err() => {
                        tracing::warn!(
                            "removing stale lock file {:?} of process {} that no longer runs",
                            &path,
                            pid
                        );
                        std::fs::remove_file(&path)?;
                        Self::create(&path)
                    }
                    _ => Err(StorageError::Locked {
                        path: path_out.display().to_string(),
                        lock: path.display().to_string(),
                        owner: owner.map_or_else(|| String::from("unknown"), |pid| pid.to_string()),
                    }),
                }
            }
            result => result,
        }
    }

    fn create(path: &Path) -> Result<Self, StorageError> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let lock = Self {
            path: path.to_path_buf(),
        };
        writeln!(file, "{}", std::process::id())?;
        Ok(lock)
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!("could not remove lock file {:?}: {}", &self.path, e);
        }
    }
}

/// The store under construction.
///
/// Dropping it without calling `finalize` removes all written data.
#[derive(Debug)]
pub struct Store {
    conn: Connection,
    tmp: NamedTempFile,
    /// Directory of the destination, also used for spill files.
    dir: PathBuf,
    path_out: PathBuf,
    /// Names of the annotation columns, in configuration order.
    anno_columns: Vec<String>,
    insert_variant_sql: String,
    _lock: LockFile,
}

impl Store {
    /// Create the schema in a temporary file next to `path_out`.
    ///
    /// Fails if `path_out` exists and `force` is not set, or if another load
    /// into `path_out` is running.
    #[tracing::instrument(skip(resources))]
    pub fn create(
        path_out: &Path,
        force: bool,
        resources: &[ResourceInfo],
    ) -> Result<Self, StorageError> {
        if path_out.exists() && !force {
            return Err(StorageError::Exists(path_out.display().to_string()));
        }
        let lock = LockFile::acquire(path_out)?;
        let dir = match path_out.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let tmp = tempfile::Builder::new()
            .prefix(".varload-")
            .suffix(".sqlite")
            .tempfile_in(&dir)?;
        tracing::debug!("writing to temporary store {:?}", tmp.path());

        let conn = Connection::open(tmp.path())?;
        conn.execute_batch(
            "PRAGMA journal_mode = MEMORY;
             PRAGMA synchronous = OFF;
             PRAGMA page_size = 32768;",
        )?;

        let anno_columns = resources
            .iter()
            .map(|resource| resource.name.clone())
            .collect::<Vec<_>>();
        let anno_ddl = resources
            .iter()
            .map(|resource| {
                format!(
                    ",\n    {} {}",
                    quote(&resource.name),
                    resource.mode.sql_type()
                )
            })
            .collect::<String>();
        conn.execute_batch(&format!(
            "CREATE TABLE variants (
                variant_id INTEGER PRIMARY KEY,
                chrom TEXT NOT NULL,
                chrom_key INTEGER,
                start INTEGER NOT NULL,
                \"end\" INTEGER NOT NULL,
                vcf_id TEXT,
                ref TEXT NOT NULL,
                alt TEXT,
                qual REAL,
                filter TEXT,
                type TEXT NOT NULL,
                sub_type TEXT,
                gene TEXT,
                transcript TEXT,
                consequence TEXT,
                impact TEXT,
                hgvs_c TEXT,
                hgvs_p TEXT,
                num_effects INTEGER NOT NULL,
                num_hom_ref INTEGER NOT NULL,
                num_het INTEGER NOT NULL,
                num_hom_alt INTEGER NOT NULL,
                num_unknown INTEGER NOT NULL,
                call_rate REAL,
                aaf REAL,
                info TEXT{}
            );
            CREATE TABLE samples (
                sample_id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                family_id TEXT,
                paternal_id TEXT,
                maternal_id TEXT,
                sex TEXT NOT NULL,
                phenotype TEXT NOT NULL
            );
            CREATE TABLE genotypes (
                variant_id INTEGER NOT NULL,
                sample_id INTEGER NOT NULL,
                gt TEXT,
                gt_type INTEGER NOT NULL,
                depth INTEGER,
                gq INTEGER,
                phased INTEGER NOT NULL,
                PRIMARY KEY (variant_id, sample_id)
            ) WITHOUT ROWID;
            CREATE TABLE resources (
                name TEXT PRIMARY KEY,
                path TEXT NOT NULL,
                mode TEXT NOT NULL,
                naming TEXT NOT NULL,
                loaded INTEGER NOT NULL
            );
            CREATE TABLE failed_chunks (
                chunk_id INTEGER PRIMARY KEY,
                start_offset INTEGER NOT NULL,
                end_offset INTEGER,
                first_line INTEGER,
                last_line INTEGER,
                line INTEGER,
                message TEXT NOT NULL
            );
            CREATE TABLE load_info (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
            anno_ddl
        ))?;

        let columns = VARIANT_COLUMNS
            .iter()
            .map(|name| quote(name))
            .chain(anno_columns.iter().map(|name| quote(name)))
            .collect::<Vec<_>>();
        let insert_variant_sql = format!(
            "INSERT INTO variants ({}) VALUES ({})",
            columns.join(", "),
            (1..=columns.len())
                .map(|i| format!("?{}", i))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let result = Self {
            conn,
            tmp,
            dir,
            path_out: path_out.to_path_buf(),
            anno_columns,
            insert_variant_sql,
            _lock: lock,
        };
        for resource in resources {
            result.conn.execute(
                "INSERT INTO resources (name, path, mode, naming, loaded) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    resource.name,
                    resource.path,
                    resource.mode.to_string(),
                    resource.naming.to_string(),
                    resource.loaded
                ],
            )?;
        }
        result.set_info("version", worker_version())?;
        result.set_info("created", &chrono::Local::now().to_rfc3339())?;
        result.set_info("status", &LoadStatus::Loading.to_string())?;

        // Rows are written in a single transaction that ends in `finalize`.
        result.conn.execute_batch("BEGIN")?;
        Ok(result)
    }

    /// Directory for temporary files that belong to this load.
    pub fn spill_dir(&self) -> &Path {
        &self.dir
    }

    /// Start the rows of one chunk, which can be undone by `rollback_chunk`.
    pub fn begin_chunk(&self) -> Result<(), StorageError> {
        self.conn.execute_batch("SAVEPOINT chunk")?;
        Ok(())
    }

    /// Keep the rows written since `begin_chunk`.
    pub fn release_chunk(&self) -> Result<(), StorageError> {
        self.conn.execute_batch("RELEASE chunk")?;
        Ok(())
    }

    /// Drop the rows written since `begin_chunk`.
    pub fn rollback_chunk(&self) -> Result<(), StorageError> {
        self.conn.execute_batch("ROLLBACK TO chunk; RELEASE chunk")?;
        Ok(())
    }

    /// Set a key in the `load_info` table.
    pub fn set_info(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO load_info (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn insert_samples(&self, samples: &[Sample]) -> Result<(), StorageError> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO samples (sample_id, name, family_id, paternal_id, maternal_id, sex, phenotype)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        for sample in samples {
            stmt.execute(params![
                sample.sample_id as i64,
                sample.name,
                sample.family_id,
                sample.paternal_id,
                sample.maternal_id,
                sample.sex.to_string(),
                sample.phenotype.to_string(),
            ])?;
        }
        Ok(())
    }

    /// Insert one variant row with its annotation values.
    pub fn insert_variant(
        &self,
        variant_id: i64,
        chrom_key: Option<usize>,
        record: &AnnotatedVariant,
        summary: &GenotypeSummary,
    ) -> Result<(), StorageError> {
        let variant = &record.variant;
        let csq = variant.consequence.clone().unwrap_or_default();
        let text = |value: Option<String>| value.map(Value::Text).unwrap_or(Value::Null);
        let real = |value: Option<f64>| value.map(Value::Real).unwrap_or(Value::Null);

        let mut values = vec![
            Value::Integer(variant_id),
            Value::Text(variant.chrom.clone()),
            chrom_key
                .map(|key| Value::Integer(key as i64))
                .unwrap_or(Value::Null),
            Value::Integer(variant.start as i64),
            Value::Integer(variant.end as i64),
            text(variant.vcf_id.clone()),
            Value::Text(variant.reference.clone()),
            text(Some(variant.alternatives.join(",")).filter(|alt| !alt.is_empty())),
            real(variant.qual.map(f64::from)),
            text(variant.filter.clone()),
            Value::Text(variant.var_type.to_string()),
            text(variant.sub_type.clone()),
            text(csq.gene),
            text(csq.transcript),
            text(csq.consequence),
            text(csq.impact.map(|impact| impact.to_string())),
            text(csq.hgvs_c),
            text(csq.hgvs_p),
            Value::Integer(csq.effect_count as i64),
            Value::Integer(summary.num_hom_ref as i64),
            Value::Integer(summary.num_het as i64),
            Value::Integer(summary.num_hom_alt as i64),
            Value::Integer(summary.num_unknown as i64),
            real(summary.call_rate),
            real(summary.aaf),
            Value::Text(variant.info.clone()),
        ];
        values.extend(record.annotations.iter().map(|value| match value {
            Some(AnnoValue::Int(value)) => Value::Integer(*value),
            Some(AnnoValue::Real(value)) => Value::Real(*value),
            Some(AnnoValue::Text(value)) => Value::Text(value.clone()),
            None => Value::Null,
        }));

        self.conn
            .prepare_cached(&self.insert_variant_sql)?
            .execute(params_from_iter(values))?;
        Ok(())
    }

    /// Insert the calls of one variant; sample ids follow the call order.
    pub fn insert_genotypes(
        &self,
        variant_id: i64,
        calls: &[GenotypeCall],
    ) -> Result<(), StorageError> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO genotypes (variant_id, sample_id, gt, gt_type, depth, gq, phased)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        for (idx, call) in calls.iter().enumerate() {
            stmt.execute(params![
                variant_id,
                idx as i64 + 1,
                call.gt,
                call.genotype.code(),
                call.depth,
                call.gq,
                call.phased,
            ])?;
        }
        Ok(())
    }

    pub fn insert_failed_chunk(&self, failed: &FailedChunk) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO failed_chunks
                 (chunk_id, start_offset, end_offset, first_line, last_line, line, message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                failed.chunk_id as i64,
                failed.start_offset as i64,
                failed.end_offset.map(|offset| offset as i64),
                failed.first_line.map(|line| line as i64),
                failed.last_line.map(|line| line as i64),
                failed.line.map(|line| line as i64),
                failed.message,
            ],
        )?;
        Ok(())
    }

    /// Commit the rows, build the indexes and move the store into place.
    #[tracing::instrument(skip(self))]
    pub fn finalize(self, status: LoadStatus) -> Result<PathBuf, StorageError> {
        self.conn.execute_batch("COMMIT")?;

        tracing::info!("Building indexes");
        let mut ddl = String::from(
            "CREATE INDEX idx_variants_coord ON variants (chrom_key, start, \"end\");
             CREATE INDEX idx_variants_gene ON variants (gene);
             CREATE INDEX idx_variants_impact ON variants (impact);
             CREATE INDEX idx_genotypes_sample ON genotypes (sample_id, gt_type);",
        );
        // Source names share no prefix with the fixed indexes above.
        for name in &self.anno_columns {
            ddl.push_str(&format!(
                "\nCREATE INDEX {} ON variants ({});",
                quote(&format!("idx_anno_{}", name)),
                quote(name)
            ));
        }
        self.conn.execute_batch(&ddl)?;
        self.set_info("finished", &chrono::Local::now().to_rfc3339())?;
        self.set_info("status", &status.to_string())?;

        let Self {
            conn,
            tmp,
            path_out,
            _lock,
            ..
        } = self;
        conn.close().map_err(|(_, e)| StorageError::Sqlite(e))?;
        tmp.persist(&path_out)
            .map_err(|e| StorageError::Persist {
                path: path_out.display().to_string(),
                reason: e.error.to_string(),
            })?;
        drop(_lock);
        tracing::debug!("store persisted to {:?}", &path_out);
        Ok(path_out)
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        annos::{Mode, Naming},
        common::Genotype,
        load::record::{VarType, Variant},
    };

    fn resources() -> Vec<ResourceInfo> {
        vec![
            ResourceInfo {
                name: String::from("cpg"),
                path: String::from("cpg.bed"),
                mode: Mode::Flag,
                naming: Naming::Ucsc,
                loaded: true,
            },
            ResourceInfo {
                name: String::from("rmsk"),
                path: String::from("rmsk.bed"),
                mode: Mode::List,
                naming: Naming::Ucsc,
                loaded: false,
            },
        ]
    }

    fn record() -> AnnotatedVariant {
        AnnotatedVariant {
            variant: Variant {
                chrom: String::from("1"),
                pos: 100,
                start: 99,
                end: 100,
                vcf_id: None,
                reference: String::from("A"),
                alternatives: vec![String::from("G")],
                qual: Some(30.0),
                filter: None,
                info: String::from("."),
                var_type: VarType::Snp,
                sub_type: Some(String::from("ts")),
                consequence: None,
            },
            annotations: vec![Some(AnnoValue::Int(1)), None],
            calls: vec![GenotypeCall {
                gt: Some(String::from("0/1")),
                alleles: vec![Some(0), Some(1)],
                phased: false,
                genotype: Genotype::Het,
                depth: Some(12),
                gq: None,
            }],
            line: 1,
        }
    }

    fn count(conn: &Connection, table: &str) -> Result<i64, anyhow::Error> {
        Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
            row.get(0)
        })?)
    }

    #[test]
    fn create_insert_finalize() -> Result<(), anyhow::Error> {
        let tmpdir = temp_testdir::TempDir::default();
        let path_out = tmpdir.join("out.db");

        let store = Store::create(&path_out, false, &resources())?;
        assert!(!path_out.exists());
        let record = record();
        let summary = GenotypeSummary::from_calls(&record.calls);
        store.insert_variant(1, Some(0), &record, &summary)?;
        store.insert_genotypes(1, &record.calls)?;
        store.finalize(LoadStatus::Complete)?;

        assert!(path_out.exists());
        assert!(!tmpdir.join("out.db.lock").exists());
        let conn = Connection::open(&path_out)?;
        assert_eq!(count(&conn, "variants")?, 1);
        assert_eq!(count(&conn, "genotypes")?, 1);
        assert_eq!(count(&conn, "resources")?, 2);
        let (cpg, rmsk, num_het): (i64, Option<String>, i64) = conn.query_row(
            "SELECT cpg, rmsk, num_het FROM variants WHERE variant_id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        assert_eq!((cpg, rmsk, num_het), (1, None, 1));
        let status: String = conn.query_row(
            "SELECT value FROM load_info WHERE key = 'status'",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(status, "complete");
        let indexes: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name LIKE 'idx_%'",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(indexes, 6);

        Ok(())
    }

    #[test]
    fn dropped_store_leaves_nothing() -> Result<(), anyhow::Error> {
        let tmpdir = temp_testdir::TempDir::default();
        let path_out = tmpdir.join("out.db");

        {
            let store = Store::create(&path_out, false, &resources())?;
            store.insert_variant(1, None, &record(), &GenotypeSummary::default())?;
        }

        assert!(!path_out.exists());
        assert_eq!(std::fs::read_dir(&*tmpdir)?.count(), 0);

        Ok(())
    }

    #[test]
    fn existing_output() -> Result<(), anyhow::Error> {
        let tmpdir = temp_testdir::TempDir::default();
        let path_out = tmpdir.join("out.db");
        std::fs::write(&path_out, "old")?;

        assert!(matches!(
            Store::create(&path_out, false, &[]),
            Err(StorageError::Exists(_))
        ));
        Store::create(&path_out, true, &[])?.finalize(LoadStatus::Complete)?;
        assert_eq!(count(&Connection::open(&path_out)?, "variants")?, 0);

        Ok(())
    }

    #[test]
    fn source_named_like_fixed_index() -> Result<(), anyhow::Error> {
        let tmpdir = temp_testdir::TempDir::default();
        let path_out = tmpdir.join("out.db");
        let mut resources = resources();
        resources[0].name = String::from("coord");
        resources[1].name = String::from("gene_x");

        Store::create(&path_out, false, &resources)?.finalize(LoadStatus::Complete)?;

        let conn = Connection::open(&path_out)?;
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'index' AND name LIKE 'idx_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        assert_eq!(
            names,
            vec![
                "idx_anno_coord",
                "idx_anno_gene_x",
                "idx_genotypes_sample",
                "idx_variants_coord",
                "idx_variants_gene",
                "idx_variants_impact",
            ]
        );

        Ok(())
    }

    #[test]
    fn rolled_back_chunk_leaves_no_rows() -> Result<(), anyhow::Error> {
        let tmpdir = temp_testdir::TempDir::default();
        let path_out = tmpdir.join("out.db");
        let store = Store::create(&path_out, false, &resources())?;
        let record = record();
        let summary = GenotypeSummary::from_calls(&record.calls);

        store.begin_chunk()?;
        store.insert_variant(1, Some(0), &record, &summary)?;
        store.release_chunk()?;
        store.begin_chunk()?;
        store.insert_variant(2, Some(0), &record, &summary)?;
        store.insert_genotypes(2, &record.calls)?;
        store.rollback_chunk()?;
        store.begin_chunk()?;
        store.insert_variant(2, Some(0), &record, &summary)?;
        store.release_chunk()?;
        store.finalize(LoadStatus::Complete)?;

        let conn = Connection::open(&path_out)?;
        assert_eq!(count(&conn, "variants")?, 2);
        assert_eq!(count(&conn, "genotypes")?, 0);

        Ok(())
    }

    #[test]
    fn concurrent_load_is_locked() -> Result<(), anyhow::Error> {
        let tmpdir = temp_testdir::TempDir::default();
        let path_out = tmpdir.join("out.db");

        let first = Store::create(&path_out, false, &[])?;
        let lock = tmpdir.join("out.db.lock");
        assert_eq!(
            std::fs::read_to_string(&lock)?.trim(),
            std::process::id().to_string()
        );
        let err = Store::create(&path_out, false, &[]).expect_err("must be locked");
        assert!(matches!(err, StorageError::Locked { .. }));
        let message = err.to_string();
        assert!(message.contains(&lock.display().to_string()), "{}", message);
        assert!(message.contains(&std::process::id().to_string()), "{}", message);
        let other = Store::create(&tmpdir.join("other.db"), false, &[])?;
        drop(first);
        drop(other);
        Store::create(&path_out, false, &[])?;

        Ok(())
    }

    #[test]
    #[tracing_test::traced_test]
    fn stale_lock_is_taken_over() -> Result<(), anyhow::Error> {
        let tmpdir = temp_testdir::TempDir::default();
        let path_out = tmpdir.join("out.db");
        // beyond the largest pid the kernel hands out
        std::fs::write(tmpdir.join("out.db.lock"), "2147483647\n")?;

        Store::create(&path_out, false, &[])?.finalize(LoadStatus::Complete)?;

        assert!(path_out.exists());
        assert!(!tmpdir.join("out.db.lock").exists());
        assert!(logs_contain("of process 2147483647 that no longer runs"));

        Ok(())
    }

    #[test]
    fn unreadable_lock_is_kept() -> Result<(), anyhow::Error> {
        let tmpdir = temp_testdir::TempDir::default();
        let path_out = tmpdir.join("out.db");
        std::fs::write(tmpdir.join("out.db.lock"), "")?;

        let err = Store::create(&path_out, false, &[]).expect_err("must be locked");

        assert!(err.to_string().contains("process unknown"), "{}", err);
        assert!(tmpdir.join("out.db.lock").exists());

        Ok(())
    }
}
