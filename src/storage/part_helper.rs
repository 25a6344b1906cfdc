// Payload storage policy.
//
// Parts up to the configured size threshold live inline in the row; larger
// payloads are filed under `<data-dir>/file_db_data/<part-id>_r<N>` with
// the revision suffix bumped on every overwrite. External files are
// written before the row references them, and the previous file is deleted
// only after the row update succeeded, so a failure never leaves the row
// pointing at missing data.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::db::{Database, Value};
use super::entities::Part;
use super::query_builder::{CompareOperator, QueryBuilder};
use crate::error::{Error, Result};

pub struct PartHelper {
    data_dir: PathBuf,
    size_threshold: i64,
}

impl PartHelper {
    pub fn new(data_dir: PathBuf, size_threshold: i64) -> Self {
        Self {
            data_dir,
            size_threshold,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn base_name_for_part(&self, part_id: i64) -> PathBuf {
        debug_assert!(part_id > 0);
        self.data_dir.join(part_id.to_string())
    }

    fn path_for_revision(&self, part_id: i64, revision: i32) -> PathBuf {
        let mut path = self.base_name_for_part(part_id).into_os_string();
        path.push(format!("_r{revision}"));
        PathBuf::from(path)
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.data_dir).map_err(|e| {
            Error::PayloadIo(format!(
                "could not create payload directory {}: {e}",
                self.data_dir.display()
            ))
        })?;
        let mut file = fs::File::create(path).map_err(|e| {
            Error::PayloadIo(format!("could not open {} for writing: {e}", path.display()))
        })?;
        file.write_all(data)
            .and_then(|_| file.sync_all())
            .map_err(|e| Error::PayloadIo(format!("failed to write {}: {e}", path.display())))?;
        Ok(())
    }

    fn remove_file(path: &str) {
        if path.is_empty() {
            return;
        }
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path, error = %e, "could not remove payload file");
            }
        }
    }

    fn external_path(part: &Part) -> String {
        part.data
            .as_deref()
            .map(|d| String::from_utf8_lossy(d).into_owned())
            .unwrap_or_default()
    }

    /// Inserts a new part, filing the payload externally when it exceeds
    /// the size threshold. The row is inserted first so the payload file
    /// name can carry the assigned part id.
    pub fn insert(&self, db: &Database, part: &mut Part, data: &[u8]) -> Result<i64> {
        let store_external = data.len() as i64 > self.size_threshold;
        part.datasize = data.len() as i64;
        part.version = 0;
        if store_external {
            part.data = None;
            part.external = true;
        } else {
            part.data = Some(data.to_vec());
            part.external = false;
        }
        part.insert(db)?;

        if store_external {
            let path = self.path_for_revision(part.id, 0);
            self.write_file(&path, data)?;
            part.data = Some(path.to_string_lossy().into_owned().into_bytes());
            part.update(db)?;
        }
        Ok(part.id)
    }

    /// Overwrites a part's payload. External overwrites bump the revision
    /// suffix; the old file survives until the row update has succeeded.
    pub fn update(&self, db: &Database, part: &mut Part, data: &[u8]) -> Result<()> {
        if part.id <= 0 {
            return Err(Error::Argument("invalid part".into()));
        }
        // Currently external: remember the file so it can be deleted after
        // the update went through.
        let orig_file = if part.external {
            Self::external_path(part)
        } else {
            String::new()
        };

        // Every overwrite bumps the revision; external files carry it in
        // their name so a new file never clashes with the one still
        // referenced by the row.
        let revision = part.version + 1;
        let store_external = data.len() as i64 > self.size_threshold;
        if store_external {
            let path = self.path_for_revision(part.id, revision);
            self.write_file(&path, data)?;
            part.data = Some(path.to_string_lossy().into_owned().into_bytes());
            part.external = true;
        } else {
            part.data = Some(data.to_vec());
            part.external = false;
        }
        part.version = revision;
        part.datasize = data.len() as i64;
        part.update(db)?;

        // everything worked, remove the old file
        if !orig_file.is_empty() {
            Self::remove_file(&orig_file);
        }
        Ok(())
    }

    /// Returns the payload bytes, wherever they live.
    pub fn read(&self, part: &Part) -> Result<Vec<u8>> {
        if !part.external {
            return Ok(part.data.clone().unwrap_or_default());
        }
        let path = Self::external_path(part);
        let payload = fs::read(&path)
            .map_err(|e| Error::PayloadIo(format!("payload file {path} could not be read: {e}")))?;
        if payload.len() as i64 != part.datasize {
            return Err(Error::PayloadIo(format!(
                "payload file {path} has {} bytes, row says {}",
                payload.len(),
                part.datasize
            )));
        }
        Ok(payload)
    }

    /// Drops the payload data but keeps the part row; used by the cache
    /// cleaner for evictable payload parts.
    pub fn truncate(&self, db: &Database, part: &mut Part) -> Result<()> {
        if part.external {
            Self::remove_file(&Self::external_path(part));
        }
        part.data = None;
        part.datasize = 0;
        part.external = false;
        part.update(db)
    }

    /// Removes a part row including its external file.
    pub fn remove(&self, db: &Database, part: &Part) -> Result<()> {
        if part.external {
            debug!(part = part.id, "removing external payload file");
            Self::remove_file(&Self::external_path(part));
        }
        part.remove(db)
    }

    /// Removes all parts of an item, external files included.
    pub fn remove_by_item(&self, db: &Database, item_id: i64) -> Result<()> {
        let mut qb = Part::select();
        qb.add_value_condition(
            Part::full("pimItemId"),
            CompareOperator::Equals,
            item_id,
        );
        qb.add_value_condition(Part::full("external"), CompareOperator::Equals, true);
        qb.add_value_condition(Part::full("data"), CompareOperator::IsNot, Value::Null);
        for row in qb.query(db)? {
            let part = part_from_select_row(&row);
            Self::remove_file(&Self::external_path(&part));
        }
        let mut delete = QueryBuilder::delete(Part::TABLE);
        delete.add_value_condition("pimItemId", CompareOperator::Equals, item_id);
        delete.exec(db)?;
        Ok(())
    }

    /// Startup sweep: deletes files under the payload directory that no
    /// external part row references anymore, e.g. after a crash between a
    /// row update and the old-file deletion.
    pub fn sweep_orphans(&self, db: &Database) -> Result<usize> {
        let entries = match fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(Error::PayloadIo(format!(
                    "could not list payload directory {}: {e}",
                    self.data_dir.display()
                )))
            }
        };

        let mut qb = QueryBuilder::select(Part::TABLE);
        qb.add_column("data");
        qb.add_value_condition("external", CompareOperator::Equals, true);
        qb.add_value_condition("data", CompareOperator::IsNot, Value::Null);
        let referenced: std::collections::HashSet<String> = qb
            .query(db)?
            .iter()
            .map(|row| row[0].as_string())
            .collect();

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if !referenced.contains(&path.to_string_lossy().into_owned()) {
                debug!(path = %path.display(), "removing stale payload file");
                Self::remove_file(&path.to_string_lossy());
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn part_from_select_row(row: &[Value]) -> Part {
    Part {
        id: row[0].as_i64(),
        pim_item_id: row[1].as_i64(),
        name: row[2].as_string(),
        data: match &row[3] {
            Value::Null => None,
            other => Some(other.as_blob()),
        },
        datasize: row[4].as_i64(),
        version: row[5].as_i64() as i32,
        external: row[6].as_bool(),
    }
}
