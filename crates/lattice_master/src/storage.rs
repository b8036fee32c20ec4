//! Durable-storage boundary.
//!
//! The master never reads or writes region file formats; it only needs a
//! handful of structural operations: does the root region exist, create or
//! delete a region's directory, check a split daughter for leftover
//! reference files, sequence write-ahead-log splitting, and clean up old
//! logs. `LocalFsStorage` implements the boundary over a plain directory
//! tree.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::catalog::{RegionDescriptor, RowCells};
use crate::error::Result;
use crate::registry::ServerName;

pub trait TableStorage: Send + Sync {
    fn root_region_exists(&self) -> Result<bool>;

    fn create_region(&self, region: &RegionDescriptor) -> Result<()>;

    fn delete_region(&self, region: &RegionDescriptor) -> Result<()>;

    fn delete_column_family(&self, region: &RegionDescriptor, family: &str) -> Result<()>;

    /// Whether `daughter` still holds reference files pointing at data
    /// physically owned by its split parent.
    fn daughter_has_references(
        &self,
        parent: &RegionDescriptor,
        daughter: &RegionDescriptor,
    ) -> Result<bool>;

    /// Persist a catalog region's full row set. Used by bootstrap (the meta
    /// row recorded in the root region before it is ever served) and by
    /// serving processes writing through.
    fn seed_region_rows(&self, region: &RegionDescriptor, rows: &[(Vec<u8>, RowCells)])
        -> Result<()>;

    fn load_region_rows(&self, region: &RegionDescriptor) -> Result<Vec<(Vec<u8>, RowCells)>>;

    /// Split a dead server's write-ahead log into per-region logs. The
    /// physical algorithm belongs to the storage layer; the master only
    /// sequences when it runs. Must be idempotent.
    fn split_server_log(&self, server: &ServerName) -> Result<()>;

    /// Names of retired logs eligible for deletion.
    fn stale_logs(&self) -> Result<Vec<String>>;

    fn delete_log(&self, name: &str) -> Result<()>;

    /// Cheap health check; persistent failure is fatal to the master.
    fn probe(&self) -> Result<()>;
}

const LOGS_DIR: &str = ".logs";
const OLD_LOGS_DIR: &str = ".oldlogs";
const REGION_INFO_FILE: &str = ".regioninfo";
const REGION_ROWS_FILE: &str = ".rows.json";

/// Filesystem-backed implementation over a single base directory.
pub struct LocalFsStorage {
    base: PathBuf,
}

impl LocalFsStorage {
    pub fn new(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        fs::create_dir_all(&base)?;
        Ok(LocalFsStorage { base })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn region_dir(&self, region: &RegionDescriptor) -> PathBuf {
        self.base.join(&region.table.0).join(region.encoded_name())
    }

    fn server_log_dir(&self, server: &ServerName) -> PathBuf {
        self.base.join(LOGS_DIR).join(server.file_stem())
    }

    /// Create a server's log directory, as a serving process would.
    pub fn ensure_server_log(&self, server: &ServerName) -> Result<()> {
        fs::create_dir_all(self.server_log_dir(server))?;
        Ok(())
    }

    pub fn server_log_exists(&self, server: &ServerName) -> bool {
        self.server_log_dir(server).is_dir()
    }

    /// Record a reference file in `daughter` pointing at `parent` data under
    /// one column family.
    pub fn add_reference(
        &self,
        parent: &RegionDescriptor,
        daughter: &RegionDescriptor,
        family: &str,
    ) -> Result<()> {
        let refs = self.region_dir(daughter).join(family).join("refs");
        fs::create_dir_all(&refs)?;
        fs::write(refs.join(format!("{}.ref", parent.encoded_name())), b"")?;
        Ok(())
    }

    /// Drop every reference `daughter` holds against `parent` (what a
    /// finished compaction does).
    pub fn clear_references(
        &self,
        parent: &RegionDescriptor,
        daughter: &RegionDescriptor,
    ) -> Result<()> {
        let marker = format!("{}.ref", parent.encoded_name());
        let dir = self.region_dir(daughter);
        for family in &daughter.families {
            let path = dir.join(&family.name).join("refs").join(&marker);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Park a retired log name for the cleaner chore to find.
    pub fn retire_log(&self, name: &str) -> Result<()> {
        let dir = self.base.join(OLD_LOGS_DIR);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(name), b"")?;
        Ok(())
    }

    pub fn region_exists(&self, region: &RegionDescriptor) -> bool {
        self.region_dir(region).is_dir()
    }

    pub fn column_family_exists(&self, region: &RegionDescriptor, family: &str) -> bool {
        self.region_dir(region).join(family).is_dir()
    }
}

impl TableStorage for LocalFsStorage {
    fn root_region_exists(&self) -> Result<bool> {
        Ok(self.region_dir(&RegionDescriptor::root()).is_dir())
    }

    fn create_region(&self, region: &RegionDescriptor) -> Result<()> {
        let dir = self.region_dir(region);
        for family in &region.families {
            fs::create_dir_all(dir.join(&family.name))?;
        }
        let info = serde_json::to_vec_pretty(region)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(dir.join(REGION_INFO_FILE), info)?;
        Ok(())
    }

    fn delete_region(&self, region: &RegionDescriptor) -> Result<()> {
        match fs::remove_dir_all(self.region_dir(region)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn delete_column_family(&self, region: &RegionDescriptor, family: &str) -> Result<()> {
        match fs::remove_dir_all(self.region_dir(region).join(family)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn daughter_has_references(
        &self,
        parent: &RegionDescriptor,
        daughter: &RegionDescriptor,
    ) -> Result<bool> {
        let marker = format!("{}.ref", parent.encoded_name());
        let dir = self.region_dir(daughter);
        for family in &daughter.families {
            if dir.join(&family.name).join("refs").join(&marker).is_file() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn seed_region_rows(
        &self,
        region: &RegionDescriptor,
        rows: &[(Vec<u8>, RowCells)],
    ) -> Result<()> {
        let dir = self.region_dir(region);
        fs::create_dir_all(&dir)?;
        let payload = serde_json::to_vec(rows)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(dir.join(REGION_ROWS_FILE), payload)?;
        Ok(())
    }

    fn load_region_rows(&self, region: &RegionDescriptor) -> Result<Vec<(Vec<u8>, RowCells)>> {
        let path = self.region_dir(region).join(REGION_ROWS_FILE);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let rows = serde_json::from_slice(&raw)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(rows)
    }

    fn split_server_log(&self, server: &ServerName) -> Result<()> {
        let dir = self.server_log_dir(server);
        if !dir.is_dir() {
            return Ok(());
        }
        // Rename first so a crash mid-split leaves an unambiguous marker
        // instead of a half-consumed live log directory.
        let splitting = self
            .base
            .join(LOGS_DIR)
            .join(format!("{}-splitting", server.file_stem()));
        if !splitting.exists() {
            fs::rename(&dir, &splitting)?;
        } else {
            // A previous attempt already claimed the log; fold the remainder
            // in and continue.
            let _ = fs::remove_dir_all(&dir);
        }
        fs::remove_dir_all(&splitting)?;
        Ok(())
    }

    fn stale_logs(&self) -> Result<Vec<String>> {
        let dir = self.base.join(OLD_LOGS_DIR);
        let mut out = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(out),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                out.push(name.to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    fn delete_log(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.base.join(OLD_LOGS_DIR).join(name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn probe(&self) -> Result<()> {
        fs::metadata(&self.base)?;
        Ok(())
    }
}
