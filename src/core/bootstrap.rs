// src/core/bootstrap.rs

//! On-disk bootstrap state: the per-target metadata UUID file and the
//! `<rdb>-uuid` sibling that records which replicated DB lives in a pool
//! directory. These 16-byte files are the only state the pool service keeps
//! outside the replicated log.

use crate::core::PoolError;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error};
use uuid::Uuid;

/// File holding the target UUID of a storage directory.
pub const META_FILE: &str = "meta";

/// Base name of the pool service's replicated DB file.
pub const RDB_FILE: &str = "rdb-pool";

const MD_CAP_ENV: &str = "PERIDOT_MD_CAP";
const MD_CAP_DEFAULT: u64 = 1 << 27; // 128 MB

/// Stores a UUID in `path`: created exclusively, fsync'd, and removed again
/// if anything fails.
pub fn uuid_store(path: &Path, uuid: Uuid) -> Result<(), PoolError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| {
            error!(?path, error = %e, "failed to create uuid file");
            match e.kind() {
                std::io::ErrorKind::AlreadyExists => PoolError::Exist,
                _ => PoolError::from(e),
            }
        })?;

    let result = file
        .write_all(uuid.as_bytes())
        .and_then(|()| file.sync_all());
    drop(file);
    if let Err(e) = result {
        error!(?path, error = %e, "failed to persist uuid file");
        let _ = fs::remove_file(path);
        return Err(e.into());
    }
    Ok(())
}

/// Loads a UUID from `path`. A missing file is `Nonexist`.
pub fn uuid_load(path: &Path) -> Result<Uuid, PoolError> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(?path, "uuid file not found");
            return Err(PoolError::Nonexist);
        }
        Err(e) => {
            error!(?path, error = %e, "failed to open uuid file");
            return Err(e.into());
        }
    };
    let mut bytes = [0u8; 16];
    file.read_exact(&mut bytes).map_err(|e| {
        error!(?path, error = %e, "failed to read uuid file");
        PoolError::from(e)
    })?;
    Ok(Uuid::from_bytes(bytes))
}

/// The directory holding one pool's local files.
pub fn pool_dir(storage_root: &Path, pool: Uuid) -> PathBuf {
    storage_root.join(pool.to_string())
}

/// The path of a pool's replicated DB file.
pub fn rdb_path(storage_root: &Path, pool: Uuid) -> PathBuf {
    pool_dir(storage_root, pool).join(RDB_FILE)
}

/// The path of the file recording a pool's replicated DB UUID.
pub fn rdb_uuid_path(storage_root: &Path, pool: Uuid) -> PathBuf {
    pool_dir(storage_root, pool).join(format!("{RDB_FILE}-uuid"))
}

pub fn rdb_uuid_store(storage_root: &Path, pool: Uuid, db_uuid: Uuid) -> Result<(), PoolError> {
    uuid_store(&rdb_uuid_path(storage_root, pool), db_uuid)
}

pub fn rdb_uuid_load(storage_root: &Path, pool: Uuid) -> Result<Uuid, PoolError> {
    uuid_load(&rdb_uuid_path(storage_root, pool))
}

pub fn rdb_uuid_remove(storage_root: &Path, pool: Uuid) -> Result<(), PoolError> {
    let path = rdb_uuid_path(storage_root, pool);
    fs::remove_file(&path).map_err(|e| {
        error!(?path, error = %e, "failed to remove rdb uuid file");
        PoolError::from(e)
    })
}

/// Prepares a storage directory for membership in `pool`: generates the
/// target UUID for this node and persists it in the metadata file. Called on
/// every storage node belonging to the pool. Returns the generated UUID.
pub fn pool_create(storage_root: &Path, pool: Uuid) -> Result<Uuid, PoolError> {
    let dir = pool_dir(storage_root, pool);
    fs::create_dir_all(&dir)?;
    let target_uuid = Uuid::new_v4();
    uuid_store(&dir.join(META_FILE), target_uuid)?;
    Ok(target_uuid)
}

/// The replicated-DB metadata capacity in bytes: `PERIDOT_MD_CAP` (in MB)
/// with a 128 MB floor.
pub fn md_cap() -> u64 {
    match std::env::var(MD_CAP_ENV) {
        Ok(v) => {
            let mb: u64 = v.parse().unwrap_or(0);
            if mb < MD_CAP_DEFAULT >> 20 {
                error!("metadata capacity too low; using {} MB", MD_CAP_DEFAULT >> 20);
                MD_CAP_DEFAULT
            } else {
                mb << 20
            }
        }
        Err(_) => MD_CAP_DEFAULT,
    }
}
