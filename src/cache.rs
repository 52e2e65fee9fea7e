//! The incremental build cache.
//!
//! Cached pass outputs live in a SQLite database next to a table of per-input
//! content digests. An entry is keyed by `(input path, pass)` and stamped with
//! the fingerprint it was produced under; a lookup only hits when the caller's
//! fingerprint matches. Pass-1 fingerprints cover the input content and the
//! engine identity. Extra source files a compilation read (class files,
//! `\input` files) are recorded next to its pass-1 output and checked on every
//! lookup. Pass-2 fingerprints cover the input content, those extra files and
//! the digest of the resolution rows the input consumed, so a changed title
//! elsewhere invalidates exactly the inputs that display it.
//!
//! The cache is an optimization. Read failures degrade to a miss; write failures
//! are returned to the caller, which reports them as warnings.
use std::{
    fmt,
    path::Path,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{
    error::BoxDynError,
    migrate::{MigrateDatabase, Migration as SqlxMigration, MigrationSource, MigrationType, Migrator},
    pool::PoolOptions,
    sqlite::{Sqlite, SqliteConnectOptions},
    ConnectOptions, Pool,
};

use crate::{engine::Pass, error::PediaError};

/// A SHA-256 content or dependency fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(#[serde(with = "hex")] [u8; 32]);

impl Fingerprint {
    pub fn of_bytes(data: &[u8]) -> Fingerprint {
        let mut out = [0u8; 32];
        out.copy_from_slice(&Sha256::digest(data));
        Fingerprint(out)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = PediaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)
            .map_err(|e| PediaError::Serialization(format!("bad fingerprint {s:?}: {e}")))?;
        Ok(Fingerprint(out))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..12])
    }
}

/// Incremental hasher for composite fingerprints. Every string is length
/// prefixed, so adjacent fields can never run together.
#[derive(Clone)]
pub struct FingerprintBuilder {
    hasher: Sha256,
}

impl FingerprintBuilder {
    pub fn new(domain: &str) -> FingerprintBuilder {
        let mut builder = FingerprintBuilder {
            hasher: Sha256::new(),
        };
        builder.update_str(domain);
        builder
    }

    pub fn update_str(&mut self, s: &str) -> &mut Self {
        self.hasher.update((s.len() as u64).to_le_bytes());
        self.hasher.update(s.as_bytes());
        self
    }

    pub fn update_u8(&mut self, b: u8) -> &mut Self {
        self.hasher.update([b]);
        self
    }

    pub fn update_fingerprint(&mut self, fp: &Fingerprint) -> &mut Self {
        self.hasher.update(fp.0);
        self
    }

    pub fn finish(&self) -> Fingerprint {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.hasher.clone().finalize());
        Fingerprint(out)
    }
}

#[derive(Debug, Clone)]
struct Migration {
    version: i64,
    description: &'static str,
    sql: &'static str,
    kind: MigrationType,
}

#[derive(Debug, Clone)]
struct MigrationList(Vec<Migration>);

impl MigrationSource<'static> for MigrationList {
    fn resolve(self) -> BoxFuture<'static, Result<Vec<SqlxMigration>, BoxDynError>> {
        Box::pin(async move {
            Ok(self
                .0
                .into_iter()
                .filter(|m| matches!(m.kind, MigrationType::ReversibleUp))
                .map(|m| SqlxMigration::new(m.version, m.description.into(), m.kind, m.sql.into(), false))
                .collect())
        })
    }
}

fn migrations() -> MigrationList {
    MigrationList(vec![Migration {
        version: 1,
        description: "create_build_cache_tables",
        sql: "\
            CREATE TABLE file_digests (path TEXT PRIMARY KEY, mtime_ns INTEGER NOT NULL, size INTEGER NOT NULL, digest TEXT NOT NULL); \
            CREATE TABLE cache_entries (path TEXT NOT NULL, pass INTEGER NOT NULL, fingerprint TEXT NOT NULL, payload BLOB NOT NULL, PRIMARY KEY (path, pass));",
        kind: MigrationType::ReversibleUp,
    }])
}

/// Handle to the on-disk build cache. Clones share one connection pool.
#[derive(Clone, Debug)]
pub struct BuildCache {
    pool: Pool<Sqlite>,
    salt: Fingerprint,
}

impl BuildCache {
    /// Open (creating if needed) the cache database at `db_path`.
    ///
    /// `salt` identifies the engine configuration; changing it changes every
    /// fingerprint this cache computes.
    pub async fn open(db_path: &Path, salt: Fingerprint) -> Result<BuildCache, PediaError> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let db_str = db_path
            .to_str()
            .ok_or_else(|| PediaError::Config(format!("cache path {db_path:?} is not UTF-8")))?;
        let fqdb = format!("sqlite:{db_str}");
        tracing::debug!("[BuildCache] opening {fqdb}");
        if !Sqlite::database_exists(&fqdb).await.unwrap_or(false) {
            Sqlite::create_database(&fqdb).await?;
        }
        let options = SqliteConnectOptions::from_str(&fqdb)?
            .read_only(false)
            .disable_statement_logging()
            .create_if_missing(true);
        let pool = PoolOptions::<Sqlite>::new().connect_with(options).await?;

        Migrator::new(migrations()).await?.run(&pool).await?;

        let cache = BuildCache { pool, salt };
        tracing::info!(
            "[BuildCache] opened {}: {} cached pass outputs",
            db_path.display(),
            cache.entry_count().await?
        );
        Ok(cache)
    }

    pub fn salt(&self) -> Fingerprint {
        self.salt
    }

    pub fn pass1_fingerprint(&self, content: &Fingerprint) -> Fingerprint {
        FingerprintBuilder::new("pass1")
            .update_fingerprint(&self.salt)
            .update_fingerprint(content)
            .finish()
    }

    /// `source` is the input's [`source_digest`](Self::source_digest).
    pub fn pass2_fingerprint(&self, source: &Fingerprint, subset: &Fingerprint) -> Fingerprint {
        FingerprintBuilder::new("pass2")
            .update_fingerprint(&self.salt)
            .update_fingerprint(source)
            .update_fingerprint(subset)
            .finish()
    }

    /// Everything a compilation read: the input itself and its extra source
    /// files.
    pub fn source_digest(&self, content: &Fingerprint, dependencies: &Fingerprint) -> Fingerprint {
        FingerprintBuilder::new("source")
            .update_fingerprint(content)
            .update_fingerprint(dependencies)
            .finish()
    }

    /// Combined digest of extra source files, given as paths relative to `root`.
    /// A file that cannot be read contributes a marker instead of failing, so
    /// deleting a dependency still changes the digest.
    pub async fn dependency_digest(&self, root: &Path, dependencies: &[String]) -> Fingerprint {
        let mut builder = FingerprintBuilder::new("dependencies");
        for dep in dependencies.iter() {
            builder.update_str(dep);
            match self.content_digest(dep, &root.join(dep)).await {
                Ok(digest) => builder.update_u8(1).update_fingerprint(&digest),
                Err(e) => {
                    tracing::debug!("[BuildCache] dependency {dep} unreadable: {e}");
                    builder.update_u8(0)
                }
            };
        }
        builder.finish()
    }

    /// Content digest of one input.
    ///
    /// The stored digest is reused while the file's mtime and size match the
    /// recorded ones; otherwise the file is re-hashed and the record freshened.
    pub async fn content_digest(&self, file: &str, abs_path: &Path) -> Result<Fingerprint, PediaError> {
        let meta = tokio::fs::metadata(abs_path).await?;
        let size = meta.len() as i64;
        let mtime_ns = mtime_nanos(meta.modified()?)?;

        let stored = sqlx::query_as::<_, (i64, i64, String)>(
            "SELECT mtime_ns, size, digest FROM file_digests WHERE path = ?",
        )
        .bind(file)
        .fetch_optional(&self.pool)
        .await;

        match stored {
            Ok(Some((m, s, digest))) if m == mtime_ns && s == size => {
                match Fingerprint::from_str(&digest) {
                    Ok(fp) => return Ok(fp),
                    Err(e) => tracing::warn!("[BuildCache] discarding digest for {file}: {e}"),
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("[BuildCache] digest lookup for {file} failed: {e}"),
        }

        let content = tokio::fs::read(abs_path).await?;
        let digest = Fingerprint::of_bytes(&content);
        let written = sqlx::query(
            "INSERT OR REPLACE INTO file_digests (path, mtime_ns, size, digest) VALUES (?, ?, ?, ?)",
        )
        .bind(file)
        .bind(mtime_ns)
        .bind(size)
        .bind(digest.to_hex())
        .execute(&self.pool)
        .await;
        if let Err(e) = written {
            tracing::warn!("[BuildCache] could not record digest for {file}: {e}");
        }
        tracing::trace!("[BuildCache] hashed {file}: {digest:?}");
        Ok(digest)
    }

    /// Fetch the output stored for `(file, pass)` if it was produced under
    /// `fingerprint`. Any read or decode failure is a miss.
    pub async fn lookup<T: DeserializeOwned>(
        &self,
        file: &str,
        fingerprint: &Fingerprint,
        pass: Pass,
    ) -> Option<T> {
        let row = sqlx::query_as::<_, (String, Vec<u8>)>(
            "SELECT fingerprint, payload FROM cache_entries WHERE path = ? AND pass = ?",
        )
        .bind(file)
        .bind(pass.number())
        .fetch_optional(&self.pool)
        .await;

        match row {
            Ok(Some((stored, payload))) if stored == fingerprint.to_hex() => {
                match serde_json::from_slice(&payload) {
                    Ok(output) => Some(output),
                    Err(e) => {
                        tracing::warn!("[BuildCache] undecodable {pass} entry for {file}: {e}");
                        None
                    }
                }
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("[BuildCache] {pass} lookup for {file} failed, recompiling: {e}");
                None
            }
        }
    }

    /// Persist the output of a successful compilation, replacing any older
    /// entry for the same `(file, pass)`.
    pub async fn store<T: Serialize>(
        &self,
        file: &str,
        fingerprint: &Fingerprint,
        pass: Pass,
        output: &T,
    ) -> Result<(), PediaError> {
        let payload = serde_json::to_vec(output)?;
        sqlx::query(
            "INSERT OR REPLACE INTO cache_entries (path, pass, fingerprint, payload) VALUES (?, ?, ?, ?)",
        )
        .bind(file)
        .bind(pass.number())
        .bind(fingerprint.to_hex())
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Force both passes of `file` to recompile on the next build.
    pub async fn invalidate(&self, file: &str) -> Result<(), PediaError> {
        sqlx::query("DELETE FROM cache_entries WHERE path = ?")
            .bind(file)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM file_digests WHERE path = ?")
            .bind(file)
            .execute(&self.pool)
            .await?;
        tracing::debug!("[BuildCache] invalidated {file}");
        Ok(())
    }

    pub async fn invalidate_all(&self) -> Result<u64, PediaError> {
        let removed = sqlx::query("DELETE FROM cache_entries")
            .execute(&self.pool)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM file_digests")
            .execute(&self.pool)
            .await?;
        Ok(removed)
    }

    pub async fn entry_count(&self) -> Result<i64, PediaError> {
        let (n,) = sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM cache_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    /// `(path, pass)` of every stored entry, sorted.
    pub async fn entries(&self) -> Result<Vec<(String, i64)>, PediaError> {
        Ok(sqlx::query_as::<_, (String, i64)>(
            "SELECT path, pass FROM cache_entries ORDER BY path, pass",
        )
        .fetch_all(&self.pool)
        .await?)
    }
}

fn mtime_nanos(modified: SystemTime) -> Result<i64, PediaError> {
    let since = modified
        .duration_since(UNIX_EPOCH)
        .map_err(|e| PediaError::Io(format!("file modified before the epoch: {e}")))?;
    Ok(since.as_nanos() as i64)
}
