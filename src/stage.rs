//! Local staging directory.
//!
//! A local stage is required because the toolchain reads the files reported
//! by the cache directly from disk. Entries are keyed by hex identifiers and
//! sharded by their first two characters:
//!
//! ```text
//! <root>/action/<xx>/<action-id>   single-line record "<output-id> <nanos>"
//! <root>/output/<xx>/<output-id>   raw object bytes
//! ```
//!
//! The same sharded layout (without the action indirection) is reused by the
//! module and proxy caches through [`shard_path`] and [`write_atomic`].

use filetime::FileTime;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, warn};

use crate::types::{Error, Result};

/// A parsed action record: which output satisfies an action, and the
/// modification time to restore when the output is materialized.
///
/// The stored form is a single ASCII line `<output-id> <unix-nanos>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRecord {
    pub output_id: String,
    pub mod_nanos: i64,
}

impl ActionRecord {
    pub fn new(output_id: impl Into<String>, mod_time: SystemTime) -> Self {
        let mod_nanos = mod_time
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        Self {
            output_id: output_id.into(),
            mod_nanos,
        }
    }

    pub fn mod_time(&self) -> SystemTime {
        if self.mod_nanos >= 0 {
            SystemTime::UNIX_EPOCH + Duration::from_nanos(self.mod_nanos as u64)
        } else {
            SystemTime::UNIX_EPOCH
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::malformed("action record", "not valid UTF-8"))?;
        let mut fields = text.split_whitespace();
        let (Some(output_id), Some(ts), None) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(Error::malformed("action record", text.trim().to_string()));
        };
        let mod_nanos = ts
            .parse::<i64>()
            .map_err(|_| Error::malformed("action record timestamp", ts.to_string()))?;
        Ok(Self {
            output_id: output_id.to_string(),
            mod_nanos,
        })
    }

    pub fn encode(&self) -> String {
        format!("{} {}", self.output_id, self.mod_nanos)
    }
}

/// Validate an identifier used for path sharding: lowercase hex, long
/// enough to take a two-character shard prefix.
pub fn check_id(id: &str) -> Result<()> {
    if id.len() < 2 || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::malformed("identifier", id.to_string()));
    }
    Ok(())
}

/// The sharded path for `id` under `root`: `<root>/<id[0:2]>/<id>`.
pub fn shard_path(root: &Path, id: &str) -> PathBuf {
    root.join(&id[..2]).join(id)
}

fn ensure_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .map_err(|e| Error::file("create dir", dir, e))
}

/// Atomically write `body` to `path` with the given file mode, creating
/// parent directories as needed. Returns the number of bytes written.
///
/// The write goes to a temp file in the destination directory followed by a
/// rename, so concurrent writers of the same path resolve to single-writer-
/// wins and readers never observe partial contents.
pub async fn write_atomic<R>(path: &Path, body: &mut R, mode: u32) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    use std::os::unix::fs::PermissionsExt;

    let dir = path
        .parent()
        .ok_or_else(|| Error::malformed("cache path", path.display().to_string()))?;
    ensure_dir(dir)?;

    let tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| Error::file("create temp", dir, e))?;
    let std_file = tmp
        .as_file()
        .try_clone()
        .map_err(|e| Error::file("clone temp", tmp.path(), e))?;
    let mut file = tokio::fs::File::from_std(std_file);

    let n = tokio::io::copy(body, &mut file)
        .await
        .map_err(|e| Error::file("write", tmp.path(), e))?;
    file.flush().await.map_err(|e| Error::file("flush", tmp.path(), e))?;
    file.sync_all()
        .await
        .map_err(|e| Error::file("sync", tmp.path(), e))?;
    drop(file);

    tmp.as_file()
        .set_permissions(std::fs::Permissions::from_mode(mode))
        .map_err(|e| Error::file("chmod", tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| Error::file("rename", path, e.error))?;
    Ok(n)
}

/// On-disk stage for build-cache actions and outputs.
pub struct CacheDir {
    root: PathBuf,
}

impl CacheDir {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        ensure_dir(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn action_path(&self, id: &str) -> PathBuf {
        shard_path(&self.root.join("action"), id)
    }

    fn output_path(&self, id: &str) -> PathBuf {
        shard_path(&self.root.join("output"), id)
    }

    /// Look up a previously stored action. Returns the output id and the
    /// on-disk location of the output bytes, or `None` when either half is
    /// absent. A locally corrupt record is treated as a miss so a remote
    /// fault-in can repair it.
    pub async fn get(&self, action_id: &str) -> Result<Option<(String, PathBuf)>> {
        check_id(action_id)?;
        let data = match tokio::fs::read(self.action_path(action_id)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::file("read action", self.action_path(action_id), e)),
        };
        let record = match ActionRecord::parse(&data) {
            Ok(record) => record,
            Err(e) => {
                warn!(action = action_id, error = %e, "dropping unreadable local action record");
                return Ok(None);
            }
        };
        let path = self.output_path(&record.output_id);
        match tokio::fs::metadata(&path).await {
            Ok(_) => Ok(Some((record.output_id, path))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::file("stat output", path, e)),
        }
    }

    /// Store an output and its action record. The output bytes land before
    /// the record so a reader never finds a record naming a missing file.
    /// The output file's modification time is set to `mod_time`.
    pub async fn put<R>(
        &self,
        action_id: &str,
        output_id: &str,
        body: &mut R,
        mod_time: SystemTime,
    ) -> Result<PathBuf>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        check_id(action_id)?;
        check_id(output_id)?;

        let out_path = self.output_path(output_id);
        write_atomic(&out_path, body, 0o600).await?;
        filetime::set_file_mtime(&out_path, FileTime::from_system_time(mod_time))
            .map_err(|e| Error::file("set mtime", &out_path, e))?;

        let record = ActionRecord::new(output_id, mod_time);
        let mut encoded = std::io::Cursor::new(record.encode().into_bytes());
        write_atomic(&self.action_path(action_id), &mut encoded, 0o600).await?;
        Ok(out_path)
    }

    /// Remove entries whose modification time is older than `period`.
    /// Returns the number of files removed.
    pub async fn cleanup_older_than(&self, period: Duration) -> Result<usize> {
        let cutoff = SystemTime::now() - period;
        let mut removed = 0usize;
        for kind in ["action", "output"] {
            let base = self.root.join(kind);
            let shards = match std::fs::read_dir(&base) {
                Ok(shards) => shards,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::file("read dir", base, e)),
            };
            for shard in shards.flatten() {
                let entries = match std::fs::read_dir(shard.path()) {
                    Ok(entries) => entries,
                    Err(_) => continue,
                };
                for entry in entries.flatten() {
                    let stale = entry
                        .metadata()
                        .and_then(|m| m.modified())
                        .map(|t| t < cutoff)
                        .unwrap_or(false);
                    if stale && std::fs::remove_file(entry.path()).is_ok() {
                        removed += 1;
                    }
                }
            }
        }
        debug!(removed, "stage cleanup complete");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const ACTION: &str = "aabbccdd00112233aabbccdd00112233";
    const OUTPUT: &str = "ffeeddcc00112233ffeeddcc00112233";

    fn mod_time() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_nanos(1_700_000_000_123_456_789)
    }

    #[test]
    fn action_record_round_trip() {
        let record = ActionRecord::new(OUTPUT, mod_time());
        let parsed = ActionRecord::parse(record.encode().as_bytes()).unwrap();
        assert_eq!(parsed, record);
        assert_eq!(parsed.mod_time(), mod_time());
    }

    #[test]
    fn action_record_rejects_garbage() {
        assert!(ActionRecord::parse(b"garbage").is_err());
        assert!(ActionRecord::parse(b"one two three").is_err());
        assert!(ActionRecord::parse(b"abcd not-a-number").is_err());
    }

    #[test]
    fn shard_layout() {
        let p = shard_path(Path::new("/cache/module"), "16ab42");
        assert_eq!(p, Path::new("/cache/module/16/16ab42"));
        assert!(check_id("0f").is_ok());
        assert!(check_id("f").is_err());
        assert!(check_id("zz00").is_err());
    }

    #[tokio::test]
    async fn put_then_get_preserves_bytes_and_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let stage = CacheDir::new(dir.path()).unwrap();

        let mut body = Cursor::new(b"object bytes".to_vec());
        let path = stage.put(ACTION, OUTPUT, &mut body, mod_time()).await.unwrap();

        let (output_id, got_path) = stage.get(ACTION).await.unwrap().expect("hit");
        assert_eq!(output_id, OUTPUT);
        assert_eq!(got_path, path);
        assert_eq!(tokio::fs::read(&got_path).await.unwrap(), b"object bytes");

        let mtime = tokio::fs::metadata(&got_path).await.unwrap().modified().unwrap();
        assert_eq!(mtime, mod_time());
    }

    #[tokio::test]
    async fn get_misses_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let stage = CacheDir::new(dir.path()).unwrap();
        assert!(stage.get(ACTION).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_local_record_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let stage = CacheDir::new(dir.path()).unwrap();
        let mut body = Cursor::new(b"x".to_vec());
        stage.put(ACTION, OUTPUT, &mut body, mod_time()).await.unwrap();

        std::fs::write(stage.action_path(ACTION), b"not a record at all").unwrap();
        assert!(stage.get(ACTION).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cleanup_removes_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        let stage = CacheDir::new(dir.path()).unwrap();
        let mut body = Cursor::new(b"x".to_vec());
        let out = stage.put(ACTION, OUTPUT, &mut body, mod_time()).await.unwrap();

        // Age both files well past any cutoff.
        let old = FileTime::from_unix_time(1000, 0);
        filetime::set_file_mtime(&out, old).unwrap();
        filetime::set_file_mtime(stage.action_path(ACTION), old).unwrap();

        let removed = stage.cleanup_older_than(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(removed, 2);
        assert!(stage.get(ACTION).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn write_atomic_sets_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aa").join("aa00");
        let mut body = Cursor::new(b"data".to_vec());
        let n = write_atomic(&path, &mut body, 0o644).await.unwrap();
        assert_eq!(n, 4);
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }
}
