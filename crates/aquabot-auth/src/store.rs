//! Durable `KEY=value` storage for the current credential.

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StoreError;
use crate::types::{Credential, write_atomic};

/// Key under which the credential is stored unless configured otherwise.
pub const DEFAULT_CREDENTIAL_KEY: &str = "CREDENTIAL";

/// Text-file backed store holding the credential among other config lines.
///
/// Saves are read-modify-write cycles serialized through one async mutex and
/// finished with an atomic rename.
pub struct PersistedConfigStore {
    path: PathBuf,
    key: String,
    write_lock: Mutex<()>,
}

impl PersistedConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            key: DEFAULT_CREDENTIAL_KEY.to_string(),
            write_lock: Mutex::new(()),
        }
    }

    /// Store the credential under a different key (e.g. `OPENROUTER_API_KEY`).
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Load the stored credential. Missing files, missing lines and values
    /// that fail validation all read as `None`.
    pub async fn load(&self) -> Result<Option<Credential>, StoreError> {
        let content = self.read_existing().await?;
        Ok(find_value(&content, &self.key).and_then(Credential::parse))
    }

    /// Replace the credential line, or append it when absent.
    pub async fn save(&self, credential: &Credential) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let existing = self.read_existing().await?;
        let updated = upsert_line(&existing, &self.key, credential.value());
        write_atomic(&self.path, &updated)
            .await
            .map_err(|error| StoreError::io(&self.path, error))?;

        debug!(path = %self.path.display(), credential = %credential.masked(), "Credential persisted");
        Ok(())
    }

    async fn read_existing(&self) -> Result<String, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(error) => Err(StoreError::io(&self.path, error)),
        }
    }
}

fn find_value<'a>(content: &'a str, key: &str) -> Option<&'a str> {
    content.lines().find_map(|line| {
        let rest = line.trim_start().strip_prefix(key)?.strip_prefix('=')?;
        let value = rest.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        Some(value)
    })
}

/// Rewrite `content` so exactly one `key=value` line exists. Duplicate lines
/// left by older writers are collapsed into the first occurrence.
fn upsert_line(content: &str, key: &str, value: &str) -> String {
    let prefix = format!("{}=", key);
    let replacement = format!("{}{}", prefix, value);

    let mut lines = Vec::new();
    let mut written = false;
    for line in content.lines() {
        if line.trim_start().starts_with(&prefix) {
            if !written {
                lines.push(replacement.clone());
                written = true;
            }
            continue;
        }
        lines.push(line.to_string());
    }
    if !written {
        lines.push(replacement);
    }

    let mut output = lines.join("\n");
    output.push('\n');
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn credential(value: &str) -> Credential {
        Credential::parse(value).unwrap()
    }

    fn count_key_lines(content: &str, key: &str) -> usize {
        let prefix = format!("{}=", key);
        content.lines().filter(|line| line.starts_with(&prefix)).count()
    }

    #[tokio::test]
    async fn load_missing_file_is_empty() {
        let temp = tempdir().unwrap();
        let store = PersistedConfigStore::new(temp.path().join(".env"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn load_ignores_malformed_values() {
        let temp = tempdir().unwrap();
        let path = temp.path().join(".env");
        std::fs::write(&path, "MODEL=llama\nCREDENTIAL=not-a-key\n").unwrap();

        let store = PersistedConfigStore::new(&path);
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load_returns_saved_value() {
        let temp = tempdir().unwrap();
        let path = temp.path().join(".env");
        let store = PersistedConfigStore::new(&path);

        store.save(&credential("sk-or-v1-first1")).await.unwrap();
        store.save(&credential("sk-or-v1-second2")).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.value(), "sk-or-v1-second2");

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(count_key_lines(&content, "CREDENTIAL"), 1);
    }

    #[tokio::test]
    async fn save_replaces_in_place_and_keeps_other_lines() {
        let temp = tempdir().unwrap();
        let path = temp.path().join(".env");
        std::fs::write(
            &path,
            "OPENROUTER_MODEL=meta-llama/llama-4-maverick:free\nCREDENTIAL=sk-or-v1-old123\nCREDENTIAL_LABEL=bot\n",
        )
        .unwrap();

        let store = PersistedConfigStore::new(&path);
        store.save(&credential("sk-or-v1-new456")).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "OPENROUTER_MODEL=meta-llama/llama-4-maverick:free\nCREDENTIAL=sk-or-v1-new456\nCREDENTIAL_LABEL=bot\n"
        );
    }

    #[tokio::test]
    async fn save_appends_when_absent_and_collapses_duplicates() {
        let temp = tempdir().unwrap();
        let path = temp.path().join(".env");
        std::fs::write(&path, "A=1\nB=2").unwrap();

        let store = PersistedConfigStore::new(&path).with_key("OPENROUTER_API_KEY");
        store.save(&credential("sk-or-v1-abc")).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "A=1\nB=2\nOPENROUTER_API_KEY=sk-or-v1-abc\n"
        );

        std::fs::write(
            &path,
            "OPENROUTER_API_KEY=sk-or-v1-a\nX=1\nOPENROUTER_API_KEY=sk-or-v1-b\n",
        )
        .unwrap();
        store.save(&credential("sk-or-v1-c")).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "OPENROUTER_API_KEY=sk-or-v1-c\nX=1\n"
        );
    }

    #[tokio::test]
    async fn load_accepts_quoted_values() {
        let temp = tempdir().unwrap();
        let path = temp.path().join(".env");
        std::fs::write(&path, "CREDENTIAL=\"sk-or-v1-quoted9\"\n").unwrap();

        let store = PersistedConfigStore::new(&path);
        assert_eq!(store.load().await.unwrap().unwrap().value(), "sk-or-v1-quoted9");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_saves_never_duplicate_the_line() {
        let temp = tempdir().unwrap();
        let path = temp.path().join(".env");
        std::fs::write(&path, "KEEP=me\n").unwrap();
        let store = Arc::new(PersistedConfigStore::new(&path));

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .save(&credential(&format!("sk-or-v1-key{}", i)))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(count_key_lines(&content, "CREDENTIAL"), 1);
        assert!(content.starts_with("KEEP=me\n"));
        assert!(store.load().await.unwrap().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn save_reports_unwritable_storage() {
        let temp = tempdir().unwrap();
        // A directory at the store path can be neither read nor replaced.
        let path = temp.path().join("occupied");
        std::fs::create_dir_all(path.join("child")).unwrap();

        let store = PersistedConfigStore::new(&path);
        let result = store.save(&credential("sk-or-v1-abc")).await;
        assert!(matches!(result, Err(StoreError::Io { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn save_keeps_private_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempdir().unwrap();
        let path = temp.path().join(".env");
        std::fs::write(&path, "BOT_TOKEN=abc\nCREDENTIAL=sk-or-v1-old123\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();

        let store = PersistedConfigStore::new(&path);
        store.save(&credential("sk-or-v1-new456")).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert_eq!(store.load().await.unwrap().unwrap().value(), "sk-or-v1-new456");
    }
}
