//! Hosts-style alias file for local name resolution.
//!
//! One `<address> <hostname>` line per redirection. The file is only
//! ever appended to or rewritten without a given hostname; other lines
//! are preserved. Writers are serialized through one lock shared by
//! every clone, so a rewrite never drops a concurrent append.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{ExposeError, ExposeResult};

#[derive(Debug, Clone)]
pub struct AliasFile {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl AliasFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn add(&self, address: &str, hostname: &str) -> ExposeResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.err(e))?;
        file.write_all(format!("{address} {hostname}\n").as_bytes())
            .await
            .map_err(|e| self.err(e))
    }

    /// Drop every line naming `hostname`. A missing file is not an error.
    pub async fn remove(&self, hostname: &str) -> ExposeResult<()> {
        let _guard = self.write_lock.lock().await;
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(self.err(e)),
        };
        let kept: String = content
            .lines()
            .filter(|line| !line.split_whitespace().skip(1).any(|h| h == hostname))
            .map(|line| format!("{line}\n"))
            .collect();
        tokio::fs::write(&self.path, kept)
            .await
            .map_err(|e| self.err(e))
    }

    /// Hostnames currently listed for `address`.
    pub async fn lookup(&self, address: &str) -> ExposeResult<Vec<String>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.err(e)),
        };
        Ok(content
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                (parts.next() == Some(address)).then(|| parts.map(str::to_string).collect::<Vec<_>>())
            })
            .flatten()
            .collect())
    }

    fn err(&self, source: std::io::Error) -> ExposeError {
        ExposeError::Alias {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_and_remove_preserves_other_lines() {
        let dir = tempfile::tempdir().unwrap();
        let aliases = AliasFile::new(dir.path().join("hosts"));

        aliases.add("10.244.0.5", "web-staging.local").await.unwrap();
        aliases.add("10.244.0.6", "api-staging.local").await.unwrap();
        assert_eq!(
            aliases.lookup("10.244.0.5").await.unwrap(),
            vec!["web-staging.local".to_string()]
        );

        aliases.remove("web-staging.local").await.unwrap();
        let content = tokio::fs::read_to_string(aliases.path()).await.unwrap();
        assert_eq!(content, "10.244.0.6 api-staging.local\n");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_adds_survive_removes() {
        let dir = tempfile::tempdir().unwrap();
        let aliases = Arc::new(AliasFile::new(dir.path().join("hosts")));
        for i in 0..20 {
            aliases.add("10.0.0.1", &format!("old{i}.local")).await.unwrap();
        }

        let mut handles = Vec::new();
        for i in 0..20 {
            let adder = aliases.clone();
            handles.push(tokio::spawn(async move {
                adder.add("10.0.0.2", &format!("new{i}.local")).await
            }));
            let remover = aliases.clone();
            handles.push(tokio::spawn(async move {
                remover.remove(&format!("old{i}.local")).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert!(aliases.lookup("10.0.0.1").await.unwrap().is_empty());
        let mut added = aliases.lookup("10.0.0.2").await.unwrap();
        added.sort();
        let mut expected: Vec<String> = (0..20).map(|i| format!("new{i}.local")).collect();
        expected.sort();
        assert_eq!(added, expected);
    }

    #[tokio::test]
    async fn remove_from_missing_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let aliases = AliasFile::new(dir.path().join("absent"));
        aliases.remove("web-staging.local").await.unwrap();
        assert!(aliases.lookup("10.0.0.1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unwritable_path_is_alias_error() {
        let aliases = AliasFile::new("/nonexistent-dir/hosts");
        let err = aliases.add("10.0.0.1", "x").await.unwrap_err();
        assert!(matches!(err, ExposeError::Alias { .. }));
    }
}
