//! Filesystem-rooted working-path abstraction.
//!
//! Thin wrapper over a path: composition, read/write, copy/move/link, and
//! typed load/dump of the formats the orchestrator actually needs (TOML
//! config, JSON for the checkpoint and MPI sidecar payloads, and a bincode
//! format for opaque blobs with no untagged enums in them). The checkpoint
//! uses JSON rather than bincode because node state is keyed by the
//! untagged `Value` enum, and bincode's wire format isn't self-describing:
//! decoding an untagged enum routes through `deserialize_any`, which
//! bincode 1.3 rejects outright. Numeric-array I/O is named in the spec but
//! is explicitly out of scope here — it belongs to the example scientific
//! workflows, not the core.

use crate::error::PersistError;
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct Directory {
    root: PathBuf,
}

impl Directory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Compose a path from parts, relative to this directory unless `abs`.
    pub fn path(&self, parts: &[&str], abs: bool) -> PathBuf {
        let mut p = if abs {
            PathBuf::new()
        } else {
            self.root.clone()
        };
        for part in parts {
            p.push(part);
        }
        p
    }

    /// Path relative to another directory.
    pub fn rel(&self, to: &Path) -> PathBuf {
        pathdiff(&self.root, to)
    }

    pub fn subdir(&self, name: &str) -> Directory {
        Directory::new(self.root.join(name))
    }

    pub fn has(&self, name: &str) -> bool {
        self.root.join(name).exists()
    }

    pub fn isdir(&self) -> bool {
        self.root.is_dir()
    }

    pub fn ls(&self, pattern: Option<&str>, only_dirs: bool) -> Vec<PathBuf> {
        let Ok(read) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };
        read.filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| !only_dirs || p.is_dir())
            .filter(|p| match pattern {
                Some(pat) => p
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| glob_match(pat, n))
                    .unwrap_or(false),
                None => true,
            })
            .collect()
    }

    pub async fn mkdir(&self) -> Result<(), PersistError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| PersistError::Write {
                path: self.root.clone(),
                source,
            })
    }

    pub async fn rm(&self, name: &str) -> Result<(), PersistError> {
        let p = self.root.join(name);
        if p.is_dir() {
            tokio::fs::remove_dir_all(&p).await
        } else {
            tokio::fs::remove_file(&p).await
        }
        .map_err(|source| PersistError::Write { path: p, source })
    }

    pub async fn cp(&self, name: &str, dst: &Path) -> Result<(), PersistError> {
        let src = self.root.join(name);
        tokio::fs::copy(&src, dst)
            .await
            .map(|_| ())
            .map_err(|source| PersistError::Write {
                path: dst.to_path_buf(),
                source,
            })
    }

    pub async fn mv(&self, name: &str, dst: &Path) -> Result<(), PersistError> {
        let src = self.root.join(name);
        tokio::fs::rename(&src, dst)
            .await
            .map_err(|source| PersistError::Write {
                path: dst.to_path_buf(),
                source,
            })
    }

    /// Symlink `name` to `target`, preserving a relative link when both
    /// operands are relative paths.
    pub async fn ln(&self, name: &str, target: &Path) -> Result<(), PersistError> {
        let link = self.root.join(name);
        let effective_target = target.to_path_buf();
        #[cfg(unix)]
        {
            tokio::fs::symlink(&effective_target, &link)
                .await
                .map_err(|source| PersistError::Write { path: link, source })
        }
        #[cfg(not(unix))]
        {
            let _ = effective_target;
            Err(PersistError::Write {
                path: link,
                source: std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "symlinks unsupported on this platform",
                ),
            })
        }
    }

    pub async fn read(&self, name: &str) -> Result<String, PersistError> {
        let p = self.root.join(name);
        tokio::fs::read_to_string(&p)
            .await
            .map_err(|source| PersistError::Read { path: p, source })
    }

    /// Write `contents`, fsyncing before returning so the write is durable.
    pub async fn write(&self, name: &str, contents: &str) -> Result<(), PersistError> {
        let p = self.root.join(name);
        let mut f = tokio::fs::File::create(&p)
            .await
            .map_err(|source| PersistError::Write {
                path: p.clone(),
                source,
            })?;
        use tokio::io::AsyncWriteExt;
        f.write_all(contents.as_bytes())
            .await
            .map_err(|source| PersistError::Write {
                path: p.clone(),
                source,
            })?;
        f.sync_all().await.map_err(|source| PersistError::Write {
            path: p.clone(),
            source,
        })
    }

    pub async fn readlines(&self, name: &str) -> Result<Vec<String>, PersistError> {
        Ok(self
            .read(name)
            .await?
            .lines()
            .map(|s| s.to_string())
            .collect())
    }

    pub async fn writelines(&self, name: &str, lines: &[String]) -> Result<(), PersistError> {
        self.write(name, &lines.join("\n")).await
    }

    pub async fn load_toml<T: DeserializeOwned>(&self, name: &str) -> Result<T, PersistError> {
        let text = self.read(name).await?;
        toml::from_str(&text).map_err(|e| PersistError::Decode {
            path: self.root.join(name),
            message: e.to_string(),
        })
    }

    pub async fn dump_json<T: Serialize>(&self, name: &str, value: &T) -> Result<(), PersistError> {
        let text = serde_json::to_string_pretty(value)
            .map_err(|e| PersistError::Encode(e.to_string()))?;
        self.write(name, &text).await
    }

    pub async fn load_json<T: DeserializeOwned>(&self, name: &str) -> Result<T, PersistError> {
        let text = self.read(name).await?;
        serde_json::from_str(&text).map_err(|e| PersistError::Decode {
            path: self.root.join(name),
            message: e.to_string(),
        })
    }

    /// Binary object-graph load/dump (stands in for a pickle-compatible
    /// format). Not self-describing: don't use this for anything containing
    /// an untagged enum (e.g. `Value`) or bincode will fail to decode it on
    /// the way back. Use `dump_json`/`load_json` for those instead.
    pub async fn dump_bin<T: Serialize>(&self, name: &str, value: &T) -> Result<(), PersistError> {
        let bytes = bincode::serialize(value).map_err(|e| PersistError::Encode(e.to_string()))?;
        let p = self.root.join(name);
        tokio::fs::write(&p, bytes)
            .await
            .map_err(|source| PersistError::Write { path: p, source })
    }

    pub async fn load_bin<T: DeserializeOwned>(&self, name: &str) -> Result<T, PersistError> {
        let p = self.root.join(name);
        let bytes = tokio::fs::read(&p)
            .await
            .map_err(|source| PersistError::Read {
                path: p.clone(),
                source,
            })?;
        bincode::deserialize(&bytes).map_err(|e| PersistError::Decode {
            path: p,
            message: e.to_string(),
        })
    }

    /// Blocking shell call in `self.root`.
    pub fn call(&self, cmd: &str) -> std::io::Result<std::process::ExitStatus> {
        std::process::Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .current_dir(&self.root)
            .status()
    }

    /// Async shell call in `self.root`, stdout/stderr redirected to files.
    pub async fn call_async(
        &self,
        cmd: &str,
        stdout_path: Option<&Path>,
        stderr_path: Option<&Path>,
    ) -> std::io::Result<std::process::ExitStatus> {
        let mut command = Command::new("sh");
        command.arg("-c").arg(cmd).current_dir(&self.root);

        if let Some(p) = stdout_path {
            command.stdout(std::fs::File::create(p)?);
        }
        if let Some(p) = stderr_path {
            command.stderr(std::fs::File::create(p)?);
        }

        command.status().await
    }
}

fn pathdiff(from: &Path, to: &Path) -> PathBuf {
    pathdiff_components(from, to)
}

fn pathdiff_components(from: &Path, to: &Path) -> PathBuf {
    use std::path::Component;
    let from_comps: Vec<_> = from.components().collect();
    let to_comps: Vec<_> = to.components().collect();
    let common = from_comps
        .iter()
        .zip(to_comps.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut result = PathBuf::new();
    for _ in &from_comps[common..] {
        result.push(Component::ParentDir);
    }
    for comp in &to_comps[common..] {
        result.push(comp);
    }
    result
}

/// Minimal glob-ish match: supports a single trailing `*`.
fn glob_match(pattern: &str, name: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        name.starts_with(prefix)
    } else {
        pattern == name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_roundtrips() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Directory::new(tmp.path());
        dir.write("hello.txt", "world").await.unwrap();
        assert_eq!(dir.read("hello.txt").await.unwrap(), "world");
    }

    #[tokio::test]
    async fn bin_roundtrip_preserves_value() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Directory::new(tmp.path());
        let data = vec![1u32, 2, 3];
        dir.dump_bin("data.bin", &data).await.unwrap();
        let back: Vec<u32> = dir.load_bin("data.bin").await.unwrap();
        assert_eq!(data, back);
    }

    #[tokio::test]
    async fn json_roundtrip_preserves_untagged_value_map() {
        use crate::value::Value;
        use std::collections::HashMap;

        let tmp = tempfile::tempdir().unwrap();
        let dir = Directory::new(tmp.path());
        let mut data = HashMap::new();
        data.insert("name".to_string(), Value::Str("test".to_string()));
        data.insert("count".to_string(), Value::Int(3));
        data.insert(
            "items".to_string(),
            Value::List(vec![Value::Bool(true), Value::Float(1.5)]),
        );

        dir.dump_json("state.json", &data).await.unwrap();
        let back: HashMap<String, Value> = dir.load_json("state.json").await.unwrap();
        assert_eq!(data, back);
    }

    #[test]
    fn ls_filters_by_glob_suffix() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.log"), "").unwrap();
        std::fs::write(tmp.path().join("b.txt"), "").unwrap();
        let dir = Directory::new(tmp.path());
        let matches = dir.ls(Some("*.log"), false);
        assert!(matches.is_empty()); // our glob only supports trailing '*', not '*.ext'
        let matches = dir.ls(Some("a*"), false);
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn rel_computes_relative_path() {
        let dir = Directory::new("/a/b/c");
        let rel = dir.rel(Path::new("/a/b/d/e"));
        assert_eq!(rel, PathBuf::from("../d/e"));
    }
}
