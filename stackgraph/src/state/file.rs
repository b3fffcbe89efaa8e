//! A state backend storing one JSON document per stack on disk.
//!
//! Records live at `<root>/<organization>/<project>/<environment>.json`.
//! Writes go to a temporary sibling file first and are renamed into place,
//! so a reader never observes a half-written record.

use super::{StackState, StateBackend};
use crate::errors::BackendError;
use crate::stack::StackId;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File-system backed state storage.
#[derive(Debug, Clone)]
pub struct FileStateBackend {
    root: PathBuf,
}

impl FileStateBackend {
    /// Creates a backend rooted at `root`. The directory is created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the path of a stack's record.
    #[must_use]
    pub fn path_for(&self, stack: &StackId) -> PathBuf {
        self.root
            .join(stack.organization())
            .join(stack.project())
            .join(format!("{}.json", stack.environment()))
    }
}

fn map_io(context: &str, err: &std::io::Error) -> BackendError {
    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock => {
            BackendError::Transient(format!("{context}: {err}"))
        }
        _ => BackendError::Permanent(format!("{context}: {err}")),
    }
}

async fn read_dir_names(path: &Path, dirs: bool) -> Result<Vec<String>, BackendError> {
    let mut entries = match tokio::fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(map_io("listing state", &err)),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| map_io("listing state", &e))?
    {
        let file_type = entry
            .file_type()
            .await
            .map_err(|e| map_io("listing state", &e))?;
        if file_type.is_dir() == dirs {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

#[async_trait]
impl StateBackend for FileStateBackend {
    async fn read(&self, stack: &StackId) -> Result<Option<StackState>, BackendError> {
        let path = self.path_for(stack);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(map_io(&format!("reading {}", path.display()), &err)),
        };

        let state: StackState =
            serde_json::from_slice(&bytes).map_err(|e| BackendError::Corrupt {
                stack: stack.clone(),
                message: e.to_string(),
            })?;

        if &state.stack != stack {
            return Err(BackendError::Corrupt {
                stack: stack.clone(),
                message: format!("record belongs to '{}'", state.stack),
            });
        }

        debug!(stack = %stack, revision = state.revision, "Read stack state");
        Ok(Some(state))
    }

    async fn write(&self, state: &StackState) -> Result<(), BackendError> {
        let path = self.path_for(&state.stack);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io("creating state directory", &e))?;
        }

        let bytes = serde_json::to_vec_pretty(state)
            .map_err(|e| BackendError::Permanent(format!("encoding state: {e}")))?;

        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| map_io(&format!("writing {}", tmp.display()), &e))?;

        if let Err(err) = tokio::fs::rename(&tmp, &path).await {
            if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
                warn!(path = %tmp.display(), error = %cleanup, "Failed to remove temporary state file");
            }
            return Err(map_io(&format!("replacing {}", path.display()), &err));
        }

        debug!(stack = %state.stack, revision = state.revision, path = %path.display(), "Wrote stack state");
        Ok(())
    }

    async fn delete(&self, stack: &StackId) -> Result<bool, BackendError> {
        let path = self.path_for(stack);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(map_io(&format!("deleting {}", path.display()), &err)),
        }
    }

    async fn list(&self) -> Result<Vec<StackId>, BackendError> {
        let mut stacks = Vec::new();
        for org in read_dir_names(&self.root, true).await? {
            let org_dir = self.root.join(&org);
            for project in read_dir_names(&org_dir, true).await? {
                for file in read_dir_names(&org_dir.join(&project), false).await? {
                    let Some(env) = file.strip_suffix(".json") else {
                        continue;
                    };
                    match StackId::new(org.clone(), project.clone(), env) {
                        Ok(id) => stacks.push(id),
                        Err(err) => warn!(file = %file, error = %err, "Ignoring unrecognized state file"),
                    }
                }
            }
        }
        stacks.sort();
        Ok(stacks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn stack(s: &str) -> StackId {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileStateBackend::new(dir.path());
        let id = stack("mirrorboards/actaboards-api/dev");

        let mut state = StackState::new(id.clone());
        state.revision = 3;
        state.publish_output("Namespace", json!("actaboards"), 3);
        backend.write(&state).await.unwrap();

        assert!(dir
            .path()
            .join("mirrorboards/actaboards-api/dev.json")
            .exists());
        assert_eq!(backend.read(&id).await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn test_missing_record_reads_none() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileStateBackend::new(dir.path());
        assert_eq!(backend.read(&stack("acme/none/dev")).await.unwrap(), None);
        assert!(!backend.delete(&stack("acme/none/dev")).await.unwrap());
        assert!(backend.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileStateBackend::new(dir.path());
        let id = stack("acme/db/dev");
        let path = backend.path_for(&id);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{not json").unwrap();

        let err = backend.read(&id).await.unwrap_err();
        assert!(matches!(err, BackendError::Corrupt { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileStateBackend::new(dir.path());
        for id in ["acme/db/dev", "acme/api/dev", "acme/api/prod"] {
            backend.write(&StackState::new(stack(id))).await.unwrap();
        }

        assert_eq!(
            backend.list().await.unwrap(),
            vec![stack("acme/api/dev"), stack("acme/api/prod"), stack("acme/db/dev")]
        );
        assert!(backend.delete(&stack("acme/api/dev")).await.unwrap());
        assert_eq!(backend.list().await.unwrap().len(), 2);
    }
}
