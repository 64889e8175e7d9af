//! Filesystem document store: `<root>/<project_id>/<document file>`.
//!
//! Writes go to a temporary sibling file which is then renamed over the
//! target, so readers (including the polling watcher) never observe a
//! half-written document.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::{DocumentStore, StoreError};
use crate::protocol::DocumentType;

pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of a document.
    pub fn document_path(&self, project_id: &str, document_type: DocumentType) -> PathBuf {
        self.root.join(project_id).join(document_type.file_name())
    }
}

impl DocumentStore for FsDocumentStore {
    fn read(&self, project_id: &str, document_type: DocumentType) -> Result<Option<String>, StoreError> {
        match std::fs::read_to_string(self.document_path(project_id, document_type)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, project_id: &str, document_type: DocumentType, content: &str) -> Result<(), StoreError> {
        let path = self.document_path(project_id, document_type);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}
