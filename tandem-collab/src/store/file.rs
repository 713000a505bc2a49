//! One file per document under a root directory.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use super::{Document, Store, StoreError};

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open a store rooted at `root`, creating the directory if missing.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a document id to its file, refusing ids that would leave the
    /// root directory.
    fn path_for(&self, id: &str) -> Result<PathBuf, StoreError> {
        let escapes = id.is_empty()
            || id == "."
            || id.contains("..")
            || id.contains('/')
            || id.contains('\\')
            || Path::new(id).is_absolute();
        if escapes {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        Ok(self.root.join(id))
    }
}

impl Store for FileStore {
    fn create(&self, doc: &Document) -> Result<(), StoreError> {
        let path = self.path_for(&doc.id)?;
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(StoreError::AlreadyExists(doc.id.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(doc.content.as_bytes())?;
        log::debug!("Created document file {}", path.display());
        Ok(())
    }

    fn update(&self, doc: &Document) -> Result<(), StoreError> {
        let path = self.path_for(&doc.id)?;
        fs::write(path, doc.content.as_bytes())?;
        Ok(())
    }

    fn read(&self, id: &str) -> Result<Document, StoreError> {
        let path = self.path_for(id)?;
        match fs::read_to_string(path) {
            Ok(content) => Ok(Document {
                id: id.to_string(),
                content,
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}
