//! Buffer Mirror (§2 item 9, §5): editor-authoritative latest text per open
//! file, consulted for completion context (§4.7). Writes come from the
//! request thread and are non-blocking; reads are read-dominant and come
//! from the analysis worker. Kept language/protocol-neutral — callers pass
//! plain `PathBuf`s, never LSP `Url`s, so the core stays usable from any
//! transport.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct BufferedDocument {
    pub text: String,
    pub version: i32,
}

#[derive(Default)]
pub struct BufferMirror {
    documents: Mutex<HashMap<PathBuf, BufferedDocument>>,
}

impl BufferMirror {
    /// Unconditional — buffer-edit loss never occurs (§7).
    pub fn open(&self, path: PathBuf, text: String, version: i32) {
        self.documents
            .lock()
            .unwrap()
            .insert(path, BufferedDocument { text, version });
    }

    pub fn update(&self, path: &Path, text: String, version: i32) -> bool {
        let mut docs = self.documents.lock().unwrap();
        if let Some(doc) = docs.get_mut(path) {
            doc.text = text;
            doc.version = version;
            true
        } else {
            docs.insert(path.to_path_buf(), BufferedDocument { text, version });
            true
        }
    }

    pub fn close(&self, path: &Path) -> bool {
        self.documents.lock().unwrap().remove(path).is_some()
    }

    pub fn get(&self, path: &Path) -> Option<BufferedDocument> {
        self.documents.lock().unwrap().get(path).cloned()
    }

    pub fn is_open(&self, path: &Path) -> bool {
        self.documents.lock().unwrap().contains_key(path)
    }

    pub fn open_paths(&self) -> Vec<PathBuf> {
        self.documents.lock().unwrap().keys().cloned().collect()
    }
}
