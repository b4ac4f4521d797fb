//! Durable conversation storage: one newline-terminated JSON file per
//! conversation, written atomically after each completed turn.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::conversation::Conversation;
use crate::errors::PersistenceError;

pub const DEFAULT_PRUNE_DAYS: i64 = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationMeta {
    pub id: String,
    pub title: String,
    pub updated_at: DateTime<Utc>,
}

pub struct ConversationStore {
    dir: PathBuf,
}

impl ConversationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Atomic snapshot: write to a temp file, fsync, rename into place.
    pub fn save(&self, conversation: &Conversation) -> Result<(), PersistenceError> {
        let final_path = self.path_for(&conversation.id);
        let temp_path = self.dir.join(format!("{}.json.tmp", conversation.id));

        let mut body = serde_json::to_vec(conversation).map_err(|e| PersistenceError::Corrupt {
            path: final_path.display().to_string(),
            message: e.to_string(),
        })?;
        body.push(b'\n');

        let mut file = fs::File::create(&temp_path)?;
        file.write_all(&body)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, &final_path)?;
        Ok(())
    }

    /// Metadata for every stored conversation, newest first. Bodies stay on
    /// disk: only id, title, and timestamp are materialized.
    pub fn list(&self) -> Result<Vec<ConversationMeta>, PersistenceError> {
        let mut metas = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            match Self::read_meta(&path) {
                Ok(meta) => metas.push(meta),
                Err(e) => tracing::warn!(path = %path.display(), "skipping unreadable conversation: {e}"),
            }
        }
        metas.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(metas)
    }

    fn read_meta(path: &Path) -> Result<ConversationMeta, PersistenceError> {
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| PersistenceError::Corrupt {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    pub fn load(&self, id: &str) -> Result<Conversation, PersistenceError> {
        let path = self.path_for(id);
        if !path.exists() {
            return Err(PersistenceError::NotFound(id.to_string()));
        }
        let raw = fs::read_to_string(&path)?;
        serde_json::from_str(&raw).map_err(|e| PersistenceError::Corrupt {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Delete conversations not updated within the horizon.
    pub fn prune(&self, horizon_days: i64) -> Result<usize, PersistenceError> {
        let cutoff = Utc::now() - Duration::days(horizon_days);
        let mut removed = 0;
        for meta in self.list()? {
            if meta.updated_at < cutoff {
                fs::remove_file(self.path_for(&meta.id))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::Message;
    use std::collections::HashMap;

    fn sample_conversation() -> Conversation {
        let mut conversation = Conversation::new();
        let mut histories = HashMap::new();
        histories.insert(
            "Echo".to_string(),
            vec![
                Message::user().with_text("ping"),
                Message::assistant().with_text("ping"),
            ],
        );
        conversation.record_turn("Echo", "ping", histories);
        conversation
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path()).unwrap();
        let conversation = sample_conversation();

        store.save(&conversation).unwrap();
        let loaded = store.load(&conversation.id).unwrap();
        // Canonical messages round-trip exactly, timestamps included
        assert_eq!(loaded, conversation);

        // Files are newline-terminated UTF-8 JSON
        let raw = std::fs::read_to_string(dir.path().join(format!("{}.json", conversation.id)))
            .unwrap();
        assert!(raw.ends_with('\n'));
    }

    #[test]
    fn test_list_newest_first_without_bodies() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path()).unwrap();

        let mut first = sample_conversation();
        first.updated_at = Utc::now() - Duration::days(2);
        store.save(&first).unwrap();
        let second = sample_conversation();
        store.save(&second).unwrap();

        let metas = store.list().unwrap();
        assert_eq!(metas.len(), 2);
        assert_eq!(metas[0].id, second.id);
        assert_eq!(metas[0].title, "ping");
    }

    #[test]
    fn test_load_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path()).unwrap();
        assert!(matches!(
            store.load("nope"),
            Err(PersistenceError::NotFound(_))
        ));
    }

    #[test]
    fn test_prune_removes_old_conversations() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path()).unwrap();

        let mut old = sample_conversation();
        old.updated_at = Utc::now() - Duration::days(45);
        store.save(&old).unwrap();
        let fresh = sample_conversation();
        store.save(&fresh).unwrap();

        let removed = store.prune(DEFAULT_PRUNE_DAYS).unwrap();
        assert_eq!(removed, 1);
        assert!(store.load(&old.id).is_err());
        assert!(store.load(&fresh.id).is_ok());
    }

    #[test]
    fn test_save_overwrites_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path()).unwrap();
        let mut conversation = sample_conversation();
        store.save(&conversation).unwrap();

        conversation.title = "updated".to_string();
        store.save(&conversation).unwrap();

        let loaded = store.load(&conversation.id).unwrap();
        assert_eq!(loaded.title, "updated");
        // No temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map_or(false, |x| x == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
