//! Resolve messages to the store that owns them during a rebuild.
//!
//! The fast path looks the message's talker hash up in the stores' talker
//! sets; when a talker spans several stores (one file per month, say) the
//! store whose time window covers the message wins. Anything else goes to
//! the datasource, and its answer is mapped back onto a registered store by
//! file path, then by ID.

use anyhow::Result;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use crate::datasource::Datasource;
use crate::error::IndexError;
use crate::models::{talker_hash, Message, MessageStore};

/// Lexically resolve `.` and `..` so equivalent spellings compare equal.
fn clean_path(path: &Path) -> PathBuf {
    let mut parts: Vec<Component> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match parts.last().copied() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                // `..` at the root stays at the root
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => parts.push(component),
            },
            _ => parts.push(component),
        }
    }
    parts.iter().collect()
}

pub struct StoreLocator<'a> {
    by_id: HashMap<&'a str, &'a MessageStore>,
    by_path: HashMap<PathBuf, &'a MessageStore>,
    by_talker: HashMap<&'a str, Vec<&'a MessageStore>>,
}

impl<'a> StoreLocator<'a> {
    pub fn new(stores: &'a [MessageStore]) -> Self {
        let mut by_id = HashMap::with_capacity(stores.len());
        let mut by_path = HashMap::with_capacity(stores.len());
        let mut by_talker: HashMap<&str, Vec<&MessageStore>> = HashMap::new();
        for store in stores {
            by_id.insert(store.id.as_str(), store);
            if !store.file_path.as_os_str().is_empty() {
                by_path.insert(clean_path(&store.file_path), store);
            }
            for hash in &store.talkers {
                by_talker.entry(hash.as_str()).or_default().push(store);
            }
        }
        Self {
            by_id,
            by_path,
            by_talker,
        }
    }

    pub fn store(&self, id: &str) -> Option<&'a MessageStore> {
        self.by_id.get(id).copied()
    }

    pub fn locate(&self, datasource: &dyn Datasource, msg: &Message) -> Result<&'a MessageStore> {
        let talker = msg.talker.trim();
        if !talker.is_empty() {
            if let Some(candidates) = self.by_talker.get(talker_hash(talker).as_str()) {
                if let [only] = candidates.as_slice() {
                    return Ok(*only);
                }
                if let Some(store) = candidates.iter().find(|s| s.covers(&msg.time)) {
                    return Ok(*store);
                }
            }
        }

        let located = datasource
            .locate_message_store(msg)?
            .ok_or_else(|| IndexError::StoreNotFound(talker.to_string()))?;
        if let Some(store) = self.by_path.get(&clean_path(&located.file_path)) {
            return Ok(*store);
        }
        if let Some(store) = self.by_id.get(located.id.as_str()) {
            return Ok(*store);
        }
        Err(IndexError::StoreNotRegistered(located.file_path.display().to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::MessageSink;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use tokio_util::sync::CancellationToken;

    struct FixedLocate(Option<MessageStore>);

    #[async_trait]
    impl Datasource for FixedLocate {
        async fn list_message_stores(&self) -> Result<Vec<MessageStore>> {
            Ok(Vec::new())
        }
        fn locate_message_store(&self, _msg: &Message) -> Result<Option<MessageStore>> {
            Ok(self.0.clone())
        }
        async fn dataset_fingerprint(&self) -> Result<String> {
            Ok("fp".to_string())
        }
        async fn list_talkers(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn iterate_messages(
            &self,
            _cancel: &CancellationToken,
            _talkers: &[String],
            _sink: MessageSink,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn message(talker: &str, unix: i64) -> Message {
        Message {
            seq: 1,
            time: ts(unix),
            talker: talker.to_string(),
            talker_name: String::new(),
            sender: "s".to_string(),
            sender_name: String::new(),
            is_self: false,
            kind: 1,
            content: "hi".to_string(),
        }
    }

    fn monthly(id: &str, start: i64, end: i64, talker: &str) -> MessageStore {
        let mut store = MessageStore::new(id, format!("/data/{id}.db"));
        store.start_time = Some(ts(start));
        store.end_time = Some(ts(end));
        store.add_talker(talker);
        store
    }

    #[test]
    fn talker_hash_picks_store_by_time_window() {
        let stores = vec![monthly("m1", 0, 100, "room"), monthly("m2", 100, 200, "room")];
        let locator = StoreLocator::new(&stores);
        let ds = FixedLocate(None);
        assert_eq!(locator.locate(&ds, &message("room", 50)).unwrap().id, "m1");
        assert_eq!(locator.locate(&ds, &message("room", 150)).unwrap().id, "m2");
    }

    #[test]
    fn falls_back_to_datasource_and_maps_by_path() {
        let stores = vec![monthly("m1", 0, 100, "room")];
        let locator = StoreLocator::new(&stores);
        let mut located = MessageStore::new("other-id", "/data/./m1.db");
        located.add_talker("dm");
        let ds = FixedLocate(Some(located));
        assert_eq!(locator.locate(&ds, &message("dm", 10)).unwrap().id, "m1");
    }

    #[test]
    fn parent_dir_segments_resolve_before_path_lookup() {
        let stores = vec![monthly("m1", 0, 100, "room")];
        let locator = StoreLocator::new(&stores);
        let ds = FixedLocate(Some(MessageStore::new("other-id", "/data/x/../m1.db")));
        assert_eq!(locator.locate(&ds, &message("dm", 10)).unwrap().id, "m1");

        assert_eq!(clean_path(Path::new("/../data/./a/../b.db")), PathBuf::from("/data/b.db"));
        assert_eq!(clean_path(Path::new("../a/./b/..")), PathBuf::from("../a"));
    }

    #[test]
    fn unknown_store_is_an_error() {
        let stores = vec![monthly("m1", 0, 100, "room")];
        let locator = StoreLocator::new(&stores);

        let err = locator.locate(&FixedLocate(None), &message("dm", 10)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IndexError>(),
            Some(IndexError::StoreNotFound(t)) if t == "dm"
        ));

        let stray = FixedLocate(Some(MessageStore::new("m9", "/data/m9.db")));
        let err = locator.locate(&stray, &message("dm", 10)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IndexError>(),
            Some(IndexError::StoreNotRegistered(_))
        ));
    }
}
