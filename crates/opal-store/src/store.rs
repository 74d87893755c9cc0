// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Append-only conversation tree with JSONL persistence.
//!
//! Edges point child → parent only.  `parent_id` is assigned from the
//! previous `current_id` at append time, so cycles cannot form.  The only
//! mutation besides append is [`MessageStore::replace_path_segment`], used by
//! compaction, which is atomic at the store boundary.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use opal_model::{Error, Message, Result};

/// First line of a persisted session file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHeader {
    pub session_id: String,
    #[serde(default)]
    pub current_id: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug)]
pub struct MessageStore {
    session_id: String,
    /// Insertion-ordered message ids; the map holds the records.
    order: Vec<String>,
    by_id: HashMap<String, Message>,
    current_id: Option<String>,
    metadata: Value,
}

impl MessageStore {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            order: Vec::new(),
            by_id: HashMap::new(),
            current_id: None,
            metadata: Value::Object(Default::default()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn current_id(&self) -> Option<&str> {
        self.current_id.as_deref()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn metadata(&self) -> &Value {
        &self.metadata
    }

    pub fn set_metadata_field(&mut self, key: &str, value: Value) {
        if let Value::Object(map) = &mut self.metadata {
            map.insert(key.to_string(), value);
        }
    }

    /// Session title, if one has been set.
    pub fn title(&self) -> Option<&str> {
        self.metadata.get("title").and_then(|v| v.as_str())
    }

    /// Append one message at the current position.  Sets `parent_id` to the
    /// current id and advances `current_id` to the new message.
    pub fn append(&mut self, mut msg: Message) -> Message {
        msg.parent_id = self.current_id.clone();
        self.current_id = Some(msg.id.clone());
        self.order.push(msg.id.clone());
        self.by_id.insert(msg.id.clone(), msg.clone());
        msg
    }

    /// Append a batch atomically, each message chained to the previous one.
    pub fn append_many(&mut self, msgs: Vec<Message>) -> Vec<Message> {
        msgs.into_iter().map(|m| self.append(m)).collect()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.by_id.get(id)
    }

    /// Root-to-current chain.  Empty when the store is empty.
    pub fn path(&self) -> Vec<Message> {
        match self.current_id.as_deref() {
            Some(id) => self.path_to_unchecked(id),
            None => Vec::new(),
        }
    }

    /// Root-first chain ending at `id`.
    pub fn path_to(&self, id: &str) -> Result<Vec<Message>> {
        if !self.by_id.contains_key(id) {
            return Err(Error::NotFound(format!("message {id}")));
        }
        Ok(self.path_to_unchecked(id))
    }

    fn path_to_unchecked(&self, id: &str) -> Vec<Message> {
        let mut chain = Vec::new();
        let mut cursor = Some(id.to_string());
        while let Some(cur) = cursor {
            match self.by_id.get(&cur) {
                Some(m) => {
                    cursor = m.parent_id.clone();
                    chain.push(m.clone());
                }
                None => break,
            }
        }
        chain.reverse();
        chain
    }

    /// Full tree grouped by parent id, children in insertion order.
    pub fn tree(&self) -> HashMap<Option<String>, Vec<Message>> {
        let mut grouped: HashMap<Option<String>, Vec<Message>> = HashMap::new();
        for id in &self.order {
            if let Some(m) = self.by_id.get(id) {
                grouped.entry(m.parent_id.clone()).or_default().push(m.clone());
            }
        }
        grouped
    }

    /// Re-point `current_id` at an existing message.  Later appends form a
    /// new branch from there.
    pub fn branch(&mut self, id: &str) -> Result<()> {
        if !self.by_id.contains_key(id) {
            return Err(Error::NotFound(format!("message {id}")));
        }
        self.current_id = Some(id.to_string());
        Ok(())
    }

    /// Atomically replace a path segment with a single summary message.
    ///
    /// The summary is anchored to the parent of the first removed message,
    /// every listed id is deleted, and any surviving child of a removed
    /// message is re-parented onto the summary so no survivor's parent chain
    /// can reach a removed id.  `current_id` follows the summary if it was
    /// inside the removed set.
    pub fn replace_path_segment(
        &mut self,
        ids_to_remove: &[String],
        mut summary: Message,
    ) -> Result<Message> {
        if ids_to_remove.is_empty() {
            return Err(Error::InvalidParams("empty segment".into()));
        }
        for id in ids_to_remove {
            if !self.by_id.contains_key(id) {
                return Err(Error::NotFound(format!("message {id}")));
            }
        }
        let removed: std::collections::HashSet<&str> =
            ids_to_remove.iter().map(String::as_str).collect();

        let first = &self.by_id[&ids_to_remove[0]];
        summary.parent_id = first.parent_id.clone();

        // Splice the summary into insertion order where the segment began.
        let insert_at = self
            .order
            .iter()
            .position(|id| id == &ids_to_remove[0])
            .unwrap_or(self.order.len());

        for id in ids_to_remove {
            self.by_id.remove(id);
        }
        self.order.retain(|id| !removed.contains(id.as_str()));
        self.order.insert(insert_at, summary.id.clone());

        for m in self.by_id.values_mut() {
            if m.parent_id.as_deref().is_some_and(|p| removed.contains(p)) {
                m.parent_id = Some(summary.id.clone());
            }
        }

        if self
            .current_id
            .as_deref()
            .is_some_and(|c| removed.contains(c))
        {
            self.current_id = Some(summary.id.clone());
        }

        self.by_id.insert(summary.id.clone(), summary.clone());
        debug!(
            removed = ids_to_remove.len(),
            summary_id = %summary.id,
            "replaced path segment"
        );
        Ok(summary)
    }

    /// Persist as newline-delimited JSON under `dir`, returning the file path.
    /// Line 1 is the header; each following line is one message.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.jsonl", self.session_id));
        let header = SessionHeader {
            session_id: self.session_id.clone(),
            current_id: self.current_id.clone(),
            metadata: self.metadata.clone(),
        };
        let mut buf = serde_json::to_string(&header)?;
        buf.push('\n');
        for id in &self.order {
            if let Some(m) = self.by_id.get(id) {
                buf.push_str(&serde_json::to_string(m)?);
                buf.push('\n');
            }
        }
        // Write to a sibling temp file first so a crash mid-write cannot
        // truncate the previous snapshot.
        let tmp = dir.join(format!("{}.jsonl.tmp", self.session_id));
        {
            let mut f = std::fs::File::create(&tmp)?;
            f.write_all(buf.as_bytes())?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(path)
    }

    /// Load a persisted session, replacing the store contents atomically:
    /// the file is parsed in full before anything is swapped in, so a
    /// malformed line can never leave a half-populated store.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut lines = text.lines().enumerate();

        let (_, header_line) = lines
            .next()
            .ok_or_else(|| Error::CorruptHeader("empty file".into()))?;
        let header: SessionHeader = serde_json::from_str(header_line)
            .map_err(|e| Error::CorruptHeader(e.to_string()))?;

        let mut store = Self::new(header.session_id);
        store.metadata = header.metadata;

        for (lineno, line) in lines {
            if line.trim().is_empty() {
                continue;
            }
            let msg: Message =
                serde_json::from_str(line).map_err(|e| Error::CorruptMessage {
                    line: lineno + 1,
                    reason: e.to_string(),
                })?;
            store.order.push(msg.id.clone());
            store.by_id.insert(msg.id.clone(), msg);
        }

        // The header's current_id must point into the store (or be null for
        // an empty session).
        if let Some(cur) = &header.current_id {
            if !store.by_id.contains_key(cur) {
                return Err(Error::CorruptHeader(format!(
                    "current_id {cur} not present in message lines"
                )));
            }
        }
        store.current_id = header.current_id;
        Ok(store)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use opal_model::Role;

    fn store_with(n: usize) -> MessageStore {
        let mut s = MessageStore::new("sess");
        for i in 0..n {
            if i % 2 == 0 {
                s.append(Message::user(format!("u{i}")));
            } else {
                s.append(Message::assistant(format!("a{i}")));
            }
        }
        s
    }

    // ── Append & path ─────────────────────────────────────────────────────────

    #[test]
    fn append_chains_parent_ids() {
        let mut s = MessageStore::new("t");
        let a = s.append(Message::user("a"));
        let b = s.append(Message::assistant("b"));
        assert_eq!(a.parent_id, None);
        assert_eq!(b.parent_id.as_deref(), Some(a.id.as_str()));
        assert_eq!(s.current_id(), Some(b.id.as_str()));
    }

    #[test]
    fn path_is_root_first() {
        let s = store_with(4);
        let path = s.path();
        assert_eq!(path.len(), 4);
        assert_eq!(path[0].parent_id, None);
        assert_eq!(path[0].text(), "u0");
        assert_eq!(path[3].text(), "a3");
    }

    #[test]
    fn empty_store_has_empty_path_and_no_current() {
        let s = MessageStore::new("t");
        assert!(s.path().is_empty());
        assert!(s.current_id().is_none());
    }

    #[test]
    fn append_many_chains_batch() {
        let mut s = MessageStore::new("t");
        let stored = s.append_many(vec![Message::user("1"), Message::assistant("2")]);
        assert_eq!(stored[1].parent_id.as_deref(), Some(stored[0].id.as_str()));
    }

    #[test]
    fn get_returns_message_by_id() {
        let mut s = MessageStore::new("t");
        let m = s.append(Message::user("x"));
        assert_eq!(s.get(&m.id).unwrap().text(), "x");
        assert!(s.get("nope").is_none());
    }

    // ── Branching ─────────────────────────────────────────────────────────────

    #[test]
    fn branch_repoints_current_and_path_ends_at_branch_point() {
        let mut s = store_with(4);
        let target = s.path()[1].id.clone();
        s.branch(&target).unwrap();
        let path = s.path();
        assert_eq!(path.len(), 2);
        assert_eq!(path[0].parent_id, None);
        assert_eq!(path.last().unwrap().id, target);
    }

    #[test]
    fn appends_after_branch_form_new_subtree() {
        let mut s = store_with(4);
        let target = s.path()[1].id.clone();
        s.branch(&target).unwrap();
        let forked = s.append(Message::user("fork"));
        assert_eq!(forked.parent_id.as_deref(), Some(target.as_str()));
        // Both children of `target` exist in the tree.
        let tree = s.tree();
        assert_eq!(tree[&Some(target)].len(), 2);
    }

    #[test]
    fn branch_unknown_id_is_not_found() {
        let mut s = store_with(2);
        assert!(matches!(s.branch("missing"), Err(Error::NotFound(_))));
    }

    // ── Segment replacement ───────────────────────────────────────────────────

    #[test]
    fn replace_segment_reparents_survivors_and_current() {
        let mut s = store_with(6);
        let path = s.path();
        let remove: Vec<String> = path[0..4].iter().map(|m| m.id.clone()).collect();
        let summary = s
            .replace_path_segment(&remove, Message::user("[summary]"))
            .unwrap();

        assert_eq!(summary.parent_id, None, "anchored to parent of first removed");
        let new_path = s.path();
        assert_eq!(new_path.len(), 3); // summary + 2 survivors
        assert_eq!(new_path[0].id, summary.id);
        assert_eq!(new_path[1].parent_id.as_deref(), Some(summary.id.as_str()));
        assert_eq!(new_path[2].text(), "a5");
    }

    #[test]
    fn replace_segment_moves_current_when_removed() {
        let mut s = store_with(3);
        let remove: Vec<String> = s.path().iter().map(|m| m.id.clone()).collect();
        let summary = s
            .replace_path_segment(&remove, Message::user("[all gone]"))
            .unwrap();
        assert_eq!(s.current_id(), Some(summary.id.as_str()));
        assert_eq!(s.path().len(), 1);
    }

    #[test]
    fn replace_segment_survivors_never_reach_removed_ids() {
        let mut s = store_with(8);
        let path = s.path();
        let remove: Vec<String> = path[1..5].iter().map(|m| m.id.clone()).collect();
        s.replace_path_segment(&remove, Message::user("[mid summary]"))
            .unwrap();
        let removed: std::collections::HashSet<_> = remove.iter().collect();
        for m in s.path() {
            let mut cursor = Some(m.id.clone());
            while let Some(cur) = cursor {
                assert!(!removed.contains(&cur), "walked into removed id {cur}");
                cursor = s.get(&cur).and_then(|m| m.parent_id.clone());
            }
        }
    }

    #[test]
    fn replace_segment_unknown_id_fails_without_mutation() {
        let mut s = store_with(4);
        let before = s.len();
        let err = s.replace_path_segment(
            &["missing".to_string()],
            Message::user("[summary]"),
        );
        assert!(matches!(err, Err(Error::NotFound(_))));
        assert_eq!(s.len(), before);
    }

    #[test]
    fn replace_segment_reparents_branch_children_of_removed_nodes() {
        let mut s = store_with(4);
        // Branch off the second message, creating a child outside the path.
        let mid = s.path()[1].id.clone();
        s.branch(&mid).unwrap();
        let side = s.append(Message::user("side"));
        // Back to the main tip, then remove the first three main messages.
        let main_tip = {
            let tree = s.tree();
            tree[&Some(mid.clone())]
                .iter()
                .find(|m| m.id != side.id)
                .unwrap()
                .id
                .clone()
        };
        s.branch(&main_tip).unwrap();
        let remove: Vec<String> = s.path()[0..3].iter().map(|m| m.id.clone()).collect();
        let summary = s
            .replace_path_segment(&remove, Message::user("[summary]"))
            .unwrap();
        // The side branch's parent was removed; it must now hang off the summary.
        assert_eq!(
            s.get(&side.id).unwrap().parent_id.as_deref(),
            Some(summary.id.as_str())
        );
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    #[test]
    fn save_load_round_trips_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = store_with(5);
        s.set_metadata_field("title", serde_json::json!("my session"));
        let path = s.save(dir.path()).unwrap();

        let restored = MessageStore::load(&path).unwrap();
        assert_eq!(restored.session_id(), "sess");
        assert_eq!(restored.title(), Some("my session"));
        let a = s.path();
        let b = restored.path();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.id, y.id);
            assert_eq!(x.parent_id, y.parent_id);
            assert_eq!(x.content, y.content);
            assert_eq!(x.role, y.role);
        }
    }

    #[test]
    fn save_load_preserves_branches() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = store_with(4);
        let mid = s.path()[1].id.clone();
        s.branch(&mid).unwrap();
        s.append(Message::user("branched"));
        let file = s.save(dir.path()).unwrap();

        let restored = MessageStore::load(&file).unwrap();
        assert_eq!(restored.len(), 5);
        assert_eq!(restored.path().last().unwrap().text(), "branched");
    }

    #[test]
    fn load_empty_file_is_corrupt_header() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("x.jsonl");
        std::fs::write(&file, "").unwrap();
        assert!(matches!(
            MessageStore::load(&file),
            Err(Error::CorruptHeader(_))
        ));
    }

    #[test]
    fn load_bad_message_line_is_corrupt_message_with_line_number() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("x.jsonl");
        std::fs::write(
            &file,
            "{\"session_id\":\"s\",\"current_id\":null,\"metadata\":{}}\nnot json\n",
        )
        .unwrap();
        match MessageStore::load(&file) {
            Err(Error::CorruptMessage { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn load_dangling_current_id_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("x.jsonl");
        std::fs::write(
            &file,
            "{\"session_id\":\"s\",\"current_id\":\"ghost\",\"metadata\":{}}\n",
        )
        .unwrap();
        assert!(matches!(
            MessageStore::load(&file),
            Err(Error::CorruptHeader(_))
        ));
    }

    #[test]
    fn tool_result_round_trips_call_id_and_error_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = MessageStore::new("sess");
        s.append(Message::user("go"));
        s.append(Message::tool_result("c9", "Aborted", true));
        let file = s.save(dir.path()).unwrap();
        let restored = MessageStore::load(&file).unwrap();
        let last = restored.path().pop().unwrap();
        assert_eq!(last.role, Role::ToolResult);
        assert_eq!(last.call_id.as_deref(), Some("c9"));
        assert!(last.is_error);
    }
}
