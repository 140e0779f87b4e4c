// Whiteboard state store.
//
// Per-session ordered collection of drawable objects, rebuilt from peer
// broadcasts and served to late joiners. Deliberately volatile: not
// persisted across restarts; if no peer holds state after a restart, the
// board starts empty.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use codehive_common::types::BoardObject;
use rand::Rng;
use tokio::sync::RwLock;
use uuid::Uuid;

const OBJECT_ID_SUFFIX_LEN: usize = 6;
const BASE36_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Clone, Default)]
pub struct WhiteboardStore {
    boards: Arc<RwLock<HashMap<Uuid, Vec<BoardObject>>>>,
}

impl WhiteboardStore {
    /// Insert or replace a single object by id (linear scan; boards are
    /// small). Objects without an id are assigned one first.
    pub async fn upsert(&self, session_id: Uuid, mut object: BoardObject) -> BoardObject {
        ensure_object_id(&mut object);
        let mut guard = self.boards.write().await;
        let board = guard.entry(session_id).or_default();
        upsert_into(board, object.clone());
        object
    }

    /// Upsert a batch, returning the objects with their assigned ids.
    pub async fn upsert_all(
        &self,
        session_id: Uuid,
        objects: Vec<BoardObject>,
    ) -> Vec<BoardObject> {
        let mut guard = self.boards.write().await;
        let board = guard.entry(session_id).or_default();
        objects
            .into_iter()
            .map(|mut object| {
                ensure_object_id(&mut object);
                upsert_into(board, object.clone());
                object
            })
            .collect()
    }

    /// Empty the board for a session.
    pub async fn clear(&self, session_id: Uuid) {
        self.boards.write().await.remove(&session_id);
    }

    /// Current board content (empty if the session is unknown).
    pub async fn get(&self, session_id: Uuid) -> Vec<BoardObject> {
        self.boards.read().await.get(&session_id).cloned().unwrap_or_default()
    }

    pub async fn is_empty(&self, session_id: Uuid) -> bool {
        self.boards.read().await.get(&session_id).map(Vec::is_empty).unwrap_or(true)
    }
}

fn upsert_into(board: &mut Vec<BoardObject>, object: BoardObject) {
    match board.iter_mut().find(|existing| existing.id == object.id) {
        Some(existing) => *existing = object,
        None => board.push(object),
    }
}

/// Assign an id to an object that lacks one: `<epoch-millis>-<base36>`,
/// matching the ids clients mint for objects they introduce themselves.
fn ensure_object_id(object: &mut BoardObject) {
    if object.id.as_deref().map(str::is_empty).unwrap_or(true) {
        object.id = Some(generate_object_id());
    }
}

fn generate_object_id() -> String {
    let millis = Utc::now().timestamp_millis();
    let mut rng = rand::thread_rng();
    let suffix: String = (0..OBJECT_ID_SUFFIX_LEN)
        .map(|_| BASE36_ALPHABET[rng.gen_range(0..BASE36_ALPHABET.len())] as char)
        .collect();
    format!("{millis}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session() -> Uuid {
        Uuid::parse_str("00000000-0000-0000-0000-000000000001").unwrap()
    }

    fn object(id: Option<&str>, kind: &str) -> BoardObject {
        let mut attrs = serde_json::Map::new();
        attrs.insert("x".to_string(), json!(1));
        BoardObject { id: id.map(ToOwned::to_owned), kind: kind.to_string(), attrs }
    }

    // ── Upsert ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn upsert_appends_new_objects_in_order() {
        let store = WhiteboardStore::default();
        store.upsert(session(), object(Some("1"), "rect")).await;
        store.upsert(session(), object(Some("2"), "line")).await;

        let board = store.get(session()).await;
        assert_eq!(board.len(), 2);
        assert_eq!(board[0].id.as_deref(), Some("1"));
        assert_eq!(board[1].id.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn upsert_replaces_in_place_by_id() {
        let store = WhiteboardStore::default();
        store.upsert(session(), object(Some("1"), "rect")).await;
        store.upsert(session(), object(Some("2"), "line")).await;

        let mut moved = object(Some("1"), "rect");
        moved.attrs.insert("x".to_string(), json!(42));
        store.upsert(session(), moved).await;

        let board = store.get(session()).await;
        assert_eq!(board.len(), 2);
        assert_eq!(board[0].attrs["x"], 42);
        // Replacement keeps the original position.
        assert_eq!(board[0].id.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = WhiteboardStore::default();
        let drawn = object(Some("1"), "rect");
        store.upsert(session(), drawn.clone()).await;
        store.upsert(session(), drawn.clone()).await;

        let board = store.get(session()).await;
        assert_eq!(board.len(), 1);
        assert_eq!(board[0], drawn);
    }

    #[tokio::test]
    async fn upsert_assigns_ids_to_new_objects() {
        let store = WhiteboardStore::default();
        let stored = store.upsert(session(), object(None, "path")).await;

        let id = stored.id.expect("object should be assigned an id");
        let (millis, suffix) = id.split_once('-').expect("id should be <millis>-<suffix>");
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(suffix.len(), OBJECT_ID_SUFFIX_LEN);
        assert_eq!(store.get(session()).await.len(), 1);
    }

    #[tokio::test]
    async fn upsert_all_keeps_batch_order_and_assigned_ids() {
        let store = WhiteboardStore::default();
        let stored = store
            .upsert_all(session(), vec![object(Some("1"), "rect"), object(None, "line")])
            .await;

        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].id.as_deref(), Some("1"));
        assert!(stored[1].id.is_some());
        assert_eq!(store.get(session()).await, stored);
    }

    // ── Clear / get ────────────────────────────────────────────────

    #[tokio::test]
    async fn clear_empties_the_board() {
        let store = WhiteboardStore::default();
        store.upsert(session(), object(Some("1"), "rect")).await;
        store.clear(session()).await;

        assert!(store.get(session()).await.is_empty());
        assert!(store.is_empty(session()).await);
    }

    #[tokio::test]
    async fn unknown_session_reads_as_empty() {
        let store = WhiteboardStore::default();
        assert!(store.get(session()).await.is_empty());
        assert!(store.is_empty(session()).await);
    }

    #[tokio::test]
    async fn boards_are_isolated_per_session() {
        let store = WhiteboardStore::default();
        let other = Uuid::new_v4();
        store.upsert(session(), object(Some("1"), "rect")).await;
        store.upsert(other, object(Some("2"), "line")).await;

        store.clear(session()).await;

        assert!(store.get(session()).await.is_empty());
        assert_eq!(store.get(other).await.len(), 1);
    }

    // ── Id assignment ──────────────────────────────────────────────

    #[test]
    fn ensure_object_id_respects_existing_ids() {
        let mut existing = object(Some("keep-me"), "rect");
        ensure_object_id(&mut existing);
        assert_eq!(existing.id.as_deref(), Some("keep-me"));
    }

    #[test]
    fn ensure_object_id_treats_empty_string_as_missing() {
        let mut blank = object(Some(""), "rect");
        ensure_object_id(&mut blank);
        assert!(!blank.id.as_deref().unwrap().is_empty());
    }
}
