//! In-memory record resource served by the binary.
//!
//! Handlers follow the checkpoint layout batch resources are expected to
//! use: reads stage their id and get it resolved by one coalesced lookup;
//! writes validate, meet their siblings at a checkpoint, and only then touch
//! the store, so a failed validation in a mutating batch stops every write.
//!
//! Handlers work against a [`RecordSession`]: writes stay pending until the
//! group they belong to commits, and a group with any failed member is rolled
//! back as a whole.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tracing::debug;

use rsrest_domain::{DomainError, JobError, RequestHandle, SubResponse, Verb};
use rsrest_server::phase::{BatchLoader, BeforePhaseHook, CoalescingHook, PhaseSyncer, StagedKey};
use rsrest_server::config::BatchSettings;
use rsrest_server::routes::{HandlerCall, ResourceHandler, RouteError, RouteTable};
use rsrest_server::{BatchExecutor, UnitOfWork};

/// Error codes raised by the record resource.
pub mod error_codes {
    pub const RECORD_NOT_FOUND: &str = "record.not.found";
    pub const RECORD_INVALID: &str = "record.invalid";
}

/// Records keyed by id.
#[derive(Debug, Default)]
pub struct RecordStore {
    records: RwLock<BTreeMap<String, Value>>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Value> {
        self.records.read().get(id).cloned()
    }

    /// Fetches several ids under one lock.
    pub fn get_many<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> Vec<Option<Value>> {
        let records = self.records.read();
        ids.into_iter().map(|id| records.get(id).cloned()).collect()
    }

    pub fn put(&self, id: &str, value: Value) -> Option<Value> {
        self.records.write().insert(id.to_string(), value)
    }

    pub fn remove(&self, id: &str) -> Option<Value> {
        self.records.write().remove(id)
    }

    /// Applies pending changes under one lock; `None` removes the id.
    pub fn apply(&self, changes: BTreeMap<String, Option<Value>>) {
        let mut records = self.records.write();
        for (id, change) in changes {
            match change {
                Some(value) => {
                    records.insert(id, value);
                }
                None => {
                    records.remove(&id);
                }
            }
        }
    }

    pub fn list(&self) -> Vec<(String, Value)> {
        self.records
            .read()
            .iter()
            .map(|(id, value)| (id.clone(), value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One request's view of a [`RecordStore`].
///
/// Reads see the session's own pending writes first. Nothing reaches the
/// store before [`RecordSession::commit`].
#[derive(Debug)]
pub struct RecordSession {
    store: Arc<RecordStore>,
    pending: Mutex<BTreeMap<String, Option<Value>>>,
}

impl RecordSession {
    pub fn new(store: Arc<RecordStore>) -> Self {
        Self {
            store,
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    /// Pending change for `id`, if this session touched it.
    pub fn pending(&self, id: &str) -> Option<Option<Value>> {
        self.pending.lock().get(id).cloned()
    }

    pub fn get(&self, id: &str) -> Option<Value> {
        match self.pending(id) {
            Some(change) => change,
            None => self.store.get(id),
        }
    }

    /// Stages a write and returns the value it replaces.
    pub fn put(&self, id: &str, value: Value) -> Option<Value> {
        let mut pending = self.pending.lock();
        let previous = match pending.get(id) {
            Some(change) => change.clone(),
            None => self.store.get(id),
        };
        pending.insert(id.to_string(), Some(value));
        previous
    }

    /// Stages a removal and returns the removed value.
    pub fn remove(&self, id: &str) -> Option<Value> {
        let mut pending = self.pending.lock();
        let previous = match pending.get(id) {
            Some(change) => change.clone(),
            None => self.store.get(id),
        };
        if previous.is_some() {
            pending.insert(id.to_string(), None);
        }
        previous
    }

    pub fn list(&self) -> Vec<(String, Value)> {
        let mut records: BTreeMap<String, Value> = self.store.list().into_iter().collect();
        for (id, change) in self.pending.lock().iter() {
            match change {
                Some(value) => {
                    records.insert(id.clone(), value.clone());
                }
                None => {
                    records.remove(id);
                }
            }
        }
        records.into_iter().collect()
    }

    /// Writes every pending change to the store. Returns how many were applied.
    pub fn commit(&self) -> usize {
        let changes = std::mem::take(&mut *self.pending.lock());
        let applied = changes.len();
        self.store.apply(changes);
        applied
    }

    /// Drops every pending change. Returns how many were dropped.
    pub fn discard(&self) -> usize {
        let mut pending = self.pending.lock();
        let dropped = pending.len();
        pending.clear();
        dropped
    }
}

/// Commits a group's record writes when every member succeeded.
pub struct RecordTransactions;

#[async_trait]
impl UnitOfWork<RecordSession> for RecordTransactions {
    async fn begin(&self, shared: &RecordSession, _group: &RequestHandle) -> Result<(), DomainError> {
        shared.discard();
        Ok(())
    }

    async fn commit(&self, shared: &RecordSession, group: &RequestHandle) -> Result<(), DomainError> {
        let applied = shared.commit();
        debug!(group = %group.id(), applied, "record changes committed");
        Ok(())
    }

    async fn rollback(&self, shared: &RecordSession, group: &RequestHandle) {
        let dropped = shared.discard();
        debug!(group = %group.id(), dropped, "record changes rolled back");
    }
}

fn record_body(id: &str, value: Value) -> Value {
    json!({ "id": id, "value": value })
}

fn not_found(id: &str) -> JobError {
    DomainError::new(404, error_codes::RECORD_NOT_FOUND, format!("record '{id}' does not exist")).into()
}

/// `/records/:id` for GET, PUT and DELETE.
pub struct Record;

#[async_trait]
impl ResourceHandler<RecordSession> for Record {
    async fn handle(
        &self,
        mut syncer: PhaseSyncer,
        call: HandlerCall<RecordSession>,
    ) -> Result<SubResponse, JobError> {
        let id = call.param("id").unwrap_or_default().to_string();

        match call.request.verb() {
            Verb::Get | Verb::Head => {
                syncer.stage(json!(id));
                syncer.phase().await?;
                let resolved = syncer.take_resolved();
                let found = match (call.shared.pending(&id), resolved) {
                    (Some(change), _) => change,
                    (None, Some(Value::Null)) => None,
                    (None, Some(resolved)) => Some(resolved),
                    // No loader registered.
                    (None, None) => call.shared.get(&id),
                };
                let value = found.ok_or_else(|| not_found(&id))?;
                Ok(SubResponse::ok(record_body(&id, value)))
            }
            Verb::Put | Verb::Post | Verb::Patch => {
                if call.body.is_null() {
                    return Err(DomainError::bad_request(
                        error_codes::RECORD_INVALID,
                        format!("record '{id}' needs a body"),
                    )
                    .into());
                }
                syncer.phase().await?;
                let previous = call.shared.put(&id, call.body.clone());
                debug!(id = %id, replaced = previous.is_some(), "record written");
                let status = if previous.is_some() { 200 } else { 201 };
                Ok(SubResponse::new(status, record_body(&id, call.body)))
            }
            Verb::Delete => {
                if call.shared.get(&id).is_none() {
                    return Err(not_found(&id));
                }
                syncer.phase().await?;
                let removed = call.shared.remove(&id).ok_or_else(|| not_found(&id))?;
                Ok(SubResponse::ok(record_body(&id, removed)))
            }
        }
    }
}

/// `GET /records`
pub struct RecordList;

#[async_trait]
impl ResourceHandler<RecordSession> for RecordList {
    async fn handle(
        &self,
        mut syncer: PhaseSyncer,
        call: HandlerCall<RecordSession>,
    ) -> Result<SubResponse, JobError> {
        syncer.phase().await?;
        let records: Vec<Value> = call
            .shared
            .list()
            .into_iter()
            .map(|(id, value)| record_body(&id, value))
            .collect();
        Ok(SubResponse::ok(Value::Array(records)))
    }
}

/// Resolves the ids staged by record reads with one store lookup per phase.
pub struct RecordLoader {
    store: Arc<RecordStore>,
}

impl RecordLoader {
    pub fn new(store: Arc<RecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BatchLoader for RecordLoader {
    async fn load_many(
        &self,
        _root: &RequestHandle,
        keys: &[StagedKey],
    ) -> Result<Vec<Value>, JobError> {
        let ids = keys.iter().map(|key| key.value.as_str().unwrap_or_default());
        Ok(self
            .store
            .get_many(ids)
            .into_iter()
            .map(|found| found.unwrap_or(Value::Null))
            .collect())
    }
}

/// Hook coalescing record reads against `store`.
pub fn record_hook(store: Arc<RecordStore>) -> Arc<dyn BeforePhaseHook> {
    Arc::new(CoalescingHook::new(RecordLoader::new(store)))
}

/// Executor over `routes` with coalesced record reads and transactional groups.
pub fn record_executor(
    routes: RouteTable<RecordSession>,
    settings: BatchSettings,
    store: &Arc<RecordStore>,
) -> BatchExecutor<RecordSession> {
    BatchExecutor::new(Arc::new(routes), settings)
        .with_hook(record_hook(Arc::clone(store)))
        .with_unit_of_work(Arc::new(RecordTransactions))
}

/// Hands every request a fresh session over `store`.
pub fn record_sessions(store: Arc<RecordStore>) -> impl Fn() -> Arc<RecordSession> + Send + Sync + 'static {
    move || Arc::new(RecordSession::new(Arc::clone(&store)))
}

/// Registers the record routes under `prefix` (e.g. `""` or `"/api"`).
pub fn record_routes(table: &mut RouteTable<RecordSession>, prefix: &str) -> Result<(), RouteError> {
    let prefix = prefix.trim_end_matches('/');
    let record: Arc<dyn ResourceHandler<RecordSession>> = Arc::new(Record);
    for verb in [Verb::Get, Verb::Head, Verb::Put, Verb::Delete] {
        table.add(verb, &format!("{prefix}/records/:id"), Arc::clone(&record))?;
    }
    table.add(Verb::Get, &format!("{prefix}/records"), Arc::new(RecordList))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsrest_domain::RequestArena;

    fn executor(store: &Arc<RecordStore>) -> BatchExecutor<RecordSession> {
        let mut table = RouteTable::new();
        record_routes(&mut table, "").unwrap();
        let settings = BatchSettings {
            concurrency: 4,
            max_batch_size: 20,
            path: "/batch".to_string(),
        };
        record_executor(table, settings, store)
    }

    fn session(store: &Arc<RecordStore>) -> Arc<RecordSession> {
        Arc::new(RecordSession::new(Arc::clone(store)))
    }

    fn batch_root() -> RequestHandle {
        RequestArena::new().root(Verb::Post, "/batch", false)
    }

    #[tokio::test]
    async fn test_reads_resolve_through_the_loader() {
        let store = Arc::new(RecordStore::new());
        store.put("a", json!(1));
        store.put("b", json!(2));

        let body = json!([{"href": "records/a"}, {"href": "records/b"}, {"href": "records/zz"}]);
        let outcome = executor(&store)
            .execute(&batch_root(), &body, session(&store))
            .await
            .unwrap();

        let statuses: Vec<u16> = outcome.results.iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![200, 200, 404]);
        assert_eq!(outcome.results[1].body["value"], json!(2));
        assert_eq!(outcome.status, 404);
    }

    #[tokio::test]
    async fn test_invalid_write_stops_sibling_writes() {
        let store = Arc::new(RecordStore::new());

        let body = json!([
            {"href": "records/a", "verb": "PUT", "body": {"n": 1}},
            {"href": "records/b", "verb": "PUT"},
            {"href": "records/c", "verb": "PUT", "body": {"n": 3}},
        ]);
        let outcome = executor(&store)
            .execute(&batch_root(), &body, session(&store))
            .await
            .unwrap();

        let statuses: Vec<u16> = outcome.results.iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![202, 400, 202]);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_writes_and_deletes_apply() {
        let store = Arc::new(RecordStore::new());
        store.put("old", json!("x"));

        let body = json!([
            {"href": "records/new", "verb": "PUT", "body": "y"},
            {"href": "records/old", "verb": "DELETE"},
        ]);
        let outcome = executor(&store)
            .execute(&batch_root(), &body, session(&store))
            .await
            .unwrap();

        let statuses: Vec<u16> = outcome.results.iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![201, 200]);
        assert_eq!(store.get("new"), Some(json!("y")));
        assert_eq!(store.get("old"), None);
    }

    #[tokio::test]
    async fn test_list_returns_every_record() {
        let store = Arc::new(RecordStore::new());
        store.put("a", json!(1));
        store.put("b", json!(2));

        let request = RequestArena::new().root(Verb::Get, "/records", true);
        let response = executor(&store)
            .dispatch(&request, Value::Null, session(&store))
            .await;

        assert_eq!(response.status, 200);
        assert_eq!(response.body.as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn test_failed_batch_rolls_back_finished_writes() {
        let store = Arc::new(RecordStore::new());
        store.put("x", json!("keep"));

        let body = json!([
            {"href": "records/a", "verb": "PUT", "body": 1},
            {"href": "records/x", "verb": "DELETE"},
            {"href": "records/x", "verb": "DELETE"},
        ]);
        let outcome = executor(&store)
            .execute(&batch_root(), &body, session(&store))
            .await
            .unwrap();

        let statuses: Vec<u16> = outcome.results.iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![201, 200, 404]);
        assert_eq!(store.get("a"), None);
        assert_eq!(store.get("x"), Some(json!("keep")));
    }

    #[tokio::test]
    async fn test_later_groups_see_only_committed_writes() {
        let store = Arc::new(RecordStore::new());

        let body = json!([
            [{"href": "records/a", "verb": "PUT", "body": 1}],
            [{"href": "records/b", "verb": "PUT", "body": 2}, {"href": "records/zz", "verb": "DELETE"}],
            [{"href": "records/a"}, {"href": "records/b"}],
        ]);
        let outcome = executor(&store)
            .execute(&batch_root(), &body, session(&store))
            .await
            .unwrap();

        let statuses: Vec<u16> = outcome.results.iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![201, 202, 404, 200, 404]);
        assert_eq!(store.list(), vec![("a".to_string(), json!(1))]);
    }

    #[test]
    fn test_session_keeps_changes_until_commit() {
        let store = Arc::new(RecordStore::new());
        store.put("x", json!(1));
        let session = RecordSession::new(Arc::clone(&store));

        assert_eq!(session.put("y", json!(2)), None);
        assert_eq!(session.remove("x"), Some(json!(1)));
        assert_eq!(session.remove("x"), None);
        assert_eq!(session.get("y"), Some(json!(2)));
        assert_eq!(session.list(), vec![("y".to_string(), json!(2))]);
        assert_eq!(store.get("x"), Some(json!(1)));
        assert_eq!(store.get("y"), None);

        assert_eq!(session.commit(), 2);
        assert_eq!(store.list(), vec![("y".to_string(), json!(2))]);

        session.put("z", json!(3));
        assert_eq!(session.discard(), 1);
        assert_eq!(store.get("z"), None);
    }
}
