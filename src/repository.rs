//! The stub table and the request-resolution entry point.
//!
//! The published table is an immutable `Arc<Vec<_>>`. Readers clone the
//! `Arc` and work on that snapshot; writers are serialised, build a modified
//! copy, and swap it in. A reader therefore sees either the old table or the
//! new one in full.
//!
//! Resource ids are written onto entries only before they are first
//! published, so an entry shared with an older snapshot is never re-tagged.

use crate::config::StubParser;
use crate::error::StubError;
use crate::matcher::{find_match, IncomingRequest, MatchContext, MatchOutcome};
use crate::recording::{Recorder, Transport};
use crate::stub::{StubEntry, StubResponse};
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Published table snapshot.
pub type StubTable = Arc<Vec<Arc<StubEntry>>>;

/// A request resolved to a concrete response.
#[derive(Debug, Clone)]
pub struct ResolvedStub {
    /// Position of the matched entry in the table it was matched against
    pub index: usize,
    pub entry: Arc<StubEntry>,
    pub response: Arc<StubResponse>,
    pub context: MatchContext,
}

/// Outcome of [`StubRepository::resolve`].
#[derive(Debug, Clone)]
pub enum Resolution {
    Found(ResolvedStub),
    /// An entry matched everything except its authorization requirement.
    Unauthorized,
    NotFound,
}

/// Owns the stub table.
pub struct StubRepository {
    stubs: RwLock<StubTable>,
    /// Serialises writers so no update is lost between copy and swap.
    /// Holds the resource id the next appended entry receives.
    writer: Mutex<usize>,
    recorder: Recorder,
}

impl StubRepository {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            stubs: RwLock::new(Arc::new(Vec::new())),
            writer: Mutex::new(0),
            recorder: Recorder::new(transport),
        }
    }

    /// Current table snapshot.
    pub fn stubs(&self) -> StubTable {
        Arc::clone(&self.stubs.read())
    }

    pub fn len(&self) -> usize {
        self.stubs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stubs.read().is_empty()
    }

    /// Replace the whole table. Returns whether the new table differs from the old one.
    pub fn reset_stubs_cache(&self, entries: Vec<StubEntry>) -> bool {
        let mut next_id = self.writer.lock();
        let table: Vec<Arc<StubEntry>> = entries.into_iter().map(Arc::new).collect();
        assign_sequential_resource_ids(&table);
        *next_id = table.len();

        let previous = self.stubs();
        let changed = previous.len() != table.len()
            || previous.iter().zip(&table).any(|(old, new)| old != new);

        self.publish(table);
        info!(stubs = self.len(), changed, "Stub table reset");
        changed
    }

    /// Parse `raw` with `parser` and reset the table with the result.
    pub fn reload(
        &self,
        parser: &dyn StubParser,
        raw: &str,
        origin: &Path,
    ) -> Result<bool, StubError> {
        let entries = parser.parse(raw, origin)?;
        Ok(self.reset_stubs_cache(entries))
    }

    /// Entry at `index`, or `None` when out of bounds.
    pub fn match_by_index(&self, index: usize) -> Option<Arc<StubEntry>> {
        self.stubs.read().get(index).cloned()
    }

    /// Remove and return the entry at `index`.
    pub fn delete_by_index(&self, index: usize) -> Result<Arc<StubEntry>, StubError> {
        let _writer = self.writer.lock();
        let mut table = self.checked_copy(index)?;
        let removed = table.remove(index);
        self.publish(table);
        info!(index, "Stub deleted");
        Ok(removed)
    }

    /// Replace the entry at `index`, keeping its position. Returns the replaced entry.
    pub fn update_by_index(
        &self,
        index: usize,
        entry: StubEntry,
    ) -> Result<Arc<StubEntry>, StubError> {
        let _writer = self.writer.lock();
        let mut table = self.checked_copy(index)?;
        let id = table[index]
            .resource_id()
            .and_then(|id| id.parse().ok())
            .unwrap_or(index);
        entry.set_resource_id(id);
        let replaced = std::mem::replace(&mut table[index], Arc::new(entry));
        self.publish(table);
        info!(index, "Stub updated");
        Ok(replaced)
    }

    /// Add an entry at the end of the table. Returns its index.
    pub fn append(&self, entry: StubEntry) -> usize {
        let mut next_id = self.writer.lock();
        entry.set_resource_id(*next_id);
        *next_id += 1;
        let mut table = self.stubs().as_ref().clone();
        table.push(Arc::new(entry));
        let index = table.len() - 1;
        self.publish(table);
        info!(index, "Stub added");
        index
    }

    /// Resolve an incoming request to a response.
    ///
    /// Matching runs against one snapshot; the chosen entry's cursor advances
    /// and a recordable response is recorded before it is returned.
    pub async fn resolve(&self, incoming: &IncomingRequest) -> Resolution {
        let table = self.stubs();

        match find_match(incoming, &table) {
            MatchOutcome::Matched {
                index,
                entry,
                context,
            } => {
                let response = entry.next_response(true);
                let response = self.recorder.resolve(&entry, response, incoming).await;
                Resolution::Found(ResolvedStub {
                    index,
                    entry,
                    response,
                    context,
                })
            }
            MatchOutcome::Unauthorized { index } => {
                debug!(index, "Authorization mismatch on otherwise matching stub");
                Resolution::Unauthorized
            }
            MatchOutcome::NotFound => Resolution::NotFound,
        }
    }

    fn checked_copy(&self, index: usize) -> Result<Vec<Arc<StubEntry>>, StubError> {
        let current = self.stubs();
        if index >= current.len() {
            return Err(StubError::OutOfRange {
                index,
                len: current.len(),
            });
        }
        Ok(current.as_ref().clone())
    }

    /// Make `table` the current table. Callers hold the writer lock.
    fn publish(&self, table: Vec<Arc<StubEntry>>) {
        *self.stubs.write() = Arc::new(table);
    }
}

/// Tag every entry with its stored position. Only for entries not yet published.
pub fn assign_sequential_resource_ids(table: &[Arc<StubEntry>]) {
    for (index, entry) in table.iter().enumerate() {
        entry.set_resource_id(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::test_support::{Outcome, ScriptedTransport};
    use crate::stub::{Authorization, StubRequest};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn entry(url: &str, body: &str) -> StubEntry {
        StubEntry::with_response(
            StubRequest::builder(url)
                .method("GET")
                .header("content-type", "application/json")
                .build()
                .unwrap(),
            StubResponse::with_body(200, body),
        )
    }

    fn repository() -> (StubRepository, Arc<ScriptedTransport>) {
        let transport = ScriptedTransport::replying(200, "OK, this is recorded response text!");
        (StubRepository::new(transport.clone()), transport)
    }

    fn json_get(path: &str) -> IncomingRequest {
        IncomingRequest::from_target("GET", path).with_header("Content-Type", "application/json")
    }

    fn found_body(resolution: Resolution) -> String {
        match resolution {
            Resolution::Found(resolved) => resolved.response.body(),
            other => panic!("Expected a resolved stub, got {other:?}"),
        }
    }

    #[test]
    fn test_reset_replaces_table() {
        let (repo, _) = repository();
        assert!(repo.reset_stubs_cache(vec![entry("/resource/item/1", "one")]));
        assert_eq!(repo.len(), 1);

        assert!(!repo.reset_stubs_cache(vec![entry("/resource/item/1", "other body")]));
        assert!(repo.reset_stubs_cache(vec![entry("/resource/item/2", "two")]));
        assert_eq!(repo.stubs()[0].request().url().as_str(), "/resource/item/2");

        assert!(repo.reset_stubs_cache(vec![]));
        assert!(repo.is_empty());
    }

    #[test]
    fn test_reset_assigns_resource_ids() {
        let (repo, _) = repository();
        repo.reset_stubs_cache(vec![entry("/a", "a"), entry("/b", "b"), entry("/c", "c")]);

        let ids: Vec<_> = repo
            .stubs()
            .iter()
            .map(|e| e.resource_id().unwrap())
            .collect();
        assert_eq!(ids, ["0", "1", "2"]);
    }

    #[test]
    fn test_match_by_index() {
        let (repo, _) = repository();
        repo.reset_stubs_cache(vec![entry("/resource/item/1", "one")]);

        assert!(repo.match_by_index(0).is_some());
        assert!(repo.match_by_index(9999).is_none());
    }

    #[test]
    fn test_delete_by_index() {
        let (repo, _) = repository();
        repo.reset_stubs_cache(vec![entry("/a", "a"), entry("/b", "b")]);

        let deleted = repo.delete_by_index(0).unwrap();
        assert_eq!(deleted.request().url().as_str(), "/a");
        assert_eq!(repo.len(), 1);
        assert_eq!(repo.stubs()[0].resource_id().as_deref(), Some("1"));

        repo.delete_by_index(0).unwrap();
        assert!(repo.is_empty());
    }

    #[test]
    fn test_held_snapshot_keeps_resource_ids_across_writes() {
        let (repo, _) = repository();
        repo.reset_stubs_cache(vec![entry("/a", "a"), entry("/b", "b"), entry("/c", "c")]);

        let held = repo.stubs();
        let ids = |table: &StubTable| -> Vec<String> {
            table.iter().map(|e| e.resource_id().unwrap()).collect()
        };
        assert_eq!(ids(&held), ["0", "1", "2"]);

        repo.delete_by_index(0).unwrap();
        repo.update_by_index(0, entry("/b2", "b2")).unwrap();
        repo.append(entry("/d", "d"));

        assert_eq!(ids(&held), ["0", "1", "2"]);
        assert_eq!(ids(&repo.stubs()), ["1", "2", "3"]);
    }

    #[test]
    fn test_write_operations_reject_invalid_index() {
        let (repo, _) = repository();
        repo.reset_stubs_cache(vec![entry("/resource/item/1", "one")]);

        assert!(repo.match_by_index(9999).is_none());
        assert!(matches!(
            repo.delete_by_index(9999),
            Err(StubError::OutOfRange { index: 9999, len: 1 })
        ));
        assert!(matches!(
            repo.update_by_index(9999, entry("/new", "new")),
            Err(StubError::OutOfRange { index: 9999, len: 1 })
        ));
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn test_update_by_index_keeps_position() {
        let (repo, _) = repository();
        repo.reset_stubs_cache(vec![entry("/resource/item/1", "one"), entry("/tail", "tail")]);

        let replaced = repo
            .update_by_index(0, entry("/resource/completely/new", "new"))
            .unwrap();
        assert_eq!(replaced.request().url().as_str(), "/resource/item/1");

        let stubs = repo.stubs();
        assert_eq!(stubs[0].request().url().as_str(), "/resource/completely/new");
        assert_eq!(stubs[0].resource_id().as_deref(), Some("0"));
        assert_eq!(stubs[1].request().url().as_str(), "/tail");
    }

    #[test]
    fn test_append() {
        let (repo, _) = repository();
        repo.reset_stubs_cache(vec![entry("/a", "a")]);
        let index = repo.append(entry("/b", "b"));
        assert_eq!(index, 1);
        assert_eq!(repo.match_by_index(1).unwrap().resource_id().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_resolve_prefers_first_matching_entry() {
        let (repo, _) = repository();
        repo.reset_stubs_cache(vec![entry("/api/.*", "A"), entry("/api/users", "B")]);

        for _ in 0..3 {
            assert_eq!(found_body(repo.resolve(&json_get("/api/users")).await), "A");
        }
    }

    #[tokio::test]
    async fn test_resolve_cycles_sequenced_responses() {
        let (repo, _) = repository();
        let responses = ["R0", "R1", "R2"]
            .iter()
            .map(|b| StubResponse::with_body(200, *b))
            .collect();
        let request = StubRequest::builder("/seq").build().unwrap();
        repo.reset_stubs_cache(vec![StubEntry::new(request, responses).unwrap()]);

        let mut served = Vec::new();
        for _ in 0..5 {
            served.push(found_body(repo.resolve(&IncomingRequest::new("GET", "/seq")).await));
        }
        assert_eq!(served, ["R0", "R1", "R2", "R0", "R1"]);
    }

    #[tokio::test]
    async fn test_resolve_reports_not_found_and_unauthorized() {
        let (repo, _) = repository();
        let secured = StubEntry::with_response(
            StubRequest::builder("/secure")
                .authorization(Authorization::basic("bob:secret"))
                .build()
                .unwrap(),
            StubResponse::with_body(200, "secret"),
        );
        repo.reset_stubs_cache(vec![secured]);

        assert!(matches!(
            repo.resolve(&IncomingRequest::new("GET", "/missing")).await,
            Resolution::NotFound
        ));
        assert!(matches!(
            repo.resolve(&IncomingRequest::new("GET", "/secure")).await,
            Resolution::Unauthorized
        ));

        let authorized = IncomingRequest::new("GET", "/secure")
            .with_header("Authorization", "Basic Ym9iOnNlY3JldA==");
        assert_eq!(found_body(repo.resolve(&authorized).await), "secret");
    }

    #[tokio::test]
    async fn test_recordable_response_is_fetched_once() {
        let (repo, transport) = repository();
        repo.reset_stubs_cache(vec![entry("/search", "http://example.test")]);

        let stubbed = repo.stubs()[0].current_response();
        assert!(stubbed.is_recordable());

        for _ in 0..5 {
            let resolution = repo.resolve(&json_get("/search")).await;
            let Resolution::Found(resolved) = resolution else {
                panic!("Expected a resolved stub");
            };
            assert_eq!(resolved.response.body(), "OK, this is recorded response text!");
            assert!(!resolved.response.is_recordable());
            assert_eq!(stubbed.body(), resolved.response.body());
        }

        assert_eq!(transport.calls(), 1);
        assert_eq!(transport.targets(), ["http://example.test/search"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resolution_of_recordable_entry() {
        const PLACEHOLDER: &str = "http://upstream.test";
        let placeholder = || (200, PLACEHOLDER.to_string());
        let recorded = || (201, "recorded".to_string());
        let plain = || (200, "plain".to_string());

        let transport = ScriptedTransport::scripted(
            vec![Outcome::Slow(Duration::from_millis(20), 201, "recorded")],
            201,
            "recorded",
        );
        let repo = Arc::new(StubRepository::new(transport.clone()));
        let sequenced = StubEntry::new(
            StubRequest::builder("/search").build().unwrap(),
            vec![
                StubResponse::with_body(200, PLACEHOLDER),
                StubResponse::with_body(200, "plain"),
            ],
        )
        .unwrap();
        repo.reset_stubs_cache(vec![sequenced]);
        let recordable = Arc::clone(&repo.stubs()[0].responses()[0]);

        let done = Arc::new(AtomicBool::new(false));
        let watcher = {
            let recordable = Arc::clone(&recordable);
            let done = Arc::clone(&done);
            tokio::task::spawn_blocking(move || {
                while !done.load(Ordering::Acquire) {
                    let content = recordable.content();
                    assert!(
                        content == placeholder() || content == recorded(),
                        "status and body out of step: {content:?}"
                    );
                }
            })
        };

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let repo = Arc::clone(&repo);
            tasks.push(tokio::spawn(async move {
                let mut served = Vec::new();
                for _ in 0..10 {
                    match repo.resolve(&IncomingRequest::new("GET", "/search")).await {
                        Resolution::Found(resolved) => served.push(resolved.response.content()),
                        other => panic!("Expected a resolved stub, got {other:?}"),
                    }
                }
                served
            }));
        }

        for task in tasks {
            for content in task.await.unwrap() {
                assert!(
                    content == recorded() || content == plain() || content == placeholder(),
                    "unexpected response {content:?}"
                );
            }
        }
        done.store(true, Ordering::Release);
        watcher.await.unwrap();

        // 160 advances over two responses land back on the first
        assert_eq!(repo.match_by_index(0).unwrap().cursor(), 0);
        assert_eq!(recordable.content(), recorded());
        assert!(!recordable.is_recordable());
        assert!(transport.calls() >= 1);
    }

    #[tokio::test]
    async fn test_recording_failure_falls_back_to_placeholder() {
        let transport =
            ScriptedTransport::scripted(vec![Outcome::Fail], 200, "recorded after retry");
        let repo = StubRepository::new(transport.clone());
        repo.reset_stubs_cache(vec![entry("/resource/item/1", "http://google.com")]);

        let resolution = repo.resolve(&json_get("/resource/item/1")).await;
        let Resolution::Found(resolved) = resolution else {
            panic!("Expected a resolved stub");
        };
        assert_eq!(resolved.response.body(), "http://google.com");
        assert!(resolved.response.is_recordable());

        assert_eq!(
            found_body(repo.resolve(&json_get("/resource/item/1")).await),
            "recorded after retry"
        );
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_reload_through_parser() {
        struct FixedParser;

        impl StubParser for FixedParser {
            fn parse(&self, raw: &str, _origin: &Path) -> Result<Vec<StubEntry>, StubError> {
                Ok(raw.lines().map(|url| entry(url, url)).collect())
            }
        }

        let (repo, _) = repository();
        let changed = repo
            .reload(&FixedParser, "/one\n/two", Path::new("stubs.yaml"))
            .unwrap();
        assert!(changed);
        assert_eq!(repo.len(), 2);
        assert_eq!(found_body(repo.resolve(&json_get("/two")).await), "/two");
    }

    #[test]
    fn test_readers_never_observe_partial_table() {
        let (repo, _) = repository();
        let old: Vec<_> = (0..50).map(|i| format!("/old/{i}")).collect();
        let new: Vec<_> = (0..80).map(|i| format!("/new/{i}")).collect();
        fn build(urls: &[String]) -> Vec<StubEntry> {
            urls.iter().map(|u| entry(u, "body")).collect()
        }
        repo.reset_stubs_cache(build(&old));

        let done = AtomicBool::new(false);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    while !done.load(Ordering::Acquire) {
                        let table = repo.stubs();
                        let urls: Vec<_> = table
                            .iter()
                            .map(|e| e.request().url().as_str().to_string())
                            .collect();
                        assert!(urls == old || urls == new, "observed a mixed table");
                    }
                });
            }

            for round in 0..100 {
                let urls = if round % 2 == 0 { &new } else { &old };
                repo.reset_stubs_cache(build(urls));
            }
            done.store(true, Ordering::Release);
        });
    }
}
