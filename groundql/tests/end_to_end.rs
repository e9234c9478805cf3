//! End-to-end behaviour of indexing and resolution through `Database`.

use groundql::{
    compile, parse_schema_str, CancelFlag, ContentSource, Database, DatabaseConfig, DocumentParser, DocumentRecord,
    Filter, FrontMatterParser, FsSource, IndexError, IndexOptions, MemoryBackend, MemorySource, QueryRequest,
    ResolveError, Selection, Sort, SourceError, SqliteBackend, StorageBackend, StorageError,
};
use groundql::storage::keys;
use groundql::storage::{Direction, KeyRange, ScanIter};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

const BLOG: &str = r#"
collections:
  - name: posts
    path: posts
    default_sort: rank
    fields:
      - { name: title, type: string, required: true }
      - { name: rank, type: number }
      - { name: author, type: reference, collections: [authors] }
  - name: authors
    path: authors
    fields:
      - { name: name, type: string }
"#;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn database(schema: &str, storage: Arc<dyn StorageBackend>) -> Database {
    database_with(
        schema,
        storage,
        DatabaseConfig {
            parallel: false,
            ..DatabaseConfig::default()
        },
    )
}

fn database_with(schema: &str, storage: Arc<dyn StorageBackend>, config: DatabaseConfig) -> Database {
    let graph = compile(&parse_schema_str(schema).unwrap()).unwrap();
    Database::new(graph, storage).with_config(config)
}

fn blog_source() -> MemorySource {
    MemorySource::from_files([
        ("posts/a.md", "---\ntitle: Hello\nrank: 1\nauthor: authors/jane.md\n---\nFirst post\n"),
        ("posts/b.md", "---\ntitle: Second\nrank: 2\n---\n"),
        ("authors/jane.md", "---\nname: Jane\n---\n"),
    ])
}

fn titles(db: &Database) -> Vec<String> {
    let result = db
        .resolve(&QueryRequest::list("posts", Selection::fields(["title"])))
        .unwrap();
    result
        .items()
        .iter()
        .map(|item| item["title"].as_str().unwrap().to_string())
        .collect()
}

/// Entries of one generation with the prefix stripped, minus its info record.
fn generation_entries(storage: &MemoryBackend, generation: u64) -> Vec<(Vec<u8>, Vec<u8>)> {
    let prefix = keys::ns_prefix(generation);
    storage
        .snapshot()
        .into_iter()
        .filter_map(|(k, v)| k.strip_prefix(prefix.as_slice()).map(|rest| (rest.to_vec(), v)))
        .filter(|(k, _)| k.as_slice() != b"info")
        .collect()
}

/// Holds `get(gate)` until the test releases it.
struct GatedSource {
    inner: MemorySource,
    gate: String,
    reached: Mutex<Sender<()>>,
    release: Mutex<Receiver<()>>,
}

impl ContentSource for GatedSource {
    fn get(&self, path: &str) -> Result<Vec<u8>, SourceError> {
        if path == self.gate {
            let _ = self.reached.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv();
        }
        self.inner.get(path)
    }

    fn put(&self, path: &str, bytes: &[u8]) -> Result<(), SourceError> {
        self.inner.put(path, bytes)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, SourceError> {
        self.inner.list(prefix)
    }

    fn delete(&self, path: &str) -> Result<(), SourceError> {
        self.inner.delete(path)
    }
}

/// Cancels the run when `trigger` is read.
struct CancellingSource {
    inner: MemorySource,
    trigger: String,
    cancel: CancelFlag,
}

impl ContentSource for CancellingSource {
    fn get(&self, path: &str) -> Result<Vec<u8>, SourceError> {
        if path == self.trigger {
            self.cancel.cancel();
        }
        self.inner.get(path)
    }

    fn put(&self, path: &str, bytes: &[u8]) -> Result<(), SourceError> {
        self.inner.put(path, bytes)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, SourceError> {
        self.inner.list(prefix)
    }

    fn delete(&self, path: &str) -> Result<(), SourceError> {
        self.inner.delete(path)
    }
}

#[test]
fn test_post_author_scenario() {
    init_logging();
    let db = database(BLOG, Arc::new(MemoryBackend::new()));
    let source = blog_source();
    db.index(&source, &IndexOptions::full()).unwrap();

    let query = QueryRequest::get(
        "posts",
        "posts/a.md",
        Selection::fields(["title"]).with("author", Selection::fields(["name"])),
    );
    let result = db.resolve(&query).unwrap();
    assert_eq!(result.data, json!({ "title": "Hello", "author": { "name": "Jane" } }));
    assert!(result.warnings.is_empty());

    source.delete("authors/jane.md").unwrap();
    let report = db.index(&source, &IndexOptions::paths(["authors/jane.md"])).unwrap();
    assert_eq!(report.deleted, 1);

    let result = db.resolve(&query).unwrap();
    assert_eq!(result.data, json!({ "title": "Hello", "author": null }));
    assert_eq!(result.warnings.len(), 1);
    assert_eq!(result.warnings[0].path, "author");

    // the reverse index still records who pointed at it
    let sources = db.referenced_by("authors", "authors/jane.md").unwrap();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].path, "posts/a.md");
}

#[test]
fn test_rebuild_is_idempotent() {
    init_logging();
    let storage = Arc::new(MemoryBackend::new());
    let db = database(BLOG, storage.clone());
    let source = blog_source();

    let first = db.index(&source, &IndexOptions::full()).unwrap();
    let second = db.index(&source, &IndexOptions::full()).unwrap();
    assert_eq!(second.generation, first.generation + 1);

    let before = generation_entries(&storage, first.generation);
    let after = generation_entries(&storage, second.generation);
    assert!(!before.is_empty());
    assert_eq!(before, after);

    // the generation retired by the last swap outlives one more rebuild
    let third = db.index(&source, &IndexOptions::full()).unwrap();
    assert_eq!(generation_entries(&storage, first.generation), before);
    assert_eq!(generation_entries(&storage, third.generation), after);

    let fourth = db.index(&source, &IndexOptions::full()).unwrap();
    assert!(generation_entries(&storage, first.generation).is_empty());
    assert_eq!(generation_entries(&storage, second.generation), after);
    assert_eq!(generation_entries(&storage, fourth.generation), after);
}

#[test]
fn test_readers_see_old_index_until_swap() {
    init_logging();
    let db = database(BLOG, Arc::new(MemoryBackend::new()));
    let old = blog_source();
    let before = db.index(&old, &IndexOptions::full()).unwrap();
    assert_eq!(titles(&db), vec!["Hello", "Second"]);

    let (reached_tx, reached_rx) = channel();
    let (release_tx, release_rx) = channel();
    let gated = GatedSource {
        inner: MemorySource::from_files([
            ("posts/a.md", "---\ntitle: Hello again\nrank: 1\n---\n"),
            ("posts/b.md", "---\ntitle: Second again\nrank: 2\n---\n"),
        ]),
        gate: "posts/b.md".into(),
        reached: Mutex::new(reached_tx),
        release: Mutex::new(release_rx),
    };

    thread::scope(|scope| {
        let rebuild = scope.spawn(|| db.index(&gated, &IndexOptions::full()));
        reached_rx.recv().unwrap();

        // posts/a.md is already in the shadow generation
        assert_eq!(titles(&db), vec!["Hello", "Second"]);
        assert_eq!(db.active_generation().unwrap(), Some(before.generation));
        assert!(matches!(
            db.index(&old, &IndexOptions::full()),
            Err(IndexError::RebuildInProgress { .. })
        ));
        assert!(matches!(
            db.index(&old, &IndexOptions::paths(["posts/a.md"])),
            Err(IndexError::RebuildInProgress { .. })
        ));

        release_tx.send(()).unwrap();
        let report = rebuild.join().unwrap().unwrap();
        assert_eq!(report.indexed, 2);
    });

    assert_eq!(titles(&db), vec!["Hello again", "Second again"]);
}

#[test]
fn test_cancelled_rebuild_keeps_previous_index() {
    init_logging();
    let storage = Arc::new(MemoryBackend::new());
    let db = database(BLOG, storage.clone());
    let before = db.index(&blog_source(), &IndexOptions::full()).unwrap();
    let snapshot = storage.snapshot();

    let cancel = CancelFlag::new();
    let source = CancellingSource {
        inner: MemorySource::from_files([
            ("posts/a.md", "---\ntitle: Changed\n---\n"),
            ("posts/b.md", "---\ntitle: Changed too\n---\n"),
        ]),
        trigger: "posts/a.md".into(),
        cancel: cancel.clone(),
    };
    let result = db.index(&source, &IndexOptions::full().with_cancel(cancel));
    assert!(matches!(result, Err(IndexError::Cancelled)));

    // nothing but the generation counter moved
    let without_counter = |mut entries: std::collections::BTreeMap<Vec<u8>, Vec<u8>>| {
        entries.remove(keys::GENERATION_KEY);
        entries
    };
    assert_eq!(without_counter(storage.snapshot()), without_counter(snapshot));
    assert_eq!(db.active_generation().unwrap(), Some(before.generation));
    assert_eq!(titles(&db), vec!["Hello", "Second"]);

    // the lock was released
    db.index(&blog_source(), &IndexOptions::full()).unwrap();
}

#[test]
fn test_stale_rebuild_cannot_clear_new_index() {
    init_logging();
    let storage = Arc::new(MemoryBackend::new());
    let config = DatabaseConfig {
        parallel: false,
        lock_ttl_secs: 0,
        ..DatabaseConfig::default()
    };
    let db = database_with(BLOG, storage.clone(), config);
    let first = db.index(&blog_source(), &IndexOptions::full()).unwrap();

    let (reached_tx, reached_rx) = channel();
    let (release_tx, release_rx) = channel();
    let stale = GatedSource {
        inner: MemorySource::from_files([
            ("posts/a.md", "---\ntitle: Stale\nrank: 1\n---\n"),
            ("posts/b.md", "---\ntitle: Stale too\nrank: 2\n---\n"),
        ]),
        gate: "posts/a.md".into(),
        reached: Mutex::new(reached_tx),
        release: Mutex::new(release_rx),
    };
    let fresh = MemorySource::from_files([
        ("posts/a.md", "---\ntitle: Fresh\nrank: 1\n---\n"),
        ("posts/b.md", "---\ntitle: Fresh too\nrank: 2\n---\n"),
    ]);

    thread::scope(|scope| {
        let slow = scope.spawn(|| db.index(&stale, &IndexOptions::full()));
        reached_rx.recv().unwrap();
        thread::sleep(std::time::Duration::from_millis(5));

        // the parked rebuild's lock has expired, so this one takes over
        let taken_over = db.index(&fresh, &IndexOptions::full()).unwrap();
        assert_ne!(taken_over.generation, first.generation + 1);
        assert_eq!(db.active_generation().unwrap(), Some(taken_over.generation));

        release_tx.send(()).unwrap();
        let result = slow.join().unwrap();
        assert!(
            matches!(result, Err(IndexError::LockLost { .. }) | Err(IndexError::Storage(_))),
            "{result:?}"
        );

        assert_eq!(db.active_generation().unwrap(), Some(taken_over.generation));
        assert!(!generation_entries(&storage, taken_over.generation).is_empty());
        assert!(generation_entries(&storage, first.generation + 1).is_empty());
    });

    assert_eq!(titles(&db), vec!["Fresh", "Fresh too"]);
    assert!(storage.get(keys::LOCK_KEY).unwrap().is_none());
}

/// Sort entries of `path` for one field and direction.
fn sort_entries(storage: &MemoryBackend, generation: u64, field: &str, descending: bool, path: &str) -> Vec<Vec<u8>> {
    let range = KeyRange::prefix(keys::sort_prefix(generation, "posts", field, descending));
    ScanIter::new(storage, range, Direction::Forward)
        .map(|entry| entry.unwrap().0)
        .filter(|key| key.ends_with(path.as_bytes()))
        .collect()
}

#[test]
fn test_concurrent_incremental_updates_same_path() {
    init_logging();
    let storage = Arc::new(MemoryBackend::new());
    let source = MemorySource::from_files([("posts/a.md", "---\ntitle: Start\nrank: 0\n---\n")]);
    let writers = [
        database(BLOG, storage.clone()),
        database(BLOG, storage.clone()),
    ];
    let generation = writers[0].index(&source, &IndexOptions::full()).unwrap().generation;

    thread::scope(|scope| {
        for (writer, db) in writers.iter().enumerate() {
            let source = &source;
            scope.spawn(move || {
                for i in 0..50 {
                    let text = format!("---\ntitle: w{writer}-{i}\nrank: {}\n---\n", writer * 100 + i);
                    source.put("posts/a.md", text.as_bytes()).unwrap();
                    // a run that keeps losing its guard gives up; the next call re-reads
                    loop {
                        match db.index(source, &IndexOptions::paths(["posts/a.md"])) {
                            Ok(_) => break,
                            Err(IndexError::Storage(StorageError::Conflict { .. })) => continue,
                            Err(e) => panic!("incremental update failed: {e}"),
                        }
                    }
                }
            });
        }
    });

    let expected = FrontMatterParser::new()
        .parse("posts/a.md", &source.get("posts/a.md").unwrap())
        .unwrap();
    let doc_key = keys::doc_key(generation, "posts", "posts/a.md");
    let record = DocumentRecord::from_bytes(&doc_key, &storage.get(&doc_key).unwrap().unwrap()).unwrap();
    let result = writers[1]
        .resolve(&QueryRequest::get("posts", "posts/a.md", Selection::fields(["title", "rank"])))
        .unwrap();
    assert_eq!(result.data["title"], expected["title"]);
    assert_eq!(result.data["rank"].as_f64(), expected["rank"].as_f64());

    for field in ["title", "rank"] {
        for descending in [false, true] {
            let expected = keys::sort_key(
                generation,
                "posts",
                field,
                descending,
                record.fields.get(field),
                "posts/a.md",
            );
            assert_eq!(
                sort_entries(&storage, generation, field, descending, "posts/a.md"),
                vec![expected]
            );
        }
    }
}

#[test]
fn test_full_selection_round_trip() {
    init_logging();
    let schema = r#"
collections:
  - name: events
    path: events
    fields:
      - { name: title, type: string, required: true }
      - { name: starts, type: datetime }
      - { name: seats, type: number }
      - { name: open, type: boolean }
      - { name: tags, type: list, items: string }
      - name: venue
        type: object
        fields:
          - { name: city, type: string }
      - { name: body, type: rich-text }
"#;
    let db = database(schema, Arc::new(MemoryBackend::new()));
    let source = MemorySource::new();
    db.index(&source, &IndexOptions::full()).unwrap();

    let content = json!({
        "title": "Launch",
        "starts": "2024-03-01",
        "seats": 120,
        "open": true,
        "tags": ["a", "b"],
        "venue": { "city": "Oslo" },
        "body": "# Details\n\nDoors at seven.\n"
    });
    let parser = FrontMatterParser::new();
    let bytes = parser.stringify("events/launch.md", &content).unwrap();
    source.put("events/launch.md", &bytes).unwrap();

    let report = db.index(&source, &IndexOptions::paths(["events/launch.md"])).unwrap();
    assert_eq!(report.indexed, 1);

    let result = db
        .resolve(&QueryRequest::get("events", "events/launch.md", Selection::new()))
        .unwrap();
    let mut expected = content;
    expected["starts"] = Value::from("2024-03-01T00:00:00.000Z");
    assert_eq!(result.data, expected);
}

#[test]
fn test_template_disambiguation() {
    init_logging();
    let schema = r#"
collections:
  - name: blocks
    path: blocks
    templates:
      - name: b
        fields:
          - { name: x, type: string, required: true }
          - { name: y, type: string, required: true }
      - name: a
        fields:
          - { name: x, type: string, required: true }
"#;
    let db = database(schema, Arc::new(MemoryBackend::new()));
    let source = MemorySource::from_files([
        ("blocks/both.json", r#"{"x": "1", "y": "2"}"#),
        ("blocks/only.json", r#"{"x": "1"}"#),
    ]);
    db.index(&source, &IndexOptions::full()).unwrap();

    let result = db
        .resolve(&QueryRequest::list("blocks", Selection::fields(["_path", "_template"])))
        .unwrap();
    assert_eq!(
        result.data,
        json!([
            { "_path": "blocks/both.json", "_template": "b" },
            { "_path": "blocks/only.json", "_template": "a" },
        ])
    );
}

fn collect_pages(db: &Database, request: &QueryRequest) -> Vec<String> {
    let mut paths = Vec::new();
    let mut cursor = None;
    loop {
        let page = db.resolve(&request.clone().after(cursor)).unwrap();
        paths.extend(
            page.items()
                .iter()
                .map(|item| item["_path"].as_str().unwrap().to_string()),
        );
        if !page.has_next_page() {
            return paths;
        }
        cursor = page.end_cursor();
        assert!(cursor.is_some());
    }
}

#[test]
fn test_pages_concatenate_to_unpaged_scan() {
    init_logging();
    let schema = r#"
collections:
  - name: items
    path: items
    fields:
      - { name: rank, type: number }
      - { name: label, type: string }
"#;
    let db = database(schema, Arc::new(MemoryBackend::new()));
    let source = MemorySource::new();
    for i in 0..25 {
        let body = if i % 5 == 0 {
            // no rank at all
            format!("---\nlabel: item {i}\n---\n")
        } else {
            format!("---\nrank: {}\nlabel: item {i}\n---\n", i % 4)
        };
        source.put(&format!("items/{i:02}.md"), body.as_bytes()).unwrap();
    }
    db.index(&source, &IndexOptions::full()).unwrap();

    let filter = Filter::Not(Box::new(Filter::eq("rank", 3)));
    for sort in [Sort::asc("rank"), Sort::desc("rank"), Sort::asc("_path"), Sort::desc("_path")] {
        let base = QueryRequest::list("items", Selection::fields(["_path"]))
            .with_sort(sort.clone())
            .with_filter(filter.clone());
        let unpaged = collect_pages(&db, &base.clone().with_page_size(1000));
        let paged = collect_pages(&db, &base.clone().with_page_size(7));
        assert_eq!(paged, unpaged, "sort {sort:?}");

        let mut unique = paged.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), paged.len());
    }

    // ascending by rank, missing values first, ties by path
    let ranked = collect_pages(
        &db,
        &QueryRequest::list("items", Selection::fields(["_path"])).with_sort(Sort::asc("rank")),
    );
    assert_eq!(ranked.len(), 25);
    assert_eq!(&ranked[..5], ["items/00.md", "items/05.md", "items/10.md", "items/15.md", "items/20.md"]);
    assert_eq!(&ranked[5..7], ["items/04.md", "items/08.md"]);

    let descending = collect_pages(
        &db,
        &QueryRequest::list("items", Selection::fields(["_path"])).with_sort(Sort::desc("rank")),
    );
    assert_eq!(&descending[..2], ["items/03.md", "items/07.md"]);
    assert_eq!(descending.last().map(String::as_str), Some("items/20.md"));
}

#[test]
fn test_cursor_is_tied_to_query_shape() {
    init_logging();
    let db = database(BLOG, Arc::new(MemoryBackend::new()));
    db.index(&blog_source(), &IndexOptions::full()).unwrap();

    let page = db
        .resolve(&QueryRequest::list("posts", Selection::new()).with_page_size(1))
        .unwrap();
    assert!(page.has_next_page());

    let other = QueryRequest::list("authors", Selection::new()).after(page.end_cursor());
    assert!(matches!(db.resolve(&other), Err(ResolveError::InvalidCursor(_))));
    let garbage = QueryRequest::list("posts", Selection::new()).after(Some("not a cursor".into()));
    assert!(matches!(db.resolve(&garbage), Err(ResolveError::InvalidCursor(_))));
}

#[test]
fn test_bad_documents_are_skipped_not_fatal() {
    init_logging();
    let db = database(BLOG, Arc::new(MemoryBackend::new()));
    let source = blog_source();
    source.put("posts/broken.md", b"---\ntitle: [unclosed\n---\n").unwrap();
    source.put("posts/untitled.md", b"---\nrank: 3\n---\n").unwrap();

    let report = db.index(&source, &IndexOptions::full()).unwrap();
    assert_eq!(report.indexed, 3);
    let mut skipped: Vec<&str> = report.skipped.iter().map(|s| s.path.as_str()).collect();
    skipped.sort();
    assert_eq!(skipped, vec!["posts/broken.md", "posts/untitled.md"]);
    assert_eq!(titles(&db), vec!["Hello", "Second"]);
}

#[test]
fn test_sqlite_and_filesystem() {
    init_logging();
    let content = tempfile::tempdir().unwrap();
    let index = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(content.path().join("posts")).unwrap();
    std::fs::create_dir_all(content.path().join("authors")).unwrap();
    std::fs::write(
        content.path().join("posts/a.md"),
        "---\ntitle: Hello\nrank: 1\nauthor: authors/jane.md\n---\n",
    )
    .unwrap();
    std::fs::write(content.path().join("authors/jane.md"), "---\nname: Jane\n---\n").unwrap();

    let db_path = index.path().join("index.db");
    let source = FsSource::new(content.path());
    {
        let storage = Arc::new(SqliteBackend::open(&db_path).unwrap());
        let db = database(BLOG, storage);
        let report = db.index(&source, &IndexOptions::full()).unwrap();
        assert_eq!(report.indexed, 2);
    }

    // reopen and read what the first handle wrote
    let storage: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::open(&db_path).unwrap());
    let db = database(BLOG, storage.clone());
    let result = db
        .resolve(&QueryRequest::get(
            "posts",
            "posts/a.md",
            Selection::fields(["title"]).with("author", Selection::fields(["name"])),
        ))
        .unwrap();
    assert_eq!(result.data, json!({ "title": "Hello", "author": { "name": "Jane" } }));

    let docs = ScanIter::new(&*storage, KeyRange::prefix("ns/"), Direction::Forward).count();
    assert!(docs > 0);
}
