mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{backend_factory, embedder_factory, next_pass, prefs, settings, write, FakeEmbedder, ScriptedBackend};
use note_vault::ai::{Role, SessionState};
use note_vault::config::settings::StorageBackend;
use note_vault::{ChatOptions, IndexEvent, SessionId, StreamEvent, VaultError, VaultService};
use tokio::sync::mpsc::UnboundedReceiver;

struct Harness {
    data: tempfile::TempDir,
    vault: tempfile::TempDir,
    embedder: Arc<FakeEmbedder>,
    backend: Arc<ScriptedBackend>,
    service: VaultService,
}

impl Harness {
    fn new(embedder: Arc<FakeEmbedder>, backend: Arc<ScriptedBackend>) -> Self {
        let data = tempfile::tempdir().unwrap();
        let vault = tempfile::tempdir().unwrap();
        let service = VaultService::with_factories(
            prefs(),
            settings(data.path(), StorageBackend::Sqlite),
            backend_factory(backend.clone()),
            embedder_factory(embedder.clone()),
        );
        Self {
            data,
            vault,
            embedder,
            backend,
            service,
        }
    }

    fn standard() -> Self {
        Self::new(
            FakeEmbedder::new(),
            ScriptedBackend::new(&["Hello", " there", "!"], Duration::ZERO),
        )
    }
}

async fn collect(mut rx: UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("stream stalled")
    {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_open_index_and_search() {
    let h = Harness::standard();
    write(h.vault.path(), "rust.md", "ownership and borrowing");
    write(h.vault.path(), "cooking.md", "pasta with tomato sauce");

    let (id, mut events) = h.service.open_vault_and_index(h.vault.path()).await.unwrap();
    let pass = next_pass(&mut events).await;
    assert_eq!(pass.last(), Some(&IndexEvent::Progress(1.0)));

    let hits = h.service.search(&id, "ownership and borrowing", 1).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].source_path, "rust.md");
    assert!(h.embedder.calls() >= 3);
    assert!(h.data.path().join("vectordb.sqlite").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_opens_of_one_directory_conflict() {
    let h = Arc::new(Harness::standard());
    let mut tasks = Vec::new();
    for _ in 0..2 {
        let h = Arc::clone(&h);
        tasks.push(tokio::spawn(async move {
            h.service
                .open_vault_and_index(h.vault.path())
                .await
                .map(|(id, _)| id)
        }));
    }

    let mut opened = 0;
    let mut conflicts = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => opened += 1,
            Err(VaultError::Conflict { .. }) => conflicts += 1,
            Err(e) => panic!("unexpected error {}", e),
        }
    }
    assert_eq!((opened, conflicts), (1, 1));
    assert_eq!(h.service.registry().len(), 1);
    h.service.shutdown().await;
}

#[tokio::test]
async fn test_unavailable_embedder_reports_actionable_error() {
    let h = Harness::new(
        FakeEmbedder::failing_from(1),
        ScriptedBackend::new(&["x"], Duration::ZERO),
    );
    write(h.vault.path(), "a.md", "alpha");

    let (id, mut events) = h.service.open_vault_and_index(h.vault.path()).await.unwrap();
    let pass = next_pass(&mut events).await;
    match pass.last() {
        Some(IndexEvent::Error(message)) => {
            assert!(message.contains("Embedding function error"));
            assert!(message.contains("embedding model"));
        }
        other => panic!("expected an error event, got {:?}", other),
    }

    let session = h.service.registry().lookup_by_session_id(&id).unwrap();
    assert!(!session.is_watching());
    h.service.close_vault(&id).await.unwrap();
}

#[tokio::test]
async fn test_chat_streams_tokens_and_records_history() {
    let h = Harness::standard();
    let (id, mut events) = h.service.open_vault_and_index(h.vault.path()).await.unwrap();
    next_pass(&mut events).await;

    let stream = h
        .service
        .send_chat_message(&id, "greet me", ChatOptions::default())
        .unwrap();
    let received = collect(stream).await;
    assert_eq!(
        received,
        vec![
            StreamEvent::Token("Hello".into()),
            StreamEvent::Token(" there".into()),
            StreamEvent::Token("!".into()),
            StreamEvent::Done,
        ]
    );

    let session = h.service.registry().lookup_by_session_id(&id).unwrap();
    let history = session.generation().history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[1].content, "Hello there!");
    assert_eq!(h.backend.loads(), 1);

    let stream = h
        .service
        .send_chat_message(
            &id,
            "fresh start",
            ChatOptions {
                ignore_history: true,
                context_chunks: 0,
            },
        )
        .unwrap();
    collect(stream).await;
    assert_eq!(h.backend.last_prompt().len(), 1);
    assert!(session.generation().history().is_empty());
    assert_eq!(h.backend.loads(), 1);
}

#[tokio::test]
async fn test_chat_with_context_cites_sources() {
    let h = Harness::standard();
    write(h.vault.path(), "projects/rust.md", "ownership and borrowing");
    let (id, mut events) = h.service.open_vault_and_index(h.vault.path()).await.unwrap();
    next_pass(&mut events).await;

    let stream = h
        .service
        .send_chat_message(
            &id,
            "what about ownership?",
            ChatOptions {
                ignore_history: false,
                context_chunks: 2,
            },
        )
        .unwrap();
    collect(stream).await;

    let prompt = h.backend.last_prompt();
    let sent = &prompt.last().unwrap().content;
    assert!(sent.contains("[projects/rust.md]"));
    assert!(sent.contains("what about ownership?"));
}

#[tokio::test]
async fn test_abort_stops_tokens_and_finishes_with_done() {
    let backend = ScriptedBackend::new(&["one", " two", " three", " four"], Duration::from_millis(200));
    let h = Harness::new(FakeEmbedder::new(), backend);
    let (id, mut events) = h.service.open_vault_and_index(h.vault.path()).await.unwrap();
    next_pass(&mut events).await;

    let mut stream = h
        .service
        .send_chat_message(&id, "count", ChatOptions::default())
        .unwrap();
    let first = tokio::time::timeout(Duration::from_secs(5), stream.recv())
        .await
        .unwrap();
    assert_eq!(first, Some(StreamEvent::Token("one".into())));

    h.service.abort_generation(&id).unwrap();
    let rest = collect(stream).await;
    assert_eq!(rest, vec![StreamEvent::Done]);

    let session = h.service.registry().lookup_by_session_id(&id).unwrap();
    assert_eq!(session.generation().state(), SessionState::Ready);
    let history = session.generation().history();
    assert_eq!(history.last().map(|m| m.content.as_str()), Some("one"));
}

#[tokio::test]
async fn test_second_prompt_while_generating_is_busy() {
    let backend = ScriptedBackend::new(&["slow", " answer"], Duration::from_millis(200));
    let h = Harness::new(FakeEmbedder::new(), backend);
    let (id, mut events) = h.service.open_vault_and_index(h.vault.path()).await.unwrap();
    next_pass(&mut events).await;

    let mut first = h
        .service
        .send_chat_message(&id, "first", ChatOptions::default())
        .unwrap();
    let token = tokio::time::timeout(Duration::from_secs(5), first.recv()).await.unwrap();
    assert!(matches!(token, Some(StreamEvent::Token(_))));

    let second = h
        .service
        .send_chat_message(&id, "second", ChatOptions::default())
        .unwrap();
    let events = collect(second).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], StreamEvent::Error(msg) if msg.contains("busy")));

    let rest = collect(first).await;
    assert_eq!(rest.last(), Some(&StreamEvent::Done));
}

#[tokio::test]
async fn test_generation_failure_keeps_session_usable() {
    let h = Harness::new(FakeEmbedder::new(), ScriptedBackend::failing_after(&["a", "b"], 1));
    let (id, mut events) = h.service.open_vault_and_index(h.vault.path()).await.unwrap();
    next_pass(&mut events).await;

    let events = collect(
        h.service
            .send_chat_message(&id, "hi", ChatOptions::default())
            .unwrap(),
    )
    .await;
    assert_eq!(events.first(), Some(&StreamEvent::Token("a".into())));
    assert!(matches!(events.last(), Some(StreamEvent::Error(_))));
    assert!(!events.contains(&StreamEvent::Done));

    let session = h.service.registry().lookup_by_session_id(&id).unwrap();
    assert!(session.generation().history().is_empty());
    assert_eq!(session.generation().state(), SessionState::Ready);
}

#[tokio::test]
async fn test_watcher_picks_up_new_files() {
    let h = Harness::standard();
    write(h.vault.path(), "first.md", "first note");
    let (id, mut events) = h.service.open_vault_and_index(h.vault.path()).await.unwrap();
    next_pass(&mut events).await;

    let session = h.service.registry().lookup_by_session_id(&id).unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !session.is_watching() {
        assert!(tokio::time::Instant::now() < deadline, "watcher never started");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    write(h.vault.path(), "second.md", "second note");
    let pass = next_pass(&mut events).await;
    assert_eq!(pass.last(), Some(&IndexEvent::Progress(1.0)));
    let stored = session.table().stored_files().await.unwrap();
    assert!(stored.contains_key("second.md"));
}

#[tokio::test]
async fn test_close_releases_everything_and_remembers_directory() {
    let h = Harness::standard();
    write(h.vault.path(), "a.md", "alpha");
    let (id, mut events) = h.service.open_vault_and_index(h.vault.path()).await.unwrap();
    next_pass(&mut events).await;
    collect(
        h.service
            .send_chat_message(&id, "hi", ChatOptions::default())
            .unwrap(),
    )
    .await;

    let session = h.service.registry().lookup_by_session_id(&id).unwrap();
    h.service.close_vault(&id).await.unwrap();
    h.service.close_vault(&id).await.unwrap();

    assert!(session.is_closed());
    assert!(!session.is_watching());
    assert!(!session.table().is_open().await);
    assert_eq!(session.generation().state(), SessionState::Uninitialized);
    assert_eq!(h.backend.unloads(), 1);
    assert_eq!(h.service.registry().loaded_embedders().await, 0);
    assert_eq!(h.service.registry().loaded_backends().await, 0);
    assert!(matches!(
        h.service.registry().lookup_by_session_id(&id),
        Err(VaultError::NotFound(_))
    ));
    assert_eq!(
        h.service.last_opened_directory(),
        Some(std::fs::canonicalize(h.vault.path()).unwrap())
    );

    // the directory can be opened again once the session is gone
    let (again, _events) = h.service.open_vault_and_index(h.vault.path()).await.unwrap();
    assert_ne!(again, id);
}

#[tokio::test]
async fn test_two_vaults_share_one_embedder() {
    let h = Harness::standard();
    let other = tempfile::tempdir().unwrap();
    let (a, mut a_events) = h.service.open_vault_and_index(h.vault.path()).await.unwrap();
    let (b, mut b_events) = h.service.open_vault_and_index(other.path()).await.unwrap();
    next_pass(&mut a_events).await;
    next_pass(&mut b_events).await;

    assert_eq!(h.service.registry().loaded_embedders().await, 1);
    h.service.close_vault(&a).await.unwrap();
    assert_eq!(h.service.registry().loaded_embedders().await, 1);
    h.service.close_vault(&b).await.unwrap();
    assert_eq!(h.service.registry().loaded_embedders().await, 0);
}

#[tokio::test]
async fn test_reindex_runs_another_full_pass() {
    let h = Harness::standard();
    write(h.vault.path(), "a.md", "alpha");
    let (id, mut events) = h.service.open_vault_and_index(h.vault.path()).await.unwrap();
    next_pass(&mut events).await;

    h.service.reindex(&id).await.unwrap();
    let pass = next_pass(&mut events).await;
    assert_eq!(pass, vec![IndexEvent::Progress(1.0)]);

    let missing = SessionId::from("nope");
    assert!(matches!(h.service.reindex(&missing).await, Err(VaultError::NotFound(_))));
}
