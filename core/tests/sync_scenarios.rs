/// Sync engine scenarios
/// Drives controllers for a buyer and a seller against one shared local backend

extern crate chatsync_core;

use chatsync_core::backend::Backend;
use chatsync_core::config::Config;
use chatsync_core::dto::NewConversation;
use chatsync_core::types::{Listing, SyncEvent, Viewer};
use chatsync_core::{ChatState, ListState, LocalBackend, Session, SyncController, SyncError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

fn test_config(viewer: &str) -> Config {
    Config {
        viewer_id: viewer.to_string(),
        retry_initial: Duration::from_millis(5),
        retry_max: Duration::from_millis(50),
        max_attempts: 3,
        ..Config::default()
    }
}

fn controller(viewer: &str, name: &str, backend: &LocalBackend) -> SyncController {
    let session = Session::login(Viewer {
        id: viewer.to_string(),
        display_name: name.to_string(),
    })
    .unwrap();
    SyncController::new(session, Arc::new(backend.clone()), &test_config(viewer))
}

fn lamp() -> Listing {
    Listing {
        id: "L42".to_string(),
        title: "Desk lamp".to_string(),
        seller_id: "S1".to_string(),
        seller_name: "Sam".to_string(),
    }
}

fn new_conversation(listing: &str, buyer: &str, seller: &str) -> NewConversation {
    NewConversation {
        listing_id: listing.to_string(),
        buyer_id: buyer.to_string(),
        seller_id: seller.to_string(),
        buyer_name: Some(format!("{} name", buyer)),
        seller_name: Some("Sam".to_string()),
    }
}

/// Poll `check` until it holds or five seconds pass
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn unread_of(ctl: &SyncController, conversation_id: uuid::Uuid) -> usize {
    ctl.conversations()
        .await
        .into_iter()
        .find(|s| s.conversation.id == conversation_id)
        .map(|s| s.unread_count)
        .unwrap_or(0)
}

#[tokio::test]
async fn test_first_contact_creates_conversation_and_unread() {
    let backend = LocalBackend::temporary().unwrap();
    let seller = controller("S1", "Sam", &backend);
    seller.load_conversations().await.unwrap();
    assert_eq!(seller.list_state().await, ListState::Ready);
    assert_eq!(seller.unread_total().await, 0);

    let buyer = controller("B1", "Bea", &backend);
    let sent = buyer
        .start_conversation(&lamp(), "Hello, is this still available?")
        .await
        .unwrap();

    let row = backend.find_conversation("L42", "B1").await.unwrap().unwrap();
    assert_eq!(row.id, sent.conversation_id);
    assert_eq!(row.buyer_id, "B1");
    assert_eq!(row.seller_id, "S1");

    let messages = backend.fetch_messages(row.id).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "Hello, is this still available?");

    // The buyer's own message never counts for the buyer
    assert_eq!(buyer.unread_total().await, 0);

    let s = &seller;
    eventually("seller unread badge", move || async move { s.unread_total().await == 1 }).await;
    let summaries = seller.conversations().await;
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].other_participant_name, "Bea");
    assert_eq!(
        summaries[0].last_message.as_ref().map(|m| m.id),
        Some(sent.id)
    );
}

#[tokio::test]
async fn test_second_contact_reuses_conversation() {
    let backend = LocalBackend::temporary().unwrap();
    let buyer = controller("B1", "Bea", &backend);

    let first = buyer.start_conversation(&lamp(), "Hi there").await.unwrap();
    let second = buyer.start_conversation(&lamp(), "Still around?").await.unwrap();

    assert_eq!(first.conversation_id, second.conversation_id);
    assert_eq!(backend.fetch_conversations("B1").await.unwrap().len(), 1);
    let contents: Vec<_> = buyer.messages().await.into_iter().map(|m| m.content).collect();
    assert_eq!(contents, vec!["Hi there", "Still around?"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_contact_resolves_to_one_conversation() {
    let backend = LocalBackend::temporary().unwrap();
    let mut handles = Vec::new();
    for _ in 0..8 {
        let backend = backend.clone();
        handles.push(tokio::spawn(async move {
            backend
                .find_or_create_conversation(new_conversation("L42", "B1", "S1"))
                .await
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().unwrap().id);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(backend.fetch_conversations("S1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_background_message_bumps_unread_only() {
    let backend = LocalBackend::temporary().unwrap();
    let open = backend
        .insert_conversation(new_conversation("L1", "B1", "S1"))
        .await
        .unwrap();
    let background = backend
        .insert_conversation(new_conversation("L2", "B2", "S1"))
        .await
        .unwrap();
    backend.send_message(open.id, "B1", "Is the lamp still here?").await.unwrap();

    let seller = controller("S1", "Sam", &backend);
    seller.load_conversations().await.unwrap();
    seller.open_conversation(open.id).await.unwrap();
    assert_eq!(seller.chat_state().await, ChatState::Live);

    let before = seller.chat_view().await.unwrap();
    let mut events = seller.subscribe_events();

    backend
        .send_message(background.id, "B2", "Would you take 20?")
        .await
        .unwrap();

    let (s, bg) = (&seller, background.id);
    eventually("background unread", move || async move { unread_of(s, bg).await == 1 }).await;

    assert_eq!(seller.selected_conversation_id().await, Some(open.id));
    let after = seller.chat_view().await.unwrap();
    assert_eq!(after.conversation_id, open.id);
    assert_eq!(after.messages, before.messages);
    assert_eq!(unread_of(&seller, open.id).await, 0);

    let saw_unread = timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(SyncEvent::UnreadChanged { conversation_id, unread, .. })
                    if conversation_id == background.id =>
                {
                    return unread;
                }
                Ok(SyncEvent::ScrollToBottom { conversation_id }) => {
                    assert_ne!(conversation_id, background.id, "background chat must not scroll");
                }
                _ => {}
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(saw_unread, 1);
}

#[tokio::test]
async fn test_refresh_preserves_selection() {
    let backend = LocalBackend::temporary().unwrap();
    let a = backend
        .insert_conversation(new_conversation("L1", "B1", "S1"))
        .await
        .unwrap();
    let b = backend
        .insert_conversation(new_conversation("L2", "B2", "S1"))
        .await
        .unwrap();

    let seller = controller("S1", "Sam", &backend);
    seller.load_conversations().await.unwrap();
    seller.open_conversation(a.id).await.unwrap();
    seller.send("Yes, it is").await.unwrap();

    backend.send_message(b.id, "B2", "hello?").await.unwrap();
    seller.refresh_conversations().await.unwrap();

    assert_eq!(seller.selected_conversation_id().await, Some(a.id));
    assert_eq!(seller.list_state().await, ListState::Ready);
    let view = seller.chat_view().await.unwrap();
    assert_eq!(view.conversation_id, a.id);
    assert_eq!(view.messages.len(), 1);

    // B moved to the top of the list without being opened
    let summaries = seller.conversations().await;
    assert_eq!(summaries[0].conversation.id, b.id);
}

#[tokio::test]
async fn test_opening_marks_messages_read() {
    let backend = LocalBackend::temporary().unwrap();
    let conv = backend
        .insert_conversation(new_conversation("L1", "B1", "S1"))
        .await
        .unwrap();
    backend.send_message(conv.id, "B1", "one").await.unwrap();
    backend.send_message(conv.id, "B1", "two").await.unwrap();

    let seller = controller("S1", "Sam", &backend);
    seller.load_conversations().await.unwrap();
    assert_eq!(seller.unread_total().await, 2);

    seller.open_conversation(conv.id).await.unwrap();
    assert_eq!(seller.unread_total().await, 0);

    let (b, id) = (&backend, conv.id);
    eventually("remote read flags", move || async move {
        b.fetch_messages(id)
            .await
            .map(|rows| rows.iter().all(|r| r.is_read))
            .unwrap_or(false)
    })
    .await;

    // An incoming message in the open chat is read on arrival
    backend.send_message(conv.id, "B1", "three").await.unwrap();
    let s = &seller;
    eventually("third message", move || async move { s.messages().await.len() == 3 }).await;
    assert_eq!(seller.unread_total().await, 0);
}

#[tokio::test]
async fn test_navigate_by_id() {
    let backend = LocalBackend::temporary().unwrap();
    let conv = backend
        .insert_conversation(new_conversation("L1", "B1", "S1"))
        .await
        .unwrap();
    let foreign = backend
        .insert_conversation(new_conversation("L9", "B9", "S9"))
        .await
        .unwrap();
    backend.send_message(conv.id, "S1", "Still for sale").await.unwrap();

    let buyer = controller("B1", "Bea", &backend);
    buyer.navigate_to(conv.id).await.unwrap();
    assert_eq!(buyer.selected_conversation_id().await, Some(conv.id));
    assert_eq!(buyer.chat_state().await, ChatState::Live);
    assert_eq!(buyer.messages().await.len(), 1);

    let err = buyer.navigate_to(foreign.id).await.unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));
    assert_eq!(buyer.selected_conversation_id().await, Some(conv.id));
}

#[tokio::test]
async fn test_close_suppresses_late_effects() {
    let backend = LocalBackend::temporary().unwrap();
    let buyer = controller("B1", "Bea", &backend);
    let sent = buyer.start_conversation(&lamp(), "Hi").await.unwrap();

    buyer.close().await;
    assert_eq!(buyer.chat_state().await, ChatState::Closed);
    assert!(buyer.messages().await.is_empty());

    let err = buyer.send("anyone?").await.unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));

    // Messages arriving after close still land in the store, unread
    backend.send_message(sent.conversation_id, "S1", "Yes").await.unwrap();
    buyer.load_conversations().await.unwrap();
    assert_eq!(buyer.unread_total().await, 1);
    assert_eq!(buyer.session().messages(sent.conversation_id).await.len(), 2);
}
