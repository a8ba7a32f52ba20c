//! File catalog and chunked transfer between mocked peers

mod common;

use bytes::Bytes;
use common::{connect, pump, Node};
use peerdrop::webrtc::{
    ChannelMessage, ChannelState, Command, DataChannel, Negotiation, PeerEvent, ResponderState,
    SessionDescription, SignalingEvent,
};
use peerdrop::{Error, MemoryFile};
use std::sync::{Arc, Mutex};

/// Deliver already captured frames from `from` to `to`
async fn deliver(frames: Vec<ChannelMessage>, from: &Node, to: &mut Node) {
    for message in frames {
        to.manager
            .handle_peer_event(PeerEvent::ChannelMessage {
                peer_id: from.id.clone(),
                message,
            })
            .await;
    }
}

fn record_progress(node: &Node) -> Arc<Mutex<Vec<u64>>> {
    let progress = Arc::new(Mutex::new(Vec::new()));
    let recorded = progress.clone();
    node.store().subscribe(move |state| {
        if let Some(download) = &state.current_download {
            let mut recorded = recorded.lock().unwrap();
            if recorded.last() != Some(&download.bytes_received) {
                recorded.push(download.bytes_received);
            }
        }
    });
    progress
}

#[tokio::test]
async fn test_report_pdf_scenario() {
    let mut sender = Node::new("sender-a", 100);
    let mut first = Node::new("receiver-b", 100);
    let mut second = Node::new("receiver-c", 100);

    let contents: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
    sender
        .add_file(MemoryFile::shared("report.pdf", contents.clone()))
        .await;

    connect(&mut sender, &mut first).await;
    connect(&mut sender, &mut second).await;
    pump(&sender, &mut first).await;
    pump(&sender, &mut second).await;

    // Both receivers learned about the file on channel open
    for node in [&first, &second] {
        let state = node.store().get_state();
        assert_eq!(state.downloadable_files.len(), 1);
        let file = &state.downloadable_files[0];
        assert_eq!(file.name(), "report.pdf");
        assert_eq!(file.size(), 300);
        assert_eq!(file.meta.mime_type, "application/pdf");
        assert_eq!(file.source_peer, sender.id);
    }

    let progress = record_progress(&first);
    first.download(&sender.id, "report.pdf").await.unwrap();
    assert_eq!(pump(&first, &mut sender).await, 1);
    sender.finish_uploads().await;

    let frames = sender.channel_to(&first.id).take_sent();
    assert_eq!(frames.len(), 4);
    match &frames[0] {
        ChannelMessage::Text(text) => {
            let value: serde_json::Value = serde_json::from_str(text).unwrap();
            assert_eq!(
                value,
                serde_json::json!({
                    "type": "file/download/setup",
                    "payload": {"name": "report.pdf", "size": 300}
                })
            );
        }
        other => panic!("Expected setup first, got {:?}", other),
    }
    for frame in &frames[1..] {
        match frame {
            ChannelMessage::Binary(data) => assert_eq!(data.len(), 100),
            other => panic!("Expected binary chunk, got {:?}", other),
        }
    }

    deliver(frames, &sender, &mut first).await;

    assert_eq!(*progress.lock().unwrap(), vec![0, 100, 200, 300]);
    assert!(first.store().get_state().current_download.is_none());
    let files = first.sink.files();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].0, "report.pdf");
    assert_eq!(files[0].1, Bytes::from(contents));

    // Nothing was streamed to the peer that did not ask
    assert!(sender.channel_to(&second.id).take_sent().is_empty());
    assert!(second.store().get_state().current_download.is_none());
}

#[tokio::test]
async fn test_single_flight_download() {
    let mut sender = Node::new("sender", 100);
    let mut receiver = Node::new("receiver", 100);

    sender
        .add_file(MemoryFile::shared("a.bin", vec![1u8; 500]))
        .await;
    sender
        .add_file(MemoryFile::shared("b.bin", vec![2u8; 500]))
        .await;
    connect(&mut sender, &mut receiver).await;
    pump(&sender, &mut receiver).await;
    assert_eq!(receiver.store().get_state().downloadable_files.len(), 2);

    receiver.download(&sender.id, "a.bin").await.unwrap();
    match receiver.download(&sender.id, "b.bin").await {
        Err(Error::TransferConflict { active }) => assert_eq!(active, "a.bin"),
        other => panic!("Expected conflict, got {:?}", other),
    }

    let current = receiver.store().get_state().current_download.unwrap();
    assert_eq!(current.file.name(), "a.bin");

    let requests: Vec<String> = receiver
        .channel_to(&sender.id)
        .sent_texts()
        .into_iter()
        .filter(|t| t.contains("\"file/download\""))
        .collect();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].contains("a.bin"));
}

#[tokio::test]
async fn test_uneven_chunks() {
    let mut sender = Node::new("sender", 64);
    let mut receiver = Node::new("receiver", 64);

    sender
        .add_file(MemoryFile::shared("odd.bin", vec![9u8; 250]))
        .await;
    connect(&mut sender, &mut receiver).await;
    pump(&sender, &mut receiver).await;

    let progress = record_progress(&receiver);
    receiver.download(&sender.id, "odd.bin").await.unwrap();
    pump(&receiver, &mut sender).await;
    sender.finish_uploads().await;

    let frames = sender.channel_to(&receiver.id).take_sent();
    let chunk_lengths: Vec<usize> = frames
        .iter()
        .filter_map(|f| match f {
            ChannelMessage::Binary(data) => Some(data.len()),
            ChannelMessage::Text(_) => None,
        })
        .collect();
    assert_eq!(chunk_lengths, vec![64, 64, 64, 58]);

    deliver(frames, &sender, &mut receiver).await;

    let progress = progress.lock().unwrap().clone();
    assert!(progress.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(progress.last(), Some(&250));
    assert_eq!(receiver.sink.files()[0].1.len(), 250);
}

#[tokio::test]
async fn test_extra_chunk_after_completion_is_dropped() {
    let mut sender = Node::new("sender", 100);
    let mut receiver = Node::new("receiver", 100);

    sender
        .add_file(MemoryFile::shared("done.txt", vec![b'x'; 150]))
        .await;
    connect(&mut sender, &mut receiver).await;
    pump(&sender, &mut receiver).await;

    receiver.download(&sender.id, "done.txt").await.unwrap();
    pump(&receiver, &mut sender).await;
    sender.finish_uploads().await;
    pump(&sender, &mut receiver).await;
    assert_eq!(receiver.sink.files().len(), 1);

    receiver
        .manager
        .handle_peer_event(PeerEvent::ChannelMessage {
            peer_id: sender.id.clone(),
            message: ChannelMessage::Binary(Bytes::from_static(b"stray")),
        })
        .await;

    assert!(receiver.store().get_state().current_download.is_none());
    assert!(!receiver.manager.coordinator().is_receiving_from(&sender.id));
    assert_eq!(receiver.sink.files().len(), 1);
}

#[tokio::test]
async fn test_peer_teardown_cascade() {
    let mut a = Node::new("peer-a", 100);
    let mut b = Node::new("peer-b", 100);
    let mut receiver = Node::new("receiver", 100);

    a.add_file(MemoryFile::shared("from-a.txt", vec![1u8; 1000])).await;
    b.add_file(MemoryFile::shared("from-b.txt", vec![2u8; 10])).await;
    connect(&mut a, &mut receiver).await;
    connect(&mut b, &mut receiver).await;
    pump(&a, &mut receiver).await;
    pump(&b, &mut receiver).await;

    receiver.download(&a.id, "from-a.txt").await.unwrap();
    let state = receiver.store().get_state();
    assert_eq!(state.peers.len(), 2);
    assert_eq!(state.downloadable_files.len(), 2);

    receiver.channel_to(&a.id).set_state(ChannelState::Closed);
    receiver
        .manager
        .handle_peer_event(PeerEvent::ChannelClosed {
            peer_id: a.id.clone(),
        })
        .await;

    let state = receiver.store().get_state();
    let peer_ids: Vec<_> = state.peers.iter().map(|p| p.id.clone()).collect();
    assert_eq!(peer_ids, vec![b.id.clone()]);
    assert_eq!(state.downloadable_files.len(), 1);
    assert_eq!(state.downloadable_files[0].name(), "from-b.txt");
    assert_eq!(state.downloadable_files[0].source_peer, b.id);
    assert!(state.current_download.is_none());
    assert!(receiver.factory.connection(&a.id).closed.load(std::sync::atomic::Ordering::SeqCst));
}

#[tokio::test]
async fn test_renegotiation_drops_state_of_replaced_connection() {
    let mut sender = Node::new("sender", 100);
    let mut receiver = Node::new("receiver", 100);

    sender.add_file(MemoryFile::shared("a.bin", vec![1u8; 500])).await;
    sender.add_file(MemoryFile::shared("b.bin", vec![2u8; 50])).await;
    connect(&mut sender, &mut receiver).await;
    pump(&sender, &mut receiver).await;

    receiver.download(&sender.id, "a.bin").await.unwrap();
    pump(&receiver, &mut sender).await;
    sender.finish_uploads().await;

    // Setup and the first chunk arrive, then the sender renegotiates
    let frames: Vec<_> = sender
        .channel_to(&receiver.id)
        .take_sent()
        .into_iter()
        .take(2)
        .collect();
    deliver(frames, &sender, &mut receiver).await;
    assert!(receiver.manager.coordinator().is_receiving_from(&sender.id));
    let old_channel = receiver.channel_to(&sender.id);

    receiver
        .manager
        .handle_signaling(SignalingEvent::Offer {
            id: sender.id.clone(),
            offer: SessionDescription::offer("second-offer"),
        })
        .await;

    let state = receiver.store().get_state();
    assert!(state.downloadable_files.is_empty());
    assert!(state.current_download.is_none());
    assert!(!receiver.manager.coordinator().is_receiving_from(&sender.id));
    assert_eq!(old_channel.ready_state(), ChannelState::Closed);
    let peer = state.peer(&sender.id).unwrap();
    assert_eq!(peer.negotiation, Negotiation::Responder(ResponderState::AnswerSent));
    assert_eq!(peer.channel, None);

    // The old channel's close notification does not touch the new record
    receiver
        .manager
        .handle_peer_event(PeerEvent::ChannelClosed {
            peer_id: sender.id.clone(),
        })
        .await;
    assert!(receiver.store().get_state().peer(&sender.id).is_some());

    // Once reconnected, downloads are no longer blocked by the abandoned one
    connect(&mut sender, &mut receiver).await;
    pump(&sender, &mut receiver).await;
    assert_eq!(receiver.store().get_state().downloadable_files.len(), 2);
    receiver.download(&sender.id, "b.bin").await.unwrap();
    assert_eq!(
        receiver.store().get_state().current_download.unwrap().file.name(),
        "b.bin"
    );
}

#[tokio::test]
async fn test_empty_file_transfer() {
    let mut sender = Node::new("sender", 100);
    let mut receiver = Node::new("receiver", 100);

    sender.add_file(MemoryFile::shared("empty.txt", Vec::new())).await;
    connect(&mut sender, &mut receiver).await;
    pump(&sender, &mut receiver).await;

    receiver.download(&sender.id, "empty.txt").await.unwrap();
    pump(&receiver, &mut sender).await;
    sender.finish_uploads().await;

    let frames = sender.channel_to(&receiver.id).take_sent();
    assert_eq!(frames.len(), 1);
    deliver(frames, &sender, &mut receiver).await;

    assert!(receiver.store().get_state().current_download.is_none());
    let files = receiver.sink.files();
    assert_eq!(files.len(), 1);
    assert!(files[0].1.is_empty());
}

#[tokio::test]
async fn test_unsolicited_transfer_ignored() {
    let mut sender = Node::new("sender", 100);
    let mut receiver = Node::new("receiver", 100);
    connect(&mut sender, &mut receiver).await;

    let setup = r#"{"type":"file/download/setup","payload":{"name":"surprise.bin","size":4}}"#;
    deliver(
        vec![
            ChannelMessage::Text(setup.to_string()),
            ChannelMessage::Binary(Bytes::from_static(b"abcd")),
        ],
        &sender,
        &mut receiver,
    )
    .await;

    assert!(receiver.sink.files().is_empty());
    assert!(receiver.store().get_state().current_download.is_none());
    assert!(!receiver.manager.coordinator().is_receiving_from(&sender.id));
}

#[tokio::test]
async fn test_malformed_control_message_is_contained() {
    let mut sender = Node::new("sender", 100);
    let mut receiver = Node::new("receiver", 100);
    connect(&mut sender, &mut receiver).await;
    let before = receiver.store().get_state();

    deliver(
        vec![
            ChannelMessage::Text("{not json".to_string()),
            ChannelMessage::Text(r#"{"type":"file/explode","payload":{}}"#.to_string()),
        ],
        &sender,
        &mut receiver,
    )
    .await;

    let after = receiver.store().get_state();
    assert_eq!(after.peers, before.peers);
    assert!(after.downloadable_files.is_empty());
}

#[tokio::test]
async fn test_unknown_file_request_sends_nothing() {
    let mut sender = Node::new("sender", 100);
    let mut receiver = Node::new("receiver", 100);
    connect(&mut sender, &mut receiver).await;

    deliver(
        vec![ChannelMessage::Text(
            r#"{"type":"file/download","payload":{"name":"missing.txt"}}"#.to_string(),
        )],
        &receiver,
        &mut sender,
    )
    .await;

    assert_eq!(sender.manager.coordinator().active_uploads(), 0);
    assert!(sender.channel_to(&receiver.id).take_sent().is_empty());
}

#[tokio::test]
async fn test_remove_file_prunes_remote_catalog() {
    let mut sender = Node::new("sender", 100);
    let mut receiver = Node::new("receiver", 100);

    sender.add_file(MemoryFile::shared("keep.txt", vec![1u8; 3])).await;
    sender.add_file(MemoryFile::shared("drop.txt", vec![2u8; 3])).await;
    connect(&mut sender, &mut receiver).await;
    pump(&sender, &mut receiver).await;
    assert_eq!(receiver.store().get_state().downloadable_files.len(), 2);

    sender
        .manager
        .handle_command(Command::RemoveFile("drop.txt".to_string()))
        .await;
    pump(&sender, &mut receiver).await;

    let owned = sender.store().get_state().owned_files;
    assert_eq!(owned.len(), 1);
    let files = receiver.store().get_state().downloadable_files;
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name(), "keep.txt");
}

#[tokio::test]
async fn test_new_file_reaches_connected_peers() {
    let mut sender = Node::new("sender", 100);
    let mut receiver = Node::new("receiver", 100);
    connect(&mut sender, &mut receiver).await;

    sender.add_file(MemoryFile::shared("late.txt", vec![0u8; 5])).await;
    // Announcing the same name again replaces the entry
    sender.add_file(MemoryFile::shared("late.txt", vec![0u8; 7])).await;
    pump(&sender, &mut receiver).await;

    let files = receiver.store().get_state().downloadable_files;
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].size(), 7);
    assert_eq!(sender.store().get_state().owned_files.len(), 1);
}
