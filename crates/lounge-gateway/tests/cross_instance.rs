//! Two instances sharing one store: room events published by one are
//! replayed to the other's members.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use lounge_gateway::coordinator::RoomCoordinator;
use lounge_gateway::dispatcher::Dispatcher;
use lounge_gateway::irc::{AdmissionGovernor, IrcBridgeManager};
use lounge_store::SharedStateStore;
use lounge_types::events::{ClientCommand, ReactionEvent, RoomCommand, ServerEvent, TubeEvent};
use lounge_types::models::User;

const WAIT: Duration = Duration::from_secs(5);

async fn instance(store: &SharedStateStore, name: &str) -> RoomCoordinator {
    let dispatcher = Dispatcher::new(store.clone(), name);
    let irc = IrcBridgeManager::new(None, dispatcher.clone(), AdmissionGovernor::spawn());
    let coordinator = RoomCoordinator::new(dispatcher, irc);
    tokio::spawn(coordinator.clone().run_bus());
    coordinator
}

async fn join(c: &RoomCoordinator, name: &str) -> (String, UnboundedReceiver<ServerEvent>) {
    let (socket_id, rx) = c.connect().await;
    c.handle(
        &socket_id,
        ClientCommand::Room(RoomCommand::JoinRoom {
            room_id: "general".into(),
            user: User::guest(name),
            previous_socket_id: None,
        }),
    )
    .await;
    (socket_id, rx)
}

/// Skip events until one matches.
async fn wait_for<F>(rx: &mut UnboundedReceiver<ServerEvent>, mut matches: F) -> ServerEvent
where
    F: FnMut(&ServerEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for an event")
}

#[tokio::test]
async fn chat_tube_and_reactions_cross_instances() {
    let store = SharedStateStore::memory();
    let east = instance(&store, "east").await;
    let west = instance(&store, "west").await;
    // Let both bus listeners subscribe.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (ann, _ann_rx) = join(&east, "ann").await;
    let (_, mut bob_rx) = join(&west, "bob").await;

    east.handle(
        &ann,
        ClientCommand::Room(RoomCommand::ChatMessage {
            text: "hello from east".into(),
        }),
    )
    .await;
    let message_id = match wait_for(&mut bob_rx, |e| matches!(e, ServerEvent::ChatMessage(_))).await {
        ServerEvent::ChatMessage(message) => {
            assert_eq!(message.sender, "ann");
            assert_eq!(message.text, "hello from east");
            message.id
        }
        other => panic!("unexpected event: {:?}", other),
    };

    east.handle(
        &ann,
        ClientCommand::Tube(TubeEvent::Load {
            video_id: Some("abc123".into()),
            title: Some("Intro".into()),
        }),
    )
    .await;
    match wait_for(&mut bob_rx, |e| matches!(e, ServerEvent::TubeState(_))).await {
        ServerEvent::TubeState(snapshot) => {
            assert_eq!(snapshot.state.video_id.as_deref(), Some("abc123"));
            assert_eq!(snapshot.state.owner_id.as_deref(), Some(ann.as_str()));
        }
        other => panic!("unexpected event: {:?}", other),
    }
    let cached = west.tube().peek("general").await.expect("west has no tube for the room");
    assert_eq!(cached.state.video_id.as_deref(), Some("abc123"));
    assert_eq!(cached.state.title.as_deref(), Some("Intro"));

    east.handle(
        &ann,
        ClientCommand::Reaction(ReactionEvent::React {
            message_id: message_id.clone(),
            emoji: "👍".into(),
        }),
    )
    .await;
    wait_for(&mut bob_rx, |e| matches!(e, ServerEvent::MessageReactionsUpdate { .. })).await;

    // A later member of the west instance sees the relayed history and reactions.
    let (_, mut carol_rx) = join(&west, "carol").await;
    match wait_for(&mut carol_rx, |e| matches!(e, ServerEvent::RoomJoined { .. })).await {
        ServerEvent::RoomJoined {
            history,
            reactions,
            tube,
            ..
        } => {
            let texts: Vec<_> = history.iter().map(|m| m.text.as_str()).collect();
            assert_eq!(texts, vec!["hello from east"]);
            assert_eq!(reactions[&message_id]["👍"].count, 1);
            assert_eq!(tube.state.video_id.as_deref(), Some("abc123"));
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn own_events_are_not_replayed() {
    let store = SharedStateStore::memory();
    let east = instance(&store, "east").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (ann, mut ann_rx) = join(&east, "ann").await;
    east.handle(
        &ann,
        ClientCommand::Room(RoomCommand::ChatMessage { text: "once".into() }),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut chats = 0;
    while let Ok(event) = ann_rx.try_recv() {
        if matches!(event, ServerEvent::ChatMessage(_)) {
            chats += 1;
        }
    }
    assert_eq!(chats, 1);
}
