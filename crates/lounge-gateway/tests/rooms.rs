use tokio::sync::mpsc::UnboundedReceiver;

use lounge_gateway::coordinator::RoomCoordinator;
use lounge_gateway::dispatcher::Dispatcher;
use lounge_gateway::irc::{AdmissionGovernor, IrcBridgeManager};
use lounge_store::SharedStateStore;
use lounge_types::events::{
    ClientCommand, ModerationEvent, ReactionEvent, RoomCommand, ServerEvent, TubeEvent,
};
use lounge_types::models::{ChatMessage, Role, User};

type Events = UnboundedReceiver<ServerEvent>;

fn coordinator() -> RoomCoordinator {
    let dispatcher = Dispatcher::new(SharedStateStore::memory(), "test");
    let irc = IrcBridgeManager::new(None, dispatcher.clone(), AdmissionGovernor::spawn());
    RoomCoordinator::new(dispatcher, irc)
}

fn moderator(name: &str) -> User {
    let mut user = User::guest(name);
    user.role = Role::Moderator;
    user
}

fn drain(rx: &mut Events) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn chats(events: &[ServerEvent]) -> Vec<&ChatMessage> {
    events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::ChatMessage(m) => Some(m),
            _ => None,
        })
        .collect()
}

async fn join_as(coordinator: &RoomCoordinator, room: &str, user: User, previous: Option<&str>) -> (String, Events) {
    let (socket_id, rx) = coordinator.connect().await;
    coordinator
        .handle(
            &socket_id,
            ClientCommand::Room(RoomCommand::JoinRoom {
                room_id: room.into(),
                user,
                previous_socket_id: previous.map(String::from),
            }),
        )
        .await;
    (socket_id, rx)
}

async fn join(coordinator: &RoomCoordinator, user: User) -> (String, Events) {
    join_as(coordinator, "general", user, None).await
}

async fn say(coordinator: &RoomCoordinator, socket_id: &str, text: &str) {
    coordinator
        .handle(
            socket_id,
            ClientCommand::Room(RoomCommand::ChatMessage { text: text.into() }),
        )
        .await;
}

fn history_of(events: &[ServerEvent]) -> Vec<String> {
    events
        .iter()
        .find_map(|e| match e {
            ServerEvent::RoomJoined { history, .. } => {
                Some(history.iter().map(|m| m.text.clone()).collect())
            }
            _ => None,
        })
        .expect("no room-joined event")
}

#[tokio::test]
async fn join_announces_to_others_only() {
    let c = coordinator();
    let (ann, mut ann_rx) = join(&c, User::guest("ann")).await;
    let (bob, mut bob_rx) = join(&c, User::guest("bob")).await;

    let ann_events = drain(&mut ann_rx);
    assert!(matches!(ann_events[0], ServerEvent::RoomJoined { .. }));
    assert!(ann_events.iter().any(|e| matches!(
        e,
        ServerEvent::UserJoined { socket_id, .. } if *socket_id == bob
    )));

    let bob_events = drain(&mut bob_rx);
    match &bob_events[0] {
        ServerEvent::RoomJoined { users, socket_id, .. } => {
            assert_eq!(*socket_id, bob);
            assert_eq!(users.len(), 2);
            assert!(users.iter().any(|p| p.socket_id == ann));
        }
        other => panic!("unexpected first event: {:?}", other),
    }
    assert!(!bob_events.iter().any(|e| matches!(e, ServerEvent::UserJoined { .. })));

    c.disconnect(&bob).await;
    assert!(drain(&mut ann_rx).iter().any(|e| matches!(
        e,
        ServerEvent::UserLeft { socket_id } if *socket_id == bob
    )));
}

#[tokio::test]
async fn join_requires_room_and_name() {
    let c = coordinator();
    let (_, mut rx) = join(&c, User::guest("   ")).await;
    assert_eq!(
        drain(&mut rx),
        vec![ServerEvent::Error {
            message: "room and name are required".into()
        }]
    );
}

#[tokio::test]
async fn chat_before_join_is_refused() {
    let c = coordinator();
    let (socket_id, mut rx) = c.connect().await;
    say(&c, &socket_id, "hello?").await;
    assert!(matches!(drain(&mut rx)[..], [ServerEvent::Error { .. }]));
}

#[tokio::test]
async fn shadow_muted_messages_reach_moderators_and_author_only() {
    let c = coordinator();
    let (moderator_id, mut mod_rx) = join(&c, moderator("mod")).await;
    let (troll, mut troll_rx) = join(&c, User::guest("troll")).await;
    let (_, mut bystander_rx) = join(&c, User::guest("bystander")).await;
    drain(&mut mod_rx);
    drain(&mut troll_rx);
    drain(&mut bystander_rx);

    c.handle(
        &moderator_id,
        ClientCommand::Moderation(ModerationEvent::ShadowMute {
            target_user_id: None,
            target_user_name: "troll".into(),
            mute: true,
        }),
    )
    .await;
    assert_eq!(
        drain(&mut mod_rx),
        vec![ServerEvent::ModActionResult {
            action: "shadow-mute".into(),
            ok: true,
            error: None,
        }]
    );

    say(&c, &troll, "buy my stuff").await;
    assert_eq!(chats(&drain(&mut troll_rx)).len(), 1);
    assert_eq!(chats(&drain(&mut mod_rx)).len(), 1);
    assert!(drain(&mut bystander_rx).is_empty());

    // History replay applies the same rule.
    let (_, mut late_rx) = join(&c, User::guest("late")).await;
    assert!(history_of(&drain(&mut late_rx)).is_empty());
    let (_, mut late_mod_rx) = join(&c, moderator("mod2")).await;
    assert_eq!(history_of(&drain(&mut late_mod_rx)), vec!["buy my stuff"]);
}

#[tokio::test]
async fn moderation_requires_a_moderator() {
    let c = coordinator();
    let (guest, mut guest_rx) = join(&c, User::guest("guest")).await;
    drain(&mut guest_rx);

    c.handle(
        &guest,
        ClientCommand::Moderation(ModerationEvent::ShadowMute {
            target_user_id: None,
            target_user_name: "someone".into(),
            mute: true,
        }),
    )
    .await;
    assert_eq!(
        drain(&mut guest_rx),
        vec![ServerEvent::ModActionResult {
            action: "shadow-mute".into(),
            ok: false,
            error: Some("only moderators can do that".into()),
        }]
    );
}

#[tokio::test]
async fn wiped_messages_disappear_from_history() {
    let c = coordinator();
    let (moderator_id, mut mod_rx) = join(&c, moderator("mod")).await;
    let (ann, mut ann_rx) = join(&c, User::guest("ann")).await;
    let (bob, mut bob_rx) = join(&c, User::guest("bob")).await;

    say(&c, &ann, "one").await;
    say(&c, &bob, "two").await;
    say(&c, &ann, "three").await;
    let ann_ids: Vec<String> = chats(&drain(&mut bob_rx))
        .into_iter()
        .filter(|m| m.sender == "ann")
        .map(|m| m.id.clone())
        .collect();
    drain(&mut mod_rx);
    drain(&mut ann_rx);

    c.handle(
        &moderator_id,
        ClientCommand::Moderation(ModerationEvent::WipeMessages {
            target_user_id: None,
            target_user_name: "ann".into(),
        }),
    )
    .await;

    let wiped = drain(&mut bob_rx);
    assert_eq!(
        wiped,
        vec![ServerEvent::ModMessagesWiped {
            target_user_id: None,
            message_ids: ann_ids,
        }]
    );

    let (_, mut late_rx) = join(&c, User::guest("late")).await;
    assert_eq!(history_of(&drain(&mut late_rx)), vec!["two"]);
    let (_, mut late_mod_rx) = join(&c, moderator("mod2")).await;
    assert_eq!(history_of(&drain(&mut late_mod_rx)).len(), 3);
}

#[tokio::test]
async fn reactions_broadcast_the_full_map() {
    let c = coordinator();
    let (ann, mut ann_rx) = join(&c, User::guest("ann")).await;
    let (bob, mut bob_rx) = join(&c, User::guest("bob")).await;
    drain(&mut ann_rx);

    say(&c, &ann, "hi").await;
    let message_id = chats(&drain(&mut bob_rx))[0].id.clone();
    drain(&mut ann_rx);

    let react = |emoji: &str| {
        ClientCommand::Reaction(ReactionEvent::React {
            message_id: message_id.clone(),
            emoji: emoji.into(),
        })
    };
    c.handle(&ann, react("🔥")).await;
    c.handle(&bob, react("🔥")).await;
    // Reacting twice counts once.
    c.handle(&bob, react("🔥")).await;

    let last = drain(&mut ann_rx).pop().expect("no reaction update");
    match last {
        ServerEvent::MessageReactionsUpdate { message_id: id, reactions } => {
            assert_eq!(id, message_id);
            let fire = &reactions["🔥"];
            assert_eq!(fire.count, 2);
            assert!(fire.reactors.contains("ann") && fire.reactors.contains("bob"));
        }
        other => panic!("unexpected event: {:?}", other),
    }

    c.handle(
        &bob,
        ClientCommand::Reaction(ReactionEvent::Unreact {
            message_id: message_id.clone(),
            emoji: "🔥".into(),
        }),
    )
    .await;
    match drain(&mut bob_rx).pop() {
        Some(ServerEvent::MessageReactionsUpdate { reactions, .. }) => {
            assert_eq!(reactions["🔥"].count, 1);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    c.handle(
        &bob,
        ClientCommand::Reaction(ReactionEvent::React {
            message_id: "nope".into(),
            emoji: "🔥".into(),
        }),
    )
    .await;
    assert_eq!(
        drain(&mut bob_rx),
        vec![ServerEvent::Error {
            message: "unknown message".into()
        }]
    );

    // A fresh connection gets the current maps along with the history.
    let (_, mut late_rx) = join(&c, User::guest("late")).await;
    match &drain(&mut late_rx)[0] {
        ServerEvent::RoomJoined { history, reactions, .. } => {
            assert_eq!(history.len(), 1);
            assert_eq!(reactions.len(), 1);
            let fire = &reactions[&message_id]["🔥"];
            assert_eq!(fire.count, 1);
            assert!(fire.reactors.contains("ann"));
        }
        other => panic!("unexpected first event: {:?}", other),
    }
}

fn tube_states(events: &[ServerEvent]) -> Vec<&lounge_types::models::TubeSnapshot> {
    events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::TubeState(s) => Some(s),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn tube_follows_its_owner() {
    let c = coordinator();
    let (owner, mut owner_rx) = join(&c, User::guest("owner")).await;
    let (follower, mut follower_rx) = join(&c, User::guest("follower")).await;
    drain(&mut owner_rx);
    drain(&mut follower_rx);

    c.handle(
        &owner,
        ClientCommand::Tube(TubeEvent::Load {
            video_id: Some("abc123".into()),
            title: None,
        }),
    )
    .await;
    let loaded = drain(&mut follower_rx);
    let state = &tube_states(&loaded)[0].state;
    assert_eq!(state.video_id.as_deref(), Some("abc123"));
    assert!(!state.is_playing);
    assert_eq!(state.timestamp, 0.0);
    assert_eq!(state.owner_id.as_deref(), Some(owner.as_str()));
    drain(&mut owner_rx);

    // A follower's play only resyncs the follower.
    c.handle(&follower, ClientCommand::Tube(TubeEvent::Play { timestamp: Some(30.0) }))
        .await;
    let resync = drain(&mut follower_rx);
    assert!(!tube_states(&resync)[0].state.is_playing);
    assert!(drain(&mut owner_rx).is_empty());

    c.handle(&owner, ClientCommand::Tube(TubeEvent::Play { timestamp: Some(0.0) }))
        .await;
    assert!(tube_states(&drain(&mut follower_rx))[0].state.is_playing);

    let (_, mut late_rx) = join(&c, User::guest("late")).await;
    match &drain(&mut late_rx)[0] {
        ServerEvent::RoomJoined { tube, .. } => {
            assert_eq!(tube.state.video_id.as_deref(), Some("abc123"));
            assert!(tube.state.is_playing);
        }
        other => panic!("unexpected first event: {:?}", other),
    }
    assert!(c.tube().peek("general").await.is_some());
}

#[tokio::test]
async fn reconnect_restores_identity_and_tube_ownership() {
    let c = coordinator();
    let (owner, mut owner_rx) = join(&c, User::guest("ann")).await;
    let (_, mut bob_rx) = join(&c, User::guest("bob")).await;
    c.handle(
        &owner,
        ClientCommand::Tube(TubeEvent::Load {
            video_id: Some("abc123".into()),
            title: None,
        }),
    )
    .await;
    drain(&mut owner_rx);
    drain(&mut bob_rx);

    c.disconnect(&owner).await;
    let left = drain(&mut bob_rx);
    assert!(left.iter().any(|e| matches!(e, ServerEvent::UserLeft { socket_id } if *socket_id == owner)));
    assert_eq!(tube_states(&left)[0].state.owner_id, None);

    let (resumed, mut resumed_rx) =
        join_as(&c, "general", User::guest("someone else"), Some(owner.as_str())).await;
    match drain(&mut resumed_rx).into_iter().find(|e| matches!(e, ServerEvent::RoomJoined { .. })) {
        Some(ServerEvent::RoomJoined { tube, .. }) => {
            assert_eq!(tube.state.owner_id.as_deref(), Some(resumed.as_str()));
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(drain(&mut bob_rx).iter().any(|e| matches!(
        e,
        ServerEvent::UserJoined { user, .. } if user.name == "ann"
    )));
}

#[tokio::test]
async fn force_cam_down_bans_the_camera() {
    let c = coordinator();
    let (moderator_id, mut mod_rx) = join(&c, moderator("mod")).await;
    let mut cam_user = User::guest("cam");
    cam_user.video_enabled = true;
    let (cam, mut cam_rx) = join(&c, cam_user).await;
    drain(&mut mod_rx);
    drain(&mut cam_rx);

    c.handle(
        &moderator_id,
        ClientCommand::Moderation(ModerationEvent::ForceCamDown {
            target_socket_id: cam.clone(),
            ban_minutes: 5,
        }),
    )
    .await;

    let cam_events = drain(&mut cam_rx);
    assert!(cam_events.iter().any(|e| matches!(e, ServerEvent::ForceCamDown { ban_minutes: 5, .. })));
    assert!(cam_events.iter().any(|e| matches!(
        e,
        ServerEvent::UserUpdated { user, .. } if !user.video_enabled
    )));
    assert!(drain(&mut mod_rx).contains(&ServerEvent::ModActionResult {
        action: "force-cam-down".into(),
        ok: true,
        error: None,
    }));

    // Turning the camera back on is refused while the ban lasts.
    c.handle(
        &cam,
        ClientCommand::Room(RoomCommand::MediaState {
            video_enabled: true,
            audio_enabled: true,
        }),
    )
    .await;
    let retry = drain(&mut cam_rx);
    assert!(matches!(retry[0], ServerEvent::ForceCamDown { ban_minutes: 1..=5, .. }));
    assert!(retry.iter().any(|e| matches!(
        e,
        ServerEvent::UserUpdated { user, .. } if !user.video_enabled && user.audio_enabled
    )));

    // Targets must be in the moderator's room.
    drain(&mut mod_rx);
    c.handle(
        &moderator_id,
        ClientCommand::Moderation(ModerationEvent::ForceCamDown {
            target_socket_id: "nobody".into(),
            ban_minutes: 5,
        }),
    )
    .await;
    assert_eq!(
        drain(&mut mod_rx),
        vec![ServerEvent::ModActionResult {
            action: "force-cam-down".into(),
            ok: false,
            error: Some("no such user in this room".into()),
        }]
    );
}
