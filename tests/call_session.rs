mod common;

use common::*;
use peer_call::status::format_elapsed;
use peer_call::{
    CallError, CallState, ChannelStatus, ClientError, ClientEvent, Config, EndReason, MediaError,
    MediaKind, MemoryStorage, Notice, SignalError, Snapshot, Storage, ValidationError,
    VirtualDevices,
};
use std::time::Duration;
use tokio::time::Instant;

fn state_is(state: CallState) -> impl FnMut(&ClientEvent) -> Option<Snapshot> {
    move |e| match e {
        ClientEvent::StateChanged(s) if s.state == state => Some(s.clone()),
        _ => None,
    }
}

fn notice(e: &ClientEvent) -> Option<Notice> {
    match e {
        ClientEvent::Notice(n) => Some(n.clone()),
        _ => None,
    }
}

fn no_preview() -> Config {
    Config {
        acquire_on_connect: false,
        ..Default::default()
    }
}

#[tokio::test]
async fn login_then_logout_restores_logged_out_state() {
    let mut h = Harness::login(Config::default(), "me@example.com").await;
    let snapshot = h.client.snapshot().await.unwrap();
    assert_eq!(snapshot.identity, Some(id("me@example.com")));
    assert_eq!(snapshot.channel, ChannelStatus::Connected);
    assert_eq!(
        h.storage.get("peer_call.identity").unwrap().as_deref(),
        Some("me@example.com")
    );

    h.client.logout().await.unwrap();
    h.until(|e| matches!(e, ClientEvent::LoggedOut).then_some(()))
        .await;
    let snapshot = h.client.snapshot().await.unwrap();
    assert_eq!(snapshot.identity, None);
    assert_eq!(snapshot.channel, ChannelStatus::Offline);
    assert_eq!(snapshot.state, CallState::Idle);
    assert_eq!(h.storage.get("peer_call.identity").unwrap(), None);
    assert_eq!(h.transport.destroys(), 1);
    assert_eq!(h.client.logout().await, Err(ClientError::NotLoggedIn));
}

#[tokio::test]
async fn invalid_identifiers_never_reach_the_transport() {
    let h = Harness::start(Config::default());
    assert_eq!(
        h.client.login("   ").await,
        Err(ClientError::Validation(ValidationError::Empty))
    );
    assert_eq!(
        h.client.login("bob").await,
        Err(ClientError::Validation(ValidationError::Malformed))
    );
    assert_eq!(h.transport.connects(), 0);
    assert_eq!(
        h.client.call("bob@example.com", MediaKind::Audio).await,
        Err(ClientError::NotLoggedIn)
    );
}

#[tokio::test]
async fn saved_identity_logs_in_on_start() {
    let mut storage = MemoryStorage::new();
    storage
        .set("peer_call.identity", "saved@example.com")
        .unwrap();
    let mut h = Harness::start_with(Config::default(), storage, VirtualDevices::new());
    let me = h
        .until(|e| match e {
            ClientEvent::LoggedIn(id) => Some(id.clone()),
            _ => None,
        })
        .await;
    assert_eq!(me, id("saved@example.com"));
    assert_eq!(
        h.client.login("other@example.com").await,
        Err(ClientError::AlreadyLoggedIn(id("saved@example.com")))
    );
}

#[tokio::test(start_paused = true)]
async fn unanswered_inbound_call_is_missed_after_thirty_seconds() {
    let mut h = Harness::login(Config::default(), "me@example.com").await;
    let started = Instant::now();
    let call = h.transport.offer("bob@example.com", MediaKind::Video);

    let (from, kind) = h
        .until(|e| match e {
            ClientEvent::IncomingCall { from, kind } => Some((from.clone(), *kind)),
            _ => None,
        })
        .await;
    assert_eq!(from, id("bob@example.com"));
    assert_eq!(kind, MediaKind::Video);
    let ringing = h.until(state_is(CallState::RingingInbound)).await;
    assert_eq!(ringing.remote, Some(id("bob@example.com")));

    let ended = h.until(state_is(CallState::Ended)).await;
    assert_eq!(ended.end_reason, Some(EndReason::Missed));
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(30), "{:?}", waited);
    assert!(waited < Duration::from_secs(31), "{:?}", waited);

    h.until(state_is(CallState::Idle)).await;
    assert_eq!(
        h.until(notice).await,
        Notice::MissedCall {
            from: id("bob@example.com")
        }
    );
    assert_eq!(h.transport.closes(call), 1);
    assert!(!h.transport.answered(call));
}

#[tokio::test(start_paused = true)]
async fn outgoing_call_goes_active_and_counts_seconds() {
    let mut h = Harness::login(Config::default(), "me@example.com").await;
    h.client
        .call("alice@example.com", MediaKind::Audio)
        .await
        .unwrap();
    let dialing = h.until(state_is(CallState::Dialing)).await;
    assert_eq!(dialing.remote, Some(id("alice@example.com")));
    let (call, remote, kind) = h.transport.placed().remove(0);
    assert_eq!((remote, kind), (id("alice@example.com"), MediaKind::Audio));
    assert_eq!(
        h.client.contacts().await.unwrap(),
        vec![id("alice@example.com")]
    );

    h.transport.remote_stream(call);
    let tracks = h
        .until(|e| match e {
            ClientEvent::RemoteMediaAttached(tracks) => Some(tracks.len()),
            _ => None,
        })
        .await;
    assert_eq!(tracks, 2);
    h.until(state_is(CallState::Active)).await;

    let mut readings = vec![];
    while readings.len() < 6 {
        let elapsed = h
            .until(|e| match e {
                ClientEvent::Elapsed(d) => Some(*d),
                _ => None,
            })
            .await;
        readings.push(format_elapsed(elapsed));
    }
    assert_eq!(
        readings,
        ["00:00", "00:01", "00:02", "00:03", "00:04", "00:05"]
    );

    h.client.hang_up().await.unwrap();
    h.until(state_is(CallState::Ending)).await;
    h.until(|e| matches!(e, ClientEvent::RemoteMediaDetached).then_some(()))
        .await;
    let ended = h.until(state_is(CallState::Ended)).await;
    assert_eq!(ended.end_reason, Some(EndReason::HungUp));
    h.until(state_is(CallState::Idle)).await;
    assert_eq!(h.transport.closes(call), 1);
}

#[tokio::test]
async fn second_inbound_offer_is_rejected_while_ringing() {
    let mut h = Harness::login(Config::default(), "me@example.com").await;
    let bob = h.transport.offer("bob@example.com", MediaKind::Video);
    h.until(state_is(CallState::RingingInbound)).await;

    let carol = h.transport.offer("carol@example.com", MediaKind::Audio);
    assert_eq!(
        h.until(notice).await,
        Notice::AutoRejected {
            from: id("carol@example.com")
        }
    );
    assert_eq!(h.transport.closes(carol), 1);
    assert_eq!(h.transport.closes(bob), 0);

    let snapshot = h.client.snapshot().await.unwrap();
    assert_eq!(snapshot.state, CallState::RingingInbound);
    assert_eq!(snapshot.remote, Some(id("bob@example.com")));
}

#[tokio::test]
async fn offer_is_rejected_during_an_active_call() {
    let mut h = Harness::login(Config::default(), "me@example.com").await;
    h.client
        .call("alice@example.com", MediaKind::Video)
        .await
        .unwrap();
    h.until(state_is(CallState::Dialing)).await;
    h.transport.remote_stream(h.transport.last_placed());
    h.until(state_is(CallState::Active)).await;

    let carol = h.transport.offer("carol@example.com", MediaKind::Audio);
    assert_eq!(
        h.until(notice).await,
        Notice::AutoRejected {
            from: id("carol@example.com")
        }
    );
    assert_eq!(h.transport.closes(carol), 1);
    assert_eq!(
        h.client.snapshot().await.unwrap().state,
        CallState::Active
    );
}

#[tokio::test]
async fn permission_denied_leaves_the_client_idle() {
    let mut h = Harness::start(no_preview());
    h.devices.fail_with(Some(MediaError::PermissionDenied));
    h.client.login("me@example.com").await.unwrap();
    h.until(|e| matches!(e, ClientEvent::Channel(ChannelStatus::Connected)).then_some(()))
        .await;

    h.client
        .call("alice@example.com", MediaKind::Video)
        .await
        .unwrap();
    assert_eq!(
        h.until(notice).await,
        Notice::MediaUnavailable(MediaError::PermissionDenied)
    );
    assert_eq!(h.client.snapshot().await.unwrap().state, CallState::Idle);
    assert!(h.transport.placed().is_empty());
    assert_eq!(h.devices.acquisitions(), 1);
}

#[tokio::test]
async fn media_is_acquired_before_the_first_call() {
    let mut h = Harness::start(no_preview());
    h.client.login("me@example.com").await.unwrap();
    h.until(|e| matches!(e, ClientEvent::Channel(ChannelStatus::Connected)).then_some(()))
        .await;
    assert_eq!(h.devices.acquisitions(), 0);

    h.client
        .call("alice@example.com", MediaKind::Audio)
        .await
        .unwrap();
    h.until(state_is(CallState::Dialing)).await;
    assert_eq!(h.devices.acquisitions(), 1);
    assert_eq!(h.transport.placed().len(), 1);
}

#[tokio::test]
async fn hang_up_when_idle_does_nothing() {
    let mut h = Harness::login(Config::default(), "me@example.com").await;
    let before = h.client.snapshot().await.unwrap();
    h.drain();

    h.client.hang_up().await.unwrap();
    h.client.hang_up().await.unwrap();
    assert_eq!(h.client.snapshot().await.unwrap(), before);
    assert!(h.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn media_arriving_after_hang_up_does_not_start_the_call() {
    let mut h = Harness::start(no_preview());
    h.devices.set_delay(Duration::from_secs(2));
    h.client.login("me@example.com").await.unwrap();
    h.until(|e| matches!(e, ClientEvent::Channel(ChannelStatus::Connected)).then_some(()))
        .await;

    h.client
        .call("alice@example.com", MediaKind::Audio)
        .await
        .unwrap();
    h.client.hang_up().await.unwrap();

    // the bundle is kept for later calls, but no call is placed
    h.until(|e| matches!(e, ClientEvent::MediaState { audio: true, .. }).then_some(()))
        .await;
    assert_eq!(h.client.snapshot().await.unwrap().state, CallState::Idle);
    assert!(h.transport.placed().is_empty());
}

#[tokio::test]
async fn accepted_call_ends_when_the_remote_closes() {
    let mut h = Harness::login(Config::default(), "me@example.com").await;
    let call = h.transport.offer("bob@example.com", MediaKind::Audio);
    h.until(state_is(CallState::RingingInbound)).await;

    h.client.accept_inbound().await.unwrap();
    h.until(state_is(CallState::Connecting)).await;
    assert!(h.transport.answered(call));
    assert_eq!(
        h.client.accept_inbound().await,
        Err(ClientError::NoIncomingCall)
    );

    h.transport.remote_stream(call);
    h.until(state_is(CallState::Active)).await;
    h.transport.remote_close(call);
    let ended = h.until(state_is(CallState::Ended)).await;
    assert_eq!(ended.end_reason, Some(EndReason::RemoteClosed));
    h.until(state_is(CallState::Idle)).await;
    assert_eq!(
        h.client.contacts().await.unwrap(),
        vec![id("bob@example.com")]
    );
}

#[tokio::test]
async fn rejecting_closes_the_offer() {
    let mut h = Harness::login(Config::default(), "me@example.com").await;
    let call = h.transport.offer("bob@example.com", MediaKind::Video);
    h.until(state_is(CallState::RingingInbound)).await;

    h.client.reject_inbound().await.unwrap();
    let ended = h.until(state_is(CallState::Ended)).await;
    assert_eq!(ended.end_reason, Some(EndReason::Rejected));
    h.until(state_is(CallState::Idle)).await;
    assert_eq!(h.transport.closes(call), 1);
    assert!(h.client.contacts().await.unwrap().is_empty());
    assert_eq!(
        h.client.reject_inbound().await,
        Err(ClientError::NoIncomingCall)
    );
}

#[tokio::test]
async fn caller_cancelling_while_ringing_is_a_missed_call() {
    let mut h = Harness::login(Config::default(), "me@example.com").await;
    let call = h.transport.offer("bob@example.com", MediaKind::Video);
    h.until(state_is(CallState::RingingInbound)).await;

    h.transport.remote_close(call);
    assert_eq!(
        h.until(notice).await,
        Notice::MissedCall {
            from: id("bob@example.com")
        }
    );
    assert_eq!(h.client.snapshot().await.unwrap().state, CallState::Idle);
}

#[tokio::test]
async fn accept_without_media_rejects_when_acquisition_fails() {
    let mut h = Harness::start(no_preview());
    h.devices.fail_with(Some(MediaError::DeviceBusy));
    h.client.login("me@example.com").await.unwrap();
    h.until(|e| matches!(e, ClientEvent::Channel(ChannelStatus::Connected)).then_some(()))
        .await;
    let call = h.transport.offer("bob@example.com", MediaKind::Video);
    h.until(state_is(CallState::RingingInbound)).await;

    h.client.accept_inbound().await.unwrap();
    assert_eq!(
        h.until(notice).await,
        Notice::MediaUnavailable(MediaError::DeviceBusy)
    );
    let ended = h.until(state_is(CallState::Ended)).await;
    assert_eq!(ended.end_reason, Some(EndReason::Rejected));
    assert_eq!(h.transport.closes(call), 1);
    assert!(!h.transport.answered(call));
}

fn missed(events: &[ClientEvent]) -> bool {
    events
        .iter()
        .any(|e| matches!(e, ClientEvent::Notice(Notice::MissedCall { .. })))
}

#[tokio::test(start_paused = true)]
async fn accepted_call_outlives_the_ring_timeout() {
    let mut h = Harness::login(Config::default(), "me@example.com").await;
    let call = h.transport.offer("bob@example.com", MediaKind::Video);
    h.until(state_is(CallState::RingingInbound)).await;
    h.client.accept_inbound().await.unwrap();
    h.until(state_is(CallState::Connecting)).await;

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(!missed(&h.drain()));
    assert_eq!(h.client.snapshot().await.unwrap().state, CallState::Connecting);
    assert_eq!(h.transport.closes(call), 0);
}

#[tokio::test(start_paused = true)]
async fn accepting_while_media_is_pending_is_never_missed() {
    let mut h = Harness::start(no_preview());
    h.devices.set_delay(Duration::from_secs(25));
    h.client.login("me@example.com").await.unwrap();
    h.until(|e| matches!(e, ClientEvent::Channel(ChannelStatus::Connected)).then_some(()))
        .await;
    let call = h.transport.offer("bob@example.com", MediaKind::Video);
    h.until(state_is(CallState::RingingInbound)).await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    h.client.accept_inbound().await.unwrap();
    // past the ring timeout, media still on its way
    tokio::time::sleep(Duration::from_secs(21)).await;
    assert!(!missed(&h.drain()));
    assert_eq!(
        h.client.snapshot().await.unwrap().state,
        CallState::RingingInbound
    );

    h.until(state_is(CallState::Connecting)).await;
    assert!(h.transport.answered(call));
    assert!(!missed(&h.drain()));
}

#[tokio::test(start_paused = true)]
async fn caller_closing_while_media_is_pending_is_not_a_missed_call() {
    let mut h = Harness::start(no_preview());
    h.devices.set_delay(Duration::from_secs(5));
    h.client.login("me@example.com").await.unwrap();
    h.until(|e| matches!(e, ClientEvent::Channel(ChannelStatus::Connected)).then_some(()))
        .await;
    let call = h.transport.offer("bob@example.com", MediaKind::Audio);
    h.until(state_is(CallState::RingingInbound)).await;

    h.client.accept_inbound().await.unwrap();
    h.transport.remote_close(call);
    let ended = h.until(state_is(CallState::Ended)).await;
    assert_eq!(ended.end_reason, Some(EndReason::RemoteClosed));
    h.until(state_is(CallState::Idle)).await;

    // the bundle still arrives and is kept, but nothing is answered
    h.until(|e| matches!(e, ClientEvent::MediaState { audio: true, .. }).then_some(()))
        .await;
    assert!(!h.transport.answered(call));
    assert!(!missed(&h.drain()));
}

#[tokio::test]
async fn connecting_call_ends_when_the_remote_closes() {
    let mut h = Harness::login(Config::default(), "me@example.com").await;
    let call = h.transport.offer("bob@example.com", MediaKind::Audio);
    h.until(state_is(CallState::RingingInbound)).await;
    h.client.accept_inbound().await.unwrap();
    h.until(state_is(CallState::Connecting)).await;

    h.transport.remote_close(call);
    let ended = h.until(state_is(CallState::Ended)).await;
    assert_eq!(ended.end_reason, Some(EndReason::RemoteClosed));
    assert_eq!(ended.remote, Some(id("bob@example.com")));
    h.until(state_is(CallState::Idle)).await;
    assert!(!missed(&h.drain()));
}

#[tokio::test(start_paused = true)]
async fn call_waiting_for_media_is_not_replaced_or_dropped_silently() {
    let mut h = Harness::start(no_preview());
    h.devices.set_delay(Duration::from_secs(2));
    h.client.login("me@example.com").await.unwrap();
    h.until(|e| matches!(e, ClientEvent::Channel(ChannelStatus::Connected)).then_some(()))
        .await;

    h.client
        .call("alice@example.com", MediaKind::Audio)
        .await
        .unwrap();
    assert_eq!(
        h.client.call("carol@example.com", MediaKind::Audio).await,
        Err(ClientError::CallInProgress(id("alice@example.com")))
    );

    // an offer arriving first takes precedence; the caller is told
    h.transport.offer("bob@example.com", MediaKind::Video);
    h.until(state_is(CallState::RingingInbound)).await;
    assert_eq!(
        h.until(notice).await,
        Notice::CallAbandoned {
            to: id("alice@example.com")
        }
    );
    assert!(h.transport.placed().is_empty());
    assert_eq!(
        h.client.snapshot().await.unwrap().state,
        CallState::RingingInbound
    );
}

#[tokio::test]
async fn call_preconditions() {
    let mut h = Harness::login(Config::default(), "me@example.com").await;
    assert_eq!(
        h.client.call(" me@example.com ", MediaKind::Audio).await,
        Err(ClientError::Validation(ValidationError::SelfCall))
    );
    assert_eq!(
        h.client.call("not-an-email", MediaKind::Audio).await,
        Err(ClientError::Validation(ValidationError::Malformed))
    );

    h.client
        .call("alice@example.com", MediaKind::Audio)
        .await
        .unwrap();
    h.until(state_is(CallState::Dialing)).await;
    assert_eq!(
        h.client.call("bob@example.com", MediaKind::Audio).await,
        Err(ClientError::CallInProgress(id("alice@example.com")))
    );
}

#[tokio::test]
async fn unknown_peer_is_reported() {
    let mut h = Harness::login(Config::default(), "me@example.com").await;
    h.transport.set_unavailable("ghost@example.com");
    h.client
        .call("ghost@example.com", MediaKind::Video)
        .await
        .unwrap();
    assert_eq!(
        h.until(notice).await,
        Notice::CallFailed(CallError::PeerUnavailable(id("ghost@example.com")))
    );
    assert_eq!(h.client.snapshot().await.unwrap().state, CallState::Idle);
}

#[tokio::test]
async fn negotiation_error_ends_the_call() {
    let mut h = Harness::login(Config::default(), "me@example.com").await;
    h.client
        .call("alice@example.com", MediaKind::Audio)
        .await
        .unwrap();
    h.until(state_is(CallState::Dialing)).await;
    h.transport
        .remote_error(h.transport.last_placed(), "ice failed");
    let ended = h.until(state_is(CallState::Ended)).await;
    assert_eq!(ended.end_reason, Some(EndReason::Failed));
    assert_eq!(
        h.until(notice).await,
        Notice::CallFailed(CallError::Negotiation("ice failed".into()))
    );
}

#[tokio::test]
async fn identity_in_use_logs_out_and_forgets_it() {
    let mut h = Harness::start(Config::default());
    h.transport.refuse_with(Some(SignalError::IdInUse));
    h.client.login("me@example.com").await.unwrap();

    assert_eq!(h.until(notice).await, Notice::Signal(SignalError::IdInUse));
    h.until(|e| matches!(e, ClientEvent::LoggedOut).then_some(()))
        .await;
    assert_eq!(h.storage.get("peer_call.identity").unwrap(), None);
    assert_eq!(h.client.snapshot().await.unwrap().identity, None);
    assert_eq!(h.transport.destroys(), 1);
}

#[tokio::test(start_paused = true)]
async fn dropped_channel_reconnects_after_five_seconds() {
    let mut h = Harness::login(Config::default(), "me@example.com").await;
    h.transport.drop_connection();
    h.until(|e| matches!(e, ClientEvent::Channel(ChannelStatus::Disconnected)).then_some(()))
        .await;
    let dropped = Instant::now();

    h.until(|e| matches!(e, ClientEvent::Channel(ChannelStatus::Reconnecting)).then_some(()))
        .await;
    assert!(dropped.elapsed() >= Duration::from_secs(5));
    h.until(|e| matches!(e, ClientEvent::Channel(ChannelStatus::Connected)).then_some(()))
        .await;
    assert_eq!(h.transport.reconnects(), 1);
    // media survives the reconnect
    assert_eq!(h.devices.acquisitions(), 1);
}

#[tokio::test(start_paused = true)]
async fn logout_cancels_a_pending_reconnect() {
    let mut h = Harness::login(Config::default(), "me@example.com").await;
    h.transport.drop_connection();
    h.until(|e| matches!(e, ClientEvent::Channel(ChannelStatus::Disconnected)).then_some(()))
        .await;
    h.client.logout().await.unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.transport.reconnects(), 0);
}

#[tokio::test]
async fn logout_during_a_call_closes_it() {
    let mut h = Harness::login(Config::default(), "me@example.com").await;
    h.client
        .call("alice@example.com", MediaKind::Video)
        .await
        .unwrap();
    h.until(state_is(CallState::Dialing)).await;
    let call = h.transport.last_placed();

    h.client.logout().await.unwrap();
    h.until(state_is(CallState::Ended)).await;
    h.until(|e| matches!(e, ClientEvent::LoggedOut).then_some(()))
        .await;
    assert_eq!(h.transport.closes(call), 1);
    assert_eq!(h.client.snapshot().await.unwrap().state, CallState::Idle);
}

#[tokio::test]
async fn toggles_report_the_resulting_state() {
    let mut h = Harness::login(Config::default(), "me@example.com").await;
    assert_eq!(h.client.toggle_audio().await, Ok(false));
    assert_eq!(
        h.until(|e| match e {
            ClientEvent::MediaState { audio, video } => Some((*audio, *video)),
            _ => None,
        })
        .await,
        (false, true)
    );
    assert_eq!(h.client.toggle_video().await, Ok(false));
    assert_eq!(h.client.toggle_audio().await, Ok(true));
}

#[tokio::test]
async fn toggling_a_missing_camera_stays_off() {
    let mut h = Harness::start_with(
        Config::default(),
        MemoryStorage::new(),
        VirtualDevices::microphone_only(),
    );
    h.client.login("me@example.com").await.unwrap();
    h.until(|e| matches!(e, ClientEvent::MediaState { audio: true, .. }).then_some(()))
        .await;
    assert_eq!(h.client.toggle_video().await, Ok(false));
    assert_eq!(h.client.toggle_video().await, Ok(false));
}

#[tokio::test]
async fn shutdown_keeps_the_saved_identity() {
    let h = Harness::login(Config::default(), "me@example.com").await;
    h.client.shutdown().await.unwrap();
    assert_eq!(
        h.storage.get("peer_call.identity").unwrap().as_deref(),
        Some("me@example.com")
    );
    assert_eq!(h.client.snapshot().await, Err(ClientError::Shutdown));
}
