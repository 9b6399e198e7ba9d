use std::time::Duration;

use crx_bundler::reload::{
    BuildId, Coordinator, CoordinatorInput, CoordinatorState, Effect, ExecutionContext,
    ReloadMessage, UpdatePayload,
};
use pretty_assertions::assert_eq;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const PEER_TIMEOUT: Duration = Duration::from_millis(250);

fn worker() -> Coordinator {
    Coordinator::new(ExecutionContext::ServiceWorker, PEER_TIMEOUT)
}

fn content(tab_id: i64) -> Coordinator {
    Coordinator::new(
        ExecutionContext::ContentScript {
            tab_id,
            frame_id: 0,
        },
        PEER_TIMEOUT,
    )
}

fn msg(message: ReloadMessage) -> CoordinatorInput {
    CoordinatorInput::Message(message)
}

fn do_update(build_id: BuildId, requires_worker_resync: bool) -> CoordinatorInput {
    msg(ReloadMessage::do_update(
        build_id,
        UpdatePayload {
            changed: vec!["assets/content.js".into()],
            requires_worker_resync,
        },
    ))
}

/// The messages a server broadcasts when it opens cycle `build_id`.
fn cycle_start(build_id: BuildId, resync: bool) -> Vec<CoordinatorInput> {
    vec![
        msg(ReloadMessage::build_started(build_id)),
        do_update(build_id, resync),
    ]
}

/// The messages a server broadcasts once the worker acknowledged.
fn cycle_end(build_id: BuildId) -> Vec<CoordinatorInput> {
    vec![
        msg(ReloadMessage::done_update(build_id)),
        msg(ReloadMessage::build_complete(build_id)),
    ]
}

fn feed(c: &mut Coordinator, inputs: Vec<CoordinatorInput>) -> Vec<Effect> {
    inputs.into_iter().flat_map(|i| c.handle(i)).collect()
}

fn reinjections(effects: &[Effect]) -> usize {
    effects
        .iter()
        .filter(|e| matches!(e, Effect::Reinject { .. }))
        .count()
}

// ============================================================================
// Full Cycles
// ============================================================================

#[test]
fn worker_then_content_script_in_order() {
    let mut sw = worker();
    let mut cs = content(1);

    assert_eq!(
        feed(&mut sw, cycle_start(1, true)),
        vec![Effect::ReloadSelf { build_id: 1 }]
    );
    assert_eq!(
        feed(&mut cs, cycle_start(1, true)),
        vec![Effect::StartPeerTimer {
            build_id: 1,
            after: PEER_TIMEOUT
        }]
    );
    assert_eq!(cs.state(), &CoordinatorState::AwaitingPeer { build_id: 1 });

    // The fresh worker acknowledges.
    assert_eq!(
        sw.handle(CoordinatorInput::ReloadSucceeded),
        vec![Effect::Send(ReloadMessage::done_update(1))]
    );

    // The server relays; only now may the content script reload.
    assert!(feed(&mut sw, cycle_end(1)).is_empty());
    assert_eq!(
        feed(&mut cs, cycle_end(1)),
        vec![Effect::CancelPeerTimer, Effect::Reinject { build_id: 1 }]
    );
    assert!(cs.handle(CoordinatorInput::ReloadSucceeded).is_empty());

    assert_eq!(sw.state(), &CoordinatorState::Idle);
    assert_eq!(cs.state(), &CoordinatorState::Idle);
}

#[test]
fn build_complete_alone_does_not_release_a_waiting_script() {
    let mut cs = content(1);
    feed(&mut cs, cycle_start(1, true));

    assert!(cs
        .handle(msg(ReloadMessage::build_complete(1)))
        .is_empty());
    assert_eq!(cs.state(), &CoordinatorState::AwaitingPeer { build_id: 1 });
}

#[test]
fn done_update_and_build_complete_in_any_order() {
    for end in [
        cycle_end(1),
        cycle_end(1).into_iter().rev().collect::<Vec<_>>(),
    ] {
        let mut cs = content(1);
        feed(&mut cs, cycle_start(1, true));
        let effects = feed(&mut cs, end);
        assert_eq!(reinjections(&effects), 1);
        assert_eq!(cs.state(), &CoordinatorState::Reloading { build_id: 1 });
    }
}

#[test]
fn scripts_without_resync_reload_at_once() {
    let mut cs = content(1);
    assert_eq!(
        feed(&mut cs, cycle_start(3, false)),
        vec![Effect::Reinject { build_id: 3 }]
    );
    // A relayed ack for the same build does nothing more.
    assert_eq!(reinjections(&feed(&mut cs, cycle_end(3))), 0);
}

#[test]
fn repeated_do_update_is_absorbed() {
    let mut sw = worker();
    feed(&mut sw, cycle_start(1, true));
    assert!(sw.handle(do_update(1, true)).is_empty());

    let mut cs = content(1);
    feed(&mut cs, cycle_start(1, true));
    assert!(cs.handle(do_update(1, true)).is_empty());
    assert_eq!(cs.state(), &CoordinatorState::AwaitingPeer { build_id: 1 });
}

#[test]
fn each_context_sequences_independently() {
    let mut first = content(1);
    let mut second = content(2);
    feed(&mut first, cycle_start(1, true));
    feed(&mut second, cycle_start(1, true));

    // Only the first connection saw the relay before the second timed out.
    assert_eq!(reinjections(&feed(&mut first, cycle_end(1))), 1);
    let effects = second.handle(CoordinatorInput::PeerTimeout(1));
    assert!(matches!(effects.as_slice(), [Effect::Report { build_id: 1, .. }]));

    assert_eq!(first.state(), &CoordinatorState::Reloading { build_id: 1 });
    assert_eq!(second.state().name(), "failed");
}

// ============================================================================
// Stale and Superseded Builds
// ============================================================================

#[test]
fn messages_older_than_the_latest_build_are_discarded() {
    let mut cs = content(1);
    feed(&mut cs, cycle_start(5, true));

    assert!(cs.handle(do_update(4, false)).is_empty());
    assert!(cs
        .handle(msg(ReloadMessage::done_update(4)))
        .is_empty());
    assert!(cs
        .handle(msg(ReloadMessage::error(4, "old failure")))
        .is_empty());
    assert_eq!(cs.state(), &CoordinatorState::AwaitingPeer { build_id: 5 });
    assert_eq!(cs.latest_build(), Some(5));
}

#[test]
fn newer_cycle_supersedes_a_pending_wait() {
    let mut cs = content(1);
    feed(&mut cs, cycle_start(1, true));

    assert_eq!(
        cs.handle(msg(ReloadMessage::build_started(2))),
        vec![Effect::CancelPeerTimer]
    );
    assert_eq!(cs.state(), &CoordinatorState::Idle);
    assert_eq!(
        cs.handle(do_update(2, true)),
        vec![Effect::StartPeerTimer {
            build_id: 2,
            after: PEER_TIMEOUT
        }]
    );

    // Late traffic for the superseded build changes nothing.
    assert!(cs.handle(CoordinatorInput::PeerTimeout(1)).is_empty());
    assert!(cs
        .handle(msg(ReloadMessage::done_update(1)))
        .is_empty());
    assert_eq!(cs.state(), &CoordinatorState::AwaitingPeer { build_id: 2 });

    assert_eq!(reinjections(&feed(&mut cs, cycle_end(2))), 1);
}

#[test]
fn do_update_without_build_started_still_supersedes() {
    let mut cs = content(1);
    feed(&mut cs, cycle_start(1, true));
    assert_eq!(
        cs.handle(do_update(2, false)),
        vec![Effect::CancelPeerTimer, Effect::Reinject { build_id: 2 }]
    );
}

#[test]
fn ack_for_another_build_does_not_release() {
    let mut cs = content(1);
    feed(&mut cs, cycle_start(2, true));
    // A newer ack without its own do-update: recorded, not acted on.
    assert!(cs
        .handle(msg(ReloadMessage::done_update(3)))
        .is_empty());
    assert_eq!(cs.state(), &CoordinatorState::AwaitingPeer { build_id: 2 });
}

// ============================================================================
// Failure
// ============================================================================

#[test]
fn peer_timeout_fails_the_waiting_script() {
    let mut cs = content(1);
    feed(&mut cs, cycle_start(1, true));

    let effects = cs.handle(CoordinatorInput::PeerTimeout(1));
    match effects.as_slice() {
        [Effect::Report { build_id, reason }] => {
            assert_eq!(*build_id, 1);
            assert_eq!(reason, "service worker did not resync within 250 ms");
        }
        other => panic!("expected one report, got {:?}", other),
    }
}

#[test]
fn server_error_fails_the_waiting_script() {
    let mut cs = content(1);
    feed(&mut cs, cycle_start(1, true));

    assert_eq!(
        cs.handle(msg(ReloadMessage::error(1, "ack timed out"))),
        vec![
            Effect::CancelPeerTimer,
            Effect::Report {
                build_id: 1,
                reason: "ack timed out".into()
            }
        ]
    );
    assert_eq!(
        cs.state(),
        &CoordinatorState::Failed {
            build_id: 1,
            reason: "ack timed out".into()
        }
    );
}

#[test]
fn server_error_while_idle_is_only_logged() {
    let mut cs = content(1);
    assert!(cs
        .handle(msg(ReloadMessage::error(1, "ack timed out")))
        .is_empty());
    assert_eq!(cs.state(), &CoordinatorState::Idle);
}

#[test]
fn failed_is_terminal_until_reset() {
    let mut cs = content(1);
    feed(&mut cs, cycle_start(1, true));
    cs.handle(CoordinatorInput::PeerTimeout(1));

    assert!(feed(&mut cs, cycle_end(1)).is_empty());
    assert!(feed(&mut cs, cycle_start(2, false)).is_empty());
    assert_eq!(cs.state().name(), "failed");

    cs.reset();
    assert_eq!(cs.state(), &CoordinatorState::Idle);
    assert_eq!(
        feed(&mut cs, cycle_start(3, false)),
        vec![Effect::Reinject { build_id: 3 }]
    );
}

#[test]
fn worker_reload_failure_sends_no_ack() {
    let mut sw = worker();
    feed(&mut sw, cycle_start(1, false));
    let effects = sw.handle(CoordinatorInput::ReloadFailed("runtime.reload threw".into()));
    assert_eq!(
        effects,
        vec![Effect::Report {
            build_id: 1,
            reason: "runtime.reload threw".into()
        }]
    );
    assert!(sw.handle(CoordinatorInput::ReloadSucceeded).is_empty());
}

// ============================================================================
// Updates During a Reload
// ============================================================================

#[test]
fn update_during_reload_is_applied_after_it() {
    let mut cs = content(1);
    assert_eq!(
        cs.handle(do_update(1, false)),
        vec![Effect::Reinject { build_id: 1 }]
    );

    // Build 2 lands while build 1 is still being reinjected.
    assert!(feed(&mut cs, cycle_start(2, false)).is_empty());
    assert_eq!(cs.state(), &CoordinatorState::Reloading { build_id: 1 });

    assert_eq!(
        cs.handle(CoordinatorInput::ReloadSucceeded),
        vec![Effect::Reinject { build_id: 2 }]
    );
    assert_eq!(cs.state(), &CoordinatorState::Reloading { build_id: 2 });
    assert!(cs.handle(CoordinatorInput::ReloadSucceeded).is_empty());
    assert_eq!(cs.state(), &CoordinatorState::Idle);
}

#[test]
fn worker_acks_then_reloads_again_for_a_queued_build() {
    let mut sw = worker();
    feed(&mut sw, cycle_start(1, true));
    assert!(feed(&mut sw, cycle_start(2, true)).is_empty());

    assert_eq!(
        sw.handle(CoordinatorInput::ReloadSucceeded),
        vec![
            Effect::Send(ReloadMessage::done_update(1)),
            Effect::ReloadSelf { build_id: 2 }
        ]
    );
    assert_eq!(
        sw.handle(CoordinatorInput::ReloadSucceeded),
        vec![Effect::Send(ReloadMessage::done_update(2))]
    );
}

#[test]
fn queued_update_waits_for_the_worker_when_it_needs_resync() {
    let mut cs = content(1);
    cs.handle(do_update(1, false));
    feed(&mut cs, cycle_start(2, true));

    assert_eq!(
        cs.handle(CoordinatorInput::ReloadSucceeded),
        vec![Effect::StartPeerTimer {
            build_id: 2,
            after: PEER_TIMEOUT
        }]
    );
    assert_eq!(reinjections(&feed(&mut cs, cycle_end(2))), 1);
}

#[test]
fn failed_reload_drops_the_queued_update() {
    let mut cs = content(1);
    cs.handle(do_update(1, false));
    feed(&mut cs, cycle_start(2, false));

    let effects = cs.handle(CoordinatorInput::ReloadFailed("tab closed".into()));
    assert!(matches!(effects.as_slice(), [Effect::Report { build_id: 1, .. }]));
    cs.reset();
    assert!(cs.handle(CoordinatorInput::ReloadSucceeded).is_empty());
    assert_eq!(cs.state(), &CoordinatorState::Idle);
}

#[test]
fn worker_ack_overtaking_its_update_still_releases() {
    let mut cs = content(1);
    assert!(cs
        .handle(msg(ReloadMessage::done_update(4)))
        .is_empty());
    assert_eq!(
        cs.handle(do_update(4, true)),
        vec![Effect::Reinject { build_id: 4 }]
    );
}
