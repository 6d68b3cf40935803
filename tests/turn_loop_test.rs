//! Tests for the turn loop: ordering, termination causes and deadlines.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use strictly_arena::testing::{Entry, Hook, Journal, ScriptedPlayer, ScriptedRule};
use strictly_arena::{
    DeadlineConfig, Ending, GameId, MatchConfig, MatchEngine, MatchError, MatchErrorKind,
    MatchEvent, Outcome, Phase, PlayerId, Step,
};
use tokio::time::timeout;

const LIMIT: Duration = Duration::from_secs(5);

fn host_driven() -> MatchConfig {
    MatchConfig::default().with_auto_begin(false)
}

fn p(id: &str) -> PlayerId {
    PlayerId::new(id)
}

/// Creates a game, seats ready scripted players and moves it to running.
async fn started_game(
    rule: ScriptedRule,
    config: MatchConfig,
    players: Vec<ScriptedPlayer>,
) -> (Arc<MatchEngine>, Vec<Arc<ScriptedPlayer>>) {
    let game = MatchEngine::new(GameId::new("g1"), "scripted".to_string(), Box::new(rule), config);

    let mut seated = Vec::new();
    for player in players {
        let player = Arc::new(player);
        game.register_participant(player.clone())
            .await
            .expect("register");
        seated.push(player);
    }

    assert!(game.start().await.expect("start"));
    (game, seated)
}

async fn run(game: &MatchEngine) -> Result<Outcome, MatchError> {
    timeout(LIMIT, game.run()).await.expect("run did not finish")
}

#[tokio::test]
async fn test_three_move_scenario() {
    let journal = Journal::new();
    let (game, _) = started_game(
        ScriptedRule::new(journal.clone()).with_over_after(3),
        host_driven(),
        vec![
            ScriptedPlayer::new("p1", journal.clone()).ready(),
            ScriptedPlayer::new("p2", journal.clone()).ready(),
        ],
    )
    .await;

    let outcome = run(&game).await.expect("outcome");

    assert_eq!(outcome, Outcome::Completed { winner: None });
    assert_eq!(journal.asked(), vec![(p("p1"), 0), (p("p2"), 0), (p("p1"), 1)]);
    assert_eq!(journal.accepted(), vec![p("p1"), p("p2"), p("p1")]);

    let state = game.game_state();
    assert_eq!(*state.turn(), 1);
    assert_eq!(state.ending(), &Some(Ending::Completed));
    assert_eq!(state.gameover_reason().as_deref(), Some("completed"));
    assert!(state.started_at().is_some());
    assert!(state.ended_at().is_some());
    assert_eq!(game.phase(), Phase::GameOver);
}

#[tokio::test]
async fn test_rule_records_winner_and_context() {
    let journal = Journal::new();
    let (game, _) = started_game(
        ScriptedRule::new(journal.clone())
            .with_over_after(3)
            .declaring_winner(),
        host_driven(),
        vec![
            ScriptedPlayer::new("p1", journal.clone()).ready(),
            ScriptedPlayer::new("p2", journal.clone()).ready(),
        ],
    )
    .await;

    let outcome = run(&game).await.expect("outcome");

    assert_eq!(outcome, Outcome::Completed { winner: Some(p("p1")) });
    let state = game.game_state();
    assert_eq!(state.winner(), &Some(p("p1")));
    assert_eq!(state.gameover_context(), &Some(json!({ "moves": 3 })));
}

#[tokio::test]
async fn test_game_over_mid_turn_skips_remaining_players() {
    let journal = Journal::new();
    let (game, _) = started_game(
        ScriptedRule::new(journal.clone()).with_over_after(2),
        host_driven(),
        vec![
            ScriptedPlayer::new("p1", journal.clone()).ready(),
            ScriptedPlayer::new("p2", journal.clone()).ready(),
            ScriptedPlayer::new("p3", journal.clone()).ready(),
        ],
    )
    .await;

    run(&game).await.expect("outcome");

    assert_eq!(journal.asked(), vec![(p("p1"), 0), (p("p2"), 0)]);
    // Every participant still hears about the end, in turn order.
    assert_eq!(journal.notified(), vec![p("p1"), p("p2"), p("p3")]);
}

#[tokio::test]
async fn test_invalid_move_is_fatal_and_never_accepted() {
    let journal = Journal::new();
    let (game, _) = started_game(
        ScriptedRule::new(journal.clone()).rejecting("p2"),
        host_driven(),
        vec![
            ScriptedPlayer::new("p1", journal.clone()).ready(),
            ScriptedPlayer::new("p2", journal.clone()).ready(),
        ],
    )
    .await;
    let mut events = game.subscribe();

    let err = run(&game).await.unwrap_err();

    assert!(err.is_protocol_violation());
    assert!(matches!(
        err.kind(),
        MatchErrorKind::ProtocolViolation { player, .. } if player == &p("p2")
    ));
    assert_eq!(journal.count(&Entry::Validated(p("p2"))), 1);
    assert_eq!(journal.count(&Entry::Accepted(p("p2"))), 0);
    assert_eq!(journal.accepted(), vec![p("p1")]);

    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        if let MatchEvent::ValidationFailed { reason } = event {
            assert!(reason.contains("p2"));
            saw_failure = true;
        }
    }
    assert!(saw_failure);

    // Finalized, but faulting is left to the supervisor.
    assert_eq!(game.phase(), Phase::GameOver);
    assert!(matches!(game.game_state().ending(), Some(Ending::Faulted { .. })));
    game.mark_faulted();
    assert_eq!(game.phase(), Phase::Faulted);
}

#[tokio::test]
async fn test_turn_ceiling_is_a_configuration_error() {
    let journal = Journal::new();
    let (game, players) = started_game(
        ScriptedRule::new(journal.clone()),
        host_driven().with_max_turns(5),
        vec![
            ScriptedPlayer::new("p1", journal.clone()).ready(),
            ScriptedPlayer::new("p2", journal.clone()).ready(),
        ],
    )
    .await;

    let err = run(&game).await.unwrap_err();

    assert!(err.is_configuration());
    // Turns 0 through 5 are played.
    assert_eq!(journal.accepted().len(), 12);
    assert_eq!(*game.game_state().turn(), 5);
    assert_eq!(journal.notified(), vec![p("p1"), p("p2")]);
    for player in &players {
        let final_state = player.final_state().expect("notified");
        assert!(*final_state.gameover());
    }
}

#[tokio::test]
async fn test_abort_stops_after_current_move() {
    let journal = Journal::new();
    let game = MatchEngine::new(
        GameId::new("g1"),
        "scripted".to_string(),
        Box::new(ScriptedRule::new(journal.clone())),
        host_driven(),
    );

    let handle = Arc::downgrade(&game);
    let p1 = ScriptedPlayer::new("p1", journal.clone()).ready().on_move(move |seq| {
        if seq == 2 {
            if let Some(game) = handle.upgrade() {
                game.abort("host shutting down");
            }
        }
    });
    game.register_participant(Arc::new(p1)).await.expect("register p1");
    game.register_participant(Arc::new(ScriptedPlayer::new("p2", journal.clone()).ready()))
        .await
        .expect("register p2");
    assert!(game.start().await.expect("start"));

    let outcome = run(&game).await.expect("outcome");

    assert_eq!(
        outcome,
        Outcome::Aborted {
            reason: "host shutting down".to_string()
        }
    );
    assert_eq!(journal.asked(), vec![(p("p1"), 0), (p("p2"), 0), (p("p1"), 1)]);
    // The move in flight is still accepted; the post check is skipped.
    assert_eq!(journal.accepted().len(), 3);
    assert_eq!(journal.count(&Entry::PostChecked(p("p1"))), 1);

    let state = game.game_state();
    assert_eq!(state.gameover_reason().as_deref(), Some("host shutting down"));
    assert_eq!(game.abort_reason().as_deref(), Some("host shutting down"));
}

#[tokio::test]
async fn test_slow_think_times_out() {
    let journal = Journal::new();
    let (game, _) = started_game(
        ScriptedRule::new(journal.clone()),
        host_driven(),
        vec![
            ScriptedPlayer::new("slow", journal.clone())
                .ready()
                .with_think_time(Duration::from_secs(2)),
        ],
    )
    .await;

    let began = Instant::now();
    let err = run(&game).await.unwrap_err();

    assert!(began.elapsed() < Duration::from_secs(1));
    assert!(err.is_timeout());
    assert!(err.is_protocol_violation());
    assert!(matches!(err.kind(), MatchErrorKind::Timeout { step: Step::Think, .. }));
    assert!(journal.accepted().is_empty());
}

#[tokio::test]
async fn test_slow_accept_times_out() {
    let journal = Journal::new();
    let config = host_driven().with_deadlines(DeadlineConfig::default().with_accept(50));
    let (game, _) = started_game(
        ScriptedRule::new(journal.clone()).stalling_at(Hook::Accept, Duration::from_secs(2)),
        config,
        vec![ScriptedPlayer::new("p1", journal.clone()).ready()],
    )
    .await;

    let err = run(&game).await.unwrap_err();

    assert!(matches!(err.kind(), MatchErrorKind::Timeout { step: Step::Accept, .. }));
    assert_eq!(journal.notified(), vec![p("p1")]);
}

#[tokio::test]
async fn test_match_deadline_bounds_the_whole_run() {
    let journal = Journal::new();
    let config = host_driven().with_deadlines(
        DeadlineConfig::unbounded().with_whole_match(200),
    );
    let (game, _) = started_game(
        ScriptedRule::new(journal.clone()),
        config,
        vec![
            ScriptedPlayer::new("p1", journal.clone())
                .ready()
                .with_think_time(Duration::from_millis(30)),
        ],
    )
    .await;

    let err = run(&game).await.unwrap_err();

    assert!(matches!(err.kind(), MatchErrorKind::Timeout { step: Step::Match, .. }));
    assert!(!journal.accepted().is_empty());
    assert_eq!(journal.notified(), vec![p("p1")]);
}

#[tokio::test]
async fn test_envelope_without_move_field_is_rejected() {
    let journal = Journal::new();
    let (game, _) = started_game(
        ScriptedRule::new(journal.clone()),
        host_driven(),
        vec![
            ScriptedPlayer::new("p1", journal.clone())
                .ready()
                .omitting_move_field(),
        ],
    )
    .await;

    let err = run(&game).await.unwrap_err();

    assert!(err.is_protocol_violation());
    assert_eq!(journal.count(&Entry::Validated(p("p1"))), 0);
}

#[tokio::test]
async fn test_participant_failure_is_a_fault() {
    let journal = Journal::new();
    let (game, _) = started_game(
        ScriptedRule::new(journal.clone()),
        host_driven(),
        vec![
            ScriptedPlayer::new("p1", journal.clone())
                .ready()
                .failing("connection reset"),
        ],
    )
    .await;

    let err = run(&game).await.unwrap_err();

    match err.kind() {
        MatchErrorKind::Participant { player, message } => {
            assert_eq!(player, &p("p1"));
            assert!(message.contains("connection reset"));
        }
        other => panic!("unexpected error kind: {other}"),
    }
    assert_eq!(journal.notified(), vec![p("p1")]);
    assert_eq!(game.phase(), Phase::GameOver);
}

#[tokio::test]
async fn test_init_failure_still_finalizes() {
    let journal = Journal::new();
    let (game, _) = started_game(
        ScriptedRule::new(journal.clone()).failing_at(Hook::Init),
        host_driven(),
        vec![
            ScriptedPlayer::new("p1", journal.clone()).ready(),
            ScriptedPlayer::new("p2", journal.clone()).ready(),
        ],
    )
    .await;

    let err = run(&game).await.unwrap_err();

    assert!(matches!(err.kind(), MatchErrorKind::Rule { hook: "init", .. }));
    assert!(!timeout(LIMIT, game.wait_begun()).await.expect("begun"));
    assert!(journal.asked().is_empty());
    assert_eq!(journal.notified(), vec![p("p1"), p("p2")]);
    assert_eq!(game.phase(), Phase::GameOver);

    let state = game.wait_finished().await;
    assert!(state.started_at().is_none());
    assert!(matches!(state.ending(), Some(Ending::Faulted { .. })));
}

#[tokio::test]
async fn test_rule_hook_error_is_a_rule_fault() {
    let journal = Journal::new();
    let (game, _) = started_game(
        ScriptedRule::new(journal.clone()).failing_at(Hook::Validate),
        host_driven(),
        vec![ScriptedPlayer::new("p1", journal.clone()).ready()],
    )
    .await;

    let err = run(&game).await.unwrap_err();

    match err.kind() {
        MatchErrorKind::Rule { hook, message } => {
            assert_eq!(*hook, "validate_move");
            assert!(message.contains("scripted failure"));
        }
        other => panic!("unexpected error kind: {other}"),
    }
    assert!(!err.is_protocol_violation());
    assert!(journal.accepted().is_empty());
    assert_eq!(journal.notified(), vec![p("p1")]);
}

#[tokio::test]
async fn test_slow_validation_times_out() {
    let journal = Journal::new();
    let config = host_driven().with_deadlines(DeadlineConfig::default().with_validate(50));
    let (game, _) = started_game(
        ScriptedRule::new(journal.clone()).stalling_at(Hook::Validate, Duration::from_secs(2)),
        config,
        vec![ScriptedPlayer::new("p1", journal.clone()).ready()],
    )
    .await;

    let err = run(&game).await.unwrap_err();

    assert!(matches!(err.kind(), MatchErrorKind::Timeout { step: Step::Validate, .. }));
    assert!(journal.accepted().is_empty());
    assert_eq!(journal.notified(), vec![p("p1")]);
}

#[tokio::test]
async fn test_slow_post_check_times_out() {
    let journal = Journal::new();
    let config = host_driven().with_deadlines(DeadlineConfig::default().with_post(50));
    let (game, _) = started_game(
        ScriptedRule::new(journal.clone()).stalling_at(Hook::Post, Duration::from_secs(2)),
        config,
        vec![ScriptedPlayer::new("p1", journal.clone()).ready()],
    )
    .await;

    let err = run(&game).await.unwrap_err();

    assert!(matches!(err.kind(), MatchErrorKind::Timeout { step: Step::Post, .. }));
    assert_eq!(journal.accepted(), vec![p("p1")]);
    assert_eq!(journal.notified(), vec![p("p1")]);
    assert_eq!(game.phase(), Phase::GameOver);
}

#[tokio::test]
async fn test_lifecycle_signals_share_final_state() {
    let journal = Journal::new();
    let (game, _) = started_game(
        ScriptedRule::new(journal.clone()).with_over_after(1),
        host_driven(),
        vec![ScriptedPlayer::new("p1", journal.clone()).ready()],
    )
    .await;
    let mut events = game.subscribe();

    let early_game = Arc::clone(&game);
    let early = tokio::spawn(async move { early_game.wait_finished().await });
    let begun_game = Arc::clone(&game);
    let begun = tokio::spawn(async move { begun_game.wait_begun().await });

    run(&game).await.expect("outcome");

    let early = timeout(LIMIT, early).await.expect("early").expect("join");
    let late = game.wait_finished().await;
    assert!(Arc::ptr_eq(&early, &late));
    assert!(timeout(LIMIT, begun).await.expect("begun").expect("join"));
    assert!(game.wait_begun().await);

    let mut phase_seen = false;
    let mut from_event = None;
    while let Ok(event) = events.try_recv() {
        match event {
            MatchEvent::PhaseChanged { phase: Phase::GameOver } => phase_seen = true,
            MatchEvent::GameOver { state } => {
                assert!(phase_seen, "GameOver came before PhaseChanged");
                from_event = Some(state);
            }
            _ => {}
        }
    }
    let from_event = from_event.expect("game over event");
    assert!(Arc::ptr_eq(&from_event, &late));
    assert_eq!(from_event.phase(), &Phase::GameOver);
}

#[tokio::test]
async fn test_event_order_for_one_move() {
    let journal = Journal::new();
    let (game, _) = started_game(
        ScriptedRule::new(journal.clone()).with_over_after(1),
        host_driven(),
        vec![ScriptedPlayer::new("p1", journal.clone()).ready()],
    )
    .await;
    let mut events = game.subscribe();

    run(&game).await.expect("outcome");

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.name());
    }
    assert_eq!(names, vec!["begin", "move-made", "phase-changed", "gameover"]);
}

#[tokio::test]
async fn test_rule_state_is_shared_with_snapshots() {
    let journal = Journal::new();
    let (game, _) = started_game(
        ScriptedRule::new(journal.clone()).with_over_after(2),
        host_driven(),
        vec![
            ScriptedPlayer::new("p1", journal.clone()).ready(),
            ScriptedPlayer::new("p2", journal.clone()).ready(),
        ],
    )
    .await;
    let before = game.game_state();

    run(&game).await.expect("outcome");

    let after = game.game_state();
    assert!(Arc::ptr_eq(before.match_state(), after.match_state()));
    let state = after.match_state().read().await;
    assert_eq!(state.counter("moves"), 2);
    assert_eq!(state.get("history").and_then(|h| h.as_array()).map(Vec::len), Some(2));
}
