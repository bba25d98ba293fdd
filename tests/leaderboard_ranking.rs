use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use runner_sync::app::RunnerApp;
use runner_sync::connectivity::ManualConnectivity;
use runner_sync::error::RunnerErrorCode;
use runner_sync::identity::StaticIdentityProvider;
use runner_sync::leaderboard::{
    JoinOutcome, PartitionKey, ScoreSubmission, Tournament, TournamentRules,
};
use runner_sync::remote::{encode_document, schema, InMemoryRemoteStore};
use runner_sync::util::{Clock, ManualClock};

struct World {
    clock: Arc<ManualClock>,
    remote: InMemoryRemoteStore,
}

impl World {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 9, 3, 20, 0, 0).unwrap(),
        ));
        let remote = InMemoryRemoteStore::new(clock.clone());
        Self { clock, remote }
    }

    fn player(&self, player_id: &str) -> (RunnerApp, ManualConnectivity) {
        let connectivity = ManualConnectivity::new(true);
        let app = RunnerApp::builder()
            .remote(Arc::new(self.remote.clone()))
            .clock(self.clock.clone())
            .connectivity(Arc::new(connectivity.clone()))
            .identity(Arc::new(StaticIdentityProvider::signed_in(player_id)))
            .build()
            .unwrap();
        (app, connectivity)
    }

    fn seed_tournament(&self, id: &str, capacity: u32, members: &[&str]) {
        let now = self.clock.now();
        let tournament = Tournament {
            tournament_id: id.to_string(),
            name: "Night Sprint".to_string(),
            start_time: now - Duration::hours(2),
            end_time: now + Duration::days(1),
            max_participants: capacity,
            participant_ids: members.iter().map(|m| m.to_string()).collect(),
            rules: TournamentRules::default(),
            reward_tiers: Vec::new(),
        };
        self.remote.seed(
            schema::tournament(id).unwrap(),
            encode_document(&tournament).unwrap(),
        );
    }

    fn participants(&self, id: &str) -> usize {
        let stored = self.remote.document(&schema::tournament(id).unwrap()).unwrap();
        stored["participantIds"].as_array().map_or(0, Vec::len)
    }
}

#[tokio::test(flavor = "current_thread")]
async fn higher_score_ranks_first_in_either_order() {
    for (first, second) in [(500, 300), (300, 500)] {
        let world = World::new();
        let (alice, _) = world.player("alice");
        let (bruno, _) = world.player("bruno");

        alice
            .leaderboard()
            .submit_score(ScoreSubmission::new(first, "dash"))
            .await
            .unwrap();
        bruno
            .leaderboard()
            .submit_score(ScoreSubmission::new(second, "dash"))
            .await
            .unwrap();

        let global = PartitionKey::global();
        alice.leaderboard().top(&global, 10).await.unwrap();
        assert!(alice.leaderboard().run_ranking_pass().await >= 1);

        let snapshot = alice.leaderboard().cached_snapshot(&global).unwrap();
        let ranked: Vec<(i64, Option<u32>)> =
            snapshot.iter().map(|row| (row.score, row.rank)).collect();
        assert_eq!(ranked, vec![(500, Some(1)), (300, Some(2))]);
    }
}

#[tokio::test(flavor = "current_thread")]
async fn rapid_resubmission_is_throttled_without_queueing() {
    let world = World::new();
    let (app, connectivity) = world.player("alice");
    app.sync().load_profile("alice").await.unwrap();
    connectivity.set_online(false);

    app.leaderboard()
        .submit_score(ScoreSubmission::new(700, "dash"))
        .await
        .unwrap();
    let queued = app.sync().queue().size();
    assert!(queued > 0);

    world.clock.advance(Duration::seconds(2));
    let err = app
        .leaderboard()
        .submit_score(ScoreSubmission::new(710, "dash"))
        .await
        .unwrap_err();
    assert_eq!(err.code, RunnerErrorCode::TooFrequent);
    assert_eq!(app.sync().queue().size(), queued);

    world.clock.advance(Duration::seconds(3));
    app.leaderboard()
        .submit_score(ScoreSubmission::new(720, "dash"))
        .await
        .unwrap();
    assert!(app.sync().queue().size() > queued);
}

#[tokio::test(flavor = "current_thread")]
async fn score_bounds_are_inclusive_of_zero() {
    let world = World::new();
    let (app, _) = world.player("alice");
    let board = app.leaderboard();

    let err = board
        .submit_score(ScoreSubmission::new(999_999_999, "dash"))
        .await
        .unwrap_err();
    assert_eq!(err.code, RunnerErrorCode::InvalidScore);

    let receipt = board
        .submit_score(ScoreSubmission::new(0, "dash"))
        .await
        .unwrap();
    assert!(receipt.new_high_score);
    assert_eq!(receipt.previous_best, None);

    world.clock.advance(Duration::seconds(10));
    let err = board
        .submit_score(ScoreSubmission::new(-1, "dash"))
        .await
        .unwrap_err();
    assert_eq!(err.code, RunnerErrorCode::InvalidScore);
}

#[tokio::test(flavor = "current_thread")]
async fn player_rank_and_neighbours_follow_the_snapshot() {
    let world = World::new();
    let scores = [("alice", 900), ("bruno", 1_200), ("chen", 400), ("dana", 1_500)];
    let mut apps = Vec::new();
    for (player, score) in scores {
        let (app, _) = world.player(player);
        app.leaderboard()
            .submit_score(ScoreSubmission::new(score, "glider"))
            .await
            .unwrap();
        apps.push(app);
    }

    let alice = &apps[0];
    let bot_board = PartitionKey::bot("glider").unwrap();
    alice.leaderboard().refresh_partition(&bot_board).await.unwrap();
    assert_eq!(
        alice.leaderboard().player_rank(&bot_board, "alice").await.unwrap(),
        Some(3)
    );
    let around: Vec<String> = alice
        .leaderboard()
        .rows_around_player(&bot_board, "alice", 1)
        .await
        .unwrap()
        .into_iter()
        .map(|row| row.player_id)
        .collect();
    assert_eq!(around, ["bruno", "alice", "chen"]);
}

#[tokio::test(flavor = "current_thread")]
async fn tournament_joins_are_idempotent_and_capacity_checked() {
    let world = World::new();
    world.seed_tournament("night-sprint", 2, &["zoe"]);
    let (alice, _) = world.player("alice");
    let (bruno, _) = world.player("bruno");

    assert_eq!(
        alice.leaderboard().join_tournament("night-sprint").await.unwrap(),
        JoinOutcome::Joined
    );
    assert_eq!(world.participants("night-sprint"), 2);
    assert_eq!(
        alice.leaderboard().join_tournament("night-sprint").await.unwrap(),
        JoinOutcome::AlreadyMember
    );
    assert_eq!(world.participants("night-sprint"), 2);

    let err = bruno
        .leaderboard()
        .join_tournament("night-sprint")
        .await
        .unwrap_err();
    assert_eq!(err.code, RunnerErrorCode::TournamentFull);
    assert_eq!(world.participants("night-sprint"), 2);

    // Alice's runs now also land on the tournament board.
    let receipt = alice
        .leaderboard()
        .submit_score(ScoreSubmission::new(1_000, "dash"))
        .await
        .unwrap();
    let board = PartitionKey::tournament("night-sprint").unwrap();
    assert!(receipt.partitions.contains(&board.id()));
}

#[tokio::test(flavor = "current_thread")]
async fn ended_tournament_rejects_joins() {
    let world = World::new();
    world.seed_tournament("weekend-cup", 10, &[]);
    let (alice, _) = world.player("alice");
    world.clock.advance(Duration::days(2));
    let err = alice
        .leaderboard()
        .join_tournament("weekend-cup")
        .await
        .unwrap_err();
    assert_eq!(err.code, RunnerErrorCode::TournamentInactive);
}
