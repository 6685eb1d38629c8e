// Copyright (C) 2026 ArenaWorks
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use arena_common::{
    BattleOutcome, BattleResult, LeaderboardEntry, Player, SettlementReport, report_channel_for,
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::{Client as DynamoClient, types::AttributeValue};
use chrono::Utc;
use rand::Rng;
use redis::{
    AsyncCommands,
    aio::MultiplexedConnection,
    streams::{StreamReadOptions, StreamReadReply},
};
use tokio::{sync::watch, task::JoinSet};
use tracing::{info, warn};

#[derive(Clone)]
struct AppState {
    results: Arc<dyn ResultSource>,
    players: Arc<dyn PlayerStore>,
    leaderboard: Arc<dyn LeaderboardStore>,
    notifications: Arc<dyn ReportPublisher>,
    report_channel_prefix: String,
    gain_percent_lower: i64,
    gain_percent_upper: i64,
    gold_score_ratio: i64,
    batch_size: usize,
    poll_interval: Duration,
    error_pause: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadPosition {
    Pending,
    New,
}

#[derive(Debug, Clone)]
struct ResultEntry {
    delivery_id: String,
    payload: String,
}

#[async_trait]
trait ResultSource: Send + Sync {
    async fn read_batch(
        &self,
        position: ReadPosition,
        count: usize,
    ) -> anyhow::Result<Vec<ResultEntry>>;
    async fn acknowledge(&self, delivery_ids: &[String]) -> anyhow::Result<()>;
}

#[async_trait]
trait PlayerStore: Send + Sync {
    async fn find_by_id(&self, id: &str) -> anyhow::Result<Option<Player>>;
    async fn save(&self, player: &Player) -> anyhow::Result<()>;
}

#[async_trait]
trait LeaderboardStore: Send + Sync {
    async fn find_by_id(&self, id: &str) -> anyhow::Result<Option<LeaderboardEntry>>;
    async fn insert(&self, entry: &LeaderboardEntry) -> anyhow::Result<()>;
    async fn save(&self, entry: &LeaderboardEntry) -> anyhow::Result<()>;
}

#[async_trait]
trait ReportPublisher: Send + Sync {
    async fn publish(&self, channel: &str, report: &SettlementReport) -> anyhow::Result<()>;
}

#[derive(Clone)]
struct RedisResultSource {
    connection: MultiplexedConnection,
    stream: String,
    group: String,
    consumer: String,
}

impl RedisResultSource {
    async fn ensure_group(&self) -> anyhow::Result<()> {
        let mut connection = self.connection.clone();
        let created: redis::RedisResult<String> = connection
            .xgroup_create_mkstream(&self.stream, &self.group, "$")
            .await;
        match created {
            Ok(_) => Ok(()),
            Err(error) if error.to_string().contains("BUSYGROUP") => Ok(()),
            Err(error) => Err(error).context("failed to create battle result group"),
        }
    }
}

#[async_trait]
impl ResultSource for RedisResultSource {
    async fn read_batch(
        &self,
        position: ReadPosition,
        count: usize,
    ) -> anyhow::Result<Vec<ResultEntry>> {
        let start = match position {
            ReadPosition::Pending => "0",
            ReadPosition::New => ">",
        };
        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(count);
        let mut connection = self.connection.clone();
        let reply: StreamReadReply = connection
            .xread_options(&[&self.stream], &[start], &options)
            .await
            .context("failed to read battle results")?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                let payload: String = entry.get("data").unwrap_or_default();
                entries.push(ResultEntry {
                    delivery_id: entry.id,
                    payload,
                });
            }
        }
        Ok(entries)
    }

    async fn acknowledge(&self, delivery_ids: &[String]) -> anyhow::Result<()> {
        if delivery_ids.is_empty() {
            return Ok(());
        }
        let mut connection = self.connection.clone();
        let _: u64 = connection
            .xack(&self.stream, &self.group, delivery_ids)
            .await
            .context("failed to acknowledge battle results")?;
        Ok(())
    }
}

#[derive(Clone)]
struct RedisReportPublisher {
    connection: MultiplexedConnection,
}

#[async_trait]
impl ReportPublisher for RedisReportPublisher {
    async fn publish(&self, channel: &str, report: &SettlementReport) -> anyhow::Result<()> {
        let payload =
            serde_json::to_string(report).context("failed to encode settlement report")?;
        let mut connection = self.connection.clone();
        let _: i64 = connection
            .publish(channel, payload)
            .await
            .context("failed to publish settlement report")?;
        Ok(())
    }
}

#[derive(Clone)]
struct DynamoPlayerStore {
    client: DynamoClient,
    table_name: String,
}

#[async_trait]
impl PlayerStore for DynamoPlayerStore {
    async fn find_by_id(&self, id: &str) -> anyhow::Result<Option<Player>> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("id", AttributeValue::S(id.to_string()))
            .send()
            .await
            .context("failed to load player")?;
        let Some(item) = output.item() else {
            return Ok(None);
        };
        Ok(Some(player_from_item(item)?))
    }

    async fn save(&self, player: &Player) -> anyhow::Result<()> {
        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(player_to_item(player)))
            .send()
            .await
            .context("failed to save player")?;
        Ok(())
    }
}

#[derive(Clone)]
struct DynamoLeaderboardStore {
    client: DynamoClient,
    table_name: String,
}

impl DynamoLeaderboardStore {
    async fn put(&self, entry: &LeaderboardEntry) -> anyhow::Result<()> {
        let mut item = HashMap::new();
        item.insert("id".to_string(), AttributeValue::S(entry.id.clone()));
        item.insert(
            "username".to_string(),
            AttributeValue::S(entry.username.clone()),
        );
        item.insert(
            "score".to_string(),
            AttributeValue::N(entry.score.to_string()),
        );
        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(item))
            .send()
            .await
            .context("failed to save leaderboard entry")?;
        Ok(())
    }
}

#[async_trait]
impl LeaderboardStore for DynamoLeaderboardStore {
    async fn find_by_id(&self, id: &str) -> anyhow::Result<Option<LeaderboardEntry>> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("id", AttributeValue::S(id.to_string()))
            .send()
            .await
            .context("failed to load leaderboard entry")?;
        let Some(item) = output.item() else {
            return Ok(None);
        };
        Ok(Some(LeaderboardEntry {
            id: string_field(item, "id")?,
            username: string_field(item, "username")?,
            score: number_field(item, "score")?,
        }))
    }

    async fn insert(&self, entry: &LeaderboardEntry) -> anyhow::Result<()> {
        self.put(entry).await
    }

    async fn save(&self, entry: &LeaderboardEntry) -> anyhow::Result<()> {
        self.put(entry).await
    }
}

fn player_from_item(item: &HashMap<String, AttributeValue>) -> anyhow::Result<Player> {
    Ok(Player {
        id: string_field(item, "id")?,
        username: string_field(item, "username")?,
        description: item
            .get("description")
            .and_then(|value| value.as_s().ok())
            .cloned()
            .unwrap_or_default(),
        gold: number_field(item, "gold")?,
        silver: number_field(item, "silver")?,
        attack: number_field(item, "attack")? as i32,
        defense: number_field(item, "defense")? as i32,
        hit_points: number_field(item, "hit_points")? as i32,
    })
}

fn player_to_item(player: &Player) -> HashMap<String, AttributeValue> {
    let mut item = HashMap::new();
    item.insert("id".to_string(), AttributeValue::S(player.id.clone()));
    item.insert(
        "username".to_string(),
        AttributeValue::S(player.username.clone()),
    );
    if !player.description.is_empty() {
        item.insert(
            "description".to_string(),
            AttributeValue::S(player.description.clone()),
        );
    }
    item.insert("gold".to_string(), AttributeValue::N(player.gold.to_string()));
    item.insert(
        "silver".to_string(),
        AttributeValue::N(player.silver.to_string()),
    );
    item.insert(
        "attack".to_string(),
        AttributeValue::N(player.attack.to_string()),
    );
    item.insert(
        "defense".to_string(),
        AttributeValue::N(player.defense.to_string()),
    );
    item.insert(
        "hit_points".to_string(),
        AttributeValue::N(player.hit_points.to_string()),
    );
    item
}

fn string_field(item: &HashMap<String, AttributeValue>, name: &str) -> anyhow::Result<String> {
    item.get(name)
        .and_then(|value| value.as_s().ok())
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("item missing string field {name}"))
}

fn number_field(item: &HashMap<String, AttributeValue>, name: &str) -> anyhow::Result<i64> {
    item.get(name)
        .and_then(|value| value.as_n().ok())
        .and_then(|value| value.parse::<i64>().ok())
        .ok_or_else(|| anyhow::anyhow!("item missing numeric field {name}"))
}

impl AppState {
    async fn from_env() -> anyhow::Result<Self> {
        let redis_url = std::env::var("ARENA_REDIS_URL")
            .ok()
            .unwrap_or_else(|| "redis://redis:6379".to_string());
        let client = redis::Client::open(redis_url).context("invalid redis url")?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .context("failed to connect to redis")?;

        let results = RedisResultSource {
            connection: connection.clone(),
            stream: std::env::var("BATTLE_RESULT_STREAM")
                .ok()
                .unwrap_or_else(|| "battle.results".to_string()),
            group: std::env::var("BATTLE_RESULT_GROUP")
                .ok()
                .unwrap_or_else(|| "arena-settlement-service".to_string()),
            consumer: std::env::var("SETTLEMENT_CONSUMER_NAME")
                .ok()
                .unwrap_or_else(|| "arena-settlement-service".to_string()),
        };
        results.ensure_group().await?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Ok(endpoint) = std::env::var("DYNAMODB_ENDPOINT") {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;
        let dynamo = DynamoClient::new(&config);

        Ok(Self {
            results: Arc::new(results),
            players: Arc::new(DynamoPlayerStore {
                client: dynamo.clone(),
                table_name: std::env::var("PLAYERS_TABLE")
                    .ok()
                    .unwrap_or_else(|| "players".to_string()),
            }),
            leaderboard: Arc::new(DynamoLeaderboardStore {
                client: dynamo,
                table_name: std::env::var("LEADERBOARD_TABLE")
                    .ok()
                    .unwrap_or_else(|| "leaderboard".to_string()),
            }),
            notifications: Arc::new(RedisReportPublisher { connection }),
            report_channel_prefix: std::env::var("BATTLE_REPORT_CHANNEL_PREFIX")
                .ok()
                .unwrap_or_else(|| "battle.reports".to_string()),
            gain_percent_lower: std::env::var("GAIN_PERCENT_LOWER")
                .ok()
                .and_then(|value| value.parse::<i64>().ok())
                .unwrap_or(5),
            gain_percent_upper: std::env::var("GAIN_PERCENT_UPPER")
                .ok()
                .and_then(|value| value.parse::<i64>().ok())
                .unwrap_or(10),
            gold_score_ratio: std::env::var("GOLD_SCORE_RATIO")
                .ok()
                .and_then(|value| value.parse::<i64>().ok())
                .unwrap_or(10),
            batch_size: std::env::var("SETTLEMENT_BATCH_SIZE")
                .ok()
                .and_then(|value| value.parse::<usize>().ok())
                .unwrap_or(50),
            poll_interval: Duration::from_millis(
                std::env::var("SETTLEMENT_POLL_INTERVAL_MS")
                    .ok()
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(10),
            ),
            error_pause: Duration::from_millis(
                std::env::var("SETTLEMENT_ERROR_PAUSE_MS")
                    .ok()
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(500),
            ),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "arena_settlement_service=debug".to_string()),
        )
        .init();

    let state = AppState::from_env().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_state = state.clone();
    let worker = tokio::spawn(async move {
        run_settlement_worker(worker_state, shutdown_rx).await;
    });

    tokio::signal::ctrl_c().await?;
    info!("arena-settlement-service shutting down");
    let _ = shutdown_tx.send(true);
    let _ = worker.await;
    Ok(())
}

async fn run_settlement_worker(state: AppState, mut shutdown: watch::Receiver<bool>) {
    info!(batch_size = state.batch_size, "settlement worker started");
    if let Err(error) = drain_pending(&state).await {
        warn!(error = %error, "failed to drain pending battle results");
    }

    let mut pending_acks: Vec<String> = Vec::new();
    loop {
        if *shutdown.borrow() {
            info!("settlement worker observed shutdown signal");
            break;
        }

        match run_iteration(&state, &mut pending_acks).await {
            Ok(()) => pause(&mut shutdown, state.poll_interval).await,
            Err(error) => {
                warn!(error = %error, "settlement iteration failed, pausing before retry");
                pause(&mut shutdown, state.error_pause).await;
            }
        }
    }
}

async fn pause(shutdown: &mut watch::Receiver<bool>, duration: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = shutdown.changed() => {}
    }
}

/// Retries this consumer's delivered-but-unacknowledged results left behind
/// by a previous run. Each is attempted once; anything still failing stays
/// pending for the next restart.
async fn drain_pending(state: &AppState) -> anyhow::Result<()> {
    let mut attempted: HashSet<String> = HashSet::new();
    loop {
        let entries = state
            .results
            .read_batch(ReadPosition::Pending, state.batch_size)
            .await?;
        let fresh: Vec<ResultEntry> = entries
            .into_iter()
            .filter(|entry| attempted.insert(entry.delivery_id.clone()))
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }

        info!(count = fresh.len(), "retrying battle results left pending by a previous run");
        let acks = process_batch(state, fresh).await;
        state.results.acknowledge(&acks).await?;
    }
}

async fn run_iteration(state: &AppState, pending_acks: &mut Vec<String>) -> anyhow::Result<()> {
    if !pending_acks.is_empty() {
        state.results.acknowledge(pending_acks).await?;
        pending_acks.clear();
    }

    let entries = state
        .results
        .read_batch(ReadPosition::New, state.batch_size)
        .await?;
    if entries.is_empty() {
        return Ok(());
    }

    let acks = process_batch(state, entries).await;
    pending_acks.extend(acks);
    Ok(())
}

async fn process_batch(state: &AppState, entries: Vec<ResultEntry>) -> Vec<String> {
    let mut tasks = JoinSet::new();
    for entry in entries {
        let task_state = state.clone();
        tasks.spawn(async move { process_entry(&task_state, entry).await });
    }

    let mut acks = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Some(delivery_id)) => acks.push(delivery_id),
            Ok(None) => {}
            Err(error) => warn!(error = %error, "settlement task join failed"),
        }
    }
    acks
}

struct ScoreAward {
    player_id: String,
    username: String,
    score: i64,
}

struct SettlementOutcome {
    report: SettlementReport,
    score_award: Option<ScoreAward>,
}

/// Applies the resource transfer for one battle result in place and builds
/// the requester-side report. Draw battles move nothing.
fn settle(
    result: &BattleResult,
    requester: &mut Player,
    opponent: &mut Player,
    percentage: i64,
    gold_score_ratio: i64,
) -> SettlementOutcome {
    let mut report = SettlementReport {
        user_id: result.requester.user_id.clone(),
        battle_result: result.requester.clone(),
        gained_gold: 0,
        lost_gold: 0,
        gained_silver: 0,
        lost_silver: 0,
        settled_at: Utc::now(),
    };

    match result.requester.outcome {
        BattleOutcome::Victory => {
            let (gold_taken, silver_taken) = transfer_resources(requester, opponent, percentage);
            report.gained_gold = gold_taken;
            report.gained_silver = silver_taken;
            SettlementOutcome {
                report,
                score_award: Some(ScoreAward {
                    player_id: requester.id.clone(),
                    username: requester.username.clone(),
                    score: gold_taken * gold_score_ratio + silver_taken,
                }),
            }
        }
        BattleOutcome::Defeat => {
            let (gold_taken, silver_taken) = transfer_resources(opponent, requester, percentage);
            report.lost_gold = gold_taken;
            report.lost_silver = silver_taken;
            SettlementOutcome {
                report,
                score_award: Some(ScoreAward {
                    player_id: opponent.id.clone(),
                    username: opponent.username.clone(),
                    score: gold_taken * gold_score_ratio + silver_taken,
                }),
            }
        }
        BattleOutcome::Draw => SettlementOutcome {
            report,
            score_award: None,
        },
    }
}

/// Moves the integer-truncated percentage of the loser's resources to the
/// winner. The loser's balance never drops below zero.
fn transfer_resources(winner: &mut Player, loser: &mut Player, percentage: i64) -> (i64, i64) {
    let gold_taken = loser.gold * percentage / 100;
    let silver_taken = loser.silver * percentage / 100;

    winner.gold += gold_taken;
    winner.silver += silver_taken;
    loser.gold = (loser.gold - gold_taken).max(0);
    loser.silver = (loser.silver - silver_taken).max(0);

    (gold_taken, silver_taken)
}

async fn process_entry(state: &AppState, entry: ResultEntry) -> Option<String> {
    let result: BattleResult = match serde_json::from_str(&entry.payload) {
        Ok(result) => result,
        Err(error) => {
            warn!(
                delivery_id = %entry.delivery_id,
                error = %error,
                "dropping undecodable battle result"
            );
            return Some(entry.delivery_id);
        }
    };

    match settle_result(state, &result).await {
        Ok(true) => Some(entry.delivery_id),
        Ok(false) => {
            // Unrecoverable for this entry: one of the players is gone.
            warn!(
                requester_id = %result.requester.user_id,
                opponent_id = %result.opponent.user_id,
                delivery_id = %entry.delivery_id,
                "dropping battle result for unknown player"
            );
            Some(entry.delivery_id)
        }
        Err(error) => {
            warn!(
                requester_id = %result.requester.user_id,
                opponent_id = %result.opponent.user_id,
                delivery_id = %entry.delivery_id,
                error = %error,
                "settlement failed, leaving result for redelivery"
            );
            None
        }
    }
}

/// Settles one battle result end to end. `Ok(false)` means a participant no
/// longer exists and the entry should be consumed without side effects.
async fn settle_result(state: &AppState, result: &BattleResult) -> anyhow::Result<bool> {
    let requester = state.players.find_by_id(&result.requester.user_id).await?;
    let opponent = state.players.find_by_id(&result.opponent.user_id).await?;
    let (Some(mut requester), Some(mut opponent)) = (requester, opponent) else {
        return Ok(false);
    };

    let percentage =
        rand::rng().random_range(state.gain_percent_lower..=state.gain_percent_upper);
    let outcome = settle(
        result,
        &mut requester,
        &mut opponent,
        percentage,
        state.gold_score_ratio,
    );

    // A draw moves nothing, so there is nothing to persist.
    if let Some(award) = outcome.score_award.as_ref() {
        record_score(state, award).await?;
        state.players.save(&requester).await?;
        state.players.save(&opponent).await?;
    }

    let channel = report_channel_for(&state.report_channel_prefix, &requester.id, &opponent.id);
    state.notifications.publish(&channel, &outcome.report).await?;

    info!(
        requester_id = %requester.id,
        opponent_id = %opponent.id,
        outcome = ?result.requester.outcome,
        gained_gold = outcome.report.gained_gold,
        lost_gold = outcome.report.lost_gold,
        "battle settled"
    );
    Ok(true)
}

async fn record_score(state: &AppState, award: &ScoreAward) -> anyhow::Result<()> {
    match state.leaderboard.find_by_id(&award.player_id).await? {
        Some(mut entry) => {
            entry.score += award.score;
            state.leaderboard.save(&entry).await
        }
        None => {
            state
                .leaderboard
                .insert(&LeaderboardEntry {
                    id: award.player_id.clone(),
                    username: award.username.clone(),
                    score: award.score,
                })
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_common::{ActionKind, BattleAction, BattleSideResult};
    use std::sync::Mutex;

    #[derive(Default)]
    struct InMemoryResultSource {
        undelivered: Mutex<Vec<ResultEntry>>,
        delivered: Mutex<Vec<ResultEntry>>,
        acknowledged: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ResultSource for InMemoryResultSource {
        async fn read_batch(
            &self,
            position: ReadPosition,
            count: usize,
        ) -> anyhow::Result<Vec<ResultEntry>> {
            match position {
                ReadPosition::Pending => {
                    let delivered = self.delivered.lock().unwrap();
                    let acknowledged = self.acknowledged.lock().unwrap();
                    Ok(delivered
                        .iter()
                        .filter(|entry| !acknowledged.contains(&entry.delivery_id))
                        .take(count)
                        .cloned()
                        .collect())
                }
                ReadPosition::New => {
                    let mut undelivered = self.undelivered.lock().unwrap();
                    let take = count.min(undelivered.len());
                    let batch: Vec<ResultEntry> = undelivered.drain(..take).collect();
                    self.delivered.lock().unwrap().extend(batch.iter().cloned());
                    Ok(batch)
                }
            }
        }

        async fn acknowledge(&self, delivery_ids: &[String]) -> anyhow::Result<()> {
            self.acknowledged
                .lock()
                .unwrap()
                .extend(delivery_ids.iter().cloned());
            Ok(())
        }
    }

    #[derive(Default)]
    struct InMemoryPlayerStore {
        players: Mutex<HashMap<String, Player>>,
    }

    impl InMemoryPlayerStore {
        fn with(players: Vec<Player>) -> Self {
            Self {
                players: Mutex::new(
                    players
                        .into_iter()
                        .map(|player| (player.id.clone(), player))
                        .collect(),
                ),
            }
        }

        fn get(&self, id: &str) -> Option<Player> {
            self.players.lock().unwrap().get(id).cloned()
        }
    }

    #[async_trait]
    impl PlayerStore for InMemoryPlayerStore {
        async fn find_by_id(&self, id: &str) -> anyhow::Result<Option<Player>> {
            Ok(self.players.lock().unwrap().get(id).cloned())
        }

        async fn save(&self, player: &Player) -> anyhow::Result<()> {
            self.players
                .lock()
                .unwrap()
                .insert(player.id.clone(), player.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct InMemoryLeaderboard {
        entries: Mutex<HashMap<String, LeaderboardEntry>>,
    }

    impl InMemoryLeaderboard {
        fn score_of(&self, id: &str) -> Option<i64> {
            self.entries.lock().unwrap().get(id).map(|entry| entry.score)
        }
    }

    #[async_trait]
    impl LeaderboardStore for InMemoryLeaderboard {
        async fn find_by_id(&self, id: &str) -> anyhow::Result<Option<LeaderboardEntry>> {
            Ok(self.entries.lock().unwrap().get(id).cloned())
        }

        async fn insert(&self, entry: &LeaderboardEntry) -> anyhow::Result<()> {
            self.entries
                .lock()
                .unwrap()
                .insert(entry.id.clone(), entry.clone());
            Ok(())
        }

        async fn save(&self, entry: &LeaderboardEntry) -> anyhow::Result<()> {
            self.insert(entry).await
        }
    }

    #[derive(Default)]
    struct RecordingReportPublisher {
        published: Mutex<Vec<(String, SettlementReport)>>,
    }

    #[async_trait]
    impl ReportPublisher for RecordingReportPublisher {
        async fn publish(&self, channel: &str, report: &SettlementReport) -> anyhow::Result<()> {
            self.published
                .lock()
                .unwrap()
                .push((channel.to_string(), report.clone()));
            Ok(())
        }
    }

    fn player(id: &str, gold: i64, silver: i64) -> Player {
        Player {
            id: id.to_string(),
            username: format!("player-{id}"),
            description: String::new(),
            gold,
            silver,
            attack: 70,
            defense: 50,
            hit_points: 200,
        }
    }

    fn battle_result(requester_outcome: BattleOutcome) -> BattleResult {
        let opponent_outcome = match requester_outcome {
            BattleOutcome::Victory => BattleOutcome::Defeat,
            BattleOutcome::Defeat => BattleOutcome::Victory,
            BattleOutcome::Draw => BattleOutcome::Draw,
        };
        let actions = vec![BattleAction {
            from: "a".to_string(),
            to: "b".to_string(),
            action: ActionKind::Hit,
            damage: 70,
        }];
        BattleResult {
            requester: BattleSideResult {
                user_id: "a".to_string(),
                outcome: requester_outcome,
                actions: actions.clone(),
            },
            opponent: BattleSideResult {
                user_id: "b".to_string(),
                outcome: opponent_outcome,
                actions,
            },
        }
    }

    fn result_entry(delivery_id: &str, requester_outcome: BattleOutcome) -> ResultEntry {
        ResultEntry {
            delivery_id: delivery_id.to_string(),
            payload: serde_json::to_string(&battle_result(requester_outcome)).unwrap(),
        }
    }

    /// Percentage is pinned to 10 so the transfer amounts are exact.
    fn app_state(
        results: Arc<InMemoryResultSource>,
        players: Arc<InMemoryPlayerStore>,
        leaderboard: Arc<InMemoryLeaderboard>,
        notifications: Arc<RecordingReportPublisher>,
    ) -> AppState {
        AppState {
            results,
            players,
            leaderboard,
            notifications,
            report_channel_prefix: "battle.reports".to_string(),
            gain_percent_lower: 10,
            gain_percent_upper: 10,
            gold_score_ratio: 10,
            batch_size: 50,
            poll_interval: Duration::from_millis(1),
            error_pause: Duration::from_millis(1),
        }
    }

    #[test]
    fn transfer_truncates_the_percentage_cut() {
        let mut winner = player("a", 100, 100);
        let mut loser = player("b", 999, 19);

        let (gold_taken, silver_taken) = transfer_resources(&mut winner, &mut loser, 5);

        assert_eq!(gold_taken, 49);
        assert_eq!(silver_taken, 0);
        assert_eq!(winner.gold, 149);
        assert_eq!(winner.silver, 100);
        assert_eq!(loser.gold, 950);
        assert_eq!(loser.silver, 19);
    }

    #[test]
    fn transfer_never_leaves_the_loser_negative() {
        let mut winner = player("a", 0, 0);
        let mut loser = player("b", 1, 7);

        let (gold_taken, silver_taken) = transfer_resources(&mut winner, &mut loser, 100);

        assert_eq!(gold_taken, 1);
        assert_eq!(silver_taken, 7);
        assert_eq!(loser.gold, 0);
        assert_eq!(loser.silver, 0);
        assert!(loser.gold >= 0 && loser.silver >= 0);
    }

    #[test]
    fn draw_settlement_moves_nothing_and_awards_no_score() {
        let result = battle_result(BattleOutcome::Draw);
        let mut requester = player("a", 1_000, 10_000);
        let mut opponent = player("b", 1_000, 10_000);

        let outcome = settle(&result, &mut requester, &mut opponent, 10, 10);

        assert!(outcome.score_award.is_none());
        assert_eq!(outcome.report.gained_gold, 0);
        assert_eq!(outcome.report.lost_gold, 0);
        assert_eq!(requester.gold, 1_000);
        assert_eq!(opponent.gold, 1_000);
    }

    #[test]
    fn defeat_settlement_reports_the_requester_losses() {
        let result = battle_result(BattleOutcome::Defeat);
        let mut requester = player("a", 1_000, 10_000);
        let mut opponent = player("b", 500, 500);

        let outcome = settle(&result, &mut requester, &mut opponent, 10, 10);

        assert_eq!(outcome.report.lost_gold, 100);
        assert_eq!(outcome.report.lost_silver, 1_000);
        assert_eq!(outcome.report.gained_gold, 0);
        assert_eq!(requester.gold, 900);
        assert_eq!(opponent.gold, 600);
        let award = outcome.score_award.unwrap();
        assert_eq!(award.player_id, "b");
        assert_eq!(award.score, 100 * 10 + 1_000);
    }

    #[tokio::test]
    async fn victory_settlement_updates_players_leaderboard_and_notifies() {
        let results = Arc::new(InMemoryResultSource::default());
        let players = Arc::new(InMemoryPlayerStore::with(vec![
            player("a", 1_000, 10_000),
            player("b", 1_000, 10_000),
        ]));
        let leaderboard = Arc::new(InMemoryLeaderboard::default());
        let notifications = Arc::new(RecordingReportPublisher::default());
        let state = app_state(results, players.clone(), leaderboard.clone(), notifications.clone());

        let acked = process_entry(&state, result_entry("1-0", BattleOutcome::Victory)).await;

        assert_eq!(acked, Some("1-0".to_string()));
        assert_eq!(players.get("a").unwrap().gold, 1_100);
        assert_eq!(players.get("a").unwrap().silver, 11_000);
        assert_eq!(players.get("b").unwrap().gold, 900);
        assert_eq!(players.get("b").unwrap().silver, 9_000);
        assert_eq!(leaderboard.score_of("a"), Some(100 * 10 + 1_000));

        let published = notifications.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "battle.reports.a.b");
        assert_eq!(published[0].1.user_id, "a");
        assert_eq!(published[0].1.gained_gold, 100);
        assert_eq!(published[0].1.gained_silver, 1_000);
    }

    #[tokio::test]
    async fn repeated_victories_only_ever_raise_the_score() {
        let results = Arc::new(InMemoryResultSource::default());
        let players = Arc::new(InMemoryPlayerStore::with(vec![
            player("a", 1_000, 10_000),
            player("b", 1_000, 10_000),
        ]));
        let leaderboard = Arc::new(InMemoryLeaderboard::default());
        let notifications = Arc::new(RecordingReportPublisher::default());
        let state = app_state(results, players, leaderboard.clone(), notifications);

        let mut last_score = 0;
        for round in 0..3 {
            process_entry(
                &state,
                result_entry(&format!("{round}-0"), BattleOutcome::Victory),
            )
            .await;
            let score = leaderboard.score_of("a").unwrap();
            assert!(score > last_score, "round {round}");
            last_score = score;
        }
    }

    #[tokio::test]
    async fn missing_player_consumes_the_entry_without_side_effects() {
        let results = Arc::new(InMemoryResultSource::default());
        let players = Arc::new(InMemoryPlayerStore::with(vec![player("a", 1_000, 10_000)]));
        let leaderboard = Arc::new(InMemoryLeaderboard::default());
        let notifications = Arc::new(RecordingReportPublisher::default());
        let state = app_state(results, players.clone(), leaderboard.clone(), notifications.clone());

        let acked = process_entry(&state, result_entry("2-0", BattleOutcome::Victory)).await;

        assert_eq!(acked, Some("2-0".to_string()));
        assert_eq!(players.get("a").unwrap().gold, 1_000);
        assert_eq!(leaderboard.score_of("a"), None);
        assert!(notifications.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn undecodable_result_is_dropped_and_acknowledged() {
        let results = Arc::new(InMemoryResultSource::default());
        let players = Arc::new(InMemoryPlayerStore::default());
        let leaderboard = Arc::new(InMemoryLeaderboard::default());
        let notifications = Arc::new(RecordingReportPublisher::default());
        let state = app_state(results, players, leaderboard, notifications.clone());

        let entry = ResultEntry {
            delivery_id: "3-0".to_string(),
            payload: "not json".to_string(),
        };
        let acked = process_entry(&state, entry).await;

        assert_eq!(acked, Some("3-0".to_string()));
        assert!(notifications.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn settled_entries_are_acknowledged_on_the_next_pass() {
        let results = Arc::new(InMemoryResultSource {
            undelivered: Mutex::new(vec![result_entry("4-0", BattleOutcome::Draw)]),
            ..InMemoryResultSource::default()
        });
        let players = Arc::new(InMemoryPlayerStore::with(vec![
            player("a", 1_000, 10_000),
            player("b", 1_000, 10_000),
        ]));
        let leaderboard = Arc::new(InMemoryLeaderboard::default());
        let notifications = Arc::new(RecordingReportPublisher::default());
        let state = app_state(results.clone(), players, leaderboard, notifications.clone());

        let mut pending_acks = Vec::new();
        run_iteration(&state, &mut pending_acks).await.unwrap();
        assert_eq!(pending_acks, vec!["4-0".to_string()]);
        assert!(results.acknowledged.lock().unwrap().is_empty());
        assert_eq!(notifications.published.lock().unwrap().len(), 1);

        run_iteration(&state, &mut pending_acks).await.unwrap();
        assert!(pending_acks.is_empty());
        assert_eq!(*results.acknowledged.lock().unwrap(), vec!["4-0".to_string()]);
    }

    #[tokio::test]
    async fn startup_drain_settles_results_left_pending_by_a_previous_run() {
        let results = Arc::new(InMemoryResultSource {
            undelivered: Mutex::new(vec![result_entry("5-0", BattleOutcome::Victory)]),
            ..InMemoryResultSource::default()
        });
        // Deliver without acknowledging, as an interrupted run would have.
        results.read_batch(ReadPosition::New, 10).await.unwrap();

        let players = Arc::new(InMemoryPlayerStore::with(vec![
            player("a", 1_000, 10_000),
            player("b", 1_000, 10_000),
        ]));
        let leaderboard = Arc::new(InMemoryLeaderboard::default());
        let notifications = Arc::new(RecordingReportPublisher::default());
        let state = app_state(
            results.clone(),
            players.clone(),
            leaderboard,
            notifications.clone(),
        );

        drain_pending(&state).await.unwrap();

        assert_eq!(*results.acknowledged.lock().unwrap(), vec!["5-0".to_string()]);
        assert_eq!(players.get("a").unwrap().gold, 1_100);
        assert_eq!(notifications.published.lock().unwrap().len(), 1);
    }
}
