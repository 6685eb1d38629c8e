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
    time::{Duration, Instant},
};

use anyhow::Context;
use arena_common::{
    BattleChallenge, BattleResult, DEFAULT_MAX_BATTLE_TURNS, DEFAULT_MAX_DEFENSE, Player,
    combat::{BattleExecutor, RandomBattleRuler},
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::{Client as DynamoClient, types::AttributeValue};
use redis::{
    AsyncCommands,
    aio::MultiplexedConnection,
    streams::{StreamReadOptions, StreamReadReply},
};
use tokio::{sync::watch, task::JoinSet};
use tracing::{info, warn};

#[derive(Clone)]
struct AppState {
    challenges: Arc<dyn ChallengeSource>,
    reports: Arc<dyn ResultSink>,
    players: Arc<dyn PlayerDirectory>,
    locks: Arc<dyn PlayerLocks>,
    executor: Arc<BattleExecutor>,
    batch_size: usize,
    poll_interval: Duration,
    error_pause: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadPosition {
    /// This consumer's delivered-but-unacknowledged entries, drained once at
    /// startup so work interrupted by a crash is retried.
    Pending,
    New,
}

#[derive(Debug, Clone)]
struct ChallengeEntry {
    delivery_id: String,
    payload: String,
}

#[async_trait]
trait ChallengeSource: Send + Sync {
    async fn read_batch(
        &self,
        position: ReadPosition,
        count: usize,
    ) -> anyhow::Result<Vec<ChallengeEntry>>;
    async fn acknowledge(&self, delivery_ids: &[String]) -> anyhow::Result<()>;
}

#[async_trait]
trait ResultSink: Send + Sync {
    async fn publish(&self, result: &BattleResult) -> anyhow::Result<()>;
}

#[async_trait]
trait PlayerDirectory: Send + Sync {
    async fn find_by_id(&self, id: &str) -> anyhow::Result<Option<Player>>;
}

#[derive(Debug, Clone)]
struct LockToken {
    key: String,
    token: String,
}

#[async_trait]
trait PlayerLocks: Send + Sync {
    /// Takes the named lock within the configured wait window, or gives up
    /// and returns `None`.
    async fn acquire(&self, key: &str) -> anyhow::Result<Option<LockToken>>;
    async fn release(&self, lock: &LockToken) -> anyhow::Result<()>;
}

#[derive(Clone)]
struct RedisChallengeSource {
    connection: MultiplexedConnection,
    stream: String,
    group: String,
    consumer: String,
}

impl RedisChallengeSource {
    async fn ensure_group(&self) -> anyhow::Result<()> {
        let mut connection = self.connection.clone();
        let created: redis::RedisResult<String> = connection
            .xgroup_create_mkstream(&self.stream, &self.group, "$")
            .await;
        match created {
            Ok(_) => Ok(()),
            Err(error) if error.to_string().contains("BUSYGROUP") => Ok(()),
            Err(error) => Err(error).context("failed to create battle submission group"),
        }
    }
}

#[async_trait]
impl ChallengeSource for RedisChallengeSource {
    async fn read_batch(
        &self,
        position: ReadPosition,
        count: usize,
    ) -> anyhow::Result<Vec<ChallengeEntry>> {
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
            .context("failed to read battle submissions")?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                let payload: String = entry.get("data").unwrap_or_default();
                entries.push(ChallengeEntry {
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
            .context("failed to acknowledge battle submissions")?;
        Ok(())
    }
}

#[derive(Clone)]
struct RedisResultSink {
    connection: MultiplexedConnection,
    stream: String,
}

#[async_trait]
impl ResultSink for RedisResultSink {
    async fn publish(&self, result: &BattleResult) -> anyhow::Result<()> {
        let payload = serde_json::to_string(result).context("failed to encode battle result")?;
        let mut connection = self.connection.clone();
        let _: String = connection
            .xadd(&self.stream, "*", &[("data", payload.as_str())])
            .await
            .context("failed to append battle result")?;
        Ok(())
    }
}

const RELEASE_LOCK_SCRIPT: &str =
    "if redis.call('get', KEYS[1]) == ARGV[1] then return redis.call('del', KEYS[1]) else return 0 end";

#[derive(Clone)]
struct RedisPlayerLocks {
    connection: MultiplexedConnection,
    expiry: Duration,
    wait: Duration,
    retry: Duration,
}

#[async_trait]
impl PlayerLocks for RedisPlayerLocks {
    async fn acquire(&self, key: &str) -> anyhow::Result<Option<LockToken>> {
        let token = uuid::Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.wait;
        loop {
            let mut connection = self.connection.clone();
            let claimed: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(self.expiry.as_millis() as u64)
                .query_async(&mut connection)
                .await
                .context("lock service unreachable")?;
            if claimed.is_some() {
                return Ok(Some(LockToken {
                    key: key.to_string(),
                    token,
                }));
            }
            if Instant::now() + self.retry > deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.retry).await;
        }
    }

    async fn release(&self, lock: &LockToken) -> anyhow::Result<()> {
        let mut connection = self.connection.clone();
        let _: i64 = redis::cmd("EVAL")
            .arg(RELEASE_LOCK_SCRIPT)
            .arg(1)
            .arg(&lock.key)
            .arg(&lock.token)
            .query_async(&mut connection)
            .await
            .context("failed to release player lock")?;
        Ok(())
    }
}

#[derive(Clone)]
struct DynamoPlayerDirectory {
    client: DynamoClient,
    table_name: String,
}

impl DynamoPlayerDirectory {
    async fn from_env() -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Ok(endpoint) = std::env::var("DYNAMODB_ENDPOINT") {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;
        Self {
            client: DynamoClient::new(&config),
            table_name: std::env::var("PLAYERS_TABLE")
                .ok()
                .unwrap_or_else(|| "players".to_string()),
        }
    }
}

#[async_trait]
impl PlayerDirectory for DynamoPlayerDirectory {
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

fn string_field(item: &HashMap<String, AttributeValue>, name: &str) -> anyhow::Result<String> {
    item.get(name)
        .and_then(|value| value.as_s().ok())
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("player item missing string field {name}"))
}

fn number_field(item: &HashMap<String, AttributeValue>, name: &str) -> anyhow::Result<i64> {
    item.get(name)
        .and_then(|value| value.as_n().ok())
        .and_then(|value| value.parse::<i64>().ok())
        .ok_or_else(|| anyhow::anyhow!("player item missing numeric field {name}"))
}

fn player_lock_key(player_id: &str) -> String {
    format!("lock:player:{player_id}")
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

        let challenges = RedisChallengeSource {
            connection: connection.clone(),
            stream: std::env::var("BATTLE_SUBMISSION_STREAM")
                .ok()
                .unwrap_or_else(|| "battle.challenges".to_string()),
            group: std::env::var("BATTLE_SUBMISSION_GROUP")
                .ok()
                .unwrap_or_else(|| "arena-battle-service".to_string()),
            consumer: std::env::var("BATTLE_CONSUMER_NAME")
                .ok()
                .unwrap_or_else(|| "arena-battle-service".to_string()),
        };
        challenges.ensure_group().await?;

        let reports = RedisResultSink {
            connection: connection.clone(),
            stream: std::env::var("BATTLE_RESULT_STREAM")
                .ok()
                .unwrap_or_else(|| "battle.results".to_string()),
        };

        let locks = RedisPlayerLocks {
            connection,
            expiry: Duration::from_millis(
                std::env::var("PLAYER_LOCK_EXPIRY_MS")
                    .ok()
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(5_000),
            ),
            wait: Duration::from_millis(
                std::env::var("PLAYER_LOCK_WAIT_MS")
                    .ok()
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(3_000),
            ),
            retry: Duration::from_millis(
                std::env::var("PLAYER_LOCK_RETRY_MS")
                    .ok()
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(500),
            ),
        };

        let maximum_turns = std::env::var("MAX_BATTLE_TURNS")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(DEFAULT_MAX_BATTLE_TURNS);
        let max_defense = std::env::var("MAX_DEFENSE")
            .ok()
            .and_then(|value| value.parse::<i32>().ok())
            .unwrap_or(DEFAULT_MAX_DEFENSE);

        Ok(Self {
            challenges: Arc::new(challenges),
            reports: Arc::new(reports),
            players: Arc::new(DynamoPlayerDirectory::from_env().await),
            locks: Arc::new(locks),
            executor: Arc::new(BattleExecutor::new(
                Arc::new(RandomBattleRuler::new(max_defense)),
                maximum_turns,
            )),
            batch_size: std::env::var("BATTLE_BATCH_SIZE")
                .ok()
                .and_then(|value| value.parse::<usize>().ok())
                .unwrap_or(50),
            poll_interval: Duration::from_millis(
                std::env::var("BATTLE_POLL_INTERVAL_MS")
                    .ok()
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(10),
            ),
            error_pause: Duration::from_millis(
                std::env::var("BATTLE_ERROR_PAUSE_MS")
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
            std::env::var("RUST_LOG").unwrap_or_else(|_| "arena_battle_service=debug".to_string()),
        )
        .init();

    let state = AppState::from_env().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_state = state.clone();
    let worker = tokio::spawn(async move {
        run_battle_worker(worker_state, shutdown_rx).await;
    });

    tokio::signal::ctrl_c().await?;
    info!("arena-battle-service shutting down");
    let _ = shutdown_tx.send(true);
    let _ = worker.await;
    Ok(())
}

async fn run_battle_worker(state: AppState, mut shutdown: watch::Receiver<bool>) {
    info!(batch_size = state.batch_size, "battle worker started");
    if let Err(error) = drain_pending(&state).await {
        warn!(error = %error, "failed to drain pending battle submissions");
    }

    let mut pending_acks: Vec<String> = Vec::new();
    loop {
        if *shutdown.borrow() {
            info!("battle worker observed shutdown signal");
            break;
        }

        match run_iteration(&state, &mut pending_acks).await {
            Ok(()) => pause(&mut shutdown, state.poll_interval).await,
            Err(error) => {
                warn!(error = %error, "battle worker iteration failed, pausing before retry");
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

/// Retries this consumer's delivered-but-unacknowledged entries left behind
/// by a previous run. Entries that still cannot be processed (sustained lock
/// contention) are attempted once and left pending for the next restart.
async fn drain_pending(state: &AppState) -> anyhow::Result<()> {
    let mut attempted: HashSet<String> = HashSet::new();
    loop {
        let entries = state
            .challenges
            .read_batch(ReadPosition::Pending, state.batch_size)
            .await?;
        let fresh: Vec<ChallengeEntry> = entries
            .into_iter()
            .filter(|entry| attempted.insert(entry.delivery_id.clone()))
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }

        info!(count = fresh.len(), "retrying battle submissions left pending by a previous run");
        let acks = process_batch(state, fresh).await;
        state.challenges.acknowledge(&acks).await?;
    }
}

/// One loop pass: acknowledge everything fully processed last pass, read a
/// batch of new entries, resolve each concurrently, and remember which
/// delivery ids may be acknowledged next pass.
async fn run_iteration(state: &AppState, pending_acks: &mut Vec<String>) -> anyhow::Result<()> {
    if !pending_acks.is_empty() {
        state.challenges.acknowledge(pending_acks).await?;
        pending_acks.clear();
    }

    let entries = state
        .challenges
        .read_batch(ReadPosition::New, state.batch_size)
        .await?;
    if entries.is_empty() {
        return Ok(());
    }

    let acks = process_batch(state, entries).await;
    pending_acks.extend(acks);
    Ok(())
}

async fn process_batch(state: &AppState, entries: Vec<ChallengeEntry>) -> Vec<String> {
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
            Err(error) => warn!(error = %error, "battle task join failed"),
        }
    }
    acks
}

enum BattleAttempt {
    Completed,
    Contended,
    MissingPlayer,
}

/// Returns the delivery id when the entry is finished with, one way or the
/// other. `None` leaves the entry unacknowledged for redelivery.
async fn process_entry(state: &AppState, entry: ChallengeEntry) -> Option<String> {
    let challenge: BattleChallenge = match serde_json::from_str(&entry.payload) {
        Ok(challenge) => challenge,
        Err(error) => {
            warn!(
                delivery_id = %entry.delivery_id,
                error = %error,
                "dropping undecodable battle submission"
            );
            return Some(entry.delivery_id);
        }
    };

    if challenge.requester_id == challenge.opponent_id {
        warn!(
            player_id = %challenge.requester_id,
            delivery_id = %entry.delivery_id,
            "dropping self-battle submission"
        );
        return Some(entry.delivery_id);
    }

    match resolve_battle(state, &challenge).await {
        Ok(BattleAttempt::Completed) => Some(entry.delivery_id),
        Ok(BattleAttempt::Contended) => {
            info!(
                requester_id = %challenge.requester_id,
                opponent_id = %challenge.opponent_id,
                delivery_id = %entry.delivery_id,
                "player locks contended, leaving submission for redelivery"
            );
            None
        }
        Ok(BattleAttempt::MissingPlayer) => {
            warn!(
                requester_id = %challenge.requester_id,
                opponent_id = %challenge.opponent_id,
                delivery_id = %entry.delivery_id,
                "dropping battle submission for unknown player"
            );
            Some(entry.delivery_id)
        }
        Err(error) => {
            warn!(
                requester_id = %challenge.requester_id,
                opponent_id = %challenge.opponent_id,
                delivery_id = %entry.delivery_id,
                error = %error,
                "battle resolution failed, leaving submission for redelivery"
            );
            None
        }
    }
}

async fn resolve_battle(
    state: &AppState,
    challenge: &BattleChallenge,
) -> anyhow::Result<BattleAttempt> {
    let Some(requester) = state.players.find_by_id(&challenge.requester_id).await? else {
        return Ok(BattleAttempt::MissingPlayer);
    };
    let Some(opponent) = state.players.find_by_id(&challenge.opponent_id).await? else {
        return Ok(BattleAttempt::MissingPlayer);
    };

    // Locks are taken in call order, requester first. A reversed submission
    // for the same pair can contend on the second acquisition; the wait
    // timeout turns that into a redelivery instead of a deadlock.
    let Some(requester_lock) = state.locks.acquire(&player_lock_key(&requester.id)).await? else {
        return Ok(BattleAttempt::Contended);
    };
    let opponent_lock = match state.locks.acquire(&player_lock_key(&opponent.id)).await {
        Ok(Some(lock)) => lock,
        Ok(None) => {
            state.locks.release(&requester_lock).await?;
            return Ok(BattleAttempt::Contended);
        }
        Err(error) => {
            if let Err(release_error) = state.locks.release(&requester_lock).await {
                warn!(error = %release_error, "failed to release requester lock");
            }
            return Err(error);
        }
    };

    let result = state.executor.execute(&requester, &opponent);
    let published = state.reports.publish(&result).await;
    if published.is_ok() {
        info!(
            requester_id = %requester.id,
            opponent_id = %opponent.id,
            requester_outcome = ?result.requester.outcome,
            turns = result.requester.actions.len(),
            "battle resolved"
        );
    }

    // Release in reverse acquisition order on every path.
    let opponent_released = state.locks.release(&opponent_lock).await;
    let requester_released = state.locks.release(&requester_lock).await;
    published?;
    opponent_released?;
    requester_released?;

    Ok(BattleAttempt::Completed)
}
