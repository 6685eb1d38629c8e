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

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use arena_common::{
    BattleChallenge, BattleRequest, BattleResponse, DEFAULT_BASE_HIT_POINTS,
    DEFAULT_HIT_POINTS_PER_DEFENSE, DEFAULT_INITIAL_GOLD, DEFAULT_INITIAL_SILVER,
    DEFAULT_MAX_ATTACK, DEFAULT_MAX_DEFENSE, DEFAULT_MAX_POINTS_TO_DISTRIBUTE, DEFAULT_MIN_ATTACK,
    DEFAULT_MIN_DEFENSE, LeaderboardEntry, LeaderboardItem, LeaderboardResponse, NewPlayerRequest,
    Player, SettlementReport, initial_hit_points, report_channel_for, to_battle_response,
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::{Client as DynamoClient, types::AttributeValue};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

#[derive(Clone)]
struct AppState {
    players: Arc<dyn PlayerDirectory>,
    challenges: Arc<dyn ChallengePublisher>,
    leaderboard: Arc<dyn LeaderboardReader>,
    report_events_tx: broadcast::Sender<ReportEvent>,
    report_channel_prefix: String,
    report_wait: Duration,
    leaderboard_limit: usize,
    stats: BattleStatsSettings,
}

#[derive(Clone)]
struct BattleStatsSettings {
    min_attack: i32,
    max_attack: i32,
    min_defense: i32,
    max_defense: i32,
    max_points_to_distribute: i32,
    base_hit_points: i32,
    hit_points_per_defense: i32,
    initial_gold: i64,
    initial_silver: i64,
}

/// One settlement report picked up from the notification bus, fanned out to
/// every in-flight battle waiter.
#[derive(Debug, Clone)]
struct ReportEvent {
    channel: String,
    report: SettlementReport,
}

#[async_trait]
trait PlayerDirectory: Send + Sync {
    async fn find_by_id(&self, id: &str) -> anyhow::Result<Option<Player>>;
    async fn save(&self, player: &Player) -> anyhow::Result<()>;
}

#[async_trait]
trait ChallengePublisher: Send + Sync {
    async fn publish(&self, challenge: &BattleChallenge) -> anyhow::Result<()>;
}

#[async_trait]
trait LeaderboardReader: Send + Sync {
    async fn all_entries(&self) -> anyhow::Result<Vec<LeaderboardEntry>>;
}

#[derive(Clone)]
struct RedisChallengePublisher {
    connection: redis::aio::MultiplexedConnection,
    stream: String,
}

#[async_trait]
impl ChallengePublisher for RedisChallengePublisher {
    async fn publish(&self, challenge: &BattleChallenge) -> anyhow::Result<()> {
        let payload =
            serde_json::to_string(challenge).context("failed to encode battle challenge")?;
        let mut connection = self.connection.clone();
        let delivery_id: String = connection
            .xadd(&self.stream, "*", &[("data", payload.as_str())])
            .await
            .context("failed to append battle challenge")?;

        info!(
            requester_id = %challenge.requester_id,
            opponent_id = %challenge.opponent_id,
            delivery_id = %delivery_id,
            "battle challenge enqueued"
        );
        Ok(())
    }
}

#[derive(Clone)]
struct DynamoPlayerDirectory {
    client: DynamoClient,
    table_name: String,
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
struct DynamoLeaderboardReader {
    client: DynamoClient,
    table_name: String,
}

#[async_trait]
impl LeaderboardReader for DynamoLeaderboardReader {
    // TODO: replace the scan with a score-indexed GSI once the table grows.
    async fn all_entries(&self) -> anyhow::Result<Vec<LeaderboardEntry>> {
        let output = self
            .client
            .scan()
            .table_name(&self.table_name)
            .send()
            .await
            .context("failed to scan leaderboard")?;

        let mut entries = Vec::new();
        for item in output.items() {
            entries.push(LeaderboardEntry {
                id: string_field(item, "id")?,
                username: string_field(item, "username")?,
                score: number_field(item, "score")?,
            });
        }
        Ok(entries)
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

struct GatewayRuntime {
    state: AppState,
    redis_client: redis::Client,
}

impl GatewayRuntime {
    async fn from_env() -> anyhow::Result<Self> {
        let redis_url = std::env::var("ARENA_REDIS_URL")
            .ok()
            .unwrap_or_else(|| "redis://redis:6379".to_string());
        let redis_client = redis::Client::open(redis_url).context("invalid redis url")?;
        let connection = redis_client
            .get_multiplexed_async_connection()
            .await
            .context("failed to connect to redis")?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Ok(endpoint) = std::env::var("DYNAMODB_ENDPOINT") {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;
        let dynamo = DynamoClient::new(&config);

        let (report_events_tx, _) = broadcast::channel(512);
        let state = AppState {
            players: Arc::new(DynamoPlayerDirectory {
                client: dynamo.clone(),
                table_name: std::env::var("PLAYERS_TABLE")
                    .ok()
                    .unwrap_or_else(|| "players".to_string()),
            }),
            challenges: Arc::new(RedisChallengePublisher {
                connection,
                stream: std::env::var("BATTLE_SUBMISSION_STREAM")
                    .ok()
                    .unwrap_or_else(|| "battle.challenges".to_string()),
            }),
            leaderboard: Arc::new(DynamoLeaderboardReader {
                client: dynamo,
                table_name: std::env::var("LEADERBOARD_TABLE")
                    .ok()
                    .unwrap_or_else(|| "leaderboard".to_string()),
            }),
            report_events_tx,
            report_channel_prefix: std::env::var("BATTLE_REPORT_CHANNEL_PREFIX")
                .ok()
                .unwrap_or_else(|| "battle.reports".to_string()),
            report_wait: Duration::from_secs(
                std::env::var("BATTLE_REPORT_WAIT_SECONDS")
                    .ok()
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(10)
                    .max(1),
            ),
            leaderboard_limit: std::env::var("LEADERBOARD_MAX_ENTRIES")
                .ok()
                .and_then(|value| value.parse::<usize>().ok())
                .unwrap_or(20),
            stats: BattleStatsSettings::from_env(),
        };

        Ok(Self {
            state,
            redis_client,
        })
    }
}

impl BattleStatsSettings {
    fn from_env() -> Self {
        Self {
            min_attack: env_i32("MIN_ATTACK", DEFAULT_MIN_ATTACK),
            max_attack: env_i32("MAX_ATTACK", DEFAULT_MAX_ATTACK),
            min_defense: env_i32("MIN_DEFENSE", DEFAULT_MIN_DEFENSE),
            max_defense: env_i32("MAX_DEFENSE", DEFAULT_MAX_DEFENSE),
            max_points_to_distribute: env_i32(
                "MAX_POINTS_TO_DISTRIBUTE",
                DEFAULT_MAX_POINTS_TO_DISTRIBUTE,
            ),
            base_hit_points: env_i32("BASE_HIT_POINTS", DEFAULT_BASE_HIT_POINTS),
            hit_points_per_defense: env_i32(
                "HIT_POINTS_PER_DEFENSE",
                DEFAULT_HIT_POINTS_PER_DEFENSE,
            ),
            initial_gold: std::env::var("INITIAL_GOLD")
                .ok()
                .and_then(|value| value.parse::<i64>().ok())
                .unwrap_or(DEFAULT_INITIAL_GOLD),
            initial_silver: std::env::var("INITIAL_SILVER")
                .ok()
                .and_then(|value| value.parse::<i64>().ok())
                .unwrap_or(DEFAULT_INITIAL_SILVER),
        }
    }
}

fn env_i32(name: &str, default: i32) -> i32 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<i32>().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "arena_gateway_service=debug,tower_http=info".to_string()),
        )
        .init();

    let runtime = GatewayRuntime::from_env().await?;
    let state = runtime.state.clone();

    let listener_client = runtime.redis_client.clone();
    let listener_pattern = format!("{}.*", state.report_channel_prefix);
    let listener_events_tx = state.report_events_tx.clone();
    tokio::task::spawn_blocking(move || {
        run_report_listener(listener_client, listener_pattern, listener_events_tx);
    });

    let app = build_router(state);
    let bind_addr = parse_bind_addr("GATEWAY_SERVICE_BIND", "0.0.0.0:8080")?;
    info!(%bind_addr, "arena-gateway-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/players", post(create_player_handler))
        .route("/v1/players/{player_id}", get(get_player_handler))
        .route("/v1/battles", post(submit_battle_handler))
        .route("/v1/leaderboard", get(leaderboard_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn parse_bind_addr(var_name: &str, default: &str) -> anyhow::Result<SocketAddr> {
    let value = std::env::var(var_name)
        .ok()
        .unwrap_or_else(|| default.to_string());
    value.parse().context(format!("invalid {var_name}"))
}

/// Bridges the notification bus into the process: one pattern subscription
/// feeding every waiter through the broadcast channel. Reconnects after any
/// subscription failure.
fn run_report_listener(
    client: redis::Client,
    pattern: String,
    events_tx: broadcast::Sender<ReportEvent>,
) {
    loop {
        let mut connection = match client.get_connection() {
            Ok(connection) => connection,
            Err(error) => {
                warn!(error = %error, "report listener failed to connect, retrying");
                std::thread::sleep(Duration::from_millis(500));
                continue;
            }
        };
        let mut pubsub = connection.as_pubsub();
        if let Err(error) = pubsub.psubscribe(&pattern) {
            warn!(error = %error, pattern = %pattern, "report listener failed to subscribe");
            std::thread::sleep(Duration::from_millis(500));
            continue;
        }
        info!(pattern = %pattern, "report listener subscribed");

        loop {
            let message = match pubsub.get_message() {
                Ok(message) => message,
                Err(error) => {
                    warn!(error = %error, "report listener receive error, reconnecting");
                    break;
                }
            };

            let channel = message.get_channel_name().to_string();
            let payload: String = match message.get_payload() {
                Ok(payload) => payload,
                Err(error) => {
                    warn!(channel = %channel, error = %error, "undecodable report payload");
                    continue;
                }
            };
            let report = match serde_json::from_str::<SettlementReport>(&payload) {
                Ok(report) => report,
                Err(error) => {
                    warn!(channel = %channel, error = %error, "invalid settlement report");
                    continue;
                }
            };

            if events_tx.receiver_count() > 0
                && let Err(error) = events_tx.send(ReportEvent { channel, report })
            {
                warn!(error = %error, "failed to fan out settlement report");
            }
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": "arena-gateway-service"}))
}

async fn create_player_handler(
    State(state): State<AppState>,
    Json(request): Json<NewPlayerRequest>,
) -> Result<Json<Player>, ApiError> {
    let stats = &state.stats;
    let username = request.username.trim().to_string();
    if username.is_empty() {
        return Err(ApiError::bad_request("username is required"));
    }
    if !(stats.min_attack..=stats.max_attack).contains(&request.attack) {
        return Err(ApiError::bad_request(format!(
            "attack must be between {} and {}",
            stats.min_attack, stats.max_attack
        )));
    }
    if !(stats.min_defense..=stats.max_defense).contains(&request.defense) {
        return Err(ApiError::bad_request(format!(
            "defense must be between {} and {}",
            stats.min_defense, stats.max_defense
        )));
    }
    if request.attack + request.defense > stats.max_points_to_distribute {
        return Err(ApiError::bad_request(format!(
            "attack and defense together may not exceed {}",
            stats.max_points_to_distribute
        )));
    }

    let player = Player {
        id: uuid::Uuid::new_v4().to_string(),
        username,
        description: request.description,
        gold: stats.initial_gold,
        silver: stats.initial_silver,
        attack: request.attack,
        defense: request.defense,
        hit_points: initial_hit_points(
            request.defense,
            stats.base_hit_points,
            stats.hit_points_per_defense,
        ),
    };
    state
        .players
        .save(&player)
        .await
        .map_err(|error| ApiError::bad_gateway(format!("failed to save player: {error}")))?;

    info!(player_id = %player.id, username = %player.username, "player created");
    Ok(Json(player))
}

async fn get_player_handler(
    State(state): State<AppState>,
    Path(player_id): Path<String>,
) -> Result<Json<Player>, ApiError> {
    let player = state
        .players
        .find_by_id(&player_id)
        .await
        .map_err(|error| ApiError::bad_gateway(format!("failed to load player: {error}")))?
        .ok_or_else(|| ApiError::not_found(format!("player {player_id} not found")))?;
    Ok(Json(player))
}

async fn submit_battle_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<BattleRequest>,
) -> Result<Json<BattleResponse>, ApiError> {
    let requester_id = headers
        .get("x-player-id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| ApiError::bad_request("missing x-player-id header"))?;

    let response = submit_battle(&state, &requester_id, &request.opponent_id).await?;
    Ok(Json(response))
}

/// The request/response bridge: eligibility checks, subscribe, enqueue, then
/// wait for the settlement report or give up at the deadline. A timeout only
/// abandons the waiting; the enqueued battle still resolves in the pipeline.
async fn submit_battle(
    state: &AppState,
    requester_id: &str,
    opponent_id: &str,
) -> Result<BattleResponse, ApiError> {
    if requester_id == opponent_id {
        return Err(ApiError::bad_request("fighting yourself is not allowed"));
    }

    let opponent = state
        .players
        .find_by_id(opponent_id)
        .await
        .map_err(|error| ApiError::bad_gateway(format!("failed to load opponent: {error}")))?
        .ok_or_else(|| ApiError::not_found("opponent not found"))?;
    if opponent.is_broke() {
        return Err(ApiError::precondition_failed(
            "the opponent has nothing left to take",
        ));
    }
    let requester = state
        .players
        .find_by_id(requester_id)
        .await
        .map_err(|error| ApiError::bad_gateway(format!("failed to load requester: {error}")))?
        .ok_or_else(|| ApiError::not_found("requester not found"))?;

    let channel = report_channel_for(&state.report_channel_prefix, &requester.id, &opponent.id);
    // Subscribe before the submission is enqueued so a fast report cannot
    // slip past the waiter.
    let mut report_events = state.report_events_tx.subscribe();

    state
        .challenges
        .publish(&BattleChallenge {
            requester_id: requester.id.clone(),
            opponent_id: opponent.id.clone(),
            requested_at: Utc::now(),
        })
        .await
        .map_err(|error| ApiError::bad_gateway(format!("failed to enqueue battle: {error}")))?;

    let report = wait_for_report(
        &mut report_events,
        &channel,
        &requester.id,
        state.report_wait,
    )
    .await?;

    Ok(to_battle_response(&requester.username, &report))
}

async fn wait_for_report(
    events: &mut broadcast::Receiver<ReportEvent>,
    channel: &str,
    requester_id: &str,
    wait: Duration,
) -> Result<SettlementReport, ApiError> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(event)) => {
                if event.channel == channel && event.report.user_id == requester_id {
                    return Ok(event.report);
                }
            }
            Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                warn!(channel = %channel, skipped, "battle waiter lagged report events");
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => {
                return Err(ApiError::bad_gateway("report listener stopped"));
            }
            Err(_) => {
                return Err(ApiError::gateway_timeout("battle processing timed out"));
            }
        }
    }
}

async fn leaderboard_handler(
    State(state): State<AppState>,
) -> Result<Json<LeaderboardResponse>, ApiError> {
    let mut entries = state
        .leaderboard
        .all_entries()
        .await
        .map_err(|error| ApiError::bad_gateway(format!("failed to load leaderboard: {error}")))?;

    entries.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| b.username.cmp(&a.username))
    });
    entries.truncate(state.leaderboard_limit);

    let entries = entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| LeaderboardItem {
            user_id: entry.id,
            username: entry.username,
            position: index as u32 + 1,
            score: entry.score,
        })
        .collect();
    Ok(Json(LeaderboardResponse { entries }))
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn precondition_failed(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::PRECONDITION_FAILED,
            message: message.into(),
        }
    }

    fn gateway_timeout(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::GATEWAY_TIMEOUT,
            message: message.into(),
        }
    }

    fn bad_gateway(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(status = %self.status, message = %self.message, "request failed");
        (
            self.status,
            Json(serde_json::json!({"error": self.message})),
        )
            .into_response()
    }
}
