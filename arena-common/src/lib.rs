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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod combat;

pub const DEFAULT_MAX_BATTLE_TURNS: u32 = 200;
pub const DEFAULT_MIN_ATTACK: i32 = 1;
pub const DEFAULT_MAX_ATTACK: i32 = 100;
pub const DEFAULT_MIN_DEFENSE: i32 = 1;
pub const DEFAULT_MAX_DEFENSE: i32 = 100;
pub const DEFAULT_MAX_POINTS_TO_DISTRIBUTE: i32 = 150;
pub const DEFAULT_BASE_HIT_POINTS: i32 = 100;
pub const DEFAULT_HIT_POINTS_PER_DEFENSE: i32 = 2;
pub const DEFAULT_INITIAL_GOLD: i64 = 1_000;
pub const DEFAULT_INITIAL_SILVER: i64 = 10_000;

pub type PlayerId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Player {
    pub id: PlayerId,
    pub username: String,
    #[serde(default)]
    pub description: String,
    pub gold: i64,
    pub silver: i64,
    pub attack: i32,
    pub defense: i32,
    pub hit_points: i32,
}

impl Player {
    pub fn is_broke(&self) -> bool {
        self.gold <= 0 && self.silver <= 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub id: PlayerId,
    pub username: String,
    pub score: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Hit,
    Miss,
}

/// One turn of the shared battle log. Both participants see the same
/// sequence, in the same order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BattleAction {
    pub from: PlayerId,
    pub to: PlayerId,
    pub action: ActionKind,
    pub damage: i32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BattleOutcome {
    Victory,
    Defeat,
    Draw,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BattleSideResult {
    pub user_id: PlayerId,
    pub outcome: BattleOutcome,
    pub actions: Vec<BattleAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BattleResult {
    pub requester: BattleSideResult,
    pub opponent: BattleSideResult,
}

/// Entry appended to the submission stream when a battle is requested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BattleChallenge {
    pub requester_id: PlayerId,
    pub opponent_id: PlayerId,
    pub requested_at: DateTime<Utc>,
}

/// Final per-participant settlement, published once on the notification
/// channel for the battle pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementReport {
    pub user_id: PlayerId,
    pub battle_result: BattleSideResult,
    pub gained_gold: i64,
    pub lost_gold: i64,
    pub gained_silver: i64,
    pub lost_silver: i64,
    pub settled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPlayerRequest {
    pub username: String,
    #[serde(default)]
    pub description: String,
    pub attack: i32,
    pub defense: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BattleRequest {
    pub opponent_id: PlayerId,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BattleResources {
    pub gold: i64,
    pub silver: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BattleResponse {
    pub username: String,
    pub damage: i64,
    pub misses: u32,
    pub outcome: BattleOutcome,
    pub resources_gain: BattleResources,
    pub resources_lost: BattleResources,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardItem {
    pub user_id: PlayerId,
    pub username: String,
    pub position: u32,
    pub score: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardResponse {
    pub entries: Vec<LeaderboardItem>,
}

/// Notification channel for a battle pair. The channel is a function of the
/// unordered pair, so both sides of a battle map to the same name no matter
/// who requested it.
pub fn report_channel_for(prefix: &str, player_a: &str, player_b: &str) -> String {
    if player_a <= player_b {
        format!("{prefix}.{player_a}.{player_b}")
    } else {
        format!("{prefix}.{player_b}.{player_a}")
    }
}

pub fn initial_hit_points(defense: i32, base_hit_points: i32, hit_points_per_defense: i32) -> i32 {
    base_hit_points + defense * hit_points_per_defense
}

/// Aggregate view of a settlement report, as returned to the requester.
pub fn to_battle_response(username: &str, report: &SettlementReport) -> BattleResponse {
    let damage = report
        .battle_result
        .actions
        .iter()
        .filter(|action| action.action == ActionKind::Hit)
        .map(|action| i64::from(action.damage))
        .sum();
    let misses = report
        .battle_result
        .actions
        .iter()
        .filter(|action| action.action == ActionKind::Miss)
        .count() as u32;

    BattleResponse {
        username: username.to_string(),
        damage,
        misses,
        outcome: report.battle_result.outcome,
        resources_gain: BattleResources {
            gold: report.gained_gold,
            silver: report.gained_silver,
        },
        resources_lost: BattleResources {
            gold: report.lost_gold,
            silver: report.lost_silver,
        },
    }
}
