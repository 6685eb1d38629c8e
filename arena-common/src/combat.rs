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

use std::sync::Arc;

use rand::Rng;

use crate::{
    ActionKind, BattleAction, BattleOutcome, BattleResult, BattleSideResult, Player, PlayerId,
};

/// Per-battle snapshot of one combatant, derived once from the persisted
/// record and mutated only by the executor for the lifetime of the battle.
#[derive(Debug, Clone)]
pub struct CombatantStatus {
    pub id: PlayerId,
    pub original_attack: i32,
    pub attack_left: i32,
    pub original_defense: i32,
    pub hit_points_total: i32,
    pub hit_points_left: i32,
}

impl CombatantStatus {
    pub fn from_player(player: &Player) -> Self {
        Self {
            id: player.id.clone(),
            original_attack: player.attack,
            attack_left: player.attack,
            original_defense: player.defense,
            hit_points_total: player.hit_points,
            hit_points_left: player.hit_points,
        }
    }
}

pub trait BattleRuler: Send + Sync {
    fn is_hit(&self, receiver: &CombatantStatus) -> bool;
    fn calculate_damage(&self, attacker: &CombatantStatus) -> i32;
    fn calculate_new_attack(&self, receiver: &CombatantStatus, attacker: &CombatantStatus) -> i32;
}

/// Production ruler. The dodge probability gates the hit: a draw at or below
/// it lands the blow. Defense 0 pushes the probability above 1 (always hit);
/// defense at the maximum leaves a 1/max chance.
pub struct RandomBattleRuler {
    max_defense: i32,
}

impl RandomBattleRuler {
    pub fn new(max_defense: i32) -> Self {
        Self { max_defense }
    }

    fn is_hit_with_draw(&self, receiver: &CombatantStatus, draw: f64) -> bool {
        let dodge_probability = (f64::from(self.max_defense + 1)
            - f64::from(receiver.original_defense))
            / f64::from(self.max_defense);
        draw <= dodge_probability
    }
}

impl BattleRuler for RandomBattleRuler {
    fn is_hit(&self, receiver: &CombatantStatus) -> bool {
        self.is_hit_with_draw(receiver, rand::rng().random::<f64>())
    }

    fn calculate_damage(&self, attacker: &CombatantStatus) -> i32 {
        attacker.attack_left
    }

    fn calculate_new_attack(&self, receiver: &CombatantStatus, attacker: &CombatantStatus) -> i32 {
        let cap = f64::from(receiver.original_attack) * 0.5;
        let percentage_taken = f64::from(attacker.attack_left) / f64::from(receiver.hit_points_total);
        let new_attack =
            f64::from(receiver.attack_left) - f64::from(receiver.attack_left) * percentage_taken;

        new_attack.max(cap).round() as i32
    }
}

/// Runs the full alternating-turn loop for one battle. Even turns the
/// requester attacks, odd turns the opponent. The loop stops when either
/// side runs out of hit points or the turn cap is reached.
pub struct BattleExecutor {
    ruler: Arc<dyn BattleRuler>,
    maximum_turns: u32,
}

impl BattleExecutor {
    pub fn new(ruler: Arc<dyn BattleRuler>, maximum_turns: u32) -> Self {
        Self {
            ruler,
            maximum_turns,
        }
    }

    pub fn execute(&self, requester: &Player, opponent: &Player) -> BattleResult {
        let mut requester_status = CombatantStatus::from_player(requester);
        let mut opponent_status = CombatantStatus::from_player(opponent);

        let mut actions = Vec::new();
        let mut turn = 0u32;
        loop {
            if turn % 2 == 0 {
                let (action, hit_points_left, attack_left) =
                    self.run_turn(&requester_status, &opponent_status);
                if action.action == ActionKind::Hit {
                    opponent_status.hit_points_left = hit_points_left;
                    opponent_status.attack_left = attack_left;
                }
                actions.push(action);
            } else {
                let (action, hit_points_left, attack_left) =
                    self.run_turn(&opponent_status, &requester_status);
                if action.action == ActionKind::Hit {
                    requester_status.hit_points_left = hit_points_left;
                    requester_status.attack_left = attack_left;
                }
                actions.push(action);
            }

            turn += 1;
            if requester_status.hit_points_left <= 0
                || opponent_status.hit_points_left <= 0
                || turn >= self.maximum_turns
            {
                break;
            }
        }

        let requester_side = BattleSideResult {
            user_id: requester.id.clone(),
            outcome: outcome_for(
                requester_status.hit_points_left,
                opponent_status.hit_points_left,
            ),
            actions: actions.clone(),
        };
        let opponent_side = BattleSideResult {
            user_id: opponent.id.clone(),
            outcome: outcome_for(
                opponent_status.hit_points_left,
                requester_status.hit_points_left,
            ),
            actions,
        };

        BattleResult {
            requester: requester_side,
            opponent: opponent_side,
        }
    }

    // The recorded damage is the attacker's value before this turn's decay
    // lands on the receiver.
    fn run_turn(
        &self,
        attacker: &CombatantStatus,
        receiver: &CombatantStatus,
    ) -> (BattleAction, i32, i32) {
        if self.ruler.is_hit(receiver) {
            let action = BattleAction {
                from: attacker.id.clone(),
                to: receiver.id.clone(),
                action: ActionKind::Hit,
                damage: attacker.attack_left,
            };
            let hit_points_left = receiver.hit_points_left - self.ruler.calculate_damage(attacker);
            let attack_left = self.ruler.calculate_new_attack(receiver, attacker);
            return (action, hit_points_left, attack_left);
        }

        let action = BattleAction {
            from: attacker.id.clone(),
            to: receiver.id.clone(),
            action: ActionKind::Miss,
            damage: 0,
        };
        (action, receiver.hit_points_left, receiver.attack_left)
    }
}

fn outcome_for(own_hit_points: i32, other_hit_points: i32) -> BattleOutcome {
    if own_hit_points > 0 && other_hit_points > 0 {
        BattleOutcome::Draw
    } else if own_hit_points <= 0 && other_hit_points <= 0 {
        BattleOutcome::Draw
    } else if own_hit_points <= 0 {
        BattleOutcome::Defeat
    } else {
        BattleOutcome::Victory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_MAX_BATTLE_TURNS;

    fn player(id: &str, attack: i32, defense: i32, hit_points: i32) -> Player {
        Player {
            id: id.to_string(),
            username: format!("player-{id}"),
            description: String::new(),
            gold: 1_000,
            silver: 10_000,
            attack,
            defense,
            hit_points,
        }
    }

    fn status(original_attack: i32, attack_left: i32, defense: i32, hit_points: i32) -> CombatantStatus {
        CombatantStatus {
            id: "s".to_string(),
            original_attack,
            attack_left,
            original_defense: defense,
            hit_points_total: hit_points,
            hit_points_left: hit_points,
        }
    }

    /// Hits only the configured receiver and always deals a lethal blow.
    struct ScriptedRuler {
        hit_receiver: &'static str,
        damage: i32,
    }

    impl BattleRuler for ScriptedRuler {
        fn is_hit(&self, receiver: &CombatantStatus) -> bool {
            receiver.id == self.hit_receiver
        }

        fn calculate_damage(&self, _attacker: &CombatantStatus) -> i32 {
            self.damage
        }

        fn calculate_new_attack(
            &self,
            _receiver: &CombatantStatus,
            _attacker: &CombatantStatus,
        ) -> i32 {
            0
        }
    }

    struct NeverHitRuler;

    impl BattleRuler for NeverHitRuler {
        fn is_hit(&self, _receiver: &CombatantStatus) -> bool {
            false
        }

        fn calculate_damage(&self, attacker: &CombatantStatus) -> i32 {
            attacker.attack_left
        }

        fn calculate_new_attack(
            &self,
            receiver: &CombatantStatus,
            _attacker: &CombatantStatus,
        ) -> i32 {
            receiver.attack_left
        }
    }

    #[test]
    fn requester_wins_in_one_hit() {
        let requester = player("1", 70, 50, 100);
        let opponent = player("2", 60, 30, 100);
        let executor = BattleExecutor::new(
            Arc::new(ScriptedRuler {
                hit_receiver: "2",
                damage: 100,
            }),
            DEFAULT_MAX_BATTLE_TURNS,
        );

        let result = executor.execute(&requester, &opponent);

        assert_eq!(result.requester.outcome, BattleOutcome::Victory);
        assert_eq!(result.opponent.outcome, BattleOutcome::Defeat);
        assert_eq!(result.requester.actions, result.opponent.actions);
        assert_eq!(
            result.requester.actions,
            vec![BattleAction {
                from: "1".to_string(),
                to: "2".to_string(),
                action: ActionKind::Hit,
                damage: 70,
            }]
        );
    }

    #[test]
    fn requester_loses_after_a_dodged_opening_turn() {
        let requester = player("1", 70, 50, 100);
        let opponent = player("2", 60, 30, 100);
        let executor = BattleExecutor::new(
            Arc::new(ScriptedRuler {
                hit_receiver: "1",
                damage: 100,
            }),
            DEFAULT_MAX_BATTLE_TURNS,
        );

        let result = executor.execute(&requester, &opponent);

        assert_eq!(result.requester.outcome, BattleOutcome::Defeat);
        assert_eq!(result.opponent.outcome, BattleOutcome::Victory);
        assert_eq!(result.requester.actions, result.opponent.actions);
        assert_eq!(
            result.requester.actions,
            vec![
                BattleAction {
                    from: "1".to_string(),
                    to: "2".to_string(),
                    action: ActionKind::Miss,
                    damage: 0,
                },
                BattleAction {
                    from: "2".to_string(),
                    to: "1".to_string(),
                    action: ActionKind::Hit,
                    damage: 60,
                },
            ]
        );
    }

    #[test]
    fn endless_battle_is_cut_off_at_the_turn_cap_as_a_draw() {
        let requester = player("1", 10, 10, 1);
        let opponent = player("2", 10, 10, 1);
        let executor = BattleExecutor::new(Arc::new(NeverHitRuler), DEFAULT_MAX_BATTLE_TURNS);

        let result = executor.execute(&requester, &opponent);

        assert_eq!(result.requester.outcome, BattleOutcome::Draw);
        assert_eq!(result.opponent.outcome, BattleOutcome::Draw);
        assert_eq!(
            result.requester.actions.len(),
            DEFAULT_MAX_BATTLE_TURNS as usize
        );
        assert_eq!(result.requester.actions, result.opponent.actions);
    }

    #[test]
    fn production_ruler_hit_thresholds_at_the_midpoint_draw() {
        let ruler = RandomBattleRuler::new(crate::DEFAULT_MAX_DEFENSE);
        let cases = [
            (100, false),
            (80, false),
            (52, false),
            (51, true),
            (49, true),
            (20, true),
            (1, true),
            (0, true),
        ];
        for (defense, expected) in cases {
            let receiver = status(70, 70, defense, 100);
            assert_eq!(
                ruler.is_hit_with_draw(&receiver, 0.5),
                expected,
                "defense {defense}"
            );
        }
    }

    #[test]
    fn production_ruler_always_hits_an_undefended_receiver() {
        let ruler = RandomBattleRuler::new(crate::DEFAULT_MAX_DEFENSE);
        let receiver = status(70, 70, 0, 100);
        // Probability is (101 - 0) / 100, above any possible draw.
        assert!(ruler.is_hit_with_draw(&receiver, 0.999_999));
    }

    #[test]
    fn damage_equals_the_attack_the_attacker_has_left() {
        let ruler = RandomBattleRuler::new(crate::DEFAULT_MAX_DEFENSE);
        for attack_left in [100, 50, 1, 0] {
            let attacker = status(100, attack_left, 10, 100);
            assert_eq!(ruler.calculate_damage(&attacker), attack_left);
        }
    }

    #[test]
    fn new_attack_decays_proportionally_and_floors_at_half_the_original() {
        let ruler = RandomBattleRuler::new(crate::DEFAULT_MAX_DEFENSE);
        let attacker = status(10, 10, 10, 100);
        let cases = [(70, 63), (63, 57), (36, 35), (22, 35)];
        for (attack_left, expected) in cases {
            let receiver = status(70, attack_left, 10, 100);
            assert_eq!(
                ruler.calculate_new_attack(&receiver, &attacker),
                expected,
                "attack_left {attack_left}"
            );
        }
    }

    #[test]
    fn combatant_status_starts_from_the_persisted_record() {
        let source = player("1", 70, 50, 200);
        let derived = CombatantStatus::from_player(&source);
        assert_eq!(derived.original_attack, 70);
        assert_eq!(derived.attack_left, 70);
        assert_eq!(derived.original_defense, 50);
        assert_eq!(derived.hit_points_total, 200);
        assert_eq!(derived.hit_points_left, 200);
    }
}
