//! Game state owned by the orchestrator.
//!
//! Exactly one task mutates `GameState`; everyone else reads immutable
//! `GameSnapshot` copies published through an `ArcSwap`.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use solana_sdk::pubkey::Pubkey;

use crate::ledger::accounts::Prediction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Betting,
    Fighting,
    Ended,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Betting => "betting",
            Phase::Fighting => "fighting",
            Phase::Ended => "ended",
        };
        f.write_str(s)
    }
}

/// One chronological log entry. `delta` is -1 for damage, +1 for heal.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HitEntry {
    pub username: String,
    pub message: String,
    pub ts_ms: u64,
    pub delta: i8,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopHitter {
    pub username: String,
    pub hits: u32,
}

/// Display mirror of one on-chain bet. Authoritative values live on-chain;
/// this is what overlays render.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BetSummary {
    pub wallet: String,
    pub username: String,
    pub amount_lamports: u64,
    pub prediction: Prediction,
    pub ts: i64,
}

#[derive(Debug)]
pub struct DamageOutcome {
    /// The boss reached 0 HP on this exact write.
    pub defeated_now: bool,
}

#[derive(Debug)]
pub struct GameState {
    pub phase: Phase,
    pub round_id: u64,
    pub boss_hp: u32,
    pub max_hp: u32,
    initial_hp: u32,
    pub user_hits: HashMap<String, u32>,
    pub chronological: Vec<HitEntry>,
    pub total_hits: u32,
    pub last_hitter: Option<String>,
    pub betting_end_ms: Option<u64>,
    pub fight_end_ms: Option<u64>,
    pub fight_started_ms: Option<u64>,
    pub betting_round_pda: Option<Pubkey>,
    pub escrow_pda: Option<Pubkey>,
    pub on_chain_bets: HashMap<String, BetSummary>,
    pub total_death_bets: u64,
    pub total_survival_bets: u64,
}

impl GameState {
    pub fn new(initial_hp: u32) -> Self {
        Self {
            phase: Phase::Idle,
            round_id: 0,
            boss_hp: initial_hp,
            max_hp: initial_hp,
            initial_hp,
            user_hits: HashMap::new(),
            chronological: Vec::new(),
            total_hits: 0,
            last_hitter: None,
            betting_end_ms: None,
            fight_end_ms: None,
            fight_started_ms: None,
            betting_round_pda: None,
            escrow_pda: None,
            on_chain_bets: HashMap::new(),
            total_death_bets: 0,
            total_survival_bets: 0,
        }
    }

    /// Zero all per-round fields and enter Betting under a fresh round id.
    /// Timer fields are set by the caller once the on-chain init succeeds.
    pub fn begin_betting(&mut self, round_id: u64, betting_round_pda: Pubkey, escrow_pda: Pubkey) {
        self.clear_round();
        self.round_id = round_id;
        self.betting_round_pda = Some(betting_round_pda);
        self.escrow_pda = Some(escrow_pda);
        self.phase = Phase::Betting;
    }

    pub fn reset_to_idle(&mut self) {
        self.clear_round();
        self.phase = Phase::Idle;
    }

    fn clear_round(&mut self) {
        self.round_id = 0;
        self.boss_hp = self.initial_hp;
        self.max_hp = self.initial_hp;
        self.user_hits.clear();
        self.chronological.clear();
        self.total_hits = 0;
        self.last_hitter = None;
        self.betting_end_ms = None;
        self.fight_end_ms = None;
        self.fight_started_ms = None;
        self.betting_round_pda = None;
        self.escrow_pda = None;
        self.on_chain_bets.clear();
        self.total_death_bets = 0;
        self.total_survival_bets = 0;
    }

    /// Apply one unit of damage. Caller must have checked `phase == Fighting`.
    pub fn apply_damage(&mut self, username: &str, message: &str, ts_ms: u64) -> DamageOutcome {
        let was_alive = self.boss_hp > 0;
        self.boss_hp = self.boss_hp.saturating_sub(1);
        self.total_hits += 1;
        *self.user_hits.entry(username.to_string()).or_insert(0) += 1;
        self.last_hitter = Some(username.to_string());
        self.push_entry(username, message, ts_ms, -1);
        DamageOutcome {
            defeated_now: was_alive && self.boss_hp == 0,
        }
    }

    /// Apply one unit of healing. Hit accounting and `last_hitter` are
    /// untouched by heals.
    pub fn apply_heal(&mut self, username: &str, message: &str, ts_ms: u64) {
        self.boss_hp = self.boss_hp.saturating_add(1).min(self.max_hp);
        self.push_entry(username, message, ts_ms, 1);
    }

    fn push_entry(&mut self, username: &str, message: &str, ts_ms: u64, delta: i8) {
        // The chronological log is monotonic per round; source timestamps are
        // kept except when they would run backwards.
        let ts_ms = match self.chronological.last() {
            Some(prev) => ts_ms.max(prev.ts_ms),
            None => ts_ms,
        };
        self.chronological.push(HitEntry {
            username: username.to_string(),
            message: message.to_string(),
            ts_ms,
            delta,
        });
    }

    pub fn top_hitters(&self, n: usize) -> Vec<TopHitter> {
        let mut all: Vec<TopHitter> = self
            .user_hits
            .iter()
            .map(|(username, hits)| TopHitter {
                username: username.clone(),
                hits: *hits,
            })
            .collect();
        all.sort_by(|a, b| b.hits.cmp(&a.hits).then_with(|| a.username.cmp(&b.username)));
        all.truncate(n);
        all
    }

    /// Remaining time on whichever phase timer is active.
    pub fn time_remaining_ms(&self, now_ms: u64) -> Option<u64> {
        let end = match self.phase {
            Phase::Betting => self.betting_end_ms?,
            Phase::Fighting => self.fight_end_ms?,
            _ => return None,
        };
        Some(end.saturating_sub(now_ms))
    }

    pub fn set_on_chain_bets(&mut self, bets: Vec<BetSummary>) {
        self.on_chain_bets = bets.into_iter().map(|b| (b.wallet.clone(), b)).collect();
    }

    pub fn bets_sorted(&self) -> Vec<BetSummary> {
        let mut bets: Vec<BetSummary> = self.on_chain_bets.values().cloned().collect();
        bets.sort_by(|a, b| a.ts.cmp(&b.ts).then_with(|| a.wallet.cmp(&b.wallet)));
        bets
    }

    pub fn snapshot(&self, chat_connected: bool, now_ms: u64) -> GameSnapshot {
        let recent = self
            .chronological
            .iter()
            .rev()
            .take(10)
            .rev()
            .cloned()
            .collect();
        GameSnapshot {
            phase: self.phase,
            round_id: self.round_id,
            boss_hp: self.boss_hp,
            max_hp: self.max_hp,
            total_hits: self.total_hits,
            top_hitters: self.top_hitters(3),
            last_hitter: self.last_hitter.clone(),
            recent_hits: recent,
            total_death_bets: self.total_death_bets,
            total_survival_bets: self.total_survival_bets,
            time_remaining_ms: self.time_remaining_ms(now_ms),
            chat_connected,
            betting_round_pda: self.betting_round_pda.map(|p| p.to_string()),
            escrow_pda: self.escrow_pda.map(|p| p.to_string()),
        }
    }

    pub fn build_results(&self, coin: &str, boss_defeated: bool, ended_at_ms: u64) -> FightResults {
        let user_hits: BTreeMap<String, u32> = self
            .user_hits
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        let started_at_ms = self.fight_started_ms.unwrap_or(ended_at_ms);
        FightResults {
            round_id: self.round_id,
            coin: coin.to_string(),
            boss_defeated,
            initial_hp: self.max_hp,
            final_hp: self.boss_hp,
            total_hits: self.total_hits,
            user_hits,
            top_hitters: self.top_hitters(3),
            last_hitter: self.last_hitter.clone(),
            chronological: self.chronological.clone(),
            total_death_bets: self.total_death_bets,
            total_survival_bets: self.total_survival_bets,
            started_at_ms,
            ended_at_ms,
            duration_ms: ended_at_ms.saturating_sub(started_at_ms),
        }
    }
}

/// Public read-only view of the game, shaped for overlays.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSnapshot {
    pub phase: Phase,
    pub round_id: u64,
    pub boss_hp: u32,
    pub max_hp: u32,
    pub total_hits: u32,
    pub top_hitters: Vec<TopHitter>,
    pub last_hitter: Option<String>,
    pub recent_hits: Vec<HitEntry>,
    pub total_death_bets: u64,
    pub total_survival_bets: u64,
    pub time_remaining_ms: Option<u64>,
    pub chat_connected: bool,
    pub betting_round_pda: Option<String>,
    pub escrow_pda: Option<String>,
}

/// Full results of a finished round, broadcast on `fight_ended` and handed to
/// the exporter.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FightResults {
    pub round_id: u64,
    pub coin: String,
    pub boss_defeated: bool,
    pub initial_hp: u32,
    pub final_hp: u32,
    pub total_hits: u32,
    pub user_hits: BTreeMap<String, u32>,
    pub top_hitters: Vec<TopHitter>,
    pub last_hitter: Option<String>,
    pub chronological: Vec<HitEntry>,
    pub total_death_bets: u64,
    pub total_survival_bets: u64,
    pub started_at_ms: u64,
    pub ended_at_ms: u64,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fighting_state(hp: u32) -> GameState {
        let mut s = GameState::new(hp);
        s.begin_betting(1, Pubkey::new_unique(), Pubkey::new_unique());
        s.phase = Phase::Fighting;
        s
    }

    #[test]
    fn damage_decrements_and_tracks_hitter() {
        let mut s = fighting_state(3);
        let out = s.apply_damage("alice", "HIT", 10);
        assert!(!out.defeated_now);
        assert_eq!(s.boss_hp, 2);
        assert_eq!(s.total_hits, 1);
        assert_eq!(s.user_hits["alice"], 1);
        assert_eq!(s.last_hitter.as_deref(), Some("alice"));
    }

    #[test]
    fn final_damage_reports_defeat_exactly_once() {
        let mut s = fighting_state(1);
        let out = s.apply_damage("bob", "HIT", 1);
        assert!(out.defeated_now);
        // hp is already clamped at zero; another write must not re-report
        let out = s.apply_damage("bob", "HIT", 2);
        assert!(!out.defeated_now);
        assert_eq!(s.boss_hp, 0);
    }

    #[test]
    fn heal_clamps_at_max_and_leaves_hit_accounting_alone() {
        let mut s = fighting_state(3);
        s.apply_damage("alice", "HIT", 1);
        s.apply_heal("eve", "HEAL", 2);
        assert_eq!(s.boss_hp, 3);
        s.apply_heal("eve", "HEAL", 3);
        assert_eq!(s.boss_hp, 3, "heal never exceeds max hp");
        assert_eq!(s.total_hits, 1);
        assert_eq!(s.last_hitter.as_deref(), Some("alice"));
        assert!(!s.user_hits.contains_key("eve"));
    }

    #[test]
    fn damage_then_heal_round_trips_in_open_interval() {
        let mut s = fighting_state(3);
        s.apply_damage("a", "HIT", 1);
        let hp_mid = s.boss_hp;
        s.apply_damage("a", "HIT", 2);
        s.apply_heal("b", "HEAL", 3);
        assert_eq!(s.boss_hp, hp_mid);
    }

    #[test]
    fn hit_accounting_invariant_holds() {
        let mut s = fighting_state(10);
        s.apply_damage("a", "HIT", 1);
        s.apply_damage("b", "HIT", 2);
        s.apply_heal("c", "HEAL", 3);
        s.apply_damage("a", "HIT", 4);
        let sum: u32 = s.user_hits.values().sum();
        let damage_entries = s.chronological.iter().filter(|e| e.delta == -1).count() as u32;
        assert_eq!(s.total_hits, sum);
        assert_eq!(s.total_hits, damage_entries);
    }

    #[test]
    fn chronological_never_runs_backwards() {
        let mut s = fighting_state(10);
        s.apply_damage("a", "HIT", 100);
        s.apply_damage("b", "HIT", 50);
        let ts: Vec<u64> = s.chronological.iter().map(|e| e.ts_ms).collect();
        assert_eq!(ts, vec![100, 100]);
    }

    #[test]
    fn begin_betting_zeroes_round_state() {
        let mut s = fighting_state(3);
        s.apply_damage("a", "HIT", 1);
        s.begin_betting(42, Pubkey::new_unique(), Pubkey::new_unique());
        assert_eq!(s.phase, Phase::Betting);
        assert_eq!(s.round_id, 42);
        assert_eq!(s.boss_hp, 3);
        assert!(s.user_hits.is_empty());
        assert!(s.chronological.is_empty());
        assert_eq!(s.total_hits, 0);
        assert!(s.last_hitter.is_none());
    }

    #[test]
    fn top_hitters_orders_by_hits_then_name() {
        let mut s = fighting_state(10);
        s.apply_damage("bob", "HIT", 1);
        s.apply_damage("alice", "HIT", 2);
        s.apply_damage("alice", "HIT", 3);
        s.apply_damage("carol", "HIT", 4);
        let top = s.top_hitters(3);
        assert_eq!(top[0].username, "alice");
        assert_eq!(top[0].hits, 2);
        assert_eq!(top[1].username, "bob");
        assert_eq!(top[2].username, "carol");
    }

    #[test]
    fn snapshot_keeps_last_ten_entries() {
        let mut s = fighting_state(100);
        for i in 0..15 {
            s.apply_damage("a", "HIT", i);
        }
        let snap = s.snapshot(true, 0);
        assert_eq!(snap.recent_hits.len(), 10);
        assert_eq!(snap.recent_hits.last().unwrap().ts_ms, 14);
    }
}
