//! Realtime events pushed to overlay subscribers.
//!
//! One tagged sum type; every variant carries a fixed schema, so subscribers
//! decode once on the `type` field.

use serde::Serialize;

use crate::settlement::SettlementSummary;
use crate::state::{BetSummary, FightResults, GameSnapshot, HitEntry, Phase, TopHitter};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Full snapshot, sent once as the first message of every subscription.
    State(GameSnapshot),
    /// HP / leaderboard diff during Fighting.
    Update(UpdatePayload),
    PhaseChange(PhaseChangePayload),
    BettingUpdate(BettingUpdatePayload),
    /// Advisory countdown, 100 ms cadence while a phase timer runs.
    TimerUpdate(TimerPayload),
    FightEnded(FightResults),
    PayoutsProcessed(SettlementSummary),
    /// Upstream chat connectivity.
    ConnectionStatus { connected: bool },
    GameReset(GameResetPayload),
    #[serde(rename = "admin:error")]
    AdminError { message: String },
}

impl ServerEvent {
    /// Whether a slow subscriber may lose this event. `update` and
    /// `timer_update` coalesce naturally; everything else must arrive or the
    /// subscriber is cut.
    pub fn is_droppable(&self) -> bool {
        matches!(self, ServerEvent::Update(_) | ServerEvent::TimerUpdate(_))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePayload {
    pub boss_hp: u32,
    pub max_hp: u32,
    pub total_hits: u32,
    pub top_hitters: Vec<TopHitter>,
    pub last_hitter: Option<String>,
    pub latest: HitEntry,
    pub time_remaining_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseChangePayload {
    pub phase: Phase,
    pub round_id: u64,
    pub time_remaining_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BettingUpdatePayload {
    pub round_id: u64,
    pub total_death_bets: u64,
    pub total_survival_bets: u64,
    pub bets: Vec<BetSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerPayload {
    pub phase: Phase,
    pub time_remaining_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameResetPayload {
    pub round_id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_tag_on_type_field() {
        let ev = ServerEvent::ConnectionStatus { connected: true };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "connection_status");
        assert_eq!(json["connected"], true);
    }

    #[test]
    fn admin_error_uses_colon_tag() {
        let ev = ServerEvent::AdminError {
            message: "bad key".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "admin:error");
    }

    #[test]
    fn only_update_and_timer_are_droppable() {
        let timer = ServerEvent::TimerUpdate(TimerPayload {
            phase: Phase::Betting,
            time_remaining_ms: 1000,
        });
        assert!(timer.is_droppable());
        let reset = ServerEvent::GameReset(GameResetPayload { round_id: 1 });
        assert!(!reset.is_droppable());
        let phase = ServerEvent::PhaseChange(PhaseChangePayload {
            phase: Phase::Fighting,
            round_id: 1,
            time_remaining_ms: Some(5),
            message: None,
        });
        assert!(!phase.is_droppable());
    }
}
