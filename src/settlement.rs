//! Post-fight settlement.
//!
//! Runs once per round after the on-chain `end_fight` lands. The chain is the
//! source of truth: totals, fee percentage, and the defeat flag are read back
//! from the round account, never from local state.

use serde::Serialize;
use tracing::{error, info, warn};

use crate::ledger::accounts::Prediction;
use crate::ledger::{LedgerClient, LedgerError};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutRecord {
    pub username: String,
    pub wallet: String,
    pub bet_amount: u64,
    pub prize_share: u64,
    pub total_payout: u64,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementSummary {
    pub round_id: u64,
    pub boss_defeated: bool,
    pub winning_side: Prediction,
    pub total_winner_bets: u64,
    pub total_loser_bets: u64,
    pub fee_lamports: u64,
    pub prize_pool_lamports: u64,
    pub payouts: Vec<PayoutRecord>,
    pub failed_claims: u32,
    pub fees_signature: Option<String>,
}

/// Fee skimmed off the losing pool, floor division.
pub fn fee_of(loser_total: u64, fee_percentage: u8) -> u64 {
    ((loser_total as u128 * fee_percentage as u128) / 100) as u64
}

/// One winner's share of the prize pool, proportional to their stake,
/// floored. The floor residue across all winners stays in escrow and is
/// collected by `claim_fees`.
pub fn share_of(prize_pool: u64, amount: u64, winner_total: u64) -> u64 {
    if winner_total == 0 {
        return 0;
    }
    ((prize_pool as u128 * amount as u128) / winner_total as u128) as u64
}

/// Enumerate bets, pay every winner, then drain fees. Per-bettor failures are
/// logged and skipped; the on-chain claimed flag makes replays harmless.
pub async fn settle_round(
    ledger: &LedgerClient,
    round_id: u64,
) -> Result<SettlementSummary, LedgerError> {
    let round = ledger.fetch_round(round_id).await?;
    let winning_side = if round.boss_defeated {
        Prediction::Death
    } else {
        Prediction::Survival
    };
    let (winner_total, loser_total) = match winning_side {
        Prediction::Death => (round.total_death_bets, round.total_survival_bets),
        Prediction::Survival => (round.total_survival_bets, round.total_death_bets),
    };

    let mut summary = SettlementSummary {
        round_id,
        boss_defeated: round.boss_defeated,
        winning_side,
        total_winner_bets: winner_total,
        total_loser_bets: loser_total,
        fee_lamports: 0,
        prize_pool_lamports: 0,
        payouts: Vec::new(),
        failed_claims: 0,
        fees_signature: None,
    };

    if winner_total == 0 {
        info!(round_id, "no winning bets, claiming fees only");
        summary.fees_signature = claim_fees_logged(ledger, round_id).await;
        return Ok(summary);
    }

    summary.fee_lamports = fee_of(loser_total, round.fee_percentage);
    summary.prize_pool_lamports = loser_total.saturating_sub(summary.fee_lamports);

    let bets = ledger.scan_bets(round_id).await?;
    for (_addr, bet) in bets.iter().filter(|(_, b)| b.prediction == winning_side) {
        let prize_share = share_of(summary.prize_pool_lamports, bet.amount_lamports, winner_total);
        let total_payout = bet.amount_lamports + prize_share;
        match ledger.claim_payout(round_id, &bet.bettor).await {
            Ok(sig) => {
                info!(
                    round_id,
                    bettor = %bet.bettor,
                    username = %bet.username,
                    total_payout,
                    "payout claimed"
                );
                summary.payouts.push(PayoutRecord {
                    username: bet.username.clone(),
                    wallet: bet.bettor.to_string(),
                    bet_amount: bet.amount_lamports,
                    prize_share,
                    total_payout,
                    signature: sig.to_string(),
                });
            }
            Err(e) => {
                warn!(round_id, bettor = %bet.bettor, error = %e, "payout claim failed, continuing");
                summary.failed_claims += 1;
            }
        }
    }

    summary.fees_signature = claim_fees_logged(ledger, round_id).await;
    info!(
        round_id,
        winners = summary.payouts.len(),
        failed = summary.failed_claims,
        fee_lamports = summary.fee_lamports,
        "settlement complete"
    );
    Ok(summary)
}

async fn claim_fees_logged(ledger: &LedgerClient, round_id: u64) -> Option<String> {
    match ledger.claim_fees(round_id).await {
        Ok(sig) => Some(sig.to_string()),
        Err(e) => {
            error!(round_id, error = %e, "claim_fees failed");
            None
        }
    }
}
