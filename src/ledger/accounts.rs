//! On-chain interface of the boss-fight betting program.
//!
//! Account layouts, PDA seeds, and Anchor discriminators for the program this
//! server drives. The server never executes this program locally; it only
//! builds instructions against it and decodes the accounts it owns.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::system_program;

// ======================================================================
// SEEDS / FRAMING
// ======================================================================

pub const BETTING_ROUND_SEED: &[u8] = b"betting_round";
pub const ESCROW_SEED: &[u8] = b"escrow";
pub const BET_SEED: &[u8] = b"bet";

/// Byte offset of `round_id` inside a `BetAccount`: 8 discriminator bytes
/// followed by the 32-byte bettor key.
pub const BET_ROUND_ID_OFFSET: usize = 40;

/// Anchor custom error code for `BettingStillActive` (the only retryable
/// protocol error on `start_fight_phase`).
pub const ERR_BETTING_STILL_ACTIVE: u32 = 6004;

/// First 8 bytes of SHA-256 over `account:<Name>`.
pub fn account_discriminator(name: &str) -> [u8; 8] {
    anchor_discriminator("account", name)
}

/// First 8 bytes of SHA-256 over `global:<method>`.
pub fn instruction_discriminator(name: &str) -> [u8; 8] {
    anchor_discriminator("global", name)
}

fn anchor_discriminator(namespace: &str, name: &str) -> [u8; 8] {
    let mut hasher = Sha256::new();
    hasher.update(format!("{namespace}:{name}").as_bytes());
    let digest = hasher.finalize();
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

// ======================================================================
// ACCOUNTS
// ======================================================================

#[derive(
    BorshSerialize, BorshDeserialize, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq,
)]
#[serde(rename_all = "lowercase")]
pub enum Prediction {
    Death,
    Survival,
}

impl std::fmt::Display for Prediction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Prediction::Death => f.write_str("death"),
            Prediction::Survival => f.write_str("survival"),
        }
    }
}

impl std::str::FromStr for Prediction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "death" => Ok(Prediction::Death),
            "survival" => Ok(Prediction::Survival),
            other => Err(format!("unknown prediction '{other}'")),
        }
    }
}

#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnChainPhase {
    Betting,
    Fighting,
    Ended,
}

/// Authoritative round state. The server mirrors the totals after
/// `start_fight_phase` and reads `boss_defeated`/`fee_percentage` during
/// settlement.
#[derive(BorshDeserialize, Debug, Clone)]
pub struct BettingRoundAccount {
    pub round_id: u64,
    pub authority: Pubkey,
    pub treasury: Pubkey,
    pub betting_start_time: i64,
    pub betting_end_time: i64,
    pub fight_end_time: i64,
    pub initial_hp: u32,
    pub current_hp: u32,
    pub phase: OnChainPhase,
    pub total_death_bets: u64,
    pub total_survival_bets: u64,
    pub total_bets_count: u64,
    pub fee_percentage: u8,
    pub boss_defeated: bool,
    pub payouts_processed: bool,
    pub escrow_bump: u8,
}

/// One escrowed bet. Field order is load-bearing: `bettor` occupies bytes
/// 8..40 so `round_id` sits at [`BET_ROUND_ID_OFFSET`] for memcmp scans.
#[derive(BorshDeserialize, Debug, Clone)]
pub struct BetAccount {
    pub bettor: Pubkey,
    pub round_id: u64,
    pub amount_lamports: u64,
    pub prediction: Prediction,
    pub username: String,
    pub timestamp: i64,
    pub payout_claimed: bool,
}

/// Decode an account image, checking the type discriminator first. Accounts
/// are allocated at fixed size, so trailing zero padding after the borsh
/// payload is expected and ignored.
pub fn decode_account<T: BorshDeserialize>(name: &str, data: &[u8]) -> Result<T, String> {
    if data.len() < 8 {
        return Err(format!("{name}: account data shorter than discriminator"));
    }
    if data[..8] != account_discriminator(name) {
        return Err(format!("{name}: discriminator mismatch"));
    }
    T::deserialize(&mut &data[8..]).map_err(|e| format!("{name}: {e}"))
}

// ======================================================================
// PDA DERIVATION
// ======================================================================

#[derive(Debug, Clone, Copy)]
pub struct RoundPdas {
    pub betting_round: Pubkey,
    pub escrow: Pubkey,
}

pub fn derive_round_pdas(program_id: &Pubkey, round_id: u64) -> RoundPdas {
    let round_le = round_id.to_le_bytes();
    let (betting_round, _) =
        Pubkey::find_program_address(&[BETTING_ROUND_SEED, round_le.as_ref()], program_id);
    let (escrow, _) = Pubkey::find_program_address(&[ESCROW_SEED, round_le.as_ref()], program_id);
    RoundPdas {
        betting_round,
        escrow,
    }
}

pub fn derive_bet_pda(program_id: &Pubkey, round_id: u64, bettor: &Pubkey) -> Pubkey {
    let round_le = round_id.to_le_bytes();
    let (bet, _) =
        Pubkey::find_program_address(&[BET_SEED, round_le.as_ref(), bettor.as_ref()], program_id);
    bet
}

// ======================================================================
// INSTRUCTION BUILDERS
// ======================================================================

#[derive(BorshSerialize)]
struct InitializeBettingRoundArgs {
    round_id: u64,
    betting_duration: i64,
    fight_duration: i64,
    initial_hp: u32,
    fee_percentage: u8,
}

#[derive(BorshSerialize)]
struct PlaceBetArgs {
    amount_lamports: u64,
    prediction: Prediction,
    username: String,
}

#[derive(BorshSerialize)]
struct EndFightArgs {
    final_hp: u32,
}

fn ix_data<T: BorshSerialize>(method: &str, args: &T) -> Vec<u8> {
    let mut data = instruction_discriminator(method).to_vec();
    data.extend(borsh::to_vec(args).expect("instruction args are serializable"));
    data
}

#[allow(clippy::too_many_arguments)]
pub fn initialize_betting_round(
    program_id: &Pubkey,
    authority: &Pubkey,
    round_id: u64,
    betting_duration: i64,
    fight_duration: i64,
    initial_hp: u32,
    fee_percentage: u8,
) -> Instruction {
    let pdas = derive_round_pdas(program_id, round_id);
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(pdas.betting_round, false),
            AccountMeta::new(pdas.escrow, false),
            AccountMeta::new(*authority, true),
            AccountMeta::new_readonly(system_program::id(), false),
        ],
        data: ix_data(
            "initialize_betting_round",
            &InitializeBettingRoundArgs {
                round_id,
                betting_duration,
                fight_duration,
                initial_hp,
                fee_percentage,
            },
        ),
    }
}

pub fn start_fight_phase(program_id: &Pubkey, authority: &Pubkey, round_id: u64) -> Instruction {
    let pdas = derive_round_pdas(program_id, round_id);
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(pdas.betting_round, false),
            AccountMeta::new_readonly(*authority, true),
        ],
        data: ix_data("start_fight_phase", &()),
    }
}

pub fn end_fight(
    program_id: &Pubkey,
    authority: &Pubkey,
    round_id: u64,
    final_hp: u32,
) -> Instruction {
    let pdas = derive_round_pdas(program_id, round_id);
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(pdas.betting_round, false),
            AccountMeta::new_readonly(*authority, true),
        ],
        data: ix_data("end_fight", &EndFightArgs { final_hp }),
    }
}

pub fn place_bet(
    program_id: &Pubkey,
    round_id: u64,
    bettor: &Pubkey,
    amount_lamports: u64,
    prediction: Prediction,
    username: &str,
) -> Instruction {
    let pdas = derive_round_pdas(program_id, round_id);
    let bet = derive_bet_pda(program_id, round_id, bettor);
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(pdas.betting_round, false),
            AccountMeta::new(bet, false),
            AccountMeta::new(pdas.escrow, false),
            AccountMeta::new(*bettor, true),
            AccountMeta::new_readonly(system_program::id(), false),
        ],
        data: ix_data(
            "place_bet",
            &PlaceBetArgs {
                amount_lamports,
                prediction,
                username: username.to_string(),
            },
        ),
    }
}

/// Payouts are cranked by the authority; the bettor only receives lamports,
/// so it is not a signer here.
pub fn claim_payout(program_id: &Pubkey, round_id: u64, bettor: &Pubkey) -> Instruction {
    let pdas = derive_round_pdas(program_id, round_id);
    let bet = derive_bet_pda(program_id, round_id, bettor);
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new_readonly(pdas.betting_round, false),
            AccountMeta::new(bet, false),
            AccountMeta::new(pdas.escrow, false),
            AccountMeta::new(*bettor, false),
        ],
        data: ix_data("claim_payout", &()),
    }
}

pub fn claim_fees(
    program_id: &Pubkey,
    authority: &Pubkey,
    treasury: &Pubkey,
    round_id: u64,
) -> Instruction {
    let pdas = derive_round_pdas(program_id, round_id);
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(pdas.betting_round, false),
            AccountMeta::new(pdas.escrow, false),
            AccountMeta::new(*treasury, false),
            AccountMeta::new_readonly(*authority, true),
        ],
        data: ix_data("claim_fees", &()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discriminators_are_stable() {
        // independent of field contents, purely a function of the name
        assert_eq!(
            account_discriminator("BetAccount"),
            account_discriminator("BetAccount")
        );
        assert_ne!(
            account_discriminator("BetAccount"),
            account_discriminator("BettingRound")
        );
        assert_ne!(
            account_discriminator("BetAccount"),
            instruction_discriminator("BetAccount")
        );
    }

    #[test]
    fn pdas_are_deterministic_per_round() {
        let program = Pubkey::new_unique();
        let a = derive_round_pdas(&program, 7);
        let b = derive_round_pdas(&program, 7);
        assert_eq!(a.betting_round, b.betting_round);
        assert_eq!(a.escrow, b.escrow);
        let c = derive_round_pdas(&program, 8);
        assert_ne!(a.betting_round, c.betting_round);
    }

    #[test]
    fn bet_round_id_sits_at_offset_40() {
        #[derive(BorshSerialize)]
        struct BetImage {
            bettor: Pubkey,
            round_id: u64,
            amount_lamports: u64,
            prediction: Prediction,
            username: String,
            timestamp: i64,
            payout_claimed: bool,
        }
        let image = BetImage {
            bettor: Pubkey::new_unique(),
            round_id: 0xDEAD_BEEF,
            amount_lamports: 5,
            prediction: Prediction::Death,
            username: "alice".into(),
            timestamp: 1,
            payout_claimed: false,
        };
        let mut data = account_discriminator("BetAccount").to_vec();
        data.extend(borsh::to_vec(&image).unwrap());
        assert_eq!(
            data[BET_ROUND_ID_OFFSET..BET_ROUND_ID_OFFSET + 8],
            0xDEAD_BEEFu64.to_le_bytes()
        );
        let decoded: BetAccount = decode_account("BetAccount", &data).unwrap();
        assert_eq!(decoded.round_id, 0xDEAD_BEEF);
        assert_eq!(decoded.username, "alice");
    }

    #[test]
    fn decode_tolerates_trailing_padding() {
        #[derive(BorshSerialize)]
        struct Min {
            bettor: Pubkey,
            round_id: u64,
            amount_lamports: u64,
            prediction: Prediction,
            username: String,
            timestamp: i64,
            payout_claimed: bool,
        }
        let mut data = account_discriminator("BetAccount").to_vec();
        data.extend(
            borsh::to_vec(&Min {
                bettor: Pubkey::new_unique(),
                round_id: 1,
                amount_lamports: 2,
                prediction: Prediction::Survival,
                username: "x".into(),
                timestamp: 3,
                payout_claimed: true,
            })
            .unwrap(),
        );
        data.extend([0u8; 24]); // fixed-size allocation slack
        let decoded: BetAccount = decode_account("BetAccount", &data).unwrap();
        assert_eq!(decoded.amount_lamports, 2);
        assert!(decoded.payout_claimed);
    }

    #[test]
    fn decode_rejects_wrong_discriminator() {
        let data = vec![0u8; 64];
        assert!(decode_account::<BetAccount>("BetAccount", &data).is_err());
    }
}
