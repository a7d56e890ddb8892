//! Environment-driven configuration.
//!
//! Required values missing at boot are fatal; the process refuses to start
//! rather than run a wager game with a half-configured ledger.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Keypair;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Room id on the chat provider.
    pub coin_address: String,
    pub trigger_keywords: String,
    pub heal_keywords: String,
    pub initial_hp: u32,
    pub export_dir: PathBuf,
    pub solana_rpc_url: String,
    pub authority_keypair_path: PathBuf,
    pub treasury_wallet: Pubkey,
    pub program_id: Pubkey,
    pub fee_percentage: u8,
    pub admin_secret: String,
    pub admin_wallet: String,
    pub chat_ws_url: String,
    pub betting_duration: Duration,
    pub fight_duration: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let cfg = Self {
            port: parse_or("PORT", 3000)?,
            coin_address: required("COIN_ADDRESS")?,
            trigger_keywords: or_default("TRIGGER_KEYWORDS", "hit"),
            heal_keywords: or_default("HEAL_KEYWORDS", "heal"),
            initial_hp: parse_or("INITIAL_HP", 100)?,
            export_dir: PathBuf::from(or_default("EXPORT_DIR", "./exports")),
            solana_rpc_url: or_default("SOLANA_RPC_URL", "https://api.devnet.solana.com"),
            authority_keypair_path: PathBuf::from(required("AUTHORITY_KEYPAIR_PATH")?),
            treasury_wallet: required_pubkey("TREASURY_WALLET")?,
            program_id: required_pubkey("PROGRAM_ID")?,
            fee_percentage: parse_or("FEE_PERCENTAGE", 5)?,
            admin_secret: required("ADMIN_SECRET")?,
            admin_wallet: required("ADMIN_WALLET")?,
            chat_ws_url: or_default("CHAT_WS_URL", "wss://livechat.pump.fun/ws"),
            betting_duration: Duration::from_secs(parse_or("BETTING_DURATION_SECS", 60)?),
            fight_duration: Duration::from_secs(parse_or("FIGHT_DURATION_SECS", 60)?),
        };

        if cfg.fee_percentage > 100 {
            bail!("FEE_PERCENTAGE must be 0..=100, got {}", cfg.fee_percentage);
        }
        if cfg.initial_hp == 0 {
            bail!("INITIAL_HP must be positive");
        }
        if cfg.admin_secret.is_empty() {
            bail!("ADMIN_SECRET must not be empty");
        }
        Ok(cfg)
    }

    /// Load the authority keypair: a JSON array of the 64 secret-key bytes,
    /// the format the Solana CLI writes.
    pub fn load_keypair(&self) -> Result<Keypair> {
        let raw = std::fs::read_to_string(&self.authority_keypair_path).with_context(|| {
            format!(
                "reading authority keypair {}",
                self.authority_keypair_path.display()
            )
        })?;
        let bytes: Vec<u8> =
            serde_json::from_str(&raw).context("authority keypair must be a JSON byte array")?;
        Keypair::from_bytes(&bytes).context("authority keypair bytes are not a valid keypair")
    }
}

fn required(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => bail!("missing required environment variable {name}"),
    }
}

fn required_pubkey(name: &str) -> Result<Pubkey> {
    let raw = required(name)?;
    Pubkey::from_str(&raw).with_context(|| format!("{name} is not a valid address: '{raw}'"))
}

fn or_default(name: &str, default: &str) -> String {
    std::env::var(name).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn parse_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => v
            .parse::<T>()
            .with_context(|| format!("{name} has an invalid value: '{v}'")),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_full_env() {
        std::env::set_var("COIN_ADDRESS", "TestCoin1111111111111111111111111111111111");
        std::env::set_var("AUTHORITY_KEYPAIR_PATH", "/tmp/authority.json");
        std::env::set_var("TREASURY_WALLET", Pubkey::new_unique().to_string());
        std::env::set_var("PROGRAM_ID", Pubkey::new_unique().to_string());
        std::env::set_var("ADMIN_SECRET", "s3cret");
        std::env::set_var("ADMIN_WALLET", "AdminWallet");
    }

    // env vars are process-global, so the from_env cases run as one test
    #[test]
    fn from_env_happy_path_defaults_and_fatal_validation() {
        set_full_env();
        std::env::remove_var("PORT");
        std::env::remove_var("FEE_PERCENTAGE");

        let cfg = Config::from_env().expect("fully configured env");
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.fee_percentage, 5);
        assert_eq!(cfg.trigger_keywords, "hit");
        assert_eq!(cfg.betting_duration, Duration::from_secs(60));

        std::env::set_var("PORT", "8081");
        std::env::set_var("BETTING_DURATION_SECS", "1");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.port, 8081);
        assert_eq!(cfg.betting_duration, Duration::from_secs(1));

        // missing treasury refuses startup
        std::env::remove_var("TREASURY_WALLET");
        let err = Config::from_env().unwrap_err().to_string();
        assert!(err.contains("TREASURY_WALLET"));
        std::env::set_var("TREASURY_WALLET", Pubkey::new_unique().to_string());

        // out-of-range fee refuses startup
        std::env::set_var("FEE_PERCENTAGE", "101");
        assert!(Config::from_env().is_err());
        std::env::remove_var("FEE_PERCENTAGE");

        // garbage numeric refuses startup
        std::env::set_var("INITIAL_HP", "lots");
        assert!(Config::from_env().is_err());
        std::env::remove_var("INITIAL_HP");
        std::env::remove_var("PORT");
        std::env::remove_var("BETTING_DURATION_SECS");
    }

    #[test]
    fn keypair_round_trips_through_json_array() {
        use solana_sdk::signer::Signer;
        let keypair = Keypair::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authority.json");
        let bytes: Vec<u8> = keypair.to_bytes().to_vec();
        std::fs::write(&path, serde_json::to_string(&bytes).unwrap()).unwrap();

        let cfg = Config {
            port: 3000,
            coin_address: "c".into(),
            trigger_keywords: "hit".into(),
            heal_keywords: "heal".into(),
            initial_hp: 100,
            export_dir: PathBuf::from("."),
            solana_rpc_url: "http://localhost".into(),
            authority_keypair_path: path,
            treasury_wallet: Pubkey::new_unique(),
            program_id: Pubkey::new_unique(),
            fee_percentage: 5,
            admin_secret: "s".into(),
            admin_wallet: "w".into(),
            chat_ws_url: "ws://localhost".into(),
            betting_duration: Duration::from_secs(60),
            fight_duration: Duration::from_secs(60),
        };
        let loaded = cfg.load_keypair().unwrap();
        assert_eq!(loaded.pubkey(), keypair.pubkey());
    }

    #[test]
    fn truncated_keypair_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.json");
        std::fs::write(&path, "[1,2,3]").unwrap();
        let cfg = Config {
            authority_keypair_path: path,
            port: 0,
            coin_address: String::new(),
            trigger_keywords: String::new(),
            heal_keywords: String::new(),
            initial_hp: 1,
            export_dir: PathBuf::new(),
            solana_rpc_url: String::new(),
            treasury_wallet: Pubkey::new_unique(),
            program_id: Pubkey::new_unique(),
            fee_percentage: 0,
            admin_secret: "s".into(),
            admin_wallet: "w".into(),
            chat_ws_url: String::new(),
            betting_duration: Duration::ZERO,
            fight_duration: Duration::ZERO,
        };
        assert!(cfg.load_keypair().is_err());
    }
}
