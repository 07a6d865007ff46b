//! Stream payload decoding
//!
//! Fixed-offset decode of the bonding-curve account layout and
//! classification of launchpad transactions from their instruction logs,
//! with a discriminator fallback when logs are unavailable.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use solana_sdk::pubkey::Pubkey;
use thiserror::Error;

use crate::curve;
use crate::types::{PriceSample, TxKind};

/// Launchpad program that owns every bonding-curve account
pub const PROGRAM_ID: &str = "6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P";

/// 8-byte discriminator prefixing create instructions
pub const CREATE_DISCRIMINATOR: [u8; 8] = [0x18, 0x1e, 0xc8, 0x28, 0x05, 0x1c, 0x07, 0x77];

/// Single-byte log discriminators
const LOG_DISC_CREATE: u8 = 181;
const LOG_DISC_BUY: u8 = 102;
const LOG_DISC_SELL: u8 = 51;

/// Byte offset of the `complete` flag inside the account layout; the
/// account subscription filters on this byte being zero
pub const COMPLETE_FLAG_OFFSET: usize = 48;

/// Serialized length of a bonding-curve account
pub const ACCOUNT_LEN: usize = 8 + 8 * 5 + 1 + 32;

/// Token decimals on the launchpad (fixed across the program)
const TOKEN_DECIMALS_FACTOR: f64 = 1e6;
const LAMPORTS_PER_SOL: f64 = 1e9;

static INSTRUCTION_LOG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Program log: Instruction: (Create|Buy|Sell)").expect("valid regex"));

/// Decode failure on a stream payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("account data too short: {0} bytes")]
    TooShort(usize),
    #[error("virtual reserves are zero")]
    ZeroReserves,
    #[error("mint is the default pubkey")]
    InvalidMint,
}

/// Bonding-curve account, little-endian fixed layout:
/// `u64 discriminator; u64 virtual_token_reserves; u64 virtual_sol_reserves;
///  u64 real_token_reserves; u64 real_sol_reserves; u64 token_total_supply;
///  u8 complete; [32]byte token_mint`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BondingCurveAccount {
    pub discriminator: u64,
    pub virtual_token_reserves: u64,
    pub virtual_sol_reserves: u64,
    pub real_token_reserves: u64,
    pub real_sol_reserves: u64,
    pub token_total_supply: u64,
    pub complete: bool,
    pub token_mint: Pubkey,
}

impl BondingCurveAccount {
    /// Decode from raw account bytes
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < ACCOUNT_LEN {
            return Err(DecodeError::TooShort(data.len()));
        }

        let read_u64 =
            |offset: usize| u64::from_le_bytes(data[offset..offset + 8].try_into().expect("8 bytes"));

        let account = Self {
            discriminator: read_u64(0),
            virtual_token_reserves: read_u64(8),
            virtual_sol_reserves: read_u64(16),
            real_token_reserves: read_u64(24),
            real_sol_reserves: read_u64(32),
            token_total_supply: read_u64(40),
            complete: data[COMPLETE_FLAG_OFFSET] != 0,
            token_mint: Pubkey::new_from_array(
                data[49..49 + 32].try_into().expect("32 bytes"),
            ),
        };

        if account.token_mint == Pubkey::default() {
            return Err(DecodeError::InvalidMint);
        }
        if account.virtual_token_reserves == 0 || account.virtual_sol_reserves == 0 {
            return Err(DecodeError::ZeroReserves);
        }
        Ok(account)
    }

    /// Spot price in SOL per whole token from the virtual reserves
    pub fn price_sol(&self) -> f64 {
        let sol = self.virtual_sol_reserves as f64 / LAMPORTS_PER_SOL;
        let tokens = self.virtual_token_reserves as f64 / TOKEN_DECIMALS_FACTOR;
        sol / tokens
    }

    /// Market cap in USD over the full supply
    pub fn market_cap_usd(&self, sol_price_usd: f64) -> f64 {
        let supply = self.token_total_supply as f64 / TOKEN_DECIMALS_FACTOR;
        self.price_sol() * sol_price_usd * supply
    }

    /// USD value of the real SOL locked on the curve
    pub fn liquidity_usd(&self, sol_price_usd: f64) -> f64 {
        self.real_sol_reserves as f64 / LAMPORTS_PER_SOL * sol_price_usd
    }

    /// Build the price sample this account update represents
    pub fn to_price_sample(&self, slot: u64, time: DateTime<Utc>) -> PriceSample {
        let sol_price = curve::sol_price_usd();
        let price_sol = self.price_sol();
        PriceSample {
            token_address: self.token_mint.to_string(),
            time,
            price_usd: price_sol * sol_price,
            price_sol,
            virtual_sol_reserves: self.virtual_sol_reserves,
            virtual_token_reserves: self.virtual_token_reserves,
            real_sol_reserves: self.real_sol_reserves,
            real_token_reserves: self.real_token_reserves,
            market_cap: self.market_cap_usd(sol_price),
            liquidity_usd: self.liquidity_usd(sol_price),
            slot,
            source: "stream".to_string(),
        }
    }
}

/// Kind from the first instruction log line
pub fn kind_from_logs(logs: &[String]) -> Option<TxKind> {
    for line in logs {
        if let Some(captures) = INSTRUCTION_LOG.captures(line) {
            return match captures.get(1).map(|m| m.as_str()) {
                Some("Create") => Some(TxKind::Create),
                Some("Buy") => Some(TxKind::Buy),
                Some("Sell") => Some(TxKind::Sell),
                _ => None,
            };
        }
    }
    None
}

/// Discriminator fallback when no instruction log matched
pub fn kind_from_data(data: &[u8]) -> Option<TxKind> {
    if data.len() >= CREATE_DISCRIMINATOR.len() && data[..8] == CREATE_DISCRIMINATOR {
        return Some(TxKind::Create);
    }
    match data.first() {
        Some(&LOG_DISC_CREATE) => Some(TxKind::Create),
        Some(&LOG_DISC_BUY) => Some(TxKind::Buy),
        Some(&LOG_DISC_SELL) => Some(TxKind::Sell),
        _ => None,
    }
}

/// Logs first, bytes as fallback
pub fn classify(logs: &[String], data: &[u8]) -> Option<TxKind> {
    kind_from_logs(logs).or_else(|| kind_from_data(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_account(account: &BondingCurveAccount) -> Vec<u8> {
        let mut data = Vec::with_capacity(ACCOUNT_LEN);
        data.extend_from_slice(&account.discriminator.to_le_bytes());
        data.extend_from_slice(&account.virtual_token_reserves.to_le_bytes());
        data.extend_from_slice(&account.virtual_sol_reserves.to_le_bytes());
        data.extend_from_slice(&account.real_token_reserves.to_le_bytes());
        data.extend_from_slice(&account.real_sol_reserves.to_le_bytes());
        data.extend_from_slice(&account.token_total_supply.to_le_bytes());
        data.push(account.complete as u8);
        data.extend_from_slice(account.token_mint.as_ref());
        data
    }

    fn sample_account() -> BondingCurveAccount {
        BondingCurveAccount {
            discriminator: 0x60_4f_41_2c,
            virtual_token_reserves: 1_000_000_000_000_000,
            virtual_sol_reserves: 30_000_000_000,
            real_token_reserves: 790_000_000_000_000,
            real_sol_reserves: 2_500_000_000,
            token_total_supply: 1_000_000_000_000_000,
            complete: false,
            token_mint: Pubkey::new_unique(),
        }
    }

    #[test]
    fn decode_round_trip() {
        let account = sample_account();
        let decoded = BondingCurveAccount::decode(&encode_account(&account)).unwrap();
        assert_eq!(decoded, account);
    }

    #[test]
    fn decode_rejects_short_data() {
        assert_eq!(
            BondingCurveAccount::decode(&[0u8; 10]),
            Err(DecodeError::TooShort(10))
        );
    }

    #[test]
    fn decode_rejects_default_mint() {
        let mut account = sample_account();
        account.token_mint = Pubkey::default();
        assert_eq!(
            BondingCurveAccount::decode(&encode_account(&account)),
            Err(DecodeError::InvalidMint)
        );
    }

    #[test]
    fn decode_rejects_zero_reserves() {
        let mut account = sample_account();
        account.virtual_sol_reserves = 0;
        assert_eq!(
            BondingCurveAccount::decode(&encode_account(&account)),
            Err(DecodeError::ZeroReserves)
        );
    }

    #[test]
    fn complete_flag_offset_matches_layout() {
        let mut account = sample_account();
        account.complete = true;
        let data = encode_account(&account);
        assert_eq!(data[COMPLETE_FLAG_OFFSET], 1);
        assert!(BondingCurveAccount::decode(&data).unwrap().complete);
    }

    #[test]
    fn price_math_from_reserves() {
        let account = sample_account();
        // 30 SOL over 1e9 tokens
        let expected = 30.0 / 1_000_000_000.0;
        assert!((account.price_sol() - expected).abs() < 1e-18);

        let mc = account.market_cap_usd(180.0);
        assert!((mc - expected * 180.0 * 1_000_000_000.0).abs() < 1e-6);

        assert!((account.liquidity_usd(180.0) - 2.5 * 180.0).abs() < 1e-9);
    }

    #[test]
    fn kind_from_instruction_logs() {
        let logs = vec![
            "Program 6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P invoke [1]".to_string(),
            "Program log: Instruction: Buy".to_string(),
        ];
        assert_eq!(kind_from_logs(&logs), Some(TxKind::Buy));

        let create = vec!["Program log: Instruction: Create".to_string()];
        assert_eq!(kind_from_logs(&create), Some(TxKind::Create));

        assert_eq!(kind_from_logs(&["Program log: other".to_string()]), None);
    }

    #[test]
    fn kind_from_discriminator_fallback() {
        let mut create = CREATE_DISCRIMINATOR.to_vec();
        create.extend_from_slice(&[0; 8]);
        assert_eq!(kind_from_data(&create), Some(TxKind::Create));

        assert_eq!(kind_from_data(&[181]), Some(TxKind::Create));
        assert_eq!(kind_from_data(&[102]), Some(TxKind::Buy));
        assert_eq!(kind_from_data(&[51]), Some(TxKind::Sell));
        assert_eq!(kind_from_data(&[7]), None);
        assert_eq!(kind_from_data(&[]), None);
    }

    #[test]
    fn classify_prefers_logs() {
        let logs = vec!["Program log: Instruction: Sell".to_string()];
        // data says buy, logs say sell; logs win
        assert_eq!(classify(&logs, &[102]), Some(TxKind::Sell));
        assert_eq!(classify(&[], &[102]), Some(TxKind::Buy));
    }
}
