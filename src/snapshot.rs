//! Perp snapshot: typed decoders for perp venue account snapshots, plus
//! order book reconstruction from the slab arena stored in bids/asks accounts.

#![deny(unsafe_code)]

// 1. mod constants
pub mod constants {
    pub const NIL: u32 = u32::MAX;

    pub const METADATA_LEN: usize = 8;
    pub const FIXED_LEN: usize = 16;
    pub const PUBKEY_LEN: usize = 32;

    pub const MAX_TOKENS: usize = 16;
    pub const MAX_PAIRS: usize = MAX_TOKENS - 1;
    pub const MAX_NODE_BANKS: usize = 8;

    pub const ROOT_BANK_LEN: usize = 424;
    pub const NODE_BANK_LEN: usize = 72;
    pub const PERP_MARKET_LEN: usize = 384;

    pub const PRICE_CACHE_LEN: usize = 24;
    pub const BANK_CACHE_LEN: usize = 40;
    pub const PERP_MARKET_CACHE_LEN: usize = 40;
    pub const CACHE_LEN: usize = METADATA_LEN
        + MAX_PAIRS * PRICE_CACHE_LEN
        + MAX_TOKENS * BANK_CACHE_LEN
        + MAX_PAIRS * PERP_MARKET_CACHE_LEN;

    pub const EVENT_SIZE: usize = 200;
    pub const EVENT_QUEUE_HEADER_LEN: usize = 32;

    pub const NODE_SIZE: usize = 88;
    pub const MAX_BOOK_NODES: usize = 1024;
    pub const BOOK_SIDE_HEADER_LEN: usize = 40;
    pub const BOOK_SIDE_LEN: usize = BOOK_SIDE_HEADER_LEN + NODE_SIZE * MAX_BOOK_NODES;

    const _: () = assert!(CACHE_LEN == 1608);
    const _: () = assert!(BOOK_SIDE_LEN == 90_152);

    pub mod root_bank {
        pub const OPTIMAL_UTIL: usize = 8;
        pub const OPTIMAL_RATE: usize = 24;
        pub const MAX_RATE: usize = 40;
        pub const NUM_NODE_BANKS: usize = 56;
        pub const NODE_BANKS: usize = 64;
        pub const DEPOSIT_INDEX: usize = 320;
        pub const BORROW_INDEX: usize = 336;
        pub const LAST_UPDATED: usize = 352;
    }

    pub mod node_bank {
        pub const DEPOSITS: usize = 8;
        pub const BORROWS: usize = 24;
        pub const VAULT: usize = 40;
    }

    pub mod cache {
        use super::{METADATA_LEN, MAX_PAIRS, MAX_TOKENS, PRICE_CACHE_LEN, BANK_CACHE_LEN};

        pub const PRICES: usize = METADATA_LEN;
        pub const BANKS: usize = PRICES + MAX_PAIRS * PRICE_CACHE_LEN;
        pub const PERP_MARKETS: usize = BANKS + MAX_TOKENS * BANK_CACHE_LEN;
    }

    pub mod perp_market {
        pub const GROUP: usize = 8;
        pub const BIDS: usize = 40;
        pub const ASKS: usize = 72;
        pub const EVENT_QUEUE: usize = 104;
        pub const QUOTE_LOT_SIZE: usize = 136;
        pub const BASE_LOT_SIZE: usize = 144;
        pub const LONG_FUNDING: usize = 152;
        pub const SHORT_FUNDING: usize = 168;
        pub const OPEN_INTEREST: usize = 184;
        pub const LAST_UPDATED: usize = 192;
        pub const SEQ_NUM: usize = 200;
        pub const FEES_ACCRUED: usize = 208;
        pub const LM_RATE: usize = 224;
        pub const LM_MAX_DEPTH_BPS: usize = 240;
        pub const LM_PERIOD_START: usize = 256;
        pub const LM_TARGET_PERIOD_LENGTH: usize = 264;
        pub const LM_REWARD_LEFT: usize = 272;
        pub const LM_REWARD_PER_PERIOD: usize = 280;
        pub const REWARD_VAULT: usize = 288;
    }

    // Offsets within a single 200-byte event slot.
    pub mod event {
        pub const TIMESTAMP: usize = 8;
        pub const SEQ_NUM: usize = 16;

        pub const FILL_TAKER_SIDE: usize = 1;
        pub const FILL_MAKER_OUT: usize = 2;
        pub const FILL_MAKER_SLOT: usize = 3;
        pub const FILL_FEES_APPLIED: usize = 4;
        pub const FILL_MAKER: usize = 24;
        pub const FILL_MAKER_ORDER_ID: usize = 56;
        pub const FILL_MAKER_CLIENT_ID: usize = 72;
        pub const FILL_MAKER_FEE: usize = 80;
        pub const FILL_BEST_INITIAL: usize = 96;
        pub const FILL_MAKER_TIMESTAMP: usize = 104;
        pub const FILL_TAKER: usize = 112;
        pub const FILL_TAKER_ORDER_ID: usize = 144;
        pub const FILL_TAKER_CLIENT_ID: usize = 160;
        pub const FILL_TAKER_FEE: usize = 168;
        pub const FILL_PRICE: usize = 184;
        pub const FILL_QUANTITY: usize = 192;

        pub const OUT_SIDE: usize = 1;
        pub const OUT_SLOT: usize = 2;
        pub const OUT_OWNER: usize = 24;
        pub const OUT_QUANTITY: usize = 56;

        pub const LIQ_LIQEE: usize = 24;
        pub const LIQ_LIQOR: usize = 56;
        pub const LIQ_PRICE: usize = 88;
        pub const LIQ_QUANTITY: usize = 104;
        pub const LIQ_FEE: usize = 112;
    }

    pub mod event_queue {
        pub const HEAD: usize = 8;
        pub const COUNT: usize = 16;
        pub const SEQ_NUM: usize = 24;
    }

    pub mod book_side {
        pub const BUMP_INDEX: usize = 8;
        pub const FREE_LIST_LEN: usize = 16;
        pub const FREE_LIST_HEAD: usize = 24;
        pub const ROOT_NODE: usize = 28;
        pub const LEAF_COUNT: usize = 32;
    }

    // Offsets within a single 88-byte slab node.
    pub mod node {
        pub const INNER_PREFIX_LEN: usize = 4;
        pub const INNER_KEY: usize = 8;
        pub const INNER_CHILDREN: usize = 24;

        pub const LEAF_OWNER_SLOT: usize = 4;
        pub const LEAF_ORDER_TYPE: usize = 5;
        pub const LEAF_VERSION: usize = 6;
        pub const LEAF_TIME_IN_FORCE: usize = 7;
        pub const LEAF_KEY: usize = 8;
        pub const LEAF_OWNER: usize = 24;
        pub const LEAF_QUANTITY: usize = 56;
        pub const LEAF_CLIENT_ORDER_ID: usize = 64;
        pub const LEAF_BEST_INITIAL: usize = 72;
        pub const LEAF_TIMESTAMP: usize = 80;
    }
}

// 2. mod error
pub mod error {
    use thiserror::Error;
    use crate::state::DataType;

    #[derive(Clone, Debug, Eq, PartialEq, Error)]
    pub enum DecodeError {
        #[error("{record} expects {expected} bytes, buffer has {actual}")]
        LengthMismatch {
            record: &'static str,
            expected: usize,
            actual: usize,
        },
        #[error("unknown {kind} tag {value}")]
        UnknownDiscriminator { kind: &'static str, value: u32 },
        #[error("read of {len} bytes at offset {offset} exceeds {available}-byte buffer")]
        OutOfRange {
            offset: usize,
            len: usize,
            available: usize,
        },
        #[error("expected {expected:?} account, found {found:?}")]
        UnexpectedDataType {
            expected: &'static [DataType],
            found: DataType,
        },
        #[error("malformed slab at node {index}: {reason}")]
        MalformedTree { index: u32, reason: &'static str },
    }

    pub type DecodeResult<T> = Result<T, DecodeError>;

    pub(crate) fn expect_len(data: &[u8], record: &'static str, expected: usize) -> DecodeResult<()> {
        if data.len() != expected {
            return Err(DecodeError::LengthMismatch { record, expected, actual: data.len() });
        }
        Ok(())
    }
}

// 3. mod fixed_point
pub mod fixed_point {
    use core::fmt;
    use core::ops::{Add, Div, Mul, Neg, Sub};
    use fixed::types::I80F48;
    use serde::{Deserialize, Serialize};
    use crate::constants::FIXED_LEN;
    use crate::error::{expect_len, DecodeResult};

    // Signed 80.48 fixed point. Bits are kept untouched, so to_le_bytes
    // reproduces the 16 decoded bytes.
    #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct FixedPoint128(I80F48);

    impl FixedPoint128 {
        pub const ZERO: Self = Self(I80F48::ZERO);
        pub const ONE: Self = Self(I80F48::ONE);
        pub const FRAC_BITS: u32 = 48;

        pub fn decode(bytes: &[u8]) -> DecodeResult<Self> {
            expect_len(bytes, "FixedPoint128", FIXED_LEN)?;
            let mut raw = [0u8; FIXED_LEN];
            raw.copy_from_slice(bytes);
            Ok(Self::from_le_bytes(raw))
        }

        pub const fn from_le_bytes(raw: [u8; FIXED_LEN]) -> Self {
            Self(I80F48::from_bits(i128::from_le_bytes(raw)))
        }

        pub const fn to_le_bytes(self) -> [u8; FIXED_LEN] {
            self.0.to_bits().to_le_bytes()
        }

        pub const fn from_bits(bits: i128) -> Self {
            Self(I80F48::from_bits(bits))
        }

        pub const fn to_bits(self) -> i128 {
            self.0.to_bits()
        }

        pub fn from_int(value: i64) -> Self {
            Self(I80F48::from_num(value))
        }

        pub fn checked_from_int(value: i128) -> Option<Self> {
            I80F48::checked_from_num(value).map(Self)
        }

        // Lossy; for configuration and display paths only.
        pub fn from_f64(value: f64) -> Option<Self> {
            I80F48::checked_from_num(value).map(Self)
        }

        pub fn to_f64(self) -> f64 {
            self.0.to_num::<f64>()
        }

        pub const fn value(self) -> I80F48 {
            self.0
        }

        pub fn is_zero(self) -> bool {
            self.0 == I80F48::ZERO
        }

        pub fn is_negative(self) -> bool {
            self.0 < I80F48::ZERO
        }

        pub fn checked_add(self, rhs: Self) -> Option<Self> {
            self.0.checked_add(rhs.0).map(Self)
        }

        pub fn checked_sub(self, rhs: Self) -> Option<Self> {
            self.0.checked_sub(rhs.0).map(Self)
        }

        pub fn checked_mul(self, rhs: Self) -> Option<Self> {
            self.0.checked_mul(rhs.0).map(Self)
        }

        pub fn checked_div(self, rhs: Self) -> Option<Self> {
            self.0.checked_div(rhs.0).map(Self)
        }
    }

    impl From<I80F48> for FixedPoint128 {
        fn from(value: I80F48) -> Self {
            Self(value)
        }
    }

    impl From<FixedPoint128> for I80F48 {
        fn from(value: FixedPoint128) -> Self {
            value.0
        }
    }

    // The operators panic on overflow and on a zero divisor, like the integer
    // ones. Values read from accounts go through the checked_* methods.
    impl Add for FixedPoint128 {
        type Output = Self;
        fn add(self, rhs: Self) -> Self {
            Self(self.0 + rhs.0)
        }
    }

    impl Sub for FixedPoint128 {
        type Output = Self;
        fn sub(self, rhs: Self) -> Self {
            Self(self.0 - rhs.0)
        }
    }

    impl Mul for FixedPoint128 {
        type Output = Self;
        fn mul(self, rhs: Self) -> Self {
            Self(self.0 * rhs.0)
        }
    }

    impl Div for FixedPoint128 {
        type Output = Self;
        fn div(self, rhs: Self) -> Self {
            Self(self.0 / rhs.0)
        }
    }

    impl Neg for FixedPoint128 {
        type Output = Self;
        fn neg(self) -> Self {
            Self(-self.0)
        }
    }

    impl fmt::Display for FixedPoint128 {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            fmt::Display::fmt(&self.0, f)
        }
    }

    impl fmt::Debug for FixedPoint128 {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "FixedPoint128({})", self.0)
        }
    }
}

// 4. mod bytes
pub mod bytes {
    use arrayref::array_ref;
    use num_bigint::{BigInt, Sign};
    use solana_program::pubkey::Pubkey;
    use crate::constants::{FIXED_LEN, PUBKEY_LEN};
    use crate::error::{DecodeError, DecodeResult};
    use crate::fixed_point::FixedPoint128;

    #[inline]
    fn span(data: &[u8], offset: usize, len: usize) -> DecodeResult<&[u8]> {
        match offset.checked_add(len) {
            Some(end) if end <= data.len() => Ok(&data[offset..end]),
            _ => Err(DecodeError::OutOfRange { offset, len, available: data.len() }),
        }
    }

    pub fn read_u8(data: &[u8], offset: usize) -> DecodeResult<u8> {
        Ok(span(data, offset, 1)?[0])
    }

    pub fn read_bool(data: &[u8], offset: usize) -> DecodeResult<bool> {
        Ok(read_u8(data, offset)? != 0)
    }

    pub fn read_u16(data: &[u8], offset: usize) -> DecodeResult<u16> {
        let b = span(data, offset, 2)?;
        Ok(u16::from_le_bytes(*array_ref![b, 0, 2]))
    }

    pub fn read_u32(data: &[u8], offset: usize) -> DecodeResult<u32> {
        let b = span(data, offset, 4)?;
        Ok(u32::from_le_bytes(*array_ref![b, 0, 4]))
    }

    pub fn read_u64(data: &[u8], offset: usize) -> DecodeResult<u64> {
        let b = span(data, offset, 8)?;
        Ok(u64::from_le_bytes(*array_ref![b, 0, 8]))
    }

    pub fn read_i64(data: &[u8], offset: usize) -> DecodeResult<i64> {
        let b = span(data, offset, 8)?;
        Ok(i64::from_le_bytes(*array_ref![b, 0, 8]))
    }

    pub fn read_i128(data: &[u8], offset: usize) -> DecodeResult<i128> {
        let b = span(data, offset, 16)?;
        Ok(i128::from_le_bytes(*array_ref![b, 0, 16]))
    }

    pub fn read_bytes<const N: usize>(data: &[u8], offset: usize) -> DecodeResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(span(data, offset, N)?);
        Ok(out)
    }

    pub fn read_pubkey(data: &[u8], offset: usize) -> DecodeResult<Pubkey> {
        let b = span(data, offset, PUBKEY_LEN)?;
        Ok(Pubkey::new_from_array(*array_ref![b, 0, 32]))
    }

    pub fn read_fixed(data: &[u8], offset: usize) -> DecodeResult<FixedPoint128> {
        FixedPoint128::decode(span(data, offset, FIXED_LEN)?)
    }

    // Little-endian integer of any width; `signed` selects two's complement.
    pub fn read_big_int(data: &[u8], offset: usize, len: usize, signed: bool) -> DecodeResult<BigInt> {
        let b = span(data, offset, len)?;
        Ok(if signed {
            BigInt::from_signed_bytes_le(b)
        } else {
            BigInt::from_bytes_le(Sign::Plus, b)
        })
    }
}

// 5. mod state
pub mod state {
    use num_derive::FromPrimitive;
    use num_traits::FromPrimitive;
    use serde::{Deserialize, Serialize};
    use solana_program::pubkey::Pubkey;
    use tracing::debug;
    use crate::bytes::{read_bool, read_bytes, read_fixed, read_i64, read_pubkey, read_u64, read_u8};
    use crate::constants::{
        cache, node_bank, perp_market, root_bank, BANK_CACHE_LEN, CACHE_LEN, MAX_NODE_BANKS,
        MAX_PAIRS, MAX_TOKENS, NODE_BANK_LEN, PERP_MARKET_CACHE_LEN, PERP_MARKET_LEN,
        PRICE_CACHE_LEN, PUBKEY_LEN, ROOT_BANK_LEN,
    };
    use crate::error::{expect_len, DecodeError, DecodeResult};
    use crate::fixed_point::FixedPoint128;

    #[repr(u8)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, FromPrimitive, Serialize, Deserialize)]
    pub enum DataType {
        Group = 0,
        MarginAccount = 1,
        RootBank = 2,
        NodeBank = 3,
        PerpMarket = 4,
        Bids = 5,
        Asks = 6,
        Cache = 7,
        EventQueue = 8,
        AdvancedOrders = 9,
        ReferrerMemory = 10,
        ReferrerIdRecord = 11,
    }

    #[repr(u8)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, FromPrimitive, Serialize, Deserialize)]
    pub enum Side {
        Bid = 0,
        Ask = 1,
    }

    impl Side {
        pub fn from_tag(tag: u8) -> DecodeResult<Self> {
            Side::from_u8(tag).ok_or(DecodeError::UnknownDiscriminator { kind: "side", value: tag as u32 })
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AccountMetadata {
        pub data_type: DataType,
        pub version: u8,
        pub is_initialized: bool,
        pub extra_info: [u8; 5],
    }

    impl AccountMetadata {
        pub fn decode(data: &[u8]) -> DecodeResult<Self> {
            let tag = read_u8(data, 0)?;
            let data_type = DataType::from_u8(tag)
                .ok_or(DecodeError::UnknownDiscriminator { kind: "data type", value: tag as u32 })?;
            Ok(Self {
                data_type,
                version: read_u8(data, 1)?,
                is_initialized: read_bool(data, 2)?,
                extra_info: read_bytes::<5>(data, 3)?,
            })
        }

        pub fn expect(data: &[u8], expected: &'static [DataType]) -> DecodeResult<Self> {
            let meta = Self::decode(data)?;
            if !expected.contains(&meta.data_type) {
                return Err(DecodeError::UnexpectedDataType { expected, found: meta.data_type });
            }
            Ok(meta)
        }
    }

    // --- Banks ---

    #[derive(Clone, Debug, PartialEq)]
    pub struct RootBank {
        pub meta: AccountMetadata,
        pub optimal_util: FixedPoint128,
        pub optimal_rate: FixedPoint128,
        pub max_rate: FixedPoint128,
        pub num_node_banks: u64,
        // All slots as stored; unused ones hold the default (all-zero) key.
        pub node_banks: [Pubkey; MAX_NODE_BANKS],
        pub deposit_index: FixedPoint128,
        pub borrow_index: FixedPoint128,
        pub last_updated: u64,
    }

    impl RootBank {
        pub fn decode(data: &[u8]) -> DecodeResult<Self> {
            expect_len(data, "RootBank", ROOT_BANK_LEN)?;
            let meta = AccountMetadata::expect(data, &[DataType::RootBank])?;

            let mut node_banks = [Pubkey::default(); MAX_NODE_BANKS];
            for (i, key) in node_banks.iter_mut().enumerate() {
                *key = read_pubkey(data, root_bank::NODE_BANKS + i * PUBKEY_LEN)?;
            }

            let bank = Self {
                meta,
                optimal_util: read_fixed(data, root_bank::OPTIMAL_UTIL)?,
                optimal_rate: read_fixed(data, root_bank::OPTIMAL_RATE)?,
                max_rate: read_fixed(data, root_bank::MAX_RATE)?,
                num_node_banks: read_u64(data, root_bank::NUM_NODE_BANKS)?,
                node_banks,
                deposit_index: read_fixed(data, root_bank::DEPOSIT_INDEX)?,
                borrow_index: read_fixed(data, root_bank::BORROW_INDEX)?,
                last_updated: read_u64(data, root_bank::LAST_UPDATED)?,
            };
            debug!(record = "RootBank", len = data.len(), num_node_banks = bank.num_node_banks, "decoded");
            Ok(bank)
        }

        pub fn node_bank_keys(&self) -> impl Iterator<Item = &Pubkey> {
            self.node_banks.iter().filter(|k| **k != Pubkey::default())
        }

        pub fn total_deposits(&self, node_banks: &[NodeBank]) -> Option<FixedPoint128> {
            let mut sum = FixedPoint128::ZERO;
            for nb in node_banks {
                sum = sum.checked_add(nb.deposits)?;
            }
            sum.checked_mul(self.deposit_index)
        }

        pub fn total_borrows(&self, node_banks: &[NodeBank]) -> Option<FixedPoint128> {
            let mut sum = FixedPoint128::ZERO;
            for nb in node_banks {
                sum = sum.checked_add(nb.borrows)?;
            }
            sum.checked_mul(self.borrow_index)
        }
    }

    #[derive(Clone, Debug, PartialEq)]
    pub struct NodeBank {
        pub meta: AccountMetadata,
        pub deposits: FixedPoint128,
        pub borrows: FixedPoint128,
        pub vault: Pubkey,
    }

    impl NodeBank {
        pub fn decode(data: &[u8]) -> DecodeResult<Self> {
            expect_len(data, "NodeBank", NODE_BANK_LEN)?;
            let meta = AccountMetadata::expect(data, &[DataType::NodeBank])?;
            let bank = Self {
                meta,
                deposits: read_fixed(data, node_bank::DEPOSITS)?,
                borrows: read_fixed(data, node_bank::BORROWS)?,
                vault: read_pubkey(data, node_bank::VAULT)?,
            };
            debug!(record = "NodeBank", len = data.len(), vault = %bank.vault, "decoded");
            Ok(bank)
        }
    }

    // --- Cache ---

    #[derive(Clone, Copy, Debug, PartialEq)]
    pub struct PriceCacheEntry {
        pub price: FixedPoint128,
        pub last_update: u64,
    }

    #[derive(Clone, Copy, Debug, PartialEq)]
    pub struct BankCacheEntry {
        pub deposit_index: FixedPoint128,
        pub borrow_index: FixedPoint128,
        pub last_update: u64,
    }

    #[derive(Clone, Copy, Debug, PartialEq)]
    pub struct PerpMarketCacheEntry {
        pub long_funding: FixedPoint128,
        pub short_funding: FixedPoint128,
        pub last_update: u64,
    }

    #[derive(Clone, Debug, PartialEq)]
    pub struct VenueCache {
        pub meta: AccountMetadata,
        pub prices: Vec<PriceCacheEntry>,
        pub banks: Vec<BankCacheEntry>,
        pub perp_markets: Vec<PerpMarketCacheEntry>,
    }

    impl VenueCache {
        pub fn decode(data: &[u8]) -> DecodeResult<Self> {
            expect_len(data, "VenueCache", CACHE_LEN)?;
            let meta = AccountMetadata::expect(data, &[DataType::Cache])?;

            let prices = (0..MAX_PAIRS)
                .map(|i| {
                    let off = cache::PRICES + i * PRICE_CACHE_LEN;
                    Ok(PriceCacheEntry {
                        price: read_fixed(data, off)?,
                        last_update: read_u64(data, off + 16)?,
                    })
                })
                .collect::<DecodeResult<Vec<_>>>()?;

            let banks = (0..MAX_TOKENS)
                .map(|i| {
                    let off = cache::BANKS + i * BANK_CACHE_LEN;
                    Ok(BankCacheEntry {
                        deposit_index: read_fixed(data, off)?,
                        borrow_index: read_fixed(data, off + 16)?,
                        last_update: read_u64(data, off + 32)?,
                    })
                })
                .collect::<DecodeResult<Vec<_>>>()?;

            let perp_markets = (0..MAX_PAIRS)
                .map(|i| {
                    let off = cache::PERP_MARKETS + i * PERP_MARKET_CACHE_LEN;
                    Ok(PerpMarketCacheEntry {
                        long_funding: read_fixed(data, off)?,
                        short_funding: read_fixed(data, off + 16)?,
                        last_update: read_u64(data, off + 32)?,
                    })
                })
                .collect::<DecodeResult<Vec<_>>>()?;

            debug!(record = "VenueCache", len = data.len(), "decoded");
            Ok(Self { meta, prices, banks, perp_markets })
        }

        pub fn price(&self, market_index: usize) -> Option<&PriceCacheEntry> {
            self.prices.get(market_index)
        }

        pub fn bank(&self, token_index: usize) -> Option<&BankCacheEntry> {
            self.banks.get(token_index)
        }

        pub fn perp_market(&self, market_index: usize) -> Option<&PerpMarketCacheEntry> {
            self.perp_markets.get(market_index)
        }
    }

    // --- Perp market ---

    #[derive(Clone, Copy, Debug, PartialEq)]
    pub struct LiquidityMiningInfo {
        pub rate: FixedPoint128,
        pub max_depth_bps: FixedPoint128,
        pub period_start: u64,
        pub target_period_length: u64,
        pub reward_left: u64,
        pub reward_per_period: u64,
    }

    #[derive(Clone, Debug, PartialEq)]
    pub struct PerpMarket {
        pub meta: AccountMetadata,
        pub group: Pubkey,
        pub bids: Pubkey,
        pub asks: Pubkey,
        pub event_queue: Pubkey,
        pub quote_lot_size: i64,
        pub base_lot_size: i64,
        pub long_funding: FixedPoint128,
        pub short_funding: FixedPoint128,
        pub open_interest: i64,
        pub last_updated: u64,
        pub seq_num: u64,
        pub fees_accrued: FixedPoint128,
        pub liquidity_mining: LiquidityMiningInfo,
        pub reward_vault: Pubkey,
    }

    impl PerpMarket {
        pub fn decode(data: &[u8]) -> DecodeResult<Self> {
            expect_len(data, "PerpMarket", PERP_MARKET_LEN)?;
            let meta = AccountMetadata::expect(data, &[DataType::PerpMarket])?;
            let market = Self {
                meta,
                group: read_pubkey(data, perp_market::GROUP)?,
                bids: read_pubkey(data, perp_market::BIDS)?,
                asks: read_pubkey(data, perp_market::ASKS)?,
                event_queue: read_pubkey(data, perp_market::EVENT_QUEUE)?,
                quote_lot_size: read_i64(data, perp_market::QUOTE_LOT_SIZE)?,
                base_lot_size: read_i64(data, perp_market::BASE_LOT_SIZE)?,
                long_funding: read_fixed(data, perp_market::LONG_FUNDING)?,
                short_funding: read_fixed(data, perp_market::SHORT_FUNDING)?,
                open_interest: read_i64(data, perp_market::OPEN_INTEREST)?,
                last_updated: read_u64(data, perp_market::LAST_UPDATED)?,
                seq_num: read_u64(data, perp_market::SEQ_NUM)?,
                fees_accrued: read_fixed(data, perp_market::FEES_ACCRUED)?,
                liquidity_mining: LiquidityMiningInfo {
                    rate: read_fixed(data, perp_market::LM_RATE)?,
                    max_depth_bps: read_fixed(data, perp_market::LM_MAX_DEPTH_BPS)?,
                    period_start: read_u64(data, perp_market::LM_PERIOD_START)?,
                    target_period_length: read_u64(data, perp_market::LM_TARGET_PERIOD_LENGTH)?,
                    reward_left: read_u64(data, perp_market::LM_REWARD_LEFT)?,
                    reward_per_period: read_u64(data, perp_market::LM_REWARD_PER_PERIOD)?,
                },
                reward_vault: read_pubkey(data, perp_market::REWARD_VAULT)?,
            };
            debug!(
                record = "PerpMarket",
                len = data.len(),
                seq_num = market.seq_num,
                open_interest = market.open_interest,
                "decoded"
            );
            Ok(market)
        }
    }
}

// 6. mod events
pub mod events {
    use num_derive::FromPrimitive;
    use num_traits::FromPrimitive;
    use solana_program::pubkey::Pubkey;
    use tracing::debug;
    use crate::bytes::{read_bool, read_fixed, read_i128, read_i64, read_pubkey, read_u64, read_u8};
    use crate::constants::{event, event_queue, EVENT_QUEUE_HEADER_LEN, EVENT_SIZE};
    use crate::error::{expect_len, DecodeError, DecodeResult};
    use crate::fixed_point::FixedPoint128;
    use crate::state::{AccountMetadata, DataType, Side};

    #[repr(u8)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
    pub enum EventType {
        Fill = 0,
        Out = 1,
        Liquidate = 2,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EventHeader {
        pub event_type: EventType,
        pub timestamp: u64,
        pub seq_num: u64,
    }

    #[derive(Clone, Debug, PartialEq)]
    pub struct FillEvent {
        pub header: EventHeader,
        pub taker_side: Side,
        pub maker_out: bool,
        pub maker_slot: u8,
        pub market_fees_applied: bool,
        pub maker: Pubkey,
        pub maker_order_id: i128,
        pub maker_client_order_id: u64,
        pub maker_fee: FixedPoint128,
        pub best_initial: i64,
        pub maker_timestamp: u64,
        pub taker: Pubkey,
        pub taker_order_id: i128,
        pub taker_client_order_id: u64,
        pub taker_fee: FixedPoint128,
        pub price: i64,
        pub quantity: i64,
    }

    #[derive(Clone, Debug, PartialEq)]
    pub struct OutEvent {
        pub header: EventHeader,
        pub side: Side,
        pub owner_slot: u8,
        pub owner: Pubkey,
        pub quantity: i64,
    }

    #[derive(Clone, Debug, PartialEq)]
    pub struct LiquidateEvent {
        pub header: EventHeader,
        pub liqee: Pubkey,
        pub liqor: Pubkey,
        pub price: FixedPoint128,
        pub quantity: i64,
        pub liquidation_fee: FixedPoint128,
    }

    #[derive(Clone, Debug, PartialEq)]
    pub enum QueueEvent {
        Fill(FillEvent),
        Out(OutEvent),
        Liquidate(LiquidateEvent),
    }

    fn decode_header(slot: &[u8]) -> DecodeResult<EventHeader> {
        let tag = read_u8(slot, 0)?;
        let event_type = EventType::from_u8(tag)
            .ok_or(DecodeError::UnknownDiscriminator { kind: "event type", value: tag as u32 })?;
        Ok(EventHeader {
            event_type,
            timestamp: read_u64(slot, event::TIMESTAMP)?,
            seq_num: read_u64(slot, event::SEQ_NUM)?,
        })
    }

    fn decode_fill(slot: &[u8], header: EventHeader) -> DecodeResult<QueueEvent> {
        Ok(QueueEvent::Fill(FillEvent {
            header,
            taker_side: Side::from_tag(read_u8(slot, event::FILL_TAKER_SIDE)?)?,
            maker_out: read_bool(slot, event::FILL_MAKER_OUT)?,
            maker_slot: read_u8(slot, event::FILL_MAKER_SLOT)?,
            market_fees_applied: read_bool(slot, event::FILL_FEES_APPLIED)?,
            maker: read_pubkey(slot, event::FILL_MAKER)?,
            maker_order_id: read_i128(slot, event::FILL_MAKER_ORDER_ID)?,
            maker_client_order_id: read_u64(slot, event::FILL_MAKER_CLIENT_ID)?,
            maker_fee: read_fixed(slot, event::FILL_MAKER_FEE)?,
            best_initial: read_i64(slot, event::FILL_BEST_INITIAL)?,
            maker_timestamp: read_u64(slot, event::FILL_MAKER_TIMESTAMP)?,
            taker: read_pubkey(slot, event::FILL_TAKER)?,
            taker_order_id: read_i128(slot, event::FILL_TAKER_ORDER_ID)?,
            taker_client_order_id: read_u64(slot, event::FILL_TAKER_CLIENT_ID)?,
            taker_fee: read_fixed(slot, event::FILL_TAKER_FEE)?,
            price: read_i64(slot, event::FILL_PRICE)?,
            quantity: read_i64(slot, event::FILL_QUANTITY)?,
        }))
    }

    fn decode_out(slot: &[u8], header: EventHeader) -> DecodeResult<QueueEvent> {
        Ok(QueueEvent::Out(OutEvent {
            header,
            side: Side::from_tag(read_u8(slot, event::OUT_SIDE)?)?,
            owner_slot: read_u8(slot, event::OUT_SLOT)?,
            owner: read_pubkey(slot, event::OUT_OWNER)?,
            quantity: read_i64(slot, event::OUT_QUANTITY)?,
        }))
    }

    fn decode_liquidate(slot: &[u8], header: EventHeader) -> DecodeResult<QueueEvent> {
        Ok(QueueEvent::Liquidate(LiquidateEvent {
            header,
            liqee: read_pubkey(slot, event::LIQ_LIQEE)?,
            liqor: read_pubkey(slot, event::LIQ_LIQOR)?,
            price: read_fixed(slot, event::LIQ_PRICE)?,
            quantity: read_i64(slot, event::LIQ_QUANTITY)?,
            liquidation_fee: read_fixed(slot, event::LIQ_FEE)?,
        }))
    }

    impl QueueEvent {
        pub fn decode(slot: &[u8]) -> DecodeResult<Self> {
            expect_len(slot, "QueueEvent", EVENT_SIZE)?;
            let header = decode_header(slot)?;
            match header.event_type {
                EventType::Fill => decode_fill(slot, header),
                EventType::Out => decode_out(slot, header),
                EventType::Liquidate => decode_liquidate(slot, header),
            }
        }

        pub fn header(&self) -> &EventHeader {
            match self {
                QueueEvent::Fill(e) => &e.header,
                QueueEvent::Out(e) => &e.header,
                QueueEvent::Liquidate(e) => &e.header,
            }
        }

        pub fn seq_num(&self) -> u64 {
            self.header().seq_num
        }

        pub fn timestamp(&self) -> u64 {
            self.header().timestamp
        }
    }

    // Ring buffer of event slots behind a 32-byte header. Only the `count`
    // live slots starting at `head` are decoded, in ring order.
    #[derive(Clone, Debug, PartialEq)]
    pub struct EventQueue {
        pub meta: AccountMetadata,
        pub head: u64,
        pub count: u64,
        pub seq_num: u64,
        pub capacity: usize,
        pub events: Vec<QueueEvent>,
    }

    impl EventQueue {
        pub fn decode(data: &[u8]) -> DecodeResult<Self> {
            let body = data.len().saturating_sub(EVENT_QUEUE_HEADER_LEN);
            let capacity = body / EVENT_SIZE;
            if capacity == 0 || body % EVENT_SIZE != 0 {
                return Err(DecodeError::LengthMismatch {
                    record: "EventQueue",
                    expected: EVENT_QUEUE_HEADER_LEN + capacity.max(1) * EVENT_SIZE,
                    actual: data.len(),
                });
            }
            let meta = AccountMetadata::expect(data, &[DataType::EventQueue])?;
            let head = read_u64(data, event_queue::HEAD)?;
            let count = read_u64(data, event_queue::COUNT)?;
            let seq_num = read_u64(data, event_queue::SEQ_NUM)?;

            // head and count must stay inside the ring
            if head >= capacity as u64 || count > capacity as u64 {
                return Err(DecodeError::OutOfRange {
                    offset: head as usize,
                    len: count as usize,
                    available: capacity,
                });
            }

            let events = (0..count as usize)
                .map(|i| {
                    let slot = (head as usize + i) % capacity;
                    let start = EVENT_QUEUE_HEADER_LEN + slot * EVENT_SIZE;
                    QueueEvent::decode(&data[start..start + EVENT_SIZE])
                })
                .collect::<DecodeResult<Vec<_>>>()?;

            debug!(record = "EventQueue", len = data.len(), capacity, head, count, seq_num, "decoded");
            Ok(Self { meta, head, count, seq_num, capacity, events })
        }
    }
}

// 7. mod slab
pub mod slab {
    use num_derive::FromPrimitive;
    use num_traits::FromPrimitive;
    use serde::{Deserialize, Serialize};
    use solana_program::pubkey::Pubkey;
    use tracing::{debug, trace, warn};
    use crate::bytes::{read_i128, read_i64, read_pubkey, read_u32, read_u64, read_u8};
    use crate::config::BookQuery;
    use crate::constants::{book_side, node, BOOK_SIDE_HEADER_LEN, BOOK_SIDE_LEN, MAX_BOOK_NODES, NODE_SIZE};
    use crate::error::{expect_len, DecodeError, DecodeResult};
    use crate::state::{AccountMetadata, DataType, Side};

    #[repr(u32)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
    pub enum NodeTag {
        Uninitialized = 0,
        InnerNode = 1,
        LeafNode = 2,
        FreeNode = 3,
        LastFreeNode = 4,
    }

    #[repr(u8)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, FromPrimitive, Serialize, Deserialize)]
    pub enum OrderType {
        Limit = 0,
        ImmediateOrCancel = 1,
        PostOnly = 2,
        Market = 3,
        PostOnlySlide = 4,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct InnerNode {
        pub prefix_len: u32,
        pub key: i128,
        // `children[0]` holds the keys below the critical bit.
        pub children: [u32; 2],
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct LeafNode {
        pub owner_slot: u8,
        pub order_type: OrderType,
        pub version: u8,
        pub time_in_force: u8,
        pub key: i128,
        pub owner: Pubkey,
        pub quantity: i64,
        pub client_order_id: u64,
        pub best_initial: i64,
        pub timestamp: u64,
    }

    impl LeafNode {
        pub fn price(&self) -> i64 {
            (self.key >> 64) as i64
        }

        // `None` when the order never expires.
        pub fn expiry(&self) -> Option<u64> {
            if self.time_in_force == 0 {
                None
            } else {
                Some(self.timestamp.saturating_add(self.time_in_force as u64))
            }
        }

        pub fn is_valid(&self, now: u64) -> bool {
            self.expiry().map_or(true, |expiry| now < expiry)
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum SlabNode {
        Uninitialized,
        Inner(InnerNode),
        Leaf(LeafNode),
        Free,
        LastFree,
    }

    impl SlabNode {
        pub fn decode(slot: &[u8]) -> DecodeResult<Self> {
            expect_len(slot, "SlabNode", NODE_SIZE)?;
            let tag = read_u32(slot, 0)?;
            let tag = NodeTag::from_u32(tag)
                .ok_or(DecodeError::UnknownDiscriminator { kind: "node", value: tag })?;
            Ok(match tag {
                NodeTag::Uninitialized => SlabNode::Uninitialized,
                NodeTag::FreeNode => SlabNode::Free,
                NodeTag::LastFreeNode => SlabNode::LastFree,
                NodeTag::InnerNode => SlabNode::Inner(InnerNode {
                    prefix_len: read_u32(slot, node::INNER_PREFIX_LEN)?,
                    key: read_i128(slot, node::INNER_KEY)?,
                    children: [
                        read_u32(slot, node::INNER_CHILDREN)?,
                        read_u32(slot, node::INNER_CHILDREN + 4)?,
                    ],
                }),
                NodeTag::LeafNode => {
                    let order_type = read_u8(slot, node::LEAF_ORDER_TYPE)?;
                    let order_type = OrderType::from_u8(order_type).ok_or(
                        DecodeError::UnknownDiscriminator { kind: "order type", value: order_type as u32 },
                    )?;
                    SlabNode::Leaf(LeafNode {
                        owner_slot: read_u8(slot, node::LEAF_OWNER_SLOT)?,
                        order_type,
                        version: read_u8(slot, node::LEAF_VERSION)?,
                        time_in_force: read_u8(slot, node::LEAF_TIME_IN_FORCE)?,
                        key: read_i128(slot, node::LEAF_KEY)?,
                        owner: read_pubkey(slot, node::LEAF_OWNER)?,
                        quantity: read_i64(slot, node::LEAF_QUANTITY)?,
                        client_order_id: read_u64(slot, node::LEAF_CLIENT_ORDER_ID)?,
                        best_initial: read_i64(slot, node::LEAF_BEST_INITIAL)?,
                        timestamp: read_u64(slot, node::LEAF_TIMESTAMP)?,
                    })
                }
            })
        }

        pub fn is_free(&self) -> bool {
            matches!(self, SlabNode::Free | SlabNode::LastFree)
        }
    }

    #[derive(Clone, Debug, PartialEq)]
    pub struct OrderBookSide {
        pub meta: AccountMetadata,
        pub side: Side,
        pub bump_index: u64,
        pub free_list_len: u64,
        pub free_list_head: u32,
        pub root_node: u32,
        pub leaf_count: u64,
        pub nodes: Vec<SlabNode>,
    }

    impl OrderBookSide {
        pub fn decode(data: &[u8]) -> DecodeResult<Self> {
            expect_len(data, "OrderBookSide", BOOK_SIDE_LEN)?;
            let meta = AccountMetadata::expect(data, &[DataType::Bids, DataType::Asks])?;
            let side = match meta.data_type {
                DataType::Bids => Side::Bid,
                _ => Side::Ask,
            };

            let nodes = data[BOOK_SIDE_HEADER_LEN..]
                .chunks_exact(NODE_SIZE)
                .map(SlabNode::decode)
                .collect::<DecodeResult<Vec<_>>>()?;
            debug_assert_eq!(nodes.len(), MAX_BOOK_NODES);

            let book = Self {
                meta,
                side,
                bump_index: read_u64(data, book_side::BUMP_INDEX)?,
                free_list_len: read_u64(data, book_side::FREE_LIST_LEN)?,
                free_list_head: read_u32(data, book_side::FREE_LIST_HEAD)?,
                root_node: read_u32(data, book_side::ROOT_NODE)?,
                leaf_count: read_u64(data, book_side::LEAF_COUNT)?,
                nodes,
            };
            debug!(
                record = "OrderBookSide",
                len = data.len(),
                side = ?book.side,
                leaf_count = book.leaf_count,
                "decoded"
            );
            Ok(book)
        }

        pub fn node(&self, index: u32) -> Option<&SlabNode> {
            self.nodes.get(index as usize)
        }

        pub fn leaves(&self) -> impl Iterator<Item = (u32, &LeafNode)> {
            self.nodes.iter().enumerate().filter_map(|(i, n)| match n {
                SlabNode::Leaf(leaf) => Some((i as u32, leaf)),
                _ => None,
            })
        }

        // Live orders sorted best-first. Equal prices keep arena order.
        pub fn orders(&self, query: &BookQuery) -> BookOrders {
            let mut orders: Vec<OpenOrder> = self
                .leaves()
                .filter(|(_, leaf)| query.include_expired || leaf.is_valid(query.now))
                .map(|(index, leaf)| OpenOrder::from_leaf(self.side, index, leaf))
                .collect();

            match self.side {
                Side::Ask => orders.sort_by(|a, b| a.price.cmp(&b.price)),
                Side::Bid => orders.sort_by(|a, b| b.price.cmp(&a.price)),
            }
            trace!(side = ?self.side, count = orders.len(), now = query.now, "reconstructed orders");
            BookOrders { side: self.side, orders }
        }

        pub fn best(&self, query: &BookQuery) -> Option<OpenOrder> {
            self.orders(query).best().cloned()
        }

        pub fn impact_price(&self, quantity: i64, query: &BookQuery) -> ImpactPrice {
            self.orders(query).impact_price(quantity)
        }

        pub fn verify(&self) -> DecodeResult<()> {
            let result = self.verify_inner();
            if let Err(err) = &result {
                warn!(side = ?self.side, %err, "slab failed verification");
            }
            result
        }

        fn verify_inner(&self) -> DecodeResult<()> {
            let mut leaves = 0u64;
            if self.leaf_count > 0 {
                let mut visited = vec![false; self.nodes.len()];
                let mut stack = vec![self.root_node];
                while let Some(index) = stack.pop() {
                    let node = self.node(index).ok_or(DecodeError::MalformedTree {
                        index,
                        reason: "child index outside arena",
                    })?;
                    if std::mem::replace(&mut visited[index as usize], true) {
                        return Err(DecodeError::MalformedTree { index, reason: "node reachable twice" });
                    }
                    match node {
                        SlabNode::Inner(inner) => stack.extend(inner.children.iter().rev()),
                        SlabNode::Leaf(_) => leaves += 1,
                        _ => {
                            return Err(DecodeError::MalformedTree {
                                index,
                                reason: "tree links to a slot that is not in use",
                            })
                        }
                    }
                }
            }
            if leaves != self.leaf_count {
                return Err(DecodeError::MalformedTree {
                    index: self.root_node,
                    reason: "reachable leaves differ from leaf count",
                });
            }
            if self.leaves().count() as u64 != self.leaf_count {
                return Err(DecodeError::MalformedTree {
                    index: self.root_node,
                    reason: "leaf slots differ from leaf count",
                });
            }

            let free = self.nodes.iter().filter(|n| n.is_free()).count() as u64;
            if free != self.free_list_len {
                return Err(DecodeError::MalformedTree {
                    index: self.free_list_head,
                    reason: "free slots differ from free list length",
                });
            }
            if self.free_list_len > 0 && !self.node(self.free_list_head).map_or(false, SlabNode::is_free) {
                return Err(DecodeError::MalformedTree {
                    index: self.free_list_head,
                    reason: "free list head is not a free slot",
                });
            }
            Ok(())
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct OpenOrder {
        pub side: Side,
        pub order_id: i128,
        pub price: i64,
        pub quantity: i64,
        pub owner: Pubkey,
        pub owner_slot: u8,
        pub client_order_id: u64,
        pub order_type: OrderType,
        pub timestamp: u64,
        pub time_in_force: u8,
        pub expiry: Option<u64>,
        pub best_initial: i64,
        pub arena_index: u32,
    }

    impl OpenOrder {
        pub fn from_leaf(side: Side, arena_index: u32, leaf: &LeafNode) -> Self {
            Self {
                side,
                order_id: leaf.key,
                price: leaf.price(),
                quantity: leaf.quantity,
                owner: leaf.owner,
                owner_slot: leaf.owner_slot,
                client_order_id: leaf.client_order_id,
                order_type: leaf.order_type,
                timestamp: leaf.timestamp,
                time_in_force: leaf.time_in_force,
                expiry: leaf.expiry(),
                best_initial: leaf.best_initial,
                arena_index,
            }
        }

        // Placement sequence number; bid keys store it bit-inverted.
        pub fn seq_num(&self) -> u64 {
            let low = self.order_id as u64;
            match self.side {
                Side::Bid => !low,
                Side::Ask => low,
            }
        }

        pub fn is_expired(&self, now: u64) -> bool {
            self.expiry.map_or(false, |expiry| now >= expiry)
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum ImpactPrice {
        Price(i64),
        InsufficientDepth,
    }

    impl ImpactPrice {
        pub fn price(self) -> Option<i64> {
            match self {
                ImpactPrice::Price(p) => Some(p),
                ImpactPrice::InsufficientDepth => None,
            }
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PriceLevel {
        pub price: i64,
        pub quantity: i64,
        pub orders: usize,
    }

    #[derive(Clone, Debug, PartialEq)]
    pub struct BookOrders {
        side: Side,
        orders: Vec<OpenOrder>,
    }

    impl BookOrders {
        pub fn side(&self) -> Side {
            self.side
        }

        pub fn as_slice(&self) -> &[OpenOrder] {
            &self.orders
        }

        pub fn into_vec(self) -> Vec<OpenOrder> {
            self.orders
        }

        pub fn len(&self) -> usize {
            self.orders.len()
        }

        pub fn is_empty(&self) -> bool {
            self.orders.is_empty()
        }

        pub fn iter(&self) -> std::slice::Iter<'_, OpenOrder> {
            self.orders.iter()
        }

        pub fn best(&self) -> Option<&OpenOrder> {
            self.orders.first()
        }

        // Price of the first order at which cumulative size exceeds `quantity`.
        pub fn impact_price(&self, quantity: i64) -> ImpactPrice {
            let mut filled: i128 = 0;
            for order in &self.orders {
                filled += order.quantity as i128;
                if filled > quantity as i128 {
                    return ImpactPrice::Price(order.price);
                }
            }
            ImpactPrice::InsufficientDepth
        }

        pub fn levels(&self, depth: usize) -> Vec<PriceLevel> {
            let mut levels: Vec<PriceLevel> = Vec::with_capacity(depth.min(self.orders.len()));
            for order in &self.orders {
                match levels.last_mut() {
                    Some(level) if level.price == order.price => {
                        level.quantity = level.quantity.saturating_add(order.quantity);
                        level.orders += 1;
                    }
                    _ => {
                        if levels.len() == depth {
                            break;
                        }
                        levels.push(PriceLevel { price: order.price, quantity: order.quantity, orders: 1 });
                    }
                }
            }
            levels
        }
    }

    impl<'a> IntoIterator for &'a BookOrders {
        type Item = &'a OpenOrder;
        type IntoIter = std::slice::Iter<'a, OpenOrder>;

        fn into_iter(self) -> Self::IntoIter {
            self.orders.iter()
        }
    }
}

// 8. mod config
pub mod config {
    use serde::{Deserialize, Serialize};
    use crate::fixed_point::FixedPoint128;
    use crate::state::PerpMarket;

    // Book reconstruction options. `now` is in seconds since the epoch.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct BookQuery {
        pub now: u64,
        pub include_expired: bool,
    }

    impl BookQuery {
        pub fn at(now: u64) -> Self {
            Self { now, include_expired: false }
        }

        pub fn including_expired(now: u64) -> Self {
            Self { now, include_expired: true }
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct PerpMarketConfig {
        pub base_decimals: u8,
        pub quote_decimals: u8,
        pub base_lot_size: i64,
        pub quote_lot_size: i64,
    }

    pub(crate) fn pow10(decimals: u8) -> Option<FixedPoint128> {
        10i128.checked_pow(decimals as u32).and_then(FixedPoint128::checked_from_int)
    }

    impl PerpMarketConfig {
        pub fn from_perp_market(market: &PerpMarket, base_decimals: u8, quote_decimals: u8) -> Self {
            Self {
                base_decimals,
                quote_decimals,
                base_lot_size: market.base_lot_size,
                quote_lot_size: market.quote_lot_size,
            }
        }

        pub fn base_lots_to_number(&self, lots: i64) -> Option<FixedPoint128> {
            FixedPoint128::checked_from_int(lots as i128 * self.base_lot_size as i128)?
                .checked_div(pow10(self.base_decimals)?)
        }

        pub fn ui_quantity(&self, raw_quantity: i64) -> Option<FixedPoint128> {
            self.base_lots_to_number(raw_quantity)
        }

        pub fn ui_price(&self, raw_price: i64) -> Option<FixedPoint128> {
            let quote = FixedPoint128::checked_from_int(raw_price as i128 * self.quote_lot_size as i128)?
                .checked_mul(pow10(self.base_decimals)?)?;
            let base = FixedPoint128::from_int(self.base_lot_size).checked_mul(pow10(self.quote_decimals)?)?;
            quote.checked_div(base)
        }
    }
}

// 9. mod rates
pub mod rates {
    use tracing::warn;
    use crate::config::{pow10, PerpMarketConfig};
    use crate::fixed_point::FixedPoint128;
    use crate::state::{PerpMarketCacheEntry, RootBank};

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct InterestCurve {
        pub optimal_util: FixedPoint128,
        pub optimal_rate: FixedPoint128,
        pub max_rate: FixedPoint128,
    }

    impl RootBank {
        pub fn interest_curve(&self) -> InterestCurve {
            InterestCurve {
                optimal_util: self.optimal_util,
                optimal_rate: self.optimal_rate,
                max_rate: self.max_rate,
            }
        }
    }

    // Rate outcome where the pool state leaves the curve undefined.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum RateQuote {
        Rate(FixedPoint128),
        Maximum,
    }

    impl RateQuote {
        pub fn resolve(self, max_rate: FixedPoint128) -> FixedPoint128 {
            match self {
                RateQuote::Rate(rate) => rate,
                RateQuote::Maximum => max_rate,
            }
        }

        pub fn rate(self) -> Option<FixedPoint128> {
            match self {
                RateQuote::Rate(rate) => Some(rate),
                RateQuote::Maximum => None,
            }
        }
    }

    // None for an empty pool or a quotient outside the I80F48 range
    pub fn utilization(
        total_deposits: FixedPoint128,
        total_borrows: FixedPoint128,
    ) -> Option<FixedPoint128> {
        total_borrows.checked_div(total_deposits)
    }

    // Two-segment curve with its kink at optimal_util. None when a step overflows.
    pub fn borrow_rate(curve: &InterestCurve, utilization: FixedPoint128) -> Option<FixedPoint128> {
        let InterestCurve { optimal_util, optimal_rate, max_rate } = *curve;

        if optimal_util.is_zero() && utilization <= FixedPoint128::ZERO {
            return Some(optimal_rate);
        }
        if utilization > optimal_util && optimal_util < FixedPoint128::ONE {
            let extra = utilization.checked_sub(optimal_util)?;
            let span = FixedPoint128::ONE.checked_sub(optimal_util)?;
            let slope = max_rate.checked_sub(optimal_rate)?.checked_div(span)?;
            return optimal_rate.checked_add(slope.checked_mul(extra)?);
        }
        // u / u* is exactly one at the kink, so both segments meet there
        let ratio = utilization.checked_div(optimal_util)?;
        optimal_rate.checked_mul(ratio)
    }

    pub fn bank_borrow_rate(
        curve: &InterestCurve,
        total_deposits: FixedPoint128,
        total_borrows: FixedPoint128,
    ) -> RateQuote {
        if total_deposits.is_zero() && total_borrows.is_zero() {
            return RateQuote::Rate(FixedPoint128::ZERO);
        }
        if total_deposits <= total_borrows {
            return RateQuote::Maximum;
        }
        match utilization(total_deposits, total_borrows).and_then(|u| borrow_rate(curve, u)) {
            Some(rate) => RateQuote::Rate(rate),
            None => RateQuote::Maximum,
        }
    }

    pub fn deposit_rate(
        curve: &InterestCurve,
        total_deposits: FixedPoint128,
        total_borrows: FixedPoint128,
    ) -> RateQuote {
        if total_deposits.is_zero() && total_borrows.is_zero() {
            return RateQuote::Rate(FixedPoint128::ZERO);
        }
        let Some(u) = utilization(total_deposits, total_borrows) else {
            return RateQuote::Maximum;
        };
        let borrow = bank_borrow_rate(curve, total_deposits, total_borrows).resolve(curve.max_rate);
        match u.checked_mul(borrow) {
            Some(rate) => RateQuote::Rate(rate),
            None => RateQuote::Maximum,
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FundingSample {
        pub long_funding: FixedPoint128,
        pub short_funding: FixedPoint128,
    }

    impl From<&PerpMarketCacheEntry> for FundingSample {
        fn from(entry: &PerpMarketCacheEntry) -> Self {
            Self { long_funding: entry.long_funding, short_funding: entry.short_funding }
        }
    }

    impl FundingSample {
        fn midpoint(&self) -> Option<FixedPoint128> {
            self.long_funding
                .checked_add(self.short_funding)?
                .checked_div(FixedPoint128::from_int(2))
        }
    }

    // Percentage of the base price. Zero when market is absent, the price is
    // zero, or a step overflows.
    pub fn funding_rate(
        oldest: &FundingSample,
        latest: &FundingSample,
        oracle_price: FixedPoint128,
        market: Option<&PerpMarketConfig>,
    ) -> FixedPoint128 {
        let Some(market) = market else {
            return FixedPoint128::ZERO;
        };
        if oracle_price.is_zero() {
            return FixedPoint128::ZERO;
        }
        match checked_funding_rate(oldest, latest, oracle_price, market) {
            Some(rate) => rate,
            None => {
                warn!(?market, "funding rate overflowed, reporting zero");
                FixedPoint128::ZERO
            }
        }
    }

    fn checked_funding_rate(
        oldest: &FundingSample,
        latest: &FundingSample,
        oracle_price: FixedPoint128,
        market: &PerpMarketConfig,
    ) -> Option<FixedPoint128> {
        let diff = latest.midpoint()?.checked_sub(oldest.midpoint()?)?;
        let in_quote = diff.checked_div(pow10(market.quote_decimals)?)?;
        let base_price_in_lots = oracle_price.checked_mul(market.base_lots_to_number(1)?)?;
        if base_price_in_lots.is_zero() {
            return Some(FixedPoint128::ZERO);
        }
        in_quote
            .checked_div(base_price_in_lots)?
            .checked_mul(FixedPoint128::from_int(100))
    }
}
