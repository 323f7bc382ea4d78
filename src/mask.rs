//! Favorable-period bitmasks.
//!
//! A day is split into 96 slots of 15 minutes. Six 16-bit registers carry one bit per slot:
//! register `r` covers slots `r * 16 .. r * 16 + 16` and bit `b` (least significant first) of it
//! stands for slot `r * 16 + b`. So the LSB is always the earliest quarter-hour within the
//! register's four hour span.

pub const SLOTS_PER_DAY: usize = 96;
pub const SLOT_DURATION_MINUTES: u32 = 15;
pub const REGISTERS_PER_BANK: usize = 6;
pub const SLOTS_PER_REGISTER: usize = u16::BITS as usize;

const _ASSERT_BANK_COVERS_DAY: () = assert!(REGISTERS_PER_BANK * SLOTS_PER_REGISTER == SLOTS_PER_DAY);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BankError {
    #[error("a register bank needs exactly {REGISTERS_PER_BANK} values, got {0}")]
    Length(usize),
    #[error("value {value} at position {index} does not fit into an unsigned 16-bit register")]
    OutOfRange { index: usize, value: i64 },
    #[error("value {value} at position {index} is not a whole number")]
    NotAWholeNumber { index: usize, value: String },
}

/// Six registers worth of slot bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(transparent)]
pub struct RegisterBank([u16; REGISTERS_PER_BANK]);

impl RegisterBank {
    pub const ZERO: Self = Self([0; REGISTERS_PER_BANK]);

    pub const fn new(words: [u16; REGISTERS_PER_BANK]) -> Self {
        Self(words)
    }

    /// Validate raw integers, e.g. as they arrive in a request.
    ///
    /// Either all six values are accepted or the bank is not constructed at all.
    pub fn from_values(values: &[i64]) -> Result<Self, BankError> {
        let values: &[i64; REGISTERS_PER_BANK] =
            values.try_into().map_err(|_| BankError::Length(values.len()))?;
        let mut words = [0; REGISTERS_PER_BANK];
        for (index, (word, &value)) in words.iter_mut().zip(values).enumerate() {
            *word = u16::try_from(value).map_err(|_| BankError::OutOfRange { index, value })?;
        }
        Ok(Self(words))
    }

    /// Decode from register words as read from the device. Needs exactly six words.
    pub fn from_words(words: &[u16]) -> Option<Self> {
        words.try_into().ok().map(Self)
    }

    pub const fn words(&self) -> [u16; REGISTERS_PER_BANK] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Whether the slot (0..96) is marked as a favorable period.
    pub fn slot(&self, slot: usize) -> bool {
        assert!(slot < SLOTS_PER_DAY, "slot {slot} is out of range");
        self.0[slot / SLOTS_PER_REGISTER] & (1 << (slot % SLOTS_PER_REGISTER)) != 0
    }

    pub fn set_slot(&mut self, slot: usize, favorable: bool) {
        assert!(slot < SLOTS_PER_DAY, "slot {slot} is out of range");
        let bit = 1 << (slot % SLOTS_PER_REGISTER);
        let word = &mut self.0[slot / SLOTS_PER_REGISTER];
        if favorable {
            *word |= bit;
        } else {
            *word &= !bit;
        }
    }

    pub fn favorable_slots(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }
}

impl std::fmt::Display for RegisterBank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "[{a},{b},{c},{d},{e},{g}]")
    }
}

/// Granularity of an input price series. Only divisors of an hour that are multiples of the
/// 15 minute slot are accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SlotMinutes {
    Fifteen,
    Thirty,
    #[default]
    Sixty,
}

impl SlotMinutes {
    pub const fn minutes(self) -> u32 {
        match self {
            Self::Fifteen => 15,
            Self::Thirty => 30,
            Self::Sixty => 60,
        }
    }
}

impl TryFrom<i64> for SlotMinutes {
    type Error = i64;
    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Ok(match value {
            15 => Self::Fifteen,
            30 => Self::Thirty,
            60 => Self::Sixty,
            other => return Err(other),
        })
    }
}

impl std::str::FromStr for SlotMinutes {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.parse::<i64>().map_err(|e| e.to_string())?;
        Self::try_from(value).map_err(|v| format!("{v} is not one of 15, 30 or 60"))
    }
}

/// Build a bank from a price series.
///
/// Every input price is repeated `max(1, slot_minutes / 15)` times to reach 15 minute
/// resolution. A slot is favorable when its price is strictly below `threshold`; `flip` inverts
/// that, so with `flip` a price equal to or above the threshold is favorable.
///
/// The expanded series is cut off after 96 slots. A shorter series is padded with `0.0`, which
/// for the usual positive threshold makes the missing tail of the day favorable.
pub fn build_mask(prices: &[f64], threshold: f64, flip: bool, slot_minutes: u32) -> RegisterBank {
    let bits_per_input = (slot_minutes / SLOT_DURATION_MINUTES).max(1) as usize;
    let expanded = prices
        .iter()
        .flat_map(|&price| std::iter::repeat_n(price, bits_per_input))
        .chain(std::iter::repeat(0.0))
        .take(SLOTS_PER_DAY);
    let mut bank = RegisterBank::ZERO;
    for (slot, price) in expanded.enumerate() {
        bank.set_slot(slot, (price < threshold) != flip);
    }
    bank
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_equal_to_threshold_is_not_favorable() {
        assert_eq!(build_mask(&[400.0; 24], 400.0, false, 60), RegisterBank::ZERO);
    }

    #[test]
    fn prices_below_threshold_fill_the_day() {
        assert_eq!(build_mask(&[0.0; 24], 400.0, false, 60).words(), [u16::MAX; 6]);
    }

    #[test]
    fn flip_is_an_exact_complement() {
        let series: [&[f64]; 4] = [
            &[400.0; 24],
            &[-5.0, 10.0, 0.0, 3.5, 12.0, -0.1, 1.0, 2.0],
            &[1.0, 2.0, 3.0],
            &[0.5; 130],
        ];
        for prices in series {
            for slot_minutes in [15, 30, 60] {
                let plain = build_mask(prices, 1.0, false, slot_minutes).words();
                let flipped = build_mask(prices, 1.0, true, slot_minutes).words();
                for (p, f) in plain.iter().zip(flipped) {
                    assert_eq!(f, u16::MAX ^ p);
                }
            }
        }
    }

    #[test]
    fn quarter_hour_prices_map_one_to_one() {
        let prices: Vec<f64> = (0..96).map(|k| if k % 3 == 0 { -1.0 } else { 1.0 }).collect();
        let bank = build_mask(&prices, 0.0, false, 15);
        for k in 0..96 {
            assert_eq!(bank.slot(k), k % 3 == 0, "slot {k}");
        }
    }

    #[test]
    fn hourly_prices_cover_four_slots_each() {
        let prices: Vec<f64> = (0..24).map(|h| if h % 5 == 1 { -1.0 } else { 1.0 }).collect();
        let bank = build_mask(&prices, 0.0, false, 60);
        for hour in 0..24 {
            for slot in 4 * hour..4 * hour + 4 {
                assert_eq!(bank.slot(slot), hour % 5 == 1, "hour {hour} slot {slot}");
            }
        }
    }

    #[test]
    fn half_hourly_prices_cover_two_slots_each() {
        let mut prices = vec![10.0; 48];
        prices[1] = -3.0;
        let bank = build_mask(&prices, 0.0, false, 30);
        assert_eq!(bank.words(), [0b1100, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn short_series_tail_defaults_to_favorable() {
        // 12 hours of expensive prices, the afternoon is missing.
        let bank = build_mask(&[100.0; 12], 50.0, false, 60);
        assert_eq!(bank.words(), [0, 0, 0, u16::MAX, u16::MAX, u16::MAX]);
    }

    #[test]
    fn long_series_is_truncated() {
        let mut prices = vec![100.0; 96];
        prices.extend([-100.0; 20]);
        assert_eq!(build_mask(&prices, 0.0, false, 15), RegisterBank::ZERO);
    }

    #[test]
    fn odd_granularity_floors_to_whole_slots() {
        // 20 minutes is treated as a single slot per input, as is anything below 15.
        assert_eq!(build_mask(&[-1.0, 5.0, -1.0], 0.0, false, 20).words()[0] & 0b111, 0b101);
        assert_eq!(build_mask(&[-1.0, 5.0, -1.0], 0.0, false, 0).words()[0] & 0b111, 0b101);
        // 50 minutes floors to three slots.
        assert_eq!(build_mask(&[-1.0, 5.0], 0.0, false, 50).words()[0] & 0b111111, 0b000111);
    }

    #[test]
    fn bank_from_values_validates_everything() {
        assert_eq!(RegisterBank::from_values(&[1, 2, 3, 4, 5]), Err(BankError::Length(5)));
        assert_eq!(RegisterBank::from_values(&[0; 7]), Err(BankError::Length(7)));
        assert_eq!(
            RegisterBank::from_values(&[0, 0, 65536, 0, 0, 0]),
            Err(BankError::OutOfRange { index: 2, value: 65536 })
        );
        assert_eq!(
            RegisterBank::from_values(&[0, 0, 0, 0, 0, -1]),
            Err(BankError::OutOfRange { index: 5, value: -1 })
        );
        let bank = RegisterBank::from_values(&[0, 0, 0, 65535, 65535, 65535]).unwrap();
        assert_eq!(bank.words(), [0, 0, 0, u16::MAX, u16::MAX, u16::MAX]);
        assert_eq!(bank.favorable_slots(), 48);
    }

    #[test]
    fn bank_serializes_as_plain_array() {
        let bank = RegisterBank::new([1, 2, 3, 4, 5, 65535]);
        assert_eq!(serde_json::to_string(&bank).unwrap(), "[1,2,3,4,5,65535]");
        assert_eq!(bank.to_string(), "[1,2,3,4,5,65535]");
    }

    #[test]
    fn slot_minutes_accepts_only_known_granularities() {
        assert_eq!(SlotMinutes::try_from(15), Ok(SlotMinutes::Fifteen));
        assert_eq!(SlotMinutes::try_from(60), Ok(SlotMinutes::Sixty));
        assert_eq!(SlotMinutes::try_from(20), Err(20));
        assert!("45".parse::<SlotMinutes>().is_err());
        assert_eq!("30".parse::<SlotMinutes>(), Ok(SlotMinutes::Thirty));
    }
}
