use crate::plan::{BankId, Day, Direction};

/// How the word stored in a register is to be interpreted.
#[derive(Clone, Copy, serde::Serialize, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    U16,
    Bool,
    /// Calendar day encoded as `(month << 8) | day`.
    Date,
    /// 16 quarter-hour slots, least significant bit first.
    Mask,
}

impl DataType {
    pub fn from_word(self, word: u16) -> Value {
        match self {
            Self::U16 => Value::U16(word),
            Self::Bool => Value::Bool(word != 0),
            Self::Date => Value::Date { month: (word >> 8) as u8, day: word as u8 },
            Self::Mask => Value::Mask(word),
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::U16 => "u16",
            Self::Bool => "bool",
            Self::Date => "date",
            Self::Mask => "mask",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Value {
    U16(u16),
    Bool(bool),
    Date { month: u8, day: u8 },
    Mask(u16),
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Value::U16(n) => write!(f, "{n}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Date { month, day } => write!(f, "{month:02}-{day:02}"),
            Value::Mask(m) => write!(f, "{m:#06x}"),
        }
    }
}

impl serde::Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match *self {
            Value::U16(n) | Value::Mask(n) => serializer.serialize_u16(n),
            Value::Bool(b) => serializer.serialize_bool(b),
            Value::Date { .. } => serializer.collect_str(self),
        }
    }
}

/// Encode a calendar date the way the inverter's RTC date registers expect it.
pub fn encode_rtc_date(date: jiff::civil::Date) -> u16 {
    ((date.month() as u16) << 8) | date.day() as u16
}

#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct Mode(u8);

impl serde::Serialize for Mode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.0 & Self::R.0 == 0 { "-" } else { "R" })?;
        f.write_str(if self.0 & Self::W.0 == 0 { "-" } else { "W" })?;
        Ok(())
    }
}

impl Mode {
    pub const R: Self = Self(1 << 0);
    pub const W: Self = Self(1 << 1);
    pub const RW: Self = Self(Self::R.0 | Self::W.0);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterIndex(usize);

impl RegisterIndex {
    pub fn from_address(address: u16) -> Option<RegisterIndex> {
        let index = ADDRESSES.partition_point(|v| *v < address);
        (ADDRESSES.get(index) == Some(&address)).then_some(Self(index))
    }

    pub fn from_name(name: &str) -> Option<RegisterIndex> {
        let index = NAMES.iter().position(|v| *v == name);
        index.map(Self)
    }

    pub fn address(&self) -> u16 {
        ADDRESSES[self.0]
    }

    pub fn name(&self) -> &'static str {
        NAMES[self.0]
    }

    pub fn data_type(&self) -> DataType {
        DATA_TYPES[self.0]
    }
}

/// First register of the negative price plan block.
pub const PLAN_BLOCK_START: u16 = 47785;
/// Number of registers in the block, from the enable switch up to the last buy-tomorrow word.
pub const PLAN_BLOCK_LEN: u16 = 28;

pub const NEG_PRICE_ENABLE: u16 = 47785;
pub const RTC_TODAY: u16 = 47786;
pub const RTC_TOMORROW: u16 = 47793;
pub const BUY_SWITCH: u16 = 47800;

/// Address of the first of the six registers of a bank.
pub const fn bank_address(id: BankId) -> u16 {
    match (id.direction, id.day) {
        (Direction::Sell, Day::Today) => 47787,
        (Direction::Sell, Day::Tomorrow) => 47794,
        (Direction::Buy, Day::Today) => 47801,
        (Direction::Buy, Day::Tomorrow) => 47807,
    }
}

macro_rules! for_each_register {
    ($m:ident) => {
        $m! {
            47785: Bool, RW, "NEG_PRICE_ENABLE", min = 0, max = 1;
            47786: Date, RW, "NEG_PRICE_RTC_TODAY";
            47787: Mask, RW, "NEG_PRICE_SELL_TODAY_1";
            47788: Mask, RW, "NEG_PRICE_SELL_TODAY_2";
            47789: Mask, RW, "NEG_PRICE_SELL_TODAY_3";
            47790: Mask, RW, "NEG_PRICE_SELL_TODAY_4";
            47791: Mask, RW, "NEG_PRICE_SELL_TODAY_5";
            47792: Mask, RW, "NEG_PRICE_SELL_TODAY_6";
            47793: Date, RW, "NEG_PRICE_RTC_TOMORROW";
            47794: Mask, RW, "NEG_PRICE_SELL_TOMORROW_1";
            47795: Mask, RW, "NEG_PRICE_SELL_TOMORROW_2";
            47796: Mask, RW, "NEG_PRICE_SELL_TOMORROW_3";
            47797: Mask, RW, "NEG_PRICE_SELL_TOMORROW_4";
            47798: Mask, RW, "NEG_PRICE_SELL_TOMORROW_5";
            47799: Mask, RW, "NEG_PRICE_SELL_TOMORROW_6";
            47800: U16, RW, "NEG_PRICE_BUY_SWITCH", min = 0, max = 2;
            47801: Mask, RW, "NEG_PRICE_BUY_TODAY_1";
            47802: Mask, RW, "NEG_PRICE_BUY_TODAY_2";
            47803: Mask, RW, "NEG_PRICE_BUY_TODAY_3";
            47804: Mask, RW, "NEG_PRICE_BUY_TODAY_4";
            47805: Mask, RW, "NEG_PRICE_BUY_TODAY_5";
            47806: Mask, RW, "NEG_PRICE_BUY_TODAY_6";
            47807: Mask, RW, "NEG_PRICE_BUY_TOMORROW_1";
            47808: Mask, RW, "NEG_PRICE_BUY_TOMORROW_2";
            47809: Mask, RW, "NEG_PRICE_BUY_TOMORROW_3";
            47810: Mask, RW, "NEG_PRICE_BUY_TOMORROW_4";
            47811: Mask, RW, "NEG_PRICE_BUY_TOMORROW_5";
            47812: Mask, RW, "NEG_PRICE_BUY_TOMORROW_6";
        }
    };
}

macro_rules! optional {
    () => {
        None
    };
    ($($lit: tt)+) => {
        Some($($lit)*)
    };
}

macro_rules! make_lists {
    ($($regnum: literal: $dt: ident, $mode: ident, $name: literal $(, min = $min: literal)? $(, max = $max: literal)?;)+) => {
        pub const ADDRESSES: &[u16] = &[$($regnum),*];
        pub const NAMES: &[&str] = &[$($name),*];
        pub const MODES: &[Mode] = &[$(Mode::$mode),*];
        pub const DATA_TYPES: &[DataType] = &[$(DataType::$dt),*];
        pub const MINIMUM_VALUES: &[Option<u16>] = &[$(optional!($($min)?)),*];
        pub const MAXIMUM_VALUES: &[Option<u16>] = &[$(optional!($($max)?)),*];
    };
}

for_each_register!(make_lists);

const _ASSERT_BLOCK_IS_CONTIGUOUS: () = const {
    assert!(ADDRESSES.len() == PLAN_BLOCK_LEN as usize);
    let mut index = 0;
    while index < ADDRESSES.len() {
        assert!(ADDRESSES[index] == PLAN_BLOCK_START + index as u16);
        index += 1;
    }
};

pub static DESCRIPTIONS: &[&str] = &const {
    let mut result = [""; ADDRESSES.len()];
    let mut index = 0;
    while index < result.len() {
        let address = ADDRESSES[index];
        result[index] = match address {
            47785 => "Negative price plan feature switch. 0=Off, 1=On",
            47786 => "Calendar day the sell-today bank applies to, (month << 8) | day",
            47787..=47792 => {
                "Sell plan for today. Each register covers four hours, bit 0 being the earliest \
                 quarter-hour. Bit set = favorable period"
            }
            47793 => "Calendar day the sell-tomorrow bank applies to, (month << 8) | day",
            47794..=47799 => {
                "Sell plan for tomorrow. Each register covers four hours, bit 0 being the earliest \
                 quarter-hour. Bit set = favorable period"
            }
            47800 => {
                "Buy plan behaviour. 0=Disabled, 1=Charge only, 2=Charge and sell in \
                 positive-price periods"
            }
            47801..=47806 => {
                "Buy plan for today. Each register covers four hours, bit 0 being the earliest \
                 quarter-hour. Bit set = favorable period"
            }
            47807..=47812 => {
                "Buy plan for tomorrow. Each register covers four hours, bit 0 being the earliest \
                 quarter-hour. Bit set = favorable period"
            }
            _ => panic!("register without a description"),
        };
        index += 1;
    }
    result
};
