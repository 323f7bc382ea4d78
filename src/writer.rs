//! Getting a plan onto the inverter.

use crate::connection::{self, Connection};
use crate::mask::{REGISTERS_PER_BANK, RegisterBank};
use crate::modbus::{self, Operation, ResponseKind};
use crate::plan::{BankId, BuySwitch, PricePlan};
use crate::registers::{self, DataType, Value};
use std::future::Future;
use tracing::{debug, trace};

#[derive(thiserror::Error, Debug)]
pub enum WriteError {
    #[error("could not talk to the inverter")]
    Connection(#[source] connection::Error),
    #[error("inverter refused the request with exception code {0}")]
    Exception(u8),
    #[error("inverter acknowledged {got} registers at {address}, expected {expected}")]
    Acknowledgement { address: u16, expected: usize, got: u16 },
    #[error("inverter sent a response that does not match the request")]
    UnexpectedResponse,
}

/// The capability to read and write holding registers of one inverter.
///
/// A write either completes or fails as a whole; there is no partial success to report.
pub trait RegisterWriter: Send + Sync {
    fn write_registers(
        &self,
        address: u16,
        values: Vec<u16>,
    ) -> impl Future<Output = Result<(), WriteError>> + Send;

    fn read_registers(
        &self,
        address: u16,
        count: u16,
    ) -> impl Future<Output = Result<Vec<u16>, WriteError>> + Send;
}

impl RegisterWriter for Connection {
    async fn write_registers(&self, address: u16, values: Vec<u16>) -> Result<(), WriteError> {
        let expected = values.len();
        let operation = Operation::SetHoldings { address, values };
        let response = self.send_retrying(operation).await.map_err(WriteError::Connection)?;
        match response.kind {
            ResponseKind::ErrorCode(code) => Err(WriteError::Exception(code)),
            ResponseKind::SetHoldings { address: a, words }
                if a == address && usize::from(words) == expected =>
            {
                Ok(())
            }
            ResponseKind::SetHoldings { words, .. } => {
                Err(WriteError::Acknowledgement { address, expected, got: words })
            }
            ResponseKind::GetHoldings { .. } => Err(WriteError::UnexpectedResponse),
        }
    }

    async fn read_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, WriteError> {
        let operation = Operation::GetHoldings { address, count };
        let response = self.send_retrying(operation).await.map_err(WriteError::Connection)?;
        match response.kind {
            ResponseKind::ErrorCode(code) => Err(WriteError::Exception(code)),
            ResponseKind::GetHoldings { values } if values.len() == 2 * usize::from(count) => {
                Ok(modbus::words_from_bytes(&values))
            }
            _ => Err(WriteError::UnexpectedResponse),
        }
    }
}

/// The parts of a plan one commit puts onto the device. Anything `None` stays untouched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlanWrite {
    pub neg_price_enable: Option<bool>,
    pub buy_switch: Option<BuySwitch>,
    pub sell_today: Option<RegisterBank>,
    pub sell_tomorrow: Option<RegisterBank>,
    pub buy_today: Option<RegisterBank>,
    pub buy_tomorrow: Option<RegisterBank>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteOperation {
    pub address: u16,
    pub values: Vec<u16>,
}

impl PlanWrite {
    /// Promote tomorrow into today and clear tomorrow, for all four banks.
    pub fn rollover(plan: &PricePlan) -> Self {
        let promoted = plan.promoted();
        Self {
            sell_today: Some(promoted.sell_today),
            sell_tomorrow: Some(promoted.sell_tomorrow),
            buy_today: Some(promoted.buy_today),
            buy_tomorrow: Some(promoted.buy_tomorrow),
            ..Self::default()
        }
    }

    pub fn bank(&self, id: BankId) -> Option<RegisterBank> {
        match id {
            BankId::SELL_TODAY => self.sell_today,
            BankId::SELL_TOMORROW => self.sell_tomorrow,
            BankId::BUY_TODAY => self.buy_today,
            _ => self.buy_tomorrow,
        }
    }

    pub fn set_bank(&mut self, id: BankId, bank: RegisterBank) {
        let slot = match id {
            BankId::SELL_TODAY => &mut self.sell_today,
            BankId::SELL_TOMORROW => &mut self.sell_tomorrow,
            BankId::BUY_TODAY => &mut self.buy_today,
            _ => &mut self.buy_tomorrow,
        };
        *slot = Some(bank);
    }

    pub fn banks(&self) -> impl Iterator<Item = (BankId, RegisterBank)> + '_ {
        BankId::ALL.into_iter().filter_map(|id| Some((id, self.bank(id)?)))
    }

    pub fn is_empty(&self) -> bool {
        self.neg_price_enable.is_none() && self.buy_switch.is_none() && self.banks().next().is_none()
    }

    /// Registers to write, in order. Contiguous parts are merged into a single request.
    ///
    /// Sell banks are always written together with the RTC date register that precedes them.
    pub fn operations(&self, today: jiff::civil::Date) -> Vec<WriteOperation> {
        let tomorrow = today.tomorrow().unwrap_or(today);
        let mut ops = Vec::new();
        if let Some(enable) = self.neg_price_enable {
            ops.push(WriteOperation {
                address: registers::NEG_PRICE_ENABLE,
                values: vec![u16::from(enable)],
            });
        }
        if let Some(bank) = self.sell_today {
            ops.push(dated_bank(registers::RTC_TODAY, today, bank));
        }
        if let Some(bank) = self.sell_tomorrow {
            ops.push(dated_bank(registers::RTC_TOMORROW, tomorrow, bank));
        }
        let mut buy_today = self.buy_today.map(|bank| WriteOperation {
            address: registers::bank_address(BankId::BUY_TODAY),
            values: bank.words().to_vec(),
        });
        if let Some(switch) = self.buy_switch {
            let mut values = vec![switch.to_register()];
            values.extend(buy_today.take().map(|op| op.values).unwrap_or_default());
            ops.push(WriteOperation { address: registers::BUY_SWITCH, values });
        }
        ops.extend(buy_today);
        if let Some(bank) = self.buy_tomorrow {
            ops.push(WriteOperation {
                address: registers::bank_address(BankId::BUY_TOMORROW),
                values: bank.words().to_vec(),
            });
        }
        ops
    }
}

fn dated_bank(rtc_address: u16, date: jiff::civil::Date, bank: RegisterBank) -> WriteOperation {
    let mut values = Vec::with_capacity(1 + REGISTERS_PER_BANK);
    values.push(registers::encode_rtc_date(date));
    values.extend(bank.words());
    WriteOperation { address: rtc_address, values }
}

/// Write everything `write` describes, stopping at the first failure.
pub async fn write_plan<W: RegisterWriter>(
    writer: &W,
    write: &PlanWrite,
    today: jiff::civil::Date,
) -> Result<(), WriteError> {
    for WriteOperation { address, values } in write.operations(today) {
        trace!(address, ?values, "writing registers");
        writer.write_registers(address, values).await?;
    }
    debug!(%today, "plan written");
    Ok(())
}

/// The whole negative price block as read back from the inverter.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct PlanSnapshot {
    pub plan: PricePlan,
    /// Raw buy switch word, in case the inverter holds something outside of the known values.
    pub buy_switch_raw: u16,
    pub rtc_today: Value,
    pub rtc_tomorrow: Value,
}

impl PlanSnapshot {
    pub fn decode(words: &[u16]) -> Option<Self> {
        if words.len() != usize::from(registers::PLAN_BLOCK_LEN) {
            return None;
        }
        let word = |address: u16| words[usize::from(address - registers::PLAN_BLOCK_START)];
        let bank = |id: BankId| {
            let start = usize::from(registers::bank_address(id) - registers::PLAN_BLOCK_START);
            RegisterBank::from_words(&words[start..][..REGISTERS_PER_BANK])
        };
        let buy_switch_raw = word(registers::BUY_SWITCH);
        Some(Self {
            plan: PricePlan {
                sell_today: bank(BankId::SELL_TODAY)?,
                sell_tomorrow: bank(BankId::SELL_TOMORROW)?,
                buy_today: bank(BankId::BUY_TODAY)?,
                buy_tomorrow: bank(BankId::BUY_TOMORROW)?,
                buy_switch: BuySwitch::from_raw(i64::from(buy_switch_raw)),
                neg_price_enable: Some(word(registers::NEG_PRICE_ENABLE) != 0),
            },
            buy_switch_raw,
            rtc_today: DataType::Date.from_word(word(registers::RTC_TODAY)),
            rtc_tomorrow: DataType::Date.from_word(word(registers::RTC_TOMORROW)),
        })
    }
}

pub async fn read_plan<W: RegisterWriter>(writer: &W) -> Result<Option<PlanSnapshot>, WriteError> {
    let words = writer.read_registers(registers::PLAN_BLOCK_START, registers::PLAN_BLOCK_LEN).await?;
    Ok(PlanSnapshot::decode(&words))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// An inverter that only has the negative price register block, kept in memory.
    #[derive(Default)]
    pub(crate) struct MemoryInverter {
        registers: Mutex<Vec<u16>>,
        fail_writes: AtomicBool,
        fail_reads: AtomicBool,
        writes: AtomicUsize,
    }

    impl MemoryInverter {
        pub(crate) fn new() -> Self {
            Self {
                registers: Mutex::new(vec![0; usize::from(registers::PLAN_BLOCK_LEN)]),
                ..Self::default()
            }
        }

        pub(crate) fn fail_writes(&self, fail: bool) {
            self.fail_writes.store(fail, Ordering::SeqCst);
        }

        pub(crate) fn fail_reads(&self, fail: bool) {
            self.fail_reads.store(fail, Ordering::SeqCst);
        }

        pub(crate) fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }

        pub(crate) fn words(&self) -> Vec<u16> {
            self.registers.lock().unwrap().clone()
        }

        pub(crate) fn snapshot(&self) -> PlanSnapshot {
            PlanSnapshot::decode(&self.words()).unwrap()
        }
    }

    impl RegisterWriter for MemoryInverter {
        async fn write_registers(&self, address: u16, values: Vec<u16>) -> Result<(), WriteError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(WriteError::Exception(4));
            }
            let mut image = self.registers.lock().unwrap();
            let offset = usize::from(address - registers::PLAN_BLOCK_START);
            image[offset..][..values.len()].copy_from_slice(&values);
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn read_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, WriteError> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(WriteError::Exception(4));
            }
            let image = self.registers.lock().unwrap();
            let offset = usize::from(address - registers::PLAN_BLOCK_START);
            Ok(image[offset..][..usize::from(count)].to_vec())
        }
    }
}
