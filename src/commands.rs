use crate::output::Record;
use crate::plan::{BankId, PricePlan};

/// One line of a human readable plan.
#[derive(serde::Serialize)]
pub struct PlanItem {
    pub item: String,
    pub value: serde_json::Value,
}

impl Record for PlanItem {
    fn headers() -> &'static [&'static str] {
        &["Item", "Value"]
    }

    fn cells(&self) -> Vec<String> {
        vec![self.item.clone(), self.value.to_string()]
    }
}

pub fn plan_items(plan: &PricePlan) -> Vec<PlanItem> {
    let mut items = BankId::ALL
        .into_iter()
        .map(|id| PlanItem {
            item: id.to_string(),
            value: plan.bank(id).words().iter().copied().collect(),
        })
        .collect::<Vec<_>>();
    items.push(PlanItem {
        item: "buy_switch".into(),
        value: plan.buy_switch.map(|v| v.to_string()).into(),
    });
    items.push(PlanItem { item: "neg_price_enable".into(), value: plan.neg_price_enable.into() });
    items
}

fn time_zone(name: Option<&str>) -> Result<jiff::tz::TimeZone, jiff::Error> {
    match name {
        None => Ok(jiff::tz::TimeZone::system()),
        Some(name) => jiff::tz::TimeZone::get(name),
    }
}

fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread().enable_all().build()
}

pub mod registers {
    use crate::output::{self, Record};
    use crate::registers::{DataType, Mode};

    /// Search and output the inverter registers this tool knows about.
    #[derive(clap::Parser)]
    pub struct Args {
        /// Only show registers whose address, name or description contain this text.
        filter: Option<String>,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not output the register table")]
        Output(#[from] output::Error),
    }

    #[derive(serde::Serialize)]
    pub struct RegisterSchema {
        pub address: u16,
        pub name: &'static str,
        pub mode: Mode,
        pub data_type: DataType,
        pub minimum: Option<u16>,
        pub maximum: Option<u16>,
        pub description: &'static str,
    }

    impl RegisterSchema {
        pub fn all_registers() -> impl Iterator<Item = Self> {
            use crate::registers::*;
            (0..ADDRESSES.len()).map(|idx| RegisterSchema {
                address: ADDRESSES[idx],
                name: NAMES[idx],
                mode: MODES[idx],
                data_type: DATA_TYPES[idx],
                minimum: MINIMUM_VALUES[idx],
                maximum: MAXIMUM_VALUES[idx],
                description: DESCRIPTIONS[idx],
            })
        }

        pub fn is_match(&self, pattern: &str) -> bool {
            let pattern = pattern.to_uppercase();
            self.name.contains(&pattern)
                || self.description.to_uppercase().contains(&pattern)
                || self.address.to_string().contains(&pattern)
        }
    }

    impl Record for RegisterSchema {
        fn headers() -> &'static [&'static str] {
            &["Address", "Name", "Mode", "Type", "Min", "Max", "Description"]
        }

        fn cells(&self) -> Vec<String> {
            vec![
                self.address.to_string(),
                self.name.to_string(),
                self.mode.to_string(),
                self.data_type.to_string(),
                self.minimum.map(|v| v.to_string()).unwrap_or_default(),
                self.maximum.map(|v| v.to_string()).unwrap_or_default(),
                self.description.to_string(),
            ]
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut output = args.output.to_output()?;
        for register in RegisterSchema::all_registers() {
            if let Some(pattern) = &args.filter {
                if !register.is_match(pattern) {
                    continue;
                }
            }
            output.record(&register)?;
        }
        Ok(output.commit()?)
    }

}

pub mod mask {
    use crate::mask::{self, SLOTS_PER_REGISTER, SlotMinutes};
    use crate::output::{self, Record};

    /// Build a bank from a price series, without talking to any inverter.
    #[derive(clap::Parser)]
    pub struct Args {
        /// Prices, earliest first.
        #[arg(required = true, allow_negative_numbers = true)]
        prices: Vec<f64>,
        /// Slots priced strictly below this are favorable.
        #[arg(long, short = 't', default_value_t = 0.0, allow_negative_numbers = true)]
        threshold: f64,
        /// Make slots priced at or above the threshold favorable instead.
        #[arg(long)]
        flip: bool,
        /// Minutes covered by each price. One of 15, 30 or 60.
        #[arg(long, default_value = "60")]
        slot_minutes: SlotMinutes,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not output the bank")]
        Output(#[from] output::Error),
    }

    /// One register of a bank and the part of the day it covers.
    #[derive(serde::Serialize)]
    pub struct BankWord {
        pub register: usize,
        pub from: String,
        pub to: String,
        pub value: u16,
        /// Slot states, earliest first.
        pub slots: String,
    }

    impl BankWord {
        fn new(register: usize, value: u16) -> Self {
            let hours = |register: usize| format!("{:02}:00", register * SLOTS_PER_REGISTER / 4);
            Self {
                register,
                from: hours(register),
                to: hours(register + 1),
                value,
                slots: (0..SLOTS_PER_REGISTER)
                    .map(|bit| if value & (1 << bit) == 0 { '0' } else { '1' })
                    .collect(),
            }
        }
    }

    impl Record for BankWord {
        fn headers() -> &'static [&'static str] {
            &["Register", "From", "To", "Value", "Slots"]
        }

        fn cells(&self) -> Vec<String> {
            vec![
                (self.register + 1).to_string(),
                self.from.clone(),
                self.to.clone(),
                self.value.to_string(),
                self.slots.clone(),
            ]
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let bank = mask::build_mask(
            &args.prices,
            args.threshold,
            args.flip,
            args.slot_minutes.minutes(),
        );
        tracing::debug!(%bank, favorable = bank.favorable_slots(), "built a bank");
        let mut output = args.output.to_output()?;
        for (register, value) in bank.words().into_iter().enumerate() {
            output.record(&BankWord::new(register, value))?;
        }
        Ok(output.commit()?)
    }

}

pub mod show {
    use super::PlanItem;
    use crate::connection::{self, Connection};
    use crate::output::{self, Record};
    use crate::registers::{self, RegisterIndex, Value};
    use crate::writer::{PlanSnapshot, RegisterWriter as _, WriteError};

    /// Read the negative price plan currently held by an inverter.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        /// List every register instead of the decoded plan.
        #[arg(long)]
        raw: bool,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not read the plan registers")]
        Read(#[source] WriteError),
        #[error("the inverter returned an incomplete register block")]
        IncompleteBlock,
        #[error("could not output the plan")]
        Output(#[from] output::Error),
    }

    #[derive(serde::Serialize)]
    pub struct RegisterValue {
        pub address: u16,
        pub name: &'static str,
        pub value: Value,
    }

    impl Record for RegisterValue {
        fn headers() -> &'static [&'static str] {
            &["Address", "Name", "Value"]
        }

        fn cells(&self) -> Vec<String> {
            vec![self.address.to_string(), self.name.to_string(), self.value.to_string()]
        }
    }

    fn snapshot_items(snapshot: &PlanSnapshot) -> Vec<PlanItem> {
        let mut items = super::plan_items(&snapshot.plan);
        if snapshot.plan.buy_switch.is_none() {
            if let Some(item) = items.iter_mut().find(|i| i.item == "buy_switch") {
                item.value = snapshot.buy_switch_raw.into();
            }
        }
        for (item, date) in [("rtc_today", snapshot.rtc_today), ("rtc_tomorrow", snapshot.rtc_tomorrow)] {
            items.push(PlanItem { item: item.into(), value: date.to_string().into() });
        }
        items
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let Args { connection, raw, output } = args;
        let runtime = super::runtime().map_err(Error::Runtime)?;
        let words = runtime.block_on(async move {
            let connection = Connection::from_args(connection);
            connection
                .read_registers(registers::PLAN_BLOCK_START, registers::PLAN_BLOCK_LEN)
                .await
                .map_err(Error::Read)
        })?;
        let mut output = output.to_output()?;
        if raw {
            for (address, word) in (registers::PLAN_BLOCK_START..).zip(words) {
                let Some(register) = RegisterIndex::from_address(address) else { continue };
                output.record(&RegisterValue {
                    address,
                    name: register.name(),
                    value: register.data_type().from_word(word),
                })?;
            }
        } else {
            let snapshot = PlanSnapshot::decode(&words).ok_or(Error::IncompleteBlock)?;
            for item in snapshot_items(&snapshot) {
                output.record(&item)?;
            }
        }
        Ok(output.commit()?)
    }

}

pub mod set {
    use crate::connection::{self, Connection};
    use crate::device::{DeviceId, ManagedDevice};
    use crate::dispatcher::{self, Dispatcher, UpdateRequest};
    use crate::output;
    use std::io::Read as _;

    /// Apply one update request to an inverter.
    ///
    /// The request is the same JSON object `serve` accepts. `device_id` may be left out.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        /// The request. Read from the standard input if not given.
        request: Option<String>,
        /// IANA name of the time zone the inverter's calendar follows.
        #[arg(long)]
        time_zone: Option<String>,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not read the request from the standard input")]
        ReadStdin(#[source] std::io::Error),
        #[error("could not parse the request")]
        ParseRequest(#[source] serde_json::Error),
        #[error("time zone `{1}` is not known")]
        TimeZone(#[source] jiff::Error, String),
        #[error("the update was not applied")]
        Update(#[from] dispatcher::Error),
        #[error("could not output the committed plan")]
        Output(#[from] output::Error),
    }

    const DEVICE: &str = "inverter";

    pub fn run(args: Args) -> Result<(), Error> {
        let Args { connection, request, time_zone, output } = args;
        let request = match request {
            Some(request) => request,
            None => {
                let mut request = String::new();
                std::io::stdin().read_to_string(&mut request).map_err(Error::ReadStdin)?;
                request
            }
        };
        let mut request =
            serde_json::from_str::<UpdateRequest>(&request).map_err(Error::ParseRequest)?;
        if request.device_id.is_none() {
            request.device_id = Some(DEVICE.into());
        }
        let time_zone = super::time_zone(time_zone.as_deref())
            .map_err(|e| Error::TimeZone(e, time_zone.clone().unwrap_or_default()))?;
        let runtime = super::runtime().map_err(Error::Runtime)?;
        let plan = runtime.block_on(async move {
            let mut dispatcher = Dispatcher::new(time_zone);
            let device_id = DeviceId::new(request.device_id.clone().unwrap_or_default());
            let connection = Connection::from_args(connection);
            dispatcher.add_device(ManagedDevice::new(device_id, connection));
            dispatcher.apply_update(&request).await
        })?;
        let mut output = output.to_output()?;
        for item in super::plan_items(&plan) {
            output.record(&item)?;
        }
        Ok(output.commit()?)
    }
}

pub mod serve {
    use crate::connection::{self, Connection};
    use crate::device::{DeviceId, ManagedDevice};
    use crate::dispatcher::{Dispatcher, UpdateRequest};
    use crate::plan::{BankId, PricePlan};
    use crate::rollover::{self, RolloverSchedule, SystemClock};
    use crate::writer::RegisterWriter;
    use futures::StreamExt as _;
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _};
    use tokio_stream::wrappers::WatchStream;
    use tokio_util::task::AbortOnDropHandle;
    use tracing::{info, warn};

    /// `NAME=HOST:PORT`
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct Inverter {
        pub name: String,
        pub address: String,
    }

    impl std::str::FromStr for Inverter {
        type Err = String;
        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s.split_once('=') {
                Some((name, address)) if !name.trim().is_empty() && !address.trim().is_empty() => {
                    Ok(Self { name: name.trim().into(), address: address.trim().into() })
                }
                _ => Err(format!("expected NAME=HOST:PORT, got `{s}`")),
            }
        }
    }

    /// Manage the plans of one or more inverters.
    ///
    /// Update requests are read from the standard input, one JSON object per line, and each is
    /// answered with one JSON line on the standard output. Tomorrow's banks are promoted to today
    /// every day at the rollover time.
    #[derive(clap::Parser)]
    pub struct Args {
        /// An inverter to manage, as `NAME=HOST:PORT`. May be repeated.
        #[arg(long = "inverter", required = true)]
        inverters: Vec<Inverter>,
        #[clap(flatten)]
        connection: connection::Settings,
        /// Local time of day at which the daily rollover happens.
        #[arg(long, default_value = "00:00:30")]
        rollover_at: jiff::civil::Time,
        /// IANA name of the time zone for the rollover and the inverter calendar. Defaults to
        /// the system time zone.
        #[arg(long)]
        time_zone: Option<String>,
        /// How long to wait before retrying a failed rollover.
        #[arg(long, default_value = "60s")]
        rollover_retry: humantime::Duration,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("time zone `{1}` is not known")]
        TimeZone(#[source] jiff::Error, String),
        #[error("inverter `{0}` is given more than once")]
        DuplicateInverter(String),
        #[error("could not read requests from the standard input")]
        ReadStdin(#[source] std::io::Error),
        #[error("could not write a response to the standard output")]
        WriteStdout(#[source] std::io::Error),
        #[error("could not encode a response")]
        EncodeResponse(#[source] serde_json::Error),
        #[error("the rollover schedule could not be computed")]
        Schedule(#[source] jiff::Error),
        #[error("the rollover task failed")]
        SchedulerTask(#[source] tokio::task::JoinError),
    }

    #[derive(serde::Serialize, Debug)]
    #[serde(tag = "status", rename_all = "snake_case")]
    pub enum Response {
        Ok {
            device_id: Option<String>,
            plan: PricePlan,
        },
        Error {
            #[serde(skip_serializing_if = "Option::is_none")]
            device_id: Option<String>,
            error: String,
            causes: Vec<String>,
        },
    }

    impl Response {
        fn error(device_id: Option<String>, error: &dyn std::error::Error) -> Self {
            let mut causes = Vec::new();
            let mut cause = error.source();
            while let Some(e) = cause {
                causes.push(e.to_string());
                cause = e.source();
            }
            Self::Error { device_id, error: error.to_string(), causes }
        }
    }

    pub async fn handle_line<W: RegisterWriter>(dispatcher: &Dispatcher<W>, line: &str) -> Response {
        let request = match serde_json::from_str::<UpdateRequest>(line) {
            Ok(request) => request,
            Err(e) => {
                warn!(message = "malformed request", error = (&e as &dyn std::error::Error));
                return Response::error(None, &e);
            }
        };
        let device_id = request.device_id.clone();
        match dispatcher.apply_update(&request).await {
            Ok(plan) => Response::Ok { device_id, plan },
            Err(e) => {
                warn!(
                    message = "update rejected",
                    device = ?device_id,
                    error = (&e as &dyn std::error::Error)
                );
                Response::error(device_id, &e)
            }
        }
    }

    /// Log the sensor values of a device every time its committed plan changes.
    fn observe<W: RegisterWriter>(device: &ManagedDevice<W>) -> AbortOnDropHandle<()> {
        let id = device.id().clone();
        let mut plans = WatchStream::from_changes(device.subscribe());
        AbortOnDropHandle::new(tokio::spawn(async move {
            while let Some(plan) = plans.next().await {
                for bank in BankId::ALL {
                    info!(device = %id, sensor = %bank, value = %plan.bank(bank), "sensor updated");
                }
                info!(
                    device = %id,
                    buy_switch = ?plan.buy_switch,
                    neg_price_enable = ?plan.neg_price_enable,
                    "flags updated"
                );
            }
        }))
    }

    /// Start every store off with what its inverter holds. Devices that cannot be read now are
    /// read again before their first rollover.
    async fn load_plans<W: RegisterWriter>(devices: &[Arc<ManagedDevice<W>>]) {
        let results = futures::future::join_all(devices.iter().map(|d| d.load())).await;
        for (device, result) in devices.iter().zip(results) {
            if let Err(e) = result {
                warn!(
                    message = "could not load the current plan",
                    device = %device.id(),
                    error = (&e as &dyn std::error::Error)
                );
            }
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let time_zone = super::time_zone(args.time_zone.as_deref())
            .map_err(|e| Error::TimeZone(e, args.time_zone.clone().unwrap_or_default()))?;
        let schedule = RolloverSchedule {
            at: args.rollover_at,
            time_zone: time_zone.clone(),
            retry_delay: *args.rollover_retry,
        };
        let runtime = super::runtime().map_err(Error::Runtime)?;
        runtime.block_on(async move {
            let mut dispatcher = Dispatcher::new(time_zone);
            for inverter in args.inverters {
                if dispatcher.device(&inverter.name).is_some() {
                    return Err(Error::DuplicateInverter(inverter.name));
                }
                info!(name = %inverter.name, address = %inverter.address, "managing inverter");
                let connection = Connection::new(inverter.address, args.connection.clone());
                dispatcher.add_device(ManagedDevice::new(DeviceId::new(inverter.name), connection));
            }
            let _observers = dispatcher.devices().map(|d| observe(d)).collect::<Vec<_>>();
            let devices = dispatcher.devices().cloned().collect::<Vec<_>>();
            load_plans(&devices).await;
            let scheduler = rollover::run_scheduler(schedule, devices, SystemClock);
            let mut scheduler = AbortOnDropHandle::new(tokio::spawn(scheduler));

            let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
            let mut stdout = tokio::io::stdout();
            loop {
                let line = tokio::select! {
                    line = lines.next_line() => line.map_err(Error::ReadStdin)?,
                    finished = &mut scheduler => return scheduler_finished(finished),
                };
                let Some(line) = line else {
                    info!("standard input closed, only running the rollover from now on");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = handle_line(&dispatcher, &line).await;
                let mut encoded = serde_json::to_vec(&response).map_err(Error::EncodeResponse)?;
                encoded.push(b'\n');
                stdout.write_all(&encoded).await.map_err(Error::WriteStdout)?;
                stdout.flush().await.map_err(Error::WriteStdout)?;
            }
            scheduler_finished(scheduler.await)
        })
    }

    fn scheduler_finished(
        result: Result<Result<(), jiff::Error>, tokio::task::JoinError>,
    ) -> Result<(), Error> {
        result.map_err(Error::SchedulerTask)?.map_err(Error::Schedule)
    }

}
