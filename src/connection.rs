use crate::modbus::{self, ModbusTCPCodec, Request};
use futures::{SinkExt as _, StreamExt as _};
use std::collections::BTreeMap;
use std::sync::atomic::AtomicU16;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::SendError;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("lookup of `{1}` failed")]
    LookupHost(#[source] std::io::Error, String),
    #[error("could not connect to `{1}` over TCP")]
    Connect(#[source] std::io::Error, String),
    #[error("scheduling a request failed")]
    ScheduleRequest(#[source] SendError<modbus::Request>),
    #[error("no response from the inverter after {0} attempts")]
    NoResponse(usize),
}

/// Hands responses (or their absence) from the worker back to whoever is waiting for them.
#[derive(Default)]
pub struct ResponseTracker {
    responses: Mutex<BTreeMap<u16, Option<modbus::Response>>>,
    change_notify: Notify,
}

impl ResponseTracker {
    pub fn mark_timeout(&self, transaction_id: u16) {
        let mut guard = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(transaction_id, None);
        self.change_notify.notify_waiters();
        drop(guard);
    }

    pub fn add_response(&self, response: modbus::Response) {
        let mut guard = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(response.transaction_id, Some(response));
        self.change_notify.notify_waiters();
        drop(guard);
    }

    pub async fn wait_for(&self, transaction_id: u16) -> Option<modbus::Response> {
        loop {
            // Register interest before looking, so a notification between the two isn't lost.
            let mut notified = std::pin::pin!(self.change_notify.notified());
            notified.as_mut().enable();
            {
                let mut guard = self.responses.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(v) = guard.remove(&transaction_id) {
                    return v;
                }
            }
            notified.await;
        }
    }
}

/// Connection settings shared by all the inverters a command talks to.
#[derive(clap::Parser, Clone, Debug)]
#[group(id = "connection::Settings")]
pub struct Settings {
    /// The modbus unit ID of the inverter.
    #[arg(long, short = 'u', default_value = "247")]
    pub unit_id: u8,

    /// If the modbus response isn't received in this amount of time, consider the request failed.
    #[arg(long, default_value = "1s")]
    pub read_timeout: humantime::Duration,

    /// Reconnect to the inverter after the specified number of consecutive read timeouts.
    #[arg(long, default_value = "3")]
    pub reconnect_after_timeouts: usize,

    /// The amount of time to wait between sending requests.
    ///
    /// Interacting too fast can make some Modbus TCP gateways behave poorly.
    #[arg(long, default_value = "100ms")]
    pub send_delay: humantime::Duration,

    /// The amount of additional time to wait after receiving a server busy exception.
    #[arg(long, default_value = "25ms")]
    pub server_busy_retry_delay: humantime::Duration,

    /// How many times a request is sent before giving up on it.
    #[arg(long, default_value = "3")]
    pub attempts: usize,
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "connection::Args")]
pub struct Args {
    /// Address of the inverter's Modbus TCP endpoint, e.g. `192.168.1.20:502`.
    #[arg(long)]
    pub tcp: String,

    #[clap(flatten)]
    pub settings: Settings,
}

pub struct Connection {
    request_queue: tokio::sync::mpsc::UnboundedSender<modbus::Request>,
    #[allow(unused)] // exists for its drop handler
    worker: tokio_util::task::AbortOnDropHandle<()>,
    response_tracker: Arc<ResponseTracker>,
    transaction_id_generator: AtomicU16,
    settings: Settings,
}

impl Connection {
    /// Start a worker talking to the inverter at `address`.
    ///
    /// The TCP connection is established lazily and re-established whenever it breaks, so this
    /// does not fail for an unreachable inverter. Requests sent in the meantime time out instead.
    pub fn new(address: String, settings: Settings) -> Connection {
        let (request_queue, jobs) = tokio::sync::mpsc::unbounded_channel();
        let response_tracker = Arc::<ResponseTracker>::default();
        let worker = TcpWorker {
            reconnect_countdown: settings.reconnect_after_timeouts,
            address,
            settings: settings.clone(),
            responses: Arc::clone(&response_tracker),
            io: None,
        };
        Self {
            request_queue,
            worker: tokio_util::task::AbortOnDropHandle::new(tokio::spawn(worker.main_loop(jobs))),
            response_tracker,
            transaction_id_generator: AtomicU16::new(0),
            settings,
        }
    }

    pub fn from_args(args: Args) -> Connection {
        Self::new(args.tcp, args.settings)
    }

    pub fn new_transaction_id(&self) -> u16 {
        self.transaction_id_generator.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    pub async fn send(
        &self,
        operation: modbus::Operation,
    ) -> Result<Option<modbus::Response>, Error> {
        let transaction_id = self.new_transaction_id();
        let request = modbus::Request { unit_id: self.settings.unit_id, transaction_id, operation };
        self.request_queue.send(request).map_err(Error::ScheduleRequest)?;
        Ok(self.response_tracker.wait_for(transaction_id).await)
    }

    /// [`Self::send`] but retries timeouts and `Server Busy` exceptions, up to the configured
    /// number of attempts.
    pub async fn send_retrying(
        &self,
        operation: modbus::Operation,
    ) -> Result<modbus::Response, Error> {
        let attempts = self.settings.attempts.max(1);
        for attempt in 1..=attempts {
            let response = self.send(operation.clone()).await?;
            let Some(response) = response else {
                debug!(attempt, "request timed out");
                continue;
            };
            if response.is_server_busy() {
                debug!(attempt, "server busy");
                tokio::time::sleep(*self.settings.server_busy_retry_delay).await;
                continue;
            }
            return Ok(response);
        }
        Err(Error::NoResponse(attempts))
    }
}

type TcpIo = Framed<TcpStream, ModbusTCPCodec>;

struct TcpWorker {
    address: String,
    settings: Settings,
    responses: Arc<ResponseTracker>,
    io: Option<TcpIo>,
    reconnect_countdown: usize,
}

impl TcpWorker {
    /// Requests are sent strictly one at a time; the next one only goes out once the previous
    /// one has been answered or has timed out.
    async fn main_loop(mut self, mut jobs: UnboundedReceiver<modbus::Request>) {
        let mut next_send = Instant::now();
        while let Some(request) = jobs.recv().await {
            tokio::time::sleep_until(next_send).await;
            let transaction_id = request.transaction_id;
            match self.exchange(request).await {
                Some(response) => self.responses.add_response(response),
                None => self.responses.mark_timeout(transaction_id),
            }
            next_send = Instant::now() + *self.settings.send_delay;
        }
        if let Some(mut io) = self.io.take() {
            let close_result = io.close().await;
            trace!(message = "closed the connection", is_error = ?close_result.err());
        }
    }

    async fn exchange(&mut self, request: Request) -> Option<modbus::Response> {
        let transaction_id = request.transaction_id;
        let io = match &mut self.io {
            Some(io) => io,
            None => match self.connect().await {
                Ok(io) => self.io.insert(io),
                Err(e) => {
                    warn!(message = "could not connect", error = (&e as &dyn std::error::Error));
                    return None;
                }
            },
        };
        if let Err(e) = io.send(request).await {
            warn!(
                message = "sending request failed, will reconnect",
                error = (&e as &dyn std::error::Error)
            );
            self.io = None;
            return None;
        }
        let deadline = Instant::now() + *self.settings.read_timeout;
        loop {
            match tokio::time::timeout_at(deadline, io.next()).await {
                Err(_) => {
                    debug!(
                        message = "request timed out",
                        transaction_id,
                        reconnect_countdown = self.reconnect_countdown
                    );
                    match self.reconnect_countdown.checked_sub(1) {
                        Some(n) => self.reconnect_countdown = n,
                        None => {
                            warn!("too many timeouts, will reconnect");
                            self.io = None;
                        }
                    }
                    return None;
                }
                Ok(None) => {
                    warn!("connection closed by the inverter, will reconnect");
                    self.io = None;
                    return None;
                }
                Ok(Some(Err(e))) => {
                    warn!(
                        message = "receiving a response failed, will reconnect",
                        error = (&e as &dyn std::error::Error)
                    );
                    self.io = None;
                    return None;
                }
                Ok(Some(Ok(response))) if response.transaction_id != transaction_id => {
                    debug!(
                        message = "a response we were not expecting",
                        transaction = response.transaction_id
                    );
                }
                Ok(Some(Ok(response))) => {
                    trace!(message = "decoded a response", transaction = transaction_id);
                    self.reconnect_countdown = self.settings.reconnect_after_timeouts;
                    return Some(response);
                }
            }
        }
    }

    async fn connect(&mut self) -> Result<TcpIo, Error> {
        let address = &self.address;
        info!(message = "connecting...", address);
        let addresses = tokio::net::lookup_host(address)
            .await
            .map_err(|e| Error::LookupHost(e, address.to_string()))?
            .collect::<Vec<_>>();
        debug!(message = "resolved", ?addresses);
        let socket = TcpStream::connect(&*addresses)
            .await
            .map_err(|e| Error::Connect(e, address.to_string()))?;
        let nodelay_result = socket.set_nodelay(true);
        trace!(message = "setting nodelay", is_error = ?nodelay_result.err());
        info!(message = "connected", address);
        self.reconnect_countdown = self.settings.reconnect_after_timeouts;
        Ok(Framed::new(socket, ModbusTCPCodec {}))
    }
}
