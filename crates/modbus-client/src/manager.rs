use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use types::{ConnectionHealth, ConnectionStatus, MeasurementCategory};

use crate::backoff::compute_backoff;
use crate::config::ClientConfig;
use crate::driver::{self, ResponseCode, Tag, TagResponse, TransportDriver};
use crate::error::ClientError;

struct Inner {
    config: ClientConfig,
    connection: RwLock<Option<Box<dyn TransportDriver>>>,
    health: RwLock<ConnectionHealth>,
    attempt_counter: AtomicU32,
    closed: AtomicBool,
    /// Signalled whenever a connection becomes available.
    connected_notify: Notify,
    /// Signalled whenever the live connection is dropped, so the reconnect
    /// loop wakes from its idle wait instead of polling.
    reconnect_wake: Notify,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Owns one `TransportDriver` connection and maintains its liveness,
/// reconnect loop, retry policy, and health snapshot.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

enum Operation<'a> {
    Read(Tag),
    WriteBooleans(Tag, &'a [bool]),
    WriteShorts(Tag, &'a [u16]),
}

impl ConnectionManager {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                connection: RwLock::new(None),
                health: RwLock::new(ConnectionHealth::initial()),
                attempt_counter: AtomicU32::new(0),
                closed: AtomicBool::new(false),
                connected_notify: Notify::new(),
                reconnect_wake: Notify::new(),
                task: tokio::sync::Mutex::new(None),
            }),
        })
    }

    pub fn connection_string(&self) -> &str {
        &self.inner.config.connection_string
    }

    /// Idempotent; launches the background reconnect loop. Fails if the
    /// manager is already `Closed`.
    pub async fn start(&self) -> Result<(), ClientError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        let mut task_guard = self.inner.task.lock().await;
        if task_guard.is_some() {
            return Ok(());
        }
        {
            let mut health = self.inner.health.write().await;
            if health.status == ConnectionStatus::Initial {
                health.status = ConnectionStatus::Connecting;
            }
        }
        let inner = self.inner.clone();
        *task_guard = Some(tokio::spawn(reconnect_loop(inner)));
        Ok(())
    }

    /// Terminal; idempotent. Closes the live transport if present and
    /// cancels the reconnect loop.
    pub async fn stop(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.reconnect_wake.notify_waiters();
        self.inner.connected_notify.notify_waiters();

        let handle = self.inner.task.lock().await.take();
        if let Some(handle) = handle {
            handle.abort();
        }

        let mut conn = self.inner.connection.write().await;
        if let Some(mut driver) = conn.take() {
            driver.close().await;
        }
        drop(conn);

        let mut health = self.inner.health.write().await;
        health.status = ConnectionStatus::Closed;
    }

    pub async fn close(&self) {
        self.stop().await;
    }

    /// True iff an open transport exists and reports itself connected;
    /// swallows transport errors as false.
    pub async fn is_connected(&self) -> bool {
        matches!(self.inner.connection.read().await.as_deref(), Some(driver) if driver.is_connected())
    }

    pub async fn health(&self) -> ConnectionHealth {
        self.inner.health.read().await.clone()
    }

    pub async fn read_coil(&self, address: u16) -> Result<bool, ClientError> {
        self.read_bool(MeasurementCategory::Coil, address, 1).await?.boolean()
    }

    pub async fn read_discrete_input(&self, address: u16) -> Result<bool, ClientError> {
        self.read_bool(MeasurementCategory::DiscreteInput, address, 1).await?.boolean()
    }

    pub async fn read_coils(&self, address: u16, count: u16) -> Result<Vec<bool>, ClientError> {
        Ok(self.read_bool(MeasurementCategory::Coil, address, count).await?.all_booleans()?.to_vec())
    }

    pub async fn read_discrete_inputs(&self, address: u16, count: u16) -> Result<Vec<bool>, ClientError> {
        Ok(self
            .read_bool(MeasurementCategory::DiscreteInput, address, count)
            .await?
            .all_booleans()?
            .to_vec())
    }

    pub async fn read_holding_register(&self, address: u16) -> Result<u16, ClientError> {
        self.read_reg(MeasurementCategory::HoldingRegister, address, 1).await?.short()
    }

    pub async fn read_input_register(&self, address: u16) -> Result<u16, ClientError> {
        self.read_reg(MeasurementCategory::InputRegister, address, 1).await?.short()
    }

    pub async fn read_holding_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, ClientError> {
        self.read_reg(MeasurementCategory::HoldingRegister, address, count).await?.all_shorts()
    }

    pub async fn read_input_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, ClientError> {
        self.read_reg(MeasurementCategory::InputRegister, address, count).await?.all_shorts()
    }

    pub async fn write_coil(&self, address: u16, value: bool) -> Result<(), ClientError> {
        self.write_bool(address, &[value]).await
    }

    pub async fn write_coils(&self, address: u16, values: &[bool]) -> Result<(), ClientError> {
        self.write_bool(address, values).await
    }

    pub async fn write_holding_register(&self, address: u16, value: u16) -> Result<(), ClientError> {
        self.write_reg(address, &[value]).await
    }

    pub async fn write_holding_registers(&self, address: u16, values: &[u16]) -> Result<(), ClientError> {
        self.write_reg(address, values).await
    }

    async fn read_bool(&self, category: MeasurementCategory, address: u16, count: u16) -> Result<TagResponse, ClientError> {
        let tag = Tag::new(category, address, count);
        self.execute_with_retry(Operation::Read(tag)).await
    }

    async fn read_reg(&self, category: MeasurementCategory, address: u16, count: u16) -> Result<TagResponse, ClientError> {
        let tag = Tag::new(category, address, count);
        self.execute_with_retry(Operation::Read(tag)).await
    }

    async fn write_bool(&self, address: u16, values: &[bool]) -> Result<(), ClientError> {
        let tag = Tag::new(MeasurementCategory::Coil, address, values.len() as u16);
        self.execute_with_retry(Operation::WriteBooleans(tag, values)).await?;
        Ok(())
    }

    async fn write_reg(&self, address: u16, values: &[u16]) -> Result<(), ClientError> {
        let tag = Tag::new(MeasurementCategory::HoldingRegister, address, values.len() as u16);
        self.execute_with_retry(Operation::WriteShorts(tag, values)).await?;
        Ok(())
    }

    /// Runs `operation` under the retry policy: up to `max_retries + 1`
    /// attempts, each bounded by `request_timeout`. Any failure drops the
    /// current transport and re-enters the reconnect path before the next
    /// attempt; the first attempt never waits on a backoff.
    async fn execute_with_retry(&self, operation: Operation<'_>) -> Result<TagResponse, ClientError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }

        let mut last_err: Option<ClientError> = None;

        for attempt in 0..=self.inner.config.max_retries {
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(ClientError::Closed);
            }
            if !self.wait_for_connection().await {
                return Err(ClientError::Closed);
            }

            let outcome = {
                let mut guard = self.inner.connection.write().await;
                match guard.as_deref_mut() {
                    Some(driver) => {
                        let timeout = self.inner.config.request_timeout;
                        let timed = match &operation {
                            Operation::Read(tag) => tokio::time::timeout(timeout, driver.read(*tag)).await,
                            Operation::WriteBooleans(tag, values) => {
                                tokio::time::timeout(timeout, driver.write_booleans(*tag, values)).await
                            }
                            Operation::WriteShorts(tag, values) => {
                                tokio::time::timeout(timeout, driver.write_shorts(*tag, values)).await
                            }
                        };
                        match timed {
                            Ok(result) => result,
                            Err(_) => Err(ClientError::Timeout(timeout)),
                        }
                    }
                    None => Err(ClientError::TransportError("connection dropped mid-request".to_string())),
                }
            };

            let err = match outcome {
                Ok(response) => match &response.code {
                    ResponseCode::Ok => return Ok(response),
                    ResponseCode::Error(msg) => ClientError::ProtocolError(msg.clone()),
                },
                Err(err) => err,
            };

            self.mark_disconnected().await;
            if !err.is_retryable() {
                return Err(err);
            }
            last_err = Some(err);

            if attempt < self.inner.config.max_retries {
                let delay = compute_backoff(
                    self.inner.config.initial_backoff,
                    self.inner.config.max_backoff,
                    self.inner.config.jitter,
                    attempt as u32,
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(ClientError::Unavailable(
            last_err.map(|e| e.to_string()).unwrap_or_else(|| "no attempts were made".to_string()),
        ))
    }

    /// Drops the current transport (if any) and nudges the reconnect loop,
    /// so concurrent callers converge on the reconnect path.
    async fn mark_disconnected(&self) {
        let mut conn = self.inner.connection.write().await;
        if let Some(mut driver) = conn.take() {
            driver.close().await;
        }
        drop(conn);

        if !self.inner.closed.load(Ordering::SeqCst) {
            let mut health = self.inner.health.write().await;
            if health.status != ConnectionStatus::Closed {
                health.status = ConnectionStatus::Unhealthy;
            }
        }
        self.inner.reconnect_wake.notify_waiters();
    }

    /// Waits until a connection is present, ensuring the reconnect loop is
    /// running. Returns `false` if the manager closes while waiting.
    async fn wait_for_connection(&self) -> bool {
        loop {
            if self.inner.closed.load(Ordering::SeqCst) {
                return false;
            }
            if self.inner.connection.read().await.is_some() {
                return true;
            }
            let _ = self.start().await;
            let notified = self.inner.connected_notify.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
            }
        }
    }
}

#[cfg(feature = "test-support")]
impl ConnectionManager {
    /// Constructs a manager pre-wired to `driver`, bypassing the normal
    /// `open()` connect path. For downstream crates' test suites driving
    /// retry/backoff/backpressure scenarios without a real socket.
    pub fn for_testing(config: ClientConfig, driver: Box<dyn TransportDriver>) -> Result<Self, ClientError> {
        config.validate()?;
        let mut health = ConnectionHealth::initial();
        health.status = ConnectionStatus::Healthy;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                connection: RwLock::new(Some(driver)),
                health: RwLock::new(health),
                attempt_counter: AtomicU32::new(0),
                closed: AtomicBool::new(false),
                connected_notify: Notify::new(),
                reconnect_wake: Notify::new(),
                task: tokio::sync::Mutex::new(None),
            }),
        })
    }
}

/// The background reconnect loop launched by `start()`. Runs until
/// `Closed`; idle-waits on `reconnect_wake` whenever a connection is
/// already present.
async fn reconnect_loop(inner: Arc<Inner>) {
    loop {
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }

        if inner.connection.read().await.is_some() {
            let woken = inner.reconnect_wake.notified();
            tokio::select! {
                _ = woken => {}
                _ = tokio::time::sleep(std::time::Duration::from_secs(30)) => {}
            }
            continue;
        }

        {
            let mut health = inner.health.write().await;
            health.last_attempt_at = Some(SystemTime::now());
            if health.status != ConnectionStatus::Closed {
                health.status = ConnectionStatus::Connecting;
            }
        }

        match driver::open(&inner.config.connection_string).await {
            Ok(transport) => {
                *inner.connection.write().await = Some(transport);
                {
                    let mut health = inner.health.write().await;
                    health.status = ConnectionStatus::Healthy;
                    health.last_connected_at = Some(SystemTime::now());
                    health.last_error = None;
                }
                inner.attempt_counter.store(0, Ordering::SeqCst);
                metrics::counter!(
                    "modbus.connection.reconnects",
                    "connection" => inner.config.connection_string.clone()
                )
                .increment(1);
                info!(connection = %inner.config.connection_string, "modbus connection established");
                inner.connected_notify.notify_waiters();
            }
            Err(err) => {
                {
                    let mut health = inner.health.write().await;
                    if health.status != ConnectionStatus::Closed {
                        health.status = ConnectionStatus::Unhealthy;
                    }
                    health.last_error = Some(err.to_string());
                }
                let attempt = inner.attempt_counter.fetch_add(1, Ordering::SeqCst);
                let delay = compute_backoff(
                    inner.config.initial_backoff,
                    inner.config.max_backoff,
                    inner.config.jitter,
                    attempt,
                );
                warn!(
                    connection = %inner.config.connection_string,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "modbus reconnect attempt failed"
                );
                let woken = inner.reconnect_wake.notified();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = woken => {}
                }
            }
        }
    }
}


#[cfg(test)]
pub(crate) mod test_support {
    //! A fake `TransportDriver` + connector used to exercise retry/backoff/
    //! reconnect behavior deterministically, without a real socket.
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32 as AtomicCounter, Ordering as Ord};

    pub struct ScriptedDriver {
        register_value: u16,
    }

    impl ScriptedDriver {
        pub fn always_register(value: u16) -> Self {
            Self { register_value: value }
        }
    }

    #[async_trait]
    impl TransportDriver for ScriptedDriver {
        async fn read(&mut self, tag: Tag) -> Result<TagResponse, ClientError> {
            Ok(TagResponse::ok_shorts(tag, vec![self.register_value]))
        }
        async fn write_booleans(&mut self, tag: Tag, values: &[bool]) -> Result<TagResponse, ClientError> {
            Ok(TagResponse::ok_booleans(tag, values.to_vec()))
        }
        async fn write_shorts(&mut self, tag: Tag, values: &[u16]) -> Result<TagResponse, ClientError> {
            Ok(TagResponse::ok_shorts(tag, values.to_vec()))
        }
        fn is_connected(&self) -> bool {
            true
        }
        async fn close(&mut self) {}
    }

    /// Fails the first `fail_count` reads with a transport error, then
    /// succeeds and keeps succeeding.
    pub struct FailNTimesDriver {
        remaining_failures: AtomicCounter,
        value: u16,
    }

    impl FailNTimesDriver {
        pub fn new(fail_count: u32, value: u16) -> Self {
            Self { remaining_failures: AtomicCounter::new(fail_count), value }
        }
    }

    #[async_trait]
    impl TransportDriver for FailNTimesDriver {
        async fn read(&mut self, tag: Tag) -> Result<TagResponse, ClientError> {
            let remaining = self.remaining_failures.load(Ord::SeqCst);
            if remaining > 0 {
                self.remaining_failures.store(remaining - 1, Ord::SeqCst);
                return Err(ClientError::TransportError("simulated failure".to_string()));
            }
            Ok(TagResponse::ok_shorts(tag, vec![self.value]))
        }
        async fn write_booleans(&mut self, tag: Tag, values: &[bool]) -> Result<TagResponse, ClientError> {
            Ok(TagResponse::ok_booleans(tag, values.to_vec()))
        }
        async fn write_shorts(&mut self, tag: Tag, values: &[u16]) -> Result<TagResponse, ClientError> {
            Ok(TagResponse::ok_shorts(tag, values.to_vec()))
        }
        fn is_connected(&self) -> bool {
            true
        }
        async fn close(&mut self) {}
    }

    /// Number of simulated `open()` failures before a connect attempt
    /// succeeds, for `manager_with_opener` below.
    pub fn fail_first_opens(fail_count: u32) -> AtomicCounter {
        AtomicCounter::new(fail_count)
    }

    pub async fn manager_with_driver(config: ClientConfig, driver: impl TransportDriver + 'static) -> ConnectionManager {
        let manager = ConnectionManager::new(config).unwrap();
        *manager.inner.connection.write().await = Some(Box::new(driver));
        {
            let mut health = manager.inner.health.write().await;
            health.status = ConnectionStatus::Healthy;
        }
        manager
    }

    pub async fn manager_with_opener(config: ClientConfig, remaining_failures: AtomicCounter) -> ConnectionManager {
        let manager = ConnectionManager::new(config).unwrap();
        let inner = manager.inner.clone();
        let failures = Arc::new(remaining_failures);
        tokio::spawn(async move {
            loop {
                if inner.closed.load(Ord::SeqCst) {
                    break;
                }
                if inner.connection.read().await.is_some() {
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    continue;
                }
                let remaining = failures.load(Ord::SeqCst);
                if remaining > 0 {
                    failures.store(remaining - 1, Ord::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    continue;
                }
                *inner.connection.write().await = Some(Box::new(ScriptedDriver::always_register(7)));
                let mut health = inner.health.write().await;
                health.status = ConnectionStatus::Healthy;
                inner.connected_notify.notify_waiters();
                break;
            }
        });
        manager
    }
}
