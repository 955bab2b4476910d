//! Embedded Modbus slave simulator
//!
//! Hosts a register bank behind a TCP listener or a serial line so that
//! benches and loopback deployments have something to poll. A background
//! tick advances the uptime and clock register pairs once a second.

use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use gridflux_model::{Channel, WorkerStatus};
use gridflux_protocols::modbus::{
    ModbusRtuServer, ModbusTcpServer, RegisterBank, TransportKind,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

use crate::env::HostEnv;
use crate::error::{AcqError, Result};
use crate::instance::{Factory, Instance};
use crate::plugins::{sleep_unless_cancelled, REOPEN_BACKOFF};
use crate::registry;

/// The slave address the simulator answers on
pub const SIMULATOR_UNIT_ID: u8 = 1;

/// Register the plugin; called once from startup
pub fn register() -> Result<()> {
    registry::register_factory(Arc::new(CmbusFactory))
}

pub struct CmbusFactory;

impl Factory for CmbusFactory {
    fn plugin_type(&self) -> &'static str {
        "cmbus"
    }

    fn create(&self, id: &str, cfg: Channel) -> Result<Arc<dyn Instance>> {
        if id.is_empty() {
            return Err(AcqError::config("empty instance id"));
        }
        let instance: Arc<dyn Instance> = CmbusInstance::create(id, cfg);
        Ok(instance)
    }
}

#[derive(Default)]
struct Runtime {
    init: bool,
    parent: Option<CancellationToken>,
    cancel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
    env: Option<Arc<HostEnv>>,
}

pub struct CmbusInstance {
    id: String,
    cfg: RwLock<Channel>,
    status: RwLock<WorkerStatus>,
    bank: RwLock<Option<Arc<RegisterBank>>>,
    listen_addr: RwLock<Option<std::net::SocketAddr>>,
    runtime: tokio::sync::Mutex<Runtime>,
}

impl CmbusInstance {
    /// Construct a concrete handle, for embedding and loopback tests
    pub fn create(id: &str, cfg: Channel) -> Arc<Self> {
        Arc::new(Self::new(id, cfg))
    }

    fn new(id: &str, cfg: Channel) -> Self {
        Self {
            id: id.to_string(),
            cfg: RwLock::new(cfg),
            status: RwLock::new(WorkerStatus::default()),
            bank: RwLock::new(None),
            listen_addr: RwLock::new(None),
            runtime: tokio::sync::Mutex::new(Runtime::default()),
        }
    }

    /// The live register bank, for seeding and inspection
    pub fn bank(&self) -> Option<Arc<RegisterBank>> {
        self.bank.read().expect("bank lock").clone()
    }

    /// The TCP listener address once the simulator is up
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        *self.listen_addr.read().expect("addr lock")
    }
}

#[async_trait]
impl Instance for CmbusInstance {
    fn id(&self) -> &str {
        &self.id
    }

    fn plugin_type(&self) -> &str {
        "cmbus"
    }

    async fn init(&self, parent: CancellationToken, env: Arc<HostEnv>) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        if runtime.init {
            return Ok(());
        }

        let cfg = self.cfg.read().expect("cfg lock").clone();
        cfg.validate().map_err(AcqError::Link)?;

        let cancel = parent.child_token();
        let bank = Arc::new(RegisterBank::new(SIMULATOR_UNIT_ID));
        let mut tasks = Vec::new();

        match cfg.transport {
            TransportKind::TcpServer => {
                let addr = format!("{}:{}", cfg.tcp_host, cfg.tcp_port);
                let server = ModbusTcpServer::bind(&addr, bank.clone())
                    .await
                    .map_err(AcqError::Link)?;
                *self.listen_addr.write().expect("addr lock") =
                    server.local_addr().ok();
                let span = env.instance_span("cmbus", &self.id);
                tasks.push(tokio::spawn(server.run(cancel.clone()).instrument(span)));
            }
            TransportKind::RtuServer => {
                let serial = cfg.serial_config_secondary();
                let bank = bank.clone();
                let cancel = cancel.clone();
                let span = env.instance_span("cmbus", &self.id);
                tasks.push(tokio::spawn(
                    async move {
                        // The line may not exist yet; keep trying until
                        // cancelled
                        while !cancel.is_cancelled() {
                            let server = ModbusRtuServer::new(serial.clone(), bank.clone());
                            match server.run(cancel.clone()).await {
                                Ok(()) => break,
                                Err(e) => {
                                    warn!(device = %serial.device, error = %e, "RTU slave failed");
                                    if !sleep_unless_cancelled(&cancel, REOPEN_BACKOFF).await {
                                        break;
                                    }
                                }
                            }
                        }
                    }
                    .instrument(span),
                ));
            }
            other => {
                return Err(AcqError::config(format!(
                    "cmbus cannot serve transport {other}"
                )));
            }
        }

        // Clock tick: uptime input pair and unix-time holding pair
        {
            let bank = bank.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                let started = tokio::time::Instant::now();
                while sleep_unless_cancelled(&cancel, std::time::Duration::from_secs(1)).await {
                    let unix = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_secs() as u32)
                        .unwrap_or(0);
                    bank.tick_clock(started.elapsed().as_secs() as u32, unix);
                }
            }));
        }

        {
            let mut status = self.status.write().expect("status lock");
            *status = WorkerStatus::default();
            status.working = true;
            status.linking = true;
        }
        *self.bank.write().expect("bank lock") = Some(bank);

        info!(instance = %self.id, transport = %cfg.transport, "simulator initialized");

        runtime.parent = Some(parent);
        runtime.cancel = Some(cancel);
        runtime.tasks = tasks;
        runtime.env = Some(env);
        runtime.init = true;
        Ok(())
    }

    async fn update_config(&self, cfg: Channel) -> Result<()> {
        cfg.validate().map_err(AcqError::Link)?;

        let restart = {
            let mut current = self.cfg.write().expect("cfg lock");
            let restart = current.requires_restart(&cfg);
            *current = cfg;
            restart
        };

        let (initialized, parent, env) = {
            let runtime = self.runtime.lock().await;
            (runtime.init, runtime.parent.clone(), runtime.env.clone())
        };

        if !restart || !initialized {
            info!(instance = %self.id, "simulator config updated in place");
            return Ok(());
        }

        info!(instance = %self.id, "simulator endpoint changed, restarting");
        self.close().await?;

        let parent = parent.ok_or(AcqError::Cancelled)?;
        if parent.is_cancelled() {
            warn!(instance = %self.id, "parent scope cancelled, simulator stays closed");
            return Err(AcqError::Cancelled);
        }
        let env = env.ok_or(AcqError::Cancelled)?;
        self.init(parent, env).await
    }

    fn get(&self) -> WorkerStatus {
        *self.status.read().expect("status lock")
    }

    async fn close(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        if !runtime.init {
            return Ok(());
        }
        if let Some(cancel) = runtime.cancel.take() {
            cancel.cancel();
        }
        for task in runtime.tasks.drain(..) {
            let _ = task.await;
        }
        runtime.init = false;

        *self.bank.write().expect("bank lock") = None;
        *self.listen_addr.write().expect("addr lock") = None;
        let mut status = self.status.write().expect("status lock");
        status.working = false;
        status.linking = false;

        info!(instance = %self.id, "simulator closed");
        Ok(())
    }
}
