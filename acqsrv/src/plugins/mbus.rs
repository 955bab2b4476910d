//! Modbus master acquisition worker
//!
//! One instance per channel. The acquisition task opens the transport and
//! ticks at the channel's send interval; on each tick it polls the
//! catalogue points of every device whose own poll interval has elapsed,
//! decodes and publishes the values, and backs off two seconds before
//! reopening after any transport failure. Cancellation wins over further
//! I/O at every suspension point.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use gridflux_model::{Channel, DeviceTypePoint, WorkerStatus};
use gridflux_protocols::modbus::{decode_block, ModbusMaster};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::env::HostEnv;
use crate::error::{AcqError, Result};
use crate::instance::{Factory, Instance};
use crate::plugins::{sleep_unless_cancelled, REOPEN_BACKOFF};
use crate::registry;
use crate::store;

/// Register the plugin; called once from startup
pub fn register() -> Result<()> {
    registry::register_factory(Arc::new(MbusFactory))
}

pub struct MbusFactory;

impl Factory for MbusFactory {
    fn plugin_type(&self) -> &'static str {
        "mbus"
    }

    fn create(&self, id: &str, cfg: Channel) -> Result<Arc<dyn Instance>> {
        if id.is_empty() {
            return Err(AcqError::config("empty instance id"));
        }
        Ok(Arc::new(MbusInstance::new(id, cfg)))
    }
}

/// One device's share of the polling schedule: the slave address, its own
/// poll interval, and the catalogue points behind it
struct PollGroup {
    unit_id: u8,
    interval: std::time::Duration,
    points: Vec<DeviceTypePoint>,
}

/// State shared between the instance handle and its acquisition task
struct WorkerShared {
    cfg: RwLock<Channel>,
    status: RwLock<WorkerStatus>,
}

#[derive(Default)]
struct Runtime {
    init: bool,
    parent: Option<CancellationToken>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
    env: Option<Arc<HostEnv>>,
}

pub struct MbusInstance {
    id: String,
    shared: Arc<WorkerShared>,
    runtime: tokio::sync::Mutex<Runtime>,
}

impl MbusInstance {
    fn new(id: &str, cfg: Channel) -> Self {
        Self {
            id: id.to_string(),
            shared: Arc::new(WorkerShared {
                cfg: RwLock::new(cfg),
                status: RwLock::new(WorkerStatus::default()),
            }),
            runtime: tokio::sync::Mutex::new(Runtime::default()),
        }
    }
}

#[async_trait]
impl Instance for MbusInstance {
    fn id(&self) -> &str {
        &self.id
    }

    fn plugin_type(&self) -> &str {
        "mbus"
    }

    async fn init(&self, parent: CancellationToken, env: Arc<HostEnv>) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        if runtime.init {
            return Ok(());
        }

        let cfg = self.shared.cfg.read().expect("cfg lock").clone();
        cfg.validate().map_err(AcqError::Link)?;

        let groups = load_poll_groups(&env, &cfg.id).await?;
        // A fresh task starts from zeroed counters
        *self.shared.status.write().expect("status lock") = WorkerStatus::default();

        let cancel = parent.child_token();
        let span = env.instance_span("mbus", &self.id);
        let task = tokio::spawn(
            run_poller(
                self.shared.clone(),
                groups,
                cancel.clone(),
                env.clone(),
                self.id.clone(),
            )
            .instrument(span),
        );

        info!(
            instance = %self.id,
            endpoint = %cfg.master_config().endpoint.display_name(),
            "mbus worker initialized"
        );

        runtime.parent = Some(parent);
        runtime.cancel = Some(cancel);
        runtime.task = Some(task);
        runtime.env = Some(env);
        runtime.init = true;
        Ok(())
    }

    async fn update_config(&self, cfg: Channel) -> Result<()> {
        cfg.validate().map_err(AcqError::Link)?;

        let restart = {
            let mut current = self.shared.cfg.write().expect("cfg lock");
            let restart = current.requires_restart(&cfg);
            *current = cfg;
            restart
        };

        let (initialized, parent, env) = {
            let runtime = self.runtime.lock().await;
            (runtime.init, runtime.parent.clone(), runtime.env.clone())
        };

        if !restart || !initialized {
            info!(instance = %self.id, "mbus config updated in place");
            return Ok(());
        }

        info!(instance = %self.id, "transport settings changed, restarting worker");
        self.close().await?;

        let parent = parent.ok_or(AcqError::Cancelled)?;
        if parent.is_cancelled() {
            warn!(instance = %self.id, "parent scope cancelled, worker stays closed");
            return Err(AcqError::Cancelled);
        }
        let env = env.ok_or(AcqError::Cancelled)?;
        self.init(parent, env).await
    }

    fn get(&self) -> WorkerStatus {
        *self.shared.status.read().expect("status lock")
    }

    async fn close(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        if !runtime.init {
            return Ok(());
        }
        if let Some(cancel) = runtime.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = runtime.task.take() {
            let _ = task.await;
        }
        // parent and env stay put so a config update can restart us
        runtime.init = false;

        let mut status = self.shared.status.write().expect("status lock");
        status.working = false;
        status.linking = false;

        info!(instance = %self.id, "mbus worker closed");
        Ok(())
    }
}

/// Resolve the channel's devices against the catalogue
async fn load_poll_groups(env: &HostEnv, channel_id: &str) -> Result<Vec<PollGroup>> {
    let mut groups = Vec::new();
    for device in store::list_devices_for_channel(&env.db, channel_id).await? {
        let points: Vec<DeviceTypePoint> =
            store::load_type_points(&env.db, &device.device_type)
                .await?
                .into_iter()
                .filter(|point| point.rw.readable())
                .collect();
        if points.is_empty() {
            continue;
        }
        groups.push(PollGroup {
            unit_id: device.unit_id,
            interval: std::time::Duration::from_millis(device.poll_interval_ms),
            points,
        });
    }
    Ok(groups)
}

/// The acquisition loop
///
/// Outer: open the transport, backing off while it stays down. Inner: on
/// every send-interval tick, poll each point; exception responses and
/// decode failures count as point errors and keep the transport up, while
/// transport errors drop back to the outer loop.
async fn run_poller(
    shared: Arc<WorkerShared>,
    groups: Vec<PollGroup>,
    cancel: CancellationToken,
    env: Arc<HostEnv>,
    channel_id: String,
) {
    'outer: while !cancel.is_cancelled() {
        {
            let mut status = shared.status.write().expect("status lock");
            status.working = true;
            status.linking = false;
        }

        let master_cfg = shared.cfg.read().expect("cfg lock").master_config();
        let endpoint = master_cfg.endpoint.display_name();
        let mut master = ModbusMaster::new(master_cfg);

        if let Err(e) = master.open().await {
            warn!(%endpoint, error = %e, "transport open failed");
            if !sleep_unless_cancelled(&cancel, REOPEN_BACKOFF).await {
                break 'outer;
            }
            continue 'outer;
        }

        info!(%endpoint, "transport open");
        shared.status.write().expect("status lock").linking = true;

        // Counters survive reopen cycles within one task
        let bytes_base = {
            let status = shared.status.read().expect("status lock");
            (status.bytes_sent, status.bytes_received)
        };

        // Every device becomes due immediately on a fresh link
        let mut due: Vec<tokio::time::Instant> =
            vec![tokio::time::Instant::now(); groups.len()];

        loop {
            let interval = shared.cfg.read().expect("cfg lock").send_interval();
            if !sleep_unless_cancelled(&cancel, interval).await {
                master.close().await;
                break 'outer;
            }

            let started = tokio::time::Instant::now();
            let transport_down = poll_cycle(
                &shared,
                &groups,
                &mut due,
                &mut master,
                &cancel,
                &env,
                &channel_id,
            )
            .await;

            {
                let stats = master.stats();
                let mut status = shared.status.write().expect("status lock");
                status.bytes_sent = bytes_base.0 + stats.bytes_sent;
                status.bytes_received = bytes_base.1 + stats.bytes_received;
                status.current_delay_ms = started.elapsed().as_millis() as u64;
            }

            if cancel.is_cancelled() {
                master.close().await;
                break 'outer;
            }
            if transport_down {
                master.close().await;
                shared.status.write().expect("status lock").linking = false;
                if !sleep_unless_cancelled(&cancel, REOPEN_BACKOFF).await {
                    break 'outer;
                }
                continue 'outer;
            }
        }
    }

    let mut status = shared.status.write().expect("status lock");
    status.working = false;
    status.linking = false;
    debug!("poller exit");
}

/// One tick over every due device; returns whether the transport must be
/// reopened
async fn poll_cycle(
    shared: &WorkerShared,
    groups: &[PollGroup],
    due: &mut [tokio::time::Instant],
    master: &mut ModbusMaster,
    cancel: &CancellationToken,
    env: &HostEnv,
    channel_id: &str,
) -> bool {
    use gridflux_protocols::modbus::RegKind;

    if groups.is_empty() {
        // No catalogue yet; probe the link so status stays honest
        return match master.read(1, RegKind::Holding, 0, 1).await {
            Ok(_) => false,
            Err(e) if e.is_exception() => false,
            Err(e) => {
                warn!(error = %e, "link probe failed");
                true
            }
        };
    }

    let now = tokio::time::Instant::now();
    for (group, due_at) in groups.iter().zip(due.iter_mut()) {
        if *due_at > now {
            continue;
        }
        *due_at = now + group.interval;

        for point in &group.points {
            if cancel.is_cancelled() {
                return false;
            }

            let order = shared.cfg.read().expect("cfg lock").register_order();
            let spec = point.extract_spec(order);

            let block = match master
                .read(group.unit_id, point.kind, point.address, point.read_quantity())
                .await
            {
                Ok(block) => block,
                Err(e) if e.is_exception() => {
                    info!(
                        unit_id = group.unit_id,
                        function_code = point.function_code,
                        address = point.address,
                        error = %e,
                        "slave exception"
                    );
                    shared.status.write().expect("status lock").points_error_read += 1;
                    continue;
                }
                Err(e) => {
                    warn!(
                        unit_id = group.unit_id,
                        function_code = point.function_code,
                        address = point.address,
                        error = %e,
                        "read failed, reopening transport"
                    );
                    shared.status.write().expect("status lock").points_error_read += 1;
                    return true;
                }
            };

            match decode_block(&block, &spec) {
                Ok(value) => {
                    shared.status.write().expect("status lock").points_total_read += 1;
                    publish_point(env, channel_id, group.unit_id, point, &value).await;
                }
                Err(e) => {
                    warn!(
                        unit_id = group.unit_id,
                        function_code = point.function_code,
                        address = point.address,
                        error = %e,
                        "decode failed"
                    );
                    shared.status.write().expect("status lock").points_error_read += 1;
                }
            }
        }
    }
    false
}

async fn publish_point(
    env: &HostEnv,
    channel_id: &str,
    unit_id: u8,
    point: &DeviceTypePoint,
    value: &gridflux_comlink::Scalar,
) {
    let mut payload = json!({
        "kind": value.kind().as_str(),
        "value": value.to_json_value(),
        "unit": point.unit,
        "name": point.name_en(),
        "ts": chrono::Utc::now().to_rfc3339(),
    });
    if let Some(raw) = value.as_integer() {
        if let Some(label) = point.enum_label(raw as i64) {
            payload["label"] = json!(label);
        }
    }
    let _ = env
        .publish_point(channel_id, unit_id, &point.point_code, &payload)
        .await;
}
