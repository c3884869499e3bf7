#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use actix::prelude::*;
use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use device_cluster::entity::{
    AttributeScope, ClusterSender, DeviceDao, DeviceEvent, DeviceEventSink, DeviceMetadata,
    EntityServices, EntitySettings, FromDeviceRpcResponse, KvMap, RpcResponseSink,
    ToTransportMsg, TransportService,
};
use device_cluster::{
    ActorFault, ClusterResult, EntityId, EntityStateCorrupted, PeerAddress, SessionFault,
    SessionId, TenantId,
};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        actix_rt::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn peer(host: &str) -> PeerAddress {
    PeerAddress::new(host, 7070)
}

#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(SessionId, ToTransportMsg)>>,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<(SessionId, ToTransportMsg)> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, session_id: SessionId) -> Vec<ToTransportMsg> {
        self.sent
            .lock()
            .iter()
            .filter(|(id, _)| *id == session_id)
            .map(|(_, msg)| msg.clone())
            .collect()
    }
}

impl TransportService for RecordingTransport {
    fn send_to_session(&self, session_id: SessionId, msg: ToTransportMsg) {
        self.sent.lock().push((session_id, msg));
    }
}

pub struct FakeDao {
    pub metadata: DeviceMetadata,
    pub fail_writes: AtomicBool,
    pub panic_writes: AtomicBool,
    pub corrupt_writes: AtomicBool,
    pub telemetry: Mutex<Vec<(EntityId, i64, KvMap)>>,
    pub attributes: Mutex<HashMap<AttributeScope, KvMap>>,
    pub metadata_loads: AtomicUsize,
    pub attribute_loads: AtomicUsize,
}

impl Default for FakeDao {
    fn default() -> Self {
        FakeDao {
            metadata: DeviceMetadata {
                name: "thermostat-1".to_string(),
                device_type: "thermostat".to_string(),
            },
            fail_writes: AtomicBool::new(false),
            panic_writes: AtomicBool::new(false),
            corrupt_writes: AtomicBool::new(false),
            telemetry: Mutex::new(Vec::new()),
            attributes: Mutex::new(HashMap::new()),
            metadata_loads: AtomicUsize::new(0),
            attribute_loads: AtomicUsize::new(0),
        }
    }
}

impl FakeDao {
    fn check_write(&self) -> anyhow::Result<()> {
        if self.panic_writes.load(Ordering::SeqCst) {
            panic!("storage driver crashed");
        }
        if self.corrupt_writes.load(Ordering::SeqCst) {
            return Err(anyhow::Error::new(EntityStateCorrupted(
                "telemetry series out of order".to_string(),
            )));
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("storage unavailable"));
        }
        Ok(())
    }

    pub fn seed_attribute(&self, scope: AttributeScope, key: &str, value: serde_json::Value) {
        self.attributes
            .lock()
            .entry(scope)
            .or_default()
            .insert(key.to_string(), value);
    }
}

#[async_trait]
impl DeviceDao for FakeDao {
    async fn find_device_metadata(
        &self,
        _tenant_id: TenantId,
        _entity_id: EntityId,
    ) -> anyhow::Result<DeviceMetadata> {
        self.metadata_loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.metadata.clone())
    }

    async fn save_telemetry(
        &self,
        _tenant_id: TenantId,
        entity_id: EntityId,
        ts: i64,
        values: KvMap,
    ) -> anyhow::Result<()> {
        self.check_write()?;
        self.telemetry.lock().push((entity_id, ts, values));
        Ok(())
    }

    async fn save_attributes(
        &self,
        _tenant_id: TenantId,
        _entity_id: EntityId,
        scope: AttributeScope,
        values: KvMap,
    ) -> anyhow::Result<()> {
        self.check_write()?;
        self.attributes.lock().entry(scope).or_default().extend(values);
        Ok(())
    }

    async fn find_attributes(
        &self,
        _tenant_id: TenantId,
        _entity_id: EntityId,
        scope: AttributeScope,
        keys: Vec<String>,
    ) -> anyhow::Result<KvMap> {
        self.attribute_loads.fetch_add(1, Ordering::SeqCst);
        let attributes = self.attributes.lock();
        let stored = attributes.get(&scope).cloned().unwrap_or_default();
        if keys.is_empty() {
            return Ok(stored);
        }
        Ok(stored
            .into_iter()
            .filter(|(key, _)| keys.contains(key))
            .collect())
    }
}

#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<DeviceEvent>>,
}

impl RecordingEvents {
    pub fn events(&self) -> Vec<DeviceEvent> {
        self.events.lock().clone()
    }
}

impl DeviceEventSink for RecordingEvents {
    fn on_device_event(&self, event: DeviceEvent) {
        self.events.lock().push(event);
    }
}

#[derive(Default)]
pub struct RecordingRpc {
    responses: Mutex<Vec<FromDeviceRpcResponse>>,
}

impl RecordingRpc {
    pub fn responses(&self) -> Vec<FromDeviceRpcResponse> {
        self.responses.lock().clone()
    }
}

impl RpcResponseSink for RecordingRpc {
    fn on_rpc_response(&self, response: FromDeviceRpcResponse) {
        self.responses.lock().push(response);
    }
}

pub struct RecordingCluster {
    local: PeerAddress,
    sent: Mutex<Vec<(Option<PeerAddress>, Bytes)>>,
}

impl RecordingCluster {
    pub fn new(local: PeerAddress) -> Self {
        RecordingCluster {
            local,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<(Option<PeerAddress>, Bytes)> {
        self.sent.lock().clone()
    }
}

impl ClusterSender for RecordingCluster {
    fn local_address(&self) -> &PeerAddress {
        &self.local
    }

    fn send_to_cluster(&self, target: Option<PeerAddress>, payload: Bytes) -> ClusterResult<()> {
        self.sent.lock().push((target, payload));
        Ok(())
    }
}

/// Fakes behind an [`EntityServices`]
pub struct Fakes {
    pub dao: Arc<FakeDao>,
    pub transport: Arc<RecordingTransport>,
    pub events: Arc<RecordingEvents>,
    pub rpc: Arc<RecordingRpc>,
    pub cluster: Arc<RecordingCluster>,
}

impl Fakes {
    pub fn new() -> Self {
        Fakes {
            dao: Arc::new(FakeDao::default()),
            transport: Arc::new(RecordingTransport::default()),
            events: Arc::new(RecordingEvents::default()),
            rpc: Arc::new(RecordingRpc::default()),
            cluster: Arc::new(RecordingCluster::new(peer("10.0.0.1"))),
        }
    }

    pub fn services(&self, settings: EntitySettings) -> EntityServices {
        EntityServices {
            dao: self.dao.clone(),
            transport: self.transport.clone(),
            events: self.events.clone(),
            rpc_responses: self.rpc.clone(),
            cluster: self.cluster.clone(),
            settings,
        }
    }
}

/// Collects supervision reports
#[derive(Default)]
pub struct FaultCollector {
    pub actor_faults: Arc<Mutex<Vec<ActorFault>>>,
    pub session_faults: Arc<Mutex<Vec<SessionFault>>>,
}

impl Actor for FaultCollector {
    type Context = Context<Self>;
}

impl Handler<ActorFault> for FaultCollector {
    type Result = ();

    fn handle(&mut self, msg: ActorFault, _ctx: &mut Self::Context) {
        self.actor_faults.lock().push(msg);
    }
}

impl Handler<SessionFault> for FaultCollector {
    type Result = ();

    fn handle(&mut self, msg: SessionFault, _ctx: &mut Self::Context) {
        self.session_faults.lock().push(msg);
    }
}
