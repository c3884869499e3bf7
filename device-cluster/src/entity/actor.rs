//! The device actor.

use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use actix::prelude::*;
use futures::FutureExt as _;
use log::{debug, error, info, trace, warn};

use crate::entity::messages::{
    AttributeScope, ClientRpcKey, DeviceActorMsg, DeviceEvent, FromDeviceRpcResponse,
    ProcessOutcome, RpcError, ToDeviceRpcRequest, ToTransportMsg, TransportMsg, TransportToDevice,
};
use crate::entity::registry::RegistryHandle;
use crate::entity::services::{DeviceMetadata, EntityServices, KvMap};
use crate::entity::state::DeviceState;
use crate::entity::{EntityId, SessionId, TenantId};
use crate::error::ProcessingError;
use crate::message::MessageRegistry;
use crate::supervision::{ActorFault, BudgetVerdict, FailureBudget};

/// Wall clock in ms since the epoch
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn parse_object(payload: &str) -> Result<KvMap, String> {
    match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err("payload is not a JSON object".to_string()),
        Err(e) => Err(format!("invalid JSON payload: {}", e)),
    }
}

/// Mailbox-serialized state machine for one device
pub struct DeviceActor {
    state: DeviceState,
    services: EntityServices,
    budget: FailureBudget,
    registry: Option<RegistryHandle>,
    last_error: Option<ProcessingError>,
}

impl DeviceActor {
    /// Create an actor for `entity_id`
    pub fn new(tenant_id: TenantId, entity_id: EntityId, services: EntityServices) -> Self {
        let budget = FailureBudget::new(services.settings.retry);
        DeviceActor {
            state: DeviceState::new(tenant_id, entity_id),
            services,
            budget,
            registry: None,
            last_error: None,
        }
    }

    pub(crate) fn with_registry(mut self, registry: RegistryHandle) -> Self {
        self.registry = Some(registry);
        self
    }

    fn entity_id(&self) -> EntityId {
        self.state.entity_id()
    }

    fn process(
        &mut self,
        msg: DeviceActorMsg,
        ctx: &mut Context<Self>,
    ) -> Result<ProcessOutcome, ProcessingError> {
        match msg {
            DeviceActorMsg::Transport(TransportToDevice { session_id, msg }) => {
                self.process_transport(session_id, msg, ctx)?;
            }
            DeviceActorMsg::AttributesUpdated {
                scope,
                keys,
                deleted,
            } => {
                debug!(
                    "[{}] Attributes {} in scope {:?}: {:?}",
                    self.entity_id(),
                    if deleted { "deleted" } else { "updated" },
                    scope,
                    keys
                );
                self.state.invalidate_attributes(scope, &keys);
            }
            DeviceActorMsg::CredentialsUpdated => {
                debug!("[{}] Credentials updated", self.entity_id());
                self.state.invalidate_metadata();
            }
            DeviceActorMsg::NameOrTypeUpdated { name, device_type } => {
                debug!(
                    "[{}] Name or type updated: {} / {}",
                    self.entity_id(),
                    name,
                    device_type
                );
                self.state.set_metadata(DeviceMetadata { name, device_type });
            }
            DeviceActorMsg::ToDeviceRpcRequest(request) => {
                self.process_rpc_request(request, ctx)?;
            }
            DeviceActorMsg::ServerSideRpcTimeout { request_id } => {
                match self.state.take_server_rpc(request_id) {
                    Some(pending) => {
                        debug!(
                            "[{}] RPC {} timed out",
                            self.entity_id(),
                            pending.request.id
                        );
                        self.report_rpc_outcome(pending.request, Err(RpcError::Timeout))?;
                    }
                    None => trace!(
                        "[{}] RPC timeout for resolved request {}",
                        self.entity_id(),
                        request_id
                    ),
                }
            }
            DeviceActorMsg::ToServerRpcResponse { key, result } => {
                if self.state.take_client_rpc(&key) {
                    self.services.transport.send_to_session(
                        key.session_id,
                        ToTransportMsg::ToServerRpcResponse {
                            request_id: key.request_id,
                            result,
                        },
                    );
                } else {
                    debug!(
                        "[{}] Dropping late response for device request {:?}",
                        self.entity_id(),
                        key
                    );
                }
            }
            DeviceActorMsg::ClientSideRpcTimeout { key } => {
                if self.state.take_client_rpc(&key) {
                    debug!("[{}] Device request {:?} timed out", self.entity_id(), key);
                    self.services.transport.send_to_session(
                        key.session_id,
                        ToTransportMsg::ToServerRpcResponse {
                            request_id: key.request_id,
                            result: Err(RpcError::Timeout),
                        },
                    );
                }
            }
            DeviceActorMsg::SessionTimeoutSweep => self.sweep()?,
            DeviceActorMsg::Stop => {
                info!("[{}] Stopping device actor", self.entity_id());
                ctx.stop();
            }
            DeviceActorMsg::Custom { kind, .. } => {
                debug!(
                    "[{}] Unhandled message kind {}",
                    self.entity_id(),
                    kind
                );
                return Ok(ProcessOutcome::Unhandled);
            }
        }
        Ok(ProcessOutcome::Handled)
    }

    fn process_transport(
        &mut self,
        session_id: SessionId,
        msg: TransportMsg,
        ctx: &mut Context<Self>,
    ) -> Result<(), ProcessingError> {
        let now = Instant::now();
        if msg == TransportMsg::SessionClose {
            if self.state.close_session(&session_id) {
                debug!("[{}][{}] Session closed", self.entity_id(), session_id);
            }
            return Ok(());
        }

        // any message on an unknown session binds it
        let max_sessions = self.services.settings.max_sessions_per_device;
        if let Some(evicted) = self.state.open_session(session_id, now, max_sessions) {
            info!(
                "[{}][{}] Session limit {} reached, closing least recent session",
                self.entity_id(),
                evicted,
                max_sessions
            );
            self.services.transport.send_to_session(
                evicted,
                ToTransportMsg::SessionClose {
                    reason: format!("max sessions per device ({}) exceeded", max_sessions),
                },
            );
        }

        match msg {
            TransportMsg::SessionOpen | TransportMsg::Activity | TransportMsg::SessionClose => {}
            TransportMsg::SubscribeAttributes { unsubscribe } => {
                self.state.subscribe_attributes(&session_id, !unsubscribe);
            }
            TransportMsg::SubscribeRpc { unsubscribe } => {
                self.state.subscribe_rpc(&session_id, !unsubscribe);
            }
            TransportMsg::PostTelemetry { ts, payload } => {
                self.post_telemetry(session_id, ts, &payload, ctx);
            }
            TransportMsg::PostAttributes { payload } => {
                self.post_attributes(session_id, &payload, ctx);
            }
            TransportMsg::GetAttributes {
                request_id,
                client_keys,
                shared_keys,
            } => {
                self.get_attributes(session_id, request_id, client_keys, shared_keys, ctx);
            }
            TransportMsg::ToDeviceRpcResponse {
                request_id,
                payload,
            } => match self.state.take_server_rpc(request_id) {
                Some(pending) => {
                    self.report_rpc_outcome(pending.request, Ok(Some(payload)))?;
                }
                None => debug!(
                    "[{}][{}] Dropping response for unknown or expired RPC {}",
                    self.entity_id(),
                    session_id,
                    request_id
                ),
            },
            TransportMsg::ToServerRpcRequest {
                request_id,
                method,
                params,
            } => {
                let key = ClientRpcKey {
                    session_id,
                    request_id,
                };
                let timeout = self.services.settings.rpc_timeout;
                self.state
                    .register_client_rpc(key, now_ms() + timeout.as_millis() as i64);
                self.services.events.on_device_event(DeviceEvent::ToServerRpcRequest {
                    tenant_id: self.state.tenant_id(),
                    entity_id: self.entity_id(),
                    key,
                    method,
                    params,
                });
                ctx.notify_later(DeviceActorMsg::ClientSideRpcTimeout { key }, timeout);
            }
        }
        Ok(())
    }

    fn post_telemetry(
        &mut self,
        session_id: SessionId,
        ts: Option<i64>,
        payload: &str,
        ctx: &mut Context<Self>,
    ) {
        let values = match parse_object(payload) {
            Ok(values) => values,
            Err(reason) => {
                warn!("[{}][{}] Rejected telemetry: {}", self.entity_id(), session_id, reason);
                self.services
                    .transport
                    .send_to_session(session_id, ToTransportMsg::Failure { reason });
                return;
            }
        };
        let ts = ts.unwrap_or_else(now_ms);
        let dao = self.services.dao.clone();
        let (tenant_id, entity_id) = (self.state.tenant_id(), self.entity_id());
        let cached = self.state.metadata().cloned();

        let work = async move {
            let metadata = match cached {
                Some(metadata) => metadata,
                None => dao.find_device_metadata(tenant_id, entity_id).await?,
            };
            dao.save_telemetry(tenant_id, entity_id, ts, values.clone())
                .await?;
            Ok::<_, ProcessingError>((metadata, values))
        };

        self.run_async(ctx, work, move |act, result, _| match result {
            Ok((metadata, values)) => {
                act.state.set_metadata(metadata.clone());
                act.services.events.on_device_event(DeviceEvent::Telemetry {
                    tenant_id,
                    entity_id,
                    metadata,
                    ts,
                    values,
                });
                act.services
                    .transport
                    .send_to_session(session_id, ToTransportMsg::Ack);
                Ok(())
            }
            Err(err) => {
                act.reply_failure(session_id, &err);
                Err(err)
            }
        });
    }

    fn post_attributes(&mut self, session_id: SessionId, payload: &str, ctx: &mut Context<Self>) {
        let values = match parse_object(payload) {
            Ok(values) => values,
            Err(reason) => {
                warn!("[{}][{}] Rejected attributes: {}", self.entity_id(), session_id, reason);
                self.services
                    .transport
                    .send_to_session(session_id, ToTransportMsg::Failure { reason });
                return;
            }
        };
        let dao = self.services.dao.clone();
        let (tenant_id, entity_id) = (self.state.tenant_id(), self.entity_id());
        let cached = self.state.metadata().cloned();

        let work = async move {
            let metadata = match cached {
                Some(metadata) => metadata,
                None => dao.find_device_metadata(tenant_id, entity_id).await?,
            };
            dao.save_attributes(tenant_id, entity_id, AttributeScope::Client, values.clone())
                .await?;
            Ok::<_, ProcessingError>((metadata, values))
        };

        self.run_async(ctx, work, move |act, result, _| match result {
            Ok((metadata, values)) => {
                act.state.set_metadata(metadata.clone());
                act.state.cache_attributes(AttributeScope::Client, &values);
                act.services.events.on_device_event(DeviceEvent::Attributes {
                    tenant_id,
                    entity_id,
                    metadata,
                    values,
                });
                act.services
                    .transport
                    .send_to_session(session_id, ToTransportMsg::Ack);
                Ok(())
            }
            Err(err) => {
                act.reply_failure(session_id, &err);
                Err(err)
            }
        });
    }

    /// Cached values plus the keys still to load; `Some(vec![])` loads the whole scope
    fn attribute_plan(&self, scope: AttributeScope, keys: &[String]) -> (KvMap, Option<Vec<String>>) {
        if keys.is_empty() {
            return (KvMap::new(), Some(Vec::new()));
        }
        let (found, missing) = self.state.cached_attributes(scope, keys);
        if missing.is_empty() {
            (found, None)
        } else {
            (found, Some(missing))
        }
    }

    fn get_attributes(
        &mut self,
        session_id: SessionId,
        request_id: i32,
        client_keys: Vec<String>,
        shared_keys: Vec<String>,
        ctx: &mut Context<Self>,
    ) {
        let (client_cached, client_fetch) = self.attribute_plan(AttributeScope::Client, &client_keys);
        let (shared_cached, shared_fetch) = self.attribute_plan(AttributeScope::Shared, &shared_keys);
        let dao = self.services.dao.clone();
        let (tenant_id, entity_id) = (self.state.tenant_id(), self.entity_id());

        let work = async move {
            let client = match client_fetch {
                Some(keys) => {
                    dao.find_attributes(tenant_id, entity_id, AttributeScope::Client, keys)
                        .await?
                }
                None => KvMap::new(),
            };
            let shared = match shared_fetch {
                Some(keys) => {
                    dao.find_attributes(tenant_id, entity_id, AttributeScope::Shared, keys)
                        .await?
                }
                None => KvMap::new(),
            };
            Ok::<_, ProcessingError>((client, shared))
        };

        self.run_async(ctx, work, move |act, result, _| match result {
            Ok((client_loaded, shared_loaded)) => {
                act.state.cache_attributes(AttributeScope::Client, &client_loaded);
                act.state.cache_attributes(AttributeScope::Shared, &shared_loaded);
                let mut client = client_cached;
                client.extend(client_loaded);
                let mut shared = shared_cached;
                shared.extend(shared_loaded);
                act.services.transport.send_to_session(
                    session_id,
                    ToTransportMsg::AttributesResponse {
                        request_id,
                        client,
                        shared,
                    },
                );
                Ok(())
            }
            Err(err) => {
                act.reply_failure(session_id, &err);
                Err(err)
            }
        });
    }

    fn process_rpc_request(
        &mut self,
        request: ToDeviceRpcRequest,
        ctx: &mut Context<Self>,
    ) -> Result<(), ProcessingError> {
        let now = now_ms();
        if request.expiration_time <= now {
            debug!("[{}] RPC {} expired on arrival", self.entity_id(), request.id);
            return self.report_rpc_outcome(request, Err(RpcError::Timeout));
        }

        let sessions = self.state.rpc_sessions();
        if sessions.is_empty() {
            debug!(
                "[{}] RPC {} failed: no session subscribed to RPC",
                self.entity_id(),
                request.id
            );
            return self.report_rpc_outcome(request, Err(RpcError::DeviceUnreachable));
        }

        let seq = self.state.next_rpc_seq();
        if self.state.has_server_rpc(seq) {
            let reason = format!("RPC sequence {} is still outstanding", seq);
            self.report_rpc_outcome(request, Err(RpcError::Failed(reason.clone())))?;
            return Err(ProcessingError::Fatal(reason));
        }
        for session_id in &sessions {
            self.services.transport.send_to_session(
                *session_id,
                ToTransportMsg::ToDeviceRpcRequest {
                    request_id: seq,
                    method: request.method.clone(),
                    params: request.params.clone(),
                },
            );
        }

        if request.oneway {
            return self.report_rpc_outcome(request, Ok(None));
        }

        let delay = Duration::from_millis((request.expiration_time - now) as u64);
        debug!(
            "[{}] RPC {} sent as {} to {} session(s), deadline in {:?}",
            self.entity_id(),
            request.id,
            seq,
            sessions.len(),
            delay
        );
        self.state.register_server_rpc(seq, request);
        ctx.notify_later(DeviceActorMsg::ServerSideRpcTimeout { request_id: seq }, delay);
        Ok(())
    }

    /// Deliver an RPC outcome to the node that issued the request
    fn report_rpc_outcome(
        &self,
        request: ToDeviceRpcRequest,
        result: Result<Option<String>, RpcError>,
    ) -> Result<(), ProcessingError> {
        let response = FromDeviceRpcResponse {
            request_id: request.id,
            tenant_id: self.state.tenant_id(),
            entity_id: self.entity_id(),
            result,
        };
        let cluster = &self.services.cluster;
        match request.origin {
            Some(origin) if origin != *cluster.local_address() => {
                let payload = MessageRegistry::encode(&response)
                    .map_err(|e| ProcessingError::Transient(e.to_string()))?;
                cluster
                    .send_to_cluster(Some(origin), payload)
                    .map_err(|e| ProcessingError::Transient(e.to_string()))
            }
            _ => {
                self.services.rpc_responses.on_rpc_response(response);
                Ok(())
            }
        }
    }

    fn sweep(&mut self) -> Result<(), ProcessingError> {
        let timeout = self.services.settings.session_timeout;
        for session_id in self.state.sweep_sessions(Instant::now(), timeout) {
            info!(
                "[{}][{}] Session inactive for {:?}, evicted",
                self.entity_id(),
                session_id,
                timeout
            );
            self.services.transport.send_to_session(
                session_id,
                ToTransportMsg::SessionClose {
                    reason: "session timeout".to_string(),
                },
            );
        }

        let now = now_ms();
        for pending in self.state.take_expired_server_rpcs(now) {
            self.report_rpc_outcome(pending.request, Err(RpcError::Timeout))?;
        }
        for key in self.state.take_expired_client_rpcs(now) {
            self.services.transport.send_to_session(
                key.session_id,
                ToTransportMsg::ToServerRpcResponse {
                    request_id: key.request_id,
                    result: Err(RpcError::Timeout),
                },
            );
        }
        Ok(())
    }

    /// Fail every outstanding platform-to-device RPC; the actor is going away
    fn fail_outstanding_rpcs(&mut self) {
        for pending in self.state.take_all_server_rpcs() {
            let request_id = pending.request.id;
            let outcome = Err(RpcError::Failed("device actor stopped".to_string()));
            if let Err(err) = self.report_rpc_outcome(pending.request, outcome) {
                warn!(
                    "[{}] Could not report RPC {} after stop: {}",
                    self.entity_id(),
                    request_id,
                    err
                );
            }
        }
    }

    fn reply_failure(&self, session_id: SessionId, err: &ProcessingError) {
        self.services.transport.send_to_session(
            session_id,
            ToTransportMsg::Failure {
                reason: err.to_string(),
            },
        );
    }

    /// Run collaborator work without releasing the mailbox, then apply its
    /// result on the actor
    fn run_async<T, F, C>(&mut self, ctx: &mut Context<Self>, work: F, complete: C)
    where
        T: 'static,
        F: Future<Output = Result<T, ProcessingError>> + 'static,
        C: FnOnce(&mut Self, Result<T, ProcessingError>, &mut Context<Self>) -> Result<(), ProcessingError>
            + 'static,
    {
        let guarded = AssertUnwindSafe(work).catch_unwind().map(|result| match result {
            Ok(result) => result,
            Err(payload) => Err(ProcessingError::Panicked(panic_message(payload.as_ref()))),
        });

        ctx.wait(guarded.into_actor(self).map(move |result, act, ctx| {
            if let Err(err) = complete(act, result, ctx) {
                act.on_failure(err, ctx);
            }
        }));
    }

    fn on_failure(&mut self, err: ProcessingError, ctx: &mut Context<Self>) {
        error!("[{}] Failed to process message: {}", self.entity_id(), err);
        let verdict = self.budget.record_failure();
        let failures = match verdict {
            BudgetVerdict::Retry(n) | BudgetVerdict::Exhausted(n) => n,
        };

        if err.is_fatal() || matches!(verdict, BudgetVerdict::Exhausted(_)) {
            error!(
                "[{}] Stopping actor after {} failure(s) within {:?}",
                self.entity_id(),
                failures,
                self.budget.window()
            );
            if let Some(registry) = &self.registry {
                registry.report_fault(ActorFault {
                    tenant_id: self.state.tenant_id(),
                    entity_id: self.entity_id(),
                    failures,
                    error: err.to_string(),
                });
            }
            self.last_error = Some(err);
            ctx.stop();
        } else {
            warn!(
                "[{}] Resuming with state intact ({} failure(s) in window)",
                self.entity_id(),
                failures
            );
            self.last_error = Some(err);
        }
    }
}

impl Actor for DeviceActor {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        debug!("[{}] Device actor started", self.entity_id());
        ctx.run_interval(self.services.settings.session_sweep_interval, |_, ctx| {
            ctx.notify(DeviceActorMsg::SessionTimeoutSweep);
        });
    }

    fn stopped(&mut self, ctx: &mut Self::Context) {
        debug!(
            "[{}] Device actor stopped (last error: {:?})",
            self.entity_id(),
            self.last_error
        );
        self.fail_outstanding_rpcs();
        if let Some(registry) = &self.registry {
            registry.unregister(self.entity_id(), &ctx.address());
        }
    }
}

impl Handler<DeviceActorMsg> for DeviceActor {
    type Result = ProcessOutcome;

    fn handle(&mut self, msg: DeviceActorMsg, ctx: &mut Self::Context) -> Self::Result {
        trace!("[{}] Processing {:?}", self.entity_id(), msg);
        match panic::catch_unwind(AssertUnwindSafe(|| self.process(msg, ctx))) {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                self.on_failure(err, ctx);
                ProcessOutcome::Handled
            }
            Err(payload) => {
                self.on_failure(ProcessingError::Panicked(panic_message(payload.as_ref())), ctx);
                ProcessOutcome::Handled
            }
        }
    }
}
