//! Service discovery, request routing, health checks and transport security.
//!
//! Every network effect goes through a [`Transport`]. [`InMemoryTransport`]
//! is a scripted fake; [`HttpTransport`] (feature `http`) talks to real
//! endpoints with reqwest.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rampart_types::{retry_with_backoff, EscalationKind, EscalationLog, OrgId, RecordId, RetryError, ServiceId, Severity};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{RetryPolicy, ServiceConfig};
use crate::error::{IntegrationError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
}

/// What a caller supplies to register a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub service_id: ServiceId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub version: String,
}

impl ServiceRegistration {
    pub fn new(service_id: impl Into<ServiceId>, name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            service_id: service_id.into(),
            name: name.into(),
            host: host.into(),
            port,
            protocol: "http".to_string(),
            version: "1.0".to_string(),
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}

/// A registered service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub registration: ServiceRegistration,
    pub state: ServiceState,
    pub registered_at: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
    #[serde(skip)]
    checked: Option<Instant>,
}

impl ServiceEndpoint {
    pub fn service_id(&self) -> &ServiceId {
        &self.registration.service_id
    }

    pub fn url(&self) -> String {
        format!(
            "{}://{}:{}",
            self.registration.protocol, self.registration.host, self.registration.port
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub request_id: RecordId,
    pub source: ServiceId,
    pub target: ServiceId,
    pub method: String,
    pub path: String,
    pub payload: Value,
}

impl ServiceRequest {
    pub fn new(
        source: impl Into<ServiceId>,
        target: impl Into<ServiceId>,
        method: impl Into<String>,
        path: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            request_id: RecordId::generate(),
            source: source.into(),
            target: target.into(),
            method: method.into(),
            path: path.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceResponse {
    pub request_id: RecordId,
    pub org_id: OrgId,
    pub status_code: u16,
    pub payload: Value,
    pub response_time_ms: u64,
    pub attempts: u32,
    pub received_at: DateTime<Utc>,
}

impl ServiceResponse {
    pub fn is_successful(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub service_id: ServiceId,
    pub state: ServiceState,
    pub response_time_ms: u64,
    pub checked_at: DateTime<Utc>,
    pub details: Value,
}

impl HealthCheckResult {
    pub fn is_healthy(&self) -> bool {
        self.state == ServiceState::Healthy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    None,
    Basic,
    Encrypted,
    MutualTls,
}

/// Credentials offered to [`ServiceCommunicator::configure_security`].
#[derive(Debug, Clone, Default)]
pub struct SecurityCredentials {
    pub api_key: Option<String>,
    pub token: Option<String>,
    /// PEM or DER text; only its SHA-256 hash is kept.
    pub certificate: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityContext {
    pub org_id: OrgId,
    pub level: SecurityLevel,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    #[serde(skip_serializing)]
    pub token: Option<String>,
    pub certificate_hash: Option<String>,
    pub configured_at: DateTime<Utc>,
}

impl SecurityContext {
    /// Whether the credential required by the level is present.
    pub fn is_valid(&self) -> bool {
        match self.level {
            SecurityLevel::None => true,
            SecurityLevel::Basic => self.api_key.is_some(),
            SecurityLevel::Encrypted => self.token.is_some(),
            SecurityLevel::MutualTls => self.certificate_hash.is_some(),
        }
    }

    fn secret(&self) -> &str {
        match self.level {
            SecurityLevel::None => "",
            SecurityLevel::Basic => self.api_key.as_deref().unwrap_or_default(),
            SecurityLevel::Encrypted => self.token.as_deref().unwrap_or_default(),
            SecurityLevel::MutualTls => self.certificate_hash.as_deref().unwrap_or_default(),
        }
    }
}

impl SecurityLevel {
    /// Levels whose payloads are sealed with AES-256-GCM.
    pub fn encrypts(&self) -> bool {
        matches!(self, SecurityLevel::Encrypted | SecurityLevel::MutualTls)
    }
}

/// Payload bound to a tenant's security context.
///
/// `data` is base64 of the JSON bytes, or of `nonce || ciphertext` when
/// `encrypted`. `digest` is a hex HMAC-SHA256 over the level and `data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadEnvelope {
    pub encrypted: bool,
    pub level: SecurityLevel,
    pub data: String,
    pub digest: String,
}

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;
const CIPHER_KEY_LABEL: &[u8] = b"rampart.envelope.cipher";
const MAC_KEY_LABEL: &[u8] = b"rampart.envelope.mac";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("transport error: {0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportResponse {
    pub status_code: u16,
    pub payload: Value,
}

/// Moves requests and health probes to a service.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        endpoint: &ServiceEndpoint,
        request: &ServiceRequest,
    ) -> std::result::Result<TransportResponse, TransportError>;

    async fn probe(&self, endpoint: &ServiceEndpoint) -> std::result::Result<(), TransportError>;
}

#[derive(Debug, Clone)]
struct ScriptedReply {
    delay: Duration,
    outcome: std::result::Result<TransportResponse, String>,
}

#[derive(Debug, Clone, Default)]
struct ProbeScript {
    latency: Duration,
    error: Option<String>,
}

/// Scripted transport for tests. Replies are consumed in order per service;
/// with nothing scripted a request answers 200 echoing its payload.
#[derive(Debug, Default)]
pub struct InMemoryTransport {
    replies: Mutex<HashMap<ServiceId, VecDeque<ScriptedReply>>>,
    probes: Mutex<HashMap<ServiceId, ProbeScript>>,
    sent: Mutex<Vec<ServiceRequest>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, service: &ServiceId, status_code: u16, payload: Value) {
        self.push(service, Duration::ZERO, Ok(TransportResponse { status_code, payload }));
    }

    pub fn push_delayed_response(&self, service: &ServiceId, delay: Duration, status_code: u16, payload: Value) {
        self.push(service, delay, Ok(TransportResponse { status_code, payload }));
    }

    pub fn push_error(&self, service: &ServiceId, error: impl Into<String>) {
        self.push(service, Duration::ZERO, Err(error.into()));
    }

    pub fn set_probe_latency(&self, service: &ServiceId, latency: Duration) {
        self.probes.lock().entry(service.clone()).or_default().latency = latency;
    }

    pub fn set_probe_error(&self, service: &ServiceId, error: impl Into<String>) {
        self.probes.lock().entry(service.clone()).or_default().error = Some(error.into());
    }

    pub fn sent_requests(&self) -> Vec<ServiceRequest> {
        self.sent.lock().clone()
    }

    fn push(&self, service: &ServiceId, delay: Duration, outcome: std::result::Result<TransportResponse, String>) {
        self.replies
            .lock()
            .entry(service.clone())
            .or_default()
            .push_back(ScriptedReply { delay, outcome });
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(
        &self,
        endpoint: &ServiceEndpoint,
        request: &ServiceRequest,
    ) -> std::result::Result<TransportResponse, TransportError> {
        self.sent.lock().push(request.clone());
        let reply = self
            .replies
            .lock()
            .get_mut(endpoint.service_id())
            .and_then(VecDeque::pop_front);

        match reply {
            Some(reply) => {
                if !reply.delay.is_zero() {
                    tokio::time::sleep(reply.delay).await;
                }
                reply.outcome.map_err(TransportError::Connection)
            }
            None => Ok(TransportResponse {
                status_code: 200,
                payload: request.payload.clone(),
            }),
        }
    }

    async fn probe(&self, endpoint: &ServiceEndpoint) -> std::result::Result<(), TransportError> {
        let script = self
            .probes
            .lock()
            .get(endpoint.service_id())
            .cloned()
            .unwrap_or_default();
        if !script.latency.is_zero() {
            tokio::time::sleep(script.latency).await;
        }
        match script.error {
            Some(error) => Err(TransportError::Connection(error)),
            None => Ok(()),
        }
    }
}

/// reqwest-backed transport. Probes `GET {url}/health`.
#[cfg(feature = "http")]
pub struct HttpTransport {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl HttpTransport {
    pub fn new(timeout: Duration) -> std::result::Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        Ok(Self { client })
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        endpoint: &ServiceEndpoint,
        request: &ServiceRequest,
    ) -> std::result::Result<TransportResponse, TransportError> {
        let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|e| TransportError::Other(e.to_string()))?;
        let url = format!("{}/{}", endpoint.url(), request.path.trim_start_matches('/'));

        let response = self
            .client
            .request(method, url)
            .json(&request.payload)
            .send()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let status_code = response.status().as_u16();
        let payload = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok(TransportResponse { status_code, payload })
    }

    async fn probe(&self, endpoint: &ServiceEndpoint) -> std::result::Result<(), TransportError> {
        let response = self
            .client
            .get(format!("{}/health", endpoint.url()))
            .send()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(TransportError::Other(format!("health endpoint answered {}", response.status())))
        }
    }
}

/// Tenant-scoped service directory.
pub struct ServiceRegistry {
    endpoints: DashMap<(OrgId, ServiceId), ServiceEndpoint>,
    health_ttl: Duration,
}

impl ServiceRegistry {
    pub fn new(health_ttl: Duration) -> Self {
        Self {
            endpoints: DashMap::new(),
            health_ttl,
        }
    }

    /// Register or replace a service. Its state starts unknown.
    pub fn register(&self, org_id: &OrgId, registration: ServiceRegistration) -> ServiceEndpoint {
        let endpoint = ServiceEndpoint {
            registration,
            state: ServiceState::Unknown,
            registered_at: Utc::now(),
            last_health_check: None,
            checked: None,
        };
        self.endpoints
            .insert((org_id.clone(), endpoint.service_id().clone()), endpoint.clone());

        info!(org_id = %org_id, service = %endpoint.service_id(), url = %endpoint.url(), "Service registered");
        endpoint
    }

    pub fn deregister(&self, org_id: &OrgId, service_id: &ServiceId) -> bool {
        let removed = self
            .endpoints
            .remove(&(org_id.clone(), service_id.clone()))
            .is_some();
        if removed {
            info!(org_id = %org_id, service = %service_id, "Service deregistered");
        }
        removed
    }

    pub fn discover(&self, org_id: &OrgId, service_id: &ServiceId) -> Option<ServiceEndpoint> {
        self.endpoints
            .get(&(org_id.clone(), service_id.clone()))
            .map(|entry| self.with_effective_state(entry.value().clone()))
    }

    /// Services of a tenant, sorted by id, optionally filtered by state.
    pub fn list(&self, org_id: &OrgId, state: Option<ServiceState>) -> Vec<ServiceEndpoint> {
        let mut services: Vec<ServiceEndpoint> = self
            .endpoints
            .iter()
            .filter(|entry| &entry.key().0 == org_id)
            .map(|entry| self.with_effective_state(entry.value().clone()))
            .filter(|endpoint| state.map_or(true, |s| endpoint.state == s))
            .collect();
        services.sort_by(|a, b| a.service_id().cmp(b.service_id()));
        services
    }

    fn record_health(&self, org_id: &OrgId, service_id: &ServiceId, state: ServiceState, at: DateTime<Utc>) {
        if let Some(mut endpoint) = self.endpoints.get_mut(&(org_id.clone(), service_id.clone())) {
            endpoint.state = state;
            endpoint.last_health_check = Some(at);
            endpoint.checked = Some(Instant::now());
        }
    }

    // A health result older than the TTL no longer says anything.
    fn with_effective_state(&self, mut endpoint: ServiceEndpoint) -> ServiceEndpoint {
        if let Some(checked) = endpoint.checked {
            if checked.elapsed() > self.health_ttl {
                endpoint.state = ServiceState::Unknown;
            }
        }
        endpoint
    }
}

/// Sends requests between registered services.
pub struct ServiceCommunicator {
    config: ServiceConfig,
    registry: Arc<ServiceRegistry>,
    transport: Arc<dyn Transport>,
    health: DashMap<(OrgId, ServiceId), HealthCheckResult>,
    responses: DashMap<(OrgId, RecordId), ServiceResponse>,
    security: DashMap<OrgId, SecurityContext>,
    retry_policies: DashMap<OrgId, RetryPolicy>,
    escalations: Arc<EscalationLog>,
}

impl ServiceCommunicator {
    pub fn new(config: ServiceConfig, transport: Arc<dyn Transport>, escalations: Arc<EscalationLog>) -> Self {
        Self {
            registry: Arc::new(ServiceRegistry::new(config.health_ttl())),
            config,
            transport,
            health: DashMap::new(),
            responses: DashMap::new(),
            security: DashMap::new(),
            retry_policies: DashMap::new(),
            escalations,
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn register_service(&self, org_id: &OrgId, registration: ServiceRegistration) -> ServiceEndpoint {
        self.registry.register(org_id, registration)
    }

    pub fn deregister_service(&self, org_id: &OrgId, service_id: &ServiceId) -> bool {
        self.health.remove(&(org_id.clone(), service_id.clone()));
        self.registry.deregister(org_id, service_id)
    }

    pub fn discover_service(&self, org_id: &OrgId, service_id: &ServiceId) -> Option<ServiceEndpoint> {
        self.registry.discover(org_id, service_id)
    }

    pub fn list_services(&self, org_id: &OrgId, state: Option<ServiceState>) -> Vec<ServiceEndpoint> {
        self.registry.list(org_id, state)
    }

    /// Send one request. Unregistered targets answer 404 without touching
    /// the transport, timeouts answer 504, transport errors 503.
    #[instrument(skip(self, request), fields(org_id = %org_id, target = %request.target))]
    pub async fn send_request(&self, org_id: &OrgId, request: &ServiceRequest, timeout: Option<Duration>) -> ServiceResponse {
        let started = Instant::now();

        let (status_code, payload) = match self.registry.discover(org_id, &request.target) {
            None => (404, json!({ "error": format!("service {} not registered", request.target) })),
            Some(endpoint) => {
                let timeout = timeout.unwrap_or_else(|| self.config.request_timeout());
                match tokio::time::timeout(timeout, self.transport.send(&endpoint, request)).await {
                    Ok(Ok(reply)) => (reply.status_code, reply.payload),
                    Ok(Err(e)) => {
                        warn!(org_id = %org_id, target = %request.target, error = %e, "Service request failed");
                        (503, json!({ "error": e.to_string() }))
                    }
                    Err(_) => {
                        warn!(org_id = %org_id, target = %request.target, timeout_ms = timeout.as_millis() as u64, "Service request timed out");
                        (504, json!({ "error": "request timed out" }))
                    }
                }
            }
        };

        let response = ServiceResponse {
            request_id: request.request_id,
            org_id: org_id.clone(),
            status_code,
            payload,
            response_time_ms: started.elapsed().as_millis() as u64,
            attempts: 1,
            received_at: Utc::now(),
        };

        debug!(status = status_code, elapsed_ms = response.response_time_ms, "Service response");
        self.responses
            .insert((org_id.clone(), request.request_id), response.clone());
        response
    }

    /// Send with retries on the policy's status codes. Exhaustion returns the
    /// last response and raises a `service_retries_exhausted` escalation.
    pub async fn send_request_with_retry(
        &self,
        org_id: &OrgId,
        request: &ServiceRequest,
        policy: Option<&RetryPolicy>,
        cancel: &CancellationToken,
    ) -> Result<ServiceResponse> {
        let policy = policy.cloned().unwrap_or_else(|| self.retry_policy(org_id));
        let retry_on = &policy.retry_on_status;

        let outcome = retry_with_backoff(&policy.backoff, cancel, |attempt| async move {
            let mut response = self.send_request(org_id, request, None).await;
            response.attempts = attempt;
            if retry_on.contains(&response.status_code) {
                Err(response)
            } else {
                Ok(response)
            }
        })
        .await;

        let response = match outcome {
            Ok(response) => response,
            Err(RetryError::Cancelled { .. }) => return Err(IntegrationError::Cancelled),
            Err(RetryError::Exhausted { attempts, last }) => {
                self.escalations.raise(
                    org_id,
                    EscalationKind::ServiceRetriesExhausted,
                    Severity::High,
                    json!({
                        "request_id": request.request_id.to_string(),
                        "target": request.target.as_str(),
                        "attempts": attempts,
                        "last_status": last.status_code,
                    }),
                );
                last
            }
        };

        self.responses
            .insert((org_id.clone(), request.request_id), response.clone());
        Ok(response)
    }

    pub fn response(&self, org_id: &OrgId, request_id: RecordId) -> Option<ServiceResponse> {
        self.responses
            .get(&(org_id.clone(), request_id))
            .map(|entry| entry.value().clone())
    }

    pub fn set_retry_policy(&self, org_id: &OrgId, policy: RetryPolicy) {
        self.retry_policies.insert(org_id.clone(), policy);
    }

    /// The tenant's retry policy, or the configured default.
    pub fn retry_policy(&self, org_id: &OrgId) -> RetryPolicy {
        self.retry_policies
            .get(org_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| self.config.retry.clone())
    }

    /// Probe a service and band its response time.
    #[instrument(skip(self), fields(org_id = %org_id, service = %service_id))]
    pub async fn perform_health_check(&self, org_id: &OrgId, service_id: &ServiceId) -> HealthCheckResult {
        let started = Instant::now();

        let (state, details) = match self.registry.discover(org_id, service_id) {
            None => (ServiceState::Offline, json!({ "error": "service not registered" })),
            Some(endpoint) => {
                let probe = tokio::time::timeout(self.config.request_timeout(), self.transport.probe(&endpoint)).await;
                let elapsed = started.elapsed();
                match probe {
                    Ok(Ok(())) => (self.band(elapsed), json!({ "url": endpoint.url() })),
                    Ok(Err(e)) => (ServiceState::Unhealthy, json!({ "url": endpoint.url(), "error": e.to_string() })),
                    Err(_) => (ServiceState::Unhealthy, json!({ "url": endpoint.url(), "error": "probe timed out" })),
                }
            }
        };

        let result = HealthCheckResult {
            service_id: service_id.clone(),
            state,
            response_time_ms: started.elapsed().as_millis() as u64,
            checked_at: Utc::now(),
            details,
        };

        if state != ServiceState::Offline {
            self.registry
                .record_health(org_id, service_id, state, result.checked_at);
        }
        if matches!(state, ServiceState::Unhealthy | ServiceState::Offline) {
            warn!(org_id = %org_id, service = %service_id, state = ?state, "Service not healthy");
        } else {
            debug!(org_id = %org_id, service = %service_id, state = ?state, elapsed_ms = result.response_time_ms, "Health check");
        }

        self.health
            .insert((org_id.clone(), service_id.clone()), result.clone());
        result
    }

    /// The last recorded health check.
    pub fn health_status(&self, org_id: &OrgId, service_id: &ServiceId) -> Option<HealthCheckResult> {
        self.health
            .get(&(org_id.clone(), service_id.clone()))
            .map(|entry| entry.value().clone())
    }

    /// Healthy by its last check, which must still be within the TTL.
    pub fn is_service_healthy(&self, org_id: &OrgId, service_id: &ServiceId) -> bool {
        self.registry
            .discover(org_id, service_id)
            .is_some_and(|endpoint| endpoint.state == ServiceState::Healthy)
    }

    pub fn configure_security(
        &self,
        org_id: &OrgId,
        level: SecurityLevel,
        credentials: SecurityCredentials,
    ) -> SecurityContext {
        let certificate_hash = credentials
            .certificate
            .map(|certificate| hex::encode(Sha256::digest(certificate.as_bytes())));

        let context = SecurityContext {
            org_id: org_id.clone(),
            level,
            api_key: credentials.api_key,
            token: credentials.token,
            certificate_hash,
            configured_at: Utc::now(),
        };

        if !context.is_valid() {
            warn!(org_id = %org_id, level = ?level, "Security level configured without its credential");
        } else {
            info!(org_id = %org_id, level = ?level, "Security configured");
        }
        self.security.insert(org_id.clone(), context.clone());
        context
    }

    pub fn validate_security(&self, org_id: &OrgId) -> bool {
        self.security
            .get(org_id)
            .is_some_and(|context| context.is_valid())
    }

    pub fn security_level(&self, org_id: &OrgId) -> SecurityLevel {
        self.security
            .get(org_id)
            .map_or(SecurityLevel::None, |context| context.level)
    }

    /// Seal `payload` for the tenant. `Encrypted` and `MutualTls` encrypt;
    /// every level authenticates.
    pub fn encrypt_payload(&self, org_id: &OrgId, payload: &Value) -> Result<PayloadEnvelope> {
        let context = self.valid_context(org_id)?;
        let plaintext = serde_json::to_vec(payload)?;

        let encrypted = context.level.encrypts();
        let data = if encrypted {
            let cipher = Aes256Gcm::new(&derive_key(context.secret(), CIPHER_KEY_LABEL)?);
            let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
            let ciphertext = cipher
                .encrypt(&nonce, plaintext.as_slice())
                .map_err(|e| IntegrationError::InvalidEnvelope(format!("encryption failed: {e}")))?;

            let mut combined = nonce.to_vec();
            combined.extend_from_slice(&ciphertext);
            STANDARD.encode(combined)
        } else {
            STANDARD.encode(plaintext)
        };

        let digest = hex::encode(envelope_mac(context.secret(), context.level, &data)?.finalize().into_bytes());
        Ok(PayloadEnvelope {
            encrypted,
            level: context.level,
            data,
            digest,
        })
    }

    pub fn decrypt_payload(&self, org_id: &OrgId, envelope: &PayloadEnvelope) -> Result<Value> {
        let context = self.valid_context(org_id)?;
        if envelope.level != context.level || envelope.encrypted != context.level.encrypts() {
            return Err(IntegrationError::InvalidEnvelope(format!(
                "envelope level {:?} does not match tenant level {:?}",
                envelope.level, context.level
            )));
        }

        let tag = hex::decode(&envelope.digest)
            .map_err(|e| IntegrationError::InvalidEnvelope(format!("bad digest: {e}")))?;
        envelope_mac(context.secret(), context.level, &envelope.data)?
            .verify_slice(&tag)
            .map_err(|_| IntegrationError::InvalidEnvelope("digest mismatch".into()))?;

        let bytes = STANDARD
            .decode(&envelope.data)
            .map_err(|e| IntegrationError::InvalidEnvelope(e.to_string()))?;

        let plaintext = if envelope.encrypted {
            if bytes.len() < NONCE_LEN {
                return Err(IntegrationError::InvalidEnvelope("ciphertext too short".into()));
            }
            let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
            let cipher = Aes256Gcm::new(&derive_key(context.secret(), CIPHER_KEY_LABEL)?);
            cipher
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|e| IntegrationError::InvalidEnvelope(format!("decryption failed: {e}")))?
        } else {
            bytes
        };
        Ok(serde_json::from_slice(&plaintext)?)
    }

    fn valid_context(&self, org_id: &OrgId) -> Result<SecurityContext> {
        let context = self
            .security
            .get(org_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| IntegrationError::SecurityNotConfigured(org_id.clone()))?;
        if !context.is_valid() {
            return Err(IntegrationError::SecurityInvalid(format!(
                "level {:?} is missing its credential",
                context.level
            )));
        }
        Ok(context)
    }

    fn band(&self, elapsed: Duration) -> ServiceState {
        let millis = elapsed.as_millis() as u64;
        if millis < self.config.healthy_threshold_ms {
            ServiceState::Healthy
        } else if millis < self.config.degraded_threshold_ms {
            ServiceState::Degraded
        } else {
            ServiceState::Unhealthy
        }
    }
}

/// A 256-bit key for one purpose, HMAC-SHA256 of the label under the credential.
fn derive_key(secret: &str, label: &[u8]) -> Result<Key<Aes256Gcm>> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .map_err(|e| IntegrationError::SecurityInvalid(e.to_string()))?;
    mac.update(label);
    Ok(mac.finalize().into_bytes())
}

fn envelope_mac(secret: &str, level: SecurityLevel, data: &str) -> Result<HmacSha256> {
    let key = derive_key(secret, MAC_KEY_LABEL)?;
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_slice())
        .map_err(|e| IntegrationError::SecurityInvalid(e.to_string()))?;
    mac.update(format!("{level:?}").as_bytes());
    mac.update(b".");
    mac.update(data.as_bytes());
    Ok(mac)
}
