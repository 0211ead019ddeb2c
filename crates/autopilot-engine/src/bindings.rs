//! Exchange and decision-client binding per instance.

use async_trait::async_trait;
use autopilot_core::{DecisionClient, ExchangeClient, PaperExchange, QueuedDecisionClient, Result};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Identifies the credentials an exchange client was built from.
///
/// Two descriptors are equivalent when both provider and key match, in which
/// case an existing binding is kept.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientDescriptor {
    pub provider: String,
    pub key_fingerprint: String,
}

impl ClientDescriptor {
    /// Build a descriptor without retaining the raw key.
    pub fn new(provider: impl Into<String>, api_key: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(api_key.as_bytes());
        Self {
            provider: provider.into(),
            key_fingerprint: hex::encode(hasher.finalize()),
        }
    }
}

/// Resolves per-user credentials and builds clients from them.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Descriptor for the user's stored exchange credentials, if any.
    async fn descriptor(&self, user_id: &str) -> Result<Option<ClientDescriptor>>;

    async fn build_exchange(
        &self,
        user_id: &str,
        descriptor: &ClientDescriptor,
    ) -> Result<Arc<dyn ExchangeClient>>;

    async fn build_decision_client(&self, user_id: &str) -> Result<Arc<dyn DecisionClient>>;
}

/// What a binding pass did to one client slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindAction {
    Unchanged,
    Bound,
    Unbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingOutcome {
    pub exchange: BindAction,
    pub decision: BindAction,
}

/// Clients currently bound to an instance.
#[derive(Default)]
pub struct ClientBindings {
    pub exchange: Option<(ClientDescriptor, Arc<dyn ExchangeClient>)>,
    pub decision: Option<Arc<dyn DecisionClient>>,
}

impl ClientBindings {
    pub fn exchange(&self) -> Option<Arc<dyn ExchangeClient>> {
        self.exchange.as_ref().map(|(_, client)| client.clone())
    }

    pub fn descriptor(&self) -> Option<&ClientDescriptor> {
        self.exchange.as_ref().map(|(descriptor, _)| descriptor)
    }
}

/// Factory handing out paper clients, one set per user.
pub struct PaperClientFactory {
    balance: Decimal,
    descriptors: DashMap<String, ClientDescriptor>,
    exchanges: DashMap<String, Arc<PaperExchange>>,
    decisions: DashMap<String, Arc<QueuedDecisionClient>>,
    exchange_builds: AtomicUsize,
}

impl PaperClientFactory {
    pub fn new(balance: Decimal) -> Self {
        Self {
            balance,
            descriptors: DashMap::new(),
            exchanges: DashMap::new(),
            decisions: DashMap::new(),
            exchange_builds: AtomicUsize::new(0),
        }
    }

    /// Store paper credentials for a user.
    pub fn set_credentials(&self, user_id: &str, api_key: &str) {
        self.descriptors
            .insert(user_id.to_string(), ClientDescriptor::new("paper", api_key));
    }

    pub fn remove_credentials(&self, user_id: &str) {
        self.descriptors.remove(user_id);
    }

    /// The paper exchange backing a user, created on first use.
    pub fn exchange_for(&self, user_id: &str) -> Arc<PaperExchange> {
        self.exchanges
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(PaperExchange::new(self.balance)))
            .clone()
    }

    pub fn decision_client_for(&self, user_id: &str) -> Arc<QueuedDecisionClient> {
        self.decisions
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(QueuedDecisionClient::new()))
            .clone()
    }

    /// Number of exchange clients built so far.
    pub fn exchange_builds(&self) -> usize {
        self.exchange_builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientFactory for PaperClientFactory {
    async fn descriptor(&self, user_id: &str) -> Result<Option<ClientDescriptor>> {
        Ok(self.descriptors.get(user_id).map(|d| d.clone()))
    }

    async fn build_exchange(
        &self,
        user_id: &str,
        _descriptor: &ClientDescriptor,
    ) -> Result<Arc<dyn ExchangeClient>> {
        self.exchange_builds.fetch_add(1, Ordering::SeqCst);
        let exchange: Arc<dyn ExchangeClient> = self.exchange_for(user_id);
        Ok(exchange)
    }

    async fn build_decision_client(&self, user_id: &str) -> Result<Arc<dyn DecisionClient>> {
        let client: Arc<dyn DecisionClient> = self.decision_client_for(user_id);
        Ok(client)
    }
}
