/*!
Adaptateur de plateforme scripté

Remplace vSphere / OLVM / Nomad dans les tests. Chaque appel est enregistré
et le comportement est piloté par le test:
- `with_connect_error`: toute connexion échoue avec l'erreur donnée
- `failing` / `failing_on`: `power` échoue pour une cible (et une action)
- `with_delay`: latence de chaque appel `power` (suivi du parallélisme max)
*/

use async_trait::async_trait;
use chaosmonkey_kernel::errors::{ConnectError, PowerError};
use chaosmonkey_kernel::models::{PlatformKind, PowerAction, RawTargetRecord};
use chaosmonkey_kernel::platforms::{DiscoveryFilter, PlatformAdapter};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerCall {
    pub target: String,
    pub action: PowerAction,
}

pub struct MockPlatform {
    kind: PlatformKind,
    connect_error: Mutex<Option<ConnectError>>,
    failing: Mutex<Vec<(String, Option<PowerAction>, PowerError)>>,
    inventory: Mutex<Vec<RawTargetRecord>>,
    delay: Duration,
    calls: Mutex<Vec<PowerCall>>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    discoveries: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockPlatform {
    pub fn new(kind: PlatformKind) -> Self {
        Self {
            kind,
            connect_error: Mutex::new(None),
            failing: Mutex::new(Vec::new()),
            inventory: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            discoveries: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_connect_error(self, error: ConnectError) -> Self {
        *self.connect_error.lock() = Some(error);
        self
    }

    pub fn failing(self, target: &str, error: PowerError) -> Self {
        self.failing.lock().push((target.to_string(), None, error));
        self
    }

    pub fn failing_on(self, target: &str, action: PowerAction, error: PowerError) -> Self {
        self.failing.lock().push((target.to_string(), Some(action), error));
        self
    }

    pub fn with_inventory(self, records: Vec<RawTargetRecord>) -> Self {
        *self.inventory.lock() = records;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Change l'inventaire en cours de test (ex: une VM change d'état)
    pub fn set_inventory(&self, records: Vec<RawTargetRecord>) {
        *self.inventory.lock() = records;
    }

    pub fn calls(&self) -> Vec<PowerCall> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, target: &str) -> Vec<PowerAction> {
        self.calls.lock().iter().filter(|c| c.target == target).map(|c| c.action).collect()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn discovery_count(&self) -> usize {
        self.discoveries.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlatformAdapter for MockPlatform {
    fn kind(&self) -> PlatformKind {
        self.kind
    }

    async fn connect(&self) -> Result<(), ConnectError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let scripted = self.connect_error.lock().clone();
        match scripted {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    async fn discover(&self, filter: &DiscoveryFilter) -> Result<Vec<RawTargetRecord>, ConnectError> {
        let scripted = self.connect_error.lock().clone();
        if let Some(error) = scripted {
            return Err(error);
        }
        self.discoveries.fetch_add(1, Ordering::SeqCst);
        Ok(self.inventory.lock().iter().filter(|r| filter.matches_name(&r.name)).cloned().collect())
    }

    async fn power(&self, target_id: &str, action: PowerAction, _timeout: Duration) -> Result<(), PowerError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.calls.lock().push(PowerCall { target: target_id.to_string(), action });
        tracing::debug!("[mock {}] {} {}", self.kind, action, target_id);
        let scripted = self
            .failing
            .lock()
            .iter()
            .find(|(target, only, _)| target == target_id && only.map_or(true, |a| a == action))
            .map(|(_, _, error)| error.clone());
        match scripted {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
