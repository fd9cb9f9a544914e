//! Capability lookup for shell bridges.
//!
//! A holder of a [`ShellBridge`] can ask for an alternate view of it (most
//! commonly the terminal transport it runs on) without the bridge declaring
//! every possible view up front. Third parties contribute providers to a
//! [`CapabilityRegistry`]; they are consulted before the bridge's built-in
//! answer, so they can intercept or override it.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::bridge::{ShellBridge, ShellService};
use crate::error::{Result, ShellError};
use crate::transport::TerminalTransport;

/// The interface a caller wants to view a bridge through.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    /// The raw terminal transport under the bridge.
    TerminalTransport,
    /// A shell service view.
    ShellService,
    /// Any service at all. The transport qualifies.
    Service,
    /// Anything else, keyed by an identifier agreed between provider and caller.
    Custom(String),
}

impl CapabilityKind {
    pub fn custom(id: impl Into<String>) -> Self {
        Self::Custom(id.into())
    }

    /// Whether the bridge's own transport is an acceptable answer.
    pub fn accepts_transport(&self) -> bool {
        matches!(self, Self::TerminalTransport | Self::Service)
    }

    /// Whether `capability` is a valid answer for this kind.
    pub fn admits(&self, capability: &Capability) -> bool {
        match (self, capability) {
            (Self::TerminalTransport, Capability::TerminalTransport(_)) => true,
            (Self::ShellService, Capability::ShellService(_)) => true,
            (Self::Service, Capability::TerminalTransport(_) | Capability::ShellService(_)) => true,
            (Self::Custom(_), Capability::Custom(_)) => true,
            _ => false,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::Custom(id) if id.trim().is_empty() => Err(ShellError::InvalidCapability(
                "custom capability identifier is empty".into(),
            )),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TerminalTransport => write!(f, "terminal-transport"),
            Self::ShellService => write!(f, "shell-service"),
            Self::Service => write!(f, "service"),
            Self::Custom(id) => write!(f, "custom:{id}"),
        }
    }
}

/// A resolved view of a bridge.
#[derive(Clone)]
pub enum Capability {
    TerminalTransport(Arc<dyn TerminalTransport>),
    ShellService(Arc<dyn ShellService>),
    Custom(Arc<dyn Any + Send + Sync>),
}

impl Capability {
    pub fn into_transport(self) -> Option<Arc<dyn TerminalTransport>> {
        match self {
            Self::TerminalTransport(t) => Some(t),
            _ => None,
        }
    }

    pub fn into_shell_service(self) -> Option<Arc<dyn ShellService>> {
        match self {
            Self::ShellService(s) => Some(s),
            _ => None,
        }
    }

    pub fn downcast_custom<T: Any + Send + Sync>(self) -> Option<Arc<T>> {
        match self {
            Self::Custom(value) => value.downcast::<T>().ok(),
            _ => None,
        }
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TerminalTransport(t) => f.debug_tuple("TerminalTransport").field(&t.name()).finish(),
            Self::ShellService(s) => f.debug_tuple("ShellService").field(&s.name()).finish(),
            Self::Custom(_) => f.debug_tuple("Custom").finish(),
        }
    }
}

/// Something that can answer capability requests for bridges.
///
/// Returning `None` passes the request on to the next provider.
pub trait CapabilityProvider: Send + Sync {
    fn provide(&self, bridge: &ShellBridge, kind: &CapabilityKind) -> Option<Capability>;
}

impl<F> CapabilityProvider for F
where
    F: Fn(&ShellBridge, &CapabilityKind) -> Option<Capability> + Send + Sync,
{
    fn provide(&self, bridge: &ShellBridge, kind: &CapabilityKind) -> Option<Capability> {
        self(bridge, kind)
    }
}

/// Which bridges a provider answers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderScope {
    AllBridges,
    Bridge(Uuid),
}

impl ProviderScope {
    fn covers(&self, bridge: &ShellBridge) -> bool {
        match self {
            Self::AllBridges => true,
            Self::Bridge(id) => *id == bridge.id(),
        }
    }
}

/// Handle returned by [`CapabilityRegistry::register`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProviderId(u64);

struct Registration {
    id: ProviderId,
    scope: ProviderScope,
    provider: Arc<dyn CapabilityProvider>,
}

static GLOBAL: Lazy<CapabilityRegistry> = Lazy::new(CapabilityRegistry::new);

/// Table of contributed capability providers, keyed by kind.
pub struct CapabilityRegistry {
    providers: RwLock<HashMap<CapabilityKind, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// The process-wide registry. Created empty on first use; providers are
    /// added explicitly during startup.
    pub fn global() -> &'static CapabilityRegistry {
        &GLOBAL
    }

    /// Add a provider for `kind`.
    pub fn register(
        &self,
        kind: CapabilityKind,
        scope: ProviderScope,
        provider: Arc<dyn CapabilityProvider>,
    ) -> Result<ProviderId> {
        kind.validate()?;
        let id = ProviderId(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(kind = %kind, ?scope, "Registered capability provider");
        self.providers
            .write()
            .entry(kind)
            .or_default()
            .push(Registration { id, scope, provider });
        Ok(id)
    }

    /// Remove a provider. Returns false if it was not registered.
    pub fn unregister(&self, id: ProviderId) -> bool {
        let mut providers = self.providers.write();
        let mut removed = false;
        for registrations in providers.values_mut() {
            let before = registrations.len();
            registrations.retain(|r| r.id != id);
            removed |= registrations.len() != before;
        }
        providers.retain(|_, registrations| !registrations.is_empty());
        removed
    }

    /// Number of registered providers across all kinds.
    pub fn len(&self) -> usize {
        self.providers.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve `kind` for `bridge`.
    ///
    /// Contributed providers are asked first: those registered for this very
    /// bridge, then those registered for all bridges, each in registration
    /// order. Answers of the wrong shape for `kind` are skipped. If none
    /// answers and the bridge's transport satisfies `kind`, the transport is
    /// returned. `Ok(None)` means nobody offers that view.
    pub fn query(&self, bridge: &ShellBridge, kind: &CapabilityKind) -> Result<Option<Capability>> {
        kind.validate()?;

        for provider in self.candidates(bridge, kind) {
            let Some(capability) = provider.provide(bridge, kind) else {
                continue;
            };
            if !kind.admits(&capability) {
                tracing::warn!(
                    kind = %kind,
                    answer = ?capability,
                    "Ignoring capability provider answer of the wrong kind"
                );
                continue;
            }
            tracing::debug!(kind = %kind, bridge = %bridge.id(), "Capability from contributed provider");
            return Ok(Some(capability));
        }

        if kind.accepts_transport() {
            return Ok(Some(Capability::TerminalTransport(bridge.transport())));
        }
        Ok(None)
    }

    /// Providers applicable to `bridge`, in lookup order. Collected up front
    /// so providers run without the lock held.
    fn candidates(&self, bridge: &ShellBridge, kind: &CapabilityKind) -> Vec<Arc<dyn CapabilityProvider>> {
        let providers = self.providers.read();
        let Some(registrations) = providers.get(kind) else {
            return Vec::new();
        };
        let instance = registrations
            .iter()
            .filter(|r| matches!(r.scope, ProviderScope::Bridge(_)) && r.scope.covers(bridge));
        let shared = registrations
            .iter()
            .filter(|r| r.scope == ProviderScope::AllBridges);
        instance
            .chain(shared)
            .map(|r| Arc::clone(&r.provider))
            .collect()
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
