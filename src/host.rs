//! Host call-notification capability
//!
//! The engine never hooks a runtime directly. It talks to an
//! [`InvocationHost`], which delivers a synchronous "callable unit is about
//! to execute" notification to a registered [`InvocationObserver`]. The
//! observer answers with a [`Verdict`]; `Verdict::Disable` asks the host to
//! stop notifying for that call site.
//!
//! # ProbeHost
//!
//! Rust has no interpreter-level call hook, so the in-process host is driven
//! by explicit probe points. An instrumented function starts with
//! [`probe!`](crate::probe):
//!
//! ```
//! fn attention_forward() {
//!     speed_bump::probe!("LlamaAttention.forward");
//!     // ... real work ...
//! }
//! # attention_forward();
//! ```
//!
//! Each `probe!` expands to a `static` [`ProbeSite`]; the site's address is
//! its [`CallSiteId`] and its module is `module_path!()` with `::` rewritten
//! to `.` (so `my_app::model` matches the glob `my_app.*`). With no observer
//! registered a probe costs one atomic load.
//!
//! ```text
//! probe!() ──▶ ProbeHost::fire(&SITE)
//!                │ active?               (AtomicBool)
//!                │ SITE disabled this epoch?  (AtomicU64)
//!                ▼
//!              observer.on_call_start(&CallSite)  (ShardedLock read)
//!                │
//!                └─ Verdict::Disable ──▶ SITE.disabled_epoch = epoch
//! ```
//!
//! Every registration starts a new epoch, so sites disabled under a previous
//! observer are monitored again after reinstall.

use crossbeam::sync::ShardedLock;
use fnv::{FnvHashSet, FnvHasher};
use std::hash::Hasher;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, PoisonError};
use thiserror::Error;

/// Process-wide epoch source; unique across every host instance
static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);

static GLOBAL_HOST: OnceLock<ProbeHost> = OnceLock::new();

/// Stable, opaque identity of one defined callable unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallSiteId(u64);

impl CallSiteId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Identity from the address of a process-lifetime object
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize as u64)
    }

    /// Identity derived from textual content (FNV-1a)
    ///
    /// For hosts without a long-lived per-definition object. Textually
    /// identical definitions at the same location share an identity.
    pub fn from_content(module: &str, qualified_name: &str, file: &str, line: u32) -> Self {
        let mut hasher = FnvHasher::default();
        for part in [module, qualified_name, file] {
            hasher.write(part.as_bytes());
            hasher.write_u8(0xff);
        }
        hasher.write_u32(line);
        Self(hasher.finish())
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

/// One call-start notification
#[derive(Debug, Clone, Copy)]
pub struct CallSite<'a> {
    pub id: CallSiteId,
    /// Defining module, dot-separated
    pub module: &'a str,
    /// Fully qualified name (e.g. `LlamaAttention.forward`)
    pub qualified_name: &'a str,
}

impl<'a> CallSite<'a> {
    pub fn new(id: CallSiteId, module: &'a str, qualified_name: &'a str) -> Self {
        Self {
            id,
            module,
            qualified_name,
        }
    }
}

/// Observer answer to a call-start notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep notifying for this site
    Continue,
    /// Never notify for this site again (until the next registration)
    Disable,
}

/// Receiver of call-start notifications
///
/// Invoked synchronously on the calling thread, before the call proceeds.
/// Implementations must not panic or block indefinitely.
pub trait InvocationObserver: Send + Sync {
    fn on_call_start(&self, site: &CallSite<'_>) -> Verdict;
}

/// Registration capability of a host runtime
pub trait InvocationHost: Send + Sync {
    /// Claim the host's notification slot for `observer`
    fn register(&self, observer: Arc<dyn InvocationObserver>) -> Result<(), HostError>;

    /// Release the slot; a no-op when nothing is registered
    fn unregister(&self);
}

impl<T: InvocationHost + ?Sized> InvocationHost for &T {
    fn register(&self, observer: Arc<dyn InvocationObserver>) -> Result<(), HostError> {
        (**self).register(observer)
    }

    fn unregister(&self) {
        (**self).unregister()
    }
}

impl<T: InvocationHost + ?Sized> InvocationHost for Arc<T> {
    fn register(&self, observer: Arc<dyn InvocationObserver>) -> Result<(), HostError> {
        (**self).register(observer)
    }

    fn unregister(&self) {
        (**self).unregister()
    }
}

/// Errors raised by a host's registration primitive
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("notification slot of host '{host}' is already claimed")]
    SlotClaimed { host: &'static str },
}

/// A static probe point created by [`probe!`](crate::probe)
#[derive(Debug)]
pub struct ProbeSite {
    module_path: &'static str,
    qualified_name: &'static str,
    file: &'static str,
    line: u32,
    module: OnceLock<String>,
    disabled_epoch: AtomicU64,
}

impl ProbeSite {
    pub const fn new(
        module_path: &'static str,
        qualified_name: &'static str,
        file: &'static str,
        line: u32,
    ) -> Self {
        Self {
            module_path,
            qualified_name,
            file,
            line,
            module: OnceLock::new(),
            disabled_epoch: AtomicU64::new(0),
        }
    }

    /// Address-derived identity (stable because probe sites are statics)
    pub fn id(&self) -> CallSiteId {
        CallSiteId::from_ptr(self as *const ProbeSite)
    }

    /// Module path in dotted form (`a::b` → `a.b`)
    pub fn module(&self) -> &str {
        self.module
            .get_or_init(|| self.module_path.replace("::", "."))
    }

    pub fn qualified_name(&self) -> &'static str {
        self.qualified_name
    }

    pub fn location(&self) -> (&'static str, u32) {
        (self.file, self.line)
    }

    fn is_disabled_in(&self, epoch: u64) -> bool {
        self.disabled_epoch.load(Ordering::Relaxed) == epoch
    }
}

/// In-process host driven by explicit probe points
///
/// A static [`ProbeSite`] remembers its disabled state for one epoch at a
/// time, so sites are meant to be fired into a single host (normally
/// [`ProbeHost::global`]).
pub struct ProbeHost {
    name: &'static str,
    active: AtomicBool,
    epoch: AtomicU64,
    slot: ShardedLock<Option<Arc<dyn InvocationObserver>>>,
    /// Disabled identities reported through [`ProbeHost::fire_site`]
    disabled: ShardedLock<FnvHashSet<CallSiteId>>,
}

impl std::fmt::Debug for ProbeHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeHost")
            .field("name", &self.name)
            .field("registered", &self.is_registered())
            .field("epoch", &self.epoch.load(Ordering::Relaxed))
            .finish()
    }
}

impl ProbeHost {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            active: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            slot: ShardedLock::new(None),
            disabled: ShardedLock::new(FnvHashSet::default()),
        }
    }

    /// The process-wide host that `probe!("name")` fires into
    pub fn global() -> &'static ProbeHost {
        GLOBAL_HOST.get_or_init(|| ProbeHost::new("speed_bump"))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether an observer currently holds the slot
    pub fn is_registered(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Deliver a call-start notification for a static probe site
    #[inline]
    pub fn fire(&self, site: &ProbeSite) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        let epoch = self.epoch.load(Ordering::Acquire);
        if site.is_disabled_in(epoch) {
            return;
        }

        let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        let Some(observer) = slot.as_ref() else {
            return;
        };

        let call = CallSite::new(site.id(), site.module(), site.qualified_name);
        if observer.on_call_start(&call) == Verdict::Disable {
            site.disabled_epoch.store(epoch, Ordering::Relaxed);
        }
    }

    /// Deliver a call-start notification for a dynamically described site
    ///
    /// Returns the observer's verdict, or `Verdict::Continue` if nothing is
    /// registered. Disabled identities are skipped until the next registration.
    pub fn fire_site(&self, site: &CallSite<'_>) -> Verdict {
        if !self.active.load(Ordering::Acquire) {
            return Verdict::Continue;
        }
        if self
            .disabled
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&site.id)
        {
            return Verdict::Disable;
        }

        let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        let Some(observer) = slot.as_ref() else {
            return Verdict::Continue;
        };

        let verdict = observer.on_call_start(site);
        if verdict == Verdict::Disable {
            // Still under the slot guard: a re-registration cannot clear the
            // set between the verdict and this insert. Lock order is slot then
            // disabled, same as `register`.
            self.disabled
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(site.id);
        }
        verdict
    }
}

impl Default for ProbeHost {
    fn default() -> Self {
        Self::new("speed_bump")
    }
}

impl InvocationHost for ProbeHost {
    fn register(&self, observer: Arc<dyn InvocationObserver>) -> Result<(), HostError> {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(HostError::SlotClaimed { host: self.name });
        }

        self.disabled
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.epoch
            .store(NEXT_EPOCH.fetch_add(1, Ordering::Relaxed), Ordering::Release);
        *slot = Some(observer);
        self.active.store(true, Ordering::Release);
        Ok(())
    }

    fn unregister(&self) {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        self.active.store(false, Ordering::Release);
        *slot = None;
    }
}

/// Insert a call-start probe for the enclosing function
///
/// `probe!("Type.method")` fires into [`ProbeHost::global`];
/// `probe!(host, "Type.method")` fires into an explicit host.
#[macro_export]
macro_rules! probe {
    ($host:expr, $name:expr) => {{
        static __SPEED_BUMP_SITE: $crate::host::ProbeSite =
            $crate::host::ProbeSite::new(module_path!(), $name, file!(), line!());
        $host.fire(&__SPEED_BUMP_SITE)
    }};
    ($name:expr) => {
        $crate::probe!($crate::host::ProbeHost::global(), $name)
    };
}
