//! Call linker: turns (symbol, descriptor, plan) triples into cached
//! [`Invoker`]s.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crate::abi::{self, CallingConvention, ClassifyMode, Plan};
use crate::config::{LinkerConfig, linker_config_snapshot};
use crate::descriptor::{Fingerprint, FunctionDescriptor};
use crate::error::Result;
use crate::invoke::Invoker;
use crate::invoke::trampoline::HOST_TRAMPOLINE;
use crate::lookup::{NativeSymbol, SymbolNotFoundError};
use crate::target::Target;
use crate::value::Address;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PlanKey {
    descriptor: FunctionDescriptor,
    target: Target,
    mode: ClassifyMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InvokerKey {
    address: Address,
    descriptor: FunctionDescriptor,
    plan: Arc<Plan>,
}

/// Hit and miss counters of a linker's caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub plan_hits: u64,
    pub plan_misses: u64,
    pub invoker_hits: u64,
    pub invoker_misses: u64,
    pub invokers: usize,
    pub plans: usize,
}

/// Builds and caches invokers.
///
/// Linking the same address, descriptor and plan again returns the same
/// `Arc<Invoker>`. The plan and invoker caches are each flushed wholesale
/// once they reach [`LinkerConfig::invoker_cache_capacity`].
pub struct Linker {
    config: LinkerConfig,
    plans: Mutex<HashMap<PlanKey, Arc<Plan>>>,
    invokers: Mutex<HashMap<InvokerKey, Arc<Invoker>>>,
    plan_hits: AtomicU64,
    plan_misses: AtomicU64,
    invoker_hits: AtomicU64,
    invoker_misses: AtomicU64,
}

impl Linker {
    #[must_use]
    pub fn new(config: LinkerConfig) -> Self {
        Self {
            config,
            plans: Mutex::new(HashMap::new()),
            invokers: Mutex::new(HashMap::new()),
            plan_hits: AtomicU64::new(0),
            plan_misses: AtomicU64::new(0),
            invoker_hits: AtomicU64::new(0),
            invoker_misses: AtomicU64::new(0),
        }
    }

    /// Process-wide linker built from the configuration installed at first
    /// use.
    pub fn system() -> &'static Linker {
        static SYSTEM: OnceLock<Linker> = OnceLock::new();
        SYSTEM.get_or_init(|| Linker::new(linker_config_snapshot()))
    }

    #[must_use]
    pub fn config(&self) -> &LinkerConfig {
        &self.config
    }

    /// Classify `descriptor` for the host, reusing an earlier plan when
    /// one exists.
    ///
    /// # Errors
    ///
    /// Classification errors, including [`UnsupportedLayoutError`] on hosts
    /// without a supported convention.
    ///
    /// [`UnsupportedLayoutError`]: crate::UnsupportedLayoutError
    pub fn plan(&self, descriptor: &FunctionDescriptor, mode: &ClassifyMode) -> Result<Arc<Plan>> {
        self.plan_for(descriptor, &Target::host(), mode)
    }

    /// Classify `descriptor` for an explicit target, cached.
    ///
    /// # Errors
    ///
    /// As [`Linker::plan`].
    pub fn plan_for(
        &self,
        descriptor: &FunctionDescriptor,
        target: &Target,
        mode: &ClassifyMode,
    ) -> Result<Arc<Plan>> {
        let key = PlanKey {
            descriptor: descriptor.clone(),
            target: target.clone(),
            mode: mode.clone(),
        };
        if let Some(plan) = lock(&self.plans).get(&key) {
            self.plan_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(plan));
        }
        self.plan_misses.fetch_add(1, Ordering::Relaxed);
        let plan = Arc::new(abi::classify_with(descriptor, target, mode)?);
        let mut plans = lock(&self.plans);
        if plans.len() >= self.config.invoker_cache_capacity {
            tracing::debug!(target: "downcall.link", flushed = plans.len(), "plan cache full");
            plans.clear();
        }
        let plan = plans.entry(key).or_insert(plan);
        Ok(Arc::clone(plan))
    }

    /// Bind `symbol` to `descriptor` under `plan`.
    ///
    /// # Errors
    ///
    /// [`SymbolNotFoundError`] for a null address and [`LinkError`] when the
    /// plan does not belong to the descriptor or cannot run on this host.
    pub fn link(
        &self,
        symbol: &NativeSymbol,
        descriptor: &FunctionDescriptor,
        plan: &Arc<Plan>,
    ) -> Result<Arc<Invoker>> {
        if symbol.address().is_null() {
            return Err(SymbolNotFoundError {
                name: symbol.name().to_string(),
                library: None,
            }
            .into());
        }
        let key = InvokerKey {
            address: symbol.address(),
            descriptor: descriptor.clone(),
            plan: Arc::clone(plan),
        };
        if let Some(invoker) = lock(&self.invokers).get(&key) {
            self.invoker_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(invoker));
        }

        let trampoline = self.check_compatible(descriptor, plan)?;
        let packed_stack = CallingConvention::for_target(plan.target())?.packed_stack_scalars;
        self.invoker_misses.fetch_add(1, Ordering::Relaxed);
        let invoker = Arc::new(Invoker::new(
            symbol.clone(),
            descriptor.clone(),
            Arc::clone(plan),
            trampoline,
            packed_stack,
            self.config.trace_calls,
        ));
        tracing::debug!(
            target: "downcall.link",
            symbol = %symbol,
            descriptor = %descriptor,
            stack_size = plan.stack_size(),
            "invoker linked"
        );

        let mut invokers = lock(&self.invokers);
        if invokers.len() >= self.config.invoker_cache_capacity {
            tracing::debug!(target: "downcall.link", flushed = invokers.len(), "invoker cache full");
            invokers.clear();
        }
        let invoker = invokers.entry(key).or_insert(invoker);
        Ok(Arc::clone(invoker))
    }

    /// Classify for the host in register mode and link.
    ///
    /// # Errors
    ///
    /// As [`Linker::plan`] and [`Linker::link`].
    pub fn downcall(&self, symbol: &NativeSymbol, descriptor: &FunctionDescriptor) -> Result<Arc<Invoker>> {
        let plan = self.plan(descriptor, &ClassifyMode::Registers)?;
        self.link(symbol, descriptor, &plan)
    }

    /// Classify for the host in forced-stack mode and link, so every
    /// parameter travels on the stack.
    ///
    /// `symbol` must accept the [`crate::StackPrefix::standard`] parameters (eight
    /// `int64_t` then eight `double`) before those of `descriptor`; they
    /// are passed as zeros.
    ///
    /// # Errors
    ///
    /// As [`Linker::downcall`].
    pub fn downcall_stack(
        &self,
        symbol: &NativeSymbol,
        descriptor: &FunctionDescriptor,
    ) -> Result<Arc<Invoker>> {
        let plan = self.plan(descriptor, &ClassifyMode::forced_stack())?;
        self.link(symbol, descriptor, &plan)
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            plan_hits: self.plan_hits.load(Ordering::Relaxed),
            plan_misses: self.plan_misses.load(Ordering::Relaxed),
            invoker_hits: self.invoker_hits.load(Ordering::Relaxed),
            invoker_misses: self.invoker_misses.load(Ordering::Relaxed),
            invokers: lock(&self.invokers).len(),
            plans: lock(&self.plans).len(),
        }
    }

    /// Drop every cached plan and invoker. Outstanding `Arc`s stay valid.
    pub fn clear(&self) {
        lock(&self.plans).clear();
        lock(&self.invokers).clear();
    }

    fn check_compatible(
        &self,
        descriptor: &FunctionDescriptor,
        plan: &Plan,
    ) -> Result<crate::invoke::trampoline::Trampoline> {
        let expected = descriptor.params().len() + plan.prefix_len();
        if plan.all_slots().len() != expected {
            return Err(LinkError::SlotCount {
                expected,
                found: plan.all_slots().len(),
            }
            .into());
        }
        let fingerprint = descriptor.fingerprint();
        if plan.fingerprint() != fingerprint {
            return Err(LinkError::FingerprintMismatch {
                descriptor: fingerprint,
                plan: plan.fingerprint(),
            }
            .into());
        }
        if !plan.target().is_host() {
            return Err(LinkError::ForeignTarget {
                triple: plan.target().triple().to_string(),
            }
            .into());
        }
        let trampoline = HOST_TRAMPOLINE.ok_or_else(|| LinkError::NoTrampoline {
            arch: std::env::consts::ARCH,
        })?;
        if plan.stack_size() > self.config.max_stack_bytes {
            return Err(LinkError::StackTooLarge {
                size: plan.stack_size(),
                limit: self.config.max_stack_bytes,
            }
            .into());
        }
        Ok(trampoline)
    }
}

impl Default for Linker {
    fn default() -> Self {
        Self::new(LinkerConfig::default())
    }
}

impl fmt::Debug for Linker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Linker")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}

/// A descriptor and plan cannot be bound together on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    SlotCount { expected: usize, found: usize },
    FingerprintMismatch { descriptor: Fingerprint, plan: Fingerprint },
    ForeignTarget { triple: String },
    NoTrampoline { arch: &'static str },
    StackTooLarge { size: usize, limit: usize },
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::SlotCount { expected, found } => write!(
                f,
                "plan has {found} argument slot(s) but the descriptor needs {expected}"
            ),
            LinkError::FingerprintMismatch { descriptor, plan } => write!(
                f,
                "plan was classified for descriptor {plan}, not {descriptor}"
            ),
            LinkError::ForeignTarget { triple } => {
                write!(f, "plan targets {triple}, which is not the host")
            }
            LinkError::NoTrampoline { arch } => {
                write!(f, "no call trampoline for host architecture {arch}")
            }
            LinkError::StackTooLarge { size, limit } => write!(
                f,
                "plan needs {size} bytes of stack arguments; the limit is {limit}"
            ),
        }
    }
}

impl std::error::Error for LinkError {}
