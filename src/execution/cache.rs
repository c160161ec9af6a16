//! Process-wide cache of compiled execution plans.
//!
//! Plans are keyed by the value-independent fingerprint of the query plus
//! everything else that changes the emitted command: dialect, options and
//! plan mode. Concurrent requests for a missing key compile it once; the
//! other callers wait for that result. Compilation failures are returned to
//! every waiter and never stored.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use moka::sync::Cache;
use tracing::{debug, info};

use crate::config::CacheOptions;
use crate::error::TranslationError;
use crate::expr::Fingerprint;

use super::plan::{ExecutionPlan, PlanMode};
use super::signature::SignatureDescriptor;

/// Options that change the compiled plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OptionsKey {
    pub quote_identifiers: bool,
    pub no_tracking: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlanKey {
    pub prefix: Arc<str>,
    pub dialect: Arc<str>,
    pub options: OptionsKey,
    pub mode: PlanMode,
    pub fingerprint: Fingerprint,
}

/// A compiled plan together with its classified invocation signature.
#[derive(Debug, Clone)]
pub struct CachedPlan {
    pub plan: ExecutionPlan,
    pub descriptor: SignatureDescriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Successful and failed compilations.
    pub compiles: u64,
    pub entries: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub struct PlanCache {
    /// `None` when caching is disabled.
    plans: Option<Cache<PlanKey, Arc<CachedPlan>>>,
    prefix: Arc<str>,
    hits: AtomicU64,
    misses: AtomicU64,
    compiles: AtomicU64,
}

impl PlanCache {
    pub fn new(options: &CacheOptions) -> Self {
        let plans = options.enabled.then(|| {
            let mut builder = Cache::builder().max_capacity(options.max_entries);
            if let Some(ttl) = options.ttl() {
                builder = builder.time_to_live(ttl);
            }
            builder.build()
        });
        info!(
            enabled = options.enabled,
            max_entries = options.max_entries,
            ttl_seconds = ?options.ttl_seconds,
            "plan cache initialized"
        );
        Self {
            plans,
            prefix: Arc::from(options.key_prefix.as_str()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            compiles: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.plans.is_some()
    }

    pub fn prefix(&self) -> &Arc<str> {
        &self.prefix
    }

    /// Look up `key`, compiling and storing the plan on a miss. The flag is
    /// `true` when this call produced the plan.
    pub fn get_or_compile<F>(
        &self,
        key: PlanKey,
        compile: F,
    ) -> Result<(Arc<CachedPlan>, bool), TranslationError>
    where
        F: FnOnce() -> Result<CachedPlan, TranslationError>,
    {
        let Some(plans) = &self.plans else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            self.compiles.fetch_add(1, Ordering::Relaxed);
            return compile().map(|plan| (Arc::new(plan), true));
        };

        let entry = plans
            .entry(key)
            .or_try_insert_with(|| {
                self.compiles.fetch_add(1, Ordering::Relaxed);
                compile().map(Arc::new)
            })
            .map_err(|e| (*e).clone())?;

        let fresh = entry.is_fresh();
        if fresh {
            self.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok((entry.into_value(), fresh))
    }

    pub fn stats(&self) -> CacheStats {
        let entries = match &self.plans {
            Some(plans) => {
                plans.run_pending_tasks();
                plans.entry_count()
            }
            None => 0,
        };
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            compiles: self.compiles.load(Ordering::Relaxed),
            entries,
        }
    }

    /// Drop every cached plan. Counters are kept.
    pub fn clear(&self) {
        if let Some(plans) = &self.plans {
            plans.invalidate_all();
            plans.run_pending_tasks();
            debug!("plan cache cleared");
        }
    }
}
