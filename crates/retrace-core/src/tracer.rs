//! Per-module tracing toggle.
//!
//! While a module is traced, instrumented processes running it record a
//! `call`/`cast`/`info` event for every message they handle. Untraced
//! modules record only state changes, or nothing if the process opted out.
//! Starting an already-traced module or stopping an untraced one is a
//! no-op.

use std::collections::BTreeSet;
use std::sync::{PoisonError, RwLock};

use retrace_types::ModuleName;

/// The set of traced modules. Safe to share via `Arc<TracerController>`.
#[derive(Debug, Default)]
pub struct TracerController {
    traced: RwLock<BTreeSet<ModuleName>>,
}

impl TracerController {
    /// Create a controller with no traced modules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a controller tracing `modules` from the start.
    pub fn with_modules<I, M>(modules: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<ModuleName>,
    {
        Self {
            traced: RwLock::new(modules.into_iter().map(Into::into).collect()),
        }
    }

    /// Start tracing `module`. Returns `false` if it was already traced.
    pub fn start_trace(&self, module: &ModuleName) -> bool {
        let inserted = self
            .traced
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(module.clone());
        if inserted {
            tracing::info!(module = %module, "Tracing started");
        }
        inserted
    }

    /// Stop tracing `module`. Returns `false` if it was not traced.
    pub fn stop_trace(&self, module: &ModuleName) -> bool {
        let removed = self
            .traced
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(module);
        if removed {
            tracing::info!(module = %module, "Tracing stopped");
        }
        removed
    }

    /// Whether `module` is currently traced.
    pub fn is_traced(&self, module: &ModuleName) -> bool {
        self.traced
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(module)
    }

    /// All traced modules in name order.
    pub fn traced_modules(&self) -> Vec<ModuleName> {
        self.traced
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}
