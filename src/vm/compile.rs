//! Compile requests from the interpreter.
//!
//! Requests never block the requesting thread: they are queued, with at
//! most one pending request per (method, osr) pair. A compiler tier, if
//! one is installed, drains the queue and may publish a compiled entry.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use super::method::Method;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompileRequest {
    pub method: String,
    /// Bytecode index of the backward branch for OSR requests.
    pub osr_bci: Option<usize>,
    pub invocation_count: u32,
    pub backedge_count: u32,
    #[serde(skip)]
    method_ptr: usize,
}

impl CompileRequest {
    pub fn method(&self) -> &Method {
        // SAFETY: methods live as long as the VM that queued the request.
        unsafe { &*(self.method_ptr as *const Method) }
    }
}

/// A compiler that can turn a request into an entry address.
pub trait CompilerTier: Send + Sync {
    fn name(&self) -> &str;
    /// Compile the method; `None` means the request was declined.
    fn compile(&self, request: &CompileRequest) -> Option<usize>;
}

#[derive(Default)]
pub struct CompileBroker {
    queue: Mutex<VecDeque<CompileRequest>>,
    history: Mutex<Vec<CompileRequest>>,
    tier: Mutex<Option<Box<dyn CompilerTier>>>,
    requests: AtomicU64,
    duplicates: AtomicU64,
}

impl CompileBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tier(&self, tier: Box<dyn CompilerTier>) {
        log::info!("compiler tier '{}' installed", tier.name());
        *self.tier.lock() = Some(tier);
    }

    /// Queue a request unless the same one is already pending.
    /// Returns the compiled entry if one is available right away.
    pub fn request(&self, method: &Method, osr_bci: Option<usize>) -> Option<usize> {
        if osr_bci.is_none() {
            if let Some(entry) = method.compiled_entry() {
                return Some(entry);
            }
        }
        let ptr = method as *const Method as usize;
        let mut queue = self.queue.lock();
        if queue
            .iter()
            .any(|r| r.method_ptr == ptr && r.osr_bci == osr_bci)
        {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let request = CompileRequest {
            method: method.qualified_name(),
            osr_bci,
            invocation_count: method.invocation_count(),
            backedge_count: method.backedge_count(),
            method_ptr: ptr,
        };
        log::debug!(
            "compile request: {}{}",
            request.method,
            osr_bci.map(|b| format!(" (osr @{})", b)).unwrap_or_default()
        );
        self.history.lock().push(request.clone());
        queue.push_back(request);
        self.requests.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Hand pending requests to the compiler tier. Returns the number of
    /// methods that received a compiled entry.
    pub fn process_queue(&self) -> usize {
        let pending: Vec<CompileRequest> = self.queue.lock().drain(..).collect();
        let tier = self.tier.lock();
        let Some(tier) = tier.as_ref() else {
            return 0;
        };
        let mut compiled = 0;
        for request in &pending {
            if let Some(entry) = tier.compile(request) {
                if request.osr_bci.is_none() {
                    request.method().set_compiled_entry(entry);
                }
                compiled += 1;
            }
        }
        compiled
    }

    pub fn pending(&self) -> Vec<CompileRequest> {
        self.queue.lock().iter().cloned().collect()
    }

    /// Every request accepted so far, oldest first.
    pub fn history(&self) -> Vec<CompileRequest> {
        self.history.lock().clone()
    }

    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn duplicate_count(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }
}
