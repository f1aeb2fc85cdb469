// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::metadata::LevelFilter;
use v2p_defs::NtStatus;

/// Sends tracing output to the test harness.
pub fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(LevelFilter::DEBUG.into())
            .from_env_lossy();
        let _ = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

#[derive(Default)]
struct Completed {
    result: Option<(NtStatus, u64)>,
    count: usize,
}

/// The observed completions of one request.
#[derive(Clone, Default)]
pub struct CompletionResult(Arc<Mutex<Completed>>);

impl CompletionResult {
    pub fn take(&self) -> Option<(NtStatus, u64)> {
        self.0.lock().result.take()
    }

    pub fn count(&self) -> usize {
        self.0.lock().count
    }
}

/// Returns a completion handle and a way to observe what it was given.
pub fn completion() -> (CompletionResult, impl FnOnce(NtStatus, u64) + Send + 'static) {
    init_tracing();
    let result = CompletionResult::default();
    let inner = result.0.clone();
    (result, move |status, information| {
        let mut inner = inner.lock();
        inner.result = Some((status, information));
        inner.count += 1;
    })
}
