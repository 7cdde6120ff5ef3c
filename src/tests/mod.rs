//! Integration-level tests exercising the scenarios and invariants from
//! spec §8, the way the teacher groups cross-module tests under a `tests`
//! submodule tree rather than a single flat file.

mod scenarios;

use std::sync::Once;

use bytes::Bytes;
use temp_dir::TempDir;

use crate::{
    config::{JournalConfig, SyncPolicy},
    journal::Journal,
};

static TRACING: Once = Once::new();

fn install_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Opens a journal in a fresh temp directory with a sync policy that makes
/// tests deterministic without waiting on coalescing timers.
pub(crate) async fn open_journal(dir: &TempDir, queue_name: &str) -> Journal {
    install_tracing();
    let config = JournalConfig::builder(dir.path(), queue_name)
        .sync_journal(SyncPolicy::Immediate)
        .build();
    Journal::open(config).await.expect("journal should open")
}

pub(crate) fn payload(n: u64) -> Bytes {
    Bytes::from(format!("payload-{n}"))
}
