//! Batched, failure-tolerant KV operations.
//!
//! [`Storage`] owns the two caches the daemon keeps in the KV store: the
//! per-application authorization hashes and the usage report counters,
//! plus the snapshot-and-rename protocol that drains the counters for the
//! periodic flusher.
//!
//! The store has no transactions, so the flush protocol is built to strand
//! data under a recoverable name on every failure path instead of losing
//! it: a counter is removed only after its contents were read, a failed
//! rename leaves the counter where subsequent [`report`](Storage::report)
//! calls re-register it, and per-cycle suffixes keep one cycle's wreckage
//! from being overwritten by the next.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use flushd_kv::{KvBackend, KvResult};
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::auth::Authorization;
use crate::config::RetryConfig;
use crate::credentials::Credentials;
use crate::error::RenewAuthError;
use crate::keys::{
    self, SET_KEYS_CACHED_REPORTS, SuffixGenerator, flushing_set_key, key_to_flush,
    service_and_creds,
};

/// Hash fields and keys are written and read in groups of this size so a
/// single command never blocks the KV server on an unbounded payload.
pub const BATCH: usize = 500;

/// Accumulated usage of one application, keyed by metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    /// The service the application belongs to.
    pub service_id: String,
    /// The application's credentials.
    pub credentials: Credentials,
    /// Usage deltas per metric.
    pub usage: BTreeMap<String, i64>,
}

/// The daemon's KV operations.
pub struct Storage {
    kv: Arc<dyn KvBackend>,
    suffixes: SuffixGenerator,
    cleanup_retry: RetryConfig,
}

impl Storage {
    /// Storage over the given KV handle.
    #[must_use]
    pub fn new(kv: Arc<dyn KvBackend>, cleanup_retry: RetryConfig) -> Self {
        Self { kv, suffixes: SuffixGenerator::new(), cleanup_retry }
    }

    /// Writes an application's full authorization map into its cache hash
    /// and stamps the hash with `ttl`.
    ///
    /// Fields go out in [`BATCH`]-sized groups. All metrics of the
    /// application share the hash's TTL: the store has no per-field
    /// expiry, so the whole entry lives and dies together.
    ///
    /// # Errors
    ///
    /// [`RenewAuthError`] on any KV failure. A partial write is possible
    /// and harmless: the next renewal of the application overwrites it.
    pub async fn renew_auths(
        &self,
        service_id: &str,
        credentials: &Credentials,
        authorizations: &HashMap<String, Authorization>,
        ttl: Duration,
    ) -> Result<(), RenewAuthError> {
        if authorizations.is_empty() {
            return Ok(());
        }
        let renew_auth_error = |source| RenewAuthError {
            service_id: service_id.to_owned(),
            credentials: credentials.clone(),
            source,
        };

        let key = keys::auth_hash_key(service_id, credentials);
        let fields: Vec<(String, Bytes)> = authorizations
            .iter()
            .map(|(metric, auth)| (metric.clone(), Bytes::from(auth.to_cache_value())))
            .collect();

        for chunk in fields.chunks(BATCH) {
            self.kv.hash_set_multi(&key, chunk).await.map_err(renew_auth_error)?;
        }
        self.kv.expire(&key, ttl).await.map_err(renew_auth_error)?;

        debug!(%key, metrics = fields.len(), ttl_secs = ttl.as_secs(), "renewed cached auths");
        Ok(())
    }

    /// Accumulates usage deltas into the report counter hashes and
    /// registers each touched hash in the cached-reports membership set.
    ///
    /// The membership set is re-added on every call, not just the first:
    /// that is what lets a later flush cycle pick up counters a failed
    /// rename left behind.
    pub async fn report(&self, reports: &[Report]) -> KvResult<()> {
        for report in reports {
            let key = keys::report_hash_key(&report.service_id, &report.credentials);
            let deltas: Vec<(&String, &i64)> = report.usage.iter().collect();
            for chunk in deltas.chunks(BATCH) {
                for &(metric, delta) in chunk {
                    self.kv.hash_incr_by(&key, metric, *delta).await?;
                }
            }
            self.kv.set_add(SET_KEYS_CACHED_REPORTS, std::slice::from_ref(&key)).await?;
        }
        Ok(())
    }

    /// Snapshots and drains the accumulated usage reports.
    ///
    /// One call is one flush cycle, named by a fresh suffix. The protocol:
    ///
    /// 1. If no counters are registered, return nothing.
    /// 2. Rename the membership set aside; from this instant new
    ///    [`report`](Storage::report) calls build a fresh set, so nothing
    ///    is double-counted within the cycle.
    /// 3. Read and delete the parked set to learn which counters exist.
    /// 4. Park each counter under its `to_flush` name.
    /// 5. Read every parked counter, parse the application identity back
    ///    out of its name, and delete what was successfully read.
    ///
    /// Every failure is logged and skipped, never fatal: unread data stays
    /// under a name some later cycle or an operator can recover.
    pub async fn reports_to_flush(&self) -> Vec<Report> {
        let suffix = self.suffixes.next_suffix();

        match self.kv.set_cardinality(SET_KEYS_CACHED_REPORTS).await {
            Ok(0) => return Vec::new(),
            Ok(_) => {},
            Err(err) => {
                error!(error = %err, "failed to count cached report keys");
                return Vec::new();
            },
        }

        let flushing_key = flushing_set_key(&suffix);
        if let Err(err) = self.kv.rename(SET_KEYS_CACHED_REPORTS, &flushing_key).await {
            // Includes the benign race where another flusher (or an
            // expiring set) won between the cardinality check and here.
            error!(error = %err, "failed to snapshot cached report keys");
            return Vec::new();
        }

        let report_keys = match self.kv.set_members(&flushing_key).await {
            Ok(members) => members,
            Err(err) => {
                // Leave the flushing set in place: its members are still
                // recorded and the counters keep their original names.
                error!(error = %err, key = %flushing_key, "failed to read flushing report keys");
                return Vec::new();
            },
        };
        if let Err(err) = self.kv.delete(std::slice::from_ref(&flushing_key)).await {
            warn!(error = %err, key = %flushing_key, "failed to drop drained flushing set");
        }

        let parked = self.park_report_keys(&report_keys, &suffix).await;
        self.collect_parked_reports(&parked, &suffix).await
    }

    /// Step 4: renames each counter to its `to_flush` name. Failed renames
    /// are logged and skipped; those counters keep their original names
    /// and stay registered for a later cycle.
    async fn park_report_keys(&self, report_keys: &[String], suffix: &str) -> Vec<String> {
        let mut parked = Vec::with_capacity(report_keys.len());
        for chunk in report_keys.chunks(BATCH) {
            for key in chunk {
                let target = key_to_flush(key, suffix);
                match self.kv.rename(key, &target).await {
                    Ok(()) => parked.push(target),
                    Err(flushd_kv::KvError::NotFound { .. }) => {
                        // Registered but already gone; nothing to flush.
                        debug!(%key, "report key vanished before parking");
                    },
                    Err(err) => {
                        warn!(error = %err, %key, "failed to park report key, keeping for next cycle");
                    },
                }
            }
        }
        parked
    }

    /// Step 5: reads the parked counters batch by batch. A batch whose
    /// read failed keeps its keys; a batch read successfully is deleted
    /// after its contents are captured.
    async fn collect_parked_reports(&self, parked: &[String], suffix: &str) -> Vec<Report> {
        let mut reports = Vec::new();
        for chunk in parked.chunks(BATCH) {
            let mut contents = Vec::with_capacity(chunk.len());
            let mut read_failed = false;
            for key in chunk {
                match self.kv.hash_get_all(key).await {
                    Ok(fields) => contents.push((key, fields)),
                    Err(err) => {
                        error!(error = %err, %key, "some reports missing");
                        read_failed = true;
                        break;
                    },
                }
            }
            if read_failed {
                // Do not delete anything in this batch; the parked keys
                // remain readable for recovery.
                continue;
            }

            for (key, fields) in contents {
                if let Some(report) = parse_parked_report(key, fields, suffix) {
                    reports.push(report);
                }
            }
            self.delete_with_retry(chunk).await;
        }
        reports
    }

    /// Deletes drained counter keys, retrying on KV errors.
    async fn delete_with_retry(&self, keys: &[String]) {
        let attempts = self.cleanup_retry.max_retries() + 1;
        for attempt in 1..=attempts {
            match self.kv.delete(keys).await {
                Ok(()) => {
                    if attempt > 1 {
                        debug!(attempt, "flush cleanup succeeded after retry");
                    }
                    return;
                },
                Err(err) if attempt < attempts => {
                    debug!(error = %err, attempt, "flush cleanup failed, retrying");
                    sleep(self.cleanup_retry.delay()).await;
                },
                Err(err) => {
                    error!(error = %err, ?keys, "cleanup error, stranded flushed report keys");
                },
            }
        }
    }
}

/// Turns one parked counter hash back into a [`Report`]. Unparseable keys
/// and non-integer counter values are logged and dropped rather than
/// aborting the cycle.
fn parse_parked_report(
    key: &str,
    fields: Vec<(String, Bytes)>,
    suffix: &str,
) -> Option<Report> {
    if fields.is_empty() {
        return None;
    }
    let (service_id, credentials) = match service_and_creds(key, suffix) {
        Ok(identity) => identity,
        Err(err) => {
            error!(error = %err, key, "unparseable flushed report key, dropping");
            return None;
        },
    };

    let mut usage = BTreeMap::new();
    for (metric, raw) in fields {
        match std::str::from_utf8(&raw).ok().and_then(|s| s.parse::<i64>().ok()) {
            Some(value) => {
                usage.insert(metric, value);
            },
            None => {
                warn!(key, %metric, "non-integer usage value, dropping field");
            },
        }
    }
    if usage.is_empty() {
        return None;
    }
    Some(Report { service_id, credentials, usage })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use flushd_kv::MemoryKv;

    use super::*;

    fn storage(kv: &MemoryKv) -> Storage {
        let retry =
            RetryConfig::builder().max_retries(1).delay(Duration::from_millis(1)).build();
        Storage::new(Arc::new(kv.clone()), retry)
    }

    fn creds() -> Credentials {
        Credentials::from_user_key("a_user_key")
    }

    fn report(usage: &[(&str, i64)]) -> Report {
        Report {
            service_id: "a_service_id".to_owned(),
            credentials: creds(),
            usage: usage.iter().map(|(m, v)| ((*m).to_owned(), *v)).collect(),
        }
    }

    #[tokio::test]
    async fn renew_auths_writes_every_metric_and_sets_ttl() {
        let kv = MemoryKv::new();
        let storage = storage(&kv);

        let auths = HashMap::from([
            ("hits".to_owned(), Authorization::Allow),
            ("exports".to_owned(), Authorization::deny("user.blocked")),
        ]);
        storage
            .renew_auths("a_service_id", &creds(), &auths, Duration::from_secs(60))
            .await
            .unwrap();

        let key = keys::auth_hash_key("a_service_id", &creds());
        let mut fields = kv.hash_get_all(&key).await.unwrap();
        fields.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            fields,
            vec![
                ("exports".to_owned(), Bytes::from("0:user.blocked")),
                ("hits".to_owned(), Bytes::from("1")),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn renewed_auths_expire_together() {
        let kv = MemoryKv::new();
        let storage = storage(&kv);

        let auths = HashMap::from([("hits".to_owned(), Authorization::Allow)]);
        storage
            .renew_auths("a_service_id", &creds(), &auths, Duration::from_secs(30))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        let key = keys::auth_hash_key("a_service_id", &creds());
        assert!(kv.hash_get_all(&key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn renew_auths_with_empty_map_is_a_no_op() {
        let kv = MemoryKv::new();
        let storage = storage(&kv);
        storage
            .renew_auths("a_service_id", &creds(), &HashMap::new(), Duration::from_secs(60))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn report_accumulates_and_registers_the_key() {
        let kv = MemoryKv::new();
        let storage = storage(&kv);

        storage.report(&[report(&[("hits", 3)])]).await.unwrap();
        storage.report(&[report(&[("hits", 4), ("exports", 1)])]).await.unwrap();

        let key = keys::report_hash_key("a_service_id", &creds());
        let mut fields = kv.hash_get_all(&key).await.unwrap();
        fields.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            fields,
            vec![
                ("exports".to_owned(), Bytes::from("1")),
                ("hits".to_owned(), Bytes::from("7")),
            ]
        );
        assert_eq!(kv.set_cardinality(SET_KEYS_CACHED_REPORTS).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn flush_returns_accumulated_usage_and_clears_state() {
        let kv = MemoryKv::new();
        let storage = storage(&kv);

        storage.report(&[report(&[("hits", 7), ("exports", 2)])]).await.unwrap();

        let flushed = storage.reports_to_flush().await;
        assert_eq!(flushed, vec![report(&[("exports", 2), ("hits", 7)])]);

        // Counters restart from zero and nothing is registered anymore.
        assert_eq!(kv.set_cardinality(SET_KEYS_CACHED_REPORTS).await.unwrap(), 0);
        assert!(storage.reports_to_flush().await.is_empty());
    }

    #[tokio::test]
    async fn flush_with_nothing_cached_returns_empty() {
        let kv = MemoryKv::new();
        assert!(storage(&kv).reports_to_flush().await.is_empty());
    }

    #[tokio::test]
    async fn flush_covers_multiple_applications() {
        let kv = MemoryKv::new();
        let storage = storage(&kv);

        let other = Report {
            service_id: "other_service".to_owned(),
            credentials: Credentials::from_app_id("id", Some("key".to_owned())),
            usage: BTreeMap::from([("hits".to_owned(), 1)]),
        };
        storage.report(&[report(&[("hits", 5)]), other.clone()]).await.unwrap();

        let mut flushed = storage.reports_to_flush().await;
        flushed.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        assert_eq!(flushed, vec![report(&[("hits", 5)]), other]);
    }
}
