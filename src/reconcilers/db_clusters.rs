//! Database cluster inventory synchronizer
//!
//! Keeps the locally stored database cluster records in line with what the
//! registered clusters actually run. Two timers drive it: a full sync over
//! every cluster and a short deletion sweep that confirms clusters being torn
//! down are gone.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use kube::ResourceExt;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::check_connection;
use crate::crd::Engine;
use crate::error::Result;
use crate::keyed_store::KeyedStore;
use crate::metrics::{DB_CLUSTERS, DELETING_DB_CLUSTERS, SYNCS, SYNC_DURATION};
use crate::olm::OperatorId;
use crate::services::Context;
use crate::store::{DbClusterKey, DbClusterRecord};

/// Capacity of the immediate-sweep channel
const FORCE_SWEEP_CAPACITY: usize = 10;

/// Synchronizes the inventory of every registered cluster
pub struct DbClusterSynchronizer {
    ctx: Arc<Context>,
    /// Records whose deletion is in flight
    deleting: KeyedStore<DbClusterKey, ()>,
    /// Records missing from the last successful listing
    missing: KeyedStore<DbClusterKey, ()>,
    force_tx: mpsc::Sender<DbClusterKey>,
    force_rx: Mutex<mpsc::Receiver<DbClusterKey>>,
}

impl DbClusterSynchronizer {
    pub fn new(ctx: Arc<Context>) -> Self {
        let (force_tx, force_rx) = mpsc::channel(FORCE_SWEEP_CAPACITY);
        Self {
            ctx,
            deleting: KeyedStore::new(),
            missing: KeyedStore::new(),
            force_tx,
            force_rx: Mutex::new(force_rx),
        }
    }

    /// Run both timers until `token` is cancelled.
    ///
    /// A sync or sweep in progress finishes before the loop notices the
    /// cancellation.
    pub async fn run(&self, token: CancellationToken) {
        let mut sync_timer = interval(self.ctx.config.sync_interval);
        sync_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep_timer = interval(self.ctx.config.deletion_sweep_interval);
        sweep_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut force = self.force_rx.lock().await;

        info!(
            sync_interval = ?self.ctx.config.sync_interval,
            sweep_interval = ?self.ctx.config.deletion_sweep_interval,
            "Starting database cluster synchronizer"
        );

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    info!("Stopping database cluster synchronizer");
                    return;
                }
                _ = sync_timer.tick() => {
                    if let Err(e) = self.sync_all().await {
                        error!(error = %e, "Inventory sync failed");
                    }
                }
                _ = sweep_timer.tick() => self.sweep_deletions().await,
                Some(key) = force.recv() => {
                    debug!(cluster = %key.cluster, name = %key.name, "Immediate deletion sweep");
                    self.sweep_deletions().await;
                }
            }
        }
    }

    /// Sync every registered cluster concurrently
    pub async fn sync_all(&self) -> Result<()> {
        let timer = SYNC_DURATION.start_timer();
        let registrations = self.ctx.store.list_clusters().await?;
        let registered: HashSet<&str> = registrations.iter().map(|r| r.name.as_str()).collect();
        self.missing
            .retain(|key, _| registered.contains(key.cluster.as_str()))
            .await;

        let syncs = registrations.iter().map(|registration| async move {
            match self.sync_cluster(&registration.name).await {
                Ok(()) => SYNCS.with_label_values(&["success"]).inc(),
                Err(e) if e.is_access_error() => {
                    warn!(cluster = %registration.name, error = %e, "Database clusters not accessible, sync skipped");
                    SYNCS.with_label_values(&["skipped"]).inc();
                }
                Err(e) => {
                    error!(cluster = %registration.name, error = %e, "Cannot sync cluster");
                    SYNCS.with_label_values(&["failure"]).inc();
                }
            }
        });
        join_all(syncs).await;

        timer.observe_duration();
        self.update_inventory_gauges().await;
        Ok(())
    }

    /// Align the records of one cluster with its live listing.
    ///
    /// Engines without an installed operator are skipped. A failed listing
    /// changes nothing.
    #[instrument(skip(self))]
    pub async fn sync_cluster(&self, cluster: &str) -> Result<()> {
        let client = self.ctx.client(cluster).await?;
        let connection = check_connection(client.as_ref()).await?;
        let engines: Vec<Engine> = Engine::ALL
            .into_iter()
            .filter(|e| connection.operator_version(OperatorId::for_engine(*e)).is_some())
            .collect();
        if engines.is_empty() {
            debug!("No database operator installed");
            return Ok(());
        }

        let live = client.list_database_clusters().await?;

        let mut seen = HashSet::new();
        for db in live.iter().filter(|db| engines.contains(&db.spec.database)) {
            let record = DbClusterRecord {
                cluster: cluster.to_string(),
                name: db.name_any(),
                engine: db.spec.database,
                namespace: db.namespace().unwrap_or_else(|| "default".to_string()),
                installed_image: db.spec.database_image.clone(),
            };
            let key = record.key();
            self.missing.remove(&key).await;
            self.ctx.store.upsert_db_cluster(record).await?;
            if db.is_deleting() {
                self.watch_deletion(key.clone()).await;
            }
            seen.insert(key);
        }

        let records = self.ctx.store.list_db_clusters(cluster).await?;
        let stored: HashSet<DbClusterKey> = records.iter().map(DbClusterRecord::key).collect();
        self.missing
            .retain(|key, _| key.cluster != cluster || stored.contains(key))
            .await;

        for record in records {
            let key = record.key();
            if !engines.contains(&key.engine) || seen.contains(&key) || self.deleting.contains(&key).await {
                continue;
            }
            if self.missing.insert(key.clone(), ()).await.is_none() {
                debug!(name = %key.name, engine = %key.engine, "Database cluster missing from listing");
                continue;
            }
            self.missing.remove(&key).await;
            self.ctx.store.remove_db_cluster(&key).await?;
            info!(name = %key.name, engine = %key.engine, "Removed database cluster missing from two listings");
        }

        debug!(live = seen.len(), "Cluster synced");
        Ok(())
    }

    /// Track a record until its live object is gone
    pub async fn watch_deletion(&self, key: DbClusterKey) {
        if self.deleting.insert(key.clone(), ()).await.is_some() {
            return;
        }
        info!(cluster = %key.cluster, name = %key.name, "Watching database cluster deletion");
        DELETING_DB_CLUSTERS.set(self.deleting.len().await as f64);

        if let Err(e) = self.force_tx.try_send(key) {
            debug!(error = %e, "Immediate sweep not queued, waiting for the next tick");
        }
    }

    /// Records whose deletion is still in flight
    pub async fn deleting(&self) -> Vec<DbClusterKey> {
        let mut keys: Vec<DbClusterKey> = self.deleting.snapshot().await.into_iter().map(|(k, _)| k).collect();
        keys.sort();
        keys
    }

    /// Check every watched record concurrently, then drop confirmed ones
    pub async fn sweep_deletions(&self) {
        let watched = self.deleting.snapshot().await;
        if watched.is_empty() {
            return;
        }

        let (tx, mut rx) = mpsc::channel(watched.len());
        let checks = watched.into_iter().map(|(key, ())| {
            let tx = tx.clone();
            async move {
                let gone = self.deletion_confirmed(&key).await;
                // the receiver outlives every sender
                let _ = tx.send((key, gone)).await;
            }
        });
        join_all(checks).await;
        drop(tx);

        while let Some((key, gone)) = rx.recv().await {
            if !gone {
                continue;
            }
            self.deleting.remove(&key).await;
            self.missing.remove(&key).await;
            if let Err(e) = self.ctx.store.remove_db_cluster(&key).await {
                if !e.is_not_found() {
                    warn!(cluster = %key.cluster, name = %key.name, error = %e, "Cannot remove database cluster record");
                }
            }
            info!(cluster = %key.cluster, name = %key.name, "Database cluster deletion confirmed");
        }

        DELETING_DB_CLUSTERS.set(self.deleting.len().await as f64);
    }

    async fn deletion_confirmed(&self, key: &DbClusterKey) -> bool {
        let record = match self.ctx.store.find_db_cluster(key).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => return true,
            Err(e) => {
                warn!(cluster = %key.cluster, name = %key.name, error = %e, "Cannot load database cluster record");
                return false;
            }
        };
        let client = match self.ctx.client(&key.cluster).await {
            Ok(client) => client,
            Err(e) if e.is_not_found() => return true,
            Err(e) => {
                warn!(cluster = %key.cluster, error = %e, "Cannot connect to cluster");
                return false;
            }
        };

        match client.get_database_cluster(&record.namespace, &record.name).await {
            Ok(_) => false,
            Err(e) if e.is_not_found() => true,
            Err(e) => {
                warn!(cluster = %key.cluster, name = %key.name, error = %e, "Cannot check database cluster");
                false
            }
        }
    }

    async fn update_inventory_gauges(&self) {
        let Ok(registrations) = self.ctx.store.list_clusters().await else {
            return;
        };
        let mut counts: BTreeMap<Engine, usize> = Engine::ALL.into_iter().map(|e| (e, 0)).collect();
        for registration in registrations {
            if let Ok(records) = self.ctx.store.list_db_clusters(&registration.name).await {
                for record in records {
                    *counts.entry(record.engine).or_default() += 1;
                }
            }
        }
        for (engine, count) in counts {
            DB_CLUSTERS.with_label_values(&[engine.as_str()]).set(count as f64);
        }
    }
}
