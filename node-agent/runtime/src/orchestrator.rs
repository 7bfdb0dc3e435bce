use crate::{
    core::{
        CancellationToken, Errors, Netns, NetnsFinder, RedirectParams, RuleInstaller, Uid,
        Workload,
    },
    ipset::{HostProbeSet, IpSet, Protocol},
    metrics::Op,
    netns::{Linux, NetnsExecutor, Setns, SharedCache},
    proxy::ProxySync,
    Config, Error, Metrics,
};
use std::{collections::HashMap, net::IpAddr, path::Path, sync::Arc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Moves workloads into and out of the mesh on this node.
///
/// Each lifecycle operation is independent of every other workload's: the only state shared
/// between them is the netns cache and the host probe set, both of which are updated one entry at
/// a time. Callers must not run concurrent operations for the same workload.
pub struct Orchestrator<R, F, P, I, S: Setns = Linux> {
    cache: SharedCache,
    executor: NetnsExecutor<S>,
    probes: HostProbeSet<I>,
    rules: Arc<R>,
    finder: F,
    proxy: Arc<P>,
    redirect: RedirectParams,
    metrics: Metrics,
}

/// The external components the orchestrator drives.
#[derive(Debug)]
pub struct Collaborators<R, F, P, I> {
    pub rules: R,
    pub finder: F,
    pub proxy: Arc<P>,
    pub probe_set: I,
}

// === impl Orchestrator ===

impl<R, F, P, I> Orchestrator<R, F, P, I, Linux>
where
    R: RuleInstaller,
    F: NetnsFinder,
    P: ProxySync,
    I: IpSet,
{
    /// Builds an orchestrator that switches namespaces with `setns(2)`. The cache must be the one
    /// the proxy server replays its snapshots from.
    pub fn new(
        config: &Config,
        cache: SharedCache,
        collaborators: Collaborators<R, F, P, I>,
        metrics: Metrics,
    ) -> anyhow::Result<Self> {
        let executor = NetnsExecutor::linux(config.netns_workers)?;
        Self::with_executor(config, cache, executor, collaborators, metrics)
    }
}

impl<R, F, P, I, S> Orchestrator<R, F, P, I, S>
where
    R: RuleInstaller,
    F: NetnsFinder,
    P: ProxySync,
    I: IpSet,
    S: Setns,
{
    /// Fails if the probe set is not the one named in `config`.
    pub fn with_executor(
        config: &Config,
        cache: SharedCache,
        executor: NetnsExecutor<S>,
        Collaborators {
            rules,
            finder,
            proxy,
            probe_set,
        }: Collaborators<R, F, P, I>,
        metrics: Metrics,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            probe_set.name() == config.probe_set_name,
            "probe set {} is not the configured set {}",
            probe_set.name(),
            config.probe_set_name,
        );

        Ok(Self {
            cache,
            executor,
            probes: HostProbeSet::new(probe_set),
            rules: Arc::new(rules),
            finder,
            proxy,
            redirect: config.redirect,
            metrics,
        })
    }

    /// Spawns the proxy sync server. It runs until `shutdown` is signaled or the orchestrator is
    /// stopped.
    pub fn start(&self, shutdown: drain::Watch) -> JoinHandle<()> {
        info!(probe_set = %self.probes.name(), "Starting");
        let proxy = self.proxy.clone();
        tokio::spawn(async move { proxy.run(shutdown).await })
    }

    /// Tears down node-wide state. Every step is attempted even if an earlier one fails.
    pub fn stop(&self) {
        info!("Stopping");

        if let Err(error) = self.rules.remove_host_rules() {
            error!(%error, "Failed to remove host rules");
        }

        if let Err(error) = self.probes.flush() {
            error!(%error, set = %self.probes.name(), "Failed to flush probe set");
        }
        if let Err(error) = self.probes.destroy() {
            error!(%error, set = %self.probes.name(), "Failed to destroy probe set");
        }

        self.proxy.close();
    }

    /// Redirects a workload's traffic through the proxy and registers it with the proxy.
    ///
    /// If `netns_path` is given the namespace is opened from it directly. Otherwise the cached
    /// namespace is used, and the workload's namespace is discovered if it is not cached.
    ///
    /// Once the redirect rules are installed, the workload is in the mesh as far as removal is
    /// concerned: a failure to reach the proxy after that point is reported as
    /// [`Error::PartialAdd`].
    #[instrument(skip_all, fields(uid = %workload.uid, ns = %workload.namespace, name = %workload.name))]
    pub async fn add_to_mesh(
        &self,
        cancel: &CancellationToken,
        workload: &Workload,
        ips: &[IpAddr],
        netns_path: Option<&Path>,
    ) -> Result<(), Error> {
        let res = self.add(cancel, workload, ips, netns_path).await;
        self.record(Op::Add, &res);
        res
    }

    /// Removes a running workload from the mesh.
    ///
    /// Failing to notify the proxy is logged but not returned, since the workload's rules and
    /// probe entries have already been removed by then.
    #[instrument(skip_all, fields(uid = %workload.uid, ns = %workload.namespace, name = %workload.name))]
    pub async fn remove_from_mesh(
        &self,
        cancel: &CancellationToken,
        workload: &Workload,
    ) -> Result<(), Error> {
        let res = self.remove(cancel, workload).await;
        self.record(Op::Remove, &res);
        res
    }

    /// Forgets a workload that has terminated. Its namespace, and the rules in it, are already
    /// gone.
    #[instrument(skip_all, fields(uid = %workload.uid, ns = %workload.namespace, name = %workload.name))]
    pub async fn delete_from_mesh(
        &self,
        cancel: &CancellationToken,
        workload: &Workload,
    ) -> Result<(), Error> {
        let res = self.delete(cancel, workload).await;
        self.record(Op::Delete, &res);
        res
    }

    /// Rebuilds node state for the workloads that are in the mesh at startup.
    ///
    /// The probe set is synced to exactly these workloads' IPs and each workload's namespace is
    /// discovered and cached. Failures are collected rather than stopping at the first, so a
    /// single workload never prevents the others from being restored.
    #[instrument(skip_all, fields(workloads = workloads.len()))]
    pub async fn construct_initial_snapshot(&self, workloads: &[Workload]) -> Result<(), Error> {
        let res = self.snapshot(workloads).await;
        self.record(Op::Snapshot, &res);
        res
    }

    async fn add(
        &self,
        cancel: &CancellationToken,
        workload: &Workload,
        ips: &[IpAddr],
        netns_path: Option<&Path>,
    ) -> Result<(), Error> {
        info!(?ips, "Adding to mesh");

        // Concurrent lookups see the workload as in flight.
        self.cache.ensure(&workload.uid);

        let netns = match netns_path {
            Some(path) => self.cache.upsert(&workload.uid, path)?,
            None => self.netns_for(workload).await?,
        };
        debug!(inode = netns.inode(), "Resolved netns");

        self.probes.add_entries(&workload.uid, ips, Protocol::Tcp)?;

        let rules = self.rules.clone();
        let params = self.redirect;
        self.executor
            .run(netns.clone(), move || rules.install_redirect(&params))
            .await?
            .map_err(Error::RuleInstall)?;
        debug!("Installed redirect rules");

        let joined = Workload {
            ips: ips.to_vec(),
            ..workload.clone()
        };
        self.proxy
            .notify_joined(cancel, &joined, netns)
            .await
            .map_err(|error| {
                warn!(%error, "Proxy did not confirm workload");
                Error::PartialAdd(error)
            })?;

        info!("Added to mesh");
        Ok(())
    }

    async fn remove(&self, cancel: &CancellationToken, workload: &Workload) -> Result<(), Error> {
        debug!("Removing from mesh");

        let Some(netns) = self.cache.take(&workload.uid) else {
            warn!("Netns not found during removal");
            return Err(Error::NamespaceNotFound(workload.uid.clone()));
        };

        let rules = self.rules.clone();
        let removed = match self
            .executor
            .run(netns.clone(), move || rules.remove_redirect())
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(Error::RuleRemoval(error)),
            Err(error) => Err(Error::NamespaceSwitch(error)),
        };
        if let Err(error) = removed {
            error!(%error, "Failed to remove redirect rules");
            // Keep the handle so that the removal can be retried.
            self.cache.reinsert(workload.uid.clone(), netns);
            return Err(error);
        }
        drop(netns);

        self.probes.remove_entries(workload).map_err(|error| {
            error!(%error, "Failed to remove probe entries");
            Error::from(error)
        })?;

        if let Err(error) = self.proxy.notify_left(cancel, &workload.uid).await {
            error!(%error, "Failed to notify proxy of removal");
        }

        info!("Removed from mesh");
        Ok(())
    }

    async fn delete(&self, cancel: &CancellationToken, workload: &Workload) -> Result<(), Error> {
        debug!("Deleting from mesh");

        self.probes.remove_entries(workload).map_err(|error| {
            error!(%error, "Failed to remove probe entries");
            Error::from(error)
        })?;

        if self.cache.take(&workload.uid).is_none() {
            warn!("Netns not found during deletion");
        }

        self.proxy
            .notify_left(cancel, &workload.uid)
            .await
            .map_err(Error::ProxySync)?;

        info!("Deleted from mesh");
        Ok(())
    }

    async fn snapshot(&self, workloads: &[Workload]) -> Result<(), Error> {
        info!("Constructing initial snapshot");
        let mut errors = Errors::new();

        if let Err(e) = self.probes.sync(workloads, Protocol::Tcp) {
            errors.push(Error::AdmissionSet(e));
        }

        for workload in workloads {
            self.cache.ensure(&workload.uid);
        }
        match self.find_and_cache(workloads).await {
            Ok(found) => {
                info!(found = found.len(), "Discovered netns");
                errors.extend(
                    workloads
                        .iter()
                        .filter(|w| !found.contains_key(&w.uid))
                        .map(|w| {
                            warn!(uid = %w.uid, workload = %w, "Netns not found");
                            Error::NamespaceNotFound(w.uid.clone())
                        }),
                );
            }
            Err(error) => {
                error!(%error, "Failed to discover netns");
                errors.push(error);
            }
        }

        errors.into_result().map_err(Error::Snapshot)
    }

    /// Returns the workload's cached namespace, discovering it if it is not cached yet. The
    /// workload may have been running before it was selected for the mesh.
    async fn netns_for(&self, workload: &Workload) -> Result<Arc<Netns>, Error> {
        if let Some(netns) = self.cache.get(&workload.uid) {
            return Ok(netns);
        }

        debug!("Netns not cached; discovering");
        self.find_and_cache(std::slice::from_ref(workload))
            .await?
            .remove(&workload.uid)
            .ok_or_else(|| Error::NamespaceNotFound(workload.uid.clone()))
    }

    /// Discovers the namespaces of the given workloads in a single lookup and caches those that
    /// are found.
    async fn find_and_cache(
        &self,
        workloads: &[Workload],
    ) -> Result<HashMap<Uid, Arc<Netns>>, Error> {
        let wanted = workloads
            .iter()
            .map(|w| (w.uid.clone(), w.clone()))
            .collect::<HashMap<_, _>>();
        let found = self
            .finder
            .find_netns(&wanted)
            .await
            .map_err(Error::NamespaceDiscovery)?;

        Ok(found
            .into_iter()
            .filter(|(uid, _)| wanted.contains_key(uid))
            .map(|(uid, netns)| {
                let netns = self.cache.upsert_netns(uid.clone(), netns);
                (uid, netns)
            })
            .collect())
    }

    fn record(&self, op: Op, res: &Result<(), Error>) {
        self.metrics.record(op, res, self.cache.len());
    }
}

impl<R, F, P, I, S: Setns> std::fmt::Debug for Orchestrator<R, F, P, I, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("cache", &self.cache)
            .field("executor", &self.executor)
            .field("redirect", &self.redirect)
            .finish()
    }
}
