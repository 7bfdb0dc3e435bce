use crate::{IpSet, Protocol};
use ahash::AHashMap as HashMap;
use anyhow::{bail, Result};
use parking_lot::RwLock;
use std::{
    net::IpAddr,
    sync::atomic::{AtomicBool, Ordering},
};

/// An in-process [`IpSet`], for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryIpSet {
    name: String,
    entries: RwLock<HashMap<IpAddr, Entry>>,
    destroyed: AtomicBool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub protocol: Protocol,
    pub comment: String,
}

impl MemoryIpSet {
    pub fn new(name: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn entry(&self, ip: IpAddr) -> Option<Entry> {
        self.entries.read().get(&ip).cloned()
    }

    /// Returns the IPs of entries tagged with `comment`, sorted.
    pub fn ips_tagged(&self, comment: &str) -> Vec<IpAddr> {
        let mut ips = self
            .entries
            .read()
            .iter()
            .filter(|(_, e)| e.comment == comment)
            .map(|(ip, _)| *ip)
            .collect::<Vec<_>>();
        ips.sort();
        ips
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn check(&self) -> Result<()> {
        if self.is_destroyed() {
            bail!("set {} does not exist", self.name);
        }
        Ok(())
    }
}

impl IpSet for MemoryIpSet {
    fn name(&self) -> &str {
        &self.name
    }

    fn add_ip(&self, ip: IpAddr, protocol: Protocol, comment: &str, replace: bool) -> Result<()> {
        self.check()?;
        let mut entries = self.entries.write();
        if !replace && entries.contains_key(&ip) {
            bail!("{ip} is already in set {}", self.name);
        }
        entries.insert(
            ip,
            Entry {
                protocol,
                comment: comment.to_string(),
            },
        );
        Ok(())
    }

    fn clear_entries_with_ip(&self, ip: IpAddr) -> Result<()> {
        self.check()?;
        self.entries.write().remove(&ip);
        Ok(())
    }

    fn list_entries_by_ip(&self) -> Result<Vec<IpAddr>> {
        self.check()?;
        Ok(self.entries.read().keys().copied().collect())
    }

    fn list_entries(&self) -> Result<Vec<(IpAddr, String)>> {
        self.check()?;
        Ok(self
            .entries
            .read()
            .iter()
            .map(|(ip, e)| (*ip, e.comment.clone()))
            .collect())
    }

    fn flush(&self) -> Result<()> {
        self.check()?;
        self.entries.write().clear();
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.check()?;
        if !self.is_empty() {
            bail!("set {} is not empty", self.name);
        }
        self.destroyed.store(true, Ordering::Release);
        Ok(())
    }
}
