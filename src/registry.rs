//! Pointer registry.
//!
//! Maps opaque caller-provided pointers to small dense integer IDs, one ID
//! space per domain string. Generated kernels dispatch through table indices
//! instead of host pointers, so the registry is what ties an instance ID seen
//! on the GPU back to the host-side object.

use std::collections::HashMap;

use crate::errors::{Error, Result};
use crate::log::{jitlog, LogLevel};

#[derive(Default)]
struct Domain {
    /// Slot `i` holds the pointer registered under ID `i + 1`; 0 = vacant.
    slots: Vec<usize>,
    free: Vec<u32>,
    live: usize,
}

#[derive(Default)]
pub struct Registry {
    domains: HashMap<String, Domain>,
    reverse: HashMap<usize, (String, u32)>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `ptr` and return its ID (>= 1). A pointer may only be
    /// registered once across all domains.
    pub fn put(&mut self, domain: &str, ptr: usize) -> Result<u32> {
        if ptr == 0 {
            return Err(Error::invalid("registry_put(): null pointer"));
        }
        if self.reverse.contains_key(&ptr) {
            return Err(Error::invalid(format!(
                "registry_put(): pointer {ptr:#x} is already registered"
            )));
        }

        let dom = self.domains.entry(domain.to_string()).or_default();
        let id = match dom.free.pop() {
            Some(id) => {
                dom.slots[(id - 1) as usize] = ptr;
                id
            }
            None => {
                dom.slots.push(ptr);
                dom.slots.len() as u32
            }
        };
        dom.live += 1;
        self.reverse.insert(ptr, (domain.to_string(), id));
        jitlog!(LogLevel::Debug, "registry_put(\"{domain}\", {ptr:#x}): {id}");
        Ok(id)
    }

    pub fn get(&self, domain: &str, id: u32) -> Result<usize> {
        let dom = self
            .domains
            .get(domain)
            .ok_or_else(|| Error::invalid(format!("registry_get(): unknown domain \"{domain}\"")))?;
        if id == 0 || id as usize > dom.slots.len() || dom.slots[(id - 1) as usize] == 0 {
            return Err(Error::invalid(format!(
                "registry_get(\"{domain}\", {id}): unknown ID"
            )));
        }
        Ok(dom.slots[(id - 1) as usize])
    }

    /// Reverse lookup: the (domain, id) pair under which `ptr` was put.
    pub fn id(&self, ptr: usize) -> Option<(&str, u32)> {
        self.reverse.get(&ptr).map(|(d, i)| (d.as_str(), *i))
    }

    pub fn remove(&mut self, domain: &str, id: u32) -> Result<()> {
        let dom = self.domains.get_mut(domain).ok_or_else(|| {
            Error::invalid(format!("registry_remove(): unknown domain \"{domain}\""))
        })?;
        if id == 0 || id as usize > dom.slots.len() || dom.slots[(id - 1) as usize] == 0 {
            return Err(Error::invalid(format!(
                "registry_remove(\"{domain}\", {id}): unknown ID"
            )));
        }
        let ptr = std::mem::replace(&mut dom.slots[(id - 1) as usize], 0);
        dom.free.push(id);
        dom.live -= 1;
        self.reverse.remove(&ptr);
        jitlog!(LogLevel::Debug, "registry_remove(\"{domain}\", {id})");
        Ok(())
    }

    /// Number of live registrations in one domain.
    pub fn domain_len(&self, domain: &str) -> usize {
        self.domains.get(domain).map(|d| d.live).unwrap_or(0)
    }

    /// Upper bound of IDs ever issued for a domain (table size for kernels).
    pub fn domain_bound(&self, domain: &str) -> u32 {
        self.domains
            .get(domain)
            .map(|d| d.slots.len() as u32)
            .unwrap_or(0)
    }

    /// Leak report used at shutdown; returns the number of live entries.
    pub fn report_leaks(&self) -> usize {
        let mut leaked = 0;
        for (name, dom) in &self.domains {
            if dom.live > 0 {
                jitlog!(
                    LogLevel::Warn,
                    "registry: domain \"{name}\" still contains {} entries",
                    dom.live
                );
                leaked += dom.live;
            }
        }
        leaked
    }

    pub fn clear(&mut self) {
        self.domains.clear();
        self.reverse.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_dense_and_reused() {
        let mut r = Registry::new();
        let a = r.put("shape", 0x10).unwrap();
        let b = r.put("shape", 0x20).unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(r.get("shape", 1).unwrap(), 0x10);

        r.remove("shape", 1).unwrap();
        assert!(r.get("shape", 1).is_err());
        // Freed slot is handed out again before the space grows.
        let c = r.put("shape", 0x30).unwrap();
        assert_eq!(c, 1);
        assert_eq!(r.domain_bound("shape"), 2);
    }

    #[test]
    fn domains_are_independent() {
        let mut r = Registry::new();
        let a = r.put("bsdf", 0x10).unwrap();
        let b = r.put("shape", 0x20).unwrap();
        assert_eq!((a, b), (1, 1));
        assert_eq!(r.id(0x20), Some(("shape", 1)));
        assert_eq!(r.domain_len("bsdf"), 1);
    }

    #[test]
    fn duplicate_pointer_is_rejected() {
        let mut r = Registry::new();
        r.put("shape", 0x10).unwrap();
        assert!(r.put("shape", 0x10).is_err());
        assert!(r.put("other", 0x10).is_err());
    }
}
