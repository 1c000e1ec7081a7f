//! The VSites this site serves.

use std::collections::BTreeMap;

use crate::{peer::Catalog, vsite::VSite, Watermark};

/// VSites by name, in the order the database listed them.
///
/// Unloaded until the first database session reports which VSites the site
/// is allowed to serve; the list is never reloaded afterwards.
#[derive(Debug)]
pub struct VSiteRegistry {
    site_name: String,
    names: Vec<String>,
    vsites: Option<BTreeMap<String, VSite>>,
}

impl VSiteRegistry {
    pub fn new(site_name: impl Into<String>) -> Self {
        Self {
            site_name: site_name.into(),
            names: Vec::new(),
            vsites: None,
        }
    }

    /// Install the VSite list. Duplicate names keep the first entry.
    pub fn load(&mut self, vsites: Vec<VSite>) {
        let mut names = Vec::with_capacity(vsites.len());
        let mut by_name = BTreeMap::new();
        for vsite in vsites {
            if by_name.contains_key(vsite.name()) {
                continue;
            }
            names.push(vsite.name().to_string());
            by_name.insert(vsite.name().to_string(), vsite);
        }
        self.names = names;
        self.vsites = Some(by_name);
    }

    pub fn is_loaded(&self) -> bool {
        self.vsites.is_some()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&VSite> {
        self.vsites.as_ref()?.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut VSite> {
        self.vsites.as_mut()?.get_mut(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &VSite> {
        self.vsites.iter().flat_map(|vsites| vsites.values())
    }

    /// Put every VSite into bootstrap mode.
    pub fn enable_bootstrap(&mut self) {
        for vsite in self.vsites.iter_mut().flat_map(|vsites| vsites.values_mut()) {
            vsite.enable_bootstrap();
        }
    }

    /// Names of VSites whose retry is due at `now`.
    pub fn due(&self, now: u64) -> Vec<String> {
        self.names
            .iter()
            .filter(|name| self.get(name).is_some_and(|v| v.is_due(now)))
            .cloned()
            .collect()
    }

    /// Earliest pending retry deadline.
    pub fn next_retry(&self) -> Option<u64> {
        self.iter().filter_map(VSite::retry_at).min()
    }
}

impl Catalog for VSiteRegistry {
    fn site_name(&self) -> &str {
        &self.site_name
    }

    fn vsite_names(&self) -> &[String] {
        &self.names
    }

    fn watermark(&self, vsite: &str) -> Option<Watermark> {
        self.get(vsite).map(|v| v.watermark().clone())
    }

    fn is_loaded(&self) -> bool {
        VSiteRegistry::is_loaded(self)
    }
}
