//! Offline index rebuild
//!
//! Re-reads id2entry in disk order and pushes every entry through the same
//! two phases as an LDIF import, writing only the selected indexes. Entry
//! IDs are taken from id2entry, so nothing is allocated.
//!
//! ## Index names
//! ```text
//!   dn2id | id2children | id2subtree   DN index and subordinate sets
//!   dn2uri                             referral database
//!   vlv.<name>                         one VLV index
//!   <attr>                             every index of an attribute
//!   <attr>.<type> | <attr>.<rule>      one index of an attribute
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, info_span};

use crate::config::{RebuildConfig, RebuildMode};
use crate::container::{EntryContainer, RootContainer};
use crate::error::{DirError, Result};
use crate::index::{Index, Indexer};
use crate::vlv::VlvIndex;

use super::monitor::{CancellationToken, DiskSpaceMonitor, ImportCounters, ImportListener};
use super::phase_one::ContainerPlan;
use super::source::Id2EntrySource;
use super::{attribute_plan, cores, IndexRegistry, MemoryParams, Pipeline};

/// Totals of one rebuild
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildResult {
    pub entries_processed: u64,
    /// Names of the rebuilt indexes
    pub indexes: Vec<String>,
    pub runs_written: u64,
    pub merge_batches: u64,
    pub elapsed: Duration,
}

impl RebuildResult {
    pub fn rate(&self) -> f64 {
        self.entries_processed as f64 / self.elapsed.as_secs_f64().max(0.001)
    }
}

/// The indexes one rebuild writes
#[derive(Default)]
struct Selection {
    /// dn2id with id2children / id2subtree
    dn: bool,
    clear_dn2id: bool,
    dn2uri: bool,
    attributes: BTreeMap<String, Vec<(Indexer, Arc<Index>)>>,
    vlvs: Vec<Arc<VlvIndex>>,
}

impl Selection {
    fn is_empty(&self) -> bool {
        !self.dn && !self.dn2uri && self.attributes.is_empty() && self.vlvs.is_empty()
    }

    fn add_attribute_index(&mut self, attribute: &str, indexer: Indexer, index: Arc<Index>) {
        let slots = self.attributes.entry(attribute.to_string()).or_default();
        if !slots.iter().any(|(_, i)| i.name() == index.name()) {
            slots.push((indexer, index));
        }
    }

    fn add_vlv(&mut self, vlv: Arc<VlvIndex>) {
        if !self.vlvs.iter().any(|v| v.name() == vlv.name()) {
            self.vlvs.push(vlv);
        }
    }

    /// id2children / id2subtree (when enabled) and the selected attribute indexes
    fn indexes(&self, container: &EntryContainer) -> Vec<Arc<Index>> {
        let mut out = Vec::new();
        if self.dn && container.subordinate_indexes_enabled() {
            out.push(container.id2children().clone());
            out.push(container.id2subtree().clone());
        }
        for slots in self.attributes.values() {
            out.extend(slots.iter().map(|(_, i)| i.clone()));
        }
        out
    }

    fn names(&self, container: &EntryContainer) -> Vec<String> {
        let mut names = Vec::new();
        if self.clear_dn2id {
            names.push("dn2id".to_string());
        }
        if self.dn2uri {
            names.push("dn2uri".to_string());
        }
        names.extend(self.indexes(container).iter().map(|i| i.name().to_string()));
        names.extend(self.vlvs.iter().map(|v| v.database_name().to_string()));
        names
    }
}

impl fmt::Debug for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selection")
            .field("dn", &self.dn)
            .field("dn2uri", &self.dn2uri)
            .field("attributes", &self.attributes.keys().collect::<Vec<_>>())
            .field("vlvs", &self.vlvs.iter().map(|v| v.name()).collect::<Vec<_>>())
            .finish()
    }
}

/// Rebuilds indexes of one base DN
pub struct RebuildManager<'a> {
    root: &'a RootContainer,
    config: RebuildConfig,
    listener: Option<Arc<dyn ImportListener>>,
    disk_monitor: Option<Arc<dyn DiskSpaceMonitor>>,
    cancel: CancellationToken,
}

impl<'a> RebuildManager<'a> {
    pub fn new(root: &'a RootContainer, config: RebuildConfig) -> Self {
        Self {
            root,
            config,
            listener: None,
            disk_monitor: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn ImportListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_disk_monitor(mut self, monitor: Arc<dyn DiskSpaceMonitor>) -> Self {
        self.disk_monitor = Some(monitor);
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn rebuild(&self) -> Result<RebuildResult> {
        let _span = info_span!("rebuild", base_dn = %self.config.base_dn).entered();
        let started = Instant::now();
        let container = self
            .root
            .container(&self.config.base_dn)
            .ok_or_else(|| DirError::Config(format!("no backend for base DN {}", self.config.base_dn)))?;

        let selection = self.select(&container)?;
        let names = selection.names(&container);
        if selection.is_empty() {
            info!("No indexes to rebuild");
            return Ok(RebuildResult {
                elapsed: started.elapsed(),
                ..Default::default()
            });
        }

        if self.config.clear_degraded_state {
            if !container.is_empty() {
                return Err(DirError::Config(
                    "degraded state can only be cleared on an empty backend".to_string(),
                ));
            }
            self.set_trusted(&container, &selection, true);
            info!(indexes = ?names, "Cleared degraded state");
            return Ok(RebuildResult {
                indexes: names,
                elapsed: started.elapsed(),
                ..Default::default()
            });
        }

        info!(indexes = ?names, entries = container.entry_count(), "Starting rebuild");
        for index in selection.indexes(&container) {
            index.set_trusted(false);
            index.set_rebuild_status(true);
        }
        for vlv in &selection.vlvs {
            vlv.set_trusted(false);
            vlv.set_rebuild_status(true);
        }

        let counters = Arc::new(ImportCounters::default());
        let result = self.run(&container, &selection, counters.clone());

        for index in selection.indexes(&container) {
            index.set_rebuild_status(false);
        }
        for vlv in &selection.vlvs {
            vlv.set_rebuild_status(false);
        }
        result?;
        self.set_trusted(&container, &selection, true);
        self.root.sync()?;

        let rebuilt = RebuildResult {
            entries_processed: ImportCounters::get(&counters.entries_imported),
            indexes: names,
            runs_written: ImportCounters::get(&counters.runs_written),
            merge_batches: ImportCounters::get(&counters.merge_batches),
            elapsed: started.elapsed(),
        };
        info!(
            entries = rebuilt.entries_processed,
            elapsed_secs = rebuilt.elapsed.as_secs_f64(),
            rate = rebuilt.rate() as u64,
            "Rebuild finished"
        );
        Ok(rebuilt)
    }

    fn set_trusted(&self, container: &EntryContainer, selection: &Selection, trusted: bool) {
        for index in selection.indexes(container) {
            index.set_trusted(trusted);
        }
        for vlv in &selection.vlvs {
            vlv.set_trusted(trusted);
        }
    }

    fn run(&self, container: &Arc<EntryContainer>, selection: &Selection, counters: Arc<ImportCounters>) -> Result<()> {
        if selection.clear_dn2id {
            container.dn2id().database().truncate();
        }
        if selection.dn2uri {
            container.dn2uri().database().truncate();
        }
        for index in selection.indexes(container) {
            index.clear();
        }
        for vlv in &selection.vlvs {
            vlv.clear();
        }

        let mut registry = IndexRegistry::new();
        let dn_target = selection
            .dn
            .then(|| registry.register_dn(container.clone(), container.subordinate_indexes_enabled()));
        let attributes = selection
            .attributes
            .iter()
            .map(|(attribute, slots)| attribute_plan(&mut registry, attribute, slots.clone()))
            .collect();
        let plan = ContainerPlan {
            container: container.clone(),
            dn_target,
            attributes,
            vlvs: selection.vlvs.clone(),
            write_entries: false,
            write_dn2uri: selection.dn2uri,
        };
        let registry = Arc::new(registry);

        let threads = if self.config.thread_count == 0 {
            2 * cores()
        } else {
            self.config.thread_count
        };
        let data_dir = self.root.config().data_dir.clone();
        let pipeline = Pipeline {
            tmp_dir: self
                .config
                .tmp_dir
                .clone()
                .unwrap_or_else(|| data_dir.join("rebuild-tmp")),
            data_dir,
            thread_count: threads,
            progress_interval: self.config.progress_interval,
            cancel: self.cancel.clone(),
            counters,
            listener: self.listener.clone(),
            disk_monitor: self.disk_monitor.clone(),
        };
        let params = MemoryParams {
            total_memory: self.config.available_memory,
            index_count: registry.index_keys().len(),
            thread_count: threads,
            needs_dn_cache: false,
            skip_dn_validation: true,
            cleared_backend: true,
            rebuild: true,
        };
        let source = Id2EntrySource::new(container.id2entry().database().disk_ordered_scan());

        pipeline.prepare_tmp_dir()?;
        let result = pipeline.run(vec![plan], registry, None, Box::new(source), None, params);
        pipeline.remove_tmp_dir();
        result
    }

    /// Resolve the configured mode to concrete indexes
    fn select(&self, container: &EntryContainer) -> Result<Selection> {
        let mut selection = Selection::default();
        match &self.config.mode {
            RebuildMode::All => {
                selection.dn = true;
                selection.clear_dn2id = true;
                selection.dn2uri = true;
                for attr in container.attribute_indexes() {
                    for (indexer, index) in attr.indexers() {
                        selection.add_attribute_index(attr.attribute_name(), indexer, index);
                    }
                }
                for vlv in container.vlv_indexes() {
                    selection.add_vlv(vlv);
                }
            }
            RebuildMode::Degraded => {
                if container.subordinate_indexes_enabled()
                    && (!container.id2children().is_trusted() || !container.id2subtree().is_trusted())
                {
                    selection.dn = true;
                }
                for attr in container.attribute_indexes() {
                    for (indexer, index) in attr.indexers() {
                        if !index.is_trusted() {
                            selection.add_attribute_index(attr.attribute_name(), indexer, index);
                        }
                    }
                }
                for vlv in container.vlv_indexes() {
                    if !vlv.is_trusted() {
                        selection.add_vlv(vlv);
                    }
                }
            }
            RebuildMode::UserDefined(names) => {
                for name in names {
                    self.select_name(container, &name.to_ascii_lowercase(), &mut selection)?;
                }
            }
        }
        Ok(selection)
    }

    fn select_name(&self, container: &EntryContainer, name: &str, selection: &mut Selection) -> Result<()> {
        match name {
            "dn2id" | "id2children" | "id2subtree" => {
                selection.dn = true;
                return Ok(());
            }
            "dn2uri" => {
                selection.dn2uri = true;
                return Ok(());
            }
            _ => {}
        }
        if let Some(vlv_name) = name.strip_prefix("vlv.") {
            let vlv = container
                .vlv_index(vlv_name)
                .ok_or_else(|| DirError::IndexNotConfigured(name.to_string()))?;
            selection.add_vlv(vlv);
            return Ok(());
        }

        let (attribute, index_id) = match name.split_once('.') {
            Some((a, i)) => (a, Some(i)),
            None => (name, None),
        };
        let attr = container
            .attribute_index(attribute)
            .ok_or_else(|| DirError::IndexNotConfigured(name.to_string()))?;
        let mut found = false;
        for (indexer, index) in attr.indexers() {
            if index_id.map_or(true, |id| indexer.index_id() == id) {
                selection.add_attribute_index(attr.attribute_name(), indexer, index);
                found = true;
            }
        }
        if !found {
            return Err(DirError::IndexNotConfigured(name.to_string()));
        }
        Ok(())
    }
}
