//! File-backed instance inventory.
//!
//! A JSON document listing virtual machines and their instances:
//!
//! ```json
//! {
//!   "virtualMachines": [{ "namespace": "default", "name": "testvm" }],
//!   "instances": [{ "namespace": "default", "name": "testvm", "status": { "phase": "Running" } }]
//! }
//! ```
//!
//! A VM's instance carries the VM's name. The file is watched and the
//! in-memory snapshot replaced whenever it changes; a file that fails to
//! parse leaves the previous snapshot in place.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Context as _;
use futures_util::future::BoxFuture;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::StatusError;
use crate::instance::Instance;
use crate::resolver::InstanceSource;

const VM_RESOURCE: &str = "virtualmachine";
const VMI_RESOURCE: &str = "virtualmachineinstance";

type Key = (String, String);

/// A virtual machine definition; its instance exists only while started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub namespace: String,
    pub name: String,
}

/// On-disk layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InventoryFile {
    pub virtual_machines: Vec<VirtualMachine>,
    pub instances: Vec<Instance>,
}

#[derive(Debug, Default)]
struct Snapshot {
    vms: HashMap<Key, VirtualMachine>,
    instances: HashMap<Key, Instance>,
}

impl From<InventoryFile> for Snapshot {
    fn from(file: InventoryFile) -> Self {
        Self {
            vms: file
                .virtual_machines
                .into_iter()
                .map(|vm| ((vm.namespace.clone(), vm.name.clone()), vm))
                .collect(),
            instances: file
                .instances
                .into_iter()
                .map(|vmi| ((vmi.namespace.clone(), vmi.name.clone()), vmi))
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Inventory
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Inventory {
    path: Option<PathBuf>,
    snapshot: RwLock<Snapshot>,
}

impl Inventory {
    /// An inventory that knows no instances.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_file(file: InventoryFile) -> Self {
        Self {
            path: None,
            snapshot: RwLock::new(file.into()),
        }
    }

    /// Read and parse `path`.
    pub fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let file = read_file(&path)?;
        info!(
            path = %path.display(),
            vms = file.virtual_machines.len(),
            instances = file.instances.len(),
            "loaded inventory"
        );
        Ok(Self {
            path: Some(path),
            snapshot: RwLock::new(file.into()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Swap in a new set of VMs and instances.
    pub fn replace(&self, file: InventoryFile) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = file.into();
    }

    /// Re-read the backing file. The current snapshot is kept on error.
    pub fn reload(&self) -> anyhow::Result<()> {
        let path = self
            .path
            .as_deref()
            .context("inventory has no backing file")?;
        let file = read_file(path)?;
        info!(
            path = %path.display(),
            vms = file.virtual_machines.len(),
            instances = file.instances.len(),
            "reloaded inventory"
        );
        self.replace(file);
        Ok(())
    }

    /// Reload whenever the backing file is written.
    ///
    /// The parent directory is watched rather than the file itself, so
    /// editors that save via rename are picked up too. Drop the returned
    /// watcher to stop.
    pub fn watch(self: &Arc<Self>) -> anyhow::Result<InventoryWatcher> {
        let path = self
            .path
            .clone()
            .context("inventory has no backing file")?;
        let file_name = path
            .file_name()
            .with_context(|| format!("inventory path {} has no file name", path.display()))?
            .to_os_string();
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let inventory = Arc::clone(self);
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        return;
                    }
                    let affects_target = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().is_some_and(|f| f == file_name));
                    if affects_target {
                        if let Err(e) = inventory.reload() {
                            warn!(error = %e, "keeping previous inventory");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "inventory watch error"),
            }
        })
        .context("creating inventory watcher")?;

        watcher
            .watch(&parent, RecursiveMode::NonRecursive)
            .with_context(|| format!("watching {}", parent.display()))?;

        Ok(InventoryWatcher { _watcher: watcher })
    }

    fn instance(&self, namespace: &str, name: &str) -> Option<Instance> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .instances
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
    }

    fn has_vm(&self, namespace: &str, name: &str) -> bool {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .vms
            .contains_key(&(namespace.to_owned(), name.to_owned()))
    }
}

/// Keeps the inventory file watched while alive.
pub struct InventoryWatcher {
    _watcher: RecommendedWatcher,
}

impl InstanceSource for Inventory {
    fn fetch_instance<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Instance, StatusError>> {
        Box::pin(async move {
            self.instance(namespace, name)
                .ok_or_else(|| StatusError::not_found(VMI_RESOURCE, name))
        })
    }

    fn fetch_instance_for_vm<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Instance, StatusError>> {
        Box::pin(async move {
            if !self.has_vm(namespace, name) {
                return Err(StatusError::not_found(VM_RESOURCE, name));
            }
            self.instance(namespace, name)
                .ok_or_else(|| StatusError::conflict(VM_RESOURCE, name, "VMI is not started"))
        })
    }
}

fn read_file(path: &Path) -> anyhow::Result<InventoryFile> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading inventory {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing inventory {}", path.display()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
