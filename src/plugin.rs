//! Plugin registry
//!
//! Tracks loaded source providers by runtime id, GUID and filename key, and
//! keeps the detection order used to pick a provider for a bare locator.
//! Actually obtaining a provider from an identifier is delegated to a
//! `PluginLoader`.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{MergeFsError, Result};
use crate::handle::{PluginId, SlotMap};
use crate::last_error::RecordLastError;
use crate::source::archive::ArchiveProvider;
use crate::source::local::LocalDirectoryProvider;
use crate::source::memory::MemoryProvider;
use crate::source::{PluginInfo, PluginType, SourceProvider, PLUGIN_INTERFACE_VERSION};

const BUILTIN_PREFIX: &str = "builtin:";

/// Capability-discovery collaborator: turns a plugin identifier into the
/// provider's capability table
pub trait PluginLoader: Send + Sync {
    fn discover(&self, identifier: &str) -> Result<Arc<dyn SourceProvider>>;
}

/// Lookup key derived from a plugin identifier: lowercase basename without
/// extension or trailing `_x86`/`_x64`
pub fn filename_key(identifier: &str) -> String {
    let name = identifier.strip_prefix(BUILTIN_PREFIX).unwrap_or(identifier);
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let mut key = base.to_lowercase();
    if let Some(dot) = key.rfind('.') {
        if dot > 0 {
            key.truncate(dot);
        }
    }
    for suffix in ["_x86", "_x64"] {
        if let Some(stripped) = key.strip_suffix(suffix) {
            key = stripped.to_string();
            break;
        }
    }
    key
}

/// Loader for the providers compiled into this crate
pub struct BuiltinLoader {
    memory: Arc<MemoryProvider>,
}

impl Default for BuiltinLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl BuiltinLoader {
    pub fn new() -> Self {
        Self {
            memory: Arc::new(MemoryProvider::new()),
        }
    }

    /// The memory provider handed out for `memory` identifiers, so callers
    /// can seed named volumes
    pub fn memory(&self) -> Arc<MemoryProvider> {
        self.memory.clone()
    }
}

impl PluginLoader for BuiltinLoader {
    fn discover(&self, identifier: &str) -> Result<Arc<dyn SourceProvider>> {
        match filename_key(identifier).as_str() {
            "local" | "localdir" => Ok(Arc::new(LocalDirectoryProvider)),
            "archive" | "zip" => Ok(Arc::new(ArchiveProvider::new()?)),
            "memory" | "null" | "nullfs" => Ok(self.memory.clone()),
            _ => Err(MergeFsError::PluginLoad(format!(
                "no plugin available for '{}'",
                identifier
            ))),
        }
    }
}

struct PluginRecord {
    info: PluginInfo,
    key: String,
    provider: Arc<dyn SourceProvider>,
    mount_refs: usize,
}

#[derive(Default)]
struct RegistryInner {
    plugins: SlotMap<PluginRecord>,
    /// Detection order, front first
    order: Vec<PluginId>,
}

impl RegistryInner {
    fn record(&self, id: PluginId) -> Result<&PluginRecord> {
        self.plugins
            .get(id.handle())
            .ok_or_else(|| MergeFsError::InvalidPluginId(id.to_string()))
    }
}

/// Registry of loaded source providers
pub struct PluginRegistry {
    loader: Arc<dyn PluginLoader>,
    inner: RwLock<RegistryInner>,
}

impl PluginRegistry {
    pub fn new(loader: Arc<dyn PluginLoader>) -> Self {
        Self {
            loader,
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Registry backed by the builtin providers
    pub fn with_builtins() -> Self {
        Self::new(Arc::new(BuiltinLoader::new()))
    }

    /// Load a plugin and append it to the detection order
    pub fn load(&self, path: &str) -> Result<PluginId> {
        self.load_with_position(path, false)
    }

    /// Load a plugin, inserting it at the front or back of the detection order
    pub fn load_with_position(&self, path: &str, front: bool) -> Result<PluginId> {
        self.load_inner(path, front, false).record_last_error()
    }

    /// With `reuse_existing`, a plugin whose GUID is already registered
    /// resolves to the registered id instead of failing
    fn load_inner(&self, path: &str, front: bool, reuse_existing: bool) -> Result<PluginId> {
        let provider = self.loader.discover(path)?;
        let mut info = provider.info();

        if info.plugin_type != PluginType::Source {
            return Err(MergeFsError::PluginLoad(format!(
                "{}: incompatible plugin type {:?}",
                path, info.plugin_type
            )));
        }
        if info.interface_version != PLUGIN_INTERFACE_VERSION {
            return Err(MergeFsError::PluginLoad(format!(
                "{}: interface version {} (engine speaks {})",
                path, info.interface_version, PLUGIN_INTERFACE_VERSION
            )));
        }
        info.origin = path.to_string();

        let mut inner = self.inner.write();
        let existing = inner
            .plugins
            .iter()
            .find(|(_, record)| record.info.guid == info.guid)
            .map(|(handle, _)| PluginId::from(handle));
        if let Some(id) = existing {
            if reuse_existing {
                debug!("Plugin {} already loaded as {}", info.name, id);
                return Ok(id);
            }
            return Err(MergeFsError::AlreadyExists(format!(
                "plugin {} ({})",
                info.name, info.guid
            )));
        }

        let name = info.name.clone();
        let guid = info.guid;
        let id = PluginId::from(inner.plugins.insert(PluginRecord {
            info,
            key: filename_key(path),
            provider,
            mount_refs: 0,
        }));
        if front {
            inner.order.insert(0, id);
        } else {
            inner.order.push(id);
        }
        info!("Loaded plugin {} ({}) as {}", name, guid, id);
        Ok(id)
    }

    /// Unload a plugin; fails while any mount holds a reference
    pub fn unload(&self, id: PluginId) -> Result<()> {
        self.unload_inner(id).record_last_error()
    }

    fn unload_inner(&self, id: PluginId) -> Result<()> {
        let mut inner = self.inner.write();
        let refs = inner.record(id)?.mount_refs;
        if refs > 0 {
            return Err(MergeFsError::ResourceBusy(format!(
                "plugin {} referenced by {} source(s)",
                id, refs
            )));
        }
        inner.plugins.remove(id.handle());
        inner.order.retain(|p| *p != id);
        info!("Unloaded plugin {}", id);
        Ok(())
    }

    pub fn describe(&self, id: PluginId) -> Result<PluginInfo> {
        let inner = self.inner.read();
        inner
            .record(id)
            .map(|record| record.info.clone())
            .record_last_error()
    }

    /// Loaded plugins in detection order
    pub fn list(&self) -> Vec<(PluginId, PluginInfo)> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.record(*id).ok().map(|r| (*id, r.info.clone())))
            .collect()
    }

    pub fn find_by_guid(&self, guid: &Uuid) -> Option<PluginId> {
        let inner = self.inner.read();
        let found = inner
            .plugins
            .iter()
            .find(|(_, record)| record.info.guid == *guid)
            .map(|(handle, _)| PluginId::from(handle));
        found
    }

    /// Find by filename key of `name_or_path`, or by declared plugin name
    pub fn find_by_name(&self, name_or_path: &str) -> Option<PluginId> {
        let key = filename_key(name_or_path);
        let inner = self.inner.read();
        let found = inner
            .plugins
            .iter()
            .find(|(_, record)| record.key == key || record.info.name.to_lowercase() == key)
            .map(|(handle, _)| PluginId::from(handle));
        found
    }

    /// Replace the detection order; `ids` must be a permutation of the loaded plugins
    pub fn set_order(&self, ids: &[PluginId]) -> Result<()> {
        self.set_order_inner(ids).record_last_error()
    }

    fn set_order_inner(&self, ids: &[PluginId]) -> Result<()> {
        let mut inner = self.inner.write();
        let unique: HashSet<PluginId> = ids.iter().copied().collect();
        if unique.len() != ids.len() || ids.len() != inner.plugins.len() {
            return Err(MergeFsError::InvalidArgument(
                "plugin order must list every loaded plugin exactly once".to_string(),
            ));
        }
        if let Some(bad) = ids.iter().find(|id| !inner.plugins.contains(id.handle())) {
            return Err(MergeFsError::InvalidPluginId(bad.to_string()));
        }
        inner.order = ids.to_vec();
        debug!("Plugin detection order set to {:?}", inner.order);
        Ok(())
    }

    /// First plugin in detection order that recognizes `locator`
    pub fn detect(&self, locator: &str) -> Option<PluginId> {
        let inner = self.inner.read();
        inner.order.iter().copied().find(|id| {
            inner
                .record(*id)
                .map(|r| r.provider.supports(locator))
                .unwrap_or(false)
        })
    }

    /// Resolve a descriptor's plugin reference (GUID, name or path), loading
    /// it on demand. `None` auto-detects from the locator.
    pub fn resolve(&self, reference: Option<&str>, locator: &str) -> Result<PluginId> {
        let Some(reference) = reference else {
            return self.detect(locator).ok_or_else(|| {
                MergeFsError::SourceInit(format!("no plugin recognizes '{}'", locator))
            });
        };
        if let Ok(guid) = Uuid::parse_str(reference) {
            return self.find_by_guid(&guid).ok_or_else(|| {
                MergeFsError::SourceInit(format!("no loaded plugin with GUID {}", guid))
            });
        }
        if let Some(id) = self.find_by_name(reference) {
            return Ok(id);
        }
        debug!("Plugin '{}' not loaded, loading on demand", reference);
        // A concurrent resolve may register the same plugin first
        self.load_inner(reference, false, true).record_last_error()
    }

    /// Take a mount reference on a plugin and return its provider
    pub fn acquire(&self, id: PluginId) -> Result<Arc<dyn SourceProvider>> {
        let mut inner = self.inner.write();
        let record = inner
            .plugins
            .get_mut(id.handle())
            .ok_or_else(|| MergeFsError::InvalidPluginId(id.to_string()))?;
        record.mount_refs += 1;
        Ok(record.provider.clone())
    }

    /// Drop a mount reference taken with `acquire`
    pub fn release(&self, id: PluginId) {
        let mut inner = self.inner.write();
        match inner.plugins.get_mut(id.handle()) {
            Some(record) if record.mount_refs > 0 => record.mount_refs -= 1,
            Some(_) => warn!("Release of unreferenced plugin {}", id),
            None => warn!("Release of unknown plugin {}", id),
        }
    }

    pub fn ref_count(&self, id: PluginId) -> Option<usize> {
        self.inner
            .read()
            .plugins
            .get(id.handle())
            .map(|r| r.mount_refs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::last_error::get_last_error;
    use crate::error::codes;
    use crate::path::VPath;
    use crate::source::{DirEntryStream, Source, SourceOptions};
    use async_trait::async_trait;
    use bytes::Bytes;

    struct FakeProvider {
        info: PluginInfo,
    }

    struct NoSource;

    #[async_trait]
    impl Source for NoSource {
        fn capabilities(&self) -> crate::source::Capabilities {
            crate::source::Capabilities::read_only()
        }
        fn locator(&self) -> String {
            String::new()
        }
        async fn stat(&self, path: &VPath) -> Result<crate::source::Metadata> {
            Err(MergeFsError::NotFound(path.to_string()))
        }
        fn list_dir(&self, _path: &VPath) -> DirEntryStream {
            Box::pin(futures::stream::empty())
        }
        async fn read(&self, path: &VPath, _offset: u64, _size: u32) -> Result<Bytes> {
            Err(MergeFsError::NotFound(path.to_string()))
        }
    }

    #[async_trait]
    impl SourceProvider for FakeProvider {
        fn info(&self) -> PluginInfo {
            self.info.clone()
        }
        fn supports(&self, locator: &str) -> bool {
            locator.starts_with(&self.info.name)
        }
        async fn instantiate(&self, _: &str, _: &SourceOptions) -> Result<Arc<dyn Source>> {
            Ok(Arc::new(NoSource))
        }
    }

    /// Loader serving fakes whose identity is derived from the identifier
    struct FakeLoader;

    impl PluginLoader for FakeLoader {
        fn discover(&self, identifier: &str) -> Result<Arc<dyn SourceProvider>> {
            let key = filename_key(identifier);
            let mut info = PluginInfo::source(
                Uuid::from_u128(key.len() as u128),
                &key,
                "fake",
                1,
            );
            if key.starts_with("oldver") {
                info.interface_version = 1;
            }
            if key.starts_with("other") {
                info.plugin_type = PluginType::Other(7);
            }
            Ok(Arc::new(FakeProvider { info }))
        }
    }

    fn fake_registry() -> PluginRegistry {
        PluginRegistry::new(Arc::new(FakeLoader))
    }

    #[test]
    fn test_filename_key() {
        assert_eq!(filename_key("/opt/plugins/Archive_x64.so"), "archive");
        assert_eq!(filename_key("C:\\plugins\\MFPSLocal_x86.dll"), "mfpslocal");
        assert_eq!(filename_key("builtin:local"), "local");
        assert_eq!(filename_key("memory"), "memory");
    }

    #[test]
    fn test_load_validates_capability_table() {
        let registry = fake_registry();
        let err = registry.load("oldver").unwrap_err();
        assert!(matches!(err, MergeFsError::PluginLoad(_)));
        assert_eq!(get_last_error(), (codes::INCOMPATIBLE_PLUGIN, false));

        let err = registry.load("other").unwrap_err();
        assert!(matches!(err, MergeFsError::PluginLoad(_)));
        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_duplicate_guid_rejected() {
        let registry = fake_registry();
        registry.load("/a/abc.so").unwrap();
        // Same key length => same fake GUID
        let err = registry.load("xyz").unwrap_err();
        assert!(matches!(err, MergeFsError::AlreadyExists(_)));
    }

    #[test]
    fn test_detection_order_front_and_back() {
        let registry = fake_registry();
        let a = registry.load("a").unwrap();
        let bb = registry.load("bb").unwrap();
        let ccc = registry.load_with_position("ccc", true).unwrap();
        let order: Vec<PluginId> = registry.list().into_iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec![ccc, a, bb]);

        registry.set_order(&[bb, a, ccc]).unwrap();
        let order: Vec<PluginId> = registry.list().into_iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec![bb, a, ccc]);

        assert!(registry.set_order(&[bb, a]).is_err());
        assert!(registry.set_order(&[bb, a, a]).is_err());
    }

    #[test]
    fn test_detect_and_find() {
        let registry = fake_registry();
        let a = registry.load("/x/alpha_x64.so").unwrap();
        let b = registry.load("beta").unwrap();
        assert_eq!(registry.detect("beta://thing"), Some(b));
        assert_eq!(registry.detect("gamma://thing"), None);
        assert_eq!(registry.find_by_name("ALPHA"), Some(a));
        let guid = registry.describe(a).unwrap().guid;
        assert_eq!(registry.find_by_guid(&guid), Some(a));
        assert_eq!(registry.describe(a).unwrap().origin, "/x/alpha_x64.so");
    }

    #[test]
    fn test_unload_blocked_by_mount_refs() {
        let registry = fake_registry();
        let id = registry.load("a").unwrap();
        registry.acquire(id).unwrap();
        assert!(matches!(
            registry.unload(id),
            Err(MergeFsError::ResourceBusy(_))
        ));
        registry.release(id);
        registry.unload(id).unwrap();
        assert!(matches!(
            registry.describe(id),
            Err(MergeFsError::InvalidPluginId(_))
        ));
    }

    #[test]
    fn test_stale_id_after_reload() {
        let registry = fake_registry();
        let first = registry.load("a").unwrap();
        registry.unload(first).unwrap();
        let second = registry.load("a").unwrap();
        assert_ne!(first, second);
        assert!(registry.describe(first).is_err());
    }

    #[test]
    fn test_resolve_loads_on_demand() {
        let registry = PluginRegistry::with_builtins();
        let id = registry.resolve(Some("builtin:memory"), "mem:x").unwrap();
        assert_eq!(registry.resolve(Some("memory"), "mem:y").unwrap(), id);
        assert_eq!(registry.resolve(None, "mem:z").unwrap(), id);
        assert!(matches!(
            registry.resolve(None, "ftp://nowhere"),
            Err(MergeFsError::SourceInit(_))
        ));
    }

    /// Loader whose discovery blocks until both racing callers are inside it
    struct RendezvousLoader {
        barrier: std::sync::Barrier,
    }

    impl PluginLoader for RendezvousLoader {
        fn discover(&self, identifier: &str) -> Result<Arc<dyn SourceProvider>> {
            self.barrier.wait();
            FakeLoader.discover(identifier)
        }
    }

    #[test]
    fn test_concurrent_resolve_loads_once() {
        let registry = Arc::new(PluginRegistry::new(Arc::new(RendezvousLoader {
            barrier: std::sync::Barrier::new(2),
        })));
        let workers: Vec<_> = (0..2)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.resolve(Some("shared"), "shared://x"))
            })
            .collect();
        let ids: Vec<PluginId> = workers
            .into_iter()
            .map(|w| w.join().unwrap().unwrap())
            .collect();
        assert_eq!(ids[0], ids[1]);
        assert_eq!(registry.list().len(), 1);

        // Explicit loads still refuse a duplicate
        let registry = fake_registry();
        registry.load("shared").unwrap();
        assert!(matches!(
            registry.load("shared"),
            Err(MergeFsError::AlreadyExists(_))
        ));
    }
}
