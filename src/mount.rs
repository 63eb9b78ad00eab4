//! Mount management and lifecycle
//!
//! A mount moves through `Requested -> Building -> Active -> Unmounting ->
//! Closed`; any failure while building ends in `Failed` with every partial
//! resource released. Its id only shows up in `list_mounts` once Active.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

use crate::error::{MergeFsError, Result};
use crate::handle::{MountId, PluginId, SlotMap};
use crate::last_error::RecordLastError;
use crate::overlay::{DeferredCopyOverlay, OverlayPolicy};
use crate::path::VPath;
use crate::plugin::{filename_key, PluginRegistry};
use crate::resolver::{Owner, PathResolver};
use crate::source::{DirEntry, FileType, Metadata};
use crate::stack::{instantiate_layer, SourceDescriptor, SourceStack};

/// Lifecycle state of a mount
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Requested,
    Building,
    Active,
    Unmounting,
    Closed,
    Failed,
}

impl fmt::Display for MountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MountState::Requested => "requested",
            MountState::Building => "building",
            MountState::Active => "active",
            MountState::Unmounting => "unmounting",
            MountState::Closed => "closed",
            MountState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Per-mount options
#[derive(Debug, Clone)]
pub struct MountOptions {
    pub mount_point: PathBuf,
    pub writable: bool,
    /// Required for writable mounts
    pub metadata_file: Option<PathBuf>,
    /// Overlay backing store; defaults to a local directory next to the
    /// metadata file
    pub overlay: Option<SourceDescriptor>,
    /// Copy up on first write rather than on open-for-write
    pub defer_copy: bool,
    pub case_sensitive: bool,
    pub policy: OverlayPolicy,
}

impl MountOptions {
    pub fn read_only(mount_point: impl Into<PathBuf>) -> Self {
        Self {
            mount_point: mount_point.into(),
            writable: false,
            metadata_file: None,
            overlay: None,
            defer_copy: true,
            case_sensitive: true,
            policy: OverlayPolicy::default(),
        }
    }

    pub fn writable(mount_point: impl Into<PathBuf>, metadata_file: impl Into<PathBuf>) -> Self {
        Self {
            writable: true,
            metadata_file: Some(metadata_file.into()),
            ..Self::read_only(mount_point)
        }
    }

    pub fn with_overlay(mut self, overlay: SourceDescriptor) -> Self {
        self.overlay = Some(overlay);
        self
    }

    pub fn case_insensitive(mut self) -> Self {
        self.case_sensitive = false;
        self
    }

    pub fn with_policy(mut self, policy: OverlayPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Overlay directory used when no backing store is configured
    pub fn default_overlay_dir(metadata_file: &Path) -> PathBuf {
        let mut name = metadata_file.as_os_str().to_owned();
        name.push(".overlay");
        PathBuf::from(name)
    }

    fn validate(&self, descriptors: &[SourceDescriptor]) -> Result<()> {
        if descriptors.is_empty() {
            return Err(MergeFsError::InvalidArgument(
                "a mount needs at least one source".to_string(),
            ));
        }
        if self.writable && self.metadata_file.is_none() {
            return Err(MergeFsError::InvalidArgument(format!(
                "writable mount {} needs a metadata file",
                self.mount_point.display()
            )));
        }
        Ok(())
    }
}

/// Snapshot of a mount's attributes
#[derive(Debug, Clone)]
pub struct MountInfo {
    pub id: MountId,
    pub mount_point: PathBuf,
    pub state: MountState,
    pub writable: bool,
    pub case_sensitive: bool,
    pub defer_copy: bool,
    /// Layer locators, front first
    pub layers: Vec<String>,
    pub metadata_file: Option<PathBuf>,
    pub copy_ups: u64,
    pub tombstones: usize,
    pub in_flight: usize,
}

/// The OS-facing side of a mount
pub trait OsHook: Send + Sync {
    /// The mount is Active and may start serving requests. An error rolls
    /// the mount back.
    fn mount_ready(&self, id: MountId, mount: Arc<Mount>) -> Result<()>;

    /// The mount is about to be torn down; stop routing new requests to it
    fn mount_unmounting(&self, id: MountId, mount_point: &Path);

    fn mount_closed(&self, _id: MountId) {}
}

/// Hook for embedders that drive `Mount` directly
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHook;

impl OsHook for NullHook {
    fn mount_ready(&self, id: MountId, mount: Arc<Mount>) -> Result<()> {
        debug!("{} ready at {}", id, mount.mount_point().display());
        Ok(())
    }

    fn mount_unmounting(&self, id: MountId, _mount_point: &Path) {
        debug!("{} unmounting", id);
    }
}

/// Decrements the in-flight counter when an operation ends
struct OpGuard<'a> {
    mount: &'a Mount,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        if self.mount.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.mount.drained.notify_waiters();
        }
    }
}

/// One mounted union filesystem
pub struct Mount {
    options: MountOptions,
    state: Mutex<MountState>,
    resolver: PathResolver,
    registry: Arc<PluginRegistry>,
    /// Plugin reference held by the overlay backing store
    backing_plugin: Mutex<Option<PluginId>>,
    in_flight: AtomicUsize,
    drained: Notify,
    /// Held by the unmount call that drains and closes the mount
    teardown: tokio::sync::Mutex<()>,
}

impl Mount {
    pub fn mount_point(&self) -> &Path {
        &self.options.mount_point
    }

    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    pub fn state(&self) -> MountState {
        *self.state.lock()
    }

    pub fn is_writable(&self) -> bool {
        self.options.writable
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: MountState) {
        let mut current = self.state.lock();
        debug!(
            "{}: {} -> {}",
            self.options.mount_point.display(),
            *current,
            state
        );
        *current = state;
    }

    /// Register an operation; refused unless Active
    fn begin(&self) -> Result<OpGuard<'_>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = OpGuard { mount: self };
        match self.state() {
            MountState::Active => Ok(guard),
            MountState::Unmounting => Err(MergeFsError::Cancelled(format!(
                "{} is unmounting",
                self.options.mount_point.display()
            ))),
            other => Err(MergeFsError::InvalidMountId(format!(
                "{} is {}",
                self.options.mount_point.display(),
                other
            ))),
        }
    }

    fn overlay(&self) -> Result<&Arc<DeferredCopyOverlay>> {
        if !self.options.writable {
            return Err(MergeFsError::PermissionDenied(format!(
                "{} is mounted read-only",
                self.options.mount_point.display()
            )));
        }
        self.resolver.overlay().ok_or_else(|| {
            MergeFsError::PermissionDenied(self.options.mount_point.display().to_string())
        })
    }

    /// Wait for in-flight operations to finish
    async fn drain(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.in_flight() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    fn release_resources(&self) {
        self.resolver.stack().release();
        if let Some(id) = self.backing_plugin.lock().take() {
            self.registry.release(id);
        }
    }

    /// Flush and compact the overlay, then drop every plugin reference
    async fn close(&self) -> Result<()> {
        let flushed = match self.resolver.overlay() {
            Some(overlay) => overlay.shutdown(true).await,
            None => Ok(()),
        };
        self.release_resources();
        self.set_state(MountState::Closed);
        flushed
    }

    pub async fn stat(&self, path: &VPath) -> Result<Metadata> {
        let _op = self.begin().record_last_error()?;
        trace!("stat: {}", path);
        self.resolver
            .resolve(path)
            .await
            .map(|r| r.metadata)
            .record_last_error()
    }

    pub async fn list_dir(&self, path: &VPath) -> Result<Vec<DirEntry>> {
        let _op = self.begin().record_last_error()?;
        trace!("list_dir: {}", path);
        self.resolver.list_dir(path).await.record_last_error()
    }

    pub async fn owning_layer(&self, path: &VPath) -> Result<Owner> {
        let _op = self.begin().record_last_error()?;
        self.resolver.owning_layer(path).await.record_last_error()
    }

    pub async fn read(&self, path: &VPath, offset: u64, size: u32) -> Result<Bytes> {
        let _op = self.begin().record_last_error()?;
        trace!("read: {} offset={} size={}", path, offset, size);
        self.read_inner(path, offset, size).await.record_last_error()
    }

    async fn read_inner(&self, path: &VPath, offset: u64, size: u32) -> Result<Bytes> {
        let resolved = self.resolver.resolve(path).await?;
        if resolved.metadata.is_dir() {
            return Err(MergeFsError::IsADirectory(path.to_string()));
        }
        match resolved.owner {
            Owner::Overlay => {
                let overlay = self
                    .resolver
                    .overlay()
                    .ok_or_else(|| MergeFsError::NotFound(path.to_string()))?;
                overlay.backing().read(&resolved.location, offset, size).await
            }
            Owner::Layer(index) => {
                let source = self
                    .resolver
                    .stack()
                    .source(index)
                    .ok_or_else(|| MergeFsError::NotFound(path.to_string()))?;
                source.read(&resolved.location, offset, size).await
            }
        }
    }

    /// Called when a file is opened for writing. Copies up right away
    /// unless the mount defers copies to the first write.
    pub async fn prepare_write(&self, path: &VPath) -> Result<()> {
        let _op = self.begin().record_last_error()?;
        if self.options.defer_copy {
            return self.overlay().map(|_| ()).record_last_error();
        }
        async {
            let overlay = self.overlay()?;
            if self.resolver.resolve(path).await?.metadata.is_dir() {
                return Err(MergeFsError::IsADirectory(path.to_string()));
            }
            overlay.ensure_writable(&self.resolver, path).await.map(|_| ())
        }
        .await
        .record_last_error()
    }

    pub async fn write(&self, path: &VPath, offset: u64, data: &[u8]) -> Result<u64> {
        let _op = self.begin().record_last_error()?;
        trace!("write: {} offset={} size={}", path, offset, data.len());
        async {
            self.overlay()?
                .write(&self.resolver, path, offset, data)
                .await
        }
        .await
        .record_last_error()
    }

    pub async fn create_file(&self, path: &VPath, mode: u32) -> Result<()> {
        let _op = self.begin().record_last_error()?;
        async {
            self.overlay()?
                .create(&self.resolver, path, FileType::File, mode)
                .await
        }
        .await
        .record_last_error()
    }

    pub async fn create_dir(&self, path: &VPath, mode: u32) -> Result<()> {
        let _op = self.begin().record_last_error()?;
        async {
            self.overlay()?
                .create(&self.resolver, path, FileType::Directory, mode)
                .await
        }
        .await
        .record_last_error()
    }

    pub async fn remove_file(&self, path: &VPath) -> Result<()> {
        let _op = self.begin().record_last_error()?;
        async { self.overlay()?.remove(&self.resolver, path, false).await }
            .await
            .record_last_error()
    }

    pub async fn remove_dir(&self, path: &VPath) -> Result<()> {
        let _op = self.begin().record_last_error()?;
        async { self.overlay()?.remove(&self.resolver, path, true).await }
            .await
            .record_last_error()
    }

    pub async fn rename(&self, from: &VPath, to: &VPath) -> Result<()> {
        let _op = self.begin().record_last_error()?;
        async { self.overlay()?.rename(&self.resolver, from, to).await }
            .await
            .record_last_error()
    }

    pub async fn truncate(&self, path: &VPath, size: u64) -> Result<()> {
        let _op = self.begin().record_last_error()?;
        async { self.overlay()?.truncate(&self.resolver, path, size).await }
            .await
            .record_last_error()
    }

    pub async fn set_attributes(
        &self,
        path: &VPath,
        mode: Option<u32>,
        mtime: Option<SystemTime>,
    ) -> Result<()> {
        let _op = self.begin().record_last_error()?;
        async {
            self.overlay()?
                .set_attributes(&self.resolver, path, mode, mtime)
                .await
        }
        .await
        .record_last_error()
    }

    /// Flush the overlay object and the metadata log. A no-op on
    /// read-only mounts.
    pub async fn flush(&self, path: &VPath) -> Result<()> {
        let _op = self.begin().record_last_error()?;
        match self.resolver.overlay() {
            Some(overlay) => overlay.flush(path).await.record_last_error(),
            None => Ok(()),
        }
    }

    fn info(&self, id: MountId) -> MountInfo {
        let overlay = self.resolver.overlay();
        MountInfo {
            id,
            mount_point: self.options.mount_point.clone(),
            state: self.state(),
            writable: self.options.writable,
            case_sensitive: self.options.case_sensitive,
            defer_copy: self.options.defer_copy,
            layers: self
                .resolver
                .stack()
                .layers()
                .iter()
                .map(|l| l.locator.clone())
                .collect(),
            metadata_file: self.options.metadata_file.clone(),
            copy_ups: overlay.map(|o| o.copy_up_count()).unwrap_or(0),
            tombstones: overlay.map(|o| o.tombstone_count()).unwrap_or(0),
            in_flight: self.in_flight(),
        }
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        self.release_resources();
    }
}

/// Mount manager - handles lifecycle of all mounts
pub struct MountManager {
    registry: Arc<PluginRegistry>,
    hook: Arc<dyn OsHook>,
    mounts: Mutex<SlotMap<Arc<Mount>>>,
}

impl MountManager {
    pub fn new(registry: Arc<PluginRegistry>, hook: Arc<dyn OsHook>) -> Self {
        Self {
            registry,
            hook,
            mounts: Mutex::new(SlotMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Build and activate a mount over `descriptors`
    pub async fn mount(
        &self,
        descriptors: &[SourceDescriptor],
        options: MountOptions,
    ) -> Result<MountId> {
        self.mount_inner(descriptors, options)
            .await
            .record_last_error()
    }

    async fn mount_inner(
        &self,
        descriptors: &[SourceDescriptor],
        options: MountOptions,
    ) -> Result<MountId> {
        info!("Mounting at {:?}", options.mount_point);
        let mut state = MountState::Requested;
        options.validate(descriptors)?;

        debug!("{:?}: {} -> building", options.mount_point, state);
        state = MountState::Building;
        let stack = Arc::new(SourceStack::build(&self.registry, descriptors).await?);

        let (overlay, backing_plugin) = if options.writable {
            match self.attach_overlay(&options).await {
                Ok((overlay, plugin)) => (Some(Arc::new(overlay)), Some(plugin)),
                Err(e) => {
                    warn!(
                        "{:?}: {} -> failed: {}",
                        options.mount_point, state, e
                    );
                    return Err(e);
                }
            }
        } else {
            (None, None)
        };

        let resolver = PathResolver::new(stack, overlay, options.case_sensitive);
        let mount = Arc::new(Mount {
            options,
            state: Mutex::new(state),
            resolver,
            registry: self.registry.clone(),
            backing_plugin: Mutex::new(backing_plugin),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            teardown: tokio::sync::Mutex::new(()),
        });

        let id = MountId::from(self.mounts.lock().insert(mount.clone()));
        mount.set_state(MountState::Active);
        if let Err(e) = self.hook.mount_ready(id, mount.clone()) {
            warn!("OS hook rejected {}: {}", id, e);
            mount.set_state(MountState::Failed);
            self.mounts.lock().remove(id.handle());
            mount.release_resources();
            return Err(e);
        }

        info!("Mounted {} at {:?}", id, mount.mount_point());
        Ok(id)
    }

    /// Instantiate the backing store and attach the overlay to it
    async fn attach_overlay(
        &self,
        options: &MountOptions,
    ) -> Result<(DeferredCopyOverlay, PluginId)> {
        let metadata_file = options.metadata_file.as_deref().ok_or_else(|| {
            MergeFsError::InvalidArgument("writable mount needs a metadata file".to_string())
        })?;
        let descriptor = match &options.overlay {
            Some(configured) => {
                let mut descriptor = configured.clone();
                let names_local = descriptor
                    .plugin
                    .as_deref()
                    .is_some_and(|p| matches!(filename_key(p).as_str(), "local" | "localdir"));
                let unclaimed_dir = descriptor.plugin.is_none()
                    && Path::new(&descriptor.locator).is_absolute()
                    && self.registry.detect(&descriptor.locator).is_none();
                if names_local || unclaimed_dir {
                    tokio::fs::create_dir_all(&descriptor.locator).await?;
                    descriptor.plugin.get_or_insert_with(|| "local".to_string());
                }
                descriptor
            }
            None => {
                let dir = MountOptions::default_overlay_dir(metadata_file);
                tokio::fs::create_dir_all(&dir).await?;
                SourceDescriptor::new(dir.to_string_lossy()).with_plugin("local")
            }
        };

        let layer = instantiate_layer(&self.registry, &descriptor).await?;
        let registry = self.registry.clone();
        let acquired = scopeguard::guard(layer.plugin, move |id| registry.release(id));
        let overlay = DeferredCopyOverlay::attach(
            layer.source,
            metadata_file,
            options.case_sensitive,
            options.policy.clone(),
        )
        .await?;
        Ok((overlay, scopeguard::ScopeGuard::into_inner(acquired)))
    }

    /// Look up a mount that has not been closed
    pub fn get(&self, id: MountId) -> Result<Arc<Mount>> {
        self.mounts
            .lock()
            .get(id.handle())
            .cloned()
            .ok_or_else(|| MergeFsError::InvalidMountId(id.to_string()))
            .record_last_error()
    }

    /// Forced unmount: cancel in-flight copy-ups and wait for the drain
    pub async fn unmount(&self, id: MountId) -> Result<()> {
        self.unmount_with(id, false).await.record_last_error()
    }

    /// Refuses with `ResourceBusy` while operations are in flight
    pub async fn safe_unmount(&self, id: MountId) -> Result<()> {
        self.unmount_with(id, true).await.record_last_error()
    }

    async fn unmount_with(&self, id: MountId, safe: bool) -> Result<()> {
        let mount = self.get(id)?;
        if safe && mount.in_flight() > 0 {
            return Err(MergeFsError::ResourceBusy(format!(
                "{} has {} operation(s) in flight",
                id,
                mount.in_flight()
            )));
        }

        let first_attempt = {
            let mut state = mount.state.lock();
            match *state {
                MountState::Active => {
                    *state = MountState::Unmounting;
                    true
                }
                MountState::Unmounting => false,
                other => {
                    return Err(MergeFsError::InvalidMountId(format!("{} is {}", id, other)))
                }
            }
        };
        if first_attempt {
            info!("Unmounting {} at {:?}", id, mount.mount_point());
            self.hook.mount_unmounting(id, mount.mount_point());
            if let Some(overlay) = mount.resolver.overlay() {
                overlay.cancel();
            }
        }

        // Concurrent unmounts wait here; only one of them closes the mount
        let _teardown = mount.teardown.lock().await;
        if mount.state() == MountState::Closed {
            debug!("{} already closed by a concurrent unmount", id);
            return Ok(());
        }

        let timeout = mount.options.policy.drain_timeout;
        if !mount.drain(timeout).await {
            warn!(
                "{}: {} operation(s) still in flight after {:?}",
                id,
                mount.in_flight(),
                timeout
            );
            return Err(MergeFsError::ResourceBusy(format!(
                "{} did not drain within {:?}",
                id, timeout
            )));
        }

        let closed = mount.close().await;
        self.mounts.lock().remove(id.handle());
        self.hook.mount_closed(id);
        match &closed {
            Ok(()) => info!("Unmounted {}", id),
            Err(e) => warn!("Unmounted {} with error: {}", id, e),
        }
        closed
    }

    /// Best-effort forced unmount of every mount; reports the last failure
    pub async fn unmount_all(&self) -> Result<()> {
        self.unmount_all_with(false).await.record_last_error()
    }

    pub async fn safe_unmount_all(&self) -> Result<()> {
        self.unmount_all_with(true).await.record_last_error()
    }

    async fn unmount_all_with(&self, safe: bool) -> Result<()> {
        info!("Unmounting all filesystems");
        let ids: Vec<MountId> = self
            .mounts
            .lock()
            .iter()
            .map(|(handle, _)| MountId::from(handle))
            .collect();
        let mut last = Ok(());
        for id in ids {
            if let Err(e) = self.unmount_with(id, safe).await {
                warn!("Failed to unmount {}: {}", id, e);
                last = Err(e);
            }
        }
        last
    }

    /// Ids of mounts that are Active or Unmounting
    pub fn list_mounts(&self) -> Vec<MountId> {
        self.mounts
            .lock()
            .iter()
            .filter(|(_, m)| matches!(m.state(), MountState::Active | MountState::Unmounting))
            .map(|(handle, _)| MountId::from(handle))
            .collect()
    }

    pub fn describe(&self, id: MountId) -> Result<MountInfo> {
        self.get(id).map(|m| m.info(id))
    }

    /// Number of tracked mounts
    pub fn count(&self) -> usize {
        self.mounts.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::last_error;
    use crate::plugin::{BuiltinLoader, PluginLoader};
    use crate::source::memory::MemoryProvider;
    use tempfile::TempDir;

    struct RejectingHook;

    impl OsHook for RejectingHook {
        fn mount_ready(&self, _id: MountId, _mount: Arc<Mount>) -> Result<()> {
            Err(MergeFsError::NotSupported("no kernel here".to_string()))
        }

        fn mount_unmounting(&self, _id: MountId, _mount_point: &Path) {}
    }

    fn setup(hook: Arc<dyn OsHook>) -> (MountManager, Arc<MemoryProvider>) {
        let loader = Arc::new(BuiltinLoader::new());
        let memory = loader.memory();
        let registry = Arc::new(PluginRegistry::new(loader as Arc<dyn PluginLoader>));
        (MountManager::new(registry, hook), memory)
    }

    fn mem(name: &str) -> SourceDescriptor {
        SourceDescriptor::new(format!("mem:{}", name)).with_plugin("memory")
    }

    fn vp(s: &str) -> VPath {
        VPath::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_mount_lifecycle() {
        let (manager, memory) = setup(Arc::new(NullHook));
        memory.volume("a").insert_file("/hello.txt", b"hi").unwrap();

        let id = manager
            .mount(&[mem("a")], MountOptions::read_only("/mnt/a"))
            .await
            .unwrap();
        assert_eq!(manager.list_mounts(), vec![id]);
        let info = manager.describe(id).unwrap();
        assert_eq!(info.state, MountState::Active);
        assert_eq!(info.layers, vec!["mem:a"]);

        let mount = manager.get(id).unwrap();
        let data = mount.read(&vp("/hello.txt"), 0, 16).await.unwrap();
        assert_eq!(&data[..], b"hi");

        manager.unmount(id).await.unwrap();
        assert!(manager.list_mounts().is_empty());
        assert_eq!(mount.state(), MountState::Closed);
        assert!(manager.describe(id).is_err());
        assert!(mount.stat(&vp("/hello.txt")).await.is_err());
    }

    #[tokio::test]
    async fn test_read_only_mount_rejects_mutation() {
        let (manager, memory) = setup(Arc::new(NullHook));
        memory.volume("ro").insert_file("/f", b"x").unwrap();
        let id = manager
            .mount(&[mem("ro")], MountOptions::read_only("/mnt/ro"))
            .await
            .unwrap();
        let mount = manager.get(id).unwrap();

        let err = mount.write(&vp("/f"), 0, b"y").await.unwrap_err();
        assert!(matches!(err, MergeFsError::PermissionDenied(_)));
        assert_eq!(
            last_error::get_last_error(),
            (crate::error::codes::ACCESS_DENIED, false)
        );
        assert!(mount.create_file(&vp("/g"), 0o644).await.is_err());
        assert!(mount.remove_file(&vp("/f")).await.is_err());
    }

    #[tokio::test]
    async fn test_writable_mount_requires_metadata_file() {
        let (manager, _) = setup(Arc::new(NullHook));
        let mut options = MountOptions::read_only("/mnt/w");
        options.writable = true;
        let err = manager.mount(&[mem("w")], options).await.unwrap_err();
        assert!(matches!(err, MergeFsError::InvalidArgument(_)));
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn test_hook_failure_rolls_back() {
        let (manager, _) = setup(Arc::new(RejectingHook));
        let err = manager
            .mount(&[mem("x")], MountOptions::read_only("/mnt/x"))
            .await
            .unwrap_err();
        assert!(matches!(err, MergeFsError::NotSupported(_)));
        assert_eq!(manager.count(), 0);

        let plugin = manager.registry().find_by_name("memory").unwrap();
        assert_eq!(manager.registry().ref_count(plugin), Some(0));
    }

    #[tokio::test]
    async fn test_failed_source_leaves_no_mount() {
        let (manager, _) = setup(Arc::new(NullHook));
        let descriptors = vec![
            mem("ok"),
            SourceDescriptor::new("/definitely/not/here").with_plugin("local"),
        ];
        let err = manager
            .mount(&descriptors, MountOptions::read_only("/mnt/bad"))
            .await
            .unwrap_err();
        assert!(matches!(err, MergeFsError::SourceInit(_)));
        assert!(manager.list_mounts().is_empty());
    }

    #[tokio::test]
    async fn test_default_overlay_dir_is_created() {
        let dir = TempDir::new().unwrap();
        let (manager, memory) = setup(Arc::new(NullHook));
        memory.volume("base").insert_file("/a.txt", b"base").unwrap();
        let log = dir.path().join("m.log");

        let id = manager
            .mount(&[mem("base")], MountOptions::writable("/mnt/w", &log))
            .await
            .unwrap();
        let mount = manager.get(id).unwrap();
        mount.write(&vp("/a.txt"), 0, b"BASE").await.unwrap();

        let overlay_dir = MountOptions::default_overlay_dir(&log);
        assert_eq!(std::fs::read(overlay_dir.join("a.txt")).unwrap(), b"BASE");
        assert_eq!(memory.volume("base").contents("/a.txt").unwrap(), b"base");
        manager.unmount(id).await.unwrap();
        assert!(log.exists());
    }

    #[tokio::test]
    async fn test_ids_are_not_reused() {
        let (manager, _) = setup(Arc::new(NullHook));
        let first = manager
            .mount(&[mem("r")], MountOptions::read_only("/mnt/r"))
            .await
            .unwrap();
        manager.unmount(first).await.unwrap();
        let second = manager
            .mount(&[mem("r")], MountOptions::read_only("/mnt/r"))
            .await
            .unwrap();
        assert_ne!(first, second);
        assert!(manager.unmount(first).await.is_err());
        assert_eq!(
            last_error::get_last_error().0,
            crate::error::codes::INVALID_MOUNT_ID
        );
    }

    #[tokio::test]
    async fn test_safe_unmount_refuses_while_busy() {
        let (manager, _) = setup(Arc::new(NullHook));
        let id = manager
            .mount(&[mem("busy")], MountOptions::read_only("/mnt/busy"))
            .await
            .unwrap();
        let mount = manager.get(id).unwrap();

        let op = mount.begin().unwrap();
        let err = manager.safe_unmount(id).await.unwrap_err();
        assert!(matches!(err, MergeFsError::ResourceBusy(_)));
        assert_eq!(mount.state(), MountState::Active);
        drop(op);

        manager.safe_unmount(id).await.unwrap();
        assert_eq!(mount.state(), MountState::Closed);
    }

    #[tokio::test]
    async fn test_forced_unmount_times_out_then_retries() {
        let (manager, _) = setup(Arc::new(NullHook));
        let policy = OverlayPolicy {
            drain_timeout: Duration::from_millis(50),
            ..OverlayPolicy::default()
        };
        let id = manager
            .mount(
                &[mem("slow")],
                MountOptions::read_only("/mnt/slow").with_policy(policy),
            )
            .await
            .unwrap();
        let mount = manager.get(id).unwrap();

        let op = mount.begin().unwrap();
        let err = manager.unmount(id).await.unwrap_err();
        assert!(matches!(err, MergeFsError::ResourceBusy(_)));
        assert_eq!(mount.state(), MountState::Unmounting);
        assert!(matches!(
            mount.stat(&VPath::root()).await,
            Err(MergeFsError::Cancelled(_))
        ));
        drop(op);

        manager.unmount(id).await.unwrap();
        assert_eq!(mount.state(), MountState::Closed);
    }

    #[tokio::test]
    async fn test_unmount_all_reports_last_failure() {
        let (manager, _) = setup(Arc::new(NullHook));
        let a = manager
            .mount(&[mem("u1")], MountOptions::read_only("/mnt/u1"))
            .await
            .unwrap();
        let b = manager
            .mount(&[mem("u2")], MountOptions::read_only("/mnt/u2"))
            .await
            .unwrap();
        let busy = manager.get(b).unwrap();
        let op = busy.begin().unwrap();

        let err = manager.safe_unmount_all().await.unwrap_err();
        assert!(matches!(err, MergeFsError::ResourceBusy(_)));
        assert_eq!(manager.list_mounts(), vec![b]);
        assert!(manager.describe(a).is_err());
        drop(op);

        manager.unmount_all().await.unwrap();
        assert!(manager.list_mounts().is_empty());
    }

    #[derive(Default)]
    struct CountingHook {
        unmounting: AtomicUsize,
        closed: AtomicUsize,
    }

    impl OsHook for CountingHook {
        fn mount_ready(&self, _id: MountId, _mount: Arc<Mount>) -> Result<()> {
            Ok(())
        }

        fn mount_unmounting(&self, _id: MountId, _mount_point: &Path) {
            self.unmounting.fetch_add(1, Ordering::SeqCst);
        }

        fn mount_closed(&self, _id: MountId) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_concurrent_unmounts_close_once() {
        let dir = TempDir::new().unwrap();
        let hook = Arc::new(CountingHook::default());
        let (manager, memory) = setup(hook.clone());
        memory.volume("twice").insert_file("/f", b"x").unwrap();
        let log = dir.path().join("twice.log");
        let id = manager
            .mount(&[mem("twice")], MountOptions::writable("/mnt/twice", &log))
            .await
            .unwrap();
        let mount = manager.get(id).unwrap();
        mount.write(&vp("/f"), 0, b"y").await.unwrap();

        let (first, second) = tokio::join!(manager.unmount(id), manager.unmount(id));
        first.unwrap();
        second.unwrap();
        assert_eq!(hook.unmounting.load(Ordering::SeqCst), 1);
        assert_eq!(hook.closed.load(Ordering::SeqCst), 1);
        assert_eq!(mount.state(), MountState::Closed);
        assert_eq!(manager.count(), 0);

        let plugin = manager.registry().find_by_name("memory").unwrap();
        assert_eq!(manager.registry().ref_count(plugin), Some(0));
    }

    #[tokio::test]
    async fn test_configured_overlay_dir_is_created() {
        let dir = TempDir::new().unwrap();
        let (manager, memory) = setup(Arc::new(NullHook));
        memory.volume("cfg").insert_file("/a.txt", b"cfg").unwrap();

        let named = dir.path().join("upper/named");
        let detected = dir.path().join("upper/detected");
        let mounts = [
            (
                "named",
                SourceDescriptor::new(named.to_string_lossy()).with_plugin("local"),
                named.clone(),
            ),
            (
                "detected",
                SourceDescriptor::new(detected.to_string_lossy()),
                detected.clone(),
            ),
        ];
        for (name, overlay, upper) in mounts {
            let options = MountOptions::writable(
                format!("/mnt/{}", name),
                dir.path().join(format!("{}.log", name)),
            )
            .with_overlay(overlay);
            let id = manager.mount(&[mem("cfg")], options).await.unwrap();
            let mount = manager.get(id).unwrap();
            mount.write(&vp("/a.txt"), 0, b"CFG").await.unwrap();
            assert_eq!(std::fs::read(upper.join("a.txt")).unwrap(), b"CFG");
            manager.unmount(id).await.unwrap();
        }
        assert_eq!(memory.volume("cfg").contents("/a.txt").unwrap(), b"cfg");
    }
}
