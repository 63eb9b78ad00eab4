//! Engine tests against the public API
//!
//! Mounts are driven through `NullHook`, so nothing here needs a kernel.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use mergefs::error::codes;
use mergefs::last_error::{self, get_last_error};
use mergefs::mount::{MountManager, MountOptions, NullHook};
use mergefs::overlay::metadata::MetadataStore;
use mergefs::overlay::{CopyUpRecord, OverlayEntry, Origin};
use mergefs::plugin::{BuiltinLoader, PluginLoader, PluginRegistry};
use mergefs::resolver::Owner;
use mergefs::source::memory::MemoryProvider;
use mergefs::source::FileType;
use mergefs::stack::{InsertPosition, SourceDescriptor};
use mergefs::{MergeFsError, MountId, VPath};
use tempfile::TempDir;

struct Harness {
    manager: MountManager,
    memory: Arc<MemoryProvider>,
    dir: TempDir,
}

impl Harness {
    fn new() -> Self {
        let loader = Arc::new(BuiltinLoader::new());
        let memory = loader.memory();
        let registry = Arc::new(PluginRegistry::new(loader as Arc<dyn PluginLoader>));
        Self {
            manager: MountManager::new(registry, Arc::new(NullHook)),
            memory,
            dir: TempDir::new().unwrap(),
        }
    }

    /// Local directory under the harness tempdir, seeded with `files`
    fn local_dir(&self, name: &str, files: &[(&str, &[u8])]) -> String {
        let root = self.dir.path().join(name);
        fs::create_dir_all(&root).unwrap();
        for (rel, data) in files {
            let path = root.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(path, data).unwrap();
        }
        root.to_string_lossy().into_owned()
    }

    fn metadata_file(&self, name: &str) -> std::path::PathBuf {
        self.dir.path().join(format!("{}.log", name))
    }

    async fn mount_ro(&self, sources: &[SourceDescriptor]) -> MountId {
        self.manager
            .mount(sources, MountOptions::read_only("/mnt/test"))
            .await
            .unwrap()
    }
}

fn mem(name: &str) -> SourceDescriptor {
    SourceDescriptor::new(format!("mem:{}", name)).with_plugin("memory")
}

fn local(path: &str) -> SourceDescriptor {
    SourceDescriptor::new(path).with_plugin("local")
}

fn vp(s: &str) -> VPath {
    VPath::parse(s).unwrap()
}

fn names(entries: &[mergefs::source::DirEntry]) -> Vec<String> {
    let mut names: Vec<String> = entries.iter().map(|e| e.name.clone()).collect();
    names.sort();
    names
}

/// A file present only in layer i resolves to layer i's bytes, for every i
#[tokio::test]
async fn test_file_resolves_to_its_only_layer() {
    let h = Harness::new();
    for i in 0..3 {
        h.memory
            .volume(&format!("only{}", i))
            .insert_file(&format!("/layer{}.txt", i), format!("from {}", i).as_bytes())
            .unwrap();
    }
    let id = h
        .mount_ro(&[mem("only0"), mem("only1"), mem("only2")])
        .await;
    let mount = h.manager.get(id).unwrap();

    for i in 0..3 {
        let path = vp(&format!("/layer{}.txt", i));
        assert_eq!(mount.owning_layer(&path).await.unwrap(), Owner::Layer(i));
        let data = mount.read(&path, 0, 64).await.unwrap();
        assert_eq!(&data[..], format!("from {}", i).as_bytes());
    }
}

/// A file in a higher layer fully shadows a directory of the same name below
#[tokio::test]
async fn test_file_shadows_lower_directory() {
    let h = Harness::new();
    h.memory.volume("hi").insert_file("/thing", b"file wins").unwrap();
    h.memory
        .volume("lo")
        .insert_file("/thing/inner.txt", b"hidden")
        .unwrap();
    let id = h.mount_ro(&[mem("hi"), mem("lo")]).await;
    let mount = h.manager.get(id).unwrap();

    let meta = mount.stat(&vp("/thing")).await.unwrap();
    assert!(meta.is_file());
    assert!(matches!(
        mount.list_dir(&vp("/thing")).await,
        Err(MergeFsError::NotADirectory(_))
    ));
    assert!(mount.stat(&vp("/thing/inner.txt")).await.unwrap_err().is_not_found());

    let root = mount.list_dir(&VPath::root()).await.unwrap();
    assert_eq!(names(&root), vec!["thing"]);
    assert!(root[0].metadata.is_file());
}

/// Directories present in two layers list as the union of their children
#[tokio::test]
async fn test_directory_union_without_duplicates() {
    let h = Harness::new();
    let a = h.memory.volume("ua");
    let b = h.memory.volume("ub");
    a.insert_file("/shared/common.txt", b"a").unwrap();
    a.insert_file("/shared/only-a.txt", b"a").unwrap();
    b.insert_file("/shared/common.txt", b"b").unwrap();
    b.insert_file("/shared/only-b.txt", b"b").unwrap();
    let id = h.mount_ro(&[mem("ua"), mem("ub")]).await;
    let mount = h.manager.get(id).unwrap();

    let listing = mount.list_dir(&vp("/shared")).await.unwrap();
    assert_eq!(names(&listing), vec!["common.txt", "only-a.txt", "only-b.txt"]);

    let common = mount.read(&vp("/shared/common.txt"), 0, 8).await.unwrap();
    assert_eq!(&common[..], b"a");
}

/// ensure_writable twice yields the same overlay object and leaves the source untouched
#[tokio::test]
async fn test_ensure_writable_idempotent() {
    let h = Harness::new();
    let src = h.local_dir("idem", &[("docs/report.txt", b"quarterly numbers")]);
    let original = fs::read(Path::new(&src).join("docs/report.txt")).unwrap();
    let before = crc32fast::hash(&original);

    let id = h
        .manager
        .mount(
            &[local(&src)],
            MountOptions::writable("/mnt/idem", h.metadata_file("idem")),
        )
        .await
        .unwrap();
    let mount = h.manager.get(id).unwrap();
    let overlay = mount.resolver().overlay().unwrap().clone();

    let path = vp("/docs/report.txt");
    let first = overlay.ensure_writable(mount.resolver(), &path).await.unwrap();
    let second = overlay.ensure_writable(mount.resolver(), &path).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(mount.owning_layer(&path).await.unwrap(), Owner::Overlay);

    let after = crc32fast::hash(&fs::read(Path::new(&src).join("docs/report.txt")).unwrap());
    assert_eq!(before, after);
    match overlay.entry(&path) {
        OverlayEntry::CopiedUp(record) => {
            assert_eq!(record.checksum, before);
            assert_eq!(record.size, original.len() as u64);
        }
        other => panic!("expected a copy-up record, got {:?}", other),
    }
}

/// Deleted paths stay deleted across a remount from the same metadata file
#[tokio::test]
async fn test_tombstone_survives_restart() {
    let h = Harness::new();
    let src = h.local_dir("tomb", &[("gone.txt", b"bye"), ("kept.txt", b"hi")]);
    let log = h.metadata_file("tomb");

    let id = h
        .manager
        .mount(&[local(&src)], MountOptions::writable("/mnt/tomb", &log))
        .await
        .unwrap();
    let mount = h.manager.get(id).unwrap();
    mount.remove_file(&vp("/gone.txt")).await.unwrap();
    assert!(mount.stat(&vp("/gone.txt")).await.unwrap_err().is_not_found());
    h.manager.unmount(id).await.unwrap();

    assert!(Path::new(&src).join("gone.txt").exists());

    let id = h
        .manager
        .mount(&[local(&src)], MountOptions::writable("/mnt/tomb", &log))
        .await
        .unwrap();
    let mount = h.manager.get(id).unwrap();
    assert!(mount.stat(&vp("/gone.txt")).await.unwrap_err().is_not_found());
    let root = mount.list_dir(&VPath::root()).await.unwrap();
    assert_eq!(names(&root), vec!["kept.txt"]);
}

/// A log cut inside its last record replays to the state before that record
#[test]
fn test_truncated_log_recovers_previous_state() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("cut.log");

    let record = |name: &str| CopyUpRecord {
        overlay_path: vp(name),
        origin: Origin::Layer(1),
        kind: FileType::File,
        size: 3,
        mtime: SystemTime::UNIX_EPOCH + Duration::from_secs(1_000),
        checksum: 0xdead_beef,
        mode: 0o644,
    };

    let (store, _) = MetadataStore::open(&log, true).unwrap();
    store.record_copy_up(&vp("/a"), &record("/a")).unwrap();
    store.record_tombstone(&vp("/b")).unwrap();
    store.flush().unwrap();
    let complete_len = fs::metadata(&log).unwrap().len();
    drop(store);

    let (_, expected) = MetadataStore::open(&log, true).unwrap();

    let (store, _) = MetadataStore::open(&log, true).unwrap();
    store.record_copy_up(&vp("/c"), &record("/c")).unwrap();
    store.flush().unwrap();
    let full_len = fs::metadata(&log).unwrap().len();
    drop(store);

    let file = OpenOptions::new().write(true).open(&log).unwrap();
    file.set_len(complete_len + (full_len - complete_len) / 2).unwrap();
    drop(file);

    let (_, recovered) = MetadataStore::open(&log, true).unwrap();
    assert_eq!(recovered.entries, expected.entries);
    assert_eq!(recovered.attrs, expected.attrs);
    assert_eq!(recovered.entries.len(), 2);
}

/// Many first-writers to one path trigger exactly one copy-up
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_writers_copy_once() {
    let h = Harness::new();
    let volume = h.memory.volume("race");
    volume.insert_file("/shared.bin", &[b'.'; 64]).unwrap();

    let id = h
        .manager
        .mount(
            &[mem("race")],
            MountOptions::writable("/mnt/race", h.metadata_file("race")),
        )
        .await
        .unwrap();
    let mount = h.manager.get(id).unwrap();

    let writers: Vec<_> = (0..16u64)
        .map(|i| {
            let mount = mount.clone();
            tokio::spawn(async move { mount.write(&vp("/shared.bin"), i, b"x").await })
        })
        .collect();
    for writer in writers {
        assert_eq!(writer.await.unwrap().unwrap(), 1);
    }

    assert_eq!(volume.read_count(), 1);
    assert_eq!(h.manager.describe(id).unwrap().copy_ups, 1);
    let data = mount.read(&vp("/shared.bin"), 0, 64).await.unwrap();
    assert_eq!(&data[..16], &[b'x'; 16]);
    assert_eq!(&data[16..], &[b'.'; 48]);
    assert_eq!(volume.contents("/shared.bin").unwrap(), vec![b'.'; 64]);
}

/// Two read-only local sources: the root lists both, a shared file comes from the front
#[tokio::test]
async fn test_two_read_only_sources_scenario() {
    let h = Harness::new();
    let src0 = h.local_dir("src0", &[("both.txt", b"from src0"), ("zero.txt", b"0")]);
    let src1 = h.local_dir("src1", &[("both.txt", b"from src1"), ("one.txt", b"1")]);

    let id = h
        .mount_ro(&[local(&src1), local(&src0).at(InsertPosition::Front)])
        .await;
    let mount = h.manager.get(id).unwrap();

    let root = mount.list_dir(&VPath::root()).await.unwrap();
    assert_eq!(names(&root), vec!["both.txt", "one.txt", "zero.txt"]);
    let data = mount.read(&vp("/both.txt"), 0, 64).await.unwrap();
    assert_eq!(&data[..], b"from src0");
    assert!(matches!(
        mount.write(&vp("/both.txt"), 0, b"nope").await,
        Err(MergeFsError::PermissionDenied(_))
    ));
}

/// Writable mount: one write means one copy-up, and the source file keeps its bytes
#[tokio::test]
async fn test_write_through_overlay_scenario() {
    let h = Harness::new();
    let src0 = h.local_dir("wsrc0", &[("a.txt", b"old")]);
    let log = h.metadata_file("wsrc0");

    let id = h
        .manager
        .mount(&[local(&src0)], MountOptions::writable("/mnt/w", &log))
        .await
        .unwrap();
    let mount = h.manager.get(id).unwrap();

    let data = b"brand new contents";
    mount.write(&vp("/a.txt"), 0, data).await.unwrap();

    assert_eq!(h.manager.describe(id).unwrap().copy_ups, 1);
    assert_eq!(fs::read(Path::new(&src0).join("a.txt")).unwrap(), b"old");
    let view = mount.read(&vp("/a.txt"), 0, 64).await.unwrap();
    assert_eq!(&view[..], data);

    let overlay_copy = MountOptions::default_overlay_dir(&log).join("a.txt");
    assert_eq!(fs::read(overlay_copy).unwrap(), data);
}

/// Creating, renaming and removing through the overlay never touches the sources
#[tokio::test]
async fn test_namespace_operations() {
    let h = Harness::new();
    let src = h.local_dir(
        "ns",
        &[("dir/one.txt", b"1"), ("dir/two.txt", b"2"), ("top.txt", b"t")],
    );
    let id = h
        .manager
        .mount(
            &[local(&src)],
            MountOptions::writable("/mnt/ns", h.metadata_file("ns")),
        )
        .await
        .unwrap();
    let mount = h.manager.get(id).unwrap();

    mount.create_dir(&vp("/fresh"), 0o755).await.unwrap();
    mount.create_file(&vp("/fresh/note.txt"), 0o644).await.unwrap();
    mount.write(&vp("/fresh/note.txt"), 0, b"hello").await.unwrap();
    assert!(matches!(
        mount.create_file(&vp("/top.txt"), 0o644).await,
        Err(MergeFsError::AlreadyExists(_))
    ));

    mount.rename(&vp("/dir"), &vp("/moved")).await.unwrap();
    assert!(mount.stat(&vp("/dir")).await.unwrap_err().is_not_found());
    let moved = mount.list_dir(&vp("/moved")).await.unwrap();
    assert_eq!(names(&moved), vec!["one.txt", "two.txt"]);
    let one = mount.read(&vp("/moved/one.txt"), 0, 8).await.unwrap();
    assert_eq!(&one[..], b"1");
    // Renaming a source directory copies nothing into the overlay
    let upper = MountOptions::default_overlay_dir(&h.metadata_file("ns"));
    assert!(!upper.join("moved/one.txt").exists());
    assert!(!upper.join("dir").exists());

    assert!(matches!(
        mount.remove_dir(&vp("/moved")).await,
        Err(MergeFsError::NotEmpty(_))
    ));
    mount.remove_file(&vp("/moved/one.txt")).await.unwrap();
    mount.remove_file(&vp("/moved/two.txt")).await.unwrap();
    mount.remove_dir(&vp("/moved")).await.unwrap();

    let root = mount.list_dir(&VPath::root()).await.unwrap();
    assert_eq!(names(&root), vec!["fresh", "top.txt"]);
    assert!(Path::new(&src).join("dir/one.txt").exists());
    assert!(Path::new(&src).join("dir/two.txt").exists());
}

/// Truncation copies up and the merged view reports the new size
#[tokio::test]
async fn test_truncate_through_overlay() {
    let h = Harness::new();
    h.memory.volume("trunc").insert_file("/log.txt", b"0123456789").unwrap();
    let id = h
        .manager
        .mount(
            &[mem("trunc")],
            MountOptions::writable("/mnt/trunc", h.metadata_file("trunc")),
        )
        .await
        .unwrap();
    let mount = h.manager.get(id).unwrap();

    mount.truncate(&vp("/log.txt"), 4).await.unwrap();
    assert_eq!(mount.stat(&vp("/log.txt")).await.unwrap().size, 4);
    let data = mount.read(&vp("/log.txt"), 0, 64).await.unwrap();
    assert_eq!(&data[..], b"0123");
    assert_eq!(
        h.memory.volume("trunc").contents("/log.txt").unwrap(),
        b"0123456789"
    );
}

/// Attribute changes on unmodified files are overrides, not copies
#[tokio::test]
async fn test_set_attributes_without_copy_up() {
    let h = Harness::new();
    h.memory.volume("attr").insert_file("/script.sh", b"#!/bin/sh").unwrap();
    let id = h
        .manager
        .mount(
            &[mem("attr")],
            MountOptions::writable("/mnt/attr", h.metadata_file("attr")),
        )
        .await
        .unwrap();
    let mount = h.manager.get(id).unwrap();

    let when = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
    mount
        .set_attributes(&vp("/script.sh"), Some(0o755), Some(when))
        .await
        .unwrap();

    let meta = mount.stat(&vp("/script.sh")).await.unwrap();
    assert_eq!(meta.mode, Some(0o755));
    assert_eq!(meta.mtime, when);
    assert_eq!(mount.owning_layer(&vp("/script.sh")).await.unwrap(), Owner::Layer(0));
    assert_eq!(h.manager.describe(id).unwrap().copy_ups, 0);
    assert_eq!(h.memory.volume("attr").read_count(), 0);
}

/// Case-insensitive mounts fold names for merging and for tombstones
#[tokio::test]
async fn test_case_insensitive_mount() {
    let h = Harness::new();
    h.memory.volume("ci0").insert_file("/README.txt", b"upper").unwrap();
    h.memory.volume("ci1").insert_file("/readme.TXT", b"lower").unwrap();
    let id = h
        .manager
        .mount(
            &[mem("ci0"), mem("ci1")],
            MountOptions::writable("/mnt/ci", h.metadata_file("ci")).case_insensitive(),
        )
        .await
        .unwrap();
    let mount = h.manager.get(id).unwrap();

    let root = mount.list_dir(&VPath::root()).await.unwrap();
    assert_eq!(names(&root), vec!["README.txt"]);

    mount.remove_file(&vp("/README.txt")).await.unwrap();
    assert!(mount.stat(&vp("/readme.TXT")).await.unwrap_err().is_not_found());
    assert!(mount.list_dir(&VPath::root()).await.unwrap().is_empty());
}

/// Plugins are picked by detection when a descriptor names none
#[tokio::test]
async fn test_auto_detected_archive_and_directory() {
    let h = Harness::new();
    let registry = h.manager.registry();
    registry.load("builtin:local").unwrap();
    registry.load("builtin:archive").unwrap();

    let base = h.local_dir("detect", &[("base.txt", b"base"), ("docs/a.txt", b"dir a")]);
    let zip_path = h.dir.path().join("patch.zip");
    {
        let mut zip = zip::ZipWriter::new(File::create(&zip_path).unwrap());
        let options = zip::write::SimpleFileOptions::default();
        zip.start_file("docs/a.txt", options).unwrap();
        zip.write_all(b"zip a").unwrap();
        zip.start_file("docs/b.txt", options).unwrap();
        zip.write_all(b"zip b").unwrap();
        zip.finish().unwrap();
    }

    let id = h
        .mount_ro(&[
            SourceDescriptor::new(base),
            SourceDescriptor::new(zip_path.to_string_lossy()).at(InsertPosition::Front),
        ])
        .await;
    let mount = h.manager.get(id).unwrap();

    let docs = mount.list_dir(&vp("/docs")).await.unwrap();
    assert_eq!(names(&docs), vec!["a.txt", "b.txt"]);
    let a = mount.read(&vp("/docs/a.txt"), 0, 16).await.unwrap();
    assert_eq!(&a[..], b"zip a");
    assert_eq!(mount.owning_layer(&vp("/base.txt")).await.unwrap(), Owner::Layer(1));

    let info = h.manager.describe(id).unwrap();
    assert!(info.layers[0].ends_with("patch.zip"));
}

/// Failures are mirrored into the last-error record; successes leave it alone
#[tokio::test]
async fn test_last_error_shim() {
    let h = Harness::new();
    h.memory.volume("le").insert_file("/present", b"x").unwrap();
    let id = h.mount_ro(&[mem("le")]).await;
    let mount = h.manager.get(id).unwrap();

    last_error::clear();
    assert!(mount.stat(&vp("/absent")).await.is_err());
    assert_eq!(get_last_error(), (codes::INEXISTENT_FILE, false));

    mount.stat(&vp("/present")).await.unwrap();
    assert_eq!(get_last_error(), (codes::INEXISTENT_FILE, false));

    let err = h
        .manager
        .mount(&[], MountOptions::read_only("/mnt/none"))
        .await
        .unwrap_err();
    assert!(matches!(err, MergeFsError::InvalidArgument(_)));
    assert_eq!(get_last_error(), (codes::INVALID_PARAMETER, false));
}
