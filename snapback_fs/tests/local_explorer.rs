use std::io::Write;

use futures::StreamExt;
use snapback_core::{
    Digest, DirectoryExplorer, FileSystemExplorer, FileType, Filter, FilterType,
    MetaRestoreToggles,
};
use snapback_fs::LocalFileSystemExplorer;
use tempfile::tempdir;

fn open_root(dir: &std::path::Path, filters: &[Filter]) -> Box<dyn DirectoryExplorer> {
    LocalFileSystemExplorer::new()
        .open_root(dir.to_str().unwrap(), filters)
        .unwrap()
}

async fn collect_children(
    explorer: &dyn DirectoryExplorer,
) -> std::collections::BTreeMap<String, snapback_core::Inode> {
    explorer
        .iter_children()
        .await
        .unwrap()
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect()
}

#[tokio::test]
async fn basic_directory_iteration() {
    let root = tempdir().unwrap();
    std::fs::create_dir(root.path().join("some_directory")).unwrap();
    std::fs::write(root.path().join("some_file"), b"Hello World").unwrap();

    let explorer = open_root(root.path(), &[]);
    let children = collect_children(explorer.as_ref()).await;

    assert_eq!(children.len(), 2);
    assert_eq!(children["some_directory"].kind, FileType::Directory);
    let file = &children["some_file"];
    assert_eq!(file.kind, FileType::Regular);
    assert_eq!(file.size, b"Hello World".len() as u64);
    assert!(file.hash.is_none());
    assert!(file.mode > 0);
}

#[tokio::test]
async fn excluded_children_are_not_listed() {
    let root = tempdir().unwrap();
    std::fs::create_dir_all(root.path().join("a/b/c")).unwrap();
    std::fs::write(root.path().join("a/b/c/hidden"), b"x").unwrap();
    std::fs::write(root.path().join("shown"), b"y").unwrap();

    let filters = [Filter::new(FilterType::Exclude, "a")];
    let explorer = open_root(root.path(), &filters);
    let children = collect_children(explorer.as_ref()).await;

    assert_eq!(children.len(), 1);
    assert!(children.contains_key("shown"));
}

#[tokio::test]
async fn exclusion_with_inclusion_inside_is_entered() {
    let root = tempdir().unwrap();
    std::fs::create_dir_all(root.path().join("c/d/e")).unwrap();
    std::fs::write(root.path().join("c/d/e/kept"), b"x").unwrap();
    std::fs::write(root.path().join("c/hidden"), b"x").unwrap();
    std::fs::write(root.path().join("shown"), b"y").unwrap();

    let filters = [
        Filter::new(FilterType::Exclude, "c"),
        Filter::new(FilterType::Include, "c/d/e"),
    ];
    let explorer = open_root(root.path(), &filters);

    let children = collect_children(explorer.as_ref()).await;
    assert_eq!(children.len(), 2);
    assert!(children.contains_key("c"));
    assert!(children.contains_key("shown"));

    // ... and the child explorer keeps filtering correctly.
    let c = explorer.get_child("c");
    let children = collect_children(c.as_ref()).await;
    assert_eq!(children.len(), 1);
    assert!(children.contains_key("d"));
}

#[tokio::test]
async fn pattern_exclusion_applies_per_name() {
    let root = tempdir().unwrap();
    std::fs::write(root.path().join("foo.txt"), b"").unwrap();
    std::fs::write(root.path().join("foo.jpg"), b"").unwrap();

    let filters = [Filter::new(FilterType::PatternExclude, "*.txt")];
    let explorer = open_root(root.path(), &filters);
    let children = collect_children(explorer.as_ref()).await;

    assert!(!children.contains_key("foo.txt"));
    assert!(children.contains_key("foo.jpg"));
}

#[tokio::test]
async fn hard_links_are_hashed_once() {
    let root = tempdir().unwrap();
    let content = b"the very same bytes";
    std::fs::write(root.path().join("a.bin"), content).unwrap();
    std::fs::hard_link(root.path().join("a.bin"), root.path().join("b.bin")).unwrap();

    let explorer = open_root(root.path(), &[]);
    let first = explorer.hash_child("a.bin").await.unwrap();
    assert_eq!(first, Digest::new(content));

    // The second link must come out of the cache, and later enumeration
    // must surface the cached digest without another read.
    let second = explorer.hash_child("b.bin").await.unwrap();
    assert_eq!(first, second);

    let children = collect_children(explorer.as_ref()).await;
    assert_eq!(children["a.bin"].hash, Some(first));
    assert_eq!(children["b.bin"].hash, Some(first));
}

#[tokio::test]
async fn open_child_reads_the_link_itself() {
    let root = tempdir().unwrap();
    std::fs::write(root.path().join("target.txt"), b"real content").unwrap();
    std::os::unix::fs::symlink("target.txt", root.path().join("alias")).unwrap();

    let explorer = open_root(root.path(), &[]);
    let mut reader = explorer.open_child("alias").await.unwrap();
    let bytes = reader.read_all().await.unwrap();
    assert_eq!(&bytes[..], b"target.txt");

    let children = collect_children(explorer.as_ref()).await;
    assert_eq!(children["alias"].kind, FileType::Link);
}

#[tokio::test]
async fn restore_regular_file_and_link() {
    let root = tempdir().unwrap();
    let explorer = open_root(root.path(), &[]);

    let mut content = snapback_core::FileReader::from_bytes(&b"written back"[..]);
    explorer
        .restore_child("file.txt", FileType::Regular, Some(&mut content), false)
        .await
        .unwrap();
    assert_eq!(
        std::fs::read(root.path().join("file.txt")).unwrap(),
        b"written back"
    );

    let mut target = snapback_core::FileReader::from_bytes(&b"file.txt"[..]);
    explorer
        .restore_child("alias", FileType::Link, Some(&mut target), false)
        .await
        .unwrap();
    assert_eq!(
        std::fs::read_link(root.path().join("alias")).unwrap(),
        std::path::PathBuf::from("file.txt")
    );

    // Without clobber, an existing file is refused.
    let mut content = snapback_core::FileReader::from_bytes(&b"again"[..]);
    let err = explorer
        .restore_child("file.txt", FileType::Regular, Some(&mut content), false)
        .await
        .unwrap_err();
    assert!(matches!(err, snapback_core::Error::AlreadyExists(_)));

    // With clobber, it is replaced.
    let mut content = snapback_core::FileReader::from_bytes(&b"again"[..]);
    explorer
        .restore_child("file.txt", FileType::Regular, Some(&mut content), true)
        .await
        .unwrap();
    assert_eq!(std::fs::read(root.path().join("file.txt")).unwrap(), b"again");
}

#[tokio::test]
async fn clobbering_a_directory_with_a_file_is_refused() {
    let root = tempdir().unwrap();
    std::fs::create_dir(root.path().join("keep")).unwrap();

    let explorer = open_root(root.path(), &[]);
    let mut content = snapback_core::FileReader::from_bytes(&b"nope"[..]);
    let err = explorer
        .restore_child("keep", FileType::Regular, Some(&mut content), true)
        .await
        .unwrap_err();
    assert!(matches!(err, snapback_core::Error::InvalidArguments(_)));
    assert!(root.path().join("keep").is_dir());
}

#[tokio::test]
async fn restore_meta_applies_toggled_attributes() {
    use std::os::unix::fs::PermissionsExt;

    let root = tempdir().unwrap();
    let path = root.path().join("file.txt");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(b"meta").unwrap();
    drop(file);

    let explorer = open_root(root.path(), &[]);
    let mut inode = collect_children(explorer.as_ref()).await["file.txt"].clone();
    inode.mode = 0o600;
    inode.modified_time = chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap();

    explorer
        .restore_meta(
            "file.txt",
            &inode,
            MetaRestoreToggles {
                mode: true,
                modified_time: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let meta = std::fs::metadata(&path).unwrap();
    assert_eq!(meta.permissions().mode() & 0o7777, 0o600);
    let restored = collect_children(explorer.as_ref()).await["file.txt"].clone();
    assert_eq!(restored.modified_time.timestamp(), 1_700_000_000);
}
