use chrono::{TimeZone, Utc};
use snapback_core::{
    BackupSession, ClientConfiguration, Digest, Directory, FileReader, FileType, Inode,
    ServerSession,
};
use snapback_db_local::{DatabaseConfig, LocalDatabase, LocalServerSession};
use uuid::Uuid;

const MIB: usize = 1024 * 1024;

fn client_config() -> ClientConfiguration {
    ClientConfiguration {
        client_id: Uuid::new_v4(),
        client_name: "test_client".to_string(),
        backup_granularity: 86_400,
        named_timezone: "Etc/UTC".to_string(),
        backup_directories: Default::default(),
    }
}

async fn new_database(dir: &std::path::Path) -> (LocalDatabase, LocalServerSession) {
    let db = LocalDatabase::create_database(dir.join("db"), DatabaseConfig::default())
        .await
        .unwrap();
    let session = db.create_client(&client_config()).await.unwrap();
    (db, session)
}

fn backup_date() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()
}

fn file_inode(content: &[u8]) -> Inode {
    Inode {
        modified_time: Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        kind: FileType::Regular,
        mode: 0o644,
        size: content.len() as u64,
        uid: 1000,
        gid: 1000,
        hash: Some(Digest::new(content)),
    }
}

fn dir_inode(hash: Digest) -> Inode {
    Inode {
        modified_time: Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        kind: FileType::Directory,
        mode: 0o755,
        size: 0,
        uid: 1000,
        gid: 1000,
        hash: Some(hash),
    }
}

fn count_store_objects(db_path: &std::path::Path) -> usize {
    fn walk(dir: &std::path::Path, count: &mut usize) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            if entry.file_type().unwrap().is_dir() {
                walk(&entry.path(), count);
            } else {
                *count += 1;
            }
        }
    }
    let mut count = 0;
    walk(&db_path.join("store"), &mut count);
    count
}

#[tokio::test]
async fn client_session_opens_by_name_and_id() {
    let dir = tempfile::tempdir().unwrap();
    let (db, session) = new_database(dir.path()).await;
    let client_id = session.client_config().client_id;

    let by_name = db.open_client_session("test_client").await.unwrap();
    assert_eq!(by_name.client_config().client_id, client_id);

    let by_id = db.open_client_session(&client_id.to_string()).await.unwrap();
    assert_eq!(by_id.client_config().client_name, "test_client");

    let missing = db.open_client_session("nobody").await;
    assert!(matches!(
        missing,
        Err(snapback_core::Error::SessionClosed(_))
    ));
}

#[tokio::test]
async fn empty_backup_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (_db, server) = new_database(dir.path()).await;

    let session = server.start_backup(backup_date(), false, None).await.unwrap();

    let response = session.directory_def(&Directory::new(), None).await.unwrap();
    assert!(response.success());
    let root_hash = response.ref_hash.unwrap();
    assert_eq!(
        root_hash.to_hex(),
        "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
    );

    session.add_root_dir("root", &dir_inode(root_hash)).await.unwrap();
    let backup = session.complete().await.unwrap();
    assert_eq!(backup.backup_date, backup_date());
    assert_eq!(backup.roots.len(), 1);

    assert_eq!(
        server.list_backups().await.unwrap(),
        vec![(backup_date(), None)]
    );

    let fetched = server.get_backup(None).await.unwrap().unwrap();
    let fetched_dir = server
        .get_directory(&fetched.roots["root"])
        .await
        .unwrap();
    assert!(fetched_dir.children.is_empty());
}

#[tokio::test]
async fn single_file_backup_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (_db, server) = new_database(dir.path()).await;
    let session = server.start_backup(backup_date(), false, None).await.unwrap();

    let content = b"Hello World";
    let digest = session
        .upload_file_content(FileReader::from_bytes(&content[..]), Uuid::new_v4(), 0, true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        digest.to_hex(),
        "a591a6d40bf420404a011733cfb7b190d62c65bf0bcda32b57b277d9ad9f146e"
    );

    let mut dir_def = Directory::new();
    dir_def
        .children
        .insert("test.txt".to_string(), file_inode(content));
    let response = session.directory_def(&dir_def, None).await.unwrap();
    assert!(response.success());

    session
        .add_root_dir("root", &dir_inode(response.ref_hash.unwrap()))
        .await
        .unwrap();
    let backup = session.complete().await.unwrap();

    let root_dir = server.get_directory(&backup.roots["root"]).await.unwrap();
    let mut reader = server
        .get_file(&root_dir.children["test.txt"])
        .await
        .unwrap();
    assert_eq!(reader.size(), Some(content.len() as u64));
    assert_eq!(&reader.read_all().await.unwrap()[..], content);
}

#[tokio::test]
async fn duplicate_backup_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let (_db, server) = new_database(dir.path()).await;

    let session = server.start_backup(backup_date(), false, None).await.unwrap();
    let response = session.directory_def(&Directory::new(), None).await.unwrap();
    session
        .add_root_dir("root", &dir_inode(response.ref_hash.unwrap()))
        .await
        .unwrap();
    session.complete().await.unwrap();

    // Same normalised date, no overwrite: refused.
    let result = server.start_backup(backup_date(), false, None).await;
    assert!(matches!(
        result,
        Err(snapback_core::Error::DuplicateBackup(_))
    ));

    // A later time in the same granularity window normalises to the same
    // date and is refused too.
    let later = Utc.with_ymd_and_hms(2024, 1, 2, 15, 30, 0).unwrap();
    assert!(matches!(
        server.start_backup(later, false, None).await,
        Err(snapback_core::Error::DuplicateBackup(_))
    ));

    // With allow_overwrite the backup can be replaced.
    let session = server.start_backup(backup_date(), true, None).await.unwrap();
    let response = session.directory_def(&Directory::new(), None).await.unwrap();
    session
        .add_root_dir("root", &dir_inode(response.ref_hash.unwrap()))
        .await
        .unwrap();
    session.complete().await.unwrap();
    assert_eq!(server.list_backups().await.unwrap().len(), 1);
}

#[tokio::test]
async fn chunked_upload_resumes_and_hashes_the_whole_file() {
    let dir = tempfile::tempdir().unwrap();
    let (_db, server) = new_database(dir.path()).await;
    let session = server.start_backup(backup_date(), false, None).await.unwrap();

    let content: Vec<u8> = (0..3 * MIB).map(|i| (i % 251) as u8).collect();
    let resume_id = Uuid::new_v4();

    session
        .upload_file_content(
            FileReader::from_bytes(content[..MIB].to_vec()),
            resume_id,
            0,
            false,
        )
        .await
        .unwrap();
    session
        .upload_file_content(
            FileReader::from_bytes(content[MIB..2 * MIB].to_vec()),
            resume_id,
            MIB as u64,
            false,
        )
        .await
        .unwrap();

    assert_eq!(
        session.check_file_upload_size(resume_id).await.unwrap(),
        2 * MIB as u64
    );

    let digest = session
        .upload_file_content(
            FileReader::from_bytes(content[2 * MIB..].to_vec()),
            resume_id,
            2 * MIB as u64,
            true,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(digest, Digest::new(&content));

    // The partial is gone once completed; callers use this to detect that
    // an interrupted final request in fact finished.
    assert!(matches!(
        session.check_file_upload_size(resume_id).await,
        Err(snapback_core::Error::NotFound(_))
    ));

    // A completed resume id cannot be reused.
    assert!(matches!(
        session
            .upload_file_content(FileReader::from_bytes(&b"x"[..]), resume_id, 0, true)
            .await,
        Err(snapback_core::Error::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn sparse_resume_reads_holes_as_zeros() {
    let dir = tempfile::tempdir().unwrap();
    let (_db, server) = new_database(dir.path()).await;
    let session = server.start_backup(backup_date(), false, None).await.unwrap();

    // First request for this id starts past zero; the server must treat
    // the hole as zero bytes.
    let digest = session
        .upload_file_content(FileReader::from_bytes(&b"tail"[..]), Uuid::new_v4(), 100, true)
        .await
        .unwrap()
        .unwrap();

    let mut expected = vec![0u8; 100];
    expected.extend_from_slice(b"tail");
    assert_eq!(digest, Digest::new(&expected));
}

#[tokio::test]
async fn directory_def_missing_files_handshake() {
    let dir = tempfile::tempdir().unwrap();
    let (_db, server) = new_database(dir.path()).await;
    let session = server.start_backup(backup_date(), false, None).await.unwrap();

    let content_a = b"content of a";
    let content_b = b"content of b";
    let mut dir_def = Directory::new();
    dir_def.children.insert("a.txt".to_string(), file_inode(content_a));
    dir_def.children.insert("b.txt".to_string(), file_inode(content_b));

    let response = session.directory_def(&dir_def, None).await.unwrap();
    assert!(!response.success());
    assert!(response.ref_hash.is_none());
    assert_eq!(response.missing_files, vec!["a.txt", "b.txt"]);
    let missing_ref = response.missing_ref.expect("missing_ref identifies the attempt");

    for content in [&content_a[..], &content_b[..]] {
        session
            .upload_file_content(FileReader::from_bytes(content), Uuid::new_v4(), 0, true)
            .await
            .unwrap();
    }

    let response = session
        .directory_def(&dir_def, Some(missing_ref))
        .await
        .unwrap();
    assert!(response.success());
    assert_eq!(response.ref_hash.unwrap(), dir_def.ref_hash().ref_hash);
}

#[tokio::test]
async fn directory_def_rejects_null_child_hash() {
    let dir = tempfile::tempdir().unwrap();
    let (_db, server) = new_database(dir.path()).await;
    let session = server.start_backup(backup_date(), false, None).await.unwrap();

    let mut dir_def = Directory::new();
    let mut inode = file_inode(b"whatever");
    inode.hash = None;
    dir_def.children.insert("nohash".to_string(), inode);

    assert!(matches!(
        session.directory_def(&dir_def, None).await,
        Err(snapback_core::Error::InvalidArguments(_))
    ));
}

#[tokio::test]
async fn directory_and_file_objects_never_alias() {
    let dir = tempfile::tempdir().unwrap();
    let (db, server) = new_database(dir.path()).await;
    let session = server.start_backup(backup_date(), false, None).await.unwrap();

    // A file whose content happens to be the canonical bytes of the empty
    // directory lives under a different store key than the directory.
    let empty_dir_bytes = b"{}";
    session
        .upload_file_content(
            FileReader::from_bytes(&empty_dir_bytes[..]),
            Uuid::new_v4(),
            0,
            true,
        )
        .await
        .unwrap();
    let response = session.directory_def(&Directory::new(), None).await.unwrap();
    let digest = response.ref_hash.unwrap();

    session.add_root_dir("root", &dir_inode(digest)).await.unwrap();
    session.complete().await.unwrap();

    let store_root = db.base_path().join("store");
    let shard = store_root.join(&digest.to_hex()[..2]);
    assert!(shard.join(digest.to_hex()).is_file());
    assert!(shard.join(format!("{}.d", digest.to_hex())).is_file());
}

#[tokio::test]
async fn repeated_backups_store_each_blob_once() {
    let dir = tempfile::tempdir().unwrap();
    let (db, server) = new_database(dir.path()).await;

    let content = b"dedup me";
    for day in [2, 3] {
        let date = Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap();
        let session = server.start_backup(date, false, None).await.unwrap();
        session
            .upload_file_content(FileReader::from_bytes(&content[..]), Uuid::new_v4(), 0, true)
            .await
            .unwrap();
        let mut dir_def = Directory::new();
        dir_def.children.insert("same.txt".to_string(), file_inode(content));
        let response = session.directory_def(&dir_def, None).await.unwrap();
        session
            .add_root_dir("root", &dir_inode(response.ref_hash.unwrap()))
            .await
            .unwrap();
        session.complete().await.unwrap();
    }

    // One file blob + one directory blob, regardless of how many backups
    // reference them.
    assert_eq!(count_store_objects(db.base_path()), 2);
    assert_eq!(server.list_backups().await.unwrap().len(), 2);
}

#[tokio::test]
async fn closed_sessions_refuse_operations() {
    let dir = tempfile::tempdir().unwrap();
    let (_db, server) = new_database(dir.path()).await;

    let session = server.start_backup(backup_date(), false, None).await.unwrap();
    assert!(session.is_open());
    session.discard().await.unwrap();
    assert!(!session.is_open());

    assert!(matches!(
        session.directory_def(&Directory::new(), None).await,
        Err(snapback_core::Error::SessionClosed(_))
    ));
    assert!(matches!(
        session.discard().await,
        Err(snapback_core::Error::SessionClosed(_))
    ));
}

#[tokio::test]
async fn sessions_resume_by_id_and_date() {
    let dir = tempfile::tempdir().unwrap();
    let (_db, server) = new_database(dir.path()).await;

    let session = server.start_backup(backup_date(), false, None).await.unwrap();
    let session_id = session.config().session_id;
    session
        .upload_file_content(FileReader::from_bytes(&b"partial"[..]), Uuid::new_v4(), 0, false)
        .await
        .unwrap();

    let listed = server.list_backup_sessions().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].session_id, session_id);

    let by_id = server
        .resume_backup(Some(session_id), None, false)
        .await
        .unwrap();
    assert_eq!(by_id.config().backup_date, backup_date());

    let by_date = server
        .resume_backup(None, Some(backup_date()), false)
        .await
        .unwrap();
    assert_eq!(by_date.config().session_id, session_id);

    assert!(matches!(
        server
            .resume_backup(None, Some(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()), false)
            .await,
        Err(snapback_core::Error::NotFound(_))
    ));
    assert!(matches!(
        server.resume_backup(None, None, false).await,
        Err(snapback_core::Error::InvalidArguments(_))
    ));
}

#[tokio::test]
async fn resume_can_discard_partial_uploads() {
    let dir = tempfile::tempdir().unwrap();
    let (_db, server) = new_database(dir.path()).await;

    let session = server.start_backup(backup_date(), false, None).await.unwrap();
    let resume_id = Uuid::new_v4();
    session
        .upload_file_content(FileReader::from_bytes(&b"partial"[..]), resume_id, 0, false)
        .await
        .unwrap();
    assert_eq!(session.check_file_upload_size(resume_id).await.unwrap(), 7);

    let resumed = server
        .resume_backup(Some(session.config().session_id), None, true)
        .await
        .unwrap();
    assert!(matches!(
        resumed.check_file_upload_size(resume_id).await,
        Err(snapback_core::Error::NotFound(_))
    ));
}
