use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use clap_verbosity_flag::InfoLevel;
use snapback_core::{
    BackupSession, ClientConfiguration, ClientConfiguredBackupDirectory, MetaRestoreToggles,
    ServerSession,
};
use snapback_db_local::{DatabaseConfig, LocalDatabase, LocalServerSession};
use snapback_engine::{BackupController, RestoreController};
use snapback_fs::LocalFileSystemExplorer;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Backup database to operate on: a directory path, or a
    /// file:// / http(s):// / s3:// URL
    #[arg(short, long, value_name = "URL", env = "SNAPBACK_DATABASE")]
    database: String,

    /// Client id or name to operate as
    #[arg(short, long, value_name = "ID_OR_NAME", env = "SNAPBACK_CLIENT")]
    client: Option<String>,

    /// Credentials file for remote transports
    #[arg(long, value_name = "PATH", env = "SNAPBACK_CREDENTIALS")]
    credentials: Option<PathBuf>,

    #[command(flatten)]
    verbosity: clap_verbosity_flag::Verbosity<InfoLevel>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up every configured root into a new backup session
    Backup {
        /// Free-form description stored with the backup
        #[arg(long)]
        description: Option<String>,

        /// Replace an existing backup at the same normalised date
        #[arg(long)]
        overwrite: bool,

        /// Scan the whole tree before uploading anything
        #[arg(long)]
        full_prescan: bool,

        /// Do not compare against the previous backup
        #[arg(long)]
        ignore_last_backup: bool,

        /// Hash every file even when its metadata matches the last backup
        #[arg(long)]
        hash_all: bool,

        /// Backup date (RFC 3339 or YYYY-MM-DD); defaults to now
        #[arg(long, value_name = "DATE")]
        date: Option<String>,
    },

    /// Restore a backup, fully or partially
    Restore {
        /// Backup date to restore (RFC 3339 or YYYY-MM-DD); defaults to the
        /// latest backup
        #[arg(long, value_name = "DATE")]
        date: Option<String>,

        /// Restore only this root
        #[arg(long, value_name = "NAME", requires = "target")]
        root: Option<String>,

        /// Slash-separated path inside the root to restore
        #[arg(long, value_name = "PATH", requires = "root")]
        subpath: Option<String>,

        /// Explicit target directory (required with --root)
        #[arg(long, value_name = "PATH")]
        target: Option<String>,

        /// Never replace existing files at the target
        #[arg(long)]
        no_clobber: bool,

        /// Restore file ownership (uid/gid)
        #[arg(long)]
        restore_owner: bool,

        /// Restore permission bits
        #[arg(long)]
        restore_permissions: bool,

        /// Restore modification times
        #[arg(long)]
        restore_modified_time: bool,
    },

    /// List completed backups
    ListBackups,

    /// List open backup sessions
    ListSessions,

    /// Initialise a new backup database
    CreateDatabase {
        /// Number of shard path components in the object store
        #[arg(long, default_value_t = 1)]
        split_count: usize,

        /// Hex characters per shard path component
        #[arg(long, default_value_t = 2)]
        split_size: usize,
    },

    /// Register a new client in the database
    CreateClient {
        /// Friendly client name, usable anywhere an id is
        #[arg(long)]
        name: String,

        /// Backup granularity in seconds
        #[arg(long, default_value_t = 86_400)]
        granularity: u64,

        /// IANA timezone the granularity boundary is computed in
        #[arg(long, default_value = "Etc/UTC")]
        timezone: String,
    },

    /// Add a backup root to the client configuration
    AddRoot {
        /// Name of the root inside backups
        #[arg(long)]
        name: String,

        /// Absolute path to back up
        #[arg(long)]
        path: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    if let Some(credentials) = &cli.credentials {
        debug!(
            "credentials file {} is only used by remote transports",
            credentials.display()
        );
    }

    let database_path = local_database_path(&cli.database)?;

    // Database creation and client registration run before a client
    // session can exist; everything else operates through one.
    let cmd = match cli.cmd {
        Commands::CreateDatabase {
            split_count,
            split_size,
        } => {
            LocalDatabase::create_database(
                &database_path,
                DatabaseConfig {
                    store_split_count: split_count,
                    store_split_size: split_size,
                },
            )
            .await?;
            info!("created database at {}", database_path.display());
            return Ok(());
        }
        cmd => cmd,
    };

    let database = LocalDatabase::open(&database_path)
        .await
        .with_context(|| format!("could not open database at {}", database_path.display()))?;

    let cmd = match cmd {
        Commands::CreateClient {
            name,
            granularity,
            timezone,
        } => {
            let client_config = ClientConfiguration {
                client_id: Uuid::new_v4(),
                client_name: name,
                backup_granularity: granularity,
                named_timezone: timezone,
                backup_directories: Default::default(),
            };
            client_config.timezone().context("invalid timezone")?;
            let session = database.create_client(&client_config).await?;
            println!(
                "created client {} ({})",
                session.client_config().client_name,
                session.client_config().client_id
            );
            return Ok(());
        }
        cmd => cmd,
    };

    let client = cli
        .client
        .as_deref()
        .context("--client is required for this command")?;
    let session = database.open_client_session(client).await?;

    match cmd {
        Commands::Backup {
            description,
            overwrite,
            full_prescan,
            ignore_last_backup,
            hash_all,
            date,
        } => {
            let backup_date = match date {
                Some(date) => parse_date(&date)?,
                None => Utc::now(),
            };
            run_backup(
                session,
                backup_date,
                overwrite,
                description,
                full_prescan,
                ignore_last_backup,
                hash_all,
            )
            .await
        }
        Commands::Restore {
            date,
            root,
            subpath,
            target,
            no_clobber,
            restore_owner,
            restore_permissions,
            restore_modified_time,
        } => {
            let backup_date = date.as_deref().map(parse_date).transpose()?;
            let toggles = MetaRestoreToggles {
                uid: restore_owner,
                gid: restore_owner,
                mode: restore_permissions,
                modified_time: restore_modified_time,
            };
            run_restore(
                session,
                backup_date,
                root,
                subpath,
                target,
                !no_clobber,
                toggles,
            )
            .await
        }
        Commands::ListBackups => {
            let client_config = session.client_config().clone();
            for (backup_date, description) in session.list_backups().await? {
                println!(
                    "{}  {}",
                    client_config.date_string(backup_date),
                    description.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
        Commands::ListSessions => {
            let client_config = session.client_config().clone();
            for config in session.list_backup_sessions().await? {
                println!(
                    "{}  {}  started {}",
                    config.session_id,
                    client_config.date_string(config.backup_date),
                    config.started.to_rfc3339(),
                );
            }
            Ok(())
        }
        Commands::AddRoot { name, path } => {
            if !std::path::Path::new(&path).is_absolute() {
                bail!("root path must be absolute: {path}");
            }
            let mut session = session;
            let mut client_config = session.client_config().clone();
            client_config.backup_directories.insert(
                name.clone(),
                ClientConfiguredBackupDirectory {
                    base_path: path,
                    filters: Vec::new(),
                },
            );
            session.save_client_config(client_config).await?;
            println!("added root {name}");
            Ok(())
        }
        Commands::CreateDatabase { .. } | Commands::CreateClient { .. } => unreachable!(),
    }
}

async fn run_backup(
    session: LocalServerSession,
    backup_date: DateTime<Utc>,
    overwrite: bool,
    description: Option<String>,
    full_prescan: bool,
    ignore_last_backup: bool,
    hash_all: bool,
) -> anyhow::Result<()> {
    let server: Arc<dyn ServerSession> = Arc::new(session);
    let backup_session: Arc<dyn BackupSession> = server
        .start_backup(backup_date, overwrite, description)
        .await?;

    let mut controller = BackupController::new(
        server.clone(),
        backup_session.clone(),
        Arc::new(LocalFileSystemExplorer::new()),
    );
    controller.read_last_backup = !ignore_last_backup;
    controller.match_meta_only = !hash_all;
    controller.full_prescan = full_prescan;
    Arc::new(controller).backup_all().await?;

    let backup = backup_session.complete().await?;
    info!(
        "backup {} completed with {} root(s)",
        server.client_config().date_string(backup.backup_date),
        backup.roots.len()
    );
    Ok(())
}

async fn run_restore(
    session: LocalServerSession,
    backup_date: Option<DateTime<Utc>>,
    root: Option<String>,
    subpath: Option<String>,
    target: Option<String>,
    clobber: bool,
    toggles: MetaRestoreToggles,
) -> anyhow::Result<()> {
    let server: Arc<dyn ServerSession> = Arc::new(session);
    let backup = server
        .get_backup(backup_date)
        .await?
        .context("no backup found")?;

    let mut restorer = RestoreController::new(server, Arc::new(LocalFileSystemExplorer::new()));
    restorer.clobber_existing = clobber;
    restorer.restore_meta =
        toggles.uid || toggles.gid || toggles.mode || toggles.modified_time;
    restorer.toggles = toggles;

    match (root, target) {
        (Some(root), Some(target)) => {
            let root_inode = backup
                .roots
                .get(&root)
                .with_context(|| format!("backup has no root {root:?}"))?;
            restorer
                .partial_restore(root_inode, subpath.as_deref(), &target)
                .await?;
        }
        (None, None) => restorer.full_restore(&backup).await?,
        (None, Some(_)) => bail!("--target requires --root"),
        (Some(_), None) => bail!("--root requires --target"),
    }
    info!("restore completed");
    Ok(())
}

/// Resolve the database argument to a local path. Remote schemes implement
/// the same session interface but are not wired into this build.
fn local_database_path(database: &str) -> anyhow::Result<PathBuf> {
    if let Ok(url) = url::Url::parse(database) {
        return match url.scheme() {
            "file" => url
                .to_file_path()
                .map_err(|()| anyhow::anyhow!("invalid file URL: {database}")),
            "http" | "https" | "s3" => {
                bail!("scheme {}:// is not supported by this build", url.scheme())
            }
            other => bail!("unknown database scheme {other}://"),
        };
    }
    Ok(PathBuf::from(database))
}

fn parse_date(value: &str) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(date) = DateTime::parse_from_rfc3339(value) {
        return Ok(date.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("invalid date {value:?}; use RFC 3339 or YYYY-MM-DD"))?;
    Ok(DateTime::from_naive_utc_and_offset(
        date.and_hms_opt(0, 0, 0).expect("midnight is valid"),
        Utc,
    ))
}
