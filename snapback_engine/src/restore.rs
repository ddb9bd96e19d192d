//! The client-side restore driver.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use snapback_core::{
    Backup, Digest, DirectoryExplorer, Error, FileSystemExplorer, FileType, Inode,
    MetaRestoreToggles, Result, ServerSession,
};
use tracing::{info, warn};

pub struct RestoreController {
    server_session: Arc<dyn ServerSession>,
    explorer: Arc<dyn FileSystemExplorer>,
    /// Replace existing files at the target. Clobbering a directory with a
    /// non-directory is always refused.
    pub clobber_existing: bool,
    /// Restore file metadata at all; `toggles` picks the attributes.
    pub restore_meta: bool,
    pub toggles: MetaRestoreToggles,
}

impl RestoreController {
    pub fn new(
        server_session: Arc<dyn ServerSession>,
        explorer: Arc<dyn FileSystemExplorer>,
    ) -> Self {
        RestoreController {
            server_session,
            explorer,
            clobber_existing: true,
            restore_meta: true,
            toggles: MetaRestoreToggles::default(),
        }
    }

    /// Restore an entire backup to the client's configured locations.
    /// Fails if a backup root has no configured target; warns when the
    /// configuration has directories the backup does not.
    pub async fn full_restore(&self, backup: &Backup) -> Result<()> {
        let client_config = self.server_session.client_config();
        info!(
            "restoring backup {}: {}",
            client_config.date_string(backup.backup_date),
            backup.description.as_deref().unwrap_or("-")
        );
        let target_configuration = &client_config.backup_directories;

        let unconfigured: Vec<&String> = backup
            .roots
            .keys()
            .filter(|root| !target_configuration.contains_key(*root))
            .collect();
        if !unconfigured.is_empty() {
            return Err(Error::InvalidArguments(format!(
                "cannot restore root(s), no target path is configured: {unconfigured:?}"
            )));
        }
        for root in target_configuration.keys() {
            if !backup.roots.contains_key(root) {
                warn!("configured backup directory not in this backup: {root}");
            }
        }

        for (root, source_dir) in &backup.roots {
            let target = self
                .explorer
                .open_root(&target_configuration[root].base_path, &[])?;
            info!("restoring root {root} to {}", target.get_path(None));
            self.restore_directory(source_dir, target.as_ref()).await?;
        }
        Ok(())
    }

    /// Restore a subtree or a single file to an explicit target path.
    /// `source_path` components are always separated with `/` irrespective
    /// of the operating system the backup was taken on.
    pub async fn partial_restore(
        &self,
        backup_root: &Inode,
        source_path: Option<&str>,
        target_path: &str,
    ) -> Result<()> {
        let target = self.explorer.open_root(target_path, &[])?;

        let Some(source_path) = source_path else {
            // Backup roots are always directories.
            return self.restore_directory(backup_root, target.as_ref()).await;
        };

        let mut current = backup_root.clone();
        let mut leaf_name = "";
        for part in source_path.split('/') {
            let directory = self.server_session.get_directory(&current).await?;
            current = directory.children.get(part).cloned().ok_or_else(|| {
                Error::NotFound(format!("path {source_path:?} does not exist in this backup"))
            })?;
            leaf_name = part;
        }
        self.restore_file(&current, target.as_ref(), leaf_name).await
    }

    /// Restore the contents of one backed-up directory into `target`.
    /// Does not touch the metadata of `target` itself.
    pub fn restore_directory<'a>(
        &'a self,
        source_dir: &'a Inode,
        target: &'a dyn DirectoryExplorer,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let directory = self.server_session.get_directory(source_dir).await?;
            for (child_name, inode) in &directory.children {
                self.restore_file(inode, target, child_name).await?;
            }
            Ok(())
        }
        .boxed()
    }

    /// Restore one file or directory as a child of `target`.
    pub async fn restore_file(
        &self,
        inode: &Inode,
        target: &dyn DirectoryExplorer,
        child_name: &str,
    ) -> Result<()> {
        match inode.kind {
            FileType::Directory => {
                target
                    .restore_child(child_name, inode.kind, None, self.clobber_existing)
                    .await?;
                let child_target = target.get_child(child_name);
                self.restore_directory(inode, child_target.as_ref()).await?;
            }
            FileType::Regular | FileType::Link => {
                let mut content = self.server_session.get_file(inode).await?;
                target
                    .restore_child(child_name, inode.kind, Some(&mut content), self.clobber_existing)
                    .await?;
            }
            FileType::Pipe | FileType::Socket => {
                if inode.hash != Some(Digest::EMPTY) {
                    return Err(Error::InvalidArguments(format!(
                        "a {} must be empty, but {} has content {:?}",
                        inode.kind,
                        target.get_path(Some(child_name)),
                        inode.hash
                    )));
                }
                target
                    .restore_child(child_name, inode.kind, None, self.clobber_existing)
                    .await?;
            }
            FileType::CharacterDevice | FileType::BlockDevice => {
                // Metadata-only kinds; the explorer decides what (not) to do.
                target
                    .restore_child(child_name, inode.kind, None, self.clobber_existing)
                    .await?;
            }
        }

        if self.restore_meta {
            target.restore_meta(child_name, inode, self.toggles).await?;
        }
        Ok(())
    }
}
