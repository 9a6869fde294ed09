use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::{
    fs, select,
    sync::{mpsc, oneshot},
};
use tracing::{debug, error, trace};

use crate::{config::ProtocolConfig, error::FiatSwapError};

use super::Persistence;

enum PersisterMsg {
    Write {
        path: PathBuf,
        blob: String,
        rsp_tx: oneshot::Sender<Result<(), FiatSwapError>>,
    },
    Remove {
        path: PathBuf,
        rsp_tx: oneshot::Sender<Result<(), FiatSwapError>>,
    },
    Close,
}

/// Stores each blob as `<data_dir>/<namespace>/<key>.json`. All mutations are
/// funneled through one writer task, and every write lands in a temp file that
/// is renamed over the target, so readers never observe a partial blob.
pub struct FilePersistence {
    data_dir: PathBuf,
    persist_tx: mpsc::Sender<PersisterMsg>,
    task_handle: tokio::task::JoinHandle<()>,
}

impl FilePersistence {
    const PERSIST_CHANNEL_SIZE: usize = 10;

    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let (persist_tx, task_handle) = Self::setup_persistence();

        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            persist_tx,
            task_handle,
        }
    }

    pub fn from_config(config: &ProtocolConfig) -> Self {
        Self::new(&config.data_dir)
    }

    fn setup_persistence() -> (mpsc::Sender<PersisterMsg>, tokio::task::JoinHandle<()>) {
        let (persist_tx, mut persist_rx) = mpsc::channel(Self::PERSIST_CHANNEL_SIZE);
        let task_handle = tokio::spawn(async move {
            loop {
                select! {
                    Some(msg) = persist_rx.recv() => {
                        match msg {
                            PersisterMsg::Write { path, blob, rsp_tx } => {
                                let result = Self::persist(&path, blob).await;
                                if let Some(error) = result.as_ref().err() {
                                    error!("Error persisting data to path {} - {}", path.display(), error);
                                }
                                if rsp_tx.send(result).is_err() {
                                    trace!("Persist requester for {} went away", path.display());
                                }
                            }
                            PersisterMsg::Remove { path, rsp_tx } => {
                                let result = Self::unlink(&path).await;
                                if rsp_tx.send(result).is_err() {
                                    trace!("Remove requester for {} went away", path.display());
                                }
                            }
                            PersisterMsg::Close => {
                                break;
                            }
                        }
                    },
                    else => break,
                }
            }
            debug!("Persistence task exiting");
        });
        (persist_tx, task_handle)
    }

    async fn persist(path: &Path, blob: String) -> Result<(), FiatSwapError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, blob).await?;
        fs::rename(&tmp_path, path).await?;
        Ok(())
    }

    async fn unlink(path: &Path) -> Result<(), FiatSwapError> {
        match fs::remove_file(path).await {
            Ok(_) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    fn path_for(&self, namespace: &str, key: &str) -> PathBuf {
        self.data_dir.join(namespace).join(format!("{}.json", key))
    }

    pub async fn terminate(self) {
        if self.persist_tx.send(PersisterMsg::Close).await.is_err() {
            error!("Persistence channel closed before terminate");
        }
        if let Some(error) = self.task_handle.await.err() {
            error!("Error terminating persistence task - {}", error);
        }
    }
}

#[async_trait]
impl Persistence for FilePersistence {
    async fn read(&self, namespace: &str, key: &str) -> Result<Option<String>, FiatSwapError> {
        let path = self.path_for(namespace, key);
        match fs::read_to_string(&path).await {
            Ok(json) => Ok(Some(json)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    async fn write(&self, namespace: &str, key: &str, blob: String) -> Result<(), FiatSwapError> {
        let (rsp_tx, rsp_rx) = oneshot::channel();
        self.persist_tx
            .send(PersisterMsg::Write {
                path: self.path_for(namespace, key),
                blob,
                rsp_tx,
            })
            .await?;
        rsp_rx.await?
    }

    async fn remove(&self, namespace: &str, key: &str) -> Result<(), FiatSwapError> {
        let (rsp_tx, rsp_rx) = oneshot::channel();
        self.persist_tx
            .send(PersisterMsg::Remove {
                path: self.path_for(namespace, key),
                rsp_tx,
            })
            .await?;
        rsp_rx.await?
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<String>, FiatSwapError> {
        let dir_path = self.data_dir.join(namespace);
        let mut read_dir = match fs::read_dir(&dir_path).await {
            Ok(read_dir) => read_dir,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                keys.push(stem.to_owned());
            }
        }
        keys.sort();
        Ok(keys)
    }
}
