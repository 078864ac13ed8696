//! Configuration reload.
//!
//! Reload requests arrive on a single channel regardless of where they come
//! from (SIGHUP, Ctrl+D on an interactive terminal). A dedicated task drains
//! the channel, loads the configuration file and swaps it into the store.
//! A failed load leaves the previous record active.
//!
//! Listen ports are bound once at startup; a reload only changes routing.

use std::io::IsTerminal;
use std::path::PathBuf;

use tokio::io::AsyncReadExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigError};
use crate::store::SharedConfigStore;

/// Source of a reload request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadTrigger {
    /// SIGHUP.
    Hangup,
    /// End of input on an interactive stdin (Ctrl+D).
    StdinEof,
}

/// Reloads a configuration file into a store.
#[derive(Clone)]
pub struct Reloader {
    path: PathBuf,
    store: SharedConfigStore,
}

impl Reloader {
    pub fn new(path: impl Into<PathBuf>, store: SharedConfigStore) -> Self {
        Self {
            path: path.into(),
            store,
        }
    }

    /// Load the configuration file and replace the active record.
    pub fn reload(&self) -> Result<(), ConfigError> {
        match Config::load(&self.path) {
            Ok(config) => {
                self.store.set(config);
                info!(path = %self.path.display(), "Config reloaded");
                Ok(())
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Config reload failed, keeping previous configuration"
                );
                Err(e)
            }
        }
    }

    /// Spawn the reload loop.
    ///
    /// Returns a channel that receives one notification per processed
    /// trigger, whether or not the reload succeeded. The loop ends when all
    /// trigger senders are dropped.
    pub fn spawn(self, mut triggers: mpsc::Receiver<ReloadTrigger>) -> mpsc::Receiver<()> {
        let (done_tx, done_rx) = mpsc::channel(1);

        tokio::spawn(async move {
            while let Some(trigger) = triggers.recv().await {
                debug!(trigger = ?trigger, "Reload requested");
                let _ = self.reload();
                // Nobody listening is fine.
                let _ = done_tx.try_send(());
            }
            debug!("Reload trigger channel closed");
        });

        done_rx
    }
}

/// Forward SIGHUP to the reload channel.
pub fn spawn_hangup_source(tx: mpsc::Sender<ReloadTrigger>) -> std::io::Result<()> {
    let mut sighup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        while sighup.recv().await.is_some() {
            if tx.send(ReloadTrigger::Hangup).await.is_err() {
                break;
            }
        }
    });
    Ok(())
}

/// Request a reload each time an interactive stdin reaches end of input.
///
/// Refuses to start when stdin is not a terminal: a closed pipe or
/// `/dev/null` reports end of input on every read.
pub fn spawn_stdin_source(tx: mpsc::Sender<ReloadTrigger>) -> bool {
    if !std::io::stdin().is_terminal() {
        warn!("stdin is not a terminal, Ctrl+D reload disabled");
        return false;
    }

    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 256];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) => {
                    if tx.send(ReloadTrigger::StdinEof).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "stdin read failed, Ctrl+D reload disabled");
                    break;
                }
            }
        }
    });
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ConfigStore;
    use std::io::{Seek, Write};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn write_config(file: &mut NamedTempFile, content: &str) {
        file.as_file().set_len(0).unwrap();
        file.rewind().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
    }

    fn setup(initial: &str) -> (NamedTempFile, SharedConfigStore, Reloader) {
        let mut file = NamedTempFile::new().unwrap();
        write_config(&mut file, initial);
        let store = Arc::new(ConfigStore::new(Config::load(file.path()).unwrap()));
        let reloader = Reloader::new(file.path(), Arc::clone(&store));
        (file, store, reloader)
    }

    #[test]
    fn test_reload_replaces_rules() {
        let (mut file, store, reloader) = setup("listen: [80]\ndefault: a:1\n");
        assert_eq!(store.get().default, "a:1");

        write_config(&mut file, "listen: [80]\ndefault: b:2\n");
        reloader.reload().unwrap();
        assert_eq!(store.get().default, "b:2");
    }

    #[test]
    fn test_failed_reload_keeps_previous() {
        let (mut file, store, reloader) = setup("listen: [80]\ndefault: a:1\n");

        write_config(&mut file, "listen: [80\n");
        assert!(reloader.reload().is_err());
        assert_eq!(store.get().default, "a:1");

        write_config(&mut file, "listen: []\n");
        assert!(matches!(reloader.reload(), Err(ConfigError::Invalid(_))));
        assert_eq!(store.get().default, "a:1");
    }

    #[tokio::test]
    async fn test_reload_loop_processes_triggers() {
        let (mut file, store, reloader) = setup("listen: [80]\ndefault: a:1\n");
        let (tx, rx) = mpsc::channel(4);
        let mut done = reloader.spawn(rx);

        write_config(&mut file, "listen: [80]\ndefault: b:2\n");
        tx.send(ReloadTrigger::Hangup).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), done.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.get().default, "b:2");

        // A broken file still produces a notification.
        write_config(&mut file, "not: [valid\n");
        tx.send(ReloadTrigger::StdinEof).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), done.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.get().default, "b:2");

        drop(tx);
        assert!(tokio::time::timeout(Duration::from_secs(2), done.recv())
            .await
            .unwrap()
            .is_none());
    }
}
