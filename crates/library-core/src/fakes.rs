//! In-memory fakes for core traits (testing only)

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::channel::{bootstrap, ChannelIndexer};
use crate::error::ChannelError;

/// Records every reindex request instead of running a command.
#[derive(Debug, Default)]
pub struct RecordingIndexer {
    calls: Mutex<Vec<(PathBuf, String)>>,
}

impl RecordingIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(channel, channel_name)` pairs in call order.
    pub fn calls(&self) -> Vec<(PathBuf, String)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.calls().into_iter().map(|(_, name)| name).collect()
    }
}

#[async_trait]
impl ChannelIndexer for RecordingIndexer {
    async fn reindex(&self, channel: &Path, channel_name: &str) -> Result<(), ChannelError> {
        bootstrap(channel).await?;
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((channel.to_path_buf(), channel_name.to_string()));
        Ok(())
    }
}
