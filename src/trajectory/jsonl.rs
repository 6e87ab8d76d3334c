use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::{EpisodeSummary, RecorderState, StepRecord, TrajectoryHeader, TrajectoryRecord, TrajectoryRecorder};

/// Writes one JSON object per line to `<dir>/<episode_id>.jsonl`.
///
/// Every record is flushed and synced before the call returns, so a
/// crash between steps leaves every completed step on disk.
pub struct JsonlTrajectoryRecorder {
    path: PathBuf,
    file: File,
    state: RecorderState,
}

impl JsonlTrajectoryRecorder {
    pub async fn create(dir: &Path, episode_id: &str) -> Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create trajectory dir: {}", dir.display()))?;
        let path = dir.join(format!("{episode_id}.jsonl"));
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to create trajectory file: {}", path.display()))?;
        Ok(Self {
            path,
            file,
            state: RecorderState::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_record(&mut self, record: &TrajectoryRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record).context("failed to serialize trajectory record")?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .await
            .with_context(|| format!("failed to write trajectory file: {}", self.path.display()))?;
        self.file.flush().await.context("failed to flush trajectory file")?;
        self.file.sync_data().await.context("failed to sync trajectory file")?;
        Ok(())
    }
}

#[async_trait]
impl TrajectoryRecorder for JsonlTrajectoryRecorder {
    async fn begin(&mut self, header: &TrajectoryHeader) -> Result<()> {
        self.state.check_begin()?;
        self.write_record(&TrajectoryRecord::Header(header.clone())).await?;
        self.state.began();
        Ok(())
    }

    async fn append(&mut self, step: &StepRecord) -> Result<()> {
        self.state.check_append(step.step)?;
        self.write_record(&TrajectoryRecord::Step(step.clone())).await?;
        self.state.appended();
        Ok(())
    }

    async fn finalize(&mut self, summary: &EpisodeSummary) -> Result<()> {
        self.state.check_finalize()?;
        self.write_record(&TrajectoryRecord::Summary(summary.clone())).await?;
        self.state.finished();
        tracing::debug!(path = %self.path.display(), steps = summary.steps, "trajectory finalized");
        Ok(())
    }

    fn location(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trajectory::read_trajectory;
    use crate::trajectory::tests::{header, step, summary};

    #[tokio::test]
    async fn writes_readable_jsonl() {
        let tmp = tempfile::tempdir().unwrap();
        let mut rec = JsonlTrajectoryRecorder::create(tmp.path(), "ep-1").await.unwrap();
        rec.begin(&header()).await.unwrap();
        rec.append(&step(0)).await.unwrap();
        rec.append(&step(1)).await.unwrap();

        // Durable before finalize.
        let partial = read_trajectory(rec.path()).unwrap();
        assert_eq!(partial.steps.len(), 2);
        assert!(partial.summary.is_none());

        rec.finalize(&summary()).await.unwrap();
        let raw = std::fs::read_to_string(rec.path()).unwrap();
        assert_eq!(raw.lines().count(), 4);

        let t = read_trajectory(rec.path()).unwrap();
        assert_eq!(t.header.task_id, "cifar10");
        let indices: Vec<u32> = t.steps.iter().map(|s| s.step).collect();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(t.summary.unwrap().steps, 2);
    }

    #[tokio::test]
    async fn refuses_out_of_order_and_late_appends() {
        let tmp = tempfile::tempdir().unwrap();
        let mut rec = JsonlTrajectoryRecorder::create(tmp.path(), "ep-2").await.unwrap();
        rec.begin(&header()).await.unwrap();
        assert!(rec.append(&step(1)).await.is_err());
        rec.append(&step(0)).await.unwrap();
        rec.finalize(&summary()).await.unwrap();
        assert!(rec.append(&step(1)).await.is_err());

        let t = read_trajectory(rec.path()).unwrap();
        assert_eq!(t.steps.len(), 1);
    }

    #[tokio::test]
    async fn does_not_clobber_existing_trajectory() {
        let tmp = tempfile::tempdir().unwrap();
        let _first = JsonlTrajectoryRecorder::create(tmp.path(), "ep-3").await.unwrap();
        assert!(JsonlTrajectoryRecorder::create(tmp.path(), "ep-3").await.is_err());
    }
}
