//! Off-thread mirroring of finished checkpoints.
//!
//! Publishing never blocks training and never fails it. A job that fails is
//! kept and retried after the next checkpoint arrives.

use std::{
    fs,
    path::{Path, PathBuf},
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{unbounded, Sender};
use tracing::{info, warn};

use crate::{
    config::{PublishConfig, PublishTarget},
    TrainingError,
};

/// One finished checkpoint directory to mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishJob {
    pub step: u64,
    pub directory: PathBuf,
    pub files: Vec<String>,
}

pub trait Publisher: Send {
    fn publish(&self, job: &PublishJob) -> Result<(), TrainingError>;

    fn describe(&self) -> String;
}

/// Builds the configured publisher. `None` when publishing is disabled or the
/// hub token is missing.
pub fn from_config(
    config: &PublishConfig,
    run_name: &str,
) -> Result<Option<Box<dyn Publisher>>, TrainingError> {
    if !config.enabled {
        return Ok(None);
    }
    match config.target {
        PublishTarget::Hub => {
            let repo_id = config.repo_id.clone().ok_or_else(|| {
                TrainingError::configuration("checkpointing.publish.repo_id is required for hub")
            })?;
            let Ok(token) = std::env::var(&config.token_env) else {
                warn!(
                    variable = %config.token_env,
                    "no hub token in the environment, checkpoint publishing disabled"
                );
                return Ok(None);
            };
            let publisher = HubPublisher::new(
                &config.endpoint,
                repo_id,
                run_name,
                token,
                Duration::from_secs(config.timeout_secs),
            )?;
            Ok(Some(Box::new(publisher)))
        }
        PublishTarget::Directory => {
            let directory = config.directory.clone().ok_or_else(|| {
                TrainingError::configuration(
                    "checkpointing.publish.directory is required for directory publishing",
                )
            })?;
            Ok(Some(Box::new(DirectoryPublisher::new(directory, run_name))))
        }
    }
}

/// Uploads each file with `PUT {endpoint}/{repo_id}/{run}/step_X/{file}`.
pub struct HubPublisher {
    client: reqwest::blocking::Client,
    endpoint: String,
    repo_id: String,
    run_name: String,
    token: String,
}

impl HubPublisher {
    pub fn new(
        endpoint: &str,
        repo_id: String,
        run_name: &str,
        token: String,
        timeout: Duration,
    ) -> Result<Self, TrainingError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| TrainingError::Publish(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            repo_id,
            run_name: run_name.to_string(),
            token,
        })
    }

    fn url(&self, job: &PublishJob, file: &str) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.endpoint,
            self.repo_id,
            self.run_name,
            crate::checkpoint::step_name(job.step),
            file
        )
    }
}

impl Publisher for HubPublisher {
    fn publish(&self, job: &PublishJob) -> Result<(), TrainingError> {
        for file in &job.files {
            let path = job.directory.join(file);
            let body = fs::File::open(&path).map_err(|err| {
                TrainingError::Publish(format!("cannot open {}: {err}", path.display()))
            })?;
            let url = self.url(job, file);
            self.client
                .put(&url)
                .bearer_auth(&self.token)
                .body(reqwest::blocking::Body::from(body))
                .send()
                .and_then(|response| response.error_for_status())
                .map_err(|err| TrainingError::Publish(format!("upload to {url} failed: {err}")))?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("hub:{}/{}", self.repo_id, self.run_name)
    }
}

/// Copies checkpoints into `{root}/{run}/step_X/`.
pub struct DirectoryPublisher {
    root: PathBuf,
}

impl DirectoryPublisher {
    pub fn new(root: impl AsRef<Path>, run_name: &str) -> Self {
        Self {
            root: root.as_ref().join(run_name),
        }
    }
}

impl Publisher for DirectoryPublisher {
    fn publish(&self, job: &PublishJob) -> Result<(), TrainingError> {
        let target = self.root.join(crate::checkpoint::step_name(job.step));
        fs::create_dir_all(&target).map_err(|err| {
            TrainingError::Publish(format!("cannot create {}: {err}", target.display()))
        })?;
        for file in &job.files {
            let from = job.directory.join(file);
            fs::copy(&from, target.join(file)).map_err(|err| {
                TrainingError::Publish(format!("cannot copy {}: {err}", from.display()))
            })?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("dir:{}", self.root.display())
    }
}

/// Background worker fed over a channel. Dropping the queue drains it.
pub struct PublishQueue {
    sender: Option<Sender<PublishJob>>,
    worker: Option<JoinHandle<()>>,
}

impl PublishQueue {
    pub fn spawn(publisher: Box<dyn Publisher>) -> Self {
        let (sender, receiver) = unbounded::<PublishJob>();
        let worker = thread::spawn(move || {
            let mut pending: Vec<PublishJob> = Vec::new();
            while let Ok(job) = receiver.recv() {
                pending.push(job);
                let mut failed = Vec::new();
                for job in pending.drain(..) {
                    if !job.directory.is_dir() {
                        warn!(step = job.step, "checkpoint is gone, dropping publish job");
                        continue;
                    }
                    match publisher.publish(&job) {
                        Ok(()) => {
                            info!(step = job.step, target = %publisher.describe(), "published checkpoint")
                        }
                        Err(err) => {
                            warn!(step = job.step, kind = %err.kind(), error = %err, "publish failed, will retry");
                            failed.push(job);
                        }
                    }
                }
                pending = failed;
            }
            for job in pending {
                warn!(step = job.step, "checkpoint was never published");
            }
        });
        Self {
            sender: Some(sender),
            worker: Some(worker),
        }
    }

    pub fn enqueue(&self, job: PublishJob) {
        if let Some(sender) = &self.sender {
            if sender.send(job).is_err() {
                warn!("publish worker has stopped");
            }
        }
    }
}

impl Drop for PublishQueue {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("publish worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Flaky {
        calls: Arc<Mutex<Vec<(u64, bool)>>>,
    }

    impl Publisher for Flaky {
        fn publish(&self, job: &PublishJob) -> Result<(), TrainingError> {
            let mut calls = self.calls.lock().unwrap();
            let first_attempt = !calls.iter().any(|(step, _)| *step == job.step);
            let ok = !(job.step == 1 && first_attempt);
            calls.push((job.step, ok));
            if ok {
                Ok(())
            } else {
                Err(TrainingError::Publish("offline".into()))
            }
        }

        fn describe(&self) -> String {
            "flaky".into()
        }
    }

    fn job(dir: &Path, step: u64) -> PublishJob {
        PublishJob {
            step,
            directory: dir.to_path_buf(),
            files: vec!["model.safetensors".into()],
        }
    }

    #[test]
    fn failed_job_is_retried_with_the_next_one() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let queue = PublishQueue::spawn(Box::new(Flaky {
            calls: Arc::clone(&calls),
        }));
        queue.enqueue(job(dir.path(), 1));
        queue.enqueue(job(dir.path(), 2));
        drop(queue);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.first(), Some(&(1, false)));
        assert!(calls.contains(&(1, true)));
        assert!(calls.contains(&(2, true)));
    }

    #[test]
    fn directory_publisher_mirrors_files() {
        let source = tempfile::tempdir().unwrap();
        let mirror = tempfile::tempdir().unwrap();
        fs::write(source.path().join("model.safetensors"), b"weights").unwrap();
        let publisher = DirectoryPublisher::new(mirror.path(), "run");
        publisher.publish(&job(source.path(), 10)).unwrap();
        let copied = mirror.path().join("run/step_00000010/model.safetensors");
        assert_eq!(fs::read(copied).unwrap(), b"weights");
    }
}
