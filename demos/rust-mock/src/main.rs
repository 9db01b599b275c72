//! Minimal mock image-processing backend driven by the job tracker.
//!
//! Uploads are "processed" in memory: each job answers a few status checks
//! with `{"status": "processing"}` and then returns the image bytes, the same
//! way the real backend hands over the artifact instead of a final status.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use job_tracker::{
    FileStore, JobEvent, JobId, JobRegistry, RawResponse, StatusSource, TrackerConfig,
    TrackerError, TrackerResult,
};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;

/// Per-job script: remaining "processing" answers, or a failure.
enum MockJob {
    Processing { remaining: u32 },
    Broken,
}

/// In-memory mock backend.
struct MockBackend {
    jobs: Mutex<FxHashMap<String, MockJob>>,
    next_id: AtomicU64,
}

impl MockBackend {
    fn new() -> Self {
        Self {
            jobs: Mutex::new(FxHashMap::default()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Accept an upload and return the backend's upload response.
    fn upload(&self, name: &str, checks_until_ready: u32) -> serde_json::Value {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("img-{}-{n}", std::process::id());
        let job = if name.ends_with(".txt") {
            MockJob::Broken
        } else {
            MockJob::Processing {
                remaining: checks_until_ready,
            }
        };
        self.jobs.lock().unwrap().insert(id.clone(), job);
        serde_json::json!({
            "image_id": id,
            "status": "uploaded",
            "message": format!("{name} queued for processing"),
        })
    }
}

#[async_trait]
impl StatusSource for MockBackend {
    fn name(&self) -> &str {
        "mock-image-backend"
    }

    async fn check(&self, job_id: &JobId) -> TrackerResult<RawResponse> {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(job_id.as_str()) else {
            return Ok(RawResponse::NotFound);
        };
        Ok(match job {
            MockJob::Broken => RawResponse::json(&serde_json::json!({
                "status": "failed",
                "error": "not an image",
            })),
            MockJob::Processing { remaining: 0 } => {
                RawResponse::artifact("image/png", b"\x89PNG\r\n\x1a\n".to_vec())
            }
            MockJob::Processing { remaining } => {
                *remaining -= 1;
                RawResponse::json(&serde_json::json!({ "status": "processing" }))
            }
        })
    }

    async fn delete(&self, job_id: &JobId) -> TrackerResult<()> {
        self.jobs
            .lock()
            .unwrap()
            .remove(job_id.as_str())
            .map(|_| ())
            .ok_or_else(|| TrackerError::NotFound(job_id.clone()))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "job_tracker=debug".into()),
        )
        .init();

    let backend = Arc::new(MockBackend::new());
    let store_path = std::env::temp_dir().join("job-tracker-demo").join("jobs.json");
    let registry = JobRegistry::builder(Arc::clone(&backend))
        .store(Arc::new(FileStore::new(&store_path)))
        .config(
            TrackerConfig::default()
                .with_poll_interval(Duration::from_millis(200))
                .with_max_attempts(10),
        )
        .build()?;

    println!("Backend: {}", backend.name());
    println!("Store:   {}", store_path.display());
    println!("Restored {} job(s)", registry.list().len());
    println!();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = registry.subscribe(move |event: &JobEvent| {
        let _ = tx.send(event.clone());
    });

    // Upload
    let mut pending = Vec::new();
    for (name, checks) in [("cat.png", 2), ("dog.jpg", 4), ("notes.txt", 0)] {
        let response = backend.upload(name, checks);
        let id = response["image_id"].as_str().unwrap_or_default().to_string();
        registry.submit_with_metadata(id.as_str(), response)?;
        pending.push(JobId::new(id));
    }

    // Check the first upload right away instead of waiting for the poller
    if let Some(first) = pending.first() {
        let record = registry.check_now(first).await?;
        println!("{}: checked now, {} after {} check(s)", record.id, record.state, record.attempts);
    }

    // Watch
    while !pending.is_empty() {
        let Some(event) = rx.recv().await else { break };
        if let JobEvent::Transitioned { previous, record } = &event {
            println!("{}: {} -> {}", record.id, previous, record.state);
            if record.is_terminal() {
                pending.retain(|id| id != &record.id);
            }
        }
    }
    println!();

    println!("Jobs:");
    for record in registry.list() {
        println!(
            "  {:<14} {:<28} checks: {:<2} {}",
            record.id.as_str(),
            record.state.to_string(),
            record.attempts,
            record.result_locator.as_deref().unwrap_or("-")
        );
    }

    // Delete the finished ones
    for record in registry.list() {
        registry.delete(&record.id).await?;
    }
    println!("\nRemaining after delete: {}", registry.list().len());

    Ok(())
}
