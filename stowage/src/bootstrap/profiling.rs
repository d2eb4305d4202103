//! Profiling stage and the resource sampler behind `-profile-cpu`.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, warn};

use super::context::BootstrapContext;
use super::pipeline::Stage;
use crate::errors::BootstrapError;

/// Interval between two CPU profile samples.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, Serialize)]
struct Sample {
    elapsed_ms: u128,
    cpu_percent: f32,
    memory_bytes: u64,
}

#[derive(Debug, Serialize)]
struct MemoryProfile {
    pid: u32,
    elapsed_ms: u128,
    memory_bytes: u64,
    virtual_memory_bytes: u64,
    total_memory_bytes: u64,
}

struct Sampler {
    stop: mpsc::Sender<()>,
    handle: thread::JoinHandle<std::io::Result<()>>,
}

/// Times the invocation and optionally samples CPU and memory.
pub struct Profiler {
    started: Instant,
    pid: Pid,
    mem_path: Option<PathBuf>,
    sampler: Mutex<Option<Sampler>>,
    finished: AtomicBool,
}

impl Profiler {
    /// Starts timing; samples into `cpu_path` every [`SAMPLE_INTERVAL`] when set.
    pub fn start(cpu_path: Option<&Path>, mem_path: Option<PathBuf>) -> Result<Self, BootstrapError> {
        let started = Instant::now();
        let pid = Pid::from_u32(std::process::id());

        let sampler = match cpu_path {
            Some(path) => {
                let file = File::create(path).map_err(|e| {
                    BootstrapError::Profiling(format!("could not create CPU profile {}: {e}", path.display()))
                })?;
                let (stop, rx) = mpsc::channel();
                let handle = thread::Builder::new()
                    .name("cpu-profile".into())
                    .spawn(move || sample(file, pid, started, &rx))
                    .map_err(|e| BootstrapError::Profiling(e.to_string()))?;
                debug!(path = %path.display(), "CPU profiling started");
                Some(Sampler { stop, handle })
            }
            None => None,
        };

        Ok(Self {
            started,
            pid,
            mem_path,
            sampler: Mutex::new(sampler),
            finished: AtomicBool::new(false),
        })
    }

    /// Time since the profiler started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Returns whether [`Profiler::finish`] has run.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Stops sampling and writes the memory profile. Only the first call does anything.
    pub fn finish(&self) -> Result<(), BootstrapError> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut result = Ok(());
        if let Some(sampler) = self.sampler.lock().take() {
            let _ = sampler.stop.send(());
            result = match sampler.handle.join() {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(BootstrapError::Profiling(format!("could not write CPU profile: {e}"))),
                Err(_) => Err(BootstrapError::Profiling("CPU profiler panicked".into())),
            };
        }

        if let Some(path) = &self.mem_path {
            self.write_memory_profile(path)?;
        }
        result
    }

    fn write_memory_profile(&self, path: &Path) -> Result<(), BootstrapError> {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        let (memory_bytes, virtual_memory_bytes) = system
            .process(self.pid)
            .map_or((0, 0), |p| (p.memory(), p.virtual_memory()));

        let profile = MemoryProfile {
            pid: self.pid.as_u32(),
            elapsed_ms: self.elapsed().as_millis(),
            memory_bytes,
            virtual_memory_bytes,
            total_memory_bytes: system.total_memory(),
        };
        let data = serde_json::to_vec_pretty(&profile).map_err(|e| BootstrapError::Profiling(e.to_string()))?;
        std::fs::write(path, data).map_err(|e| {
            BootstrapError::Profiling(format!("could not write memory profile {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), "memory profile written");
        Ok(())
    }
}

impl std::fmt::Debug for Profiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Profiler")
            .field("elapsed", &self.elapsed())
            .field("sampling", &self.sampler.lock().is_some())
            .field("mem_path", &self.mem_path)
            .field("finished", &self.is_finished())
            .finish()
    }
}

fn sample(file: File, pid: Pid, started: Instant, stop: &mpsc::Receiver<()>) -> std::io::Result<()> {
    let mut out = BufWriter::new(file);
    let mut system = System::new();
    loop {
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        if let Some(process) = system.process(pid) {
            let line = Sample {
                elapsed_ms: started.elapsed().as_millis(),
                cpu_percent: process.cpu_usage(),
                memory_bytes: process.memory(),
            };
            serde_json::to_writer(&mut out, &line)?;
            out.write_all(b"\n")?;
        }
        match stop.recv_timeout(SAMPLE_INTERVAL) {
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            _ => break,
        }
    }
    out.flush()
}

/// Starts the profiler and registers its finalization.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProfilingStage;

#[async_trait]
impl Stage for ProfilingStage {
    fn name(&self) -> &str {
        "profiling"
    }

    async fn execute(&self, ctx: &mut BootstrapContext) -> Result<(), BootstrapError> {
        let profiler = Arc::new(Profiler::start(
            ctx.options.profile_cpu.as_deref(),
            ctx.options.profile_mem.clone(),
        )?);

        let registered = profiler.clone();
        ctx.cleanup().register("stop profiling", move || {
            registered.finish().map_err(|e| {
                warn!(error = %e, "profiling finalization failed");
                anyhow::Error::new(e)
            })
        });
        ctx.profiler = Some(profiler);
        Ok(())
    }
}
