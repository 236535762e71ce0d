//! Device provisioning: wipe, partition, format, mount and populate a
//! target device as one strictly ordered job.
//!
//! Every OS resource the job acquires is pushed onto the job's stack and
//! released in reverse order when the job ends, whichever way it ends.

use crate::{
    BlockIo, BootforgeError, DeviceInfo, DeviceKind, DeviceError, ErrorKind, FilesystemKind,
    FormatSummary, FormatterRegistry, LogSink, PartitionTableKind, PercentTracker, PipelineError,
    ProgressSink, ProvisionOptions, WorkPaths,
};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const WIPE_CHUNK: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutcome {
    Success,
    Failed(ErrorKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStep {
    Idle,
    DirsPrepared,
    LoopBound,
    DeviceNodeBound,
    Wiped,
    Partitioned,
    PartitionNodeBound,
    Formatted,
    Mounted,
    Populated,
    CleanedUp(JobOutcome),
}

impl PipelineStep {
    fn ordinal(&self) -> u8 {
        match self {
            PipelineStep::Idle => 0,
            PipelineStep::DirsPrepared => 1,
            PipelineStep::LoopBound => 2,
            PipelineStep::DeviceNodeBound => 3,
            PipelineStep::Wiped => 4,
            PipelineStep::Partitioned => 5,
            PipelineStep::PartitionNodeBound => 6,
            PipelineStep::Formatted => 7,
            PipelineStep::Mounted => 8,
            PipelineStep::Populated => 9,
            PipelineStep::CleanedUp(_) => 10,
        }
    }

    /// Human readable label shown while the step runs.
    pub fn label(&self) -> &'static str {
        match self {
            PipelineStep::Idle => "Waiting",
            PipelineStep::DirsPrepared => "Preparing temporary directories",
            PipelineStep::LoopBound => "Binding source image to a loop device",
            PipelineStep::DeviceNodeBound => "Creating device node",
            PipelineStep::Wiped => "Wiping device",
            PipelineStep::Partitioned => "Creating partition table",
            PipelineStep::PartitionNodeBound => "Creating partition node",
            PipelineStep::Formatted => "Formatting partition",
            PipelineStep::Mounted => "Mounting",
            PipelineStep::Populated => "Copying files",
            PipelineStep::CleanedUp(_) => "Cleaning up",
        }
    }

    fn is_destructive(&self) -> bool {
        matches!(
            self,
            PipelineStep::Wiped | PipelineStep::Partitioned | PipelineStep::Formatted
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoopHandle {
    pub device: PathBuf,
}

/// An OS resource owned by a running job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceHandle {
    Claim(PathBuf),
    TempDir(PathBuf),
    Loop(LoopHandle),
    DeviceNode(PathBuf),
    PartitionNode(PathBuf),
    Mount(PathBuf),
}

/// Everything the pipeline asks of the operating system.
pub trait ProvisioningBackend: Send {
    /// Take exclusive ownership of `target` and the scratch paths.
    fn claim(&mut self, target: &Path, paths: &WorkPaths) -> Result<(), BootforgeError>;
    fn release_claim(&mut self, target: &Path) -> Result<(), BootforgeError>;

    fn prepare_dir(&mut self, dir: &Path) -> Result<(), BootforgeError>;
    fn remove_dir(&mut self, dir: &Path) -> Result<(), BootforgeError>;

    fn bind_loop(&mut self, image: &Path) -> Result<LoopHandle, BootforgeError>;
    fn unbind_loop(&mut self, handle: &LoopHandle) -> Result<(), BootforgeError>;

    fn make_device_node(&mut self, target: &Path, node: &Path) -> Result<(), BootforgeError>;
    /// Create a node for the first partition of the device behind `device_node`.
    fn make_partition_node(&mut self, device_node: &Path, node: &Path)
        -> Result<(), BootforgeError>;
    fn remove_node(&mut self, node: &Path) -> Result<(), BootforgeError>;

    fn inspect_device(&self, path: &Path) -> Result<DeviceInfo, BootforgeError>;
    fn open_block(&mut self, path: &Path) -> Result<Box<dyn BlockIo>, BootforgeError>;

    /// Write a table with one partition spanning the device, commit it to the
    /// device and the kernel. Returns whether the boot flag could be set.
    fn create_partition_table(
        &mut self,
        device_node: &Path,
        table: PartitionTableKind,
        filesystem: FilesystemKind,
    ) -> Result<bool, BootforgeError>;

    fn mount(
        &mut self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        read_only: bool,
    ) -> Result<(), BootforgeError>;
    fn unmount(&mut self, target: &Path) -> Result<(), BootforgeError>;

    fn copy_tree(
        &mut self,
        source: &Path,
        dest: &Path,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<(), BootforgeError>;

    /// Flush filesystem buffers before resources are torn down.
    fn sync(&mut self);
}

/// Cooperative cancellation, honoured only until a destructive step begins.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct CleanupReport {
    pub released: Vec<ResourceHandle>,
    pub failures: Vec<(ResourceHandle, String)>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Mutable state of one provisioning run.
pub struct ProvisioningJob<'b> {
    target: PathBuf,
    step: PipelineStep,
    attempting: PipelineStep,
    acquired: Vec<ResourceHandle>,
    last_error: Option<ErrorKind>,
    destructive_started: bool,
    backend: &'b mut dyn ProvisioningBackend,
}

impl<'b> ProvisioningJob<'b> {
    pub fn new(target: &Path, backend: &'b mut dyn ProvisioningBackend) -> Self {
        Self {
            target: target.to_path_buf(),
            step: PipelineStep::Idle,
            attempting: PipelineStep::Idle,
            acquired: Vec::new(),
            last_error: None,
            destructive_started: false,
            backend,
        }
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn step(&self) -> PipelineStep {
        self.step
    }

    pub fn acquired(&self) -> &[ResourceHandle] {
        &self.acquired
    }

    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    fn acquire(&mut self, handle: ResourceHandle) {
        if !self.acquired.contains(&handle) {
            self.acquired.push(handle);
        }
    }

    fn advance(&mut self, step: PipelineStep) {
        debug_assert!(step.ordinal() > self.step.ordinal());
        self.step = step;
    }

    /// Release everything acquired so far, newest first. Individual
    /// failures are logged and skipped. Calling it again is a no-op.
    pub fn cleanup(&mut self, sink: &dyn ProgressSink) -> CleanupReport {
        let mut report = CleanupReport::default();
        if self.acquired.is_empty() {
            return report;
        }

        self.backend.sync();
        while let Some(handle) = self.acquired.pop() {
            let result = match &handle {
                ResourceHandle::Claim(path) => self.backend.release_claim(path),
                ResourceHandle::TempDir(path) => self.backend.remove_dir(path),
                ResourceHandle::Loop(lp) => self.backend.unbind_loop(lp),
                ResourceHandle::DeviceNode(path) | ResourceHandle::PartitionNode(path) => {
                    self.backend.remove_node(path)
                }
                ResourceHandle::Mount(path) => self.backend.unmount(path),
            };
            match result {
                Ok(()) => report.released.push(handle),
                Err(e) => {
                    warn!("Failed to release {:?}: {}", handle, e);
                    sink.log_line(&format!("Could not release {:?}: {}", handle, e));
                    report.failures.push((handle, e.to_string()));
                }
            }
        }
        report
    }
}

impl Drop for ProvisioningJob<'_> {
    fn drop(&mut self) {
        if !self.acquired.is_empty() {
            warn!(
                "Provisioning job for {} dropped while holding {} resource(s)",
                self.target.display(),
                self.acquired.len()
            );
            self.cleanup(&LogSink);
        }
    }
}

/// Result of a finished job.
#[derive(Debug)]
pub struct JobReport {
    pub target: PathBuf,
    /// Always `CleanedUp(..)`.
    pub final_step: PipelineStep,
    pub failed_step: Option<PipelineStep>,
    pub error: Option<BootforgeError>,
    pub format_summary: Option<FormatSummary>,
    pub cleanup: CleanupReport,
}

impl JobReport {
    pub fn outcome(&self) -> JobOutcome {
        match self.final_step {
            PipelineStep::CleanedUp(outcome) => outcome,
            _ => JobOutcome::Failed(ErrorKind::Pipeline),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.outcome() == JobOutcome::Success
    }
}

pub struct Pipeline {
    formatters: Arc<FormatterRegistry>,
    sink: Arc<dyn ProgressSink>,
    cancel: CancelToken,
}

impl Pipeline {
    pub fn new(formatters: Arc<FormatterRegistry>, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            formatters,
            sink,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run one job to completion. Never panics on collaborator failure;
    /// the outcome is in the report.
    pub fn run(
        &self,
        backend: &mut dyn ProvisioningBackend,
        target: &Path,
        options: &ProvisionOptions,
    ) -> JobReport {
        info!("Provisioning {} from {}", target.display(), options.source_image.display());
        let mut job = ProvisioningJob::new(target, backend);

        let result = self.drive(&mut job, options);
        let (format_summary, error, failed_step) = match result {
            Ok(summary) => (Some(summary), None, None),
            Err(e) => {
                let step = job.attempting;
                job.last_error = Some(e.kind());
                error!("{} failed: {}", step.label(), e);
                self.sink
                    .report_status(&format!("{} failed ({}): {}", step.label(), e.kind(), e));
                (None, Some(e), Some(step))
            }
        };

        let cleanup = job.cleanup(self.sink.as_ref());
        let outcome = match &error {
            None => JobOutcome::Success,
            Some(e) => JobOutcome::Failed(e.kind()),
        };
        job.step = PipelineStep::CleanedUp(outcome);
        if outcome == JobOutcome::Success {
            self.sink.report_status("Done");
        }

        JobReport {
            target: job.target.clone(),
            final_step: job.step,
            failed_step,
            error,
            format_summary,
            cleanup,
        }
    }

    fn enter(&self, job: &mut ProvisioningJob<'_>, step: PipelineStep) -> Result<(), BootforgeError> {
        job.attempting = step;
        if self.cancel.is_cancelled() {
            if !job.destructive_started {
                return Err(PipelineError::Cancelled.into());
            }
            warn!("Cancellation ignored, destructive writes already started");
        }
        if step.is_destructive() {
            job.destructive_started = true;
        }
        self.sink.report_status(step.label());
        Ok(())
    }

    fn drive(
        &self,
        job: &mut ProvisioningJob<'_>,
        options: &ProvisionOptions,
    ) -> Result<FormatSummary, BootforgeError> {
        let paths = &options.paths;
        let formatter = self
            .formatters
            .get_formatter(options.filesystem)
            .ok_or_else(|| PipelineError::NoFormatter(format!("{:?}", options.filesystem)))?;
        options.fat.validate()?;

        let target = job.target.clone();
        job.backend.claim(&target, paths)?;
        job.acquire(ResourceHandle::Claim(target.clone()));

        self.enter(job, PipelineStep::DirsPrepared)?;
        for dir in [&paths.image_dir, &paths.mount_dir] {
            job.backend.prepare_dir(dir)?;
            job.acquire(ResourceHandle::TempDir(dir.clone()));
        }
        job.advance(PipelineStep::DirsPrepared);

        self.enter(job, PipelineStep::LoopBound)?;
        let loop_handle = job.backend.bind_loop(&options.source_image)?;
        job.acquire(ResourceHandle::Loop(loop_handle.clone()));
        job.advance(PipelineStep::LoopBound);

        self.enter(job, PipelineStep::DeviceNodeBound)?;
        job.backend.make_device_node(&target, &paths.device_node)?;
        job.acquire(ResourceHandle::DeviceNode(paths.device_node.clone()));
        job.advance(PipelineStep::DeviceNodeBound);

        if !options.quick_format {
            self.enter(job, PipelineStep::Wiped)?;
            self.wipe(job, &paths.device_node)?;
            job.advance(PipelineStep::Wiped);
        }

        self.enter(job, PipelineStep::Partitioned)?;
        let bootable = job.backend.create_partition_table(
            &paths.device_node,
            options.partition_table,
            options.filesystem,
        )?;
        if !bootable {
            warn!("Could not set the boot flag on {:?}", options.partition_table);
            self.sink.log_line("Warning: partition is not marked bootable");
        }
        job.advance(PipelineStep::Partitioned);

        self.enter(job, PipelineStep::PartitionNodeBound)?;
        job.backend
            .make_partition_node(&paths.device_node, &paths.partition_node)?;
        job.acquire(ResourceHandle::PartitionNode(paths.partition_node.clone()));
        job.advance(PipelineStep::PartitionNodeBound);

        self.enter(job, PipelineStep::Formatted)?;
        let info = job.backend.inspect_device(&paths.partition_node)?;
        if !info.is_usable() {
            return Err(DeviceError::Unusable(paths.partition_node.display().to_string()).into());
        }
        let summary = {
            let mut device = job.backend.open_block(&paths.partition_node)?;
            let summary = formatter.format(device.as_mut(), &info, &options.fat, self.sink.as_ref())?;
            device
                .sync_device()
                .map_err(|e| DeviceError::io("syncing the formatted partition", e))?;
            summary
        };
        job.advance(PipelineStep::Formatted);

        self.enter(job, PipelineStep::Mounted)?;
        job.backend.mount(
            &loop_handle.device,
            &paths.image_dir,
            &options.source_fs_type,
            true,
        )?;
        job.acquire(ResourceHandle::Mount(paths.image_dir.clone()));
        job.backend.mount(
            &paths.partition_node,
            &paths.mount_dir,
            options.filesystem.mount_type(),
            false,
        )?;
        job.acquire(ResourceHandle::Mount(paths.mount_dir.clone()));
        job.advance(PipelineStep::Mounted);

        self.enter(job, PipelineStep::Populated)?;
        let mut tracker = PercentTracker::new();
        let sink = self.sink.as_ref();
        job.backend.copy_tree(&paths.image_dir, &paths.mount_dir, &mut |done, total| {
            tracker.update(sink, done, total)
        })?;
        job.advance(PipelineStep::Populated);

        Ok(summary)
    }

    /// Overwrite the whole device with zeros.
    fn wipe(&self, job: &mut ProvisioningJob<'_>, node: &Path) -> Result<(), BootforgeError> {
        let info = job.backend.inspect_device(node)?;
        if info.kind == DeviceKind::Unusable {
            return Err(DeviceError::Unusable(node.display().to_string()).into());
        }
        let sector_size = if info.sector_size == 0 { 512 } else { info.sector_size as u64 };
        let sector_count = info.size_bytes / sector_size;
        let total = sector_count * sector_size;
        if total == 0 {
            return Err(DeviceError::SizeUnknown(node.display().to_string()).into());
        }
        info!("Wiping {} bytes on {}", total, node.display());

        let mut device = job.backend.open_block(node)?;
        device
            .seek(SeekFrom::Start(0))
            .map_err(|e| DeviceError::io("seeking to the start of the device", e))?;

        let zeros = vec![0u8; WIPE_CHUNK];
        let mut tracker = PercentTracker::new();
        let mut written = 0u64;
        while written < total {
            let len = (total - written).min(WIPE_CHUNK as u64) as usize;
            device
                .write_all(&zeros[..len])
                .map_err(|e| DeviceError::io(format!("wiping at byte {}", written), e))?;
            written += len as u64;
            tracker.update(self.sink.as_ref(), written, total);
        }
        device
            .sync_device()
            .map_err(|e| DeviceError::io("syncing the wiped device", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests;
