/// Test utilities and mock collaborators. Nothing here touches real hardware.
use crate::pipeline::{LoopHandle, ProvisioningBackend, ResourceHandle};
use crate::{
    BlockIo, BootforgeError, DeviceInfo, DeviceKind, FatOptions, FilesystemKind, FormatSummary,
    PartitionFormatter, PartitionTableKind, PipelineError, ProgressEvent, ProgressSink, WorkPaths,
};
use std::collections::HashSet;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Fixed-size in-memory disk shared between handles.
#[derive(Clone, Debug)]
pub struct MemoryDisk {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemoryDisk {
    pub fn new(size: usize) -> Self {
        Self::filled(size, 0)
    }

    pub fn filled(size: usize, byte: u8) -> Self {
        Self {
            data: Arc::new(Mutex::new(vec![byte; size])),
        }
    }

    pub fn len(&self) -> u64 {
        self.data.lock().unwrap().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    pub fn handle(&self) -> MemoryBlock {
        MemoryBlock {
            data: self.data.clone(),
            pos: 0,
            fail_writes: false,
            bad_ranges: Vec::new(),
        }
    }
}

/// Cursor over a [`MemoryDisk`] that can be told to fail.
#[derive(Debug)]
pub struct MemoryBlock {
    data: Arc<Mutex<Vec<u8>>>,
    pos: u64,
    fail_writes: bool,
    bad_ranges: Vec<(u64, u64)>,
}

impl MemoryBlock {
    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    /// Reads touching `[start, end)` fail with EIO.
    pub fn with_bad_range(mut self, start: u64, end: u64) -> Self {
        self.bad_ranges.push((start, end));
        self
    }

    fn is_bad(&self, pos: u64) -> bool {
        self.bad_ranges.iter().any(|&(s, e)| pos >= s && pos < e)
    }
}

impl Read for MemoryBlock {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.data.lock().unwrap();
        let len = data.len() as u64;
        if self.pos >= len {
            return Ok(0);
        }
        if self.is_bad(self.pos) {
            return Err(io::Error::new(io::ErrorKind::Other, "simulated read error"));
        }
        let mut n = buf.len().min((len - self.pos) as usize);
        // Stop short of the next bad byte, like a device returning a partial read.
        let end = self.pos + n as u64;
        let pos = self.pos;
        if let Some(bad) = self
            .bad_ranges
            .iter()
            .filter(|&&(s, e)| s < end && e > pos)
            .map(|&(s, _)| s.max(pos))
            .min()
        {
            n = (bad - pos) as usize;
        }
        let start = self.pos as usize;
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for MemoryBlock {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.fail_writes {
            return Err(io::Error::new(io::ErrorKind::Other, "simulated write error"));
        }
        let mut data = self.data.lock().unwrap();
        let len = data.len() as u64;
        if self.pos >= len {
            return Err(io::Error::new(io::ErrorKind::Other, "write past end of device"));
        }
        let n = buf.len().min((len - self.pos) as usize);
        let start = self.pos as usize;
        data[start..start + n].copy_from_slice(&buf[..n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryBlock {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.data.lock().unwrap().len() as i64;
        let next = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::End(off) => len + off,
            SeekFrom::Current(off) => self.pos as i64 + off,
        };
        if next < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "seek before start"));
        }
        self.pos = next as u64;
        Ok(self.pos)
    }
}

impl BlockIo for MemoryBlock {
    fn sync_device(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Where a [`MockBackend`] should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    Claim,
    PrepareDirs,
    BindLoop,
    DeviceNode,
    Wipe,
    Partition,
    PartitionNode,
    Mount,
    Copy,
    /// Every release call fails; cleanup must still visit all of them.
    Release,
}

#[derive(Debug, Default)]
struct BackendState {
    acquired: Vec<ResourceHandle>,
    released: Vec<ResourceHandle>,
    mounts: Vec<(PathBuf, PathBuf, String, bool)>,
    tables: Vec<(PartitionTableKind, FilesystemKind)>,
    sync_calls: usize,
}

/// Simulated operating system: an in-memory disk plus its first partition.
#[derive(Clone)]
pub struct MockBackend {
    pub device: MemoryDisk,
    pub partition: MemoryDisk,
    fail_at: Option<FailPoint>,
    claims: Arc<Mutex<HashSet<PathBuf>>>,
    state: Arc<Mutex<BackendState>>,
    paths: WorkPaths,
    files_in_image: u64,
    boot_flag: bool,
}

impl MockBackend {
    pub fn new(device_size: usize, partition_size: usize) -> Self {
        Self {
            device: MemoryDisk::filled(device_size, 0xA5),
            partition: MemoryDisk::filled(partition_size, 0xA5),
            fail_at: None,
            claims: Arc::new(Mutex::new(HashSet::new())),
            state: Arc::new(Mutex::new(BackendState::default())),
            paths: WorkPaths::default(),
            files_in_image: 4,
            boot_flag: true,
        }
    }

    /// Partition tables come back without a boot flag.
    pub fn without_boot_flag(mut self) -> Self {
        self.boot_flag = false;
        self
    }

    pub fn failing_at(mut self, point: FailPoint) -> Self {
        self.fail_at = Some(point);
        self
    }

    /// Share the claim registry with another backend, as two jobs on one
    /// machine would.
    pub fn sharing_claims_with(mut self, other: &MockBackend) -> Self {
        self.claims = other.claims.clone();
        self
    }

    pub fn acquired(&self) -> Vec<ResourceHandle> {
        self.state.lock().unwrap().acquired.clone()
    }

    pub fn released(&self) -> Vec<ResourceHandle> {
        self.state.lock().unwrap().released.clone()
    }

    pub fn mounts(&self) -> Vec<(PathBuf, PathBuf, String, bool)> {
        self.state.lock().unwrap().mounts.clone()
    }

    pub fn partition_tables(&self) -> Vec<(PartitionTableKind, FilesystemKind)> {
        self.state.lock().unwrap().tables.clone()
    }

    pub fn sync_calls(&self) -> usize {
        self.state.lock().unwrap().sync_calls
    }

    pub fn is_claimed(&self, target: &Path) -> bool {
        self.claims.lock().unwrap().contains(target)
    }

    fn fail(&self, point: FailPoint, step: &str) -> Result<(), BootforgeError> {
        if self.fail_at == Some(point) {
            return Err(PipelineError::collaborator(step, "simulated failure").into());
        }
        Ok(())
    }

    fn record_acquire(&self, handle: ResourceHandle) {
        self.state.lock().unwrap().acquired.push(handle);
    }

    fn record_release(&self, handle: ResourceHandle) -> Result<(), BootforgeError> {
        self.state.lock().unwrap().released.push(handle);
        self.fail(FailPoint::Release, "Release")
    }
}

impl ProvisioningBackend for MockBackend {
    fn claim(&mut self, target: &Path, paths: &WorkPaths) -> Result<(), BootforgeError> {
        self.fail(FailPoint::Claim, "Claim")?;
        let mut claims = self.claims.lock().unwrap();
        if !claims.insert(target.to_path_buf()) {
            return Err(PipelineError::DeviceBusy(target.display().to_string()).into());
        }
        self.paths = paths.clone();
        Ok(())
    }

    fn release_claim(&mut self, target: &Path) -> Result<(), BootforgeError> {
        self.claims.lock().unwrap().remove(target);
        self.record_release(ResourceHandle::Claim(target.to_path_buf()))
    }

    fn prepare_dir(&mut self, dir: &Path) -> Result<(), BootforgeError> {
        self.fail(FailPoint::PrepareDirs, "Preparing directories")?;
        self.record_acquire(ResourceHandle::TempDir(dir.to_path_buf()));
        Ok(())
    }

    fn remove_dir(&mut self, dir: &Path) -> Result<(), BootforgeError> {
        self.record_release(ResourceHandle::TempDir(dir.to_path_buf()))
    }

    fn bind_loop(&mut self, _image: &Path) -> Result<LoopHandle, BootforgeError> {
        self.fail(FailPoint::BindLoop, "Binding loop device")?;
        let handle = LoopHandle {
            device: PathBuf::from("/dev/loop7"),
        };
        self.record_acquire(ResourceHandle::Loop(handle.clone()));
        Ok(handle)
    }

    fn unbind_loop(&mut self, handle: &LoopHandle) -> Result<(), BootforgeError> {
        self.record_release(ResourceHandle::Loop(handle.clone()))
    }

    fn make_device_node(&mut self, _target: &Path, node: &Path) -> Result<(), BootforgeError> {
        self.fail(FailPoint::DeviceNode, "Creating device node")?;
        self.record_acquire(ResourceHandle::DeviceNode(node.to_path_buf()));
        Ok(())
    }

    fn make_partition_node(
        &mut self,
        _device_node: &Path,
        node: &Path,
    ) -> Result<(), BootforgeError> {
        self.fail(FailPoint::PartitionNode, "Creating partition node")?;
        self.record_acquire(ResourceHandle::PartitionNode(node.to_path_buf()));
        Ok(())
    }

    fn remove_node(&mut self, node: &Path) -> Result<(), BootforgeError> {
        let handle = if node == self.paths.partition_node {
            ResourceHandle::PartitionNode(node.to_path_buf())
        } else {
            ResourceHandle::DeviceNode(node.to_path_buf())
        };
        self.record_release(handle)
    }

    fn inspect_device(&self, path: &Path) -> Result<DeviceInfo, BootforgeError> {
        let (size, start) = if path == self.paths.partition_node {
            (self.partition.len(), Some(2048))
        } else if path == self.paths.device_node {
            (self.device.len(), None)
        } else {
            return Ok(DeviceInfo::unusable());
        };
        Ok(DeviceInfo {
            kind: DeviceKind::BlockDevice,
            size_bytes: size,
            sector_size: 512,
            geometry_heads: Some(255),
            geometry_sectors: Some(63),
            partition_start_sector: start,
        })
    }

    fn open_block(&mut self, path: &Path) -> Result<Box<dyn BlockIo>, BootforgeError> {
        if path == self.paths.device_node {
            let block = self.device.handle();
            if self.fail_at == Some(FailPoint::Wipe) {
                return Ok(Box::new(block.failing_writes()));
            }
            Ok(Box::new(block))
        } else if path == self.paths.partition_node {
            Ok(Box::new(self.partition.handle()))
        } else {
            Err(io::Error::new(io::ErrorKind::NotFound, path.display().to_string()).into())
        }
    }

    fn create_partition_table(
        &mut self,
        _device_node: &Path,
        table: PartitionTableKind,
        filesystem: FilesystemKind,
    ) -> Result<bool, BootforgeError> {
        self.fail(FailPoint::Partition, "Creating partition table")?;
        self.state.lock().unwrap().tables.push((table, filesystem));
        Ok(self.boot_flag && table.supports_boot_flag())
    }

    fn mount(
        &mut self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        read_only: bool,
    ) -> Result<(), BootforgeError> {
        self.fail(FailPoint::Mount, "Mounting")?;
        let mut state = self.state.lock().unwrap();
        state.mounts.push((
            source.to_path_buf(),
            target.to_path_buf(),
            fs_type.to_string(),
            read_only,
        ));
        state.acquired.push(ResourceHandle::Mount(target.to_path_buf()));
        Ok(())
    }

    fn unmount(&mut self, target: &Path) -> Result<(), BootforgeError> {
        self.record_release(ResourceHandle::Mount(target.to_path_buf()))
    }

    fn copy_tree(
        &mut self,
        _source: &Path,
        _dest: &Path,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<(), BootforgeError> {
        let total = self.files_in_image;
        on_progress(0, total);
        for done in 1..=total {
            if done == total && self.fail_at == Some(FailPoint::Copy) {
                return Err(PipelineError::collaborator("Copying files", "disk full").into());
            }
            on_progress(done, total);
        }
        Ok(())
    }

    fn sync(&mut self) {
        self.state.lock().unwrap().sync_calls += 1;
    }
}

/// Formatter that only records what it was asked to do.
#[derive(Clone, Default)]
pub struct MockFormatter {
    calls: Arc<Mutex<Vec<DeviceInfo>>>,
    fail: bool,
}

impl MockFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<DeviceInfo> {
        self.calls.lock().unwrap().clone()
    }
}

impl PartitionFormatter for MockFormatter {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn filesystem(&self) -> FilesystemKind {
        FilesystemKind::Fat
    }

    fn format(
        &self,
        device: &mut dyn BlockIo,
        info: &DeviceInfo,
        _options: &FatOptions,
        sink: &dyn ProgressSink,
    ) -> Result<FormatSummary, BootforgeError> {
        self.calls.lock().unwrap().push(info.clone());
        if self.fail {
            return Err(crate::SerializeError::InvalidBootSector("simulated".into()).into());
        }
        device.seek(SeekFrom::Start(0))?;
        device.write_all(b"MOCKFS")?;
        sink.report_progress(100);
        Ok(FormatSummary {
            filesystem: FilesystemKind::Fat,
            fat_bits: 32,
            total_sectors: (info.size_bytes / 512) as u32,
            cluster_count: 0,
            bytes_per_cluster: 4096,
            bad_sectors: 0,
            volume_id: 0,
            warnings: Vec::new(),
        })
    }
}

/// Sink that keeps every event for later inspection.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::Status(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn progress(&self) -> Vec<u8> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::Progress(p) => Some(p),
                _ => None,
            })
            .collect()
    }
}

impl ProgressSink for RecordingSink {
    fn report_progress(&self, percent: u8) {
        self.events.lock().unwrap().push(ProgressEvent::Progress(percent));
    }

    fn report_status(&self, text: &str) {
        self.events.lock().unwrap().push(ProgressEvent::Status(text.to_string()));
    }

    fn log_line(&self, text: &str) {
        self.events.lock().unwrap().push(ProgressEvent::Log(text.to_string()));
    }
}
