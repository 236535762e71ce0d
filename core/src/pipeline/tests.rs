use super::*;
use crate::test_utils::{FailPoint, MockBackend, MockFormatter, RecordingSink};
use crate::{ErrorKind, ProgressEvent};

const DEVICE_SIZE: usize = 8 * 1024 * 1024;
const PARTITION_SIZE: usize = 7 * 1024 * 1024;

fn options(quick: bool) -> ProvisionOptions {
    ProvisionOptions {
        quick_format: quick,
        source_image: PathBuf::from("/tmp/live.iso"),
        ..ProvisionOptions::default()
    }
}

fn pipeline_with(formatter: MockFormatter, sink: Arc<dyn ProgressSink>) -> Pipeline {
    let mut registry = FormatterRegistry::new();
    registry.register(Arc::new(formatter));
    Pipeline::new(Arc::new(registry), sink)
}

fn run(backend: &mut MockBackend, quick: bool) -> (JobReport, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::new());
    let pipeline = pipeline_with(MockFormatter::new(), sink.clone());
    let report = pipeline.run(backend, Path::new("/dev/sdx"), &options(quick));
    (report, sink)
}

#[test]
fn failed_wipe_reports_device_error_and_releases_everything() {
    let mut backend = MockBackend::new(DEVICE_SIZE, PARTITION_SIZE).failing_at(FailPoint::Wipe);
    let (report, _) = run(&mut backend, false);

    assert_eq!(
        report.final_step,
        PipelineStep::CleanedUp(JobOutcome::Failed(ErrorKind::Device))
    );
    assert_eq!(report.failed_step, Some(PipelineStep::Wiped));
    assert!(report.cleanup.is_clean());

    let paths = WorkPaths::default();
    assert_eq!(
        backend.released(),
        vec![
            ResourceHandle::DeviceNode(paths.device_node.clone()),
            ResourceHandle::Loop(LoopHandle {
                device: PathBuf::from("/dev/loop7")
            }),
            ResourceHandle::TempDir(paths.mount_dir.clone()),
            ResourceHandle::TempDir(paths.image_dir.clone()),
            ResourceHandle::Claim(PathBuf::from("/dev/sdx")),
        ]
    );
    for handle in backend.acquired() {
        assert!(backend.released().contains(&handle), "{:?} leaked", handle);
    }
    assert!(!backend.is_claimed(Path::new("/dev/sdx")));
}

#[test]
fn cleanup_runs_once_whichever_step_fails() {
    let points = [
        FailPoint::PrepareDirs,
        FailPoint::BindLoop,
        FailPoint::DeviceNode,
        FailPoint::Wipe,
        FailPoint::Partition,
        FailPoint::PartitionNode,
        FailPoint::Mount,
        FailPoint::Copy,
    ];
    for point in points {
        let mut backend = MockBackend::new(DEVICE_SIZE, PARTITION_SIZE).failing_at(point);
        let (report, _) = run(&mut backend, false);

        assert!(!report.succeeded(), "{:?} should fail the job", point);
        assert_eq!(backend.sync_calls(), 1, "cleanup count for {:?}", point);
        for handle in backend.acquired() {
            assert!(backend.released().contains(&handle), "{:?} leaked at {:?}", handle, point);
        }
        assert!(!backend.is_claimed(Path::new("/dev/sdx")));
    }
}

#[test]
fn cleanup_without_resources_is_a_noop() {
    let mut backend = MockBackend::new(DEVICE_SIZE, PARTITION_SIZE);
    let mut job = ProvisioningJob::new(Path::new("/dev/sdx"), &mut backend);

    let first = job.cleanup(&crate::NullSink);
    let second = job.cleanup(&crate::NullSink);
    assert!(first.released.is_empty() && first.is_clean());
    assert!(second.released.is_empty() && second.is_clean());
    assert_eq!(job.step(), PipelineStep::Idle);
    drop(job);

    assert_eq!(backend.sync_calls(), 0);
    assert!(backend.released().is_empty());
}

#[test]
fn successful_job_walks_every_step_in_order() {
    let mut backend = MockBackend::new(DEVICE_SIZE, PARTITION_SIZE);
    let (report, sink) = run(&mut backend, false);

    assert!(report.succeeded(), "{:?}", report.error);
    assert_eq!(report.final_step, PipelineStep::CleanedUp(JobOutcome::Success));

    let expected: Vec<String> = [
        PipelineStep::DirsPrepared,
        PipelineStep::LoopBound,
        PipelineStep::DeviceNodeBound,
        PipelineStep::Wiped,
        PipelineStep::Partitioned,
        PipelineStep::PartitionNodeBound,
        PipelineStep::Formatted,
        PipelineStep::Mounted,
        PipelineStep::Populated,
    ]
    .iter()
    .map(|s| s.label().to_string())
    .chain(std::iter::once("Done".to_string()))
    .collect();
    assert_eq!(sink.statuses(), expected);

    // The wipe zeroed the whole device.
    assert!(backend.device.snapshot().iter().all(|b| *b == 0));
    assert_eq!(
        backend.partition_tables(),
        vec![(PartitionTableKind::Mbr, FilesystemKind::Fat)]
    );
    assert_eq!(&backend.partition.snapshot()[..6], b"MOCKFS");

    let mounts = backend.mounts();
    assert_eq!(mounts.len(), 2);
    assert_eq!(mounts[0].2, "iso9660");
    assert!(mounts[0].3);
    assert_eq!(mounts[1].2, "vfat");
    assert!(!mounts[1].3);

    let paths = WorkPaths::default();
    let released = backend.released();
    assert_eq!(released[0], ResourceHandle::Mount(paths.mount_dir.clone()));
    assert_eq!(released[1], ResourceHandle::Mount(paths.image_dir.clone()));
    assert_eq!(released[2], ResourceHandle::PartitionNode(paths.partition_node.clone()));
    assert_eq!(released.last(), Some(&ResourceHandle::Claim(PathBuf::from("/dev/sdx"))));
    assert_eq!(sink.progress().last(), Some(&100));
}

#[test]
fn quick_format_skips_the_wipe() {
    let mut backend = MockBackend::new(DEVICE_SIZE, PARTITION_SIZE);
    let (report, sink) = run(&mut backend, true);

    assert!(report.succeeded());
    assert!(!sink
        .statuses()
        .contains(&PipelineStep::Wiped.label().to_string()));
    assert!(backend.device.snapshot().iter().all(|b| *b == 0xA5));
}

#[test]
fn missing_boot_flag_is_only_a_warning() {
    let mut backend = MockBackend::new(DEVICE_SIZE, PARTITION_SIZE).without_boot_flag();
    let (report, sink) = run(&mut backend, true);

    assert!(report.succeeded());
    assert!(sink
        .events()
        .contains(&ProgressEvent::Log("Warning: partition is not marked bootable".to_string())));

    let mut flagged = MockBackend::new(DEVICE_SIZE, PARTITION_SIZE);
    let (_, sink) = run(&mut flagged, true);
    assert!(!sink
        .events()
        .iter()
        .any(|e| matches!(e, ProgressEvent::Log(text) if text.contains("not marked bootable"))));
}

#[test]
fn refuses_a_device_held_by_another_job() {
    let holder = MockBackend::new(DEVICE_SIZE, PARTITION_SIZE);
    let mut first = holder.clone();
    first
        .claim(Path::new("/dev/sdx"), &WorkPaths::default())
        .unwrap();

    let mut second = MockBackend::new(DEVICE_SIZE, PARTITION_SIZE).sharing_claims_with(&holder);
    let (report, _) = run(&mut second, true);

    assert_eq!(
        report.final_step,
        PipelineStep::CleanedUp(JobOutcome::Failed(ErrorKind::Pipeline))
    );
    assert!(matches!(
        report.error,
        Some(BootforgeError::Pipeline(PipelineError::DeviceBusy(_)))
    ));
    assert!(second.acquired().is_empty());
    assert_eq!(second.sync_calls(), 0);
    // The first job's claim is untouched.
    assert!(holder.is_claimed(Path::new("/dev/sdx")));
}

#[test]
fn failing_formatter_is_reported_with_its_step() {
    let mut backend = MockBackend::new(DEVICE_SIZE, PARTITION_SIZE);
    let sink = Arc::new(RecordingSink::new());
    let formatter = MockFormatter::failing();
    let pipeline = pipeline_with(formatter.clone(), sink.clone());

    let report = pipeline.run(&mut backend, Path::new("/dev/sdx"), &options(true));

    assert_eq!(report.outcome(), JobOutcome::Failed(ErrorKind::Serialize));
    assert_eq!(report.failed_step, Some(PipelineStep::Formatted));
    assert_eq!(formatter.calls().len(), 1);
    assert_eq!(formatter.calls()[0].size_bytes, PARTITION_SIZE as u64);
    assert!(sink
        .statuses()
        .iter()
        .any(|s| s.starts_with("Formatting partition failed (SerializeError)")));
    assert!(backend.mounts().is_empty());
}

#[test]
fn release_errors_do_not_fail_the_job() {
    let mut backend = MockBackend::new(DEVICE_SIZE, PARTITION_SIZE).failing_at(FailPoint::Release);
    let (report, _) = run(&mut backend, true);

    assert!(report.succeeded());
    assert!(report.cleanup.released.is_empty());
    assert_eq!(report.cleanup.failures.len(), backend.released().len());
    // Every resource was still visited: claim, two dirs, loop, two nodes, two mounts.
    assert_eq!(backend.released().len(), 8);
}

#[test]
fn cancellation_before_destructive_steps_skips_to_cleanup() {
    let mut backend = MockBackend::new(DEVICE_SIZE, PARTITION_SIZE);
    let sink = Arc::new(RecordingSink::new());
    let pipeline = pipeline_with(MockFormatter::new(), sink.clone());
    pipeline.cancel_token().cancel();

    let report = pipeline.run(&mut backend, Path::new("/dev/sdx"), &options(false));

    assert!(matches!(
        report.error,
        Some(BootforgeError::Pipeline(PipelineError::Cancelled))
    ));
    assert_eq!(report.failed_step, Some(PipelineStep::DirsPrepared));
    assert!(backend.device.snapshot().iter().all(|b| *b == 0xA5));
    assert_eq!(backend.released(), vec![ResourceHandle::Claim(PathBuf::from("/dev/sdx"))]);
}

struct CancelOnStatus {
    token: CancelToken,
    trigger: &'static str,
}

impl ProgressSink for CancelOnStatus {
    fn report_progress(&self, _percent: u8) {}

    fn report_status(&self, text: &str) {
        if text == self.trigger {
            self.token.cancel();
        }
    }

    fn log_line(&self, _text: &str) {}
}

#[test]
fn cancellation_after_destructive_writes_is_ignored() {
    let token = CancelToken::new();
    let sink = Arc::new(CancelOnStatus {
        token: token.clone(),
        trigger: PipelineStep::Partitioned.label(),
    });
    let pipeline = pipeline_with(MockFormatter::new(), sink).with_cancel_token(token.clone());
    let mut backend = MockBackend::new(DEVICE_SIZE, PARTITION_SIZE);

    let report = pipeline.run(&mut backend, Path::new("/dev/sdx"), &options(true));

    assert!(token.is_cancelled());
    assert!(report.succeeded(), "{:?}", report.error);
}

#[test]
fn wipe_progress_is_monotonic() {
    let mut backend = MockBackend::new(DEVICE_SIZE, PARTITION_SIZE);
    let (_, sink) = run(&mut backend, false);

    let wipe_progress: Vec<u8> = sink
        .events()
        .into_iter()
        .skip_while(|e| *e != ProgressEvent::Status(PipelineStep::Wiped.label().to_string()))
        .take_while(|e| *e != ProgressEvent::Status(PipelineStep::Partitioned.label().to_string()))
        .filter_map(|e| match e {
            ProgressEvent::Progress(p) => Some(p),
            _ => None,
        })
        .collect();
    assert!(!wipe_progress.is_empty());
    assert!(wipe_progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(wipe_progress.last(), Some(&100));
}
