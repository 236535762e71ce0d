// End-to-end provisioning against the simulated backend with the real FAT formatter

use bootforge_core::test_utils::{FailPoint, MockBackend, RecordingSink};
use bootforge_core::{
    ErrorKind, FatOptions, JobOutcome, Pipeline, PipelineStep, ProgressSink, ProvisionOptions,
};
use bootforge_formatters::{builtin_registry, FatLayout, FatType};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DEVICE: usize = 40 * 1024 * 1024;
const PARTITION: usize = 39 * 1024 * 1024;

fn options() -> ProvisionOptions {
    ProvisionOptions {
        source_image: PathBuf::from("/srv/images/rescue.iso"),
        fat: FatOptions {
            label: Some("rescue".into()),
            verify_after_format: true,
            ..FatOptions::default()
        },
        ..ProvisionOptions::default()
    }
}

fn pipeline(sink: Arc<RecordingSink>) -> Pipeline {
    Pipeline::new(Arc::new(builtin_registry()), sink as Arc<dyn ProgressSink>)
}

#[test]
fn provisioning_lays_a_fat_filesystem_on_the_partition() {
    let mut backend = MockBackend::new(DEVICE, PARTITION);
    let sink = Arc::new(RecordingSink::new());

    let report = pipeline(sink.clone()).run(&mut backend, Path::new("/dev/sdz"), &options());
    assert!(report.succeeded(), "{:?}", report.error);

    let summary = report.format_summary.expect("formatter ran");
    assert_eq!(summary.fat_bits, 16);

    let partition = backend.partition.snapshot();
    let layout = FatLayout::from_boot_sector(&partition[..512]).unwrap();
    assert_eq!(layout.fat_type, FatType::Fat16);
    assert_eq!(layout.cluster_count, summary.cluster_count);
    assert_eq!(layout.hidden_sectors, 2048);
    assert_eq!(&partition[43..54], b"RESCUE     ");

    let root = layout.root_dir_start_sector() as usize * 512;
    assert_eq!(&partition[root..root + 11], b"RESCUE     ");
    assert!(report.cleanup.is_clean());
}

#[test]
fn full_format_zeroes_the_disk_before_partitioning() {
    let mut backend = MockBackend::new(DEVICE, PARTITION);
    let sink = Arc::new(RecordingSink::new());
    let mut opts = options();
    opts.quick_format = false;

    let report = pipeline(sink.clone()).run(&mut backend, Path::new("/dev/sdz"), &opts);
    assert!(report.succeeded());
    assert!(backend.device.snapshot().iter().all(|b| *b == 0));
    assert!(sink.statuses().iter().any(|s| s == "Wiping device"));
}

#[test]
fn plan_failure_is_reported_at_the_format_step() {
    let mut backend = MockBackend::new(DEVICE, PARTITION);
    let sink = Arc::new(RecordingSink::new());
    let mut opts = options();
    opts.fat.fat_bits = Some(32);
    opts.fat.backup_boot_sector = Some(1);

    let report = pipeline(sink.clone()).run(&mut backend, Path::new("/dev/sdz"), &opts);
    assert_eq!(
        report.final_step,
        PipelineStep::CleanedUp(JobOutcome::Failed(ErrorKind::Plan))
    );
    assert_eq!(report.failed_step, Some(PipelineStep::Formatted));
    assert!(report.cleanup.is_clean());
    assert!(!backend.is_claimed(Path::new("/dev/sdz")));
}

#[test]
fn copy_failure_still_leaves_a_valid_filesystem() {
    let mut backend = MockBackend::new(DEVICE, PARTITION).failing_at(FailPoint::Copy);
    let sink = Arc::new(RecordingSink::new());

    let report = pipeline(sink).run(&mut backend, Path::new("/dev/sdz"), &options());
    assert_eq!(report.failed_step, Some(PipelineStep::Populated));
    assert_eq!(report.outcome(), JobOutcome::Failed(ErrorKind::Pipeline));
    assert!(FatLayout::from_boot_sector(&backend.partition.snapshot()[..512]).is_ok());
}

#[test]
fn job_config_from_json_drives_the_formatter() {
    let opts: ProvisionOptions = serde_json::from_str(
        r#"{
            "source_image": "/srv/images/live.iso",
            "partition_table": "gpt",
            "fat": { "fat_bits": 32, "invariant": true, "label": "live" }
        }"#,
    )
    .unwrap();
    let mut backend = MockBackend::new(DEVICE, PARTITION);
    let sink = Arc::new(RecordingSink::new());

    let report = pipeline(sink).run(&mut backend, Path::new("/dev/sdz"), &opts);
    assert!(report.succeeded(), "{:?}", report.error);

    let summary = report.format_summary.unwrap();
    assert_eq!(summary.fat_bits, 32);
    assert_eq!(summary.volume_id, 0x1234ABCD);
    assert_eq!(
        backend.partition_tables(),
        vec![(bootforge_core::PartitionTableKind::Gpt, bootforge_core::FilesystemKind::Fat)]
    );
    let partition = backend.partition.snapshot();
    assert_eq!(&partition[82..90], b"FAT32   ");
}
