//! End-to-end passthrough: register an adapter, bind a logical unit over the
//! in-memory backing device and drive commands through the public surface.

use std::path::PathBuf;
use std::sync::Arc;

use scsi_passthru::engine;
use scsi_passthru::scsi;
use scsi_passthru::{
    BindConfig, DeviceBinding, DeviceCoords, HbaContext, HostRegistry, MediaClass, MemoryDevice,
    Page, PhysicalHost, SgFragment, SgList, Task, TaskAttrs, TaskData, TaskOutcome,
};
use tokio::sync::oneshot;

fn init_log() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

const COORDS: DeviceCoords = DeviceCoords {
    channel: 0,
    target: 2,
    lun: 0,
};

fn serial_page(serial: &[u8]) -> Vec<u8> {
    let mut page = vec![0x00, 0x80, 0x00, serial.len() as u8];
    page.extend_from_slice(serial);
    page
}

fn setup() -> (Arc<HostRegistry>, Arc<MemoryDevice>) {
    let registry = HostRegistry::new();
    let host = PhysicalHost::new(3, 32, 8, 4096);
    let device = Arc::new(
        MemoryDevice::new(MediaClass::Disk)
            .sector_size(4096)
            .queue_depth(8)
            .inquiry("ACME", "PASSTHRU DISK", "2.01")
            .vpd_page(0x80, serial_page(b"INTEG-001"))
            .read_data((0..=255u8).cycle().take(8192).collect()),
    );
    host.add_device(COORDS, device.clone()).unwrap();
    registry.register(host).unwrap();
    (registry, device)
}

async fn bind(registry: &Arc<HostRegistry>) -> (Arc<HbaContext>, Arc<DeviceBinding>) {
    let hba = HbaContext::attach(registry.clone(), 9);
    hba.set_passthrough_mode(true, Some(3)).unwrap();
    let config = BindConfig {
        host_id: None,
        channel_id: Some(COORDS.channel),
        target_id: Some(COORDS.target),
        lun_id: Some(COORDS.lun),
        block_path: Some(PathBuf::from("/dev/integ-blk")),
    };
    let binding = DeviceBinding::bind(hba.clone(), &config).await.unwrap();
    (hba, binding)
}

async fn run(binding: &Arc<DeviceBinding>, cdb: &[u8], data: TaskData) -> TaskOutcome {
    let (tx, rx) = oneshot::channel();
    let task = Task::new(
        binding.clone(),
        cdb,
        data,
        TaskAttrs::empty(),
        Box::new(move |outcome| {
            let _ = tx.send(outcome);
        }),
    );
    engine::submit(task).unwrap();
    rx.await.unwrap()
}

#[tokio::test]
async fn bind_execute_unbind() {
    init_log();
    let (registry, device) = setup();
    let (hba, binding) = bind(&registry).await;

    assert_eq!(hba.queue_depth(), 32);
    assert_eq!(binding.identity().vendor(), "ACME");
    assert_eq!(binding.identity().serial(), Some("INTEG-001"));
    let limits = binding.queue_limits();
    assert_eq!(limits.sector_size, 4096);
    assert_eq!(limits.max_sectors, 1024);
    assert_eq!(limits.queue_depth, 8);
    let _ = device.drain_log();
    let _ = device.taken_options();

    // Scatter/gather read across two caller pages.
    let pages = [Page::zeroed(), Page::zeroed()];
    let sg = SgList::new(
        pages
            .iter()
            .map(|page| SgFragment {
                page: page.clone(),
                offset: 0,
                len: 4096,
            })
            .collect(),
        8192,
    );
    let outcome = run(&binding, &[0x28, 0, 0, 0, 0, 0, 0, 0, 2, 0], TaskData::ReadSg(sg)).await;
    assert!(outcome.good);
    assert_eq!(outcome.residual, 0);
    let mut buf = [0u8; 4096];
    pages[1].copy_out(0, &mut buf);
    assert_eq!(buf[0], 0); // 4096 % 256 == 0, pattern restarts
    assert_eq!(buf[255], 255);

    // Write path: the payload is gathered from the caller page verbatim.
    let payload = Page::from_slice(&[0xc3; 512]);
    let sg = SgList::new(
        vec![SgFragment {
            page: payload.clone(),
            offset: 0,
            len: 512,
        }],
        512,
    );
    let outcome = run(&binding, &[0x2a, 0, 0, 0, 0, 0, 0, 0, 1, 0], TaskData::WriteSg(sg)).await;
    assert!(outcome.good);
    assert_eq!(device.taken_writes(), vec![(0x2a, vec![0xc3; 512])]);

    // Read-only marking is reflected in MODE SENSE responses.
    binding.set_read_only(true);
    let page = Page::zeroed();
    let sg = SgList::new(
        vec![SgFragment {
            page: page.clone(),
            offset: 0,
            len: 12,
        }],
        12,
    );
    let cdb = scsi::mode_sense6_cdb(0, 12);
    let outcome = run(&binding, &cdb, TaskData::ReadSg(sg)).await;
    assert!(outcome.good);
    let mut header = [0u8; 4];
    page.copy_out(0, &mut header);
    assert_eq!(header[2] & 0x80, 0x80);

    // Teardown releases every claim in order.
    drop(binding);
    assert_eq!(hba.binding_count(), 0);
    assert!(!registry.block_claimed(std::path::Path::new("/dev/integ-blk")));
    hba.detach().unwrap();
    registry.deregister(3).unwrap();
}
