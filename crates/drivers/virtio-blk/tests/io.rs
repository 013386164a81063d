// Blocking request path against the fake block device

mod common;

use common::FakeBlockDevice;
use los_virtio::DeviceStatus;
use los_virtio::testing::StdHal;
use virtio_blk::{BlkFeatures, BlockError, DriverConfig, DriverState, SharedVirtioBlk, VirtioBlk};

type Blk = VirtioBlk<StdHal, FakeBlockDevice>;

fn ready(dev: &FakeBlockDevice) -> Blk {
    VirtioBlk::new(dev.clone(), DriverConfig::default()).unwrap()
}

fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Tests: written block reads back and lands at the right disk offset
#[test]
fn test_write_then_read() {
    let dev = FakeBlockDevice::new(2048);
    let mut blk = ready(&dev);
    let data = pattern(7, 512);

    assert_eq!(blk.write(5, &data), Ok(512));
    let mut buf = [0u8; 512];
    assert_eq!(blk.read(5, &mut buf), Ok(512));
    assert_eq!(buf.as_slice(), data.as_slice());
    assert_eq!(dev.disk(5 * 512, 512), data);

    let t = blk.telemetry();
    assert_eq!((t.submitted, t.completed, t.failed), (2, 2, 0));
    assert_eq!(blk.free_descriptors(), 16);
}

/// Tests: reads see data placed on the disk by someone else
#[test]
fn test_read_existing_data() {
    let dev = FakeBlockDevice::new(2048);
    let data = pattern(1, 512);
    dev.fill_disk(100 * 512, &data);
    let mut blk = ready(&dev);

    let mut buf = [0u8; 512];
    blk.read(100, &mut buf).unwrap();
    assert_eq!(buf.as_slice(), data.as_slice());
}

/// Tests: 4 KiB logical blocks address eight device sectors each
#[test]
fn test_large_block_addressing() {
    let dev = FakeBlockDevice::new(2048);
    dev.set_features(BlkFeatures::VERSION_1 | BlkFeatures::BLK_SIZE);
    dev.set_blk_size(4096);
    let mut blk = ready(&dev);
    let data = pattern(3, 4096);

    assert_eq!(blk.write(1, &data), Ok(4096));
    assert_eq!(dev.disk(8 * 512, 4096), data);
}

/// Tests: a block number whose sector overflows is refused before submission
#[test]
fn test_block_number_overflow() {
    let dev = FakeBlockDevice::new(2048);
    dev.set_features(BlkFeatures::VERSION_1 | BlkFeatures::BLK_SIZE);
    dev.set_blk_size(4096);
    let mut blk = ready(&dev);
    let before = dev.notifications();

    let mut buf = [0u8; 4096];
    assert_eq!(blk.read(u64::MAX / 2, &mut buf), Err(BlockError::InvalidSize));
    assert_eq!(blk.write(u64::MAX / 8 + 1, &buf), Err(BlockError::InvalidSize));
    assert_eq!(dev.notifications(), before);
    assert_eq!(blk.free_descriptors(), 16);

    let shared = SharedVirtioBlk::new(blk);
    assert_eq!(shared.read(u64::MAX, &mut buf), Err(BlockError::InvalidSize));
    assert_eq!(shared.write(u64::MAX / 2, &buf), Err(BlockError::InvalidSize));
    assert!(shared.lock().is_ready());
}

/// Tests: IOERR from the device surfaces and frees the chain
#[test]
fn test_device_io_error() {
    let dev = FakeBlockDevice::new(2048);
    dev.fail_sector(100);
    let mut blk = ready(&dev);

    assert_eq!(blk.write(100, &[0x11; 512]), Err(BlockError::IoError));
    assert_eq!(blk.free_descriptors(), 16);
    let mut buf = [0u8; 512];
    assert_eq!(blk.read(100, &mut buf), Err(BlockError::IoError));
    assert_eq!(blk.free_descriptors(), 16);
    assert_eq!(blk.telemetry().failed, 2);
    assert_eq!(dev.disk(100 * 512, 512), vec![0u8; 512]);
    // Neighbours still work
    assert_eq!(blk.read(101, &mut buf), Ok(512));
    assert!(blk.is_ready());
}

/// Tests: reads past the end come back as IOERR
#[test]
fn test_read_past_end() {
    let dev = FakeBlockDevice::new(16);
    let mut blk = ready(&dev);
    let mut buf = [0u8; 512];
    assert_eq!(blk.read(16, &mut buf), Err(BlockError::IoError));
}

/// Tests: flush reaches the device when negotiated
#[test]
fn test_flush() {
    let dev = FakeBlockDevice::new(2048);
    let mut blk = ready(&dev);
    assert_eq!(blk.flush(), Ok(()));
    assert_eq!(dev.flushes(), 1);
}

/// Tests: flush without the feature is refused locally
#[test]
fn test_flush_not_negotiated() {
    let dev = FakeBlockDevice::new(2048);
    dev.set_features(BlkFeatures::VERSION_1);
    let mut blk = ready(&dev);
    let before = dev.notifications();

    assert_eq!(blk.flush(), Err(BlockError::Unsupported));
    assert_eq!(dev.notifications(), before);
    assert_eq!(dev.flushes(), 0);
}

/// Tests: read-only devices refuse writes but serve reads
#[test]
fn test_read_only() {
    let dev = FakeBlockDevice::new(2048);
    dev.set_features(BlkFeatures::VERSION_1 | BlkFeatures::RO);
    let mut blk = ready(&dev);
    assert!(blk.info().read_only);

    assert_eq!(blk.write(0, &[0u8; 512]), Err(BlockError::ReadOnly));
    let mut buf = [0u8; 512];
    assert_eq!(blk.read(0, &mut buf), Ok(512));
    assert_eq!(blk.telemetry().submitted, 1);
}

/// Tests: empty and oversized buffers never reach the device
#[test]
fn test_invalid_sizes() {
    let dev = FakeBlockDevice::new(2048);
    let mut blk = ready(&dev);
    let before = dev.notifications();

    assert_eq!(blk.read(0, &mut []), Err(BlockError::InvalidSize));
    let mut big = [0u8; 1024];
    assert_eq!(blk.read(0, &mut big), Err(BlockError::InvalidSize));
    assert_eq!(blk.write(0, &[]), Err(BlockError::InvalidSize));
    assert_eq!(dev.notifications(), before);
    assert_eq!(blk.free_descriptors(), 16);
}

/// Tests: GET_SIZE answers the capacity in 512-byte sectors
#[test]
fn test_get_capacity() {
    let dev = FakeBlockDevice::new(2048);
    let mut blk = ready(&dev);
    assert_eq!(blk.get_capacity(), Ok(2048));
}

/// Tests: a completion that left the status byte untouched is a protocol error
#[test]
fn test_status_never_written() {
    let dev = FakeBlockDevice::new(2048);
    dev.leave_status_unset(true);
    let mut blk = ready(&dev);

    let mut buf = [0u8; 512];
    assert_eq!(blk.read(0, &mut buf), Err(BlockError::ProtocolError));
    assert_eq!(blk.telemetry().protocol_errors, 1);
    assert_eq!(blk.free_descriptors(), 16);
}

/// Tests: NEEDS_RESET stops the driver before it submits
#[test]
fn test_device_needs_reset() {
    let dev = FakeBlockDevice::new(2048);
    let mut blk = ready(&dev);
    dev.with_regs(|r| r.set_status_bits(DeviceStatus::DEVICE_NEEDS_RESET));
    let before = dev.notifications();

    let mut buf = [0u8; 512];
    assert_eq!(blk.read(0, &mut buf), Err(BlockError::ProtocolError));
    assert_eq!(blk.state(), DriverState::Failed);
    assert_eq!(blk.read(0, &mut buf), Err(BlockError::NotReady));
    assert_eq!(dev.notifications(), before);
}

/// Tests: one notification per submitted request
#[test]
fn test_notify_per_request() {
    let dev = FakeBlockDevice::new(2048);
    let mut blk = ready(&dev);
    let before = dev.notifications();
    let mut buf = [0u8; 512];
    for lba in 0..20 {
        blk.read(lba, &mut buf).unwrap();
    }
    assert_eq!(dev.notifications() - before, 20);
}

/// Tests: many requests on a small queue wrap the ring indices cleanly
#[test]
fn test_ring_reuse() {
    let dev = FakeBlockDevice::new(64);
    dev.with_regs(|r| r.set_queue_max(4));
    let mut blk = ready(&dev);

    for round in 0..50u8 {
        let lba = u64::from(round % 64);
        let data = pattern(round, 512);
        blk.write(lba, &data).unwrap();
        let mut buf = [0u8; 512];
        blk.read(lba, &mut buf).unwrap();
        assert_eq!(buf.as_slice(), data.as_slice());
    }
    assert_eq!(blk.free_descriptors(), 4);
    assert_eq!(blk.telemetry().completed, 100);
}
