// CLASSIFICATION: COMMUNITY
// Filename: filesystem_quota.rs v0.2
// Author: Lukas Bower
// Date Modified: 2027-08-30

mod common;

use std::thread;
use std::time::{Duration, Instant};

use computer_core::computer::{runtime_factory, MediaOutcome, OpenMode, ResumeOutcome};
use computer_core::quota::{QuotaOwner, ResourceKind};
use computer_core::{ComputerState, CoreError};

use common::{recorder, script, start_host, test_config, tick_until};

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn write_over_limit_persists_nothing() {
    let mut cfg = test_config();
    cfg.filesystem.computer_space_limit = 1000;
    let (factory, _log) = recorder();
    let (host, dir) = start_host(cfg, factory);
    let computer = host.create_computer().unwrap();
    let owner = QuotaOwner::Computer(computer.id());

    let err = computer
        .with_filesystem(|fs| fs.write_file("big.bin", &[1u8; 1001]))
        .unwrap_err();
    assert_eq!(err.quota_kind(), Some(ResourceKind::FilesystemBytes));
    let on_disk = dir
        .path()
        .join("computer")
        .join(computer.id().to_string())
        .join("big.bin");
    assert_eq!(std::fs::metadata(on_disk).map(|m| m.len()).unwrap_or(0), 0);
    assert_eq!(host.quotas().in_use(owner, ResourceKind::FilesystemBytes), 0);

    computer
        .with_filesystem(|fs| fs.write_file("fits.bin", &[1u8; 1000]))
        .unwrap();
    assert_eq!(computer.with_filesystem(|fs| fs.free_space("/")).unwrap(), 0);
    computer.with_filesystem(|fs| fs.delete("fits.bin")).unwrap();
    assert_eq!(host.quotas().in_use(owner, ResourceKind::FilesystemBytes), 0);
}

#[test]
fn appends_accumulate_against_the_quota() {
    let mut cfg = test_config();
    cfg.filesystem.computer_space_limit = 100;
    let (factory, _log) = recorder();
    let (host, _dir) = start_host(cfg, factory);
    let computer = host.create_computer().unwrap();

    computer
        .with_filesystem(|fs| -> Result<(), CoreError> {
            let h = fs.open("log.txt", OpenMode::Append)?;
            for _ in 0..6 {
                fs.write(h, &[b'x'; 15])?;
            }
            let err = fs.write(h, &[b'x'; 15]).unwrap_err();
            assert_eq!(err.quota_kind(), Some(ResourceKind::FilesystemBytes));
            fs.close(h)?;
            assert_eq!(fs.size("log.txt")?, 90);
            assert_eq!(fs.read_file("log.txt")?.len(), 90);
            Ok(())
        })
        .unwrap();
    let owner = QuotaOwner::Computer(computer.id());
    assert_eq!(host.quotas().in_use(owner, ResourceKind::FilesystemBytes), 90);
    assert_eq!(host.quotas().in_use(owner, ResourceKind::OpenFileHandles), 0);
}

#[test]
fn disk_bytes_are_charged_to_the_disk() {
    let mut cfg = test_config();
    cfg.filesystem.floppy_space_limit = 50;
    let (factory, _log) = recorder();
    let (host, _dir) = start_host(cfg, factory);
    let computer = host.create_computer().unwrap();
    let disk = host.register_disk().unwrap();
    assert_eq!(host.mount_disk(computer.id(), disk, "disk").unwrap(), MediaOutcome::Applied);

    computer
        .with_filesystem(|fs| fs.write_file("disk/notes.txt", &[0u8; 40]))
        .unwrap();
    assert_eq!(host.quotas().in_use(QuotaOwner::Disk(disk), ResourceKind::FilesystemBytes), 40);
    assert_eq!(
        host.quotas()
            .in_use(QuotaOwner::Computer(computer.id()), ResourceKind::FilesystemBytes),
        0
    );
    assert!(computer
        .with_filesystem(|fs| fs.write_file("disk/more.txt", &[0u8; 20]))
        .is_err());
    assert!(computer
        .with_filesystem(|fs| fs.list("/"))
        .unwrap()
        .contains(&"disk".to_string()));

    // The disk keeps its contents and charge across computers.
    assert_eq!(host.unmount_disk(computer.id(), "disk").unwrap(), MediaOutcome::Applied);
    assert_eq!(host.unmount_disk(computer.id(), "disk").unwrap(), MediaOutcome::NotMounted);
    let other = host.create_computer().unwrap();
    host.mount_disk(other.id(), disk, "floppy").unwrap();
    let data = other
        .with_filesystem(|fs| fs.read_file("floppy/notes.txt"))
        .unwrap();
    assert_eq!(data.len(), 40);
    assert_eq!(host.quotas().in_use(QuotaOwner::Disk(disk), ResourceKind::FilesystemBytes), 40);
}

#[test]
fn restored_computer_is_charged_for_existing_files() {
    let (factory, _log) = recorder();
    let (host, _dir) = start_host(test_config(), factory);
    let computer = host.create_computer().unwrap();
    let id = computer.id();
    computer
        .with_filesystem(|fs| fs.write_file("keep.txt", b"persisted"))
        .unwrap();
    host.destroy_computer(id).unwrap();
    assert!(!host.quotas().is_registered(QuotaOwner::Computer(id)));

    let restored = host.restore_computer(id).unwrap();
    assert_eq!(
        host.quotas()
            .in_use(QuotaOwner::Computer(id), ResourceKind::FilesystemBytes),
        9
    );
    assert_eq!(
        restored.with_filesystem(|fs| fs.read_file("keep.txt")).unwrap(),
        b"persisted"
    );
}

#[test]
fn reload_changes_reported_capacity() {
    let mut cfg = test_config();
    cfg.filesystem.computer_space_limit = 100;
    let (factory, _log) = recorder();
    let (host, _dir) = start_host(cfg.clone(), factory);
    let computer = host.create_computer().unwrap();
    computer
        .with_filesystem(|fs| fs.write_file("a.txt", &[0u8; 30]))
        .unwrap();
    assert_eq!(computer.with_filesystem(|fs| fs.free_space("/")).unwrap(), 70);

    cfg.filesystem.computer_space_limit = 1000;
    host.reload(cfg).unwrap();
    assert_eq!(computer.with_filesystem(|fs| fs.space("/")).unwrap(), (30, 1000));
}

#[test]
fn mount_does_not_wait_for_a_busy_resume() {
    let mut cfg = test_config();
    cfg.execution.abort_grace_ms = 50;
    let factory = runtime_factory(|_| {
        script(|_slice| {
            thread::sleep(Duration::from_millis(600));
            ResumeOutcome::Completed
        })
    });
    let (host, _dir) = start_host(cfg, factory);
    let computer = host.create_computer().unwrap();
    let disk = host.register_disk().unwrap();
    computer.turn_on();
    assert!(tick_until(&host, WAIT, || {
        computer.state() == ComputerState::On && computer.is_executing()
    }));

    let started = Instant::now();
    let outcome = host.mount_disk(computer.id(), disk, "disk").unwrap();
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(outcome, MediaOutcome::Deferred);

    // The change lands once the resume lets go of the filesystem.
    assert!(tick_until(&host, WAIT, || !computer.is_executing() && !computer.has_work()));
    let names = computer.with_filesystem(|fs| fs.list("/")).unwrap();
    assert!(names.contains(&"disk".to_string()));
}
