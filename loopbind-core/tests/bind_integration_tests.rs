use loopbind_core::hold;
use loopbind_core::{
    BindConfig, BindError, BindOutcome, Binder, FixedOffset, ImageHandle, LockCoordinator, Role,
};
use loopbind_hal::path::slot_from_path;
use loopbind_hal::{FakeHal, Operation};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

const SLOTS: u32 = 8;

fn session_config(tmp: &TempDir) -> BindConfig {
    BindConfig {
        max_loop_devices: SLOTS,
        ..BindConfig::with_session_dir(tmp.path().join("session"))
    }
}

fn write_image(tmp: &TempDir, name: &str) -> PathBuf {
    let path = tmp.path().join(name);
    fs::write(&path, vec![0u8; 4096]).unwrap();
    path
}

fn set_fd_count(hal: &FakeHal) -> usize {
    hal.operations()
        .iter()
        .filter(|op| matches!(op, Operation::SetFd { .. }))
        .count()
}

#[test]
fn second_call_follows_first_without_touching_next_slot() {
    let tmp = tempdir().unwrap();
    let hal = FakeHal::with_nodes("/dev/loop", SLOTS);
    let image_path = write_image(&tmp, "a.img");

    let mut first = Binder::new(hal.clone(), FixedOffset(0), session_config(&tmp));
    let mut image = ImageHandle::open(&image_path, false).unwrap();
    assert_eq!(
        first.bind(&mut image).unwrap(),
        BindOutcome::Leader("/dev/loop0".to_string())
    );

    let mut second = Binder::new(hal.clone(), FixedOffset(0), session_config(&tmp));
    let mut again = ImageHandle::open(&image_path, false).unwrap();
    assert_eq!(
        second.bind(&mut again).unwrap(),
        BindOutcome::Follower("/dev/loop0".to_string())
    );

    assert_eq!(again.loop_device(), Some("/dev/loop0"));
    assert!(!hal.touched(Path::new("/dev/loop1")));
    assert_eq!(set_fd_count(&hal), 1);
    assert_eq!(second.held_devices(), 0);
}

#[test]
fn concurrent_binds_of_one_image_converge_on_one_device() {
    const WORKERS: usize = 6;

    let tmp = tempdir().unwrap();
    let hal = FakeHal::with_nodes("/dev/loop", SLOTS);
    hal.prebind("/dev/loop0", 1000);
    let image_path = write_image(&tmp, "shared.img");
    let barrier = Arc::new(Barrier::new(WORKERS));

    let workers: Vec<_> = (0..WORKERS)
        .map(|_| {
            let hal = hal.clone();
            let config = session_config(&tmp);
            let image_path = image_path.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut binder = Binder::new(hal, FixedOffset(0), config);
                let mut image = ImageHandle::open(&image_path, false).unwrap();
                barrier.wait();
                let outcome = binder.bind(&mut image).unwrap();
                assert_eq!(image.loop_device(), outcome.device());
                (outcome, binder.held_devices())
            })
        })
        .collect();

    let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    let leaders = results.iter().filter(|(o, _)| o.is_leader()).count();
    assert_eq!(leaders, 1);
    for (outcome, _) in &results {
        assert_eq!(outcome.device(), Some("/dev/loop1"));
    }
    let held: usize = results.iter().map(|(_, held)| held).sum();
    assert_eq!(held, 1);
    assert_eq!(set_fd_count(&hal), 2, "busy probe of loop0 plus one bind");
}

#[test]
fn different_images_bind_different_slots_without_blocking() {
    let tmp = tempdir().unwrap();
    let hal = FakeHal::with_nodes("/dev/loop", SLOTS);
    let a = write_image(&tmp, "a.img");
    let b = write_image(&tmp, "b.img");

    // Hold image A's record exclusively, as a leader in the middle of a bind.
    let image_a = ImageHandle::open(&a, false).unwrap();
    let coordinator = LockCoordinator::new(tmp.path().join("session"));
    let _held = match coordinator.acquire(image_a.id()).unwrap() {
        Role::Leader(lease) => lease,
        Role::Follower { .. } => panic!("nobody else holds image A"),
    };

    let (tx, rx) = mpsc::channel();
    let config = session_config(&tmp);
    let worker_hal = hal.clone();
    thread::spawn(move || {
        let mut binder = Binder::new(worker_hal, FixedOffset(0), config);
        let mut image_b = ImageHandle::open(&b, false).unwrap();
        let outcome = binder.bind(&mut image_b);
        tx.send(outcome.map(|o| o.device().map(str::to_string)))
            .unwrap();
    });

    let device = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("bind of image B must not wait on image A")
        .unwrap();
    assert_eq!(device.as_deref(), Some("/dev/loop0"));
}

#[test]
fn bound_device_lies_within_namespace() {
    let tmp = tempdir().unwrap();
    let hal = FakeHal::with_nodes("/dev/loop", 3);
    for slot in 0..3 {
        hal.prebind(format!("/dev/loop{}", slot), 500 + slot as i32);
    }
    let mut binder = Binder::new(hal.clone(), FixedOffset(0), session_config(&tmp));
    let mut image = ImageHandle::open(write_image(&tmp, "a.img"), false).unwrap();

    let device = binder.bind(&mut image).unwrap().device().unwrap().to_string();

    let slot = slot_from_path("/dev/loop", &device).unwrap();
    assert!(slot < SLOTS);
    assert_eq!(slot, 3);
    assert!(hal.has_node(Path::new("/dev/loop3")));
}

#[test]
fn exhausted_namespace_leaves_image_unbound() {
    let tmp = tempdir().unwrap();
    let hal = FakeHal::with_nodes("/dev/loop", SLOTS);
    for slot in 0..SLOTS {
        hal.prebind(format!("/dev/loop{}", slot), 700 + slot as i32);
    }
    let mut binder = Binder::new(hal.clone(), FixedOffset(0), session_config(&tmp));
    let mut image = ImageHandle::open(write_image(&tmp, "a.img"), false).unwrap();

    let err = binder.bind(&mut image).unwrap_err();

    assert!(matches!(
        err,
        BindError::DeviceExhausted {
            slots: SLOTS,
            busy: SLOTS
        }
    ));
    assert_eq!(image.loop_device(), None);
    let lock_path = tmp
        .path()
        .join("session")
        .join(format!("loop_lock.{}", image.id()));
    assert_eq!(fs::read_to_string(lock_path).unwrap(), "");
}

#[test]
fn retry_after_failed_leader_leads_again() {
    let tmp = tempdir().unwrap();
    let hal = FakeHal::with_nodes("/dev/loop", 1);
    hal.prebind("/dev/loop0", 900);
    let image_path = write_image(&tmp, "a.img");

    let config = BindConfig {
        max_loop_devices: 1,
        ..session_config(&tmp)
    };
    let mut failing = Binder::new(hal.clone(), FixedOffset(0), config);
    let mut image = ImageHandle::open(&image_path, false).unwrap();
    assert!(failing.bind(&mut image).is_err());

    let config = BindConfig {
        max_loop_devices: 2,
        ..session_config(&tmp)
    };
    let mut retry = Binder::new(hal.clone(), FixedOffset(0), config);
    let mut image = ImageHandle::open(&image_path, false).unwrap();
    assert_eq!(
        retry.bind(&mut image).unwrap(),
        BindOutcome::Leader("/dev/loop1".to_string())
    );
}

#[test]
fn configuration_failure_clears_association_and_propagates() {
    let tmp = tempdir().unwrap();
    let hal = FakeHal::with_nodes("/dev/loop", SLOTS);
    hal.fail_set_status();
    let mut binder = Binder::new(hal.clone(), FixedOffset(512), session_config(&tmp));
    let mut image = ImageHandle::open(write_image(&tmp, "a.img"), false).unwrap();

    let err = binder.bind(&mut image).unwrap_err();

    assert!(matches!(err, BindError::Configuration { .. }));
    assert_eq!(err.phase(), "configure");
    assert_eq!(hal.backing_fd(Path::new("/dev/loop0")), None);
    assert!(hal.devices_bound_to(image.raw_fd().unwrap()).is_empty());
    assert_eq!(image.loop_device(), None);
    assert!(!hal.is_elevated());
}

#[test]
fn no_double_bind_within_one_invocation() {
    let tmp = tempdir().unwrap();
    let hal = FakeHal::with_nodes("/dev/loop", SLOTS);
    let mut binder = Binder::new(hal.clone(), FixedOffset(0), session_config(&tmp));
    let mut image = ImageHandle::open(write_image(&tmp, "a.img"), false).unwrap();

    binder.bind(&mut image).unwrap();

    let fd = image.raw_fd().unwrap();
    assert_eq!(hal.devices_bound_to(fd), vec![PathBuf::from("/dev/loop0")]);
}

#[test]
fn second_bind_follows_while_first_holds_for_command() {
    let tmp = tempdir().unwrap();
    let hal = FakeHal::with_nodes("/dev/loop", SLOTS);
    let image_path = write_image(&tmp, "held.img");

    let (bound_tx, bound_rx) = mpsc::channel();
    let holder_hal = hal.clone();
    let holder_config = session_config(&tmp);
    let holder_image = image_path.clone();
    let holder = thread::spawn(move || {
        let mut binder = Binder::new(holder_hal, FixedOffset(0), holder_config);
        let mut image = ImageHandle::open(&holder_image, false).unwrap();
        let device = binder.bind(&mut image).unwrap().device().unwrap().to_string();
        bound_tx.send(device.clone()).unwrap();

        let command: Vec<OsString> = ["sh", "-c", "sleep 1"].iter().map(OsString::from).collect();
        let status = hold::run_with_device(&device, &command).unwrap();
        (status.success(), binder.held_devices())
    });

    let device = bound_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(device, "/dev/loop0");

    let mut second = Binder::new(hal.clone(), FixedOffset(0), session_config(&tmp));
    let mut image = ImageHandle::open(&image_path, false).unwrap();
    assert_eq!(
        second.bind(&mut image).unwrap(),
        BindOutcome::Follower("/dev/loop0".to_string())
    );
    assert!(!holder.is_finished(), "binding must still be held");

    let (success, held) = holder.join().unwrap();
    assert!(success);
    assert_eq!(held, 1);
    assert_eq!(set_fd_count(&hal), 1);
}
