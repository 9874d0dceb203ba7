//! End-to-end race against a scripted provisioning service: a thread that
//! speaks the wire protocol, creates `Data/tmp`, sleeps through a widened
//! window, then records which inode `Data/tmp` points at. A swap landing
//! inside the window leaves the target's inode in the record.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::os::unix::fs::MetadataExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use ghostdir::fsops::DirectoryTriad;
use ghostdir::race::detect::Strategy;
use ghostdir::race::{RaceConfig, RaceCoordinator, RunVerdict, WinCheck};
use ghostdir::trigger::source::InProcessTrigger;
use ghostdir::trigger::ServiceClient;
use protocol::{decode_request, encode_reply, ProvisioningRequest, RequestKind};

fn read_request(stream: &mut UnixStream) -> Option<ProvisioningRequest> {
    let mut head = [0u8; 8];
    stream.read_exact(&mut head).ok()?;
    let total = u32::from_le_bytes(head[4..8].try_into().unwrap()) as usize;
    let mut frame = vec![0u8; total];
    frame[..8].copy_from_slice(&head);
    stream.read_exact(&mut frame[8..]).ok()?;
    decode_request(&frame).ok()
}

/// One connection's worth of service behaviour: per request, create the
/// tmp directory, sleep for `window`, then lstat and record the inode.
fn spawn_service(
    listener: UnixListener,
    real_tmp: PathBuf,
    window: Duration,
    seen_inodes: Arc<Mutex<Vec<u64>>>,
) -> JoinHandle<u64> {
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut served = 0;
        while let Some(_request) = read_request(&mut stream) {
            let _ = fs::create_dir_all(&real_tmp);
            if !window.is_zero() {
                thread::sleep(window);
            }
            if let Ok(meta) = real_tmp.symlink_metadata() {
                seen_inodes.lock().expect("lock").push(meta.ino());
            }
            let reply = encode_reply(0, Some("/srv/Containers/app/Data/tmp"));
            let _ = stream.write_all(&reply);
            served += 1;
        }
        served
    })
}

/// Win oracle for the harness: the service observed the target's inode
/// where its own directory should have been. Polls briefly so the check
/// can outlast the service's window.
struct InodeWinCheck {
    seen_inodes: Arc<Mutex<Vec<u64>>>,
    target_ino: u64,
    patience: Duration,
}

impl WinCheck for InodeWinCheck {
    fn won(&mut self) -> bool {
        let deadline = Instant::now() + self.patience;
        loop {
            if self
                .seen_inodes
                .lock()
                .expect("lock")
                .contains(&self.target_ino)
            {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

struct Harness {
    _dir: TempDir,
    triad: DirectoryTriad,
    client: ServiceClient,
    service: JoinHandle<u64>,
    seen_inodes: Arc<Mutex<Vec<u64>>>,
    target_ino: u64,
}

fn harness(window: Duration) -> Harness {
    let dir = TempDir::new().expect("tempdir");
    let target = dir.path().join("target.txt");
    let mut f = File::create(&target).expect("target");
    f.write_all(b"precious").expect("write");
    let target_ino = fs::metadata(&target).expect("target meta").ino();

    let triad = DirectoryTriad::new(dir.path(), &target);

    let sock = dir.path().join("svc.sock");
    let listener = UnixListener::bind(&sock).expect("bind");
    let seen_inodes = Arc::new(Mutex::new(Vec::new()));
    let service = spawn_service(
        listener,
        triad.real_tmp().to_path_buf(),
        window,
        Arc::clone(&seen_inodes),
    );
    let client = ServiceClient::connect(&sock).expect("connect");

    Harness {
        _dir: dir,
        triad,
        client,
        service,
        seen_inodes,
        target_ino,
    }
}

#[test]
fn wins_against_widened_window() {
    let h = harness(Duration::from_millis(50));
    let trigger = InProcessTrigger::new(h.client, "com.example.app", RequestKind::Container, 64);
    let win = InodeWinCheck {
        seen_inodes: Arc::clone(&h.seen_inodes),
        target_ino: h.target_ino,
        patience: Duration::from_millis(500),
    };
    let cfg = RaceConfig {
        strategy: Strategy::Hybrid,
        detect_budget: Duration::from_millis(200),
        max_attempts: 50,
        wall_timeout: Duration::from_secs(30),
        ..RaceConfig::default()
    };

    let check = h.triad.clone();
    let mut coordinator = RaceCoordinator::new(h.triad, trigger, win, cfg);
    let verdict = coordinator.run().expect("run");
    assert_eq!(verdict, RunVerdict::Won);

    let stats = coordinator.stats();
    assert!(stats.detections >= 1, "stats: {stats}");
    assert!(stats.swaps >= 1, "stats: {stats}");
    assert_eq!(stats.wins, 1, "stats: {stats}");

    // The exit guard restored the layout even though we won.
    drop(coordinator);
    assert!(check.real().is_dir());
    assert!(!check.backup().exists());
    assert!(check.decoy_link_intact().expect("link check"));

    assert!(h.service.join().expect("service") >= 1);
}

#[test]
fn zero_detect_budget_exhausts_without_detections() {
    let h = harness(Duration::ZERO);
    let trigger = InProcessTrigger::new(h.client, "com.example.app", RequestKind::Container, 64);
    let win = InodeWinCheck {
        seen_inodes: Arc::clone(&h.seen_inodes),
        target_ino: h.target_ino,
        patience: Duration::ZERO,
    };
    let cfg = RaceConfig {
        strategy: Strategy::EventWait,
        detect_budget: Duration::ZERO,
        max_attempts: 3,
        ..RaceConfig::default()
    };

    let check = h.triad.clone();
    let mut coordinator = RaceCoordinator::new(h.triad, trigger, win, cfg);
    let verdict = coordinator.run().expect("run");
    assert_eq!(verdict, RunVerdict::Exhausted);

    let stats = coordinator.stats();
    assert_eq!(stats.triggers, 3, "stats: {stats}");
    assert_eq!(stats.detections, 0, "stats: {stats}");
    assert_eq!(stats.swaps, 0, "stats: {stats}");

    drop(coordinator);
    assert!(check.real().is_dir());
    assert!(!check.backup().exists());
    assert!(check.decoy_link_intact().expect("link check"));

    h.service.join().expect("service");
}
