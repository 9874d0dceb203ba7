//! On-disk triad management: the real directory the service acts on, the
//! transient backup slot, and the decoy whose `tmp` child is a hard link
//! to the target file.
//!
//! Steady state between attempts: `Data` exists with no `tmp` child,
//! `Fake/tmp` shares an inode with the target, `Data_backup` is absent.
//! Any deviation at startup means a prior run died mid-swap and
//! `reconcile` repairs it before racing.

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use log::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapOutcome {
    Success,
    /// First rename (`Data` -> `Data_backup`) failed; nothing moved.
    FailStage1,
    /// Second rename (`Fake` -> `Data`) failed; backup was restored
    /// best-effort.
    FailStage2,
}

#[derive(Debug, Clone)]
pub struct DirectoryTriad {
    real: PathBuf,
    backup: PathBuf,
    decoy: PathBuf,
    real_tmp: PathBuf,
    decoy_tmp: PathBuf,
    target: PathBuf,
}

fn entry_exists(path: &Path) -> bool {
    path.symlink_metadata().is_ok()
}

impl DirectoryTriad {
    pub fn new(base: &Path, target: &Path) -> Self {
        let real = base.join("Data");
        let decoy = base.join("Fake");
        Self {
            real_tmp: real.join("tmp"),
            decoy_tmp: decoy.join("tmp"),
            backup: base.join("Data_backup"),
            real,
            decoy,
            target: target.to_path_buf(),
        }
    }

    pub fn real(&self) -> &Path {
        &self.real
    }

    pub fn real_tmp(&self) -> &Path {
        &self.real_tmp
    }

    pub fn decoy_tmp(&self) -> &Path {
        &self.decoy_tmp
    }

    pub fn backup(&self) -> &Path {
        &self.backup
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Idempotent repair to steady state. Errors here are unrecoverable
    /// corruption and abort the run.
    pub fn reconcile(&self) -> io::Result<()> {
        if entry_exists(&self.backup) {
            warn!("[Triad] backup slot populated, repairing crashed swap");
            if entry_exists(&self.real) {
                fs::rename(&self.real, &self.decoy)?;
            }
            fs::rename(&self.backup, &self.real)?;
        }

        if !entry_exists(&self.real) {
            fs::create_dir_all(&self.real)?;
        }
        self.clear_real_tmp();

        if !entry_exists(&self.decoy) {
            fs::create_dir_all(&self.decoy)?;
        }
        match self.decoy_tmp.symlink_metadata() {
            Ok(meta) if meta.file_type().is_dir() => {
                // The service's creation step replaced our link with a real
                // directory on some earlier attempt.
                fs::remove_dir(&self.decoy_tmp)?;
                fs::hard_link(&self.target, &self.decoy_tmp)?;
            }
            Ok(meta) => {
                let target_ino = fs::metadata(&self.target)?.ino();
                if meta.ino() != target_ino {
                    fs::remove_file(&self.decoy_tmp)?;
                    fs::hard_link(&self.target, &self.decoy_tmp)?;
                }
            }
            Err(_) => {
                fs::hard_link(&self.target, &self.decoy_tmp)?;
            }
        }
        Ok(())
    }

    /// Pre-race sanity check. Returns the target's current owner uid for
    /// the win report.
    pub fn verify_setup(&self) -> io::Result<u32> {
        let bad = |what: &str| io::Error::new(io::ErrorKind::InvalidData, what.to_owned());
        if !fs::symlink_metadata(&self.real)?.file_type().is_dir() {
            return Err(bad("real slot is not a directory"));
        }
        if !fs::symlink_metadata(&self.decoy)?.file_type().is_dir() {
            return Err(bad("decoy slot is not a directory"));
        }
        let link = fs::symlink_metadata(&self.decoy_tmp)?;
        let target = fs::metadata(&self.target)?;
        if link.ino() != target.ino() {
            return Err(bad("decoy tmp does not share an inode with the target"));
        }
        Ok(target.uid())
    }

    /// Two ordered renames. Each rename is atomic; the pair is not, which
    /// is exactly the window `reconcile` knows how to repair.
    pub fn swap(&self) -> SwapOutcome {
        if let Err(e) = fs::rename(&self.real, &self.backup) {
            debug!("[Swap] stage 1 failed: {e}");
            return SwapOutcome::FailStage1;
        }
        if let Err(e) = fs::rename(&self.decoy, &self.real) {
            warn!("[Swap] stage 2 failed: {e}");
            if let Err(e) = fs::rename(&self.backup, &self.real) {
                error!("[Swap] restore after stage 2 failure failed: {e}");
            }
            return SwapOutcome::FailStage2;
        }
        SwapOutcome::Success
    }

    /// Inverse of `swap` for a lost attempt. Best-effort: a half-finished
    /// rollback is indistinguishable from a crashed swap and the next
    /// `reconcile` picks it up.
    pub fn rollback(&self) {
        if entry_exists(&self.real) {
            if let Err(e) = fs::rename(&self.real, &self.decoy) {
                debug!("[Triad] rollback: decoy restore failed: {e}");
            }
        }
        if entry_exists(&self.backup) {
            if let Err(e) = fs::rename(&self.backup, &self.real) {
                debug!("[Triad] rollback: real restore failed: {e}");
            }
        }
        // The service's creation left a tmp under the restored real slot,
        // and may have turned the decoy's link into a directory.
        let _ = fs::remove_dir(&self.real_tmp);
        let _ = fs::remove_dir(&self.decoy_tmp);
        let _ = fs::remove_file(&self.decoy_tmp);
        if let Err(e) = fs::hard_link(&self.target, &self.decoy_tmp) {
            debug!("[Triad] rollback: relink failed: {e}");
        }
    }

    /// Remove a stale `Data/tmp`. If it already exists the service skips
    /// its creation step and the race window never opens.
    pub fn clear_real_tmp(&self) {
        let _ = fs::remove_dir(&self.real_tmp);
        let _ = fs::remove_file(&self.real_tmp);
    }

    /// True when the decoy's `tmp` child shares an inode with the target.
    pub fn decoy_link_intact(&self) -> io::Result<bool> {
        let link = fs::symlink_metadata(&self.decoy_tmp)?;
        let target = fs::metadata(&self.target)?;
        Ok(!link.file_type().is_dir() && link.ino() == target.ino())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    fn scratch() -> (TempDir, DirectoryTriad) {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("target.txt");
        let mut f = File::create(&target).expect("target");
        f.write_all(b"precious").expect("write");
        let triad = DirectoryTriad::new(dir.path(), &target);
        triad.reconcile().expect("reconcile");
        (dir, triad)
    }

    fn assert_steady(triad: &DirectoryTriad) {
        assert!(triad.real().is_dir());
        assert!(!entry_exists(triad.real_tmp()));
        assert!(!entry_exists(triad.backup()));
        assert!(triad.decoy_link_intact().expect("link check"));
    }

    #[test]
    fn reconcile_builds_steady_state() {
        let (_dir, triad) = scratch();
        assert_steady(&triad);
        assert!(triad.verify_setup().is_ok());
    }

    #[test]
    fn reconcile_is_idempotent() {
        let (_dir, triad) = scratch();
        triad.reconcile().expect("second reconcile");
        assert_steady(&triad);
    }

    #[test]
    fn reconcile_repairs_stage1_crash() {
        let (_dir, triad) = scratch();
        // Crash right after stage 1: real moved to backup, nothing else.
        fs::rename(triad.real(), triad.backup()).expect("simulate stage 1");
        triad.reconcile().expect("repair");
        assert_steady(&triad);
        triad.reconcile().expect("repair again");
        assert_steady(&triad);
    }

    #[test]
    fn reconcile_repairs_completed_swap() {
        let (_dir, triad) = scratch();
        assert_eq!(triad.swap(), SwapOutcome::Success);
        // Process dies here; next run must restore the original layout.
        triad.reconcile().expect("repair");
        assert_steady(&triad);
    }

    #[test]
    fn reconcile_replaces_directory_decoy_child() {
        let (_dir, triad) = scratch();
        fs::remove_file(triad.decoy_tmp()).expect("drop link");
        fs::create_dir(triad.decoy_tmp()).expect("plant dir");
        triad.reconcile().expect("repair");
        assert!(triad.decoy_link_intact().expect("link check"));
    }

    #[test]
    fn reconcile_replaces_wrong_inode_link() {
        let (dir, triad) = scratch();
        let other = dir.path().join("other.txt");
        File::create(&other).expect("other");
        fs::remove_file(triad.decoy_tmp()).expect("drop link");
        fs::hard_link(&other, triad.decoy_tmp()).expect("wrong link");
        triad.reconcile().expect("repair");
        assert!(triad.decoy_link_intact().expect("link check"));
    }

    #[test]
    fn swap_then_rollback_restores_everything() {
        let (_dir, triad) = scratch();
        assert_eq!(triad.swap(), SwapOutcome::Success);
        assert!(entry_exists(triad.backup()));
        triad.rollback();
        assert_steady(&triad);
    }

    #[test]
    fn second_swap_without_rollback_fails_stage1() {
        let (_dir, triad) = scratch();
        // In the real flow the service has created Data/tmp by the time we
        // swap, so the backup slot ends up non-empty.
        fs::create_dir(triad.real_tmp()).expect("service mkdir");
        assert_eq!(triad.swap(), SwapOutcome::Success);
        // Real slot was consumed by the first swap; backup is occupied.
        assert_eq!(triad.swap(), SwapOutcome::FailStage1);
        // State unchanged from the first swap's result.
        assert!(entry_exists(triad.backup()));
        assert!(entry_exists(triad.real()));
        triad.rollback();
        assert_steady(&triad);
    }

    #[test]
    fn rollback_recreates_overwritten_link() {
        let (_dir, triad) = scratch();
        assert_eq!(triad.swap(), SwapOutcome::Success);
        // Simulate the service creating tmp inside the restored real slot
        // after we lose: it lands in what is now the real (former decoy).
        fs::remove_file(triad.real_tmp()).expect("drop moved link");
        fs::create_dir(triad.real_tmp()).expect("service mkdir");
        triad.rollback();
        assert_steady(&triad);
    }
}
