use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use sysinfo::Disks;

use crate::errors::{EngineError, Result};
use crate::utils::fs::{chunk_part_path, format_bytes, simple_part_path};

const COPY_BUFFER_BYTES: usize = 4 * 1024 * 1024;
/// Headroom kept free on the target mount beyond the merged size.
const DISK_SAFETY_MARGIN_BYTES: u64 = 256 * 1024 * 1024;

/// Inputs for one merge pass. `chunks` carries `(index, expected_len)` in
/// ascending index order.
pub struct MergePlan {
    pub save_path: PathBuf,
    pub staging: PathBuf,
    pub chunks: Vec<(u32, i64)>,
    pub total_bytes: Option<i64>,
}

/// Concatenate chunk parts into `<save_name>.part`, then rename atomically
/// onto the final path. Runs blocking on the worker pool; `cancelled` is
/// polled between buffer copies so a cancel aborts promptly, deleting the
/// merge target and preserving the parts.
pub fn merge_parts(plan: &MergePlan, cancelled: &(dyn Fn() -> bool + Sync)) -> Result<()> {
    if let Some(total) = plan.total_bytes {
        ensure_disk_space(&plan.save_path, total as u64)?;
    }

    // Every part must be present and exactly range-sized before any bytes
    // move; a truncated part discovered mid-merge would waste the pass.
    for (index, expected_len) in &plan.chunks {
        let part = chunk_part_path(&plan.staging, *index);
        let actual = std::fs::metadata(&part).map(|meta| meta.len() as i64).unwrap_or(-1);
        if actual != *expected_len {
            return Err(EngineError::Integrity(format!(
                "chunk part {index} has {actual} bytes, expected {expected_len}"
            )));
        }
    }

    let merge_target = simple_part_path(&plan.save_path)?;
    let result = run_merge(plan, &merge_target, cancelled);
    if result.is_err() {
        let _ = std::fs::remove_file(&merge_target);
    }
    result
}

fn run_merge(plan: &MergePlan, merge_target: &Path, cancelled: &(dyn Fn() -> bool + Sync)) -> Result<()> {
    let mut output = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(merge_target)?;
    if let Some(total) = plan.total_bytes {
        // Best-effort preallocation; filesystems without support just
        // extend lazily.
        let _ = output.set_len(total as u64);
    }

    let mut buffer = vec![0_u8; COPY_BUFFER_BYTES];
    let mut written: u64 = 0;
    for (index, _) in &plan.chunks {
        if cancelled() {
            return Err(EngineError::Cancelled);
        }
        let part = chunk_part_path(&plan.staging, *index);
        let mut input = File::open(&part)?;
        loop {
            if cancelled() {
                return Err(EngineError::Cancelled);
            }
            let read = input.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            output.write_all(&buffer[..read])?;
            written += read as u64;
        }
    }

    if let Some(total) = plan.total_bytes {
        if written != total as u64 {
            return Err(EngineError::Integrity(format!(
                "merged {written} bytes, expected {total}"
            )));
        }
    }

    output.flush()?;
    let _ = output.sync_all();
    drop(output);

    if cancelled() {
        return Err(EngineError::Cancelled);
    }
    std::fs::rename(merge_target, &plan.save_path)?;
    Ok(())
}

fn nearest_existing_path(path: &Path) -> PathBuf {
    let mut candidate = path.to_path_buf();
    while !candidate.exists() {
        if !candidate.pop() {
            return PathBuf::from(".");
        }
    }
    candidate
}

fn available_disk_space(path: &Path) -> Option<u64> {
    let target = nearest_existing_path(path);
    let target = std::fs::canonicalize(&target).unwrap_or(target);
    let disks = Disks::new_with_refreshed_list();

    let mut best: Option<(usize, u64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if target.starts_with(mount) {
            let score = mount.as_os_str().to_string_lossy().len();
            match best {
                Some((best_score, _)) if best_score >= score => {}
                _ => best = Some((score, disk.available_space())),
            }
        }
    }
    best.map(|(_, available)| available)
}

fn ensure_disk_space(save_path: &Path, required: u64) -> Result<()> {
    let Some(available) = available_disk_space(save_path) else {
        // Unknown mounts (containers, network shares) skip the preflight.
        return Ok(());
    };
    let needed = required.saturating_add(DISK_SAFETY_MARGIN_BYTES);
    if available < needed {
        return Err(EngineError::Disk(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!(
                "insufficient space at {}: need {}, available {}",
                save_path.display(),
                format_bytes(needed),
                format_bytes(available)
            ),
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_parts(staging: &Path, parts: &[&[u8]]) -> Vec<(u32, i64)> {
        std::fs::create_dir_all(staging).unwrap();
        parts
            .iter()
            .enumerate()
            .map(|(index, data)| {
                let path = chunk_part_path(staging, index as u32);
                std::fs::write(path, data).unwrap();
                (index as u32, data.len() as i64)
            })
            .collect()
    }

    #[test]
    fn merges_parts_in_index_order() {
        let dir = tempfile::tempdir().unwrap();
        let save_path = dir.path().join("rom.bin");
        let staging = dir.path().join(".rom.bin.dpnh");
        let chunks = write_parts(&staging, &[b"hello ", b"romdock ", b"world"]);

        let plan = MergePlan {
            save_path: save_path.clone(),
            staging,
            chunks,
            total_bytes: Some(19),
        };
        merge_parts(&plan, &|| false).unwrap();

        assert_eq!(std::fs::read(&save_path).unwrap(), b"hello romdock world");
        // Merge target renamed away.
        assert!(!simple_part_path(&save_path).unwrap().exists());
    }

    #[test]
    fn missing_or_short_part_fails_before_any_io() {
        let dir = tempfile::tempdir().unwrap();
        let save_path = dir.path().join("rom.bin");
        let staging = dir.path().join(".rom.bin.dpnh");
        let mut chunks = write_parts(&staging, &[b"abcd"]);
        chunks.push((1, 100)); // never written

        let plan = MergePlan {
            save_path: save_path.clone(),
            staging,
            chunks,
            total_bytes: Some(104),
        };
        let err = merge_parts(&plan, &|| false).unwrap_err();
        assert!(matches!(err, EngineError::Integrity(_)));
        assert!(!save_path.exists());
    }

    #[test]
    fn cancel_mid_merge_removes_target_and_keeps_parts() {
        let dir = tempfile::tempdir().unwrap();
        let save_path = dir.path().join("rom.bin");
        let staging = dir.path().join(".rom.bin.dpnh");
        let chunks = write_parts(&staging, &[b"aaaa", b"bbbb"]);

        let plan = MergePlan {
            save_path: save_path.clone(),
            staging: staging.clone(),
            chunks,
            total_bytes: Some(8),
        };
        let err = merge_parts(&plan, &|| true).unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert!(!save_path.exists());
        assert!(!simple_part_path(&save_path).unwrap().exists());
        assert!(chunk_part_path(&staging, 0).exists());
        assert!(chunk_part_path(&staging, 1).exists());
    }

    #[test]
    fn declared_total_mismatch_is_integrity_failure() {
        let dir = tempfile::tempdir().unwrap();
        let save_path = dir.path().join("rom.bin");
        let staging = dir.path().join(".rom.bin.dpnh");
        let chunks = write_parts(&staging, &[b"aaaa"]);

        let plan = MergePlan {
            save_path,
            staging,
            chunks,
            total_bytes: Some(99),
        };
        let err = merge_parts(&plan, &|| false).unwrap_err();
        assert!(matches!(err, EngineError::Integrity(_)));
    }
}
