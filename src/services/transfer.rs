use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;

use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::sync::watch;

use crate::errors::Result;

/// Size of the on-disk tail covered by a resume checkpoint.
pub const TAIL_CHECKPOINT_BYTES: u64 = 64 * 1024;

/// Control signal fanned out to every task of one download run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadControl {
    Running,
    Paused,
    Cancelled,
}

pub fn control_state(control: &watch::Receiver<DownloadControl>) -> DownloadControl {
    *control.borrow()
}

/// Exponential backoff with jitter for chunk retries:
/// `min(max_delay, base * 2^attempt) + jitter`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-indexed). The shift saturates
    /// so large attempt numbers stay capped instead of overflowing.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let exp_delay = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay);
        let capped = exp_delay.min(self.max_delay);

        if !self.jitter {
            return capped;
        }
        let jitter_range_ms = (self.base_delay.as_millis() as u64) / 2;
        if jitter_range_ms == 0 {
            return capped;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..jitter_range_ms);
        (capped + Duration::from_millis(jitter_ms)).min(self.max_delay + self.base_delay)
    }
}

/// SHA-256 over the final `TAIL_CHECKPOINT_BYTES` (or all of a shorter
/// file). `None` for a missing or empty part file.
pub fn tail_checkpoint(path: &Path) -> Result<Option<String>> {
    let mut file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(None);
    }
    let window = len.min(TAIL_CHECKPOINT_BYTES);
    file.seek(SeekFrom::End(-(window as i64)))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0_u8; 64 * 1024];
    let mut remaining = window as usize;
    while remaining > 0 {
        let take = remaining.min(buffer.len());
        let read = file.read(&mut buffer[..take])?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        remaining -= read;
    }
    Ok(Some(hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_bounded() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: true,
        };
        for _ in 0..64 {
            let delay = policy.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay < Duration::from_millis(150));
        }
    }

    #[test]
    fn tail_checkpoint_covers_short_and_long_files() {
        let dir = tempfile::tempdir().unwrap();

        let missing = dir.path().join("missing.part");
        assert_eq!(tail_checkpoint(&missing).unwrap(), None);

        let empty = dir.path().join("empty.part");
        std::fs::write(&empty, b"").unwrap();
        assert_eq!(tail_checkpoint(&empty).unwrap(), None);

        let short = dir.path().join("short.part");
        std::fs::write(&short, b"romdock").unwrap();
        let short_hash = tail_checkpoint(&short).unwrap().unwrap();
        assert_eq!(short_hash.len(), 64);

        // Only the tail participates: same suffix, different prefix.
        let long_a = dir.path().join("a.part");
        let long_b = dir.path().join("b.part");
        let tail = vec![7u8; TAIL_CHECKPOINT_BYTES as usize];
        let mut a = vec![1u8; 1000];
        a.extend_from_slice(&tail);
        let mut b = vec![2u8; 5000];
        b.extend_from_slice(&tail);
        std::fs::write(&long_a, &a).unwrap();
        std::fs::write(&long_b, &b).unwrap();
        assert_eq!(
            tail_checkpoint(&long_a).unwrap(),
            tail_checkpoint(&long_b).unwrap()
        );

        // Changing one tail byte changes the checkpoint.
        let mut c = b.clone();
        let len = c.len();
        c[len - 1] ^= 0xff;
        let long_c = dir.path().join("c.part");
        std::fs::write(&long_c, &c).unwrap();
        assert_ne!(
            tail_checkpoint(&long_b).unwrap(),
            tail_checkpoint(&long_c).unwrap()
        );
    }

    #[tokio::test]
    async fn control_state_reads_the_latest_signal() {
        let (tx, rx) = watch::channel(DownloadControl::Running);
        assert_eq!(control_state(&rx), DownloadControl::Running);
        tx.send(DownloadControl::Paused).unwrap();
        assert_eq!(control_state(&rx), DownloadControl::Paused);
        tx.send(DownloadControl::Cancelled).unwrap();
        assert_eq!(control_state(&rx), DownloadControl::Cancelled);
    }
}
