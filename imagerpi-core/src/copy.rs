//! The chunked, cancellable copy shared by capture and deploy.
use anyhow::{Context, Result, anyhow};
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Transfer buffer size used when none is configured.
pub const DEFAULT_BUFFER_SIZE: usize = 512 * 1024;

/// Returned when the shared `running` flag is cleared mid-operation.
#[derive(Debug, Error)]
#[error("Operation cancelled by user")]
pub struct Cancelled;

/// Fails with [`Cancelled`] once `running` has been cleared.
pub fn ensure_running(running: &AtomicBool) -> Result<()> {
    if running.load(Ordering::SeqCst) {
        Ok(())
    } else {
        Err(Cancelled.into())
    }
}

/// Copies exactly `len` bytes from `src` to `dst`, `buffer_size` bytes at a
/// time, reporting the running total after each chunk.
pub fn copy_exact<R, W, F>(
    src: &mut R,
    dst: &mut W,
    len: u64,
    buffer_size: usize,
    running: &AtomicBool,
    mut on_progress: F,
) -> Result<()>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
    F: FnMut(u64),
{
    if buffer_size == 0 {
        return Err(anyhow!("buffer size must be greater than zero"));
    }

    let mut buffer = vec![0u8; buffer_size];
    let mut copied: u64 = 0;

    while copied < len {
        ensure_running(running)?;

        let chunk = std::cmp::min(buffer_size as u64, len - copied) as usize;
        src.read_exact(&mut buffer[..chunk]).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                anyhow!("source ended early, around byte {copied} of {len}")
            } else {
                anyhow::Error::new(e).context(format!("read failed at byte {copied}"))
            }
        })?;
        dst.write_all(&buffer[..chunk])
            .with_context(|| format!("write failed at byte {copied}"))?;

        copied += chunk as u64;
        on_progress(copied);
    }

    dst.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn copies_exact_length_in_chunks() {
        let data = pattern(10_000);
        let mut src = Cursor::new(data.clone());
        let mut dst = Vec::new();
        let running = AtomicBool::new(true);
        let mut reports = Vec::new();

        copy_exact(&mut src, &mut dst, 9_000, 4096, &running, |n| reports.push(n)).unwrap();

        assert_eq!(dst, &data[..9_000]);
        assert_eq!(reports, vec![4096, 8192, 9000]);
    }

    #[test]
    fn zero_length_copies_nothing() {
        let mut src = Cursor::new(pattern(16));
        let mut dst = Vec::new();
        let running = AtomicBool::new(true);
        copy_exact(&mut src, &mut dst, 0, 8, &running, |_| panic!("no progress expected")).unwrap();
        assert!(dst.is_empty());
    }

    #[test]
    fn short_source_is_an_error() {
        let mut src = Cursor::new(pattern(100));
        let mut dst = Vec::new();
        let running = AtomicBool::new(true);

        let err = copy_exact(&mut src, &mut dst, 200, 64, &running, |_| {}).unwrap_err();
        assert!(err.to_string().contains("source ended early"));
    }

    #[test]
    fn cleared_flag_cancels() {
        let mut src = Cursor::new(pattern(1024));
        let mut dst = Vec::new();
        let running = AtomicBool::new(true);

        let err = copy_exact(&mut src, &mut dst, 1024, 256, &running, |n| {
            if n == 512 {
                running.store(false, Ordering::SeqCst);
            }
        })
        .unwrap_err();

        assert!(err.downcast_ref::<Cancelled>().is_some());
        assert_eq!(dst.len(), 512);
    }

    #[test]
    fn zero_buffer_is_rejected() {
        let running = AtomicBool::new(true);
        let err = copy_exact(&mut Cursor::new(vec![1]), &mut Vec::new(), 1, 0, &running, |_| {})
            .unwrap_err();
        assert!(err.to_string().contains("buffer size"));
    }
}
