//! Last-error compatibility shim
//!
//! Engine operations return `Result`, but some embedders still expect a
//! "get last error" call after a failing operation. Every failing public
//! operation mirrors its error here before returning it. The record is
//! thread-scoped: it lives on the thread that polled the failing future,
//! which for the FUSE hook is the worker thread that issued the request.

use std::cell::Cell;

use crate::error::{codes, MergeFsError, Result};

/// Snapshot of the most recent failure on this thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LastError {
    pub code: u32,
    pub is_os_error: bool,
}

thread_local! {
    static LAST_ERROR: Cell<LastError> = const {
        Cell::new(LastError {
            code: codes::SUCCESS,
            is_os_error: false,
        })
    };
}

/// Overwrite the calling thread's last error with `err`
pub fn record(err: &MergeFsError) {
    let last = LastError {
        code: err.code(),
        is_os_error: err.is_os_error(),
    };
    LAST_ERROR.with(|cell| cell.set(last));
}

/// Return `(code, is_os_error)` for the most recent failure on this thread
pub fn get_last_error() -> (u32, bool) {
    let last = LAST_ERROR.with(|cell| cell.get());
    (last.code, last.is_os_error)
}

/// Reset the record to success
pub fn clear() {
    LAST_ERROR.with(|cell| cell.set(LastError::default()));
}

/// Extension for mirroring a failing `Result` into the shim
pub trait RecordLastError {
    fn record_last_error(self) -> Self;
}

impl<T> RecordLastError for Result<T> {
    fn record_last_error(self) -> Self {
        if let Err(ref e) = self {
            record(e);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_success_leaves_record_untouched() {
        clear();
        record(&MergeFsError::NotFound("/a".into()));
        let ok: Result<()> = Ok(());
        let _ = ok.record_last_error();
        assert_eq!(get_last_error(), (codes::INEXISTENT_FILE, false));
    }

    #[test]
    fn test_os_error_domain_is_reported() {
        clear();
        let failed: Result<()> = Err(io::Error::from_raw_os_error(libc::EACCES).into());
        let _ = failed.record_last_error();
        assert_eq!(get_last_error(), (libc::EACCES as u32, true));
    }

    #[test]
    fn test_record_is_thread_scoped() {
        clear();
        record(&MergeFsError::ResourceBusy("mount".into()));
        let other = std::thread::spawn(get_last_error).join().unwrap();
        assert_eq!(other, (codes::SUCCESS, false));
        assert_eq!(get_last_error(), (codes::RESOURCE_BUSY, false));
    }
}
