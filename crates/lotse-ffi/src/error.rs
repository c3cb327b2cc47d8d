//! Thread-local last-error channel for the C boundary.
//!
//! Each thread owns its own slot, so concurrent callers never observe each
//! other's errors. Every boundary function either clears the slot (success)
//! or stores its failure message before returning.

use std::cell::RefCell;
use std::ffi::CString;
use std::ptr;

use libc::{c_char, c_int};
use lotse_common::{LotseError, LotseResult};

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// Store `err` as the calling thread's last error.
pub(crate) fn set_last_error(err: &LotseError) {
    let message = CString::new(err.to_string()).unwrap_or_default();
    LAST_ERROR.with(|slot| {
        *slot.borrow_mut() = Some(message);
    });
}

/// Clear the calling thread's last error.
pub(crate) fn clear_last_error() {
    LAST_ERROR.with(|slot| {
        slot.borrow_mut().take();
    });
}

/// Update the last-error slot from an operation result.
pub(crate) fn store_result<T>(result: LotseResult<T>) {
    match result {
        Ok(_) => clear_last_error(),
        Err(err) => set_last_error(&err),
    }
}

/// Calculate the number of bytes in the last error's message including a
/// trailing NUL character. Returns `0` if there is no recent error.
#[unsafe(no_mangle)]
pub extern "C" fn last_error_length() -> c_int {
    LAST_ERROR.with(|slot| {
        slot.borrow()
            .as_ref()
            .map_or(0, |msg| msg.as_bytes_with_nul().len() as c_int)
    })
}

/// Write the most recent error message into a caller-provided buffer as a
/// UTF-8 string, returning the number of bytes written.
///
/// Returns `0` if there is no recent error, and `-1` on argument errors:
/// a NULL `buffer`, or a `length` smaller than [`last_error_length`].
#[unsafe(no_mangle)]
pub extern "C" fn last_error_message(buffer: *mut c_char, length: c_int) -> c_int {
    LAST_ERROR.with(|slot| {
        let borrow = slot.borrow();
        let Some(message) = borrow.as_ref() else {
            return 0;
        };

        let bytes = message.as_bytes_with_nul();
        if buffer.is_null() || length < 0 || (length as usize) < bytes.len() {
            return -1;
        }

        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), buffer.cast::<u8>(), bytes.len());
        }
        bytes.len() as c_int
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fail() {
        set_last_error(&LotseError::NotFound {
            id: "ghost".to_string(),
        });
    }

    #[test]
    fn no_error_reports_zero() {
        clear_last_error();
        assert_eq!(last_error_length(), 0);

        let mut buffer = vec![0 as c_char; 64];
        assert_eq!(last_error_message(buffer.as_mut_ptr(), 64), 0);
    }

    #[test]
    fn message_round_trip() {
        fail();
        let length = last_error_length();
        assert!(length > 0);

        let mut buffer = vec![0 as c_char; length as usize];
        let written = last_error_message(buffer.as_mut_ptr(), length);
        assert_eq!(written, length);

        let text = unsafe { std::ffi::CStr::from_ptr(buffer.as_ptr()) }
            .to_str()
            .unwrap();
        assert_eq!(text, "No port mappings found for container ghost");

        clear_last_error();
        assert_eq!(last_error_length(), 0);
    }

    #[test]
    fn insufficient_buffer_is_rejected() {
        fail();
        let mut buffer = vec![0 as c_char; 4];
        assert_eq!(last_error_message(buffer.as_mut_ptr(), 4), -1);
        clear_last_error();
    }

    #[test]
    fn null_buffer_is_rejected() {
        fail();
        assert_eq!(last_error_message(ptr::null_mut(), 64), -1);
        clear_last_error();
    }

    #[test]
    fn store_result_clears_on_success() {
        fail();
        assert!(last_error_length() > 0);
        store_result::<()>(Ok(()));
        assert_eq!(last_error_length(), 0);
    }
}
