//! Logging initialization for the C boundary.

use std::ffi::CStr;
use std::str::FromStr;

use libc::c_char;
use lotse_common::{LotseError, LotseResult};
use tracing_subscriber::filter::LevelFilter;

use crate::error::store_result;

/// Initialize diagnostic logging at the provided level.
///
/// Recognized levels are `off`, `error`, `warn`, `info`, `debug`, and
/// `trace`. Populates the last error on any failure, including a second
/// initialization.
#[unsafe(no_mangle)]
pub extern "C" fn log_init(level: *const c_char) {
    store_result(log_init_res(level));
}

fn log_init_res(level: *const c_char) -> LotseResult<()> {
    if level.is_null() {
        return Err(LotseError::NullArgument { name: "level" });
    }

    let text = unsafe { CStr::from_ptr(level) }
        .to_str()
        .map_err(|_| LotseError::InvalidText { what: "log level" })?;
    let filter = LevelFilter::from_str(text).map_err(|_| LotseError::Logging {
        message: format!("unrecognized log level {text:?}"),
    })?;

    tracing_subscriber::fmt()
        .with_max_level(filter)
        .try_init()
        .map_err(|e| LotseError::Logging {
            message: e.to_string(),
        })
}
