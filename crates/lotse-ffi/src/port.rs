//! Port manager C interface.

use std::ffi::CStr;
use std::{ptr, slice};

use libc::{c_char, c_void};
use lotse::{PortManager, PortMapping as NativePortMapping, parse_host_address};
use lotse_common::{LotseError, LotseResult};

use crate::error::{clear_last_error, set_last_error, store_result};

/// Seam between the boundary functions and the native manager, so the
/// pointer-handling layer can be tested without programming real rules.
trait Manager: Send + Sync {
    fn add(&self, id: &str, network: &str, mappings: &[NativePortMapping]) -> LotseResult<()>;

    fn remove(&self, id: &str) -> LotseResult<()>;

    fn close(&self);
}

impl Manager for PortManager {
    fn add(&self, id: &str, network: &str, mappings: &[NativePortMapping]) -> LotseResult<()> {
        PortManager::add(self, id, network, mappings)
    }

    fn remove(&self, id: &str) -> LotseResult<()> {
        PortManager::remove(self, id)
    }

    fn close(&self) {
        PortManager::close(self);
    }
}

/// Port mappings added to the port manager.
#[derive(Debug)]
#[repr(C)]
pub struct PortMappings {
    /// The array of data containing the port mappings.
    array: *const PortMapping,

    /// Length of the `array`.
    length: usize,
}

/// A port mapping.
#[derive(Debug)]
#[repr(C)]
pub struct PortMapping {
    /// Host address the forward listens on.
    host_ip: *const c_char,

    /// The port number on the host.
    host_port: u16,

    /// The port number inside the container.
    container_port: u16,

    /// The protocol of the port mapping.
    protocol: *const c_char,
}

impl PortMapping {
    /// Copy one boundary mapping into an owned native mapping.
    fn to_native(&self, index: usize) -> LotseResult<NativePortMapping> {
        if self.host_ip.is_null() {
            return Err(LotseError::InvalidMapping {
                index,
                reason: "host IP is NULL".to_string(),
            });
        }
        if self.protocol.is_null() {
            return Err(LotseError::InvalidMapping {
                index,
                reason: "protocol is NULL".to_string(),
            });
        }

        let host_ip = unsafe { CStr::from_ptr(self.host_ip) }
            .to_str()
            .map_err(|_| LotseError::InvalidMapping {
                index,
                reason: "host IP is not valid UTF-8".to_string(),
            })?;
        let protocol = unsafe { CStr::from_ptr(self.protocol) }
            .to_str()
            .map_err(|_| LotseError::InvalidMapping {
                index,
                reason: "protocol is not valid UTF-8".to_string(),
            })?;

        Ok(NativePortMapping {
            host_address: parse_host_address(host_ip)?,
            host_port: self.host_port,
            container_port: self.container_port,
            protocol: protocol.parse()?,
        })
    }
}

/// Create a new port manager instance over the provided storage path.
///
/// Returns a `NULL` pointer and populates the last error on failure.
#[unsafe(no_mangle)]
pub extern "C" fn port_manager_new(storage_path: *const c_char) -> *mut c_void {
    match port_manager_new_res(storage_path) {
        Ok(manager) => {
            clear_last_error();
            manager
        }
        Err(err) => {
            set_last_error(&err);
            ptr::null_mut()
        }
    }
}

fn port_manager_new_res(storage_path: *const c_char) -> LotseResult<*mut c_void> {
    if storage_path.is_null() {
        return Err(LotseError::NullArgument {
            name: "storage_path",
        });
    }

    let path = unsafe { CStr::from_ptr(storage_path) }
        .to_str()
        .map_err(|_| LotseError::InvalidText {
            what: "storage path",
        })?;
    let manager = PortManager::new(path)?;

    Ok(into_handle(Box::new(manager)))
}

/// Destroy the port manager instance and release its resources.
///
/// Populates the last error on failure; teardown proceeds regardless.
#[unsafe(no_mangle)]
pub extern "C" fn port_manager_destroy(port_manager: *mut c_void) {
    if port_manager.is_null() {
        set_last_error(&LotseError::NullArgument {
            name: "port_manager",
        });
        return;
    }

    let manager = unsafe { Box::from_raw(port_manager.cast::<Box<dyn Manager>>()) };
    manager.close();
    clear_last_error();
}

/// Add port mappings to the port manager.
///
/// Populates the last error on failure.
#[unsafe(no_mangle)]
pub extern "C" fn port_manager_add(
    port_manager: *mut c_void,
    id: *const c_char,
    container_network: *const c_char,
    port_mappings: *const PortMappings,
) {
    store_result(port_manager_add_res(
        port_manager,
        id,
        container_network,
        port_mappings,
    ));
}

fn port_manager_add_res(
    port_manager: *mut c_void,
    id: *const c_char,
    container_network: *const c_char,
    port_mappings: *const PortMappings,
) -> LotseResult<()> {
    let manager = manager_ref(port_manager)?;
    let id = text_arg(id, "id")?;
    let network = text_arg(container_network, "container_network")?;

    if port_mappings.is_null() {
        return Err(LotseError::NullArgument {
            name: "port_mappings",
        });
    }
    let raw = unsafe { &*port_mappings };
    let boundary: &[PortMapping] = if raw.length == 0 {
        &[]
    } else {
        if raw.array.is_null() {
            return Err(LotseError::NullArgument {
                name: "port_mappings.array",
            });
        }
        unsafe { slice::from_raw_parts(raw.array, raw.length) }
    };

    let mut mappings = Vec::with_capacity(boundary.len());
    for (index, mapping) in boundary.iter().enumerate() {
        mappings.push(mapping.to_native(index)?);
    }

    manager.add(id, network, &mappings)
}

/// Remove all port mappings from the port manager for the provided `id`.
///
/// Populates the last error on failure.
#[unsafe(no_mangle)]
pub extern "C" fn port_manager_remove(port_manager: *mut c_void, id: *const c_char) {
    store_result(port_manager_remove_res(port_manager, id));
}

fn port_manager_remove_res(port_manager: *mut c_void, id: *const c_char) -> LotseResult<()> {
    let manager = manager_ref(port_manager)?;
    let id = text_arg(id, "id")?;
    manager.remove(id)
}

fn into_handle(manager: Box<dyn Manager>) -> *mut c_void {
    Box::into_raw(Box::new(manager)).cast::<c_void>()
}

fn manager_ref<'a>(port_manager: *mut c_void) -> LotseResult<&'a dyn Manager> {
    let boxed = unsafe { port_manager.cast::<Box<dyn Manager>>().as_ref() };
    boxed
        .map(|manager| &**manager)
        .ok_or(LotseError::NullArgument {
            name: "port_manager",
        })
}

fn text_arg<'a>(value: *const c_char, name: &'static str) -> LotseResult<&'a str> {
    if value.is_null() {
        return Err(LotseError::NullArgument { name });
    }
    unsafe { CStr::from_ptr(value) }
        .to_str()
        .map_err(|_| LotseError::InvalidText { what: name })
}
