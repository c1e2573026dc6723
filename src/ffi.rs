//! FFI bindings for mobile platforms (Android/iOS)
//!
//! One process-wide [`EchClient`] driven from the host app. Strings are
//! null-terminated UTF-8; a null pointer counts as an empty string.

use crate::logging::{self, LogCallback};
use crate::EchClient;
use std::ffi::{c_char, c_int, CStr, CString};
use std::sync::{Arc, OnceLock};
use tokio::runtime::Runtime;

static RUNTIME: OnceLock<Option<Runtime>> = OnceLock::new();
static CLIENT: OnceLock<EchClient> = OnceLock::new();

fn get_runtime() -> Option<&'static Runtime> {
    RUNTIME
        .get_or_init(|| {
            match tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => Some(rt),
                Err(e) => {
                    tracing::error!("Failed to create Tokio runtime: {}", e);
                    None
                }
            }
        })
        .as_ref()
}

fn get_client() -> &'static EchClient {
    CLIENT.get_or_init(EchClient::new)
}

/// # Safety
/// `ptr` must be null or point to a null-terminated string.
unsafe fn c_str(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    CStr::from_ptr(ptr).to_string_lossy().into_owned()
}

/// Set the configuration used by the next start.
///
/// Empty `listen_addr`, `dns_server` and `ech_domain` keep their defaults.
///
/// # Safety
/// Every pointer must be null or a valid null-terminated string.
#[no_mangle]
pub unsafe extern "C" fn ech_proxy_configure(
    server_addr: *const c_char,
    listen_addr: *const c_char,
    token: *const c_char,
    server_ip: *const c_char,
    dns_server: *const c_char,
    ech_domain: *const c_char,
) {
    get_client().configure(
        &c_str(server_addr),
        &c_str(listen_addr),
        &c_str(token),
        &c_str(server_ip),
        &c_str(dns_server),
        &c_str(ech_domain),
    );
}

/// Start the proxy
/// Returns 0 on success, or -1 on failure
#[no_mangle]
pub extern "C" fn ech_proxy_start() -> c_int {
    let Some(rt) = get_runtime() else {
        return -1;
    };

    // Failures are logged by `EchClient::start`.
    match rt.block_on(get_client().start()) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// Stop the proxy
#[no_mangle]
pub extern "C" fn ech_proxy_stop() {
    get_client().stop();
}

/// Check if the proxy is running
/// Returns 1 if running, 0 if not
#[no_mangle]
pub extern "C" fn ech_proxy_is_running() -> c_int {
    get_client().is_running() as c_int
}

/// Get the bound port
/// Returns the port number, or 0 if not running
#[no_mangle]
pub extern "C" fn ech_proxy_get_port() -> c_int {
    get_client()
        .local_addr()
        .map(|addr| addr.port() as c_int)
        .unwrap_or(0)
}

/// Forward log lines to `callback`; null removes it.
///
/// The pointer passed to the callback is only valid during the call.
#[no_mangle]
pub extern "C" fn ech_proxy_set_log_callback(callback: Option<extern "C" fn(*const c_char)>) {
    let callback = callback.map(|cb| {
        let forward: LogCallback = Arc::new(move |line: &str| {
            // Interior NULs would truncate the line on the C side.
            let line = line.replace('\0', " ");
            if let Ok(line) = CString::new(line) {
                cb(line.as_ptr());
            }
        });
        forward
    });
    logging::set_log_callback(callback);
}

/// Initialize logging (call once at startup)
#[no_mangle]
pub extern "C" fn ech_proxy_init_logging() {
    logging::init_logging();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn null_strings_are_empty() {
        assert_eq!(unsafe { c_str(ptr::null()) }, "");
        let s = CString::new("relay.example.com:443").unwrap();
        assert_eq!(unsafe { c_str(s.as_ptr()) }, "relay.example.com:443");
    }

    #[test]
    fn idle_client_reports_not_running() {
        assert_eq!(ech_proxy_is_running(), 0);
        assert_eq!(ech_proxy_get_port(), 0);
        ech_proxy_stop();
    }
}
