//! Dynamic library loading and symbol lookup.
//!
//! Libraries stay loaded for the life of the process, so a [`NativeSymbol`]
//! never outlives the code it points to.

#![allow(unsafe_code)]

use std::ffi::{CString, c_void};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::value::Address;

#[cfg(target_family = "unix")]
mod platform {
    use std::ffi::{CStr, c_void};

    pub(super) unsafe fn load_library(path: Option<&CStr>) -> *mut c_void {
        let name = path.map_or(std::ptr::null(), CStr::as_ptr);
        unsafe { libc::dlopen(name, libc::RTLD_NOW | libc::RTLD_LOCAL) }
    }

    pub(super) unsafe fn resolve_symbol(handle: *mut c_void, symbol: &CStr) -> *mut c_void {
        unsafe { libc::dlsym(handle, symbol.as_ptr()) }
    }

    pub(super) fn last_error() -> String {
        let message = unsafe { libc::dlerror() };
        if message.is_null() {
            "unknown dynamic loader error".to_string()
        } else {
            unsafe { CStr::from_ptr(message) }
                .to_string_lossy()
                .into_owned()
        }
    }
}

#[cfg(target_family = "windows")]
mod platform {
    use std::ffi::{CStr, c_char, c_void};
    use std::iter;
    use std::os::windows::ffi::OsStrExt;

    type HMODULE = *mut c_void;

    #[link(name = "kernel32")]
    unsafe extern "system" {
        fn LoadLibraryW(lpFileName: *const u16) -> HMODULE;
        fn GetModuleHandleW(lpModuleName: *const u16) -> HMODULE;
        fn GetProcAddress(hModule: HMODULE, lpProcName: *const c_char) -> *mut c_void;
        fn GetLastError() -> u32;
    }

    pub(super) unsafe fn load_library(path: Option<&CStr>) -> *mut c_void {
        let Some(path) = path else {
            return unsafe { GetModuleHandleW(std::ptr::null()) };
        };
        let wide: Vec<u16> = std::path::Path::new(&path.to_string_lossy().to_string())
            .as_os_str()
            .encode_wide()
            .chain(iter::once(0))
            .collect();
        unsafe { LoadLibraryW(wide.as_ptr()) }
    }

    pub(super) unsafe fn resolve_symbol(handle: *mut c_void, symbol: &CStr) -> *mut c_void {
        unsafe { GetProcAddress(handle, symbol.as_ptr()) }
    }

    pub(super) fn last_error() -> String {
        format!("win32 error {}", unsafe { GetLastError() })
    }
}

struct Handle(*mut c_void);

// Loader handles are process-global and never closed.
unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

/// A loaded dynamic library, or the running process image.
#[derive(Clone)]
pub struct Library {
    name: Arc<str>,
    handle: Arc<Handle>,
}

impl Library {
    /// Load the library at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`LibraryError`] when the loader refuses the path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let c_path = CString::new(display.as_bytes()).map_err(|_| LibraryError {
            path: display.clone(),
            message: "path contains an interior NUL byte".into(),
        })?;
        let handle = unsafe { platform::load_library(Some(&c_path)) };
        if handle.is_null() {
            return Err(Error::Library(LibraryError {
                path: display,
                message: platform::last_error(),
            }));
        }
        tracing::debug!(target: "downcall.link", library = %path.display(), "library loaded");
        Ok(Self {
            name: display.into(),
            handle: Arc::new(Handle(handle)),
        })
    }

    /// The running process together with every library it has loaded
    /// globally, including the C runtime.
    ///
    /// # Errors
    ///
    /// Returns [`LibraryError`] when the loader cannot provide a handle.
    pub fn this() -> Result<Self> {
        let handle = unsafe { platform::load_library(None) };
        if handle.is_null() {
            return Err(Error::Library(LibraryError {
                path: "<process>".into(),
                message: platform::last_error(),
            }));
        }
        Ok(Self {
            name: "<process>".into(),
            handle: Arc::new(Handle(handle)),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolve `name` to its address.
    ///
    /// # Errors
    ///
    /// Returns [`SymbolNotFoundError`] when the symbol is absent or resolves
    /// to null.
    pub fn lookup(&self, name: &str) -> Result<NativeSymbol> {
        let not_found = || SymbolNotFoundError {
            name: name.to_string(),
            library: Some(self.name.to_string()),
        };
        let symbol = CString::new(name).map_err(|_| not_found())?;
        let address = unsafe { platform::resolve_symbol(self.handle.0, &symbol) };
        if address.is_null() {
            tracing::debug!(target: "downcall.link", library = %self.name, symbol = name, "symbol not found");
            return Err(not_found().into());
        }
        Ok(NativeSymbol {
            name: name.into(),
            address: Address::from_ptr(address.cast_const()),
        })
    }
}

impl fmt::Debug for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Library").field("name", &self.name).finish()
    }
}

/// Name and address of a native function.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NativeSymbol {
    name: Arc<str>,
    address: Address,
}

impl NativeSymbol {
    /// Wrap an address obtained elsewhere, e.g. a Rust `extern "C" fn`.
    #[must_use]
    pub fn from_raw(name: impl Into<Arc<str>>, ptr: *const ()) -> Self {
        Self {
            name: name.into(),
            address: Address::from_ptr(ptr),
        }
    }

    #[must_use]
    pub fn from_address(name: impl Into<Arc<str>>, address: Address) -> Self {
        Self {
            name: name.into(),
            address,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn address(&self) -> Address {
        self.address
    }
}

impl fmt::Display for NativeSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.address)
    }
}

/// A dynamic library could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryError {
    pub path: String,
    pub message: String,
}

impl fmt::Display for LibraryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to load `{}`: {}", self.path, self.message)
    }
}

impl std::error::Error for LibraryError {}

/// A symbol name did not resolve, or resolved to a null address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolNotFoundError {
    pub name: String,
    pub library: Option<String>,
}

impl fmt::Display for SymbolNotFoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.library {
            Some(library) => write!(f, "symbol `{}` not found in {library}", self.name),
            None => write!(f, "symbol `{}` has a null address", self.name),
        }
    }
}

impl std::error::Error for SymbolNotFoundError {}
