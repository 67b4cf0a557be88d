//! Plugin lookup: statically registered descriptors first, then shared
//! libraries from the plugins folder.
use crate::config::types::{ErrorCode, PluginKind};
use crate::plugin::{ModelData, PluginError, PluginResult, RolePlugin};
use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Name of the function a plugin library exports, see [`declare_plugin!`](crate::declare_plugin).
pub const DESCRIPTOR_SYMBOL: &str = "plugbox_plugin_descriptor";

/// Builds the plugin object once the process is locked down.
pub type Constructor = fn(&ModelData) -> PluginResult<RolePlugin>;

/// How to build one plugin.
#[derive(Clone, Copy)]
pub struct PluginDescriptor {
    pub name: &'static str,
    pub kind: PluginKind,
    pub construct: Constructor,
    /// Runs right after loading, under the loading-phase Warden
    pub on_load: Option<fn()>,
}

impl PluginDescriptor {
    pub const fn new(name: &'static str, kind: PluginKind, construct: Constructor) -> Self {
        Self {
            name,
            kind,
            construct,
            on_load: None,
        }
    }

    pub const fn with_load_hook(mut self, hook: fn()) -> Self {
        self.on_load = Some(hook);
        self
    }
}

impl std::fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("on_load", &self.on_load.is_some())
            .finish()
    }
}

/// Export the descriptor of a plugin built as a shared library.
///
/// ```ignore
/// plugbox::declare_plugin!("identity", PluginKind::Heuristics, build_identity);
/// ```
///
/// The library must be built with the same toolchain as the sandbox binary.
#[macro_export]
macro_rules! declare_plugin {
    ($name:expr, $kind:expr, $construct:path) => {
        #[no_mangle]
        pub fn plugbox_plugin_descriptor() -> $crate::host::PluginDescriptor {
            $crate::host::PluginDescriptor::new($name, $kind, $construct)
        }
    };
}

/// Plugins compiled into the sandbox binary.
#[derive(Clone, Debug, Default)]
pub struct PluginRegistry {
    plugins: Vec<PluginDescriptor>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `descriptor`, replacing a previous one with the same name.
    pub fn register(&mut self, descriptor: PluginDescriptor) -> &mut Self {
        self.plugins.retain(|known| known.name != descriptor.name);
        self.plugins.push(descriptor);
        self
    }

    pub fn with(mut self, descriptor: PluginDescriptor) -> Self {
        self.register(descriptor);
        self
    }

    pub fn find(&self, name: &str) -> Option<&PluginDescriptor> {
        self.plugins.iter().find(|descriptor| descriptor.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.plugins.iter().map(|descriptor| descriptor.name)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

/// A plugin library kept mapped for the life of the process.
///
/// Never unloaded: constructed plugins hold code and vtables from it.
#[derive(Debug)]
pub struct DynamicLibrary {
    path: PathBuf,
    _handle: *mut libc::c_void,
}

impl DynamicLibrary {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// `<folder>/<name>.so`
pub fn library_path(folder: &Path, name: &str) -> PathBuf {
    folder.join(format!("{name}.so"))
}

fn dl_error() -> String {
    // SAFETY: dlerror returns a thread-local string or null.
    let message = unsafe { libc::dlerror() };
    if message.is_null() {
        return "unknown dynamic loader error".to_string();
    }
    // SAFETY: non-null dlerror results are NUL-terminated.
    unsafe { CStr::from_ptr(message) }.to_string_lossy().into_owned()
}

/// Map the library at `path` and read its descriptor.
pub fn open_library(path: &Path) -> PluginResult<(DynamicLibrary, PluginDescriptor)> {
    if !path.is_file() {
        return Err(PluginError::new(
            ErrorCode::PluginNotFound,
            format!("{} does not exist", path.display()),
        ));
    }
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        PluginError::new(ErrorCode::PluginLoadingFailed, "library path contains a NUL byte")
    })?;

    // SAFETY: dlopen runs the library's initializers; the caller arms the
    // Warden around this call.
    let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
    if handle.is_null() {
        return Err(PluginError::new(ErrorCode::PluginLoadingFailed, dl_error()));
    }

    let symbol = CString::new(DESCRIPTOR_SYMBOL).map_err(|_| {
        PluginError::new(ErrorCode::PluginLoadingFailed, "invalid descriptor symbol")
    })?;
    // SAFETY: handle is a live dlopen handle.
    let address = unsafe { libc::dlsym(handle, symbol.as_ptr()) };
    if address.is_null() {
        return Err(PluginError::new(
            ErrorCode::PluginLoadingFailed,
            format!("{} does not export {DESCRIPTOR_SYMBOL}: {}", path.display(), dl_error()),
        ));
    }

    // SAFETY: the symbol is the function generated by `declare_plugin!`.
    let describe: fn() -> PluginDescriptor = unsafe { std::mem::transmute(address) };
    let descriptor = describe();
    Ok((
        DynamicLibrary {
            path: path.to_path_buf(),
            _handle: handle,
        },
        descriptor,
    ))
}
