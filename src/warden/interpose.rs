//! libc entry points overridden so the Warden sees process and file operations.
//!
//! Each override asks [`Warden::guard`] first, then forwards to the next
//! definition of the symbol (`dlsym(RTLD_NEXT)`). With no Warden installed,
//! or while disarmed, the overrides are plain pass-throughs.
use super::{Operation, Warden};
use libc::{c_char, c_int, c_void, mode_t, pid_t, FILE};
use std::ffi::CStr;
use std::sync::atomic::{AtomicPtr, Ordering};

struct RealFn {
    name: &'static [u8],
    addr: AtomicPtr<c_void>,
}

impl RealFn {
    const fn new(name: &'static [u8]) -> Self {
        Self {
            name,
            addr: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    fn get(&self) -> *mut c_void {
        let cached = self.addr.load(Ordering::Acquire);
        if !cached.is_null() {
            return cached;
        }
        let found = unsafe { libc::dlsym(libc::RTLD_NEXT, self.name.as_ptr() as *const c_char) };
        self.addr.store(found, Ordering::Release);
        found
    }
}

/// Cast the next definition to its signature. `None` if the symbol is missing.
unsafe fn resolve<F: Copy>(slot: &RealFn) -> Option<F> {
    let addr = slot.get();
    if addr.is_null() {
        None
    } else {
        Some(std::mem::transmute_copy::<*mut c_void, F>(&addr))
    }
}

unsafe fn missing<T>(value: T) -> T {
    *libc::__errno_location() = libc::ENOSYS;
    value
}

fn guard_path(call: &'static str, path: *const c_char) {
    if path.is_null() {
        return;
    }
    let path = unsafe { CStr::from_ptr(path) };
    Warden::guard(Operation::OpenFile {
        call,
        path: path.to_bytes(),
    });
}

static REAL_FORK: RealFn = RealFn::new(b"fork\0");
static REAL_EXECVE: RealFn = RealFn::new(b"execve\0");
static REAL_EXECV: RealFn = RealFn::new(b"execv\0");
static REAL_EXECVP: RealFn = RealFn::new(b"execvp\0");
static REAL_SYSTEM: RealFn = RealFn::new(b"system\0");
static REAL_POSIX_SPAWN: RealFn = RealFn::new(b"posix_spawn\0");
static REAL_POSIX_SPAWNP: RealFn = RealFn::new(b"posix_spawnp\0");
static REAL_OPEN: RealFn = RealFn::new(b"open\0");
static REAL_OPEN64: RealFn = RealFn::new(b"open64\0");
static REAL_OPENAT: RealFn = RealFn::new(b"openat\0");
static REAL_OPENAT64: RealFn = RealFn::new(b"openat64\0");
static REAL_FOPEN: RealFn = RealFn::new(b"fopen\0");
static REAL_FOPEN64: RealFn = RealFn::new(b"fopen64\0");

type ForkFn = unsafe extern "C" fn() -> pid_t;
type ExecveFn = unsafe extern "C" fn(*const c_char, *const *const c_char, *const *const c_char) -> c_int;
type ExecvFn = unsafe extern "C" fn(*const c_char, *const *const c_char) -> c_int;
type SystemFn = unsafe extern "C" fn(*const c_char) -> c_int;
type SpawnFn = unsafe extern "C" fn(
    *mut pid_t,
    *const c_char,
    *const libc::posix_spawn_file_actions_t,
    *const libc::posix_spawnattr_t,
    *const *mut c_char,
    *const *mut c_char,
) -> c_int;
type OpenFn = unsafe extern "C" fn(*const c_char, c_int, mode_t) -> c_int;
type OpenatFn = unsafe extern "C" fn(c_int, *const c_char, c_int, mode_t) -> c_int;
type FopenFn = unsafe extern "C" fn(*const c_char, *const c_char) -> *mut FILE;

#[no_mangle]
pub unsafe extern "C" fn fork() -> pid_t {
    Warden::guard(Operation::Process("fork"));
    match resolve::<ForkFn>(&REAL_FORK) {
        Some(real) => real(),
        None => missing(-1),
    }
}

#[no_mangle]
pub unsafe extern "C" fn vfork() -> pid_t {
    Warden::guard(Operation::Process("vfork"));
    // vfork cannot be forwarded safely from a wrapper frame; fork has the same contract.
    match resolve::<ForkFn>(&REAL_FORK) {
        Some(real) => real(),
        None => missing(-1),
    }
}

#[no_mangle]
pub unsafe extern "C" fn execve(
    path: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    Warden::guard(Operation::Process("execve"));
    match resolve::<ExecveFn>(&REAL_EXECVE) {
        Some(real) => real(path, argv, envp),
        None => missing(-1),
    }
}

#[no_mangle]
pub unsafe extern "C" fn execv(path: *const c_char, argv: *const *const c_char) -> c_int {
    Warden::guard(Operation::Process("execv"));
    match resolve::<ExecvFn>(&REAL_EXECV) {
        Some(real) => real(path, argv),
        None => missing(-1),
    }
}

#[no_mangle]
pub unsafe extern "C" fn execvp(file: *const c_char, argv: *const *const c_char) -> c_int {
    Warden::guard(Operation::Process("execvp"));
    match resolve::<ExecvFn>(&REAL_EXECVP) {
        Some(real) => real(file, argv),
        None => missing(-1),
    }
}

#[no_mangle]
pub unsafe extern "C" fn system(command: *const c_char) -> c_int {
    Warden::guard(Operation::Process("system"));
    match resolve::<SystemFn>(&REAL_SYSTEM) {
        Some(real) => real(command),
        None => missing(-1),
    }
}

#[no_mangle]
pub unsafe extern "C" fn posix_spawn(
    pid: *mut pid_t,
    path: *const c_char,
    file_actions: *const libc::posix_spawn_file_actions_t,
    attrp: *const libc::posix_spawnattr_t,
    argv: *const *mut c_char,
    envp: *const *mut c_char,
) -> c_int {
    Warden::guard(Operation::Process("posix_spawn"));
    match resolve::<SpawnFn>(&REAL_POSIX_SPAWN) {
        Some(real) => real(pid, path, file_actions, attrp, argv, envp),
        None => libc::ENOSYS,
    }
}

#[no_mangle]
pub unsafe extern "C" fn posix_spawnp(
    pid: *mut pid_t,
    file: *const c_char,
    file_actions: *const libc::posix_spawn_file_actions_t,
    attrp: *const libc::posix_spawnattr_t,
    argv: *const *mut c_char,
    envp: *const *mut c_char,
) -> c_int {
    Warden::guard(Operation::Process("posix_spawnp"));
    match resolve::<SpawnFn>(&REAL_POSIX_SPAWNP) {
        Some(real) => real(pid, file, file_actions, attrp, argv, envp),
        None => libc::ENOSYS,
    }
}

// The C prototypes of the open family are variadic; on the supported ABIs the
// optional mode arrives in the same register a fixed third argument would.
#[no_mangle]
pub unsafe extern "C" fn open(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    guard_path("open", path);
    match resolve::<OpenFn>(&REAL_OPEN) {
        Some(real) => real(path, flags, mode),
        None => missing(-1),
    }
}

#[no_mangle]
pub unsafe extern "C" fn open64(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    guard_path("open64", path);
    match resolve::<OpenFn>(&REAL_OPEN64) {
        Some(real) => real(path, flags, mode),
        None => missing(-1),
    }
}

#[no_mangle]
pub unsafe extern "C" fn openat(dirfd: c_int, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    guard_path("openat", path);
    match resolve::<OpenatFn>(&REAL_OPENAT) {
        Some(real) => real(dirfd, path, flags, mode),
        None => missing(-1),
    }
}

#[no_mangle]
pub unsafe extern "C" fn openat64(
    dirfd: c_int,
    path: *const c_char,
    flags: c_int,
    mode: mode_t,
) -> c_int {
    guard_path("openat64", path);
    match resolve::<OpenatFn>(&REAL_OPENAT64) {
        Some(real) => real(dirfd, path, flags, mode),
        None => missing(-1),
    }
}

#[no_mangle]
pub unsafe extern "C" fn fopen(path: *const c_char, mode: *const c_char) -> *mut FILE {
    guard_path("fopen", path);
    match resolve::<FopenFn>(&REAL_FOPEN) {
        Some(real) => real(path, mode),
        None => missing(std::ptr::null_mut()),
    }
}

#[no_mangle]
pub unsafe extern "C" fn fopen64(path: *const c_char, mode: *const c_char) -> *mut FILE {
    guard_path("fopen64", path);
    match resolve::<FopenFn>(&REAL_FOPEN64) {
        Some(real) => real(path, mode),
        None => missing(std::ptr::null_mut()),
    }
}

struct OverrideTable([*const c_void; 14]);

// Read-only table of code addresses.
unsafe impl Sync for OverrideTable {}

/// Keeps every override in the link even when nothing else references this object.
#[used]
static OVERRIDES: OverrideTable = OverrideTable([
    fork as *const c_void,
    vfork as *const c_void,
    execve as *const c_void,
    execv as *const c_void,
    execvp as *const c_void,
    system as *const c_void,
    posix_spawn as *const c_void,
    posix_spawnp as *const c_void,
    open as *const c_void,
    open64 as *const c_void,
    openat as *const c_void,
    openat64 as *const c_void,
    fopen as *const c_void,
    fopen64 as *const c_void,
]);

pub(crate) fn ensure_linked() {
    std::hint::black_box(OVERRIDES.0.as_ptr());
}
