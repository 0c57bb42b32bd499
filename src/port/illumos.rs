//! illumos/Solaris event port backend.
//!
//! This module provides [`SystemKernel`], which drives a real event port
//! through `port_create(3C)` and friends via libc.
//!
//! # Safety
//!
//! This module uses `unsafe` code to call the event port functions:
//!
//! - `libc::port_create()`: Creates the port descriptor
//! - `libc::port_associate()` / `libc::port_dissociate()`: Arm and disarm objects
//! - `libc::port_get()` / `libc::port_getn()`: Retrieve events
//! - `libc::port_send()`: Posts the wake-up event
//!
//! `PORT_SOURCE_FILE` associations pass the address of a `file_obj` the
//! kernel hands back with the event. Those structures are boxed and owned
//! here, keyed by address, from association until the event is retrieved or
//! a successful dissociation proves it never will be.

#![allow(unsafe_code)]

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::ptr;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use super::cookie::CookieId;
use super::kernel::{FileStamp, Kernel, RawEvent, Timespec, WatchedObject};
use super::mask::EventMask;

/// Layout of `struct file_obj` from `<sys/port.h>`.
#[repr(C)]
struct FileObjRaw {
    fo_atime: libc::timespec,
    fo_mtime: libc::timespec,
    fo_ctime: libc::timespec,
    fo_pad: [libc::uintptr_t; 3],
    fo_name: *mut libc::c_char,
}

/// A `file_obj` plus the storage its name points into.
struct FileObj {
    raw: FileObjRaw,
    _name: CString,
    path: PathBuf,
}

// SAFETY: `fo_name` points into `_name`, which is owned by the same value and
// never mutated; the pointer is only dereferenced by the kernel.
unsafe impl Send for FileObj {}

impl FileObj {
    fn new(path: PathBuf, stamp: &FileStamp) -> io::Result<Box<Self>> {
        let name = CString::new(path.as_os_str().as_bytes())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let fo_name = name.as_ptr().cast_mut();
        Ok(Box::new(Self {
            raw: FileObjRaw {
                fo_atime: to_libc(stamp.atime),
                fo_mtime: to_libc(stamp.mtime),
                fo_ctime: to_libc(stamp.ctime),
                fo_pad: [0; 3],
                fo_name,
            },
            _name: name,
            path,
        }))
    }

    fn addr(&self) -> usize {
        ptr::addr_of!(self.raw) as usize
    }
}

#[allow(clippy::cast_possible_truncation, clippy::useless_conversion)]
fn to_libc(ts: Timespec) -> libc::timespec {
    libc::timespec {
        tv_sec: ts.sec as libc::time_t,
        tv_nsec: ts.nsec as libc::c_long,
    }
}

#[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
fn timeout_spec(timeout: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: timeout.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    }
}

/// File objects owned on behalf of the kernel.
#[derive(Default)]
struct FileObjects {
    /// Live association per path.
    live: HashMap<PathBuf, usize>,
    /// Every `file_obj` the kernel may still return, by address.
    objects: HashMap<usize, Box<FileObj>>,
}

/// Kernel event port backed by `port_create(3C)`.
///
/// Dropping the kernel closes the port descriptor and frees every
/// `file_obj` still owned on the kernel's behalf.
pub struct SystemKernel {
    port: OwnedFd,
    files: Mutex<FileObjects>,
}

impl SystemKernel {
    fn check(ret: libc::c_int) -> io::Result<libc::c_int> {
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret)
        }
    }

    /// Translates a raw `port_event` into a [`RawEvent`].
    fn translate(&self, pe: &libc::port_event) -> io::Result<RawEvent> {
        let source = libc::c_int::from(pe.portev_source);
        #[allow(clippy::cast_sign_loss)]
        let events = EventMask::from_bits(pe.portev_events as u32);
        let cookie = CookieId::from_u64(pe.portev_user as usize as u64);
        match source {
            libc::PORT_SOURCE_USER => Ok(RawEvent::Wake),
            #[allow(clippy::cast_possible_truncation)]
            libc::PORT_SOURCE_FD => Ok(RawEvent::Object {
                object: WatchedObject::Fd(pe.portev_object as RawFd),
                events,
                cookie,
            }),
            libc::PORT_SOURCE_FILE => {
                let mut files = self.files.lock();
                let obj = files.objects.remove(&pe.portev_object).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "event for unknown file_obj")
                })?;
                if files.live.get(&obj.path) == Some(&pe.portev_object) {
                    files.live.remove(&obj.path);
                }
                Ok(RawEvent::Object {
                    object: WatchedObject::Path(obj.path),
                    events,
                    cookie,
                })
            }
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected port source {other}"),
            )),
        }
    }

    fn empty_event() -> libc::port_event {
        libc::port_event {
            portev_events: 0,
            portev_source: 0,
            portev_pad: 0,
            portev_object: 0,
            portev_user: ptr::null_mut(),
        }
    }
}

impl Kernel for SystemKernel {
    fn create() -> io::Result<Self> {
        // SAFETY: port_create has no preconditions.
        let fd = Self::check(unsafe { libc::port_create() })?;
        // SAFETY: fd was just returned by port_create and is owned by no one else.
        let port = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self {
            port,
            files: Mutex::new(FileObjects::default()),
        })
    }

    fn associate(
        &self,
        object: &WatchedObject,
        stamp: Option<&FileStamp>,
        events: EventMask,
        cookie: CookieId,
    ) -> io::Result<()> {
        let user = cookie.to_u64() as usize as *mut libc::c_void;
        #[allow(clippy::cast_possible_wrap)]
        let bits = events.bits() as libc::c_int;
        match object {
            WatchedObject::Fd(fd) => {
                #[allow(clippy::cast_sign_loss)]
                let obj = *fd as libc::uintptr_t;
                // SAFETY: plain syscall on a descriptor we own.
                Self::check(unsafe {
                    libc::port_associate(self.port.as_raw_fd(), libc::PORT_SOURCE_FD, obj, bits, user)
                })?;
            }
            WatchedObject::Path(path) => {
                let stamp = match stamp {
                    Some(stamp) => *stamp,
                    None => FileStamp::from_path(path)?,
                };
                let fobj = FileObj::new(path.clone(), &stamp)?;
                let addr = fobj.addr();
                // Held across the call so a retrieval racing the event waits
                // until the file_obj is registered.
                let mut files = self.files.lock();
                // SAFETY: addr points at a boxed file_obj that stays alive in
                // `files.objects` until its event is retrieved or dissociated.
                Self::check(unsafe {
                    libc::port_associate(self.port.as_raw_fd(), libc::PORT_SOURCE_FILE, addr, bits, user)
                })?;
                files.live.insert(path.clone(), addr);
                files.objects.insert(addr, fobj);
            }
        }
        trace!(%object, cookie = %cookie, "port_associate");
        Ok(())
    }

    fn dissociate(&self, object: &WatchedObject) -> io::Result<()> {
        match object {
            WatchedObject::Fd(fd) => {
                #[allow(clippy::cast_sign_loss)]
                let obj = *fd as libc::uintptr_t;
                // SAFETY: plain syscall on a descriptor we own.
                Self::check(unsafe {
                    libc::port_dissociate(self.port.as_raw_fd(), libc::PORT_SOURCE_FD, obj)
                })?;
            }
            WatchedObject::Path(path) => {
                let mut files = self.files.lock();
                let addr = files
                    .live
                    .get(path)
                    .copied()
                    .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
                // SAFETY: addr is a live boxed file_obj owned by `files`.
                let ret = unsafe {
                    libc::port_dissociate(self.port.as_raw_fd(), libc::PORT_SOURCE_FILE, addr)
                };
                match Self::check(ret) {
                    Ok(_) => {
                        files.live.remove(path);
                        files.objects.remove(&addr);
                    }
                    Err(err) => {
                        // Fired: the event still references the file_obj.
                        if err.raw_os_error() == Some(libc::ENOENT) {
                            files.live.remove(path);
                        }
                        return Err(err);
                    }
                }
            }
        }
        trace!(%object, "port_dissociate");
        Ok(())
    }

    fn get_event(&self, timeout: Option<Duration>) -> io::Result<RawEvent> {
        let mut pe = Self::empty_event();
        let mut ts = timeout.map(timeout_spec);
        let ts_ptr = ts
            .as_mut()
            .map_or(ptr::null_mut(), |ts| ts as *mut libc::timespec);
        // SAFETY: pe and ts outlive the call.
        Self::check(unsafe { libc::port_get(self.port.as_raw_fd(), &mut pe, ts_ptr) })?;
        self.translate(&pe)
    }

    fn get_events(
        &self,
        events: &mut Vec<RawEvent>,
        max: usize,
        min: usize,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        let max_u = libc::c_uint::try_from(max)
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        let mut nget = libc::c_uint::try_from(min.min(max))
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        let mut list: Vec<libc::port_event> = (0..max).map(|_| Self::empty_event()).collect();
        let mut ts = timeout.map(timeout_spec);
        let ts_ptr = ts
            .as_mut()
            .map_or(ptr::null_mut(), |ts| ts as *mut libc::timespec);

        // SAFETY: list holds `max` events; nget and ts outlive the call.
        let ret = unsafe {
            libc::port_getn(self.port.as_raw_fd(), list.as_mut_ptr(), max_u, &mut nget, ts_ptr)
        };
        if let Err(err) = Self::check(ret) {
            // A timeout after a partial batch still reports what arrived.
            if !(err.raw_os_error() == Some(libc::ETIME) && nget > 0) {
                return Err(err);
            }
        }
        for pe in list.iter().take(nget as usize) {
            events.push(self.translate(pe)?);
        }
        Ok(())
    }

    fn pending(&self) -> io::Result<usize> {
        let mut nget: libc::c_uint = 0;
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: max 0 queries the queue length without retrieving events.
        Self::check(unsafe {
            libc::port_getn(self.port.as_raw_fd(), ptr::null_mut(), 0, &mut nget, &mut ts)
        })?;
        Ok(nget as usize)
    }

    fn wake(&self) -> io::Result<()> {
        // SAFETY: PORT_SOURCE_USER events carry no object.
        Self::check(unsafe { libc::port_send(self.port.as_raw_fd(), 0, ptr::null_mut()) })?;
        Ok(())
    }
}

impl std::fmt::Debug for SystemKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let files = self.files.lock();
        f.debug_struct("SystemKernel")
            .field("port", &self.port.as_raw_fd())
            .field("live_files", &files.live.len())
            .field("file_objects", &files.objects.len())
            .finish()
    }
}
