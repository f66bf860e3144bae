//! File-backed shared-memory transport.
//!
//! Every service is one file under the transport directory (`/dev/shm` by
//! default), mapped by each endpoint. The first endpoint to open a service
//! creates and initializes the file; later ones validate its header.
//!
//! # Layout
//!
//! ```text
//! header (64 bytes)
//!   magic, version, record size, capacity, history size,
//!   write cursor (u64), wake-up word (u32)
//! slots (capacity x SLOT_STRIDE)
//!   sequence (u64), record (RECORD_SIZE bytes, padded to 8)
//! ```
//!
//! Slots form a ring indexed by a monotonically increasing record number.
//! A slot's sequence is `2n + 1` while record `n` is being written and
//! `2n + 2` once it is complete, so readers detect torn or overwritten slots.
//! One publisher per service is assumed. Capacity is one more than the larger
//! of history and subscriber buffer so the slot being written is never one a
//! subscriber is entitled to read.
//!
//! Wake-ups use a shared (non-private) futex on Linux and short sleeps
//! elsewhere.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering, fence};
use std::thread;
use std::time::{Duration, Instant};

use super::{IpcError, Publisher, ServiceConfig, Subscriber, Transport, validate};
use crate::wire::{RECORD_SIZE, Record};

pub const DEFAULT_SHM_DIR: &str = "/dev/shm";

const SERVICE_MAGIC: u64 = 0x534f_4d45_4950_5431; // "SOMEIPT1"
const CELL_MAGIC: u64 = 0x534f_4d45_4950_4731; // "SOMEIPG1"
const LAYOUT_VERSION: u32 = 1;

const HEADER_BYTES: usize = 64;
const SLOT_STRIDE: usize = (8 + RECORD_SIZE).next_multiple_of(8);

const OPEN_RETRIES: usize = 200;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(5);

#[repr(C)]
struct ServiceHeader {
    magic: AtomicU64,
    version: AtomicU32,
    record_size: AtomicU32,
    capacity: AtomicU32,
    history_size: AtomicU32,
    write_cursor: AtomicU64,
    signal: AtomicU32,
}

#[repr(C)]
struct CellHeader {
    magic: AtomicU64,
    value: AtomicU64,
    signal: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<ServiceHeader>() <= HEADER_BYTES);
const _: () = assert!(std::mem::size_of::<CellHeader>() <= HEADER_BYTES);

#[cfg(target_os = "linux")]
fn futex_wait(word: &AtomicU32, expected: u32, timeout: Duration) {
    let ts = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };
    // SAFETY: `word` lives in a mapping that outlives the call. FUTEX_WAIT
    // (not the private variant) so waiters in other processes are woken.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAIT,
            expected,
            &ts as *const libc::timespec,
            ptr::null::<u32>(),
            0u32,
        );
    }
}

#[cfg(target_os = "linux")]
fn futex_wake_all(word: &AtomicU32) {
    // SAFETY: see futex_wait.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAKE,
            i32::MAX,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0u32,
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn futex_wait(word: &AtomicU32, expected: u32, timeout: Duration) {
    if word.load(Ordering::Acquire) == expected {
        thread::sleep(timeout.min(Duration::from_millis(1)));
    }
}

#[cfg(not(target_os = "linux"))]
fn futex_wake_all(_word: &AtomicU32) {}

/// A shared read-write mapping of a whole file.
struct Mapping {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the mapping is plain shared memory; all cross-thread access goes
// through atomics or the slot sequence protocol.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    fn new(file: &File, len: usize, name: &str) -> Result<Self, IpcError> {
        // SAFETY: fd is open read-write and the file is at least `len` bytes.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(IpcError::io(name, std::io::Error::last_os_error()));
        }
        Ok(Self {
            ptr: ptr.cast(),
            len,
        })
    }

    /// # Safety
    /// `T` must fit at offset 0 and be valid for any bit pattern.
    unsafe fn header<T>(&self) -> &T {
        unsafe { &*(self.ptr as *const T) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len come from a successful mmap.
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }
    }
}

enum Opened {
    Created(File),
    Existing(File),
}

fn create_or_open(path: &Path, name: &str) -> Result<Opened, IpcError> {
    match OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
    {
        Ok(file) => Ok(Opened::Created(file)),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map(Opened::Existing)
            .map_err(|e| IpcError::io(name, e)),
        Err(e) => Err(IpcError::io(name, e)),
    }
}

/// Maps an existing file once its creator has published the magic value.
fn map_initialized(file: &File, name: &str, magic: u64) -> Result<Mapping, IpcError> {
    for _ in 0..OPEN_RETRIES {
        let len = file
            .metadata()
            .map_err(|e| IpcError::io(name, e))?
            .len() as usize;
        if len >= HEADER_BYTES {
            let mapping = Mapping::new(file, len, name)?;
            // SAFETY: the mapping covers at least HEADER_BYTES.
            let found = unsafe { mapping.header::<AtomicU64>() }.load(Ordering::Acquire);
            if found == magic {
                return Ok(mapping);
            }
            if found != 0 {
                return Err(IpcError::Incompatible {
                    name: name.to_string(),
                    reason: format!("unexpected magic {found:#018x}"),
                });
            }
        }
        thread::sleep(OPEN_RETRY_DELAY);
    }
    Err(IpcError::Incompatible {
        name: name.to_string(),
        reason: "creator never finished initializing".to_string(),
    })
}

struct Segment {
    name: String,
    mapping: Mapping,
    capacity: u64,
}

impl Segment {
    fn open(dir: &Path, config: &ServiceConfig) -> Result<Self, IpcError> {
        validate(config)?;
        let name = config.name.as_str();
        let path = dir.join(name);

        match create_or_open(&path, name)? {
            Opened::Created(file) => {
                let capacity = config.history_size.max(config.subscriber_max_buffer_size) + 1;
                let len = HEADER_BYTES + capacity * SLOT_STRIDE;
                file.set_len(len as u64).map_err(|e| IpcError::io(name, e))?;
                let mapping = Mapping::new(&file, len, name)?;
                // SAFETY: the mapping covers HEADER_BYTES; fresh files are zeroed.
                let header = unsafe { mapping.header::<ServiceHeader>() };
                header.version.store(LAYOUT_VERSION, Ordering::Relaxed);
                header.record_size.store(RECORD_SIZE as u32, Ordering::Relaxed);
                header.capacity.store(capacity as u32, Ordering::Relaxed);
                header
                    .history_size
                    .store(config.history_size as u32, Ordering::Relaxed);
                header.magic.store(SERVICE_MAGIC, Ordering::Release);
                tracing::debug!(service = name, path = %path.display(), capacity, "Created shared-memory service");
                Ok(Self {
                    name: name.to_string(),
                    mapping,
                    capacity: capacity as u64,
                })
            }
            Opened::Existing(file) => {
                let mapping = map_initialized(&file, name, SERVICE_MAGIC)?;
                // SAFETY: map_initialized checked the length and magic.
                let header = unsafe { mapping.header::<ServiceHeader>() };
                let incompatible = |reason: String| IpcError::Incompatible {
                    name: name.to_string(),
                    reason,
                };
                let version = header.version.load(Ordering::Relaxed);
                if version != LAYOUT_VERSION {
                    return Err(incompatible(format!("layout version {version}")));
                }
                let record_size = header.record_size.load(Ordering::Relaxed) as usize;
                if record_size != RECORD_SIZE {
                    return Err(incompatible(format!("record size {record_size}")));
                }
                let history = header.history_size.load(Ordering::Relaxed) as usize;
                if history != config.history_size {
                    return Err(incompatible(format!(
                        "history size {} requested, service has {history}",
                        config.history_size
                    )));
                }
                let capacity = header.capacity.load(Ordering::Relaxed) as usize;
                if capacity == 0 || mapping.len < HEADER_BYTES + capacity * SLOT_STRIDE {
                    return Err(incompatible(format!("truncated ring of {capacity} slots")));
                }
                tracing::debug!(service = name, path = %path.display(), capacity, "Opened shared-memory service");
                Ok(Self {
                    name: name.to_string(),
                    mapping,
                    capacity: capacity as u64,
                })
            }
        }
    }

    fn header(&self) -> &ServiceHeader {
        // SAFETY: validated in open.
        unsafe { self.mapping.header::<ServiceHeader>() }
    }

    fn slot(&self, n: u64) -> (&AtomicU64, *mut u8) {
        let offset = HEADER_BYTES + (n % self.capacity) as usize * SLOT_STRIDE;
        // SAFETY: offset + SLOT_STRIDE is within the mapping for every n.
        unsafe {
            let base = self.mapping.ptr.add(offset);
            (&*(base as *const AtomicU64), base.add(8))
        }
    }
}

/// Transport over files in a shared-memory directory.
#[derive(Debug, Clone)]
pub struct ShmTransport {
    dir: PathBuf,
}

impl Default for ShmTransport {
    fn default() -> Self {
        Self::new(DEFAULT_SHM_DIR)
    }
}

impl ShmTransport {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Transport for ShmTransport {
    fn open_publisher(&self, config: &ServiceConfig) -> Result<Box<dyn Publisher>, IpcError> {
        let segment = Segment::open(&self.dir, config)?;
        let next = segment.header().write_cursor.load(Ordering::Acquire);
        Ok(Box::new(ShmPublisher {
            segment,
            next,
            loaned: None,
        }))
    }

    fn open_subscriber(&self, config: &ServiceConfig) -> Result<Box<dyn Subscriber>, IpcError> {
        let segment = Segment::open(&self.dir, config)?;
        let buffer = (config.subscriber_max_buffer_size as u64).min(segment.capacity - 1);
        let history = (config.history_size as u64).min(buffer);
        let head = segment.header().write_cursor.load(Ordering::Acquire);
        Ok(Box::new(ShmSubscriber {
            next: head.saturating_sub(history),
            segment,
            buffer,
        }))
    }
}

pub struct ShmPublisher {
    segment: Segment,
    next: u64,
    loaned: Option<Box<Record>>,
}

impl Publisher for ShmPublisher {
    fn loan(&mut self) -> Result<&mut Record, IpcError> {
        let record = self
            .loaned
            .get_or_insert_with(|| Box::new([0u8; RECORD_SIZE]));
        Ok(&mut **record)
    }

    fn send(&mut self) -> Result<(), IpcError> {
        let record = self.loaned.take().ok_or(IpcError::NothingLoaned)?;
        let n = self.next;
        let (seq, bytes) = self.segment.slot(n);

        seq.store(2 * n + 1, Ordering::Relaxed);
        fence(Ordering::Release);
        // SAFETY: `bytes` points at RECORD_SIZE writable bytes inside the slot.
        unsafe { ptr::copy_nonoverlapping(record.as_ptr(), bytes, RECORD_SIZE) };
        seq.store(2 * n + 2, Ordering::Release);

        self.next = n + 1;
        let header = self.segment.header();
        header.write_cursor.store(self.next, Ordering::Release);
        header.signal.fetch_add(1, Ordering::Release);
        futex_wake_all(&header.signal);
        Ok(())
    }
}

pub struct ShmSubscriber {
    segment: Segment,
    next: u64,
    buffer: u64,
}

impl Subscriber for ShmSubscriber {
    fn wait(&mut self, timeout: Duration) -> Result<(), IpcError> {
        let header = self.segment.header();
        let seen = header.signal.load(Ordering::Acquire);
        if header.write_cursor.load(Ordering::Acquire) > self.next {
            return Ok(());
        }
        futex_wait(&header.signal, seen, timeout);
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<Box<Record>>, IpcError> {
        loop {
            let head = self.segment.header().write_cursor.load(Ordering::Acquire);
            if self.next >= head {
                return Ok(None);
            }
            let lag = head - self.next;
            if lag > self.buffer {
                tracing::warn!(
                    service = %self.segment.name,
                    dropped = lag - self.buffer,
                    "Subscriber fell behind, dropped oldest records"
                );
                self.next = head - self.buffer;
            }

            let n = self.next;
            let expected = 2 * n + 2;
            let (seq, bytes) = self.segment.slot(n);
            if seq.load(Ordering::Acquire) != expected {
                tracing::warn!(service = %self.segment.name, record = n, "Record overwritten before read");
                self.next += 1;
                continue;
            }
            let mut record = Box::new([0u8; RECORD_SIZE]);
            // SAFETY: `bytes` points at RECORD_SIZE readable bytes inside the slot.
            unsafe { ptr::copy_nonoverlapping(bytes, record.as_mut_ptr(), RECORD_SIZE) };
            fence(Ordering::Acquire);
            self.next += 1;
            if seq.load(Ordering::Relaxed) != expected {
                tracing::warn!(service = %self.segment.name, record = n, "Record overwritten while reading");
                continue;
            }
            return Ok(Some(record));
        }
    }
}

/// A shared 64-bit value with change notification.
///
/// Used for the lifetime channels: one process publishes its generation,
/// the other waits for it to change.
pub struct GenerationCell {
    name: String,
    mapping: Mapping,
}

impl GenerationCell {
    pub fn open(dir: impl AsRef<Path>, name: &str) -> Result<Self, IpcError> {
        validate(&ServiceConfig::new(name))?;
        let path = dir.as_ref().join(name);
        let mapping = match create_or_open(&path, name)? {
            Opened::Created(file) => {
                file.set_len(HEADER_BYTES as u64)
                    .map_err(|e| IpcError::io(name, e))?;
                let mapping = Mapping::new(&file, HEADER_BYTES, name)?;
                // SAFETY: the mapping covers HEADER_BYTES.
                unsafe { mapping.header::<CellHeader>() }
                    .magic
                    .store(CELL_MAGIC, Ordering::Release);
                tracing::debug!(cell = name, path = %path.display(), "Created generation cell");
                mapping
            }
            Opened::Existing(file) => map_initialized(&file, name, CELL_MAGIC)?,
        };
        Ok(Self {
            name: name.to_string(),
            mapping,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn header(&self) -> &CellHeader {
        // SAFETY: the mapping covers HEADER_BYTES and carries CELL_MAGIC.
        unsafe { self.mapping.header::<CellHeader>() }
    }

    pub fn load(&self) -> u64 {
        self.header().value.load(Ordering::Acquire)
    }

    pub fn publish(&self, value: u64) {
        let header = self.header();
        header.value.store(value, Ordering::Release);
        header.signal.fetch_add(1, Ordering::Release);
        futex_wake_all(&header.signal);
    }

    /// Increments the value and returns the new one.
    pub fn bump(&self) -> u64 {
        let header = self.header();
        let value = header.value.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        header.signal.fetch_add(1, Ordering::Release);
        futex_wake_all(&header.signal);
        value
    }

    /// Waits until the value differs from `last`, returning the new value,
    /// or `None` once `timeout` has elapsed.
    pub fn wait_changed(&self, last: u64, timeout: Duration) -> Option<u64> {
        let deadline = Instant::now() + timeout;
        let header = self.header();
        loop {
            let seen = header.signal.load(Ordering::Acquire);
            let value = header.value.load(Ordering::Acquire);
            if value != last {
                return Some(value);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            futex_wait(&header.signal, seen, remaining);
        }
    }
}
