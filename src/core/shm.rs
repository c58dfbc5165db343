// Shared-memory regions: header validation, MAP_SHARED mmap, and atomic word access.
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;

use fs2::FileExt;
use libc::{EACCES, EPERM};
use memmap2::MmapMut;

use crate::core::error::{Error, ErrorKind};

const MAGIC: [u8; 4] = *b"TDSL";
const VERSION: u32 = 1;
const ENDIANNESS_LE: u8 = 1;
const HEADER_SIZE: usize = 64;
pub(crate) const REGION_SIZE: usize = 4096;
pub(crate) const WORD_COUNT: usize = (REGION_SIZE - HEADER_SIZE) / 8;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct RegionHeader {
    region_size: u64,
    words: u64,
}

impl RegionHeader {
    fn new() -> Self {
        Self {
            region_size: REGION_SIZE as u64,
            words: WORD_COUNT as u64,
        }
    }

    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&VERSION.to_le_bytes());
        buf[8] = ENDIANNESS_LE;
        buf[16..24].copy_from_slice(&self.region_size.to_le_bytes());
        buf[24..32].copy_from_slice(&self.words.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::new(ErrorKind::Corrupt).with_message("header too small"));
        }
        if buf[0..4] != MAGIC {
            return Err(Error::new(ErrorKind::Corrupt).with_message("bad magic"));
        }
        let version = u32::from_le_bytes(read_4(buf, 4));
        if version != VERSION {
            return Err(Error::new(ErrorKind::Corrupt).with_message("unsupported version"));
        }
        if buf[8] != ENDIANNESS_LE {
            return Err(Error::new(ErrorKind::Corrupt).with_message("unsupported endianness"));
        }
        Ok(Self {
            region_size: read_u64(buf, 16),
            words: read_u64(buf, 24),
        })
    }

    fn validate(&self, actual_size: u64) -> Result<(), Error> {
        if self.region_size != REGION_SIZE as u64 || actual_size < self.region_size {
            return Err(Error::new(ErrorKind::Corrupt).with_message("invalid region size"));
        }
        if self.words != WORD_COUNT as u64 {
            return Err(Error::new(ErrorKind::Corrupt).with_message("invalid word count"));
        }
        Ok(())
    }
}

fn read_4(buf: &[u8], offset: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    out
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(out)
}

/// A page of memory visible to every process that maps it.
///
/// Anonymous regions are backed by an unlinked temp file and are shared with
/// children forked after creation. Named regions are shared with any process
/// that opens the same path.
pub struct SharedRegion {
    path: Option<PathBuf>,
    _file: File,
    mmap: MmapMut,
}

impl SharedRegion {
    pub fn anonymous() -> Result<Self, Error> {
        let mut file = tempfile::tempfile()
            .map_err(|err| Error::io(err).with_message("failed to create shared region"))?;
        init_file(&mut file, None)?;
        Self::map(file, None)
    }

    /// Opens the region at `path`, creating and initialising it when absent.
    pub fn open_or_create(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| Error::new(ErrorKind::Io).with_path(&path).with_source(err))?;

        file.lock_exclusive().map_err(|err| {
            Error::new(lock_error_kind(&err))
                .with_path(&path)
                .with_source(err)
        })?;
        let prepared = prepare_named(&mut file, &path);
        let _ = fs2::FileExt::unlock(&file);
        prepared?;

        Self::map(file, Some(path))
    }

    fn map(file: File, path: Option<PathBuf>) -> Result<Self, Error> {
        let mmap = unsafe {
            MmapMut::map_mut(&file).map_err(|err| {
                let err = Error::new(ErrorKind::Io).with_source(err);
                match &path {
                    Some(path) => err.with_path(path),
                    None => err,
                }
            })?
        };
        Ok(Self {
            path,
            _file: file,
            mmap,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn word(&self, index: usize) -> &AtomicU64 {
        assert!(index < WORD_COUNT, "shared word index out of range");
        let offset = HEADER_SIZE + index * 8;
        // The mapping is page-aligned and `offset` is a multiple of 8.
        unsafe { &*(self.mmap.as_ptr().add(offset) as *const AtomicU64) }
    }
}

fn prepare_named(file: &mut File, path: &Path) -> Result<(), Error> {
    let actual_size = file
        .metadata()
        .map(|meta| meta.len())
        .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;
    if actual_size == 0 {
        return init_file(file, Some(path));
    }
    let header = read_header(file, path)?;
    header.validate(actual_size)
}

fn init_file(file: &mut File, path: Option<&Path>) -> Result<(), Error> {
    let with_path = |err: io::Error| {
        let err = Error::new(ErrorKind::Io).with_source(err);
        match path {
            Some(path) => err.with_path(path),
            None => err,
        }
    };
    file.set_len(REGION_SIZE as u64).map_err(with_path)?;
    file.seek(SeekFrom::Start(0)).map_err(with_path)?;
    file.write_all(&RegionHeader::new().encode()).map_err(with_path)?;
    file.flush().map_err(with_path)?;
    Ok(())
}

fn read_header(file: &mut File, path: &Path) -> Result<RegionHeader, Error> {
    let mut buf = [0u8; HEADER_SIZE];
    file.seek(SeekFrom::Start(0))
        .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;
    file.read_exact(&mut buf)
        .map_err(|err| Error::new(ErrorKind::Corrupt).with_path(path).with_source(err))?;
    RegionHeader::decode(&buf)
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Usage;
    }
    ErrorKind::Io
}

#[cfg(test)]
mod tests {
    use super::SharedRegion;
    use crate::core::error::ErrorKind;
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};
    use std::sync::atomic::Ordering;

    #[test]
    fn named_region_is_shared_between_mappings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("lock.tandem");
        let first = SharedRegion::open_or_create(&path).expect("create");
        let second = SharedRegion::open_or_create(&path).expect("open");

        first.word(0).store(99, Ordering::SeqCst);
        assert_eq!(second.word(0).load(Ordering::SeqCst), 99);
        assert_eq!(second.path(), Some(path.as_path()));
    }

    #[test]
    fn anonymous_region_starts_zeroed() {
        let region = SharedRegion::anonymous().expect("anonymous");
        assert_eq!(region.word(0).load(Ordering::SeqCst), 0);
        assert!(region.path().is_none());
    }

    #[test]
    fn corrupt_header_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("lock.tandem");
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .read(true)
            .open(&path)
            .expect("create");
        file.set_len(4096).expect("len");
        file.seek(SeekFrom::Start(0)).expect("seek");
        file.write_all(b"NOPE").expect("write");
        file.flush().expect("flush");

        match SharedRegion::open_or_create(&path) {
            Ok(_) => panic!("expected corrupt header error"),
            Err(err) => assert_eq!(err.kind(), ErrorKind::Corrupt),
        }
    }

    #[test]
    fn lock_errors_map_to_expected_kinds() {
        let err = std::io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(super::lock_error_kind(&err), ErrorKind::Usage);

        let err = std::io::Error::from_raw_os_error(libc::EBADF);
        assert_eq!(super::lock_error_kind(&err), ErrorKind::Io);
    }
}
