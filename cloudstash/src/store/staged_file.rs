use crate::util::close::Close;
use crate::util::encoding::ICASE_NOPAD_ALPHANUMERIC_ENCODING;
use data_encoding::Encoding;
use fs2::FileExt;
use std::ffi::OsStr;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::{fs, io};
use tracing::debug;

const TMP_FILE_SUFFIX_ENCODING: Encoding = ICASE_NOPAD_ALPHANUMERIC_ENCODING;
const TMP_FILE_SUFFIX_BYTES: usize = 4;
const TMP_FILE_SUFFIX_ENCODED_LEN: usize = 7;

/// A file that is staged to be atomically moved to a target path.
///
/// The file is created with a temporary name in the same directory as the target path. Only once
/// [Close::close] is called, the file is moved to the target path. Dropping the instance without
/// closing it deletes the temporary file and leaves the target path untouched.
pub struct StagedFile {
    file: File,
    tmp_path: PathBuf,
    target_path: PathBuf,
    finalized: bool,
}

impl StagedFile {
    pub fn new(target_path: impl Into<PathBuf>) -> io::Result<Self> {
        let bytes: [u8; TMP_FILE_SUFFIX_BYTES] = rand::random();
        Self::new_with_suffix(target_path.into(), &TMP_FILE_SUFFIX_ENCODING.encode(&bytes))
    }

    fn new_with_suffix(target_path: PathBuf, suffix: &str) -> io::Result<Self> {
        let filename = target_path
            .file_name()
            .and_then(OsStr::to_str)
            .ok_or(io::Error::new(ErrorKind::InvalidInput, "Invalid filename"))?;
        let tmp_path = target_path.with_file_name(format!("{}.tmp.{}", filename, suffix));
        for _ in 0..5 {
            let file = OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&tmp_path)?;
            file.lock_exclusive()?;
            if !tmp_path.exists() {
                // The file was deleted, likely by clean_leftover_tmp_files, before we could lock
                // it. Try again.
                continue;
            }
            return Ok(Self {
                file,
                tmp_path,
                target_path,
                finalized: false,
            });
        }
        Err(io::Error::other("Failed to create and lock temporary file"))
    }

    fn finalize(&mut self) -> io::Result<()> {
        self.finalized = true;
        self.file.sync_data()?;
        fs::rename(&self.tmp_path, &self.target_path)
    }
}

impl Write for StagedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Close for StagedFile {
    fn close(mut self) -> io::Result<()> {
        let result = self.finalize();
        if result.is_err() {
            self.finalized = false;
        }
        result
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.finalized {
            if let Err(err) = fs::remove_file(&self.tmp_path) {
                debug!(path = %self.tmp_path.display(), error = %err, "could not remove abandoned temporary file");
            }
        }
    }
}

/// Writes `data` to `target_path` atomically.
pub fn write_atomically(target_path: impl Into<PathBuf>, data: &[u8]) -> io::Result<()> {
    let mut file = StagedFile::new(target_path)?;
    file.write_all(data)?;
    file.close()
}

/// Cleans up leftover temporary files of [StagedFile] in the given directory and its
/// subdirectories.
///
/// Usually the temporary file is moved or deleted when the [StagedFile] is closed or dropped.
/// However, if a process is killed hard, the temporary file may be left behind.
pub fn clean_leftover_tmp_files(path: impl AsRef<Path>) -> io::Result<usize> {
    let mut removed = 0;
    for entry in path.as_ref().read_dir()? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_file() {
            if is_tmp_file_name(&entry.file_name()) {
                let is_locked = OpenOptions::new()
                    .read(true)
                    .open(entry.path())
                    .and_then(|file_handle| file_handle.try_lock_exclusive())
                    .is_ok();
                if is_locked {
                    fs::remove_file(entry.path())?;
                    removed += 1;
                }
            }
        } else if file_type.is_dir() {
            removed += clean_leftover_tmp_files(entry.path())?;
        }
    }
    Ok(removed)
}

/// Whether `file_name` looks like the name of a [StagedFile] temporary file.
pub fn is_tmp_file_name(file_name: &OsStr) -> bool {
    let Some(file_name) = file_name.to_str() else {
        return false;
    };
    let mut parts = file_name.rsplitn(3, '.');
    let suffix = parts.next();
    let ext = parts.next();
    ext == Some("tmp") && suffix.map(|s| s.len()) == Some(TMP_FILE_SUFFIX_ENCODED_LEN)
}
