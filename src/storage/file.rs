use super::StateStorage;
use crate::encoding::{bincode, Value};
use crate::error::{Error, Result};

use log::debug;
use std::io::Write as _;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// The current record format version. Records with the same major version and
/// any minor version are readable, a different major version is not.
const FORMAT_MAJOR: u8 = 1;
const FORMAT_MINOR: u8 = 0;

/// A file-backed state store. The file holds a single record: a two-byte
/// major/minor version header followed by the Bincode-encoded state.
///
/// Writes go to a temporary file which is fsynced and then atomically renamed
/// over the previous record, so a crash never leaves a torn record behind.
pub struct File<T> {
    path: PathBuf,
    _state: PhantomData<fn() -> T>,
}

impl<T> File<T> {
    /// Creates a state store at the given path. The parent directory is
    /// created if necessary.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        Ok(Self { path, _state: PhantomData })
    }

    /// Returns the temporary file path used while writing.
    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl<T: Value + Default> File<T> {
    /// Decodes a record, checking its version header.
    fn decode(bytes: &[u8]) -> Result<T> {
        let (major, minor, body) = match bytes {
            [major, minor, body @ ..] => (*major, *minor, body),
            _ => return Err(Error::InvalidData("state record is missing its header".into())),
        };
        if major != FORMAT_MAJOR {
            return Err(Error::InvalidData(format!(
                "unsupported state record version {}.{}, expected {}.x",
                major, minor, FORMAT_MAJOR
            )));
        }
        bincode::deserialize(body)
    }
}

impl<T: Value + Default> StateStorage<T> for File<T> {
    fn initial_state(&mut self) -> Result<T> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Self::decode(&bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn persist(&mut self, state: &T) -> Result<()> {
        let temp_path = self.temp_path();
        let mut file = std::fs::File::create(&temp_path)?;
        file.write_all(&[FORMAT_MAJOR, FORMAT_MINOR])?;
        state.encode_into(&mut file)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&temp_path, &self.path)?;
        #[cfg(unix)]
        if let Some(dir) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::File::open(dir)?.sync_all()?;
        }
        debug!("Persisted state record to {}", self.path.display());
        Ok(())
    }
}
