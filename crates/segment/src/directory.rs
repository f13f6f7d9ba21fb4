use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// A flat directory of segment files owned by one feature.
#[derive(Debug, Clone)]
pub struct Directory {
    path: PathBuf,
}

impl Directory {
    /// Open (or create) the directory at `path`.
    pub fn open(path: &Path) -> Result<Self, io::Error> {
        fs::create_dir_all(path)?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create a new, empty file. Fails with `AlreadyExists` if the name is taken.
    pub fn create_file(&self, name: &str) -> Result<SegmentFile, io::Error> {
        let path = self.path.join(name);
        OpenOptions::new().write(true).create_new(true).open(&path)?;
        Ok(SegmentFile {
            name: name.to_string(),
            path,
        })
    }

    /// Give `source` a second name `name` in this directory. Fails with
    /// `AlreadyExists` if the name is taken; `source` is left in place.
    pub fn link_file(&self, source: &SegmentFile, name: &str) -> Result<SegmentFile, io::Error> {
        let path = self.path.join(name);
        fs::hard_link(&source.path, &path)?;
        Ok(SegmentFile {
            name: name.to_string(),
            path,
        })
    }

    pub fn has_file(&self, name: &str) -> bool {
        self.path.join(name).is_file()
    }

    pub fn file(&self, name: &str) -> SegmentFile {
        SegmentFile {
            name: name.to_string(),
            path: self.path.join(name),
        }
    }

    /// All regular files in the directory, in no particular order.
    pub fn files(&self) -> Result<Vec<SegmentFile>, io::Error> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            files.push(SegmentFile {
                name,
                path: entry.path(),
            });
        }
        Ok(files)
    }
}

/// Handle to one append-only segment file. Holds no open descriptor; every
/// operation opens and releases the file within the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFile {
    name: String,
    path: PathBuf,
}

impl SegmentFile {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn size(&self) -> Result<u64, io::Error> {
        Ok(fs::metadata(&self.path)?.len())
    }

    /// Append `bytes` with a single write on an `O_APPEND` descriptor.
    ///
    /// Does not create the file: appending to a segment that was deleted
    /// underneath us is an error, not a resurrection.
    pub fn append(&self, bytes: &[u8]) -> Result<(), io::Error> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<u8>, io::Error> {
        let mut file = File::open(&self.path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Remove the file. Already missing is not an error.
    pub fn delete(&self) -> Result<(), io::Error> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_append_read_delete() {
        let dir = TempDir::new().unwrap();
        let directory = Directory::open(&dir.path().join("logs")).unwrap();

        let file = directory.create_file("00000000000000000001").unwrap();
        file.append(b"hello ").unwrap();
        file.append(b"world").unwrap();

        assert_eq!(file.size().unwrap(), 11);
        assert_eq!(file.read_all().unwrap(), b"hello world");
        assert!(directory.has_file("00000000000000000001"));

        file.delete().unwrap();
        assert!(!file.exists());
        // Idempotent.
        file.delete().unwrap();
    }

    #[test]
    fn test_link_file_into_another_directory() {
        let dir = TempDir::new().unwrap();
        let pending = Directory::open(&dir.path().join("pending")).unwrap();
        let granted = Directory::open(&dir.path().join("granted")).unwrap();
        let source = pending.create_file("1").unwrap();
        source.append(b"event").unwrap();
        granted.create_file("2").unwrap();

        let linked = granted.link_file(&source, "1").unwrap();
        assert_eq!(linked.read_all().unwrap(), b"event");
        assert!(source.exists());

        let err = granted.link_file(&source, "2").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_create_file_refuses_existing_name() {
        let dir = TempDir::new().unwrap();
        let directory = Directory::open(dir.path()).unwrap();

        directory.create_file("a").unwrap();
        let err = directory.create_file("a").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_append_to_deleted_file_fails() {
        let dir = TempDir::new().unwrap();
        let directory = Directory::open(dir.path()).unwrap();

        let file = directory.create_file("a").unwrap();
        file.delete().unwrap();
        assert!(file.append(b"x").is_err());
        assert!(!file.exists());
    }

    #[test]
    fn test_files_skips_subdirectories() {
        let dir = TempDir::new().unwrap();
        let directory = Directory::open(dir.path()).unwrap();
        directory.create_file("a").unwrap();
        directory.create_file("b").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();

        let mut names: Vec<String> = directory
            .files()
            .unwrap()
            .iter()
            .map(|f| f.name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }
}
