//! Package readers.
//!
//! A package is one of three shapes:
//! - a bare `.ovf` descriptor file, with the other members next to it,
//! - a directory holding exactly one `.ovf` descriptor and its members,
//! - a TAR archive (`.ova`, `.tar`, optionally gzip-compressed).
//!
//! Every shape is read through the [`Archive`] trait. Archive member names
//! may be glob patterns (`*.ovf`); the returned [`Member`] always carries the
//! literal name so later lookups by exact name succeed.
//!
//! TAR archives are sequential: each [`Archive::open`] reads the archive
//! forward from its start, and callers should open every member at most once.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::debug;

use crate::error::{Error, Result};

/// An opened package member.
pub struct Member {
    name: String,
    size: u64,
    reader: Box<dyn Read + Send>,
}

impl Member {
    pub fn new(name: impl Into<String>, size: u64, reader: Box<dyn Read + Send>) -> Self {
        Self {
            name: name.into(),
            size,
            reader,
        }
    }

    /// Literal member name, with any glob pattern expanded.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Member size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read the whole member as UTF-8 text.
    pub fn read_to_string(mut self) -> Result<String> {
        let mut text = String::new();
        self.reader.read_to_string(&mut text).map_err(|e| {
            if e.kind() == io::ErrorKind::InvalidData {
                Error::descriptor(format!("{} is not valid UTF-8", self.name))
            } else {
                Error::io(e, &self.name)
            }
        })?;
        Ok(text)
    }
}

impl Read for Member {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Member")
            .field("name", &self.name)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Source of package members.
pub trait Archive: Send {
    /// Open the member `name`, which may be a glob pattern.
    ///
    /// # Errors
    ///
    /// [`Error::MemberNotFound`] if nothing matches; callers probing for
    /// optional members should treat that as a normal outcome.
    fn open(&mut self, name: &str) -> Result<Member>;
}

fn name_matches(pattern: &str, name: &str) -> bool {
    if pattern == name {
        return true;
    }
    glob::Pattern::new(pattern)
        .map(|p| p.matches(name))
        .unwrap_or(false)
}

fn has_glob(name: &str) -> bool {
    name.contains(['*', '?', '['])
}

/// Members stored as plain files relative to a descriptor.
#[derive(Debug, Clone)]
pub struct FileArchive {
    descriptor: PathBuf,
}

impl FileArchive {
    /// Create an archive rooted at the descriptor file `descriptor`.
    pub fn new(descriptor: impl Into<PathBuf>) -> Self {
        Self {
            descriptor: descriptor.into(),
        }
    }

    fn base_dir(&self) -> &Path {
        self.descriptor.parent().unwrap_or_else(|| Path::new(""))
    }

    /// Member name of the descriptor itself.
    pub fn descriptor_name(&self) -> String {
        file_name_of(&self.descriptor)
    }

    /// Path of `name` plus its literal member name.
    fn resolve(&self, name: &str) -> Result<(PathBuf, String)> {
        if !has_glob(name) {
            return Ok((self.base_dir().join(name), name.to_string()));
        }

        // Expand the pattern against the descriptor directory, first match by name.
        let dir = self.base_dir();
        let listing = if dir.as_os_str().is_empty() {
            fs::read_dir(".")
        } else {
            fs::read_dir(dir)
        };
        let mut names: Vec<String> = listing
            .map_err(|e| Error::io(e, dir))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();

        names
            .into_iter()
            .find(|n| name_matches(name, n))
            .map(|n| (dir.join(&n), n))
            .ok_or_else(|| Error::member_not_found(name))
    }
}

impl Archive for FileArchive {
    fn open(&mut self, name: &str) -> Result<Member> {
        let (path, literal) = self.resolve(name)?;
        let file = File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::member_not_found(name),
            _ => Error::io(e, &path),
        })?;
        let size = file.metadata().map_err(|e| Error::io(e, &path))?.len();

        debug!(member = %literal, size, "opened package file");
        Ok(Member::new(literal, size, Box::new(BufReader::new(file))))
    }
}

/// Members stored in a TAR archive, optionally gzip-compressed.
#[derive(Debug, Clone)]
pub struct TapeArchive {
    path: PathBuf,
    gzip: bool,
}

struct Located {
    name: String,
    offset: u64,
    size: u64,
}

impl TapeArchive {
    /// Create a reader for the archive at `path`. Names ending in `.gz` or
    /// `.tgz` are decompressed while reading.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lower = path.to_string_lossy().to_ascii_lowercase();
        let gzip = lower.ends_with(".gz") || lower.ends_with(".tgz");
        Self { path, gzip }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_file(&self) -> Result<File> {
        File::open(&self.path).map_err(|e| Error::io(e, &self.path))
    }

    fn locate(&self, pattern: &str) -> Result<Located> {
        let file = self.open_file()?;
        if self.gzip {
            let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
            let entries = archive.entries().map_err(|e| Error::io(e, &self.path))?;
            find_entry(entries, pattern, &self.path)
        } else {
            let mut archive = tar::Archive::new(file);
            let entries = archive
                .entries_with_seek()
                .map_err(|e| Error::io(e, &self.path))?;
            find_entry(entries, pattern, &self.path)
        }
    }
}

fn find_entry<R: Read>(entries: tar::Entries<'_, R>, pattern: &str, archive: &Path) -> Result<Located> {
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(e, archive))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path().map_err(|e| Error::io(e, archive))?;
        let raw = path.to_string_lossy();
        let name = raw.trim_start_matches("./");

        if name_matches(pattern, name) {
            return Ok(Located {
                name: name.to_string(),
                offset: entry.raw_file_position(),
                size: entry.size(),
            });
        }
    }
    Err(Error::member_not_found(pattern))
}

impl Archive for TapeArchive {
    fn open(&mut self, name: &str) -> Result<Member> {
        let located = self.locate(name)?;
        let file = self.open_file()?;

        let reader: Box<dyn Read + Send> = if self.gzip {
            let mut stream = GzDecoder::new(BufReader::new(file));
            io::copy(&mut (&mut stream).take(located.offset), &mut io::sink())
                .map_err(|e| Error::io(e, &self.path))?;
            Box::new(stream.take(located.size))
        } else {
            let mut file = file;
            file.seek(SeekFrom::Start(located.offset))
                .map_err(|e| Error::io(e, &self.path))?;
            Box::new(BufReader::new(file).take(located.size))
        };

        debug!(member = %located.name, pattern = name, size = located.size, "opened archive entry");
        Ok(Member::new(located.name, located.size, reader))
    }
}

/// An opened package plus the name its descriptor is reachable under.
pub struct Package {
    archive: Box<dyn Archive>,
    descriptor: String,
    source: PathBuf,
}

impl fmt::Debug for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Package")
            .field("source", &self.source)
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// The descriptor text together with its literal member name.
#[derive(Debug, Clone)]
pub struct DescriptorFile {
    pub name: String,
    pub text: String,
}

impl Package {
    /// Open a package from a descriptor file, a directory, or an archive.
    pub fn open(path: &Path) -> Result<Self> {
        let metadata = fs::metadata(path).map_err(|e| Error::io(e, path))?;

        if metadata.is_dir() {
            let archive = FileArchive::new(find_descriptor_in(path)?);
            return Ok(Self {
                descriptor: archive.descriptor_name(),
                archive: Box::new(archive),
                source: path.to_path_buf(),
            });
        }

        if is_tape_archive(path) {
            return Ok(Self {
                archive: Box::new(TapeArchive::new(path)),
                descriptor: "*.ovf".to_string(),
                source: path.to_path_buf(),
            });
        }

        let archive = FileArchive::new(path);
        Ok(Self {
            descriptor: archive.descriptor_name(),
            archive: Box::new(archive),
            source: path.to_path_buf(),
        })
    }

    /// Wrap an existing archive whose descriptor is reachable as `descriptor`.
    pub fn from_archive(archive: Box<dyn Archive>, descriptor: impl Into<String>) -> Self {
        let descriptor = descriptor.into();
        Self {
            archive,
            source: PathBuf::from(&descriptor),
            descriptor,
        }
    }

    /// Name or pattern of the descriptor member.
    pub fn descriptor_name(&self) -> &str {
        &self.descriptor
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn archive(&mut self) -> &mut dyn Archive {
        self.archive.as_mut()
    }

    /// Read the descriptor, expanding its name to the literal member name.
    pub fn read_descriptor(&mut self) -> Result<DescriptorFile> {
        let member = self.archive.open(&self.descriptor)?;
        let name = member.name().to_string();
        let text = member.read_to_string()?;
        self.descriptor = name.clone();
        Ok(DescriptorFile { name, text })
    }
}

/// Manifest member name for a descriptor: same stem, `.mf` extension.
pub fn manifest_name(descriptor: &str) -> String {
    Path::new(descriptor)
        .with_extension("mf")
        .to_string_lossy()
        .into_owned()
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

fn is_tape_archive(path: &Path) -> bool {
    let lower = path.to_string_lossy().to_ascii_lowercase();
    [".ova", ".tar", ".ova.gz", ".tar.gz", ".tgz"]
        .iter()
        .any(|ext| lower.ends_with(ext))
}

fn find_descriptor_in(dir: &Path) -> Result<PathBuf> {
    let mut found: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| Error::io(e, dir))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| {
            p.extension()
                .map(|ext| ext.eq_ignore_ascii_case("ovf"))
                .unwrap_or(false)
        })
        .collect();
    found.sort();

    match found.len() {
        0 => Err(Error::member_not_found(format!("{}/*.ovf", dir.display()))),
        1 => Ok(found.remove(0)),
        n => Err(Error::descriptor(format!(
            "{} contains {n} descriptors; specify one .ovf file",
            dir.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_name() {
        assert_eq!(manifest_name("appliance.ovf"), "appliance.mf");
        assert_eq!(manifest_name("/tmp/pkg/appliance.ovf"), "/tmp/pkg/appliance.mf");
    }

    #[test]
    fn test_name_matches() {
        assert!(name_matches("*.ovf", "appliance.ovf"));
        assert!(name_matches("disk.vmdk", "disk.vmdk"));
        assert!(!name_matches("*.ovf", "appliance.mf"));
        assert!(name_matches("[bad", "[bad"));
    }

    #[test]
    fn test_is_tape_archive() {
        assert!(is_tape_archive(Path::new("a.ova")));
        assert!(is_tape_archive(Path::new("a.OVA")));
        assert!(is_tape_archive(Path::new("a.ova.gz")));
        assert!(!is_tape_archive(Path::new("a.ovf")));
    }

    #[test]
    fn test_tape_archive_gzip_detection() {
        assert!(TapeArchive::new("x.ova.gz").gzip);
        assert!(!TapeArchive::new("x.ova").gzip);
    }

    #[test]
    fn test_file_archive_names_are_relative() {
        let archive = FileArchive::new("pkg/appliance.ovf");
        assert_eq!(archive.descriptor_name(), "appliance.ovf");
        let (path, literal) = archive.resolve("appliance.mf").unwrap();
        assert_eq!(path, Path::new("pkg/appliance.mf"));
        assert_eq!(literal, "appliance.mf");
    }
}
