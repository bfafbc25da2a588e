//! Build artifacts: wheel files produced by a build.
//!
//! An [`Artifact`] wraps one wheel on disk. Its identity comes from the
//! filename; the hash, packaged metadata and native dependencies are
//! computed on first request and cached, since the file never changes once
//! the build tool has written it.

pub mod checksum;
pub mod deps;
pub mod metadata;

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use wheelwright_proto::ArtifactSummary;
use zip::ZipArchive;

use crate::error::{Result, WorkerError};
use crate::host::HostSupervisor;

pub use checksum::calculate_checksum;
pub use deps::{Dependencies, DependencyInspector, PackageDatabase};
pub use metadata::WheelMetadata;

/// Legacy spelling of the "none" ABI tag
const LEGACY_NO_ABI: &str = "noabi";

/// A wheel filename split into its tags.
///
/// `{package}-{version}(-{build})?-{python}-{abi}-{platform}.whl`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WheelName {
    fields: Vec<String>,
}

impl WheelName {
    pub fn parse(filename: &str) -> Result<Self> {
        let stem = filename.strip_suffix(".whl").unwrap_or(filename);
        let mut fields: Vec<String> = stem.split('-').map(str::to_string).collect();
        if !(5..=6).contains(&fields.len()) {
            return Err(WorkerError::InvalidFilename(filename.to_string()));
        }
        let abi = fields.len() - 2;
        if fields[abi] == LEGACY_NO_ABI {
            fields[abi] = "none".to_string();
        }
        Ok(Self { fields })
    }

    pub fn package_tag(&self) -> &str {
        &self.fields[0]
    }

    pub fn version_tag(&self) -> &str {
        &self.fields[1]
    }

    /// Optional build number, present only in six-field names
    pub fn build_tag(&self) -> Option<&str> {
        (self.fields.len() == 6).then(|| self.fields[2].as_str())
    }

    pub fn py_version_tag(&self) -> &str {
        &self.fields[self.fields.len() - 3]
    }

    pub fn abi_tag(&self) -> &str {
        &self.fields[self.fields.len() - 2]
    }

    pub fn platform_tag(&self) -> &str {
        &self.fields[self.fields.len() - 1]
    }

    /// Fields re-joined with dashes (normalized ABI spelling included)
    pub fn stem(&self) -> String {
        self.fields.join("-")
    }
}

/// One wheel produced by a build.
#[derive(Debug)]
pub struct Artifact {
    path: PathBuf,
    filename: String,
    filesize: u64,
    name: WheelName,
    filehash: Option<String>,
    metadata: Option<WheelMetadata>,
    dependencies: Option<Dependencies>,
}

impl Artifact {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| WorkerError::InvalidFilename(path.display().to_string()))?
            .to_string();
        let name = WheelName::parse(&filename)?;
        let filesize = std::fs::metadata(&path)?.len();
        Ok(Self {
            path,
            filename,
            filesize,
            name,
            filehash: None,
            metadata: None,
            dependencies: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn filesize(&self) -> u64 {
        self.filesize
    }

    pub fn name(&self) -> &WheelName {
        &self.name
    }

    pub fn package_tag(&self) -> &str {
        self.name.package_tag()
    }

    pub fn version_tag(&self) -> &str {
        self.name.version_tag()
    }

    pub fn build_tag(&self) -> Option<&str> {
        self.name.build_tag()
    }

    pub fn py_version_tag(&self) -> &str {
        self.name.py_version_tag()
    }

    pub fn abi_tag(&self) -> &str {
        self.name.abi_tag()
    }

    pub fn platform_tag(&self) -> &str {
        self.name.platform_tag()
    }

    /// Open the wheel for reading
    pub fn open(&self) -> Result<File> {
        Ok(File::open(&self.path)?)
    }

    /// Lower-case hex SHA-256 of the file
    pub fn filehash(&mut self) -> Result<&str> {
        if self.filehash.is_none() {
            let hash = calculate_checksum(&self.path)?;
            return Ok(self.filehash.insert(hash).as_str());
        }
        Ok(self.filehash.as_deref().unwrap_or_default())
    }

    /// Contents of the wheel's `{package}-{version}.dist-info/METADATA`
    pub fn metadata(&mut self) -> Result<&WheelMetadata> {
        if self.metadata.is_none() {
            let parsed = WheelMetadata::parse(&self.read_metadata()?);
            return Ok(self.metadata.insert(parsed));
        }
        self.metadata
            .as_ref()
            .ok_or_else(|| WorkerError::Consistency("metadata cache emptied".to_string()))
    }

    fn read_metadata(&self) -> Result<String> {
        let archive_err = |reason: String| WorkerError::Archive {
            path: self.path.clone(),
            reason,
        };
        let member = format!(
            "{}-{}.dist-info/METADATA",
            self.package_tag(),
            self.version_tag()
        );
        let mut archive = ZipArchive::new(self.open()?).map_err(|e| archive_err(e.to_string()))?;
        let mut file = archive
            .by_name(&member)
            .map_err(|e| archive_err(format!("{}: {}", member, e)))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Native libraries the wheel links against, by resolution method
    pub fn dependencies(
        &mut self,
        inspector: &DependencyInspector,
        host: &dyn HostSupervisor,
    ) -> Result<&Dependencies> {
        if self.dependencies.is_none() {
            let found = inspector.inspect(&self.path, host)?;
            return Ok(self.dependencies.insert(found));
        }
        self.dependencies
            .as_ref()
            .ok_or_else(|| WorkerError::Consistency("dependency cache emptied".to_string()))
    }

    /// Wire description of this artifact, computing anything not yet cached
    pub fn summary(
        &mut self,
        inspector: &DependencyInspector,
        host: &dyn HostSupervisor,
    ) -> Result<ArtifactSummary> {
        let filehash = self.filehash()?.to_string();
        let dependencies = self.dependencies(inspector, host)?.clone();
        Ok(ArtifactSummary {
            filename: self.filename.clone(),
            filesize: self.filesize,
            filehash,
            package_tag: self.package_tag().to_string(),
            version_tag: self.version_tag().to_string(),
            py_version_tag: self.py_version_tag().to_string(),
            abi_tag: self.abi_tag().to_string(),
            platform_tag: self.platform_tag().to_string(),
            dependencies,
        })
    }
}
