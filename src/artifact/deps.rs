//! Native library dependencies of a wheel.
//!
//! Compiled extension modules inside a wheel link against system shared
//! libraries. To tell the coordinator which system packages a wheel needs,
//! every ELF shared object in the archive is extracted and run through the
//! linker-inspection tool (`ldd`); each resolved library path is then looked
//! up in the dpkg file manifests to find the package that installed it.

use std::cell::OnceCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use regex::Regex;
use zip::ZipArchive;

use crate::error::{Result, WorkerError};
use crate::host::HostSupervisor;
use crate::process;

/// Resolution method -> sorted, de-duplicated providers.
///
/// Libraries owned by a system package are listed under [`APT_KEY`];
/// libraries nobody owns are listed by path under [`UNRESOLVED_KEY`].
pub type Dependencies = BTreeMap<String, Vec<String>>;

pub const APT_KEY: &str = "apt";
pub const UNRESOLVED_KEY: &str = "";

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

static LDD_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(.*)\s=>\s(/.*)\s\(0x[0-9a-fA-F]+\)$").expect("valid ldd regex")
});

/// Whether an archive member name looks like a shared object
pub fn is_shared_object_name(name: &str) -> bool {
    name.ends_with(".so") || name.contains(".so.")
}

/// Installed-file index of the system package manager.
///
/// Loaded from the dpkg `*.list` manifests on first use and kept for the
/// life of the process; installed packages do not change under a running
/// worker.
#[derive(Debug)]
pub struct PackageDatabase {
    info_dir: PathBuf,
    index: OnceCell<Option<HashMap<PathBuf, Vec<String>>>>,
}

impl PackageDatabase {
    pub fn new(info_dir: impl Into<PathBuf>) -> Self {
        Self {
            info_dir: info_dir.into(),
            index: OnceCell::new(),
        }
    }

    /// Whether the manifests could be loaded
    pub fn is_available(&self) -> bool {
        self.index().is_some()
    }

    /// Packages that installed `path` (normally zero or one)
    pub fn owners(&self, path: &Path) -> Vec<String> {
        self.index()
            .and_then(|index| index.get(path))
            .cloned()
            .unwrap_or_default()
    }

    fn index(&self) -> Option<&HashMap<PathBuf, Vec<String>>> {
        self.index
            .get_or_init(|| match load_dpkg_index(&self.info_dir) {
                Ok(index) => {
                    tracing::debug!(
                        dir = %self.info_dir.display(),
                        files = index.len(),
                        "Loaded package database"
                    );
                    Some(index)
                }
                Err(e) => {
                    tracing::warn!(
                        dir = %self.info_dir.display(),
                        error = %e,
                        "Package database unavailable"
                    );
                    None
                }
            })
            .as_ref()
    }
}

fn load_dpkg_index(info_dir: &Path) -> io::Result<HashMap<PathBuf, Vec<String>>> {
    let mut index: HashMap<PathBuf, Vec<String>> = HashMap::new();
    for entry in fs::read_dir(info_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("list") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        // multi-arch manifests are named "package:arch.list"
        let package = stem.split(':').next().unwrap_or(stem).to_string();
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Skipping unreadable manifest");
                continue;
            }
        };
        for line in contents.lines().filter(|l| !l.is_empty()) {
            let owners = index.entry(PathBuf::from(line)).or_default();
            if !owners.contains(&package) {
                owners.push(package.clone());
            }
        }
    }
    Ok(index)
}

/// Runs the dependency scan for artifacts.
#[derive(Debug)]
pub struct DependencyInspector {
    linker_tool: PathBuf,
    timeout: Duration,
    database: PackageDatabase,
}

impl DependencyInspector {
    pub fn new(linker_tool: impl Into<PathBuf>, timeout: Duration, database: PackageDatabase) -> Self {
        Self {
            linker_tool: linker_tool.into(),
            timeout,
            database,
        }
    }

    pub fn database(&self) -> &PackageDatabase {
        &self.database
    }

    /// Map the native libraries used by the wheel at `wheel` to their
    /// providers.
    ///
    /// Yields an empty mapping, with a warning, when the package database or
    /// the linker tool is unavailable.
    pub fn inspect(&self, wheel: &Path, host: &dyn HostSupervisor) -> Result<Dependencies> {
        if !self.database.is_available() {
            tracing::warn!(
                wheel = %wheel.display(),
                "Cannot read package database; unable to calculate apt dependencies"
            );
            return Ok(Dependencies::new());
        }

        let scratch = tempfile::Builder::new()
            .prefix("wheelwright-libs-")
            .tempdir()?;
        let libs = extract_shared_objects(wheel, scratch.path())?;

        let mut found: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for lib in &libs {
            let output = match self.linked_libraries(lib) {
                Ok(output) => output,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::warn!(
                        tool = %self.linker_tool.display(),
                        "Linker inspection tool unavailable; unable to calculate apt dependencies"
                    );
                    return Ok(Dependencies::new());
                }
                Err(e) => return Err(e.into()),
            };

            for line in output.lines() {
                let Some(caps) = LDD_LINE.captures(line) else {
                    continue;
                };
                let Ok(lib_path) = fs::canonicalize(&caps[2]) else {
                    continue;
                };
                let owners = self.database.owners(&lib_path);
                if owners.len() > 1 {
                    return Err(WorkerError::Consistency(format!(
                        "{} is owned by several packages: {}",
                        lib_path.display(),
                        owners.join(", ")
                    )));
                }
                match owners.into_iter().next() {
                    Some(package) => {
                        found.entry(APT_KEY.to_string()).or_default().insert(package);
                    }
                    None => {
                        found
                            .entry(UNRESOLVED_KEY.to_string())
                            .or_default()
                            .insert(lib_path.display().to_string());
                    }
                }
                host.watchdog_ping();
            }
        }

        Ok(found
            .into_iter()
            .map(|(tool, providers)| (tool, providers.into_iter().collect()))
            .collect())
    }

    /// Run the linker tool on `lib` and return its stdout.
    ///
    /// A run exceeding the timeout is killed along with anything it started,
    /// and whatever it printed so far is used.
    fn linked_libraries(&self, lib: &Path) -> io::Result<String> {
        let mut cmd = Command::new(&self.linker_tool);
        cmd.arg(lib)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        // ldd is a script; its children inherit the pipe
        process::isolate_process_group(&mut cmd);
        let mut child = cmd.spawn()?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("linker tool stdout not captured"))?;
        let reader = thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stdout.read_to_end(&mut buf);
            buf
        });

        if process::wait_timeout(&mut child, self.timeout)?.is_none() {
            tracing::warn!(lib = %lib.display(), "Linker inspection timed out; killing");
            process::kill_group(&mut child)?;
        }

        let buf = reader
            .join()
            .map_err(|_| io::Error::other("linker output reader panicked"))?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// Copy every genuine ELF shared object in the wheel into `dest`.
///
/// Members are selected by name, then confirmed by their magic number so
/// misnamed text files are skipped.
pub fn extract_shared_objects(wheel: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
    let archive_err = |reason: String| WorkerError::Archive {
        path: wheel.to_path_buf(),
        reason,
    };

    let mut archive = ZipArchive::new(File::open(wheel)?).map_err(|e| archive_err(e.to_string()))?;
    let mut libs = Vec::new();

    for i in 0..archive.len() {
        let mut member = archive
            .by_index(i)
            .map_err(|e| archive_err(e.to_string()))?;
        if member.is_dir() || !is_shared_object_name(member.name()) {
            continue;
        }
        let Some(relative) = member.enclosed_name() else {
            tracing::warn!(member = member.name(), "Skipping archive member with unsafe path");
            continue;
        };

        let mut magic = [0u8; 4];
        if member.read_exact(&mut magic).is_err() || magic != ELF_MAGIC {
            tracing::debug!(member = member.name(), "Skipping non-ELF shared object name");
            continue;
        }

        let target = dest.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        out.write_all(&magic)?;
        io::copy(&mut member, &mut out)?;
        libs.push(target);
    }

    libs.sort();
    libs.dedup();
    Ok(libs)
}
