//! Build-target tags advertised to the coordinator.
//!
//! The coordinator only hands out builds the worker's interpreter can
//! produce, so the worker announces the interpreter version, ABI and
//! platform tags it builds for. They are taken from configuration when set,
//! otherwise asked of the Python interpreter itself.

use std::path::Path;
use std::process::{Command, Stdio};

use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};

/// Prints the version, ABI and platform tags, one per line
const PROBE_SCRIPT: &str = r#"
import sys, sysconfig
ver = '%d%d' % sys.version_info[:2]
abi = sysconfig.get_config_var('SOABI')
if abi and abi.startswith('cpython-'):
    abi = 'cp' + abi.split('-')[1]
else:
    abi = 'cp' + ver + getattr(sys, 'abiflags', '')
print(ver)
print(abi)
print(sysconfig.get_platform().replace('-', '_').replace('.', '_'))
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTarget {
    /// Interpreter version, e.g. "34"
    pub impl_tag: String,
    /// e.g. "cp34m"
    pub abi_tag: String,
    /// e.g. "linux_armv7l"
    pub platform_tag: String,
}

impl BuildTarget {
    /// Tags from configuration, probing the interpreter for any left unset
    pub fn resolve(config: &WorkerConfig) -> Result<Self> {
        if let (Some(impl_tag), Some(abi_tag), Some(platform_tag)) =
            (&config.impl_tag, &config.abi_tag, &config.platform_tag)
        {
            return Ok(Self {
                impl_tag: impl_tag.clone(),
                abi_tag: abi_tag.clone(),
                platform_tag: platform_tag.clone(),
            });
        }

        let probed = Self::probe(&config.python)?;
        Ok(Self {
            impl_tag: config.impl_tag.clone().unwrap_or(probed.impl_tag),
            abi_tag: config.abi_tag.clone().unwrap_or(probed.abi_tag),
            platform_tag: config.platform_tag.clone().unwrap_or(probed.platform_tag),
        })
    }

    /// Ask `python` for its tags
    pub fn probe(python: &Path) -> Result<Self> {
        let output = Command::new(python)
            .arg("-c")
            .arg(PROBE_SCRIPT)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .map_err(|e| WorkerError::Target(format!("{}: {}", python.display(), e)))?;
        if !output.status.success() {
            return Err(WorkerError::Target(format!(
                "{} exited with {}",
                python.display(),
                output.status
            )));
        }
        parse_probe_output(&String::from_utf8_lossy(&output.stdout))
    }
}

fn parse_probe_output(text: &str) -> Result<BuildTarget> {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    match (lines.next(), lines.next(), lines.next()) {
        (Some(impl_tag), Some(abi_tag), Some(platform_tag)) => Ok(BuildTarget {
            impl_tag: impl_tag.to_string(),
            abi_tag: abi_tag.to_string(),
            platform_tag: platform_tag.to_string(),
        }),
        _ => Err(WorkerError::Target(format!(
            "unexpected interpreter output {:?}",
            text
        ))),
    }
}
