//! Identity of the machine the daemon runs on.
//!
//! Populated once at start-up and read-only afterwards. Map entries can refer
//! to these values through `${NAME}` variables, e.g. to pick a server per
//! architecture: `"path": "/export/${ARCH}/tools"`.

use anyhow::{Context, Result};
use nix::sys::utsname::uname;

/// Host identity used for map variable substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    name: String,
    dns_domain: String,
    architecture: String,
    byte_order: String,
    os: String,
    os_version: String,
    os_version_major: i32,
    os_version_minor: i32,
}

impl HostInfo {
    /// Reads the host identity from `uname(2)`.
    pub fn from_system() -> Result<Self> {
        let uts = uname().context("uname failed")?;
        let nodename = uts.nodename().to_string_lossy().into_owned();
        let release = uts.release().to_string_lossy().into_owned();
        Ok(Self::new(
            &nodename,
            &uts.machine().to_string_lossy(),
            &uts.sysname().to_string_lossy(),
            &release,
        ))
    }

    /// Builds a host identity from raw `uname` fields.
    ///
    /// A fully qualified `nodename` is split into host name and DNS domain.
    pub fn new(nodename: &str, architecture: &str, os: &str, os_version: &str) -> Self {
        let (name, dns_domain) = match nodename.split_once('.') {
            Some((host, domain)) => (host.to_string(), domain.to_string()),
            None => (nodename.to_string(), String::new()),
        };
        let (os_version_major, os_version_minor) = parse_version(os_version);
        let byte_order = if cfg!(target_endian = "big") {
            "big"
        } else {
            "little"
        };

        Self {
            name,
            dns_domain,
            architecture: architecture.to_string(),
            byte_order: byte_order.to_string(),
            os: os.to_string(),
            os_version: os_version.to_string(),
            os_version_major,
            os_version_minor,
        }
    }

    /// Short host name, `${HOST}` in maps.
    pub fn host_name(&self) -> &str {
        &self.name
    }

    /// DNS domain, empty when the name is unqualified.
    pub fn host_dns_domain(&self) -> &str {
        &self.dns_domain
    }

    /// Machine architecture, `${ARCH}` in maps.
    pub fn host_architecture(&self) -> &str {
        &self.architecture
    }

    /// `"big"` or `"little"`.
    pub fn host_byte_order(&self) -> &str {
        &self.byte_order
    }

    /// Operating system name, `${OS}` in maps.
    pub fn host_os(&self) -> &str {
        &self.os
    }

    /// Full operating system release, `${OSVERS}` in maps.
    pub fn host_os_version(&self) -> &str {
        &self.os_version
    }

    /// Major release number, 0 when unparsable.
    pub fn host_os_version_major(&self) -> i32 {
        self.os_version_major
    }

    /// Minor release number, 0 when unparsable.
    pub fn host_os_version_minor(&self) -> i32 {
        self.os_version_minor
    }

    /// Substitutes host variables in `text`.
    ///
    /// Unknown variables are left untouched.
    pub fn expand(&self, text: &str) -> String {
        if !text.contains("${") {
            return text.to_string();
        }
        let major = self.os_version_major.to_string();
        let minor = self.os_version_minor.to_string();
        let variables = [
            ("${HOST}", self.name.as_str()),
            ("${DOMAIN}", self.dns_domain.as_str()),
            ("${ARCH}", self.architecture.as_str()),
            ("${ENDIAN}", self.byte_order.as_str()),
            ("${OS}", self.os.as_str()),
            ("${OSVERS}", self.os_version.as_str()),
            ("${OSMAJOR}", major.as_str()),
            ("${OSMINOR}", minor.as_str()),
        ];

        let mut expanded = text.to_string();
        for (variable, value) in variables {
            expanded = expanded.replace(variable, value);
        }
        expanded
    }
}

// "5.15.0-91-generic" -> (5, 15)
fn parse_version(release: &str) -> (i32, i32) {
    let mut numbers = release
        .split(|c: char| !c.is_ascii_digit())
        .filter(|part| !part.is_empty())
        .map(|part| part.parse::<i32>().unwrap_or(0));
    let major = numbers.next().unwrap_or(0);
    let minor = numbers.next().unwrap_or(0);
    (major, minor)
}
