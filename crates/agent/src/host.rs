//! Facts about the host a worker registers from

use buildq_common::WorkerRegistration;
use std::path::Path;
use tracing::debug;

const OS_RELEASE: &str = "/etc/os-release";

/// Platform string in `<os>-<arch>` form, e.g. `linux-64` or `osx-arm64`
pub fn platform() -> String {
    let os = std::env::consts::OS;
    let arch = std::env::consts::ARCH;
    match (os, arch) {
        ("linux", "x86_64") => "linux-64".to_string(),
        ("linux", "x86") => "linux-32".to_string(),
        ("linux", "aarch64") => "linux-aarch64".to_string(),
        ("linux", "powerpc64") => "linux-ppc64le".to_string(),
        ("macos", "x86_64") => "osx-64".to_string(),
        ("macos", "aarch64") => "osx-arm64".to_string(),
        ("windows", "x86_64") => "win-64".to_string(),
        ("windows", "x86") => "win-32".to_string(),
        (os, arch) => format!("{}-{}", os, arch),
    }
}

#[cfg(unix)]
pub fn hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            debug!(error = %e, "gethostname failed");
            "unknown".to_string()
        }
    }
}

#[cfg(not(unix))]
pub fn hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown".to_string())
}

/// Distribution as `ID-VERSION_ID` from os-release, or `unknown`
pub fn dist() -> String {
    read_dist(Path::new(OS_RELEASE)).unwrap_or_else(|| "unknown".to_string())
}

fn read_dist(path: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    parse_os_release(&contents)
}

fn parse_os_release(contents: &str) -> Option<String> {
    let mut id = None;
    let mut version = None;
    for line in contents.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').trim_matches('\'').to_string();
        match key.trim() {
            "ID" => id = Some(value),
            "VERSION_ID" => version = Some(value),
            _ => {}
        }
    }

    match (id, version) {
        (Some(id), Some(version)) => Some(format!("{}-{}", id, version)),
        (Some(id), None) => Some(id),
        _ => None,
    }
}

/// Registration facts for this host, with optional operator overrides
pub fn registration(
    platform_override: Option<String>,
    hostname_override: Option<String>,
    dist_override: Option<String>,
) -> WorkerRegistration {
    WorkerRegistration {
        platform: platform_override.unwrap_or_else(platform),
        hostname: hostname_override.unwrap_or_else(hostname),
        dist: dist_override.unwrap_or_else(dist),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_os_release() {
        let contents = "NAME=\"Ubuntu\"\nID=ubuntu\nVERSION_ID=\"22.04\"\nPRETTY_NAME=\"Ubuntu 22.04\"\n";
        assert_eq!(parse_os_release(contents).as_deref(), Some("ubuntu-22.04"));
        assert_eq!(parse_os_release("ID=arch\n").as_deref(), Some("arch"));
        assert_eq!(parse_os_release("NAME=nothing\n"), None);
    }

    #[test]
    fn test_missing_os_release_is_none() {
        assert_eq!(read_dist(Path::new("/nonexistent/os-release")), None);
    }

    #[test]
    fn test_registration_overrides() {
        let registration = registration(Some("linux-64".into()), Some("builder".into()), None);
        assert_eq!(registration.platform, "linux-64");
        assert_eq!(registration.hostname, "builder");
        assert!(!registration.dist.is_empty());
    }

    #[test]
    fn test_platform_has_os_prefix() {
        let platform = platform();
        assert!(!platform.is_empty());
        assert!(platform.contains('-'));
    }
}
