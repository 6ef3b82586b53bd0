//! Discovery of the .NET pieces the REPL drives.
//!
//! The compiler is the SDK's own `csc.dll` and programs run on the newest
//! installed `Microsoft.NETCore.App` shared framework. Everything here runs
//! once, when a [`CsharpCompiler`](super::CsharpCompiler) is constructed, so
//! that individual compilations never touch the filesystem to find references.

use std::cmp::Ordering;
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::error::Error;

/// Assemblies every compilation references.
///
/// Names missing from the chosen reference directory are skipped; the
/// targeting pack only has façades for some of them, the shared framework
/// only has implementations for others.
pub const BASE_REFERENCES: &[&str] = &[
    "System.Runtime",
    "System.Private.CoreLib",
    "System.Console",
    "System.Collections",
    "System.Linq",
    "System.Memory",
    "System.Runtime.Extensions",
    "System.Text.RegularExpressions",
    "System.Threading",
    "System.Threading.Tasks",
];

/// Shared framework every program runs on.
pub const NETCORE_APP: &str = "Microsoft.NETCore.App";

/// Targeting pack holding reference assemblies for [`NETCORE_APP`].
const REF_PACK: &str = "Microsoft.NETCore.App.Ref";

/// Environment applied to every `dotnet` invocation.
pub(crate) const QUIET_ENV: &[(&str, &str)] = &[
    ("DOTNET_CLI_TELEMETRY_OPTOUT", "1"),
    ("DOTNET_NOLOGO", "1"),
    ("DOTNET_SKIP_FIRST_TIME_EXPERIENCE", "1"),
];

/// How to find the toolchain.
#[derive(Debug, Clone, Default)]
pub struct ToolchainConfig {
    /// Explicit path to the `dotnet` host. Falls back to `$DOTNET_ROOT` and `PATH`.
    pub dotnet: Option<PathBuf>,
    /// Pin an SDK version (as printed by `dotnet --list-sdks`).
    pub sdk_version: Option<String>,
}

/// A resolved .NET toolchain.
#[derive(Debug, Clone)]
pub struct Toolchain {
    dotnet: PathBuf,
    sdk_version: DotnetVersion,
    compiler: PathBuf,
    runtime_version: DotnetVersion,
    references: Vec<PathBuf>,
}

impl Toolchain {
    /// Locate the host, newest SDK compiler, newest runtime and its references.
    ///
    /// # Errors
    ///
    /// Returns an error if no `dotnet` host exists, if it lists no SDK or no
    /// `Microsoft.NETCore.App` runtime, or if none of the base references can
    /// be found.
    pub async fn discover(config: &ToolchainConfig) -> Result<Self, Error> {
        let dotnet = locate_host(config)?;
        tracing::debug!(dotnet = %dotnet.display(), "Using dotnet host");

        let sdks = parse_listing(&list(&dotnet, "--list-sdks").await?, None);
        let (sdk_version, sdk_dir) = match &config.sdk_version {
            Some(pinned) => sdks
                .into_iter()
                .find(|(version, _)| version.as_str() == pinned)
                .ok_or_else(|| Error::ToolchainIncomplete(format!("SDK {pinned} is not installed")))?,
            None => sdks
                .into_iter()
                .max_by(|a, b| a.0.cmp(&b.0))
                .ok_or_else(|| Error::ToolchainIncomplete("no .NET SDK installed".to_string()))?,
        };

        let compiler = sdk_dir
            .join(sdk_version.as_str())
            .join("Roslyn")
            .join("bincore")
            .join("csc.dll");
        if !compiler.is_file() {
            return Err(Error::MissingFile(compiler));
        }

        let runtimes = parse_listing(&list(&dotnet, "--list-runtimes").await?, Some(NETCORE_APP));
        let (runtime_version, runtime_dir) = runtimes
            .into_iter()
            .max_by(|a, b| a.0.cmp(&b.0))
            .ok_or_else(|| Error::ToolchainIncomplete(format!("no {NETCORE_APP} runtime installed")))?;
        let framework_dir = runtime_dir.join(runtime_version.as_str());

        // sdk_dir is `<root>/sdk`, packs live in `<root>/packs`.
        let reference_dir = sdk_dir
            .parent()
            .and_then(|root| find_reference_dir(root, &runtime_version))
            .unwrap_or(framework_dir);
        let references = resolve_references(&reference_dir);
        if references.is_empty() {
            return Err(Error::ToolchainIncomplete(format!(
                "no base references found in {}",
                reference_dir.display()
            )));
        }

        tracing::info!(
            sdk = %sdk_version,
            runtime = %runtime_version,
            references = references.len(),
            reference_dir = %reference_dir.display(),
            "Resolved .NET toolchain"
        );

        Ok(Self {
            dotnet,
            sdk_version,
            compiler,
            runtime_version,
            references,
        })
    }

    /// Path to the `dotnet` host.
    #[must_use]
    pub fn dotnet(&self) -> &Path {
        &self.dotnet
    }

    /// Path to `csc.dll`.
    #[must_use]
    pub fn compiler(&self) -> &Path {
        &self.compiler
    }

    /// SDK the compiler comes from.
    #[must_use]
    pub fn sdk_version(&self) -> &DotnetVersion {
        &self.sdk_version
    }

    /// Runtime programs execute on.
    #[must_use]
    pub fn runtime_version(&self) -> &DotnetVersion {
        &self.runtime_version
    }

    /// Reference assemblies passed to every compilation.
    #[must_use]
    pub fn references(&self) -> &[PathBuf] {
        &self.references
    }

    /// Target framework moniker, e.g. `net8.0`.
    #[must_use]
    pub fn target_framework(&self) -> String {
        format!(
            "net{}.{}",
            self.runtime_version.major(),
            self.runtime_version.minor()
        )
    }

    /// Contents of the `<name>.runtimeconfig.json` that lets `dotnet exec`
    /// host a compiled image.
    #[must_use]
    pub fn runtime_config(&self) -> serde_json::Value {
        serde_json::json!({
            "runtimeOptions": {
                "tfm": self.target_framework(),
                "framework": {
                    "name": NETCORE_APP,
                    "version": self.runtime_version.as_str(),
                },
                "configProperties": {
                    "System.Globalization.Invariant": true,
                    "System.GC.Concurrent": false,
                },
            }
        })
    }
}

/// Name of the host executable, without any platform suffix.
const HOST: &str = "dotnet";

fn locate_host(config: &ToolchainConfig) -> Result<PathBuf, Error> {
    if let Some(path) = &config.dotnet {
        return if path.is_file() {
            Ok(path.clone())
        } else {
            Err(Error::MissingFile(path.clone()))
        };
    }

    if let Some(root) = std::env::var_os("DOTNET_ROOT")
        && let Some(host) = host_in(&root)
    {
        return Ok(host);
    }

    which::which(HOST).map_err(|e| {
        Error::ToolchainNotFound(format!(
            "{e}: set DOTNET_ROOT, put dotnet on PATH, or configure the host path"
        ))
    })
}

/// First executable `dotnet` in a `PATH`-style list of directories.
fn host_in(dirs: &OsStr) -> Option<PathBuf> {
    which::which_in(HOST, Some(dirs), Path::new(".")).ok()
}

async fn list(dotnet: &Path, flag: &str) -> Result<String, Error> {
    let output = Command::new(dotnet)
        .arg(flag)
        .envs(QUIET_ENV.iter().copied())
        .stdin(Stdio::null())
        .output()
        .await?;

    if !output.status.success() {
        return Err(Error::ToolchainIncomplete(format!(
            "`dotnet {flag}` failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse `dotnet --list-sdks` / `--list-runtimes` output.
///
/// SDK lines look like `8.0.404 [/usr/lib/dotnet/sdk]`, runtime lines like
/// `Microsoft.NETCore.App 8.0.11 [/usr/lib/dotnet/shared/Microsoft.NETCore.App]`.
/// With `name` set, only runtime lines for that framework are returned.
fn parse_listing(text: &str, name: Option<&str>) -> Vec<(DotnetVersion, PathBuf)> {
    text.lines()
        .filter_map(|line| {
            let (head, dir) = line.trim().split_once(" [")?;
            let dir = PathBuf::from(dir.trim_end_matches(']'));
            let mut words = head.split_whitespace();
            let version = match name {
                Some(wanted) => {
                    if words.next()? != wanted {
                        return None;
                    }
                    words.next()?
                }
                None => words.next()?,
            };
            Some((DotnetVersion::parse(version)?, dir))
        })
        .collect()
}

fn find_reference_dir(root: &Path, runtime: &DotnetVersion) -> Option<PathBuf> {
    let pack_root = root.join("packs").join(REF_PACK);
    let entries = std::fs::read_dir(&pack_root).ok()?;

    let tfm = format!("net{}.{}", runtime.major(), runtime.minor());
    entries
        .filter_map(|entry| {
            let name = entry.ok()?.file_name().into_string().ok()?;
            let version = DotnetVersion::parse(&name)?;
            (version.major() == runtime.major() && version.minor() == runtime.minor())
                .then_some(version)
        })
        .max()
        .map(|version| pack_root.join(version.as_str()).join("ref").join(&tfm))
        .filter(|dir| dir.is_dir())
}

fn resolve_references(dir: &Path) -> Vec<PathBuf> {
    BASE_REFERENCES
        .iter()
        .map(|name| dir.join(format!("{name}.dll")))
        .filter(|path| path.is_file())
        .collect()
}

/// A .NET version string such as `8.0.404` or `9.0.0-rc.2.24473.5`.
///
/// Ordering compares numeric components; a prerelease sorts below its release.
#[derive(Debug, Clone)]
pub struct DotnetVersion {
    raw: String,
    numbers: Vec<u64>,
    prerelease: Option<String>,
}

impl DotnetVersion {
    /// Parse a version string. Returns `None` if it doesn't start with a number.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (release, prerelease) = match raw.split_once('-') {
            Some((release, pre)) => (release, Some(pre.to_string())),
            None => (raw, None),
        };
        let numbers = release
            .split('.')
            .map(str::parse)
            .collect::<Result<Vec<u64>, _>>()
            .ok()?;
        if numbers.is_empty() {
            return None;
        }
        Some(Self {
            raw: raw.to_string(),
            numbers,
            prerelease,
        })
    }

    /// The version as originally written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Major component.
    #[must_use]
    pub fn major(&self) -> u64 {
        self.numbers.first().copied().unwrap_or(0)
    }

    /// Minor component (0 when absent).
    #[must_use]
    pub fn minor(&self) -> u64 {
        self.numbers.get(1).copied().unwrap_or(0)
    }
}

impl fmt::Display for DotnetVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Ord for DotnetVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.numbers.len().max(other.numbers.len());
        for i in 0..len {
            let a = self.numbers.get(i).copied().unwrap_or(0);
            let b = other.numbers.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }
        match (&self.prerelease, &other.prerelease) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for DotnetVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for DotnetVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DotnetVersion {}

#[cfg(test)]
impl Toolchain {
    /// A toolchain whose host path is never checked.
    pub(crate) fn unresolved(dotnet: impl Into<PathBuf>) -> Self {
        let version = DotnetVersion::parse("8.0.0").unwrap_or_else(|| unreachable!());
        Self {
            dotnet: dotnet.into(),
            sdk_version: version.clone(),
            compiler: PathBuf::from("csc.dll"),
            runtime_version: version,
            references: Vec::new(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn v(s: &str) -> DotnetVersion {
        DotnetVersion::parse(s).expect("valid version")
    }

    #[test]
    fn version_ordering_is_numeric() {
        assert!(v("8.0.404") > v("8.0.100"));
        assert!(v("10.0.100") > v("9.0.300"));
        assert!(v("8.0.11") > v("8.0.9"));
        assert_eq!(v("8.0"), v("8.0.0"));
    }

    #[test]
    fn prerelease_sorts_below_release() {
        assert!(v("9.0.0-rc.2.24473.5") < v("9.0.0"));
        assert!(v("9.0.0-rc.2") > v("8.0.404"));
    }

    #[test]
    fn version_rejects_garbage() {
        assert!(DotnetVersion::parse("").is_none());
        assert!(DotnetVersion::parse("latest").is_none());
        assert!(DotnetVersion::parse("8.x").is_none());
    }

    #[test]
    fn parses_sdk_listing() {
        let text = "6.0.428 [/usr/share/dotnet/sdk]\n8.0.404 [/usr/share/dotnet/sdk]\n";
        let sdks = parse_listing(text, None);
        assert_eq!(sdks.len(), 2);
        assert_eq!(sdks[1].0.as_str(), "8.0.404");
        assert_eq!(sdks[1].1, PathBuf::from("/usr/share/dotnet/sdk"));
    }

    #[test]
    fn parses_runtime_listing_for_one_framework() {
        let text = "\
Microsoft.AspNetCore.App 8.0.11 [/usr/share/dotnet/shared/Microsoft.AspNetCore.App]
Microsoft.NETCore.App 6.0.36 [/usr/share/dotnet/shared/Microsoft.NETCore.App]
Microsoft.NETCore.App 8.0.11 [/usr/share/dotnet/shared/Microsoft.NETCore.App]
";
        let runtimes = parse_listing(text, Some(NETCORE_APP));
        assert_eq!(runtimes.len(), 2);
        let newest = runtimes.into_iter().max_by(|a, b| a.0.cmp(&b.0)).unwrap();
        assert_eq!(newest.0.as_str(), "8.0.11");
    }

    #[test]
    fn listing_skips_noise() {
        let text = "\nwarning: something odd\n8.0.404 [/sdk]\n";
        assert_eq!(parse_listing(text, None).len(), 1);
    }

    #[test]
    fn explicit_missing_host_is_an_error() {
        let config = ToolchainConfig {
            dotnet: Some(PathBuf::from("/definitely/not/here/dotnet")),
            sdk_version: None,
        };
        assert!(matches!(locate_host(&config), Err(Error::MissingFile(_))));
    }

    #[cfg(unix)]
    #[test]
    fn host_search_skips_non_executables() {
        use std::os::unix::fs::PermissionsExt;

        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        std::fs::write(first.path().join(HOST), b"not a program").unwrap();
        let real = second.path().join(HOST);
        std::fs::write(&real, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&real, std::fs::Permissions::from_mode(0o755)).unwrap();

        let dirs = std::env::join_paths([first.path(), second.path()]).unwrap();
        assert_eq!(host_in(&dirs), Some(real));

        let only_first = std::env::join_paths([first.path()]).unwrap();
        assert_eq!(host_in(&only_first), None);
    }

    #[test]
    fn reference_dir_prefers_matching_targeting_pack() {
        let root = tempfile::tempdir().unwrap();
        for version in ["8.0.8", "8.0.11", "9.0.0"] {
            let dir = root
                .path()
                .join("packs")
                .join(REF_PACK)
                .join(version)
                .join("ref");
            let tfm = if version.starts_with('9') { "net9.0" } else { "net8.0" };
            std::fs::create_dir_all(dir.join(tfm)).unwrap();
        }

        let found = find_reference_dir(root.path(), &v("8.0.12")).unwrap();
        assert!(found.ends_with("8.0.11/ref/net8.0"));
    }

    #[test]
    fn resolves_only_existing_references() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("System.Runtime.dll"), b"").unwrap();
        std::fs::write(dir.path().join("System.Console.dll"), b"").unwrap();

        let refs = resolve_references(dir.path());
        assert_eq!(refs.len(), 2);
        assert!(refs[0].ends_with("System.Runtime.dll"));
    }
}
