//! Package installation backends.

use super::manifest::{ResolvedSet, normalize_name};
use async_trait::async_trait;
use botstrap_shared::errors::{BotstrapError, BotstrapResult};
use std::io::Write;
use std::path::Path;
use std::process::Stdio;

/// What to install and where.
#[derive(Debug)]
pub struct InstallRequest<'a> {
    pub packages: &'a ResolvedSet,
    /// Host path of the library directory inside the rootfs.
    pub target: &'a Path,
    /// Host path of the trust bundle rebuilt by the trust stage, if any.
    pub ca_bundle: Option<&'a Path>,
    /// Install exactly the listed set without pulling dependencies.
    pub no_deps: bool,
}

/// Installs a resolved set into a directory.
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    async fn install(&self, request: &InstallRequest<'_>) -> BotstrapResult<()>;

    /// Verify that every installed package has its own requirements met
    /// inside the target. An unmet requirement is a resolution failure.
    async fn check(&self, request: &InstallRequest<'_>) -> BotstrapResult<()>;
}

/// Runs pip on the build host with `--target` pointing into the rootfs.
#[derive(Debug, Clone)]
pub struct PipInstaller {
    /// Command prefix, e.g. `["python3", "-m", "pip"]`.
    command: Vec<String>,
}

impl PipInstaller {
    pub fn new(command: Vec<String>) -> BotstrapResult<Self> {
        if command.is_empty() {
            return Err(BotstrapError::Config("installer command is empty".into()));
        }
        Ok(Self { command })
    }
}

impl Default for PipInstaller {
    fn default() -> Self {
        Self {
            command: vec!["python3".into(), "-m".into(), "pip".into()],
        }
    }
}

#[async_trait]
impl PackageInstaller for PipInstaller {
    async fn install(&self, request: &InstallRequest<'_>) -> BotstrapResult<()> {
        if request.packages.is_empty() {
            tracing::info!("Dependency set is empty, nothing to install");
            return Ok(());
        }

        let mut requirements = tempfile::Builder::new()
            .prefix("botstrap-requirements")
            .suffix(".txt")
            .tempfile()?;
        requirements.write_all(request.packages.to_requirements().as_bytes())?;
        requirements.flush()?;

        let mut cmd = tokio::process::Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .arg("install")
            .arg("--no-cache-dir")
            .arg("--disable-pip-version-check")
            .arg("--no-input")
            .arg("--target")
            .arg(request.target)
            .arg("-r")
            .arg(requirements.path());
        if request.no_deps {
            cmd.arg("--no-deps");
        }
        if request.packages.fully_hashed() {
            cmd.arg("--require-hashes");
        }
        if let Some(bundle) = request.ca_bundle {
            cmd.env("PIP_CERT", bundle)
                .env("SSL_CERT_FILE", bundle)
                .env("REQUESTS_CA_BUNDLE", bundle);
        }
        cmd.env("PIP_NO_CACHE_DIR", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        tracing::info!(
            packages = request.packages.len(),
            target = %request.target.display(),
            "Running package installer"
        );

        let output = cmd.output().await.map_err(|e| {
            BotstrapError::Install(format!("failed to run {}: {}", self.command.join(" "), e))
        })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(20).collect();
        let tail = tail.into_iter().rev().collect::<Vec<_>>().join("\n");
        tracing::error!(status = %output.status, stderr = %tail, "Package installer failed");

        Err(classify_failure(&stderr, &tail))
    }

    async fn check(&self, request: &InstallRequest<'_>) -> BotstrapResult<()> {
        if request.packages.is_empty() {
            return Ok(());
        }

        let mut cmd = tokio::process::Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .arg("check")
            .arg("--disable-pip-version-check")
            .env("PYTHONPATH", request.target)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = cmd.output().await.map_err(|e| {
            BotstrapError::Install(format!("failed to run {} check: {}", self.command.join(" "), e))
        })?;
        if output.status.success() {
            tracing::debug!(target = %request.target.display(), "Installed set is consistent");
            return Ok(());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let unmet = unmet_requirements(&stdout, request.packages);
        if unmet.is_empty() {
            // Only host packages are broken.
            tracing::warn!(status = %output.status, "Consistency check reported problems outside the installed set");
            return Ok(());
        }

        tracing::error!(unmet = unmet.len(), "Installed set has unmet requirements");
        Err(BotstrapError::Resolution(format!(
            "installed set is incomplete: {}",
            unmet.join("; ")
        )))
    }
}

/// Lines of `pip check` output about packages in `set`.
///
/// Each line reads `<name> <version> requires <dep>, which is not installed.`
/// or `<name> <version> has requirement <spec>, but you have <dep> <version>.`
fn unmet_requirements(report: &str, set: &ResolvedSet) -> Vec<String> {
    report
        .lines()
        .map(str::trim)
        .filter(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|name| set.packages.contains_key(&normalize_name(name)))
        })
        .map(str::to_string)
        .collect()
}

/// Map installer output to resolution vs installation failure.
fn classify_failure(stderr: &str, tail: &str) -> BotstrapError {
    const UNRESOLVED: [&str; 3] = [
        "No matching distribution found",
        "Could not find a version that satisfies",
        "ResolutionImpossible",
    ];
    if UNRESOLVED.iter().any(|marker| stderr.contains(marker)) {
        BotstrapError::Resolution(tail.to_string())
    } else {
        BotstrapError::Install(tail.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_failure() {
        let err = classify_failure(
            "ERROR: No matching distribution found for aiohttp==99.0",
            "tail",
        );
        assert!(matches!(err, BotstrapError::Resolution(_)));

        let err = classify_failure("ERROR: THESE PACKAGES DO NOT MATCH THE HASHES", "tail");
        assert!(matches!(err, BotstrapError::Install(_)));
    }

    #[test]
    fn test_unmet_requirements_only_for_installed_set() {
        let set = crate::deps::DependencyManifest::parse("aiohttp==3.9.5\npython-telegram-bot==21.4\n")
            .unwrap()
            .resolve(true)
            .unwrap();
        let report = "aiohttp 3.9.5 requires yarl, which is not installed.\n\
                      python_telegram_bot 21.4 has requirement httpx~=0.27, but you have httpx 0.25.0.\n\
                      ansible 2.9.6 requires jinja2, which is not installed.\n";
        let unmet = unmet_requirements(report, &set);
        assert_eq!(unmet.len(), 2);
        assert!(unmet[0].starts_with("aiohttp"));
        assert!(unmet[1].starts_with("python_telegram_bot"));
    }

    #[tokio::test]
    async fn test_failing_check_with_unrelated_output_passes() {
        let temp = tempfile::TempDir::new().unwrap();
        let set = crate::deps::DependencyManifest::parse("aiohttp==3.9.5\n")
            .unwrap()
            .resolve(true)
            .unwrap();
        // `false check ...` exits 1 with no output.
        let installer = PipInstaller::new(vec!["false".into()]).unwrap();
        installer
            .check(&InstallRequest {
                packages: &set,
                target: temp.path(),
                ca_bundle: None,
                no_deps: true,
            })
            .await
            .unwrap();
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(PipInstaller::new(Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_failing_installer_reports_install_error() {
        let temp = tempfile::TempDir::new().unwrap();
        let set = crate::deps::DependencyManifest::parse("aiohttp==3.9.5\n")
            .unwrap()
            .resolve(true)
            .unwrap();
        let installer = PipInstaller::new(vec!["false".into()]).unwrap();
        let err = installer
            .install(&InstallRequest {
                packages: &set,
                target: temp.path(),
                ca_bundle: Some(&temp.path().join("ca.crt")),
                no_deps: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BotstrapError::Install(_)));
    }
}
