use std::path::{Path, PathBuf};

use envrepair_core::PackageEntry;

use crate::parse::{parse_pip_list, parse_site_packages};
use crate::{CommandOutput, CommandRunner, CommandSpec, GatewayError};

const SITE_PACKAGES_SCRIPT: &str = "import json, site, sysconfig\n\
paths = []\n\
try:\n    paths.extend(site.getsitepackages())\n\
except Exception:\n    pass\n\
purelib = sysconfig.get_paths().get('purelib')\n\
if purelib and purelib not in paths:\n    paths.append(purelib)\n\
print(json.dumps(paths))";

pub const OPENSSL_VERSION_SCRIPT: &str = "import ssl; print(ssl.OPENSSL_VERSION)";

/// Pip and interpreter operations for one environment's Python.
#[derive(Debug, Clone)]
pub struct PipGateway<R> {
    python: PathBuf,
    runner: R,
}

impl<R: CommandRunner> PipGateway<R> {
    pub fn new(python: impl Into<PathBuf>, runner: R) -> Self {
        Self {
            python: python.into(),
            runner,
        }
    }

    pub fn python(&self) -> &Path {
        &self.python
    }

    pub fn site_packages(&self) -> Result<Vec<PathBuf>, GatewayError> {
        let output = self.runner.capture(&build_site_packages_command(&self.python))?;
        if !output.success() {
            tracing::debug!(
                "site-packages query failed for {}: {}",
                self.python.display(),
                output.stderr.trim()
            );
            return Ok(Vec::new());
        }
        Ok(parse_site_packages(&output.stdout))
    }

    /// The interpreter's view of its `ssl` module. The raw output is returned
    /// so a broken OpenSSL shows up as the interpreter's own error.
    pub fn openssl_version(&self) -> Result<CommandOutput, GatewayError> {
        let mut command = python_command(&self.python);
        command.arg("-c").arg(OPENSSL_VERSION_SCRIPT);
        self.runner.capture(&command)
    }

    pub fn list_installed(&self) -> Result<Vec<PackageEntry>, GatewayError> {
        let output = self.runner.capture(&build_pip_list_command(&self.python))?;
        if !output.success() {
            return Ok(Vec::new());
        }
        Ok(parse_pip_list(&output.stdout))
    }

    pub fn freeze(&self, destination: &Path) -> Result<bool, GatewayError> {
        let output = self.runner.capture(&build_pip_command(&self.python, ["freeze"]))?;
        if !output.success() {
            return Ok(false);
        }
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent).map_err(|source| GatewayError::Output {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(destination, &output.stdout).map_err(|source| GatewayError::Output {
            path: destination.to_path_buf(),
            source,
        })?;
        Ok(true)
    }

    pub fn install_requirements(&self, requirements: &Path) -> Result<bool, GatewayError> {
        let mut command = build_pip_command(&self.python, ["install"]);
        command.arg("-r").path_arg(requirements);
        Ok(self.runner.live(&command)? == 0)
    }

    /// An empty name set is a successful no-op.
    pub fn uninstall(&self, names: &[String]) -> Result<bool, GatewayError> {
        if names.is_empty() {
            return Ok(true);
        }
        Ok(self.runner.live(&build_uninstall_command(&self.python, names))? == 0)
    }

    pub fn reinstall(&self, name: &str) -> Result<bool, GatewayError> {
        Ok(self.runner.live(&build_reinstall_command(&self.python, name))? == 0)
    }
}

fn python_command(python: &Path) -> CommandSpec {
    let mut command = CommandSpec::new(python.to_string_lossy());
    command.env("PYTHONNOUSERSITE", "1");
    command
}

pub(crate) fn build_pip_command<'a>(
    python: &Path,
    args: impl IntoIterator<Item = &'a str>,
) -> CommandSpec {
    let mut command = python_command(python);
    command
        .arg("-m")
        .arg("pip")
        .arg("--disable-pip-version-check")
        .args(args);
    command
}

pub(crate) fn build_site_packages_command(python: &Path) -> CommandSpec {
    let mut command = python_command(python);
    command.arg("-c").arg(SITE_PACKAGES_SCRIPT);
    command
}

pub(crate) fn build_pip_list_command(python: &Path) -> CommandSpec {
    build_pip_command(python, ["list", "--format=json"])
}

pub(crate) fn build_uninstall_command(python: &Path, names: &[String]) -> CommandSpec {
    let mut command = build_pip_command(python, ["uninstall", "-y"]);
    command.args(names.iter().cloned());
    command
}

pub(crate) fn build_reinstall_command(python: &Path, name: &str) -> CommandSpec {
    let mut command = build_pip_command(
        python,
        ["install", "--upgrade", "--force-reinstall", "--no-deps"],
    );
    command.arg(name);
    command
}
